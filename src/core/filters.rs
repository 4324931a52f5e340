//! Spatial kernels shared by the calibration steps.
//!
//! Pixels outside the frame take the value of the nearest edge pixel.

use crate::core::parallel::{fill_rows, map_pixels, TileConfig};
use crate::core::stats::{self, median_in_place};
use crate::types::FrameImage;
use ndarray::Array2;

/// Edge-replicating pixel access
#[inline]
pub fn replicate(image: &FrameImage, i: isize, j: isize) -> f32 {
    let (height, width) = image.dim();
    let ii = i.clamp(0, height as isize - 1) as usize;
    let jj = j.clamp(0, width as isize - 1) as usize;
    image[[ii, jj]]
}

/// Positive part of the 4-connected Laplacian, `max(0, 4I - N - S - E - W)`
pub fn laplacian_positive(image: &FrameImage, tiles: TileConfig) -> FrameImage {
    let (height, width) = image.dim();
    map_pixels(height, width, tiles, |i, j| {
        let (i, j) = (i as isize, j as isize);
        let c = replicate(image, i, j);
        let l = 4.0 * c
            - replicate(image, i - 1, j)
            - replicate(image, i + 1, j)
            - replicate(image, i, j - 1)
            - replicate(image, i, j + 1);
        l.max(0.0)
    })
}

/// Square median filter of odd `size`
pub fn median_filter(image: &FrameImage, size: usize, tiles: TileConfig) -> FrameImage {
    let (height, width) = image.dim();
    let half = (size / 2) as isize;
    fill_rows(height, width, tiles, |i, mut row| {
        let mut window = Vec::with_capacity(size * size);
        for (j, out) in row.iter_mut().enumerate() {
            window.clear();
            for di in -half..=half {
                for dj in -half..=half {
                    window.push(replicate(image, i as isize + di, j as isize + dj));
                }
            }
            *out = median_in_place(&mut window).unwrap_or(image[[i, j]]);
        }
    })
}

/// 3x3 mean with double precision accumulation
pub fn box_mean3(image: &FrameImage, tiles: TileConfig) -> FrameImage {
    let (height, width) = image.dim();
    map_pixels(height, width, tiles, |i, j| {
        let mut sum = 0.0f64;
        for di in -1..=1 {
            for dj in -1..=1 {
                sum += replicate(image, i as isize + di, j as isize + dj) as f64;
            }
        }
        (sum / 9.0) as f32
    })
}

/// Lower median of the eight neighbours of `(i, j)`
pub fn neighbor_median8(image: &FrameImage, i: usize, j: usize) -> f32 {
    let mut ring = [0.0f32; 8];
    let mut n = 0;
    for di in -1isize..=1 {
        for dj in -1isize..=1 {
            if di == 0 && dj == 0 {
                continue;
            }
            ring[n] = replicate(image, i as isize + di, j as isize + dj);
            n += 1;
        }
    }
    median_in_place(&mut ring).unwrap_or(image[[i, j]])
}

/// Sobel gradient magnitude
pub fn sobel_magnitude(image: &FrameImage, tiles: TileConfig) -> FrameImage {
    let (height, width) = image.dim();
    map_pixels(height, width, tiles, |i, j| {
        let p = |di: isize, dj: isize| replicate(image, i as isize + di, j as isize + dj) as f64;
        let gx = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
        let gy = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
        (gx * gx + gy * gy).sqrt() as f32
    })
}

/// Replace NaN/Inf samples by the median of finite 3x3 neighbours, else the
/// global finite median. Returns the repaired image and the repair count.
pub fn repair_non_finite(image: FrameImage, tiles: TileConfig) -> (FrameImage, usize) {
    let bad = image.iter().filter(|v| !v.is_finite()).count();
    if bad == 0 {
        return (image, 0);
    }

    let global = stats::median(&stats::finite_values(&image)).unwrap_or(0.0);
    let (height, width) = image.dim();
    let repaired = map_pixels(height, width, tiles, |i, j| {
        let v = image[[i, j]];
        if v.is_finite() {
            return v;
        }
        let mut local = Vec::with_capacity(8);
        for di in -1isize..=1 {
            for dj in -1isize..=1 {
                let ii = i as isize + di;
                let jj = j as isize + dj;
                if ii < 0 || jj < 0 || ii >= height as isize || jj >= width as isize {
                    continue;
                }
                let n = image[[ii as usize, jj as usize]];
                if n.is_finite() {
                    local.push(n);
                }
            }
        }
        median_in_place(&mut local).unwrap_or(global)
    });

    log::warn!("Replaced {} non-finite pixels with local background", bad);
    (repaired, bad)
}

/// Binary dilation with a square structuring element of the given radius
pub fn dilate(mask: &Array2<bool>, radius: usize, tiles: TileConfig) -> Array2<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let (height, width) = mask.dim();
    let r = radius as isize;
    map_pixels(height, width, tiles, |i, j| {
        for di in -r..=r {
            for dj in -r..=r {
                let ii = i as isize + di;
                let jj = j as isize + dj;
                if ii >= 0
                    && jj >= 0
                    && ii < height as isize
                    && jj < width as isize
                    && mask[[ii as usize, jj as usize]]
                {
                    return true;
                }
            }
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiles() -> TileConfig {
        TileConfig::new(3)
    }

    #[test]
    fn test_laplacian_flat_is_zero() {
        let image = Array2::from_elem((5, 5), 10.0f32);
        let l = laplacian_positive(&image, tiles());
        assert!(l.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_laplacian_spike() {
        let mut image = Array2::from_elem((5, 5), 10.0f32);
        image[[2, 2]] = 110.0;
        let l = laplacian_positive(&image, tiles());
        assert_eq!(l[[2, 2]], 400.0);
        // Neighbours see a negative Laplacian, clipped to zero
        assert_eq!(l[[2, 3]], 0.0);
    }

    #[test]
    fn test_median_filter_removes_single_spike() {
        let mut image = Array2::from_elem((7, 7), 1.0f32);
        image[[3, 3]] = 1000.0;
        let m = median_filter(&image, 3, tiles());
        assert_eq!(m[[3, 3]], 1.0);
    }

    #[test]
    fn test_single_pixel_image_replicates() {
        let image = Array2::from_elem((1, 1), 4.0f32);
        assert_eq!(median_filter(&image, 5, tiles())[[0, 0]], 4.0);
        assert_eq!(box_mean3(&image, tiles())[[0, 0]], 4.0);
        assert_eq!(laplacian_positive(&image, tiles())[[0, 0]], 0.0);
        assert_eq!(neighbor_median8(&image, 0, 0), 4.0);
    }

    #[test]
    fn test_repair_non_finite() {
        let mut image = Array2::from_elem((3, 3), 5.0f32);
        image[[1, 1]] = f32::NAN;
        image[[0, 0]] = f32::INFINITY;
        let (fixed, count) = repair_non_finite(image, tiles());
        assert_eq!(count, 2);
        assert!(fixed.iter().all(|v| v.is_finite()));
        assert_eq!(fixed[[1, 1]], 5.0);
    }

    #[test]
    fn test_dilate() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask[[2, 2]] = true;
        let grown = dilate(&mask, 1, tiles());
        assert_eq!(grown.iter().filter(|&&m| m).count(), 9);
    }
}
