//! Image quality metrics computed on a calibrated frame.

use crate::core::filters;
use crate::core::parallel::TileConfig;
use crate::core::stats;
use crate::types::{CalResult, FrameImage, QualityMetrics};
use std::f64::consts::PI;

/// Source detection and scoring parameters
#[derive(Debug, Clone)]
pub struct QualityParams {
    /// Detection threshold above background, in noise sigma
    pub detection_sigma: f64,
    pub min_area: usize,
    pub max_area: usize,
    pub min_circularity: f64,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            detection_sigma: 3.0,
            min_area: 3,
            max_area: 1000,
            min_circularity: 0.3,
        }
    }
}

/// Shape measurements of one connected component
#[derive(Debug, Clone, PartialEq)]
pub struct SourceShape {
    pub area: usize,
    /// Intensity-weighted centroid as `(x, y)`
    pub centroid: (f64, f64),
    /// Background-subtracted flux
    pub flux: f64,
    pub peak: f32,
    pub perimeter: usize,
    pub circularity: f64,
    pub compactness: f64,
    pub aspect_ratio: f64,
}

impl SourceShape {
    pub fn stellarity(&self) -> f64 {
        self.circularity * self.compactness * self.aspect_ratio
    }
}

pub struct QualityAnalyzer {
    params: QualityParams,
    tiles: TileConfig,
}

impl QualityAnalyzer {
    pub fn new() -> Self {
        Self::with_params(QualityParams::default())
    }

    pub fn with_params(params: QualityParams) -> Self {
        Self {
            params,
            tiles: TileConfig::default(),
        }
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    pub fn analyze(&self, image: &FrameImage) -> CalResult<QualityMetrics> {
        log::info!("Computing quality metrics");
        let values = stats::finite_values(image);

        let median = stats::median(&values)?;
        let background = stats::mode(&values).unwrap_or(median) as f64;
        let noise = stats::sigma_from_mad(&values)?;
        let mean = stats::mean(&values)?;
        let (min, max) = stats::min_max(&values)?;
        let dynamic_range = (max - min) as f64;

        let snr = signal_to_noise(mean, background, noise);
        let seeing = self.seeing(image)?;
        let limiting_magnitude = limiting_magnitude(noise, seeing);

        let sources = self.detect_sources(image, background, noise);
        let stellarity = stellarity(&sources);
        let quality_score = quality_score(snr, seeing, limiting_magnitude, stellarity, dynamic_range);

        log::debug!(
            "background {:.3}, noise {:.3}, snr {:.3}, seeing {:.3}, mag {:.3}",
            background,
            noise,
            snr,
            seeing,
            limiting_magnitude
        );
        log::info!(
            "Quality score {:.2} from {} accepted sources",
            quality_score,
            sources.len()
        );
        Ok(QualityMetrics {
            background,
            noise_sigma: noise,
            mean,
            dynamic_range,
            snr,
            seeing_arcsec: seeing,
            limiting_magnitude,
            stellarity,
            quality_score,
            source_count: sources.len(),
        })
    }

    /// Empirical seeing from the mean Sobel gradient; sharper frames score lower
    pub fn seeing(&self, image: &FrameImage) -> CalResult<f64> {
        let gradient = filters::sobel_magnitude(image, self.tiles);
        let mean_gradient = stats::mean(&stats::finite_values(&gradient))?;
        Ok((3.0 - mean_gradient / 1000.0).clamp(0.5, 10.0))
    }

    /// 8-connected components above `background + detection_sigma * noise`
    /// that pass the area and circularity cuts
    pub fn detect_sources(&self, image: &FrameImage, background: f64, noise: f64) -> Vec<SourceShape> {
        let (height, width) = image.dim();
        let threshold = (background + self.params.detection_sigma * noise) as f32;

        let labels = label_components(image, threshold);
        let count = labels.iter().copied().max().unwrap_or(0) as usize;
        if count == 0 {
            return Vec::new();
        }

        let mut members: Vec<Vec<(usize, usize)>> = vec![Vec::new(); count + 1];
        for y in 0..height {
            for x in 0..width {
                let l = labels[y * width + x];
                if l > 0 {
                    members[l as usize].push((y, x));
                }
            }
        }

        let sources: Vec<SourceShape> = members
            .iter()
            .skip(1)
            .filter(|pixels| pixels.len() >= self.params.min_area && pixels.len() <= self.params.max_area)
            .map(|pixels| measure_component(image, &labels, width, height, pixels, background))
            .filter(|s| s.circularity >= self.params.min_circularity && s.circularity <= 1.0)
            .collect();
        log::debug!(
            "{} components above {:.3}, {} accepted",
            count,
            threshold,
            sources.len()
        );
        sources
    }
}

impl Default for QualityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// `(mean - background) / noise`, reported as 0 when undefined
pub fn signal_to_noise(mean: f64, background: f64, noise: f64) -> f64 {
    if noise <= 0.0 {
        return 0.0;
    }
    let snr = (mean - background) / noise;
    if snr.is_finite() {
        snr
    } else {
        0.0
    }
}

/// Five-sigma point-source limit inside a seeing disk
pub fn limiting_magnitude(noise: f64, seeing: f64) -> f64 {
    if noise <= 0.0 {
        return 30.0;
    }
    let aperture_noise = 5.0 * noise / (PI * seeing * seeing).sqrt();
    let mag = 25.0 - 2.5 * aperture_noise.log10();
    if mag.is_finite() {
        mag.clamp(15.0, 30.0)
    } else {
        30.0
    }
}

/// Size-weighted mean of per-source stellarity, in [0, 1]
pub fn stellarity(sources: &[SourceShape]) -> f64 {
    let (num, den) = sources.iter().fold((0.0, 0.0), |(num, den), s| {
        let w = (s.area as f64).sqrt();
        (num + w * s.stellarity(), den + w)
    });
    if den > 0.0 {
        (num / den).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub fn quality_score(snr: f64, seeing: f64, limiting_magnitude: f64, stellarity: f64, dynamic_range: f64) -> f64 {
    let score = 2.0 * snr
        + (20.0 - 5.0 * seeing).max(0.0)
        + 2.0 * (limiting_magnitude - 15.0)
        + 15.0 * stellarity
        + 5.0 * dynamic_range.max(1.0).log10();
    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Two-pass 8-connected labelling with union-find; 0 is background
fn label_components(image: &FrameImage, threshold: f32) -> Vec<u32> {
    let (height, width) = image.dim();
    let mut labels = vec![0u32; width * height];
    let mut parent = vec![0u32; 1];
    let mut next_label = 1u32;

    for y in 0..height {
        for x in 0..width {
            let v = image[[y, x]];
            if !v.is_finite() || v <= threshold {
                continue;
            }
            let idx = y * width + x;
            let mut neighbours = [0u32; 4];
            if x > 0 {
                neighbours[0] = labels[idx - 1];
            }
            if y > 0 {
                neighbours[1] = labels[idx - width];
                if x > 0 {
                    neighbours[2] = labels[idx - width - 1];
                }
                if x + 1 < width {
                    neighbours[3] = labels[idx - width + 1];
                }
            }

            let mut root = 0u32;
            for &n in neighbours.iter().filter(|&&n| n > 0) {
                let r = find(&mut parent, n);
                if root == 0 {
                    root = r;
                } else if r != root {
                    union(&mut parent, root, r);
                    root = root.min(r);
                }
            }
            if root == 0 {
                parent.push(next_label);
                root = next_label;
                next_label += 1;
            }
            labels[idx] = root;
        }
    }

    // Compact roots to consecutive labels
    let mut remap = vec![0u32; parent.len()];
    let mut next = 0u32;
    for l in labels.iter_mut() {
        if *l > 0 {
            let r = find(&mut parent, *l) as usize;
            if remap[r] == 0 {
                next += 1;
                remap[r] = next;
            }
            *l = remap[r];
        }
    }
    labels
}

fn find(parent: &mut [u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        parent[x as usize] = parent[parent[x as usize] as usize];
        x = parent[x as usize];
    }
    x
}

fn union(parent: &mut [u32], a: u32, b: u32) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent[ra.max(rb) as usize] = ra.min(rb);
    }
}

fn measure_component(
    image: &FrameImage,
    labels: &[u32],
    width: usize,
    height: usize,
    pixels: &[(usize, usize)],
    background: f64,
) -> SourceShape {
    let label = labels[pixels[0].0 * width + pixels[0].1];
    let area = pixels.len();

    // Exposed pixel edges; the frame border counts as exposed
    let inside = |y: isize, x: isize| {
        y >= 0
            && x >= 0
            && (y as usize) < height
            && (x as usize) < width
            && labels[y as usize * width + x as usize] == label
    };
    let perimeter: usize = pixels
        .iter()
        .map(|&(y, x)| {
            let (y, x) = (y as isize, x as isize);
            [(y - 1, x), (y + 1, x), (y, x - 1), (y, x + 1)]
                .iter()
                .filter(|&&(ny, nx)| !inside(ny, nx))
                .count()
        })
        .sum();

    let mut flux = 0.0f64;
    let mut peak = f32::NEG_INFINITY;
    let (mut sx, mut sy) = (0.0f64, 0.0f64);
    for &(y, x) in pixels {
        let v = image[[y, x]];
        let w = (v as f64 - background).max(0.0);
        flux += w;
        sx += w * x as f64;
        sy += w * y as f64;
        peak = peak.max(v);
    }
    let (cx, cy) = if flux > 0.0 {
        (sx / flux, sy / flux)
    } else {
        let n = area as f64;
        (
            pixels.iter().map(|p| p.1 as f64).sum::<f64>() / n,
            pixels.iter().map(|p| p.0 as f64).sum::<f64>() / n,
        )
    };

    // Geometric moments about the unweighted centre
    let n = area as f64;
    let mx = pixels.iter().map(|p| p.1 as f64).sum::<f64>() / n;
    let my = pixels.iter().map(|p| p.0 as f64).sum::<f64>() / n;
    let (mut cxx, mut cyy, mut cxy) = (0.0f64, 0.0f64, 0.0f64);
    let mut r_max = 0.0f64;
    for &(y, x) in pixels {
        let dx = x as f64 - mx;
        let dy = y as f64 - my;
        cxx += dx * dx;
        cyy += dy * dy;
        cxy += dx * dy;
        r_max = r_max.max((dx * dx + dy * dy).sqrt());
    }
    cxx /= n;
    cyy /= n;
    cxy /= n;
    let half_trace = (cxx + cyy) / 2.0;
    let spread = (((cxx - cyy) / 2.0).powi(2) + cxy * cxy).sqrt();
    let major = half_trace + spread;
    let minor = (half_trace - spread).max(0.0);
    let aspect_ratio = if major > 0.0 { (minor / major).sqrt() } else { 1.0 };

    let circularity = if perimeter > 0 {
        (4.0 * PI * n / (perimeter * perimeter) as f64).min(1.0)
    } else {
        1.0
    };
    let radius = r_max + 0.5;
    let compactness = (n / (PI * radius * radius)).min(1.0);

    SourceShape {
        area,
        centroid: (cx, cy),
        flux,
        peak,
        perimeter,
        circularity,
        compactness,
        aspect_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn test_constant_frame() {
        let image = Array2::from_elem((4, 4), 100.0f32);
        let q = QualityAnalyzer::new().analyze(&image).unwrap();
        assert_eq!(q.background, 100.0);
        assert_eq!(q.noise_sigma, 0.0);
        assert_eq!(q.snr, 0.0);
        assert_eq!(q.stellarity, 0.0);
        assert_eq!(q.limiting_magnitude, 30.0);
        assert!(q.quality_score.is_finite());
        assert!((0.0..=100.0).contains(&q.quality_score));
    }

    #[test]
    fn test_labelling_joins_diagonals() {
        let mut image = Array2::from_elem((5, 5), 0.0f32);
        image[[0, 0]] = 1.0;
        image[[1, 1]] = 1.0;
        image[[0, 4]] = 1.0;
        // V shape: the bottom pixel merges two provisional labels
        image[[3, 1]] = 1.0;
        image[[3, 3]] = 1.0;
        image[[4, 2]] = 1.0;
        let labels = label_components(&image, 0.5);
        assert_eq!(labels.iter().copied().max(), Some(3));
        assert_eq!(labels[0], labels[6]);
        assert_eq!(labels[16], labels[18]);
        assert_eq!(labels[16], labels[22]);
    }

    #[test]
    fn test_detects_compact_source() {
        let mut image = Array2::from_elem((20, 20), 10.0f32);
        for i in 0..20 {
            for j in 0..20 {
                image[[i, j]] += ((i * 3 + j * 5) % 4) as f32 * 0.5;
            }
        }
        for (di, dj, v) in [(0, 0, 200.0), (-1, 0, 120.0), (1, 0, 120.0), (0, -1, 120.0), (0, 1, 120.0)] {
            image[[(10 + di) as usize, (10 + dj) as usize]] = v;
        }
        let analyzer = QualityAnalyzer::new();
        let sources = analyzer.detect_sources(&image, 10.75, 0.75);
        assert_eq!(sources.len(), 1);
        let s = &sources[0];
        assert_eq!(s.area, 5);
        assert_abs_diff_eq!(s.centroid.0, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s.centroid.1, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s.aspect_ratio, 1.0, epsilon = 1e-9);
        assert!(stellarity(&sources) > 0.0);
    }

    #[test]
    fn test_line_is_rejected_by_circularity() {
        let mut image = Array2::from_elem((12, 12), 0.0f32);
        for j in 1..11 {
            image[[6, j]] = 50.0;
        }
        let sources = QualityAnalyzer::new().detect_sources(&image, 0.0, 1.0);
        assert!(sources.is_empty());
    }

    #[test]
    fn test_quality_score_is_clipped() {
        assert_eq!(quality_score(1e6, 0.5, 30.0, 1.0, 1e9), 100.0);
        assert_eq!(quality_score(-1e6, 10.0, 15.0, 0.0, 0.0), 0.0);
    }
}
