//! Cosmic-ray detection and repair.
//!
//! The Laplacian detector flags sharp positive excesses and repairs them from
//! unflagged neighbours. Compactness is judged against the local fine-structure
//! level so resolved sources keep their cores.

use crate::core::filters;
use crate::core::parallel::{map_pixels, TileConfig};
use crate::core::stats::{self, median_in_place};
use crate::core::steps::Checkpoint;
use crate::types::{CalResult, FrameImage};
use ndarray::Array2;

/// Laplacian detector parameters
#[derive(Debug, Clone)]
pub struct CosmicRayParams {
    /// Laplacian detection threshold in units of noise sigma
    pub sigma_clip: f64,
    /// Minimum contrast against the neighbourhood
    pub obj_lim: f64,
    /// Fraction of `sigma_clip` used for the fine-structure test
    pub sigma_frac: f64,
    pub max_iter: usize,
}

impl Default for CosmicRayParams {
    fn default() -> Self {
        Self {
            sigma_clip: 5.0,
            obj_lim: 5.0,
            sigma_frac: 0.3,
            max_iter: 4,
        }
    }
}

/// Star pre-mask for the enhanced detector
#[derive(Debug, Clone)]
pub struct StarMaskParams {
    /// Threshold on the 5x5 median above background, in noise sigma
    pub star_threshold: f64,
    /// Dilation radius of the mask in pixels
    pub star_mask_radius: usize,
}

impl Default for StarMaskParams {
    fn default() -> Self {
        Self {
            star_threshold: 5.0,
            star_mask_radius: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CosmicRayResult {
    pub image: FrameImage,
    /// Flagged pixels as `(row, col)` in detection order
    pub flagged: Vec<(usize, usize)>,
    pub iterations: usize,
    pub noise_sigma: f64,
    pub masked_pixels: usize,
}

impl CosmicRayResult {
    fn unchanged(image: FrameImage) -> Self {
        Self {
            image,
            flagged: Vec::new(),
            iterations: 0,
            noise_sigma: 0.0,
            masked_pixels: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.flagged.len()
    }
}

/// Too small for a 3x3 neighbourhood
fn too_small(image: &FrameImage) -> bool {
    let (height, width) = image.dim();
    height < 3 || width < 3
}

/// Noise sigma from the MAD of the high-pass residual `I - box3(I)`.
/// For white noise that residual has variance 8/9 of the input.
pub fn estimate_noise(image: &FrameImage, tiles: TileConfig) -> f64 {
    let smooth = filters::box_mean3(image, tiles);
    let residual: Vec<f32> = image.iter().zip(smooth.iter()).map(|(&v, &s)| v - s).collect();
    let sigma = stats::sigma_from_mad(&residual).unwrap_or(0.0) / (8.0f64 / 9.0).sqrt();
    floor_sigma(sigma, image)
}

/// A noiseless frame still needs a positive scale for the ratio tests
fn floor_sigma(sigma: f64, image: &FrameImage) -> f64 {
    if sigma > 0.0 && sigma.is_finite() {
        return sigma;
    }
    let level = stats::median(&stats::finite_values(image)).unwrap_or(0.0).abs() as f64;
    let floor = 1e-6 * level.max(1.0);
    log::debug!("Noise sigma is zero; using floor {:.3e}", floor);
    floor
}

/// Iterative Laplacian cosmic-ray remover
pub struct CosmicRayRemover {
    params: CosmicRayParams,
    star_mask: Option<StarMaskParams>,
    edge_handling: bool,
    tiles: TileConfig,
}

impl CosmicRayRemover {
    pub fn new() -> Self {
        Self::with_params(CosmicRayParams::default())
    }

    pub fn with_params(params: CosmicRayParams) -> Self {
        Self {
            params,
            star_mask: None,
            edge_handling: false,
            tiles: TileConfig::default(),
        }
    }

    /// Protect pixels inside a star pre-mask
    pub fn with_star_mask(mut self, star_mask: StarMaskParams) -> Self {
        self.star_mask = Some(star_mask);
        self
    }

    /// Examine border pixels as well, using replicated edges
    pub fn with_edge_handling(mut self, edge_handling: bool) -> Self {
        self.edge_handling = edge_handling;
        self
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    /// Pixels belonging to extended sources
    pub fn star_mask(&self, image: &FrameImage, sigma: f64, params: &StarMaskParams) -> Array2<bool> {
        let background = stats::median(&stats::finite_values(image)).unwrap_or(0.0);
        let median5 = filters::median_filter(image, 5, self.tiles);
        let limit = (params.star_threshold * sigma) as f32;
        let seeds = median5.mapv(|m| m - background > limit);
        filters::dilate(&seeds, params.star_mask_radius, self.tiles)
    }

    pub fn remove(&self, image: FrameImage, checkpoint: &Checkpoint) -> CalResult<CosmicRayResult> {
        log::info!("Starting cosmic-ray removal");
        log::debug!(
            "Cosmic-ray parameters: {:?}, star mask: {:?}, edges: {}",
            self.params,
            self.star_mask,
            self.edge_handling
        );

        if too_small(&image) || self.params.max_iter == 0 {
            log::info!("Cosmic-ray removal skipped for {:?} frame", image.dim());
            return Ok(CosmicRayResult::unchanged(image));
        }

        let (height, width) = image.dim();
        let initial_sigma = estimate_noise(&image, self.tiles);
        let mask = match &self.star_mask {
            Some(params) => self.star_mask(&image, initial_sigma, params),
            None => Array2::from_elem((height, width), false),
        };
        let masked_pixels = mask.iter().filter(|&&m| m).count();
        if masked_pixels > 0 {
            log::debug!("Star pre-mask protects {} pixels", masked_pixels);
        }

        let mut current = image;
        let mut flagged = Array2::from_elem((height, width), false);
        let mut flagged_list = Vec::new();
        let mut iterations = 0;
        let mut sigma = initial_sigma;

        for iter in 0..self.params.max_iter {
            checkpoint.check()?;
            iterations = iter + 1;

            sigma = estimate_noise(&current, self.tiles);
            let candidates = self.detect(&current, sigma, &flagged, &mask);
            log::debug!(
                "Iteration {}: sigma {:.4}, {} new cosmic-ray pixels",
                iterations,
                sigma,
                candidates.len()
            );
            if candidates.is_empty() {
                break;
            }

            for &(i, j) in &candidates {
                flagged[[i, j]] = true;
            }
            current = replace_from_neighbours(current, &flagged, &candidates);
            flagged_list.extend(candidates);
        }

        log::info!(
            "Cosmic-ray removal completed: {} pixels in {} iterations",
            flagged_list.len(),
            iterations
        );
        Ok(CosmicRayResult {
            image: current,
            flagged: flagged_list,
            iterations,
            noise_sigma: sigma,
            masked_pixels,
        })
    }

    fn detect(
        &self,
        image: &FrameImage,
        sigma: f64,
        flagged: &Array2<bool>,
        mask: &Array2<bool>,
    ) -> Vec<(usize, usize)> {
        let (height, width) = image.dim();
        let laplacian = filters::laplacian_positive(image, self.tiles);
        let median5 = filters::median_filter(image, 5, self.tiles);
        let median3 = filters::median_filter(image, 3, self.tiles);
        let median7 = filters::median_filter(&median3, 7, self.tiles);

        let p = &self.params;
        let lap_limit = (p.sigma_clip * sigma) as f32;
        let fine_limit = (p.sigma_frac * p.sigma_clip * sigma) as f32;
        let sigma32 = sigma as f32;
        let edges = self.edge_handling;

        let hits: Array2<bool> = map_pixels(height, width, self.tiles, |i, j| {
            let interior = i > 0 && j > 0 && i + 1 < height && j + 1 < width;
            if (!interior && !edges) || flagged[[i, j]] || mask[[i, j]] {
                return false;
            }
            let v = image[[i, j]];
            // L.A.Cosmic fine-structure term: noise floor raised where the frame has real structure
            let structure = (median3[[i, j]] - median7[[i, j]]).max(0.0);
            let contrast = (v - filters::neighbor_median8(image, i, j)) / sigma32.max(structure);
            let contrast = contrast as f64;

            let laplacian_hit = laplacian[[i, j]] > lap_limit && contrast > p.obj_lim;
            let fine_hit = (v - median5[[i, j]]).abs() > fine_limit && contrast > p.obj_lim / 2.0;
            laplacian_hit || fine_hit
        });

        hits.indexed_iter()
            .filter(|(_, &hit)| hit)
            .map(|(idx, _)| idx)
            .collect()
    }
}

impl Default for CosmicRayRemover {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace each new hit by the lower median of its unflagged in-frame neighbours,
/// falling back to the global median. Values come from the pre-replacement image.
fn replace_from_neighbours(
    image: FrameImage,
    flagged: &Array2<bool>,
    hits: &[(usize, usize)],
) -> FrameImage {
    let (height, width) = image.dim();
    let global = stats::median(&stats::finite_values(&image)).unwrap_or(0.0);
    let replacements: Vec<f32> = hits
        .iter()
        .map(|&(i, j)| {
            let mut ring = Vec::with_capacity(8);
            for di in -1isize..=1 {
                for dj in -1isize..=1 {
                    if di == 0 && dj == 0 {
                        continue;
                    }
                    let ii = i as isize + di;
                    let jj = j as isize + dj;
                    if ii < 0 || jj < 0 || ii >= height as isize || jj >= width as isize {
                        continue;
                    }
                    let (ii, jj) = (ii as usize, jj as usize);
                    if !flagged[[ii, jj]] {
                        ring.push(image[[ii, jj]]);
                    }
                }
            }
            median_in_place(&mut ring).unwrap_or(global)
        })
        .collect();

    let mut out = image;
    for (&(i, j), &value) in hits.iter().zip(replacements.iter()) {
        out[[i, j]] = value;
    }
    out
}

/// Median-filter variant parameters
#[derive(Debug, Clone)]
pub struct MedianFilterParams {
    /// Odd kernel width
    pub kernel_size: usize,
    /// Residual threshold in noise sigma
    pub threshold: f64,
    pub iterations: usize,
}

impl Default for MedianFilterParams {
    fn default() -> Self {
        Self {
            kernel_size: 5,
            threshold: 5.0,
            iterations: 1,
        }
    }
}

/// Flags pixels that stand above their median-filtered surroundings
pub struct MedianFilterRemover {
    params: MedianFilterParams,
    tiles: TileConfig,
}

impl MedianFilterRemover {
    pub fn new(params: MedianFilterParams) -> Self {
        Self {
            params,
            tiles: TileConfig::default(),
        }
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    pub fn remove(&self, image: FrameImage, checkpoint: &Checkpoint) -> CalResult<CosmicRayResult> {
        log::info!("Starting median-filter cosmic-ray removal");
        log::debug!("Median filter parameters: {:?}", self.params);

        if too_small(&image) || self.params.iterations == 0 {
            return Ok(CosmicRayResult::unchanged(image));
        }

        let (height, width) = image.dim();
        let kernel = self.params.kernel_size | 1;
        let mut current = image;
        let mut flagged = Array2::from_elem((height, width), false);
        let mut flagged_list = Vec::new();
        let mut iterations = 0;
        let mut sigma = 0.0;

        for iter in 0..self.params.iterations {
            checkpoint.check()?;
            iterations = iter + 1;

            let smooth = filters::median_filter(&current, kernel, self.tiles);
            let residual: Vec<f32> = current.iter().zip(smooth.iter()).map(|(&v, &m)| v - m).collect();
            sigma = floor_sigma(stats::sigma_from_mad(&residual).unwrap_or(0.0), &current);
            let limit = (self.params.threshold * sigma) as f32;

            let hits: Vec<(usize, usize)> = current
                .indexed_iter()
                .filter(|&((i, j), &v)| !flagged[[i, j]] && v - smooth[[i, j]] > limit)
                .map(|(idx, _)| idx)
                .collect();
            log::debug!("Iteration {}: {} pixels above {:.3}", iterations, hits.len(), limit);
            if hits.is_empty() {
                break;
            }
            for &(i, j) in &hits {
                flagged[[i, j]] = true;
                current[[i, j]] = smooth[[i, j]];
            }
            flagged_list.extend(hits);
        }

        log::info!(
            "Median-filter cosmic-ray removal completed: {} pixels",
            flagged_list.len()
        );
        Ok(CosmicRayResult {
            image: current,
            flagged: flagged_list,
            iterations,
            noise_sigma: sigma,
            masked_pixels: 0,
        })
    }
}
