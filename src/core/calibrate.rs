use crate::core::filters;
use crate::core::parallel::{map_pixels, TileConfig};
use crate::core::stats::{self, ClipParams};
use crate::types::{CalError, CalResult, FrameImage, Header};
use ndarray::{s, Array2, Zip};

/// Master calibration frame together with its header
#[derive(Debug, Clone)]
pub struct CalibrationFrame {
    pub image: FrameImage,
    pub header: Header,
}

impl CalibrationFrame {
    pub fn new(image: FrameImage, header: Header) -> Self {
        Self { image, header }
    }

    /// Frame with a minimal header and no metadata
    pub fn from_image(image: FrameImage) -> Self {
        let (height, width) = image.dim();
        Self {
            image,
            header: Header::for_image(width, height),
        }
    }
}

fn check_dimensions(image: &FrameImage, calib: &FrameImage) -> CalResult<()> {
    let (height, width) = image.dim();
    let (calib_height, calib_width) = calib.dim();
    if (height, width) != (calib_height, calib_width) {
        return Err(CalError::CalibrationDimensionMismatch {
            width,
            height,
            calib_width,
            calib_height,
        });
    }
    Ok(())
}

/// Rectangular overscan region, in pixels from the top-left corner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverscanRegion {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Default for OverscanRegion {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 50,
            height: 50,
        }
    }
}

impl OverscanRegion {
    /// Clip to the image; frames shorter than the region use their top half
    pub fn clip_to(&self, image_height: usize, image_width: usize) -> (usize, usize, usize, usize) {
        let y0 = self.y.min(image_height - 1);
        let x0 = self.x.min(image_width - 1);
        let mut h = self.height.max(1).min(image_height - y0);
        if image_height < self.height {
            h = h.min((image_height / 2).max(1));
        }
        let w = self.width.max(1).min(image_width - x0);
        (y0, x0, h, w)
    }
}

/// Outlier rejection for bias levels and bias frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionMethod {
    Sigma,
    Mad,
    Percentile,
}

impl RejectionMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sigma" => Some(RejectionMethod::Sigma),
            "mad" => Some(RejectionMethod::Mad),
            "percentile" => Some(RejectionMethod::Percentile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RejectionParams {
    pub method: RejectionMethod,
    /// Sigma multiple, or percentile trimmed from each tail
    pub threshold: f64,
}

/// Bias subtraction parameters
#[derive(Debug, Clone)]
pub struct BiasParams {
    /// Clamp negative output pixels at zero
    pub clamp_negative: bool,
    pub overscan: OverscanRegion,
    pub clip: ClipParams,
    /// Robust variant: reject outliers in the bias frame or overscan
    pub rejection: Option<RejectionParams>,
}

impl Default for BiasParams {
    fn default() -> Self {
        Self {
            clamp_negative: true,
            overscan: OverscanRegion::default(),
            clip: ClipParams::default(),
            rejection: None,
        }
    }
}

/// Where the subtracted bias came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasSource {
    Frame,
    Overscan,
}

#[derive(Debug, Clone)]
pub struct BiasResult {
    pub image: FrameImage,
    pub source: BiasSource,
    /// Scalar level for overscan subtraction, frame median otherwise
    pub bias_level: f64,
    pub rejected_pixels: usize,
    pub clamped_pixels: usize,
}

/// Bias subtraction processor
pub struct BiasSubtractor {
    params: BiasParams,
    tiles: TileConfig,
}

impl BiasSubtractor {
    pub fn new() -> Self {
        Self::with_params(BiasParams::default())
    }

    pub fn with_params(params: BiasParams) -> Self {
        Self {
            params,
            tiles: TileConfig::default(),
        }
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    /// Subtract a bias frame if given, otherwise a scalar overscan level
    pub fn subtract(&self, image: FrameImage, bias: Option<&FrameImage>) -> CalResult<BiasResult> {
        log::info!("Applying bias subtraction");
        log::debug!("Bias parameters: {:?}", self.params);

        let (mut corrected, source, level, rejected) = match bias {
            Some(frame) => {
                check_dimensions(&image, frame)?;
                let (frame, rejected) = match self.params.rejection {
                    Some(rejection) => self.reject_frame_outliers(frame, rejection)?,
                    None => (frame.clone(), 0),
                };
                let level = stats::median(&stats::finite_values(&frame)).unwrap_or(0.0) as f64;
                let corrected = Zip::from(&image).and(&frame).map_collect(|&v, &b| v - b);
                (corrected, BiasSource::Frame, level, rejected)
            }
            None => {
                let (level, rejected) = self.overscan_level(&image)?;
                let level32 = level as f32;
                (image.mapv(|v| v - level32), BiasSource::Overscan, level, rejected)
            }
        };

        let mut clamped = 0;
        if self.params.clamp_negative {
            corrected.iter_mut().for_each(|v| {
                if *v < 0.0 {
                    *v = 0.0;
                    clamped += 1;
                }
            });
        }

        log::info!(
            "Bias subtraction completed ({:?}, level {:.3}, {} pixels clamped)",
            source,
            level,
            clamped
        );
        Ok(BiasResult {
            image: corrected,
            source,
            bias_level: level,
            rejected_pixels: rejected,
            clamped_pixels: clamped,
        })
    }

    /// Scalar bias level from the overscan region
    pub fn overscan_level(&self, image: &FrameImage) -> CalResult<(f64, usize)> {
        let (height, width) = image.dim();
        let (y0, x0, h, w) = self.params.overscan.clip_to(height, width);
        let region: Vec<f32> = image
            .slice(s![y0..y0 + h, x0..x0 + w])
            .iter()
            .copied()
            .collect();
        log::debug!("Overscan region rows {}..{}, cols {}..{}", y0, y0 + h, x0, x0 + w);

        match self.params.rejection {
            None => {
                let level = stats::sigma_clipped_mean(&region, self.params.clip.k, self.params.clip.max_iter)?;
                Ok((level, 0))
            }
            Some(rejection) => {
                let kept = self.reject_values(&region, rejection)?;
                let rejected = region.len() - kept.len();
                Ok((stats::mean(&kept)?, rejected))
            }
        }
    }

    fn reject_values(&self, values: &[f32], rejection: RejectionParams) -> CalResult<Vec<f32>> {
        let kept: Vec<f32> = match rejection.method {
            RejectionMethod::Sigma => {
                let mut kept = values.to_vec();
                for _ in 0..self.params.clip.max_iter.max(1) {
                    let (mean, std) = stats::mean_std(&kept)?;
                    let before = kept.len();
                    kept.retain(|&v| ((v as f64) - mean).abs() <= rejection.threshold * std);
                    if kept.len() == before || std <= 0.0 {
                        break;
                    }
                }
                kept
            }
            RejectionMethod::Mad => {
                let (median, sigma) = stats::median_and_sigma(values)?;
                values
                    .iter()
                    .copied()
                    .filter(|&v| ((v - median) as f64).abs() <= rejection.threshold * sigma)
                    .collect()
            }
            RejectionMethod::Percentile => {
                let lo = stats::percentile(values, rejection.threshold)?;
                let hi = stats::percentile(values, 100.0 - rejection.threshold)?;
                values.iter().copied().filter(|&v| v >= lo && v <= hi).collect()
            }
        };
        if kept.is_empty() {
            return Err(CalError::NumericDegenerate(
                "outlier rejection removed every bias sample".to_string(),
            ));
        }
        Ok(kept)
    }

    fn reject_frame_outliers(
        &self,
        frame: &FrameImage,
        rejection: RejectionParams,
    ) -> CalResult<(FrameImage, usize)> {
        let values = stats::finite_values(frame);
        let kept = self.reject_values(&values, rejection)?;
        let (lo, hi) = stats::min_max(&kept)?;
        let median = stats::median(&values)?;
        let mut rejected = 0;
        let cleaned = frame.mapv(|v| {
            if v < lo || v > hi || !v.is_finite() {
                rejected += 1;
                median
            } else {
                v
            }
        });
        log::debug!("Replaced {} bias frame outliers with median {:.3}", rejected, median);
        Ok((cleaned, rejected))
    }
}

impl Default for BiasSubtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Dark subtraction parameters
#[derive(Debug, Clone)]
pub struct DarkParams {
    /// Fixed multiplier when auto-scaling is off
    pub scale_factor: f64,
    /// Scale by the science/dark exposure time ratio
    pub auto_scale: bool,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for DarkParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            auto_scale: false,
            min_scale: 0.1,
            max_scale: 10.0,
        }
    }
}

/// Window-wise dark scaling parameters
#[derive(Debug, Clone)]
pub struct AdaptiveDarkParams {
    pub window_size: usize,
    /// Pixels further than this many sigma from the window median are not fitted
    pub adaptive_threshold: f64,
    pub preserve_stars: bool,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for AdaptiveDarkParams {
    fn default() -> Self {
        Self {
            window_size: 64,
            adaptive_threshold: 3.0,
            preserve_stars: true,
            min_scale: 0.1,
            max_scale: 10.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DarkResult {
    pub image: FrameImage,
    pub scale_factor: f64,
    /// Unclamped exposure ratio, when auto-scaling
    pub exposure_ratio: Option<f64>,
    pub clamped: bool,
    /// Per-window scale range for the adaptive variant
    pub window_scale_range: Option<(f64, f64)>,
}

/// Dark current subtraction processor
pub struct DarkSubtractor {
    params: DarkParams,
    tiles: TileConfig,
}

impl DarkSubtractor {
    pub fn new() -> Self {
        Self::with_params(DarkParams::default())
    }

    pub fn with_params(params: DarkParams) -> Self {
        Self {
            params,
            tiles: TileConfig::default(),
        }
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    /// Exposure ratio between the science frame and the dark
    pub fn exposure_ratio(header: &Header, dark: &CalibrationFrame) -> CalResult<f64> {
        let t_image = header.exposure_time().ok_or_else(|| {
            CalError::MissingExposureTime("science frame has no EXPTIME".to_string())
        })?;
        let t_dark = dark.header.exposure_time().ok_or_else(|| {
            CalError::MissingExposureTime("dark frame has no EXPTIME".to_string())
        })?;
        if t_dark <= 0.0 {
            return Err(CalError::NumericDegenerate(format!(
                "dark exposure time must be positive, got {}",
                t_dark
            )));
        }
        Ok(t_image / t_dark)
    }

    pub fn subtract(
        &self,
        image: FrameImage,
        header: &Header,
        dark: &CalibrationFrame,
    ) -> CalResult<DarkResult> {
        log::info!("Applying dark subtraction");
        log::debug!("Dark parameters: {:?}", self.params);
        check_dimensions(&image, &dark.image)?;
        validate_scale_bounds(self.params.min_scale, self.params.max_scale)?;

        let (factor, ratio, clamped) = if self.params.auto_scale {
            let ratio = Self::exposure_ratio(header, dark)?;
            let factor = ratio.clamp(self.params.min_scale, self.params.max_scale);
            if factor != ratio {
                log::warn!(
                    "Exposure ratio {:.3} clamped to {:.3}",
                    ratio,
                    factor
                );
            }
            (factor, Some(ratio), factor != ratio)
        } else {
            (self.params.scale_factor, None, false)
        };

        let f = factor as f32;
        let corrected = Zip::from(&image).and(&dark.image).map_collect(|&v, &d| v - f * d);

        log::info!("Dark subtraction completed with scale factor {:.4}", factor);
        Ok(DarkResult {
            image: corrected,
            scale_factor: factor,
            exposure_ratio: ratio,
            clamped,
            window_scale_range: None,
        })
    }

    /// Fit a dark scale per window by least squares against the science frame
    pub fn subtract_adaptive(
        &self,
        image: FrameImage,
        header: &Header,
        dark: &CalibrationFrame,
        params: &AdaptiveDarkParams,
    ) -> CalResult<DarkResult> {
        log::info!("Applying adaptive dark subtraction");
        log::debug!("Adaptive dark parameters: {:?}", params);
        check_dimensions(&image, &dark.image)?;
        validate_scale_bounds(params.min_scale, params.max_scale)?;

        let fallback = Self::exposure_ratio(header, dark)
            .map(|r| r.clamp(params.min_scale, params.max_scale))
            .unwrap_or(1.0);

        let (height, width) = image.dim();
        let win = params.window_size.max(1);
        let rows = height.div_ceil(win);
        let cols = width.div_ceil(win);

        let mut scales = Array2::<f64>::zeros((rows, cols));
        for wr in 0..rows {
            for wc in 0..cols {
                let r0 = wr * win;
                let c0 = wc * win;
                let r1 = (r0 + win).min(height);
                let c1 = (c0 + win).min(width);
                let img = image.slice(s![r0..r1, c0..c1]);
                let drk = dark.image.slice(s![r0..r1, c0..c1]);
                let k = fit_window_scale(&img.to_owned(), &drk.to_owned(), params).unwrap_or(fallback);
                scales[[wr, wc]] = k.clamp(params.min_scale, params.max_scale);
            }
        }

        let corrected = map_pixels(height, width, self.tiles, |i, j| {
            let k = scales[[i / win, j / win]] as f32;
            image[[i, j]] - k * dark.image[[i, j]]
        });

        let (lo, hi) = scales
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &k| (lo.min(k), hi.max(k)));
        log::info!(
            "Adaptive dark subtraction completed over {} windows (scale {:.3}..{:.3})",
            rows * cols,
            lo,
            hi
        );
        Ok(DarkResult {
            image: corrected,
            scale_factor: stats::median(&scales.iter().map(|&k| k as f32).collect::<Vec<_>>())
                .map(|m| m as f64)
                .unwrap_or(fallback),
            exposure_ratio: None,
            clamped: false,
            window_scale_range: Some((lo, hi)),
        })
    }
}

impl Default for DarkSubtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_scale_bounds(min_scale: f64, max_scale: f64) -> CalResult<()> {
    if !(min_scale > 0.0 && min_scale <= max_scale) {
        return Err(CalError::ParameterOutOfRange {
            name: "min_scale".to_string(),
            message: format!("need 0 < min_scale <= max_scale, got {} and {}", min_scale, max_scale),
        });
    }
    Ok(())
}

/// Least-squares slope of image against dark with an intercept for the sky.
/// Returns `None` when the dark has no variance in the selected pixels.
fn fit_window_scale(img: &FrameImage, drk: &FrameImage, params: &AdaptiveDarkParams) -> Option<f64> {
    let values: Vec<f32> = img.iter().copied().collect();
    let (median, sigma) = stats::median_and_sigma(&values).ok()?;
    let limit = params.adaptive_threshold * sigma;

    let mut n = 0.0f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (&v, &d) in img.iter().zip(drk.iter()) {
        if !v.is_finite() || !d.is_finite() {
            continue;
        }
        if params.preserve_stars && sigma > 0.0 && ((v - median) as f64).abs() > limit {
            continue;
        }
        let (x, y) = (d as f64, v as f64);
        n += 1.0;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    if n < 2.0 {
        return None;
    }
    let var = sxx - sx * sx / n;
    if var <= 1e-12 * sxx.max(1.0) {
        return None;
    }
    Some((sxy - sx * sy / n) / var)
}

/// Which statistic normalized the flat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatNormalization {
    Mode,
    Median,
}

impl FlatNormalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlatNormalization::Mode => "mode",
            FlatNormalization::Median => "median",
        }
    }
}

/// Low-order illumination model removed from the flat before normalization
#[derive(Debug, Clone)]
pub struct IlluminationParams {
    pub polynomial_degree: usize,
    pub mask_stars: bool,
    pub star_mask_sigma: f64,
}

impl Default for IlluminationParams {
    fn default() -> Self {
        Self {
            polynomial_degree: 3,
            mask_stars: true,
            star_mask_sigma: 3.0,
        }
    }
}

/// Flat-field correction parameters
#[derive(Debug, Clone)]
pub struct FlatParams {
    /// Smooth the pixels bordering replaced bad pixels with a 3x3 mean
    pub post_smooth: bool,
    /// Multiply the divisor by the instrument gain factor
    pub apply_gain: bool,
    /// Replace corrected pixels above mean + rejection_sigma * std with the mean
    pub outlier_rejection: bool,
    pub rejection_sigma: f64,
    pub illumination: Option<IlluminationParams>,
}

impl Default for FlatParams {
    fn default() -> Self {
        Self {
            post_smooth: true,
            apply_gain: false,
            outlier_rejection: false,
            rejection_sigma: 5.0,
            illumination: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlatResult {
    pub image: FrameImage,
    pub normalization: FlatNormalization,
    pub normalization_value: f64,
    pub flat_median: f64,
    pub flat_mode: f64,
    pub gain: f64,
    pub bad_pixels: usize,
    pub outliers_replaced: usize,
    pub replacement_value: f64,
}

/// Instrument/filter/exposure dependent gain factor
pub fn gain_correction(header: &Header) -> f64 {
    let instrument = header.instrument().unwrap_or("").to_ascii_uppercase();
    let mut gain = if instrument.contains("WFC3") || instrument.contains("WFPC2") {
        2.0
    } else if instrument.contains("NIRCAM") || instrument.contains("MIRI") {
        1.5
    } else {
        1.0
    };
    if header
        .filter()
        .map(|f| f.to_ascii_lowercase().contains("narrow"))
        .unwrap_or(false)
    {
        gain *= 1.2;
    }
    match header.exposure_time() {
        Some(t) if t > 0.0 => gain * t.sqrt(),
        _ => gain,
    }
}

/// Flat-field correction processor
pub struct FlatCorrector {
    params: FlatParams,
    tiles: TileConfig,
}

impl FlatCorrector {
    pub fn new() -> Self {
        Self::with_params(FlatParams::default())
    }

    pub fn with_params(params: FlatParams) -> Self {
        Self {
            params,
            tiles: TileConfig::default(),
        }
    }

    pub fn with_tiles(mut self, tiles: TileConfig) -> Self {
        self.tiles = tiles;
        self
    }

    /// Mode if it sits within 30% of the median, else the median
    pub fn normalization(flat: &FrameImage) -> CalResult<(FlatNormalization, f64, f64, f64)> {
        let positive: Vec<f32> = flat.iter().copied().filter(|v| v.is_finite() && *v > 0.0).collect();
        if positive.is_empty() {
            return Err(CalError::NumericDegenerate("flat has no positive pixels".to_string()));
        }
        let median = stats::median(&positive)? as f64;
        let mode = stats::mode(&positive)? as f64;
        if median <= 0.0 {
            return Err(CalError::NumericDegenerate(format!(
                "flat normalization value {} is not positive",
                median
            )));
        }
        if mode > 0.0 && (mode - median).abs() < 0.3 * median {
            Ok((FlatNormalization::Mode, mode, median, mode))
        } else {
            Ok((FlatNormalization::Median, median, median, mode))
        }
    }

    pub fn correct(&self, image: FrameImage, header: &Header, flat: &FrameImage) -> CalResult<FlatResult> {
        log::info!("Applying flat-field correction");
        log::debug!("Flat parameters: {:?}", self.params);
        check_dimensions(&image, flat)?;

        let response = match &self.params.illumination {
            Some(illum) => remove_illumination(flat, illum, self.tiles)?,
            None => flat.clone(),
        };

        let (normalization, norm_value, flat_median, flat_mode) = Self::normalization(&response)?;
        let gain = if self.params.apply_gain {
            gain_correction(header)
        } else {
            1.0
        };
        log::debug!(
            "Normalizing flat by {} = {:.5} (median {:.5}, mode {:.5}), gain {:.4}",
            normalization.as_str(),
            norm_value,
            flat_median,
            flat_mode,
            gain
        );

        let (height, width) = image.dim();
        let norm = norm_value as f32;
        let g = gain as f32;
        // Subnormal responses overflow the quotient
        let bad: Array2<bool> = Zip::from(&response).and(&image).map_collect(|&c, &v| {
            if !(c.is_finite() && c > 0.0) {
                return true;
            }
            let r = (c / norm) * g;
            !(r.is_normal() && r > 0.0 && (v / r).is_finite())
        });
        let mut corrected = map_pixels(height, width, self.tiles, |i, j| {
            if bad[[i, j]] {
                0.0
            } else {
                image[[i, j]] / ((response[[i, j]] / norm) * g)
            }
        });

        let good: Vec<f32> = corrected
            .iter()
            .zip(bad.iter())
            .filter(|(_, &b)| !b)
            .map(|(&v, _)| v)
            .collect();
        let bad_pixels = bad.iter().filter(|&&b| b).count();
        let (mean, std) = stats::mean_std(&good).map_err(|_| {
            CalError::NumericDegenerate("no valid flat pixels to correct".to_string())
        })?;
        let fill = mean as f32;
        Zip::from(&mut corrected).and(&bad).for_each(|v, &b| {
            if b {
                *v = fill;
            }
        });

        let mut outliers = 0;
        if self.params.outlier_rejection && std > 0.0 {
            let limit = (mean + self.params.rejection_sigma * std) as f32;
            corrected.iter_mut().for_each(|v| {
                if *v > limit {
                    *v = fill;
                    outliers += 1;
                }
            });
        }

        if self.params.post_smooth && bad_pixels > 0 {
            corrected = smooth_bad_pixel_borders(&corrected, &bad, self.tiles);
        }

        log::info!(
            "Flat-field correction completed ({} bad pixels, {} outliers replaced)",
            bad_pixels,
            outliers
        );
        Ok(FlatResult {
            image: corrected,
            normalization,
            normalization_value: norm_value,
            flat_median,
            flat_mode,
            gain,
            bad_pixels,
            outliers_replaced: outliers,
            replacement_value: mean,
        })
    }
}

impl Default for FlatCorrector {
    fn default() -> Self {
        Self::new()
    }
}

/// 3x3 mean applied to good pixels that touch a replaced pixel
fn smooth_bad_pixel_borders(image: &FrameImage, bad: &Array2<bool>, tiles: TileConfig) -> FrameImage {
    let border = filters::dilate(bad, 1, tiles);
    let smoothed = filters::box_mean3(image, tiles);
    let (height, width) = image.dim();
    map_pixels(height, width, tiles, |i, j| {
        if border[[i, j]] && !bad[[i, j]] {
            smoothed[[i, j]]
        } else {
            image[[i, j]]
        }
    })
}

/// Divide the flat by a fitted 2D polynomial illumination surface
fn remove_illumination(flat: &FrameImage, params: &IlluminationParams, tiles: TileConfig) -> CalResult<FrameImage> {
    let (height, width) = flat.dim();
    let degree = params.polynomial_degree;
    let terms: Vec<(i32, i32)> = (0..=degree as i32)
        .flat_map(|a| (0..=(degree as i32 - a)).map(move |b| (a, b)))
        .collect();

    let norm_x = |j: usize| if width > 1 { 2.0 * j as f64 / (width - 1) as f64 - 1.0 } else { 0.0 };
    let norm_y = |i: usize| if height > 1 { 2.0 * i as f64 / (height - 1) as f64 - 1.0 } else { 0.0 };

    let values = stats::finite_values(flat);
    let (median, sigma) = stats::median_and_sigma(&values)?;
    let limit = params.star_mask_sigma * sigma;

    let stride = (((height * width) as f64 / 4096.0).sqrt().floor() as usize).max(1);
    let n = terms.len();
    let mut ata = vec![vec![0.0f64; n]; n];
    let mut atb = vec![0.0f64; n];
    let mut samples = 0usize;
    for i in (0..height).step_by(stride) {
        for j in (0..width).step_by(stride) {
            let v = flat[[i, j]];
            if !(v.is_finite() && v > 0.0) {
                continue;
            }
            if params.mask_stars && sigma > 0.0 && ((v - median) as f64).abs() > limit {
                continue;
            }
            let (x, y) = (norm_x(j), norm_y(i));
            let basis: Vec<f64> = terms.iter().map(|&(a, b)| x.powi(a) * y.powi(b)).collect();
            for r in 0..n {
                atb[r] += basis[r] * v as f64;
                for c in 0..n {
                    ata[r][c] += basis[r] * basis[c];
                }
            }
            samples += 1;
        }
    }

    let coeffs = if samples >= n {
        solve_linear(ata, atb)
    } else {
        None
    };
    let coeffs = match coeffs {
        Some(c) => c,
        None => {
            log::warn!("Illumination fit is singular; using a constant model");
            let mut c = vec![0.0; n];
            c[0] = median as f64;
            c
        }
    };
    log::debug!("Illumination model degree {} fitted on {} samples", degree, samples);

    Ok(map_pixels(height, width, tiles, |i, j| {
        let (x, y) = (norm_x(j), norm_y(i));
        let model: f64 = terms
            .iter()
            .zip(coeffs.iter())
            .map(|(&(a, b), c)| c * x.powi(a) * y.powi(b))
            .sum();
        if model > 0.0 {
            (flat[[i, j]] as f64 / model) as f32
        } else {
            0.0
        }
    }))
}

/// Gaussian elimination with partial pivoting
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let s: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - s) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_overscan_clip_small_image() {
        let region = OverscanRegion::default();
        assert_eq!(region.clip_to(8, 8), (0, 0, 4, 8));
        assert_eq!(region.clip_to(200, 300), (0, 0, 50, 50));
        assert_eq!(region.clip_to(1, 1), (0, 0, 1, 1));
    }

    #[test]
    fn test_bias_frame_subtraction() {
        let image = Array2::from_elem((4, 4), 120.0f32);
        let bias = Array2::from_elem((4, 4), 100.0f32);
        let result = BiasSubtractor::new().subtract(image, Some(&bias)).unwrap();
        assert_eq!(result.source, BiasSource::Frame);
        assert!(result.image.iter().all(|&v| v == 20.0));
    }

    #[test]
    fn test_bias_dimension_mismatch() {
        let image = Array2::from_elem((4, 4), 1.0f32);
        let bias = Array2::from_elem((3, 4), 1.0f32);
        let result = BiasSubtractor::new().subtract(image, Some(&bias));
        assert!(matches!(result, Err(CalError::CalibrationDimensionMismatch { .. })));
    }

    #[test]
    fn test_robust_bias_rejects_hot_pixel_in_frame() {
        let image = Array2::from_elem((5, 5), 110.0f32);
        let mut bias = Array2::from_elem((5, 5), 100.0f32);
        bias[[2, 2]] = 5000.0;
        let params = BiasParams {
            rejection: Some(RejectionParams {
                method: RejectionMethod::Mad,
                threshold: 3.0,
            }),
            ..BiasParams::default()
        };
        let result = BiasSubtractor::with_params(params).subtract(image, Some(&bias)).unwrap();
        assert_eq!(result.rejected_pixels, 1);
        assert_eq!(result.image[[2, 2]], 10.0);
    }

    #[test]
    fn test_dark_fixed_scale() {
        let image = Array2::from_elem((3, 3), 50.0f32);
        let dark = CalibrationFrame::from_image(Array2::from_elem((3, 3), 10.0f32));
        let params = DarkParams {
            scale_factor: 0.5,
            ..DarkParams::default()
        };
        let result = DarkSubtractor::with_params(params)
            .subtract(image, &Header::new(), &dark)
            .unwrap();
        assert!(result.image.iter().all(|&v| v == 45.0));
    }

    #[test]
    fn test_dark_auto_scale_is_clamped() {
        let mut header = Header::new();
        header.set_float("EXPTIME", 1000.0, None);
        let mut dark_header = Header::new();
        dark_header.set_float("EXPTIME", 1.0, None);
        let dark = CalibrationFrame::new(Array2::from_elem((2, 2), 1.0f32), dark_header);
        let params = DarkParams {
            auto_scale: true,
            ..DarkParams::default()
        };
        let result = DarkSubtractor::with_params(params)
            .subtract(Array2::from_elem((2, 2), 100.0f32), &header, &dark)
            .unwrap();
        assert_eq!(result.scale_factor, 10.0);
        assert!(result.clamped);
        assert_eq!(result.exposure_ratio, Some(1000.0));
    }

    #[test]
    fn test_adaptive_dark_recovers_window_scale() {
        let (h, w) = (16, 16);
        let dark_img = Array2::from_shape_fn((h, w), |(i, j)| 5.0 + ((i * 7 + j * 3) % 11) as f32);
        let image = Array2::from_shape_fn((h, w), |(i, j)| 200.0 + 2.0 * dark_img[[i, j]]);
        let dark = CalibrationFrame::from_image(dark_img);
        let params = AdaptiveDarkParams {
            window_size: 8,
            preserve_stars: false,
            ..AdaptiveDarkParams::default()
        };
        let result = DarkSubtractor::new()
            .subtract_adaptive(image, &Header::new(), &dark, &params)
            .unwrap();
        let (lo, hi) = result.window_scale_range.unwrap();
        assert_abs_diff_eq!(lo, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(hi, 2.0, epsilon = 1e-6);
        for &v in result.image.iter() {
            assert_abs_diff_eq!(v, 200.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_gain_correction() {
        let mut header = Header::new();
        header.set_str("INSTRUME", "WFC3", None);
        header.set_str("FILTER", "F656N-narrow", None);
        header.set_float("EXPTIME", 4.0, None);
        assert_abs_diff_eq!(gain_correction(&header), 2.0 * 1.2 * 2.0, epsilon = 1e-12);
        assert_eq!(gain_correction(&Header::new()), 1.0);
    }

    #[test]
    fn test_flat_median_normalization_when_mode_far() {
        // Bimodal flat: mode 2.0 is more than 30% from the median 1.0
        let mut values = vec![1.0f32; 51];
        values.extend(std::iter::repeat(2.0).take(49));
        let flat = Array2::from_shape_vec((10, 10), values).unwrap();
        let (norm, value, _, _) = FlatCorrector::normalization(&flat).unwrap();
        assert_eq!(norm, FlatNormalization::Median);
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_flat_bad_pixels_take_mean() {
        let image = Array2::from_elem((4, 4), 10.0f32);
        let mut flat = Array2::from_elem((4, 4), 2.0f32);
        flat[[1, 1]] = 0.0;
        flat[[2, 3]] = -1.0;
        let params = FlatParams {
            post_smooth: false,
            ..FlatParams::default()
        };
        let result = FlatCorrector::with_params(params)
            .correct(image, &Header::new(), &flat)
            .unwrap();
        assert_eq!(result.bad_pixels, 2);
        assert_eq!(result.image[[1, 1]], result.replacement_value as f32);
        assert_eq!(result.image[[2, 3]], 10.0);
    }

    #[test]
    fn test_subnormal_flat_pixel_is_bad() {
        let image = Array2::from_elem((5, 5), 100.0f32);
        let mut flat = Array2::from_elem((5, 5), 1.0f32);
        flat[[2, 2]] = 1e-38;
        let params = FlatParams {
            post_smooth: false,
            ..FlatParams::default()
        };
        let result = FlatCorrector::with_params(params)
            .correct(image, &Header::new(), &flat)
            .unwrap();
        assert_eq!(result.bad_pixels, 1);
        assert!(result.image.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(result.image[[2, 2]], 100.0, epsilon = 1e-3);
    }

    #[test]
    fn test_illumination_model_removes_gradient() {
        let flat = Array2::from_shape_fn((32, 32), |(_, j)| 1.0 + 0.01 * j as f32);
        let image = flat.mapv(|v| v * 500.0);
        let params = FlatParams {
            illumination: Some(IlluminationParams {
                polynomial_degree: 1,
                ..IlluminationParams::default()
            }),
            ..FlatParams::default()
        };
        let result = FlatCorrector::with_params(params)
            .correct(image.clone(), &Header::new(), &flat)
            .unwrap();
        // A pure gradient is illumination, so the science frame keeps it
        for (&out, &inp) in result.image.iter().zip(image.iter()) {
            assert_abs_diff_eq!(out, inp, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_solve_linear() {
        let a = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let b = vec![5.0, 10.0];
        let x = solve_linear(a, b).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 3.0, epsilon = 1e-12);
    }
}
