//! Algorithm trait objects dispatched by the registry.
//!
//! Each implementation validates the string-keyed parameter map into the typed
//! parameter struct of its processor, then runs the numerical kernel.

use crate::core::calibrate::{
    AdaptiveDarkParams, BiasParams, BiasSource, BiasSubtractor, CalibrationFrame, DarkParams, DarkSubtractor,
    FlatCorrector, FlatParams, IlluminationParams, OverscanRegion, RejectionMethod, RejectionParams,
};
use crate::core::cosmic_ray::{
    CosmicRayParams, CosmicRayRemover, CosmicRayResult, MedianFilterParams, MedianFilterRemover, StarMaskParams,
};
use crate::core::parallel::TileConfig;
use crate::core::stats::ClipParams;
use crate::registry::algorithms::{AlgorithmDescriptor, ParamSpec, ResolvedParams, Stability};
use crate::types::{CalError, CalResult, FrameImage, Header, MetricMap, MetricValue, ParamMap, ParamValue, StepType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared flag for cooperative cancellation
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation token plus optional deadline, polled between units of work
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Checkpoint {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn check(&self) -> CalResult<()> {
        if self.token.is_cancelled() {
            return Err(CalError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CalError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

/// Everything a step needs for one invocation
pub struct StepInput<'a> {
    pub image: FrameImage,
    pub header: &'a Header,
    /// Resolved parameters: every schema key is present and typed
    pub params: &'a ParamMap,
    pub calib: Option<&'a CalibrationFrame>,
    pub tiles: TileConfig,
    pub checkpoint: &'a Checkpoint,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub image: FrameImage,
    pub metrics: MetricMap,
    pub warnings: Vec<String>,
}

impl StepResult {
    fn new(image: FrameImage) -> Self {
        Self {
            image,
            metrics: MetricMap::new(),
            warnings: Vec::new(),
        }
    }

    fn number(&mut self, key: &str, value: f64) {
        self.metrics.insert(key.to_string(), MetricValue::Number(value));
    }

    fn count(&mut self, key: &str, value: usize) {
        self.metrics.insert(key.to_string(), MetricValue::Count(value as u64));
    }

    fn text(&mut self, key: &str, value: &str) {
        self.metrics.insert(key.to_string(), MetricValue::Text(value.to_string()));
    }
}

/// One runnable algorithm variant
pub trait StepAlgorithm: Send + Sync {
    fn descriptor(&self) -> &AlgorithmDescriptor;

    fn default_params(&self) -> ParamMap {
        self.descriptor().default_params()
    }

    fn validate(&self, params: &ParamMap, strict: bool) -> CalResult<ResolvedParams> {
        self.descriptor().resolve_params(params, strict)
    }

    /// Whether `apply` fails without a calibration frame
    fn requires_calibration(&self) -> bool {
        false
    }

    fn apply(&self, input: StepInput<'_>) -> CalResult<StepResult>;
}

/// Typed access to a resolved parameter map
struct Params<'a>(&'a ParamMap);

impl<'a> Params<'a> {
    fn value(&self, name: &str) -> CalResult<&'a ParamValue> {
        self.0.get(name).ok_or_else(|| CalError::ParameterOutOfRange {
            name: name.to_string(),
            message: "missing after resolution".to_string(),
        })
    }

    fn f64(&self, name: &str) -> CalResult<f64> {
        match self.value(name)? {
            ParamValue::Float(f) => Ok(*f),
            ParamValue::Int(i) => Ok(*i as f64),
            other => Err(type_error(name, other)),
        }
    }

    fn usize(&self, name: &str) -> CalResult<usize> {
        match self.value(name)? {
            ParamValue::Int(i) if *i >= 0 => Ok(*i as usize),
            other => Err(type_error(name, other)),
        }
    }

    fn bool(&self, name: &str) -> CalResult<bool> {
        match self.value(name)? {
            ParamValue::Bool(b) => Ok(*b),
            other => Err(type_error(name, other)),
        }
    }

    fn str(&self, name: &str) -> CalResult<&'a str> {
        match self.value(name)? {
            ParamValue::Str(s) => Ok(s),
            other => Err(type_error(name, other)),
        }
    }
}

fn type_error(name: &str, value: &ParamValue) -> CalError {
    CalError::ParameterOutOfRange {
        name: name.to_string(),
        message: format!("unexpected value '{}'", value),
    }
}

fn require_calib<'a>(calib: Option<&'a CalibrationFrame>, step: &str) -> CalResult<&'a CalibrationFrame> {
    calib.ok_or_else(|| CalError::MissingCalibration(step.to_string()))
}

fn overscan_specs() -> Vec<ParamSpec> {
    vec![
        ParamSpec::boolean("clamp_negative", true)
            .aliases(&["clampNegative"])
            .describe("Clamp negative output pixels at zero"),
        ParamSpec::int("overscan_x", 0).min(0.0).aliases(&["overscanX"]),
        ParamSpec::int("overscan_y", 0).min(0.0).aliases(&["overscanY"]),
        ParamSpec::int("overscan_width", 50)
            .range(1.0, 1_000_000.0)
            .aliases(&["overscanWidth"]),
        ParamSpec::int("overscan_height", 50)
            .range(1.0, 1_000_000.0)
            .aliases(&["overscanHeight"]),
        ParamSpec::float("sigma_clip_k", 3.0)
            .range(0.5, 10.0)
            .aliases(&["sigmaClipK", "sigma_clipping_threshold"])
            .describe("Sigma-clipping threshold for the overscan level"),
        ParamSpec::int("max_iter", 5).range(0.0, 100.0).aliases(&["maxIter"]),
    ]
}

/// Bias subtraction, plain or with outlier rejection
pub struct BiasStep {
    descriptor: AlgorithmDescriptor,
    robust: bool,
}

impl BiasStep {
    pub fn standard() -> Self {
        let mut descriptor = AlgorithmDescriptor::new(
            StepType::BiasSubtraction,
            "default",
            "Standard bias subtraction",
            "1.0",
            Stability::Stable,
        )
        .describe("Subtract a master bias frame, or a sigma-clipped overscan level");
        descriptor.params = overscan_specs();
        Self {
            descriptor,
            robust: false,
        }
    }

    pub fn robust() -> Self {
        let mut descriptor = AlgorithmDescriptor::new(
            StepType::BiasSubtraction,
            "robust-bias",
            "Robust bias subtraction",
            "1.1",
            Stability::Stable,
        )
        .describe("Bias subtraction with outlier rejection in the bias frame or overscan");
        descriptor.params = overscan_specs();
        descriptor = descriptor
            .param(ParamSpec::boolean("outlier_rejection", true).aliases(&["outlierRejection"]))
            .param(
                ParamSpec::choice("rejection_method", "sigma", &["sigma", "mad", "percentile"])
                    .aliases(&["rejectionMethod"]),
            )
            .param(
                ParamSpec::float("rejection_threshold", 3.0)
                    .range(0.0, 49.0)
                    .aliases(&["rejectionThreshold"]),
            );
        Self {
            descriptor,
            robust: true,
        }
    }
}

impl StepAlgorithm for BiasStep {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn apply(&self, input: StepInput<'_>) -> CalResult<StepResult> {
        let p = Params(input.params);
        let rejection = if self.robust && p.bool("outlier_rejection")? {
            let method = p.str("rejection_method")?;
            Some(RejectionParams {
                method: RejectionMethod::parse(method).ok_or_else(|| CalError::ParameterOutOfRange {
                    name: "rejection_method".to_string(),
                    message: format!("unknown method '{}'", method),
                })?,
                threshold: p.f64("rejection_threshold")?,
            })
        } else {
            None
        };
        let params = BiasParams {
            clamp_negative: p.bool("clamp_negative")?,
            overscan: OverscanRegion {
                x: p.usize("overscan_x")?,
                y: p.usize("overscan_y")?,
                width: p.usize("overscan_width")?,
                height: p.usize("overscan_height")?,
            },
            clip: ClipParams {
                k: p.f64("sigma_clip_k")?,
                max_iter: p.usize("max_iter")?,
            },
            rejection,
        };

        let bias = BiasSubtractor::with_params(params)
            .with_tiles(input.tiles)
            .subtract(input.image, input.calib.map(|c| &c.image))?;

        let mut result = StepResult::new(bias.image);
        result.number("bias_level", bias.bias_level);
        result.text(
            "bias_source",
            match bias.source {
                BiasSource::Frame => "frame",
                BiasSource::Overscan => "overscan",
            },
        );
        result.count("clamped_pixels", bias.clamped_pixels);
        if self.robust {
            result.count("rejected_pixels", bias.rejected_pixels);
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DarkVariant {
    Default,
    Scaled,
    Adaptive,
}

fn scale_bound_specs() -> [ParamSpec; 2] {
    [
        ParamSpec::float("min_scale", 0.1)
            .range(1e-6, 100.0)
            .aliases(&["minScale"]),
        ParamSpec::float("max_scale", 10.0)
            .range(1e-6, 1000.0)
            .aliases(&["maxScale"]),
    ]
}

/// Dark subtraction with fixed, exposure-scaled or window-fitted scale
pub struct DarkStep {
    descriptor: AlgorithmDescriptor,
    variant: DarkVariant,
}

impl DarkStep {
    pub fn new(variant: DarkVariant) -> Self {
        let descriptor = match variant {
            DarkVariant::Default | DarkVariant::Scaled => {
                let (id, name, version, auto) = if variant == DarkVariant::Default {
                    ("default", "Standard dark subtraction", "1.0", false)
                } else {
                    ("scaled-dark", "Exposure-scaled dark subtraction", "1.1", true)
                };
                let [min_scale, max_scale] = scale_bound_specs();
                AlgorithmDescriptor::new(StepType::DarkSubtraction, id, name, version, Stability::Stable)
                    .describe("Subtract a master dark, optionally scaled by the exposure ratio")
                    .param(
                        ParamSpec::float("scale_factor", 1.0)
                            .range(0.0, 100.0)
                            .aliases(&["scaleFactor"]),
                    )
                    .param(ParamSpec::boolean("auto_scale", auto).aliases(&["autoScale"]))
                    .param(min_scale)
                    .param(max_scale)
            }
            DarkVariant::Adaptive => {
                let [min_scale, max_scale] = scale_bound_specs();
                AlgorithmDescriptor::new(
                    StepType::DarkSubtraction,
                    "adaptive-dark",
                    "Adaptive dark subtraction",
                    "2.0",
                    Stability::Experimental,
                )
                .describe("Fit the dark scale per window against the science frame")
                .param(
                    ParamSpec::int("window_size", 64)
                        .range(4.0, 4096.0)
                        .aliases(&["windowSize"]),
                )
                .param(
                    ParamSpec::float("adaptive_threshold", 3.0)
                        .range(0.5, 20.0)
                        .aliases(&["adaptiveThreshold"]),
                )
                .param(ParamSpec::boolean("preserve_stars", true).aliases(&["preserveStars"]))
                .param(min_scale)
                .param(max_scale)
            }
        };
        Self { descriptor, variant }
    }
}

impl StepAlgorithm for DarkStep {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn requires_calibration(&self) -> bool {
        true
    }

    fn apply(&self, input: StepInput<'_>) -> CalResult<StepResult> {
        let dark = require_calib(input.calib, "dark-subtraction")?;
        let p = Params(input.params);
        let subtractor = DarkSubtractor::with_params(DarkParams {
            scale_factor: if self.variant == DarkVariant::Adaptive {
                1.0
            } else {
                p.f64("scale_factor")?
            },
            auto_scale: self.variant != DarkVariant::Adaptive && p.bool("auto_scale")?,
            min_scale: p.f64("min_scale")?,
            max_scale: p.f64("max_scale")?,
        })
        .with_tiles(input.tiles);

        let dark_result = match self.variant {
            DarkVariant::Adaptive => {
                let params = AdaptiveDarkParams {
                    window_size: p.usize("window_size")?,
                    adaptive_threshold: p.f64("adaptive_threshold")?,
                    preserve_stars: p.bool("preserve_stars")?,
                    min_scale: p.f64("min_scale")?,
                    max_scale: p.f64("max_scale")?,
                };
                subtractor.subtract_adaptive(input.image, input.header, dark, &params)?
            }
            _ => subtractor.subtract(input.image, input.header, dark)?,
        };

        let mut result = StepResult::new(dark_result.image);
        result.number("scale_factor", dark_result.scale_factor);
        if let Some(ratio) = dark_result.exposure_ratio {
            result.number("exposure_ratio", ratio);
        }
        if dark_result.clamped {
            result.warnings.push(format!(
                "exposure ratio clamped to scale factor {}",
                dark_result.scale_factor
            ));
        }
        if let Some((lo, hi)) = dark_result.window_scale_range {
            result.number("window_scale_min", lo);
            result.number("window_scale_max", hi);
        }
        Ok(result)
    }
}

/// Flat-field correction, optionally after removing the illumination pattern
pub struct FlatStep {
    descriptor: AlgorithmDescriptor,
    illumination: bool,
}

impl FlatStep {
    fn base(id: &str, name: &str, version: &str) -> AlgorithmDescriptor {
        AlgorithmDescriptor::new(StepType::FlatCorrection, id, name, version, Stability::Stable)
            .param(ParamSpec::boolean("post_smooth", true).aliases(&["postSmooth"]))
            .param(ParamSpec::boolean("apply_gain", false).aliases(&["applyGain"]))
            .param(ParamSpec::boolean("outlier_rejection", false).aliases(&["outlierRejection"]))
            .param(
                ParamSpec::float("rejection_sigma", 5.0)
                    .range(1.0, 50.0)
                    .aliases(&["rejectionSigma"]),
            )
    }

    pub fn standard() -> Self {
        Self {
            descriptor: Self::base("default", "Standard flat-field correction", "1.0")
                .describe("Divide by the mode- or median-normalized master flat"),
            illumination: false,
        }
    }

    pub fn illumination_corrected() -> Self {
        Self {
            descriptor: Self::base("illumination-corrected", "Illumination-corrected flat", "1.2")
                .describe("Remove a polynomial illumination surface from the flat before normalizing")
                .param(
                    ParamSpec::int("polynomial_degree", 3)
                        .range(0.0, 5.0)
                        .aliases(&["polynomialDegree"]),
                )
                .param(ParamSpec::boolean("mask_stars", true).aliases(&["maskStars"]))
                .param(
                    ParamSpec::float("star_mask_sigma", 3.0)
                        .range(0.5, 20.0)
                        .aliases(&["starMaskSigma"]),
                ),
            illumination: true,
        }
    }
}

impl StepAlgorithm for FlatStep {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn requires_calibration(&self) -> bool {
        true
    }

    fn apply(&self, input: StepInput<'_>) -> CalResult<StepResult> {
        let flat = require_calib(input.calib, "flat-correction")?;
        let p = Params(input.params);
        let illumination = if self.illumination {
            Some(IlluminationParams {
                polynomial_degree: p.usize("polynomial_degree")?,
                mask_stars: p.bool("mask_stars")?,
                star_mask_sigma: p.f64("star_mask_sigma")?,
            })
        } else {
            None
        };
        let params = FlatParams {
            post_smooth: p.bool("post_smooth")?,
            apply_gain: p.bool("apply_gain")?,
            outlier_rejection: p.bool("outlier_rejection")?,
            rejection_sigma: p.f64("rejection_sigma")?,
            illumination,
        };

        let flat_result = FlatCorrector::with_params(params)
            .with_tiles(input.tiles)
            .correct(input.image, input.header, &flat.image)?;

        let mut result = StepResult::new(flat_result.image);
        result.text("normalization", flat_result.normalization.as_str());
        result.number("value", flat_result.normalization_value);
        result.number("flat_median", flat_result.flat_median);
        result.number("flat_mode", flat_result.flat_mode);
        result.number("gain", flat_result.gain);
        result.count("bad_pixels", flat_result.bad_pixels);
        result.count("outliers_replaced", flat_result.outliers_replaced);
        if flat_result.bad_pixels > 0 {
            result.warnings.push(format!(
                "{} bad flat pixels replaced by {:.4}",
                flat_result.bad_pixels, flat_result.replacement_value
            ));
        }
        Ok(result)
    }
}

fn cosmic_result(cr: CosmicRayResult) -> StepResult {
    let mut result = StepResult::new(cr.image);
    result.count("cosmic_rays_detected", cr.flagged.len());
    result.count("iterations", cr.iterations);
    result.number("noise_sigma", cr.noise_sigma);
    result.count("masked_pixels", cr.masked_pixels);
    result
        .metrics
        .insert("cosmic_ray_pixels".to_string(), MetricValue::Pixels(cr.flagged));
    result
}

/// Laplacian cosmic-ray detector, classic or with star pre-mask
pub struct LaCosmicStep {
    descriptor: AlgorithmDescriptor,
    enhanced: bool,
}

impl LaCosmicStep {
    fn base(id: &str, name: &str, version: &str, sigma_clip: f64) -> AlgorithmDescriptor {
        AlgorithmDescriptor::new(StepType::CosmicRayRemoval, id, name, version, Stability::Stable)
            .param(
                ParamSpec::float("sigma_clip", sigma_clip)
                    .range(0.1, 100.0)
                    .aliases(&["sigclip", "sigmaClip"])
                    .describe("Laplacian detection threshold in noise sigma"),
            )
            .param(
                ParamSpec::float("obj_lim", 5.0)
                    .range(0.1, 100.0)
                    .aliases(&["objlim", "objLim"])
                    .describe("Minimum contrast against the local neighbourhood"),
            )
            .param(
                ParamSpec::float("sigma_frac", 0.3)
                    .range(0.01, 10.0)
                    .aliases(&["sigfrac", "sigmaFrac"]),
            )
            .param(
                ParamSpec::int("max_iter", 4)
                    .range(0.0, 100.0)
                    .aliases(&["niter", "maxIter"]),
            )
    }

    pub fn classic() -> Self {
        Self {
            descriptor: Self::base("lacosmic", "L.A.Cosmic", "1.0", 5.0)
                .describe("Iterative Laplacian edge detection with contrast test"),
            enhanced: false,
        }
    }

    pub fn enhanced() -> Self {
        Self {
            descriptor: Self::base("lacosmic-v2", "L.A.Cosmic with star preservation", "2.0", 4.5)
                .describe("Laplacian detector that never touches pixels inside a star pre-mask")
                .param(ParamSpec::boolean("star_preservation", true).aliases(&["starPreservation"]))
                .param(
                    ParamSpec::float("star_threshold", 5.0)
                        .range(0.5, 100.0)
                        .aliases(&["starThreshold"]),
                )
                .param(
                    ParamSpec::int("star_mask_radius", 1)
                        .range(0.0, 10.0)
                        .aliases(&["starMaskRadius"]),
                )
                .param(ParamSpec::boolean("edge_handling", true).aliases(&["edgeHandling"])),
            enhanced: true,
        }
    }
}

impl StepAlgorithm for LaCosmicStep {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn apply(&self, input: StepInput<'_>) -> CalResult<StepResult> {
        let p = Params(input.params);
        let mut remover = CosmicRayRemover::with_params(CosmicRayParams {
            sigma_clip: p.f64("sigma_clip")?,
            obj_lim: p.f64("obj_lim")?,
            sigma_frac: p.f64("sigma_frac")?,
            max_iter: p.usize("max_iter")?,
        })
        .with_tiles(input.tiles);

        if self.enhanced {
            if p.bool("star_preservation")? {
                remover = remover.with_star_mask(StarMaskParams {
                    star_threshold: p.f64("star_threshold")?,
                    star_mask_radius: p.usize("star_mask_radius")?,
                });
            }
            remover = remover.with_edge_handling(p.bool("edge_handling")?);
        }

        let cr = remover.remove(input.image, input.checkpoint)?;
        Ok(cosmic_result(cr))
    }
}

/// Median-filter residual detector
pub struct MedianFilterStep {
    descriptor: AlgorithmDescriptor,
}

impl MedianFilterStep {
    pub fn new() -> Self {
        let descriptor = AlgorithmDescriptor::new(
            StepType::CosmicRayRemoval,
            "median-filter",
            "Median filter cosmic-ray removal",
            "1.0",
            Stability::Stable,
        )
        .describe("Replace pixels far above their median-filtered value")
        .param(
            ParamSpec::int("kernel_size", 5)
                .range(3.0, 15.0)
                .aliases(&["kernelSize"])
                .describe("Odd kernel width"),
        )
        .param(ParamSpec::float("threshold", 5.0).range(0.5, 100.0))
        .param(ParamSpec::int("iterations", 1).range(0.0, 20.0).aliases(&["niter"]));
        Self { descriptor }
    }
}

impl Default for MedianFilterStep {
    fn default() -> Self {
        Self::new()
    }
}

impl StepAlgorithm for MedianFilterStep {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn validate(&self, params: &ParamMap, strict: bool) -> CalResult<ResolvedParams> {
        let resolved = self.descriptor.resolve_params(params, strict)?;
        let kernel = Params(&resolved.params).usize("kernel_size")?;
        if kernel % 2 == 0 {
            return Err(CalError::ParameterOutOfRange {
                name: "kernel_size".to_string(),
                message: format!("kernel size must be odd, got {}", kernel),
            });
        }
        Ok(resolved)
    }

    fn apply(&self, input: StepInput<'_>) -> CalResult<StepResult> {
        let p = Params(input.params);
        let remover = MedianFilterRemover::new(MedianFilterParams {
            kernel_size: p.usize("kernel_size")?,
            threshold: p.f64("threshold")?,
            iterations: p.usize("iterations")?,
        })
        .with_tiles(input.tiles);

        let cr = remover.remove(input.image, input.checkpoint)?;
        Ok(cosmic_result(cr))
    }
}

/// Catalogued variant without a runnable implementation
pub struct UnsupportedStep {
    descriptor: AlgorithmDescriptor,
}

impl UnsupportedStep {
    pub fn neural_cr() -> Self {
        Self {
            descriptor: AlgorithmDescriptor::new(
                StepType::CosmicRayRemoval,
                "neural-cr",
                "Neural network cosmic-ray detection",
                "0.1",
                Stability::Experimental,
            )
            .describe("Requires a trained model, which this build does not ship")
            .param(
                ParamSpec::float("confidence_threshold", 0.5)
                    .range(0.0, 1.0)
                    .aliases(&["confidenceThreshold"]),
            )
            .unsupported(),
        }
    }
}

impl StepAlgorithm for UnsupportedStep {
    fn descriptor(&self) -> &AlgorithmDescriptor {
        &self.descriptor
    }

    fn apply(&self, _input: StepInput<'_>) -> CalResult<StepResult> {
        Err(CalError::AlgorithmUnsupported(self.descriptor.id.clone()))
    }
}
