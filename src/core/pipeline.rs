//! Step sequencing: threads a frame through registered algorithms, stamps the
//! header, persists snapshots and assembles the measurement record.

use crate::context::ProcessingContext;
use crate::core::calibrate::CalibrationFrame;
use crate::core::filters;
use crate::core::parallel::TileConfig;
use crate::core::quality::QualityAnalyzer;
use crate::core::steps::{Checkpoint, StepInput};
use crate::io::fits::FrameCodec;
use crate::io::storage::{intermediate_key, FrameStore};
use crate::registry::algorithms::AlgorithmRegistry;
use crate::types::{
    format_params, CalError, CalResult, ErrorKind, FrameImage, Header, MeasurementRecord, MetricValue, ParamMap,
    ParamValue, StepOutcome, StepStatus, StepType, WorkflowStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

fn default_algorithm() -> String {
    "default".to_string()
}

/// One entry of a composite run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_type: StepType,
    #[serde(default = "default_algorithm")]
    pub algorithm_id: String,
    #[serde(default)]
    pub params: ParamMap,
    /// Key of the calibration frame in the library or store
    #[serde(default)]
    pub calib_key: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl StepSpec {
    pub fn new(step_type: StepType, algorithm_id: &str) -> Self {
        Self {
            step_type,
            algorithm_id: algorithm_id.to_string(),
            params: ParamMap::new(),
            calib_key: None,
            optional: false,
        }
    }

    pub fn with_param<V: Into<ParamValue>>(mut self, name: &str, value: V) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn with_calib_key(mut self, key: &str) -> Self {
        self.calib_key = Some(key.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Calibration frames supplied in memory, by key
pub type CalibrationLibrary = BTreeMap<String, CalibrationFrame>;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Unknown parameter names fail instead of being dropped
    pub strict: bool,
    pub persist_intermediate: bool,
    pub tiles: TileConfig,
    pub checkpoint: Checkpoint,
    pub compute_quality: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            strict: true,
            persist_intermediate: false,
            tiles: TileConfig::default(),
            checkpoint: Checkpoint::default(),
            compute_quality: true,
        }
    }
}

/// Output of a composite run
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub image: FrameImage,
    pub header: Header,
    pub record: MeasurementRecord,
}

pub struct PipelineDriver<'a> {
    registry: &'a AlgorithmRegistry,
    storage: Option<&'a dyn FrameStore>,
    codec: FrameCodec,
    analyzer: QualityAnalyzer,
    options: DriverOptions,
}

impl<'a> PipelineDriver<'a> {
    pub fn new(registry: &'a AlgorithmRegistry) -> Self {
        Self::with_options(registry, DriverOptions::default())
    }

    pub fn with_options(registry: &'a AlgorithmRegistry, options: DriverOptions) -> Self {
        Self {
            registry,
            storage: None,
            codec: FrameCodec::new(),
            analyzer: QualityAnalyzer::new().with_tiles(options.tiles),
            options,
        }
    }

    pub fn with_storage(mut self, storage: &'a dyn FrameStore) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    /// Run a single step; any failure is returned as the error
    pub fn run_step(
        &self,
        ctx: &ProcessingContext,
        image: FrameImage,
        header: Header,
        spec: &StepSpec,
        calib: Option<&CalibrationFrame>,
    ) -> CalResult<(FrameImage, Header, StepOutcome)> {
        self.check_storage()?;
        let (outcome, result) = self.execute(ctx, 0, &image, &header, spec, calib);
        let (image, mut header) = result?;
        stamp_context(&mut header, ctx);
        header.set_str("STEPTYPE", spec.step_type.as_str(), Some("calibration step"));
        header.set_str("ALGORITHM", &outcome.algorithm_id, Some("algorithm id"));
        header.set_float(
            "STEPTIME",
            outcome.duration_ms as f64 / 1000.0,
            Some("[s] step wall time"),
        );
        Ok((image, header, outcome))
    }

    /// Run `steps` in order; step failures are reported in the record
    pub fn run_workflow(
        &self,
        ctx: &ProcessingContext,
        image: FrameImage,
        header: Header,
        steps: &[StepSpec],
        library: &CalibrationLibrary,
        workflow: Option<(String, String)>,
    ) -> CalResult<WorkflowRun> {
        self.check_storage()?;
        log::info!(
            "Starting workflow of {} steps for context {}",
            steps.len(),
            ctx.id
        );
        let start = Instant::now();

        let mut image = image;
        let mut header = header;
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut status = WorkflowStatus::Succeeded;

        for (index, spec) in steps.iter().enumerate() {
            if let Err(e) = self.options.checkpoint.check() {
                log::warn!("Stopping before step {} ({}): {}", index, spec.step_type, e);
                status = interrupted_status(e.kind()).unwrap_or(WorkflowStatus::Failed);
                break;
            }

            let calib = match self.resolve_calibration(spec, library) {
                Ok(c) => c,
                Err(e) => {
                    let outcome = self.failed_outcome(ctx, index, spec, &e);
                    if let Some(s) = self.record_failure(spec, outcome, &mut outcomes, e) {
                        status = s;
                        break;
                    }
                    continue;
                }
            };

            let (outcome, result) = self.execute(ctx, index, &image, &header, spec, calib.as_ref());
            match result {
                Ok((next_image, next_header)) => {
                    image = next_image;
                    header = next_header;
                    outcomes.push(outcome);
                }
                Err(e) => {
                    if let Some(s) = self.record_failure(spec, outcome, &mut outcomes, e) {
                        status = s;
                        break;
                    }
                }
            }
        }

        if status == WorkflowStatus::Succeeded && outcomes.iter().any(|o| o.status == StepStatus::Skipped) {
            status = WorkflowStatus::PartiallySucceeded;
        }

        let quality = if self.options.compute_quality
            && matches!(status, WorkflowStatus::Succeeded | WorkflowStatus::PartiallySucceeded)
        {
            match self.analyzer.analyze(&image) {
                Ok(q) => Some(q),
                Err(e) => {
                    log::warn!("Quality metrics unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let cosmic_ray_count: u64 = outcomes
            .iter()
            .filter(|o| o.status == StepStatus::Succeeded)
            .filter_map(|o| match o.metrics.get("cosmic_rays_detected") {
                Some(MetricValue::Count(n)) => Some(*n),
                _ => None,
            })
            .sum();

        stamp_context(&mut header, ctx);
        for (key, step_type) in [
            ("BIASSUB", StepType::BiasSubtraction),
            ("DARKSUB", StepType::DarkSubtraction),
            ("FLATCOR", StepType::FlatCorrection),
            ("CRREMOV", StepType::CosmicRayRemoval),
        ] {
            let done = outcomes
                .iter()
                .any(|o| o.step_type == step_type && o.status == StepStatus::Succeeded);
            header.set_bool(key, done, None);
        }
        header.set_int("NCOSMIC", cosmic_ray_count as i64, Some("cosmic-ray pixels replaced"));
        if let Some(q) = &quality {
            header.set_float("QUALITY", q.quality_score, Some("combined quality score"));
        }

        let record = MeasurementRecord {
            context_id: ctx.id.clone(),
            status,
            workflow,
            quality,
            cosmic_ray_count,
            steps: outcomes,
            total_duration_ms: start.elapsed().as_millis() as u64,
        };
        log::info!(
            "Workflow finished with status {:?} in {} ms",
            record.status,
            record.total_duration_ms
        );
        Ok(WorkflowRun { image, header, record })
    }

    fn check_storage(&self) -> CalResult<()> {
        if self.options.persist_intermediate && self.storage.is_none() {
            return Err(CalError::InvalidConfig(
                "persist_intermediate requires a frame store".to_string(),
            ));
        }
        Ok(())
    }

    /// Push a failed outcome; returns the terminal workflow status, or `None` to continue
    fn record_failure(
        &self,
        spec: &StepSpec,
        mut outcome: StepOutcome,
        outcomes: &mut Vec<StepOutcome>,
        error: CalError,
    ) -> Option<WorkflowStatus> {
        if let Some(status) = interrupted_status(error.kind()) {
            outcomes.push(outcome);
            return Some(status);
        }
        if spec.optional {
            log::warn!("Optional step {} skipped: {}", spec.step_type, error);
            outcome.status = StepStatus::Skipped;
            outcomes.push(outcome);
            None
        } else {
            log::error!("Required step {} failed: {}", spec.step_type, error);
            outcomes.push(outcome);
            Some(WorkflowStatus::Failed)
        }
    }

    fn resolve_calibration(
        &self,
        spec: &StepSpec,
        library: &CalibrationLibrary,
    ) -> CalResult<Option<CalibrationFrame>> {
        let key = match &spec.calib_key {
            Some(key) => key,
            None => return Ok(None),
        };
        if let Some(frame) = library.get(key) {
            return Ok(Some(frame.clone()));
        }
        let storage = self
            .storage
            .ok_or_else(|| CalError::MissingCalibration(format!("{} ({})", spec.step_type, key)))?;
        let bytes = storage.get(key)?;
        let bytes = crate::io::fits::maybe_decompress(&bytes)?;
        let (image, header) = self.codec.decode(&bytes)?;
        log::debug!("Loaded calibration frame {} from storage", key);
        Ok(Some(CalibrationFrame::new(image, header)))
    }

    fn blank_outcome(&self, ctx: &ProcessingContext, index: usize, spec: &StepSpec) -> StepOutcome {
        let now = Utc::now();
        StepOutcome {
            step_id: format!("{}-{}", ctx.id, index),
            step_type: spec.step_type,
            algorithm_id: spec.algorithm_id.clone(),
            algorithm_version: String::new(),
            status: StepStatus::Failed,
            params: spec.params.clone(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            bytes_read: 0,
            bytes_written: 0,
            warnings: Vec::new(),
            metrics: BTreeMap::new(),
            error: None,
            storage_key: None,
            next_steps: spec.step_type.next_steps(),
        }
    }

    fn failed_outcome(&self, ctx: &ProcessingContext, index: usize, spec: &StepSpec, error: &CalError) -> StepOutcome {
        let mut outcome = self.blank_outcome(ctx, index, spec);
        outcome.error = Some(error.failure());
        outcome
    }

    /// Run one step against a copy of `image`; the outcome is filled either way
    fn execute(
        &self,
        ctx: &ProcessingContext,
        index: usize,
        image: &FrameImage,
        header: &Header,
        spec: &StepSpec,
        calib: Option<&CalibrationFrame>,
    ) -> (StepOutcome, CalResult<(FrameImage, Header)>) {
        let mut outcome = self.blank_outcome(ctx, index, spec);
        let start = Instant::now();
        log::info!("Running {} ({}) as {}", spec.step_type, spec.algorithm_id, outcome.step_id);

        let result = self.apply_step(ctx, index, image, header, spec, calib, &mut outcome);

        outcome.finished_at = Utc::now();
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                outcome.status = StepStatus::Succeeded;
                log::info!(
                    "Step {} {} finished in {} ms",
                    spec.step_type,
                    outcome.algorithm_id,
                    outcome.duration_ms
                );
            }
            Err(e) => {
                outcome.status = StepStatus::Failed;
                outcome.error = Some(e.failure());
            }
        }
        (outcome, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_step(
        &self,
        ctx: &ProcessingContext,
        index: usize,
        image: &FrameImage,
        header: &Header,
        spec: &StepSpec,
        calib: Option<&CalibrationFrame>,
        outcome: &mut StepOutcome,
    ) -> CalResult<(FrameImage, Header)> {
        self.options.checkpoint.check()?;

        let algorithm = self.registry.get(spec.step_type, &spec.algorithm_id)?;
        let descriptor = algorithm.descriptor();
        outcome.algorithm_id = descriptor.id.clone();
        outcome.algorithm_version = descriptor.version.clone();
        if !descriptor.supported {
            return Err(CalError::AlgorithmUnsupported(descriptor.id.clone()));
        }

        let resolved = algorithm.validate(&spec.params, self.options.strict)?;
        outcome.params = resolved.params.clone();
        outcome.warnings.extend(resolved.warnings);
        log::debug!("Parameters: {}", format_params(&outcome.params));

        let (height, width) = image.dim();
        let pixel_bytes = (height * width * std::mem::size_of::<f32>()) as u64;
        let calib_bytes = calib
            .map(|c| (c.image.len() * std::mem::size_of::<f32>()) as u64)
            .unwrap_or(0);
        outcome.bytes_read = pixel_bytes + calib_bytes;

        let (input, repaired) = filters::repair_non_finite(image.clone(), self.options.tiles);
        if repaired > 0 {
            outcome
                .warnings
                .push(format!("{} non-finite input pixels replaced", repaired));
        }

        let repaired_calib = match calib {
            Some(frame) if frame.image.iter().any(|v| !v.is_finite()) => {
                let (fixed, count) = filters::repair_non_finite(frame.image.clone(), self.options.tiles);
                outcome
                    .warnings
                    .push(format!("{} non-finite calibration pixels replaced", count));
                Some(CalibrationFrame::new(fixed, frame.header.clone()))
            }
            _ => None,
        };
        let calib = repaired_calib.as_ref().or(calib);

        let result = algorithm.apply(StepInput {
            image: input,
            header,
            params: &outcome.params,
            calib,
            tiles: self.options.tiles,
            checkpoint: &self.options.checkpoint,
        })?;

        if result.image.dim() != (height, width) {
            return Err(CalError::DimensionMismatch(format!(
                "{} returned {:?} for a {}x{} frame",
                descriptor.id,
                result.image.dim(),
                width,
                height
            )));
        }
        let non_finite = result.image.iter().filter(|v| !v.is_finite()).count();
        if non_finite > 0 {
            return Err(CalError::NumericDegenerate(format!(
                "{} produced {} non-finite pixels",
                descriptor.id, non_finite
            )));
        }
        outcome.metrics = result.metrics;
        outcome.warnings.extend(result.warnings);

        let mut out_header = header.clone();
        out_header.mark_float_output();
        out_header.add_history(&format!(
            "astrocal: {} {} v{} ({})",
            spec.step_type,
            descriptor.id,
            descriptor.version,
            format_params(&outcome.params)
        ));

        outcome.bytes_written = pixel_bytes;
        if self.options.persist_intermediate {
            if let Some(storage) = self.storage {
                let key = intermediate_key(&ctx.storage_prefix(), spec.step_type, index, &descriptor.id);
                let bytes = self.codec.encode(&result.image, &out_header)?;
                storage.put(&key, &bytes)?;
                log::debug!("Persisted intermediate frame {}", key);
                outcome.bytes_written = bytes.len() as u64;
                outcome.storage_key = Some(key);
            }
        }

        Ok((result.image, out_header))
    }
}

fn interrupted_status(kind: ErrorKind) -> Option<WorkflowStatus> {
    match kind {
        ErrorKind::Cancelled => Some(WorkflowStatus::Cancelled),
        ErrorKind::DeadlineExceeded => Some(WorkflowStatus::TimedOut),
        _ => None,
    }
}

/// Write the processing-context cards
pub fn stamp_context(header: &mut Header, ctx: &ProcessingContext) {
    header.set_str("PROCID", &ctx.id, Some("processing context id"));
    header.set_str("PROCTYPE", ctx.processing_type.as_str(), Some("processing type"));
    header.set_str("PIPEVER", &ctx.pipeline_version, Some("pipeline version"));
    header.set_timestamp("PROCDATE", ctx.created_at, Some("context creation time"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::steps::CancellationToken;
    use crate::io::storage::MemoryStore;
    use ndarray::Array2;

    fn frame(value: f32) -> (FrameImage, Header) {
        (Array2::from_elem((8, 8), value), Header::for_image(8, 8))
    }

    #[test]
    fn test_run_step_stamps_header() {
        let registry = AlgorithmRegistry::new();
        let driver = PipelineDriver::new(&registry);
        let ctx = ProcessingContext::test("s");
        let (image, header) = frame(40.0);

        let spec = StepSpec::new(StepType::BiasSubtraction, "default");
        let (out, header, outcome) = driver.run_step(&ctx, image, header, &spec, None).unwrap();

        assert!(out.iter().all(|&v| v == 0.0));
        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.step_id, format!("{}-0", ctx.id));
        assert_eq!(header.get_str("PROCID"), Some(ctx.id.as_str()));
        assert_eq!(header.get_str("STEPTYPE"), Some("bias-subtraction"));
        assert!(header.history()[0].starts_with("astrocal: bias-subtraction default v1.0"));
    }

    #[test]
    fn test_optional_failure_is_skipped() {
        let registry = AlgorithmRegistry::new();
        let driver = PipelineDriver::new(&registry);
        let ctx = ProcessingContext::test("s");
        let (image, header) = frame(10.0);

        let steps = vec![
            StepSpec::new(StepType::DarkSubtraction, "default").optional(),
            StepSpec::new(StepType::BiasSubtraction, "default").with_param("clamp_negative", false),
        ];
        let run = driver
            .run_workflow(&ctx, image, header, &steps, &CalibrationLibrary::new(), None)
            .unwrap();

        assert_eq!(run.record.status, WorkflowStatus::PartiallySucceeded);
        assert_eq!(run.record.steps[0].status, StepStatus::Skipped);
        assert_eq!(
            run.record.steps[0].error.as_ref().map(|e| e.kind),
            Some(ErrorKind::MissingCalibration)
        );
        assert_eq!(run.header.get_bool("DARKSUB"), Some(false));
        assert_eq!(run.header.get_bool("BIASSUB"), Some(true));
    }

    #[test]
    fn test_required_failure_stops() {
        let registry = AlgorithmRegistry::new();
        let driver = PipelineDriver::new(&registry);
        let ctx = ProcessingContext::test("s");
        let (image, header) = frame(10.0);

        let steps = vec![
            StepSpec::new(StepType::FlatCorrection, "default"),
            StepSpec::new(StepType::BiasSubtraction, "default"),
        ];
        let run = driver
            .run_workflow(&ctx, image.clone(), header, &steps, &CalibrationLibrary::new(), None)
            .unwrap();
        assert_eq!(run.record.status, WorkflowStatus::Failed);
        assert_eq!(run.record.steps.len(), 1);
        assert!(run.record.quality.is_none());
        assert_eq!(run.image, image);
    }

    #[test]
    fn test_cancel_before_first_step() {
        let registry = AlgorithmRegistry::new();
        let token = CancellationToken::new();
        token.cancel();
        let options = DriverOptions {
            checkpoint: Checkpoint::new(token, None),
            ..DriverOptions::default()
        };
        let driver = PipelineDriver::with_options(&registry, options);
        let ctx = ProcessingContext::test("s");
        let (image, header) = frame(5.0);
        let steps = vec![StepSpec::new(StepType::BiasSubtraction, "default")];

        let run = driver
            .run_workflow(&ctx, image.clone(), header, &steps, &CalibrationLibrary::new(), None)
            .unwrap();
        assert_eq!(run.record.status, WorkflowStatus::Cancelled);
        assert!(run.record.steps.is_empty());
        assert_eq!(run.image, image);
    }

    #[test]
    fn test_persist_intermediate() {
        let registry = AlgorithmRegistry::new();
        let store = MemoryStore::new();
        let options = DriverOptions {
            persist_intermediate: true,
            ..DriverOptions::default()
        };
        let driver = PipelineDriver::with_options(&registry, options).with_storage(&store);
        let ctx = ProcessingContext::test("s");
        let (image, header) = frame(5.0);
        let spec = StepSpec::new(StepType::BiasSubtraction, "default");

        let (_, _, outcome) = driver.run_step(&ctx, image, header, &spec, None).unwrap();
        let key = outcome.storage_key.unwrap();
        assert!(key.starts_with(&format!("{}/bias-subtraction/", ctx.storage_prefix())));
        assert_eq!(store.len(), 1);
        assert_eq!(outcome.bytes_written, store.get(&key).unwrap().len() as u64);
    }

    #[test]
    fn test_persist_without_store_rejected() {
        let registry = AlgorithmRegistry::new();
        let options = DriverOptions {
            persist_intermediate: true,
            ..DriverOptions::default()
        };
        let driver = PipelineDriver::with_options(&registry, options);
        let ctx = ProcessingContext::test("s");
        let (image, header) = frame(5.0);
        let spec = StepSpec::new(StepType::BiasSubtraction, "default");
        assert!(matches!(
            driver.run_step(&ctx, image, header, &spec, None),
            Err(CalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_step_spec_deserializes_with_defaults() {
        let spec: StepSpec = serde_json::from_str(r#"{"step_type": "flat-correction"}"#).unwrap();
        assert_eq!(spec.algorithm_id, "default");
        assert!(!spec.optional);
        assert!(spec.params.is_empty());
    }
}
