//! Host-facing entry points over the codec, registries and pipeline driver.

use crate::config::EngineConfig;
use crate::context::{ProcessingContext, ProcessingType};
use crate::core::calibrate::CalibrationFrame;
use crate::core::parallel::TileConfig;
use crate::core::pipeline::{CalibrationLibrary, DriverOptions, PipelineDriver, StepSpec, WorkflowRun};
use crate::core::quality::QualityAnalyzer;
use crate::core::steps::{CancellationToken, Checkpoint};
use crate::io::fits::{self, FrameCodec};
use crate::io::storage::FrameStore;
use crate::registry::algorithms::{AlgorithmDescriptor, AlgorithmRegistry, StabilityFilter};
use crate::registry::workflows::{WorkflowMetrics, WorkflowRegistry, WorkflowVersion};
use crate::types::{CalError, CalResult, FrameImage, Header, ParamMap, QualityMetrics, StepOutcome, StepType};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Library keys the composite looks up for each master frame
pub const BIAS_KEY: &str = "bias";
pub const DARK_KEY: &str = "dark";
pub const FLAT_KEY: &str = "flat";

/// Where a composite run takes its algorithm choices from
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowSelection {
    /// Run the given steps as they are
    Explicit,
    /// Session-selected version of a registered workflow supplies defaults
    Registry {
        name: String,
        processing_type: ProcessingType,
    },
}

/// Per-invocation controls
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub strict: bool,
    pub persist_intermediate: bool,
    pub compute_quality: bool,
    pub cancel: Option<CancellationToken>,
    /// Measured from the start of the call
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            strict: true,
            persist_intermediate: false,
            compute_quality: true,
            cancel: None,
            deadline: None,
        }
    }
}

/// Composite step list: bias, dark and flat are optional, cosmic-ray removal is required
pub fn full_calibration_steps(config: &EngineConfig) -> Vec<StepSpec> {
    let c = &config.calibration;
    let mut steps = Vec::new();
    if c.enable_bias {
        steps.push(
            StepSpec::new(StepType::BiasSubtraction, "default")
                .with_param("sigma_clip_k", c.sigma_clipping_threshold)
                .with_calib_key(BIAS_KEY)
                .optional(),
        );
    }
    if c.enable_dark {
        steps.push(
            StepSpec::new(StepType::DarkSubtraction, "default")
                .with_calib_key(DARK_KEY)
                .optional(),
        );
    }
    if c.enable_flat {
        steps.push(
            StepSpec::new(StepType::FlatCorrection, "default")
                .with_calib_key(FLAT_KEY)
                .optional(),
        );
    }
    if c.enable_cosmic_ray {
        steps.push(
            StepSpec::new(StepType::CosmicRayRemoval, "default").with_param("sigma_clip", c.cosmic_ray_threshold),
        );
    }
    steps
}

pub struct Engine {
    config: EngineConfig,
    pool: rayon::ThreadPool,
    algorithms: AlgorithmRegistry,
    workflows: Arc<WorkflowRegistry>,
    storage: Option<Arc<dyn FrameStore>>,
    codec: FrameCodec,
}

impl Engine {
    pub fn new(config: EngineConfig) -> CalResult<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel.worker_count as usize)
            .thread_name(|i| format!("astrocal-{}", i))
            .build()
            .map_err(|e| CalError::InvalidConfig(format!("Failed to build worker pool: {}", e)))?;
        log::info!(
            "Engine ready: {} workers, {} rows per tile, {} byte image limit",
            pool.current_num_threads(),
            config.parallel.tile_rows,
            config.memory.max_image_bytes
        );
        Ok(Self {
            codec: FrameCodec::with_max_image_bytes(config.memory.max_image_bytes),
            config,
            pool,
            algorithms: AlgorithmRegistry::new(),
            workflows: Arc::new(WorkflowRegistry::new()),
            storage: None,
        })
    }

    pub fn with_storage(mut self, storage: Arc<dyn FrameStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_workflows(mut self, workflows: Arc<WorkflowRegistry>) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn with_seeded_workflows(self) -> CalResult<Self> {
        self.workflows.seed_defaults()?;
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn algorithms(&self) -> &AlgorithmRegistry {
        &self.algorithms
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    fn tiles(&self) -> TileConfig {
        TileConfig::new(self.config.parallel.tile_rows as usize)
    }

    pub fn check_image_size(&self, width: usize, height: usize) -> CalResult<()> {
        fits::check_image_size(width, height, self.config.memory.max_image_bytes)
    }

    /// Decode a frame, inflating gzip input first
    pub fn decode_frame(&self, bytes: &[u8]) -> CalResult<(FrameImage, Header)> {
        let bytes = fits::maybe_decompress(bytes)?;
        self.codec.decode(&bytes)
    }

    pub fn encode_frame(&self, image: &FrameImage, header: &Header) -> CalResult<Vec<u8>> {
        self.codec.encode(image, header)
    }

    pub fn list_algorithms(&self, step_type: StepType, filter: StabilityFilter) -> Vec<AlgorithmDescriptor> {
        self.algorithms.list(step_type, filter).into_iter().cloned().collect()
    }

    pub fn analyze_quality(&self, image: &FrameImage) -> CalResult<QualityMetrics> {
        let analyzer = QualityAnalyzer::new().with_tiles(self.tiles());
        self.pool.install(|| analyzer.analyze(image))
    }

    fn driver_options(&self, options: &RunOptions) -> DriverOptions {
        DriverOptions {
            strict: options.strict,
            persist_intermediate: options.persist_intermediate,
            tiles: self.tiles(),
            checkpoint: Checkpoint::new(
                options.cancel.clone().unwrap_or_default(),
                options.deadline.map(|d| Instant::now() + d),
            ),
            compute_quality: options.compute_quality,
        }
    }

    fn driver(&self, options: &RunOptions) -> PipelineDriver<'_> {
        let driver = PipelineDriver::with_options(&self.algorithms, self.driver_options(options))
            .with_codec(self.codec.clone());
        match &self.storage {
            Some(storage) => driver.with_storage(storage.as_ref()),
            None => driver,
        }
    }

    pub fn run_step(
        &self,
        ctx: &ProcessingContext,
        image: FrameImage,
        header: Header,
        spec: &StepSpec,
        calib: Option<&CalibrationFrame>,
        options: &RunOptions,
    ) -> CalResult<(FrameImage, Header, StepOutcome)> {
        let (height, width) = image.dim();
        self.check_image_size(width, height)?;
        let driver = self.driver(options);
        self.pool.install(|| driver.run_step(ctx, image, header, spec, calib))
    }

    pub fn run_workflow(
        &self,
        ctx: &ProcessingContext,
        image: FrameImage,
        header: Header,
        selection: &WorkflowSelection,
        steps: &[StepSpec],
        library: &CalibrationLibrary,
        options: &RunOptions,
    ) -> CalResult<WorkflowRun> {
        let (height, width) = image.dim();
        self.check_image_size(width, height)?;

        let (steps, selected) = match selection {
            WorkflowSelection::Explicit => (steps.to_vec(), None),
            WorkflowSelection::Registry { name, processing_type } => {
                let version = self
                    .workflows
                    .select_for_session(name, *processing_type, &ctx.session_id)
                    .ok_or_else(|| {
                        CalError::WorkflowNotFound(format!("no active version of {} ({})", name, processing_type))
                    })?;
                log::info!(
                    "Session {} uses workflow {} {}",
                    ctx.session_id,
                    version.workflow_name,
                    version.version
                );
                (self.apply_workflow_defaults(&version, steps), Some(version))
            }
        };

        let driver = self.driver(options);
        let workflow = selected.as_ref().map(|v| (v.workflow_name.clone(), v.version.clone()));
        let run = self
            .pool
            .install(|| driver.run_workflow(ctx, image, header, &steps, library, workflow))?;

        if let Some(version) = selected {
            let mut performance = WorkflowMetrics::new();
            performance.insert("processing_time_ms".to_string(), run.record.total_duration_ms as f64);
            performance.insert("cosmic_rays_detected".to_string(), run.record.cosmic_ray_count as f64);
            let mut quality = WorkflowMetrics::new();
            if let Some(q) = &run.record.quality {
                quality.insert("quality_score".to_string(), q.quality_score);
            }
            if let Err(e) = self.workflows.record_usage(
                &version.workflow_name,
                &version.version,
                version.processing_type,
                &performance,
                &quality,
            ) {
                log::warn!("Failed to record workflow usage: {}", e);
            }
        }
        Ok(run)
    }

    /// Full calibration over whatever master frames the library holds
    pub fn calibrate(
        &self,
        ctx: &ProcessingContext,
        image: FrameImage,
        header: Header,
        library: &CalibrationLibrary,
        options: &RunOptions,
    ) -> CalResult<WorkflowRun> {
        let steps = self.calibration_plan(library);
        self.run_workflow(ctx, image, header, &WorkflowSelection::Explicit, &steps, library, options)
    }

    /// Composite steps runnable with `library`; bias falls back to the overscan
    /// level, dark and flat are dropped without a master frame
    pub fn calibration_plan(&self, library: &CalibrationLibrary) -> Vec<StepSpec> {
        full_calibration_steps(&self.config)
            .into_iter()
            .filter_map(|mut step| match step.calib_key.as_deref() {
                Some(key) if library.contains_key(key) => Some(step),
                Some(_) if step.step_type == StepType::BiasSubtraction => {
                    step.calib_key = None;
                    Some(step)
                }
                Some(key) => {
                    log::debug!("No {} frame supplied, not scheduling {}", key, step.step_type);
                    None
                }
                None => Some(step),
            })
            .collect()
    }

    /// Workflow algorithm choices fill in steps that ask for the default
    fn apply_workflow_defaults(&self, version: &WorkflowVersion, steps: &[StepSpec]) -> Vec<StepSpec> {
        steps
            .iter()
            .map(|step| {
                let choice = match version.algorithms.get(&step.step_type) {
                    Some(choice) => choice,
                    None => return step.clone(),
                };
                let asks_default = step.algorithm_id.is_empty() || step.algorithm_id.eq_ignore_ascii_case("default");
                if !asks_default && !step.algorithm_id.eq_ignore_ascii_case(&choice.algorithm_id) {
                    return step.clone();
                }
                let mut merged = step.clone();
                merged.algorithm_id = choice.algorithm_id.clone();
                merged.params = match self.algorithms.describe(step.step_type, &choice.algorithm_id) {
                    Ok(descriptor) => {
                        let canonical = |params: &ParamMap| -> ParamMap {
                            params
                                .iter()
                                .map(|(k, v)| {
                                    let name = descriptor.param_spec(k).map_or(k.clone(), |s| s.name.clone());
                                    (name, v.clone())
                                })
                                .collect()
                        };
                        let mut params = canonical(&choice.params);
                        params.extend(canonical(&step.params));
                        params
                    }
                    Err(_) => {
                        let mut params = choice.params.clone();
                        params.extend(step.params.clone());
                        params
                    }
                };
                merged
            })
            .collect()
    }

    pub async fn run_step_async(
        self: Arc<Self>,
        ctx: ProcessingContext,
        image: FrameImage,
        header: Header,
        spec: StepSpec,
        calib: Option<CalibrationFrame>,
        options: RunOptions,
    ) -> CalResult<(FrameImage, Header, StepOutcome)> {
        tokio::task::spawn_blocking(move || self.run_step(&ctx, image, header, &spec, calib.as_ref(), &options))
            .await
            .map_err(join_error)?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_workflow_async(
        self: Arc<Self>,
        ctx: ProcessingContext,
        image: FrameImage,
        header: Header,
        selection: WorkflowSelection,
        steps: Vec<StepSpec>,
        library: CalibrationLibrary,
        options: RunOptions,
    ) -> CalResult<WorkflowRun> {
        tokio::task::spawn_blocking(move || {
            self.run_workflow(&ctx, image, header, &selection, &steps, &library, &options)
        })
        .await
        .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> CalError {
    if e.is_cancelled() {
        CalError::Cancelled
    } else {
        CalError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("worker task failed: {}", e),
        ))
    }
}
