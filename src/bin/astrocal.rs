//! Command line host for the calibration engine.
//!
//! - `calibrate`: full bias/dark/flat/cosmic-ray calibration of one frame
//! - `step`: run a single step with an explicit algorithm and parameters
//! - `algorithms`: list the registered algorithm variants
//! - `quality`: score a frame
//! - `workflows`: inspect and manage workflow versions

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use astrocal::core::pipeline::{CalibrationLibrary, StepSpec};
use astrocal::engine::{BIAS_KEY, DARK_KEY, FLAT_KEY};
use astrocal::registry::workflows::ActivationRequest;
use astrocal::{
    CalError, CalibrationFrame, Engine, EngineConfig, FrameStore, HttpStore, LocalStore, ParamMap, ParamValue,
    ProcessingContext, ProcessingType, RunOptions, StabilityFilter, StepType, WorkflowRegistry, WorkflowSelection,
    WorkflowStatus,
};
use clap::{Parser, Subcommand};
use regex::Regex;

/// Calibrate astronomical detector frames
#[derive(Parser, Debug)]
#[command(name = "astrocal")]
#[command(version)]
struct Args {
    /// JSON configuration file (defaults to $ASTROCAL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override one configuration option, e.g. `calibration.enable_dark=false`
    #[arg(long = "set", global = true)]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Full calibration of one science frame
    Calibrate {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        bias: Option<PathBuf>,

        #[arg(long)]
        dark: Option<PathBuf>,

        #[arg(long)]
        flat: Option<PathBuf>,

        /// Session identifier used for workflow selection
        #[arg(long, default_value = "cli")]
        session: String,

        /// production, experimental, test, validation or reprocessing
        #[arg(long = "type", default_value = "test")]
        processing_type: String,

        /// Take cosmic-ray settings from this registered workflow
        #[arg(long)]
        workflow: Option<String>,

        /// Skip cosmic-ray removal
        #[arg(long)]
        no_cosmic: bool,

        /// Step parameter as `step.name=value`, e.g. `dark.auto_scale=true`
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Write the measurement record here as JSON
        #[arg(long, alias = "record")]
        report: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Accept and ignore unknown parameters
        #[arg(long)]
        lenient: bool,

        /// Store every intermediate frame under the storage root
        #[arg(long)]
        persist_intermediate: bool,
    },

    /// Run a single calibration step
    Step {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// bias, dark, flat or cosmic-ray
        #[arg(short, long)]
        step_type: String,

        #[arg(short, long, default_value = "default")]
        algorithm: String,

        /// Algorithm parameter as `name=value`
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Calibration frame for bias, dark and flat steps
        #[arg(long)]
        calib: Option<PathBuf>,
    },

    /// List algorithm variants
    Algorithms {
        #[arg(short, long)]
        step_type: Option<String>,

        /// Only production-stable variants
        #[arg(long, conflicts_with = "experimental")]
        stable: bool,

        /// Only experimental variants
        #[arg(long)]
        experimental: bool,
    },

    /// Compute quality metrics of a frame
    Quality { input: PathBuf },

    /// Manage workflow versions
    Workflows {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand, Debug)]
enum WorkflowAction {
    /// List active versions
    List {
        #[arg(long)]
        name: Option<String>,
    },

    /// Show which version a session would get
    Select {
        name: String,
        session: String,

        #[arg(long = "type", default_value = "production")]
        processing_type: String,
    },

    Activate {
        name: String,
        version: String,

        #[arg(long = "type", default_value = "production")]
        processing_type: String,

        /// Traffic share in percent
        #[arg(long, default_value = "100")]
        split: f64,

        #[arg(long)]
        deactivate_others: bool,

        #[arg(long, default_value = "cli")]
        actor: String,

        #[arg(long, default_value = "")]
        reason: String,
    },

    Rollback {
        name: String,
        target: String,

        #[arg(long = "type", default_value = "production")]
        processing_type: String,

        #[arg(long, default_value = "cli")]
        actor: String,

        #[arg(long, default_value = "")]
        reason: String,
    },
}

fn parse_processing_type(s: &str) -> Result<ProcessingType> {
    ProcessingType::parse(s).ok_or_else(|| anyhow!(CalError::InvalidConfig(format!("unknown processing type '{}'", s))))
}

fn parse_step_type(s: &str) -> Result<StepType> {
    StepType::parse(s).ok_or_else(|| anyhow!(CalError::InvalidConfig(format!("unknown step type '{}'", s))))
}

/// `name=value` pairs; values stay strings and are coerced by the algorithm
fn parse_params(pairs: &[String]) -> Result<ParamMap> {
    let re = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$")?;
    let mut params = ParamMap::new();
    for pair in pairs {
        let caps = re
            .captures(pair)
            .ok_or_else(|| anyhow!(CalError::InvalidConfig(format!("expected name=value, got '{}'", pair))))?;
        params.insert(caps[1].to_string(), ParamValue::Str(caps[2].to_string()));
    }
    Ok(params)
}

/// `step.name=value` pairs for the composite, grouped by step type
fn parse_step_params(pairs: &[String]) -> Result<Vec<(StepType, ParamMap)>> {
    let mut grouped: Vec<(StepType, ParamMap)> = Vec::new();
    for pair in pairs {
        let (step, rest) = pair
            .split_once('.')
            .ok_or_else(|| anyhow!(CalError::InvalidConfig(format!("expected step.name=value, got '{}'", pair))))?;
        let step_type = parse_step_type(step)?;
        let params = parse_params(std::slice::from_ref(&rest.to_string()))?;
        match grouped.iter_mut().find(|(t, _)| *t == step_type) {
            Some((_, existing)) => existing.extend(params),
            None => grouped.push((step_type, params)),
        }
    }
    Ok(grouped)
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    for item in &args.overrides {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!(CalError::InvalidConfig(format!("expected key=value, got '{}'", item))))?;
        config.set_option(key, value)?;
    }
    config.validate()?;
    Ok(config)
}

fn read_frame(engine: &Engine, path: &Path) -> Result<CalibrationFrame> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (image, header) = engine.decode_frame(&bytes)?;
    Ok(CalibrationFrame::new(image, header))
}

fn write_frame(engine: &Engine, path: &Path, frame: &CalibrationFrame) -> Result<()> {
    let bytes = engine.encode_frame(&frame.image, &frame.header)?;
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

/// HTTP store when an endpoint is configured, otherwise the local root
fn open_store(config: &EngineConfig) -> Result<Arc<dyn FrameStore>> {
    Ok(match &config.storage.http_endpoint {
        Some(endpoint) => Arc::new(HttpStore::new(endpoint, config.storage.http_timeout_secs.unwrap_or(30))?),
        None => Arc::new(LocalStore::new(config.storage.resolved_root()?)?),
    })
}

fn workflow_file(config: &EngineConfig) -> Result<PathBuf> {
    Ok(config.storage.resolved_root()?.join("workflows.json"))
}

fn load_workflows(config: &EngineConfig) -> Result<WorkflowRegistry> {
    let path = workflow_file(config)?;
    if path.exists() {
        Ok(WorkflowRegistry::load(&path)?)
    } else {
        let registry = WorkflowRegistry::new();
        registry.seed_defaults()?;
        Ok(registry)
    }
}

fn save_workflows(config: &EngineConfig, registry: &WorkflowRegistry) -> Result<()> {
    let path = workflow_file(config)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    registry.save(&path)?;
    Ok(())
}

fn run(args: Args) -> Result<i32> {
    let config = load_config(&args)?;

    match args.command {
        Command::Calibrate {
            input,
            output,
            bias,
            dark,
            flat,
            session,
            processing_type,
            workflow,
            no_cosmic,
            params,
            report,
            deadline_secs,
            lenient,
            persist_intermediate,
        } => {
            let processing_type = parse_processing_type(&processing_type)?;
            let workflows = Arc::new(load_workflows(&config)?);
            let mut engine = Engine::new(config.clone())?.with_workflows(Arc::clone(&workflows));
            if persist_intermediate {
                engine = engine.with_storage(open_store(&config)?);
            }

            let science = read_frame(&engine, &input)?;
            let mut library = CalibrationLibrary::new();
            for (key, path) in [(BIAS_KEY, bias), (DARK_KEY, dark), (FLAT_KEY, flat)] {
                if let Some(path) = path {
                    library.insert(key.to_string(), read_frame(&engine, &path)?);
                }
            }

            let ctx = ProcessingContext::of_type(processing_type, &session).with_input_key(&input.display().to_string());
            let options = RunOptions {
                strict: !lenient,
                persist_intermediate,
                deadline: deadline_secs.map(Duration::from_secs),
                ..RunOptions::default()
            };
            let mut steps: Vec<StepSpec> = engine.calibration_plan(&library);
            if no_cosmic {
                steps.retain(|s| s.step_type != StepType::CosmicRayRemoval);
            }
            for (step_type, overrides) in parse_step_params(&params)? {
                let step = steps
                    .iter_mut()
                    .find(|s| s.step_type == step_type)
                    .ok_or_else(|| anyhow!(CalError::InvalidConfig(format!("{} is not scheduled", step_type))))?;
                step.params.extend(overrides);
            }
            let selection = match workflow {
                Some(name) => WorkflowSelection::Registry { name, processing_type },
                None => WorkflowSelection::Explicit,
            };
            let run = engine.run_workflow(&ctx, science.image, science.header, &selection, &steps, &library, &options)?;
            save_workflows(&config, &workflows)?;

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&run.record)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            println!("{}: {} steps, status {:?}", run.record.context_id, run.record.steps.len(), run.record.status);
            if let Some(q) = &run.record.quality {
                println!("quality score {:.1}, snr {:.1}, {} sources", q.quality_score, q.snr, q.source_count);
            }

            match run.record.status {
                WorkflowStatus::Succeeded | WorkflowStatus::PartiallySucceeded => {
                    write_frame(&engine, &output, &CalibrationFrame::new(run.image, run.header))?;
                    Ok(0)
                }
                _ => {
                    let code = run
                        .record
                        .steps
                        .iter()
                        .rev()
                        .find_map(|s| s.error.as_ref())
                        .map_or(3, |e| e.kind.exit_code());
                    log::error!("Calibration ended with status {:?}", run.record.status);
                    Ok(code)
                }
            }
        }

        Command::Step {
            input,
            output,
            step_type,
            algorithm,
            params,
            calib,
        } => {
            let engine = Engine::new(config)?;
            let mut spec = StepSpec::new(parse_step_type(&step_type)?, &algorithm);
            spec.params = parse_params(&params)?;
            let frame = read_frame(&engine, &input)?;
            let calib = calib.map(|p| read_frame(&engine, &p)).transpose()?;
            let ctx = ProcessingContext::test("cli");
            let (image, header, outcome) = engine.run_step(
                &ctx,
                frame.image,
                frame.header,
                &spec,
                calib.as_ref(),
                &RunOptions::default(),
            )?;
            for warning in &outcome.warnings {
                log::warn!("{}", warning);
            }
            println!("{}", serde_json::to_string_pretty(&outcome.metrics)?);
            write_frame(&engine, &output, &CalibrationFrame::new(image, header))?;
            Ok(0)
        }

        Command::Algorithms {
            step_type,
            stable,
            experimental,
        } => {
            let engine = Engine::new(config)?;
            let filter = match (stable, experimental) {
                (true, _) => StabilityFilter::Stable,
                (_, true) => StabilityFilter::Experimental,
                _ => StabilityFilter::All,
            };
            let types = match step_type {
                Some(s) => vec![parse_step_type(&s)?],
                None => StepType::ALL.to_vec(),
            };
            let descriptors: Vec<_> = types
                .into_iter()
                .flat_map(|t| engine.list_algorithms(t, filter))
                .collect();
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
            Ok(0)
        }

        Command::Quality { input } => {
            let engine = Engine::new(config)?;
            let frame = read_frame(&engine, &input)?;
            let metrics = engine.analyze_quality(&frame.image)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(0)
        }

        Command::Workflows { action } => {
            let registry = load_workflows(&config)?;
            match action {
                WorkflowAction::List { name } => {
                    for v in registry.list_active(name.as_deref(), None) {
                        let default = if v.is_default { " default" } else { "" };
                        println!(
                            "{:<24} {:<20} {:<13} {:>5.1}%{}  used {}",
                            v.workflow_name, v.version, v.processing_type, v.traffic_split, default, v.usage_count
                        );
                    }
                }
                WorkflowAction::Select {
                    name,
                    session,
                    processing_type,
                } => {
                    let processing_type = parse_processing_type(&processing_type)?;
                    let version = registry
                        .select_for_session(&name, processing_type, &session)
                        .ok_or_else(|| anyhow!(CalError::WorkflowNotFound(name.clone())))?;
                    println!("{}", version.version);
                }
                WorkflowAction::Activate {
                    name,
                    version,
                    processing_type,
                    split,
                    deactivate_others,
                    actor,
                    reason,
                } => {
                    let mut request = ActivationRequest::new(&actor, &reason).with_split(split);
                    if deactivate_others {
                        request = request.deactivating_others();
                    }
                    let v = registry.activate(&name, &version, parse_processing_type(&processing_type)?, &request)?;
                    println!("{}", serde_json::to_string_pretty(&v)?);
                    save_workflows(&config, &registry)?;
                }
                WorkflowAction::Rollback {
                    name,
                    target,
                    processing_type,
                    actor,
                    reason,
                } => {
                    let v = registry.rollback(&name, parse_processing_type(&processing_type)?, &target, &actor, &reason)?;
                    println!("{}", serde_json::to_string_pretty(&v)?);
                    save_workflows(&config, &registry)?;
                }
            }
            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            log::error!("{:#}", e);
            let code = e.downcast_ref::<CalError>().map_or(1, |c| c.exit_code());
            ExitCode::from(code as u8)
        }
    }
}
