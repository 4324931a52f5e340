//! Engine configuration: JSON file plus dotted-key overrides.

use crate::core::parallel::DEFAULT_TILE_ROWS;
use crate::types::{CalError, CalResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a config file for the command line host
pub const CONFIG_ENV: &str = "ASTROCAL_CONFIG";

/// 500 MiB
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 524_288_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub enable_bias: bool,
    pub enable_dark: bool,
    pub enable_flat: bool,
    pub enable_cosmic_ray: bool,
    /// Default `sigma_clip` of the composite cosmic-ray step
    pub cosmic_ray_threshold: f64,
    /// Default `k` of the overscan sigma-clipped mean
    pub sigma_clipping_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enable_bias: true,
            enable_dark: true,
            enable_flat: true,
            enable_cosmic_ray: true,
            cosmic_ray_threshold: 5.0,
            sigma_clipping_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_image_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// 0 means one worker per available CPU
    pub worker_count: u32,
    pub tile_rows: u32,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            tile_rows: DEFAULT_TILE_ROWS as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Local store root; the platform data directory when unset
    pub root: Option<PathBuf>,
    pub http_endpoint: Option<String>,
    pub http_timeout_secs: Option<u64>,
}

impl StorageConfig {
    pub fn resolved_root(&self) -> CalResult<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => dirs::data_local_dir()
                .map(|d| d.join("astrocal"))
                .ok_or_else(|| CalError::InvalidConfig("no local data directory; set storage.root".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub calibration: CalibrationConfig,
    pub memory: MemoryConfig,
    pub parallel: ParallelConfig,
    pub storage: StorageConfig,
}

fn parse_bool(key: &str, value: &str) -> CalResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(CalError::InvalidConfig(format!("{} expects a boolean, got '{}'", key, value))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> CalResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CalError::InvalidConfig(format!("{} expects a number, got '{}'", key, value)))
}

impl EngineConfig {
    pub fn from_json(text: &str) -> CalResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CalError::InvalidConfig(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CalError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e)))?;
        log::info!("Loading configuration from {}", path.display());
        Self::from_json(&text)
    }

    /// File named by `ASTROCAL_CONFIG`, or defaults when the variable is unset
    pub fn from_env() -> CalResult<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Set one option by its dotted name
    pub fn set_option(&mut self, key: &str, value: &str) -> CalResult<()> {
        let c = &mut self.calibration;
        match key.trim() {
            "calibration.enable_bias" => c.enable_bias = parse_bool(key, value)?,
            "calibration.enable_dark" => c.enable_dark = parse_bool(key, value)?,
            "calibration.enable_flat" => c.enable_flat = parse_bool(key, value)?,
            "calibration.enable_cosmic_ray" => c.enable_cosmic_ray = parse_bool(key, value)?,
            "calibration.cosmic_ray_threshold" => c.cosmic_ray_threshold = parse_num(key, value)?,
            "calibration.sigma_clipping_threshold" => c.sigma_clipping_threshold = parse_num(key, value)?,
            "memory.max_image_bytes" => self.memory.max_image_bytes = parse_num(key, value)?,
            "parallel.worker_count" => self.parallel.worker_count = parse_num(key, value)?,
            "parallel.tile_rows" => self.parallel.tile_rows = parse_num(key, value)?,
            "storage.root" => self.storage.root = Some(PathBuf::from(value)),
            "storage.http_endpoint" => self.storage.http_endpoint = Some(value.to_string()),
            "storage.http_timeout_secs" => self.storage.http_timeout_secs = Some(parse_num(key, value)?),
            _ => return Err(CalError::InvalidConfig(format!("unknown option '{}'", key))),
        }
        log::debug!("Config option {} = {}", key, value);
        Ok(())
    }

    pub fn validate(&self) -> CalResult<()> {
        if self.parallel.tile_rows == 0 {
            return Err(CalError::InvalidConfig("parallel.tile_rows must be positive".to_string()));
        }
        if self.memory.max_image_bytes == 0 {
            return Err(CalError::InvalidConfig("memory.max_image_bytes must be positive".to_string()));
        }
        for (key, value) in [
            ("calibration.cosmic_ray_threshold", self.calibration.cosmic_ray_threshold),
            ("calibration.sigma_clipping_threshold", self.calibration.sigma_clipping_threshold),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CalError::InvalidConfig(format!("{} must be positive, got {}", key, value)));
            }
        }
        Ok(())
    }
}
