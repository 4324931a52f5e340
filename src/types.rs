use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Single detector sample after decoding (physical units)
pub type Sample = f32;

/// 2D frame indexed `[[row, col]]`; rows = NAXIS2, cols = NAXIS1
pub type FrameImage = Array2<Sample>;

/// Value of a single header card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    Timestamp(NaiveDateTime),
    /// Free text of HISTORY, COMMENT and blank-keyword cards
    Commentary(String),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Integer(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            HeaderValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) | HeaderValue::Commentary(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Logical(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderValue::Logical(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            HeaderValue::Integer(i) => write!(f, "{}", i),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::Str(s) | HeaderValue::Commentary(s) => write!(f, "{}", s),
            HeaderValue::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

/// One 80-character header record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    pub comment: Option<String>,
    /// Exact card image as decoded; `None` once the card has been modified
    #[serde(skip)]
    pub raw: Option<String>,
}

impl HeaderCard {
    pub fn new(key: &str, value: HeaderValue, comment: Option<&str>) -> Self {
        Self {
            key: key.to_ascii_uppercase(),
            value,
            comment: comment.map(|c| c.to_string()),
            raw: None,
        }
    }

    pub fn is_commentary(&self) -> bool {
        matches!(self.value, HeaderValue::Commentary(_))
    }
}

/// Ordered header card store with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    cards: Vec<HeaderCard>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Minimal primary header for a floating point frame
    pub fn for_image(width: usize, height: usize) -> Self {
        let mut header = Self::new();
        header.set_bool("SIMPLE", true, Some("conforms to FITS standard"));
        header.set_int("BITPIX", -32, Some("IEEE single precision"));
        header.set_int("NAXIS", 2, None);
        header.set_int("NAXIS1", width as i64, None);
        header.set_int("NAXIS2", height as i64, None);
        header
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Append a decoded card verbatim, keeping duplicates and order
    pub fn push(&mut self, card: HeaderCard) {
        self.cards.push(card);
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.card(key).map(|c| &c.value)
    }

    pub fn card(&self, key: &str) -> Option<&HeaderCard> {
        self.cards
            .iter()
            .find(|c| !c.is_commentary() && c.key.eq_ignore_ascii_case(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.card(key).is_some()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(HeaderValue::as_bool)
    }

    /// Replace the value of an existing card in place, or append a new one
    pub fn set(&mut self, key: &str, value: HeaderValue, comment: Option<&str>) {
        let key = key.to_ascii_uppercase();
        if let Some(card) = self
            .cards
            .iter_mut()
            .find(|c| !c.is_commentary() && c.key == key)
        {
            card.value = value;
            if let Some(c) = comment {
                card.comment = Some(c.to_string());
            }
            card.raw = None;
            return;
        }
        self.cards.push(HeaderCard {
            key,
            value,
            comment: comment.map(|c| c.to_string()),
            raw: None,
        });
    }

    pub fn set_bool(&mut self, key: &str, value: bool, comment: Option<&str>) {
        self.set(key, HeaderValue::Logical(value), comment);
    }

    pub fn set_int(&mut self, key: &str, value: i64, comment: Option<&str>) {
        self.set(key, HeaderValue::Integer(value), comment);
    }

    pub fn set_float(&mut self, key: &str, value: f64, comment: Option<&str>) {
        self.set(key, HeaderValue::Float(value), comment);
    }

    pub fn set_str(&mut self, key: &str, value: &str, comment: Option<&str>) {
        self.set(key, HeaderValue::Str(value.to_string()), comment);
    }

    pub fn set_timestamp(&mut self, key: &str, value: DateTime<Utc>, comment: Option<&str>) {
        self.set(key, HeaderValue::Timestamp(value.naive_utc()), comment);
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderCard> {
        let idx = self
            .cards
            .iter()
            .position(|c| !c.is_commentary() && c.key.eq_ignore_ascii_case(key))?;
        Some(self.cards.remove(idx))
    }

    /// Append a HISTORY card; long text wraps across several cards
    pub fn add_history(&mut self, text: &str) {
        self.add_commentary("HISTORY", text);
    }

    pub fn add_comment(&mut self, text: &str) {
        self.add_commentary("COMMENT", text);
    }

    fn add_commentary(&mut self, key: &str, text: &str) {
        let chars: Vec<char> = text.chars().filter(|c| c.is_ascii() && !c.is_ascii_control()).collect();
        if chars.is_empty() {
            self.cards.push(HeaderCard::new(key, HeaderValue::Commentary(String::new()), None));
            return;
        }
        for chunk in chars.chunks(72) {
            let line: String = chunk.iter().collect();
            self.cards.push(HeaderCard::new(key, HeaderValue::Commentary(line), None));
        }
    }

    pub fn history(&self) -> Vec<&str> {
        self.cards
            .iter()
            .filter(|c| c.key == "HISTORY")
            .filter_map(|c| c.value.as_str())
            .collect()
    }

    /// Declare the payload as raw IEEE single precision samples
    pub fn mark_float_output(&mut self) {
        if self.get_i64("BITPIX") != Some(-32) {
            self.set_int("BITPIX", -32, Some("IEEE single precision"));
        }
        self.remove("BSCALE");
        self.remove("BZERO");
    }

    /// Exposure time in seconds from EXPTIME, falling back to EXPOSURE
    pub fn exposure_time(&self) -> Option<f64> {
        self.get_f64("EXPTIME").or_else(|| self.get_f64("EXPOSURE"))
    }

    pub fn instrument(&self) -> Option<&str> {
        self.get_str("INSTRUME")
    }

    pub fn filter(&self) -> Option<&str> {
        self.get_str("FILTER")
    }
}

/// Parse an ISO-8601 date or datetime as used in DATE-OBS style cards
pub fn parse_header_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Scalar algorithm parameter as supplied at the API boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// Ordered parameter map; ordering keeps HISTORY text deterministic
pub type ParamMap = BTreeMap<String, ParamValue>;

/// Render parameters as `a=1, b=true`
pub fn format_params(params: &ParamMap) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Step-specific measurement attached to a StepOutcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Count(u64),
    Text(String),
    Pixels(Vec<(usize, usize)>),
}

pub type MetricMap = BTreeMap<String, MetricValue>;

/// Canonical calibration step types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepType {
    #[serde(rename = "bias-subtraction")]
    BiasSubtraction,
    #[serde(rename = "dark-subtraction")]
    DarkSubtraction,
    #[serde(rename = "flat-correction")]
    FlatCorrection,
    #[serde(rename = "cosmic-ray-removal")]
    CosmicRayRemoval,
}

impl StepType {
    pub const ALL: [StepType; 4] = [
        StepType::BiasSubtraction,
        StepType::DarkSubtraction,
        StepType::FlatCorrection,
        StepType::CosmicRayRemoval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::BiasSubtraction => "bias-subtraction",
            StepType::DarkSubtraction => "dark-subtraction",
            StepType::FlatCorrection => "flat-correction",
            StepType::CosmicRayRemoval => "cosmic-ray-removal",
        }
    }

    /// Resolve a step type name, accepting the historical synonyms
    pub fn parse(name: &str) -> Option<StepType> {
        let normalized = name.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "bias-subtraction" | "bias" | "bias_subtraction" | "biassubtraction" => {
                Some(StepType::BiasSubtraction)
            }
            "dark-subtraction" | "dark" | "dark_subtraction" | "darksubtraction" => {
                Some(StepType::DarkSubtraction)
            }
            "flat-correction" | "flat" | "flat_correction" | "flatcorrection" | "flat_field"
            | "flatfield" => Some(StepType::FlatCorrection),
            "cosmic-ray-removal" | "cosmic" | "cosmic_ray" | "cosmicray" | "cosmic_rays"
            | "cosmicrays" | "cosmic_ray_removal" | "cosmicrayremoval" => {
                Some(StepType::CosmicRayRemoval)
            }
            _ => None,
        }
    }

    /// Steps that conventionally follow this one
    pub fn next_steps(&self) -> Vec<StepType> {
        let idx = StepType::ALL.iter().position(|s| s == self).unwrap_or(0);
        StepType::ALL[idx + 1..].to_vec()
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
    TimedOut,
}

/// Error kind and message carried by a failed or skipped step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Record of one executed (or attempted) step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub step_type: StepType,
    pub algorithm_id: String,
    pub algorithm_version: String,
    pub status: StepStatus,
    pub params: ParamMap,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub warnings: Vec<String>,
    pub metrics: MetricMap,
    pub error: Option<StepFailure>,
    pub storage_key: Option<String>,
    pub next_steps: Vec<StepType>,
}

impl StepOutcome {
    pub fn metric_f64(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name)? {
            MetricValue::Number(v) => Some(*v),
            MetricValue::Count(c) => Some(*c as f64),
            _ => None,
        }
    }

    pub fn metric_text(&self, name: &str) -> Option<&str> {
        match self.metrics.get(name)? {
            MetricValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Image quality figures computed on the final frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub background: f64,
    pub noise_sigma: f64,
    pub mean: f64,
    pub dynamic_range: f64,
    pub snr: f64,
    pub seeing_arcsec: f64,
    pub limiting_magnitude: f64,
    pub stellarity: f64,
    pub quality_score: f64,
    pub source_count: usize,
}

/// Result record of a workflow invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub context_id: String,
    pub status: WorkflowStatus,
    pub workflow: Option<(String, String)>,
    pub quality: Option<QualityMetrics>,
    pub cosmic_ray_count: u64,
    pub steps: Vec<StepOutcome>,
    pub total_duration_ms: u64,
}

/// Serializable classification of `CalError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedContainer,
    UnsupportedBitpix,
    DimensionMismatch,
    EmptyRegion,
    UnknownAlgorithm,
    AlgorithmUnsupported,
    UnknownParameter,
    ParameterOutOfRange,
    MissingCalibration,
    CalibrationDimensionMismatch,
    MissingExposureTime,
    ImageTooLarge,
    NumericDegenerate,
    StorageUnavailable,
    StorageNotFound,
    InvalidWorkflowActivation,
    WorkflowNotFound,
    TrafficSplitExceeded,
    Cancelled,
    DeadlineExceeded,
    InvalidContextId,
    InvalidConfig,
    Io,
    Serialization,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::UnknownAlgorithm
            | ErrorKind::AlgorithmUnsupported
            | ErrorKind::UnknownParameter
            | ErrorKind::ParameterOutOfRange
            | ErrorKind::InvalidConfig
            | ErrorKind::InvalidContextId
            | ErrorKind::InvalidWorkflowActivation
            | ErrorKind::WorkflowNotFound
            | ErrorKind::TrafficSplitExceeded => 1,
            ErrorKind::MalformedContainer
            | ErrorKind::UnsupportedBitpix
            | ErrorKind::DimensionMismatch
            | ErrorKind::ImageTooLarge => 2,
            ErrorKind::StorageUnavailable | ErrorKind::StorageNotFound | ErrorKind::Io => 4,
            ErrorKind::DeadlineExceeded => 5,
            ErrorKind::Cancelled => 6,
            _ => 3,
        }
    }
}

/// Error types for calibration operations
#[derive(Debug, thiserror::Error)]
pub enum CalError {
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    #[error("Unsupported BITPIX value: {0}")]
    UnsupportedBitpix(i64),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Empty region: {0}")]
    EmptyRegion(String),

    #[error("Unknown algorithm '{algorithm}' for step type '{step_type}'")]
    UnknownAlgorithm { step_type: String, algorithm: String },

    #[error("Algorithm '{0}' is registered but not supported")]
    AlgorithmUnsupported(String),

    #[error("Unknown parameter '{name}' for algorithm '{algorithm}'")]
    UnknownParameter { algorithm: String, name: String },

    #[error("Parameter '{name}' out of range: {message}")]
    ParameterOutOfRange { name: String, message: String },

    #[error("Missing calibration frame for {0}")]
    MissingCalibration(String),

    #[error("Calibration frame is {calib_width}x{calib_height}, image is {width}x{height}")]
    CalibrationDimensionMismatch {
        width: usize,
        height: usize,
        calib_width: usize,
        calib_height: usize,
    },

    #[error("Missing exposure time: {0}")]
    MissingExposureTime(String),

    #[error("Image of {bytes} bytes exceeds the configured limit of {limit} bytes")]
    ImageTooLarge { bytes: u64, limit: u64 },

    #[error("Numerically degenerate input: {0}")]
    NumericDegenerate(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage key not found: {0}")]
    StorageNotFound(String),

    #[error("Invalid workflow activation: {0}")]
    InvalidWorkflowActivation(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Traffic split exceeded: {0}")]
    TrafficSplitExceeded(String),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid processing context id: {0}")]
    InvalidContextId(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalError::MalformedContainer(_) => ErrorKind::MalformedContainer,
            CalError::UnsupportedBitpix(_) => ErrorKind::UnsupportedBitpix,
            CalError::DimensionMismatch(_) => ErrorKind::DimensionMismatch,
            CalError::EmptyRegion(_) => ErrorKind::EmptyRegion,
            CalError::UnknownAlgorithm { .. } => ErrorKind::UnknownAlgorithm,
            CalError::AlgorithmUnsupported(_) => ErrorKind::AlgorithmUnsupported,
            CalError::UnknownParameter { .. } => ErrorKind::UnknownParameter,
            CalError::ParameterOutOfRange { .. } => ErrorKind::ParameterOutOfRange,
            CalError::MissingCalibration(_) => ErrorKind::MissingCalibration,
            CalError::CalibrationDimensionMismatch { .. } => ErrorKind::CalibrationDimensionMismatch,
            CalError::MissingExposureTime(_) => ErrorKind::MissingExposureTime,
            CalError::ImageTooLarge { .. } => ErrorKind::ImageTooLarge,
            CalError::NumericDegenerate(_) => ErrorKind::NumericDegenerate,
            CalError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            CalError::StorageNotFound(_) => ErrorKind::StorageNotFound,
            CalError::InvalidWorkflowActivation(_) => ErrorKind::InvalidWorkflowActivation,
            CalError::WorkflowNotFound(_) => ErrorKind::WorkflowNotFound,
            CalError::TrafficSplitExceeded(_) => ErrorKind::TrafficSplitExceeded,
            CalError::Cancelled => ErrorKind::Cancelled,
            CalError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            CalError::InvalidContextId(_) => ErrorKind::InvalidContextId,
            CalError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            CalError::Io(_) => ErrorKind::Io,
            CalError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Process exit code for command line hosts
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn failure(&self) -> StepFailure {
        StepFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Result type for calibration operations
pub type CalResult<T> = Result<T, CalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_synonyms() {
        assert_eq!(StepType::parse("dark"), Some(StepType::DarkSubtraction));
        assert_eq!(StepType::parse("DarkSubtraction"), Some(StepType::DarkSubtraction));
        assert_eq!(StepType::parse("flat_field"), Some(StepType::FlatCorrection));
        assert_eq!(StepType::parse("cosmicrays"), Some(StepType::CosmicRayRemoval));
        assert_eq!(StepType::parse("bias"), Some(StepType::BiasSubtraction));
        assert_eq!(StepType::parse("stacking"), None);
    }

    #[test]
    fn test_header_case_insensitive_set() {
        let mut header = Header::for_image(4, 3);
        header.set_float("exptime", 120.0, None);
        assert_eq!(header.get_f64("EXPTIME"), Some(120.0));
        header.set_float("EXPTIME", 60.0, None);
        assert_eq!(header.cards().iter().filter(|c| c.key == "EXPTIME").count(), 1);
        assert_eq!(header.exposure_time(), Some(60.0));
    }

    #[test]
    fn test_history_wraps_long_text() {
        let mut header = Header::new();
        header.add_history(&"x".repeat(100));
        assert_eq!(header.history().len(), 2);
        assert_eq!(header.history()[0].len(), 72);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CalError::MalformedContainer("x".into()).exit_code(), 2);
        assert_eq!(CalError::Cancelled.exit_code(), 6);
        assert_eq!(CalError::DeadlineExceeded.exit_code(), 5);
        assert_eq!(CalError::StorageUnavailable("x".into()).exit_code(), 4);
        assert_eq!(CalError::NumericDegenerate("x".into()).exit_code(), 3);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_header_timestamp("2024-03-01T12:30:00").is_some());
        assert!(parse_header_timestamp("2024-03-01").is_some());
        assert!(parse_header_timestamp("not a date").is_none());
    }
}
