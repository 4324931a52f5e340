//! Per-invocation identity and lineage.

use crate::types::{CalError, CalResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pipeline version stamped into every context
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingType {
    Production,
    Experimental,
    Test,
    Validation,
    Reprocessing,
}

impl ProcessingType {
    pub const ALL: [ProcessingType; 5] = [
        ProcessingType::Production,
        ProcessingType::Experimental,
        ProcessingType::Test,
        ProcessingType::Validation,
        ProcessingType::Reprocessing,
    ];

    /// Short id prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            ProcessingType::Production => "prod",
            ProcessingType::Experimental => "exp",
            ProcessingType::Test => "test",
            ProcessingType::Validation => "val",
            ProcessingType::Reprocessing => "repr",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingType::Production => "production",
            ProcessingType::Experimental => "experimental",
            ProcessingType::Test => "test",
            ProcessingType::Validation => "validation",
            ProcessingType::Reprocessing => "reprocessing",
        }
    }

    /// Accepts either the full word or the id prefix
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        ProcessingType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.prefix() == s)
    }
}

impl std::fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductionInfo {
    pub observation_id: String,
    pub instrument: Option<String>,
    pub telescope: Option<String>,
    pub program: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub experiment_name: Option<String>,
    pub researcher_id: Option<String>,
    pub project_id: Option<String>,
    pub hypothesis: Option<String>,
}

/// Role-specific metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum RoleData {
    None,
    Production(ProductionInfo),
    Experimental(ExperimentInfo),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent_id: Option<String>,
    pub root_id: String,
    pub depth: u32,
    /// Storage key of the input frame
    pub input_key: Option<String>,
    /// Step type to calibration frame key
    pub calibration_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingContext {
    pub id: String,
    pub processing_type: ProcessingType,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub pipeline_version: String,
    pub role: RoleData,
    pub lineage: Lineage,
}

impl ProcessingContext {
    fn root(processing_type: ProcessingType, session_id: &str, role: RoleData) -> Self {
        let created_at = Utc::now();
        let id = generate_id(processing_type, &created_at);
        Self {
            lineage: Lineage {
                parent_id: None,
                root_id: id.clone(),
                depth: 0,
                input_key: None,
                calibration_keys: BTreeMap::new(),
            },
            id,
            processing_type,
            session_id: session_id.to_string(),
            created_at,
            pipeline_version: PIPELINE_VERSION.to_string(),
            role,
        }
    }

    pub fn production(session_id: &str, info: ProductionInfo) -> Self {
        Self::root(ProcessingType::Production, session_id, RoleData::Production(info))
    }

    pub fn experimental(session_id: &str, info: ExperimentInfo) -> Self {
        Self::root(ProcessingType::Experimental, session_id, RoleData::Experimental(info))
    }

    pub fn test(session_id: &str) -> Self {
        Self::root(ProcessingType::Test, session_id, RoleData::None)
    }

    pub fn validation(session_id: &str) -> Self {
        Self::root(ProcessingType::Validation, session_id, RoleData::None)
    }

    pub fn reprocessing(session_id: &str) -> Self {
        Self::root(ProcessingType::Reprocessing, session_id, RoleData::None)
    }

    /// Context of the given type with no role data
    pub fn of_type(processing_type: ProcessingType, session_id: &str) -> Self {
        Self::root(processing_type, session_id, RoleData::None)
    }

    /// Child context chained to this one
    pub fn derive(&self, session_id: &str) -> Self {
        let created_at = Utc::now();
        let id = generate_id(self.processing_type, &created_at);
        log::debug!("Deriving context {} from {}", id, self.id);
        Self {
            id,
            processing_type: self.processing_type,
            session_id: session_id.to_string(),
            created_at,
            pipeline_version: self.pipeline_version.clone(),
            role: self.role.clone(),
            lineage: Lineage {
                parent_id: Some(self.id.clone()),
                root_id: self.lineage.root_id.clone(),
                depth: self.lineage.depth + 1,
                input_key: None,
                calibration_keys: BTreeMap::new(),
            },
        }
    }

    pub fn with_input_key(mut self, key: &str) -> Self {
        self.lineage.input_key = Some(key.to_string());
        self
    }

    pub fn with_calibration_key(mut self, step: &str, key: &str) -> Self {
        self.lineage.calibration_keys.insert(step.to_string(), key.to_string());
        self
    }

    pub fn is_production(&self) -> bool {
        self.processing_type == ProcessingType::Production
    }

    pub fn is_experimental(&self) -> bool {
        self.processing_type == ProcessingType::Experimental
    }

    pub fn is_root(&self) -> bool {
        self.lineage.depth == 0
    }

    /// Key prefix under which this invocation stores its outputs
    pub fn storage_prefix(&self) -> String {
        let date = self.created_at.format("%Y-%m-%d");
        match (&self.processing_type, &self.role) {
            (ProcessingType::Production, _) => format!("production/{}/{}", date, self.id),
            (ProcessingType::Experimental, role) => {
                let name = match role {
                    RoleData::Experimental(info) => info
                        .experiment_name
                        .as_deref()
                        .filter(|n| !n.is_empty())
                        .unwrap_or("unnamed"),
                    _ => "unnamed",
                };
                format!("experimental/{}/{}/{}", name, date, self.id)
            }
            (t, _) => format!("{}/{}/{}", t.prefix(), date, self.id),
        }
    }

    /// `{prefix}_{YYYYMM}` partition for the measurement index
    pub fn partition_key(&self) -> String {
        format!("{}_{}", self.processing_type.prefix(), self.created_at.format("%Y%m"))
    }

    /// Recover the processing type from a context id
    pub fn parse_type(id: &str) -> CalResult<ProcessingType> {
        parse_id(id).map(|(t, _, _)| t)
    }
}

fn generate_id(processing_type: ProcessingType, created_at: &DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        processing_type.prefix(),
        created_at.format("%Y%m%d"),
        Uuid::new_v4()
    )
}

/// Split `{prefix}-{YYYYMMDD}-{uuid}` into its parts
pub fn parse_id(id: &str) -> CalResult<(ProcessingType, NaiveDate, Uuid)> {
    let invalid = || CalError::InvalidContextId(id.to_string());
    let mut parts = id.splitn(3, '-');
    let prefix = parts.next().ok_or_else(invalid)?;
    let date = parts.next().ok_or_else(invalid)?;
    let uuid = parts.next().ok_or_else(invalid)?;

    let processing_type = ProcessingType::ALL
        .into_iter()
        .find(|t| t.prefix() == prefix)
        .ok_or_else(invalid)?;
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;
    let uuid = Uuid::parse_str(uuid).map_err(|_| invalid())?;
    Ok((processing_type, date, uuid))
}
