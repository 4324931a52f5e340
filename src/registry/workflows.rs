//! Versioned workflow configurations with activation state and traffic splits.
//!
//! State is grouped by `(workflow name, processing type)`. Each group is an
//! immutable snapshot behind an `Arc`; writers serialize on a per-group mutex,
//! edit a private copy and publish it with a single pointer swap, so readers
//! always see a complete group and never a half-applied split change.

use crate::context::ProcessingType;
use crate::types::{CalError, CalResult, ParamMap, StepType};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Tolerance on split totals
pub const SPLIT_EPSILON: f64 = 0.01;
/// History entries kept per group
pub const HISTORY_LIMIT: usize = 100;

pub type WorkflowMetrics = BTreeMap<String, f64>;

/// Algorithm chosen for one step type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmChoice {
    pub algorithm_id: String,
    #[serde(default)]
    pub params: ParamMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub workflow_name: String,
    pub version: String,
    pub processing_type: ProcessingType,
    pub active: bool,
    pub is_default: bool,
    pub traffic_split: f64,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub deactivated_by: Option<String>,
    pub activation_reason: Option<String>,
    pub deactivation_reason: Option<String>,
    #[serde(default)]
    pub algorithms: BTreeMap<StepType, AlgorithmChoice>,
    #[serde(default)]
    pub performance_metrics: WorkflowMetrics,
    #[serde(default)]
    pub quality_metrics: WorkflowMetrics,
    #[serde(default)]
    pub usage_count: u64,
}

impl WorkflowVersion {
    /// New inactive version with no algorithm configuration
    pub fn new(workflow_name: &str, version: &str, processing_type: ProcessingType) -> Self {
        Self {
            workflow_name: workflow_name.to_string(),
            version: version.to_string(),
            processing_type,
            active: false,
            is_default: false,
            traffic_split: 0.0,
            created_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
            last_used_at: None,
            activated_by: None,
            deactivated_by: None,
            activation_reason: None,
            deactivation_reason: None,
            algorithms: BTreeMap::new(),
            performance_metrics: WorkflowMetrics::new(),
            quality_metrics: WorkflowMetrics::new(),
            usage_count: 0,
        }
    }

    pub fn with_algorithm(mut self, step_type: StepType, algorithm_id: &str, params: ParamMap) -> Self {
        self.algorithms.insert(
            step_type,
            AlgorithmChoice {
                algorithm_id: algorithm_id.to_string(),
                params,
            },
        );
        self
    }

    /// Split that counts toward selection; zero when inactive
    pub fn effective_split(&self) -> f64 {
        if self.active {
            self.traffic_split
        } else {
            0.0
        }
    }

    fn activate(&mut self, split: f64, actor: &str, reason: &str) {
        self.active = true;
        self.traffic_split = split;
        self.activated_at = Some(Utc::now());
        self.activated_by = Some(actor.to_string());
        self.activation_reason = Some(reason.to_string());
    }

    fn deactivate(&mut self, actor: Option<&str>, reason: Option<&str>) {
        self.active = false;
        self.traffic_split = 0.0;
        self.deactivated_at = Some(Utc::now());
        if let Some(actor) = actor {
            self.deactivated_by = Some(actor.to_string());
        }
        if let Some(reason) = reason {
            self.deactivation_reason = Some(reason.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub actor: String,
    pub reason: String,
    /// Defaults to 100 when absent
    pub traffic_split: Option<f64>,
    pub deactivate_others: bool,
    pub set_default: bool,
}

impl ActivationRequest {
    pub fn new(actor: &str, reason: &str) -> Self {
        Self {
            actor: actor.to_string(),
            reason: reason.to_string(),
            traffic_split: None,
            deactivate_others: false,
            set_default: false,
        }
    }

    pub fn with_split(mut self, split: f64) -> Self {
        self.traffic_split = Some(split);
        self
    }

    pub fn deactivating_others(mut self) -> Self {
        self.deactivate_others = true;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.set_default = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivationRequest {
    pub actor: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub new_version: String,
    pub actor: String,
    pub reason: String,
    #[serde(default)]
    pub performance_metrics: WorkflowMetrics,
    #[serde(default)]
    pub set_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryAction {
    Activate,
    Deactivate,
    Rollback,
    AbTest,
    Promote,
    SetDefault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub workflow_name: String,
    pub version: String,
    pub processing_type: ProcessingType,
    pub action: HistoryAction,
    pub actor: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub baseline: f64,
    pub comparison: f64,
    pub absolute_change: f64,
    pub percent_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub baseline: WorkflowVersion,
    pub comparison: WorkflowVersion,
    pub performance_delta: BTreeMap<String, MetricDelta>,
    pub quality_delta: BTreeMap<String, MetricDelta>,
    pub recommendation: String,
}

type GroupKey = (String, ProcessingType);

#[derive(Debug, Clone, Default)]
struct Group {
    versions: BTreeMap<String, WorkflowVersion>,
    /// Newest first
    history: VecDeque<HistoryEntry>,
}

impl Group {
    fn version_mut(&mut self, name: &str, version: &str, processing_type: ProcessingType) -> CalResult<&mut WorkflowVersion> {
        self.versions
            .get_mut(version)
            .ok_or_else(|| not_found(name, version, processing_type))
    }

    fn deactivate_except(&mut self, keep: &[&str]) {
        for v in self.versions.values_mut() {
            if v.active && !keep.contains(&v.version.as_str()) {
                v.deactivate(None, None);
            }
        }
    }

    fn active_total_except(&self, version: &str) -> f64 {
        self.versions
            .values()
            .filter(|v| v.version != version)
            .map(WorkflowVersion::effective_split)
            .sum()
    }

    fn set_default(&mut self, version: &str) {
        for v in self.versions.values_mut() {
            v.is_default = v.version == version;
        }
    }

    fn log(&mut self, key: &GroupKey, version: &str, action: HistoryAction, actor: &str, reason: &str) {
        self.history.push_front(HistoryEntry {
            workflow_name: key.0.clone(),
            version: version.to_string(),
            processing_type: key.1,
            action,
            actor: actor.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.history.truncate(HISTORY_LIMIT);
    }
}

fn not_found(name: &str, version: &str, processing_type: ProcessingType) -> CalError {
    CalError::WorkflowNotFound(format!("{} {} ({})", name, version, processing_type))
}

fn check_split(split: f64) -> CalResult<()> {
    if !split.is_finite() || !(0.0..=100.0).contains(&split) {
        return Err(CalError::InvalidWorkflowActivation(format!(
            "traffic split {} outside [0, 100]",
            split
        )));
    }
    Ok(())
}

/// Java `String.hashCode` over UTF-16 units, mapped into `[0, 100)`
pub fn session_bucket(session_id: &str) -> f64 {
    let hash = session_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32));
    (hash.unsigned_abs() % 10_000) as f64 / 100.0
}

fn ordering(a: &WorkflowVersion, b: &WorkflowVersion) -> std::cmp::Ordering {
    a.workflow_name
        .cmp(&b.workflow_name)
        .then(b.traffic_split.total_cmp(&a.traffic_split))
        .then(a.version.cmp(&b.version))
}

/// Serialized form used by [`WorkflowRegistry::save`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    versions: Vec<WorkflowVersion>,
    history: Vec<HistoryEntry>,
}

#[derive(Default)]
pub struct WorkflowRegistry {
    snapshots: RwLock<BTreeMap<GroupKey, Arc<Group>>>,
    writers: Mutex<BTreeMap<GroupKey, Arc<Mutex<()>>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, key: &GroupKey) -> Option<Arc<Group>> {
        self.snapshots.read().get(key).cloned()
    }

    /// Apply `f` to a copy of the group and publish it only if `f` succeeds
    fn mutate<T, F>(&self, key: GroupKey, create: bool, f: F) -> CalResult<T>
    where
        F: FnOnce(&mut Group) -> CalResult<T>,
    {
        let writer = self.writers.lock().entry(key.clone()).or_default().clone();
        let _guard = writer.lock();

        let mut group = match self.snapshot(&key) {
            Some(current) => (*current).clone(),
            None if create => Group::default(),
            None => {
                return Err(CalError::WorkflowNotFound(format!(
                    "no versions of {} ({})",
                    key.0, key.1
                )))
            }
        };
        let value = f(&mut group)?;
        self.snapshots.write().insert(key, Arc::new(group));
        Ok(value)
    }

    /// Insert a new inactive version
    pub fn create(&self, version: WorkflowVersion) -> CalResult<WorkflowVersion> {
        let mut version = version;
        version.active = false;
        version.is_default = false;
        version.traffic_split = 0.0;
        self.insert(version)
    }

    fn insert(&self, version: WorkflowVersion) -> CalResult<WorkflowVersion> {
        let key = (version.workflow_name.clone(), version.processing_type);
        self.mutate(key, true, |group| {
            if group.versions.contains_key(&version.version) {
                return Err(CalError::InvalidWorkflowActivation(format!(
                    "{} {} ({}) already exists",
                    version.workflow_name, version.version, version.processing_type
                )));
            }
            log::info!(
                "Created workflow version {} {} ({})",
                version.workflow_name,
                version.version,
                version.processing_type
            );
            group.versions.insert(version.version.clone(), version.clone());
            Ok(version)
        })
    }

    pub fn get(&self, name: &str, version: &str, processing_type: ProcessingType) -> CalResult<WorkflowVersion> {
        self.snapshot(&(name.to_string(), processing_type))
            .and_then(|g| g.versions.get(version).cloned())
            .ok_or_else(|| not_found(name, version, processing_type))
    }

    /// All versions of one workflow, newest first
    pub fn versions(&self, name: &str, processing_type: ProcessingType) -> Vec<WorkflowVersion> {
        let mut versions: Vec<WorkflowVersion> = self
            .snapshot(&(name.to_string(), processing_type))
            .map(|g| g.versions.values().cloned().collect())
            .unwrap_or_default();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        versions
    }

    /// Active versions ordered by name, split descending, then version
    pub fn list_active(&self, name: Option<&str>, processing_type: Option<ProcessingType>) -> Vec<WorkflowVersion> {
        let snapshots = self.snapshots.read();
        let mut active: Vec<WorkflowVersion> = snapshots
            .iter()
            .filter(|((n, t), _)| name.map_or(true, |x| x == n.as_str()) && processing_type.map_or(true, |x| x == *t))
            .flat_map(|(_, g)| g.versions.values().filter(|v| v.active).cloned())
            .collect();
        active.sort_by(ordering);
        active
    }

    pub fn activate(
        &self,
        name: &str,
        version: &str,
        processing_type: ProcessingType,
        request: &ActivationRequest,
    ) -> CalResult<WorkflowVersion> {
        let split = request.traffic_split.unwrap_or(100.0);
        check_split(split)?;
        let key = (name.to_string(), processing_type);
        let group_key = key.clone();
        let activated = self.mutate(key, false, |group| {
            group.version_mut(name, version, processing_type)?;
            if request.deactivate_others {
                group.deactivate_except(&[version]);
            }
            let others = group.active_total_except(version);
            if others + split > 100.0 + SPLIT_EPSILON {
                return Err(CalError::TrafficSplitExceeded(format!(
                    "current {:.1}% + new {:.1}% = {:.1}%",
                    others,
                    split,
                    others + split
                )));
            }
            group
                .version_mut(name, version, processing_type)?
                .activate(split, &request.actor, &request.reason);
            if request.set_default {
                group.set_default(version);
            }
            group.log(&group_key, version, HistoryAction::Activate, &request.actor, &request.reason);
            group.version_mut(name, version, processing_type).map(|v| v.clone())
        })?;
        log::info!(
            "Activated workflow version {} {} ({}) with {}% traffic",
            name,
            version,
            processing_type,
            activated.traffic_split
        );
        Ok(activated)
    }

    pub fn deactivate(
        &self,
        name: &str,
        version: &str,
        processing_type: ProcessingType,
        request: &DeactivationRequest,
    ) -> CalResult<WorkflowVersion> {
        let key = (name.to_string(), processing_type);
        let group_key = key.clone();
        let deactivated = self.mutate(key, false, |group| {
            let v = group.version_mut(name, version, processing_type)?;
            v.deactivate(Some(&request.actor), Some(&request.reason));
            let v = v.clone();
            group.log(&group_key, version, HistoryAction::Deactivate, &request.actor, &request.reason);
            Ok(v)
        })?;
        log::info!("Deactivated workflow version {} {} ({})", name, version, processing_type);
        Ok(deactivated)
    }

    pub fn set_default(
        &self,
        name: &str,
        version: &str,
        processing_type: ProcessingType,
        actor: &str,
    ) -> CalResult<WorkflowVersion> {
        let key = (name.to_string(), processing_type);
        let group_key = key.clone();
        self.mutate(key, false, |group| {
            group.version_mut(name, version, processing_type)?;
            group.set_default(version);
            group.log(&group_key, version, HistoryAction::SetDefault, actor, "set as default");
            group.version_mut(name, version, processing_type).map(|v| v.clone())
        })
    }

    /// Deactivate every sibling and give `target` the full split
    pub fn rollback(
        &self,
        name: &str,
        processing_type: ProcessingType,
        target: &str,
        actor: &str,
        reason: &str,
    ) -> CalResult<WorkflowVersion> {
        let key = (name.to_string(), processing_type);
        let group_key = key.clone();
        let restored = self.mutate(key, false, |group| {
            group.version_mut(name, target, processing_type)?;
            group.deactivate_except(&[target]);
            group
                .version_mut(name, target, processing_type)?
                .activate(100.0, actor, &format!("Rollback: {}", reason));
            group.log(&group_key, target, HistoryAction::Rollback, actor, reason);
            group.version_mut(name, target, processing_type).map(|v| v.clone())
        })?;
        log::info!("Rolled back workflow {} ({}) to {} by {}", name, processing_type, target, actor);
        Ok(restored)
    }

    /// Run exactly `a` and `b` with the given splits
    #[allow(clippy::too_many_arguments)]
    pub fn setup_ab(
        &self,
        name: &str,
        processing_type: ProcessingType,
        a: &str,
        b: &str,
        split_a: f64,
        split_b: f64,
        actor: &str,
        reason: &str,
    ) -> CalResult<(WorkflowVersion, WorkflowVersion)> {
        check_split(split_a)?;
        check_split(split_b)?;
        if ((split_a + split_b) - 100.0).abs() > SPLIT_EPSILON {
            return Err(CalError::InvalidWorkflowActivation(format!(
                "A/B splits must sum to 100, got {}",
                split_a + split_b
            )));
        }
        if a == b {
            return Err(CalError::InvalidWorkflowActivation(
                "A/B test needs two distinct versions".to_string(),
            ));
        }
        let key = (name.to_string(), processing_type);
        let group_key = key.clone();
        let pair = self.mutate(key, false, |group| {
            group.version_mut(name, a, processing_type)?;
            group.version_mut(name, b, processing_type)?;
            group.deactivate_except(&[a, b]);
            let note = format!("A/B test setup: {}", reason);
            group.version_mut(name, a, processing_type)?.activate(split_a, actor, &note);
            group.version_mut(name, b, processing_type)?.activate(split_b, actor, &note);
            group.log(
                &group_key,
                "A/B-test",
                HistoryAction::AbTest,
                actor,
                &format!("A/B test: {} ({}%) vs {} ({}%). {}", a, split_a, b, split_b, reason),
            );
            Ok((
                group.version_mut(name, a, processing_type)?.clone(),
                group.version_mut(name, b, processing_type)?.clone(),
            ))
        })?;
        log::info!(
            "A/B test for {}: {} ({}%) vs {} ({}%)",
            name,
            a,
            split_a,
            b,
            split_b
        );
        Ok(pair)
    }

    /// Session-sticky choice among the active versions of one workflow
    pub fn select_for_session(
        &self,
        name: &str,
        processing_type: ProcessingType,
        session_id: &str,
    ) -> Option<WorkflowVersion> {
        let active = self.list_active(Some(name), Some(processing_type));
        if active.len() <= 1 {
            return active.into_iter().next();
        }
        let bucket = session_bucket(session_id);
        let mut cumulative = 0.0;
        for version in &active {
            cumulative += version.effective_split();
            if cumulative > bucket {
                return Some(version.clone());
            }
        }
        active.into_iter().next()
    }

    /// Copy an experimental configuration into a new active production version
    pub fn promote(&self, experiment_name: &str, request: &PromotionRequest) -> CalResult<WorkflowVersion> {
        let source = {
            let snapshots = self.snapshots.read();
            snapshots
                .iter()
                .filter(|((_, t), _)| *t == ProcessingType::Experimental)
                .flat_map(|(_, g)| g.versions.values())
                .find(|v| v.workflow_name == experiment_name || v.version.contains(experiment_name))
                .cloned()
        }
        .ok_or_else(|| CalError::WorkflowNotFound(format!("experimental workflow {}", experiment_name)))?;

        let mut promoted = WorkflowVersion::new(&source.workflow_name, &request.new_version, ProcessingType::Production);
        promoted.algorithms = source.algorithms.clone();
        promoted.performance_metrics = request.performance_metrics.clone();
        let reason = format!("Promoted from experimental: {}. {}", experiment_name, request.reason);
        promoted.activate(100.0, &request.actor, &reason);

        let key = (source.workflow_name.clone(), ProcessingType::Production);
        let group_key = key.clone();
        let promoted = self.mutate(key, true, |group| {
            if group.versions.contains_key(&promoted.version) {
                return Err(CalError::InvalidWorkflowActivation(format!(
                    "production version {} already exists",
                    promoted.version
                )));
            }
            group.deactivate_except(&[]);
            group.versions.insert(promoted.version.clone(), promoted.clone());
            if request.set_default {
                group.set_default(&promoted.version);
            }
            group.log(&group_key, &promoted.version, HistoryAction::Promote, &request.actor, &reason);
            group
                .version_mut(&promoted.workflow_name, &promoted.version, ProcessingType::Production)
                .map(|v| v.clone())
        })?;
        log::info!(
            "Promoted experimental workflow {} to production version {}",
            experiment_name,
            promoted.version
        );
        Ok(promoted)
    }

    pub fn compare(
        &self,
        name: &str,
        processing_type: ProcessingType,
        baseline: &str,
        comparison: &str,
    ) -> CalResult<ComparisonResult> {
        let baseline = self.get(name, baseline, processing_type)?;
        let comparison = self.get(name, comparison, processing_type)?;
        let performance_delta = metrics_delta(&baseline.performance_metrics, &comparison.performance_metrics);
        let quality_delta = metrics_delta(&baseline.quality_metrics, &comparison.quality_metrics);
        let recommendation = recommend(&performance_delta, &quality_delta).to_string();
        Ok(ComparisonResult {
            baseline,
            comparison,
            performance_delta,
            quality_delta,
            recommendation,
        })
    }

    /// Count one run and merge its metrics
    pub fn record_usage(
        &self,
        name: &str,
        version: &str,
        processing_type: ProcessingType,
        performance: &WorkflowMetrics,
        quality: &WorkflowMetrics,
    ) -> CalResult<()> {
        self.mutate((name.to_string(), processing_type), false, |group| {
            let v = group.version_mut(name, version, processing_type)?;
            v.usage_count += 1;
            v.last_used_at = Some(Utc::now());
            v.performance_metrics
                .extend(performance.iter().map(|(k, x)| (k.clone(), *x)));
            v.quality_metrics.extend(quality.iter().map(|(k, x)| (k.clone(), *x)));
            Ok(())
        })
    }

    /// Activation history, newest first
    pub fn history(&self, name: &str, processing_type: ProcessingType, limit: usize) -> Vec<HistoryEntry> {
        self.snapshot(&(name.to_string(), processing_type))
            .map(|g| g.history.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().values().all(|g| g.versions.is_empty())
    }

    /// Initial cosmic-ray workflows; no-op when the registry already has versions
    pub fn seed_defaults(&self) -> CalResult<()> {
        if !self.is_empty() {
            return Ok(());
        }
        let mut lacosmic = ParamMap::new();
        lacosmic.insert("sigma_clip".to_string(), 4.0.into());
        lacosmic.insert("max_iter".to_string(), 4i64.into());

        let mut production = WorkflowVersion::new("cosmic-ray-removal", "v1.1", ProcessingType::Production)
            .with_algorithm(StepType::CosmicRayRemoval, "lacosmic", lacosmic);
        production.activate(100.0, "ops-team", "Initial production version");
        production.is_default = true;
        self.insert(production)?;

        let mut experimental =
            WorkflowVersion::new("cosmic-ray-removal", "v2.0-experimental", ProcessingType::Experimental)
                .with_algorithm(StepType::CosmicRayRemoval, "lacosmic-v2", ParamMap::new());
        experimental.activate(100.0, "astronomer", "Star-preserving cosmic-ray detection");
        self.insert(experimental)?;

        log::info!("Seeded default workflow versions");
        Ok(())
    }

    /// Write every version and history entry as JSON, atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CalResult<()> {
        let path = path.as_ref();
        let state = {
            let snapshots = self.snapshots.read();
            RegistryState {
                versions: snapshots.values().flat_map(|g| g.versions.values().cloned()).collect(),
                history: snapshots.values().flat_map(|g| g.history.iter().cloned()).collect(),
            }
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &state)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| CalError::Io(e.error))?;
        log::debug!("Saved {} workflow versions to {}", state.versions.len(), path.display());
        Ok(())
    }

    /// Load a registry written by [`save`](Self::save)
    pub fn load<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let state: RegistryState = serde_json::from_str(&text)?;
        let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();
        for version in state.versions {
            let key = (version.workflow_name.clone(), version.processing_type);
            groups
                .entry(key)
                .or_default()
                .versions
                .insert(version.version.clone(), version);
        }
        // Entries were saved newest first within each group
        for entry in state.history {
            let key = (entry.workflow_name.clone(), entry.processing_type);
            groups.entry(key).or_default().history.push_back(entry);
        }
        let registry = Self::new();
        {
            let mut snapshots = registry.snapshots.write();
            for (key, mut group) in groups {
                group.history.truncate(HISTORY_LIMIT);
                snapshots.insert(key, Arc::new(group));
            }
        }
        Ok(registry)
    }
}

fn metrics_delta(baseline: &WorkflowMetrics, comparison: &WorkflowMetrics) -> BTreeMap<String, MetricDelta> {
    baseline
        .iter()
        .filter_map(|(key, &base)| {
            let comp = *comparison.get(key)?;
            let change = comp - base;
            let percent_change = if base != 0.0 { change / base * 100.0 } else { 0.0 };
            Some((
                key.clone(),
                MetricDelta {
                    baseline: base,
                    comparison: comp,
                    absolute_change: change,
                    percent_change,
                },
            ))
        })
        .collect()
}

fn average_change(delta: &BTreeMap<String, MetricDelta>) -> f64 {
    if delta.is_empty() {
        return 0.0;
    }
    delta.values().map(|d| d.percent_change).sum::<f64>() / delta.len() as f64
}

fn recommend(performance: &BTreeMap<String, MetricDelta>, quality: &BTreeMap<String, MetricDelta>) -> &'static str {
    let perf = average_change(performance);
    let qual = average_change(quality);
    if perf > 5.0 && qual > 5.0 {
        "RECOMMEND: Significant improvements in both performance and quality"
    } else if perf > 10.0 {
        "RECOMMEND: Significant performance improvement"
    } else if qual > 10.0 {
        "RECOMMEND: Significant quality improvement"
    } else if perf < -10.0 || qual < -10.0 {
        "NOT RECOMMENDED: Performance or quality degradation detected"
    } else {
        "NEUTRAL: Minor differences detected, consider business requirements"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(versions: &[&str]) -> WorkflowRegistry {
        let registry = WorkflowRegistry::new();
        for v in versions {
            registry
                .create(WorkflowVersion::new("wf", v, ProcessingType::Production))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_session_bucket_matches_java_hash() {
        assert_eq!(session_bucket("abc"), 63.54);
        assert_eq!(session_bucket(""), 0.0);
    }

    #[test]
    fn test_create_is_inactive_and_unique() {
        let registry = registry_with(&["v1"]);
        assert!(!registry.get("wf", "v1", ProcessingType::Production).unwrap().active);
        assert!(matches!(
            registry.create(WorkflowVersion::new("wf", "v1", ProcessingType::Production)),
            Err(CalError::InvalidWorkflowActivation(_))
        ));
    }

    #[test]
    fn test_split_total_enforced() {
        let registry = registry_with(&["v1", "v2"]);
        let t = ProcessingType::Production;
        registry
            .activate("wf", "v1", t, &ActivationRequest::new("ops", "r").with_split(70.0))
            .unwrap();
        let err = registry.activate("wf", "v2", t, &ActivationRequest::new("ops", "r").with_split(40.0));
        assert!(matches!(err, Err(CalError::TrafficSplitExceeded(_))));
        // failed activation left v2 untouched
        assert!(!registry.get("wf", "v2", t).unwrap().active);

        registry
            .activate("wf", "v2", t, &ActivationRequest::new("ops", "r").with_split(30.0))
            .unwrap();
        let total: f64 = registry.list_active(Some("wf"), Some(t)).iter().map(|v| v.traffic_split).sum();
        assert!(total <= 100.0 + SPLIT_EPSILON);
    }

    #[test]
    fn test_invalid_split_and_unknown_version() {
        let registry = registry_with(&["v1"]);
        let t = ProcessingType::Production;
        assert!(matches!(
            registry.activate("wf", "v1", t, &ActivationRequest::new("a", "r").with_split(120.0)),
            Err(CalError::InvalidWorkflowActivation(_))
        ));
        assert!(matches!(
            registry.activate("wf", "v9", t, &ActivationRequest::new("a", "r")),
            Err(CalError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn test_deactivate_others() {
        let registry = registry_with(&["v1", "v2"]);
        let t = ProcessingType::Production;
        registry.activate("wf", "v1", t, &ActivationRequest::new("a", "r")).unwrap();
        registry
            .activate("wf", "v2", t, &ActivationRequest::new("a", "r").deactivating_others().as_default())
            .unwrap();
        let v1 = registry.get("wf", "v1", t).unwrap();
        assert!(!v1.active);
        assert_eq!(v1.traffic_split, 0.0);
        assert!(registry.get("wf", "v2", t).unwrap().is_default);
    }

    #[test]
    fn test_ab_selection_is_sticky() {
        let registry = registry_with(&["a", "b"]);
        let t = ProcessingType::Production;
        registry.setup_ab("wf", t, "a", "b", 80.0, 20.0, "ops", "trial").unwrap();
        let first = registry.select_for_session("wf", t, "abc").unwrap();
        assert_eq!(first.version, "a");
        for _ in 0..100 {
            assert_eq!(registry.select_for_session("wf", t, "abc").unwrap().version, first.version);
        }
        assert!(matches!(
            registry.setup_ab("wf", t, "a", "b", 60.0, 30.0, "ops", "bad"),
            Err(CalError::InvalidWorkflowActivation(_))
        ));
    }

    #[test]
    fn test_rollback_history() {
        let registry = registry_with(&["v1", "v2"]);
        let t = ProcessingType::Production;
        registry.activate("wf", "v2", t, &ActivationRequest::new("a", "r")).unwrap();
        let restored = registry.rollback("wf", t, "v1", "oncall", "regression").unwrap();
        assert_eq!(restored.traffic_split, 100.0);
        assert!(!registry.get("wf", "v2", t).unwrap().active);

        let history = registry.history("wf", t, 10);
        assert_eq!(history[0].action, HistoryAction::Rollback);
        assert_eq!(history[1].action, HistoryAction::Activate);
    }

    #[test]
    fn test_recommendation_rules() {
        let registry = registry_with(&["v1", "v2"]);
        let t = ProcessingType::Production;
        let mut perf = WorkflowMetrics::new();
        perf.insert("throughput".into(), 100.0);
        registry.record_usage("wf", "v1", t, &perf, &WorkflowMetrics::new()).unwrap();
        perf.insert("throughput".into(), 120.0);
        registry.record_usage("wf", "v2", t, &perf, &WorkflowMetrics::new()).unwrap();

        let result = registry.compare("wf", t, "v1", "v2").unwrap();
        assert_eq!(result.performance_delta["throughput"].percent_change, 20.0);
        assert_eq!(result.recommendation, "RECOMMEND: Significant performance improvement");
        assert_eq!(registry.get("wf", "v2", t).unwrap().usage_count, 1);
    }

    #[test]
    fn test_seed_and_promote() {
        let registry = WorkflowRegistry::new();
        registry.seed_defaults().unwrap();
        let promoted = registry
            .promote(
                "v2.0",
                &PromotionRequest {
                    new_version: "v2.0".into(),
                    actor: "lead".into(),
                    reason: "validated".into(),
                    performance_metrics: WorkflowMetrics::new(),
                    set_default: true,
                },
            )
            .unwrap();
        assert_eq!(promoted.processing_type, ProcessingType::Production);
        assert_eq!(promoted.algorithms[&StepType::CosmicRayRemoval].algorithm_id, "lacosmic-v2");

        let active = registry.list_active(Some("cosmic-ray-removal"), Some(ProcessingType::Production));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, "v2.0");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.json");
        let registry = WorkflowRegistry::new();
        registry.seed_defaults().unwrap();
        registry.save(&path).unwrap();

        let loaded = WorkflowRegistry::load(&path).unwrap();
        let v = loaded.get("cosmic-ray-removal", "v1.1", ProcessingType::Production).unwrap();
        assert!(v.active && v.is_default);
        assert_eq!(loaded.list_active(None, None).len(), 2);
    }
}
