//! Catalogue of calibration algorithm variants and their parameter schemas.

use crate::core::steps::{
    BiasStep, DarkStep, DarkVariant, FlatStep, LaCosmicStep, MedianFilterStep, StepAlgorithm, UnsupportedStep,
};
use crate::types::{CalError, CalResult, ParamMap, ParamValue, StepType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stability {
    Stable,
    Experimental,
}

/// Which variants `list` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StabilityFilter {
    #[default]
    All,
    Stable,
    Experimental,
}

impl StabilityFilter {
    fn accepts(&self, stability: Stability) -> bool {
        match self {
            StabilityFilter::All => true,
            StabilityFilter::Stable => stability == Stability::Stable,
            StabilityFilter::Experimental => stability == Stability::Experimental,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
}

/// Schema entry for one algorithm parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: ParamValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub choices: Vec<String>,
    /// Legacy spellings accepted on input
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub aliases: Vec<String>,
    pub description: String,
}

impl ParamSpec {
    fn new(name: &str, kind: ParamKind, default: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default,
            min: None,
            max: None,
            choices: Vec::new(),
            aliases: Vec::new(),
            description: String::new(),
        }
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        Self::new(name, ParamKind::Bool, ParamValue::Bool(default))
    }

    pub fn int(name: &str, default: i64) -> Self {
        Self::new(name, ParamKind::Int, ParamValue::Int(default))
    }

    pub fn float(name: &str, default: f64) -> Self {
        Self::new(name, ParamKind::Float, ParamValue::Float(default))
    }

    pub fn choice(name: &str, default: &str, choices: &[&str]) -> Self {
        let mut spec = Self::new(name, ParamKind::Str, ParamValue::Str(default.to_string()));
        spec.choices = choices.iter().map(|c| c.to_string()).collect();
        spec
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        self.name.eq_ignore_ascii_case(key) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(key))
    }

    /// Convert a caller value to this parameter's type and check its bounds
    pub fn coerce(&self, value: &ParamValue) -> CalResult<ParamValue> {
        let mismatch = || CalError::ParameterOutOfRange {
            name: self.name.clone(),
            message: format!("expected {:?}, got '{}'", self.kind, value),
        };

        let coerced = match (self.kind, value) {
            (ParamKind::Bool, ParamValue::Bool(b)) => ParamValue::Bool(*b),
            (ParamKind::Bool, ParamValue::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => ParamValue::Bool(true),
                "false" | "no" | "0" => ParamValue::Bool(false),
                _ => return Err(mismatch()),
            },
            (ParamKind::Int, ParamValue::Int(i)) => ParamValue::Int(*i),
            (ParamKind::Int, ParamValue::Float(f)) if f.fract() == 0.0 && f.is_finite() => ParamValue::Int(*f as i64),
            (ParamKind::Int, ParamValue::Str(s)) => ParamValue::Int(s.trim().parse().map_err(|_| mismatch())?),
            (ParamKind::Float, ParamValue::Float(f)) => ParamValue::Float(*f),
            (ParamKind::Float, ParamValue::Int(i)) => ParamValue::Float(*i as f64),
            (ParamKind::Float, ParamValue::Str(s)) => ParamValue::Float(s.trim().parse().map_err(|_| mismatch())?),
            (ParamKind::Str, ParamValue::Str(s)) => ParamValue::Str(s.clone()),
            _ => return Err(mismatch()),
        };

        if let Some(x) = match &coerced {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        } {
            if !x.is_finite() {
                return Err(CalError::ParameterOutOfRange {
                    name: self.name.clone(),
                    message: "value is not finite".to_string(),
                });
            }
            if self.min.map_or(false, |m| x < m) || self.max.map_or(false, |m| x > m) {
                return Err(CalError::ParameterOutOfRange {
                    name: self.name.clone(),
                    message: format!(
                        "{} outside [{}, {}]",
                        x,
                        self.min.map_or("-inf".to_string(), |m| m.to_string()),
                        self.max.map_or("inf".to_string(), |m| m.to_string())
                    ),
                });
            }
        }

        if let ParamValue::Str(s) = &coerced {
            if !self.choices.is_empty() {
                return match self.choices.iter().find(|c| c.eq_ignore_ascii_case(s.trim())) {
                    Some(c) => Ok(ParamValue::Str(c.clone())),
                    None => Err(CalError::ParameterOutOfRange {
                        name: self.name.clone(),
                        message: format!("'{}' is not one of {:?}", s, self.choices),
                    }),
                };
            }
        }
        Ok(coerced)
    }
}

/// Static description of one algorithm variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmDescriptor {
    pub step_type: StepType,
    pub id: String,
    pub name: String,
    pub version: String,
    pub stability: Stability,
    /// False for variants that are catalogued but cannot run
    pub supported: bool,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

/// Parameters after defaults, aliases and validation
#[derive(Debug, Clone, Default)]
pub struct ResolvedParams {
    pub params: ParamMap,
    pub warnings: Vec<String>,
}

impl AlgorithmDescriptor {
    pub fn new(step_type: StepType, id: &str, name: &str, version: &str, stability: Stability) -> Self {
        Self {
            step_type,
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            stability,
            supported: true,
            description: String::new(),
            params: Vec::new(),
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    pub fn is_stable(&self) -> bool {
        self.stability == Stability::Stable
    }

    pub fn param_spec(&self, key: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.matches(key))
    }

    pub fn default_params(&self) -> ParamMap {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect()
    }

    /// Merge caller values over the defaults; caller wins.
    ///
    /// Unknown names fail when `strict`, otherwise they are dropped with a warning.
    pub fn resolve_params(&self, caller: &ParamMap, strict: bool) -> CalResult<ResolvedParams> {
        let mut resolved = ResolvedParams {
            params: self.default_params(),
            warnings: Vec::new(),
        };
        for (key, value) in caller {
            match self.param_spec(key) {
                Some(spec) => {
                    let value = spec.coerce(value)?;
                    resolved.params.insert(spec.name.clone(), value);
                }
                None if strict => {
                    return Err(CalError::UnknownParameter {
                        algorithm: self.id.clone(),
                        name: key.clone(),
                    })
                }
                None => {
                    log::warn!("Ignoring unknown parameter '{}' for {}", key, self.id);
                    resolved
                        .warnings
                        .push(format!("ignored unknown parameter '{}'", key));
                }
            }
        }
        Ok(resolved)
    }
}

/// Fixed set of algorithm implementations, keyed by step type
pub struct AlgorithmRegistry {
    algorithms: BTreeMap<StepType, Vec<Arc<dyn StepAlgorithm>>>,
}

impl AlgorithmRegistry {
    /// Registry populated with every built-in variant
    pub fn new() -> Self {
        let mut registry = Self {
            algorithms: BTreeMap::new(),
        };
        registry.register(Arc::new(BiasStep::standard()));
        registry.register(Arc::new(BiasStep::robust()));
        registry.register(Arc::new(DarkStep::new(DarkVariant::Default)));
        registry.register(Arc::new(DarkStep::new(DarkVariant::Scaled)));
        registry.register(Arc::new(DarkStep::new(DarkVariant::Adaptive)));
        registry.register(Arc::new(FlatStep::standard()));
        registry.register(Arc::new(FlatStep::illumination_corrected()));
        registry.register(Arc::new(LaCosmicStep::classic()));
        registry.register(Arc::new(LaCosmicStep::enhanced()));
        registry.register(Arc::new(MedianFilterStep::new()));
        registry.register(Arc::new(UnsupportedStep::neural_cr()));
        log::debug!(
            "Algorithm registry initialised with {} variants",
            registry.algorithms.values().map(Vec::len).sum::<usize>()
        );
        registry
    }

    fn register(&mut self, algorithm: Arc<dyn StepAlgorithm>) {
        let step_type = algorithm.descriptor().step_type;
        self.algorithms.entry(step_type).or_default().push(algorithm);
    }

    pub fn parse_step_type(name: &str) -> CalResult<StepType> {
        StepType::parse(name).ok_or_else(|| CalError::UnknownAlgorithm {
            step_type: name.to_string(),
            algorithm: String::new(),
        })
    }

    pub fn list(&self, step_type: StepType, filter: StabilityFilter) -> Vec<&AlgorithmDescriptor> {
        self.algorithms
            .get(&step_type)
            .map(|algs| {
                algs.iter()
                    .map(|a| a.descriptor())
                    .filter(|d| filter.accepts(d.stability))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_all(&self, filter: StabilityFilter) -> Vec<&AlgorithmDescriptor> {
        StepType::ALL
            .iter()
            .flat_map(|&t| self.list(t, filter))
            .collect()
    }

    /// Look up a variant; `"default"` is the first stable variant of the type
    pub fn get(&self, step_type: StepType, algorithm_id: &str) -> CalResult<Arc<dyn StepAlgorithm>> {
        let unknown = || CalError::UnknownAlgorithm {
            step_type: step_type.to_string(),
            algorithm: algorithm_id.to_string(),
        };
        let algs = self.algorithms.get(&step_type).ok_or_else(unknown)?;
        let id = algorithm_id.trim();
        let found = algs
            .iter()
            .find(|a| a.descriptor().id.eq_ignore_ascii_case(id))
            .or_else(|| {
                if id.eq_ignore_ascii_case("default") || id.is_empty() {
                    algs.iter().find(|a| a.descriptor().is_stable())
                } else {
                    None
                }
            });
        found.cloned().ok_or_else(unknown)
    }

    pub fn describe(&self, step_type: StepType, algorithm_id: &str) -> CalResult<AlgorithmDescriptor> {
        Ok(self.get(step_type, algorithm_id)?.descriptor().clone())
    }

    pub fn is_stable(&self, step_type: StepType, algorithm_id: &str) -> CalResult<bool> {
        Ok(self.get(step_type, algorithm_id)?.descriptor().is_stable())
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_step_type_has_a_stable_default() {
        let registry = AlgorithmRegistry::new();
        for step_type in StepType::ALL {
            let alg = registry.get(step_type, "default").unwrap();
            assert!(alg.descriptor().is_stable());
        }
    }

    #[test]
    fn test_list_filters_by_stability() {
        let registry = AlgorithmRegistry::new();
        let experimental = registry.list(StepType::CosmicRayRemoval, StabilityFilter::Experimental);
        assert_eq!(experimental.len(), 1);
        assert_eq!(experimental[0].id, "neural-cr");
        assert!(!experimental[0].supported);
        let all = registry.list(StepType::CosmicRayRemoval, StabilityFilter::All);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_unknown_algorithm() {
        let registry = AlgorithmRegistry::new();
        assert!(matches!(
            registry.get(StepType::DarkSubtraction, "nope"),
            Err(CalError::UnknownAlgorithm { .. })
        ));
    }

    #[test]
    fn test_aliases_and_coercion() {
        let registry = AlgorithmRegistry::new();
        let desc = registry.describe(StepType::CosmicRayRemoval, "lacosmic").unwrap();
        let mut caller = ParamMap::new();
        caller.insert("sigclip".to_string(), ParamValue::Int(6));
        caller.insert("niter".to_string(), ParamValue::Str("2".to_string()));
        let resolved = desc.resolve_params(&caller, true).unwrap();
        assert_eq!(resolved.params["sigma_clip"], ParamValue::Float(6.0));
        assert_eq!(resolved.params["max_iter"], ParamValue::Int(2));
        assert_eq!(resolved.params["obj_lim"], ParamValue::Float(5.0));
    }

    #[test]
    fn test_strict_unknown_parameter() {
        let registry = AlgorithmRegistry::new();
        let desc = registry.describe(StepType::BiasSubtraction, "default").unwrap();
        let mut caller = ParamMap::new();
        caller.insert("bogus".to_string(), ParamValue::Bool(true));
        assert!(matches!(
            desc.resolve_params(&caller, true),
            Err(CalError::UnknownParameter { .. })
        ));
        let lenient = desc.resolve_params(&caller, false).unwrap();
        assert_eq!(lenient.warnings.len(), 1);
        assert!(!lenient.params.contains_key("bogus"));
    }

    #[test]
    fn test_out_of_range_and_choices() {
        let registry = AlgorithmRegistry::new();
        let desc = registry.describe(StepType::BiasSubtraction, "robust-bias").unwrap();
        let spec = desc.param_spec("rejection_method").unwrap();
        assert_eq!(spec.coerce(&ParamValue::from("MAD")).unwrap(), ParamValue::from("mad"));
        assert!(spec.coerce(&ParamValue::from("median")).is_err());

        let dark = registry.describe(StepType::DarkSubtraction, "default").unwrap();
        let scale = dark.param_spec("scale_factor").unwrap();
        assert!(matches!(
            scale.coerce(&ParamValue::Float(500.0)),
            Err(CalError::ParameterOutOfRange { .. })
        ));
        assert!(scale.coerce(&ParamValue::Bool(true)).is_err());
    }
}
