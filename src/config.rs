//! Pipeline configuration. Every field has a default, so an empty JSON
//! object is a complete configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::detector::DetectorConfig;
use crate::error::{PipelineError, Result};
use crate::explain::ExplainConfig;
use crate::metrics::MetricsConfig;
use crate::scoring::ScoringConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub metrics: MetricsConfig,
    pub scoring: ScoringConfig,
    pub explain: ExplainConfig,
}

/// Read a keyed table and lay its entries over `defaults`. Keys the caller
/// leaves out keep their default value.
pub(crate) fn merge_table<'de, D, K, V>(
    deserializer: D,
    mut defaults: BTreeMap<K, V>,
) -> std::result::Result<BTreeMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
    K: Ord + Deserialize<'de>,
    V: Deserialize<'de>,
{
    defaults.extend(BTreeMap::<K, V>::deserialize(deserializer)?);
    Ok(defaults)
}

/// Two-level variant of [`merge_table`]: inner tables merge per key too.
pub(crate) fn merge_nested_table<'de, D, K, J, V>(
    deserializer: D,
    mut defaults: BTreeMap<K, BTreeMap<J, V>>,
) -> std::result::Result<BTreeMap<K, BTreeMap<J, V>>, D::Error>
where
    D: Deserializer<'de>,
    K: Ord + Deserialize<'de>,
    J: Ord + Deserialize<'de>,
    V: Deserialize<'de>,
{
    for (key, inner) in BTreeMap::<K, BTreeMap<J, V>>::deserialize(deserializer)? {
        defaults.entry(key).or_default().extend(inner);
    }
    Ok(defaults)
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            PipelineError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| PipelineError::InvalidConfig(format!("malformed config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.metrics.validate()?;
        self.scoring.validate()?;
        self.explain.validate()
    }
}
