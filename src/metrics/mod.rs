//! Metric definitions and the metric source contract.
//!
//! Metrics are defined externally and fetched on demand through a
//! [`MetricsSource`]. The policy engine treats "implementation or
//! configuration not found" specially during applicability probing, so those
//! conditions are distinguishable variants of [`SourceError`].

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub use store::{CachedMetricsSource, InMemoryMetricStore};

/// Default message for a compliant result without a metric-supplied message
pub const DEFAULT_COMPLIANT_MESSAGE: &str =
    "The result of the metric shows that the evidence is compliant to the target value.";

/// Default message for a non-compliant result without a metric-supplied message
pub const DEFAULT_NON_COMPLIANT_MESSAGE: &str =
    "The result of the metric indicates that the resource contains properties that are not compliant with the target value.";

/// Note appended to a message when itemized comparison results are available
pub const ADDITIONAL_DETAILS_MESSAGE: &str =
    "Additional details can be found in the comparison below.";

/// A named compliance rule with a pluggable implementation and per-target
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub name: String,
    pub category: String,
    pub version: String,
    #[serde(default)]
    pub comments: String,
}

/// Language of a metric implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricImplementationLanguage {
    Rego,
}

/// The policy code implementing a metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricImplementation {
    pub metric_id: String,
    pub lang: MetricImplementationLanguage,
    pub code: String,
}

/// Configuration of a metric for one target of evaluation: the comparison
/// operator and target value the metric's policy compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConfiguration {
    /// Comparison operator, e.g. `==` or `<=`
    pub operator: String,

    /// The value the observed property is compared against
    pub target_value: serde_json::Value,

    /// Whether this is the metric's default configuration
    pub is_default: bool,

    pub metric_id: String,

    pub target_of_evaluation_id: String,

    pub updated_at: DateTime<Utc>,
}

impl MetricConfiguration {
    /// Content hash of this configuration, used as part of the query cache
    /// key. Any change to operator or target value yields a new hash, which
    /// makes stale cached queries unreachable.
    pub fn hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.operator.as_bytes());
        hasher.update(b"-");
        hasher.update(self.target_value.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A single itemized comparison a metric performed, if the policy supplies
/// them in its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Name of the compared property
    pub property: String,

    /// The observed value
    pub value: serde_json::Value,

    /// The configured target value
    pub target_value: serde_json::Value,

    pub operator: String,

    pub success: bool,
}

/// Errors returned by a [`MetricsSource`].
///
/// The not-found variants are tolerated during applicability probing: a
/// metric without an implementation or configuration for the current target
/// is simply not offered there.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("implementation for metric {metric_id} not found")]
    ImplementationNotFound { metric_id: String },

    #[error("metric configuration not found for metric {metric_id}")]
    ConfigurationNotFound { metric_id: String },

    #[error("unsupported language for metric {metric_id}")]
    UnsupportedLanguage { metric_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    /// Whether this error means the metric is simply not defined for the
    /// requested target (as opposed to a real failure).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SourceError::ImplementationNotFound { .. }
                | SourceError::ConfigurationNotFound { .. }
        )
    }
}

/// Source of metric definitions, configurations and implementations.
///
/// Typically backed by an orchestrator service; the in-memory
/// [`InMemoryMetricStore`] implementation is provided for embedding and
/// testing.
pub trait MetricsSource: Send + Sync {
    /// All defined metrics
    fn metrics(&self) -> Result<Vec<Metric>, SourceError>;

    /// The configuration of the given metric for the given target of
    /// evaluation
    fn metric_configuration(
        &self,
        target_id: &str,
        metric: &Metric,
    ) -> Result<MetricConfiguration, SourceError>;

    /// The implementation code of the given metric in the given language
    fn metric_implementation(
        &self,
        lang: MetricImplementationLanguage,
        metric: &Metric,
    ) -> Result<MetricImplementation, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_configuration(target_value: serde_json::Value) -> MetricConfiguration {
        MetricConfiguration {
            operator: "==".to_string(),
            target_value,
            is_default: true,
            metric_id: "AutomaticUpdatesEnabled".to_string(),
            target_of_evaluation_id: "target-1".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_configuration_hash_is_stable() {
        let config = sample_configuration(serde_json::json!(true));
        assert_eq!(config.hash(), config.hash());
    }

    #[test]
    fn test_configuration_hash_changes_with_target_value() {
        let config = sample_configuration(serde_json::json!(true));
        let changed = sample_configuration(serde_json::json!(false));
        assert_ne!(config.hash(), changed.hash());
    }

    #[test]
    fn test_configuration_hash_changes_with_operator() {
        let config = sample_configuration(serde_json::json!(42));
        let mut changed = config.clone();
        changed.operator = "<=".to_string();
        assert_ne!(config.hash(), changed.hash());
    }

    #[test]
    fn test_source_error_not_found_classification() {
        let err = SourceError::ImplementationNotFound {
            metric_id: "m1".to_string(),
        };
        assert!(err.is_not_found());

        let err = SourceError::ConfigurationNotFound {
            metric_id: "m1".to_string(),
        };
        assert!(err.is_not_found());

        let err = SourceError::Other(anyhow::anyhow!("connection refused"));
        assert!(!err.is_not_found());
    }
}
