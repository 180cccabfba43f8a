//! Policy evaluation engine.
//!
//! The engine decides which compliance metrics apply to a resource, compiles
//! and executes their Rego implementations against the resource's property
//! map and returns one [`CombinedResult`] per applicable metric.

pub mod cache;
pub mod rego;

use std::collections::HashMap;

use anyhow::Result;

use crate::events::ChangeEvent;
use crate::evidence::Evidence;
use crate::metrics::{ComparisonResult, MetricConfiguration, MetricsSource, SourceError};
use crate::ontology::Resource;

pub use rego::{RegoEval, RegoEvalBuilder, DEFAULT_REGO_PACKAGE};

/// Outcome of evaluating one metric against one resource.
#[derive(Debug, Clone)]
pub struct CombinedResult {
    pub applicable: bool,
    pub compliant: bool,
    pub metric_id: String,
    pub metric_name: String,

    /// The configured comparison operator
    pub operator: String,

    /// The configured target value
    pub target_value: serde_json::Value,

    /// The configuration the metric was evaluated with
    pub config: MetricConfiguration,

    /// Optional itemized comparisons supplied by the metric
    pub comparison_results: Vec<ComparisonResult>,

    /// Human readable representation of the result
    pub message: String,
}

/// The policy evaluation contract (enables testing and alternative engines).
pub trait PolicyEval: Send + Sync {
    /// Evaluate all applicable metrics for the given evidence. The callee
    /// supplies the already-unwrapped resource plus any related resources
    /// keyed by their ID.
    ///
    /// Metrics that turn out not to be applicable are not part of the result.
    fn eval(
        &self,
        evidence: &Evidence,
        resource: &Resource,
        related: &HashMap<String, Resource>,
        source: &dyn MetricsSource,
    ) -> Result<Vec<CombinedResult>>;

    /// React to a metric change event, evicting cached queries for the
    /// changed metric.
    fn handle_metric_event(&self, event: &ChangeEvent) -> Result<()>;
}

/// Creates an applicability cache key by concatenating the resource type list
/// and the tool ID, with internal whitespace stripped.
pub(crate) fn create_key(evidence: &Evidence, types: &[&str]) -> String {
    let mut parts: Vec<&str> = types.to_vec();
    parts.push(&evidence.tool_id);
    parts.join("-").replace(' ', "")
}

/// Whether the error chain contains a "not found" metric source error,
/// meaning the metric is simply not offered for this target.
pub(crate) fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<SourceError>()
            .is_some_and(|e| e.is_not_found())
    })
}
