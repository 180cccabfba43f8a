//! Continuous cloud-compliance assessment core.
//!
//! Evidence about cloud resources flows into the [`assessment::Service`],
//! which resolves related resources, evaluates every applicable metric
//! through a Rego policy engine ([`policy::RegoEval`]) and emits assessment
//! results. Metric definitions, configurations and implementations come from
//! a [`metrics::MetricsSource`]; changes to them are propagated as events
//! that invalidate cached policy queries.

pub mod assessment;
pub mod events;
pub mod evidence;
pub mod metrics;
pub mod ontology;
pub mod policy;

pub use assessment::{AssessmentResult, AssessmentStatus, Service, ASSESSMENT_TOOL_ID};
pub use evidence::Evidence;
pub use metrics::{Metric, MetricConfiguration, MetricsSource};
pub use ontology::Resource;
pub use policy::{CombinedResult, PolicyEval, RegoEval};
