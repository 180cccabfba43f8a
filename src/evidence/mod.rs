//! Evidence submitted by collector tools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ontology::Resource;

/// A timestamped observation of one resource's state, submitted by a
/// collector tool for assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Unique identifier of this evidence
    pub id: String,

    /// Identifier of the tool that collected this evidence
    pub tool_id: String,

    /// The target of evaluation this evidence belongs to
    pub target_of_evaluation_id: String,

    /// Point in time the observation was made
    pub timestamp: DateTime<Utc>,

    /// The observed resource state
    pub resource: Resource,

    /// IDs of resources this evidence depends on. Assessment is deferred
    /// until evidence for all of them has been seen.
    pub related_resource_ids: Vec<String>,
}

impl Evidence {
    /// Create a new evidence for the given resource, timestamped now.
    pub fn new(
        id: impl Into<String>,
        tool_id: impl Into<String>,
        target_of_evaluation_id: impl Into<String>,
        resource: Resource,
    ) -> Self {
        Self {
            id: id.into(),
            tool_id: tool_id.into(),
            target_of_evaluation_id: target_of_evaluation_id.into(),
            timestamp: Utc::now(),
            resource,
            related_resource_ids: Vec::new(),
        }
    }

    /// Declare related resources this evidence should wait for.
    pub fn with_related(mut self, ids: Vec<String>) -> Self {
        self.related_resource_ids = ids;
        self
    }
}
