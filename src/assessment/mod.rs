//! Assessment entry point and related-evidence reconciliation.
//!
//! Evidence whose related resources have all been seen is assessed
//! immediately; otherwise a waiting request is registered that listens for
//! arriving resources and dispatches the policy engine exactly once when its
//! missing set becomes empty.

mod waiting;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::evidence::Evidence;
use crate::metrics::{ComparisonResult, MetricConfiguration, MetricsSource};
use crate::ontology::Resource;
use crate::policy::PolicyEval;

use waiting::{PendingRequest, WaitingRequest, MAILBOX_BUFFER};

/// Tool identifier recorded on every assessment result
pub const ASSESSMENT_TOOL_ID: &str = "Conformity Assessment";

/// Outcome of submitting one evidence for assessment
#[derive(Debug)]
pub enum AssessmentStatus {
    /// The evidence was assessed immediately
    Assessed(Vec<AssessmentResult>),

    /// The evidence waits for related resources; assessment happens in the
    /// background once they arrive
    WaitingForRelated,
}

/// The result of assessing one evidence against one metric.
#[derive(Debug, Clone)]
pub struct AssessmentResult {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub target_of_evaluation_id: String,
    pub metric_id: String,
    pub metric_configuration: MetricConfiguration,
    pub compliant: bool,
    pub evidence_id: String,
    pub resource_id: String,
    pub resource_types: Vec<String>,
    pub compliance_comment: String,
    pub compliance_details: Vec<ComparisonResult>,
    pub tool_id: String,
}

/// Hook informed about every assessment result and every evaluation failure.
pub type ResultHook = Box<dyn Fn(Result<&AssessmentResult, &anyhow::Error>) + Send + Sync>;

/// The assessment service. Owns the policy engine, the known-resource map and
/// the registry of waiting requests.
pub struct Service {
    engine: Arc<dyn PolicyEval>,
    source: Arc<dyn MetricsSource>,

    /// Maps a resource ID to its latest available evidence
    evidence_resources: RwLock<HashMap<String, Evidence>>,

    /// Waiting requests, keyed by evidence ID
    requests: Mutex<HashMap<String, PendingRequest>>,

    result_hooks: RwLock<Vec<ResultHook>>,

    /// Number of listener tasks still running
    pending: AtomicUsize,
    idle: Notify,
}

impl Service {
    pub fn new(engine: Arc<dyn PolicyEval>, source: Arc<dyn MetricsSource>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            source,
            evidence_resources: RwLock::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            result_hooks: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Register a hook that is informed about each assessment result.
    pub fn register_result_hook(&self, hook: ResultHook) {
        self.result_hooks.write().unwrap().push(hook);
    }

    /// Assess a single evidence. If all of its declared related resources
    /// are already known, the assessment happens immediately; otherwise the
    /// evidence is parked until the missing resources arrive.
    pub async fn assess_evidence(self: &Arc<Self>, evidence: Evidence) -> Result<AssessmentStatus> {
        let resource = evidence.resource.clone();
        let resource_id = resource.id().to_string();

        let mut waiting_for: HashSet<String> = HashSet::new();
        let mut related: HashMap<String, Resource> = HashMap::new();

        {
            let mut known = self.evidence_resources.write().unwrap();

            // Check whether the related resource evidences have already
            // arrived; everything not yet known goes into the missing set.
            for id in &evidence.related_resource_ids {
                match known.get(id) {
                    Some(related_evidence) => {
                        related.insert(id.clone(), related_evidence.resource.clone());
                    }
                    None => {
                        waiting_for.insert(id.clone());
                    }
                }
            }

            // Record our own resource so future dependents resolve against it
            known.insert(resource_id.clone(), evidence.clone());

            if !waiting_for.is_empty() {
                // Register the waiting request before the known-resource lock
                // is released: a concurrently arriving resource then either
                // shows up in the missing-set computation above or notifies
                // the freshly registered mailbox, never neither.
                let (tx, rx) = mpsc::channel(MAILBOX_BUFFER);
                self.requests.lock().unwrap().insert(
                    evidence.id.clone(),
                    PendingRequest {
                        resource_id: resource_id.clone(),
                        tx: tx.clone(),
                    },
                );
                self.pending.fetch_add(1, Ordering::AcqRel);

                let request = WaitingRequest {
                    evidence: evidence.clone(),
                    waiting_for: waiting_for.clone(),
                    started: Instant::now(),
                    rx,
                    tx,
                    service: Arc::clone(self),
                };
                tokio::spawn(request.wait_and_handle());
            }
        }

        // Inform any left-over evidences that might be waiting on us
        self.inform_waiting_requests(&resource_id);

        if waiting_for.is_empty() {
            let results = self.handle_evidence(&evidence, &resource, &related)?;
            Ok(AssessmentStatus::Assessed(results))
        } else {
            debug!(
                evidence_id = %evidence.id,
                waiting_for = waiting_for.len(),
                "evidence needs to wait for more resource(s)"
            );
            Ok(AssessmentStatus::WaitingForRelated)
        }
    }

    /// Number of evidences currently waiting for related resources.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Waits until no listener task is running anymore. Intended for
    /// shutdown and tests; does not prevent new evidence from being parked.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }

            notified.await;
        }
    }

    /// Runs the policy engine for one evidence and turns the evaluations
    /// into assessment results.
    pub(crate) fn handle_evidence(
        &self,
        evidence: &Evidence,
        resource: &Resource,
        related: &HashMap<String, Resource>,
    ) -> Result<Vec<AssessmentResult>> {
        debug!(
            evidence_id = %evidence.id,
            resource_id = %resource.id(),
            tool_id = %evidence.tool_id,
            "evaluating evidence"
        );

        let evaluations = match self
            .engine
            .eval(evidence, resource, related, self.source.as_ref())
            .context("could not evaluate evidence")
        {
            Ok(evaluations) => evaluations,
            Err(err) => {
                self.inform_hooks(Err(&err));
                return Err(err);
            }
        };

        if evaluations.is_empty() {
            debug!(
                evidence_id = %evidence.id,
                resource_id = %resource.id(),
                "no policy evaluation for evidence"
            );
            return Ok(Vec::new());
        }

        let types: Vec<String> = resource
            .type_hierarchy()
            .iter()
            .map(|t| t.to_string())
            .collect();

        let mut results = Vec::with_capacity(evaluations.len());
        for evaluation in evaluations {
            debug!(
                evidence_id = %evidence.id,
                metric_id = %evaluation.metric_id,
                compliant = evaluation.compliant,
                "evaluated evidence with metric"
            );

            let result = AssessmentResult {
                id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                target_of_evaluation_id: evidence.target_of_evaluation_id.clone(),
                metric_id: evaluation.metric_id,
                metric_configuration: evaluation.config,
                compliant: evaluation.compliant,
                evidence_id: evidence.id.clone(),
                resource_id: resource.id().to_string(),
                resource_types: types.clone(),
                compliance_comment: evaluation.message,
                compliance_details: evaluation.comparison_results,
                tool_id: ASSESSMENT_TOOL_ID.to_string(),
            };

            self.inform_hooks(Ok(&result));
            results.push(result);
        }

        Ok(results)
    }

    fn inform_hooks(&self, outcome: Result<&AssessmentResult, &anyhow::Error>) {
        let hooks = self.result_hooks.read().unwrap();
        for hook in hooks.iter() {
            hook(outcome);
        }
    }
}
