//! Waiting requests for evidence with not-yet-seen related resources.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::evidence::Evidence;
use crate::ontology::Resource;

use super::Service;

/// Buffer size of a waiting request's arrival mailbox. Arrivals are fanned
/// out with a non-blocking send, so the buffer must comfortably hold a burst
/// of incoming resources.
pub(super) const MAILBOX_BUFFER: usize = 1000;

/// Registry entry for one parked evidence. The sender side of the listener's
/// mailbox; arriving resource IDs are pushed through it.
pub(super) struct PendingRequest {
    /// ID of the resource the parked evidence describes
    pub(super) resource_id: String,
    pub(super) tx: mpsc::Sender<String>,
}

/// A parked evidence together with the set of resource IDs it still waits
/// for. Runs as its own task until the set is drained or the mailbox closes.
pub(super) struct WaitingRequest {
    pub(super) evidence: Evidence,
    pub(super) waiting_for: HashSet<String>,
    pub(super) started: Instant,
    pub(super) rx: mpsc::Receiver<String>,
    /// Sender half of our own mailbox; identifies our registry entry when a
    /// re-submitted evidence has replaced it.
    pub(super) tx: mpsc::Sender<String>,
    pub(super) service: Arc<Service>,
}

impl WaitingRequest {
    /// Listens for arriving resources until everything this evidence waits
    /// for is available, then dispatches the assessment exactly once and
    /// deregisters itself.
    pub(super) async fn wait_and_handle(mut self) {
        while !self.waiting_for.is_empty() {
            match self.rx.recv().await {
                Some(resource_id) => {
                    if self.waiting_for.remove(&resource_id) {
                        debug!(
                            evidence_id = %self.evidence.id,
                            resource_id = %resource_id,
                            remaining = self.waiting_for.len(),
                            "related resource arrived"
                        );
                    }
                }
                None => {
                    // All senders dropped; the service is shutting down
                    warn!(
                        evidence_id = %self.evidence.id,
                        "mailbox closed while still waiting for related resources"
                    );
                    self.finish();
                    return;
                }
            }
        }

        debug!(
            evidence_id = %self.evidence.id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "all related resources available, assessing evidence"
        );

        let related = self.gather_related();
        if let Err(err) = self.service.handle_evidence(
            &self.evidence,
            &self.evidence.resource,
            &related,
        ) {
            error!(
                evidence_id = %self.evidence.id,
                error = %format!("{:#}", err),
                "could not assess waiting evidence"
            );
        }

        self.finish();
    }

    /// Collects the resources this evidence declared as related. A resource
    /// that disappeared again is logged and skipped.
    fn gather_related(&self) -> HashMap<String, Resource> {
        let known = self.service.evidence_resources.read().unwrap();

        let mut related = HashMap::new();
        for id in &self.evidence.related_resource_ids {
            match known.get(id) {
                Some(evidence) => {
                    related.insert(id.clone(), evidence.resource.clone());
                }
                None => {
                    warn!(
                        evidence_id = %self.evidence.id,
                        resource_id = %id,
                        "related resource no longer available"
                    );
                }
            }
        }

        related
    }

    fn finish(&self) {
        {
            let mut requests = self.service.requests.lock().unwrap();

            // A re-submitted evidence may have replaced our registry entry;
            // only remove the entry if it is still ours.
            let ours = requests
                .get(&self.evidence.id)
                .is_some_and(|request| request.tx.same_channel(&self.tx));
            if ours {
                requests.remove(&self.evidence.id);
            }
        }

        if self.service.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.service.idle.notify_waiters();
        }
    }
}

impl Service {
    /// Notifies all waiting requests that the given resource is now
    /// available. Sends are non-blocking; the request that belongs to the
    /// arriving resource itself is skipped.
    pub(super) fn inform_waiting_requests(&self, resource_id: &str) {
        let requests = self.requests.lock().unwrap();

        for (evidence_id, request) in requests.iter() {
            if request.resource_id == resource_id {
                continue;
            }

            if request.tx.try_send(resource_id.to_string()).is_err() {
                warn!(
                    evidence_id = %evidence_id,
                    resource_id = %resource_id,
                    "could not notify waiting request"
                );
            }
        }
    }
}
