//! Metric change events and the event subscriber contract.
//!
//! The policy engine can subscribe to change events so it can evict cached
//! compiled queries when a metric's implementation or configuration changes
//! upstream.

use tokio::sync::mpsc;

/// What aspect of a metric changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    MetricImplementation,
    MetricConfiguration,
}

/// A change to a metric definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub category: EventCategory,

    /// ID of the metric that changed
    pub metric_id: String,
}

/// Filter restricting which event categories a subscriber receives
#[derive(Debug, Clone, Default)]
pub struct SubscribeFilter {
    /// Categories of interest; an empty list means all categories
    pub categories: Vec<EventCategory>,
}

impl SubscribeFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.categories.is_empty() || self.categories.contains(&event.category)
    }
}

/// Provider of metric change events.
///
/// Publishers must use non-blocking sends so a slow subscriber can never
/// stall event delivery.
pub trait EventSubscriber: Send + Sync {
    /// Register a new subscriber. Returns the receiving end of its event
    /// channel and an ID for later unregistration.
    fn register_subscriber(&self, filter: SubscribeFilter) -> (mpsc::Receiver<ChangeEvent>, i64);

    /// Remove a subscriber. Unregistering an unknown ID is not an error.
    fn unregister_subscriber(&self, id: i64) -> anyhow::Result<()>;
}
