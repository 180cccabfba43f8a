//! In-memory metric store and a configuration-caching source wrapper.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{ChangeEvent, EventCategory, EventSubscriber, SubscribeFilter};

use super::{
    Metric, MetricConfiguration, MetricImplementation, MetricImplementationLanguage,
    MetricsSource, SourceError,
};

/// Buffer size of a subscriber's event channel
const SUBSCRIBER_CHANNEL_BUFFER: usize = 100;

struct StoreState {
    metrics: Vec<Metric>,
    /// Per-target configurations, keyed by (target of evaluation ID, metric ID)
    configurations: HashMap<(String, String), MetricConfiguration>,
    /// Default configurations, keyed by metric ID
    defaults: HashMap<String, MetricConfiguration>,
    /// Implementations, keyed by metric ID
    implementations: HashMap<String, MetricImplementation>,
}

struct Subscriber {
    tx: mpsc::Sender<ChangeEvent>,
    filter: SubscribeFilter,
}

struct SubscriberRegistry {
    subscribers: HashMap<i64, Subscriber>,
    next_id: i64,
}

/// An in-memory [`MetricsSource`] that also publishes change events to
/// registered subscribers whenever a metric's implementation or configuration
/// is updated.
pub struct InMemoryMetricStore {
    state: RwLock<StoreState>,
    registry: Mutex<SubscriberRegistry>,
}

impl InMemoryMetricStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                metrics: Vec::new(),
                configurations: HashMap::new(),
                defaults: HashMap::new(),
                implementations: HashMap::new(),
            }),
            registry: Mutex::new(SubscriberRegistry {
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Add a metric definition. Does not publish an event; implementations
    /// and configurations are registered separately.
    pub fn add_metric(&self, metric: Metric) {
        let mut state = self.state.write().unwrap();
        state.metrics.retain(|m| m.id != metric.id);
        state.metrics.push(metric);
    }

    /// Set or replace a metric's implementation and publish a change event.
    pub fn set_implementation(&self, metric_id: &str, code: impl Into<String>) {
        {
            let mut state = self.state.write().unwrap();
            state.implementations.insert(
                metric_id.to_string(),
                MetricImplementation {
                    metric_id: metric_id.to_string(),
                    lang: MetricImplementationLanguage::Rego,
                    code: code.into(),
                },
            );
        }

        self.publish(ChangeEvent {
            category: EventCategory::MetricImplementation,
            metric_id: metric_id.to_string(),
        });
    }

    /// Set or replace a metric's default configuration and publish a change
    /// event.
    pub fn set_default_configuration(&self, config: MetricConfiguration) {
        let metric_id = config.metric_id.clone();
        {
            let mut state = self.state.write().unwrap();
            state.defaults.insert(metric_id.clone(), config);
        }

        self.publish(ChangeEvent {
            category: EventCategory::MetricConfiguration,
            metric_id,
        });
    }

    /// Set or replace a metric's configuration for one target of evaluation
    /// and publish a change event.
    pub fn set_configuration(&self, config: MetricConfiguration) {
        let metric_id = config.metric_id.clone();
        {
            let mut state = self.state.write().unwrap();
            state.configurations.insert(
                (config.target_of_evaluation_id.clone(), metric_id.clone()),
                config,
            );
        }

        self.publish(ChangeEvent {
            category: EventCategory::MetricConfiguration,
            metric_id,
        });
    }

    /// Number of currently registered event subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().unwrap().subscribers.len()
    }

    /// Publish an event to all subscribers whose filter matches. Sends are
    /// non-blocking; a full channel drops the event for that subscriber.
    fn publish(&self, event: ChangeEvent) {
        let registry = self.registry.lock().unwrap();
        for sub in registry.subscribers.values() {
            if sub.filter.matches(&event) {
                if sub.tx.try_send(event.clone()).is_err() {
                    debug!(metric_id = %event.metric_id, "dropping change event for slow or closed subscriber");
                }
            }
        }
    }
}

impl Default for InMemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for InMemoryMetricStore {
    fn metrics(&self) -> Result<Vec<Metric>, SourceError> {
        Ok(self.state.read().unwrap().metrics.clone())
    }

    fn metric_configuration(
        &self,
        target_id: &str,
        metric: &Metric,
    ) -> Result<MetricConfiguration, SourceError> {
        let state = self.state.read().unwrap();

        if let Some(config) = state
            .configurations
            .get(&(target_id.to_string(), metric.id.clone()))
        {
            return Ok(config.clone());
        }

        // Fall back to the default configuration, scoped to the requested target
        if let Some(default) = state.defaults.get(&metric.id) {
            let mut config = default.clone();
            config.is_default = true;
            config.target_of_evaluation_id = target_id.to_string();
            return Ok(config);
        }

        Err(SourceError::ConfigurationNotFound {
            metric_id: metric.id.clone(),
        })
    }

    fn metric_implementation(
        &self,
        lang: MetricImplementationLanguage,
        metric: &Metric,
    ) -> Result<MetricImplementation, SourceError> {
        if lang != MetricImplementationLanguage::Rego {
            return Err(SourceError::UnsupportedLanguage {
                metric_id: metric.id.clone(),
            });
        }

        self.state
            .read()
            .unwrap()
            .implementations
            .get(&metric.id)
            .cloned()
            .ok_or_else(|| SourceError::ImplementationNotFound {
                metric_id: metric.id.clone(),
            })
    }
}

impl EventSubscriber for InMemoryMetricStore {
    fn register_subscriber(&self, filter: SubscribeFilter) -> (mpsc::Receiver<ChangeEvent>, i64) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_BUFFER);

        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, Subscriber { tx, filter });

        (rx, id)
    }

    fn unregister_subscriber(&self, id: i64) -> anyhow::Result<()> {
        // Dropping the sender closes the subscriber's channel
        self.registry.lock().unwrap().subscribers.remove(&id);
        Ok(())
    }
}

/// How long a cached metric configuration stays valid
pub const CONFIGURATION_EVICTION_TIME: Duration = Duration::from_secs(60 * 60);

struct CachedConfiguration {
    cached_at: Instant,
    config: MetricConfiguration,
}

/// Wraps a [`MetricsSource`] and caches metric configurations for
/// [`CONFIGURATION_EVICTION_TIME`], sparing remote sources one round trip per
/// single-metric evaluation.
pub struct CachedMetricsSource<S> {
    inner: S,
    cached: Mutex<HashMap<String, CachedConfiguration>>,
}

impl<S: MetricsSource> CachedMetricsSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cached: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: MetricsSource> MetricsSource for CachedMetricsSource<S> {
    fn metrics(&self) -> Result<Vec<Metric>, SourceError> {
        self.inner.metrics()
    }

    fn metric_configuration(
        &self,
        target_id: &str,
        metric: &Metric,
    ) -> Result<MetricConfiguration, SourceError> {
        let key = format!("{}-{}", target_id, metric.id);

        {
            let cached = self.cached.lock().unwrap();
            if let Some(entry) = cached.get(&key) {
                if entry.cached_at.elapsed() < CONFIGURATION_EVICTION_TIME {
                    return Ok(entry.config.clone());
                }
            }
        }

        let config = self.inner.metric_configuration(target_id, metric)?;

        self.cached.lock().unwrap().insert(
            key,
            CachedConfiguration {
                cached_at: Instant::now(),
                config: config.clone(),
            },
        );

        Ok(config)
    }

    fn metric_implementation(
        &self,
        lang: MetricImplementationLanguage,
        metric: &Metric,
    ) -> Result<MetricImplementation, SourceError> {
        self.inner.metric_implementation(lang, metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_metric() -> Metric {
        Metric {
            id: "AutomaticUpdatesEnabled".to_string(),
            name: "AutomaticUpdatesEnabled".to_string(),
            category: "EndpointSecurity".to_string(),
            version: "1.0".to_string(),
            comments: String::new(),
        }
    }

    fn sample_config(metric_id: &str, target_id: &str) -> MetricConfiguration {
        MetricConfiguration {
            operator: "==".to_string(),
            target_value: serde_json::json!(true),
            is_default: false,
            metric_id: metric_id.to_string(),
            target_of_evaluation_id: target_id.to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_store_returns_target_configuration_over_default() {
        let store = InMemoryMetricStore::new();
        let metric = sample_metric();
        store.add_metric(metric.clone());

        let mut default = sample_config(&metric.id, "");
        default.is_default = true;
        default.target_value = serde_json::json!(false);
        store.set_default_configuration(default);

        let config = store
            .metric_configuration("target-1", &metric)
            .expect("default configuration");
        assert!(config.is_default);
        assert_eq!(config.target_of_evaluation_id, "target-1");

        store.set_configuration(sample_config(&metric.id, "target-1"));

        let config = store
            .metric_configuration("target-1", &metric)
            .expect("target configuration");
        assert!(!config.is_default);
        assert_eq!(config.target_value, serde_json::json!(true));
    }

    #[test]
    fn test_store_missing_configuration_is_not_found() {
        let store = InMemoryMetricStore::new();
        let metric = sample_metric();
        store.add_metric(metric.clone());

        let err = store
            .metric_configuration("target-1", &metric)
            .expect_err("no configuration");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_store_missing_implementation_is_not_found() {
        let store = InMemoryMetricStore::new();
        let metric = sample_metric();
        store.add_metric(metric.clone());

        let err = store
            .metric_implementation(MetricImplementationLanguage::Rego, &metric)
            .expect_err("no implementation");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_store_publishes_events_to_matching_subscribers() {
        let store = InMemoryMetricStore::new();
        let metric = sample_metric();
        store.add_metric(metric.clone());

        let (mut rx, id) = store.register_subscriber(SubscribeFilter {
            categories: vec![EventCategory::MetricImplementation],
        });

        store.set_implementation(&metric.id, "package metrics.test");
        store.set_default_configuration(sample_config(&metric.id, ""));

        let event = rx.recv().await.expect("implementation event");
        assert_eq!(event.category, EventCategory::MetricImplementation);
        assert_eq!(event.metric_id, metric.id);

        // The configuration event was filtered out; unregistering closes the
        // channel so the next receive terminates.
        store.unregister_subscriber(id).expect("unregister");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_cached_source_serves_configuration_from_cache() {
        let store = InMemoryMetricStore::new();
        let metric = sample_metric();
        store.add_metric(metric.clone());
        store.set_configuration(sample_config(&metric.id, "target-1"));

        let cached = CachedMetricsSource::new(store);

        let first = cached
            .metric_configuration("target-1", &metric)
            .expect("configuration");

        // Change the underlying configuration; the cached wrapper must keep
        // serving the old one until eviction.
        cached.inner.set_configuration(MetricConfiguration {
            target_value: serde_json::json!(false),
            ..sample_config(&metric.id, "target-1")
        });

        let second = cached
            .metric_configuration("target-1", &metric)
            .expect("configuration");
        assert_eq!(first.target_value, second.target_value);
    }
}
