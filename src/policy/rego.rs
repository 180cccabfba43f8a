//! Rego-based implementation of the policy evaluation engine using the
//! regorus crate.
//!
//! The engine keeps two caches: compiled queries keyed by
//! `metricID-targetID-configHash`, and the list of applicable metrics per
//! (resource types, tool) combination. Compilation is the dominant cost, so
//! the query cache sits behind a plain mutex; the applicability cache is
//! read-mostly and uses a read-preferring lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use regorus::Engine;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::{ChangeEvent, EventCategory, EventSubscriber, SubscribeFilter};
use crate::evidence::Evidence;
use crate::metrics::{
    Metric, MetricConfiguration, MetricImplementationLanguage, MetricsSource,
    ADDITIONAL_DETAILS_MESSAGE, DEFAULT_COMPLIANT_MESSAGE, DEFAULT_NON_COMPLIANT_MESSAGE,
};
use crate::ontology::Resource;

use super::cache::QueryCache;
use super::{create_key, is_not_found, CombinedResult, PolicyEval};

/// Default package prefix for metric Rego policies
pub const DEFAULT_REGO_PACKAGE: &str = "metrics";

/// A compiled metric policy, prepared for repeated evaluation against
/// different inputs. The underlying engine already contains the policy source
/// and the configuration data document.
#[derive(Clone)]
pub struct PreparedQuery {
    engine: Engine,
    output_path: String,
}

/// Raw outcome of running a prepared query: the metric's output document (if
/// the package produced one) and the injected policy data bindings.
struct QueryOutcome {
    output: Option<serde_json::Value>,
    policy_data: serde_json::Value,
}

impl PreparedQuery {
    fn evaluate(&self, input: &serde_json::Value) -> Result<QueryOutcome> {
        let mut engine = self.engine.clone();
        engine.set_input(json_to_regorus(input));

        let results = engine
            .eval_query(self.output_path.clone(), false)
            .context("could not evaluate rego policy")?;

        let output = results
            .result
            .first()
            .and_then(|result| result.expressions.first())
            .map(|expression| regorus_to_json(&expression.value))
            .filter(|value| !value.is_null());

        let policy = engine
            .eval_query("data.policy".to_string(), false)
            .context("could not read policy data bindings")?;

        let policy_data = policy
            .result
            .first()
            .and_then(|result| result.expressions.first())
            .map(|expression| regorus_to_json(&expression.value))
            .unwrap_or(serde_json::Value::Null);

        Ok(QueryOutcome {
            output,
            policy_data,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(output_path: &str) -> Self {
        Self {
            engine: Engine::new(),
            output_path: output_path.to_string(),
        }
    }
}

/// Policy evaluation engine backed by regorus.
///
/// Construct via [`RegoEval::builder`]; when an event subscriber is
/// configured, a background task listens for metric change events and evicts
/// affected query cache entries. Call [`RegoEval::close`] to stop it.
pub struct RegoEval {
    /// Cached compiled queries
    qc: QueryCache,

    /// Applicable metrics per (resource types, tool) key. `None` marks a
    /// known-invalid entry that forces recomputation.
    mrtc: RwLock<HashMap<String, Option<Vec<Metric>>>>,

    /// Base package prefix used in the metric Rego files
    pkg: String,

    /// Signals the event subscription task to stop
    shutdown: watch::Sender<bool>,
}

pub struct RegoEvalBuilder {
    pkg: String,
    subscriber: Option<Arc<dyn EventSubscriber>>,
}

impl RegoEvalBuilder {
    /// Override the base package prefix of metric policies.
    pub fn package(mut self, pkg: impl Into<String>) -> Self {
        self.pkg = pkg.into();
        self
    }

    /// Subscribe to metric change events for cache invalidation.
    pub fn event_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Build the engine. Must be called within a tokio runtime if an event
    /// subscriber is configured.
    pub fn build(self) -> Arc<RegoEval> {
        let (shutdown, _) = watch::channel(false);

        let engine = Arc::new(RegoEval {
            qc: QueryCache::new(),
            mrtc: RwLock::new(HashMap::new()),
            pkg: self.pkg,
            shutdown,
        });

        if let Some(subscriber) = self.subscriber {
            tokio::spawn(Arc::clone(&engine).subscribe_to_events(subscriber));
        }

        engine
    }
}

impl RegoEval {
    pub fn builder() -> RegoEvalBuilder {
        RegoEvalBuilder {
            pkg: DEFAULT_REGO_PACKAGE.to_string(),
            subscriber: None,
        }
    }

    /// Build an engine with defaults and no event subscription.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Stops the event subscription task, which unregisters itself on exit.
    /// Safe to call more than once.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Listens for metric change events until shutdown or channel close and
    /// evicts affected cache entries. Unregisters on every exit path.
    async fn subscribe_to_events(self: Arc<Self>, subscriber: Arc<dyn EventSubscriber>) {
        let filter = SubscribeFilter {
            categories: vec![
                EventCategory::MetricImplementation,
                EventCategory::MetricConfiguration,
            ],
        };

        let (mut rx, id) = subscriber.register_subscriber(filter);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_metric_event(&event) {
                            warn!(error = %err, "could not handle metric change event");
                        }
                    }
                    None => break,
                },
            }
        }

        if let Err(err) = subscriber.unregister_subscriber(id) {
            warn!(error = %err, "could not unregister event subscriber");
        }
    }

    /// Evaluates a single metric against the given input map. Returns
    /// `Ok(None)` if the metric is not applicable to this resource state.
    fn eval_metric(
        &self,
        target_id: &str,
        metric: &Metric,
        input: &serde_json::Value,
        source: &dyn MetricsSource,
    ) -> Result<Option<CombinedResult>> {
        // Check the current metric configuration first; its hash is part of
        // the cache key, so a changed configuration forces recompilation.
        let config = source.metric_configuration(target_id, metric).map_err(|err| {
            anyhow::Error::new(err).context(format!(
                "could not fetch metric configuration for metric {}",
                metric.name
            ))
        })?;

        let key = format!("{}-{}-{}", metric.id, target_id, config.hash());

        let query = self
            .qc
            .get(&key, |_| self.compile(metric, &config, source))
            .with_context(|| format!("could not fetch cached query for metric {}", metric.name))?;

        let outcome = query
            .evaluate(input)
            .with_context(|| format!("could not evaluate policy for metric {}", metric.name))?;

        let Some(output) = outcome.output else {
            anyhow::bail!(
                "no results. probably the package name of metric {} is wrong",
                metric.name
            );
        };

        let applicable = output
            .get("applicable")
            .and_then(|value| value.as_bool())
            .with_context(|| format!("missing applicable binding for metric {}", metric.name))?;
        let compliant = output
            .get("compliant")
            .and_then(|value| value.as_bool())
            .with_context(|| format!("missing compliant binding for metric {}", metric.name))?;

        let operator = outcome
            .policy_data
            .get("operator")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        let target_value = outcome
            .policy_data
            .get("target_value")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        // Convert the map-based configuration from the policy data document
        // back into a real configuration object.
        let config: MetricConfiguration = serde_json::from_value(
            outcome
                .policy_data
                .get("config")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
        .with_context(|| {
            format!(
                "could not re-encode metric configuration of metric {}",
                metric.name
            )
        })?;

        let comparison_results = match output.get("results") {
            Some(results) => serde_json::from_value(results.clone()).with_context(|| {
                format!("could not decode comparison results of metric {}", metric.name)
            })?,
            None => Vec::new(),
        };

        let message = match output.get("message").and_then(|value| value.as_str()) {
            Some(msg) if !comparison_results.is_empty() => {
                format!("{} {}", msg, ADDITIONAL_DETAILS_MESSAGE)
            }
            Some(msg) => msg.to_string(),
            None if compliant => DEFAULT_COMPLIANT_MESSAGE.to_string(),
            None => DEFAULT_NON_COMPLIANT_MESSAGE.to_string(),
        };

        if !applicable {
            return Ok(None);
        }

        Ok(Some(CombinedResult {
            applicable,
            compliant,
            metric_id: metric.id.clone(),
            metric_name: metric.name.clone(),
            operator,
            target_value,
            config,
            comparison_results,
            message,
        }))
    }

    /// Compiles a metric's policy together with its configuration into a
    /// prepared query.
    fn compile(
        &self,
        metric: &Metric,
        config: &MetricConfiguration,
        source: &dyn MetricsSource,
    ) -> Result<PreparedQuery> {
        let implementation = source
            .metric_implementation(MetricImplementationLanguage::Rego, metric)
            .map_err(|err| {
                anyhow::Error::new(err)
                    .context(format!("could not fetch policy for metric {}", metric.name))
            })?;

        // The configuration is available to the policy as the data.policy
        // document
        let data = serde_json::json!({
            "policy": {
                "operator": config.operator,
                "target_value": config.target_value,
                "config": config,
            }
        });

        let mut engine = Engine::new();
        engine
            .add_policy(format!("{}.rego", metric.name), implementation.code)
            .with_context(|| format!("could not compile policy for metric {}", metric.name))?;
        engine
            .add_data(json_to_regorus(&data))
            .with_context(|| format!("could not add configuration data for metric {}", metric.name))?;

        let pkg = camel_case_to_snake_case(&metric.name);

        Ok(PreparedQuery {
            engine,
            output_path: format!("data.{}.{}", self.pkg, pkg),
        })
    }
}

impl PolicyEval for RegoEval {
    fn eval(
        &self,
        evidence: &Evidence,
        resource: &Resource,
        related: &HashMap<String, Resource>,
        source: &dyn MetricsSource,
    ) -> Result<Vec<CombinedResult>> {
        let mut map = resource.property_map()?;

        if !related.is_empty() {
            let mut related_map = serde_json::Map::new();
            for (id, related_resource) in related {
                related_map.insert(
                    id.clone(),
                    serde_json::Value::Object(related_resource.property_map()?),
                );
            }
            map.insert("related".to_string(), serde_json::Value::Object(related_map));
        }

        let input = serde_json::Value::Object(map);
        let types = resource.type_hierarchy();
        let key = create_key(evidence, types);

        let cached = self.mrtc.read().unwrap().get(&key).cloned().flatten();

        let Some(metrics) = cached else {
            let metrics = source
                .metrics()
                .map_err(|err| anyhow::Error::new(err).context("could not retrieve metric definitions"))?;

            // Hold the write lock while we probe all metrics, so a parallel
            // evaluation for the same key cannot interleave a partial list.
            let mut mrtc = self.mrtc.write().unwrap();

            let mut applicable = Vec::new();
            let mut data = Vec::new();

            for metric in metrics {
                // Try to evaluate the metric and check whether it is
                // applicable (in which case we get a result). A missing
                // implementation or configuration means the metric is not
                // assessed within this toolset; we skip it. Any other error
                // leaves the cache in an unknown state, so the entry is
                // marked invalid before returning.
                match self.eval_metric(&evidence.target_of_evaluation_id, &metric, &input, source) {
                    Ok(Some(result)) => {
                        applicable.push(metric);
                        data.push(result);
                    }
                    Ok(None) => {}
                    Err(err) if is_not_found(&err) => {
                        warn!(
                            key = %key,
                            metric = %metric.name,
                            "ignoring metric because of its missing implementation or default configuration"
                        );
                    }
                    Err(err) => {
                        mrtc.insert(key.clone(), None);
                        return Err(err);
                    }
                }
            }

            info!(
                key = %key,
                len = applicable.len(),
                names = ?names_of(&applicable),
                "resource type has applicable metric(s)"
            );

            mrtc.insert(key, Some(applicable));
            return Ok(data);
        };

        let mut data = Vec::new();
        for metric in &metrics {
            let result =
                self.eval_metric(&evidence.target_of_evaluation_id, metric, &input, source)?;

            // A missing result here means the metric was applicable for this
            // (types, tool) combination in general, but not for this
            // particular resource state, e.g. because fields are unset. Skip
            // it without error.
            if let Some(result) = result {
                data.push(result);
            }
        }

        Ok(data)
    }

    fn handle_metric_event(&self, event: &ChangeEvent) -> Result<()> {
        match event.category {
            EventCategory::MetricImplementation => {
                info!(metric_id = %event.metric_id, "implementation of metric has changed, clearing cache for this metric");
            }
            EventCategory::MetricConfiguration => {
                info!(metric_id = %event.metric_id, "configuration of metric has changed, clearing cache for this metric");
            }
        }

        self.qc.evict(&event.metric_id);
        Ok(())
    }
}

fn names_of(metrics: &[Metric]) -> Vec<&str> {
    metrics.iter().map(|metric| metric.name.as_str()).collect()
}

/// Converts a CamelCase metric name into the snake_case Rego package name.
fn camel_case_to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Convert serde_json Value to regorus Value
fn json_to_regorus(value: &serde_json::Value) -> regorus::Value {
    match value {
        serde_json::Value::Null => regorus::Value::Null,
        serde_json::Value::Bool(b) => regorus::Value::Bool(*b),
        serde_json::Value::Number(n) => regorus::Value::from(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => regorus::Value::String(s.clone().into()),
        serde_json::Value::Array(arr) => {
            let vec: Vec<regorus::Value> = arr.iter().map(json_to_regorus).collect();
            regorus::Value::from(vec)
        }
        serde_json::Value::Object(obj) => {
            let map: BTreeMap<regorus::Value, regorus::Value> = obj
                .iter()
                .map(|(k, v)| (regorus::Value::String(k.clone().into()), json_to_regorus(v)))
                .collect();
            regorus::Value::from(map)
        }
    }
}

/// Convert regorus Value to serde_json Value
fn regorus_to_json(value: &regorus::Value) -> serde_json::Value {
    match value {
        regorus::Value::Null => serde_json::Value::Null,
        regorus::Value::Bool(b) => serde_json::Value::Bool(*b),
        regorus::Value::String(s) => serde_json::Value::String(s.to_string()),
        regorus::Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            serde_json::Value::Number(
                serde_json::Number::from_f64(f).unwrap_or_else(|| serde_json::Number::from(0)),
            )
        }
        regorus::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(regorus_to_json).collect())
        }
        regorus::Value::Set(set) => {
            serde_json::Value::Array(set.iter().map(regorus_to_json).collect())
        }
        regorus::Value::Object(obj) => {
            let map: serde_json::Map<String, serde_json::Value> = obj
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        regorus::Value::String(s) => s.to_string(),
                        other => format!("{}", other),
                    };
                    (key, regorus_to_json(v))
                })
                .collect();
            serde_json::Value::Object(map)
        }
        regorus::Value::Undefined => serde_json::Value::Null,
    }
}
