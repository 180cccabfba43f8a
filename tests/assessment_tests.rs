//! End-to-end tests running the assessment service against the real Rego
//! policy engine and the in-memory metric store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use conformity::assessment::{AssessmentResult, AssessmentStatus, Service, ASSESSMENT_TOOL_ID};
use conformity::events::EventSubscriber;
use conformity::evidence::Evidence;
use conformity::metrics::{
    InMemoryMetricStore, Metric, MetricConfiguration, MetricsSource, DEFAULT_COMPLIANT_MESSAGE,
    DEFAULT_NON_COMPLIANT_MESSAGE,
};
use conformity::ontology::{AtRestEncryption, AutomaticUpdates, BlockStorage, Resource, VirtualMachine};
use conformity::policy::RegoEval;

/// Routes engine and service logs into the test harness output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

const AUTOMATIC_UPDATES_ENABLED: &str = "AutomaticUpdatesEnabled";
const AT_REST_ENCRYPTION_ENABLED: &str = "AtRestEncryptionEnabled";
const MOUNTED_STORAGE_ENCRYPTED: &str = "MountedStorageEncrypted";

const AUTOMATIC_UPDATES_ENABLED_REGO: &str = r#"
package metrics.automatic_updates_enabled

default applicable = false
default compliant = false

applicable {
    input.automatic_updates
}

compliant {
    input.automatic_updates.enabled == data.policy.target_value
}
"#;

const AT_REST_ENCRYPTION_ENABLED_REGO: &str = r#"
package metrics.at_rest_encryption_enabled

default applicable = false
default compliant = false

applicable {
    input.at_rest_encryption
}

compliant {
    input.at_rest_encryption.enabled == data.policy.target_value
}
"#;

const MOUNTED_STORAGE_ENCRYPTED_REGO: &str = r#"
package metrics.mounted_storage_encrypted

default applicable = false
default compliant = false

applicable {
    count(input.block_storage_ids) > 0
}

compliant {
    id := input.block_storage_ids[0]
    input.related[id].at_rest_encryption.enabled == true
}
"#;

fn metric(id: &str) -> Metric {
    Metric {
        id: id.to_string(),
        name: id.to_string(),
        category: "Testing".to_string(),
        version: "1.0".to_string(),
        comments: String::new(),
    }
}

fn default_config(metric_id: &str) -> MetricConfiguration {
    MetricConfiguration {
        operator: "==".to_string(),
        target_value: serde_json::json!(true),
        is_default: true,
        metric_id: metric_id.to_string(),
        target_of_evaluation_id: String::new(),
        updated_at: Utc::now(),
    }
}

fn store_with_metrics() -> Arc<InMemoryMetricStore> {
    let store = Arc::new(InMemoryMetricStore::new());

    for (id, code) in [
        (AUTOMATIC_UPDATES_ENABLED, AUTOMATIC_UPDATES_ENABLED_REGO),
        (AT_REST_ENCRYPTION_ENABLED, AT_REST_ENCRYPTION_ENABLED_REGO),
        (MOUNTED_STORAGE_ENCRYPTED, MOUNTED_STORAGE_ENCRYPTED_REGO),
    ] {
        store.add_metric(metric(id));
        store.set_implementation(id, code);
        store.set_default_configuration(default_config(id));
    }

    store
}

fn vm_evidence(evidence_id: &str, updates_enabled: bool) -> Evidence {
    Evidence::new(
        evidence_id,
        "test-collector",
        "target-1",
        Resource::VirtualMachine(VirtualMachine {
            id: "vm-1".to_string(),
            name: "my vm".to_string(),
            automatic_updates: Some(AutomaticUpdates {
                enabled: updates_enabled,
                interval_days: 1,
                security_only: false,
            }),
            block_storage_ids: vec![],
            network_interface_ids: vec![],
        }),
    )
}

fn assessed(status: AssessmentStatus) -> Vec<AssessmentResult> {
    match status {
        AssessmentStatus::Assessed(results) => results,
        AssessmentStatus::WaitingForRelated => panic!("evidence should not wait"),
    }
}

#[tokio::test]
async fn test_compliant_virtual_machine() {
    init_tracing();
    let store = store_with_metrics();
    let engine = RegoEval::builder().build();
    let service = Service::new(engine, store as Arc<dyn MetricsSource>);

    let results = assessed(
        service
            .assess_evidence(vm_evidence("ev-1", true))
            .await
            .expect("assessment"),
    );

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.metric_id, AUTOMATIC_UPDATES_ENABLED);
    assert!(result.compliant);
    assert_eq!(result.compliance_comment, DEFAULT_COMPLIANT_MESSAGE);
    assert_eq!(result.tool_id, ASSESSMENT_TOOL_ID);
    assert_eq!(result.resource_id, "vm-1");
    assert_eq!(result.target_of_evaluation_id, "target-1");
    assert!(result.metric_configuration.is_default);
}

#[tokio::test]
async fn test_non_compliant_virtual_machine() {
    init_tracing();
    let store = store_with_metrics();
    let engine = RegoEval::builder().build();
    let service = Service::new(engine, store as Arc<dyn MetricsSource>);

    let results = assessed(
        service
            .assess_evidence(vm_evidence("ev-1", false))
            .await
            .expect("assessment"),
    );

    assert_eq!(results.len(), 1);
    assert!(!results[0].compliant);
    assert_eq!(results[0].compliance_comment, DEFAULT_NON_COMPLIANT_MESSAGE);
}

#[tokio::test]
async fn test_waiting_evidence_is_assessed_when_related_resource_arrives() {
    init_tracing();
    let store = store_with_metrics();
    let engine = RegoEval::builder().build();
    let service = Service::new(engine, store as Arc<dyn MetricsSource>);

    let seen: Arc<Mutex<Vec<AssessmentResult>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    service.register_result_hook(Box::new(move |outcome| {
        if let Ok(result) = outcome {
            sink.lock().unwrap().push(result.clone());
        }
    }));

    // A virtual machine that mounts a disk we have not seen yet
    let vm = Evidence::new(
        "ev-vm",
        "test-collector",
        "target-1",
        Resource::VirtualMachine(VirtualMachine {
            id: "vm-1".to_string(),
            name: "my vm".to_string(),
            automatic_updates: None,
            block_storage_ids: vec!["disk-1".to_string()],
            network_interface_ids: vec![],
        }),
    )
    .with_related(vec!["disk-1".to_string()]);

    let status = service.assess_evidence(vm).await.expect("assessment");
    assert!(matches!(status, AssessmentStatus::WaitingForRelated));
    assert_eq!(service.pending_requests(), 1);

    // The disk arrives with encryption enabled
    let disk = Evidence::new(
        "ev-disk",
        "test-collector",
        "target-1",
        Resource::BlockStorage(BlockStorage {
            id: "disk-1".to_string(),
            name: "my disk".to_string(),
            at_rest_encryption: Some(AtRestEncryption {
                enabled: true,
                algorithm: Some("AES256".to_string()),
            }),
        }),
    );

    let disk_results = assessed(service.assess_evidence(disk).await.expect("assessment"));
    assert_eq!(disk_results.len(), 1);
    assert_eq!(disk_results[0].metric_id, AT_REST_ENCRYPTION_ENABLED);
    assert!(disk_results[0].compliant);

    service.wait_idle().await;
    assert_eq!(service.pending_requests(), 0);

    let seen = seen.lock().unwrap();
    let vm_result = seen
        .iter()
        .find(|r| r.evidence_id == "ev-vm")
        .expect("waiting evidence was assessed");
    assert_eq!(vm_result.metric_id, MOUNTED_STORAGE_ENCRYPTED);
    assert!(vm_result.compliant);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_implementation_change_takes_effect_through_events() {
    init_tracing();
    let store = store_with_metrics();
    let engine = RegoEval::builder()
        .event_subscriber(Arc::clone(&store) as Arc<dyn EventSubscriber>)
        .build();
    let service = Service::new(
        Arc::clone(&engine) as Arc<dyn conformity::policy::PolicyEval>,
        Arc::clone(&store) as Arc<dyn MetricsSource>,
    );

    let results = assessed(
        service
            .assess_evidence(vm_evidence("ev-1", true))
            .await
            .expect("assessment"),
    );
    assert!(results[0].compliant);

    // Invert the compliance rule. The configuration is unchanged, so only
    // the change event can invalidate the cached query.
    store.set_implementation(
        AUTOMATIC_UPDATES_ENABLED,
        r#"
        package metrics.automatic_updates_enabled

        default applicable = false
        default compliant = false

        applicable {
            input.automatic_updates
        }

        compliant {
            input.automatic_updates.enabled != data.policy.target_value
        }
        "#,
    );

    let mut flipped = false;
    for i in 0..100 {
        let results = assessed(
            service
                .assess_evidence(vm_evidence(&format!("ev-retry-{}", i), true))
                .await
                .expect("assessment"),
        );
        if !results[0].compliant {
            flipped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(flipped, "implementation change never took effect");

    engine.close();
}

#[tokio::test]
async fn test_per_target_configuration_overrides_default() {
    init_tracing();
    let store = store_with_metrics();

    // For this target, automatic updates must be disabled to be compliant
    store.set_configuration(MetricConfiguration {
        operator: "==".to_string(),
        target_value: serde_json::json!(false),
        is_default: false,
        metric_id: AUTOMATIC_UPDATES_ENABLED.to_string(),
        target_of_evaluation_id: "target-1".to_string(),
        updated_at: Utc::now(),
    });

    let engine = RegoEval::builder().build();
    let service = Service::new(engine, store as Arc<dyn MetricsSource>);

    let results = assessed(
        service
            .assess_evidence(vm_evidence("ev-1", true))
            .await
            .expect("assessment"),
    );

    assert_eq!(results.len(), 1);
    assert!(!results[0].compliant);
    assert!(!results[0].metric_configuration.is_default);
    assert_eq!(
        results[0].metric_configuration.target_value,
        serde_json::json!(false)
    );
}
