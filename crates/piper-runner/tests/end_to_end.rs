use std::sync::Arc;
use std::time::Duration;

use piper_core::{MemorySource, ReasonCode, RenderedResource, SourceRecord};
use piper_projection::{MappingRegistry, ProjectionEngine, TemplateStore};
use piper_runner::{
    FhirServerSink, LoadMode, LoadSink, LoadStatus, RunConfig, RunController, RunStatus,
    ThresholdPolicy,
};
use piper_validation::{HttpEndpointConfig, HttpValidationEndpoint, RetryPolicy, ValidationGate};
use serde_json::{Map, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PATIENT: &str = r#"{
  "resourceType": "Patient",
  "id": "{{meta.record_id}}",
  "name": [{"family": "{{record.family}}"}]
}"#;

#[tokio::test]
async fn validates_over_http_and_loads_valid_documents() {
    let validator = MockServer::start().await;
    let fhir = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/Patient/$validate"))
        .and(body_partial_json(json!({"id": "p2"})))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invariant", "diagnostics": "family too short"}]
        })))
        .mount(&validator)
        .await;
    Mock::given(method("POST"))
        .and(path("/Patient/$validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "information", "code": "informational"}]
        })))
        .mount(&validator)
        .await;

    Mock::given(method("PUT"))
        .and(path("/Patient/p1"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&fhir)
        .await;
    Mock::given(method("PUT"))
        .and(path("/Patient/p3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fhir)
        .await;

    let mut store = TemplateStore::new();
    store.register("Patient", PATIENT).unwrap();
    let mut registry = MappingRegistry::new();
    registry.register("Person", "Patient", Map::new(), None).unwrap();
    let engine = Arc::new(ProjectionEngine::new(Arc::new(registry), Arc::new(store)).unwrap());

    let endpoint = HttpValidationEndpoint::new(HttpEndpointConfig::new(validator.uri())).unwrap();
    let gate = Arc::new(ValidationGate::new(
        Arc::new(endpoint),
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)),
    ));
    let sink = FhirServerSink::new(&fhir.uri(), None, Duration::from_secs(5)).unwrap();

    let config = RunConfig::new(ThresholdPolicy::max_fraction(0.5, 3), Duration::from_secs(1))
        .with_render_concurrency(2)
        .with_validation_concurrency(2)
        .with_load_mode(LoadMode::AfterCompletion);
    let controller = RunController::new(engine, gate, config)
        .unwrap()
        .with_sink(Arc::new(sink));

    let records = ["p1", "p2", "p3"]
        .into_iter()
        .map(|id| SourceRecord::new(id, "Person").with_field("family", json!("Smith")))
        .collect();
    let mut source = MemorySource::new(records);
    let report = controller.run(&mut source).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.state.valid, 2);
    assert_eq!(report.state.invalid, 1);

    let entry = report.quarantine.get("p2", "Patient").unwrap();
    assert_eq!(entry.reason, ReasonCode::Invalid);
    assert_eq!(entry.outcome.issues[0].message, "family too short");

    let load = report.load.unwrap();
    assert_eq!(load.accepted, 2);
    assert!(load.is_clean());
}

#[tokio::test]
async fn fhir_sink_reports_rejections_per_document() {
    let fhir = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Observation"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "processing", "diagnostics": "subject not found"}]
        })))
        .mount(&fhir)
        .await;

    let sink = FhirServerSink::new(&fhir.uri(), Some("token".into()), Duration::from_secs(5))
        .unwrap();
    let resource = RenderedResource {
        record_id: "o1".into(),
        entity_type: "Measurement".into(),
        template_id: "Observation".into(),
        resource_kind: "Observation".into(),
        document: r#"{"resourceType":"Observation","status":"final"}"#.into(),
    };

    let results = sink.load(&[resource]).await.unwrap();
    assert_eq!(results.len(), 1);
    match &results[0].status {
        LoadStatus::Rejected { message } => assert!(message.contains("subject not found")),
        other => panic!("expected rejection, got {other:?}"),
    }
}

fn patient(id: &str) -> RenderedResource {
    RenderedResource {
        record_id: id.into(),
        entity_type: "Person".into(),
        template_id: "Patient".into(),
        resource_kind: "Patient".into(),
        document: json!({"resourceType": "Patient", "id": id}).to_string(),
    }
}

#[tokio::test]
async fn fhir_sink_keeps_going_after_a_timeout() {
    let fhir = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/Patient/b"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&fhir)
        .await;
    Mock::given(method("PUT"))
        .and(path("/Patient/a"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&fhir)
        .await;
    Mock::given(method("PUT"))
        .and(path("/Patient/c"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&fhir)
        .await;

    let sink = FhirServerSink::new(&fhir.uri(), None, Duration::from_millis(200)).unwrap();
    let results = sink
        .load(&[patient("a"), patient("b"), patient("c")])
        .await
        .unwrap();

    let accepted: Vec<_> = results
        .iter()
        .filter(|r| r.is_accepted())
        .map(|r| r.resource.record_id.as_str())
        .collect();
    assert_eq!(accepted, vec!["a", "c"]);
    assert_eq!(results[1].resource.record_id, "b");
    match &results[1].status {
        LoadStatus::Rejected { message } => assert!(message.contains("unreachable")),
        other => panic!("expected rejection, got {other:?}"),
    }
}
