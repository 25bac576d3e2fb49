use std::fs;
use std::sync::Arc;

use piper_core::SourceRecord;
use piper_projection::{ConfigurationError, MappingRegistry, ProjectionEngine, TemplateStore};
use serde_json::{Map, json};

fn write_templates(dir: &std::path::Path) {
    fs::write(
        dir.join("Subject.hbs"),
        r#"{
  "resourceType": "Patient",
  "id": "{{meta.record_id}}",
  "identifier": [{"value": "{{subject.external_id}}"}],
  "meta": {"tag": [{"code": "{{study.kf_id}}"}]},
  "gender": {{json subject.gender}}
}"#,
    )
    .unwrap();
    fs::write(
        dir.join("SubjectProvenance.json.hbs"),
        r#"{"resourceType": "Provenance", "target": [{"reference": "Patient/{{meta.record_id}}"}], "agent": [{"who": {"display": "{{params.agent}}"}}]}"#,
    )
    .unwrap();
    fs::write(dir.join("partials.hbs"), "not a resource template").unwrap();
}

#[test]
fn conventional_and_explicit_bindings_project_together() {
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path());

    let mut store = TemplateStore::new();
    let report = store.load_dir(dir.path()).unwrap();
    assert_eq!(report.loaded, vec!["Subject", "SubjectProvenance"]);

    let mut registry = MappingRegistry::from_template_store(&store);
    let params = json!({"agent": "piper"}).as_object().cloned().unwrap();
    registry
        .register("Subject", "SubjectProvenance", params, None)
        .unwrap();
    let engine = ProjectionEngine::new(Arc::new(registry), Arc::new(store)).unwrap();
    let record = SourceRecord::new("42", "Subject")
        .with_field("external_id", json!("PT-42"))
        .with_field("gender", json!("unknown"))
        .with_anchor("study", json!({"kf_id": "SD_ABC"}));

    let projection = engine.project(&record);
    assert!(projection.errors.is_empty(), "{:?}", projection.errors);
    assert_eq!(projection.resources.len(), 2);

    let patient = projection.resources[0].to_json().unwrap();
    assert_eq!(patient["resourceType"], "Patient");
    assert_eq!(patient["identifier"][0]["value"], "PT-42");
    assert_eq!(patient["meta"]["tag"][0]["code"], "SD_ABC");

    let provenance = projection.resources[1].to_json().unwrap();
    assert_eq!(provenance["agent"][0]["who"]["display"], "piper");
    assert_eq!(provenance["target"][0]["reference"], "Patient/42");
}

#[test]
fn binding_to_missing_template_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    write_templates(dir.path());

    let mut store = TemplateStore::new();
    store.load_dir(dir.path()).unwrap();

    let mut registry = MappingRegistry::from_template_store(&store);
    registry
        .register("Sample", "Specimen", Map::new(), None)
        .unwrap();

    let err = registry.validate(&store).unwrap_err();
    assert!(matches!(err, ConfigurationError::DanglingTemplates(ref d) if d.len() == 1));
    assert!(err.to_string().contains("Sample -> Specimen"));
}
