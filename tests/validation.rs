use std::fs;

use request_pipeline::endpoints::EndpointSpec;
use request_pipeline::lockfile::generate_lock;
use request_pipeline::manifest::Manifest;
use request_pipeline::pipeline::{FallbackResponse, StageParameters, StageRegistry, StageSpec};
use request_pipeline::stages;
use request_pipeline::validation::validate_manifest;
use serde_json::json;
use tempfile::tempdir;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

fn base_manifest() -> Manifest {
    Manifest {
        version: 1,
        name: Some("test".to_string()),
        stages: Vec::new(),
        endpoint: EndpointSpec::Echo,
        fallback: FallbackResponse::default(),
    }
}

fn stage_spec(name: &str, params: &[(&str, serde_json::Value)]) -> StageSpec {
    let mut map = StageParameters::default();
    for (key, value) in params {
        map.insert((*key).to_string(), value.clone());
    }
    StageSpec {
        stage: name.to_string(),
        params: Some(map),
    }
}

#[test]
fn validation_catches_missing_params() {
    let mut manifest = base_manifest();
    manifest.stages.push(StageSpec {
        stage: "annotate".to_string(),
        params: Some(StageParameters::default()),
    });

    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);

    assert!(!report.is_ok());
    assert!(
        report.errors.iter().any(|e| e.contains("'key' parameter is required")),
        "unexpected errors: {:?}",
        report.errors
    );
}

#[test]
fn validation_reports_unknown_stage_and_version() {
    let mut manifest = base_manifest();
    manifest.version = 2;
    manifest.stages.push(stage_spec("show_exceptions", &[]));

    let report = validate_manifest(&manifest, &build_registry());

    assert_eq!(report.errors.len(), 2);
    assert!(report.errors[0].contains("Unsupported manifest version"));
    assert!(report.errors[1].contains("unknown stage 'show_exceptions'"));
}

#[test]
fn flash_must_follow_cookies() {
    let registry = build_registry();

    let mut manifest = base_manifest();
    manifest.stages = vec![stage_spec("flash", &[]), stage_spec("cookies", &[])];
    let report = validate_manifest(&manifest, &registry);
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("requires a cookies stage"));

    manifest.stages.reverse();
    assert!(validate_manifest(&manifest, &registry).is_ok());
}

#[test]
fn empty_pipeline_and_odd_fallback_only_warn() {
    let mut manifest = base_manifest();
    manifest.fallback.status = 404;
    manifest.stages = vec![
        stage_spec("method_override", &[]),
        stage_spec("method_override", &[]),
    ];

    let report = validate_manifest(&manifest, &build_registry());
    assert!(report.is_ok(), "errors: {:?}", report.errors);
    assert_eq!(report.warnings.len(), 2);

    manifest.stages.clear();
    manifest.fallback.status = 1000;
    let report = validate_manifest(&manifest, &build_registry());
    assert!(!report.is_ok());
    assert!(report.warnings[0].contains("No stages configured"));
}

#[test]
fn lockfile_generates_expected_yaml() {
    let temp = tempdir().unwrap();
    let mut manifest = base_manifest();
    manifest.stages = vec![
        stage_spec("method_override", &[("param", json!("_verb"))]),
        stage_spec("best_standards", &[("chrome_frame", json!(true))]),
    ];

    let lock_path = temp.path().join("pipeline.lock");
    generate_lock(&manifest, &lock_path).unwrap();

    let content = fs::read_to_string(&lock_path).unwrap();
    assert!(content.contains("manifest_version: 1"));
    assert!(content.contains("name: test"));
    assert!(content.contains("method_override"));
    assert!(content.contains("params_hash"));
    assert!(content.contains("fallback_status: 500"));
}
