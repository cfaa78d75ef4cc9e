use std::path::Path;

use request_pipeline::http::Request;
use request_pipeline::manifest::Manifest;
use request_pipeline::pipeline::StageRegistry;
use request_pipeline::stages;
use request_pipeline::validation::validate_manifest;
use serde_json::Value;

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[test]
fn bundled_manifests_are_valid() {
    let registry = build_registry();
    for path in ["manifests/default.yaml", "manifests/full.yaml"] {
        let manifest = Manifest::load(Path::new(path)).expect("manifest should load");
        let report = validate_manifest(&manifest, &registry);
        assert!(
            report.is_ok(),
            "{path} should pass validation: {:?}",
            report.errors
        );
    }
}

#[test]
fn default_manifest_enables_method_override() {
    let manifest = Manifest::load(Path::new("manifests/default.yaml")).unwrap();
    let pipeline = manifest.build(&build_registry()).unwrap();
    assert!(pipeline.is_frozen());
    assert_eq!(pipeline.stage_names(), vec!["method_override"]);

    let request = Request::new("POST", "/users/3").with_param("_method", "DELETE");
    let response = pipeline.handle(request);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["method"], "DELETE");
    assert_eq!(body["path"], "/users/3");
}

#[test]
fn manifest_defaults_fill_missing_sections() {
    let manifest = Manifest::from_yaml("version: 1\n").unwrap();
    assert!(manifest.stages.is_empty());
    assert_eq!(manifest.fallback.status, 500);
    assert_eq!(manifest.display_name(), "unnamed");

    let pipeline = manifest.build(&build_registry()).unwrap();
    let response = pipeline.handle(Request::new("GET", "/"));
    assert_eq!(response.status, 200);
}

#[test]
fn failing_endpoint_uses_manifest_fallback() {
    let manifest = Manifest::from_yaml(
        r#"
version: 1
stages:
  - stage: best_standards
endpoint:
  kind: fail
  message: boom
fallback:
  status: 503
  body: Service Unavailable
"#,
    )
    .unwrap();
    let pipeline = manifest.build(&build_registry()).unwrap();

    let response = pipeline.handle(Request::new("GET", "/"));

    assert_eq!(response.status, 503);
    assert_eq!(response.body, "Service Unavailable");
    assert!(response.header("x-ua-compatible").is_none());
}

#[test]
fn unknown_stage_fails_the_build() {
    let manifest = Manifest::from_yaml("version: 1\nstages:\n  - stage: cookiez\n").unwrap();
    let err = manifest.build(&build_registry()).err().unwrap();
    assert!(err.to_string().contains("unknown stage 'cookiez'"));
}
