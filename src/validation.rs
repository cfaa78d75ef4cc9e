use std::collections::HashSet;

use serde::Serialize;

use crate::endpoints::EndpointSpec;
use crate::http::status_code;
use crate::manifest::Manifest;
use crate::pipeline::{StageRegistry, StageSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_manifest(manifest: &Manifest, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if manifest.version != 1 {
        report
            .errors
            .push(format!("Unsupported manifest version: {}", manifest.version));
    }

    if manifest.stages.is_empty() {
        report
            .warnings
            .push("No stages configured; requests go straight to the endpoint".into());
    }

    match status_code(manifest.fallback.status) {
        None => report.errors.push(format!(
            "Fallback status {} is not a valid HTTP status",
            manifest.fallback.status
        )),
        Some(status) if !status.is_server_error() => report.warnings.push(format!(
            "Fallback status {} is not a server error; clients may treat failures as success",
            manifest.fallback.status
        )),
        Some(_) => {}
    }

    if let EndpointSpec::Static { status, .. } = &manifest.endpoint
        && status_code(*status).is_none()
    {
        report
            .errors
            .push(format!("Endpoint status {status} is not a valid HTTP status"));
    }

    let mut seen = HashSet::new();
    for (idx, stage) in manifest.stages.iter().enumerate() {
        if !seen.insert(stage.stage.as_str()) {
            report.warnings.push(format!(
                "Stage {} ('{}') appears more than once",
                idx + 1,
                stage.stage
            ));
        }
        report.merge(validate_stage_order(idx, stage, &manifest.stages));
        report.merge(validate_stage(idx, stage, registry));
    }

    report
}

fn validate_stage(idx: usize, stage: &StageSpec, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.stage, params) {
        report.errors.push(format!(
            "Stage {} ('{}'): failed to instantiate stage: {err}",
            idx + 1,
            stage.stage
        ));
    }

    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, stages: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    if stage.stage == "flash" {
        let previous_has_cookies = stages[..idx].iter().any(|prev| prev.stage == "cookies");
        if !previous_has_cookies {
            report
                .errors
                .push("Flash stage requires a cookies stage earlier in the pipeline".into());
        }
    }
    report
}
