use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::endpoints::EndpointSpec;
use crate::manifest::Manifest;
use crate::pipeline::StageSpec;

#[derive(Debug, Serialize)]
pub struct PipelineLock {
    pub manifest_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub endpoint_hash: String,
    pub fallback_status: u16,
    pub stages: Vec<StageLock>,
}

#[derive(Debug, Serialize)]
pub struct StageLock {
    pub position: usize,
    pub name: String,
    pub params_hash: String,
}

pub fn build_lock(manifest: &Manifest) -> PipelineLock {
    let stages = manifest
        .stages
        .iter()
        .enumerate()
        .map(|(idx, spec)| StageLock {
            position: idx + 1,
            name: spec.stage.clone(),
            params_hash: hash_params(spec),
        })
        .collect();

    PipelineLock {
        manifest_version: manifest.version,
        name: manifest.display_name().to_string(),
        generated_at: Utc::now(),
        endpoint_hash: hash_endpoint(&manifest.endpoint),
        fallback_status: manifest.fallback.status,
        stages,
    }
}

pub fn generate_lock(manifest: &Manifest, path: &Path) -> Result<()> {
    let lock = build_lock(manifest);
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, &lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;

    Ok(())
}

fn hash_params(spec: &StageSpec) -> String {
    let mut hasher = Sha256::new();
    let value = serde_json::to_value(spec.params.clone().unwrap_or_default()).unwrap_or_default();
    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    hasher.update(spec.stage.as_bytes());
    hasher.update(serialized);
    format!("{:x}", hasher.finalize())
}

fn hash_endpoint(endpoint: &EndpointSpec) -> String {
    let serialized = serde_json::to_vec(endpoint).unwrap_or_default();
    format!("{:x}", Sha256::digest(serialized))
}
