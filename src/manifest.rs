use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::endpoints::EndpointSpec;
use crate::error::ConfigurationError;
use crate::pipeline::{FallbackResponse, Pipeline, StageRegistry, StageSpec, build_pipeline};

/// Startup manifest: the explicit list of stages to load, in order, plus the
/// terminal handler and the fallback response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub endpoint: EndpointSpec,
    #[serde(default)]
    pub fallback: FallbackResponse,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse manifest YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(content)?;
        Ok(manifest)
    }

    pub fn build(&self, registry: &StageRegistry) -> Result<Pipeline, ConfigurationError> {
        build_pipeline(
            registry,
            &self.stages,
            self.endpoint.build(),
            self.fallback.clone(),
        )
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}
