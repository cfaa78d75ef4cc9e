use ::http::StatusCode;
use serde_json::Value;
use tracing::warn;

use crate::error::{ConfigurationError, StageError};
use crate::http::{Request, Response, status_code};
use crate::pipeline::{Next, Stage, StageParameters, StageRegistry};

pub mod method_override;
pub mod session;

pub use method_override::MethodOverrideStage;
pub use session::{CookiesStage, FlashStage};

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("method_override", |params| {
        Ok(Box::new(MethodOverrideStage::from_params(params)?))
    });
    registry.register("cookies", |params| {
        Ok(Box::new(CookiesStage::from_params(params)?))
    });
    registry.register("flash", |params| {
        Ok(Box::new(FlashStage::from_params(params)?))
    });
    registry.register("best_standards", |params| {
        Ok(Box::new(BestStandardsStage::from_params(params)?))
    });
    registry.register("rescue", |params| {
        Ok(Box::new(RescueStage::from_params(params)?))
    });
    registry.register("annotate", |params| {
        Ok(Box::new(AnnotateStage::from_params(params)?))
    });
}

/// Sets a request extension before delegating.
pub struct AnnotateStage {
    key: String,
    value: Value,
}

impl AnnotateStage {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    fn from_params(mut params: StageParameters) -> Result<Self, ConfigurationError> {
        let key = take_string(&mut params, "key")
            .ok_or_else(|| ConfigurationError::invalid("annotate", "'key' parameter is required"))?;
        let value = params.remove("value").unwrap_or(Value::Bool(true));
        reject_unknown("annotate", &params)?;
        Ok(Self::new(key, value))
    }
}

impl Stage for AnnotateStage {
    fn name(&self) -> &str {
        "annotate"
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        request.set_extension(self.key.clone(), self.value.clone());
        next.run(request)
    }
}

/// Asks legacy Internet Explorer for its most standards-compliant renderer.
pub struct BestStandardsStage {
    header_value: &'static str,
}

impl BestStandardsStage {
    pub fn new(chrome_frame: bool) -> Self {
        let header_value = if chrome_frame {
            "IE=Edge,chrome=1"
        } else {
            "IE=Edge"
        };
        Self { header_value }
    }

    fn from_params(mut params: StageParameters) -> Result<Self, ConfigurationError> {
        let chrome_frame = take_bool(&mut params, "chrome_frame", "best_standards")?.unwrap_or(false);
        reject_unknown("best_standards", &params)?;
        Ok(Self::new(chrome_frame))
    }
}

impl Stage for BestStandardsStage {
    fn name(&self) -> &str {
        "best_standards"
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        let mut response = next.run(request)?;
        if !response.has_header("x-ua-compatible") {
            response.set_header("x-ua-compatible", self.header_value);
        }
        Ok(response)
    }
}

/// Translates errors raised further in into an error response.
pub struct RescueStage {
    status: StatusCode,
    expose_details: bool,
}

impl RescueStage {
    pub fn new(status: StatusCode, expose_details: bool) -> Self {
        Self {
            status,
            expose_details,
        }
    }

    fn from_params(mut params: StageParameters) -> Result<Self, ConfigurationError> {
        let status = take_status(&mut params, "status", "rescue")?
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let expose_details = take_bool(&mut params, "expose_details", "rescue")?.unwrap_or(false);
        reject_unknown("rescue", &params)?;
        Ok(Self::new(status, expose_details))
    }
}

impl Stage for RescueStage {
    fn name(&self) -> &str {
        "rescue"
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        match next.run(request) {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(error = %err, path = %request.path, "Rescued error from inner stage");
                let reason = self.status.canonical_reason().unwrap_or("Error");
                let body = if self.expose_details {
                    format!("{reason}: {err}")
                } else {
                    reason.to_string()
                };
                Ok(Response::text(self.status.as_u16(), body))
            }
        }
    }
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_bool(
    params: &mut StageParameters,
    key: &str,
    stage: &str,
) -> Result<Option<bool>, ConfigurationError> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(flag)),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => Err(ConfigurationError::invalid(
                stage,
                format!("'{key}' must be a boolean, got '{s}'"),
            )),
        },
        Some(other) => Err(ConfigurationError::invalid(
            stage,
            format!("'{key}' must be a boolean, got {other}"),
        )),
    }
}

fn take_status(
    params: &mut StageParameters,
    key: &str,
    stage: &str,
) -> Result<Option<StatusCode>, ConfigurationError> {
    let Some(value) = params.remove(key) else {
        return Ok(None);
    };
    let code = match &value {
        Value::Number(num) => num.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match code.and_then(status_code) {
        Some(status) => Ok(Some(status)),
        None => Err(ConfigurationError::invalid(
            stage,
            format!("'{key}' must be an HTTP status between 100 and 599, got {value}"),
        )),
    }
}

fn reject_unknown(stage: &str, params: &StageParameters) -> Result<(), ConfigurationError> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().map(String::as_str).collect();
    keys.sort();
    Err(ConfigurationError::invalid(
        stage,
        format!("unexpected parameter(s): {}", keys.join(", ")),
    ))
}
