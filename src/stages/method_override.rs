use std::collections::HashSet;

use ::http::Method;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::debug;

use super::{reject_unknown, take_string};
use crate::error::{ConfigurationError, StageError};
use crate::http::{Request, Response};
use crate::pipeline::{Next, Stage, StageParameters};

pub const ORIGINAL_METHOD_KEY: &str = "method_override.original_method";

const DEFAULT_PARAM: &str = "_method";
const DEFAULT_HEADER: &str = "x-http-method-override";

/// Verbs a form may ask for. CONNECT and TRACE are never honoured.
static OVERRIDABLE_METHODS: Lazy<HashSet<Method>> = Lazy::new(|| {
    let mut methods: HashSet<Method> = [
        Method::GET,
        Method::HEAD,
        Method::PUT,
        Method::POST,
        Method::DELETE,
        Method::OPTIONS,
        Method::PATCH,
    ]
    .into_iter()
    .collect();
    methods.extend(
        ["LINK", "UNLINK"]
            .into_iter()
            .filter_map(|name| Method::from_bytes(name.as_bytes()).ok()),
    );
    methods
});

/// Lets HTML forms, which can only submit GET and POST, reach other verbs.
///
/// A `POST` carrying the override field (or the override header) has its
/// method replaced for the rest of the chain. The original method is kept in
/// the `method_override.original_method` extension; nothing is restored on
/// the way out.
pub struct MethodOverrideStage {
    param: String,
    header: String,
}

impl Default for MethodOverrideStage {
    fn default() -> Self {
        Self {
            param: DEFAULT_PARAM.to_string(),
            header: DEFAULT_HEADER.to_string(),
        }
    }
}

impl MethodOverrideStage {
    pub fn new(param: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            header: header.into().to_ascii_lowercase(),
        }
    }

    pub(super) fn from_params(mut params: StageParameters) -> Result<Self, ConfigurationError> {
        let param = take_string(&mut params, "param").unwrap_or_else(|| DEFAULT_PARAM.to_string());
        let header =
            take_string(&mut params, "header").unwrap_or_else(|| DEFAULT_HEADER.to_string());
        if param.trim().is_empty() || header.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                "method_override",
                "'param' and 'header' cannot be empty",
            ));
        }
        reject_unknown("method_override", &params)?;
        Ok(Self::new(param, header))
    }

    fn requested_method(&self, request: &Request) -> Option<Method> {
        let raw = request
            .param(&self.param)
            .or_else(|| request.header(&self.header))?;
        let method = Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes()).ok()?;
        OVERRIDABLE_METHODS.contains(&method).then_some(method)
    }
}

impl Stage for MethodOverrideStage {
    fn name(&self) -> &str {
        "method_override"
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        if request.method == "POST"
            && let Some(method) = self.requested_method(request)
        {
            debug!(from = %request.method, to = %method, "Overriding request method");
            let original = std::mem::replace(&mut request.method, method.to_string());
            request.set_extension(ORIGINAL_METHOD_KEY, Value::String(original));
        }
        next.run(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_requires_known_verb() {
        let stage = MethodOverrideStage::default();
        let request = Request::new("POST", "/").with_param("_method", "teleport");
        assert_eq!(stage.requested_method(&request), None);

        let request = Request::new("POST", "/").with_param("_method", "CONNECT");
        assert_eq!(stage.requested_method(&request), None);

        let request = Request::new("POST", "/").with_param("_method", "GE T");
        assert_eq!(stage.requested_method(&request), None);

        let request = Request::new("POST", "/").with_param("_method", " patch ");
        assert_eq!(stage.requested_method(&request), Some(Method::PATCH));

        let request = Request::new("POST", "/").with_param("_method", "unlink");
        assert_eq!(
            stage.requested_method(&request).map(|m| m.to_string()),
            Some("UNLINK".to_string())
        );
    }

    #[test]
    fn form_field_wins_over_header() {
        let stage = MethodOverrideStage::default();
        let request = Request::new("POST", "/")
            .with_param("_method", "PUT")
            .with_header("X-HTTP-Method-Override", "DELETE");
        assert_eq!(stage.requested_method(&request), Some(Method::PUT));
    }
}
