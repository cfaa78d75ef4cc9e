use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::StageError;
use crate::http::{Request, Response};
use crate::pipeline::Endpoint;

/// Terminal handler selection in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EndpointSpec {
    Echo,
    Static {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        body: String,
        #[serde(default = "default_content_type")]
        content_type: String,
    },
    Fail {
        #[serde(default = "default_failure_message")]
        message: String,
    },
}

impl Default for EndpointSpec {
    fn default() -> Self {
        EndpointSpec::Echo
    }
}

fn default_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

fn default_failure_message() -> String {
    "endpoint failure".to_string()
}

impl EndpointSpec {
    pub fn build(&self) -> Arc<dyn Endpoint> {
        match self {
            EndpointSpec::Echo => Arc::new(EchoEndpoint),
            EndpointSpec::Static {
                status,
                body,
                content_type,
            } => Arc::new(StaticEndpoint {
                status: *status,
                body: body.clone(),
                content_type: content_type.clone(),
            }),
            EndpointSpec::Fail { message } => Arc::new(FailEndpoint {
                message: message.clone(),
            }),
        }
    }
}

/// Answers with the request as the end of the chain observed it.
pub struct EchoEndpoint;

impl Endpoint for EchoEndpoint {
    fn call(&self, request: &mut Request) -> Result<Response, StageError> {
        let flash = request
            .flash
            .as_ref()
            .map(|flash| json!(flash.messages()))
            .unwrap_or(Value::Null);
        let body = json!({
            "method": request.method,
            "path": request.path,
            "params": request.params,
            "extensions": request.extensions,
            "flash": flash,
        });
        Ok(Response::json(200, &body))
    }
}

pub struct StaticEndpoint {
    status: u16,
    body: String,
    content_type: String,
}

impl Endpoint for StaticEndpoint {
    fn call(&self, _request: &mut Request) -> Result<Response, StageError> {
        let mut response = Response::new(self.status);
        response.set_header("content-type", self.content_type.as_str());
        response.body = self.body.clone();
        Ok(response)
    }
}

pub struct FailEndpoint {
    message: String,
}

impl Endpoint for FailEndpoint {
    fn call(&self, _request: &mut Request) -> Result<Response, StageError> {
        Err(StageError::Endpoint(self.message.clone()))
    }
}
