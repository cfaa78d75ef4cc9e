use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, instrument, warn};

use crate::error::{ConfigurationError, DispatchError, StageError};
use crate::http::{Request, Response};
use crate::observability::MetricsCollector;

pub type StageParameters = Map<String, Value>;

type Layer = dyn Fn(&mut Request) -> Result<Response, StageError> + Send + Sync;

/// One unit of request/response transformation.
///
/// A stage sees the request before everything registered after it and sees
/// the response after everything registered after it. It decides whether to
/// call `next` at all.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;
    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError>;
}

/// The innermost behavior of the chain: application logic.
pub trait Endpoint: Send + Sync {
    fn call(&self, request: &mut Request) -> Result<Response, StageError>;
}

impl<F> Endpoint for F
where
    F: Fn(&mut Request) -> Result<Response, StageError> + Send + Sync,
{
    fn call(&self, request: &mut Request) -> Result<Response, StageError> {
        self(request)
    }
}

/// Gives a closure the exact signature [`Endpoint`] expects.
pub fn endpoint_fn<F>(handler: F) -> F
where
    F: Fn(&mut Request) -> Result<Response, StageError> + Send + Sync,
{
    handler
}

/// The rest of the chain as seen from inside a stage. Can be invoked any
/// number of times.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    inner: &'a Layer,
}

impl Next<'_> {
    pub fn run(self, request: &mut Request) -> Result<Response, StageError> {
        (self.inner)(request)
    }
}

pub struct FnStage<F> {
    name: String,
    behavior: F,
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&mut Request, Next<'_>) -> Result<Response, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, request: &mut Request, next: Next<'_>) -> Result<Response, StageError> {
        (self.behavior)(request, next)
    }
}

/// Lifts a closure into a named stage.
pub fn from_fn<F>(name: impl Into<String>, behavior: F) -> FnStage<F>
where
    F: Fn(&mut Request, Next<'_>) -> Result<Response, StageError> + Send + Sync,
{
    FnStage {
        name: name.into(),
        behavior,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackResponse {
    #[serde(default = "default_fallback_status")]
    pub status: u16,
    #[serde(default = "default_fallback_body")]
    pub body: String,
    #[serde(default = "default_fallback_content_type")]
    pub content_type: String,
}

fn default_fallback_status() -> u16 {
    500
}

fn default_fallback_body() -> String {
    "Internal Server Error".to_string()
}

fn default_fallback_content_type() -> String {
    "text/plain".to_string()
}

impl Default for FallbackResponse {
    fn default() -> Self {
        Self {
            status: default_fallback_status(),
            body: default_fallback_body(),
            content_type: default_fallback_content_type(),
        }
    }
}

impl FallbackResponse {
    pub fn render(&self) -> Response {
        let mut response = Response::new(self.status);
        response.set_header("content-type", self.content_type.as_str());
        response.body = self.body.clone();
        response
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    endpoint: Arc<dyn Endpoint>,
    fallback: FallbackResponse,
    composed: Option<Arc<Layer>>,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new<E: Endpoint + 'static>(endpoint: E) -> Self {
        Self::with_endpoint(Arc::new(endpoint))
    }

    pub fn with_endpoint(endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            stages: Vec::new(),
            endpoint,
            fallback: FallbackResponse::default(),
            composed: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackResponse) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn register<S: Stage + 'static>(&mut self, stage: S) -> Result<(), ConfigurationError> {
        self.register_boxed(Box::new(stage))
    }

    pub fn register_boxed(&mut self, stage: Box<dyn Stage>) -> Result<(), ConfigurationError> {
        if self.is_frozen() {
            return Err(ConfigurationError::Frozen {
                stage: stage.name().to_string(),
            });
        }
        debug!(stage = stage.name(), position = self.stages.len(), "Registered stage");
        self.stages.push(Arc::from(stage));
        Ok(())
    }

    /// Composes the registered stages around the endpoint. Stage *i* receives
    /// a continuation that runs stage *i + 1*; the last one runs the endpoint.
    pub fn freeze(&mut self) -> Result<(), ConfigurationError> {
        if self.is_frozen() {
            return Err(ConfigurationError::AlreadyFrozen);
        }

        let endpoint = Arc::clone(&self.endpoint);
        let metrics = self.metrics.clone();
        let mut composed: Arc<Layer> = Arc::new(move |request: &mut Request| {
            let _timer = metrics.start_endpoint();
            let result = endpoint.call(request);
            if result.is_err() {
                metrics.record_endpoint_error();
            }
            result
        });

        for stage in self.stages.iter().rev() {
            let stage = Arc::clone(stage);
            let inner = composed;
            let metrics = self.metrics.clone();
            composed = Arc::new(move |request: &mut Request| {
                let span = tracing::span!(tracing::Level::DEBUG, "stage", stage = stage.name());
                let _span_guard = span.enter();
                let _timer = metrics.start_stage(stage.name());
                let result = stage.call(request, Next { inner: &*inner });
                if let Err(err) = &result {
                    metrics.record_stage_error(stage.name());
                    debug!(error = %err, "Stage returned an error");
                }
                result
            });
        }

        self.composed = Some(composed);
        debug!(stages = self.stages.len(), "Pipeline frozen");
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.composed.is_some()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn fallback(&self) -> &FallbackResponse {
        &self.fallback
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Dispatches a request; any error escaping the chain becomes the
    /// fallback response.
    pub fn handle(&self, mut request: Request) -> Response {
        match self.try_handle(&mut request) {
            Ok(response) => response,
            Err(err) => {
                error!(
                    error = %err,
                    method = %request.method,
                    path = %request.path,
                    "Dispatch failed; serving fallback response"
                );
                self.fallback.render()
            }
        }
    }

    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub fn try_handle(&self, request: &mut Request) -> Result<Response, DispatchError> {
        let Some(composed) = self.composed.as_deref() else {
            warn!("Dispatch attempted before the pipeline was frozen");
            return Err(DispatchError::NotFrozen);
        };

        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| composed(request))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(DispatchError::Unhandled(err)),
            Err(payload) => Err(DispatchError::Panicked(panic_message(payload.as_ref()))),
        };
        self.metrics
            .record_dispatch(started.elapsed(), outcome.is_err());
        outcome
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type StageConstructor =
    Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>, ConfigurationError> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        name: &str,
        params: StageParameters,
    ) -> Result<Box<dyn Stage>, ConfigurationError> {
        let factory =
            self.factories
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownStage {
                    name: name.to_string(),
                    available: self.known_stages(),
                })?;
        factory(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

/// Instantiates every stage named in `stage_specs`, in order, and returns a
/// frozen pipeline.
pub fn build_pipeline(
    stage_registry: &StageRegistry,
    stage_specs: &[StageSpec],
    endpoint: Arc<dyn Endpoint>,
    fallback: FallbackResponse,
) -> Result<Pipeline, ConfigurationError> {
    let mut pipeline = Pipeline::with_endpoint(endpoint).with_fallback(fallback);
    for spec in stage_specs {
        let params = spec.params.clone().unwrap_or_default();
        let stage = stage_registry.create(&spec.stage, params)?;
        pipeline.register_boxed(stage)?;
    }
    pipeline.freeze()?;
    Ok(pipeline)
}
