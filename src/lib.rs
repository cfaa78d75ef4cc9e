pub mod endpoints;
pub mod error;
pub mod http;
pub mod lockfile;
pub mod manifest;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod validation;

pub use error::{ConfigurationError, DispatchError, StageError};
pub use crate::http::{Request, Response};
pub use manifest::Manifest;
pub use pipeline::{
    Endpoint, FallbackResponse, Next, Pipeline, Stage, StageRegistry, endpoint_fn, from_fn,
};
