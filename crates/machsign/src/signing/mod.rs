//! Bundle signing: the request a caller builds and the pipeline that runs it.

pub mod pipeline;
pub mod request;

pub use pipeline::{Pipeline, Stage};
pub use request::SigningRequest;
