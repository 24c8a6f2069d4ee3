use thiserror::Error;
use weft_core::SchemaError;
use weft_pipeline::PipelineError;
use weft_runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("invalid parameters: {0}")]
    Schema(#[from] SchemaError),

    #[error("component document error: {0}")]
    Document(#[from] serde_json::Error),
}
