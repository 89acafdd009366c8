use resumable_protocol::StatusCode;
use thiserror::Error;

use crate::backend::BackendError;

/// Failure taxonomy of the generation engine.
///
/// Running out of budget and filling the context window are not errors: they
/// are reported as a [`crate::StopCondition`] on a successful outcome.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    ArgumentParse(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("session load failed: {0}")]
    SessionLoad(String),

    #[error("prompt is too long ({tokens} tokens, max {max})")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("input is empty")]
    EmptyInput,

    #[error("failed to eval: {0}")]
    InternalDecode(String),

    #[error("invalid cache path: {0}")]
    InvalidCachePath(String),

    #[error("chat log error: {0}")]
    ChatLog(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::InternalError
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Load(msg) => EngineError::ModelLoad(msg),
            other => EngineError::InternalDecode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
