//! Result records shared between the generation engine and whatever marshals
//! its answers to callers. Every operation reports through one of these
//! shapes whether it succeeded, ran out of budget or failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Ok,
    Unauthorized,
    InternalError,
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Ok => 200,
            StatusCode::Unauthorized => 401,
            StatusCode::InternalError => 500,
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(StatusCode::Ok),
            401 => Ok(StatusCode::Unauthorized),
            500 => Ok(StatusCode::InternalError),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Answer of a generation call.
///
/// `prompt_remaining` non-empty means "call again": part of the input was not
/// fed to the model before the budget ran out. `generated_eog` means the
/// model finished on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub status_code: StatusCode,
    pub conversation: String,
    pub output: String,
    pub error: String,
    pub prompt_remaining: String,
    pub generated_eog: bool,
}

impl OutputRecord {
    pub fn success(
        conversation: String,
        output: String,
        prompt_remaining: String,
        generated_eog: bool,
    ) -> Self {
        Self {
            status_code: StatusCode::Ok,
            conversation,
            output,
            error: String::new(),
            prompt_remaining,
            generated_eog,
        }
    }

    pub fn failure(status_code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status_code,
            conversation: String::new(),
            output: String::new(),
            error: error.into(),
            prompt_remaining: String::new(),
            generated_eog: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == StatusCode::Ok
    }
}

/// Answer of the bookkeeping operations (load, new chat, cache removal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status_code: StatusCode,
    pub output: String,
    pub error: String,
}

impl StatusRecord {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::Ok,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(status_code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status_code,
            output: String::new(),
            error: error.into(),
        }
    }
}

/// Per-call token ceilings for the two call kinds. Zero disables the ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub max_tokens_update: u64,
    pub max_tokens_query: u64,
}
