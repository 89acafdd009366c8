//! Budget-capped, resumable text generation.
//!
//! One logical generation runs as a sequence of independent calls. Each call
//! evaluates at most its token budget, checkpoints the session cache, and
//! reports how much of the prompt is still unread so the caller knows to call
//! again.

pub mod backend;
pub mod budget;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod params;
pub mod prompting;
pub mod sampling;
pub mod session;

pub use backend::{LanguageModel, QuantizedModel};
pub use budget::{BudgetLimits, CallKind, TokenBudget};
pub use config::EngineConfig;
pub use engine::{Engine, GenerationOutcome, StopCondition};
pub use error::{EngineError, Result};
pub use params::GenerationParameters;
