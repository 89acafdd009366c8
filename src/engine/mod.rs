mod decode;
mod lifecycle;

use std::path::PathBuf;

use resumable_protocol::OutputRecord;

use crate::backend::LanguageModel;
use crate::budget::BudgetLimits;
use crate::config::EngineConfig;
use crate::conversation::ChatLog;

pub use decode::{DecodeState, StopCondition};

/// Process-wide generation engine. Holds at most one loaded model; loading
/// another releases the current one first.
pub struct Engine<M: LanguageModel> {
    pub(super) model: Option<M>,
    pub(super) model_path: Option<PathBuf>,
    pub(super) config: EngineConfig,
    pub(super) limits: BudgetLimits,
    pub(super) chat_log: ChatLog,
}

/// Result of one `generate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Everything fed through the model this call, session reuse included.
    pub conversation_text: String,
    pub consumed_text: String,
    /// Input not yet fed. Non-empty means the caller should call again with
    /// the same prompt.
    pub remaining_text: String,
    pub generated_text: String,
    pub reached_end_of_generation: bool,
    pub stop_reason: StopCondition,
    pub tokens_evaluated: usize,
}

impl GenerationOutcome {
    pub fn into_record(self) -> OutputRecord {
        OutputRecord::success(
            self.conversation_text,
            self.generated_text,
            self.remaining_text,
            self.reached_end_of_generation,
        )
    }
}
