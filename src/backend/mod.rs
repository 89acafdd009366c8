//! Boundary between the decode loop and the inference library.
//!
//! The loop only ever talks to a [`Vocabulary`] and an [`InferenceContext`];
//! [`LanguageModel`] produces both. The production implementation runs
//! quantized GGUF weights through candle, tests use a scripted model.

mod cells;
mod quantized;
#[cfg(test)]
pub(crate) mod scripted;
mod tokenizer;

use std::path::PathBuf;

use candle_core::Tensor;
use thiserror::Error;

use crate::prompting::PromptFamily;

pub use cells::{ContextState, KvCells};
pub use quantized::{QuantizedContext, QuantizedModel};
pub use tokenizer::TokenizerVocab;

pub type Token = u32;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0}")]
    Load(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported by this backend: {0}")]
    Unsupported(String),

    #[error("invalid context state: {0}")]
    State(String),
}

impl From<candle_core::Error> for BackendError {
    fn from(err: candle_core::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub model_path: PathBuf,
    pub tokenizer_hint: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    pub n_ctx: usize,
    pub n_batch: usize,
}

pub trait Vocabulary {
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError>;

    /// Raw bytes of one token. Control tokens render empty unless `special`.
    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8>;

    fn bos(&self) -> Option<Token>;
    fn add_bos(&self) -> bool;
    fn eos(&self) -> Token;
    fn eot(&self) -> Option<Token>;

    fn is_eog(&self, token: Token) -> bool {
        token == self.eos() || self.eot() == Some(token)
    }

    fn chat_template(&self) -> Option<&str> {
        None
    }

    fn piece_string(&self, token: Token, special: bool) -> String {
        String::from_utf8_lossy(&self.token_to_piece(token, special)).into_owned()
    }
}

/// Per-call attention state.
///
/// Positions are cell positions in the KV cache, ranges are half-open and
/// `None` as upper bound means "to the end".
pub trait InferenceContext {
    fn n_ctx(&self) -> usize;

    fn has_encoder(&self) -> bool {
        false
    }

    fn encode(&mut self, _tokens: &[Token]) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("encoder".to_string()))
    }

    fn decoder_start_token(&self) -> Option<Token> {
        None
    }

    /// Evaluates `tokens` at consecutive positions from `start_pos`. Cells at
    /// or after `start_pos` are replaced. Logits of the last token become
    /// available through [`InferenceContext::logits`].
    fn decode(&mut self, tokens: &[Token], start_pos: usize) -> Result<(), BackendError>;

    fn logits(&self) -> Result<Tensor, BackendError>;

    fn kv_remove(&mut self, p0: usize, p1: Option<usize>) -> Result<(), BackendError>;
    fn kv_shift(&mut self, p0: usize, p1: usize, delta: isize) -> Result<(), BackendError>;
    fn kv_divide(&mut self, p0: usize, p1: usize, divisor: usize) -> Result<(), BackendError>;
    fn kv_clear(&mut self);

    /// Whether cells may hold non-contiguous positions (self-extend).
    fn supports_grouped_positions(&self) -> bool;

    fn state_snapshot(&self) -> Result<Vec<u8>, BackendError>;
    fn state_restore(&mut self, state: &[u8]) -> Result<(), BackendError>;
}

pub trait LanguageModel: Sized {
    type Vocab: Vocabulary;
    type Context: InferenceContext;

    fn load(spec: &ModelSpec) -> Result<Self, BackendError>;
    fn vocabulary(&self) -> &Self::Vocab;
    fn family(&self) -> PromptFamily;
    fn n_ctx_train(&self) -> usize;
    fn new_context(&self, opts: &ContextOptions) -> Result<Self::Context, BackendError>;
}
