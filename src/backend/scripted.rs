//! Deterministic stand-in for a real model.
//!
//! The vocabulary is a fixed word list, every word renders as `" word"`, and
//! the "model" always predicts the word that follows the last cell in the
//! list, ending with `</s>` after the final word.

use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};

use super::cells::{ContextState, KvCells};
use super::{
    BackendError, ContextOptions, InferenceContext, LanguageModel, ModelSpec, Token, Vocabulary,
};
use crate::prompting::PromptFamily;

pub const UNK: Token = 0;
pub const BOS: Token = 1;
pub const EOS: Token = 2;

const SPECIALS: [&str; 3] = ["<unk>", "<s>", "</s>"];

pub const STORY: &str =
    "Joe loves writing stories . He likes to write about dragons and castles";

#[derive(Debug, Clone)]
pub struct ScriptedVocab {
    words: Vec<String>,
    add_bos: bool,
    template: Option<String>,
}

impl ScriptedVocab {
    pub fn new(text: &str) -> Self {
        Self {
            words: text.split_whitespace().map(str::to_string).collect(),
            add_bos: true,
            template: None,
        }
    }

    /// A vocabulary with no BOS token at all.
    pub fn without_bos(mut self) -> Self {
        self.add_bos = false;
        self
    }

    pub fn id(&self, word: &str) -> Token {
        if let Some(i) = SPECIALS.iter().position(|s| *s == word) {
            return i as Token;
        }
        self.words
            .iter()
            .position(|w| w == word)
            .map(|i| (i + SPECIALS.len()) as Token)
            .unwrap_or(UNK)
    }

    pub fn n_vocab(&self) -> usize {
        self.words.len() + SPECIALS.len()
    }

    fn successor(&self, token: Token) -> Token {
        match token {
            BOS => SPECIALS.len() as Token,
            t if (t as usize) >= SPECIALS.len() && (t as usize + 1) < self.n_vocab() => t + 1,
            _ => EOS,
        }
    }
}

impl Vocabulary for ScriptedVocab {
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let mut tokens = Vec::new();
        if add_special && self.add_bos {
            tokens.push(BOS);
        }
        for word in text.split_whitespace() {
            let id = self.id(word);
            if (id as usize) < SPECIALS.len() && !parse_special {
                tokens.push(UNK);
            } else {
                tokens.push(id);
            }
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8> {
        let idx = token as usize;
        if idx < SPECIALS.len() {
            return if special {
                SPECIALS[idx].as_bytes().to_vec()
            } else {
                Vec::new()
            };
        }
        match self.words.get(idx - SPECIALS.len()) {
            Some(word) => format!(" {}", word).into_bytes(),
            None => Vec::new(),
        }
    }

    fn bos(&self) -> Option<Token> {
        self.add_bos.then_some(BOS)
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn eos(&self) -> Token {
        EOS
    }

    fn eot(&self) -> Option<Token> {
        None
    }

    fn chat_template(&self) -> Option<&str> {
        self.template.as_deref()
    }
}

pub struct ScriptedModel {
    vocab: ScriptedVocab,
    n_ctx_train: usize,
    grouped: bool,
    encoder: bool,
    decode_log: Arc<Mutex<Vec<usize>>>,
    encode_log: Arc<Mutex<Vec<Vec<Token>>>>,
}

impl ScriptedModel {
    pub fn new(text: &str) -> Self {
        Self {
            vocab: ScriptedVocab::new(text),
            n_ctx_train: 512,
            grouped: true,
            encoder: false,
            decode_log: Arc::new(Mutex::new(Vec::new())),
            encode_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn story() -> Self {
        Self::new(STORY)
    }

    pub fn without_grouped_positions(mut self) -> Self {
        self.grouped = false;
        self
    }

    pub fn with_encoder(mut self) -> Self {
        self.encoder = true;
        self
    }

    pub fn with_chat_template(mut self, template: &str) -> Self {
        self.vocab.template = Some(template.to_string());
        self
    }

    pub fn vocab(&self) -> &ScriptedVocab {
        &self.vocab
    }

    /// Sizes of every batch handed to `decode`, across all contexts.
    pub fn decode_batches(&self) -> Vec<usize> {
        self.decode_log.lock().expect("decode log lock").clone()
    }

    pub fn clear_decode_batches(&self) {
        self.decode_log.lock().expect("decode log lock").clear();
    }

    pub fn encoded(&self) -> Vec<Vec<Token>> {
        self.encode_log.lock().expect("encode log lock").clone()
    }
}

impl LanguageModel for ScriptedModel {
    type Vocab = ScriptedVocab;
    type Context = ScriptedContext;

    fn load(spec: &ModelSpec) -> Result<Self, BackendError> {
        if spec.model_path.as_os_str().is_empty() || spec.model_path.ends_with("missing.gguf") {
            return Err(BackendError::Load(format!(
                "Failed to open model file: {}",
                spec.model_path.display()
            )));
        }
        Ok(Self::story())
    }

    fn vocabulary(&self) -> &ScriptedVocab {
        &self.vocab
    }

    fn family(&self) -> PromptFamily {
        PromptFamily::Unknown
    }

    fn n_ctx_train(&self) -> usize {
        self.n_ctx_train
    }

    fn new_context(&self, opts: &ContextOptions) -> Result<ScriptedContext, BackendError> {
        Ok(ScriptedContext {
            vocab: self.vocab.clone(),
            n_ctx: opts.n_ctx,
            grouped: self.grouped,
            encoder: self.encoder,
            cells: KvCells::default(),
            logits: None,
            decode_log: Arc::clone(&self.decode_log),
            encode_log: Arc::clone(&self.encode_log),
        })
    }
}

pub struct ScriptedContext {
    vocab: ScriptedVocab,
    n_ctx: usize,
    grouped: bool,
    encoder: bool,
    cells: KvCells,
    logits: Option<Vec<f32>>,
    decode_log: Arc<Mutex<Vec<usize>>>,
    encode_log: Arc<Mutex<Vec<Vec<Token>>>>,
}

impl ScriptedContext {
    pub fn cells(&self) -> &KvCells {
        &self.cells
    }

    fn predict(&self) -> Vec<f32> {
        let mut logits = vec![0.0f32; self.vocab.n_vocab()];
        if let Some(last) = self.cells.last_token() {
            logits[self.vocab.successor(last) as usize] = 10.0;
        }
        logits
    }
}

impl InferenceContext for ScriptedContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn has_encoder(&self) -> bool {
        self.encoder
    }

    fn encode(&mut self, tokens: &[Token]) -> Result<(), BackendError> {
        self.encode_log
            .lock()
            .map_err(|e| BackendError::Decode(e.to_string()))?
            .push(tokens.to_vec());
        Ok(())
    }

    fn decoder_start_token(&self) -> Option<Token> {
        self.encoder.then_some(BOS)
    }

    fn decode(&mut self, tokens: &[Token], start_pos: usize) -> Result<(), BackendError> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.cells.remove(start_pos, None);
        if self.cells.len() + tokens.len() > self.n_ctx {
            return Err(BackendError::Decode("KV cache full".to_string()));
        }
        self.cells.push_batch(tokens, start_pos);
        self.logits = Some(self.predict());
        self.decode_log
            .lock()
            .map_err(|e| BackendError::Decode(e.to_string()))?
            .push(tokens.len());
        Ok(())
    }

    fn logits(&self) -> Result<Tensor, BackendError> {
        let values = self
            .logits
            .clone()
            .ok_or_else(|| BackendError::Decode("no logits available".to_string()))?;
        let n = values.len();
        Ok(Tensor::from_vec(values, n, &Device::Cpu)?)
    }

    fn kv_remove(&mut self, p0: usize, p1: Option<usize>) -> Result<(), BackendError> {
        self.cells.remove(p0, p1);
        Ok(())
    }

    fn kv_shift(&mut self, p0: usize, p1: usize, delta: isize) -> Result<(), BackendError> {
        self.cells.shift(p0, p1, delta);
        Ok(())
    }

    fn kv_divide(&mut self, p0: usize, p1: usize, divisor: usize) -> Result<(), BackendError> {
        if !self.grouped {
            return Err(BackendError::Unsupported("grouped attention".to_string()));
        }
        self.cells.divide(p0, p1, divisor);
        Ok(())
    }

    fn kv_clear(&mut self) {
        self.cells.clear();
        self.logits = None;
    }

    fn supports_grouped_positions(&self) -> bool {
        self.grouped
    }

    fn state_snapshot(&self) -> Result<Vec<u8>, BackendError> {
        ContextState {
            cells: self.cells.clone(),
            logits: self.logits.clone(),
        }
        .to_bytes()
    }

    fn state_restore(&mut self, state: &[u8]) -> Result<(), BackendError> {
        let state = ContextState::from_bytes(state)?;
        self.cells = state.cells;
        self.logits = state.logits;
        Ok(())
    }
}
