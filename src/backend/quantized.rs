use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use tracing::{info, warn};

use super::cells::{ContextState, KvCells};
use super::tokenizer::{resolve_tokenizer_path, TokenizerVocab, VocabHints};
use super::{BackendError, ContextOptions, InferenceContext, LanguageModel, ModelSpec, Token};
use crate::prompting::{infer_family_from_architecture, infer_family_from_filename, PromptFamily};

/// Architecture-specific weights. Only llama weights can be cloned, so other
/// families are read from disk again for every context.
enum Weights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

fn open_gguf(path: &Path) -> Result<(File, gguf_file::Content), BackendError> {
    let mut file = File::open(path)
        .map_err(|e| BackendError::Load(format!("Failed to open model file {}: {}", path.display(), e)))?;
    let content = gguf_file::Content::read(&mut file)
        .map_err(|e| BackendError::Load(format!("{} is not a readable GGUF file: {}", path.display(), e)))?;
    Ok((file, content))
}

impl Weights {
    fn read(path: &Path, family: PromptFamily, device: &Device) -> Result<Self, BackendError> {
        let (mut file, content) = open_gguf(path)?;
        Self::build(content, &mut file, family, device)
    }

    fn build(
        content: gguf_file::Content,
        file: &mut File,
        family: PromptFamily,
        device: &Device,
    ) -> Result<Self, BackendError> {
        let weights = match family {
            PromptFamily::Llama | PromptFamily::Mistral => {
                quantized_llama::ModelWeights::from_gguf(content, file, device).map(Self::Llama)
            }
            PromptFamily::Qwen => {
                quantized_qwen2::ModelWeights::from_gguf(content, file, device).map(Self::Qwen2)
            }
            PromptFamily::Unknown => {
                return Err(BackendError::Unsupported(
                    "model architecture has no candle runtime".to_string(),
                ))
            }
        };
        weights.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("output_norm.weight") {
                BackendError::Load(format!("{} (split GGUF shards are not supported)", msg))
            } else {
                BackendError::Load(msg)
            }
        })
    }

    fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor, BackendError> {
        let logits = match self {
            Self::Llama(model) => model.forward(input, position)?,
            Self::Qwen2(model) => model.forward(input, position)?,
        };
        Ok(logits)
    }

    fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Llama(model) => Some(Self::Llama(model.clone())),
            Self::Qwen2(_) => None,
        }
    }
}

fn meta_string(content: &gguf_file::Content, key: &str) -> Option<String> {
    content
        .metadata
        .get(key)
        .and_then(|v| v.to_string().ok())
        .cloned()
}

fn meta_u32(content: &gguf_file::Content, key: &str) -> Option<u32> {
    content.metadata.get(key).and_then(|v| v.to_u32().ok())
}

fn meta_bool(content: &gguf_file::Content, key: &str) -> Option<bool> {
    content.metadata.get(key).and_then(|v| v.to_bool().ok())
}

/// Quantized GGUF weights driven through candle.
pub struct QuantizedModel {
    weights: Weights,
    model_path: PathBuf,
    vocab: TokenizerVocab,
    family: PromptFamily,
    n_ctx_train: usize,
    device: Device,
}

impl QuantizedModel {
    fn open(spec: &ModelSpec) -> Result<Self, BackendError> {
        let path = spec.model_path.as_path();
        info!(model = %path.display(), "loading model");

        let device = Device::Cpu;
        let (mut file, content) = open_gguf(path)?;

        let arch = meta_string(&content, "general.architecture");
        let by_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(infer_family_from_filename)
            .unwrap_or(PromptFamily::Unknown);
        let family = match arch.as_deref().map(infer_family_from_architecture) {
            // Mistral ships with the llama architecture; keep the name hint.
            Some(PromptFamily::Llama) if by_name == PromptFamily::Mistral => PromptFamily::Mistral,
            Some(PromptFamily::Unknown) | None => by_name,
            Some(family) => family,
        };

        let n_ctx_train = arch
            .as_deref()
            .and_then(|a| meta_u32(&content, &format!("{}.context_length", a)))
            .map(|n| n as usize)
            .unwrap_or(4096);
        let hints = VocabHints {
            bos: meta_u32(&content, "tokenizer.ggml.bos_token_id"),
            eos: meta_u32(&content, "tokenizer.ggml.eos_token_id"),
            add_bos: meta_bool(&content, "tokenizer.ggml.add_bos_token"),
            chat_template: meta_string(&content, "tokenizer.chat_template"),
        };

        let weights = Weights::build(content, &mut file, family, &device)?;
        info!(?family, n_ctx_train, "weights loaded, loading tokenizer");

        let tokenizer_path = resolve_tokenizer_path(path, spec.tokenizer_hint.as_deref())?;
        info!(tokenizer = %tokenizer_path.display(), "using tokenizer");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| BackendError::Load(format!("{}: {}", tokenizer_path.display(), e)))?;
        let vocab = TokenizerVocab::new(tokenizer, family, hints)?;

        Ok(Self {
            weights,
            model_path: path.to_path_buf(),
            vocab,
            family,
            n_ctx_train,
            device,
        })
    }
}

impl LanguageModel for QuantizedModel {
    type Vocab = TokenizerVocab;
    type Context = QuantizedContext;

    fn load(spec: &ModelSpec) -> Result<Self, BackendError> {
        Self::open(spec)
    }

    fn vocabulary(&self) -> &TokenizerVocab {
        &self.vocab
    }

    fn family(&self) -> PromptFamily {
        self.family
    }

    fn n_ctx_train(&self) -> usize {
        self.n_ctx_train
    }

    fn new_context(&self, opts: &ContextOptions) -> Result<QuantizedContext, BackendError> {
        let weights = match self.weights.try_clone() {
            Some(weights) => weights,
            None => {
                warn!(family = ?self.family, "weights are not cloneable, reading them again for this context");
                Weights::read(&self.model_path, self.family, &self.device)?
            }
        };

        Ok(QuantizedContext {
            weights,
            device: self.device.clone(),
            n_ctx: opts.n_ctx,
            n_batch: opts.n_batch.max(1),
            cells: KvCells::default(),
            dirty: false,
            logits: None,
        })
    }
}

/// Candle keeps its KV cache private and only knows how to append or restart
/// from position 0, so cache edits are applied to [`KvCells`] and the weights
/// replay the surviving cells before the next forward pass.
pub struct QuantizedContext {
    weights: Weights,
    device: Device,
    n_ctx: usize,
    n_batch: usize,
    cells: KvCells,
    dirty: bool,
    logits: Option<Tensor>,
}

impl QuantizedContext {
    /// Multi-token batches are only masked correctly on an empty cache, so
    /// later batches go through one token at a time.
    fn forward(&mut self, tokens: &[Token], start_pos: usize) -> Result<Tensor, BackendError> {
        if start_pos == 0 || tokens.len() == 1 {
            return self.forward_batch(tokens, start_pos);
        }
        let mut last = None;
        for (i, &token) in tokens.iter().enumerate() {
            last = Some(self.forward_batch(&[token], start_pos + i)?);
        }
        last.ok_or_else(|| BackendError::Decode("empty batch".to_string()))
    }

    fn forward_batch(&mut self, tokens: &[Token], start_pos: usize) -> Result<Tensor, BackendError> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.weights.forward(&input, start_pos)?;
        Ok(logits.flatten_all()?.to_dtype(DType::F32)?)
    }

    fn replay(&mut self) -> Result<(), BackendError> {
        if !self.cells.is_contiguous() {
            return Err(BackendError::Unsupported(
                "grouped positions cannot be replayed".to_string(),
            ));
        }
        let tokens = self.cells.tokens_in_order();
        for (i, chunk) in tokens.chunks(self.n_batch).enumerate() {
            self.forward(chunk, i * self.n_batch)?;
        }
        self.dirty = false;
        Ok(())
    }
}

impl InferenceContext for QuantizedContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn decode(&mut self, tokens: &[Token], start_pos: usize) -> Result<(), BackendError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let next = self.cells.next_pos();
        if start_pos > next {
            return Err(BackendError::Decode(format!(
                "non-contiguous decode at {} (cache ends at {})",
                start_pos, next
            )));
        }
        if start_pos < next {
            self.cells.remove(start_pos, None);
            self.dirty = true;
        }
        if start_pos + tokens.len() > self.n_ctx {
            return Err(BackendError::Decode(format!(
                "KV cache full: {} + {} > {}",
                start_pos,
                tokens.len(),
                self.n_ctx
            )));
        }
        if self.dirty {
            self.replay()?;
        }

        let logits = self.forward(tokens, start_pos)?;
        self.cells.push_batch(tokens, start_pos);
        self.logits = Some(logits);
        Ok(())
    }

    fn logits(&self) -> Result<Tensor, BackendError> {
        self.logits
            .clone()
            .ok_or_else(|| BackendError::Decode("no logits available".to_string()))
    }

    fn kv_remove(&mut self, p0: usize, p1: Option<usize>) -> Result<(), BackendError> {
        if self.cells.remove(p0, p1) > 0 {
            self.dirty = true;
        }
        Ok(())
    }

    fn kv_shift(&mut self, p0: usize, p1: usize, delta: isize) -> Result<(), BackendError> {
        self.cells.shift(p0, p1, delta);
        self.dirty = true;
        Ok(())
    }

    fn kv_divide(&mut self, _p0: usize, _p1: usize, _divisor: usize) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("grouped attention".to_string()))
    }

    fn kv_clear(&mut self) {
        self.cells.clear();
        self.logits = None;
        self.dirty = true;
    }

    fn supports_grouped_positions(&self) -> bool {
        false
    }

    fn state_snapshot(&self) -> Result<Vec<u8>, BackendError> {
        let logits = match &self.logits {
            Some(t) => Some(t.to_vec1::<f32>()?),
            None => None,
        };
        ContextState {
            cells: self.cells.clone(),
            logits,
        }
        .to_bytes()
    }

    fn state_restore(&mut self, state: &[u8]) -> Result<(), BackendError> {
        let state = ContextState::from_bytes(state)?;
        if state.cells.len() > self.n_ctx {
            return Err(BackendError::State(format!(
                "state holds {} cells, context is {}",
                state.cells.len(),
                self.n_ctx
            )));
        }
        self.logits = match state.logits {
            Some(values) => {
                let n = values.len();
                Some(Tensor::from_vec(values, n, &self.device)?)
            }
            None => None,
        };
        self.cells = state.cells;
        self.dirty = true;
        Ok(())
    }
}
