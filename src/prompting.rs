use minijinja::{context, Environment, ErrorKind};
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{Token, Vocabulary};
use crate::error::{EngineError, Result};
use crate::params::GenerationParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

pub fn infer_family_from_filename(name: &str) -> PromptFamily {
    let lowered = name.to_lowercase();
    if lowered.contains("llama") {
        PromptFamily::Llama
    } else if lowered.contains("qwen") {
        PromptFamily::Qwen
    } else if lowered.contains("mistral") || lowered.contains("mixtral") {
        PromptFamily::Mistral
    } else {
        PromptFamily::Unknown
    }
}

/// Maps the GGUF `general.architecture` value to a family.
pub fn infer_family_from_architecture(arch: &str) -> PromptFamily {
    match arch.to_lowercase().as_str() {
        "llama" => PromptFamily::Llama,
        "qwen2" | "qwen" => PromptFamily::Qwen,
        "mistral" => PromptFamily::Mistral,
        _ => PromptFamily::Unknown,
    }
}

const CHATML: &str = r#"{% for message in messages %}{{ '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>' + '\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}"#;

const LLAMA3: &str = r#"{% for message in messages %}{{ '<|start_header_id|>' + message['role'] + '<|end_header_id|>\n\n' + message['content'] | trim + '<|eot_id|>' }}{% endfor %}{% if add_generation_prompt %}{{ '<|start_header_id|>assistant<|end_header_id|>\n\n' }}{% endif %}"#;

const LLAMA2: &str = r#"{% for message in messages %}{% if message['role'] == 'system' %}{{ '[INST] <<SYS>>\n' + message['content'] + '\n<</SYS>>\n\n' }}{% elif message['role'] == 'user' %}{% if loop.index0 == 0 or messages[loop.index0 - 1]['role'] != 'system' %}{{ '[INST] ' }}{% endif %}{{ message['content'] | trim + ' [/INST]' }}{% else %}{{ ' ' + message['content'] | trim + ' ' + eos_token }}{% endif %}{% endfor %}"#;

const MISTRAL: &str = r#"{% for message in messages %}{% if message['role'] == 'assistant' %}{{ message['content'] + eos_token }}{% elif message['role'] == 'system' %}{{ '[INST] ' + message['content'] + '\n\n' }}{% else %}{% if loop.index0 == 0 or messages[loop.index0 - 1]['role'] != 'system' %}{{ '[INST] ' }}{% endif %}{{ message['content'] + ' [/INST]' }}{% endif %}{% endfor %}"#;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// A Jinja chat template: a named builtin, the model's own, or a literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    source: String,
}

impl ChatTemplate {
    pub fn builtin(name: &str) -> Option<Self> {
        let source = match name {
            "chatml" => CHATML,
            "llama3" => LLAMA3,
            "llama2" => LLAMA2,
            "mistral" => MISTRAL,
            _ => return None,
        };
        Some(Self {
            source: source.to_string(),
        })
    }

    pub fn for_family(family: PromptFamily) -> Self {
        let source = match family {
            PromptFamily::Llama => LLAMA3,
            PromptFamily::Mistral => MISTRAL,
            PromptFamily::Qwen | PromptFamily::Unknown => CHATML,
        };
        Self {
            source: source.to_string(),
        }
    }

    /// Override (builtin name or literal Jinja), then the model's own
    /// template, then the family default.
    pub fn resolve(requested: Option<&str>, model_template: Option<&str>, family: PromptFamily) -> Result<Self> {
        if let Some(req) = requested {
            if let Some(builtin) = Self::builtin(req) {
                return Ok(builtin);
            }
            if req.contains("{%") || req.contains("{{") {
                return Ok(Self {
                    source: req.to_string(),
                });
            }
            return Err(EngineError::ArgumentParse(format!(
                "unknown chat template '{}'",
                req
            )));
        }
        if let Some(tpl) = model_template.filter(|t| !t.trim().is_empty()) {
            return Ok(Self {
                source: tpl.to_string(),
            });
        }
        Ok(Self::for_family(family))
    }

    pub fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        bos_token: &str,
        eos_token: &str,
    ) -> Result<String> {
        let mut env = Environment::new();
        env.add_function("raise_exception", |msg: String| -> std::result::Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        });
        env.render_str(
            &self.source,
            context!(
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => bos_token,
                eos_token => eos_token
            ),
        )
        .map_err(|e| EngineError::ArgumentParse(format!("chat template render failed: {}", e)))
    }
}

/// Prompt text as fed to the tokenizer. In conversation mode the system and
/// user turns go through the chat template.
pub fn format_prompt<V: Vocabulary>(
    params: &GenerationParameters,
    vocab: &V,
    family: PromptFamily,
) -> Result<String> {
    if !params.conversation_mode() {
        return Ok(params.prompt.clone());
    }

    let template = ChatTemplate::resolve(params.chat_template.as_deref(), vocab.chat_template(), family)?;
    let mut messages = Vec::with_capacity(2);
    if !params.system_prompt.is_empty() {
        messages.push(ChatMessage::new("system", &params.system_prompt));
    }
    if !params.prompt.is_empty() {
        messages.push(ChatMessage::new("user", &params.prompt));
    }
    if messages.is_empty() {
        return Ok(String::new());
    }

    let bos = vocab.bos().map(|t| vocab.piece_string(t, true)).unwrap_or_default();
    let eos = vocab.piece_string(vocab.eos(), true);
    let formatted = template.apply(&messages, true, &bos, &eos)?;
    info!(formatted = %formatted, "formatted chat prompt");
    Ok(formatted)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptInput {
    pub tokens: Vec<Token>,
    /// The input is the stored session: the caller sent no prompt.
    pub from_session: bool,
}

/// Builds `embd_inp` for this call.
pub fn prepare_input<V: Vocabulary>(
    params: &GenerationParameters,
    vocab: &V,
    family: PromptFamily,
    session_tokens: &[Token],
    n_ctx: usize,
) -> Result<PromptInput> {
    let mut input = if params.prompt.is_empty() && !session_tokens.is_empty() {
        info!("use session tokens");
        PromptInput {
            tokens: session_tokens.to_vec(),
            from_session: true,
        }
    } else {
        let text = format_prompt(params, vocab, family)?;
        let tokens = vocab.tokenize(&text, true, true)?;
        let max = n_ctx.saturating_sub(4);
        if tokens.len() > max {
            return Err(EngineError::PromptTooLong {
                tokens: tokens.len(),
                max,
            });
        }
        PromptInput {
            tokens,
            from_session: false,
        }
    };

    if input.tokens.is_empty() {
        match vocab.bos().filter(|_| vocab.add_bos()) {
            Some(bos) => {
                warn!("embd_inp was considered empty and bos was added");
                input.tokens.push(bos);
            }
            None => return Err(EngineError::EmptyInput),
        }
    }

    if params.verbose_prompt {
        info!(n_tokens = input.tokens.len(), "prompt: '{}'", params.prompt);
        for &token in &input.tokens {
            info!("{:6} -> '{}'", token, vocab.piece_string(token, true));
        }
    }

    Ok(input)
}
