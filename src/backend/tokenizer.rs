use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokenizers::decoders::DecoderWrapper;
use tokenizers::Tokenizer;

use super::{BackendError, Token, Vocabulary};
use crate::prompting::PromptFamily;

/// Finds the `tokenizer.json` for a GGUF file. An explicit path must exist;
/// otherwise the model's directory is searched before the working directory.
pub(super) fn resolve_tokenizer_path(model_path: &Path, hint: Option<&Path>) -> Result<PathBuf, BackendError> {
    if let Some(hint) = hint {
        return if hint.is_file() {
            Ok(hint.to_path_buf())
        } else {
            Err(BackendError::Load(format!("tokenizer {} does not exist", hint.display())))
        };
    }

    let model_dir = model_path.parent().unwrap_or(Path::new("."));
    let mut candidates = Vec::with_capacity(3);
    if let Some(stem) = model_path.file_stem().and_then(|s| s.to_str()) {
        candidates.push(model_dir.join(format!("{}.tokenizer.json", stem)));
    }
    candidates.push(model_dir.join("tokenizer.json"));
    candidates.push(PathBuf::from("tokenizer.json"));

    candidates.iter().find(|c| c.is_file()).cloned().ok_or_else(|| {
        let searched: Vec<String> = candidates.iter().map(|c| c.display().to_string()).collect();
        BackendError::Load(format!(
            "no tokenizer for {} (searched {})",
            model_path.display(),
            searched.join(", ")
        ))
    })
}

/// End-of-sequence and optional end-of-turn ids for a family.
pub(super) fn resolve_special_tokens(
    tokenizer: &Tokenizer,
    family: PromptFamily,
) -> Result<(Token, Option<Token>), String> {
    match family {
        PromptFamily::Llama => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| {
                    "Tokenizer/model incompatibility: Llama requires <|end_of_text|> or </s>."
                        .to_string()
                })?;
            Ok((eos, tokenizer.token_to_id("<|eot_id|>")))
        }
        PromptFamily::Qwen => {
            let eos = tokenizer
                .token_to_id("<|endoftext|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .ok_or_else(|| {
                    "Tokenizer/model incompatibility: Qwen requires <|endoftext|> or </s>."
                        .to_string()
                })?;
            Ok((eos, tokenizer.token_to_id("<|im_end|>")))
        }
        PromptFamily::Mistral => {
            let eos = tokenizer
                .token_to_id("</s>")
                .or_else(|| tokenizer.token_to_id("<|end_of_text|>"))
                .ok_or_else(|| {
                    "Tokenizer/model incompatibility: Mistral requires </s> or <|end_of_text|>."
                        .to_string()
                })?;
            Ok((eos, None))
        }
        PromptFamily::Unknown => {
            let eos = tokenizer
                .token_to_id("<|end_of_text|>")
                .or_else(|| tokenizer.token_to_id("</s>"))
                .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
                .unwrap_or(2);
            Ok((eos, None))
        }
    }
}

/// Special-token metadata read from the GGUF header, each entry optional.
#[derive(Debug, Clone, Default)]
pub(super) struct VocabHints {
    pub bos: Option<Token>,
    pub eos: Option<Token>,
    pub add_bos: Option<bool>,
    pub chat_template: Option<String>,
}

/// [`Vocabulary`] over a HuggingFace `tokenizer.json`.
pub struct TokenizerVocab {
    tokenizer: Tokenizer,
    literal: Tokenizer,
    bos: Option<Token>,
    add_bos: bool,
    eos: Token,
    eot: Option<Token>,
    control: HashSet<Token>,
    byte_level: Option<HashMap<char, u8>>,
    chat_template: Option<String>,
}

impl TokenizerVocab {
    pub(super) fn new(
        tokenizer: Tokenizer,
        family: PromptFamily,
        hints: VocabHints,
    ) -> Result<Self, BackendError> {
        let (family_eos, eot) =
            resolve_special_tokens(&tokenizer, family).map_err(BackendError::Load)?;
        let eos = hints.eos.unwrap_or(family_eos);

        let bos = hints.bos.or_else(|| {
            ["<|begin_of_text|>", "<s>"]
                .iter()
                .find_map(|t| tokenizer.token_to_id(t))
        });
        let add_bos = hints.add_bos.unwrap_or(match family {
            PromptFamily::Qwen => false,
            _ => bos.is_some(),
        });

        let control: HashSet<Token> = tokenizer
            .get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, tok)| tok.special)
            .map(|(id, _)| id)
            .collect();

        let byte_level = matches!(tokenizer.get_decoder(), Some(DecoderWrapper::ByteLevel(_)))
            .then(byte_level_inverse);

        let mut literal = tokenizer.clone();
        literal.set_encode_special_tokens(true);

        Ok(Self {
            tokenizer,
            literal,
            bos,
            add_bos,
            eos,
            eot,
            control,
            byte_level,
            chat_template: hints.chat_template,
        })
    }
}

impl Vocabulary for TokenizerVocab {
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, BackendError> {
        let tokenizer = if parse_special {
            &self.tokenizer
        } else {
            &self.literal
        };
        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| BackendError::Tokenize(e.to_string()))?;

        let mut tokens = Vec::with_capacity(encoding.len() + 1);
        if add_special && self.add_bos {
            if let Some(bos) = self.bos {
                if encoding.get_ids().first() != Some(&bos) {
                    tokens.push(bos);
                }
            }
        }
        tokens.extend_from_slice(encoding.get_ids());
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Vec<u8> {
        let Some(raw) = self.tokenizer.id_to_token(token) else {
            return Vec::new();
        };

        if self.control.contains(&token) {
            return if special { raw.into_bytes() } else { Vec::new() };
        }

        if let Some(map) = &self.byte_level {
            return raw
                .chars()
                .map(|c| map.get(&c).copied())
                .collect::<Option<Vec<u8>>>()
                .unwrap_or_else(|| raw.into_bytes());
        }

        // SentencePiece: byte-fallback pieces and the word-boundary marker.
        if let Some(hex) = raw.strip_prefix("<0x").and_then(|r| r.strip_suffix('>')) {
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                return vec![byte];
            }
        }
        raw.replace('\u{2581}', " ").into_bytes()
    }

    fn bos(&self) -> Option<Token> {
        self.bos
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn eos(&self) -> Token {
        self.eos
    }

    fn eot(&self) -> Option<Token> {
        self.eot
    }

    fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }
}

/// Inverse of the GPT-2 byte-to-unicode table used by byte-level BPE.
fn byte_level_inverse() -> HashMap<char, u8> {
    let printable = (b'!'..=b'~').chain(0xA1..=0xAC).chain(0xAE..=0xFF);
    let mut map: HashMap<char, u8> = printable.map(|b| (char::from(b), b)).collect();

    let mut n = 0u32;
    for b in 0..=255u8 {
        if map.values().any(|&v| v == b) {
            continue;
        }
        if let Some(c) = char::from_u32(256 + n) {
            map.insert(c, b);
        }
        n += 1;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::{byte_level_inverse, resolve_tokenizer_path, BackendError};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn byte_level_table_covers_every_byte() {
        let map = byte_level_inverse();
        assert_eq!(map.len(), 256);
        assert_eq!(map.get(&'\u{0120}'), Some(&b' '));
        assert_eq!(map.get(&'\u{010A}'), Some(&b'\n'));
        assert_eq!(map.get(&'A'), Some(&b'A'));
    }

    #[test]
    fn tokenizer_lookup_order() {
        let base = mk_temp_dir("resumable_tok");
        fs::create_dir_all(&base).expect("create base");
        let model = base.join("qwen2.5-0.5b-instruct-q8_0.gguf");
        fs::write(&model, b"stub").expect("write model stub");
        fs::write(base.join("tokenizer.json"), b"{}").expect("write tokenizer stub");

        let found = resolve_tokenizer_path(&model, None).expect("tokenizer found");
        assert_eq!(found, base.join("tokenizer.json"));

        let named = base.join("qwen2.5-0.5b-instruct-q8_0.tokenizer.json");
        fs::write(&named, b"{}").expect("write named tokenizer");
        assert_eq!(resolve_tokenizer_path(&model, None).expect("named tokenizer"), named);

        let hint = base.join("custom.json");
        assert!(matches!(
            resolve_tokenizer_path(&model, Some(&hint)),
            Err(BackendError::Load(_))
        ));
        fs::write(&hint, b"{}").expect("write hint");
        assert_eq!(resolve_tokenizer_path(&model, Some(&hint)).expect("hint"), hint);

        let _ = fs::remove_dir_all(&base);
    }

    fn mk_temp_dir(prefix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts))
    }
}
