use std::path::PathBuf;
use std::str::FromStr;

use clap::{CommandFactory, Parser};
use tracing::warn;

use crate::error::{EngineError, Result};

/// Seed value meaning "draw one from the OS".
pub const DEFAULT_SEED: u32 = u32::MAX;

/// Smallest context the loop can work with.
pub const MIN_CTX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Penalties,
    TopK,
    TopP,
    MinP,
    Temperature,
}

impl FromStr for SamplerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "penalties" => Ok(Self::Penalties),
            "top_k" => Ok(Self::TopK),
            "top_p" => Ok(Self::TopP),
            "min_p" => Ok(Self::MinP),
            "temperature" | "temp" => Ok(Self::Temperature),
            other => Err(format!("Unknown sampler '{}'.", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerChain(pub Vec<SamplerKind>);

impl SamplerChain {
    pub fn contains(&self, kind: SamplerKind) -> bool {
        self.0.contains(&kind)
    }
}

fn parse_sampler_chain(raw: &str) -> std::result::Result<SamplerChain, String> {
    let kinds = raw
        .split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SamplerKind::from_str)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(SamplerChain(kinds))
}

/// Immutable per-call configuration, built from the caller's argument list.
#[derive(Parser, Debug, Clone)]
#[command(name = "generate", no_binary_name = true, disable_version_flag = true)]
pub struct GenerationParameters {
    #[arg(short = 'm', long = "model")]
    pub model: Option<PathBuf>,

    #[arg(long = "tokenizer")]
    pub tokenizer: Option<PathBuf>,

    #[arg(short = 'p', long = "prompt", default_value = "", allow_hyphen_values = true)]
    pub prompt: String,

    #[arg(long = "system-prompt", default_value = "", allow_hyphen_values = true)]
    pub system_prompt: String,

    /// -1 = unbounded, -2 = until the context is full.
    #[arg(short = 'n', long = "n-predict", default_value_t = -1, allow_negative_numbers = true)]
    pub n_predict: i64,

    /// 0 = the model's trained context size.
    #[arg(short = 'c', long = "ctx-size", default_value_t = 4096)]
    pub n_ctx: usize,

    #[arg(short = 'b', long = "batch-size", default_value_t = 2048)]
    pub n_batch: usize,

    #[arg(long = "keep", default_value_t = 0, allow_negative_numbers = true)]
    pub n_keep: i64,

    #[arg(long = "temp", default_value_t = 0.8)]
    pub temperature: f64,

    #[arg(long = "top-k", default_value_t = 40)]
    pub top_k: usize,

    #[arg(long = "top-p", default_value_t = 0.95)]
    pub top_p: f64,

    #[arg(long = "min-p", default_value_t = 0.05)]
    pub min_p: f64,

    #[arg(long = "repeat-penalty", default_value_t = 1.0)]
    pub repeat_penalty: f32,

    #[arg(long = "repeat-last-n", default_value_t = 64)]
    pub repeat_last_n: usize,

    #[arg(short = 's', long = "seed", default_value_t = DEFAULT_SEED)]
    pub seed: u32,

    #[arg(
        long = "samplers",
        default_value = "penalties;top_k;top_p;min_p;temperature",
        value_parser = parse_sampler_chain
    )]
    pub samplers: SamplerChain,

    #[arg(long = "prompt-cache")]
    pub prompt_cache: Option<String>,

    #[arg(long = "prompt-cache-all")]
    pub prompt_cache_all: bool,

    #[arg(long = "prompt-cache-ro")]
    pub prompt_cache_ro: bool,

    #[arg(short = 'r', long = "reverse-prompt", allow_hyphen_values = true)]
    pub antiprompts: Vec<String>,

    #[arg(long = "special")]
    pub special: bool,

    #[arg(long = "no-context-shift")]
    pub no_context_shift: bool,

    #[arg(long = "grp-attn-n", default_value_t = 1)]
    pub grp_attn_n: usize,

    #[arg(long = "grp-attn-w", default_value_t = 512)]
    pub grp_attn_w: usize,

    #[arg(long = "conversation")]
    pub conversation: bool,

    #[arg(long = "no-conversation")]
    pub no_conversation: bool,

    #[arg(long = "chat-template")]
    pub chat_template: Option<String>,

    #[arg(long = "no-escape")]
    pub no_escape: bool,

    #[arg(long = "verbose-prompt")]
    pub verbose_prompt: bool,
}

/// Multi-letter single-dash spellings accepted for compatibility.
fn normalize_legacy_flag(arg: &str) -> &str {
    match arg {
        "-cnv" => "--conversation",
        "-no-cnv" => "--no-conversation",
        "-gan" => "--grp-attn-n",
        "-gaw" => "--grp-attn-w",
        "-sys" => "--system-prompt",
        "-sp" => "--special",
        other => other,
    }
}

impl GenerationParameters {
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::try_parse_from(Self::normalize_args(args))
            .map_err(|e| EngineError::ArgumentParse(e.to_string().trim_end().to_string()))?;
        params.validate()?;

        if !params.no_escape {
            params.prompt = process_escapes(&params.prompt);
            params.system_prompt = process_escapes(&params.system_prompt);
            params.antiprompts = params.antiprompts.iter().map(|a| process_escapes(a)).collect();
        }
        Ok(params)
    }

    /// Rewrites legacy spellings in flag position only; option values such
    /// as a prompt of `-sp` pass through untouched.
    fn normalize_args<I, S>(args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let command = Self::command();
        let value_flags: Vec<String> = command
            .get_arguments()
            .filter(|arg| arg.get_action().takes_values())
            .flat_map(|arg| {
                let short = arg.get_short().map(|c| format!("-{}", c));
                let long = arg.get_long().map(|l| format!("--{}", l));
                short.into_iter().chain(long)
            })
            .collect();

        let mut out = Vec::new();
        let mut expects_value = false;
        for arg in args {
            let arg = arg.as_ref();
            let token = if expects_value { arg } else { normalize_legacy_flag(arg) };
            expects_value = !expects_value && value_flags.iter().any(|f| f == token);
            out.push(token.to_string());
        }
        out
    }

    fn validate(&mut self) -> Result<()> {
        if self.n_batch == 0 {
            return Err(EngineError::ArgumentParse("batch size must be > 0".to_string()));
        }
        if self.grp_attn_n == 0 {
            return Err(EngineError::ArgumentParse("grp_attn_n must be positive".to_string()));
        }
        if self.grp_attn_n > 1 && self.grp_attn_w < self.grp_attn_n {
            return Err(EngineError::ArgumentParse(
                "grp_attn_w must be at least grp_attn_n".to_string(),
            ));
        }
        if self.grp_attn_w % self.grp_attn_n != 0 {
            return Err(EngineError::ArgumentParse(
                "grp_attn_w must be a multiple of grp_attn_n".to_string(),
            ));
        }
        if self.n_ctx != 0 && self.n_ctx < MIN_CTX {
            warn!(requested = self.n_ctx, "minimum context size is {}, using it", MIN_CTX);
            self.n_ctx = MIN_CTX;
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::ArgumentParse("top_p must be in [0.0, 1.0]".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(EngineError::ArgumentParse("min_p must be in [0.0, 1.0]".to_string()));
        }
        Ok(())
    }

    pub fn conversation_mode(&self) -> bool {
        self.conversation && !self.no_conversation
    }

    pub fn context_shift(&self) -> bool {
        !self.no_context_shift
    }

    /// Session saves happen only with cache-all on a writable cache.
    pub fn persists_session(&self) -> bool {
        self.prompt_cache_all && !self.prompt_cache_ro
    }

    pub fn resolved_seed(&self) -> u64 {
        if self.seed != DEFAULT_SEED {
            return u64::from(self.seed);
        }
        let mut buf = [0u8; 4];
        match getrandom::getrandom(&mut buf) {
            Ok(()) => u64::from(u32::from_le_bytes(buf)),
            Err(e) => {
                warn!(error = %e, "OS randomness unavailable, using fixed seed");
                299_792_458
            }
        }
    }
}

/// Interprets C-style escapes typed on a command line.
pub fn process_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let hex: String = chars.clone().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(b) if hex.len() == 2 => {
                        chars.next();
                        chars.next();
                        out.push(char::from(b));
                    }
                    _ => out.push_str("\\x"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{process_escapes, GenerationParameters, SamplerKind, DEFAULT_SEED, MIN_CTX};

    #[test]
    fn parses_cached_greedy_call() {
        let params = GenerationParameters::parse([
            "--prompt-cache",
            "prompt.cache",
            "--prompt-cache-all",
            "--samplers",
            "temperature",
            "--temp",
            "0.0",
            "-n",
            "3",
            "-p",
            "Joe loves writing stories",
        ])
        .expect("parse args");

        assert_eq!(params.prompt_cache.as_deref(), Some("prompt.cache"));
        assert!(params.prompt_cache_all);
        assert!(params.persists_session());
        assert_eq!(params.samplers.0, vec![SamplerKind::Temperature]);
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.n_predict, 3);
        assert_eq!(params.prompt, "Joe loves writing stories");
        assert_eq!(params.seed, DEFAULT_SEED);
    }

    #[test]
    fn legacy_flags_and_negative_numbers() {
        let params = GenerationParameters::parse([
            "-cnv", "-gan", "2", "-gaw", "8", "-n", "-2", "--keep", "-1", "-sys", "be brief",
        ])
        .expect("parse legacy flags");
        assert!(params.conversation_mode());
        assert_eq!(params.grp_attn_n, 2);
        assert_eq!(params.grp_attn_w, 8);
        assert_eq!(params.n_predict, -2);
        assert_eq!(params.n_keep, -1);
        assert_eq!(params.system_prompt, "be brief");
    }

    #[test]
    fn legacy_spellings_in_values_are_kept() {
        let params = GenerationParameters::parse(["-p", "-sp", "-r", "-cnv", "-sys", "-gan"])
            .expect("parse values");
        assert_eq!(params.prompt, "-sp");
        assert!(!params.special);
        assert_eq!(params.antiprompts, vec!["-cnv".to_string()]);
        assert!(!params.conversation_mode());
        assert_eq!(params.system_prompt, "-gan");
        assert_eq!(params.grp_attn_n, 1);
    }

    #[test]
    fn repeated_reverse_prompts_are_collected() {
        let params = GenerationParameters::parse(["-r", "User:", "--reverse-prompt", "\\n\\n"])
            .expect("parse antiprompts");
        assert_eq!(params.antiprompts, vec!["User:".to_string(), "\n\n".to_string()]);
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(GenerationParameters::parse(["--bogus"]).is_err());
        assert!(GenerationParameters::parse(["-n", "three"]).is_err());
        assert!(GenerationParameters::parse(["--samplers", "top_k;mirostat"]).is_err());
        assert!(GenerationParameters::parse(["-gan", "3", "-gaw", "512"]).is_err());
        assert!(GenerationParameters::parse(["-b", "0"]).is_err());
        assert!(GenerationParameters::parse(["-gan", "2", "-gaw", "0"]).is_err());
        assert!(GenerationParameters::parse(["-gan", "4", "-gaw", "2"]).is_err());
    }

    #[test]
    fn tiny_context_is_clamped_not_rejected() {
        let params = GenerationParameters::parse(["-c", "4"]).expect("parse ctx");
        assert_eq!(params.n_ctx, MIN_CTX);
        let params = GenerationParameters::parse(["-c", "0"]).expect("parse ctx 0");
        assert_eq!(params.n_ctx, 0);
    }

    #[test]
    fn escapes_can_be_disabled() {
        let params = GenerationParameters::parse(["-p", "a\\nb", "--no-escape"]).expect("parse");
        assert_eq!(params.prompt, "a\\nb");
        assert_eq!(process_escapes("tab\\there \\x41\\q"), "tab\there A\\q");
    }

    #[test]
    fn explicit_seed_is_used_verbatim() {
        let params = GenerationParameters::parse(["-s", "42"]).expect("parse seed");
        assert_eq!(params.resolved_seed(), 42);
    }
}
