use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::budget::BudgetLimits;
use crate::error::{EngineError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "resumable_llm.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root of the principal-scoped tree holding session caches and chat logs.
    pub cache_root: PathBuf,
    pub max_chats_per_principal: usize,
    pub chat_log_enabled: bool,
    pub log_filter: String,
    pub budget: BudgetLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(".canister_cache"),
            max_chats_per_principal: 3,
            chat_log_enabled: true,
            log_filter: "info".to_string(),
            budget: BudgetLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        if cfg.max_chats_per_principal == 0 {
            return Err(EngineError::Config(
                "max_chats_per_principal must be > 0".to_string(),
            ));
        }
        Ok(cfg)
    }

    /// Reads `explicit` when given, otherwise [`DEFAULT_CONFIG_FILE`] from the
    /// working directory if present, otherwise the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let raw = fs::read_to_string(&path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = EngineConfig::from_toml_str("").expect("parse empty config");
        assert_eq!(cfg.cache_root, PathBuf::from(".canister_cache"));
        assert_eq!(cfg.max_chats_per_principal, 3);
        assert!(cfg.chat_log_enabled);
        assert_eq!(cfg.budget.max_tokens_update, 0);
    }

    #[test]
    fn budget_table_overrides_limits() {
        let cfg = EngineConfig::from_toml_str(
            "cache_root = \"/tmp/llm\"\n[budget]\nmax_tokens_update = 128\nmax_tokens_query = 16\n",
        )
        .expect("parse config");
        assert_eq!(cfg.cache_root, PathBuf::from("/tmp/llm"));
        assert_eq!(cfg.budget.max_tokens_update, 128);
        assert_eq!(cfg.budget.max_tokens_query, 16);
    }

    #[test]
    fn unknown_keys_and_zero_chat_cap_are_rejected() {
        assert!(EngineConfig::from_toml_str("cache_dir = \"x\"").is_err());
        assert!(EngineConfig::from_toml_str("max_chats_per_principal = 0").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        let missing = std::env::temp_dir().join(format!("resumable_cfg_{}_{}.toml", std::process::id(), ts));
        assert!(EngineConfig::load(Some(&missing)).is_err());
    }
}
