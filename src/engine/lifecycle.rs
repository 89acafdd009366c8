use std::path::PathBuf;

use resumable_protocol::{OutputRecord, StatusRecord};
use tracing::{error, info, warn};

use crate::backend::{ContextOptions, LanguageModel, ModelSpec};
use crate::budget::{BudgetLimits, CallKind, TokenBudget};
use crate::config::EngineConfig;
use crate::conversation::ChatLog;
use crate::error::{EngineError, Result};
use crate::params::GenerationParameters;
use crate::session::{copy_session, remove_session, session_path};

use super::decode::DecodeLoop;
use super::{Engine, GenerationOutcome};

impl<M: LanguageModel> Engine<M> {
    pub fn new(config: EngineConfig) -> Self {
        let chat_log = ChatLog::new(config.cache_root.clone(), config.max_chats_per_principal);
        Self {
            model: None,
            model_path: None,
            limits: config.budget,
            chat_log,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            if let Some(path) = self.model_path.take() {
                info!(model = %path.display(), "released model");
            }
        }
    }

    /// Replaces the loaded model. The previous model is released before the
    /// new one is read, so a failed load leaves the engine without a model.
    fn load_from(&mut self, params: &GenerationParameters) -> Result<()> {
        let path = params
            .model
            .clone()
            .ok_or_else(|| EngineError::ArgumentParse("--model is required to load a model".to_string()))?;

        self.unload();

        let spec = ModelSpec {
            model_path: path.clone(),
            tokenizer_hint: params.tokenizer.clone(),
        };
        let model = M::load(&spec).map_err(|e| {
            error!(model = %path.display(), error = %e, "unable to load model");
            EngineError::from(e)
        })?;

        info!(
            model = %path.display(),
            family = ?model.family(),
            n_ctx_train = model.n_ctx_train(),
            "model loaded"
        );
        self.model = Some(model);
        self.model_path = Some(path);
        Ok(())
    }

    pub fn load_model<I, S>(&mut self, args: I) -> Result<StatusRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = GenerationParameters::parse(args)?;
        self.load_from(&params)?;
        Ok(StatusRecord::success("Model successfully loaded into memory."))
    }

    fn scoped_cache(&self, params: &GenerationParameters, principal: &str) -> Result<Option<PathBuf>> {
        params
            .prompt_cache
            .as_deref()
            .map(|name| session_path(&self.config.cache_root, principal, name))
            .transpose()
    }

    fn required_cache(&self, params: &GenerationParameters, principal: &str) -> Result<PathBuf> {
        self.scoped_cache(params, principal)?
            .ok_or_else(|| EngineError::InvalidCachePath("--prompt-cache is required".to_string()))
    }

    /// Runs one budget-capped generation call. `max_tokens == 0` means no cap.
    ///
    /// Argument and path errors are reported before anything is touched. A
    /// `--model` argument reloads the model before generating.
    pub fn generate<I, S>(&mut self, args: I, principal: &str, max_tokens: usize) -> Result<GenerationOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = GenerationParameters::parse(args)?;
        let session = self.scoped_cache(&params, principal)?;

        if params.model.is_some() {
            self.load_from(&params)?;
        }
        let model = self.model.as_ref().ok_or(EngineError::ModelNotLoaded)?;

        let n_ctx_train = model.n_ctx_train();
        let n_ctx = if params.n_ctx == 0 { n_ctx_train } else { params.n_ctx };
        if n_ctx > n_ctx_train {
            warn!(n_ctx, n_ctx_train, "model was trained on only {} context tokens", n_ctx_train);
        }

        let mut ctx = model.new_context(&ContextOptions {
            n_ctx,
            n_batch: params.n_batch,
        })?;

        let report = DecodeLoop::new(
            &params,
            model.vocabulary(),
            &mut ctx,
            model.family(),
            session,
            TokenBudget::new(max_tokens),
        )?
        .run()?;

        let outcome = GenerationOutcome {
            conversation_text: report.conversation,
            consumed_text: report.view.consumed,
            remaining_text: report.view.remaining,
            generated_text: report.generated,
            reached_end_of_generation: report.reached_end_of_generation,
            stop_reason: report.stop,
            tokens_evaluated: report.tokens_evaluated,
        };

        if self.config.chat_log_enabled {
            self.chat_log.save_conversation(principal, &outcome.conversation_text)?;
        }
        Ok(outcome)
    }

    /// `generate` with the configured ceiling for `kind`, answered as a record.
    pub fn run<I, S>(&mut self, kind: CallKind, args: I, principal: &str) -> OutputRecord
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let max_tokens = self.limits.for_kind(kind);
        match self.generate(args, principal, max_tokens) {
            Ok(outcome) => outcome.into_record(),
            Err(e) => {
                error!(principal, error = %e, "generation failed");
                OutputRecord::failure(e.status_code(), e.to_string())
            }
        }
    }

    pub fn run_update<I, S>(&mut self, args: I, principal: &str) -> OutputRecord
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.run(CallKind::Update, args, principal)
    }

    pub fn run_query<I, S>(&mut self, args: I, principal: &str) -> OutputRecord
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.run(CallKind::Query, args, principal)
    }

    /// Starts a fresh chat log entry and deletes the named session cache, so
    /// the next `generate` builds its history from empty.
    pub fn start_new_conversation<I, S>(&mut self, args: I, principal: &str) -> Result<StatusRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = GenerationParameters::parse(args)?;
        let path = self.required_cache(&params, principal)?;

        if self.config.chat_log_enabled {
            self.chat_log.new_chat(principal)?;
            self.chat_log.clean(principal)?;
        }

        remove_session(&path)?;
        Ok(StatusRecord::success(format!(
            "Ready to start a new chat for cache file {}",
            path.display()
        )))
    }

    pub fn remove_prompt_cache<I, S>(&mut self, args: I, principal: &str) -> Result<StatusRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let params = GenerationParameters::parse(args)?;
        let path = self.required_cache(&params, principal)?;

        let msg = if remove_session(&path)? {
            format!("Cache file {} deleted successfully", path.display())
        } else {
            format!("Cache file {} not found. Nothing to delete.", path.display())
        };
        Ok(StatusRecord::success(msg))
    }

    pub fn copy_prompt_cache(&mut self, principal: &str, from: &str, to: &str) -> Result<StatusRecord> {
        let from_path = session_path(&self.config.cache_root, principal, from)?;
        let to_path = session_path(&self.config.cache_root, principal, to)?;
        copy_session(&from_path, &to_path)?;
        info!(from = %from_path.display(), to = %to_path.display(), "copied session cache");
        Ok(StatusRecord::success(format!(
            "Copied {} to {}",
            from_path.display(),
            to_path.display()
        )))
    }

    pub fn set_budget_limits(&mut self, limits: BudgetLimits) {
        info!(
            max_tokens_update = limits.max_tokens_update,
            max_tokens_query = limits.max_tokens_query,
            "updated token budget limits"
        );
        self.limits = limits;
    }

    pub fn budget_limits(&self) -> BudgetLimits {
        self.limits
    }
}
