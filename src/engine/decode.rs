use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::backend::{InferenceContext, Token, Vocabulary};
use crate::budget::TokenBudget;
use crate::conversation::ConversationView;
use crate::error::{EngineError, Result};
use crate::params::GenerationParameters;
use crate::prompting::{prepare_input, PromptFamily};
use crate::sampling::TokenSampler;
use crate::session::{load_session, match_prefix, reconcile, save_session};

/// Tokens of recent output scanned for antiprompts.
const ANTIPROMPT_WINDOW: usize = 32;
const ANTIPROMPT_PADDING: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// This call's token budget ran out. Call again to continue.
    BudgetExhausted,
    /// The sampling budget (`-n`) reached zero.
    PredictionLimit,
    AntipromptMatched,
    EndOfGeneration,
    /// The window is full and shifting is disabled.
    ContextFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Encoding,
    Predicting,
    Sampling,
    Stopped(StopCondition),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeState {
    pub n_past: usize,
    pub n_consumed: usize,
    pub n_remaining: i64,
    pub embd: Vec<Token>,
    pub matched_session_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub stop: StopCondition,
    pub state: DecodeState,
    pub view: ConversationView,
    pub session_tokens: Vec<Token>,
    pub session_saved: bool,
    pub conversation: String,
    pub generated: String,
    pub reached_end_of_generation: bool,
    pub tokens_evaluated: usize,
}

/// One call's worth of decoding: resume from the session, feed the prompt,
/// sample, and stop at the first stop condition or when the budget is spent.
pub(crate) struct DecodeLoop<'a, V: Vocabulary, C: InferenceContext> {
    params: &'a GenerationParameters,
    vocab: &'a V,
    ctx: &'a mut C,
    sampler: TokenSampler,
    budget: TokenBudget,
    n_ctx: usize,
    n_keep: usize,
    ga_i: usize,
    embd_inp: Vec<Token>,
    embd_from_prompt: bool,
    antiprompt_ids: Vec<Token>,
    session_path: Option<PathBuf>,
    session_tokens: Vec<Token>,
    n_session_consumed: usize,
    state: DecodeState,
    pending_stop: Option<StopCondition>,
    conversation: Vec<u8>,
    generated: Vec<u8>,
    eog_decoded: bool,
}

impl<'a, V: Vocabulary, C: InferenceContext> DecodeLoop<'a, V, C> {
    pub(crate) fn new(
        params: &'a GenerationParameters,
        vocab: &'a V,
        ctx: &'a mut C,
        family: PromptFamily,
        session_path: Option<PathBuf>,
        budget: TokenBudget,
    ) -> Result<Self> {
        if params.grp_attn_n > 1 && !ctx.supports_grouped_positions() {
            return Err(EngineError::ArgumentParse(
                "self-extend (grp_attn_n > 1) is not supported by this backend".to_string(),
            ));
        }

        let n_ctx = ctx.n_ctx();
        let mut session_tokens = match &session_path {
            Some(path) => load_session(path, &mut *ctx),
            None => Vec::new(),
        };

        let input = prepare_input(params, vocab, family, &session_tokens, n_ctx)?;
        let embd_inp = input.tokens;

        let mut n_matching = 0;
        if !session_tokens.is_empty() {
            n_matching = match_prefix(&session_tokens, &embd_inp);
            if params.prompt.is_empty() && n_matching == embd_inp.len() {
                info!("using full prompt from session file");
            } else if n_matching >= embd_inp.len() {
                info!("session file has exact match for prompt");
            } else if n_matching < embd_inp.len() / 2 {
                warn!(
                    session_match_ratio = n_matching as f64 / embd_inp.len() as f64,
                    "session file has low similarity to prompt ({} / {} tokens); will mostly be reevaluated",
                    n_matching,
                    embd_inp.len()
                );
            } else {
                info!("session file matches {} / {} tokens of prompt", n_matching, embd_inp.len());
            }
            ctx.kv_remove(n_matching, None)?;
        }

        if session_path.is_some() && reconcile(&mut session_tokens, embd_inp.len(), n_matching) {
            debug!("recalculate the cached logits: truncated session to {}", session_tokens.len());
        }

        let add_bos = usize::from(vocab.add_bos());
        let n_keep = match usize::try_from(params.n_keep) {
            Ok(keep) if keep <= embd_inp.len() => keep + add_bos,
            _ => embd_inp.len(),
        };

        let mut antiprompt_ids = Vec::new();
        for antiprompt in &params.antiprompts {
            let ids = vocab.tokenize(antiprompt, false, true)?;
            if let [single] = ids.as_slice() {
                antiprompt_ids.push(*single);
            }
        }

        info!(
            n_ctx,
            n_batch = params.n_batch,
            n_predict = params.n_predict,
            n_keep,
            max_tokens = budget.max_tokens(),
            "generate"
        );

        Ok(Self {
            params,
            vocab,
            ctx,
            sampler: TokenSampler::new(params, params.resolved_seed()),
            budget,
            n_ctx,
            n_keep,
            ga_i: 0,
            embd_inp,
            embd_from_prompt: false,
            antiprompt_ids,
            session_path,
            session_tokens,
            n_session_consumed: 0,
            state: DecodeState {
                n_remaining: params.n_predict,
                matched_session_tokens: n_matching,
                ..DecodeState::default()
            },
            pending_stop: None,
            conversation: Vec::new(),
            generated: Vec::new(),
            eog_decoded: false,
        })
    }

    pub(crate) fn run(mut self) -> Result<DecodeReport> {
        let mut phase = Phase::Init;
        loop {
            phase = match phase {
                Phase::Init => {
                    if self.state.n_remaining == 0 {
                        Phase::Stopped(StopCondition::PredictionLimit)
                    } else if self.ctx.has_encoder() {
                        Phase::Encoding
                    } else {
                        Phase::Predicting
                    }
                }
                Phase::Encoding => self.encode()?,
                Phase::Predicting => self.predict()?,
                Phase::Sampling => self.sample_or_feed()?,
                Phase::Stopped(stop) => return self.finish(stop),
            };
        }
    }

    fn encode(&mut self) -> Result<Phase> {
        self.ctx.encode(&self.embd_inp).map_err(|e| {
            error!(error = %e, "failed to encode");
            EngineError::from(e)
        })?;
        let start = self
            .ctx
            .decoder_start_token()
            .or_else(|| self.vocab.bos())
            .ok_or(EngineError::EmptyInput)?;
        self.embd_inp = vec![start];
        Ok(Phase::Predicting)
    }

    fn piece(&self, token: Token) -> Vec<u8> {
        self.vocab.token_to_piece(token, self.params.special)
    }

    fn predict(&mut self) -> Result<Phase> {
        if self.state.embd.is_empty() {
            return Ok(Phase::Sampling);
        }

        let max_embd = self.n_ctx.saturating_sub(4);
        if self.state.embd.len() > max_embd {
            let skipped = self.state.embd.len() - max_embd;
            self.state.embd.truncate(max_embd);
            warn!(skipped, "input too long, skipped tokens");
        }

        if self.params.grp_attn_n == 1 {
            if self.state.n_past + self.state.embd.len() >= self.n_ctx {
                if !self.params.context_shift() || self.params.n_predict == -2 {
                    warn!("context full and context shift is disabled => stopping");
                    if self.embd_from_prompt {
                        self.state.n_consumed -= self.state.embd.len();
                    }
                    return Ok(Phase::Stopped(StopCondition::ContextFull));
                }
                self.shift_context()?;
            }
        } else {
            self.self_extend()?;
        }

        self.reuse_session_prefix();

        let stop = self.evaluate_pending()?;
        self.state.embd.clear();

        match self.pending_stop.or(stop) {
            Some(stop) => Ok(Phase::Stopped(stop)),
            None => Ok(Phase::Sampling),
        }
    }

    /// Drops the oldest half of the non-kept window and slides the rest back.
    fn shift_context(&mut self) -> Result<()> {
        let n_past = self.state.n_past;
        let n_left = n_past.saturating_sub(self.n_keep);
        let n_discard = n_left / 2;

        info!(n_past, n_left, n_ctx = self.n_ctx, n_keep = self.n_keep, n_discard, "context full, swapping");

        self.ctx.kv_remove(self.n_keep, Some(self.n_keep + n_discard))?;
        self.ctx
            .kv_shift(self.n_keep + n_discard, n_past, -(n_discard as isize))?;
        self.state.n_past -= n_discard;

        if self.session_path.take().is_some() {
            info!("clearing session path to prevent saving a shifted context");
        }
        Ok(())
    }

    /// Grouped re-indexing: compresses each full window of `ga_w` positions
    /// by a factor of `ga_n`.
    fn self_extend(&mut self) -> Result<()> {
        let ga_n = self.params.grp_attn_n;
        let ga_w = self.params.grp_attn_w;

        while self.state.n_past >= self.ga_i + ga_w {
            let n_past = self.state.n_past;
            let ga_i = self.ga_i;
            let ib = (ga_n * ga_i) / ga_w;
            let bd = (ga_w / ga_n) * (ga_n - 1);
            let dd = (ga_w / ga_n) as isize - (ib * bd) as isize - ga_w as isize;

            debug!(ga_i, n_past, ib, bd, dd, "self-extend shift");

            self.ctx.kv_shift(ga_i, n_past, (ib * bd) as isize)?;
            self.ctx.kv_divide(ga_i + ib * bd, ga_i + ib * bd + ga_w, ga_n)?;
            self.ctx.kv_shift(ga_i + ib * bd + ga_w, n_past + ib * bd, dd)?;

            self.state.n_past -= bd;
            self.ga_i += ga_w / ga_n;
        }
        Ok(())
    }

    /// Skips leading tokens of `embd` that the restored session already holds.
    fn reuse_session_prefix(&mut self) {
        if self.n_session_consumed >= self.session_tokens.len() {
            return;
        }

        let mut i = 0;
        while i < self.state.embd.len() {
            let token = self.state.embd[i];
            if token != self.session_tokens[self.n_session_consumed] {
                self.session_tokens.truncate(self.n_session_consumed);
                break;
            }
            self.state.n_past += 1;
            self.n_session_consumed += 1;
            let piece = self.piece(token);
            self.conversation.extend_from_slice(&piece);
            i += 1;
            if self.n_session_consumed >= self.session_tokens.len() {
                break;
            }
        }
        self.state.embd.drain(..i);
    }

    /// Decodes `embd` in batches and returns a budget stop if one was hit.
    fn evaluate_pending(&mut self) -> Result<Option<StopCondition>> {
        let mut stop = None;
        let mut i = 0;
        while i < self.state.embd.len() {
            let n_eval = self
                .budget
                .clip((self.state.embd.len() - i).min(self.params.n_batch));
            if n_eval == 0 {
                stop = Some(StopCondition::BudgetExhausted);
                break;
            }

            debug!(n_eval, n_past = self.state.n_past, "eval");
            let batch = &self.state.embd[i..i + n_eval];
            self.ctx.decode(batch, self.state.n_past).map_err(|e| {
                error!(error = %e, "failed to eval");
                EngineError::InternalDecode(e.to_string())
            })?;
            self.state.n_past += n_eval;

            for &token in batch {
                let piece = self.vocab.token_to_piece(token, self.params.special);
                self.conversation.extend_from_slice(&piece);
            }

            self.budget.record(n_eval);
            i += n_eval;

            if self.budget.exhausted() {
                info!(
                    max_tokens = self.budget.max_tokens(),
                    n_eval_total = self.budget.evaluated(),
                    "token budget for this call is spent"
                );
                stop = Some(StopCondition::BudgetExhausted);
                break;
            }
        }

        // Tokens skipped by session reuse are already in the history.
        if i > 0 && self.session_path.is_some() {
            self.session_tokens.extend_from_slice(&self.state.embd[..i]);
            self.n_session_consumed = self.session_tokens.len();
        }

        let undecoded = self.state.embd.len() - i;
        if undecoded > 0 && self.embd_from_prompt {
            self.state.n_consumed -= undecoded;
        }

        if i == self.state.embd.len() && self.pending_stop == Some(StopCondition::EndOfGeneration) {
            self.eog_decoded = true;
        }

        Ok(stop)
    }

    fn sample_or_feed(&mut self) -> Result<Phase> {
        if self.embd_inp.len() <= self.state.n_consumed {
            let logits = self.ctx.logits()?;
            let id = self.sampler.sample(&logits)?;
            self.sampler.accept(id);
            self.state.embd.push(id);
            self.embd_from_prompt = false;
            self.state.n_remaining -= 1;

            let piece = self.piece(id);
            self.generated.extend_from_slice(&piece);
            debug!(n_remain = self.state.n_remaining, token = id, "sampled");
        } else {
            debug!(
                embd_inp = self.embd_inp.len(),
                n_consumed = self.state.n_consumed,
                "feeding input"
            );
            self.embd_from_prompt = true;
            while self.embd_inp.len() > self.state.n_consumed {
                let token = self.embd_inp[self.state.n_consumed];
                self.state.embd.push(token);
                self.sampler.accept(token);
                self.state.n_consumed += 1;

                if self.state.embd.len() >= self.params.n_batch {
                    break;
                }
                if self
                    .budget
                    .feed_limit_reached(self.state.n_consumed, self.state.matched_session_tokens)
                {
                    debug!(n_consumed = self.state.n_consumed, "feed limit reached for this call");
                    break;
                }
            }
        }

        if self.embd_inp.len() <= self.state.n_consumed {
            if self.antiprompt_matched() {
                info!("found antiprompt");
                self.pending_stop = Some(StopCondition::AntipromptMatched);
            }
            if let Some(&last) = self.state.embd.last() {
                if self.vocab.is_eog(last) {
                    info!("found end of generation token");
                    self.pending_stop = Some(StopCondition::EndOfGeneration);
                }
            }
        }

        if self.pending_stop.is_none() && self.state.n_remaining == 0 {
            self.pending_stop = Some(StopCondition::PredictionLimit);
        }

        Ok(Phase::Predicting)
    }

    fn antiprompt_matched(&self) -> bool {
        if self.params.antiprompts.is_empty() {
            return false;
        }

        let last_output = self.sampler.prev_str(self.vocab, ANTIPROMPT_WINDOW);
        for antiprompt in &self.params.antiprompts {
            let mut start = last_output
                .len()
                .saturating_sub(antiprompt.len() + ANTIPROMPT_PADDING);
            while !last_output.is_char_boundary(start) {
                start -= 1;
            }
            if last_output[start..].contains(antiprompt.as_str()) {
                return true;
            }
        }

        self.sampler
            .last()
            .is_some_and(|last| self.antiprompt_ids.contains(&last))
    }

    fn finish(self, stop: StopCondition) -> Result<DecodeReport> {
        let mut session_saved = false;
        if let Some(path) = &self.session_path {
            // With nothing decoded the file already matches the context it
            // was restored into, while `session_tokens` may have been trimmed.
            if self.params.persists_session() && self.budget.evaluated() > 0 {
                save_session(path, &self.session_tokens, &*self.ctx)?;
                session_saved = true;
            }
        }

        let view = ConversationView::partition(self.vocab, &self.embd_inp, self.state.n_consumed);
        info!(
            ?stop,
            n_past = self.state.n_past,
            n_consumed = self.state.n_consumed,
            remaining = self.embd_inp.len() - self.state.n_consumed.min(self.embd_inp.len()),
            "stopped"
        );

        Ok(DecodeReport {
            stop,
            tokens_evaluated: self.budget.evaluated(),
            view,
            session_tokens: self.session_tokens,
            session_saved,
            conversation: String::from_utf8_lossy(&self.conversation).into_owned(),
            generated: String::from_utf8_lossy(&self.generated).into_owned(),
            reached_end_of_generation: self.eog_decoded,
            state: self.state,
        })
    }
}
