use resumable_protocol::BudgetRecord;
use serde::{Deserialize, Serialize};

/// Which kind of call is being served. Each kind has its own ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Update,
    Query,
}

/// Per-call-kind token ceilings. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetLimits {
    pub max_tokens_update: u64,
    pub max_tokens_query: u64,
}

impl BudgetLimits {
    pub fn for_kind(&self, kind: CallKind) -> usize {
        let limit = match kind {
            CallKind::Update => self.max_tokens_update,
            CallKind::Query => self.max_tokens_query,
        };
        usize::try_from(limit).unwrap_or(usize::MAX)
    }
}

impl From<BudgetLimits> for BudgetRecord {
    fn from(limits: BudgetLimits) -> Self {
        BudgetRecord {
            max_tokens_update: limits.max_tokens_update,
            max_tokens_query: limits.max_tokens_query,
        }
    }
}

impl From<BudgetRecord> for BudgetLimits {
    fn from(record: BudgetRecord) -> Self {
        BudgetLimits {
            max_tokens_update: record.max_tokens_update,
            max_tokens_query: record.max_tokens_query,
        }
    }
}

/// Ceiling on the number of tokens evaluated in one call.
///
/// Independent of the sampling budget: it counts every token passed to the
/// decode primitive, prompt or generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    max_tokens: usize,
    n_eval_total: usize,
}

impl TokenBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            n_eval_total: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn is_limited(&self) -> bool {
        self.max_tokens > 0
    }

    pub fn evaluated(&self) -> usize {
        self.n_eval_total
    }

    pub fn remaining(&self) -> Option<usize> {
        self.is_limited()
            .then(|| self.max_tokens.saturating_sub(self.n_eval_total))
    }

    /// Clips a prospective batch so the running total never passes the ceiling.
    pub fn clip(&self, n_eval: usize) -> usize {
        match self.remaining() {
            Some(left) => n_eval.min(left),
            None => n_eval,
        }
    }

    pub fn record(&mut self, n_eval: usize) {
        self.n_eval_total += n_eval;
    }

    pub fn exhausted(&self) -> bool {
        self.is_limited() && self.n_eval_total >= self.max_tokens
    }

    /// Stop feeding prompt tokens once this call has lined up as many as it
    /// may evaluate. Tokens covered by the session prefix are free.
    pub fn feed_limit_reached(&self, n_consumed: usize, n_matching: usize) -> bool {
        self.is_limited() && n_consumed >= n_matching + self.max_tokens
    }
}
