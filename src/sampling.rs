use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;

use crate::backend::{BackendError, Token, Vocabulary};
use crate::params::{GenerationParameters, SamplerKind};

/// Tokens kept for repetition penalties and antiprompt matching.
const HISTORY_FLOOR: usize = 32;

pub struct TokenSampler {
    processor: LogitsProcessor,
    repeat_penalty: Option<(f32, usize)>,
    min_p: Option<f32>,
    greedy: bool,
    prev: Vec<Token>,
    capacity: usize,
}

impl TokenSampler {
    pub fn new(params: &GenerationParameters, seed: u64) -> Self {
        let chain = &params.samplers;
        let temperature = params.temperature;
        let greedy = temperature <= 0.0 || !chain.contains(SamplerKind::Temperature);

        let top_k = chain.contains(SamplerKind::TopK).then_some(params.top_k).filter(|k| *k > 0);
        let top_p = chain
            .contains(SamplerKind::TopP)
            .then_some(params.top_p)
            .filter(|p| *p < 1.0);

        let sampling = if greedy {
            Sampling::ArgMax
        } else {
            match (top_k, top_p) {
                (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
                (Some(k), None) => Sampling::TopK { k, temperature },
                (None, Some(p)) => Sampling::TopP { p, temperature },
                (None, None) => Sampling::All { temperature },
            }
        };

        let repeat_penalty = (chain.contains(SamplerKind::Penalties)
            && params.repeat_penalty != 1.0
            && params.repeat_last_n > 0)
            .then_some((params.repeat_penalty, params.repeat_last_n));
        let min_p = (!greedy && chain.contains(SamplerKind::MinP) && params.min_p > 0.0)
            .then_some(params.min_p as f32);

        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
            repeat_penalty,
            min_p,
            greedy,
            prev: Vec::new(),
            capacity: params.repeat_last_n.max(HISTORY_FLOOR),
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.greedy
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<Token, BackendError> {
        let mut logits = logits.flatten_all()?.to_dtype(DType::F32)?;

        if let Some((penalty, last_n)) = self.repeat_penalty {
            let start = self.prev.len().saturating_sub(last_n);
            logits = apply_repeat_penalty(&logits, penalty, &self.prev[start..])?;
        }

        if let Some(min_p) = self.min_p {
            logits = filter_min_p(&logits, min_p)?;
        }

        Ok(self.processor.sample(&logits)?)
    }

    /// Records a token in the history, whether sampled or fed from the prompt.
    pub fn accept(&mut self, token: Token) {
        self.prev.push(token);
        if self.prev.len() > self.capacity * 2 {
            let excess = self.prev.len() - self.capacity;
            self.prev.drain(..excess);
        }
    }

    pub fn last(&self) -> Option<Token> {
        self.prev.last().copied()
    }

    /// Rendered text of the last `n` accepted tokens.
    pub fn prev_str<V: Vocabulary>(&self, vocab: &V, n: usize) -> String {
        let start = self.prev.len().saturating_sub(n);
        let bytes: Vec<u8> = self.prev[start..]
            .iter()
            .flat_map(|&t| vocab.token_to_piece(t, true))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Drops tokens whose probability is below `min_p` times the top one.
fn filter_min_p(logits: &Tensor, min_p: f32) -> Result<Tensor, BackendError> {
    let mut values = logits.to_vec1::<f32>()?;
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let threshold = max + min_p.ln();
    for v in values.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
    let n = values.len();
    Ok(Tensor::from_vec(values, n, logits.device())?)
}

#[cfg(test)]
mod tests {
    use super::{filter_min_p, TokenSampler};
    use crate::backend::scripted::{ScriptedVocab, STORY};
    use crate::params::GenerationParameters;
    use candle_core::{Device, Tensor};

    #[test]
    fn zero_temperature_is_argmax() {
        let params = GenerationParameters::parse(["--samplers", "temperature", "--temp", "0.0"]).expect("parse");
        let mut sampler = TokenSampler::new(&params, 1);
        assert!(sampler.is_greedy());
        let logits = Tensor::new(&[0.1f32, 3.0, -1.0, 2.9], &Device::Cpu).expect("tensor");
        assert_eq!(sampler.sample(&logits).expect("sample"), 1);
    }

    #[test]
    fn repeat_penalty_demotes_seen_tokens() {
        let params = GenerationParameters::parse([
            "--temp", "0", "--repeat-penalty", "2.0", "--samplers", "penalties;temperature",
        ])
        .expect("parse");
        let mut sampler = TokenSampler::new(&params, 1);
        sampler.accept(1);
        let logits = Tensor::new(&[0.0f32, 3.0, 2.0], &Device::Cpu).expect("tensor");
        assert_eq!(sampler.sample(&logits).expect("sample"), 2);
    }

    #[test]
    fn min_p_masks_unlikely_tokens() {
        let logits = Tensor::new(&[0.0f32, 5.0, 4.9], &Device::Cpu).expect("tensor");
        let filtered = filter_min_p(&logits, 0.5).expect("filter").to_vec1::<f32>().expect("vec");
        assert!(filtered[0].is_infinite());
        assert_eq!(filtered[1], 5.0);
        assert_eq!(filtered[2], 4.9);
    }

    #[test]
    fn history_renders_recent_text() {
        let vocab = ScriptedVocab::new(STORY);
        let params = GenerationParameters::parse(["--temp", "0"]).expect("parse");
        let mut sampler = TokenSampler::new(&params, 1);
        for word in ["Joe", "loves", "writing"] {
            sampler.accept(vocab.id(word));
        }
        assert_eq!(sampler.prev_str(&vocab, 2), " loves writing");
        assert_eq!(sampler.last(), Some(vocab.id("writing")));
    }
}
