//! Sampling chain - turns one step's logits into the next token
//!
//! Stages run in a fixed order, each on the survivors of the previous one:
//! repetition penalty, top-k, min-p, top-p, temperature, final draw.
//! No stage may leave the set empty; the highest-logit candidate always
//! survives every filter.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::request::SamplingParams;
use crate::runtime::TokenId;

/// One vocabulary entry under consideration.
///
/// `p` is scratch space: it is only meaningful right after a stage that
/// computed probabilities over the current survivors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingCandidate {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Survivor set handed from stage to stage.
#[derive(Debug, Clone)]
pub struct Candidates {
    items: Vec<SamplingCandidate>,
    sorted: bool,
}

impl Candidates {
    /// All vocabulary entries; NaN logits are treated as impossible.
    pub fn from_logits(logits: &[f32]) -> Self {
        let items = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| SamplingCandidate {
                id: i as TokenId,
                logit: if logit.is_nan() { f32::NEG_INFINITY } else { logit },
                p: 0.0,
            })
            .collect();
        Self {
            items,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[SamplingCandidate] {
        &self.items
    }

    pub fn ids(&self) -> Vec<TokenId> {
        self.items.iter().map(|c| c.id).collect()
    }

    /// Divide positive logits / multiply negative logits of every token seen
    /// in `recent` by `penalty`. Each distinct token is penalised once.
    pub fn apply_repeat_penalty(&mut self, recent: &[TokenId], penalty: f32) {
        if penalty == 1.0 || recent.is_empty() {
            return;
        }
        let seen: HashSet<TokenId> = recent.iter().copied().collect();
        for c in self.items.iter_mut().filter(|c| seen.contains(&c.id)) {
            if c.logit >= 0.0 {
                c.logit /= penalty;
            } else {
                c.logit *= penalty;
            }
        }
        self.sorted = false;
    }

    /// Keep the `k` highest logits. `k == 0` disables the stage.
    pub fn apply_top_k(&mut self, k: usize) {
        self.sort_by_logit();
        if k > 0 && k < self.items.len() {
            self.items.truncate(k);
        }
    }

    /// Drop candidates whose probability is below `min_p` times the top one.
    pub fn apply_min_p(&mut self, min_p: f32) {
        if min_p <= 0.0 || self.items.len() <= 1 {
            return;
        }
        self.softmax(1.0);
        let threshold = self.items[0].p * min_p;
        let keep = self
            .items
            .iter()
            .skip(1)
            .take_while(|c| c.p >= threshold)
            .count()
            + 1;
        self.items.truncate(keep);
    }

    /// Keep the smallest prefix whose cumulative probability reaches `top_p`.
    pub fn apply_top_p(&mut self, top_p: f32) {
        if top_p >= 1.0 || self.items.len() <= 1 {
            return;
        }
        self.softmax(1.0);
        let mut cumsum = 0.0f32;
        let mut keep = self.items.len();
        for (i, c) in self.items.iter().enumerate() {
            cumsum += c.p;
            if cumsum >= top_p {
                keep = i + 1;
                break;
            }
        }
        self.items.truncate(keep.max(1));
    }

    /// Recompute `p` over the survivors from `logit / temperature`.
    ///
    /// Leaves the set sorted by logit, descending. If every logit is
    /// negative infinity the survivors get a uniform distribution.
    pub fn softmax(&mut self, temperature: f32) {
        self.sort_by_logit();
        let Some(first) = self.items.first() else {
            return;
        };
        let max = first.logit;
        if max == f32::NEG_INFINITY {
            let uniform = 1.0 / self.items.len() as f32;
            for c in &mut self.items {
                c.p = uniform;
            }
            return;
        }
        let mut sum = 0.0f32;
        for c in &mut self.items {
            c.p = ((c.logit - max) / temperature).exp();
            sum += c.p;
        }
        for c in &mut self.items {
            c.p /= sum;
        }
    }

    /// Highest-logit survivor; ties go to the lowest token id.
    pub fn argmax(&mut self) -> Option<TokenId> {
        self.sort_by_logit();
        self.items.first().map(|c| c.id)
    }

    fn sort_by_logit(&mut self) {
        if self.sorted {
            return;
        }
        self.items.sort_by(|a, b| {
            b.logit
                .partial_cmp(&a.logit)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        self.sorted = true;
    }
}

/// Ordered logits-to-token pipeline for one generation.
///
/// The only state carried from step to step is the running token history
/// (prompt plus accepted tokens) used by the repetition penalty, and the
/// seeded generator for the final draw.
pub struct SamplingChain {
    params: SamplingParams,
    history: Vec<TokenId>,
    rng: StdRng,
}

impl SamplingChain {
    pub fn new(params: SamplingParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            history: Vec::new(),
            rng,
        }
    }

    /// Chain whose penalty window starts with the prompt tokens.
    pub fn with_history(params: SamplingParams, history: &[TokenId]) -> Self {
        let mut chain = Self::new(params);
        chain.history.extend_from_slice(history);
        chain
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    /// Record a token that was emitted so later steps penalise it.
    pub fn accept(&mut self, token: TokenId) {
        self.history.push(token);
    }

    /// Run the filter stages and return the survivors, before any draw.
    pub fn filter(&self, logits: &[f32]) -> Candidates {
        let mut candidates = Candidates::from_logits(logits);
        let start_at = self.history.len().saturating_sub(self.params.repeat_last_n);
        candidates.apply_repeat_penalty(&self.history[start_at..], self.params.repeat_penalty);
        candidates.apply_top_k(self.params.top_k);
        candidates.apply_min_p(self.params.min_p);
        candidates.apply_top_p(self.params.top_p);
        candidates
    }

    /// Choose the next token. Returns `None` only for an empty logit vector.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        let mut candidates = self.filter(logits);
        if self.params.is_greedy() {
            return candidates.argmax();
        }
        candidates.softmax(self.params.temperature);
        self.draw(&candidates)
    }

    fn draw(&mut self, candidates: &Candidates) -> Option<TokenId> {
        let items = candidates.as_slice();
        let last = items.last()?;
        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0;
        for c in items {
            cumsum += c.p;
            if cumsum >= r {
                return Some(c.id);
            }
        }
        // Rounding left the cumulative sum just short of r.
        Some(last.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits_with_peaks(vocab: usize, peaks: &[(usize, f32)]) -> Vec<f32> {
        let mut logits = vec![0.0f32; vocab];
        for &(i, v) in peaks {
            logits[i] = v;
        }
        logits
    }

    #[test]
    fn greedy_sampling() {
        let mut chain = SamplingChain::new(SamplingParams::greedy());
        let token = chain.sample(&[0.1, 0.9, 0.3, 0.5]);
        assert_eq!(token, Some(1));
    }

    #[test]
    fn greedy_is_deterministic() {
        let logits: Vec<f32> = (0..100).map(|i| ((i * 37) % 17) as f32 * 0.3).collect();
        let history = [3, 5, 8, 13];

        let mut a = SamplingChain::with_history(SamplingParams::greedy(), &history);
        let mut b = SamplingChain::with_history(
            SamplingParams {
                seed: 7,
                ..SamplingParams::greedy()
            },
            &history,
        );
        for _ in 0..5 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }

    #[test]
    fn same_seed_same_draws() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.1).sin()).collect();
        let params = SamplingParams {
            top_k: 0,
            min_p: 0.0,
            top_p: 1.0,
            temperature: 1.5,
            ..Default::default()
        };
        let mut a = SamplingChain::new(params.clone());
        let mut b = SamplingChain::new(params);
        let draws_a: Vec<_> = (0..20).map(|_| a.sample(&logits)).collect();
        let draws_b: Vec<_> = (0..20).map(|_| b.sample(&logits)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn repetition_penalty_reduces_repeat() {
        let mut chain = SamplingChain::with_history(
            SamplingParams {
                repeat_penalty: 100.0,
                ..SamplingParams::greedy()
            },
            &[1],
        );
        // Token 1 should be heavily penalised, so token 2 wins
        let token = chain.sample(&[0.1, 0.9, 0.8, 0.5]);
        assert_eq!(token, Some(2));
    }

    #[test]
    fn repetition_penalty_window_is_bounded() {
        let params = SamplingParams {
            repeat_penalty: 100.0,
            repeat_last_n: 2,
            ..SamplingParams::greedy()
        };
        // Token 1 fell out of the window: only 3 and 2 are penalised.
        let mut chain = SamplingChain::with_history(params, &[1, 3, 2]);
        assert_eq!(chain.sample(&[0.1, 0.9, 0.8, 0.5]), Some(1));
    }

    #[test]
    fn repetition_penalty_pushes_negative_logits_down() {
        let mut candidates = Candidates::from_logits(&[-1.0, 2.0]);
        candidates.apply_repeat_penalty(&[0, 1, 1], 2.0);
        let logits: Vec<(TokenId, f32)> =
            candidates.as_slice().iter().map(|c| (c.id, c.logit)).collect();
        assert!(logits.contains(&(0, -2.0)));
        assert!(logits.contains(&(1, 1.0)));
    }

    #[test]
    fn top_k_bounds_survivors_before_min_p() {
        let logits: Vec<f32> = (0..200).map(|i| i as f32 * 0.01).collect();
        for k in [1usize, 5, 40, 199] {
            let mut candidates = Candidates::from_logits(&logits);
            candidates.apply_top_k(k);
            assert!(candidates.len() <= k);
            assert_eq!(candidates.as_slice()[0].id, 199);
        }
    }

    #[test]
    fn top_k_zero_keeps_everything() {
        let mut candidates = Candidates::from_logits(&[1.0, 2.0, 3.0]);
        candidates.apply_top_k(0);
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn min_p_drops_unlikely_candidates() {
        let logits = logits_with_peaks(10, &[(4, 10.0), (7, 9.5)]);
        let mut candidates = Candidates::from_logits(&logits);
        candidates.apply_top_k(40);
        candidates.apply_min_p(0.05);
        let mut ids = candidates.ids();
        ids.sort();
        assert_eq!(ids, vec![4, 7]);
    }

    #[test]
    fn top_p_keeps_smallest_prefix() {
        // softmax(ln 6, ln 3, ln 1) = 0.6, 0.3, 0.1
        let logits = [6.0f32.ln(), 3.0f32.ln(), 0.0];
        let mut candidates = Candidates::from_logits(&logits);
        candidates.apply_top_p(0.85);
        assert_eq!(candidates.ids(), vec![0, 1]);

        let mut candidates = Candidates::from_logits(&logits);
        candidates.apply_top_p(0.5);
        assert_eq!(candidates.ids(), vec![0]);
    }

    #[test]
    fn filters_never_empty_the_set() {
        let logits = [0.5f32, 0.5, 0.5, 0.5];
        let params = SamplingParams {
            top_k: 1,
            min_p: 1.0,
            top_p: 0.0001,
            ..Default::default()
        };
        let chain = SamplingChain::new(params);
        let survivors = chain.filter(&logits);
        assert_eq!(survivors.ids(), vec![0]);
    }

    #[test]
    fn nan_and_infinite_logits_still_yield_a_token() {
        let mut chain = SamplingChain::new(SamplingParams::default());
        let token = chain.sample(&[f32::NAN, f32::NEG_INFINITY, f32::NAN]);
        assert!(token.is_some());

        let mut chain = SamplingChain::new(SamplingParams::default());
        assert_eq!(chain.sample(&[f32::NAN, 3.0, f32::NAN]), Some(1));
    }

    #[test]
    fn empty_logits_yield_nothing() {
        let mut chain = SamplingChain::new(SamplingParams::default());
        assert_eq!(chain.sample(&[]), None);
    }

    #[test]
    fn low_temperature_concentrates_on_top() {
        let logits = [1.0f32, 1.2, 0.9];
        let params = SamplingParams {
            top_k: 0,
            min_p: 0.0,
            top_p: 1.0,
            temperature: 0.01,
            ..Default::default()
        };
        let mut chain = SamplingChain::new(params);
        for _ in 0..10 {
            assert_eq!(chain.sample(&logits), Some(1));
        }
    }

    #[test]
    fn accept_extends_history() {
        let mut chain = SamplingChain::with_history(SamplingParams::default(), &[1, 2]);
        chain.accept(9);
        assert_eq!(chain.history(), &[1, 2, 9]);
    }
}
