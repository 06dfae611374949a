//! Backend-agnostic decoding: greedy, beam search and nucleus sampling
//!
//! A [`LogitsSource`] turns a token sequence into next-token logits; the
//! functions here own everything else (logit processors, candidate
//! selection, stopping). Backends only have to run a forward pass.

use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    SeedableRng,
};
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
    generation::{DecodingStrategy, ParameterBag},
    CoreError, Result,
};

/// Produces next-token logits for a full token sequence.
///
/// Implementations may cache work for sequences that extend the previous
/// call, but must return correct logits for any sequence.
///
/// Beam search keeps one slot per live hypothesis. After each step it calls
/// [`LogitsSource::reorder_slots`] with the parent slot of every surviving
/// beam, so a backend that keeps per-slot state (a KV cache) can fork it
/// instead of recomputing the whole sequence.
pub trait LogitsSource {
    fn next_logits(&mut self, tokens: &[u32]) -> Result<Vec<f32>>;

    /// Logits for the hypothesis held in `slot`
    fn next_logits_for(&mut self, _slot: usize, tokens: &[u32]) -> Result<Vec<f32>> {
        self.next_logits(tokens)
    }

    /// New slot `i` continues from old slot `parents[i]`
    fn reorder_slots(&mut self, _parents: &[usize]) {}

    /// Longest sequence the source accepts, prompt included
    fn max_sequence_len(&self) -> Option<usize> {
        None
    }
}

/// Decode up to `bag.max_new_tokens` tokens after `prompt`.
///
/// Returns only the newly generated tokens, without the eos token.
pub fn decode(
    source: &mut dyn LogitsSource,
    prompt: &[u32],
    bag: &ParameterBag,
    cancel: &CancellationToken,
) -> Result<Vec<u32>> {
    if prompt.is_empty() {
        return Err(CoreError::generation(
            "EMPTY_PROMPT_TOKENS",
            "Prompt encoded to zero tokens",
            "Decoding",
            "Provide a prompt the tokenizer can encode",
        ));
    }

    match bag.strategy {
        DecodingStrategy::BeamSearch { num_beams } if num_beams > 1 => {
            beam_search(source, prompt, bag, num_beams, cancel)
        }
        DecodingStrategy::BeamSearch { .. } => {
            step_decode(source, prompt, bag, cancel, |logits| Ok(argmax(logits)))
        }
        DecodingStrategy::Sampling {
            temperature,
            top_p,
            seed,
        } => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            step_decode(source, prompt, bag, cancel, |logits| {
                sample_top_p(logits, temperature, top_p, &mut rng)
            })
        }
    }
}

fn step_decode<F>(
    source: &mut dyn LogitsSource,
    prompt: &[u32],
    bag: &ParameterBag,
    cancel: &CancellationToken,
    mut pick: F,
) -> Result<Vec<u32>>
where
    F: FnMut(&[f32]) -> Result<u32>,
{
    let mut tokens = prompt.to_vec();

    for step in 0..bag.max_new_tokens {
        check_cancelled(cancel)?;
        if context_full(source, tokens.len(), step) {
            break;
        }

        let mut logits = source.next_logits(&tokens)?;
        process_logits(&mut logits, &tokens, bag);
        let next = pick(&logits)?;
        trace!(step, next, "decoded token");

        if next == bag.eos_token_id {
            break;
        }
        tokens.push(next);
    }

    Ok(tokens.split_off(prompt.len()))
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
    generated: usize,
}

impl Hypothesis {
    fn normalized_score(&self) -> f32 {
        self.score / self.generated.max(1) as f32
    }
}

fn by_normalized_score(a: &Hypothesis, b: &Hypothesis) -> Ordering {
    b.normalized_score()
        .partial_cmp(&a.normalized_score())
        .unwrap_or(Ordering::Equal)
}

fn beam_search(
    source: &mut dyn LogitsSource,
    prompt: &[u32],
    bag: &ParameterBag,
    num_beams: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u32>> {
    let mut live = vec![Hypothesis {
        tokens: prompt.to_vec(),
        score: 0.0,
        generated: 0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    for step in 0..bag.max_new_tokens {
        check_cancelled(cancel)?;
        // every live hypothesis has the same length
        if context_full(source, prompt.len() + step, step) {
            break;
        }

        // (parent slot, token, accumulated score)
        let mut candidates: Vec<(usize, u32, f32)> = Vec::with_capacity(live.len() * num_beams * 2);
        for (slot, hyp) in live.iter().enumerate() {
            let mut logits = source.next_logits_for(slot, &hyp.tokens)?;
            process_logits(&mut logits, &hyp.tokens, bag);
            let log_probs = log_softmax(&logits);

            let mut ranked: Vec<(usize, f32)> = log_probs
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, lp)| lp.is_finite())
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

            candidates.extend(
                ranked
                    .into_iter()
                    .take(num_beams * 2)
                    .map(|(token, lp)| (slot, token as u32, hyp.score + lp)),
            );
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut next = Vec::with_capacity(num_beams);
        let mut parents = Vec::with_capacity(num_beams);
        for (rank, (slot, token, score)) in candidates.into_iter().take(num_beams * 2).enumerate() {
            let parent = &live[slot];
            if token == bag.eos_token_id {
                // eos only completes a hypothesis when it ranks within the beam
                if rank < num_beams {
                    finished.push(Hypothesis {
                        tokens: parent.tokens.clone(),
                        score,
                        generated: parent.generated + 1,
                    });
                }
                continue;
            }

            let mut tokens = parent.tokens.clone();
            tokens.push(token);
            next.push(Hypothesis {
                tokens,
                score,
                generated: parent.generated + 1,
            });
            parents.push(slot);
            if next.len() == num_beams {
                break;
            }
        }

        finished.sort_by(by_normalized_score);
        finished.truncate(num_beams);
        source.reorder_slots(&parents);
        live = next;

        if live.is_empty() {
            break;
        }
        if finished.len() >= num_beams {
            let worst_finished = finished[finished.len() - 1].normalized_score();
            let best_live = live
                .iter()
                .map(Hypothesis::normalized_score)
                .fold(f32::NEG_INFINITY, f32::max);
            if worst_finished >= best_live {
                break;
            }
        }
    }

    finished.extend(live);
    finished.sort_by(by_normalized_score);
    let best = finished.into_iter().next().ok_or_else(|| {
        CoreError::generation(
            "BEAM_SEARCH_EMPTY",
            "Beam search produced no hypotheses",
            "Beam search decoding",
            "Check that the model produces finite logits",
        )
    })?;

    Ok(best.tokens[prompt.len()..].to_vec())
}

fn context_full(source: &dyn LogitsSource, len: usize, step: usize) -> bool {
    match source.max_sequence_len() {
        Some(limit) if len >= limit => {
            warn!(limit, generated = step, "Context window full, returning partial output");
            true
        }
        _ => false,
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::generation(
            "GENERATION_CANCELLED",
            "Generation cancelled",
            "Decoding loop",
            "Submit the prompt again to restart generation",
        ));
    }
    Ok(())
}

/// Apply the repetition penalty and no-repeat-n-gram ban in place
pub fn process_logits(logits: &mut [f32], tokens: &[u32], bag: &ParameterBag) {
    apply_repetition_penalty(logits, tokens, bag.repetition_penalty);
    for banned in banned_ngram_tokens(tokens, bag.no_repeat_ngram_size) {
        if let Some(logit) = logits.get_mut(banned as usize) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Penalize every token already present in `tokens`.
///
/// Negative logits are multiplied by the penalty and positive ones divided,
/// so a penalty above 1.0 always makes the token less likely.
pub fn apply_repetition_penalty(logits: &mut [f32], tokens: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }

    let mut seen = tokens.to_vec();
    seen.sort_unstable();
    seen.dedup();

    for token in seen {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit < 0.0 {
                *logit *= penalty;
            } else {
                *logit /= penalty;
            }
        }
    }
}

/// Tokens that would complete an n-gram already present in `tokens`
pub fn banned_ngram_tokens(tokens: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || tokens.len() + 1 < ngram_size {
        return Vec::new();
    }

    let prefix_len = ngram_size - 1;
    let prefix = &tokens[tokens.len() - prefix_len..];

    let mut banned: Vec<u32> = tokens
        .windows(ngram_size)
        .filter(|window| &window[..prefix_len] == prefix)
        .map(|window| window[prefix_len])
        .collect();
    banned.sort_unstable();
    banned.dedup();
    banned
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx as u32)
        .unwrap_or(0)
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let log_sum = logits.iter().map(|l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|l| l - log_sum).collect()
}

fn sample_top_p(logits: &[f32], temperature: f32, top_p: f32, rng: &mut StdRng) -> Result<u32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(CoreError::generation(
            "SAMPLING_FAILED",
            "Every candidate token was masked",
            "Nucleus sampling",
            "Lower no_repeat_ngram_size or repetition_penalty",
        ));
    }

    let mut probs: Vec<(usize, f32)> = logits
        .iter()
        .map(|l| ((l - max) / temperature).exp())
        .enumerate()
        .filter(|(_, p)| *p > 0.0)
        .collect();
    let total: f32 = probs.iter().map(|(_, p)| p).sum();
    probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    // keep the smallest prefix whose mass reaches top_p
    let mut cumulative = 0.0;
    let mut keep = probs.len();
    for (i, (_, p)) in probs.iter().enumerate() {
        cumulative += p / total;
        if cumulative >= top_p {
            keep = i + 1;
            break;
        }
    }
    probs.truncate(keep.max(1));

    let dist = WeightedIndex::new(probs.iter().map(|(_, p)| *p)).map_err(|err| {
        CoreError::generation(
            "SAMPLING_FAILED",
            format!("Could not build sampling distribution: {}", err),
            "Nucleus sampling",
            "Check temperature and top_p values",
        )
    })?;
    Ok(probs[dist.sample(rng)].0 as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationParams;

    /// Scores the token after `last` as `last + 1` (mod vocab), eos at the end.
    struct CountingSource {
        vocab: usize,
        calls: usize,
    }

    impl LogitsSource for CountingSource {
        fn next_logits(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
            self.calls += 1;
            let last = *tokens.last().unwrap() as usize;
            let mut logits = vec![0.0; self.vocab];
            logits[(last + 1) % self.vocab] = 10.0;
            Ok(logits)
        }
    }

    /// Keeps a history per beam slot and counts the positions it would run
    /// through a model whose cache is reused only for extending sequences.
    struct SlotSource {
        vocab: usize,
        slots: Vec<Vec<u32>>,
        positions: usize,
        limit: Option<usize>,
    }

    impl SlotSource {
        fn new(vocab: usize) -> Self {
            Self {
                vocab,
                slots: Vec::new(),
                positions: 0,
                limit: None,
            }
        }
    }

    impl LogitsSource for SlotSource {
        fn next_logits(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
            self.next_logits_for(0, tokens)
        }

        fn next_logits_for(&mut self, slot: usize, tokens: &[u32]) -> Result<Vec<f32>> {
            if let Some(limit) = self.limit {
                assert!(tokens.len() <= limit, "sequence past the context window");
            }
            if self.slots.len() <= slot {
                self.slots.resize(slot + 1, Vec::new());
            }
            let history = &mut self.slots[slot];
            let reused = if tokens.starts_with(history) { history.len() } else { 0 };
            self.positions += tokens.len() - reused;
            *history = tokens.to_vec();

            // spread mass over a few tokens so beams diverge
            let last = *tokens.last().unwrap() as usize;
            let mut logits = vec![0.0; self.vocab];
            for (offset, logit) in [(1, 10.0), (2, 9.5), (3, 9.0)] {
                logits[(last + offset) % self.vocab] = logit;
            }
            Ok(logits)
        }

        fn reorder_slots(&mut self, parents: &[usize]) {
            self.slots = parents.iter().map(|&parent| self.slots[parent].clone()).collect();
        }

        fn max_sequence_len(&self) -> Option<usize> {
            self.limit
        }
    }

    /// Fixed distribution regardless of history.
    struct FixedSource(Vec<f32>);

    impl LogitsSource for FixedSource {
        fn next_logits(&mut self, _tokens: &[u32]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn greedy_bag(max_new_tokens: usize, eos: u32) -> ParameterBag {
        GenerationParams {
            max_new_tokens,
            num_beams: 1,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            ..Default::default()
        }
        .assemble(Some(eos))
    }

    #[test]
    fn test_greedy_stops_at_eos() {
        let mut source = CountingSource { vocab: 6, calls: 0 };
        let out = decode(&mut source, &[1], &greedy_bag(10, 5), &CancellationToken::new()).unwrap();
        assert_eq!(out, vec![2, 3, 4]);
        assert_eq!(source.calls, 4);
    }

    #[test]
    fn test_greedy_respects_max_new_tokens() {
        let mut source = CountingSource { vocab: 100, calls: 0 };
        let out = decode(&mut source, &[1], &greedy_bag(3, 99), &CancellationToken::new()).unwrap();
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[test]
    fn test_beam_search_finds_sequence() {
        let mut source = CountingSource { vocab: 6, calls: 0 };
        let mut bag = greedy_bag(10, 5);
        bag.strategy = DecodingStrategy::BeamSearch { num_beams: 3 };
        let out = decode(&mut source, &[1], &bag, &CancellationToken::new()).unwrap();
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[test]
    fn test_beam_search_reuses_parent_state() {
        let prompt: Vec<u32> = (0..100).map(|i| i % 50).collect();
        let mut source = SlotSource::new(1000);
        let mut bag = greedy_bag(64, 999);
        bag.strategy = DecodingStrategy::BeamSearch { num_beams: 4 };

        let out = decode(&mut source, &prompt, &bag, &CancellationToken::new()).unwrap();
        assert_eq!(out.len(), 64);
        // the prompt once, then one position per beam per step
        assert!(source.positions <= prompt.len() + 4 * 64, "{} positions", source.positions);
    }

    #[test]
    fn test_greedy_stops_at_context_window() {
        let mut source = SlotSource::new(1000);
        source.limit = Some(8);
        let out = decode(&mut source, &[1, 2, 3], &greedy_bag(20, 999), &CancellationToken::new()).unwrap();
        assert_eq!(out, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_beam_search_stops_at_context_window() {
        let mut source = SlotSource::new(1000);
        source.limit = Some(6);
        let mut bag = greedy_bag(20, 999);
        bag.strategy = DecodingStrategy::BeamSearch { num_beams: 2 };
        let out = decode(&mut source, &[1, 2], &bag, &CancellationToken::new()).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_sampling_is_reproducible_with_seed() {
        let params = GenerationParams {
            do_sample: true,
            seed: Some(11),
            max_new_tokens: 8,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            ..Default::default()
        };
        let bag = params.assemble(Some(99));
        let logits = vec![1.0, 1.2, 0.8, 1.1];

        let a = decode(&mut FixedSource(logits.clone()), &[0], &bag, &CancellationToken::new()).unwrap();
        let b = decode(&mut FixedSource(logits), &[0], &bag, &CancellationToken::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_sampling_top_p_keeps_dominant_token() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let token = sample_top_p(&[0.0, 20.0, 0.0], 1.0, 0.5, &mut rng).unwrap();
            assert_eq!(token, 1);
        }
    }

    #[test]
    fn test_cancelled_generation_fails() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = CountingSource { vocab: 6, calls: 0 };
        let err = decode(&mut source, &[1], &greedy_bag(10, 5), &cancel).unwrap_err();
        assert_eq!(err.code(), "GENERATION_CANCELLED");
        assert_eq!(source.calls, 0);
    }

    #[test]
    fn test_repetition_penalty() {
        let mut logits = vec![2.0, -2.0, 2.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 2.0]);
    }

    #[test]
    fn test_banned_ngram_tokens() {
        // "a b c a b" with trigram ban: next "c" would repeat "a b c"
        let tokens = [1, 2, 3, 1, 2];
        assert_eq!(banned_ngram_tokens(&tokens, 3), vec![3]);
        assert!(banned_ngram_tokens(&tokens, 0).is_empty());
        assert!(banned_ngram_tokens(&[1], 3).is_empty());
        // unigram ban forbids every seen token
        assert_eq!(banned_ngram_tokens(&[4, 2, 4], 1), vec![2, 4]);
    }

    #[test]
    fn test_empty_prompt_tokens_rejected() {
        let mut source = CountingSource { vocab: 6, calls: 0 };
        assert!(decode(&mut source, &[], &greedy_bag(3, 5), &CancellationToken::new()).is_err());
    }
}
