//! Sampler factory: translate request parameters into a native sampler chain.

use kronk_api::SamplingParams;
use llama_cpp_2::sampling::LlamaSampler;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TOP_K: i32 = 40;
pub const DEFAULT_REPEAT_PENALTY: f32 = 1.1;
pub const DEFAULT_REPEAT_LAST_N: i32 = 64;

/// Build the sampler chain for a request. Temperatures at or below zero
/// collapse the chain to greedy decoding.
pub fn build(params: &SamplingParams) -> LlamaSampler {
    let temperature = params.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    let seed = params.seed.unwrap_or_else(random_seed);

    if temperature <= 0.0 {
        return LlamaSampler::greedy();
    }

    let mut chain = vec![LlamaSampler::penalties(
        params.repeat_last_n.unwrap_or(DEFAULT_REPEAT_LAST_N),
        params.repeat_penalty.unwrap_or(DEFAULT_REPEAT_PENALTY),
        0.0,
        0.0,
    )];

    chain.push(LlamaSampler::top_k(params.top_k.unwrap_or(DEFAULT_TOP_K)));
    chain.push(LlamaSampler::top_p(
        params.top_p.unwrap_or(DEFAULT_TOP_P),
        1,
    ));

    if let Some(min_p) = params.min_p {
        chain.push(LlamaSampler::min_p(min_p, 1));
    }
    if let Some(typical_p) = params.typical_p {
        chain.push(LlamaSampler::typical(typical_p, 1));
    }

    chain.push(LlamaSampler::temp(temperature));
    chain.push(LlamaSampler::dist(seed));

    LlamaSampler::chain_simple(chain)
}

/// `max_tokens` defaults to whatever the context window leaves after the
/// prompt.
pub fn resolve_max_tokens(
    params: &SamplingParams,
    context_window: u32,
    input_tokens: usize,
) -> usize {
    let budget = (context_window as usize).saturating_sub(input_tokens);
    match params.max_tokens {
        Some(max) => max.min(budget),
        None => budget,
    }
}

fn random_seed() -> u32 {
    // Nanosecond clock noise is plenty for a per-call sampling seed.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
        | 1
}

/// Incremental matcher for request stop strings. Feed each emitted piece;
/// a match ends the stream with finish_reason "stop".
#[derive(Debug, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    window: String,
    keep: usize,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        let keep = stops.iter().map(|s| s.len()).max().unwrap_or(0) * 2;
        Self {
            stops: stops.to_vec(),
            window: String::new(),
            keep,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Returns true when the accumulated tail contains a stop string.
    pub fn push(&mut self, piece: &str) -> bool {
        if self.stops.is_empty() {
            return false;
        }

        self.window.push_str(piece);

        if self.stops.iter().any(|s| self.window.contains(s.as_str())) {
            return true;
        }

        // Bound the window; keep enough tail for a match spanning pieces.
        if self.window.len() > self.keep {
            let cut = self.window.len() - self.keep;
            let cut = (cut..self.window.len())
                .find(|i| self.window.is_char_boundary(*i))
                .unwrap_or(0);
            self.window.drain(..cut);
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tokens_defaults_to_remaining_window() {
        let params = SamplingParams::default();
        assert_eq!(resolve_max_tokens(&params, 4096, 96), 4000);

        let params = SamplingParams {
            max_tokens: Some(128),
            ..Default::default()
        };
        assert_eq!(resolve_max_tokens(&params, 4096, 96), 128);

        // Never exceeds the window.
        let params = SamplingParams {
            max_tokens: Some(10_000),
            ..Default::default()
        };
        assert_eq!(resolve_max_tokens(&params, 4096, 96), 4000);
    }

    #[test]
    fn stop_matcher_matches_across_pieces() {
        let mut m = StopMatcher::new(&["</s>".to_string()]);
        assert!(!m.push("hello "));
        assert!(!m.push("<"));
        assert!(!m.push("/s"));
        assert!(m.push(">"));
    }

    #[test]
    fn stop_matcher_without_stops_never_matches() {
        let mut m = StopMatcher::new(&[]);
        assert!(!m.push("anything at all"));
    }

    #[test]
    fn stop_matcher_window_stays_bounded() {
        let mut m = StopMatcher::new(&["stop".to_string()]);
        for _ in 0..1000 {
            assert!(!m.push("aaaaaaaa"));
        }
        assert!(m.window.len() <= 16);
        assert!(!m.push("st"));
        assert!(m.push("op"));
    }
}
