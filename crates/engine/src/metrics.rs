//! Usage accountant: process-wide counters and per-metric aggregates.
//!
//! Every aggregate keeps count, sum, min and max; the average is derived on
//! read. Everything is atomic; min/max may lag under contention but converge.

use kronk_api::Usage;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// The process metrics. Obtained through [`metrics`].
pub struct Metrics {
    requests: AtomicI64,
    errors: AtomicI64,
    panics: AtomicI64,
    model_file_load: AvgMetric,
    proj_file_load: AvgMetric,
    prompt_creation: AvgMetric,
    prefill_non_media: AvgMetric,
    prefill_media: AvgMetric,
    time_to_first_token: AvgMetric,
    chat_completions: UsageMetrics,
}

/// A single aggregate: count/sum/min/max with a derived average.
pub struct AvgMetric {
    count: AtomicI64,
    sum: AtomicI64,
    min: AtomicI64,
    max: AtomicI64,
}

struct UsageMetrics {
    prompt_tokens: AvgMetric,
    reasoning_tokens: AvgMetric,
    completion_tokens: AvgMetric,
    output_tokens: AvgMetric,
    total_tokens: AvgMetric,
    tokens_per_second: AvgMetric,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AvgSnapshot {
    pub count: i64,
    pub sum: i64,
    pub min: i64,
    pub max: i64,
    pub avg: i64,
}

/// The process-wide accountant.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

impl AvgMetric {
    fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            sum: AtomicI64::new(0),
            min: AtomicI64::new(i64::MAX),
            max: AtomicI64::new(i64::MIN),
        }
    }

    pub fn add(&self, value: i64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AvgSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        let (min, max, avg) = if count == 0 {
            (0, 0, 0)
        } else {
            (
                self.min.load(Ordering::Relaxed),
                self.max.load(Ordering::Relaxed),
                sum / count,
            )
        };

        AvgSnapshot {
            count,
            sum,
            min,
            max,
            avg,
        }
    }
}

impl UsageMetrics {
    fn new() -> Self {
        Self {
            prompt_tokens: AvgMetric::new(),
            reasoning_tokens: AvgMetric::new(),
            completion_tokens: AvgMetric::new(),
            output_tokens: AvgMetric::new(),
            total_tokens: AvgMetric::new(),
            tokens_per_second: AvgMetric::new(),
        }
    }
}

impl Metrics {
    fn new() -> Self {
        Self {
            requests: AtomicI64::new(0),
            errors: AtomicI64::new(0),
            panics: AtomicI64::new(0),
            model_file_load: AvgMetric::new(),
            proj_file_load: AvgMetric::new(),
            prompt_creation: AvgMetric::new(),
            prefill_non_media: AvgMetric::new(),
            prefill_media: AvgMetric::new(),
            time_to_first_token: AvgMetric::new(),
            chat_completions: UsageMetrics::new(),
        }
    }

    pub fn add_request(&self) -> i64 {
        self.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_error(&self) -> i64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_panic(&self) -> i64 {
        self.panics.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_model_file_load_time(&self, duration: Duration) {
        self.model_file_load.add(duration.as_millis() as i64);
    }

    pub fn add_proj_file_load_time(&self, duration: Duration) {
        self.proj_file_load.add(duration.as_millis() as i64);
    }

    pub fn add_prompt_creation_time(&self, duration: Duration) {
        self.prompt_creation.add(duration.as_millis() as i64);
    }

    pub fn add_prefill_non_media_time(&self, duration: Duration) {
        self.prefill_non_media.add(duration.as_millis() as i64);
    }

    pub fn add_prefill_media_time(&self, duration: Duration) {
        self.prefill_media.add(duration.as_millis() as i64);
    }

    pub fn add_time_to_first_token(&self, duration: Duration) {
        self.time_to_first_token.add(duration.as_millis() as i64);
    }

    pub fn add_chat_completions_usage(&self, usage: &Usage) {
        let u = &self.chat_completions;
        u.prompt_tokens.add(usage.input_tokens as i64);
        u.reasoning_tokens.add(usage.reasoning_tokens as i64);
        u.completion_tokens.add(usage.completion_tokens as i64);
        u.output_tokens.add(usage.output_tokens as i64);
        u.total_tokens
            .add((usage.input_tokens + usage.output_tokens) as i64);
        u.tokens_per_second.add(usage.tokens_per_second as i64);
    }

    /// JSON snapshot of every counter and aggregate.
    pub fn snapshot(&self) -> serde_json::Value {
        let u = &self.chat_completions;

        serde_json::json!({
            "service_requests": self.requests.load(Ordering::Relaxed),
            "service_errors": self.errors.load(Ordering::Relaxed),
            "service_panics": self.panics.load(Ordering::Relaxed),
            "file_modelLoadTime": self.model_file_load.snapshot(),
            "file_projLoadTime": self.proj_file_load.snapshot(),
            "prompt_creationTime": self.prompt_creation.snapshot(),
            "prefill_nonMediaTime": self.prefill_non_media.snapshot(),
            "prefill_mediaTime": self.prefill_media.snapshot(),
            "process_ttft": self.time_to_first_token.snapshot(),
            "usage_chatCompletions": {
                "tokens_prompt": u.prompt_tokens.snapshot(),
                "tokens_reasoning": u.reasoning_tokens.snapshot(),
                "tokens_completion": u.completion_tokens.snapshot(),
                "tokens_output": u.output_tokens.snapshot(),
                "tokens_total": u.total_tokens.snapshot(),
                "tokens_perSecond": u.tokens_per_second.snapshot(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_metric_tracks_count_sum_min_max() {
        let m = AvgMetric::new();
        m.add(10);
        m.add(30);
        m.add(20);

        let s = m.snapshot();
        assert_eq!(s.count, 3);
        assert_eq!(s.sum, 60);
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 30);
        assert_eq!(s.avg, 20);
    }

    #[test]
    fn empty_metric_snapshots_to_zero() {
        let s = AvgMetric::new().snapshot();
        assert_eq!(s.count, 0);
        assert_eq!(s.min, 0);
        assert_eq!(s.max, 0);
        assert_eq!(s.avg, 0);
    }

    #[test]
    fn usage_rolls_into_totals() {
        let m = Metrics::new();
        m.add_chat_completions_usage(&Usage {
            input_tokens: 10,
            reasoning_tokens: 4,
            completion_tokens: 6,
            output_tokens: 10,
            tokens_per_second: 25.0,
        });

        let snap = m.snapshot();
        let total = &snap["usage_chatCompletions"]["tokens_total"];
        assert_eq!(total["sum"], 20);
        assert_eq!(total["count"], 1);
    }
}
