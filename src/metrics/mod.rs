//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Histogram, Opts, Registry,
};
use std::time::Duration;

/// Metrics collector, owning its registry
pub struct Metrics {
    registry: Registry,

    // Exchange metrics
    pub exchanges: CounterVec,
    pub errors: CounterVec,
    pub tokens: CounterVec,

    // Context metrics
    pub evicted_messages: Counter,
    pub prompt_estimate: Histogram,

    // Limiter metrics
    pub limiter_wait: Histogram,
    pub limiter_retries: Counter,
    pub reconciled_tokens: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let exchanges = register_counter_vec_with_registry!(
            Opts::new("governor_exchanges_total", "Exchanges by operation and outcome"),
            &["operation", "outcome"],
            registry
        )?;

        let errors = register_counter_vec_with_registry!(
            Opts::new("governor_errors_total", "Failed exchanges by error kind"),
            &["kind"],
            registry
        )?;

        let tokens = register_counter_vec_with_registry!(
            Opts::new("governor_tokens_total", "Tokens reported by the remote API"),
            &["kind"],
            registry
        )?;

        let evicted_messages = register_counter_with_registry!(
            Opts::new("governor_evicted_messages_total", "Messages evicted to fit the context window"),
            registry
        )?;

        let prompt_estimate = register_histogram_with_registry!(
            "governor_prompt_estimate_tokens",
            "Estimated prompt tokens per completion request",
            vec![64.0, 256.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 32768.0],
            registry
        )?;

        let limiter_wait = register_histogram_with_registry!(
            "governor_limiter_wait_seconds",
            "Time spent waiting for admission",
            registry
        )?;

        let limiter_retries = register_counter_with_registry!(
            Opts::new("governor_limiter_retries_total", "Transient failures retried"),
            registry
        )?;

        let reconciled_tokens = register_counter_with_registry!(
            Opts::new("governor_reconciled_tokens_total", "Tokens charged after the fact above the estimate"),
            registry
        )?;

        Ok(Self {
            registry,
            exchanges,
            errors,
            tokens,
            evicted_messages,
            prompt_estimate,
            limiter_wait,
            limiter_retries,
            reconciled_tokens,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of an exchange
    pub fn record_exchange(&self, operation: &str, error_kind: Option<&str>) {
        let outcome = if error_kind.is_some() { "error" } else { "success" };
        self.exchanges.with_label_values(&[operation, outcome]).inc();
        if let Some(kind) = error_kind {
            self.errors.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_usage(&self, prompt_tokens: u64, completion_tokens: u64) {
        self.tokens.with_label_values(&["prompt"]).inc_by(prompt_tokens as f64);
        self.tokens
            .with_label_values(&["completion"])
            .inc_by(completion_tokens as f64);
    }

    pub fn record_trim(&self, evicted: usize, prompt_estimate: usize) {
        self.evicted_messages.inc_by(evicted as f64);
        self.prompt_estimate.observe(prompt_estimate as f64);
    }

    pub fn record_limiter_wait(&self, wait: Duration) {
        self.limiter_wait.observe(wait.as_secs_f64());
    }

    pub fn record_limiter_retry(&self) {
        self.limiter_retries.inc();
    }

    pub fn record_reconciliation(&self, excess_tokens: u64) {
        self.reconciled_tokens.inc_by(excess_tokens as f64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
