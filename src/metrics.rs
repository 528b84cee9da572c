use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the rate limiter
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    checks: CounterVec,
    fail_open: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,

    // Maintenance metrics
    resets: IntCounter,
    swept_keys: IntCounter,

    check_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "ratelimit_checks_total",
                "Rate limit checks by route and outcome",
            ),
            &["route", "outcome"],
        )?;

        let fail_open = CounterVec::new(
            Opts::new(
                "ratelimit_fail_open_total",
                "Checks admitted because the store was unavailable",
            ),
            &["route"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "ratelimit_store_operations_total",
                "Store operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of store operations in seconds",
            ),
            &["operation"],
        )?;

        let resets = IntCounter::new("ratelimit_resets_total", "Windows reset by an operator")?;

        let swept_keys = IntCounter::new(
            "ratelimit_swept_keys_total",
            "Stale window keys removed by the sweeper",
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_check_duration_seconds",
            "Duration of rate limit checks in seconds",
        ))?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(resets.clone()))?;
        registry.register(Box::new(swept_keys.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            checks,
            fail_open,
            store_operations,
            store_operation_duration,
            resets,
            swept_keys,
            check_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self, route: &str) {
        self.checks.with_label_values(&[route, "admitted"]).inc();
    }

    pub fn record_rejected(&self, route: &str) {
        self.checks.with_label_values(&[route, "rejected"]).inc();
    }

    pub fn record_fail_open(&self, route: &str) {
        self.checks.with_label_values(&[route, "fail_open"]).inc();
        self.fail_open.with_label_values(&[route]).inc();
    }

    /// Record a store operation and how long it took
    pub fn record_store_operation(&self, operation: &str, success: bool, duration_seconds: f64) {
        let result = if success { "success" } else { "error" };
        self.store_operations
            .with_label_values(&[operation, result])
            .inc();
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    pub fn record_reset(&self) {
        self.resets.inc();
    }

    pub fn record_swept_keys(&self, count: usize) {
        self.swept_keys.inc_by(count as u64);
    }

    /// Create a timer for measuring check duration
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
