//! Mutual Exclusion Metrics and Observability
//!
//! Atomic counters with Prometheus text export, optional `prometheus`
//! histograms, and the canonical tracing events for lock transitions.

use crate::request::{ProcessId, ResourceId, Timestamp};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-process metrics. Cloning shares the underlying counters.
#[derive(Debug, Clone)]
pub struct MutexMetrics {
    inner: Arc<MutexMetricsInner>,
}

#[derive(Debug)]
struct MutexMetricsInner {
    process_id: ProcessId,

    // Gauges
    clock: AtomicU64,
    held_resources: AtomicU64,

    // Counters
    acquisitions_total: AtomicU64,
    acquisitions_granted: AtomicU64,
    acquisitions_timed_out: AtomicU64,
    requests_received: AtomicU64,
    requests_deferred: AtomicU64,
    grants_sent: AtomicU64,
    releases_total: AtomicU64,
    withdrawals_total: AtomicU64,

    #[cfg(feature = "observability")]
    acquire_latency: Option<prometheus::Histogram>,
    #[cfg(feature = "observability")]
    rpc_latency: Option<prometheus::HistogramVec>,
}

impl MutexMetrics {
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            inner: Arc::new(MutexMetricsInner {
                process_id,
                clock: AtomicU64::new(0),
                held_resources: AtomicU64::new(0),
                acquisitions_total: AtomicU64::new(0),
                acquisitions_granted: AtomicU64::new(0),
                acquisitions_timed_out: AtomicU64::new(0),
                requests_received: AtomicU64::new(0),
                requests_deferred: AtomicU64::new(0),
                grants_sent: AtomicU64::new(0),
                releases_total: AtomicU64::new(0),
                withdrawals_total: AtomicU64::new(0),
                #[cfg(feature = "observability")]
                acquire_latency: observability::acquire_latency(),
                #[cfg(feature = "observability")]
                rpc_latency: observability::rpc_latency(),
            }),
        }
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.inner.process_id
    }

    // ========================================================================
    // GAUGES
    // ========================================================================

    pub fn set_clock(&self, timestamp: Timestamp) {
        self.inner.clock.fetch_max(timestamp, Ordering::Relaxed);
    }

    pub fn inc_held(&self) {
        self.inner.held_resources.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_held(&self) {
        // Saturating: a racing reset must not wrap the gauge.
        let _ = self
            .inner
            .held_resources
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    pub fn inc_acquisitions(&self) {
        self.inner.acquisitions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acquisitions_granted(&self) {
        self.inner.acquisitions_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acquisitions_timed_out(&self) {
        self.inner
            .acquisitions_timed_out
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_received(&self) {
        self.inner.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_deferred(&self) {
        self.inner.requests_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_grants_sent(&self) {
        self.inner.grants_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_releases(&self) {
        self.inner.releases_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_withdrawals(&self) {
        self.inner.withdrawals_total.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // OBSERVABILITY
    // ========================================================================

    /// Observes the time from `acquire` to entering the critical section.
    pub fn observe_acquire(&self, duration: Duration) {
        let _ = duration;
        #[cfg(feature = "observability")]
        if let Some(histogram) = &self.inner.acquire_latency {
            histogram.observe(duration.as_secs_f64());
        }
    }

    /// Observes an outbound RPC latency.
    pub fn observe_rpc(&self, method: &str, duration: Duration) {
        let _ = (method, duration);
        #[cfg(feature = "observability")]
        if let Some(histograms) = &self.inner.rpc_latency {
            histograms
                .with_label_values(&[method])
                .observe(duration.as_secs_f64());
        }
    }

    // ========================================================================
    // GETTERS
    // ========================================================================

    pub fn clock(&self) -> u64 {
        self.inner.clock.load(Ordering::Relaxed)
    }
    pub fn held_resources(&self) -> u64 {
        self.inner.held_resources.load(Ordering::Relaxed)
    }
    pub fn acquisitions_total(&self) -> u64 {
        self.inner.acquisitions_total.load(Ordering::Relaxed)
    }
    pub fn acquisitions_granted(&self) -> u64 {
        self.inner.acquisitions_granted.load(Ordering::Relaxed)
    }
    pub fn acquisitions_timed_out(&self) -> u64 {
        self.inner.acquisitions_timed_out.load(Ordering::Relaxed)
    }
    pub fn requests_received(&self) -> u64 {
        self.inner.requests_received.load(Ordering::Relaxed)
    }
    pub fn requests_deferred(&self) -> u64 {
        self.inner.requests_deferred.load(Ordering::Relaxed)
    }
    pub fn grants_sent(&self) -> u64 {
        self.inner.grants_sent.load(Ordering::Relaxed)
    }
    pub fn releases_total(&self) -> u64 {
        self.inner.releases_total.load(Ordering::Relaxed)
    }
    pub fn withdrawals_total(&self) -> u64 {
        self.inner.withdrawals_total.load(Ordering::Relaxed)
    }

    // ========================================================================
    // PROMETHEUS EXPORT
    // ========================================================================

    /// Exports metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let process_id = self.process_id().clone();
        let mut output = String::new();

        macro_rules! metric {
            ($kind:expr, $name:expr, $help:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{}{{process_id=\"{}\"}} {}\n",
                    $name, $help, $name, $kind, $name, process_id, $value
                ));
            };
        }

        metric!("gauge", "mutex_clock", "Current Lamport time", self.clock());
        metric!(
            "gauge",
            "mutex_held_resources",
            "Resources currently held",
            self.held_resources()
        );
        metric!(
            "counter",
            "mutex_acquisitions_total",
            "Acquisition attempts started",
            self.acquisitions_total()
        );
        metric!(
            "counter",
            "mutex_acquisitions_granted",
            "Acquisition attempts that entered the critical section",
            self.acquisitions_granted()
        );
        metric!(
            "counter",
            "mutex_acquisitions_timed_out",
            "Acquisition attempts that were abandoned",
            self.acquisitions_timed_out()
        );
        metric!(
            "counter",
            "mutex_requests_received",
            "Requests received from peers",
            self.requests_received()
        );
        metric!(
            "counter",
            "mutex_requests_deferred",
            "Requests from peers that were deferred",
            self.requests_deferred()
        );
        metric!(
            "counter",
            "mutex_grants_sent",
            "Grants sent to peers",
            self.grants_sent()
        );
        metric!(
            "counter",
            "mutex_releases_total",
            "Critical sections released",
            self.releases_total()
        );
        metric!(
            "counter",
            "mutex_withdrawals_total",
            "Abandoned requests withdrawn from peers",
            self.withdrawals_total()
        );

        output
    }
}

#[cfg(feature = "observability")]
mod observability {
    // A second engine in the same process fails to register the same names;
    // its collectors still work, they are just not exported globally.
    pub(super) fn acquire_latency() -> Option<prometheus::Histogram> {
        let opts = prometheus::HistogramOpts::new(
            "mutex_acquire_duration_seconds",
            "Time to enter the critical section in seconds",
        );
        let histogram = prometheus::Histogram::with_opts(opts).ok()?;
        let _ = prometheus::register(Box::new(histogram.clone()));
        Some(histogram)
    }

    pub(super) fn rpc_latency() -> Option<prometheus::HistogramVec> {
        let opts = prometheus::HistogramOpts::new(
            "mutex_rpc_latency_seconds",
            "Peer RPC latency in seconds",
        );
        let histograms = prometheus::HistogramVec::new(opts, &["method"]).ok()?;
        let _ = prometheus::register(Box::new(histograms.clone()));
        Some(histograms)
    }
}

// ============================================================================
// TRACING HELPERS
// ============================================================================

/// Records entry into a critical section.
pub fn trace_entered_critical_section(process_id: &ProcessId, resource: &ResourceId, timestamp: Timestamp) {
    tracing::info!(
        process_id = %process_id,
        resource = %resource,
        timestamp = timestamp,
        event = "entered_critical_section",
        "Entered critical section"
    );
}

/// Records a release.
pub fn trace_released(process_id: &ProcessId, resource: &ResourceId, timestamp: Timestamp, deferred: usize) {
    tracing::info!(
        process_id = %process_id,
        resource = %resource,
        timestamp = timestamp,
        deferred = deferred,
        event = "released",
        "Released critical section"
    );
}

/// Records an abandoned attempt.
pub fn trace_attempt_aborted(process_id: &ProcessId, resource: &ResourceId, request_timestamp: Timestamp, unanswered: usize) {
    tracing::info!(
        process_id = %process_id,
        resource = %resource,
        request_timestamp = request_timestamp,
        unanswered = unanswered,
        event = "attempt_aborted",
        "Abandoned acquisition attempt"
    );
}
