use anyhow::Context;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("listener_checks_total", "Poll cycles run, per source.");
        describe_counter!(
            "listener_items_found_total",
            "New items that passed the dedup filter, per source."
        );
        describe_counter!(
            "listener_errors_total",
            "Transient extraction failures, per source."
        );
        describe_counter!(
            "listener_auth_failures_total",
            "Session rejections seen while polling, per source."
        );
        describe_counter!("dispatch_tasks_total", "Tasks enqueued by assign.");
        describe_counter!("dispatch_replies_total", "Replies posted.");
        describe_counter!("dispatch_errors_total", "Failed task attempts.");
        describe_counter!(
            "dispatch_skipped_total",
            "Tasks declined by eligibility (own or too-new items)."
        );
        describe_counter!(
            "dispatch_failed_total",
            "Tasks dropped after exhausting retries."
        );
        describe_gauge!("dispatch_queue_len", "Tasks waiting in the dispatch queue.");
        describe_gauge!("system_health_score", "Last computed health score (0-100).");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Only one recorder per process.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }
}
