//! Observability setup: structured logging and Prometheus metrics.
//!
//! Without an installed recorder every `record_*` call is a no-op, so the
//! library crates call them unconditionally.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
///
/// `RUST_LOG` wins over `default_filter`. Returns false when a global
/// subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Count one finished transfer. `outcome` is "committed", "aborted",
/// "rejected" or "crashed".
pub fn record_transfer(outcome: &str) {
    metrics::counter!("shardbank_transfers_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record the prepare and decide phase latencies of a transfer.
pub fn record_transfer_latency(prepare_us: u64, decide_us: u64) {
    metrics::histogram!("shardbank_transfer_duration_us", "phase" => "prepare").record(prepare_us as f64);
    metrics::histogram!("shardbank_transfer_duration_us", "phase" => "decide").record(decide_us as f64);
}

/// Record one reconciliation pass.
pub fn record_sweep(committed: usize, rolled_back: usize, halted_shards: usize, duration_us: u64) {
    metrics::counter!("shardbank_sweep_runs_total").increment(1);
    metrics::counter!("shardbank_sweep_committed_total").increment(committed as u64);
    metrics::counter!("shardbank_sweep_rolled_back_total").increment(rolled_back as u64);
    metrics::gauge!("shardbank_sweep_halted_shards").set(halted_shards as f64);
    metrics::histogram!("shardbank_sweep_duration_us").record(duration_us as f64);
}

/// Count one sweeper retry against `shard`.
pub fn record_sweep_retry(shard: u64) {
    metrics::counter!("shardbank_sweep_retries_total", "shard" => shard.to_string()).increment(1);
}

/// Current number of committed intent log entries.
pub fn record_intent_log_size(entries: usize) {
    metrics::gauge!("shardbank_intent_log_entries").set(entries as f64);
}
