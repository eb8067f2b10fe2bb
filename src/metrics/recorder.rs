//! Metrics recorder for fabric and upload operations.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "fabric_transfers_completed_total",
        "Transfers that reached COMPLETED"
    );
    describe_counter!(
        "fabric_transfers_failed_total",
        "Transfers that reached FAILED"
    );
    describe_counter!(
        "fabric_chunks_completed_total",
        "Chunks committed to disk across the fabric"
    );
    describe_counter!(
        "fabric_uploads_finalized_total",
        "Upload sessions finalized into manifests"
    );
    describe_counter!(
        "fabric_healing_actions_total",
        "Manifests touched by healing sweeps"
    );

    describe_gauge!(
        "fabric_upload_sessions_active",
        "Upload sessions currently open"
    );

    describe_histogram!(
        "fabric_ingest_latency_ms",
        "Time from session creation to finalize, in milliseconds"
    );
}

pub fn record_transfer_completed() {
    counter!("fabric_transfers_completed_total").increment(1);
}

pub fn record_transfer_failed() {
    counter!("fabric_transfers_failed_total").increment(1);
}

pub fn record_chunk_completed() {
    counter!("fabric_chunks_completed_total").increment(1);
}

pub fn record_upload_finalized(org_id: &str) {
    counter!("fabric_uploads_finalized_total", "org_id" => org_id.to_string()).increment(1);
}

pub fn record_ingest_latency_ms(org_id: &str, latency_ms: f64) {
    histogram!("fabric_ingest_latency_ms", "org_id" => org_id.to_string()).record(latency_ms);
}

pub fn record_active_sessions(count: usize) {
    gauge!("fabric_upload_sessions_active").set(count as f64);
}

pub fn record_healing_actions(count: usize) {
    counter!("fabric_healing_actions_total").increment(count as u64);
}
