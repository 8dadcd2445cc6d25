//! Sync counters, recorded through the `metrics` facade.

/// Record a write that reached the gateway.
pub fn record_write_flushed() {
    metrics::counter!("sync_writes_flushed_total").increment(1);
}

/// Record the outbox depth after a change.
pub fn record_outbox_depth(depth: usize) {
    metrics::gauge!("sync_outbox_depth").set(depth as f64);
}

/// Record a write the gateway refused for good.
pub fn record_write_dropped() {
    metrics::counter!("sync_writes_dropped_total").increment(1);
}

/// Record a remote shape event and whether it changed confirmed state.
pub fn record_remote_event(applied: bool) {
    let outcome = if applied { "applied" } else { "superseded" };
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("sync_remote_events_total", &labels).increment(1);
}

/// Record a completed reconnect.
pub fn record_reconnect() {
    metrics::counter!("sync_reconnects_total").increment(1);
}
