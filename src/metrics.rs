//! Metrics instrumentation for cluster-dns.
//!
//! All metrics are prefixed with `cluster_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    counter!("cluster_dns.query.count", "type" => record_type.to_string(), "result" => result.as_str())
        .increment(1);
    histogram!("cluster_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// Query returned records successfully.
    Success,
    /// Name exists but has no records of the queried type.
    NoData,
    /// Name not found.
    NxDomain,
    /// Name not found while the index was still syncing.
    NotReady,
    /// Name matched a static deny rule.
    Blocked,
    /// Name is inside a zone but matches no supported shape.
    Malformed,
    /// Name is outside every configured zone.
    OutOfZone,
    /// Request was rejected before resolution.
    Error,
}

impl QueryResult {
    /// Label value for this result.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryResult::Success => "success",
            QueryResult::NoData => "nodata",
            QueryResult::NxDomain => "nxdomain",
            QueryResult::NotReady => "not_ready",
            QueryResult::Blocked => "blocked",
            QueryResult::Malformed => "malformed",
            QueryResult::OutOfZone => "out_of_zone",
            QueryResult::Error => "error",
        }
    }
}

/// Record a watch event.
pub fn record_watch_event(kind: &str, event_type: WatchEventType) {
    let event_str = match event_type {
        WatchEventType::Apply => "apply",
        WatchEventType::Delete => "delete",
        WatchEventType::Init => "init",
        WatchEventType::InitApply => "init_apply",
        WatchEventType::InitDone => "init_done",
        WatchEventType::Invalid => "invalid",
        WatchEventType::Error => "error",
    };

    counter!("cluster_dns.watch.event.count", "kind" => kind.to_string(), "event" => event_str)
        .increment(1);
}

/// Watch event types.
#[derive(Debug, Clone, Copy)]
pub enum WatchEventType {
    /// Object added or modified.
    Apply,
    /// Object deleted.
    Delete,
    /// A (re)list started.
    Init,
    /// Object listed during a (re)list.
    InitApply,
    /// A (re)list finished; the listed set replaces the previous one.
    InitDone,
    /// Object could not be converted and was skipped.
    Invalid,
    /// Watch stream error (the watcher retries with backoff).
    Error,
}

/// Record state counts (call periodically or on change).
pub fn record_state_counts(services: usize, endpoints: usize, pods: usize) {
    gauge!("cluster_dns.state.services.count").set(services as f64);
    gauge!("cluster_dns.state.endpoints.count").set(endpoints as f64);
    gauge!("cluster_dns.state.pods.count").set(pods as f64);
}

/// Record the number of ready pods.
pub fn record_ready_pods(ready: usize) {
    gauge!("cluster_dns.state.pods.ready").set(ready as f64);
}

/// Record readiness state per watched kind.
pub fn record_ready_state(services_ready: bool, endpoints_ready: bool, pods_ready: bool) {
    gauge!("cluster_dns.state.services_ready").set(if services_ready { 1.0 } else { 0.0 });
    gauge!("cluster_dns.state.endpoints_ready").set(if endpoints_ready { 1.0 } else { 0.0 });
    gauge!("cluster_dns.state.pods_ready").set(if pods_ready { 1.0 } else { 0.0 });
}

/// Record the index generation.
pub fn record_generation(generation: u64) {
    gauge!("cluster_dns.state.generation").set(generation as f64);
}

/// Record answers returned for a successful lookup.
pub fn record_answers_returned(count: usize) {
    histogram!("cluster_dns.query.answers_returned").record(count as f64);
}

/// Record a response that had to be truncated.
pub fn record_truncated(record_type: &str) {
    counter!("cluster_dns.response.truncated.count", "type" => record_type.to_string())
        .increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
