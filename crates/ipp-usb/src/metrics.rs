//! Lightweight in-process counters for in-flight requests and connection
//! state, purely for diagnostic log lines and the status endpoint.
//!
//! Nothing here participates in correctness: every field is best-effort
//! and read with `Relaxed` ordering, and no invariant depends on their
//! consistency across fields.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DeviceMetrics {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    init_retries: AtomicU64,
}

impl DeviceMetrics {
    pub fn request_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn init_retry(&self) {
        self.init_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line snapshot for a log message or the `/status` handler.
    pub fn summary(&self) -> String {
        format!(
            "requests={}/{} failed={} sent={}B recv={}B retries={}",
            self.requests_completed.load(Ordering::Relaxed),
            self.requests_started.load(Ordering::Relaxed),
            self.requests_failed.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.init_retries.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reflects_recorded_counts() {
        let m = DeviceMetrics::default();
        m.request_started();
        m.request_started();
        m.request_completed();
        m.request_failed();
        m.add_bytes_sent(100);
        m.add_bytes_received(200);

        let summary = m.summary();
        assert!(summary.contains("requests=1/2"));
        assert!(summary.contains("failed=1"));
        assert!(summary.contains("sent=100B"));
        assert!(summary.contains("recv=200B"));
    }
}
