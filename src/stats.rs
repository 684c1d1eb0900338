//! Internal counters.
//!
//! The monitoring and decision loops never tear down on unexpected errors;
//! they absorb them, log, and bump a counter here so operators can spot a
//! sick daemon from the health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

#[derive(Debug, Default)]
pub struct Stats {
    unexpected_errors: AtomicU64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unexpected_error(&self, location: &str, err: &anyhow::Error) {
        self.unexpected_errors.fetch_add(1, Ordering::Relaxed);
        error!(location, "unexpected error: {err:#}");
    }

    #[must_use]
    pub fn unexpected_errors(&self) -> u64 {
        self.unexpected_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_error_counter() {
        let stats = Stats::new();
        assert_eq!(stats.unexpected_errors(), 0);

        stats.unexpected_error("test", &anyhow::anyhow!("boom"));
        stats.unexpected_error("test", &anyhow::anyhow!("boom again"));
        assert_eq!(stats.unexpected_errors(), 2);
    }
}
