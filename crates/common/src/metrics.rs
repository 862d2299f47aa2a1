//! Config request counters

use crate::store::NodeCounter;
use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Snapshot served to status consumers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub requests_failed: u64,
    pub requests_successful: u64,
    pub nodes_configured: u64,
}

#[derive(Debug, Default)]
struct Counters {
    failed: u64,
    successful: u64,
}

/// Success/failure counters for config requests, safe to share across tasks
#[derive(Debug, Default)]
pub struct RequestMetrics {
    counters: Mutex<Counters>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_successful(&self) {
        self.counters.lock().successful += 1;
    }

    pub fn request_failed(&self) {
        self.counters.lock().failed += 1;
    }

    /// `(successful, failed)` without touching the store
    pub fn totals(&self) -> (u64, u64) {
        let counters = self.counters.lock();
        (counters.successful, counters.failed)
    }

    /// Counters plus the current node count from `counter`
    pub async fn report(&self, counter: &dyn NodeCounter) -> Result<MetricsReport> {
        let nodes_configured = counter.node_count().await?;
        let (requests_successful, requests_failed) = self.totals();
        Ok(MetricsReport {
            requests_failed,
            requests_successful,
            nodes_configured,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FixedCount(u64);

    #[async_trait::async_trait]
    impl NodeCounter for FixedCount {
        async fn node_count(&self) -> Result<u64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_report_serializes_camel_case() {
        let metrics = RequestMetrics::new();
        metrics.request_successful();
        metrics.request_successful();
        metrics.request_failed();

        let report = metrics.report(&FixedCount(42)).await.unwrap();
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            serde_json::json!({
                "requestsFailed": 1,
                "requestsSuccessful": 2,
                "nodesConfigured": 42,
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(RequestMetrics::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        metrics.request_successful();
                        metrics.request_failed();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(metrics.totals(), (800, 800));
    }
}
