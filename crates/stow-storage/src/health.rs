//! Storage health probe

use std::time::{Duration, Instant};

use anyhow::Result;
use opendal::Operator;

/// Outcome of one reachability probe.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub latency: Duration,
    /// Failure description, `None` when storage answered
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Verify the storage endpoint is reachable by listing the bucket root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}

/// Time a [`check_health`] call without failing.
pub async fn probe(op: &Operator) -> HealthReport {
    let started = Instant::now();
    let result = check_health(op).await;
    let report = HealthReport {
        latency: started.elapsed(),
        error: result.err().map(|e| format!("{e:#}")),
    };
    tracing::debug!(latency_ms = report.latency.as_millis() as u64, ok = report.is_ok(), "storage probe");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::build_memory_operator;

    #[tokio::test]
    async fn test_memory_operator_is_healthy() {
        let op = build_memory_operator().unwrap();
        check_health(&op).await.unwrap();
        let report = probe(&op).await;
        assert!(report.is_ok(), "{:?}", report.error);
    }
}
