//! Per-partition profiling for reconfiguration observability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Accumulates invocation counts and total latency for one pull path.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    total_micros: AtomicU64,
    invocations: AtomicU64,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed duration.
    pub fn observe(&self, elapsed: Duration) {
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of recorded observations.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Mean latency in milliseconds, 0.0 when nothing was recorded.
    pub fn average_ms(&self) -> f64 {
        let count = self.invocations();
        if count == 0 {
            return 0.0;
        }
        self.total_micros.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }
}

/// Profiling counters for one partition's reconfiguration activity.
#[derive(Debug, Default)]
pub struct ReconfigurationProfiler {
    /// Demand pulls issued by this partition, dispatch to final chunk.
    pub on_demand_pull: LatencyTracker,
    /// Queued async pulls issued by this partition.
    pub async_pull: LatencyTracker,
    /// Time async pull responses spent queued at the destination.
    pub async_dest_queue: LatencyTracker,
    /// Source-side: accepting a pull request and queueing the extraction.
    pub src_pull_init: LatencyTracker,
    /// Source-side: pull request arrival to response dispatch.
    pub src_pull_proc: LatencyTracker,
}

impl ReconfigurationProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summary lines for the event log, one per tracked path.
    pub fn report(&self, partition_id: u32, detailed: bool) -> Vec<String> {
        let mut lines = vec![
            format!(
                "REPORT_AVG_DEMAND_PULL_TIME, MS={:.3}, Count={}, PartitionId={}",
                self.on_demand_pull.average_ms(),
                self.on_demand_pull.invocations(),
                partition_id
            ),
            format!(
                "REPORT_AVG_ASYNC_PULL_TIME, MS={:.3}, Count={}, PartitionId={}",
                self.async_pull.average_ms(),
                self.async_pull.invocations(),
                partition_id
            ),
            format!(
                "REPORT_AVG_ASYNC_DEST_QUEUE_TIME, MS={:.3}, Count={}, PartitionId={}",
                self.async_dest_queue.average_ms(),
                self.async_dest_queue.invocations(),
                partition_id
            ),
        ];
        if detailed {
            lines.push(format!(
                "REPORT_AVG_SRC_DATA_PULL_INIT, MS={:.3}, Count={}, PartitionId={}",
                self.src_pull_init.average_ms(),
                self.src_pull_init.invocations(),
                partition_id
            ));
            lines.push(format!(
                "REPORT_AVG_SRC_DATA_PULL_PROC, MS={:.3}, Count={}, PartitionId={}",
                self.src_pull_proc.average_ms(),
                self.src_pull_proc.invocations(),
                partition_id
            ));
        }
        lines
    }
}
