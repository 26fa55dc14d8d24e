//! Interfaces to the per-partition execution engine.
//!
//! The coordinator never touches stored rows directly; every extraction
//! and application goes through a `PartitionExecutor`. Executors are
//! addressed through an arena of handles keyed by partition id, so the
//! coordinator holds capabilities rather than mutable aliases into the
//! engine.

use crate::config::ReconfigProtocol;
use crate::error::Result;
use crate::network::messages::{AsyncPullRequest, AsyncPullResponse, LivePullRequest, LivePullResponse};
use crate::plan::{ReconfigurationPlan, ReconfigurationRange};
use crate::types::{PartitionId, PullId, RowBatch, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-partition migration state. Absence of an entry in the
/// coordinator's state map means the partition is not migrating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    Normal,
    Begin,
    Prepare,
    DataTransfer,
    BulkTransfer,
    End,
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionState::Normal => write!(f, "normal"),
            PartitionState::Begin => write!(f, "begin"),
            PartitionState::Prepare => write!(f, "prepare"),
            PartitionState::DataTransfer => write!(f, "data_transfer"),
            PartitionState::BulkTransfer => write!(f, "bulk_transfer"),
            PartitionState::End => write!(f, "end"),
        }
    }
}

/// Channel on which a source executor emits chunks for one live pull.
pub type PullResponder = mpsc::UnboundedSender<LivePullResponse>;

/// Channel on which a source executor emits chunks for one queued pull.
pub type AsyncPullResponder = mpsc::UnboundedSender<AsyncPullResponse>;

/// The sequential execution unit owning one partition's data.
#[async_trait::async_trait]
pub trait PartitionExecutor: Send + Sync {
    /// Partition this executor owns.
    fn partition_id(&self) -> PartitionId;

    /// Enter a migration session: remember the plan and move to the
    /// target state.
    async fn init_reconfiguration(
        &self,
        plan: Arc<ReconfigurationPlan>,
        protocol: ReconfigProtocol,
        target_state: PartitionState,
        partitions: Arc<PartitionMap>,
    ) -> Result<()>;

    /// Ranges this partition must push out under the current plan.
    async fn outgoing_ranges(&self) -> Result<Vec<ReconfigurationRange>>;

    /// Extract one bounded-size batch for a range. The bool is true when
    /// more data remains for the range.
    async fn extract_push_batch(&self, range: &ReconfigurationRange) -> Result<(RowBatch, bool)>;

    /// Apply a batch of migrated rows to this partition.
    #[allow(clippy::too_many_arguments)]
    async fn receive_tuples(
        &self,
        txn_id: Option<u64>,
        old_partition: PartitionId,
        new_partition: PartitionId,
        table: &str,
        min_inclusive: i64,
        max_exclusive: i64,
        batch: RowBatch,
        more_data_needed: bool,
        is_undo: bool,
    ) -> Result<()>;

    /// Queue a demand pull for extraction; chunks go out on `responder`.
    async fn queue_live_pull(&self, req: LivePullRequest, responder: PullResponder) -> Result<()>;

    /// Queue an out-of-band pull for extraction; chunks go out on
    /// `responder`.
    async fn queue_async_pull(
        &self,
        req: AsyncPullRequest,
        responder: AsyncPullResponder,
    ) -> Result<()>;

    /// Apply a queued-pull chunk delivered out-of-band.
    async fn queue_async_pull_response(&self, resp: AsyncPullResponse) -> Result<()>;

    /// The destination acknowledged receipt for this pull id; the rows
    /// already extracted for it may now be discarded.
    async fn purge_extracted(&self, pull_id: PullId) -> Result<()>;

    /// Schedule extraction of the next chunk after an acknowledgment.
    async fn queue_next_extraction(&self) -> Result<()>;

    /// Leave the migration session and resume normal processing.
    async fn end_reconfiguration(&self) -> Result<()>;
}

/// Catalog lookup from partition id to owning site.
///
/// Built once from the external catalog and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    sites: HashMap<PartitionId, SiteId>,
}

impl PartitionMap {
    pub fn new(entries: impl IntoIterator<Item = (PartitionId, SiteId)>) -> Self {
        Self {
            sites: entries.into_iter().collect(),
        }
    }

    /// Site hosting the given partition.
    pub fn site_for(&self, partition: PartitionId) -> Option<SiteId> {
        self.sites.get(&partition).copied()
    }

    /// All partitions hosted by the given site.
    pub fn partitions_of(&self, site: SiteId) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self
            .sites
            .iter()
            .filter(|(_, s)| **s == site)
            .map(|(p, _)| *p)
            .collect();
        partitions.sort_unstable();
        partitions
    }

    /// Total number of partitions in the catalog.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
