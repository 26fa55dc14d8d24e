//! Typed RPC messages exchanged between site coordinators.
//!
//! Row batches travel as encoded bytes inside the message so a batch is
//! always transferred by value; decode failures surface as
//! `Error::Serialization` on the receiving side.

use crate::plan::ReconfigurationRange;
use crate::types::{PartitionId, PullId, SiteId};
use serde::{Deserialize, Serialize};

/// Stop-and-copy "prepare" handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationRequest {
    pub sender_site: SiteId,
    pub sent_at_ms: u64,
}

/// Acknowledgment that a destination site is ready for bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationResponse {
    pub sender_site: SiteId,
    pub sent_at_ms: u64,
}

/// Control message kinds for barrier signaling and pull acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    /// A site reports local migration completion to the leader.
    ReconfigurationDone,
    /// The leader broadcasts global completion to every site.
    ReconfigurationDoneReceived,
    /// A destination confirms receipt of a pull chunk so the source may
    /// discard the transferred rows.
    PullReceived,
}

impl std::fmt::Display for ControlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlType::ReconfigurationDone => write!(f, "RECONFIGURATION_DONE"),
            ControlType::ReconfigurationDoneReceived => write!(f, "RECONFIGURATION_DONE_RECEIVED"),
            ControlType::PullReceived => write!(f, "PULL_RECEIVED"),
        }
    }
}

/// Barrier and acknowledgment control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationControl {
    pub src_partition: PartitionId,
    pub dest_partition: PartitionId,
    pub control: ControlType,
    /// Pull id for `PullReceived`, 0 for barrier messages.
    pub message_id: PullId,
    pub sender_site: SiteId,
    pub receiver_site: SiteId,
}

/// Stop-and-copy bulk push of one chunk of a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransferRequest {
    pub sender_site: SiteId,
    pub old_partition: PartitionId,
    pub new_partition: PartitionId,
    pub table: String,
    pub min_inclusive: i64,
    pub max_exclusive: i64,
    /// Encoded `RowBatch`.
    pub batch: Vec<u8>,
    pub sent_at_ms: u64,
}

/// Receipt for a stop-and-copy push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransferResponse {
    pub sender_site: SiteId,
    pub old_partition: PartitionId,
    pub new_partition: PartitionId,
    pub table: String,
    pub min_inclusive: i64,
    pub max_exclusive: i64,
    pub sent_at_ms: u64,
}

/// Demand pull of one range, issued by the destination partition's site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePullRequest {
    pub pull_id: PullId,
    pub sender_site: SiteId,
    /// Transaction waiting on the pulled data, if any.
    pub txn_id: Option<u64>,
    pub old_partition: PartitionId,
    pub new_partition: PartitionId,
    pub table: String,
    pub min_inclusive: i64,
    pub max_exclusive: i64,
    pub sent_at_ms: u64,
}

impl LivePullRequest {
    /// Build a pull request for one range descriptor.
    pub fn for_range(
        pull_id: PullId,
        sender_site: SiteId,
        txn_id: Option<u64>,
        range: &ReconfigurationRange,
    ) -> Self {
        Self {
            pull_id,
            sender_site,
            txn_id,
            old_partition: range.old_partition,
            new_partition: range.new_partition,
            table: range.table.clone(),
            min_inclusive: range.min_inclusive,
            max_exclusive: range.max_exclusive,
            sent_at_ms: crate::types::unix_millis(),
        }
    }
}

/// One chunk of rows answering a live pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePullResponse {
    pub pull_id: PullId,
    pub sender_site: SiteId,
    pub txn_id: Option<u64>,
    pub old_partition: PartitionId,
    pub new_partition: PartitionId,
    pub table: String,
    pub min_inclusive: i64,
    pub max_exclusive: i64,
    /// Encoded `RowBatch`.
    pub batch: Vec<u8>,
    /// Further chunks remain for this pull id. Governs semaphore release
    /// at the destination; chunks for one pull id must be applied in the
    /// order the source emits them.
    pub more_data_needed: bool,
    pub sent_at_ms: u64,
}

/// Queued pull of one range, scheduled out-of-band at the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncPullRequest {
    pub async_pull_id: PullId,
    pub sender_site: SiteId,
    pub txn_id: Option<u64>,
    pub old_partition: PartitionId,
    pub new_partition: PartitionId,
    pub table: String,
    pub min_inclusive: i64,
    pub max_exclusive: i64,
    pub sent_at_ms: u64,
}

impl AsyncPullRequest {
    /// Build a queued pull request for one range descriptor.
    pub fn for_range(
        async_pull_id: PullId,
        sender_site: SiteId,
        txn_id: Option<u64>,
        range: &ReconfigurationRange,
    ) -> Self {
        Self {
            async_pull_id,
            sender_site,
            txn_id,
            old_partition: range.old_partition,
            new_partition: range.new_partition,
            table: range.table.clone(),
            min_inclusive: range.min_inclusive,
            max_exclusive: range.max_exclusive,
            sent_at_ms: crate::types::unix_millis(),
        }
    }
}

/// One chunk of rows answering a queued pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncPullResponse {
    pub async_pull_id: PullId,
    pub sender_site: SiteId,
    pub txn_id: Option<u64>,
    pub old_partition: PartitionId,
    pub new_partition: PartitionId,
    pub table: String,
    pub min_inclusive: i64,
    pub max_exclusive: i64,
    /// Encoded `RowBatch`.
    pub batch: Vec<u8>,
    pub more_data_needed: bool,
    pub sent_at_ms: u64,
}
