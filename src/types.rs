//! Core types used throughout the repartitioning coordinator.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Site identifier: one process hosting one or more partitions.
pub type SiteId = u32;

/// Partition identifier: one shard of the keyspace.
pub type PartitionId = u32;

/// Token correlating a pull request with its (possibly multi-chunk)
/// response stream. Unique per coordinator lifetime.
pub type PullId = u64;

/// A single row moved during migration. The payload is opaque to the
/// coordinator; only the key participates in range bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: i64,
    pub payload: Vec<u8>,
}

impl Row {
    pub fn new(key: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// One bounded-size batch of rows for a single table.
///
/// Batches are transferred between sites by value: the sender encodes,
/// the receiver decodes, and no in-flight data is shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBatch {
    /// Table the rows belong to.
    pub table: String,
    /// The rows themselves.
    pub rows: Vec<Row>,
}

impl RowBatch {
    /// Create a new batch.
    pub fn new(table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            table: table.into(),
            rows,
        }
    }

    /// Create an empty batch for a table.
    pub fn empty(table: impl Into<String>) -> Self {
        Self::new(table, Vec::new())
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Approximate wire size in bytes.
    pub fn size(&self) -> usize {
        self.rows
            .iter()
            .map(|r| 8 + r.payload.len())
            .sum::<usize>()
            + self.table.len()
    }

    /// Encode the batch for transfer over a site channel.
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a batch received over a site channel.
    pub fn from_bytes(data: &[u8]) -> crate::error::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Current wall-clock time in unix milliseconds, used for message
/// timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
