//! Reconfiguration plans and range descriptors.
//!
//! A plan is the immutable output of the external plan/hasher component
//! for one migration: an ordered list of range descriptors naming which
//! key intervals move between which partitions. The coordinator treats
//! plans as opaque schedules; it never computes key ownership itself.

use crate::error::{Error, Result};
use crate::types::PartitionId;
use serde::{Deserialize, Serialize};

/// One (table, key-interval) migration unit.
///
/// Keys in `[min_inclusive, max_exclusive)` of `table` move from
/// `old_partition` to `new_partition`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationRange {
    /// Partition currently owning the interval.
    pub old_partition: PartitionId,
    /// Partition that will own the interval.
    pub new_partition: PartitionId,
    /// Table the interval belongs to.
    pub table: String,
    /// Lower key bound, inclusive.
    pub min_inclusive: i64,
    /// Upper key bound, exclusive.
    pub max_exclusive: i64,
}

impl ReconfigurationRange {
    /// Create a range descriptor, enforcing the bound and partition
    /// invariants.
    pub fn new(
        old_partition: PartitionId,
        new_partition: PartitionId,
        table: impl Into<String>,
        min_inclusive: i64,
        max_exclusive: i64,
    ) -> Result<Self> {
        if min_inclusive > max_exclusive {
            return Err(Error::PlanResolution(format!(
                "range bounds out of order: [{}, {})",
                min_inclusive, max_exclusive
            )));
        }
        if old_partition == new_partition {
            return Err(Error::PlanResolution(format!(
                "range moves partition {} onto itself",
                old_partition
            )));
        }
        Ok(Self {
            old_partition,
            new_partition,
            table: table.into(),
            min_inclusive,
            max_exclusive,
        })
    }

    /// Whether a key falls inside this range.
    pub fn contains(&self, key: i64) -> bool {
        key >= self.min_inclusive && key < self.max_exclusive
    }
}

impl std::fmt::Display for ReconfigurationRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}, {}) {}->{}",
            self.table, self.min_inclusive, self.max_exclusive, self.old_partition, self.new_partition
        )
    }
}

/// Immutable output of the plan resolver for one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationPlan {
    /// The textual plan descriptor this plan was resolved from.
    pub descriptor: String,
    /// Ordered list of migration units.
    pub ranges: Vec<ReconfigurationRange>,
}

impl ReconfigurationPlan {
    /// Create a plan from resolved ranges.
    pub fn new(descriptor: impl Into<String>, ranges: Vec<ReconfigurationRange>) -> Self {
        Self {
            descriptor: descriptor.into(),
            ranges,
        }
    }

    /// Ranges leaving the given partition.
    pub fn outgoing_ranges(&self, partition: PartitionId) -> Vec<&ReconfigurationRange> {
        self.ranges
            .iter()
            .filter(|r| r.old_partition == partition)
            .collect()
    }

    /// Ranges arriving at the given partition.
    pub fn incoming_ranges(&self, partition: PartitionId) -> Vec<&ReconfigurationRange> {
        self.ranges
            .iter()
            .filter(|r| r.new_partition == partition)
            .collect()
    }

    /// Whether the plan carries any migration work at all.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// The external partition-plan hashing component.
///
/// Resolves a textual plan descriptor into a concrete plan. `None` means
/// the descriptor requires no data movement (for example, it matches the
/// currently applied plan).
pub trait PlanResolver: Send + Sync {
    fn resolve(&self, descriptor: &str) -> Result<Option<ReconfigurationPlan>>;
}
