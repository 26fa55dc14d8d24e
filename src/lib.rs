//! Online repartitioning coordinator for a partitioned OLTP engine.
//!
//! This crate implements the control plane that moves key ranges between
//! partitions while the system keeps running:
//! - **Stop-and-copy**: pause migrating partitions and eagerly push every
//!   outgoing range to its destination
//! - **Live pull**: keep serving transactions and let destination
//!   partitions pull ranges on demand, blocking, non-blocking, or queued
//!   out-of-band
//! - **Completion barrier**: a two-level barrier (partitions report to
//!   their site, sites report to the session leader) ends the migration
//!   everywhere exactly once
//!
//! One [`ReconfigurationCoordinator`] runs per site. The storage engine
//! plugs in through two traits: [`PartitionExecutor`] for row extraction
//! and application, and [`SiteChannel`] for cross-site RPC. Plans come
//! from a [`PlanResolver`]; the coordinator never computes key ownership
//! itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use repart::{
//!     ChannelTable, NullEventLog, PartitionMap, ReconfigConfig, ReconfigProtocol,
//!     ReconfigurationCoordinator,
//! };
//! use std::sync::Arc;
//!
//! # fn executors() -> Vec<Arc<dyn repart::PartitionExecutor>> { Vec::new() }
//! # fn resolver() -> Arc<dyn repart::PlanResolver> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReconfigConfig::new(ReconfigProtocol::LivePull);
//!     let partitions = Arc::new(PartitionMap::new([(0, 0), (1, 1)]));
//!     let coordinator = Arc::new(ReconfigurationCoordinator::new(
//!         config,
//!         0,
//!         2,
//!         executors(),
//!         partitions,
//!         ChannelTable::new(),
//!         resolver(),
//!         Arc::new(NullEventLog),
//!     ));
//!
//!     // Any local partition may kick off the session; concurrent calls
//!     // are raced and the losers get the winner's plan.
//!     let plan = coordinator
//!         .init_reconfiguration(0, "LIVEPULL", "plan-v2", 0)
//!         .await?;
//!     println!("migrating: {:?}", plan.map(|p| p.ranges.len()));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod executor;
pub mod network;
pub mod plan;
pub mod profiling;
pub mod testing;
pub mod types;

pub use config::{AsyncDispatchMode, ReconfigConfig, ReconfigProtocol, StopCopyMode};
pub use coordinator::ReconfigurationCoordinator;
pub use error::{Error, Result};
pub use events::{EventLog, MemoryEventLog, NullEventLog};
pub use executor::{
    AsyncPullResponder, PartitionExecutor, PartitionMap, PartitionState, PullResponder,
};
pub use network::{
    AsyncPullRequest, AsyncPullResponse, ChannelTable, ControlType, DataTransferRequest,
    DataTransferResponse, LivePullRequest, LivePullResponse, ReconfigurationControl,
    ReconfigurationRequest, ReconfigurationResponse, SiteChannel,
};
pub use plan::{PlanResolver, ReconfigurationPlan, ReconfigurationRange};
pub use profiling::{LatencyTracker, ReconfigurationProfiler};
pub use types::{PartitionId, PullId, Row, RowBatch, SiteId};
