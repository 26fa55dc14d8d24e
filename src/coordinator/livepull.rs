//! Live-pull transfer: destination partitions pull ranges on demand
//! while both sides keep processing transactions.
//!
//! A pull travels source-ward as a `LivePullRequest` (or an
//! `AsyncPullRequest` when the caller does not need to block); the
//! source executor emits chunks on an in-process channel and a forwarder
//! task routes each chunk to the destination site. The destination
//! applies the chunk, releases the caller's semaphore on the final one,
//! and acknowledges every chunk so the source can discard the
//! transferred rows and schedule the next extraction.

use crate::config::{AsyncDispatchMode, ReconfigProtocol};
use crate::error::Result;
use crate::executor::PartitionState;
use crate::network::messages::{
    AsyncPullRequest, AsyncPullResponse, ControlType, LivePullRequest, LivePullResponse,
    ReconfigurationControl,
};
use crate::plan::{ReconfigurationPlan, ReconfigurationRange};
use crate::types::{PartitionId, PullId, RowBatch};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};

use super::ReconfigurationCoordinator;

impl ReconfigurationCoordinator {
    /// Session-winner entry point for the live-pull protocol. Partitions
    /// move to `Prepare` and keep serving transactions; data moves only
    /// when pulled.
    pub(super) async fn start_live_pull(
        &self,
        plan: &Arc<ReconfigurationPlan>,
        calling_partition: PartitionId,
    ) -> Result<()> {
        tracing::info!(calling_partition, "starting live-pull reconfiguration");
        for executor in &self.executors {
            executor
                .init_reconfiguration(
                    Arc::clone(plan),
                    ReconfigProtocol::LivePull,
                    PartitionState::Prepare,
                    Arc::clone(&self.partitions),
                )
                .await?;
            self.partition_states
                .insert(executor.partition_id(), PartitionState::Prepare);
        }
        *self.site_state.write() = PartitionState::Prepare;
        self.notify_reconfig_leader(PartitionState::Prepare);
        Ok(())
    }

    /// Leader-readiness note. Remote readiness is not signaled
    /// explicitly; the completion barrier is the authoritative signal.
    fn notify_reconfig_leader(&self, state: PartitionState) {
        let Some(leader) = *self.leader.read() else {
            return;
        };
        if leader == self.local_site_id {
            tracing::info!(%state, "local site is the reconfiguration leader");
        } else {
            tracing::debug!(leader, %state, "site ready, leader learns via completion barrier");
        }
    }

    /// Pull a set of ranges and block the caller until every range has
    /// been fully received.
    ///
    /// The caller passes a semaphore with zero available permits, one
    /// pre-acquired slot per range. Each range's final chunk releases one
    /// permit at the destination; this call returns once all of them are
    /// back, leaving the semaphore fully released.
    pub async fn pull_ranges(
        self: &Arc<Self>,
        pull_id: PullId,
        txn_id: Option<u64>,
        calling_partition: PartitionId,
        ranges: &[ReconfigurationRange],
        semaphore: Arc<Semaphore>,
    ) -> Result<()> {
        let permits = ranges.len() as u32;
        if permits == 0 {
            return Ok(());
        }
        let started = Instant::now();
        self.blocked_pulls.insert(pull_id, Arc::clone(&semaphore));
        tracing::info!(
            pull_id,
            txn_id,
            calling_partition,
            ranges = ranges.len(),
            "pulling ranges, caller blocks until data arrives"
        );
        for range in ranges {
            self.pull_tuples(pull_id, txn_id, range).await;
        }
        match semaphore.acquire_many(permits).await {
            Ok(_all_released) => {}
            Err(_) => {
                tracing::warn!(pull_id, "semaphore closed while waiting for pulled data");
            }
        }
        self.blocked_pulls.remove(&pull_id);
        if let Some(profiler) = self.profiler(calling_partition) {
            profiler.on_demand_pull.observe(started.elapsed());
        }
        tracing::info!(pull_id, "all pulled ranges received");
        Ok(())
    }

    /// Pull a set of ranges without blocking the caller. Arrival is
    /// observed through the executor's `receive_tuples` calls.
    pub async fn pull_ranges_nonblocking(
        self: &Arc<Self>,
        pull_id: PullId,
        txn_id: Option<u64>,
        calling_partition: PartitionId,
        ranges: &[ReconfigurationRange],
    ) {
        tracing::info!(
            pull_id,
            txn_id,
            calling_partition,
            ranges = ranges.len(),
            "pulling ranges without blocking"
        );
        for range in ranges {
            self.pull_tuples(pull_id, txn_id, range).await;
        }
    }

    /// Schedule pulls for a set of ranges out-of-band: the source queues
    /// the extraction work instead of running it inline.
    pub async fn async_pull_ranges(
        self: &Arc<Self>,
        pull_id: PullId,
        txn_id: Option<u64>,
        calling_partition: PartitionId,
        ranges: &[ReconfigurationRange],
    ) {
        tracing::info!(
            pull_id,
            txn_id,
            calling_partition,
            ranges = ranges.len(),
            mode = ?self.config.async_dispatch,
            "scheduling queued pulls"
        );
        for range in ranges {
            let Some(src_site) = self.partitions.site_for(range.old_partition) else {
                tracing::error!(
                    old_partition = range.old_partition,
                    "no site hosts source partition"
                );
                continue;
            };
            self.pull_issue_times.insert(pull_id, Instant::now());
            let req = AsyncPullRequest::for_range(pull_id, self.local_site_id, txn_id, range);
            if src_site == self.local_site_id {
                self.handle_async_pull_request(req).await;
            } else if let Some(channel) = self.channels.get(src_site) {
                if let Err(e) = channel.async_pull(req).await {
                    tracing::warn!(src_site, pull_id, error = %e, "queued pull dropped");
                }
            }
        }
    }

    /// Issue one demand pull to the site owning the source partition.
    pub(super) async fn pull_tuples(
        self: &Arc<Self>,
        pull_id: PullId,
        txn_id: Option<u64>,
        range: &ReconfigurationRange,
    ) {
        tracing::info!(pull_id, %range, "issuing live pull");
        let Some(src_site) = self.partitions.site_for(range.old_partition) else {
            tracing::error!(
                old_partition = range.old_partition,
                "no site hosts source partition"
            );
            return;
        };
        let req = LivePullRequest::for_range(pull_id, self.local_site_id, txn_id, range);
        if src_site == self.local_site_id {
            self.handle_live_pull_request(req).await;
        } else if let Some(channel) = self.channels.get(src_site) {
            if let Err(e) = channel.live_pull(req).await {
                tracing::warn!(src_site, pull_id, error = %e, "live pull dropped");
            }
        }
    }

    /// Source-side handler for a demand pull: queue extraction at the
    /// owning executor and spawn a forwarder that routes each emitted
    /// chunk toward the requesting site.
    pub async fn handle_live_pull_request(self: &Arc<Self>, req: LivePullRequest) {
        tracing::info!(
            pull_id = req.pull_id,
            sender_site = req.sender_site,
            old_partition = req.old_partition,
            new_partition = req.new_partition,
            table = %req.table,
            "received live pull request"
        );
        let started = Instant::now();
        if self.config.detailed_profiling {
            self.pull_issue_times.insert(req.pull_id, started);
        }
        let Some(executor) = self.executor_for(req.old_partition) else {
            tracing::warn!(
                old_partition = req.old_partition,
                "live pull addressed to a partition this site does not host"
            );
            return;
        };
        let old_partition = req.old_partition;
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = executor.queue_live_pull(req, tx).await {
            tracing::error!(old_partition, error = %e, "executor rejected live pull");
            return;
        }
        if self.config.detailed_profiling {
            if let Some(profiler) = self.profiler(old_partition) {
                profiler.src_pull_init.observe(started.elapsed());
            }
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                this.route_live_pull_response(resp).await;
            }
        });
    }

    /// Route one emitted chunk to the destination site, short-circuiting
    /// the transport when the destination is local. The chunk is stamped
    /// with this site's id so the receipt acknowledgment finds its way
    /// back here.
    async fn route_live_pull_response(&self, mut resp: LivePullResponse) {
        resp.sender_site = self.local_site_id;
        self.notify_pull_response(resp.pull_id, resp.old_partition);
        if !resp.more_data_needed {
            self.pull_issue_times.remove(&resp.pull_id);
        }
        let Some(dest_site) = self.partitions.site_for(resp.new_partition) else {
            tracing::error!(
                new_partition = resp.new_partition,
                "no site hosts destination partition"
            );
            return;
        };
        if dest_site == self.local_site_id {
            if let Err(e) = self.receive_live_pull_tuples(resp).await {
                tracing::error!(error = %e, "failed to apply pulled tuples locally");
            }
        } else if let Some(channel) = self.channels.get(dest_site) {
            if let Err(e) = channel.live_pull_response(resp).await {
                tracing::warn!(dest_site, error = %e, "pull chunk dropped");
            }
        }
    }

    /// Destination-side handler for one pull chunk: apply it, release the
    /// blocked caller on the final chunk, acknowledge receipt.
    pub async fn receive_live_pull_tuples(&self, resp: LivePullResponse) -> Result<()> {
        tracing::info!(
            pull_id = resp.pull_id,
            txn_id = resp.txn_id,
            new_partition = resp.new_partition,
            table = %resp.table,
            more_data_needed = resp.more_data_needed,
            "received pulled tuples"
        );
        let batch = RowBatch::from_bytes(&resp.batch)?;
        let Some(executor) = self.executor_for(resp.new_partition) else {
            tracing::warn!(
                new_partition = resp.new_partition,
                "pulled tuples addressed to a partition this site does not host"
            );
            return Ok(());
        };
        executor
            .receive_tuples(
                resp.txn_id,
                resp.old_partition,
                resp.new_partition,
                &resp.table,
                resp.min_inclusive,
                resp.max_exclusive,
                batch,
                resp.more_data_needed,
                false,
            )
            .await?;

        if let Some(semaphore) = self.blocked_pulls.get(&resp.pull_id) {
            if resp.more_data_needed {
                tracing::info!(
                    pull_id = resp.pull_id,
                    "keeping caller blocked, more data needed for range"
                );
            } else {
                tracing::info!(pull_id = resp.pull_id, "releasing blocked pull");
                semaphore.add_permits(1);
            }
        }

        let ack = ReconfigurationControl {
            src_partition: resp.old_partition,
            dest_partition: resp.new_partition,
            control: ControlType::PullReceived,
            message_id: resp.pull_id,
            sender_site: self.local_site_id,
            receiver_site: resp.sender_site,
        };
        self.send_acknowledgement(ack).await;
        Ok(())
    }

    /// Deliver a receipt acknowledgment to the chunk's source site.
    async fn send_acknowledgement(&self, ack: ReconfigurationControl) {
        if ack.receiver_site == self.local_site_id {
            self.handle_pull_received(ack).await;
        } else {
            let site = ack.receiver_site;
            self.send_control(site, ack).await;
        }
    }

    /// Source-side handler for a receipt acknowledgment: the transferred
    /// rows can be discarded and the next extraction scheduled.
    pub(super) async fn handle_pull_received(&self, ctrl: ReconfigurationControl) {
        tracing::info!(
            pull_id = ctrl.message_id,
            src_partition = ctrl.src_partition,
            "pull acknowledged, discarding transferred rows"
        );
        let Some(executor) = self.executor_for(ctrl.src_partition) else {
            tracing::warn!(
                src_partition = ctrl.src_partition,
                "acknowledgment addressed to a partition this site does not host"
            );
            return;
        };
        if let Err(e) = executor.purge_extracted(ctrl.message_id).await {
            tracing::error!(pull_id = ctrl.message_id, error = %e, "purge failed");
        }
        if let Err(e) = executor.queue_next_extraction().await {
            tracing::error!(error = %e, "failed to schedule next extraction");
        }
    }

    /// Source-side handler for a queued pull. In `Sync` dispatch the
    /// extraction is queued immediately; `Queued` behaves the same at
    /// this layer, ordering is up to the executor's work queue.
    pub async fn handle_async_pull_request(self: &Arc<Self>, req: AsyncPullRequest) {
        tracing::info!(
            pull_id = req.async_pull_id,
            sender_site = req.sender_site,
            old_partition = req.old_partition,
            table = %req.table,
            "received queued pull request"
        );
        let Some(executor) = self.executor_for(req.old_partition) else {
            tracing::warn!(
                old_partition = req.old_partition,
                "queued pull addressed to a partition this site does not host"
            );
            return;
        };
        let old_partition = req.old_partition;
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = executor.queue_async_pull(req, tx).await {
            tracing::error!(old_partition, error = %e, "executor rejected queued pull");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(resp) = rx.recv().await {
                this.route_async_pull_response(resp).await;
            }
        });
    }

    /// Route one queued-pull chunk to the destination site.
    async fn route_async_pull_response(&self, mut resp: AsyncPullResponse) {
        resp.sender_site = self.local_site_id;
        let Some(dest_site) = self.partitions.site_for(resp.new_partition) else {
            tracing::error!(
                new_partition = resp.new_partition,
                "no site hosts destination partition"
            );
            return;
        };
        if dest_site == self.local_site_id {
            self.handle_async_pull_response(resp).await;
        } else if let Some(channel) = self.channels.get(dest_site) {
            if let Err(e) = channel.async_pull_response(resp).await {
                tracing::warn!(dest_site, error = %e, "queued pull chunk dropped");
            }
        }
    }

    /// Destination-side handler for a queued-pull chunk: hand it to the
    /// executor's work queue, release any waiting pull token, acknowledge
    /// receipt once the executor accepted the chunk.
    pub async fn handle_async_pull_response(&self, resp: AsyncPullResponse) {
        tracing::info!(
            pull_id = resp.async_pull_id,
            new_partition = resp.new_partition,
            table = %resp.table,
            more_data_needed = resp.more_data_needed,
            "scheduling queued pull response"
        );
        let Some(executor) = self.executor_for(resp.new_partition) else {
            tracing::warn!(
                new_partition = resp.new_partition,
                "queued pull chunk addressed to a partition this site does not host"
            );
            return;
        };
        if let Some((_, issued)) = self.pull_issue_times.remove(&resp.async_pull_id) {
            if let Some(profiler) = self.profiler(resp.new_partition) {
                profiler.async_pull.observe(issued.elapsed());
            }
        }
        if !resp.more_data_needed {
            self.unblock_pull_semaphore(resp.async_pull_id);
        }

        let ack = ReconfigurationControl {
            src_partition: resp.old_partition,
            dest_partition: resp.new_partition,
            control: ControlType::PullReceived,
            message_id: resp.async_pull_id,
            sender_site: self.local_site_id,
            receiver_site: resp.sender_site,
        };
        let queued = Instant::now();
        if let Err(e) = executor.queue_async_pull_response(resp).await {
            tracing::error!(error = %e, "executor rejected queued pull chunk");
            return;
        }
        if let Some(profiler) = self.profiler(ack.dest_partition) {
            profiler.async_dest_queue.observe(queued.elapsed());
        }
        self.send_acknowledgement(ack).await;
    }

    /// Release one permit for a pull a caller may be blocked on.
    fn unblock_pull_semaphore(&self, pull_id: PullId) {
        if let Some(semaphore) = self.blocked_pulls.get(&pull_id) {
            tracing::info!(pull_id, "releasing blocked pull");
            semaphore.add_permits(1);
        }
    }

    /// True when queued pulls should bypass the executor's ordered work
    /// queue and dispatch immediately.
    pub fn async_dispatch_is_sync(&self) -> bool {
        self.config.async_dispatch == AsyncDispatchMode::Sync
    }
}
