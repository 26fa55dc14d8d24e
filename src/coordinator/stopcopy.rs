//! Stop-and-copy transfer: source partitions eagerly push every outgoing
//! range to its destination while normal processing is paused.
//!
//! Two variants. Direct runs the whole push inside the session init call
//! and tears the session down when the last range lands. Coordinated
//! first runs a prepare handshake with every destination site and starts
//! the bulk push only once all of them acknowledged.

use crate::config::{ReconfigProtocol, StopCopyMode};
use crate::error::Result;
use crate::executor::PartitionState;
use crate::network::messages::{
    DataTransferRequest, DataTransferResponse, ReconfigurationRequest, ReconfigurationResponse,
};
use crate::plan::ReconfigurationPlan;
use crate::types::{unix_millis, PartitionId, RowBatch, SiteId};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::ReconfigurationCoordinator;

impl ReconfigurationCoordinator {
    /// Session-winner entry point for the stop-and-copy protocol.
    pub(super) async fn start_stop_copy(
        &self,
        plan: &Arc<ReconfigurationPlan>,
        calling_partition: PartitionId,
    ) -> Result<()> {
        tracing::info!(
            calling_partition,
            mode = ?self.config.stopcopy_mode,
            "starting stop-and-copy reconfiguration"
        );
        for executor in &self.executors {
            executor
                .init_reconfiguration(
                    Arc::clone(plan),
                    ReconfigProtocol::StopCopy,
                    PartitionState::Prepare,
                    Arc::clone(&self.partitions),
                )
                .await?;
            self.partition_states
                .insert(executor.partition_id(), PartitionState::Prepare);
        }

        match self.config.stopcopy_mode {
            StopCopyMode::Direct => {
                *self.site_state.write() = PartitionState::DataTransfer;
                self.push_all_outgoing().await?;
                self.end_reconfiguration().await;
                self.reset_session();
            }
            StopCopyMode::Coordinated => {
                *self.site_state.write() = PartitionState::Prepare;
                let destinations = self.find_destination_sites(plan);
                self.send_prepare(destinations).await;
            }
        }
        Ok(())
    }

    /// Push every outgoing range of every local partition, one chunk at a
    /// time, in range order.
    pub(super) async fn push_all_outgoing(&self) -> Result<()> {
        for executor in &self.executors {
            let partition_id = executor.partition_id();
            let ranges = executor.outgoing_ranges().await?;
            if ranges.is_empty() {
                tracing::info!(partition_id, "no outgoing ranges for partition");
                self.partition_states
                    .insert(partition_id, PartitionState::End);
                continue;
            }
            tracing::info!(
                partition_id,
                ranges = ranges.len(),
                "pushing outgoing ranges for partition"
            );
            self.partition_states
                .insert(partition_id, PartitionState::DataTransfer);
            for range in &ranges {
                let mut has_more = true;
                while has_more {
                    let (batch, more) = executor.extract_push_batch(range).await?;
                    self.push_tuples(
                        range.old_partition,
                        range.new_partition,
                        &range.table,
                        batch,
                        range.min_inclusive,
                        range.max_exclusive,
                    )
                    .await?;
                    has_more = more;
                }
            }
            self.partition_states
                .insert(partition_id, PartitionState::End);
        }
        Ok(())
    }

    /// Deliver one chunk to the destination partition, short-circuiting
    /// the transport when the destination is local.
    pub(super) async fn push_tuples(
        &self,
        old_partition: PartitionId,
        new_partition: PartitionId,
        table: &str,
        batch: RowBatch,
        min_inclusive: i64,
        max_exclusive: i64,
    ) -> Result<()> {
        tracing::info!(
            old_partition,
            new_partition,
            table,
            rows = batch.len(),
            "pushing tuples to new partition"
        );
        let Some(dest_site) = self.partitions.site_for(new_partition) else {
            tracing::error!(new_partition, "no site hosts destination partition");
            return Ok(());
        };

        if dest_site == self.local_site_id {
            let Some(executor) = self.executor_for(new_partition) else {
                tracing::error!(
                    new_partition,
                    "destination partition mapped to this site but has no executor"
                );
                return Ok(());
            };
            return executor
                .receive_tuples(
                    None,
                    old_partition,
                    new_partition,
                    table,
                    min_inclusive,
                    max_exclusive,
                    batch,
                    false,
                    false,
                )
                .await;
        }

        let req = DataTransferRequest {
            sender_site: self.local_site_id,
            old_partition,
            new_partition,
            table: table.to_string(),
            min_inclusive,
            max_exclusive,
            batch: batch.to_bytes()?,
            sent_at_ms: unix_millis(),
        };
        let Some(channel) = self.channels.get(dest_site) else {
            return Ok(());
        };
        match channel.data_transfer(req).await {
            Ok(resp) => {
                tracing::debug!(
                    dest_site = resp.sender_site,
                    new_partition,
                    "push acknowledged by destination"
                );
            }
            Err(e) => {
                tracing::warn!(dest_site, error = %e, "push dropped by destination site");
            }
        }
        Ok(())
    }

    /// Destination-side handler for a bulk push chunk.
    pub async fn handle_data_transfer(
        &self,
        req: DataTransferRequest,
    ) -> Result<DataTransferResponse> {
        tracing::info!(
            sender_site = req.sender_site,
            old_partition = req.old_partition,
            new_partition = req.new_partition,
            table = %req.table,
            "received pushed tuples"
        );
        let batch = RowBatch::from_bytes(&req.batch)?;
        let Some(executor) = self.executor_for(req.new_partition) else {
            tracing::error!(
                new_partition = req.new_partition,
                "pushed tuples addressed to a partition this site does not host"
            );
            return Ok(DataTransferResponse {
                sender_site: self.local_site_id,
                old_partition: req.old_partition,
                new_partition: req.new_partition,
                table: req.table,
                min_inclusive: req.min_inclusive,
                max_exclusive: req.max_exclusive,
                sent_at_ms: unix_millis(),
            });
        };
        executor
            .receive_tuples(
                None,
                req.old_partition,
                req.new_partition,
                &req.table,
                req.min_inclusive,
                req.max_exclusive,
                batch,
                false,
                false,
            )
            .await?;
        Ok(DataTransferResponse {
            sender_site: self.local_site_id,
            old_partition: req.old_partition,
            new_partition: req.new_partition,
            table: req.table,
            min_inclusive: req.min_inclusive,
            max_exclusive: req.max_exclusive,
            sent_at_ms: unix_millis(),
        })
    }

    /// Remote sites that receive data from this site under the plan.
    pub(super) fn find_destination_sites(&self, plan: &ReconfigurationPlan) -> Vec<SiteId> {
        let mut sites = Vec::new();
        for executor in &self.executors {
            for range in plan.outgoing_ranges(executor.partition_id()) {
                match self.partitions.site_for(range.new_partition) {
                    Some(site) if site != self.local_site_id && !sites.contains(&site) => {
                        sites.push(site);
                    }
                    Some(_) => {}
                    None => {
                        tracing::error!(
                            new_partition = range.new_partition,
                            "plan names a partition no site hosts"
                        );
                    }
                }
            }
        }
        sites.sort_unstable();
        sites
    }

    /// Coordinated mode: run the prepare handshake with each destination.
    pub(super) async fn send_prepare(&self, destinations: Vec<SiteId>) {
        if self.active_protocol() != Some(ReconfigProtocol::StopCopy) {
            return;
        }
        if destinations.is_empty() {
            tracing::info!("no remote destinations, starting bulk transfer immediately");
            self.destination_count.store(0, Ordering::Release);
            self.bulk_data_transfer().await;
            return;
        }
        tracing::info!(?destinations, "sending prepare to destination sites");
        self.destination_count
            .store(destinations.len(), Ordering::Release);
        self.destinations_ready.lock().clear();
        for dest in destinations {
            let req = ReconfigurationRequest {
                sender_site: self.local_site_id,
                sent_at_ms: unix_millis(),
            };
            let Some(channel) = self.channels.get(dest) else {
                continue;
            };
            match channel.reconfiguration(req).await {
                Ok(resp) => self.prepare_acknowledged(resp.sender_site).await,
                Err(e) => {
                    tracing::warn!(dest, error = %e, "prepare handshake failed");
                }
            }
        }
    }

    /// A destination answered the prepare handshake. Start the bulk
    /// transfer once all of them have.
    pub(super) async fn prepare_acknowledged(&self, site: SiteId) {
        tracing::info!(site, "destination site ready for bulk transfer");
        let ready = {
            let mut acked = self.destinations_ready.lock();
            acked.insert(site);
            acked.len()
        };
        let expected = self.destination_count.load(Ordering::Acquire);
        if self.in_progress()
            && *self.site_state.read() == PartitionState::Prepare
            && ready == expected
        {
            self.bulk_data_transfer().await;
        }
    }

    /// Coordinated mode bulk phase: push everything, then tear down.
    async fn bulk_data_transfer(&self) {
        if self.active_protocol() != Some(ReconfigProtocol::StopCopy) {
            return;
        }
        tracing::info!("starting bulk data transfer");
        *self.site_state.write() = PartitionState::BulkTransfer;
        for executor in &self.executors {
            self.partition_states
                .insert(executor.partition_id(), PartitionState::BulkTransfer);
        }
        if let Err(e) = self.push_all_outgoing().await {
            tracing::error!(error = %e, "bulk data transfer failed");
            return;
        }
        self.end_reconfiguration().await;
        self.reset_session();
    }

    /// Source-side handler for a prepare handshake request.
    pub async fn handle_reconfiguration(
        &self,
        req: ReconfigurationRequest,
    ) -> ReconfigurationResponse {
        tracing::info!(
            sender_site = req.sender_site,
            "acknowledging stop-and-copy prepare"
        );
        ReconfigurationResponse {
            sender_site: self.local_site_id,
            sent_at_ms: unix_millis(),
        }
    }
}
