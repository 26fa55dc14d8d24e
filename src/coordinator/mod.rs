//! Per-site reconfiguration coordinator.
//!
//! One instance runs per site. It owns session state for the active
//! migration, the per-partition progress map, the channel table, and the
//! leader-coordinated completion barrier. Local execution units and
//! inbound RPC handlers call into it concurrently; correctness relies on
//! the atomic in-progress flag, the concurrent state maps, and the watch
//! channel the session winner publishes the plan on.

mod livepull;
mod stopcopy;

use crate::config::{ReconfigConfig, ReconfigProtocol};
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::executor::{PartitionExecutor, PartitionMap, PartitionState};
use crate::network::channels::ChannelTable;
use crate::network::messages::{ControlType, ReconfigurationControl};
use crate::plan::{PlanResolver, ReconfigurationPlan};
use crate::profiling::ReconfigurationProfiler;
use crate::types::{PartitionId, PullId, SiteId};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};

/// The per-site migration protocol engine.
pub struct ReconfigurationCoordinator {
    config: ReconfigConfig,
    local_site_id: SiteId,
    num_sites: u32,
    executors: Vec<Arc<dyn PartitionExecutor>>,
    partitions: Arc<PartitionMap>,
    channels: ChannelTable,
    resolver: Arc<dyn PlanResolver>,
    events: Arc<dyn EventLog>,

    /// At most one active session per site; installed via compare-and-set.
    in_progress: AtomicBool,
    /// Coarse site-wide protocol state.
    site_state: RwLock<PartitionState>,
    /// Leader site for the active session.
    leader: RwLock<Option<SiteId>>,
    /// Protocol of the active session.
    active_protocol: RwLock<Option<ReconfigProtocol>>,
    /// Plan of the active session.
    current_plan: RwLock<Option<Arc<ReconfigurationPlan>>>,
    /// Descriptor of the last applied plan, kept across sessions so a
    /// repeated init for the same plan is a no-op.
    last_applied_descriptor: RwLock<Option<String>>,
    /// Session winner publishes the resolved plan here; losing init
    /// callers wait on it with a bounded timeout.
    plan_tx: watch::Sender<Option<Arc<ReconfigurationPlan>>>,

    /// Per-partition migration state. No entry means not migrating.
    partition_states: DashMap<PartitionId, PartitionState>,
    /// Semaphores for pulls a caller is blocked on, keyed by pull id.
    blocked_pulls: DashMap<PullId, Arc<Semaphore>>,
    /// Dispatch timestamps for outstanding pulls (profiling).
    pull_issue_times: DashMap<PullId, Instant>,
    /// Monotonic id source for pull tokens.
    next_request_id: AtomicU64,

    /// Live-pull: local partitions that reported completion.
    done_partitions: Mutex<HashSet<PartitionId>>,
    /// Leader only: sites that reported completion.
    done_sites: Mutex<HashSet<SiteId>>,
    /// Guards the global-end broadcast so it fires at most once.
    end_broadcast_sent: AtomicBool,

    /// Coordinated stop-and-copy: destinations that acknowledged prepare.
    destinations_ready: Mutex<HashSet<SiteId>>,
    destination_count: AtomicUsize,

    profilers: HashMap<PartitionId, ReconfigurationProfiler>,
}

impl ReconfigurationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReconfigConfig,
        local_site_id: SiteId,
        num_sites: u32,
        executors: Vec<Arc<dyn PartitionExecutor>>,
        partitions: Arc<PartitionMap>,
        channels: ChannelTable,
        resolver: Arc<dyn PlanResolver>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        let partition_states = DashMap::new();
        let mut profilers = HashMap::new();
        for executor in &executors {
            partition_states.insert(executor.partition_id(), PartitionState::Normal);
            profilers.insert(executor.partition_id(), ReconfigurationProfiler::new());
        }
        let (plan_tx, _) = watch::channel(None);

        tracing::info!(
            site_id = local_site_id,
            num_sites,
            protocol = %config.protocol,
            detailed_profiling = config.detailed_profiling,
            "reconfiguration coordinator created"
        );

        Self {
            config,
            local_site_id,
            num_sites,
            executors,
            partitions,
            channels,
            resolver,
            events,
            in_progress: AtomicBool::new(false),
            site_state: RwLock::new(PartitionState::Normal),
            leader: RwLock::new(None),
            active_protocol: RwLock::new(None),
            current_plan: RwLock::new(None),
            last_applied_descriptor: RwLock::new(None),
            plan_tx,
            partition_states,
            blocked_pulls: DashMap::new(),
            pull_issue_times: DashMap::new(),
            next_request_id: AtomicU64::new(0),
            done_partitions: Mutex::new(HashSet::new()),
            done_sites: Mutex::new(HashSet::new()),
            end_broadcast_sent: AtomicBool::new(false),
            destinations_ready: Mutex::new(HashSet::new()),
            destination_count: AtomicUsize::new(0),
            profilers,
        }
    }

    /// Initialize a reconfiguration session.
    ///
    /// May be called concurrently by several local execution units:
    /// exactly one caller wins the in-progress flag, resolves the plan
    /// and starts the protocol; every other caller waits (bounded) for
    /// the winner's plan and returns whatever is published when the wait
    /// expires, which may still be `None` while resolution is slow.
    pub async fn init_reconfiguration(
        self: &Arc<Self>,
        leader_id: SiteId,
        protocol: &str,
        plan_descriptor: &str,
        calling_partition: PartitionId,
    ) -> Result<Option<Arc<ReconfigurationPlan>>> {
        // The already-applied check comes first: a no-op request returns
        // before the protocol identifier is even looked at.
        if !self.in_progress.load(Ordering::Acquire)
            && self.last_applied_descriptor.read().as_deref() == Some(plan_descriptor)
        {
            tracing::info!(
                site_id = self.local_site_id,
                "ignoring init request, requested plan is already applied"
            );
            return Ok(None);
        }
        let protocol = ReconfigProtocol::parse(protocol)?;

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.run_session_init(leader_id, protocol, plan_descriptor, calling_partition)
                .await
        } else {
            self.await_winner_plan().await
        }
    }

    /// Winner path of `init_reconfiguration`.
    async fn run_session_init(
        self: &Arc<Self>,
        leader_id: SiteId,
        protocol: ReconfigProtocol,
        plan_descriptor: &str,
        calling_partition: PartitionId,
    ) -> Result<Option<Arc<ReconfigurationPlan>>> {
        tracing::info!(
            site_id = self.local_site_id,
            leader_id,
            %protocol,
            "initializing reconfiguration, new plan"
        );
        if leader_id == self.local_site_id {
            self.events.append(&format!(
                "LEADER_RECONFIG_INIT, siteId={}",
                self.local_site_id
            ));
        } else {
            self.events
                .append(&format!("RECONFIG_INIT, siteId={}", self.local_site_id));
        }

        *self.leader.write() = Some(leader_id);
        *self.active_protocol.write() = Some(protocol);
        self.done_partitions.lock().clear();
        self.done_sites.lock().clear();
        self.end_broadcast_sent.store(false, Ordering::Release);

        let resolved = match self.resolver.resolve(plan_descriptor) {
            Ok(resolved) => resolved,
            Err(e) => {
                // Leave the session not-in-progress so a retry is possible.
                tracing::error!(error = %e, "plan resolution failed");
                self.in_progress.store(false, Ordering::Release);
                return Err(Error::PlanResolution(e.to_string()));
            }
        };
        *self.last_applied_descriptor.write() = Some(plan_descriptor.to_string());

        let Some(plan) = resolved else {
            tracing::info!("no reconfiguration plan, nothing to do");
            self.in_progress.store(false, Ordering::Release);
            self.plan_tx.send_replace(None);
            return Ok(None);
        };
        if plan.is_empty() {
            tracing::info!("plan carries no ranges, nothing to do");
            self.in_progress.store(false, Ordering::Release);
            self.plan_tx.send_replace(None);
            return Ok(None);
        }
        let plan = Arc::new(plan);
        *self.current_plan.write() = Some(Arc::clone(&plan));
        self.plan_tx.send_replace(Some(Arc::clone(&plan)));

        match protocol {
            ReconfigProtocol::StopCopy => {
                self.start_stop_copy(&plan, calling_partition).await?;
            }
            ReconfigProtocol::LivePull => {
                self.start_live_pull(&plan, calling_partition).await?;
            }
        }
        Ok(Some(plan))
    }

    /// Loser path of `init_reconfiguration`: never recompute, wait
    /// (bounded) for the winner's published plan.
    async fn await_winner_plan(&self) -> Result<Option<Arc<ReconfigurationPlan>>> {
        let mut rx = self.plan_tx.subscribe();
        let wait = self.config.init_wait_budget();
        let _ = tokio::time::timeout(wait, async {
            loop {
                if rx.borrow().is_some() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        let plan = rx.borrow().clone();
        tracing::debug!(
            site_id = self.local_site_id,
            plan_present = plan.is_some(),
            "init returning plan published by session winner"
        );
        Ok(plan)
    }

    /// Called by a partition when its active part of the migration is
    /// complete.
    pub async fn finish_reconfiguration(&self, partition_id: PartitionId) {
        match *self.active_protocol.read() {
            Some(ReconfigProtocol::StopCopy) => {
                self.partition_states.remove(&partition_id);
                if self.all_partitions_finished() {
                    tracing::info!("last partition finished stop-and-copy reconfiguration");
                    self.reset_session();
                }
            }
            Some(ReconfigProtocol::LivePull) => {
                let finished = {
                    let mut done = self.done_partitions.lock();
                    done.insert(partition_id);
                    done.len()
                };
                self.partition_states
                    .insert(partition_id, PartitionState::End);
                tracing::info!(
                    partition_id,
                    finished,
                    total = self.executors.len(),
                    "partition finished reconfiguration"
                );
                if finished == self.executors.len() {
                    self.signal_end_reconfiguration_to_leader(partition_id).await;
                }
            }
            None => {
                tracing::warn!(partition_id, "finish called with no active session");
            }
        }
    }

    /// Report this site's completion to the leader, locally when the
    /// leader is co-located.
    pub async fn signal_end_reconfiguration_to_leader(&self, calling_partition: PartitionId) {
        let Some(leader) = *self.leader.read() else {
            tracing::warn!("no reconfiguration leader set");
            return;
        };
        tracing::info!(
            site_id = self.local_site_id,
            leader,
            "signalling end of reconfiguration to leader"
        );
        if leader == self.local_site_id {
            self.leader_site_complete(self.local_site_id).await;
        } else {
            let ctrl = ReconfigurationControl {
                src_partition: calling_partition,
                dest_partition: calling_partition,
                control: ControlType::ReconfigurationDone,
                message_id: 0,
                sender_site: self.local_site_id,
                receiver_site: leader,
            };
            self.send_control(leader, ctrl).await;
            self.events.append(&format!(
                "RECONFIGURATION_SITE_DONE, siteId={}",
                self.local_site_id
            ));
        }
    }

    /// Leader only: a remote site reported local completion.
    pub async fn leader_receive_site_done(&self, site_id: SiteId) {
        if Some(self.local_site_id) != *self.leader.read() {
            tracing::error!(
                site_id,
                "site-done control message delivered to a non-leader site"
            );
            return;
        }
        tracing::info!(site_id, "leader received site completion");
        self.done_sites.lock().insert(site_id);
        self.maybe_broadcast_end().await;
    }

    /// Leader only: the leader's own partitions finished.
    async fn leader_site_complete(&self, site_id: SiteId) {
        tracing::info!(site_id, "leader site reconfiguration complete");
        self.done_sites.lock().insert(site_id);
        self.events.append(&format!(
            "LEADER_RECONFIGURATION_SITE_DONE, siteId={}",
            self.local_site_id
        ));
        self.maybe_broadcast_end().await;
    }

    /// Broadcast the global end signal once every site has reported.
    async fn maybe_broadcast_end(&self) {
        let all_reported = self.done_sites.lock().len() as u32 == self.num_sites;
        if !all_reported {
            return;
        }
        if self
            .end_broadcast_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::info!(
            num_sites = self.num_sites,
            "all sites reported completion, broadcasting global end"
        );
        self.events.append(&format!(
            "RECONFIGURATION_END, siteId={}",
            self.local_site_id
        ));
        for site in 0..self.num_sites {
            if site == self.local_site_id {
                self.receive_end_from_leader().await;
            } else {
                let ctrl = ReconfigurationControl {
                    src_partition: 0,
                    dest_partition: 0,
                    control: ControlType::ReconfigurationDoneReceived,
                    message_id: 0,
                    sender_site: self.local_site_id,
                    receiver_site: site,
                };
                self.send_control(site, ctrl).await;
            }
        }
    }

    /// Handle the leader's global end broadcast.
    pub async fn receive_end_from_leader(&self) {
        tracing::info!(
            site_id = self.local_site_id,
            "received global end of reconfiguration from leader"
        );
        self.end_reconfiguration().await;
    }

    /// Clear local reconfiguration state: every partition to `End`, the
    /// in-progress flag cleared and the cached plan discarded.
    pub async fn end_reconfiguration(&self) {
        self.in_progress.store(false, Ordering::Release);
        tracing::info!("clearing reconfiguration state for each local partition");
        for executor in &self.executors {
            if let Err(e) = executor.end_reconfiguration().await {
                tracing::warn!(
                    partition_id = executor.partition_id(),
                    error = %e,
                    "executor failed to end reconfiguration"
                );
            }
            self.partition_states
                .insert(executor.partition_id(), PartitionState::End);
        }
        *self.site_state.write() = PartitionState::End;
        self.show_profilers();
        *self.current_plan.write() = None;
        self.plan_tx.send_replace(None);
        *self.leader.write() = None;
        *self.active_protocol.write() = None;
    }

    /// Dispatch an inbound control message.
    pub async fn handle_control(&self, ctrl: ReconfigurationControl) {
        match ctrl.control {
            ControlType::ReconfigurationDone => {
                self.leader_receive_site_done(ctrl.sender_site).await;
            }
            ControlType::ReconfigurationDoneReceived => {
                self.receive_end_from_leader().await;
            }
            ControlType::PullReceived => {
                self.handle_pull_received(ctrl).await;
            }
        }
    }

    /// Advance the coarse site state once a session is running: live-pull
    /// moves to on-demand data transfer, stop-and-copy enters the prepare
    /// handshake with its destinations.
    pub async fn prepare_reconfiguration(&self) {
        if !self.in_progress.load(Ordering::Acquire) {
            return;
        }
        match *self.active_protocol.read() {
            Some(ReconfigProtocol::LivePull) => {
                *self.site_state.write() = PartitionState::DataTransfer;
            }
            Some(ReconfigProtocol::StopCopy) => {
                tracing::info!("preparing stop-and-copy reconfiguration");
                *self.site_state.write() = PartitionState::Prepare;
                let destinations = {
                    let plan = self.current_plan.read().clone();
                    plan.map(|p| self.find_destination_sites(&p)).unwrap_or_default()
                };
                self.send_prepare(destinations).await;
            }
            None => {}
        }
    }

    /// Allocate a fresh pull token id.
    pub fn next_request_id(&self) -> PullId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn executor_for(&self, partition: PartitionId) -> Option<&Arc<dyn PartitionExecutor>> {
        self.executors
            .iter()
            .find(|e| e.partition_id() == partition)
    }

    pub(crate) fn profiler(&self, partition: PartitionId) -> Option<&ReconfigurationProfiler> {
        self.profilers.get(&partition)
    }

    /// Deliver a control message to a site, dropping it when no channel
    /// is registered.
    pub(crate) async fn send_control(&self, site: SiteId, ctrl: ReconfigurationControl) {
        let Some(channel) = self.channels.get(site) else {
            return;
        };
        if let Err(e) = channel.reconfiguration_control(ctrl).await {
            tracing::warn!(site, error = %e, "control message dropped");
        }
    }

    fn all_partitions_finished(&self) -> bool {
        self.executors.iter().all(|e| {
            match self.partition_states.get(&e.partition_id()) {
                None => true,
                Some(state) => *state == PartitionState::End,
            }
        })
    }

    /// Tear down the session and return every local partition to normal
    /// processing. The last applied descriptor is retained so a repeated
    /// init for the same plan stays a no-op.
    pub(crate) fn reset_session(&self) {
        for executor in &self.executors {
            self.partition_states
                .insert(executor.partition_id(), PartitionState::Normal);
        }
        *self.site_state.write() = PartitionState::Normal;
        *self.current_plan.write() = None;
        self.plan_tx.send_replace(None);
        *self.leader.write() = None;
        *self.active_protocol.write() = None;
        self.in_progress.store(false, Ordering::Release);
    }

    /// Record source-side processing latency for one pull chunk.
    pub(crate) fn notify_pull_response(&self, pull_id: PullId, partition_id: PartitionId) {
        if !self.config.detailed_profiling {
            return;
        }
        if let Some(issued) = self.pull_issue_times.get(&pull_id) {
            if let Some(profiler) = self.profiler(partition_id) {
                profiler.src_pull_proc.observe(issued.elapsed());
            }
        }
    }

    /// Emit per-partition profiling summaries to the log and event sink.
    pub fn show_profilers(&self) {
        if !self.config.detailed_profiling {
            return;
        }
        for executor in &self.executors {
            let partition_id = executor.partition_id();
            if let Some(profiler) = self.profilers.get(&partition_id) {
                for line in profiler.report(partition_id, true) {
                    tracing::info!("{}", line);
                    self.events.append(&line);
                }
            }
        }
    }

    // Accessors.

    pub fn config(&self) -> &ReconfigConfig {
        &self.config
    }

    pub fn local_site_id(&self) -> SiteId {
        self.local_site_id
    }

    pub fn num_sites(&self) -> u32 {
        self.num_sites
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PartitionState {
        *self.site_state.read()
    }

    pub fn partition_state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.partition_states.get(&partition).map(|s| *s)
    }

    pub fn reconfiguration_leader(&self) -> Option<SiteId> {
        *self.leader.read()
    }

    pub fn active_protocol(&self) -> Option<ReconfigProtocol> {
        *self.active_protocol.read()
    }

    pub fn current_plan(&self) -> Option<Arc<ReconfigurationPlan>> {
        self.current_plan.read().clone()
    }

    pub(crate) fn channels(&self) -> &ChannelTable {
        &self.channels
    }
}

impl std::fmt::Debug for ReconfigurationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconfigurationCoordinator")
            .field("local_site_id", &self.local_site_id)
            .field("num_sites", &self.num_sites)
            .field("in_progress", &self.in_progress())
            .field("state", &self.state())
            .field("leader", &self.reconfiguration_leader())
            .field("protocol", &self.active_protocol())
            .finish()
    }
}
