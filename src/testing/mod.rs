//! In-process test fixtures: a map-backed partition executor, loopback
//! site channels and a multi-site cluster builder.

#[cfg(test)]
mod reconfig_e2e_tests;

use crate::config::{ReconfigConfig, ReconfigProtocol};
use crate::coordinator::ReconfigurationCoordinator;
use crate::error::{Error, Result};
use crate::events::MemoryEventLog;
use crate::executor::{
    AsyncPullResponder, PartitionExecutor, PartitionMap, PartitionState, PullResponder,
};
use crate::network::channels::SiteChannel;
use crate::network::messages::{
    AsyncPullRequest, AsyncPullResponse, DataTransferRequest, DataTransferResponse,
    LivePullRequest, LivePullResponse, ReconfigurationControl, ReconfigurationRequest,
    ReconfigurationResponse,
};
use crate::plan::{PlanResolver, ReconfigurationPlan, ReconfigurationRange};
use crate::types::{unix_millis, PartitionId, PullId, Row, RowBatch, SiteId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Map-backed partition executor. Rows live in a `BTreeMap` keyed by
/// table and key; extraction for a pull stages the drained rows until
/// the destination's acknowledgment purges them.
pub struct InMemoryExecutor {
    partition_id: PartitionId,
    chunk_rows: usize,
    rows: Mutex<BTreeMap<(String, i64), Vec<u8>>>,
    plan: RwLock<Option<Arc<ReconfigurationPlan>>>,
    state: RwLock<PartitionState>,
    /// Rows drained for a pull, held until the acknowledgment arrives.
    staged: Mutex<HashMap<PullId, Vec<(String, i64, Vec<u8>)>>>,
    received_batches: Mutex<Vec<RowBatch>>,
    purges: AtomicU64,
    next_extractions: AtomicU64,
}

impl InMemoryExecutor {
    pub fn new(partition_id: PartitionId, chunk_rows: usize) -> Self {
        Self {
            partition_id,
            chunk_rows,
            rows: Mutex::new(BTreeMap::new()),
            plan: RwLock::new(None),
            state: RwLock::new(PartitionState::Normal),
            staged: Mutex::new(HashMap::new()),
            received_batches: Mutex::new(Vec::new()),
            purges: AtomicU64::new(0),
            next_extractions: AtomicU64::new(0),
        }
    }

    pub fn seed_rows(&self, table: &str, keys: impl IntoIterator<Item = i64>) {
        let mut rows = self.rows.lock();
        for key in keys {
            rows.insert((table.to_string(), key), key.to_le_bytes().to_vec());
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows
            .lock()
            .keys()
            .filter(|(t, _)| t == table)
            .count()
    }

    pub fn has_key(&self, table: &str, key: i64) -> bool {
        self.rows.lock().contains_key(&(table.to_string(), key))
    }

    pub fn state(&self) -> PartitionState {
        *self.state.read()
    }

    pub fn staged_rows(&self, pull_id: PullId) -> usize {
        self.staged.lock().get(&pull_id).map_or(0, Vec::len)
    }

    pub fn received_batches(&self) -> Vec<RowBatch> {
        self.received_batches.lock().clone()
    }

    pub fn purge_count(&self) -> u64 {
        self.purges.load(Ordering::Acquire)
    }

    pub fn next_extraction_count(&self) -> u64 {
        self.next_extractions.load(Ordering::Acquire)
    }

    /// Drain up to `limit` rows of `[min, max)` out of the live map.
    fn drain_range(
        &self,
        table: &str,
        min_inclusive: i64,
        max_exclusive: i64,
        limit: usize,
    ) -> (Vec<(String, i64, Vec<u8>)>, bool) {
        let mut rows = self.rows.lock();
        let keys: Vec<(String, i64)> = rows
            .range((table.to_string(), min_inclusive)..(table.to_string(), max_exclusive))
            .map(|(k, _)| k.clone())
            .take(limit + 1)
            .collect();
        let more = keys.len() > limit;
        let drained = keys
            .into_iter()
            .take(limit)
            .map(|k| {
                let payload = rows.remove(&k).unwrap_or_default();
                (k.0, k.1, payload)
            })
            .collect();
        (drained, more)
    }

    fn batch_of(table: &str, rows: &[(String, i64, Vec<u8>)]) -> RowBatch {
        RowBatch {
            table: table.to_string(),
            rows: rows
                .iter()
                .map(|(_, key, payload)| Row {
                    key: *key,
                    payload: payload.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl PartitionExecutor for InMemoryExecutor {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    async fn init_reconfiguration(
        &self,
        plan: Arc<ReconfigurationPlan>,
        _protocol: ReconfigProtocol,
        target_state: PartitionState,
        _partitions: Arc<PartitionMap>,
    ) -> Result<()> {
        *self.plan.write() = Some(plan);
        *self.state.write() = target_state;
        Ok(())
    }

    async fn outgoing_ranges(&self) -> Result<Vec<ReconfigurationRange>> {
        let plan = self.plan.read().clone();
        Ok(plan
            .map(|p| {
                p.outgoing_ranges(self.partition_id)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn extract_push_batch(&self, range: &ReconfigurationRange) -> Result<(RowBatch, bool)> {
        let (drained, more) = self.drain_range(
            &range.table,
            range.min_inclusive,
            range.max_exclusive,
            self.chunk_rows,
        );
        Ok((Self::batch_of(&range.table, &drained), more))
    }

    async fn receive_tuples(
        &self,
        _txn_id: Option<u64>,
        _old_partition: PartitionId,
        _new_partition: PartitionId,
        table: &str,
        _min_inclusive: i64,
        _max_exclusive: i64,
        batch: RowBatch,
        _more_data_needed: bool,
        _is_undo: bool,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        for row in &batch.rows {
            rows.insert((table.to_string(), row.key), row.payload.clone());
        }
        drop(rows);
        self.received_batches.lock().push(batch);
        Ok(())
    }

    async fn queue_live_pull(&self, req: LivePullRequest, responder: PullResponder) -> Result<()> {
        // Extract eagerly; real engines schedule this on the partition's
        // work queue.
        loop {
            let (drained, more) =
                self.drain_range(&req.table, req.min_inclusive, req.max_exclusive, self.chunk_rows);
            let batch = Self::batch_of(&req.table, &drained);
            self.staged
                .lock()
                .entry(req.pull_id)
                .or_default()
                .extend(drained);
            let resp = LivePullResponse {
                pull_id: req.pull_id,
                sender_site: req.sender_site,
                txn_id: req.txn_id,
                old_partition: req.old_partition,
                new_partition: req.new_partition,
                table: req.table.clone(),
                min_inclusive: req.min_inclusive,
                max_exclusive: req.max_exclusive,
                batch: batch.to_bytes()?,
                more_data_needed: more,
                sent_at_ms: unix_millis(),
            };
            let _ = responder.send(resp);
            if !more {
                return Ok(());
            }
        }
    }

    async fn queue_async_pull(
        &self,
        req: AsyncPullRequest,
        responder: AsyncPullResponder,
    ) -> Result<()> {
        loop {
            let (drained, more) =
                self.drain_range(&req.table, req.min_inclusive, req.max_exclusive, self.chunk_rows);
            let batch = Self::batch_of(&req.table, &drained);
            self.staged
                .lock()
                .entry(req.async_pull_id)
                .or_default()
                .extend(drained);
            let resp = AsyncPullResponse {
                async_pull_id: req.async_pull_id,
                sender_site: req.sender_site,
                txn_id: req.txn_id,
                old_partition: req.old_partition,
                new_partition: req.new_partition,
                table: req.table.clone(),
                min_inclusive: req.min_inclusive,
                max_exclusive: req.max_exclusive,
                batch: batch.to_bytes()?,
                more_data_needed: more,
                sent_at_ms: unix_millis(),
            };
            let _ = responder.send(resp);
            if !more {
                return Ok(());
            }
        }
    }

    async fn queue_async_pull_response(&self, resp: AsyncPullResponse) -> Result<()> {
        let batch = RowBatch::from_bytes(&resp.batch)?;
        self.receive_tuples(
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
        .await
    }

    async fn purge_extracted(&self, pull_id: PullId) -> Result<()> {
        self.staged.lock().remove(&pull_id);
        self.purges.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn queue_next_extraction(&self) -> Result<()> {
        self.next_extractions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn end_reconfiguration(&self) -> Result<()> {
        *self.plan.write() = None;
        *self.state.write() = PartitionState::Normal;
        Ok(())
    }
}

/// Channel that delivers directly into another in-process coordinator.
pub struct LoopbackChannel {
    site: SiteId,
    remote: Weak<ReconfigurationCoordinator>,
}

impl LoopbackChannel {
    pub fn new(site: SiteId, remote: &Arc<ReconfigurationCoordinator>) -> Self {
        Self {
            site,
            remote: Arc::downgrade(remote),
        }
    }

    fn remote(&self) -> Result<Arc<ReconfigurationCoordinator>> {
        self.remote
            .upgrade()
            .ok_or(Error::ChannelUnavailable { site: self.site })
    }
}

#[async_trait::async_trait]
impl SiteChannel for LoopbackChannel {
    async fn reconfiguration(
        &self,
        req: ReconfigurationRequest,
    ) -> Result<ReconfigurationResponse> {
        Ok(self.remote()?.handle_reconfiguration(req).await)
    }

    async fn reconfiguration_control(&self, req: ReconfigurationControl) -> Result<()> {
        self.remote()?.handle_control(req).await;
        Ok(())
    }

    async fn data_transfer(&self, req: DataTransferRequest) -> Result<DataTransferResponse> {
        self.remote()?.handle_data_transfer(req).await
    }

    async fn live_pull(&self, req: LivePullRequest) -> Result<()> {
        self.remote()?.handle_live_pull_request(req).await;
        Ok(())
    }

    async fn live_pull_response(&self, resp: LivePullResponse) -> Result<()> {
        self.remote()?.receive_live_pull_tuples(resp).await
    }

    async fn async_pull(&self, req: AsyncPullRequest) -> Result<()> {
        self.remote()?.handle_async_pull_request(req).await;
        Ok(())
    }

    async fn async_pull_response(&self, resp: AsyncPullResponse) -> Result<()> {
        self.remote()?.handle_async_pull_response(resp).await;
        Ok(())
    }
}

/// Resolver backed by a fixed descriptor-to-plan table.
#[derive(Default)]
pub struct StaticResolver {
    plans: Mutex<HashMap<String, ReconfigurationPlan>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: &str, plan: ReconfigurationPlan) {
        self.plans.lock().insert(descriptor.to_string(), plan);
    }
}

impl PlanResolver for StaticResolver {
    fn resolve(&self, descriptor: &str) -> Result<Option<ReconfigurationPlan>> {
        Ok(self.plans.lock().get(descriptor).cloned())
    }
}

/// Resolver that counts invocations and can simulate slow resolution,
/// for init-race tests.
#[derive(Default)]
pub struct CountingResolver {
    inner: StaticResolver,
    resolutions: AtomicU64,
    delay: Duration,
}

impl CountingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block for `delay` inside every `resolve` call.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn insert(&self, descriptor: &str, plan: ReconfigurationPlan) {
        self.inner.insert(descriptor, plan);
    }

    /// Number of `resolve` calls seen so far.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Acquire)
    }
}

impl PlanResolver for CountingResolver {
    fn resolve(&self, descriptor: &str) -> Result<Option<ReconfigurationPlan>> {
        self.resolutions.fetch_add(1, Ordering::AcqRel);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.resolve(descriptor)
    }
}

/// Resolver that always fails, for error-path tests.
pub struct FailingResolver;

impl PlanResolver for FailingResolver {
    fn resolve(&self, descriptor: &str) -> Result<Option<ReconfigurationPlan>> {
        Err(Error::PlanResolution(format!(
            "no source for plan {descriptor}"
        )))
    }
}

/// One site of an in-process cluster.
pub struct TestSite {
    pub coordinator: Arc<ReconfigurationCoordinator>,
    pub executors: Vec<Arc<InMemoryExecutor>>,
    pub events: Arc<MemoryEventLog>,
}

impl TestSite {
    pub fn executor(&self, partition: PartitionId) -> &Arc<InMemoryExecutor> {
        self.executors
            .iter()
            .find(|e| e.partition_id() == partition)
            .unwrap_or_else(|| panic!("no executor for partition {partition}"))
    }
}

/// Build an in-process cluster of `num_sites` coordinators wired with
/// loopback channels. Every site shares the resolver and the partition
/// map.
pub fn build_cluster(
    config: ReconfigConfig,
    num_sites: u32,
    partition_map: PartitionMap,
    resolver: Arc<dyn PlanResolver>,
) -> Vec<TestSite> {
    let chunk_rows = config.chunk_rows;
    let partitions = Arc::new(partition_map);
    let mut sites = Vec::new();
    for site_id in 0..num_sites {
        let executors: Vec<Arc<InMemoryExecutor>> = partitions
            .partitions_of(site_id)
            .into_iter()
            .map(|p| Arc::new(InMemoryExecutor::new(p, chunk_rows)))
            .collect();
        let dyn_executors: Vec<Arc<dyn PartitionExecutor>> = executors
            .iter()
            .map(|e| Arc::clone(e) as Arc<dyn PartitionExecutor>)
            .collect();
        let events = Arc::new(MemoryEventLog::new());
        let coordinator = Arc::new(ReconfigurationCoordinator::new(
            config.clone(),
            site_id,
            num_sites,
            dyn_executors,
            Arc::clone(&partitions),
            crate::network::channels::ChannelTable::new(),
            Arc::clone(&resolver),
            events.clone() as Arc<dyn crate::events::EventLog>,
        ));
        sites.push(TestSite {
            coordinator,
            executors,
            events,
        });
    }
    for a in 0..sites.len() {
        for b in 0..sites.len() {
            if a == b {
                continue;
            }
            let channel = LoopbackChannel::new(b as SiteId, &sites[b].coordinator);
            sites[a]
                .coordinator
                .channels()
                .register(b as SiteId, Arc::new(channel));
        }
    }
    sites
}
