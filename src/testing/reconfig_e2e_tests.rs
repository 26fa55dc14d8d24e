//! End-to-end protocol tests over in-process loopback clusters.

use super::{
    build_cluster, CountingResolver, FailingResolver, InMemoryExecutor, LoopbackChannel,
    StaticResolver,
};
use crate::config::{AsyncDispatchMode, ReconfigConfig, ReconfigProtocol, StopCopyMode};
use crate::coordinator::ReconfigurationCoordinator;
use crate::error::Error;
use crate::events::{EventLog, NullEventLog};
use crate::executor::{PartitionExecutor, PartitionMap, PartitionState};
use crate::network::channels::ChannelTable;
use crate::plan::{PlanResolver, ReconfigurationPlan, ReconfigurationRange};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const PLAN_V2: &str = "plan-v2";

/// Install a subscriber honoring `RUST_LOG`, once per test binary.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn two_site_map() -> PartitionMap {
    PartitionMap::new([(0, 0), (1, 1)])
}

fn split_plan() -> ReconfigurationPlan {
    ReconfigurationPlan::new(
        PLAN_V2,
        vec![ReconfigurationRange::new(0, 1, "orders", 50, 100).unwrap()],
    )
}

fn resolver_with(plan: ReconfigurationPlan) -> Arc<StaticResolver> {
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert(PLAN_V2, plan);
    resolver
}

#[tokio::test]
async fn test_stop_copy_direct_moves_range() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::StopCopy).with_chunk_rows(16);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(split_plan()));
    sites[0].executor(0).seed_rows("orders", 0..100);

    let plan = sites[0]
        .coordinator
        .init_reconfiguration(0, "STOPCOPY", PLAN_V2, 0)
        .await
        .unwrap();
    assert!(plan.is_some());

    // Keys [50, 100) moved, [0, 50) stayed.
    assert_eq!(sites[0].executor(0).row_count("orders"), 50);
    assert_eq!(sites[1].executor(1).row_count("orders"), 50);
    assert!(sites[0].executor(0).has_key("orders", 49));
    assert!(!sites[0].executor(0).has_key("orders", 50));
    assert!(sites[1].executor(1).has_key("orders", 50));
    assert!(sites[1].executor(1).has_key("orders", 99));

    // Direct mode tears the session down inside the init call.
    assert!(!sites[0].coordinator.in_progress());
    assert_eq!(
        sites[0].coordinator.partition_state(0),
        Some(PartitionState::Normal)
    );
    assert_eq!(sites[0].coordinator.state(), PartitionState::Normal);
}

#[tokio::test]
async fn test_stop_copy_coordinated_prepares_then_transfers() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::StopCopy)
        .with_stopcopy_mode(StopCopyMode::Coordinated)
        .with_chunk_rows(8);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(split_plan()));
    sites[0].executor(0).seed_rows("orders", 0..100);

    sites[0]
        .coordinator
        .init_reconfiguration(0, "STOPCOPY", PLAN_V2, 0)
        .await
        .unwrap();

    assert_eq!(sites[0].executor(0).row_count("orders"), 50);
    assert_eq!(sites[1].executor(1).row_count("orders"), 50);
    assert!(!sites[0].coordinator.in_progress());
}

#[tokio::test]
async fn test_init_rejects_unknown_protocol() {
    init_logging();
    let sites = build_cluster(
        ReconfigConfig::default(),
        2,
        two_site_map(),
        resolver_with(split_plan()),
    );
    let err = sites[0]
        .coordinator
        .init_reconfiguration(0, "TURBOPULL", PLAN_V2, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedProtocol(_)));
    assert!(!sites[0].coordinator.in_progress());
}

#[tokio::test]
async fn test_init_resolution_failure_leaves_session_retryable() {
    init_logging();
    let sites = build_cluster(
        ReconfigConfig::default(),
        2,
        two_site_map(),
        Arc::new(FailingResolver) as Arc<dyn PlanResolver>,
    );
    let err = sites[0]
        .coordinator
        .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PlanResolution(_)));
    assert!(!sites[0].coordinator.in_progress());
    assert!(sites[0].coordinator.current_plan().is_none());
}

#[tokio::test]
async fn test_second_init_caller_gets_winner_plan() {
    init_logging();
    let sites = build_cluster(
        ReconfigConfig::default(),
        2,
        two_site_map(),
        resolver_with(split_plan()),
    );
    let winner = sites[0]
        .coordinator
        .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
        .await
        .unwrap()
        .unwrap();
    assert!(sites[0].coordinator.in_progress());

    // A concurrent caller loses the flag race and must get the winner's
    // plan back, not resolve its own.
    let loser = sites[0]
        .coordinator
        .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
        .await
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&winner, &loser));
}

#[tokio::test]
async fn test_reapplying_finished_plan_is_noop() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::StopCopy);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(split_plan()));
    sites[0].executor(0).seed_rows("orders", 0..100);

    sites[0]
        .coordinator
        .init_reconfiguration(0, "STOPCOPY", PLAN_V2, 0)
        .await
        .unwrap();
    assert!(!sites[0].coordinator.in_progress());

    let again = sites[0]
        .coordinator
        .init_reconfiguration(0, "STOPCOPY", PLAN_V2, 0)
        .await
        .unwrap();
    assert!(again.is_none());
    assert!(!sites[0].coordinator.in_progress());

    // The no-op answer wins even when the caller names a protocol the
    // coordinator does not know.
    let garbled = sites[0]
        .coordinator
        .init_reconfiguration(0, "TURBOPULL", PLAN_V2, 0)
        .await
        .unwrap();
    assert!(garbled.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_init_resolves_plan_once() {
    init_logging();
    let resolver = Arc::new(CountingResolver::new());
    resolver.insert(PLAN_V2, split_plan());
    let sites = build_cluster(
        ReconfigConfig::default(),
        2,
        two_site_map(),
        resolver.clone(),
    );
    let coordinator = Arc::clone(&sites[0].coordinator);

    // Four local partitions race the init; one wins the flag, the rest
    // must be handed the winner's plan without re-resolving.
    let mut handles = Vec::new();
    for partition in 0..4u32 {
        let c = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            c.init_reconfiguration(0, "LIVEPULL", PLAN_V2, partition).await
        }));
    }
    let mut plans = Vec::new();
    for handle in handles {
        plans.push(handle.await.unwrap().unwrap().unwrap());
    }

    assert_eq!(resolver.resolutions(), 1);
    for plan in &plans {
        assert!(Arc::ptr_eq(plan, &plans[0]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_losing_init_bounded_wait_may_return_none() {
    init_logging();
    let resolver = Arc::new(CountingResolver::with_delay(Duration::from_millis(300)));
    resolver.insert(PLAN_V2, split_plan());
    let config = ReconfigConfig::default().with_init_wait(2, Duration::from_millis(10));
    let sites = build_cluster(config, 2, two_site_map(), resolver.clone());
    let coordinator = Arc::clone(&sites[0].coordinator);

    let winner = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0).await })
    };
    // Let the winner grab the in-progress flag and stall in resolution.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The loser's wait is bounded; with resolution still running it
    // returns empty-handed rather than resolving on its own.
    let loser = coordinator
        .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 1)
        .await
        .unwrap();
    assert!(loser.is_none());

    let winner_plan = winner.await.unwrap().unwrap();
    assert!(winner_plan.is_some());
    assert_eq!(resolver.resolutions(), 1);
}

#[tokio::test]
async fn test_prepare_advances_live_pull_to_data_transfer() {
    init_logging();
    let sites = build_cluster(
        ReconfigConfig::default(),
        2,
        two_site_map(),
        resolver_with(split_plan()),
    );
    sites[0]
        .coordinator
        .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
        .await
        .unwrap();
    assert_eq!(sites[0].coordinator.state(), PartitionState::Prepare);

    sites[0].coordinator.prepare_reconfiguration().await;
    assert_eq!(sites[0].coordinator.state(), PartitionState::DataTransfer);
    assert!(sites[0].coordinator.in_progress());
}

#[tokio::test]
async fn test_prepare_retriggers_stopcopy_handshake() {
    init_logging();
    let resolver = resolver_with(split_plan());
    let partitions = Arc::new(two_site_map());
    let config = ReconfigConfig::new(ReconfigProtocol::StopCopy)
        .with_stopcopy_mode(StopCopyMode::Coordinated)
        .with_chunk_rows(16);

    let src = Arc::new(InMemoryExecutor::new(0, 16));
    let dst = Arc::new(InMemoryExecutor::new(1, 16));
    src.seed_rows("orders", 0..100);
    let site0 = Arc::new(ReconfigurationCoordinator::new(
        config.clone(),
        0,
        2,
        vec![Arc::clone(&src) as Arc<dyn PartitionExecutor>],
        Arc::clone(&partitions),
        ChannelTable::new(),
        resolver.clone() as Arc<dyn PlanResolver>,
        Arc::new(NullEventLog) as Arc<dyn EventLog>,
    ));
    let site1 = Arc::new(ReconfigurationCoordinator::new(
        config,
        1,
        2,
        vec![Arc::clone(&dst) as Arc<dyn PartitionExecutor>],
        partitions,
        ChannelTable::new(),
        resolver as Arc<dyn PlanResolver>,
        Arc::new(NullEventLog) as Arc<dyn EventLog>,
    ));

    // No channel to the destination yet: the handshake cannot complete
    // and the site sticks in the prepare phase with nothing transferred.
    site0
        .init_reconfiguration(0, "STOPCOPY", PLAN_V2, 0)
        .await
        .unwrap();
    assert!(site0.in_progress());
    assert_eq!(site0.state(), PartitionState::Prepare);
    assert_eq!(dst.row_count("orders"), 0);

    site0
        .channels()
        .register(1, Arc::new(LoopbackChannel::new(1, &site1)));
    site1
        .channels()
        .register(0, Arc::new(LoopbackChannel::new(0, &site0)));

    // Re-driving the prepare phase completes the handshake and runs the
    // bulk transfer.
    site0.prepare_reconfiguration().await;
    assert!(!site0.in_progress());
    assert_eq!(site0.state(), PartitionState::Normal);
    assert_eq!(src.row_count("orders"), 50);
    assert_eq!(dst.row_count("orders"), 50);
}

#[tokio::test]
async fn test_queued_dispatch_delivers_and_purges() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull)
        .with_async_dispatch(AsyncDispatchMode::Queued)
        .with_chunk_rows(8);
    let range = ReconfigurationRange::new(0, 1, "orders", 0, 20).unwrap();
    let plan = ReconfigurationPlan::new(PLAN_V2, vec![range.clone()]);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(plan));
    sites[0].executor(0).seed_rows("orders", 0..20);
    assert!(!sites[1].coordinator.async_dispatch_is_sync());

    for site in &sites {
        site.coordinator
            .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
            .await
            .unwrap();
    }

    // Queued mode rides the same ack/purge handshake; ordering inside
    // the source is the executor work queue's business.
    let pull_id = sites[1].coordinator.next_request_id();
    sites[1]
        .coordinator
        .async_pull_ranges(pull_id, None, 1, std::slice::from_ref(&range))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sites[1].executor(1).row_count("orders"), 20);
    assert_eq!(sites[0].executor(0).staged_rows(pull_id), 0);
    assert!(sites[0].executor(0).purge_count() >= 1);
}

#[tokio::test]
async fn test_live_pull_blocks_until_all_ranges_arrive() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull).with_chunk_rows(8);
    let ranges = vec![
        ReconfigurationRange::new(0, 1, "orders", 0, 20).unwrap(),
        ReconfigurationRange::new(0, 1, "orders", 20, 40).unwrap(),
        ReconfigurationRange::new(0, 1, "customers", 0, 10).unwrap(),
    ];
    let plan = ReconfigurationPlan::new(PLAN_V2, ranges.clone());
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(plan));
    sites[0].executor(0).seed_rows("orders", 0..40);
    sites[0].executor(0).seed_rows("customers", 0..10);

    for site in &sites {
        site.coordinator
            .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
            .await
            .unwrap();
    }

    let pull_id = sites[1].coordinator.next_request_id();
    let semaphore = Arc::new(Semaphore::new(0));
    sites[1]
        .coordinator
        .pull_ranges(pull_id, Some(77), 1, &ranges, Arc::clone(&semaphore))
        .await
        .unwrap();

    // One permit came back per range's final chunk.
    assert_eq!(semaphore.available_permits(), 3);
    assert_eq!(sites[1].executor(1).row_count("orders"), 40);
    assert_eq!(sites[1].executor(1).row_count("customers"), 10);
    assert_eq!(sites[0].executor(0).row_count("orders"), 0);

    // Acknowledgments let the source discard the staged rows. They land
    // after the semaphore release, so give the forwarders a beat.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sites[0].executor(0).staged_rows(pull_id), 0);
    assert!(sites[0].executor(0).purge_count() >= 1);
    assert!(sites[0].executor(0).next_extraction_count() >= 1);
}

#[tokio::test]
async fn test_live_pull_multi_chunk_applies_in_order() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull).with_chunk_rows(8);
    let range = ReconfigurationRange::new(0, 1, "orders", 0, 20).unwrap();
    let plan = ReconfigurationPlan::new(PLAN_V2, vec![range.clone()]);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(plan));
    sites[0].executor(0).seed_rows("orders", 0..20);

    for site in &sites {
        site.coordinator
            .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
            .await
            .unwrap();
    }

    let pull_id = sites[1].coordinator.next_request_id();
    let semaphore = Arc::new(Semaphore::new(0));
    sites[1]
        .coordinator
        .pull_ranges(pull_id, None, 1, std::slice::from_ref(&range), semaphore.clone())
        .await
        .unwrap();

    // 20 rows in chunks of 8: three batches, and only the last released
    // the caller.
    let batches = sites[1].executor(1).received_batches();
    assert_eq!(batches.len(), 3);
    assert_eq!(semaphore.available_permits(), 1);

    // Chunks arrived in source emission order.
    let keys: Vec<i64> = batches
        .iter()
        .flat_map(|b| b.rows.iter().map(|r| r.key))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);
    assert_eq!(keys.len(), 20);
}

#[tokio::test]
async fn test_nonblocking_pull_delivers_without_semaphore() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull).with_chunk_rows(16);
    let range = ReconfigurationRange::new(0, 1, "orders", 0, 10).unwrap();
    let plan = ReconfigurationPlan::new(PLAN_V2, vec![range.clone()]);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(plan));
    sites[0].executor(0).seed_rows("orders", 0..10);

    for site in &sites {
        site.coordinator
            .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
            .await
            .unwrap();
    }

    let pull_id = sites[1].coordinator.next_request_id();
    sites[1]
        .coordinator
        .pull_ranges_nonblocking(pull_id, None, 1, std::slice::from_ref(&range))
        .await;

    // Delivery is observed through the executor, not a semaphore.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sites[1].executor(1).row_count("orders"), 10);
    assert_eq!(sites[0].executor(0).staged_rows(pull_id), 0);
}

#[tokio::test]
async fn test_async_pull_delivers_and_purges() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull).with_chunk_rows(8);
    let range = ReconfigurationRange::new(0, 1, "orders", 0, 20).unwrap();
    let plan = ReconfigurationPlan::new(PLAN_V2, vec![range.clone()]);
    let sites = build_cluster(config, 2, two_site_map(), resolver_with(plan));
    sites[0].executor(0).seed_rows("orders", 0..20);

    for site in &sites {
        site.coordinator
            .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
            .await
            .unwrap();
    }

    let pull_id = sites[1].coordinator.next_request_id();
    sites[1]
        .coordinator
        .async_pull_ranges(pull_id, None, 1, std::slice::from_ref(&range))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sites[1].executor(1).row_count("orders"), 20);
    assert_eq!(sites[0].executor(0).row_count("orders"), 0);
    assert_eq!(sites[0].executor(0).staged_rows(pull_id), 0);
    assert!(sites[0].executor(0).purge_count() >= 1);
}

#[tokio::test]
async fn test_completion_barrier_three_sites_leader_last() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull);
    let map = PartitionMap::new([(0, 0), (1, 1), (2, 2)]);
    let plan = ReconfigurationPlan::new(
        PLAN_V2,
        vec![ReconfigurationRange::new(1, 2, "orders", 0, 10).unwrap()],
    );
    let sites = build_cluster(config, 3, map, resolver_with(plan));

    for site in &sites {
        site.coordinator
            .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
            .await
            .unwrap();
        assert!(site.coordinator.in_progress());
    }

    // Followers report first; nothing ends until the leader's own
    // partitions are done.
    sites[1].coordinator.finish_reconfiguration(1).await;
    sites[2].coordinator.finish_reconfiguration(2).await;
    assert!(sites[0].coordinator.in_progress());
    assert!(sites[1].coordinator.in_progress());

    sites[0].coordinator.finish_reconfiguration(0).await;

    for site in &sites {
        assert!(!site.coordinator.in_progress());
        assert_eq!(site.coordinator.state(), PartitionState::End);
        assert!(site.coordinator.reconfiguration_leader().is_none());
        assert!(site.coordinator.current_plan().is_none());
    }

    // The global end broadcast fired exactly once, from the leader.
    assert_eq!(sites[0].events.count_prefix("RECONFIGURATION_END"), 1);
    assert_eq!(sites[1].events.count_prefix("RECONFIGURATION_END"), 0);
    assert!(sites[1].events.contains_prefix("RECONFIGURATION_SITE_DONE"));
    assert!(sites[0].events.contains_prefix("LEADER_RECONFIG_INIT"));
    assert!(sites[1].events.contains_prefix("RECONFIG_INIT"));
}

#[tokio::test]
async fn test_single_site_pull_and_profiler_report() {
    init_logging();
    let config = ReconfigConfig::new(ReconfigProtocol::LivePull)
        .with_detailed_profiling(true)
        .with_chunk_rows(8);
    let map = PartitionMap::new([(0, 0), (1, 0)]);
    let range = ReconfigurationRange::new(0, 1, "orders", 0, 20).unwrap();
    let plan = ReconfigurationPlan::new(PLAN_V2, vec![range.clone()]);
    let sites = build_cluster(config, 1, map, resolver_with(plan));
    sites[0].executor(0).seed_rows("orders", 0..20);

    sites[0]
        .coordinator
        .init_reconfiguration(0, "LIVEPULL", PLAN_V2, 0)
        .await
        .unwrap();

    let pull_id = sites[0].coordinator.next_request_id();
    let semaphore = Arc::new(Semaphore::new(0));
    sites[0]
        .coordinator
        .pull_ranges(pull_id, None, 1, std::slice::from_ref(&range), semaphore.clone())
        .await
        .unwrap();
    assert_eq!(semaphore.available_permits(), 1);
    assert_eq!(sites[0].executor(1).row_count("orders"), 20);

    sites[0].coordinator.finish_reconfiguration(0).await;
    sites[0].coordinator.finish_reconfiguration(1).await;
    assert!(!sites[0].coordinator.in_progress());

    // End of session emits the per-partition profiler report.
    assert!(sites[0]
        .events
        .contains_prefix("REPORT_AVG_DEMAND_PULL_TIME"));
    assert!(sites[0]
        .events
        .contains_prefix("REPORT_AVG_SRC_DATA_PULL_INIT"));
}
