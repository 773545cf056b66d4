// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end routing runs over an in-memory change store.

use cdc_router::context::PassCache;
use cdc_router::error::Result;
use cdc_router::model::{BatchStatus, ChangeRow, EventKind, UNKNOWN_ROUTER_ID};
use cdc_router::strategy::{RouteRule, RowMetadata, StaticRuleSource};
use cdc_router::{
    ChannelConfig, RouteStrategy, RouterConfig, RouterEngine, RouterError, StopHandle,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn change(id: i64, table: &str, channel: &str, tx: Option<&str>) -> ChangeRow {
    ChangeRow {
        data_id: id,
        table_name: table.to_string(),
        event_kind: EventKind::Insert,
        row_data: Some(format!("{id},widget")),
        old_data: None,
        pk_data: Some(format!("{id}")),
        transaction_id: tx.map(String::from),
        channel_id: channel.to_string(),
        source_node_id: None,
        create_time: Utc::now(),
    }
}

fn store_rules() -> Arc<StaticRuleSource> {
    Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("item-to-stores", "default", "item", "stores"))
            .add_group("stores", &["store-1", "store-2"]),
    )
}

async fn engine_with(rules: Arc<StaticRuleSource>) -> RouterEngine {
    // RUST_LOG=debug makes failing runs readable; ignore double-init.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    RouterEngine::new(RouterConfig::for_testing("corp-0"), rules)
        .await
        .unwrap()
}

/// Routes every row to one fixed node.
struct FixedNodeStrategy(&'static str);

impl RouteStrategy for FixedNodeStrategy {
    fn route_to_nodes(
        &self,
        _cache: &mut PassCache,
        _row: &RowMetadata,
        candidates: &HashSet<String>,
        _initial_load: bool,
    ) -> Result<Option<HashSet<String>>> {
        Ok(Some(
            candidates.iter().filter(|n| *n == self.0).cloned().collect(),
        ))
    }
}

/// Abstains from every row.
struct AbstainStrategy;

impl RouteStrategy for AbstainStrategy {
    fn route_to_nodes(
        &self,
        _cache: &mut PassCache,
        _row: &RowMetadata,
        _candidates: &HashSet<String>,
        _initial_load: bool,
    ) -> Result<Option<HashSet<String>>> {
        Ok(None)
    }
}

/// Fails the pass when it sees a configured data id.
struct FailAtStrategy {
    fail_at: i64,
    tripped: AtomicBool,
}

impl RouteStrategy for FailAtStrategy {
    fn route_to_nodes(
        &self,
        _cache: &mut PassCache,
        row: &RowMetadata,
        candidates: &HashSet<String>,
        _initial_load: bool,
    ) -> Result<Option<HashSet<String>>> {
        if row.data_id == self.fail_at {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(RouterError::Strategy {
                router_id: "failing".to_string(),
                message: "synthetic failure".to_string(),
            });
        }
        Ok(Some(candidates.clone()))
    }
}

#[tokio::test]
async fn test_missing_id_leaves_gap_open() {
    let mut engine = engine_with(store_rules()).await;
    // Id 4 was burned by a rolled-back capture transaction.
    for id in [1, 2, 3, 5] {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", None))
            .await
            .unwrap();
    }

    assert_eq!(engine.route(false).await.unwrap(), 4);

    let gaps = engine.store().find_gaps().await.unwrap();
    assert!(gaps.iter().any(|g| g.start_id == 4 && g.end_id == 4));
    // Trailing gap reopened past the last routed id
    assert_eq!(gaps.last().unwrap().start_id, 6);

    // The late arrival for id 4 is picked up by the next run.
    engine
        .store()
        .insert_change_with_id(&change(4, "item", "default", None))
        .await
        .unwrap();
    assert_eq!(engine.route(false).await.unwrap(), 1);
    let gaps = engine.store().find_gaps().await.unwrap();
    assert!(!gaps.iter().any(|g| g.contains(4)));
    engine.close().await;
}

#[tokio::test]
async fn test_transactional_policy_batches_per_transaction() {
    let rules = store_rules();
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels[0].batch_algorithm = "transactional".to_string();
    let mut engine = RouterEngine::new(config, rules).await.unwrap();

    // Interleaved: transaction T owns 1, 3, 5; ids 2 and 4 are autocommit.
    for (id, tx) in [(1, Some("T")), (2, None), (3, Some("T")), (4, None), (5, Some("T"))] {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", tx))
            .await
            .unwrap();
    }
    assert_eq!(engine.route(false).await.unwrap(), 5);

    // Delivery regroups T's rows, so each node gets batches [1,3,5], [2], [4].
    let batches = engine.store().find_batches("default").await.unwrap();
    let store1: Vec<_> = batches.iter().filter(|b| b.node_id == "store-1").collect();
    assert_eq!(store1.len(), 3);
    let mut counts: Vec<i64> = store1.iter().map(|b| b.data_event_count).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 1, 3]);
    for batch in &batches {
        assert_eq!(batch.status, BatchStatus::ReadyToSend);
    }

    let tx_batch = store1.iter().find(|b| b.data_event_count == 3).unwrap();
    let events = engine.store().find_data_events(tx_batch.batch_id).await.unwrap();
    let ids: Vec<i64> = events.iter().map(|e| e.data_id).collect();
    assert_eq!(ids, vec![1, 3, 5]);
    engine.close().await;
}

#[tokio::test]
async fn test_default_policy_never_splits_transactions() {
    let rules = store_rules();
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels[0].max_batch_size = 2;
    let mut engine = RouterEngine::new(config, rules).await.unwrap();

    for id in 1..=3 {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", Some("T")))
            .await
            .unwrap();
    }
    assert_eq!(engine.route(false).await.unwrap(), 3);

    // Size 2 was crossed mid-transaction; the cut waits for the boundary.
    let batches = engine.store().find_batches("default").await.unwrap();
    let store1: Vec<_> = batches.iter().filter(|b| b.node_id == "store-1").collect();
    assert_eq!(store1.len(), 1);
    assert_eq!(store1[0].data_event_count, 3);
    engine.close().await;
}

#[tokio::test]
async fn test_nontransactional_policy_cuts_on_size() {
    let rules = store_rules();
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels[0].batch_algorithm = "nontransactional".to_string();
    config.channels[0].max_batch_size = 2;
    let mut engine = RouterEngine::new(config, rules).await.unwrap();

    for id in 1..=5 {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", None))
            .await
            .unwrap();
    }
    assert_eq!(engine.route(false).await.unwrap(), 5);

    let batches = engine.store().find_batches("default").await.unwrap();
    let mut store1: Vec<i64> = batches
        .iter()
        .filter(|b| b.node_id == "store-1")
        .map(|b| b.data_event_count)
        .collect();
    store1.sort_unstable();
    assert_eq!(store1, vec![1, 2, 2]);
    engine.close().await;
}

#[tokio::test]
async fn test_rule_union_with_abstaining_rule() {
    // Two rules on the same table: one abstains, one claims store-1.
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("abstainer", "abstain", "item", "stores"))
            .add_rule(RouteRule::new("fixed", "to-store-1", "item", "stores"))
            .add_group("stores", &["store-1", "store-2"]),
    );
    let mut engine = engine_with(rules)
        .await
        .with_strategy("abstain", Arc::new(AbstainStrategy))
        .with_strategy("to-store-1", Arc::new(FixedNodeStrategy("store-1")));

    engine
        .store()
        .insert_change_with_id(&change(1, "item", "default", None))
        .await
        .unwrap();
    assert_eq!(engine.route(false).await.unwrap(), 1);

    // An abstaining rule contributes nothing, but the row is NOT unrouted:
    // the union of all rules decides.
    let batches = engine.store().find_batches("default").await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].node_id, "store-1");
    assert_eq!(batches[0].status, BatchStatus::ReadyToSend);
    engine.close().await;
}

#[tokio::test]
async fn test_all_rules_abstaining_goes_unrouted() {
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("abstainer", "abstain", "item", "stores"))
            .add_group("stores", &["store-1"]),
    );
    let mut engine = engine_with(rules)
        .await
        .with_strategy("abstain", Arc::new(AbstainStrategy));

    engine
        .store()
        .insert_change_with_id(&change(1, "item", "default", None))
        .await
        .unwrap();
    assert_eq!(engine.route(false).await.unwrap(), 1);

    let batches = engine.store().find_batches("default").await.unwrap();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].is_unrouted());
    assert_eq!(batches[0].status, BatchStatus::Ok);
    let events = engine.store().find_data_events(batches[0].batch_id).await.unwrap();
    assert_eq!(events[0].router_id, UNKNOWN_ROUTER_ID);

    // Unrouted still counts as routed: the gap closed.
    let gaps = engine.store().find_gaps().await.unwrap();
    assert!(!gaps.iter().any(|g| g.contains(1)));
    engine.close().await;
}

#[tokio::test]
async fn test_strategy_failure_rolls_back_whole_pass() {
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("failing", "fail-at-40", "item", "stores"))
            .add_group("stores", &["store-1"]),
    );
    let strategy = Arc::new(FailAtStrategy {
        fail_at: 40,
        tripped: AtomicBool::new(false),
    });
    let mut engine = engine_with(rules)
        .await
        .with_strategy("fail-at-40", strategy.clone());

    for id in 1..=50 {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", None))
            .await
            .unwrap();
    }
    let gaps_before = engine.store().find_gaps().await.unwrap();

    // The channel error is isolated: the run itself reports zero rows.
    assert_eq!(engine.route(false).await.unwrap(), 0);
    assert!(strategy.tripped.load(Ordering::SeqCst));

    // Rows 1..=39 were routed before the failure, but nothing survived it.
    assert!(engine.store().find_batches("default").await.unwrap().is_empty());
    assert_eq!(engine.store().count_data_events().await.unwrap(), 0);
    assert_eq!(engine.store().find_gaps().await.unwrap(), gaps_before);
    engine.close().await;
}

#[tokio::test]
async fn test_overlapping_rules_produce_one_event_per_node() {
    // r1 claims store-1; r2 claims both stores. store-1 must not get the
    // row twice.
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("r1", "to-store-1", "item", "stores"))
            .add_rule(RouteRule::new("r2", "default", "item", "stores"))
            .add_group("stores", &["store-1", "store-2"]),
    );
    let mut engine = engine_with(rules)
        .await
        .with_strategy("to-store-1", Arc::new(FixedNodeStrategy("store-1")));

    for id in 1..=4 {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", None))
            .await
            .unwrap();
    }
    assert_eq!(engine.route(false).await.unwrap(), 4);

    // 4 rows x 2 nodes, one event each
    assert_eq!(engine.store().count_data_events().await.unwrap(), 8);
    let batches = engine.store().find_batches("default").await.unwrap();
    assert_eq!(batches.len(), 2);
    // First claiming rule wins the router-id stamp per node.
    let store1 = batches.iter().find(|b| b.node_id == "store-1").unwrap();
    let events = engine.store().find_data_events(store1.batch_id).await.unwrap();
    assert!(events.iter().all(|e| e.router_id == "r1"));
    engine.close().await;
}

#[tokio::test]
async fn test_common_batch_mode_shares_one_batch_id() {
    let rules = store_rules();
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels[0].common_batch_mode = true;
    let mut engine = RouterEngine::new(config, rules).await.unwrap();

    for id in 1..=3 {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", None))
            .await
            .unwrap();
    }
    assert_eq!(engine.route(false).await.unwrap(), 3);

    let batches = engine.store().find_batches("default").await.unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].batch_id, batches[1].batch_id);
    assert!(batches.iter().all(|b| b.common));
    // One shared event per row, not one per node
    assert_eq!(engine.store().count_data_events().await.unwrap(), 3);
    engine.close().await;
}

#[tokio::test]
async fn test_ping_back_disabled_skips_source_node() {
    let rules = store_rules();
    let mut engine = engine_with(rules).await;

    let mut row = change(1, "item", "default", None);
    row.source_node_id = Some("store-1".to_string());
    engine.store().insert_change_with_id(&row).await.unwrap();
    assert_eq!(engine.route(false).await.unwrap(), 1);

    // The change came from store-1, so only store-2 receives it.
    let batches = engine.store().find_batches("default").await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].node_id, "store-2");
    engine.close().await;
}

#[tokio::test]
async fn test_ping_back_enabled_routes_back_to_source() {
    let mut rule = RouteRule::new("item-to-stores", "default", "item", "stores");
    rule.ping_back_enabled = true;
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(rule)
            .add_group("stores", &["store-1", "store-2"]),
    );
    let mut engine = engine_with(rules).await;

    let mut row = change(1, "item", "default", None);
    row.source_node_id = Some("store-1".to_string());
    engine.store().insert_change_with_id(&row).await.unwrap();
    assert_eq!(engine.route(false).await.unwrap(), 1);
    assert_eq!(engine.store().find_batches("default").await.unwrap().len(), 2);
    engine.close().await;
}

#[tokio::test]
async fn test_suspended_channel_is_skipped() {
    let rules = store_rules();
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels[0].suspended = true;
    let mut engine = RouterEngine::new(config, rules).await.unwrap();

    engine
        .store()
        .insert_change_with_id(&change(1, "item", "default", None))
        .await
        .unwrap();
    assert_eq!(engine.route(false).await.unwrap(), 0);
    assert!(engine.store().find_batches("default").await.unwrap().is_empty());
    engine.close().await;
}

#[tokio::test]
async fn test_failed_channel_does_not_block_others() {
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("failing", "always-fail", "poison", "stores"))
            .add_rule(RouteRule::new("item-to-stores", "default", "item", "stores"))
            .add_group("stores", &["store-1"]),
    );
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels = vec![ChannelConfig::named("alpha"), ChannelConfig::named("beta")];
    let mut engine = RouterEngine::new(config, rules).await.unwrap().with_strategy(
        "always-fail",
        Arc::new(FailAtStrategy {
            fail_at: 1,
            tripped: AtomicBool::new(false),
        }),
    );

    engine
        .store()
        .insert_change_with_id(&change(1, "poison", "alpha", None))
        .await
        .unwrap();
    engine
        .store()
        .insert_change_with_id(&change(2, "item", "beta", None))
        .await
        .unwrap();

    // Alpha's pass fails and rolls back; beta still routes and commits.
    assert_eq!(engine.route(false).await.unwrap(), 1);
    assert!(engine.store().find_batches("alpha").await.unwrap().is_empty());
    let beta = engine.store().find_batches("beta").await.unwrap();
    assert_eq!(beta.len(), 1);
    assert_eq!(beta[0].status, BatchStatus::ReadyToSend);

    // The failed channel's row is still unread and routes once unblocked.
    let gaps = engine.store().find_gaps().await.unwrap();
    assert!(gaps.iter().any(|g| g.contains(1)));
    engine.close().await;
}

#[tokio::test]
async fn test_channels_are_independent_lanes() {
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("item-to-stores", "default", "item", "stores"))
            .add_group("stores", &["store-1"]),
    );
    let mut config = RouterConfig::for_testing("corp-0");
    config.channels = vec![ChannelConfig::named("alpha"), ChannelConfig::named("beta")];
    let mut engine = RouterEngine::new(config, rules).await.unwrap();

    for (id, channel) in [(1, "alpha"), (2, "beta"), (3, "alpha")] {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", channel, None))
            .await
            .unwrap();
    }
    assert_eq!(engine.route(false).await.unwrap(), 3);

    let alpha = engine.store().find_batches("alpha").await.unwrap();
    let beta = engine.store().find_batches("beta").await.unwrap();
    assert_eq!(alpha.iter().map(|b| b.data_event_count).sum::<i64>(), 2);
    assert_eq!(beta.iter().map(|b| b.data_event_count).sum::<i64>(), 1);
    engine.close().await;
}

/// Stops the engine from inside the pass, like an operator shutdown
/// landing mid-run.
struct StopMidPassStrategy {
    handle: StopHandle,
    at: i64,
}

impl RouteStrategy for StopMidPassStrategy {
    fn route_to_nodes(
        &self,
        _cache: &mut PassCache,
        row: &RowMetadata,
        candidates: &HashSet<String>,
        _initial_load: bool,
    ) -> cdc_router::Result<Option<HashSet<String>>> {
        if row.data_id == self.at {
            self.handle.stop();
        }
        Ok(Some(candidates.clone()))
    }
}

#[tokio::test]
async fn test_stop_mid_pass_rolls_back() {
    let rules = Arc::new(
        StaticRuleSource::new()
            .add_rule(RouteRule::new("item-to-stores", "stop-mid", "item", "stores"))
            .add_group("stores", &["store-1", "store-2"]),
    );
    let engine = RouterEngine::new(RouterConfig::for_testing("corp-0"), rules)
        .await
        .unwrap();
    let handle = engine.stop_handle();
    let mut engine = engine.with_strategy("stop-mid", Arc::new(StopMidPassStrategy { handle, at: 1 }));

    for id in 1..=200 {
        engine
            .store()
            .insert_change_with_id(&change(id, "item", "default", None))
            .await
            .unwrap();
    }

    // The stop lands while row 1 routes; the next row never starts and
    // nothing from the pass commits.
    let err = engine.route(false).await.unwrap_err();
    assert!(matches!(err, RouterError::Interrupted));
    assert_eq!(engine.store().count_data_events().await.unwrap(), 0);
    assert!(engine.store().find_batches("default").await.unwrap().is_empty());
    engine.close().await;
}

#[tokio::test]
async fn test_oversized_row_reroutes_with_full_projection() {
    let mut config = RouterConfig::for_testing("corp-0");
    // Partial projection with a tiny ceiling; row 2's payload blows it.
    config.channels[0].use_old_data = false;
    config.reader.max_projected_row_bytes = 64;
    let mut engine = RouterEngine::new(config, store_rules()).await.unwrap();

    engine
        .store()
        .insert_change_with_id(&change(1, "item", "default", None))
        .await
        .unwrap();
    let mut big = change(2, "item", "default", None);
    big.row_data = Some("x".repeat(1024));
    engine
        .store()
        .insert_change_with_id(&big)
        .await
        .unwrap();

    // The capped pass fails row-too-large and is rerun once with the full
    // projection, which routes both rows.
    assert_eq!(engine.route(false).await.unwrap(), 2);
    let batches = engine.store().find_batches("default").await.unwrap();
    assert_eq!(batches.len(), 2);
    for batch in &batches {
        assert_eq!(batch.status, BatchStatus::ReadyToSend);
        assert_eq!(batch.data_event_count, 2);
    }
    assert_eq!(engine.store().count_data_events().await.unwrap(), 4);

    // Nothing is left behind or routed twice.
    assert_eq!(engine.route(false).await.unwrap(), 0);
    engine.close().await;
}
