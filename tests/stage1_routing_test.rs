use routingd::cache::{MemoryCache, RoutingCache};
use routingd::config::{HomeServer, RoutingConfig};
use routingd::error::RoutingError;
use routingd::models::{
    Extension, ExtensionKind, ForwardingMode, MemberKind, RankMember, RankMode,
};
use routingd::routing::{Dispatcher, LogLevel, MemberNode, RouteRequest, RoutingResult};
use routingd::store::{member, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

const LOCAL: i32 = 2;
const REMOTE: i32 = 3;

fn extension(id: i32, number: &str, kind: ExtensionKind, yate_id: Option<i32>) -> Extension {
    Extension {
        id,
        number: number.to_string(),
        name: None,
        short_name: None,
        yate_id,
        outgoing_extension: None,
        outgoing_name: None,
        dialout_allowed: true,
        ringback: false,
        forwarding_delay: None,
        forwarding_extension_id: None,
        lang: Some("de_DE".to_string()),
        kind,
        forwarding_mode: ForwardingMode::Disabled,
    }
}

fn simple(id: i32, number: &str) -> Extension {
    extension(id, number, ExtensionKind::Simple, Some(LOCAL))
}

fn forwarded(mut ext: Extension, mode: ForwardingMode, delay: Option<i32>, target: i32) -> Extension {
    ext.forwarding_mode = mode;
    ext.forwarding_delay = delay;
    ext.forwarding_extension_id = Some(target);
    ext
}

fn config() -> RoutingConfig {
    RoutingConfig {
        local_server_id: LOCAL,
        servers: vec![
            HomeServer {
                id: LOCAL,
                address: "dect.example.net".to_string(),
                oconnection_id: "local".to_string(),
            },
            HomeServer {
                id: REMOTE,
                address: "sip.example.net".to_string(),
                oconnection_id: "local".to_string(),
            },
        ],
        outbound_gateway: "gw.example.net".to_string(),
        ..RoutingConfig::default()
    }
}

/// Extensions shared by most scenarios.
fn fixture_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.insert(simple(10, "1010"));
    store.insert(Extension {
        name: Some("PoC Alpha".to_string()),
        ..simple(2, "1002")
    });
    store.insert(simple(4, "1004"));
    store.insert(simple(5, "1005"));
    store.insert(simple(1, "1001"));
    store.insert(simple(6, "1006"));

    // single-rank group with one paused membership
    store.insert(extension(11, "1011", ExtensionKind::Group, None));
    store.insert_rank(
        11,
        RankMode::Default,
        None,
        vec![member(2, true), member(4, true), member(5, true), member(1, false)],
    );

    // immediate and delayed forwards
    store.insert(forwarded(simple(21, "1021"), ForwardingMode::Enabled, Some(0), 6));
    store.insert(forwarded(
        extension(22, "1022", ExtensionKind::Multiring, Some(LOCAL)),
        ForwardingMode::Enabled,
        Some(15),
        6,
    ));

    // multiring self-inclusion
    store.insert(extension(40, "2001", ExtensionKind::Multiring, Some(LOCAL)));
    store.insert(extension(41, "2005", ExtensionKind::Simple, Some(REMOTE)));
    store.insert_rank(40, RankMode::Default, None, vec![member(41, true)]);
    store.insert(simple(43, "2003"));
    store.insert(extension(42, "2000", ExtensionKind::Group, None));
    store.insert_rank(42, RankMode::Default, None, vec![member(40, true), member(43, true)]);

    // dial-out
    store.insert(Extension {
        dialout_allowed: false,
        ..simple(30, "1030")
    });
    store.insert(extension(31, "0301234567", ExtensionKind::External, None));
    store.insert(extension(32, "1032", ExtensionKind::Group, None));
    store.insert_rank(32, RankMode::Default, None, vec![member(31, true)]);

    // transitively self-including groups
    store.insert(extension(50, "4100", ExtensionKind::Group, None));
    store.insert(extension(51, "4101", ExtensionKind::Group, None));
    store.insert(simple(52, "4102"));
    store.insert(simple(53, "4103"));
    store.insert_rank(50, RankMode::Default, None, vec![member(51, true), member(52, true)]);
    store.insert_rank(51, RankMode::Default, None, vec![member(50, true), member(53, true)]);

    // rank modes at zero delay
    store.insert(extension(60, "1060", ExtensionKind::Group, None));
    store.insert_rank(60, RankMode::Default, None, vec![member(2, true)]);
    store.insert_rank(60, RankMode::Next, Some(0), vec![member(4, true)]);
    store.insert(extension(61, "1061", ExtensionKind::Group, None));
    store.insert_rank(61, RankMode::Default, None, vec![member(2, true)]);
    store.insert_rank(61, RankMode::Drop, Some(0), vec![member(4, true)]);

    // empty group, and a delayed forward pointing at it
    store.insert(extension(70, "4000", ExtensionKind::Group, None));
    store.insert(forwarded(simple(80, "1080"), ForwardingMode::Enabled, Some(10), 70));

    // auxiliary membership
    store.insert(extension(90, "1090", ExtensionKind::Group, None));
    store.insert_rank(
        90,
        RankMode::Default,
        None,
        vec![
            member(2, true),
            RankMember {
                extension_id: 4,
                active: true,
                kind: MemberKind::Auxiliary,
            },
        ],
    );

    // conditional forwards
    store.insert(forwarded(simple(95, "1095"), ForwardingMode::OnBusy, None, 6));
    store.insert(forwarded(simple(96, "1096"), ForwardingMode::OnUnavailable, None, 6));

    store
}

fn dispatcher_with(store: MemoryStore) -> (Arc<Dispatcher>, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(store), cache.clone(), config()));
    (dispatcher, cache)
}

fn dispatcher() -> (Arc<Dispatcher>, Arc<MemoryCache>) {
    dispatcher_with(fixture_store())
}

fn request(caller: &str, called: &str) -> RouteRequest {
    RouteRequest {
        caller: caller.to_string(),
        called: called.to_string(),
        call_id: None,
    }
}

fn fork_target_strings(result: &RoutingResult) -> Vec<String> {
    match result {
        RoutingResult::Fork { fork_targets, .. } => {
            fork_targets.iter().map(|t| t.target.clone()).collect()
        }
        RoutingResult::Simple { .. } => panic!("expected a fork result"),
    }
}

#[tokio::test]
async fn test_simple_leaf() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1002")).await.unwrap();

    let RoutingResult::Simple { target } = &outcome.result else {
        panic!("expected simple result");
    };
    assert_eq!(target.target, "lateroute/1002");
    assert_eq!(target.params.get("eventphone_stage2").map(String::as_str), Some("1"));
    assert_eq!(
        target.params.get("x_eventphone_id"),
        Some(&outcome.call_id)
    );
    assert_eq!(
        target.params.get("osip_X-Eventphone-Id"),
        Some(&outcome.call_id)
    );
    assert_eq!(target.params.get("calledname").map(String::as_str), Some("PoC Alpha"));
    assert!(outcome.cached.is_empty());
}

#[tokio::test]
async fn test_single_rank_group() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1011")).await.unwrap();

    assert_eq!(
        fork_target_strings(&outcome.result),
        vec!["lateroute/1002", "lateroute/1004", "lateroute/1005"]
    );
    assert_eq!(outcome.cached.len(), 1);
    assert_eq!(outcome.cached[0].0.as_str(), "1");

    // the paused member is discovered but inactive
    let rank = &outcome.tree.fork_ranks[0];
    assert_eq!(rank.members.len(), 4);
    let paused = &rank.members[3];
    assert!(!paused.active);
    match &paused.node {
        MemberNode::Child(node) => assert_eq!(node.extension.number, "1001"),
        MemberNode::Device => panic!("expected child node"),
    }
}

#[tokio::test]
async fn test_multiring_self_inclusion_deactivates_caller() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("2001", "2000")).await.unwrap();

    assert_eq!(fork_target_strings(&outcome.result), vec!["lateroute/2003"]);
    let rank = &outcome.tree.fork_ranks[0];
    assert!(!rank.members[0].active);
    assert!(rank.members[1].active);
    assert!(outcome
        .tree
        .logs
        .iter()
        .any(|log| log.level == LogLevel::Warn && log.message.contains("already routed")));
}

#[tokio::test]
async fn test_immediate_forward() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1021")).await.unwrap();

    let RoutingResult::Simple { target } = &outcome.result else {
        panic!("expected simple result");
    };
    assert_eq!(target.target, "lateroute/1006");
    assert_eq!(target.params.get("x_originally_called").map(String::as_str), Some("1021"));
    assert_eq!(
        target.params.get("osip_X-Originally-Called").map(String::as_str),
        Some("1021")
    );

    let fwd = outcome.tree.forward.as_ref().unwrap();
    assert_eq!(fwd.extension.number, "1006");
    assert_eq!(fwd.tree_path.as_str(), "1-fwd");
    assert!(outcome.tree.fork_ranks.is_empty());

    // the forwarding node is inner: its result is cached under its own path
    assert_eq!(outcome.cached.len(), 1);
    assert_eq!(outcome.cached[0].0.as_str(), "1");
    assert_eq!(outcome.cached[0].1, outcome.result);
}

#[tokio::test]
async fn test_delayed_forward_with_multiring_device() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1022")).await.unwrap();

    assert_eq!(
        fork_target_strings(&outcome.result),
        vec!["lateroute/1022", "|drop=15", "lateroute/1006"]
    );
    // the root is answered inline, its target never names its own cache entry
    assert_eq!(outcome.result.target().target, "fork");

    let ranks = &outcome.tree.fork_ranks;
    assert_eq!(ranks.len(), 2);
    assert!(matches!(ranks[0].members[0].node, MemberNode::Device));
    assert_eq!(ranks[1].mode, RankMode::Drop);
    assert_eq!(ranks[1].delay, Some(15));
}

#[tokio::test(start_paused = true)]
async fn test_lateroute_from_cache_until_ttl() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1011")).await.unwrap();

    let name = format!("lateroute/stage1-{}-1", outcome.call_id);
    let fetched = dispatcher.lateroute(&name).await.unwrap();
    assert_eq!(fetched, outcome.result);
    assert_eq!(
        fetched.to_bytes().unwrap(),
        outcome.result.to_bytes().unwrap()
    );

    tokio::time::advance(Duration::from_secs(301)).await;
    match dispatcher.lateroute(&name).await {
        Err(RoutingError::Gone(_)) => {}
        other => panic!("expected GONE after ttl, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_external_call_id_with_dash_is_sanitized() {
    let (dispatcher, _) = dispatcher();
    let mut req = request("1010", "1011");
    req.call_id = Some("PBX-42/77".to_string());
    let outcome = dispatcher.route(req).await.unwrap();

    assert_eq!(outcome.call_id, "PBX_42_77");
    let name = format!("lateroute/stage1-{}-1", outcome.call_id);
    let fetched = dispatcher.lateroute(&name).await.unwrap();
    assert_eq!(fetched, outcome.result);
}

#[tokio::test]
async fn test_group_in_group_routes_symbolically() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "4100")).await.unwrap();

    let targets = fork_target_strings(&outcome.result);
    assert_eq!(
        targets,
        vec![
            format!("lateroute/stage1-{}-1-fr0-0", outcome.call_id),
            "lateroute/4102".to_string()
        ]
    );
    let paths: Vec<&str> = outcome.cached.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["1-fr0-0", "1"]);

    // the cyclic membership 4101 -> 4100 is deactivated with a warning
    let inner = match &outcome.tree.fork_ranks[0].members[0].node {
        MemberNode::Child(node) => node,
        MemberNode::Device => panic!("expected child"),
    };
    assert!(inner
        .logs
        .iter()
        .any(|log| log.level == LogLevel::Warn && log.message.contains("already routed")));
    let (_, inner_result) = &outcome.cached[0];
    assert_eq!(fork_target_strings(inner_result), vec!["lateroute/4103"]);
}

#[tokio::test]
async fn test_active_leaves_unique_and_exclude_caller() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "4100")).await.unwrap();

    let leaves = outcome.tree.active_leaves();
    let mut deduped = leaves.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(leaves.len(), deduped.len());
    assert!(!leaves.contains(&10));
}

#[tokio::test]
async fn test_rank_modes_with_zero_delay() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1060")).await.unwrap();
    assert_eq!(
        fork_target_strings(&outcome.result),
        vec!["lateroute/1002", "|next=0", "lateroute/1004"]
    );

    let outcome = dispatcher.route(request("1010", "1061")).await.unwrap();
    assert_eq!(
        fork_target_strings(&outcome.result),
        vec!["lateroute/1002", "|drop=0", "lateroute/1004"]
    );
}

#[tokio::test]
async fn test_delayed_forward_to_dead_group_is_pruned() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1080")).await.unwrap();

    assert_eq!(fork_target_strings(&outcome.result), vec!["lateroute/1080"]);
    assert_eq!(
        outcome
            .result
            .target()
            .params
            .get("x_originally_called")
            .map(String::as_str),
        Some("1080")
    );
}

#[tokio::test]
async fn test_empty_group_is_noroute() {
    let (dispatcher, _) = dispatcher();
    match dispatcher.route(request("1010", "4000")).await {
        Err(RoutingError::NoRoute(_)) => {}
        other => panic!("expected NO_ROUTE, got {:?}", other.map(|o| o.result)),
    }
}

#[tokio::test]
async fn test_unknown_number_is_noroute() {
    let (dispatcher, _) = dispatcher();
    match dispatcher.route(request("1010", "4747")).await {
        Err(RoutingError::NoRoute(_)) => {}
        other => panic!("expected NO_ROUTE, got {:?}", other.map(|o| o.result)),
    }
}

#[tokio::test]
async fn test_dialout_gated_on_caller() {
    let (dispatcher, _) = dispatcher();

    let outcome = dispatcher.route(request("1010", "1032")).await.unwrap();
    assert_eq!(
        fork_target_strings(&outcome.result),
        vec!["sip/sip:0301234567@gw.example.net"]
    );

    let mut req = request("1030", "1032");
    req.call_id = Some("f00f00f00f00f00f00f00f00f00f00f0".to_string());
    match dispatcher.route(req).await {
        Err(RoutingError::Forbidden(number)) => assert_eq!(number, "0301234567"),
        other => panic!("expected FORBIDDEN, got {:?}", other.map(|o| o.result)),
    }
}

#[tokio::test]
async fn test_failed_request_writes_no_cache_entries() {
    let (dispatcher, cache) = dispatcher();
    let call_id = "f00f00f00f00f00f00f00f00f00f00f0";
    let mut req = request("1030", "1032");
    req.call_id = Some(call_id.to_string());
    assert!(dispatcher.route(req).await.is_err());
    assert!(cache.get(call_id, "1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_server_target() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "2005")).await.unwrap();
    let RoutingResult::Simple { target } = &outcome.result else {
        panic!("expected simple result");
    };
    assert_eq!(target.target, "sip/sip:2005@sip.example.net");
    assert_eq!(target.params.get("oconnection_id").map(String::as_str), Some("local"));
    assert!(target.params.get("eventphone_stage2").is_none());
}

#[tokio::test]
async fn test_auxiliary_member_calltype() {
    let (dispatcher, _) = dispatcher();
    let outcome = dispatcher.route(request("1010", "1090")).await.unwrap();
    let RoutingResult::Fork { fork_targets, .. } = &outcome.result else {
        panic!("expected fork");
    };
    assert!(fork_targets[0].params.get("fork.calltype").is_none());
    assert_eq!(
        fork_targets[1].params.get("fork.calltype").map(String::as_str),
        Some("auxiliary")
    );
}

#[tokio::test]
async fn test_conditional_forward_parameters() {
    let (dispatcher, _) = dispatcher();

    let outcome = dispatcher.route(request("1010", "1095")).await.unwrap();
    let target = outcome.result.target();
    assert_eq!(target.target, "lateroute/1095");
    assert_eq!(target.params.get("fork.stop").map(String::as_str), Some("busy"));
    assert_eq!(
        target.params.get("x_forward_to").map(String::as_str),
        Some("lateroute/1006")
    );

    let outcome = dispatcher.route(request("1010", "1096")).await.unwrap();
    assert_eq!(
        outcome.result.target().params.get("fork.stop").map(String::as_str),
        Some("offline")
    );
}

#[tokio::test]
async fn test_routing_is_deterministic() {
    let (dispatcher, _) = dispatcher();
    let call_id = "83ded8b334034789a2c0e1405a54af76";
    let mut req = request("1010", "4100");
    req.call_id = Some(call_id.to_string());
    let first = dispatcher.route(req.clone()).await.unwrap();
    let second = dispatcher.route(req).await.unwrap();

    assert_eq!(first.result, second.result);
    assert_eq!(
        serde_json::to_value(&first.tree).unwrap(),
        serde_json::to_value(&second.tree).unwrap()
    );
}

fn chain_store(forwards: i32) -> MemoryStore {
    let mut store = MemoryStore::new();
    store.insert(simple(10, "1010"));
    for i in 0..=forwards {
        let ext = simple(100 + i, &format!("3{:03}", i));
        if i < forwards {
            store.insert(forwarded(ext, ForwardingMode::Enabled, Some(0), 100 + i + 1));
        } else {
            store.insert(ext);
        }
    }
    store
}

#[tokio::test]
async fn test_forward_chain_at_depth_limit_succeeds() {
    let (dispatcher, _) = dispatcher_with(chain_store(16));
    let outcome = dispatcher.route(request("1010", "3000")).await.unwrap();
    let RoutingResult::Simple { target } = &outcome.result else {
        panic!("expected simple result");
    };
    assert_eq!(target.target, "lateroute/3016");
}

#[tokio::test]
async fn test_forward_chain_beyond_depth_limit_fails() {
    let (dispatcher, _) = dispatcher_with(chain_store(17));
    match dispatcher.route(request("1010", "3000")).await {
        Err(RoutingError::ForwardLoop(limit)) => assert_eq!(limit, 16),
        other => panic!("expected FORWARD_LOOP, got {:?}", other.map(|o| o.result)),
    }
}
