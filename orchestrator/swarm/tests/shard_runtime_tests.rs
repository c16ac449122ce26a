// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! End-to-end behaviour of individual shards talking over a shared bus.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use shardmesh_core::domain::capability::Capability;
use shardmesh_core::domain::config::ShardRuntimeConfig;
use shardmesh_core::domain::delta::DeltaOperation;
use shardmesh_core::domain::executor::{ExecutionError, ExecutorRegistry, WorkExecutor};
use shardmesh_core::domain::identity::ShardIdentity;
use shardmesh_core::domain::message::{MessageType, OfferPayload, P2PMessage, TaskPayload};
use shardmesh_core::domain::scope::ShardScope;
use shardmesh_core::domain::shard::{ShardStatus, ShardType};
use shardmesh_core::domain::state::MergeStrategy;
use shardmesh_core::domain::work::WorkItem;
use shardmesh_core::infrastructure::audit::InMemoryAuditSink;
use shardmesh_core::infrastructure::event_bus::EventBus;
use shardmesh_swarm::{AgentShard, ShardDependencies};

struct Immediate;

#[async_trait]
impl WorkExecutor for Immediate {
    async fn execute(&self, _item: &WorkItem) -> Result<Value, ExecutionError> {
        Ok(Value::Null)
    }
}

/// Blocks every execution until a permit is released.
struct Gated(Arc<Semaphore>);

#[async_trait]
impl WorkExecutor for Gated {
    async fn execute(&self, _item: &WorkItem) -> Result<Value, ExecutionError> {
        let permit = self
            .0
            .acquire()
            .await
            .map_err(|e| ExecutionError::Failed(e.to_string()))?;
        permit.forget();
        Ok(Value::Null)
    }
}

/// Records the hop count of every item it runs.
#[derive(Default)]
struct HopRecorder(Mutex<Vec<u32>>);

#[async_trait]
impl WorkExecutor for HopRecorder {
    async fn execute(&self, item: &WorkItem) -> Result<Value, ExecutionError> {
        self.0.lock().push(item.hops);
        Ok(Value::Null)
    }
}

/// Never completes.
struct Stuck;

#[async_trait]
impl WorkExecutor for Stuck {
    async fn execute(&self, _item: &WorkItem) -> Result<Value, ExecutionError> {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    }
}

fn config() -> ShardRuntimeConfig {
    ShardRuntimeConfig {
        heartbeat_interval: Duration::from_secs(3600),
        dequeue_timeout: Duration::from_millis(20),
        ..ShardRuntimeConfig::default()
    }
}

fn build_shard(
    bus: &EventBus,
    scope: ShardScope,
    capabilities: Vec<Capability>,
    config: ShardRuntimeConfig,
    executor: Arc<dyn WorkExecutor>,
) -> Arc<AgentShard> {
    AgentShard::new(
        ShardIdentity::generate(capabilities, 1),
        ShardType::Domain,
        scope,
        config,
        ShardDependencies {
            bus: bus.clone(),
            audit: Arc::new(InMemoryAuditSink::new()),
            executors: ExecutorRegistry::new(executor),
        },
    )
}

fn introduce(a: &AgentShard, b: &AgentShard) {
    a.register_peer(b.peer_info());
    b.register_peer(a.peer_info());
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_overloaded_shard_without_peers_executes_everything_locally() {
    let bus = EventBus::new(256);
    let gate = Arc::new(Semaphore::new(0));
    let shard = build_shard(
        &bus,
        ShardScope::for_domain("infra"),
        vec![Capability::ResourceOptimizer],
        ShardRuntimeConfig {
            capacity: 4,
            ..config()
        },
        Arc::new(Gated(gate.clone())),
    );
    shard.start().await.unwrap();

    for i in 0..6 {
        shard
            .submit(WorkItem::new("infra.cpu_high", "infra.node", json!({ "n": i })))
            .unwrap();
    }
    wait_for(|| shard.active_task_count() == 1 && shard.queue_depth() == 5).await;

    assert_eq!(shard.heartbeat(), ShardStatus::Overloaded);
    gate.add_permits(6);

    wait_for(|| shard.metrics().tasks_completed == 6).await;
    let metrics = shard.metrics();
    assert_eq!(metrics.tasks_offloaded, 0);
    assert_eq!(metrics.tasks_failed, 0);
    assert_eq!(shard.queue_depth(), 0);

    shard.stop().await;
}

#[tokio::test]
async fn test_stop_hands_off_active_and_queued_work() {
    let bus = EventBus::new(256);
    let mut handoffs = bus.subscribe(MessageType::Handoff.topic());
    let shard = build_shard(
        &bus,
        ShardScope::for_domain("app"),
        vec![Capability::SelfHealing],
        config(),
        Arc::new(Stuck),
    );
    shard.start().await.unwrap();

    let first = WorkItem::new("app.service_crash", "app.web", json!({}));
    let first_id = first.id;
    shard.submit(first).unwrap();
    shard.submit(WorkItem::new("app.service_crash", "app.api", json!({}))).unwrap();
    wait_for(|| shard.active_task_count() == 1 && shard.queue_depth() == 1).await;

    let handed_off = shard.stop().await;

    assert_eq!(handed_off, 2);
    assert_eq!(shard.active_task_count(), 0);
    assert_eq!(shard.status(), ShardStatus::Terminated);
    assert_eq!(shard.metrics().tasks_handed_off, 2);

    let mut seen = Vec::new();
    for _ in 0..2 {
        let event = handoffs.recv().await.unwrap();
        let message = P2PMessage::from_bus_event(&event).unwrap();
        assert!(message.is_broadcast());
        assert_eq!(message.message_type, MessageType::Handoff);
        let task: TaskPayload = message.decode_payload().unwrap();
        assert_eq!(task.reason, "shard_retiring");
        assert_eq!(task.work_item.hops, 1);
        seen.push(task.work_item.id);
    }
    assert!(seen.contains(&first_id));
}

#[tokio::test]
async fn test_handoff_is_adopted_by_peer() {
    let bus = EventBus::new(256);
    let leaving = build_shard(
        &bus,
        ShardScope::for_domain("app"),
        vec![Capability::SelfHealing],
        config(),
        Arc::new(Stuck),
    );
    let staying = build_shard(
        &bus,
        ShardScope::for_domain("infra"),
        vec![Capability::SelfHealing],
        config(),
        Arc::new(Immediate),
    );
    leaving.start().await.unwrap();
    staying.start().await.unwrap();
    introduce(&leaving, &staying);

    leaving
        .submit(WorkItem::new("app.service_crash", "app.web", json!({})))
        .unwrap();
    wait_for(|| leaving.active_task_count() == 1).await;

    assert_eq!(leaving.stop().await, 1);
    wait_for(|| staying.metrics().tasks_completed == 1).await;
    assert_eq!(staying.metrics().tasks_adopted, 1);

    staying.stop().await;
}

#[tokio::test]
async fn test_need_is_answered_with_offer() {
    let bus = EventBus::new(256);
    let mut offers = bus.subscribe(MessageType::Offer.topic());
    let asker = build_shard(&bus, ShardScope::for_domain("app"), vec![], config(), Arc::new(Immediate));
    let helper = build_shard(
        &bus,
        ShardScope::for_domain("infra"),
        vec![Capability::SelfHealing],
        config(),
        Arc::new(Immediate),
    );
    introduce(&asker, &helper);
    asker.start().await.unwrap();
    helper.start().await.unwrap();

    let need = asker
        .request_help("capacity", Some(Capability::SelfHealing), json!({ "queue": 42 }))
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), offers.recv())
        .await
        .unwrap()
        .unwrap();
    let reply = P2PMessage::from_bus_event(&event).unwrap();
    assert_eq!(reply.sender_id, helper.shard_id());
    assert_eq!(reply.recipient_id, Some(asker.shard_id()));
    let offer: OfferPayload = reply.decode_payload().unwrap();
    assert_eq!(offer.capability, Some(Capability::SelfHealing));
    assert_eq!(offer.details["in_reply_to"], json!(need.message_id));

    asker.stop().await;
    helper.stop().await;
}

#[tokio::test]
async fn test_need_without_capability_match_is_ignored() {
    let bus = EventBus::new(256);
    let mut offers = bus.subscribe(MessageType::Offer.topic());
    let asker = build_shard(&bus, ShardScope::for_domain("app"), vec![], config(), Arc::new(Immediate));
    let other = build_shard(
        &bus,
        ShardScope::for_domain("infra"),
        vec![Capability::Observability],
        config(),
        Arc::new(Immediate),
    );
    introduce(&asker, &other);
    asker.start().await.unwrap();
    other.start().await.unwrap();

    asker
        .request_help("capacity", Some(Capability::SecuritySentinel), Value::Null)
        .unwrap();
    wait_for(|| other.metrics().messages_processed == 1).await;

    assert!(offers.try_recv().is_err());
    asker.stop().await;
    other.stop().await;
}

#[tokio::test]
async fn test_state_deltas_converge_across_shards() {
    let bus = EventBus::new(256);
    let field_config = ShardRuntimeConfig {
        merge_strategy: MergeStrategy::Field,
        ..config()
    };
    let a = build_shard(&bus, ShardScope::for_domain("app"), vec![], field_config.clone(), Arc::new(Immediate));
    let b = build_shard(&bus, ShardScope::for_domain("infra"), vec![], field_config, Arc::new(Immediate));
    introduce(&a, &b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let mut replicas = Map::new();
    replicas.insert("replicas".to_string(), json!(3));
    a.publish_state_delta(a.new_delta("service", "web", DeltaOperation::Create, replicas))
        .unwrap();
    wait_for(|| b.entity("service", "web").is_some()).await;

    let mut image = Map::new();
    image.insert("image".to_string(), json!("web:2"));
    b.publish_state_delta(b.new_delta("service", "web", DeltaOperation::Update, image))
        .unwrap();

    let expected = json!({ "replicas": 3, "image": "web:2" });
    wait_for(|| a.entity("service", "web") == Some(expected.clone())).await;
    assert_eq!(b.entity("service", "web"), Some(expected));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_bad_messages_are_dropped_and_loop_survives() {
    let bus = EventBus::new(256);
    let shard = build_shard(&bus, ShardScope::for_domain("app"), vec![], config(), Arc::new(Immediate));
    shard.start().await.unwrap();

    let stranger = ShardIdentity::generate(vec![Capability::DataIngestion], 1);
    let offer = serde_json::to_value(OfferPayload {
        capability: Some(Capability::DataIngestion),
        capabilities: vec![Capability::DataIngestion],
        shard_type: ShardType::Workload,
        load_factor: 0.1,
        details: Value::Null,
    })
    .unwrap();

    // Tampered payload
    let mut tampered =
        P2PMessage::signed(&stranger, MessageType::Offer, None, offer.clone(), 300).unwrap();
    tampered.payload = json!({ "load_factor": 0.0 });
    bus.publish(tampered.to_bus_event().unwrap());

    // Expired, but correctly signed
    let mut stale =
        P2PMessage::signed(&stranger, MessageType::Offer, None, offer.clone(), 60).unwrap();
    stale.timestamp = Utc::now() - ChronoDuration::hours(1);
    stale.signature = stranger.sign(&stale.signing_bytes().unwrap());
    bus.publish(stale.to_bus_event().unwrap());

    wait_for(|| shard.metrics().messages_dropped == 2).await;
    assert!(shard.peers().is_empty());

    let valid = P2PMessage::signed(&stranger, MessageType::Offer, None, offer, 300).unwrap();
    bus.publish(valid.to_bus_event().unwrap());

    wait_for(|| shard.metrics().messages_processed == 1).await;
    let peers = shard.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].shard_id, stranger.shard_id());
    assert!(peers[0].has_capability(Capability::DataIngestion));

    shard.stop().await;
}

#[tokio::test]
async fn test_impersonation_of_known_peer_is_rejected() {
    let bus = EventBus::new(256);
    let shard = build_shard(&bus, ShardScope::for_domain("app"), vec![], config(), Arc::new(Immediate));
    let peer = build_shard(&bus, ShardScope::for_domain("infra"), vec![], config(), Arc::new(Immediate));
    introduce(&shard, &peer);
    shard.start().await.unwrap();

    let impostor = ShardIdentity::with_id(peer.shard_id(), vec![Capability::SecuritySentinel], 1);
    let request = serde_json::to_value(TaskPayload {
        work_item: WorkItem::new("app.deploy", "app.web", json!({})),
        reason: "overloaded".to_string(),
        preferred_adopter: None,
    })
    .unwrap();
    let forged = P2PMessage::signed(&impostor, MessageType::Request, Some(shard.shard_id()), request, 300).unwrap();
    bus.publish(forged.to_bus_event().unwrap());

    wait_for(|| shard.metrics().messages_dropped == 1).await;
    assert_eq!(shard.metrics().tasks_adopted, 0);
    assert_eq!(shard.metrics().tasks_completed, 0);

    shard.stop().await;
}

#[tokio::test]
async fn test_messages_for_other_shards_are_ignored() {
    let bus = EventBus::new(256);
    let shard = build_shard(&bus, ShardScope::for_domain("app"), vec![], config(), Arc::new(Immediate));
    shard.start().await.unwrap();

    let sender = ShardIdentity::generate(vec![], 1);
    let elsewhere = ShardIdentity::generate(vec![], 1).shard_id();
    let request = serde_json::to_value(TaskPayload {
        work_item: WorkItem::new("app.deploy", "app.web", json!({})),
        reason: "overloaded".to_string(),
        preferred_adopter: None,
    })
    .unwrap();
    let message = P2PMessage::signed(&sender, MessageType::Request, Some(elsewhere), request.clone(), 300).unwrap();
    bus.publish(message.to_bus_event().unwrap());

    let addressed = P2PMessage::signed(&sender, MessageType::Request, Some(shard.shard_id()), request, 300).unwrap();
    bus.publish(addressed.to_bus_event().unwrap());

    wait_for(|| shard.metrics().tasks_completed == 1).await;
    let metrics = shard.metrics();
    assert_eq!(metrics.tasks_adopted, 1);
    assert_eq!(metrics.messages_processed, 1);

    shard.stop().await;
}

#[tokio::test]
async fn test_requests_in_flight_at_stop_are_handed_off() {
    let bus = EventBus::new(512);
    let mut handoffs = bus.subscribe(MessageType::Handoff.topic());
    let target = build_shard(
        &bus,
        ShardScope::for_domain("app"),
        vec![Capability::ResourceOptimizer],
        config(),
        Arc::new(Stuck),
    );
    target.start().await.unwrap();

    let sender = ShardIdentity::generate(vec![], 1);
    let mut sent = Vec::new();
    for n in 0..20 {
        let item = WorkItem::new("infra.cpu_high", "infra.node", json!({ "n": n }));
        sent.push(item.id);
        let request = serde_json::to_value(TaskPayload {
            work_item: item,
            reason: "overloaded".to_string(),
            preferred_adopter: None,
        })
        .unwrap();
        let message =
            P2PMessage::signed(&sender, MessageType::Request, Some(target.shard_id()), request, 300).unwrap();
        bus.publish(message.to_bus_event().unwrap());
    }

    let handed_off = target.stop().await;

    let metrics = target.metrics();
    assert_eq!(metrics.tasks_completed + metrics.tasks_failed, 0);
    assert_eq!(handed_off, 20);
    assert_eq!(metrics.tasks_adopted, 20);

    let mut seen = Vec::new();
    while let Ok(event) = handoffs.try_recv() {
        let task: TaskPayload = P2PMessage::from_bus_event(&event)
            .unwrap()
            .decode_payload()
            .unwrap();
        seen.push(task.work_item.id);
    }
    seen.sort_by_key(|id| id.0);
    sent.sort_by_key(|id| id.0);
    assert_eq!(seen, sent);
}

#[tokio::test]
async fn test_offload_stops_after_max_hops() {
    let bus = EventBus::new(256);
    let recorder_a = Arc::new(HopRecorder::default());
    let recorder_b = Arc::new(HopRecorder::default());
    let a = build_shard(
        &bus,
        ShardScope::for_domain("infra"),
        vec![Capability::ResourceOptimizer],
        config(),
        recorder_a.clone(),
    );
    let b = build_shard(
        &bus,
        ShardScope::for_domain("app"),
        vec![Capability::ResourceOptimizer],
        config(),
        recorder_b.clone(),
    );
    a.start().await.unwrap();
    b.start().await.unwrap();
    introduce(&a, &b);
    a.set_status(ShardStatus::Overloaded);
    b.set_status(ShardStatus::Overloaded);

    a.submit(WorkItem::new("infra.cpu_high", "infra.node", json!({})))
        .unwrap();

    // a -> b -> a -> b, where the third hop pins it
    wait_for(|| a.metrics().tasks_completed + b.metrics().tasks_completed == 1).await;
    let max_hops = config().max_offload_hops;
    assert_eq!(max_hops, 3);
    assert_eq!(a.metrics().tasks_offloaded, 2);
    assert_eq!(b.metrics().tasks_offloaded, 1);
    assert_eq!(b.metrics().tasks_completed, 1);
    assert!(recorder_a.0.lock().is_empty());
    assert_eq!(*recorder_b.0.lock(), vec![max_hops]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_in_flight_task_finishes_within_stop_grace() {
    let bus = EventBus::new(256);
    let mut handoffs = bus.subscribe(MessageType::Handoff.topic());
    let gate = Arc::new(Semaphore::new(0));
    let shard = build_shard(
        &bus,
        ShardScope::for_domain("app"),
        vec![],
        ShardRuntimeConfig {
            stop_grace: Duration::from_secs(5),
            ..config()
        },
        Arc::new(Gated(gate.clone())),
    );
    shard.start().await.unwrap();

    shard
        .submit(WorkItem::new("app.service_crash", "app.web", json!({})))
        .unwrap();
    wait_for(|| shard.active_task_count() == 1).await;

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.add_permits(1);
    });
    let handed_off = shard.stop().await;
    release.await.unwrap();

    assert_eq!(handed_off, 0);
    assert_eq!(shard.metrics().tasks_completed, 1);
    assert_eq!(shard.metrics().tasks_handed_off, 0);
    assert_eq!(shard.active_task_count(), 0);
    assert!(handoffs.try_recv().is_err());
}

#[tokio::test]
async fn test_overloaded_shard_falls_back_to_peer_without_capability() {
    let bus = EventBus::new(256);
    let busy = build_shard(
        &bus,
        ShardScope::for_domain("infra"),
        vec![Capability::ResourceOptimizer],
        config(),
        Arc::new(Immediate),
    );
    let generalist = build_shard(&bus, ShardScope::for_domain("app"), vec![], config(), Arc::new(Immediate));
    busy.start().await.unwrap();
    generalist.start().await.unwrap();
    introduce(&busy, &generalist);
    busy.set_status(ShardStatus::Overloaded);

    busy.submit(WorkItem::new("infra.cpu_high", "infra.node", json!({})))
        .unwrap();

    wait_for(|| generalist.metrics().tasks_completed == 1).await;
    assert_eq!(busy.metrics().tasks_offloaded, 1);
    assert_eq!(busy.metrics().tasks_completed, 0);

    busy.stop().await;
    generalist.stop().await;
}
