// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Shard Runtime
//!
//! An [`AgentShard`] is the autonomous unit of the fleet. It owns a work queue
//! and a message inbox and, once started, runs three loops on the tokio runtime:
//!
//! | Loop | Owns | Cadence |
//! |------|------|---------|
//! | work | `active_tasks`, execution metrics | dequeue with `dequeue_timeout` |
//! | message | `peers`, `local_state` | dequeue with `dequeue_timeout` |
//! | heartbeat | status, load gauges | every `heartbeat_interval` |
//!
//! Two forwarder tasks feed the queues from the bus: one copies scope-matching
//! domain events into the work queue, the other routes `shard.*` traffic
//! (P2P messages and peer heartbeats) into the inbox.
//!
//! ## Overload
//!
//! Overload is observed locally: each heartbeat derives the status from
//! `queue_depth / capacity`. While overloaded, the work loop sends each item to
//! the least-loaded running peer (REQUEST), preferring peers that hold the item's
//! capability. With no running peer at all, or once an item has been forwarded
//! `max_offload_hops` times, it is executed locally. Work is never dropped for
//! lack of capacity. Whoever ends up running an item resolves the executor from
//! the item's own domain.
//!
//! ## Shutdown
//!
//! [`AgentShard::stop`] is the only cancellation path. It cancels the loops,
//! waits for the forwarders to flush every event already buffered on their
//! subscriptions, adopts whatever reached the inbox, lets the in-flight task
//! finish within `stop_grace`, then broadcasts a HANDOFF for every task that is
//! still active or queued before reporting `Terminated`.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shardmesh_core::domain::audit::{record_or_log, AuditRecord, AuditResult, AuditSink};
use shardmesh_core::domain::capability::Capability;
use shardmesh_core::domain::config::ShardRuntimeConfig;
use shardmesh_core::domain::delta::{DeltaOperation, StateDelta};
use shardmesh_core::domain::events::{BusEvent, HEARTBEAT_TOPIC, SHARD_NAMESPACE};
use shardmesh_core::domain::executor::ExecutorRegistry;
use shardmesh_core::domain::identity::{PublicKey, ShardId, ShardIdentity};
use shardmesh_core::domain::message::{
    MessageError, MessageType, NeedPayload, OfferPayload, P2PMessage, TaskPayload,
};
use shardmesh_core::domain::scope::ShardScope;
use shardmesh_core::domain::shard::{
    HeartbeatPayload, PeerInfo, ShardMetrics, ShardSnapshot, ShardStatus, ShardType,
};
use shardmesh_core::domain::state::LocalState;
use shardmesh_core::domain::work::{WorkItem, WorkItemId};
use shardmesh_core::infrastructure::event_bus::{EventBus, EventBusError, PatternReceiver};

use crate::domain::peers::PeerTable;

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("Shard {0} has stopped")]
    Stopped(ShardId),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid signature on {message_type} message from {sender}")]
    InvalidSignature {
        message_type: MessageType,
        sender: ShardId,
    },

    #[error("Public key presented by {0} does not match the key on record")]
    KeyMismatch(ShardId),

    #[error("Message {0} expired before it was processed")]
    Expired(Uuid),
}

/// Collaborators a shard is wired to at construction.
#[derive(Clone)]
pub struct ShardDependencies {
    pub bus: EventBus,
    pub audit: Arc<dyn AuditSink>,
    pub executors: ExecutorRegistry,
}

#[derive(Debug)]
enum Inbound {
    Message(P2PMessage),
    Heartbeat(HeartbeatPayload),
}

#[derive(Default)]
struct LoopHandles {
    work: Option<JoinHandle<()>>,
    message: Option<JoinHandle<mpsc::UnboundedReceiver<Inbound>>>,
    heartbeat: Option<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct AgentShard {
    identity: ShardIdentity,
    shard_type: ShardType,
    scope: ShardScope,
    config: ShardRuntimeConfig,
    bus: EventBus,
    audit: Arc<dyn AuditSink>,
    executors: ExecutorRegistry,
    label: String,

    status: RwLock<ShardStatus>,
    metrics: Mutex<ShardMetrics>,
    peers: RwLock<PeerTable>,
    local_state: RwLock<LocalState>,
    active_tasks: Mutex<HashMap<WorkItemId, WorkItem>>,
    queue_depth: AtomicUsize,
    delta_version: AtomicU64,
    started_at: Mutex<Option<Instant>>,

    work_tx: mpsc::UnboundedSender<WorkItem>,
    work_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,

    cancel: CancellationToken,
    handles: Mutex<LoopHandles>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl AgentShard {
    pub fn new(
        identity: ShardIdentity,
        shard_type: ShardType,
        scope: ShardScope,
        config: ShardRuntimeConfig,
        deps: ShardDependencies,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let label = identity.shard_id().to_string();
        let local_state = LocalState::new(config.merge_strategy);

        Arc::new(Self {
            identity,
            shard_type,
            scope,
            config,
            bus: deps.bus,
            audit: deps.audit,
            executors: deps.executors,
            label,
            status: RwLock::new(ShardStatus::Initializing),
            metrics: Mutex::new(ShardMetrics::default()),
            peers: RwLock::new(PeerTable::new()),
            local_state: RwLock::new(local_state),
            active_tasks: Mutex::new(HashMap::new()),
            queue_depth: AtomicUsize::new(0),
            delta_version: AtomicU64::new(0),
            started_at: Mutex::new(None),
            work_tx,
            work_rx: tokio::sync::Mutex::new(work_rx),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(LoopHandles::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn shard_id(&self) -> ShardId {
        self.identity.shard_id()
    }

    pub fn shard_type(&self) -> ShardType {
        self.shard_type
    }

    pub fn scope(&self) -> &ShardScope {
        &self.scope
    }

    pub fn capabilities(&self) -> &[Capability] {
        self.identity.capabilities()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn status(&self) -> ShardStatus {
        *self.status.read()
    }

    /// Override the locally derived status until the next heartbeat tick.
    /// Ignored unless the shard is running.
    pub fn set_status(&self, status: ShardStatus) {
        let mut current = self.status.write();
        if current.is_running() && status.is_running() {
            *current = status;
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn load_factor(&self) -> f64 {
        self.queue_depth() as f64 / self.config.capacity.max(1) as f64
    }

    pub fn active_task_count(&self) -> usize {
        self.active_tasks.lock().len()
    }

    pub fn metrics(&self) -> ShardMetrics {
        let mut metrics = self.metrics.lock().clone();
        metrics.queue_depth = self.queue_depth();
        metrics.load_factor = self.load_factor();
        metrics.uptime_seconds = self.uptime_seconds();
        metrics
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            shard_id: self.shard_id(),
            shard_type: self.shard_type,
            status: self.status(),
            metrics: self.metrics(),
            active_task_count: self.active_task_count(),
        }
    }

    /// How this shard introduces itself to a peer.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            shard_id: self.shard_id(),
            shard_type: self.shard_type,
            capabilities: self.capabilities().to_vec(),
            public_key: self.public_key().clone(),
            load_factor: self.load_factor(),
            status: self.status(),
            last_seen: Utc::now(),
        }
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().all()
    }

    pub fn register_peer(&self, info: PeerInfo) {
        if info.shard_id == self.shard_id() {
            return;
        }
        debug!(shard_id = %self.label, peer = %info.shard_id, "Registered peer");
        self.peers.write().register(info);
    }

    pub fn forget_peer(&self, peer_id: &ShardId) {
        self.peers.write().forget(peer_id);
    }

    /// Materialized view of an entity in this shard's local state.
    pub fn entity(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        self.local_state.read().get(entity_type, entity_id)
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at
            .lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Subscribe to the bus and spawn the shard's loops. No-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), ShardError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.status() {
            ShardStatus::Initializing => {}
            status if status.is_running() => return Ok(()),
            _ => return Err(ShardError::Stopped(self.shard_id())),
        }
        let inbox_rx = self
            .inbox_rx
            .lock()
            .take()
            .ok_or(ShardError::Stopped(self.shard_id()))?;

        let mut handles = LoopHandles::default();
        // Replicas only receive offloaded work; pulling domain events too would
        // duplicate every item the original shard already owns.
        if self.shard_type != ShardType::Replica {
            let events = self.bus.subscribe(self.scope.subscription_pattern());
            handles
                .forwarders
                .push(tokio::spawn(self.clone().forward_domain_events(events)));
        }
        let shard_traffic = self.bus.subscribe(format!("{}*", SHARD_NAMESPACE));
        handles
            .forwarders
            .push(tokio::spawn(self.clone().forward_shard_traffic(shard_traffic)));
        handles.work = Some(tokio::spawn(self.clone().run_work_loop()));
        handles.message = Some(tokio::spawn(self.clone().run_message_loop(inbox_rx)));
        handles.heartbeat = Some(tokio::spawn(self.clone().run_heartbeat_loop()));

        *self.handles.lock() = handles;
        *self.started_at.lock() = Some(Instant::now());
        *self.status.write() = ShardStatus::Active;

        info!(
            shard_id = %self.label,
            shard_type = %self.shard_type,
            scope = %self.scope,
            "Shard started"
        );
        record_or_log(
            &self.audit,
            AuditRecord::new(
                self.label.clone(),
                "shard.start",
                self.label.clone(),
                json!({
                    "shard_type": self.shard_type,
                    "scope": self.scope,
                    "capabilities": self.capabilities(),
                }),
                AuditResult::Success,
            ),
        )
        .await;
        Ok(())
    }

    /// Stop the shard, handing off every task it still holds.
    ///
    /// Returns the number of work items broadcast as HANDOFF. Calling `stop` on a
    /// stopped shard returns 0.
    pub async fn stop(&self) -> usize {
        let _lifecycle = self.lifecycle.lock().await;
        if matches!(self.status(), ShardStatus::Retiring | ShardStatus::Terminated) {
            return 0;
        }
        *self.status.write() = ShardStatus::Retiring;
        info!(shard_id = %self.label, "Shard retiring");
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        // Forwarders flush their subscriptions before exiting; only then is the
        // inbox complete.
        for forwarder in handles.forwarders {
            let _ = forwarder.await;
        }
        if let Some(heartbeat) = handles.heartbeat {
            let _ = heartbeat.await;
        }

        let leftover_inbox = match handles.message {
            Some(message_loop) => message_loop.await.ok(),
            None => self.inbox_rx.lock().take(),
        };
        if let Some(mut inbox) = leftover_inbox {
            while let Ok(inbound) = inbox.try_recv() {
                self.dispatch(inbound);
            }
        }

        if let Some(mut work_loop) = handles.work {
            let finished = !self.config.stop_grace.is_zero()
                && tokio::time::timeout(self.config.stop_grace, &mut work_loop)
                    .await
                    .is_ok();
            if !finished {
                work_loop.abort();
                let _ = work_loop.await;
            }
        }

        let mut orphans: Vec<WorkItem> = self
            .active_tasks
            .lock()
            .drain()
            .map(|(_, item)| item)
            .collect();
        {
            let mut work_rx = self.work_rx.lock().await;
            while let Ok(item) = work_rx.try_recv() {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                orphans.push(item);
            }
        }

        let handed_off = orphans.len();
        for item in orphans {
            self.hand_off(item);
        }
        self.metrics.lock().tasks_handed_off += handed_off as u64;

        *self.status.write() = ShardStatus::Terminated;
        let final_metrics = self.metrics();
        self.publish_heartbeat(ShardStatus::Terminated, final_metrics, 0);

        info!(shard_id = %self.label, handed_off, "Shard terminated");
        record_or_log(
            &self.audit,
            AuditRecord::new(
                self.label.clone(),
                "shard.stop",
                self.label.clone(),
                json!({ "handed_off": handed_off }),
                AuditResult::Success,
            ),
        )
        .await;
        handed_off
    }

    // ------------------------------------------------------------------
    // Work intake
    // ------------------------------------------------------------------

    /// Queue a work item on this shard.
    pub fn submit(&self, item: WorkItem) -> Result<(), ShardError> {
        match self.status() {
            ShardStatus::Retiring | ShardStatus::Terminated => Err(ShardError::Stopped(self.shard_id())),
            _ => {
                self.enqueue(item);
                Ok(())
            }
        }
    }

    fn enqueue(&self, item: WorkItem) {
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(item)) = self.work_tx.send(item) {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            error!(shard_id = %self.label, work_item = %item.id, "Work queue closed, item lost");
        }
    }

    async fn forward_domain_events(self: Arc<Self>, mut events: PatternReceiver) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = events.recv() => next,
            };
            match next {
                Ok(event) => self.accept_domain_event(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let flushed = flush_buffered(&mut events, |event| self.accept_domain_event(event));
        debug!(shard_id = %self.label, flushed, "Domain forwarder stopped");
    }

    fn accept_domain_event(&self, event: BusEvent) {
        if event.is_reserved() || !self.scope.matches(&event) {
            return;
        }
        let item = WorkItem::from_event(&event, self.shard_id());
        debug!(
            shard_id = %self.label,
            work_item = %item.id,
            event_type = %event.event_type,
            "Enqueued domain event"
        );
        self.enqueue(item);
    }

    async fn forward_shard_traffic(self: Arc<Self>, mut traffic: PatternReceiver) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = traffic.recv() => next,
            };
            match next {
                Ok(event) => self.route_shard_event(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let flushed = flush_buffered(&mut traffic, |event| self.route_shard_event(event));
        debug!(shard_id = %self.label, flushed, "Shard traffic forwarder stopped");
    }

    fn route_shard_event(&self, event: BusEvent) {
        if event.event_type == HEARTBEAT_TOPIC {
            match serde_json::from_value::<HeartbeatPayload>(event.payload) {
                Ok(heartbeat) if heartbeat.shard_id != self.shard_id() => {
                    let _ = self.inbox_tx.send(Inbound::Heartbeat(heartbeat));
                }
                Ok(_) => {}
                Err(e) => debug!(shard_id = %self.label, error = %e, "Ignoring malformed heartbeat"),
            }
            return;
        }

        match P2PMessage::from_bus_event(&event) {
            Ok(message) => {
                if message.sender_id != self.shard_id() && message.is_for(self.shard_id()) {
                    let _ = self.inbox_tx.send(Inbound::Message(message));
                }
            }
            Err(MessageError::NotP2P(_)) => {}
            Err(e) => {
                self.metrics.lock().messages_dropped += 1;
                metrics::counter!("shardmesh_messages_dropped_total", "shard" => self.label.clone())
                    .increment(1);
                warn!(shard_id = %self.label, topic = %event.event_type, error = %e, "Dropping undecodable P2P message");
            }
        }
    }

    // ------------------------------------------------------------------
    // Work loop
    // ------------------------------------------------------------------

    async fn run_work_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let next = {
                let mut work_rx = self.work_rx.lock().await;
                tokio::time::timeout(self.config.dequeue_timeout, work_rx.recv()).await
            };
            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => continue,
            };
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);

            if self.status() == ShardStatus::Overloaded && item.hops < self.config.max_offload_hops {
                self.offload(item).await;
            } else {
                self.execute_locally(item).await;
            }
        }
        debug!(shard_id = %self.label, "Work loop stopped");
    }

    /// Least-loaded running peer, preferring those that hold the item's capability.
    fn offload_target(&self, item: &WorkItem) -> Option<ShardId> {
        let peers = self.peers.read();
        peers
            .least_loaded(item.required_capability)
            .or_else(|| peers.least_loaded(None))
    }

    async fn offload(&self, item: WorkItem) {
        let target = self.offload_target(&item);
        let Some(peer_id) = target else {
            debug!(shard_id = %self.label, work_item = %item.id, "No peer available for offload, executing locally");
            self.execute_locally(item).await;
            return;
        };

        let payload = TaskPayload {
            work_item: item.forwarded(),
            reason: "overloaded".to_string(),
            preferred_adopter: None,
        };
        let sent = serde_json::to_value(&payload)
            .map_err(ShardError::from)
            .and_then(|payload| self.send_message(MessageType::Request, Some(peer_id), payload));

        match sent {
            Ok(_) => {
                self.metrics.lock().tasks_offloaded += 1;
                metrics::counter!("shardmesh_tasks_offloaded_total", "shard" => self.label.clone())
                    .increment(1);
                info!(shard_id = %self.label, work_item = %item.id, peer = %peer_id, "Offloaded work item");
            }
            Err(e) => {
                warn!(shard_id = %self.label, work_item = %item.id, error = %e, "Offload failed, executing locally");
                self.execute_locally(item).await;
            }
        }
    }

    async fn execute_locally(&self, item: WorkItem) {
        let item_id = item.id;
        self.active_tasks.lock().insert(item_id, item.clone());

        let started = Instant::now();
        let executor = self.executors.resolve_for(&item);
        let outcome = AssertUnwindSafe(executor.execute(&item))
            .catch_unwind()
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.active_tasks.lock().remove(&item_id);

        let succeeded = match outcome {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(shard_id = %self.label, work_item = %item_id, work_type = %item.work_type, error = %e, "Work item failed");
                false
            }
            Err(_) => {
                error!(shard_id = %self.label, work_item = %item_id, work_type = %item.work_type, "Executor panicked");
                false
            }
        };

        {
            let mut metrics = self.metrics.lock();
            if succeeded {
                metrics.tasks_completed += 1;
            } else {
                metrics.tasks_failed += 1;
            }
            metrics.record_latency(latency_ms);
        }
        let outcome_label = if succeeded { "completed" } else { "failed" };
        metrics::counter!(
            "shardmesh_tasks_total",
            "shard" => self.label.clone(),
            "outcome" => outcome_label
        )
        .increment(1);
        metrics::histogram!("shardmesh_task_latency_ms", "shard" => self.label.clone()).record(latency_ms);
    }

    fn hand_off(&self, item: WorkItem) {
        let adopter = self.offload_target(&item);
        let payload = TaskPayload {
            work_item: item.forwarded(),
            reason: "shard_retiring".to_string(),
            preferred_adopter: adopter,
        };
        let sent = serde_json::to_value(&payload)
            .map_err(ShardError::from)
            .and_then(|payload| self.send_message(MessageType::Handoff, None, payload));
        match sent {
            Ok(_) => debug!(shard_id = %self.label, work_item = %item.id, adopter = ?adopter, "Handed off work item"),
            Err(e) => error!(shard_id = %self.label, work_item = %item.id, error = %e, "Failed to hand off work item"),
        }
    }

    // ------------------------------------------------------------------
    // Message loop
    // ------------------------------------------------------------------

    async fn run_message_loop(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
    ) -> mpsc::UnboundedReceiver<Inbound> {
        while !self.cancel.is_cancelled() {
            match tokio::time::timeout(self.config.dequeue_timeout, inbox.recv()).await {
                Ok(Some(inbound)) => self.dispatch(inbound),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        debug!(shard_id = %self.label, "Message loop stopped");
        inbox
    }

    fn dispatch(&self, inbound: Inbound) {
        let message = match inbound {
            Inbound::Heartbeat(heartbeat) => {
                self.peers.write().observe_heartbeat(&heartbeat);
                return;
            }
            Inbound::Message(message) => message,
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_message(&message)));
        match outcome {
            Ok(Ok(())) => {
                self.metrics.lock().messages_processed += 1;
            }
            Ok(Err(e)) => {
                self.metrics.lock().messages_dropped += 1;
                metrics::counter!("shardmesh_messages_dropped_total", "shard" => self.label.clone())
                    .increment(1);
                warn!(
                    shard_id = %self.label,
                    message_id = %message.message_id,
                    message_type = %message.message_type,
                    sender = %message.sender_id,
                    error = %e,
                    "Dropping P2P message"
                );
            }
            Err(_) => {
                self.metrics.lock().messages_dropped += 1;
                error!(shard_id = %self.label, message_id = %message.message_id, "Message handler panicked");
            }
        }
    }

    fn authenticate(&self, message: &P2PMessage) -> Result<(), ShardError> {
        if message.is_expired(Utc::now()) {
            return Err(ShardError::Expired(message.message_id));
        }
        if let Some(known) = self.peers.read().public_key(&message.sender_id) {
            if known != &message.sender_public_key {
                return Err(ShardError::KeyMismatch(message.sender_id));
            }
        }
        if !message.verify(&message.sender_public_key) {
            return Err(ShardError::InvalidSignature {
                message_type: message.message_type,
                sender: message.sender_id,
            });
        }
        Ok(())
    }

    fn handle_message(&self, message: &P2PMessage) -> Result<(), ShardError> {
        self.authenticate(message)?;

        match message.message_type {
            MessageType::Offer => {
                let offer: OfferPayload = message.decode_payload()?;
                self.peers
                    .write()
                    .observe_offer(message.sender_id, &message.sender_public_key, &offer);
            }
            MessageType::Need => {
                let need: NeedPayload = message.decode_payload()?;
                if self.can_help(&need) {
                    self.send_offer(
                        Some(message.sender_id),
                        need.required_capability,
                        json!({ "in_reply_to": message.message_id, "need_type": need.need_type }),
                    )?;
                }
            }
            MessageType::Request | MessageType::Handoff => {
                let task: TaskPayload = message.decode_payload()?;
                if task.may_adopt(self.shard_id()) {
                    self.adopt(task.work_item, message.message_type, message.sender_id);
                }
            }
            MessageType::StateDelta => {
                let delta: StateDelta = message.decode_payload()?;
                let key = delta.entity_key();
                let changed = self.local_state.write().apply(delta);
                debug!(shard_id = %self.label, entity = %key, changed, "Merged state delta");
            }
            MessageType::Negotiation | MessageType::Response => {
                debug!(
                    shard_id = %self.label,
                    message_type = %message.message_type,
                    sender = %message.sender_id,
                    "Received informational message"
                );
            }
        }
        Ok(())
    }

    fn can_help(&self, need: &NeedPayload) -> bool {
        self.load_factor() < self.config.help_threshold
            && need
                .required_capability
                .map_or(true, |c| self.identity.has_capability(c))
    }

    fn adopt(&self, item: WorkItem, via: MessageType, from: ShardId) {
        self.metrics.lock().tasks_adopted += 1;
        metrics::counter!("shardmesh_tasks_adopted_total", "shard" => self.label.clone()).increment(1);
        debug!(shard_id = %self.label, work_item = %item.id, via = %via, from = %from, "Adopted work item");
        self.enqueue(item);
    }

    // ------------------------------------------------------------------
    // Outbound messaging
    // ------------------------------------------------------------------

    /// Sign `payload` as a message of `message_type` and publish it on the bus.
    pub fn send_message(
        &self,
        message_type: MessageType,
        recipient_id: Option<ShardId>,
        payload: Value,
    ) -> Result<P2PMessage, ShardError> {
        let message = P2PMessage::signed(
            &self.identity,
            message_type,
            recipient_id,
            payload,
            self.config.message_ttl_seconds,
        )?;
        self.bus.publish(message.to_bus_event()?);
        metrics::counter!("shardmesh_messages_sent_total", "type" => message_type.as_str()).increment(1);
        Ok(message)
    }

    fn send_offer(
        &self,
        recipient_id: Option<ShardId>,
        capability: Option<Capability>,
        details: Value,
    ) -> Result<P2PMessage, ShardError> {
        let offer = OfferPayload {
            capability,
            capabilities: self.capabilities().to_vec(),
            shard_type: self.shard_type,
            load_factor: self.load_factor(),
            details,
        };
        self.send_message(MessageType::Offer, recipient_id, serde_json::to_value(offer)?)
    }

    /// Broadcast an OFFER so peers refresh their view of this shard.
    pub fn offer_capability(&self, capability: Capability, details: Value) -> Result<P2PMessage, ShardError> {
        self.send_offer(None, Some(capability), details)
    }

    /// Broadcast a NEED. Peers able to help answer with an OFFER; nothing blocks.
    pub fn request_help(
        &self,
        need_type: impl Into<String>,
        required_capability: Option<Capability>,
        details: Value,
    ) -> Result<P2PMessage, ShardError> {
        let need = NeedPayload {
            need_type: need_type.into(),
            required_capability,
            details,
        };
        self.send_message(MessageType::Need, None, serde_json::to_value(need)?)
    }

    /// Build a delta originating from this shard with the next local version.
    pub fn new_delta(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: DeltaOperation,
        changes: Map<String, Value>,
    ) -> StateDelta {
        let version = self.delta_version.fetch_add(1, Ordering::SeqCst) + 1;
        StateDelta::new(self.shard_id(), entity_type, entity_id, operation, changes, version)
    }

    /// Apply `delta` locally and broadcast it to peers.
    pub fn publish_state_delta(&self, delta: StateDelta) -> Result<P2PMessage, ShardError> {
        self.local_state.write().apply(delta.clone());
        self.send_message(MessageType::StateDelta, None, serde_json::to_value(delta)?)
    }

    // ------------------------------------------------------------------
    // Heartbeat loop
    // ------------------------------------------------------------------

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat();
                }
            }
        }
        debug!(shard_id = %self.label, "Heartbeat loop stopped");
    }

    /// Recompute load and status, then broadcast a heartbeat. Returns the status.
    pub fn heartbeat(&self) -> ShardStatus {
        let load_factor = self.load_factor();
        let active_task_count = self.active_task_count();
        let derived = ShardStatus::from_load(load_factor, active_task_count, self.config.overload_threshold);

        let status = {
            let mut status = self.status.write();
            if status.is_running() && *status != derived {
                info!(shard_id = %self.label, from = %*status, to = %derived, load_factor, "Shard status changed");
                *status = derived;
            }
            *status
        };

        let metrics = {
            let mut metrics = self.metrics.lock();
            metrics.load_factor = load_factor;
            metrics.queue_depth = self.queue_depth();
            metrics.uptime_seconds = self.uptime_seconds();
            metrics.clone()
        };
        metrics::gauge!("shardmesh_shard_load_factor", "shard" => self.label.clone()).set(load_factor);
        metrics::gauge!("shardmesh_shard_queue_depth", "shard" => self.label.clone())
            .set(metrics.queue_depth as f64);

        self.publish_heartbeat(status, metrics, active_task_count);
        status
    }

    fn publish_heartbeat(&self, status: ShardStatus, metrics: ShardMetrics, active_task_count: usize) {
        let payload = HeartbeatPayload {
            shard_id: self.shard_id(),
            shard_type: self.shard_type,
            status,
            capabilities: self.capabilities().to_vec(),
            public_key: self.public_key().clone(),
            metrics,
            active_task_count,
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => {
                self.bus.publish(BusEvent::new(HEARTBEAT_TOPIC, self.label.clone(), payload));
            }
            Err(e) => warn!(shard_id = %self.label, error = %e, "Failed to encode heartbeat"),
        }
    }
}

/// Route every event already buffered on `receiver` without waiting for more.
fn flush_buffered(receiver: &mut PatternReceiver, mut route: impl FnMut(BusEvent)) -> usize {
    let mut flushed = 0;
    loop {
        match receiver.try_recv() {
            Ok(event) => {
                route(event);
                flushed += 1;
            }
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => return flushed,
        }
    }
}
