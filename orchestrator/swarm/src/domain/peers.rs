// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Peer Table
//!
//! A shard's local, advisory view of its peers. It is fed by coordinator
//! introductions, OFFER messages and heartbeats, and read when picking an
//! offload target. Entries may be stale; nothing here is authoritative.

use chrono::Utc;
use shardmesh_core::domain::capability::Capability;
use shardmesh_core::domain::identity::{PublicKey, ShardId};
use shardmesh_core::domain::message::OfferPayload;
use shardmesh_core::domain::shard::{HeartbeatPayload, PeerInfo, ShardStatus};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: HashMap<ShardId, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer entry.
    pub fn register(&mut self, info: PeerInfo) {
        self.peers.insert(info.shard_id, info);
    }

    pub fn forget(&mut self, shard_id: &ShardId) -> Option<PeerInfo> {
        self.peers.remove(shard_id)
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<&PeerInfo> {
        self.peers.get(shard_id)
    }

    pub fn public_key(&self, shard_id: &ShardId) -> Option<&PublicKey> {
        self.peers.get(shard_id).map(|p| &p.public_key)
    }

    /// Fold an OFFER into the table. The public key on record, if any, is kept.
    pub fn observe_offer(&mut self, sender: ShardId, sender_key: &PublicKey, offer: &OfferPayload) {
        let now = Utc::now();
        let entry = self.peers.entry(sender).or_insert_with(|| PeerInfo {
            shard_id: sender,
            shard_type: offer.shard_type,
            capabilities: Vec::new(),
            public_key: sender_key.clone(),
            load_factor: offer.load_factor,
            status: ShardStatus::Active,
            last_seen: now,
        });
        for capability in offer.capabilities.iter().chain(offer.capability.iter()) {
            if !entry.capabilities.contains(capability) {
                entry.capabilities.push(*capability);
            }
        }
        entry.load_factor = offer.load_factor;
        entry.last_seen = now;
    }

    /// Fold a heartbeat into the table. Unknown running senders are learned; a
    /// heartbeat from a shard that is no longer running drops its entry.
    pub fn observe_heartbeat(&mut self, heartbeat: &HeartbeatPayload) {
        if !heartbeat.status.is_running() {
            self.peers.remove(&heartbeat.shard_id);
            return;
        }
        let now = Utc::now();
        let entry = self.peers.entry(heartbeat.shard_id).or_insert_with(|| PeerInfo {
            shard_id: heartbeat.shard_id,
            shard_type: heartbeat.shard_type,
            capabilities: heartbeat.capabilities.clone(),
            public_key: heartbeat.public_key.clone(),
            load_factor: heartbeat.metrics.load_factor,
            status: heartbeat.status,
            last_seen: now,
        });
        entry.load_factor = heartbeat.metrics.load_factor;
        entry.status = heartbeat.status;
        entry.capabilities = heartbeat.capabilities.clone();
        entry.last_seen = now;
    }

    /// Running peer with the lowest reported load, restricted to peers holding
    /// `capability` when one is given. Ties go to the smaller shard id.
    pub fn least_loaded(&self, capability: Option<Capability>) -> Option<ShardId> {
        self.peers
            .values()
            .filter(|p| p.status.is_running())
            .filter(|p| capability.map_or(true, |c| p.has_capability(c)))
            .min_by(|a, b| {
                a.load_factor
                    .partial_cmp(&b.load_factor)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.shard_id.cmp(&b.shard_id))
            })
            .map(|p| p.shard_id)
    }

    pub fn all(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmesh_core::domain::identity::ShardIdentity;
    use shardmesh_core::domain::shard::{ShardMetrics, ShardType};

    fn peer(load: f64, capabilities: Vec<Capability>) -> PeerInfo {
        let identity = ShardIdentity::generate(capabilities.clone(), 1);
        PeerInfo {
            shard_id: identity.shard_id(),
            shard_type: ShardType::Domain,
            capabilities,
            public_key: identity.public_key().clone(),
            load_factor: load,
            status: ShardStatus::Active,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_least_loaded_picks_lowest_load() {
        let mut table = PeerTable::new();
        let busy = peer(0.9, vec![Capability::SelfHealing]);
        let calm = peer(0.1, vec![Capability::SelfHealing]);
        table.register(busy);
        table.register(calm.clone());

        assert_eq!(table.least_loaded(None), Some(calm.shard_id));
    }

    #[test]
    fn test_least_loaded_respects_capability() {
        let mut table = PeerTable::new();
        let healer = peer(0.6, vec![Capability::SelfHealing]);
        let sentinel = peer(0.0, vec![Capability::SecuritySentinel]);
        table.register(healer.clone());
        table.register(sentinel);

        assert_eq!(table.least_loaded(Some(Capability::SelfHealing)), Some(healer.shard_id));
        assert_eq!(table.least_loaded(Some(Capability::Scheduling)), None);
    }

    #[test]
    fn test_least_loaded_skips_stopped_peers() {
        let mut table = PeerTable::new();
        let mut retiring = peer(0.0, vec![]);
        retiring.status = ShardStatus::Retiring;
        table.register(retiring);
        assert_eq!(table.least_loaded(None), None);
    }

    #[test]
    fn test_empty_table_has_no_target() {
        assert_eq!(PeerTable::new().least_loaded(None), None);
    }

    #[test]
    fn test_offer_merges_capabilities_and_keeps_key() {
        let mut table = PeerTable::new();
        let known = peer(0.5, vec![Capability::SelfHealing]);
        table.register(known.clone());

        let other_key = ShardIdentity::generate(vec![], 1).public_key().clone();
        table.observe_offer(
            known.shard_id,
            &other_key,
            &OfferPayload {
                capability: Some(Capability::Scheduling),
                capabilities: vec![Capability::SelfHealing],
                shard_type: ShardType::Domain,
                load_factor: 0.2,
                details: serde_json::Value::Null,
            },
        );

        let updated = table.get(&known.shard_id).unwrap();
        assert_eq!(updated.capabilities, vec![Capability::SelfHealing, Capability::Scheduling]);
        assert_eq!(updated.load_factor, 0.2);
        assert_eq!(updated.public_key, known.public_key);
    }

    fn heartbeat(peer: &PeerInfo, status: ShardStatus) -> HeartbeatPayload {
        HeartbeatPayload {
            shard_id: peer.shard_id,
            shard_type: ShardType::Domain,
            status,
            capabilities: peer.capabilities.clone(),
            public_key: peer.public_key.clone(),
            metrics: ShardMetrics::default(),
            active_task_count: 0,
        }
    }

    #[test]
    fn test_terminated_heartbeat_removes_peer() {
        let mut table = PeerTable::new();
        let leaving = peer(0.3, vec![Capability::SelfHealing]);
        table.register(leaving.clone());

        table.observe_heartbeat(&heartbeat(&leaving, ShardStatus::Terminated));

        assert!(table.is_empty());
        assert!(table.public_key(&leaving.shard_id).is_none());
    }

    #[test]
    fn test_stopped_stranger_is_not_learned() {
        let mut table = PeerTable::new();
        for status in [ShardStatus::Retiring, ShardStatus::Terminated, ShardStatus::Initializing] {
            table.observe_heartbeat(&heartbeat(&peer(0.0, vec![]), status));
        }
        assert!(table.is_empty());

        let newcomer = peer(0.0, vec![]);
        table.observe_heartbeat(&heartbeat(&newcomer, ShardStatus::Active));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&newcomer.shard_id).unwrap().public_key, newcomer.public_key);
    }

    #[test]
    fn test_heartbeat_updates_load_and_status() {
        let mut table = PeerTable::new();
        let known = peer(0.0, vec![Capability::SelfHealing]);
        table.register(known.clone());

        table.observe_heartbeat(&HeartbeatPayload {
            shard_id: known.shard_id,
            shard_type: ShardType::Domain,
            status: ShardStatus::Overloaded,
            capabilities: vec![Capability::SelfHealing],
            public_key: known.public_key.clone(),
            metrics: ShardMetrics {
                load_factor: 1.5,
                ..ShardMetrics::default()
            },
            active_task_count: 3,
        });

        let updated = table.get(&known.shard_id).unwrap();
        assert_eq!(updated.status, ShardStatus::Overloaded);
        assert_eq!(updated.load_factor, 1.5);
    }
}
