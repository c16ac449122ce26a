// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Peer-to-Peer Messages
//!
//! Shards talk to each other exclusively through signed [`P2PMessage`]s published
//! on the bus under `shard.p2p.<type>`. A message is immutable once signed: the
//! signature covers the canonical JSON encoding of every other field.
//!
//! ## Message Types
//!
//! | Type | Payload | Receiver action |
//! |------|---------|-----------------|
//! | `offer` | [`OfferPayload`] | update peer table |
//! | `need` | [`NeedPayload`] | reply with an offer if able to help |
//! | `request` | [`TaskPayload`] | adopt the carried work item |
//! | `state_delta` | [`crate::domain::delta::StateDelta`] | merge into local state |
//! | `handoff` | [`TaskPayload`] | adopt the orphaned work item |
//! | `negotiation` | free-form | logged |
//! | `response` | free-form | logged |

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::domain::capability::Capability;
use crate::domain::events::{p2p_topic, BusEvent};
use crate::domain::identity::{PublicKey, ShardId, ShardIdentity};
use crate::domain::shard::ShardType;
use crate::domain::work::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Offer,
    Need,
    Request,
    StateDelta,
    Handoff,
    Negotiation,
    Response,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Need => "need",
            MessageType::Request => "request",
            MessageType::StateDelta => "state_delta",
            MessageType::Handoff => "handoff",
            MessageType::Negotiation => "negotiation",
            MessageType::Response => "response",
        }
    }

    pub fn topic(&self) -> String {
        p2p_topic(self.as_str())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Event {0} is not a P2P message")]
    NotP2P(String),
}

/// Signed envelope exchanged between shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2PMessage {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: ShardId,
    pub sender_public_key: PublicKey,
    /// `None` means any shard may act on the message.
    pub recipient_id: Option<ShardId>,
    pub payload: Value,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub ttl_seconds: u64,
}

/// Every field except the signature, in a fixed order.
#[derive(Serialize)]
struct SignedFields<'a> {
    message_id: &'a Uuid,
    message_type: &'a MessageType,
    sender_id: &'a ShardId,
    sender_public_key: &'a PublicKey,
    recipient_id: &'a Option<ShardId>,
    payload: &'a Value,
    timestamp: &'a DateTime<Utc>,
    ttl_seconds: u64,
}

impl P2PMessage {
    /// Build and sign a message from `identity`.
    pub fn signed(
        identity: &ShardIdentity,
        message_type: MessageType,
        recipient_id: Option<ShardId>,
        payload: Value,
        ttl_seconds: u64,
    ) -> Result<Self, MessageError> {
        let mut message = Self {
            message_id: Uuid::new_v4(),
            message_type,
            sender_id: identity.shard_id(),
            sender_public_key: identity.public_key().clone(),
            recipient_id,
            payload,
            signature: String::new(),
            timestamp: Utc::now(),
            ttl_seconds,
        };
        message.signature = identity.sign(&message.signing_bytes()?);
        Ok(message)
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(&SignedFields {
            message_id: &self.message_id,
            message_type: &self.message_type,
            sender_id: &self.sender_id,
            sender_public_key: &self.sender_public_key,
            recipient_id: &self.recipient_id,
            payload: &self.payload,
            timestamp: &self.timestamp,
            ttl_seconds: self.ttl_seconds,
        })
        .map_err(MessageError::Encode)
    }

    pub fn verify(&self, sender_public_key: &PublicKey) -> bool {
        match self.signing_bytes() {
            Ok(bytes) => ShardIdentity::verify(&bytes, &self.signature, sender_public_key),
            Err(_) => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = i64::try_from(self.ttl_seconds).ok().and_then(Duration::try_seconds) else {
            return false;
        };
        self.timestamp
            .checked_add_signed(ttl)
            .is_some_and(|expires_at| expires_at < now)
    }

    pub fn is_for(&self, shard_id: ShardId) -> bool {
        self.recipient_id.map_or(true, |r| r == shard_id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(self.payload.clone()).map_err(MessageError::Malformed)
    }

    pub fn to_bus_event(&self) -> Result<BusEvent, MessageError> {
        let payload = serde_json::to_value(self).map_err(MessageError::Encode)?;
        Ok(BusEvent {
            event_type: self.message_type.topic(),
            source: self.sender_id.to_string(),
            payload,
            timestamp: self.timestamp,
        })
    }

    pub fn from_bus_event(event: &BusEvent) -> Result<Self, MessageError> {
        if !event.event_type.starts_with("shard.p2p.") {
            return Err(MessageError::NotP2P(event.event_type.clone()));
        }
        serde_json::from_value(event.payload.clone()).map_err(MessageError::Malformed)
    }
}

/// Capability advertisement, sent as a broadcast or in reply to a NEED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    /// Capability being offered specifically, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    pub capabilities: Vec<Capability>,
    pub shard_type: ShardType,
    pub load_factor: f64,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedPayload {
    pub need_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<Capability>,
    #[serde(default)]
    pub details: Value,
}

/// Carries a work item for REQUEST (offload) and HANDOFF (shutdown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub work_item: WorkItem,
    pub reason: String,
    /// For broadcast handoffs: the peer the sender picked to adopt the item.
    /// `None` lets any receiver adopt it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_adopter: Option<ShardId>,
}

impl TaskPayload {
    pub fn may_adopt(&self, shard_id: ShardId) -> bool {
        self.preferred_adopter.map_or(true, |p| p == shard_id)
    }
}
