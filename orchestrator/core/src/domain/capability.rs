// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Capability Vocabulary
//!
//! A [`Capability`] is a tagged skill a shard advertises to its peers. The set is
//! closed: peers match on it when choosing an offload target, and work items are
//! stamped with the capability inferred from their event type.
//!
//! ## Inference
//!
//! [`Capability::infer`] maps an event type to a capability by keyword. The event
//! type is split into tokens on every non-alphanumeric character and a keyword
//! must equal a whole token, so `app.login` does not count as logging. The first
//! matching rule wins; unknown event types infer nothing and may be executed by
//! any shard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed vocabulary of things a shard can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    MemorySteward,
    SelfHealing,
    SecuritySentinel,
    ResourceOptimizer,
    DataIngestion,
    Observability,
    Scheduling,
}

/// Keyword table consulted by [`Capability::infer`], in priority order.
const INFERENCE_RULES: &[(&[&str], Capability)] = &[
    (&["security", "intrusion", "threat", "auth", "authentication"], Capability::SecuritySentinel),
    (&["heal", "healing", "crash", "crashed", "restart", "failure", "failed"], Capability::SelfHealing),
    (&["memory", "cache", "gc", "oom", "leak"], Capability::MemorySteward),
    (&["cpu", "disk", "resource", "resources", "quota"], Capability::ResourceOptimizer),
    (&["ingest", "ingestion", "import"], Capability::DataIngestion),
    (&["metric", "metrics", "log", "logs", "trace", "traces", "tracing"], Capability::Observability),
    (&["schedule", "scheduled", "cron"], Capability::Scheduling),
];

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::MemorySteward,
        Capability::SelfHealing,
        Capability::SecuritySentinel,
        Capability::ResourceOptimizer,
        Capability::DataIngestion,
        Capability::Observability,
        Capability::Scheduling,
    ];

    /// Infer the capability needed to handle an event of `event_type`.
    ///
    /// Matching is case-insensitive and token-wise against a keyword table.
    pub fn infer(event_type: &str) -> Option<Capability> {
        let lowered = event_type.to_ascii_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        INFERENCE_RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| tokens.contains(k)))
            .map(|(_, capability)| *capability)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::MemorySteward => "MEMORY_STEWARD",
            Capability::SelfHealing => "SELF_HEALING",
            Capability::SecuritySentinel => "SECURITY_SENTINEL",
            Capability::ResourceOptimizer => "RESOURCE_OPTIMIZER",
            Capability::DataIngestion => "DATA_INGESTION",
            Capability::Observability => "OBSERVABILITY",
            Capability::Scheduling => "SCHEDULING",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown capability: {0}")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_by_keyword() {
        assert_eq!(Capability::infer("security.intrusion_detected"), Some(Capability::SecuritySentinel));
        assert_eq!(Capability::infer("app.service_crash"), Some(Capability::SelfHealing));
        assert_eq!(Capability::infer("infra.MEMORY_pressure"), Some(Capability::MemorySteward));
        assert_eq!(Capability::infer("infra.cpu_high"), Some(Capability::ResourceOptimizer));
        assert_eq!(Capability::infer("app.user_signup"), None);
    }

    #[test]
    fn test_security_wins_over_failure() {
        // "auth_failure" mentions both; the security rule is consulted first
        assert_eq!(Capability::infer("app.auth_failure"), Some(Capability::SecuritySentinel));
    }

    #[test]
    fn test_keywords_match_whole_tokens_only() {
        assert_eq!(Capability::infer("app.login"), None);
        assert_eq!(Capability::infer("shop.catalog_update"), None);
        assert_eq!(Capability::infer("blog.author_changed"), None);
        assert_eq!(Capability::infer("infra.gcp_quota"), Some(Capability::ResourceOptimizer));
        assert_eq!(Capability::infer("app.gc-pause"), Some(Capability::MemorySteward));
        assert_eq!(Capability::infer("app.log_rotation"), Some(Capability::Observability));
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("self-healing".parse::<Capability>().unwrap(), Capability::SelfHealing);
        assert_eq!("MEMORY_STEWARD".parse::<Capability>().unwrap(), Capability::MemorySteward);
        assert!("teleportation".parse::<Capability>().is_err());
        assert_eq!(Capability::SecuritySentinel.to_string(), "SECURITY_SENTINEL");
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&Capability::DataIngestion).unwrap();
        assert_eq!(json, "\"DATA_INGESTION\"");
    }
}
