// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Shard Scope
//!
//! A [`ShardScope`] is the declarative predicate selecting which bus events a
//! shard copies into its own work queue. Every configured field is a constraint;
//! the rules are applied conjunctively by [`ShardScope::matches`]:
//!
//! | Field | Rule |
//! |-------|------|
//! | `domain` | event `source` must start with it (case-sensitive) |
//! | `workload_type = preventive` | reject event types containing `"alert"` |
//! | `workload_type = incident_response` | reject event types containing `"proactive"` |
//! | `geography` | payload `geography`, when present, must equal it |
//! | `resource_pattern` | payload `resource`, when present, must match (`x*` prefix or exact) |
//!
//! A scope with nothing set matches every event. Build one with
//! [`ShardScope::open`] so the intent is explicit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::domain::events::BusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    Preventive,
    IncidentResponse,
    Batch,
    Interactive,
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadType::Preventive => "preventive",
            WorkloadType::IncidentResponse => "incident_response",
            WorkloadType::Batch => "batch",
            WorkloadType::Interactive => "interactive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geography: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_type: Option<WorkloadType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pattern: Option<String>,
    /// Free-form policy constraints carried for the executor; not evaluated here.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub policy_constraints: HashMap<String, String>,
}

impl ShardScope {
    /// A scope that owns every event.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::default()
        }
    }

    pub fn for_workload(workload_type: WorkloadType) -> Self {
        Self {
            workload_type: Some(workload_type),
            ..Self::default()
        }
    }

    pub fn with_geography(mut self, geography: impl Into<String>) -> Self {
        self.geography = Some(geography.into());
        self
    }

    pub fn with_resource_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.resource_pattern = Some(pattern.into());
        self
    }

    pub fn is_open(&self) -> bool {
        self.domain.is_none()
            && self.geography.is_none()
            && self.workload_type.is_none()
            && self.resource_pattern.is_none()
    }

    /// Bus subscription pattern implied by this scope.
    pub fn subscription_pattern(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}.*", domain),
            None => "*".to_string(),
        }
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(domain) = &self.domain {
            if !event.source.starts_with(domain.as_str()) {
                return false;
            }
        }

        match self.workload_type {
            Some(WorkloadType::Preventive) if event.event_type.contains("alert") => return false,
            Some(WorkloadType::IncidentResponse) if event.event_type.contains("proactive") => {
                return false
            }
            _ => {}
        }

        if let Some(geography) = &self.geography {
            if let Some(event_geo) = event.payload.get("geography").and_then(|g| g.as_str()) {
                if event_geo != geography {
                    return false;
                }
            }
        }

        if let Some(pattern) = &self.resource_pattern {
            if let Some(resource) = event.payload.get("resource").and_then(|r| r.as_str()) {
                let matched = match pattern.strip_suffix('*') {
                    Some(prefix) => resource.starts_with(prefix),
                    None => resource == pattern,
                };
                if !matched {
                    return false;
                }
            }
        }

        true
    }
}

impl fmt::Display for ShardScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            return f.write_str("open");
        }
        let mut parts = Vec::new();
        if let Some(domain) = &self.domain {
            parts.push(format!("domain={}", domain));
        }
        if let Some(geography) = &self.geography {
            parts.push(format!("geo={}", geography));
        }
        if let Some(workload) = &self.workload_type {
            parts.push(format!("workload={}", workload));
        }
        if let Some(pattern) = &self.resource_pattern {
            parts.push(format!("resource={}", pattern));
        }
        f.write_str(&parts.join(","))
    }
}
