//! Outbox records and their lifecycle states.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::PLATFORM_SCOPE;
use crate::signature::SignatureAlgorithm;

/// Lifecycle state of an outbox message.
///
/// `Failed` means a cycle failed and a retry is scheduled; such messages are
/// eligible again once `next_attempt_at` passes. `Dispatched` and
/// `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Dispatching,
    Dispatched,
    Failed,
    DeadLettered,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatching => "dispatching",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "dispatching" => Some(OutboxStatus::Dispatching),
            "dispatched" => Some(OutboxStatus::Dispatched),
            "failed" => Some(OutboxStatus::Failed),
            "dead_lettered" => Some(OutboxStatus::DeadLettered),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Dispatched | OutboxStatus::DeadLettered)
    }

    /// Waiting for a dispatch attempt (first or retry).
    pub fn is_waiting(self) -> bool {
        matches!(self, OutboxStatus::Pending | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an aggregate: versions are counted per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub tenant_id: Option<String>,
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl AggregateKey {
    pub fn new(
        tenant_id: Option<&str>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.map(str::to_string),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl std::fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id.as_deref().unwrap_or(PLATFORM_SCOPE),
            self.aggregate_type,
            self.aggregate_id
        )
    }
}

/// Where a message must be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Internal message bus topic
    Bus { topic: String },
    /// Tenant-configured HTTP endpoint
    Webhook {
        endpoint: String,
        /// Name of the signing secret in the secret provider
        secret_name: String,
        #[serde(default)]
        algorithm: SignatureAlgorithm,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Overrides the dispatcher's per-attempt timeout
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl Destination {
    pub fn bus(topic: impl Into<String>) -> Self {
        Destination::Bus {
            topic: topic.into(),
        }
    }

    pub fn webhook(endpoint: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Destination::Webhook {
            endpoint: endpoint.into(),
            secret_name: secret_name.into(),
            algorithm: SignatureAlgorithm::default(),
            headers: HashMap::new(),
            timeout_ms: None,
        }
    }

    /// Stable name used for per-destination state and idempotency markers.
    pub fn name(&self) -> String {
        match self {
            Destination::Bus { topic } => format!("bus:{}", topic),
            Destination::Webhook { endpoint, .. } => format!("webhook:{}", endpoint),
        }
    }
}

/// Delivery progress of one destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationState {
    pub name: String,
    pub attempts: u32,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl DestinationState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempts: 0,
            acknowledged: false,
            last_error: None,
            acknowledged_at: None,
        }
    }

    pub fn apply(&mut self, outcome: &DestinationOutcome) {
        match outcome {
            DestinationOutcome::Acknowledged | DestinationOutcome::Deduplicated => {
                if matches!(outcome, DestinationOutcome::Acknowledged) {
                    self.attempts += 1;
                }
                self.acknowledged = true;
                self.last_error = None;
                self.acknowledged_at = Some(Utc::now());
            }
            DestinationOutcome::Failed { error } => {
                self.attempts += 1;
                self.last_error = Some(error.clone());
            }
        }
    }
}

/// Result of one attempt against one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationOutcome {
    Acknowledged,
    /// An earlier delivery was found in the idempotency markers; no attempt made
    Deduplicated,
    Failed { error: String },
}

/// A domain event handed to the outbox by the aggregate's persistence code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub destinations: Vec<Destination>,
    /// Overrides the store's default attempt cap
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            destinations: Vec::new(),
            max_attempts: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn to_topic(mut self, topic: impl Into<String>) -> Self {
        self.destinations.push(Destination::bus(topic));
        self
    }

    pub fn to_destination(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A durably captured domain event awaiting or past dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub aggregate_version: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub destinations: Vec<Destination>,
    pub destination_states: Vec<DestinationState>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Build the record written by `append`.
    pub fn new(key: &AggregateKey, version: i64, event: OutboxEvent, max_attempts: u32) -> Self {
        let destination_states = event
            .destinations
            .iter()
            .map(|d| DestinationState::new(d.name()))
            .collect();

        Self {
            id: Uuid::new_v4(),
            tenant_id: key.tenant_id.clone(),
            aggregate_type: key.aggregate_type.clone(),
            aggregate_id: key.aggregate_id.clone(),
            aggregate_version: version,
            event_type: event.event_type,
            payload: event.payload,
            occurred_at: event.occurred_at,
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts: event.max_attempts.unwrap_or(max_attempts).max(1),
            next_attempt_at: Utc::now(),
            last_error: None,
            destinations: event.destinations,
            destination_states,
            dispatched_at: None,
            archived_at: None,
        }
    }

    pub fn aggregate_key(&self) -> AggregateKey {
        AggregateKey {
            tenant_id: self.tenant_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
        }
    }

    pub fn destination_state(&self, name: &str) -> Option<&DestinationState> {
        self.destination_states.iter().find(|s| s.name == name)
    }

    /// Destinations that have not acknowledged yet.
    pub fn outstanding_destinations(&self) -> Vec<&Destination> {
        self.destinations
            .iter()
            .filter(|d| {
                !self
                    .destination_state(&d.name())
                    .is_some_and(|s| s.acknowledged)
            })
            .collect()
    }

    pub fn record_destination(&mut self, name: &str, outcome: &DestinationOutcome) {
        match self.destination_states.iter_mut().find(|s| s.name == name) {
            Some(state) => state.apply(outcome),
            None => {
                let mut state = DestinationState::new(name);
                state.apply(outcome);
                self.destination_states.push(state);
            }
        }
    }

    /// Operator-facing view of where the message stands.
    pub fn delivery_state(&self) -> DeliveryState {
        match self.status {
            OutboxStatus::Dispatched => DeliveryState::Delivered,
            OutboxStatus::DeadLettered => DeliveryState::DeadLettered,
            OutboxStatus::Dispatching => DeliveryState::InFlight,
            OutboxStatus::Failed => DeliveryState::Retrying,
            OutboxStatus::Pending if self.attempts > 0 => DeliveryState::Retrying,
            OutboxStatus::Pending => DeliveryState::Pending,
        }
    }
}

/// Coarse delivery state for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Retrying,
    Delivered,
    DeadLettered,
}

/// Message counts per status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboxStats {
    pub backend_type: String,
    pub pending: usize,
    pub dispatching: usize,
    pub failed: usize,
    pub dispatched: usize,
    pub dead_lettered: usize,
    pub archived: usize,
    pub active_leases: usize,
}
