//! Message broker abstraction (§4.5, §6).
//!
//! Channels are named, at-least-once, non-blocking to publish; command
//! channels additionally guarantee per-channel FIFO so a single instance's
//! event order survives a hop through the broker. `InMemoryBroker` is the
//! reference implementation and the fixture this crate's broadcaster tests
//! run against; real deployments swap in an AMQP/Pub-Sub/streaming-backed
//! implementation behind the same trait.

use crate::error::BrokerError;
use crate::instance::{Event, FSMInstance, InstanceId};
use crate::model::MatchingRule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Well-known channel names (§4.5).
pub mod channels {
    pub const REGISTRY_ANNOUNCE: &str = "fsm:registry:announce";
    pub const REGISTRY_HEARTBEAT: &str = "fsm:registry:heartbeat";
    pub const REGISTRY_SHUTDOWN: &str = "fsm:registry:shutdown";

    pub const EVENTS_STATE_CHANGE: &str = "fsm:events:state_change";
    pub const EVENTS_INSTANCE_CREATED: &str = "fsm:events:instance_created";
    pub const EVENTS_INSTANCE_DISPOSED: &str = "fsm:events:instance_disposed";
    pub const EVENTS_INSTANCE_ERROR: &str = "fsm:events:instance_error";
    pub const EVENTS_CROSS_COMPONENT_CASCADE: &str = "fsm:events:cross_component_cascade";

    pub const COMMANDS_TRIGGER_EVENT: &str = "fsm:commands:trigger_event";
    pub const COMMANDS_CREATE_INSTANCE: &str = "fsm:commands:create_instance";
    pub const COMMANDS_BROADCAST: &str = "fsm:commands:broadcast";

    pub const QUERY_INSTANCES: &str = "fsm:query:instances";
    pub const QUERY_RESPONSE: &str = "fsm:query:response";

    pub const EXTERNAL_COMMANDS: &str = "xcomponent:external:commands";
    pub const EXTERNAL_BROADCASTS: &str = "xcomponent:external:broadcasts";
}

/// Lifecycle event envelope published on `fsm:events:*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub component_name: String,
    pub data: LifecycleData,
    pub timestamp: i64,
}

/// Payload carried by a lifecycle envelope. `StateChange` carries the full
/// post-transition instance snapshot per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LifecycleData {
    StateChange {
        instance_id: InstanceId,
        machine_name: String,
        previous_state: String,
        new_state: String,
        event: Event,
        event_id: u64,
        timestamp: i64,
        instance: FSMInstance,
    },
    InstanceCreated {
        instance_id: InstanceId,
        machine_name: String,
    },
    InstanceDisposed {
        instance_id: InstanceId,
    },
    InstanceError {
        instance_id: InstanceId,
        reason: String,
    },
    CrossComponentCascadeFailed {
        source_instance_id: InstanceId,
        target_component: String,
        reason: String,
    },
}

/// Published once on `fsm:registry:announce` when a runtime connects (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAnnounceEnvelope {
    pub runtime_id: String,
    pub component_name: String,
    pub machines: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Published periodically on `fsm:registry:heartbeat` while a runtime is
/// connected (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryHeartbeatEnvelope {
    pub runtime_id: String,
    pub component_name: String,
    pub timestamp: i64,
}

/// Published once on `fsm:registry:shutdown` when a runtime disconnects (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryShutdownEnvelope {
    pub runtime_id: String,
    pub component_name: String,
}

/// Command envelope published on `fsm:commands:*` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub component_name: String,
    pub instance_id: Option<InstanceId>,
    pub machine_name: Option<String>,
    pub current_state: Option<String>,
    /// Source transition's mandatory matching rules on a cross-component
    /// dispatch with no explicit `instance_id` (§3 line 110); empty when not
    /// applicable (direct instance sends, plain create-instance commands).
    #[serde(default)]
    pub matching_rules: Vec<MatchingRule>,
    pub event: Event,
    pub request_id: Option<String>,
    pub sender_id: String,
}

/// Query request/response correlated by `request_id` on `fsm:query:*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub component_name: String,
    pub machine_name: Option<String>,
    pub instance_id: Option<InstanceId>,
    pub request_id: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponseEnvelope {
    pub request_id: String,
    pub instances: Vec<FSMInstance>,
}

/// Abstract publish/subscribe broker (§4.5).
///
/// Implementations map channels onto AMQP exchanges, Pub/Sub topics,
/// streaming-topic consumer groups, or (here) an in-process dispatcher. The
/// engine depends only on publish/subscribe, at-least-once delivery, and
/// per-channel FIFO for command channels.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> BrokerResult<()>;

    /// Subscribe to a channel; returns a receiver of raw JSON payloads.
    /// Subscribers are expected to be idempotent per §4.5.
    async fn subscribe(&self, channel: &str) -> BrokerResult<broadcast::Receiver<serde_json::Value>>;
}

/// In-memory broker: one `tokio::sync::broadcast` channel per named topic,
/// created lazily on first publish/subscribe. Provides per-channel FIFO
/// because `broadcast::Sender::send` preserves enqueue order for all
/// subscribers of that channel.
pub struct InMemoryBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    capacity: usize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: 256,
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<serde_json::Value> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> BrokerResult<()> {
        let sender = self.sender_for(channel);
        // No subscribers is not an error: publish is non-blocking fire-and-forget.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<broadcast::Receiver<serde_json::Value>> {
        Ok(self.sender_for(channel).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_is_per_channel_fifo() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe(channels::COMMANDS_TRIGGER_EVENT).await.unwrap();
        broker
            .publish(channels::COMMANDS_TRIGGER_EVENT, serde_json::json!({"seq": 1}))
            .await
            .unwrap();
        broker
            .publish(channels::COMMANDS_TRIGGER_EVENT, serde_json::json!({"seq": 2}))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first["seq"], 1);
        assert_eq!(second["seq"], 2);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let broker = InMemoryBroker::new();
        let result = broker.publish(channels::REGISTRY_HEARTBEAT, serde_json::json!({})).await;
        assert!(result.is_ok());
    }
}
