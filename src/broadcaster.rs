//! `RuntimeBroadcaster`: republishes an `FSMRuntime`'s lifecycle events onto
//! a `MessageBroker`, and answers broker-delivered queries (§4.6).
//!
//! This is the seam external collaborators attach to — a dashboard, an
//! orchestrator's REST layer, a cross-process sibling component — without
//! coupling them to `FSMRuntime` directly. It owns no state of its own
//! beyond the subscription handles; everything it publishes is derived from
//! the runtime's lifecycle stream or broker-delivered commands/queries.

use crate::broker::{
    channels, CommandEnvelope, MessageBroker, QueryEnvelope, QueryResponseEnvelope, RegistryAnnounceEnvelope,
    RegistryHeartbeatEnvelope, RegistryShutdownEnvelope,
};
use crate::fsm::FSMRuntime;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Bridges one `FSMRuntime`'s lifecycle stream and a `MessageBroker`,
/// running background tasks: lifecycle republish, command/query intake, and
/// a registry heartbeat. Announces itself on `fsm:registry:announce` when
/// started and, if stopped through `stop()`, on `fsm:registry:shutdown` when
/// it disconnects (§4.6).
pub struct RuntimeBroadcaster {
    runtime_id: String,
    runtime: Arc<FSMRuntime>,
    broker: Arc<dyn MessageBroker>,
    host: Option<String>,
    port: Option<u16>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeBroadcaster {
    pub fn new(runtime: Arc<FSMRuntime>, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            runtime_id: Uuid::new_v4().to_string(),
            runtime,
            broker,
            host: None,
            port: None,
            tasks: Vec::new(),
        }
    }

    /// Attach the address this runtime is reachable on, carried in the
    /// announce message for collaborators that need to dial it directly.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    /// Announce this runtime, then start the lifecycle-republish,
    /// command/query-intake, and heartbeat loops. Callers hold onto the
    /// returned `Self` for as long as the bridge should run; dropping it
    /// aborts the background tasks without publishing a shutdown message —
    /// call `stop()` instead for an announced disconnect.
    pub async fn start(mut self) -> Self {
        self.announce().await;
        self.tasks.push(self.spawn_lifecycle_republish());
        self.tasks.push(self.spawn_command_intake().await);
        self.tasks.push(self.spawn_query_intake().await);
        self.tasks.push(self.spawn_heartbeat());
        self
    }

    /// Publish a shutdown message and stop every background task. Prefer
    /// this over letting the broadcaster drop when an announced disconnect
    /// matters — `Drop` cannot await a publish, so it only aborts tasks.
    pub async fn stop(mut self) {
        let envelope = RegistryShutdownEnvelope {
            runtime_id: self.runtime_id.clone(),
            component_name: self.runtime.component_name().to_string(),
        };
        if let Ok(payload) = serde_json::to_value(&envelope) {
            if let Err(e) = self.broker.publish(channels::REGISTRY_SHUTDOWN, payload).await {
                tracing::warn!(component = %self.runtime.component_name(), error = %e, "registry shutdown publish failed");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    async fn announce(&self) {
        let envelope = RegistryAnnounceEnvelope {
            runtime_id: self.runtime_id.clone(),
            component_name: self.runtime.component_name().to_string(),
            machines: self.runtime.machine_names(),
            host: self.host.clone(),
            port: self.port,
        };
        match serde_json::to_value(&envelope) {
            Ok(payload) => {
                if let Err(e) = self.broker.publish(channels::REGISTRY_ANNOUNCE, payload).await {
                    tracing::warn!(component = %self.runtime.component_name(), error = %e, "registry announce publish failed");
                }
            }
            Err(e) => tracing::warn!(component = %self.runtime.component_name(), error = %e, "registry announce serialization failed"),
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let runtime_id = self.runtime_id.clone();
        let runtime = self.runtime.clone();
        let broker = self.broker.clone();
        let component_name = runtime.component_name().to_string();
        let interval = runtime.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let envelope = RegistryHeartbeatEnvelope {
                    runtime_id: runtime_id.clone(),
                    component_name: component_name.clone(),
                    timestamp: crate::fsm::now_ms(),
                };
                match serde_json::to_value(&envelope) {
                    Ok(payload) => {
                        if let Err(e) = broker.publish(channels::REGISTRY_HEARTBEAT, payload).await {
                            tracing::warn!(component = %component_name, error = %e, "registry heartbeat publish failed");
                        }
                    }
                    Err(e) => tracing::warn!(component = %component_name, error = %e, "registry heartbeat serialization failed"),
                }
            }
        })
    }

    fn spawn_lifecycle_republish(&self) -> JoinHandle<()> {
        let mut rx = self.runtime.subscribe_lifecycle();
        let runtime = self.runtime.clone();
        let broker = self.broker.clone();
        let component_name = runtime.component_name().to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let channel = lifecycle_channel(&event);
                        let envelope = runtime.envelope_for(event);
                        match serde_json::to_value(&envelope) {
                            Ok(payload) => {
                                if let Err(e) = broker.publish(channel, payload).await {
                                    tracing::warn!(component = %component_name, channel, error = %e, "lifecycle publish failed");
                                }
                            }
                            Err(e) => tracing::warn!(component = %component_name, error = %e, "lifecycle envelope serialization failed"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(component = %component_name, skipped = n, "lifecycle republish lagged behind runtime");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn spawn_command_intake(&self) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let component_name = runtime.component_name().to_string();
        let mut rx = self
            .broker
            .subscribe(channels::COMMANDS_TRIGGER_EVENT)
            .await
            .expect("in-memory broker subscribe never fails");
        tokio::spawn(async move {
            while let Ok(payload) = rx.recv().await {
                let envelope: CommandEnvelope = match serde_json::from_value(payload) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(component = %component_name, error = %e, "dropped malformed command envelope");
                        continue;
                    }
                };
                if envelope.component_name != component_name {
                    continue;
                }
                if let Err(e) = runtime.apply_command(envelope).await {
                    tracing::warn!(component = %component_name, error = %e, "broker-delivered command failed");
                }
            }
        })
    }

    async fn spawn_query_intake(&self) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        let component_name = runtime.component_name().to_string();
        let broker = self.broker.clone();
        let mut rx = self
            .broker
            .subscribe(channels::QUERY_INSTANCES)
            .await
            .expect("in-memory broker subscribe never fails");
        tokio::spawn(async move {
            while let Ok(payload) = rx.recv().await {
                let query: QueryEnvelope = match serde_json::from_value(payload) {
                    Ok(q) => q,
                    Err(_) => continue,
                };
                if query.component_name != component_name {
                    continue;
                }
                let instances = runtime.query_instances(query.machine_name.as_deref(), query.instance_id).await;
                let response = QueryResponseEnvelope {
                    request_id: query.request_id,
                    instances,
                };
                if let Ok(value) = serde_json::to_value(&response) {
                    let _ = broker.publish(channels::QUERY_RESPONSE, value).await;
                }
            }
        })
    }
}

fn lifecycle_channel(event: &crate::fsm::LifecycleEvent) -> &'static str {
    use crate::fsm::LifecycleEvent::*;
    match event {
        InstanceCreated { .. } => channels::EVENTS_INSTANCE_CREATED,
        StateChange { .. } => channels::EVENTS_STATE_CHANGE,
        InstanceDisposed { .. } => channels::EVENTS_INSTANCE_DISPOSED,
        InstanceError { .. } => channels::EVENTS_INSTANCE_ERROR,
        CrossComponentCascadeFailed { .. } => channels::EVENTS_CROSS_COMPONENT_CASCADE,
    }
}

impl Drop for RuntimeBroadcaster {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
