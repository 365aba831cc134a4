//! `ComponentRegistry`: the process-local directory of `FSMRuntime`s and the
//! routing layer above them (§4.2).
//!
//! A process may host several components' runtimes side by side. The
//! registry resolves a target component to either a local, in-process
//! `FSMRuntime` (direct call, no serialization hop) or — when the component
//! isn't hosted here — a `MessageBroker` publish, so the same API works
//! whether the target lives in this process or a different one.

use crate::broker::{channels, CommandEnvelope, MessageBroker};
use crate::error::{RuntimeError, RuntimeResult};
use crate::fsm::FSMRuntime;
use crate::hooks::ParentInfo;
use crate::instance::{Event, FSMInstance, InstanceId};
use crate::model::{CascadingRule, MatchingRule};
use crate::value::ContextValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Process-local directory of `FSMRuntime`s, keyed by component name.
pub struct ComponentRegistry {
    runtimes: RwLock<HashMap<String, Arc<FSMRuntime>>>,
    broker: RwLock<Option<Arc<dyn MessageBroker>>>,
}

impl ComponentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runtimes: RwLock::new(HashMap::new()),
            broker: RwLock::new(None),
        })
    }

    pub fn set_broker(&self, broker: Arc<dyn MessageBroker>) {
        *self.broker.write().unwrap() = Some(broker);
    }

    fn broker(&self) -> Option<Arc<dyn MessageBroker>> {
        self.broker.read().unwrap().clone()
    }

    /// Register a runtime, binding its back-reference so the runtime can
    /// reach the registry for cross-component routing without holding a
    /// strong `Arc` back to it (would otherwise be a reference cycle).
    pub fn register(self: &Arc<Self>, runtime: Arc<FSMRuntime>) {
        runtime.set_registry(Arc::downgrade(self));
        self.runtimes
            .write()
            .unwrap()
            .insert(runtime.component_name().to_string(), runtime);
    }

    pub fn unregister(&self, component_name: &str) {
        self.runtimes.write().unwrap().remove(component_name);
    }

    pub fn runtime(&self, component_name: &str) -> Option<Arc<FSMRuntime>> {
        self.runtimes.read().unwrap().get(component_name).cloned()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.runtimes.read().unwrap().keys().cloned().collect()
    }

    /// Locate an instance by id across every locally registered runtime,
    /// O(components) as noted in §4.2.
    pub async fn find_instance(&self, instance_id: InstanceId) -> Option<(String, Arc<FSMRuntime>)> {
        let runtimes: Vec<(String, Arc<FSMRuntime>)> = self
            .runtimes
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, rt) in runtimes {
            if rt.has_instance_id(instance_id).await {
                return Some((name, rt));
            }
        }
        None
    }

    pub async fn send_event_anywhere(&self, instance_id: InstanceId, event: Event) -> RuntimeResult<()> {
        match self.find_instance(instance_id).await {
            Some((_, rt)) => rt.send_event(instance_id, event).await,
            None => Err(RuntimeError::UnknownInstance(instance_id)),
        }
    }

    pub async fn get_instance_anywhere(&self, instance_id: InstanceId) -> Option<FSMInstance> {
        let (_, rt) = self.find_instance(instance_id).await?;
        rt.get_instance(instance_id).await
    }

    /// Create an instance in `component_name`: a direct local call if that
    /// component is registered here, otherwise a best-effort broker publish
    /// (§4.2). The broker path cannot return the new instance id
    /// synchronously — callers crossing a broker boundary learn the id (if
    /// they need it) from the resulting `instance_created` lifecycle event.
    pub async fn create_instance_in_component(
        &self,
        component_name: &str,
        machine_name: &str,
        context: ContextValue,
        parent: Option<ParentInfo>,
    ) -> RuntimeResult<InstanceId> {
        if let Some(rt) = self.runtime(component_name) {
            return rt.create_instance(machine_name, context, parent).await;
        }
        if let Some(broker) = self.broker() {
            let envelope = CommandEnvelope {
                component_name: component_name.to_string(),
                instance_id: None,
                machine_name: Some(machine_name.to_string()),
                current_state: None,
                matching_rules: Vec::new(),
                event: Event::new("__create_instance__", context),
                request_id: None,
                sender_id: "registry".to_string(),
            };
            let payload = serde_json::to_value(&envelope)
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            broker
                .publish(channels::COMMANDS_CREATE_INSTANCE, payload)
                .await
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            return Err(RuntimeError::CascadeDispatchFailed(
                "instance creation forwarded to broker; id unknown until instance_created arrives".to_string(),
            ));
        }
        Err(RuntimeError::UnknownComponent(component_name.to_string()))
    }

    /// `matching_rules` are the *source* cross-component transition's
    /// mandatory matching rules (§3 line 110); they are evaluated against
    /// each candidate instance's context in addition to, and independent of,
    /// whatever matching rules the target's own declared transition carries.
    /// They only apply to the broadcast form (`instance_id` is `None`) — a
    /// direct `instance_id` send has no candidate set to filter.
    pub async fn send_event_to_instance_in_component(
        &self,
        component_name: &str,
        instance_id: Option<InstanceId>,
        machine_name: Option<String>,
        matching_rules: Vec<MatchingRule>,
        event: Event,
    ) -> RuntimeResult<()> {
        if let Some(rt) = self.runtime(component_name) {
            return if let Some(id) = instance_id {
                rt.send_event(id, event).await
            } else if let Some(m) = machine_name {
                rt.broadcast_event_filtered(&m, None, &matching_rules, event).await.map(|_| ())
            } else {
                Ok(())
            };
        }
        if let Some(broker) = self.broker() {
            let envelope = CommandEnvelope {
                component_name: component_name.to_string(),
                instance_id,
                machine_name,
                current_state: None,
                matching_rules,
                event,
                request_id: None,
                sender_id: "registry".to_string(),
            };
            let payload = serde_json::to_value(&envelope)
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            return broker
                .publish(channels::COMMANDS_TRIGGER_EVENT, payload)
                .await
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()));
        }
        Err(RuntimeError::UnknownComponent(component_name.to_string()))
    }

    pub async fn broadcast_to_component(
        &self,
        component_name: &str,
        machine_name: &str,
        state_filter: Option<String>,
        event: Event,
    ) -> RuntimeResult<usize> {
        if let Some(rt) = self.runtime(component_name) {
            return rt.broadcast_event(machine_name, state_filter.as_deref(), event, None).await;
        }
        if let Some(broker) = self.broker() {
            let envelope = CommandEnvelope {
                component_name: component_name.to_string(),
                instance_id: None,
                machine_name: Some(machine_name.to_string()),
                current_state: state_filter,
                matching_rules: Vec::new(),
                event,
                request_id: None,
                sender_id: "registry".to_string(),
            };
            let payload = serde_json::to_value(&envelope)
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            broker
                .publish(channels::COMMANDS_BROADCAST, payload)
                .await
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            // Best-effort: the count of remote recipients isn't known to this
            // caller (§9 open question on cross-broker broadcast counts).
            return Ok(0);
        }
        Err(RuntimeError::UnknownComponent(component_name.to_string()))
    }

    /// Route one cascading rule toward its target component (§4.1 step 6,
    /// §4.2). Delivery beyond a broker hop is best-effort: failures are
    /// reported through `cross_component_cascade_failed`, never by rolling
    /// back the source transition.
    pub async fn route_cascade(
        &self,
        source_component: &str,
        rule: &CascadingRule,
        source_context: &ContextValue,
    ) -> RuntimeResult<()> {
        let target_component = rule.target_component.clone().unwrap_or_else(|| source_component.to_string());
        let payload = crate::fsm::expand_cascade_payload(&rule.payload_template, source_context);
        let event = Event::new(rule.event.clone(), payload);

        if let Some(rt) = self.runtime(&target_component) {
            rt.broadcast_event(&rule.target_machine, rule.target_state_filter.as_deref(), event, None)
                .await?;
            return Ok(());
        }
        if let Some(broker) = self.broker() {
            let envelope = CommandEnvelope {
                component_name: target_component.clone(),
                instance_id: None,
                machine_name: Some(rule.target_machine.clone()),
                current_state: rule.target_state_filter.clone(),
                matching_rules: Vec::new(),
                event,
                request_id: None,
                sender_id: "cascade".to_string(),
            };
            let value = serde_json::to_value(&envelope)
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            broker
                .publish(channels::COMMANDS_BROADCAST, value)
                .await
                .map_err(|e| RuntimeError::CascadeDispatchFailed(e.to_string()))?;
            return Ok(());
        }
        Err(RuntimeError::UnknownComponent(target_component))
    }
}
