//! User-hook contract and the `Sender` capability object (§4.1, §9).
//!
//! Hooks are out-of-engine code, registered by name at startup — the
//! "standardize on named-handler registration" choice §9 directs toward,
//! as opposed to interpreting inline expression strings. A hook never
//! executes anything synchronously against the same or another instance;
//! it can only enqueue further events through `Sender`, which this module
//! also defines.

use crate::instance::{Event, FSMInstance, InstanceId};
use crate::value::ContextValue;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Error returned by a failing hook; carries the hook's own message, wrapped
/// by the caller into `RuntimeError::HookFailure` with the hook's name.
#[derive(Debug, Clone)]
pub struct HookError(pub String);

pub type HookResult<T> = std::result::Result<T, HookError>;

/// Parent linkage passed to `Sender::create_instance` / the `inter_machine`
/// transition path.
#[derive(Debug, Clone)]
pub struct ParentInfo {
    pub parent_instance_id: InstanceId,
    pub parent_machine_name: String,
}

/// One action enqueued by a hook via `Sender`. Processed strictly after the
/// transition that enqueued it has fully completed (§4.1's re-entrancy rule).
#[derive(Debug, Clone)]
pub enum DeferredAction {
    SendToSelf {
        instance_id: InstanceId,
        event: Event,
    },
    SendTo {
        instance_id: InstanceId,
        event: Event,
    },
    Broadcast {
        machine: String,
        event: Event,
        state_filter: Option<String>,
        component: Option<String>,
    },
    CreateInstance {
        machine: String,
        context: ContextValue,
        parent: Option<ParentInfo>,
    },
    SendToComponent {
        component: String,
        machine: Option<String>,
        instance_id: Option<InstanceId>,
        event: Event,
    },
}

/// Capability object passed to hooks, bound to the instance whose transition
/// is currently executing. Every method enqueues onto the deferred queue and
/// returns immediately — none of them executes synchronously (§9).
#[derive(Clone)]
pub struct Sender {
    self_instance_id: InstanceId,
    queue: Arc<Mutex<VecDeque<DeferredAction>>>,
}

impl Sender {
    pub(crate) fn new(self_instance_id: InstanceId, queue: Arc<Mutex<VecDeque<DeferredAction>>>) -> Self {
        Self {
            self_instance_id,
            queue,
        }
    }

    fn push(&self, action: DeferredAction) {
        self.queue.lock().unwrap().push_back(action);
    }

    /// Enqueue an event to the instance whose transition is currently running.
    pub fn send_to_self(&self, event: Event) {
        self.push(DeferredAction::SendToSelf {
            instance_id: self.self_instance_id,
            event,
        });
    }

    /// Enqueue an event to a specific instance (same component).
    pub fn send_to(&self, instance_id: InstanceId, event: Event) {
        self.push(DeferredAction::SendTo { instance_id, event });
    }

    /// Enqueue a broadcast within the current component (or a named one).
    pub fn broadcast(
        &self,
        machine: impl Into<String>,
        event: Event,
        state_filter: Option<String>,
        component: Option<String>,
    ) {
        self.push(DeferredAction::Broadcast {
            machine: machine.into(),
            event,
            state_filter,
            component,
        });
    }

    /// Enqueue creation of a new instance, optionally linked as a child of
    /// the current instance.
    pub fn create_instance(
        &self,
        machine: impl Into<String>,
        context: ContextValue,
        as_child: bool,
        parent_machine_name: impl Into<String>,
    ) {
        let parent = as_child.then(|| ParentInfo {
            parent_instance_id: self.self_instance_id,
            parent_machine_name: parent_machine_name.into(),
        });
        self.push(DeferredAction::CreateInstance {
            machine: machine.into(),
            context,
            parent,
        });
    }

    /// Enqueue dispatch of an event into another component, targeting either
    /// a specific instance or an entire machine (for matching-rule routing).
    pub fn send_to_component(
        &self,
        component: impl Into<String>,
        machine: Option<String>,
        instance_id: Option<InstanceId>,
        event: Event,
    ) {
        self.push(DeferredAction::SendToComponent {
            component: component.into(),
            machine,
            instance_id,
            event,
        });
    }
}

#[async_trait]
pub trait EntryHook: Send + Sync {
    async fn on_enter(&self, instance: &mut FSMInstance, sender: &Sender) -> HookResult<()>;
}

#[async_trait]
pub trait ExitHook: Send + Sync {
    async fn on_exit(&self, instance: &mut FSMInstance, sender: &Sender) -> HookResult<()>;
}

#[async_trait]
pub trait TriggeredHook: Send + Sync {
    async fn on_trigger(
        &self,
        instance: &mut FSMInstance,
        event: &Event,
        sender: &Sender,
    ) -> HookResult<()>;
}

/// Out-of-band registry of named handlers (§9). Registration happens once at
/// startup; lookups during transition execution are by name only.
#[derive(Default, Clone)]
pub struct HookRegistry {
    entry: HashMap<String, Arc<dyn EntryHook>>,
    exit: HashMap<String, Arc<dyn ExitHook>>,
    triggered: HashMap<String, Arc<dyn TriggeredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entry(&mut self, name: impl Into<String>, hook: Arc<dyn EntryHook>) {
        self.entry.insert(name.into(), hook);
    }

    pub fn register_exit(&mut self, name: impl Into<String>, hook: Arc<dyn ExitHook>) {
        self.exit.insert(name.into(), hook);
    }

    pub fn register_triggered(&mut self, name: impl Into<String>, hook: Arc<dyn TriggeredHook>) {
        self.triggered.insert(name.into(), hook);
    }

    pub fn entry(&self, name: &str) -> Option<Arc<dyn EntryHook>> {
        self.entry.get(name).cloned()
    }

    pub fn exit(&self, name: &str) -> Option<Arc<dyn ExitHook>> {
        self.exit.get(name).cloned()
    }

    pub fn triggered(&self, name: &str) -> Option<Arc<dyn TriggeredHook>> {
        self.triggered.get(name).cloned()
    }
}
