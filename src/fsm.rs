//! The FSM runtime engine (§2, §4.1, §5, §7).
//!
//! `FSMRuntime` owns every instance of one `Component`'s state machines. Each
//! instance is serialized by its own `tokio::sync::Mutex` rather than a
//! single runtime-wide lock — §5 allows either model, and per-instance
//! locking is what lets independent instances advance concurrently while the
//! same instance never runs two transitions at once. Actions a hook enqueues
//! through `Sender`, and events a cascading rule derives, share one
//! runtime-wide deferred FIFO that is drained only after the transition that
//! produced them has fully released its instance lock, which is what keeps a
//! hook from ever observing its own transition mid-flight.

use crate::broker::{channels, CommandEnvelope, LifecycleData, LifecycleEnvelope, MessageBroker};
use crate::error::{RuntimeError, RuntimeResult};
use crate::guard::{evaluate_guards, evaluate_matching_rules};
use crate::hooks::{DeferredAction, HookRegistry, ParentInfo, Sender};
use crate::instance::{
    Event, FSMInstance, InstanceId, InstanceStatus, InstanceTimers, PersistedEvent, ERROR_STATE_SENTINEL,
};
use crate::model::{CascadingRule, Component, MatchingRule, NotifyParent, StateMachine, Transition, TransitionKind};
use crate::persistence::PersistenceManager;
use crate::registry::ComponentRegistry;
use crate::timer::{TimerHandle, TimerWheel};
use crate::value::ContextValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A lifecycle notification raised by the runtime (§6). `RuntimeBroadcaster`
/// subscribes to these and republishes them through a `MessageBroker`.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    InstanceCreated {
        instance_id: InstanceId,
        machine_name: String,
    },
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

impl LifecycleEvent {
    fn into_envelope(self, component_name: &str) -> LifecycleEnvelope {
        let (event_type, data) = match self {
            LifecycleEvent::InstanceCreated { instance_id, machine_name } => (
                "instance_created",
                LifecycleData::InstanceCreated { instance_id, machine_name },
            ),
            LifecycleEvent::StateChange {
                instance_id,
                machine_name,
                previous_state,
                new_state,
                event,
                event_id,
                timestamp,
                instance,
            } => (
                "state_change",
                LifecycleData::StateChange {
                    instance_id,
                    machine_name,
                    previous_state,
                    new_state,
                    event,
                    event_id,
                    timestamp,
                    instance,
                },
            ),
            LifecycleEvent::InstanceDisposed { instance_id } => {
                ("instance_disposed", LifecycleData::InstanceDisposed { instance_id })
            }
            LifecycleEvent::InstanceError { instance_id, reason } => {
                ("instance_error", LifecycleData::InstanceError { instance_id, reason })
            }
            LifecycleEvent::CrossComponentCascadeFailed {
                source_instance_id,
                target_component,
                reason,
            } => (
                "cross_component_cascade_failed",
                LifecycleData::CrossComponentCascadeFailed {
                    source_instance_id,
                    target_component,
                    reason,
                },
            ),
        };
        LifecycleEnvelope {
            event_type: event_type.to_string(),
            component_name: component_name.to_string(),
            data,
            timestamp: now_ms(),
        }
    }
}

/// Programmatic configuration for one `FSMRuntime` (§1A). No file format is
/// specified — component definitions and deployment config are out of scope
/// (§1), so this only carries the numbers the engine itself needs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often `RuntimeBroadcaster` publishes a heartbeat on
    /// `fsm:registry:heartbeat` while it is running (§4.6).
    pub heartbeat_interval: std::time::Duration,
    /// Capacity of the lifecycle-event broadcast channel. A slow subscriber
    /// falls behind and sees `RecvError::Lagged` rather than blocking the
    /// runtime once this many unread events have accumulated.
    pub lifecycle_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: std::time::Duration::from_secs(15),
            lifecycle_buffer: 1024,
        }
    }
}

/// Owns one component's instances, timers, hook registry, and (optionally)
/// persistence (§2).
pub struct FSMRuntime {
    component: Component,
    config: RuntimeConfig,
    instances: RwLock<HashMap<InstanceId, Arc<AsyncMutex<FSMInstance>>>>,
    by_machine: RwLock<HashMap<String, HashSet<InstanceId>>>,
    by_machine_state: RwLock<HashMap<(String, String), HashSet<InstanceId>>>,
    timers: StdMutex<HashMap<InstanceId, InstanceTimers>>,
    pending_timers: StdMutex<HashMap<TimerHandle, (InstanceId, String)>>,
    hooks: HookRegistry,
    persistence: Option<Arc<PersistenceManager>>,
    last_event_ids: StdMutex<HashMap<InstanceId, u64>>,
    registry: RwLock<Option<Weak<ComponentRegistry>>>,
    timer_wheel: TimerWheel,
    timer_loop: StdMutex<Option<JoinHandle<()>>>,
    deferred: Arc<StdMutex<VecDeque<DeferredAction>>>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    entry_point_created: StdMutex<HashSet<String>>,
    seq: AtomicU64,
    ignored_events: AtomicU64,
}

impl FSMRuntime {
    pub fn new(component: Component, hooks: HookRegistry, persistence: Option<Arc<PersistenceManager>>) -> Arc<Self> {
        Self::with_config(component, hooks, persistence, RuntimeConfig::default())
    }

    pub fn with_config(
        component: Component,
        hooks: HookRegistry,
        persistence: Option<Arc<PersistenceManager>>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let (timer_wheel, fired_rx) = TimerWheel::spawn();
        let (lifecycle_tx, _rx) = broadcast::channel(config.lifecycle_buffer);
        let runtime = Arc::new(Self {
            component,
            config,
            instances: RwLock::new(HashMap::new()),
            by_machine: RwLock::new(HashMap::new()),
            by_machine_state: RwLock::new(HashMap::new()),
            timers: StdMutex::new(HashMap::new()),
            pending_timers: StdMutex::new(HashMap::new()),
            hooks,
            persistence,
            last_event_ids: StdMutex::new(HashMap::new()),
            registry: RwLock::new(None),
            timer_wheel,
            timer_loop: StdMutex::new(None),
            deferred: Arc::new(StdMutex::new(VecDeque::new())),
            lifecycle_tx,
            entry_point_created: StdMutex::new(HashSet::new()),
            seq: AtomicU64::new(1),
            ignored_events: AtomicU64::new(0),
        });
        let loop_runtime = runtime.clone();
        let handle = tokio::spawn(async move { loop_runtime.run_timer_loop(fired_rx).await });
        *runtime.timer_loop.lock().unwrap() = Some(handle);
        runtime
    }

    pub fn component_name(&self) -> &str {
        &self.component.name
    }

    pub fn machine_names(&self) -> Vec<String> {
        self.component.machines.keys().cloned().collect()
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        self.config.heartbeat_interval
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Number of events silently ignored because no transition accepted them
    /// (no guard/matching-rule failure surfaced — §7's "not a failure").
    pub fn ignored_event_count(&self) -> u64 {
        self.ignored_events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_registry(&self, registry: Weak<ComponentRegistry>) {
        *self.registry.write().unwrap() = Some(registry);
    }

    fn upgrade_registry(&self) -> Option<Arc<ComponentRegistry>> {
        self.registry.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn has_instance(&self, instance_id: InstanceId) -> bool {
        self.instances.read().unwrap().contains_key(&instance_id)
    }

    pub async fn has_instance_id(&self, instance_id: InstanceId) -> bool {
        self.has_instance(instance_id).await
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Option<FSMInstance> {
        let lock = self.instances.read().unwrap().get(&instance_id).cloned()?;
        Some(lock.lock().await.clone())
    }

    pub async fn list_instances(&self) -> Vec<FSMInstance> {
        let locks: Vec<_> = self.instances.read().unwrap().values().cloned().collect();
        let mut out = Vec::with_capacity(locks.len());
        for lock in locks {
            out.push(lock.lock().await.clone());
        }
        out
    }

    fn get_instance_lock(&self, instance_id: InstanceId) -> RuntimeResult<Arc<AsyncMutex<FSMInstance>>> {
        self.instances
            .read()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or(RuntimeError::UnknownInstance(instance_id))
    }

    fn claim_entry_point(&self, machine_name: &str) -> bool {
        if self.component.entry_machine.as_deref() != Some(machine_name) {
            return false;
        }
        self.entry_point_created.lock().unwrap().insert(machine_name.to_string())
    }

    fn reindex_add(&self, instance: &FSMInstance) {
        self.by_machine
            .write()
            .unwrap()
            .entry(instance.machine_name.clone())
            .or_default()
            .insert(instance.id);
        self.by_machine_state
            .write()
            .unwrap()
            .entry((instance.machine_name.clone(), instance.current_state.clone()))
            .or_default()
            .insert(instance.id);
    }

    fn reindex_remove(&self, instance: &FSMInstance) {
        if let Some(set) = self.by_machine.write().unwrap().get_mut(&instance.machine_name) {
            set.remove(&instance.id);
        }
        if let Some(set) = self
            .by_machine_state
            .write()
            .unwrap()
            .get_mut(&(instance.machine_name.clone(), instance.current_state.clone()))
        {
            set.remove(&instance.id);
        }
    }

    fn candidate_instances(&self, machine_name: &str, state_filter: Option<&str>) -> Vec<InstanceId> {
        match state_filter {
            Some(state) => self
                .by_machine_state
                .read()
                .unwrap()
                .get(&(machine_name.to_string(), state.to_string()))
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            None => self
                .by_machine
                .read()
                .unwrap()
                .get(machine_name)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle_tx.send(event);
    }

    // ---- instance creation -------------------------------------------------

    #[tracing::instrument(skip(self, context, parent), fields(component = %self.component.name, machine = %machine_name))]
    pub async fn create_instance(
        &self,
        machine_name: &str,
        context: ContextValue,
        parent: Option<ParentInfo>,
    ) -> RuntimeResult<InstanceId> {
        let machine = self
            .component
            .machine(machine_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownMachine(machine_name.to_string()))?;

        let now = now_ms();
        let mut instance = FSMInstance::new(&self.component.name, machine_name, &machine.initial_state, context, now);
        instance.is_entry_point = self.claim_entry_point(machine_name);
        if let Some(p) = &parent {
            instance.parent_instance_id = Some(p.parent_instance_id);
            instance.parent_machine_name = Some(p.parent_machine_name.clone());
        }
        let instance_id = instance.id;

        let sender = Sender::new(instance_id, self.deferred.clone());
        if let Some(entry_name) = machine.state(&machine.initial_state).and_then(|s| s.entry_hook.clone()) {
            if let Some(hook) = self.hooks.entry(&entry_name) {
                if let Err(e) = hook.on_enter(&mut instance, &sender).await {
                    tracing::warn!(hook = %entry_name, error = %e.0, "entry hook failed during instance creation");
                    instance.status = InstanceStatus::Error;
                }
            }
        }

        self.instances
            .write()
            .unwrap()
            .insert(instance_id, Arc::new(AsyncMutex::new(instance.clone())));
        self.reindex_add(&instance);

        if let Some(persistence) = &self.persistence {
            if let Ok(event_id) = persistence.next_event_id().await {
                let pe = PersistedEvent {
                    id: event_id,
                    instance_id,
                    machine_name: machine_name.to_string(),
                    component_name: self.component.name.clone(),
                    event: Event::empty("__created__"),
                    state_before: machine.initial_state.clone(),
                    state_after: machine.initial_state.clone(),
                    timestamp: now,
                    seq: self.next_seq(),
                    causality: None,
                };
                if let Ok(snapshot_due) = persistence.append(pe, &instance).await {
                    self.last_event_ids.lock().unwrap().insert(instance_id, event_id);
                    if snapshot_due {
                        let _ = persistence.snapshot(&instance, event_id).await;
                    }
                }
            }
        }

        self.arm_timers_for_state(instance_id, &machine, &machine.initial_state);
        self.emit(LifecycleEvent::InstanceCreated {
            instance_id,
            machine_name: machine_name.to_string(),
        });
        self.drain_deferred().await;
        Ok(instance_id)
    }

    // ---- event delivery -----------------------------------------------------

    /// Deliver one event to a specific instance. §7's propagation policy:
    /// `UnknownInstance`/`InvalidState` reject the caller synchronously;
    /// `GuardMiss` is a silent no-op; `HookFailure` is reported through a
    /// lifecycle event rather than rejecting the caller; `PersistenceFailure`
    /// rolls the transition back and still rejects the caller, since it is a
    /// system-level failure the caller may need to retry.
    #[tracing::instrument(skip(self, event), fields(component = %self.component.name, event = %event.event_type))]
    pub async fn send_event(&self, instance_id: InstanceId, event: Event) -> RuntimeResult<()> {
        let lock = self.get_instance_lock(instance_id)?;
        let result = {
            let mut guard = lock.lock().await;
            if guard.status != InstanceStatus::Active {
                return Err(RuntimeError::InvalidState(instance_id));
            }
            self.execute_transition_locked(&mut guard, event).await
        };
        if let Err(e) = &result {
            tracing::debug!(instance_id = %instance_id, error = %e, "send_event rejected");
        }
        self.drain_deferred().await;
        result
    }

    /// Route an event to every instance of `machine_name` (optionally
    /// filtered by current state) whose matching rules and guards accept it.
    /// Returns the count of instances it was routed to (§4.1).
    pub async fn broadcast_event(
        &self,
        machine_name: &str,
        state_filter: Option<&str>,
        event: Event,
        _component_filter: Option<&str>,
    ) -> RuntimeResult<usize> {
        self.broadcast_event_filtered(machine_name, state_filter, &[], event).await
    }

    /// Like `broadcast_event`, but additionally requires `extra_rules` (the
    /// *source* transition's mandatory matching rules on a cross-component
    /// dispatch, §3 line 110) to pass against each candidate's context before
    /// the event is even offered to it — independent of whatever matching
    /// rules the target's own declared transition carries.
    pub(crate) async fn broadcast_event_filtered(
        &self,
        machine_name: &str,
        state_filter: Option<&str>,
        extra_rules: &[MatchingRule],
        event: Event,
    ) -> RuntimeResult<usize> {
        let machine = self
            .component
            .machine(machine_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownMachine(machine_name.to_string()))?;
        let candidates = self.candidate_instances(machine_name, state_filter);
        let mut count = 0;
        for instance_id in candidates {
            let lock = match self.get_instance_lock(instance_id) {
                Ok(l) => l,
                Err(_) => continue,
            };
            let accepts = {
                let guard = lock.lock().await;
                guard.status == InstanceStatus::Active
                    && evaluate_matching_rules(extra_rules, &event.payload, &guard.context)
                    && select_transition(&machine, &guard, &event).is_some()
            };
            if accepts {
                let _ = self.send_event(instance_id, event.clone()).await;
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn get_available_transitions(&self, instance_id: InstanceId) -> RuntimeResult<Vec<String>> {
        let lock = self.get_instance_lock(instance_id)?;
        let guard = lock.lock().await;
        let machine = self
            .component
            .machine(&guard.machine_name)
            .expect("instance references a declared machine");
        let null_payload = ContextValue::Null;
        Ok(machine
            .transitions_from(&guard.current_state)
            .into_iter()
            .filter(|t| evaluate_guards(&t.guards, &null_payload, &guard.context))
            .map(|t| t.event.clone())
            .collect())
    }

    pub async fn dispose_instance(&self, instance_id: InstanceId) {
        let lock = match self.get_instance_lock(instance_id) {
            Ok(l) => l,
            Err(_) => return,
        };
        let mut guard = lock.lock().await;
        self.dispose_instance_locked(&mut guard).await;
    }

    // ---- transition execution (§4.1 steps 1-13) ----------------------------

    async fn execute_transition_locked(&self, instance: &mut FSMInstance, event: Event) -> RuntimeResult<()> {
        let machine = self
            .component
            .machine(&instance.machine_name)
            .cloned()
            .expect("instance references a declared machine");

        let transition = match select_transition(&machine, instance, &event) {
            Some(t) => t,
            None => {
                self.ignored_events.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let previous_state = instance.current_state.clone();
        let sender = Sender::new(instance.id, self.deferred.clone());

        if let Some(exit_name) = machine.state(&previous_state).and_then(|s| s.exit_hook.clone()) {
            if let Some(hook) = self.hooks.exit(&exit_name) {
                if let Err(e) = hook.on_exit(instance, &sender).await {
                    return self.handle_hook_failure(instance, &exit_name, e.0).await;
                }
            }
        }

        if let Some(trig_name) = &transition.triggered_hook {
            if let Some(hook) = self.hooks.triggered(trig_name) {
                if let Err(e) = hook.on_trigger(instance, &event, &sender).await {
                    return self.handle_hook_failure(instance, trig_name, e.0).await;
                }
            }
        }

        let is_self_loop = transition.is_self_loop() && transition.kind != TransitionKind::Internal;

        self.reindex_remove(instance);
        instance.current_state = transition.to.clone();
        instance.updated_at = now_ms();
        self.reindex_add(instance);

        if !is_self_loop {
            if let Some(entry_name) = machine.state(&transition.to).and_then(|s| s.entry_hook.clone()) {
                if let Some(hook) = self.hooks.entry(&entry_name) {
                    if let Err(e) = hook.on_enter(instance, &sender).await {
                        return self.handle_hook_failure(instance, &entry_name, e.0).await;
                    }
                }
            }
            if let Some(state) = machine.state(&transition.to) {
                for rule in &state.cascading_rules {
                    self.dispatch_cascade(instance, rule).await;
                }
            }
        }

        self.apply_timer_discipline(instance, &machine, &previous_state, &transition, is_self_loop);
        self.maybe_notify_parent(instance, &machine, &transition);

        if matches!(transition.kind, TransitionKind::InterMachine | TransitionKind::CrossComponent)
            && transition.link.target_event.is_none()
        {
            self.spawn_linked_instance(instance, &transition).await;
        }
        if transition.kind == TransitionKind::CrossComponent && transition.link.target_event.is_some() {
            self.dispatch_cross_component_event(instance, &transition).await;
        }

        match self.persist_transition(instance, &event, &previous_state).await {
            Ok(event_id) => {
                self.emit(LifecycleEvent::StateChange {
                    instance_id: instance.id,
                    machine_name: instance.machine_name.clone(),
                    previous_state: previous_state.clone(),
                    new_state: instance.current_state.clone(),
                    event,
                    event_id,
                    timestamp: instance.updated_at,
                    instance: instance.clone(),
                });
            }
            Err(e) => {
                self.rollback_persistence_failure(instance, &machine, &previous_state, &transition, e)
                    .await?;
                return Err(RuntimeError::PersistenceFailure(instance.id, "rolled back".to_string()));
            }
        }

        let kind = machine.state(&instance.current_state).map(|s| s.kind);
        if matches!(kind, Some(k) if k.is_terminal()) && !instance.is_entry_point {
            self.dispose_instance_locked(instance).await;
        }

        Ok(())
    }

    async fn handle_hook_failure(&self, instance: &mut FSMInstance, hook_name: &str, message: String) -> RuntimeResult<()> {
        self.cancel_all_timers(instance.id);
        instance.status = InstanceStatus::Error;
        instance.updated_at = now_ms();
        let previous_state = instance.current_state.clone();

        if let Some(persistence) = &self.persistence {
            if let Ok(event_id) = persistence.next_event_id().await {
                let pe = PersistedEvent {
                    id: event_id,
                    instance_id: instance.id,
                    machine_name: instance.machine_name.clone(),
                    component_name: instance.component_name.clone(),
                    event: Event::empty("__hook_failure__"),
                    state_before: previous_state,
                    state_after: ERROR_STATE_SENTINEL.to_string(),
                    timestamp: instance.updated_at,
                    seq: self.next_seq(),
                    causality: None,
                };
                let _ = persistence.append(pe, instance).await;
            }
        }
        self.emit(LifecycleEvent::InstanceError {
            instance_id: instance.id,
            reason: format!("hook {hook_name:?} failed: {message}"),
        });
        Ok(())
    }

    async fn rollback_persistence_failure(
        &self,
        instance: &mut FSMInstance,
        machine: &StateMachine,
        previous_state: &str,
        transition: &Transition,
        cause: crate::error::PersistenceError,
    ) -> RuntimeResult<()> {
        self.reindex_remove(instance);
        instance.current_state = previous_state.to_string();
        self.reindex_add(instance);

        {
            let mut timers = self.timers.lock().unwrap();
            let entry = timers.entry(instance.id).or_default();
            if let Some(new_state) = machine.state(&transition.to) {
                for t in &new_state.transitions {
                    if t.kind == TransitionKind::Timeout {
                        let key = (new_state.name.clone(), t.event.clone());
                        if let Some(handle) = entry.handles.remove(&key) {
                            self.timer_wheel.cancel(handle);
                            self.pending_timers.lock().unwrap().remove(&handle);
                        }
                    }
                }
            }
        }
        self.arm_timers_for_state(instance.id, machine, previous_state);

        self.emit(LifecycleEvent::InstanceError {
            instance_id: instance.id,
            reason: format!("persistence failure, rolled back: {cause}"),
        });
        Ok(())
    }

    /// Returns the id of the event written (0 if persistence is disabled).
    async fn persist_transition(
        &self,
        instance: &FSMInstance,
        event: &Event,
        previous_state: &str,
    ) -> Result<u64, crate::error::PersistenceError> {
        let persistence = match &self.persistence {
            Some(p) => p,
            None => return Ok(0),
        };
        let event_id = persistence.next_event_id().await?;
        let pe = PersistedEvent {
            id: event_id,
            instance_id: instance.id,
            machine_name: instance.machine_name.clone(),
            component_name: instance.component_name.clone(),
            event: event.clone(),
            state_before: previous_state.to_string(),
            state_after: instance.current_state.clone(),
            timestamp: instance.updated_at,
            seq: self.next_seq(),
            causality: None,
        };
        let snapshot_due = persistence.append(pe, instance).await?;
        self.last_event_ids.lock().unwrap().insert(instance.id, event_id);
        if snapshot_due {
            let _ = persistence.snapshot(instance, event_id).await;
        }
        Ok(event_id)
    }

    async fn dispose_instance_locked(&self, instance: &mut FSMInstance) {
        self.cancel_all_timers(instance.id);
        self.reindex_remove(instance);
        if instance.status == InstanceStatus::Active {
            instance.status = InstanceStatus::Completed;
        }
        self.instances.write().unwrap().remove(&instance.id);
        if let Some(persistence) = &self.persistence {
            let last_event_id = self.last_event_ids.lock().unwrap().get(&instance.id).copied().unwrap_or(0);
            let _ = persistence.snapshot(instance, last_event_id).await;
        }
        self.emit(LifecycleEvent::InstanceDisposed { instance_id: instance.id });
    }

    fn cancel_all_timers(&self, instance_id: InstanceId) {
        if let Some(entry) = self.timers.lock().unwrap().remove(&instance_id) {
            let mut pending = self.pending_timers.lock().unwrap();
            for handle in entry.handles.values() {
                self.timer_wheel.cancel(*handle);
                pending.remove(handle);
            }
        }
    }

    // ---- timers (§4.1 step 7, §4.3) ----------------------------------------

    fn arm_timers_for_state(&self, instance_id: InstanceId, machine: &StateMachine, state_name: &str) {
        let mut timers = self.timers.lock().unwrap();
        let entry = timers.entry(instance_id).or_default();
        entry.entered_current_state_at = now_ms();
        if let Some(state) = machine.state(state_name) {
            for t in &state.transitions {
                if t.kind == TransitionKind::Timeout {
                    let key = (state.name.clone(), t.event.clone());
                    let handle = self
                        .timer_wheel
                        .schedule(std::time::Duration::from_millis(t.timeout_ms.unwrap_or(0)));
                    entry.handles.insert(key, handle);
                    self.pending_timers
                        .lock()
                        .unwrap()
                        .insert(handle, (instance_id, t.event.clone()));
                }
            }
        }
    }

    fn apply_timer_discipline(
        &self,
        instance: &FSMInstance,
        machine: &StateMachine,
        previous_state: &str,
        transition: &Transition,
        is_self_loop: bool,
    ) {
        if is_self_loop {
            // A self-loop never touches entry/exit hooks or cascades (already
            // skipped by the caller), but activity still resets the idle
            // clock: every `Timeout` transition declared on this state whose
            // `resetOnTransition` is set gets cancelled and re-armed, whether
            // or not it is the transition that just fired.
            let mut timers = self.timers.lock().unwrap();
            let entry = timers.entry(instance.id).or_default();
            if let Some(state) = machine.state(&instance.current_state) {
                for t in &state.transitions {
                    if t.kind != TransitionKind::Timeout || !t.reset_on_transition {
                        continue;
                    }
                    let key = (state.name.clone(), t.event.clone());
                    if let Some(handle) = entry.handles.remove(&key) {
                        self.timer_wheel.cancel(handle);
                        self.pending_timers.lock().unwrap().remove(&handle);
                    }
                    let new_handle = self
                        .timer_wheel
                        .schedule(std::time::Duration::from_millis(t.timeout_ms.unwrap_or(0)));
                    entry.handles.insert(key, new_handle);
                    self.pending_timers.lock().unwrap().insert(new_handle, (instance.id, t.event.clone()));
                }
            }
            return;
        }

        {
            let mut timers = self.timers.lock().unwrap();
            let entry = timers.entry(instance.id).or_default();
            if let Some(old_state) = machine.state(previous_state) {
                for t in &old_state.transitions {
                    if t.kind == TransitionKind::Timeout {
                        let key = (old_state.name.clone(), t.event.clone());
                        if let Some(handle) = entry.handles.remove(&key) {
                            self.timer_wheel.cancel(handle);
                            self.pending_timers.lock().unwrap().remove(&handle);
                        }
                    }
                }
            }
        }
        self.arm_timers_for_state(instance.id, machine, &instance.current_state);
    }

    /// Background task draining the timer wheel's fired-handle channel,
    /// translating each expiry into the synthetic timeout event feeding back
    /// through `send_event` — the same serializing point an external event
    /// enters through (§5).
    async fn run_timer_loop(self: Arc<Self>, mut fired_rx: tokio::sync::mpsc::UnboundedReceiver<TimerHandle>) {
        while let Some(handle) = fired_rx.recv().await {
            let target = self.pending_timers.lock().unwrap().remove(&handle);
            if let Some((instance_id, event_name)) = target {
                let _ = self.send_event(instance_id, Event::empty(event_name)).await;
            }
        }
    }

    /// Re-arm timeouts for every restored instance against elapsed wall-clock
    /// time (§4.4): timers whose deadline has already passed fire an
    /// immediate synthetic event instead of being scheduled into the future.
    pub async fn resynchronize_timeouts(&self, restored_at: i64) -> crate::persistence::ResyncReport {
        let mut report = crate::persistence::ResyncReport::default();
        let instances = self.list_instances().await;
        for instance in instances {
            if instance.status != InstanceStatus::Active {
                continue;
            }
            let machine = match self.component.machine(&instance.machine_name) {
                Some(m) => m,
                None => continue,
            };
            let state = match machine.state(&instance.current_state) {
                Some(s) => s,
                None => continue,
            };
            let elapsed = (restored_at - instance.updated_at).max(0) as u64;
            for t in &state.transitions {
                if t.kind != TransitionKind::Timeout {
                    continue;
                }
                let timeout_ms = t.timeout_ms.unwrap_or(0);
                if elapsed >= timeout_ms {
                    report.expired += 1;
                    let _ = self.send_event(instance.id, Event::empty(t.event.clone())).await;
                } else {
                    let remaining = timeout_ms - elapsed;
                    let handle = self.timer_wheel.schedule(std::time::Duration::from_millis(remaining));
                    let key = (state.name.clone(), t.event.clone());
                    self.timers
                        .lock()
                        .unwrap()
                        .entry(instance.id)
                        .or_default()
                        .handles
                        .insert(key, handle);
                    self.pending_timers
                        .lock()
                        .unwrap()
                        .insert(handle, (instance.id, t.event.clone()));
                    report.synced += 1;
                }
            }
        }
        report
    }

    /// Re-register restored instances into this runtime's own index, without
    /// running hooks, cascades, or timer arming — the caller invokes
    /// `resynchronize_timeouts` separately once every runtime in the
    /// registry has done this (§4.4).
    pub fn install_restored_instances(&self, instances: Vec<FSMInstance>) {
        for instance in instances {
            if instance.machine_name.is_empty() {
                continue;
            }
            self.reindex_add(&instance);
            self.instances
                .write()
                .unwrap()
                .insert(instance.id, Arc::new(AsyncMutex::new(instance)));
        }
    }

    // ---- cascades, parent notification, inter-machine linkage --------------

    async fn dispatch_cascade(&self, instance: &FSMInstance, rule: &CascadingRule) {
        let payload = expand_cascade_payload(&rule.payload_template, &instance.context);
        let event = Event::new(rule.event.clone(), payload);
        let target_component = rule.target_component.clone().unwrap_or_else(|| self.component.name.clone());

        if target_component == self.component.name {
            let candidates = self.candidate_instances(&rule.target_machine, rule.target_state_filter.as_deref());
            if candidates.is_empty() {
                tracing::debug!(machine = %rule.target_machine, "cascade found no candidate instances");
            }
            let mut queue = self.deferred.lock().unwrap();
            for id in candidates {
                queue.push_back(DeferredAction::SendTo {
                    instance_id: id,
                    event: event.clone(),
                });
            }
        } else if let Some(registry) = self.upgrade_registry() {
            if let Err(e) = registry.route_cascade(&self.component.name, rule, &instance.context).await {
                self.emit(LifecycleEvent::CrossComponentCascadeFailed {
                    source_instance_id: instance.id,
                    target_component,
                    reason: e.to_string(),
                });
            }
        } else {
            self.emit(LifecycleEvent::CrossComponentCascadeFailed {
                source_instance_id: instance.id,
                target_component,
                reason: "no component registry configured".to_string(),
            });
        }
    }

    fn maybe_notify_parent(&self, instance: &FSMInstance, machine: &StateMachine, transition: &Transition) {
        let parent_id = match instance.parent_instance_id {
            Some(id) => id,
            None => return,
        };
        let notify: Option<NotifyParent> = transition.notify_parent.clone().or_else(|| {
            machine.parent_link.as_ref().map(|p| NotifyParent {
                event: p.on_state_change.clone(),
                include_state: p.include_state,
                include_context: p.include_context,
            })
        });
        let notify = match notify {
            Some(n) if !n.event.is_empty() => n,
            _ => return,
        };

        let mut payload = ContextValue::empty_map();
        payload.set_path("childInstanceId", ContextValue::String(instance.id.to_string()));
        if notify.include_state {
            payload.set_path("state", ContextValue::String(instance.current_state.clone()));
        }
        if notify.include_context {
            payload.set_path("context", instance.context.clone());
        }

        self.deferred.lock().unwrap().push_back(DeferredAction::SendTo {
            instance_id: parent_id,
            event: Event::new(notify.event, payload),
        });
    }

    async fn spawn_linked_instance(&self, instance: &FSMInstance, transition: &Transition) {
        let target_machine = match &transition.link.target_machine {
            Some(m) => m.clone(),
            None => return,
        };
        let context = map_linked_context(instance, transition);
        let parent = Some(ParentInfo {
            parent_instance_id: instance.id,
            parent_machine_name: instance.machine_name.clone(),
        });

        let target_component = transition.link.target_component.clone().unwrap_or_else(|| self.component.name.clone());
        if target_component == self.component.name {
            self.deferred.lock().unwrap().push_back(DeferredAction::CreateInstance {
                machine: target_machine,
                context,
                parent,
            });
        } else if let Some(registry) = self.upgrade_registry() {
            if let Err(e) = registry
                .create_instance_in_component(&target_component, &target_machine, context, parent)
                .await
            {
                self.emit(LifecycleEvent::CrossComponentCascadeFailed {
                    source_instance_id: instance.id,
                    target_component,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn dispatch_cross_component_event(&self, instance: &FSMInstance, transition: &Transition) {
        let target_event = match &transition.link.target_event {
            Some(e) => e.clone(),
            None => return,
        };
        let target_component = match &transition.link.target_component {
            Some(c) => c.clone(),
            None => return,
        };
        let context = map_linked_context(instance, transition);
        let event = Event::new(target_event, context);
        let rules = &transition.matching_rules;

        if target_component == self.component.name {
            if let Some(target_machine) = &transition.link.target_machine {
                let _ = self.broadcast_event_filtered(target_machine, None, rules, event).await;
            }
            return;
        }
        if let Some(registry) = self.upgrade_registry() {
            if let Err(e) = registry
                .send_event_to_instance_in_component(
                    &target_component,
                    None,
                    transition.link.target_machine.clone(),
                    rules.clone(),
                    event,
                )
                .await
            {
                self.emit(LifecycleEvent::CrossComponentCascadeFailed {
                    source_instance_id: instance.id,
                    target_component,
                    reason: e.to_string(),
                });
            }
        } else {
            self.emit(LifecycleEvent::CrossComponentCascadeFailed {
                source_instance_id: instance.id,
                target_component,
                reason: "no component registry configured".to_string(),
            });
        }
    }

    // ---- deferred queue drain -----------------------------------------------

    async fn drain_deferred(&self) {
        loop {
            let action = self.deferred.lock().unwrap().pop_front();
            let action = match action {
                Some(a) => a,
                None => break,
            };
            match action {
                DeferredAction::SendToSelf { instance_id, event } | DeferredAction::SendTo { instance_id, event } => {
                    if self.has_instance(instance_id).await {
                        // Boxed: `send_event` ends by draining this same queue, so the two
                        // futures are mutually recursive and need one point of indirection.
                        let _ = Box::pin(self.send_event(instance_id, event)).await;
                    } else if let Some(registry) = self.upgrade_registry() {
                        let _ = registry.send_event_anywhere(instance_id, event).await;
                    }
                }
                DeferredAction::Broadcast {
                    machine,
                    event,
                    state_filter,
                    component,
                } => {
                    let target = component.unwrap_or_else(|| self.component.name.clone());
                    if target == self.component.name {
                        let _ = self.broadcast_event(&machine, state_filter.as_deref(), event, None).await;
                    } else if let Some(registry) = self.upgrade_registry() {
                        let _ = registry.broadcast_to_component(&target, &machine, state_filter, event).await;
                    }
                }
                DeferredAction::CreateInstance { machine, context, parent } => {
                    let _ = self.create_instance(&machine, context, parent).await;
                }
                DeferredAction::SendToComponent {
                    component,
                    machine,
                    instance_id,
                    event,
                } => {
                    if component == self.component.name {
                        if let Some(id) = instance_id {
                            let _ = Box::pin(self.send_event(id, event)).await;
                        } else if let Some(m) = machine {
                            let _ = self.broadcast_event(&m, None, event, None).await;
                        }
                    } else if let Some(registry) = self.upgrade_registry() {
                        let _ = registry
                            .send_event_to_instance_in_component(&component, instance_id, machine, Vec::new(), event)
                            .await;
                    }
                }
            }
        }
    }

    /// Snapshot the instances a broker-delivered query asked for (§4.5/§4.6).
    pub async fn query_instances(&self, machine_name: Option<&str>, instance_id: Option<InstanceId>) -> Vec<FSMInstance> {
        if let Some(id) = instance_id {
            return self.get_instance(id).await.into_iter().collect();
        }
        match machine_name {
            Some(name) => {
                let mut out = Vec::new();
                for id in self.candidate_instances(name, None) {
                    if let Some(i) = self.get_instance(id).await {
                        out.push(i);
                    }
                }
                out
            }
            None => self.list_instances().await,
        }
    }

    /// Wrap a lifecycle event into its wire envelope (used by `RuntimeBroadcaster`).
    pub fn envelope_for(&self, event: LifecycleEvent) -> LifecycleEnvelope {
        event.into_envelope(&self.component.name)
    }

    /// Apply a `CommandEnvelope` received off a broker's command channel.
    pub async fn apply_command(&self, envelope: CommandEnvelope) -> RuntimeResult<()> {
        if let Some(id) = envelope.instance_id {
            self.send_event(id, envelope.event).await
        } else if let Some(machine) = envelope.machine_name {
            self.broadcast_event_filtered(
                &machine,
                envelope.current_state.as_deref(),
                &envelope.matching_rules,
                envelope.event,
            )
            .await
            .map(|_| ())
        } else {
            Ok(())
        }
    }

    pub fn channel_hint_for(&self, topic: &str) -> &'static str {
        match topic {
            "commands" => channels::COMMANDS_TRIGGER_EVENT,
            "broadcast" => channels::COMMANDS_BROADCAST,
            _ => channels::EVENTS_STATE_CHANGE,
        }
    }
}

impl Drop for FSMRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_loop.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Select the first declared transition (in declaration order) whose event
/// name, matching rules, guards, and disambiguation all accept (§4.1 step 1-3).
fn select_transition(machine: &StateMachine, instance: &FSMInstance, event: &Event) -> Option<Transition> {
    for t in machine.transitions_from(&instance.current_state) {
        if t.event != event.event_type {
            continue;
        }
        if !t.matching_rules.is_empty() && !evaluate_matching_rules(&t.matching_rules, &event.payload, &instance.context) {
            continue;
        }
        if !evaluate_guards(&t.guards, &event.payload, &instance.context) {
            continue;
        }
        if let Some(expr) = &t.disambiguation {
            if !crate::guard::evaluate_expr(expr, &instance.context, &event.payload, instance.public_member.as_ref()) {
                continue;
            }
        }
        return Some(t.clone());
    }
    None
}

pub(crate) fn expand_cascade_payload(template: &ContextValue, source_context: &ContextValue) -> ContextValue {
    match template {
        ContextValue::String(s) => ContextValue::String(source_context.expand_template(s)),
        ContextValue::Map(m) => ContextValue::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), expand_cascade_payload(v, source_context)))
                .collect(),
        ),
        ContextValue::List(items) => ContextValue::List(items.iter().map(|v| expand_cascade_payload(v, source_context)).collect()),
        other => other.clone(),
    }
}

fn map_linked_context(instance: &FSMInstance, transition: &Transition) -> ContextValue {
    match &transition.link.context_mapping {
        None => instance.context.clone(),
        Some(mappings) => {
            let mut out = ContextValue::empty_map();
            for mapping in mappings {
                if let Some(v) = instance.context.get_path(&mapping.source_path) {
                    out.set_path(&mapping.target_path, v.clone());
                }
            }
            out
        }
    }
}
