//! Event-sourcing and snapshot layer (§4.4, §6).
//!
//! `EventStore`/`SnapshotStore` are the engine's only contract with durable
//! storage; implementations may be in-memory, SQL-backed, or
//! key-value-backed. The in-memory versions here are both the reference
//! implementation named in §6 and the fixtures this crate's own tests run
//! against.

use crate::error::PersistenceError;
use crate::instance::{FSMInstance, InstanceId, InstanceSnapshot, PersistedEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Append-only log of transitions (§6).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durable before return.
    async fn append(&self, event: PersistedEvent) -> PersistenceResult<()>;
    async fn get_events_for_instance(&self, instance_id: InstanceId) -> PersistenceResult<Vec<PersistedEvent>>;
    async fn get_events_in_range(&self, from: i64, to: i64) -> PersistenceResult<Vec<PersistedEvent>>;
    async fn get_event_by_id(&self, id: u64) -> PersistenceResult<Option<PersistedEvent>>;
    /// Events for one instance strictly after `last_event_id`, in order.
    async fn get_events_after(&self, instance_id: InstanceId, last_event_id: u64) -> PersistenceResult<Vec<PersistedEvent>>;
    /// Reserve the next id in the log, without appending. Lets the caller
    /// build a `PersistedEvent` (and reference its id from a lifecycle event)
    /// before the write actually happens.
    async fn next_event_id(&self) -> PersistenceResult<u64>;
}

/// Periodic/terminal point-in-time snapshots (§6).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, snapshot: InstanceSnapshot) -> PersistenceResult<()>;
    async fn get_snapshot(&self, instance_id: InstanceId) -> PersistenceResult<Option<InstanceSnapshot>>;
    async fn list_instance_ids(&self) -> PersistenceResult<Vec<InstanceId>>;
}

/// In-memory `EventStore`. Durable only for the lifetime of the process —
/// adequate as the default/reference implementation and for tests.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<PersistedEvent>>,
    next_id: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve the next event id without appending; used by the runtime so
    /// it can build a `PersistedEvent` before calling `append`.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: PersistedEvent) -> PersistenceResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn get_events_for_instance(&self, instance_id: InstanceId) -> PersistenceResult<Vec<PersistedEvent>> {
        let mut events: Vec<PersistedEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.timestamp, e.seq));
        Ok(events)
    }

    async fn get_events_in_range(&self, from: i64, to: i64) -> PersistenceResult<Vec<PersistedEvent>> {
        let mut events: Vec<PersistedEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.timestamp, e.seq));
        Ok(events)
    }

    async fn get_event_by_id(&self, id: u64) -> PersistenceResult<Option<PersistedEvent>> {
        Ok(self.events.lock().unwrap().iter().find(|e| e.id == id).cloned())
    }

    async fn get_events_after(&self, instance_id: InstanceId, last_event_id: u64) -> PersistenceResult<Vec<PersistedEvent>> {
        let mut events = self.get_events_for_instance(instance_id).await?;
        events.retain(|e| e.id > last_event_id);
        Ok(events)
    }

    async fn next_event_id(&self) -> PersistenceResult<u64> {
        Ok(self.next_id())
    }
}

/// In-memory `SnapshotStore`, one slot per instance (latest wins).
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<InstanceId, InstanceSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_snapshot(&self, snapshot: InstanceSnapshot) -> PersistenceResult<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.instance.id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, instance_id: InstanceId) -> PersistenceResult<Option<InstanceSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(&instance_id).cloned())
    }

    async fn list_instance_ids(&self) -> PersistenceResult<Vec<InstanceId>> {
        Ok(self.snapshots.lock().unwrap().keys().cloned().collect())
    }
}

/// Outcome of `PersistenceManager::restore` (§4.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
}

/// Outcome of `PersistenceManager::resynchronize_timeouts` (§4.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub synced: usize,
    pub expired: usize,
}

/// Configuration and cadence for persistence (§4.4).
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub event_sourcing: bool,
    pub snapshots: bool,
    /// Transitions per snapshot. Must be positive; a snapshot is always also
    /// taken on terminal states regardless of this counter (§9 open question,
    /// resolved as "both").
    pub snapshot_interval: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            event_sourcing: true,
            snapshots: true,
            snapshot_interval: 50,
        }
    }
}

/// Coordinates `EventStore`/`SnapshotStore` writes, snapshot cadence, and
/// restore/resync on startup (§4.4). Per-instance transition counters live
/// here rather than on `FSMInstance` because they are bookkeeping for
/// *this* manager's cadence, not part of the durable instance state.
pub struct PersistenceManager {
    pub config: PersistenceConfig,
    pub event_store: Box<dyn EventStore>,
    pub snapshot_store: Box<dyn SnapshotStore>,
    transition_counts: Mutex<HashMap<InstanceId, u64>>,
}

impl PersistenceManager {
    pub fn new(
        config: PersistenceConfig,
        event_store: Box<dyn EventStore>,
        snapshot_store: Box<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            event_store,
            snapshot_store,
            transition_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Append a transition and report whether a snapshot is now due. Persist
    /// failure propagates to the caller, which must roll back (§7).
    #[tracing::instrument(skip(self, event, instance), fields(instance_id = %instance.id, seq = event.seq))]
    pub async fn append(&self, event: PersistedEvent, instance: &FSMInstance) -> PersistenceResult<bool> {
        if !self.config.event_sourcing {
            return Ok(false);
        }
        let instance_id = instance.id;
        self.event_store.append(event).await.inspect_err(|e| {
            tracing::warn!(instance_id = %instance_id, error = %e, "event store append failed");
        })?;

        let count = {
            let mut counts = self.transition_counts.lock().unwrap();
            let entry = counts.entry(instance_id).or_insert(0);
            *entry += 1;
            *entry
        };

        let terminal = instance.status != crate::instance::InstanceStatus::Active;
        let due_by_counter = self.config.snapshot_interval > 0 && count % self.config.snapshot_interval == 0;
        Ok(self.config.snapshots && (terminal || due_by_counter))
    }

    /// Reserve the next event id from the underlying store.
    pub async fn next_event_id(&self) -> PersistenceResult<u64> {
        self.event_store.next_event_id().await
    }

    /// Write a snapshot unconditionally (cadence or terminal-state driven, or
    /// explicit request, §4.4).
    pub async fn snapshot(&self, instance: &FSMInstance, last_event_id: u64) -> PersistenceResult<()> {
        if !self.config.snapshots {
            return Ok(());
        }
        self.snapshot_store
            .save_snapshot(InstanceSnapshot {
                instance: instance.clone(),
                last_event_id,
            })
            .await
    }

    /// Load the latest snapshot + replay events after it, for every instance
    /// that has one. Replay is pure: no hooks, no cascades, no timers.
    pub async fn restore(&self) -> PersistenceResult<(RestoreReport, Vec<FSMInstance>)> {
        let mut report = RestoreReport::default();
        let mut restored_instances = Vec::new();

        for instance_id in self.snapshot_store.list_instance_ids().await? {
            match self.restore_one(instance_id).await {
                Ok(Some(instance)) => {
                    report.restored += 1;
                    restored_instances.push(instance);
                }
                Ok(None) => {}
                Err(_) => report.failed += 1,
            }
        }
        Ok((report, restored_instances))
    }

    async fn restore_one(&self, instance_id: InstanceId) -> PersistenceResult<Option<FSMInstance>> {
        let snapshot = match self.snapshot_store.get_snapshot(instance_id).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        let mut instance = snapshot.instance;
        let events = self
            .event_store
            .get_events_after(instance_id, snapshot.last_event_id)
            .await?;
        for event in events {
            instance.current_state = event.state_after;
            instance.updated_at = event.timestamp;
        }
        Ok(Some(instance))
    }
}
