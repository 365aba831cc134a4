//! Runtime embodiments of a state machine: `FSMInstance`, the persisted
//! event log entry, and the snapshot used as a restore base (§3).

use crate::timer::TimerHandle;
use crate::value::ContextValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type InstanceId = Uuid;

/// Lifecycle status of an `FSMInstance` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Active,
    Completed,
    Error,
}

/// A single event as received or synthesized (timeout, cascade).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: ContextValue,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: ContextValue) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn empty(event_type: impl Into<String>) -> Self {
        Self::new(event_type, ContextValue::Null)
    }
}

/// A runtime instance of one state machine (§3).
///
/// Fields not meaningful outside the owning `FSMRuntime` (the live timer
/// handle table) are kept separate in `FSMRuntime`'s index rather than on
/// this struct, so that `FSMInstance` stays cheaply `Clone`-able for
/// snapshotting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FSMInstance {
    pub id: InstanceId,
    pub component_name: String,
    pub machine_name: String,
    pub current_state: String,
    pub context: ContextValue,
    pub public_member: Option<ContextValue>,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: InstanceStatus,
    pub is_entry_point: bool,
    pub parent_instance_id: Option<InstanceId>,
    pub parent_machine_name: Option<String>,
}

impl FSMInstance {
    pub fn new(
        component_name: impl Into<String>,
        machine_name: impl Into<String>,
        initial_state: impl Into<String>,
        context: ContextValue,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            component_name: component_name.into(),
            machine_name: machine_name.into(),
            current_state: initial_state.into(),
            context,
            public_member: None,
            created_at: now,
            updated_at: now,
            status: InstanceStatus::Active,
            is_entry_point: false,
            parent_instance_id: None,
            parent_machine_name: None,
        }
    }
}

/// Live, non-serializable bookkeeping the runtime keeps per instance:
/// currently-armed timer handles keyed by the transition they belong to,
/// plus the wall-clock each was armed relative to (for resync, §4.4).
#[derive(Debug, Default)]
pub struct InstanceTimers {
    /// Keyed by `(from_state, event_name)` — a declared timeout transition
    /// is uniquely identified by those two fields within one machine.
    pub handles: HashMap<(String, String), TimerHandle>,
    /// Wall-clock (ms since epoch) the instance entered its current state;
    /// used by `resynchronizeTimeouts` to compute `elapsed`.
    pub entered_current_state_at: i64,
}

/// A durably-logged transition (§3). Ordered per instance by `timestamp`
/// then append order (`seq`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub id: u64,
    pub instance_id: InstanceId,
    pub machine_name: String,
    pub component_name: String,
    pub event: Event,
    pub state_before: String,
    pub state_after: String,
    pub timestamp: i64,
    pub seq: u64,
    pub causality: Option<u64>,
}

/// A point-in-time serialized instance used as a restore base (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance: FSMInstance,
    pub last_event_id: u64,
}

pub const ERROR_STATE_SENTINEL: &str = "__error__";
