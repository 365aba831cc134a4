//! Error types for the FSM runtime, persistence layer, and broker.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced synchronously to direct API callers (§7 of the spec).
///
/// `GuardMiss` and `HookFailure` are deliberately *not* returned by
/// `FSMRuntime::send_event` as a rejection — the propagation policy requires
/// those to be reported only through lifecycle events, never as a
/// caller-visible error. The variants exist so internal bookkeeping (tests,
/// the broadcaster) can still name and match on them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// No instance with this id is known to the runtime.
    #[error("unknown instance {0}")]
    UnknownInstance(Uuid),

    /// No machine with this name is declared in the component.
    #[error("unknown machine {0:?}")]
    UnknownMachine(String),

    /// No component with this name is registered.
    #[error("unknown component {0:?}")]
    UnknownComponent(String),

    /// Event sent to an instance that has already terminated.
    #[error("instance {0} is terminal, event rejected")]
    InvalidState(Uuid),

    /// Guards or matching rules rejected every candidate transition.
    #[error("no transition accepted the event from state {0:?}")]
    GuardMiss(String),

    /// A triggered/entry/exit hook returned an error.
    #[error("hook {0:?} failed: {1}")]
    HookFailure(String, String),

    /// The persistence layer refused a write; the transition was rolled back.
    #[error("persistence failure for instance {0}: {1}")]
    PersistenceFailure(Uuid, String),

    /// Rollback itself failed after a persistence failure; instance is now `error`.
    #[error("rollback failed for instance {0} after persistence failure: {1}")]
    RollbackFailure(Uuid, String),

    /// Cross-component cascade/command dispatch via the registry or broker failed.
    #[error("cascade or cross-component dispatch failed: {0}")]
    CascadeDispatchFailed(String),
}

/// Errors raised by `EventStore`/`SnapshotStore` implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// The underlying store rejected the write (disk full, constraint violation, ...).
    #[error("store write failed: {0}")]
    WriteFailed(String),
    /// The underlying store could not satisfy a read.
    #[error("store read failed: {0}")]
    ReadFailed(String),
}

/// Errors raised by `MessageBroker` implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// The broker connection is down; callers should buffer and retry.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The named channel does not exist / was never declared.
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
}
