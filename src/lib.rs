//! # xcomponent-fsm
//!
//! A declarative finite-state-machine runtime for orchestrating concurrent,
//! long-lived business workflows.
//!
//! A `Component` is a named, versioned bundle of state machines, loaded once
//! and treated as immutable thereafter. An `FSMRuntime` owns every running
//! instance of one component's machines: it selects and executes
//! transitions, arms and fires timeouts, persists every transition through
//! an `EventStore`/`SnapshotStore` pair, and notifies the outside world
//! through lifecycle events. Multiple components in one process are tied
//! together by a `ComponentRegistry`; components split across processes are
//! tied together by a `MessageBroker`.
//!
//! ## Quick start
//!
//! ```rust
//! use xcomponent_fsm::builder::{ComponentBuilder, StateBuilder, StateMachineBuilder, TransitionBuilder};
//! use xcomponent_fsm::model::StateKind;
//! use xcomponent_fsm::{FSMRuntime, HookRegistry};
//! use xcomponent_fsm::value::ContextValue;
//!
//! # async fn example() -> xcomponent_fsm::RuntimeResult<()> {
//! let machine = StateMachineBuilder::new("Light")
//!     .initial_state("Off")
//!     .state(StateBuilder::new("Off", StateKind::Entry)
//!         .transition(TransitionBuilder::new("Off", "On", "flip").build())
//!         .build())
//!     .state(StateBuilder::new("On", StateKind::Regular)
//!         .transition(TransitionBuilder::new("On", "Off", "flip").build())
//!         .build())
//!     .build();
//!
//! let component = ComponentBuilder::new("lighting").machine(machine).build();
//! let runtime = FSMRuntime::new(component, HookRegistry::new(), None);
//! let id = runtime.create_instance("Light", ContextValue::empty_map(), None).await?;
//! runtime.send_event(id, xcomponent_fsm::instance::Event::empty("flip")).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod broadcaster;
pub mod broker;
pub mod builder;
pub mod error;
pub mod fsm;
pub mod guard;
pub mod hooks;
pub mod instance;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod timer;
pub mod value;

pub use async_trait::async_trait;
pub use broadcaster::RuntimeBroadcaster;
pub use broker::{InMemoryBroker, MessageBroker};
pub use error::{RuntimeError, RuntimeResult};
pub use fsm::{FSMRuntime, LifecycleEvent, RuntimeConfig};
pub use hooks::{EntryHook, ExitHook, HookRegistry, ParentInfo, Sender, TriggeredHook};
pub use instance::{Event, FSMInstance, InstanceId, InstanceStatus};
pub use persistence::{InMemoryEventStore, InMemorySnapshotStore, PersistenceConfig, PersistenceManager};
pub use registry::ComponentRegistry;
pub use timer::TimerWheel;
pub use value::ContextValue;

/// Convenient re-exports for embedding programs and tests.
pub mod prelude {
    //! Prelude module for convenient imports.

    pub use crate::broker::{InMemoryBroker, MessageBroker};
    pub use crate::builder::{
        cascading_rule, context_mapping, ComponentBuilder, StateBuilder, StateMachineBuilder, TransitionBuilder,
    };
    pub use crate::error::{RuntimeError, RuntimeResult};
    pub use crate::fsm::{FSMRuntime, LifecycleEvent, RuntimeConfig};
    pub use crate::hooks::{EntryHook, ExitHook, HookRegistry, ParentInfo, Sender, TriggeredHook};
    pub use crate::instance::{Event, FSMInstance, InstanceId, InstanceStatus};
    pub use crate::model::*;
    pub use crate::persistence::{InMemoryEventStore, InMemorySnapshotStore, PersistenceConfig, PersistenceManager};
    pub use crate::registry::ComponentRegistry;
    pub use crate::value::ContextValue;
    pub use crate::async_trait;
}
