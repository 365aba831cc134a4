//! Fluent builders for assembling a `Component` document in tests and small
//! embedding programs, without requiring the external declarative
//! parser/schema validator this engine otherwise expects its input from
//! (§1, §3). Mirrors the teacher's `StateMachineBuilder` shape: a builder
//! that accumulates pieces and produces an immutable value on `build()`.

use crate::model::{
    CascadingRule, Component, ContextMapping, Guard, LinkConfig, MatchingRule, NotifyParent, ParentLinkPolicy, State,
    StateKind, StateMachine, Transition, TransitionKind,
};
use crate::value::ContextValue;
use std::collections::HashMap;

/// Builder for one `Component` (a named bundle of state machines).
pub struct ComponentBuilder {
    name: String,
    version: String,
    machines: HashMap<String, StateMachine>,
    entry_machine: Option<String>,
}

impl ComponentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            machines: HashMap::new(),
            entry_machine: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn machine(mut self, machine: StateMachine) -> Self {
        self.machines.insert(machine.name.clone(), machine);
        self
    }

    pub fn entry_machine(mut self, name: impl Into<String>) -> Self {
        self.entry_machine = Some(name.into());
        self
    }

    pub fn build(self) -> Component {
        Component {
            name: self.name,
            version: self.version,
            machines: self.machines,
            entry_machine: self.entry_machine,
        }
    }
}

/// Builder for one `StateMachine`.
pub struct StateMachineBuilder {
    name: String,
    states: HashMap<String, State>,
    initial_state: Option<String>,
    public_member_type: Option<String>,
    parent_link: Option<ParentLinkPolicy>,
    context_schema: Option<serde_json::Value>,
}

impl StateMachineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: HashMap::new(),
            initial_state: None,
            public_member_type: None,
            parent_link: None,
            context_schema: None,
        }
    }

    pub fn initial_state(mut self, name: impl Into<String>) -> Self {
        self.initial_state = Some(name.into());
        self
    }

    pub fn state(mut self, state: State) -> Self {
        self.states.insert(state.name.clone(), state);
        self
    }

    pub fn parent_link(mut self, policy: ParentLinkPolicy) -> Self {
        self.parent_link = Some(policy);
        self
    }

    pub fn public_member_type(mut self, type_name: impl Into<String>) -> Self {
        self.public_member_type = Some(type_name.into());
        self
    }

    pub fn build(self) -> StateMachine {
        let initial_state = self.initial_state.unwrap_or_else(|| {
            self.states
                .values()
                .find(|s| s.kind == StateKind::Entry)
                .map(|s| s.name.clone())
                .unwrap_or_default()
        });
        StateMachine {
            name: self.name,
            states: self.states,
            initial_state,
            public_member_type: self.public_member_type,
            parent_link: self.parent_link,
            context_schema: self.context_schema,
        }
    }
}

/// Builder for one `State`, including the transitions declared from it.
pub struct StateBuilder {
    state: State,
}

impl StateBuilder {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            state: State::new(name, kind),
        }
    }

    pub fn entry_hook(mut self, name: impl Into<String>) -> Self {
        self.state.entry_hook = Some(name.into());
        self
    }

    pub fn exit_hook(mut self, name: impl Into<String>) -> Self {
        self.state.exit_hook = Some(name.into());
        self
    }

    pub fn cascading_rule(mut self, rule: CascadingRule) -> Self {
        self.state.cascading_rules.push(rule);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.state.transitions.push(transition);
        self
    }

    pub fn build(self) -> State {
        self.state
    }
}

/// Builder for one `Transition`, defaulting to `TransitionKind::Regular`.
pub struct TransitionBuilder {
    transition: Transition,
}

impl TransitionBuilder {
    pub fn new(from: impl Into<String>, to: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            transition: Transition::new(from, to, event),
        }
    }

    pub fn kind(mut self, kind: TransitionKind) -> Self {
        self.transition.kind = kind;
        self
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.transition.guards.push(guard);
        self
    }

    pub fn matching_rule(mut self, rule: MatchingRule) -> Self {
        self.transition.matching_rules.push(rule);
        self
    }

    pub fn triggered_hook(mut self, name: impl Into<String>) -> Self {
        self.transition.triggered_hook = Some(name.into());
        self
    }

    /// Marks this as a `Timeout` transition with the given delay.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.transition.kind = TransitionKind::Timeout;
        self.transition.timeout_ms = Some(ms);
        self
    }

    pub fn reset_on_transition(mut self, reset: bool) -> Self {
        self.transition.reset_on_transition = reset;
        self
    }

    pub fn link(mut self, link: LinkConfig) -> Self {
        self.transition.link = link;
        self
    }

    pub fn notify_parent(mut self, notify: NotifyParent) -> Self {
        self.transition.notify_parent = Some(notify);
        self
    }

    pub fn build(self) -> Transition {
        self.transition
    }
}

/// Convenience constructor for `CascadingRule`.
pub fn cascading_rule(
    target_machine: impl Into<String>,
    event: impl Into<String>,
    payload_template: ContextValue,
) -> CascadingRule {
    CascadingRule {
        target_machine: target_machine.into(),
        target_component: None,
        target_state_filter: None,
        event: event.into(),
        payload_template,
    }
}

/// Convenience constructor for a `ContextMapping`.
pub fn context_mapping(source_path: impl Into<String>, target_path: impl Into<String>) -> ContextMapping {
    ContextMapping {
        source_path: source_path.into(),
        target_path: target_path.into(),
    }
}
