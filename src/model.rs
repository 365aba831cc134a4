//! The in-memory declarative document model (§3).
//!
//! These types are the engine's view of a `Component` as produced by the
//! external parser/schema validator. The engine treats them as immutable
//! after load and never interprets inline expression strings itself (§9) —
//! guards are either a built-in operator or a closed `PureExpr`.

use crate::value::ContextValue;
use std::collections::HashMap;

/// Named, versioned bundle of state machines, immutable after load.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub version: String,
    pub machines: HashMap<String, StateMachine>,
    /// Name of the machine instantiated automatically on component start,
    /// if this component designates one.
    pub entry_machine: Option<String>,
}

impl Component {
    pub fn machine(&self, name: &str) -> Option<&StateMachine> {
        self.machines.get(name)
    }
}

/// Notification policy a child machine carries toward its parent instance.
#[derive(Debug, Clone)]
pub struct ParentLinkPolicy {
    /// Event name sent to the parent on every state change of the child.
    pub on_state_change: String,
    pub include_state: bool,
    pub include_context: bool,
}

impl Default for ParentLinkPolicy {
    fn default() -> Self {
        Self {
            on_state_change: String::new(),
            include_state: true,
            include_context: false,
        }
    }
}

/// Named collection of states and transitions with a designated initial state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub name: String,
    pub states: HashMap<String, State>,
    pub initial_state: String,
    pub public_member_type: Option<String>,
    pub parent_link: Option<ParentLinkPolicy>,
    pub context_schema: Option<serde_json::Value>,
}

impl StateMachine {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// All declared transitions whose `from` matches `state`, in declaration order.
    pub fn transitions_from<'a>(&'a self, state: &str) -> Vec<&'a Transition> {
        self.state(state)
            .map(|s| s.transitions.iter().collect())
            .unwrap_or_default()
    }
}

/// Kind of a declared state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Entry,
    Regular,
    Final,
    Error,
}

impl StateKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StateKind::Final | StateKind::Error)
    }
}

/// A declared state: name, kind, optional hooks, and cascading rules.
#[derive(Debug, Clone)]
pub struct State {
    pub name: String,
    pub kind: StateKind,
    pub entry_hook: Option<String>,
    pub exit_hook: Option<String>,
    pub cascading_rules: Vec<CascadingRule>,
    /// Transitions declared with this state as `from`, in declaration order.
    pub transitions: Vec<Transition>,
}

impl State {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into(),
            kind,
            entry_hook: None,
            exit_hook: None,
            cascading_rules: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

/// Kind of a declared transition (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Regular,
    Triggerable,
    Internal,
    Timeout,
    Auto,
    InterMachine,
    CrossComponent,
}

/// Mapping of a single context key from the source instance onto the target
/// instance's initial context, with an optional rename.
#[derive(Debug, Clone)]
pub struct ContextMapping {
    pub source_path: String,
    pub target_path: String,
}

/// Configuration carried by `inter_machine`/`cross_component` transitions.
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    pub target_machine: Option<String>,
    pub target_component: Option<String>,
    pub target_event: Option<String>,
    /// `None` means "forward the full source context unmapped".
    pub context_mapping: Option<Vec<ContextMapping>>,
}

/// Parent-notification clause attached to a transition, overriding the
/// machine-level `ParentLinkPolicy` defaults for this transition only.
#[derive(Debug, Clone)]
pub struct NotifyParent {
    pub event: String,
    pub include_state: bool,
    pub include_context: bool,
}

/// A declared transition (§3).
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub event: String,
    pub kind: TransitionKind,
    pub guards: Vec<Guard>,
    pub matching_rules: Vec<MatchingRule>,
    pub disambiguation: Option<PureExpr>,
    pub triggered_hook: Option<String>,
    pub timeout_ms: Option<u64>,
    pub reset_on_transition: bool,
    pub link: LinkConfig,
    pub notify_parent: Option<NotifyParent>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            event: event.into(),
            kind: TransitionKind::Regular,
            guards: Vec::new(),
            matching_rules: Vec::new(),
            disambiguation: None,
            triggered_hook: None,
            timeout_ms: None,
            reset_on_transition: true,
            link: LinkConfig::default(),
            notify_parent: None,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

/// Comparison operator for guards and matching rules (§6 filter operator set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    In,
}

/// Reference to a literal or a `{{contextPath}}` placeholder in a guard.
#[derive(Debug, Clone)]
pub enum GuardOperand {
    Literal(ContextValue),
    ContextPath(String),
}

/// A guard clause (§3).
#[derive(Debug, Clone)]
pub enum Guard {
    /// All listed keys must resolve to a non-unset path in the event payload.
    RequiredKeysPresent(Vec<String>),
    /// Typed comparison between an event-payload path and a literal or context path.
    Compare {
        event_path: String,
        op: CompareOp,
        rhs: GuardOperand,
    },
    /// Small deterministic pure-expression mini-language (§9) — the parser
    /// lowers inline expressions it cannot express as the variants above
    /// into this form.
    Expr(PureExpr),
}

/// A closed, deterministically-evaluable expression against
/// `(context, event, publicMember)`. Never interprets arbitrary source text.
#[derive(Debug, Clone)]
pub enum PureExpr {
    CompareContextPaths {
        left_path: String,
        op: CompareOp,
        right_path: String,
        /// Which value tree `right_path` is resolved against.
        right_source: ExprSource,
    },
    And(Box<PureExpr>, Box<PureExpr>),
    Or(Box<PureExpr>, Box<PureExpr>),
    Not(Box<PureExpr>),
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprSource {
    Context,
    Event,
    PublicMember,
}

/// Routes an incoming event to instances whose paths satisfy every rule (AND).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MatchingRule {
    pub event_path: String,
    pub instance_path: String,
    pub op: CompareOp,
}

impl MatchingRule {
    pub fn equals(event_path: impl Into<String>, instance_path: impl Into<String>) -> Self {
        Self {
            event_path: event_path.into(),
            instance_path: instance_path.into(),
            op: CompareOp::Eq,
        }
    }
}

/// Declarative side-effect attached to a state entry (§3).
#[derive(Debug, Clone)]
pub struct CascadingRule {
    pub target_machine: String,
    pub target_component: Option<String>,
    pub target_state_filter: Option<String>,
    pub event: String,
    /// String values may embed `{{sourcePath}}`; expanded against the
    /// source instance's context at cascade time.
    pub payload_template: ContextValue,
}
