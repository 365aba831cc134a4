//! End-to-end scenarios exercising `FSMRuntime` against realistic
//! multi-instance, multi-component workflows: self-loop timer discipline,
//! timeout races, cross-component cascades, restore/resync, property-routed
//! broadcast, and parent/child lifecycle linkage.

use std::sync::Arc;
use std::time::Duration;

use xcomponent_fsm::async_trait;
use xcomponent_fsm::builder::{ComponentBuilder, StateBuilder, StateMachineBuilder, TransitionBuilder};
use xcomponent_fsm::hooks::{EntryHook, HookError, HookResult, Sender, TriggeredHook};
use xcomponent_fsm::model::{CascadingRule, LinkConfig, NotifyParent, StateKind, TransitionKind};
use xcomponent_fsm::persistence::{InMemoryEventStore, InMemorySnapshotStore, PersistenceConfig, PersistenceManager};
use xcomponent_fsm::value::ContextValue;
use xcomponent_fsm::{ComponentRegistry, Event, FSMInstance, FSMRuntime, HookRegistry, InstanceStatus};

fn ctx(pairs: &[(&str, ContextValue)]) -> ContextValue {
    ContextValue::Map(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

fn get_int(value: &ContextValue, path: &str) -> Option<i64> {
    match value.get_path(path) {
        Some(ContextValue::Int(i)) => Some(*i),
        _ => None,
    }
}

// ---- Scenario A: self-loop accumulation + timer-reset discipline ----------

struct AccumulateQty;

#[async_trait]
impl TriggeredHook for AccumulateQty {
    async fn on_trigger(&self, instance: &mut FSMInstance, event: &Event, _sender: &Sender) -> HookResult<()> {
        let added = get_int(&event.payload, "qty").unwrap_or(0);
        let current = get_int(&instance.context, "qty").unwrap_or(0);
        instance.context.set_path("qty", ContextValue::Int(current + added));
        Ok(())
    }
}

fn cart_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Cart")
        .initial_state("Open")
        .state(
            StateBuilder::new("Open", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Open", "Open", "AddItem")
                        .triggered_hook("accumulate_qty")
                        .build(),
                )
                .transition(
                    TransitionBuilder::new("Open", "Abandoned", "SessionTimeout")
                        .timeout(80)
                        .reset_on_transition(true)
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("Abandoned", StateKind::Final).build())
        .build()
}

#[tokio::test]
async fn self_loop_accumulates_context_and_resets_idle_timeout() {
    let component = ComponentBuilder::new("shop").machine(cart_machine()).build();
    let mut hooks = HookRegistry::new();
    hooks.register_triggered("accumulate_qty", Arc::new(AccumulateQty));
    let runtime = FSMRuntime::new(component, hooks, None);

    let id = runtime.create_instance("Cart", ctx(&[("qty", ContextValue::Int(0))]), None).await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        runtime
            .send_event(id, Event::new("AddItem", ctx(&[("qty", ContextValue::Int(1))])))
            .await
            .unwrap();
    }

    // Three self-loops spaced 30ms apart each reset the 80ms idle timer, so
    // the cart is still open despite ~90ms of elapsed wall-clock time.
    let instance = runtime.get_instance(id).await.unwrap();
    assert_eq!(instance.current_state, "Open");
    assert_eq!(get_int(&instance.context, "qty"), Some(3));

    // No further activity: the idle timer now runs to completion.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let instance = runtime.get_instance(id).await;
    assert!(instance.is_none(), "Abandoned is terminal and disposes the instance");
}

// ---- Scenario B: an unattended instance times itself out ------------------

fn session_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Session")
        .initial_state("Active")
        .state(
            StateBuilder::new("Active", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Active", "Expired", "Idle")
                        .timeout(20)
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("Expired", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn timeout_fires_without_any_caller_driving_it() {
    let component = ComponentBuilder::new("sessions").machine(session_machine()).build();
    let runtime = FSMRuntime::new(component, HookRegistry::new(), None);
    let id = runtime.create_instance("Session", ContextValue::empty_map(), None).await.unwrap();

    assert_eq!(runtime.get_instance(id).await.unwrap().current_state, "Active");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runtime.get_instance(id).await.unwrap().current_state, "Expired");
}

// ---- Scenario C: cross-component cascade -----------------------------------

fn order_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Order")
        .initial_state("Created")
        .state(
            StateBuilder::new("Created", StateKind::Entry)
                .transition(TransitionBuilder::new("Created", "Placed", "Place").build())
                .build(),
        )
        .state(
            StateBuilder::new("Placed", StateKind::Regular)
                .cascading_rule(CascadingRule {
                    target_machine: "Payment".to_string(),
                    target_component: Some("payments".to_string()),
                    target_state_filter: Some("Pending".to_string()),
                    event: "Charge".to_string(),
                    payload_template: ContextValue::String("{{orderId}}".to_string()),
                })
                .build(),
        )
        .build()
}

fn payment_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Payment")
        .initial_state("Pending")
        .state(
            StateBuilder::new("Pending", StateKind::Entry)
                .transition(TransitionBuilder::new("Pending", "Charged", "Charge").build())
                .build(),
        )
        .state(StateBuilder::new("Charged", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn state_entry_cascades_an_event_to_another_component() {
    let orders = ComponentBuilder::new("orders").machine(order_machine()).build();
    let payments = ComponentBuilder::new("payments").machine(payment_machine()).build();

    let order_runtime = FSMRuntime::new(orders, HookRegistry::new(), None);
    let payment_runtime = FSMRuntime::new(payments, HookRegistry::new(), None);

    let registry = ComponentRegistry::new();
    registry.register(order_runtime.clone());
    registry.register(payment_runtime.clone());

    let payment_id = payment_runtime
        .create_instance("Payment", ctx(&[("orderId", "O1".into())]), None)
        .await
        .unwrap();

    let order_id = order_runtime
        .create_instance("Order", ctx(&[("orderId", "O1".into())]), None)
        .await
        .unwrap();
    order_runtime.send_event(order_id, Event::empty("Place")).await.unwrap();

    assert_eq!(order_runtime.get_instance(order_id).await.unwrap().current_state, "Placed");
    assert_eq!(payment_runtime.get_instance(payment_id).await.unwrap().current_state, "Charged");
}

// ---- Scenario D: restore from a snapshot and resynchronize timeouts -------

fn idle_session_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Session")
        .initial_state("Active")
        .state(
            StateBuilder::new("Active", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Active", "TimedOut", "Idle")
                        .timeout(5_000)
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("TimedOut", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn restored_instance_resynchronizes_an_already_expired_timeout() {
    let component = ComponentBuilder::new("sessions").machine(idle_session_machine()).build();
    let persistence = Arc::new(PersistenceManager::new(
        PersistenceConfig {
            event_sourcing: true,
            snapshots: true,
            snapshot_interval: 1,
        },
        Box::new(InMemoryEventStore::new()),
        Box::new(InMemorySnapshotStore::new()),
    ));

    let runtime1 = FSMRuntime::new(component.clone(), HookRegistry::new(), Some(persistence.clone()));
    let id = runtime1.create_instance("Session", ContextValue::empty_map(), None).await.unwrap();
    let created_at = runtime1.get_instance(id).await.unwrap().updated_at;

    // Simulate a process restart: a fresh runtime over the same durable stores.
    let (report, restored) = persistence.restore().await.unwrap();
    assert_eq!(report.restored, 1);

    let runtime2 = FSMRuntime::new(component, HookRegistry::new(), Some(persistence.clone()));
    runtime2.install_restored_instances(restored);

    // Restored long after the 5s idle timeout should have elapsed.
    let restored_at = created_at + 10_000;
    let resync = runtime2.resynchronize_timeouts(restored_at).await;
    assert_eq!(resync.expired, 1);
    assert_eq!(runtime2.get_instance(id).await.unwrap().current_state, "TimedOut");
}

// ---- Scenario E: broadcast routed by a matching rule -----------------------

fn ticket_machine() -> xcomponent_fsm::model::StateMachine {
    use xcomponent_fsm::model::MatchingRule;
    StateMachineBuilder::new("Ticket")
        .initial_state("Open")
        .state(
            StateBuilder::new("Open", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Open", "Resolved", "Resolve")
                        .matching_rule(MatchingRule::equals("ticketId", "ticketId"))
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("Resolved", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn broadcast_only_reaches_the_instance_whose_property_matches() {
    let component = ComponentBuilder::new("support").machine(ticket_machine()).build();
    let runtime = FSMRuntime::new(component, HookRegistry::new(), None);

    let t1 = runtime.create_instance("Ticket", ctx(&[("ticketId", "T1".into())]), None).await.unwrap();
    let t2 = runtime.create_instance("Ticket", ctx(&[("ticketId", "T2".into())]), None).await.unwrap();
    let t3 = runtime.create_instance("Ticket", ctx(&[("ticketId", "T3".into())]), None).await.unwrap();

    let routed = runtime
        .broadcast_event("Ticket", None, Event::new("Resolve", ctx(&[("ticketId", "T2".into())])), None)
        .await
        .unwrap();

    assert_eq!(routed, 1);
    assert_eq!(runtime.get_instance(t1).await.unwrap().current_state, "Open");
    assert_eq!(runtime.get_instance(t2).await.unwrap().current_state, "Resolved");
    assert_eq!(runtime.get_instance(t3).await.unwrap().current_state, "Open");
}

// ---- Scenario F: child auto-disposal notifies its parent -------------------

fn parent_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Parent")
        .initial_state("Idle")
        .state(
            StateBuilder::new("Idle", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Idle", "Waiting", "SpawnChild")
                        .kind(TransitionKind::InterMachine)
                        .link(LinkConfig {
                            target_machine: Some("Child".to_string()),
                            ..Default::default()
                        })
                        .build(),
                )
                .build(),
        )
        .state(
            StateBuilder::new("Waiting", StateKind::Regular)
                .transition(TransitionBuilder::new("Waiting", "Done", "ChildDone").build())
                .build(),
        )
        .state(StateBuilder::new("Done", StateKind::Regular).build())
        .build()
}

fn child_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Child")
        .initial_state("Working")
        .state(
            StateBuilder::new("Working", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Working", "Done", "Finish")
                        .notify_parent(NotifyParent {
                            event: "ChildDone".to_string(),
                            include_state: true,
                            include_context: false,
                        })
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("Done", StateKind::Final).build())
        .build()
}

#[tokio::test]
async fn child_completion_auto_disposes_and_notifies_the_parent() {
    let component = ComponentBuilder::new("workflow")
        .machine(parent_machine())
        .machine(child_machine())
        .build();
    let runtime = FSMRuntime::new(component, HookRegistry::new(), None);

    let parent_id = runtime.create_instance("Parent", ContextValue::empty_map(), None).await.unwrap();
    runtime.send_event(parent_id, Event::empty("SpawnChild")).await.unwrap();
    assert_eq!(runtime.get_instance(parent_id).await.unwrap().current_state, "Waiting");

    let child_id = runtime
        .list_instances()
        .await
        .into_iter()
        .find(|i| i.machine_name == "Child")
        .expect("SpawnChild should have created a Child instance")
        .id;

    runtime.send_event(child_id, Event::empty("Finish")).await.unwrap();

    assert!(runtime.get_instance(child_id).await.is_none(), "terminal, non-entry-point instances auto-dispose");
    assert_eq!(runtime.get_instance(parent_id).await.unwrap().current_state, "Done");
}

// ---- Scenario G: cross-component event dispatch honors the source
// transition's mandatory matching rules, not the target's --------------------

fn dispatcher_machine() -> xcomponent_fsm::model::StateMachine {
    use xcomponent_fsm::model::{MatchingRule, Transition};
    let mut dispatch = Transition::new("Idle", "Dispatched", "Dispatch");
    dispatch.kind = TransitionKind::CrossComponent;
    dispatch.matching_rules = vec![MatchingRule::equals("workerId", "workerId")];
    dispatch.link = LinkConfig {
        target_machine: Some("Worker".to_string()),
        target_component: Some("workers".to_string()),
        target_event: Some("Assign".to_string()),
        context_mapping: None,
    };
    StateMachineBuilder::new("Dispatcher")
        .initial_state("Idle")
        .state(StateBuilder::new("Idle", StateKind::Entry).transition(dispatch).build())
        .state(StateBuilder::new("Dispatched", StateKind::Regular).build())
        .build()
}

fn worker_machine() -> xcomponent_fsm::model::StateMachine {
    // No matching rule declared on the target's own transition: the
    // filtering that matters here comes entirely from the dispatcher's
    // mandatory matching rules, evaluated before the event is ever offered.
    StateMachineBuilder::new("Worker")
        .initial_state("Idle")
        .state(
            StateBuilder::new("Idle", StateKind::Entry)
                .transition(TransitionBuilder::new("Idle", "Assigned", "Assign").build())
                .build(),
        )
        .state(StateBuilder::new("Assigned", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn cross_component_dispatch_filters_by_the_source_transitions_matching_rules() {
    let dispatchers = ComponentBuilder::new("dispatchers").machine(dispatcher_machine()).build();
    let workers = ComponentBuilder::new("workers").machine(worker_machine()).build();

    let dispatcher_runtime = FSMRuntime::new(dispatchers, HookRegistry::new(), None);
    let worker_runtime = FSMRuntime::new(workers, HookRegistry::new(), None);

    let registry = ComponentRegistry::new();
    registry.register(dispatcher_runtime.clone());
    registry.register(worker_runtime.clone());

    let w1 = worker_runtime.create_instance("Worker", ctx(&[("workerId", "W1".into())]), None).await.unwrap();
    let w2 = worker_runtime.create_instance("Worker", ctx(&[("workerId", "W2".into())]), None).await.unwrap();

    let dispatcher_id = dispatcher_runtime
        .create_instance("Dispatcher", ctx(&[("workerId", "W2".into())]), None)
        .await
        .unwrap();
    dispatcher_runtime.send_event(dispatcher_id, Event::empty("Dispatch")).await.unwrap();

    assert_eq!(dispatcher_runtime.get_instance(dispatcher_id).await.unwrap().current_state, "Dispatched");
    assert_eq!(worker_runtime.get_instance(w1).await.unwrap().current_state, "Idle");
    assert_eq!(worker_runtime.get_instance(w2).await.unwrap().current_state, "Assigned");
}

// ---- Scenario H: a same-state Internal transition is not a self-loop ------
// it runs the entry hook again and unconditionally cancels-and-rearms every
// timer of the state, unlike a true self-loop.

struct CountEntries(std::sync::atomic::AtomicUsize);

#[async_trait]
impl EntryHook for CountEntries {
    async fn on_enter(&self, _instance: &mut FSMInstance, _sender: &Sender) -> HookResult<()> {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

fn runner_machine() -> xcomponent_fsm::model::StateMachine {
    use xcomponent_fsm::model::Transition;
    let mut tick = Transition::new("Running", "Running", "Tick");
    tick.kind = TransitionKind::Internal;
    StateMachineBuilder::new("Runner")
        .initial_state("Running")
        .state(
            StateBuilder::new("Running", StateKind::Entry)
                .entry_hook("count_entries")
                .transition(tick)
                .transition(
                    TransitionBuilder::new("Running", "Expired", "Expire")
                        .timeout(80)
                        .reset_on_transition(true)
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("Expired", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn same_state_internal_transition_reruns_entry_hook_and_rearms_all_timers() {
    let component = ComponentBuilder::new("runners").machine(runner_machine()).build();
    let mut hooks = HookRegistry::new();
    let counter = Arc::new(CountEntries(std::sync::atomic::AtomicUsize::new(0)));
    hooks.register_entry("count_entries", counter.clone());
    let runtime = FSMRuntime::new(component, hooks, None);

    let id = runtime.create_instance("Runner", ContextValue::empty_map(), None).await.unwrap();
    assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1, "entry hook runs on creation");

    tokio::time::sleep(Duration::from_millis(30)).await;
    runtime.send_event(id, Event::empty("Tick")).await.unwrap();
    assert_eq!(
        counter.0.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "a same-state Internal transition is not a self-loop: the entry hook runs again"
    );
    assert_eq!(runtime.get_instance(id).await.unwrap().current_state, "Running");

    tokio::time::sleep(Duration::from_millis(30)).await;
    runtime.send_event(id, Event::empty("Tick")).await.unwrap();
    assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 3);

    // Each Tick rearmed Expire's 80ms timer; total elapsed since creation is
    // ~60ms but only ~30ms since the last Tick, so it should not have fired.
    assert_eq!(runtime.get_instance(id).await.unwrap().current_state, "Running");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.get_instance(id).await.unwrap().current_state, "Expired");
}

// ---- Propagation policy (§7): guard misses and hook failures ------------

struct AlwaysFails;

#[async_trait]
impl TriggeredHook for AlwaysFails {
    async fn on_trigger(&self, _instance: &mut FSMInstance, _event: &Event, _sender: &Sender) -> HookResult<()> {
        Err(HookError("boom".to_string()))
    }
}

fn flaky_machine() -> xcomponent_fsm::model::StateMachine {
    StateMachineBuilder::new("Flaky")
        .initial_state("Start")
        .state(
            StateBuilder::new("Start", StateKind::Entry)
                .transition(
                    TransitionBuilder::new("Start", "Running", "Go")
                        .guard(xcomponent_fsm::model::Guard::RequiredKeysPresent(vec!["token".to_string()]))
                        .build(),
                )
                .transition(
                    TransitionBuilder::new("Start", "Crashed", "Break")
                        .triggered_hook("always_fails")
                        .build(),
                )
                .build(),
        )
        .state(StateBuilder::new("Running", StateKind::Regular).build())
        .state(StateBuilder::new("Crashed", StateKind::Regular).build())
        .build()
}

#[tokio::test]
async fn guard_miss_is_a_silent_no_op_not_a_caller_error() {
    let component = ComponentBuilder::new("flaky").machine(flaky_machine()).build();
    let runtime = FSMRuntime::new(component, HookRegistry::new(), None);
    let id = runtime.create_instance("Flaky", ContextValue::empty_map(), None).await.unwrap();

    let result = runtime.send_event(id, Event::empty("Go")).await;
    assert!(result.is_ok());
    assert_eq!(runtime.get_instance(id).await.unwrap().current_state, "Start");
    assert_eq!(runtime.ignored_event_count(), 1);
}

#[tokio::test]
async fn hook_failure_moves_instance_to_error_without_rejecting_the_caller() {
    let component = ComponentBuilder::new("flaky").machine(flaky_machine()).build();
    let mut hooks = HookRegistry::new();
    hooks.register_triggered("always_fails", Arc::new(AlwaysFails));
    let runtime = FSMRuntime::new(component, hooks, None);
    let id = runtime.create_instance("Flaky", ContextValue::empty_map(), None).await.unwrap();

    let mut lifecycle = runtime.subscribe_lifecycle();
    let result = runtime.send_event(id, Event::empty("Break")).await;
    assert!(result.is_ok(), "a hook failure is a business-level outcome, not a rejection");

    let instance = runtime.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Error);

    let saw_error = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            if let Ok(xcomponent_fsm::LifecycleEvent::InstanceError { instance_id, .. }) = lifecycle.recv().await {
                if instance_id == id {
                    return;
                }
            }
        }
    })
    .await;
    assert!(saw_error.is_ok(), "expected an instance_error lifecycle event");
}
