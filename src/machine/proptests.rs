//! Property-based tests for the flow machine
//!
//! These tests verify key invariants hold across arbitrary documents and
//! event sequences.

use super::*;
use crate::action::ActionResult;
use crate::flow::FlowDocument;
use crate::registry::Registry;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

// ============================================================================
// Arbitrary Generators
// ============================================================================

const KINDS: &[&str] = &["message", "button_select", "text_input", "tool_calls", "amount_input"];
const EXPRESSIONS: &[&str] = &[
    "true",
    "false",
    "responses.s0 == 'a'",
    "currentValue > 2",
    "toolResults.s1.ok",
    "responses.(",
];
const VALUES: &[&str] = &["a", "b", "c"];

fn step_name(max: usize) -> impl Strategy<Value = String> {
    // One past the end produces a dangling reference.
    (0..=max).prop_map(|i| format!("s{i}"))
}

fn arb_condition(max: usize) -> impl Strategy<Value = Value> {
    (prop::sample::select(EXPRESSIONS), step_name(max), -2i64..3).prop_map(|(expression, target, priority)| {
        json!({"expression": expression, "nextStep": target, "priority": priority})
    })
}

fn arb_option(max: usize) -> impl Strategy<Value = Value> {
    (
        prop::sample::select(VALUES),
        prop::option::of(step_name(max)),
        prop::collection::vec(arb_condition(max), 0..2),
    )
        .prop_map(|(value, next, conditions)| json!({"value": value, "nextStep": next, "conditions": conditions}))
}

fn arb_step(max: usize) -> impl Strategy<Value = Value> {
    (
        prop::sample::select(KINDS),
        prop::collection::vec(arb_option(max), 0..3),
        prop::collection::vec(arb_condition(max), 0..2),
        prop::option::of(step_name(max)),
        any::<bool>(),
        prop::option::weighted(0.3, Just(json!({"type": "storage", "config": {"action": "clear"}}))),
    )
        .prop_map(|(kind, options, conditions, next, terminal, action)| {
            json!({
                "type": kind,
                "options": options,
                "conditions": conditions,
                "nextStep": next,
                "isTerminal": terminal,
                "action": action,
            })
        })
}

fn arb_document() -> impl Strategy<Value = (Value, usize)> {
    (1usize..6)
        .prop_flat_map(|n| (prop::collection::vec(arb_step(n), n), step_name(n + 1), Just(n)))
        .prop_map(|(steps, initial, n)| {
            let steps: Map<String, Value> = steps
                .into_iter()
                .enumerate()
                .map(|(i, step)| (format!("s{i}"), step))
                .collect();
            (json!({"version": "1", "flow": {"initialStep": initial, "steps": steps}}), n)
        })
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        prop::sample::select(VALUES).prop_map(Event::answer),
        (0i64..5).prop_map(Event::answer),
        prop::option::of(0u64..6).prop_map(|epoch| Event::AutoAdvance { epoch }),
        prop::option::of(prop::sample::select(VALUES).prop_map(Value::from))
            .prop_map(|value| Event::ToolComplete { value }),
        Just(Event::Retry),
        (0u64..6, any::<bool>()).prop_map(|(invocation, ok)| Event::ActionSettled {
            invocation,
            result: if ok {
                ActionResult::success(Some(json!("a")))
            } else {
                ActionResult::retryable_failure("boom")
            },
        }),
    ]
}

fn compile(document: &Value) -> Machine {
    let document = FlowDocument::from_value(document.clone()).unwrap();
    Machine::build(&document, &Registry::empty()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    // Invariant 1: one compiled state per declared step, declared initial honored
    #[test]
    fn prop_one_state_per_step((document, n) in arb_document()) {
        let machine = compile(&document);
        prop_assert_eq!(machine.state_count(), n);

        let declared = document["flow"]["initialStep"].as_str().unwrap();
        if machine.contains(declared) {
            prop_assert_eq!(machine.initial_step(), declared);
        } else {
            prop_assert_eq!(machine.initial_step(), "s0");
        }
    }

    // Invariant 2: every compiled edge points at a declared step
    #[test]
    fn prop_no_dangling_edges((document, _n) in arb_document()) {
        let machine = compile(&document);
        for step in machine.steps() {
            let mut targets: Vec<&str> = step.conditions.iter().map(|c| c.target.as_str()).collect();
            for option in &step.options {
                targets.extend(option.next_step.as_deref());
                targets.extend(option.conditions.iter().map(|c| c.target.as_str()));
            }
            targets.extend(step.default_next.as_deref());
            targets.extend(step.auto_advance.as_deref());
            if let Completion::Target(t) = &step.completion {
                targets.push(t);
            }
            for target in targets {
                prop_assert!(machine.contains(target), "dangling edge {} -> {}", step.id, target);
            }
        }
    }

    // Invariant 3: any event sequence keeps the session inside the flow
    #[test]
    fn prop_events_keep_state_valid(
        (document, _n) in arb_document(),
        events in prop::collection::vec(arb_event(), 0..20)
    ) {
        let machine = compile(&document);
        let mut state = machine.start(Map::new()).new_state;

        for event in events {
            let before = state.clone();
            match transition(&machine, &state, event) {
                Ok(result) => {
                    prop_assert!(machine.contains(result.new_state.current_step()));
                    prop_assert!(result.new_state.epoch >= before.epoch);
                    if before.is_completed() {
                        prop_assert!(false, "completed session accepted an event");
                    }
                    state = result.new_state;
                }
                Err(_) => prop_assert_eq!(&state, &before),
            }
        }
    }

    // Invariant 4: a pending action blocks answers
    #[test]
    fn prop_pending_action_rejects_answers(value in "[a-z]{0,8}") {
        let machine = compile(&json!({"flow": {"initialStep": "s0", "steps": {
            "s0": {"type": "tool_calls", "action": "/api/check", "nextStep": "s1"},
            "s1": {"type": "text_input"}
        }}}));
        let state = machine.start(Map::new()).new_state;
        let result = transition(&machine, &state, Event::answer(value));
        prop_assert_eq!(result.unwrap_err(), TransitionError::ActionInFlight("s0".into()));
    }

    // Invariant 5: unmatched answers leave the step unchanged
    #[test]
    fn prop_unmatched_answer_holds(value in "[a-z]{1,8}".prop_filter("not an option", |v| v != "yes" && v != "no")) {
        let machine = compile(&json!({"flow": {"initialStep": "q", "steps": {
            "q": {"type": "button_select", "options": [
                {"value": "yes", "nextStep": "A"},
                {"value": "no", "nextStep": "B"},
                {"value": value.clone(), "nextStep": "missing"}
            ]},
            "A": {"isEnd": true},
            "B": {"isEnd": true}
        }}}));
        let state = machine.start(Map::new()).new_state;
        let result = transition(&machine, &state, Event::answer(value));
        prop_assert_eq!(result.unwrap_err(), TransitionError::NoMatchingTransition("q".into()));
    }
}
