//! Property-based tests for the expression evaluator

use super::*;
use proptest::prelude::*;
use serde_json::json;

fn arb_scope() -> impl Strategy<Value = Value> {
    (any::<i32>(), "[a-z]{0,8}", any::<bool>()).prop_map(|(amount, name, flag)| {
        json!({
            "responses": {"amount": amount, "name": name},
            "toolResults": {"auth": {"ok": flag}},
            "errors": {}
        })
    })
}

fn arb_atom() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("responses.amount".to_string()),
        Just("responses.name".to_string()),
        Just("toolResults.auth.ok".to_string()),
        Just("responses.missing".to_string()),
        Just("nothing.here".to_string()),
        (0i64..100_000).prop_map(|n| n.to_string()),
        "[a-z]{0,5}".prop_map(|s| format!("'{s}'")),
        Just("null".to_string()),
        Just("true".to_string()),
    ]
}

fn arb_expression_text() -> impl Strategy<Value = String> {
    let ops = prop_oneof![
        Just("+"),
        Just("-"),
        Just("*"),
        Just("/"),
        Just("%"),
        Just("=="),
        Just("!="),
        Just("<"),
        Just(">="),
        Just("and"),
        Just("||"),
    ];
    arb_atom().prop_recursive(4, 32, 2, move |inner| {
        prop_oneof![
            (inner.clone(), ops.clone(), inner.clone()).prop_map(|(a, op, b)| format!("{a} {op} {b}")),
            inner.clone().prop_map(|a| format!("!({a})")),
            (inner.clone(), inner.clone(), inner).prop_map(|(c, a, b)| format!("({c}) ? {a} : {b}")),
        ]
    })
}

proptest! {
    #[test]
    fn prop_evaluate_never_panics(text in arb_expression_text(), scope in arb_scope()) {
        let result = evaluate(&text, &scope);
        prop_assert_eq!(result.success, result.error.is_none());
    }

    #[test]
    fn prop_arbitrary_text_never_panics(text in "\\PC{0,40}", scope in arb_scope()) {
        let result = evaluate(&text, &scope);
        if !result.success {
            prop_assert!(result.error.is_some());
            prop_assert!(!result.is_truthy());
        }
    }

    #[test]
    fn prop_missing_paths_always_fail(segment in "[a-z]{1,8}", scope in arb_scope()) {
        let text = format!("toolResults.absent_{segment} > 0");
        prop_assert!(!evaluate(&text, &scope).success);
    }

    #[test]
    fn prop_render_template_without_tokens_is_identity(text in "[^$]{0,40}", scope in arb_scope()) {
        prop_assert_eq!(render_template(&text, &scope), text);
    }

    #[test]
    fn prop_integer_comparison_matches_rust(a in any::<i32>(), b in any::<i32>()) {
        let scope = json!({"a": a, "b": b});
        prop_assert_eq!(evaluate("a < b", &scope).value, json!(a < b));
        prop_assert_eq!(evaluate("a == b", &scope).value, json!(a == b));
    }
}
