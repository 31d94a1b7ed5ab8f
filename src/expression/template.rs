//! Text interpolation over a conversation scope

use super::eval::stringify;
use super::Expression;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static EXPRESSION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("expression token pattern is valid"));

static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("path token pattern is valid")
});

static MESSAGE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\$?)\{([^{}]+)\}").expect("message token pattern is valid"));

/// Resolve a dotted path (`responses.amount`, `items.0.name`) inside a scope.
pub fn lookup_path<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// True when the path resolves to something other than null or an empty string.
pub fn has_value(scope: &Value, path: &str) -> bool {
    match lookup_path(scope, path) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Replace `${expr}` tokens with their evaluated value.
///
/// A token whose expression fails is left untouched, so rendering already
/// rendered text is a no-op.
pub fn render_template(template: &str, scope: &Value) -> String {
    EXPRESSION_TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            let result = Expression::evaluate_source(&caps[1], scope);
            if result.success {
                stringify(&result.value)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Replace `{{path}}` tokens with the value found at that path.
pub fn interpolate_paths(template: &str, scope: &Value) -> String {
    PATH_TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            lookup_path(scope, &caps[1]).map_or_else(|| caps[0].to_string(), stringify)
        })
        .into_owned()
}

/// Apply [`interpolate_paths`] to every string inside a JSON document.
///
/// A string that is exactly one `{{path}}` token is replaced by the raw value
/// so numbers and objects keep their type in request bodies.
pub fn interpolate_deep(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = PATH_TOKEN.captures(s) {
                if caps[0].len() == s.len() {
                    if let Some(found) = lookup_path(scope, &caps[1]) {
                        return found.clone();
                    }
                }
            }
            Value::String(interpolate_paths(s, scope))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_deep(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_deep(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a step message: `{path}` looks a value up, `${expr}` evaluates.
pub fn render_message(template: &str, scope: &Value) -> String {
    MESSAGE_TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            let body = &caps[2];
            let rendered = if caps[1].is_empty() {
                lookup_path(scope, body).map(stringify)
            } else {
                let result = Expression::evaluate_source(body, scope);
                result.success.then(|| stringify(&result.value))
            };
            rendered.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
