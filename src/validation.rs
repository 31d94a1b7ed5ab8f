//! Field validation
//!
//! Every rule runs; failures are collected in rule order so the user sees
//! all problems with an answer at once.

use crate::expression::{self, stringify};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

const MSG_REQUIRED: &str = "この項目は必須です";
const MSG_PATTERN: &str = "入力形式が正しくありません";
const MSG_NOT_A_NUMBER: &str = "数値を入力してください";
const MSG_EXPRESSION: &str = "入力値が条件を満たしていません";

/// One field-level problem the user can fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    pub code: String,
}

impl ValidationError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
            code: code.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn messages(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.message.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleKind {
    Required,
    Pattern {
        pattern: String,
    },
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    Range {
        min: Option<f64>,
        max: Option<f64>,
    },
    Expression {
        expression: String,
    },
    /// Runs the named registered validator; passes when none is registered.
    Custom {
        name: Option<String>,
        params: Value,
    },
    /// Skipped at validation time with a warning.
    Unknown {
        kind: String,
    },
}

impl RuleKind {
    pub fn code(&self) -> &str {
        match self {
            RuleKind::Required => "required",
            RuleKind::Pattern { .. } => "pattern",
            RuleKind::Length { .. } => "length",
            RuleKind::Range { .. } => "range",
            RuleKind::Expression { .. } => "expression",
            RuleKind::Custom { .. } => "custom",
            RuleKind::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawRule")]
pub struct ValidationRule {
    pub kind: RuleKind,
    pub message: Option<String>,
}

impl ValidationRule {
    pub fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn required() -> Self {
        Self::new(RuleKind::Required)
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::new(RuleKind::Pattern {
            pattern: pattern.into(),
        })
    }

    pub fn length(min: Option<usize>, max: Option<usize>) -> Self {
        Self::new(RuleKind::Length { min, max })
    }

    pub fn range(min: Option<f64>, max: Option<f64>) -> Self {
        Self::new(RuleKind::Range { min, max })
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self::new(RuleKind::Expression {
            expression: expression.into(),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    #[serde(rename = "type", alias = "kind")]
    kind: String,
    message: Option<String>,
    error_message: Option<String>,
    pattern: Option<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    min: Option<f64>,
    max: Option<f64>,
    expression: Option<String>,
    #[serde(alias = "validator")]
    name: Option<String>,
    #[serde(default)]
    params: Value,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn as_length(n: Option<f64>) -> Option<usize> {
    n.filter(|n| *n >= 0.0).map(|n| n as usize)
}

impl From<RawRule> for ValidationRule {
    fn from(raw: RawRule) -> Self {
        let kind = match raw.kind.as_str() {
            "required" => RuleKind::Required,
            "pattern" => match raw.pattern {
                Some(pattern) => RuleKind::Pattern { pattern },
                // A pattern rule without a pattern accepts anything
                None => RuleKind::Custom {
                    name: None,
                    params: Value::Null,
                },
            },
            "length" => RuleKind::Length {
                min: raw.min_length.or_else(|| as_length(raw.min)),
                max: raw.max_length.or_else(|| as_length(raw.max)),
            },
            "range" => RuleKind::Range {
                min: raw.min,
                max: raw.max,
            },
            "expression" => match raw.expression {
                Some(expression) => RuleKind::Expression { expression },
                None => RuleKind::Custom {
                    name: None,
                    params: Value::Null,
                },
            },
            "custom" => RuleKind::Custom {
                name: raw.name,
                params: raw.params,
            },
            other => RuleKind::Unknown {
                kind: other.to_string(),
            },
        };
        Self {
            kind,
            message: raw.message.or(raw.error_message),
        }
    }
}

// ============================================================================
// Rule list parsing
// ============================================================================

/// `deserialize_with` helper accepting every rule-list shape a document may use.
pub fn deserialize_rules<'de, D>(deserializer: D) -> Result<Vec<ValidationRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    rules_from_value(raw.unwrap_or(Value::Null)).map_err(serde::de::Error::custom)
}

/// Accepts a rule list, a single rule, a flag object
/// (`{"required": true, "min": 1000}`) or the shorthand string form.
pub fn rules_from_value(value: Value) -> Result<Vec<ValidationRule>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(parse_shorthand(&s)),
        Value::Array(items) => {
            let mut rules = Vec::new();
            for item in items {
                rules.extend(rules_from_value(item)?);
            }
            Ok(rules)
        }
        Value::Object(map) if map.contains_key("type") || map.contains_key("kind") => {
            serde_json::from_value::<ValidationRule>(Value::Object(map))
                .map(|rule| vec![rule])
                .map_err(|e| format!("invalid validation rule: {e}"))
        }
        Value::Object(map) => Ok(rules_from_flags(&map)),
        other => Err(format!("unsupported validation rules: {other}")),
    }
}

fn rules_from_flags(map: &Map<String, Value>) -> Vec<ValidationRule> {
    let message = map.get("message").and_then(Value::as_str);
    let mut rules = Vec::new();

    if map.get("required").and_then(Value::as_bool) == Some(true) {
        rules.push(ValidationRule::required());
    }
    if let Some(pattern) = map.get("pattern").and_then(Value::as_str) {
        rules.push(ValidationRule::pattern(pattern));
    }
    let min_length = map.get("minLength").and_then(Value::as_u64);
    let max_length = map.get("maxLength").and_then(Value::as_u64);
    if min_length.is_some() || max_length.is_some() {
        rules.push(ValidationRule::length(
            min_length.and_then(|n| usize::try_from(n).ok()),
            max_length.and_then(|n| usize::try_from(n).ok()),
        ));
    }
    let min = map.get("min").and_then(Value::as_f64);
    let max = map.get("max").and_then(Value::as_f64);
    if min.is_some() || max.is_some() {
        rules.push(ValidationRule::range(min, max));
    }
    if let Some(expression) = map.get("expression").and_then(Value::as_str) {
        rules.push(ValidationRule::expression(expression));
    }

    if let Some(message) = message {
        for rule in &mut rules {
            rule.message = Some(message.to_string());
        }
    }
    rules
}

/// Parse `"required|min:1000|max:50000|pattern:^\d+$"`.
///
/// `pattern:` consumes the rest of the string so the regex may contain `|`.
pub fn parse_shorthand(text: &str) -> Vec<ValidationRule> {
    let mut rules: Vec<ValidationRule> = Vec::new();
    let mut range_at: Option<usize> = None;
    let mut length_at: Option<usize> = None;
    let mut rest = text.trim();

    while !rest.is_empty() {
        if let Some(pattern) = rest.strip_prefix("pattern:") {
            rules.push(ValidationRule::pattern(pattern));
            break;
        }
        let (token, tail) = rest.split_once('|').unwrap_or((rest, ""));
        rest = tail.trim_start();
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (name, arg) = match token.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (token, None),
        };

        match (name, arg) {
            ("required", None) => rules.push(ValidationRule::required()),
            ("min" | "max", Some(arg)) => {
                let Ok(bound) = arg.parse::<f64>() else {
                    tracing::warn!(token = %token, "Ignoring validation shorthand with non-numeric bound");
                    continue;
                };
                let idx = *range_at.get_or_insert_with(|| {
                    rules.push(ValidationRule::range(None, None));
                    rules.len() - 1
                });
                if let RuleKind::Range { min, max } = &mut rules[idx].kind {
                    if name == "min" {
                        *min = Some(bound);
                    } else {
                        *max = Some(bound);
                    }
                }
            }
            ("minLength" | "maxLength", Some(arg)) => {
                let Ok(bound) = arg.parse::<usize>() else {
                    tracing::warn!(token = %token, "Ignoring validation shorthand with invalid length");
                    continue;
                };
                let idx = *length_at.get_or_insert_with(|| {
                    rules.push(ValidationRule::length(None, None));
                    rules.len() - 1
                });
                if let RuleKind::Length { min, max } = &mut rules[idx].kind {
                    if name == "minLength" {
                        *min = Some(bound);
                    } else {
                        *max = Some(bound);
                    }
                }
            }
            (name, None) => match presets::by_name(name) {
                Some(rule) => rules.push(rule),
                None => rules.push(ValidationRule::new(RuleKind::Unknown {
                    kind: name.to_string(),
                })),
            },
            (name, Some(_)) => rules.push(ValidationRule::new(RuleKind::Unknown {
                kind: name.to_string(),
            })),
        }
    }
    rules
}

// ============================================================================
// Evaluation
// ============================================================================

/// Extension point for `custom` rules
pub trait CustomValidator: Send + Sync {
    /// `Err` carries the default message for the failure.
    fn validate(&self, value: &Value, params: &Value, scope: &Value) -> Result<(), String>;
}

pub type CustomValidators = HashMap<String, Arc<dyn CustomValidator>>;

/// Run every rule against one value.
pub fn validate_value(
    value: &Value,
    rules: &[ValidationRule],
    scope: Option<&Value>,
) -> ValidationResult {
    validate_value_with(value, rules, scope, &CustomValidators::new())
}

pub fn validate_value_with(
    value: &Value,
    rules: &[ValidationRule],
    scope: Option<&Value>,
    custom: &CustomValidators,
) -> ValidationResult {
    let mut errors = Vec::new();
    for rule in rules {
        check_rule(value, rule, scope, custom, &mut errors);
    }
    ValidationResult::from_errors(errors)
}

/// Validate several named fields, tagging each error with its field.
pub fn validate_fields(
    values: &Map<String, Value>,
    field_rules: &IndexMap<String, Vec<ValidationRule>>,
    scope: Option<&Value>,
) -> ValidationResult {
    let mut errors = Vec::new();
    for (field, rules) in field_rules {
        let value = values.get(field).unwrap_or(&Value::Null);
        let result = validate_value(value, rules, scope);
        errors.extend(result.errors.into_iter().map(|mut e| {
            e.field = Some(field.clone());
            e
        }));
    }
    ValidationResult::from_errors(errors)
}

fn check_rule(
    value: &Value,
    rule: &ValidationRule,
    scope: Option<&Value>,
    custom: &CustomValidators,
    errors: &mut Vec<ValidationError>,
) {
    let code = rule.kind.code();
    let message = |default: String| rule.message.clone().unwrap_or(default);

    match &rule.kind {
        RuleKind::Required => {
            if is_blank(value) {
                errors.push(ValidationError::new(code, message(MSG_REQUIRED.to_string())));
            }
        }
        RuleKind::Pattern { pattern } => match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(&text_of(value)) {
                    errors.push(ValidationError::new(code, message(MSG_PATTERN.to_string())));
                }
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid validation pattern");
                errors.push(ValidationError::new(code, message(MSG_PATTERN.to_string())));
            }
        },
        RuleKind::Length { min, max } => {
            let len = text_of(value).chars().count();
            if let Some(min) = min.filter(|m| len < *m) {
                errors.push(ValidationError::new(
                    code,
                    message(format!("{min}文字以上で入力してください")),
                ));
            }
            if let Some(max) = max.filter(|m| len > *m) {
                errors.push(ValidationError::new(
                    code,
                    message(format!("{max}文字以内で入力してください")),
                ));
            }
        }
        RuleKind::Range { min, max } => match numeric_value(value) {
            None => errors.push(ValidationError::new(code, message(MSG_NOT_A_NUMBER.to_string()))),
            Some(n) => {
                if let Some(min) = min.filter(|m| n < *m) {
                    errors.push(ValidationError::new(
                        code,
                        message(format!("{}以上の値を入力してください", stringify(&Value::from(min)))),
                    ));
                }
                if let Some(max) = max.filter(|m| n > *m) {
                    errors.push(ValidationError::new(
                        code,
                        message(format!("{}以下の値を入力してください", stringify(&Value::from(max)))),
                    ));
                }
            }
        },
        RuleKind::Expression { expression } => {
            let scope = expression_scope(value, scope);
            let result = expression::evaluate(expression, &scope);
            if !result.success {
                let detail = result.error.unwrap_or_default();
                errors.push(ValidationError::new(
                    code,
                    message(format!("バリデーションエラー: {detail}")),
                ));
            } else if !result.is_truthy() {
                errors.push(ValidationError::new(code, message(MSG_EXPRESSION.to_string())));
            }
        }
        RuleKind::Custom { name, params } => {
            let Some(validator) = name.as_ref().and_then(|n| custom.get(n)) else {
                return;
            };
            let scope = scope.cloned().unwrap_or_else(|| Value::Object(Map::new()));
            if let Err(default) = validator.validate(value, params, &scope) {
                errors.push(ValidationError::new(code, message(default)));
            }
        }
        RuleKind::Unknown { kind } => {
            tracing::warn!(rule = %kind, "Unknown validation rule, skipping");
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => stringify(other),
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Caller scope plus `currentValue`, with the conversation maps always present.
fn expression_scope(value: &Value, scope: Option<&Value>) -> Value {
    let mut map = match scope {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    for key in ["responses", "toolResults", "metadata"] {
        map.entry(key).or_insert_with(|| Value::Object(Map::new()));
    }
    map.insert("currentValue".to_string(), value.clone());
    Value::Object(map)
}

/// Ready-made rules for common field formats
pub mod presets {
    use super::ValidationRule;

    pub fn email() -> ValidationRule {
        ValidationRule::pattern(r"^[^\s@]+@[^\s@]+\.[^\s@]+$")
            .with_message("有効なメールアドレスを入力してください")
    }

    pub fn phone() -> ValidationRule {
        ValidationRule::pattern("^[0-9-]+$").with_message("有効な電話番号を入力してください")
    }

    pub fn url() -> ValidationRule {
        ValidationRule::pattern(r"^https?://[^\s]+$").with_message("有効なURLを入力してください")
    }

    pub fn number() -> ValidationRule {
        ValidationRule::pattern("^[0-9]+$").with_message("数値を入力してください")
    }

    pub fn positive_number() -> ValidationRule {
        ValidationRule::expression("currentValue > 0")
            .with_message("0より大きい数値を入力してください")
    }

    pub fn by_name(name: &str) -> Option<ValidationRule> {
        match name {
            "email" => Some(email()),
            "phone" => Some(phone()),
            "url" => Some(url()),
            "number" | "numeric" => Some(number()),
            "positiveNumber" | "positive_number" => Some(positive_number()),
            _ => None,
        }
    }
}
