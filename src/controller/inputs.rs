//! Built-in input handlers, one per built-in step kind

use super::{Choice, InputHandler, Widget};
use crate::flow::{FlowOption, SliderConfig, StepCapabilities, StepDefinition, StepKind};
use crate::validation::ValidationRule;
use serde_json::{Number, Value};
use std::sync::Arc;

const MSG_AMOUNT_FORMAT: &str = "金額は半角数字で入力してください";
const MSG_NUMBER_FORMAT: &str = "数値を入力してください";

pub fn builtin_input_handlers() -> Vec<Arc<dyn InputHandler>> {
    vec![
        Arc::new(MessageInput),
        Arc::new(ChoiceInput::new(StepKind::ButtonSelect)),
        Arc::new(ChoiceInput::new(StepKind::Confirmation)),
        Arc::new(ProjectInput),
        Arc::new(TextInput),
        Arc::new(AmountInput),
        Arc::new(NumberInput),
        Arc::new(SliderInput),
        Arc::new(ProgressInput::new(StepKind::ToolCalls)),
        Arc::new(ProgressInput::new(StepKind::System)),
    ]
}

fn capabilities_of(kind: &StepKind) -> StepCapabilities {
    kind.builtin_capabilities().unwrap_or_default()
}

fn choices(options: &[FlowOption]) -> Vec<Choice> {
    options.iter().map(Choice::from_option).collect()
}

/// `min`/`max` hints become an implicit range rule.
fn range_rule(min: Option<f64>, max: Option<f64>) -> Vec<ValidationRule> {
    if min.is_none() && max.is_none() {
        Vec::new()
    } else {
        vec![ValidationRule::range(min, max)]
    }
}

/// Whole numbers stay integers so `1000` and `1000.0` route alike.
#[allow(clippy::cast_possible_truncation)]
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

fn parse_number(raw: &Value, strip: &[char]) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .map(|c| match c {
                    '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
                    _ => c,
                })
                .filter(|c| !c.is_whitespace() && !strip.contains(c))
                .collect();
            cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// Display form of an amount: `3000` becomes `3,000円`.
pub fn format_yen(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{sign}{grouped}円")
}

// ============================================================================
// Message
// ============================================================================

struct MessageInput;

impl InputHandler for MessageInput {
    fn kind(&self) -> &str {
        StepKind::Message.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&StepKind::Message)
    }

    fn render(&self, _step: &StepDefinition, _options: &[FlowOption]) -> Widget {
        Widget::None
    }
}

// ============================================================================
// Choices
// ============================================================================

struct ChoiceInput {
    kind: StepKind,
}

impl ChoiceInput {
    fn new(kind: StepKind) -> Self {
        Self { kind }
    }
}

impl InputHandler for ChoiceInput {
    fn kind(&self) -> &str {
        self.kind.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&self.kind)
    }

    fn render(&self, _step: &StepDefinition, options: &[FlowOption]) -> Widget {
        if options.is_empty() && self.kind == StepKind::Confirmation {
            return Widget::Buttons {
                choices: vec![
                    Choice::from_option(&FlowOption::new(true, "はい")),
                    Choice::from_option(&FlowOption::new(false, "いいえ")),
                ],
            };
        }
        Widget::Buttons {
            choices: choices(options),
        }
    }
}

struct ProjectInput;

impl InputHandler for ProjectInput {
    fn kind(&self) -> &str {
        StepKind::ProjectSelect.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&StepKind::ProjectSelect)
    }

    fn render(&self, _step: &StepDefinition, options: &[FlowOption]) -> Widget {
        Widget::Cards {
            choices: choices(options),
        }
    }
}

// ============================================================================
// Free-form inputs
// ============================================================================

struct TextInput;

impl InputHandler for TextInput {
    fn kind(&self) -> &str {
        StepKind::TextInput.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&StepKind::TextInput)
    }

    fn render(&self, step: &StepDefinition, _options: &[FlowOption]) -> Widget {
        Widget::Text {
            placeholder: step.placeholder.clone(),
        }
    }

    fn normalize(&self, _step: &StepDefinition, raw: Value) -> Result<Value, String> {
        Ok(match raw {
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Null => Value::String(String::new()),
            other => Value::String(crate::expression::stringify(&other)),
        })
    }
}

struct AmountInput;

impl InputHandler for AmountInput {
    fn kind(&self) -> &str {
        StepKind::AmountInput.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&StepKind::AmountInput)
    }

    fn render(&self, step: &StepDefinition, options: &[FlowOption]) -> Widget {
        let presets = options
            .iter()
            .map(|option| {
                let mut choice = Choice::from_option(option);
                if option.label.is_none() {
                    if let Some(n) = option.value.as_i64() {
                        choice.label = format_yen(n);
                    }
                }
                choice
            })
            .collect();
        Widget::Amount {
            placeholder: step.placeholder.clone(),
            min: step.min,
            max: step.max,
            presets,
        }
    }

    /// Blank stays blank so `required` reports it.
    fn normalize(&self, _step: &StepDefinition, raw: Value) -> Result<Value, String> {
        if raw.is_null() || raw.as_str().is_some_and(|s| s.trim().is_empty()) {
            return Ok(Value::String(String::new()));
        }
        match parse_number(&raw, &[',', '，', '円', '¥', '￥']) {
            Some(n) if n.fract() == 0.0 => Ok(number_value(n)),
            _ => Err(MSG_AMOUNT_FORMAT.to_string()),
        }
    }

    fn implicit_rules(&self, step: &StepDefinition) -> Vec<ValidationRule> {
        range_rule(step.min, step.max)
    }
}

struct NumberInput;

impl InputHandler for NumberInput {
    fn kind(&self) -> &str {
        StepKind::NumberInput.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&StepKind::NumberInput)
    }

    fn render(&self, step: &StepDefinition, _options: &[FlowOption]) -> Widget {
        Widget::Number {
            placeholder: step.placeholder.clone(),
            min: step.min,
            max: step.max,
        }
    }

    fn normalize(&self, _step: &StepDefinition, raw: Value) -> Result<Value, String> {
        if raw.is_null() || raw.as_str().is_some_and(|s| s.trim().is_empty()) {
            return Ok(Value::String(String::new()));
        }
        parse_number(&raw, &[','])
            .map(number_value)
            .ok_or_else(|| MSG_NUMBER_FORMAT.to_string())
    }

    fn implicit_rules(&self, step: &StepDefinition) -> Vec<ValidationRule> {
        range_rule(step.min, step.max)
    }
}

struct SliderInput;

impl SliderInput {
    fn config(step: &StepDefinition) -> SliderConfig {
        step.slider().cloned().unwrap_or(SliderConfig {
            min: step.min.unwrap_or(0.0),
            max: step.max.unwrap_or(100.0),
            step: 1.0,
            left_label: None,
            right_label: None,
            default_value: None,
        })
    }
}

impl InputHandler for SliderInput {
    fn kind(&self) -> &str {
        StepKind::SliderSelect.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&StepKind::SliderSelect)
    }

    fn render(&self, step: &StepDefinition, _options: &[FlowOption]) -> Widget {
        Widget::Slider(Self::config(step))
    }

    fn normalize(&self, _step: &StepDefinition, raw: Value) -> Result<Value, String> {
        parse_number(&raw, &[])
            .map(number_value)
            .ok_or_else(|| MSG_NUMBER_FORMAT.to_string())
    }

    fn implicit_rules(&self, step: &StepDefinition) -> Vec<ValidationRule> {
        let config = Self::config(step);
        range_rule(Some(config.min), Some(config.max))
    }
}

// ============================================================================
// Action-driven steps
// ============================================================================

struct ProgressInput {
    kind: StepKind,
}

impl ProgressInput {
    fn new(kind: StepKind) -> Self {
        Self { kind }
    }
}

impl InputHandler for ProgressInput {
    fn kind(&self) -> &str {
        self.kind.as_str()
    }

    fn capabilities(&self) -> StepCapabilities {
        capabilities_of(&self.kind)
    }

    fn render(&self, _step: &StepDefinition, _options: &[FlowOption]) -> Widget {
        Widget::Progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_value;
    use serde_json::json;

    fn step(definition: Value) -> StepDefinition {
        serde_json::from_value(definition).unwrap()
    }

    fn handler(kind: &str) -> Arc<dyn InputHandler> {
        builtin_input_handlers()
            .into_iter()
            .find(|h| h.kind() == kind)
            .unwrap()
    }

    #[test]
    fn test_every_builtin_kind_has_a_handler() {
        let kinds: Vec<String> = builtin_input_handlers().iter().map(|h| h.kind().to_string()).collect();
        for kind in [
            "message",
            "button_select",
            "text_input",
            "amount_input",
            "number_input",
            "slider_select",
            "tool_calls",
            "system",
            "confirmation",
            "project_select",
        ] {
            assert!(kinds.iter().any(|k| k == kind), "missing handler for {kind}");
            assert_eq!(
                handler(kind).capabilities(),
                StepKind::from(kind.to_string()).builtin_capabilities().unwrap()
            );
        }
    }

    #[test]
    fn test_amount_normalization() {
        let amount = handler("amount_input");
        let s = step(json!({"type": "amount_input", "min": 1000, "max": 50000}));
        assert_eq!(amount.normalize(&s, json!("3,000円")).unwrap(), json!(3000));
        assert_eq!(amount.normalize(&s, json!("５０００")).unwrap(), json!(5000));
        assert_eq!(amount.normalize(&s, json!(1200.0)).unwrap(), json!(1200));
        assert_eq!(amount.normalize(&s, json!("  ")).unwrap(), json!(""));
        assert_eq!(amount.normalize(&s, json!("12.5")).unwrap_err(), MSG_AMOUNT_FORMAT);
        assert_eq!(amount.normalize(&s, json!("abc")).unwrap_err(), MSG_AMOUNT_FORMAT);

        let rules = amount.implicit_rules(&s);
        assert!(validate_value(&json!(3000), &rules, None).valid);
        assert!(!validate_value(&json!(500), &rules, None).valid);
    }

    #[test]
    fn test_amount_presets_are_labelled_in_yen() {
        let s = step(json!({"type": "amount_input"}));
        let widget = handler("amount_input").render(&s, &[FlowOption::new(3000, "おすすめ"), serde_json::from_value(json!({"value": 10000})).unwrap()]);
        let Widget::Amount { presets, .. } = widget else {
            panic!("expected amount widget");
        };
        assert_eq!(presets[0].label, "おすすめ");
        assert_eq!(presets[1].label, "10,000円");
    }

    #[test]
    fn test_text_is_trimmed() {
        let s = step(json!({"type": "text_input", "placeholder": "お名前"}));
        let text = handler("text_input");
        assert_eq!(text.normalize(&s, json!("  山田 ")).unwrap(), json!("山田"));
        assert_eq!(text.normalize(&s, json!(42)).unwrap(), json!("42"));
        assert_eq!(
            text.render(&s, &[]),
            Widget::Text {
                placeholder: Some("お名前".to_string())
            }
        );
    }

    #[test]
    fn test_confirmation_defaults() {
        let s = step(json!({"type": "confirmation"}));
        let Widget::Buttons { choices } = handler("confirmation").render(&s, &[]) else {
            panic!("expected buttons");
        };
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0].value, json!(true));
        assert_eq!(choices[1].label, "いいえ");
    }

    #[test]
    fn test_slider_range_from_config() {
        let s = step(json!({"type": "slider_select", "options": {"min": 0, "max": 10}}));
        let slider = handler("slider_select");
        assert_eq!(slider.normalize(&s, json!("7")).unwrap(), json!(7));
        let rules = slider.implicit_rules(&s);
        assert!(!validate_value(&json!(11), &rules, None).valid);
    }

    #[test]
    fn test_format_yen() {
        assert_eq!(format_yen(0), "0円");
        assert_eq!(format_yen(999), "999円");
        assert_eq!(format_yen(1000), "1,000円");
        assert_eq!(format_yen(1_234_567), "1,234,567円");
        assert_eq!(format_yen(-5000), "-5,000円");
    }
}
