//! Flow definition documents
//!
//! A flow document is untrusted input: parsing is permissive about field
//! spellings and shapes, and structural problems (dangling targets, a missing
//! initial step) are left for the machine builder to downgrade to
//! diagnostics.

use crate::action::ActionDefinition;
use crate::expression::Prioritized;
use crate::options::DynamicOptionsConfig;
use crate::validation::ValidationRule;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type StepId = String;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Invalid flow document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cannot read flow document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Flow document declares no steps")]
    Empty,
}

/// `{version, flow: {initialStep, steps}}`
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDocument {
    #[serde(default)]
    pub version: Value,
    pub flow: FlowBody,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowBody {
    #[serde(default)]
    pub initial_step: Option<StepId>,
    /// Declaration order is kept; it decides the initial-step fallback.
    pub steps: IndexMap<StepId, StepDefinition>,
}

impl FlowDocument {
    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Accepts the wrapped form or a bare `{initialStep, steps}` body.
    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        let value = match value {
            Value::Object(map) if !map.contains_key("flow") && map.contains_key("steps") => {
                serde_json::json!({ "flow": Value::Object(map) })
            }
            other => other,
        };
        Ok(serde_json::from_value(value)?)
    }

    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path).map_err(|source| FlowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn version_label(&self) -> String {
        match &self.version {
            Value::Null => "unversioned".to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: StepKind,
    #[serde(default)]
    pub options: Option<StepOptions>,
    #[serde(default)]
    pub dynamic_options: Option<DynamicOptionsConfig>,
    #[serde(default)]
    pub conditions: Vec<ConditionalTransition>,
    #[serde(
        default,
        alias = "validationRules",
        deserialize_with = "crate::validation::deserialize_rules"
    )]
    pub validation: Vec<ValidationRule>,
    #[serde(default, deserialize_with = "crate::action::deserialize_action")]
    pub action: Option<ActionDefinition>,
    #[serde(default)]
    pub next_step: Option<StepId>,
    #[serde(default, alias = "isEnd")]
    pub is_terminal: bool,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl StepDefinition {
    /// Static choices declared inline, if any.
    pub fn static_options(&self) -> &[FlowOption] {
        match &self.options {
            Some(StepOptions::List(options)) => options,
            _ => &[],
        }
    }

    /// Dynamic source, from either `dynamicOptions` or `options`.
    pub fn dynamic_source(&self) -> Option<&DynamicOptionsConfig> {
        self.dynamic_options.as_ref().or(match &self.options {
            Some(StepOptions::Dynamic(config)) => Some(config),
            _ => None,
        })
    }

    pub fn slider(&self) -> Option<&SliderConfig> {
        match &self.options {
            Some(StepOptions::Slider(config)) => Some(config),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepOptions {
    List(Vec<FlowOption>),
    Dynamic(DynamicOptionsConfig),
    Slider(SliderConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliderConfig {
    pub min: f64,
    pub max: f64,
    #[serde(default = "default_slider_step")]
    pub step: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<f64>,
}

fn default_slider_step() -> f64 {
    1.0
}

/// One selectable answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOption {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<StepId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionalTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl FlowOption {
    pub fn new(value: impl Into<Value>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: Some(label.into()),
            next_step: None,
            conditions: Vec::new(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_next_step(mut self, step: impl Into<StepId>) -> Self {
        self.next_step = Some(step.into());
        self
    }

    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| crate::expression::stringify(&self.value))
    }
}

/// Guarded edge to another step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalTransition {
    #[serde(alias = "condition")]
    pub expression: String,
    #[serde(alias = "nextStep")]
    pub target: StepId,
    #[serde(default)]
    pub priority: i64,
}

impl Prioritized for ConditionalTransition {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn target(&self) -> &str {
        &self.target
    }
}

// ============================================================================
// Step kinds
// ============================================================================

/// What a step kind can do, fixed when the machine is compiled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCapabilities {
    pub can_auto_advance: bool,
    pub requires_validation: bool,
    pub produces_value: bool,
    pub awaits_completion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    #[default]
    Message,
    ButtonSelect,
    TextInput,
    AmountInput,
    NumberInput,
    SliderSelect,
    ToolCalls,
    System,
    Confirmation,
    ProjectSelect,
    /// Resolved through a registered input handler
    Custom(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::Message => "message",
            StepKind::ButtonSelect => "button_select",
            StepKind::TextInput => "text_input",
            StepKind::AmountInput => "amount_input",
            StepKind::NumberInput => "number_input",
            StepKind::SliderSelect => "slider_select",
            StepKind::ToolCalls => "tool_calls",
            StepKind::System => "system",
            StepKind::Confirmation => "confirmation",
            StepKind::ProjectSelect => "project_select",
            StepKind::Custom(name) => name,
        }
    }

    /// Capabilities of built-in kinds; custom kinds ask the registry.
    pub fn builtin_capabilities(&self) -> Option<StepCapabilities> {
        let caps = match self {
            StepKind::Message => StepCapabilities {
                can_auto_advance: true,
                ..StepCapabilities::default()
            },
            StepKind::ButtonSelect | StepKind::Confirmation | StepKind::ProjectSelect => {
                StepCapabilities {
                    produces_value: true,
                    ..StepCapabilities::default()
                }
            }
            StepKind::TextInput
            | StepKind::AmountInput
            | StepKind::NumberInput
            | StepKind::SliderSelect => StepCapabilities {
                requires_validation: true,
                produces_value: true,
                ..StepCapabilities::default()
            },
            StepKind::ToolCalls | StepKind::System => StepCapabilities {
                awaits_completion: true,
                ..StepCapabilities::default()
            },
            StepKind::Custom(_) => return None,
        };
        Some(caps)
    }
}

impl From<String> for StepKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "message" => StepKind::Message,
            "button_select" => StepKind::ButtonSelect,
            "text_input" => StepKind::TextInput,
            "amount_input" => StepKind::AmountInput,
            "number_input" => StepKind::NumberInput,
            "slider_select" => StepKind::SliderSelect,
            "tool_calls" => StepKind::ToolCalls,
            "system" => StepKind::System,
            "confirmation" => StepKind::Confirmation,
            "project_select" => StepKind::ProjectSelect,
            _ => StepKind::Custom(s),
        }
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "version": "1.2",
            "flow": {
                "initialStep": "welcome",
                "steps": {
                    "welcome": {
                        "type": "message",
                        "message": "ようこそ",
                        "nextStep": "purpose"
                    },
                    "purpose": {
                        "type": "button_select",
                        "message": "寄付の目的は？",
                        "options": [
                            {"value": "education", "label": "教育", "nextStep": "amount"},
                            {"value": "health", "label": "医療",
                             "conditions": [{"condition": "responses.amount > 0", "nextStep": "done", "priority": 2}]}
                        ]
                    },
                    "amount": {
                        "type": "amount_input",
                        "validation": "required|min:1000",
                        "min": 1000,
                        "nextStep": "done"
                    },
                    "ratio": {
                        "type": "slider_select",
                        "options": {"min": 0, "max": 100, "step": 10, "leftLabel": "L"}
                    },
                    "projects": {
                        "type": "project_select",
                        "dynamicOptions": {"source": "static", "sourceParams": {"options": [{"value": 1, "label": "One"}]}},
                        "action": "loadProjects"
                    },
                    "done": {"type": "message", "message": "ありがとう", "isEnd": true}
                }
            }
        })
    }

    #[test]
    fn test_parse_sample_document() {
        let doc = FlowDocument::from_value(sample()).unwrap();
        assert_eq!(doc.version_label(), "1.2");
        assert_eq!(doc.flow.initial_step.as_deref(), Some("welcome"));
        let ids: Vec<&str> = doc.flow.steps.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["welcome", "purpose", "amount", "ratio", "projects", "done"]);

        let purpose = &doc.flow.steps["purpose"];
        assert_eq!(purpose.kind, StepKind::ButtonSelect);
        assert_eq!(purpose.static_options().len(), 2);
        assert_eq!(purpose.static_options()[1].conditions[0].target, "done");
        assert_eq!(purpose.static_options()[1].conditions[0].priority, 2);

        assert_eq!(doc.flow.steps["amount"].validation.len(), 2);
        assert!(doc.flow.steps["done"].is_terminal);

        let slider = doc.flow.steps["ratio"].slider().unwrap();
        assert!((slider.step - 10.0).abs() < f64::EPSILON);
        assert_eq!(slider.left_label.as_deref(), Some("L"));

        assert!(doc.flow.steps["projects"].dynamic_source().is_some());
        assert!(doc.flow.steps["projects"].action.is_some());
    }

    #[test]
    fn test_bare_body_is_accepted() {
        let doc = FlowDocument::from_value(json!({
            "steps": {"only": {"type": "message", "isTerminal": true}}
        }))
        .unwrap();
        assert_eq!(doc.flow.initial_step, None);
        assert_eq!(doc.version_label(), "unversioned");
    }

    #[test]
    fn test_unknown_kind_becomes_custom() {
        let kind: StepKind = serde_json::from_value(json!("signature_pad")).unwrap();
        assert_eq!(kind, StepKind::Custom("signature_pad".to_string()));
        assert!(kind.builtin_capabilities().is_none());
        assert_eq!(serde_json::to_value(&kind).unwrap(), json!("signature_pad"));
    }

    #[test]
    fn test_builtin_capabilities() {
        assert!(StepKind::Message.builtin_capabilities().unwrap().can_auto_advance);
        assert!(StepKind::ToolCalls.builtin_capabilities().unwrap().awaits_completion);
        let text = StepKind::TextInput.builtin_capabilities().unwrap();
        assert!(text.requires_validation && text.produces_value);
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        assert!(FlowDocument::from_json("{not json").is_err());
        assert!(FlowDocument::from_value(json!({"flow": {"steps": 3}})).is_err());
    }

    #[test]
    fn test_option_label_falls_back_to_value() {
        let option: FlowOption = serde_json::from_value(json!({"value": 5000})).unwrap();
        assert_eq!(option.display_label(), "5000");
    }
}
