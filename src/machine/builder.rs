//! Compiles a flow document into a [`Machine`]
//!
//! The document is untrusted: every structural problem is downgraded to a
//! [`BuildDiagnostic`] plus a safe fallback, except a document with no steps.

use crate::action::ActionDefinition;
use crate::expression::{sort_by_priority, Expression};
use crate::flow::{
    ConditionalTransition, FlowDocument, FlowError, FlowOption, StepCapabilities, StepDefinition,
    StepId, StepKind,
};
use crate::registry::Registry;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Structural problem found while compiling; never fatal
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildDiagnostic {
    #[error("Removing transition from \"{step}\" to \"{target}\" ({origin}): target step does not exist")]
    DanglingTarget {
        step: StepId,
        target: StepId,
        origin: String,
    },
    #[error("Initial step {declared:?} does not exist, using \"{fallback}\"")]
    MissingInitialStep {
        declared: Option<StepId>,
        fallback: StepId,
    },
    #[error("Guard on \"{step}\" never matches, cannot parse \"{expression}\": {error}")]
    InvalidExpression {
        step: StepId,
        expression: String,
        error: String,
    },
    #[error("Step \"{step}\" has kind \"{kind}\" with no registered input handler")]
    UnknownStepKind { step: StepId, kind: String },
}

/// A guarded edge with its expression parsed once
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    /// `None` when the source failed to parse; such a guard never matches.
    pub guard: Option<Expression>,
    pub target: StepId,
    pub priority: i64,
}

impl CompiledCondition {
    pub fn matches(&self, scope: &Value) -> bool {
        self.guard.as_ref().is_some_and(|g| g.is_satisfied(scope))
    }
}

#[derive(Debug, Clone)]
pub struct CompiledOption {
    pub value: Value,
    pub next_step: Option<StepId>,
    /// Sorted by descending priority, declaration order among equals
    pub conditions: Vec<CompiledCondition>,
}

/// What happens when an awaited completion arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Explicit follow-up step
    Target(StepId),
    /// No follow-up declared: route the output through the answer table
    RouteAnswer,
    /// The declared follow-up does not exist: stay put
    Hold,
}

#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub id: StepId,
    pub definition: StepDefinition,
    pub capabilities: StepCapabilities,
    pub options: Vec<CompiledOption>,
    /// Step-level conditions, sorted by descending priority
    pub conditions: Vec<CompiledCondition>,
    pub default_next: Option<StepId>,
    pub entry_action: Option<ActionDefinition>,
    pub completion: Completion,
    pub auto_advance: Option<StepId>,
    pub terminal: bool,
}

impl CompiledStep {
    pub fn kind(&self) -> &StepKind {
        &self.definition.kind
    }

    /// Accepts `TOOL_COMPLETE`
    pub fn accepts_completion(&self) -> bool {
        !self.terminal && (self.capabilities.awaits_completion || self.entry_action.is_some())
    }
}

/// A compiled flow; immutable and shared by every session
#[derive(Debug, Clone)]
pub struct Machine {
    initial: StepId,
    steps: IndexMap<StepId, CompiledStep>,
    diagnostics: Vec<BuildDiagnostic>,
    version: String,
    metadata: Map<String, Value>,
}

impl Machine {
    pub fn build(document: &FlowDocument, registry: &Registry) -> Result<Self, FlowError> {
        Builder::new(document, registry).build()
    }

    pub fn initial_step(&self) -> &str {
        &self.initial
    }

    pub fn step(&self, id: &str) -> Option<&CompiledStep> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &CompiledStep> {
        self.steps.values()
    }

    pub fn state_count(&self) -> usize {
        self.steps.len()
    }

    pub fn diagnostics(&self) -> &[BuildDiagnostic] {
        &self.diagnostics
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Document-level metadata, seeded into every session's context
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

// ============================================================================
// Builder
// ============================================================================

struct Builder<'a> {
    document: &'a FlowDocument,
    registry: &'a Registry,
    known: IndexSet<&'a str>,
    diagnostics: Vec<BuildDiagnostic>,
}

impl<'a> Builder<'a> {
    fn new(document: &'a FlowDocument, registry: &'a Registry) -> Self {
        Self {
            document,
            registry,
            known: document.flow.steps.keys().map(String::as_str).collect(),
            diagnostics: Vec::new(),
        }
    }

    fn build(mut self) -> Result<Machine, FlowError> {
        let document = self.document;
        let Some(first) = document.flow.steps.keys().next() else {
            return Err(FlowError::Empty);
        };

        let declared = document.flow.initial_step.clone();
        let initial = match &declared {
            Some(id) if self.known.contains(id.as_str()) => id.clone(),
            _ => {
                self.diagnose(BuildDiagnostic::MissingInitialStep {
                    declared: declared.clone(),
                    fallback: first.clone(),
                });
                first.clone()
            }
        };

        let mut steps = IndexMap::with_capacity(document.flow.steps.len());
        for (id, definition) in &document.flow.steps {
            let compiled = self.compile_step(id, definition);
            steps.insert(id.clone(), compiled);
        }

        tracing::debug!(
            version = %document.version_label(),
            steps = steps.len(),
            initial = %initial,
            diagnostics = self.diagnostics.len(),
            "Compiled flow"
        );

        Ok(Machine {
            initial,
            steps,
            diagnostics: self.diagnostics,
            version: document.version_label(),
            metadata: document.metadata.clone(),
        })
    }

    fn diagnose(&mut self, diagnostic: BuildDiagnostic) {
        tracing::warn!(%diagnostic, "Flow build diagnostic");
        self.diagnostics.push(diagnostic);
    }

    fn capabilities(&mut self, id: &str, kind: &StepKind) -> StepCapabilities {
        if let Some(caps) = kind.builtin_capabilities() {
            return caps;
        }
        if let Some(handler) = self.registry.input_handler(kind.as_str()) {
            return handler.capabilities();
        }
        self.diagnose(BuildDiagnostic::UnknownStepKind {
            step: id.to_string(),
            kind: kind.to_string(),
        });
        StepCapabilities {
            produces_value: true,
            ..StepCapabilities::default()
        }
    }

    /// Keep `target` only when it names a declared step.
    fn checked_target(&mut self, step: &str, target: Option<&StepId>, origin: &str) -> Option<StepId> {
        let target = target?;
        if self.known.contains(target.as_str()) {
            return Some(target.clone());
        }
        self.diagnose(BuildDiagnostic::DanglingTarget {
            step: step.to_string(),
            target: target.clone(),
            origin: origin.to_string(),
        });
        None
    }

    fn compile_conditions(&mut self, step: &str, conditions: &[ConditionalTransition], origin: &str) -> Vec<CompiledCondition> {
        let mut compiled = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let Some(target) = self.checked_target(step, Some(&condition.target), origin) else {
                continue;
            };
            let guard = match Expression::parse(&condition.expression) {
                Ok(expr) => Some(expr),
                Err(e) => {
                    self.diagnose(BuildDiagnostic::InvalidExpression {
                        step: step.to_string(),
                        expression: condition.expression.clone(),
                        error: e.to_string(),
                    });
                    None
                }
            };
            compiled.push(CompiledCondition {
                guard,
                target,
                priority: condition.priority,
            });
        }
        sort_by_priority(&mut compiled, |c| c.priority);
        compiled
    }

    fn compile_options(&mut self, step: &str, options: &[FlowOption]) -> Vec<CompiledOption> {
        options
            .iter()
            .map(|option| CompiledOption {
                value: option.value.clone(),
                next_step: self.checked_target(step, option.next_step.as_ref(), "option"),
                conditions: self.compile_conditions(step, &option.conditions, "option condition"),
            })
            .collect()
    }

    fn compile_step(&mut self, id: &str, definition: &StepDefinition) -> CompiledStep {
        let capabilities = self.capabilities(id, &definition.kind);

        if definition.is_terminal {
            return CompiledStep {
                id: id.to_string(),
                definition: definition.clone(),
                capabilities,
                options: Vec::new(),
                conditions: Vec::new(),
                default_next: None,
                entry_action: None,
                completion: Completion::Hold,
                auto_advance: None,
                terminal: true,
            };
        }

        let options = self.compile_options(id, definition.static_options());
        let conditions = self.compile_conditions(id, &definition.conditions, "condition");
        let default_next = self.checked_target(id, definition.next_step.as_ref(), "nextStep");

        let action_next = definition.action.as_ref().and_then(|a| a.next_step.as_ref());
        let completion = match action_next.or(definition.next_step.as_ref()) {
            None => Completion::RouteAnswer,
            Some(_) if action_next.is_some() => {
                match self.checked_target(id, action_next, "action nextStep") {
                    Some(target) => Completion::Target(target),
                    None => Completion::Hold,
                }
            }
            Some(_) => default_next.clone().map_or(Completion::Hold, Completion::Target),
        };

        let auto_advance = if capabilities.can_auto_advance {
            default_next.clone()
        } else {
            None
        };

        CompiledStep {
            id: id.to_string(),
            definition: definition.clone(),
            capabilities,
            options,
            conditions,
            default_next,
            entry_action: definition.action.clone(),
            completion,
            auto_advance,
            terminal: false,
        }
    }
}
