//! Side-effect-free expression language used by guards, filters and templates
//!
//! Expressions are parsed once into an AST and evaluated against a read-only
//! JSON scope. Evaluation never panics: every failure is reported through
//! [`EvaluationResult`].

pub mod ast;
mod eval;
mod parser;
mod template;

#[cfg(test)]
mod proptests;

pub use eval::{is_truthy, strict_equals, stringify, type_name, EvalError};
pub use parser::ParseError;
pub use template::{
    has_value, interpolate_deep, interpolate_paths, lookup_path, render_message, render_template,
};

use ast::Expr;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Outcome of evaluating one expression
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub success: bool,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationResult {
    pub fn ok(value: Value) -> Self {
        Self {
            success: true,
            value,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: Value::Null,
            error: Some(error.into()),
        }
    }

    /// A failed evaluation counts as false.
    pub fn is_truthy(&self) -> bool {
        self.success && is_truthy(&self.value)
    }
}

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, scope: &Value) -> EvaluationResult {
        match eval::eval(&self.ast, scope) {
            Ok(value) => EvaluationResult::ok(value),
            Err(e) => EvaluationResult::failed(e.to_string()),
        }
    }

    pub fn is_satisfied(&self, scope: &Value) -> bool {
        self.evaluate(scope).is_truthy()
    }

    /// Parse and evaluate in one go; parse failures become failed results.
    pub fn evaluate_source(source: &str, scope: &Value) -> EvaluationResult {
        match Self::parse(source) {
            Ok(expr) => expr.evaluate(scope),
            Err(e) => EvaluationResult::failed(format!("parse error: {e}")),
        }
    }
}

impl FromStr for Expression {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Evaluate expression text against a scope.
pub fn evaluate(source: &str, scope: &Value) -> EvaluationResult {
    let result = Expression::evaluate_source(source, scope);
    if let Some(error) = &result.error {
        tracing::debug!(expression = %source, error = %error, "Expression evaluation failed");
    }
    result
}

/// True when every expression is truthy. Stops at the first false one.
pub fn evaluate_all<S: AsRef<str>>(sources: &[S], scope: &Value) -> bool {
    sources
        .iter()
        .all(|s| evaluate(s.as_ref(), scope).is_truthy())
}

/// True when any expression is truthy. Stops at the first true one.
pub fn evaluate_any<S: AsRef<str>>(sources: &[S], scope: &Value) -> bool {
    sources
        .iter()
        .any(|s| evaluate(s.as_ref(), scope).is_truthy())
}

/// Something with a guard expression, a priority and a destination.
pub trait Prioritized {
    fn expression(&self) -> &str;
    fn priority(&self) -> i64;
    fn target(&self) -> &str;
}

/// Sort by descending priority, keeping declaration order among equals.
pub fn sort_by_priority<T, F>(items: &mut [T], priority: F)
where
    F: Fn(&T) -> i64,
{
    items.sort_by_key(|item| std::cmp::Reverse(priority(item)));
}

/// Target of the highest-priority condition that holds, if any.
pub fn evaluate_prioritized<'a, C: Prioritized>(conditions: &'a [C], scope: &Value) -> Option<&'a str> {
    let mut ordered: Vec<&C> = conditions.iter().collect();
    sort_by_priority(&mut ordered, |c| c.priority());
    ordered
        .into_iter()
        .find(|c| evaluate(c.expression(), scope).is_truthy())
        .map(|c| c.target())
}
