//! Tree-walking evaluator over a read-only JSON scope

use super::ast::{BinaryOp, Expr, UnaryOp};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Why an expression could not produce a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("property '{0}' is not defined")]
    MissingProperty(String),
    #[error("index {0} is out of bounds")]
    IndexOutOfBounds(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

pub fn eval(expr: &Expr, scope: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
        Expr::Member(target, name) => {
            let target = eval(target, scope)?;
            member(&target, name)
        }
        Expr::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            index_into(&target, &index)
        }
        Expr::Unary(op, operand) => {
            let operand = eval(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&operand))),
                UnaryOp::Neg => {
                    let n = as_number(&operand).ok_or_else(|| {
                        EvalError::Type(format!("cannot negate {}", type_name(&operand)))
                    })?;
                    number_value(-n)
                }
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !is_truthy(&eval(lhs, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(rhs, scope)?)))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if is_truthy(&eval(lhs, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(rhs, scope)?)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            binary(*op, &lhs, &rhs)
        }
        Expr::Conditional(test, then, otherwise) => {
            if is_truthy(&eval(test, scope)?) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
    }
}

fn member(target: &Value, name: &str) -> Result<Value, EvalError> {
    match target {
        Value::Object(map) => map
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::MissingProperty(name.to_string())),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        other => Err(EvalError::Type(format!(
            "cannot read property '{name}' of {}",
            type_name(other)
        ))),
    }
}

fn index_into(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match (target, index) {
        (Value::Object(_), Value::String(key)) => member(target, key),
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or_else(|| EvalError::IndexOutOfBounds(n.to_string())),
        _ => Err(EvalError::Type(format!(
            "cannot index {} with {}",
            type_name(target),
            type_name(index)
        ))),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(strict_equals(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!strict_equals(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(lhs, rhs).ok_or_else(|| {
                EvalError::Type(format!(
                    "cannot compare {} {} {}",
                    type_name(lhs),
                    op.symbol(),
                    type_name(rhs)
                ))
            })?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => {
            if lhs.is_string() || rhs.is_string() {
                return Ok(Value::String(format!("{}{}", stringify(lhs), stringify(rhs))));
            }
            arithmetic(op, lhs, rhs, |a, b| Ok(a + b))
        }
        BinaryOp::Sub => arithmetic(op, lhs, rhs, |a, b| Ok(a - b)),
        BinaryOp::Mul => arithmetic(op, lhs, rhs, |a, b| Ok(a * b)),
        BinaryOp::Div => arithmetic(op, lhs, rhs, |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        }),
        BinaryOp::Rem => arithmetic(op, lhs, rhs, |a, b| {
            if b == 0.0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(a % b)
            }
        }),
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit in eval"),
    }
}

fn arithmetic(
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
    apply: impl FnOnce(f64, f64) -> Result<f64, EvalError>,
) -> Result<Value, EvalError> {
    match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => number_value(apply(a, b)?),
        _ => Err(EvalError::Type(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Convert an arithmetic result back to JSON, keeping whole numbers integral.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub(crate) fn number_value(n: f64) -> Result<Value, EvalError> {
    if !n.is_finite() {
        return Err(EvalError::NonFinite);
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).ok_or(EvalError::NonFinite)
}

/// Equality without coercion: numbers compare by magnitude, everything else structurally.
pub fn strict_equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y) == Some(Ordering::Equal),
            _ => a == b,
        },
        _ => lhs == rhs,
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way it should appear inside user-facing text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 => {
                number_value(f).map_or_else(|_| n.to_string(), |v| v.to_string())
            }
            _ => n.to_string(),
        },
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
