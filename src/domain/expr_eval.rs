//! Guard expression evaluation.
//!
//! # Evaluation Semantics
//!
//! - Feature names resolve against the current frame; `name[n]` resolves `n`
//!   bars back, `name[0]` is the current value
//! - Looking back past the retained history is an error, never a default
//! - `and`/`or` short-circuit
//! - Comparisons involving NaN (indicator warm-up) are false
//! - `==`/`!=` on numbers use an absolute tolerance of 1e-9

use crate::domain::error::EvalError;
use crate::domain::expr::{BinaryOp, Expr, UnaryOp};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn as_number(self, op: &str) -> Result<f64, EvalError> {
        match self {
            Value::Number(v) => Ok(v),
            Value::Bool(_) => Err(EvalError::TypeMismatch {
                op: op.to_string(),
                expected: "number",
            }),
        }
    }

    fn as_bool(self, op: &str) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(b),
            Value::Number(_) => Err(EvalError::TypeMismatch {
                op: op.to_string(),
                expected: "boolean",
            }),
        }
    }
}

/// Read access to current and historical feature values.
pub trait FeatureSource {
    /// Value of `name` `offset` bars before the current one.
    fn lookup(&self, name: &str, offset: usize) -> Result<f64, EvalError>;
}

pub fn evaluate(expr: &Expr, source: &dyn FeatureSource) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(v) => Ok(Value::Number(*v)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Feature(name) => source.lookup(name, 0).map(Value::Number),
        Expr::Lookback { name, offset } => source.lookup(name, *offset).map(Value::Number),
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, source)?;
            match op {
                UnaryOp::Neg => Ok(Value::Number(-value.as_number("-")?)),
                UnaryOp::Not => Ok(Value::Bool(!value.as_bool("not")?)),
            }
        }
        Expr::Binary { op, left, right } => evaluate_binary(*op, left, right, source),
        Expr::Call { name, args } => evaluate_call(name, args, source),
    }
}

/// Evaluate an expression that must produce a boolean.
pub fn evaluate_guard(expr: &Expr, source: &dyn FeatureSource) -> Result<bool, EvalError> {
    evaluate(expr, source)?.as_bool("guard")
}

/// Evaluate an expression that must produce a number.
pub fn evaluate_number(expr: &Expr, source: &dyn FeatureSource) -> Result<f64, EvalError> {
    evaluate(expr, source)?.as_number("value")
}

fn evaluate_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    source: &dyn FeatureSource,
) -> Result<Value, EvalError> {
    let sym = op.symbol();
    match op {
        BinaryOp::And => {
            if !evaluate(left, source)?.as_bool(sym)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate(right, source)?.as_bool(sym)?))
        }
        BinaryOp::Or => {
            if evaluate(left, source)?.as_bool(sym)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate(right, source)?.as_bool(sym)?))
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            let equal = match (evaluate(left, source)?, evaluate(right, source)?) {
                (Value::Number(a), Value::Number(b)) if a.is_nan() || b.is_nan() => {
                    return Ok(Value::Bool(false));
                }
                (Value::Number(a), Value::Number(b)) => (a - b).abs() < EPSILON,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => {
                    return Err(EvalError::TypeMismatch {
                        op: sym.to_string(),
                        expected: "operands of the same type",
                    });
                }
            };
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
            let (a, b) = numbers(left, right, sym, source)?;
            Ok(Value::Bool(match op {
                BinaryOp::Gt => a > b,
                BinaryOp::Ge => a >= b,
                BinaryOp::Lt => a < b,
                _ => a <= b,
            }))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numbers(left, right, sym, source)?;
            Ok(Value::Number(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }))
        }
    }
}

fn numbers(
    left: &Expr,
    right: &Expr,
    sym: &str,
    source: &dyn FeatureSource,
) -> Result<(f64, f64), EvalError> {
    let a = evaluate(left, source)?.as_number(sym)?;
    let b = evaluate(right, source)?.as_number(sym)?;
    Ok((a, b))
}

fn evaluate_call(name: &str, args: &[Expr], source: &dyn FeatureSource) -> Result<Value, EvalError> {
    let expected = match name {
        "abs" => 1,
        "min" | "max" => 2,
        _ => {
            return Err(EvalError::UnknownFunction {
                name: name.to_string(),
            });
        }
    };
    if args.len() != expected {
        return Err(EvalError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    let values = args
        .iter()
        .map(|arg| evaluate(arg, source)?.as_number(name))
        .collect::<Result<Vec<f64>, EvalError>>()?;
    let result = match name {
        "abs" => values[0].abs(),
        "min" => values[0].min(values[1]),
        _ => values[0].max(values[1]),
    };
    Ok(Value::Number(result))
}
