//! Guard expression AST.
//!
//! - `Expr`: numbers, booleans, feature references, historical lookbacks,
//!   unary/binary operators and builtin function calls
//! - Dotted names are flattened at parse time: `a.b` is the feature `a_b`
//! - `Feature(name)` is shorthand for `Lookback { name, offset: 0 }`

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Feature(String),
    Lookback {
        name: String,
        offset: usize,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// All feature names referenced anywhere in the expression.
    pub fn referenced_features(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_features(&mut out);
        out
    }

    /// Deepest lookback offset used per feature.
    pub fn max_lookback(&self) -> usize {
        match self {
            Expr::Number(_) | Expr::Bool(_) | Expr::Feature(_) => 0,
            Expr::Lookback { offset, .. } => *offset,
            Expr::Unary { expr, .. } => expr.max_lookback(),
            Expr::Binary { left, right, .. } => left.max_lookback().max(right.max_lookback()),
            Expr::Call { args, .. } => args.iter().map(Expr::max_lookback).max().unwrap_or(0),
        }
    }

    fn collect_features(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) | Expr::Bool(_) => {}
            Expr::Feature(name) | Expr::Lookback { name, .. } => {
                out.insert(name.clone());
            }
            Expr::Unary { expr, .. } => expr.collect_features(out),
            Expr::Binary { left, right, .. } => {
                left.collect_features(out);
                right.collect_features(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_features(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) => write!(f, "{v}"),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Feature(name) => write!(f, "{name}"),
            Expr::Lookback { name, offset } => write!(f, "{name}[{offset}]"),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-({expr})"),
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "not ({expr})"),
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
