//! The formula evaluation sandbox.
//!
//! An [`Interpreter`] evaluates a parsed expression against a `name -> f64`
//! symbol table plus a fixed, enumerable set of builtin constants and
//! functions. The builtin set is also what the free-variable analyzer
//! excludes when deciding which names a formula depends on.

use std::collections::BTreeMap;
use std::f64::consts;

use thiserror::Error;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::error::ParameterResult;
use crate::parser::parse_formula;

/// Named constants available to every formula.
pub const BUILTIN_CONSTANTS: &[(&str, f64)] = &[
    ("e", consts::E),
    ("inf", f64::INFINITY),
    ("pi", consts::PI),
    ("tau", consts::TAU),
];

/// Functions available to every formula, sorted.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "acos", "asin", "atan", "ceil", "cos", "exp", "floor", "log", "log10", "log2", "max",
    "min", "round", "sin", "sqrt", "tan",
];

/// Whether `name` is a builtin constant or function (and therefore never a
/// free variable).
#[must_use]
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_FUNCTIONS.binary_search(&name).is_ok()
        || BUILTIN_CONSTANTS.iter().any(|(n, _)| *n == name)
}

/// Every builtin symbol name, constants first.
pub fn builtin_symbols() -> impl Iterator<Item = &'static str> {
    BUILTIN_CONSTANTS
        .iter()
        .map(|(name, _)| *name)
        .chain(BUILTIN_FUNCTIONS.iter().copied())
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("missing symbol `{0}`")]
    MissingSymbol(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{name}` called with {got} argument(s)")]
    WrongArity { name: String, got: usize },
}

/// Evaluates formulas against a symbol table.
///
/// Arithmetic follows IEEE float semantics (division by zero yields an
/// infinity, not an error); referencing a symbol that is neither defined
/// nor builtin is a hard [`EvalError::MissingSymbol`].
#[derive(Clone, Debug, Default)]
pub struct Interpreter {
    symtable: BTreeMap<String, f64>,
}

impl Interpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_symbols(symtable: BTreeMap<String, f64>) -> Self {
        Self { symtable }
    }

    pub fn define(&mut self, name: impl Into<String>, value: f64) {
        self.symtable.insert(name.into(), value);
    }

    #[must_use]
    pub fn symtable(&self) -> &BTreeMap<String, f64> {
        &self.symtable
    }

    /// Parse and evaluate `formula` in one step.
    pub fn eval(&self, formula: &str) -> ParameterResult<f64> {
        let expr = parse_formula(formula)?;
        Ok(self.eval_expr(&expr)?)
    }

    pub fn eval_expr(&self, expr: &Expr) -> Result<f64, EvalError> {
        match expr {
            Expr::Number(value) => Ok(*value),
            Expr::Ident(name) => self.lookup(name),
            Expr::Unary { op, expr } => {
                let value = self.eval_expr(expr)?;
                Ok(match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Minus => -value,
                })
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval_expr(left)?;
                let right = self.eval_expr(right)?;
                Ok(match op {
                    BinaryOp::Add => left + right,
                    BinaryOp::Sub => left - right,
                    BinaryOp::Mul => left * right,
                    BinaryOp::Div => left / right,
                    BinaryOp::Mod => left % right,
                    BinaryOp::Pow => left.powf(right),
                })
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg)?);
                }
                call(name, &values)
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<f64, EvalError> {
        // Parameter definitions shadow nothing: builtin names are excluded
        // from symbol tables upstream, so check user symbols first.
        if let Some(value) = self.symtable.get(name) {
            return Ok(*value);
        }
        for (constant, value) in BUILTIN_CONSTANTS {
            if *constant == name {
                return Ok(*value);
            }
        }
        Err(EvalError::MissingSymbol(name.to_string()))
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, EvalError> {
    let wrong_arity = || EvalError::WrongArity {
        name: name.to_string(),
        got: args.len(),
    };
    let unary = |f: fn(f64) -> f64| match args {
        [x] => Ok(f(*x)),
        _ => Err(wrong_arity()),
    };

    match name {
        "abs" => unary(f64::abs),
        "acos" => unary(f64::acos),
        "asin" => unary(f64::asin),
        "atan" => unary(f64::atan),
        "ceil" => unary(f64::ceil),
        "cos" => unary(f64::cos),
        "exp" => unary(f64::exp),
        "floor" => unary(f64::floor),
        "log" => match args {
            [x] => Ok(x.ln()),
            [x, base] => Ok(x.log(*base)),
            _ => Err(wrong_arity()),
        },
        "log10" => unary(f64::log10),
        "log2" => unary(f64::log2),
        "max" => args
            .iter()
            .copied()
            .reduce(f64::max)
            .ok_or_else(wrong_arity),
        "min" => args
            .iter()
            .copied()
            .reduce(f64::min)
            .ok_or_else(wrong_arity),
        "round" => unary(f64::round),
        "sin" => unary(f64::sin),
        "sqrt" => unary(f64::sqrt),
        "tan" => unary(f64::tan),
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}
