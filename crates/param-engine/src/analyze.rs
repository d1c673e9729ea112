//! Free-variable extraction for formulas.

use std::collections::BTreeSet;

use crate::interpreter::is_builtin;
use crate::parser::{parse_formula, ParseError};

/// Return the set of free variable names in `formula`.
///
/// A free variable is any identifier the formula mentions (including an
/// unknown call target) that is neither a builtin constant/function nor
/// listed in the caller-supplied `context` of locally defined names.
///
/// Unparseable input is an error, never an empty set.
pub fn free_symbols(
    formula: &str,
    context: Option<&BTreeSet<String>>,
) -> Result<BTreeSet<String>, ParseError> {
    let expr = parse_formula(formula)?;
    let mut names = BTreeSet::new();
    expr.for_each_name(&mut |name| {
        if !is_builtin(name) && !context.is_some_and(|ctx| ctx.contains(name)) {
            names.insert(name.to_string());
        }
    });
    Ok(names)
}
