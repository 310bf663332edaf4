//! Pluggable evaluation of rule expressions.

use crate::expr::{ExprError, Expression};
use crate::node::{Node, Value};

use super::AuthContext;

/// Everything a rule expression may refer to.
pub struct Bindings<'a> {
    pub auth: &'a AuthContext,
    /// The value being written, or the existing value for reads.
    pub data: Option<&'a Value>,
    pub root: &'a Node,
    pub captures: &'a [(String, String)],
}

impl Bindings<'_> {
    /// Resolve `auth.*`, `data.*`, `root.*` and `$wildcard` identifiers.
    pub fn resolve(&self, ident: &[String]) -> Option<Value> {
        let (head, rest) = ident.split_first()?;
        match head.as_str() {
            "auth" => self.auth.as_value().lookup(rest).cloned(),
            "data" => self.data?.lookup(rest).cloned(),
            "root" => {
                let root = self.root;
                match rest.split_first() {
                    None => Some(Value::Node(root.clone())),
                    Some((first, more)) => root.get(first)?.lookup(more).cloned(),
                }
            }
            var if var.starts_with('$') && rest.is_empty() => self
                .captures
                .iter()
                .find(|(name, _)| name == &var[1..])
                .map(|(_, segment)| Value::String(segment.clone())),
            _ => None,
        }
    }
}

/// Evaluates a rule expression that is not a literal `"true"`/`"false"`.
///
/// An error means the expression could not be evaluated; callers deny.
pub trait PredicateEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, bindings: &Bindings<'_>) -> Result<bool, ExprError>;
}

/// The built-in evaluator, backed by [`Expression`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl PredicateEvaluator for ExpressionEvaluator {
    fn evaluate(&self, expression: &str, bindings: &Bindings<'_>) -> Result<bool, ExprError> {
        let parsed = Expression::parse(expression)?;
        Ok(parsed.evaluate(&|ident| bindings.resolve(ident)))
    }
}
