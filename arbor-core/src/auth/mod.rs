//! Authorization: rule lookup, expression evaluation and read filtering.
//!
//! ```text
//! is_authorized(op, auth, root, path, data)
//!      │
//!      ├── RuleSet::resolve(path, op)   deepest matching rule
//!      │        └── none → allow (no rules configured) / deny (rules configured)
//!      ├── "true" / "false"             literal, no evaluation
//!      └── PredicateEvaluator           anything else; errors deny
//! ```

mod evaluator;
mod rules;

pub use evaluator::{Bindings, ExpressionEvaluator, PredicateEvaluator};
pub use rules::{RuleMatch, RuleSet};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{Node, Value};
use crate::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Remove,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Remove => "remove",
        }
    }

    /// The rule key for this operation (`.read`, `.write`, `.remove`).
    pub fn rule_key(&self) -> &'static str {
        match self {
            Operation::Read => ".read",
            Operation::Write => ".write",
            Operation::Remove => ".remove",
        }
    }

    pub fn from_rule_key(key: &str) -> Option<Self> {
        match key {
            ".read" => Some(Operation::Read),
            ".write" => Some(Operation::Write),
            ".remove" => Some(Operation::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the caller. Anonymous callers have no user node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    user: Option<Node>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user: Node) -> Self {
        Self { user: Some(user) }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.is_none()
    }

    pub fn user_node(&self) -> Option<&Node> {
        self.user.as_ref()
    }

    /// The user as a value (`Null` when anonymous).
    pub fn as_value(&self) -> Value {
        self.user.clone().map_or(Value::Null, Value::Node)
    }
}

impl From<Option<Node>> for AuthContext {
    fn from(user: Option<Node>) -> Self {
        Self { user }
    }
}

/// Decides whether an operation may proceed.
#[derive(Clone)]
pub struct Authorization {
    rules: RuleSet,
    evaluator: Arc<dyn PredicateEvaluator>,
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Default for Authorization {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl Authorization {
    pub fn new(rules: RuleSet, evaluator: impl PredicateEvaluator + 'static) -> Self {
        Self {
            rules,
            evaluator: Arc::new(evaluator),
        }
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        Self::new(rules, ExpressionEvaluator)
    }

    pub fn allow_all() -> Self {
        Self::with_rules(RuleSet::allow_all())
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// True if `op` on `path` is allowed for `auth`.
    ///
    /// `data` is the value being written, or the current value for reads.
    pub fn is_authorized(
        &self,
        op: Operation,
        auth: &AuthContext,
        root: &Node,
        path: &Path,
        data: Option<&Value>,
    ) -> bool {
        match self.rules.resolve(path, op) {
            Some(rule) => self.evaluate(&rule, op, auth, root, path, data),
            None => !self.rules.is_explicit(),
        }
    }

    /// Like [`Authorization::is_authorized`], but only consults rules that
    /// exist: a path with no rule for `op` passes.
    pub fn is_allowed_if_ruled(
        &self,
        op: Operation,
        auth: &AuthContext,
        root: &Node,
        path: &Path,
        data: Option<&Value>,
    ) -> bool {
        match self.rules.resolve(path, op) {
            Some(rule) => self.evaluate(&rule, op, auth, root, path, data),
            None => true,
        }
    }

    pub fn authorize(
        &self,
        op: Operation,
        auth: &AuthContext,
        root: &Node,
        path: &Path,
        data: Option<&Value>,
    ) -> Result<()> {
        if self.is_authorized(op, auth, root, path, data) {
            Ok(())
        } else {
            Err(Error::NotAuthorized {
                operation: op,
                path: path.to_string(),
            })
        }
    }

    fn evaluate(
        &self,
        rule: &RuleMatch<'_>,
        op: Operation,
        auth: &AuthContext,
        root: &Node,
        path: &Path,
        data: Option<&Value>,
    ) -> bool {
        match rule.expression.trim() {
            "true" => return true,
            "false" => return false,
            _ => {}
        }
        let bindings = Bindings {
            auth,
            data,
            root,
            captures: &rule.captures,
        };
        match self.evaluator.evaluate(rule.expression, &bindings) {
            Ok(allowed) => allowed,
            Err(e) => {
                log::warn!("Denying {op} at {path}: rule '{}' failed: {e}", rule.expression);
                false
            }
        }
    }

    /// `value` (found at `path`) with every child `auth` may not read
    /// removed, recursively. Scalars pass through unchanged.
    pub fn filter_content(&self, auth: &AuthContext, root: &Node, path: &Path, value: &Value) -> Value {
        let Value::Node(node) = value else {
            return value.clone();
        };
        let mut filtered = Node::new();
        for (key, child) in node.iter() {
            let child_path = path.append(key);
            if self.is_authorized(Operation::Read, auth, root, &child_path, Some(child)) {
                filtered.put(key, self.filter_content(auth, root, &child_path, child));
            }
        }
        Value::Node(filtered)
    }
}
