//! Access rules loaded from JSON.
//!
//! ```json
//! {
//!   "rules": {
//!     ".read": "true",
//!     "users": {
//!       "$uid": { ".write": "auth.id == $uid" }
//!     }
//!   }
//! }
//! ```
//!
//! Keys starting with `.` name an operation, keys starting with `$` match
//! any single segment and bind it for the expression, every other key
//! matches literally. A literal key wins over a wildcard at the same level.

use std::collections::HashMap;
use std::path::Path as FsPath;

use super::Operation;
use crate::error::{Error, Result};
use crate::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
struct RuleNode {
    expressions: HashMap<Operation, String>,
    children: HashMap<String, RuleNode>,
    wildcard: Option<(String, Box<RuleNode>)>,
}

impl RuleNode {
    fn parse(json: &serde_json::Value, at: &Path) -> Result<Self> {
        let object = json
            .as_object()
            .ok_or_else(|| Error::Rules(format!("rules at '{at}' must be an object")))?;

        let mut node = RuleNode::default();
        for (key, value) in object {
            if let Some(op) = Operation::from_rule_key(key) {
                let expression = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(Error::Rules(format!(
                            "'{key}' at '{at}' must be a string or boolean, got {other}"
                        )))
                    }
                };
                node.expressions.insert(op, expression);
            } else if key.starts_with('.') {
                log::warn!("Ignoring unknown rule key '{key}' at '{at}'");
            } else if let Some(name) = key.strip_prefix('$') {
                if node.wildcard.is_some() {
                    return Err(Error::Rules(format!("more than one wildcard under '{at}'")));
                }
                let child = RuleNode::parse(value, &at.append(key.as_str()))?;
                node.wildcard = Some((name.to_string(), Box::new(child)));
            } else {
                let child = RuleNode::parse(value, &at.append(key.as_str()))?;
                node.children.insert(key.clone(), child);
            }
        }
        Ok(node)
    }
}

/// The expression that governs one operation at one path.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch<'a> {
    pub expression: &'a str,
    /// Wildcard bindings (`$uid` → `"7"`) collected on the way down.
    pub captures: Vec<(String, String)>,
    /// Depth of the rule that matched.
    pub depth: usize,
}

/// A parsed rule tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    root: RuleNode,
    explicit: bool,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl RuleSet {
    /// Rules that allow every operation everywhere, used when no rules
    /// are configured.
    pub fn allow_all() -> Self {
        let mut root = RuleNode::default();
        for op in [Operation::Read, Operation::Write, Operation::Remove] {
            root.expressions.insert(op, "true".to_string());
        }
        Self {
            root,
            explicit: false,
        }
    }

    /// Parse `{"rules": {...}}`.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let rules = json
            .get("rules")
            .ok_or_else(|| Error::Rules("missing top-level \"rules\" object".to_string()))?;
        Ok(Self {
            root: RuleNode::parse(rules, &Path::root())?,
            explicit: true,
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let json: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| Error::Rules(e.to_string()))?;
        Self::from_json(&json)
    }

    pub fn from_file(path: impl AsRef<FsPath>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Rules(format!("reading {}: {e}", path.display())))?;
        let rules = Self::from_json_str(&raw)?;
        log::info!("Loaded access rules from {}", path.display());
        Ok(rules)
    }

    /// False for [`RuleSet::allow_all`].
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// The deepest rule for `op` on the way from the root to `path`.
    pub fn resolve(&self, path: &Path, op: Operation) -> Option<RuleMatch<'_>> {
        let mut current = &self.root;
        let mut captures = Vec::new();
        let mut best = current.expressions.get(&op).map(|e| RuleMatch {
            expression: e.as_str(),
            captures: Vec::new(),
            depth: 0,
        });

        for (depth, segment) in path.segments().iter().enumerate() {
            current = if let Some(child) = current.children.get(segment) {
                child
            } else if let Some((name, child)) = &current.wildcard {
                captures.push((name.clone(), segment.clone()));
                child
            } else {
                break;
            };
            if let Some(expression) = current.expressions.get(&op) {
                best = Some(RuleMatch {
                    expression: expression.as_str(),
                    captures: captures.clone(),
                    depth: depth + 1,
                });
            }
        }
        best
    }
}
