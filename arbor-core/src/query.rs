//! Per-connection query state.
//!
//! A query is a predicate attached at a base path. The evaluator remembers,
//! per (base path, query), which children of the base currently match, so a
//! mutation can be turned into membership transitions:
//!
//! ```text
//!   matched before │ matches now │ transition
//!   ───────────────┼─────────────┼───────────
//!        no        │     yes     │ Added
//!        yes       │     yes     │ Changed
//!        yes       │     no      │ Removed
//! ```

use std::collections::{HashMap, HashSet};

use crate::expr::Expression;
use crate::node::{Node, Value};
use crate::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTransition {
    Added,
    Changed,
    Removed,
}

/// One membership transition for one child of a query's base path.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryChange {
    pub transition: QueryTransition,
    pub base: Path,
    pub query: String,
    /// Full path of the child.
    pub path: Path,
    /// The child's current value (`Null` once it is gone from the tree).
    pub value: Value,
}

#[derive(Debug, Clone)]
struct QueryState {
    // None when the query failed to parse; it then matches nothing.
    predicate: Option<Expression>,
    members: HashSet<Path>,
}

impl QueryState {
    fn new(query: &str) -> Self {
        let predicate = match Expression::parse(query) {
            Ok(expr) => Some(expr),
            Err(e) => {
                log::warn!("Query '{query}' does not parse and will match nothing: {e}");
                None
            }
        };
        Self {
            predicate,
            members: HashSet::new(),
        }
    }

    fn matches(&self, value: &Value) -> bool {
        self.predicate
            .as_ref()
            .is_some_and(|p| evaluate_on(p, value))
    }
}

fn evaluate_on(predicate: &Expression, value: &Value) -> bool {
    predicate.evaluate(&|fields| {
        if !value.is_node() && fields.len() == 1 && fields[0] == "value" {
            return Some(value.clone());
        }
        value.lookup(fields).cloned()
    })
}

#[derive(Debug, Default, Clone)]
pub struct QueryEvaluator {
    queries: HashMap<Path, HashMap<String, QueryState>>,
}

impl QueryEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `query` at `path`. Returns false if it was already there.
    pub fn add_query(&mut self, path: &Path, query: &str) -> bool {
        let at_path = self.queries.entry(path.clone()).or_default();
        if at_path.contains_key(query) {
            return false;
        }
        at_path.insert(query.to_string(), QueryState::new(query));
        true
    }

    pub fn remove_query(&mut self, path: &Path, query: &str) -> bool {
        let Some(at_path) = self.queries.get_mut(path) else {
            return false;
        };
        let removed = at_path.remove(query).is_some();
        if at_path.is_empty() {
            self.queries.remove(path);
        }
        removed
    }

    pub fn has_query(&self, path: &Path) -> bool {
        self.queries.get(path).is_some_and(|q| !q.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn query_count(&self) -> usize {
        self.queries.values().map(HashMap::len).sum()
    }

    /// Evaluate `query` against one value, parsing it on the spot. A query
    /// that does not parse matches nothing.
    pub fn evaluate_query_on_value(value: &Value, query: &str) -> bool {
        Expression::parse(query).is_ok_and(|p| evaluate_on(&p, value))
    }

    /// Whether `query` at `base` matches `value`, using the compiled form
    /// when the query is registered.
    pub fn matches(&self, base: &Path, query: &str, value: &Value) -> bool {
        match self.queries.get(base).and_then(|q| q.get(query)) {
            Some(state) => state.matches(value),
            None => Self::evaluate_query_on_value(value, query),
        }
    }

    pub fn query_contains_node(&self, base: &Path, query: &str, path: &Path) -> bool {
        self.queries
            .get(base)
            .and_then(|q| q.get(query))
            .is_some_and(|state| state.members.contains(path))
    }

    pub fn add_node_to_query(&mut self, base: &Path, query: &str, path: &Path) -> bool {
        self.queries
            .get_mut(base)
            .and_then(|q| q.get_mut(query))
            .is_some_and(|state| state.members.insert(path.clone()))
    }

    pub fn remove_node_from_query(&mut self, base: &Path, query: &str, path: &Path) -> bool {
        self.queries
            .get_mut(base)
            .and_then(|q| q.get_mut(query))
            .is_some_and(|state| state.members.remove(path))
    }

    /// Re-evaluate every query affected by a mutation that touched
    /// `changed`, updating membership and returning the transitions.
    ///
    /// A change at or above a query's base re-checks every current child of
    /// the base plus every recorded member; a change below the base only
    /// re-checks the child it lies under.
    pub fn process_changes(&mut self, root: &Node, changed: &[Path]) -> Vec<QueryChange> {
        let mut out = Vec::new();

        for (base, queries) in self.queries.iter_mut() {
            let mut candidates: Vec<Path> = Vec::new();
            let mut seen = HashSet::new();
            let mut offer = |p: Path, candidates: &mut Vec<Path>| {
                if seen.insert(p.clone()) {
                    candidates.push(p);
                }
            };

            for path in changed {
                if path.is_ancestor_of_or_equal(base) {
                    if let Some(node) = root.get_node_for_path(base) {
                        for key in node.keys() {
                            offer(base.append(key), &mut candidates);
                        }
                    }
                    for state in queries.values() {
                        let mut members: Vec<&Path> = state.members.iter().collect();
                        members.sort();
                        for member in members {
                            offer(member.clone(), &mut candidates);
                        }
                    }
                } else if let Some(child) = base.child_toward(path) {
                    offer(child, &mut candidates);
                }
            }

            for candidate in candidates {
                let value = root.get_object_for_path(&candidate);
                for (query, state) in queries.iter_mut() {
                    let now = value.is_some_and(|v| state.matches(v));
                    let before = state.members.contains(&candidate);
                    let transition = match (before, now) {
                        (false, true) => {
                            state.members.insert(candidate.clone());
                            QueryTransition::Added
                        }
                        (true, true) => QueryTransition::Changed,
                        (true, false) => {
                            state.members.remove(&candidate);
                            QueryTransition::Removed
                        }
                        (false, false) => continue,
                    };
                    out.push(QueryChange {
                        transition,
                        base: base.clone(),
                        query: query.clone(),
                        path: candidate.clone(),
                        value: value.cloned().unwrap_or_default(),
                    });
                }
            }
        }
        out
    }
}
