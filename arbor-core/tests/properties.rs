use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arbor_core::{
    AuthContext, Authorization, ChangeLogEntry, Event, Path, Persistence, QueryEvaluator,
    QueryTransition, RuleSet, Value,
};
use proptest::prelude::*;
use serde_json::json;

fn key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string)
}

fn path_string() -> impl Strategy<Value = String> {
    prop::collection::vec(key(), 1..4).prop_map(|segments| format!("/{}", segments.join("/")))
}

fn leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,4}".prop_map(|s| json!(s)),
        any::<bool>().prop_map(|b| json!(b)),
    ]
}

fn object_of(
    inner: impl Strategy<Value = serde_json::Value>,
) -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map(key(), inner, 1..4)
        .prop_map(|m| serde_json::Value::Object(m.into_iter().collect()))
}

fn json_value() -> impl Strategy<Value = serde_json::Value> {
    leaf().prop_recursive(3, 24, 4, |inner| object_of(inner))
}

fn json_object() -> impl Strategy<Value = serde_json::Value> {
    object_of(json_value())
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        4 => (path_string(), json_value()).prop_map(|(p, v)| Event::set(p, v)),
        2 => (path_string(), json_object()).prop_map(|(p, v)| Event::update(p, v)),
        2 => path_string().prop_map(Event::remove),
        1 => (path_string(), 0i64..4).prop_map(|(p, n)| Event::set_priority(p, n)),
        1 => (path_string(), key(), leaf()).prop_map(|(p, k, v)| Event::push_named(p, k, v)),
    ]
}

fn path(raw: &str) -> Path {
    Path::parse(raw).unwrap()
}

proptest! {
    #[test]
    fn prop_replay_reproduces_tree_and_logs(events in prop::collection::vec(event(), 1..30)) {
        let mut live = Persistence::default();
        let logs: Vec<_> = events
            .iter()
            .enumerate()
            .map(|(seq, e)| live.apply(e, seq as u64))
            .collect();

        let mut replayed = Persistence::default();
        for (seq, e) in events.iter().enumerate() {
            let mut decoded = Event::from_json(&e.to_json().unwrap()).unwrap();
            decoded.from_history = true;
            prop_assert_eq!(&replayed.apply(&decoded, seq as u64), &logs[seq]);
        }
        prop_assert_eq!(live.root(), replayed.root());
    }

    #[test]
    fn prop_remove_lists_every_descendant(tree in json_object()) {
        let mut p = Persistence::default();
        p.apply(&Event::set("/top", tree), 0).unwrap();
        let top = path("/top");
        prop_assume!(p.root().path_exists(&top));

        let before: Vec<Path> = p
            .root()
            .get_node_for_path(&top)
            .map(|n| n.subtree_entries(&top))
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.parent.append(e.key))
            .collect();

        let log = p.apply(&Event::remove("/top"), 1).unwrap();
        let removed: HashSet<Path> = log
            .entries()
            .iter()
            .filter(|e| matches!(e, ChangeLogEntry::ChildRemoved(_)))
            .map(ChangeLogEntry::affected_path)
            .collect();

        for descendant in &before {
            prop_assert!(removed.contains(descendant), "{} not reported", descendant);
        }
        prop_assert!(removed.contains(&top));
        prop_assert!(!p.root().path_exists(&top));
    }

    #[test]
    fn prop_scalar_write_logs_each_ancestor_value_once(
        tree in json_object(),
        target in path_string(),
        value in leaf(),
    ) {
        let mut p = Persistence::default();
        p.apply(&Event::set("/", tree), 0).unwrap();
        let log = p.apply(&Event::set(target.clone(), value), 1).unwrap();

        let target = path(&target);
        let mut expected = vec![target.clone()];
        expected.extend(target.ancestors());
        let values: Vec<Path> = log
            .entries()
            .iter()
            .filter_map(|e| match e {
                ChangeLogEntry::ValueChanged(v) => Some(v.path.clone()),
                _ => None,
            })
            .collect();
        prop_assert_eq!(values, expected);
    }

    #[test]
    fn prop_filter_content_is_idempotent(tree in json_object(), admin in any::<bool>()) {
        let rules = RuleSet::from_json(&json!({
            "rules": {
                ".read": "true",
                "a": { "c": { ".read": "false" } },
                "c": { ".read": "auth.admin == true" }
            }
        }))
        .unwrap();
        let authz = Authorization::with_rules(rules);
        let mut p = Persistence::default();
        p.apply(&Event::set("/", tree), 0).unwrap();
        let auth = if admin {
            AuthContext::user(arbor_core::Node::from_json(json!({"admin": true})).unwrap())
        } else {
            AuthContext::anonymous()
        };

        let root = p.root();
        let once = authz.filter_content(&auth, root, &Path::root(), &Value::Node(root.clone()));
        let twice = authz.filter_content(&auth, root, &Path::root(), &once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_query_transitions_are_well_formed(
        writes in prop::collection::vec((0usize..3, prop::option::of(0i64..60)), 1..40),
    ) {
        let mut p = Persistence::new(Arc::new(Authorization::allow_all()));
        let base = path("/users");
        let query = "age > 30";
        let mut queries = QueryEvaluator::new();
        queries.add_query(&base, query);
        let mut members: HashMap<Path, bool> = HashMap::new();

        for (seq, (user, age)) in writes.into_iter().enumerate() {
            let event = match age {
                Some(age) => Event::set(format!("/users/{user}/age"), age),
                None => Event::remove(format!("/users/{user}")),
            };
            let log = p.apply(&event, seq as u64).unwrap();
            for change in queries.process_changes(p.root(), &log.affected_paths()) {
                let was = members.get(&change.path).copied().unwrap_or(false);
                match change.transition {
                    QueryTransition::Added => prop_assert!(!was),
                    QueryTransition::Changed => prop_assert!(was),
                    QueryTransition::Removed => prop_assert!(was),
                }
                members.insert(change.path.clone(), change.transition != QueryTransition::Removed);
            }

            for user in 0..3 {
                let child = base.append(user.to_string());
                let matches = p
                    .get(&child.append("age"))
                    .and_then(|v| v.as_f64())
                    .is_some_and(|age| age > 30.0);
                prop_assert_eq!(queries.query_contains_node(&base, query, &child), matches);
            }
        }
    }
}
