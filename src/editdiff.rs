//! Component E: the edit/diff engine.
//!
//! A module's persisted data is modeled as a flat map from path to leaf
//! value, simple enough to keep in memory and serialize with `serde_json`,
//! while still letting the commit pipeline express "apply an edit, get a
//! diff" and "merge two diffs" with a consistent collapse rule.
//! The `SchemaLibrary` trait in [`crate::validator`] is the seam where a
//! real tree/XPath implementation would replace this model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;

/// A module's data tree: a flat map from path to leaf value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataTree(BTreeMap<String, Value>);

impl DataTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value at `path`, if set.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path)
    }

    /// Set `path` to `value`.
    pub fn set(&mut self, path: impl Into<String>, value: Value) {
        self.0.insert(path.into(), value);
    }

    /// Remove `path`, returning its prior value if any.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        self.0.remove(path)
    }

    /// True if the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the opaque byte container used for persisted files.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from the opaque byte container used for persisted files.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One leaf-level mutation requested by a session.
#[derive(Debug, Clone)]
pub enum EditOp {
    /// Replace (or create) the value at `path`.
    Set { path: String, value: Value },
    /// Merge `value` into whatever is at `path` (treated as replace for
    /// scalar leaves; the schema library would define structural merge for
    /// container nodes).
    Merge { path: String, value: Value },
    /// Remove `path` entirely.
    Delete { path: String },
}

impl EditOp {
    fn path(&self) -> &str {
        match self {
            EditOp::Set { path, .. } | EditOp::Merge { path, .. } | EditOp::Delete { path } => path,
        }
    }
}

/// A single edit fragment, rooted in one module.
#[derive(Debug, Clone)]
pub struct EditFragment {
    /// Module this fragment's root node belongs to.
    pub module: String,
    /// The mutations to apply, in order.
    pub ops: Vec<EditOp>,
}

/// A user-supplied set of tree mutations not yet applied to any datastore.
#[derive(Debug, Clone, Default)]
pub struct Edit {
    /// Fragments, each rooted in one module.
    pub fragments: Vec<EditFragment>,
}

impl Edit {
    /// An edit touching a single module.
    pub fn single(module: impl Into<String>, ops: Vec<EditOp>) -> Self {
        Self {
            fragments: vec![EditFragment {
                module: module.into(),
                ops,
            }],
        }
    }

    /// Distinct module names referenced by this edit's fragments, per the
    /// mod-info builder's primary-module collection step.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fragments.iter().map(|f| f.module.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    fn ops_for<'a>(&'a self, module: &str) -> impl Iterator<Item = &'a EditOp> {
        self.fragments
            .iter()
            .filter(move |f| f.module == module)
            .flat_map(|f| f.ops.iter())
    }
}

/// One path's net before/after change within a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Path of the changed leaf.
    pub path: String,
    /// Value before the change, or `None` if the leaf was created.
    pub before: Option<Value>,
    /// Value after the change, or `None` if the leaf was deleted.
    pub after: Option<Value>,
    /// True if this change is a pure default-value transition (insertion or
    /// removal of a schema-default value with no explicit user intent).
    /// An optimization hint for subscribers; the core does not rely on it
    /// for correctness.
    pub is_default_change: bool,
}

impl DiffEntry {
    /// Human-readable created/deleted/modified classification.
    pub fn kind(&self) -> DiffKind {
        match (&self.before, &self.after) {
            (None, Some(_)) => DiffKind::Created,
            (Some(_), None) => DiffKind::Deleted,
            (Some(b), Some(a)) if b != a => DiffKind::Modified,
            _ => DiffKind::Modified,
        }
    }
}

/// Classification of a [`DiffEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// The leaf did not exist before and exists after.
    Created,
    /// The leaf existed before and does not exist after.
    Deleted,
    /// The leaf existed both before and after with a different value.
    Modified,
}

/// A structured, replayable record of the differences between two data
/// trees of the same module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diff {
    /// Module this diff applies to.
    pub module: String,
    /// Per-path net changes.
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    /// An empty diff for `module` (the identity element under [`merge_diff`]).
    pub fn empty(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            entries: Vec::new(),
        }
    }

    /// True if any entry is a default-value change.
    pub fn has_default_change(&self) -> bool {
        self.entries.iter().any(|e| e.is_default_change)
    }
}

/// Apply `edit`'s fragments for `module` to `current`, producing the new
/// tree and the diff between `current` and the new tree.
pub fn apply_edit(edit: &Edit, module: &str, current: &DataTree) -> StoreResult<(DataTree, Diff)> {
    let mut new_data = current.clone();
    let mut touched: BTreeMap<String, (Option<Value>, Option<Value>)> = BTreeMap::new();

    for op in edit.ops_for(module) {
        let path = op.path().to_string();
        let before = touched
            .get(&path)
            .map(|(b, _)| b.clone())
            .unwrap_or_else(|| current.get(&path).cloned());
        match op {
            EditOp::Set { value, .. } | EditOp::Merge { value, .. } => {
                new_data.set(path.clone(), value.clone());
                touched.insert(path, (before, Some(value.clone())));
            }
            EditOp::Delete { .. } => {
                new_data.remove(&path);
                touched.insert(path, (before, None));
            }
        }
    }

    let entries = touched
        .into_iter()
        .filter(|(_, (before, after))| before != after)
        .map(|(path, (before, after))| DiffEntry {
            path,
            before,
            after,
            is_default_change: false,
        })
        .collect();

    Ok((
        new_data,
        Diff {
            module: module.to_string(),
            entries,
        },
    ))
}

/// Deterministically replay `diff` against `current`, producing the tree it
/// was computed against's successor.
pub fn apply_diff(diff: &Diff, current: &DataTree) -> DataTree {
    let mut data = current.clone();
    for entry in &diff.entries {
        match &entry.after {
            Some(v) => data.set(entry.path.clone(), v.clone()),
            None => {
                data.remove(&entry.path);
            }
        }
    }
    data
}

/// Compute the diff between two trees of the same module (used by the
/// round-trip law and by tests; the validator uses the same primitive to
/// compute its supplemental diff).
pub fn diff_trees(module: &str, before: &DataTree, after: &DataTree) -> Diff {
    let mut entries = Vec::new();
    let mut paths: Vec<&String> = before.0.keys().chain(after.0.keys()).collect();
    paths.sort();
    paths.dedup();
    for path in paths {
        let b = before.get(path).cloned();
        let a = after.get(path).cloned();
        if b != a {
            entries.push(DiffEntry {
                path: path.clone(),
                before: b,
                after: a,
                is_default_change: false,
            });
        }
    }
    Diff {
        module: module.to_string(),
        entries,
    }
}

/// Merge `from` into `into`, collapsing equal-path operations (e.g.
/// delete-then-create becomes modify) and keeping the earliest `before` with
/// the latest `after`. Returns true if the merge introduced or preserved
/// any default-value-only change.
///
/// Associative with [`Diff::empty`] as identity: merging the empty diff
/// never changes `into`, and `merge_diff(merge_diff(a, b), c)` produces the
/// same entries as `merge_diff(a, merge_diff(b, c))` because both reduce to
/// "earliest recorded `before`, latest recorded `after`" per path.
pub fn merge_diff(into: &mut Diff, from: &Diff) -> bool {
    let mut dflt_change = false;
    let mut by_path: BTreeMap<String, DiffEntry> =
        into.entries.drain(..).map(|e| (e.path.clone(), e)).collect();

    for e in &from.entries {
        match by_path.remove(&e.path) {
            Some(existing) => {
                let combined = DiffEntry {
                    path: e.path.clone(),
                    before: existing.before,
                    after: e.after.clone(),
                    is_default_change: existing.is_default_change || e.is_default_change,
                };
                if combined.before != combined.after {
                    if combined.is_default_change {
                        dflt_change = true;
                    }
                    by_path.insert(e.path.clone(), combined);
                }
            }
            None => {
                if e.is_default_change {
                    dflt_change = true;
                }
                by_path.insert(e.path.clone(), e.clone());
            }
        }
    }

    into.entries = by_path.into_values().collect();
    dflt_change
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_read() {
        let mut tree = DataTree::new();
        let edit = Edit::single("ex", vec![EditOp::Set { path: "/ex:a".into(), value: json!("1") }]);
        let (new_tree, diff) = apply_edit(&edit, "ex", &tree).unwrap();
        assert_eq!(new_tree.get("/ex:a"), Some(&json!("1")));
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(diff.entries[0].kind(), DiffKind::Created);
        tree = new_tree;

        let edit2 = Edit::single("ex", vec![EditOp::Delete { path: "/ex:a".into() }]);
        let (new_tree2, diff2) = apply_edit(&edit2, "ex", &tree).unwrap();
        assert!(new_tree2.get("/ex:a").is_none());
        assert_eq!(diff2.entries[0].kind(), DiffKind::Deleted);
    }

    #[test]
    fn set_and_delete_same_path_collapses_to_noop_in_one_edit() {
        let tree = DataTree::new();
        let edit = Edit::single(
            "ex",
            vec![
                EditOp::Set { path: "/ex:a".into(), value: json!("1") },
                EditOp::Delete { path: "/ex:a".into() },
            ],
        );
        let (new_tree, diff) = apply_edit(&edit, "ex", &tree).unwrap();
        assert!(new_tree.get("/ex:a").is_none());
        assert!(diff.entries.is_empty());
    }

    #[test]
    fn apply_diff_replays_deterministically() {
        let tree = DataTree::new();
        let edit = Edit::single("ex", vec![EditOp::Set { path: "/ex:a".into(), value: json!(1) }]);
        let (new_tree, diff) = apply_edit(&edit, "ex", &tree).unwrap();
        let replayed = apply_diff(&diff, &tree);
        assert_eq!(replayed, new_tree);
    }

    #[test]
    fn merge_diff_collapses_delete_then_create_to_modify() {
        let mut into = Diff {
            module: "ex".into(),
            entries: vec![DiffEntry {
                path: "/ex:a".into(),
                before: Some(json!("1")),
                after: None,
                is_default_change: false,
            }],
        };
        let from = Diff {
            module: "ex".into(),
            entries: vec![DiffEntry {
                path: "/ex:a".into(),
                before: None,
                after: Some(json!("2")),
                is_default_change: false,
            }],
        };
        merge_diff(&mut into, &from);
        assert_eq!(into.entries.len(), 1);
        assert_eq!(into.entries[0].before, Some(json!("1")));
        assert_eq!(into.entries[0].after, Some(json!("2")));
        assert_eq!(into.entries[0].kind(), DiffKind::Modified);
    }

    #[test]
    fn merge_diff_empty_is_identity() {
        let mut into = Diff {
            module: "ex".into(),
            entries: vec![DiffEntry {
                path: "/ex:a".into(),
                before: None,
                after: Some(json!(1)),
                is_default_change: false,
            }],
        };
        let before = into.clone();
        let empty = Diff::empty("ex");
        merge_diff(&mut into, &empty);
        assert_eq!(into.entries, before.entries);
    }

    #[test]
    fn merge_diff_is_associative() {
        let a = Diff {
            module: "ex".into(),
            entries: vec![DiffEntry { path: "/x".into(), before: None, after: Some(json!(1)), is_default_change: false }],
        };
        let b = Diff {
            module: "ex".into(),
            entries: vec![DiffEntry { path: "/x".into(), before: Some(json!(1)), after: Some(json!(2)), is_default_change: false }],
        };
        let c = Diff {
            module: "ex".into(),
            entries: vec![DiffEntry { path: "/x".into(), before: Some(json!(2)), after: None, is_default_change: false }],
        };

        let mut left = a.clone();
        merge_diff(&mut left, &b);
        merge_diff(&mut left, &c);

        let mut bc = b.clone();
        merge_diff(&mut bc, &c);
        let mut right = a.clone();
        merge_diff(&mut right, &bc);

        assert_eq!(left.entries, right.entries);
    }

    #[test]
    fn round_trip_law() {
        let d1 = DataTree::new();
        let mut d2 = DataTree::new();
        d2.set("/ex:a", json!("1"));

        let diff_1_2 = diff_trees("ex", &d1, &d2);
        let replayed = apply_diff(&diff_1_2, &d1);
        let diff_1_replayed = diff_trees("ex", &d1, &replayed);
        assert_eq!(diff_1_2.entries, diff_1_replayed.entries);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn small_op() -> impl Strategy<Value = EditOp> {
        (0u8..4, prop::option::of(0u8..4)).prop_map(|(path_idx, value)| {
            let path = format!("/ex:p{path_idx}");
            match value {
                Some(v) => EditOp::Set { path, value: json!(v) },
                None => EditOp::Delete { path },
            }
        })
    }

    fn apply_chain(ops: &[EditOp]) -> (DataTree, Diff) {
        let mut tree = DataTree::new();
        let mut acc = Diff::empty("ex");
        for op in ops {
            let edit = Edit::single("ex", vec![op.clone()]);
            let (new_tree, step_diff) = apply_edit(&edit, "ex", &tree).unwrap();
            merge_diff(&mut acc, &step_diff);
            tree = new_tree;
        }
        (tree, acc)
    }

    proptest! {
        #[test]
        fn merge_then_replay_matches_direct_application(ops in prop::collection::vec(small_op(), 0..12)) {
            let (final_tree, merged) = apply_chain(&ops);
            let replayed = apply_diff(&merged, &DataTree::new());
            prop_assert_eq!(replayed, final_tree);
        }

        #[test]
        fn merge_diff_chain_is_order_independent_of_grouping(
            a_ops in prop::collection::vec(small_op(), 0..5),
            b_ops in prop::collection::vec(small_op(), 0..5),
            c_ops in prop::collection::vec(small_op(), 0..5),
        ) {
            let (_, a) = apply_chain(&a_ops);
            let (_, b) = apply_chain(&b_ops);
            let (_, c) = apply_chain(&c_ops);

            let mut left = a.clone();
            merge_diff(&mut left, &b);
            merge_diff(&mut left, &c);

            let mut bc = b.clone();
            merge_diff(&mut bc, &c);
            let mut right = a.clone();
            merge_diff(&mut right, &bc);

            let mut left_sorted = left.entries.clone();
            left_sorted.sort_by(|x, y| x.path.cmp(&y.path));
            let mut right_sorted = right.entries.clone();
            right_sorted.sort_by(|x, y| x.path.cmp(&y.path));
            prop_assert_eq!(left_sorted, right_sorted);
        }

        #[test]
        fn merging_empty_diff_is_a_no_op(ops in prop::collection::vec(small_op(), 0..8)) {
            let (_, diff) = apply_chain(&ops);
            let before = diff.entries.clone();
            let mut into = diff;
            merge_diff(&mut into, &Diff::empty("ex"));
            prop_assert_eq!(into.entries, before);
        }
    }
}
