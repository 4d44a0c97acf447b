//! Component F: the validator, and the `SchemaLibrary` trait it is built
//! against.
//!
//! The schema/data-tree library itself (parsing, XPath evaluation, schema
//! introspection) is out of scope here: it is modeled as a consumed trait
//! with an in-memory reference
//! implementation sufficient to drive the leafref and instance-identifier
//! test scenarios. A production deployment would swap in a real
//! schema/XPath engine behind the same trait.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::editdiff::{apply_diff as apply_diff_fn, diff_trees, DataTree, Diff};
use crate::error::{StoreError, StoreResult, ValidationIssue};
use crate::index::ModuleIndex;
use crate::modinfo::{ModInfo, ModState};
use crate::segment::Offset;

/// External schema/data-tree library, consumed (not provided) by this crate.
pub trait SchemaLibrary: Send + Sync {
    /// Parse a module's data tree from its opaque on-disk byte container.
    fn parse(&self, bytes: &[u8]) -> StoreResult<DataTree> {
        DataTree::from_bytes(bytes)
    }

    /// Serialize a module's data tree to its opaque on-disk byte container.
    fn serialize(&self, tree: &DataTree) -> StoreResult<Vec<u8>> {
        tree.to_bytes()
    }

    /// Evaluate an XPath over a data tree, returning the matching leaf values.
    fn evaluate(&self, tree: &DataTree, xpath: &str) -> Vec<Value>;

    /// Statically atomize an XPath into the set of module names it references.
    fn atomize(&self, xpath: &str) -> Vec<String>;

    /// Validate `trees` restricted to the modules named in `to_validate`.
    fn validate(&self, trees: &BTreeMap<String, DataTree>, to_validate: &[String]) -> Vec<ValidationIssue>;

    /// Changes validation itself induces (auto-deleted `when`-false nodes,
    /// inserted defaults), keyed by module name. Defaults to none.
    fn induced_diff(&self, _trees: &BTreeMap<String, DataTree>, _to_validate: &[String]) -> BTreeMap<String, Diff> {
        BTreeMap::new()
    }

    /// Compute the diff between two trees of the same module.
    fn diff(&self, module: &str, before: &DataTree, after: &DataTree) -> Diff {
        diff_trees(module, before, after)
    }

    /// Deterministically replay a diff against a tree.
    fn apply_diff(&self, diff: &Diff, tree: &DataTree) -> DataTree {
        apply_diff_fn(diff, tree)
    }
}

/// A single leafref-style referential rule: the leaf at `path` in `module`
/// must match some leaf at `target_path` in `target_module`.
#[derive(Debug, Clone)]
pub struct LeafrefRule {
    /// Module declaring the referencing leaf.
    pub module: String,
    /// Path of the referencing leaf.
    pub path: String,
    /// Module holding the referenced leaf.
    pub target_module: String,
    /// Path of the referenced leaf.
    pub target_path: String,
}

/// In-memory reference [`SchemaLibrary`] sufficient for tests: supports
/// registered leafref rules and a static XPath-atomization table, both
/// configured up front.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSchemaLibrary {
    leafref_rules: Vec<LeafrefRule>,
    atomize_table: BTreeMap<String, Vec<String>>,
    induced: BTreeMap<String, Diff>,
}

impl ReferenceSchemaLibrary {
    /// A library with no rules registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a leafref rule checked during `validate`.
    pub fn add_leafref(mut self, rule: LeafrefRule) -> Self {
        self.leafref_rules.push(rule);
        self
    }

    /// Register the static atomization result for `xpath`.
    pub fn with_atomize(mut self, xpath: impl Into<String>, modules: Vec<String>) -> Self {
        self.atomize_table.insert(xpath.into(), modules);
        self
    }

    /// Register a canned induced diff for `module`, returned by every call
    /// to `induced_diff` that includes it in `to_validate`.
    pub fn with_induced_diff(mut self, module: impl Into<String>, diff: Diff) -> Self {
        self.induced.insert(module.into(), diff);
        self
    }
}

impl SchemaLibrary for ReferenceSchemaLibrary {
    fn evaluate(&self, tree: &DataTree, xpath: &str) -> Vec<Value> {
        tree.get(xpath).cloned().into_iter().collect()
    }

    fn atomize(&self, xpath: &str) -> Vec<String> {
        self.atomize_table.get(xpath).cloned().unwrap_or_default()
    }

    fn validate(&self, trees: &BTreeMap<String, DataTree>, to_validate: &[String]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for rule in &self.leafref_rules {
            if !to_validate.contains(&rule.module) {
                continue;
            }
            let Some(tree) = trees.get(&rule.module) else {
                continue;
            };
            let Some(value) = tree.get(&rule.path) else {
                continue;
            };
            let target_has_value = trees
                .get(&rule.target_module)
                .and_then(|t| t.get(&rule.target_path))
                .is_some_and(|target_value| target_value == value);
            if !target_has_value {
                issues.push(ValidationIssue::at(
                    format!(
                        "leafref '{}' in module '{}' does not resolve to '{}' in module '{}'",
                        rule.path, rule.module, rule.target_path, rule.target_module
                    ),
                    rule.path.clone(),
                ));
            }
        }
        issues
    }

    fn induced_diff(&self, _trees: &BTreeMap<String, DataTree>, to_validate: &[String]) -> BTreeMap<String, Diff> {
        self.induced
            .iter()
            .filter(|(m, _)| to_validate.contains(m))
            .map(|(m, d)| (m.clone(), d.clone()))
            .collect()
    }
}

fn module_from_instance_id(value: &Value) -> Option<String> {
    let s = value.as_str()?;
    s.trim_start_matches('/').split(':').next().map(str::to_owned)
}

/// Runs schema validation over a mod-info's REQ ∪ INV_DEP modules, pulling
/// in instance-identifier targets discovered from the actual data.
pub struct Validator<'a> {
    index: &'a ModuleIndex,
    schema: &'a dyn SchemaLibrary,
}

impl<'a> Validator<'a> {
    /// Build a validator over `index`, delegating policy checks to `schema`.
    pub fn new(index: &'a ModuleIndex, schema: &'a dyn SchemaLibrary) -> Self {
        Self { index, schema }
    }

    /// Run validation. `load_data` loads a module's current on-disk tree by
    /// record offset, used both for modules discovered as instance-id
    /// targets and for any REQ/INV_DEP module whose data was not already
    /// attached to the mod-info.
    pub fn validate<F>(&self, mod_info: &mut ModInfo, finish_diff: bool, load_data: F) -> StoreResult<()>
    where
        F: Fn(Offset) -> StoreResult<DataTree>,
    {
        let mut dep_only_added: Vec<Offset> = Vec::new();

        // Step 2: instance-identifier dependency discovery, limited to REQ modules.
        for req_off in mod_info.req_modules() {
            let edges = self.index.instance_id_edges(req_off)?;
            if edges.is_empty() {
                continue;
            }
            let data_snapshot = mod_info
                .entry(req_off)
                .and_then(|e| e.data.clone())
                .unwrap_or_default();

            for (xpath, default_target) in edges {
                let resolved = self
                    .schema
                    .evaluate(&data_snapshot, &xpath)
                    .first()
                    .and_then(module_from_instance_id)
                    .map(|name| self.index.lookup_by_name(&name))
                    .transpose()?
                    .flatten();

                let target_off = resolved.or(default_target);
                if let Some(off) = target_off {
                    if mod_info.entry(off).is_none() {
                        mod_info.entries.push(crate::modinfo::new_dep_entry(off));
                        dep_only_added.push(off);
                        mod_info.entries.sort_by_key(|e| e.module_off);
                    }
                }
            }
        }

        // Ensure every module entering the forest has data loaded.
        for off in mod_info.entries.iter().map(|e| e.module_off).collect::<Vec<_>>() {
            if mod_info.entry(off).unwrap().data.is_none() {
                let data = load_data(off)?;
                mod_info.entry_mut(off).unwrap().data = Some(data);
            }
        }

        let to_validate_offsets = mod_info.validation_set();
        let mut name_of: BTreeMap<Offset, String> = BTreeMap::new();
        let mut forest: BTreeMap<String, DataTree> = BTreeMap::new();
        for entry in &mod_info.entries {
            let name = self.index.name_of(entry.module_off)?;
            forest.insert(name.clone(), entry.data.clone().unwrap_or_default());
            name_of.insert(entry.module_off, name);
        }
        let to_validate: Vec<String> = to_validate_offsets
            .iter()
            .map(|off| name_of[off].clone())
            .collect();

        let issues = self.schema.validate(&forest, &to_validate);
        if !issues.is_empty() {
            return Err(StoreError::ValidationFailed(issues));
        }

        if finish_diff {
            let induced = self.schema.induced_diff(&forest, &to_validate);
            for (module_name, supplemental) in induced {
                let off = *name_of.iter().find(|(_, n)| **n == module_name).unwrap().0;
                let entry = mod_info.entry_mut(off).unwrap();
                let mut base = entry.diff.take().unwrap_or_else(|| Diff::empty(module_name.clone()));
                crate::editdiff::merge_diff(&mut base, &supplemental);
                let now_has_entries = !base.entries.is_empty();
                entry.data = Some(self.schema.apply_diff(&supplemental, &entry.data.clone().unwrap_or_default()));
                entry.diff = Some(base);
                if now_has_entries && entry.state.intersects(ModState::INV_DEP) {
                    entry.state |= ModState::CHANGED;
                }
            }
        }

        // Detach DEP-only trees discovered purely for this validation pass.
        for off in dep_only_added {
            if let Some(entry) = mod_info.entry_mut(off) {
                if entry.state == ModState::DEP {
                    entry.data = None;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DeclaredDependency;
    use crate::modinfo::ModInfoBuilder;
    use crate::segment::Segment;
    use serde_json::json;
    use tempfile::tempdir;

    fn fresh_index() -> (tempfile::TempDir, ModuleIndex) {
        let dir = tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        (dir, ModuleIndex::new(seg))
    }

    #[test]
    fn leafref_validation_fails_then_succeeds() {
        let (_dir, mut idx) = fresh_index();
        let ref_off = idx.install("ref", &[]).unwrap();
        let ops_off = idx
            .install("ops", &[DeclaredDependency::Direct { target: "ref".into() }])
            .unwrap();

        let schema = ReferenceSchemaLibrary::new().add_leafref(LeafrefRule {
            module: "ops".into(),
            path: "/ops:rpc1/l1".into(),
            target_module: "ref".into(),
            target_path: "/ref:l1".into(),
        });

        // No data in `ref` yet: validation should fail.
        let mut mi = ModInfoBuilder::from_primaries_pub(&idx, &[ops_off]).unwrap();
        let mut ops_data = DataTree::new();
        ops_data.set("/ops:rpc1/l1", json!("v"));
        mi.entry_mut(ops_off).unwrap().data = Some(ops_data.clone());
        mi.entry_mut(ref_off).unwrap().data = Some(DataTree::new());

        let validator = Validator::new(&idx, &schema);
        let res = validator.validate(&mut mi, false, |_| Ok(DataTree::new()));
        assert!(matches!(res, Err(StoreError::ValidationFailed(_))));

        // After setting /ref:l1 = "v", validation succeeds.
        let mut ref_data = DataTree::new();
        ref_data.set("/ref:l1", json!("v"));
        let mut mi2 = ModInfoBuilder::from_primaries_pub(&idx, &[ops_off]).unwrap();
        mi2.entry_mut(ops_off).unwrap().data = Some(ops_data);
        mi2.entry_mut(ref_off).unwrap().data = Some(ref_data);
        validator.validate(&mut mi2, false, |_| Ok(DataTree::new())).unwrap();
    }

    #[test]
    fn instance_identifier_pulls_in_target_module() {
        let (_dir, mut idx) = fresh_index();
        let b = idx.install("b", &[]).unwrap();
        let a = idx
            .install(
                "a",
                &[DeclaredDependency::InstanceId {
                    xpath: "/a:ref".into(),
                    default_target: None,
                }],
            )
            .unwrap();

        let schema = ReferenceSchemaLibrary::new();
        let mut mi = ModInfoBuilder::from_primaries_pub(&idx, &[a]).unwrap();
        let mut a_data = DataTree::new();
        a_data.set("/a:ref", json!("/b:x"));
        mi.entry_mut(a).unwrap().data = Some(a_data);

        let validator = Validator::new(&idx, &schema);
        validator.validate(&mut mi, false, |_| Ok(DataTree::new())).unwrap();
        assert!(mi.entry(b).is_some());
    }

    #[test]
    fn induced_diff_promotes_inv_dep_to_changed() {
        let (_dir, mut idx) = fresh_index();
        let b = idx.install("b", &[]).unwrap();
        let a = idx
            .install("a", &[DeclaredDependency::Direct { target: "b".into() }])
            .unwrap();

        let induced = Diff {
            module: "a".into(),
            entries: vec![crate::editdiff::DiffEntry {
                path: "/a:default_leaf".into(),
                before: None,
                after: Some(json!("dflt")),
                is_default_change: true,
            }],
        };
        let schema = ReferenceSchemaLibrary::new().with_induced_diff("a", induced);

        // Editing b pulls a in as INV_DEP.
        let mut mi = ModInfoBuilder::from_primaries_pub(&idx, &[b]).unwrap();
        mi.entry_mut(b).unwrap().data = Some(DataTree::new());
        mi.entry_mut(a).unwrap().data = Some(DataTree::new());

        let validator = Validator::new(&idx, &schema);
        validator.validate(&mut mi, true, |_| Ok(DataTree::new())).unwrap();
        let a_entry = mi.entry(a).unwrap();
        assert!(a_entry.state.contains(ModState::CHANGED));
        assert!(a_entry.diff.as_ref().unwrap().has_default_change());
    }
}
