//! Component C: the mod-info builder.
//!
//! Computes, for an edit or an XPath, the closed set of modules a
//! transaction must touch, classified as REQ (to be changed), DEP (a
//! read-only schema dependency), or INV_DEP (a module that schema-references
//! a REQ module and so must be re-validated).
//!
//! Because inverse edges are already materialized on each module's record
//! (see [`crate::index`]), step 4 of the closure algorithm ("scan the
//! index for modules with an edge pointing at this one") is a direct
//! lookup rather than a linear scan over every installed module.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::editdiff::{Diff, DataTree, Edit};
use crate::error::StoreResult;
use crate::index::ModuleIndex;
use crate::segment::Offset;

bitflags! {
    /// Classification bits for a module within one transaction's mod-info.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModState: u8 {
        /// Primary module: the transaction intends to change it.
        const REQ = 0b0000_0001;
        /// A module that schema-references a REQ module; must be re-validated.
        const INV_DEP = 0b0000_0010;
        /// A read-only schema dependency of a REQ or DEP module.
        const DEP = 0b0000_0100;
        /// This transaction currently holds a lock on this module.
        const LOCK = 0b0000_1000;
        /// This module's data changed as a result of the transaction.
        const CHANGED = 0b0001_0000;
    }
}

/// One module's working state within a transaction.
pub struct ModInfoEntry {
    /// Offset of the module's record in the shared segment.
    pub module_off: Offset,
    /// Classification bits.
    pub state: ModState,
    /// Current (pre-edit, then post-edit) data tree, once loaded.
    pub data: Option<DataTree>,
    /// Accumulated diff fragment for this module.
    pub diff: Option<Diff>,
    /// True if *this* transaction set `applying_changes` on this module and
    /// therefore owns clearing it. Tracked here, never inferred from the
    /// shared flag's value alone.
    pub owns_applying_changes: bool,
}

impl ModInfoEntry {
    fn new(module_off: Offset, state: ModState) -> Self {
        Self {
            module_off,
            state,
            data: None,
            diff: None,
            owns_applying_changes: false,
        }
    }
}

/// Build a fresh DEP-only entry, for modules pulled in outside the initial
/// closure pass (instance-identifier targets discovered during validation).
pub(crate) fn new_dep_entry(module_off: Offset) -> ModInfoEntry {
    ModInfoEntry::new(module_off, ModState::DEP)
}

/// The per-transaction working set, sorted by module-record offset.
pub struct ModInfo {
    /// Entries in canonical (ascending module-offset) lock order.
    pub entries: Vec<ModInfoEntry>,
}

impl ModInfo {
    /// Entry for `module_off`, if present.
    pub fn entry(&self, module_off: Offset) -> Option<&ModInfoEntry> {
        self.entries.iter().find(|e| e.module_off == module_off)
    }

    /// Mutable entry for `module_off`, if present.
    pub fn entry_mut(&mut self, module_off: Offset) -> Option<&mut ModInfoEntry> {
        self.entries.iter_mut().find(|e| e.module_off == module_off)
    }

    /// Offsets of every module with the REQ bit set.
    pub fn req_modules(&self) -> Vec<Offset> {
        self.entries
            .iter()
            .filter(|e| e.state.contains(ModState::REQ))
            .map(|e| e.module_off)
            .collect()
    }

    /// Offsets of every module with REQ or INV_DEP set (the validation set).
    pub fn validation_set(&self) -> Vec<Offset> {
        self.entries
            .iter()
            .filter(|e| e.state.intersects(ModState::REQ | ModState::INV_DEP))
            .map(|e| e.module_off)
            .collect()
    }

    /// Offsets of every module with CHANGED set.
    pub fn changed_modules(&self) -> Vec<Offset> {
        self.entries
            .iter()
            .filter(|e| e.state.contains(ModState::CHANGED))
            .map(|e| e.module_off)
            .collect()
    }
}

/// Builds [`ModInfo`]s by closing a set of primary modules under schema
/// dependency.
pub struct ModInfoBuilder;

impl ModInfoBuilder {
    /// Build a mod-info from an edit: the primary set is the edit's distinct
    /// target modules.
    pub fn from_edit(index: &ModuleIndex, edit: &Edit) -> StoreResult<ModInfo> {
        let mut primaries = Vec::new();
        for module_name in edit.module_names() {
            if let Some(off) = index.lookup_by_name(&module_name)? {
                primaries.push(off);
            } else {
                return Err(crate::error::StoreError::NotFound(format!(
                    "edit references unknown module '{module_name}'"
                )));
            }
        }
        Self::from_primaries(index, &primaries)
    }

    /// Build a mod-info from an XPath: the primary set is the context
    /// module plus every module referenced by the atomized node set.
    pub fn from_xpath(
        index: &ModuleIndex,
        context_module: Offset,
        atomized_modules: &[Offset],
    ) -> StoreResult<ModInfo> {
        let mut primaries = vec![context_module];
        primaries.extend_from_slice(atomized_modules);
        Self::from_primaries(index, &primaries)
    }

    /// Shared closure algorithm: add each primary with REQ, then close
    /// under direct dependencies (DEP) and materialized inverse edges
    /// (INV_DEP), finally sorting by offset for the canonical lock order.
    fn from_primaries(index: &ModuleIndex, primaries: &[Offset]) -> StoreResult<ModInfo> {
        let mut states: BTreeMap<Offset, ModState> = BTreeMap::new();
        for &off in primaries {
            add_with_deps(index, &mut states, off, ModState::REQ)?;
        }
        let entries = states
            .into_iter()
            .map(|(off, state)| ModInfoEntry::new(off, state))
            .collect();
        Ok(ModInfo { entries })
    }
}

/// Recursive dependency closure. Stops as soon as a call would not change
/// the entry's existing classification, which both terminates cycles and
/// keeps expansion from re-running once a module's state has settled.
fn add_with_deps(
    index: &ModuleIndex,
    states: &mut BTreeMap<Offset, ModState>,
    module_off: Offset,
    new_state: ModState,
) -> StoreResult<()> {
    let prev = states.get(&module_off).copied().unwrap_or(ModState::empty());
    let union = prev | new_state;
    if union == prev {
        return Ok(());
    }
    states.insert(module_off, union);

    if union.intersects(ModState::REQ | ModState::DEP | ModState::INV_DEP) {
        for target in index.direct_targets(module_off)? {
            add_with_deps(index, states, target, ModState::DEP)?;
        }
    }
    if union.contains(ModState::REQ) {
        for dependent in index.inverse_dependents(module_off)? {
            add_with_deps(index, states, dependent, ModState::INV_DEP)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DeclaredDependency;
    use crate::segment::Segment;
    use tempfile::tempdir;

    fn fresh_index() -> (tempfile::TempDir, ModuleIndex) {
        let dir = tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        (dir, ModuleIndex::new(seg))
    }

    #[test]
    fn primary_module_alone_is_req() {
        let (_dir, mut idx) = fresh_index();
        let ex = idx.install("ex", &[]).unwrap();
        let mi = ModInfoBuilder::from_primaries_pub(&idx, &[ex]).unwrap();
        assert_eq!(mi.entries.len(), 1);
        assert!(mi.entries[0].state.contains(ModState::REQ));
    }

    #[test]
    fn direct_dependency_is_dep_and_dependent_is_inv_dep() {
        let (_dir, mut idx) = fresh_index();
        let b = idx.install("b", &[]).unwrap();
        let a = idx
            .install("a", &[DeclaredDependency::Direct { target: "b".into() }])
            .unwrap();

        // Editing b should pull a in as INV_DEP because a references b.
        let mi = ModInfoBuilder::from_primaries_pub(&idx, &[b]).unwrap();
        let b_entry = mi.entry(b).unwrap();
        assert!(b_entry.state.contains(ModState::REQ));
        let a_entry = mi.entry(a).unwrap();
        assert!(a_entry.state.contains(ModState::INV_DEP));

        // Editing a should pull b in as DEP.
        let mi2 = ModInfoBuilder::from_primaries_pub(&idx, &[a]).unwrap();
        assert!(mi2.entry(a).unwrap().state.contains(ModState::REQ));
        assert!(mi2.entry(b).unwrap().state.contains(ModState::DEP));
    }

    #[test]
    fn inv_dep_modules_own_dependencies_are_pulled_in_as_dep() {
        let (_dir, mut idx) = fresh_index();
        let leaf = idx.install("leaf", &[]).unwrap();
        let target = idx.install("target", &[]).unwrap();
        let mid = idx
            .install(
                "mid",
                &[
                    DeclaredDependency::Direct { target: "target".into() },
                    DeclaredDependency::Direct { target: "leaf".into() },
                ],
            )
            .unwrap();

        // Editing target pulls mid in as INV_DEP (mid references target);
        // mid's own dependency on leaf must then be walked too, so leaf
        // ends up DEP even though it has no direct relationship to target.
        let mi = ModInfoBuilder::from_primaries_pub(&idx, &[target]).unwrap();
        assert!(mi.entry(target).unwrap().state.contains(ModState::REQ));
        assert!(mi.entry(mid).unwrap().state.contains(ModState::INV_DEP));
        assert!(mi.entry(leaf).unwrap().state.contains(ModState::DEP));
    }

    #[test]
    fn mod_info_is_sorted_by_offset() {
        let (_dir, mut idx) = fresh_index();
        let b = idx.install("b", &[]).unwrap();
        let a = idx
            .install("a", &[DeclaredDependency::Direct { target: "b".into() }])
            .unwrap();
        let mi = ModInfoBuilder::from_primaries_pub(&idx, &[a, b]).unwrap();
        let offsets: Vec<Offset> = mi.entries.iter().map(|e| e.module_off).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);
    }

    // Test-only accessor: exercises the private closure algorithm directly
    // without requiring a full `Edit`.
    impl ModInfoBuilder {
        pub(crate) fn from_primaries_pub(index: &ModuleIndex, primaries: &[Offset]) -> StoreResult<ModInfo> {
            ModInfoBuilder::from_primaries(index, primaries)
        }
    }
}
