//! Component G: the commit pipeline state machine.
//!
//! `idle → locked → diffed → validated → change_notified → stored →
//! done_notified → idle`, with an `abort_notified` branch taken whenever a
//! subscriber vetoes during `change_notified`: already-notified subscribers
//! are redelivered `ABORT` in the reverse of the order they saw `CHANGE`,
//! and the commit fails with `callback_failed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::editdiff::{apply_edit, DataTree, Diff, Edit};
use crate::error::{StoreError, StoreResult};
use crate::index::{Datastore, ModuleIndex};
use crate::lock::{LockCoordinator, LockMode};
use crate::modinfo::{ModInfo, ModInfoBuilder, ModState};
use crate::segment::Offset;
use crate::subscription::{self, SubscriptionEvents};
use crate::validator::{SchemaLibrary, Validator};

/// The commit pipeline's state, exposed mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    /// No commit in flight.
    Idle,
    /// Mod-info built and modules locked with `applying_changes` set.
    Locked,
    /// Each REQ module's edit applied and diffed against its on-disk data.
    Diffed,
    /// Schema validation passed; the validation-induced diff is merged in.
    Validated,
    /// `CHANGE` delivered to every CHANGED module's subscribers.
    ChangeNotified,
    /// A subscriber vetoed; `ABORT` redelivered to subscribers that saw `CHANGE`.
    AbortNotified,
    /// Every CHANGED module's new data written back to disk.
    Stored,
    /// `DONE` delivered to every subscriber that saw `CHANGE`.
    DoneNotified,
}

/// In-process callback interface for a registered subscription.
///
/// A real deployment would dispatch these over a socket to another process;
/// this crate models delivery itself, leaving the transport as a consumed
/// collaborator the same way [`SchemaLibrary`] models the schema engine.
pub trait Subscriber: Send + Sync {
    /// Pre-store notification. Returning `Err` aborts the commit.
    fn on_change(&self, module: &str, diff: &Diff) -> StoreResult<()>;

    /// Post-store notification once the commit is fully applied.
    fn on_done(&self, _module: &str, _diff: &Diff) {}

    /// Delivered, in reverse delivery order, to subscribers that already
    /// saw `on_change` when a later subscriber vetoed the commit.
    fn on_abort(&self, _module: &str, _diff: &Diff) {}
}

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Final stage reached (always [`CommitStage::DoneNotified`] on success).
    pub stage: CommitStage,
    /// Names of the modules whose data changed.
    pub changed_modules: Vec<String>,
}

/// Drives one edit through the full commit state machine against a single
/// datastore.
pub struct CommitPipeline<'a> {
    index: &'a ModuleIndex,
    config: &'a Config,
    schema: &'a dyn SchemaLibrary,
    subscribers: &'a HashMap<u64, Arc<dyn Subscriber>>,
    repo_root: &'a Path,
    ds: Datastore,
}

impl<'a> CommitPipeline<'a> {
    /// Build a pipeline targeting `ds`, persisting under `repo_root/data`.
    pub fn new(
        index: &'a ModuleIndex,
        config: &'a Config,
        schema: &'a dyn SchemaLibrary,
        subscribers: &'a HashMap<u64, Arc<dyn Subscriber>>,
        repo_root: &'a Path,
        ds: Datastore,
    ) -> Self {
        Self {
            index,
            config,
            schema,
            subscribers,
            repo_root,
            ds,
        }
    }

    fn module_data_path(&self, module: &str) -> PathBuf {
        self.repo_root.join("data").join(format!("{module}.{}", self.ds.file_suffix()))
    }

    fn load_module_data(&self, module: &str) -> StoreResult<DataTree> {
        let path = self.module_data_path(module);
        if !path.exists() {
            return Ok(DataTree::new());
        }
        let bytes = std::fs::read(&path)?;
        self.schema.parse(&bytes)
    }

    fn persist_module_data(&self, module: &str, data: &DataTree) -> StoreResult<()> {
        let path = self.module_data_path(module);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.schema.serialize(data)?;
        let tmp = path.with_extension(format!("{}.tmp", self.ds.file_suffix()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Run `edit` through the full pipeline: lock, diff, validate, notify,
    /// store, notify, unlocking on every exit path.
    pub fn commit(&self, edit: &Edit) -> StoreResult<CommitOutcome> {
        let mut mod_info = ModInfoBuilder::from_edit(self.index, edit)?;
        let lock_coord = LockCoordinator::new(self.index, self.config);

        lock_coord.lock_all(&mut mod_info, self.ds, LockMode::Write, true)?;
        let result = self.run_locked(&mut mod_info, edit);
        let unlock_result = lock_coord.unlock_all(&mut mod_info, self.ds);

        match result {
            Ok(outcome) => {
                unlock_result?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = unlock_result;
                Err(e)
            }
        }
    }

    fn run_locked(&self, mod_info: &mut ModInfo, edit: &Edit) -> StoreResult<CommitOutcome> {
        self.compute_diffs(mod_info, edit)?;

        let validator = Validator::new(self.index, self.schema);
        validator.validate(mod_info, true, |off| {
            let name = self.index.name_of(off)?;
            self.load_module_data(&name)
        })?;

        let changed = mod_info.changed_modules();
        let notify_result = self.notify_change(mod_info, &changed);
        let notified = match notify_result {
            Ok(notified) => notified,
            Err((notified, err)) => {
                self.notify_abort(mod_info, &notified)?;
                return Err(err);
            }
        };

        let lock_coord = LockCoordinator::new(self.index, self.config);
        lock_coord.relock(mod_info, self.ds, true)?;
        self.store(mod_info, &changed)?;
        lock_coord.relock(mod_info, self.ds, false)?;
        self.notify_done(mod_info, &notified)?;

        let changed_names = changed
            .iter()
            .map(|off| self.index.name_of(*off))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(CommitOutcome {
            stage: CommitStage::DoneNotified,
            changed_modules: changed_names,
        })
    }

    fn compute_diffs(&self, mod_info: &mut ModInfo, edit: &Edit) -> StoreResult<()> {
        for req_off in mod_info.req_modules() {
            let name = self.index.name_of(req_off)?;
            let current = self.load_module_data(&name)?;
            let (new_data, diff) = apply_edit(edit, &name, &current)?;
            let changed = !diff.entries.is_empty();
            let entry = mod_info.entry_mut(req_off).unwrap();
            entry.data = Some(new_data);
            entry.diff = Some(diff);
            if changed {
                entry.state |= ModState::CHANGED;
            }
        }
        Ok(())
    }

    /// Returns, per changed module, the subscription ids that successfully
    /// observed `CHANGE`, in delivery order, so a later veto can redeliver
    /// `ABORT` in reverse. On veto, returns what was notified so far.
    fn notify_change(
        &self,
        mod_info: &ModInfo,
        changed: &[Offset],
    ) -> Result<Vec<(Offset, Vec<u64>)>, (Vec<(Offset, Vec<u64>)>, StoreError)> {
        let mut notified = Vec::new();
        for &module_off in changed {
            let name = self.index.name_of(module_off).map_err(|e| (notified.clone(), e))?;
            let diff = mod_info
                .entry(module_off)
                .and_then(|e| e.diff.clone())
                .unwrap_or_else(|| Diff::empty(name.clone()));
            let subs = subscription::list_by_priority_desc(self.index, module_off)
                .map_err(|e| (notified.clone(), e))?;

            let mut seen = Vec::new();
            for sub in subs.iter().filter(|s| s.events().contains(SubscriptionEvents::CHANGE)) {
                let Some(cb) = self.subscribers.get(&sub.id()) else {
                    continue;
                };
                match cb.on_change(&name, &diff) {
                    Ok(()) => seen.push(sub.id()),
                    Err(e) => {
                        notified.push((module_off, seen));
                        return Err((notified, e));
                    }
                }
            }
            notified.push((module_off, seen));
        }
        Ok(notified)
    }

    fn notify_abort(&self, mod_info: &ModInfo, notified: &[(Offset, Vec<u64>)]) -> StoreResult<()> {
        for (module_off, seen) in notified.iter().rev() {
            let name = self.index.name_of(*module_off)?;
            let diff = mod_info
                .entry(*module_off)
                .and_then(|e| e.diff.clone())
                .unwrap_or_else(|| Diff::empty(name.clone()));
            for sub_id in seen.iter().rev() {
                if let Some(cb) = self.subscribers.get(sub_id) {
                    cb.on_abort(&name, &diff);
                }
            }
        }
        Ok(())
    }

    fn store(&self, mod_info: &ModInfo, changed: &[Offset]) -> StoreResult<()> {
        for &module_off in changed {
            let name = self.index.name_of(module_off)?;
            if let Some(data) = mod_info.entry(module_off).and_then(|e| e.data.as_ref()) {
                self.persist_module_data(&name, data)?;
            }
        }
        Ok(())
    }

    fn notify_done(&self, mod_info: &ModInfo, notified: &[(Offset, Vec<u64>)]) -> StoreResult<()> {
        for (module_off, seen) in notified {
            let name = self.index.name_of(*module_off)?;
            let diff = mod_info
                .entry(*module_off)
                .and_then(|e| e.diff.clone())
                .unwrap_or_else(|| Diff::empty(name.clone()));
            for sub_id in seen {
                if let Some(cb) = self.subscribers.get(sub_id) {
                    cb.on_done(&name, &diff);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editdiff::EditOp;
    use crate::index::DeclaredDependency;
    use crate::segment::Segment;
    use crate::validator::ReferenceSchemaLibrary;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingSubscriber {
        events: Mutex<Vec<String>>,
        veto: bool,
    }

    impl RecordingSubscriber {
        fn new(veto: bool) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                veto,
            }
        }
    }

    impl Subscriber for RecordingSubscriber {
        fn on_change(&self, module: &str, _diff: &Diff) -> StoreResult<()> {
            self.events.lock().unwrap().push(format!("change:{module}"));
            if self.veto {
                Err(StoreError::CallbackFailed("veto".into()))
            } else {
                Ok(())
            }
        }

        fn on_done(&self, module: &str, _diff: &Diff) {
            self.events.lock().unwrap().push(format!("done:{module}"));
        }

        fn on_abort(&self, module: &str, _diff: &Diff) {
            self.events.lock().unwrap().push(format!("abort:{module}"));
        }
    }

    fn setup() -> (tempfile::TempDir, ModuleIndex, Config) {
        let dir = tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        (dir, ModuleIndex::new(seg), Config::default())
    }

    #[test]
    fn successful_commit_persists_and_notifies_done() {
        let (dir, mut idx, cfg) = setup();
        let m = idx.install("ex", &[]).unwrap();
        let sub_id = subscription::subscribe(&mut idx, m, 1, SubscriptionEvents::CHANGE | SubscriptionEvents::DONE, None).unwrap();

        let sub = Arc::new(RecordingSubscriber::new(false));
        let mut subs: HashMap<u64, Arc<dyn Subscriber>> = HashMap::new();
        subs.insert(sub_id, sub.clone());

        let schema = ReferenceSchemaLibrary::new();
        let pipeline = CommitPipeline::new(&idx, &cfg, &schema, &subs, dir.path(), Datastore::Running);

        let edit = Edit::single("ex", vec![EditOp::Set { path: "/ex:a".into(), value: json!(1) }]);
        let outcome = pipeline.commit(&edit).unwrap();
        assert_eq!(outcome.changed_modules, vec!["ex".to_string()]);

        let events = sub.events.lock().unwrap().clone();
        assert_eq!(events, vec!["change:ex".to_string(), "done:ex".to_string()]);

        let path = dir.path().join("data").join("ex.running");
        assert!(path.exists());
    }

    #[test]
    fn veto_aborts_and_redelivers_in_reverse() {
        let (dir, mut idx, cfg) = setup();
        let m = idx.install("ex", &[]).unwrap();
        let low = subscription::subscribe(&mut idx, m, 1, SubscriptionEvents::CHANGE, None).unwrap();
        let high = subscription::subscribe(&mut idx, m, 10, SubscriptionEvents::CHANGE, None).unwrap();

        let ok_sub = Arc::new(RecordingSubscriber::new(false));
        let veto_sub = Arc::new(RecordingSubscriber::new(true));
        let mut subs: HashMap<u64, Arc<dyn Subscriber>> = HashMap::new();
        subs.insert(high, ok_sub.clone());
        subs.insert(low, veto_sub.clone());

        let schema = ReferenceSchemaLibrary::new();
        let pipeline = CommitPipeline::new(&idx, &cfg, &schema, &subs, dir.path(), Datastore::Running);

        let edit = Edit::single("ex", vec![EditOp::Set { path: "/ex:a".into(), value: json!(1) }]);
        let err = pipeline.commit(&edit).unwrap_err();
        assert!(matches!(err, StoreError::CallbackFailed(_)));

        assert_eq!(*ok_sub.events.lock().unwrap(), vec!["change:ex".to_string(), "abort:ex".to_string()]);
        assert_eq!(*veto_sub.events.lock().unwrap(), vec!["change:ex".to_string()]);

        let path = dir.path().join("data").join("ex.running");
        assert!(!path.exists());
    }

    #[test]
    fn cross_module_dependency_promotes_dependent_to_changed() {
        let (dir, mut idx, cfg) = setup();
        let b = idx.install("b", &[]).unwrap();
        let _a = idx
            .install("a", &[DeclaredDependency::Direct { target: "b".into() }])
            .unwrap();

        let schema = ReferenceSchemaLibrary::new().with_induced_diff(
            "a",
            Diff {
                module: "a".into(),
                entries: vec![crate::editdiff::DiffEntry {
                    path: "/a:default_leaf".into(),
                    before: None,
                    after: Some(json!("dflt")),
                    is_default_change: true,
                }],
            },
        );

        let subs: HashMap<u64, Arc<dyn Subscriber>> = HashMap::new();
        let pipeline = CommitPipeline::new(&idx, &cfg, &schema, &subs, dir.path(), Datastore::Running);

        let edit = Edit::single("b", vec![EditOp::Set { path: "/b:x".into(), value: json!(1) }]);
        let outcome = pipeline.commit(&edit).unwrap();
        assert!(outcome.changed_modules.contains(&"a".to_string()));
        assert!(outcome.changed_modules.contains(&"b".to_string()));

        let _ = b;
    }
}
