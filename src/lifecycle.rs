//! Component I: engine lifecycle and bootstrap (ambient).
//!
//! Owns the attach-or-create decision for a repo root's shared segment and,
//! on a fresh create, rebuilds the module index by scanning the persisted
//! data directory rather than requiring a prior index to have survived.
//! Orphan detection on lock contention is implemented in [`crate::lock`];
//! this module only owns naming, attach/create, and teardown.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::index::{Datastore, ModuleIndex};
use crate::segment::Segment;

fn segment_name(repo_root: &Path) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    repo_root.hash(&mut hasher);
    format!("modstore-{:016x}.shm", hasher.finish())
}

fn shared_segment_path(repo_root: &Path) -> PathBuf {
    PathBuf::from("/dev/shm").join(segment_name(repo_root))
}

/// An attached engine: the shared segment's module index plus the
/// configuration and repo root used to persist module data.
pub struct Engine {
    index: ModuleIndex,
    config: Config,
    repo_root: PathBuf,
    segment_path: PathBuf,
}

impl Engine {
    /// Attach to the segment for `repo_root` if it already exists and
    /// validates, otherwise create a fresh one and rebuild the module index
    /// from `{repo_root}/data`.
    pub fn attach_or_create(repo_root: impl AsRef<Path>) -> StoreResult<Self> {
        let repo_root = repo_root.as_ref();
        let repo_root = if repo_root.is_absolute() {
            repo_root.to_path_buf()
        } else {
            std::env::current_dir()?.join(repo_root)
        };
        std::fs::create_dir_all(&repo_root)?;

        let config = Config::load_layered(&repo_root.join("modstore.toml"))
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let segment_path = shared_segment_path(&repo_root);
        let (index, freshly_created) = if segment_path.exists() {
            match Segment::attach(&segment_path, config.segment_growth) {
                Ok(seg) => (ModuleIndex::new(seg), false),
                Err(e) => {
                    tracing::warn!(
                        path = %segment_path.display(),
                        error = %e,
                        "existing segment failed to attach, recreating"
                    );
                    std::fs::remove_file(&segment_path)?;
                    let seg = Segment::create(&segment_path, config.initial_segment_size, config.segment_growth)?;
                    (ModuleIndex::new(seg), true)
                }
            }
        } else {
            let seg = Segment::create(&segment_path, config.initial_segment_size, config.segment_growth)?;
            (ModuleIndex::new(seg), true)
        };

        let mut engine = Self {
            index,
            config,
            repo_root,
            segment_path,
        };

        if freshly_created {
            engine.bootstrap_from_data_dir()?;
        }

        tracing::info!(
            repo_root = %engine.repo_root.display(),
            segment = %engine.segment_path.display(),
            freshly_created,
            "engine attached"
        );
        Ok(engine)
    }

    /// Rebuild the module catalog from whatever data files are on disk.
    /// Dependency edges are not recovered this way: modules reinstalled
    /// after a restart must redeclare their dependencies (see `DESIGN.md`).
    fn bootstrap_from_data_dir(&mut self) -> StoreResult<()> {
        let data_dir = self.repo_root.join("data");
        if !data_dir.exists() {
            return Ok(());
        }
        let mut names: BTreeSet<String> = BTreeSet::new();
        for entry in std::fs::read_dir(&data_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
                continue;
            };
            if Datastore::from_file_suffix(ext).is_some() {
                names.insert(stem.to_string());
            }
        }
        for name in &names {
            self.index.install(name, &[])?;
        }
        if !names.is_empty() {
            tracing::info!(count = names.len(), "module catalog rebuilt from data directory");
        }
        Ok(())
    }

    /// The module index backing this engine.
    pub fn index(&self) -> &ModuleIndex {
        &self.index
    }

    /// Mutable access to the module index, for install/remove/subscribe.
    pub fn index_mut(&mut self) -> &mut ModuleIndex {
        &mut self.index
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The repo root this engine persists module data under.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Unmap the segment, optionally removing its backing file. Callers on
    /// a host with other attached processes should pass `false`.
    pub fn detach(self, remove_backing_file: bool) -> StoreResult<()> {
        let path = self.segment_path.clone();
        drop(self);
        if remove_backing_file && path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editdiff::DataTree;
    use tempfile::tempdir;

    #[test]
    fn create_then_attach_reuses_segment() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::attach_or_create(dir.path()).unwrap();
        engine.index_mut().install("ex", &[]).unwrap();
        let seg_path = engine.segment_path.clone();
        drop(engine);

        let engine2 = Engine::attach_or_create(dir.path()).unwrap();
        assert!(engine2.index().lookup_by_name("ex").unwrap().is_some());
        assert_eq!(engine2.segment_path, seg_path);
        engine2.detach(true).unwrap();
        assert!(!seg_path.exists());
    }

    #[test]
    fn bootstrap_rebuilds_catalog_from_data_dir() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("ex.running"), DataTree::new().to_bytes().unwrap()).unwrap();
        std::fs::write(data_dir.join("ex.startup"), DataTree::new().to_bytes().unwrap()).unwrap();
        std::fs::write(data_dir.join("other.running"), DataTree::new().to_bytes().unwrap()).unwrap();

        let engine = Engine::attach_or_create(dir.path()).unwrap();
        assert!(engine.index().lookup_by_name("ex").unwrap().is_some());
        assert!(engine.index().lookup_by_name("other").unwrap().is_some());
        engine.detach(true).unwrap();
    }

    #[test]
    fn different_repo_roots_get_distinct_segment_names() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        assert_ne!(segment_name(dir_a.path()), segment_name(dir_b.path()));
    }
}
