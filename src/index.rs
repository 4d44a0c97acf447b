//! Component B: the module index.
//!
//! A singly linked catalog of installed schema modules living inside the
//! shared segment: name, dependency edges, and per-datastore lock/flag
//! pairs. Inverse edges are materialized into the *target* module's
//! dependency array at install/removal time (see `DESIGN.md`), rather than
//! discovered by a linear scan at mod-info build time.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::segment::{Offset, Segment};

/// The four datastore kinds, each with its own persisted tree and lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datastore {
    /// Holds configuration applied at next startup.
    Startup,
    /// Holds the live, applied configuration.
    Running,
    /// Holds configuration staged but not yet committed to `Running`.
    Candidate,
    /// Holds read-only operational state.
    Operational,
}

impl Datastore {
    /// All datastore kinds, in a stable order used for iteration.
    pub const ALL: [Datastore; 4] = [
        Datastore::Startup,
        Datastore::Running,
        Datastore::Candidate,
        Datastore::Operational,
    ];

    fn index(self) -> usize {
        match self {
            Datastore::Startup => 0,
            Datastore::Running => 1,
            Datastore::Candidate => 2,
            Datastore::Operational => 3,
        }
    }

    /// The filename suffix used for the persisted data file.
    pub fn file_suffix(self) -> &'static str {
        match self {
            Datastore::Startup => "startup",
            Datastore::Running => "running",
            Datastore::Candidate => "candidate",
            Datastore::Operational => "operational",
        }
    }

    /// Parse a datastore from its file suffix.
    pub fn from_file_suffix(s: &str) -> Option<Datastore> {
        Datastore::ALL.into_iter().find(|d| d.file_suffix() == s)
    }
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_suffix())
    }
}

/// Tag distinguishing the three dependency edge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DependencyTag {
    /// A direct, precomputed schema reference declared at install time.
    Direct = 0,
    /// The materialized reverse view of a [`DependencyTag::Direct`] edge.
    Inverse = 1,
    /// A data-valued instance-identifier reference, resolved at validation time.
    InstanceId = 2,
}

impl DependencyTag {
    fn from_u8(v: u8) -> StoreResult<Self> {
        match v {
            0 => Ok(DependencyTag::Direct),
            1 => Ok(DependencyTag::Inverse),
            2 => Ok(DependencyTag::InstanceId),
            other => Err(StoreError::Internal(format!("bad dependency tag {other}"))),
        }
    }
}

/// A single dependency edge stored inside the segment.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DependencyEdge {
    tag: u8,
    _pad: [u8; 7],
    target_off: u64,
    /// Offset of a NUL-terminated XPath string; 0 unless `tag == InstanceId`.
    xpath_off: u64,
}

impl DependencyEdge {
    fn new(tag: DependencyTag, target_off: Offset, xpath_off: Offset) -> Self {
        Self {
            tag: tag as u8,
            _pad: [0; 7],
            target_off,
            xpath_off,
        }
    }

    /// The edge's tag.
    pub fn tag(&self) -> StoreResult<DependencyTag> {
        DependencyTag::from_u8(self.tag)
    }

    /// Offset of the target module's record.
    pub fn target(&self) -> Offset {
        self.target_off
    }

    /// Offset of the XPath string, for instance-identifier edges.
    pub fn xpath_offset(&self) -> Option<Offset> {
        (self.xpath_off != 0).then_some(self.xpath_off)
    }
}

/// Per-datastore lock and commit-serialization state for one module.
#[repr(C)]
pub struct DatastoreControl {
    rwlock: UnsafeCell<libc::pthread_rwlock_t>,
    applying_changes: AtomicBool,
    applying_pid: AtomicU32,
}

// SAFETY: `rwlock` is PTHREAD_PROCESS_SHARED; all access goes through
// `crate::lock`, which upholds the lock's own invariants.
unsafe impl Sync for DatastoreControl {}

impl DatastoreControl {
    /// Raw pointer to the underlying `pthread_rwlock_t`, for use by
    /// [`crate::lock::LockCoordinator`].
    pub fn raw(&self) -> *mut libc::pthread_rwlock_t {
        self.rwlock.get()
    }

    /// Whether a commit is currently mid-flight on this module/datastore.
    pub fn is_applying_changes(&self) -> bool {
        self.applying_changes.load(Ordering::Acquire)
    }

    /// Set `applying_changes`, recording the owning PID for orphan diagnostics.
    pub fn set_applying_changes(&self, pid: u32) {
        self.applying_pid.store(pid, Ordering::Release);
        self.applying_changes.store(true, Ordering::Release);
    }

    /// Clear `applying_changes`. Callers must only do this if they set it
    /// (ownership is tracked process-locally by [`crate::modinfo::ModInfoEntry`]).
    pub fn clear_applying_changes(&self) {
        self.applying_changes.store(false, Ordering::Release);
        self.applying_pid.store(0, Ordering::Release);
    }

    /// PID that last set `applying_changes`, for orphan-detection logging.
    pub fn applying_pid(&self) -> Option<u32> {
        let pid = self.applying_pid.load(Ordering::Acquire);
        (pid != 0).then_some(pid)
    }
}

fn init_rwlock(rwlock: *mut libc::pthread_rwlock_t) -> StoreResult<()> {
    unsafe {
        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        if libc::pthread_rwlockattr_init(&mut attr) != 0 {
            return Err(StoreError::Internal("pthread_rwlockattr_init failed".into()));
        }
        if libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            return Err(StoreError::Internal(
                "pthread_rwlockattr_setpshared failed".into(),
            ));
        }
        if libc::pthread_rwlock_init(rwlock, &attr) != 0 {
            return Err(StoreError::Internal("pthread_rwlock_init failed".into()));
        }
        libc::pthread_rwlockattr_destroy(&mut attr);
    }
    Ok(())
}

/// A fixed-layout catalog entry for one installed module.
#[repr(C)]
pub struct ModuleRecord {
    name_off: u64,
    deps_off: u64,
    deps_len: u64,
    deps_cap: u64,
    next_off: u64,
    sub_off: AtomicU64,
    sub_len: AtomicU64,
    next_sub_id: AtomicU64,
    tombstoned: AtomicBool,
    ds_control: [DatastoreControl; 4],
}

impl ModuleRecord {
    /// Offset of the module's NUL-terminated name.
    pub fn name_offset(&self) -> Offset {
        self.name_off
    }

    /// Offset of the dependency edge array.
    pub fn deps_offset(&self) -> Offset {
        self.deps_off
    }

    /// Number of live entries in the dependency edge array.
    pub fn deps_len(&self) -> u64 {
        self.deps_len
    }

    /// Offset of the next module record in the index, if any.
    pub fn next_offset(&self) -> Option<Offset> {
        (self.next_off != 0).then_some(self.next_off)
    }

    /// True once this module has been removed (record kept as a tombstone
    /// so offsets referencing it remain valid to detect staleness).
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }

    /// The per-datastore lock/flag control block.
    pub fn datastore(&self, ds: Datastore) -> &DatastoreControl {
        &self.ds_control[ds.index()]
    }

    /// Offset and element count of the subscription table, if any.
    pub fn subscriptions(&self) -> (Offset, u64) {
        (self.sub_off.load(Ordering::Acquire), self.sub_len.load(Ordering::Acquire))
    }

    /// Atomically replace the subscription table's offset and length, after
    /// a relocating add or an in-place swap-remove.
    pub fn set_subscriptions(&self, offset: Offset, len: u64) {
        self.sub_off.store(offset, Ordering::Release);
        self.sub_len.store(len, Ordering::Release);
    }

    /// Allocate the next subscription id for this module, unique for the
    /// lifetime of the module record (ids are never reused).
    pub fn alloc_sub_id(&self) -> u64 {
        self.next_sub_id.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A dependency declared at install time: a target module name and, for
/// instance-identifier references, the XPath of the referencing leaf.
#[derive(Debug, Clone)]
pub enum DeclaredDependency {
    /// A direct schema reference (leafref, augment, import) to `target`.
    Direct {
        /// Name of the target module.
        target: String,
    },
    /// An instance-identifier leaf whose runtime value may reference any module.
    InstanceId {
        /// XPath of the referencing leaf.
        xpath: String,
        /// Module assumed referenced when the leaf has no data yet (the
        /// schema's declared default target, if any). See `DESIGN.md` for
        /// the open-question resolution this implements.
        default_target: Option<String>,
    },
}

/// Catalog of installed modules, stored inside a [`Segment`].
pub struct ModuleIndex {
    segment: Segment,
}

impl ModuleIndex {
    /// Wrap an already-attached segment.
    pub fn new(segment: Segment) -> Self {
        Self { segment }
    }

    /// Borrow the underlying segment.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Mutably borrow the underlying segment.
    pub fn segment_mut(&mut self) -> &mut Segment {
        &mut self.segment
    }

    /// Iterate live (non-tombstoned) module record offsets in list order.
    pub fn iter(&self) -> StoreResult<Vec<Offset>> {
        let mut out = Vec::new();
        let mut cur = self.segment.module_list_head();
        while let Some(off) = cur {
            let rec: &ModuleRecord = self.segment.get(off)?;
            if !rec.is_tombstoned() {
                out.push(off);
            }
            cur = rec.next_offset();
        }
        Ok(out)
    }

    /// Look up a module's record offset by name.
    pub fn lookup_by_name(&self, name: &str) -> StoreResult<Option<Offset>> {
        for off in self.iter()? {
            let rec: &ModuleRecord = self.segment.get(off)?;
            if self.segment.read_cstr(rec.name_offset())? == name {
                return Ok(Some(off));
            }
        }
        Ok(None)
    }

    /// Install a new module. Fails with `invalid_argument` if the name is
    /// already installed, or `not_found` if a direct dependency target
    /// does not yet exist.
    pub fn install(&mut self, name: &str, deps: &[DeclaredDependency]) -> StoreResult<Offset> {
        if self.lookup_by_name(name)?.is_some() {
            return Err(StoreError::InvalidArgument(format!(
                "module '{name}' already installed"
            )));
        }

        let mut direct_targets = Vec::new();
        let mut edges = Vec::new();
        for dep in deps {
            match dep {
                DeclaredDependency::Direct { target } => {
                    let target_off = self.lookup_by_name(target)?.ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "dependency target module '{target}' not installed"
                        ))
                    })?;
                    direct_targets.push(target_off);
                    edges.push(DependencyEdge::new(DependencyTag::Direct, target_off, 0));
                }
                DeclaredDependency::InstanceId { xpath, default_target } => {
                    let xpath_off = self.segment.alloc_cstr(xpath)?;
                    let default_off = match default_target {
                        Some(name) => self.lookup_by_name(name)?.ok_or_else(|| {
                            StoreError::NotFound(format!(
                                "instance-identifier default target module '{name}' not installed"
                            ))
                        })?,
                        None => 0,
                    };
                    edges.push(DependencyEdge::new(DependencyTag::InstanceId, default_off, xpath_off));
                }
            }
        }

        let name_off = self.segment.alloc_cstr(name)?;
        let deps_off = if edges.is_empty() {
            0
        } else {
            self.segment.alloc_array(&edges)?
        };

        let record = ModuleRecord {
            name_off,
            deps_off,
            deps_len: edges.len() as u64,
            deps_cap: edges.len() as u64,
            next_off: self.segment.module_list_head().unwrap_or(0),
            sub_off: AtomicU64::new(0),
            sub_len: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(0),
            tombstoned: AtomicBool::new(false),
            ds_control: [(); 4].map(|_| DatastoreControl {
                rwlock: UnsafeCell::new(unsafe { std::mem::zeroed() }),
                applying_changes: AtomicBool::new(false),
                applying_pid: AtomicU32::new(0),
            }),
        };
        let rec_off = self.segment.alloc_value(record)?;

        {
            let rec: &ModuleRecord = self.segment.get(rec_off)?;
            for ds in Datastore::ALL {
                init_rwlock(rec.datastore(ds).raw())?;
            }
        }

        self.segment.set_module_list_head(rec_off);

        for target_off in direct_targets {
            self.append_inverse_edge(target_off, rec_off)?;
        }

        tracing::info!(module = name, offset = rec_off, "module installed");
        Ok(rec_off)
    }

    /// Materialize an inverse edge on `target_off` pointing back at `source_off`.
    ///
    /// Relocates the target's dependency array to the segment tail, mirroring
    /// the subscription table's append-by-relocation strategy, since the
    /// bump allocator never frees in place.
    fn append_inverse_edge(&mut self, target_off: Offset, source_off: Offset) -> StoreResult<()> {
        let (old_off, old_len) = {
            let rec: &ModuleRecord = self.segment.get(target_off)?;
            (rec.deps_off, rec.deps_len)
        };
        let mut edges: Vec<DependencyEdge> = if old_len == 0 {
            Vec::new()
        } else {
            self.segment.get_array::<DependencyEdge>(old_off, old_len)?.to_vec()
        };
        edges.push(DependencyEdge::new(DependencyTag::Inverse, source_off, 0));
        let new_off = self.segment.alloc_array(&edges)?;
        let rec: &mut ModuleRecord = self.segment.get_mut(target_off)?;
        rec.deps_off = new_off;
        rec.deps_len = edges.len() as u64;
        rec.deps_cap = edges.len() as u64;
        Ok(())
    }

    /// Remove every materialized inverse edge on `target_off` that points
    /// at `source_off`.
    fn remove_inverse_edges(&mut self, target_off: Offset, source_off: Offset) -> StoreResult<()> {
        let (old_off, old_len) = {
            let rec: &ModuleRecord = self.segment.get(target_off)?;
            (rec.deps_off, rec.deps_len)
        };
        if old_len == 0 {
            return Ok(());
        }
        let edges: Vec<DependencyEdge> = self.segment.get_array::<DependencyEdge>(old_off, old_len)?.to_vec();
        let filtered: Vec<DependencyEdge> = edges
            .into_iter()
            .filter(|e| !(matches!(e.tag(), Ok(DependencyTag::Inverse)) && e.target() == source_off))
            .collect();
        if filtered.len() as u64 == old_len {
            return Ok(());
        }
        let new_off = if filtered.is_empty() {
            0
        } else {
            self.segment.alloc_array(&filtered)?
        };
        let rec: &mut ModuleRecord = self.segment.get_mut(target_off)?;
        rec.deps_off = new_off;
        rec.deps_len = filtered.len() as u64;
        rec.deps_cap = filtered.len() as u64;
        Ok(())
    }

    /// List the direct-dependency target offsets declared by `module_off`.
    pub fn direct_targets(&self, module_off: Offset) -> StoreResult<Vec<Offset>> {
        let rec: &ModuleRecord = self.segment.get(module_off)?;
        if rec.deps_len == 0 {
            return Ok(Vec::new());
        }
        let edges = self.segment.get_array::<DependencyEdge>(rec.deps_off, rec.deps_len)?;
        Ok(edges
            .iter()
            .filter(|e| matches!(e.tag(), Ok(DependencyTag::Direct)))
            .map(|e| e.target())
            .collect())
    }

    /// List the modules that `module_off` inversely depends on (modules that
    /// directly depend on it).
    pub fn inverse_dependents(&self, module_off: Offset) -> StoreResult<Vec<Offset>> {
        let rec: &ModuleRecord = self.segment.get(module_off)?;
        if rec.deps_len == 0 {
            return Ok(Vec::new());
        }
        let edges = self.segment.get_array::<DependencyEdge>(rec.deps_off, rec.deps_len)?;
        Ok(edges
            .iter()
            .filter(|e| matches!(e.tag(), Ok(DependencyTag::Inverse)))
            .map(|e| e.target())
            .collect())
    }

    /// List the instance-identifier edges declared on `module_off`: the
    /// referencing XPath and, if declared, the module assumed referenced
    /// when that leaf has no data yet.
    pub fn instance_id_edges(&self, module_off: Offset) -> StoreResult<Vec<(String, Option<Offset>)>> {
        let rec: &ModuleRecord = self.segment.get(module_off)?;
        if rec.deps_len == 0 {
            return Ok(Vec::new());
        }
        let edges = self.segment.get_array::<DependencyEdge>(rec.deps_off, rec.deps_len)?.to_vec();
        let mut out = Vec::new();
        for e in edges {
            if matches!(e.tag(), Ok(DependencyTag::InstanceId)) {
                if let Some(xo) = e.xpath_offset() {
                    let default_target = (e.target() != 0).then_some(e.target());
                    out.push((self.segment.read_cstr(xo)?, default_target));
                }
            }
        }
        Ok(out)
    }

    /// Module name at `module_off`.
    pub fn name_of(&self, module_off: Offset) -> StoreResult<String> {
        let rec: &ModuleRecord = self.segment.get(module_off)?;
        self.segment.read_cstr(rec.name_offset())
    }

    /// Remove a module. Fails with `in_use` if another live module still
    /// directly depends on it.
    pub fn remove(&mut self, name: &str) -> StoreResult<()> {
        let off = self
            .lookup_by_name(name)?
            .ok_or_else(|| StoreError::NotFound(format!("module '{name}' not installed")))?;

        for other in self.iter()? {
            if other == off {
                continue;
            }
            if self.direct_targets(other)?.contains(&off) {
                let other_name = self.name_of(other)?;
                return Err(StoreError::InUse(format!(
                    "module '{other_name}' still depends on '{name}'"
                )));
            }
        }

        let direct_targets = self.direct_targets(off)?;
        for target_off in direct_targets {
            self.remove_inverse_edges(target_off, off)?;
        }

        let rec: &ModuleRecord = self.segment.get(off)?;
        rec.tombstoned.store(true, Ordering::Release);
        tracing::info!(module = name, offset = off, "module removed");
        Ok(())
    }
}
