//! Component D: the lock coordinator.
//!
//! Acquires per-module, per-datastore locks in canonical (ascending
//! module-offset) order with absolute deadlines, and implements the
//! commit-time "applying changes" hand-off: a committer briefly holds the
//! write lock just long enough to publish that a commit is in flight, then
//! downgrades to a read lock so concurrent readers are not blocked for the
//! whole commit.
//!
//! Grounded directly on the locking discipline of the C source this system
//! is derived from, which itself uses `pthread_rwlock_timedwrlock` /
//! `timedrdlock` for exactly this purpose.

use std::time::Duration;

// The version of the `libc` crate vendored in this workspace does not bind
// these glibc-only timed rwlock functions for linux-gnu, even though glibc
// exports them. Declare them directly so the calls below link correctly.
unsafe extern "C" {
    fn pthread_rwlock_timedrdlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
    fn pthread_rwlock_timedwrlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::index::{Datastore, ModuleIndex};
use crate::modinfo::{ModInfo, ModState};
use crate::segment::Offset;

/// Read or write intent for a lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    module_off: Offset,
    mode: LockMode,
}

fn abs_deadline(timeout: Duration) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    let mut sec = ts.tv_sec + timeout.as_secs() as i64;
    let mut nsec = ts.tv_nsec + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

fn timed_lock(raw: *mut libc::pthread_rwlock_t, mode: LockMode, timeout: Duration) -> StoreResult<()> {
    let deadline = abs_deadline(timeout);
    let rc = unsafe {
        match mode {
            LockMode::Read => pthread_rwlock_timedrdlock(raw, &deadline),
            LockMode::Write => pthread_rwlock_timedwrlock(raw, &deadline),
        }
    };
    match rc {
        0 => Ok(()),
        libc::ETIMEDOUT => Err(StoreError::TimedOut(format!(
            "module lock ({mode:?}) not acquired within deadline"
        ))),
        other => Err(StoreError::Internal(format!(
            "pthread_rwlock_timed{}lock failed: {other}",
            if mode == LockMode::Read { "rd" } else { "wr" }
        ))),
    }
}

fn unlock_raw(raw: *mut libc::pthread_rwlock_t) {
    unsafe {
        libc::pthread_rwlock_unlock(raw);
    }
}

/// Acquires and releases canonical-order locks across a mod-info.
pub struct LockCoordinator<'a> {
    index: &'a ModuleIndex,
    config: &'a Config,
}

impl<'a> LockCoordinator<'a> {
    /// Build a coordinator over `index`, using `config` for timeouts and
    /// the `applying_changes` contention retry budget.
    pub fn new(index: &'a ModuleIndex, config: &'a Config) -> Self {
        Self { index, config }
    }

    /// Lock every module in `mod_info`'s canonical order on `ds`.
    ///
    /// `mode` is the baseline intent for DEP/INV_DEP modules; REQ modules
    /// are write-locked whenever `mode == Write` or `applying` is set.
    /// When `applying` is set and a REQ module's write lock is obtained,
    /// this sets that module's `applying_changes` flag and downgrades to a
    /// read lock before moving on, per the commit hand-off protocol.
    pub fn lock_all(
        &self,
        mod_info: &mut ModInfo,
        ds: Datastore,
        mode: LockMode,
        applying: bool,
    ) -> StoreResult<()> {
        let mut held: Vec<HeldLock> = Vec::new();
        let pid = std::process::id();

        for entry in mod_info.entries.iter_mut() {
            let want_write = (mode == LockMode::Write || applying) && entry.state.contains(ModState::REQ);
            let initial_mode = if want_write { LockMode::Write } else { LockMode::Read };

            let control = {
                let rec = match self.index.segment().get::<crate::index::ModuleRecord>(entry.module_off) {
                    Ok(r) => r,
                    Err(e) => {
                        self.rollback(&held, ds);
                        return Err(e);
                    }
                };
                rec.datastore(ds)
            };

            let mut steps_left = self.config.commit_step_count;
            loop {
                if let Err(e) = timed_lock(control.raw(), initial_mode, self.config.module_lock_timeout()) {
                    self.rollback(&held, ds);
                    return Err(e);
                }

                if applying && want_write && control.is_applying_changes() {
                    tracing::warn!(
                        module_offset = entry.module_off,
                        owner_pid = control.applying_pid(),
                        "module busy applying changes, backing off"
                    );
                    unlock_raw(control.raw());
                    if steps_left == 0 {
                        if let Some(owner_pid) = control.applying_pid() {
                            if !crate::platform::is_process_alive(owner_pid) {
                                tracing::warn!(
                                    module_offset = entry.module_off,
                                    owner_pid,
                                    "applying_changes owner appears dead; manual intervention may be required \
                                     (this engine never force-clears another transaction's lock)"
                                );
                            }
                        }
                        self.rollback(&held, ds);
                        return Err(StoreError::TimedOut(
                            "exhausted applying_changes contention retries".into(),
                        ));
                    }
                    steps_left -= 1;
                    std::thread::sleep(self.config.commit_step_sleep());
                    continue;
                }
                break;
            }

            if applying && want_write {
                control.set_applying_changes(pid);
                unlock_raw(control.raw());
                if let Err(e) = timed_lock(control.raw(), LockMode::Read, self.config.module_lock_timeout()) {
                    control.clear_applying_changes();
                    self.rollback(&held, ds);
                    return Err(e);
                }
                entry.owns_applying_changes = true;
                held.push(HeldLock {
                    module_off: entry.module_off,
                    mode: LockMode::Read,
                });
            } else {
                held.push(HeldLock {
                    module_off: entry.module_off,
                    mode: initial_mode,
                });
            }

            entry.state |= ModState::LOCK;
            tracing::trace!(module_offset = entry.module_off, mode = ?initial_mode, "module locked");
        }

        Ok(())
    }

    /// Release every held lock, clearing `applying_changes` on modules this
    /// transaction set it on.
    pub fn unlock_all(&self, mod_info: &mut ModInfo, ds: Datastore) -> StoreResult<()> {
        for entry in mod_info.entries.iter_mut() {
            if !entry.state.contains(ModState::LOCK) {
                continue;
            }
            let rec = self.index.segment().get::<crate::index::ModuleRecord>(entry.module_off)?;
            let control = rec.datastore(ds);
            if entry.owns_applying_changes {
                if !control.is_applying_changes() {
                    tracing::error!(
                        module_offset = entry.module_off,
                        "internal: applying_changes was not set by the owning transaction"
                    );
                }
                control.clear_applying_changes();
                entry.owns_applying_changes = false;
            }
            unlock_raw(control.raw());
            entry.state.remove(ModState::LOCK);
        }
        Ok(())
    }

    /// Replace the held lock with `upgrade`'s mode on every REQ|LOCK entry,
    /// while `applying_changes` remains set so no other commit can race in.
    pub fn relock(&self, mod_info: &mut ModInfo, ds: Datastore, upgrade: bool) -> StoreResult<()> {
        let target_mode = if upgrade { LockMode::Write } else { LockMode::Read };
        for entry in mod_info.entries.iter_mut() {
            if !(entry.state.contains(ModState::REQ) && entry.state.contains(ModState::LOCK)) {
                continue;
            }
            let rec = self.index.segment().get::<crate::index::ModuleRecord>(entry.module_off)?;
            let control = rec.datastore(ds);
            if !control.is_applying_changes() {
                return Err(StoreError::Internal(
                    "relock called without applying_changes set".into(),
                ));
            }
            unlock_raw(control.raw());
            timed_lock(control.raw(), target_mode, self.config.module_lock_timeout())?;
            tracing::trace!(module_offset = entry.module_off, mode = ?target_mode, "module relocked");
        }
        Ok(())
    }

    fn rollback(&self, held: &[HeldLock], ds: Datastore) {
        for h in held.iter().rev() {
            if let Ok(rec) = self.index.segment().get::<crate::index::ModuleRecord>(h.module_off) {
                let control = rec.datastore(ds);
                if control.applying_pid() == Some(std::process::id()) {
                    control.clear_applying_changes();
                }
                unlock_raw(control.raw());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modinfo::ModInfoBuilder;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ModuleIndex, Config) {
        let dir = tempdir().unwrap();
        let seg = crate::segment::Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        (dir, ModuleIndex::new(seg), Config::default())
    }

    #[test]
    fn lock_then_unlock_single_module() {
        let (_dir, mut idx, cfg) = setup();
        let off = idx.install("ex", &[]).unwrap();
        let mut mi = ModInfoBuilder::from_primaries_pub(&idx, &[off]).unwrap();
        let coord = LockCoordinator::new(&idx, &cfg);
        coord
            .lock_all(&mut mi, Datastore::Running, LockMode::Write, true)
            .unwrap();
        assert!(mi.entry(off).unwrap().owns_applying_changes);
        coord.unlock_all(&mut mi, Datastore::Running).unwrap();
        assert!(!mi.entry(off).unwrap().owns_applying_changes);
        assert!(!mi.entry(off).unwrap().state.contains(ModState::LOCK));
    }

    #[test]
    fn relock_upgrades_after_applying_changes_set() {
        let (_dir, mut idx, cfg) = setup();
        let off = idx.install("ex", &[]).unwrap();
        let mut mi = ModInfoBuilder::from_primaries_pub(&idx, &[off]).unwrap();
        let coord = LockCoordinator::new(&idx, &cfg);
        coord
            .lock_all(&mut mi, Datastore::Running, LockMode::Write, true)
            .unwrap();
        coord.relock(&mut mi, Datastore::Running, true).unwrap();
        coord.relock(&mut mi, Datastore::Running, false).unwrap();
        coord.unlock_all(&mut mi, Datastore::Running).unwrap();
    }

    #[test]
    fn concurrent_write_lock_times_out() {
        let (_dir, mut idx, mut cfg) = setup();
        cfg.module_lock_timeout_ms = 50;
        let off = idx.install("ex", &[]).unwrap();
        let mut mi1 = ModInfoBuilder::from_primaries_pub(&idx, &[off]).unwrap();
        let mut mi2 = ModInfoBuilder::from_primaries_pub(&idx, &[off]).unwrap();
        let coord = LockCoordinator::new(&idx, &cfg);
        coord
            .lock_all(&mut mi1, Datastore::Running, LockMode::Write, false)
            .unwrap();
        let res = coord.lock_all(&mut mi2, Datastore::Running, LockMode::Write, false);
        assert!(matches!(res, Err(StoreError::TimedOut(_))));
        coord.unlock_all(&mut mi1, Datastore::Running).unwrap();
    }
}
