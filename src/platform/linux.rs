//! Linux-specific backing-file and process-liveness helpers.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{StoreError, StoreResult};

/// Create (or truncate-open) the backing file for a segment at `path`,
/// sized to `size` bytes.
pub fn create_backing_file(path: &Path, size: usize) -> StoreResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    file.set_len(size as u64)?;
    Ok(file)
}

/// Open an existing backing file for attach.
pub fn open_backing_file(path: &Path) -> StoreResult<File> {
    if !path.exists() {
        return Err(StoreError::NotFound(format!(
            "segment backing file {} does not exist",
            path.display()
        )));
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(StoreError::from)
}

/// Grow (or shrink) an already-open backing file to `new_size` bytes.
pub fn resize_backing_file(file: &File, new_size: usize) -> StoreResult<()> {
    file.set_len(new_size as u64).map_err(StoreError::from)
}

/// True if a process with the given PID currently exists.
///
/// Uses `kill(pid, 0)`, which performs no signal delivery but still fails
/// with `ESRCH` if the process is gone.
pub fn is_process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
