//! # Module Store
//!
//! A shared-memory configuration and state datastore engine, inspired by
//! NETCONF/YANG-style management systems: modules are installed into a
//! shared catalog, transactions edit one or more modules' data under a
//! two-phase commit pipeline, and subscribers are notified of changes
//! before and after they are durably stored.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │   Session    │   │  Shared Segment  │   │  Subscriber  │
//! │              │   │                  │   │              │
//! │ edit/commit  ├──►│ ModuleIndex      │◄──┤ notify_*     │
//! │              │   │ DependencyEdges  │   │              │
//! └──────────────┘   │ per-module locks │   └──────────────┘
//!                     └──────────────────┘
//!                             │
//!                     ┌──────────────────┐
//!                     │  Commit Pipeline │
//!                     │ lock→diff→validate│
//!                     │ →notify→store     │
//!                     └──────────────────┘
//! ```
//!
//! The shared segment is a single growable `mmap`: every cross-process
//! reference into it is a byte offset rather than a pointer, so remapping
//! the segment (to grow it) never invalidates anything held across the
//! remap: the borrow checker enforces this directly, since
//! [`segment::Segment::remap`] takes `&mut self` and typed accessors borrow
//! only for the scope of a single dereference.
//!
//! ## Concurrency
//!
//! Per-module, per-datastore locking uses `pthread_rwlock_t` with
//! `PTHREAD_PROCESS_SHARED`, acquired in canonical (ascending record-offset)
//! order to avoid deadlock across concurrent commits. See [`lock`] for the
//! acquisition/hand-off protocol and [`modinfo`] for how the lock set is
//! computed from a module's schema dependency closure.
//!
//! ## Platform support
//!
//! Linux only, via `memmap2` and the POSIX `pthread_rwlock`/`pthread_mutex`
//! process-shared primitives exposed through `libc`.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod commit;
pub mod config;
pub mod consts;
pub mod editdiff;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod lock;
pub mod modinfo;
pub mod platform;
pub mod segment;
pub mod session;
pub mod subscription;
pub mod validator;

pub use commit::{CommitPipeline, CommitStage, Subscriber};
pub use config::Config;
pub use editdiff::{DataTree, Diff, DiffEntry, Edit, EditOp};
pub use error::{StoreError, StoreResult, ValidationIssue};
pub use index::{DeclaredDependency, Datastore, ModuleIndex};
pub use lifecycle::Engine;
pub use lock::{LockCoordinator, LockMode};
pub use modinfo::{ModInfo, ModState};
pub use segment::Segment;
pub use session::{EventKind, Session};
pub use validator::{LeafrefRule, ReferenceSchemaLibrary, SchemaLibrary, Validator};

/// Initialize structured logging for the engine and its embedding process.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
