//! External interface: the session surface consumed by the commit pipeline.
//!
//! A session stages one edit at a time against a target datastore and
//! tracks which commit-pipeline event it is currently in. The core reads
//! and writes exactly these fields during a commit; it has no other access
//! to whatever a caller layers on top of a session.

use crate::commit::{CommitOutcome, CommitPipeline};
use crate::editdiff::{Diff, Edit};
use crate::error::{StoreError, StoreResult};
use crate::index::Datastore;

/// Where a session is within one commit's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// No commit in flight on this session.
    None,
    /// An edit is staged but not yet committed.
    Update,
    /// The commit pipeline is delivering `CHANGE` to subscribers.
    Change,
    /// The commit completed and `DONE` was delivered.
    Done,
    /// A subscriber vetoed and `ABORT` was delivered.
    Abort,
}

/// A client's working edit against one datastore.
///
/// Holds exactly the external state a commit needs: the current event
/// kind, the pending edit, the pending diff, and the target datastore.
/// Nothing else of a caller's session state is visible to, or touched by,
/// the commit pipeline.
pub struct Session {
    datastore: Datastore,
    event_kind: EventKind,
    pending_edit: Option<Edit>,
    pending_diff: Option<Diff>,
}

impl Session {
    /// Open a session targeting `datastore` with no edit staged.
    pub fn new(datastore: Datastore) -> Self {
        Self {
            datastore,
            event_kind: EventKind::None,
            pending_edit: None,
            pending_diff: None,
        }
    }

    /// Target datastore for this session's commits.
    pub fn datastore(&self) -> Datastore {
        self.datastore
    }

    /// The session's current point in the commit lifecycle.
    pub fn event_kind(&self) -> EventKind {
        self.event_kind
    }

    /// The staged edit, if any.
    pub fn pending_edit(&self) -> Option<&Edit> {
        self.pending_edit.as_ref()
    }

    /// The diff from the most recently attempted commit, if any.
    pub fn pending_diff(&self) -> Option<&Diff> {
        self.pending_diff.as_ref()
    }

    /// Stage `edit`, replacing whatever was previously pending.
    pub fn stage(&mut self, edit: Edit) {
        self.pending_edit = Some(edit);
        self.pending_diff = None;
        self.event_kind = EventKind::Update;
    }

    /// Drive the staged edit through `pipeline`'s commit state machine,
    /// updating this session's event kind to reflect the outcome.
    ///
    /// `pipeline` must target this session's datastore; the caller is
    /// responsible for building it against the matching `Datastore`.
    pub fn commit(&mut self, pipeline: &CommitPipeline<'_>) -> StoreResult<CommitOutcome> {
        let edit = self
            .pending_edit
            .take()
            .ok_or_else(|| StoreError::InvalidArgument("no edit staged for commit".into()))?;

        self.event_kind = EventKind::Change;
        match pipeline.commit(&edit) {
            Ok(outcome) => {
                self.event_kind = EventKind::Done;
                Ok(outcome)
            }
            Err(e) => {
                self.event_kind = if e.triggers_abort() {
                    EventKind::Abort
                } else {
                    EventKind::None
                };
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editdiff::EditOp;
    use crate::index::ModuleIndex;
    use crate::segment::Segment;
    use crate::subscription::{self, SubscriptionEvents};
    use crate::validator::ReferenceSchemaLibrary;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct VetoSubscriber;
    impl crate::commit::Subscriber for VetoSubscriber {
        fn on_change(&self, _module: &str, _diff: &Diff) -> StoreResult<()> {
            Err(StoreError::CallbackFailed("no".into()))
        }
    }

    #[test]
    fn stage_then_commit_reaches_done() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        let mut idx = ModuleIndex::new(seg);
        idx.install("ex", &[]).unwrap();

        let cfg = crate::config::Config::default();
        let schema = ReferenceSchemaLibrary::new();
        let subs: HashMap<u64, Arc<dyn crate::commit::Subscriber>> = HashMap::new();
        let pipeline = CommitPipeline::new(&idx, &cfg, &schema, &subs, dir.path(), Datastore::Running);

        let mut session = Session::new(Datastore::Running);
        assert_eq!(session.event_kind(), EventKind::None);
        session.stage(Edit::single("ex", vec![EditOp::Set { path: "/ex:a".into(), value: json!(1) }]));
        assert_eq!(session.event_kind(), EventKind::Update);

        session.commit(&pipeline).unwrap();
        assert_eq!(session.event_kind(), EventKind::Done);
        assert!(session.pending_edit().is_none());
    }

    #[test]
    fn commit_without_staged_edit_fails() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        let idx = ModuleIndex::new(seg);
        let cfg = crate::config::Config::default();
        let schema = ReferenceSchemaLibrary::new();
        let subs: HashMap<u64, Arc<dyn crate::commit::Subscriber>> = HashMap::new();
        let pipeline = CommitPipeline::new(&idx, &cfg, &schema, &subs, dir.path(), Datastore::Running);

        let mut session = Session::new(Datastore::Running);
        assert!(matches!(session.commit(&pipeline), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn veto_moves_session_to_abort() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(&dir.path().join("seg.bin"), 4096, 4096).unwrap();
        let mut idx = ModuleIndex::new(seg);
        let m = idx.install("ex", &[]).unwrap();
        let sub_id = subscription::subscribe(&mut idx, m, 1, SubscriptionEvents::CHANGE, None).unwrap();

        let cfg = crate::config::Config::default();
        let schema = ReferenceSchemaLibrary::new();
        let mut subs: HashMap<u64, Arc<dyn crate::commit::Subscriber>> = HashMap::new();
        subs.insert(sub_id, Arc::new(VetoSubscriber));
        let pipeline = CommitPipeline::new(&idx, &cfg, &schema, &subs, dir.path(), Datastore::Running);

        let mut session = Session::new(Datastore::Running);
        session.stage(Edit::single("ex", vec![EditOp::Set { path: "/ex:a".into(), value: json!(1) }]));
        assert!(session.commit(&pipeline).is_err());
        assert_eq!(session.event_kind(), EventKind::Abort);
    }
}
