//! Revision metadata.
//!
//! The persistent description of every database revision lives below a
//! single [`RootFolder`]:
//!
//! ```text
//! ROOT/lockfolder/lock                     global lock (commits, session begin)
//! ROOT/revisions/<n>                       RevisionFolder
//! ROOT/revisions/<n>/commitMarker          CommitMarker, present iff committed
//! ROOT/revisions/<n>/journal               RevisionJournal
//! ROOT/revisions/<n>/sessions/<sid>        SessionPin, one per pinning session
//! ROOT/revisions/<n>/lockfolder/lock       per-revision lock
//! ROOT/deletions/<n>                       DeletionMark, cleanup in progress
//! ```
//!
//! # Invariants
//!
//! - A revision is committed iff its commit marker exists.
//! - Final commit numbers are assigned in commit order: 0 for the initial
//!   revision, then `max + 1` under the root lock.
//! - A revision is active iff at least one session pin exists below it.
//! - A revision with a deletion mark is invisible to new sessions.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::entity::{Entity, EntitySession, Folder};
use crate::storage::io::StorageError;
use crate::storage::lock::LockFolder;
use crate::storage::object::{EntityStorage, Lifecycle, Storable};
use crate::types::Identifier;

const REVISIONS_NAME: &str = "revisions";
const DELETIONS_NAME: &str = "deletions";
const SESSIONS_NAME: &str = "sessions";
const COMMIT_MARKER_NAME: &str = "commitMarker";
const JOURNAL_NAME: &str = "journal";

/// Marks a revision as committed and records its place in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    pub id: Identifier,
    pub final_commit_number: u64,
}

impl Lifecycle for CommitMarker {}

impl Storable for CommitMarker {
    const TYPE_TAG: &'static str = "contrail.commitmarker";
}

impl Entity for CommitMarker {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// Records that a session pins a revision against cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPin {
    pub id: Identifier,
    pub session_id: String,
}

impl Lifecycle for SessionPin {}

impl Storable for SessionPin {
    const TYPE_TAG: &'static str = "contrail.sessionpin";
}

impl Entity for SessionPin {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// Records that cleanup of a revision has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: Identifier,
    pub revision_number: u64,
}

impl Lifecycle for DeletionMark {}

impl Storable for DeletionMark {
    const TYPE_TAG: &'static str = "contrail.deletionmark";
}

impl Entity for DeletionMark {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// The identifiers a revision read and changed.
///
/// Used to detect conflicts between concurrently committing revisions and
/// to find the per-object markers cleanup can discard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionJournal {
    pub id: Identifier,
    pub revision_number: u64,
    pub reads: BTreeSet<Identifier>,
    pub inserts: BTreeSet<Identifier>,
    pub updates: BTreeSet<Identifier>,
    pub deletes: BTreeSet<Identifier>,
}

impl RevisionJournal {
    /// An empty journal for `revision_number`.
    #[must_use]
    pub fn empty(id: Identifier, revision_number: u64) -> Self {
        Self {
            id,
            revision_number,
            reads: BTreeSet::new(),
            inserts: BTreeSet::new(),
            updates: BTreeSet::new(),
            deletes: BTreeSet::new(),
        }
    }

    /// Whether `id` was inserted, updated or deleted.
    #[must_use]
    pub fn changed(&self, id: &Identifier) -> bool {
        self.inserts.contains(id) || self.updates.contains(id) || self.deletes.contains(id)
    }

    /// Every inserted, updated or deleted identifier, in order.
    #[must_use]
    pub fn changed_ids(&self) -> BTreeSet<Identifier> {
        self.inserts
            .iter()
            .chain(&self.updates)
            .chain(&self.deletes)
            .cloned()
            .collect()
    }

    /// Whether both journals changed at least one common identifier.
    ///
    /// Reads are recorded but do not take part in the check.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.inserts
            .iter()
            .chain(&self.updates)
            .chain(&self.deletes)
            .any(|id| other.changed(id))
    }

    /// Whether nothing was changed.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

impl Lifecycle for RevisionJournal {}

impl Storable for RevisionJournal {
    const TYPE_TAG: &'static str = "contrail.journal";
}

impl Entity for RevisionJournal {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// One database revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionFolder {
    pub id: Identifier,
    pub revision_number: u64,
    /// Final commit number of the revision this one branched from.
    pub start_commit_number: u64,
    /// Revision this one branched from, if any.
    pub start_revision_number: Option<u64>,
}

impl RevisionFolder {
    #[must_use]
    pub const fn new(
        id: Identifier,
        revision_number: u64,
        start_commit_number: u64,
        start_revision_number: Option<u64>,
    ) -> Self {
        Self {
            id,
            revision_number,
            start_commit_number,
            start_revision_number,
        }
    }

    #[must_use]
    pub fn sessions_folder_id(&self) -> Identifier {
        self.id.child(SESSIONS_NAME)
    }

    #[must_use]
    pub fn commit_marker_id(&self) -> Identifier {
        self.id.child(COMMIT_MARKER_NAME)
    }

    #[must_use]
    pub fn journal_id(&self) -> Identifier {
        self.id.child(JOURNAL_NAME)
    }

    #[must_use]
    pub fn lock_folder(&self) -> LockFolder {
        LockFolder::within(&self.id)
    }

    /// Take this revision's lock, waiting for the current holder.
    pub fn lock(
        &self,
        storage: &EntitySession,
        process_id: &str,
        lease: Duration,
    ) -> Result<(), StorageError> {
        self.lock_folder()
            .lock(storage, process_id, true, lease)
            .map(|_| ())
    }

    pub fn unlock(&self, storage: &EntitySession, process_id: &str) -> Result<(), StorageError> {
        self.lock_folder().unlock(storage, process_id)
    }

    /// Pin this revision for `session_id`.
    pub fn add_session(&self, storage: &EntitySession, session_id: &str) -> Result<(), StorageError> {
        storage.store_entity(&SessionPin {
            id: self.sessions_folder_id().child(session_id),
            session_id: session_id.to_string(),
        })
    }

    /// Drop the pin held by `session_id`.
    pub fn remove_session(&self, storage: &EntitySession, session_id: &str) -> Result<(), StorageError> {
        storage.delete(&self.sessions_folder_id().child(session_id))
    }

    /// Ids of the sessions pinning this revision.
    pub fn sessions(&self, storage: &EntitySession) -> Result<Vec<String>, StorageError> {
        Ok(storage
            .list_children(&self.sessions_folder_id())?
            .iter()
            .map(|id| id.name().to_string())
            .collect())
    }

    /// Whether any session pins this revision.
    pub fn is_active(&self, storage: &EntitySession) -> Result<bool, StorageError> {
        Ok(!storage.list_children(&self.sessions_folder_id())?.is_empty())
    }

    pub fn commit_marker(&self, storage: &EntitySession) -> Result<Option<CommitMarker>, StorageError> {
        storage.fetch(&self.commit_marker_id())
    }

    /// The final commit number, or `None` while uncommitted.
    pub fn final_commit_number(&self, storage: &EntitySession) -> Result<Option<u64>, StorageError> {
        Ok(self
            .commit_marker(storage)?
            .map(|marker| marker.final_commit_number))
    }

    pub fn is_committed(&self, storage: &EntitySession) -> Result<bool, StorageError> {
        Ok(self.commit_marker(storage)?.is_some())
    }

    /// Record `final_commit_number`, making this revision committed.
    pub fn mark_committed(
        &self,
        storage: &EntitySession,
        final_commit_number: u64,
    ) -> Result<(), StorageError> {
        storage.store_entity(&CommitMarker {
            id: self.commit_marker_id(),
            final_commit_number,
        })
    }

    pub fn journal(&self, storage: &EntitySession) -> Result<Option<RevisionJournal>, StorageError> {
        storage.fetch(&self.journal_id())
    }

    /// Persist `journal` as this revision's journal.
    pub fn store_journal(
        &self,
        storage: &EntitySession,
        journal: &RevisionJournal,
    ) -> Result<(), StorageError> {
        storage.store(&self.journal_id(), journal)
    }
}

impl Lifecycle for RevisionFolder {
    fn on_insert<S: EntityStorage>(&self, storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        storage.store_entity(&Folder::new(self.sessions_folder_id()))?;
        storage.store_entity(&self.lock_folder())
    }

    fn on_delete<S: EntityStorage>(&self, storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        let sessions = self.sessions_folder_id();
        for pin in storage.list_children(&sessions)? {
            storage.delete(&pin)?;
        }
        storage.delete(&sessions)?;
        storage.delete_entity(&self.lock_folder())?;
        storage.delete(&self.commit_marker_id())?;
        storage.delete(&self.journal_id())
    }
}

impl Storable for RevisionFolder {
    const TYPE_TAG: &'static str = "contrail.revision";
}

impl Entity for RevisionFolder {
    fn id(&self) -> &Identifier {
        &self.id
    }
}

/// Anchor of all revision metadata for one storage system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFolder {
    pub id: Identifier,
}

impl RootFolder {
    /// Load the root folder at `id`, creating it (with an empty, committed
    /// revision 0) if this is the first use of the storage.
    pub fn create_or_open(storage: &EntitySession, id: Identifier) -> Result<Self, StorageError> {
        if let Some(root) = storage.fetch::<Self>(&id)? {
            return Ok(root);
        }
        let root = Self { id };
        if storage.create_entity(&root, Duration::ZERO)? {
            storage.flush()?;
            tracing::info!(root = %root.id, "initialised storage");
            return Ok(root);
        }
        storage
            .fetch::<Self>(&root.id)?
            .ok_or_else(|| StorageError::corruption(format!("root folder {} vanished", root.id)))
    }

    #[must_use]
    pub fn revisions_folder_id(&self) -> Identifier {
        self.id.child(REVISIONS_NAME)
    }

    #[must_use]
    pub fn deletions_folder_id(&self) -> Identifier {
        self.id.child(DELETIONS_NAME)
    }

    #[must_use]
    pub fn lock_folder(&self) -> LockFolder {
        LockFolder::within(&self.id)
    }

    #[must_use]
    pub fn revision_id(&self, revision_number: u64) -> Identifier {
        self.revisions_folder_id().child(&revision_number.to_string())
    }

    fn deletion_mark_id(&self, revision_number: u64) -> Identifier {
        self.deletions_folder_id()
            .child(&revision_number.to_string())
    }

    /// Take the global lock, waiting for the current holder.
    pub fn lock(
        &self,
        storage: &EntitySession,
        process_id: &str,
        lease: Duration,
    ) -> Result<(), StorageError> {
        self.lock_folder()
            .lock(storage, process_id, true, lease)
            .map(|_| ())
    }

    pub fn unlock(&self, storage: &EntitySession, process_id: &str) -> Result<(), StorageError> {
        self.lock_folder().unlock(storage, process_id)
    }

    /// Load one revision folder, whether or not it is marked for deletion.
    pub fn revision_folder(
        &self,
        storage: &EntitySession,
        revision_number: u64,
    ) -> Result<Option<RevisionFolder>, StorageError> {
        storage.fetch(&self.revision_id(revision_number))
    }

    /// Every revision folder, including those being cleaned up, newest
    /// first.
    pub fn all_revision_folders(&self, storage: &EntitySession) -> Result<Vec<RevisionFolder>, StorageError> {
        let mut revisions: Vec<RevisionFolder> = storage
            .fetch_children::<RevisionFolder>(&self.revisions_folder_id())?
            .into_iter()
            .map(|(_, revision)| revision)
            .collect();
        revisions.sort_by(|a, b| b.revision_number.cmp(&a.revision_number));
        Ok(revisions)
    }

    /// Every revision not marked for deletion, newest first.
    pub fn revision_folders(&self, storage: &EntitySession) -> Result<Vec<RevisionFolder>, StorageError> {
        let marked = self.deletion_marks(storage)?;
        let mut revisions = self.all_revision_folders(storage)?;
        revisions.retain(|revision| !marked.contains(&revision.revision_number));
        Ok(revisions)
    }

    /// Highest revision number ever handed out and not yet cleaned up.
    pub fn max_revision_number(&self, storage: &EntitySession) -> Result<u64, StorageError> {
        storage
            .list_children(&self.revisions_folder_id())?
            .iter()
            .filter_map(|id| id.name().parse::<u64>().ok())
            .max()
            .ok_or_else(|| StorageError::corruption(format!("{} has no revisions", self.id)))
    }

    /// The committed revision with the highest final commit number, with
    /// that number.
    pub fn last_committed_revision(
        &self,
        storage: &EntitySession,
    ) -> Result<Option<(RevisionFolder, u64)>, StorageError> {
        let mut last: Option<(RevisionFolder, u64)> = None;
        for revision in self.revision_folders(storage)? {
            if let Some(commit_number) = revision.final_commit_number(storage)? {
                if last.as_ref().is_none_or(|(_, best)| commit_number > *best) {
                    last = Some((revision, commit_number));
                }
            }
        }
        Ok(last)
    }

    /// Revision numbers with cleanup in progress.
    pub fn deletion_marks(&self, storage: &EntitySession) -> Result<BTreeSet<u64>, StorageError> {
        Ok(storage
            .fetch_children::<DeletionMark>(&self.deletions_folder_id())?
            .into_iter()
            .map(|(_, mark)| mark.revision_number)
            .collect())
    }

    pub fn is_marked_for_deletion(
        &self,
        storage: &EntitySession,
        revision_number: u64,
    ) -> Result<bool, StorageError> {
        Ok(storage
            .fetch::<DeletionMark>(&self.deletion_mark_id(revision_number))?
            .is_some())
    }

    pub fn mark_revision_for_deletion(
        &self,
        storage: &EntitySession,
        revision_number: u64,
    ) -> Result<(), StorageError> {
        storage.store_entity(&DeletionMark {
            id: self.deletion_mark_id(revision_number),
            revision_number,
        })
    }

    pub fn unmark_revision_for_deletion(
        &self,
        storage: &EntitySession,
        revision_number: u64,
    ) -> Result<(), StorageError> {
        storage.delete(&self.deletion_mark_id(revision_number))
    }

    /// Delete a revision folder with everything below it, then its
    /// deletion mark.
    pub fn delete_revision(
        &self,
        storage: &EntitySession,
        revision: &RevisionFolder,
    ) -> Result<(), StorageError> {
        storage.delete_entity(revision)?;
        self.unmark_revision_for_deletion(storage, revision.revision_number)
    }
}

impl Lifecycle for RootFolder {
    fn on_insert<S: EntityStorage>(&self, storage: &S, _id: &Identifier) -> Result<(), StorageError> {
        storage.store_entity(&Folder::new(self.revisions_folder_id()))?;
        storage.store_entity(&Folder::new(self.deletions_folder_id()))?;
        storage.store_entity(&self.lock_folder())?;

        let initial = RevisionFolder::new(self.revision_id(0), 0, 0, None);
        storage.store_entity(&initial)?;
        storage.store_entity(&RevisionJournal::empty(initial.journal_id(), 0))?;
        storage.store_entity(&CommitMarker {
            id: initial.commit_marker_id(),
            final_commit_number: 0,
        })
    }
}

impl Storable for RootFolder {
    const TYPE_TAG: &'static str = "contrail.root";
}

impl Entity for RootFolder {
    fn id(&self) -> &Identifier {
        &self.id
    }
}
