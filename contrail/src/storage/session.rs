//! Snapshot-isolated storage sessions.
//!
//! A [`StorageSession`] reads and writes entities at one revision number.
//! Nothing is overwritten in place: every write to a logical identifier `P`
//! adds a marker below `P/.contrail`:
//!
//! ```text
//! P                         holder, makes P listable under its parent
//! P/.contrail/store-<R>     the value P had as written by revision R
//! P/.contrail/delete-<R>    tombstone written by revision R
//! ```
//!
//! # Visibility
//!
//! Every session fixes a snapshot commit number when it begins. A marker of
//! revision `Rm` is visible to a session at revision `R` iff `Rm == R`, or
//! `Rm` is committed with a final commit number at most the snapshot's.
//! Markers of revisions that were cleaned up are visible to every session.
//! A fetch returns the payload of the visible marker committed last (the
//! session's own marker first), or nothing if that marker is a tombstone.
//!
//! # Lifecycle
//!
//! `Active -> Committed | Abandoned`. Both end states are terminal; `commit`
//! and `close` on a terminal session do nothing, every other operation
//! fails with [`StorageError::SessionClosed`]. A commit that conflicts
//! leaves the session active so the caller can inspect and close it.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::storage::io::StorageError;
use crate::storage::object::{EntityStorage, Lifecycle, ObjectSession, Storable};
use crate::storage::revision::{RevisionFolder, RevisionJournal};
use crate::storage::system::{RevisionStatus, StorageSystem};
use crate::types::Identifier;

/// Name of the bookkeeping folder below every versioned identifier.
pub const VERSIONS_FOLDER: &str = ".contrail";
const STORE_PREFIX: &str = "store-";
const DELETE_PREFIX: &str = "delete-";

/// What a session may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    ReadOnly,
    ReadWrite,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Committed,
    Abandoned,
}

impl SessionState {
    /// Whether no further operation is permitted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkerKind {
    Store,
    Delete,
}

/// One revision's write to one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Marker {
    pub(crate) id: Identifier,
    pub(crate) kind: MarkerKind,
    pub(crate) revision: u64,
}

impl Marker {
    pub(crate) fn id_for(object: &Identifier, kind: MarkerKind, revision: u64) -> Identifier {
        let prefix = match kind {
            MarkerKind::Store => STORE_PREFIX,
            MarkerKind::Delete => DELETE_PREFIX,
        };
        object
            .child(VERSIONS_FOLDER)
            .child(&format!("{prefix}{revision}"))
    }

    fn parse(id: Identifier) -> Option<Self> {
        let name = id.name();
        let (kind, number) = if let Some(number) = name.strip_prefix(STORE_PREFIX) {
            (MarkerKind::Store, number)
        } else {
            (MarkerKind::Delete, name.strip_prefix(DELETE_PREFIX)?)
        };
        let revision = number.parse().ok()?;
        Some(Self { id, kind, revision })
    }
}

/// Every marker of `object`, newest revision first.
pub(crate) fn list_markers(
    objects: &ObjectSession,
    object: &Identifier,
) -> Result<Vec<Marker>, StorageError> {
    let mut markers: Vec<Marker> = objects
        .list_children(&object.child(VERSIONS_FOLDER))?
        .into_iter()
        .filter_map(Marker::parse)
        .collect();
    markers.sort_by(|a, b| b.revision.cmp(&a.revision));
    Ok(markers)
}

/// Payload of a delete marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Tombstone;

impl Lifecycle for Tombstone {}

impl Storable for Tombstone {
    const TYPE_TAG: &'static str = "contrail.tombstone";
}

/// A snapshot view of versioned entity storage.
pub struct StorageSession {
    id: String,
    mode: SessionMode,
    revision: RevisionFolder,
    /// Committed revision a read-write session branched from.
    start_revision: Option<RevisionFolder>,
    /// Highest commit number this session reads.
    snapshot_commit: u64,
    system: Arc<StorageSystem>,
    objects: ObjectSession,
    state: Mutex<SessionState>,
    journal: Mutex<RevisionJournal>,
}

impl StorageSession {
    pub(crate) fn new(
        system: Arc<StorageSystem>,
        id: String,
        mode: SessionMode,
        revision: RevisionFolder,
        start_revision: Option<RevisionFolder>,
        snapshot_commit: u64,
    ) -> Self {
        let journal = RevisionJournal::empty(revision.journal_id(), revision.revision_number);
        Self {
            id,
            mode,
            objects: system.objects(),
            revision,
            start_revision,
            snapshot_commit,
            system,
            state: Mutex::new(SessionState::Active),
            journal: Mutex::new(journal),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The revision this session reads (and, if read-write, writes) at.
    #[must_use]
    pub const fn revision_number(&self) -> u64 {
        self.revision.revision_number
    }

    /// Final commit number of the snapshot this session reads.
    #[must_use]
    pub const fn start_commit_number(&self) -> u64 {
        self.snapshot_commit
    }

    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub(crate) const fn revision(&self) -> &RevisionFolder {
        &self.revision
    }

    pub(crate) const fn start_revision(&self) -> Option<&RevisionFolder> {
        self.start_revision.as_ref()
    }

    /// Changes recorded so far.
    pub fn journal(&self) -> Result<RevisionJournal, StorageError> {
        Ok(self.journal.lock()?.clone())
    }

    fn check_active(&self) -> Result<(), StorageError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StorageError::SessionClosed {
                session_id: self.id.clone(),
            })
        }
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        self.check_active()?;
        match self.mode {
            SessionMode::ReadWrite => Ok(()),
            SessionMode::ReadOnly => Err(StorageError::ReadOnly {
                revision: self.revision_number(),
            }),
        }
    }

    /// The visible marker of `id` committed last.
    fn visible_marker(&self, id: &Identifier) -> Result<Option<Marker>, StorageError> {
        let own = self.revision_number();
        let mut newest: Option<((u64, u64), Marker)> = None;
        for marker in list_markers(&self.objects, id)? {
            if marker.revision == own {
                return Ok(Some(marker));
            }
            let commit = match self.system.revision_status(marker.revision)? {
                RevisionStatus::Uncommitted => continue,
                RevisionStatus::Committed(commit) if commit > self.snapshot_commit => continue,
                RevisionStatus::Committed(commit) => commit,
                // Cleaned up before every live snapshot began.
                RevisionStatus::CleanedUp => 0,
            };
            let rank = (commit, marker.revision);
            if newest.as_ref().is_none_or(|(best, _)| rank > *best) {
                newest = Some((rank, marker));
            }
        }
        Ok(newest.map(|(_, marker)| marker))
    }

    fn is_visible(&self, id: &Identifier) -> Result<bool, StorageError> {
        Ok(self
            .visible_marker(id)?
            .is_some_and(|marker| marker.kind == MarkerKind::Store))
    }

    /// Whether an entity is stored under `id` in this session's view.
    pub fn exists(&self, id: &Identifier) -> Result<bool, StorageError> {
        self.check_active()?;
        self.is_visible(id)
    }

    /// Make the changes of this session visible to sessions begun later.
    ///
    /// A read-only session just releases its snapshot. Does nothing on a
    /// session that already ended.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConflictingCommit`] if a revision committed
    /// after this session began changed an identifier this session
    /// changed. The session stays active; close it and start over.
    pub fn commit(&self) -> Result<(), StorageError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.objects.flush()?;

        if self.mode == SessionMode::ReadOnly {
            self.release_pins()?;
            self.finish(SessionState::Committed)?;
            tracing::debug!(session = %self.id, revision = self.revision_number(), "read-only session released");
            return Ok(());
        }

        let journal = self.journal()?;
        let result = self.system.commit_revision(self, &journal);
        if result.is_ok() {
            self.finish(SessionState::Committed)?;
        }
        self.system.schedule_cleanup();
        result
    }

    /// End the session without committing.
    ///
    /// Writes of a read-write session are physically removed. Does nothing
    /// on a session that already ended.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.objects.flush()?;
        if self.mode == SessionMode::ReadWrite {
            self.discard_writes()?;
        }
        self.release_pins()?;
        self.finish(SessionState::Abandoned)?;
        tracing::info!(session = %self.id, revision = self.revision_number(), "session abandoned");
        Ok(())
    }

    fn finish(&self, state: SessionState) -> Result<(), StorageError> {
        *self.state.lock()? = state;
        self.system.unregister(&self.id);
        Ok(())
    }

    fn release_pins(&self) -> Result<(), StorageError> {
        let metadata = self.system.metadata();
        self.revision.remove_session(metadata, &self.id)?;
        if let Some(start) = &self.start_revision {
            start.remove_session(metadata, &self.id)?;
        }
        metadata.flush()
    }

    fn discard_writes(&self) -> Result<(), StorageError> {
        let revision = self.revision_number();
        for id in self.journal()?.changed_ids() {
            self.objects
                .remove(&Marker::id_for(&id, MarkerKind::Store, revision))?;
            self.objects
                .remove(&Marker::id_for(&id, MarkerKind::Delete, revision))?;
            if list_markers(&self.objects, &id)?.is_empty() {
                self.system.prune_holder(&id)?;
            }
        }
        self.system.metadata().delete(&self.revision.journal_id())?;
        self.objects.flush()
    }
}

impl EntityStorage for StorageSession {
    fn fetch<T: Storable>(&self, id: &Identifier) -> Result<Option<T>, StorageError> {
        self.check_active()?;
        if self.mode == SessionMode::ReadWrite {
            self.journal.lock()?.reads.insert(id.clone());
        }
        let Some(marker) = self.visible_marker(id)? else {
            return Ok(None);
        };
        if marker.kind == MarkerKind::Delete {
            return Ok(None);
        }
        let Some(mut item) = self.objects.read::<T>(&marker.id)? else {
            return Err(StorageError::corruption(format!(
                "marker {} disappeared while reading",
                marker.id
            )));
        };
        item.on_load(self, id)?;
        Ok(Some(item))
    }

    fn store<T: Storable>(&self, id: &Identifier, item: &T) -> Result<(), StorageError> {
        self.check_writable()?;
        let revision = self.revision_number();
        let (own_delete, own_store) = {
            let journal = self.journal.lock()?;
            (
                journal.deletes.contains(id),
                journal.inserts.contains(id) || journal.updates.contains(id),
            )
        };
        if own_delete {
            self.objects
                .remove(&Marker::id_for(id, MarkerKind::Delete, revision))?;
        }
        // With no own marker left, visibility is the state before this session.
        let existed = if own_store {
            None
        } else {
            Some(self.is_visible(id)?)
        };
        self.objects
            .write(&Marker::id_for(id, MarkerKind::Store, revision), item)?;
        self.system.metadata().ensure_folder(id)?;

        {
            let mut journal = self.journal.lock()?;
            journal.deletes.remove(id);
            match existed {
                Some(true) => {
                    journal.updates.insert(id.clone());
                }
                Some(false) => {
                    journal.inserts.insert(id.clone());
                }
                None => {}
            }
        }
        tracing::trace!(%id, revision, "store marker written");
        item.on_insert(self, id)
    }

    fn delete(&self, id: &Identifier) -> Result<(), StorageError> {
        self.check_writable()?;
        let revision = self.revision_number();
        let own_store = {
            let journal = self.journal.lock()?;
            journal.inserts.contains(id) || journal.updates.contains(id)
        };
        if own_store {
            self.objects
                .remove(&Marker::id_for(id, MarkerKind::Store, revision))?;
        }
        self.objects
            .write(&Marker::id_for(id, MarkerKind::Delete, revision), &Tombstone)?;
        self.system.metadata().ensure_folder(id)?;

        let mut journal = self.journal.lock()?;
        journal.inserts.remove(id);
        journal.updates.remove(id);
        journal.deletes.insert(id.clone());
        drop(journal);
        tracing::trace!(%id, revision, "delete marker written");
        Ok(())
    }

    fn list_children(&self, id: &Identifier) -> Result<Vec<Identifier>, StorageError> {
        self.check_active()?;
        let mut children = Vec::new();
        for child in self.objects.list_children(id)? {
            if child.name() == VERSIONS_FOLDER {
                continue;
            }
            if self.is_visible(&child)? {
                children.push(child);
            }
        }
        Ok(children)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.objects.flush()
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        if !self.is_active() {
            return;
        }
        tracing::warn!(session = %self.id, "session dropped while active, abandoning it");
        if let Err(e) = self.close() {
            tracing::error!(session = %self.id, error = %e, "failed to abandon dropped session");
        }
    }
}

impl std::fmt::Debug for StorageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("revision", &self.revision.revision_number)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
