//! MVCC coordinator.
//!
//! The [`StorageSystem`] owns the revision metadata below one root folder,
//! hands out [`StorageSession`]s, validates and records commits, and runs
//! revision cleanup.
//!
//! # Design
//!
//! - Sessions hold an `Arc` of the system; the system only keeps `Weak`
//!   handles to its sessions so dropping a session abandons it.
//! - Beginning a session and committing are serialised by the root lock.
//!   Conflict validation runs once, at commit, under that lock.
//! - Cleanup runs on a background task when the system is opened inside a
//!   tokio runtime, and inline after each commit otherwise.
//!
//! # Invariants
//!
//! - A read-write session pins both its own revision and the committed
//!   revision it branched from until it commits or is abandoned.
//! - The watermark `last_deleted` only grows; every revision at or below it
//!   has been cleaned up.
//! - A session reads the revisions whose final commit number is at most its
//!   snapshot commit, fixed when it begins. Revisions that were cleaned up
//!   are older than every live snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::StorageConfig;
use crate::storage::cleanup::{self, CleanupTask, StorageCleanupAction};
use crate::storage::entity::{EntitySession, EntityStore};
use crate::storage::io::{RawStorage, StorageError};
use crate::storage::object::{EntityStorage, ObjectSession};
use crate::storage::revision::{RevisionFolder, RevisionJournal, RootFolder};
use crate::storage::session::{SessionMode, StorageSession, list_markers};
use crate::types::Identifier;

/// Summary of one available revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub revision_number: u64,
    pub start_commit_number: u64,
    /// `None` while uncommitted.
    pub final_commit_number: Option<u64>,
    /// Number of sessions pinning the revision.
    pub sessions: usize,
}

impl RevisionInfo {
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.final_commit_number.is_some()
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.sessions > 0
    }
}

/// Best-effort knowledge about revision states.
#[derive(Debug, Default)]
struct RevisionCache {
    /// Highest revision known to be cleaned up.
    last_deleted: Option<u64>,
    /// Revisions begun by this process and not committed yet.
    uncommitted: BTreeSet<u64>,
    /// Final commit numbers seen so far. They never change once set.
    commits: BTreeMap<u64, u64>,
}

/// Commit state of one revision as seen by marker visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RevisionStatus {
    Uncommitted,
    Committed(u64),
    /// Committed and cleaned up, so its commit number is gone.
    CleanedUp,
}

/// Top-level coordinator of versioned storage.
pub struct StorageSystem {
    config: StorageConfig,
    store: EntityStore,
    metadata: EntitySession,
    root: RootFolder,
    process_id: String,
    sessions: Mutex<HashMap<String, Weak<StorageSession>>>,
    revisions: Mutex<RevisionCache>,
    cleanup_task: Mutex<Option<CleanupTask>>,
    sweep_gate: Mutex<()>,
    stopped: AtomicBool,
}

impl StorageSystem {
    /// Open versioned storage over `raw`, initialising the root folder on
    /// first use.
    ///
    /// If called from within a tokio runtime, a background cleanup task is
    /// spawned on it.
    pub fn open(raw: Arc<dyn RawStorage>, config: StorageConfig) -> Result<Arc<Self>, StorageError> {
        let store = EntityStore::new(raw, config.cache_capacity);
        let metadata = store.connect();
        let root = RootFolder::create_or_open(&metadata, Identifier::new(&config.root_path)?)?;
        let system = Arc::new(Self {
            config,
            store,
            metadata,
            root,
            process_id: format!("process.{}", Identifier::unique()),
            sessions: Mutex::new(HashMap::new()),
            revisions: Mutex::new(RevisionCache::default()),
            cleanup_task: Mutex::new(None),
            sweep_gate: Mutex::new(()),
            stopped: AtomicBool::new(false),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let task = cleanup::spawn_cleanup_task(&runtime, Arc::downgrade(&system));
            *system.cleanup_task.lock()? = Some(task);
        }
        tracing::info!(
            root = %system.root.id,
            process_id = %system.process_id,
            "storage system opened"
        );
        Ok(system)
    }

    /// [`open`](Self::open) with the default configuration.
    pub fn open_with_defaults(raw: Arc<dyn RawStorage>) -> Result<Arc<Self>, StorageError> {
        Self::open(raw, StorageConfig::default())
    }

    #[must_use]
    pub const fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub const fn root(&self) -> &RootFolder {
        &self.root
    }

    pub(crate) const fn metadata(&self) -> &EntitySession {
        &self.metadata
    }

    pub(crate) fn process_id(&self) -> &str {
        &self.process_id
    }

    /// A fresh hook-free object session over the shared store.
    pub(crate) fn objects(&self) -> ObjectSession {
        self.store.objects().connect()
    }

    fn revision_cache(&self) -> MutexGuard<'_, RevisionCache> {
        // Only a performance hint; a poisoned cache is still usable.
        self.revisions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` while holding the root lock, releasing it whatever `f`
    /// returns.
    pub(crate) fn with_root_lock<T>(
        &self,
        f: impl FnOnce(&EntitySession) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.root
            .lock(&self.metadata, &self.process_id, self.config.lease_timeout)?;
        let result = f(&self.metadata);
        let unlocked = self.root.unlock(&self.metadata, &self.process_id);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Begin a session at the newest committed revision (read-only) or at a
    /// new revision branching from it (read-write).
    pub fn begin_session(self: &Arc<Self>, mode: SessionMode) -> Result<Arc<StorageSession>, StorageError> {
        let session_id = format!("session.{}", Identifier::unique());
        let (revision, start, snapshot) = self.with_root_lock(|metadata| {
            let (base, start_commit) = self
                .root
                .last_committed_revision(metadata)?
                .ok_or_else(|| StorageError::corruption("no committed revisions found"))?;

            if mode == SessionMode::ReadOnly {
                base.add_session(metadata, &session_id)?;
                metadata.flush()?;
                return Ok((base, None, start_commit));
            }

            let number = self.root.max_revision_number(metadata)? + 1;
            let revision = RevisionFolder::new(
                self.root.revision_id(number),
                number,
                start_commit,
                Some(base.revision_number),
            );
            metadata.store_entity(&revision)?;
            revision.add_session(metadata, &session_id)?;
            base.add_session(metadata, &session_id)?;
            metadata.flush()?;
            self.revision_cache().uncommitted.insert(number);
            Ok((revision, Some(base), start_commit))
        })?;

        tracing::info!(
            session = %session_id,
            ?mode,
            revision = revision.revision_number,
            snapshot,
            "session begun"
        );
        Ok(self.register(session_id, mode, revision, start, snapshot))
    }

    /// Begin a read-only session pinned to an existing revision.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RevisionNotFound`] if the revision does not
    /// exist or is being cleaned up.
    pub fn begin_session_at(
        self: &Arc<Self>,
        revision_number: u64,
    ) -> Result<Arc<StorageSession>, StorageError> {
        let metadata = &self.metadata;
        let revision = self
            .root
            .revision_folder(metadata, revision_number)?
            .ok_or(StorageError::RevisionNotFound(revision_number))?;
        let session_id = format!("session.{}", Identifier::unique());

        revision.lock(metadata, &self.process_id, self.config.lease_timeout)?;
        let pinned = self.pin_unless_marked(&revision, &session_id);
        let unlocked = revision.unlock(metadata, &self.process_id);
        if !pinned? {
            unlocked?;
            return Err(StorageError::RevisionNotFound(revision_number));
        }
        unlocked?;

        // An uncommitted revision reads what its writer could read.
        let snapshot = match revision.final_commit_number(metadata) {
            Ok(commit) => commit.unwrap_or(revision.start_commit_number),
            Err(e) => {
                revision.remove_session(metadata, &session_id)?;
                return Err(e);
            }
        };
        tracing::info!(
            session = %session_id,
            revision = revision_number,
            snapshot,
            "session begun at revision"
        );
        Ok(self.register(session_id, SessionMode::ReadOnly, revision, None, snapshot))
    }

    fn pin_unless_marked(&self, revision: &RevisionFolder, session_id: &str) -> Result<bool, StorageError> {
        if self
            .root
            .is_marked_for_deletion(&self.metadata, revision.revision_number)?
        {
            return Ok(false);
        }
        revision.add_session(&self.metadata, session_id)?;
        self.metadata.flush()?;
        Ok(true)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    fn register(
        self: &Arc<Self>,
        session_id: String,
        mode: SessionMode,
        revision: RevisionFolder,
        start: Option<RevisionFolder>,
        snapshot: u64,
    ) -> Arc<StorageSession> {
        let session = Arc::new(StorageSession::new(
            Arc::clone(self),
            session_id.clone(),
            mode,
            revision,
            start,
            snapshot,
        ));
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, Arc::downgrade(&session));
        session
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Number of sessions begun and not yet committed or abandoned.
    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|session| session.strong_count() > 0)
            .count()
    }

    /// Validate and commit a read-write session's revision.
    pub(crate) fn commit_revision(
        &self,
        session: &StorageSession,
        journal: &RevisionJournal,
    ) -> Result<(), StorageError> {
        let revision = session.revision();
        let number = revision.revision_number;
        revision.store_journal(&self.metadata, journal)?;
        self.metadata.flush()?;

        let outcome = self.with_root_lock(|metadata| {
            let mut last_commit = None;
            for other in self.root.all_revision_folders(metadata)? {
                let Some(final_commit) = other.final_commit_number(metadata)? else {
                    continue;
                };
                last_commit = last_commit.max(Some(final_commit));
                if final_commit <= revision.start_commit_number {
                    continue;
                }
                let other_journal = other.journal(metadata)?.ok_or_else(|| {
                    StorageError::corruption(format!(
                        "committed revision {} has no journal",
                        other.revision_number
                    ))
                })?;
                if other_journal.conflicts_with(journal) {
                    return Ok(Some(other.revision_number));
                }
            }
            let last_commit =
                last_commit.ok_or_else(|| StorageError::corruption("no committed revisions found"))?;

            revision.mark_committed(metadata, last_commit + 1)?;
            revision.remove_session(metadata, session.id())?;
            if let Some(start) = session.start_revision() {
                start.remove_session(metadata, session.id())?;
            }
            metadata.flush()?;
            {
                let mut cache = self.revision_cache();
                cache.uncommitted.remove(&number);
                cache.commits.insert(number, last_commit + 1);
            }
            tracing::info!(
                session = %session.id(),
                revision = number,
                commit = last_commit + 1,
                "revision committed"
            );
            Ok(None)
        });

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(conflicting)) => {
                tracing::warn!(
                    session = %session.id(),
                    revision = number,
                    conflicting,
                    "commit conflicts with a concurrent revision"
                );
                self.metadata.delete(&revision.journal_id())?;
                self.metadata.flush()?;
                Err(StorageError::ConflictingCommit { revision: number })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether revision `revision_number` is committed.
    pub fn is_revision_committed(&self, revision_number: u64) -> Result<bool, StorageError> {
        Ok(self.revision_status(revision_number)? != RevisionStatus::Uncommitted)
    }

    /// Commit state of revision `revision_number`. A missing revision
    /// folder means the revision was cleaned up.
    pub(crate) fn revision_status(&self, revision_number: u64) -> Result<RevisionStatus, StorageError> {
        {
            let cache = self.revision_cache();
            if cache.last_deleted.is_some_and(|deleted| revision_number <= deleted) {
                return Ok(RevisionStatus::CleanedUp);
            }
            if cache.uncommitted.contains(&revision_number) {
                return Ok(RevisionStatus::Uncommitted);
            }
            if let Some(&commit) = cache.commits.get(&revision_number) {
                return Ok(RevisionStatus::Committed(commit));
            }
        }
        let Some(revision) = self.root.revision_folder(&self.metadata, revision_number)? else {
            self.note_revision_deleted(revision_number);
            return Ok(RevisionStatus::CleanedUp);
        };
        Ok(match revision.final_commit_number(&self.metadata)? {
            Some(commit) => {
                self.revision_cache().commits.insert(revision_number, commit);
                RevisionStatus::Committed(commit)
            }
            None => RevisionStatus::Uncommitted,
        })
    }

    pub(crate) fn note_revision_deleted(&self, revision_number: u64) {
        let mut cache = self.revision_cache();
        cache.last_deleted = cache.last_deleted.max(Some(revision_number));
        cache.uncommitted.remove(&revision_number);
        cache.commits.remove(&revision_number);
    }

    /// Revisions that new sessions can still see, newest first.
    pub fn available_revisions(&self) -> Result<Vec<RevisionInfo>, StorageError> {
        let metadata = &self.metadata;
        self.root
            .revision_folders(metadata)?
            .into_iter()
            .map(|revision| {
                Ok(RevisionInfo {
                    revision_number: revision.revision_number,
                    start_commit_number: revision.start_commit_number,
                    final_commit_number: revision.final_commit_number(metadata)?,
                    sessions: revision.sessions(metadata)?.len(),
                })
            })
            .collect()
    }

    /// Committed revisions whose journal is missing.
    ///
    /// Loads every revision folder, including those being cleaned up.
    pub fn check(&self) -> Result<Vec<u64>, StorageError> {
        let metadata = &self.metadata;
        let mut damaged = Vec::new();
        for revision in self.root.all_revision_folders(metadata)? {
            if revision.is_committed(metadata)? && revision.journal(metadata)?.is_none() {
                tracing::warn!(revision = revision.revision_number, "committed revision has no journal");
                damaged.push(revision.revision_number);
            }
        }
        Ok(damaged)
    }

    /// Remove the holder of `id` once it has no markers left.
    ///
    /// The holder is put back if a marker appears concurrently.
    pub(crate) fn prune_holder(&self, id: &Identifier) -> Result<(), StorageError> {
        let objects = self.objects();
        objects.remove(id)?;
        if !list_markers(&objects, id)?.is_empty() {
            self.metadata.ensure_folder(id)?;
        }
        Ok(())
    }

    /// Clean up every revision that is no longer needed.
    ///
    /// Returns the number of revisions removed. Once the system is closed
    /// this removes nothing.
    pub fn cleanup(&self) -> Result<usize, StorageError> {
        let _gate = self.sweep_gate.lock()?;
        if self.stopped.load(Ordering::Acquire) {
            tracing::debug!(root = %self.root.id, "cleanup skipped after close");
            return Ok(0);
        }
        StorageCleanupAction::new(self).run()
    }

    /// Ask for a cleanup sweep after a commit attempt.
    ///
    /// Sweep failures are logged and never reach the caller.
    pub(crate) fn schedule_cleanup(&self) {
        match self.cleanup_task.lock() {
            Ok(task) => {
                if let Some(task) = task.as_ref() {
                    task.notify();
                    return;
                }
            }
            Err(_) => {
                tracing::error!("cleanup task handle poisoned");
                return;
            }
        }
        if let Err(e) = self.cleanup() {
            tracing::error!(error = %e, "revision cleanup failed");
        }
    }

    /// Abandon every active session and stop background cleanup, waiting
    /// for an in-flight sweep to finish.
    pub fn close(&self) -> Result<(), StorageError> {
        let sessions: Vec<Weak<StorageSession>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        let mut first_error = None;
        for session in sessions.iter().filter_map(Weak::upgrade) {
            if let Err(e) = session.close() {
                tracing::warn!(session = %session.id(), error = %e, "failed to abandon session");
                first_error.get_or_insert(e);
            }
        }

        if let Some(task) = self.cleanup_task.lock()?.take() {
            task.stop();
        }
        self.stopped.store(true, Ordering::Release);
        drop(self.sweep_gate.lock()?);
        self.metadata.flush()?;
        tracing::info!(root = %self.root.id, "storage system closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for StorageSystem {
    fn drop(&mut self) {
        if let Some(task) = self
            .cleanup_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.stop();
        }
    }
}

impl std::fmt::Debug for StorageSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSystem")
            .field("root", &self.root.id)
            .field("process_id", &self.process_id)
            .field("active_sessions", &self.active_session_count())
            .finish_non_exhaustive()
    }
}
