//! Revision cleanup.
//!
//! Old revisions are removed oldest first. A sweep repeatedly picks the
//! oldest revision still visible to new sessions and removes it if nobody
//! can need it any more, then stops at the first revision it has to keep.
//!
//! # Eligibility
//!
//! The oldest revision `r` is removed when it is not the only revision, no
//! session pins it, and either
//! - it is committed, a revision committed after it exists, and no pinned
//!   committed revision was committed before it; or
//! - it is uncommitted, which for an unpinned revision means its session
//!   was abandoned.
//!
//! Removing a committed revision also removes, for every identifier its
//! journal changed, the markers of older revisions and, when nothing older
//! remains, its own tombstone.
//!
//! # Background task
//!
//! [`spawn_cleanup_task`] runs sweeps on a tokio runtime:
//! - The task holds a `Weak<StorageSystem>` and exits once the system is
//!   dropped.
//! - Sweeps block on storage I/O and run on the blocking pool.
//! - Errors are logged and never propagated.

use std::sync::{Arc, Weak};

use tokio::sync::Notify;

use crate::storage::entity::EntitySession;
use crate::storage::io::StorageError;
use crate::storage::object::EntityStorage;
use crate::storage::revision::RevisionFolder;
use crate::storage::session::{MarkerKind, list_markers};
use crate::storage::system::StorageSystem;
use crate::types::Identifier;

/// One cleanup sweep over a storage system.
#[derive(Debug)]
pub struct StorageCleanupAction<'a> {
    system: &'a StorageSystem,
}

impl<'a> StorageCleanupAction<'a> {
    #[must_use]
    pub const fn new(system: &'a StorageSystem) -> Self {
        Self { system }
    }

    /// Remove revisions until the oldest one has to be kept.
    ///
    /// Returns the number of revisions removed.
    pub fn run(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        while let Some(revision) = self.system.with_root_lock(|metadata| self.select(metadata))? {
            if !self.reclaim(&revision)? {
                break;
            }
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "cleanup sweep finished");
        }
        Ok(removed)
    }

    /// Pick the oldest revision and mark it for deletion if it may go.
    ///
    /// Runs under the root lock.
    fn select(&self, metadata: &EntitySession) -> Result<Option<RevisionFolder>, StorageError> {
        let root = self.system.root();
        let revisions = root.revision_folders(metadata)?;
        let [newer @ .., oldest] = revisions.as_slice() else {
            return Ok(None);
        };
        if newer.is_empty() || oldest.is_active(metadata)? {
            return Ok(None);
        }

        if let Some(final_commit) = oldest.final_commit_number(metadata)? {
            let mut superseded = false;
            for revision in newer {
                let Some(other) = revision.final_commit_number(metadata)? else {
                    // A session pinned to an uncommitted revision reads at
                    // that revision's start commit.
                    if revision.start_commit_number < final_commit && revision.is_active(metadata)? {
                        return Ok(None);
                    }
                    continue;
                };
                if other > final_commit {
                    superseded = true;
                } else if revision.is_active(metadata)? {
                    // A snapshot older than this revision is still in use.
                    return Ok(None);
                }
            }
            if !superseded {
                return Ok(None);
            }
        }

        root.mark_revision_for_deletion(metadata, oldest.revision_number)?;
        metadata.flush()?;
        Ok(Some(oldest.clone()))
    }

    /// Remove a revision marked by [`select`](Self::select).
    ///
    /// Returns `false` if a session pinned it in the meantime.
    fn reclaim(&self, revision: &RevisionFolder) -> Result<bool, StorageError> {
        let system = self.system;
        let metadata = system.metadata();
        let root = system.root();
        let number = revision.revision_number;

        revision.lock(metadata, system.process_id(), system.config().lease_timeout)?;
        if revision.is_active(metadata)? {
            root.unmark_revision_for_deletion(metadata, number)?;
            revision.unlock(metadata, system.process_id())?;
            metadata.flush()?;
            tracing::debug!(revision = number, "revision pinned during cleanup, keeping it");
            return Ok(false);
        }

        if let Err(e) = self.remove(revision) {
            if let Err(unmark) = root.unmark_revision_for_deletion(metadata, number) {
                tracing::warn!(revision = number, error = %unmark, "failed to unmark revision");
            }
            if let Err(unlock) = revision.unlock(metadata, system.process_id()) {
                tracing::warn!(revision = number, error = %unlock, "failed to unlock revision");
            }
            return Err(e);
        }
        Ok(true)
    }

    fn remove(&self, revision: &RevisionFolder) -> Result<(), StorageError> {
        let metadata = self.system.metadata();
        let number = revision.revision_number;
        let committed = revision.is_committed(metadata)?;
        if committed {
            let journal = revision.journal(metadata)?.ok_or_else(|| {
                StorageError::corruption(format!("committed revision {number} has no journal"))
            })?;
            for id in journal.changed_ids() {
                self.prune_markers(&id, number)?;
            }
        }
        // Deleting the folder also deletes the lock held on it.
        self.system.root().delete_revision(metadata, revision)?;
        metadata.flush()?;
        self.system.note_revision_deleted(number);
        tracing::info!(revision = number, committed, "revision cleaned up");
        Ok(())
    }

    /// Drop markers of `id` that no session can see any more once
    /// `revision` is gone.
    fn prune_markers(&self, id: &Identifier, revision: u64) -> Result<(), StorageError> {
        let objects = self.system.objects();
        let mut remaining = Vec::new();
        for marker in list_markers(&objects, id)? {
            if marker.revision < revision {
                objects.remove(&marker.id)?;
            } else {
                remaining.push(marker);
            }
        }
        if let Some(oldest) = remaining.last() {
            if oldest.revision == revision && oldest.kind == MarkerKind::Delete {
                objects.remove(&oldest.id)?;
                remaining.pop();
            }
        }
        if remaining.is_empty() {
            self.system.prune_holder(id)?;
        }
        tracing::trace!(%id, revision, remaining = remaining.len(), "markers pruned");
        Ok(())
    }
}

/// Handle of a running background cleanup task.
#[derive(Debug)]
pub(crate) struct CleanupTask {
    notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl CleanupTask {
    /// Request a sweep. Requests made during a sweep coalesce into one more.
    pub(crate) fn notify(&self) {
        self.notify.notify_one();
    }

    /// Stop waiting for requests. A sweep already running completes.
    pub(crate) fn stop(self) {
        self.handle.abort();
    }
}

/// Spawn the background cleanup task for `system` on `runtime`.
pub(crate) fn spawn_cleanup_task(
    runtime: &tokio::runtime::Handle,
    system: Weak<StorageSystem>,
) -> CleanupTask {
    let notify = Arc::new(Notify::new());
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    let handle = runtime.spawn(cleanup_loop(system, Arc::clone(&notify)));
    CleanupTask { notify, handle }
}

/// Runs until the system is dropped or the task is aborted.
async fn cleanup_loop(system: Weak<StorageSystem>, notify: Arc<Notify>) {
    loop {
        notify.notified().await;

        let Some(system) = system.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || system.cleanup()).await {
            Ok(Ok(removed)) => {
                tracing::debug!(removed, "background cleanup done");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "revision cleanup failed");
            }
            Err(e) => {
                tracing::error!(error = %e, "revision cleanup task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::session::SessionMode;
    use crate::testing::Fixture;

    fn commit_one(system: &Arc<StorageSystem>, name: &str) {
        let session = system.begin_session(SessionMode::ReadWrite).expect("begin");
        session.store_entity(&Fixture::new(name, 0)).expect("store");
        session.commit().expect("commit");
    }

    #[test]
    fn test_nothing_to_clean_on_fresh_system() {
        let system = StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).expect("open");
        assert_eq!(system.cleanup().expect("cleanup"), 0);
        assert_eq!(system.available_revisions().expect("revisions").len(), 1);
    }

    #[test]
    fn test_uncommitted_active_revision_blocks_cleanup() {
        let system = StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).expect("open");
        let writer = system.begin_session(SessionMode::ReadWrite).expect("begin");
        commit_one(&system, "a");
        commit_one(&system, "b");
        // Revision 0 is the writer's base and stays pinned.
        assert_eq!(system.cleanup().expect("cleanup"), 0);
        assert_eq!(system.available_revisions().expect("revisions").len(), 4);

        writer.close().expect("close");
        assert_eq!(system.cleanup().expect("cleanup"), 3);
        assert_eq!(system.available_revisions().expect("revisions").len(), 1);
    }

    #[test]
    fn test_pinned_older_snapshot_protects_later_commits() {
        let system = StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).expect("open");
        let early = system.begin_session(SessionMode::ReadWrite).expect("begin");
        let late = system.begin_session(SessionMode::ReadWrite).expect("begin");
        early.store_entity(&Fixture::new("early", 0)).expect("store");
        late.store_entity(&Fixture::new("late", 0)).expect("store");
        // Revision 2 commits before revision 1.
        late.commit().expect("commit");
        let reader = system.begin_session(SessionMode::ReadOnly).expect("begin");
        early.commit().expect("commit");
        commit_one(&system, "after");

        // Revision 0 is gone; revision 1 was committed after the reader's
        // snapshot and must survive while the reader is pinned.
        system.cleanup().expect("cleanup");
        let numbers: Vec<u64> = system
            .available_revisions()
            .expect("revisions")
            .iter()
            .map(|r| r.revision_number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
        reader.close().expect("close");

        system.cleanup().expect("cleanup");
        assert_eq!(system.available_revisions().expect("revisions").len(), 1);
    }

    #[tokio::test]
    async fn test_background_task_cleans_after_commit() {
        let system = StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).expect("open");
        for n in 0..5 {
            commit_one(&system, &format!("entity-{n}"));
        }

        let mut remaining = usize::MAX;
        for _ in 0..200 {
            remaining = system.available_revisions().expect("revisions").len();
            if remaining == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 1);
        system.close().expect("close");
    }

    #[tokio::test]
    async fn test_task_exits_when_system_dropped() {
        let system = StorageSystem::open_with_defaults(Arc::new(MemoryStorage::new())).expect("open");
        let notify = Arc::new(Notify::new());
        let handle = tokio::spawn(cleanup_loop(Arc::downgrade(&system), Arc::clone(&notify)));

        drop(system);
        notify.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "cleanup task should exit when the system is dropped");
    }
}
