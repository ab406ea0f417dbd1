#![forbid(unsafe_code)]
//! Journal transactions, credits and COW bookkeeping for SnapFS.
//!
//! The host journal itself (descriptor blocks, commit records, replay)
//! is an external collaborator; this crate models the parts the
//! snapshot core consumes:
//!
//! - transaction handles with credit accounting and extend-or-restart,
//! - the update barrier (`lock_updates`) that take/deactivate hold so
//!   the active-snapshot pointer only changes with no handle in flight,
//! - committed pre-images of bitmap blocks saved by undo access, which
//!   COW-bitmap materialization reads so a snapshot reflects the state
//!   before the running transaction,
//! - the per-transaction "already COWed" mark for each buffer,
//! - the pending-COW rendezvous for snapshot buffers mid-copy.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sfs_error::Result;
use sfs_types::{BlockNr, TxnId};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Journal credits one COW consumes: the snapshot bitmap write, one map
/// block, the snapshot inode record, and the copied data block.
pub const COW_TRANS_BLOCKS: u32 = 4;

/// Default transaction size for large lifecycle operations; extend
/// requests below this are rounded up to it.
pub const MAX_TRANS_DATA: u32 = 64;

/// The journal, reduced to the interfaces the snapshot core consumes.
#[derive(Debug)]
pub struct Journal {
    tid: AtomicU64,
    /// Handles hold this for read; `lock_updates` takes it for write.
    barrier: RwLock<()>,
    /// Largest credit total one handle may accumulate before extend
    /// requests fall back to a restart.
    max_handle_credits: u32,
    /// Pre-images of journaled blocks captured by undo access at their
    /// first modification in the running transaction.
    committed: Mutex<HashMap<u32, Vec<u8>>>,
    /// Buffer -> transaction that already COWed it.
    cow_marks: Mutex<HashMap<u32, TxnId>>,
    /// Snapshot-file blocks whose COW copy is still being written.
    pending_cow: Mutex<HashSet<u32>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(8 * MAX_TRANS_DATA)
    }
}

impl Journal {
    #[must_use]
    pub fn new(max_handle_credits: u32) -> Self {
        Self {
            tid: AtomicU64::new(1),
            barrier: RwLock::new(()),
            max_handle_credits,
            committed: Mutex::new(HashMap::new()),
            cow_marks: Mutex::new(HashMap::new()),
            pending_cow: Mutex::new(HashSet::new()),
        }
    }

    /// Id of the running transaction.
    #[must_use]
    pub fn current_tid(&self) -> TxnId {
        TxnId(self.tid.load(Ordering::Acquire))
    }

    /// Start a handle on the running transaction with `credits` buffer
    /// credits. Blocks while `lock_updates` is held.
    #[must_use]
    pub fn start(&self, credits: u32) -> Handle<'_> {
        let guard = self.barrier.read();
        let tid = self.current_tid();
        trace!(target: "sfs::journal", tid = tid.0, credits, "handle start");
        Handle {
            journal: self,
            _barrier: guard,
            tid: Cell::new(tid),
            credits: Cell::new(credits),
            cowing: Cell::new(false),
        }
    }

    /// Block until no transaction handle is in flight and prevent new
    /// ones from starting. The active-snapshot pointer may only change
    /// while this guard is held.
    #[must_use]
    pub fn lock_updates(&self) -> UpdatesLock<'_> {
        let guard = self.barrier.write();
        debug!(target: "sfs::journal", tid = self.current_tid().0, "journal updates locked");
        UpdatesLock { _guard: guard }
    }

    /// Commit the running transaction: bump the id and invalidate all
    /// per-transaction state (COW marks, committed pre-images).
    pub fn commit_transaction(&self) {
        let old = self.tid.fetch_add(1, Ordering::AcqRel);
        self.cow_marks.lock().clear();
        self.committed.lock().clear();
        debug!(target: "sfs::journal", old_tid = old, "transaction committed");
    }

    // ── Committed pre-images ────────────────────────────────────────────

    /// Record the pre-image of `block` if this is its first modification
    /// in the running transaction.
    pub fn save_committed(&self, block: BlockNr, data: &[u8]) {
        self.committed
            .lock()
            .entry(block.0)
            .or_insert_with(|| data.to_vec());
    }

    /// The committed (pre-transaction) copy of `block`, if one exists.
    #[must_use]
    pub fn committed_copy(&self, block: BlockNr) -> Option<Vec<u8>> {
        self.committed.lock().get(&block.0).cloned()
    }

    // ── Per-transaction COW marks ───────────────────────────────────────

    /// Whether `block`'s buffer was already COWed in transaction `tid`.
    #[must_use]
    pub fn test_cowed(&self, block: BlockNr, tid: TxnId) -> bool {
        self.cow_marks.lock().get(&block.0) == Some(&tid)
    }

    /// Mark `block`'s buffer as COWed in transaction `tid`.
    pub fn mark_cowed(&self, block: BlockNr, tid: TxnId) {
        self.cow_marks.lock().insert(block.0, tid);
    }

    // ── Pending-COW rendezvous ──────────────────────────────────────────

    /// Mark a newly allocated snapshot buffer as mid-copy.
    pub fn begin_pending_cow(&self, snapshot_block: BlockNr) {
        self.pending_cow.lock().insert(snapshot_block.0);
    }

    /// Publish a finished COW copy.
    pub fn end_pending_cow(&self, snapshot_block: BlockNr) {
        self.pending_cow.lock().remove(&snapshot_block.0);
    }

    /// Wait until any pending COW of `snapshot_block` completes.
    ///
    /// Happens at most once per block per snapshot, so short sleeps are
    /// sufficient and a wait queue is not cost-justified.
    pub fn wait_pending_cow(&self, snapshot_block: BlockNr) {
        while self.pending_cow.lock().contains(&snapshot_block.0) {
            trace!(
                target: "sfs::journal",
                block = snapshot_block.0,
                "waiting for pending COW"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Guard returned by [`Journal::lock_updates`].
#[derive(Debug)]
pub struct UpdatesLock<'j> {
    _guard: RwLockWriteGuard<'j, ()>,
}

/// A transaction handle. One per task; not shared across threads.
#[derive(Debug)]
pub struct Handle<'j> {
    journal: &'j Journal,
    _barrier: RwLockReadGuard<'j, ()>,
    tid: Cell<TxnId>,
    credits: Cell<u32>,
    cowing: Cell<bool>,
}

impl Handle<'_> {
    #[must_use]
    pub fn tid(&self) -> TxnId {
        self.tid.get()
    }

    #[must_use]
    pub fn credits(&self) -> u32 {
        self.credits.get()
    }

    /// Whether this handle is inside a COW operation (re-entrancy guard).
    #[must_use]
    pub fn cowing(&self) -> bool {
        self.cowing.get()
    }

    pub fn set_cowing(&self, cowing: bool) {
        self.cowing.set(cowing);
    }

    /// Whether `nblocks` credits remain on this handle.
    #[must_use]
    pub fn has_credits(&self, nblocks: u32) -> bool {
        self.credits.get() >= nblocks
    }

    /// Consume `nblocks` credits. A shortfall is tolerated but logged:
    /// the lower-bound credit heuristics can under-estimate, and the
    /// enclosing operation is expected to extend or restart.
    pub fn use_credits(&self, nblocks: u32) {
        let have = self.credits.get();
        if have < nblocks {
            warn!(
                target: "sfs::journal",
                have,
                need = nblocks,
                "insufficient buffer credits for operation"
            );
            self.credits.set(0);
        } else {
            self.credits.set(have - nblocks);
        }
    }

    /// Ensure at least `nblocks` credits, extending the handle or, when
    /// the extension would exceed the journal's cap, committing the
    /// running transaction and restarting on the next one.
    pub fn extend_or_restart(&self, nblocks: u32) -> Result<()> {
        if self.has_credits(nblocks) {
            return Ok(());
        }
        let request = nblocks.max(MAX_TRANS_DATA);
        if self.credits.get().saturating_add(request) <= self.journal.max_handle_credits {
            self.credits.set(self.credits.get() + request);
            trace!(target: "sfs::journal", added = request, "handle extended");
            return Ok(());
        }
        // Restart: commit what we have and continue on a fresh transaction.
        self.journal.commit_transaction();
        let tid = self.journal.current_tid();
        self.tid.set(tid);
        self.credits.set(request);
        debug!(target: "sfs::journal", tid = tid.0, credits = request, "handle restarted");
        Ok(())
    }

}

// ── Tests ───────────────────────────────────────────────────────────────────
