//! Shared core of statement, backup and blob handles

use super::connection::ConnectionHandle;
use super::{HandleKind, RawSlot, ReleaseOutcome};
use crate::core::api::{NativeApi, RawPtr};
use crate::error::{InteropError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// State one native connection shares with every handle created from it
///
/// Lives as long as the longest-lived of them, so dropping a non-owning
/// alias does not make its children look orphaned.
#[derive(Default)]
pub(crate) struct Lineage {
    generation: AtomicU64,
    backups: Mutex<Vec<Weak<RawSlot>>>,
}

impl Lineage {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Track a backup that reads from or writes to this connection
    pub(crate) fn register_backup(&self, slot: &Arc<RawSlot>) {
        let mut backups = self.backups.lock();
        backups.retain(|b| b.upgrade().is_some_and(|s| !s.is_closed()));
        backups.push(Arc::downgrade(slot));
    }

    /// Finish every tracked backup that is still open
    ///
    /// A backup keeps both of its connections alive inside the library, so
    /// neither side can really close while one is pending.
    pub(crate) fn finish_backups(&self, api: &dyn NativeApi) -> usize {
        let pending: Vec<Arc<RawSlot>> = self
            .backups
            .lock()
            .drain(..)
            .filter_map(|b| b.upgrade())
            .collect();

        pending
            .iter()
            .map(|slot| {
                // SAFETY: the slot hands over its pointer at most once
                slot.release_with(HandleKind::Backup, |raw| unsafe { api.backup_finish(raw) })
            })
            .filter(|outcome| outcome.invoked_native())
            .count()
    }

    #[cfg(test)]
    pub(crate) fn tracked_backups(&self) -> usize {
        self.backups.lock().len()
    }
}

/// Back-reference to a connection's lineage plus the generation it had
/// when the child was created
pub(crate) struct ParentRef {
    lineage: Arc<Lineage>,
    generation: u64,
}

impl ParentRef {
    pub(crate) fn snapshot(connection: &ConnectionHandle) -> Self {
        Self {
            lineage: Arc::clone(connection.lineage()),
            generation: connection.generation(),
        }
    }

    /// Whether the connection is still at the snapshotted generation
    pub(crate) fn is_current(&self) -> bool {
        self.lineage.generation() == self.generation
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

pub(crate) struct ChildCore {
    slot: Arc<RawSlot>,
    parent: ParentRef,
    api: Arc<dyn NativeApi>,
}

impl ChildCore {
    pub(crate) fn new(connection: &ConnectionHandle, raw: RawPtr) -> Self {
        Self {
            slot: Arc::new(RawSlot::new(raw, true)),
            parent: ParentRef::snapshot(connection),
            api: Arc::clone(connection.api()),
        }
    }

    pub(crate) fn slot(&self) -> &Arc<RawSlot> {
        &self.slot
    }

    pub(crate) fn api(&self) -> &dyn NativeApi {
        self.api.as_ref()
    }

    pub(crate) fn raw(&self) -> RawPtr {
        self.slot.load()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    pub(crate) fn is_stale(&self) -> bool {
        !self.parent.is_current()
    }

    pub(crate) fn parent_generation(&self) -> u64 {
        self.parent.generation()
    }

    /// Raw pointer for a native call, refusing released or stale handles
    pub(crate) fn live_raw(&self, kind: HandleKind) -> Result<RawPtr> {
        let raw = self.slot.load();
        if raw.is_null() || self.is_stale() {
            return Err(InteropError::InvalidHandle(kind.as_str()));
        }
        Ok(raw)
    }

    /// Release protocol for child handles
    pub(crate) fn release<F>(&self, kind: HandleKind, native: F) -> ReleaseOutcome
    where
        F: FnOnce(&dyn NativeApi, RawPtr) -> i32,
    {
        if self.slot.is_closed() {
            return ReleaseOutcome::AlreadyClosed;
        }

        if self.is_stale() {
            self.slot.invalidate();
            debug!(
                handle = %kind,
                generation = self.parent.generation(),
                "Parent connection moved on, skipping native release"
            );
            return ReleaseOutcome::Stale;
        }

        let api = self.api.as_ref();
        self.slot.release_with(kind, |raw| native(api, raw))
    }
}

impl fmt::Debug for ChildCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildCore")
            .field("slot", &self.slot)
            .field("generation", &self.parent.generation())
            .field("api", &self.api.name())
            .finish()
    }
}
