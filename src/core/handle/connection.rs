//! Connection handle

use super::child::Lineage;
use super::{
    BackupHandle, BlobHandle, HandleKind, NativeHandle, RawSlot, ReleaseOutcome, StatementHandle,
};
use crate::core::api::{NativeApi, RawPtr, INVALID, SQLITE_DONE, SQLITE_OK, SQLITE_ROW};
use crate::error::{InteropError, Result};
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owns one native database connection
///
/// Statement, backup and blob handles created from a connection remember its
/// generation. Closing the connection finishes its open backups, then bumps
/// the generation, so the remaining children can tell their pointers died
/// with it.
pub struct ConnectionHandle {
    slot: RawSlot,
    lineage: Arc<Lineage>,
    api: Arc<dyn NativeApi>,
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| InteropError::NulInPath(value.to_string()))
}

impl ConnectionHandle {
    /// Wrap an existing raw connection
    ///
    /// With `owns == false` the handle is an alias: releasing it never closes
    /// the connection and never bumps the generation.
    pub fn new(api: Arc<dyn NativeApi>, raw: RawPtr, owns: bool) -> Self {
        Self {
            slot: RawSlot::new(raw, owns),
            lineage: Arc::new(Lineage::default()),
            api,
        }
    }

    /// Open a database through `sqlite3_open_v2`
    pub fn open(api: Arc<dyn NativeApi>, filename: &str, flags: i32) -> Result<Self> {
        let c_filename = c_string(filename)?;
        let mut raw = INVALID;

        // SAFETY: `raw` is an out-pointer; the filename outlives the call
        let rc = unsafe { api.open_v2(&c_filename, flags, &mut raw) };
        if rc != SQLITE_OK {
            // SAFETY: sqlite hands back a connection even on most open
            // failures; it carries the message and still has to be closed
            let message = unsafe { api.errmsg(raw) };
            if !raw.is_null() {
                unsafe { api.close(raw) };
            }
            return Err(InteropError::native(rc, message));
        }

        debug!(filename, api = api.name(), "Opened connection");
        Ok(Self::new(api, raw, true))
    }

    /// Current generation; starts at zero, bumped once per owned close
    pub fn generation(&self) -> u64 {
        self.lineage.generation()
    }

    /// Invalidate every child created so far without closing the connection
    ///
    /// Open backups are finished rather than abandoned; nothing else would
    /// reclaim them.
    pub fn bump_generation(&self) -> u64 {
        self.lineage.finish_backups(self.api.as_ref());
        self.lineage.bump()
    }

    /// Whether this handle owns (and will close) the connection
    pub fn owns(&self) -> bool {
        self.slot.owns()
    }

    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.api
    }

    pub(crate) fn lineage(&self) -> &Arc<Lineage> {
        &self.lineage
    }

    fn live_raw(&self) -> Result<RawPtr> {
        let raw = self.slot.load();
        if raw.is_null() {
            return Err(InteropError::InvalidHandle(HandleKind::Connection.as_str()));
        }
        Ok(raw)
    }

    /// Most recent error message reported on this connection
    pub fn last_error(&self) -> String {
        match self.live_raw() {
            // SAFETY: live connection pointer
            Ok(raw) => unsafe { self.api.errmsg(raw) },
            Err(e) => e.to_string(),
        }
    }

    /// Explicit close; equivalent to [`NativeHandle::release`]
    pub fn close(&self) -> ReleaseOutcome {
        self.release()
    }

    /// Compile one SQL statement
    ///
    /// Anything after the statement other than whitespace or `;` is an
    /// error rather than being silently ignored.
    pub fn prepare(&self, sql: &str) -> Result<StatementHandle> {
        let (statement, consumed) = self.prepare_next(sql)?;
        let rest = sql.get(consumed..).unwrap_or_default();
        if !is_blank_tail(rest) {
            return Err(InteropError::TrailingSql(rest.trim().to_string()));
        }
        statement.ok_or_else(|| InteropError::native(SQLITE_OK, "statement contains no SQL"))
    }

    /// Compile the first statement of `sql`, returning it (if the text held
    /// one) and the number of bytes consumed
    fn prepare_next(&self, sql: &str) -> Result<(Option<StatementHandle>, usize)> {
        let db = self.live_raw()?;
        let mut raw = INVALID;
        let mut consumed = 0;

        // SAFETY: live connection pointer; `raw` and `consumed` are out-params
        let rc = unsafe { self.api.prepare_v2(db, sql, &mut raw, &mut consumed) };
        if rc != SQLITE_OK {
            return Err(InteropError::native(rc, self.last_error()));
        }

        let statement = (!raw.is_null()).then(|| StatementHandle::new(self, raw));
        Ok((statement, consumed.min(sql.len())))
    }

    /// Run every statement in `sql` to completion, discarding rows
    ///
    /// Statements are split by the native parser, so literals and trigger
    /// bodies containing `;` are fine.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let mut rest = sql;
        while !is_blank_tail(rest) {
            let (statement, consumed) = self.prepare_next(rest)?;
            if let Some(statement) = statement {
                while statement.step()? {}
                statement.release();
            }
            if consumed == 0 {
                break;
            }
            rest = rest.get(consumed..).unwrap_or_default();
        }
        Ok(())
    }

    /// Open an incremental blob handle on one cell
    pub fn open_blob(
        &self,
        db_name: &str,
        table: &str,
        column: &str,
        row: i64,
        writable: bool,
    ) -> Result<BlobHandle> {
        let db = self.live_raw()?;
        let (db_name, table, column) = (c_string(db_name)?, c_string(table)?, c_string(column)?);
        let mut raw = INVALID;

        // SAFETY: live connection pointer; names outlive the call
        let rc = unsafe {
            self
                .api
                .blob_open(db, &db_name, &table, &column, row, writable, &mut raw)
        };
        if rc != SQLITE_OK {
            if !raw.is_null() {
                // SAFETY: sqlite may hand back a handle that still needs closing
                unsafe { self.api.blob_close(raw) };
            }
            return Err(InteropError::native(rc, self.last_error()));
        }

        Ok(BlobHandle::new(self, raw))
    }

    /// Start an online backup of this connection's `main` database into
    /// `destination`
    pub fn backup_into(&self, destination: &ConnectionHandle) -> Result<BackupHandle> {
        BackupHandle::init(destination, "main", self, "main")
    }

    /// Whether `sql` yields at least one row
    pub fn query_row_exists(&self, sql: &str) -> Result<bool> {
        let statement = self.prepare(sql)?;
        let found = statement.step()?;
        statement.release();
        Ok(found)
    }
}

impl NativeHandle for ConnectionHandle {
    fn kind(&self) -> HandleKind {
        HandleKind::Connection
    }

    fn as_raw(&self) -> RawPtr {
        self.slot.load()
    }

    fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    fn release(&self) -> ReleaseOutcome {
        if self.slot.is_closed() {
            return ReleaseOutcome::AlreadyClosed;
        }

        let (lineage, api) = (&self.lineage, self.api.as_ref());
        let outcome = self.slot.release_with(HandleKind::Connection, |raw| {
            let finished = lineage.finish_backups(api);
            // Children must see the new generation before the pointer dies
            let generation = lineage.bump();
            debug!(generation, finished_backups = finished, "Closing connection");
            // SAFETY: `raw` is the live connection this slot owned
            unsafe { api.close(raw) }
        });

        if let ReleaseOutcome::Failed(code) = outcome {
            warn!(code, "Connection close failed; handle is closed regardless");
        }
        outcome
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("slot", &self.slot)
            .field("generation", &self.generation())
            .field("api", &self.api.name())
            .finish()
    }
}

fn is_blank_tail(sql: &str) -> bool {
    sql.chars().all(|c| c.is_whitespace() || c == ';')
}

/// Drive a statement step, mapping status codes
pub(crate) fn step_status(rc: i32) -> Option<bool> {
    match rc {
        SQLITE_ROW => Some(true),
        SQLITE_DONE => Some(false),
        _ => None,
    }
}
