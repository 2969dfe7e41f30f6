//! Shared test doubles

#![allow(dead_code)]

use parking_lot::Mutex;
use sqlite_interop::{NativeApi, RawPtr, Result};
use sqlite_interop::{DynamicLoader, InteropError, LoadedModule};
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

const SQLITE_OK: i32 = 0;
const SQLITE_DONE: i32 = 101;

/// Native API stand-in that hands out distinct fake pointers and counts
/// every release call per pointer
pub struct CountingApi {
    next: AtomicUsize,
    pub fail_with: AtomicI32,
    calls: Mutex<HashMap<&'static str, Vec<usize>>>,
}

impl CountingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicUsize::new(0x10_000),
            fail_with: AtomicI32::new(SQLITE_OK),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn fabricate(&self) -> RawPtr {
        self.next.fetch_add(0x10, Ordering::Relaxed) as RawPtr
    }

    pub fn count(&self, function: &str) -> usize {
        self.calls.lock().get(function).map(Vec::len).unwrap_or(0)
    }

    pub fn released(&self, function: &str, raw: RawPtr) -> usize {
        self.calls
            .lock()
            .get(function)
            .map(|v| v.iter().filter(|&&p| p == raw as usize).count())
            .unwrap_or(0)
    }

    /// Largest number of release calls recorded for any single pointer
    pub fn max_per_pointer(&self) -> usize {
        let calls = self.calls.lock();
        let mut per_pointer: HashMap<usize, usize> = HashMap::new();
        for pointers in calls.values() {
            for &p in pointers {
                *per_pointer.entry(p).or_default() += 1;
            }
        }
        per_pointer.values().copied().max().unwrap_or(0)
    }

    fn record(&self, function: &'static str, raw: RawPtr) -> i32 {
        self.calls.lock().entry(function).or_default().push(raw as usize);
        self.fail_with.load(Ordering::Relaxed)
    }
}

impl NativeApi for CountingApi {
    fn name(&self) -> &str {
        "counting"
    }

    fn libversion(&self) -> String {
        "0.0.0-test".to_string()
    }

    unsafe fn open_v2(&self, _filename: &CStr, _flags: i32, out: &mut RawPtr) -> i32 {
        *out = self.fabricate();
        SQLITE_OK
    }

    unsafe fn close(&self, db: RawPtr) -> i32 {
        self.record("close", db)
    }

    unsafe fn errmsg(&self, _db: RawPtr) -> String {
        "test error".to_string()
    }

    unsafe fn prepare_v2(
        &self,
        _db: RawPtr,
        sql: &str,
        out: &mut RawPtr,
        consumed: &mut usize,
    ) -> i32 {
        *consumed = sql.len();
        *out = self.fabricate();
        SQLITE_OK
    }

    unsafe fn step(&self, _stmt: RawPtr) -> i32 {
        SQLITE_DONE
    }

    unsafe fn finalize(&self, stmt: RawPtr) -> i32 {
        self.record("finalize", stmt)
    }

    unsafe fn backup_init(
        &self,
        _dest: RawPtr,
        _dest_name: &CStr,
        _source: RawPtr,
        _source_name: &CStr,
    ) -> RawPtr {
        self.fabricate()
    }

    unsafe fn backup_step(&self, _backup: RawPtr, _pages: i32) -> i32 {
        SQLITE_DONE
    }

    unsafe fn backup_finish(&self, backup: RawPtr) -> i32 {
        self.record("backup_finish", backup)
    }

    unsafe fn blob_open(
        &self,
        _db: RawPtr,
        _db_name: &CStr,
        _table: &CStr,
        _column: &CStr,
        _row: i64,
        _writable: bool,
        out: &mut RawPtr,
    ) -> i32 {
        *out = self.fabricate();
        SQLITE_OK
    }

    unsafe fn blob_bytes(&self, _blob: RawPtr) -> i32 {
        0
    }

    unsafe fn blob_close(&self, blob: RawPtr) -> i32 {
        self.record("blob_close", blob)
    }
}

struct FakeModule(PathBuf);

impl LoadedModule for FakeModule {
    fn path(&self) -> &Path {
        &self.0
    }

    fn symbol(&self, _name: &CStr) -> Option<*mut c_void> {
        None
    }
}

/// Loader that "loads" any existing file and remembers what it was asked for
#[derive(Default)]
pub struct RecordingLoader {
    pub requests: Mutex<Vec<PathBuf>>,
}

impl RecordingLoader {
    pub fn loads(&self) -> usize {
        self.requests.lock().len()
    }
}

impl DynamicLoader for RecordingLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>> {
        self.requests.lock().push(path.to_path_buf());
        if !path.is_file() {
            return Err(InteropError::Load {
                path: path.to_path_buf(),
                message: "no such file".into(),
            });
        }
        Ok(Arc::new(FakeModule(path.to_path_buf())))
    }
}

/// Write a placeholder native library at `<base>/<sub>/<file>`
pub fn place_library(base: &Path, sub: &str, file: &str) -> PathBuf {
    let path = base.join(sub).join(file);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"\x7fELF placeholder").unwrap();
    path
}
