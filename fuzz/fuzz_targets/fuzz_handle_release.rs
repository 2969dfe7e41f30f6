#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parking_lot::Mutex;
use sqlite_interop::{ConnectionHandle, NativeApi, NativeHandle, RawPtr};
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Arbitrary, Debug)]
enum Op {
    Prepare,
    OpenBlob,
    ReleaseChild(u8),
    DropChild(u8),
    BumpGeneration,
    CloseConnection,
}

/// Fake library: distinct pointers, every release call tallied
#[derive(Default)]
struct TallyApi {
    next: AtomicUsize,
    releases: Mutex<HashMap<usize, usize>>,
}

impl TallyApi {
    fn fabricate(&self) -> RawPtr {
        (0x1000 + self.next.fetch_add(1, Ordering::Relaxed) * 16) as RawPtr
    }

    fn tally(&self, raw: RawPtr) -> i32 {
        *self.releases.lock().entry(raw as usize).or_default() += 1;
        0
    }
}

impl NativeApi for TallyApi {
    fn name(&self) -> &str {
        "tally"
    }
    fn libversion(&self) -> String {
        String::new()
    }
    unsafe fn open_v2(&self, _: &CStr, _: i32, out: &mut RawPtr) -> i32 {
        *out = self.fabricate();
        0
    }
    unsafe fn close(&self, db: RawPtr) -> i32 {
        self.tally(db)
    }
    unsafe fn errmsg(&self, _: RawPtr) -> String {
        String::new()
    }
    unsafe fn prepare_v2(&self, _: RawPtr, sql: &str, out: &mut RawPtr, used: &mut usize) -> i32 {
        *used = sql.len();
        *out = self.fabricate();
        0
    }
    unsafe fn step(&self, _: RawPtr) -> i32 {
        101
    }
    unsafe fn finalize(&self, stmt: RawPtr) -> i32 {
        self.tally(stmt)
    }
    unsafe fn backup_init(&self, _: RawPtr, _: &CStr, _: RawPtr, _: &CStr) -> RawPtr {
        self.fabricate()
    }
    unsafe fn backup_step(&self, _: RawPtr, _: i32) -> i32 {
        101
    }
    unsafe fn backup_finish(&self, backup: RawPtr) -> i32 {
        self.tally(backup)
    }
    unsafe fn blob_open(
        &self,
        _: RawPtr,
        _: &CStr,
        _: &CStr,
        _: &CStr,
        _: i64,
        _: bool,
        out: &mut RawPtr,
    ) -> i32 {
        *out = self.fabricate();
        0
    }
    unsafe fn blob_bytes(&self, _: RawPtr) -> i32 {
        0
    }
    unsafe fn blob_close(&self, blob: RawPtr) -> i32 {
        self.tally(blob)
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let api = Arc::new(TallyApi::default());
    let conn = ConnectionHandle::new(api.clone(), api.fabricate(), true);
    let mut children: Vec<Option<Box<dyn NativeHandle>>> = Vec::new();

    for op in ops.into_iter().take(256) {
        match op {
            Op::Prepare => {
                if let Ok(stmt) = conn.prepare("SELECT 1") {
                    children.push(Some(Box::new(stmt)));
                }
            }
            Op::OpenBlob => {
                if let Ok(blob) = conn.open_blob("main", "t", "c", 1, false) {
                    children.push(Some(Box::new(blob)));
                }
            }
            Op::ReleaseChild(i) if !children.is_empty() => {
                let len = children.len();
                if let Some(child) = &children[i as usize % len] {
                    child.release();
                    assert!(child.is_closed());
                }
            }
            Op::DropChild(i) if !children.is_empty() => {
                let len = children.len();
                children[i as usize % len].take();
            }
            Op::BumpGeneration => {
                conn.bump_generation();
            }
            Op::CloseConnection => {
                conn.close();
            }
            _ => {}
        }
    }

    drop(children);
    drop(conn);

    let releases = api.releases.lock();
    assert!(releases.values().all(|&n| n == 1));
});
