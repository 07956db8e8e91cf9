//! # Thread Registry
//!
//! Maps thread ids to live threads. Entries are weak: the registry never
//! keeps a thread alive.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use spin::{Lazy, Mutex};

use super::thread::{Thread, ThreadId};

static THREADS: Lazy<Mutex<HashMap<u32, Weak<Thread>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate an id not used by any live thread
pub(crate) fn allocate_id() -> ThreadId {
    loop {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            continue;
        }
        let threads = THREADS.lock();
        let taken = threads.get(&id).is_some_and(|w| w.strong_count() > 0);
        if !taken {
            return ThreadId(id);
        }
    }
}

pub(crate) fn insert(thread: &Arc<Thread>) {
    THREADS
        .lock()
        .insert(thread.id().as_u32(), Arc::downgrade(thread));
}

/// Remove `thread`'s own entry
pub(crate) fn remove(thread: &Thread) {
    let mut threads = THREADS.lock();
    let id = thread.id().as_u32();
    let own = threads
        .get(&id)
        .is_some_and(|w| core::ptr::eq(w.as_ptr(), thread));
    if own {
        threads.remove(&id);
    }
}

/// Drop the entry for `id` if its thread is gone
pub(crate) fn remove_stale(id: ThreadId) {
    let mut threads = THREADS.lock();
    let stale = threads
        .get(&id.as_u32())
        .is_some_and(|w| w.strong_count() == 0);
    if stale {
        threads.remove(&id.as_u32());
    }
}

/// Find a live thread by id
pub fn find_by_id(id: ThreadId) -> Option<Arc<Thread>> {
    THREADS.lock().get(&id.as_u32()).and_then(Weak::upgrade)
}

/// Number of live threads
pub fn count() -> usize {
    THREADS
        .lock()
        .values()
        .filter(|w| w.strong_count() > 0)
        .count()
}

/// Snapshot of all live threads
pub fn snapshot() -> Vec<Arc<Thread>> {
    let threads = THREADS.lock();
    threads.values().filter_map(Weak::upgrade).collect()
}
