//! Process-wide pool of reusable index-entry buffers.
//!
//! Entry collection allocates one scratch buffer per executed query set;
//! pooling keeps those allocations out of the per-request hot path. The pool
//! is an optimization only: correctness never depends on a buffer being
//! reused.

use data_types::IndexEntry;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Capacity of a freshly allocated entry buffer.
const INITIAL_ENTRY_CAPACITY: usize = 1024;

/// The process-wide pool used by every store instance.
pub(crate) fn shared_entry_pool() -> Arc<EntryPool> {
    static POOL: Lazy<Arc<EntryPool>> =
        Lazy::new(|| Arc::new(EntryPool::new(INITIAL_ENTRY_CAPACITY)));
    Arc::clone(&POOL)
}

#[derive(Debug)]
pub(crate) struct EntryPool {
    buffers: Mutex<Vec<Vec<IndexEntry>>>,
    initial_capacity: usize,
    in_use: AtomicUsize,
}

impl EntryPool {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            initial_capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Take a zero-length buffer with retained capacity. The buffer returns
    /// to the pool when the guard drops.
    pub(crate) fn acquire(self: Arc<Self>) -> PooledEntries {
        let buffer = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PooledEntries { pool: self, buffer }
    }

    fn release(&self, mut buffer: Vec<IndexEntry>) {
        buffer.clear();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.buffers.lock().push(buffer);
    }

    /// Number of buffers currently handed out.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

/// RAII guard over a pooled entry buffer.
#[derive(Debug)]
pub(crate) struct PooledEntries {
    pool: Arc<EntryPool>,
    buffer: Vec<IndexEntry>,
}

impl Deref for PooledEntries {
    type Target = Vec<IndexEntry>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledEntries {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledEntries {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize) -> IndexEntry {
        IndexEntry {
            table_name: "t".to_string(),
            hash_value: format!("h{}", i),
            range_value: vec![],
            value: vec![],
        }
    }

    #[test]
    fn acquire_yields_empty_buffer_with_capacity() {
        let pool = Arc::new(EntryPool::new(4));
        let entries = Arc::clone(&pool).acquire();
        assert!(entries.is_empty());
        assert_eq!(entries.capacity(), 4);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn buffers_return_on_drop_and_retain_capacity() {
        let pool = Arc::new(EntryPool::new(4));

        let mut entries = Arc::clone(&pool).acquire();
        for i in 0..32 {
            entries.push(entry(i));
        }
        drop(entries);
        assert_eq!(pool.in_use(), 0);

        let reused = Arc::clone(&pool).acquire();
        assert!(reused.is_empty(), "released buffers come back zero-length");
        assert!(reused.capacity() >= 32, "capacity is retained across reuse");
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = Arc::new(EntryPool::new(4));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut entries = Arc::clone(&pool).acquire();
                        entries.push(entry(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
