//! Shared helpers for retrieval integration tests.

// Not all test binaries use every helper
#![allow(dead_code)]

use bytes::Bytes;
use oxblock_retrieval::{BlockPointer, FetchContext, FetchError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pointer for a block whose contents are `name`.
pub fn block(name: &str) -> BlockPointer {
    BlockPointer::for_content(name.as_bytes())
}

/// In-memory block store that counts fetches per block.
#[derive(Default)]
pub struct MemoryStore {
    blocks: HashMap<BlockPointer, Bytes>,
    fetches: Mutex<HashMap<BlockPointer, usize>>,
    order: Mutex<Vec<BlockPointer>>,
    total: AtomicUsize,
}

impl MemoryStore {
    pub fn with_blocks<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let blocks = names
            .into_iter()
            .map(|name| (block(name), Bytes::copy_from_slice(name.as_bytes())))
            .collect();
        Self {
            blocks,
            ..Default::default()
        }
    }

    pub fn fetch(&self, _ctx: &FetchContext, ptr: &BlockPointer) -> Result<Bytes, FetchError> {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.fetches.lock().entry(*ptr).or_default() += 1;
        self.order.lock().push(*ptr);
        self.blocks
            .get(ptr)
            .cloned()
            .ok_or_else(|| FetchError::msg(format!("block {ptr} not found")))
    }

    pub fn fetch_count(&self, ptr: &BlockPointer) -> usize {
        self.fetches.lock().get(ptr).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn fetch_order(&self) -> Vec<BlockPointer> {
        self.order.lock().clone()
    }
}
