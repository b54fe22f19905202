//! Named memory arenas.
//!
//! An arena pins every allocation made through it for at least its own
//! lifetime: the private context arena dies with its GPU context, the result
//! arena with the invocation that asked for materialization.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub struct Arena {
    name: String,
    blocks: Mutex<Vec<Arc<[u8]>>>,
    allocated: AtomicUsize,
}

impl Arena {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy `bytes` into the arena. The returned handle stays valid for as
    /// long as either the caller or the arena keeps it alive.
    pub fn store(&self, bytes: &[u8]) -> Arc<[u8]> {
        let block: Arc<[u8]> = Arc::from(bytes);
        self.allocated.fetch_add(block.len(), Ordering::Relaxed);
        self.blocks.lock().push(block.clone());
        block
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Drop every allocation owned by the arena.
    pub fn reset(&self) {
        self.blocks.lock().clear();
        self.allocated.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("allocated", &self.allocated())
            .finish()
    }
}
