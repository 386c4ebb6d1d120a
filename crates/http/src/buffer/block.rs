//! Fixed-size pooled memory blocks.
//!
//! Every buffer tier and the tunnel copy loops share the same 2 KiB block
//! size. Blocks are checked out of a [`BlockPool`] and return themselves on
//! drop, so every exit path (success or failure) releases its storage.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Size in bytes of every pooled memory block.
pub const BLOCK_SIZE: usize = 2048;

type BlockData = Box<[u8; BLOCK_SIZE]>;

/// A shared pool of fixed-size memory blocks.
///
/// The pool is cheap to clone (it is a handle) and is passed into the
/// constructors of everything that needs scratch storage. Checked-out
/// blocks are exclusively owned until dropped; dropping a [`Block`]
/// returns its storage to the pool.
#[derive(Clone, Default)]
pub struct BlockPool {
    free: Arc<Mutex<Vec<BlockData>>>,
}

impl BlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks a block out of the pool, allocating a fresh one when the pool
    /// runs cold.
    pub fn checkout(&self) -> Block {
        let data = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };

        let data = data.unwrap_or_else(|| Box::new([0u8; BLOCK_SIZE]));
        Block { data: Some(data), pool: self.clone() }
    }

    fn release(&self, data: BlockData) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(data);
    }

    #[cfg(test)]
    pub(crate) fn idle_blocks(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("BlockPool").field("idle", &free.len()).finish()
    }
}

/// An exclusively-owned memory block checked out of a [`BlockPool`].
///
/// Dereferences to its full `BLOCK_SIZE` byte array; fill levels are
/// tracked by the owner, not the block.
pub struct Block {
    data: Option<BlockData>,
    pool: BlockPool,
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // data is only None after drop
        &self.data.as_ref().unwrap()[..]
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data.as_mut().unwrap()[..]
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("size", &BLOCK_SIZE).finish()
    }
}
