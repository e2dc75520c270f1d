//! Block identifiers.
//!
//! Blocks are content-addressed: a [`BlockId`] is the SHA-256 digest of the
//! block's contents. A [`BlockPointer`] locates one block and is the key the
//! retrieval queue coalesces requests on.

use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a block identifier in bytes.
pub const BLOCK_ID_LEN: usize = 32;

/// Content hash identifying a unique block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    /// Create an identifier from raw digest bytes.
    pub const fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier for the given block contents.
    pub fn from_content(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "BlockId({})", &hex::encode(&self.0[..8]))
    }
}

/// Pointer to a block: its content identifier plus the key generation it
/// was encrypted under.
///
/// Two pointers are the same block for scheduling purposes only if both
/// fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPointer {
    id: BlockId,
    key_gen: u32,
}

impl BlockPointer {
    /// Create a pointer from its parts.
    pub const fn new(id: BlockId, key_gen: u32) -> Self {
        Self { id, key_gen }
    }

    /// Pointer to the block with the given contents under key generation 1.
    pub fn for_content(content: &[u8]) -> Self {
        Self::new(BlockId::from_content(content), 1)
    }

    /// The block's content identifier.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Key generation of the block.
    pub fn key_gen(&self) -> u32 {
        self.key_gen
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.key_gen)
    }
}
