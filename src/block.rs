//! File blocks and their FNV-1a fingerprints
//!
//! Files are split into fixed-size blocks and addressed by a 64-bit
//! non-cryptographic fingerprint. FNV-1a is fast enough to rehash a
//! directory on every scan; collisions are acceptable at block
//! granularity and callers that need certainty use [`Block::deep_equals`].

use fnv::FnvHasher;
use std::fs::File;
use std::hash::Hasher;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Size of each file block in bytes.
pub const BLOCK_SIZE: usize = 1024 * 1024; // 1 MiB

// 256KB: optimal for SSD read-ahead when slicing
const SLICE_BUFFER_SIZE: usize = 256 * 1024;

/// Compute the FNV-1a fingerprint of a byte slice.
///
/// Empty input yields the FNV-1a offset basis.
pub fn fingerprint(content: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(content);
    hasher.finish()
}

/// A contiguous chunk of a file, at most [`BLOCK_SIZE`] bytes long.
///
/// The fingerprint is computed once at construction.
#[derive(Debug, Clone)]
pub struct Block {
    content: Vec<u8>,
    fingerprint: u64,
}

impl Block {
    pub fn new(content: Vec<u8>) -> Self {
        let fingerprint = fingerprint(&content);
        Self { content, fingerprint }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Number of bytes in the block.
    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    /// Fingerprint-only comparison.
    pub fn equals(&self, other: &Block) -> bool {
        self.fingerprint == other.fingerprint
    }

    /// Byte-wise comparison, short-circuited by a fingerprint mismatch.
    pub fn deep_equals(&self, other: &Block) -> bool {
        self.equals(other) && self.content == other.content
    }
}

/// Number of blocks a file of `size` bytes slices into.
pub fn block_count(size: u64) -> usize {
    (size as usize).div_ceil(BLOCK_SIZE)
}

/// Slice a file into blocks of exactly [`BLOCK_SIZE`] bytes, except
/// possibly the last. A zero-length file produces no blocks.
pub fn slice_file(path: &Path) -> io::Result<Vec<Block>> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(SLICE_BUFFER_SIZE, file);
    let mut blocks = Vec::new();

    loop {
        let mut content = Vec::with_capacity(BLOCK_SIZE);
        let n = reader
            .by_ref()
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut content)?;
        if n == 0 {
            break;
        }
        blocks.push(Block::new(content));
        if n < BLOCK_SIZE {
            break;
        }
    }

    Ok(blocks)
}
