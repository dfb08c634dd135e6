//! Upload bodies.
//!
//! Servers may compress or short-circuit predictable bodies, so uploads
//! carry random bytes. Only one 64 KiB block is drawn from the RNG; larger
//! buffers repeat it, which is enough to look incompressible.

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Size of the random block tiled into every payload.
pub const RANDOM_BLOCK_BYTES: usize = 64 * 1024;

/// Build a `size`-byte buffer of random-looking content.
pub fn generate(size: usize) -> Bytes {
    let mut rng = StdRng::from_os_rng();
    let mut block = vec![0u8; RANDOM_BLOCK_BYTES.min(size)];
    rng.fill_bytes(&mut block);

    let mut buf = BytesMut::with_capacity(size);
    while buf.len() < size {
        let take = (size - buf.len()).min(block.len());
        buf.extend_from_slice(&block[..take]);
    }

    buf.freeze()
}

/// One payload generated up front and shared by every upload worker.
///
/// Chunks are zero-copy slices of the same buffer.
#[derive(Debug, Clone)]
pub struct PayloadPool {
    buffer: Bytes,
}

impl PayloadPool {
    pub fn new(max_bytes: u64) -> Self {
        Self { buffer: generate(max_bytes as usize) }
    }

    /// A payload of `bytes` bytes, truncated to the pool's capacity.
    pub fn chunk(&self, bytes: u64) -> Bytes {
        let len = (bytes as usize).min(self.buffer.len());
        self.buffer.slice(..len)
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.len() as u64
    }
}
