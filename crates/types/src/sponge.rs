//! Absorb/squeeze sponge over SHA3-256 and Keccak-256.
//!
//! Input and output lengths must be multiples of [`HASH_LENGTH`]. The S256
//! mode squeezes all zeros while everything absorbed so far was zero, so an
//! empty transaction hashes to [`Hash::NULL`](crate::Hash::NULL).

use sha3::{Digest, Keccak256, Sha3_256};

/// Width of one absorbed or squeezed block.
pub const HASH_LENGTH: usize = 32;

/// Errors raised by the sponge and the signature primitives built on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Illegal length {0}: must be a multiple of {HASH_LENGTH}")]
    IllegalLength(usize),

    #[error("Illegal security level {0}")]
    IllegalSecurity(usize),

    #[error("Illegal Merkle depth {0}")]
    IllegalDepth(usize),

    #[error("Key index {index} out of range for depth {depth}")]
    KeyIndexOutOfRange { index: u64, depth: usize },

    #[error("Malformed keyfile: {0}")]
    Keyfile(String),
}

/// Sponge construction selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpongeMode {
    /// SHA3-256 with the all-zero rule.
    S256,
    /// Keccak-256.
    K256,
}

#[derive(Clone)]
enum Inner {
    S256(Sha3_256),
    K256(Keccak256),
}

/// A resettable sponge.
#[derive(Clone)]
pub struct Sponge {
    inner: Inner,
    only_zeros: bool,
}

impl Sponge {
    pub fn new(mode: SpongeMode) -> Self {
        let inner = match mode {
            SpongeMode::S256 => Inner::S256(Sha3_256::new()),
            SpongeMode::K256 => Inner::K256(Keccak256::new()),
        };
        Self {
            inner,
            only_zeros: true,
        }
    }

    pub fn mode(&self) -> SpongeMode {
        match self.inner {
            Inner::S256(_) => SpongeMode::S256,
            Inner::K256(_) => SpongeMode::K256,
        }
    }

    /// Absorb `bytes`, one block at a time.
    pub fn absorb(&mut self, bytes: &[u8]) -> Result<(), CryptoError> {
        if bytes.len() % HASH_LENGTH != 0 {
            return Err(CryptoError::IllegalLength(bytes.len()));
        }
        for block in bytes.chunks_exact(HASH_LENGTH) {
            match &mut self.inner {
                Inner::S256(h) => Digest::update(h, block),
                Inner::K256(h) => Digest::update(h, block),
            }
        }
        self.only_zeros = self.only_zeros && bytes.iter().all(|&b| b == 0);
        Ok(())
    }

    /// Fill `out` with squeezed blocks.
    ///
    /// Each block is the digest of the state so far, which is then fed back
    /// into the state before the next block.
    pub fn squeeze(&mut self, out: &mut [u8]) -> Result<(), CryptoError> {
        if out.len() % HASH_LENGTH != 0 {
            return Err(CryptoError::IllegalLength(out.len()));
        }
        if self.only_zeros && self.mode() == SpongeMode::S256 {
            out.fill(0);
            return Ok(());
        }
        for block in out.chunks_exact_mut(HASH_LENGTH) {
            match &mut self.inner {
                Inner::S256(h) => {
                    block.copy_from_slice(&h.finalize_reset());
                    Digest::update(h, &*block);
                }
                Inner::K256(h) => {
                    block.copy_from_slice(&h.finalize_reset());
                    Digest::update(h, &*block);
                }
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        match &mut self.inner {
            Inner::S256(h) => Digest::reset(h),
            Inner::K256(h) => Digest::reset(h),
        }
        self.only_zeros = true;
    }

    /// Absorb `input` into a fresh state and squeeze one block.
    pub fn digest(mode: SpongeMode, input: &[u8]) -> Result<[u8; HASH_LENGTH], CryptoError> {
        let mut sponge = Self::new(mode);
        sponge.absorb(input)?;
        let mut out = [0u8; HASH_LENGTH];
        sponge.squeeze(&mut out)?;
        Ok(out)
    }
}
