//! Fixed-layout transactions and their mutable metadata.
//!
//! A transaction is 768 bytes. Numeric fields are big-endian.
//!
//! ```text
//! offset  size  field
//!      0   512  signature / message fragment
//!    512    32  address          ┐
//!    544     8  value            │
//!    552    32  bundle nonce     │ essence (96 bytes, hashed into the bundle hash)
//!    584     8  timestamp (s)    │
//!    592     8  current index    │
//!    600     8  last index       ┘
//!    608    32  bundle hash
//!    640    32  trunk
//!    672    32  branch
//!    704     8  tag (round index for milestone bundles)
//!    712     8  attachment timestamp (ms)
//!    720     8  attachment timestamp lower bound
//!    728     8  attachment timestamp upper bound
//!    736     8  nonce
//!    744    24  reserved
//! ```

use std::fmt;

use crate::sponge::{Sponge, SpongeMode, HASH_LENGTH};
use crate::Hash;

/// Serialized transaction size.
pub const SIZE: usize = 768;

pub const SIGNATURE_OFFSET: usize = 0;
pub const SIGNATURE_SIZE: usize = 512;
pub const ADDRESS_OFFSET: usize = 512;
pub const VALUE_OFFSET: usize = 544;
pub const VALUE_SIZE: usize = 8;
/// Bytes of the value field that may be non-zero. The whole field is usable.
pub const VALUE_USABLE_SIZE: usize = 8;
pub const BUNDLE_NONCE_OFFSET: usize = 552;
pub const TIMESTAMP_OFFSET: usize = 584;
pub const CURRENT_INDEX_OFFSET: usize = 592;
pub const LAST_INDEX_OFFSET: usize = 600;
pub const BUNDLE_OFFSET: usize = 608;
pub const TRUNK_OFFSET: usize = 640;
pub const BRANCH_OFFSET: usize = 672;
pub const TAG_OFFSET: usize = 704;
pub const ATTACHMENT_TIMESTAMP_OFFSET: usize = 712;
pub const ATTACHMENT_LOWER_BOUND_OFFSET: usize = 720;
pub const ATTACHMENT_UPPER_BOUND_OFFSET: usize = 728;
pub const NONCE_OFFSET: usize = 736;
pub const RESERVED_OFFSET: usize = 744;
pub const RESERVED_SIZE: usize = 24;

pub const ESSENCE_OFFSET: usize = ADDRESS_OFFSET;
pub const ESSENCE_SIZE: usize = BUNDLE_OFFSET - ESSENCE_OFFSET;

/// Total token supply. No balance or running bundle sum may exceed it.
pub const SUPPLY: i64 = 4_292_493_394_837_504;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("Invalid transaction length: expected {SIZE}, got {0}")]
    InvalidLength(usize),

    #[error("Invalid metadata length: expected {METADATA_SIZE}, got {0}")]
    InvalidMetadataLength(usize),
}

/// An immutable transaction together with its content hash.
#[derive(Clone, PartialEq, Eq)]
pub struct Transaction {
    bytes: Box<[u8; SIZE]>,
    hash: Hash,
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(buf)
}

fn read_hash(bytes: &[u8], offset: usize) -> Hash {
    Hash::from_hash_bytes(&bytes[offset..offset + Hash::BYTES])
}

impl Transaction {
    /// Parse a serialized transaction and compute its hash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        let array: [u8; SIZE] = bytes
            .try_into()
            .map_err(|_| TransactionError::InvalidLength(bytes.len()))?;
        Ok(Self::from_array(Box::new(array)))
    }

    fn from_array(bytes: Box<[u8; SIZE]>) -> Self {
        let hash = Hash::from_bytes(&bytes[..]);
        Self { bytes, hash }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn signature(&self) -> &[u8] {
        &self.bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE]
    }

    pub fn address(&self) -> Hash {
        read_hash(&self.bytes[..], ADDRESS_OFFSET)
    }

    pub fn value(&self) -> i64 {
        read_u64(&self.bytes[..], VALUE_OFFSET) as i64
    }

    /// Bytes of the value field beyond [`VALUE_USABLE_SIZE`].
    pub fn reserved_value_bytes(&self) -> &[u8] {
        &self.bytes[VALUE_OFFSET + VALUE_USABLE_SIZE..VALUE_OFFSET + VALUE_SIZE]
    }

    pub fn bundle_nonce(&self) -> Hash {
        read_hash(&self.bytes[..], BUNDLE_NONCE_OFFSET)
    }

    /// Issuance timestamp in seconds.
    pub fn timestamp(&self) -> u64 {
        read_u64(&self.bytes[..], TIMESTAMP_OFFSET)
    }

    pub fn current_index(&self) -> u64 {
        read_u64(&self.bytes[..], CURRENT_INDEX_OFFSET)
    }

    pub fn last_index(&self) -> u64 {
        read_u64(&self.bytes[..], LAST_INDEX_OFFSET)
    }

    pub fn is_tail(&self) -> bool {
        self.current_index() == 0
    }

    pub fn bundle(&self) -> Hash {
        read_hash(&self.bytes[..], BUNDLE_OFFSET)
    }

    pub fn trunk(&self) -> Hash {
        read_hash(&self.bytes[..], TRUNK_OFFSET)
    }

    pub fn branch(&self) -> Hash {
        read_hash(&self.bytes[..], BRANCH_OFFSET)
    }

    pub fn tag(&self) -> &[u8] {
        &self.bytes[TAG_OFFSET..TAG_OFFSET + 8]
    }

    /// The round index a milestone or nominee transaction claims, read from the tag.
    pub fn round_index(&self) -> u64 {
        read_u64(&self.bytes[..], TAG_OFFSET)
    }

    /// Attachment timestamp in milliseconds, 0 when not attached.
    pub fn attachment_timestamp(&self) -> u64 {
        read_u64(&self.bytes[..], ATTACHMENT_TIMESTAMP_OFFSET)
    }

    pub fn attachment_timestamp_lower_bound(&self) -> u64 {
        read_u64(&self.bytes[..], ATTACHMENT_LOWER_BOUND_OFFSET)
    }

    pub fn attachment_timestamp_upper_bound(&self) -> u64 {
        read_u64(&self.bytes[..], ATTACHMENT_UPPER_BOUND_OFFSET)
    }

    pub fn nonce(&self) -> u64 {
        read_u64(&self.bytes[..], NONCE_OFFSET)
    }

    pub fn reserved(&self) -> &[u8] {
        &self.bytes[RESERVED_OFFSET..RESERVED_OFFSET + RESERVED_SIZE]
    }

    /// The byte range absorbed into the bundle hash.
    pub fn essence(&self) -> &[u8] {
        &self.bytes[ESSENCE_OFFSET..ESSENCE_OFFSET + ESSENCE_SIZE]
    }

    /// Weight magnitude (leading zero bits of the hash).
    pub fn weight_magnitude(&self) -> u32 {
        self.hash.leading_zero_bits()
    }

    /// Start a builder pre-filled with this transaction's fields.
    pub fn to_builder(&self) -> TransactionBuilder {
        TransactionBuilder {
            bytes: self.bytes.clone(),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &self.hash)
            .field("address", &self.address())
            .field("value", &self.value())
            .field("index", &format_args!("{}/{}", self.current_index(), self.last_index()))
            .field("bundle", &self.bundle())
            .finish()
    }
}

/// Field-wise construction of transactions.
///
/// Used by milestone publishing and by tests. The hash is computed when
/// [`TransactionBuilder::build`] is called.
#[derive(Clone)]
pub struct TransactionBuilder {
    bytes: Box<[u8; SIZE]>,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0u8; SIZE]),
        }
    }

    fn put_u64(mut self, offset: usize, value: u64) -> Self {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
        self
    }

    fn put_hash(mut self, offset: usize, hash: &Hash) -> Self {
        self.bytes[offset..offset + Hash::BYTES].copy_from_slice(hash.as_bytes());
        self
    }

    /// Copy up to 512 bytes into the signature field, zero filling the rest.
    pub fn signature(mut self, signature: &[u8]) -> Self {
        let len = signature.len().min(SIGNATURE_SIZE);
        self.bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE].fill(0);
        self.bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + len].copy_from_slice(&signature[..len]);
        self
    }

    pub fn address(self, address: &Hash) -> Self {
        self.put_hash(ADDRESS_OFFSET, address)
    }

    pub fn value(self, value: i64) -> Self {
        self.put_u64(VALUE_OFFSET, value as u64)
    }

    pub fn bundle_nonce(self, nonce: &Hash) -> Self {
        self.put_hash(BUNDLE_NONCE_OFFSET, nonce)
    }

    pub fn timestamp(self, seconds: u64) -> Self {
        self.put_u64(TIMESTAMP_OFFSET, seconds)
    }

    pub fn current_index(self, index: u64) -> Self {
        self.put_u64(CURRENT_INDEX_OFFSET, index)
    }

    pub fn last_index(self, index: u64) -> Self {
        self.put_u64(LAST_INDEX_OFFSET, index)
    }

    pub fn bundle(self, bundle: &Hash) -> Self {
        self.put_hash(BUNDLE_OFFSET, bundle)
    }

    pub fn trunk(self, trunk: &Hash) -> Self {
        self.put_hash(TRUNK_OFFSET, trunk)
    }

    pub fn branch(self, branch: &Hash) -> Self {
        self.put_hash(BRANCH_OFFSET, branch)
    }

    pub fn round_index(self, round: u64) -> Self {
        self.put_u64(TAG_OFFSET, round)
    }

    pub fn attachment_timestamp(self, millis: u64) -> Self {
        self.put_u64(ATTACHMENT_TIMESTAMP_OFFSET, millis)
    }

    pub fn attachment_bounds(self, lower: u64, upper: u64) -> Self {
        self.put_u64(ATTACHMENT_LOWER_BOUND_OFFSET, lower)
            .put_u64(ATTACHMENT_UPPER_BOUND_OFFSET, upper)
    }

    pub fn nonce(self, nonce: u64) -> Self {
        self.put_u64(NONCE_OFFSET, nonce)
    }

    /// Current essence bytes, for computing a bundle hash before the
    /// bundle field is filled in.
    pub fn essence(&self) -> &[u8] {
        &self.bytes[ESSENCE_OFFSET..ESSENCE_OFFSET + ESSENCE_SIZE]
    }

    /// Direct access to the raw bytes, for corrupting fields in tests.
    pub fn bytes_mut(&mut self) -> &mut [u8; SIZE] {
        &mut self.bytes
    }

    pub fn build(self) -> Transaction {
        Transaction::from_array(self.bytes)
    }
}

/// Bundle hash over the essences of a bundle's members, in index order.
pub fn bundle_hash<'a, I>(essences: I) -> Hash
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut sponge = Sponge::new(SpongeMode::S256);
    for essence in essences {
        // Essences are whole blocks.
        let _ = sponge.absorb(essence);
    }
    let mut out = [0u8; HASH_LENGTH];
    let _ = sponge.squeeze(&mut out);
    Hash::from(out)
}

/// Serialized [`TransactionMetadata`] size.
pub const METADATA_SIZE: usize = 1 + 1 + 1 + Hash::BYTES + 8 + 8 + 8;

/// Cached bundle validity of a tail transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl Validity {
    pub fn as_i8(self) -> i8 {
        match self {
            Validity::Unknown => 0,
            Validity::Valid => 1,
            Validity::Invalid => -1,
        }
    }

    pub fn from_i8(v: i8) -> Self {
        match v {
            1 => Validity::Valid,
            -1 => Validity::Invalid,
            _ => Validity::Unknown,
        }
    }
}

/// Mutable per-transaction state kept next to the immutable bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionMetadata {
    /// Entire referenced history is present. Never reverts.
    pub solid: bool,
    /// Cached bundle validity (tails only).
    pub validity: Validity,
    /// Transaction belongs to a validated milestone bundle.
    pub milestone: bool,
    /// Digest of the bundle member set `validity` was computed for.
    pub bundle_digest: Hash,
    /// Round whose ledger application confirmed this transaction, 0 if unconfirmed.
    pub snapshot_index: u64,
    /// Round that references this transaction, 0 if none yet.
    pub round_index: u64,
    /// Local arrival time in milliseconds.
    pub arrival_time: u64,
}

impl TransactionMetadata {
    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut out = [0u8; METADATA_SIZE];
        out[0] = u8::from(self.solid);
        out[1] = self.validity.as_i8() as u8;
        out[2] = u8::from(self.milestone);
        out[3..35].copy_from_slice(self.bundle_digest.as_bytes());
        out[35..43].copy_from_slice(&self.snapshot_index.to_be_bytes());
        out[43..51].copy_from_slice(&self.round_index.to_be_bytes());
        out[51..59].copy_from_slice(&self.arrival_time.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        if bytes.len() != METADATA_SIZE {
            return Err(TransactionError::InvalidMetadataLength(bytes.len()));
        }
        Ok(Self {
            solid: bytes[0] != 0,
            validity: Validity::from_i8(bytes[1] as i8),
            milestone: bytes[2] != 0,
            bundle_digest: Hash::from_hash_bytes(&bytes[3..35]),
            snapshot_index: read_u64(bytes, 35),
            round_index: read_u64(bytes, 43),
            arrival_time: read_u64(bytes, 51),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_contiguous() {
        assert_eq!(ESSENCE_SIZE, 96);
        assert_eq!(RESERVED_OFFSET + RESERVED_SIZE, SIZE);
        assert_eq!(TAG_OFFSET, BRANCH_OFFSET + 32);
    }

    #[test]
    fn test_builder_fields() {
        let trunk = Hash::from_bytes(b"trunk");
        let tx = TransactionBuilder::new()
            .value(-300)
            .current_index(1)
            .last_index(2)
            .trunk(&trunk)
            .round_index(42)
            .attachment_timestamp(1_600_000_000_000)
            .build();
        assert_eq!(tx.value(), -300);
        assert_eq!(tx.current_index(), 1);
        assert_eq!(tx.last_index(), 2);
        assert_eq!(tx.trunk(), trunk);
        assert_eq!(tx.round_index(), 42);
        assert_eq!(tx.attachment_timestamp(), 1_600_000_000_000);
        assert!(!tx.is_tail());
    }

    #[test]
    fn test_hash_is_content_derived() {
        let a = TransactionBuilder::new().nonce(1).build();
        let b = TransactionBuilder::new().nonce(2).build();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(Transaction::from_bytes(a.as_bytes()).unwrap(), a);
    }

    #[test]
    fn test_bundle_hash_depends_on_essence_order() {
        let a = TransactionBuilder::new().value(-5).current_index(0).build();
        let b = TransactionBuilder::new().value(5).current_index(1).build();
        let forward = bundle_hash([a.essence(), b.essence()]);
        assert_eq!(forward, bundle_hash([a.essence(), b.essence()]));
        assert_ne!(forward, bundle_hash([b.essence(), a.essence()]));
    }

    #[test]
    fn test_empty_transaction_hashes_to_null() {
        assert_eq!(TransactionBuilder::new().build().hash(), Hash::NULL);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(
            Transaction::from_bytes(&[0u8; 10]),
            Err(TransactionError::InvalidLength(10))
        );
    }

    #[test]
    fn test_metadata_encoding() {
        let meta = TransactionMetadata {
            solid: true,
            validity: Validity::Invalid,
            milestone: true,
            bundle_digest: Hash::from_bytes(b"digest"),
            snapshot_index: 7,
            round_index: 8,
            arrival_time: 9,
        };
        assert_eq!(TransactionMetadata::from_bytes(&meta.to_bytes()).unwrap(), meta);
        assert!(TransactionMetadata::from_bytes(&[0u8; 3]).is_err());
    }
}
