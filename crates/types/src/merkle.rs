//! Merkle trees over 32-byte hashes.
//!
//! Two flavours are used:
//!
//! - **Key trees** are positional. Leaf `i` is the Winternitz address of key
//!   `i`, so a validator can prove with a path that the key used for round `i`
//!   belongs to its published root (its validator address).
//! - **Set trees** commit to an unordered set of hashes (the milestones of a
//!   round, the confirmed tips of a milestone). Leaves are padded with
//!   [`Hash::NULL`] up to a power of two and sorted before hashing, so the root
//!   only depends on the set.
//!
//! Parent nodes are `S256(left || right)`. Because the S256 sponge maps all
//! zero input to zero output, a pair of NULL children hashes to NULL.

use crate::sponge::{CryptoError, Sponge, SpongeMode, HASH_LENGTH};
use crate::transaction::Transaction;
use crate::winternitz;
use crate::Hash;

/// Deepest key tree whose path still fits a signature field.
pub const MAX_DEPTH: usize = 16;

fn parent(sponge: &mut Sponge, left: &Hash, right: &Hash) -> Hash {
    sponge.reset();
    let mut out = [0u8; HASH_LENGTH];
    // Both inputs and the output are exactly one block, the sponge cannot fail.
    let _ = sponge.absorb(left.as_bytes());
    let _ = sponge.absorb(right.as_bytes());
    let _ = sponge.squeeze(&mut out);
    Hash::from(out)
}

/// Fold a leaf up a Merkle path.
///
/// `path` holds `depth` concatenated siblings, bottom first. Bit `i` of
/// `index` says whether the running hash is the right (1) or left (0) child
/// at level `i`. Returns [`Hash::NULL`] when `index` does not fit in `depth`
/// levels.
pub fn get_merkle_root(mode: SpongeMode, leaf: &Hash, path: &[u8], index: u64, depth: usize) -> Hash {
    if path.len() < depth * HASH_LENGTH {
        return Hash::NULL;
    }
    let mut sponge = Sponge::new(mode);
    let mut hash = *leaf;
    let mut index = index;
    for sibling in path.chunks_exact(HASH_LENGTH).take(depth) {
        let sibling = Hash::from_hash_bytes(sibling);
        hash = if index & 1 == 0 {
            parent(&mut sponge, &hash, &sibling)
        } else {
            parent(&mut sponge, &sibling, &hash)
        };
        index >>= 1;
    }
    if index != 0 {
        return Hash::NULL;
    }
    hash
}

/// Root of a set tree.
///
/// An empty set is the single leaf NULL, and a one-element set is its own root.
pub fn set_root<I>(leaves: I) -> Hash
where
    I: IntoIterator<Item = Hash>,
{
    let mut level: Vec<Hash> = leaves.into_iter().collect();
    if level.is_empty() {
        level.push(Hash::NULL);
    }
    level.resize(level.len().next_power_of_two(), Hash::NULL);
    level.sort();

    let mut sponge = Sponge::new(SpongeMode::S256);
    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| parent(&mut sponge, &pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// A positional tree of Winternitz addresses derived from one seed.
#[derive(Clone, PartialEq, Eq)]
pub struct MerkleKeyTree {
    seed: Vec<u8>,
    depth: usize,
    security: usize,
    /// `layers[0]` are the leaves, the last layer holds the root.
    layers: Vec<Vec<Hash>>,
}

impl std::fmt::Debug for MerkleKeyTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleKeyTree")
            .field("depth", &self.depth)
            .field("security", &self.security)
            .field("root", &self.root())
            .finish_non_exhaustive()
    }
}

impl MerkleKeyTree {
    /// Build the full tree of `2^depth` keys.
    pub fn generate(seed: &[u8], depth: usize, security: usize) -> Result<Self, CryptoError> {
        Self::generate_range(seed, depth, 0, 1 << depth.min(MAX_DEPTH), security)
    }

    /// Build a tree in which only keys `first..first + count` are populated.
    ///
    /// Missing leaves are NULL.
    pub fn generate_range(
        seed: &[u8],
        depth: usize,
        first: u64,
        count: u64,
        security: usize,
    ) -> Result<Self, CryptoError> {
        if depth > MAX_DEPTH {
            return Err(CryptoError::IllegalDepth(depth));
        }
        let width = 1u64 << depth;
        if first + count > width {
            return Err(CryptoError::KeyIndexOutOfRange {
                index: first + count,
                depth,
            });
        }
        let mut leaves = vec![Hash::NULL; width as usize];
        for index in first..first + count {
            leaves[index as usize] = Hash::from(winternitz::generate_address(seed, index, security)?);
        }
        Ok(Self::from_leaves(seed.to_vec(), depth, security, leaves))
    }

    fn from_leaves(seed: Vec<u8>, depth: usize, security: usize, leaves: Vec<Hash>) -> Self {
        let mut sponge = Sponge::new(SpongeMode::S256);
        let mut layers = vec![leaves];
        for _ in 0..depth {
            let next = layers[layers.len() - 1]
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).copied().unwrap_or(Hash::NULL);
                    parent(&mut sponge, &pair[0], &right)
                })
                .collect();
            layers.push(next);
        }
        Self {
            seed,
            depth,
            security,
            layers,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn security(&self) -> usize {
        self.security
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    /// The tree root, i.e. the signer's public address.
    pub fn root(&self) -> Hash {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .copied()
            .unwrap_or(Hash::NULL)
    }

    /// Leaf address for key `index`.
    pub fn leaf(&self, index: u64) -> Option<Hash> {
        self.layers[0].get(index as usize).copied()
    }

    /// Siblings from leaf `index` up to (excluding) the root.
    pub fn path(&self, index: u64) -> Result<Vec<Hash>, CryptoError> {
        if index >= 1u64 << self.depth {
            return Err(CryptoError::KeyIndexOutOfRange {
                index,
                depth: self.depth,
            });
        }
        let mut key = index as usize;
        let mut path = Vec::with_capacity(self.depth);
        for layer in &self.layers[..self.depth] {
            path.push(layer.get(key ^ 1).copied().unwrap_or(Hash::NULL));
            key /= 2;
        }
        Ok(path)
    }

    /// [`MerkleKeyTree::path`] as the concatenated bytes carried by a
    /// milestone's Merkle-path transaction.
    pub fn path_bytes(&self, index: u64) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .path(index)?
            .iter()
            .flat_map(|h| h.to_bytes())
            .collect())
    }

    /// Sign `bundle_hash` with key `index`.
    pub fn sign(&self, index: u64, bundle_hash: &Hash) -> Result<Vec<u8>, CryptoError> {
        winternitz::signature_fragments(
            SpongeMode::S256,
            &self.seed,
            index,
            self.security,
            bundle_hash.as_bytes(),
        )
    }

    /// Serialize as a keyfile.
    ///
    /// The first line is `depth security seedhex`. Each following line is one
    /// layer, leaves first, written as `leading_nulls hexconcat` where the
    /// hex run stops at the next NULL.
    pub fn to_keyfile_string(&self) -> String {
        let mut out = format!("{} {} {}\n", self.depth, self.security, hex::encode(&self.seed));
        for layer in &self.layers {
            let leading = layer.iter().take_while(|h| h.is_null()).count();
            out.push_str(&leading.to_string());
            out.push(' ');
            for hash in layer[leading..].iter().take_while(|h| !h.is_null()) {
                out.push_str(&hash.to_hex());
            }
            out.push('\n');
        }
        out
    }

    /// Parse a keyfile written by [`MerkleKeyTree::to_keyfile_string`].
    pub fn from_keyfile_str(contents: &str) -> Result<Self, CryptoError> {
        let bad = |what: &str| CryptoError::Keyfile(what.to_string());
        let mut lines = contents.lines();
        let header = lines.next().ok_or_else(|| bad("missing header"))?;
        let mut fields = header.split_whitespace();
        let depth: usize = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| bad("bad depth"))?;
        let security: usize = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| bad("bad security"))?;
        let seed = fields
            .next()
            .and_then(|f| hex::decode(f).ok())
            .ok_or_else(|| bad("bad seed"))?;
        if depth > MAX_DEPTH {
            return Err(CryptoError::IllegalDepth(depth));
        }

        let mut layers = Vec::with_capacity(depth + 1);
        for level in 0..=depth {
            let line = lines.next().ok_or_else(|| bad("missing layer"))?;
            let (leading, run) = line.split_once(' ').unwrap_or((line, ""));
            let leading: usize = leading.parse().map_err(|_| bad("bad leading nulls"))?;
            let width = 1usize << (depth - level);
            let mut layer = vec![Hash::NULL; leading];
            for chunk in run.as_bytes().chunks(64) {
                let hex = std::str::from_utf8(chunk).map_err(|_| bad("bad hash"))?;
                layer.push(Hash::from_hex(hex).map_err(|_| bad("bad hash"))?);
            }
            if layer.len() > width {
                return Err(bad("layer too wide"));
            }
            layer.resize(width, Hash::NULL);
            layers.push(layer);
        }
        Ok(Self {
            seed,
            depth,
            security,
            layers,
        })
    }
}

/// Verify the Merkle signature of a milestone-shaped bundle.
///
/// The first `security` transactions carry OTS fragments over the bundle
/// hash and the transaction at `security` carries the Merkle path in its
/// signature field. The signing key must be leaf `key_index` of the tree
/// rooted at `expected_address`.
pub fn validate_merkle_signature(
    bundle: &[Transaction],
    mode: SpongeMode,
    expected_address: &Hash,
    key_index: u64,
    security: usize,
    depth: usize,
) -> bool {
    let Some(merkle_tx) = bundle.get(security) else {
        return false;
    };
    let Ok(normalized) = winternitz::normalized_bundle(merkle_tx.bundle().as_bytes()) else {
        return false;
    };

    let mut digests = Vec::with_capacity(HASH_LENGTH * security);
    for (i, tx) in bundle.iter().take(security).enumerate() {
        let fragment = &normalized
            [i * winternitz::NORMALIZED_FRAGMENT_LENGTH..(i + 1) * winternitz::NORMALIZED_FRAGMENT_LENGTH];
        match winternitz::digest(mode, fragment, tx.signature()) {
            Ok(digest) => digests.extend_from_slice(&digest),
            Err(_) => return false,
        }
    }
    let Ok(address) = winternitz::address(mode, &digests) else {
        return false;
    };
    let root = get_merkle_root(mode, &Hash::from(address), merkle_tx.signature(), key_index, depth);
    root == *expected_address
}
