//! Winternitz one-time signatures (w = 4) over the sponge.
//!
//! A private key fragment is 16 chunks of 32 bytes. Signing chunk `j` of a
//! fragment hashes it `15 - v_j` times and verifying hashes the signature
//! chunk another `v_j` times, where `v` is the normalized bundle hash. Both
//! sides therefore end at the 15-fold chain top that forms the public digest.

use crate::sponge::{CryptoError, Sponge, SpongeMode, HASH_LENGTH};

/// Bits per normalized symbol.
pub const W: usize = 4;

/// Hash chain length per chunk.
pub const ROUNDS: usize = (1 << W) - 1;

/// Chunks in one key or signature fragment.
pub const NUMBER_OF_FRAGMENT_CHUNKS: usize = 16;

/// Bytes in one key or signature fragment.
pub const FRAGMENT_LENGTH: usize = HASH_LENGTH * NUMBER_OF_FRAGMENT_CHUNKS;

/// Maximum number of fragments (security level) a key may have.
pub const NUMBER_OF_SECURITY_LEVELS: usize = 4;

/// Normalized symbols covering one fragment.
pub const NORMALIZED_FRAGMENT_LENGTH: usize = (HASH_LENGTH / NUMBER_OF_SECURITY_LEVELS) * 8 / W;

const MIN_VALUE: i8 = -8;
const MAX_VALUE: i8 = 7;

/// Derive the subseed for key `index` by adding the index to the seed as a
/// big-endian integer.
pub fn subseed(mode: SpongeMode, seed: &[u8], index: u64) -> Result<[u8; HASH_LENGTH], CryptoError> {
    if seed.is_empty() || seed.len() % HASH_LENGTH != 0 {
        return Err(CryptoError::IllegalLength(seed.len()));
    }
    let mut preimage = seed.to_vec();
    let mut carry = index;
    for byte in preimage.iter_mut().rev() {
        carry += u64::from(*byte);
        *byte = carry as u8;
        carry >>= 8;
        if carry == 0 {
            break;
        }
    }
    Sponge::digest(mode, &preimage)
}

/// Expand a subseed into `fragments` key fragments.
pub fn key(mode: SpongeMode, subseed: &[u8], fragments: usize) -> Result<Vec<u8>, CryptoError> {
    if subseed.len() != HASH_LENGTH {
        return Err(CryptoError::IllegalLength(subseed.len()));
    }
    check_security(fragments)?;
    let mut sponge = Sponge::new(mode);
    sponge.absorb(subseed)?;
    let mut key = vec![0u8; FRAGMENT_LENGTH * fragments];
    sponge.squeeze(&mut key)?;
    Ok(key)
}

/// Public digests of a private key, one per fragment.
pub fn digests(mode: SpongeMode, key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.is_empty() || key.len() % FRAGMENT_LENGTH != 0 {
        return Err(CryptoError::IllegalLength(key.len()));
    }
    let mut sponge = Sponge::new(mode);
    let mut digests = Vec::with_capacity(key.len() / FRAGMENT_LENGTH * HASH_LENGTH);
    for fragment in key.chunks_exact(FRAGMENT_LENGTH) {
        let mut buffer = fragment.to_vec();
        for chunk in buffer.chunks_exact_mut(HASH_LENGTH) {
            chain(&mut sponge, chunk, ROUNDS)?;
        }
        digests.extend_from_slice(&fragment_digest(&mut sponge, &buffer)?);
    }
    Ok(digests)
}

/// Address of a set of public digests.
pub fn address(mode: SpongeMode, digests: &[u8]) -> Result<[u8; HASH_LENGTH], CryptoError> {
    if digests.is_empty() {
        return Err(CryptoError::IllegalLength(0));
    }
    Sponge::digest(mode, digests)
}

/// Normalize a bundle hash into 64 symbols in `0..16`.
///
/// Each 16-symbol fragment is first balanced to a signed sum of zero so the
/// signature never reveals a chain top.
pub fn normalized_bundle(bundle: &[u8]) -> Result<[u8; HASH_LENGTH * 8 / W], CryptoError> {
    if bundle.len() != HASH_LENGTH {
        return Err(CryptoError::IllegalLength(bundle.len()));
    }
    let mut symbols = [0i8; HASH_LENGTH * 8 / W];
    for (i, &byte) in bundle.iter().enumerate() {
        symbols[2 * i] = sign_extend(byte >> 4);
        symbols[2 * i + 1] = sign_extend(byte & 0x0f);
    }
    for fragment in symbols.chunks_exact_mut(NORMALIZED_FRAGMENT_LENGTH) {
        let mut sum: i32 = fragment.iter().map(|&v| i32::from(v)).sum();
        while sum > 0 {
            if let Some(v) = fragment.iter_mut().find(|v| **v > MIN_VALUE) {
                *v -= 1;
            }
            sum -= 1;
        }
        while sum < 0 {
            if let Some(v) = fragment.iter_mut().find(|v| **v < MAX_VALUE) {
                *v += 1;
            }
            sum += 1;
        }
    }
    let mut normalized = [0u8; HASH_LENGTH * 8 / W];
    for (out, v) in normalized.iter_mut().zip(symbols) {
        *out = (v as u8) & 0x0f;
    }
    Ok(normalized)
}

/// Sign one normalized fragment with one key fragment.
pub fn signature_fragment(
    mode: SpongeMode,
    normalized_fragment: &[u8],
    key_fragment: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if normalized_fragment.len() != NORMALIZED_FRAGMENT_LENGTH {
        return Err(CryptoError::IllegalLength(normalized_fragment.len()));
    }
    if key_fragment.len() != FRAGMENT_LENGTH {
        return Err(CryptoError::IllegalLength(key_fragment.len()));
    }
    let mut sponge = Sponge::new(mode);
    let mut signature = key_fragment.to_vec();
    for (chunk, &v) in signature.chunks_exact_mut(HASH_LENGTH).zip(normalized_fragment) {
        chain(&mut sponge, chunk, ROUNDS - usize::from(v))?;
    }
    Ok(signature)
}

/// Sign `bundle_hash` with key `index` of `seed`, producing `security` fragments.
pub fn signature_fragments(
    mode: SpongeMode,
    seed: &[u8],
    index: u64,
    security: usize,
    bundle_hash: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let normalized = normalized_bundle(bundle_hash)?;
    let key = key(mode, &subseed(mode, seed, index)?, security)?;
    let mut signature = Vec::with_capacity(FRAGMENT_LENGTH * security);
    for (i, key_fragment) in key.chunks_exact(FRAGMENT_LENGTH).enumerate() {
        let fragment = &normalized[i * NORMALIZED_FRAGMENT_LENGTH..(i + 1) * NORMALIZED_FRAGMENT_LENGTH];
        signature.extend(signature_fragment(mode, fragment, key_fragment)?);
    }
    Ok(signature)
}

/// Recover the public digest of one signature fragment.
pub fn digest(
    mode: SpongeMode,
    normalized_fragment: &[u8],
    signature_fragment: &[u8],
) -> Result<[u8; HASH_LENGTH], CryptoError> {
    if normalized_fragment.len() < NORMALIZED_FRAGMENT_LENGTH {
        return Err(CryptoError::IllegalLength(normalized_fragment.len()));
    }
    if signature_fragment.len() < FRAGMENT_LENGTH {
        return Err(CryptoError::IllegalLength(signature_fragment.len()));
    }
    let mut sponge = Sponge::new(mode);
    let mut buffer = signature_fragment[..FRAGMENT_LENGTH].to_vec();
    for (chunk, &v) in buffer.chunks_exact_mut(HASH_LENGTH).zip(normalized_fragment) {
        chain(&mut sponge, chunk, usize::from(v & 0x0f))?;
    }
    fragment_digest(&mut sponge, &buffer)
}

/// Recover the address that signed `bundle_hash` from concatenated signature
/// fragments.
pub fn recover_address(
    mode: SpongeMode,
    signature_fragments: &[u8],
    bundle_hash: &[u8],
) -> Result<[u8; HASH_LENGTH], CryptoError> {
    let fragments = signature_fragments.len() / FRAGMENT_LENGTH;
    check_security(fragments)?;
    let normalized = normalized_bundle(bundle_hash)?;
    let mut digests = Vec::with_capacity(fragments * HASH_LENGTH);
    for i in 0..fragments {
        let fragment = &normalized[i * NORMALIZED_FRAGMENT_LENGTH..(i + 1) * NORMALIZED_FRAGMENT_LENGTH];
        let signature = &signature_fragments[i * FRAGMENT_LENGTH..(i + 1) * FRAGMENT_LENGTH];
        digests.extend_from_slice(&digest(mode, fragment, signature)?);
    }
    address(mode, &digests)
}

/// Check that `signature_fragments` over `bundle_hash` belong to `expected_address`.
pub fn validate_signature(
    mode: SpongeMode,
    expected_address: &[u8],
    signature_fragments: &[u8],
    bundle_hash: &[u8],
) -> bool {
    match recover_address(mode, signature_fragments, bundle_hash) {
        Ok(address) => address[..] == *expected_address,
        Err(_) => false,
    }
}

/// Address of key `index` of `seed` with `security` fragments.
pub fn generate_address(
    seed: &[u8],
    index: u64,
    security: usize,
) -> Result<[u8; HASH_LENGTH], CryptoError> {
    let mode = SpongeMode::S256;
    let subseed = subseed(mode, seed, index)?;
    let key = key(mode, &subseed, security)?;
    address(mode, &digests(mode, &key)?)
}

fn check_security(fragments: usize) -> Result<(), CryptoError> {
    if fragments == 0 || fragments > NUMBER_OF_SECURITY_LEVELS {
        return Err(CryptoError::IllegalSecurity(fragments));
    }
    Ok(())
}

fn sign_extend(nibble: u8) -> i8 {
    if nibble & 0x08 != 0 {
        (nibble | 0xf0) as i8
    } else {
        nibble as i8
    }
}

fn chain(sponge: &mut Sponge, chunk: &mut [u8], times: usize) -> Result<(), CryptoError> {
    for _ in 0..times {
        sponge.reset();
        sponge.absorb(chunk)?;
        sponge.squeeze(chunk)?;
    }
    Ok(())
}

fn fragment_digest(sponge: &mut Sponge, fragment: &[u8]) -> Result<[u8; HASH_LENGTH], CryptoError> {
    sponge.reset();
    sponge.absorb(fragment)?;
    let mut out = [0u8; HASH_LENGTH];
    sponge.squeeze(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_bytes(seed: u64) -> [u8; 32] {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        bytes
    }

    #[test]
    fn test_subseed_adds_index_with_carry() {
        let mut seed = [0u8; 32];
        seed[31] = 0xff;
        let mut expected_preimage = [0u8; 32];
        expected_preimage[30] = 1;
        expected_preimage[31] = 0x01;
        assert_eq!(
            subseed(SpongeMode::S256, &seed, 2).unwrap(),
            Sponge::digest(SpongeMode::S256, &expected_preimage).unwrap()
        );
    }

    #[test]
    fn test_normalized_fragments_balance_to_zero() {
        for s in 0..32 {
            let normalized = normalized_bundle(&random_bytes(s)).unwrap();
            for fragment in normalized.chunks(NORMALIZED_FRAGMENT_LENGTH) {
                let sum: i32 = fragment.iter().map(|&v| i32::from(sign_extend(v))).sum();
                assert_eq!(sum, 0, "fragment sum for seed {s}");
                assert!(fragment.iter().all(|&v| v < 16));
            }
        }
    }

    #[test]
    fn test_sign_and_validate() {
        let seed = random_bytes(1);
        let bundle = random_bytes(2);
        for security in 1..=3 {
            let address = generate_address(&seed, 7, security).unwrap();
            let signature =
                signature_fragments(SpongeMode::S256, &seed, 7, security, &bundle).unwrap();
            assert_eq!(signature.len(), security * FRAGMENT_LENGTH);
            assert!(validate_signature(SpongeMode::S256, &address, &signature, &bundle));
        }
    }

    #[test]
    fn test_validate_rejects_other_bundle() {
        let seed = random_bytes(3);
        let address = generate_address(&seed, 0, 1).unwrap();
        let signature =
            signature_fragments(SpongeMode::S256, &seed, 0, 1, &random_bytes(4)).unwrap();
        assert!(!validate_signature(SpongeMode::S256, &address, &signature, &random_bytes(5)));
    }

    #[test]
    fn test_validate_rejects_flipped_bit() {
        let seed = random_bytes(6);
        let bundle = random_bytes(7);
        let address = generate_address(&seed, 3, 1).unwrap();
        let mut signature = signature_fragments(SpongeMode::S256, &seed, 3, 1, &bundle).unwrap();
        signature[100] ^= 0x01;
        assert!(!validate_signature(SpongeMode::S256, &address, &signature, &bundle));
    }

    #[test]
    fn test_rejects_bad_security() {
        assert_eq!(
            key(SpongeMode::S256, &[1u8; 32], 0),
            Err(CryptoError::IllegalSecurity(0))
        );
        assert_eq!(
            key(SpongeMode::S256, &[1u8; 32], 5),
            Err(CryptoError::IllegalSecurity(5))
        );
    }
}
