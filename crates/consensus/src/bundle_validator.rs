//! Bundle loading and validation.
//!
//! A bundle is loaded from its tail by following trunk links while the
//! bundle hash matches, then checked for ordering, value conservation, the
//! recomputed bundle hash and the spending signatures.
//!
//! The outcome is cached on the tail's metadata together with a digest of
//! the member hashes it was computed for. A cached outcome is only reused
//! when the freshly loaded member set has the same digest.

use std::sync::Arc;

use tangle_metrics::MetricsRecorder;
use tangle_storage::{StorageError, Tangle};
use tangle_types::sponge::{CryptoError, Sponge, SpongeMode, HASH_LENGTH};
use tangle_types::{bundle_hash, winternitz, Hash, Transaction, Validity, SUPPLY};
use tracing::{debug, trace};

use crate::error::BundleError;

/// Validates bundles and caches the outcome on their tails.
pub struct BundleValidator {
    tangle: Arc<Tangle>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl std::fmt::Debug for BundleValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleValidator").finish_non_exhaustive()
    }
}

impl BundleValidator {
    pub fn new(tangle: Arc<Tangle>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { tangle, metrics }
    }

    /// Validate the bundle starting at `tail`.
    ///
    /// Returns no bundles if the tail is unknown, incomplete or invalid, and
    /// exactly one ordered bundle otherwise.
    pub fn validate(&self, tail: &Hash) -> Result<Vec<Vec<Transaction>>, StorageError> {
        match self.validate_bundle(tail) {
            Ok(bundle) => Ok(vec![bundle]),
            Err(BundleError::Storage(e)) => Err(e),
            Err(e) => {
                debug!(tail = %tail, error = %e, "bundle rejected");
                Ok(Vec::new())
            }
        }
    }

    /// Validate the bundle starting at `tail`, reporting why it was rejected.
    ///
    /// Incomplete bundles ([`BundleError::Missing`]) and non-tails are not
    /// cached; every other outcome is.
    pub fn validate_bundle(&self, tail: &Hash) -> Result<Vec<Transaction>, BundleError> {
        let mut bundle = self.load_bundle(tail)?;
        let digest = member_digest(&bundle)?;
        let metadata = self
            .tangle
            .metadata(tail)?
            .ok_or(BundleError::Missing(*tail))?;

        if metadata.bundle_digest == digest {
            match metadata.validity {
                Validity::Valid => {
                    self.metrics.record_bundle_validity_cache_hit();
                    bundle.sort_by_key(Transaction::current_index);
                    return Ok(bundle);
                }
                Validity::Invalid => {
                    self.metrics.record_bundle_validity_cache_hit();
                    return Err(BundleError::CachedInvalid(*tail));
                }
                Validity::Unknown => {}
            }
        }

        let result = check_bundle(&mut bundle);
        let validity = if result.is_ok() {
            Validity::Valid
        } else {
            Validity::Invalid
        };
        self.tangle.update_metadata(tail, |m| {
            m.validity = validity;
            m.bundle_digest = digest;
        })?;
        self.metrics.record_bundle_validated(result.is_ok());
        trace!(tail = %tail, ?validity, "bundle validated");

        result.map(|()| bundle)
    }

    /// Collect the members of the bundle starting at `tail`, in trunk order.
    pub fn load_bundle(&self, tail: &Hash) -> Result<Vec<Transaction>, BundleError> {
        load_members(&self.tangle, tail)
    }
}

/// Follow trunk links from `tail` while the bundle hash matches, for at
/// most `last_index` hops.
pub(crate) fn load_members(tangle: &Tangle, tail: &Hash) -> Result<Vec<Transaction>, BundleError> {
    let first = tangle
        .transaction(tail)?
        .ok_or(BundleError::Missing(*tail))?;
    if first.current_index() != 0 {
        return Err(BundleError::NotTail(*tail));
    }
    let bundle_hash = first.bundle();
    let last_index = first.last_index();

    let mut members = vec![first];
    for _ in 0..last_index {
        let Some(current) = members.last() else {
            break;
        };
        if current.current_index() >= last_index {
            break;
        }
        let trunk = current.trunk();
        let next = tangle
            .transaction(&trunk)?
            .ok_or(BundleError::Missing(trunk))?;
        if next.bundle() != bundle_hash {
            break;
        }
        members.push(next);
    }
    Ok(members)
}

/// Whether a loaded bundle cannot be applied to the ledger.
pub fn is_inconsistent(bundle: &[Transaction]) -> bool {
    bundle.is_empty() || bundle.iter().map(|tx| i128::from(tx.value())).sum::<i128>() != 0
}

fn member_digest(bundle: &[Transaction]) -> Result<Hash, CryptoError> {
    let mut blocks = Vec::with_capacity(bundle.len() * HASH_LENGTH);
    for tx in bundle {
        blocks.extend_from_slice(tx.hash().as_bytes());
    }
    Ok(Hash::from(Sponge::digest(SpongeMode::S256, &blocks)?))
}

/// Order, value, bundle-hash and signature checks over loaded members.
fn check_bundle(bundle: &mut [Transaction]) -> Result<(), BundleError> {
    bundle.sort_by_key(Transaction::current_index);
    let Some(tail) = bundle.first() else {
        return Err(BundleError::MissingIndex {
            bundle: Hash::NULL,
            index: 0,
        });
    };
    let recorded = tail.bundle();
    let last_index = tail.last_index();

    check_order(bundle, recorded, last_index)?;
    check_values(bundle, recorded)?;

    let computed = bundle_hash(bundle.iter().map(Transaction::essence));
    if computed != recorded {
        return Err(BundleError::HashMismatch { recorded, computed });
    }

    check_signatures(bundle, &recorded)
}

fn check_order(bundle: &[Transaction], recorded: Hash, last_index: u64) -> Result<(), BundleError> {
    let expected = last_index.saturating_add(1);
    for (i, tx) in bundle.iter().enumerate() {
        let index = i as u64;
        if tx.current_index() != index {
            return Err(BundleError::MissingIndex {
                bundle: recorded,
                index,
            });
        }
        if tx.last_index() != last_index {
            return Err(BundleError::SizeMismatch {
                bundle: recorded,
                expected,
                actual: tx.last_index().saturating_add(1),
            });
        }
        if i > 0 && bundle[i - 1].trunk() != tx.hash() {
            return Err(BundleError::BrokenChain {
                bundle: recorded,
                index,
            });
        }
    }
    let actual = bundle.len() as u64;
    if actual != expected {
        return Err(BundleError::SizeMismatch {
            bundle: recorded,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_values(bundle: &[Transaction], recorded: Hash) -> Result<(), BundleError> {
    let supply = i128::from(SUPPLY);
    let mut sum: i128 = 0;
    for tx in bundle {
        let value = i128::from(tx.value());
        sum += value;
        if value.abs() > supply || sum.abs() > supply {
            return Err(BundleError::ValueOutOfRange {
                bundle: recorded,
                index: tx.current_index(),
            });
        }
    }
    if sum != 0 {
        return Err(BundleError::UnbalancedValue {
            bundle: recorded,
            sum,
        });
    }
    Ok(())
}

/// Every spending transaction is signed by its own signature field and the
/// fields of the zero-value transactions directly following it from the
/// same address.
fn check_signatures(bundle: &[Transaction], recorded: &Hash) -> Result<(), BundleError> {
    let mut i = 0;
    while i < bundle.len() {
        let tx = &bundle[i];
        if tx.value() >= 0 {
            i += 1;
            continue;
        }
        let address = tx.address();
        let mut signature = tx.signature().to_vec();
        let mut j = i + 1;
        while j < bundle.len() && bundle[j].value() == 0 && bundle[j].address() == address {
            signature.extend_from_slice(bundle[j].signature());
            j += 1;
        }
        if !winternitz::validate_signature(
            SpongeMode::S256,
            address.as_bytes(),
            &signature,
            recorded.as_bytes(),
        ) {
            return Err(BundleError::InvalidSignature {
                address,
                index: tx.current_index(),
            });
        }
        i = j;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_storage_memory::MemoryStore;
    use tangle_types::TransactionBuilder;

    const SEED: &[u8] = &[7u8; 32];

    fn tangle() -> Arc<Tangle> {
        Arc::new(Tangle::new(Arc::new(MemoryStore::new())))
    }

    fn spender() -> Hash {
        Hash::from(winternitz::generate_address(SEED, 0, 1).unwrap())
    }

    /// Signed, trunk-chained bundle with the given values. The first
    /// transaction spends from the seed's address.
    fn bundle(values: &[i64]) -> Vec<Transaction> {
        let last = values.len() as u64 - 1;
        let mut builders: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                let address = if i == 0 {
                    spender()
                } else {
                    Hash::new([i as u8 + 1; 32])
                };
                TransactionBuilder::new()
                    .address(&address)
                    .value(value)
                    .timestamp(1_600_000_000)
                    .current_index(i as u64)
                    .last_index(last)
            })
            .collect();
        let hash = bundle_hash(builders.iter().map(TransactionBuilder::essence));
        let signature = winternitz::signature_fragments(SpongeMode::S256, SEED, 0, 1, hash.as_bytes())
            .unwrap();
        builders[0] = builders[0].clone().signature(&signature);
        chain(builders, &hash)
    }

    fn chain(builders: Vec<TransactionBuilder>, bundle: &Hash) -> Vec<Transaction> {
        let mut trunk = Hash::NULL;
        let mut out: Vec<Transaction> = builders
            .into_iter()
            .rev()
            .map(|b| {
                let tx = b.bundle(bundle).trunk(&trunk).build();
                trunk = tx.hash();
                tx
            })
            .collect();
        out.reverse();
        out
    }

    fn store(tangle: &Tangle, txs: &[Transaction]) {
        for tx in txs {
            tangle.store_transaction(tx, 0).unwrap();
        }
    }

    #[test]
    fn test_valid_bundle_is_cached() {
        let tangle = tangle();
        let txs = bundle(&[-300, 300, 0]);
        store(&tangle, &txs);
        let validator = BundleValidator::new(tangle.clone(), tangle_metrics::noop());

        let result = validator.validate(&txs[0].hash()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0], txs);
        let meta = tangle.metadata(&txs[0].hash()).unwrap().unwrap();
        assert_eq!(meta.validity, Validity::Valid);

        // Second call is answered from the cache.
        assert_eq!(validator.validate(&txs[0].hash()).unwrap().len(), 1);
        assert_eq!(meta.bundle_digest, member_digest(&txs).unwrap());
    }

    #[test]
    fn test_member_digest_depends_on_members() {
        let txs = bundle(&[-300, 300, 0]);
        let digest = member_digest(&txs).unwrap();
        assert_ne!(digest, Hash::NULL);
        assert_ne!(digest, member_digest(&txs[..2]).unwrap());
        let mut reversed = txs.clone();
        reversed.reverse();
        assert_ne!(digest, member_digest(&reversed).unwrap());
    }

    #[test]
    fn test_corrupted_signature_is_invalid() {
        let tangle = tangle();
        let mut txs = bundle(&[-300, 200, 100]);
        let mut tail = txs[0].to_builder();
        tail.bytes_mut()[5] ^= 0x01;
        txs[0] = tail.build();
        store(&tangle, &txs);
        let validator = BundleValidator::new(tangle.clone(), tangle_metrics::noop());

        assert!(validator.validate(&txs[0].hash()).unwrap().is_empty());
        let meta = tangle.metadata(&txs[0].hash()).unwrap().unwrap();
        assert_eq!(meta.validity, Validity::Invalid);
        assert!(matches!(
            validator.validate_bundle(&txs[0].hash()),
            Err(BundleError::CachedInvalid(_))
        ));
    }

    #[test]
    fn test_incomplete_bundle_is_not_cached() {
        let tangle = tangle();
        let txs = bundle(&[-300, 300, 0]);
        store(&tangle, &txs[..2]);
        let validator = BundleValidator::new(tangle.clone(), tangle_metrics::noop());

        let err = validator.validate_bundle(&txs[0].hash()).unwrap_err();
        assert!(err.is_incomplete());
        let meta = tangle.metadata(&txs[0].hash()).unwrap().unwrap();
        assert_eq!(meta.validity, Validity::Unknown);

        tangle.store_transaction(&txs[2], 0).unwrap();
        assert_eq!(validator.validate_bundle(&txs[0].hash()).unwrap(), txs);
    }

    #[test]
    fn test_non_tail_rejected() {
        let tangle = tangle();
        let txs = bundle(&[0, 0]);
        store(&tangle, &txs);
        let validator = BundleValidator::new(tangle, tangle_metrics::noop());
        assert!(matches!(
            validator.validate_bundle(&txs[1].hash()),
            Err(BundleError::NotTail(_))
        ));
    }

    #[test]
    fn test_unbalanced_bundle_rejected() {
        let tangle = tangle();
        let txs = bundle(&[-300, 299]);
        store(&tangle, &txs);
        let validator = BundleValidator::new(tangle, tangle_metrics::noop());
        assert!(matches!(
            validator.validate_bundle(&txs[0].hash()),
            Err(BundleError::UnbalancedValue { sum: -1, .. })
        ));
    }

    #[test]
    fn test_value_beyond_supply_rejected() {
        let tangle = tangle();
        let txs = bundle(&[-SUPPLY - 1, SUPPLY + 1]);
        store(&tangle, &txs);
        let validator = BundleValidator::new(tangle, tangle_metrics::noop());
        assert!(matches!(
            validator.validate_bundle(&txs[0].hash()),
            Err(BundleError::ValueOutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn test_tampered_essence_fails_hash_check() {
        let tangle = tangle();
        let mut txs = bundle(&[0, 0, 0]);
        // Same trunk and bundle field, different timestamp in the essence.
        txs[0] = txs[0].to_builder().timestamp(1).build();
        store(&tangle, &txs);
        let validator = BundleValidator::new(tangle, tangle_metrics::noop());
        assert!(matches!(
            validator.validate_bundle(&txs[0].hash()),
            Err(BundleError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_is_inconsistent() {
        assert!(is_inconsistent(&[]));
        assert!(!is_inconsistent(&bundle(&[-300, 300, 0])));
        let unbalanced = [TransactionBuilder::new().value(1).build()];
        assert!(is_inconsistent(&unbalanced));
    }
}
