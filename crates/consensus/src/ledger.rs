//! Turns solid rounds into state diffs and applies them to the latest
//! snapshot.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tangle_storage::Tangle;
use tangle_types::{Hash, Round, StateDiff};
use tracing::{debug, info, trace, warn};

use crate::bundle_validator::{is_inconsistent, BundleValidator};
use crate::collaborators::RequestQueue;
use crate::config::ConsensusConfig;
use crate::error::{BundleError, ConsensusError, LedgerError};
use crate::latest_solid::RoundLedger;
use crate::milestone::service::is_transaction_confirmed;
use crate::milestone::{layout, MilestoneService};
use crate::snapshot::{SnapshotProvider, SnapshotService};
use crate::transaction_validator::TransactionValidator;

pub struct LedgerService {
    tangle: Arc<Tangle>,
    provider: Arc<SnapshotProvider>,
    validator: Arc<TransactionValidator>,
    bundles: Arc<BundleValidator>,
    milestones: Arc<MilestoneService>,
    snapshots: Arc<SnapshotService>,
    requests: Arc<dyn RequestQueue>,
    security: usize,
}

impl std::fmt::Debug for LedgerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerService")
            .field("latest_index", &self.provider.latest_index())
            .finish_non_exhaustive()
    }
}

impl LedgerService {
    pub fn new(
        config: &ConsensusConfig,
        validator: Arc<TransactionValidator>,
        bundles: Arc<BundleValidator>,
        milestones: Arc<MilestoneService>,
        snapshots: Arc<SnapshotService>,
        requests: Arc<dyn RequestQueue>,
    ) -> Self {
        Self {
            tangle: validator.tangle().clone(),
            provider: validator.snapshots().clone(),
            validator,
            bundles,
            milestones,
            snapshots,
            requests,
            security: config.validator_security,
        }
    }

    /// Bring the latest snapshot up to the rounds applied before the last
    /// shutdown.
    pub fn restore_ledger_state(&self) -> Result<(), ConsensusError> {
        let Some(round) = self.milestones.find_latest_processed_solid_round()? else {
            return Ok(());
        };
        if round.index > self.provider.latest_index() {
            self.snapshots.replay_latest(round.index)?;
            info!(round = self.provider.latest_index(), "Restored ledger state");
        }
        Ok(())
    }

    /// Balance changes of everything reachable from `tips` that is not
    /// confirmed by a round before `round_index`.
    ///
    /// Returns `None` if part of that history is missing, unsolid or holds
    /// an invalid bundle. Missing transactions are requested.
    pub fn generate_balance_diff(
        &self,
        tips: impl IntoIterator<Item = Hash>,
        round_index: u64,
    ) -> Result<Option<BTreeMap<Hash, i64>>, ConsensusError> {
        let (mut visited, initial_index): (HashSet<Hash>, u64) = {
            let initial = self.provider.initial();
            (
                initial.metadata.solid_entry_points.keys().copied().collect(),
                initial.index(),
            )
        };
        visited.insert(Hash::NULL);

        let mut balances: HashMap<Hash, i64> = HashMap::new();
        let mut queue: VecDeque<Hash> = tips.into_iter().collect();
        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            let Some((tx, metadata)) = self.tangle.load(&hash)? else {
                trace!(hash = %hash, "requesting missing transaction");
                self.requests.enqueue_transaction(&hash, true);
                return Ok(None);
            };
            if is_transaction_confirmed(&metadata, round_index.saturating_sub(1)) {
                continue;
            }
            if !self.validator.check_solidity(&hash)? {
                debug!(hash = %hash, "unsolid transaction in round history");
                return Ok(None);
            }

            if metadata.milestone {
                match layout::member_parents(&self.tangle, &tx, self.security, initial_index)? {
                    Some(parents) => queue.extend(parents),
                    None => return Ok(None),
                }
                continue;
            }

            if tx.is_tail() {
                let bundle = match self.bundles.validate_bundle(&hash) {
                    Ok(bundle) => bundle,
                    Err(BundleError::Storage(e)) => return Err(e.into()),
                    Err(e) => {
                        debug!(hash = %hash, error = %e, "invalid bundle in round history");
                        return Ok(None);
                    }
                };
                if is_inconsistent(&bundle) {
                    return Ok(None);
                }
                for member in bundle.iter().filter(|member| member.value() != 0) {
                    let address = member.address();
                    let balance = balances.entry(address).or_default();
                    *balance = balance
                        .checked_add(member.value())
                        .ok_or(LedgerError::BalanceOverflow(address))?;
                }
            }
            queue.push_back(tx.trunk());
            queue.push_back(tx.branch());
        }
        Ok(Some(
            balances
                .into_iter()
                .filter(|(_, value)| *value != 0)
                .collect(),
        ))
    }

    fn is_consistent_with_latest(&self, index: u64, balances: &BTreeMap<Hash, i64>) -> bool {
        let diff = StateDiff::new(index, balances.clone());
        diff.is_consistent() && self.provider.latest().state.patched_state(&diff).is_consistent()
    }

    /// Whether confirming `tips` on top of the latest snapshot keeps every
    /// balance non-negative.
    pub fn tips_consistent(&self, tips: &[Hash]) -> Result<bool, ConsensusError> {
        for tip in tips {
            if !self.validator.is_solid(tip)? {
                return Ok(false);
            }
        }
        let index = self.provider.latest_index() + 1;
        Ok(match self.generate_balance_diff(tips.iter().copied(), index)? {
            Some(balances) => self.is_consistent_with_latest(index, &balances),
            None => false,
        })
    }
}

impl RoundLedger for LedgerService {
    fn apply_round_to_ledger(&self, round: &Round) -> Result<bool, ConsensusError> {
        let tips = self.milestones.confirmed_tips(round.index)?;
        let Some(balances) = self.generate_balance_diff(tips.iter().copied(), round.index)? else {
            return Ok(false);
        };
        if !self.is_consistent_with_latest(round.index, &balances) {
            warn!(round = round.index, "round would leave a negative balance");
            return Ok(false);
        }

        for tip in &tips {
            self.tangle
                .update_metadata(tip, |m| m.round_index = round.index)?;
        }
        self.milestones
            .update_round_index_of_milestone_transactions(round.index)?;
        let diff = StateDiff::new(round.index, balances);
        if !diff.is_empty() {
            self.tangle.put_state_diff(&diff)?;
        }
        self.snapshots.replay_latest(round.index)?;
        debug!(round = round.index, changes = diff.diff.len(), "applied round");
        Ok(true)
    }
}
