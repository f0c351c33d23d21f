//! Milestone validation and the bookkeeping that ties rounds to the
//! transactions they confirm.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tangle_storage::Tangle;
use tangle_types::{merkle, Hash, Round, SpongeMode, Transaction, TransactionMetadata, ROUND_INDEX_CEILING};
use tracing::{debug, info, trace};

use crate::bundle_validator::BundleValidator;
use crate::config::ConsensusConfig;
use crate::error::{BundleError, ConsensusError};
use crate::milestone::layout;
use crate::snapshot::{SnapshotProvider, SnapshotService};

/// Outcome of validating a milestone candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestoneValidity {
    Valid,
    Invalid,
    /// Parts of the bundle are still missing.
    Incomplete,
}

impl MilestoneValidity {
    pub fn as_str(self) -> &'static str {
        match self {
            MilestoneValidity::Valid => "valid",
            MilestoneValidity::Invalid => "invalid",
            MilestoneValidity::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for MilestoneValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a transaction with `metadata` was confirmed at or before `round`.
pub fn is_transaction_confirmed(metadata: &TransactionMetadata, round: u64) -> bool {
    metadata.snapshot_index != 0 && metadata.snapshot_index <= round
}

pub struct MilestoneService {
    tangle: Arc<Tangle>,
    provider: Arc<SnapshotProvider>,
    snapshots: Arc<SnapshotService>,
    bundles: Arc<BundleValidator>,
    security: usize,
    quorum: usize,
    key_depth: usize,
    validates_signatures: bool,
}

impl fmt::Debug for MilestoneService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MilestoneService")
            .field("security", &self.security)
            .field("key_depth", &self.key_depth)
            .finish_non_exhaustive()
    }
}

impl MilestoneService {
    pub fn new(
        config: &ConsensusConfig,
        tangle: Arc<Tangle>,
        provider: Arc<SnapshotProvider>,
        snapshots: Arc<SnapshotService>,
        bundles: Arc<BundleValidator>,
    ) -> Self {
        Self {
            tangle,
            provider,
            snapshots,
            bundles,
            security: config.validator_security,
            quorum: config.quorum(),
            key_depth: config.milestone_key_depth,
            validates_signatures: config.validates_milestone_signatures(),
        }
    }

    pub fn security(&self) -> usize {
        self.security
    }

    /// Validate `tx` as the tail of a milestone for `round_index` signed
    /// with `security` fragments by one of `validators`.
    ///
    /// A valid milestone gets its members flagged, its expanded parents
    /// linked as approvees, and triggers a reset if it arrives for a round
    /// the ledger already moved past.
    pub fn validate_milestone(
        &self,
        tx: &Transaction,
        round_index: u64,
        mode: SpongeMode,
        security: usize,
        key_depth: usize,
        validators: &HashSet<Hash>,
    ) -> Result<MilestoneValidity, ConsensusError> {
        if round_index >= ROUND_INDEX_CEILING {
            return Ok(MilestoneValidity::Invalid);
        }
        let hash = tx.hash();
        if self
            .tangle
            .round(round_index)?
            .is_some_and(|round| round.contains(&hash))
        {
            return Ok(MilestoneValidity::Valid);
        }

        let bundle = match self.bundles.validate_bundle(&hash) {
            Ok(bundle) => bundle,
            Err(BundleError::Storage(e)) => return Err(e.into()),
            Err(e) if e.is_incomplete() => {
                trace!(hash = %hash, "milestone bundle incomplete");
                return Ok(MilestoneValidity::Incomplete);
            }
            Err(e) => {
                debug!(hash = %hash, error = %e, "milestone bundle invalid");
                return Ok(MilestoneValidity::Invalid);
            }
        };
        if !is_structure_valid(&bundle, security) {
            return Ok(MilestoneValidity::Invalid);
        }
        // Tags are outside the signed essence.
        if bundle.iter().any(|member| member.round_index() != round_index) {
            debug!(hash = %hash, round = round_index, "milestone member tagged for another round");
            return Ok(MilestoneValidity::Invalid);
        }

        let sender = tx.address();
        let accepted = !self.validates_signatures
            || (validators.contains(&sender)
                && merkle::validate_merkle_signature(
                    &bundle,
                    mode,
                    &sender,
                    round_index,
                    security,
                    key_depth,
                ));
        if !accepted {
            debug!(hash = %hash, round = round_index, address = %sender, "milestone signature rejected");
            return Ok(MilestoneValidity::Invalid);
        }

        for member in &bundle {
            self.tangle.update_metadata(&member.hash(), |m| m.milestone = true)?;
        }
        self.link_expanded_parents(&bundle, round_index, security)?;

        let (initial_index, latest_index) = (self.provider.initial_index(), self.provider.latest_index());
        if round_index < latest_index && round_index > initial_index {
            self.reset_corrupted_round(round_index)?;
        }
        Ok(MilestoneValidity::Valid)
    }

    /// Validate with the configured validator security and key depth.
    pub fn validate_validator_milestone(
        &self,
        tx: &Transaction,
        round_index: u64,
        validators: &HashSet<Hash>,
    ) -> Result<MilestoneValidity, ConsensusError> {
        self.validate_milestone(
            tx,
            round_index,
            SpongeMode::S256,
            self.security,
            self.key_depth,
            validators,
        )
    }

    /// Record the parents hidden behind a milestone's Merkle roots as
    /// approvees, so solidity propagates into the bundle.
    fn link_expanded_parents(
        &self,
        bundle: &[Transaction],
        round_index: u64,
        security: usize,
    ) -> Result<(), ConsensusError> {
        let Some(head) = bundle.last() else {
            return Ok(());
        };
        for tip in layout::tip_set(bundle, security) {
            self.tangle.add_approver(&tip, &head.hash())?;
        }
        let initial_index = self.provider.initial_index();
        if let Some(previous) =
            layout::expand_previous_round(&self.tangle, round_index, &head.trunk(), initial_index)?
        {
            for parent in previous.iter().filter(|p| !p.is_null()) {
                for member in bundle {
                    self.tangle.add_approver(parent, &member.hash())?;
                }
            }
        }
        Ok(())
    }

    /// Tips of round `index` referenced by a quorum of its milestones.
    pub fn confirmed_tips(&self, index: u64) -> Result<BTreeSet<Hash>, ConsensusError> {
        match self.tangle.round(index)? {
            Some(round) => Ok(layout::confirmed_tips(&self.tangle, &round, self.security, self.quorum)?),
            None => Ok(BTreeSet::new()),
        }
    }

    // ── Confirmation bookkeeping ─────────────────────────────────────

    /// Assign `index` as the confirming round of round `index`'s milestones
    /// and of everything its confirmed tips reference that is not confirmed
    /// earlier.
    pub fn update_round_index_of_milestone_transactions(&self, index: u64) -> Result<(), ConsensusError> {
        if index == 0 {
            return Err(ConsensusError::InvalidRoundIndex(index));
        }
        let mut processed = HashSet::new();
        self.update_snapshot_indices(index, index, &mut processed)
    }

    fn update_snapshot_indices(
        &self,
        correct_index: u64,
        new_index: u64,
        processed: &mut HashSet<Hash>,
    ) -> Result<(), ConsensusError> {
        let Some(round) = self.tangle.round(correct_index)? else {
            return Ok(());
        };
        for milestone in &round.hashes {
            self.tangle
                .update_metadata(milestone, |m| m.snapshot_index = new_index)?;
        }

        let mut inconsistent = BTreeSet::new();
        let mut queue: VecDeque<Hash> =
            layout::confirmed_tips(&self.tangle, &round, self.security, self.quorum)?
                .into_iter()
                .collect();
        while let Some(hash) = queue.pop_front() {
            if !processed.insert(hash) {
                continue;
            }
            let Some((tx, metadata)) = self.tangle.load(&hash)? else {
                continue;
            };
            if is_transaction_confirmed(&metadata, correct_index - 1) {
                self.patch_solid_entry_points_if_necessary(&hash, &metadata);
                continue;
            }
            if metadata.snapshot_index > correct_index {
                inconsistent.insert(metadata.snapshot_index);
            }
            self.tangle
                .update_metadata(&hash, |m| m.snapshot_index = new_index)?;
            queue.push_back(tx.trunk());
            queue.push_back(tx.branch());
        }

        for index in inconsistent {
            self.reset_corrupted_round_with(index, processed)?;
        }
        Ok(())
    }

    /// Transactions confirmed at or below the initial snapshot become
    /// solid entry points of it.
    pub fn patch_solid_entry_points_if_necessary(&self, hash: &Hash, metadata: &TransactionMetadata) {
        if metadata.snapshot_index <= self.provider.initial_index()
            && self.provider.patch_solid_entry_point(*hash)
        {
            debug!(hash = %hash, "patched solid entry point");
        }
    }

    /// Undo round `index`: roll the ledger back below it, clear the
    /// snapshot indices it assigned and cascade into rounds that claimed
    /// its transactions, then drop its state diff.
    pub fn reset_corrupted_round(&self, index: u64) -> Result<(), ConsensusError> {
        let mut processed = HashSet::new();
        self.reset_corrupted_round_with(index, &mut processed)
    }

    fn reset_corrupted_round_with(
        &self,
        index: u64,
        processed: &mut HashSet<Hash>,
    ) -> Result<(), ConsensusError> {
        if index <= self.provider.initial_index() {
            return Ok(());
        }
        info!(round = index, "Resetting corrupted round");
        if !self.tangle.round_exists(index)? {
            return Ok(());
        }
        if index <= self.provider.latest_index() {
            self.snapshots.roll_back_latest(index)?;
        }
        self.update_snapshot_indices(index, 0, processed)?;
        self.tangle.delete_state_diff(index)?;
        Ok(())
    }

    pub fn is_transaction_confirmed(&self, hash: &Hash) -> Result<bool, ConsensusError> {
        let latest = self.provider.latest_index();
        Ok(self
            .tangle
            .metadata(hash)?
            .is_some_and(|m| is_transaction_confirmed(&m, latest)))
    }

    // ── Startup ──────────────────────────────────────────────────────

    /// The newest round whose milestones were already applied to the
    /// ledger in a previous run.
    pub fn find_latest_processed_solid_round(&self) -> Result<Option<Round>, ConsensusError> {
        let Some(latest) = self.tangle.latest_round()? else {
            return Ok(None);
        };
        if self.was_round_applied(&latest)? {
            return Ok(Some(latest));
        }
        let initial_index = self.provider.initial_index();
        if let Some(predecessor) = self.tangle.closest_prev_round(latest.index.saturating_sub(1), initial_index)? {
            if self.was_round_applied(&predecessor)? {
                return Ok(Some(predecessor));
            }
        }

        let mut candidate = None;
        let mut start = initial_index + 1;
        let mut end = latest.index;
        while start <= end {
            let Some(round) = self.round_in_middle_of(start, end)? else {
                break;
            };
            if self.was_round_applied(&round)? {
                start = round.index + 1;
                candidate = Some(round);
            } else if round.index == 0 {
                break;
            } else {
                end = round.index - 1;
            }
        }
        Ok(candidate)
    }

    fn round_in_middle_of(&self, start: u64, end: u64) -> Result<Option<Round>, ConsensusError> {
        let middle = end - (end - start) / 2;
        if let Some(round) = self.tangle.closest_next_round(middle.saturating_sub(1), end)? {
            if round.index >= start {
                return Ok(Some(round));
            }
        }
        Ok(self
            .tangle
            .closest_prev_round(middle, start.saturating_sub(1))?)
    }

    fn was_round_applied(&self, round: &Round) -> Result<bool, ConsensusError> {
        let Some(first) = round.hashes.first() else {
            return Ok(false);
        };
        Ok(self
            .tangle
            .metadata(first)?
            .is_some_and(|m| m.snapshot_index != 0))
    }
}

/// A milestone bundle carries its fragments, the Merkle path and possibly
/// tip transactions, and every fragment references the previous round the
/// way the head does.
fn is_structure_valid(bundle: &[Transaction], security: usize) -> bool {
    let Some(head) = bundle.last() else {
        return false;
    };
    bundle.len() > security
        && bundle
            .iter()
            .take(security)
            .all(|tx| tx.branch() == head.trunk())
}
