//! Selection of the outputs of an account to fund a payment.

use crate::{modes::AddressKind, resources::Utxo};

use std::{collections::BTreeSet, error, fmt};

use bdk_coin_select::{
    metrics::LowestFee, Candidate, ChangePolicy, CoinSelector, Drain, DrainWeights, FeeRate,
    Target, TargetFee, TargetOutputs, TXIN_BASE_WEIGHT,
};
use miniscript::bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use serde::{Deserialize, Serialize};

/// Value (in satoshis) under which we never create an output.
pub const DUST_OUTPUT_SATS: u64 = 5_000;

/// Long-term feerate (sats/vb) used to weigh the cost of creating change now against spending
/// it later.
pub const LONG_TERM_FEERATE_VB: f32 = 10.0;

/// Sanity check value for the feerate (sats/vb).
pub const MAX_FEERATE: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Spend the smallest outputs first, consolidating the wallet.
    MergeOutputs,
    /// Spend the most confirmed outputs first.
    DeepestFirst,
    /// Look for the selection paying the lowest fee.
    OptimizeSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    InvalidFeerate(u64),
    InvalidOutputValue(u64),
    InsufficientFunds { missing: u64 },
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidFeerate(rate) => write!(f, "Invalid feerate: {} sat/vb", rate),
            Self::InvalidOutputValue(value) => write!(f, "Invalid output value: {} sats", value),
            Self::InsufficientFunds { missing } => {
                write!(f, "Insufficient funds. Missing {} sats.", missing)
            }
        }
    }
}

impl error::Error for SelectionError {}

#[derive(Debug, Clone)]
pub struct SelectionParams<'a> {
    pub recipient: &'a ScriptBuf,
    /// Ignored if `use_all_amount` is set.
    pub amount: u64,
    /// Send everything, without change.
    pub use_all_amount: bool,
    pub fee_rate_vb: u64,
    pub strategy: SelectionStrategy,
    pub excluded: &'a BTreeSet<OutPoint>,
    /// Whether unconfirmed outputs of replaceable transactions may be spent.
    pub include_unconfirmed_rbf: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selection {
    /// Sorted by outpoint.
    pub inputs: Vec<Utxo>,
    pub recipient_value: u64,
    pub change: Option<u64>,
    pub fee: u64,
}

/// Selects the outputs of an account spending from a single kind of address. Change goes to
/// the same kind of address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoSelector {
    kind: AddressKind,
}

impl UtxoSelector {
    pub fn new(kind: AddressKind) -> Self {
        Self { kind }
    }

    /// The outputs which may be spent, in a deterministic order.
    pub fn eligible<'u>(
        &self,
        utxos: &'u [Utxo],
        excluded: &BTreeSet<OutPoint>,
        include_unconfirmed_rbf: bool,
    ) -> Vec<&'u Utxo> {
        let mut eligible: Vec<&Utxo> = utxos
            .iter()
            .filter(|utxo| !excluded.contains(&utxo.outpoint))
            .filter(|utxo| include_unconfirmed_rbf || !utxo.is_volatile())
            .collect();
        eligible.sort_by_key(|utxo| utxo.outpoint);
        eligible.dedup_by_key(|utxo| utxo.outpoint);
        eligible
    }

    pub fn select(
        &self,
        utxos: &[Utxo],
        params: &SelectionParams,
    ) -> Result<Selection, SelectionError> {
        if params.fee_rate_vb < 1 || params.fee_rate_vb > MAX_FEERATE {
            return Err(SelectionError::InvalidFeerate(params.fee_rate_vb));
        }
        if !params.use_all_amount
            && (params.amount < DUST_OUTPUT_SATS || params.amount > Amount::MAX_MONEY.to_sat())
        {
            return Err(SelectionError::InvalidOutputValue(params.amount));
        }

        let mut coins = self.eligible(utxos, params.excluded, params.include_unconfirmed_rbf);
        match params.strategy {
            SelectionStrategy::MergeOutputs => coins.sort_by_key(|utxo| utxo.value),
            SelectionStrategy::DeepestFirst => {
                coins.sort_by_key(|utxo| utxo.block_height.unwrap_or(u32::MAX))
            }
            SelectionStrategy::OptimizeSize => {}
        }

        let max_input_weight = TXIN_BASE_WEIGHT + self.kind.satisfaction_weight() as u32;
        let candidates: Vec<Candidate> = coins
            .iter()
            .map(|utxo| Candidate {
                input_count: 1,
                value: utxo.value,
                weight: max_input_weight,
                is_segwit: self.kind.is_segwit(),
            })
            .collect();
        let mut selector = CoinSelector::new(&candidates);

        let feerate = FeeRate::from_sat_per_vb(params.fee_rate_vb as f32);
        let long_term_feerate = FeeRate::from_sat_per_vb(LONG_TERM_FEERATE_VB);
        let drain_weights = DrainWeights {
            output_weight: self.kind.output_weight() as u32,
            spend_weight: max_input_weight,
            n_outputs: 1,
        };
        // The minimum change value is exclusive.
        let change_policy = ChangePolicy::min_value_and_waste(
            drain_weights,
            DUST_OUTPUT_SATS.saturating_sub(1),
            feerate,
            long_term_feerate,
        );
        let recipient_weight = TxOut {
            value: Amount::ZERO,
            script_pubkey: params.recipient.clone(),
        }
        .weight()
        .to_wu();
        let target = Target {
            fee: TargetFee {
                rate: feerate,
                replace: None,
            },
            outputs: TargetOutputs {
                value_sum: if params.use_all_amount {
                    0
                } else {
                    params.amount
                },
                weight_sum: recipient_weight as u32,
                n_outputs: 1,
            },
        };

        if params.use_all_amount {
            selector.select_all();
            // Everything left after fees goes to the recipient.
            let excess = selector.excess(target, Drain::NONE);
            if excess < DUST_OUTPUT_SATS as i64 {
                return Err(SelectionError::InsufficientFunds {
                    missing: (DUST_OUTPUT_SATS as i64 - excess).unsigned_abs(),
                });
            }
            let recipient_value = excess.unsigned_abs();
            return Ok(self.selection(&selector, &coins, recipient_value, None));
        }

        if params.strategy == SelectionStrategy::OptimizeSize {
            let lowest_fee = LowestFee {
                target,
                long_term_feerate,
                change_policy,
            };
            let bnb_rounds = match candidates.len() {
                i if i >= 500 => 1_000,
                i if i >= 100 => 10_000,
                _ => 100_000,
            };
            if let Err(e) = selector.run_bnb(lowest_fee, bnb_rounds) {
                log::debug!(
                    "Coin selection error: '{}'. Selecting coins by descending value per weight unit...",
                    e
                );
                selector.sort_candidates_by_descending_value_pwu();
            }
        }
        // Select more coins, in the order of the strategy, until the target is met.
        loop {
            let drain = selector.drain(target, change_policy);
            if selector.is_target_met_with_drain(target, drain) {
                break;
            }
            if !selector.select_next() {
                let missing = selector.excess(target, drain).unsigned_abs();
                return Err(SelectionError::InsufficientFunds { missing });
            }
        }

        let drain = selector.drain(target, change_policy);
        let change = drain.is_some().then_some(drain.value);
        Ok(self.selection(&selector, &coins, params.amount, change))
    }

    fn selection(
        &self,
        selector: &CoinSelector,
        coins: &[&Utxo],
        recipient_value: u64,
        change: Option<u64>,
    ) -> Selection {
        let mut inputs: Vec<Utxo> = selector
            .selected_indices()
            .iter()
            .map(|i| coins[*i].clone())
            .collect();
        inputs.sort_by_key(|utxo| utxo.outpoint);
        let fee = selector
            .selected_value()
            .saturating_sub(recipient_value)
            .saturating_sub(change.unwrap_or(0));
        Selection {
            inputs,
            recipient_value,
            change,
            fee,
        }
    }
}
