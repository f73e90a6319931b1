//! Preparation of spend transactions, memoized per account snapshot.

use crate::{
    modes::AddressKind,
    resources::BitcoinResources,
    selection::{Selection, SelectionError, SelectionParams, SelectionStrategy, UtxoSelector},
};

use coinsync::{config::CacheConfig, Account, ComputationCache, InvariantViolation};

use std::{collections::BTreeSet, error, fmt, str::FromStr};

use miniscript::bitcoin::{
    absolute::LockTime, transaction, Address, Amount, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut,
};

/// What the user wants to pay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendIntent {
    pub recipient: String,
    pub amount: u64,
    pub use_all_amount: bool,
    pub fee_rate_vb: u64,
    pub strategy: SelectionStrategy,
    pub include_unconfirmed_rbf: bool,
    pub excluded: BTreeSet<OutPoint>,
}

/// Everything an estimate depends on. Two requests with equal keys get the same estimate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpendKey {
    pub account_id: String,
    pub block_height: u64,
    pub recipient: String,
    pub amount: u64,
    pub use_all_amount: bool,
    pub fee_rate_vb: u64,
    pub strategy: SelectionStrategy,
    pub include_unconfirmed_rbf: bool,
    pub excluded: BTreeSet<OutPoint>,
}

impl SpendIntent {
    pub fn key(&self, account: &Account) -> SpendKey {
        // Destructured so that a new field can't be left out of the key.
        let SpendIntent {
            recipient,
            amount,
            use_all_amount,
            fee_rate_vb,
            strategy,
            include_unconfirmed_rbf,
            excluded,
        } = self;
        SpendKey {
            account_id: account.id.clone(),
            block_height: account.block_height,
            recipient: recipient.clone(),
            amount: *amount,
            use_all_amount: *use_all_amount,
            fee_rate_vb: *fee_rate_vb,
            strategy: *strategy,
            include_unconfirmed_rbf: *include_unconfirmed_rbf,
            excluded: excluded.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSpend {
    /// Unsigned.
    pub tx: Transaction,
    pub selection: Selection,
}

impl PreparedSpend {
    pub fn fee(&self) -> u64 {
        self.selection.fee
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendEstimate {
    Ready(PreparedSpend),
    /// Not enough funds. This is a valid estimate, not an error.
    Insufficient { missing: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareError {
    InvalidRecipient(String),
    UnsupportedMode(String),
    MissingChangeAddress,
    Selection(SelectionError),
    Resources(InvariantViolation),
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidRecipient(e) => write!(f, "Invalid recipient: {}", e),
            Self::UnsupportedMode(mode) => write!(f, "Can't spend from '{}' accounts", mode),
            Self::MissingChangeAddress => write!(f, "No change address for this account"),
            Self::Selection(e) => write!(f, "Coin selection error: {}", e),
            Self::Resources(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for PrepareError {}

impl From<SelectionError> for PrepareError {
    fn from(e: SelectionError) -> Self {
        Self::Selection(e)
    }
}

impl From<InvariantViolation> for PrepareError {
    fn from(e: InvariantViolation) -> Self {
        Self::Resources(e)
    }
}

fn parse_address(address: &str, network: Network) -> Result<ScriptBuf, PrepareError> {
    Address::from_str(address)
        .map_err(|e| PrepareError::InvalidRecipient(format!("'{}': {}", address, e)))?
        .require_network(network)
        .map(|address| address.script_pubkey())
        .map_err(|e| PrepareError::InvalidRecipient(format!("'{}': {}", address, e)))
}

/// Estimates spends for the accounts of a network. Estimates are cached: editing a payment in
/// a form triggers many requests for the same inputs.
#[derive(Debug)]
pub struct SpendPreparer {
    network: Network,
    cache: ComputationCache<SpendKey, SpendEstimate>,
}

impl SpendPreparer {
    pub fn new(network: Network, config: CacheConfig) -> Self {
        Self {
            network,
            cache: ComputationCache::new(config),
        }
    }

    pub fn cache(&self) -> &ComputationCache<SpendKey, SpendEstimate> {
        &self.cache
    }

    pub async fn estimate(
        &self,
        account: &Account,
        intent: &SpendIntent,
    ) -> Result<SpendEstimate, PrepareError> {
        self.cache
            .get_or_compute(intent.key(account), || async { self.prepare(account, intent) })
            .await
    }

    /// Prepare the transaction without looking at the cache.
    pub fn prepare(
        &self,
        account: &Account,
        intent: &SpendIntent,
    ) -> Result<SpendEstimate, PrepareError> {
        log::debug!(
            "Preparing a spend of {} sats from account '{}'",
            intent.amount,
            account.id
        );
        let kind = AddressKind::from_mode_name(&account.derivation_mode)
            .ok_or_else(|| PrepareError::UnsupportedMode(account.derivation_mode.clone()))?;
        let recipient = parse_address(&intent.recipient, self.network)?;
        let resources = BitcoinResources::from_account(account)?;

        let params = SelectionParams {
            recipient: &recipient,
            amount: intent.amount,
            use_all_amount: intent.use_all_amount,
            fee_rate_vb: intent.fee_rate_vb,
            strategy: intent.strategy,
            excluded: &intent.excluded,
            include_unconfirmed_rbf: intent.include_unconfirmed_rbf,
        };
        let selection = match UtxoSelector::new(kind).select(&resources.utxos, &params) {
            Ok(selection) => selection,
            Err(SelectionError::InsufficientFunds { missing }) => {
                return Ok(SpendEstimate::Insufficient { missing })
            }
            Err(e) => return Err(e.into()),
        };

        let mut output = vec![TxOut {
            value: Amount::from_sat(selection.recipient_value),
            script_pubkey: recipient,
        }];
        if let Some(change) = selection.change {
            let change_address = resources
                .change_address
                .as_deref()
                .ok_or(PrepareError::MissingChangeAddress)?;
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: parse_address(change_address, self.network)?,
            });
        }
        let input = selection
            .inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                ..TxIn::default()
            })
            .collect();
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        };

        Ok(SpendEstimate::Ready(PreparedSpend { tx, selection }))
    }
}
