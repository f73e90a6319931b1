//! Interfaces to the chain-specific collaborators.
//!
//! Everything which depends on a particular blockchain lives behind the [`ChainFamily`] trait.
//! A [`FamilyRegistry`] is built once at startup and maps each currency to its family, so the
//! shared logic never has to look at currency identifiers.

use crate::{
    account::{check_operations, Account, Operation},
    config::SyncConfig,
    derivation::{Currency, DerivationMode},
    error::{DeviceError, FetchError, InvariantViolation},
};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// An address (and its public key) as derived by the signing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub address: String,
    pub public_key: String,
    /// The extended public key of the account, for families which track accounts by xpub.
    pub xpub: Option<String>,
}

/// Derives addresses on a signing device.
#[async_trait]
pub trait AddressDeriver: Send + Sync {
    async fn derive(
        &self,
        path: &str,
        mode: &DerivationMode,
        currency: &Currency,
    ) -> Result<DerivedAddress, DeviceError>;

    /// Release the underlying device transport.
    fn close(&self);
}

/// What a chain data source needs to know to fetch an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub account_id: String,
    pub currency: Currency,
    pub derivation_mode: String,
    pub index: u32,
    pub address: String,
    pub xpub: Option<String>,
    /// Only operations more recent than the one with this hash are needed.
    pub since: Option<String>,
}

/// The chain-neutral state of an account as reported by a chain data source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountShape {
    pub balance: u128,
    /// Defaults to the balance if the chain has no such distinction.
    pub spendable_balance: Option<u128>,
    pub block_height: u64,
    pub operations: Vec<Operation>,
    /// Total number of operations of the account, if known. Defaults to the number of
    /// operations we hold after merging.
    pub operations_count: Option<u64>,
    pub fresh_address: Option<String>,
    pub fresh_address_path: Option<String>,
    pub resources: Option<serde_json::Value>,
    /// Set if the data source stopped before returning every operation it should have.
    pub has_more: bool,
}

impl AccountShape {
    pub fn spendable_balance(&self) -> u128 {
        self.spendable_balance.unwrap_or(self.balance)
    }

    pub fn check(&self, account_id: &str) -> Result<(), InvariantViolation> {
        if self.spendable_balance() > self.balance {
            return Err(InvariantViolation::SpendableAboveBalance {
                spendable: self.spendable_balance(),
                balance: self.balance,
            });
        }
        check_operations(account_id, &self.operations)
    }
}

/// Fetches the state of an account from a blockchain backend. Must be idempotent, it is
/// called again with the same arguments on retries.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    async fn fetch_account_shape(
        &self,
        request: &ShapeRequest,
        config: &SyncConfig,
    ) -> Result<AccountShape, FetchError>;
}

/// Decides whether an optimistic operation should be kept around.
pub trait RetentionPolicy: Send + Sync {
    fn should_retain_pending(
        &self,
        account: &Account,
        pending: &Operation,
        now: DateTime<Utc>,
    ) -> bool;
}

/// Keep pending operations for a fixed amount of time after they were created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindowRetention {
    pub window: Duration,
}

impl TimeWindowRetention {
    pub fn new(window: std::time::Duration) -> Self {
        let window = Duration::from_std(window).unwrap_or(Duration::MAX);
        Self { window }
    }
}

impl Default for TimeWindowRetention {
    fn default() -> Self {
        Self {
            window: Duration::minutes(5),
        }
    }
}

impl RetentionPolicy for TimeWindowRetention {
    fn should_retain_pending(&self, _: &Account, pending: &Operation, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(pending.date) < self.window
    }
}

/// Everything specific to a family of blockchains.
pub trait ChainFamily: Send + Sync {
    fn name(&self) -> &str;

    /// Derivation modes to scan for this currency, in scan order.
    fn derivation_modes(&self, currency: &Currency) -> Vec<DerivationMode>;

    fn data_source(&self) -> Arc<dyn ChainDataSource>;

    /// How long pending operations are kept. Defaults to the configured time window.
    fn retention_policy(&self, config: &SyncConfig) -> Arc<dyn RetentionPolicy> {
        Arc::new(TimeWindowRetention::new(config.pending_retention))
    }

    /// The value identifying an account of this family, given its first derived address.
    fn account_discriminant(&self, derived: &DerivedAddress) -> String {
        derived
            .xpub
            .clone()
            .unwrap_or_else(|| derived.address.clone())
    }

    /// The extended public key the data source needs to look this account up, for families
    /// which track accounts by xpub. Account-based families only need the address.
    fn account_xpub(&self, _account: &Account) -> Option<String> {
        None
    }
}

/// Static mapping from currency identifier to its chain family.
#[derive(Default, Clone)]
pub struct FamilyRegistry {
    entries: HashMap<String, (Currency, Arc<dyn ChainFamily>)>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, currency: Currency, family: Arc<dyn ChainFamily>) -> Self {
        log::debug!(
            "Registering currency '{}' with family '{}'",
            currency.id,
            family.name()
        );
        self.entries.insert(currency.id.clone(), (currency, family));
        self
    }

    pub fn get(&self, currency_id: &str) -> Option<(&Currency, &Arc<dyn ChainFamily>)> {
        self.entries
            .get(currency_id)
            .map(|(currency, family)| (currency, family))
    }

    /// Identifiers of all registered currencies, sorted.
    pub fn currencies(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(|id| id.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for FamilyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyRegistry")
            .field("currencies", &self.currencies())
            .finish()
    }
}
