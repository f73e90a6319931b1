//! Incremental synchronization of a known account.
//!
//! Synchronizing never touches the account it is given. It fetches what changed on chain and
//! returns an [`AccountUpdate`] which the caller applies to its latest copy of the account.

use crate::{
    account::{Account, Operation},
    cancel::CancelFlag,
    config::SyncConfig,
    derivation::Currency,
    error::{FetchError, InvariantViolation, SyncError, SyncErrorKind},
    family::{AccountShape, ChainFamily, FamilyRegistry, RetentionPolicy, ShapeRequest},
    merge::merge_operations,
};

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};

/// The outcome of a successful synchronization, to be applied to the account.
pub struct AccountUpdate {
    /// Identifier of the account once updated.
    pub account_id: String,
    pub shape: AccountShape,
    pub synced_at: DateTime<Utc>,
    /// Whether the shape holds the whole history, as opposed to the operations more recent
    /// than the latest known one.
    pub full_pull: bool,
    retention: Arc<dyn RetentionPolicy>,
}

impl fmt::Debug for AccountUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountUpdate")
            .field("account_id", &self.account_id)
            .field("shape", &self.shape)
            .field("synced_at", &self.synced_at)
            .field("full_pull", &self.full_pull)
            .finish()
    }
}

impl AccountUpdate {
    /// Get the updated version of this account.
    ///
    /// This is a pure function of `account` and of this update. The account may have changed
    /// since the synchronization started (for instance a pending operation was added), the
    /// update is applied to what is given here.
    pub fn apply(&self, account: &Account) -> Account {
        let mut updated = if account.canonical_id() != account.id {
            log::info!(
                "Account '{}' changed identity to '{}', resetting its history.",
                account.id,
                account.canonical_id()
            );
            Account {
                id: account.canonical_id(),
                ..account.without_history()
            }
        } else {
            account.clone()
        };

        let incoming = keep_first_seen_dates(&updated.operations, &self.shape.operations);
        updated.operations = merge_operations(&updated.operations, incoming);
        updated.operations_count = self
            .shape
            .operations_count
            .unwrap_or(0)
            .max(updated.operations.len() as u64);
        updated.creation_date = updated
            .operations
            .last()
            .map(|op| op.date)
            .unwrap_or(self.synced_at);
        updated.last_sync_date = self.synced_at;

        // Pending operations which made it on chain are replaced by the real thing.
        let pending = std::mem::take(&mut updated.pending_operations);
        let confirmed: HashSet<&str> = updated
            .operations
            .iter()
            .filter(|op| op.is_confirmed())
            .map(|op| op.hash.as_str())
            .collect();
        let retained: Vec<_> = pending
            .into_iter()
            .filter(|op| {
                !confirmed.contains(op.hash.as_str())
                    && self
                        .retention
                        .should_retain_pending(&updated, op, self.synced_at)
            })
            .collect();
        updated.pending_operations = retained;

        updated.balance = self.shape.balance;
        updated.spendable_balance = self.shape.spendable_balance();
        updated.block_height = self.shape.block_height;
        updated.used |= !updated.is_empty_account();
        if let Some(address) = &self.shape.fresh_address {
            updated.fresh_address = address.clone();
        }
        if let Some(path) = &self.shape.fresh_address_path {
            updated.fresh_address_path = path.clone();
        }
        if let Some(resources) = &self.shape.resources {
            updated.resources = Some(resources.clone());
        }
        updated.operations_fully_loaded = if self.full_pull {
            !self.shape.has_more
        } else {
            updated.operations_fully_loaded && !self.shape.has_more
        };

        updated
    }
}

// Data sources can't tell when an unconfirmed transaction was first seen and date it at the
// time of the request. Keep the date we already have for it until it confirms.
fn keep_first_seen_dates(known: &[Operation], incoming: &[Operation]) -> Vec<Operation> {
    let first_seen: HashMap<&str, DateTime<Utc>> = known
        .iter()
        .filter(|op| !op.is_confirmed())
        .map(|op| (op.id.as_str(), op.date))
        .collect();
    incoming
        .iter()
        .map(|op| {
            let mut op = op.clone();
            if !op.is_confirmed() {
                if let Some(date) = first_seen.get(op.id.as_str()) {
                    op.date = *date;
                }
            }
            op
        })
        .collect()
}

/// Fetch what changed for this account since it was last synchronized.
///
/// Only the operations more recent than the latest known one are requested if the account
/// holds its whole history. The whole history is pulled again otherwise, or if the identifier
/// of the account doesn't match its identity fields anymore.
///
/// Returns `None` if cancelled. On error the caller should keep its account as is.
pub async fn sync_account(
    family: &dyn ChainFamily,
    currency: &Currency,
    account: &Account,
    config: &SyncConfig,
    cancel: &CancelFlag,
) -> Result<Option<AccountUpdate>, SyncError> {
    if account.currency != currency.id {
        return Err(SyncError::new(
            &account.id,
            InvariantViolation::CurrencyMismatch {
                expected: currency.id.clone(),
                actual: account.currency.clone(),
            }
            .into(),
        ));
    }
    if cancel.is_cancelled() {
        return Ok(None);
    }

    let account_id = account.canonical_id();
    let migrating = account_id != account.id;
    if migrating {
        log::warn!(
            "Identifier of account '{}' doesn't match its identity, it will be resynchronized \
             from scratch as '{}'.",
            account.id,
            account_id
        );
    }
    let since = if account.operations_fully_loaded && !migrating {
        account.latest_operation().map(|op| op.hash.clone())
    } else {
        None
    };
    let request = ShapeRequest {
        account_id: account_id.clone(),
        currency: currency.clone(),
        derivation_mode: account.derivation_mode.clone(),
        index: account.index,
        address: account.fresh_address.clone(),
        xpub: family.account_xpub(account),
        since: since.clone(),
    };
    log::debug!(
        "Synchronizing account '{}' ({} pull).",
        account_id,
        if since.is_some() {
            "incremental"
        } else {
            "full"
        }
    );

    let shape = match family
        .data_source()
        .fetch_account_shape(&request, config)
        .await
    {
        Ok(shape) => shape,
        Err(FetchError::NotFound) => AccountShape::default(),
        Err(e) => {
            log::error!("Error synchronizing account '{}': {}", account.id, e);
            return Err(SyncError::new(&account.id, e.into()));
        }
    };
    if cancel.is_cancelled() {
        log::info!("Synchronization of account '{}' cancelled.", account.id);
        return Ok(None);
    }
    shape
        .check(&account_id)
        .map_err(|e| SyncError::new(&account.id, e.into()))?;

    Ok(Some(AccountUpdate {
        account_id,
        shape,
        synced_at: Utc::now(),
        full_pull: since.is_none(),
        retention: family.retention_policy(config),
    }))
}

/// Same as [`sync_account`], looking the account's currency up in the registry.
pub async fn sync(
    registry: &FamilyRegistry,
    account: &Account,
    config: &SyncConfig,
    cancel: &CancelFlag,
) -> Result<Option<AccountUpdate>, SyncError> {
    let (currency, family) = registry.get(&account.currency).ok_or_else(|| {
        SyncError::new(
            &account.id,
            SyncErrorKind::UnknownCurrency(account.currency.clone()),
        )
    })?;
    sync_account(family.as_ref(), currency, account, config, cancel).await
}
