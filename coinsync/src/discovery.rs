//! Discovery of the accounts of a seed.
//!
//! For every derivation mode of the currency's family we derive account after account on the
//! signing device, ask the chain data source about each of them and report the ones which
//! were used. The scan of a mode stops once too many consecutive accounts were found empty.

use crate::{
    account::{encode_account_id, Account},
    cancel::CancelFlag,
    config::Config,
    derivation::{Currency, DerivationCandidate, DerivationMode},
    error::{DeviceError, DiscoveryError, DiscoveryErrorKind, FetchError},
    family::{
        AccountShape, AddressDeriver, ChainDataSource, ChainFamily, DerivedAddress,
        FamilyRegistry, ShapeRequest,
    },
    merge::merge_operations,
};

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What a discovery run reports to its caller as it goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryEvent {
    Discovered { account: Account },
}

/// Summary of a discovery run which went to completion or was cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// Number of accounts reported.
    pub emitted: usize,
    /// Derivation modes skipped because of a recoverable device error.
    pub skipped_modes: Vec<String>,
    pub cancelled: bool,
}

// The device, for the duration of a single run. Each path is derived at most once and the
// transport is released exactly once, when the session goes out of scope.
struct DeviceSession<'a> {
    signer: &'a dyn AddressDeriver,
    cancel: &'a CancelFlag,
    derived: HashMap<(String, String), DerivedAddress>,
}

impl<'a> DeviceSession<'a> {
    fn new(signer: &'a dyn AddressDeriver, cancel: &'a CancelFlag) -> Self {
        Self {
            signer,
            cancel,
            derived: HashMap::new(),
        }
    }

    /// Returns `None` if the run was cancelled.
    async fn derive(
        &mut self,
        path: &str,
        mode: &DerivationMode,
        currency: &Currency,
    ) -> Result<Option<DerivedAddress>, DeviceError> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let cache_key = (mode.name.clone(), path.to_string());
        if let Some(derived) = self.derived.get(&cache_key) {
            return Ok(Some(derived.clone()));
        }

        log::debug!("Deriving '{}' for mode '{}'.", path, mode.name);
        let derived = self.signer.derive(path, mode, currency).await?;
        self.derived.insert(cache_key, derived.clone());
        Ok(Some(derived))
    }
}

impl Drop for DeviceSession<'_> {
    fn drop(&mut self) {
        log::debug!("Releasing the device transport.");
        self.signer.close();
    }
}

enum ScanEnd {
    Completed,
    Cancelled,
}

struct Discovery<'a> {
    currency: &'a Currency,
    family: &'a dyn ChainFamily,
    source: Arc<dyn ChainDataSource>,
    config: &'a Config,
    events: &'a mpsc::Sender<DiscoveryEvent>,
    cancel: &'a CancelFlag,
}

impl Discovery<'_> {
    async fn scan_mode(
        &self,
        session: &mut DeviceSession<'_>,
        mode: &DerivationMode,
        outcome: &mut DiscoveryOutcome,
    ) -> Result<ScanEnd, DiscoveryErrorKind> {
        let gap_limit = self.config.discovery.gap_limit.unwrap_or(mode.gap_limit);
        let show_new_account = self
            .config
            .discovery
            .show_new_account
            .unwrap_or(mode.show_new_account);

        // Make sure the device accepts this mode at all before scanning it.
        let seed_path = mode.seed_identifier_path(self.currency);
        if session.derive(&seed_path, mode, self.currency).await?.is_none() {
            return Ok(ScanEnd::Cancelled);
        }

        let mut consecutive_empty = 0;
        let mut shown_new_account = false;
        for index in mode.start_index..mode.index_ceiling(self.config.discovery.max_index) {
            if !mode.supports_index(index) {
                log::debug!("Index {} is not supported by mode '{}'.", index, mode.name);
                continue;
            }

            let candidate = mode.candidate(self.currency, index);
            let derived = match session
                .derive(&candidate.fresh_address_path, mode, self.currency)
                .await?
            {
                Some(derived) => derived,
                None => return Ok(ScanEnd::Cancelled),
            };
            if self.cancel.is_cancelled() {
                return Ok(ScanEnd::Cancelled);
            }
            let account = self.build_account(mode, &candidate, &derived).await?;

            let empty = account.is_empty_account();
            if !empty || (show_new_account && !shown_new_account) {
                shown_new_account |= empty;
                if !self.emit(account).await {
                    return Ok(ScanEnd::Cancelled);
                }
                outcome.emitted += 1;
            }

            if empty {
                consecutive_empty += 1;
                if consecutive_empty > gap_limit {
                    log::debug!(
                        "Stopping scan of mode '{}' at index {} after {} empty account(s).",
                        mode.name,
                        index,
                        consecutive_empty
                    );
                    break;
                }
            } else {
                consecutive_empty = 0;
            }
        }

        Ok(ScanEnd::Completed)
    }

    async fn build_account(
        &self,
        mode: &DerivationMode,
        candidate: &DerivationCandidate,
        derived: &DerivedAddress,
    ) -> Result<Account, DiscoveryErrorKind> {
        let xpub_or_address = self.family.account_discriminant(derived);
        let account_id = encode_account_id(&self.currency.id, &xpub_or_address, &mode.name);
        let request = ShapeRequest {
            account_id: account_id.clone(),
            currency: self.currency.clone(),
            derivation_mode: mode.name.clone(),
            index: candidate.index,
            address: derived.address.clone(),
            xpub: derived.xpub.clone(),
            since: None,
        };
        let shape = match self
            .source
            .fetch_account_shape(&request, &self.config.sync)
            .await
        {
            Ok(shape) => shape,
            Err(FetchError::NotFound) => AccountShape::default(),
            Err(e) => return Err(e.into()),
        };
        shape.check(&account_id)?;

        let now = Utc::now();
        let spendable_balance = shape.spendable_balance();
        let operations = merge_operations(&Arc::new(Vec::new()), shape.operations);
        let operations_count = shape
            .operations_count
            .unwrap_or(0)
            .max(operations.len() as u64);
        let creation_date = operations.last().map(|op| op.date).unwrap_or(now);

        let mut account = Account {
            id: account_id,
            currency: self.currency.id.clone(),
            derivation_mode: mode.name.clone(),
            index: candidate.index,
            xpub_or_address,
            fresh_address: shape
                .fresh_address
                .unwrap_or_else(|| derived.address.clone()),
            fresh_address_path: shape
                .fresh_address_path
                .unwrap_or_else(|| candidate.fresh_address_path.clone()),
            balance: shape.balance,
            spendable_balance,
            block_height: shape.block_height,
            used: false,
            operations,
            operations_count,
            operations_fully_loaded: !shape.has_more,
            pending_operations: Vec::new(),
            creation_date,
            last_sync_date: now,
            resources: shape.resources,
        };
        account.used = !account.is_empty_account();
        Ok(account)
    }

    // Returns false if the run must stop.
    async fn emit(&self, account: Account) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        log::info!(
            "Discovered account '{}' (index {}).",
            account.id,
            account.index
        );
        if self
            .events
            .send(DiscoveryEvent::Discovered { account })
            .await
            .is_err()
        {
            log::info!("Discovery events receiver dropped, stopping.");
            return false;
        }
        true
    }
}

/// Scan the derivation modes of this currency's family for accounts, sending each discovered
/// account through `events` as soon as it is found.
///
/// Modes are scanned one after the other and indexes in order. A mode which the device refuses
/// (or can't talk about) is skipped. Any other error terminates the run, accounts already sent
/// remain valid. Setting `cancel`, or dropping the receiving end of `events`, stops the run
/// without error. The device transport is released exactly once before returning.
pub async fn discover(
    signer: &dyn AddressDeriver,
    currency: &Currency,
    family: &dyn ChainFamily,
    config: &Config,
    events: &mpsc::Sender<DiscoveryEvent>,
    cancel: &CancelFlag,
) -> Result<DiscoveryOutcome, DiscoveryError> {
    let mut session = DeviceSession::new(signer, cancel);
    let discovery = Discovery {
        currency,
        family,
        source: family.data_source(),
        config,
        events,
        cancel,
    };
    let mut outcome = DiscoveryOutcome::default();
    log::info!(
        "Starting discovery of '{}' accounts ({} family).",
        currency.id,
        family.name()
    );

    for mode in family.derivation_modes(currency) {
        match discovery.scan_mode(&mut session, &mode, &mut outcome).await {
            Ok(ScanEnd::Completed) => {}
            Ok(ScanEnd::Cancelled) => {
                log::info!("Discovery of '{}' cancelled.", currency.id);
                outcome.cancelled = true;
                break;
            }
            Err(DiscoveryErrorKind::Device(e)) if e.is_recoverable() => {
                log::warn!("Skipping derivation mode '{}': {}", mode.name, e);
                outcome.skipped_modes.push(mode.name.clone());
            }
            Err(kind) => {
                log::error!("Discovery of '{}' failed: {}", currency.id, kind);
                return Err(DiscoveryError::new(&currency.id, kind));
            }
        }
    }

    log::info!(
        "Discovery of '{}' done: {} account(s) found.",
        currency.id,
        outcome.emitted
    );
    Ok(outcome)
}

/// Same as [`discover`], looking the currency up in the registry.
pub async fn discover_currency(
    registry: &FamilyRegistry,
    currency_id: &str,
    signer: &dyn AddressDeriver,
    config: &Config,
    events: &mpsc::Sender<DiscoveryEvent>,
    cancel: &CancelFlag,
) -> Result<DiscoveryOutcome, DiscoveryError> {
    let (currency, family) = match registry.get(currency_id) {
        Some(entry) => entry,
        None => {
            // Nothing to scan, but the transport is still ours to release.
            signer.close();
            return Err(DiscoveryError::new(
                currency_id,
                DiscoveryErrorKind::UnknownCurrency,
            ));
        }
    };
    discover(signer, currency, family.as_ref(), config, events, cancel).await
}
