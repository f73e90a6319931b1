//! A [`ChainDataSource`] over the REST API of an Esplora server.

use crate::{
    modes::{network_of, AddressKind},
    resources::{BitcoinResources, Utxo},
};

use coinsync::{
    account::encode_operation_id, config::SyncConfig, AccountShape, ChainDataSource, FetchError,
    Operation, OperationKind, ShapeRequest,
};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    error, fmt,
    str::FromStr,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miniscript::bitcoin::{
    bip32::{ChildNumber, Xpub},
    secp256k1, Network, OutPoint, Txid,
};
use serde::{de::DeserializeOwned, Deserialize};

/// Number of consecutive unused addresses after which we stop scanning a chain.
pub const ADDRESS_GAP: u32 = 20;

/// Esplora returns confirmed transactions of an address by pages of this size.
const CONFIRMED_PAGE_SIZE: usize = 25;

/// Transactions with an input sequence below this one signal replaceability.
const RBF_SEQUENCE_CEILING: u32 = 0xffff_fffe;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsploraError {
    Http(String),
    Status(u16),
    Json(String),
}

impl fmt::Display for EsploraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "HTTP request failed: {}", e),
            Self::Status(code) => write!(f, "Esplora answered with status {}", code),
            Self::Json(e) => write!(f, "JSON parsing failed: {}", e),
        }
    }
}

impl error::Error for EsploraError {}

impl From<EsploraError> for FetchError {
    fn from(e: EsploraError) -> Self {
        match e {
            EsploraError::Status(404) => FetchError::NotFound,
            EsploraError::Status(400) | EsploraError::Json(_) => {
                FetchError::Malformed(e.to_string())
            }
            EsploraError::Http(_) | EsploraError::Status(_) => FetchError::Transient(e.to_string()),
        }
    }
}

/// Sends GET requests and returns the body of successful responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<String, EsploraError>;
}

#[async_trait]
impl HttpClient for reqwest::Client {
    async fn get_text(&self, url: &str) -> Result<String, EsploraError> {
        let response = reqwest::Client::get(self, url)
            .send()
            .await
            .map_err(|e| EsploraError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EsploraError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| EsploraError::Http(e.to_string()))
    }
}

#[async_trait]
impl<T: HttpClient + ?Sized> HttpClient for std::sync::Arc<T> {
    async fn get_text(&self, url: &str) -> Result<String, EsploraError> {
        (**self).get_text(url).await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TxStats {
    tx_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct AddressStats {
    chain_stats: TxStats,
    mempool_stats: TxStats,
}

impl AddressStats {
    fn is_used(&self) -> bool {
        self.chain_stats.tx_count + self.mempool_stats.tx_count > 0
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
    block_hash: Option<String>,
    block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct TxOutput {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct TxInput {
    /// None for coinbase inputs.
    prevout: Option<TxOutput>,
    sequence: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    vin: Vec<TxInput>,
    vout: Vec<TxOutput>,
    fee: u64,
    status: TxStatus,
}

impl EsploraTx {
    fn signals_rbf(&self) -> bool {
        self.vin
            .iter()
            .any(|txin| txin.sequence < RBF_SEQUENCE_CEILING)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    status: TxStatus,
    value: u64,
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, EsploraError> {
    serde_json::from_str(body).map_err(|e| EsploraError::Json(e.to_string()))
}

/// Turn the transactions of the account into operations, newest first. Unconfirmed
/// transactions are dated `now`, synchronization then keeps the date they were first seen at.
fn build_operations(
    account_id: &str,
    txs: &[EsploraTx],
    own: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<Operation> {
    let is_own = |output: &TxOutput| {
        output
            .scriptpubkey_address
            .as_ref()
            .is_some_and(|address| own.contains(address))
    };
    let mut operations: Vec<Operation> = txs
        .iter()
        .filter_map(|tx| {
            let spent: u64 = tx
                .vin
                .iter()
                .filter_map(|txin| txin.prevout.as_ref())
                .filter(|prevout| is_own(*prevout))
                .map(|prevout| prevout.value)
                .sum();
            let received: u64 = tx
                .vout
                .iter()
                .filter(|txout| is_own(*txout))
                .map(|txout| txout.value)
                .sum();
            let mut senders: Vec<String> = Vec::new();
            for address in tx
                .vin
                .iter()
                .filter_map(|txin| txin.prevout.as_ref()?.scriptpubkey_address.clone())
            {
                if !senders.contains(&address) {
                    senders.push(address);
                }
            }
            let (kind, value, recipients) = if spent > 0 {
                let mut recipients: Vec<String> = tx
                    .vout
                    .iter()
                    .filter(|txout| !is_own(*txout))
                    .filter_map(|txout| txout.scriptpubkey_address.clone())
                    .collect();
                // Sent to ourselves.
                if recipients.is_empty() {
                    recipients = tx
                        .vout
                        .iter()
                        .filter_map(|txout| txout.scriptpubkey_address.clone())
                        .collect();
                }
                (OperationKind::Out, spent.saturating_sub(received), recipients)
            } else if received > 0 {
                let recipients = tx
                    .vout
                    .iter()
                    .filter(|txout| is_own(*txout))
                    .filter_map(|txout| txout.scriptpubkey_address.clone())
                    .collect();
                (OperationKind::In, received, recipients)
            } else {
                log::warn!("Transaction '{}' does not involve the account.", tx.txid);
                return None;
            };

            let confirmed = tx.status.confirmed;
            let date = tx
                .status
                .block_time
                .filter(|_| confirmed)
                .and_then(|time| DateTime::from_timestamp(time, 0))
                .unwrap_or(now);
            Some(Operation {
                id: encode_operation_id(account_id, &tx.txid, kind),
                hash: tx.txid.clone(),
                kind,
                value: value.into(),
                fee: tx.fee.into(),
                senders,
                recipients,
                block_height: tx.status.block_height.filter(|_| confirmed),
                block_hash: tx.status.block_hash.clone().filter(|_| confirmed),
                account_id: account_id.to_string(),
                date,
            })
        })
        .collect();
    operations.sort_by(|a, b| {
        b.block_height
            .unwrap_or(u64::MAX)
            .cmp(&a.block_height.unwrap_or(u64::MAX))
            .then(b.date.cmp(&a.date))
    });
    operations
}

/// The largest estimate for a confirmation target not further than `target` blocks, rounded up.
pub fn feerate_for_target(estimates: &BTreeMap<u16, f64>, target: u16) -> Option<u64> {
    estimates
        .range(..=target)
        .next_back()
        .map(|(_, rate)| (rate.ceil() as u64).max(1))
}

// The addresses of one chain (receive or change) of an account, as scanned.
#[derive(Debug, Default)]
struct ChainScan {
    /// Every derived address, by index.
    addresses: Vec<String>,
    used: Vec<String>,
    last_used: Option<u32>,
}

impl ChainScan {
    fn fresh(&self) -> Option<(u32, &String)> {
        let index = self.last_used.map_or(0, |i| i + 1);
        self.addresses
            .get(index as usize)
            .map(|address| (index, address))
    }
}

/// Fetches accounts from an Esplora server. Accounts with an extended public key are scanned
/// address by address, up to [`ADDRESS_GAP`] unused ones on each chain.
pub struct EsploraSource<C = reqwest::Client> {
    client: C,
    base_url: String,
    network: Network,
    secp: secp256k1::Secp256k1<secp256k1::VerifyOnly>,
}

impl EsploraSource<reqwest::Client> {
    pub fn new(base_url: &str, network: Network) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, network)
    }
}

impl<C: HttpClient> EsploraSource<C> {
    pub fn with_client(client: C, base_url: &str, network: Network) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            network,
            secp: secp256k1::Secp256k1::verification_only(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    async fn get_text(&self, path: &str) -> Result<String, EsploraError> {
        let url = format!("{}{}", self.base_url, path);
        log::trace!("GET {}", url);
        self.client.get_text(&url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, EsploraError> {
        parse_json(&self.get_text(path).await?)
    }

    pub async fn tip_height(&self) -> Result<u64, EsploraError> {
        let body = self.get_text("/blocks/tip/height").await?;
        body.trim()
            .parse()
            .map_err(|e| EsploraError::Json(format!("Invalid tip height '{}': {}", body, e)))
    }

    /// Feerate estimates (sat/vb) by confirmation target.
    pub async fn fee_estimates(&self) -> Result<BTreeMap<u16, f64>, EsploraError> {
        let estimates: HashMap<String, f64> = self.get_json("/fee-estimates").await?;
        estimates
            .into_iter()
            .map(|(target, rate)| {
                target
                    .parse::<u16>()
                    .map(|target| (target, rate))
                    .map_err(|e| EsploraError::Json(format!("Invalid target '{}': {}", target, e)))
            })
            .collect()
    }

    async fn address_stats(&self, address: &str) -> Result<AddressStats, EsploraError> {
        self.get_json(&format!("/address/{}", address)).await
    }

    async fn scan_chain(
        &self,
        xpub: &Xpub,
        kind: AddressKind,
        chain: u32,
    ) -> Result<ChainScan, FetchError> {
        let mut scan = ChainScan::default();
        let mut gap = 0;
        let mut index = 0;
        while gap < ADDRESS_GAP {
            let path = [
                ChildNumber::from_normal_idx(chain),
                ChildNumber::from_normal_idx(index),
            ]
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
            let key = xpub
                .derive_pub(&self.secp, &path)
                .map_err(|e| FetchError::Malformed(e.to_string()))?
                .to_pub();
            let address = kind.address(&self.secp, &key, self.network).to_string();

            if self.address_stats(&address).await?.is_used() {
                scan.used.push(address.clone());
                scan.last_used = Some(index);
                gap = 0;
            } else {
                gap += 1;
            }
            scan.addresses.push(address);
            index += 1;
        }
        Ok(scan)
    }

    // Transactions of this address, newest first. Stops after the one with hash `since`, or
    // once `limit` transactions were fetched.
    async fn address_txs(
        &self,
        address: &str,
        since: Option<&str>,
        limit: Option<usize>,
    ) -> Result<(Vec<EsploraTx>, bool), EsploraError> {
        let mut txs: Vec<EsploraTx> = Vec::new();
        let mut page: Vec<EsploraTx> = self.get_json(&format!("/address/{}/txs", address)).await?;
        loop {
            let confirmed = page.iter().filter(|tx| tx.status.confirmed).count();
            let last_txid = page.last().map(|tx| tx.txid.clone());
            for tx in page {
                let found_since = since == Some(tx.txid.as_str());
                txs.push(tx);
                if found_since {
                    return Ok((txs, false));
                }
                if limit.is_some_and(|limit| txs.len() >= limit) {
                    return Ok((txs, true));
                }
            }
            match last_txid {
                Some(txid) if confirmed >= CONFIRMED_PAGE_SIZE => {
                    page = self
                        .get_json(&format!("/address/{}/txs/chain/{}", address, txid))
                        .await?;
                }
                _ => return Ok((txs, false)),
            }
        }
    }

    async fn address_utxos(
        &self,
        address: &str,
        txs: &HashMap<String, EsploraTx>,
    ) -> Result<Vec<Utxo>, FetchError> {
        let utxos: Vec<EsploraUtxo> = self
            .get_json(&format!("/address/{}/utxo", address))
            .await?;
        let mut parsed = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let txid =
                Txid::from_str(&utxo.txid).map_err(|e| FetchError::Malformed(e.to_string()))?;
            let rbf = if utxo.status.confirmed {
                false
            } else if let Some(tx) = txs.get(&utxo.txid) {
                tx.signals_rbf()
            } else {
                let tx: EsploraTx = self.get_json(&format!("/tx/{}", utxo.txid)).await?;
                tx.signals_rbf()
            };
            parsed.push(Utxo {
                outpoint: OutPoint::new(txid, utxo.vout),
                value: utxo.value,
                block_height: utxo
                    .status
                    .block_height
                    .filter(|_| utxo.status.confirmed)
                    .and_then(|height| u32::try_from(height).ok()),
                rbf,
                address: address.to_string(),
            });
        }
        Ok(parsed)
    }
}

#[async_trait]
impl<C: HttpClient> ChainDataSource for EsploraSource<C> {
    async fn fetch_account_shape(
        &self,
        request: &ShapeRequest,
        config: &SyncConfig,
    ) -> Result<AccountShape, FetchError> {
        if network_of(&request.currency) != Some(self.network) {
            return Err(FetchError::Malformed(format!(
                "Currency '{}' is not served by this {} backend",
                request.currency.id, self.network
            )));
        }
        let kind = AddressKind::from_mode_name(&request.derivation_mode).ok_or_else(|| {
            FetchError::Malformed(format!(
                "Unknown derivation mode '{}'",
                request.derivation_mode
            ))
        })?;

        let (used, own, fresh, change) = match &request.xpub {
            Some(xpub) => {
                let xpub =
                    Xpub::from_str(xpub).map_err(|e| FetchError::Malformed(e.to_string()))?;
                let receive = self.scan_chain(&xpub, kind, 0).await?;
                let change = self.scan_chain(&xpub, kind, 1).await?;
                let path = |chain: u32, index: u32| {
                    format!(
                        "{}'/{}'/{}'/{}/{}",
                        kind.purpose(),
                        request.currency.coin_type,
                        request.index,
                        chain,
                        index
                    )
                };
                let fresh = receive
                    .fresh()
                    .map(|(index, address)| (address.clone(), path(0, index)));
                let change_address = change
                    .fresh()
                    .map(|(index, address)| (address.clone(), path(1, index)));
                let own: HashSet<String> = receive
                    .addresses
                    .iter()
                    .chain(change.addresses.iter())
                    .cloned()
                    .collect();
                let used: Vec<String> = receive.used.into_iter().chain(change.used).collect();
                (used, own, fresh, change_address)
            }
            None => {
                let stats = self.address_stats(&request.address).await?;
                let used = if stats.is_used() {
                    vec![request.address.clone()]
                } else {
                    Vec::new()
                };
                let own = HashSet::from([request.address.clone()]);
                (used, own, None, None)
            }
        };
        log::debug!(
            "Account '{}' has {} used addresses",
            request.account_id,
            used.len()
        );

        let mut has_more = false;
        let mut txs: HashMap<String, EsploraTx> = HashMap::new();
        for address in &used {
            let (address_txs, truncated) = self
                .address_txs(address, request.since.as_deref(), config.max_operations)
                .await?;
            has_more |= truncated;
            for tx in address_txs {
                txs.insert(tx.txid.clone(), tx);
            }
        }
        let mut utxos = Vec::new();
        for address in &used {
            utxos.extend(self.address_utxos(address, &txs).await?);
        }
        utxos.sort_by_key(|utxo| utxo.outpoint);
        let block_height = self.tip_height().await?;

        let txs: Vec<EsploraTx> = txs.into_values().collect();
        let mut operations = build_operations(&request.account_id, &txs, &own, Utc::now());
        if let Some(max) = config.max_operations {
            if operations.len() > max {
                operations.truncate(max);
                has_more = true;
            }
        }

        let resources = BitcoinResources {
            utxos,
            change_address: change.as_ref().map(|(address, _)| address.clone()),
            change_address_path: change.map(|(_, path)| path),
        };
        Ok(AccountShape {
            balance: resources.balance().into(),
            spendable_balance: Some(resources.spendable_balance().into()),
            block_height,
            operations,
            operations_count: None,
            fresh_address: fresh.as_ref().map(|(address, _)| address.clone()),
            fresh_address_path: fresh.map(|(_, path)| path),
            resources: Some(resources.to_value().map_err(|e| FetchError::Malformed(e.to_string()))?),
            has_more,
        })
    }
}
