use crate::{
    account::{encode_account_id, encode_operation_id, Account, Operation, OperationKind},
    cancel::CancelFlag,
    config::SyncConfig,
    derivation::{Currency, DerivationMode},
    error::{DeviceError, FetchError},
    family::{
        AccountShape, AddressDeriver, ChainDataSource, ChainFamily, DerivedAddress, ShapeRequest,
    },
};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub fn btc() -> Currency {
    Currency {
        id: "bitcoin".to_string(),
        name: "Bitcoin".to_string(),
        ticker: "BTC".to_string(),
        coin_type: 0,
    }
}

pub fn date(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
}

/// An incoming operation of 1000 units at this timestamp.
pub fn op_at(account_id: &str, hash: &str, secs: i64, block_height: Option<u64>) -> Operation {
    Operation {
        id: encode_operation_id(account_id, hash, OperationKind::In),
        hash: hash.to_string(),
        kind: OperationKind::In,
        value: 1_000,
        fee: 0,
        senders: vec!["sender".to_string()],
        recipients: vec!["recipient".to_string()],
        block_height,
        block_hash: block_height.map(|h| format!("block{}", h)),
        account_id: account_id.to_string(),
        date: date(secs),
    }
}

/// An empty account, with a canonical identifier.
pub fn dummy_account(currency: &str, xpub: &str, derivation_mode: &str) -> Account {
    Account {
        id: encode_account_id(currency, xpub, derivation_mode),
        currency: currency.to_string(),
        derivation_mode: derivation_mode.to_string(),
        index: 0,
        xpub_or_address: xpub.to_string(),
        fresh_address: format!("{}-fresh", xpub),
        fresh_address_path: "84'/0'/0'/0/0".to_string(),
        balance: 0,
        spendable_balance: 0,
        block_height: 0,
        operations: Arc::new(Vec::new()),
        operations_count: 0,
        operations_fully_loaded: false,
        pending_operations: Vec::new(),
        creation_date: date(1_600_000_000),
        last_sync_date: date(1_600_000_000),
        used: false,
        resources: None,
    }
}

pub fn shape_with_balance(balance: u128) -> AccountShape {
    AccountShape {
        balance,
        ..AccountShape::default()
    }
}

/// The address [`DummyDeriver`] derives for this mode and path.
pub fn address_for(mode: &str, path: &str) -> String {
    format!("{}:{}", mode, path)
}

#[derive(Default)]
pub struct DummyDeriver {
    closed: AtomicUsize,
    paths: Mutex<Vec<String>>,
    denied_modes: Vec<String>,
    fatal_path: Option<String>,
    cancel_after: Option<(usize, CancelFlag)>,
}

impl DummyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, mode: &str) -> Self {
        self.denied_modes.push(mode.to_string());
        self
    }

    pub fn fail_at(mut self, path: &str) -> Self {
        self.fatal_path = Some(path.to_string());
        self
    }

    /// Set the flag once this many derivations were requested.
    pub fn cancel_after(mut self, derivations: usize, flag: CancelFlag) -> Self {
        self.cancel_after = Some((derivations, flag));
        self
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn derived_paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressDeriver for DummyDeriver {
    async fn derive(
        &self,
        path: &str,
        mode: &DerivationMode,
        _: &Currency,
    ) -> Result<DerivedAddress, DeviceError> {
        if self.close_count() > 0 {
            return Err(DeviceError::Disconnected);
        }
        let derived_count = {
            let mut paths = self.paths.lock().unwrap();
            paths.push(path.to_string());
            paths.len()
        };
        if let Some((after, flag)) = &self.cancel_after {
            if derived_count >= *after {
                flag.cancel();
            }
        }
        if self.denied_modes.contains(&mode.name) {
            return Err(DeviceError::Denied);
        }
        if self.fatal_path.as_deref() == Some(path) {
            return Err(DeviceError::Unexpected("device exploded".to_string()));
        }

        Ok(DerivedAddress {
            address: address_for(&mode.name, path),
            public_key: format!("pk:{}", path),
            xpub: None,
        })
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A chain data source serving canned shapes by address. Unknown addresses are empty.
#[derive(Default)]
pub struct DummySource {
    shapes: Mutex<HashMap<String, Result<AccountShape, FetchError>>>,
    requests: Mutex<Vec<ShapeRequest>>,
}

impl DummySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: &str, shape: Result<AccountShape, FetchError>) {
        self.shapes
            .lock()
            .unwrap()
            .insert(address.to_string(), shape);
    }

    pub fn requests(&self) -> Vec<ShapeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainDataSource for DummySource {
    async fn fetch_account_shape(
        &self,
        request: &ShapeRequest,
        _: &SyncConfig,
    ) -> Result<AccountShape, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut shape = self
            .shapes
            .lock()
            .unwrap()
            .get(&request.address)
            .cloned()
            .unwrap_or_else(|| Ok(AccountShape::default()))?;
        // Like a real backend, attribute the operations to the requested account.
        for op in shape.operations.iter_mut() {
            op.account_id = request.account_id.clone();
            op.id = encode_operation_id(&request.account_id, &op.hash, op.kind);
        }
        Ok(shape)
    }
}

pub struct DummyFamily {
    pub source: Arc<DummySource>,
    pub modes: Vec<DerivationMode>,
}

impl DummyFamily {
    /// A single "native_segwit" mode with a gap limit of 2.
    pub fn new(source: DummySource) -> Self {
        let mut mode = DerivationMode::bip44_like("native_segwit", 84);
        mode.gap_limit = 2;
        Self {
            source: Arc::new(source),
            modes: vec![mode],
        }
    }

    pub fn with_modes(mut self, modes: Vec<DerivationMode>) -> Self {
        self.modes = modes;
        self
    }
}

impl ChainFamily for DummyFamily {
    fn name(&self) -> &str {
        "dummy"
    }

    fn derivation_modes(&self, _: &Currency) -> Vec<DerivationMode> {
        self.modes.clone()
    }

    fn data_source(&self) -> Arc<dyn ChainDataSource> {
        self.source.clone()
    }

    fn account_xpub(&self, account: &Account) -> Option<String> {
        Some(account.xpub_or_address.clone())
    }
}
