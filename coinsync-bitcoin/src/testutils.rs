use crate::{
    esplora::{EsploraError, HttpClient},
    hwi::ExtendedKeySource,
    resources::Utxo,
};

use std::{str::FromStr, sync::Mutex};

use async_trait::async_trait;
use miniscript::bitcoin::{
    bip32::{DerivationPath, Xpub},
    hashes::Hash,
    CompressedPublicKey, OutPoint, Txid,
};

/// A key nobody knows the private key of.
pub fn nums_key() -> CompressedPublicKey {
    CompressedPublicKey::from_str(
        "0250929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0",
    )
    .unwrap()
}

pub fn nums_xpub() -> Xpub {
    Xpub::from_str("xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8").unwrap()
}

pub fn outpoint(n: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([n; 32]),
        vout,
    }
}

pub fn utxo(n: u8, value: u64, block_height: Option<u32>) -> Utxo {
    Utxo {
        outpoint: outpoint(n, 0),
        value,
        block_height,
        rbf: false,
        address: "bc1qdummy".to_string(),
    }
}

/// A signing device which hands out the same extended key for every path.
#[derive(Debug, Default)]
pub struct DummyHwi {
    refuse: bool,
    paths: Mutex<Vec<DerivationPath>>,
}

impl DummyHwi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn requested_paths(&self) -> Vec<DerivationPath> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtendedKeySource for DummyHwi {
    async fn extended_pubkey(&self, path: &DerivationPath) -> Result<Xpub, async_hwi::Error> {
        self.paths.lock().unwrap().push(path.clone());
        if self.refuse {
            return Err(async_hwi::Error::UserRefused);
        }
        Ok(nums_xpub())
    }
}

type Responder = Box<dyn Fn(&str) -> Result<String, EsploraError> + Send + Sync>;

/// An HTTP client answering from fixtures, recording every requested URL.
pub struct FixtureHttp {
    respond: Responder,
    requests: Mutex<Vec<String>>,
}

impl FixtureHttp {
    pub fn new(
        respond: impl Fn(&str) -> Result<String, EsploraError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for FixtureHttp {
    async fn get_text(&self, url: &str) -> Result<String, EsploraError> {
        self.requests.lock().unwrap().push(url.to_string());
        (self.respond)(url)
    }
}
