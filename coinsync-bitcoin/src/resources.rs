//! The Bitcoin-specific part of an account: its unspent outputs.

use coinsync::{Account, InvariantViolation};

use miniscript::bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

/// An unspent output of the account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// In satoshis.
    pub value: u64,
    /// None while unconfirmed.
    pub block_height: Option<u32>,
    /// Whether the transaction creating this output signals replaceability.
    pub rbf: bool,
    pub address: String,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.block_height.is_some()
    }

    /// Unconfirmed outputs of a replaceable transaction may vanish at any time.
    pub fn is_volatile(&self) -> bool {
        !self.is_confirmed() && self.rbf
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BitcoinResources {
    pub utxos: Vec<Utxo>,
    /// First unused address of the change chain.
    pub change_address: Option<String>,
    pub change_address_path: Option<String>,
}

impl BitcoinResources {
    /// Read the resources of a Bitcoin account. An account which was never synchronized has
    /// none.
    pub fn from_account(account: &Account) -> Result<Self, InvariantViolation> {
        match &account.resources {
            None => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                InvariantViolation::InvalidValue(format!(
                    "Bitcoin resources of account '{}': {}",
                    account.id, e
                ))
            }),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, InvariantViolation> {
        serde_json::to_value(self).map_err(|e| InvariantViolation::InvalidValue(e.to_string()))
    }

    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|utxo| utxo.value).sum()
    }

    /// What can be spent without relying on outputs which may be replaced.
    pub fn spendable_balance(&self) -> u64 {
        self.utxos
            .iter()
            .filter(|utxo| !utxo.is_volatile())
            .map(|utxo| utxo.value)
            .sum()
    }
}
