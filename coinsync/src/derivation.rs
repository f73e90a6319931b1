//! Currencies and the derivation modes used to scan them.

use serde::{Deserialize, Serialize};

/// Hard ceiling on the account index scanned for iterable derivation modes.
pub const MAX_ACCOUNT_INDEX: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    /// Unique identifier, e.g. "bitcoin" or "bitcoin_testnet".
    pub id: String,
    pub name: String,
    pub ticker: String,
    /// SLIP-44 coin type.
    pub coin_type: u32,
}

/// A named variant of the address derivation scheme of a chain family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationMode {
    pub name: String,
    /// BIP43 purpose.
    pub purpose: u32,
    /// Path template. Placeholders are `<purpose>`, `<coin_type>`, `<account>`, `<node>` and
    /// `<address>`.
    pub scheme: String,
    pub start_index: u32,
    /// Non-iterable modes only ever have a single account.
    pub iterable: bool,
    /// How many consecutive empty accounts are tolerated before the scan of this mode stops.
    pub gap_limit: u32,
    /// Whether the first empty account of the scan is surfaced, so a user may start using it.
    pub show_new_account: bool,
    /// Account indexes this mode cannot be used with.
    pub unsupported_indices: Vec<u32>,
}

impl DerivationMode {
    /// The usual `purpose'/coin_type'/account'/node/address` scheme.
    pub fn bip44_like(name: &str, purpose: u32) -> Self {
        DerivationMode {
            name: name.to_string(),
            purpose,
            scheme: "<purpose>'/<coin_type>'/<account>'/<node>/<address>".to_string(),
            start_index: 0,
            iterable: true,
            gap_limit: 0,
            show_new_account: false,
            unsupported_indices: Vec::new(),
        }
    }

    /// Exclusive upper bound of the scanned account indexes.
    pub fn index_ceiling(&self, max_index: u32) -> u32 {
        if self.iterable {
            max_index.min(MAX_ACCOUNT_INDEX)
        } else {
            self.start_index.saturating_add(1)
        }
    }

    pub fn supports_index(&self, index: u32) -> bool {
        !self.unsupported_indices.contains(&index)
    }

    fn run_scheme(&self, currency: &Currency, account: u32, node: u32, address: u32) -> String {
        self.scheme
            .replace("<purpose>", &self.purpose.to_string())
            .replace("<coin_type>", &currency.coin_type.to_string())
            .replace("<account>", &account.to_string())
            .replace("<node>", &node.to_string())
            .replace("<address>", &address.to_string())
    }

    /// Index-independent path, derived once per mode to check the device accepts it at all.
    pub fn seed_identifier_path(&self, currency: &Currency) -> String {
        format!("{}'/{}'/0'", self.purpose, currency.coin_type)
    }

    /// Path of the first receive address of the account at this index.
    pub fn fresh_address_path(&self, currency: &Currency, index: u32) -> String {
        self.run_scheme(currency, index, 0, 0)
    }

    pub fn candidate(&self, currency: &Currency, index: u32) -> DerivationCandidate {
        DerivationCandidate {
            derivation_mode: self.name.clone(),
            index,
            fresh_address_path: self.fresh_address_path(currency, index),
        }
    }
}

/// A point of the (derivation mode, index) space considered by discovery. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationCandidate {
    pub derivation_mode: String,
    pub index: u32,
    pub fresh_address_path: String,
}
