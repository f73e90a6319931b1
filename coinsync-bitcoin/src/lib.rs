//! The Bitcoin family of coinsync.
//!
//! Accounts are discovered on a signing device through [`hwi::HwiDeriver`], fetched from an
//! Esplora server by [`esplora::EsploraSource`], and spent from with the coin selection of
//! [`selection`] through the memoized [`prepare::SpendPreparer`].

pub mod esplora;
pub mod hwi;
pub mod modes;
pub mod prepare;
pub mod resources;
pub mod selection;
#[cfg(test)]
mod testutils;

pub use modes::{bitcoin_currencies, network_of, AddressKind};

use coinsync::{Account, ChainDataSource, ChainFamily, Currency, DerivationMode, FamilyRegistry};

use std::sync::Arc;

use miniscript::bitcoin::Network;

/// Bitcoin accounts are tracked by extended public key, for every address kind.
pub struct BitcoinFamily {
    source: Arc<dyn ChainDataSource>,
}

impl BitcoinFamily {
    pub fn new(source: Arc<dyn ChainDataSource>) -> Self {
        Self { source }
    }

    pub fn esplora(base_url: &str, network: Network) -> Self {
        Self::new(Arc::new(esplora::EsploraSource::new(base_url, network)))
    }
}

impl ChainFamily for BitcoinFamily {
    fn name(&self) -> &str {
        "bitcoin"
    }

    fn derivation_modes(&self, _: &Currency) -> Vec<DerivationMode> {
        AddressKind::ALL
            .iter()
            .map(|kind| kind.derivation_mode())
            .collect()
    }

    fn data_source(&self) -> Arc<dyn ChainDataSource> {
        self.source.clone()
    }

    fn account_xpub(&self, account: &Account) -> Option<String> {
        Some(account.xpub_or_address.clone())
    }
}

/// Register the currency of this network, served by the Esplora server at `base_url`.
pub fn register_esplora(
    registry: FamilyRegistry,
    base_url: &str,
    network: Network,
) -> FamilyRegistry {
    match bitcoin_currencies()
        .into_iter()
        .find(|currency| network_of(currency) == Some(network))
    {
        Some(currency) => {
            registry.register(currency, Arc::new(BitcoinFamily::esplora(base_url, network)))
        }
        None => {
            log::error!("No currency for network '{}'", network);
            registry
        }
    }
}
