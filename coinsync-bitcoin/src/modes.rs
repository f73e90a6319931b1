//! Bitcoin address kinds, and the derivation modes they are scanned with.

use coinsync::{Currency, DerivationMode};

use miniscript::bitcoin::{
    key::XOnlyPublicKey,
    secp256k1::{self, Verification},
    Address, CompressedPublicKey, Network,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressKind {
    /// BIP44
    P2pkh,
    /// BIP49
    P2shP2wpkh,
    /// BIP84
    P2wpkh,
    /// BIP86
    P2tr,
}

impl AddressKind {
    /// All kinds, in discovery order.
    pub const ALL: [AddressKind; 4] = [
        AddressKind::P2pkh,
        AddressKind::P2shP2wpkh,
        AddressKind::P2wpkh,
        AddressKind::P2tr,
    ];

    pub fn purpose(&self) -> u32 {
        match self {
            Self::P2pkh => 44,
            Self::P2shP2wpkh => 49,
            Self::P2wpkh => 84,
            Self::P2tr => 86,
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::P2pkh => "legacy",
            Self::P2shP2wpkh => "segwit",
            Self::P2wpkh => "native_segwit",
            Self::P2tr => "taproot",
        }
    }

    pub fn from_mode_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.mode_name() == name)
    }

    /// The derivation mode to discover accounts of this kind with. Only one account may be
    /// created ahead of use, and it is a native segwit one.
    pub fn derivation_mode(&self) -> DerivationMode {
        let mut mode = DerivationMode::bip44_like(self.mode_name(), self.purpose());
        mode.show_new_account = *self == Self::P2wpkh;
        mode
    }

    pub fn is_segwit(&self) -> bool {
        !matches!(self, Self::P2pkh)
    }

    /// Maximum difference in weight of an input spending this kind of output, before and after
    /// satisfaction.
    pub fn satisfaction_weight(&self) -> u64 {
        match self {
            // Signature and key pushes in the script sig (107 bytes), non-witness.
            Self::P2pkh => 107 * 4,
            // Redeem script push (23 bytes), plus the P2WPKH witness.
            Self::P2shP2wpkh => 23 * 4 + 108,
            // Item count, signature push (1 + 72) and key push (1 + 33).
            Self::P2wpkh => 108,
            // Item count, Schnorr signature push (1 + 64).
            Self::P2tr => 66,
        }
    }

    /// Weight of an output paying to this kind of address.
    pub fn output_weight(&self) -> u64 {
        // Amount (8), script length (1) and script.
        let script_len = match self {
            Self::P2pkh => 25,
            Self::P2shP2wpkh => 23,
            Self::P2wpkh => 22,
            Self::P2tr => 34,
        };
        (8 + 1 + script_len) * 4
    }

    pub fn address<C: Verification>(
        &self,
        secp: &secp256k1::Secp256k1<C>,
        key: &CompressedPublicKey,
        network: Network,
    ) -> Address {
        match self {
            Self::P2pkh => Address::p2pkh(key.pubkey_hash(), network),
            Self::P2shP2wpkh => Address::p2shwpkh(key, network),
            Self::P2wpkh => Address::p2wpkh(key, network),
            Self::P2tr => Address::p2tr(secp, XOnlyPublicKey::from(key.0), None, network),
        }
    }
}

/// The Bitcoin network of this currency, if it is one of ours.
pub fn network_of(currency: &Currency) -> Option<Network> {
    match currency.id.as_str() {
        "bitcoin" => Some(Network::Bitcoin),
        "bitcoin_testnet" => Some(Network::Testnet),
        "bitcoin_signet" => Some(Network::Signet),
        "bitcoin_regtest" => Some(Network::Regtest),
        _ => None,
    }
}

pub fn bitcoin_currencies() -> Vec<Currency> {
    [
        ("bitcoin", "Bitcoin", "BTC", 0),
        ("bitcoin_testnet", "Bitcoin Testnet", "tBTC", 1),
        ("bitcoin_signet", "Bitcoin Signet", "sBTC", 1),
        ("bitcoin_regtest", "Bitcoin Regtest", "rBTC", 1),
    ]
    .into_iter()
    .map(|(id, name, ticker, coin_type)| Currency {
        id: id.to_string(),
        name: name.to_string(),
        ticker: ticker.to_string(),
        coin_type,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::nums_key;

    #[test]
    fn mode_names() {
        for kind in AddressKind::ALL {
            assert_eq!(AddressKind::from_mode_name(kind.mode_name()), Some(kind));
            let mode = kind.derivation_mode();
            assert_eq!(mode.purpose, kind.purpose());
            assert_eq!(mode.show_new_account, kind == AddressKind::P2wpkh);
            assert!(mode.iterable);
        }
        assert_eq!(AddressKind::from_mode_name("segwit_unsplit"), None);
    }

    #[test]
    fn addresses() {
        let secp = secp256k1::Secp256k1::verification_only();
        let key = nums_key();
        let p2pkh = AddressKind::P2pkh.address(&secp, &key, Network::Bitcoin);
        assert!(p2pkh.to_string().starts_with('1'));
        let p2sh = AddressKind::P2shP2wpkh.address(&secp, &key, Network::Bitcoin);
        assert!(p2sh.to_string().starts_with('3'));
        let p2wpkh = AddressKind::P2wpkh.address(&secp, &key, Network::Bitcoin);
        assert!(p2wpkh.to_string().starts_with("bc1q"));
        let p2tr = AddressKind::P2tr.address(&secp, &key, Network::Bitcoin);
        assert!(p2tr.to_string().starts_with("bc1p"));
        let regtest = AddressKind::P2wpkh.address(&secp, &key, Network::Regtest);
        assert!(regtest.to_string().starts_with("bcrt1q"));

        // Output weights match what the addresses actually pay to.
        for (kind, address) in [
            (AddressKind::P2pkh, &p2pkh),
            (AddressKind::P2shP2wpkh, &p2sh),
            (AddressKind::P2wpkh, &p2wpkh),
            (AddressKind::P2tr, &p2tr),
        ] {
            let txout = miniscript::bitcoin::TxOut {
                value: miniscript::bitcoin::Amount::from_sat(10_000),
                script_pubkey: address.script_pubkey(),
            };
            assert_eq!(txout.weight().to_wu(), kind.output_weight());
        }
    }

    #[test]
    fn networks() {
        let currencies = bitcoin_currencies();
        assert_eq!(currencies.len(), 4);
        assert_eq!(network_of(&currencies[0]), Some(Network::Bitcoin));
        assert_eq!(currencies[1].coin_type, 1);
        assert_eq!(network_of(&currencies[3]), Some(Network::Regtest));
        let mut other = currencies[0].clone();
        other.id = "litecoin".to_string();
        assert_eq!(network_of(&other), None);
    }
}
