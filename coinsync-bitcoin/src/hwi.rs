//! Address derivation on a hardware signing device.

use crate::modes::AddressKind;

use coinsync::{AddressDeriver, Currency, DerivationMode, DerivedAddress, DeviceError};

use std::{
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use miniscript::bitcoin::{
    bip32::{ChildNumber, DerivationPath, Xpub},
    secp256k1, Network,
};

/// What we need from a signing device.
#[async_trait]
pub trait ExtendedKeySource: Send + Sync {
    async fn extended_pubkey(&self, path: &DerivationPath) -> Result<Xpub, async_hwi::Error>;
}

#[async_trait]
impl ExtendedKeySource for dyn async_hwi::HWI + Send + Sync {
    async fn extended_pubkey(&self, path: &DerivationPath) -> Result<Xpub, async_hwi::Error> {
        self.get_extended_pubkey(path).await
    }
}

fn device_error(e: async_hwi::Error) -> DeviceError {
    match e {
        async_hwi::Error::UserRefused => DeviceError::Denied,
        e => DeviceError::Transport(e.to_string()),
    }
}

/// Split a path at its last hardened step. The first part is what only the device can derive.
fn split_at_last_hardened(path: &DerivationPath) -> (DerivationPath, DerivationPath) {
    let steps: &[ChildNumber] = path.as_ref();
    let split = steps
        .iter()
        .rposition(|step| step.is_hardened())
        .map_or(0, |i| i + 1);
    let (hardened, unhardened) = steps.split_at(split);
    (
        DerivationPath::from(hardened.to_vec()),
        DerivationPath::from(unhardened.to_vec()),
    )
}

/// An [`AddressDeriver`] over a device handle of the `async_hwi` crate.
///
/// The device only ever gives us extended public keys: the non-hardened part of the paths is
/// derived on our side. Once closed, the handle is dropped and every derivation fails.
pub struct HwiDeriver<D: ?Sized = dyn async_hwi::HWI + Send + Sync> {
    device: Mutex<Option<Arc<D>>>,
    network: Network,
    secp: secp256k1::Secp256k1<secp256k1::VerifyOnly>,
}

impl<D: ExtendedKeySource + ?Sized> HwiDeriver<D> {
    pub fn new(device: Arc<D>, network: Network) -> Self {
        Self {
            device: Mutex::new(Some(device)),
            network,
            secp: secp256k1::Secp256k1::verification_only(),
        }
    }

    fn device(&self) -> Option<Arc<D>> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.device().is_none()
    }
}

#[async_trait]
impl<D: ExtendedKeySource + ?Sized> AddressDeriver for HwiDeriver<D> {
    async fn derive(
        &self,
        path: &str,
        mode: &DerivationMode,
        _: &Currency,
    ) -> Result<DerivedAddress, DeviceError> {
        let kind = AddressKind::from_mode_name(&mode.name)
            .ok_or_else(|| DeviceError::UnsupportedMode(mode.name.clone()))?;
        let device = self.device().ok_or(DeviceError::Disconnected)?;
        let path = DerivationPath::from_str(&format!("m/{}", path))
            .map_err(|e| DeviceError::Unexpected(format!("Invalid path '{}': {}", path, e)))?;

        let (account_path, rest) = split_at_last_hardened(&path);
        let account_xpub = device
            .extended_pubkey(&account_path)
            .await
            .map_err(device_error)?;
        let key = account_xpub
            .derive_pub(&self.secp, &rest)
            .map_err(|e| DeviceError::Unexpected(e.to_string()))?
            .to_pub();

        Ok(DerivedAddress {
            address: kind.address(&self.secp, &key, self.network).to_string(),
            public_key: key.to_string(),
            xpub: Some(account_xpub.to_string()),
        })
    }

    fn close(&self) {
        if self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::debug!("Released the signing device.");
        }
    }
}
