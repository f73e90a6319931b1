//! Account discovery and incremental synchronization for multi-chain wallets.
//!
//! Chain-specific logic lives behind the [`family::ChainFamily`] trait. This crate drives it:
//! [`discovery::discover`] finds the accounts of a seed on a signing device,
//! [`sync::sync_account`] keeps them up to date and [`cache::ComputationCache`] memoizes the
//! expensive computations done on top of an account snapshot.

pub mod account;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod derivation;
pub mod discovery;
pub mod error;
pub mod family;
pub mod logger;
pub mod merge;
pub mod sync;
#[cfg(test)]
mod testutils;

pub use account::{Account, Operation, OperationKind};
pub use cache::ComputationCache;
pub use cancel::CancelFlag;
pub use config::Config;
pub use derivation::{Currency, DerivationMode};
pub use discovery::{discover, DiscoveryEvent, DiscoveryOutcome};
pub use error::{DeviceError, DiscoveryError, FetchError, InvariantViolation, SyncError};
pub use family::{
    AccountShape, AddressDeriver, ChainDataSource, ChainFamily, DerivedAddress, FamilyRegistry,
    RetentionPolicy, ShapeRequest,
};
pub use merge::merge_operations;
pub use sync::{sync_account, AccountUpdate};

use std::fmt;

#[derive(Debug, Clone)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub const VERSION: Version = Version { major: 0, minor: 1 };
