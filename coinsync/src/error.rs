//! Error types shared by discovery and synchronization.
//!
//! Errors coming out of a single derivation mode during discovery may be recoverable (the
//! mode is skipped), everything else terminates the current run and is reported along with
//! the currency or account it concerns.

use std::{error, fmt};

/// An error reported by the signing device while deriving an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user refused the derivation on the device.
    Denied,
    /// The device (or its app) does not support this derivation mode.
    UnsupportedMode(String),
    /// Communication with the device failed.
    Transport(String),
    /// The transport was already released.
    Disconnected,
    /// Anything else.
    Unexpected(String),
}

impl DeviceError {
    /// Whether discovery may skip the current derivation mode and carry on with the next one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Denied | Self::UnsupportedMode(_) | Self::Transport(_)
        )
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Denied => write!(f, "Derivation denied on the device"),
            Self::UnsupportedMode(mode) => {
                write!(f, "Derivation mode '{}' is not supported by the device", mode)
            }
            Self::Transport(e) => write!(f, "Device transport error: {}", e),
            Self::Disconnected => write!(f, "Device transport was released"),
            Self::Unexpected(e) => write!(f, "Unexpected device error: {}", e),
        }
    }
}

impl error::Error for DeviceError {}

/// An error reported by a chain data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The backend does not know about this address or wallet. This means the account is
    /// empty, not that something went wrong.
    NotFound,
    /// A network or backend failure. Retrying the whole call may succeed.
    Transient(String),
    /// The backend answered something we could not make sense of.
    Malformed(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "Account not found by the chain data source"),
            Self::Transient(e) => write!(f, "Chain data source error: {}", e),
            Self::Malformed(e) => write!(f, "Malformed chain data source response: {}", e),
        }
    }
}

impl error::Error for FetchError {}

/// A collaborator handed us data which breaks an invariant of the data model. These are bugs,
/// they are never coerced into something valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    MissingField(&'static str),
    ForeignOperation {
        operation_id: String,
        account_id: String,
    },
    SpendableAboveBalance {
        spendable: u128,
        balance: u128,
    },
    CurrencyMismatch {
        expected: String,
        actual: String,
    },
    InvalidValue(String),
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "Missing required field '{}'", field),
            Self::ForeignOperation {
                operation_id,
                account_id,
            } => write!(
                f,
                "Operation '{}' does not belong to account '{}'",
                operation_id, account_id
            ),
            Self::SpendableAboveBalance { spendable, balance } => write!(
                f,
                "Spendable balance {} is larger than the balance {}",
                spendable, balance
            ),
            Self::CurrencyMismatch { expected, actual } => write!(
                f,
                "Expected currency '{}' but got '{}'",
                expected, actual
            ),
            Self::InvalidValue(e) => write!(f, "Invalid value: {}", e),
        }
    }
}

impl error::Error for InvariantViolation {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryErrorKind {
    Device(DeviceError),
    Fetch(FetchError),
    Invariant(InvariantViolation),
    UnknownCurrency,
}

impl fmt::Display for DiscoveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Device(e) => write!(f, "{}", e),
            Self::Fetch(e) => write!(f, "{}", e),
            Self::Invariant(e) => write!(f, "BUG! {}", e),
            Self::UnknownCurrency => write!(f, "No chain family registered"),
        }
    }
}

/// Fatal error of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryError {
    /// The currency being scanned.
    pub currency: String,
    pub kind: DiscoveryErrorKind,
}

impl DiscoveryError {
    pub fn new(currency: impl Into<String>, kind: DiscoveryErrorKind) -> Self {
        Self {
            currency: currency.into(),
            kind,
        }
    }
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Discovery of '{}' failed: {}", self.currency, self.kind)
    }
}

impl error::Error for DiscoveryError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncErrorKind {
    Fetch(FetchError),
    Invariant(InvariantViolation),
    UnknownCurrency(String),
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "{}", e),
            Self::Invariant(e) => write!(f, "BUG! {}", e),
            Self::UnknownCurrency(c) => write!(f, "No chain family registered for '{}'", c),
        }
    }
}

/// Fatal error of a synchronization call. The account snapshot held by the caller is left
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncError {
    /// The account being synchronized.
    pub account_id: String,
    pub kind: SyncErrorKind,
}

impl SyncError {
    pub fn new(account_id: impl Into<String>, kind: SyncErrorKind) -> Self {
        Self {
            account_id: account_id.into(),
            kind,
        }
    }

    /// Whether retrying the whole synchronization later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, SyncErrorKind::Fetch(FetchError::Transient(_)))
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Synchronization of account '{}' failed: {}",
            self.account_id, self.kind
        )
    }
}

impl error::Error for SyncError {}

impl From<DeviceError> for DiscoveryErrorKind {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

impl From<FetchError> for DiscoveryErrorKind {
    fn from(e: FetchError) -> Self {
        Self::Fetch(e)
    }
}

impl From<InvariantViolation> for DiscoveryErrorKind {
    fn from(e: InvariantViolation) -> Self {
        Self::Invariant(e)
    }
}

impl From<FetchError> for SyncErrorKind {
    fn from(e: FetchError) -> Self {
        Self::Fetch(e)
    }
}

impl From<InvariantViolation> for SyncErrorKind {
    fn from(e: InvariantViolation) -> Self {
        Self::Invariant(e)
    }
}
