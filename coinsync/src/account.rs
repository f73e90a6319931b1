//! Accounts and operations.
//!
//! Both are persisted by the caller. They serialize to a flat representation where amounts are
//! decimal strings and dates are ISO-8601 strings.

use crate::error::InvariantViolation;

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every account identifier. Bump it if the encoding ever changes: accounts stored
/// with the previous scheme will then go through an identity migration on their next sync.
pub const ACCOUNT_ID_VERSION: &str = "cs:1";

/// Serialize amounts as decimal strings, they don't fit in a JSON number.
pub mod amount_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        string
            .parse::<u128>()
            .map_err(|e| de::Error::custom(format!("Error parsing amount '{}': {}", string, e)))
    }
}

/// Identifier of the account for this currency, identity discriminant (an extended public key
/// or an address) and derivation mode. Never derived from mutable data.
pub fn encode_account_id(currency_id: &str, xpub_or_address: &str, derivation_mode: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        ACCOUNT_ID_VERSION, currency_id, xpub_or_address, derivation_mode
    )
}

/// Identifier of an operation. The same on-chain event always gets the same identifier.
pub fn encode_operation_id(account_id: &str, hash: &str, kind: OperationKind) -> String {
    format!("{}-{}-{}", account_id, hash, kind)
}

/// The ledger-visible effect of a transaction on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    In,
    Out,
    Fees,
    Delegate,
    Undelegate,
    None,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::In => "IN",
            Self::Out => "OUT",
            Self::Fees => "FEES",
            Self::Delegate => "DELEGATE",
            Self::Undelegate => "UNDELEGATE",
            Self::None => "NONE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(Self::In),
            "OUT" => Ok(Self::Out),
            "FEES" => Ok(Self::Fees),
            "DELEGATE" => Ok(Self::Delegate),
            "UNDELEGATE" => Ok(Self::Undelegate),
            "NONE" => Ok(Self::None),
            _ => Err(format!("Unknown operation type '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(with = "amount_str")]
    pub value: u128,
    #[serde(with = "amount_str")]
    pub fee: u128,
    pub senders: Vec<String>,
    pub recipients: Vec<String>,
    /// None while unconfirmed.
    pub block_height: Option<u64>,
    pub block_hash: Option<String>,
    pub account_id: String,
    pub date: DateTime<Utc>,
}

impl Operation {
    pub fn is_confirmed(&self) -> bool {
        self.block_height.is_some()
    }
}

/// One derived wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    /// Identifier of the currency of this account.
    pub currency: String,
    pub derivation_mode: String,
    pub index: u32,
    /// Identity discriminant: an extended public key for UTXO-model chains, the address for
    /// account-model chains.
    pub xpub_or_address: String,
    /// Current receive address.
    pub fresh_address: String,
    pub fresh_address_path: String,
    #[serde(with = "amount_str")]
    pub balance: u128,
    #[serde(with = "amount_str")]
    pub spendable_balance: u128,
    /// Last chain height seen.
    pub block_height: u64,
    /// Newest first. Shared so that an unchanged history is never reallocated.
    pub operations: Arc<Vec<Operation>>,
    pub operations_count: u64,
    /// Whether `operations` holds the whole history. Incremental pulls rely on it.
    pub operations_fully_loaded: bool,
    pub pending_operations: Vec<Operation>,
    pub creation_date: DateTime<Utc>,
    pub last_sync_date: DateTime<Utc>,
    pub used: bool,
    /// Family-specific resources (for instance the UTXO set of a Bitcoin account).
    pub resources: Option<serde_json::Value>,
}

impl Account {
    /// The identifier this account should have given its identity fields.
    pub fn canonical_id(&self) -> String {
        encode_account_id(&self.currency, &self.xpub_or_address, &self.derivation_mode)
    }

    /// An account is empty if it never had any operation and holds no funds.
    pub fn is_empty_account(&self) -> bool {
        self.operations_count == 0 && self.operations.is_empty() && self.balance == 0
    }

    /// A copy of this account with all derived and incremental state cleared.
    pub fn without_history(&self) -> Account {
        Account {
            operations: Arc::new(Vec::new()),
            operations_count: 0,
            operations_fully_loaded: false,
            pending_operations: Vec::new(),
            resources: None,
            ..self.clone()
        }
    }

    /// Most recent known operation, used as the starting point of incremental pulls.
    pub fn latest_operation(&self) -> Option<&Operation> {
        self.operations.first()
    }
}

/// Sanity check a list of operations returned by a collaborator for an account.
pub fn check_operations(
    account_id: &str,
    operations: &[Operation],
) -> Result<(), InvariantViolation> {
    for op in operations {
        if op.id.is_empty() {
            return Err(InvariantViolation::MissingField("id"));
        }
        if op.hash.is_empty() {
            return Err(InvariantViolation::MissingField("hash"));
        }
        if op.account_id != account_id {
            return Err(InvariantViolation::ForeignOperation {
                operation_id: op.id.clone(),
                account_id: account_id.to_string(),
            });
        }
    }
    Ok(())
}
