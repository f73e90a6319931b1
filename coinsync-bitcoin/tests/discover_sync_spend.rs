use coinsync::{
    account::encode_operation_id,
    config::{CacheConfig, SyncConfig},
    discovery::discover_currency,
    sync::sync,
    AccountShape, CancelFlag, ChainDataSource, Config, DiscoveryEvent, FamilyRegistry,
    FetchError, Operation, OperationKind, ShapeRequest,
};
use coinsync_bitcoin::{
    bitcoin_currencies,
    hwi::{ExtendedKeySource, HwiDeriver},
    network_of,
    prepare::{SpendEstimate, SpendIntent, SpendPreparer},
    resources::{BitcoinResources, Utxo},
    selection::SelectionStrategy,
    AddressKind, BitcoinFamily,
};

use std::{collections::BTreeSet, str::FromStr, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::DateTime;
use miniscript::bitcoin::{
    bip32::{ChildNumber, DerivationPath, Xpub},
    secp256k1, Network, OutPoint, Txid,
};

const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

struct SoftKeys(Xpub);

#[async_trait]
impl ExtendedKeySource for SoftKeys {
    async fn extended_pubkey(&self, _: &DerivationPath) -> Result<Xpub, async_hwi::Error> {
        Ok(self.0)
    }
}

fn regtest_address(xpub: &Xpub, chain: u32, index: u32) -> anyhow::Result<String> {
    let secp = secp256k1::Secp256k1::verification_only();
    let path = [
        ChildNumber::from_normal_idx(chain)?,
        ChildNumber::from_normal_idx(index)?,
    ];
    let key = xpub.derive_pub(&secp, &path)?.to_pub();
    Ok(AddressKind::P2wpkh
        .address(&secp, &key, Network::Regtest)
        .to_string())
}

// Only the first native segwit account of the seed was ever used.
struct OneAccount {
    change_address: String,
}

#[async_trait]
impl ChainDataSource for OneAccount {
    async fn fetch_account_shape(
        &self,
        request: &ShapeRequest,
        _: &SyncConfig,
    ) -> Result<AccountShape, FetchError> {
        if request.derivation_mode != "native_segwit" || request.index != 0 {
            return Err(FetchError::NotFound);
        }
        let hash = "aa".repeat(32);
        let operation = Operation {
            id: encode_operation_id(&request.account_id, &hash, OperationKind::In),
            hash: hash.clone(),
            kind: OperationKind::In,
            value: 80_000,
            fee: 500,
            senders: vec!["bcrt1qsomeone".to_string()],
            recipients: vec![request.address.clone()],
            block_height: Some(150),
            block_hash: Some("00".repeat(32)),
            account_id: request.account_id.clone(),
            date: DateTime::from_timestamp(1_700_000_000, 0).ok_or(FetchError::NotFound)?,
        };
        let resources = BitcoinResources {
            utxos: vec![Utxo {
                outpoint: OutPoint::new(
                    Txid::from_str(&hash).map_err(|e| FetchError::Malformed(e.to_string()))?,
                    0,
                ),
                value: 80_000,
                block_height: Some(150),
                rbf: false,
                address: request.address.clone(),
            }],
            change_address: Some(self.change_address.clone()),
            change_address_path: Some("84'/1'/0'/1/0".to_string()),
        };
        Ok(AccountShape {
            balance: 80_000,
            spendable_balance: None,
            block_height: 200,
            operations: vec![operation],
            operations_count: Some(1),
            fresh_address: None,
            fresh_address_path: None,
            resources: Some(
                resources
                    .to_value()
                    .map_err(|e| FetchError::Malformed(e.to_string()))?,
            ),
            has_more: false,
        })
    }
}

#[tokio::test]
async fn discover_sync_and_spend() -> anyhow::Result<()> {
    let xpub = Xpub::from_str(XPUB)?;
    let currency = bitcoin_currencies()
        .into_iter()
        .find(|c| network_of(c) == Some(Network::Regtest))
        .context("regtest currency")?;
    let source = OneAccount {
        change_address: regtest_address(&xpub, 1, 0)?,
    };
    let registry = FamilyRegistry::new().register(
        currency.clone(),
        Arc::new(BitcoinFamily::new(Arc::new(source))),
    );

    // Discovery
    let deriver = HwiDeriver::new(Arc::new(SoftKeys(xpub)), Network::Regtest);
    let (events, mut received) = tokio::sync::mpsc::channel(16);
    let outcome = discover_currency(
        &registry,
        &currency.id,
        &deriver,
        &Config::default(),
        &events,
        &CancelFlag::new(),
    )
    .await?;
    drop(events);
    assert!(deriver.is_closed());
    assert!(!outcome.cancelled);

    let mut accounts = Vec::new();
    while let Some(DiscoveryEvent::Discovered { account }) = received.recv().await {
        accounts.push(account);
    }
    assert_eq!(accounts.len(), outcome.emitted);
    assert!(accounts
        .iter()
        .all(|account| account.derivation_mode == "native_segwit"));
    let account = accounts
        .into_iter()
        .find(|account| account.used)
        .context("the used account")?;
    assert_eq!(account.xpub_or_address, XPUB);
    assert_eq!(account.balance, 80_000);
    assert_eq!(account.operations.len(), 1);

    // Nothing happened since: the history is left untouched.
    let update = sync(
        &registry,
        &account,
        &SyncConfig::default(),
        &CancelFlag::new(),
    )
    .await?
    .ok_or_else(|| anyhow!("synchronization was cancelled"))?;
    let synced = update.apply(&account);
    assert!(Arc::ptr_eq(&synced.operations, &account.operations));
    assert_eq!(synced.block_height, 200);

    // Spend from it.
    let preparer = SpendPreparer::new(Network::Regtest, CacheConfig::default());
    let intent = SpendIntent {
        recipient: regtest_address(&xpub, 0, 42)?,
        amount: 30_000,
        use_all_amount: false,
        fee_rate_vb: 5,
        strategy: SelectionStrategy::OptimizeSize,
        include_unconfirmed_rbf: false,
        excluded: BTreeSet::new(),
    };
    let SpendEstimate::Ready(spend) = preparer.estimate(&synced, &intent).await? else {
        anyhow::bail!("expected enough funds");
    };
    assert_eq!(spend.tx.input.len(), 1);
    assert_eq!(spend.tx.output.len(), 2);
    assert_eq!(
        spend.tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>() + spend.fee(),
        80_000
    );

    let mut too_much = intent.clone();
    too_much.amount = 100_000;
    assert!(matches!(
        preparer.estimate(&synced, &too_much).await?,
        SpendEstimate::Insufficient { .. }
    ));

    Ok(())
}
