#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use coinsync_bitcoin::{
    resources::Utxo,
    selection::{SelectionParams, SelectionStrategy, UtxoSelector},
    AddressKind,
};
use miniscript::bitcoin::{hashes::Hash, OutPoint, ScriptBuf, Txid, WPubkeyHash};

use std::collections::BTreeSet;

#[derive(Debug, Arbitrary)]
struct FuzzUtxo {
    txid: u8,
    vout: u8,
    value: u32,
    block_height: Option<u16>,
    rbf: bool,
    excluded: bool,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    utxos: Vec<FuzzUtxo>,
    amount: u32,
    use_all_amount: bool,
    fee_rate_vb: u16,
    strategy: u8,
    kind: u8,
    include_unconfirmed_rbf: bool,
}

fuzz_target!(|input: FuzzInput| {
    if input.utxos.len() > 200 {
        return;
    }
    let utxos: Vec<Utxo> = input
        .utxos
        .iter()
        .map(|u| Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([u.txid; 32]), u.vout.into()),
            value: u.value.into(),
            block_height: u.block_height.map(u32::from),
            rbf: u.rbf,
            address: String::new(),
        })
        .collect();
    let excluded: BTreeSet<OutPoint> = input
        .utxos
        .iter()
        .zip(utxos.iter())
        .filter(|(u, _)| u.excluded)
        .map(|(_, utxo)| utxo.outpoint)
        .collect();
    let strategy = match input.strategy % 3 {
        0 => SelectionStrategy::MergeOutputs,
        1 => SelectionStrategy::DeepestFirst,
        _ => SelectionStrategy::OptimizeSize,
    };
    let kind = AddressKind::ALL[usize::from(input.kind) % AddressKind::ALL.len()];
    let recipient = ScriptBuf::new_p2wpkh(&WPubkeyHash::all_zeros());
    let params = SelectionParams {
        recipient: &recipient,
        amount: input.amount.into(),
        use_all_amount: input.use_all_amount,
        fee_rate_vb: input.fee_rate_vb.into(),
        strategy,
        excluded: &excluded,
        include_unconfirmed_rbf: input.include_unconfirmed_rbf,
    };

    let selector = UtxoSelector::new(kind);
    if let Ok(selection) = selector.select(&utxos, &params) {
        let total: u64 = selection.inputs.iter().map(|u| u.value).sum();
        assert_eq!(
            total,
            selection.recipient_value + selection.change.unwrap_or(0) + selection.fee
        );
        assert!(selection
            .inputs
            .iter()
            .all(|u| !excluded.contains(&u.outpoint)));
        assert!(selection
            .inputs
            .iter()
            .all(|u| params.include_unconfirmed_rbf || !u.is_volatile()));
        // Same inputs, same result.
        assert_eq!(selector.select(&utxos, &params), Ok(selection));
    }
});
