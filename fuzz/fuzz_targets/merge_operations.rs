#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use coinsync::{merge_operations, Operation, OperationKind};

use std::sync::Arc;

#[derive(Debug, Arbitrary)]
struct FuzzOp {
    hash: u8,
    incoming: bool,
    value: u16,
    block_height: Option<u8>,
    date: u16,
}

impl FuzzOp {
    fn operation(&self) -> Operation {
        let kind = if self.incoming {
            OperationKind::In
        } else {
            OperationKind::Out
        };
        let hash = format!("{:02x}", self.hash);
        Operation {
            id: format!("acc-{}-{}", hash, kind),
            hash,
            kind,
            value: self.value.into(),
            fee: 0,
            senders: Vec::new(),
            recipients: Vec::new(),
            block_height: self.block_height.map(u64::from),
            block_hash: self.block_height.map(|h| format!("block{}", h)),
            account_id: "acc".to_string(),
            date: chrono::DateTime::from_timestamp(1_600_000_000 + i64::from(self.date) * 60, 0)
                .unwrap(),
        }
    }
}

fuzz_target!(|input: (Vec<FuzzOp>, Vec<FuzzOp>)| {
    let (existing, incoming) = input;
    let existing = merge_operations(
        &Arc::new(Vec::new()),
        existing.iter().map(FuzzOp::operation).collect(),
    );
    let incoming: Vec<Operation> = incoming.iter().map(FuzzOp::operation).collect();
    let merged = merge_operations(&existing, incoming.clone());

    // Newest first, unique identifiers, every incoming operation present.
    assert!(merged.windows(2).all(|w| w[0].date >= w[1].date));
    let mut ids: Vec<&str> = merged.iter().map(|op| op.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), merged.len());
    for op in &incoming {
        assert!(merged.iter().any(|m| m.id == op.id));
    }

    // Merging again is a no-op.
    let again = merge_operations(&merged, incoming);
    assert!(Arc::ptr_eq(&again, &merged));
});
