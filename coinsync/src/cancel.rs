use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared flag telling a discovery or synchronization run to stop as soon as possible.
///
/// Cancelling is not an error: a cancelled run completes normally, without emitting anything
/// more.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        log::info!("Cancellation requested.");
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
