use parking_lot::Mutex;
use thiserror::Error;

/// Catchable conditions this layer can raise. Raising one stores it into
/// the owning thread's pending slot; the execution loop turns it into a
/// language-level exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),
}

/// A thread's pending-condition slot.
///
/// Interior-mutable so the ledger can raise through a shared borrow while
/// the frame chain is borrowed elsewhere.
#[derive(Debug, Default)]
pub struct ExceptionSlot {
    pending: Mutex<Option<VmError>>,
}

impl ExceptionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn raise(&self, err: VmError) {
        log::debug!("raising {err}");
        *self.pending.lock() = Some(err);
    }

    pub fn clear(&self) {
        *self.pending.lock() = None;
    }

    pub fn take(&self) -> Option<VmError> {
        self.pending.lock().take()
    }

    #[must_use]
    pub fn pending(&self) -> Option<VmError> {
        self.pending.lock().clone()
    }
}
