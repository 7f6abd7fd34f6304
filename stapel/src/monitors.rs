use crate::{ExceptionSlot, ObjRef, RootInfo, RootVisitor, VmError};

/// Per-frame record of the objects this frame currently holds locked.
///
/// A sequence, not a set: locking the same object recursively appends a
/// second entry, and every entry is a GC root while the owning frame is
/// live.
#[derive(Debug, Default)]
pub struct MonitorLedger {
    monitors: Vec<ObjRef>,
}

impl MonitorLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.monitors.len()
    }

    /// Records a lock acquisition. Skipped, not failed, when a condition
    /// is already pending on the owning thread.
    pub fn add_monitor(&mut self, exc: &ExceptionSlot, obj: ObjRef) {
        if exc.is_pending() {
            return;
        }
        self.monitors.push(obj);
    }

    /// Records a lock release. Clears any pending condition first, then
    /// removes the *most recent* matching entry, so recursive locks
    /// unwind newest-first. Raises IllegalMonitorState when no entry
    /// matches.
    pub fn remove_monitor_or_throw(&mut self, exc: &ExceptionSlot, obj: ObjRef) {
        exc.clear();
        match self.monitors.iter().rposition(|m| *m == obj) {
            Some(idx) => {
                self.monitors.remove(idx);
            }
            None => {
                exc.raise(VmError::IllegalMonitorState(format!(
                    "unlock of {:p} which this frame does not hold",
                    obj.as_ptr()
                )));
            }
        }
    }

    /// Called exactly once when the owning frame exits. Returns whether
    /// the ledger was balanced; raises IllegalMonitorState (clearing any
    /// pending condition) when locks are still outstanding.
    pub fn check_all_monitors_released_or_throw(&mut self, exc: &ExceptionSlot) -> bool {
        if self.monitors.is_empty() {
            return true;
        }
        exc.clear();
        exc.raise(VmError::IllegalMonitorState(format!(
            "frame exits holding {} lock(s)",
            self.monitors.len()
        )));
        false
    }

    /// Collector hook. The visitor may rewrite an entry in place after
    /// relocating the object.
    pub fn visit_monitors(&mut self, thread_id: u32, visitor: &mut impl RootVisitor) {
        for slot in &mut self.monitors {
            visitor.visit_root(slot, RootInfo::monitor(thread_id));
        }
    }
}
