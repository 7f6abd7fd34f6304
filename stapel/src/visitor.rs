use crate::ObjRef;

/// Where a root slot lives, reported alongside every visited slot so the
/// collector can attribute it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RootKind {
    /// A virtual register's shadow slot inside an interpreter frame.
    VReg,
    /// A held-monitor entry in a frame's ledger.
    Monitor,
    /// A slot inside a transitional frame created for deoptimization.
    DeoptVReg,
}

#[derive(Debug, Copy, Clone)]
pub struct RootInfo {
    pub kind: RootKind,
    pub thread_id: u32,
    /// Register index for `VReg`/`DeoptVReg` roots, `None` for monitors.
    pub vreg: Option<u16>,
}

impl RootInfo {
    #[inline]
    #[must_use]
    pub fn vreg(kind: RootKind, thread_id: u32, vreg: u16) -> Self {
        Self {
            kind,
            thread_id,
            vreg: Some(vreg),
        }
    }

    #[inline]
    #[must_use]
    pub fn monitor(thread_id: u32) -> Self {
        Self {
            kind: RootKind::Monitor,
            thread_id,
            vreg: None,
        }
    }
}

/// Collector hook over a thread's frame-resident roots.
///
/// The visitor may rewrite the slot in place; relocation writes the object's
/// new address back through the `&mut`.
pub trait RootVisitor {
    fn visit_root(&mut self, slot: &mut ObjRef, info: RootInfo);
}

impl<F: FnMut(&mut ObjRef, RootInfo)> RootVisitor for F {
    #[inline]
    fn visit_root(&mut self, slot: &mut ObjRef, info: RootInfo) {
        self(slot, info)
    }
}
