use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{
    CollectorKind, ExceptionSlot, HeapFrame, InstructionSet, InterpreterFrame,
    Method, RootKind, RootVisitor,
};

/// One tier-contiguous region of a thread's stack.
///
/// A fragment carries either the innermost interpreter frame of a linked
/// chain or the base of the innermost compiled frame of a raw region, never
/// both. Fragments link newest to oldest; the boundary between two
/// fragments is a tier transition.
///
/// Compiled regions obey the call bridge's contract: frames are laid out
/// contiguously from low to high addresses, every frame base holds the
/// `*const Method` reference slot, and the region ends with a null method
/// slot.
#[derive(Debug)]
pub struct StackFragment {
    link: Option<NonNull<StackFragment>>,
    top_interp: Option<NonNull<InterpreterFrame>>,
    top_compiled: Option<NonNull<u8>>,
    /// Native code offset the innermost compiled frame is stopped at.
    top_compiled_off: u32,
}

impl StackFragment {
    #[must_use]
    pub fn interpreted(top: *mut InterpreterFrame) -> Self {
        Self {
            link: None,
            top_interp: NonNull::new(top),
            top_compiled: None,
            top_compiled_off: 0,
        }
    }

    #[must_use]
    pub fn compiled(base: *mut u8, native_off: u32) -> Self {
        Self {
            link: None,
            top_interp: None,
            top_compiled: NonNull::new(base),
            top_compiled_off: native_off,
        }
    }

    pub fn set_link(&mut self, link: Option<NonNull<StackFragment>>) {
        self.link = link;
    }

    #[inline]
    #[must_use]
    pub fn link(&self) -> Option<NonNull<StackFragment>> {
        self.link
    }

    #[inline]
    #[must_use]
    pub fn top_interp(&self) -> Option<NonNull<InterpreterFrame>> {
        self.top_interp
    }

    #[inline]
    #[must_use]
    pub fn top_compiled(&self) -> Option<NonNull<u8>> {
        self.top_compiled
    }

    #[inline]
    #[must_use]
    pub fn top_compiled_off(&self) -> u32 {
        self.top_compiled_off
    }
}

/// A register write captured for a compiled frame, parked in a
/// transitional frame until deoptimization replays it.
struct DeoptEntry {
    frame_id: usize,
    frame: HeapFrame,
    updated: Vec<bool>,
}

/// The stack layer's view of one VM thread: the fragment chain forming its
/// stack, its pending condition, its suspension flag and the table of
/// transitional deoptimization frames.
///
/// Single-writer: only the owning thread mutates the chain during normal
/// execution; other actors read it only while this thread is suspended.
pub struct VmThread {
    id: u32,
    isa: InstructionSet,
    collector: CollectorKind,
    suspended: AtomicBool,
    exception: ExceptionSlot,
    top_fragment: Option<NonNull<StackFragment>>,
    deopt_frames: Mutex<Vec<DeoptEntry>>,
}

// SAFETY: cross-thread access only happens under the suspension protocol;
// the interior tables are lock-protected.
unsafe impl Send for VmThread {}
// SAFETY: see above
unsafe impl Sync for VmThread {}

impl VmThread {
    #[must_use]
    pub fn new(id: u32, isa: InstructionSet, collector: CollectorKind) -> Self {
        Self {
            id,
            isa,
            collector,
            suspended: AtomicBool::new(false),
            exception: ExceptionSlot::new(),
            top_fragment: None,
            deopt_frames: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn isa(&self) -> InstructionSet {
        self.isa
    }

    #[inline]
    #[must_use]
    pub fn collector(&self) -> CollectorKind {
        self.collector
    }

    #[inline]
    #[must_use]
    pub fn exception(&self) -> &ExceptionSlot {
        &self.exception
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn set_top_fragment(&mut self, top: Option<NonNull<StackFragment>>) {
        self.top_fragment = top;
    }

    #[inline]
    #[must_use]
    pub fn top_fragment(&self) -> Option<NonNull<StackFragment>> {
        self.top_fragment
    }

    /// Reads a captured register write back out of the transitional frame,
    /// if one was recorded for this frame id and register.
    #[must_use]
    pub fn deopt_read(&self, frame_id: usize, vreg: usize) -> Option<u32> {
        let table = self.deopt_frames.lock();
        let entry = table.iter().find(|e| e.frame_id == frame_id)?;
        if !entry.updated.get(vreg).copied().unwrap_or(false) {
            return None;
        }
        Some(entry.frame.vreg(vreg) as u32)
    }

    /// Wide variant of `deopt_read`; both halves must have been recorded.
    #[must_use]
    pub fn deopt_read_pair(&self, frame_id: usize, vreg: usize) -> Option<u64> {
        let table = self.deopt_frames.lock();
        let entry = table.iter().find(|e| e.frame_id == frame_id)?;
        let updated = |i: usize| entry.updated.get(i).copied().unwrap_or(false);
        if !updated(vreg) || !updated(vreg + 1) {
            return None;
        }
        Some(entry.frame.vreg_long(vreg) as u64)
    }

    /// Records a register write against a compiled frame. The value lands
    /// in a heap-allocated transitional frame keyed by frame id; it only
    /// becomes visible to execution after deoptimization replays the frame
    /// in the interpreter.
    pub fn deopt_write(
        &self,
        frame_id: usize,
        method: *const Method,
        pc: u32,
        vreg: usize,
        value: u32,
        is_reference: bool,
    ) {
        let mut table = self.deopt_frames.lock();
        let entry = Self::entry_for(&mut table, frame_id, method, pc, self.collector);
        if is_reference {
            entry.frame.set_reference_bits(vreg, value);
        } else {
            entry.frame.set_vreg(vreg, value as i32);
        }
        entry.updated[vreg] = true;
    }

    /// Wide variant of `deopt_write`.
    pub fn deopt_write_pair(
        &self,
        frame_id: usize,
        method: *const Method,
        pc: u32,
        vreg: usize,
        value: u64,
    ) {
        let mut table = self.deopt_frames.lock();
        let entry = Self::entry_for(&mut table, frame_id, method, pc, self.collector);
        entry.frame.set_vreg_long(vreg, value as i64);
        entry.updated[vreg] = true;
        entry.updated[vreg + 1] = true;
    }

    fn entry_for<'t>(
        table: &'t mut Vec<DeoptEntry>,
        frame_id: usize,
        method: *const Method,
        pc: u32,
        collector: CollectorKind,
    ) -> &'t mut DeoptEntry {
        if let Some(idx) = table.iter().position(|e| e.frame_id == frame_id) {
            return &mut table[idx];
        }
        assert!(!method.is_null(), "transitional frame requires a method");
        // SAFETY: checked non-null; method metadata outlives the thread.
        let num_regs = unsafe { &*method }.registers as u32;
        log::debug!("parking transitional frame for frame id {frame_id} ({num_regs} registers)");
        let frame = HeapFrame::new(num_regs, std::ptr::null_mut(), method, pc, collector);
        table.push(DeoptEntry {
            frame_id,
            frame,
            updated: vec![false; num_regs as usize],
        });
        table.last_mut().expect("entry just pushed")
    }

    /// Hands the transitional frame for `frame_id` to the deoptimization
    /// machinery, removing it from the table. The caller owns the frame
    /// afterwards and must balance-check its ledger before discarding it.
    #[must_use]
    pub fn take_deopt_frame(&self, frame_id: usize) -> Option<HeapFrame> {
        let mut table = self.deopt_frames.lock();
        let idx = table.iter().position(|e| e.frame_id == frame_id)?;
        Some(table.remove(idx).frame)
    }

    /// Visits every frame-resident root this thread owns: the interpreter
    /// chains of all fragments, then the parked transitional frames.
    pub fn visit_roots(&self, visitor: &mut impl RootVisitor) {
        let mut frag = self.top_fragment;
        while let Some(f) = frag {
            // SAFETY: fragments stay valid while their calls are on the
            // stack; we only run under the suspension protocol.
            let fragment = unsafe { f.as_ref() };
            let mut cur = fragment.top_interp();
            while let Some(mut sf) = cur {
                // SAFETY: frames in a live chain are valid; single-writer
                // discipline (the owner is suspended).
                let frame = unsafe { sf.as_mut() };
                frame.visit_roots(self.id, visitor);
                cur = NonNull::new(frame.link());
            }
            frag = fragment.link();
        }
        let mut table = self.deopt_frames.lock();
        for entry in table.iter_mut() {
            entry
                .frame
                .visit_roots_as(RootKind::DeoptVReg, self.id, visitor);
        }
    }
}
