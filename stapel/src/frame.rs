use std::{
    alloc::{self, Layout},
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use crate::{
    CollectorKind, ExclusiveMutator, HeapObject, InsnStream, Method,
    MonitorLedger, ObjRef, RawValue, RootInfo, RootKind, RootVisitor,
    SharedMutator,
};

/// Bytes of one shadow reference cell.
const SHADOW_CELL: usize = mem::size_of::<usize>();

/// One interpreted method activation.
///
/// The struct is only the header: the same allocation carries two trailing
/// arrays, `num_regs` raw 4-byte register cells followed by `num_regs`
/// pointer-width shadow reference cells. The arrays stay colocated with
/// the header so a collector scan of the frame is one linear walk.
///
/// When a register holds a primitive, its shadow cell is null. When it
/// holds a reference, the shadow cell has the full address and the raw
/// cell mirrors its low 32 bits; after the collector moves the object only
/// the shadow cell is authoritative until root visitation re-syncs the
/// mirror.
///
/// `link` chains to the caller's frame within the same stack fragment,
/// innermost to outermost, and borrows it for the duration of the
/// enclosing call; no frame owns another.
#[repr(C)]
pub struct InterpreterFrame {
    link: *mut InterpreterFrame,
    method: *const Method,
    result_register: *mut RawValue,
    pc_ptr: *const u16,
    insns: *const InsnStream,
    ledger: MonitorLedger,
    num_regs: u32,
    pc: u32,
    cached_hotness: i16,
    hotness: i16,
    collector: CollectorKind,
    vregs: [u32; 0],
}

impl InterpreterFrame {
    /// Exact allocation size for a frame with `num_regs` registers.
    #[inline]
    #[must_use]
    pub fn size_for(num_regs: u32) -> usize {
        mem::size_of::<Self>() + num_regs as usize * 4 + num_regs as usize * SHADOW_CELL
    }

    fn layout_for(num_regs: u32) -> Layout {
        Layout::from_size_align(Self::size_for(num_regs), mem::align_of::<Self>())
            .expect("valid frame layout")
    }

    /// Writes a zero-initialized frame into `mem`.
    ///
    /// # Safety
    /// `mem` must be aligned for `InterpreterFrame` and point at
    /// `size_for(num_regs)` writable bytes.
    unsafe fn construct(
        mem: *mut u8,
        num_regs: u32,
        link: *mut InterpreterFrame,
        method: *const Method,
        pc: u32,
        collector: CollectorKind,
    ) -> NonNull<Self> {
        assert!(!method.is_null(), "interpreter frame requires a method");
        debug_assert_eq!(
            mem as usize % mem::align_of::<Self>(),
            0,
            "frame storage is misaligned"
        );
        let frame = mem as *mut Self;
        // SAFETY: caller provides an aligned, sufficiently sized buffer.
        unsafe {
            ptr::write(
                frame,
                Self {
                    link,
                    method,
                    result_register: ptr::null_mut(),
                    pc_ptr: ptr::null(),
                    insns: ptr::null(),
                    ledger: MonitorLedger::new(),
                    num_regs,
                    pc,
                    cached_hotness: 0,
                    hotness: 0,
                    collector,
                    vregs: [],
                },
            );
            let arrays = (*frame).vregs.as_mut_ptr() as *mut u8;
            ptr::write_bytes(arrays, 0, num_regs as usize * (4 + SHADOW_CELL));
            NonNull::new_unchecked(frame)
        }
    }

    #[inline]
    #[must_use]
    pub fn num_regs(&self) -> u32 {
        self.num_regs
    }

    #[inline]
    #[must_use]
    pub fn collector(&self) -> CollectorKind {
        self.collector
    }

    #[inline]
    #[must_use]
    pub fn link(&self) -> *mut InterpreterFrame {
        self.link
    }

    pub fn set_link(&mut self, link: *mut InterpreterFrame) {
        assert!(
            !ptr::eq(self, link),
            "a frame must not link back to itself"
        );
        self.link = link;
    }

    #[inline]
    #[must_use]
    pub fn method(&self) -> &Method {
        // SAFETY: construction and set_method both reject null, and the
        // method metadata outlives every frame referring to it.
        unsafe { &*self.method }
    }

    /// Swaps the executing method. The collector reads method pointers
    /// while scanning, so this needs the exclusive side of the mutator
    /// token.
    pub fn set_method(&mut self, method: *const Method, _mu: &ExclusiveMutator<'_>) {
        assert!(!method.is_null(), "interpreter frame requires a method");
        self.method = method;
    }

    /// Current bytecode pc, derived from the raw instruction pointer when
    /// one is set.
    #[inline]
    #[must_use]
    pub fn pc(&self) -> u32 {
        if self.pc_ptr.is_null() {
            return self.pc;
        }
        // SAFETY: set_pc_ptr requires an instruction stream, and pc_ptr
        // points into it.
        unsafe {
            let base = (*self.insns).as_ptr();
            self.pc_ptr.offset_from(base) as u32
        }
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
        self.pc_ptr = ptr::null();
    }

    /// Switches to the raw-pointer pc representation.
    ///
    /// # Panics
    /// When no instruction stream is attached.
    pub fn set_pc_ptr(&mut self, pc_ptr: *const u16) {
        assert!(
            !self.insns.is_null(),
            "raw pc needs an attached instruction stream"
        );
        self.pc_ptr = pc_ptr;
    }

    #[inline]
    #[must_use]
    pub fn pc_ptr(&self) -> *const u16 {
        self.pc_ptr
    }

    #[inline]
    #[must_use]
    pub fn insns(&self) -> *const InsnStream {
        self.insns
    }

    pub fn set_insns(&mut self, insns: *const InsnStream) {
        self.insns = insns;
    }

    #[inline]
    #[must_use]
    pub fn result_register(&self) -> *mut RawValue {
        self.result_register
    }

    pub fn set_result_register(&mut self, slot: *mut RawValue) {
        self.result_register = slot;
    }

    #[inline]
    #[must_use]
    pub fn hotness_countdown(&self) -> i16 {
        self.hotness
    }

    pub fn set_hotness_countdown(&mut self, v: i16) {
        self.hotness = v;
    }

    #[inline]
    #[must_use]
    pub fn cached_hotness_countdown(&self) -> i16 {
        self.cached_hotness
    }

    pub fn set_cached_hotness_countdown(&mut self, v: i16) {
        self.cached_hotness = v;
    }

    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &MonitorLedger {
        &self.ledger
    }

    #[inline]
    pub fn ledger_mut(&mut self) -> &mut MonitorLedger {
        &mut self.ledger
    }

    #[inline]
    fn check_index(&self, i: usize) {
        assert!(
            i < self.num_regs as usize,
            "register index {i} out of range for a frame with {} registers",
            self.num_regs
        );
    }

    #[inline]
    fn raw_base(&self) -> *const u32 {
        self.vregs.as_ptr()
    }

    #[inline]
    fn shadow_base(&self) -> *const u8 {
        // SAFETY: the shadow array starts right after the raw cells inside
        // the same allocation.
        unsafe { (self.raw_base() as *const u8).add(self.num_regs as usize * 4) }
    }

    #[inline]
    fn raw_cell(&self, i: usize) -> u32 {
        // SAFETY: index checked by the caller; cell is inside the
        // allocation and 4-byte aligned.
        unsafe { self.raw_base().add(i).read() }
    }

    #[inline]
    fn set_raw_cell(&mut self, i: usize, bits: u32) {
        // SAFETY: as above, writing through the unique borrow.
        unsafe { self.vregs.as_mut_ptr().add(i).write(bits) }
    }

    // Shadow cells are pointer-width at 4-byte granularity, so plain
    // aligned loads are not available here.
    #[inline]
    fn shadow_cell(&self, i: usize) -> ObjRef {
        // SAFETY: index checked by the caller; cell is inside the
        // allocation.
        unsafe {
            let p = self.shadow_base().add(i * SHADOW_CELL) as *const usize;
            ObjRef::from_ptr(p.read_unaligned() as *mut HeapObject)
        }
    }

    #[inline]
    fn set_shadow_cell(&mut self, i: usize, r: ObjRef) {
        let regs = self.num_regs as usize;
        // SAFETY: as above, writing through the unique borrow.
        unsafe {
            let base = (self.vregs.as_mut_ptr() as *mut u8).add(regs * 4);
            (base.add(i * SHADOW_CELL) as *mut usize).write_unaligned(r.addr());
        }
    }

    #[inline]
    fn clear_shadow_on_overwrite(&mut self, i: usize) {
        // A raw overwrite would otherwise leave a stale shadow entry that
        // the collector mistakes for a live root.
        if self.collector == CollectorKind::Moving {
            self.set_shadow_cell(i, ObjRef::null());
        }
    }

    #[inline]
    #[must_use]
    pub fn vreg(&self, i: usize) -> i32 {
        self.check_index(i);
        self.raw_cell(i) as i32
    }

    #[inline]
    #[must_use]
    pub fn vreg_float(&self, i: usize) -> f32 {
        self.check_index(i);
        f32::from_bits(self.raw_cell(i))
    }

    /// Wide values straddle two consecutive cells at 4-byte alignment.
    #[inline]
    #[must_use]
    pub fn vreg_long(&self, i: usize) -> i64 {
        self.check_index(i + 1);
        let lo = self.raw_cell(i) as u64;
        let hi = self.raw_cell(i + 1) as u64;
        (lo | (hi << 32)) as i64
    }

    #[inline]
    #[must_use]
    pub fn vreg_double(&self, i: usize) -> f64 {
        self.check_index(i + 1);
        let lo = self.raw_cell(i) as u64;
        let hi = self.raw_cell(i + 1) as u64;
        f64::from_bits(lo | (hi << 32))
    }

    /// The shadow slot for register `i`. Under a moving collector this is
    /// the only read that is guaranteed current; the raw cell may hold a
    /// stale pre-relocation pattern.
    #[inline]
    #[must_use]
    pub fn reference(&self, i: usize, _mu: &SharedMutator<'_>) -> ObjRef {
        self.check_index(i);
        let r = self.shadow_cell(i);
        r.assert_to_space();
        r
    }

    pub fn set_vreg(&mut self, i: usize, v: i32) {
        self.check_index(i);
        self.set_raw_cell(i, v as u32);
        self.clear_shadow_on_overwrite(i);
    }

    pub fn set_vreg_float(&mut self, i: usize, v: f32) {
        self.check_index(i);
        self.set_raw_cell(i, v.to_bits());
        self.clear_shadow_on_overwrite(i);
    }

    pub fn set_vreg_long(&mut self, i: usize, v: i64) {
        self.check_index(i + 1);
        let bits = v as u64;
        self.set_raw_cell(i, bits as u32);
        self.set_raw_cell(i + 1, (bits >> 32) as u32);
        self.clear_shadow_on_overwrite(i);
        self.clear_shadow_on_overwrite(i + 1);
    }

    pub fn set_vreg_double(&mut self, i: usize, v: f64) {
        self.check_index(i + 1);
        let bits = v.to_bits();
        self.set_raw_cell(i, bits as u32);
        self.set_raw_cell(i + 1, (bits >> 32) as u32);
        self.clear_shadow_on_overwrite(i);
        self.clear_shadow_on_overwrite(i + 1);
    }

    pub fn set_reference(&mut self, i: usize, obj: ObjRef, _mu: &SharedMutator<'_>) {
        self.check_index(i);
        obj.assert_to_space();
        self.set_shadow_cell(i, obj);
        self.set_raw_cell(i, obj.compressed());
    }

    /// Replays captured reference bits into both halves of a register.
    /// The bits come from a compiled stack slot and are not required to
    /// satisfy the to-space invariant until deoptimization republishes
    /// them.
    pub(crate) fn set_reference_bits(&mut self, i: usize, bits: u32) {
        self.check_index(i);
        self.set_shadow_cell(i, ObjRef::from_compressed(bits));
        self.set_raw_cell(i, bits);
    }

    /// The receiver, which the call bridge places in register 0 of an
    /// interpreted frame. Null for frames without registers.
    #[must_use]
    pub fn this_object(&self, mu: &SharedMutator<'_>) -> ObjRef {
        if self.num_regs == 0 {
            return ObjRef::null();
        }
        self.reference(0, mu)
    }

    /// Whether `addr` points into this frame's shadow reference region.
    /// The collector uses this to attribute an ambiguous interior root.
    #[must_use]
    pub fn contains(&self, addr: *const u8) -> bool {
        let start = self.shadow_base() as usize;
        let end = start + self.num_regs as usize * SHADOW_CELL;
        let a = addr as usize;
        a >= start && a < end
    }

    /// Collector hook: every live shadow slot, then the monitor ledger.
    /// After the visitor rewrites a slot, both halves of the register are
    /// re-synced so the raw mirror matches the new address again.
    pub fn visit_roots(&mut self, thread_id: u32, visitor: &mut impl RootVisitor) {
        self.visit_roots_as(RootKind::VReg, thread_id, visitor);
    }

    /// As `visit_roots`, reporting `kind` for the register slots. Frames
    /// parked in the deoptimization table report `RootKind::DeoptVReg`.
    pub fn visit_roots_as(
        &mut self,
        kind: RootKind,
        thread_id: u32,
        visitor: &mut impl RootVisitor,
    ) {
        for i in 0..self.num_regs as usize {
            let mut slot = self.shadow_cell(i);
            if slot.is_null() {
                continue;
            }
            visitor.visit_root(&mut slot, RootInfo::vreg(kind, thread_id, i as u16));
            self.set_shadow_cell(i, slot);
            self.set_raw_cell(i, slot.compressed());
        }
        self.ledger.visit_monitors(thread_id, visitor);
    }
}

/// Exact-size, frame-aligned backing storage for a scoped frame; the
/// replacement for carving the frame out of the native call stack.
pub struct FrameStorage {
    buf: Vec<u64>,
    len: usize,
}

impl FrameStorage {
    #[must_use]
    pub fn for_regs(num_regs: u32) -> Self {
        let len = InterpreterFrame::size_for(num_regs);
        Self {
            buf: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    pub fn as_uninit_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: the u64 buffer covers at least `len` bytes and any byte
        // pattern is a valid MaybeUninit.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.buf.as_mut_ptr() as *mut MaybeUninit<u8>,
                self.len,
            )
        }
    }
}

/// A frame constructed into caller-provided storage, torn down on scope
/// exit. Used for the ordinary one-call case.
pub struct ScopedFrame<'b> {
    frame: NonNull<InterpreterFrame>,
    _storage: PhantomData<&'b mut [MaybeUninit<u8>]>,
}

impl<'b> ScopedFrame<'b> {
    /// # Panics
    /// When `storage` is not exactly `size_for(num_regs)` bytes or is
    /// misaligned for the frame header.
    pub fn new_in(
        storage: &'b mut [MaybeUninit<u8>],
        num_regs: u32,
        link: *mut InterpreterFrame,
        method: *const Method,
        pc: u32,
        collector: CollectorKind,
    ) -> Self {
        assert_eq!(
            storage.len(),
            InterpreterFrame::size_for(num_regs),
            "frame storage must be exactly size_for(num_regs) bytes"
        );
        let mem = storage.as_mut_ptr() as *mut u8;
        assert_eq!(
            mem as usize % mem::align_of::<InterpreterFrame>(),
            0,
            "frame storage is misaligned"
        );
        // SAFETY: length and alignment checked above.
        let frame =
            unsafe { InterpreterFrame::construct(mem, num_regs, link, method, pc, collector) };
        Self {
            frame,
            _storage: PhantomData,
        }
    }
}

impl Deref for ScopedFrame<'_> {
    type Target = InterpreterFrame;

    fn deref(&self) -> &InterpreterFrame {
        // SAFETY: constructed in new_in, torn down only in Drop.
        unsafe { self.frame.as_ref() }
    }
}

impl DerefMut for ScopedFrame<'_> {
    fn deref_mut(&mut self) -> &mut InterpreterFrame {
        // SAFETY: as above.
        unsafe { self.frame.as_mut() }
    }
}

impl Drop for ScopedFrame<'_> {
    fn drop(&mut self) {
        // SAFETY: constructed in new_in; the storage itself outlives us.
        unsafe { ptr::drop_in_place(self.frame.as_ptr()) }
    }
}

/// A heap-allocated frame with explicit release, for activations that
/// must outlive the call that created them (a deoptimization target frame
/// being the usual case).
pub struct HeapFrame {
    frame: NonNull<InterpreterFrame>,
}

impl HeapFrame {
    #[must_use]
    pub fn new(
        num_regs: u32,
        link: *mut InterpreterFrame,
        method: *const Method,
        pc: u32,
        collector: CollectorKind,
    ) -> Self {
        let layout = InterpreterFrame::layout_for(num_regs);
        // SAFETY: layout has non-zero size (the header alone is not
        // zero-sized).
        let mem = unsafe { alloc::alloc(layout) };
        if mem.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // SAFETY: freshly allocated with the frame's own layout.
        let frame =
            unsafe { InterpreterFrame::construct(mem, num_regs, link, method, pc, collector) };
        Self { frame }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut InterpreterFrame {
        self.frame.as_ptr()
    }
}

impl Deref for HeapFrame {
    type Target = InterpreterFrame;

    fn deref(&self) -> &InterpreterFrame {
        // SAFETY: allocated in new, freed only in Drop.
        unsafe { self.frame.as_ref() }
    }
}

impl DerefMut for HeapFrame {
    fn deref_mut(&mut self) -> &mut InterpreterFrame {
        // SAFETY: as above.
        unsafe { self.frame.as_mut() }
    }
}

impl Drop for HeapFrame {
    fn drop(&mut self) {
        let layout = InterpreterFrame::layout_for(self.num_regs());
        // SAFETY: allocated in new with the identical layout.
        unsafe {
            ptr::drop_in_place(self.frame.as_ptr());
            alloc::dealloc(self.frame.as_ptr() as *mut u8, layout);
        }
    }
}
