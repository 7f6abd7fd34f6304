use std::mem;
use std::ptr::NonNull;

use crate::{
    CompiledCode, CompiledTier, InlinedCall, InterpreterFrame, Method, ObjRef,
    RegisterSnapshot, SharedMutator, VRegKind, VRegLocation, VmThread, isa,
};

/// Sentinel for a bytecode pc that could not be recovered.
pub const NO_PC: u32 = u32::MAX;

/// Per-walker policy, fixed at construction.
#[derive(Debug, Copy, Clone)]
pub struct WalkConfig {
    /// Yield one logical frame per call folded into a compiled frame.
    pub include_inlined: bool,
    /// Count tier transitions toward depth/height numbering.
    pub count_transitions: bool,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            include_inlined: true,
            count_transitions: true,
        }
    }
}

/// Cursor over one suspended thread's stack, yielding one logical frame at
/// a time regardless of the tier that produced it.
///
/// The cursor is synchronous and single-threaded: queries are valid only
/// while positioned inside the walk callback, and re-entering the walk
/// from the callback is a contract violation. Holding the shared mutator
/// token for the whole walk keeps every reference read relocation-safe.
pub struct FrameWalker<'a> {
    thread: &'a VmThread,
    config: WalkConfig,
    regs: Option<&'a dyn RegisterSnapshot>,
    mu: &'a SharedMutator<'a>,
    cur_interp: Option<NonNull<InterpreterFrame>>,
    cur_compiled: Option<NonNull<u8>>,
    cur_native_off: u32,
    cur_inlined: Option<InlinedCall>,
    inline_depth: usize,
    num_frames: usize,
    cur_depth: usize,
    positioned: bool,
    walking: bool,
}

impl<'a> FrameWalker<'a> {
    /// Builds a walker and eagerly pre-walks the stack to learn the total
    /// frame count.
    ///
    /// # Panics
    /// When the target thread is not suspended; walking a running stack
    /// reads torn state. `unchecked_suspension` skips the assertion.
    #[must_use]
    pub fn new(
        thread: &'a VmThread,
        config: WalkConfig,
        mu: &'a SharedMutator<'a>,
    ) -> Self {
        Self::build(thread, config, mu, None, true)
    }

    /// As `new`, with a caller-supplied frame count replacing the
    /// pre-walk. The count must match what this walker's own policy would
    /// have produced.
    #[must_use]
    pub fn with_frame_count(
        thread: &'a VmThread,
        config: WalkConfig,
        mu: &'a SharedMutator<'a>,
        num_frames: usize,
    ) -> Self {
        Self::build(thread, config, mu, Some(num_frames), true)
    }

    /// As `new` without asserting suspension. For callers that walk their
    /// own stack, which is quiescent by construction.
    #[must_use]
    pub fn unchecked_suspension(
        thread: &'a VmThread,
        config: WalkConfig,
        mu: &'a SharedMutator<'a>,
    ) -> Self {
        Self::build(thread, config, mu, None, false)
    }

    /// Attaches a register file captured at suspension, enabling recovery
    /// of values the optimizing tier left in physical registers.
    pub fn set_register_snapshot(&mut self, regs: &'a dyn RegisterSnapshot) {
        self.regs = Some(regs);
    }

    fn build(
        thread: &'a VmThread,
        config: WalkConfig,
        mu: &'a SharedMutator<'a>,
        known_frames: Option<usize>,
        check_suspended: bool,
    ) -> Self {
        if check_suspended {
            assert!(
                thread.is_suspended(),
                "stack walk on thread {} which is not suspended",
                thread.id()
            );
        }
        let mut walker = Self {
            thread,
            config,
            regs: None,
            mu,
            cur_interp: None,
            cur_compiled: None,
            cur_native_off: 0,
            cur_inlined: None,
            inline_depth: 0,
            num_frames: 0,
            cur_depth: 0,
            positioned: false,
            walking: false,
        };
        match known_frames {
            Some(n) => walker.num_frames = n,
            None => {
                walker.walk_stack(false, |_| true);
                walker.num_frames = walker.cur_depth;
            }
        }
        walker
    }

    /// Visits logical frames newest to oldest. The callback returns
    /// whether to continue; `false` leaves the cursor finished. Transition
    /// frames are visited only when `include_transitions` is set and are
    /// counted toward depth according to this walker's policy.
    ///
    /// # Panics
    /// When called from inside its own callback.
    pub fn walk_stack<F>(&mut self, include_transitions: bool, mut visit: F)
    where
        F: FnMut(&mut Self) -> bool,
    {
        assert!(!self.walking, "re-entrant walk on the same cursor");
        self.walking = true;
        self.cur_depth = 0;
        log::trace!("walking stack of thread {}", self.thread.id());

        let mut frag = self.thread.top_fragment();
        'fragments: while let Some(f) = frag {
            // SAFETY: fragments stay on the stack for the duration of the
            // calls they describe; the thread is quiescent.
            let fragment = unsafe { f.as_ref() };
            self.cur_compiled = fragment.top_compiled();
            self.cur_native_off = fragment.top_compiled_off();
            self.cur_interp = fragment.top_interp();

            if self.cur_compiled.is_some() {
                debug_assert_eq!(
                    self.thread.isa().pointer_size() as usize,
                    mem::size_of::<usize>(),
                    "walking raw frames of a foreign pointer width"
                );
                while let Some(base) = self.cur_compiled {
                    let method = Self::method_at(base);
                    if method.is_null() {
                        break;
                    }
                    self.sanity_check_frame(method);
                    // SAFETY: non-null; method metadata outlives frames.
                    let m = unsafe { &*method };
                    let code = Self::code_of(m);

                    if self.config.include_inlined
                        && let Some(frames) = code.inline_frames_at(self.cur_native_off)
                    {
                        // Innermost-inlined first; the table is ordered
                        // outermost to innermost.
                        for (idx, inl) in frames.iter().enumerate().rev() {
                            self.inline_depth = idx + 1;
                            self.cur_inlined = Some(*inl);
                            self.positioned = true;
                            if !visit(self) {
                                break 'fragments;
                            }
                            self.cur_depth += 1;
                        }
                        self.cur_inlined = None;
                        self.inline_depth = 0;
                    }

                    self.positioned = true;
                    if !visit(self) {
                        break 'fragments;
                    }
                    self.cur_depth += 1;

                    // Step out: the callee's return slot carries the
                    // native offset to resume the caller at.
                    let frame_bytes = code.frame_info.frame_bytes as usize;
                    self.cur_native_off = self.read_return_slot(base, code);
                    // SAFETY: the caller's frame follows contiguously; the
                    // region ends with a null method slot.
                    self.cur_compiled =
                        NonNull::new(unsafe { base.as_ptr().add(frame_bytes) });
                }
            } else if self.cur_interp.is_some() {
                while let Some(sf) = self.cur_interp {
                    self.positioned = true;
                    if !visit(self) {
                        break 'fragments;
                    }
                    self.cur_depth += 1;
                    // SAFETY: frames in a live chain are valid.
                    self.cur_interp = NonNull::new(unsafe { sf.as_ref() }.link());
                }
            }

            // The boundary to the next fragment is a tier transition.
            self.cur_interp = None;
            self.cur_compiled = None;
            self.cur_inlined = None;
            self.inline_depth = 0;
            if include_transitions {
                self.positioned = true;
                if !visit(self) {
                    break 'fragments;
                }
            }
            if self.config.count_transitions {
                self.cur_depth += 1;
            }
            frag = fragment.link();
        }

        self.positioned = false;
        self.walking = false;
        self.cur_interp = None;
        self.cur_compiled = None;
        self.cur_inlined = None;
        self.inline_depth = 0;
    }

    #[inline]
    fn method_at(base: NonNull<u8>) -> *const Method {
        // SAFETY: every compiled frame base holds the method reference
        // slot; alignment of the raw region is not guaranteed.
        unsafe { (base.as_ptr() as *const *const Method).read_unaligned() }
    }

    fn code_of(m: &Method) -> &CompiledCode {
        match m.compiled.as_ref() {
            Some(code) => code,
            None => panic!(
                "method '{}' sits in a compiled region without compiled code",
                m.name
            ),
        }
    }

    #[cfg(debug_assertions)]
    fn sanity_check_frame(&self, method: *const Method) {
        // SAFETY: caller checked non-null.
        let m = unsafe { &*method };
        if let Some(code) = m.compiled.as_ref() {
            let fb = code.frame_info.frame_bytes;
            assert!(
                fb >= self.thread.isa().pointer_size() && fb < 2 * 1024 * 1024,
                "implausible frame size {fb} for '{}'",
                m.name
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn sanity_check_frame(&self, _method: *const Method) {}

    fn read_return_slot(&self, base: NonNull<u8>, code: &CompiledCode) -> u32 {
        let off = code.frame_info.frame_bytes as usize
            - self.thread.isa().pointer_size() as usize;
        // SAFETY: inside the frame by the layout contract.
        unsafe { (base.as_ptr().add(off) as *const usize).read_unaligned() as u32 }
    }

    fn read_stack_u32(base: NonNull<u8>, off: usize) -> u32 {
        // SAFETY: offsets come from the layout calculator or the register
        // encoding, both of which stay inside the frame.
        unsafe { (base.as_ptr().add(off) as *const u32).read_unaligned() }
    }

    #[inline]
    fn require_positioned(&self) {
        assert!(
            self.positioned,
            "walker query while not positioned on a frame"
        );
    }

    #[inline]
    #[must_use]
    pub fn thread(&self) -> &VmThread {
        self.thread
    }

    #[inline]
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.cur_depth
    }

    #[inline]
    #[must_use]
    pub fn is_interpreter_frame(&self) -> bool {
        self.cur_interp.is_some()
    }

    #[inline]
    #[must_use]
    pub fn is_in_inlined_frame(&self) -> bool {
        self.inline_depth != 0
    }

    /// Depth within the current inline stack; innermost is deepest, 0
    /// outside any inlined call.
    #[inline]
    #[must_use]
    pub fn inlining_depth(&self) -> usize {
        self.inline_depth
    }

    /// The interpreter frame under the cursor, if that is what it is on.
    #[must_use]
    pub fn interpreter_frame(&self) -> Option<&InterpreterFrame> {
        // SAFETY: frames in a live chain are valid while positioned.
        self.cur_interp.map(|sf| unsafe { &*sf.as_ptr() })
    }

    /// Height of the current frame: oldest frame is 0, newest is
    /// `num_frames - 1`, numbered under this walker's transition policy.
    #[must_use]
    pub fn frame_height(&self) -> usize {
        self.require_positioned();
        assert!(
            self.num_frames > self.cur_depth,
            "frame count {} out of sync with walk depth {}",
            self.num_frames,
            self.cur_depth
        );
        self.num_frames - self.cur_depth - 1
    }

    /// Stable frame id for external inspectors: the oldest frame is 1.
    #[must_use]
    pub fn frame_id(&self) -> usize {
        self.frame_height() + 1
    }

    /// The method executing in the current logical frame; `None` on a
    /// transition frame. The reference outlives the cursor position, so
    /// it stays usable across later walker calls in the same callback.
    #[must_use]
    pub fn method(&self) -> Option<&'a Method> {
        self.require_positioned();
        if let Some(inl) = &self.cur_inlined {
            // SAFETY: inline tables reference live method metadata.
            return Some(unsafe { &*inl.method });
        }
        if let Some(sf) = self.cur_interp {
            // SAFETY: live chain.
            return Some(unsafe { sf.as_ref() }.method());
        }
        if let Some(base) = self.cur_compiled {
            let m = Self::method_at(base);
            debug_assert!(!m.is_null());
            // SAFETY: the walk stops at the null method slot, so a
            // positioned compiled cursor has a real method.
            return Some(unsafe { &*m });
        }
        None
    }

    /// Bytecode pc of the current frame. Recovery can fail for a compiled
    /// frame whose table lacks the native offset; that yields `NO_PC`, or
    /// aborts when `abort_on_failure` demands certainty. Transition
    /// frames have no pc and always yield `NO_PC`.
    #[must_use]
    pub fn pc(&self, abort_on_failure: bool) -> u32 {
        self.require_positioned();
        if let Some(inl) = &self.cur_inlined {
            return inl.pc;
        }
        if let Some(sf) = self.cur_interp {
            // SAFETY: live chain.
            return unsafe { sf.as_ref() }.pc();
        }
        if let Some(base) = self.cur_compiled {
            let m = Self::method_at(base);
            // SAFETY: positioned compiled cursor, see method().
            let code = Self::code_of(unsafe { &*m });
            return match code.pc_for_native_off(self.cur_native_off) {
                Some(pc) => pc,
                None if abort_on_failure => panic!(
                    "native offset {:#x} has no bytecode pc mapping",
                    self.cur_native_off
                ),
                None => NO_PC,
            };
        }
        NO_PC
    }

    /// The receiver of the current frame's method: register 0 for
    /// interpreter frames, a typed-argument spill slot read for compiled
    /// frames. Null for static methods, transition frames and receivers
    /// that are not recoverable.
    #[must_use]
    pub fn this_object(&self) -> ObjRef {
        self.require_positioned();
        if let Some(sf) = self.cur_interp {
            // SAFETY: live chain.
            return unsafe { sf.as_ref() }.this_object(self.mu);
        }
        let Some(m) = self.method() else {
            return ObjRef::null();
        };
        if m.is_static {
            return ObjRef::null();
        }
        match self.vreg(m, m.this_vreg(), VRegKind::Reference) {
            Some(bits) => ObjRef::from_compressed(bits),
            None => ObjRef::null(),
        }
    }

    /// Reads virtual register `vreg` of the current frame as `kind`.
    ///
    /// `None` means the register is not recoverable here (dead at this
    /// point, or parked in a physical register nobody captured); that is
    /// an answer, not an error. Out-of-range indices abort.
    #[must_use]
    pub fn vreg(&self, m: &Method, vreg: u16, kind: VRegKind) -> Option<u32> {
        self.require_positioned();
        assert!(
            vreg < m.registers,
            "register index {vreg} out of range for '{}' with {} registers",
            m.name,
            m.registers
        );

        if self.cur_compiled.is_some() {
            // A captured write against this frame shadows the stack.
            if let Some(v) = self.thread.deopt_read(self.frame_id(), vreg as usize) {
                return Some(v);
            }
        }

        if let Some(sf) = self.cur_interp {
            // SAFETY: live chain.
            let frame = unsafe { sf.as_ref() };
            return Some(frame.vreg(vreg as usize) as u32);
        }

        let base = self.cur_compiled?;
        let phys = Self::method_at(base);
        // SAFETY: positioned compiled cursor.
        let phys = unsafe { &*phys };
        let code = Self::code_of(phys);
        match &code.tier {
            CompiledTier::Baseline => {
                let off = isa::vreg_offset(
                    &code.frame_info,
                    phys.registers,
                    phys.ins,
                    phys.outs,
                    vreg,
                    self.thread.isa(),
                );
                Some(Self::read_stack_u32(base, off as usize))
            }
            CompiledTier::Optimized(map) => {
                match map.location(self.cur_native_off, vreg, kind) {
                    VRegLocation::InStack { offset } => {
                        Some(Self::read_stack_u32(base, offset as usize))
                    }
                    VRegLocation::Constant(v) => Some(v),
                    VRegLocation::InRegister { reg } => {
                        let snap = self.regs?;
                        let wide = if kind.is_float_kind() {
                            snap.fpr(reg)
                        } else {
                            snap.gpr(reg)
                        }?;
                        let bits = match kind {
                            VRegKind::LongHi | VRegKind::DoubleHi => (wide >> 32) as u32,
                            _ => wide as u32,
                        };
                        Some(bits)
                    }
                    VRegLocation::Dead => None,
                }
            }
        }
    }

    /// Reads a wide register pair. Both halves must be recoverable.
    #[must_use]
    pub fn vreg_pair(
        &self,
        m: &Method,
        vreg: u16,
        kind_lo: VRegKind,
        kind_hi: VRegKind,
    ) -> Option<u64> {
        debug_assert!(kind_lo.is_wide_lo(), "pair read with a non-wide low kind");
        let lo = self.vreg(m, vreg, kind_lo)? as u64;
        let hi = self.vreg(m, vreg + 1, kind_hi)? as u64;
        Some(lo | (hi << 32))
    }

    /// Writes virtual register `vreg` of the current frame.
    ///
    /// Interpreter frames take the write directly. For compiled frames the
    /// value is parked in the thread's transitional frame table and only
    /// takes effect once the caller triggers deoptimization; the frame's
    /// stack memory is never patched. Returns whether the write was
    /// recorded anywhere.
    pub fn set_vreg(&mut self, m: &Method, vreg: u16, value: u32, kind: VRegKind) -> bool {
        self.require_positioned();
        assert!(
            vreg < m.registers,
            "register index {vreg} out of range for '{}' with {} registers",
            m.name,
            m.registers
        );
        if let Some(mut sf) = self.cur_interp {
            // SAFETY: live chain; single-writer discipline.
            let frame = unsafe { sf.as_mut() };
            if kind == VRegKind::Reference {
                frame.set_reference_bits(vreg as usize, value);
            } else {
                frame.set_vreg(vreg as usize, value as i32);
            }
            return true;
        }
        let Some(base) = self.cur_compiled else {
            return false;
        };
        let phys = Self::method_at(base);
        let pc = self.pc(false);
        self.thread.deopt_write(
            self.frame_id(),
            phys,
            pc,
            vreg as usize,
            value,
            kind == VRegKind::Reference,
        );
        true
    }

    /// Wide-pair variant of `set_vreg`.
    pub fn set_vreg_pair(
        &mut self,
        m: &Method,
        vreg: u16,
        value: u64,
        kind_lo: VRegKind,
    ) -> bool {
        self.require_positioned();
        debug_assert!(kind_lo.is_wide_lo(), "pair write with a non-wide low kind");
        assert!(
            vreg + 1 < m.registers,
            "register pair {vreg} out of range for '{}' with {} registers",
            m.name,
            m.registers
        );
        if let Some(mut sf) = self.cur_interp {
            // SAFETY: live chain; single-writer discipline.
            let frame = unsafe { sf.as_mut() };
            frame.set_vreg_long(vreg as usize, value as i64);
            return true;
        }
        let Some(base) = self.cur_compiled else {
            return false;
        };
        let phys = Self::method_at(base);
        let pc = self.pc(false);
        self.thread
            .deopt_write_pair(self.frame_id(), phys, pc, vreg as usize, value);
        true
    }

    /// Native offset the current compiled frame's caller resumes at.
    ///
    /// # Panics
    /// When the cursor is not on a physical compiled frame.
    #[must_use]
    pub fn return_pc(&self) -> u32 {
        self.require_positioned();
        let base = self.cur_compiled.expect("return pc of a non-compiled frame");
        let m = Self::method_at(base);
        // SAFETY: positioned compiled cursor.
        let code = Self::code_of(unsafe { &*m });
        self.read_return_slot(base, code)
    }

    pub fn set_return_pc(&mut self, native_off: u32) {
        self.require_positioned();
        let base = self.cur_compiled.expect("return pc of a non-compiled frame");
        let m = Self::method_at(base);
        // SAFETY: positioned compiled cursor.
        let code = Self::code_of(unsafe { &*m });
        let off = code.frame_info.frame_bytes as usize
            - self.thread.isa().pointer_size() as usize;
        // SAFETY: inside the frame by the layout contract.
        unsafe {
            (base.as_ptr().add(off) as *mut usize).write_unaligned(native_off as usize);
        }
    }

    /// Human-readable position for diagnostics and logs.
    #[must_use]
    pub fn describe_location(&self) -> String {
        self.require_positioned();
        let kind = if self.is_in_inlined_frame() {
            "inlined frame"
        } else if self.is_interpreter_frame() {
            "interpreter frame"
        } else if self.cur_compiled.is_some() {
            "compiled frame"
        } else {
            "transition frame"
        };
        match self.method() {
            Some(m) => format!(
                "{kind} '{}' at pc {:#x} (height {})",
                m.name,
                self.pc(false),
                self.frame_height()
            ),
            None => format!("{kind} (height {})", self.frame_height()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CollectorKind, CompiledFrameInfo, FrameStorage, Header, HeapObject,
        InlineSite, InstructionSet, MutatorLock, PcEntry, ScopedFrame,
        StackFragment, VRegMap,
    };
    use std::ptr;

    const ISA: InstructionSet = InstructionSet::X86_64;
    const PTR: usize = 8;

    fn interp_method(registers: u16, ins: u16) -> Box<Method> {
        Box::new(Method::interpreted("interp", registers, ins))
    }

    fn baseline_method(name: &str, registers: u16, ins: u16, frame_bytes: u32) -> Box<Method> {
        let mut m = Method::interpreted(name, registers, ins);
        m.compiled = Some(CompiledCode::baseline(CompiledFrameInfo {
            core_spill_mask: 0,
            fp_spill_mask: 0,
            frame_bytes,
        }));
        Box::new(m)
    }

    /// Builds a raw compiled region the way the call bridge lays it out:
    /// frames innermost first, a null method slot at the end.
    #[derive(Default)]
    struct RegionBuilder {
        mem: Vec<u8>,
    }

    impl RegionBuilder {
        fn push_frame(&mut self, method: &Method, return_off: u32) {
            let code = method.compiled.as_ref().expect("a compiled method");
            let frame_bytes = code.frame_info.frame_bytes as usize;
            let start = self.mem.len();
            self.mem.resize(start + frame_bytes, 0);
            let method_ptr = method as *const Method as usize;
            self.mem[start..start + PTR].copy_from_slice(&method_ptr.to_ne_bytes());
            let ret = start + frame_bytes - PTR;
            self.mem[ret..ret + PTR]
                .copy_from_slice(&(return_off as usize).to_ne_bytes());
        }

        fn poke_u32(&mut self, frame_index: usize, frames: &[&Method], off: usize, v: u32) {
            let mut start = 0;
            for m in &frames[..frame_index] {
                start += m.compiled.as_ref().unwrap().frame_info.frame_bytes as usize;
            }
            self.mem[start + off..start + off + 4].copy_from_slice(&v.to_le_bytes());
        }

        fn finish(mut self) -> Vec<u8> {
            self.mem.extend_from_slice(&0usize.to_ne_bytes());
            self.mem
        }
    }

    fn suspended_thread() -> VmThread {
        let t = VmThread::new(1, ISA, CollectorKind::Moving);
        t.suspend();
        t
    }

    struct Visit {
        interp: bool,
        name: Option<String>,
        height: usize,
        inline_depth: usize,
    }

    fn collect(walker: &mut FrameWalker<'_>, include_transitions: bool) -> Vec<Visit> {
        let mut out = Vec::new();
        walker.walk_stack(include_transitions, |w| {
            out.push(Visit {
                interp: w.is_interpreter_frame(),
                name: w.method().map(|m| m.name.clone()),
                height: w.frame_height(),
                inline_depth: w.inlining_depth(),
            });
            true
        });
        out
    }

    #[test]
    fn interpreter_chain_walks_newest_to_oldest() {
        let m = interp_method(2, 0);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(2);
        let mut outer = ScopedFrame::new_in(
            s0.as_uninit_mut(), 2, ptr::null_mut(), &*m, 0, CollectorKind::Moving,
        );
        let mut s1 = FrameStorage::for_regs(2);
        let mut mid = ScopedFrame::new_in(
            s1.as_uninit_mut(), 2, &mut *outer, &*m, 1, CollectorKind::Moving,
        );
        let mut s2 = FrameStorage::for_regs(2);
        let mut inner = ScopedFrame::new_in(
            s2.as_uninit_mut(), 2, &mut *mid, &*m, 2, CollectorKind::Moving,
        );

        let mut frag = StackFragment::interpreted(&mut *inner);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        // 3 frames plus the final counted transition.
        assert_eq!(walker.num_frames(), 4);

        let visits = collect(&mut walker, false);
        assert_eq!(visits.len(), 3);
        walker.walk_stack(false, |w| {
            assert!(w.interpreter_frame().is_some());
            false
        });
        let pcs: Vec<u32> = {
            let mut pcs = Vec::new();
            walker.walk_stack(false, |w| {
                pcs.push(w.pc(true));
                true
            });
            pcs
        };
        assert_eq!(pcs, vec![2, 1, 0], "innermost to outermost");

        let heights: Vec<usize> = visits.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![3, 2, 1], "height decreases walking outward");
        assert!(visits.iter().all(|v| v.interp));
    }

    #[test]
    fn frame_ids_count_from_the_oldest() {
        let m = interp_method(1, 0);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(1);
        let mut outer = ScopedFrame::new_in(
            s0.as_uninit_mut(), 1, ptr::null_mut(), &*m, 0, CollectorKind::Moving,
        );
        let mut s1 = FrameStorage::for_regs(1);
        let mut inner = ScopedFrame::new_in(
            s1.as_uninit_mut(), 1, &mut *outer, &*m, 0, CollectorKind::Moving,
        );
        let mut frag = StackFragment::interpreted(&mut *inner);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        let mut ids = Vec::new();
        walker.walk_stack(false, |w| {
            ids.push(w.frame_id());
            true
        });
        // Newest first, so ids run downward; the oldest visited frame has
        // the smallest id and ids grow from the oldest up.
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn compiled_region_yields_one_frame_per_method() {
        let callee = baseline_method("callee", 4, 1, 48);
        let caller = baseline_method("caller", 6, 0, 64);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        {
            let code = callee.compiled.as_ref().unwrap();
            assert_eq!(code.frame_info.frame_bytes, 48);
        }

        let mut region = RegionBuilder::default();
        region.push_frame(&callee, 0x30);
        region.push_frame(&caller, 0);
        let mut mem = region.finish();

        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0x10);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        // 2 physical frames + 1 counted transition.
        assert_eq!(walker.num_frames(), 3);
        let visits = collect(&mut walker, false);
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[0].name.as_deref(), Some("callee"));
        assert_eq!(visits[1].name.as_deref(), Some("caller"));
        assert!(visits.iter().all(|v| !v.interp));
    }

    #[test]
    fn compiled_pc_recovery_uses_the_table_or_fails_soft() {
        let mut m = Method::interpreted("c", 2, 0);
        m.compiled = Some(CompiledCode {
            pc_table: vec![PcEntry { native_off: 0x10, pc: 7 }],
            ..CompiledCode::baseline(CompiledFrameInfo {
                core_spill_mask: 0,
                fp_spill_mask: 0,
                frame_bytes: 32,
            })
        });
        let m = Box::new(m);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0x10);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            assert_eq!(w.pc(true), 7);
            true
        });

        // Same frame, unmapped native offset: the soft query answers with
        // the sentinel.
        let mut frag2 = StackFragment::compiled(mem.as_mut_ptr(), 0x99);
        thread.set_top_fragment(Some(NonNull::from(&mut frag2)));
        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            assert_eq!(w.pc(false), NO_PC);
            false
        });
    }

    #[test]
    #[should_panic(expected = "no bytecode pc mapping")]
    fn strict_pc_recovery_aborts_on_a_missing_mapping() {
        let m = baseline_method("c", 2, 0, 32);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0x44);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            let _ = w.pc(true);
            true
        });
    }

    #[test]
    fn baseline_vreg_reads_go_through_the_offset_calculator() {
        // frame_bytes 48, no spills: locals start at 48 - 4 - 3*4 = 32.
        let m = baseline_method("c", 4, 1, 48);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let methods = [&*m];
        region.poke_u32(0, &methods, 32, 1111);
        region.poke_u32(0, &methods, 36, 2222);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            let m = w.method().unwrap();
            assert_eq!(w.vreg(m, 0, VRegKind::Int), Some(1111));
            assert_eq!(w.vreg(m, 1, VRegKind::Int), Some(2222));
            false
        });
    }

    struct TestMap;

    impl VRegMap for TestMap {
        fn location(&self, _native_off: u32, vreg: u16, _kind: VRegKind) -> VRegLocation {
            match vreg {
                0 => VRegLocation::InStack { offset: 16 },
                1 => VRegLocation::Constant(555),
                2 => VRegLocation::InRegister { reg: 3 },
                _ => VRegLocation::Dead,
            }
        }
    }

    struct TestRegs;

    impl RegisterSnapshot for TestRegs {
        fn gpr(&self, reg: u32) -> Option<u64> {
            (reg == 3).then_some(0xDEAD_0000_0000_0777u64)
        }
        fn fpr(&self, _reg: u32) -> Option<u64> {
            None
        }
    }

    fn optimized_method(name: &str) -> Box<Method> {
        let mut m = Method::interpreted(name, 4, 0);
        m.compiled = Some(CompiledCode {
            tier: CompiledTier::Optimized(Box::new(TestMap)),
            ..CompiledCode::baseline(CompiledFrameInfo {
                core_spill_mask: 0,
                fp_spill_mask: 0,
                frame_bytes: 48,
            })
        });
        Box::new(m)
    }

    #[test]
    fn optimized_vreg_reads_follow_the_register_encoding() {
        let m = optimized_method("opt");
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let methods = [&*m];
        region.poke_u32(0, &methods, 16, 4242);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        // Without a register snapshot the in-register value is simply
        // inaccessible.
        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            let m = w.method().unwrap();
            assert_eq!(w.vreg(m, 0, VRegKind::Int), Some(4242));
            assert_eq!(w.vreg(m, 1, VRegKind::Int), Some(555));
            assert_eq!(w.vreg(m, 2, VRegKind::Int), None);
            assert_eq!(w.vreg(m, 3, VRegKind::Int), None, "dead register");
            false
        });

        let regs = TestRegs;
        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.set_register_snapshot(&regs);
        walker.walk_stack(false, |w| {
            let m = w.method().unwrap();
            assert_eq!(w.vreg(m, 2, VRegKind::Int), Some(0x777));
            false
        });
    }

    #[test]
    fn inlined_frames_come_innermost_first() {
        let inner = Box::new(Method::interpreted("inlined_inner", 2, 0));
        let outer = Box::new(Method::interpreted("inlined_outer", 2, 0));
        let mut m = Method::interpreted("phys", 4, 0);
        m.compiled = Some(CompiledCode {
            pc_table: vec![PcEntry { native_off: 0x10, pc: 5 }],
            inline_sites: vec![InlineSite {
                native_off: 0x10,
                frames: vec![
                    InlinedCall { method: &*outer, pc: 11 },
                    InlinedCall { method: &*inner, pc: 22 },
                ],
            }],
            ..CompiledCode::baseline(CompiledFrameInfo {
                core_spill_mask: 0,
                fp_spill_mask: 0,
                frame_bytes: 32,
            })
        });
        let m = Box::new(m);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0x10);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        // 2 inlined + 1 physical + 1 counted transition.
        assert_eq!(walker.num_frames(), 4);
        let visits = collect(&mut walker, false);
        let names: Vec<&str> = visits.iter().map(|v| v.name.as_deref().unwrap()).collect();
        assert_eq!(names, vec!["inlined_inner", "inlined_outer", "phys"]);
        assert_eq!(
            visits.iter().map(|v| v.inline_depth).collect::<Vec<_>>(),
            vec![2, 1, 0]
        );

        let mut pcs = Vec::new();
        walker.walk_stack(false, |w| {
            pcs.push(w.pc(true));
            true
        });
        assert_eq!(pcs, vec![22, 11, 5]);

        // Skipping inlined frames collapses the compiled frame back to
        // one logical visit.
        let config = WalkConfig {
            include_inlined: false,
            count_transitions: true,
        };
        let mut walker = FrameWalker::new(&thread, config, &mu);
        assert_eq!(walker.num_frames(), 2);
        let visits = collect(&mut walker, false);
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].name.as_deref(), Some("phys"));
    }

    #[test]
    fn transitions_are_visited_and_counted_per_policy() {
        let im = interp_method(1, 0);
        let cm = baseline_method("c", 2, 0, 32);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(1);
        let mut interp = ScopedFrame::new_in(
            s0.as_uninit_mut(), 1, ptr::null_mut(), &*im, 0, CollectorKind::Moving,
        );
        let mut region = RegionBuilder::default();
        region.push_frame(&cm, 0);
        let mut mem = region.finish();

        let mut old_frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        let mut new_frag = StackFragment::interpreted(&mut *interp);
        new_frag.set_link(Some(NonNull::from(&mut old_frag)));
        thread.set_top_fragment(Some(NonNull::from(&mut new_frag)));

        // Counting policy: 1 interp + transition + 1 compiled + transition.
        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        assert_eq!(walker.num_frames(), 4);

        let visits = collect(&mut walker, true);
        assert_eq!(visits.len(), 4);
        assert!(visits[0].interp);
        assert_eq!(visits[1].name, None, "transitions expose no method");
        assert_eq!(visits[2].name.as_deref(), Some("c"));
        assert_eq!(visits[3].name, None);
        let heights: Vec<_> = visits.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![3, 2, 1, 0], "self-consistent when counted");

        // Skipping policy: transitions neither visited through the count
        // nor numbered.
        let config = WalkConfig {
            include_inlined: true,
            count_transitions: false,
        };
        let mut walker = FrameWalker::new(&thread, config, &mu);
        assert_eq!(walker.num_frames(), 2);
        let visits = collect(&mut walker, false);
        let heights: Vec<_> = visits.iter().map(|v| v.height).collect();
        assert_eq!(heights, vec![1, 0], "self-consistent when skipped");
    }

    #[test]
    fn callback_false_stops_the_walk_early() {
        let m = interp_method(1, 0);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(1);
        let mut outer = ScopedFrame::new_in(
            s0.as_uninit_mut(), 1, ptr::null_mut(), &*m, 0, CollectorKind::Moving,
        );
        let mut s1 = FrameStorage::for_regs(1);
        let mut inner = ScopedFrame::new_in(
            s1.as_uninit_mut(), 1, &mut *outer, &*m, 0, CollectorKind::Moving,
        );
        let mut frag = StackFragment::interpreted(&mut *inner);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        let mut count = 0;
        walker.walk_stack(false, |_| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    #[should_panic(expected = "re-entrant walk")]
    fn reentering_the_walk_from_the_callback_aborts() {
        let m = interp_method(1, 0);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(1);
        let mut frame = ScopedFrame::new_in(
            s0.as_uninit_mut(), 1, ptr::null_mut(), &*m, 0, CollectorKind::Moving,
        );
        let mut frag = StackFragment::interpreted(&mut *frame);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            w.walk_stack(false, |_| true);
            true
        });
    }

    #[test]
    #[should_panic(expected = "not suspended")]
    fn walking_a_running_thread_aborts() {
        let thread = VmThread::new(1, ISA, CollectorKind::Moving);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let _ = FrameWalker::new(&thread, WalkConfig::default(), &mu);
    }

    #[test]
    fn suspension_check_can_be_opted_out() {
        let thread = VmThread::new(1, ISA, CollectorKind::Moving);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let walker = FrameWalker::unchecked_suspension(&thread, WalkConfig::default(), &mu);
        assert_eq!(walker.num_frames(), 0, "an empty stack walks to nothing");
    }

    #[test]
    fn caller_supplied_frame_count_skips_the_prewalk() {
        let m = interp_method(1, 0);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(1);
        let mut frame = ScopedFrame::new_in(
            s0.as_uninit_mut(), 1, ptr::null_mut(), &*m, 0, CollectorKind::Moving,
        );
        let mut frag = StackFragment::interpreted(&mut *frame);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker =
            FrameWalker::with_frame_count(&thread, WalkConfig::default(), &mu, 2);
        let visits = collect(&mut walker, false);
        assert_eq!(visits[0].height, 1);
    }

    #[test]
    #[should_panic(expected = "not positioned")]
    fn queries_outside_the_callback_abort() {
        let thread = suspended_thread();
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        let _ = walker.frame_height();
    }

    #[test]
    fn this_object_reads_register_zero_of_an_interpreter_frame() {
        let m = interp_method(3, 1);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut obj = Box::new(HeapObject {
            header: Header::zeroed(),
        });
        let receiver = ObjRef::from_ptr(&mut *obj);

        let mut s0 = FrameStorage::for_regs(3);
        let mut frame = ScopedFrame::new_in(
            s0.as_uninit_mut(), 3, ptr::null_mut(), &*m, 0, CollectorKind::Moving,
        );
        frame.set_reference(0, receiver, &mu);
        let mut frag = StackFragment::interpreted(&mut *frame);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            assert_eq!(w.this_object(), receiver);
            false
        });
    }

    #[test]
    fn this_object_of_a_compiled_frame_reads_the_receiver_spill_slot() {
        // 4 registers, 2 ins: the receiver is vreg 2, which resolves into
        // the caller's frame at frame_bytes + 0*4 + 8 = 56.
        let callee = baseline_method("callee", 4, 2, 48);
        let caller = baseline_method("caller", 2, 0, 64);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&callee, 0);
        region.push_frame(&caller, 0);
        // Region offset 56 is inside the caller's frame, where the callee's
        // first incoming argument lives.
        region.poke_u32(0, &[], 56, 0x6000);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            assert_eq!(w.this_object().addr(), 0x6000);
            false
        });
    }

    #[test]
    fn compiled_writes_park_in_the_transitional_frame() {
        let m = baseline_method("c", 4, 0, 48);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let mut mem = region.finish();
        let before = mem.clone();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        let mut frame_id = 0;
        walker.walk_stack(false, |w| {
            let m = w.method().unwrap();
            frame_id = w.frame_id();
            assert!(w.set_vreg(m, 1, 77, VRegKind::Int));
            // The walker immediately serves the parked value back.
            assert_eq!(w.vreg(m, 1, VRegKind::Int), Some(77));
            false
        });
        assert_eq!(mem, before, "stack memory is never patched");

        let parked = thread.take_deopt_frame(frame_id).expect("a parked frame");
        assert_eq!(parked.vreg(1), 77);
    }

    #[test]
    fn wide_pair_reads_compose_both_halves() {
        let m = baseline_method("c", 4, 1, 48);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0);
        let methods = [&*m];
        // Locals start at 48 - 4 - 3*4 = 32; vregs 0 and 1 hold a long.
        region.poke_u32(0, &methods, 32, 0x9ABC_DEF0);
        region.poke_u32(0, &methods, 36, 0x1234_5678);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            let m = w.method().unwrap();
            assert_eq!(
                w.vreg_pair(m, 0, VRegKind::LongLo, VRegKind::LongHi),
                Some(0x1234_5678_9ABC_DEF0)
            );
            false
        });
    }

    #[test]
    fn return_pc_is_readable_and_writable_on_compiled_frames() {
        let m = baseline_method("c", 2, 0, 32);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut region = RegionBuilder::default();
        region.push_frame(&m, 0xAA);
        let mut mem = region.finish();
        let mut frag = StackFragment::compiled(mem.as_mut_ptr(), 0);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            assert_eq!(w.return_pc(), 0xAA);
            w.set_return_pc(0xBB);
            assert_eq!(w.return_pc(), 0xBB);
            false
        });
    }

    #[test]
    fn describe_location_names_the_tier() {
        let m = interp_method(1, 0);
        let lock = MutatorLock::new();
        let mu = lock.lock_shared();
        let mut thread = suspended_thread();

        let mut s0 = FrameStorage::for_regs(1);
        let mut frame = ScopedFrame::new_in(
            s0.as_uninit_mut(), 1, ptr::null_mut(), &*m, 4, CollectorKind::Moving,
        );
        let mut frag = StackFragment::interpreted(&mut *frame);
        thread.set_top_fragment(Some(NonNull::from(&mut frag)));

        let mut walker = FrameWalker::new(&thread, WalkConfig::default(), &mu);
        walker.walk_stack(false, |w| {
            let text = w.describe_location();
            assert!(text.starts_with("interpreter frame 'interp'"), "{text}");
            false
        });
    }
}
