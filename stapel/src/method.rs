use std::fmt;

use crate::VRegKind;

/// Declared shape of one method parameter. Wide shapes consume two
/// argument registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArgKind {
    Reference,
    Int,
    Float,
    Long,
    Double,
}

/// Instruction stream of one method, as handed over by the container
/// parser: a length and the raw 16-bit units.
#[derive(Debug, Default, Clone)]
pub struct InsnStream {
    insns: Vec<u16>,
}

impl InsnStream {
    #[must_use]
    pub fn new(insns: Vec<u16>) -> Self {
        Self { insns }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const u16 {
        self.insns.as_ptr()
    }
}

/// Static layout descriptor of a compiled method's stack frame, produced
/// by the code generator.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CompiledFrameInfo {
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub frame_bytes: u32,
}

/// One call folded into a compiled frame at a given native offset.
#[derive(Debug, Copy, Clone)]
pub struct InlinedCall {
    pub method: *const Method,
    pub pc: u32,
}

/// Inline metadata for one native offset. `frames` is ordered from the
/// outermost inlined callee to the innermost one.
#[derive(Debug, Clone)]
pub struct InlineSite {
    pub native_off: u32,
    pub frames: Vec<InlinedCall>,
}

/// Maps a native offset (a safepoint or a callee return address) back to a
/// bytecode pc.
#[derive(Debug, Copy, Clone)]
pub struct PcEntry {
    pub native_off: u32,
    pub pc: u32,
}

/// Where a virtual register lives at one point in optimized code.
///
/// Whether an `InRegister` answer names a core or a floating point
/// register follows from the queried register kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VRegLocation {
    /// Spilled into the frame at a byte offset from the frame base.
    InStack { offset: u32 },
    /// Held in a physical register; recoverable only through a register
    /// snapshot.
    InRegister { reg: u32 },
    /// Materialized constant; no storage.
    Constant(u32),
    /// Not live here, or otherwise unrecoverable.
    Dead,
}

/// Query contract of the optimizing tier's register encoding. The encoding
/// itself is owned by the compiler; this layer only asks where a register
/// is and never how the answer was derived.
pub trait VRegMap {
    fn location(&self, native_off: u32, vreg: u16, kind: VRegKind) -> VRegLocation;
}

/// Physical register file access for a suspended thread, supplied by the
/// platform layer. `None` means the register was not captured (for example
/// a callee-saved register nobody spilled yet).
pub trait RegisterSnapshot {
    fn gpr(&self, reg: u32) -> Option<u64>;
    fn fpr(&self, reg: u32) -> Option<u64>;
}

/// Which compilation tier produced a method's code, with the optimizing
/// tier carrying its register encoding.
pub enum CompiledTier {
    Baseline,
    Optimized(Box<dyn VRegMap + Send + Sync>),
}

impl fmt::Debug for CompiledTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledTier::Baseline => f.write_str("Baseline"),
            CompiledTier::Optimized(_) => f.write_str("Optimized(..)"),
        }
    }
}

/// Compiled-code metadata this layer consumes: frame layout, pc recovery
/// table and inline metadata.
#[derive(Debug)]
pub struct CompiledCode {
    pub frame_info: CompiledFrameInfo,
    pub tier: CompiledTier,
    pub pc_table: Vec<PcEntry>,
    pub inline_sites: Vec<InlineSite>,
}

impl CompiledCode {
    #[must_use]
    pub fn baseline(frame_info: CompiledFrameInfo) -> Self {
        Self {
            frame_info,
            tier: CompiledTier::Baseline,
            pc_table: Vec::new(),
            inline_sites: Vec::new(),
        }
    }

    #[must_use]
    pub fn pc_for_native_off(&self, native_off: u32) -> Option<u32> {
        self.pc_table
            .iter()
            .find(|e| e.native_off == native_off)
            .map(|e| e.pc)
    }

    #[must_use]
    pub fn inline_frames_at(&self, native_off: u32) -> Option<&[InlinedCall]> {
        self.inline_sites
            .iter()
            .find(|s| s.native_off == native_off && !s.frames.is_empty())
            .map(|s| s.frames.as_slice())
    }
}

/// One method as seen by the stack layer. Owned by the class/container
/// metadata, which outlives every frame referring to it.
#[derive(Debug)]
pub struct Method {
    pub name: String,
    /// Total virtual registers N of the bytecode frame.
    pub registers: u16,
    /// Argument registers, receiver included for instance methods. The
    /// arguments occupy the highest-numbered registers.
    pub ins: u16,
    /// Outgoing-argument registers this method needs for its own calls.
    pub outs: u16,
    pub is_static: bool,
    /// Declared parameter shapes, receiver excluded.
    pub args: Vec<ArgKind>,
    pub insns: Option<InsnStream>,
    pub compiled: Option<CompiledCode>,
}

impl Method {
    #[must_use]
    pub fn interpreted(name: impl Into<String>, registers: u16, ins: u16) -> Self {
        Self {
            name: name.into(),
            registers,
            ins,
            outs: 0,
            is_static: false,
            args: Vec::new(),
            insns: None,
            compiled: None,
        }
    }

    /// Builds a descriptor whose argument-register count is derived from
    /// the declared parameter shapes, plus the receiver for instance
    /// methods; wide shapes take two registers.
    #[must_use]
    pub fn with_signature(
        name: impl Into<String>,
        registers: u16,
        args: Vec<ArgKind>,
        is_static: bool,
    ) -> Self {
        let mut ins: u16 = if is_static { 0 } else { 1 };
        for arg in &args {
            ins += match arg {
                ArgKind::Long | ArgKind::Double => 2,
                _ => 1,
            };
        }
        assert!(ins <= registers, "more argument registers than registers");
        Self {
            name: name.into(),
            registers,
            ins,
            outs: 0,
            is_static,
            args,
            insns: None,
            compiled: None,
        }
    }

    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Registers below this index are locals; the arguments start here.
    #[inline]
    #[must_use]
    pub fn num_locals(&self) -> u16 {
        debug_assert!(self.ins <= self.registers);
        self.registers - self.ins
    }

    /// Virtual register holding the receiver, i.e. the first argument
    /// register. Meaningless for static methods.
    #[inline]
    #[must_use]
    pub fn this_vreg(&self) -> u16 {
        self.num_locals()
    }
}
