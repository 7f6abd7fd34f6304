use crate::CompiledFrameInfo;

/// Stack frames of compiled code are kept 16-byte aligned on every target.
pub const STACK_ALIGNMENT: u32 = 16;

/// Width of the filler word keeping wide locals addressable at 4-byte
/// granularity next to the spill area.
const FILLER_BYTES: u32 = 4;

/// Targets the code generator emits for. Pointer width and spill-slot
/// widths are properties of the target, not of the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InstructionSet {
    X86,
    X86_64,
    Arm,
    Arm64,
    Riscv64,
}

impl InstructionSet {
    #[inline]
    #[must_use]
    pub const fn pointer_size(self) -> u32 {
        match self {
            InstructionSet::X86 | InstructionSet::Arm => 4,
            InstructionSet::X86_64 | InstructionSet::Arm64 | InstructionSet::Riscv64 => 8,
        }
    }

    /// Bytes one spilled core register occupies in the spill area.
    #[inline]
    #[must_use]
    pub const fn gpr_spill_bytes(self) -> u32 {
        match self {
            InstructionSet::X86 | InstructionSet::Arm => 4,
            InstructionSet::X86_64 | InstructionSet::Arm64 | InstructionSet::Riscv64 => 8,
        }
    }

    /// Bytes one spilled floating point register occupies. The 32-bit x86
    /// generator spills full double-width slots.
    #[inline]
    #[must_use]
    pub const fn fpr_spill_bytes(self) -> u32 {
        match self {
            InstructionSet::Arm => 4,
            InstructionSet::X86
            | InstructionSet::X86_64
            | InstructionSet::Arm64
            | InstructionSet::Riscv64 => 8,
        }
    }
}

/// Byte offset, relative to the frame base (the stack pointer on entry),
/// of virtual register `reg` inside a compiled frame.
///
/// The generator lays frames out as follows, low address first:
///
/// ```text
///     | method reference            |  <- frame base, reg == registers
///     | OUT[0] .. OUT[outs-1]       |
///     | compiler temporaries        |  <- reg > registers
///     | stack alignment padding     |
///     | V[0] .. V[num_locals-1]     |  <- reg < num_locals
///     | filler word                 |
///     | FP callee-save spills       |
///     | core callee-save spills     |
///     | caller's method reference   |  <- end of this frame
///     | IN[0] .. IN[ins-1]          |  <- reg >= num_locals, caller frame
/// ```
///
/// Argument registers resolve into the caller's frame, above this frame's
/// spill area. The single special temporary is the method reference at the
/// base; further temporaries sit just above the outgoing arguments.
///
/// Every call with identical inputs yields the identical offset, and no
/// two local registers of one frame overlap; getting this wrong corrupts
/// memory silently, so the arithmetic below must mirror the generator's.
#[must_use]
pub fn vreg_offset(
    frame: &CompiledFrameInfo,
    registers: u16,
    ins: u16,
    outs: u16,
    reg: u16,
    isa: InstructionSet,
) -> u32 {
    debug_assert!(
        frame.frame_bytes % STACK_ALIGNMENT == 0,
        "unaligned compiled frame size {}",
        frame.frame_bytes
    );
    debug_assert!(ins <= registers, "more argument registers than registers");

    let pointer_size = isa.pointer_size();
    let spill_size = frame.core_spill_mask.count_ones() * isa.gpr_spill_bytes()
        + frame.fp_spill_mask.count_ones() * isa.fpr_spill_bytes()
        + FILLER_BYTES;
    let num_locals = u32::from(registers - ins);
    let reg = u32::from(reg);

    // One special temporary exists: the method reference at the base.
    let temp_threshold = u32::from(registers);
    if reg == temp_threshold {
        return 0;
    }
    if reg > temp_threshold {
        let temps_start = u32::from(outs) * 4 + pointer_size;
        return temps_start + (reg - temp_threshold - 1) * 4;
    }
    if reg < num_locals {
        let locals_start = frame.frame_bytes - spill_size - num_locals * 4;
        return locals_start + reg * 4;
    }
    // Argument registers live in the caller's frame, above our own.
    frame.frame_bytes + (reg - num_locals) * 4 + pointer_size
}

/// Byte offset of this method's outgoing argument `out_num`, just above
/// the method reference at the frame base.
#[inline]
#[must_use]
pub fn out_arg_offset(out_num: u16, isa: InstructionSet) -> u32 {
    isa.pointer_size() + u32::from(out_num) * 4
}
