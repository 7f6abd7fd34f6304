mod diag;
mod error;
mod frame;
mod isa;
mod method;
mod monitors;
mod mutator;
mod object;
mod thread;
mod value;
mod visitor;
mod walker;

pub use diag::*;
pub use error::*;
pub use frame::{FrameStorage, HeapFrame, InterpreterFrame, ScopedFrame};
pub use isa::{InstructionSet, STACK_ALIGNMENT, out_arg_offset, vreg_offset};
pub use method::*;
pub use monitors::MonitorLedger;
pub use mutator::{ExclusiveMutator, MutatorLock, SharedMutator};
pub use object::*;
pub use thread::{StackFragment, VmThread};
pub use value::{RawValue, VRegKind};
pub use visitor::{RootInfo, RootKind, RootVisitor};
pub use walker::{FrameWalker, NO_PC, WalkConfig};
