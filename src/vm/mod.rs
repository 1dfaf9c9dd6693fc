mod value;
mod ops;
pub mod bytecode;
pub mod fallback;
pub mod interpreter;
pub mod verify;

pub use bytecode::{AsmError, Constant, ProgramFile};
pub use interpreter::{Frame, Interpreter, InterpreterState, ProgramContext, RunOutcome};
pub use ops::{Instr, OpFlags, Opcode, OpcodeDescriptor};
pub use value::{HeapArray, HeapString, Object, Svalue, is_ref_type, release_count, tags};
pub use verify::{ProgramShape, StackBounds, VerifyError};

/// Offsets of the value layout, shared with the code generator.
pub mod layout {
    pub use super::interpreter::{
        CHECK_COUNTER_OFFSET, CONTEXT_CONSTANTS_OFFSET, CONTEXT_IDENTIFIER_LEVEL_OFFSET,
        CONTEXT_STRINGS_OFFSET, FRAME_CONTEXT_OFFSET, FRAME_CURRENT_OBJECT_OFFSET,
        FRAME_EXPENDIBLE_OFFSET, FRAME_LOCALS_OFFSET, FRAME_NUM_LOCALS_OFFSET, FRAME_PC_OFFSET,
        FRAME_POINTER_OFFSET, MARK_STACK_POINTER_OFFSET, STACK_POINTER_OFFSET,
    };
    pub use super::value::{REFS_OFFSET, SVALUE_PAYLOAD_OFFSET, SVALUE_SIZE, SVALUE_TYPE_OFFSET};
}

/// A function body ready for translation, with the tables its frame needs.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub name: String,
    pub code: Vec<Instr>,
    /// String pool, indexed by `string` immediates.
    pub strings: Vec<String>,
    pub constants: Vec<Constant>,
    /// Number of global slots on the current object.
    pub globals: usize,
    pub locals: usize,
    /// Integers on the operand stack on entry.
    pub args: Vec<i64>,
}
