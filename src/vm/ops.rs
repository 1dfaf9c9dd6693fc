/// Bytecode operations and the static opcode table.
///
/// Each opcode has a descriptor with its flag bits and the fallback routine
/// that implements it generically. The table is a `static` indexed by the
/// opcode's discriminant and never changes after startup.
use super::fallback::{self, FallbackFn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ========================================
    // Stack Manipulation
    // ========================================
    Dup,
    Swap,
    PopValue,

    // ========================================
    // Constants
    // ========================================
    Const0,
    Const1,
    ConstNeg1,
    Undefined,
    Bignum,
    Number,
    NegNumber,
    Number64,
    String,
    ArrowString,
    Constant,

    // ========================================
    // Locals, Globals, Frames
    // ========================================
    Local,
    TwoLocals,
    LocalToLocal,
    AssignLocal,
    AssignLocalAndPop,
    Global,
    AssignGlobal,
    AssignGlobalAndPop,
    ThisObject,
    InitFrame,
    ProtectStack,
    SizeofLocal,
    LocalLvalue,
    GlobalLvalue,
    Assign,

    // ========================================
    // Mark Stack
    // ========================================
    Mark,
    SynchMark,
    Mark2,
    MarkX,
    MarkAt,
    PopMark,
    MarkAndConst0,
    MarkAndConst1,
    MarkAndString,
    MarkAndLocal,
    MarkAndGlobal,
    Aggregate,

    // ========================================
    // Indexing
    // ========================================
    Index,
    PosIntIndex,
    NegIntIndex,

    // ========================================
    // Arithmetic / Comparison
    // ========================================
    Add,
    Subtract,
    Multiply,
    Negate,
    Lt,
    Gt,
    Eq,
    Not,

    // ========================================
    // Returns
    // ========================================
    Return,
    Return0,
    Return1,
    ReturnIfTrue,
    ReturnIfFalse,

    // ========================================
    // Branches
    // ========================================
    Branch,
    BranchWhenZero,
    BranchWhenNonZero,
    BranchIfLocal,
    BranchIfNotLocal,
    Loop,

    // ========================================
    // Computed Jumps
    // ========================================
    Catch,
}

/// Opcode flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(u16);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Reads the first immediate.
    pub const HAS_ARG: OpFlags = OpFlags(1 << 0);
    /// Reads the second immediate.
    pub const HAS_ARG2: OpFlags = OpFlags(1 << 1);
    /// Result of the fallback decides a branch.
    pub const BRANCH: OpFlags = OpFlags(1 << 2);
    /// May leave the current function.
    pub const RETURN: OpFlags = OpFlags(1 << 3);
    /// The fallback moves the operand-stack pointer.
    pub const UPDATE_SP: OpFlags = OpFlags(1 << 4);
    /// The fallback moves the mark-stack pointer.
    pub const UPDATE_MARK_SP: OpFlags = OpFlags(1 << 5);
    /// The fallback replaces the frame pointer.
    pub const UPDATE_FP: OpFlags = OpFlags(1 << 6);
    /// The fallback returns the address to continue at. Its first
    /// immediate is the continuation for the target, `reentry` the one for
    /// the next instruction.
    pub const JUMP: OpFlags = OpFlags(1 << 7);

    pub const fn union(self, other: OpFlags) -> OpFlags {
        OpFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: OpFlags) -> OpFlags {
        self.union(rhs)
    }
}

/// Static description of one opcode.
#[derive(Clone, Copy)]
pub struct OpcodeDescriptor {
    pub opcode: Opcode,
    pub mnemonic: &'static str,
    pub flags: OpFlags,
    pub fallback: FallbackFn,
}

impl fmt::Debug for OpcodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeDescriptor")
            .field("opcode", &self.opcode)
            .field("flags", &self.flags)
            .field("fallback", &(self.fallback as usize as *const u8))
            .finish()
    }
}

const A1: OpFlags = OpFlags::HAS_ARG;
const A2: OpFlags = OpFlags::HAS_ARG.union(OpFlags::HAS_ARG2);
const SP: OpFlags = OpFlags::UPDATE_SP;
const MSP: OpFlags = OpFlags::UPDATE_MARK_SP;
const BR: OpFlags = OpFlags::BRANCH.union(OpFlags::UPDATE_SP);
const RET: OpFlags = OpFlags::RETURN.union(OpFlags::UPDATE_SP);

macro_rules! op {
    ($op:ident, $name:literal, $flags:expr, $fallback:path) => {
        OpcodeDescriptor {
            opcode: Opcode::$op,
            mnemonic: $name,
            flags: $flags,
            fallback: $fallback,
        }
    };
}

static OPCODES: [OpcodeDescriptor; 64] = [
    op!(Dup, "dup", SP, fallback::f_dup),
    op!(Swap, "swap", OpFlags::NONE, fallback::f_swap),
    op!(PopValue, "pop_value", SP, fallback::f_pop_value),
    op!(Const0, "const0", SP, fallback::f_const0),
    op!(Const1, "const1", SP, fallback::f_const1),
    op!(ConstNeg1, "const_1", SP, fallback::f_const_neg1),
    op!(Undefined, "undefined", SP, fallback::f_undefined),
    op!(Bignum, "bignum", SP, fallback::f_bignum),
    op!(Number, "number", A1.union(SP), fallback::f_number),
    op!(NegNumber, "neg_number", A1.union(SP), fallback::f_neg_number),
    op!(Number64, "number64", A2.union(SP), fallback::f_number64),
    op!(String, "string", A1.union(SP), fallback::f_string),
    op!(ArrowString, "arrow_string", A1.union(SP), fallback::f_arrow_string),
    op!(Constant, "constant", A1.union(SP), fallback::f_constant),
    op!(Local, "local", A1.union(SP), fallback::f_local),
    op!(TwoLocals, "2_locals", A2.union(SP), fallback::f_two_locals),
    op!(LocalToLocal, "local_2_local", A2, fallback::f_local_to_local),
    op!(AssignLocal, "assign_local", A1, fallback::f_assign_local),
    op!(AssignLocalAndPop, "assign_local_and_pop", A1.union(SP), fallback::f_assign_local_and_pop),
    op!(Global, "global", A1.union(SP), fallback::f_global),
    op!(AssignGlobal, "assign_global", A1, fallback::f_assign_global),
    op!(AssignGlobalAndPop, "assign_global_and_pop", A1.union(SP), fallback::f_assign_global_and_pop),
    op!(ThisObject, "this_object", A1.union(SP), fallback::f_this_object),
    op!(InitFrame, "init_frame", A2, fallback::f_init_frame),
    op!(ProtectStack, "protect_stack", A1, fallback::f_protect_stack),
    op!(SizeofLocal, "sizeof_local", A1.union(SP), fallback::f_sizeof_local),
    op!(LocalLvalue, "local_lvalue", A1.union(SP), fallback::f_local_lvalue),
    op!(GlobalLvalue, "global_lvalue", A1.union(SP), fallback::f_global_lvalue),
    op!(Assign, "assign", SP, fallback::f_assign),
    op!(Mark, "mark", MSP, fallback::f_mark),
    op!(SynchMark, "synch_mark", MSP, fallback::f_mark),
    op!(Mark2, "mark2", MSP, fallback::f_mark2),
    op!(MarkX, "mark_x", A1.union(MSP), fallback::f_mark_x),
    op!(MarkAt, "mark_at", A1.union(MSP), fallback::f_mark_at),
    op!(PopMark, "pop_mark", MSP, fallback::f_pop_mark),
    op!(MarkAndConst0, "mark_and_const0", MSP.union(SP), fallback::f_mark_and_const0),
    op!(MarkAndConst1, "mark_and_const1", MSP.union(SP), fallback::f_mark_and_const1),
    op!(MarkAndString, "mark_and_string", A1.union(MSP).union(SP), fallback::f_mark_and_string),
    op!(MarkAndLocal, "mark_and_local", A1.union(MSP).union(SP), fallback::f_mark_and_local),
    op!(MarkAndGlobal, "mark_and_global", A1.union(MSP).union(SP), fallback::f_mark_and_global),
    op!(Aggregate, "aggregate", MSP.union(SP), fallback::f_aggregate),
    op!(Index, "index", SP, fallback::f_index),
    op!(PosIntIndex, "pos_int_index", A1.union(SP), fallback::f_pos_int_index),
    op!(NegIntIndex, "neg_int_index", A1.union(SP), fallback::f_neg_int_index),
    op!(Add, "add", SP, fallback::f_add),
    op!(Subtract, "subtract", SP, fallback::f_subtract),
    op!(Multiply, "multiply", SP, fallback::f_multiply),
    op!(Negate, "negate", SP, fallback::f_negate),
    op!(Lt, "lt", SP, fallback::f_lt),
    op!(Gt, "gt", SP, fallback::f_gt),
    op!(Eq, "eq", SP, fallback::f_eq),
    op!(Not, "not", SP, fallback::f_not),
    op!(Return, "return", RET, fallback::f_return),
    op!(Return0, "return_0", RET, fallback::f_return_0),
    op!(Return1, "return_1", RET, fallback::f_return_1),
    op!(ReturnIfTrue, "return_if_true", RET, fallback::f_return_if_true),
    op!(ReturnIfFalse, "return_if_false", RET, fallback::f_return_if_false),
    op!(Branch, "branch", OpFlags::BRANCH, fallback::f_branch),
    op!(BranchWhenZero, "branch_when_zero", BR, fallback::f_branch_when_zero),
    op!(BranchWhenNonZero, "branch_when_non_zero", BR, fallback::f_branch_when_non_zero),
    op!(BranchIfLocal, "branch_if_local", A1.union(OpFlags::BRANCH), fallback::f_branch_if_local),
    op!(BranchIfNotLocal, "branch_if_not_local", A1.union(OpFlags::BRANCH), fallback::f_branch_if_not_local),
    op!(Loop, "loop", BR, fallback::f_loop),
    op!(Catch, "catch", OpFlags::JUMP.union(SP), fallback::f_catch),
];

impl Opcode {
    /// All opcodes, in table order.
    pub fn all() -> impl Iterator<Item = Opcode> {
        OPCODES.iter().map(|d| d.opcode)
    }

    pub fn descriptor(self) -> &'static OpcodeDescriptor {
        &OPCODES[self as usize]
    }

    pub fn flags(self) -> OpFlags {
        self.descriptor().flags
    }

    pub fn mnemonic(self) -> &'static str {
        self.descriptor().mnemonic
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        OPCODES
            .iter()
            .find(|d| d.mnemonic.eq_ignore_ascii_case(name))
            .map(|d| d.opcode)
    }

    /// Number of immediates the opcode reads.
    pub fn immediates(self) -> usize {
        let flags = self.flags();
        if flags.contains(OpFlags::HAS_ARG2) {
            2
        } else if flags.contains(OpFlags::HAS_ARG) {
            1
        } else {
            0
        }
    }

    pub fn is_branch(self) -> bool {
        self.flags().contains(OpFlags::BRANCH)
    }

    pub fn is_return(self) -> bool {
        self.flags().contains(OpFlags::RETURN)
    }

    pub fn is_jump(self) -> bool {
        self.flags().contains(OpFlags::JUMP)
    }

    /// Branches and computed jumps name a target instruction.
    pub fn has_target(self) -> bool {
        self.is_branch() || self.is_jump()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One bytecode instruction: an opcode, its immediates and, for branches,
/// the index of the target instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub arg0: Option<i32>,
    pub arg1: Option<i32>,
    pub target: Option<usize>,
}

impl Instr {
    pub fn new(op: Opcode) -> Self {
        Instr {
            op,
            arg0: None,
            arg1: None,
            target: None,
        }
    }

    pub fn with_arg(op: Opcode, a: i32) -> Self {
        Instr {
            arg0: Some(a),
            ..Self::new(op)
        }
    }

    pub fn with_args(op: Opcode, a: i32, b: i32) -> Self {
        Instr {
            arg0: Some(a),
            arg1: Some(b),
            ..Self::new(op)
        }
    }

    pub fn branch(op: Opcode, target: usize) -> Self {
        Instr {
            target: Some(target),
            ..Self::new(op)
        }
    }

    pub fn branch_with_arg(op: Opcode, a: i32, target: usize) -> Self {
        Instr {
            arg0: Some(a),
            target: Some(target),
            ..Self::new(op)
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(a) = self.arg0 {
            write!(f, " {}", a)?;
        }
        if let Some(b) = self.arg1 {
            write!(f, " {}", b)?;
        }
        if let Some(t) = self.target {
            write!(f, " @{}", t)?;
        }
        Ok(())
    }
}
