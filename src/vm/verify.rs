//! Static checks run before a body executes.
//!
//! Inlined fast paths read and write the stacks and tables without bounds
//! checks, so every body is verified first: each immediate that indexes a
//! table must be in range, and a forward dataflow pass over the control
//! flow graph bounds the operand and mark stack depths at every
//! instruction.

use super::Program;
use super::interpreter::{MARK_SLOTS, STACK_SLOTS};
use super::ops::{Instr, Opcode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("bytecode {pc}: `{op}` may overflow the operand stack ({limit} slots)")]
    StackOverflow { pc: usize, op: Opcode, limit: usize },
    #[error("bytecode {pc}: `{op}` needs {needs} operand(s) but the stack may hold {depth} (stack underflow)")]
    StackUnderflow {
        pc: usize,
        op: Opcode,
        needs: usize,
        depth: usize,
    },
    #[error("bytecode {pc}: `{op}` may overflow the mark stack ({limit} entries)")]
    MarkOverflow { pc: usize, op: Opcode, limit: usize },
    #[error("bytecode {pc}: `{op}` may pop an empty mark stack")]
    MarkUnderflow { pc: usize, op: Opcode },
    #[error("bytecode {pc}: `{op}` {table} index {index} is out of range ({len} entries)")]
    IndexOutOfRange {
        pc: usize,
        op: Opcode,
        table: &'static str,
        index: i64,
        len: usize,
    },
    #[error("bytecode {pc}: `{op}` has no target inside the body")]
    BadTarget { pc: usize, op: Opcode },
    #[error("{args} arguments do not fit the operand stack ({limit} slots)")]
    TooManyArgs { args: usize, limit: usize },
}

/// Table sizes and entry depths a body is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramShape {
    pub locals: usize,
    pub strings: usize,
    pub constants: usize,
    pub globals: usize,
    /// Operand stack depth on entry.
    pub entry_depth: usize,
    /// Mark stack depth on entry.
    pub entry_marks: usize,
}

impl Program {
    pub fn shape(&self) -> ProgramShape {
        ProgramShape {
            locals: self.locals,
            strings: self.strings.len(),
            constants: self.constants.len(),
            globals: self.globals,
            entry_depth: self.args.len(),
            entry_marks: 0,
        }
    }

    pub fn verify(&self) -> Result<StackBounds, VerifyError> {
        verify(&self.code, &self.shape())
    }
}

/// Deepest operand and mark stacks any path through a body reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBounds {
    pub max_depth: usize,
    pub max_marks: usize,
}

/// Possible depths at one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Depths {
    min: usize,
    max: usize,
    min_marks: usize,
    max_marks: usize,
}

impl Depths {
    fn join(self, other: Depths) -> Depths {
        Depths {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            min_marks: self.min_marks.min(other.min_marks),
            max_marks: self.max_marks.max(other.max_marks),
        }
    }
}

/// Operand stack effect of one opcode.
#[derive(Debug, Clone, Copy)]
struct Effect {
    /// Operands read.
    needs: usize,
    /// Highest transient growth, at least `delta`.
    peak: usize,
    /// Net change on the fall-through edge.
    delta: isize,
    /// Net change on the target edge, if there is one.
    taken: Option<isize>,
    falls_through: bool,
    marks_needed: usize,
    marks_delta: isize,
}

impl Effect {
    const fn new(needs: usize, delta: isize) -> Self {
        Effect {
            needs,
            peak: if delta > 0 { delta as usize } else { 0 },
            delta,
            taken: None,
            falls_through: true,
            marks_needed: 0,
            marks_delta: 0,
        }
    }

    const fn marks(self, delta: isize) -> Self {
        Effect {
            marks_needed: if delta < 0 { (-delta) as usize } else { 0 },
            marks_delta: delta,
            ..self
        }
    }

    const fn peak(self, peak: usize) -> Self {
        Effect { peak, ..self }
    }

    const fn taken(self, delta: isize) -> Self {
        Effect {
            taken: Some(delta),
            ..self
        }
    }

    const fn terminal(self) -> Self {
        Effect {
            falls_through: false,
            ..self
        }
    }
}

fn effect(op: Opcode) -> Effect {
    use Opcode::*;
    match op {
        Dup => Effect::new(1, 1),
        Swap => Effect::new(2, 0),
        PopValue => Effect::new(1, -1),
        Const0 | Const1 | ConstNeg1 | Undefined | Bignum | Number | NegNumber | Number64 | String
        | ArrowString | Constant | Local | Global | ThisObject | SizeofLocal => Effect::new(0, 1),
        TwoLocals | LocalLvalue | GlobalLvalue => Effect::new(0, 2),
        LocalToLocal | InitFrame | ProtectStack => Effect::new(0, 0),
        AssignLocal | AssignGlobal => Effect::new(1, 0),
        AssignLocalAndPop | AssignGlobalAndPop => Effect::new(1, -1),
        Assign => Effect::new(3, -2),
        Mark | SynchMark | MarkX | MarkAt => Effect::new(0, 0).marks(1),
        Mark2 => Effect::new(0, 0).marks(2),
        PopMark => Effect::new(0, 0).marks(-1),
        MarkAndConst0 | MarkAndConst1 | MarkAndString | MarkAndLocal | MarkAndGlobal => {
            Effect::new(0, 1).marks(1)
        }
        // the value stack effect depends on the mark; see `verify`
        Aggregate => Effect::new(0, 1).marks(-1),
        Index => Effect::new(2, -1),
        PosIntIndex | NegIntIndex => Effect::new(1, 0).peak(1),
        Add | Subtract | Multiply | Lt | Gt | Eq => Effect::new(2, -1),
        Negate | Not => Effect::new(1, 0),
        Return => Effect::new(1, -1).terminal(),
        Return0 | Return1 => Effect::new(0, 0).peak(1).terminal(),
        ReturnIfTrue | ReturnIfFalse => Effect::new(1, -1),
        Branch => Effect::new(0, 0).taken(0).terminal(),
        BranchWhenZero | BranchWhenNonZero => Effect::new(1, -1).taken(-1),
        BranchIfLocal | BranchIfNotLocal => Effect::new(0, 0).taken(0),
        Loop => Effect::new(1, -1).taken(0),
        Catch => Effect::new(0, 0).taken(1).peak(1),
    }
}

/// Checks the immediates that index a table.
fn check_indices(pc: usize, instr: &Instr, shape: &ProgramShape) -> Result<(), VerifyError> {
    use Opcode::*;
    let a = instr.arg0.unwrap_or(0) as i64;
    let b = instr.arg1.unwrap_or(0) as i64;
    let in_range = |table: &'static str, index: i64, len: usize, inclusive: bool| {
        let fits = index >= 0 && (index as u64) < len as u64 + inclusive as u64;
        if fits {
            Ok(())
        } else {
            Err(VerifyError::IndexOutOfRange {
                pc,
                op: instr.op,
                table,
                index,
                len,
            })
        }
    };
    match instr.op {
        Local | AssignLocal | AssignLocalAndPop | MarkAt | MarkAndLocal | BranchIfLocal
        | BranchIfNotLocal | SizeofLocal | LocalLvalue => in_range("local", a, shape.locals, false),
        TwoLocals | LocalToLocal => {
            in_range("local", a, shape.locals, false)?;
            in_range("local", b, shape.locals, false)
        }
        // one past the last local is the top of the frame
        ProtectStack => in_range("local", a, shape.locals, true),
        String | ArrowString | MarkAndString => in_range("string", a, shape.strings, false),
        Constant => in_range("constant", a, shape.constants, false),
        Global | AssignGlobal | AssignGlobalAndPop | MarkAndGlobal | GlobalLvalue => {
            in_range("global", a, shape.globals, false)
        }
        _ => Ok(()),
    }
}

fn offset(depth: usize, delta: isize) -> usize {
    depth.saturating_add_signed(delta)
}

/// Verifies `code` against `shape` and returns the stack bounds.
pub fn verify(code: &[Instr], shape: &ProgramShape) -> Result<StackBounds, VerifyError> {
    if shape.entry_depth > STACK_SLOTS {
        return Err(VerifyError::TooManyArgs {
            args: shape.entry_depth,
            limit: STACK_SLOTS,
        });
    }
    for (pc, instr) in code.iter().enumerate() {
        check_indices(pc, instr, shape)?;
        if instr.op.has_target() && instr.target.is_none_or(|t| t > code.len()) {
            return Err(VerifyError::BadTarget { pc, op: instr.op });
        }
    }

    let entry = Depths {
        min: shape.entry_depth,
        max: shape.entry_depth,
        min_marks: shape.entry_marks,
        max_marks: shape.entry_marks,
    };
    let mut bounds = StackBounds {
        max_depth: entry.max,
        max_marks: entry.max_marks,
    };
    let mut states: Vec<Option<Depths>> = vec![None; code.len() + 1];
    states[0] = Some(entry);
    let mut work = vec![0usize];

    while let Some(pc) = work.pop() {
        let Some(at) = states[pc] else { continue };
        let Some(instr) = code.get(pc) else { continue };
        let e = effect(instr.op);

        if at.min < e.needs {
            return Err(VerifyError::StackUnderflow {
                pc,
                op: instr.op,
                needs: e.needs,
                depth: at.min,
            });
        }
        if instr.op == Opcode::MarkX {
            let slots = instr.arg0.unwrap_or(0) as i64;
            if slots < 0 || slots as u64 > at.min as u64 {
                return Err(VerifyError::IndexOutOfRange {
                    pc,
                    op: instr.op,
                    table: "stack",
                    index: slots,
                    len: at.min,
                });
            }
        }
        if at.max + e.peak > STACK_SLOTS {
            return Err(VerifyError::StackOverflow {
                pc,
                op: instr.op,
                limit: STACK_SLOTS,
            });
        }
        if at.min_marks < e.marks_needed {
            return Err(VerifyError::MarkUnderflow { pc, op: instr.op });
        }
        if offset(at.max_marks, e.marks_delta) > MARK_SLOTS {
            return Err(VerifyError::MarkOverflow {
                pc,
                op: instr.op,
                limit: MARK_SLOTS,
            });
        }

        let marks = (offset(at.min_marks, e.marks_delta), offset(at.max_marks, e.marks_delta));
        let after = |delta: isize| {
            let (min, max) = if instr.op == Opcode::Aggregate {
                // everything above the mark becomes one array
                (1, at.max + 1)
            } else {
                (offset(at.min, delta), offset(at.max, delta))
            };
            Depths {
                min,
                max,
                min_marks: marks.0,
                max_marks: marks.1,
            }
        };

        let mut edges = Vec::with_capacity(2);
        if e.falls_through {
            edges.push((pc + 1, after(e.delta)));
        }
        if let (Some(delta), Some(target)) = (e.taken, instr.target) {
            edges.push((target, after(delta)));
        }
        for (next, depths) in edges {
            bounds.max_depth = bounds.max_depth.max(depths.max);
            bounds.max_marks = bounds.max_marks.max(depths.max_marks);
            let merged = match states[next] {
                Some(old) => old.join(depths),
                None => depths,
            };
            if states[next] != Some(merged) {
                states[next] = Some(merged);
                work.push(next);
            }
        }
    }
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::assemble;

    fn shape() -> ProgramShape {
        ProgramShape {
            locals: 2,
            strings: 1,
            constants: 1,
            globals: 1,
            ..ProgramShape::default()
        }
    }

    fn check(src: &str) -> Result<StackBounds, VerifyError> {
        verify(&assemble(src).unwrap(), &shape())
    }

    #[test]
    fn test_straight_line_bounds() {
        let bounds = check("const1\ndup\nmark\nadd\nlocal 1\n").unwrap();
        assert_eq!(bounds, StackBounds { max_depth: 2, max_marks: 1 });
    }

    #[test]
    fn test_loop_reaches_fixpoint() {
        let bounds = check("number 3\ntop:\nconst1\npop_value\nloop top\n").unwrap();
        assert_eq!(bounds.max_depth, 2);
    }

    #[test]
    fn test_growing_loop_overflows() {
        assert!(matches!(
            check("top:\nconst1\nbranch top\n"),
            Err(VerifyError::StackOverflow { pc: 0, limit: STACK_SLOTS, .. })
        ));
        let code = vec![Instr::new(Opcode::Const1); STACK_SLOTS + 76];
        let err = verify(&code, &shape()).unwrap_err();
        assert_eq!(
            err,
            VerifyError::StackOverflow {
                pc: STACK_SLOTS,
                op: Opcode::Const1,
                limit: STACK_SLOTS
            }
        );
        assert!(err.to_string().contains("overflow"));
        let full = vec![Instr::new(Opcode::Const1); STACK_SLOTS];
        assert_eq!(verify(&full, &shape()).unwrap().max_depth, STACK_SLOTS);
    }

    #[test]
    fn test_underflow() {
        assert!(matches!(
            check("pop_value\n"),
            Err(VerifyError::StackUnderflow { pc: 0, needs: 1, depth: 0, .. })
        ));
        // only one path leaves a value behind
        assert!(matches!(
            check("const0\nbranch_when_zero out\nconst1\nout:\npop_value\n"),
            Err(VerifyError::StackUnderflow { pc: 3, .. })
        ));
        assert!(matches!(check("pop_mark\n"), Err(VerifyError::MarkUnderflow { pc: 0, .. })));
        let args = ProgramShape {
            entry_depth: 2,
            ..shape()
        };
        assert!(verify(&assemble("add\n").unwrap(), &args).is_ok());
    }

    #[test]
    fn test_mark_overflow() {
        let code = vec![Instr::new(Opcode::Mark2); MARK_SLOTS / 2 + 1];
        assert!(matches!(
            verify(&code, &shape()),
            Err(VerifyError::MarkOverflow { pc, .. }) if pc == MARK_SLOTS / 2
        ));
    }

    #[test]
    fn test_index_ranges() {
        let cases = [
            ("local 2", "local"),
            ("local -1", "local"),
            ("2_locals 0 5", "local"),
            ("string 1", "string"),
            ("mark_and_string 3", "string"),
            ("constant 1", "constant"),
            ("global 1", "global"),
            ("assign_global_and_pop 7", "global"),
            ("sizeof_local 9", "local"),
            ("protect_stack 3", "local"),
            ("mark_x 2", "stack"),
            ("mark_x -134217728", "stack"),
        ];
        for (src, table) in cases {
            let code = assemble(&format!("const0\n{}\n", src)).unwrap();
            match verify(&code, &shape()) {
                Err(VerifyError::IndexOutOfRange { pc: 1, table: t, .. }) => assert_eq!(t, table, "{src}"),
                other => panic!("{src}: {other:?}"),
            }
        }
        assert!(check("protect_stack 2\nlocal_2_local 1 0\nstring 0\nconstant 0\nglobal 0\n").is_ok());
        assert!(check("const0\nmark_x 1\n").is_ok());
    }

    #[test]
    fn test_aggregate_and_catch_edges() {
        let bounds = check("mark\nconst0\nconst1\naggregate\npos_int_index 0\n").unwrap();
        assert_eq!(bounds.max_depth, 3);
        assert!(matches!(check("aggregate\n"), Err(VerifyError::MarkUnderflow { .. })));
        // the target edge carries the message
        assert!(check("catch out\nconst0\nout:\npop_value\n").is_ok());
        assert!(matches!(
            check("catch out\npop_value\nout:\n"),
            Err(VerifyError::StackUnderflow { pc: 1, .. })
        ));
    }

    #[test]
    fn test_bad_targets() {
        let code = vec![Instr::branch(Opcode::Catch, 4)];
        assert!(matches!(verify(&code, &shape()), Err(VerifyError::BadTarget { pc: 0, .. })));
        let code = vec![Instr::new(Opcode::Loop)];
        assert!(matches!(verify(&code, &shape()), Err(VerifyError::BadTarget { .. })));
    }

    #[test]
    fn test_too_many_args() {
        let s = ProgramShape {
            entry_depth: STACK_SLOTS + 1,
            ..shape()
        };
        assert!(matches!(verify(&[], &s), Err(VerifyError::TooManyArgs { .. })));
    }
}
