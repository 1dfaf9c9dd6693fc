//! Interpreter state, call frames and the reference interpreter loop.
//!
//! The `#[repr(C)]` blocks here are the persistent VM state that generated
//! code reads and writes through fixed offsets. `Interpreter` owns one
//! thread's state together with the stacks, frame and program context it
//! points into, and can run a function body by dispatching every
//! instruction to its fallback routine.

use std::mem::offset_of;
use std::ptr;

use super::fallback::{self, RESUME_RETURN};
use super::ops::{Instr, OpFlags};
use super::value::{HeapString, Object, Svalue};
use super::verify::{ProgramShape, verify};
use super::{Constant, Program};

/// Number of value slots on the operand stack.
pub const STACK_SLOTS: usize = 1024;
/// Number of entries on the mark stack.
pub const MARK_SLOTS: usize = 256;

/// Per-thread interpreter state block.
#[repr(C)]
pub struct InterpreterState {
    pub stack_pointer: *mut Svalue,
    pub mark_stack_pointer: *mut *mut Svalue,
    pub frame_pointer: *mut Frame,
    /// Free-running counter bumped on every backward branch.
    pub check_counter: i32,
    /// Number of times the scheduling hook ran.
    pub preempt_calls: u32,
    pub evaluator_stack: *mut Svalue,
    pub mark_stack: *mut *mut Svalue,
    /// One past the last operand stack slot.
    pub stack_end: *mut Svalue,
    /// One past the last mark stack entry.
    pub mark_stack_end: *mut *mut Svalue,
    /// First guest error raised by a fallback routine and not yet taken.
    pub error: Option<String>,
}

pub const STACK_POINTER_OFFSET: i32 = offset_of!(InterpreterState, stack_pointer) as i32;
pub const MARK_STACK_POINTER_OFFSET: i32 = offset_of!(InterpreterState, mark_stack_pointer) as i32;
pub const FRAME_POINTER_OFFSET: i32 = offset_of!(InterpreterState, frame_pointer) as i32;
pub const CHECK_COUNTER_OFFSET: i32 = offset_of!(InterpreterState, check_counter) as i32;

/// A call frame.
#[repr(C)]
pub struct Frame {
    pub locals: *mut Svalue,
    pub context: *const ProgramContext,
    pub current_object: *mut Object,
    /// Bytecode index of the instruction being executed.
    pub pc: i64,
    pub num_locals: u16,
    pub num_args: u16,
    pub expendible: *mut Svalue,
    pub return_value: Svalue,
}

pub const FRAME_LOCALS_OFFSET: i32 = offset_of!(Frame, locals) as i32;
pub const FRAME_CONTEXT_OFFSET: i32 = offset_of!(Frame, context) as i32;
pub const FRAME_CURRENT_OBJECT_OFFSET: i32 = offset_of!(Frame, current_object) as i32;
pub const FRAME_PC_OFFSET: i32 = offset_of!(Frame, pc) as i32;
pub const FRAME_NUM_LOCALS_OFFSET: i32 = offset_of!(Frame, num_locals) as i32;
pub const FRAME_EXPENDIBLE_OFFSET: i32 = offset_of!(Frame, expendible) as i32;

// init_frame writes both counts with one 32-bit store.
const _: () = assert!(offset_of!(Frame, num_args) == offset_of!(Frame, num_locals) + 2);

/// Per-program tables reachable from a frame.
#[repr(C)]
pub struct ProgramContext {
    pub strings: *const *mut HeapString,
    pub constants: *const Svalue,
    pub identifier_level: u16,
}

pub const CONTEXT_STRINGS_OFFSET: i32 = offset_of!(ProgramContext, strings) as i32;
pub const CONTEXT_CONSTANTS_OFFSET: i32 = offset_of!(ProgramContext, constants) as i32;
pub const CONTEXT_IDENTIFIER_LEVEL_OFFSET: i32 = offset_of!(ProgramContext, identifier_level) as i32;

impl InterpreterState {
    /// Pushes `value`, taking over its reference. A full stack raises
    /// "stack overflow" and releases the value instead.
    ///
    /// # Safety
    /// The stack pointers must describe this state's operand stack.
    pub unsafe fn push(&mut self, value: Svalue) {
        unsafe {
            if self.stack_pointer >= self.stack_end {
                let mut value = value;
                value.free();
                self.raise("stack overflow".to_string());
                return;
            }
            *self.stack_pointer = value;
            self.stack_pointer = self.stack_pointer.add(1);
        }
    }

    /// Pops the top slot, handing its reference to the caller. An empty
    /// stack raises "stack underflow" and yields `UNDEFINED`.
    ///
    /// # Safety
    /// The stack pointers must describe this state's operand stack.
    pub unsafe fn pop(&mut self) -> Svalue {
        unsafe {
            if self.stack_pointer <= self.evaluator_stack {
                self.raise("stack underflow".to_string());
                return Svalue::undefined();
            }
            self.stack_pointer = self.stack_pointer.sub(1);
            *self.stack_pointer
        }
    }

    /// Number of live operand stack slots.
    ///
    /// # Safety
    /// The stack pointers must describe this state's operand stack.
    pub unsafe fn depth(&self) -> usize {
        unsafe { self.stack_pointer.offset_from(self.evaluator_stack).max(0) as usize }
    }

    /// Checks that `slots` values are live, raising "stack underflow"
    /// otherwise.
    ///
    /// # Safety
    /// The stack pointers must describe this state's operand stack.
    pub unsafe fn require(&mut self, slots: usize) -> bool {
        if unsafe { self.depth() } < slots {
            self.raise("stack underflow".to_string());
            return false;
        }
        true
    }

    /// Slot `depth` entries below the top (1 is the top).
    ///
    /// # Safety
    /// The operand stack must hold at least `depth` slots.
    pub unsafe fn peek(&self, depth: usize) -> *mut Svalue {
        unsafe { self.stack_pointer.sub(depth) }
    }

    /// A full mark stack raises "mark stack overflow".
    ///
    /// # Safety
    /// The mark stack pointers must describe this state's mark stack.
    pub unsafe fn push_mark(&mut self, at: *mut Svalue) {
        unsafe {
            if self.mark_stack_pointer >= self.mark_stack_end {
                self.raise("mark stack overflow".to_string());
                return;
            }
            *self.mark_stack_pointer = at;
            self.mark_stack_pointer = self.mark_stack_pointer.add(1);
        }
    }

    /// An empty mark stack raises "mark stack underflow".
    ///
    /// # Safety
    /// The mark stack pointers must describe this state's mark stack.
    pub unsafe fn pop_mark(&mut self) -> Option<*mut Svalue> {
        unsafe {
            if self.mark_stack_pointer <= self.mark_stack {
                self.raise("mark stack underflow".to_string());
                return None;
            }
            self.mark_stack_pointer = self.mark_stack_pointer.sub(1);
            Some(*self.mark_stack_pointer)
        }
    }

    /// # Safety
    /// `frame_pointer` must point at a live frame.
    pub unsafe fn frame<'a>(&self) -> &'a mut Frame {
        unsafe { &mut *self.frame_pointer }
    }

    /// Records a guest error; the first one wins.
    pub fn raise(&mut self, message: String) {
        tracing::debug!(%message, "guest error");
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}

/// How a function body finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A return opcode left the function.
    Returned,
    /// Execution ran past the last instruction.
    FellThrough,
}

/// One thread's VM: state block, stacks, frame and program context.
pub struct Interpreter {
    state: Box<InterpreterState>,
    stack: Box<[Svalue]>,
    marks: Box<[*mut Svalue]>,
    frame: Box<Frame>,
    locals: Box<[Svalue]>,
    context: Box<ProgramContext>,
    strings: Vec<*mut HeapString>,
    constants: Vec<Svalue>,
    this_object: Svalue,
    shape: ProgramShape,
}

fn constant_value(c: &Constant) -> Svalue {
    match c {
        Constant::Int(n) => Svalue::int(*n),
        Constant::Float(f) => Svalue::float(*f),
        Constant::Str(s) => Svalue::string(s),
        Constant::Array(items) => Svalue::array(items.iter().map(constant_value).collect()),
    }
}

impl Interpreter {
    /// Sets up a frame for `program` with its arguments on the operand
    /// stack.
    pub fn new(program: &Program) -> Result<Self, String> {
        if program.args.len() > STACK_SLOTS {
            return Err(format!(
                "{} arguments do not fit the operand stack ({} slots)",
                program.args.len(),
                STACK_SLOTS
            ));
        }
        let mut stack = vec![Svalue::default(); STACK_SLOTS].into_boxed_slice();
        let mut marks = vec![ptr::null_mut(); MARK_SLOTS].into_boxed_slice();
        let mut locals = vec![Svalue::int(0); program.locals.max(1)].into_boxed_slice();

        let strings: Vec<*mut HeapString> = program
            .strings
            .iter()
            .map(|s| Svalue::string(s).payload as *mut HeapString)
            .collect();
        let constants: Vec<Svalue> = program.constants.iter().map(constant_value).collect();
        let this_object = Svalue::object(vec![Svalue::int(0); program.globals]);

        let context = Box::new(ProgramContext {
            strings: strings.as_ptr(),
            constants: constants.as_ptr(),
            identifier_level: 0,
        });

        let mut frame = Box::new(Frame {
            locals: locals.as_mut_ptr(),
            context: &*context,
            current_object: this_object.payload as *mut Object,
            pc: 0,
            num_locals: program.locals as u16,
            num_args: 0,
            expendible: stack.as_mut_ptr(),
            return_value: Svalue::undefined(),
        });

        let state = Box::new(InterpreterState {
            stack_pointer: stack.as_mut_ptr(),
            mark_stack_pointer: marks.as_mut_ptr(),
            frame_pointer: &mut *frame,
            check_counter: 0,
            preempt_calls: 0,
            evaluator_stack: stack.as_mut_ptr(),
            mark_stack: marks.as_mut_ptr(),
            stack_end: stack.as_mut_ptr_range().end,
            mark_stack_end: marks.as_mut_ptr_range().end,
            error: None,
        });

        let mut interp = Interpreter {
            state,
            stack,
            marks,
            frame,
            locals,
            context,
            strings,
            constants,
            this_object,
            shape: program.shape(),
        };
        for &arg in &program.args {
            interp.push(Svalue::int(arg))?;
        }
        Ok(interp)
    }

    /// Pushes a value, taking over its reference. On a full stack the
    /// value is released.
    pub fn push(&mut self, value: Svalue) -> Result<(), String> {
        // SAFETY: the state block describes `self.stack`.
        unsafe { self.state.push(value) };
        self.take_error().map_or(Ok(()), Err)
    }

    /// Pointer handed to compiled code as its only argument.
    pub fn state_ptr(&mut self) -> *mut InterpreterState {
        &mut *self.state
    }

    pub fn state(&self) -> &InterpreterState {
        &self.state
    }

    pub fn depth(&self) -> usize {
        // SAFETY: the stack pointer always stays inside `stack`.
        unsafe { self.state.stack_pointer.offset_from(self.stack.as_ptr()) as usize }
    }

    /// Live operand stack, bottom first.
    pub fn stack(&self) -> &[Svalue] {
        &self.stack[..self.depth()]
    }

    /// Mark stack entries as operand stack depths, bottom first.
    pub fn marks(&self) -> Vec<isize> {
        // SAFETY: the mark stack pointer always stays inside `marks`.
        let count = unsafe { self.state.mark_stack_pointer.offset_from(self.marks.as_ptr()) };
        self.marks[..count as usize]
            .iter()
            .map(|&m| unsafe { m.offset_from(self.stack.as_ptr()) })
            .collect()
    }

    pub fn local(&self, index: usize) -> Svalue {
        self.locals[index]
    }

    pub fn global(&self, index: usize) -> Svalue {
        // SAFETY: `this_object` is an object created in `new`.
        unsafe { (&(*(self.this_object.payload as *const Object)).globals)[index] }
    }

    pub fn this_object(&self) -> Svalue {
        self.this_object
    }

    pub fn string_constant(&self, index: usize) -> *mut HeapString {
        self.strings[index]
    }

    pub fn return_value(&self) -> Svalue {
        self.frame.return_value
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn context(&self) -> &ProgramContext {
        &self.context
    }

    pub fn preempt_calls(&self) -> u32 {
        self.state.preempt_calls
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.state.error.take()
    }

    /// Entries on the mark stack.
    pub fn mark_depth(&self) -> usize {
        // SAFETY: the mark stack pointer always stays inside `marks`.
        unsafe { self.state.mark_stack_pointer.offset_from(self.marks.as_ptr()) as usize }
    }

    /// Runs `code` by calling each instruction's fallback routine.
    ///
    /// The body is verified against this frame's tables and current stack
    /// depths first. Backward branches bump the preemption counter against
    /// `preempt_threshold` exactly like compiled code does. A guest error
    /// does not stop execution; the first one still pending at the end is
    /// returned.
    pub fn interpret(&mut self, code: &[Instr], preempt_threshold: i32) -> Result<RunOutcome, String> {
        let shape = ProgramShape {
            entry_depth: self.depth(),
            entry_marks: self.mark_depth(),
            ..self.shape
        };
        verify(code, &shape).map_err(|e| e.to_string())?;

        let outcome = self.dispatch(code, preempt_threshold)?;
        self.take_error().map_or(Ok(outcome), Err)
    }

    fn dispatch(&mut self, code: &[Instr], preempt_threshold: i32) -> Result<RunOutcome, String> {
        let mut pc = 0;
        while pc < code.len() {
            let instr = code[pc];
            let desc = instr.op.descriptor();
            self.frame.pc = pc as i64;

            tracing::trace!(pc, %instr, "interpret");
            let (arg0, reentry) = if desc.flags.contains(OpFlags::JUMP) {
                let target = instr
                    .target
                    .ok_or_else(|| format!("{} at {} has no jump target", instr.op, pc))?;
                (target as i64, pc + 1)
            } else {
                (instr.arg0.unwrap_or(0) as i64, 0)
            };
            // SAFETY: the state block and everything it points at are owned
            // by `self` and stay in place for the duration of the call.
            let result = unsafe {
                (desc.fallback)(self.state_ptr(), arg0, instr.arg1.unwrap_or(0) as i64, reentry)
            };

            if desc.flags.contains(OpFlags::RETURN) && result == RESUME_RETURN {
                return Ok(RunOutcome::Returned);
            }
            if desc.flags.contains(OpFlags::JUMP) {
                if result > code.len() {
                    return Err(format!("{} at {} continued at {}", instr.op, pc, result));
                }
                pc = result;
                continue;
            }
            if desc.flags.contains(OpFlags::BRANCH) && result != 0 {
                let target = instr
                    .target
                    .ok_or_else(|| format!("{} at {} has no branch target", instr.op, pc))?;
                if target <= pc {
                    self.state.check_counter = self.state.check_counter.wrapping_add(1);
                    if self.state.check_counter > preempt_threshold {
                        // SAFETY: see above.
                        unsafe { fallback::branch_check_threads_etc(self.state_ptr()) };
                    }
                }
                pc = target;
                continue;
            }
            pc += 1;
        }
        Ok(RunOutcome::FellThrough)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        // SAFETY: every slot released here holds exactly one reference owned
        // by this interpreter.
        unsafe {
            let depth = self.depth();
            for slot in self.stack[..depth].iter_mut() {
                slot.free();
            }
            for local in self.locals.iter_mut() {
                local.free();
            }
            self.frame.return_value.free();
            for c in self.constants.iter_mut() {
                c.free();
            }
            for &s in &self.strings {
                let mut sv = Svalue::with_type(super::value::tags::T_STRING, 0, s as u64);
                sv.free();
            }
            self.this_object.free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ops::Opcode;

    fn program(code: Vec<Instr>) -> Program {
        Program {
            code,
            locals: 2,
            globals: 1,
            strings: vec!["hello".to_string()],
            ..Program::default()
        }
    }

    #[test]
    fn test_state_layout() {
        assert_eq!(STACK_POINTER_OFFSET, 0);
        assert_eq!(MARK_STACK_POINTER_OFFSET, 8);
        assert_eq!(FRAME_POINTER_OFFSET, 16);
        assert_eq!(CHECK_COUNTER_OFFSET, 24);
        assert_eq!(FRAME_LOCALS_OFFSET, 0);
        assert_eq!(FRAME_CONTEXT_OFFSET, 8);
        assert_eq!(FRAME_CURRENT_OBJECT_OFFSET, 16);
        assert_eq!(FRAME_PC_OFFSET, 24);
        assert_eq!(FRAME_NUM_LOCALS_OFFSET, 32);
        assert_eq!(FRAME_EXPENDIBLE_OFFSET, 40);
    }

    #[test]
    fn test_interpret_arithmetic() {
        let p = program(vec![
            Instr::new(Opcode::Const1),
            Instr::new(Opcode::Dup),
            Instr::new(Opcode::Add),
        ]);
        let mut vm = Interpreter::new(&p).unwrap();
        assert_eq!(vm.interpret(&p.code, 1024), Ok(RunOutcome::FellThrough));
        assert_eq!(vm.stack(), &[Svalue::int(2)]);
    }

    #[test]
    fn test_interpret_countdown_loop() {
        // local0 = 5; do { local1 += 1 } while (loop counter)
        let p = program(vec![
            Instr::with_arg(Opcode::Number, 5),
            Instr::with_arg(Opcode::Local, 1),
            Instr::new(Opcode::Const1),
            Instr::new(Opcode::Add),
            Instr::with_arg(Opcode::AssignLocalAndPop, 1),
            Instr::branch(Opcode::Loop, 1),
        ]);
        let mut vm = Interpreter::new(&p).unwrap();
        assert_eq!(vm.interpret(&p.code, 2), Ok(RunOutcome::FellThrough));
        assert_eq!(vm.local(1), Svalue::int(6));
        assert!(vm.stack().is_empty());
        assert!(vm.preempt_calls() > 0);
    }

    #[test]
    fn test_interpret_return() {
        let p = program(vec![Instr::new(Opcode::Return1), Instr::new(Opcode::Const0)]);
        let mut vm = Interpreter::new(&p).unwrap();
        assert_eq!(vm.interpret(&p.code, 1024), Ok(RunOutcome::Returned));
        assert_eq!(vm.return_value(), Svalue::int(1));
        assert!(vm.stack().is_empty());
    }

    #[test]
    fn test_string_refs_balance() {
        let p = program(vec![
            Instr::with_arg(Opcode::String, 0),
            Instr::new(Opcode::Dup),
            Instr::new(Opcode::PopValue),
        ]);
        let mut vm = Interpreter::new(&p).unwrap();
        vm.interpret(&p.code, 1024).unwrap();
        // one reference held by the program context, one by the stack
        assert_eq!(vm.stack()[0].refs(), Some(2));
    }

    #[test]
    fn test_too_many_args() {
        let p = Program {
            args: vec![1; STACK_SLOTS + 76],
            ..Program::default()
        };
        let err = Interpreter::new(&p).err().unwrap();
        assert!(err.contains("1100 arguments"), "{err}");

        let p = Program {
            args: vec![1; STACK_SLOTS],
            ..Program::default()
        };
        assert_eq!(Interpreter::new(&p).unwrap().depth(), STACK_SLOTS);
    }

    #[test]
    fn test_push_past_the_end_raises() {
        let mut vm = Interpreter::new(&Program::default()).unwrap();
        for i in 0..STACK_SLOTS {
            vm.push(Svalue::int(i as i64)).unwrap();
        }
        let before = crate::vm::release_count();
        let err = vm.push(Svalue::string("spill")).unwrap_err();
        assert_eq!(err, "stack overflow");
        assert_eq!(vm.depth(), STACK_SLOTS);
        // the rejected value is released, not leaked
        assert_eq!(crate::vm::release_count(), before + 1);
    }

    #[test]
    fn test_state_checks_both_stack_ends() {
        let mut vm = Interpreter::new(&Program::default()).unwrap();
        let st = unsafe { &mut *vm.state_ptr() };
        unsafe {
            assert_eq!(st.pop(), Svalue::undefined());
            assert_eq!(st.depth(), 0);
            assert!(!st.require(1));
            assert_eq!(st.pop_mark(), None);
        }
        assert_eq!(vm.take_error().as_deref(), Some("stack underflow"));

        let st = unsafe { &mut *vm.state_ptr() };
        unsafe {
            for _ in 0..MARK_SLOTS {
                st.push_mark(st.stack_pointer);
            }
            st.push_mark(st.stack_pointer);
        }
        assert_eq!(vm.mark_depth(), MARK_SLOTS);
        assert_eq!(vm.take_error().as_deref(), Some("mark stack overflow"));
    }

    #[test]
    fn test_interpret_rejects_unbounded_code() {
        let p = program(vec![Instr::new(Opcode::Const1); 1100]);
        let mut vm = Interpreter::new(&p).unwrap();
        let err = vm.interpret(&p.code, 1024).unwrap_err();
        assert!(err.contains("overflow"), "{err}");
        assert!(vm.stack().is_empty());

        let p = program(vec![Instr::new(Opcode::PopValue)]);
        let mut vm = Interpreter::new(&p).unwrap();
        assert!(vm.interpret(&p.code, 1024).unwrap_err().contains("underflow"));

        let p = program(vec![Instr::with_arg(Opcode::Local, 2)]);
        let mut vm = Interpreter::new(&p).unwrap();
        assert!(vm.interpret(&p.code, 1024).unwrap_err().contains("local"));
    }

    #[test]
    fn test_interpret_continues_after_guest_error() {
        let p = program(vec![
            Instr::with_arg(Opcode::String, 0),
            Instr::new(Opcode::Const1),
            Instr::new(Opcode::Subtract),
            Instr::new(Opcode::Const0),
        ]);
        let mut vm = Interpreter::new(&p).unwrap();
        let err = vm.interpret(&p.code, 1024).unwrap_err();
        assert!(err.starts_with("bad operands"), "{err}");
        assert_eq!(vm.stack(), &[Svalue::undefined(), Svalue::int(0)]);
    }

    #[test]
    fn test_interpret_catch_takes_pending_error() {
        // subtract fails, catch continues at its target with the message
        let p = program(vec![
            Instr::with_arg(Opcode::String, 0),
            Instr::new(Opcode::Const1),
            Instr::new(Opcode::Subtract),
            Instr::branch(Opcode::Catch, 5),
            Instr::new(Opcode::Const0),
        ]);
        let mut vm = Interpreter::new(&p).unwrap();
        assert_eq!(vm.interpret(&p.code, 1024), Ok(RunOutcome::FellThrough));
        assert_eq!(vm.stack().len(), 2);
        assert!(vm.stack()[1].as_str().unwrap().starts_with("bad operands"));
    }
}
