//! Per-opcode translation.
//!
//! A `Translator` holds all state for one function body: the code buffer,
//! the register cache, bytecode-level branch labels and the shared epilogue.
//! `translate` either emits an inlined fast path or the generic sequence
//! that calls the opcode's fallback routine.

use serde::Serialize;

use super::abi::{CONTEXT_REG, CallingConvention, SAVED_SCRATCH};
use super::codebuf::CodeBuffer;
use super::label::{Label, MIN_LABEL_USES};
use super::regcache::{RegCache, VmReg};
use super::x86_64::{Cond, Reg, X86_64Assembler};
use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::vm::fallback::{self, number64};
use crate::vm::layout::*;
use crate::vm::tags::{
    NUMBER_UNDEFINED, STRING_ARROW, T_INT, T_OBJ_INDEX, T_OBJECT, T_STRING, T_SVALUE_PTR, T_VOID,
    TYPE_MASK,
};
use crate::vm::{Instr, OpFlags, Opcode};

/// Counters collected while translating one function body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TranslationStats {
    pub instructions: usize,
    pub inlined: usize,
    pub fallback_calls: usize,
    pub helper_calls: usize,
    pub preemption_checks: usize,
    pub code_size: usize,
}

/// The 32-bit tag word of a value slot: type in the low half, subtype in
/// the high half.
fn type_word(type_: u16, subtype: u16) -> i32 {
    ((subtype as i32) << 16) | type_ as i32
}

/// Byte offset of value slot `index`.
fn slot_offset(index: i32) -> i64 {
    index as i64 * SVALUE_SIZE as i64
}

/// `index * size` as a displacement.
fn scaled(index: i32, size: i32) -> JitResult<i32> {
    index
        .checked_mul(size)
        .ok_or(JitError::DisplacementOutOfRange(index as i64 * size as i64))
}

pub struct Translator {
    pub(crate) buf: CodeBuffer,
    pub(crate) regs: RegCache,
    pub(crate) cc: CallingConvention,
    pub(crate) config: JitConfig,
    /// Registers pushed by the entry sequence, in push order.
    pub(crate) saved: Vec<Reg>,
    pub(crate) epilogue: Option<usize>,
    pub(crate) stats: TranslationStats,
    prev_stored_pc: Option<usize>,
    /// One label per bytecode index, plus one past the end.
    targets: Vec<Label>,
}

impl Translator {
    pub fn new(config: JitConfig, cc: CallingConvention, code_len: usize) -> Self {
        let targets = (0..=code_len)
            .map(|_| Label::with_limit(config.max_branch_sites))
            .collect();
        Self {
            buf: CodeBuffer::with_capacity(code_len * 16 + 64),
            regs: RegCache::new(),
            cc,
            config,
            saved: Vec::new(),
            epilogue: None,
            stats: TranslationStats::default(),
            prev_stored_pc: None,
            targets,
        }
    }

    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }

    pub fn regs(&self) -> &RegCache {
        &self.regs
    }

    pub fn stats(&self) -> TranslationStats {
        TranslationStats {
            code_size: self.buf.len(),
            ..self.stats
        }
    }

    pub fn finish(self) -> (Vec<u8>, TranslationStats) {
        let stats = self.stats();
        (self.buf.into_code(), stats)
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// A local label. Return sequences reference one label three times,
    /// so the configured bound never goes below that.
    fn label(&self) -> Label {
        Label::with_limit(self.config.max_label_uses.max(MIN_LABEL_USES))
    }

    pub(crate) fn load(&mut self, r: VmReg) -> Reg {
        self.regs.ensure_loaded(&mut self.buf, r)
    }

    pub(crate) fn flush(&mut self) {
        self.regs.flush(&mut self.buf);
    }

    /// Join point for branches to bytecode index `pc`.
    pub fn bind_target(&mut self, pc: usize) -> JitResult<()> {
        self.flush();
        self.targets[pc].place(&mut self.buf)?;
        self.regs.reset();
        self.prev_stored_pc = None;
        Ok(())
    }

    fn imm(instr: &Instr, index: usize) -> JitResult<i32> {
        let value = if index == 0 { instr.arg0 } else { instr.arg1 };
        value.ok_or(JitError::MissingImmediate { op: instr.op, index })
    }

    fn branch_target(&self, pc: usize, instr: &Instr) -> JitResult<usize> {
        let target = instr
            .target
            .ok_or(JitError::MissingBranchTarget { op: instr.op, pc })?;
        let len = self.targets.len() - 1;
        if target > len {
            return Err(JitError::UnresolvedBranch { target, len });
        }
        Ok(target)
    }

    /// Stores the bytecode pc into the frame unless it is already there.
    fn update_pc(&mut self, pc: usize) -> JitResult<()> {
        if !self.config.update_pc || self.prev_stored_pc == Some(pc) {
            return Ok(());
        }
        let value = i32::try_from(pc).map_err(|_| JitError::DisplacementOutOfRange(pc as i64))?;
        let fp = self.load(VmReg::FramePointer);
        self.asm().mov_mi(fp, FRAME_PC_OFFSET, value);
        self.prev_stored_pc = Some(pc);
        Ok(())
    }

    pub fn translate(&mut self, pc: usize, instr: &Instr) -> JitResult<()> {
        if self.config.trace {
            tracing::trace!(pc, %instr, offset = self.buf.offset(), "translate");
        }
        self.stats.instructions += 1;
        if self.config.inline_fast_paths {
            self.translate_inline(pc, instr)
        } else {
            self.translate_generic(pc, instr)
        }
    }

    // ==================== Generic path ====================

    /// Calls `op`'s fallback routine with the given immediates. A
    /// `reentry` label is passed as the fourth argument.
    fn call_fallback(
        &mut self,
        pc: usize,
        op: Opcode,
        args: (i32, i32),
        reentry: Option<&mut Label>,
    ) -> JitResult<()> {
        let desc = op.descriptor();
        self.update_pc(pc)?;
        self.regs.sync_for_call(&mut self.buf, desc.flags);

        let cc = self.cc;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if desc.flags.contains(OpFlags::HAS_ARG) {
            asm.mov_ri(cc.arg(1), args.0 as i64);
        }
        if desc.flags.contains(OpFlags::HAS_ARG2) {
            asm.mov_ri(cc.arg(2), args.1 as i64);
        }
        if let Some(label) = reentry {
            asm.lea_label(cc.arg(3), label)?;
        }
        asm.mov_rr(cc.arg(0), CONTEXT_REG);
        asm.call_abs(desc.fallback as usize)?;
        self.stats.fallback_calls += 1;
        Ok(())
    }

    fn generic_args(instr: &Instr) -> JitResult<(i32, i32)> {
        let flags = instr.op.flags();
        let a = if flags.contains(OpFlags::HAS_ARG) { Self::imm(instr, 0)? } else { 0 };
        let b = if flags.contains(OpFlags::HAS_ARG2) { Self::imm(instr, 1)? } else { 0 };
        Ok((a, b))
    }

    pub(crate) fn translate_generic(&mut self, pc: usize, instr: &Instr) -> JitResult<()> {
        let flags = instr.op.flags();
        let args = Self::generic_args(instr)?;
        if flags.contains(OpFlags::RETURN) {
            return self.emit_return(pc, instr.op, args);
        }
        if flags.contains(OpFlags::JUMP) {
            return self.emit_jump(pc, instr);
        }
        if flags.contains(OpFlags::BRANCH) {
            let target = self.branch_target(pc, instr)?;
            self.call_fallback(pc, instr.op, args, None)?;
            self.asm().test_rr(Reg::Rax, Reg::Rax);
            return self.branch_on(pc, Cond::Ne, target);
        }
        self.call_fallback(pc, instr.op, args, None)
    }

    /// Return handling after the fallback call: `RESUME_RETURN` leaves
    /// through the shared epilogue; return-if-true/false resume at the
    /// address they hand back, which must be the re-entry point.
    fn emit_return(&mut self, pc: usize, op: Opcode, args: (i32, i32)) -> JitResult<()> {
        let conditional = matches!(op, Opcode::ReturnIfTrue | Opcode::ReturnIfFalse);
        let mut resume = self.label();
        self.call_fallback(pc, op, args, conditional.then_some(&mut resume))?;

        let mut stay = self.label();
        let mut asm = self.asm();
        asm.cmp_ri(Reg::Rax, -1);
        asm.jcc_label(Cond::Ne, &mut stay)?;
        self.jump_to_epilogue()?;
        stay.place(&mut self.buf)?;

        if conditional {
            let mut asm = self.asm();
            asm.lea_label(Reg::R11, &mut resume)?;
            asm.cmp_rr(Reg::Rax, Reg::R11);
            asm.jcc_label(Cond::E, &mut resume)?;
            asm.jmp_r(Reg::Rax);
            resume.place(&mut self.buf)?;
        }
        Ok(())
    }

    /// Computed jump: the fallback gets the native address of its target
    /// and of the next instruction and hands back the one to continue at.
    fn emit_jump(&mut self, pc: usize, instr: &Instr) -> JitResult<()> {
        let target = self.branch_target(pc, instr)?;
        let desc = instr.op.descriptor();
        self.update_pc(pc)?;
        self.regs.sync_for_call(&mut self.buf, desc.flags);

        let cc = self.cc;
        let mut resume = self.label();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.lea_label(cc.arg(1), &mut self.targets[target])?;
        asm.lea_label(cc.arg(3), &mut resume)?;
        asm.mov_rr(cc.arg(0), CONTEXT_REG);
        asm.call_abs(desc.fallback as usize)?;
        asm.jmp_r(Reg::Rax);
        resume.place(&mut self.buf)?;
        self.stats.fallback_calls += 1;
        Ok(())
    }

    /// Conditional transfer to bytecode `target` on `cond`, with the flags
    /// already set. Registers must be flushed.
    fn branch_on(&mut self, pc: usize, cond: Cond, target: usize) -> JitResult<()> {
        debug_assert!(!self.regs.any_dirty());
        if target > pc {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            return asm.jcc_label32(cond, &mut self.targets[target]);
        }
        let addr = self.backward_address(target)?;
        let mut skip = self.label();
        self.asm().jcc_label(cond.invert(), &mut skip)?;
        self.emit_preemption_check()?;
        self.asm().jump_to(None, addr);
        skip.place(&mut self.buf)
    }

    fn backward_address(&self, target: usize) -> JitResult<usize> {
        self.targets[target].address().ok_or(JitError::UnresolvedBranch {
            target,
            len: self.targets.len() - 1,
        })
    }

    // ==================== Fast paths ====================

    fn translate_inline(&mut self, pc: usize, instr: &Instr) -> JitResult<()> {
        use Opcode::*;

        let inlined = match instr.op {
            Dup => {
                let sp = self.load(VmReg::StackPointer);
                self.asm().lea(Reg::R10, sp, -SVALUE_SIZE);
                self.push_svaluep(Reg::R10)?;
                true
            }
            Swap => {
                self.swap();
                true
            }
            PopValue => {
                let sp = self.load(VmReg::StackPointer);
                self.asm().sub_ri(sp, SVALUE_SIZE);
                self.regs.mark_dirty(VmReg::StackPointer);
                self.inline_drop_ref(sp, false)?;
                true
            }
            Const0 => self.push_int(0, 0),
            Const1 => self.push_int(1, 0),
            ConstNeg1 => self.push_int(-1, 0),
            Undefined => self.push_int(0, NUMBER_UNDEFINED),
            Bignum => self.push_int(0x7fff_ffff, 0),
            Number => self.push_int(Self::imm(instr, 0)? as i64, 0),
            NegNumber => self.push_int(-(Self::imm(instr, 0)? as i64), 0),
            Number64 => {
                let value = number64(Self::imm(instr, 0)? as i64, Self::imm(instr, 1)? as i64);
                self.push_int(value, 0)
            }
            String => {
                self.push_string(Self::imm(instr, 0)?, 0)?;
                true
            }
            ArrowString => {
                self.push_string(Self::imm(instr, 0)?, STRING_ARROW)?;
                true
            }
            Constant => {
                let index = Self::imm(instr, 0)?;
                let fp = self.load(VmReg::FramePointer);
                let mut asm = self.asm();
                asm.mov_rm(Reg::R10, fp, FRAME_CONTEXT_OFFSET);
                asm.mov_rm(Reg::R10, Reg::R10, CONTEXT_CONSTANTS_OFFSET);
                asm.add_rri(Reg::R10, Reg::R10, slot_offset(index))?;
                self.push_svaluep(Reg::R10)?;
                true
            }
            Local => {
                self.push_local(Self::imm(instr, 0)?)?;
                true
            }
            Global => {
                self.push_global(pc, Self::imm(instr, 0)?)?;
                true
            }
            AssignLocal => {
                self.assign_local(Self::imm(instr, 0)?, false)?;
                true
            }
            AssignLocalAndPop => {
                self.assign_local(Self::imm(instr, 0)?, true)?;
                true
            }
            AssignGlobal => {
                self.assign_global(pc, Self::imm(instr, 0)?, false)?;
                true
            }
            AssignGlobalAndPop => {
                self.assign_global(pc, Self::imm(instr, 0)?, true)?;
                true
            }
            ThisObject if Self::imm(instr, 0)? == 0 => {
                self.push_this_object();
                true
            }
            InitFrame => {
                let num_args = Self::imm(instr, 0)?;
                let num_locals = Self::imm(instr, 1)?;
                let fp = self.load(VmReg::FramePointer);
                self.asm()
                    .mov_mi32(fp, FRAME_NUM_LOCALS_OFFSET, (num_args << 16) | (num_locals & 0xffff));
                true
            }
            ProtectStack => {
                let index = Self::imm(instr, 0)?;
                let fp = self.load(VmReg::FramePointer);
                let mut asm = self.asm();
                asm.mov_rm(Reg::Rax, fp, FRAME_LOCALS_OFFSET);
                asm.add_rri(Reg::Rax, Reg::Rax, slot_offset(index))?;
                asm.mov_mr(fp, FRAME_EXPENDIBLE_OFFSET, Reg::Rax);
                true
            }
            SizeofLocal => {
                self.sizeof_local(pc, Self::imm(instr, 0)?)?;
                true
            }
            LocalLvalue => {
                let index = Self::imm(instr, 0)?;
                let fp = self.load(VmReg::FramePointer);
                let sp = self.load(VmReg::StackPointer);
                let mut asm = self.asm();
                asm.mov_rm(Reg::Rax, fp, FRAME_LOCALS_OFFSET);
                asm.add_rri(Reg::Rax, Reg::Rax, slot_offset(index))?;
                asm.mov_mi(sp, SVALUE_TYPE_OFFSET, type_word(T_SVALUE_PTR, 0));
                asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::Rax);
                asm.mov_mi(sp, SVALUE_SIZE + SVALUE_TYPE_OFFSET, type_word(T_VOID, 0));
                asm.mov_mi(sp, SVALUE_SIZE + SVALUE_PAYLOAD_OFFSET, 0);
                self.add_sp(2);
                true
            }
            GlobalLvalue => {
                let index = Self::imm(instr, 0)?;
                self.push_this_object();
                self.global_index(Reg::Rax, index);
                let sp = self.load(VmReg::StackPointer);
                let mut asm = self.asm();
                asm.mov_mi(sp, SVALUE_TYPE_OFFSET, type_word(T_OBJ_INDEX, 0));
                asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::Rax);
                self.add_sp(1);
                true
            }
            Mark | SynchMark => {
                self.mark(0)?;
                true
            }
            MarkX => {
                self.mark(Self::imm(instr, 0)?)?;
                true
            }
            MarkAt => {
                let index = Self::imm(instr, 0)?;
                let fp = self.load(VmReg::FramePointer);
                let msp = self.load(VmReg::MarkStackPointer);
                let mut asm = self.asm();
                asm.mov_rm(Reg::Rax, fp, FRAME_LOCALS_OFFSET);
                asm.add_rri(Reg::Rax, Reg::Rax, slot_offset(index))?;
                asm.mov_mr(msp, 0, Reg::Rax);
                asm.add_ri(msp, 8);
                self.regs.mark_dirty(VmReg::MarkStackPointer);
                true
            }
            PopMark => {
                let msp = self.load(VmReg::MarkStackPointer);
                self.asm().add_ri(msp, -8);
                self.regs.mark_dirty(VmReg::MarkStackPointer);
                true
            }

            // Composites: two translator invocations each.
            Mark2 => self.pair(pc, Instr::new(Mark), Instr::new(Mark))?,
            MarkAndConst0 => self.pair(pc, Instr::new(Mark), Instr::new(Const0))?,
            MarkAndConst1 => self.pair(pc, Instr::new(Mark), Instr::new(Const1))?,
            MarkAndString => {
                let a = Self::imm(instr, 0)?;
                self.pair(pc, Instr::new(Mark), Instr::with_arg(String, a))?
            }
            MarkAndLocal => {
                let a = Self::imm(instr, 0)?;
                self.pair(pc, Instr::new(Mark), Instr::with_arg(Local, a))?
            }
            MarkAndGlobal => {
                let a = Self::imm(instr, 0)?;
                self.pair(pc, Instr::new(Mark), Instr::with_arg(Global, a))?
            }
            PosIntIndex => {
                let a = Self::imm(instr, 0)?;
                self.pair(pc, Instr::with_arg(Number, a), Instr::new(Index))?
            }
            NegIntIndex => {
                let a = Self::imm(instr, 0)?;
                self.pair(pc, Instr::with_arg(NegNumber, a), Instr::new(Index))?
            }
            TwoLocals => {
                let (a, b) = (Self::imm(instr, 0)?, Self::imm(instr, 1)?);
                self.pair(pc, Instr::with_arg(Local, a), Instr::with_arg(Local, b))?
            }
            LocalToLocal => {
                let (dst, src) = (Self::imm(instr, 0)?, Self::imm(instr, 1)?);
                if dst != src {
                    self.pair(pc, Instr::with_arg(Local, src), Instr::with_arg(AssignLocalAndPop, dst))?;
                }
                true
            }
            Return0 => self.pair(pc, Instr::new(Const0), Instr::new(Return))?,
            Return1 => self.pair(pc, Instr::new(Const1), Instr::new(Return))?,

            Branch => {
                let target = self.branch_target(pc, instr)?;
                self.flush();
                if target > pc {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.jmp_label32(&mut self.targets[target])?;
                } else {
                    let addr = self.backward_address(target)?;
                    self.emit_preemption_check()?;
                    self.asm().jump_to(None, addr);
                }
                true
            }
            BranchIfLocal | BranchIfNotLocal => {
                self.branch_if_local(pc, instr)?;
                true
            }
            Loop => {
                self.counted_loop(pc, instr)?;
                true
            }
            _ => false,
        };

        if inlined {
            self.stats.inlined += 1;
            Ok(())
        } else {
            self.translate_generic(pc, instr)
        }
    }

    fn pair(&mut self, pc: usize, first: Instr, second: Instr) -> JitResult<bool> {
        let inlined = self.stats.inlined;
        self.translate_inline(pc, &first)?;
        self.translate_inline(pc, &second)?;
        self.stats.inlined = inlined;
        Ok(true)
    }

    fn add_sp(&mut self, slots: i32) {
        let sp = self.load(VmReg::StackPointer);
        self.asm().add_ri(sp, slots * SVALUE_SIZE);
        self.regs.mark_dirty(VmReg::StackPointer);
    }

    fn push_int(&mut self, value: i64, subtype: u16) -> bool {
        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_mi(sp, SVALUE_TYPE_OFFSET, type_word(T_INT, subtype));
        match i32::try_from(value) {
            Ok(v) => asm.mov_mi(sp, SVALUE_PAYLOAD_OFFSET, v),
            Err(_) => {
                asm.mov_ri(Reg::Rax, value);
                asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::Rax);
            }
        }
        self.add_sp(1);
        true
    }

    /// Pushes a copy of the value at `[src]` and takes a reference.
    fn push_svaluep(&mut self, src: Reg) -> JitResult<()> {
        debug_assert!(!matches!(src, Reg::Rax | Reg::R11));
        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, src, SVALUE_TYPE_OFFSET);
        asm.mov_rm(Reg::R11, src, SVALUE_PAYLOAD_OFFSET);
        asm.mov_mr(sp, SVALUE_TYPE_OFFSET, Reg::Rax);
        asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::R11);
        self.inline_take_ref(src, true)?;
        self.add_sp(1);
        Ok(())
    }

    fn push_local(&mut self, index: i32) -> JitResult<()> {
        let fp = self.load(VmReg::FramePointer);
        let mut asm = self.asm();
        asm.mov_rm(Reg::R10, fp, FRAME_LOCALS_OFFSET);
        asm.add_rri(Reg::R10, Reg::R10, slot_offset(index))?;
        self.push_svaluep(Reg::R10)
    }

    fn push_this_object(&mut self) {
        let fp = self.load(VmReg::FramePointer);
        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, fp, FRAME_CURRENT_OBJECT_OFFSET);
        asm.mov_mi(sp, SVALUE_TYPE_OFFSET, type_word(T_OBJECT, 0));
        asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::Rax);
        asm.add_mi32(Reg::Rax, REFS_OFFSET, 1);
        self.add_sp(1);
    }

    /// Pushes the size of local `index` as computed by `svalue_size`.
    fn sizeof_local(&mut self, pc: usize, index: i32) -> JitResult<()> {
        let fp = self.load(VmReg::FramePointer);
        self.update_pc(pc)?;
        self.flush();

        let [a0, a1, _, _] = self.cc.args;
        let mut asm = self.asm();
        asm.mov_rm(a1, fp, FRAME_LOCALS_OFFSET);
        asm.add_rri(a1, a1, slot_offset(index))?;
        asm.mov_rr(a0, CONTEXT_REG);
        asm.call_abs(fallback::svalue_size as usize)?;
        self.stats.helper_calls += 1;

        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_mi(sp, SVALUE_TYPE_OFFSET, type_word(T_INT, 0));
        asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::Rax);
        self.add_sp(1);
        Ok(())
    }

    fn push_string(&mut self, index: i32, subtype: u16) -> JitResult<()> {
        let fp = self.load(VmReg::FramePointer);
        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, fp, FRAME_CONTEXT_OFFSET);
        asm.mov_rm(Reg::Rax, Reg::Rax, CONTEXT_STRINGS_OFFSET);
        asm.mov_rm(Reg::Rax, Reg::Rax, scaled(index, 8)?);
        asm.mov_mi(sp, SVALUE_TYPE_OFFSET, type_word(T_STRING, subtype));
        asm.mov_mr(sp, SVALUE_PAYLOAD_OFFSET, Reg::Rax);
        asm.add_mi32(Reg::Rax, REFS_OFFSET, 1);
        self.add_sp(1);
        Ok(())
    }

    fn swap(&mut self) {
        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, sp, -2 * SVALUE_SIZE);
        asm.mov_rm(Reg::Rcx, sp, -2 * SVALUE_SIZE + 8);
        asm.mov_rm(Reg::R10, sp, -SVALUE_SIZE);
        asm.mov_rm(Reg::R11, sp, -SVALUE_SIZE + 8);
        asm.mov_mr(sp, -2 * SVALUE_SIZE, Reg::R10);
        asm.mov_mr(sp, -2 * SVALUE_SIZE + 8, Reg::R11);
        asm.mov_mr(sp, -SVALUE_SIZE, Reg::Rax);
        asm.mov_mr(sp, -SVALUE_SIZE + 8, Reg::Rcx);
    }

    /// Mark at `sp - slots`.
    fn mark(&mut self, slots: i32) -> JitResult<()> {
        let sp = self.load(VmReg::StackPointer);
        let msp = self.load(VmReg::MarkStackPointer);
        let mut asm = self.asm();
        if slots == 0 {
            asm.mov_mr(msp, 0, sp);
        } else {
            asm.add_rri(Reg::Rax, sp, -slot_offset(slots))?;
            asm.mov_mr(msp, 0, Reg::Rax);
        }
        asm.add_ri(msp, 8);
        self.regs.mark_dirty(VmReg::MarkStackPointer);
        Ok(())
    }

    /// `locals[index] = sp[-1]`, releasing the old value. The popping form
    /// moves the stack's reference; the other takes a new one.
    fn assign_local(&mut self, index: i32, pop: bool) -> JitResult<()> {
        let fp = self.load(VmReg::FramePointer);
        let sp = self.load(VmReg::StackPointer);
        let mut asm = self.asm();
        asm.mov_rm(SAVED_SCRATCH, fp, FRAME_LOCALS_OFFSET);
        asm.add_rri(SAVED_SCRATCH, SAVED_SCRATCH, slot_offset(index))?;
        self.inline_drop_ref(SAVED_SCRATCH, false)?;

        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, sp, -SVALUE_SIZE);
        asm.mov_rm(Reg::Rcx, sp, -SVALUE_SIZE + 8);
        asm.mov_mr(SAVED_SCRATCH, SVALUE_TYPE_OFFSET, Reg::Rax);
        asm.mov_mr(SAVED_SCRATCH, SVALUE_PAYLOAD_OFFSET, Reg::Rcx);
        if pop {
            self.add_sp(-1);
        } else {
            asm.lea(Reg::R10, sp, -SVALUE_SIZE);
            self.inline_take_ref(Reg::R10, false)?;
        }
        Ok(())
    }

    /// Identifier index `level + index` into `dst`.
    fn global_index(&mut self, dst: Reg, index: i32) {
        let fp = self.load(VmReg::FramePointer);
        let mut asm = self.asm();
        asm.mov_rm(dst, fp, FRAME_CONTEXT_OFFSET);
        asm.movzx_rm16(dst, dst, CONTEXT_IDENTIFIER_LEVEL_OFFSET);
        asm.add_ri(dst, index);
    }

    fn push_global(&mut self, pc: usize, index: i32) -> JitResult<()> {
        let fp = self.load(VmReg::FramePointer);
        let sp = self.load(VmReg::StackPointer);
        self.update_pc(pc)?;
        self.flush();

        let [a1, a2, a3, _] = self.cc.args;
        self.global_index(a3, index);
        let mut asm = self.asm();
        asm.mov_rm(a2, fp, FRAME_CURRENT_OBJECT_OFFSET);
        asm.mov_rr(a1, sp);
        asm.call_abs(fallback::low_object_index_no_free as usize)?;
        self.stats.helper_calls += 1;
        self.add_sp(1);
        Ok(())
    }

    fn assign_global(&mut self, pc: usize, index: i32, pop: bool) -> JitResult<()> {
        let fp = self.load(VmReg::FramePointer);
        let sp = self.load(VmReg::StackPointer);
        self.update_pc(pc)?;
        self.flush();

        let [a1, a2, a3, _] = self.cc.args;
        self.global_index(a2, index);
        let mut asm = self.asm();
        asm.mov_rm(a1, fp, FRAME_CURRENT_OBJECT_OFFSET);
        asm.lea(a3, sp, -SVALUE_SIZE);
        asm.call_abs(fallback::object_low_set_index as usize)?;
        self.stats.helper_calls += 1;
        if pop {
            self.add_sp(-1);
            // the global now holds a reference
            self.inline_drop_ref(sp, true)?;
        }
        Ok(())
    }

    /// Integer locals are tested inline; anything else asks the fallback.
    fn branch_if_local(&mut self, pc: usize, instr: &Instr) -> JitResult<()> {
        let index = Self::imm(instr, 0)?;
        let target = self.branch_target(pc, instr)?;
        self.update_pc(pc)?;
        let fp = self.load(VmReg::FramePointer);
        self.flush();

        let mut not_int = self.label();
        let mut test = self.label();
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, fp, FRAME_LOCALS_OFFSET);
        asm.add_rri(Reg::Rax, Reg::Rax, slot_offset(index))?;
        asm.mov_rm32(Reg::Rcx, Reg::Rax, SVALUE_TYPE_OFFSET);
        asm.and_ri(Reg::Rcx, TYPE_MASK as i32);
        asm.cmp_ri(Reg::Rcx, T_INT as i32);
        asm.jcc_label(Cond::Ne, &mut not_int)?;
        asm.mov_rm(Reg::Rax, Reg::Rax, SVALUE_PAYLOAD_OFFSET);
        asm.jmp_label(&mut test)?;

        not_int.place(&mut self.buf)?;
        self.call_fallback(pc, Opcode::BranchIfLocal, (index, 0), None)?;

        test.place(&mut self.buf)?;
        self.asm().test_rr(Reg::Rax, Reg::Rax);
        let cond = if instr.op == Opcode::BranchIfLocal { Cond::Ne } else { Cond::E };
        self.branch_on(pc, cond, target)
    }

    /// Counted loop on an integer at the top of the stack: non-zero is
    /// decremented in place and branches, zero is popped. Other types go
    /// through the fallback.
    fn counted_loop(&mut self, pc: usize, instr: &Instr) -> JitResult<()> {
        let target = self.branch_target(pc, instr)?;
        self.update_pc(pc)?;
        let sp = self.load(VmReg::StackPointer);
        self.flush();

        let mut generic = self.label();
        let mut exhausted = self.label();
        let mut merge = self.label();
        let mut asm = self.asm();
        asm.mov_rm32(Reg::Rax, sp, -SVALUE_SIZE + SVALUE_TYPE_OFFSET);
        asm.cmp_ri(Reg::Rax, T_INT as i32);
        asm.jcc_label(Cond::Ne, &mut generic)?;
        asm.mov_rm(Reg::Rax, sp, -SVALUE_SIZE + SVALUE_PAYLOAD_OFFSET);
        asm.test_rr(Reg::Rax, Reg::Rax);
        asm.jcc_label(Cond::E, &mut exhausted)?;
        asm.add_ri(Reg::Rax, -1);
        asm.mov_mr(sp, -SVALUE_SIZE + SVALUE_PAYLOAD_OFFSET, Reg::Rax);
        asm.mov_ri(Reg::Rax, 1);
        asm.jmp_label(&mut merge)?;

        // a zero integer needs no release
        exhausted.place(&mut self.buf)?;
        self.asm().sub_ri(sp, SVALUE_SIZE);
        self.regs.mark_dirty(VmReg::StackPointer);
        self.flush();
        let mut asm = self.asm();
        asm.clear(Reg::Rax);
        asm.jmp_label(&mut merge)?;

        generic.place(&mut self.buf)?;
        self.call_fallback(pc, Opcode::Loop, (0, 0), None)?;

        merge.place(&mut self.buf)?;
        // the paths disagree on sp; reload it from the state block
        if self.regs.is_cached(VmReg::StackPointer) {
            self.regs.invalidate(VmReg::StackPointer);
        }
        self.asm().test_rr(Reg::Rax, Reg::Rax);
        self.branch_on(pc, Cond::Ne, target)
    }
}
