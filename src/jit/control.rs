//! Function entry, the shared epilogue and the preemption check.

use super::abi::CONTEXT_REG;
use super::label::Label;
use super::translator::Translator;
use super::x86_64::{Cond, Reg, X86_64Assembler};
use crate::error::{JitError, JitResult};
use crate::vm::fallback::branch_check_threads_etc;
use crate::vm::layout::CHECK_COUNTER_OFFSET;

/// Callee-saved registers pushed after RBP, in push order.
pub const SAVED_REGS: [Reg; 5] = [Reg::R15, Reg::R14, Reg::R13, Reg::R12, Reg::Rbx];

/// Pop order of the epilogue.
const RESTORE_REGS: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

impl Translator {
    /// Prologue: frame link, callee-saved registers, alignment padding and
    /// shadow space, then the state block pointer into R15.
    pub fn emit_entry(&mut self) {
        let padding = self.cc.frame_padding();
        let context_arg = self.cc.arg(0);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        for r in SAVED_REGS {
            asm.push(r);
        }
        asm.sub_ri(Reg::Rsp, padding);
        asm.mov_rr(CONTEXT_REG, context_arg);
        self.saved = SAVED_REGS.to_vec();
        self.regs.reset();
    }

    /// Emits the epilogue at the current position and records it for reuse.
    /// RAX carries the function's result through it untouched.
    pub fn emit_shared_epilogue(&mut self) -> JitResult<()> {
        if self.epilogue.is_some() {
            return Err(JitError::EpilogueMismatch("epilogue emitted twice"));
        }
        if self.saved.is_empty() {
            return Err(JitError::EpilogueMismatch("no entry sequence recorded"));
        }
        if !self.saved.iter().rev().eq(RESTORE_REGS.iter()) {
            return Err(JitError::EpilogueMismatch("restore order differs from save order"));
        }
        let start = self.buf.offset();
        let padding = self.cc.frame_padding();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.add_ri(Reg::Rsp, padding);
        for r in RESTORE_REGS {
            asm.pop(r);
        }
        asm.pop(Reg::Rbp);
        asm.ret();
        self.epilogue = Some(start);
        Ok(())
    }

    /// Leaves the function: emits the epilogue the first time, jumps back to
    /// it afterwards.
    pub fn jump_to_epilogue(&mut self) -> JitResult<()> {
        match self.epilogue {
            Some(addr) => {
                X86_64Assembler::new(&mut self.buf).jump_to(None, addr);
                Ok(())
            }
            None => self.emit_shared_epilogue(),
        }
    }

    /// End of the body: flush and leave with a zero result.
    pub fn emit_fall_through(&mut self) -> JitResult<()> {
        self.flush();
        X86_64Assembler::new(&mut self.buf).clear(Reg::Rax);
        self.jump_to_epilogue()
    }

    /// Bumps the state block's counter and runs the scheduling hook once it
    /// exceeds the threshold. Registers must be flushed.
    pub fn emit_preemption_check(&mut self) -> JitResult<()> {
        debug_assert!(!self.regs.any_dirty());
        let threshold = self.config.preempt_threshold;
        let arg = self.cc.arg(0);
        let mut skip = Label::new();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.add_mi32(CONTEXT_REG, CHECK_COUNTER_OFFSET, 1);
        asm.mov_rm32(Reg::Rax, CONTEXT_REG, CHECK_COUNTER_OFFSET);
        asm.cmp_r32i(Reg::Rax, threshold);
        asm.jcc_label(Cond::Le, &mut skip)?;
        asm.mov_rr(arg, CONTEXT_REG);
        asm.call_abs(branch_check_threads_etc as usize)?;
        skip.place(&mut self.buf)?;
        self.stats.preemption_checks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::jit::abi::{SYSV, WIN64};

    #[test]
    fn test_entry_sysv() {
        let mut tr = Translator::new(JitConfig::default(), SYSV, 0);
        tr.emit_entry();
        assert_eq!(
            tr.code(),
            &[
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x41, 0x57, 0x41, 0x56, 0x41, 0x55, 0x41, 0x54, // push r15..r12
                0x53, // push rbx
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x49, 0x89, 0xFF, // mov r15, rdi
            ]
        );
    }

    #[test]
    fn test_entry_win64_reserves_shadow_space() {
        let mut tr = Translator::new(JitConfig::default(), WIN64, 0);
        tr.emit_entry();
        let code = tr.code();
        // sub rsp, 40; mov r15, rcx
        assert_eq!(&code[code.len() - 7..], &[0x48, 0x83, 0xEC, 0x28, 0x49, 0x89, 0xCF]);
    }

    #[test]
    fn test_epilogue_undoes_entry() {
        let mut tr = Translator::new(JitConfig::default(), SYSV, 0);
        tr.emit_entry();
        let start = tr.code().len();
        tr.jump_to_epilogue().unwrap();
        assert_eq!(
            &tr.code()[start..],
            &[
                0x48, 0x83, 0xC4, 0x08, // add rsp, 8
                0x5B, // pop rbx
                0x41, 0x5C, 0x41, 0x5D, 0x41, 0x5E, 0x41, 0x5F, // pop r12..r15
                0x5D, // pop rbp
                0xC3,
            ]
        );

        // a second exit jumps back
        let before = tr.code().len();
        tr.jump_to_epilogue().unwrap();
        assert_eq!(tr.code()[before], 0xEB);
        assert_eq!(tr.code().len(), before + 2);
    }

    #[test]
    fn test_epilogue_requires_entry() {
        let mut tr = Translator::new(JitConfig::default(), SYSV, 0);
        assert!(matches!(tr.jump_to_epilogue(), Err(JitError::EpilogueMismatch(_))));
    }

    #[test]
    fn test_epilogue_detects_mismatched_saves() {
        let mut tr = Translator::new(JitConfig::default(), SYSV, 0);
        tr.emit_entry();
        tr.saved.swap(0, 1);
        assert!(matches!(tr.emit_shared_epilogue(), Err(JitError::EpilogueMismatch(_))));
    }

    #[test]
    fn test_preemption_check() {
        let config = JitConfig {
            preempt_threshold: 5,
            ..JitConfig::default()
        };
        let mut tr = Translator::new(config, SYSV, 0);
        tr.emit_preemption_check().unwrap();
        let code = tr.code();
        assert_eq!(
            &code[..13],
            &[
                0x41, 0xFF, 0x47, 0x18, // inc dword [r15+24]
                0x41, 0x8B, 0x47, 0x18, // mov eax, [r15+24]
                0x83, 0xF8, 0x05, // cmp eax, 5
                0x7E, (code.len() - 13) as u8, // jle past the call
            ]
        );
        assert_eq!(&code[13..16], &[0x4C, 0x89, 0xFF]); // mov rdi, r15
        assert_eq!(tr.stats().preemption_checks, 1);
    }
}
