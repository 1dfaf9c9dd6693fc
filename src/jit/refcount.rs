//! Inlined reference-count bookkeeping.
//!
//! Both sequences classify the tag with the runtime's `TYPE_MASK` and
//! `MAX_REF_TYPE`, so they agree with `vm::is_ref_type` by construction.

use super::label::Label;
use super::translator::Translator;
use super::x86_64::{Cond, Reg, X86_64Assembler};
use crate::error::JitResult;
use crate::vm::fallback::really_free_svalue;
use crate::vm::layout::{REFS_OFFSET, SVALUE_PAYLOAD_OFFSET, SVALUE_TYPE_OFFSET};
use crate::vm::tags::{MAX_REF_TYPE, TYPE_MASK};

/// Emits `and rax, TYPE_MASK; cmp rax, MAX_REF_TYPE; jg skip`.
fn classify(asm: &mut X86_64Assembler, skip: &mut Label) -> JitResult<()> {
    asm.and_ri(Reg::Rax, TYPE_MASK as i32);
    asm.cmp_ri(Reg::Rax, MAX_REF_TYPE as i32);
    asm.jcc_label(Cond::G, skip)
}

impl Translator {
    /// Takes one reference on the value at `[src]`. With `type_in_rax` the
    /// tag word is already in RAX. Clobbers RAX.
    pub fn inline_take_ref(&mut self, src: Reg, type_in_rax: bool) -> JitResult<()> {
        debug_assert!(src != Reg::Rax);
        let mut skip = Label::new();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if !type_in_rax {
            asm.mov_rm32(Reg::Rax, src, SVALUE_TYPE_OFFSET);
        }
        classify(&mut asm, &mut skip)?;
        asm.mov_rm(Reg::Rax, src, SVALUE_PAYLOAD_OFFSET);
        asm.add_mi32(Reg::Rax, REFS_OFFSET, 1);
        skip.place(&mut self.buf)
    }

    /// Drops one reference on the value at `[src]`. Unless the count is
    /// known to stay positive, a count reaching zero calls the release
    /// routine with `src`. `src` must survive calls or the caller must not
    /// need it afterwards.
    pub fn inline_drop_ref(&mut self, src: Reg, guaranteed_nonzero: bool) -> JitResult<()> {
        debug_assert!(src != Reg::Rax);
        if !guaranteed_nonzero {
            // both paths leave the cache in the same state
            self.flush();
        }
        let arg = self.cc.arg(0);
        let mut skip = Label::new();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.mov_rm32(Reg::Rax, src, SVALUE_TYPE_OFFSET);
        classify(&mut asm, &mut skip)?;
        asm.mov_rm(Reg::Rax, src, SVALUE_PAYLOAD_OFFSET);
        asm.add_mi32(Reg::Rax, REFS_OFFSET, -1);
        if !guaranteed_nonzero {
            asm.jcc_label(Cond::Ne, &mut skip)?;
            if src != arg {
                asm.mov_rr(arg, src);
            }
            asm.call_abs(really_free_svalue as usize)?;
            self.stats.helper_calls += 1;
        }
        skip.place(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::jit::abi::SYSV;
    use crate::vm::{Svalue, is_ref_type, tags::*};

    fn translator() -> Translator {
        Translator::new(JitConfig::default(), SYSV, 0)
    }

    #[test]
    fn test_take_ref_sequence() {
        let mut tr = translator();
        tr.inline_take_ref(Reg::R10, false).unwrap();
        assert_eq!(
            tr.code(),
            &[
                0x41, 0x8B, 0x02, // mov eax, [r10]
                0x48, 0x83, 0xE0, 0x1F, // and rax, 0x1f
                0x48, 0x83, 0xF8, 0x07, // cmp rax, 7
                0x7F, 0x06, // jg +6
                0x49, 0x8B, 0x42, 0x08, // mov rax, [r10+8]
                0xFF, 0x00, // inc dword [rax]
            ]
        );
    }

    #[test]
    fn test_take_ref_with_known_type_skips_load() {
        let mut tr = translator();
        tr.inline_take_ref(Reg::R10, true).unwrap();
        assert_eq!(&tr.code()[..4], &[0x48, 0x83, 0xE0, 0x1F]);
    }

    #[test]
    fn test_drop_ref_guaranteed_has_no_call() {
        let mut tr = translator();
        tr.inline_drop_ref(Reg::R13, true).unwrap();
        let code = tr.code();
        // ends with dec dword [rax]
        assert_eq!(&code[code.len() - 2..], &[0xFF, 0x08]);
        assert!(!code.windows(2).any(|w| w == [0xFF, 0xD0]));
        assert_eq!(tr.stats().helper_calls, 0);
    }

    #[test]
    fn test_drop_ref_calls_release() {
        let mut tr = translator();
        tr.inline_drop_ref(Reg::Rbx, false).unwrap();
        let code = tr.code();
        // mov rdi, rbx before the call, call rax at the end
        assert!(code.windows(3).any(|w| w == [0x48, 0x89, 0xDF]));
        assert_eq!(&code[code.len() - 2..], &[0xFF, 0xD0]);
        assert_eq!(tr.stats().helper_calls, 1);
    }

    #[test]
    fn test_classification_matches_runtime() {
        for tag in 0u16..=0xff {
            for subtype in [0u16, 1, 0xffff] {
                let word = ((subtype as u32) << 16) | tag as u32;
                let inline = (word & TYPE_MASK as u32) as i64 <= MAX_REF_TYPE as i64;
                assert_eq!(inline, is_ref_type(word), "tag {tag} subtype {subtype}");
            }
        }
        for tag in [T_ARRAY, T_MAPPING, T_MULTISET, T_OBJECT, T_FUNCTION, T_PROGRAM, T_STRING, T_TYPE] {
            assert!(Svalue::with_type(tag, 0, 0).is_ref_counted());
        }
        for tag in [T_INT, T_FLOAT, T_VOID] {
            assert!(!Svalue::with_type(tag, 0, 0).is_ref_counted());
        }
    }
}
