//! Forward and backward jump labels.
//!
//! A label is either placed (its address is known) or has a short list of
//! pending sites. Each site remembers whether it holds a one-byte or a
//! four-byte displacement, counted from the end of that field.

use super::codebuf::CodeBuffer;
use super::x86_64::{Cond, Reg, X86_64Assembler, fits_i8, fits_i32};
use crate::error::{JitError, JitResult};

/// Default bound on pending sites per label.
pub const MAX_LABEL_USES: usize = 6;

/// Fewest pending sites the translator's own sequences need on one label.
pub const MIN_LABEL_USES: usize = 3;

/// Width of a displacement field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Rel8,
    Rel32,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Rel8 => 1,
            Width::Rel32 => 4,
        }
    }

    fn fits(self, displacement: i64) -> bool {
        match self {
            Width::Rel8 => fits_i8(displacement),
            Width::Rel32 => fits_i32(displacement),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Label {
    addr: Option<usize>,
    sites: Vec<(usize, Width)>,
    limit: usize,
}

impl Default for Label {
    fn default() -> Self {
        Self::new()
    }
}

impl Label {
    pub fn new() -> Self {
        Self::with_limit(MAX_LABEL_USES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            addr: None,
            sites: Vec::new(),
            limit,
        }
    }

    pub fn address(&self) -> Option<usize> {
        self.addr
    }

    pub fn is_placed(&self) -> bool {
        self.addr.is_some()
    }

    pub fn pending(&self) -> usize {
        self.sites.len()
    }

    /// Emits a displacement field referring to this label at the current
    /// position. Placed labels get their final value right away.
    pub fn reference(&mut self, buf: &mut CodeBuffer, width: Width) -> JitResult<()> {
        let site = buf.offset();
        match self.addr {
            Some(addr) => {
                let displacement = addr as i64 - (site + width.bytes()) as i64;
                emit_displacement(buf, site, displacement, width)
            }
            None => {
                if self.sites.len() >= self.limit {
                    return Err(JitError::TooManyLabelUses { limit: self.limit });
                }
                self.sites.push((site, width));
                match width {
                    Width::Rel8 => buf.emit_u8(0),
                    Width::Rel32 => buf.emit_u32(0),
                }
                Ok(())
            }
        }
    }

    /// Binds the label to the current position and patches every pending
    /// site.
    pub fn place(&mut self, buf: &mut CodeBuffer) -> JitResult<()> {
        if let Some(placed_at) = self.addr {
            return Err(JitError::LabelReused { placed_at });
        }
        let here = buf.offset();
        for (site, width) in self.sites.drain(..) {
            let displacement = here as i64 - (site + width.bytes()) as i64;
            if !width.fits(displacement) {
                return Err(JitError::BranchTooFar {
                    site,
                    displacement,
                    width: width.bytes(),
                });
            }
            match width {
                Width::Rel8 => buf.patch_i8(site, displacement as i8)?,
                Width::Rel32 => buf.patch_i32(site, displacement as i32)?,
            }
        }
        self.addr = Some(here);
        Ok(())
    }
}

fn emit_displacement(buf: &mut CodeBuffer, site: usize, displacement: i64, width: Width) -> JitResult<()> {
    if !width.fits(displacement) {
        return Err(JitError::BranchTooFar {
            site,
            displacement,
            width: width.bytes(),
        });
    }
    match width {
        Width::Rel8 => buf.emit_u8(displacement as i8 as u8),
        Width::Rel32 => buf.emit_u32(displacement as i32 as u32),
    }
    Ok(())
}

impl X86_64Assembler<'_> {
    /// JMP rel8 to `label`.
    pub fn jmp_label(&mut self, label: &mut Label) -> JitResult<()> {
        self.buffer().emit_u8(0xEB);
        label.reference(self.buffer(), Width::Rel8)
    }

    /// Jcc rel8 to `label`.
    pub fn jcc_label(&mut self, cond: Cond, label: &mut Label) -> JitResult<()> {
        self.buffer().emit_u8(0x70 + cond as u8);
        label.reference(self.buffer(), Width::Rel8)
    }

    /// JMP rel32 to `label`.
    pub fn jmp_label32(&mut self, label: &mut Label) -> JitResult<()> {
        self.buffer().emit_u8(0xE9);
        label.reference(self.buffer(), Width::Rel32)
    }

    /// Jcc rel32 to `label`.
    pub fn jcc_label32(&mut self, cond: Cond, label: &mut Label) -> JitResult<()> {
        self.buffer().emit_bytes(&[0x0F, 0x80 + cond as u8]);
        label.reference(self.buffer(), Width::Rel32)
    }

    /// LEA dst, [rip + label]
    pub fn lea_label(&mut self, dst: Reg, label: &mut Label) -> JitResult<()> {
        self.rip_prefix(dst);
        label.reference(self.buffer(), Width::Rel32)
    }

    /// Jumps to an already emitted address with the narrowest encoding.
    /// `cond` of `None` is an unconditional jump.
    pub fn jump_to(&mut self, cond: Option<Cond>, target: usize) {
        let here = self.offset() as i64;
        let short = target as i64 - (here + 2);
        if fits_i8(short) {
            match cond {
                Some(c) => self.jcc_rel8(c, short as i8),
                None => self.jmp_rel8(short as i8),
            }
            return;
        }
        // Code buffers never approach 2 GiB, so rel32 always reaches.
        match cond {
            Some(c) => self.jcc_rel32(c, (target as i64 - (here + 6)) as i32),
            None => self.jmp_rel32((target as i64 - (here + 5)) as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_rel8() {
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jcc_label(Cond::G, &mut label).unwrap();
        asm.ret();
        label.place(asm.buffer()).unwrap();
        // JG +1 over the RET
        assert_eq!(buf.code(), &[0x7F, 0x01, 0xC3]);
        assert_eq!(label.address(), Some(3));
        assert_eq!(label.pending(), 0);
    }

    #[test]
    fn test_forward_rel32_and_lea() {
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.lea_label(Reg::Rcx, &mut label).unwrap();
        asm.jmp_label32(&mut label).unwrap();
        label.place(asm.buffer()).unwrap();
        assert_eq!(
            buf.code(),
            &[0x48, 0x8D, 0x0D, 0x05, 0, 0, 0, 0xE9, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_reference_after_place() {
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        label.place(&mut buf).unwrap();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jmp_label(&mut label).unwrap();
        assert_eq!(buf.code(), &[0xEB, 0xFE]);
    }

    #[test]
    fn test_place_twice() {
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        label.place(&mut buf).unwrap();
        assert!(matches!(label.place(&mut buf), Err(JitError::LabelReused { placed_at: 0 })));
    }

    #[test]
    fn test_too_many_uses() {
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        for _ in 0..MAX_LABEL_USES {
            asm.jmp_label(&mut label).unwrap();
        }
        assert!(matches!(
            asm.jmp_label(&mut label),
            Err(JitError::TooManyLabelUses { limit: MAX_LABEL_USES })
        ));
    }

    #[test]
    fn test_rel8_too_far() {
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jmp_label(&mut label).unwrap();
        for _ in 0..200 {
            asm.ret();
        }
        assert!(matches!(
            label.place(asm.buffer()),
            Err(JitError::BranchTooFar { site: 1, displacement: 200, width: 1 })
        ));
    }

    /// Every use count up to the bound, alternating rel8 and rel32 sites
    /// with filler in between, patches each site relative to its own end.
    #[test]
    fn test_every_use_count_patches_each_site() {
        for uses in 0..=MAX_LABEL_USES {
            let mut buf = CodeBuffer::new();
            let mut label = Label::new();
            let mut sites = Vec::new();
            let mut asm = X86_64Assembler::new(&mut buf);
            for i in 0..uses {
                if i % 2 == 0 {
                    asm.jmp_label(&mut label).unwrap();
                    sites.push((asm.offset() - 1, Width::Rel8));
                } else {
                    asm.jcc_label32(Cond::L, &mut label).unwrap();
                    sites.push((asm.offset() - 4, Width::Rel32));
                }
                asm.ret();
                asm.ret();
            }
            assert_eq!(label.pending(), uses);
            label.place(asm.buffer()).unwrap();
            let target = buf.len() as i64;
            for (site, width) in sites {
                let end = (site + width.bytes()) as i64;
                let stored = match width {
                    Width::Rel8 => buf.code()[site] as i8 as i64,
                    Width::Rel32 => {
                        let bytes: [u8; 4] = buf.code()[site..site + 4].try_into().unwrap();
                        i32::from_le_bytes(bytes) as i64
                    }
                };
                assert_eq!(stored, target - end, "{} uses, site {}", uses, site);
            }
            assert_eq!(label.pending(), 0);
        }
    }

    #[test]
    fn test_rel8_forward_limit() {
        // site at 1, field ends at 2: 127 bytes of filler reach +127
        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jmp_label(&mut label).unwrap();
        asm.buffer().emit_bytes(&[0x90; 127]);
        label.place(asm.buffer()).unwrap();
        assert_eq!(buf.code()[1], 0x7F);

        let mut buf = CodeBuffer::new();
        let mut label = Label::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jmp_label(&mut label).unwrap();
        asm.buffer().emit_bytes(&[0x90; 128]);
        assert!(matches!(
            label.place(asm.buffer()),
            Err(JitError::BranchTooFar { site: 1, displacement: 128, width: 1 })
        ));
    }

    #[test]
    fn test_jump_to_backward_limit() {
        // at 126, a short jump back to 0 is -128
        let mut buf = CodeBuffer::new();
        buf.emit_bytes(&[0x90; 126]);
        X86_64Assembler::new(&mut buf).jump_to(None, 0);
        assert_eq!(&buf.code()[126..], &[0xEB, 0x80]);

        // one byte further needs rel32: 0 - (127 + 5) = -132
        let mut buf = CodeBuffer::new();
        buf.emit_bytes(&[0x90; 127]);
        X86_64Assembler::new(&mut buf).jump_to(None, 0);
        assert_eq!(&buf.code()[127..], &[0xE9, 0x7C, 0xFF, 0xFF, 0xFF]);

        // conditional: 0 - (127 + 6) = -133
        let mut buf = CodeBuffer::new();
        buf.emit_bytes(&[0x90; 127]);
        X86_64Assembler::new(&mut buf).jump_to(Some(Cond::E), 0);
        assert_eq!(&buf.code()[127..], &[0x0F, 0x84, 0x7B, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_jump_to_picks_narrowest() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jump_to(None, 0);
        assert_eq!(asm.buffer().code(), &[0xEB, 0xFE]);

        let mut buf = CodeBuffer::new();
        buf.emit_bytes(&[0x90; 300]);
        let mut asm = X86_64Assembler::new(&mut buf);
        asm.jump_to(Some(Cond::Ne), 0);
        // 0 - (300 + 6) = -306
        assert_eq!(&buf.code()[300..], &[0x0F, 0x85, 0xCE, 0xFE, 0xFF, 0xFF]);
    }
}
