//! Host calling conventions.

use super::x86_64::Reg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingConvention {
    pub name: &'static str,
    /// First four integer argument registers.
    pub args: [Reg; 4],
    /// Bytes the caller reserves above the return address.
    pub shadow_space: i32,
}

pub const SYSV: CallingConvention = CallingConvention {
    name: "sysv",
    args: [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx],
    shadow_space: 0,
};

pub const WIN64: CallingConvention = CallingConvention {
    name: "win64",
    args: [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
    shadow_space: 32,
};

#[cfg(windows)]
pub const HOST: CallingConvention = WIN64;
#[cfg(not(windows))]
pub const HOST: CallingConvention = SYSV;

/// Fixed register roles in generated code. All are callee-saved in both
/// conventions.
pub const MARK_SP_REG: Reg = Reg::R12;
pub const SP_REG: Reg = Reg::R13;
pub const FP_REG: Reg = Reg::R14;
pub const CONTEXT_REG: Reg = Reg::R15;
/// Survives helper calls.
pub const SAVED_SCRATCH: Reg = Reg::Rbx;

impl CallingConvention {
    pub fn arg(&self, n: usize) -> Reg {
        self.args[n]
    }

    /// Bytes reserved below the saved registers: alignment padding plus
    /// shadow space.
    pub fn frame_padding(&self) -> i32 {
        8 + self.shadow_space
    }
}
