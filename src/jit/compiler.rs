//! Function compiler: drives the translator over one function body and
//! publishes the result as executable code.

use serde::Serialize;

use super::abi::{CallingConvention, HOST};
use super::memory::ExecutableMemory;
use super::translator::{TranslationStats, Translator};
use crate::config::JitConfig;
use crate::error::{JitError, JitResult};
use crate::vm::{Instr, Interpreter, InterpreterState, Program, RunOutcome};

/// Signature of a compiled function body. Returns -1 when a return opcode
/// left the function and 0 when execution ran off the end.
pub type EntryFn = unsafe extern "C" fn(*mut InterpreterState) -> i64;

/// Machine code for one function body, not yet published.
#[derive(Debug, Clone, Serialize)]
pub struct Translation {
    pub name: String,
    pub convention: &'static str,
    #[serde(skip)]
    pub code: Vec<u8>,
    pub stats: TranslationStats,
}

impl Translation {
    /// Lowercase hex, sixteen bytes per line.
    pub fn hex_dump(&self) -> String {
        self.code
            .chunks(16)
            .enumerate()
            .map(|(i, chunk)| {
                let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                format!("{:04x}: {}\n", i * 16, bytes.join(" "))
            })
            .collect()
    }
}

/// Published code for one function body.
pub struct CompiledCode {
    memory: ExecutableMemory,
    convention: CallingConvention,
    name: String,
    stats: TranslationStats,
}

impl CompiledCode {
    pub fn code(&self) -> &[u8] {
        self.memory.bytes()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> TranslationStats {
        self.stats
    }

    /// Runs the body against `vm`'s state block.
    ///
    /// Guest errors raised by fallback routines are left on the state block
    /// for the caller to collect.
    pub fn run(&self, vm: &mut Interpreter) -> JitResult<RunOutcome> {
        if !cfg!(all(target_arch = "x86_64", unix)) || self.convention != HOST {
            return Err(JitError::UnsupportedHost);
        }
        // SAFETY: the memory holds a complete function emitted for the host
        // convention with the `EntryFn` signature, and it lives as long as
        // `self`.
        let raw = unsafe {
            let entry: EntryFn = std::mem::transmute::<*const u8, EntryFn>(self.memory.as_ptr());
            entry(vm.state_ptr())
        };
        tracing::debug!(name = %self.name, raw, "compiled code finished");
        Ok(if raw == -1 {
            RunOutcome::Returned
        } else {
            RunOutcome::FellThrough
        })
    }
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("name", &self.name)
            .field("convention", &self.convention.name)
            .field("size", &self.memory.len())
            .finish()
    }
}

pub struct JitCompiler {
    config: JitConfig,
    convention: CallingConvention,
}

impl JitCompiler {
    pub fn new(config: JitConfig) -> Self {
        Self::with_convention(config, HOST)
    }

    pub fn with_convention(config: JitConfig, convention: CallingConvention) -> Self {
        Self { config, convention }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Translates a function body into machine code.
    pub fn translate(&self, name: &str, code: &[Instr]) -> JitResult<Translation> {
        let len = code.len();
        let mut is_target = vec![false; len + 1];
        for (pc, instr) in code.iter().enumerate() {
            if instr.op.has_target() {
                let target = instr
                    .target
                    .ok_or(JitError::MissingBranchTarget { op: instr.op, pc })?;
                if target > len {
                    return Err(JitError::UnresolvedBranch { target, len });
                }
                is_target[target] = true;
            }
        }

        let mut tr = Translator::new(self.config.clone(), self.convention, len);
        tr.emit_entry();
        for (pc, instr) in code.iter().enumerate() {
            if is_target[pc] {
                tr.bind_target(pc)?;
            }
            tr.translate(pc, instr)?;
        }
        if is_target[len] {
            tr.bind_target(len)?;
        }
        tr.emit_fall_through()?;
        debug_assert!(!tr.regs().any_dirty());

        let (code, stats) = tr.finish();
        tracing::debug!(
            name,
            size = stats.code_size,
            inlined = stats.inlined,
            fallback_calls = stats.fallback_calls,
            "translated function"
        );
        Ok(Translation {
            name: name.to_string(),
            convention: self.convention.name,
            code,
            stats,
        })
    }

    /// Verifies, translates and publishes `program`'s body.
    pub fn compile(&self, program: &Program) -> JitResult<CompiledCode> {
        let translation = program
            .verify()
            .map_err(JitError::from)
            .and_then(|_| self.translate(&program.name, &program.code))
            .inspect_err(|e| {
                tracing::warn!(name = %program.name, error = %e, "compilation abandoned");
            })?;
        let memory = ExecutableMemory::publish(&translation.code)?;
        Ok(CompiledCode {
            memory,
            convention: self.convention,
            name: translation.name,
            stats: translation.stats,
        })
    }
}
