//! Kiln - an x86-64 code generator for a stack bytecode VM
//!
//! Function bodies are translated opcode by opcode into native code that
//! inlines the common fast paths and calls the VM's fallback routines for
//! everything else. The `vm` module carries the runtime those routines
//! operate on, including a reference interpreter.

pub mod config;
pub mod error;
pub mod jit;
pub mod runner;
pub mod vm;

pub use config::{JitConfig, JitMode};
pub use error::{JitError, JitResult};
pub use jit::{CompiledCode, JitCompiler, Translation, TranslationStats};
pub use runner::{Engine, Execution, execute};
pub use vm::{Instr, Interpreter, Opcode, Program, ProgramFile, RunOutcome};
