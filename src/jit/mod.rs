//! x86-64 code generation for function bodies.
//!
//! Leaves first: the instruction encoder (`x86_64`), jump labels (`label`),
//! the VM register cache (`regcache`), then the per-opcode `translator`
//! with its reference-count (`refcount`) and entry/exit (`control`)
//! sequences, and the `compiler` driver that publishes executable code.

pub mod abi;
pub mod codebuf;
pub mod compiler;
pub mod control;
pub mod label;
pub mod memory;
pub mod refcount;
pub mod regcache;
pub mod translator;
pub mod x86_64;

pub use compiler::{CompiledCode, EntryFn, JitCompiler, Translation};
pub use translator::{TranslationStats, Translator};
