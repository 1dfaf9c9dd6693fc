//! Executes a program under a `JitMode`.

use serde::Serialize;

use crate::config::{JitConfig, JitMode};
use crate::error::JitError;
use crate::jit::{JitCompiler, TranslationStats};
use crate::vm::{Interpreter, Program, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Interpreter,
    Compiled,
}

/// Final machine state after a run.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub engine: Engine,
    pub returned: bool,
    pub stack: Vec<String>,
    pub return_value: Option<String>,
    pub preempt_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<TranslationStats>,
}

fn host_can_execute() -> bool {
    cfg!(all(target_arch = "x86_64", unix))
}

pub fn execute(program: &Program, config: &JitConfig) -> Result<Execution, String> {
    let mut vm = Interpreter::new(program)?;

    let compiled = match config.mode {
        JitMode::Off => None,
        JitMode::On => Some(
            JitCompiler::new(config.clone())
                .compile(program)
                .map_err(|e| format!("{}: {}", program.name, e))?,
        ),
        JitMode::Auto if !host_can_execute() => None,
        JitMode::Auto => match JitCompiler::new(config.clone()).compile(program) {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!(name = %program.name, error = %e, "falling back to the interpreter");
                None
            }
        },
    };

    let (engine, outcome, stats) = match &compiled {
        Some(code) => {
            let outcome = match code.run(&mut vm) {
                Ok(outcome) => outcome,
                Err(JitError::UnsupportedHost) if config.mode == JitMode::Auto => {
                    vm.interpret(&program.code, config.preempt_threshold)?
                }
                Err(e) => return Err(e.to_string()),
            };
            if let Some(err) = vm.take_error() {
                return Err(err);
            }
            (Engine::Compiled, outcome, Some(code.stats()))
        }
        None => (
            Engine::Interpreter,
            vm.interpret(&program.code, config.preempt_threshold)?,
            None,
        ),
    };

    let returned = outcome == RunOutcome::Returned;
    Ok(Execution {
        engine,
        returned,
        stack: vm.stack().iter().map(ToString::to_string).collect(),
        return_value: returned.then(|| vm.return_value().to_string()),
        preempt_calls: vm.preempt_calls(),
        stats,
    })
}
