//! Text bytecode assembler and the TOML program file format.
//!
//! Assembly syntax, one instruction per line:
//!
//! ```text
//! # comment
//! number 10
//! top:
//!   local 0
//!   loop top
//! ```
//!
//! Immediates are decimal or `0x` hex integers. Branch and jump mnemonics
//! take the target label as their last operand.

use super::ops::{Instr, Opcode};
use super::verify::VerifyError;
use super::Program;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsmError {
    #[error("line {line}: unknown mnemonic `{name}`")]
    UnknownMnemonic { line: usize, name: String },
    #[error("line {line}: bad immediate `{text}`")]
    BadImmediate { line: usize, text: String },
    #[error("line {line}: `{op}` takes {expected} operand(s), found {found}")]
    OperandCount {
        line: usize,
        op: Opcode,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: unknown label `{name}`")]
    UnknownLabel { line: usize, name: String },
    #[error("line {line}: label `{name}` defined twice")]
    DuplicateLabel { line: usize, name: String },
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// A pool constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Constant>),
}

/// On-disk program description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramFile {
    #[serde(default = "default_name")]
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub strings: Vec<String>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    #[serde(default)]
    pub globals: usize,
    #[serde(default)]
    pub locals: usize,
    /// Integers pushed onto the operand stack before the body runs.
    #[serde(default)]
    pub args: Vec<i64>,
}

fn default_name() -> String {
    "main".to_string()
}

impl ProgramFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("failed to parse program: {}", e))
    }

    /// Assembles the body and verifies it against the file's tables.
    pub fn assemble(&self) -> Result<Program, AsmError> {
        let program = Program {
            name: self.name.clone(),
            code: assemble(&self.code)?,
            strings: self.strings.clone(),
            constants: self.constants.clone(),
            globals: self.globals,
            locals: self.locals,
            args: self.args.clone(),
        };
        program.verify()?;
        Ok(program)
    }
}

fn parse_immediate(line: usize, text: &str) -> Result<i32, AsmError> {
    let bad = || AsmError::BadImmediate {
        line,
        text: text.to_string(),
    };
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).map_err(|_| bad())?,
        None => digits.parse::<i64>().map_err(|_| bad())?,
    };
    let value = if negative { -value } else { value };
    // Hex immediates may spell out all 32 bits of a negative number.
    if let Ok(v) = i32::try_from(value) {
        Ok(v)
    } else if (0..=u32::MAX as i64).contains(&value) {
        Ok(value as u32 as i32)
    } else {
        Err(bad())
    }
}

struct Line<'a> {
    number: usize,
    op: Opcode,
    operands: Vec<&'a str>,
}

/// Assembles text into instructions, resolving labels to instruction
/// indices.
pub fn assemble(source: &str) -> Result<Vec<Instr>, AsmError> {
    let mut labels: HashMap<&str, usize> = HashMap::new();
    let mut lines = Vec::new();

    for (i, raw) in source.lines().enumerate() {
        let number = i + 1;
        let mut text = raw.split('#').next().unwrap_or("").trim();

        while let Some((name, rest)) = text.split_once(':') {
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                break;
            }
            if labels.insert(name, lines.len()).is_some() {
                return Err(AsmError::DuplicateLabel {
                    line: number,
                    name: name.to_string(),
                });
            }
            text = rest.trim();
        }
        if text.is_empty() {
            continue;
        }

        let mut words = text.split_whitespace();
        let mnemonic = words.next().unwrap_or("");
        let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| AsmError::UnknownMnemonic {
            line: number,
            name: mnemonic.to_string(),
        })?;
        lines.push(Line {
            number,
            op,
            operands: words.collect(),
        });
    }

    lines
        .iter()
        .map(|line| {
            let immediates = line.op.immediates();
            let expected = immediates + line.op.has_target() as usize;
            if line.operands.len() != expected {
                return Err(AsmError::OperandCount {
                    line: line.number,
                    op: line.op,
                    expected,
                    found: line.operands.len(),
                });
            }

            let mut instr = Instr::new(line.op);
            if immediates > 0 {
                instr.arg0 = Some(parse_immediate(line.number, line.operands[0])?);
            }
            if immediates > 1 {
                instr.arg1 = Some(parse_immediate(line.number, line.operands[1])?);
            }
            if line.op.has_target() {
                let name = line.operands[immediates];
                let target = labels.get(name).copied().ok_or_else(|| AsmError::UnknownLabel {
                    line: line.number,
                    name: name.to_string(),
                })?;
                instr.target = Some(target);
            }
            Ok(instr)
        })
        .collect()
}

/// Renders instructions back into assembly, naming branch targets `L<n>`.
pub fn disassemble(code: &[Instr]) -> String {
    let mut targets: Vec<usize> = code.iter().filter_map(|i| i.target).collect();
    targets.sort_unstable();
    targets.dedup();

    let mut out = String::new();
    for (pc, instr) in code.iter().enumerate() {
        if targets.binary_search(&pc).is_ok() {
            out.push_str(&format!("L{}:\n", pc));
        }
        out.push_str("    ");
        out.push_str(instr.op.mnemonic());
        for arg in [instr.arg0, instr.arg1].into_iter().flatten() {
            out.push_str(&format!(" {}", arg));
        }
        if let Some(t) = instr.target {
            out.push_str(&format!(" L{}", t));
        }
        out.push('\n');
    }
    if targets.binary_search(&code.len()).is_ok() {
        out.push_str(&format!("L{}:\n", code.len()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_basic() {
        let code = assemble("const1\ndup  # twice\nadd\n").unwrap();
        assert_eq!(
            code,
            vec![
                Instr::new(Opcode::Const1),
                Instr::new(Opcode::Dup),
                Instr::new(Opcode::Add),
            ]
        );
    }

    #[test]
    fn test_assemble_labels() {
        let src = "number 3\ntop:\n  const1\n  pop_value\n  loop top\nend: branch_if_local 0 end\n";
        let code = assemble(src).unwrap();
        assert_eq!(code[3], Instr::branch(Opcode::Loop, 1));
        assert_eq!(code[4], Instr::branch_with_arg(Opcode::BranchIfLocal, 0, 4));
    }

    #[test]
    fn test_forward_label_past_end() {
        let code = assemble("branch out\nconst0\nout:\n").unwrap();
        assert_eq!(code[0].target, Some(2));
    }

    #[test]
    fn test_immediates() {
        let code = assemble("number64 0x1 0xffffffff\nneg_number -5").unwrap();
        assert_eq!(code[0], Instr::with_args(Opcode::Number64, 1, -1));
        assert_eq!(code[1], Instr::with_arg(Opcode::NegNumber, -5));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            assemble("frob"),
            Err(AsmError::UnknownMnemonic {
                line: 1,
                name: "frob".to_string()
            })
        );
        assert!(matches!(
            assemble("const0\nlocal"),
            Err(AsmError::OperandCount { line: 2, expected: 1, found: 0, .. })
        ));
        assert!(matches!(assemble("branch nowhere"), Err(AsmError::UnknownLabel { line: 1, .. })));
        assert!(matches!(assemble("a:\na:"), Err(AsmError::DuplicateLabel { line: 2, .. })));
        assert!(matches!(assemble("number zz"), Err(AsmError::BadImmediate { .. })));
    }

    #[test]
    fn test_program_file() {
        let file = ProgramFile::from_toml_str(
            r#"
code = """
string 0
constant 1
"""
strings = ["hi"]
constants = [4, "four", 4.5]
locals = 2
args = [7]
"#,
        )
        .unwrap();
        let program = file.assemble().unwrap();
        assert_eq!(program.name, "main");
        assert_eq!(program.code.len(), 2);
        assert_eq!(
            program.constants,
            vec![
                Constant::Int(4),
                Constant::Str("four".to_string()),
                Constant::Float(4.5)
            ]
        );
        assert_eq!(program.args, vec![7]);
    }

    #[test]
    fn test_array_constants() {
        let file = ProgramFile::from_toml_str("code = \"constant 0\"\nconstants = [[1, \"a\", [2.5]]]\n").unwrap();
        let program = file.assemble().unwrap();
        assert_eq!(
            program.constants[0],
            Constant::Array(vec![
                Constant::Int(1),
                Constant::Str("a".to_string()),
                Constant::Array(vec![Constant::Float(2.5)]),
            ])
        );
    }

    #[test]
    fn test_assemble_verifies_tables() {
        let file = ProgramFile {
            code: "local 0\nstring 2\n".to_string(),
            locals: 1,
            strings: vec!["s".to_string()],
            ..ProgramFile::default()
        };
        let err = file.assemble().unwrap_err();
        assert!(matches!(
            err,
            AsmError::Verify(VerifyError::IndexOutOfRange { pc: 1, table: "string", index: 2, len: 1, .. })
        ));
        assert!(err.to_string().contains("string index 2"), "{err}");

        let file = ProgramFile {
            code: "pop_value\n".to_string(),
            args: vec![4],
            ..ProgramFile::default()
        };
        assert!(file.assemble().is_ok());
        let file = ProgramFile {
            code: "pop_value\npop_value\n".to_string(),
            args: vec![4],
            ..ProgramFile::default()
        };
        assert!(matches!(
            file.assemble(),
            Err(AsmError::Verify(VerifyError::StackUnderflow { pc: 1, .. }))
        ));
    }

    #[test]
    fn test_catch_takes_a_label() {
        let code = assemble("catch out\nconst0\nout:\n").unwrap();
        assert_eq!(code[0], Instr::branch(Opcode::Catch, 2));
        assert!(matches!(assemble("catch\n"), Err(AsmError::OperandCount { expected: 1, .. })));
    }

    #[test]
    fn test_disassemble_reassembles() {
        let src = "top:\nlocal 1\nbranch_when_zero top\n";
        let code = assemble(src).unwrap();
        assert_eq!(assemble(&disassemble(&code)).unwrap(), code);
    }
}
