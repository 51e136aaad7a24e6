use std::collections::HashMap;

use crate::errors::CompileError;
use crate::object::mnemonic::{AddressingMode, Mnemonic, opcode_byte};
use crate::object::operand::Operand;

/// One target-machine instruction: a mnemonic, the addressing mode it was
/// assembled with, and its operand (spec §3 "Object-model instruction").
#[derive(Debug, Clone, PartialEq)]
pub struct Insn {
    pub mnemonic: Mnemonic,
    pub mode: AddressingMode,
    pub operand: Operand,
}

impl Insn {
    pub fn new(mnemonic: Mnemonic, mode: AddressingMode, operand: Operand) -> Self {
        Insn { mnemonic, mode, operand }
    }

    pub fn implied(mnemonic: Mnemonic) -> Self {
        Insn::new(mnemonic, AddressingMode::Implied, Operand::None)
    }

    /// Size in bytes: one opcode byte plus the addressing mode's operand
    /// width. Independent of whether operands are resolved yet — this is
    /// what makes the linker's first (address-assignment) pass possible.
    pub fn size(&self) -> u16 {
        if self.mnemonic == Mnemonic::Raw {
            self.mode.operand_size()
        } else {
            1 + self.mode.operand_size()
        }
    }

    /// Builds a raw-data pseudo-instruction: a literal byte with no opcode
    /// prefix, used for `.byte` data and the linker's literal tables.
    pub fn raw_byte(operand: Operand) -> Self {
        Insn::new(Mnemonic::Raw, AddressingMode::RawByte, operand)
    }

    /// Builds a raw-data pseudo-instruction for a 16-bit little-endian word
    /// (literal or label address), used for `.word` data.
    pub fn raw_word(operand: Operand) -> Self {
        Insn::new(Mnemonic::Raw, AddressingMode::RawWord, operand)
    }

    /// Emits this instruction's bytes, resolving any label operand against
    /// `labels` (local-then-global, spec §4.2). `here` is this instruction's
    /// own resolved address, needed for relative-branch math.
    pub fn encode(&self, here: u16, labels: &HashMap<String, u16>) -> Result<Vec<u8>, CompileError> {
        let mut bytes = if self.mnemonic == Mnemonic::Raw {
            Vec::new()
        } else {
            let opcode = opcode_byte(self.mnemonic, self.mode).ok_or_else(|| CompileError::Malformed {
                reason: format!(
                    "no opcode encoding for {:?} in {:?} mode (generator bug)",
                    self.mnemonic, self.mode
                ),
            })?;
            vec![opcode]
        };
        match &self.operand {
            Operand::None => {}
            Operand::Byte(b) => bytes.push(*b),
            Operand::Absolute(addr) => bytes.extend(addr.to_le_bytes()),
            Operand::Relative(r) => bytes.push(*r as u8),
            Operand::Label(name) => {
                let addr = resolve(labels, name)?;
                bytes.extend(addr.to_le_bytes());
            }
            Operand::LabelLow(name) => {
                let addr = resolve(labels, name)?;
                bytes.push((addr & 0xFF) as u8);
            }
            Operand::LabelHigh(name) => {
                let addr = resolve(labels, name)?;
                bytes.push((addr >> 8) as u8);
            }
            Operand::RelativeLabel(name) => {
                let target = resolve(labels, name)?;
                let rel = target as i32 - (here as i32 + 2);
                if !(-128..=127).contains(&rel) {
                    return Err(CompileError::BranchOutOfRange {
                        label: name.clone(),
                        offset: rel,
                    });
                }
                bytes.push(rel as i8 as u8);
            }
        }
        Ok(bytes)
    }
}

fn resolve(labels: &HashMap<String, u16>, name: &str) -> Result<u16, CompileError> {
    labels
        .get(name)
        .copied()
        .ok_or_else(|| CompileError::UnresolvedSymbol { name: name.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::mnemonic::{AddressingMode::*, Mnemonic::*};

    #[test]
    fn implied_is_one_byte() {
        let insn = Insn::implied(Rts);
        assert_eq!(insn.size(), 1);
        assert_eq!(insn.encode(0x8000, &HashMap::new()).unwrap(), vec![0x60]);
    }

    #[test]
    fn absolute_label_resolves() {
        let insn = Insn::new(Jmp, Absolute, Operand::Label("start".into()));
        let mut labels = HashMap::new();
        labels.insert("start".to_string(), 0x8010);
        assert_eq!(insn.encode(0x8000, &labels).unwrap(), vec![0x4C, 0x10, 0x80]);
    }

    #[test]
    fn raw_byte_has_no_opcode_prefix() {
        let insn = Insn::raw_byte(Operand::Byte(0x42));
        assert_eq!(insn.size(), 1);
        assert_eq!(insn.encode(0x8000, &HashMap::new()).unwrap(), vec![0x42]);
    }

    #[test]
    fn raw_word_resolves_label() {
        let insn = Insn::raw_word(Operand::Label("string_0".into()));
        let mut labels = HashMap::new();
        labels.insert("string_0".to_string(), 0x9123);
        assert_eq!(insn.size(), 2);
        assert_eq!(insn.encode(0x8000, &labels).unwrap(), vec![0x23, 0x91]);
    }

    #[test]
    fn relative_branch_out_of_range_errors() {
        let insn = Insn::new(Beq, Relative, Operand::RelativeLabel("far".into()));
        let mut labels = HashMap::new();
        labels.insert("far".to_string(), 0x9000);
        let err = insn.encode(0x8000, &labels).unwrap_err();
        assert!(matches!(err, CompileError::BranchOutOfRange { .. }));
    }
}
