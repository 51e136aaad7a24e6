//! Reads an external assembly source file and turns it into object-model
//! blocks the linker can place alongside the code generator's own output
//! (spec §6 "Input assembly files", §9 "External runtime subroutine ABI").

pub mod ast;
pub mod parser;

pub use parser::Rule;

use crate::asmfile::ast::{AsmOperand, ByteItem, ByteSelector, Directive, Statement, Value};
use crate::errors::CompileError;
use crate::object::mnemonic::AddressingMode;
use crate::object::{Block, Insn, Mnemonic, Operand};

const CHARS_SEGMENT: &str = "CHARS";

/// One external `.s` file's contribution: code blocks destined for the
/// program bank and raw tile bytes destined for the CHR bank. The
/// underscore-prefix external ABI (spec §9) needs no separate symbol table
/// here — every block's label is already globalized by the linker, so an
/// extern method's `_name` call resolves against the `_name:` label the
/// assembly file defines the same way any other label does.
#[derive(Debug, Default)]
pub struct AssemblyUnit {
    pub blocks: Vec<Block>,
    pub chr_data: Vec<u8>,
}

/// Parses `source` and lowers it into an `AssemblyUnit`. `file_name` is used
/// only for error messages.
pub fn read_assembly(file_name: &str, source: &str) -> Result<AssemblyUnit, CompileError> {
    let lines = parser::parse_source(source)?;
    let mut unit = AssemblyUnit::default();
    let mut segment = "CODE".to_string();
    let mut current: Option<Block> = None;

    for line in lines {
        if let Some(label) = line.label {
            if segment == CHARS_SEGMENT {
                // Labels inside a CHARS segment are purely informational
                // (no runtime addressing exists for tile data); skip.
            } else {
                if let Some(block) = current.take() {
                    if block.instruction_count() > 0 || block.label.is_some() {
                        unit.blocks.push(block);
                    }
                }
                current = Some(Block::new(Some(label)));
            }
        }

        let Some(statement) = line.statement else { continue };
        match statement {
            Statement::Directive(Directive::Segment(name)) => {
                segment = name;
            }
            // Declarative only: every label is already globalized by the
            // linker regardless of whether it's marked exported.
            Statement::Directive(Directive::Import(_)) => {}
            Statement::Directive(Directive::Export(_)) => {}
            Statement::Directive(Directive::Byte(items)) => {
                if segment == CHARS_SEGMENT {
                    for item in items {
                        match item {
                            ByteItem::Number(b) => unit.chr_data.push(b),
                            ByteItem::Str(s) => unit.chr_data.extend(s.bytes()),
                        }
                    }
                } else {
                    let block = current.get_or_insert_with(|| Block::new(None));
                    for item in items {
                        match item {
                            ByteItem::Number(b) => block.append(Insn::raw_byte(Operand::Byte(b))),
                            ByteItem::Str(s) => {
                                for b in s.bytes() {
                                    block.append(Insn::raw_byte(Operand::Byte(b)));
                                }
                            }
                        }
                    }
                }
            }
            Statement::Directive(Directive::Word(items)) => {
                let block = current.get_or_insert_with(|| Block::new(None));
                for value in items {
                    block.append(Insn::raw_word(value_to_word_operand(value)));
                }
            }
            Statement::Directive(Directive::Res(count)) => {
                if segment == CHARS_SEGMENT {
                    unit.chr_data.extend(std::iter::repeat(0u8).take(count as usize));
                } else {
                    let block = current.get_or_insert_with(|| Block::new(None));
                    for _ in 0..count {
                        block.append(Insn::raw_byte(Operand::Byte(0)));
                    }
                }
            }
            Statement::Instruction(insn) => {
                if segment == CHARS_SEGMENT {
                    return Err(CompileError::Malformed {
                        reason: format!("{file_name}: instruction found inside CHARS segment"),
                    });
                }
                let block = current.get_or_insert_with(|| Block::new(None));
                block.append(lower_instruction(&insn.mnemonic, insn.operand.as_ref())?);
            }
        }
    }

    if let Some(block) = current {
        if block.instruction_count() > 0 || block.label.is_some() {
            unit.blocks.push(block);
        }
    }

    Ok(unit)
}

fn value_to_word_operand(value: Value) -> Operand {
    match value {
        Value::Number(n) => Operand::Absolute(n as u16),
        Value::Ident(name) => Operand::Label(name),
    }
}

const BRANCH_MNEMONICS: &[&str] =
    &["BEQ", "BNE", "BCC", "BCS", "BMI", "BPL", "BVC", "BVS"];

const IMPLIED_MNEMONICS: &[&str] = &[
    "INX", "INY", "DEX", "DEY", "TAX", "TXA", "TAY", "TYA", "TSX", "TXS", "CLC", "SEC", "CLD",
    "SEI", "CLI", "NOP", "BRK", "RTS", "RTI", "PHA", "PLA", "PHP", "PLP",
];

fn mnemonic_from_name(name: &str) -> Result<Mnemonic, CompileError> {
    use Mnemonic::*;
    Ok(match name {
        "LDA" => Lda, "LDX" => Ldx, "LDY" => Ldy,
        "STA" => Sta, "STX" => Stx, "STY" => Sty,
        "ADC" => Adc, "SBC" => Sbc, "AND" => And, "ORA" => Ora, "EOR" => Eor,
        "ASL" => Asl, "LSR" => Lsr, "ROL" => Rol, "ROR" => Ror,
        "INC" => Inc, "INX" => Inx, "INY" => Iny, "DEC" => Dec, "DEX" => Dex, "DEY" => Dey,
        "CMP" => Cmp, "CPX" => Cpx, "CPY" => Cpy, "BIT" => Bit,
        "CLC" => Clc, "SEC" => Sec, "CLD" => Cld, "SEI" => Sei, "CLI" => Cli,
        "BEQ" => Beq, "BNE" => Bne, "BCC" => Bcc, "BCS" => Bcs,
        "BMI" => Bmi, "BPL" => Bpl, "BVC" => Bvc, "BVS" => Bvs,
        "JMP" => Jmp, "JSR" => Jsr, "RTS" => Rts, "RTI" => Rti,
        "PHA" => Pha, "PLA" => Pla, "PHP" => Php, "PLP" => Plp,
        "TAX" => Tax, "TXA" => Txa, "TAY" => Tay, "TYA" => Tya, "TSX" => Tsx, "TXS" => Txs,
        "NOP" => Nop, "BRK" => Brk,
        other => {
            return Err(CompileError::OutOfDialect {
                method: "<assembly>".to_string(),
                reason: format!("unknown mnemonic `{other}`"),
            });
        }
    })
}

/// Chooses the addressing mode and operand encoding for one parsed
/// instruction line. Plain (unindexed, non-immediate) values become
/// zero-page when the literal fits in a byte and absolute otherwise;
/// identifiers always resolve as absolute (or relative, for branches)
/// since every program label lives above `0x8000`.
fn lower_instruction(mnemonic_name: &str, operand: Option<&AsmOperand>) -> Result<Insn, CompileError> {
    let mnemonic = mnemonic_from_name(mnemonic_name)?;
    let is_branch = BRANCH_MNEMONICS.contains(&mnemonic_name);

    let Some(operand) = operand else {
        if !IMPLIED_MNEMONICS.contains(&mnemonic_name)
            && !matches!(mnemonic, Mnemonic::Asl | Mnemonic::Lsr | Mnemonic::Rol | Mnemonic::Ror)
        {
            return Err(CompileError::OutOfDialect {
                method: "<assembly>".to_string(),
                reason: format!("`{mnemonic_name}` requires an operand"),
            });
        }
        let mode = if matches!(mnemonic, Mnemonic::Asl | Mnemonic::Lsr | Mnemonic::Rol | Mnemonic::Ror) {
            AddressingMode::Accumulator
        } else {
            AddressingMode::Implied
        };
        return Ok(Insn::new(mnemonic, mode, Operand::None));
    };

    Ok(match operand {
        AsmOperand::Immediate(selector, value) => {
            let op = match (selector, value) {
                (ByteSelector::None, Value::Number(n)) => Operand::Byte(*n as u8),
                (ByteSelector::None, Value::Ident(name)) => Operand::LabelLow(name.clone()),
                (ByteSelector::Low, Value::Number(n)) => Operand::Byte((*n & 0xFF) as u8),
                (ByteSelector::Low, Value::Ident(name)) => Operand::LabelLow(name.clone()),
                (ByteSelector::High, Value::Number(n)) => Operand::Byte((*n >> 8) as u8),
                (ByteSelector::High, Value::Ident(name)) => Operand::LabelHigh(name.clone()),
            };
            Insn::new(mnemonic, AddressingMode::Immediate, op)
        }
        AsmOperand::IndexedIndirectX(value) => {
            Insn::new(mnemonic, AddressingMode::IndirectX, value_to_byte_operand(value)?)
        }
        AsmOperand::IndirectIndexedY(value) => {
            Insn::new(mnemonic, AddressingMode::IndirectY, value_to_byte_operand(value)?)
        }
        AsmOperand::Indirect(value) => {
            Insn::new(mnemonic, AddressingMode::Indirect, value_to_word_operand_ref(value))
        }
        AsmOperand::AbsIndexedX(value) => {
            Insn::new(mnemonic, AddressingMode::AbsoluteX, value_to_word_operand_ref(value))
        }
        AsmOperand::AbsIndexedY(value) => {
            Insn::new(mnemonic, AddressingMode::AbsoluteY, value_to_word_operand_ref(value))
        }
        AsmOperand::Value(value) => {
            if is_branch {
                match value {
                    Value::Ident(name) => {
                        Insn::new(mnemonic, AddressingMode::Relative, Operand::RelativeLabel(name.clone()))
                    }
                    Value::Number(n) => {
                        Insn::new(mnemonic, AddressingMode::Relative, Operand::Relative(*n as i8))
                    }
                }
            } else {
                match value {
                    Value::Ident(name) => {
                        Insn::new(mnemonic, AddressingMode::Absolute, Operand::Label(name.clone()))
                    }
                    Value::Number(n) if *n <= 0xFF => {
                        Insn::new(mnemonic, AddressingMode::ZeroPage, Operand::Byte(*n as u8))
                    }
                    Value::Number(n) => {
                        Insn::new(mnemonic, AddressingMode::Absolute, Operand::Absolute(*n as u16))
                    }
                }
            }
        }
    })
}

fn value_to_byte_operand(value: &Value) -> Result<Operand, CompileError> {
    match value {
        Value::Number(n) if *n <= 0xFF => Ok(Operand::Byte(*n as u8)),
        Value::Number(n) => Err(CompileError::Capacity {
            reason: format!("indexed-indirect operand {n} does not fit in a zero-page byte"),
        }),
        Value::Ident(name) => Ok(Operand::LabelLow(name.clone())),
    }
}

fn value_to_word_operand_ref(value: &Value) -> Operand {
    match value {
        Value::Number(n) => Operand::Absolute(*n as u16),
        Value::Ident(name) => Operand::Label(name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_labeled_instructions_into_a_block() {
        let src = "init:\n  SEI\n  LDA #$00\n  STA $2000\n  RTS\n";
        let unit = read_assembly("t.s", src).unwrap();
        assert_eq!(unit.blocks.len(), 1);
        let block = &unit.blocks[0];
        assert_eq!(block.label.as_deref(), Some("init"));
        assert_eq!(block.instruction_count(), 4);
    }

    #[test]
    fn byte_directive_in_chars_segment_becomes_chr_data_not_a_block() {
        let src = ".segment \"CHARS\"\n.byte $00, $FF, $0F\n";
        let unit = read_assembly("t.s", src).unwrap();
        assert!(unit.blocks.is_empty());
        assert_eq!(unit.chr_data, vec![0x00, 0xFF, 0x0F]);
    }

    #[test]
    fn low_high_byte_immediate_produces_label_low_high_operands() {
        let src = "sub:\n  LDA #<message\n  LDX #>message\n  RTS\n";
        let unit = read_assembly("t.s", src).unwrap();
        let block = &unit.blocks[0];
        assert_eq!(block.instructions()[0].operand, Operand::LabelLow("message".to_string()));
        assert_eq!(block.instructions()[1].operand, Operand::LabelHigh("message".to_string()));
    }

    #[test]
    fn import_and_export_directives_parse_without_affecting_blocks() {
        let src = ".export draw_sprite\n.import memcpy\ndraw_sprite:\n  RTS\n";
        let unit = read_assembly("t.s", src).unwrap();
        assert_eq!(unit.blocks.len(), 1);
        assert_eq!(unit.blocks[0].label.as_deref(), Some("draw_sprite"));
        assert_eq!(unit.blocks[0].instruction_count(), 1);
    }
}
