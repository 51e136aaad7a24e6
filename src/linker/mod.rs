//! Linker / ROM Assembler (spec §4.5): composes the final block order,
//! resolves every label to an absolute address, and emits the byte-exact
//! `.nes` image (header, two program banks, one character bank).

use std::collections::HashMap;

use crate::errors::CompileError;
use crate::object::{BASE_CODE_ADDRESS, Block, Program};

pub const PROGRAM_BANK_SIZE: usize = 16 * 1024;
pub const PROGRAM_BANKS: usize = 2;
pub const CHR_BANK_SIZE: usize = 8 * 1024;
pub const HEADER_SIZE: usize = 16;

/// Whether the cartridge is wired for vertical or horizontal nametable
/// mirroring (spec §6 "flags bit 0").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
}

/// Everything the linker needs beyond the ordered block list: the vector
/// table's three targets and the CHR bank bytes from the assembly reader's
/// `CHARS` segment.
pub struct LinkInput {
    pub blocks: Vec<Block>,
    pub nmi_label: String,
    pub reset_label: String,
    pub irq_label: String,
    pub chr_data: Vec<u8>,
    pub mirroring: Mirroring,
}

/// Assigns addresses to every block's label (and its intra-block labels),
/// in order, starting from `BASE_CODE_ADDRESS` (spec §4.5 "Address
/// resolution", pass 1).
fn assign_addresses(blocks: &[Block]) -> (HashMap<String, u16>, Vec<u16>) {
    let mut global_labels = HashMap::new();
    let mut block_addrs = Vec::with_capacity(blocks.len());
    let mut addr = BASE_CODE_ADDRESS;
    for block in blocks {
        block_addrs.push(addr);
        if let Some(label) = &block.label {
            global_labels.insert(label.clone(), addr);
        }
        for (name, local_addr) in block.local_label_addresses(addr) {
            global_labels.insert(name, local_addr);
        }
        addr = addr.wrapping_add(block.size_bytes());
    }
    (global_labels, block_addrs)
}

/// Walks every block a second time, resolving operands against the combined
/// label map and concatenating the emitted bytes (spec §4.5 pass 2).
fn emit_blocks(blocks: &[Block], block_addrs: &[u16], labels: &HashMap<String, u16>) -> Result<Vec<u8>, CompileError> {
    let mut out = Vec::new();
    for (block, &base) in blocks.iter().zip(block_addrs) {
        let mut here = base;
        for insn in block.instructions() {
            let bytes = insn.encode(here, labels)?;
            if bytes.len() as u16 != insn.size() {
                return Err(CompileError::Malformed {
                    reason: format!(
                        "instruction {:?} encoded to {} bytes, expected {}",
                        insn.mnemonic,
                        bytes.len(),
                        insn.size()
                    ),
                });
            }
            here = here.wrapping_add(insn.size());
            out.extend(bytes);
        }
    }
    Ok(out)
}

/// Links the full block list and returns the complete `.nes` byte image.
pub fn link(input: LinkInput) -> Result<Vec<u8>, CompileError> {
    let (labels, block_addrs) = assign_addresses(&input.blocks);

    let mut program = Program::new();
    program.global_labels = labels.clone();
    program.blocks = input.blocks;

    let mut code = emit_blocks(&program.blocks, &block_addrs, &labels)?;

    let total_program_size = PROGRAM_BANK_SIZE * PROGRAM_BANKS;
    let vector_table_size = 6;
    if code.len() + vector_table_size > total_program_size {
        return Err(CompileError::Capacity {
            reason: format!(
                "emitted code ({} bytes) plus interrupt vectors does not fit in {} program bytes",
                code.len(),
                total_program_size
            ),
        });
    }
    code.resize(total_program_size - vector_table_size, 0);

    let resolve = |name: &str| -> Result<u16, CompileError> {
        labels.get(name).copied().ok_or_else(|| CompileError::UnresolvedSymbol { name: name.to_string() })
    };
    let nmi_addr = resolve(&input.nmi_label)?;
    let reset_addr = resolve(&input.reset_label)?;
    let irq_addr = resolve(&input.irq_label)?;
    code.extend(nmi_addr.to_le_bytes());
    code.extend(reset_addr.to_le_bytes());
    code.extend(irq_addr.to_le_bytes());

    let mut chr = input.chr_data;
    if chr.len() > CHR_BANK_SIZE {
        return Err(CompileError::Capacity {
            reason: format!("CHARS segment ({} bytes) exceeds the {}-byte character bank", chr.len(), CHR_BANK_SIZE),
        });
    }
    chr.resize(CHR_BANK_SIZE, 0);

    let mut rom = Vec::with_capacity(HEADER_SIZE + code.len() + chr.len());
    rom.extend(header(&input.mirroring));
    rom.extend(code);
    rom.extend(chr);
    Ok(rom)
}

fn header(mirroring: &Mirroring) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0] = b'N';
    h[1] = b'E';
    h[2] = b'S';
    h[3] = 0x1A;
    h[4] = PROGRAM_BANKS as u8;
    h[5] = 1; // one 8 KiB character bank
    h[6] = match mirroring {
        Mirroring::Vertical => 0x01,
        Mirroring::Horizontal => 0x00,
    };
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Insn;
    use crate::object::Mnemonic::Rts;

    #[test]
    fn byte_preservation_invariant_holds() {
        let mut reset = Block::new(Some("reset".to_string()));
        reset.append(Insn::implied(Rts));
        let input = LinkInput {
            blocks: vec![reset],
            nmi_label: "reset".to_string(),
            reset_label: "reset".to_string(),
            irq_label: "reset".to_string(),
            chr_data: vec![0xAB; 10],
            mirroring: Mirroring::Horizontal,
        };
        let rom = link(input).unwrap();
        assert_eq!(rom.len(), HEADER_SIZE + PROGRAM_BANK_SIZE * PROGRAM_BANKS + CHR_BANK_SIZE);
        assert_eq!(&rom[0..4], b"NES\x1A");
    }

    #[test]
    fn reset_vector_points_at_reset_block() {
        let mut reset = Block::new(Some("reset".to_string()));
        reset.append(Insn::implied(Rts));
        let input = LinkInput {
            blocks: vec![reset],
            nmi_label: "reset".to_string(),
            reset_label: "reset".to_string(),
            irq_label: "reset".to_string(),
            chr_data: vec![],
            mirroring: Mirroring::Horizontal,
        };
        let rom = link(input).unwrap();
        let vector_offset = HEADER_SIZE + PROGRAM_BANK_SIZE * PROGRAM_BANKS - 4;
        let reset_vec = u16::from_le_bytes([rom[vector_offset], rom[vector_offset + 1]]);
        assert_eq!(reset_vec, BASE_CODE_ADDRESS);
    }

    #[test]
    fn unresolved_label_fails_hard() {
        let mut block = Block::new(Some("main".to_string()));
        block.append(Insn::new(
            crate::object::Mnemonic::Jmp,
            crate::object::mnemonic::AddressingMode::Absolute,
            crate::object::Operand::Label("missing".to_string()),
        ));
        let input = LinkInput {
            blocks: vec![block],
            nmi_label: "main".to_string(),
            reset_label: "main".to_string(),
            irq_label: "main".to_string(),
            chr_data: vec![],
            mirroring: Mirroring::Horizontal,
        };
        let err = link(input).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedSymbol { .. }));
    }
}
