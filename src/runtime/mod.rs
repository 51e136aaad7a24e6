//! Runtime Library (spec §4.3): the fixed family of hand-authored
//! subroutines every produced ROM links against, plus a handful of optional
//! routines included only when the program actually calls them.

use crate::object::mnemonic::AddressingMode::*;
use crate::object::mnemonic::Mnemonic::*;
use crate::object::{Block, Insn, Operand};

/// First free zero-page address for locals and generator temps.
pub const LOCALS_BASE: u16 = 0x0325;
/// Object-attribute (sprite) shadow buffer, DMA'd to OAM every NMI.
pub const OAM_SHADOW: u16 = 0x0200;
/// Palette shadow buffer, uploaded to the PPU palette RAM every NMI.
pub const PALETTE_SHADOW: u16 = 0x01C0;

/// Hardware/software registers the runtime and code generator both touch.
pub const PPU_CTRL: u16 = 0x2000;
pub const PPU_MASK: u16 = 0x2001;
pub const PPU_STATUS: u16 = 0x2002;
pub const OAM_ADDR: u16 = 0x2003;
pub const PPU_SCROLL: u16 = 0x2005;
pub const PPU_ADDR: u16 = 0x2006;
pub const PPU_DATA: u16 = 0x2007;
pub const OAM_DMA: u16 = 0x4014;
pub const CONTROLLER1: u16 = 0x4016;

/// Zero-page scratch cells used by the code generator for spills and
/// multi-instruction idioms (shared, not per-local — they never need to
/// survive a call).
pub const TEMP0: u16 = 0x00F0;
pub const TEMP1: u16 = 0x00F1;
pub const TEMP2: u16 = 0x00F2;
pub const TEMP3: u16 = 0x00F3;

/// Names of optional routines, emitted only when the used-builtin set
/// requests them (spec §4.3). Matches the callee names the code generator's
/// intrinsic table and ordinary `call` lowering both use.
pub const OPT_PAD_POLL: &str = "pad_poll";
pub const OPT_DRAW_METASPRITE: &str = "draw_metasprite";
pub const OPT_NAMETABLE_ADDR_RUNTIME: &str = "nametable_addr_runtime";

fn implied(m: crate::object::Mnemonic) -> Insn {
    Insn::implied(m)
}

fn abs(m: crate::object::Mnemonic, addr: u16) -> Insn {
    Insn::new(m, Absolute, Operand::Absolute(addr))
}

fn imm(m: crate::object::Mnemonic, v: u8) -> Insn {
    Insn::new(m, Immediate, Operand::Byte(v))
}

fn zp(m: crate::object::Mnemonic, addr: u16) -> Insn {
    Insn::new(m, ZeroPage, Operand::Byte(addr as u8))
}

/// `reset`: the hardware-init block every ROM's reset vector points at.
/// Disables interrupts and decimal mode, turns the screen off, waits for
/// two vblanks, clears RAM, then falls into `main`.
pub fn reset_block(entry_label: &str) -> Block {
    let mut b = Block::new(Some("reset".to_string()));
    b.append(implied(Sei));
    b.append(implied(Cld));
    b.append(imm(Ldx, 0xFF));
    b.append(Insn::new(Txs, Implied, Operand::None));
    b.append(imm(Lda, 0x00));
    b.append(abs(Sta, PPU_CTRL));
    b.append(abs(Sta, PPU_MASK));
    b.set_next_label("vblank_wait1".to_string());
    b.append(abs(Bit, PPU_STATUS));
    b.append(Insn::new(Bpl, Relative, Operand::RelativeLabel("vblank_wait1".to_string())));
    b.append(Insn::new(Jsr, Absolute, Operand::Label("clear_ram".to_string())));
    b.set_next_label("vblank_wait2".to_string());
    b.append(abs(Bit, PPU_STATUS));
    b.append(Insn::new(Bpl, Relative, Operand::RelativeLabel("vblank_wait2".to_string())));
    b.append(Insn::new(Jmp, Absolute, Operand::Label(entry_label.to_string())));
    b
}

/// `clear_ram`: zeroes zero page and the two internal RAM pages used as the
/// object-attribute and general work area (spec §4.3 "`.bss` zeroing").
pub fn clear_ram_block() -> Block {
    let mut b = Block::new(Some("clear_ram".to_string()));
    b.append(imm(Lda, 0x00));
    b.append(Insn::new(Tax, Implied, Operand::None));
    b.set_next_label("clear_ram_loop".to_string());
    b.append(Insn::new(Sta, AbsoluteX, Operand::Absolute(0x0000)));
    b.append(Insn::new(Sta, AbsoluteX, Operand::Absolute(0x0100)));
    b.append(Insn::new(Sta, AbsoluteX, Operand::Absolute(0x0200)));
    b.append(Insn::new(Sta, AbsoluteX, Operand::Absolute(0x0300)));
    b.append(implied(Inx));
    b.append(Insn::new(Bne, Relative, Operand::RelativeLabel("clear_ram_loop".to_string())));
    b.append(implied(Rts));
    b
}

/// `nmi`: the vblank interrupt service. Uploads the palette shadow, DMAs the
/// object-attribute shadow to OAM, then returns — the program's own
/// per-frame work happens in `main`'s poll loop, not here, matching the
/// minimal-ISR style the spec's NMI dispatcher calls "update dispatcher".
pub fn nmi_block() -> Block {
    let mut b = Block::new(Some("nmi".to_string()));
    b.append(implied(Pha));
    b.append(implied(Txa));
    b.append(implied(Pha));
    b.append(implied(Tya));
    b.append(implied(Pha));

    b.append(Insn::new(Jsr, Absolute, Operand::Label("upload_palette".to_string())));
    b.append(imm(Lda, 0x00));
    b.append(abs(Sta, OAM_ADDR));
    b.append(imm(Lda, (OAM_SHADOW >> 8) as u8));
    b.append(abs(Sta, OAM_DMA));

    b.append(implied(Pla));
    b.append(Insn::new(Tay, Implied, Operand::None));
    b.append(implied(Pla));
    b.append(Insn::new(Tax, Implied, Operand::None));
    b.append(implied(Pla));
    b.append(implied(Rti));
    b
}

pub fn upload_palette_block() -> Block {
    let mut b = Block::new(Some("upload_palette".to_string()));
    b.append(imm(Lda, 0x3F));
    b.append(abs(Sta, PPU_ADDR));
    b.append(imm(Lda, 0x00));
    b.append(abs(Sta, PPU_ADDR));
    b.append(imm(Ldx, 0x00));
    b.set_next_label("upload_palette_loop".to_string());
    b.append(Insn::new(Lda, AbsoluteX, Operand::Absolute(PALETTE_SHADOW)));
    b.append(abs(Sta, PPU_DATA));
    b.append(implied(Inx));
    b.append(imm(Cpx, 0x20));
    b.append(Insn::new(Bne, Relative, Operand::RelativeLabel("upload_palette_loop".to_string())));
    b.append(implied(Rts));
    b
}

/// `ppu_on` / `ppu_off`: enable/disable background and sprite rendering.
pub fn ppu_on_block() -> Block {
    let mut b = Block::new(Some("ppu_on".to_string()));
    b.append(imm(Lda, 0x1E));
    b.append(abs(Sta, PPU_MASK));
    b.append(implied(Rts));
    b
}

pub fn ppu_off_block() -> Block {
    let mut b = Block::new(Some("ppu_off".to_string()));
    b.append(imm(Lda, 0x00));
    b.append(abs(Sta, PPU_MASK));
    b.append(implied(Rts));
    b
}

/// `vram_set_addr`: writes a 16-bit PPU address held in A:X (low:high) to
/// `PPUADDR`, high byte first as the hardware requires.
pub fn vram_set_addr_block() -> Block {
    let mut b = Block::new(Some("vram_set_addr".to_string()));
    b.append(zp(Stx, TEMP0));
    b.append(abs(Sta, TEMP1));
    b.append(zp(Lda, TEMP0));
    b.append(abs(Sta, PPU_ADDR));
    b.append(zp(Lda, TEMP1));
    b.append(abs(Sta, PPU_ADDR));
    b.append(implied(Rts));
    b
}

/// `vram_fill`: writes the byte in `Y` to `PPUDATA` `X` times, used for
/// nametable/attribute clears.
pub fn vram_fill_block() -> Block {
    let mut b = Block::new(Some("vram_fill".to_string()));
    b.set_next_label("vram_fill_loop".to_string());
    b.append(Insn::new(Tya, Implied, Operand::None));
    b.append(abs(Sta, PPU_DATA));
    b.append(implied(Dex));
    b.append(Insn::new(Bne, Relative, Operand::RelativeLabel("vram_fill_loop".to_string())));
    b.append(implied(Rts));
    b
}

/// Software-stack primitives (spec §4.3): a small in-RAM stack for passing
/// 16-bit arguments and holding values across calls, distinct from the 6502
/// hardware stack. `sp` lives at two fixed zero-page cells just below the
/// locals region.
pub const SOFT_SP_LO: u16 = LOCALS_BASE - 2;
pub const SOFT_SP_HI: u16 = LOCALS_BASE - 1;
/// Zero-page pointer cell holding the software stack's base address, used
/// as the indirection base for `(zp),Y`-mode access into it.
pub const SOFT_STACK_PTR: u16 = LOCALS_BASE - 4;

pub fn pushax_block() -> Block {
    let mut b = Block::new(Some("pushax".to_string()));
    b.append(zp(Ldy, SOFT_SP_LO));
    b.append(Insn::new(Sta, IndirectY, Operand::Byte(SOFT_STACK_PTR as u8)));
    b.append(implied(Iny));
    b.append(Insn::new(Txa, Implied, Operand::None));
    b.append(Insn::new(Sta, IndirectY, Operand::Byte(SOFT_STACK_PTR as u8)));
    b.append(zp(Inc, SOFT_SP_LO));
    b.append(zp(Inc, SOFT_SP_LO));
    b.append(implied(Rts));
    b
}

pub fn pusha_block() -> Block {
    let mut b = Block::new(Some("pusha".to_string()));
    b.append(zp(Ldy, SOFT_SP_LO));
    b.append(Insn::new(Sta, IndirectY, Operand::Byte(SOFT_STACK_PTR as u8)));
    b.append(zp(Inc, SOFT_SP_LO));
    b.append(implied(Rts));
    b
}

pub fn popax_block() -> Block {
    let mut b = Block::new(Some("popax".to_string()));
    b.append(zp(Dec, SOFT_SP_LO));
    b.append(zp(Dec, SOFT_SP_LO));
    b.append(zp(Ldy, SOFT_SP_LO));
    b.append(Insn::new(Lda, IndirectY, Operand::Byte(SOFT_STACK_PTR as u8)));
    b.append(implied(Pha));
    b.append(implied(Iny));
    b.append(Insn::new(Lda, IndirectY, Operand::Byte(SOFT_STACK_PTR as u8)));
    b.append(Insn::new(Tax, Implied, Operand::None));
    b.append(implied(Pla));
    b.append(implied(Rts));
    b
}

pub fn popa_block() -> Block {
    let mut b = Block::new(Some("popa".to_string()));
    b.append(zp(Dec, SOFT_SP_LO));
    b.append(zp(Ldy, SOFT_SP_LO));
    b.append(Insn::new(Lda, IndirectY, Operand::Byte(SOFT_STACK_PTR as u8)));
    b.append(implied(Rts));
    b
}

/// `incsp1`/`incsp2`/`incsp4`: drop 1/2/4 bytes from the software stack
/// without reading them (argument cleanup after a call).
pub fn incsp_block(label: &str, n: u8) -> Block {
    let mut b = Block::new(Some(label.to_string()));
    for _ in 0..n {
        b.append(zp(Dec, SOFT_SP_LO));
    }
    b.append(implied(Rts));
    b
}

/// `copydata`: copies `.rodata`-style initialized arrays from ROM to RAM on
/// startup. Address, source, and length are filled in by the generator per
/// call site; the routine itself expects them pre-loaded into `TEMP0..TEMP3`
/// and the count in `Y`.
pub fn copydata_block() -> Block {
    let mut b = Block::new(Some("copydata".to_string()));
    b.set_next_label("copydata_loop".to_string());
    b.append(implied(Dey));
    b.append(Insn::new(Lda, IndirectY, Operand::Byte(TEMP0 as u8)));
    b.append(Insn::new(Sta, IndirectY, Operand::Byte(TEMP2 as u8)));
    b.append(Insn::new(Cpy, Immediate, Operand::Byte(0)));
    b.append(Insn::new(Bne, Relative, Operand::RelativeLabel("copydata_loop".to_string())));
    b.append(implied(Rts));
    b
}

/// `donelib`: destructor-table trampoline, run once before `reset` falls
/// into an infinite idle loop at program end (this dialect has no process
/// exit; `main` never returns).
pub fn donelib_block() -> Block {
    let mut b = Block::new(Some("donelib".to_string()));
    b.append(implied(Rts));
    b
}

/// Every routine above, always present regardless of what the program uses.
pub fn fixed_blocks(entry_label: &str) -> Vec<Block> {
    vec![
        reset_block(entry_label),
        clear_ram_block(),
        nmi_block(),
        upload_palette_block(),
        ppu_on_block(),
        ppu_off_block(),
        vram_set_addr_block(),
        vram_fill_block(),
        pushax_block(),
        pusha_block(),
        popax_block(),
        popa_block(),
        incsp_block("incsp1", 1),
        incsp_block("incsp2", 2),
        incsp_block("incsp4", 4),
        copydata_block(),
        donelib_block(),
    ]
}

/// `pad_poll`: reads controller 1 into the accumulator, one bit per read,
/// strobing the latch first.
pub fn pad_poll_block() -> Block {
    let mut b = Block::new(Some(OPT_PAD_POLL.to_string()));
    b.append(imm(Lda, 0x01));
    b.append(abs(Sta, CONTROLLER1));
    b.append(imm(Lda, 0x00));
    b.append(abs(Sta, CONTROLLER1));
    b.append(imm(Ldx, 0x08));
    b.set_next_label("pad_poll_loop".to_string());
    b.append(abs(Lda, CONTROLLER1));
    b.append(Insn::new(Lsr, Accumulator, Operand::None));
    b.append(zp(Rol, TEMP0));
    b.append(implied(Dex));
    b.append(Insn::new(Bne, Relative, Operand::RelativeLabel("pad_poll_loop".to_string())));
    b.append(zp(Lda, TEMP0));
    b.append(implied(Rts));
    b
}

/// `draw_metasprite`: copies a fixed-layout four-tile metasprite (y, tile,
/// attr, x per entry, 16 bytes total) from a ROM table into the OAM shadow
/// at a runtime offset. Entered with the caller's third argument still in
/// `A`; the table pointer and base OAM index arrive via the software stack.
pub fn draw_metasprite_block() -> Block {
    let mut b = Block::new(Some(OPT_DRAW_METASPRITE.to_string()));
    b.append(zp(Sta, TEMP3));
    b.append(Insn::new(Jsr, Absolute, Operand::Label("popax".to_string())));
    b.append(zp(Sta, TEMP0));
    b.append(Insn::new(Stx, ZeroPage, Operand::Byte(TEMP1 as u8)));
    b.append(Insn::new(Jsr, Absolute, Operand::Label("popa".to_string())));
    b.append(Insn::new(Tax, Implied, Operand::None));
    b.append(imm(Ldy, 0x00));
    b.set_next_label("draw_metasprite_loop".to_string());
    b.append(Insn::new(Lda, IndirectY, Operand::Byte(TEMP0 as u8)));
    b.append(Insn::new(Sta, AbsoluteX, Operand::Absolute(OAM_SHADOW)));
    b.append(implied(Inx));
    b.append(implied(Iny));
    b.append(imm(Cpy, 16));
    b.append(Insn::new(Bne, Relative, Operand::RelativeLabel("draw_metasprite_loop".to_string())));
    b.append(implied(Rts));
    b
}

/// `nametable_addr_runtime`: computes the background nametable byte address
/// for a runtime-unknown `(x, y)` tile position on the 32x30 grid — used
/// when the code generator can't fold the intrinsic at compile time.
/// Expects `x` in `A`, `y` in `X` on entry; returns low byte in `A`, high
/// byte in `X`.
pub fn nametable_addr_runtime_block() -> Block {
    let mut b = Block::new(Some(OPT_NAMETABLE_ADDR_RUNTIME.to_string()));
    b.append(zp(Sta, TEMP0));
    b.append(Insn::new(Txa, Implied, Operand::None));
    b.append(Insn::new(Asl, Accumulator, Operand::None));
    for _ in 0..4 {
        b.append(Insn::new(Asl, Accumulator, Operand::None));
    }
    b.append(implied(Clc));
    b.append(zp(Adc, TEMP0));
    b.append(imm(Ldx, 0x20));
    b.append(implied(Rts));
    b
}

/// Returns the optional-routine blocks requested by `used`, in a stable
/// order (spec §4.3: "excluded routines shift downstream block addresses").
pub fn optional_blocks(used: &std::collections::HashSet<String>) -> Vec<Block> {
    let mut out = Vec::new();
    if used.contains(OPT_PAD_POLL) {
        out.push(pad_poll_block());
    }
    if used.contains(OPT_DRAW_METASPRITE) {
        out.push(draw_metasprite_block());
    }
    if used.contains(OPT_NAMETABLE_ADDR_RUNTIME) {
        out.push(nametable_addr_runtime_block());
    }
    out
}

/// All names the code generator may call that resolve to a runtime routine
/// rather than a user method or external-assembly import.
pub fn known_builtin_names() -> std::collections::HashSet<&'static str> {
    [OPT_PAD_POLL, OPT_DRAW_METASPRITE, OPT_NAMETABLE_ADDR_RUNTIME].into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_blocks_all_carry_entry_labels() {
        for b in fixed_blocks("main") {
            assert!(b.label.is_some());
            assert!(b.instruction_count() > 0);
        }
    }

    #[test]
    fn optional_blocks_empty_when_nothing_used() {
        let used = std::collections::HashSet::new();
        assert!(optional_blocks(&used).is_empty());
    }

    #[test]
    fn optional_blocks_includes_requested_routine() {
        let mut used = std::collections::HashSet::new();
        used.insert(OPT_PAD_POLL.to_string());
        let blocks = optional_blocks(&used);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label.as_deref(), Some(OPT_PAD_POLL));
    }
}
