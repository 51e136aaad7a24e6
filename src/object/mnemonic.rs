//! The 6502 mnemonics and addressing modes this system emits, plus the
//! static opcode-byte table. Only the subset of the full 6502 instruction
//! set the code generator and runtime library actually use is represented;
//! an unrepresentable (mnemonic, mode) pair is a generator bug, not a user
//! error, so `opcode_byte` panics rather than returning a `Result`.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Lda, Ldx, Ldy, Sta, Stx, Sty,
    Adc, Sbc, And, Ora, Eor,
    Asl, Lsr, Rol, Ror,
    Inc, Inx, Iny, Dec, Dex, Dey,
    Cmp, Cpx, Cpy, Bit,
    Clc, Sec, Cld, Sei, Cli,
    Beq, Bne, Bcc, Bcs, Bmi, Bpl, Bvc, Bvs,
    Jmp, Jsr, Rts, Rti,
    Pha, Pla, Php, Plp,
    Tax, Txa, Tay, Tya, Tsx, Txs,
    Nop, Brk,
    /// Pseudo-mnemonic for literal data emitted by `.byte`/`.word`
    /// directives and the linker's data tables — carries no opcode byte of
    /// its own (spec §3: a raw-data operand, not a CPU instruction).
    Raw,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    IndirectX,
    IndirectY,
    Indirect,
    Relative,
    /// One literal byte, no opcode prefix.
    RawByte,
    /// One literal 16-bit little-endian word (or label address), no opcode
    /// prefix.
    RawWord,
}

impl AddressingMode {
    /// Number of bytes the operand occupies, not counting the opcode byte
    /// (zero for the `Raw*` modes, which have no opcode byte at all — see
    /// `Insn::size`).
    pub fn operand_size(self) -> u16 {
        match self {
            AddressingMode::Implied | AddressingMode::Accumulator => 0,
            AddressingMode::Immediate
            | AddressingMode::ZeroPage
            | AddressingMode::ZeroPageX
            | AddressingMode::IndirectX
            | AddressingMode::IndirectY
            | AddressingMode::Relative
            | AddressingMode::RawByte => 1,
            AddressingMode::Absolute
            | AddressingMode::AbsoluteX
            | AddressingMode::AbsoluteY
            | AddressingMode::Indirect
            | AddressingMode::RawWord => 2,
        }
    }
}

/// Looks up the opcode byte for a (mnemonic, mode) pair. Returns `None` for
/// combinations this system never emits (e.g. `Jmp` in `Relative` mode) —
/// callers treat that as an internal invariant violation.
pub fn opcode_byte(m: Mnemonic, mode: AddressingMode) -> Option<u8> {
    use AddressingMode::*;
    use Mnemonic::*;
    Some(match (m, mode) {
        (Lda, Immediate) => 0xA9,
        (Lda, ZeroPage) => 0xA5,
        (Lda, ZeroPageX) => 0xB5,
        (Lda, Absolute) => 0xAD,
        (Lda, AbsoluteX) => 0xBD,
        (Lda, AbsoluteY) => 0xB9,
        (Lda, IndirectX) => 0xA1,
        (Lda, IndirectY) => 0xB1,

        (Ldx, Immediate) => 0xA2,
        (Ldx, ZeroPage) => 0xA6,
        (Ldx, Absolute) => 0xAE,
        (Ldx, AbsoluteY) => 0xBE,

        (Ldy, Immediate) => 0xA0,
        (Ldy, ZeroPage) => 0xA4,
        (Ldy, Absolute) => 0xAC,
        (Ldy, AbsoluteX) => 0xBC,

        (Sta, ZeroPage) => 0x85,
        (Sta, ZeroPageX) => 0x95,
        (Sta, Absolute) => 0x8D,
        (Sta, AbsoluteX) => 0x9D,
        (Sta, AbsoluteY) => 0x99,
        (Sta, IndirectX) => 0x81,
        (Sta, IndirectY) => 0x91,

        (Stx, ZeroPage) => 0x86,
        (Stx, Absolute) => 0x8E,
        (Sty, ZeroPage) => 0x84,
        (Sty, Absolute) => 0x8C,

        (Adc, Immediate) => 0x69,
        (Adc, ZeroPage) => 0x65,
        (Adc, Absolute) => 0x6D,
        (Adc, IndirectY) => 0x71,

        (Sbc, Immediate) => 0xE9,
        (Sbc, ZeroPage) => 0xE5,
        (Sbc, Absolute) => 0xED,

        (And, Immediate) => 0x29,
        (And, ZeroPage) => 0x25,
        (And, Absolute) => 0x2D,

        (Ora, Immediate) => 0x09,
        (Ora, ZeroPage) => 0x05,
        (Ora, Absolute) => 0x0D,

        (Eor, Immediate) => 0x49,
        (Eor, ZeroPage) => 0x45,
        (Eor, Absolute) => 0x4D,

        (Asl, Accumulator) => 0x0A,
        (Asl, ZeroPage) => 0x06,
        (Lsr, Accumulator) => 0x4A,
        (Lsr, ZeroPage) => 0x46,
        (Rol, Accumulator) => 0x2A,
        (Rol, ZeroPage) => 0x26,
        (Ror, Accumulator) => 0x6A,
        (Ror, ZeroPage) => 0x66,

        (Inc, ZeroPage) => 0xE6,
        (Inc, Absolute) => 0xEE,
        (Inx, Implied) => 0xE8,
        (Iny, Implied) => 0xC8,
        (Dec, ZeroPage) => 0xC6,
        (Dec, Absolute) => 0xCE,
        (Dex, Implied) => 0xCA,
        (Dey, Implied) => 0x88,

        (Cmp, Immediate) => 0xC9,
        (Cmp, ZeroPage) => 0xC5,
        (Cmp, Absolute) => 0xCD,
        (Cpx, Immediate) => 0xE0,
        (Cpx, ZeroPage) => 0xE4,
        (Cpy, Immediate) => 0xC0,
        (Cpy, ZeroPage) => 0xC4,
        (Bit, ZeroPage) => 0x24,
        (Bit, Absolute) => 0x2C,

        (Clc, Implied) => 0x18,
        (Sec, Implied) => 0x38,
        (Cld, Implied) => 0xD8,
        (Sei, Implied) => 0x78,
        (Cli, Implied) => 0x58,

        (Beq, Relative) => 0xF0,
        (Bne, Relative) => 0xD0,
        (Bcc, Relative) => 0x90,
        (Bcs, Relative) => 0xB0,
        (Bmi, Relative) => 0x30,
        (Bpl, Relative) => 0x10,
        (Bvc, Relative) => 0x50,
        (Bvs, Relative) => 0x70,

        (Jmp, Absolute) => 0x4C,
        (Jmp, Indirect) => 0x6C,
        (Jsr, Absolute) => 0x20,
        (Rts, Implied) => 0x60,
        (Rti, Implied) => 0x40,

        (Pha, Implied) => 0x48,
        (Pla, Implied) => 0x68,
        (Php, Implied) => 0x08,
        (Plp, Implied) => 0x28,

        (Tax, Implied) => 0xAA,
        (Txa, Implied) => 0x8A,
        (Tay, Implied) => 0xA8,
        (Tya, Implied) => 0x98,
        (Tsx, Implied) => 0xBA,
        (Txs, Implied) => 0x9A,

        (Nop, Implied) => 0xEA,
        (Brk, Implied) => 0x00,

        _ => return None,
    })
}
