/// An operand of an object-model instruction (spec §3 "Object-model
/// instruction", §4.2 "Operand encoding"). Which variant is legal depends on
/// the instruction's `AddressingMode`; the code generator is responsible for
/// pairing them correctly, the linker only resolves what it's given.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Immediate or zero-page byte, depending on addressing mode.
    Byte(u8),
    /// Full 16-bit absolute address, already known.
    Absolute(u16),
    /// Signed relative offset, already computed (rare — most relative
    /// branches go through `RelativeLabel` and are computed at resolution
    /// time).
    Relative(i8),
    /// Full-word address of a label, resolved at link time.
    Label(String),
    /// Low byte of a label's resolved address.
    LabelLow(String),
    /// High byte of a label's resolved address.
    LabelHigh(String),
    /// Relative branch to a label; resolved as `target - (here + 2)` and
    /// must fit in `i8`.
    RelativeLabel(String),
}
