//! The 6502 object model: typed instructions, addressing modes, operands,
//! and the `Block`/`Program` containers the code generator, runtime
//! library, and assembly reader all emit into (spec §4.2).

pub mod block;
pub mod instruction;
pub mod mnemonic;
pub mod operand;
pub mod program;

pub use block::Block;
pub use instruction::Insn;
pub use mnemonic::{AddressingMode, Mnemonic};
pub use operand::Operand;
pub use program::{BASE_CODE_ADDRESS, Program};
