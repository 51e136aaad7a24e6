use thiserror::Error;

/// The six error kinds a compilation can fail with (spec §7). All are hard
/// failures: no partial ROM is ever produced.
#[derive(Error, Debug, PartialEq, Clone)]
pub enum CompileError {
    #[error("Syntax error in assembly file: {0}")]
    AsmSyntax(#[from] pest::error::Error<crate::asmfile::Rule>),

    #[error("unsupported IL construct in `{method}` at offset {offset}: opcode {opcode} with {operand_kind} operand")]
    UnsupportedConstruct {
        method: String,
        offset: u32,
        opcode: String,
        operand_kind: String,
    },

    #[error("out-of-dialect source in `{method}`: {reason}")]
    OutOfDialect { method: String, reason: String },

    #[error("unresolved symbol `{name}`")]
    UnresolvedSymbol { name: String },

    #[error("branch at `{label}` out of range: target offset {offset} does not fit in [-128, 127]")]
    BranchOutOfRange { label: String, offset: i32 },

    #[error("malformed input: {reason}")]
    Malformed { reason: String },

    #[error("capacity overflow: {reason}")]
    Capacity { reason: String },
}
