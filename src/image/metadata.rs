use serde::Deserialize;

/// On-disk contract the IL-producing front end (out of scope for this
/// system, spec §1) emits: metadata tables, method bodies, the user-string
/// heap, and field-RVA byte blobs — exactly the four data sections spec §6
/// says the reader needs out of a full PE/CLI image (SPEC_FULL §2).
#[derive(Debug, Deserialize)]
pub struct ProgramImage {
    pub methods: Vec<MethodImage>,
    /// User-string heap; `Ldstr` tokens index into this.
    #[serde(default)]
    pub strings: Vec<String>,
    /// Field-RVA byte blobs (embedded byte arrays); `Ldtoken` tokens index
    /// into this.
    #[serde(default)]
    pub byte_arrays: Vec<Vec<u8>>,
    /// User-defined value types in the global namespace.
    #[serde(default)]
    pub structs: Vec<StructImage>,
}

#[derive(Debug, Deserialize)]
pub struct MethodImage {
    pub name: String,
    pub param_count: u8,
    pub returns_value: bool,
    pub linkage: LinkageImage,
    /// Raw IL byte stream. Empty for externals.
    #[serde(default)]
    pub il: Vec<u8>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkageImage {
    InternalUser,
    BuiltinRuntime,
    ExternalAssembly,
    IntrinsicGenerator,
}

#[derive(Debug, Deserialize)]
pub struct StructImage {
    pub name: String,
    pub fields: Vec<FieldImage>,
}

#[derive(Debug, Deserialize)]
pub struct FieldImage {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

/// Value-type element kinds the struct-layout decoder recognizes (spec §3
/// "Struct layout"). Anything else is out-of-dialect.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Byte,
    SByte,
    Bool,
    Short,
    UShort,
    Int,
    UInt,
}

impl FieldType {
    pub fn size_bytes(self) -> u16 {
        match self {
            FieldType::Byte | FieldType::SByte | FieldType::Bool => 1,
            FieldType::Short | FieldType::UShort => 2,
            FieldType::Int | FieldType::UInt => 4,
        }
    }
}
