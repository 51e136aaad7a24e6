//! IL Reader (spec §4.1): decodes the program image into per-method decoded
//! IL, user-method metadata, external-method signatures, and the set of
//! built-in runtime routines the program actually calls.

pub mod decode;
pub mod metadata;

use std::collections::HashSet;

use crate::errors::CompileError;
pub use decode::{DecodedInsn, IlOp, decode_method, normalize_local_function_name};
pub use metadata::{FieldType, LinkageImage, ProgramImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    InternalUser,
    BuiltinRuntime,
    ExternalAssembly,
    IntrinsicGenerator,
}

impl From<LinkageImage> for Linkage {
    fn from(l: LinkageImage) -> Self {
        match l {
            LinkageImage::InternalUser => Linkage::InternalUser,
            LinkageImage::BuiltinRuntime => Linkage::BuiltinRuntime,
            LinkageImage::ExternalAssembly => Linkage::ExternalAssembly,
            LinkageImage::IntrinsicGenerator => Linkage::IntrinsicGenerator,
        }
    }
}

#[derive(Debug)]
pub struct MethodDescriptor {
    pub name: String,
    pub param_count: u8,
    pub returns_value: bool,
    pub linkage: Linkage,
    pub il: Vec<DecodedInsn>,
}

/// `(field-name, size-in-bytes)` pairs in declaration order; offsets are
/// the cumulative sum (spec §3 "Struct layout").
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<(String, u16)>,
}

impl StructLayout {
    pub fn total_size(&self) -> u16 {
        self.fields.iter().map(|(_, s)| *s).sum()
    }

    pub fn field_offset(&self, field: &str) -> Option<u16> {
        let mut offset = 0;
        for (name, size) in &self.fields {
            if name == field {
                return Some(offset);
            }
            offset += size;
        }
        None
    }
}

pub struct ReadResult {
    pub methods: Vec<MethodDescriptor>,
    pub structs: Vec<StructLayout>,
    /// Names of built-in runtime routines actually referenced by the
    /// program; drives conditional inclusion of optional runtime routines
    /// (spec §4.1, §4.3).
    pub used_builtins: HashSet<String>,
}

/// Reads every method out of `image`, decoding IL bodies and running the
/// struct-layout pre-pass (spec §4.1). `known_builtins` is the runtime
/// library's table of built-in routine names.
pub fn read_program(image: &ProgramImage, known_builtins: &HashSet<&str>) -> Result<ReadResult, CompileError> {
    let structs = image
        .structs
        .iter()
        .map(|s| StructLayout {
            name: s.name.clone(),
            fields: s.fields.iter().map(|f| (f.name.clone(), f.ty.size_bytes())).collect(),
        })
        .collect();

    let mut methods = Vec::with_capacity(image.methods.len());
    let mut used_builtins = HashSet::new();

    for m in &image.methods {
        let linkage: Linkage = m.linkage.into();
        let il = if matches!(linkage, Linkage::ExternalAssembly | Linkage::BuiltinRuntime) {
            Vec::new()
        } else {
            decode_method(image, &m.name, &m.il)?
        };

        for insn in &il {
            if let IlOp::Call(name) = &insn.opcode {
                if known_builtins.contains(name.as_str()) {
                    used_builtins.insert(name.clone());
                }
            }
        }

        methods.push(MethodDescriptor {
            name: normalize_local_function_name(&m.name),
            param_count: m.param_count,
            returns_value: m.returns_value,
            linkage,
            il,
        });
    }

    Ok(ReadResult { methods, structs, used_builtins })
}

/// Forward scan detecting every `conv.u2` immediately followed by a
/// `stloc`, recording the target local index (spec §4.1 "Word-local
/// pre-pass"). Those locals are allocated two bytes instead of one.
pub fn word_locals(il: &[DecodedInsn]) -> HashSet<u16> {
    let mut set = HashSet::new();
    for pair in il.windows(2) {
        if let (IlOp::ConvU2, IlOp::StLoc(n)) = (&pair[0].opcode, &pair[1].opcode) {
            set.insert(*n);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::decode::IlOp;

    #[test]
    fn word_local_prepass_finds_widened_stores() {
        let il = vec![
            DecodedInsn { opcode: IlOp::LdLoc(0), offset: 0 },
            DecodedInsn { opcode: IlOp::ConvU2, offset: 1 },
            DecodedInsn { opcode: IlOp::StLoc(3), offset: 2 },
        ];
        let set = word_locals(&il);
        assert!(set.contains(&3));
        assert_eq!(set.len(), 1);
    }
}
