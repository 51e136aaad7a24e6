use crate::errors::CompileError;
use crate::image::metadata::ProgramImage;

/// Decoded opcode set for the restricted stack-IL dialect this system
/// accepts (spec §3 "Decoded IL instruction", §4.1 "Decoding"). Byte values
/// are this system's own encoding of the IL stream, not a real CIL byte
/// table — the IL-producing front end that writes `MethodImage::il` targets
/// this table directly.
#[derive(Debug, Clone, PartialEq)]
pub enum IlOp {
    Nop,
    Pop,
    Dup,
    LdcI4(i32),
    LdLoc(u16),
    StLoc(u16),
    LdLoca(u16),
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Ceq,
    Cgt,
    Clt,
    Br(i32),
    BrFalse(i32),
    BrTrue(i32),
    Beq(i32),
    Bne(i32),
    Blt(i32),
    Ble(i32),
    Bgt(i32),
    Bge(i32),
    /// Resolved callee name (spec §4.1: token resolved through metadata).
    Call(String),
    Ret,
    Ldstr(String),
    /// Resolved byte-array label (`bytearray_N`) plus its content.
    Ldtoken(String, Vec<u8>),
    /// Resolved element size in bytes of the array being allocated.
    Newarr(u16),
    LdelemU1,
    StelemI1,
    /// Resolved struct type name.
    Ldelema(String),
    /// Resolved field name.
    Ldfld(String),
    Stfld(String),
    /// `conv.u1` — truncate the top of the (abstract) stack to 8 bits; used
    /// by the `x++`-style idiom detector (spec §4.4).
    ConvU1,
    /// `conv.u2` — widen to 16 bits; feeds the word-local pre-pass.
    ConvU2,
    /// Resolved relative branch offsets, one per case, in declaration order.
    Switch(Vec<i32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInsn {
    pub opcode: IlOp,
    pub offset: u32,
}

const EXT_LEAD: u8 = 0xFE;

const OP_NOP: u8 = 0x00;
const OP_POP: u8 = 0x01;
const OP_DUP: u8 = 0x02;
const OP_LDC_I4: u8 = 0x03;
const OP_LDLOC: u8 = 0x05;
const OP_LDLOC_S: u8 = 0x06;
const OP_STLOC: u8 = 0x07;
const OP_STLOC_S: u8 = 0x08;
const OP_ADD: u8 = 0x09;
const OP_SUB: u8 = 0x0A;
const OP_MUL: u8 = 0x0B;
const OP_DIV: u8 = 0x0C;
const OP_REM: u8 = 0x0D;
const OP_SHL: u8 = 0x0E;
const OP_SHR: u8 = 0x0F;
const OP_AND: u8 = 0x10;
const OP_OR: u8 = 0x11;
const OP_XOR: u8 = 0x12;
const OP_NEG: u8 = 0x13;
const OP_NOT: u8 = 0x14;
const OP_CEQ: u8 = 0x15;
const OP_CGT: u8 = 0x16;
const OP_CLT: u8 = 0x17;

// Short-form branches: 1-byte signed relative offset. These nine share a
// contiguous range so the long form can reuse the low nibble as a suffix
// after the extended lead byte.
const OP_BR_S: u8 = 0x18;
const OP_BRFALSE_S: u8 = 0x19;
const OP_BRTRUE_S: u8 = 0x1A;
const OP_BEQ_S: u8 = 0x1B;
const OP_BNE_S: u8 = 0x1C;
const OP_BLT_S: u8 = 0x1D;
const OP_BLE_S: u8 = 0x1E;
const OP_BGT_S: u8 = 0x1F;
const OP_BGE_S: u8 = 0x20;

const OP_CALL: u8 = 0x21;
const OP_RET: u8 = 0x22;
const OP_LDSTR: u8 = 0x23;
const OP_LDTOKEN: u8 = 0x24;
const OP_NEWARR: u8 = 0x25;
const OP_LDELEM_U1: u8 = 0x26;
const OP_STELEM_I1: u8 = 0x27;
const OP_LDELEMA: u8 = 0x28;
const OP_LDLOCA: u8 = 0x29;
const OP_LDFLD: u8 = 0x2A;
const OP_STFLD: u8 = 0x2B;
const OP_CONV_U1: u8 = 0x2C;
const OP_CONV_U2: u8 = 0x2D;
const OP_SWITCH: u8 = 0x2E;

fn branch_ctor(suffix: u8) -> Option<fn(i32) -> IlOp> {
    // The long form's suffix byte is the short opcode shifted down to start
    // at zero, so the two tables stay in lockstep by construction.
    Some(match suffix + OP_BR_S {
        OP_BR_S => IlOp::Br,
        OP_BRFALSE_S => IlOp::BrFalse,
        OP_BRTRUE_S => IlOp::BrTrue,
        OP_BEQ_S => IlOp::Beq,
        OP_BNE_S => IlOp::Bne,
        OP_BLT_S => IlOp::Blt,
        OP_BLE_S => IlOp::Ble,
        OP_BGT_S => IlOp::Bgt,
        OP_BGE_S => IlOp::Bge,
        _ => return None,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    method: &'a str,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, CompileError> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| CompileError::Malformed {
            reason: format!("truncated IL stream in `{}`", self.method),
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, CompileError> {
        Ok(self.u8()? as i8)
    }

    fn u32(&mut self) -> Result<u32, CompileError> {
        let mut buf = [0u8; 4];
        for b in &mut buf {
            *b = self.u8()?;
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn i32(&mut self) -> Result<i32, CompileError> {
        Ok(self.u32()? as i32)
    }
}

/// Decodes one method's IL stream into the sequence of `DecodedInsn` the
/// code generator consumes. Streamed in principle (spec §3 lifecycle note);
/// materialized here to a `Vec` since the code generator needs look-ahead
/// for several peephole patterns (stelem rewrite, word-local pre-pass).
pub fn decode_method(image: &ProgramImage, method: &str, il: &[u8]) -> Result<Vec<DecodedInsn>, CompileError> {
    let mut cur = Cursor { bytes: il, pos: 0, method };
    let mut out = Vec::new();

    while cur.pos < cur.bytes.len() {
        let offset = cur.pos as u32;
        let lead = cur.u8()?;

        let opcode = if lead == EXT_LEAD {
            let suffix = cur.u8()?;
            let ctor = branch_ctor(suffix).ok_or_else(|| CompileError::UnsupportedConstruct {
                method: method.to_string(),
                offset,
                opcode: format!("ext 0x{suffix:02X}"),
                operand_kind: "unknown extended opcode".to_string(),
            })?;
            ctor(cur.i32()?)
        } else {
            decode_one(image, &mut cur, method, offset, lead)?
        };

        out.push(DecodedInsn { opcode, offset });
    }

    Ok(out)
}

fn decode_one(
    image: &ProgramImage,
    cur: &mut Cursor,
    method: &str,
    offset: u32,
    lead: u8,
) -> Result<IlOp, CompileError> {
    Ok(match lead {
        OP_NOP => IlOp::Nop,
        OP_POP => IlOp::Pop,
        OP_DUP => IlOp::Dup,
        OP_LDC_I4 => IlOp::LdcI4(cur.i32()?),
        OP_LDLOC => IlOp::LdLoc(cur.u32()? as u16),
        OP_LDLOC_S => IlOp::LdLoc(cur.u8()? as u16),
        OP_STLOC => IlOp::StLoc(cur.u32()? as u16),
        OP_STLOC_S => IlOp::StLoc(cur.u8()? as u16),
        OP_LDLOCA => IlOp::LdLoca(cur.u32()? as u16),
        OP_ADD => IlOp::Add,
        OP_SUB => IlOp::Sub,
        OP_MUL => IlOp::Mul,
        OP_DIV => IlOp::Div,
        OP_REM => IlOp::Rem,
        OP_SHL => IlOp::Shl,
        OP_SHR => IlOp::Shr,
        OP_AND => IlOp::And,
        OP_OR => IlOp::Or,
        OP_XOR => IlOp::Xor,
        OP_NEG => IlOp::Neg,
        OP_NOT => IlOp::Not,
        OP_CEQ => IlOp::Ceq,
        OP_CGT => IlOp::Cgt,
        OP_CLT => IlOp::Clt,
        OP_BR_S => IlOp::Br(cur.i8()? as i32),
        OP_BRFALSE_S => IlOp::BrFalse(cur.i8()? as i32),
        OP_BRTRUE_S => IlOp::BrTrue(cur.i8()? as i32),
        OP_BEQ_S => IlOp::Beq(cur.i8()? as i32),
        OP_BNE_S => IlOp::Bne(cur.i8()? as i32),
        OP_BLT_S => IlOp::Blt(cur.i8()? as i32),
        OP_BLE_S => IlOp::Ble(cur.i8()? as i32),
        OP_BGT_S => IlOp::Bgt(cur.i8()? as i32),
        OP_BGE_S => IlOp::Bge(cur.i8()? as i32),
        OP_CALL => {
            let token = cur.u32()? as usize;
            let callee = image.methods.get(token).ok_or_else(|| CompileError::UnresolvedSymbol {
                name: format!("method token {token}"),
            })?;
            IlOp::Call(normalize_local_function_name(&callee.name))
        }
        OP_RET => IlOp::Ret,
        OP_LDSTR => {
            let token = cur.u32()? as usize;
            let s = image.strings.get(token).ok_or_else(|| CompileError::UnresolvedSymbol {
                name: format!("string token {token}"),
            })?;
            IlOp::Ldstr(s.clone())
        }
        OP_LDTOKEN => {
            let token = cur.u32()? as usize;
            let bytes = image.byte_arrays.get(token).ok_or_else(|| CompileError::UnresolvedSymbol {
                name: format!("byte-array token {token}"),
            })?;
            IlOp::Ldtoken(format!("bytearray_{token}"), bytes.clone())
        }
        OP_NEWARR => {
            let token = cur.u32()? as usize;
            let size = element_size(image, method, offset, token)?;
            IlOp::Newarr(size)
        }
        OP_LDELEM_U1 => IlOp::LdelemU1,
        OP_STELEM_I1 => IlOp::StelemI1,
        OP_LDELEMA => {
            let token = cur.u32()? as usize;
            let s = image.structs.get(token).ok_or_else(|| CompileError::UnresolvedSymbol {
                name: format!("struct token {token}"),
            })?;
            IlOp::Ldelema(s.name.clone())
        }
        OP_LDFLD => IlOp::Ldfld(resolve_field_token(image, method, offset, cur.u32()?)?),
        OP_STFLD => IlOp::Stfld(resolve_field_token(image, method, offset, cur.u32()?)?),
        OP_CONV_U1 => IlOp::ConvU1,
        OP_CONV_U2 => IlOp::ConvU2,
        OP_SWITCH => {
            let count = cur.u32()? as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(cur.i32()?);
            }
            IlOp::Switch(targets)
        }
        other => {
            return Err(CompileError::UnsupportedConstruct {
                method: method.to_string(),
                offset,
                opcode: format!("0x{other:02X}"),
                operand_kind: "unrecognized opcode".to_string(),
            });
        }
    })
}

/// Field tokens pack a struct index and a field index: `(struct_idx << 8) |
/// field_idx`, matching the way the other token kinds are plain table
/// indices — this system's own encoding, since it owns both the struct
/// table and the convention (spec §4.1 says only that tokens resolve
/// "through the image's metadata tables").
fn resolve_field_token(image: &ProgramImage, method: &str, offset: u32, token: u32) -> Result<String, CompileError> {
    let struct_idx = (token >> 8) as usize;
    let field_idx = (token & 0xFF) as usize;
    let s = image.structs.get(struct_idx).ok_or_else(|| CompileError::UnresolvedSymbol {
        name: format!("struct token {struct_idx}"),
    })?;
    let f = s.fields.get(field_idx).ok_or_else(|| CompileError::UnresolvedSymbol {
        name: format!("field token {struct_idx}:{field_idx}"),
    })?;
    let _ = (method, offset);
    Ok(f.name.clone())
}

fn element_size(image: &ProgramImage, method: &str, offset: u32, token: usize) -> Result<u16, CompileError> {
    // Token 0 is reserved for the primitive byte element type (the only
    // element type `ldelem.u1`/`stelem.i1` operate on); any other token
    // names a struct element type.
    if token == 0 {
        return Ok(1);
    }
    let s = image.structs.get(token - 1).ok_or_else(|| CompileError::UnsupportedConstruct {
        method: method.to_string(),
        offset,
        opcode: "newarr".to_string(),
        operand_kind: format!("unknown element type token {token}"),
    })?;
    Ok(s.fields.iter().map(|f| f.ty.size_bytes()).sum())
}

/// Rewrites compiler-synthesized local-function names of the form
/// `<Outer>g__Name|0_0` to their user-facing `Name` (spec §4.1
/// "Local-function name normalization").
pub fn normalize_local_function_name(name: &str) -> String {
    if let Some(g) = name.find("g__") {
        let rest = &name[g + 3..];
        let end = rest.find('|').unwrap_or(rest.len());
        return rest[..end].to_string();
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_compiler_synthesized_names() {
        assert_eq!(normalize_local_function_name("<Main>g__Loop|0_1"), "Loop");
        assert_eq!(normalize_local_function_name("PlainMethod"), "PlainMethod");
    }

    #[test]
    fn decodes_constant_then_store() {
        let image = ProgramImage { methods: vec![], strings: vec![], byte_arrays: vec![], structs: vec![] };
        let il = [OP_LDC_I4, 0x02, 0x00, 0x00, 0x00, OP_STLOC_S, 0x01, OP_RET];
        let decoded = decode_method(&image, "Main", &il).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].opcode, IlOp::LdcI4(2));
        assert_eq!(decoded[1].opcode, IlOp::StLoc(1));
        assert_eq!(decoded[2].opcode, IlOp::Ret);
    }
}
