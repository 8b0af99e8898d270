//! Binary encoding of bytecode.
//!
//! Each instruction is a one-byte opcode followed by its operands in
//! little-endian order; the operand layout is fixed per opcode (see `ops`).
//!
//! A serialized code blob is:
//! - Magic: "CDNC" (4 bytes)
//! - Version: u32 (little-endian)
//! - Instruction count: u32
//! - Instructions

use std::io::{self, Read, Write};

use thiserror::Error;

use super::function::FunctionId;
use super::ops::Op;
use super::types::TypeId;

/// Magic bytes for cadence bytecode blobs
pub const MAGIC: &[u8; 4] = b"CDNC";

/// Current bytecode format version
pub const VERSION: u32 = 1;

/// Error type for bytecode operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of bytecode")]
    UnexpectedEof,
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),
    #[error("{0} trailing bytes after the last instruction")]
    TrailingBytes(usize),
}

/// A fixed-width instruction operand.
pub trait Operand: Sized {
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(input: &mut &[u8]) -> Result<Self, BytecodeError>;
}

fn take<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], BytecodeError> {
    if input.len() < N {
        return Err(BytecodeError::UnexpectedEof);
    }
    let (head, rest) = input.split_at(N);
    *input = rest;
    let mut buf = [0u8; N];
    buf.copy_from_slice(head);
    Ok(buf)
}

macro_rules! le_operand {
    ($($ty:ty),*) => {
        $(
            impl Operand for $ty {
                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(input: &mut &[u8]) -> Result<Self, BytecodeError> {
                    Ok(<$ty>::from_le_bytes(take(input)?))
                }
            }
        )*
    };
}

le_operand!(u16, i16, u32, i32, u64, f32);

impl Operand for FunctionId {
    fn write_le(self, out: &mut Vec<u8>) {
        self.0.write_le(out)
    }

    fn read_le(input: &mut &[u8]) -> Result<Self, BytecodeError> {
        u32::read_le(input).map(FunctionId)
    }
}

impl Operand for TypeId {
    fn write_le(self, out: &mut Vec<u8>) {
        self.0.write_le(out)
    }

    fn read_le(input: &mut &[u8]) -> Result<Self, BytecodeError> {
        u32::read_le(input).map(TypeId)
    }
}

/// Encode instructions without a header.
pub fn encode_code(code: &[Op]) -> Vec<u8> {
    let mut out = Vec::with_capacity(code.len() * 4);
    for op in code {
        op.encode(&mut out);
    }
    out
}

/// Decode a headerless instruction stream; the whole input must be consumed.
pub fn decode_code(mut input: &[u8]) -> Result<Vec<Op>, BytecodeError> {
    let mut code = Vec::new();
    while !input.is_empty() {
        code.push(Op::decode(&mut input)?);
    }
    Ok(code)
}

/// Serialize code with the magic/version header.
pub fn serialize(code: &[Op]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + code.len() * 4);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(code.len() as u32).to_le_bytes());
    buf.extend_from_slice(&encode_code(code));
    buf
}

/// True if `data` starts with the blob magic.
pub fn is_blob(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Deserialize code produced by [`serialize`].
pub fn deserialize(data: &[u8]) -> Result<Vec<Op>, BytecodeError> {
    let mut cursor = io::Cursor::new(data);
    let code = read_code(&mut cursor)?;
    let rest = data.len() - cursor.position() as usize;
    if rest != 0 {
        return Err(BytecodeError::TrailingBytes(rest));
    }
    Ok(code)
}

/// Write a code blob to a writer
pub fn write_code<W: Write>(w: &mut W, code: &[Op]) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(code.len() as u32).to_le_bytes())?;
    w.write_all(&encode_code(code))
}

/// Read a code blob from a reader
pub fn read_code<R: Read>(r: &mut R) -> Result<Vec<Op>, BytecodeError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let count = read_u32(r)? as usize;
    let mut body = Vec::new();
    r.read_to_end(&mut body)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    let mut input = body.as_slice();
    let mut code = Vec::with_capacity(count);
    for _ in 0..count {
        code.push(Op::decode(&mut input)?);
    }
    if !input.is_empty() {
        return Err(BytecodeError::TrailingBytes(input.len()));
    }
    Ok(code)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BytecodeError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Op> {
        vec![
            Op::SetV4(1, 10),
            Op::SetV8(2, u64::MAX - 1),
            Op::AddIf(3, 3, 1.5),
            Op::Call(FunctionId(7)),
            Op::Alloc(TypeId(2), FunctionId(9)),
            Op::Jnz(-4),
            Op::Ret(2),
        ]
    }

    #[test]
    fn test_roundtrip() {
        let code = sample();
        let bytes = serialize(&code);
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(deserialize(&bytes).unwrap(), code);
    }

    #[test]
    fn test_headerless_stream() {
        let code = sample();
        assert_eq!(decode_code(&encode_code(&code)).unwrap(), code);
    }

    #[test]
    fn test_invalid_magic() {
        let data = b"XXXX\x01\x00\x00\x00\x00\x00\x00\x00";
        assert_eq!(deserialize(data), Err(BytecodeError::InvalidMagic));
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(deserialize(&data), Err(BytecodeError::UnsupportedVersion(99)));
    }

    #[test]
    fn test_truncated_operand() {
        let mut bytes = encode_code(&[Op::PshC8(42)]);
        bytes.pop();
        assert_eq!(decode_code(&bytes), Err(BytecodeError::UnexpectedEof));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = serialize(&[Op::Suspend]);
        bytes.push(0x00);
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::UnexpectedEof) | Err(BytecodeError::TrailingBytes(_))
        ));
    }
}
