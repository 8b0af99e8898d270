//! Instruction set of the cadence VM.
//!
//! Every instruction is a one-byte opcode tag followed by a fixed list of
//! little-endian operands. Variable operands (`i16`) are frame offsets: the
//! slot lives at `fp - offset`, so arguments have offsets `<= 0` and locals
//! have offsets `>= 1`. Jump operands are relative to the next instruction
//! and counted in instructions.
//!
//! Stack slots are 32-bit words. Pointers, handles and 64-bit values take two
//! words, low word first.

use serde::{Deserialize, Serialize};

use super::bytecode::{BytecodeError, Operand};
use super::function::FunctionId;
use super::types::TypeId;

/// Declares the `Op` enum together with its name table and binary codec, so
/// the operand layout of each opcode is written down exactly once.
macro_rules! instructions {
    (
        $(
            $(#[$meta:meta])*
            $name:ident $(( $($arg:ident : $ty:ty),+ ))? = $code:literal,
        )*
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
        pub enum Op {
            $(
                $(#[$meta])*
                $name $(( $($ty),+ ))?,
            )*
        }

        impl Op {
            /// Returns the mnemonic of this instruction.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Op::$name { .. } => stringify!($name), )*
                }
            }

            /// Returns the one-byte opcode tag.
            pub fn opcode(&self) -> u8 {
                match self {
                    $( Op::$name { .. } => $code, )*
                }
            }

            /// Appends the binary form of this instruction to `out`.
            pub fn encode(&self, out: &mut Vec<u8>) {
                match *self {
                    $(
                        Op::$name $(( $($arg),+ ))? => {
                            out.push($code);
                            $( $( $arg.write_le(out); )+ )?
                        }
                    )*
                }
            }

            /// Decodes one instruction from the front of `input`, advancing it.
            pub fn decode(input: &mut &[u8]) -> Result<Op, BytecodeError> {
                let (&tag, rest) = input.split_first().ok_or(BytecodeError::UnexpectedEof)?;
                *input = rest;
                match tag {
                    $( $code => Ok(Op::$name $(( $( <$ty as Operand>::read_le(input)? ),+ ))?), )*
                    other => Err(BytecodeError::InvalidOpcode(other)),
                }
            }
        }
    };
}

instructions! {
    // ========================================
    // Stack manipulation
    // ========================================
    /// Discard N words.
    Pop(words: u16) = 0x00,
    /// Reserve N zeroed words.
    Push(words: u16) = 0x01,
    PshC4(value: u32) = 0x02,
    PshC8(value: u64) = 0x03,
    PshV4(var: i16) = 0x04,
    PshV8(var: i16) = 0x05,
    /// Push the address of a frame variable.
    Psf(var: i16) = 0x06,
    PshNull = 0x07,
    /// Push the dword value of a global.
    PshG4(global: u16) = 0x08,
    /// Push the address of a global.
    Pga(global: u16) = 0x09,
    /// Push a constant string address, then its length.
    Str(index: u16) = 0x0a,
    /// Push a frame offset as a pointer placeholder, later patched by
    /// `GetRef`/`GetObj`/`GetObjRef`.
    Var(var: i16) = 0x0b,
    Swap4 = 0x0c,
    Swap8 = 0x0d,
    /// Pop a destination pointer and copy N words from the source pointer
    /// below it; the source pointer is replaced by the destination.
    Copy(words: u16) = 0x0e,
    /// Replace the pointer on top of the stack with the dword it points to.
    Rds4 = 0x0f,
    /// Replace the pointer on top of the stack with the qword it points to.
    Rds8 = 0x10,
    PopRPtr = 0x11,
    PshRPtr = 0x12,
    /// Turn the object handle on top of the stack into the address of one of
    /// its fields.
    AddSi(offset: i32) = 0x13,
    /// Push a type id.
    PshTypeId(id: TypeId) = 0x14,

    // ========================================
    // Variables, registers and globals
    // ========================================
    SetV4(var: i16, value: u32) = 0x20,
    SetV8(var: i16, value: u64) = 0x21,
    CpyVtoV4(dst: i16, src: i16) = 0x22,
    CpyVtoV8(dst: i16, src: i16) = 0x23,
    CpyVtoR4(var: i16) = 0x24,
    CpyVtoR8(var: i16) = 0x25,
    CpyRtoV4(var: i16) = 0x26,
    CpyRtoV8(var: i16) = 0x27,
    CpyVtoG4(global: u16, var: i16) = 0x28,
    CpyGtoV4(var: i16, global: u16) = 0x29,
    SetG4(global: u16, value: u32) = 0x2a,
    /// Load the address of a global into the register.
    LdG(global: u16) = 0x2b,
    /// Load the address of a frame variable into the register.
    LdV(var: i16) = 0x2c,
    /// Load the address of a global into the register and its dword value
    /// into a variable.
    LdGRdR4(var: i16, global: u16) = 0x2d,
    /// Write the low byte of a variable to the address in the register.
    WrtV1(var: i16) = 0x2e,
    WrtV2(var: i16) = 0x2f,
    WrtV4(var: i16) = 0x30,
    WrtV8(var: i16) = 0x31,
    /// Read a byte from the address in the register into a variable.
    RdR1(var: i16) = 0x32,
    RdR2(var: i16) = 0x33,
    RdR4(var: i16) = 0x34,
    RdR8(var: i16) = 0x35,
    /// Clear everything but the low byte of the register.
    ClrHi = 0x36,
    /// Patch a `Var` placeholder N words above the top into the address of
    /// that variable.
    GetRef(offset: u16) = 0x37,
    /// Patch a `Var` placeholder into the handle stored in that variable and
    /// clear the variable, moving ownership onto the stack.
    GetObj(offset: u16) = 0x38,
    /// Patch a `Var` placeholder into the handle stored in that variable.
    GetObjRef(offset: u16) = 0x39,

    // ========================================
    // Control flow
    // ========================================
    Jmp(offset: i32) = 0x40,
    Jz(offset: i32) = 0x41,
    Jnz(offset: i32) = 0x42,
    Js(offset: i32) = 0x43,
    Jns(offset: i32) = 0x44,
    Jp(offset: i32) = 0x45,
    Jnp(offset: i32) = 0x46,
    /// Jump into a table of `Jmp` instructions by the index in a variable.
    JmpP(var: i16) = 0x47,
    Call(function: FunctionId) = 0x48,
    CallSys(function: FunctionId) = 0x49,
    /// Call through an import binding of the current module.
    CallBnd(function: FunctionId) = 0x4a,
    /// Call a virtual or interface method on the object on top of the stack.
    CallIntf(function: FunctionId) = 0x4b,
    /// Return, discarding N argument words pushed by the caller.
    Ret(words: u16) = 0x4c,
    /// Yield point for suspension and the line callback.
    Suspend = 0x4d,

    // ========================================
    // Register tests
    // ========================================
    Tz = 0x50,
    Tnz = 0x51,
    Ts = 0x52,
    Tns = 0x53,
    Tp = 0x54,
    Tnp = 0x55,
    Not(var: i16) = 0x56,

    // ========================================
    // int32 arithmetic
    // ========================================
    NegI(var: i16) = 0x60,
    IncVi(var: i16) = 0x61,
    DecVi(var: i16) = 0x62,
    AddI(dst: i16, a: i16, b: i16) = 0x63,
    SubI(dst: i16, a: i16, b: i16) = 0x64,
    MulI(dst: i16, a: i16, b: i16) = 0x65,
    DivI(dst: i16, a: i16, b: i16) = 0x66,
    ModI(dst: i16, a: i16, b: i16) = 0x67,
    AddIi(dst: i16, a: i16, imm: i32) = 0x68,
    SubIi(dst: i16, a: i16, imm: i32) = 0x69,
    MulIi(dst: i16, a: i16, imm: i32) = 0x6a,

    // ========================================
    // float arithmetic
    // ========================================
    NegF(var: i16) = 0x70,
    AddF(dst: i16, a: i16, b: i16) = 0x71,
    SubF(dst: i16, a: i16, b: i16) = 0x72,
    MulF(dst: i16, a: i16, b: i16) = 0x73,
    DivF(dst: i16, a: i16, b: i16) = 0x74,
    ModF(dst: i16, a: i16, b: i16) = 0x75,
    AddIf(dst: i16, a: i16, imm: f32) = 0x76,
    SubIf(dst: i16, a: i16, imm: f32) = 0x77,
    MulIf(dst: i16, a: i16, imm: f32) = 0x78,

    // ========================================
    // double arithmetic
    // ========================================
    NegD(var: i16) = 0x80,
    AddD(dst: i16, a: i16, b: i16) = 0x81,
    SubD(dst: i16, a: i16, b: i16) = 0x82,
    MulD(dst: i16, a: i16, b: i16) = 0x83,
    DivD(dst: i16, a: i16, b: i16) = 0x84,
    ModD(dst: i16, a: i16, b: i16) = 0x85,

    // ========================================
    // int64 arithmetic
    // ========================================
    NegI64(var: i16) = 0x90,
    AddI64(dst: i16, a: i16, b: i16) = 0x91,
    SubI64(dst: i16, a: i16, b: i16) = 0x92,
    MulI64(dst: i16, a: i16, b: i16) = 0x93,
    DivI64(dst: i16, a: i16, b: i16) = 0x94,
    ModI64(dst: i16, a: i16, b: i16) = 0x95,

    // ========================================
    // Bitwise
    // ========================================
    BNot(var: i16) = 0xa0,
    BAnd(dst: i16, a: i16, b: i16) = 0xa1,
    BOr(dst: i16, a: i16, b: i16) = 0xa2,
    BXor(dst: i16, a: i16, b: i16) = 0xa3,
    BSll(dst: i16, a: i16, b: i16) = 0xa4,
    BSrl(dst: i16, a: i16, b: i16) = 0xa5,
    BSra(dst: i16, a: i16, b: i16) = 0xa6,
    BNot64(var: i16) = 0xa7,
    BAnd64(dst: i16, a: i16, b: i16) = 0xa8,
    BOr64(dst: i16, a: i16, b: i16) = 0xa9,
    BXor64(dst: i16, a: i16, b: i16) = 0xaa,
    /// 64-bit shift by the dword in `b`.
    BSll64(dst: i16, a: i16, b: i16) = 0xab,
    BSrl64(dst: i16, a: i16, b: i16) = 0xac,
    BSra64(dst: i16, a: i16, b: i16) = 0xad,

    // ========================================
    // Comparison (result -1/0/1 in the register)
    // ========================================
    CmpI(a: i16, b: i16) = 0xb0,
    CmpU(a: i16, b: i16) = 0xb1,
    CmpF(a: i16, b: i16) = 0xb2,
    CmpD(a: i16, b: i16) = 0xb3,
    CmpI64(a: i16, b: i16) = 0xb4,
    CmpU64(a: i16, b: i16) = 0xb5,
    CmpIi(a: i16, imm: i32) = 0xb6,
    CmpIu(a: i16, imm: u32) = 0xb7,
    CmpIf(a: i16, imm: f32) = 0xb8,

    // ========================================
    // Conversions (dst, src)
    // ========================================
    ItoF(dst: i16, src: i16) = 0xc0,
    FtoI(dst: i16, src: i16) = 0xc1,
    UtoF(dst: i16, src: i16) = 0xc2,
    /// Converts through a signed int first.
    FtoU(dst: i16, src: i16) = 0xc3,
    SbtoI(dst: i16, src: i16) = 0xc4,
    SwtoI(dst: i16, src: i16) = 0xc5,
    UbtoI(dst: i16, src: i16) = 0xc6,
    UwtoI(dst: i16, src: i16) = 0xc7,
    ItoB(dst: i16, src: i16) = 0xc8,
    ItoW(dst: i16, src: i16) = 0xc9,
    DtoI(dst: i16, src: i16) = 0xca,
    DtoU(dst: i16, src: i16) = 0xcb,
    DtoF(dst: i16, src: i16) = 0xcc,
    ItoD(dst: i16, src: i16) = 0xcd,
    UtoD(dst: i16, src: i16) = 0xce,
    FtoD(dst: i16, src: i16) = 0xcf,
    I64toI(dst: i16, src: i16) = 0xd0,
    ItoI64(dst: i16, src: i16) = 0xd1,
    UtoI64(dst: i16, src: i16) = 0xd2,
    FtoI64(dst: i16, src: i16) = 0xd3,
    DtoI64(dst: i16, src: i16) = 0xd4,
    FtoU64(dst: i16, src: i16) = 0xd5,
    DtoU64(dst: i16, src: i16) = 0xd6,
    I64toF(dst: i16, src: i16) = 0xd7,
    U64toF(dst: i16, src: i16) = 0xd8,
    I64toD(dst: i16, src: i16) = 0xd9,
    U64toD(dst: i16, src: i16) = 0xda,

    // ========================================
    // Objects
    // ========================================
    /// Allocate an object and run its constructor. The address of the
    /// receiving variable sits below the constructor arguments.
    Alloc(ty: TypeId, constructor: FunctionId) = 0xe0,
    /// Pop a variable address and release or destroy the object it holds.
    Free(ty: TypeId) = 0xe1,
    /// Move the handle in a variable into the object register.
    LoadObj(var: i16) = 0xe2,
    /// Move the object register into a variable.
    StoreObj(var: i16) = 0xe3,
    /// Pop a destination address and assign the handle below it, releasing
    /// the old value and adding a reference to the new one.
    RefCpy(ty: TypeId) = 0xe4,
    ChkRef = 0xe5,
    /// Check that the pointer on top of the stack refers to a non-null handle.
    ChkRefS = 0xe6,
    ChkNullV(var: i16) = 0xe7,
    /// Check the pointer N words above the top of the stack.
    ChkNullS(offset: u16) = 0xe8,
}

impl Op {
    /// Relative jump operand, if this is a jump.
    pub fn jump_offset(&self) -> Option<i32> {
        match *self {
            Op::Jmp(o) | Op::Jz(o) | Op::Jnz(o) | Op::Js(o) | Op::Jns(o) | Op::Jp(o) | Op::Jnp(o) => {
                Some(o)
            }
            _ => None,
        }
    }

    /// True for instructions after which control never falls through.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Ret(_) | Op::Jmp(_) | Op::JmpP(_))
    }

    /// Collects every frame-variable operand of this instruction.
    pub fn variables(&self) -> Vec<i16> {
        use Op::*;
        match *self {
            PshV4(v) | PshV8(v) | Psf(v) | Var(v) | SetV4(v, _) | SetV8(v, _) | CpyVtoR4(v)
            | CpyVtoR8(v) | CpyRtoV4(v) | CpyRtoV8(v) | CpyVtoG4(_, v) | CpyGtoV4(v, _) | LdV(v)
            | LdGRdR4(v, _) | WrtV1(v) | WrtV2(v) | WrtV4(v) | WrtV8(v) | RdR1(v) | RdR2(v)
            | RdR4(v) | RdR8(v) | JmpP(v) | Not(v) | NegI(v) | IncVi(v) | DecVi(v) | NegF(v)
            | NegD(v) | NegI64(v) | BNot(v) | BNot64(v) | LoadObj(v) | StoreObj(v)
            | ChkNullV(v) | CmpIi(v, _) | CmpIu(v, _) | CmpIf(v, _) => vec![v],
            CpyVtoV4(d, s) | CpyVtoV8(d, s) | CmpI(d, s) | CmpU(d, s) | CmpF(d, s) | CmpD(d, s)
            | CmpI64(d, s) | CmpU64(d, s) | AddIi(d, s, _) | SubIi(d, s, _) | MulIi(d, s, _)
            | AddIf(d, s, _) | SubIf(d, s, _) | MulIf(d, s, _) => vec![d, s],
            ItoF(d, s) | FtoI(d, s) | UtoF(d, s) | FtoU(d, s) | SbtoI(d, s) | SwtoI(d, s)
            | UbtoI(d, s) | UwtoI(d, s) | ItoB(d, s) | ItoW(d, s) | DtoI(d, s) | DtoU(d, s)
            | DtoF(d, s) | ItoD(d, s) | UtoD(d, s) | FtoD(d, s) | I64toI(d, s) | ItoI64(d, s)
            | UtoI64(d, s) | FtoI64(d, s) | DtoI64(d, s) | FtoU64(d, s) | DtoU64(d, s)
            | I64toF(d, s) | U64toF(d, s) | I64toD(d, s) | U64toD(d, s) => vec![d, s],
            AddI(d, a, b) | SubI(d, a, b) | MulI(d, a, b) | DivI(d, a, b) | ModI(d, a, b)
            | AddF(d, a, b) | SubF(d, a, b) | MulF(d, a, b) | DivF(d, a, b) | ModF(d, a, b)
            | AddD(d, a, b) | SubD(d, a, b) | MulD(d, a, b) | DivD(d, a, b) | ModD(d, a, b)
            | AddI64(d, a, b) | SubI64(d, a, b) | MulI64(d, a, b) | DivI64(d, a, b)
            | ModI64(d, a, b) | BAnd(d, a, b) | BOr(d, a, b) | BXor(d, a, b) | BSll(d, a, b)
            | BSrl(d, a, b) | BSra(d, a, b) | BAnd64(d, a, b) | BOr64(d, a, b)
            | BXor64(d, a, b) | BSll64(d, a, b) | BSrl64(d, a, b) | BSra64(d, a, b) => {
                vec![d, a, b]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_opcodes() {
        assert_eq!(Op::AddI(1, 2, 3).name(), "AddI");
        assert_eq!(Op::Suspend.name(), "Suspend");
        assert_eq!(Op::Pop(2).opcode(), 0x00);
        assert_eq!(Op::ChkNullS(0).opcode(), 0xe8);
    }

    #[test]
    fn test_encode_layout() {
        let mut out = Vec::new();
        Op::SetV4(-2, 0xdead_beef).encode(&mut out);
        assert_eq!(out, vec![0x20, 0xfe, 0xff, 0xef, 0xbe, 0xad, 0xde]);

        out.clear();
        Op::Tz.encode(&mut out);
        assert_eq!(out, vec![0x50]);
    }

    #[test]
    fn test_decode_advances_input() {
        let mut out = Vec::new();
        Op::Jmp(-3).encode(&mut out);
        Op::Ret(4).encode(&mut out);
        let mut input = out.as_slice();
        assert_eq!(Op::decode(&mut input).unwrap(), Op::Jmp(-3));
        assert_eq!(Op::decode(&mut input).unwrap(), Op::Ret(4));
        assert!(input.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut input: &[u8] = &[0xff];
        assert_eq!(Op::decode(&mut input), Err(BytecodeError::InvalidOpcode(0xff)));
    }

    #[test]
    fn test_variables() {
        assert_eq!(Op::DivI(1, 0, -1).variables(), vec![1, 0, -1]);
        assert_eq!(Op::CpyVtoR4(3).variables(), vec![3]);
        assert!(Op::Call(FunctionId(1)).variables().is_empty());
    }
}
