//! The bytecode interpreter.
//!
//! Runs the current function of a [`Context`] one instruction at a time.
//! The program counter is advanced before an instruction executes, so a
//! fault reports the line of `pc - 1` and a call saves `pc` as its return
//! address.

use std::sync::Arc;

use super::address::Address;
use super::context::{Context, ContextState};
use super::error::RuntimeFault;
use super::function::{FunctionDescriptor, FunctionId, FunctionKind};
use super::heap::{ObjectRef, handle_bits};
use super::ops::Op;
use super::stack::StackPtr;
use super::types::TypeId;

/// What the loop does after an instruction.
enum Flow {
    Continue,
    /// The current function changed (call or return).
    Switch,
    /// Stop the loop; the state says why.
    Yield,
}

type Step = Result<Flow, RuntimeFault>;

fn tri<T: PartialOrd>(a: T, b: T) -> u64 {
    let r: i32 = if a == b {
        0
    } else if a < b {
        -1
    } else {
        1
    };
    r as u32 as u64
}

impl Context {
    /// Executes instructions while the context is active.
    pub(super) fn run(&mut self) {
        let Some(mut function) = self.function.clone() else {
            self.state = ContextState::Finished;
            return;
        };
        while self.state == ContextState::Active {
            let Some(&op) = function.code.get(self.pc) else {
                self.pc = self.pc.saturating_add(1);
                self.raise(RuntimeFault::UnrecognizedBytecode);
                break;
            };
            self.pc += 1;
            match self.step(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Switch) => {
                    if let Some(current) = &self.function {
                        function = Arc::clone(current);
                    }
                }
                Ok(Flow::Yield) => break,
                Err(fault) => {
                    self.raise(fault);
                    break;
                }
            }
        }
    }

    // ========================================
    // Frame and stack access
    // ========================================

    fn var(&self, offset: i16) -> Result<StackPtr, RuntimeFault> {
        self.fp
            .offset_by(-(offset as i64))
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn get4(&self, offset: i16) -> Result<u32, RuntimeFault> {
        self.stack
            .read(self.var(offset)?)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn set4(&mut self, offset: i16, value: u32) -> Result<(), RuntimeFault> {
        let ptr = self.var(offset)?;
        self.stack
            .write(ptr, value)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn get8(&self, offset: i16) -> Result<u64, RuntimeFault> {
        self.stack
            .read_u64(self.var(offset)?)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn set8(&mut self, offset: i16, value: u64) -> Result<(), RuntimeFault> {
        let ptr = self.var(offset)?;
        self.stack
            .write_u64(ptr, value)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn slot(&self, words: u32) -> Result<StackPtr, RuntimeFault> {
        self.sp
            .offset_by(words as i64)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn move_sp(&mut self, words: i64) -> Result<(), RuntimeFault> {
        self.sp = self.sp.offset_by(words).ok_or(RuntimeFault::StackOverflow)?;
        Ok(())
    }

    fn push4(&mut self, value: u32) -> Result<(), RuntimeFault> {
        self.move_sp(-1)?;
        self.stack
            .write(self.sp, value)
            .ok_or(RuntimeFault::StackOverflow)
    }

    fn push8(&mut self, value: u64) -> Result<(), RuntimeFault> {
        self.move_sp(-2)?;
        self.stack
            .write_u64(self.sp, value)
            .ok_or(RuntimeFault::StackOverflow)
    }

    fn peek4(&self, words: u32) -> Result<u32, RuntimeFault> {
        self.stack
            .read(self.slot(words)?)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn peek8(&self, words: u32) -> Result<u64, RuntimeFault> {
        self.stack
            .read_u64(self.slot(words)?)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn poke8(&mut self, words: u32, value: u64) -> Result<(), RuntimeFault> {
        let ptr = self.slot(words)?;
        self.stack
            .write_u64(ptr, value)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn pop8(&mut self) -> Result<u64, RuntimeFault> {
        let value = self.peek8(0)?;
        self.move_sp(2)?;
        Ok(value)
    }

    fn pop_address(&mut self) -> Result<Address, RuntimeFault> {
        Address::from_bits(self.pop8()?).ok_or(RuntimeFault::NullPointerAccess)
    }

    fn register_address(&self) -> Result<Address, RuntimeFault> {
        Address::from_bits(self.register).ok_or(RuntimeFault::NullPointerAccess)
    }

    fn reg32(&self) -> i32 {
        self.register as u32 as i32
    }

    /// Moves `pc` by `offset`. The target must lie inside the current code.
    fn jump(&mut self, offset: i32) -> Result<(), RuntimeFault> {
        let len = self.function.as_ref().map_or(0, |f| f.code.len());
        match self.pc.checked_add_signed(offset as isize) {
            Some(target) if target < len => {
                self.pc = target;
                Ok(())
            }
            _ => Err(RuntimeFault::UnrecognizedBytecode),
        }
    }

    /// Module word offset of global `index`.
    fn global_offset(&self, index: u16) -> Result<u32, RuntimeFault> {
        self.module
            .as_ref()
            .and_then(|m| m.global(index as usize))
            .map(|g| g.offset)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn global_address(&self, index: u16) -> Result<Address, RuntimeFault> {
        let module = self.module.as_ref().ok_or(RuntimeFault::UnrecognizedBytecode)?;
        module
            .global_address(index as usize)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn read_global(&self, index: u16) -> Result<u32, RuntimeFault> {
        let offset = self.global_offset(index)?;
        self.module
            .as_ref()
            .and_then(|m| m.read_global_word(offset))
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn write_global(&mut self, index: u16, value: u32) -> Result<(), RuntimeFault> {
        let offset = self.global_offset(index)?;
        self.module
            .as_ref()
            .and_then(|m| m.write_global_word(offset, value))
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn unary4(&mut self, var: i16, f: impl FnOnce(u32) -> u32) -> Step {
        let value = self.get4(var)?;
        self.set4(var, f(value))?;
        Ok(Flow::Continue)
    }

    fn unary8(&mut self, var: i16, f: impl FnOnce(u64) -> u64) -> Step {
        let value = self.get8(var)?;
        self.set8(var, f(value))?;
        Ok(Flow::Continue)
    }

    fn binary4(
        &mut self,
        dst: i16,
        a: i16,
        b: i16,
        f: impl FnOnce(u32, u32) -> Result<u32, RuntimeFault>,
    ) -> Step {
        let value = f(self.get4(a)?, self.get4(b)?)?;
        self.set4(dst, value)?;
        Ok(Flow::Continue)
    }

    fn binary8(
        &mut self,
        dst: i16,
        a: i16,
        b: i16,
        f: impl FnOnce(u64, u64) -> Result<u64, RuntimeFault>,
    ) -> Step {
        let value = f(self.get8(a)?, self.get8(b)?)?;
        self.set8(dst, value)?;
        Ok(Flow::Continue)
    }

    /// 64-bit shift: 64-bit value in `a`, dword shift count in `b`.
    fn shift8(&mut self, dst: i16, a: i16, b: i16, f: impl FnOnce(u64, u32) -> u64) -> Step {
        let value = f(self.get8(a)?, self.get4(b)?);
        self.set8(dst, value)?;
        Ok(Flow::Continue)
    }

    fn convert4(&mut self, dst: i16, src: i16, f: impl FnOnce(u32) -> u32) -> Step {
        let value = f(self.get4(src)?);
        self.set4(dst, value)?;
        Ok(Flow::Continue)
    }

    fn convert4to8(&mut self, dst: i16, src: i16, f: impl FnOnce(u32) -> u64) -> Step {
        let value = f(self.get4(src)?);
        self.set8(dst, value)?;
        Ok(Flow::Continue)
    }

    fn convert8to4(&mut self, dst: i16, src: i16, f: impl FnOnce(u64) -> u32) -> Step {
        let value = f(self.get8(src)?);
        self.set4(dst, value)?;
        Ok(Flow::Continue)
    }

    fn convert8(&mut self, dst: i16, src: i16, f: impl FnOnce(u64) -> u64) -> Step {
        let value = f(self.get8(src)?);
        self.set8(dst, value)?;
        Ok(Flow::Continue)
    }

    fn compare(&mut self, result: u64) -> Step {
        self.register = result;
        Ok(Flow::Continue)
    }

    fn test(&mut self, condition: bool) -> Step {
        self.register = condition as u64;
        Ok(Flow::Continue)
    }

    fn branch(&mut self, condition: bool, offset: i32) -> Step {
        if condition {
            self.jump(offset)?;
        }
        Ok(Flow::Continue)
    }

    /// Yields after a system call if an interrupt was requested.
    fn after_system_call(&mut self) -> Step {
        if self.interrupt_requested() {
            self.state = ContextState::Suspended;
            return Ok(Flow::Yield);
        }
        Ok(Flow::Continue)
    }

    fn function_by_id(&self, id: FunctionId) -> Result<Arc<FunctionDescriptor>, RuntimeFault> {
        self.engine
            .function(id)
            .ok_or(RuntimeFault::UnrecognizedBytecode)
    }

    fn call_system(&mut self, function: &Arc<FunctionDescriptor>) -> Step {
        let popped = self.call_system_function(function, None)?;
        self.move_sp(popped as i64)?;
        self.after_system_call()
    }

    fn load_handle(&self, address: Address) -> Result<Option<ObjectRef>, RuntimeFault> {
        Ok(ObjectRef::from_bits(self.load_qword(address)?))
    }

    // ========================================
    // Dispatch
    // ========================================

    fn step(&mut self, op: Op) -> Step {
        use Op::*;
        match op {
            // Stack manipulation
            Pop(n) => {
                self.move_sp(n as i64)?;
                Ok(Flow::Continue)
            }
            Push(n) => {
                self.move_sp(-(n as i64))?;
                self.stack
                    .zero(self.sp, n as u32)
                    .ok_or(RuntimeFault::StackOverflow)?;
                Ok(Flow::Continue)
            }
            PshC4(v) => {
                self.push4(v)?;
                Ok(Flow::Continue)
            }
            PshC8(v) => {
                self.push8(v)?;
                Ok(Flow::Continue)
            }
            PshV4(var) => {
                let v = self.get4(var)?;
                self.push4(v)?;
                Ok(Flow::Continue)
            }
            PshV8(var) => {
                let v = self.get8(var)?;
                self.push8(v)?;
                Ok(Flow::Continue)
            }
            Psf(var) => {
                let address = Address::Stack(self.var(var)?);
                self.push8(address.to_bits())?;
                Ok(Flow::Continue)
            }
            PshNull => {
                self.push8(0)?;
                Ok(Flow::Continue)
            }
            PshG4(g) => {
                let v = self.read_global(g)?;
                self.push4(v)?;
                Ok(Flow::Continue)
            }
            Pga(g) => {
                let address = self.global_address(g)?;
                self.push8(address.to_bits())?;
                Ok(Flow::Continue)
            }
            Str(index) => {
                let module = self.module.as_ref().ok_or(RuntimeFault::UnrecognizedBytecode)?;
                let len = module
                    .constant_string(index as usize)
                    .ok_or(RuntimeFault::UnrecognizedBytecode)?
                    .len() as u32;
                let address = Address::Str {
                    module: module.id(),
                    index: index as u32,
                };
                self.push8(address.to_bits())?;
                self.push4(len)?;
                Ok(Flow::Continue)
            }
            Var(var) => {
                self.push8(var as i64 as u64)?;
                Ok(Flow::Continue)
            }
            Swap4 => {
                let a = self.peek4(0)?;
                let b = self.peek4(1)?;
                let (top, below) = (self.sp, self.slot(1)?);
                self.stack
                    .write(top, b)
                    .and_then(|_| self.stack.write(below, a))
                    .ok_or(RuntimeFault::UnrecognizedBytecode)?;
                Ok(Flow::Continue)
            }
            Swap8 => {
                let a = self.peek8(0)?;
                let b = self.peek8(2)?;
                self.poke8(0, b)?;
                self.poke8(2, a)?;
                Ok(Flow::Continue)
            }
            Copy(words) => {
                let dst = self.pop_address()?;
                let src = Address::from_bits(self.peek8(0)?).ok_or(RuntimeFault::NullPointerAccess)?;
                if dst.is_null() || src.is_null() {
                    return Err(RuntimeFault::NullPointerAccess);
                }
                for i in 0..words as u32 {
                    let from = src.add_words(i).ok_or(RuntimeFault::NullPointerAccess)?;
                    let to = dst.add_words(i).ok_or(RuntimeFault::NullPointerAccess)?;
                    let value = self.load_word(from)?;
                    self.store_word(to, value)?;
                }
                self.poke8(0, dst.to_bits())?;
                Ok(Flow::Continue)
            }
            Rds4 => {
                let address = self.pop_address()?;
                let value = self.load_word(address)?;
                self.push4(value)?;
                Ok(Flow::Continue)
            }
            Rds8 => {
                let address = self.pop_address()?;
                let value = self.load_qword(address)?;
                self.push8(value)?;
                Ok(Flow::Continue)
            }
            PopRPtr => {
                self.register = self.pop8()?;
                Ok(Flow::Continue)
            }
            PshRPtr => {
                self.push8(self.register)?;
                Ok(Flow::Continue)
            }
            AddSi(offset) => {
                let object = ObjectRef::from_bits(self.peek8(0)?).ok_or(RuntimeFault::NullPointerAccess)?;
                let offset = u32::try_from(offset).map_err(|_| RuntimeFault::UnrecognizedBytecode)?;
                self.poke8(0, Address::field(object, offset).to_bits())?;
                Ok(Flow::Continue)
            }
            PshTypeId(ty) => {
                self.push4(ty.0)?;
                Ok(Flow::Continue)
            }

            // Variables, registers and globals
            SetV4(var, v) => {
                self.set4(var, v)?;
                Ok(Flow::Continue)
            }
            SetV8(var, v) => {
                self.set8(var, v)?;
                Ok(Flow::Continue)
            }
            CpyVtoV4(dst, src) => {
                let v = self.get4(src)?;
                self.set4(dst, v)?;
                Ok(Flow::Continue)
            }
            CpyVtoV8(dst, src) => {
                let v = self.get8(src)?;
                self.set8(dst, v)?;
                Ok(Flow::Continue)
            }
            CpyVtoR4(var) => {
                self.register = self.get4(var)? as u64;
                Ok(Flow::Continue)
            }
            CpyVtoR8(var) => {
                self.register = self.get8(var)?;
                Ok(Flow::Continue)
            }
            CpyRtoV4(var) => {
                self.set4(var, self.register as u32)?;
                Ok(Flow::Continue)
            }
            CpyRtoV8(var) => {
                self.set8(var, self.register)?;
                Ok(Flow::Continue)
            }
            CpyVtoG4(g, var) => {
                let v = self.get4(var)?;
                self.write_global(g, v)?;
                Ok(Flow::Continue)
            }
            CpyGtoV4(var, g) => {
                let v = self.read_global(g)?;
                self.set4(var, v)?;
                Ok(Flow::Continue)
            }
            SetG4(g, v) => {
                self.write_global(g, v)?;
                Ok(Flow::Continue)
            }
            LdG(g) => {
                self.register = self.global_address(g)?.to_bits();
                Ok(Flow::Continue)
            }
            LdV(var) => {
                self.register = Address::Stack(self.var(var)?).to_bits();
                Ok(Flow::Continue)
            }
            LdGRdR4(var, g) => {
                self.register = self.global_address(g)?.to_bits();
                let v = self.read_global(g)?;
                self.set4(var, v)?;
                Ok(Flow::Continue)
            }
            WrtV1(var) => self.write_partial(var, 0xff),
            WrtV2(var) => self.write_partial(var, 0xffff),
            WrtV4(var) => self.write_partial(var, u32::MAX),
            WrtV8(var) => {
                let address = self.register_address()?;
                let v = self.get8(var)?;
                self.store_qword(address, v)?;
                Ok(Flow::Continue)
            }
            RdR1(var) => self.read_partial(var, 0xff),
            RdR2(var) => self.read_partial(var, 0xffff),
            RdR4(var) => self.read_partial(var, u32::MAX),
            RdR8(var) => {
                let address = self.register_address()?;
                let v = self.load_qword(address)?;
                self.set8(var, v)?;
                Ok(Flow::Continue)
            }
            ClrHi => {
                self.register &= 0xff;
                Ok(Flow::Continue)
            }
            GetRef(offset) => {
                let var = self.peek8(offset as u32)? as i64 as i16;
                let address = Address::Stack(self.var(var)?);
                self.poke8(offset as u32, address.to_bits())?;
                Ok(Flow::Continue)
            }
            GetObj(offset) => {
                let var = self.peek8(offset as u32)? as i64 as i16;
                let handle = self.get8(var)?;
                self.poke8(offset as u32, handle)?;
                self.set8(var, 0)?;
                Ok(Flow::Continue)
            }
            GetObjRef(offset) => {
                let var = self.peek8(offset as u32)? as i64 as i16;
                let handle = self.get8(var)?;
                self.poke8(offset as u32, handle)?;
                Ok(Flow::Continue)
            }

            // Control flow
            Jmp(off) => {
                self.jump(off)?;
                Ok(Flow::Continue)
            }
            Jz(off) => self.branch(self.reg32() == 0, off),
            Jnz(off) => self.branch(self.reg32() != 0, off),
            Js(off) => self.branch(self.reg32() < 0, off),
            Jns(off) => self.branch(self.reg32() >= 0, off),
            Jp(off) => self.branch(self.reg32() > 0, off),
            Jnp(off) => self.branch(self.reg32() <= 0, off),
            JmpP(var) => {
                let index = self.get4(var)? as i32;
                self.jump(index)?;
                Ok(Flow::Continue)
            }
            Call(id) => {
                let callee = self.function_by_id(id)?;
                self.call_script_function(callee)?;
                Ok(Flow::Switch)
            }
            CallSys(id) => {
                let function = self.function_by_id(id)?;
                self.call_system(&function)
            }
            CallBnd(id) => {
                let target = id
                    .import_index()
                    .and_then(|index| self.module.as_ref()?.import(index)?.binding())
                    .ok_or(RuntimeFault::UnboundFunction)?;
                let callee = self
                    .engine
                    .function(target)
                    .ok_or(RuntimeFault::UnboundFunction)?;
                self.call_script_function(callee)?;
                Ok(Flow::Switch)
            }
            CallIntf(id) => {
                let declared = self.function_by_id(id)?;
                let object = ObjectRef::from_bits(self.peek8(0)?).ok_or(RuntimeFault::NullPointerAccess)?;
                let real = self
                    .resolve_method(&declared, object)
                    .ok_or(RuntimeFault::NullPointerAccess)?;
                if real.kind == FunctionKind::System {
                    return self.call_system(&real);
                }
                self.call_script_function(real)?;
                Ok(Flow::Switch)
            }
            Ret(words) => {
                if self.return_from_function(words as u32)? {
                    Ok(Flow::Switch)
                } else {
                    self.state = ContextState::Finished;
                    Ok(Flow::Yield)
                }
            }
            Suspend => {
                self.invoke_line_callback();
                if self.interrupt_requested() {
                    self.state = ContextState::Suspended;
                    return Ok(Flow::Yield);
                }
                Ok(Flow::Continue)
            }

            // Register tests
            Tz => self.test(self.reg32() == 0),
            Tnz => self.test(self.reg32() != 0),
            Ts => self.test(self.reg32() < 0),
            Tns => self.test(self.reg32() >= 0),
            Tp => self.test(self.reg32() > 0),
            Tnp => self.test(self.reg32() <= 0),
            Not(var) => self.unary4(var, |v| (v == 0) as u32),

            // int32
            NegI(var) => self.unary4(var, |v| (v as i32).wrapping_neg() as u32),
            IncVi(var) => self.unary4(var, |v| v.wrapping_add(1)),
            DecVi(var) => self.unary4(var, |v| v.wrapping_sub(1)),
            AddI(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x.wrapping_add(y))),
            SubI(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x.wrapping_sub(y))),
            MulI(d, a, b) => self.binary4(d, a, b, |x, y| Ok((x as i32).wrapping_mul(y as i32) as u32)),
            DivI(d, a, b) => self.binary4(d, a, b, |x, y| {
                if y == 0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((x as i32).wrapping_div(y as i32) as u32)
            }),
            ModI(d, a, b) => self.binary4(d, a, b, |x, y| {
                if y == 0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((x as i32).wrapping_rem(y as i32) as u32)
            }),
            AddIi(d, a, imm) => self.convert4(d, a, |x| (x as i32).wrapping_add(imm) as u32),
            SubIi(d, a, imm) => self.convert4(d, a, |x| (x as i32).wrapping_sub(imm) as u32),
            MulIi(d, a, imm) => self.convert4(d, a, |x| (x as i32).wrapping_mul(imm) as u32),

            // float
            NegF(var) => self.unary4(var, |v| (-f32::from_bits(v)).to_bits()),
            AddF(d, a, b) => self.binary4(d, a, b, |x, y| Ok((f32::from_bits(x) + f32::from_bits(y)).to_bits())),
            SubF(d, a, b) => self.binary4(d, a, b, |x, y| Ok((f32::from_bits(x) - f32::from_bits(y)).to_bits())),
            MulF(d, a, b) => self.binary4(d, a, b, |x, y| Ok((f32::from_bits(x) * f32::from_bits(y)).to_bits())),
            DivF(d, a, b) => self.binary4(d, a, b, |x, y| {
                let divisor = f32::from_bits(y);
                if divisor == 0.0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((f32::from_bits(x) / divisor).to_bits())
            }),
            ModF(d, a, b) => self.binary4(d, a, b, |x, y| {
                let divisor = f32::from_bits(y);
                if divisor == 0.0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((f32::from_bits(x) % divisor).to_bits())
            }),
            AddIf(d, a, imm) => self.convert4(d, a, |x| (f32::from_bits(x) + imm).to_bits()),
            SubIf(d, a, imm) => self.convert4(d, a, |x| (f32::from_bits(x) - imm).to_bits()),
            MulIf(d, a, imm) => self.convert4(d, a, |x| (f32::from_bits(x) * imm).to_bits()),

            // double
            NegD(var) => self.unary8(var, |v| (-f64::from_bits(v)).to_bits()),
            AddD(d, a, b) => self.binary8(d, a, b, |x, y| Ok((f64::from_bits(x) + f64::from_bits(y)).to_bits())),
            SubD(d, a, b) => self.binary8(d, a, b, |x, y| Ok((f64::from_bits(x) - f64::from_bits(y)).to_bits())),
            MulD(d, a, b) => self.binary8(d, a, b, |x, y| Ok((f64::from_bits(x) * f64::from_bits(y)).to_bits())),
            DivD(d, a, b) => self.binary8(d, a, b, |x, y| {
                let divisor = f64::from_bits(y);
                if divisor == 0.0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((f64::from_bits(x) / divisor).to_bits())
            }),
            ModD(d, a, b) => self.binary8(d, a, b, |x, y| {
                let divisor = f64::from_bits(y);
                if divisor == 0.0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((f64::from_bits(x) % divisor).to_bits())
            }),

            // int64
            NegI64(var) => self.unary8(var, |v| (v as i64).wrapping_neg() as u64),
            AddI64(d, a, b) => self.binary8(d, a, b, |x, y| Ok(x.wrapping_add(y))),
            SubI64(d, a, b) => self.binary8(d, a, b, |x, y| Ok(x.wrapping_sub(y))),
            MulI64(d, a, b) => self.binary8(d, a, b, |x, y| Ok((x as i64).wrapping_mul(y as i64) as u64)),
            DivI64(d, a, b) => self.binary8(d, a, b, |x, y| {
                if y == 0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((x as i64).wrapping_div(y as i64) as u64)
            }),
            ModI64(d, a, b) => self.binary8(d, a, b, |x, y| {
                if y == 0 {
                    return Err(RuntimeFault::DivideByZero);
                }
                Ok((x as i64).wrapping_rem(y as i64) as u64)
            }),

            // Bitwise
            BNot(var) => self.unary4(var, |v| !v),
            BAnd(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x & y)),
            BOr(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x | y)),
            BXor(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x ^ y)),
            BSll(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x.wrapping_shl(y))),
            BSrl(d, a, b) => self.binary4(d, a, b, |x, y| Ok(x.wrapping_shr(y))),
            BSra(d, a, b) => self.binary4(d, a, b, |x, y| Ok((x as i32).wrapping_shr(y) as u32)),
            BNot64(var) => self.unary8(var, |v| !v),
            BAnd64(d, a, b) => self.binary8(d, a, b, |x, y| Ok(x & y)),
            BOr64(d, a, b) => self.binary8(d, a, b, |x, y| Ok(x | y)),
            BXor64(d, a, b) => self.binary8(d, a, b, |x, y| Ok(x ^ y)),
            BSll64(d, a, b) => self.shift8(d, a, b, |x, n| x.wrapping_shl(n)),
            BSrl64(d, a, b) => self.shift8(d, a, b, |x, n| x.wrapping_shr(n)),
            BSra64(d, a, b) => self.shift8(d, a, b, |x, n| (x as i64).wrapping_shr(n) as u64),

            // Comparisons
            CmpI(a, b) => self.compare(tri(self.get4(a)? as i32, self.get4(b)? as i32)),
            CmpU(a, b) => self.compare(tri(self.get4(a)?, self.get4(b)?)),
            CmpF(a, b) => self.compare(tri(f32::from_bits(self.get4(a)?), f32::from_bits(self.get4(b)?))),
            CmpD(a, b) => self.compare(tri(f64::from_bits(self.get8(a)?), f64::from_bits(self.get8(b)?))),
            CmpI64(a, b) => self.compare(tri(self.get8(a)? as i64, self.get8(b)? as i64)),
            CmpU64(a, b) => self.compare(tri(self.get8(a)?, self.get8(b)?)),
            CmpIi(a, imm) => self.compare(tri(self.get4(a)? as i32, imm)),
            CmpIu(a, imm) => self.compare(tri(self.get4(a)?, imm)),
            CmpIf(a, imm) => self.compare(tri(f32::from_bits(self.get4(a)?), imm)),

            // Conversions
            ItoF(d, s) => self.convert4(d, s, |v| (v as i32 as f32).to_bits()),
            FtoI(d, s) => self.convert4(d, s, |v| f32::from_bits(v) as i32 as u32),
            UtoF(d, s) => self.convert4(d, s, |v| (v as f32).to_bits()),
            FtoU(d, s) => self.convert4(d, s, |v| f32::from_bits(v) as i32 as u32),
            SbtoI(d, s) => self.convert4(d, s, |v| v as u8 as i8 as i32 as u32),
            SwtoI(d, s) => self.convert4(d, s, |v| v as u16 as i16 as i32 as u32),
            UbtoI(d, s) => self.convert4(d, s, |v| v & 0xff),
            UwtoI(d, s) => self.convert4(d, s, |v| v & 0xffff),
            ItoB(d, s) => self.convert4(d, s, |v| v & 0xff),
            ItoW(d, s) => self.convert4(d, s, |v| v & 0xffff),
            DtoI(d, s) => self.convert8to4(d, s, |v| f64::from_bits(v) as i32 as u32),
            DtoU(d, s) => self.convert8to4(d, s, |v| f64::from_bits(v) as i64 as u32),
            DtoF(d, s) => self.convert8to4(d, s, |v| (f64::from_bits(v) as f32).to_bits()),
            ItoD(d, s) => self.convert4to8(d, s, |v| (v as i32 as f64).to_bits()),
            UtoD(d, s) => self.convert4to8(d, s, |v| (v as f64).to_bits()),
            FtoD(d, s) => self.convert4to8(d, s, |v| (f32::from_bits(v) as f64).to_bits()),
            I64toI(d, s) => self.convert8to4(d, s, |v| v as u32),
            ItoI64(d, s) => self.convert4to8(d, s, |v| v as i32 as i64 as u64),
            UtoI64(d, s) => self.convert4to8(d, s, |v| v as u64),
            FtoI64(d, s) => self.convert4to8(d, s, |v| f32::from_bits(v) as i64 as u64),
            DtoI64(d, s) => self.convert8(d, s, |v| f64::from_bits(v) as i64 as u64),
            FtoU64(d, s) => self.convert4to8(d, s, |v| f32::from_bits(v) as i64 as u64),
            DtoU64(d, s) => self.convert8(d, s, |v| f64::from_bits(v) as i64 as u64),
            I64toF(d, s) => self.convert8to4(d, s, |v| (v as i64 as f32).to_bits()),
            U64toF(d, s) => self.convert8to4(d, s, |v| (v as f32).to_bits()),
            I64toD(d, s) => self.convert8(d, s, |v| (v as i64 as f64).to_bits()),
            U64toD(d, s) => self.convert8(d, s, |v| (v as f64).to_bits()),

            // Objects
            Alloc(ty, constructor) => self.alloc(ty, constructor),
            Free(_) => {
                let address = self.pop_address()?;
                if address.is_null() {
                    return Ok(Flow::Continue);
                }
                if let Some(object) = self.load_handle(address)? {
                    self.engine.heap().free(object);
                    self.store_qword(address, 0)?;
                }
                Ok(Flow::Continue)
            }
            LoadObj(var) => {
                self.object_register = ObjectRef::from_bits(self.get8(var)?);
                self.set8(var, 0)?;
                Ok(Flow::Continue)
            }
            StoreObj(var) => {
                let object = self.object_register.take();
                self.set8(var, handle_bits(object))?;
                Ok(Flow::Continue)
            }
            RefCpy(_) => {
                let dst = self.pop_address()?;
                let src = ObjectRef::from_bits(self.peek8(0)?);
                let old = self.load_handle(dst)?;
                {
                    let mut heap = self.engine.heap();
                    if let Some(old) = old {
                        heap.release(old);
                    }
                    if let Some(src) = src {
                        heap.add_ref(src);
                    }
                }
                self.store_qword(dst, handle_bits(src))?;
                Ok(Flow::Continue)
            }
            ChkRef => {
                if self.peek8(0)? == 0 {
                    return Err(RuntimeFault::NullPointerAccess);
                }
                Ok(Flow::Continue)
            }
            ChkRefS => {
                let address = Address::from_bits(self.peek8(0)?).ok_or(RuntimeFault::NullPointerAccess)?;
                if address.is_null() || self.load_qword(address)? == 0 {
                    return Err(RuntimeFault::NullPointerAccess);
                }
                Ok(Flow::Continue)
            }
            ChkNullV(var) => {
                if self.get8(var)? == 0 {
                    return Err(RuntimeFault::NullPointerAccess);
                }
                Ok(Flow::Continue)
            }
            ChkNullS(offset) => {
                if self.peek8(offset as u32)? == 0 {
                    return Err(RuntimeFault::NullPointerAccess);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn write_partial(&mut self, var: i16, mask: u32) -> Step {
        let address = self.register_address()?;
        let value = self.get4(var)? & mask;
        let merged = if mask == u32::MAX {
            value
        } else {
            (self.load_word(address)? & !mask) | value
        };
        self.store_word(address, merged)?;
        Ok(Flow::Continue)
    }

    fn read_partial(&mut self, var: i16, mask: u32) -> Step {
        let address = self.register_address()?;
        let value = self.load_word(address)? & mask;
        self.set4(var, value)?;
        Ok(Flow::Continue)
    }

    /// Allocates an object and runs its constructor.
    ///
    /// Script constructors are entered as ordinary calls with the new object
    /// as `this`; the receiving variable is written before the call and its
    /// address stays on the stack for the caller to pop. System constructors
    /// run immediately, after which the address is popped and written.
    fn alloc(&mut self, ty: TypeId, constructor: FunctionId) -> Step {
        let object_type = self
            .engine
            .object_type(ty)
            .ok_or(RuntimeFault::UnrecognizedBytecode)?;
        let object = self.engine.heap().alloc(&object_type);

        if constructor == FunctionId::NONE {
            let address = self.pop_address()?;
            self.store_handle_or_free(address, object)?;
            return Ok(Flow::Continue);
        }

        let ctor = self.function_by_id(constructor)?;
        let arg_words = ctor.signature.param_words();
        if ctor.kind == FunctionKind::Script {
            let address = Address::from_bits(self.peek8(arg_words)?).ok_or(RuntimeFault::NullPointerAccess)?;
            self.store_handle_or_free(address, object)?;
            self.push8(object.to_bits())?;
            self.call_script_function(ctor)?;
            return Ok(Flow::Switch);
        }

        match self.call_system_function(&ctor, Some(object)) {
            Ok(popped) => {
                self.move_sp(popped as i64)?;
                let address = self.pop_address()?;
                self.store_handle_or_free(address, object)?;
                self.after_system_call()
            }
            Err(fault) => {
                self.engine.heap().free(object);
                self.move_sp(arg_words as i64)?;
                if let Ok(address) = self.pop_address() {
                    let _ = self.store_qword(address, 0);
                }
                Err(fault)
            }
        }
    }

    fn store_handle_or_free(&mut self, address: Address, object: ObjectRef) -> Result<(), RuntimeFault> {
        if let Err(fault) = self.store_qword(address, object.to_bits()) {
            self.engine.heap().free(object);
            return Err(fault);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::vm::context::ExecutionOutcome;
    use crate::vm::engine::Engine;
    use crate::vm::function::FunctionBuilder;
    use crate::vm::types::DataType;

    /// Runs `code` as `int f()` with `locals` local words.
    fn run_int(code: Vec<Op>, locals: u32) -> (ExecutionOutcome, i32) {
        let engine = Engine::new(EngineConfig::default());
        let mut b = engine.module_builder("t");
        let f = b.function(
            FunctionBuilder::script("f")
                .returns(DataType::INT)
                .locals(locals)
                .code(code)
                .build(),
        );
        b.build().unwrap();
        let mut ctx = engine.create_context();
        ctx.prepare(f).unwrap();
        let outcome = ctx.execute().unwrap();
        (outcome, ctx.return_dword() as i32)
    }

    #[test]
    fn test_loop_sums_to_ten() {
        // i = 0; s = 0; while (i < 5) { s += i; i++ } return s
        let code = vec![
            Op::SetV4(1, 0),
            Op::SetV4(2, 0),
            Op::CmpIi(1, 5),
            Op::Jns(3),
            Op::AddI(2, 2, 1),
            Op::IncVi(1),
            Op::Jmp(-5),
            Op::CpyVtoR4(2),
            Op::Ret(0),
        ];
        assert_eq!(run_int(code, 2), (ExecutionOutcome::Finished, 10));
    }

    #[test]
    fn test_integer_overflow_wraps() {
        let code = vec![
            Op::SetV4(1, i32::MIN as u32),
            Op::SetV4(2, -1i32 as u32),
            Op::DivI(1, 1, 2),
            Op::CpyVtoR4(1),
            Op::Ret(0),
        ];
        assert_eq!(run_int(code, 2), (ExecutionOutcome::Finished, i32::MIN));
    }

    /// Runs `code` as `void f()` with line `pc + 1` on every instruction and
    /// returns the fault and its line.
    fn run_fault(code: Vec<Op>, locals: u32) -> (Option<RuntimeFault>, Option<u32>) {
        let engine = Engine::new(EngineConfig::default());
        let mut b = engine.module_builder("t");
        let mut builder = FunctionBuilder::script("f").locals(locals);
        for pc in 0..code.len() {
            builder = builder.line(pc, pc as u32 + 1);
        }
        let f = b.function(builder.code(code).build());
        b.build().unwrap();
        let mut ctx = engine.create_context();
        ctx.prepare(f).unwrap();
        assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
        (ctx.exception_info().map(|e| e.fault.clone()), ctx.exception_line())
    }

    #[test]
    fn test_modulo_by_zero() {
        let code = vec![
            Op::SetV4(1, 7),
            Op::SetV4(2, 0),
            Op::ModI(1, 1, 2),
            Op::Ret(0),
        ];
        assert_eq!(run_fault(code, 2), (Some(RuntimeFault::DivideByZero), Some(3)));
    }

    #[test]
    fn test_float_division_by_zero() {
        let code = vec![
            Op::SetV4(1, 1.0f32.to_bits()),
            Op::SetV4(2, 0.0f32.to_bits()),
            Op::DivF(1, 1, 2),
            Op::Ret(0),
        ];
        assert_eq!(run_fault(code, 2), (Some(RuntimeFault::DivideByZero), Some(3)));
    }

    #[test]
    fn test_int64_division_by_zero() {
        let code = vec![
            Op::SetV8(2, 10),
            Op::SetV8(4, 0),
            Op::DivI64(2, 2, 4),
            Op::Ret(0),
        ];
        assert_eq!(run_fault(code, 4), (Some(RuntimeFault::DivideByZero), Some(3)));
    }

    #[test]
    fn test_double_division_by_zero() {
        let code = vec![
            Op::SetV8(2, 2.5f64.to_bits()),
            Op::SetV8(4, 0.0f64.to_bits()),
            Op::DivD(2, 2, 4),
            Op::Ret(0),
        ];
        assert_eq!(run_fault(code, 4), (Some(RuntimeFault::DivideByZero), Some(3)));
    }

    #[test]
    fn test_computed_jump_out_of_range() {
        // Verified code can still compute a target outside the function.
        for target in [-3i32, 5] {
            let code = vec![Op::SetV4(1, target as u32), Op::JmpP(1), Op::Ret(0)];
            assert_eq!(
                run_fault(code, 1),
                (Some(RuntimeFault::UnrecognizedBytecode), Some(2))
            );
        }
    }

    #[test]
    fn test_comparisons_and_tests() {
        let code = vec![
            Op::SetV4(1, -3i32 as u32),
            Op::SetV4(2, 2),
            Op::CmpI(1, 2),
            Op::Ts,
            Op::CpyRtoV4(1),
            Op::CmpU(1, 2),
            Op::Tp,
            Op::CpyRtoV4(2),
            Op::AddI(1, 1, 2),
            Op::CpyVtoR4(1),
            Op::Ret(0),
        ];
        // -3 < 2 stores 1, then 1 > 2 stores 0
        assert_eq!(run_int(code, 2), (ExecutionOutcome::Finished, 1));
    }

    #[test]
    fn test_conversions() {
        let code = vec![
            Op::SetV4(1, (-2.75f32).to_bits()),
            Op::FtoI(2, 1),
            Op::ItoD(4, 2),
            Op::DtoI(1, 4),
            Op::SbtoI(2, 1),
            Op::CpyVtoR4(2),
            Op::Ret(0),
        ];
        assert_eq!(run_int(code, 4), (ExecutionOutcome::Finished, -2));
    }

    #[test]
    fn test_swap_reorders_top_words() {
        // PopRPtr takes the top word as the low half of the register.
        let code = vec![
            Op::SetV4(1, 5),
            Op::Psf(1),
            Op::Rds4,
            Op::PshC4(7),
            Op::Swap4,
            Op::PopRPtr,
            Op::Ret(0),
        ];
        assert_eq!(run_int(code, 1), (ExecutionOutcome::Finished, 5));
    }

    #[test]
    fn test_register_addressing() {
        let code = vec![
            Op::SetV4(1, 0x1234_5678),
            Op::LdV(2),
            Op::WrtV4(1),
            Op::SetV4(1, 0xab),
            Op::WrtV1(1),
            Op::RdR4(1),
            Op::CpyVtoR4(1),
            Op::Ret(0),
        ];
        assert_eq!(run_int(code, 2), (ExecutionOutcome::Finished, 0x1234_56ab));
    }

    #[test]
    fn test_jump_past_end_is_unrecognized() {
        let engine = Engine::new(EngineConfig {
            verify_bytecode: false,
            ..EngineConfig::default()
        });
        let mut b = engine.module_builder("t");
        let f = b.function(FunctionBuilder::script("f").code(vec![Op::Jmp(10)]).build());
        b.build().unwrap();
        let mut ctx = engine.create_context();
        ctx.prepare(f).unwrap();
        assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Exception));
        assert_eq!(
            ctx.exception_info().map(|e| &e.fault),
            Some(&RuntimeFault::UnrecognizedBytecode)
        );
    }
}
