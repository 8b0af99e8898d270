//! Static checks run on every function when a module is built.
//!
//! - Control flow: jump targets must be instruction indices
//! - Every variable operand must name an argument or reserved local
//! - Global, string, import, function and type operands must resolve
//! - Code must end in a terminator
//!
//! Stack depth is not tracked; the interpreter bounds-checks every access.

use thiserror::Error;

use super::engine::Engine;
use super::function::{FunctionDescriptor, FunctionId, FunctionKind};
use super::module::Module;
use super::ops::Op;
use super::types::TypeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{function}: script function has no code")]
    EmptyFunction { function: String },
    #[error("{function}: code does not end with a return or jump")]
    MissingReturn { function: String },
    #[error("{function}: imported function must not carry code")]
    ImportWithCode { function: String },
    #[error("{function}: stack requirement {needed} is below the local space {locals}")]
    InvalidStackSize {
        function: String,
        needed: u32,
        locals: u32,
    },
    #[error("{function}: invalid jump target at pc={pc}: target={target}")]
    InvalidJumpTarget {
        function: String,
        pc: usize,
        target: i64,
    },
    #[error("{function}: variable offset {offset} at pc={pc} is outside the frame")]
    InvalidVariable {
        function: String,
        pc: usize,
        offset: i16,
    },
    #[error("{function}: global index {index} at pc={pc} does not exist")]
    InvalidGlobal {
        function: String,
        pc: usize,
        index: u16,
    },
    #[error("{function}: string index {index} at pc={pc} does not exist")]
    InvalidString {
        function: String,
        pc: usize,
        index: u16,
    },
    #[error("{function}: {op} at pc={pc} targets unusable function {target:#x}")]
    InvalidCallTarget {
        function: String,
        pc: usize,
        op: &'static str,
        target: u32,
    },
    #[error("{function}: type {ty} at pc={pc} is not registered")]
    InvalidType { function: String, pc: usize, ty: u32 },
    #[error("{function}: object variable at offset {offset} is not a local")]
    InvalidObjectVariable { function: String, offset: i16 },
}

/// Checks functions against the module they belong to and the engine's
/// registries.
pub struct Verifier<'a> {
    engine: &'a Engine,
    module: &'a Module,
}

impl<'a> Verifier<'a> {
    pub fn new(engine: &'a Engine, module: &'a Module) -> Self {
        Self { engine, module }
    }

    fn function_kind(&self, id: FunctionId) -> Option<FunctionKind> {
        if let Some(f) = self.module.functions().find(|f| f.id == id) {
            return Some(f.kind);
        }
        self.engine.function(id).map(|f| f.kind)
    }

    fn type_exists(&self, ty: TypeId) -> bool {
        self.engine.object_type(ty).is_some()
    }

    pub fn verify(&self, func: &FunctionDescriptor) -> Result<(), VerifyError> {
        let name = || func.name.clone();
        match func.kind {
            FunctionKind::Imported if !func.code.is_empty() => {
                return Err(VerifyError::ImportWithCode { function: name() });
            }
            FunctionKind::Script => {}
            _ => return Ok(()),
        }

        let Some(last) = func.code.last() else {
            return Err(VerifyError::EmptyFunction { function: name() });
        };
        if !last.is_terminator() {
            return Err(VerifyError::MissingReturn { function: name() });
        }
        if func.stack_needed < func.variable_space {
            return Err(VerifyError::InvalidStackSize {
                function: name(),
                needed: func.stack_needed,
                locals: func.variable_space,
            });
        }

        let arg_words = func.arg_words() as i32;
        let locals = func.variable_space as i32;
        let in_frame = |offset: i16| {
            let offset = offset as i32;
            (1..=locals).contains(&offset) || (offset <= 0 && -offset < arg_words)
        };

        for var in &func.object_variables {
            if !(1..=locals).contains(&(var.offset as i32)) {
                return Err(VerifyError::InvalidObjectVariable {
                    function: name(),
                    offset: var.offset,
                });
            }
        }

        let len = func.code.len() as i64;
        for (pc, op) in func.code.iter().enumerate() {
            if let Some(offset) = op.jump_offset() {
                let target = pc as i64 + 1 + offset as i64;
                if !(0..len).contains(&target) {
                    return Err(VerifyError::InvalidJumpTarget {
                        function: name(),
                        pc,
                        target,
                    });
                }
            }

            for offset in op.variables() {
                if !in_frame(offset) {
                    return Err(VerifyError::InvalidVariable {
                        function: name(),
                        pc,
                        offset,
                    });
                }
            }

            match *op {
                Op::PshG4(g) | Op::Pga(g) | Op::CpyVtoG4(g, _) | Op::CpyGtoV4(_, g)
                | Op::SetG4(g, _) | Op::LdG(g) | Op::LdGRdR4(_, g) => {
                    if g as usize >= self.module.global_count() {
                        return Err(VerifyError::InvalidGlobal {
                            function: name(),
                            pc,
                            index: g,
                        });
                    }
                }
                Op::Str(index) => {
                    if index as usize >= self.module.string_count() {
                        return Err(VerifyError::InvalidString {
                            function: name(),
                            pc,
                            index,
                        });
                    }
                }
                Op::Call(target) => {
                    self.check_call(func, pc, op, target, |k| k == FunctionKind::Script)?
                }
                Op::CallSys(target) => {
                    self.check_call(func, pc, op, target, |k| k == FunctionKind::System)?
                }
                Op::CallIntf(target) => self.check_call(func, pc, op, target, |k| {
                    matches!(k, FunctionKind::Interface | FunctionKind::Virtual)
                })?,
                Op::CallBnd(target) => {
                    let ok = target
                        .import_index()
                        .is_some_and(|i| i < self.module.import_count());
                    if !ok {
                        return Err(VerifyError::InvalidCallTarget {
                            function: name(),
                            pc,
                            op: op.name(),
                            target: target.0,
                        });
                    }
                }
                Op::Alloc(ty, constructor) => {
                    self.check_type(func, pc, ty)?;
                    if constructor != FunctionId::NONE {
                        self.check_call(func, pc, op, constructor, |k| {
                            matches!(k, FunctionKind::Script | FunctionKind::System)
                        })?;
                    }
                }
                Op::Free(ty) | Op::RefCpy(ty) | Op::PshTypeId(ty) => self.check_type(func, pc, ty)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn check_call(
        &self,
        func: &FunctionDescriptor,
        pc: usize,
        op: &Op,
        target: FunctionId,
        accept: impl Fn(FunctionKind) -> bool,
    ) -> Result<(), VerifyError> {
        match self.function_kind(target) {
            Some(kind) if !target.is_imported() && accept(kind) => Ok(()),
            _ => Err(VerifyError::InvalidCallTarget {
                function: func.name.clone(),
                pc,
                op: op.name(),
                target: target.0,
            }),
        }
    }

    fn check_type(&self, func: &FunctionDescriptor, pc: usize, ty: TypeId) -> Result<(), VerifyError> {
        if self.type_exists(ty) {
            Ok(())
        } else {
            Err(VerifyError::InvalidType {
                function: func.name.clone(),
                pc,
                ty: ty.0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::vm::error::ModuleError;
    use crate::vm::function::FunctionBuilder;
    use crate::vm::types::DataType;

    fn build(code: Vec<Op>) -> Result<std::sync::Arc<Module>, ModuleError> {
        let engine = Engine::new(EngineConfig::default());
        let mut b = engine.module_builder("m");
        b.global("g", DataType::INT);
        b.function(
            FunctionBuilder::script("f")
                .param(DataType::INT)
                .locals(2)
                .code(code)
                .build(),
        );
        b.build()
    }

    fn verify_error(code: Vec<Op>) -> VerifyError {
        match build(code) {
            Err(ModuleError::Verify(e)) => e,
            other => panic!("expected verify error, got {:?}", other.map(|m| m.name().to_string())),
        }
    }

    #[test]
    fn test_valid_function() {
        assert!(build(vec![Op::CpyVtoV4(1, 0), Op::CpyGtoV4(2, 0), Op::Ret(1)]).is_ok());
    }

    #[test]
    fn test_empty_function() {
        assert!(matches!(verify_error(vec![]), VerifyError::EmptyFunction { .. }));
    }

    #[test]
    fn test_missing_return() {
        assert!(matches!(
            verify_error(vec![Op::SetV4(1, 0)]),
            VerifyError::MissingReturn { .. }
        ));
    }

    #[test]
    fn test_jump_out_of_range() {
        assert!(matches!(
            verify_error(vec![Op::Jz(5), Op::Ret(1)]),
            VerifyError::InvalidJumpTarget { pc: 0, target: 6, .. }
        ));
        assert!(matches!(
            verify_error(vec![Op::Jmp(-2), Op::Ret(1)]),
            VerifyError::InvalidJumpTarget { pc: 0, target: -1, .. }
        ));
    }

    #[test]
    fn test_variable_outside_frame() {
        assert!(matches!(
            verify_error(vec![Op::SetV4(3, 0), Op::Ret(1)]),
            VerifyError::InvalidVariable { offset: 3, .. }
        ));
        assert!(matches!(
            verify_error(vec![Op::PshV4(-1), Op::Ret(1)]),
            VerifyError::InvalidVariable { offset: -1, .. }
        ));
    }

    #[test]
    fn test_unknown_global_and_string() {
        assert!(matches!(
            verify_error(vec![Op::PshG4(1), Op::Ret(1)]),
            VerifyError::InvalidGlobal { index: 1, .. }
        ));
        assert!(matches!(
            verify_error(vec![Op::Str(0), Op::Ret(1)]),
            VerifyError::InvalidString { index: 0, .. }
        ));
    }

    #[test]
    fn test_bad_call_targets() {
        assert!(matches!(
            verify_error(vec![Op::Call(FunctionId(999)), Op::Ret(1)]),
            VerifyError::InvalidCallTarget { op: "Call", .. }
        ));
        assert!(matches!(
            verify_error(vec![Op::CallBnd(FunctionId::import(0)), Op::Ret(1)]),
            VerifyError::InvalidCallTarget { op: "CallBnd", .. }
        ));
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            verify_error(vec![Op::Free(TypeId(42)), Op::Ret(1)]),
            VerifyError::InvalidType { ty: 42, .. }
        ));
    }
}
