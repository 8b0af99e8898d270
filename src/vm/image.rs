//! JSON module images.
//!
//! An image is a self-contained description of one module that the CLI and
//! the C API can load. Operands that name functions, types and strings are
//! image-local and are remapped to engine ids on load:
//!
//! - `Call`/`CallIntf`: index into `functions`
//! - `CallSys`: index into `system_functions` (resolved by name)
//! - `CallBnd`: index into `imports`
//! - `Alloc` constructor: `0` for none, otherwise `functions[n - 1]`
//! - type operands: index into `types`
//! - `Str`: index into `strings`
//!
//! ```json
//! {
//!   "name": "main",
//!   "system_functions": ["print_int"],
//!   "functions": [
//!     { "name": "main", "returns": "int", "locals": 1,
//!       "code": [{ "SetV4": [1, 42] }, { "CpyVtoR4": 1 }, { "Ret": 0 }] }
//!   ]
//! }
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::engine::Engine;
use super::error::ModuleError;
use super::function::{FunctionBuilder, FunctionDescriptor, FunctionId, LineTable};
use super::module::Module;
use super::ops::Op;
use super::types::{DataType, ObjectType, Signature, TypeId};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),
    #[error("malformed image: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("unknown system function '{0}'")]
    UnknownSystemFunction(String),
    #[error("{what} index {index} is out of range")]
    BadIndex { what: &'static str, index: u32 },
    #[error(transparent)]
    Module(#[from] ModuleError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleImage {
    pub name: String,
    pub types: Vec<TypeImage>,
    pub strings: Vec<String>,
    pub globals: Vec<GlobalImage>,
    pub system_functions: Vec<String>,
    pub imports: Vec<ImportImage>,
    pub functions: Vec<FunctionImage>,
    pub initializer: Option<FunctionImage>,
}

/// An object type; reused if the engine already has one by that name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeImage {
    pub name: String,
    pub fields: u32,
    pub ref_counted: bool,
    pub script_object: bool,
    pub handle_fields: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalImage {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportImage {
    pub name: String,
    pub from: String,
    #[serde(default = "void")]
    pub returns: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableImage {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub offset: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectVariableImage {
    pub offset: i16,
    /// Index into the image's `types`.
    #[serde(rename = "type")]
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionImage {
    pub name: String,
    #[serde(default = "void")]
    pub returns: String,
    #[serde(default)]
    pub params: Vec<String>,
    /// Type name of `this` for methods.
    #[serde(default)]
    pub method_of: Option<String>,
    #[serde(default)]
    pub locals: u32,
    /// Overrides the computed stack requirement.
    #[serde(default)]
    pub stack: Option<u32>,
    pub code: Vec<Op>,
    /// `[instruction, line]` or `[instruction, line, column]` entries.
    #[serde(default)]
    pub lines: Vec<LineImage>,
    #[serde(default)]
    pub variables: Vec<VariableImage>,
    #[serde(default)]
    pub object_variables: Vec<ObjectVariableImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LineImage {
    Line(usize, u32),
    Position(usize, u32, u32),
}

impl LineImage {
    fn entry(self) -> (usize, u32, u32) {
        match self {
            LineImage::Line(pc, line) => (pc, line, 0),
            LineImage::Position(pc, line, column) => (pc, line, column),
        }
    }
}

fn void() -> String {
    "void".to_string()
}

impl ModuleImage {
    pub fn from_json(text: &str) -> Result<Self, ImageError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, ImageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Registers the image's types and builds it into a module of `engine`.
    pub fn build(&self, engine: &Arc<Engine>) -> Result<Arc<Module>, ImageError> {
        let mut loader = Loader {
            engine,
            types: Vec::with_capacity(self.types.len()),
            system: Vec::with_capacity(self.system_functions.len()),
            functions: Vec::with_capacity(self.functions.len()),
            strings: Vec::with_capacity(self.strings.len()),
            import_count: self.imports.len(),
        };

        for ty in &self.types {
            loader.types.push(loader.object_type(ty)?);
        }
        for name in &self.system_functions {
            let id = engine
                .system_function_by_name(name)
                .ok_or_else(|| ImageError::UnknownSystemFunction(name.clone()))?;
            loader.system.push(id);
        }

        let mut builder = engine.module_builder(self.name.clone());
        for s in &self.strings {
            loader.strings.push(builder.string(s));
        }
        for global in &self.globals {
            let ty = loader.parse(&global.ty)?;
            builder.global(global.name.clone(), ty);
        }
        for function in &self.functions {
            loader.functions.push(builder.declare(function.name.clone()));
        }
        for import in &self.imports {
            let signature = loader.signature(&import.returns, &import.params)?;
            builder.import(
                FunctionBuilder::import(import.name.clone(), import.from.clone())
                    .signature(signature)
                    .build(),
            );
        }
        for (function, &id) in self.functions.iter().zip(&loader.functions) {
            let desc = loader.function(function)?;
            builder.define(id, desc);
        }
        if let Some(init) = &self.initializer {
            let desc = loader.function(init)?;
            builder.initializer(desc);
        }

        let module = builder.build()?;
        debug!(module = %self.name, "image loaded");
        Ok(module)
    }
}

struct Loader<'a> {
    engine: &'a Arc<Engine>,
    types: Vec<TypeId>,
    system: Vec<FunctionId>,
    functions: Vec<FunctionId>,
    strings: Vec<u16>,
    import_count: usize,
}

fn lookup<T: Copy>(table: &[T], index: u32, what: &'static str) -> Result<T, ImageError> {
    table
        .get(index as usize)
        .copied()
        .ok_or(ImageError::BadIndex { what, index })
}

impl Loader<'_> {
    fn object_type(&self, image: &TypeImage) -> Result<TypeId, ImageError> {
        if let Some(id) = self.engine.type_by_name(&image.name) {
            return Ok(id);
        }
        let mut ty = ObjectType::new(image.name.clone()).fields(image.fields);
        if image.ref_counted {
            ty = ty.ref_counted();
        }
        if image.script_object {
            ty = ty.script_object();
        }
        for &offset in &image.handle_fields {
            ty = ty.handle_field(offset);
        }
        Ok(self.engine.register_object_type(ty)?)
    }

    fn parse(&self, decl: &str) -> Result<DataType, ImageError> {
        self.engine
            .parse_type(decl)
            .ok_or_else(|| ImageError::UnknownType(decl.to_string()))
    }

    fn signature(&self, returns: &str, params: &[String]) -> Result<Signature, ImageError> {
        let return_type = self.parse(returns)?;
        let params = params
            .iter()
            .map(|p| self.parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Signature::new(return_type, params))
    }

    fn function(&self, image: &FunctionImage) -> Result<FunctionDescriptor, ImageError> {
        let mut builder = FunctionBuilder::script(image.name.clone())
            .signature(self.signature(&image.returns, &image.params)?)
            .locals(image.locals)
            .lines(image.lines.iter().map(|l| l.entry()).collect::<LineTable>());
        if let Some(owner) = &image.method_of {
            let ty = self
                .engine
                .type_by_name(owner)
                .ok_or_else(|| ImageError::UnknownType(owner.clone()))?;
            builder = builder.method_of(ty);
        }
        if let Some(words) = image.stack {
            builder = builder.stack(words);
        }
        for var in &image.variables {
            builder = builder.variable(var.name.clone(), self.parse(&var.ty)?, var.offset);
        }
        for var in &image.object_variables {
            builder = builder.object_variable(var.offset, lookup(&self.types, var.ty, "type")?);
        }
        let code = image
            .code
            .iter()
            .map(|&op| self.remap(op))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(builder.code(code).build())
    }

    fn remap(&self, op: Op) -> Result<Op, ImageError> {
        let function = |id: FunctionId| lookup(&self.functions, id.0, "function");
        let ty = |id: TypeId| lookup(&self.types, id.0, "type");
        Ok(match op {
            Op::Call(id) => Op::Call(function(id)?),
            Op::CallIntf(id) => Op::CallIntf(function(id)?),
            Op::CallSys(id) => Op::CallSys(lookup(&self.system, id.0, "system function")?),
            Op::CallBnd(id) => {
                if id.0 as usize >= self.import_count {
                    return Err(ImageError::BadIndex {
                        what: "import",
                        index: id.0,
                    });
                }
                Op::CallBnd(FunctionId::import(id.0 as usize))
            }
            Op::Alloc(t, ctor) => {
                let ctor = match ctor.0 {
                    0 => FunctionId::NONE,
                    n => function(FunctionId(n - 1))?,
                };
                Op::Alloc(ty(t)?, ctor)
            }
            Op::Free(t) => Op::Free(ty(t)?),
            Op::RefCpy(t) => Op::RefCpy(ty(t)?),
            Op::PshTypeId(t) => Op::PshTypeId(ty(t)?),
            Op::Str(index) => Op::Str(lookup(&self.strings, index as u32, "string")?),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::vm::context::ExecutionOutcome;

    const IMAGE: &str = r#"{
        "name": "main",
        "strings": ["a", "b", "a"],
        "globals": [{ "name": "counter", "type": "int" }],
        "functions": [
            { "name": "main", "returns": "int", "locals": 1,
              "code": [
                  { "Call": 1 },
                  { "CpyRtoV4": 1 },
                  { "AddIi": [1, 1, 1] },
                  { "CpyVtoR4": 1 },
                  { "Ret": 0 }
              ],
              "lines": [[0, 1], [1, 2, 9]] },
            { "name": "seven", "returns": "int", "locals": 1,
              "code": [
                  { "SetG4": [0, 7] },
                  { "CpyGtoV4": [1, 0] },
                  { "CpyVtoR4": 1 },
                  { "Ret": 0 }
              ] }
        ]
    }"#;

    #[test]
    fn test_parse_defaults() {
        let image = ModuleImage::from_json(IMAGE).unwrap();
        assert_eq!(image.functions[1].params, Vec::<String>::new());
        assert!(image.initializer.is_none());
        assert_eq!(
            image.functions[0].lines,
            vec![LineImage::Line(0, 1), LineImage::Position(1, 2, 9)]
        );
    }

    #[test]
    fn test_function_references_are_remapped() {
        let engine = Engine::new(EngineConfig::default());
        let image = ModuleImage::from_json(IMAGE).unwrap();
        let module = image.build(&engine).unwrap();
        let main = module.function_by_name("main").unwrap();
        let seven = module.function_by_name("seven").unwrap();
        assert_eq!(main.code[0], Op::Call(seven.id));
        assert_eq!(module.string_count(), 2);
        assert_eq!(main.line_at(0), Some((1, 0)));
        assert_eq!(main.line_at(1), Some((2, 9)));
    }

    #[test]
    fn test_out_of_range_reference() {
        let engine = Engine::new(EngineConfig::default());
        let mut image = ModuleImage::from_json(IMAGE).unwrap();
        image.functions[0].code[0] = Op::Call(FunctionId(9));
        assert!(matches!(
            image.build(&engine),
            Err(ImageError::BadIndex { what: "function", index: 9 })
        ));
    }

    #[test]
    fn test_unknown_system_function() {
        let engine = Engine::new(EngineConfig::default());
        let image = ModuleImage {
            name: "m".into(),
            system_functions: vec!["missing".into()],
            ..ModuleImage::default()
        };
        assert!(matches!(
            image.build(&engine),
            Err(ImageError::UnknownSystemFunction(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_run_loaded_image() {
        let engine = Engine::new(EngineConfig::default());
        let module = ModuleImage::from_json(IMAGE).unwrap().build(&engine).unwrap();
        let main = module.function_by_name("main").unwrap();
        let mut ctx = engine.create_context();
        ctx.prepare(main.id).unwrap();
        assert_eq!(ctx.execute(), Ok(ExecutionOutcome::Finished));
        assert_eq!(ctx.return_dword(), 8);
    }
}
