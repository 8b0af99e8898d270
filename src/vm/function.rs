//! Function descriptors: the immutable description of one callable unit.

use serde::{Deserialize, Serialize};

use super::module::ModuleId;
use super::ops::Op;
use super::types::{DataType, PTR_SIZE, Signature, TypeId};

/// Engine-wide function id.
///
/// Ids with [`FunctionId::IMPORTED`] set are module-local import slots and
/// are only meaningful as `CallBnd` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// No function (e.g. an `Alloc` without constructor).
    pub const NONE: FunctionId = FunctionId(0);
    /// Flag marking an import slot of the calling module.
    pub const IMPORTED: u32 = 0x4000_0000;
    /// The implicit global initializer of a module.
    pub const MODULE_INIT: FunctionId = FunctionId(0x7fff_ffff);
    /// Value of an import slot that is not bound to anything.
    pub const UNBOUND: FunctionId = FunctionId(u32::MAX);

    pub fn import(index: usize) -> Self {
        FunctionId(Self::IMPORTED | index as u32)
    }

    pub fn is_imported(self) -> bool {
        self != Self::UNBOUND && self != Self::MODULE_INIT && self.0 & Self::IMPORTED != 0
    }

    pub fn import_index(self) -> Option<usize> {
        self.is_imported()
            .then_some((self.0 & !Self::IMPORTED) as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    /// Compiled bytecode.
    Script,
    /// Implemented by the host.
    System,
    /// Resolved at call time by signature id against the object's methods.
    Interface,
    /// Declared here, implemented in another module.
    Imported,
    /// Resolved at call time through the object's virtual table.
    Virtual,
}

/// A local that holds an object handle and must be cleaned up on unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVariable {
    pub offset: i16,
    pub ty: TypeId,
}

/// Debug information for a named variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub ty: DataType,
    pub offset: i16,
}

/// A line table entry mapping an instruction index to a source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub pc: u32,
    pub line: u32,
    pub column: u32,
}

/// Sorted (instruction, line) table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineTable {
    entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; entries may arrive in any order.
    pub fn add(&mut self, pc: usize, line: u32, column: u32) {
        let entry = LineEntry {
            pc: pc as u32,
            line,
            column,
        };
        let at = self.entries.partition_point(|e| e.pc <= entry.pc);
        self.entries.insert(at, entry);
    }

    /// Find the source location for an instruction index.
    /// Returns (line, column) of the closest entry at or before `pc`.
    pub fn find_location(&self, pc: usize) -> Option<(u32, u32)> {
        let at = self.entries.partition_point(|e| e.pc as usize <= pc);
        let entry = self.entries.get(at.checked_sub(1)?)?;
        Some((entry.line, entry.column))
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(usize, u32, u32)> for LineTable {
    fn from_iter<I: IntoIterator<Item = (usize, u32, u32)>>(iter: I) -> Self {
        let mut table = LineTable::new();
        for (pc, line, column) in iter {
            table.add(pc, line, column);
        }
        table
    }
}

impl FromIterator<(usize, u32)> for LineTable {
    fn from_iter<I: IntoIterator<Item = (usize, u32)>>(iter: I) -> Self {
        let mut table = LineTable::new();
        for (pc, line) in iter {
            table.add(pc, line, 0);
        }
        table
    }
}

/// Description of one callable unit. Immutable once the module is built.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    pub id: FunctionId,
    pub name: String,
    pub kind: FunctionKind,
    pub signature: Signature,
    /// Owning module; `None` for system functions.
    pub module: Option<ModuleId>,
    /// Type of `this` for methods.
    pub object_type: Option<TypeId>,
    /// Key used to match interface methods against implementations.
    pub signature_id: u32,
    /// Slot in the object's virtual table, for virtual functions.
    pub vtable_index: Option<u32>,
    /// Source module of an imported function.
    pub import_from: Option<String>,
    pub code: Vec<Op>,
    /// Words reserved for locals below the frame pointer.
    pub variable_space: u32,
    /// Words the function may use below the frame pointer, locals included.
    pub stack_needed: u32,
    pub object_variables: Vec<ObjectVariable>,
    pub variables: Vec<VariableInfo>,
    pub lines: LineTable,
    /// Set for thin stubs that do not own their arguments.
    pub dont_clean_up_on_exception: bool,
}

impl FunctionDescriptor {
    pub fn is_script(&self) -> bool {
        self.kind == FunctionKind::Script
    }

    /// Words occupied by the arguments, including `this` for methods.
    pub fn arg_words(&self) -> u32 {
        self.this_words() + self.signature.param_words()
    }

    pub fn this_words(&self) -> u32 {
        if self.object_type.is_some() { PTR_SIZE } else { 0 }
    }

    /// Offset from the frame pointer of argument `index`.
    pub fn param_offset(&self, index: usize) -> Option<u32> {
        if index >= self.signature.params.len() {
            return None;
        }
        let before: u32 = self.signature.params[..index]
            .iter()
            .map(|p| p.ty.stack_words())
            .sum();
        Some(self.this_words() + before)
    }

    /// Words returned in the register; 0 for void and object returns.
    pub fn return_words(&self) -> u32 {
        let ret = &self.signature.return_type;
        if ret.is_object() && !ret.is_reference {
            0
        } else {
            ret.stack_words()
        }
    }

    pub fn line_at(&self, pc: usize) -> Option<(u32, u32)> {
        self.lines.find_location(pc)
    }

    /// A printable declaration, e.g. `int f(int, int)`.
    pub fn declaration(&self) -> String {
        let params: Vec<String> = self
            .signature
            .params
            .iter()
            .map(|p| p.ty.to_string())
            .collect();
        format!(
            "{} {}({})",
            self.signature.return_type,
            self.name,
            params.join(", ")
        )
    }
}

/// Words an instruction may push onto the stack.
fn pushed_words(op: &Op) -> u32 {
    match *op {
        Op::Push(n) => n as u32,
        Op::PshC4(_) | Op::PshV4(_) | Op::PshG4(_) | Op::PshTypeId(_) => 1,
        Op::PshC8(_) | Op::PshV8(_) => 2,
        Op::Psf(_) | Op::PshNull | Op::Pga(_) | Op::Var(_) | Op::PshRPtr | Op::Alloc(..) => {
            PTR_SIZE
        }
        Op::Str(_) => PTR_SIZE + 1,
        _ => 0,
    }
}

/// Assembles a [`FunctionDescriptor`].
///
/// `stack_needed` defaults to the local space plus every word the code could
/// push, which over-approximates the real peak.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    desc: FunctionDescriptor,
    explicit_stack: Option<u32>,
}

impl FunctionBuilder {
    fn with_kind(name: impl Into<String>, kind: FunctionKind) -> Self {
        Self {
            desc: FunctionDescriptor {
                id: FunctionId::NONE,
                name: name.into(),
                kind,
                signature: Signature::void(),
                module: None,
                object_type: None,
                signature_id: 0,
                vtable_index: None,
                import_from: None,
                code: Vec::new(),
                variable_space: 0,
                stack_needed: 0,
                object_variables: Vec::new(),
                variables: Vec::new(),
                lines: LineTable::new(),
                dont_clean_up_on_exception: false,
            },
            explicit_stack: None,
        }
    }

    pub fn script(name: impl Into<String>) -> Self {
        Self::with_kind(name, FunctionKind::Script)
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self::with_kind(name, FunctionKind::System)
    }

    /// Interface method matched by `signature_id` at call time.
    pub fn interface(name: impl Into<String>, ty: TypeId, signature_id: u32) -> Self {
        let mut b = Self::with_kind(name, FunctionKind::Interface);
        b.desc.object_type = Some(ty);
        b.desc.signature_id = signature_id;
        b
    }

    /// Virtual slot dispatched through the object's virtual table.
    pub fn virtual_slot(name: impl Into<String>, ty: TypeId, index: u32) -> Self {
        let mut b = Self::with_kind(name, FunctionKind::Virtual);
        b.desc.object_type = Some(ty);
        b.desc.vtable_index = Some(index);
        b
    }

    pub fn import(name: impl Into<String>, from: impl Into<String>) -> Self {
        let mut b = Self::with_kind(name, FunctionKind::Imported);
        b.desc.import_from = Some(from.into());
        b
    }

    pub fn method_of(mut self, ty: TypeId) -> Self {
        self.desc.object_type = Some(ty);
        self
    }

    pub fn signature_id(mut self, id: u32) -> Self {
        self.desc.signature_id = id;
        self
    }

    pub fn param(mut self, ty: DataType) -> Self {
        self.desc.signature.params.push(super::types::Parameter::new(ty));
        self
    }

    pub fn param_with(mut self, param: super::types::Parameter) -> Self {
        self.desc.signature.params.push(param);
        self
    }

    pub fn returns(mut self, ty: DataType) -> Self {
        self.desc.signature.return_type = ty;
        self
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.desc.signature = signature;
        self
    }

    pub fn locals(mut self, words: u32) -> Self {
        self.desc.variable_space = words;
        self
    }

    pub fn stack(mut self, words: u32) -> Self {
        self.explicit_stack = Some(words);
        self
    }

    pub fn code(mut self, code: Vec<Op>) -> Self {
        self.desc.code = code;
        self
    }

    pub fn object_variable(mut self, offset: i16, ty: TypeId) -> Self {
        self.desc.object_variables.push(ObjectVariable { offset, ty });
        self
    }

    pub fn variable(mut self, name: impl Into<String>, ty: DataType, offset: i16) -> Self {
        self.desc.variables.push(VariableInfo {
            name: name.into(),
            ty,
            offset,
        });
        self
    }

    pub fn line(mut self, pc: usize, line: u32) -> Self {
        self.desc.lines.add(pc, line, 0);
        self
    }

    pub fn position(mut self, pc: usize, line: u32, column: u32) -> Self {
        self.desc.lines.add(pc, line, column);
        self
    }

    pub fn lines(mut self, lines: LineTable) -> Self {
        self.desc.lines = lines;
        self
    }

    pub fn dont_clean_up_on_exception(mut self) -> Self {
        self.desc.dont_clean_up_on_exception = true;
        self
    }

    pub fn build(mut self) -> FunctionDescriptor {
        self.desc.stack_needed = match self.explicit_stack {
            Some(words) => words.max(self.desc.variable_space),
            None => self.desc.variable_space + self.desc.code.iter().map(pushed_words).sum::<u32>(),
        };
        self.desc
    }
}
