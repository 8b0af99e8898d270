//! Data types, signatures and registered object types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::function::FunctionId;
use super::heap::ScriptObject;

/// Size of a pointer or handle in stack words.
pub const PTR_SIZE: u32 = 2;

/// Identifies a registered object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
}

impl Primitive {
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Primitive::Void => 0,
            Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32 | Primitive::UInt32 | Primitive::Float => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Double => 8,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "bool",
            Primitive::Int8 => "int8",
            Primitive::Int16 => "int16",
            Primitive::Int32 => "int",
            Primitive::Int64 => "int64",
            Primitive::UInt8 => "uint8",
            Primitive::UInt16 => "uint16",
            Primitive::UInt32 => "uint",
            Primitive::UInt64 => "uint64",
            Primitive::Float => "float",
            Primitive::Double => "double",
        }
    }

    fn from_keyword(word: &str) -> Option<Primitive> {
        Some(match word {
            "void" => Primitive::Void,
            "bool" => Primitive::Bool,
            "int8" => Primitive::Int8,
            "int16" => Primitive::Int16,
            "int" | "int32" => Primitive::Int32,
            "int64" => Primitive::Int64,
            "uint8" => Primitive::UInt8,
            "uint16" => Primitive::UInt16,
            "uint" | "uint32" => Primitive::UInt32,
            "uint64" => Primitive::UInt64,
            "float" => Primitive::Float,
            "double" => Primitive::Double,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Primitive(Primitive),
    Object(TypeId),
}

/// Type of a parameter, return value, global or local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    pub kind: TypeKind,
    /// `T@`: a handle to a reference-counted object.
    pub is_handle: bool,
    /// `T&`: an address of a value living elsewhere.
    pub is_reference: bool,
}

impl DataType {
    pub const VOID: DataType = DataType::primitive(Primitive::Void);
    pub const BOOL: DataType = DataType::primitive(Primitive::Bool);
    pub const INT: DataType = DataType::primitive(Primitive::Int32);
    pub const UINT: DataType = DataType::primitive(Primitive::UInt32);
    pub const INT64: DataType = DataType::primitive(Primitive::Int64);
    pub const FLOAT: DataType = DataType::primitive(Primitive::Float);
    pub const DOUBLE: DataType = DataType::primitive(Primitive::Double);

    pub const fn primitive(p: Primitive) -> Self {
        Self {
            kind: TypeKind::Primitive(p),
            is_handle: false,
            is_reference: false,
        }
    }

    pub const fn object(id: TypeId) -> Self {
        Self {
            kind: TypeKind::Object(id),
            is_handle: false,
            is_reference: false,
        }
    }

    pub const fn handle(id: TypeId) -> Self {
        Self {
            kind: TypeKind::Object(id),
            is_handle: true,
            is_reference: false,
        }
    }

    pub const fn reference(self) -> Self {
        Self {
            is_reference: true,
            ..self
        }
    }

    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Primitive(Primitive::Void) && !self.is_reference
    }

    pub fn is_object(&self) -> bool {
        matches!(self.kind, TypeKind::Object(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(_)) && !self.is_reference
    }

    pub fn object_type(&self) -> Option<TypeId> {
        match self.kind {
            TypeKind::Object(id) => Some(id),
            TypeKind::Primitive(_) => None,
        }
    }

    pub fn primitive_kind(&self) -> Option<Primitive> {
        match self.kind {
            TypeKind::Primitive(p) => Some(p),
            TypeKind::Object(_) => None,
        }
    }

    /// Size of the value in memory; objects and references are pointers.
    pub fn size_in_bytes(&self) -> u32 {
        if self.is_reference {
            return PTR_SIZE * 4;
        }
        match self.kind {
            TypeKind::Primitive(p) => p.size_in_bytes(),
            TypeKind::Object(_) => PTR_SIZE * 4,
        }
    }

    /// Number of stack words this type occupies as an argument.
    pub fn stack_words(&self) -> u32 {
        if self.is_reference || self.is_object() {
            return PTR_SIZE;
        }
        match self.size_in_bytes() {
            0 => 0,
            n => n.div_ceil(4),
        }
    }

    /// Parses a declaration such as `int`, `double&`, `Counter@`.
    /// `resolve` maps object type names to ids.
    pub fn parse(decl: &str, resolve: impl Fn(&str) -> Option<TypeId>) -> Option<DataType> {
        let mut text = decl.trim();
        let mut is_reference = false;
        if let Some(rest) = text.strip_suffix('&') {
            is_reference = true;
            text = rest.trim_end();
        }
        let mut is_handle = false;
        if let Some(rest) = text.strip_suffix('@') {
            is_handle = true;
            text = rest.trim_end();
        }
        let text = text.strip_prefix("const ").unwrap_or(text).trim();

        let kind = match Primitive::from_keyword(text) {
            Some(p) if !is_handle => TypeKind::Primitive(p),
            Some(_) => return None,
            None => TypeKind::Object(resolve(text)?),
        };
        Some(DataType {
            kind,
            is_handle,
            is_reference,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TypeKind::Primitive(p) => write!(f, "{}", p.keyword())?,
            TypeKind::Object(id) => write!(f, "object#{}", id.0)?,
        }
        if self.is_handle {
            write!(f, "@")?;
        }
        if self.is_reference {
            write!(f, "&")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamModifier {
    #[default]
    None,
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub ty: DataType,
    pub modifier: ParamModifier,
}

impl Parameter {
    pub fn new(ty: DataType) -> Self {
        Self {
            ty,
            modifier: ParamModifier::None,
        }
    }

    /// True if the callee owns the value and must clean it up.
    pub fn is_owned_object(&self) -> bool {
        self.ty.is_object() && !self.ty.is_reference
    }
}

/// Return type and ordered parameters of a callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub return_type: DataType,
    pub params: Vec<Parameter>,
}

impl Signature {
    pub fn new(return_type: DataType, params: impl IntoIterator<Item = DataType>) -> Self {
        Self {
            return_type,
            params: params.into_iter().map(Parameter::new).collect(),
        }
    }

    pub fn void() -> Self {
        Self::new(DataType::VOID, [])
    }

    /// Stack words taken by the explicit parameters.
    pub fn param_words(&self) -> u32 {
        self.params.iter().map(|p| p.ty.stack_words()).sum()
    }
}

/// Lifetime hooks supplied by the host for one object type.
///
/// The heap keeps the reference count itself; these hooks observe or extend
/// the lifecycle of individual objects.
pub trait TypeBehaviour: Send + Sync {
    fn construct(&self, _object: &mut ScriptObject) {}
    fn destruct(&self, _object: &mut ScriptObject) {}
    fn add_ref(&self, _object: &ScriptObject) {}
    fn release(&self, _object: &ScriptObject) {}
}

/// Behaviour with no hooks.
pub struct NoBehaviour;

impl TypeBehaviour for NoBehaviour {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeFlags {
    /// Released through reference counting instead of destroyed directly.
    pub ref_counted: bool,
    /// Declared by script code; constructors are script functions.
    pub script_object: bool,
}

/// A registered object type.
pub struct ObjectType {
    pub id: TypeId,
    pub name: String,
    pub flags: TypeFlags,
    /// Number of word-sized fields of each instance.
    pub field_words: u32,
    /// Field offsets holding handles that the object owns.
    pub handle_fields: Vec<u32>,
    pub methods: Vec<FunctionId>,
    pub virtual_table: Vec<FunctionId>,
    pub behaviour: Arc<dyn TypeBehaviour>,
}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("field_words", &self.field_words)
            .finish_non_exhaustive()
    }
}

impl ObjectType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TypeId(0),
            name: name.into(),
            flags: TypeFlags::default(),
            field_words: 0,
            handle_fields: Vec::new(),
            methods: Vec::new(),
            virtual_table: Vec::new(),
            behaviour: Arc::new(NoBehaviour),
        }
    }

    pub fn ref_counted(mut self) -> Self {
        self.flags.ref_counted = true;
        self
    }

    pub fn script_object(mut self) -> Self {
        self.flags.script_object = true;
        self.flags.ref_counted = true;
        self
    }

    pub fn fields(mut self, words: u32) -> Self {
        self.field_words = words;
        self
    }

    /// Marks the two words at `offset` as an owned handle.
    pub fn handle_field(mut self, offset: u32) -> Self {
        self.field_words = self.field_words.max(offset + PTR_SIZE);
        self.handle_fields.push(offset);
        self
    }

    pub fn method(mut self, id: FunctionId) -> Self {
        self.methods.push(id);
        self
    }

    pub fn virtual_method(mut self, id: FunctionId) -> Self {
        self.virtual_table.push(id);
        self
    }

    pub fn behaviour(mut self, behaviour: Arc<dyn TypeBehaviour>) -> Self {
        self.behaviour = behaviour;
        self
    }
}

/// Engine-wide table of object types.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<Arc<ObjectType>>,
    by_name: HashMap<String, TypeId>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type, assigning its id. Ids start at 1.
    pub fn register(&mut self, mut ty: ObjectType) -> Option<TypeId> {
        if self.by_name.contains_key(&ty.name) {
            return None;
        }
        let id = TypeId(self.types.len() as u32 + 1);
        ty.id = id;
        self.by_name.insert(ty.name.clone(), id);
        self.types.push(Arc::new(ty));
        Some(id)
    }

    pub fn get(&self, id: TypeId) -> Option<&Arc<ObjectType>> {
        let index = id.0.checked_sub(1)?;
        self.types.get(index as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
