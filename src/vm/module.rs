//! Modules: compiled units owning functions, globals, constant strings and
//! import slots.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::address::Address;
use super::engine::Engine;
use super::error::ModuleError;
use super::function::{FunctionDescriptor, FunctionId, FunctionKind};
use super::heap::ObjectRef;
use super::types::DataType;
use super::verifier::Verifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

/// A global variable and its word offset in the module's store.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: DataType,
    pub offset: u32,
}

/// A declared import and the function it is currently bound to.
#[derive(Debug)]
pub struct ImportSlot {
    pub declaration: Arc<FunctionDescriptor>,
    bound: AtomicU32,
}

impl ImportSlot {
    pub fn binding(&self) -> Option<FunctionId> {
        let id = FunctionId(self.bound.load(Ordering::Acquire));
        (id != FunctionId::UNBOUND).then_some(id)
    }

    pub(crate) fn set_binding(&self, id: FunctionId) -> Option<FunctionId> {
        let old = FunctionId(self.bound.swap(id.0, Ordering::AcqRel));
        (old != FunctionId::UNBOUND).then_some(old)
    }
}

#[derive(Debug)]
pub struct Module {
    id: ModuleId,
    name: String,
    functions: Vec<Arc<FunctionDescriptor>>,
    init_function: Option<Arc<FunctionDescriptor>>,
    globals: Vec<GlobalVariable>,
    /// Global storage; shared by every context running this module's code.
    store: Mutex<Vec<u32>>,
    strings: Vec<String>,
    imports: Vec<ImportSlot>,
    context_refs: AtomicU32,
    module_refs: AtomicU32,
    discarded: AtomicBool,
}

impl Module {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn function_by_index(&self, index: usize) -> Option<&Arc<FunctionDescriptor>> {
        self.functions.get(index)
    }

    /// First global (non-method) function with this name.
    pub fn function_by_name(&self, name: &str) -> Option<&Arc<FunctionDescriptor>> {
        self.functions
            .iter()
            .find(|f| f.object_type.is_none() && f.name == name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<FunctionDescriptor>> {
        self.functions.iter()
    }

    pub fn init_function(&self) -> Option<&Arc<FunctionDescriptor>> {
        self.init_function.as_ref()
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    pub fn global(&self, index: usize) -> Option<&GlobalVariable> {
        self.globals.get(index)
    }

    pub fn global_index_by_name(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|g| g.name == name)
    }

    pub fn global_address(&self, index: usize) -> Option<Address> {
        let global = self.globals.get(index)?;
        Some(Address::Global {
            module: self.id,
            offset: global.offset,
        })
    }

    pub fn read_global_word(&self, offset: u32) -> Option<u32> {
        self.store.lock().get(offset as usize).copied()
    }

    pub fn write_global_word(&self, offset: u32, value: u32) -> Option<()> {
        *self.store.lock().get_mut(offset as usize)? = value;
        Some(())
    }

    /// Zeroes all globals and returns the handles that were stored in
    /// object-typed globals, for the caller to release.
    pub(crate) fn clear_globals(&self) -> Vec<ObjectRef> {
        let mut store = self.store.lock();
        let mut handles = Vec::new();
        for global in self.globals.iter().filter(|g| g.ty.is_object()) {
            let at = global.offset as usize;
            let bits = store[at] as u64 | ((store[at + 1] as u64) << 32);
            handles.extend(ObjectRef::from_bits(bits));
        }
        store.fill(0);
        handles
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn constant_string(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub fn import(&self, index: usize) -> Option<&ImportSlot> {
        self.imports.get(index)
    }

    pub fn imports(&self) -> impl Iterator<Item = &ImportSlot> {
        self.imports.iter()
    }

    pub fn add_context_ref(&self) {
        self.context_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_context_ref(&self) {
        self.context_refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn add_module_ref(&self) {
        self.module_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_module_ref(&self) {
        self.module_refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn context_refs(&self) -> u32 {
        self.context_refs.load(Ordering::Acquire)
    }

    pub fn module_refs(&self) -> u32 {
        self.module_refs.load(Ordering::Acquire)
    }

    /// True while a context or another module's import references this one.
    pub fn is_used(&self) -> bool {
        self.context_refs() != 0 || self.module_refs() != 0
    }

    pub(crate) fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub fn can_delete(&self) -> bool {
        self.is_discarded() && !self.is_used()
    }
}

/// Assembles a [`Module`] and registers it with the engine.
pub struct ModuleBuilder {
    engine: Arc<Engine>,
    id: ModuleId,
    name: String,
    declared: Vec<(FunctionId, String)>,
    defined: HashMap<FunctionId, FunctionDescriptor>,
    init_function: Option<FunctionDescriptor>,
    globals: Vec<GlobalVariable>,
    store_words: u32,
    strings: Vec<String>,
    string_index: HashMap<String, u16>,
    imports: Vec<FunctionDescriptor>,
}

impl ModuleBuilder {
    pub(crate) fn new(engine: Arc<Engine>, id: ModuleId, name: String) -> Self {
        Self {
            engine,
            id,
            name,
            declared: Vec::new(),
            defined: HashMap::new(),
            init_function: None,
            globals: Vec::new(),
            store_words: 0,
            strings: Vec::new(),
            string_index: HashMap::new(),
            imports: Vec::new(),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Reserves an id for a function whose body is defined later.
    pub fn declare(&mut self, name: impl Into<String>) -> FunctionId {
        let id = self.engine.reserve_function_id();
        self.declared.push((id, name.into()));
        id
    }

    pub fn define(&mut self, id: FunctionId, mut function: FunctionDescriptor) {
        function.id = id;
        function.module = Some(self.id);
        self.defined.insert(id, function);
    }

    /// Declares and defines in one step.
    pub fn function(&mut self, function: FunctionDescriptor) -> FunctionId {
        let id = self.declare(function.name.clone());
        self.define(id, function);
        id
    }

    /// Sets the global initializer.
    pub fn initializer(&mut self, mut function: FunctionDescriptor) {
        function.id = FunctionId::MODULE_INIT;
        function.module = Some(self.id);
        self.init_function = Some(function);
    }

    /// Adds a global variable and returns its index.
    pub fn global(&mut self, name: impl Into<String>, ty: DataType) -> u16 {
        let index = self.globals.len() as u16;
        let words = ty.stack_words().max(1);
        self.globals.push(GlobalVariable {
            name: name.into(),
            ty,
            offset: self.store_words,
        });
        self.store_words += words;
        index
    }

    /// Interns a constant string and returns its index.
    pub fn string(&mut self, value: &str) -> u16 {
        if let Some(&index) = self.string_index.get(value) {
            return index;
        }
        let index = self.strings.len() as u16;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), index);
        index
    }

    /// Declares an imported function; the returned id is a `CallBnd` operand.
    pub fn import(&mut self, mut declaration: FunctionDescriptor) -> FunctionId {
        let id = FunctionId::import(self.imports.len());
        declaration.id = id;
        declaration.kind = FunctionKind::Imported;
        declaration.module = Some(self.id);
        declaration.code.clear();
        self.imports.push(declaration);
        id
    }

    /// Verifies every function and registers the module with the engine.
    pub fn build(mut self) -> Result<Arc<Module>, ModuleError> {
        let engine = Arc::clone(&self.engine);
        let _guard = engine.begin_build()?;
        let mut functions = Vec::with_capacity(self.declared.len());
        for (id, name) in std::mem::take(&mut self.declared) {
            let function = self
                .defined
                .remove(&id)
                .ok_or(ModuleError::UndefinedFunction { name })?;
            functions.push(Arc::new(function));
        }

        let module = Module {
            id: self.id,
            name: self.name,
            functions,
            init_function: self.init_function.map(Arc::new),
            globals: self.globals,
            store: Mutex::new(vec![0; self.store_words as usize]),
            strings: self.strings,
            imports: self
                .imports
                .into_iter()
                .map(|declaration| ImportSlot {
                    declaration: Arc::new(declaration),
                    bound: AtomicU32::new(FunctionId::UNBOUND.0),
                })
                .collect(),
            context_refs: AtomicU32::new(0),
            module_refs: AtomicU32::new(0),
            discarded: AtomicBool::new(false),
        };

        if self.engine.config().verify_bytecode {
            let verifier = Verifier::new(&self.engine, &module);
            for function in module.functions.iter().chain(module.init_function.iter()) {
                verifier.verify(function)?;
            }
        }

        let module = Arc::new(module);
        self.engine.add_module(Arc::clone(&module))?;
        debug!(
            module = %module.name,
            functions = module.functions.len(),
            globals = module.globals.len(),
            "module built"
        );
        Ok(module)
    }
}
