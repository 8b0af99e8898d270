//! The engine: registries shared by every module and context.
//!
//! Holds the function table, object types, host functions, modules and the
//! object heap. Building a module takes the engine's single build flag; it is
//! the only engine-wide lock in the execution path. Global variables of a
//! module are not synchronized beyond their word store, so hosts running
//! contexts of the same module on several threads serialize externally.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::config::EngineConfig;

use super::context::{Context, ExecutionOutcome};
use super::error::ModuleError;
use super::function::{FunctionDescriptor, FunctionId, FunctionKind};
use super::heap::ObjectHeap;
use super::module::{Module, ModuleBuilder, ModuleId};
use super::system::{SystemCall, SystemFunction};
use super::types::{DataType, ObjectType, TypeId, TypeKind, TypeRegistry};

pub struct Engine {
    config: EngineConfig,
    types: RwLock<TypeRegistry>,
    /// Indexed by `FunctionId`; slot 0 is `FunctionId::NONE`.
    functions: RwLock<Vec<Option<Arc<FunctionDescriptor>>>>,
    system_functions: RwLock<HashMap<FunctionId, SystemFunction>>,
    modules: RwLock<Vec<Arc<Module>>>,
    discarded: Mutex<Vec<Arc<Module>>>,
    heap: Mutex<ObjectHeap>,
    building: AtomicBool,
    next_module: AtomicU32,
}

/// Clears the build flag when dropped.
pub(crate) struct BuildGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Engine> {
        Arc::new(Engine {
            config,
            types: RwLock::new(TypeRegistry::new()),
            functions: RwLock::new(vec![None]),
            system_functions: RwLock::new(HashMap::new()),
            modules: RwLock::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            heap: Mutex::new(ObjectHeap::new()),
            building: AtomicBool::new(false),
            next_module: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn create_context(self: &Arc<Self>) -> Context {
        Context::new(Arc::clone(self))
    }

    pub fn heap(&self) -> MutexGuard<'_, ObjectHeap> {
        self.heap.lock()
    }

    // ========================================
    // Types
    // ========================================

    pub fn register_object_type(&self, ty: ObjectType) -> Result<TypeId, ModuleError> {
        let name = ty.name.clone();
        let id = self
            .types
            .write()
            .register(ty)
            .ok_or_else(|| ModuleError::DuplicateType(name.clone()))?;
        debug!(name = %name, id = id.0, "object type registered");
        Ok(id)
    }

    pub fn object_type(&self, id: TypeId) -> Option<Arc<ObjectType>> {
        self.types.read().get(id).cloned()
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.types.read().by_name(name)
    }

    /// Parses a declaration such as `int&` or `Counter@` against the
    /// registered types.
    pub fn parse_type(&self, decl: &str) -> Option<DataType> {
        let types = self.types.read();
        DataType::parse(decl, |name| types.by_name(name))
    }

    /// Declaration text of a type with object names resolved.
    pub fn type_name(&self, ty: &DataType) -> String {
        match ty.kind {
            TypeKind::Primitive(_) => ty.to_string(),
            TypeKind::Object(id) => {
                let mut name = self
                    .object_type(id)
                    .map_or_else(|| format!("object#{}", id.0), |t| t.name.clone());
                if ty.is_handle {
                    name.push('@');
                }
                if ty.is_reference {
                    name.push('&');
                }
                name
            }
        }
    }

    // ========================================
    // Functions
    // ========================================

    pub(crate) fn reserve_function_id(&self) -> FunctionId {
        let mut functions = self.functions.write();
        functions.push(None);
        FunctionId(functions.len() as u32 - 1)
    }

    pub fn function(&self, id: FunctionId) -> Option<Arc<FunctionDescriptor>> {
        self.functions.read().get(id.0 as usize)?.clone()
    }

    /// Registers a host function. The descriptor supplies name and signature.
    pub fn register_function<F>(&self, mut desc: FunctionDescriptor, host: F) -> FunctionId
    where
        F: Fn(&mut SystemCall<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = self.reserve_function_id();
        desc.id = id;
        desc.kind = FunctionKind::System;
        desc.module = None;
        debug!(name = %desc.name, id = id.0, "system function registered");
        self.functions.write()[id.0 as usize] = Some(Arc::new(desc));
        self.system_functions.write().insert(id, Arc::new(host));
        id
    }

    pub fn system_function(&self, id: FunctionId) -> Option<SystemFunction> {
        self.system_functions.read().get(&id).cloned()
    }

    /// System function by name.
    pub fn system_function_by_name(&self, name: &str) -> Option<FunctionId> {
        let functions = self.functions.read();
        let system = self.system_functions.read();
        system.keys().copied().find(|id| {
            functions
                .get(id.0 as usize)
                .and_then(Option::as_ref)
                .is_some_and(|f| f.name == name)
        })
    }

    // ========================================
    // Modules
    // ========================================

    pub fn module_builder(self: &Arc<Self>, name: impl Into<String>) -> ModuleBuilder {
        let id = ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed));
        ModuleBuilder::new(Arc::clone(self), id, name.into())
    }

    pub(crate) fn begin_build(&self) -> Result<BuildGuard<'_>, ModuleError> {
        self.building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ModuleError::BuildInProgress)?;
        Ok(BuildGuard {
            flag: &self.building,
        })
    }

    pub(crate) fn add_module(&self, module: Arc<Module>) -> Result<(), ModuleError> {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == module.name()) {
            return Err(ModuleError::DuplicateModule(module.name().to_string()));
        }
        let mut functions = self.functions.write();
        for f in module.functions() {
            if let Some(slot) = functions.get_mut(f.id.0 as usize) {
                *slot = Some(Arc::clone(f));
            }
        }
        modules.push(module);
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<Arc<Module>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Looks up live and discarded-but-referenced modules.
    pub fn module_by_id(&self, id: ModuleId) -> Option<Arc<Module>> {
        if let Some(m) = self.modules.read().iter().find(|m| m.id() == id) {
            return Some(Arc::clone(m));
        }
        self.discarded.lock().iter().find(|m| m.id() == id).cloned()
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.read().clone()
    }

    /// Removes a module from the engine. It is destroyed once no context or
    /// other module references it.
    pub fn discard_module(&self, name: &str) -> Result<(), ModuleError> {
        let module = {
            let mut modules = self.modules.write();
            let index = modules
                .iter()
                .position(|m| m.name() == name)
                .ok_or_else(|| ModuleError::NoSuchModule(name.to_string()))?;
            modules.remove(index)
        };
        module.mark_discarded();
        debug!(module = %name, "module discarded");
        self.discarded.lock().push(module);
        self.collect_discarded_modules();
        Ok(())
    }

    /// Destroys discarded modules that are no longer referenced, including
    /// groups of discarded modules that only reference each other. Returns
    /// the number destroyed.
    pub fn collect_discarded_modules(&self) -> usize {
        let doomed = {
            let discarded = self.discarded.lock();
            let mut set: Vec<Arc<Module>> = discarded
                .iter()
                .filter(|m| m.context_refs() == 0)
                .cloned()
                .collect();
            loop {
                let keep: Vec<bool> = set
                    .iter()
                    .map(|m| m.module_refs() <= self.refs_from(&set, m.id()))
                    .collect();
                let before = set.len();
                let mut flags = keep.into_iter();
                set.retain(|_| flags.next().unwrap_or(false));
                if set.len() == before {
                    break;
                }
            }
            set
        };

        for module in &doomed {
            self.unbind_all_imported_functions(module);
        }
        for module in &doomed {
            self.exit_module(module);
            let mut functions = self.functions.write();
            for f in module.functions() {
                if let Some(slot) = functions.get_mut(f.id.0 as usize) {
                    *slot = None;
                }
            }
            drop(functions);
            debug!(module = %module.name(), "module destroyed");
        }
        let mut discarded = self.discarded.lock();
        discarded.retain(|m| !doomed.iter().any(|d| d.id() == m.id()));
        doomed.len()
    }

    /// Import bindings of `set` that point into module `target`.
    fn refs_from(&self, set: &[Arc<Module>], target: ModuleId) -> u32 {
        let mut count = 0;
        for module in set {
            for slot in module.imports() {
                let Some(bound) = slot.binding() else {
                    continue;
                };
                if self.function(bound).is_some_and(|f| f.module == Some(target)) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Binds import `index` of `module` to `target`, which must have the
    /// same signature.
    pub fn bind_imported_function(
        &self,
        module: &Module,
        index: usize,
        target: FunctionId,
    ) -> Result<(), ModuleError> {
        let slot = module.import(index).ok_or(ModuleError::NoSuchImport(index))?;
        let function = self
            .function(target)
            .ok_or_else(|| ModuleError::NoSuchFunction(format!("{:#x}", target.0)))?;
        if function.signature != slot.declaration.signature
            || function.object_type.is_some()
            || function.kind != FunctionKind::Script
        {
            return Err(ModuleError::IncompatibleSignature {
                import: slot.declaration.declaration(),
                target: function.declaration(),
            });
        }
        let target_module = function.module.and_then(|id| self.module_by_id(id));
        if let Some(m) = &target_module {
            m.add_module_ref();
        }
        if let Some(old) = slot.set_binding(target) {
            self.release_binding_target(old);
        }
        debug!(
            module = %module.name(),
            import = %slot.declaration.name,
            target = target.0,
            "imported function bound"
        );
        Ok(())
    }

    pub fn unbind_imported_function(&self, module: &Module, index: usize) -> Result<(), ModuleError> {
        let slot = module.import(index).ok_or(ModuleError::NoSuchImport(index))?;
        if let Some(old) = slot.set_binding(FunctionId::UNBOUND) {
            self.release_binding_target(old);
        }
        Ok(())
    }

    fn release_binding_target(&self, id: FunctionId) {
        if let Some(m) = self
            .function(id)
            .and_then(|f| f.module)
            .and_then(|mid| self.module_by_id(mid))
        {
            m.release_module_ref();
        }
    }

    /// Binds every import by name from its declared source module. Imports
    /// that cannot be resolved stay unbound.
    pub fn bind_all_imported_functions(&self, module: &Module) -> Result<(), ModuleError> {
        let mut failed = 0;
        for (index, slot) in module.imports().enumerate() {
            let decl = &slot.declaration;
            let target = decl
                .import_from
                .as_deref()
                .and_then(|source| self.module(source))
                .and_then(|source| {
                    source
                        .functions()
                        .find(|f| f.name == decl.name && f.object_type.is_none() && f.signature == decl.signature)
                        .map(|f| f.id)
                });
            match target {
                Some(id) => self.bind_imported_function(module, index, id)?,
                None => {
                    warn!(module = %module.name(), import = %decl.name, "imported function not found");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(ModuleError::UnresolvedImports(failed));
        }
        Ok(())
    }

    pub fn unbind_all_imported_functions(&self, module: &Module) {
        for index in 0..module.import_count() {
            let _ = self.unbind_imported_function(module, index);
        }
    }

    // ========================================
    // Global variables
    // ========================================

    /// Releases object globals, zeroes the store and runs the initializer.
    pub fn reset_globals(self: &Arc<Self>, module: &Module) -> Result<(), ModuleError> {
        self.exit_module(module);
        let Some(init) = module.init_function() else {
            return Ok(());
        };
        let mut ctx = self.create_context();
        ctx.prepare_function(Arc::clone(init))
            .map_err(|e| ModuleError::InitFailed(e.to_string()))?;
        match ctx.execute() {
            Ok(ExecutionOutcome::Finished) => Ok(()),
            Ok(_) => Err(ModuleError::InitFailed(
                ctx.exception_string()
                    .unwrap_or("initializer did not finish")
                    .to_string(),
            )),
            Err(e) => Err(ModuleError::InitFailed(e.to_string())),
        }
    }

    /// Releases every object held in the module's globals.
    pub fn exit_module(&self, module: &Module) {
        let handles = module.clear_globals();
        if handles.is_empty() {
            return;
        }
        let mut heap = self.heap.lock();
        for handle in handles {
            heap.free(handle);
        }
    }
}
