//! Execution contexts.
//!
//! A [`Context`] runs one entry function at a time. It owns its stack memory
//! and call-frame stack and moves through these states:
//!
//! ```text
//! Uninitialized -> Prepared -> Active <-> Suspended -> Finished | Exception | Aborted
//! ```
//!
//! Runtime faults leave the call stack intact so the host can inspect it;
//! cleanup of object locals and owned arguments runs on the next `prepare`,
//! on `unprepare`, or when the context is dropped. Abort cleans up at once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use super::address::Address;
use super::callstack::{CallFrame, CallFrameStack};
use super::engine::Engine;
use super::error::{ContextError, RuntimeFault};
use super::function::{FunctionDescriptor, FunctionId, FunctionKind};
use super::heap::{ObjectRef, handle_bits};
use super::module::Module;
use super::stack::{StackAllocator, StackPtr};
use super::system::SystemCall;
use super::types::{DataType, PTR_SIZE, TypeId};

/// Extra words reserved on top of every function's declared stack needs.
pub const RESERVE_STACK: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Prepared,
    Active,
    Suspended,
    Finished,
    Exception,
    Aborted,
}

impl ContextState {
    pub fn name(self) -> &'static str {
        match self {
            ContextState::Uninitialized => "Uninitialized",
            ContextState::Prepared => "Prepared",
            ContextState::Active => "Active",
            ContextState::Suspended => "Suspended",
            ContextState::Finished => "Finished",
            ContextState::Exception => "Exception",
            ContextState::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of [`Context::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Finished,
    Suspended,
    Exception,
    Aborted,
}

/// Details of the fault that moved a context into the exception state.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptException {
    pub fault: RuntimeFault,
    pub message: String,
    pub function: FunctionId,
    pub function_name: String,
    /// 0 when the function has no line information.
    pub line: u32,
    /// 0 when the line table carries no column.
    pub column: u32,
}

#[derive(Debug, Default)]
struct InterruptFlags {
    suspend: AtomicBool,
    abort: AtomicBool,
}

/// Requests suspension or abortion of a context from another thread.
///
/// Requests are observed at the next yield point: a `Suspend` instruction
/// or the return from a system function. An abort requested while the
/// context is suspended completes on its next `execute`, `prepare` or
/// `unprepare`.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flags: Arc<InterruptFlags>,
}

impl InterruptHandle {
    pub fn suspend(&self) {
        self.flags.suspend.store(true, Ordering::Release);
    }

    pub fn abort(&self) {
        self.flags.abort.store(true, Ordering::Release);
    }
}

pub type LineCallback = Box<dyn FnMut(&Context) + Send>;
pub type ExceptionCallback = Box<dyn FnMut(&Context) + Send>;

pub struct Context {
    pub(super) engine: Arc<Engine>,
    pub(super) state: ContextState,
    /// The function passed to `prepare`.
    entry: Option<Arc<FunctionDescriptor>>,
    pub(super) function: Option<Arc<FunctionDescriptor>>,
    /// Module of the current function. Every module held here or in a call
    /// frame counts one context reference.
    pub(super) module: Option<Arc<Module>>,
    /// Index of the next instruction.
    pub(super) pc: usize,
    pub(super) sp: StackPtr,
    pub(super) fp: StackPtr,
    pub(super) register: u64,
    pub(super) object_register: Option<ObjectRef>,
    pub(super) call_stack: CallFrameStack,
    pub(super) stack: StackAllocator,
    flags: Arc<InterruptFlags>,
    /// Set while a system function runs.
    pub(super) system_call: Option<Arc<FunctionDescriptor>>,
    pub(super) pending_exception: Option<String>,
    exception: Option<ScriptException>,
    needs_cleanup: bool,
    in_cleanup: bool,
    line_callback: Option<LineCallback>,
    exception_callback: Option<ExceptionCallback>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state)
            .field("function", &self.function.as_ref().map(|f| &f.name))
            .field("pc", &self.pc)
            .field("call_stack", &self.call_stack.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(engine: Arc<Engine>) -> Self {
        let max_words = engine.config().max_context_stack_words;
        Self {
            engine,
            state: ContextState::Uninitialized,
            entry: None,
            function: None,
            module: None,
            pc: 0,
            sp: StackPtr::default(),
            fp: StackPtr::default(),
            register: 0,
            object_register: None,
            call_stack: CallFrameStack::new(),
            stack: StackAllocator::new(max_words),
            flags: Arc::new(InterruptFlags::default()),
            system_call: None,
            pending_exception: None,
            exception: None,
            needs_cleanup: false,
            in_cleanup: false,
            line_callback: None,
            exception_callback: None,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    fn is_busy(&self) -> bool {
        matches!(self.state, ContextState::Active | ContextState::Suspended)
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// Prepares the function with this engine-wide id.
    pub fn prepare(&mut self, id: FunctionId) -> Result<(), ContextError> {
        self.apply_pending_abort();
        if self.is_busy() {
            return Err(ContextError::ContextBusy);
        }
        let function = self
            .engine
            .function(id)
            .ok_or(ContextError::NoFunction(id.0))?;
        self.prepare_function(function)
    }

    /// Prepares a function descriptor directly. Imported declarations are
    /// resolved through their module's binding.
    pub fn prepare_function(&mut self, function: Arc<FunctionDescriptor>) -> Result<(), ContextError> {
        self.apply_pending_abort();
        if self.is_busy() {
            return Err(ContextError::ContextBusy);
        }
        let function = if function.kind == FunctionKind::Imported {
            self.resolve_import(&function)?
        } else {
            function
        };

        if self.state != ContextState::Uninitialized {
            self.release_execution();
        }

        let arg_words = function.arg_words();
        let needed = arg_words + function.stack_needed + RESERVE_STACK;
        if !self.stack.is_allocated() || self.stack.block_size() < needed {
            let size = needed.max(self.engine.config().initial_context_stack_words);
            self.stack.reset(size);
        } else {
            self.stack.keep_first_block();
        }

        let top = self.stack.top(0);
        self.fp = StackPtr {
            block: 0,
            offset: top.offset - arg_words,
        };
        self.stack.zero(self.fp, arg_words);
        self.sp = StackPtr {
            block: 0,
            offset: self.fp.offset - function.variable_space.min(self.fp.offset),
        };
        self.zero_object_variables(&function);

        let module = function.module.and_then(|id| self.engine.module_by_id(id));
        self.set_module(module);
        self.call_stack.clear();
        self.pc = 0;
        self.register = 0;
        self.object_register = None;
        self.exception = None;
        self.pending_exception = None;
        self.flags.suspend.store(false, Ordering::Release);
        self.flags.abort.store(false, Ordering::Release);
        self.needs_cleanup = true;
        self.entry = Some(Arc::clone(&function));
        self.function = Some(function);
        self.state = ContextState::Prepared;
        debug!(
            function = %self.entry.as_ref().map_or("", |f| f.name.as_str()),
            stack_words = self.stack.block_size(),
            "context prepared"
        );
        Ok(())
    }

    fn resolve_import(&self, import: &FunctionDescriptor) -> Result<Arc<FunctionDescriptor>, ContextError> {
        let unbound = ContextError::UnboundFunction(import.id.0);
        let module = import
            .module
            .and_then(|id| self.engine.module_by_id(id))
            .ok_or_else(|| unbound.clone())?;
        let target = import
            .id
            .import_index()
            .and_then(|index| module.import(index))
            .and_then(|slot| slot.binding())
            .ok_or_else(|| unbound.clone())?;
        self.engine.function(target).ok_or(unbound)
    }

    /// Runs cleanup, releases stack memory and returns to `Uninitialized`.
    pub fn unprepare(&mut self) -> Result<(), ContextError> {
        self.apply_pending_abort();
        if self.is_busy() {
            return Err(ContextError::ContextBusy);
        }
        if self.state == ContextState::Uninitialized {
            return Ok(());
        }
        self.release_execution();
        self.stack.release();
        self.entry = None;
        self.function = None;
        self.exception = None;
        self.state = ContextState::Uninitialized;
        debug!("context unprepared");
        Ok(())
    }

    fn release_execution(&mut self) {
        if self.needs_cleanup {
            self.clean_stack();
        }
        if let Some(object) = self.object_register.take() {
            self.engine.heap().free(object);
        }
        self.set_module(None);
    }

    /// Runs or resumes the prepared function until it finishes, faults,
    /// suspends or is aborted.
    pub fn execute(&mut self) -> Result<ExecutionOutcome, ContextError> {
        let first_run = match self.state {
            ContextState::Prepared => true,
            ContextState::Suspended => false,
            state => return Err(ContextError::InvalidState(state.name())),
        };
        self.flags.suspend.store(false, Ordering::Release);
        if self.flags.abort.swap(false, Ordering::AcqRel) {
            self.abort_now();
            return Ok(ExecutionOutcome::Aborted);
        }

        self.state = ContextState::Active;
        trace!(resume = !first_run, "context active");
        if first_run {
            self.enter_entry_function();
        }
        if self.state == ContextState::Active {
            self.run();
        }

        if self.flags.abort.swap(false, Ordering::AcqRel) && self.state == ContextState::Suspended {
            self.abort_now();
        }
        debug!(state = %self.state, "execution stopped");
        Ok(match self.state {
            ContextState::Finished => ExecutionOutcome::Finished,
            ContextState::Exception => ExecutionOutcome::Exception,
            ContextState::Aborted => ExecutionOutcome::Aborted,
            _ => ExecutionOutcome::Suspended,
        })
    }

    fn abort_now(&mut self) {
        self.state = ContextState::Aborted;
        self.clean_stack();
        debug!("context aborted");
    }

    /// Completes an abort requested through an [`InterruptHandle`] while the
    /// context was suspended.
    fn apply_pending_abort(&mut self) {
        if self.state == ContextState::Suspended && self.flags.abort.swap(false, Ordering::AcqRel) {
            self.abort_now();
        }
    }

    /// Resolves virtual and interface entry functions and runs system entry
    /// functions directly.
    fn enter_entry_function(&mut self) {
        let Some(function) = self.function.clone() else {
            self.state = ContextState::Finished;
            return;
        };
        match function.kind {
            FunctionKind::Virtual | FunctionKind::Interface => {
                let object = self.stack.read_u64(self.fp).and_then(ObjectRef::from_bits);
                let Some(real) = object.and_then(|o| self.resolve_method(&function, o)) else {
                    self.raise(RuntimeFault::NullPointerAccess);
                    return;
                };
                if real.kind == FunctionKind::System {
                    self.function = Some(Arc::clone(&real));
                    self.enter_system_function(&real);
                    return;
                }
                if self.fp.offset < real.variable_space + real.stack_needed + RESERVE_STACK {
                    self.raise(RuntimeFault::StackOverflow);
                    return;
                }
                let module = real.module.and_then(|id| self.engine.module_by_id(id));
                self.set_module(module);
                self.sp = StackPtr {
                    block: self.fp.block,
                    offset: self.fp.offset - real.variable_space,
                };
                self.zero_object_variables(&real);
                self.function = Some(real);
            }
            FunctionKind::System => self.enter_system_function(&function),
            FunctionKind::Script | FunctionKind::Imported => {}
        }
    }

    fn enter_system_function(&mut self, function: &Arc<FunctionDescriptor>) {
        self.sp = self.fp;
        match self.call_system_function(function, None) {
            Ok(_) => self.state = ContextState::Finished,
            Err(fault) => self.raise(fault),
        }
    }

    // ========================================
    // Interruption
    // ========================================

    /// Requests suspension at the next yield point.
    pub fn suspend(&self) {
        self.flags.suspend.store(true, Ordering::Release);
    }

    /// Aborts a suspended context at once, cleaning up its stack. Otherwise
    /// abortion is requested for the next yield point.
    pub fn abort(&mut self) {
        if self.state == ContextState::Suspended {
            self.flags.abort.store(false, Ordering::Release);
            self.abort_now();
        } else {
            self.flags.abort.store(true, Ordering::Release);
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flags: Arc::clone(&self.flags),
        }
    }

    pub(super) fn interrupt_requested(&self) -> bool {
        self.flags.suspend.load(Ordering::Acquire) || self.flags.abort.load(Ordering::Acquire)
    }

    // ========================================
    // Arguments
    // ========================================

    fn arg_slot(&self, index: usize) -> Result<(StackPtr, DataType), ContextError> {
        if self.state != ContextState::Prepared {
            return Err(ContextError::NotPrepared);
        }
        let function = self.entry.as_ref().ok_or(ContextError::NotPrepared)?;
        let offset = function
            .param_offset(index)
            .ok_or(ContextError::InvalidArgIndex(index))?;
        let slot = StackPtr {
            block: self.fp.block,
            offset: self.fp.offset + offset,
        };
        Ok((slot, function.signature.params[index].ty))
    }

    fn primitive_slot(&self, index: usize, bytes: u32, what: &str) -> Result<StackPtr, ContextError> {
        let (slot, ty) = self.arg_slot(index)?;
        if ty.is_object() || ty.is_reference || ty.size_in_bytes() != bytes {
            return Err(ContextError::ArgTypeMismatch {
                index,
                expected: format!("{what} for {ty}"),
            });
        }
        Ok(slot)
    }

    pub fn set_arg_byte(&mut self, index: usize, value: u8) -> Result<(), ContextError> {
        let slot = self.primitive_slot(index, 1, "a byte")?;
        self.stack.write(slot, value as u32);
        Ok(())
    }

    pub fn set_arg_word(&mut self, index: usize, value: u16) -> Result<(), ContextError> {
        let slot = self.primitive_slot(index, 2, "a word")?;
        self.stack.write(slot, value as u32);
        Ok(())
    }

    pub fn set_arg_dword(&mut self, index: usize, value: u32) -> Result<(), ContextError> {
        let slot = self.primitive_slot(index, 4, "a dword")?;
        self.stack.write(slot, value);
        Ok(())
    }

    pub fn set_arg_qword(&mut self, index: usize, value: u64) -> Result<(), ContextError> {
        let slot = self.primitive_slot(index, 8, "a qword")?;
        self.stack.write_u64(slot, value);
        Ok(())
    }

    pub fn set_arg_float(&mut self, index: usize, value: f32) -> Result<(), ContextError> {
        let (slot, ty) = self.arg_slot(index)?;
        if ty != DataType::FLOAT {
            return Err(ContextError::ArgTypeMismatch {
                index,
                expected: ty.to_string(),
            });
        }
        self.stack.write(slot, value.to_bits());
        Ok(())
    }

    pub fn set_arg_double(&mut self, index: usize, value: f64) -> Result<(), ContextError> {
        let (slot, ty) = self.arg_slot(index)?;
        if ty != DataType::DOUBLE {
            return Err(ContextError::ArgTypeMismatch {
                index,
                expected: ty.to_string(),
            });
        }
        self.stack.write_u64(slot, value.to_bits());
        Ok(())
    }

    /// Sets a reference argument.
    pub fn set_arg_address(&mut self, index: usize, address: Address) -> Result<(), ContextError> {
        let (slot, ty) = self.arg_slot(index)?;
        if !ty.is_reference {
            return Err(ContextError::ArgTypeMismatch {
                index,
                expected: ty.to_string(),
            });
        }
        self.stack.write_u64(slot, address.to_bits());
        Ok(())
    }

    /// Sets an object argument. Handles gain a reference; objects passed by
    /// value are copied. Either way the context owns what it stores.
    pub fn set_arg_object(&mut self, index: usize, object: Option<ObjectRef>) -> Result<(), ContextError> {
        let (slot, ty) = self.arg_slot(index)?;
        if !ty.is_object() || ty.is_reference {
            return Err(ContextError::ArgTypeMismatch {
                index,
                expected: ty.to_string(),
            });
        }
        let mut heap = self.engine.heap();
        if let Some(old) = self.stack.read_u64(slot).and_then(ObjectRef::from_bits) {
            heap.free(old);
        }
        let stored = match object {
            Some(object) if ty.is_handle => heap.add_ref(object).then_some(object),
            Some(object) => heap.duplicate(object),
            None => None,
        };
        drop(heap);
        self.stack.write_u64(slot, handle_bits(stored));
        Ok(())
    }

    /// Sets `this` for a method entry function, adding a reference.
    pub fn set_object(&mut self, object: Option<ObjectRef>) -> Result<(), ContextError> {
        if self.state != ContextState::Prepared {
            return Err(ContextError::NotPrepared);
        }
        let is_method = self.entry.as_ref().is_some_and(|f| f.object_type.is_some());
        if !is_method {
            return Err(ContextError::NotAMethod);
        }
        let mut heap = self.engine.heap();
        if let Some(old) = self.stack.read_u64(self.fp).and_then(ObjectRef::from_bits) {
            heap.release(old);
        }
        let stored = object.filter(|&o| heap.add_ref(o));
        drop(heap);
        self.stack.write_u64(self.fp, handle_bits(stored));
        Ok(())
    }

    // ========================================
    // Return values
    // ========================================

    fn primitive_return(&self) -> Option<u64> {
        let entry = self.entry.as_ref()?;
        let ty = entry.signature.return_type;
        (self.state == ContextState::Finished && !ty.is_object() && !ty.is_reference)
            .then_some(self.register)
    }

    pub fn return_byte(&self) -> u8 {
        self.primitive_return().unwrap_or(0) as u8
    }

    pub fn return_word(&self) -> u16 {
        self.primitive_return().unwrap_or(0) as u16
    }

    pub fn return_dword(&self) -> u32 {
        self.primitive_return().unwrap_or(0) as u32
    }

    pub fn return_qword(&self) -> u64 {
        self.primitive_return().unwrap_or(0)
    }

    pub fn return_float(&self) -> f32 {
        f32::from_bits(self.return_dword())
    }

    pub fn return_double(&self) -> f64 {
        f64::from_bits(self.return_qword())
    }

    /// The returned reference, for functions returning `T&`.
    pub fn return_address(&self) -> Address {
        let is_ref = self
            .entry
            .as_ref()
            .is_some_and(|f| f.signature.return_type.is_reference);
        if self.state != ContextState::Finished || !is_ref {
            return Address::Null;
        }
        Address::from_bits(self.register).unwrap_or(Address::Null)
    }

    /// The returned object; it stays owned by the context.
    pub fn return_object(&self) -> Option<ObjectRef> {
        if self.state != ContextState::Finished {
            return None;
        }
        self.object_register
    }

    /// Moves the returned object out of the context; the caller now owns
    /// its reference.
    pub fn take_return_object(&mut self) -> Option<ObjectRef> {
        if self.state != ContextState::Finished {
            return None;
        }
        self.object_register.take()
    }

    // ========================================
    // Exceptions
    // ========================================

    pub fn exception_info(&self) -> Option<&ScriptException> {
        self.exception.as_ref()
    }

    pub fn exception_string(&self) -> Option<&str> {
        self.exception.as_ref().map(|e| e.message.as_str())
    }

    pub fn exception_line(&self) -> Option<u32> {
        self.exception.as_ref().map(|e| e.line)
    }

    pub fn exception_column(&self) -> Option<u32> {
        self.exception.as_ref().map(|e| e.column)
    }

    pub fn exception_function(&self) -> Option<FunctionId> {
        self.exception.as_ref().map(|e| e.function)
    }

    /// Raises a script exception from inside a system function. It takes
    /// effect when the system function returns.
    pub fn set_exception(&mut self, message: impl Into<String>) -> Result<(), ContextError> {
        if self.system_call.is_none() {
            return Err(ContextError::NoSystemCall);
        }
        self.pending_exception = Some(message.into());
        Ok(())
    }

    /// Moves the context into the exception state.
    pub(super) fn raise(&mut self, fault: RuntimeFault) {
        debug_assert!(!self.in_cleanup, "exception raised during stack cleanup");
        let pc = self.pc.saturating_sub(1);
        let (function, function_name, (line, column)) = match &self.function {
            Some(f) => (f.id, f.name.clone(), f.line_at(pc).unwrap_or((0, 0))),
            None => (FunctionId::NONE, String::new(), (0, 0)),
        };
        debug!(fault = %fault, function = %function_name, line, "script exception");
        self.exception = Some(ScriptException {
            message: fault.to_string(),
            fault,
            function,
            function_name,
            line,
            column,
        });
        self.state = ContextState::Exception;

        if let Some(mut callback) = self.exception_callback.take() {
            callback(self);
            if self.exception_callback.is_none() {
                self.exception_callback = Some(callback);
            }
        }
    }

    // ========================================
    // Callbacks
    // ========================================

    /// Called at every `Suspend` instruction.
    pub fn set_line_callback(&mut self, callback: impl FnMut(&Context) + Send + 'static) {
        self.line_callback = Some(Box::new(callback));
    }

    pub fn clear_line_callback(&mut self) {
        self.line_callback = None;
    }

    /// Called when the context enters the exception state, before any
    /// cleanup.
    pub fn set_exception_callback(&mut self, callback: impl FnMut(&Context) + Send + 'static) {
        self.exception_callback = Some(Box::new(callback));
    }

    pub fn clear_exception_callback(&mut self) {
        self.exception_callback = None;
    }

    pub(super) fn invoke_line_callback(&mut self) {
        if let Some(mut callback) = self.line_callback.take() {
            callback(self);
            if self.line_callback.is_none() {
                self.line_callback = Some(callback);
            }
        }
    }

    // ========================================
    // Introspection
    // ========================================

    /// Number of saved caller frames; 0 while the entry function runs.
    pub fn call_stack_size(&self) -> usize {
        self.call_stack.len()
    }

    /// Function of saved frame `index`, counted from the outermost caller.
    pub fn call_stack_function(&self, index: usize) -> Option<&Arc<FunctionDescriptor>> {
        self.call_stack.get(index).map(|f| &f.function)
    }

    /// Line of the call made from saved frame `index`.
    pub fn call_stack_line(&self, index: usize) -> Option<u32> {
        let frame = self.call_stack.get(index)?;
        frame.function.line_at(frame.call_site()).map(|(line, _)| line)
    }

    pub fn current_function(&self) -> Option<&Arc<FunctionDescriptor>> {
        self.function.as_ref()
    }

    pub fn current_line(&self) -> Option<u32> {
        let function = self.function.as_ref()?;
        function
            .line_at(self.pc.saturating_sub(1))
            .map(|(line, _)| line)
    }

    /// The function currently running as a system call, if any.
    pub fn system_function(&self) -> Option<&Arc<FunctionDescriptor>> {
        self.system_call.as_ref()
    }

    /// Function and frame pointer at `level` (0 = current function).
    fn frame_at(&self, level: usize) -> Option<(&Arc<FunctionDescriptor>, StackPtr)> {
        if level == 0 {
            return Some((self.function.as_ref()?, self.fp));
        }
        let frame = self.call_stack.caller(level)?;
        Some((&frame.function, frame.frame_pointer))
    }

    pub fn var_count(&self, level: usize) -> Option<usize> {
        self.frame_at(level).map(|(f, _)| f.variables.len())
    }

    pub fn var_name(&self, index: usize, level: usize) -> Option<&str> {
        let (function, _) = self.frame_at(level)?;
        function.variables.get(index).map(|v| v.name.as_str())
    }

    pub fn var_type(&self, index: usize, level: usize) -> Option<DataType> {
        let (function, _) = self.frame_at(level)?;
        function.variables.get(index).map(|v| v.ty)
    }

    pub fn var_address(&self, index: usize, level: usize) -> Option<Address> {
        let (function, fp) = self.frame_at(level)?;
        let var = function.variables.get(index)?;
        fp.offset_by(-(var.offset as i64)).map(Address::Stack)
    }

    /// `this` of the method running at `level`.
    pub fn this_object(&self, level: usize) -> Option<ObjectRef> {
        let (function, fp) = self.frame_at(level)?;
        function.object_type?;
        self.stack.read_u64(fp).and_then(ObjectRef::from_bits)
    }

    pub fn this_type(&self, level: usize) -> Option<TypeId> {
        self.frame_at(level)?.0.object_type
    }

    /// Reads a dword variable by debug-info index; 0 if unavailable.
    pub fn var_dword(&self, index: usize, level: usize) -> u32 {
        match self.var_address(index, level) {
            Some(Address::Stack(ptr)) => self.stack.read(ptr).unwrap_or(0),
            _ => 0,
        }
    }

    /// Total words of stack memory currently allocated.
    pub fn stack_words(&self) -> u64 {
        self.stack.allocated_words()
    }

    // ========================================
    // Calls
    // ========================================

    /// Replaces the current module, moving one context reference.
    fn set_module(&mut self, module: Option<Arc<Module>>) {
        if let Some(new) = &module {
            new.add_context_ref();
        }
        if let Some(old) = std::mem::replace(&mut self.module, module) {
            old.release_context_ref();
        }
    }

    fn module_of(&self, function: &FunctionDescriptor) -> Option<Arc<Module>> {
        let id = function.module?;
        match &self.module {
            Some(m) if m.id() == id => Some(Arc::clone(m)),
            _ => self.engine.module_by_id(id),
        }
    }

    fn zero_object_variables(&mut self, function: &FunctionDescriptor) {
        for var in &function.object_variables {
            if let Some(ptr) = self.fp.offset_by(-(var.offset as i64)) {
                self.stack.write_u64(ptr, 0);
            }
        }
    }

    /// Enters a script function whose arguments are on top of the stack.
    pub(super) fn call_script_function(&mut self, callee: Arc<FunctionDescriptor>) -> Result<(), RuntimeFault> {
        let arg_words = callee.arg_words();
        let needed = callee.stack_needed + RESERVE_STACK;
        let caller_block = self.stack.current_block();
        let new_sp = self.stack.grow(self.sp, needed, arg_words)?;
        if new_sp != self.sp {
            self.stack
                .copy_words(self.sp, new_sp, arg_words)
                .ok_or(RuntimeFault::StackOverflow)?;
        }

        let caller = self.function.take().ok_or(RuntimeFault::UnrecognizedBytecode)?;
        let module = self.module_of(&callee);
        if let Some(m) = &module {
            m.add_context_ref();
        }
        // The caller's module reference moves into the frame.
        let caller_module = std::mem::replace(&mut self.module, module);
        self.call_stack.push(CallFrame {
            frame_pointer: self.fp,
            function: caller,
            program_counter: self.pc,
            stack_pointer: self.sp,
            stack_index: caller_block,
            module: caller_module,
        });

        self.fp = new_sp;
        self.sp = new_sp
            .offset_by(-(callee.variable_space as i64))
            .ok_or(RuntimeFault::StackOverflow)?;
        self.zero_object_variables(&callee);
        self.pc = 0;
        trace!(function = %callee.name, depth = self.call_stack.len(), "call");
        self.function = Some(callee);
        Ok(())
    }

    /// Returns to the caller, discarding `arg_words` argument words.
    /// Returns false when the call stack was empty.
    pub(super) fn return_from_function(&mut self, arg_words: u32) -> Result<bool, RuntimeFault> {
        let Some(frame) = self.call_stack.pop() else {
            return Ok(false);
        };
        self.restore_frame(frame);
        self.sp = self
            .sp
            .offset_by(arg_words as i64)
            .ok_or(RuntimeFault::UnrecognizedBytecode)?;
        trace!(depth = self.call_stack.len(), "return");
        Ok(true)
    }

    fn restore_frame(&mut self, frame: CallFrame) {
        if let Some(current) = std::mem::replace(&mut self.module, frame.module) {
            current.release_context_ref();
        }
        self.fp = frame.frame_pointer;
        self.function = Some(frame.function);
        self.pc = frame.program_counter;
        self.sp = frame.stack_pointer;
        self.stack.set_current_block(frame.stack_index);
    }

    /// Finds the implementation of a virtual or interface method for the
    /// object's type.
    pub(super) fn resolve_method(
        &self,
        declared: &FunctionDescriptor,
        object: ObjectRef,
    ) -> Option<Arc<FunctionDescriptor>> {
        let ty = Arc::clone(self.engine.heap().get(object)?.object_type());
        let real = match declared.kind {
            FunctionKind::Virtual => {
                let index = declared.vtable_index? as usize;
                self.engine.function(*ty.virtual_table.get(index)?)?
            }
            FunctionKind::Interface => {
                let method = ty
                    .methods
                    .iter()
                    .filter_map(|&id| self.engine.function(id))
                    .find(|f| f.signature_id == declared.signature_id)?;
                match method.vtable_index {
                    Some(index) if method.kind == FunctionKind::Virtual => {
                        self.engine.function(*ty.virtual_table.get(index as usize)?)?
                    }
                    _ => method,
                }
            }
            _ => return None,
        };
        (real.signature_id == declared.signature_id).then_some(real)
    }

    /// Calls a host function with its arguments at the stack pointer.
    ///
    /// For methods, `this` is read from the stack unless `explicit_this` is
    /// given. By-value object arguments are released afterwards. Returns the
    /// number of argument words the caller must pop.
    pub(super) fn call_system_function(
        &mut self,
        function: &Arc<FunctionDescriptor>,
        explicit_this: Option<ObjectRef>,
    ) -> Result<u32, RuntimeFault> {
        let host = self
            .engine
            .system_function(function.id)
            .ok_or(RuntimeFault::UnboundFunction)?;
        let mut args = self.sp;
        let mut popped = function.signature.param_words();
        let object = match explicit_this {
            Some(object) => Some(object),
            None if function.object_type.is_some() => {
                let object = self
                    .stack
                    .read_u64(self.sp)
                    .and_then(ObjectRef::from_bits)
                    .ok_or(RuntimeFault::NullPointerAccess)?;
                args = self
                    .sp
                    .offset_by(PTR_SIZE as i64)
                    .ok_or(RuntimeFault::UnrecognizedBytecode)?;
                popped += PTR_SIZE;
                Some(object)
            }
            None => None,
        };

        self.system_call = Some(Arc::clone(function));
        self.pending_exception = None;
        let result = {
            let mut call = SystemCall::new(self, function, args, object);
            host(&mut call)
        };
        self.system_call = None;
        self.release_owned_args(function, args, 0);

        match (result, self.pending_exception.take()) {
            (Err(message), _) | (Ok(()), Some(message)) => Err(RuntimeFault::Host(message)),
            (Ok(()), None) => Ok(popped),
        }
    }

    /// Frees by-value object parameters of `function` stored at `args`.
    /// `this_words` is the distance from `args` to the first parameter.
    fn release_owned_args(&mut self, function: &FunctionDescriptor, args: StackPtr, this_words: u32) {
        let mut offset = this_words;
        for param in &function.signature.params {
            let words = param.ty.stack_words();
            if param.is_owned_object() {
                if let Some(slot) = args.offset_by(offset as i64) {
                    if let Some(object) = self.stack.read_u64(slot).and_then(ObjectRef::from_bits) {
                        self.engine.heap().free(object);
                        self.stack.write_u64(slot, 0);
                    }
                }
            }
            offset += words;
        }
    }

    // ========================================
    // Cleanup
    // ========================================

    /// Releases object locals and owned arguments of every frame, innermost
    /// first, popping the call stack.
    fn clean_stack(&mut self) {
        if self.in_cleanup {
            return;
        }
        self.in_cleanup = true;
        self.clean_frame();
        while let Some(frame) = self.call_stack.pop() {
            self.restore_frame(frame);
            self.clean_frame();
        }
        self.in_cleanup = false;
        self.needs_cleanup = false;
    }

    fn clean_frame(&mut self) {
        let Some(function) = self.function.clone() else {
            return;
        };
        for var in &function.object_variables {
            let Some(slot) = self.fp.offset_by(-(var.offset as i64)) else {
                continue;
            };
            if let Some(object) = self.stack.read_u64(slot).and_then(ObjectRef::from_bits) {
                self.engine.heap().free(object);
                self.stack.write_u64(slot, 0);
            }
        }
        if function.dont_clean_up_on_exception {
            return;
        }
        if function.object_type.is_some() {
            if let Some(object) = self.stack.read_u64(self.fp).and_then(ObjectRef::from_bits) {
                let mut heap = self.engine.heap();
                if heap.get(object).is_some_and(|o| o.object_type().flags.ref_counted) {
                    heap.release(object);
                }
                drop(heap);
                self.stack.write_u64(self.fp, 0);
            }
        }
        self.release_owned_args(&function, self.fp, function.this_words());
    }

    // ========================================
    // Memory
    // ========================================

    pub(crate) fn load_word(&self, address: Address) -> Result<u32, RuntimeFault> {
        let value = match address {
            Address::Stack(ptr) => self.stack.read(ptr),
            Address::Global { module, offset } => match &self.module {
                Some(m) if m.id() == module => m.read_global_word(offset),
                _ => self
                    .engine
                    .module_by_id(module)
                    .and_then(|m| m.read_global_word(offset)),
            },
            Address::Field {
                index,
                generation,
                offset,
            } => self
                .engine
                .heap()
                .field_mut(index, generation, offset)
                .map(|w| *w),
            Address::Null | Address::Str { .. } => None,
        };
        value.ok_or(RuntimeFault::NullPointerAccess)
    }

    pub(crate) fn store_word(&mut self, address: Address, value: u32) -> Result<(), RuntimeFault> {
        let stored = match address {
            Address::Stack(ptr) => self.stack.write(ptr, value),
            Address::Global { module, offset } => match &self.module {
                Some(m) if m.id() == module => m.write_global_word(offset, value),
                _ => self
                    .engine
                    .module_by_id(module)
                    .and_then(|m| m.write_global_word(offset, value)),
            },
            Address::Field {
                index,
                generation,
                offset,
            } => self
                .engine
                .heap()
                .field_mut(index, generation, offset)
                .map(|w| *w = value),
            Address::Null | Address::Str { .. } => None,
        };
        stored.ok_or(RuntimeFault::NullPointerAccess)
    }

    pub(crate) fn load_qword(&self, address: Address) -> Result<u64, RuntimeFault> {
        let hi = address.add_words(1).ok_or(RuntimeFault::NullPointerAccess)?;
        Ok(self.load_word(address)? as u64 | ((self.load_word(hi)? as u64) << 32))
    }

    pub(crate) fn store_qword(&mut self, address: Address, value: u64) -> Result<(), RuntimeFault> {
        let hi = address.add_words(1).ok_or(RuntimeFault::NullPointerAccess)?;
        self.store_word(address, value as u32)?;
        self.store_word(hi, (value >> 32) as u32)
    }

    /// Constant string behind an `Address::Str`.
    pub(crate) fn constant_string(&self, address: Address) -> Option<String> {
        let Address::Str { module, index } = address else {
            return None;
        };
        let module = match &self.module {
            Some(m) if m.id() == module => Arc::clone(m),
            _ => self.engine.module_by_id(module)?,
        };
        module.constant_string(index as usize).map(str::to_string)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.state != ContextState::Uninitialized {
            self.release_execution();
        }
    }
}
