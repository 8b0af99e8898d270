//! Host (system) functions and the view they get of the calling context.

use std::sync::Arc;

use parking_lot::MutexGuard;

use super::address::Address;
use super::context::Context;
use super::engine::Engine;
use super::error::ContextError;
use super::function::FunctionDescriptor;
use super::heap::{ObjectHeap, ObjectRef};
use super::stack::StackPtr;

/// A host function. Returning `Err` raises a script exception with that
/// message, attributed to the calling script function.
pub type SystemFunction = Arc<dyn Fn(&mut SystemCall<'_>) -> Result<(), String> + Send + Sync>;

/// Arguments, `this` and return slots of one system function invocation.
///
/// Argument readers return 0 (or null) for indices or types that do not
/// match the declaration.
pub struct SystemCall<'a> {
    ctx: &'a mut Context,
    function: &'a FunctionDescriptor,
    args: StackPtr,
    object: Option<ObjectRef>,
}

impl<'a> SystemCall<'a> {
    pub(super) fn new(
        ctx: &'a mut Context,
        function: &'a FunctionDescriptor,
        args: StackPtr,
        object: Option<ObjectRef>,
    ) -> Self {
        Self {
            ctx,
            function,
            args,
            object,
        }
    }

    pub fn function(&self) -> &FunctionDescriptor {
        self.function
    }

    pub fn arg_count(&self) -> usize {
        self.function.signature.params.len()
    }

    fn arg_slot(&self, index: usize) -> Option<StackPtr> {
        let offset = self.function.param_offset(index)? - self.function.this_words();
        self.args.offset_by(offset as i64)
    }

    pub fn arg_dword(&self, index: usize) -> u32 {
        self.arg_slot(index)
            .and_then(|slot| self.ctx.stack.read(slot))
            .unwrap_or(0)
    }

    pub fn arg_int(&self, index: usize) -> i32 {
        self.arg_dword(index) as i32
    }

    pub fn arg_bool(&self, index: usize) -> bool {
        self.arg_dword(index) & 0xff != 0
    }

    pub fn arg_float(&self, index: usize) -> f32 {
        f32::from_bits(self.arg_dword(index))
    }

    pub fn arg_qword(&self, index: usize) -> u64 {
        self.arg_slot(index)
            .and_then(|slot| self.ctx.stack.read_u64(slot))
            .unwrap_or(0)
    }

    pub fn arg_int64(&self, index: usize) -> i64 {
        self.arg_qword(index) as i64
    }

    pub fn arg_double(&self, index: usize) -> f64 {
        f64::from_bits(self.arg_qword(index))
    }

    pub fn arg_address(&self, index: usize) -> Address {
        Address::from_bits(self.arg_qword(index)).unwrap_or(Address::Null)
    }

    /// Object argument. By-value objects are released once the function
    /// returns; add a reference to keep one.
    pub fn arg_object(&self, index: usize) -> Option<ObjectRef> {
        ObjectRef::from_bits(self.arg_qword(index))
    }

    /// The object a method was called on.
    pub fn this(&self) -> Option<ObjectRef> {
        self.object
    }

    pub fn set_return_dword(&mut self, value: u32) {
        self.ctx.register = value as u64;
    }

    pub fn set_return_int(&mut self, value: i32) {
        self.set_return_dword(value as u32);
    }

    pub fn set_return_bool(&mut self, value: bool) {
        self.set_return_dword(value as u32);
    }

    pub fn set_return_float(&mut self, value: f32) {
        self.set_return_dword(value.to_bits());
    }

    pub fn set_return_qword(&mut self, value: u64) {
        self.ctx.register = value;
    }

    pub fn set_return_int64(&mut self, value: i64) {
        self.set_return_qword(value as u64);
    }

    pub fn set_return_double(&mut self, value: f64) {
        self.set_return_qword(value.to_bits());
    }

    pub fn set_return_address(&mut self, address: Address) {
        self.set_return_qword(address.to_bits());
    }

    /// Returns an object; the caller receives the reference held by
    /// `object`.
    pub fn set_return_object(&mut self, object: Option<ObjectRef>) {
        self.ctx.object_register = object;
    }

    pub fn read_dword(&self, address: Address) -> Option<u32> {
        self.ctx.load_word(address).ok()
    }

    pub fn write_dword(&mut self, address: Address, value: u32) -> Option<()> {
        self.ctx.store_word(address, value).ok()
    }

    pub fn read_qword(&self, address: Address) -> Option<u64> {
        self.ctx.load_qword(address).ok()
    }

    pub fn write_qword(&mut self, address: Address, value: u64) -> Option<()> {
        self.ctx.store_qword(address, value).ok()
    }

    /// The constant string behind an address pushed by `Str`.
    pub fn string(&self, address: Address) -> Option<String> {
        self.ctx.constant_string(address)
    }

    /// Locks the engine heap. Release the guard before running nested
    /// contexts.
    pub fn heap(&self) -> MutexGuard<'_, ObjectHeap> {
        self.ctx.engine.heap()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.ctx.engine
    }

    pub fn context(&self) -> &Context {
        self.ctx
    }

    /// Raises a script exception once this function returns.
    pub fn set_exception(&mut self, message: impl Into<String>) -> Result<(), ContextError> {
        self.ctx.set_exception(message)
    }

    /// Requests suspension right after this call returns.
    pub fn suspend(&self) {
        self.ctx.suspend();
    }
}
