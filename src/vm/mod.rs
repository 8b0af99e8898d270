//! The execution core: engine, modules, contexts and the interpreter.

pub mod address;
pub mod bytecode;
pub mod callstack;
pub mod context;
pub mod engine;
pub mod error;
pub mod function;
pub mod heap;
pub mod image;
mod interpreter;
pub mod module;
pub mod ops;
pub mod stack;
pub mod system;
pub mod types;
pub mod verifier;

pub use address::Address;
pub use callstack::{CallFrame, CallFrameStack};
pub use context::{
    Context, ContextState, ExecutionOutcome, InterruptHandle, RESERVE_STACK, ScriptException,
};
pub use engine::Engine;
pub use error::{ContextError, ModuleError, RuntimeFault};
pub use function::{FunctionBuilder, FunctionDescriptor, FunctionId, FunctionKind, LineTable};
pub use heap::{ObjectHeap, ObjectRef, ScriptObject};
pub use module::{Module, ModuleBuilder, ModuleId};
pub use ops::Op;
pub use stack::{StackAllocator, StackPtr};
pub use system::{SystemCall, SystemFunction};
pub use types::{DataType, ObjectType, Parameter, Primitive, Signature, TypeBehaviour, TypeId};
