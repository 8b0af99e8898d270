//! Saved caller state for nested script calls.

use std::sync::Arc;

use super::function::FunctionDescriptor;
use super::module::Module;
use super::stack::StackPtr;

/// State of the caller at the moment of a script call.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub frame_pointer: StackPtr,
    pub function: Arc<FunctionDescriptor>,
    /// Instruction to resume at after the callee returns.
    pub program_counter: usize,
    /// Stack pointer at the call, still covering the pushed arguments.
    pub stack_pointer: StackPtr,
    pub stack_index: usize,
    pub module: Option<Arc<Module>>,
}

impl CallFrame {
    /// Instruction that made the call.
    pub fn call_site(&self) -> usize {
        self.program_counter.saturating_sub(1)
    }
}

/// LIFO of call frames; frame 0 is the outermost caller.
#[derive(Debug, Default)]
pub struct CallFrameStack {
    frames: Vec<CallFrame>,
}

impl CallFrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: CallFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Frame by index from the outermost caller.
    pub fn get(&self, index: usize) -> Option<&CallFrame> {
        self.frames.get(index)
    }

    /// Frame `level` steps above the current function (1 = direct caller).
    pub fn caller(&self, level: usize) -> Option<&CallFrame> {
        let index = self.frames.len().checked_sub(level)?;
        self.frames.get(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CallFrame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::function::FunctionBuilder;

    fn frame(name: &str, pc: usize) -> CallFrame {
        CallFrame {
            frame_pointer: StackPtr::default(),
            function: Arc::new(FunctionBuilder::script(name).build()),
            program_counter: pc,
            stack_pointer: StackPtr::default(),
            stack_index: 0,
            module: None,
        }
    }

    #[test]
    fn test_push_pop_balance() {
        let mut stack = CallFrameStack::new();
        stack.push(frame("f", 3));
        stack.push(frame("g", 5));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap().function.name, "g");
        assert_eq!(stack.pop().unwrap().function.name, "f");
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_caller_levels() {
        let mut stack = CallFrameStack::new();
        stack.push(frame("f", 3));
        stack.push(frame("g", 5));
        assert_eq!(stack.caller(1).unwrap().function.name, "g");
        assert_eq!(stack.caller(2).unwrap().function.name, "f");
        assert!(stack.caller(3).is_none());
        assert_eq!(stack.get(0).unwrap().call_site(), 2);
    }
}
