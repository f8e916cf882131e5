use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;

/// Per-invocation record: the executing closure, a byte cursor into its
/// function's chunk, and the index of the frame's first value-stack slot
/// (slot zero holds the callee, or the receiver for methods).
pub struct CallFrame {
    pub closure: *mut ObjectClosure,
    pub ip: usize,
    pub slot_base: usize,
}

impl CallFrame {
    pub fn new(closure: *mut ObjectClosure, slot_base: usize) -> Self {
        CallFrame {
            closure,
            ip: 0,
            slot_base,
        }
    }

    #[inline(always)]
    pub fn function(&self) -> &ObjectFunction {
        unsafe { &*(*self.closure).function }
    }
}
