use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectType};

/// Compiled function: its bytecode chunk plus the call metadata the VM
/// checks at dispatch time. The synthetic top-level script has an empty
/// name and arity zero.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: String,
}

impl ObjectFunction {
    pub fn new(arity: u8, name: String) -> Self {
        ObjectFunction {
            object: Object::new(ObjectType::ObjFunction),
            arity,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}
