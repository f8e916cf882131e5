use crate::objects::object::{Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::value::Value;

/// A method closure paired with the receiver it was accessed through, so
/// the pair can be called later with `this` already in place.
#[repr(C)]
pub struct ObjectBoundMethod {
    pub object: Object,
    pub receiver: Value,
    pub method: *mut ObjectClosure,
}

impl ObjectBoundMethod {
    pub fn new(receiver: Value, method: *mut ObjectClosure) -> Self {
        ObjectBoundMethod {
            object: Object::new(ObjectType::ObjBoundMethod),
            receiver,
            method,
        }
    }
}
