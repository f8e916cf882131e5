use crate::objects::object::{NativeObject, Object, ObjectType};
use crate::value::Value;

/// Host function registered under a global name. Arity is validated by the
/// call protocol before `invoke` runs.
#[repr(C)]
pub struct ObjectNative {
    pub object: Object,
    pub name: String,
    pub arity: u8,
    native: Box<dyn NativeObject>,
}

impl ObjectNative {
    pub fn new(name: String, arity: u8, native: impl NativeObject + 'static) -> Self {
        ObjectNative {
            object: Object::new(ObjectType::ObjNative),
            name,
            arity,
            native: Box::new(native),
        }
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Value, String> {
        self.native.call(args)
    }
}
