use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

/// Indirection cell for a captured variable. While open, `location` points
/// at the live stack slot and `next` links the VM's open-upvalue list in
/// descending slot-address order. Closing copies the slot into `closed`
/// and repoints `location` at it.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
    pub next: *mut ObjectUpvalue,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value) -> Self {
        ObjectUpvalue {
            object: Object::new(ObjectType::ObjUpvalue),
            location,
            closed: make_nil_value(),
            next: std::ptr::null_mut(),
        }
    }
}
