use crate::objects::object::{Object, ObjectType};
use crate::objects::object_string::ObjectString;
use crate::table::Table;

/// Class: name plus its method table. Inheritance copies the superclass
/// methods in at declaration time, so lookup never walks a parent chain.
#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: *mut ObjectString,
    pub methods: Table,
}

impl ObjectClass {
    pub fn new(name: *mut ObjectString) -> Self {
        ObjectClass {
            object: Object::new(ObjectType::ObjClass),
            name,
            methods: Table::new(),
        }
    }
}
