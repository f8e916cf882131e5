use crate::objects::object::{Object, ObjectType};
use crate::objects::object_class::ObjectClass;
use crate::table::Table;

#[repr(C)]
pub struct ObjectInstance {
    pub object: Object,
    pub class: *mut ObjectClass,
    pub fields: Table,
}

impl ObjectInstance {
    pub fn new(class: *mut ObjectClass) -> Self {
        ObjectInstance {
            object: Object::new(ObjectType::ObjInstance),
            class,
            fields: Table::new(),
        }
    }
}
