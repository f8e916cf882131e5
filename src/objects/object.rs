use std::mem::size_of;

use super::object_bound_method::ObjectBoundMethod;
use super::object_class::ObjectClass;
use super::object_closure::ObjectClosure;
use super::object_function::ObjectFunction;
use super::object_instance::ObjectInstance;
use super::object_native::ObjectNative;
use super::object_string::ObjectString;
use super::object_upvalue::ObjectUpvalue;
use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    ObjString,
    ObjFunction,
    ObjNative,
    ObjClosure,
    ObjUpvalue,
    ObjClass,
    ObjInstance,
    ObjBoundMethod,
}

/// Common header embedded as the first field of every heap object:
/// kind tag, GC mark bit, and the intrusive link in the all-objects chain.
#[repr(C)]
pub struct Object {
    pub obj_type: ObjectType,
    pub is_marked: bool,
    pub next: *mut Object,
}

impl Object {
    pub fn new(obj_type: ObjectType) -> Self {
        Object {
            obj_type,
            is_marked: false,
            next: std::ptr::null_mut(),
        }
    }
}

/// Host callable registered into the globals table at VM start-up.
pub trait NativeObject {
    fn call(&self, args: &[Value]) -> Result<Value, String>;
}

// Downcast helpers. Safety: the header is the first field of each concrete
// object struct (#[repr(C)]), so a header pointer is a pointer to the whole
// object once the kind tag has been checked.
impl Object {
    #[inline]
    pub unsafe fn as_string(&self) -> &ObjectString {
        debug_assert!(self.obj_type == ObjectType::ObjString);
        &*(self as *const _ as *const ObjectString)
    }

    #[inline]
    pub unsafe fn as_function(&self) -> &ObjectFunction {
        debug_assert!(self.obj_type == ObjectType::ObjFunction);
        &*(self as *const _ as *const ObjectFunction)
    }

    #[inline]
    pub unsafe fn as_native(&self) -> &ObjectNative {
        debug_assert!(self.obj_type == ObjectType::ObjNative);
        &*(self as *const _ as *const ObjectNative)
    }

    #[inline]
    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        debug_assert!(self.obj_type == ObjectType::ObjClosure);
        &*(self as *const _ as *const ObjectClosure)
    }

    #[inline]
    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        debug_assert!(self.obj_type == ObjectType::ObjUpvalue);
        &*(self as *const _ as *const ObjectUpvalue)
    }

    #[inline]
    pub unsafe fn as_class(&self) -> &ObjectClass {
        debug_assert!(self.obj_type == ObjectType::ObjClass);
        &*(self as *const _ as *const ObjectClass)
    }

    #[inline]
    pub unsafe fn as_instance(&self) -> &ObjectInstance {
        debug_assert!(self.obj_type == ObjectType::ObjInstance);
        &*(self as *const _ as *const ObjectInstance)
    }

    #[inline]
    pub unsafe fn as_bound_method(&self) -> &ObjectBoundMethod {
        debug_assert!(self.obj_type == ObjectType::ObjBoundMethod);
        &*(self as *const _ as *const ObjectBoundMethod)
    }

    /// Deep size of the concrete object this header belongs to.
    /// Safety: `self` must be embedded at the start of the concrete object.
    pub unsafe fn deep_size(&self) -> usize {
        match self.obj_type {
            ObjectType::ObjString => self.as_string().deep_size(),
            ObjectType::ObjFunction => self.as_function().deep_size(),
            ObjectType::ObjNative => self.as_native().deep_size(),
            ObjectType::ObjClosure => self.as_closure().deep_size(),
            ObjectType::ObjUpvalue => self.as_upvalue().deep_size(),
            ObjectType::ObjClass => self.as_class().deep_size(),
            ObjectType::ObjInstance => self.as_instance().deep_size(),
            ObjectType::ObjBoundMethod => self.as_bound_method().deep_size(),
        }
    }
}

/// Heap usage of a GC-managed structure. Deep sizes include owned
/// allocations but never traverse into other GC objects.
pub trait GcSize {
    fn shallow_size(&self) -> usize;
    fn deep_size(&self) -> usize;
}

impl GcSize for ObjectString {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectString>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.content.capacity()
    }
}

impl GcSize for ObjectFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectFunction>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity() + self.chunk.deep_size()
    }
}

impl GcSize for ObjectNative {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectNative>()
    }

    fn deep_size(&self) -> usize {
        // The boxed callable's internals are opaque; count the name only.
        self.shallow_size() + self.name.capacity()
    }
}

impl GcSize for ObjectClosure {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClosure>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
    }
}

impl GcSize for ObjectUpvalue {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectUpvalue>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}

impl GcSize for ObjectClass {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClass>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.methods.deep_size()
    }
}

impl GcSize for ObjectInstance {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectInstance>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size() + self.fields.deep_size()
    }
}

impl GcSize for ObjectBoundMethod {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectBoundMethod>()
    }

    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}
