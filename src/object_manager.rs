use crate::gc::gc_trace;
use crate::memory::{GC_HEAP_GROW_FACTOR, GC_INITIAL_THRESHOLD};
use crate::objects::object::{GcSize, NativeObject, Object, ObjectType};
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_native::ObjectNative;
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::table::Table;
use crate::value::Value;

/// The single allocation choke point. Every heap object is created here,
/// linked into the intrusive all-objects chain, and accounted against the
/// collection threshold. Sweeping unlinks and frees through here as well,
/// so each object is owned by the chain exactly once.
pub struct ObjectManager {
    objects: *mut Object,
    bytes_allocated: usize,
    next_gc: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        ObjectManager {
            objects: std::ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
        }
    }

    fn track<T: GcSize>(&mut self, object: Box<T>) -> *mut T {
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        let header = ptr as *mut Object;
        unsafe {
            (*header).next = self.objects;
        }
        self.objects = header;
        self.bytes_allocated += size;
        gc_trace!("alloc {:p} {} bytes, type {:?}", header, size, unsafe {
            (*header).obj_type
        });
        ptr
    }

    pub fn alloc_string(&mut self, content: &str, hash: u32) -> *mut ObjectString {
        self.track(Box::new(ObjectString::new(content, hash)))
    }

    pub fn alloc_function(&mut self, arity: u8, name: String) -> *mut ObjectFunction {
        self.track(Box::new(ObjectFunction::new(arity, name)))
    }

    pub fn alloc_native(
        &mut self,
        name: String,
        arity: u8,
        native: impl NativeObject + 'static,
    ) -> *mut ObjectNative {
        self.track(Box::new(ObjectNative::new(name, arity, native)))
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> *mut ObjectClosure {
        self.track(Box::new(ObjectClosure::new(function)))
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> *mut ObjectUpvalue {
        self.track(Box::new(ObjectUpvalue::new(location)))
    }

    pub fn alloc_class(&mut self, name: *mut ObjectString) -> *mut ObjectClass {
        self.track(Box::new(ObjectClass::new(name)))
    }

    pub fn alloc_instance(&mut self, class: *mut ObjectClass) -> *mut ObjectInstance {
        self.track(Box::new(ObjectInstance::new(class)))
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjectClosure,
    ) -> *mut ObjectBoundMethod {
        self.track(Box::new(ObjectBoundMethod::new(receiver, method)))
    }

    /// The reallocate-style accounting step: every resize of an owned
    /// array reports its before/after size here, so container growth
    /// counts toward the collection threshold like any other allocation.
    pub fn account(&mut self, old_size: usize, new_size: usize) {
        if new_size >= old_size {
            self.bytes_allocated += new_size - old_size;
        } else {
            self.bytes_allocated = self.bytes_allocated.saturating_sub(old_size - new_size);
        }
    }

    /// Table insert with its entry-array growth accounted.
    pub fn set_entry(&mut self, table: &mut Table, key: *mut ObjectString, value: Value) -> bool {
        let before = table.deep_size();
        let is_new_key = table.set(key, value);
        let after = table.deep_size();
        self.account(before, after);
        is_new_key
    }

    /// Bulk table copy with the destination's growth accounted.
    pub fn copy_entries(&mut self, from: &Table, to: &mut Table) {
        let before = to.deep_size();
        from.add_all(to);
        let after = to.deep_size();
        self.account(before, after);
    }

    /// True once the live-byte estimate passes the threshold. Under
    /// `gc_stress` every allocation is a trigger.
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "gc_stress") || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Frees every unmarked object, unlinking it from the chain, and clears
    /// the mark on survivors. Returns the bytes released.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut previous: *mut Object = std::ptr::null_mut();
        let mut object = self.objects;

        unsafe {
            while !object.is_null() {
                if (*object).is_marked {
                    (*object).is_marked = false;
                    previous = object;
                    object = (*object).next;
                } else {
                    let unreached = object;
                    object = (*object).next;
                    if previous.is_null() {
                        self.objects = object;
                    } else {
                        (*previous).next = object;
                    }
                    freed += Self::free_object(unreached);
                }
            }
        }

        gc_trace!("sweep freed {} bytes", freed);
        freed
    }

    /// Updates accounting after a collection and doubles the threshold.
    /// Returns the new threshold.
    pub fn finish_cycle(&mut self, freed: usize) -> usize {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_INITIAL_THRESHOLD);
        self.next_gc
    }

    /// Number of objects currently in the chain.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut object = self.objects;
        while !object.is_null() {
            count += 1;
            object = unsafe { (*object).next };
        }
        count
    }

    unsafe fn free_object(object: *mut Object) -> usize {
        let size = (*object).deep_size();
        gc_trace!("free {:p} {} bytes, type {:?}", object, size, (*object).obj_type);
        match (*object).obj_type {
            ObjectType::ObjString => drop(Box::from_raw(object as *mut ObjectString)),
            ObjectType::ObjFunction => drop(Box::from_raw(object as *mut ObjectFunction)),
            ObjectType::ObjNative => drop(Box::from_raw(object as *mut ObjectNative)),
            ObjectType::ObjClosure => drop(Box::from_raw(object as *mut ObjectClosure)),
            ObjectType::ObjUpvalue => drop(Box::from_raw(object as *mut ObjectUpvalue)),
            ObjectType::ObjClass => drop(Box::from_raw(object as *mut ObjectClass)),
            ObjectType::ObjInstance => drop(Box::from_raw(object as *mut ObjectInstance)),
            ObjectType::ObjBoundMethod => drop(Box::from_raw(object as *mut ObjectBoundMethod)),
        }
        size
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        let mut object = self.objects;
        unsafe {
            while !object.is_null() {
                let next = (*object).next;
                Self::free_object(object);
                object = next;
            }
        }
        self.objects = std::ptr::null_mut();
    }
}
