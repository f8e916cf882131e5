use crate::objects::object::{Object, ObjectType};
use crate::table::Table;
use crate::value::{as_object, is_object, Value};

// Event log compiled in only with the gc_debug feature.
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {}; }
pub(crate) use gc_trace;

/// Lifetime collection counters: how many cycles have run, how much they
/// reclaimed in total, the largest heap any cycle started from, and what
/// the most recent cycle left alive.
#[derive(Default, Debug, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub bytes_freed: usize,
    pub peak_heap_bytes: usize,
    pub last_survived_bytes: usize,
}

impl GcStats {
    fn record(&mut self, before: usize, freed: usize, survived: usize) {
        self.cycles += 1;
        self.bytes_freed += freed;
        self.peak_heap_bytes = self.peak_heap_bytes.max(before);
        self.last_survived_bytes = survived;
    }
}

/// Mark phase driver. Marked-but-untraced objects sit on the explicit gray
/// worklist; `trace_references` drains it, blackening one object at a time.
/// Mark bits live in the object headers, so a second mark of the same
/// object is a no-op and cycles terminate.
pub struct GarbageCollector {
    gray_stack: Vec<*mut Object>,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        GarbageCollector {
            gray_stack: Vec::new(),
            stats: GcStats::default(),
        }
    }

    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).is_marked {
                return;
            }
            (*object).is_marked = true;
        }
        gc_trace!("mark {:p} type {:?}", object, unsafe { (*object).obj_type });
        self.gray_stack.push(object);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if is_object(value) {
            self.mark_object(as_object(value));
        }
    }

    /// Marks every key string and value of a table.
    pub fn mark_table(&mut self, table: &Table) {
        for entry in table.entries() {
            if !entry.key.is_null() {
                self.mark_object(entry.key as *mut Object);
            }
            self.mark_value(&entry.value);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(object) = self.gray_stack.pop() {
            unsafe {
                self.blacken_object(object);
            }
        }
    }

    unsafe fn blacken_object(&mut self, object: *mut Object) {
        gc_trace!("blacken {:p} type {:?}", object, (*object).obj_type);
        match (*object).obj_type {
            // No outgoing references.
            ObjectType::ObjString | ObjectType::ObjNative => {}
            ObjectType::ObjFunction => {
                let function = (*object).as_function();
                for constant in &function.chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjectType::ObjClosure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectType::ObjUpvalue => {
                // `closed` is nil until the upvalue closes, so this is safe
                // for open upvalues too.
                let upvalue = (*object).as_upvalue();
                self.mark_value(&upvalue.closed);
            }
            ObjectType::ObjClass => {
                let class = (*object).as_class();
                self.mark_object(class.name as *mut Object);
                self.mark_table(&class.methods);
            }
            ObjectType::ObjInstance => {
                let instance = (*object).as_instance();
                self.mark_object(instance.class as *mut Object);
                self.mark_table(&instance.fields);
            }
            ObjectType::ObjBoundMethod => {
                let bound = (*object).as_bound_method();
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method as *mut Object);
            }
        }
    }

    pub fn record_cycle(&mut self, before: usize, freed: usize, survived: usize) {
        self.stats.record(before, freed, survived);
        gc_trace!(
            "cycle {}: {} -> {} bytes, {} freed",
            self.stats.cycles,
            before,
            survived,
            freed
        );
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_manager::ObjectManager;
    use crate::objects::object_string::hash_string;
    use crate::value::{make_nil_value, make_object_value};

    #[test]
    fn sweep_collects_unreachable_objects() {
        let mut object_manager = ObjectManager::new();
        let keep = object_manager.alloc_string("keep", hash_string("keep"));
        object_manager.alloc_string("drop1", hash_string("drop1"));
        object_manager.alloc_string("drop2", hash_string("drop2"));

        let mut gc = GarbageCollector::new();
        gc.mark_value(&make_object_value(keep as *mut Object));
        gc.trace_references();
        let freed = object_manager.sweep();

        assert!(freed > 0);
        assert_eq!(object_manager.object_count(), 1);
    }

    #[test]
    fn closures_keep_their_function_and_upvalues_alive() {
        let mut object_manager = ObjectManager::new();
        let function = object_manager.alloc_function(0, "f".to_string());
        let closure = object_manager.alloc_closure(function);
        let mut slot = make_nil_value();
        let upvalue = object_manager.alloc_upvalue(&mut slot);
        unsafe {
            (*closure).upvalues.push(upvalue);
        }
        object_manager.alloc_function(0, "garbage".to_string());

        let mut gc = GarbageCollector::new();
        gc.mark_object(closure as *mut Object);
        gc.trace_references();
        object_manager.sweep();

        assert_eq!(object_manager.object_count(), 3);
    }

    #[test]
    fn class_methods_and_instance_fields_are_traced() {
        let mut object_manager = ObjectManager::new();
        let name = object_manager.alloc_string("Point", hash_string("Point"));
        let class = object_manager.alloc_class(name);
        let method_name = object_manager.alloc_string("m", hash_string("m"));
        let function = object_manager.alloc_function(0, "m".to_string());
        let method = object_manager.alloc_closure(function);
        unsafe {
            (*class)
                .methods
                .set(method_name, make_object_value(method as *mut Object));
        }
        let instance = object_manager.alloc_instance(class);
        let field_name = object_manager.alloc_string("x", hash_string("x"));
        let field_value = object_manager.alloc_string("seven", hash_string("seven"));
        unsafe {
            (*instance)
                .fields
                .set(field_name, make_object_value(field_value as *mut Object));
        }

        let mut gc = GarbageCollector::new();
        gc.mark_object(instance as *mut Object);
        gc.trace_references();
        object_manager.sweep();

        // Instance, class, class name, method name/closure/function, field
        // name and field value all survive.
        assert_eq!(object_manager.object_count(), 8);
    }

    #[test]
    fn intern_table_entries_for_unmarked_strings_are_pruned() {
        let mut object_manager = ObjectManager::new();
        let mut strings = Table::new();
        let reachable = object_manager.alloc_string("reachable", hash_string("reachable"));
        let garbage = object_manager.alloc_string("garbage", hash_string("garbage"));
        strings.set(reachable, make_nil_value());
        strings.set(garbage, make_nil_value());

        let mut gc = GarbageCollector::new();
        gc.mark_object(reachable as *mut Object);
        gc.trace_references();
        strings.remove_white();
        object_manager.sweep();

        assert_eq!(strings.len(), 1);
        assert_eq!(object_manager.object_count(), 1);
        assert_eq!(
            strings.find_string("reachable", hash_string("reachable")),
            reachable
        );
        assert!(strings.find_string("garbage", hash_string("garbage")).is_null());
    }

    #[test]
    fn cyclic_graphs_terminate() {
        let mut object_manager = ObjectManager::new();
        let name = object_manager.alloc_string("Node", hash_string("Node"));
        let class = object_manager.alloc_class(name);
        let instance = object_manager.alloc_instance(class);
        let self_name = object_manager.alloc_string("me", hash_string("me"));
        unsafe {
            // instance.me = instance
            (*instance)
                .fields
                .set(self_name, make_object_value(instance as *mut Object));
        }

        let mut gc = GarbageCollector::new();
        gc.mark_object(instance as *mut Object);
        gc.trace_references();
        object_manager.sweep();

        assert_eq!(object_manager.object_count(), 4);
    }

    #[test]
    fn stats_accumulate_across_cycles() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);

        gc.record_cycle(2048, 512, 1536);
        gc.record_cycle(8192, 4096, 4096);
        gc.record_cycle(4096, 0, 4096);

        assert_eq!(gc.stats().cycles, 3);
        assert_eq!(gc.stats().bytes_freed, 4608);
        assert_eq!(gc.stats().peak_heap_bytes, 8192);
        assert_eq!(gc.stats().last_survived_bytes, 4096);
    }
}
