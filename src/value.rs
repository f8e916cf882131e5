use std::io::{self, Write};

use crate::object_manager::ObjectManager;
use crate::objects::object::{Object, ObjectType};
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_string::{hash_string, ObjectString};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    Nil,
    Number,
    Obj,
}

pub union ValueUnion {
    pub boolean: bool,
    pub number: f64,
    pub object: *mut Object,
}

impl Copy for ValueUnion {}
impl Clone for ValueUnion {
    fn clone(&self) -> Self {
        *self
    }
}

/// A Lox value: nil, boolean, IEEE-754 double, or heap-object reference.
pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

impl Copy for Value {}
impl Clone for Value {
    fn clone(&self) -> Self {
        *self
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        unsafe {
            match self.value_type {
                ValueType::Bool => write!(f, "Bool({})", self.value_as.boolean),
                ValueType::Nil => write!(f, "Nil"),
                ValueType::Number => write!(f, "Number({})", self.value_as.number),
                ValueType::Obj => write!(f, "Obj({:p})", self.value_as.object),
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.value_type != other.value_type {
            return false;
        }

        unsafe {
            match self.value_type {
                ValueType::Bool => self.value_as.boolean == other.value_as.boolean,
                ValueType::Nil => true,
                ValueType::Number => self.value_as.number == other.value_as.number,
                // Interning makes pointer equality coincide with content
                // equality for strings.
                ValueType::Obj => self.value_as.object == other.value_as.object,
            }
        }
    }
}

pub type ValueArray = Vec<Value>;

#[inline(always)]
pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::Bool
}

#[inline(always)]
pub fn is_nil(value: &Value) -> bool {
    value.value_type == ValueType::Nil
}

#[inline(always)]
pub fn is_number(value: &Value) -> bool {
    value.value_type == ValueType::Number
}

#[inline(always)]
pub fn is_object(value: &Value) -> bool {
    value.value_type == ValueType::Obj
}

#[inline(always)]
pub fn object_type(value: &Value) -> Option<ObjectType> {
    if is_object(value) {
        Some(unsafe { (*as_object(value)).obj_type })
    } else {
        None
    }
}

#[inline(always)]
pub fn is_string(value: &Value) -> bool {
    object_type(value) == Some(ObjectType::ObjString)
}

#[inline(always)]
pub fn is_instance(value: &Value) -> bool {
    object_type(value) == Some(ObjectType::ObjInstance)
}

#[inline(always)]
pub fn is_class(value: &Value) -> bool {
    object_type(value) == Some(ObjectType::ObjClass)
}

#[inline(always)]
pub fn as_bool(value: &Value) -> bool {
    debug_assert!(is_bool(value));
    unsafe { value.value_as.boolean }
}

#[inline(always)]
pub fn as_number(value: &Value) -> f64 {
    debug_assert!(is_number(value));
    unsafe { value.value_as.number }
}

#[inline(always)]
pub fn as_object(value: &Value) -> *mut Object {
    debug_assert!(is_object(value));
    unsafe { value.value_as.object }
}

#[inline(always)]
pub fn as_string(value: &Value) -> *mut ObjectString {
    debug_assert!(is_string(value));
    as_object(value) as *mut ObjectString
}

#[inline(always)]
pub fn as_class(value: &Value) -> *mut ObjectClass {
    debug_assert!(is_class(value));
    as_object(value) as *mut ObjectClass
}

#[inline(always)]
pub fn as_instance(value: &Value) -> *mut ObjectInstance {
    debug_assert!(is_instance(value));
    as_object(value) as *mut ObjectInstance
}

#[inline(always)]
pub fn make_bool_value(value: bool) -> Value {
    Value {
        value_type: ValueType::Bool,
        value_as: ValueUnion { boolean: value },
    }
}

#[inline(always)]
pub fn make_nil_value() -> Value {
    Value {
        value_type: ValueType::Nil,
        value_as: ValueUnion { number: 0.0 },
    }
}

#[inline(always)]
pub fn make_number_value(value: f64) -> Value {
    Value {
        value_type: ValueType::Number,
        value_as: ValueUnion { number: value },
    }
}

#[inline(always)]
pub fn make_object_value(object: *mut Object) -> Value {
    Value {
        value_type: ValueType::Obj,
        value_as: ValueUnion { object },
    }
}

/// Interns `content`: returns the already-interned string when one exists,
/// otherwise allocates one and installs it in the intern table.
pub fn intern_string(
    object_manager: &mut ObjectManager,
    strings: &mut Table,
    content: &str,
) -> *mut ObjectString {
    let hash = hash_string(content);
    let interned = strings.find_string(content, hash);
    if !interned.is_null() {
        return interned;
    }

    let object_string = object_manager.alloc_string(content, hash);
    object_manager.set_entry(strings, object_string, make_nil_value());
    object_string
}

#[inline]
pub fn make_string_value(
    object_manager: &mut ObjectManager,
    strings: &mut Table,
    content: &str,
) -> Value {
    make_object_value(intern_string(object_manager, strings, content) as *mut Object)
}

/// Writes the canonical textual form of a value. Integer-valued numbers
/// print without a fractional part; other numbers print in shortest
/// round-trip form (both are what `f64`'s `Display` produces).
pub fn write_value(out: &mut dyn Write, value: &Value) -> io::Result<()> {
    match value.value_type {
        ValueType::Number => write!(out, "{}", as_number(value)),
        ValueType::Bool => write!(out, "{}", if as_bool(value) { "true" } else { "false" }),
        ValueType::Nil => write!(out, "nil"),
        ValueType::Obj => write_object(out, value),
    }
}

fn write_function(out: &mut dyn Write, function: &ObjectFunction) -> io::Result<()> {
    if function.name.is_empty() {
        write!(out, "<script>")
    } else {
        write!(out, "<fn {}>", function.name)
    }
}

fn write_object(out: &mut dyn Write, value: &Value) -> io::Result<()> {
    let object = as_object(value);
    unsafe {
        match (*object).obj_type {
            ObjectType::ObjString => write!(out, "{}", (*object).as_string().content),
            ObjectType::ObjFunction => write_function(out, (*object).as_function()),
            ObjectType::ObjNative => write!(out, "<native fn>"),
            ObjectType::ObjClosure => {
                let closure: &ObjectClosure = (*object).as_closure();
                write_function(out, &*closure.function)
            }
            ObjectType::ObjUpvalue => write!(out, "upvalue"),
            ObjectType::ObjClass => {
                let class: &ObjectClass = (*object).as_class();
                write!(out, "{}", (*class.name).content)
            }
            ObjectType::ObjInstance => {
                let instance: &ObjectInstance = (*object).as_instance();
                write!(out, "{} instance", (*(*instance.class).name).content)
            }
            ObjectType::ObjBoundMethod => {
                let bound: &ObjectBoundMethod = (*object).as_bound_method();
                write_function(out, &*(*bound.method).function)
            }
        }
    }
}

/// Debug-print helper used by the disassembler.
pub fn print_value(value: &Value) {
    let mut stdout = io::stdout();
    let _ = write_value(&mut stdout, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_string::hash_string;

    fn render(value: &Value) -> String {
        let mut buffer = Vec::new();
        write_value(&mut buffer, value).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn number_equality_is_exact() {
        assert_eq!(make_number_value(1.5), make_number_value(1.5));
        assert_ne!(make_number_value(0.1 + 0.2), make_number_value(0.3));
    }

    #[test]
    fn mixed_types_never_compare_equal() {
        assert_ne!(make_number_value(0.0), make_bool_value(false));
        assert_ne!(make_nil_value(), make_bool_value(false));
        assert_ne!(make_number_value(1.0), make_bool_value(true));
    }

    #[test]
    fn nil_equals_nil() {
        assert_eq!(make_nil_value(), make_nil_value());
    }

    #[test]
    fn integer_valued_numbers_print_without_point() {
        assert_eq!(render(&make_number_value(3.0)), "3");
        assert_eq!(render(&make_number_value(-42.0)), "-42");
        assert_eq!(render(&make_number_value(9007199254740992.0)), "9007199254740992");
    }

    #[test]
    fn fractional_numbers_print_shortest_round_trip() {
        assert_eq!(render(&make_number_value(2.5)), "2.5");
        assert_eq!(render(&make_number_value(0.1)), "0.1");
    }

    #[test]
    fn booleans_and_nil_print_keywords() {
        assert_eq!(render(&make_bool_value(true)), "true");
        assert_eq!(render(&make_bool_value(false)), "false");
        assert_eq!(render(&make_nil_value()), "nil");
    }

    #[test]
    fn interning_returns_the_same_object() {
        let mut object_manager = ObjectManager::new();
        let mut strings = Table::new();

        let first = intern_string(&mut object_manager, &mut strings, "hello");
        let second = intern_string(&mut object_manager, &mut strings, "hello");
        let other = intern_string(&mut object_manager, &mut strings, "world");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(unsafe { (*first).hash }, hash_string("hello"));
    }

    #[test]
    fn interned_string_values_compare_equal_by_pointer() {
        let mut object_manager = ObjectManager::new();
        let mut strings = Table::new();

        let a = make_string_value(&mut object_manager, &mut strings, "ab");
        let b = make_string_value(&mut object_manager, &mut strings, "ab");
        assert_eq!(a, b);
    }
}
