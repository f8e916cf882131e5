use std::io::Write;

use crate::call_frame::CallFrame;
use crate::chunk::OpCode;
use crate::compiler::Parser;
use crate::gc::{gc_trace, GarbageCollector, GcStats};
use crate::object_manager::ObjectManager;
use crate::objects::object::{NativeObject, Object, ObjectType};
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_native::ObjectNative;
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::std_mod::clock::Clock;
use crate::table::Table;
use crate::value::{
    as_class, as_instance, as_number, as_object, as_string, intern_string, is_class, is_instance,
    is_number, is_object, is_string, make_bool_value, make_nil_value, make_number_value,
    make_object_value, make_string_value, write_value, Value,
};

pub const MAX_FRAMES: usize = 64;
pub const STACK_MAX: usize = MAX_FRAMES * 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// The execution engine: value stack, call-frame stack, globals, the
/// open-upvalue list, and the heap. A fresh `interpret` call starts with
/// empty stacks; globals and interned strings persist across calls so a
/// REPL session accumulates state.
pub struct VM {
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: Table,
    strings: Table,
    open_upvalues: *mut ObjectUpvalue,
    init_string: *mut ObjectString,
    object_manager: ObjectManager,
    gc: GarbageCollector,
}

impl VM {
    pub fn new() -> Self {
        let mut object_manager = ObjectManager::new();
        let mut strings = Table::new();
        // `init` is looked up on every class call; intern it once.
        let init_string = intern_string(&mut object_manager, &mut strings, "init");

        let mut vm = VM {
            stack: vec![make_nil_value(); STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: Table::new(),
            strings,
            open_upvalues: std::ptr::null_mut(),
            init_string,
            object_manager,
            gc: GarbageCollector::new(),
        };
        vm.define_native("clock", 0, Clock);
        vm
    }

    /// Registers a host function under a global name.
    pub fn define_native(&mut self, name: &str, arity: u8, native: impl NativeObject + 'static) {
        let name_string = intern_string(&mut self.object_manager, &mut self.strings, name);
        let native_object = self
            .object_manager
            .alloc_native(name.to_string(), arity, native);
        self.object_manager.set_entry(
            &mut self.globals,
            name_string,
            make_object_value(native_object as *mut Object),
        );
    }

    pub fn interpret(&mut self, source: &str, output: &mut dyn Write) -> InterpretResult {
        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.strings);
            parser.compile(source)
        };
        let function = match function {
            Some(function) => function,
            None => return InterpretResult::CompileError,
        };

        self.reset_stack();
        self.push(make_object_value(function as *mut Object));
        self.maybe_collect();
        let closure = self.object_manager.alloc_closure(function);
        self.pop();
        self.push(make_object_value(closure as *mut Object));
        if let Err(message) = self.call_closure(closure, 0) {
            self.runtime_error(&message);
            return InterpretResult::RuntimeError;
        }

        match self.run(output) {
            Ok(()) => InterpretResult::Ok,
            Err(message) => {
                self.runtime_error(&message);
                InterpretResult::RuntimeError
            }
        }
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.gc.stats()
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = std::ptr::null_mut();
    }

    fn run(&mut self, output: &mut dyn Write) -> Result<(), String> {
        loop {
            debug_feature::trace_instruction(self);

            let byte = self.read_byte();
            let instruction = match OpCode::from_byte(byte) {
                Some(instruction) => instruction,
                // A bad opcode is a corrupt chunk, not a user error.
                None => panic!("Unknown opcode {}.", byte),
            };

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(make_nil_value()),
                OpCode::True => self.push(make_bool_value(true)),
                OpCode::False => self.push(make_bool_value(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(format!("Undefined variable '{}'.", unsafe {
                                &(*name).content
                            }));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.object_manager.set_entry(&mut self.globals, name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    // Assignment never creates a global; undo the insert.
                    if self.object_manager.set_entry(&mut self.globals, name, value) {
                        self.globals.delete(name);
                        return Err(format!("Undefined variable '{}'.", unsafe {
                            &(*name).content
                        }));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = unsafe { (&(*self.current_frame().closure).upvalues)[slot] };
                    let value = unsafe { *(*upvalue).location };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = unsafe { (&(*self.current_frame().closure).upvalues)[slot] };
                    unsafe {
                        *(*upvalue).location = self.peek(0);
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    if !is_instance(&receiver) {
                        return Err("Only instances have properties.".to_string());
                    }

                    let instance = as_instance(&receiver);
                    if let Some(field) = unsafe { (*instance).fields.get(name) } {
                        self.pop();
                        self.push(field);
                    } else {
                        let class = unsafe { (*instance).class };
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    if !is_instance(&receiver) {
                        return Err("Only instances have fields.".to_string());
                    }

                    let instance = as_instance(&receiver);
                    let value = self.peek(0);
                    self.object_manager
                        .set_entry(unsafe { &mut (*instance).fields }, name, value);
                    // The assigned value is the expression result.
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = as_class(&self.pop());
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(make_bool_value(a == b));
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => self.binary_number_op(instruction)?,
                OpCode::Add => self.add()?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(make_bool_value(Self::is_falsey(&value)));
                }
                OpCode::Negate => {
                    if !is_number(&self.peek(0)) {
                        return Err("Operand must be a number.".to_string());
                    }
                    let value = self.pop();
                    self.push(make_number_value(-as_number(&value)));
                }
                OpCode::Print => {
                    let value = self.pop();
                    write_value(output, &value)
                        .and_then(|_| writeln!(output))
                        .map_err(|error| format!("Could not write output: {}.", error))?;
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if Self::is_falsey(&self.peek(0)) {
                        self.current_frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = as_class(&self.pop());
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = as_object(&self.read_constant())
                        as *mut crate::objects::object_function::ObjectFunction;
                    self.maybe_collect();
                    let closure = self.object_manager.alloc_closure(function);
                    self.push(make_object_value(closure as *mut Object));

                    let upvalue_count = unsafe { (*function).upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.current_frame().slot_base + index;
                            self.capture_upvalue(slot)
                        } else {
                            unsafe { (&(*self.current_frame().closure).upvalues)[index] }
                        };
                        unsafe {
                            (*closure).upvalues.push(upvalue);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack_top - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("call frame stack underflow");
                    self.close_upvalues(frame.slot_base);

                    if self.frames.is_empty() {
                        // The slot holding the script closure.
                        self.pop();
                        return Ok(());
                    }

                    self.stack_top = frame.slot_base;
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    self.maybe_collect();
                    let class = self.object_manager.alloc_class(name);
                    self.push(make_object_value(class as *mut Object));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !is_class(&superclass) {
                        return Err("Superclass must be a class.".to_string());
                    }

                    // Flattening: copy the parent's methods now, so lookup
                    // never walks an inheritance chain at call time.
                    let subclass = as_class(&self.peek(0));
                    self.object_manager.copy_entries(
                        unsafe { &(*as_class(&superclass)).methods },
                        unsafe { &mut (*subclass).methods },
                    );
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
            }
        }
    }

    #[inline(always)]
    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    #[inline(always)]
    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = unsafe { (&(*(*frame.closure).function).chunk.code)[frame.ip] };
        frame.ip += 1;
        byte
    }

    #[inline(always)]
    fn read_short(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        ((high as u16) << 8) | low as u16
    }

    #[inline(always)]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active call frame");
        unsafe { (&(*(*frame.closure).function).chunk.constants)[index] }
    }

    #[inline(always)]
    fn read_string(&mut self) -> *mut ObjectString {
        as_string(&self.read_constant())
    }

    #[inline(always)]
    fn push(&mut self, value: Value) {
        debug_assert!(self.stack_top < STACK_MAX, "value stack overflow");
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    #[inline(always)]
    fn pop(&mut self) -> Value {
        debug_assert!(self.stack_top > 0, "value stack underflow");
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    #[inline(always)]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - distance - 1]
    }

    fn is_falsey(value: &Value) -> bool {
        crate::value::is_nil(value) || (crate::value::is_bool(value) && !crate::value::as_bool(value))
    }

    fn binary_number_op(&mut self, op: OpCode) -> Result<(), String> {
        if !is_number(&self.peek(0)) || !is_number(&self.peek(1)) {
            return Err("Operands must be numbers.".to_string());
        }

        let b = as_number(&self.pop());
        let a = as_number(&self.pop());
        let value = match op {
            OpCode::Greater => make_bool_value(a > b),
            OpCode::Less => make_bool_value(a < b),
            OpCode::Subtract => make_number_value(a - b),
            OpCode::Multiply => make_number_value(a * b),
            OpCode::Divide => make_number_value(a / b),
            _ => unreachable!("not a binary numeric opcode: {}", op),
        };
        self.push(value);
        Ok(())
    }

    fn add(&mut self) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);

        if is_number(&a) && is_number(&b) {
            let b = as_number(&self.pop());
            let a = as_number(&self.pop());
            self.push(make_number_value(a + b));
            Ok(())
        } else if is_string(&a) && is_string(&b) {
            self.concatenate();
            Ok(())
        } else {
            Err("Operands must be two numbers or two strings.".to_string())
        }
    }

    fn concatenate(&mut self) {
        // Operands stay on the stack across the allocation so a collection
        // triggered here still sees them as roots.
        self.maybe_collect();

        let b = self.peek(0);
        let a = self.peek(1);
        let (a, b) = unsafe { (&(*as_string(&a)).content, &(*as_string(&b)).content) };
        let mut content = String::with_capacity(a.len() + b.len());
        content.push_str(a);
        content.push_str(b);

        let value = make_string_value(&mut self.object_manager, &mut self.strings, &content);
        self.pop();
        self.pop();
        self.push(value);
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        if is_object(&callee) {
            let object = as_object(&callee);
            match unsafe { (*object).obj_type } {
                ObjectType::ObjClosure => {
                    return self.call_closure(object as *mut ObjectClosure, arg_count);
                }
                ObjectType::ObjNative => {
                    return self.call_native(object as *mut ObjectNative, arg_count);
                }
                ObjectType::ObjClass => {
                    return self.call_class(object as *mut ObjectClass, arg_count);
                }
                ObjectType::ObjBoundMethod => {
                    let bound = object as *mut ObjectBoundMethod;
                    // The receiver takes the callee slot, becoming the new
                    // frame's slot zero.
                    self.stack[self.stack_top - arg_count - 1] = unsafe { (*bound).receiver };
                    return self.call_closure(unsafe { (*bound).method }, arg_count);
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    fn call_closure(&mut self, closure: *mut ObjectClosure, arg_count: usize) -> Result<(), String> {
        let arity = unsafe { (*(*closure).function).arity } as usize;
        if arg_count != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, arg_count));
        }
        if self.frames.len() == MAX_FRAMES {
            return Err("Stack overflow.".to_string());
        }

        self.frames
            .push(CallFrame::new(closure, self.stack_top - arg_count - 1));
        Ok(())
    }

    fn call_native(&mut self, native: *mut ObjectNative, arg_count: usize) -> Result<(), String> {
        let arity = unsafe { (*native).arity } as usize;
        if arg_count != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, arg_count));
        }

        let args_start = self.stack_top - arg_count;
        let result = unsafe { (*native).invoke(&self.stack[args_start..self.stack_top]) }?;
        self.stack_top -= arg_count + 1;
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class: *mut ObjectClass, arg_count: usize) -> Result<(), String> {
        self.maybe_collect();
        let instance = self.object_manager.alloc_instance(class);
        self.stack[self.stack_top - arg_count - 1] = make_object_value(instance as *mut Object);

        if let Some(initializer) = unsafe { (*class).methods.get(self.init_string) } {
            return self.call_closure(as_object(&initializer) as *mut ObjectClosure, arg_count);
        }
        if arg_count != 0 {
            return Err(format!("Expected 0 arguments but got {}.", arg_count));
        }
        Ok(())
    }

    /// `instance.name(args)` without materializing a bound method: fields
    /// shadow methods, so a field holding a callable wins.
    fn invoke(&mut self, name: *mut ObjectString, arg_count: usize) -> Result<(), String> {
        let receiver = self.peek(arg_count);
        if !is_instance(&receiver) {
            return Err("Only instances have methods.".to_string());
        }

        let instance = as_instance(&receiver);
        if let Some(field) = unsafe { (*instance).fields.get(name) } {
            self.stack[self.stack_top - arg_count - 1] = field;
            return self.call_value(field, arg_count);
        }

        let class = unsafe { (*instance).class };
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: *mut ObjectClass,
        name: *mut ObjectString,
        arg_count: usize,
    ) -> Result<(), String> {
        match unsafe { (*class).methods.get(name) } {
            Some(method) => {
                self.call_closure(as_object(&method) as *mut ObjectClosure, arg_count)
            }
            None => Err(format!("Undefined property '{}'.", unsafe {
                &(*name).content
            })),
        }
    }

    fn bind_method(
        &mut self,
        class: *mut ObjectClass,
        name: *mut ObjectString,
    ) -> Result<(), String> {
        let method = match unsafe { (*class).methods.get(name) } {
            Some(method) => method,
            None => {
                return Err(format!("Undefined property '{}'.", unsafe {
                    &(*name).content
                }));
            }
        };

        self.maybe_collect();
        let receiver = self.peek(0);
        let bound = self
            .object_manager
            .alloc_bound_method(receiver, as_object(&method) as *mut ObjectClosure);
        self.pop();
        self.push(make_object_value(bound as *mut Object));
        Ok(())
    }

    fn define_method(&mut self, name: *mut ObjectString) {
        let method = self.peek(0);
        let class = as_class(&self.peek(1));
        self.object_manager
            .set_entry(unsafe { &mut (*class).methods }, name, method);
        self.pop();
    }

    /// Finds or creates the open upvalue for a stack slot. The list is kept
    /// sorted by descending slot address; two closures over the same slot
    /// share one upvalue.
    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjectUpvalue {
        let local = &mut self.stack[slot] as *mut Value;

        let mut previous: *mut ObjectUpvalue = std::ptr::null_mut();
        let mut upvalue = self.open_upvalues;
        unsafe {
            while !upvalue.is_null() && (*upvalue).location > local {
                previous = upvalue;
                upvalue = (*upvalue).next;
            }
            if !upvalue.is_null() && (*upvalue).location == local {
                return upvalue;
            }
        }

        self.maybe_collect();
        let created = self.object_manager.alloc_upvalue(local);
        unsafe {
            (*created).next = upvalue;
            if previous.is_null() {
                self.open_upvalues = created;
            } else {
                (*previous).next = created;
            }
        }
        created
    }

    /// Closes every open upvalue at or above the given stack slot.
    fn close_upvalues(&mut self, last_slot: usize) {
        let last = &mut self.stack[last_slot] as *mut Value;
        unsafe {
            while !self.open_upvalues.is_null() && (*self.open_upvalues).location >= last {
                let upvalue = self.open_upvalues;
                (*upvalue).closed = *(*upvalue).location;
                (*upvalue).location = &mut (*upvalue).closed;
                self.open_upvalues = (*upvalue).next;
            }
        }
    }

    fn maybe_collect(&mut self) {
        if self.object_manager.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let before = self.object_manager.bytes_allocated();
        gc_trace!("-- gc begin ({} bytes)", before);

        // Roots: the value stack, each frame's closure, the open upvalues,
        // the globals table, and the cached init string.
        for index in 0..self.stack_top {
            self.gc.mark_value(&self.stack[index]);
        }
        for frame in &self.frames {
            self.gc.mark_object(frame.closure as *mut Object);
        }
        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() {
            self.gc.mark_object(upvalue as *mut Object);
            upvalue = unsafe { (*upvalue).next };
        }
        self.gc.mark_table(&self.globals);
        self.gc.mark_object(self.init_string as *mut Object);

        self.gc.trace_references();

        // The intern table is weak: prune entries for doomed strings before
        // the sweep frees them.
        self.strings.remove_white();

        let freed = self.object_manager.sweep();
        self.object_manager.finish_cycle(freed);
        self.gc
            .record_cycle(before, freed, self.object_manager.bytes_allocated());
    }

    fn runtime_error(&mut self, message: &str) {
        eprintln!("{}", message);

        for frame in self.frames.iter().rev() {
            let function = frame.function();
            let line = function.chunk.lines[frame.ip - 1];
            if function.name.is_empty() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.name);
            }
        }

        self.reset_stack();
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;
    use crate::value::print_value;

    pub fn trace_instruction(vm: &VM) {
        print!("          ");
        for slot in &vm.stack[0..vm.stack_top] {
            print!("[ ");
            print_value(slot);
            print!(" ]");
        }
        println!();
        let frame = vm.current_frame();
        crate::debug::disassemble_instruction(&frame.function().chunk, frame.ip);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::VM;

    #[inline(always)]
    pub fn trace_instruction(_vm: &VM) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (InterpretResult, String) {
        let mut vm = VM::new();
        let mut output = Vec::new();
        let result = vm.interpret(source, &mut output);
        (result, String::from_utf8(output).unwrap())
    }

    fn run_ok(source: &str) -> String {
        let (result, output) = run(source);
        assert_eq!(result, InterpretResult::Ok, "output so far: {:?}", output);
        output
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run_ok("print 1 + 2 * 3 - 4 / 2;"), "5\n");
    }

    #[test]
    fn grouping_overrides_precedence() {
        assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    }

    #[test]
    fn comparison_and_equality() {
        assert_eq!(
            run_ok("print 1 < 2; print 2 <= 2; print 3 > 4; print 1 == 1.0; print 1 != 2;"),
            "true\ntrue\nfalse\ntrue\ntrue\n"
        );
    }

    #[test]
    fn number_and_string_never_compare_equal() {
        assert_eq!(run_ok("print 1 == \"1\";"), "false\n");
    }

    #[test]
    fn truthiness_only_nil_and_false_are_falsey() {
        assert_eq!(
            run_ok(
                "if (0) print \"zero\"; \
                 if (\"\") print \"empty\"; \
                 if (nil) print \"nil\"; else print \"nil is falsey\"; \
                 if (false) print \"false\"; else print \"false is falsey\";"
            ),
            "zero\nempty\nnil is falsey\nfalse is falsey\n"
        );
    }

    #[test]
    fn logical_operators_short_circuit() {
        assert_eq!(
            run_ok("print nil or \"yes\"; print nil and \"no\"; print 1 and 2;"),
            "yes\nnil\n2\n"
        );
    }

    #[test]
    fn string_concatenation_is_interned() {
        assert_eq!(run_ok("print \"ab\" + \"c\" == \"abc\";"), "true\n");
    }

    #[test]
    fn while_and_for_loops() {
        assert_eq!(
            run_ok("var sum = 0; for (var i = 0; i < 5; i = i + 1) { sum = sum + i; } print sum;"),
            "10\n"
        );
        assert_eq!(
            run_ok("var n = 3; while (n > 0) { print n; n = n - 1; }"),
            "3\n2\n1\n"
        );
    }

    #[test]
    fn for_loop_with_omitted_clauses() {
        assert_eq!(
            run_ok("fun f() { for (;;) { return \"looped\"; } } print f();"),
            "looped\n"
        );
        assert_eq!(
            run_ok("for (var i = 0; i < 2;) { print i; i = i + 1; }"),
            "0\n1\n"
        );
    }

    #[test]
    fn functions_and_returns() {
        assert_eq!(
            run_ok("fun sum(a, b, c) { return a + b + c; } print 4 + sum(5, 6, 7);"),
            "22\n"
        );
        assert_eq!(run_ok("fun noReturn() {} print noReturn();"), "nil\n");
        assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
    }

    #[test]
    fn closure_counters_are_independent() {
        let output = run_ok(
            "fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
             var a = makeCounter(); var b = makeCounter(); \
             print a(); print a(); print b(); print a();",
        );
        assert_eq!(output, "1\n2\n1\n3\n");
    }

    #[test]
    fn closure_captures_variable_not_value() {
        let output = run_ok(
            "var closure; \
             { var a = \"closed\"; fun f() { print a; } closure = f; } \
             closure();",
        );
        assert_eq!(output, "closed\n");
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let output = run_ok(
            "fun make() { var x = 0; fun set(v) { x = v; } fun get() { return x; } \
             fun pair(a, b) { set(a); print get(); set(b); print get(); } return pair; } \
             make()(1, 2);",
        );
        assert_eq!(output, "1\n2\n");
    }

    #[test]
    fn classes_methods_and_this() {
        let output = run_ok(
            "class Person { init(name) { this.name = name; } greet() { print this.name; } } \
             Person(\"Ada\").greet();",
        );
        assert_eq!(output, "Ada\n");
    }

    #[test]
    fn bound_method_remembers_its_receiver() {
        let output = run_ok(
            "class Person { init(name) { this.name = name; } greet() { print this.name; } } \
             var m = Person(\"Ada\").greet; m();",
        );
        assert_eq!(output, "Ada\n");
    }

    #[test]
    fn initializer_returns_the_instance() {
        assert_eq!(
            run_ok("class C { init() { this.x = 7; return; } } print C().x;"),
            "7\n"
        );
    }

    #[test]
    fn method_override_and_super() {
        let output = run_ok(
            "class A { speak() { print \"A\"; } } \
             class B < A { speak() { super.speak(); print \"B\"; } } \
             B().speak();",
        );
        assert_eq!(output, "A\nB\n");
    }

    #[test]
    fn inherited_methods_are_flattened_in() {
        assert_eq!(
            run_ok("class A { m() { print \"a\"; } } class B < A {} B().m();"),
            "a\n"
        );
    }

    #[test]
    fn fields_shadow_methods() {
        let output = run_ok(
            "class C { m() { print \"method\"; } } \
             fun field() { print \"field\"; } \
             var c = C(); c.m = field; c.m();",
        );
        assert_eq!(output, "field\n");
    }

    #[test]
    fn set_property_evaluates_to_the_assigned_value() {
        assert_eq!(
            run_ok("class C {} var c = C(); print c.x = 3;"),
            "3\n"
        );
    }

    #[test]
    fn printed_forms() {
        assert_eq!(
            run_ok(
                "class C {} print C; print C(); print clock; \
                 fun f() {} print f; print nil; print true;"
            ),
            "C\nC instance\n<native fn>\n<fn f>\nnil\ntrue\n"
        );
    }

    #[test]
    fn clock_native_returns_seconds() {
        assert_eq!(run_ok("print clock() > 0;"), "true\n");
    }

    #[test]
    fn native_arity_is_checked() {
        let (result, _) = run("clock(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let (result, _) = run("print missing;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn undefined_global_assignment_is_a_runtime_error() {
        let (result, _) = run("missing = 1;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn mixed_operand_addition_is_a_runtime_error() {
        let (result, _) = run("print 1 + \"one\";");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let (result, _) = run("var x = 1; x();");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn wrong_argument_count_is_a_runtime_error() {
        let (result, _) = run("fun f(a) {} f(1, 2);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn property_access_on_non_instance_is_a_runtime_error() {
        let (result, _) = run("print 4.x;");
        assert_eq!(result, InterpretResult::RuntimeError);
        let (result, _) = run("4.x = 1;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn undefined_property_is_a_runtime_error() {
        let (result, _) = run("class C {} print C().missing;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn inheriting_from_a_non_class_is_a_runtime_error() {
        let (result, _) = run("var NotAClass = 1; class B < NotAClass {}");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let (result, _) = run("fun f() { f(); } f();");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn class_call_with_arguments_but_no_initializer_is_an_error() {
        let (result, _) = run("class C {} C(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn stack_is_empty_after_normal_termination() {
        let mut vm = VM::new();
        let mut output = Vec::new();
        let result = vm.interpret("var a = 1; { var b = a + 1; print b; }", &mut output);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(vm.stack_top, 0);
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_null());
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let mut vm = VM::new();
        let mut output = Vec::new();
        assert_eq!(vm.interpret("var a = 1;", &mut output), InterpretResult::Ok);
        assert_eq!(vm.interpret("print a;", &mut output), InterpretResult::Ok);
        assert_eq!(String::from_utf8(output).unwrap(), "1\n");
    }

    #[test]
    fn session_recovers_after_a_runtime_error() {
        let mut vm = VM::new();
        let mut output = Vec::new();
        assert_eq!(vm.interpret("var a = 2;", &mut output), InterpretResult::Ok);
        assert_eq!(
            vm.interpret("print missing;", &mut output),
            InterpretResult::RuntimeError
        );
        assert_eq!(vm.interpret("print a;", &mut output), InterpretResult::Ok);
        assert_eq!(String::from_utf8(output).unwrap(), "2\n");
    }

    #[test]
    fn compile_errors_do_not_touch_globals() {
        let mut vm = VM::new();
        let mut output = Vec::new();
        assert_eq!(
            vm.interpret("var a = ;", &mut output),
            InterpretResult::CompileError
        );
        assert_eq!(
            vm.interpret("print a;", &mut output),
            InterpretResult::RuntimeError
        );
    }

    #[test]
    fn collection_preserves_reachable_globals() {
        let mut vm = VM::new();
        let mut output = Vec::new();
        assert_eq!(
            vm.interpret("var kept = \"still\" + \" here\";", &mut output),
            InterpretResult::Ok
        );
        vm.collect_garbage();
        assert_eq!(vm.gc_stats().cycles, 1);
        assert_eq!(vm.interpret("print kept;", &mut output), InterpretResult::Ok);
        assert_eq!(String::from_utf8(output).unwrap(), "still here\n");
    }

    #[test]
    fn collection_during_execution_keeps_output_identical() {
        let source = "fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
             var counter = makeCounter(); \
             var last = 0; \
             for (var i = 0; i < 1000; i = i + 1) { last = counter(); var s = \"x\" + \"y\"; } \
             print last;";

        let mut vm = VM::new();
        let mut output = Vec::new();
        assert_eq!(vm.interpret(source, &mut output), InterpretResult::Ok);
        assert_eq!(String::from_utf8(output).unwrap(), "1000\n");
    }
}
