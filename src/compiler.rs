use std::io::Write;

use crate::chunk::{Chunk, OpCode};
use crate::object_manager::ObjectManager;
use crate::objects::object_function::ObjectFunction;
use crate::scanner::{Scanner, Token, TokenType};
use crate::table::Table;
use crate::value::{make_number_value, make_string_value, make_object_value, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;

/// Single-pass compiler: a Pratt parser that emits bytecode straight into
/// the chunk of the function under construction. Nested function bodies
/// push a fresh `Compiler`; the enclosing chain drives upvalue resolution.
pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Scanner<'a>>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    class_compilers: Vec<ClassCompiler>,
    object_manager: &'a mut ObjectManager,
    strings: &'a mut Table,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Compiler<'a> {
    function: *mut ObjectFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'a> Compiler<'a> {
    fn new(function: *mut ObjectFunction, function_type: FunctionType) -> Self {
        Compiler {
            function,
            function_type,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Innermost enclosing class, for `this`/`super` validity checks.
struct ClassCompiler {
    has_superclass: bool,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, can_assign: bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(
        prefix: Option<ParserFn>,
        infix: Option<ParserFn>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

const RULES: [ParseRule; TokenType::Eof as usize + 1] = {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, _can_assign| parser.call()),
        Precedence::Call,
    );
    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.dot(can_assign)),
        Precedence::Call,
    );
    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );
    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );
    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );
    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );
    rules[TokenType::Bang as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        None,
        Precedence::None,
    );
    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );
    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );
    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );
    rules[TokenType::String as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.string()),
        None,
        Precedence::None,
    );
    rules[TokenType::Number as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.number()),
        None,
        Precedence::None,
    );
    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.and()),
        Precedence::And,
    );
    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.or()),
        Precedence::Or,
    );
    rules[TokenType::True as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );
    rules[TokenType::False as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );
    rules[TokenType::Nil as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );
    rules[TokenType::This as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.this()),
        None,
        Precedence::None,
    );
    rules[TokenType::Super as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.super_()),
        None,
        Precedence::None,
    );

    rules
};

impl<'a> Parser<'a> {
    pub fn new(object_manager: &'a mut ObjectManager, strings: &'a mut Table) -> Self {
        let mut parser = Parser {
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            scanner: None,
            had_error: false,
            panic_mode: false,
            compilers: Vec::new(),
            class_compilers: Vec::new(),
            object_manager,
            strings,
        };
        parser.init_compiler(FunctionType::Script);
        parser
    }

    /// Compiles `source` into a synthetic zero-arity top-level function.
    /// Returns `None` when any parse or compile error was reported.
    pub fn compile(&mut self, source: &'a str) -> Option<*mut ObjectFunction> {
        self.scanner = Some(Scanner::new(source));

        self.advance();
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let (function, _) = self.end_compiler();
        if self.had_error {
            None
        } else {
            Some(function)
        }
    }

    fn init_compiler(&mut self, function_type: FunctionType) {
        // For a declaration, the name was just consumed; the script gets an
        // empty name and prints as <script>.
        let name = match function_type {
            FunctionType::Script => String::new(),
            _ => self.previous.value.to_string(),
        };
        let function = self.object_manager.alloc_function(0, name);

        let mut compiler = Compiler::new(function, function_type);
        // Slot zero belongs to the callee; methods see it as `this`.
        let slot_zero = match function_type {
            FunctionType::Method | FunctionType::Initializer => Token::synthetic("this"),
            _ => Token::synthetic(""),
        };
        compiler.locals.push(Local {
            name: slot_zero,
            depth: 0,
            captured: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> (*mut ObjectFunction, Vec<Upvalue>) {
        self.emit_return();

        let compiler = self.compilers.pop().expect("compiler stack underflow");
        let function = compiler.function;
        unsafe {
            (*function).upvalue_count = compiler.upvalues.len();
        }

        debug_feature::print_code(self, function);

        (function, compiler.upvalues)
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("no active compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("no active compiler")
    }

    fn current_function(&self) -> &ObjectFunction {
        unsafe { &*self.current_compiler().function }
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        unsafe { &mut *self.current_compiler_mut().function }
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            let scanner = self.scanner.as_mut().expect("scanner not initialized");
            self.current = scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }

            let message = self.current.value;
            self.error_at_current(message);
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let before = self.current_chunk().deep_size();
        self.current_chunk_mut().write(byte, line);
        let after = self.current_chunk().deep_size();
        self.object_manager.account(before, after);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_return(&mut self) {
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal.to_byte(), 0);
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.emit_byte(OpCode::Return.to_byte());
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant.to_byte(), constant);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().find_constant(&value) {
            return index as u8;
        }
        if self.current_chunk().constants.len() >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }

        let before = self.current_chunk().deep_size();
        let index = self.current_chunk_mut().add_constant(value);
        let after = self.current_chunk().deep_size();
        self.object_manager.account(before, after);
        index as u8
    }

    fn emit_jump(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the two operand bytes of the jump itself.
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        self.current_chunk_mut().write_at(offset, ((jump >> 8) & 0xff) as u8);
        self.current_chunk_mut().write_at(offset + 1, (jump & 0xff) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());

        // +2 skips over the operand of the Loop instruction itself.
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_bytes(OpCode::Class.to_byte(), name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);

            if Self::identifier_equal(&class_name, &self.previous) {
                self.error("A class can't inherit from itself.");
            }

            // `super` lives in a synthetic scope around the class body, so
            // every method captures it as an ordinary upvalue.
            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);

            self.named_variable(class_name.clone(), false);
            self.emit_byte(OpCode::Inherit.to_byte());
            self.class_compilers
                .last_mut()
                .expect("class compiler stack underflow")
                .has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop.to_byte());

        if self
            .class_compilers
            .last()
            .expect("class compiler stack underflow")
            .has_superclass
        {
            self.end_scope();
        }
        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let constant = self.identifier_constant(&self.previous.clone());

        let function_type = if self.previous.value == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_bytes(OpCode::Method.to_byte(), constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized before its body.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let arity = self.current_function().arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_function_mut().arity = arity + 1;
                }

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(make_object_value(function as *mut _));
        self.emit_bytes(OpCode::Closure.to_byte(), constant);

        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&self.previous.clone())
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let name = self.previous.clone();
        let mut duplicate = false;
        {
            let compiler = self.current_compiler();
            for local in compiler.locals.iter().rev() {
                if local.depth != -1 && local.depth < compiler.scope_depth {
                    break;
                }
                if Self::identifier_equal(&name, &local.name) {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'a>) {
        if self.current_compiler().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }

        // Depth -1 marks the local declared but not yet initialized, so its
        // own initializer cannot read it.
        self.current_compiler_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }
        self.current_compiler_mut()
            .locals
            .last_mut()
            .expect("no local to initialize")
            .depth = scope_depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_bytes(OpCode::DefineGlobal.to_byte(), global);
    }

    fn identifier_constant(&mut self, name: &Token) -> u8 {
        let value = make_string_value(&mut *self.object_manager, &mut *self.strings, name.value);
        self.make_constant(value)
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        left.value == right.value
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> i32 {
        let mut found: Option<(usize, bool)> = None;
        {
            let compiler = &self.compilers[compiler_index];
            for (index, local) in compiler.locals.iter().enumerate().rev() {
                if Self::identifier_equal(name, &local.name) {
                    found = Some((index, local.depth == -1));
                    break;
                }
            }
        }

        match found {
            Some((index, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                index as i32
            }
            None => -1,
        }
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.compilers[compiler_index - 1].locals[local as usize].captured = true;
            return self.add_upvalue(compiler_index, local as u8, true) as i32;
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue as u8, false) as i32;
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> usize {
        let upvalue = Upvalue { index, is_local };
        let compiler = &mut self.compilers[compiler_index];
        if let Some(existing) = compiler.upvalues.iter().position(|u| *u == upvalue) {
            return existing;
        }

        if compiler.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let compiler = &mut self.compilers[compiler_index];
        compiler.upvalues.push(upvalue);
        compiler.upvalues.len() - 1
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        let compiler_index = self.compilers.len() - 1;
        let opcode_get;
        let opcode_set;

        let mut index = self.resolve_local(compiler_index, &name);
        if index != -1 {
            opcode_get = OpCode::GetLocal;
            opcode_set = OpCode::SetLocal;
        } else {
            index = self.resolve_upvalue(compiler_index, &name);
            if index != -1 {
                opcode_get = OpCode::GetUpvalue;
                opcode_set = OpCode::SetUpvalue;
            } else {
                index = self.identifier_constant(&name) as i32;
                opcode_get = OpCode::GetGlobal;
                opcode_set = OpCode::SetGlobal;
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(opcode_set.to_byte(), index as u8);
        } else {
            self.emit_bytes(opcode_get.to_byte(), index as u8);
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump.to_byte());
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn for_statement(&mut self) {
        // Desugars to a while shape; the initializer scope keeps a loop
        // variable out of the enclosing block.
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse.to_byte()));
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.match_token(TokenType::RightParen) {
            // The increment runs after the body, so jump over it now and
            // loop back to it from the body's end.
            let body_jump = self.emit_jump(OpCode::Jump.to_byte());
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_byte(OpCode::Pop.to_byte());
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;

        loop {
            let scope_depth = self.current_compiler().scope_depth;
            let captured = match self.current_compiler().locals.last() {
                Some(local) if local.depth > scope_depth => local.captured,
                _ => break,
            };

            if captured {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }
            self.current_compiler_mut().locals.pop();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_number_value(value));
    }

    fn string(&mut self) {
        // Trim the surrounding quotation marks; content is raw bytes.
        let literal = &self.previous.value[1..self.previous.value.len() - 1];
        let value = make_string_value(&mut *self.object_manager, &mut *self.strings, literal);
        self.emit_constant(value);
    }

    fn literal(&mut self) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            _ => unreachable!("Expect literal token."),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign);
    }

    fn this(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        match self.class_compilers.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class_compiler) if !class_compiler.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(&self.previous.clone());

        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_bytes(OpCode::SuperInvoke.to_byte(), name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_bytes(OpCode::GetSuper.to_byte(), name);
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.token_type;
        let rule = &RULES[operator as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator {
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte()),
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte()),
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte()),
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            _ => unreachable!("Unexpected binary operator: {}", operator),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse.to_byte());
        let end_jump = self.emit_jump(OpCode::Jump.to_byte());

        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(&self.previous.clone());

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty.to_byte(), name);
        } else if self.match_token(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke.to_byte(), name);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty.to_byte(), name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    arg_count += 1;
                }

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        arg_count
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        match RULES[self.previous.token_type as usize].prefix {
            Some(prefix) => prefix(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            let infix = RULES[self.previous.token_type as usize]
                .infix
                .expect("infix rule missing for operator");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }

            self.advance();
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(&self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(&self.current.clone(), message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "[line {}] Error", token.line);
        match token.token_type {
            TokenType::Eof => {
                let _ = write!(stderr, " at end");
            }
            TokenType::Error => {}
            _ => {
                let _ = write!(stderr, " at '{}'", token.value);
            }
        }
        let _ = writeln!(stderr, ": {}", message);

        self.had_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;

    pub fn print_code(parser: &Parser, function: *mut ObjectFunction) {
        if parser.had_error {
            return;
        }
        let function = unsafe { &*function };
        let name = if function.name.is_empty() {
            "<script>"
        } else {
            function.name.as_str()
        };
        crate::debug::disassemble_chunk(&function.chunk, name);
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::{ObjectFunction, Parser};

    #[inline(always)]
    pub fn print_code(_parser: &Parser, _function: *mut ObjectFunction) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, is_number};

    fn compile(source: &str) -> (Option<*mut ObjectFunction>, ObjectManager, Table) {
        let mut object_manager = ObjectManager::new();
        let mut strings = Table::new();
        let function = {
            let mut parser = Parser::new(&mut object_manager, &mut strings);
            parser.compile(source)
        };
        (function, object_manager, strings)
    }

    fn chunk_of(function: *mut ObjectFunction) -> &'static Chunk {
        unsafe { &(*function).chunk }
    }

    #[test]
    fn expression_bytecode() {
        let (function, _object_manager, _strings) = compile("!(5 - 4 > 3 * 2 == !nil);");
        let chunk = chunk_of(function.unwrap());

        assert!(is_number(&chunk.constants[0]));
        assert_eq!(as_number(&chunk.constants[0]), 5.0);
        assert_eq!(as_number(&chunk.constants[1]), 4.0);

        let expected = [
            OpCode::Constant.to_byte(),
            0,
            OpCode::Constant.to_byte(),
            1,
            OpCode::Subtract.to_byte(),
            OpCode::Constant.to_byte(),
            2,
            OpCode::Constant.to_byte(),
            3,
            OpCode::Multiply.to_byte(),
            OpCode::Greater.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Equal.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        assert_eq!(chunk.code, expected);
    }

    #[test]
    fn global_declaration_bytecode() {
        let (function, _object_manager, _strings) = compile("var a = 1;");
        let chunk = chunk_of(function.unwrap());

        // Constant 0 is the name, constant 1 the initializer.
        let expected = [
            OpCode::Constant.to_byte(),
            1,
            OpCode::DefineGlobal.to_byte(),
            0,
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        assert_eq!(chunk.code, expected);
    }

    #[test]
    fn locals_use_stack_slots() {
        let (function, _object_manager, _strings) = compile("{ var a = 1; print a; }");
        let chunk = chunk_of(function.unwrap());

        let expected = [
            OpCode::Constant.to_byte(),
            0,
            OpCode::GetLocal.to_byte(),
            1,
            OpCode::Print.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        assert_eq!(chunk.code, expected);
    }

    #[test]
    fn number_constants_are_deduplicated() {
        let (function, _object_manager, _strings) = compile("print 1 + 1 + 1;");
        let chunk = chunk_of(function.unwrap());
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn identical_string_literals_are_interned_once() {
        let mut object_manager = ObjectManager::new();
        let mut strings = Table::new();
        {
            let mut parser = Parser::new(&mut object_manager, &mut strings);
            assert!(parser.compile("\"a string\";").is_some());
        }
        {
            let mut parser = Parser::new(&mut object_manager, &mut strings);
            assert!(parser.compile("\"a string\";").is_some());
        }
        assert_eq!(strings.len(), 1);
    }

    #[test]
    fn captured_local_compiles_to_upvalue() {
        let (function, _object_manager, _strings) = compile(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let script = chunk_of(function.unwrap());

        // The outer function is the script's non-name constant.
        let outer = script
            .constants
            .iter()
            .find_map(|constant| {
                if crate::value::is_object(constant) {
                    let object = crate::value::as_object(constant);
                    if unsafe { (*object).obj_type }
                        == crate::objects::object::ObjectType::ObjFunction
                    {
                        return Some(object as *mut ObjectFunction);
                    }
                }
                None
            })
            .expect("outer function constant");
        assert_eq!(unsafe { (*outer).upvalue_count }, 0);

        let inner = unsafe { &(*outer).chunk }
            .constants
            .iter()
            .find_map(|constant| {
                if crate::value::is_object(constant) {
                    let object = crate::value::as_object(constant);
                    if unsafe { (*object).obj_type }
                        == crate::objects::object::ObjectType::ObjFunction
                    {
                        return Some(object as *mut ObjectFunction);
                    }
                }
                None
            })
            .expect("inner function constant");
        assert_eq!(unsafe { (*inner).upvalue_count }, 1);
    }

    #[test]
    fn undefined_local_in_own_initializer_is_an_error() {
        let (function, _object_manager, _strings) = compile("{ var a = a; }");
        assert!(function.is_none());
    }

    #[test]
    fn duplicate_local_declaration_is_an_error() {
        let (function, _object_manager, _strings) = compile("{ var a = 1; var a = 2; }");
        assert!(function.is_none());
    }

    #[test]
    fn top_level_return_is_an_error() {
        let (function, _object_manager, _strings) = compile("return 1;");
        assert!(function.is_none());
    }

    #[test]
    fn initializer_returning_a_value_is_an_error() {
        let (function, _object_manager, _strings) =
            compile("class C { init() { return 5; } }");
        assert!(function.is_none());

        let (function, _object_manager, _strings) =
            compile("class C { init() { return; } }");
        assert!(function.is_some());
    }

    #[test]
    fn this_outside_a_class_is_an_error() {
        let (function, _object_manager, _strings) = compile("print this;");
        assert!(function.is_none());
    }

    #[test]
    fn super_outside_a_class_is_an_error() {
        let (function, _object_manager, _strings) = compile("print super.x;");
        assert!(function.is_none());
    }

    #[test]
    fn super_without_a_superclass_is_an_error() {
        let (function, _object_manager, _strings) =
            compile("class A { m() { super.m(); } }");
        assert!(function.is_none());
    }

    #[test]
    fn self_inheritance_is_an_error() {
        let (function, _object_manager, _strings) = compile("class A < A {}");
        assert!(function.is_none());
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let (function, _object_manager, _strings) = compile("1 + 2 = 3;");
        assert!(function.is_none());
    }

    #[test]
    fn too_many_locals_in_one_function_is_an_error() {
        let mut body = String::new();
        for i in 0..257 {
            body.push_str(&format!("var v{} = 0;", i));
        }
        let source = format!("fun f() {{ {} }}", body);
        let (function, _object_manager, _strings) = compile(&source);
        assert!(function.is_none());

        let mut body = String::new();
        for i in 0..255 {
            body.push_str(&format!("var v{} = 0;", i));
        }
        let source = format!("fun f() {{ {} }}", body);
        let (function, _object_manager, _strings) = compile(&source);
        assert!(function.is_some());
    }

    #[test]
    fn too_many_constants_in_one_chunk_is_an_error() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("print {};", i));
        }
        let (function, _object_manager, _strings) = compile(&source);
        assert!(function.is_none());
    }

    #[test]
    fn jump_longer_than_u16_is_an_error() {
        let body = "print 1;".repeat(22000);
        let source = format!("if (true) {{ {} }}", body);
        let (function, _object_manager, _strings) = compile(&source);
        assert!(function.is_none());
    }

    #[test]
    fn class_with_methods_compiles() {
        let (function, _object_manager, _strings) = compile(
            "class A { speak() { print \"A\"; } } \
             class B < A { speak() { super.speak(); print \"B\"; } } \
             B().speak();",
        );
        assert!(function.is_some());
    }
}
