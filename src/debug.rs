use crate::chunk::{Chunk, OpCode};
use crate::value::{as_object, print_value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let instruction = match OpCode::from_byte(chunk.code[offset]) {
        Some(op) => op,
        None => {
            println!("Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };

    match instruction {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(instruction, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(instruction, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(instruction, 1, chunk, offset),
        OpCode::Loop => jump_instruction(instruction, -1, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(instruction, chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        _ => simple_instruction(instruction, offset),
    }
}

fn simple_instruction(op: OpCode, offset: usize) -> usize {
    println!("{}", op);
    offset + 1
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    print!("{:<16} {:>4} '", op.to_string(), constant);
    print_value(&chunk.constants[constant as usize]);
    println!("'");
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:>4}", op.to_string(), slot);
    offset + 2
}

fn jump_instruction(op: OpCode, sign: isize, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = (offset as isize + 3 + sign * jump as isize) as usize;
    println!("{:<16} {:>4} -> {}", op.to_string(), offset, target);
    offset + 3
}

fn invoke_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    print!("{:<16} ({} args) {:>4} '", op.to_string(), arg_count, constant);
    print_value(&chunk.constants[constant as usize]);
    println!("'");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    print!("{:<16} {:>4} ", "Closure", constant);
    print_value(&chunk.constants[constant as usize]);
    println!();

    let function = as_object(&chunk.constants[constant as usize]);
    let upvalue_count = unsafe { (*function).as_function().upvalue_count };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04}    |                     {} {}",
            offset,
            if is_local != 0 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }

    offset
}
