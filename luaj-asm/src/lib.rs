//! Bytecode primitives of the LuaJ virtual machine.
//!
//! Every instruction is a fixed-width 32-bit word with the opcode in its low
//! byte and one of three operand layouts above it (see [`Form`]). This crate
//! owns the opcode table and the pure packing/unpacking of operand fields;
//! it knows nothing about values, stacks or control flow.

#![warn(missing_docs)]

mod instruction;
mod opcode;

pub use instruction::{Instruction, JMP_BIAS, MAX_JMP_OFFSET, NO_SLOT};
pub use opcode::{Form, Op};
