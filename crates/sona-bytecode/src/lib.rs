//! Sona VM Bytecode Definitions
//!
//! This crate provides the bytecode instruction set, code object format,
//! and image (compiled program) format for the Sona virtual machine.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod code;
pub mod encoder;
pub mod image;
pub mod opcode;

pub use code::{CatchEntry, CodeObject, Instruction};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use image::{Image, ImageError, Literal, ModuleEntry, MAGIC, VERSION};
pub use opcode::Opcode;
