//! Code objects: immutable compiled blocks of instructions.
//!
//! A code object carries everything the interpreter needs to execute one
//! block: the instruction stream, argument and register counts, the catch
//! table used for table-driven unwinding, and the file/line information used
//! when formatting stack traces.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::opcode::Opcode;

/// A single decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The operation to perform
    pub opcode: Opcode,
    /// Register indices and immediate operands
    pub operands: Vec<u16>,
    /// Source line this instruction originated from
    pub line: u16,
}

impl Instruction {
    /// Create a new instruction
    pub fn new(opcode: Opcode, operands: Vec<u16>, line: u16) -> Self {
        Self {
            opcode,
            operands,
            line,
        }
    }

    /// Get an operand by index
    pub fn operand(&self, index: usize) -> u16 {
        self.operands[index]
    }
}

/// An entry in a code object's catch table
///
/// A throw at an instruction index within `[start, end)` transfers control to
/// `jump_to`, binding the thrown value to `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchEntry {
    /// First instruction index covered by this entry
    pub start: u16,
    /// Index one past the last covered instruction
    pub end: u16,
    /// Instruction index of the handler
    pub jump_to: u16,
    /// Register receiving the thrown value
    pub register: u16,
}

/// An immutable compiled block of code
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Name used in stack traces
    pub name: String,
    /// Source file path
    pub file: String,
    /// Line the block is defined on
    pub line: u16,
    /// Total number of arguments
    pub arguments: u8,
    /// Number of arguments that must be supplied
    pub required_arguments: u8,
    /// Whether excess arguments are packed into a rest array
    pub rest_argument: bool,
    /// Number of local variable slots
    pub locals: u16,
    /// Number of registers
    pub registers: u16,
    /// The instruction stream
    pub instructions: Vec<Instruction>,
    /// Catch table for table-driven unwinding
    pub catch_table: Vec<CatchEntry>,
    /// Code objects for blocks defined inside this one
    pub code_objects: Vec<CodeObject>,
    /// Whether invoking this code produces a generator body
    pub generator: bool,
}

impl CodeObject {
    /// Create an empty code object
    pub fn new(name: impl Into<String>, file: impl Into<String>, line: u16) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            line,
            arguments: 0,
            required_arguments: 0,
            rest_argument: false,
            locals: 0,
            registers: 0,
            instructions: Vec::new(),
            catch_table: Vec::new(),
            code_objects: Vec::new(),
            generator: false,
        }
    }

    /// The catch entry covering the given instruction index, if any
    pub fn catch_entry_for(&self, index: u16) -> Option<&CatchEntry> {
        self.catch_table
            .iter()
            .find(|entry| index >= entry.start && index < entry.end)
    }

    /// Encode the code object, including nested code objects
    pub(crate) fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_string(&self.file);
        writer.emit_u16(self.line);
        writer.emit_u8(self.arguments);
        writer.emit_u8(self.required_arguments);
        writer.emit_u8(self.rest_argument as u8);
        writer.emit_u16(self.locals);
        writer.emit_u16(self.registers);
        writer.emit_u8(self.generator as u8);

        writer.emit_u32(self.instructions.len() as u32);

        for instruction in &self.instructions {
            writer.emit_u8(instruction.opcode.to_u8());
            writer.emit_u8(instruction.operands.len() as u8);

            for &operand in &instruction.operands {
                writer.emit_u16(operand);
            }

            writer.emit_u16(instruction.line);
        }

        writer.emit_u32(self.catch_table.len() as u32);

        for entry in &self.catch_table {
            writer.emit_u16(entry.start);
            writer.emit_u16(entry.end);
            writer.emit_u16(entry.jump_to);
            writer.emit_u16(entry.register);
        }

        writer.emit_u32(self.code_objects.len() as u32);

        for code in &self.code_objects {
            code.encode(writer);
        }
    }

    /// Decode a code object, including nested code objects
    pub(crate) fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let file = reader.read_string()?;
        let line = reader.read_u16()?;
        let arguments = reader.read_u8()?;
        let required_arguments = reader.read_u8()?;
        let rest_argument = reader.read_u8()? != 0;
        let locals = reader.read_u16()?;
        let registers = reader.read_u16()?;
        let generator = reader.read_u8()? != 0;

        let instruction_count = reader.read_u32()? as usize;
        let mut instructions = Vec::with_capacity(instruction_count);

        for _ in 0..instruction_count {
            let offset = reader.offset();
            let byte = reader.read_u8()?;
            let opcode =
                Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;
            let operand_count = reader.read_u8()? as usize;
            let mut operands = Vec::with_capacity(operand_count);

            for _ in 0..operand_count {
                operands.push(reader.read_u16()?);
            }

            let line = reader.read_u16()?;

            instructions.push(Instruction::new(opcode, operands, line));
        }

        let catch_count = reader.read_u32()? as usize;
        let mut catch_table = Vec::with_capacity(catch_count);

        for _ in 0..catch_count {
            catch_table.push(CatchEntry {
                start: reader.read_u16()?,
                end: reader.read_u16()?,
                jump_to: reader.read_u16()?,
                register: reader.read_u16()?,
            });
        }

        let code_count = reader.read_u32()? as usize;
        let mut code_objects = Vec::with_capacity(code_count);

        for _ in 0..code_count {
            code_objects.push(CodeObject::decode(reader)?);
        }

        Ok(Self {
            name,
            file,
            line,
            arguments,
            required_arguments,
            rest_argument,
            locals,
            registers,
            instructions,
            catch_table,
            code_objects,
            generator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_code() -> CodeObject {
        let mut code = CodeObject::new("main", "main.sona", 1);

        code.arguments = 1;
        code.required_arguments = 1;
        code.locals = 2;
        code.registers = 4;
        code.instructions = vec![
            Instruction::new(Opcode::LoadLiteral, vec![0, 0], 2),
            Instruction::new(Opcode::Return, vec![0], 3),
        ];
        code.catch_table = vec![CatchEntry {
            start: 0,
            end: 1,
            jump_to: 1,
            register: 3,
        }];

        let nested = CodeObject::new("inner", "main.sona", 5);
        code.code_objects.push(nested);
        code
    }

    #[test]
    fn test_catch_entry_lookup() {
        let code = example_code();

        assert!(code.catch_entry_for(0).is_some());
        assert!(code.catch_entry_for(1).is_none());
    }

    #[test]
    fn test_code_roundtrip() {
        let code = example_code();
        let mut writer = BytecodeWriter::new();

        code.encode(&mut writer);

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);
        let decoded = CodeObject::decode(&mut reader).unwrap();

        assert_eq!(decoded, code);
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_decode_invalid_opcode() {
        let mut code = example_code();
        code.code_objects.clear();
        code.catch_table.clear();

        let mut writer = BytecodeWriter::new();
        code.encode(&mut writer);

        let mut bytes = writer.into_bytes();
        // Corrupt the first instruction's opcode. The instruction stream
        // starts after name, file and the fixed header fields.
        let offset = 4 + 4 + 4 + 9 + 2 + 1 + 1 + 1 + 2 + 2 + 1 + 4;
        bytes[offset] = 0xFF;

        let mut reader = BytecodeReader::new(&bytes);

        assert!(matches!(
            CodeObject::decode(&mut reader),
            Err(DecodeError::InvalidOpcode(0xFF, _))
        ));
    }
}
