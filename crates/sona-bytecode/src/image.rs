//! Bytecode image format
//!
//! An image is the unit the VM loads at startup: literal tables, a module
//! table, the code objects those modules execute, and the identifier of the
//! entry module. Images carry a truncated SHA-256 checksum over the payload
//! so corrupted files are rejected before execution.

use crate::code::CodeObject;
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Magic number for Sona bytecode images
pub const MAGIC: [u8; 4] = *b"SONA";

/// Current image format version
pub const VERSION: u32 = 1;

/// Image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ImageError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected SONA, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported image version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum recorded in the image header
        expected: u64,
        /// Checksum computed over the payload
        actual: u64,
    },

    /// Entry module index out of range
    #[error("Entry module index {0} out of range ({1} modules)")]
    InvalidEntryModule(u32, usize),

    /// IO error while reading an image file
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

/// A literal stored in the image literal pool
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A UTF-8 string literal
    String(String),
    /// A 64-bit integer literal
    Integer(i64),
    /// A float literal
    Float(f64),
}

impl Literal {
    fn encode(&self, writer: &mut BytecodeWriter) {
        match self {
            Literal::String(value) => {
                writer.emit_u8(0);
                writer.emit_string(value);
            }
            Literal::Integer(value) => {
                writer.emit_u8(1);
                writer.emit_i64(*value);
            }
            Literal::Float(value) => {
                writer.emit_u8(2);
                writer.emit_f64(*value);
            }
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.offset();

        match reader.read_u8()? {
            0 => Ok(Literal::String(reader.read_string()?)),
            1 => Ok(Literal::Integer(reader.read_i64()?)),
            2 => Ok(Literal::Float(reader.read_f64()?)),
            tag => Err(DecodeError::InvalidOpcode(tag, offset)),
        }
    }
}

/// An entry in the image module table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Module name
    pub name: String,
    /// Index of the module's top-level code object
    pub code_index: u32,
    /// Number of global slots the module uses
    pub globals: u32,
}

/// A compiled Sona program
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Literal pool shared by all code objects
    pub literals: Vec<Literal>,
    /// Module table
    pub modules: Vec<ModuleEntry>,
    /// All top-level code objects
    pub code_objects: Vec<CodeObject>,
    /// Index into `modules` of the entry module
    pub entry_module: u32,
}

impl Image {
    /// Create an empty image
    pub fn new() -> Self {
        Self {
            literals: Vec::new(),
            modules: Vec::new(),
            code_objects: Vec::new(),
            entry_module: 0,
        }
    }

    /// Add a literal, reusing an existing slot when the value is already
    /// present, and return its pool index.
    pub fn add_literal(&mut self, literal: Literal) -> u16 {
        if let Some(index) = self.literals.iter().position(|l| *l == literal) {
            return index as u16;
        }

        self.literals.push(literal);
        (self.literals.len() - 1) as u16
    }

    /// Serialize the image to bytes
    pub fn write(&self) -> Vec<u8> {
        let mut payload = BytecodeWriter::with_capacity(1024);

        payload.emit_u32(self.literals.len() as u32);

        for literal in &self.literals {
            literal.encode(&mut payload);
        }

        payload.emit_u32(self.modules.len() as u32);

        for module in &self.modules {
            payload.emit_string(&module.name);
            payload.emit_u32(module.code_index);
            payload.emit_u32(module.globals);
        }

        payload.emit_u32(self.code_objects.len() as u32);

        for code in &self.code_objects {
            code.encode(&mut payload);
        }

        payload.emit_u32(self.entry_module);

        let payload = payload.into_bytes();
        let mut writer = BytecodeWriter::with_capacity(payload.len() + 16);

        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u64(checksum(&payload));
        writer.emit_bytes(&payload);
        writer.into_bytes()
    }

    /// Parse an image from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut reader = BytecodeReader::new(bytes);

        let magic_bytes = reader.read_bytes(4)?;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&magic_bytes);

        if magic != MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;

        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }

        let expected = reader.read_u64()?;
        let payload = &bytes[reader.offset()..];
        let actual = checksum(payload);

        if expected != actual {
            return Err(ImageError::ChecksumMismatch { expected, actual });
        }

        let literal_count = reader.read_u32()? as usize;
        let mut literals = Vec::with_capacity(literal_count);

        for _ in 0..literal_count {
            literals.push(Literal::decode(&mut reader)?);
        }

        let module_count = reader.read_u32()? as usize;
        let mut modules = Vec::with_capacity(module_count);

        for _ in 0..module_count {
            modules.push(ModuleEntry {
                name: reader.read_string()?,
                code_index: reader.read_u32()?,
                globals: reader.read_u32()?,
            });
        }

        let code_count = reader.read_u32()? as usize;
        let mut code_objects = Vec::with_capacity(code_count);

        for _ in 0..code_count {
            code_objects.push(CodeObject::decode(&mut reader)?);
        }

        let entry_module = reader.read_u32()?;

        if entry_module as usize >= modules.len() {
            return Err(ImageError::InvalidEntryModule(entry_module, modules.len()));
        }

        Ok(Self {
            literals,
            modules,
            code_objects,
            entry_module,
        })
    }

    /// Load and parse an image from a file
    pub fn load_file(path: &std::path::Path) -> Result<Self, ImageError> {
        let bytes = std::fs::read(path)?;

        Self::parse(&bytes)
    }
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncated SHA-256 checksum over the image payload
fn checksum(payload: &[u8]) -> u64 {
    let digest = Sha256::digest(payload);
    let mut bytes = [0u8; 8];

    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Instruction;
    use crate::opcode::Opcode;

    fn example_image() -> Image {
        let mut image = Image::new();

        image.add_literal(Literal::String("ping".to_string()));
        image.add_literal(Literal::Integer(42));
        image.add_literal(Literal::Float(2.5));

        let mut code = CodeObject::new("main", "main.sona", 1);
        code.registers = 2;
        code.instructions = vec![
            Instruction::new(Opcode::LoadLiteral, vec![0, 1], 1),
            Instruction::new(Opcode::Return, vec![0], 2),
        ];

        image.code_objects.push(code);
        image.modules.push(ModuleEntry {
            name: "main".to_string(),
            code_index: 0,
            globals: 4,
        });
        image
    }

    #[test]
    fn test_literal_dedup() {
        let mut image = Image::new();

        let a = image.add_literal(Literal::Integer(1));
        let b = image.add_literal(Literal::Integer(1));
        let c = image.add_literal(Literal::Integer(2));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(image.literals.len(), 2);
    }

    #[test]
    fn test_image_roundtrip() {
        let image = example_image();
        let bytes = image.write();
        let parsed = Image::parse(&bytes).unwrap();

        assert_eq!(parsed, image);

        // Re-encoding yields identical bytes.
        assert_eq!(parsed.write(), bytes);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = example_image().write();
        bytes[0] = b'X';

        assert!(matches!(
            Image::parse(&bytes),
            Err(ImageError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = example_image().write();
        bytes[4] = 99;

        assert!(matches!(
            Image::parse(&bytes),
            Err(ImageError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = example_image().write();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(matches!(
            Image::parse(&bytes),
            Err(ImageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_entry_module() {
        let mut image = example_image();
        image.entry_module = 7;

        let bytes = image.write();

        assert!(matches!(
            Image::parse(&bytes),
            Err(ImageError::InvalidEntryModule(7, 1))
        ));
    }
}
