//! Sona VM Runtime
//!
//! This crate provides the virtual machine runtime including:
//! - Tagged value and object model
//! - Per-process generational garbage collector
//! - Lightweight processes with asynchronous mailboxes
//! - Work-stealing scheduler with primary and blocking pools
//! - Bytecode interpreter with table-driven exception unwinding
//! - Reactor thread for timers and blocking completions

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod binding;
pub mod config;
pub mod context;
pub mod generator;
pub mod heap;
pub mod interpreter;
pub mod mailbox;
pub mod message;
pub mod object;
pub mod platform;
pub mod process;
pub mod process_table;
pub mod reactor;
pub mod scheduler;
pub mod state;
pub mod symbol;
pub mod value;
pub mod vm;

pub use config::Config;
pub use process::{Process, ProcessId, ProcessStatus};
pub use state::VmState;
pub use value::Value;
pub use vm::Vm;

/// Fatal VM errors
///
/// These are the errors that terminate the whole machine. Recoverable thrown
/// values never surface here: they travel the catch tables inside the
/// interpreter instead.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A process panicked; the formatted trace has been printed
    #[error("Process panicked: {0}")]
    Panic(String),

    /// The image could not be loaded
    #[error("Image error: {0}")]
    Image(#[from] sona_bytecode::ImageError),

    /// A worker thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(std::io::Error),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
