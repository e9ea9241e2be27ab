//! The `sona` binary
//!
//! Loads a bytecode image, runs it on the VM and exits with the program's
//! status: 0 when the main process returns normally, 1 on an unhandled
//! panic, any other value for an explicit exit.

use clap::Parser;
use sona_bytecode::Image;
use sona_vm::{Config, Vm};
use std::path::PathBuf;
use std::process::exit;

#[derive(Parser)]
#[command(name = "sona")]
#[command(about = "Run a Sona bytecode image", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the bytecode image to run
    image: PathBuf,

    /// Arguments forwarded to the program
    #[arg(trailing_var_arg = true)]
    arguments: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let image = match Image::load_file(&cli.image) {
        Ok(image) => image,
        Err(error) => {
            eprintln!("sona: {}: {}", cli.image.display(), error);
            exit(1);
        }
    };

    let vm = Vm::with_arguments(image, Config::from_env(), cli.arguments);

    match vm.run() {
        Ok(code) => exit(code),
        Err(error) => {
            eprintln!("sona: {}", error);
            exit(1);
        }
    }
}
