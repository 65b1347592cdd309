//! A hexadecimal "assembler" that produces statically linked ELF32 executables.

use std::process::ExitCode;

use anyhow::Result;

pub mod action;
pub mod cli;
pub mod loader;

fn main() -> Result<ExitCode> {
    let config = cli::get_config();
    action::run(&config)
}
