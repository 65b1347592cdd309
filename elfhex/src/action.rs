//! Runs one assembly job end to end: read the entry file, assemble it, write the output.

use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use assembler::{assemble, AssembleOptions, AssemblyError, ExtensionRegistry};

use crate::cli::Config;
use crate::loader::FilesystemLoader;

/// Assembles `config.input_path` and writes the result to `config.output_path`.
///
/// Matches the original tool's error reporting: an assembly error is printed to standard output
/// (not standard error) followed by a fixed summary line, and the process exits non-zero. I/O
/// errors reading or writing files are reported normally, through `anyhow`.
///
/// # Errors
///
/// Returns an error if the input file cannot be found through `config.include_path`, or if the
/// output file cannot be written.
pub fn run(config: &Config) -> Result<ExitCode> {
    let loader = FilesystemLoader::new(config.include_path.clone());
    let entry_path = config
        .input_path
        .to_str()
        .context("input path is not valid UTF-8")?;

    let options = AssembleOptions {
        entry_label: config.entry_label.clone(),
        max_fragment_depth: config.max_fragment_depth,
        memory_start: config.memory_start,
        no_header: config.no_header,
        header_segment: config.header_segment,
    };

    match assemble(entry_path, &loader, &ExtensionRegistry::with_builtins(), &options) {
        Ok(bytes) => {
            let len = bytes.len();
            fs::write(&config.output_path, bytes)
                .with_context(|| format!("failed to write {}", config.output_path.display()))?;
            println!("Assembled. Total size: {len} bytes.");
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            report_assembly_error(&error);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn report_assembly_error(error: &AssemblyError) {
    println!("{error}");
    println!("Errors were encountered while processing input.");
}
