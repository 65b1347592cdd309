//! Command line parsing and [`Config`] construction.

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};

/// The fully parsed configuration for one run of `elfhex`.
#[derive(Clone, Debug)]
pub struct Config {
    /// The entry file to assemble.
    pub input_path: PathBuf,
    /// Where the assembled executable is written.
    pub output_path: PathBuf,
    /// Directories searched, in order, to resolve `include` directives.
    pub include_path: Vec<PathBuf>,
    /// The label naming the first instruction to execute.
    pub entry_label: String,
    /// The maximum number of fixed-point passes fragment expansion may take.
    pub max_fragment_depth: i64,
    /// The virtual address the ELF header is mapped at.
    pub memory_start: u64,
    /// Skip writing the ELF header and program header table, emitting raw segment bytes only.
    pub no_header: bool,
    /// Place the ELF header and program header table in a dedicated `PT_LOAD` segment.
    pub header_segment: bool,
}

/// Parses `elfhex`'s arguments into a [`Config`].
pub fn get_config() -> Config {
    let matches = command_parser().get_matches();
    parse_arguments(&matches)
}

/// Returns the command parser for `elfhex`.
fn command_parser() -> Command {
    Command::new("elfhex")
        .about("Assembles a hexadecimal source file into a 32-bit ELF executable")
        .arg(
            Arg::new("input_path")
                .help("Location of the input EH file")
                .required(true),
        )
        .arg(
            Arg::new("output_path")
                .help("Location for the output executable")
                .required(true),
        )
        .arg(
            Arg::new("memory_start")
                .short('s')
                .long("memory-start")
                .help("The starting memory address, in hexadecimal")
                .default_value("08048000"),
        )
        .arg(
            Arg::new("max_fragment_depth")
                .short('f')
                .long("max-fragment-depth")
                .help("The maximum depth when resolving fragment references")
                .default_value("16"),
        )
        .arg(
            Arg::new("entry_label")
                .short('e')
                .long("entry-label")
                .help("The label to use as the entry point")
                .default_value("_start"),
        )
        .arg(
            Arg::new("include_path")
                .short('i')
                .long("include-path")
                .help("A path to search for source files (repeatable)")
                .action(ArgAction::Append)
                .default_value("."),
        )
        .arg(
            Arg::new("no_header")
                .short('r')
                .long("no-header")
                .help("Do not output the ELF header")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("header_segment")
                .short('H')
                .long("header-segment")
                .help("Place the ELF header in its own PT_LOAD segment")
                .action(ArgAction::SetTrue),
        )
}

/// Parses a [`Config`] out of already-matched arguments.
///
/// # Panics
///
/// Panics if `matches` was not produced by [`command_parser`], or if a numeric argument's
/// default value is malformed — both are programmer errors, not user input errors.
fn parse_arguments(matches: &ArgMatches) -> Config {
    let input_path = PathBuf::from(
        matches
            .get_one::<String>("input_path")
            .unwrap_or_else(|| unreachable!("`input_path` is a required argument")),
    );
    let output_path = PathBuf::from(
        matches
            .get_one::<String>("output_path")
            .unwrap_or_else(|| unreachable!("`output_path` is a required argument")),
    );
    let include_path = matches
        .get_many::<String>("include_path")
        .unwrap_or_else(|| unreachable!("`include_path` has a default value"))
        .map(PathBuf::from)
        .collect();
    let entry_label = matches
        .get_one::<String>("entry_label")
        .unwrap_or_else(|| unreachable!("`entry_label` has a default value"))
        .clone();
    let max_fragment_depth = matches
        .get_one::<String>("max_fragment_depth")
        .unwrap_or_else(|| unreachable!("`max_fragment_depth` has a default value"))
        .parse()
        .unwrap_or_else(|_| panic!("`max_fragment_depth` must be an integer"));
    let memory_start = u64::from_str_radix(
        matches
            .get_one::<String>("memory_start")
            .unwrap_or_else(|| unreachable!("`memory_start` has a default value")),
        16,
    )
    .unwrap_or_else(|_| panic!("`memory_start` must be a hexadecimal integer"));
    let no_header = matches.get_flag("no_header");
    let header_segment = matches.get_flag("header_segment");

    Config {
        input_path,
        output_path,
        include_path,
        entry_label,
        max_fragment_depth,
        memory_start,
        no_header,
        header_segment,
    }
}
