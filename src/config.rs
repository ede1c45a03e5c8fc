//! Command-line configuration for `partlink` and `partgen`.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// A minimal x86_64 ELF linker that merges partial arrays.
///
/// Sections named `partial_array_<group>` from every input are concatenated
/// into one block per group, framed by `__start_`/`__stop_` symbols.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files and archives (driver flags are accepted and ignored)
    #[arg(required = true, allow_hyphen_values = true, num_args = 1..)]
    pub inputs: Vec<String>,

    /// Output file
    #[arg(short, long, default_value = "a.out", help = "Path to the output executable")]
    pub output: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    /// Print the boundary metadata of every merged group
    #[arg(long)]
    pub print_groups: bool,
}

/// What the linker was actually asked to do once driver noise is removed.
#[derive(Debug, PartialEq, Eq)]
pub struct Invocation {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub log_level: String,
    pub print_groups: bool,
}

impl Config {
    /// Splits the raw argument list.
    ///
    /// `allow_hyphen_values` makes clap hand every argument after the first
    /// input to `inputs`, so `-o`, `--log-level` and `--print-groups` are
    /// picked out here.
    /// Other flags and arguments that are not existing files are dropped.
    pub fn invocation(self) -> Invocation {
        let mut output = self.output;
        let mut log_level = self.log_level;
        let mut print_groups = self.print_groups;
        let mut inputs = Vec::new();

        let mut args = self.inputs.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-o" => {
                    if let Some(path) = args.next() {
                        output = PathBuf::from(path);
                    }
                }
                "--log-level" => {
                    if let Some(level) = args.next() {
                        log_level = level;
                    }
                }
                flag if flag.starts_with("--log-level=") => {
                    log_level = flag["--log-level=".len()..].to_string();
                }
                "--print-groups" => print_groups = true,
                flag if flag.starts_with('-') => {}
                path => {
                    let path = PathBuf::from(path);
                    if path.exists() {
                        inputs.push(path);
                    }
                }
            }
        }

        Invocation {
            inputs,
            output,
            log_level,
            print_groups,
        }
    }
}

/// Generates Rust tables from partial-array manifests.
///
/// For targets whose linker cannot merge sections, every fragment is listed in
/// a TOML manifest and this tool writes one sized static per group.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct GenConfig {
    /// Manifest files, in contribution order
    #[arg(required = true, num_args = 1..)]
    pub manifests: Vec<PathBuf>,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Groups that must resolve, in addition to manifest `references`
    #[arg(long = "require", value_name = "GROUP")]
    pub require: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
