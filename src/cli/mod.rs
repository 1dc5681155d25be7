use std::path::PathBuf;
use std::process;

use clap::Parser;

/// ccon — a minimal JSON-driven Linux container runtime.
#[derive(Parser, Debug)]
#[command(name = "ccon", about)]
pub struct Cli {
    /// Print version information and exit.
    #[arg(short = 'v', long)]
    pub version: bool,

    /// Enable debug logging to stderr.
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Override config.json with an alternate path.
    #[arg(short = 'c', long, value_name = "PATH", default_value = "config.json")]
    pub config: PathBuf,

    /// Specify config JSON on the command line, overriding --config and its PATH.
    #[arg(short = 's', long, value_name = "JSON")]
    pub config_string: Option<String>,
}

/// Parse CLI arguments. Called from `main`.
///
/// Help goes to stdout and exits 0; anything malformed prints usage to
/// stderr and exits 1.
pub fn parse() -> Cli {
    Cli::try_parse().unwrap_or_else(|err| {
        let code = if err.use_stderr() { 1 } else { 0 };
        let _ = err.print();
        process::exit(code);
    })
}
