mod cli;
mod core;
mod platform;
mod util;

use std::process;

use crate::core::config::Config;
use crate::util::log::{self, diag};

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args = cli::parse();

    if args.version {
        println!("ccon {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    log::set_verbose(args.verbose);

    let config = match &args.config_string {
        Some(json) => Config::from_inline(json),
        None => Config::from_file(&args.config),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            diag!("{err:#}");
            return 1;
        }
    };

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        diag!("ccon only runs on Linux");
        return 1;
    }

    #[cfg(target_os = "linux")]
    match platform::linux::runtime::run(&config) {
        Ok(code) => code,
        Err(err) => {
            diag!("{err:#}");
            1
        }
    }
}
