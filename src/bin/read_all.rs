// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Thin CLI front-end for [`ltp_runtime::read_all`]: parse the scratch-directory-style
//! overrides shared by every harness binary, wire up logging, and run the stress test
//! against a caller-supplied root.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ltp_runtime::config::ConfigArgs;
use ltp_runtime::read_all;

/// Recursively read every regular file under a directory using a supervised pool of
/// worker processes.
#[derive(Debug, Parser)]
struct Cli {
    /// Directory to walk.
    root: PathBuf,

    /// Number of reader worker processes; defaults to `min(ncpus - 1, 15)`.
    #[arg(long)]
    readers: Option<usize>,

    /// Per-read timeout in milliseconds before a reader is killed and restarted.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Glob pattern to skip; may be repeated.
    #[arg(long = "exclude")]
    blacklist: Vec<String>,

    /// Drop reader worker privileges to `nobody` before reading.
    #[arg(long)]
    drop_privileges: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

fn main() {
    let cli = Cli::parse();

    let mut config = ltp_runtime::Config::from_env();
    config.apply_cli(&cli.config);
    ltp_runtime::log_init::init(&config);

    let mut read_all_config = read_all::Config::new(cli.root);
    if let Some(readers) = cli.readers {
        read_all_config.readers = readers;
    }
    read_all_config.per_read_timeout = config.scaled_timeout(Duration::from_millis(cli.timeout_ms));
    read_all_config.drop_privileges = cli.drop_privileges;
    for pattern in cli.blacklist {
        read_all_config.exclude(pattern);
    }

    let code = match read_all::run(&read_all_config) {
        Ok(_stats) => ltp_runtime::result::tally().exit_code(),
        Err(e) => {
            ltp_runtime::result::brk(ltp_runtime::ResultClass::Brok, miette::Report::new(e));
        }
    };
    std::process::exit(code);
}
