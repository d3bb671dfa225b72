// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Runtime configuration: environment variables first, CLI overrides layered on top.
//!
//! Precedence is CLI > environment > built-in default, matching §10.3. Harness
//! binaries build a [`Config`] once at startup via [`Config::from_env`], then apply
//! their `clap`-derived flags with [`Config::apply_cli`].

use std::path::PathBuf;
use std::time::Duration;

/// Variables the harness reads at startup. Anything it mutates for the duration of a
/// test run (currently: `TMPDIR`) is restored in [`crate::harness`] cleanup regardless
/// of the test's outcome.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block/loop device path tests may format and mount. `LTP_DEVICE`.
    pub device: Option<PathBuf>,
    /// Scratch directory root. `LTP_TMPDIR`, defaults to `std::env::temp_dir()`.
    pub tmpdir: PathBuf,
    /// Multiplies every test's advertised `max_runtime`. `LTP_RUNTIME_MUL`.
    pub runtime_mul: f64,
    /// Multiplies every worker/channel timeout. `LTP_TIMEOUT_MUL`.
    pub timeout_mul: f64,
    /// `tracing_subscriber::EnvFilter` directive string. `LTP_LOG`.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: None,
            tmpdir: std::env::temp_dir(),
            runtime_mul: 1.0,
            timeout_mul: 1.0,
            log_filter: "info".to_owned(),
        }
    }
}

impl Config {
    /// Build a [`Config`] from the well-known environment variables, falling back to
    /// [`Config::default`] for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Config::default();
        Config {
            device: std::env::var_os("LTP_DEVICE").map(PathBuf::from),
            tmpdir: std::env::var_os("LTP_TMPDIR")
                .map(PathBuf::from)
                .unwrap_or(default.tmpdir),
            runtime_mul: std::env::var("LTP_RUNTIME_MUL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.runtime_mul),
            timeout_mul: std::env::var("LTP_TIMEOUT_MUL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.timeout_mul),
            log_filter: std::env::var("LTP_LOG").unwrap_or(default.log_filter),
        }
    }

    /// Scale a nominal runtime by `runtime_mul`.
    #[must_use]
    pub fn scaled_runtime(&self, nominal: Duration) -> Duration {
        nominal.mul_f64(self.runtime_mul.max(0.0))
    }

    /// Scale a nominal timeout by `timeout_mul`.
    #[must_use]
    pub fn scaled_timeout(&self, nominal: Duration) -> Duration {
        nominal.mul_f64(self.timeout_mul.max(0.0))
    }
}

/// CLI overrides shared by harness binaries. Fields are `Option` so "not passed on the
/// command line" is distinguishable from "explicitly set to the default".
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    /// Path to a block/loop device tests may format and mount.
    #[arg(long)]
    pub device: Option<PathBuf>,

    /// Scratch directory root, overriding `LTP_TMPDIR`.
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Multiplier applied to every test's advertised max runtime.
    #[arg(long)]
    pub runtime_mul: Option<f64>,

    /// Multiplier applied to every worker/channel timeout.
    #[arg(long)]
    pub timeout_mul: Option<f64>,

    /// `tracing_subscriber::EnvFilter` directive string, overriding `LTP_LOG`.
    #[arg(long)]
    pub log: Option<String>,
}

impl Config {
    /// Layer CLI-supplied overrides on top of the environment-derived configuration.
    pub fn apply_cli(&mut self, args: &ConfigArgs) {
        if let Some(device) = &args.device {
            self.device = Some(device.clone());
        }
        if let Some(tmpdir) = &args.tmpdir {
            self.tmpdir = tmpdir.clone();
        }
        if let Some(mul) = args.runtime_mul {
            self.runtime_mul = mul;
        }
        if let Some(mul) = args.timeout_mul {
            self.timeout_mul = mul;
        }
        if let Some(log) = &args.log {
            self.log_filter = log.clone();
        }
    }
}
