// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Process-level logging and diagnostic-rendering setup.
//!
//! Call [`init`] once, early in `main`. It installs a [`tracing_subscriber::fmt`] layer
//! filtered by an [`tracing_subscriber::EnvFilter`] built from [`Config::log_filter`],
//! and a [`miette`] report hook so [`crate::result::brk`] renders with a fixed,
//! predictable width (we have no terminal-size probing dependency in this stack, unlike
//! interactive TUI tooling, so we fall back to a conservative 100 columns).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;

/// Install the global tracing subscriber and miette report hook. Idempotent-ish: a
/// second call will panic, same as `tracing_subscriber`'s own `try_init` semantics
/// surfaced directly, since a process only ever wants one subscriber.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish()
        .init();

    miette::set_hook(Box::new(|_report| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .width(100)
                .wrap_lines(true)
                .force_graphical(false)
                .context_lines(3)
                .with_cause_chain()
                .build(),
        )
    }))
    .ok();
}
