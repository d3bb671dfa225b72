// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Result-class taxonomy and the per-process outcome tally.
//!
//! Every subsystem reports through [`tst_res`] rather than writing to stdout directly,
//! so a single code path owns both the human-readable log line and the tally that
//! decides the process exit code.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// The five scoring classes plus the two non-scoring diagnostic levels.
///
/// TPASS/TFAIL/TCONF/TBROK are mutually exclusive verdicts about one assertion; TINFO
/// and TWARN never affect the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    /// A specific assertion held.
    Pass,
    /// A specific assertion failed; the test itself still ran to completion.
    Fail,
    /// The environment cannot meaningfully run this test (missing controller,
    /// unsupported syscall, insufficient privilege). Not a failure.
    Conf,
    /// The harness itself malfunctioned (I/O error, protocol violation, impossible
    /// state). Fatal.
    Brok,
    /// Non-scoring informational message.
    Info,
    /// Non-scoring warning.
    Warn,
}

impl ResultClass {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ResultClass::Brok | ResultClass::Conf)
    }

    #[must_use]
    pub fn tracing_level(self) -> tracing::Level {
        match self {
            ResultClass::Pass | ResultClass::Info => tracing::Level::INFO,
            ResultClass::Fail | ResultClass::Warn | ResultClass::Conf => tracing::Level::WARN,
            ResultClass::Brok => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultClass::Pass => "TPASS",
            ResultClass::Fail => "TFAIL",
            ResultClass::Conf => "TCONF",
            ResultClass::Brok => "TBROK",
            ResultClass::Info => "TINFO",
            ResultClass::Warn => "TWARN",
        };
        f.write_str(s)
    }
}

/// Process-wide tally of scoring outcomes, consulted to compute the exit code.
#[derive(Debug, Default)]
pub struct Tally {
    pass: AtomicU32,
    fail: AtomicU32,
    conf: AtomicU32,
    brok: AtomicU32,
}

impl Tally {
    #[must_use]
    pub const fn new() -> Self {
        Tally {
            pass: AtomicU32::new(0),
            fail: AtomicU32::new(0),
            conf: AtomicU32::new(0),
            brok: AtomicU32::new(0),
        }
    }

    fn record(&self, class: ResultClass) {
        let counter = match class {
            ResultClass::Pass => &self.pass,
            ResultClass::Fail => &self.fail,
            ResultClass::Conf => &self.conf,
            ResultClass::Brok => &self.brok,
            ResultClass::Info | ResultClass::Warn => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pass(&self) -> u32 {
        self.pass.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fail(&self) -> u32 {
        self.fail.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn conf(&self) -> u32 {
        self.conf.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn brok(&self) -> u32 {
        self.brok.load(Ordering::Relaxed)
    }

    /// Exit code per §6: 0 if every scoring result was TPASS, otherwise the first
    /// non-zero class in TBROK > TCONF > TFAIL precedence order.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.brok() > 0 {
            2
        } else if self.conf() > 0 {
            32
        } else if self.fail() > 0 {
            1
        } else {
            0
        }
    }
}

static TALLY: Tally = Tally::new();

/// The process-wide tally. Tests in the same binary share one; worker children get
/// their own after fork since the tally is not inherited across an `exec`-free fork in
/// any way that matters here (each side only ever reports its own outcomes up its own
/// channel).
#[must_use]
pub fn tally() -> &'static Tally {
    &TALLY
}

/// Report one result. Records it in the tally (if scoring) and emits a structured
/// tracing event carrying the call site.
#[track_caller]
pub fn tst_res(class: ResultClass, msg: impl fmt::Display) {
    let loc = std::panic::Location::caller();
    tally().record(class);
    match class.tracing_level() {
        tracing::Level::ERROR => {
            tracing::error!(result = %class, file = loc.file(), line = loc.line(), "{msg}");
        }
        tracing::Level::WARN => {
            tracing::warn!(result = %class, file = loc.file(), line = loc.line(), "{msg}");
        }
        _ => {
            tracing::info!(result = %class, file = loc.file(), line = loc.line(), "{msg}");
        }
    }
}

/// Terminate the process after reporting a fatal (`TBROK`/`TCONF`) diagnostic.
///
/// This never returns. It is not `panic!`: a `brk` condition is not meant to unwind or
/// be caught, it is meant to stop the process immediately with a rendered report on
/// stderr and the tally-derived exit code.
#[track_caller]
pub fn brk(class: ResultClass, report: miette::Report) -> ! {
    debug_assert!(class.is_terminal(), "brk() called with a non-terminal class");
    tst_res(class, format!("{report:?}"));
    eprintln!("{report:?}");
    std::process::exit(tally().exit_code());
}
