// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Core runtime shared by test programs: a generic state machine, a single-threaded
//! epoll event loop, a framed pipe-pair message channel, a supervised fork/worker pool,
//! a streaming JSON reader, a netlink request builder, a cgroup v1/v2 aggregation model,
//! a parallel directory-read stress engine, and the declarative test harness that ties
//! them together.
//!
//! None of this is test-program-specific. Individual conformance tests are users of
//! this crate, not part of it; they link against the pieces they need and call into
//! [`harness`] to register themselves.
//!
//! # Failure philosophy
//!
//! Most of the surface here never returns an error to its caller. A state machine
//! transition into an undeclared state, a channel protocol violation, a worker that
//! cannot be reaped — these represent a broken harness or a broken test, not a
//! recoverable condition, and are reported through [`result::brk`] which renders a
//! diagnostic and exits the process. The exception is the small `tst_exp_*` family in
//! [`harness`], which exists precisely so test code can assert about a syscall's
//! *expected* failure without that assertion itself being fatal.

pub mod cgroup;
pub mod channel;
pub mod config;
pub mod event_loop;
pub mod harness;
pub mod json;
pub mod log_init;
pub mod netlink;
pub mod read_all;
pub mod result;
pub mod state_machine;
pub mod worker;

pub use config::Config;
pub use result::{ResultClass, tst_res};
pub use state_machine::{StateMachine, StateMatrix};
