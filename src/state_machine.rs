// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! A generic table-driven finite-state machine over at most 64 states, with transition
//! validation and an 8-entry ring-buffer trace for fatal diagnostics.
//!
//! This is the primitive [`crate::channel`] and [`crate::worker`] build their own
//! lifecycle state machines on top of. It never returns an error: an illegal transition
//! or an out-of-mask read is a programmer error in the code built on top, and is fatal
//! by design (§4.1).

use std::fmt;

use smallvec::SmallVec;

/// Matches any state; usable as the mask argument to [`StateMachine::expect`] /
/// [`StateMachine::get`] when the caller only wants the current state id, not to
/// constrain it.
pub const ANY: u64 = u64::MAX;

/// An immutable transition table: for each state, the bitmask of states reachable from
/// it, plus a human-readable name for diagnostics. At most 64 states (the bitmask
/// width); `names.len() == states.len()` is an invariant enforced at construction.
#[derive(Debug, Clone, Copy)]
pub struct StateMatrix {
    pub names: &'static [&'static str],
    pub states: &'static [u64],
}

impl StateMatrix {
    #[must_use]
    pub const fn new(names: &'static [&'static str], states: &'static [u64]) -> Self {
        StateMatrix { names, states }
    }

    fn name(&self, state: u8) -> &'static str {
        self.names.get(state as usize).copied().unwrap_or("?")
    }

    fn reachable_from(&self, state: u8) -> Option<u64> {
        self.states.get(state as usize).copied()
    }
}

/// One recorded transition: the call site that performed it, and the state pair.
#[derive(Debug, Clone, Copy)]
struct Trace {
    file: &'static str,
    line: u32,
    from: u8,
    to: u8,
}

const RING_CAPACITY: usize = 8;

/// Fatal state-machine violation, carrying the last up to [`RING_CAPACITY`]
/// transitions in chronological order, ending with the offending one.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StateError {
    /// `set(to)` was called with a state id or a from-state outside `0..64`.
    #[error("state machine: state id {state} is out of range (machine has {max} states)")]
    #[diagnostic(
        code(ltp_runtime::state_machine::out_of_range),
        help("trace:\n{trace}")
    )]
    OutOfRange { state: u8, max: usize, trace: String },

    /// `set(to)` was called with a `to` not reachable from the current state.
    #[error("state machine: illegal transition {from} ({from_name}) -> {to} ({to_name})")]
    #[diagnostic(
        code(ltp_runtime::state_machine::illegal_transition),
        help("trace:\n{trace}")
    )]
    IllegalTransition {
        from: u8,
        from_name: &'static str,
        to: u8,
        to_name: &'static str,
        trace: String,
    },

    /// `expect`/`get` was called with a mask that does not contain the current state.
    #[error("state machine: state {state} ({name}) not in expected mask {mask:#x}")]
    #[diagnostic(code(ltp_runtime::state_machine::unexpected_state), help("trace:\n{trace}"))]
    UnexpectedState {
        state: u8,
        name: &'static str,
        mask: u64,
        trace: String,
    },
}

/// A table-driven state machine. Owns its current state and a ring-buffer trace of the
/// transitions that led to it.
#[derive(Debug)]
pub struct StateMachine {
    mat: &'static StateMatrix,
    current: u8,
    ring: SmallVec<[Trace; RING_CAPACITY]>,
    ring_next: usize,
}

impl StateMachine {
    /// Create a state machine starting in `initial`. The initial state is itself
    /// recorded as the first ring entry (from == to) so a trace printed before any
    /// real transition still shows where the machine began.
    #[track_caller]
    #[must_use]
    pub fn new(mat: &'static StateMatrix, initial: u8) -> Self {
        let loc = std::panic::Location::caller();
        let mut sm = StateMachine {
            mat,
            current: initial,
            ring: SmallVec::new(),
            ring_next: 0,
        };
        sm.push_trace(loc.file(), loc.line(), initial, initial);
        sm
    }

    fn push_trace(&mut self, file: &'static str, line: u32, from: u8, to: u8) {
        let entry = Trace { file, line, from, to };
        if self.ring.len() < RING_CAPACITY {
            self.ring.push(entry);
        } else {
            self.ring[self.ring_next] = entry;
        }
        self.ring_next = (self.ring_next + 1) % RING_CAPACITY;
    }

    fn format_trace(&self) -> String {
        let mut out = String::new();
        // ring is stored oldest-first once full capacity hasn't wrapped; once wrapped,
        // ring_next points at the oldest entry.
        let len = self.ring.len();
        for i in 0..len {
            let idx = if len < RING_CAPACITY { i } else { (self.ring_next + i) % RING_CAPACITY };
            let t = self.ring[idx];
            out.push_str(&format!(
                "  {}:{}: {} ({}) -> {} ({})\n",
                t.file,
                t.line,
                t.from,
                self.mat.name(t.from),
                t.to,
                self.mat.name(t.to)
            ));
        }
        out
    }

    /// Current state id, without validating it against any mask.
    #[must_use]
    pub fn current(&self) -> u8 {
        self.current
    }

    /// Attempt a transition to `to`. Returns the diagnostic error rather than calling
    /// [`crate::result::brk`] itself, so callers in a child process (which may want to
    /// report TBROK over its channel instead of exiting bluntly) retain control; the
    /// top-level convenience is [`StateMachine::set`].
    #[track_caller]
    pub fn try_set(&mut self, to: u8) -> Result<(), StateError> {
        let loc = std::panic::Location::caller();

        if to as usize >= self.mat.states.len() {
            return Err(StateError::OutOfRange {
                state: to,
                max: self.mat.states.len(),
                trace: self.format_trace(),
            });
        }

        let from = self.current;
        let Some(reachable) = self.mat.reachable_from(from) else {
            return Err(StateError::OutOfRange {
                state: from,
                max: self.mat.states.len(),
                trace: self.format_trace(),
            });
        };

        if reachable & (1u64 << to) == 0 {
            return Err(StateError::IllegalTransition {
                from,
                from_name: self.mat.name(from),
                to,
                to_name: self.mat.name(to),
                trace: self.format_trace(),
            });
        }

        self.push_trace(loc.file(), loc.line(), from, to);
        self.current = to;
        Ok(())
    }

    /// Transition to `to`, terminating the process on an illegal transition.
    #[track_caller]
    pub fn set(&mut self, to: u8) {
        if let Err(e) = self.try_set(to) {
            crate::result::brk(crate::result::ResultClass::Brok, e.into());
        }
    }

    /// `Ok(())` iff the current state's bit is set in `mask`.
    #[track_caller]
    pub fn try_expect(&self, mask: u64) -> Result<(), StateError> {
        if mask & (1u64 << self.current) == 0 {
            return Err(StateError::UnexpectedState {
                state: self.current,
                name: self.mat.name(self.current),
                mask,
                trace: self.format_trace(),
            });
        }
        Ok(())
    }

    /// Like [`StateMachine::try_expect`] but fatal on mismatch.
    #[track_caller]
    pub fn expect(&self, mask: u64) {
        if let Err(e) = self.try_expect(mask) {
            crate::result::brk(crate::result::ResultClass::Brok, e.into());
        }
    }

    /// Validate `mask` against the current state and return it.
    #[track_caller]
    pub fn get(&self, mask: u64) -> u8 {
        self.expect(mask);
        self.current
    }
}

impl fmt::Display for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.current, self.mat.name(self.current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static MAT: StateMatrix = StateMatrix::new(
        &["A", "B", "C"],
        &[
            0b010, // A -> B
            0b101, // B -> A, C
            0b000, // C -> (terminal)
        ],
    );

    #[test]
    fn legal_transitions_succeed() {
        let mut sm = StateMachine::new(&MAT, 0);
        assert_eq!(sm.current(), 0);
        sm.try_set(1).unwrap();
        assert_eq!(sm.current(), 1);
        sm.try_set(0).unwrap();
        assert_eq!(sm.current(), 0);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut sm = StateMachine::new(&MAT, 0);
        let err = sm.try_set(2).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { from: 0, to: 2, .. }));
        // current state is unchanged after a rejected transition
        assert_eq!(sm.current(), 0);
    }

    #[test]
    fn out_of_range_state_is_rejected() {
        let mut sm = StateMachine::new(&MAT, 0);
        let err = sm.try_set(200).unwrap_err();
        assert!(matches!(err, StateError::OutOfRange { state: 200, .. }));
    }

    #[test]
    fn expect_validates_mask() {
        let sm = StateMachine::new(&MAT, 1);
        sm.try_expect(0b011).unwrap();
        assert!(sm.try_expect(0b100).is_err());
    }

    #[test]
    fn ring_trace_wraps_and_stays_chronological() {
        let mut sm = StateMachine::new(&MAT, 0);
        for _ in 0..10 {
            sm.try_set(1).unwrap();
            sm.try_set(0).unwrap();
        }
        let trace = sm.format_trace();
        // exactly RING_CAPACITY lines recorded, oldest first
        assert_eq!(trace.lines().count(), RING_CAPACITY);
    }
}
