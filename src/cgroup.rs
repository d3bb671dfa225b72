// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Unified view over the host's v1/v2 cgroup hierarchies.
//!
//! [`Cgroup::require`] provisions whatever controllers the caller names (mounting a
//! hierarchy if none is already present) and wires up an aggregated
//! [`item::CgroupFile`] per control, so test code writes `cgroup.memory.max.write(...)`
//! once instead of fanning out across v1/v2 itself. [`Cgroup::cleanup`] tears
//! everything this process created back down, regardless of whether the caller's test
//! body succeeded.

pub mod core;
pub mod item;

pub use core::{CgroupError, Ctrl, Opts, Root, Ver};
pub use item::{CgroupFile, Item};

/// Aggregated `memory.*` controls.
#[derive(Debug, Default)]
pub struct Memory {
    pub max: CgroupFile,
    pub current: CgroupFile,
    pub swap_max: CgroupFile,
}

impl Item for Memory {
    fn exists(&self) -> bool {
        self.max.exists()
    }
}

/// Aggregated `cpuset.*` controls.
#[derive(Debug, Default)]
pub struct Cpuset {
    pub cpus: CgroupFile,
    pub mems: CgroupFile,
}

impl Item for Cpuset {
    fn exists(&self) -> bool {
        self.cpus.exists()
    }
}

/// Aggregated generic `cgroup.*` controls, present in every hierarchy's per-test
/// directory regardless of which controller the directory was provisioned for.
#[derive(Debug, Default)]
pub struct Generic {
    pub procs: CgroupFile,
    pub subtree_control: CgroupFile,
}

impl Item for Generic {
    fn exists(&self) -> bool {
        self.procs.exists()
    }
}

/// One logical cgroup aggregated across however many hierarchies back it. Owns the
/// [`Root`] per provisioned controller plus the per-controller file groups bound to
/// it.
#[derive(Debug, Default)]
pub struct Cgroup {
    roots: Vec<(Ctrl, Root)>,
    pub memory: Memory,
    pub cpuset: Cpuset,
    pub generic: Generic,
}

impl Cgroup {
    /// Provision every controller in `ctrls`, binding the corresponding file group's
    /// locations to each resulting [`Root`]. Calling this twice for the same
    /// controller is idempotent modulo a log line: [`core::Root::require`] reuses an
    /// existing `ltp` directory rather than recreating it.
    pub fn require(ctrls: &[Ctrl], opts: &Opts) -> Result<Self, CgroupError> {
        let mut cg = Cgroup::default();
        for &ctrl in ctrls {
            let root = Root::require(ctrl, opts)?;
            match ctrl {
                Ctrl::Memory => {
                    cg.memory.max.name = "memory.max";
                    cg.memory.max.bind(&root);
                    cg.memory.current.name = "memory.current";
                    cg.memory.current.bind(&root);
                    cg.memory.swap_max.name = "memory.swap.max";
                    cg.memory.swap_max.bind(&root);
                }
                Ctrl::Cpuset => {
                    cg.cpuset.cpus.name = "cpuset.cpus";
                    cg.cpuset.cpus.bind(&root);
                    cg.cpuset.mems.name = "cpuset.mems";
                    cg.cpuset.mems.bind(&root);
                }
            }
            cg.generic.procs.name = "cgroup.procs";
            cg.generic.procs.bind(&root);
            cg.generic.subtree_control.name = "cgroup.subtree_control";
            cg.generic.subtree_control.bind(&root);
            cg.roots.push((ctrl, root));
        }
        Ok(cg)
    }

    /// Whether `ctrl` was actually provisioned (as opposed to silently skipped because
    /// no hierarchy on this host could supply it).
    #[must_use]
    pub fn has(&self, ctrl: Ctrl) -> bool {
        self.roots.iter().any(|(c, _)| *c == ctrl)
    }

    /// Tear down every root this call provisioned, in per-root order: drain the
    /// per-test cgroup, then (if we created it) drain and remove `ltp`, disable the
    /// controller on V2, and unmount anything we mounted ourselves.
    pub fn cleanup(&mut self) -> Result<(), CgroupError> {
        for (ctrl, root) in self.roots.drain(..) {
            root.cleanup(ctrl)?;
        }
        Ok(())
    }
}
