// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Discovery, mounting, and per-test directory provisioning for the cgroup v1/v2
//! hierarchies a test needs.
//!
//! LTP tests want one controller (memory, cpuset, ...) without caring whether the
//! system runs unified v2 or split v1 hierarchies, or whether the controller is
//! already mounted. [`scan`] finds what is already there; [`Root::require`] mounts
//! whatever is missing and creates this process's private `ltp/drain` and
//! `ltp/test-<pid>` subtrees inside it; [`Root::cleanup`] drains and removes them. The
//! aggregate view callers actually use is [`crate::cgroup::Cgroup`].

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::rc::Rc;

pub const MAX_TREES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ver {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ctrl {
    Memory,
    Cpuset,
}

impl Ctrl {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Ctrl::Memory => "memory",
            Ctrl::Cpuset => "cpuset",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    /// Never look at an already-mounted V2 hierarchy; only ever reuse or mount a V1
    /// controller. Mirrors `tst_cgroup_require`'s `mnt_v2` knob inverted.
    pub only_mount_v1: bool,
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CgroupError {
    #[error("failed to read /proc/self/mountinfo")]
    #[diagnostic(code(ltp_runtime::cgroup::mountinfo))]
    MountInfo(#[source] std::io::Error),

    #[error("failed to mount cgroup controller {0}")]
    #[diagnostic(
        code(ltp_runtime::cgroup::mount),
        help("this usually means the test needs CAP_SYS_ADMIN or the controller is unavailable")
    )]
    Mount(String, #[source] std::io::Error),

    #[error("failed to unmount {0:?}")]
    #[diagnostic(code(ltp_runtime::cgroup::umount))]
    Umount(PathBuf, #[source] std::io::Error),

    #[error("no cgroup v1 or v2 hierarchy available for controller {0}")]
    #[diagnostic(code(ltp_runtime::cgroup::unavailable))]
    Unavailable(String),

    #[error("available controllers changed between scans of the unified v2 hierarchy")]
    #[diagnostic(code(ltp_runtime::cgroup::v2_controllers_changed))]
    V2ControllersChanged,

    #[error("two v1 hierarchies both claim controller {0}, which the kernel should never allow")]
    #[diagnostic(code(ltp_runtime::cgroup::v1_controller_collision))]
    V1ControllerCollision(String),

    #[error("control file {0} not found in any mounted tree")]
    #[diagnostic(code(ltp_runtime::cgroup::missing_file))]
    MissingFile(String),

    #[error("aggregated file {name} disagrees across hierarchies: {a:?} at {a_path:?} vs {b:?} at {b_path:?}")]
    #[diagnostic(
        code(ltp_runtime::cgroup::divergent_read),
        help(
            "every live location backing one aggregated control file is supposed to read back \
             the same bytes; this is a harness/environment inconsistency, not a test failure"
        )
    )]
    Divergent { name: String, a: String, a_path: PathBuf, b: String, b_path: PathBuf },

    #[error("failed to parse {0:?} as an integer")]
    #[diagnostic(code(ltp_runtime::cgroup::parse_int))]
    ParseInt(String),

    #[error(transparent)]
    #[diagnostic(code(ltp_runtime::cgroup::io))]
    Io(#[source] std::io::Error),

    #[error("failed to create cgroup directory {0:?}")]
    #[diagnostic(code(ltp_runtime::cgroup::mkdir))]
    Mkdir(PathBuf, #[source] std::io::Error),
}

/// One mounted cgroup hierarchy as discovered by [`scan`], before any per-test
/// subdirectory has been provisioned.
#[derive(Debug, Clone)]
pub struct Tree {
    pub ver: Ver,
    pub ctrl: Option<Ctrl>,
    pub mountpoint: PathBuf,
    /// Controllers this unified (v2) hierarchy actually has enabled, per
    /// `cgroup.controllers`. Empty (and unused) for v1 trees, which carry their single
    /// controller in `ctrl` instead.
    pub v2_controllers: Vec<Ctrl>,
}

fn read_v2_controllers(mountpoint: &std::path::Path) -> Vec<Ctrl> {
    let Ok(text) = std::fs::read_to_string(mountpoint.join("cgroup.controllers")) else {
        return Vec::new();
    };
    text.split_whitespace()
        .filter_map(|name| [Ctrl::Memory, Ctrl::Cpuset].into_iter().find(|c| c.name() == name))
        .collect()
}

fn mountinfo_trees() -> Result<Vec<Tree>, CgroupError> {
    let text = std::fs::read_to_string("/proc/self/mountinfo").map_err(CgroupError::MountInfo)?;
    let mut v2_seen: Option<PathBuf> = None;
    let mut trees = Vec::new();

    for line in text.lines() {
        // mountinfo fields: ... mount_point ... - fstype source options
        let Some(dash_pos) = line.find(" - ") else { continue };
        let (left, right) = line.split_at(dash_pos);
        let mut right_fields = right[3..].split_whitespace();
        let Some(fstype) = right_fields.next() else { continue };
        let Some(_source) = right_fields.next() else { continue };
        let options = right_fields.next().unwrap_or("");

        let left_fields: Vec<&str> = left.split_whitespace().collect();
        let Some(&mountpoint) = left_fields.get(4) else { continue };

        match fstype {
            "cgroup2" => {
                // Only one unified hierarchy can exist system-wide; a second mountinfo
                // line for it is a bind-mount of the same tree, not a second tree.
                if let Some(seen) = &v2_seen {
                    if seen != mountpoint {
                        return Err(CgroupError::V2ControllersChanged);
                    }
                    continue;
                }
                v2_seen = Some(PathBuf::from(mountpoint));
                let v2_controllers = read_v2_controllers(std::path::Path::new(mountpoint));
                trees.push(Tree { ver: Ver::V2, ctrl: None, mountpoint: PathBuf::from(mountpoint), v2_controllers });
            }
            "cgroup" => {
                for ctrl in [Ctrl::Memory, Ctrl::Cpuset] {
                    if options.split(',').any(|o| o == ctrl.name()) {
                        if trees.iter().any(|t| t.ver == Ver::V1 && t.ctrl == Some(ctrl)) {
                            return Err(CgroupError::V1ControllerCollision(ctrl.name().to_string()));
                        }
                        trees.push(Tree {
                            ver: Ver::V1,
                            ctrl: Some(ctrl),
                            mountpoint: PathBuf::from(mountpoint),
                            v2_controllers: Vec::new(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    Ok(trees)
}

/// Search the system for already-mounted cgroup hierarchies and available
/// controllers. Called automatically by [`Root::require`]; exposed on its own for
/// diagnostics ([`print_config`]).
pub fn scan() -> Result<Vec<Tree>, CgroupError> {
    mountinfo_trees()
}

/// Render the detected trees as a human-readable config dump, the equivalent of
/// `tst_cgroup_print_config`.
#[must_use]
pub fn print_config(trees: &[Tree]) -> String {
    let mut out = String::new();
    for t in trees {
        match t.ctrl {
            Some(ctrl) => {
                out.push_str(&format!("v1 {} mounted at {}\n", ctrl.name(), t.mountpoint.display()));
            }
            None => out.push_str(&format!("v2 unified mounted at {}\n", t.mountpoint.display())),
        }
    }
    out
}

fn find_tree(trees: &[Tree], ctrl: Ctrl) -> Option<&Tree> {
    trees
        .iter()
        .find(|t| (t.ver == Ver::V2 && t.v2_controllers.contains(&ctrl)) || t.ctrl == Some(ctrl))
}

/// Prefix every cgroup mount created by this crate lives under (§6 filesystem layout).
pub const MOUNT_PREFIX: &str = "/tmp/cgroup_";

fn mount_v1(ctrl: Ctrl) -> Result<Tree, CgroupError> {
    let mountpoint = PathBuf::from(format!("{MOUNT_PREFIX}{}", ctrl.name()));
    std::fs::create_dir_all(&mountpoint).map_err(|e| CgroupError::Mkdir(mountpoint.clone(), e))?;

    rustix::mount::mount(
        "cgroup",
        &mountpoint,
        "cgroup",
        rustix::mount::MountFlags::empty(),
        ctrl.name(),
    )
    .map_err(|e| CgroupError::Mount(ctrl.name().to_string(), std::io::Error::from_raw_os_error(e.raw_os_error())))?;

    Ok(Tree { ver: Ver::V1, ctrl: Some(ctrl), mountpoint, v2_controllers: Vec::new() })
}

fn mount_v2() -> Result<Tree, CgroupError> {
    let mountpoint = PathBuf::from(format!("{MOUNT_PREFIX}unified"));
    std::fs::create_dir_all(&mountpoint).map_err(|e| CgroupError::Mkdir(mountpoint.clone(), e))?;

    rustix::mount::mount(
        "cgroup2",
        &mountpoint,
        "cgroup2",
        rustix::mount::MountFlags::empty(),
        "",
    )
    .map_err(|e| CgroupError::Mount("unified".to_string(), std::io::Error::from_raw_os_error(e.raw_os_error())))?;

    let v2_controllers = read_v2_controllers(&mountpoint);
    Ok(Tree { ver: Ver::V2, ctrl: None, mountpoint, v2_controllers })
}

/// A mounted hierarchy with this process's provisioned subtree: `<mount>/ltp`,
/// `<mount>/ltp/drain`, and `<mount>/ltp/test-<pid>`. `owned` is true iff this process
/// mounted the hierarchy itself, in which case [`Root::cleanup`] unmounts it too.
#[derive(Debug, Clone)]
pub struct Root {
    pub tree: Tree,
    pub owned: bool,
    pub ltp_created: bool,
    pub ltp: PathBuf,
    pub drain: PathBuf,
    pub test: PathBuf,
    /// `O_DIRECTORY` handle on `test`, opened once in [`Root::require`]. Every
    /// [`super::item::CgroupFile`] bound to this root reads and writes through
    /// `openat`/`statat` relative to this descriptor rather than re-resolving `test`'s
    /// path on every call, closing the TOCTOU window a second provisioning pass (or an
    /// attacker racing a rename under `/tmp`) would otherwise open.
    pub(super) dir: Rc<OwnedFd>,
}

impl Root {
    fn subtree_control_file(&self, dir: &std::path::Path) -> PathBuf {
        dir.join("cgroup.subtree_control")
    }

    /// Ensure `ctrl` is available, mounting a hierarchy if nothing usable is already
    /// present, then create (idempotently) the `ltp`/`drain`/`test-<pid>` subdirectory
    /// chain inside it.
    pub fn require(ctrl: Ctrl, opts: &Opts) -> Result<Self, CgroupError> {
        let trees = scan()?;

        let existing = if opts.only_mount_v1 {
            trees.iter().find(|t| t.ctrl == Some(ctrl)).cloned()
        } else {
            find_tree(&trees, ctrl).cloned()
        };

        let (tree, owned) = match existing {
            Some(t) => (t, false),
            None if opts.only_mount_v1 => (mount_v1(ctrl)?, true),
            None => match find_tree(&trees, ctrl) {
                Some(t) => (t.clone(), false),
                None => match mount_v2() {
                    Ok(t) if t.v2_controllers.contains(&ctrl) => (t, true),
                    Ok(t) => {
                        // The kernel mounted unified cgroups fine, but this controller
                        // isn't compiled in / enabled; back out and fall through to a
                        // dedicated v1 mount instead of leaving a useless tree behind.
                        let _ = rustix::mount::unmount(&t.mountpoint, rustix::mount::UnmountFlags::DETACH);
                        let _ = std::fs::remove_dir(&t.mountpoint);
                        (mount_v1(ctrl)?, true)
                    }
                    Err(_) => (mount_v1(ctrl)?, true),
                },
            },
        };

        let ltp = tree.mountpoint.join("ltp");
        let ltp_created = !ltp.exists();
        std::fs::create_dir_all(&ltp).map_err(|e| CgroupError::Mkdir(ltp.clone(), e))?;

        if tree.ver == Ver::V2 {
            if owned {
                let _ = std::fs::write(tree.mountpoint.join("cgroup.subtree_control"), format!("+{}", ctrl.name()));
            }
            let _ = std::fs::write(ltp.join("cgroup.subtree_control"), format!("+{}", ctrl.name()));
        } else {
            let _ = std::fs::write(ltp.join("cgroup.clone_children"), "1");
            if ctrl == Ctrl::Cpuset {
                if let Ok(cpus) = std::fs::read_to_string(tree.mountpoint.join("cpuset.cpus")) {
                    let _ = std::fs::write(ltp.join("cpuset.cpus"), cpus);
                }
                if let Ok(mems) = std::fs::read_to_string(tree.mountpoint.join("cpuset.mems")) {
                    let _ = std::fs::write(ltp.join("cpuset.mems"), mems);
                }
            }
        }

        let drain = ltp.join("drain");
        std::fs::create_dir_all(&drain).map_err(|e| CgroupError::Mkdir(drain.clone(), e))?;

        let test = ltp.join(format!("test-{}", std::process::id()));
        std::fs::create_dir_all(&test).map_err(|e| CgroupError::Mkdir(test.clone(), e))?;

        let dir = rustix::fs::open(&test, rustix::fs::OFlags::DIRECTORY | rustix::fs::OFlags::RDONLY, rustix::fs::Mode::empty())
            .map_err(|e| CgroupError::Io(std::io::Error::from_raw_os_error(e.raw_os_error())))?;

        Ok(Root { tree, owned, ltp_created, ltp, drain, test, dir: Rc::new(dir) })
    }

    fn drain_procs(src: &std::path::Path, dst: &std::path::Path) {
        let procs_path = src.join("cgroup.procs");
        let Ok(procs) = std::fs::read_to_string(&procs_path) else { return };
        for pid in procs.lines() {
            let _ = std::fs::write(dst.join("cgroup.procs"), pid);
        }
    }

    /// Drain the per-test cgroup into `drain`, remove it, then — if this call created
    /// the `ltp` directory — drain `ltp` into the mount root, remove `drain` and `ltp`,
    /// disable the controller on V2, and unmount any hierarchy this process mounted.
    pub fn cleanup(&self, ctrl: Ctrl) -> Result<(), CgroupError> {
        Self::drain_procs(&self.test, &self.drain);
        if self.test.exists() {
            std::fs::remove_dir(&self.test).map_err(CgroupError::Io)?;
        }

        if self.ltp_created {
            Self::drain_procs(&self.drain, &self.tree.mountpoint);
            if self.drain.exists() {
                std::fs::remove_dir(&self.drain).map_err(CgroupError::Io)?;
            }
            if self.tree.ver == Ver::V2 {
                let _ = std::fs::write(self.subtree_control_file(&self.tree.mountpoint), format!("-{}", ctrl.name()));
            }
            if self.ltp.exists() {
                std::fs::remove_dir(&self.ltp).map_err(CgroupError::Io)?;
            }
        }

        if self.owned {
            rustix::mount::unmount(&self.tree.mountpoint, rustix::mount::UnmountFlags::DETACH)
                .map_err(|e| CgroupError::Umount(self.tree.mountpoint.clone(), std::io::Error::from_raw_os_error(e.raw_os_error())))?;
            if self.tree.mountpoint.exists() {
                std::fs::remove_dir(&self.tree.mountpoint).map_err(CgroupError::Io)?;
            }
        }

        Ok(())
    }
}
