// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! Declarative test glue: describe what a test needs, and let [`run`] verify it,
//! build a scratch environment for it, call its hooks, and turn the tally into an
//! exit code.
//!
//! A [`TestDecl`] names its preconditions up front rather than probing for them ad
//! hoc inside `test`/`setup`: a missing precondition is TCONF (the environment can't
//! run this test), never TFAIL or TBROK, and the harness enforces that distinction in
//! one place instead of trusting every test body to get it right.

use std::path::{Path, PathBuf};

use crate::cgroup::Ctrl;
use crate::config::Config;
use crate::result::{ResultClass, tally, tst_res};

/// One thing that must hold before a test's body runs. Checked in declaration order;
/// the first unmet precondition short-circuits the rest (no point reporting "kconfig
/// missing" after already reporting "wrong kernel").
#[derive(Debug, Clone)]
pub enum Precondition {
    /// Running kernel must be at least `major.minor.patch`.
    MinKernel(u32, u32, u32),
    /// `/sys/fs/cgroup` must expose this controller, v1 or v2.
    CgroupController(Ctrl),
    /// This symbol must appear as `=y` or `=m` in the running kernel's `.config`.
    KernelConfig(&'static str),
    /// One of these filesystem types must be registered in `/proc/filesystems`.
    RequiresFilesystem(&'static [&'static str]),
    /// A scratch directory must be creatable (always true unless `tmpdir` is
    /// read-only or full; listed explicitly so its failure reports TCONF, not TBROK,
    /// the same as every other environment precondition).
    NeedsTmpdir,
}

/// What a test wants done with a block device before `setup` runs.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Smallest acceptable device size, in megabytes.
    pub min_size_mb: u64,
    /// `mkfs` with this filesystem type before mounting, if the device isn't already
    /// formatted as one of [`Precondition::RequiresFilesystem`]'s types.
    pub format_with: Option<&'static str>,
    /// Directory name (under the test's tmpdir) to mount the device at.
    pub mountpoint: &'static str,
}

pub type Hook = Box<dyn FnMut(&mut Context)>;
pub type IndexedHook = Box<dyn FnMut(&mut Context, usize)>;

/// Per-run state handed to every hook: the resolved configuration, the tmpdir the
/// harness chdir'd into (if one was requested), and the device mountpoint (if one was
/// requested and mounted).
#[derive(Debug)]
pub struct Context {
    pub config: Config,
    pub tmpdir: Option<PathBuf>,
    pub mountpoint: Option<PathBuf>,
    pub cgroup: Option<crate::cgroup::Cgroup>,
}

/// A declarative test: preconditions plus lifecycle hooks. `test_count` of `0` means
/// exactly one `test` call (index `0`) or, if only `test_all` is set, a single call to
/// that instead; any larger value repeats `test` that many times, matching the
/// reference library's `tcnt`/`test`+`test_all` split.
pub struct TestDecl {
    pub name: &'static str,
    pub preconditions: Vec<Precondition>,
    pub device: Option<DeviceSpec>,
    pub test_count: usize,
    pub setup: Option<Hook>,
    pub test: Option<IndexedHook>,
    pub test_all: Option<Hook>,
    pub cleanup: Option<Hook>,
}

impl Default for TestDecl {
    fn default() -> Self {
        TestDecl {
            name: "",
            preconditions: Vec::new(),
            device: None,
            test_count: 0,
            setup: None,
            test: None,
            test_all: None,
            cleanup: None,
        }
    }
}

impl std::fmt::Debug for TestDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDecl")
            .field("name", &self.name)
            .field("preconditions", &self.preconditions)
            .field("test_count", &self.test_count)
            .finish_non_exhaustive()
    }
}

impl TestDecl {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        TestDecl { name, ..TestDecl::default() }
    }
}

/// Runs a fallible syscall-shaped closure and scores the outcome without aborting the
/// process, the way a test body reports "this specific call behaved as expected" amid
/// a run that may still have more assertions left to make. Corresponds to the
/// reference's `TST_EXP_*` macro family; `#[track_caller]` recovers the call site the
/// macros got from `__FILE__`/`__LINE__`.
#[derive(Debug)]
pub struct Exp;

impl Exp {
    /// Pass iff `f()` returns `Ok` and the value is `>= 0` (or any `Ok` for a
    /// non-numeric success type); fail with the carried error otherwise. Mirrors
    /// `TST_EXP_POSITIVE`/`TST_EXP_FD`/`TST_EXP_PID`.
    #[track_caller]
    pub fn positive<T, E>(label: &str, f: impl FnOnce() -> Result<T, E>) -> Option<T>
    where
        T: PartialOrd + Default + std::fmt::Display,
        E: std::fmt::Display,
    {
        match f() {
            Ok(v) if v >= T::default() => {
                tst_res(ResultClass::Pass, format!("{label}: {v}"));
                Some(v)
            }
            Ok(v) => {
                tst_res(ResultClass::Fail, format!("{label}: unexpected negative value {v}"));
                None
            }
            Err(e) => {
                tst_res(ResultClass::Fail, format!("{label}: {e}"));
                None
            }
        }
    }

    /// Pass iff `f()` returns `Ok(expected)`; fail otherwise. Mirrors `TST_EXP_VAL`.
    #[track_caller]
    pub fn matches<T, E>(label: &str, expected: T, f: impl FnOnce() -> Result<T, E>) -> bool
    where
        T: PartialEq + std::fmt::Display,
        E: std::fmt::Display,
    {
        match f() {
            Ok(v) if v == expected => {
                tst_res(ResultClass::Pass, format!("{label}: got expected {v}"));
                true
            }
            Ok(v) => {
                tst_res(ResultClass::Fail, format!("{label}: expected {expected}, got {v}"));
                false
            }
            Err(e) => {
                tst_res(ResultClass::Fail, format!("{label}: {e}"));
                false
            }
        }
    }

    /// Pass iff `f()` fails with one of `expected`; fail if it succeeds or fails with
    /// a different errno. Mirrors `TST_EXP_FAIL`/`TST_EXP_FAIL_ARR`.
    #[track_caller]
    pub fn fails_with<T: std::fmt::Display>(label: &str, expected: &[nix::errno::Errno], f: impl FnOnce() -> Result<T, nix::errno::Errno>) -> bool {
        match f() {
            Ok(v) => {
                tst_res(ResultClass::Fail, format!("{label}: unexpectedly succeeded with {v}"));
                false
            }
            Err(e) if expected.contains(&e) => {
                tst_res(ResultClass::Pass, format!("{label}: failed with expected {e}"));
                true
            }
            Err(e) => {
                tst_res(ResultClass::Fail, format!("{label}: failed with {e}, expected one of {expected:?}"));
                false
            }
        }
    }
}

fn kernel_release() -> String {
    rustix::system::uname().release().to_string_lossy().into_owned()
}

/// Parse the leading `major.minor.patch` out of a release string like
/// `"6.8.0-45-generic"`, stopping at the first non-digit/dot run.
fn parse_kernel_version(release: &str) -> Option<(u32, u32, u32)> {
    let head = release.split(|c: char| !c.is_ascii_digit() && c != '.').next()?;
    let mut parts = head.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some((major, minor, patch))
}

fn kconfig_has(symbol: &str) -> bool {
    let release = kernel_release();
    let candidates = [PathBuf::from(format!("/boot/config-{release}")), PathBuf::from("/proc/config.gz")];
    for path in candidates {
        if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            continue; // reading a gzipped config needs a decompressor this crate doesn't carry; skip it.
        }
        if let Ok(text) = std::fs::read_to_string(&path) {
            if text.lines().any(|l| l.trim_start() == format!("{symbol}=y") || l.trim_start() == format!("{symbol}=m")) {
                return true;
            }
        }
    }
    false
}

fn filesystem_registered(types: &[&str]) -> bool {
    let Ok(text) = std::fs::read_to_string("/proc/filesystems") else { return false };
    types.iter().any(|want| text.lines().any(|l| l.split_whitespace().last() == Some(*want)))
}

/// Check one precondition, returning a TCONF message if it isn't met.
fn check(pre: &Precondition) -> Result<(), String> {
    match pre {
        Precondition::MinKernel(maj, min, patch) => {
            let release = kernel_release();
            let Some(running) = parse_kernel_version(&release) else {
                return Err(format!("could not parse kernel release {release:?}"));
            };
            if running < (*maj, *min, *patch) {
                return Err(format!("kernel {release} older than required {maj}.{min}.{patch}"));
            }
            Ok(())
        }
        Precondition::CgroupController(ctrl) => {
            let mut probe = crate::cgroup::Cgroup::require(&[*ctrl], &crate::cgroup::Opts::default())
                .map_err(|e| format!("cgroup controller {} unavailable: {e}", ctrl.name()))?;
            let _ = probe.cleanup();
            Ok(())
        }
        Precondition::KernelConfig(symbol) => {
            if kconfig_has(symbol) {
                Ok(())
            } else {
                Err(format!("kernel config {symbol} not enabled"))
            }
        }
        Precondition::RequiresFilesystem(types) => {
            if filesystem_registered(types) {
                Ok(())
            } else {
                Err(format!("none of {types:?} registered in /proc/filesystems"))
            }
        }
        Precondition::NeedsTmpdir => Ok(()),
    }
}

fn needs_tmpdir(decl: &TestDecl) -> bool {
    decl.device.is_some() || decl.preconditions.iter().any(|p| matches!(p, Precondition::NeedsTmpdir))
}

fn make_tmpdir(config: &Config, name: &str) -> Result<PathBuf, std::io::Error> {
    let dir = config.tmpdir.join(format!("{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn mount_device(config: &Config, dir: &Path, dev: &DeviceSpec) -> Result<PathBuf, String> {
    let device = config.device.as_ref().ok_or_else(|| "no device configured (LTP_DEVICE/--device unset)".to_string())?;
    let meta = std::fs::metadata(device).map_err(|e| format!("stat {}: {e}", device.display()))?;
    let size_mb = meta.len() / (1024 * 1024);
    if size_mb < dev.min_size_mb {
        return Err(format!("device {} is {size_mb}MB, need at least {}MB", device.display(), dev.min_size_mb));
    }

    if let Some(fs_type) = dev.format_with {
        let status = std::process::Command::new(format!("mkfs.{fs_type}"))
            .arg("-F")
            .arg(device)
            .status()
            .map_err(|e| format!("spawning mkfs.{fs_type}: {e}"))?;
        if !status.success() {
            return Err(format!("mkfs.{fs_type} {} exited with {status}", device.display()));
        }
    }

    let mountpoint = dir.join(dev.mountpoint);
    std::fs::create_dir_all(&mountpoint).map_err(|e| format!("creating {}: {e}", mountpoint.display()))?;
    rustix::mount::mount(device.as_os_str(), &mountpoint, "", rustix::mount::MountFlags::empty(), "")
        .map_err(|e| format!("mounting {} at {}: {e}", device.display(), mountpoint.display()))?;
    Ok(mountpoint)
}

/// Run one [`TestDecl`] to completion: verify preconditions, set up a tmpdir/device if
/// requested, call `setup`/`test`(s)/`cleanup`, tally the outcome, and return the
/// process exit code §6 derives from the tally.
///
/// `cleanup` runs even if `setup`/`test` reported `TFAIL`/`TBROK` along the way — the
/// tally already has the record of what went wrong; leaving a mount or a cgroup behind
/// would just break the next test in the same harness binary.
pub fn run(mut decl: TestDecl, config: Config) -> i32 {
    for pre in &decl.preconditions {
        if let Err(reason) = check(pre) {
            tst_res(ResultClass::Conf, format!("{}: {reason}", decl.name));
            return tally().exit_code();
        }
    }

    let saved_cwd = std::env::current_dir().ok();
    let saved_tmpdir_env = std::env::var_os("TMPDIR");
    let mut ctx = Context { config: config.clone(), tmpdir: None, mountpoint: None, cgroup: None };

    if needs_tmpdir(&decl) {
        match make_tmpdir(&config, decl.name) {
            Ok(dir) => {
                if std::env::set_current_dir(&dir).is_err() {
                    tst_res(ResultClass::Brok, format!("{}: could not chdir into {}", decl.name, dir.display()));
                    return tally().exit_code();
                }
                unsafe { std::env::set_var("TMPDIR", &dir) };
                ctx.tmpdir = Some(dir);
            }
            Err(e) => {
                tst_res(ResultClass::Brok, format!("{}: could not create tmpdir: {e}", decl.name));
                return tally().exit_code();
            }
        }
    }

    if let (Some(dev), Some(dir)) = (&decl.device, ctx.tmpdir.clone()) {
        match mount_device(&config, &dir, dev) {
            Ok(mountpoint) => ctx.mountpoint = Some(mountpoint),
            Err(reason) => {
                tst_res(ResultClass::Conf, format!("{}: {reason}", decl.name));
                restore_cwd(&saved_cwd);
                restore_tmpdir_env(&saved_tmpdir_env);
                cleanup_tmpdir(&ctx);
                return tally().exit_code();
            }
        }
    }

    let ctrls: Vec<Ctrl> = decl
        .preconditions
        .iter()
        .filter_map(|p| match p {
            Precondition::CgroupController(c) => Some(*c),
            _ => None,
        })
        .collect();
    if !ctrls.is_empty() {
        match crate::cgroup::Cgroup::require(&ctrls, &crate::cgroup::Opts::default()) {
            Ok(cg) => ctx.cgroup = Some(cg),
            Err(e) => {
                // Already checked as a precondition above; a failure here means the
                // environment changed between the check and provisioning.
                tst_res(ResultClass::Brok, format!("{}: cgroup provisioning changed since precondition check: {e}", decl.name));
                restore_cwd(&saved_cwd);
                restore_tmpdir_env(&saved_tmpdir_env);
                cleanup_tmpdir(&ctx);
                return tally().exit_code();
            }
        }
    }

    if let Some(mut setup) = decl.setup.take() {
        setup(&mut ctx);
    }

    if let Some(mut test_all) = decl.test_all.take() {
        test_all(&mut ctx);
    } else if let Some(mut test) = decl.test.take() {
        let count = decl.test_count.max(1);
        for i in 0..count {
            test(&mut ctx, i);
        }
    }

    if let Some(mut cleanup) = decl.cleanup.take() {
        cleanup(&mut ctx);
    }

    if let Some(mountpoint) = &ctx.mountpoint {
        let _ = rustix::mount::unmount(mountpoint, rustix::mount::UnmountFlags::DETACH);
    }
    if let Some(cgroup) = &mut ctx.cgroup {
        let _ = cgroup.cleanup();
    }
    restore_cwd(&saved_cwd);
    restore_tmpdir_env(&saved_tmpdir_env);
    cleanup_tmpdir(&ctx);

    tally().exit_code()
}

fn restore_cwd(saved: &Option<PathBuf>) {
    if let Some(dir) = saved {
        let _ = std::env::set_current_dir(dir);
    }
}

/// Undo the `TMPDIR` export `run` makes for the duration of a test that needs one,
/// restoring whatever the process had before (or unsetting it if it had nothing).
fn restore_tmpdir_env(saved: &Option<std::ffi::OsString>) {
    match saved {
        Some(val) => unsafe { std::env::set_var("TMPDIR", val) },
        None => unsafe { std::env::remove_var("TMPDIR") },
    }
}

fn cleanup_tmpdir(ctx: &Context) {
    if let Some(dir) = &ctx.tmpdir {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_release() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic"), Some((6, 8, 0)));
    }

    #[test]
    fn parses_short_release() {
        assert_eq!(parse_kernel_version("5.4"), Some((5, 4, 0)));
    }

    #[test]
    fn rejects_garbage_release() {
        assert_eq!(parse_kernel_version(""), None);
    }

    // The process-wide tally is shared by every test in this binary; serialize the
    // two below so they don't observe each other's increments.
    #[test]
    #[serial_test::serial(tally)]
    fn exp_positive_scores_pass_on_nonnegative() {
        let before = tally().pass();
        let out = Exp::positive("probe", || Ok::<i32, std::io::Error>(3));
        assert_eq!(out, Some(3));
        assert_eq!(tally().pass(), before + 1);
    }

    #[test]
    #[serial_test::serial(tally)]
    fn exp_fails_with_matches_expected_errno() {
        let before = tally().pass();
        let ok = Exp::fails_with::<i32>(
            "open missing",
            &[nix::errno::Errno::ENOENT],
            || Err(nix::errno::Errno::ENOENT),
        );
        assert!(ok);
        assert_eq!(tally().pass(), before + 1);
    }

    // `TMPDIR` is process-wide state; serialize with anything else touching it.
    #[test]
    #[serial_test::serial(tmpdir_env)]
    fn run_exports_tmpdir_for_the_test_body_and_restores_it_after() {
        let saved = std::env::var_os("TMPDIR");
        unsafe { std::env::set_var("TMPDIR", "/nonexistent-before-run") };

        let decl = TestDecl {
            name: "tmpdir_env_probe",
            preconditions: vec![Precondition::NeedsTmpdir],
            test: Some(Box::new(|ctx, _| {
                let exported = std::env::var("TMPDIR").expect("TMPDIR set during run");
                let expected = ctx.tmpdir.as_ref().expect("tmpdir in context");
                assert_eq!(PathBuf::from(exported), *expected);
            })),
            ..Default::default()
        };
        run(decl, Config::from_env());

        assert_eq!(std::env::var_os("TMPDIR"), Some("/nonexistent-before-run".into()));

        match saved {
            Some(val) => unsafe { std::env::set_var("TMPDIR", val) },
            None => unsafe { std::env::remove_var("TMPDIR") },
        }
    }
}
