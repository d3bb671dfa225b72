// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! `read_all`: a parallel recursive-read stress driver built entirely on
//! [`crate::event_loop`], [`crate::channel`], and [`crate::worker`] — no new IPC
//! primitive, just a particular wiring of the three.
//!
//! One dir-walker child recursively finds regular files under a root and streams their
//! paths back one at a time; the parent fans each path out to whichever reader child
//! is currently idle. A reader opens the path non-blocking, reads up to one kibibyte,
//! and reports back. A reader that overruns its time-to-live is killed and replaced;
//! the path it was working on is requeued so a later reader picks it back up.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::channel::Mode;
use crate::worker::{Worker, WorkerError, WorkerPool, WorkerSpec};

/// Longest path `read_all` will forward between processes.
const PATH_CAP: usize = 4096;
/// Longest reply a reader sends back (a little-endian `u64` microsecond count).
const REPLY_CAP: usize = 8;
/// Cap on how many "worker timed out" warnings get logged, so a slow filesystem full
/// of blocking files doesn't flood stdout (§4.8 edge cases).
const TIMEOUT_WARNING_CAP: u32 = 15;

/// Glob patterns every `read_all` run skips by default, carried over from the
/// reference implementation's blacklist table: known-slow or single-shot
/// pseudo-files that tell us nothing new on a repeat read and cost real wall-clock
/// time against a populated `/sys`.
const DEFAULT_BLACKLIST: &[&str] = &[
    "/sys/kernel/debug/*",
    "/sys/devices/platform/*/eeprom",
    "/sys/devices/platform/*/nvmem",
    "/sys/*/cpu[0-9][0-9]*",
];

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ReadAllError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerError),

    #[error("failed to walk {0:?}")]
    #[diagnostic(code(ltp_runtime::read_all::walk))]
    Walk(PathBuf, #[source] std::io::Error),

    #[error("invalid blacklist glob {0:?}")]
    #[diagnostic(code(ltp_runtime::read_all::bad_glob))]
    BadGlob(String, #[source] glob::PatternError),
}

/// Configuration for one `read_all` run.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub readers: usize,
    pub per_read_timeout: Duration,
    pub blacklist: Vec<String>,
    pub drop_privileges: bool,
}

impl Config {
    /// `readers` defaults to `min(ncpus - 1, 15)`, at least 1.
    #[must_use]
    pub fn default_reader_count() -> usize {
        let ncpus = std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1);
        ncpus.saturating_sub(1).clamp(1, 15)
    }

    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Config {
            root: root.into(),
            readers: Self::default_reader_count(),
            per_read_timeout: Duration::from_secs(5),
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| (*s).to_string()).collect(),
            drop_privileges: false,
        }
    }

    /// Add a caller-supplied blacklist pattern on top of [`DEFAULT_BLACKLIST`], the
    /// Rust shape of the reference's one reserved extra blacklist slot.
    pub fn exclude(&mut self, pattern: impl Into<String>) {
        self.blacklist.push(pattern.into());
    }
}

/// Final tally reported once the engine's event loop has drained.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub files_read: u64,
    pub reader_restarts: u64,
}

struct EngineState {
    queue: VecDeque<String>,
    walker_done: bool,
    blacklist: Vec<glob::Pattern>,
    readers_busy: Vec<bool>,
    readers_terminated: Vec<bool>,
    readers_inflight: Vec<Option<String>>,
    pool_index_to_slot: HashMap<usize, usize>,
    pending_restart: Vec<usize>,
    timeout_warnings: u32,
    stats: Stats,
}

impl EngineState {
    fn blacklisted(&self, path: &str) -> bool {
        self.blacklist.iter().any(|p| p.matches(path))
    }
}

/// What `ReadAllEngine::dispatch` decided to do with one idle reader slot.
enum Dispatch {
    Path(String),
    Terminate,
}

fn walk(root: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            let _ = walk(&entry.path(), out);
        } else if meta.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// The dir-walker child's body: depth-first walk of `root`, one `send` per regular
/// file, terminated by an empty payload. Traversal errors on individual entries are
/// swallowed (a permission-denied subdirectory under `/sys` is routine, not fatal);
/// a failure to even open `root` is fatal.
fn walker_body(root: PathBuf) -> Box<dyn FnOnce(&mut Worker) -> i32> {
    Box::new(move |w: &mut Worker| {
        let mut files = Vec::new();
        if let Err(e) = walk(&root, &mut files) {
            crate::result::tst_res(
                crate::result::ResultClass::Brok,
                format!("read_all: failed to walk {}: {e}", root.display()),
            );
            return 1;
        }
        for path in files {
            let bytes = path.as_os_str().as_encoded_bytes();
            if w.send(bytes).is_err() {
                return 1;
            }
        }
        let _ = w.send(b"");
        0
    })
}

/// A reader child's body: receive a path, stat-free open/read/close it, reply with
/// elapsed microseconds; an empty path is the exit signal.
fn reader_body(drop_privileges: bool) -> Box<dyn FnOnce(&mut Worker) -> i32> {
    Box::new(move |w: &mut Worker| {
        if drop_privileges {
            drop_to_nobody();
        }
        loop {
            let Ok(Some(path_bytes)) = w.recv(PATH_CAP) else { return 1 };
            if path_bytes.is_empty() {
                return 0;
            }
            // SAFETY: the walker only ever sends bytes it read back out of
            // `OsStr::as_encoded_bytes` on this same platform.
            let path = unsafe { std::ffi::OsStr::from_encoded_bytes_unchecked(&path_bytes) };
            let elapsed = read_one(Path::new(path));
            if w.send(&elapsed.to_le_bytes()).is_err() {
                return 1;
            }
        }
    })
}

fn read_one(path: &Path) -> u64 {
    use std::io::Read;
    let start = Instant::now();
    if let Ok(mut f) = std::fs::OpenOptions::new().read(true).custom_flags(libc::O_NONBLOCK).open(path) {
        let mut buf = [0u8; 1024];
        let _ = f.read(&mut buf);
    }
    start.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
}

fn drop_to_nobody() {
    let Ok(Some(user)) = nix::unistd::User::from_name("nobody") else {
        tracing::warn!("read_all: privilege drop requested but user 'nobody' was not found");
        return;
    };
    if let Err(e) = nix::unistd::setgid(user.gid) {
        tracing::warn!("read_all: setgid(nobody) failed: {e}");
        return;
    }
    if let Err(e) = nix::unistd::setuid(user.uid) {
        tracing::warn!("read_all: setuid(nobody) failed: {e}");
    }
}

/// The `read_all` stress driver: one dir-walker feeding a pool of reader workers.
pub struct ReadAllEngine {
    pool: WorkerPool,
    state: Rc<RefCell<EngineState>>,
}

impl std::fmt::Debug for ReadAllEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadAllEngine").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl ReadAllEngine {
    /// Spawn the dir-walker and the configured number of readers. Worker index 0 is
    /// always the walker; indices `1..=readers` (and any index appended later by a
    /// restart) are readers.
    pub fn start(config: &Config) -> Result<Self, ReadAllError> {
        let blacklist = config
            .blacklist
            .iter()
            .map(|p| glob::Pattern::new(p).map_err(|e| ReadAllError::BadGlob(p.clone(), e)))
            .collect::<Result<Vec<_>, _>>()?;

        let state = Rc::new(RefCell::new(EngineState {
            queue: VecDeque::new(),
            walker_done: false,
            blacklist,
            readers_busy: vec![false; config.readers],
            readers_terminated: vec![false; config.readers],
            readers_inflight: vec![None; config.readers],
            pool_index_to_slot: HashMap::new(),
            pending_restart: Vec::new(),
            timeout_warnings: 0,
            stats: Stats::default(),
        }));

        let mut pool = WorkerPool::setup(config.per_read_timeout)?;

        let walker_index = pool.spawn(WorkerSpec {
            name: "read_all-walker".into(),
            mode: Mode::Async,
            body: walker_body(config.root.clone()),
        })?;
        debug_assert_eq!(walker_index, 0);
        Self::wire_walker(&pool, walker_index, state.clone());

        for slot in 0..config.readers {
            let index = pool.spawn(WorkerSpec {
                name: format!("read_all-reader-{slot}"),
                mode: Mode::Async,
                body: reader_body(config.drop_privileges),
            })?;
            state.borrow_mut().pool_index_to_slot.insert(index, slot);
            Self::wire_reader(&pool, index, state.clone());
        }

        Ok(ReadAllEngine { pool, state })
    }

    fn wire_walker(pool: &WorkerPool, index: usize, state: Rc<RefCell<EngineState>>) {
        let w = pool.get(index);
        w.borrow_mut().set_on_recved(move |worker, data| {
            let mut st = state.borrow_mut();
            if data.is_empty() {
                st.walker_done = true;
            } else {
                let path = String::from_utf8_lossy(data).into_owned();
                if !st.blacklisted(&path) {
                    st.queue.push_back(path);
                }
            }
            drop(st);
            // Dispatch to idle readers happens in `ReadAllEngine::run`'s own loop: it
            // is the only place holding a mutable handle on every reader's `Worker`,
            // which a hook closure captured on just the walker can't also obtain
            // without a second live borrow of the same pool.
            let _ = worker.recv(PATH_CAP);
        });
        let _ = w.borrow_mut().recv(PATH_CAP);
    }

    fn wire_reader(pool: &WorkerPool, index: usize, state: Rc<RefCell<EngineState>>) {
        let w = pool.get(index);

        {
            let state = state.clone();
            w.borrow_mut().set_on_recved(move |worker, _reply| {
                let mut st = state.borrow_mut();
                let slot = st.pool_index_to_slot[&worker.index()];
                st.stats.files_read += 1;
                st.readers_busy[slot] = false;
                st.readers_inflight[slot] = None;
                // Assigning this slot its next path (or terminator) is `dispatch`'s
                // job, called from `ReadAllEngine::run`'s loop right after this hook
                // returns — it alone holds a mutable handle on every reader.
            });
        }

        {
            let state = state.clone();
            w.borrow_mut().set_on_timeout(move |worker| {
                let mut st = state.borrow_mut();
                if st.timeout_warnings < TIMEOUT_WARNING_CAP {
                    st.timeout_warnings += 1;
                    crate::result::tst_res(
                        crate::result::ResultClass::Warn,
                        format!("{}: timed out, killing and restarting", worker.idstr()),
                    );
                }
                drop(st);
                let _ = worker.kill();
            });
        }

        {
            let state = state.clone();
            w.borrow_mut().set_on_died(move |worker| {
                let mut st = state.borrow_mut();
                let slot = st.pool_index_to_slot[&worker.index()];
                if let Some(path) = st.readers_inflight[slot].take() {
                    st.queue.push_front(path);
                }
                st.readers_busy[slot] = false;
                st.stats.reader_restarts += 1;
                st.pending_restart.push(slot);
            });
        }
    }

    /// Assign work to every idle, not-yet-terminated reader: the next queued path if
    /// there is one, or the empty-payload terminator once the walker is done and the
    /// queue has run dry. Called after every event-loop pump (and once up front), so
    /// a reader idle from the moment it was spawned still gets terminated even if it
    /// never completes a single read.
    fn dispatch(&mut self) {
        let slots: Vec<usize> = {
            let st = self.state.borrow();
            (0..st.readers_busy.len())
                .filter(|&slot| !st.readers_busy[slot] && !st.readers_terminated[slot])
                .collect()
        };
        for slot in slots {
            let Some(index) = ({
                let st = self.state.borrow();
                st.pool_index_to_slot.iter().find(|(_, &s)| s == slot).map(|(i, _)| *i)
            }) else {
                continue;
            };

            let action = {
                let mut st = self.state.borrow_mut();
                if st.readers_busy[slot] || st.readers_terminated[slot] {
                    None
                } else if let Some(path) = st.queue.pop_front() {
                    st.readers_busy[slot] = true;
                    st.readers_inflight[slot] = Some(path.clone());
                    Some(Dispatch::Path(path))
                } else if st.walker_done {
                    st.readers_terminated[slot] = true;
                    Some(Dispatch::Terminate)
                } else {
                    None
                }
            };

            let Some(action) = action else { continue };
            let worker = self.pool.get(index);
            match action {
                Dispatch::Path(path) => {
                    let mut w = worker.borrow_mut();
                    let _ = w.send(path.as_bytes());
                    let _ = w.recv(REPLY_CAP);
                }
                Dispatch::Terminate => {
                    let _ = worker.borrow_mut().send(b"");
                }
            }
        }
    }

    fn respawn_dead_readers(&mut self, config: &Config) -> Result<(), ReadAllError> {
        let pending: Vec<usize> = std::mem::take(&mut self.state.borrow_mut().pending_restart);
        for slot in pending {
            let index = self.pool.spawn(WorkerSpec {
                name: format!("read_all-reader-{slot}"),
                mode: Mode::Async,
                body: reader_body(config.drop_privileges),
            })?;
            self.state.borrow_mut().pool_index_to_slot.insert(index, slot);
            Self::wire_reader(&self.pool, index, self.state.clone());
        }
        Ok(())
    }

    /// True once the walker is done, the queue is empty, no dead reader is waiting on
    /// a replacement, and every reader slot has been sent its terminator. This does
    /// *not* imply every reader process has actually exited yet — [`WorkerPool::run_once`]'s
    /// own `any_running` return value covers that half; `run` waits for both.
    fn drained(&self) -> bool {
        let st = self.state.borrow();
        st.walker_done
            && st.queue.is_empty()
            && st.pending_restart.is_empty()
            && st.readers_terminated.iter().all(|&t| t)
    }

    /// Drive the engine to completion: dispatch queued paths and terminators, pump
    /// the event loop, respawn any reader that died, repeat until the walker is done,
    /// every reader has been told to stop, and no worker process is still running.
    /// A reader that dies and gets queued for respawn in the same pump that makes
    /// every other worker look terminal is picked up on the next iteration, before
    /// `any_running` and `drained` are both allowed to go true together.
    pub fn run(&mut self, config: &Config) -> Result<Stats, ReadAllError> {
        self.dispatch();
        loop {
            let any_running = self.pool.run_once()?;
            self.respawn_dead_readers(config)?;
            self.dispatch();
            if !any_running && self.drained() {
                break;
            }
        }
        self.pool.cleanup()?;
        Ok(self.state.borrow().stats)
    }
}

/// Run `read_all` against `config` to completion and report the aggregate result.
pub fn run(config: &Config) -> Result<Stats, ReadAllError> {
    let mut engine = ReadAllEngine::start(config)?;
    let stats = engine.run(config)?;
    crate::result::tst_res(
        crate::result::ResultClass::Pass,
        format!(
            "read_all: {} files read, {} reader restart(s)",
            stats.files_read, stats.reader_restarts
        ),
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_patterns_compile_and_match() {
        let pat = glob::Pattern::new("/sys/kernel/debug/**").unwrap();
        assert!(pat.matches("/sys/kernel/debug/tracing/trace"));
        assert!(!pat.matches("/sys/kernel/mm/ksm"));
    }

    #[test]
    fn default_reader_count_is_bounded() {
        let n = Config::default_reader_count();
        assert!(n >= 1 && n <= 15);
    }

    #[test]
    fn new_config_seeds_default_blacklist_and_exclude_appends() {
        let mut cfg = Config::new("/sys");
        assert_eq!(cfg.blacklist, DEFAULT_BLACKLIST);
        cfg.exclude("/sys/firmware/*");
        assert_eq!(cfg.blacklist.last().unwrap(), "/sys/firmware/*");
        assert_eq!(cfg.blacklist.len(), DEFAULT_BLACKLIST.len() + 1);
    }

    #[test]
    fn default_blacklist_patterns_compile_and_cover_known_paths() {
        let patterns: Vec<glob::Pattern> =
            DEFAULT_BLACKLIST.iter().map(|p| glob::Pattern::new(p).unwrap()).collect();
        assert!(patterns[0].matches("/sys/kernel/debug/tracing/trace"));
        assert!(patterns[1].matches("/sys/devices/platform/foo/eeprom"));
        assert!(patterns[2].matches("/sys/devices/platform/foo/nvmem"));
        assert!(patterns[3].matches("/sys/devices/cpu10"));
        assert!(!patterns[3].matches("/sys/devices/cpu1"));
    }

    #[test]
    fn walk_collects_regular_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b.txt"), b"bye").unwrap();

        let mut out = Vec::new();
        walk(dir.path(), &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }
}
