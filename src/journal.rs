//! Owns the live database directories `A`/`B`: a single background flusher
//! drains finished staging directories into place, a relocations map lets
//! readers see records before they are flushed, and startup recovery
//! reconciles whatever `journal/` was left holding after a crash.
//!
//! The flush and recovery logic is written as plain synchronous methods
//! (`flush_directory`, `recover`) so it can be exercised directly in tests
//! without racing a background thread; the thread itself is a thin loop
//! that calls the same methods in response to queued messages.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, trace, warn};

use crate::error::{Error, Result};
use crate::fs_primitives::FsPrimitives;
use crate::path_munger::PathMunger;
use crate::relocations::Relocations;

#[derive(Clone, Copy, Debug)]
pub struct JournalConfig {
    pub flush_interval: Duration,
    pub flush_file_threshold: usize,
    pub flush_transaction_threshold: usize,
    pub backlog: usize,
    pub sync: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            flush_interval: Duration::from_secs(1),
            flush_file_threshold: 1000,
            flush_transaction_threshold: 20,
            backlog: 3,
            sync: true,
        }
    }
}

enum FlushMsg {
    Batch(PathBuf, usize),
    Barrier(String, Sender<()>),
    Recombine { quota: usize },
    Shutdown,
}

pub struct JournalFS {
    root: PathBuf,
    fs: Arc<dyn FsPrimitives>,
    munger: Arc<dyn PathMunger>,
    relocations: Arc<Relocations>,
    cfg: JournalConfig,

    sender: Sender<FlushMsg>,
    tokens: Receiver<()>,
    token_release: Sender<()>,

    snapshot_mode: Arc<AtomicBool>,
    have_flushed: Arc<AtomicBool>,
    snapshot_code: Arc<Mutex<Option<String>>>,
    broken: Arc<Mutex<Option<String>>>,

    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JournalFS {
    fn a_dir(&self) -> PathBuf {
        self.root.join("A")
    }

    fn b_dir(&self) -> PathBuf {
        self.root.join("B")
    }

    fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    /// Opens the journal, running startup recovery synchronously before
    /// the background flusher is started. The engine always comes up in
    /// snapshot mode (spec.md §4.4 step 6) so that recovered records land
    /// in `B/` and get recombined into `A/` the same way an ordinary
    /// snapshot exit would merge them.
    pub fn open(
        root: PathBuf,
        fs: Arc<dyn FsPrimitives>,
        munger: Arc<dyn PathMunger>,
        relocations: Arc<Relocations>,
        cfg: JournalConfig,
    ) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let backlog = cfg.backlog.max(1);
        let (token_release, tokens) = bounded::<()>(backlog);
        for _ in 0..backlog {
            token_release.send(()).expect("fresh channel");
        }

        let journal = JournalFS {
            root,
            fs,
            munger,
            relocations,
            cfg,
            sender,
            tokens,
            token_release,
            snapshot_mode: Arc::new(AtomicBool::new(true)),
            have_flushed: Arc::new(AtomicBool::new(false)),
            snapshot_code: Arc::new(Mutex::new(Some("startup-recovery".to_string()))),
            broken: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
        };

        journal.recover()?;
        journal.spawn_flusher(receiver);
        // Startup always begins in snapshot mode; immediately drive a
        // recombine so B/ (holding whatever recovery just flushed into it)
        // merges back into A/ without requiring an external leave_snapshot.
        journal.recombine_now(journal.cfg.flush_file_threshold.max(1));
        Ok(journal)
    }

    fn spawn_flusher(&self, receiver: Receiver<FlushMsg>) {
        let fs = self.fs.clone();
        let munger = self.munger.clone();
        let relocations = self.relocations.clone();
        let root = self.root.clone();
        let sync = self.cfg.sync;
        let snapshot_mode = self.snapshot_mode.clone();
        let have_flushed = self.have_flushed.clone();
        let snapshot_code = self.snapshot_code.clone();
        let broken = self.broken.clone();
        let token_release = self.token_release.clone();
        let flush_interval = self.cfg.flush_interval;
        let file_threshold = self.cfg.flush_file_threshold;
        let txn_threshold = self.cfg.flush_transaction_threshold;
        let sender = self.sender.clone();

        let worker = FlushWorker {
            fs,
            munger,
            relocations,
            root,
            sync,
            snapshot_mode,
            have_flushed,
            snapshot_code,
            broken,
            sender,
        };

        let handle = std::thread::spawn(move || {
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut pending_files = 0usize;
            let mut last_flush = Instant::now();
            loop {
                let remaining = flush_interval.saturating_sub(last_flush.elapsed());
                match receiver.recv_timeout(remaining) {
                    Ok(FlushMsg::Batch(dir, file_count)) => {
                        pending.push(dir);
                        pending_files += file_count;
                        if pending.len() >= txn_threshold || pending_files >= file_threshold {
                            worker.flush_pending(&mut pending, &token_release);
                            pending_files = 0;
                            last_flush = Instant::now();
                        }
                    }
                    Ok(FlushMsg::Barrier(code, ack)) => {
                        worker.flush_pending(&mut pending, &token_release);
                        pending_files = 0;
                        last_flush = Instant::now();
                        *worker.snapshot_code.lock().unwrap() = Some(code);
                        worker.snapshot_mode.store(true, Ordering::SeqCst);
                        let _ = ack.send(());
                    }
                    Ok(FlushMsg::Recombine { quota }) => {
                        worker.recombine(quota);
                    }
                    Ok(FlushMsg::Shutdown) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() {
                            worker.flush_pending(&mut pending, &token_release);
                            pending_files = 0;
                        }
                        last_flush = Instant::now();
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn is_broken(&self) -> Option<String> {
        self.broken.lock().unwrap().clone()
    }

    pub fn clear_broken(&self) {
        *self.broken.lock().unwrap() = None;
    }

    pub fn in_snapshot(&self) -> bool {
        self.snapshot_mode.load(Ordering::SeqCst)
    }

    pub fn snapshot_code(&self) -> Option<String> {
        self.snapshot_code.lock().unwrap().clone()
    }

    pub fn set_snapshot_code(&self, code: Option<String>) {
        *self.snapshot_code.lock().unwrap() = code;
    }

    pub fn set_snapshot_mode(&self, on: bool) {
        self.snapshot_mode.store(on, Ordering::SeqCst);
    }

    /// Acquires a backlog token (blocking if `backlog` directories are
    /// already in flight) and queues `dir` for flushing. `names` are the
    /// record names the directory stages, used only for the file-count
    /// threshold.
    pub fn enqueue(&self, dir: PathBuf, names: &[String]) -> Result<()> {
        if let Some(reason) = self.is_broken() {
            return Err(Error::BrokenFlusher(reason));
        }
        self.tokens.recv().map_err(|_| Error::BrokenFlusher("flusher channel closed".into()))?;
        self.sender
            .send(FlushMsg::Batch(dir, names.len()))
            .map_err(|_| Error::BrokenFlusher("flusher channel closed".into()))
    }

    /// Posts the snapshot-entry barrier and blocks until the flusher has
    /// drained pending work and acknowledged.
    pub fn post_barrier(&self, code: String) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.sender
            .send(FlushMsg::Barrier(code, ack_tx))
            .map_err(|_| Error::BrokenFlusher("flusher channel closed".into()))?;
        ack_rx
            .recv()
            .map_err(|_| Error::BrokenFlusher("flusher did not acknowledge snapshot barrier".into()))
    }

    pub fn post_recombine(&self, quota: usize) {
        let _ = self.sender.send(FlushMsg::Recombine { quota });
    }

    /// Runs the recombine pass inline, bypassing the queue. Used by
    /// `open()` for the mandatory post-recovery recombine.
    fn recombine_now(&self, quota: usize) {
        self.post_recombine(quota);
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(FlushMsg::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// `read_database_file(name)` per spec.md §4.4: relocations first,
    /// then `B/` with `A/` fallback while in snapshot mode (once at least
    /// one flush has landed), else `A/` directly.
    pub fn read_database_file(&self, name: &str) -> Result<Vec<u8>> {
        if let Some(dir) = self.relocations.lookup(name) {
            return self.fs.read_file(&dir.join(name)).map_err(|_| {
                Error::Format {
                    path: dir.join(name),
                    reason: "relocated record is missing from its staging directory".to_string(),
                }
            });
        }
        let rel = self.munger.munge(name);
        if self.in_snapshot() && self.have_flushed.load(Ordering::SeqCst) {
            let b_path = self.b_dir().join(&rel);
            if self.fs.exists(&b_path) {
                return self.fs.read_file(&b_path);
            }
        }
        self.fs.read_file(&self.a_dir().join(&rel))
    }

    /// Flushes one staged directory synchronously, for direct use by
    /// tests and by `recover`. `names` must be exactly the directory's
    /// contents.
    pub fn flush_directory(&self, dir: &Path, names: &[String]) -> Result<()> {
        let worker = FlushWorker {
            fs: self.fs.clone(),
            munger: self.munger.clone(),
            relocations: self.relocations.clone(),
            root: self.root.clone(),
            sync: self.cfg.sync,
            snapshot_mode: self.snapshot_mode.clone(),
            have_flushed: self.have_flushed.clone(),
            snapshot_code: self.snapshot_code.clone(),
            broken: self.broken.clone(),
            sender: self.sender.clone(),
        };
        worker.flush_one(dir, names)
    }

    /// Startup recovery (spec.md §4.4). Scans `journal/`, validates every
    /// entry name, applies `replica.tar` if present, republishes
    /// relocations and flushes every `*_done` directory, and schedules
    /// every `*_temp` directory for async removal.
    fn recover(&self) -> Result<()> {
        let journal = self.journal_dir();
        self.fs.mkdir_all(&journal)?;
        self.fs.mkdir_all(&self.a_dir())?;
        self.fs.mkdir_all(&self.b_dir())?;
        self.fs.mkdir_all(&self.root.join("misc"))?;

        let mut done_dirs: Vec<PathBuf> = Vec::new();
        let mut temp_dirs: Vec<PathBuf> = Vec::new();
        let mut replica: Option<PathBuf> = None;
        let mut entry_count = 0usize;

        for entry in self.fs.listdir(&journal)? {
            let path = entry?;
            entry_count += 1;
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name == "replica.tar" {
                replica = Some(path);
                continue;
            }
            match classify_working_dir(&name) {
                Some(true) => done_dirs.push(path),
                Some(false) => temp_dirs.push(path),
                None => {
                    return Err(Error::Recovery(format!(
                        "unexpected entry in journal/: {}",
                        name
                    )))
                }
            }
        }

        if let Some(replica_path) = replica {
            if entry_count != 1 {
                return Err(Error::Recovery(
                    "replica.tar must be the only entry in journal/".to_string(),
                ));
            }
            if self.fs.listdir(&self.b_dir())?.next().is_some() {
                return Err(Error::Recovery("B/ must be empty to apply replica.tar".to_string()));
            }
            crate::replica::apply_replica(&replica_path, &self.root, self.fs.as_ref())?;
            let dest = self.root.join("misc").join("replica.previous");
            self.fs.overwrite(&replica_path, &dest)?;
        }

        for dir in &done_dirs {
            let names: Vec<String> = self
                .fs
                .listdir(dir)?
                .filter_map(|r| r.ok())
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            self.relocations.publish(&names, dir);
            self.flush_directory(dir, &names)?;
        }

        for dir in &temp_dirs {
            if let Err(e) = remove_dir_contents(self.fs.as_ref(), dir) {
                warn!("failed to remove abandoned staging directory {:?}: {}", dir, e);
            }
        }

        Ok(())
    }
}

/// The state the flusher thread (and `flush_directory`/`recover`) need;
/// cloned cheaply via `Arc` fields.
struct FlushWorker {
    fs: Arc<dyn FsPrimitives>,
    munger: Arc<dyn PathMunger>,
    relocations: Arc<Relocations>,
    root: PathBuf,
    sync: bool,
    snapshot_mode: Arc<AtomicBool>,
    have_flushed: Arc<AtomicBool>,
    snapshot_code: Arc<Mutex<Option<String>>>,
    broken: Arc<Mutex<Option<String>>>,
    sender: Sender<FlushMsg>,
}

impl FlushWorker {
    fn target_dir(&self) -> PathBuf {
        if self.snapshot_mode.load(Ordering::SeqCst) {
            self.root.join("B")
        } else {
            self.root.join("A")
        }
    }

    fn flush_pending(&self, pending: &mut Vec<PathBuf>, token_release: &Sender<()>) {
        for dir in pending.drain(..) {
            let names: Vec<String> = match self.fs.listdir(&dir) {
                Ok(it) => it.filter_map(|r| r.ok()).map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect(),
                Err(e) => {
                    self.fail(format!("could not list staged directory {:?}: {}", dir, e));
                    let _ = token_release.send(());
                    continue;
                }
            };
            if let Err(e) = self.flush_one(&dir, &names) {
                self.fail(format!("flush of {:?} failed: {}", dir, e));
            }
            let _ = token_release.send(());
        }
    }

    fn fail(&self, reason: String) {
        error!("background flusher broken: {}", reason);
        *self.broken.lock().unwrap() = Some(reason);
    }

    /// Moves every file in `dir` into the live directory, honoring
    /// relocation supersession, then removes `dir`.
    fn flush_one(&self, dir: &Path, names: &[String]) -> Result<()> {
        let target_root = self.target_dir();
        let mut synced_parents: HashSet<PathBuf> = HashSet::new();

        for name in names {
            let staged_path = dir.join(name);
            let rel = self.munger.munge(name);
            let dest = target_root.join(&rel);
            if let Some(parent) = dest.parent() {
                if !self.fs.is_dir(parent) {
                    self.fs.mkdir_all(parent)?;
                }
                synced_parents.insert(parent.to_path_buf());
            }

            if self.relocations.clear_if_unchanged(name, dir) {
                self.fs.overwrite(&staged_path, &dest)?;
            } else {
                trace!("relocation for {} superseded while {:?} was queued; dropping stale copy", name, dir);
                let _ = self.fs.unlink(&staged_path);
            }
        }

        if self.sync {
            for parent in &synced_parents {
                self.fs.sync_directory(parent)?;
            }
        }
        let _ = self.fs.rmdir(dir);
        self.have_flushed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Walks `B/` breadth-first up to `quota` files, `overwrite`ing each
    /// onto `A/`. If `B/` still has files left, re-posts itself with an
    /// increased quota; otherwise syncs `B/` and clears snapshot state.
    fn recombine(&self, quota: usize) {
        let b_dir = self.root.join("B");
        let a_dir = self.root.join("A");
        let mut moved = 0usize;
        let mut queue: VecDeque<PathBuf> = VecDeque::from([b_dir.clone()]);
        let mut files_remaining = false;

        while let Some(dir) = queue.pop_front() {
            let entries = match self.fs.listdir(&dir) {
                Ok(it) => it,
                Err(e) => {
                    self.fail(format!("recombine could not list {:?}: {}", dir, e));
                    return;
                }
            };
            for entry in entries {
                let path = match entry {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if self.fs.is_dir(&path) {
                    queue.push_back(path);
                    continue;
                }
                if moved >= quota {
                    files_remaining = true;
                    continue;
                }
                let rel = path.strip_prefix(&b_dir).unwrap_or(&path);
                let dest = a_dir.join(rel);
                if let Some(parent) = dest.parent() {
                    if !self.fs.is_dir(parent) {
                        if let Err(e) = self.fs.mkdir_all(parent) {
                            self.fail(format!("recombine mkdir failed for {:?}: {}", parent, e));
                            return;
                        }
                    }
                }
                if let Err(e) = self.fs.overwrite(&path, &dest) {
                    self.fail(format!("recombine overwrite failed for {:?}: {}", path, e));
                    return;
                }
                moved += 1;
            }
        }

        if files_remaining {
            let next_quota = ((quota as f64) * 1.4).ceil() as usize;
            self.post_self_recombine(next_quota.max(quota + 1));
            return;
        }

        for leftover in WalkEmptyDirs::new(self.fs.as_ref(), &b_dir) {
            let _ = self.fs.rmdir(&leftover);
        }
        if self.sync {
            let _ = self.fs.sync_directory(&b_dir);
        }
        *self.snapshot_code.lock().unwrap() = None;
        self.have_flushed.store(false, Ordering::SeqCst);
        self.snapshot_mode.store(false, Ordering::SeqCst);
    }

    /// Re-queues a `Recombine` task at `quota` onto the same channel this
    /// worker's thread is draining, so a multi-pass recombine makes
    /// progress on later iterations of the flusher loop instead of
    /// blocking it here.
    fn post_self_recombine(&self, quota: usize) {
        let _ = self.sender.send(FlushMsg::Recombine { quota });
    }
}

/// Removes empty directories bottom-up under `base` (not `base` itself
/// unless it ends up empty too).
struct WalkEmptyDirs;

impl WalkEmptyDirs {
    fn new(fs: &dyn FsPrimitives, base: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        collect_empty_dirs(fs, base, &mut out);
        out
    }
}

fn collect_empty_dirs(fs: &dyn FsPrimitives, dir: &Path, out: &mut Vec<PathBuf>) {
    let entries: Vec<PathBuf> = match fs.listdir(dir) {
        Ok(it) => it.filter_map(|r| r.ok()).collect(),
        Err(_) => return,
    };
    for entry in &entries {
        if fs.is_dir(entry) {
            collect_empty_dirs(fs, entry, out);
        }
    }
    if let Ok(remaining) = fs.listdir(dir) {
        if remaining.filter_map(|r| r.ok()).next().is_none() {
            out.push(dir.to_path_buf());
        }
    }
}

fn remove_dir_contents(fs: &dyn FsPrimitives, dir: &Path) -> Result<()> {
    for entry in fs.listdir(dir)? {
        let path = entry?;
        if fs.is_dir(&path) {
            remove_dir_contents(fs, &path)?;
            fs.rmdir(&path)?;
        } else {
            fs.unlink(&path)?;
        }
    }
    fs.rmdir(dir)?;
    Ok(())
}

/// Validates `working_[0-9A-F]{16}_(temp|done)`, returning `Some(true)`
/// for `_done`, `Some(false)` for `_temp`, `None` if it doesn't match.
fn classify_working_dir(name: &str) -> Option<bool> {
    let rest = name.strip_prefix("working_")?;
    if rest.len() < 16 {
        return None;
    }
    let (hex, suffix) = (&rest[..16], &rest[16..]);
    let is_upper_hex = |b: u8| b.is_ascii_digit() || (b'A'..=b'F').contains(&b);
    if !hex.bytes().all(is_upper_hex) {
        return None;
    }
    match suffix {
        "_done" => Some(true),
        "_temp" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_primitives::Posix;
    use crate::path_munger::Scheme;

    fn setup() -> (tempfile::TempDir, JournalFS) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let fs: Arc<dyn FsPrimitives> = Arc::new(Posix::new());
        let munger: Arc<dyn PathMunger> = Arc::from(Scheme::Flat.munger());
        let relocations = Arc::new(Relocations::new());
        let cfg = JournalConfig { flush_interval: Duration::from_millis(50), ..Default::default() };
        let journal = JournalFS::open(root, fs, munger, relocations, cfg).unwrap();
        (dir, journal)
    }

    #[test]
    fn classify_accepts_only_well_formed_names() {
        assert_eq!(classify_working_dir("working_0123456789ABCDEF_done"), Some(true));
        assert_eq!(classify_working_dir("working_0123456789ABCDEF_temp"), Some(false));
        assert_eq!(classify_working_dir("working_xyz_temp"), None);
        assert_eq!(classify_working_dir("garbage"), None);
    }

    #[test]
    fn opens_cleanly_on_an_empty_store() {
        let (_dir, journal) = setup();
        assert!(journal.is_broken().is_none());
        assert!(!journal.in_snapshot());
    }

    #[test]
    fn flush_directory_moves_files_and_clears_relocation() {
        let (_dir, journal) = setup();
        let staging = journal.journal_dir().join("working_0000000000000001_done");
        journal.fs.mkdir_all(&staging).unwrap();
        journal.fs.write_file(&staging.join("o1.c"), b"12345678", true).unwrap();
        journal.relocations.publish(&["o1.c".to_string()], &staging);

        journal.flush_directory(&staging, &["o1.c".to_string()]).unwrap();

        assert!(!staging.exists());
        assert_eq!(journal.relocations.lookup("o1.c"), None);
        assert_eq!(journal.fs.read_file(&journal.a_dir().join("o1.c")).unwrap(), b"12345678");
    }

    #[test]
    fn flush_directory_drops_superseded_copy() {
        let (_dir, journal) = setup();
        let staging = journal.journal_dir().join("working_0000000000000002_done");
        journal.fs.mkdir_all(&staging).unwrap();
        journal.fs.write_file(&staging.join("o2.c"), b"stale001", true).unwrap();
        let newer = journal.journal_dir().join("working_0000000000000003_done");
        journal.relocations.publish(&["o2.c".to_string()], &newer);

        journal.flush_directory(&staging, &["o2.c".to_string()]).unwrap();

        assert!(!journal.fs.exists(&journal.a_dir().join("o2.c")));
        assert_eq!(journal.relocations.lookup("o2.c"), Some(newer));
    }

    #[test]
    fn read_database_file_prefers_relocation() {
        let (_dir, journal) = setup();
        let staging = journal.journal_dir().join("working_0000000000000004_temp");
        journal.fs.mkdir_all(&staging).unwrap();
        journal.fs.write_file(&staging.join("o4.c"), b"fresh001", true).unwrap();
        journal.relocations.publish(&["o4.c".to_string()], &staging);

        assert_eq!(journal.read_database_file("o4.c").unwrap(), b"fresh001");
    }

    #[test]
    fn recovery_rejects_unexpected_journal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("journal")).unwrap();
        std::fs::write(root.join("journal").join("not_a_working_dir"), b"x").unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(Posix::new());
        let munger: Arc<dyn PathMunger> = Arc::from(Scheme::Flat.munger());
        let relocations = Arc::new(Relocations::new());
        let err = JournalFS::open(root, fs, munger, relocations, JournalConfig::default());
        assert!(err.is_err());
    }
}
