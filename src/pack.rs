//! `PackEngine`: the four-pass mark-and-sweep garbage collector
//! (spec.md §4.7). Runs entirely inside snapshot mode (`Core::pack`
//! brackets it with `enter_snapshot`/`leave_snapshot`) so it can read
//! and mutate `A/` directly without racing the flusher.
//!
//! Sweep can't invert a munged path back into the logical record name
//! `MarkContext` was built around — `PathMunger` has no demunge, and
//! bushy/chunky's grouping isn't uniquely reversible from a bare path.
//! So alongside the abstract `MarkContext` (exercised faithfully for
//! every record the trace passes touch, which is what a `File` or
//! `Nested` backend persists), `PackEngine` keeps its own set of the
//! *physical* paths those same marks resolved to, and sweep's directory
//! walk consults that set directly instead of trying to recover names
//! from paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::config::KeepClassPolicy;
use crate::core::ExtractRefs;
use crate::error::{Error, Result};
use crate::fs_primitives::FsPrimitives;
use crate::ids::{Oid, Tid};
use crate::mark::MarkContext;
use crate::path_munger::PathMunger;
use crate::record::{self, ObjectRecord, TransactionRecord};

/// Classifies a pickle into a named keep-class, consulted against
/// `storage.keepclass.<name>` policies (SPEC_FULL.md §3.1). A pack-time
/// plugin like `ExtractRefs`, not a persisted `Config` field, since
/// closures aren't representable in `config/settings`.
pub type Classify = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

fn now_tid() -> Tid {
    let micros = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0);
    Tid::from_u64(micros)
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn subtract_seconds(t: Tid, secs: u64) -> Tid {
    Tid::from_u64(t.as_u64().saturating_sub(secs.saturating_mul(1_000_000)))
}

pub struct PackEngine {
    fs: Arc<dyn FsPrimitives>,
    munger: Arc<dyn PathMunger>,
    root: PathBuf,
    mark: Arc<dyn MarkContext>,
    keep_classes: HashMap<String, KeepClassPolicy>,
    delay_delete: u64,
    min_pack_time: u64,
    check_md5: bool,
}

impl PackEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn FsPrimitives>,
        munger: Arc<dyn PathMunger>,
        root: PathBuf,
        mark: Arc<dyn MarkContext>,
        keep_classes: HashMap<String, KeepClassPolicy>,
        delay_delete: u64,
        min_pack_time: u64,
        check_md5: bool,
    ) -> Self {
        PackEngine { fs, munger, root, mark, keep_classes, delay_delete, min_pack_time, check_md5 }
    }

    fn a_dir(&self) -> PathBuf {
        self.root.join("A")
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.munger.munge(name)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.fs.read_file(&self.a_dir().join(self.path_for(name))) {
            Ok(d) => Ok(Some(d)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_root_tid(&self, name: &str) -> Result<Tid> {
        match self.read(name)? {
            Some(data) => record::decode_root(Path::new(name), &data),
            None => Ok(Tid::ZERO),
        }
    }

    fn write_root_tid(&self, name: &str, tid: Tid) -> Result<()> {
        self.fs.write_file(&self.a_dir().join(self.path_for(name)), &record::encode_root(tid), true)
    }

    fn note_marked(&self, name: &str, kept: &mut HashSet<PathBuf>) -> Result<()> {
        self.mark.mark(name)?;
        kept.insert(self.path_for(name));
        Ok(())
    }

    /// Runs one full pack pass: clamps the threshold, clears marks,
    /// traces reachability from the root plus the recent-transactions
    /// floor, relinks the transaction chain across the gaps that
    /// leaves, and sweeps everything left unmarked.
    pub fn run(&self, requested_threshold: Tid, extract_refs: Option<ExtractRefs>, classify: Option<Classify>) -> Result<()> {
        let extract_refs: ExtractRefs = extract_refs.unwrap_or_else(|| Arc::new(|_: &[u8]| Vec::new()));

        let x_serial = self.read_root_tid("x.serial")?;
        let prior_packed = self.read_root_tid("x.packed")?;

        let now = now_tid();
        let floor = if self.min_pack_time > 0 { subtract_seconds(now, self.min_pack_time) } else { now };
        let mut t = requested_threshold.min(floor).min(x_serial);
        if t < prior_packed {
            // x.packed is monotone non-decreasing (invariant 7); never move it backward.
            t = prior_packed;
        }
        if t > prior_packed {
            self.write_root_tid("x.packed", t)?;
        }
        debug!("pack: threshold={:?} prior_packed={:?} x.serial={:?}", t, prior_packed, x_serial);

        // Pass 1: clear marks.
        self.mark.unmark_all(&self.a_dir())?;
        let mut kept: HashSet<PathBuf> = HashSet::new();

        // Pass 2a: reachability from the root OID.
        let mut visited: HashSet<Oid> = HashSet::new();
        let mut worklist: VecDeque<Oid> = VecDeque::new();
        worklist.push_back(Oid::ZERO);

        // Pass 2b: recent transactions, seeding the same worklist.
        self.trace_recent_transactions(x_serial, t, prior_packed, &mut visited, &mut worklist, &mut kept)?;

        while let Some(oid) = worklist.pop_front() {
            if !visited.insert(oid) {
                continue;
            }
            let discovered = self.trace_oid(oid, t, prior_packed, &extract_refs, &classify, &mut kept)?;
            for refoid in discovered {
                if !visited.contains(&refoid) {
                    worklist.push_back(refoid);
                }
            }
        }

        self.note_marked("x.serial", &mut kept)?;
        self.note_marked("x.oid", &mut kept)?;
        self.note_marked("x.packed", &mut kept)?;

        // Pass 3: relink across the gaps pass 2b's cutoff created.
        self.relink(x_serial)?;

        // Pass 4: sweep everything left unmarked.
        self.sweep(&kept)?;

        Ok(())
    }

    /// Traces one object's revision chain back from its current pointer,
    /// marking revisions (and, for revisions at or above `t`, their
    /// transaction file) until the chain reaches a creation or falls
    /// below the class-adjusted cutoff. `classify` is consulted once,
    /// against the object's *current* revision — a keep-class describes
    /// the object, not a single historical payload, so retention for the
    /// whole chain is decided from the most recent pickle rather than
    /// re-classified revision by revision. Returns OIDs discovered via
    /// `extract_refs` for the caller to enqueue.
    fn trace_oid(
        &self,
        oid: Oid,
        t: Tid,
        prior_packed: Tid,
        extract_refs: &ExtractRefs,
        classify: &Option<Classify>,
        kept: &mut HashSet<PathBuf>,
    ) -> Result<Vec<Oid>> {
        let c_name = format!("o{}.c", oid.to_hex());
        let cur_bytes = match self.read(&c_name)? {
            Some(b) => b,
            None => return Ok(Vec::new()),
        };
        let mut tid = record::decode_current_pointer(Path::new(&c_name), &cur_bytes)?;
        self.note_marked(&c_name, kept)?;

        let mut discovered = Vec::new();
        let mut effective_t = t;
        let mut first = true;
        loop {
            let name = ObjectRecord::filename(oid, tid);
            let data = match self.read(&name)? {
                Some(d) => d,
                None => {
                    if tid >= prior_packed {
                        return Err(Error::Format {
                            path: PathBuf::from(name),
                            reason: "object revision missing during pack trace".to_string(),
                        });
                    }
                    break;
                }
            };
            let rec = match ObjectRecord::decode(Path::new(&name), &data, self.check_md5, Some(oid), Some(tid)) {
                Ok(r) => r,
                Err(e) if tid >= prior_packed => return Err(e),
                Err(e) => {
                    warn!("pack: unreadable old revision {}: {}, ending this chain", name, e);
                    break;
                }
            };

            if first {
                let class = classify.as_ref().and_then(|f| f(&rec.pickle));
                effective_t = match class.as_ref().and_then(|c| self.keep_classes.get(c)) {
                    Some(KeepClassPolicy::Forever) => Tid::ZERO,
                    Some(KeepClassPolicy::ExtraDays(days)) => subtract_seconds(t, days.saturating_mul(86_400)),
                    None => t,
                };
                first = false;
            }

            if tid >= effective_t {
                self.note_marked(&name, kept)?;
                if tid >= t {
                    self.note_marked(&TransactionRecord::filename(tid), kept)?;
                }
            }

            discovered.extend(extract_refs(&rec.pickle));

            if rec.prev_serial.is_zero() || rec.prev_serial < effective_t {
                break;
            }
            tid = rec.prev_serial;
        }
        Ok(discovered)
    }

    /// Walks transaction files back from `x.serial`, keeping at least the
    /// two newest unconditionally (unless `min_pack_time == 0`) so a
    /// replica always has a recent datum, and seeds the reachability
    /// worklist with every OID those transactions still point at.
    fn trace_recent_transactions(
        &self,
        x_serial: Tid,
        t: Tid,
        prior_packed: Tid,
        visited: &mut HashSet<Oid>,
        worklist: &mut VecDeque<Oid>,
        kept: &mut HashSet<PathBuf>,
    ) -> Result<()> {
        let mut tid = x_serial;
        let mut seen = 0usize;
        while !tid.is_zero() {
            let keep_for_backup = seen < 2 && self.min_pack_time != 0;
            if tid < t && !keep_for_backup {
                break;
            }
            let name = TransactionRecord::filename(tid);
            let data = match self.read(&name)? {
                Some(d) => d,
                None => {
                    if tid >= prior_packed {
                        return Err(Error::Format { path: PathBuf::from(name), reason: "transaction record missing during pack trace".to_string() });
                    }
                    break;
                }
            };
            let rec = TransactionRecord::decode(Path::new(&name), &data, self.check_md5)?;
            self.note_marked(&name, kept)?;

            for &oid in &rec.oids {
                let c_name = format!("o{}.c", oid.to_hex());
                if self.read(&c_name)?.is_some() && !visited.contains(&oid) {
                    worklist.push_back(oid);
                }
            }

            seen += 1;
            tid = rec.prev_tid;
        }
        Ok(())
    }

    /// Patches transaction back-pointers so marked transactions form a
    /// continuous chain, skipping whatever pass 2b left unmarked between
    /// them. Patches are applied in place via `modify_file`; a crash
    /// mid-relink just leaves a gap for the next pack to close.
    fn relink(&self, x_serial: Tid) -> Result<()> {
        let mut remembered: Option<(PathBuf, Tid)> = None; // (file path, its on-disk prev_tid)
        let mut tid = x_serial;
        while !tid.is_zero() {
            let name = TransactionRecord::filename(tid);
            let data = match self.read(&name)? {
                Some(d) => d,
                None => break,
            };
            let rec = TransactionRecord::decode(Path::new(&name), &data, false)?;

            if self.mark.is_marked(&name)? {
                if let Some((remembered_path, remembered_prev)) = &remembered {
                    if *remembered_prev != tid {
                        self.fs.modify_file(remembered_path, record::TXN_PREV_TID_OFFSET as u64, tid.as_bytes())?;
                    }
                }
                remembered = Some((self.a_dir().join(self.path_for(&name)), rec.prev_tid));
            }
            tid = rec.prev_tid;
        }
        // The chain bottomed out (or hit a gap) below the last remembered
        // transaction; whatever it still points at is gone, so close the
        // chain off at zero rather than leaving a dangling back-pointer.
        if let Some((remembered_path, remembered_prev)) = &remembered {
            if !remembered_prev.is_zero() {
                self.fs.modify_file(remembered_path, record::TXN_PREV_TID_OFFSET as u64, Tid::ZERO.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Depth-first sweep of `A/`: unlinks deletions whose delay has
    /// elapsed, renames newly-unmarked files to `<name>-<now>-deleted`
    /// (or unlinks immediately if `delay_delete == 0`), and removes
    /// directories left empty behind them.
    fn sweep(&self, kept: &HashSet<PathBuf>) -> Result<()> {
        let a = self.a_dir();
        let now = now_secs();
        let mut dirs = Vec::new();

        for entry in WalkDir::new(&a).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                if entry.path() != a {
                    dirs.push(entry.path().to_path_buf());
                }
                continue;
            }
            let path = entry.path();
            let relative = match path.strip_prefix(&a) {
                Ok(r) => r.to_path_buf(),
                Err(_) => continue,
            };
            let filename = entry.file_name().to_string_lossy().into_owned();

            if let Some(epoch) = parse_deleted_epoch(&filename) {
                if epoch + self.delay_delete < now {
                    let _ = self.fs.unlink(path);
                }
                continue;
            }

            if kept.contains(&relative) {
                continue;
            }

            if self.delay_delete == 0 {
                let _ = self.fs.unlink(path);
            } else {
                let deleted_path = path.with_file_name(format!("{}-{}-deleted", filename, now));
                let _ = self.fs.rename(path, &deleted_path);
            }
        }

        dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for dir in dirs {
            let _ = self.fs.rmdir(&dir);
        }
        Ok(())
    }
}

fn parse_deleted_epoch(filename: &str) -> Option<u64> {
    let stem = filename.strip_suffix("-deleted")?;
    let idx = stem.rfind('-')?;
    stem[idx + 1..].parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepClassPolicy as KCP;
    use crate::fs_primitives::Posix;
    use crate::mark::Memory;
    use crate::path_munger::Scheme;
    use crate::record::{ObjectRecord, TransactionRecord};

    fn engine(root: PathBuf) -> PackEngine {
        let fs: Arc<dyn FsPrimitives> = Arc::new(Posix::new());
        fs.mkdir_all(&root.join("A")).unwrap();
        PackEngine::new(
            fs,
            Arc::from(Scheme::Flat.munger()),
            root,
            Arc::new(Memory::new()),
            HashMap::new(),
            0,
            0,
            true,
        )
    }

    fn write_object(engine: &PackEngine, oid: Oid, tid: Tid, prev: Tid, pickle: &[u8]) {
        let rec = ObjectRecord { oid, undo_from: Tid::ZERO, prev_serial: prev, this_serial: tid, pickle: pickle.to_vec() };
        let bytes = rec.encode(true);
        engine.fs.write_file(&engine.a_dir().join(ObjectRecord::filename(oid, tid)), &bytes, true).unwrap();
    }

    fn write_current(engine: &PackEngine, oid: Oid, tid: Tid) {
        let name = format!("o{}.c", oid.to_hex());
        engine.fs.write_file(&engine.a_dir().join(name), &record::encode_current_pointer(tid), true).unwrap();
    }

    fn write_txn(engine: &PackEngine, tid: Tid, prev_tid: Tid, oids: Vec<Oid>) {
        let rec = TransactionRecord { tid, prev_tid, user: Vec::new(), description: Vec::new(), extension: Vec::new(), oids };
        let bytes = rec.encode(true);
        engine.fs.write_file(&engine.a_dir().join(TransactionRecord::filename(tid)), &bytes, true).unwrap();
    }

    #[test]
    fn sweep_removes_an_object_with_no_remaining_current_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path().to_path_buf());

        let dead = Oid::from_u64(5);
        write_object(&engine, dead, Tid::from_u64(1), Tid::ZERO, b"orphaned");
        // No current-pointer file, no transaction, and x.serial stays at its
        // default zero: nothing is reachable, so the trace touches nothing.

        engine.run(Tid::from_u64(1), None, None).unwrap();

        assert!(!engine.fs.exists(&engine.a_dir().join(ObjectRecord::filename(dead, Tid::from_u64(1)))));
    }

    #[test]
    fn sweep_keeps_a_revision_reachable_from_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path().to_path_buf());

        let root = Oid::ZERO;
        let t1 = Tid::from_u64(1);
        write_object(&engine, root, t1, Tid::ZERO, b"root payload");
        write_current(&engine, root, t1);
        write_txn(&engine, t1, Tid::ZERO, vec![root]);
        engine.write_root_tid("x.serial", t1).unwrap();

        engine.run(t1, None, None).unwrap();

        assert!(engine.fs.exists(&engine.a_dir().join(ObjectRecord::filename(root, t1))));
        assert!(engine.fs.exists(&engine.a_dir().join(format!("o{}.c", root.to_hex()))));
    }

    #[test]
    fn forever_keep_class_survives_an_aggressive_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn FsPrimitives> = Arc::new(Posix::new());
        fs.mkdir_all(&dir.path().join("A")).unwrap();
        let mut classes = HashMap::new();
        classes.insert("precious".to_string(), KCP::Forever);
        let engine = PackEngine::new(
            fs,
            Arc::from(Scheme::Flat.munger()),
            dir.path().to_path_buf(),
            Arc::new(Memory::new()),
            classes,
            0,
            0,
            true,
        );

        // Two revisions of the same object: an old one a plain aggressive
        // pack threshold would normally drop, and a newer one that
        // supersedes it. The classifier is evaluated against the *current*
        // revision's pickle (both happen to read "KEEP" here), so a
        // `Forever` class on it protects the whole chain, old revision
        // included.
        let root = Oid::ZERO;
        let t1 = Tid::from_u64(1);
        let t2 = Tid::from_u64(2);
        write_object(&engine, root, t1, Tid::ZERO, b"KEEP v1");
        write_object(&engine, root, t2, t1, b"KEEP v2");
        write_current(&engine, root, t2);
        write_txn(&engine, t1, Tid::ZERO, vec![root]);
        write_txn(&engine, t2, t1, vec![root]);
        engine.write_root_tid("x.serial", t2).unwrap();

        let classify: Classify = Arc::new(|pickle: &[u8]| {
            if pickle.starts_with(b"KEEP") {
                Some("precious".to_string())
            } else {
                None
            }
        });
        engine.run(t2, None, Some(classify)).unwrap();

        assert!(engine.fs.exists(&engine.a_dir().join(ObjectRecord::filename(root, t1))));
        assert!(engine.fs.exists(&engine.a_dir().join(ObjectRecord::filename(root, t2))));
    }

    #[test]
    fn aggressive_threshold_sweeps_a_superseded_revision_without_a_keep_class() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path().to_path_buf());

        let root = Oid::ZERO;
        let t1 = Tid::from_u64(1);
        let t2 = Tid::from_u64(2);
        write_object(&engine, root, t1, Tid::ZERO, b"v1");
        write_object(&engine, root, t2, t1, b"v2");
        write_current(&engine, root, t2);
        write_txn(&engine, t1, Tid::ZERO, vec![root]);
        write_txn(&engine, t2, t1, vec![root]);
        engine.write_root_tid("x.serial", t2).unwrap();

        engine.run(t2, None, None).unwrap();

        assert!(!engine.fs.exists(&engine.a_dir().join(ObjectRecord::filename(root, t1))));
        assert!(engine.fs.exists(&engine.a_dir().join(ObjectRecord::filename(root, t2))));
    }

    #[test]
    fn parse_deleted_epoch_extracts_trailing_timestamp() {
        assert_eq!(parse_deleted_epoch("o1.c-1700000000-deleted"), Some(1_700_000_000));
        assert_eq!(parse_deleted_epoch("o1.c"), None);
    }
}
