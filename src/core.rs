//! `Core`: the engine proper. Owns the journal, the snapshot controller,
//! the commit permit, and the OID/serial root files, and implements the
//! client protocol (spec.md §4.6/§6) as inherent methods. A single open
//! `Txn` at a time is enforced by a one-token `crossbeam_channel`, the
//! same channel-as-semaphore idiom `journal.rs` uses for its flush
//! backlog.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::config::{Config, KeepPolicy, MarkBackend};
use crate::error::{Error, Result};
use crate::fs_primitives::{FsPrimitives, ProcessLock};
use crate::ids::{Oid, Tid, TidClock};
use crate::journal::{JournalConfig, JournalFS};
use crate::mark::{self, MarkContext};
use crate::pack::{Classify, PackEngine};
use crate::path_munger::PathMunger;
use crate::record::{self, ObjectRecord, TransactionRecord};
use crate::relocations::Relocations;
use crate::snapshot::SnapshotController;
use crate::staging::TxnStaging;
use crate::txn::Transaction;

/// Extracts the OIDs a pickle references, for dangling-reference checks
/// at `vote` and for pack's reachability trace. Supplied by the
/// enclosing object-database layer; the engine treats pickles as opaque.
pub type ExtractRefs = Arc<dyn Fn(&[u8]) -> Vec<Oid> + Send + Sync>;

/// Given the current on-disk pickle and the proposed new one, returns a
/// merged payload, or `None` to let the conflict fail `store`.
pub type ResolveConflict = Arc<dyn Fn(Oid, &[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tid: Tid,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UndoLogEntry {
    pub tid: Tid,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
}

/// A transaction in progress. Produced by `Core::begin`, consumed by
/// `Core::vote`/`finish`/`abort`. `staging` is `None` once the
/// transaction has been finished or aborted — calling anything else on
/// it afterward is a programmer error caught by `require_open`.
pub struct Txn {
    transaction: Transaction,
    staging: Option<TxnStaging>,
}

impl Txn {
    pub fn tid(&self) -> Tid {
        self.transaction.tid
    }
}

pub struct Core {
    config: Config,
    fs: Arc<dyn FsPrimitives>,
    munger: Arc<dyn PathMunger>,
    journal: Arc<JournalFS>,
    relocations: Arc<Relocations>,
    snapshot: SnapshotController,
    tid_clock: TidClock,

    commit_permit: Receiver<()>,
    commit_release: Sender<()>,
    open_tid: Mutex<Option<Tid>>,

    extract_refs: Option<ExtractRefs>,
    resolve_conflict: Option<ResolveConflict>,

    _lock: ProcessLock,
    sub_lock: Mutex<Option<ProcessLock>>,
}

impl Core {
    /// Opens (or creates) a store at `config.path`. Acquires the main
    /// process lock for the whole run; if the sub-lock is already held
    /// by another process, the engine starts life in (inherited)
    /// snapshot mode rather than failing, per spec.md §4.4 step 1.
    pub fn open(
        config: Config,
        fs: Arc<dyn FsPrimitives>,
        extract_refs: Option<ExtractRefs>,
        resolve_conflict: Option<ResolveConflict>,
    ) -> Result<Core> {
        let root = config.path.clone();
        fs.mkdir_all(&root)?;
        let misc = root.join("misc");
        fs.mkdir_all(&misc)?;

        let lock = ProcessLock::acquire(&misc.join("lock"))?;
        let sub_lock = ProcessLock::try_acquire(&misc.join("sublock"))?;

        let munger: Arc<dyn PathMunger> = Arc::from(config.structure_format.munger());
        let relocations = Arc::new(Relocations::new());
        let journal_cfg = JournalConfig {
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            flush_file_threshold: config.flush_file_threshold,
            flush_transaction_threshold: config.flush_transaction_threshold,
            backlog: config.backlog,
            sync: config.filesystem_sync,
        };
        let journal = Arc::new(JournalFS::open(
            root.clone(),
            fs.clone(),
            munger.clone(),
            relocations.clone(),
            journal_cfg,
        )?);
        let snapshot =
            SnapshotController::new(journal.clone(), fs.clone(), root.clone(), config.flush_file_threshold.max(1));

        let (commit_release, commit_permit) = bounded::<()>(1);
        commit_release.send(()).expect("fresh channel");

        let tid_clock = TidClock::new();

        let core = Core {
            config,
            fs,
            munger,
            journal,
            relocations,
            snapshot,
            tid_clock,
            commit_permit,
            commit_release,
            open_tid: Mutex::new(None),
            extract_refs,
            resolve_conflict,
            _lock: lock,
            sub_lock: Mutex::new(sub_lock),
        };

        core.tid_clock.seed(core.root_tid("x.serial")?);

        if core.sub_lock.lock().unwrap().is_none() {
            debug!("sublock already held by another process; entering inherited snapshot mode");
            core.snapshot.enter_snapshot("inherited-sublock")?;
        }

        Ok(core)
    }

    fn journal_dir(&self) -> PathBuf {
        self.config.path.join("journal")
    }

    /// Generates the next monotonic TID. Clients call this, then pass
    /// the result to `begin`, matching the client protocol's
    /// `begin(tid,user,desc,ext)` shape while keeping TID generation
    /// centralized and crash-consistent.
    pub fn next_tid(&self) -> Tid {
        self.tid_clock.next()
    }

    pub fn last_transaction(&self) -> Result<Tid> {
        self.root_tid("x.serial")
    }

    pub fn is_directory_storage(&self) -> bool {
        true
    }

    pub fn get_snapshot_code(&self) -> Option<String> {
        self.snapshot.get_snapshot_code()
    }

    pub fn enter_snapshot(&self, code: &str) -> Result<()> {
        self.snapshot.enter_snapshot(code)
    }

    pub fn leave_snapshot(&self, code: &str) -> Result<()> {
        self.snapshot.leave_snapshot(code)
    }

    /// Runs the snapshot-on-close pass (unless `filesystem.quick_shutdown`
    /// is set) and stops the background flusher. The engine is unusable
    /// after this returns.
    pub fn shutdown(&self) {
        if !self.config.filesystem_quick_shutdown {
            let _ = self.snapshot.enter_snapshot("shutdown");
        }
        self.journal.shutdown();
    }

    fn mark_context(&self) -> Arc<dyn MarkContext> {
        match self.config.posix_mark {
            MarkBackend::Memory | MarkBackend::Minimal => Arc::new(mark::Memory::new()),
            MarkBackend::File => Arc::new(mark::FileSidecar::new(self.config.path.join("misc").join("marks"), self.fs.clone())),
            #[cfg(all(unix, feature = "permissions-mark"))]
            MarkBackend::Permissions => Arc::new(mark::PermissionBit::new(self.config.path.join("A"))),
            #[cfg(not(all(unix, feature = "permissions-mark")))]
            MarkBackend::Permissions => Arc::new(mark::Memory::new()),
        }
    }

    /// `pack(time, referencesf)` (spec.md §4.6/§4.7). Runs the whole
    /// four-pass mark-and-sweep inside snapshot mode so no concurrent
    /// flush can touch `A/` while it scans and mutates it directly.
    /// `extract_refs` overrides the engine-wide callback passed to
    /// `Core::open` for this pack run only; `None` reuses that one.
    pub fn pack(&self, threshold: Tid, extract_refs: Option<ExtractRefs>, classify: Option<Classify>) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let refs = extract_refs.or_else(|| self.extract_refs.clone());
        self.snapshot.enter_snapshot("pack")?;
        let result = (|| {
            let engine = PackEngine::new(
                self.fs.clone(),
                self.munger.clone(),
                self.config.path.clone(),
                self.mark_context(),
                self.config.keepclasses.clone(),
                self.config.delay_delete,
                self.config.min_pack_time,
                self.config.md5policy.pack,
            );
            engine.run(threshold, refs, classify)
        })();
        self.snapshot.leave_snapshot("pack")?;
        result
    }

    fn root_tid(&self, name: &str) -> Result<Tid> {
        match self.journal.read_database_file(name) {
            Ok(bytes) => record::decode_root(Path::new(name), &bytes),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Tid::ZERO),
            Err(e) => Err(e),
        }
    }

    fn root_oid(&self, name: &str) -> Result<Oid> {
        match self.journal.read_database_file(name) {
            Ok(bytes) => Oid::from_bytes(&bytes)
                .ok_or_else(|| Error::Format { path: PathBuf::from(name), reason: "bad x.oid length".to_string() }),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Oid::ZERO),
            Err(e) => Err(e),
        }
    }

    fn current_serial(&self, oid: Oid) -> Result<Tid> {
        let name = format!("o{}.c", oid.to_hex());
        match self.journal.read_database_file(&name) {
            Ok(bytes) => record::decode_current_pointer(Path::new(&name), &bytes),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Tid::ZERO),
            Err(e) => Err(e),
        }
    }

    fn require_open(&self, txn: &Txn) -> Result<()> {
        match *self.open_tid.lock().unwrap() {
            Some(t) if t == txn.transaction.tid => Ok(()),
            _ => Err(Error::TxnState("transaction is not the currently open transaction")),
        }
    }

    /// Begins a new transaction, blocking until any previously open one
    /// has finished or aborted (the commit lock of spec.md §5).
    pub fn begin(&self, tid: Tid, user: Vec<u8>, description: Vec<u8>, extension: Vec<u8>) -> Result<Txn> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        self.commit_permit.recv().map_err(|_| Error::BrokenFlusher("commit permit channel closed".into()))?;
        *self.open_tid.lock().unwrap() = Some(tid);
        let staging = TxnStaging::begin(self.fs.clone(), &self.journal_dir(), tid, self.config.filesystem_sync)?;
        Ok(Txn { transaction: Transaction::begin(tid, user, description, extension), staging: Some(staging) })
    }

    /// `store(oid, expected_serial, data, txn)` (spec.md §4.6). Stages
    /// the new revision and its current-pointer file; does not touch
    /// `A`/`B` directly.
    pub fn store(&self, txn: &mut Txn, oid: Oid, expected_serial: Tid, data: Vec<u8>) -> Result<Tid> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        self.require_open(txn)?;
        let staging = txn.staging.as_mut().ok_or(Error::TxnState("store called after finish/abort"))?;

        let current = self.current_serial(oid)?;
        let mut payload = data;
        if current != expected_serial {
            match &self.resolve_conflict {
                Some(resolve) => {
                    let current_bytes = if current.is_zero() {
                        Vec::new()
                    } else {
                        self.load_serial_raw(oid, current).unwrap_or_default()
                    };
                    match resolve(oid, &current_bytes, &payload) {
                        Some(merged) => payload = merged,
                        None => return Err(Error::Conflict { oid, current, expected: expected_serial }),
                    }
                }
                None => return Err(Error::Conflict { oid, current, expected: expected_serial }),
            }
        }

        let new_tid = txn.transaction.tid;
        let record = ObjectRecord {
            oid,
            undo_from: Tid::ZERO,
            prev_serial: current,
            this_serial: new_tid,
            pickle: payload.clone(),
        };
        let is_creation_undone = record.is_creation_undone();
        let bytes = record.encode(self.config.md5policy.write);
        staging.write(&ObjectRecord::filename(oid, new_tid), &bytes)?;
        staging.write(&format!("o{}.c", oid.to_hex()), &record::encode_current_pointer(new_tid))?;

        txn.transaction.record_store(oid, is_creation_undone)?;
        if self.config.check_dangling_references {
            if let Some(extract) = &self.extract_refs {
                for refoid in extract(&payload) {
                    txn.transaction.record_reference(refoid, oid)?;
                }
            }
        }
        Ok(new_tid)
    }

    /// Reads a revision's raw pickle bytes without the creation-undone
    /// check `load_serial` applies, for conflict-resolver callbacks that
    /// need the current bytes even when they represent a deletion.
    fn load_serial_raw(&self, oid: Oid, tid: Tid) -> Result<Vec<u8>> {
        let name = ObjectRecord::filename(oid, tid);
        let data = self.journal.read_database_file(&name)?;
        let rec = ObjectRecord::decode(Path::new(&name), &data, self.config.md5policy.overwrite, Some(oid), Some(tid))?;
        Ok(rec.pickle)
    }

    /// `vote(txn)` (spec.md §4.6): checks every reference this
    /// transaction recorded resolves, then composes and stages the
    /// transaction record and the updated `x.oid`/`x.serial` root files.
    pub fn vote(&self, txn: &mut Txn) -> Result<()> {
        self.require_open(txn)?;

        if self.config.check_dangling_references {
            let refs: Vec<(Oid, Oid)> = txn.transaction.references().map(|(r, s)| (*r, *s)).collect();
            for (refoid, source) in refs {
                match txn.transaction.is_creation_undone(&refoid) {
                    Some(false) => continue,
                    Some(true) => return Err(Error::DanglingReference { source, target: refoid }),
                    None => {
                        let name = format!("o{}.c", refoid.to_hex());
                        match self.journal.read_database_file(&name) {
                            Ok(_) => continue,
                            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                                return Err(Error::DanglingReference { source, target: refoid })
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }

        let prev_tid = self.root_tid("x.serial")?;
        let oids: Vec<Oid> = txn.transaction.written_oids().map(|(o, _)| *o).collect();
        let tid = txn.transaction.tid;
        let rec = TransactionRecord {
            tid,
            prev_tid,
            user: txn.transaction.user.clone(),
            description: txn.transaction.description.clone(),
            extension: txn.transaction.extension.clone(),
            oids: oids.clone(),
        };
        let bytes = rec.encode(self.config.md5policy.write);

        let staging = txn.staging.as_mut().ok_or(Error::TxnState("vote called after finish/abort"))?;
        staging.write(&TransactionRecord::filename(tid), &bytes)?;

        let prev_oid = self.root_oid("x.oid")?;
        let max_oid = oids.into_iter().fold(prev_oid, |acc, o| acc.max(o));
        staging.write("x.oid", max_oid.as_bytes())?;
        staging.write("x.serial", tid.as_bytes())?;

        txn.transaction.mark_voted()
    }

    /// `finish(txn)`: hands the staging directory to `TxnStaging::finish`
    /// (fsync + rename + publish relocations) and enqueues it for async
    /// flush, releasing the commit permit for the next transaction.
    pub fn finish(&self, txn: &mut Txn) -> Result<Tid> {
        self.require_open(txn)?;
        if txn.staging.is_none() {
            return Err(Error::TxnState("finish called after finish/abort"));
        }
        txn.transaction.mark_finished()?;
        let staging = txn.staging.take().expect("checked above");

        let names = staging.staged_names();
        let done_dir = staging.finish(&self.relocations)?;
        self.journal.enqueue(done_dir, &names)?;

        *self.open_tid.lock().unwrap() = None;
        let _ = self.commit_release.send(());
        Ok(txn.transaction.tid)
    }

    /// `abort(txn)`: discards whatever was staged and releases the
    /// commit permit. Legal from `Begun` or `Voted`.
    pub fn abort(&self, txn: &mut Txn) -> Result<()> {
        self.require_open(txn)?;
        txn.transaction.mark_aborted()?;
        if let Some(staging) = txn.staging.take() {
            staging.abort();
        }
        *self.open_tid.lock().unwrap() = None;
        let _ = self.commit_release.send(());
        Ok(())
    }

    pub fn load_serial(&self, oid: Oid, tid: Tid) -> Result<Vec<u8>> {
        let name = ObjectRecord::filename(oid, tid);
        let data = self.journal.read_database_file(&name)?;
        let rec = ObjectRecord::decode(Path::new(&name), &data, self.config.md5policy.read, Some(oid), Some(tid))?;
        if rec.is_creation_undone() {
            return Err(Error::CreationUndone(oid, tid));
        }
        Ok(rec.pickle)
    }

    pub fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        let tid = self.current_serial(oid)?;
        if tid.is_zero() {
            return Err(Error::PosKeyError(oid));
        }
        let pickle = self.load_serial(oid, tid)?;
        Ok((pickle, tid))
    }

    fn read_transaction_meta(&self, tid: Tid, check_md5: bool) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let name = TransactionRecord::filename(tid);
        let data = self.journal.read_database_file(&name)?;
        let rec = TransactionRecord::decode(Path::new(&name), &data, check_md5)?;
        Ok((rec.user, rec.description, rec.extension))
    }

    /// `history(oid, count)` (spec.md §4.6). Walks the object's
    /// `prev_serial` chain. A missing object revision is expected (and
    /// ends the walk) once its TID is older than `x.packed`; otherwise
    /// it is a fatal format error. A missing transaction record is
    /// tolerated only under `keep_policy=undoable`, synthesizing the
    /// placeholder entry spec.md §9's open question resolves.
    pub fn history(&self, oid: Oid, count: usize) -> Result<Vec<HistoryEntry>> {
        let packed = self.root_tid("x.packed")?;
        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.history_timeout);

        let mut entries = Vec::new();
        let mut tid = self.current_serial(oid)?;
        if tid.is_zero() {
            return Ok(entries);
        }

        while entries.len() < count {
            if self.config.history_timeout > 0 && start.elapsed() > timeout {
                break;
            }
            let name = ObjectRecord::filename(oid, tid);
            let data = match self.journal.read_database_file(&name) {
                Ok(d) => d,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    if tid < packed {
                        break;
                    }
                    return Err(Error::Format {
                        path: PathBuf::from(name),
                        reason: "object revision newer than the pack threshold is missing".to_string(),
                    });
                }
                Err(e) => return Err(e),
            };
            let rec = ObjectRecord::decode(Path::new(&name), &data, self.config.md5policy.history, Some(oid), Some(tid))?;

            let (user, description, extension) = match self.read_transaction_meta(tid, self.config.md5policy.history) {
                Ok(meta) => meta,
                Err(_) if self.config.keep_policy == KeepPolicy::Undoable => {
                    (Vec::new(), b"<transaction record removed by pack>".to_vec(), Vec::new())
                }
                Err(e) => return Err(e),
            };

            entries.push(HistoryEntry { tid, user, description, extension, size: rec.pickle.len() });
            if rec.prev_serial.is_zero() {
                break;
            }
            tid = rec.prev_serial;
        }
        Ok(entries)
    }

    /// Whether the object revision at `(oid, tid)` can be safely undone:
    /// either it was the object's creation (no predecessor to restore)
    /// or its predecessor revision is still present.
    fn can_undo_oid(&self, oid: Oid, tid: Tid) -> bool {
        let name = ObjectRecord::filename(oid, tid);
        let data = match self.journal.read_database_file(&name) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let rec = match ObjectRecord::decode(Path::new(&name), &data, false, Some(oid), Some(tid)) {
            Ok(r) => r,
            Err(_) => return false,
        };
        if rec.prev_serial.is_zero() {
            return true;
        }
        let prev_name = ObjectRecord::filename(oid, rec.prev_serial);
        self.journal.read_database_file(&prev_name).is_ok()
    }

    /// `undoLog(first,last)` (spec.md §4.6): walks the transaction
    /// back-pointer chain from `x.serial`, in the half-open index range
    /// `[first, last)` counted from the newest transaction, dropping
    /// transactions any of whose OIDs cannot be undone.
    pub fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoLogEntry>> {
        let mut out = Vec::new();
        let mut tid = self.root_tid("x.serial")?;
        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.history_timeout);
        let mut index = 0usize;

        while !tid.is_zero() && index < last {
            if self.config.history_timeout > 0 && start.elapsed() > timeout {
                break;
            }
            let name = TransactionRecord::filename(tid);
            let data = match self.journal.read_database_file(&name) {
                Ok(d) => d,
                Err(_) => break,
            };
            let rec = TransactionRecord::decode(Path::new(&name), &data, self.config.md5policy.undolog)?;

            let can_undo = rec.oids.iter().all(|&oid| self.can_undo_oid(oid, tid));
            if can_undo && index >= first {
                out.push(UndoLogEntry {
                    tid,
                    user: rec.user.clone(),
                    description: rec.description.clone(),
                    extension: rec.extension.clone(),
                });
            }
            index += 1;
            tid = rec.prev_tid;
        }
        Ok(out)
    }

    /// `transactionalUndo(target_tid, txn)` (spec.md §4.6). For every OID
    /// the target transaction wrote, verifies the object's current
    /// revision either *is* the target revision or was itself produced
    /// by an earlier undo of the same target, then stages a fresh
    /// revision copying the target's predecessor payload (or an empty
    /// creation-undone revision if the target was the object's creation).
    pub fn transactional_undo(&self, txn: &mut Txn, target_tid: Tid) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        self.require_open(txn)?;

        let txn_name = TransactionRecord::filename(target_tid);
        let data = self.journal.read_database_file(&txn_name).map_err(|_| {
            Error::Undo(target_tid, "target transaction record is no longer present")
        })?;
        let target_rec = TransactionRecord::decode(Path::new(&txn_name), &data, self.config.md5policy.undo)?;

        for oid in target_rec.oids.clone() {
            let current = match txn.transaction.undone_serial(&oid) {
                Some(staged) => staged,
                None => self.current_serial(oid)?,
            };
            if current != target_tid {
                let cur_name = ObjectRecord::filename(oid, current);
                let cur_data = self.journal.read_database_file(&cur_name).map_err(|_| {
                    Error::Undo(target_tid, "object's current revision is missing")
                })?;
                let cur_obj =
                    ObjectRecord::decode(Path::new(&cur_name), &cur_data, self.config.md5policy.undo, Some(oid), Some(current))?;
                if cur_obj.undo_from != target_tid {
                    return Err(Error::Undo(
                        target_tid,
                        "object has been modified since the transaction being undone",
                    ));
                }
            }

            let target_obj_name = ObjectRecord::filename(oid, target_tid);
            let target_obj_data = self.journal.read_database_file(&target_obj_name)?;
            let target_obj = ObjectRecord::decode(
                Path::new(&target_obj_name),
                &target_obj_data,
                self.config.md5policy.undo,
                Some(oid),
                Some(target_tid),
            )?;

            let predecessor = target_obj.prev_serial;
            let payload = if predecessor.is_zero() {
                Vec::new()
            } else {
                self.load_serial_raw(oid, predecessor)?
            };

            let new_tid = txn.transaction.tid;
            let record = ObjectRecord {
                oid,
                undo_from: target_tid,
                prev_serial: current,
                this_serial: new_tid,
                pickle: payload,
            };
            let is_creation_undone = record.is_creation_undone();
            let bytes = record.encode(self.config.md5policy.write);
            let staging = txn.staging.as_mut().ok_or(Error::TxnState("transactionalUndo called after finish/abort"))?;
            staging.write(&ObjectRecord::filename(oid, new_tid), &bytes)?;
            staging.write(&format!("o{}.c", oid.to_hex()), &record::encode_current_pointer(new_tid))?;
            txn.transaction.record_store(oid, is_creation_undone)?;
            txn.transaction.record_undo(oid, new_tid)?;
        }
        Ok(())
    }
}
