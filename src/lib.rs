//! A journalled, crash-safe object revision store built directly on a
//! POSIX filesystem: every object revision and every transaction record
//! is its own file under a sharded directory tree, writes are staged per
//! transaction and promoted atomically, and a background flusher drains
//! promoted transactions into the live tree in the background. See
//! `Store` for the entry point.
//!
//! Layout mirrors the module split of the storage engine this crate is
//! modeled on: identifiers and on-disk record codecs at the bottom
//! (`ids`, `record`, `path_munger`), a filesystem abstraction above them
//! (`fs_primitives`), the journalling/staging/snapshot machinery above
//! that (`staging`, `relocations`, `journal`, `snapshot`), and `core`
//! tying it all into the client-facing transaction protocol. `pack`
//! implements the mark-and-sweep collector as a separate pass over the
//! same primitives, and `replica` handles startup application of an
//! incremental replica bundle.

mod config;
mod core;
mod error;
mod fs_primitives;
mod ids;
mod journal;
mod mark;
mod pack;
mod path_munger;
mod record;
mod relocations;
mod replica;
mod snapshot;
mod staging;
mod txn;

pub use config::{
    Config, ConfigBuilder, KeepClassPolicy, KeepPolicy, MarkBackend, Md5Policy, StorageClass,
};
pub use core::{Core, ExtractRefs, HistoryEntry, ResolveConflict, Txn, UndoLogEntry};
pub use error::{Error, Result};
pub use fs_primitives::{FsPrimitives, Posix};
pub use ids::{Oid, Tid};
pub use pack::Classify;
pub use path_munger::{PathMunger, Scheme};
pub use replica::{apply_replica, write_replica, ReplicaEntry};

use std::path::Path;
use std::sync::Arc;

/// The store's public entry point: opens (or creates) a database and
/// hands out `Txn` handles for the commit protocol. A thin wrapper over
/// `Core` — this is the layer an application actually holds onto, while
/// `Core` stays free to be driven directly in tests or by an alternate
/// facade.
pub struct Store {
    core: Core,
}

impl Store {
    /// Opens the database at `config.path`, creating it if absent.
    /// `extract_refs` lets the caller make dangling-reference checks and
    /// pack's reachability trace aware of references embedded in
    /// pickles; `resolve_conflict` lets `store` merge past a stale
    /// `expected_serial` instead of failing outright. Both are optional.
    pub fn open(
        config: Config,
        extract_refs: Option<ExtractRefs>,
        resolve_conflict: Option<ResolveConflict>,
    ) -> Result<Store> {
        let fs: Arc<dyn FsPrimitives> = Arc::new(Posix::new());
        Ok(Store { core: Core::open(config, fs, extract_refs, resolve_conflict)? })
    }

    /// Convenience constructor: builds a default `Config` rooted at
    /// `path` and opens it with no reference-tracking callbacks.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Store> {
        let fs: Arc<dyn FsPrimitives> = Arc::new(Posix::new());
        let builder = ConfigBuilder::new().path(path);
        let config = Config::open(builder, fs.as_ref())?;
        Ok(Store { core: Core::open(config, fs, None, None)? })
    }

    pub fn next_tid(&self) -> Tid {
        self.core.next_tid()
    }

    pub fn last_transaction(&self) -> Result<Tid> {
        self.core.last_transaction()
    }

    pub fn is_directory_storage(&self) -> bool {
        self.core.is_directory_storage()
    }

    pub fn begin(&self, tid: Tid, user: Vec<u8>, description: Vec<u8>, extension: Vec<u8>) -> Result<Txn> {
        self.core.begin(tid, user, description, extension)
    }

    pub fn store(&self, txn: &mut Txn, oid: Oid, expected_serial: Tid, data: Vec<u8>) -> Result<Tid> {
        self.core.store(txn, oid, expected_serial, data)
    }

    pub fn vote(&self, txn: &mut Txn) -> Result<()> {
        self.core.vote(txn)
    }

    pub fn finish(&self, txn: &mut Txn) -> Result<Tid> {
        self.core.finish(txn)
    }

    pub fn abort(&self, txn: &mut Txn) -> Result<()> {
        self.core.abort(txn)
    }

    pub fn load(&self, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        self.core.load(oid)
    }

    pub fn load_serial(&self, oid: Oid, tid: Tid) -> Result<Vec<u8>> {
        self.core.load_serial(oid, tid)
    }

    pub fn history(&self, oid: Oid, count: usize) -> Result<Vec<HistoryEntry>> {
        self.core.history(oid, count)
    }

    pub fn undo_log(&self, first: usize, last: usize) -> Result<Vec<UndoLogEntry>> {
        self.core.undo_log(first, last)
    }

    pub fn transactional_undo(&self, txn: &mut Txn, target_tid: Tid) -> Result<()> {
        self.core.transactional_undo(txn, target_tid)
    }

    /// Runs the mark-and-sweep collector (spec.md §4.7). `extract_refs`
    /// overrides the store-wide callback for this run only; `classify`
    /// assigns each object a keep-class name for per-class pack policy.
    pub fn pack(&self, threshold: Tid, extract_refs: Option<ExtractRefs>, classify: Option<Classify>) -> Result<()> {
        self.core.pack(threshold, extract_refs, classify)
    }

    pub fn get_snapshot_code(&self) -> Option<String> {
        self.core.get_snapshot_code()
    }

    pub fn enter_snapshot(&self, code: &str) -> Result<()> {
        self.core.enter_snapshot(code)
    }

    pub fn leave_snapshot(&self, code: &str) -> Result<()> {
        self.core.leave_snapshot(code)
    }

    /// Flushes any pending background work and runs the snapshot-on-close
    /// pass (unless `filesystem.quick_shutdown` is set). The store is
    /// unusable after this returns.
    pub fn close(self) {
        self.core.shutdown();
    }
}
