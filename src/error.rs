use std::path::PathBuf;

use crate::ids::{Oid, Tid};

/// Errors produced by the storage engine.
///
/// Transactional errors (`Conflict`, `ReadOnly`, `TxnState`, `Undo`,
/// `DanglingReference`, `PosKeyError`, `CreationUndone`) are ordinary,
/// expected outcomes of a commit or read and leave the engine otherwise
/// usable. `Format`, `Recovery`, and `BrokenFlusher` indicate on-disk
/// corruption or an unrecoverable background failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `store` was called with an `expected_serial` that does not match
    /// the object's current serial, and no conflict resolver merged it.
    #[error("conflicting write to {oid:?}: current serial {current:?}, expected {expected:?}")]
    Conflict {
        oid: Oid,
        current: Tid,
        expected: Tid,
    },

    /// A mutating call arrived on a read-only store.
    #[error("storage is read-only")]
    ReadOnly,

    /// A call arrived out of order for the transaction's current state.
    #[error("transaction state error: {0}")]
    TxnState(&'static str),

    /// `transactionalUndo` cannot be applied to the named transaction.
    #[error("cannot undo transaction {0:?}: {1}")]
    Undo(Tid, &'static str),

    /// `vote` found a reference to an object with no reachable revision.
    #[error("dangling reference from {source:?} to {target:?}")]
    DanglingReference { source: Oid, target: Oid },

    /// No revision of this object is reachable at all.
    #[error("no such object {0:?}")]
    PosKeyError(Oid),

    /// The object exists but the requested revision is a creation-undone
    /// placeholder (an empty pickle).
    #[error("object {0:?} has no data as of {1:?} (creation undone)")]
    CreationUndone(Oid, Tid),

    /// A record on disk failed a structural check (magic, length, OID,
    /// back-pointer, or checksum).
    #[error("corrupt record {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    /// Startup recovery found the journal directory in an inconsistent
    /// state that cannot be safely reconciled automatically.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// The background flusher hit an unrecoverable error and stopped;
    /// commits are blocked until an operator clears the condition.
    #[error("background flusher is broken: {0}")]
    BrokenFlusher(String),

    /// A settings file (`config/settings`) could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `enter_snapshot` was called while a snapshot (or recombine) was
    /// already in progress.
    #[error("store is already in snapshot mode")]
    AlreadyInSnapshot,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
