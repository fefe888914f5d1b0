//! The per-transaction state machine: `Idle -> Begun -> Voted ->
//! (Finished | Aborted) -> Idle`. `Core` owns the commit lock that
//! ensures only one `Transaction` is open at a time; this module only
//! enforces that calls arrive in the right order for a given instance.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ids::{Oid, Tid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    Begun,
    Voted,
    Finished,
    Aborted,
}

/// Tracks one open commit: the record names written so far and the
/// cross-object reference graph `vote` will check for dangling targets.
pub struct Transaction {
    state: TxnState,
    pub tid: Tid,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    /// `oid -> is_creation_undone`, per spec.md §4.6's `oids[OID]`.
    oids: HashMap<Oid, bool>,
    /// `refoid -> source oid`, per spec.md §4.6's `refoids[refoid]`.
    refoids: HashMap<Oid, Oid>,
    /// `oid -> tid` this transaction's own `transactionalUndo` calls have
    /// staged so far, per spec.md §4.6's `td.undone`. Consulted before
    /// falling back to the on-disk current serial so that undoing two
    /// revisions of the same object within one open transaction sees its
    /// own prior staged undo rather than stale on-disk state.
    undone: HashMap<Oid, Tid>,
}

impl Transaction {
    pub fn begin(tid: Tid, user: Vec<u8>, description: Vec<u8>, extension: Vec<u8>) -> Self {
        Transaction {
            state: TxnState::Begun,
            tid,
            user,
            description,
            extension,
            oids: HashMap::new(),
            refoids: HashMap::new(),
            undone: HashMap::new(),
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    fn require(&self, expected: TxnState, action: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::TxnState(action))
        }
    }

    /// Records that `oid` was written this transaction, and whether the
    /// revision is a creation-undone placeholder.
    pub fn record_store(&mut self, oid: Oid, is_creation_undone: bool) -> Result<()> {
        self.require(TxnState::Begun, "store called outside an open transaction")?;
        self.oids.insert(oid, is_creation_undone);
        Ok(())
    }

    pub fn record_reference(&mut self, refoid: Oid, source: Oid) -> Result<()> {
        self.require(TxnState::Begun, "store called outside an open transaction")?;
        self.refoids.entry(refoid).or_insert(source);
        Ok(())
    }

    pub fn written_oids(&self) -> impl Iterator<Item = (&Oid, &bool)> {
        self.oids.iter()
    }

    pub fn references(&self) -> impl Iterator<Item = (&Oid, &Oid)> {
        self.refoids.iter()
    }

    pub fn is_creation_undone(&self, oid: &Oid) -> Option<bool> {
        self.oids.get(oid).copied()
    }

    /// The serial this transaction's own undo chain has already staged
    /// for `oid`, if any.
    pub fn undone_serial(&self, oid: &Oid) -> Option<Tid> {
        self.undone.get(oid).copied()
    }

    /// Records that staging an undo for `oid` within this transaction
    /// left `new_tid` as its (not yet flushed) current serial.
    pub fn record_undo(&mut self, oid: Oid, new_tid: Tid) -> Result<()> {
        self.require(TxnState::Begun, "transactionalUndo called outside an open transaction")?;
        self.undone.insert(oid, new_tid);
        Ok(())
    }

    pub fn mark_voted(&mut self) -> Result<()> {
        self.require(TxnState::Begun, "vote called from a non-begun transaction")?;
        self.state = TxnState::Voted;
        Ok(())
    }

    pub fn mark_finished(&mut self) -> Result<()> {
        self.require(TxnState::Voted, "finish called before vote")?;
        self.state = TxnState::Finished;
        Ok(())
    }

    /// Abort is legal from either `Begun` (the client gave up before
    /// voting) or `Voted` (the collaborator rejected the vote result).
    pub fn mark_aborted(&mut self) -> Result<()> {
        match self.state {
            TxnState::Begun | TxnState::Voted => {
                self.state = TxnState::Aborted;
                Ok(())
            }
            TxnState::Finished | TxnState::Aborted => {
                Err(Error::TxnState("abort called on an already-closed transaction"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> Transaction {
        Transaction::begin(Tid::from_u64(1), b"alice".to_vec(), b"did a thing".to_vec(), Vec::new())
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = txn();
        assert_eq!(t.state(), TxnState::Begun);
        t.record_store(Oid::from_u64(1), false).unwrap();
        t.mark_voted().unwrap();
        assert_eq!(t.state(), TxnState::Voted);
        t.mark_finished().unwrap();
        assert_eq!(t.state(), TxnState::Finished);
    }

    #[test]
    fn store_after_vote_is_rejected() {
        let mut t = txn();
        t.mark_voted().unwrap();
        assert!(t.record_store(Oid::from_u64(1), false).is_err());
    }

    #[test]
    fn finish_before_vote_is_rejected() {
        let mut t = txn();
        assert!(t.mark_finished().is_err());
    }

    #[test]
    fn abort_from_begun_or_voted_but_not_twice() {
        let mut t = txn();
        t.mark_aborted().unwrap();
        assert_eq!(t.state(), TxnState::Aborted);
        assert!(t.mark_aborted().is_err());

        let mut t2 = txn();
        t2.mark_voted().unwrap();
        t2.mark_aborted().unwrap();
        assert_eq!(t2.state(), TxnState::Aborted);
    }
}
