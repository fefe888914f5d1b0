//! Per-transaction staging directory, `journal/working_<TID>_temp`.
//! Accepts record writes, and on `finish` fsyncs everything, atomically
//! renames itself to `..._done`, publishes relocations, and hands the
//! finished directory back to the caller (`JournalFS`) to enqueue for
//! flushing. `vote` has no staging-level behavior of its own — the
//! reference-checking and transaction-record composition described in
//! spec.md §4.6 happen one layer up, in `core::Core`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::trace;

use crate::error::Result;
use crate::fs_primitives::{FsPrimitives, HalfWrite};
use crate::ids::Tid;
use crate::relocations::Relocations;

struct StagedFile {
    name: String,
    half: HalfWrite,
}

pub struct TxnStaging {
    fs: Arc<dyn FsPrimitives>,
    journal_dir: PathBuf,
    dir: PathBuf,
    sync: bool,
    staged: Vec<StagedFile>,
    by_name: HashMap<String, usize>,
}

impl TxnStaging {
    pub fn begin(fs: Arc<dyn FsPrimitives>, journal_dir: &Path, tid: Tid, sync: bool) -> Result<Self> {
        let dir = journal_dir.join(format!("working_{}_temp", tid.to_hex()));
        fs.mkdir(&dir)?;
        Ok(TxnStaging {
            fs,
            journal_dir: journal_dir.to_path_buf(),
            dir,
            sync,
            staged: Vec::new(),
            by_name: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stages `name` with `content`. Writing the same name twice aborts
    /// the previous half-written file and replaces it, matching the
    /// source's "write for a name already present aborts the previous
    /// half-written file" rule.
    pub fn write(&mut self, name: &str, content: &[u8]) -> Result<()> {
        if let Some(&idx) = self.by_name.get(name) {
            let old = std::mem::replace(
                &mut self.staged[idx],
                StagedFile { name: name.to_string(), half: self.fs.first_half_write_file(&self.dir.join(name), content)? },
            );
            self.fs.abort_half_write_file(old.half)?;
            return Ok(());
        }
        let half = self.fs.first_half_write_file(&self.dir.join(name), content)?;
        self.by_name.insert(name.to_string(), self.staged.len());
        self.staged.push(StagedFile { name: name.to_string(), half });
        Ok(())
    }

    pub fn staged_names(&self) -> Vec<String> {
        self.staged.iter().map(|s| s.name.clone()).collect()
    }

    /// fsyncs each staged file in insertion order (so the transaction
    /// record, always staged last, is durable no earlier than every
    /// object revision it references), fsyncs the staging directory,
    /// atomically renames it to `..._done`, fsyncs `journal/`, and
    /// publishes relocations for every staged name. Returns the
    /// `..._done` directory for the caller to enqueue onto the flusher.
    pub fn finish(mut self, relocations: &Relocations) -> Result<PathBuf> {
        for staged in self.staged.drain(..) {
            self.fs.second_half_write_file(staged.half, self.sync)?;
        }
        if self.sync {
            self.fs.sync_directory(&self.dir)?;
        }
        let done_dir = self.dir.with_file_name(
            self.dir.file_name().unwrap().to_string_lossy().replacen("_temp", "_done", 1),
        );
        self.fs.rename(&self.dir, &done_dir)?;
        if self.sync {
            self.fs.sync_directory(&self.journal_dir)?;
        }
        relocations.publish(&self.by_name.keys().cloned().collect::<Vec<_>>(), &done_dir);
        trace!("transaction staged at {:?} finished -> {:?}", self.dir, done_dir);
        Ok(done_dir)
    }

    /// Releases half-written files, removes them, and removes the
    /// staging directory. Errors during abort are swallowed — an
    /// abandoned `_temp` directory is harmless and gets cleaned up by
    /// the next startup recovery pass if this best-effort cleanup fails.
    pub fn abort(mut self) {
        for staged in self.staged.drain(..) {
            let _ = self.fs.abort_half_write_file(staged.half);
        }
        let _ = self.fs.rmdir(&self.dir);
    }
}
