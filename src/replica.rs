//! Native incremental-archive format applied to `journal/replica.tar`
//! during startup recovery (spec.md §4.4 step 3, §9). The source shells
//! out to `tar`/`cpio` for this; a systems-language port should not couple
//! itself to an external archiver, so this defines its own small framed
//! format instead: a sequence of `(path, content)` entries, each path
//! already relative to the database root (matching the source's
//! `whatsnew.py`/`cpio` pair, which archives munged paths rooted at the
//! storage directory, e.g. `A/o0/12/.../xxx`).
//!
//! `write_replica` exists for symmetry and tests; producing a replica
//! increment is the replication tool's job, which spec.md places out of
//! scope for the engine itself.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fs_primitives::FsPrimitives;

const REPLICA_MAGIC: [u8; 4] = *b"FDR1";

pub struct ReplicaEntry {
    /// Root-relative path using `/` separators, e.g. `A/o0/12/34/.../xxx`.
    pub path: String,
    pub content: Vec<u8>,
}

pub fn write_replica(entries: &[ReplicaEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&REPLICA_MAGIC);
    buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for entry in entries {
        let path_bytes = entry.path.as_bytes();
        buf.extend_from_slice(&(path_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(path_bytes);
        buf.extend_from_slice(&(entry.content.len() as u64).to_be_bytes());
        buf.extend_from_slice(&entry.content);
    }
    buf
}

fn read_entries(data: &[u8]) -> Result<Vec<ReplicaEntry>> {
    let fail = |reason: &str| Error::Recovery(format!("malformed replica.tar: {}", reason));

    if data.len() < 8 || data[0..4] != REPLICA_MAGIC {
        return Err(fail("bad magic"));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize;
    let mut pos = 8;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < pos + 2 {
            return Err(fail("truncated path length"));
        }
        let path_len = u16::from_be_bytes(data[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let path = std::str::from_utf8(
            data.get(pos..pos + path_len).ok_or_else(|| fail("truncated path"))?,
        )
        .map_err(|_| fail("path is not valid UTF-8"))?
        .to_string();
        pos += path_len;

        if data.len() < pos + 8 {
            return Err(fail("truncated content length"));
        }
        let content_len = u64::from_be_bytes(data[pos..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        let content = data.get(pos..pos + content_len).ok_or_else(|| fail("truncated content"))?.to_vec();
        pos += content_len;

        entries.push(ReplicaEntry { path, content });
    }
    Ok(entries)
}

/// Unpacks `replica_path` (a `journal/replica.tar` found at startup) into
/// `root`, syncing each touched parent directory as it goes.
pub fn apply_replica(replica_path: &Path, root: &Path, fs: &dyn FsPrimitives) -> Result<()> {
    let data = fs.read_file(replica_path)?;
    let entries = read_entries(&data)?;

    let mut synced = std::collections::HashSet::new();
    for entry in &entries {
        let dest = root_relative(root, &entry.path);
        if let Some(parent) = dest.parent() {
            if !fs.is_dir(parent) {
                fs.mkdir_all(parent)?;
            }
            if fs.supports_dirsync() && synced.insert(parent.to_path_buf()) {
                fs.sync_directory(parent)?;
            }
        }
        fs.write_file(&dest, &entry.content, true)?;
    }
    Ok(())
}

fn root_relative(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in rel.split('/') {
        path.push(component);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_primitives::Posix;

    #[test]
    fn round_trips_through_write_and_apply() {
        let entries = vec![
            ReplicaEntry { path: "A/x.serial".to_string(), content: vec![0u8; 8] },
            ReplicaEntry { path: "A/o0/12/34.0000000000000001".to_string(), content: b"payload".to_vec() },
        ];
        let bytes = write_replica(&entries);

        let dir = tempfile::tempdir().unwrap();
        let fs = Posix::new();
        let replica_path = dir.path().join("replica.tar");
        let mut f = std::fs::File::create(&replica_path).unwrap();
        f.write_all(&bytes).unwrap();
        drop(f);

        apply_replica(&replica_path, dir.path(), &fs).unwrap();

        assert_eq!(fs.read_file(&dir.path().join("A/x.serial")).unwrap(), vec![0u8; 8]);
        assert_eq!(
            fs.read_file(&dir.path().join("A/o0/12/34.0000000000000001")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let err = read_entries(b"nope");
        assert!(err.is_err());
    }
}
