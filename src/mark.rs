//! Pluggable marker for pack's mark-and-sweep pass. `mark`/`unmark`/
//! `is_marked`/`unmark_all` over arbitrary record names (spec.md §4.3).
//!
//! The in-process `Memory` backend is the default; it holds every marked
//! name in a `HashSet` and is the right choice unless the live set
//! exceeds RAM (spec.md §9's design note steers systems-language ports
//! away from the non-portable `permissions` trick by default). `File`
//! reproduces the sidecar-file strategy for parity with the source.
//! `Nested` is feature-gated on `nested-mark-store` and backs the mark
//! set with an embedded B+-tree rather than an in-process hash set, for
//! stores whose live-object count does not comfortably fit in RAM.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::fs_primitives::FsPrimitives;

pub trait MarkContext: Send + Sync {
    fn mark(&self, name: &str) -> Result<()>;
    fn unmark(&self, name: &str) -> Result<()>;
    fn is_marked(&self, name: &str) -> Result<bool>;
    /// Clears every mark under `base` (pack pass 1).
    fn unmark_all(&self, base: &Path) -> Result<()>;
}

/// In-process hash set. The default backend.
pub struct Memory {
    marks: Mutex<HashSet<String>>,
}

impl Memory {
    pub fn new() -> Self {
        Memory { marks: Mutex::new(HashSet::new()) }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

impl MarkContext for Memory {
    fn mark(&self, name: &str) -> Result<()> {
        self.marks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn unmark(&self, name: &str) -> Result<()> {
        self.marks.lock().unwrap().remove(name);
        Ok(())
    }

    fn is_marked(&self, name: &str) -> Result<bool> {
        Ok(self.marks.lock().unwrap().contains(name))
    }

    fn unmark_all(&self, _base: &Path) -> Result<()> {
        self.marks.lock().unwrap().clear();
        Ok(())
    }
}

/// Sidecar-file backend: `<name>.mark` is created/removed next to the
/// record it marks, directly under the munged record's directory.
/// Matches the source's `_FileMarker`.
pub struct FileSidecar {
    root: PathBuf,
    fs: Arc<dyn FsPrimitives>,
}

impl FileSidecar {
    pub fn new(root: PathBuf, fs: Arc<dyn FsPrimitives>) -> Self {
        FileSidecar { root, fs }
    }

    fn mark_path(&self, name: &str) -> PathBuf {
        let mut p = self.root.join(name);
        let mut s = p.into_os_string();
        s.push(".mark");
        p = PathBuf::from(s);
        p
    }
}

impl MarkContext for FileSidecar {
    fn mark(&self, name: &str) -> Result<()> {
        self.fs.write_file(&self.mark_path(name), &[], false)
    }

    fn unmark(&self, name: &str) -> Result<()> {
        match self.fs.unlink(&self.mark_path(name)) {
            Ok(()) => Ok(()),
            Err(crate::error::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn is_marked(&self, name: &str) -> Result<bool> {
        Ok(self.fs.exists(&self.mark_path(name)))
    }

    fn unmark_all(&self, base: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(base).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && entry.file_name().to_string_lossy().ends_with(".mark") {
                let _ = self.fs.unlink(entry.path());
            }
        }
        Ok(())
    }
}

/// The non-portable permission-bit trick from the source (`chmod` one
/// execute bit to mean "marked"). Kept only for parity with the
/// original design; spec.md §9 steers new ports away from it. Gated
/// behind `permissions-mark` since it is Unix-only and mutates file
/// metadata other tools may not expect.
#[cfg(all(unix, feature = "permissions-mark"))]
pub struct PermissionBit {
    root: PathBuf,
}

#[cfg(all(unix, feature = "permissions-mark"))]
impl PermissionBit {
    pub fn new(root: PathBuf) -> Self {
        PermissionBit { root }
    }

    fn full(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[cfg(all(unix, feature = "permissions-mark"))]
impl MarkContext for PermissionBit {
    fn mark(&self, name: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.full(name);
        let meta = std::fs::metadata(&path)?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o100);
        std::fs::set_permissions(&path, perms)?;
        Ok(())
    }

    fn unmark(&self, name: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let path = self.full(name);
        let meta = std::fs::metadata(&path)?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() & !0o100);
        std::fs::set_permissions(&path, perms)?;
        Ok(())
    }

    fn is_marked(&self, name: &str) -> Result<bool> {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(self.full(name))?;
        Ok(meta.permissions().mode() & 0o100 != 0)
    }

    fn unmark_all(&self, base: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        for entry in walkdir::WalkDir::new(base).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    if meta.permissions().mode() & 0o100 != 0 {
                        let mut perms = meta.permissions();
                        perms.set_mode(perms.mode() & !0o100);
                        let _ = std::fs::set_permissions(entry.path(), perms);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Backs the mark set with a small embedded B+-tree instead of an
/// in-process hash set, for stores whose live-object count does not
/// comfortably fit in RAM (spec.md §4.3/§9). A fitting nod to the
/// teacher crate this engine is modeled on.
#[cfg(feature = "nested-mark-store")]
pub struct Nested {
    tree: sled::Db,
}

#[cfg(feature = "nested-mark-store")]
impl Nested {
    pub fn open(path: &Path) -> Result<Self> {
        let tree = sled::open(path).map_err(|e| {
            crate::error::Error::Recovery(format!("could not open nested mark store: {}", e))
        })?;
        Ok(Nested { tree })
    }
}

#[cfg(feature = "nested-mark-store")]
impl MarkContext for Nested {
    fn mark(&self, name: &str) -> Result<()> {
        self.tree.insert(name.as_bytes(), &[1u8]).map(|_| ()).map_err(|e| {
            crate::error::Error::Recovery(format!("nested mark store write failed: {}", e))
        })
    }

    fn unmark(&self, name: &str) -> Result<()> {
        self.tree.remove(name.as_bytes()).map(|_| ()).map_err(|e| {
            crate::error::Error::Recovery(format!("nested mark store write failed: {}", e))
        })
    }

    fn is_marked(&self, name: &str) -> Result<bool> {
        Ok(self.tree.contains_key(name.as_bytes()).unwrap_or(false))
    }

    fn unmark_all(&self, _base: &Path) -> Result<()> {
        self.tree.clear().map_err(|e| {
            crate::error::Error::Recovery(format!("nested mark store clear failed: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_mark_unmark_round_trip() {
        let m = Memory::new();
        assert!(!m.is_marked("o1").unwrap());
        m.mark("o1").unwrap();
        assert!(m.is_marked("o1").unwrap());
        m.unmark("o1").unwrap();
        assert!(!m.is_marked("o1").unwrap());
    }

    #[test]
    fn memory_unmark_all_clears_everything() {
        let m = Memory::new();
        m.mark("a").unwrap();
        m.mark("b").unwrap();
        m.unmark_all(Path::new(".")).unwrap();
        assert!(!m.is_marked("a").unwrap());
        assert!(!m.is_marked("b").unwrap());
    }

    #[test]
    fn file_sidecar_mark_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let m = FileSidecar::new(dir.path().to_path_buf(), Arc::new(crate::fs_primitives::Posix::new()));
        std::fs::write(dir.path().join("o1"), b"x").unwrap();
        assert!(!m.is_marked("o1").unwrap());
        m.mark("o1").unwrap();
        assert!(m.is_marked("o1").unwrap());
        m.unmark_all(dir.path()).unwrap();
        assert!(!m.is_marked("o1").unwrap());
    }
}
