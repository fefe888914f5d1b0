//! The relocations map: record name -> staging-directory path, letting
//! readers find freshly committed records before they have been flushed
//! into `A`/`B`. Publishing happens after `finish`'s directory rename but
//! before the flusher has moved the file into place; an entry is removed
//! only once the flush that owns it has actually landed the file (or a
//! later relocation has superseded it), never before (spec.md §9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Default)]
pub struct Relocations {
    inner: Mutex<HashMap<String, PathBuf>>,
}

impl Relocations {
    pub fn new() -> Self {
        Relocations { inner: Mutex::new(HashMap::new()) }
    }

    /// Publishes `name -> staging_dir` for every name in `names`. Called
    /// once per finished transaction, after its directory has been
    /// durably renamed to `..._done`.
    pub fn publish(&self, names: &[String], staging_dir: &std::path::Path) {
        let mut map = self.inner.lock().unwrap();
        for name in names {
            map.insert(name.clone(), staging_dir.to_path_buf());
        }
    }

    pub fn lookup(&self, name: &str) -> Option<PathBuf> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    /// Removes `name`'s relocation only if it still points at
    /// `expected_dir` — a later commit may have superseded it while this
    /// flush was queued, in which case the caller must not remove the
    /// newer entry and must instead discard its own (now-stale) staged
    /// copy.
    pub fn clear_if_unchanged(&self, name: &str, expected_dir: &std::path::Path) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get(name) {
            Some(dir) if dir == expected_dir => {
                map.remove(name);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_only_removes_matching_entry() {
        let r = Relocations::new();
        let dir_a = PathBuf::from("/journal/a_done");
        let dir_b = PathBuf::from("/journal/b_done");
        r.publish(&["o1.c".to_string()], &dir_a);
        assert_eq!(r.lookup("o1.c"), Some(dir_a.clone()));

        // a later commit supersedes the relocation while a's flush is queued
        r.publish(&["o1.c".to_string()], &dir_b);
        assert!(!r.clear_if_unchanged("o1.c", &dir_a));
        assert_eq!(r.lookup("o1.c"), Some(dir_b.clone()));

        assert!(r.clear_if_unchanged("o1.c", &dir_b));
        assert_eq!(r.lookup("o1.c"), None);
    }
}
