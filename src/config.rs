//! `ConfigBuilder`/`Config`, in the same builder-then-seal shape the
//! teacher crate uses for its own settings: a plain struct of public
//! fields assembled with a builder macro, then wrapped in `Arc` once
//! `.build()` is called so it can be shared cheaply across the engine's
//! threads. `Config::open` additionally knows how to read and write the
//! on-disk `config/settings` INI file and `config/identity` (spec.md §6).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::fs_primitives::FsPrimitives;
use crate::path_munger::Scheme;

pub const STRUCTURE_VERSION: &str = "0.11";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageClass {
    Full,
    Minimal,
}

impl StorageClass {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Full" => Some(StorageClass::Full),
            "Minimal" => Some(StorageClass::Minimal),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Full => "Full",
            StorageClass::Minimal => "Minimal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepPolicy {
    /// Keeps every transaction file regardless of age.
    Detailed,
    /// Drops transaction files once their TID falls behind the pack
    /// threshold; `history()` synthesizes a placeholder entry for the
    /// objects it can no longer describe (see DESIGN.md for how this
    /// placeholder's fields were resolved).
    Undoable,
}

impl KeepPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "detailed" => Some(KeepPolicy::Detailed),
            "undoable" => Some(KeepPolicy::Undoable),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            KeepPolicy::Detailed => "detailed",
            KeepPolicy::Undoable => "undoable",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkBackend {
    Permissions,
    File,
    Memory,
    Minimal,
}

impl MarkBackend {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "permissions" => Some(MarkBackend::Permissions),
            "file" => Some(MarkBackend::File),
            "memory" => Some(MarkBackend::Memory),
            "Minimal" => Some(MarkBackend::Minimal),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MarkBackend::Permissions => "permissions",
            MarkBackend::File => "file",
            MarkBackend::Memory => "memory",
            MarkBackend::Minimal => "Minimal",
        }
    }
}

/// Per-operation checksum toggles (`md5policy.*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Md5Policy {
    pub write: bool,
    pub read: bool,
    pub overwrite: bool,
    pub undolog: bool,
    pub undo: bool,
    pub history: bool,
    pub pack: bool,
}

impl Default for Md5Policy {
    fn default() -> Self {
        Md5Policy {
            write: true,
            read: true,
            overwrite: true,
            undolog: true,
            undo: true,
            history: true,
            pack: true,
        }
    }
}

/// Per-class pack override (`keepclass.<name>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepClassPolicy {
    Forever,
    ExtraDays(u64),
}

macro_rules! builder {
    ($(($name:ident, $set:ident, $t:ty, $desc:expr)),* $(,)?) => {
        $(
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> ConfigBuilder {
                self.$name = to;
                self
            }
        )*
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfigBuilder {
    pub path: PathBuf,
    pub structure_format: Scheme,
    pub storage_classname: StorageClass,
    pub history_timeout: u64,
    pub delay_delete: u64,
    pub min_pack_time: u64,
    pub check_dangling_references: bool,
    pub keep_policy: KeepPolicy,
    pub md5policy: Md5Policy,
    pub filesystem_sync: bool,
    pub filesystem_quick_shutdown: bool,
    pub posix_dirsync: bool,
    pub posix_mark: MarkBackend,
    pub flush_interval_secs: u64,
    pub flush_file_threshold: usize,
    pub flush_transaction_threshold: usize,
    pub backlog: usize,
    pub keepclasses: HashMap<String, KeepClassPolicy>,
    pub read_only: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            path: PathBuf::from("default.dirstore"),
            structure_format: Scheme::Bushy,
            storage_classname: StorageClass::Full,
            history_timeout: 30,
            delay_delete: 0,
            min_pack_time: 0,
            check_dangling_references: true,
            keep_policy: KeepPolicy::Detailed,
            md5policy: Md5Policy::default(),
            filesystem_sync: true,
            filesystem_quick_shutdown: false,
            posix_dirsync: true,
            posix_mark: MarkBackend::Memory,
            flush_interval_secs: 1,
            flush_file_threshold: 1000,
            flush_transaction_threshold: 20,
            backlog: 3,
            keepclasses: HashMap::new(),
            read_only: false,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> ConfigBuilder {
        self.path = path.as_ref().to_path_buf();
        self
    }

    pub fn set_path<P: AsRef<Path>>(&mut self, path: P) {
        self.path = path.as_ref().to_path_buf();
    }

    pub fn build(self) -> Config {
        Config { inner: Arc::new(self), identity: Arc::new(String::new()) }
    }

    builder!(
        (structure_format, set_structure_format, Scheme, "PathMunger sharding scheme"),
        (storage_classname, set_storage_classname, StorageClass, "Full or Minimal core implementation"),
        (history_timeout, set_history_timeout, u64, "seconds bounding history()/undoLog() chain walks; 0 disables"),
        (delay_delete, set_delay_delete, u64, "seconds a pack-swept file waits as `-deleted` before unlink"),
        (min_pack_time, set_min_pack_time, u64, "floor on the pack threshold, in seconds"),
        (check_dangling_references, set_check_dangling_references, bool, "verify referenced OIDs resolve during vote"),
        (keep_policy, set_keep_policy, KeepPolicy, "whether pack retains all transaction files or only recent ones"),
        (md5policy, set_md5policy, Md5Policy, "per-operation checksum toggles"),
        (filesystem_sync, set_filesystem_sync, bool, "fsync files after write"),
        (filesystem_quick_shutdown, set_filesystem_quick_shutdown, bool, "skip the snapshot-on-close pass"),
        (posix_dirsync, set_posix_dirsync, bool, "fsync directories after rename/create/delete"),
        (posix_mark, set_posix_mark, MarkBackend, "pack MarkContext backend"),
        (flush_interval_secs, set_flush_interval_secs, u64, "seconds between forced flusher wakeups"),
        (flush_file_threshold, set_flush_file_threshold, usize, "staged files accumulated before a forced flush"),
        (flush_transaction_threshold, set_flush_transaction_threshold, usize, "staged transactions accumulated before a forced flush"),
        (backlog, set_backlog, usize, "number of in-flight flush batches commits may queue before blocking"),
        (read_only, set_read_only, bool, "refuse mutating calls")
    );

    pub fn keepclass(mut self, name: impl Into<String>, policy: KeepClassPolicy) -> ConfigBuilder {
        self.keepclasses.insert(name.into(), policy);
        self
    }
}

/// A sealed `ConfigBuilder`, cheap to clone and share across threads.
#[derive(Clone, Debug)]
pub struct Config {
    inner: Arc<ConfigBuilder>,
    identity: Arc<String>,
}

impl std::ops::Deref for Config {
    type Target = ConfigBuilder;
    fn deref(&self) -> &ConfigBuilder {
        &self.inner
    }
}

impl Config {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Opens an existing database's `config/settings`/`config/identity`,
    /// or — if neither exists — creates them from `builder` and a freshly
    /// generated identity.
    pub fn open(builder: ConfigBuilder, fs: &dyn FsPrimitives) -> Result<Config> {
        let config_dir = builder.path.join("config");
        let settings_path = config_dir.join("settings");
        let identity_path = config_dir.join("identity");

        if fs.exists(&settings_path) {
            let text = String::from_utf8(fs.read_file(&settings_path)?)
                .map_err(|e| Error::Config(format!("settings is not valid UTF-8: {}", e)))?;
            let parsed = parse_settings(&text, builder.path.clone())?;
            let identity = String::from_utf8(fs.read_file(&identity_path)?)
                .map_err(|e| Error::Config(format!("identity is not valid UTF-8: {}", e)))?;
            return Ok(Config { inner: Arc::new(parsed), identity: Arc::new(identity.trim().to_string()) });
        }

        fs.mkdir_all(&config_dir)?;
        let identity = generate_identity();
        fs.write_file(&settings_path, render_settings(&builder).as_bytes(), true)?;
        fs.write_file(&identity_path, identity.as_bytes(), true)?;
        Ok(Config { inner: Arc::new(builder), identity: Arc::new(identity) })
    }
}

fn generate_identity() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn render_settings(c: &ConfigBuilder) -> String {
    let mut out = String::new();
    out.push_str("[structure]\n");
    out.push_str(&format!("format = {}\n", c.structure_format.as_str()));
    out.push_str(&format!("version = {}\n", STRUCTURE_VERSION));
    out.push_str("\n[storage]\n");
    out.push_str(&format!("classname = {}\n", c.storage_classname.as_str()));
    out.push_str(&format!("history_timeout = {}\n", c.history_timeout));
    out.push_str(&format!("delay_delete = {}\n", c.delay_delete));
    out.push_str(&format!("min_pack_time = {}\n", c.min_pack_time));
    out.push_str(&format!("check_dangling_references = {}\n", c.check_dangling_references));
    out.push_str(&format!("keep_policy = {}\n", c.keep_policy.as_str()));
    out.push_str("\n[md5policy]\n");
    out.push_str(&format!("write = {}\n", c.md5policy.write));
    out.push_str(&format!("read = {}\n", c.md5policy.read));
    out.push_str(&format!("overwrite = {}\n", c.md5policy.overwrite));
    out.push_str(&format!("undolog = {}\n", c.md5policy.undolog));
    out.push_str(&format!("undo = {}\n", c.md5policy.undo));
    out.push_str(&format!("history = {}\n", c.md5policy.history));
    out.push_str(&format!("pack = {}\n", c.md5policy.pack));
    out.push_str("\n[filesystem]\n");
    out.push_str(&format!("sync = {}\n", c.filesystem_sync));
    out.push_str(&format!("quick_shutdown = {}\n", c.filesystem_quick_shutdown));
    out.push_str("\n[posix]\n");
    out.push_str(&format!("dirsync = {}\n", c.posix_dirsync));
    out.push_str(&format!("mark = {}\n", c.posix_mark.as_str()));
    out.push_str("\n[journal]\n");
    out.push_str(&format!("flush_interval = {}\n", c.flush_interval_secs));
    out.push_str(&format!("flush_file_threshold = {}\n", c.flush_file_threshold));
    out.push_str(&format!("flush_transaction_threshold = {}\n", c.flush_transaction_threshold));
    out.push_str(&format!("backlog = {}\n", c.backlog));
    if !c.keepclasses.is_empty() {
        out.push_str("\n[keepclass]\n");
        for (name, policy) in &c.keepclasses {
            let v = match policy {
                KeepClassPolicy::Forever => "forever".to_string(),
                KeepClassPolicy::ExtraDays(d) => format!("extra {}", d),
            };
            out.push_str(&format!("{} = {}\n", name, v));
        }
    }
    out
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::Config(format!("{}.{} has non-boolean value {:?}", section, key, other))),
    }
}

fn parse_u64(section: &str, key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{}.{} has non-numeric value {:?}", section, key, value)))
}

fn parse_usize(section: &str, key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{}.{} has non-numeric value {:?}", section, key, value)))
}

/// Parses an INI-style settings file into a `ConfigBuilder`, starting
/// from `ConfigBuilder::default().path(path)` and overriding whatever
/// keys are present.
fn parse_settings(text: &str, path: PathBuf) -> Result<ConfigBuilder> {
    let mut builder = ConfigBuilder::default().path(path);
    let mut section = String::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].trim().to_string();
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::Config(format!("settings line {} is not a key=value pair: {:?}", lineno + 1, raw_line))
        })?;
        let key = key.trim();
        let value = value.trim();

        match (section.as_str(), key) {
            ("structure", "format") => {
                builder.structure_format = Scheme::parse(value)
                    .ok_or_else(|| Error::Config(format!("unknown structure.format {:?}", value)))?;
            }
            ("structure", "version") => {
                if value != STRUCTURE_VERSION {
                    return Err(Error::Config(format!(
                        "structure.version {} is not supported (expected {})",
                        value, STRUCTURE_VERSION
                    )));
                }
            }
            ("storage", "classname") => {
                builder.storage_classname = StorageClass::parse(value)
                    .ok_or_else(|| Error::Config(format!("unknown storage.classname {:?}", value)))?;
            }
            ("storage", "history_timeout") => builder.history_timeout = parse_u64(&section, key, value)?,
            ("storage", "delay_delete") => builder.delay_delete = parse_u64(&section, key, value)?,
            ("storage", "min_pack_time") => builder.min_pack_time = parse_u64(&section, key, value)?,
            ("storage", "check_dangling_references") => {
                builder.check_dangling_references = parse_bool(&section, key, value)?
            }
            ("storage", "keep_policy") => {
                builder.keep_policy = KeepPolicy::parse(value)
                    .ok_or_else(|| Error::Config(format!("unknown storage.keep_policy {:?}", value)))?;
            }
            ("md5policy", "write") => builder.md5policy.write = parse_bool(&section, key, value)?,
            ("md5policy", "read") => builder.md5policy.read = parse_bool(&section, key, value)?,
            ("md5policy", "overwrite") => builder.md5policy.overwrite = parse_bool(&section, key, value)?,
            ("md5policy", "undolog") => builder.md5policy.undolog = parse_bool(&section, key, value)?,
            ("md5policy", "undo") => builder.md5policy.undo = parse_bool(&section, key, value)?,
            ("md5policy", "history") => builder.md5policy.history = parse_bool(&section, key, value)?,
            ("md5policy", "pack") => builder.md5policy.pack = parse_bool(&section, key, value)?,
            ("filesystem", "sync") => builder.filesystem_sync = parse_bool(&section, key, value)?,
            ("filesystem", "quick_shutdown") => builder.filesystem_quick_shutdown = parse_bool(&section, key, value)?,
            ("posix", "dirsync") => builder.posix_dirsync = parse_bool(&section, key, value)?,
            ("posix", "mark") => {
                builder.posix_mark = MarkBackend::parse(value)
                    .ok_or_else(|| Error::Config(format!("unknown posix.mark {:?}", value)))?;
            }
            ("journal", "flush_interval") => builder.flush_interval_secs = parse_u64(&section, key, value)?,
            ("journal", "flush_file_threshold") => builder.flush_file_threshold = parse_usize(&section, key, value)?,
            ("journal", "flush_transaction_threshold") => {
                builder.flush_transaction_threshold = parse_usize(&section, key, value)?
            }
            ("journal", "backlog") => builder.backlog = parse_usize(&section, key, value)?,
            ("keepclass", name) => {
                let policy = if value == "forever" {
                    KeepClassPolicy::Forever
                } else if let Some(days) = value.strip_prefix("extra ") {
                    KeepClassPolicy::ExtraDays(
                        days.trim()
                            .parse()
                            .map_err(|_| Error::Config(format!("bad keepclass.{} value {:?}", name, value)))?,
                    )
                } else {
                    return Err(Error::Config(format!("bad keepclass.{} value {:?}", name, value)));
                };
                builder.keepclasses.insert(name.to_string(), policy);
            }
            (section, key) => {
                return Err(Error::Config(format!("unrecognized setting {}.{}", section, key)));
            }
        }
    }

    Ok(builder)
}

impl fmt::Display for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_settings(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_primitives::Posix;

    #[test]
    fn creating_a_fresh_store_writes_settings_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Posix::new();
        let builder = ConfigBuilder::new().path(dir.path()).structure_format(Scheme::Chunky);
        let config = Config::open(builder, &fs).unwrap();
        assert_eq!(config.structure_format, Scheme::Chunky);
        assert_eq!(config.identity().len(), 32);
        assert!(fs.exists(&dir.path().join("config/settings")));
        assert!(fs.exists(&dir.path().join("config/identity")));
    }

    #[test]
    fn reopening_parses_back_the_same_settings() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Posix::new();
        let builder = ConfigBuilder::new()
            .path(dir.path())
            .structure_format(Scheme::Lawn)
            .history_timeout(7200)
            .keep_policy(KeepPolicy::Undoable)
            .keepclass("Cache", KeepClassPolicy::Forever);
        let first = Config::open(builder, &fs).unwrap();

        let reopened = Config::open(ConfigBuilder::new().path(dir.path()), &fs).unwrap();
        assert_eq!(reopened.structure_format, Scheme::Lawn);
        assert_eq!(reopened.history_timeout, 7200);
        assert_eq!(reopened.keep_policy, KeepPolicy::Undoable);
        assert_eq!(reopened.keepclasses.get("Cache"), Some(&KeepClassPolicy::Forever));
        assert_eq!(reopened.identity(), first.identity());
    }

    #[test]
    fn rejects_unsupported_structure_version() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Posix::new();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/settings"), "[structure]\nformat = flat\nversion = 9.9\n").unwrap();
        std::fs::write(dir.path().join("config/identity"), "deadbeef").unwrap();
        let err = Config::open(ConfigBuilder::new().path(dir.path()), &fs);
        assert!(err.is_err());
    }
}
