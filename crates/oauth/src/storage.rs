//! Durable key-value storage for the verifier and tokens.
//!
//! [`KeyValueStore`] is the plain get/set/remove surface. [`ExpiringStore`] layers
//! TTL-aware entries on top of any store by wrapping values in a small JSON envelope.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::{Context, Result, anyhow},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

pub const CODE_VERIFIER_KEY: &str = "code_verifier";
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Plain string key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Value stored by [`ExpiringStore::set_with_expiry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringEntry {
    pub value: String,
    /// Unix time in milliseconds after which the entry is stale.
    pub expiry: u64,
}

impl ExpiringEntry {
    /// Decode a stored envelope without touching the store.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn is_live_at(&self, now_ms: u64) -> bool {
        now_ms < self.expiry
    }
}

/// TTL-aware reads and writes. TTLs and expiries are in milliseconds.
pub trait ExpiringStore {
    fn set_with_expiry(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()>;

    /// Returns the value if it has not expired. Stale or unreadable entries are
    /// removed and reported as absent.
    fn get_with_expiry(&self, key: &str) -> Result<Option<String>>;

    /// Raw envelope, live or not, for status reporting.
    fn expiring_entry(&self, key: &str) -> Result<Option<ExpiringEntry>>;
}

impl<S: KeyValueStore + ?Sized> ExpiringStore for S {
    fn set_with_expiry(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        let entry = ExpiringEntry {
            value: value.to_string(),
            expiry: now_ms().saturating_add(ttl_ms),
        };
        self.set(key, &serde_json::to_string(&entry)?)
    }

    fn get_with_expiry(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.expiring_entry(key)? else {
            return Ok(None);
        };
        if entry.is_live_at(now_ms()) {
            return Ok(Some(entry.value));
        }
        debug!(key, "cached entry expired");
        self.remove(key)?;
        Ok(None)
    }

    fn expiring_entry(&self, key: &str) -> Result<Option<ExpiringEntry>> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        match ExpiringEntry::parse(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key, %e, "discarding malformed expiring entry");
                self.remove(key)?;
                Ok(None)
            },
        }
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// In-process store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// The file is re-read on every access so a login finished by one process is
/// visible to the next. Writes within a process are serialized; writes across
/// processes are last-writer-wins.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_content(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let content = self.read_content()?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            create_private_dir(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        write_private_file(&self.path, content.as_bytes())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Read-modify-write. An unparseable file is replaced rather than blocking
    /// every write, so `remove` can always clear it.
    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("file store lock poisoned"))?;
        let content = self.read_content()?;
        let mut entries = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %self.path.display(), %e, "replacing unreadable store file");
                    BTreeMap::new()
                },
            }
        };
        apply(&mut entries);
        self.write_all(&entries)
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// The file is created 0600 so tokens are never readable by others, and an
/// existing file is narrowed to 0600 before it is rewritten.
#[cfg(unix)]
fn write_private_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::{
        io::Write,
        os::unix::fs::{OpenOptionsExt, PermissionsExt},
    };
    if path.exists() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, content)
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("file store lock poisoned"))?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}
