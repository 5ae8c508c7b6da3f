//! Shared key/value store abstraction.
//!
//! The KV store is the single source of truth for all shared mutable state:
//! queues, catalogues, locks, and placeholders all live here, mediated by
//! compare-and-swap. Two backends are provided: an in-memory store for tests
//! and scenario suites, and a shared-filesystem store for deployments where
//! the fleet mounts a common volume.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crucible_retry::{RetryStrategyConfig, calculate_delay};

/// A shared key/value store with atomic compare-and-swap.
///
/// `compare_and_swap` is the only mutation the higher layers use for shared
/// records: `expected = None` means "insert only if absent", `new = None`
/// means "delete if it still matches". It returns `Ok(false)` on conflict
/// rather than an error so callers can loop.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite unconditionally.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Retry a read-modify-write until the CAS sticks.
///
/// The closure sees the current value and returns the replacement (`None`
/// deletes). Conflicts retry up to the catalogue CAS bound with jittered
/// backoff; a persistent conflict surfaces as a transient error.
pub fn cas_loop<F>(kv: &dyn KvStore, key: &str, mut f: F) -> Result<Option<Vec<u8>>>
where
    F: FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
{
    let config = RetryStrategyConfig::catalogue_cas();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = kv.get(key)?;
        let next = f(current.as_deref())?;
        if kv.compare_and_swap(key, current.as_deref(), next.as_deref())? {
            return Ok(next);
        }
        if attempt >= config.max_attempts {
            bail!("compare-and-swap on {key} still conflicted after {attempt} attempts");
        }
        thread::sleep(calculate_delay(&config, attempt));
    }
}

/// In-memory backend. One process, many threads; used by tests and the
/// scenario suite.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let current = entries.get(key).map(|v| v.as_slice());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value.to_vec());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

const STORE_LOCK_FILE: &str = ".kv.lock";
const STORE_LOCK_STALE: Duration = Duration::from_secs(30);

/// Shared-filesystem backend.
///
/// Keys are hex-encoded into flat file names (hex preserves byte order, so
/// prefix scans stay cheap), values are written via tmp + rename, and CAS
/// sections are serialised by a store-wide lock file with stale takeover.
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create kv root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }

    fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(value)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    fn acquire_store_lock(&self) -> Result<StoreLock> {
        let lock_path = self.root.join(STORE_LOCK_FILE);
        let deadline = Instant::now() + STORE_LOCK_STALE;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(
                        file,
                        "{} {}",
                        std::process::id(),
                        gethostname::gethostname().to_string_lossy()
                    );
                    return Ok(StoreLock { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = fs::metadata(&lock_path) {
                        let stale = meta
                            .modified()
                            .ok()
                            .and_then(|m| m.elapsed().ok())
                            .is_some_and(|age| age > STORE_LOCK_STALE);
                        if stale {
                            let _ = fs::remove_file(&lock_path);
                            continue;
                        }
                    }
                    if Instant::now() >= deadline {
                        bail!("kv store lock at {} held too long", lock_path.display());
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create kv lock {}", lock_path.display())
                    });
                }
            }
        }
    }
}

struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write_atomic(&self.entry_path(key), value)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool> {
        let _lock = self.acquire_store_lock()?;
        let current = self.get(key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => self.put(key, value)?,
            None => self.delete(key)?,
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let hex_prefix = hex::encode(prefix.as_bytes());
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to list kv root {}", self.root.display()))?
        {
            let entry = entry.context("failed to read kv dir entry")?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&hex_prefix) || name.ends_with(".tmp") || name == STORE_LOCK_FILE
            {
                continue;
            }
            let Ok(raw) = hex::decode(&name) else {
                continue;
            };
            let Ok(key) = String::from_utf8(raw) else {
                continue;
            };
            let value = fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            out.push((key, value));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
