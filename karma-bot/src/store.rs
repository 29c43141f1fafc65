//! Persistent karma ledger.
//!
//! The ledger is a plain JSON object mapping handles to signed scores. It is
//! loaded once at startup and rewritten in full after every mutation, so the
//! file on disk always reflects the last reply the bot sent.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, info};

use crate::error::{Error, Result};

/// A handle together with its current score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KarmaEntry {
    pub handle: String,
    pub score: i64,
}

impl KarmaEntry {
    pub fn new(handle: impl Into<String>, score: i64) -> Self {
        Self {
            handle: handle.into(),
            score,
        }
    }
}

/// Thread-safe karma ledger bound to a JSON file.
///
/// A single mutex guards both the map and the file: a mutation and the
/// write that persists it happen under the same lock, so a concurrent
/// [`KarmaStore::close`] can never observe a half-applied change.
/// Entries are written in handle order.
pub struct KarmaStore {
    path: PathBuf,
    inner: Mutex<Ledger>,
}

struct Ledger {
    entries: BTreeMap<String, i64>,
    closed: bool,
}

impl KarmaStore {
    /// Loads the ledger stored at `path`.
    ///
    /// A missing or blank file yields an empty store that will create the
    /// file on its first save. Content that is not a JSON object of integer
    /// scores is rejected with [`Error::Parse`] rather than silently dropped.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(Error::io(path, err)),
        };

        info!(path = %path.display(), handles = entries.len(), "karma store loaded");
        Ok(Self::with_entries(path, entries))
    }

    /// Creates a store bound to `path` without touching the file system.
    pub fn with_entries(path: impl Into<PathBuf>, entries: BTreeMap<String, i64>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Ledger {
                entries,
                closed: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current score for `handle`, 0 when it has never been mutated.
    pub fn query(&self, handle: &str) -> i64 {
        self.lock().entries.get(handle).copied().unwrap_or(0)
    }

    /// Adds one to `handle` and persists the ledger.
    ///
    /// If the write fails the in-memory score has already moved and the
    /// error must be treated as fatal by the caller.
    pub fn increment(&self, handle: &str) -> Result<i64> {
        self.apply(handle, 1)
    }

    /// Subtracts one from `handle` and persists the ledger.
    pub fn decrement(&self, handle: &str) -> Result<i64> {
        self.apply(handle, -1)
    }

    fn apply(&self, handle: &str, delta: i64) -> Result<i64> {
        let mut ledger = self.lock();
        if ledger.closed {
            return Err(Error::StoreClosed);
        }

        let score = ledger.entries.entry(handle.to_string()).or_insert(0);
        *score = score.saturating_add(delta);
        let score = *score;
        debug!(handle, score, "karma updated");

        write_atomically(&self.path, &ledger.entries)?;
        Ok(score)
    }

    /// Highest scores first, at most `limit` entries.
    pub fn top(&self, limit: usize) -> Vec<KarmaEntry> {
        self.ranked(limit, false)
    }

    /// Lowest scores first, at most `limit` entries.
    pub fn bottom(&self, limit: usize) -> Vec<KarmaEntry> {
        self.ranked(limit, true)
    }

    /// All entries ordered by score and truncated to `limit`.
    ///
    /// Equal scores are ordered by handle, ascending, whichever direction
    /// the scores are sorted in.
    pub fn ranked(&self, limit: usize, ascending: bool) -> Vec<KarmaEntry> {
        let mut entries: Vec<KarmaEntry> = self
            .lock()
            .entries
            .iter()
            .map(|(handle, score)| KarmaEntry::new(handle.clone(), *score))
            .collect();

        entries.sort_by(|a, b| {
            let by_score = if ascending {
                a.score.cmp(&b.score)
            } else {
                b.score.cmp(&a.score)
            };
            by_score.then_with(|| a.handle.cmp(&b.handle))
        });
        entries.truncate(limit);
        entries
    }

    /// Copy of the whole ledger.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Rewrites the bound file with the current ledger.
    pub fn save(&self) -> Result<()> {
        let ledger = self.lock();
        write_atomically(&self.path, &ledger.entries)
    }

    /// Flushes the ledger one last time and refuses further mutations.
    ///
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut ledger = self.lock();
        if ledger.closed {
            return Ok(());
        }

        write_atomically(&self.path, &ledger.entries)?;
        ledger.closed = true;
        info!(path = %self.path.display(), handles = ledger.entries.len(), "karma store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// [`KarmaStore::increment`] on the blocking pool, for async callers.
    ///
    /// Resolves only once the ledger is on disk.
    pub async fn increment_async(self: &Arc<Self>, handle: &str) -> Result<i64> {
        let handle = handle.to_string();
        self.blocking(move |store| store.increment(&handle)).await
    }

    pub async fn decrement_async(self: &Arc<Self>, handle: &str) -> Result<i64> {
        let handle = handle.to_string();
        self.blocking(move |store| store.decrement(&handle)).await
    }

    pub async fn close_async(self: &Arc<Self>) -> Result<()> {
        self.blocking(|store| store.close()).await
    }

    // File writes and fsync must not stall the runtime's workers.
    async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&KarmaStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| Error::io(&self.path, io::Error::new(io::ErrorKind::Other, err)))?
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        // A panic while holding the lock cannot leave the map half-written,
        // every mutation is a single insert.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serializes `entries` next to `path` and renames the result into place,
/// so a crash mid-write leaves the previous file intact.
fn write_atomically(path: &Path, entries: &BTreeMap<String, i64>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
    }

    let encoded = serde_json::to_vec_pretty(entries)
        .map_err(|err| Error::io(path, io::Error::new(io::ErrorKind::InvalidData, err)))?;

    let tmp_path = temp_path(path);
    let write_tmp = || -> io::Result<()> {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&encoded)?;
        tmp.write_all(b"\n")?;
        tmp.sync_all()
    };
    write_tmp().map_err(|err| Error::io(&tmp_path, err))?;

    fs::rename(&tmp_path, path).map_err(|err| Error::io(path, err))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
