//! Durable session storage.
//!
//! One `<uuid>.json` per session plus `launcher.json` for launcher records.
//! Writes go temp-file → fsync → rename so a reader only ever sees the
//! previous or the new valid content. Files whose stem is not a canonical
//! lowercase UUID v4 are ignored everywhere. Corrupt or empty files load as
//! `None`, never as errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bc_domain::trace::TraceEvent;
use bc_domain::{Result, Tracer};
use bc_protocol::{LauncherRecord, PersistedSession};
use parking_lot::Mutex;
use uuid::Uuid;

const LAUNCHER_FILE: &str = "launcher.json";

/// Canonical lowercase hyphenated UUID v4, the only id form accepted at
/// persistence boundaries.
pub fn is_canonical_uuid_v4(s: &str) -> bool {
    match Uuid::parse_str(s) {
        Ok(uuid) => uuid.get_version_num() == 4 && uuid.to_string() == s,
        Err(_) => false,
    }
}

struct StoreInner {
    dir: PathBuf,
    debounce: Duration,
    pending: Mutex<HashMap<Uuid, PersistedSession>>,
    flush_scheduled: AtomicBool,
    tracer: Tracer,
}

/// Atomic file store for sessions and launcher state. Cheap to clone.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<StoreInner>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, debounce_ms: u64, tracer: Tracer) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            inner: Arc::new(StoreInner {
                dir,
                debounce: Duration::from_millis(debounce_ms),
                pending: Mutex::new(HashMap::new()),
                flush_scheduled: AtomicBool::new(false),
                tracer,
            }),
        };
        store.reap_orphan_temps();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Remove leftover `.tmp` files from a crashed writer.
    fn reap_orphan_temps(&self) {
        let Ok(entries) = std::fs::read_dir(&self.inner.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                tracing::warn!(path = %path.display(), "reaping orphan temp file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Debounced save: coalesces rapid snapshots of the same session into a
    /// single write after the debounce interval.
    pub fn save(&self, snapshot: PersistedSession) {
        self.inner.pending.lock().insert(snapshot.id, snapshot);
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let store = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(store.inner.debounce).await;
                    store.flush_pending();
                });
            }
            Err(_) => {
                // No runtime (tests, shutdown path): write immediately.
                self.flush_pending();
            }
        }
    }

    /// Write out everything the debouncer has accumulated.
    pub fn flush_pending(&self) {
        self.inner.flush_scheduled.store(false, Ordering::Release);
        let drained: Vec<PersistedSession> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, v)| v).collect()
        };
        for snapshot in drained {
            if let Err(e) = self.save_sync(&snapshot) {
                tracing::error!(session_id = %snapshot.id, error = %e, "session save failed");
            }
        }
    }

    /// Immediate atomic write. Non-v4 ids are rejected silently (logged).
    pub fn save_sync(&self, snapshot: &PersistedSession) -> Result<()> {
        let id = snapshot.id.to_string();
        if !is_canonical_uuid_v4(&id) {
            tracing::error!(id = %id, "refusing to persist session with non-v4 id");
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        atomic_write(&self.inner.dir.join(format!("{id}.json")), &json)?;
        self.inner.tracer.emit(TraceEvent::SessionPersisted {
            session_id: id,
            sync: true,
        });
        Ok(())
    }

    /// Load one session by id string. Any failure — bad id, missing file,
    /// corrupt JSON — yields `None`.
    pub fn load(&self, id: &str) -> Option<PersistedSession> {
        if !is_canonical_uuid_v4(id) {
            tracing::error!(id = %id, "ignoring load of non-canonical session id");
            return None;
        }
        let path = self.inner.dir.join(format!("{id}.json"));
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::error!(id = %id, error = %e, "corrupt session file");
                None
            }
        }
    }

    /// Scan the directory for persisted sessions. Files whose stem is not a
    /// canonical UUID v4 are skipped with an error log.
    pub fn load_all(&self) -> Vec<PersistedSession> {
        let Ok(entries) = std::fs::read_dir(&self.inner.dir) else {
            return Vec::new();
        };
        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == "launcher" {
                continue;
            }
            if !is_canonical_uuid_v4(stem) {
                tracing::error!(file = %path.display(), "ignoring non-uuid session file");
                continue;
            }
            if let Some(session) = self.load(stem) {
                sessions.push(session);
            }
        }
        sessions
    }

    pub fn remove(&self, id: &Uuid) {
        self.inner.pending.lock().remove(id);
        let path = self.inner.dir.join(format!("{id}.json"));
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session_id = %id, error = %e, "failed to remove session file");
            }
        }
    }

    // ── Launcher state ────────────────────────────────────────────────

    pub fn save_launcher(&self, records: &[LauncherRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        atomic_write(&self.inner.dir.join(LAUNCHER_FILE), &json)
    }

    pub fn load_launcher(&self) -> Vec<LauncherRecord> {
        let path = self.inner.dir.join(LAUNCHER_FILE);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<LauncherRecord>>(&raw) {
            Ok(records) => records
                .into_iter()
                .filter(|r| {
                    let ok = is_canonical_uuid_v4(&r.session_id.to_string());
                    if !ok {
                        tracing::error!(id = %r.session_id, "dropping launcher record with non-v4 id");
                    }
                    ok
                })
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "corrupt launcher file");
                Vec::new()
            }
        }
    }
}

/// temp file → fsync → rename. A crash leaves at worst an orphan `.tmp`,
/// which the next startup reaps.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
