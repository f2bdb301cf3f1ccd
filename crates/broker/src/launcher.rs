//! Session launcher: per-backend session lifecycle wrapping the process
//! supervisor, with durable `LauncherRecord`s.

use std::collections::HashMap;
use std::sync::Arc;

use bc_domain::{Error, Result};
use bc_protocol::{LaunchState, LauncherRecord};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::persist::FileStore;
use crate::supervisor::{ProcessSupervisor, SpawnSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether the broker launches the backend process itself, or merely
/// registers a session for an externally-managed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Forward,
    External,
}

/// Per-backend launch profile: the single source of truth for the CLI
/// surface of one backend.
pub trait BackendProfile: Send + Sync {
    fn adapter_name(&self) -> &str;
    fn launch_mode(&self) -> LaunchMode;
    /// Pure: build the spawn command for this session record.
    fn build_spawn_args(&self, record: &LauncherRecord) -> SpawnSpec;
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub adapter: String,
    pub cwd: Option<String>,
    pub name: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionLauncher {
    supervisor: Arc<ProcessSupervisor>,
    profiles: RwLock<HashMap<String, Arc<dyn BackendProfile>>>,
    /// Shared with detached exit-watch tasks.
    records: Arc<RwLock<HashMap<Uuid, LauncherRecord>>>,
    files: FileStore,
}

impl SessionLauncher {
    pub fn new(supervisor: Arc<ProcessSupervisor>, files: FileStore) -> Self {
        Self {
            supervisor,
            profiles: RwLock::new(HashMap::new()),
            records: Arc::new(RwLock::new(HashMap::new())),
            files,
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn register_profile(&self, profile: Arc<dyn BackendProfile>) {
        self.profiles
            .write()
            .insert(profile.adapter_name().to_owned(), profile);
    }

    fn profile(&self, adapter: &str) -> Result<Arc<dyn BackendProfile>> {
        self.profiles
            .read()
            .get(adapter)
            .cloned()
            .ok_or_else(|| Error::Adapter {
                adapter: adapter.to_owned(),
                message: "no launch profile registered".into(),
            })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Create a session: mint a UUID, record it, and (for forward-launch
    /// backends) spawn the process.
    pub fn launch(&self, opts: &LaunchOptions) -> Result<LauncherRecord> {
        let profile = self.profile(&opts.adapter)?;
        let session_id = Uuid::new_v4();
        let mut record = LauncherRecord::new(session_id, &opts.adapter, opts.cwd.clone());
        if let Some(name) = &opts.name {
            record.name = name.clone();
        }

        if profile.launch_mode() == LaunchMode::Forward {
            let spec = profile.build_spawn_args(&record);
            let handle = self
                .supervisor
                .spawn_process(session_id, &spec, profile.adapter_name())?;
            record.pid = Some(handle.pid);
            self.watch_exit(session_id, handle);
        }

        self.records.write().insert(session_id, record.clone());
        self.persist();
        tracing::info!(
            session_id = %session_id,
            adapter = %opts.adapter,
            pid = ?record.pid,
            "session launched"
        );
        Ok(record)
    }

    /// Kill then respawn. Archived and unknown sessions are rejected;
    /// external-session adapters only reset the record to `starting`.
    pub async fn relaunch(&self, session_id: &Uuid) -> Result<LauncherRecord> {
        let record = self
            .get_session(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if record.archived {
            return Err(Error::Other(format!(
                "session {session_id} is archived; relaunch skipped"
            )));
        }
        let profile = self.profile(&record.adapter_name)?;

        self.supervisor.kill_process(session_id).await?;

        let mut pid = None;
        if profile.launch_mode() == LaunchMode::Forward {
            let spec = profile.build_spawn_args(&record);
            let handle = self
                .supervisor
                .spawn_process(*session_id, &spec, profile.adapter_name())?;
            pid = Some(handle.pid);
            self.watch_exit(*session_id, handle);
        }

        let updated = self.update(session_id, |r| {
            r.pid = pid;
            r.state = LaunchState::Starting;
        });
        tracing::info!(session_id = %session_id, pid = ?pid, "session relaunched");
        updated.ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    pub async fn kill(&self, session_id: &Uuid) -> Result<()> {
        self.supervisor.kill_process(session_id).await?;
        self.update(session_id, |r| {
            r.pid = None;
            if r.state != LaunchState::Archived {
                r.state = LaunchState::Exited;
            }
        });
        Ok(())
    }

    pub async fn kill_all(&self) {
        let ids: Vec<Uuid> = self.records.read().keys().copied().collect();
        for id in ids {
            let _ = self.kill(&id).await;
        }
    }

    // ── Record accessors ──────────────────────────────────────────────

    pub fn get_session(&self, session_id: &Uuid) -> Option<LauncherRecord> {
        self.records.read().get(session_id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<LauncherRecord> {
        let mut records: Vec<LauncherRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn starting_sessions(&self) -> Vec<LauncherRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.state == LaunchState::Starting && !r.archived)
            .cloned()
            .collect()
    }

    // ── Record mutation ───────────────────────────────────────────────

    pub fn mark_connected(&self, session_id: &Uuid) {
        self.update(session_id, |r| r.state = LaunchState::Connected);
    }

    pub fn set_backend_session_id(&self, session_id: &Uuid, backend_session_id: String) {
        self.update(session_id, |r| {
            r.backend_session_id = Some(backend_session_id)
        });
    }

    pub fn set_session_name(&self, session_id: &Uuid, name: String) {
        self.update(session_id, |r| r.name = name);
    }

    pub fn set_archived(&self, session_id: &Uuid, archived: bool) {
        self.update(session_id, |r| {
            r.archived = archived;
            r.state = if archived {
                LaunchState::Archived
            } else {
                LaunchState::Exited
            };
        });
    }

    pub fn remove_session(&self, session_id: &Uuid) {
        self.records.write().remove(session_id);
        self.persist();
    }

    /// Load launcher records from disk. Previously-connected sessions come
    /// back as `starting` so the reconnect watchdog picks them up; stale
    /// PIDs are cleared.
    pub fn restore_from_storage(&self) -> usize {
        let loaded = self.files.load_launcher();
        let count = loaded.len();
        let mut records = self.records.write();
        for mut record in loaded {
            record.pid = None;
            if record.state == LaunchState::Connected {
                record.state = LaunchState::Starting;
            }
            records.insert(record.session_id, record);
        }
        tracing::info!(restored = count, "launcher state restored");
        count
    }

    fn update(
        &self,
        session_id: &Uuid,
        mutate: impl FnOnce(&mut LauncherRecord),
    ) -> Option<LauncherRecord> {
        let updated = {
            let mut records = self.records.write();
            let record = records.get_mut(session_id)?;
            mutate(record);
            Some(record.clone())
        };
        self.persist();
        updated
    }

    fn persist(&self) {
        let records: Vec<LauncherRecord> = self.records.read().values().cloned().collect();
        if let Err(e) = self.files.save_launcher(&records) {
            tracing::error!(error = %e, "failed to persist launcher state");
        }
    }

    /// Track the child's exit into the record.
    fn watch_exit(&self, session_id: Uuid, handle: Arc<crate::supervisor::ProcessHandle>) {
        let probe = LauncherExitProbe {
            records: self.records.clone(),
            files: self.files.clone(),
        };
        let pid = handle.pid;
        tokio::spawn(async move {
            let code = handle.wait_exit().await;
            probe.mark_exited(session_id, pid, code);
        });
    }
}

/// Updates a record when its process exits, if the PID still matches
/// (a relaunch may have replaced it already).
struct LauncherExitProbe {
    records: Arc<RwLock<HashMap<Uuid, LauncherRecord>>>,
    files: FileStore,
}

impl LauncherExitProbe {
    fn mark_exited(&self, session_id: Uuid, pid: u32, code: Option<i32>) {
        let mut changed = false;
        {
            let mut records = self.records.write();
            if let Some(record) = records.get_mut(&session_id) {
                if record.pid == Some(pid) {
                    record.pid = None;
                    if record.state != LaunchState::Archived {
                        record.state = LaunchState::Exited;
                    }
                    changed = true;
                }
            }
        }
        if changed {
            tracing::info!(session_id = %session_id, exit_code = ?code, "launcher recorded process exit");
            let records: Vec<LauncherRecord> = self.records.read().values().cloned().collect();
            if let Err(e) = self.files.save_launcher(&records) {
                tracing::error!(error = %e, "failed to persist launcher state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_domain::config::SupervisorConfig;
    use bc_domain::Tracer;

    struct TestProfile {
        name: &'static str,
        mode: LaunchMode,
    }

    impl BackendProfile for TestProfile {
        fn adapter_name(&self) -> &str {
            self.name
        }
        fn launch_mode(&self) -> LaunchMode {
            self.mode
        }
        fn build_spawn_args(&self, record: &LauncherRecord) -> SpawnSpec {
            let mut spec = SpawnSpec::new("/bin/sh");
            spec.args = vec!["-c".into(), "sleep 30".into()];
            spec.cwd = record.cwd.clone().map(Into::into);
            spec
        }
    }

    fn launcher(dir: &std::path::Path) -> SessionLauncher {
        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig::default(),
            Tracer::disabled(),
        ));
        let files = FileStore::open(dir, 10, Tracer::disabled()).unwrap();
        let launcher = SessionLauncher::new(supervisor, files);
        launcher.register_profile(Arc::new(TestProfile {
            name: "external",
            mode: LaunchMode::External,
        }));
        launcher
    }

    #[tokio::test]
    async fn external_launch_registers_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let record = launcher
            .launch(&LaunchOptions {
                adapter: "external".into(),
                cwd: None,
                name: Some("remote peer".into()),
            })
            .unwrap();
        assert_eq!(record.state, LaunchState::Starting);
        assert!(record.pid.is_none());
        assert_eq!(record.name, "remote peer");
        assert_eq!(launcher.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn unknown_adapter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        assert!(launcher
            .launch(&LaunchOptions {
                adapter: "nope".into(),
                ..Default::default()
            })
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forward_launch_spawns_and_kill_marks_exited() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        launcher.register_profile(Arc::new(TestProfile {
            name: "cli",
            mode: LaunchMode::Forward,
        }));
        let record = launcher
            .launch(&LaunchOptions {
                adapter: "cli".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(record.pid.is_some());
        assert_eq!(record.state, LaunchState::Starting);

        launcher.kill(&record.session_id).await.unwrap();
        let after = launcher.get_session(&record.session_id).unwrap();
        assert_eq!(after.state, LaunchState::Exited);
        assert!(after.pid.is_none());
    }

    #[tokio::test]
    async fn archived_sessions_refuse_relaunch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let record = launcher
            .launch(&LaunchOptions {
                adapter: "external".into(),
                ..Default::default()
            })
            .unwrap();
        launcher.set_archived(&record.session_id, true);
        assert!(launcher.relaunch(&record.session_id).await.is_err());
        assert!(launcher.starting_sessions().is_empty());
    }

    #[tokio::test]
    async fn restore_maps_connected_back_to_starting() {
        let dir = tempfile::tempdir().unwrap();
        {
            let launcher = launcher(dir.path());
            let record = launcher
                .launch(&LaunchOptions {
                    adapter: "external".into(),
                    ..Default::default()
                })
                .unwrap();
            launcher.mark_connected(&record.session_id);
            launcher.set_backend_session_id(&record.session_id, "be-123".into());
        }

        let fresh = launcher(dir.path());
        assert_eq!(fresh.restore_from_storage(), 1);
        let records = fresh.list_sessions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, LaunchState::Starting);
        assert!(records[0].pid.is_none());
        assert_eq!(records[0].backend_session_id.as_deref(), Some("be-123"));
    }

    #[tokio::test]
    async fn remove_session_forgets_record() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let record = launcher
            .launch(&LaunchOptions {
                adapter: "external".into(),
                ..Default::default()
            })
            .unwrap();
        launcher.remove_session(&record.session_id);
        assert!(launcher.get_session(&record.session_id).is_none());
        assert!(launcher.list_sessions().is_empty());
    }
}
