//! Remote File Stager
//!
//! SQLite files that live on another host are copied into a private local
//! directory before the adapter opens them, and copied back on sync or release.
//! The stager owns the `connection id -> (local copy, remote path, ssh)` table.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::transport::FileTransport;
use crate::engine::types::{ConnectionConfig, Protocol, SessionId, SshTunnelConfig};

const LOCAL_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];
const FALLBACK_BASENAME: &str = "database.sqlite";

/// A local copy of a remote SQLite file
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub ssh: SshTunnelConfig,
}

/// Outcome of releasing a staged file.
///
/// The upload result and the local cleanup are reported separately so a
/// failed upload never hides behind a successful delete (or vice versa).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub sync_error: Option<String>,
    pub local_removed: bool,
    /// Set when the local copy was kept after a failed upload
    pub retained_path: Option<PathBuf>,
}

pub struct RemoteFileStager {
    temp_dir: PathBuf,
    transport: Arc<dyn FileTransport>,
    staged: RwLock<HashMap<SessionId, StagedFile>>,
    delete_local_on_failed_upload: bool,
}

impl RemoteFileStager {
    pub fn new(
        temp_dir: impl Into<PathBuf>,
        transport: Arc<dyn FileTransport>,
        delete_local_on_failed_upload: bool,
    ) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            transport,
            staged: RwLock::new(HashMap::new()),
            delete_local_on_failed_upload,
        }
    }

    /// True for an empty host or a loopback name.
    pub fn is_local_host(host: &str) -> bool {
        let host = host.trim();
        host.is_empty() || LOCAL_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h))
    }

    /// Only SQLite files on a non-local host, reached over SSH, are staged.
    pub fn needs_staging(config: &ConnectionConfig) -> bool {
        config.protocol == Protocol::Sqlite
            && config.ssh_tunnel.is_some()
            && !Self::is_local_host(&config.host)
    }

    /// Downloads the remote file and records the mapping. Returns the local path
    /// the adapter should open in place of the remote one.
    #[instrument(skip(self, config), fields(connection_id = %id, host = %config.host))]
    pub async fn stage(&self, id: &SessionId, config: &ConnectionConfig) -> EngineResult<PathBuf> {
        let ssh = config
            .ssh_tunnel
            .clone()
            .ok_or_else(|| EngineError::invalid_config("SSH settings are required to stage a remote file"))?;
        let remote_path = config
            .sqlite_file
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EngineError::invalid_config("SQLite file path is required"))?
            .to_string();

        self.ensure_temp_dir()?;
        let local_path = self.unique_local_path(id, &remote_path);

        if let Err(e) = self.transport.download(&remote_path, &local_path, &ssh).await {
            remove_quietly(&local_path);
            return Err(EngineError::staging_failed(format!(
                "could not download {}: {}. Check that the file exists and that the SSH user may read and write it",
                remote_path, e
            )));
        }

        if let Err(e) = Self::preflight(&local_path) {
            remove_quietly(&local_path);
            return Err(e);
        }

        info!(remote = %remote_path, local = %local_path.display(), "Staged remote SQLite file");

        let mut staged = self.staged.write().await;
        staged.insert(
            id.clone(),
            StagedFile {
                local_path: local_path.clone(),
                remote_path,
                ssh,
            },
        );

        Ok(local_path)
    }

    /// Checks that a staged copy exists and can be opened for reading and writing.
    pub fn preflight(path: &Path) -> EngineResult<()> {
        if !path.is_file() {
            return Err(EngineError::StagedFileMissing {
                path: path.display().to_string(),
            });
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|_| ())
            .map_err(|_| EngineError::StagedFilePermission {
                path: path.display().to_string(),
            })
    }

    /// Uploads the local copy without releasing it.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn sync(&self, id: &SessionId) -> EngineResult<()> {
        let entry = {
            let staged = self.staged.read().await;
            staged.get(id).cloned()
        }
        .ok_or_else(|| EngineError::NoStagedFile {
            connection_id: id.to_string(),
        })?;

        self.upload(&entry).await
    }

    /// Uploads the local copy, then removes it and forgets the mapping.
    /// Unknown ids yield an empty report.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn release(&self, id: &SessionId) -> ReleaseReport {
        let entry = {
            let staged = self.staged.read().await;
            staged.get(id).cloned()
        };
        let Some(entry) = entry else {
            return ReleaseReport::default();
        };

        let sync_error = self.upload(&entry).await.err().map(|e| e.to_string());

        // Forgotten only once the upload settled, so an interrupted release can be retried
        {
            let mut staged = self.staged.write().await;
            staged.remove(id);
        }

        if sync_error.is_some() && !self.delete_local_on_failed_upload {
            warn!(local = %entry.local_path.display(), "Upload failed; keeping local copy");
            return ReleaseReport {
                sync_error,
                local_removed: false,
                retained_path: Some(entry.local_path),
            };
        }

        let local_removed = match std::fs::remove_file(&entry.local_path) {
            Ok(()) => true,
            Err(e) => {
                warn!(local = %entry.local_path.display(), error = %e, "Failed to remove staged copy");
                false
            }
        };

        ReleaseReport {
            sync_error,
            local_removed,
            retained_path: None,
        }
    }

    /// Drops a staged copy without uploading it.
    pub async fn discard(&self, id: &SessionId) {
        let entry = {
            let mut staged = self.staged.write().await;
            staged.remove(id)
        };
        if let Some(entry) = entry {
            debug!(local = %entry.local_path.display(), "Discarding staged copy");
            remove_quietly(&entry.local_path);
        }
    }

    pub async fn staged_path(&self, id: &SessionId) -> Option<PathBuf> {
        let staged = self.staged.read().await;
        staged.get(id).map(|entry| entry.local_path.clone())
    }

    pub async fn staged_ids(&self) -> Vec<SessionId> {
        let staged = self.staged.read().await;
        staged.keys().cloned().collect()
    }

    pub async fn staged_count(&self) -> usize {
        self.staged.read().await.len()
    }

    async fn upload(&self, entry: &StagedFile) -> EngineResult<()> {
        self.transport
            .upload(&entry.local_path, &entry.remote_path, &entry.ssh)
            .await
            .map_err(|e| {
                EngineError::staging_failed(format!(
                    "could not upload to {}: {}",
                    entry.remote_path, e
                ))
            })?;

        info!(remote = %entry.remote_path, "Synced staged SQLite file");
        Ok(())
    }

    fn ensure_temp_dir(&self) -> EngineResult<()> {
        std::fs::create_dir_all(&self.temp_dir).map_err(|e| {
            EngineError::staging_failed(format!(
                "cannot create {}: {}",
                self.temp_dir.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.temp_dir, std::fs::Permissions::from_mode(0o700));
        }

        Ok(())
    }

    fn unique_local_path(&self, id: &SessionId, remote_path: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let name = local_file_name(id.as_str(), timestamp, remote_path);
        let mut candidate = self.temp_dir.join(&name);
        let mut attempt = 1;
        while candidate.exists() {
            candidate = self.temp_dir.join(format!("{}-{}", attempt, name));
            attempt += 1;
        }
        candidate
    }
}

/// `{connection id}_{timestamp}_{basename}`, restricted to filename-safe characters.
fn local_file_name(id: &str, timestamp: i64, remote_path: &str) -> String {
    let basename = remote_path
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or(FALLBACK_BASENAME);

    format!("{}_{}_{}", sanitize(id), timestamp, sanitize(basename))
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{SshAuth, SshHostKeyPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Treats remote paths as local ones; uploads can be made to fail.
    #[derive(Default)]
    struct LocalCopyTransport {
        fail_uploads: AtomicBool,
    }

    #[async_trait]
    impl FileTransport for LocalCopyTransport {
        async fn download(
            &self,
            remote: &str,
            local: &Path,
            _ssh: &SshTunnelConfig,
        ) -> EngineResult<()> {
            tokio::fs::copy(remote, local)
                .await
                .map(|_| ())
                .map_err(|e| EngineError::ssh(e.to_string()))
        }

        async fn upload(
            &self,
            local: &Path,
            remote: &str,
            _ssh: &SshTunnelConfig,
        ) -> EngineResult<()> {
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(EngineError::ssh("connection reset"));
            }
            tokio::fs::copy(local, remote)
                .await
                .map(|_| ())
                .map_err(|e| EngineError::ssh(e.to_string()))
        }
    }

    fn remote_config(path: &Path) -> ConnectionConfig {
        let mut config = ConnectionConfig::sqlite(path.display().to_string());
        config.host = "files.internal".into();
        config.ssh_tunnel = Some(SshTunnelConfig {
            host: "files.internal".into(),
            port: 22,
            username: "deploy".into(),
            auth: SshAuth::Password {
                password: "pw".into(),
            },
            host_key_policy: SshHostKeyPolicy::AcceptNew,
            known_hosts_path: None,
            connect_timeout_secs: 5,
        });
        config
    }

    fn stager(dir: &Path, delete_on_failure: bool) -> (RemoteFileStager, Arc<LocalCopyTransport>) {
        let transport = Arc::new(LocalCopyTransport::default());
        let stager = RemoteFileStager::new(dir.join("staging"), transport.clone(), delete_on_failure);
        (stager, transport)
    }

    #[test]
    fn local_hosts_are_recognised() {
        for host in ["", "  ", "localhost", "LOCALHOST", "127.0.0.1", "::1"] {
            assert!(RemoteFileStager::is_local_host(host), "{host:?}");
        }
        assert!(!RemoteFileStager::is_local_host("10.0.0.5"));
        assert!(!RemoteFileStager::is_local_host("db.example.com"));
    }

    #[test]
    fn staging_requires_sqlite_ssh_and_remote_host() {
        let remote = remote_config(Path::new("/srv/app.db"));
        assert!(RemoteFileStager::needs_staging(&remote));

        let mut local = remote.clone();
        local.host = "localhost".into();
        assert!(!RemoteFileStager::needs_staging(&local));

        let mut no_ssh = remote.clone();
        no_ssh.ssh_tunnel = None;
        assert!(!RemoteFileStager::needs_staging(&no_ssh));

        let mut postgres = remote;
        postgres.protocol = Protocol::Postgresql;
        assert!(!RemoteFileStager::needs_staging(&postgres));
    }

    #[test]
    fn file_names_are_sanitised() {
        assert_eq!(
            local_file_name("conn-1", 1700000000000, "/srv/data/app.db"),
            "conn-1_1700000000000_app.db"
        );
        assert_eq!(
            local_file_name("../evil id", 5, "/srv/data/"),
            "_evil_id_5_data"
        );
        assert_eq!(local_file_name("x", 1, ""), "x_1_database.sqlite");
    }

    #[test]
    fn preflight_distinguishes_missing_from_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.db");
        assert!(matches!(
            RemoteFileStager::preflight(&missing),
            Err(EngineError::StagedFileMissing { .. })
        ));

        let present = dir.path().join("ok.db");
        std::fs::write(&present, b"").unwrap();
        assert!(RemoteFileStager::preflight(&present).is_ok());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let locked = dir.path().join("locked.db");
            std::fs::write(&locked, b"").unwrap();
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o400)).unwrap();
            // root ignores mode bits, so only assert when the open really fails
            if OpenOptions::new().write(true).open(&locked).is_err() {
                assert!(matches!(
                    RemoteFileStager::preflight(&locked),
                    Err(EngineError::StagedFilePermission { .. })
                ));
            }
        }
    }

    #[tokio::test]
    async fn stage_sync_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote.db");
        std::fs::write(&remote, b"v1").unwrap();
        let (stager, _) = stager(dir.path(), true);
        let id = SessionId::new("c1");

        let local = stager.stage(&id, &remote_config(&remote)).await.unwrap();
        assert!(local.starts_with(&stager.temp_dir));
        assert_eq!(std::fs::read(&local).unwrap(), b"v1");
        assert_eq!(stager.staged_path(&id).await, Some(local.clone()));

        std::fs::write(&local, b"v2").unwrap();
        stager.sync(&id).await.unwrap();
        assert_eq!(std::fs::read(&remote).unwrap(), b"v2");
        assert!(local.exists());

        std::fs::write(&local, b"v3").unwrap();
        let report = stager.release(&id).await;
        assert_eq!(report.sync_error, None);
        assert!(report.local_removed);
        assert!(!local.exists());
        assert_eq!(std::fs::read(&remote).unwrap(), b"v3");
        assert_eq!(stager.staged_count().await, 0);
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (stager, _) = stager(dir.path(), true);
        let id = SessionId::new("c2");

        let err = stager
            .stage(&id, &remote_config(&dir.path().join("absent.db")))
            .await
            .expect_err("remote file is missing");
        assert!(matches!(err, EngineError::StagingFailed { .. }));
        assert!(err.to_string().contains("absent.db"));
        assert_eq!(stager.staged_count().await, 0);
        assert_eq!(std::fs::read_dir(&stager.temp_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn sync_without_staged_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (stager, _) = stager(dir.path(), true);
        let err = stager.sync(&SessionId::new("ghost")).await.unwrap_err();
        assert!(err.to_string().contains("No remote file to sync"));
        assert_eq!(stager.release(&SessionId::new("ghost")).await, ReleaseReport::default());
    }

    #[tokio::test]
    async fn failed_upload_respects_delete_policy() {
        for delete_on_failure in [true, false] {
            let dir = tempfile::tempdir().unwrap();
            let remote = dir.path().join("remote.db");
            std::fs::write(&remote, b"v1").unwrap();
            let (stager, transport) = stager(dir.path(), delete_on_failure);
            let id = SessionId::new("c3");

            let local = stager.stage(&id, &remote_config(&remote)).await.unwrap();
            transport.fail_uploads.store(true, Ordering::SeqCst);

            assert!(stager.sync(&id).await.is_err());
            assert!(stager.staged_path(&id).await.is_some());

            let report = stager.release(&id).await;
            assert!(report.sync_error.unwrap().contains("connection reset"));
            assert_eq!(report.local_removed, delete_on_failure);
            assert_eq!(local.exists(), !delete_on_failure);
            assert_eq!(report.retained_path.is_some(), !delete_on_failure);
            assert_eq!(std::fs::read(&remote).unwrap(), b"v1");
        }
    }

    #[tokio::test]
    async fn discard_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote.db");
        std::fs::write(&remote, b"v1").unwrap();
        let (stager, _) = stager(dir.path(), true);
        let id = SessionId::new("c4");

        let local = stager.stage(&id, &remote_config(&remote)).await.unwrap();
        std::fs::write(&local, b"scratch").unwrap();
        stager.discard(&id).await;

        assert!(!local.exists());
        assert_eq!(std::fs::read(&remote).unwrap(), b"v1");
    }
}
