//! Session Manager
//!
//! Centralized management of all active database sessions.
//! This is the SINGLE SOURCE OF TRUTH for which connection ids are live, which
//! adapter serves them and whether a staged file backs them.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{info, instrument, warn};

use crate::config::BrokerConfig;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::stager::RemoteFileStager;
use crate::engine::traits::DataEngine;
use crate::engine::types::{ConnectionConfig, Protocol, SessionId};
use crate::engine::DriverRegistry;

/// Active session and the lock that serialises commands on it
pub struct ActiveSession {
    pub protocol: Protocol,
    pub config: ConnectionConfig,
    pub display_name: String,
    pub staged: bool,
    lock: Arc<Mutex<()>>,
}

/// Public view of a live session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub display_name: String,
    pub protocol: Protocol,
}

/// Exclusive access to one session's adapter for the duration of a command
pub struct SessionLease {
    id: SessionId,
    protocol: Protocol,
    driver: Arc<dyn DataEngine>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn driver(&self) -> &dyn DataEngine {
        self.driver.as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    pub was_connected: bool,
    pub sync_error: Option<String>,
    pub local_file_removed: bool,
    pub retained_path: Option<PathBuf>,
}

/// Holds an id while a connect or disconnect is working on it.
struct Reservation<'a> {
    pending: &'a StdMutex<HashSet<SessionId>>,
    id: SessionId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&self.id);
    }
}

/// Manages all active database sessions
pub struct SessionManager {
    registry: Arc<DriverRegistry>,
    stager: Arc<RemoteFileStager>,
    sessions: RwLock<HashMap<SessionId, ActiveSession>>,
    pending: StdMutex<HashSet<SessionId>>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        registry: Arc<DriverRegistry>,
        stager: Arc<RemoteFileStager>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            registry,
            stager,
            sessions: RwLock::new(HashMap::new()),
            pending: StdMutex::new(HashSet::new()),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        }
    }

    pub fn stager(&self) -> &RemoteFileStager {
        &self.stager
    }

    /// Opens a session under `id` and returns the backend's namespace names
    #[instrument(
        skip(self, config),
        fields(
            connection_id = %id,
            protocol = %config.protocol,
            host = %config.host,
            port = config.port,
            database = ?config.database,
            ssh = config.ssh_tunnel.is_some()
        )
    )]
    pub async fn connect(&self, id: &SessionId, config: ConnectionConfig) -> EngineResult<Vec<String>> {
        let driver = self
            .registry
            .get(config.protocol)
            .ok_or_else(|| EngineError::driver_not_found(config.protocol.as_str()))?;

        let reservation = self.reserve(id).await?;

        let staged = RemoteFileStager::needs_staging(&config);
        let effective_config = if staged {
            let local = self.stager.stage(id, &config).await?;
            let mut local_config = config.clone();
            local_config.host = String::new();
            local_config.ssh_tunnel = None;
            local_config.sqlite_file = Some(local.display().to_string());
            local_config
        } else {
            config.clone()
        };

        let open = async {
            driver.connect(id, &effective_config).await?;
            driver.list_namespaces(id).await
        };

        let namespaces = match timeout(self.connect_timeout, open).await {
            Ok(Ok(namespaces)) => namespaces,
            outcome => {
                let err = match outcome {
                    Ok(Err(e)) => e,
                    _ => EngineError::Timeout {
                        timeout_ms: self.connect_timeout.as_millis() as u64,
                    },
                };
                // Leave nothing half-open behind
                let _ = driver.disconnect(id).await;
                if staged {
                    self.stager.discard(id).await;
                }
                return Err(err);
            }
        };

        let session = ActiveSession {
            protocol: config.protocol,
            display_name: display_name(&config, staged),
            config,
            staged,
            lock: Arc::new(Mutex::new(())),
        };

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id.clone(), session);
            // Released under the write lock so the id is never both free and unregistered
            drop(reservation);
        }

        info!(driver = driver.driver_name(), namespaces = namespaces.len(), "Session opened");
        Ok(namespaces.into_iter().map(|ns| ns.database).collect())
    }

    /// Closes a session. Unknown ids succeed with an empty report.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn disconnect(&self, id: &SessionId) -> EngineResult<DisconnectReport> {
        // The id stays claimed until the adapter is closed and the staged copy
        // uploaded, so a reconnect cannot slip in between.
        let (session, _claim) = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.remove(id) else {
                return Ok(DisconnectReport::default());
            };
            (session, self.claim(id))
        };

        // Wait for any in-flight command on this id
        let _guard = session.lock.clone().lock_owned().await;

        match self.registry.get(session.protocol) {
            Some(driver) => {
                if let Err(e) = driver.disconnect(id).await {
                    warn!(error = %e, "Adapter close failed");
                }
            }
            None => warn!(protocol = %session.protocol, "No adapter to close session"),
        }

        let mut report = DisconnectReport {
            was_connected: true,
            ..DisconnectReport::default()
        };

        if session.staged {
            let release = self.stager.release(id).await;
            if let Some(ref e) = release.sync_error {
                warn!(error = %e, "Final upload failed");
            }
            report.sync_error = release.sync_error;
            report.local_file_removed = release.local_removed;
            report.retained_path = release.retained_path;
        }

        info!("Session closed");
        Ok(report)
    }

    /// Acquires exclusive use of a live session
    pub async fn lease(&self, id: &SessionId) -> EngineResult<SessionLease> {
        let (protocol, lock) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(id)
                .ok_or_else(|| EngineError::not_connected(id.as_str()))?;
            (session.protocol, session.lock.clone())
        };

        let guard = lock.clone().lock_owned().await;

        // The session may have been closed, or replaced, while we waited
        let still_live = {
            let sessions = self.sessions.read().await;
            sessions
                .get(id)
                .is_some_and(|session| Arc::ptr_eq(&session.lock, &lock))
        };
        if !still_live {
            return Err(EngineError::not_connected(id.as_str()));
        }

        let driver = self
            .registry
            .get(protocol)
            .ok_or_else(|| EngineError::driver_not_found(protocol.as_str()))?;

        Ok(SessionLease {
            id: id.clone(),
            protocol,
            driver,
            _guard: guard,
        })
    }

    /// Runs a command future under the command timeout
    pub async fn bounded<T, F>(&self, command: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        match timeout(self.command_timeout, command).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }

    /// Uploads the staged copy behind `id` without closing the session
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn sync(&self, id: &SessionId) -> EngineResult<()> {
        // Hold the lease so no statement lands mid-upload
        let _lease = self.lease(id).await.ok();
        self.stager.sync(id).await
    }

    /// Disconnects every session; individual failures are logged and skipped.
    /// Returns the number of sessions closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        let mut closed = 0;
        for id in ids {
            match self.disconnect(&id).await {
                Ok(report) => {
                    if report.was_connected {
                        closed += 1;
                    }
                }
                Err(e) => warn!(connection_id = %id, error = %e, "Failed to close session"),
            }
        }

        self.release_orphaned_copies().await;

        info!(closed, "Closed all sessions");
        closed
    }

    /// Uploads and removes staged copies left behind by an interrupted disconnect.
    async fn release_orphaned_copies(&self) {
        let staged = self.stager.staged_ids().await;
        if staged.is_empty() {
            return;
        }

        let orphans: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            staged
                .into_iter()
                .filter(|id| !sessions.contains_key(id))
                .collect()
        };

        for id in orphans {
            // Skip ids a connect or disconnect is still working on
            let Some(_claim) = self.claim(&id) else {
                continue;
            };
            let report = self.stager.release(&id).await;
            match report.sync_error {
                Some(e) => warn!(connection_id = %id, error = %e, "Orphaned staged copy failed to upload"),
                None => info!(connection_id = %id, "Released orphaned staged copy"),
            }
        }
    }

    /// Lists all active sessions
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, session)| SessionInfo {
                id: id.clone(),
                display_name: session.display_name.clone(),
                protocol: session.protocol,
            })
            .collect();
        list.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        list
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Claims a free id for a connect
    async fn reserve(&self, id: &SessionId) -> EngineResult<Reservation<'_>> {
        let sessions = self.sessions.read().await;
        let reservation = if sessions.contains_key(id) {
            None
        } else {
            self.claim(id)
        };

        reservation.ok_or_else(|| {
            warn!(connection_id = %id, "Connection id already in use");
            EngineError::ConnectionIdInUse {
                connection_id: id.to_string(),
            }
        })
    }

    fn claim(&self, id: &SessionId) -> Option<Reservation<'_>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(id.clone()).then(|| Reservation {
            pending: &self.pending,
            id: id.clone(),
        })
    }
}

fn display_name(config: &ConnectionConfig, staged: bool) -> String {
    match config.protocol {
        Protocol::Sqlite => {
            let file = config.sqlite_file.as_deref().unwrap_or(":memory:");
            if staged {
                format!("{}:{} (SFTP)", config.host, file)
            } else {
                file.to_string()
            }
        }
        _ => format!(
            "{}@{}:{}/{}",
            config.username,
            config.host,
            config.port,
            config.database.as_deref().unwrap_or("default"),
        ),
    }
}
