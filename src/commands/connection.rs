//! Connection Commands
//!
//! Commands for opening, closing and syncing broker connections.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::engine::types::{ConnectionConfig, Protocol, SessionId, SshAuth};
use crate::engine::{ErrorKind, SessionInfo};

/// `connect` arguments: the caller's id plus the connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub connection_id: String,
    #[serde(flatten)]
    pub config: ConnectionConfig,
}

/// Arguments for commands addressed to one connection
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub connection_id: String,
}

/// Response for connect
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub databases: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Response for disconnect
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_file_removed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retained_file: Option<String>,
}

/// Response for sync_sqlite
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

fn trim_opt(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn normalize_config(mut config: ConnectionConfig) -> Result<ConnectionConfig, String> {
    config.host = config.host.trim().to_string();
    config.username = config.username.trim().to_string();
    config.database = trim_opt(config.database.take());
    config.mongo_uri = trim_opt(config.mongo_uri.take());
    config.sqlite_file = trim_opt(config.sqlite_file.take());

    match config.protocol {
        Protocol::Sqlite => {}
        Protocol::Mongodb if config.mongo_uri.is_some() => {}
        protocol => {
            if config.host.is_empty() {
                return Err("Host is required".to_string());
            }
            if config.port == 0 {
                config.port = protocol.default_port();
            }
            if matches!(protocol, Protocol::Mysql | Protocol::Postgresql)
                && config.username.is_empty()
            {
                return Err("Username is required".to_string());
            }
        }
    }

    if let Some(ref mut ssh) = config.ssh_tunnel {
        if config.protocol != Protocol::Sqlite {
            return Err("SSH settings are only used for remote SQLite files".to_string());
        }

        let host = ssh.host.trim();
        // The SSH host doubles as the file host when none is given
        if config.host.is_empty() {
            config.host = host.to_string();
        }
        if host.is_empty() {
            return Err("SSH host is required".to_string());
        }
        ssh.host = host.to_string();

        let username = ssh.username.trim();
        if username.is_empty() {
            return Err("SSH username is required".to_string());
        }
        ssh.username = username.to_string();

        if ssh.port == 0 {
            return Err("SSH port must be greater than 0".to_string());
        }

        match &mut ssh.auth {
            SshAuth::Password { password } => {
                if password.trim().is_empty() {
                    return Err("SSH password is required".to_string());
                }
            }
            SshAuth::Key {
                private_key_path, ..
            } => {
                if private_key_path.trim().is_empty() {
                    return Err("SSH key path is required".to_string());
                }
            }
        }

        if config.sqlite_file.is_none() {
            return Err("SQLite file path is required".to_string());
        }
    }

    Ok(config)
}

/// Establishes a new database connection under the caller's id
#[instrument(
    skip(state, request),
    fields(
        connection_id = %request.connection_id,
        protocol = %request.config.protocol,
        host = %request.config.host,
        ssh = request.config.ssh_tunnel.is_some()
    )
)]
pub async fn connect(state: &crate::SharedState, request: ConnectRequest) -> ConnectResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    let config = match normalize_config(request.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            return ConnectResponse {
                success: false,
                databases: None,
                error: Some(e),
                error_kind: Some(ErrorKind::Query),
            };
        }
    };

    let id = SessionId::new(request.connection_id);
    match session_manager.connect(&id, config).await {
        Ok(databases) => ConnectResponse {
            success: true,
            databases: Some(databases),
            error: None,
            error_kind: None,
        },
        Err(e) => ConnectResponse {
            success: false,
            databases: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
        },
    }
}

/// Disconnects a session; unknown ids succeed
#[instrument(skip(state, request), fields(connection_id = %request.connection_id))]
pub async fn disconnect(state: &crate::SharedState, request: ConnectionRequest) -> DisconnectResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    match session_manager
        .disconnect(&SessionId::new(request.connection_id))
        .await
    {
        Ok(report) => DisconnectResponse {
            success: true,
            error: None,
            error_kind: None,
            local_file_removed: report
                .was_connected
                .then_some(report.local_file_removed),
            sync_error: report.sync_error,
            retained_file: report.retained_path.map(|p| p.display().to_string()),
        },
        Err(e) => DisconnectResponse {
            success: false,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
            sync_error: None,
            local_file_removed: None,
            retained_file: None,
        },
    }
}

/// Uploads a staged SQLite copy back to its remote host
#[instrument(skip(state, request), fields(connection_id = %request.connection_id))]
pub async fn sync_sqlite(state: &crate::SharedState, request: ConnectionRequest) -> SyncResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    match session_manager
        .sync(&SessionId::new(request.connection_id))
        .await
    {
        Ok(()) => SyncResponse {
            success: true,
            message: Some("SQLite file synced to remote host".to_string()),
            error: None,
            error_kind: None,
        },
        Err(e) => SyncResponse {
            success: false,
            message: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
        },
    }
}

/// Lists all active sessions
pub async fn list_sessions(state: &crate::SharedState) -> Vec<SessionInfo> {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    session_manager.list_sessions().await
}

/// Number of live connections
pub async fn connection_count(state: &crate::SharedState) -> usize {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    session_manager.session_count().await
}

/// Shutdown sweep: closes every live connection, syncing staged files
pub async fn close_all_connections(state: &crate::SharedState) -> usize {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    session_manager.close_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{SshHostKeyPolicy, SshTunnelConfig};

    fn ssh() -> SshTunnelConfig {
        SshTunnelConfig {
            host: " files.internal ".into(),
            port: 22,
            username: " deploy ".into(),
            auth: SshAuth::Key {
                private_key_path: "/home/deploy/.ssh/id_ed25519".into(),
                passphrase: None,
            },
            host_key_policy: SshHostKeyPolicy::AcceptNew,
            known_hosts_path: None,
            connect_timeout_secs: 15,
        }
    }

    #[test]
    fn network_protocols_need_a_host() {
        let config = ConnectionConfig::new(Protocol::Redis);
        assert_eq!(normalize_config(config).unwrap_err(), "Host is required");

        let mut config = ConnectionConfig::new(Protocol::Postgresql);
        config.host = "db".into();
        assert_eq!(normalize_config(config).unwrap_err(), "Username is required");
    }

    #[test]
    fn defaults_and_trimming_are_applied() {
        let mut config = ConnectionConfig::new(Protocol::Mysql);
        config.host = "  db.internal ".into();
        config.username = "app ".into();
        config.port = 0;
        config.database = Some("   ".into());

        let config = normalize_config(config).unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.username, "app");
        assert_eq!(config.port, 3306);
        assert_eq!(config.database, None);
    }

    #[test]
    fn mongo_uri_replaces_host() {
        let mut config = ConnectionConfig::new(Protocol::Mongodb);
        config.mongo_uri = Some("mongodb://localhost:27017".into());
        assert!(normalize_config(config).is_ok());
    }

    #[test]
    fn remote_sqlite_takes_host_from_ssh() {
        let mut config = ConnectionConfig::sqlite("/srv/app.db");
        config.ssh_tunnel = Some(ssh());

        let config = normalize_config(config).unwrap();
        assert_eq!(config.host, "files.internal");
        let ssh = config.ssh_tunnel.unwrap();
        assert_eq!(ssh.host, "files.internal");
        assert_eq!(ssh.username, "deploy");
    }

    #[test]
    fn ssh_is_rejected_for_network_protocols() {
        let mut config = ConnectionConfig::new(Protocol::Redis);
        config.host = "cache".into();
        config.ssh_tunnel = Some(ssh());
        assert!(normalize_config(config).is_err());
    }

    #[test]
    fn connect_request_flattens_config() {
        let request: ConnectRequest = serde_json::from_str(
            r#"{"connectionId":"c1","protocol":"postgresql","host":"db","port":5432,
                "username":"app","password":"pw","database":"shop","sslEnabled":true}"#,
        )
        .unwrap();
        assert_eq!(request.connection_id, "c1");
        assert_eq!(request.config.protocol, Protocol::Postgresql);
        assert!(request.config.ssl);
        assert_eq!(request.config.password, "pw");
    }
}
