//! File Transport
//!
//! SSH-authenticated file copy between a local path and a remote path.
//! `SftpTransport` drives libssh2 on the blocking pool; tests plug in their own
//! `FileTransport` to stage files without a server.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{SshAuth, SshHostKeyPolicy, SshTunnelConfig};

// libssh2 SFTP status codes
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

const COPY_CHUNK: usize = 64 * 1024;

/// Moves whole files to and from a remote host.
#[async_trait]
pub trait FileTransport: Send + Sync {
    /// Copies `remote` on the SSH host to `local`.
    async fn download(&self, remote: &str, local: &Path, ssh: &SshTunnelConfig)
        -> EngineResult<()>;

    /// Copies `local` to `remote` on the SSH host, replacing it.
    async fn upload(&self, local: &Path, remote: &str, ssh: &SshTunnelConfig) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Download,
    Upload,
}

/// SFTP transport backed by `ssh2`.
#[derive(Debug, Clone)]
pub struct SftpTransport {
    transfer_timeout: Duration,
}

impl SftpTransport {
    pub fn new(transfer_timeout: Duration) -> Self {
        Self { transfer_timeout }
    }

    async fn transfer(
        &self,
        direction: Direction,
        local: &Path,
        remote: &str,
        ssh: &SshTunnelConfig,
    ) -> EngineResult<()> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let ssh = ssh.clone();
        let known_hosts = ssh
            .known_hosts_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(default_known_hosts_path);

        // The blocking copy outlives a timeout; it stops at the next chunk once cancelled
        let cancel = CancelOnDrop::default();
        let flag = Arc::clone(&cancel.0);

        let task = tokio::task::spawn_blocking(move || {
            let guard = SshSessionGuard::open(&ssh, known_hosts.as_deref())?;
            let sftp = guard
                .session
                .sftp()
                .map_err(|e| EngineError::ssh(format!("Failed to open SFTP channel: {}", e)))?;

            match direction {
                Direction::Download => copy_from_remote(&sftp, &remote, &local, &flag),
                Direction::Upload => copy_to_remote(&sftp, &local, &remote, &flag),
            }
        });

        match timeout(self.transfer_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::ssh(format!(
                "Transfer task failed: {}",
                join_err
            ))),
            Err(_) => Err(EngineError::Timeout {
                timeout_ms: self.transfer_timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl FileTransport for SftpTransport {
    #[instrument(skip(self, ssh), fields(ssh_host = %ssh.host), err)]
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        ssh: &SshTunnelConfig,
    ) -> EngineResult<()> {
        self.transfer(Direction::Download, local, remote, ssh).await
    }

    #[instrument(skip(self, ssh), fields(ssh_host = %ssh.host), err)]
    async fn upload(&self, local: &Path, remote: &str, ssh: &SshTunnelConfig) -> EngineResult<()> {
        self.transfer(Direction::Upload, local, remote, ssh).await
    }
}

/// Authenticated SSH session, disconnected on drop.
struct SshSessionGuard {
    session: Session,
}

impl SshSessionGuard {
    fn open(config: &SshTunnelConfig, known_hosts: Option<&Path>) -> EngineResult<Self> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| EngineError::ssh(format!("Cannot resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| EngineError::ssh(format!("Cannot resolve {}", config.host)))?;

        let connect_timeout = Duration::from_secs(u64::from(config.connect_timeout_secs));
        let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
            EngineError::ssh(format!(
                "Failed to reach {}:{}: {}",
                config.host, config.port, e
            ))
        })?;

        let mut session =
            Session::new().map_err(|e| EngineError::ssh(format!("libssh2 init failed: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| EngineError::ssh(format!("SSH handshake failed: {}", e)))?;

        // From here on the guard owns the session, so early returns disconnect it
        let guard = Self { session };
        guard.verify_host_key(config, known_hosts)?;
        guard.authenticate(config)?;
        Ok(guard)
    }

    fn verify_host_key(
        &self,
        config: &SshTunnelConfig,
        known_hosts: Option<&Path>,
    ) -> EngineResult<()> {
        if config.host_key_policy == SshHostKeyPolicy::InsecureNoCheck {
            warn!(host = %config.host, "SSH host key verification disabled");
            return Ok(());
        }

        let (key, key_type) = self
            .session
            .host_key()
            .ok_or_else(|| EngineError::ssh("Server did not present a host key"))?;

        let mut known = self
            .session
            .known_hosts()
            .map_err(|e| EngineError::ssh(e.to_string()))?;

        if let Some(path) = known_hosts.filter(|p| p.exists()) {
            known
                .read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|e| EngineError::ssh(format!("Cannot read {}: {}", path.display(), e)))?;
        }

        match known.check_port(&config.host, config.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(EngineError::ssh(format!(
                "Host key for {} does not match known_hosts",
                config.host
            ))),
            CheckResult::NotFound | CheckResult::Failure => match config.host_key_policy {
                SshHostKeyPolicy::Strict => Err(EngineError::ssh(format!(
                    "Host key for {} is not in known_hosts",
                    config.host
                ))),
                _ => {
                    let Some(path) = known_hosts else {
                        return Ok(());
                    };
                    let entry = if config.port == 22 {
                        config.host.clone()
                    } else {
                        format!("[{}]:{}", config.host, config.port)
                    };
                    known
                        .add(&entry, key, "added by qoredb-broker", key_type.into())
                        .map_err(|e| EngineError::ssh(e.to_string()))?;
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    known
                        .write_file(path, KnownHostFileKind::OpenSSH)
                        .map_err(|e| EngineError::ssh(e.to_string()))?;
                    debug!(host = %entry, "Recorded new SSH host key");
                    Ok(())
                }
            },
        }
    }

    fn authenticate(&self, config: &SshTunnelConfig) -> EngineResult<()> {
        let result = match &config.auth {
            SshAuth::Password { password } => {
                self.session.userauth_password(&config.username, password)
            }
            SshAuth::Key {
                private_key_path,
                passphrase,
            } => self.session.userauth_pubkey_file(
                &config.username,
                None,
                Path::new(private_key_path),
                passphrase.as_deref(),
            ),
        };

        result.map_err(|e| EngineError::ssh(format!("SSH authentication failed: {}", e)))?;

        if !self.session.authenticated() {
            return Err(EngineError::ssh("SSH authentication failed"));
        }
        Ok(())
    }
}

impl Drop for SshSessionGuard {
    fn drop(&mut self) {
        let _ = self.session.disconnect(None, "transfer complete", None);
    }
}

/// Set when the waiting side gives up on a transfer
#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn copy_chunked(source: &mut impl Read, target: &mut impl Write, cancel: &AtomicBool) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
        }
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        target.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Writes `source` to a new local file; a failed or cancelled copy leaves no file behind.
fn write_local(source: &mut impl Read, local: &Path, cancel: &AtomicBool) -> EngineResult<u64> {
    let mut target = File::create(local).map_err(|e| {
        EngineError::staging_failed(format!("Cannot create {}: {}", local.display(), e))
    })?;

    let result = copy_chunked(source, &mut target, cancel)
        .and_then(|bytes| target.sync_all().map(|()| bytes));

    result.map_err(|e| {
        drop(target);
        let _ = std::fs::remove_file(local);
        EngineError::ssh(format!("Download to {} interrupted: {}", local.display(), e))
    })
}

fn copy_from_remote(sftp: &Sftp, remote: &str, local: &Path, cancel: &AtomicBool) -> EngineResult<()> {
    let mut source = sftp
        .open(Path::new(remote))
        .map_err(|e| sftp_error(remote, e))?;

    let bytes = write_local(&mut source, local, cancel)?;

    debug!(remote, bytes, "Downloaded remote file");
    Ok(())
}

fn copy_to_remote(sftp: &Sftp, local: &Path, remote: &str, cancel: &AtomicBool) -> EngineResult<()> {
    let mut source = File::open(local).map_err(|e| {
        EngineError::staging_failed(format!("Cannot open {}: {}", local.display(), e))
    })?;
    let mut target = sftp
        .create(Path::new(remote))
        .map_err(|e| sftp_error(remote, e))?;

    let bytes = copy_chunked(&mut source, &mut target, cancel)
        .map_err(|e| EngineError::ssh(format!("Upload to {} interrupted: {}", remote, e)))?;
    target
        .fsync()
        .or_else(|_| target.close())
        .map_err(|e| EngineError::ssh(format!("Failed to flush {}: {}", remote, e)))?;

    debug!(remote, bytes, "Uploaded local file");
    Ok(())
}

fn sftp_error(remote: &str, err: ssh2::Error) -> EngineError {
    match err.code() {
        ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => {
            EngineError::ssh(format!("Remote file not found: {}", remote))
        }
        ssh2::ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => EngineError::ssh(format!(
            "Permission denied for {}. Check that the SSH user can read and write it",
            remote
        )),
        _ => EngineError::ssh(format!("SFTP error on {}: {}", remote, err)),
    }
}

fn default_known_hosts_path() -> Option<PathBuf> {
    crate::config::broker_home().map(|home| home.join("known_hosts"))
}
