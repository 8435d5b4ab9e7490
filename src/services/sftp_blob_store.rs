//! SFTP-backed blob store.
//!
//! Each operation dials the SSH server, authenticates with a password, opens
//! the `sftp` subsystem and verifies the configured root is a reachable
//! directory. Establishment is bounded by `connect_timeout`; transfers are
//! not bounded here.

use crate::services::blob_store::{
    BlobError, BlobReader, BlobSource, BlobStore, normalize_root, parent_dir,
};
use async_trait::async_trait;
use russh::{Disconnect, client};
use russh_keys::key::PublicKey;
use russh_sftp::{
    client::{SftpSession, error::Error as SftpError, fs::File},
    protocol::StatusCode,
};
use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

/// Connection parameters for the SFTP server.
#[derive(Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub root: String,
    pub connect_timeout: Duration,
    /// Expected SHA-256 host key fingerprint. Any key is accepted when unset.
    pub host_key_fingerprint: Option<String>,
}

impl std::fmt::Debug for SftpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("root", &self.root)
            .field("connect_timeout", &self.connect_timeout)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

pub struct SftpBlobStore {
    settings: SftpSettings,
    root: String,
}

/// Client-side SSH handler; only decides whether to trust the host key.
struct HostKeyCheck {
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.expected {
            Some(expected) => {
                let actual = server_public_key.fingerprint();
                if actual.trim_start_matches("SHA256:") == expected.trim_start_matches("SHA256:") {
                    Ok(true)
                } else {
                    warn!(%actual, "SFTP host key fingerprint mismatch");
                    Ok(false)
                }
            }
            None => Ok(true),
        }
    }
}

/// One authenticated SFTP session.
pub struct SftpConnection {
    handle: client::Handle<HostKeyCheck>,
    sftp: SftpSession,
}

impl SftpConnection {
    /// Close the SFTP channel and the SSH connection. Failures are only logged.
    async fn close(self) {
        if let Err(err) = self.sftp.close().await {
            debug!("closing sftp session failed: {}", err);
        }
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("ssh disconnect failed: {}", err);
        }
    }
}

/// Reader that owns the session it reads through.
struct SessionReader {
    file: Pin<Box<File>>,
    _session: Box<SftpConnection>,
    path: String,
}

impl AsyncRead for SessionReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.file.as_mut().poll_read(cx, buf)
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        // Dropping the handle ends the SSH session task.
        debug!(path = %self.path, "releasing sftp session after read");
    }
}

impl SftpBlobStore {
    pub fn new(settings: SftpSettings) -> Self {
        let root = normalize_root(&settings.root);
        Self { settings, root }
    }

    /// Establish a fresh session, bounded by the connect timeout.
    ///
    /// A timeout and a handshake failure both surface as
    /// [`BlobError::Connection`]; they are told apart in the logs.
    pub async fn connect(&self) -> Result<SftpConnection, BlobError> {
        let limit = self.settings.connect_timeout;
        match tokio::time::timeout(limit, self.establish()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                warn!(
                    host = %self.settings.host,
                    port = self.settings.port,
                    error = %err,
                    "SFTP connection failed"
                );
                Err(err)
            }
            Err(_) => {
                warn!(
                    host = %self.settings.host,
                    port = self.settings.port,
                    timeout = ?limit,
                    "SFTP connection timed out"
                );
                Err(BlobError::Connection(format!(
                    "connection establishment timed out after {:?}",
                    limit
                )))
            }
        }
    }

    async fn establish(&self) -> Result<SftpConnection, BlobError> {
        let settings = &self.settings;
        debug!("connecting to SFTP server at {}@{}:{}", settings.user, settings.host, settings.port);

        let config = Arc::new(client::Config::default());
        let handler = HostKeyCheck {
            expected: settings.host_key_fingerprint.clone(),
        };
        let mut handle = client::connect(config, (settings.host.as_str(), settings.port), handler)
            .await
            .map_err(|err| BlobError::Connection(err.to_string()))?;

        let authenticated = handle
            .authenticate_password(settings.user.clone(), settings.password.clone())
            .await
            .map_err(|err| BlobError::Connection(err.to_string()))?;
        if !authenticated {
            return Err(BlobError::Connection("authentication rejected".into()));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|err| BlobError::Connection(err.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| BlobError::Connection(err.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|err| BlobError::Connection(err.to_string()))?;

        let conn = SftpConnection { handle, sftp };
        match conn.sftp.metadata(self.root.as_str()).await {
            Ok(attrs) if attrs.is_dir() => Ok(conn),
            Ok(_) => {
                conn.close().await;
                Err(BlobError::Connection(format!(
                    "root `{}` is not a directory",
                    self.root
                )))
            }
            Err(err) => {
                conn.close().await;
                Err(BlobError::Connection(format!(
                    "failed to access root `{}`: {}",
                    self.root, err
                )))
            }
        }
    }

    /// Recursively create `dir` and its missing ancestors.
    async fn create_dir_all(&self, sftp: &SftpSession, dir: &str) -> Result<(), BlobError> {
        for current in ancestor_dirs(dir) {
            match sftp.metadata(current.as_str()).await {
                Ok(attrs) if attrs.is_dir() => {}
                Ok(_) => return Err(not_a_directory(dir, &current)),
                Err(err) if is_not_found(&err) => {
                    sftp.create_dir(current.as_str())
                        .await
                        .map_err(|err| BlobError::Write {
                            path: dir.to_string(),
                            reason: format!("failed to create directory {current}: {err}"),
                        })?;
                }
                Err(err) => {
                    return Err(BlobError::Write {
                        path: dir.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn put_with(
        &self,
        sftp: &SftpSession,
        source: BlobSource<'_>,
        remote_path: &str,
    ) -> Result<u64, BlobError> {
        let write_err = |reason: String| BlobError::Write {
            path: remote_path.to_string(),
            reason,
        };

        let parent = parent_dir(remote_path);
        match sftp.metadata(parent).await {
            Ok(attrs) if attrs.is_dir() => {}
            Ok(_) => return Err(not_a_directory(remote_path, parent)),
            Err(err) if is_not_found(&err) => {
                debug!("directory {} not found, creating it", parent);
                self.create_dir_all(sftp, parent).await?;
            }
            Err(err) => return Err(write_err(err.to_string())),
        }

        let mut file = Box::pin(
            sftp.create(remote_path)
                .await
                .map_err(|err| write_err(format!("failed to create remote file: {err}")))?,
        );
        let written = tokio::io::copy(source, &mut file)
            .await
            .map_err(|err| write_err(format!("failed to copy file contents: {err}")))?;
        file.shutdown()
            .await
            .map_err(|err| write_err(format!("failed to close remote file: {err}")))?;

        Ok(written)
    }
}

#[async_trait]
impl BlobStore for SftpBlobStore {
    fn root(&self) -> &str {
        &self.root
    }

    async fn check(&self) -> Result<(), BlobError> {
        self.connect().await?.close().await;
        Ok(())
    }

    async fn put(&self, source: BlobSource<'_>, remote_path: &str) -> Result<u64, BlobError> {
        let conn = self.connect().await?;
        let result = self.put_with(&conn.sftp, source, remote_path).await;
        conn.close().await;

        if let Ok(written) = &result {
            info!("uploaded {} bytes to {}", written, remote_path);
        }
        result
    }

    async fn get(&self, remote_path: &str) -> Result<BlobReader, BlobError> {
        let conn = self.connect().await?;
        match conn.sftp.open(remote_path).await {
            Ok(file) => Ok(Box::pin(SessionReader {
                file: Box::pin(file),
                _session: Box::new(conn),
                path: remote_path.to_string(),
            })),
            Err(err) => {
                conn.close().await;
                Err(open_error(remote_path, &err))
            }
        }
    }

    async fn delete(&self, remote_path: &str) -> Result<(), BlobError> {
        let conn = self.connect().await?;
        let result = conn
            .sftp
            .remove_file(remote_path)
            .await
            .map_err(|err| BlobError::Delete {
                path: remote_path.to_string(),
                reason: err.to_string(),
            });
        conn.close().await;
        result
    }
}

fn is_not_found(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
fn ancestor_dirs(dir: &str) -> Vec<String> {
    let mut current = String::new();
    dir.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            current.push('/');
            current.push_str(segment);
            current.clone()
        })
        .collect()
}

fn not_a_directory(path: &str, existing: &str) -> BlobError {
    BlobError::Write {
        path: path.to_string(),
        reason: format!("path exists but is not a directory: {existing}"),
    }
}

fn open_error(remote_path: &str, err: &SftpError) -> BlobError {
    if is_not_found(err) {
        BlobError::NotFound(remote_path.to_string())
    } else {
        BlobError::Read {
            path: remote_path.to_string(),
            reason: err.to_string(),
        }
    }
}
