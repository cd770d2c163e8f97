//! SFTP backend for dropsync's [`RemoteStore`].

mod ssh_client;
mod utils;

use crate::utils::{create_dir_all, is_status, join_remote, remove_dir_all};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dropsync_core::{EntryKind, LocalContent, RelPath, RemoteEntry, RemoteError, RemoteStore};
use russh::client::{AuthResult, Handle};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use ssh_client::HostKeyCheck;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct SftpRemote {
    sftp: SftpSession,
    base: String,
    // keeps the SSH connection open for the lifetime of the SFTP channel
    _session: Handle<HostKeyCheck>,
}

impl SftpRemote {
    /// Opens an SFTP session and makes sure the base directory exists.
    pub async fn connect(
        host_with_port: &str,
        user: &str,
        password: Option<&str>,
        allowed_fingerprints: Option<Vec<String>>,
        base: &str,
    ) -> Result<Self> {
        let (host, port) = match host_with_port.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| anyhow!("invalid port in host: {host_with_port}"))?;
                (h.to_string(), port)
            }
            None => (host_with_port.to_string(), 22u16),
        };

        let config = russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let check = HostKeyCheck {
            allowed: allowed_fingerprints,
        };
        let mut session = russh::client::connect(Arc::new(config), (host.as_str(), port), check)
            .await
            .with_context(|| format!("connect to {host}:{port}"))?;
        let res = session
            .authenticate_password(user, password.unwrap_or(""))
            .await?;
        if let AuthResult::Failure {
            remaining_methods,
            partial_success,
        } = res
        {
            return Err(anyhow!(
                "authentication failed for {user}@{host}, remaining methods: {:?}, partial success: {}",
                remaining_methods,
                partial_success
            ));
        }
        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        create_dir_all(&sftp, base)
            .await
            .with_context(|| format!("prepare remote base {base}"))?;
        info!(%host, port, base, cwd = ?sftp.canonicalize(".").await.ok(), "sftp session ready");
        Ok(Self {
            sftp,
            base: base.to_string(),
            _session: session,
        })
    }

    fn full(&self, path: &RelPath) -> String {
        join_remote(&self.base, path.as_str())
    }

    /// Whether anything is at `full`. Used to tell "already exists" apart from other refusals.
    async fn occupied(&self, full: &str) -> bool {
        self.sftp.symlink_metadata(full).await.is_ok()
    }
}

#[async_trait]
impl RemoteStore for SftpRemote {
    async fn make_dir(&self, path: &RelPath) -> Result<(), RemoteError> {
        let full = self.full(path);
        match self.sftp.create_dir(full.as_str()).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::Failure) && self.occupied(&full).await => {
                Err(RemoteError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(to_remote_error(path, e)),
        }
    }

    async fn remove_dir(&self, path: &RelPath) -> Result<(), RemoteError> {
        remove_dir_all(&self.sftp, &self.full(path))
            .await
            .map_err(|e| to_remote_error(path, e))
    }

    async fn store(&self, path: &RelPath, content: &mut LocalContent) -> Result<(), RemoteError> {
        let full = self.full(path);
        let mut remote_file = self
            .sftp
            .create(full)
            .await
            .map_err(|e| to_remote_error(path, e))?;
        let sent = tokio::io::copy(&mut content.file, &mut remote_file)
            .await
            .map_err(|e| RemoteError::Transport(format!("{path}: {e}")))?;
        remote_file
            .shutdown()
            .await
            .map_err(|e| RemoteError::Transport(format!("{path}: {e}")))?;
        debug!(path = %path, bytes = sent, "stored");
        Ok(())
    }

    async fn delete(&self, path: &RelPath) -> Result<(), RemoteError> {
        self.sftp
            .remove_file(self.full(path))
            .await
            .map_err(|e| to_remote_error(path, e))
    }

    async fn rename(&self, from: &RelPath, to: &RelPath) -> Result<(), RemoteError> {
        let target = self.full(to);
        match self.sftp.rename(self.full(from), target.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::Failure) && self.occupied(&target).await => {
                Err(RemoteError::AlreadyExists(to.to_string()))
            }
            Err(e) => Err(to_remote_error(from, e)),
        }
    }

    async fn stat(&self, path: &RelPath) -> Result<Option<RemoteEntry>, RemoteError> {
        match self.sftp.symlink_metadata(self.full(path)).await {
            Ok(attrs) => Ok(Some(entry(path.clone(), &attrs))),
            Err(e) if is_status(&e, StatusCode::NoSuchFile) => Ok(None),
            Err(e) => Err(to_remote_error(path, e)),
        }
    }

    async fn list_tree(&self) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut out = Vec::new();
        // depth-first, parents emitted before their children
        let mut stack: Vec<Option<RelPath>> = vec![None];
        while let Some(dir) = stack.pop() {
            let full = match &dir {
                Some(rel) => self.full(rel),
                None => self.base.clone(),
            };
            let listing = self.sftp.read_dir(full.as_str()).await.map_err(|e| match &dir {
                Some(rel) => to_remote_error(rel, e),
                None => classify(&self.base, e),
            })?;
            let mut children: Vec<RelPath> = Vec::new();
            for item in listing {
                let name = item.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let joined = match &dir {
                    Some(parent) => parent.join(&name),
                    None => RelPath::new(name.as_str()),
                };
                let rel = match joined {
                    Ok(rel) => rel,
                    Err(e) => {
                        warn!(dir = %full, name = %name, error = %e, "skipping remote entry");
                        continue;
                    }
                };
                let attrs = item.metadata();
                if attrs.is_symlink() {
                    debug!(path = %rel, "skipping remote symlink");
                    continue;
                }
                if attrs.is_dir() {
                    children.push(rel.clone());
                }
                out.push(entry(rel, &attrs));
            }
            // reversed so the stack pops them in listing order
            stack.extend(children.into_iter().rev().map(Some));
        }
        Ok(out)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.sftp
            .metadata(self.base.as_str())
            .await
            .map(|_| ())
            .map_err(|e| classify(&self.base, e))
    }
}

fn entry(path: RelPath, attrs: &FileAttributes) -> RemoteEntry {
    let kind = if attrs.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    RemoteEntry {
        path,
        size: if kind.is_dir() { 0 } else { attrs.len() },
        kind,
        modified: attrs.mtime.map(u64::from),
        hash: None,
    }
}

fn to_remote_error(path: &RelPath, e: SftpError) -> RemoteError {
    classify(path.as_str(), e)
}

fn classify(path: &str, e: SftpError) -> RemoteError {
    match e {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => RemoteError::NotFound(path.to_string()),
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                RemoteError::Transport(format!("{path}: {}", status.error_message))
            }
            _ => RemoteError::Rejected(format!("{path}: {}", status.error_message)),
        },
        SftpError::IO(msg) => RemoteError::Transport(format!("{path}: {msg}")),
        SftpError::Timeout => RemoteError::Transport(format!("{path}: timed out")),
        other => RemoteError::Rejected(format!("{path}: {other}")),
    }
}
