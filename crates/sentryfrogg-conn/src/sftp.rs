use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::{json, Value};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OwnedMutexGuard;

use crate::resolver::ResolveCtx;
use crate::ssh::{ClientHandler, SshManager, SshSession};
use std::sync::Arc;

// ── SFTP ─────────────────────────────────────────────────────────
//
// Each operation opens a fresh sftp channel on the pooled SSH session
// while holding the session's busy lock, so transfers queue behind
// exec calls for the same profile instead of multiplexing.

type BusyGuard = OwnedMutexGuard<russh::client::Handle<ClientHandler>>;

async fn open_sftp(guard: &BusyGuard) -> ToolResult<SftpSession> {
    let mut channel = guard
        .channel_open_session()
        .await
        .map_err(|e| ToolError::retryable(format!("failed to open sftp channel: {e}")).with_code("ssh_channel"))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| ToolError::retryable(format!("sftp subsystem request failed: {e}")).with_code("ssh_channel"))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| ToolError::retryable(format!("sftp session init failed: {e}")).with_code("ssh_channel"))
}

fn sftp_err(op: &str, path: &str, e: russh_sftp::client::error::Error) -> ToolError {
    let message = format!("sftp {op} '{path}' failed: {e}");
    if message.contains("No such file") || message.contains("NoSuchFile") {
        ToolError::not_found(message).with_code("sftp_not_found")
    } else if message.contains("Permission") {
        ToolError::denied(message).with_code("sftp_denied")
    } else {
        ToolError::internal(message).with_code("sftp")
    }
}

async fn ensure_remote_parents(sftp: &SftpSession, path: &str) {
    let Some(parent) = Path::new(path).parent() else {
        return;
    };
    let mut built = String::new();
    for component in parent.components() {
        let part = component.as_os_str().to_string_lossy();
        if part == "/" {
            built.push('/');
            continue;
        }
        if !built.is_empty() && !built.ends_with('/') {
            built.push('/');
        }
        built.push_str(&part);
        // Exists-already errors are expected; anything fatal surfaces on open.
        let _ = sftp.create_dir(&built).await;
    }
}

/// A streaming handle over a remote file. Holds the session busy lock for
/// its whole lifetime so the transfer is serialized like any other
/// operation on the profile.
pub struct RemoteFile {
    file: Pin<Box<russh_sftp::client::fs::File>>,
    _sftp: SftpSession,
    _busy: BusyGuard,
    _session: Arc<SshSession>,
}

impl AsyncRead for RemoteFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.file.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for RemoteFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.file.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.file.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.file.as_mut().poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub overwrite: bool,
    pub create_parents: bool,
    pub preserve_mtime: bool,
}

impl SshManager {
    async fn busy_guard(&self, profile_name: &str, ctx: &ResolveCtx) -> ToolResult<(Arc<SshSession>, BusyGuard)> {
        let session = self.session(profile_name, ctx).await?;
        let guard = session.handle.clone().lock_owned().await;
        Ok((session, guard))
    }

    /// List a remote directory.
    pub async fn sftp_list(&self, profile_name: &str, ctx: &ResolveCtx, path: &str) -> ToolResult<Value> {
        let (_session, guard) = self.busy_guard(profile_name, ctx).await?;
        let sftp = open_sftp(&guard).await?;

        let entries = sftp
            .read_dir(path)
            .await
            .map_err(|e| sftp_err("list", path, e))?;

        let mut items = Vec::new();
        for entry in entries {
            let attrs = entry.metadata();
            items.push(json!({
                "name": entry.file_name(),
                "size": attrs.size,
                "mtime": attrs.mtime,
                "is_dir": attrs.is_dir(),
            }));
        }
        Ok(json!({"path": path, "entries": items}))
    }

    /// Upload a local file. Refuses to clobber unless `overwrite`.
    pub async fn sftp_upload(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        local_path: &Path,
        remote_path: &str,
        opts: &TransferOptions,
    ) -> ToolResult<Value> {
        let mut local = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| ToolError::not_found(format!("cannot open {}: {e}", local_path.display())))?;
        let local_meta = local
            .metadata()
            .await
            .map_err(|e| ToolError::internal(format!("stat failed: {e}")))?;

        let (_session, guard) = self.busy_guard(profile_name, ctx).await?;
        let sftp = open_sftp(&guard).await?;

        if !opts.overwrite && sftp.metadata(remote_path).await.is_ok() {
            return Err(ToolError::conflict(format!(
                "remote path '{remote_path}' exists; pass overwrite=true to replace it"
            ))
            .with_code("sftp_exists"));
        }
        if opts.create_parents {
            ensure_remote_parents(&sftp, remote_path).await;
        }

        let mut remote = sftp
            .open_with_flags(
                remote_path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(|e| sftp_err("open", remote_path, e))?;

        let bytes = tokio::io::copy(&mut local, &mut remote)
            .await
            .map_err(|e| ToolError::internal(format!("sftp upload failed: {e}")).with_code("sftp"))?;
        tokio::io::AsyncWriteExt::shutdown(&mut remote)
            .await
            .map_err(|e| ToolError::internal(format!("sftp close failed: {e}")).with_code("sftp"))?;

        if opts.preserve_mtime {
            if let Ok(modified) = local_meta.modified() {
                if let Ok(secs) = modified.duration_since(std::time::UNIX_EPOCH) {
                    let attrs = FileAttributes {
                        mtime: Some(secs.as_secs() as u32),
                        ..Default::default()
                    };
                    let _ = sftp.set_metadata(remote_path, attrs).await;
                }
            }
        }

        Ok(json!({"remote_path": remote_path, "bytes_transferred": bytes}))
    }

    /// Download a remote file to a local path, staged through a `.part`
    /// sibling and atomically renamed.
    pub async fn sftp_download(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        remote_path: &str,
        local_path: &Path,
        opts: &TransferOptions,
    ) -> ToolResult<Value> {
        if !opts.overwrite && local_path.exists() {
            return Err(ToolError::conflict(format!(
                "local path '{}' exists; pass overwrite=true to replace it",
                local_path.display()
            ))
            .with_code("download_exists"));
        }
        if opts.create_parents {
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::internal(format!("mkdir failed: {e}")))?;
            }
        }

        let (_session, guard) = self.busy_guard(profile_name, ctx).await?;
        let sftp = open_sftp(&guard).await?;

        let mut remote = sftp
            .open_with_flags(remote_path, OpenFlags::READ)
            .await
            .map_err(|e| sftp_err("open", remote_path, e))?;

        let part_path = local_path.with_extension("part");
        let mut local = open_local_0600(&part_path).await?;

        let bytes = match tokio::io::copy(&mut remote, &mut local).await {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(local);
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(ToolError::internal(format!("sftp download failed: {e}")).with_code("sftp"));
            }
        };
        local
            .sync_all()
            .await
            .map_err(|e| ToolError::internal(format!("fsync failed: {e}")))?;
        drop(local);

        tokio::fs::rename(&part_path, local_path)
            .await
            .map_err(|e| ToolError::internal(format!("rename failed: {e}")))?;

        Ok(json!({
            "local_path": local_path.display().to_string(),
            "bytes_transferred": bytes,
        }))
    }

    /// Open a remote file for streaming reads (pipelines).
    pub async fn sftp_open_read(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        remote_path: &str,
    ) -> ToolResult<RemoteFile> {
        let (session, guard) = self.busy_guard(profile_name, ctx).await?;
        let sftp = open_sftp(&guard).await?;
        let file = sftp
            .open_with_flags(remote_path, OpenFlags::READ)
            .await
            .map_err(|e| sftp_err("open", remote_path, e))?;
        Ok(RemoteFile {
            file: Box::pin(file),
            _sftp: sftp,
            _busy: guard,
            _session: session,
        })
    }

    /// Open a remote file for streaming writes (pipelines).
    pub async fn sftp_open_write(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        remote_path: &str,
        opts: &TransferOptions,
    ) -> ToolResult<RemoteFile> {
        let (session, guard) = self.busy_guard(profile_name, ctx).await?;
        let sftp = open_sftp(&guard).await?;

        if !opts.overwrite && sftp.metadata(remote_path).await.is_ok() {
            return Err(ToolError::conflict(format!(
                "remote path '{remote_path}' exists; pass overwrite=true to replace it"
            ))
            .with_code("sftp_exists"));
        }
        if opts.create_parents {
            ensure_remote_parents(&sftp, remote_path).await;
        }

        let file = sftp
            .open_with_flags(
                remote_path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(|e| sftp_err("open", remote_path, e))?;
        Ok(RemoteFile {
            file: Box::pin(file),
            _sftp: sftp,
            _busy: guard,
            _session: session,
        })
    }
}

async fn open_local_0600(path: &Path) -> ToolResult<tokio::fs::File> {
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        opts.mode(0o600);
    }
    opts.open(path)
        .await
        .map_err(|e| ToolError::internal(format!("cannot create {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_options_default_refuses_clobber() {
        let opts = TransferOptions::default();
        assert!(!opts.overwrite);
        assert!(!opts.create_parents);
        assert!(!opts.preserve_mtime);
    }
}
