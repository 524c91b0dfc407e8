use sentryfrogg_conn::sftp::TransferOptions;
use sentryfrogg_conn::ssh::{ArtifactMode, ExecOptions};
use sentryfrogg_types::{ToolError, ToolResult};
use serde_json::{json, Value};
use std::path::PathBuf;

use super::{action, bool_arg, profile_for, require_str, resolve_ctx, str_arg, u64_arg};
use crate::dispatch::Dispatcher;

// ── ssh tool ─────────────────────────────────────────────────────
// Actions: exec, batch, system_info, check_host, authorized_keys_add,
// sftp_list, sftp_upload, sftp_download.

async fn profile_of(dispatcher: &Dispatcher, args: &Value) -> ToolResult<String> {
    profile_for(dispatcher.app(), args, |b| b.ssh_profile.as_ref())
        .await
        .ok_or_else(|| {
            ToolError::invalid_params("'profile_name' is required")
                .with_hint("pass profile_name or select a project with an ssh_profile binding")
        })
}

fn exec_options(args: &Value) -> ExecOptions {
    let artifact_path = str_arg(args, "artifact_path").map(PathBuf::from);
    let artifact_mode = if artifact_path.is_some() {
        match str_arg(args, "artifact_mode") {
            Some("full") => ArtifactMode::Full,
            Some("off") => ArtifactMode::Off,
            Some(_) | None => match ArtifactMode::from_env() {
                ArtifactMode::Off => ArtifactMode::Capped,
                mode => mode,
            },
        }
    } else {
        ArtifactMode::Off
    };
    ExecOptions {
        cwd: str_arg(args, "cwd").map(String::from),
        timeout_ms: u64_arg(args, "timeout_ms"),
        stdin: str_arg(args, "stdin").map(|s| s.as_bytes().to_vec()),
        artifact_path,
        artifact_mode,
    }
}

fn transfer_options(args: &Value) -> TransferOptions {
    TransferOptions {
        overwrite: bool_arg(args, "overwrite", false),
        create_parents: bool_arg(args, "create_parents", false),
        preserve_mtime: bool_arg(args, "preserve_mtime", false),
    }
}

pub async fn handle(dispatcher: Dispatcher, args: Value) -> ToolResult<Value> {
    let app = dispatcher.app();
    let profile = profile_of(&dispatcher, &args).await?;
    let ctx = resolve_ctx(app, &args).await;

    match action(&args, "exec") {
        "exec" => {
            let command = require_str(&args, "command")?;
            let result = app
                .ssh
                .exec(&profile, &ctx, &command, &exec_options(&args))
                .await?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "batch" => {
            let commands: Vec<String> = args
                .get("commands")
                .and_then(|c| c.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|c| c.as_str().map(String::from))
                        .collect()
                })
                .ok_or_else(|| ToolError::invalid_params("'commands' array is required"))?;
            app.ssh
                .batch(
                    &profile,
                    &ctx,
                    &commands,
                    bool_arg(&args, "stop_on_error", true),
                    &exec_options(&args),
                )
                .await
        }
        "system_info" => app.ssh.system_info(&profile, &ctx).await,
        "check_host" => app.ssh.check_host(&profile, &ctx).await,
        "authorized_keys_add" => {
            let key = require_str(&args, "public_key")?;
            app.ssh.authorized_keys_add(&profile, &ctx, &key).await
        }
        "sftp_list" => {
            let path = require_str(&args, "path")?;
            app.ssh.sftp_list(&profile, &ctx, &path).await
        }
        "sftp_upload" => {
            let local = PathBuf::from(require_str(&args, "local_path")?);
            let remote = require_str(&args, "remote_path")?;
            app.ssh
                .sftp_upload(&profile, &ctx, &local, &remote, &transfer_options(&args))
                .await
        }
        "sftp_download" => {
            let remote = require_str(&args, "remote_path")?;
            let local = PathBuf::from(require_str(&args, "local_path")?);
            app.ssh
                .sftp_download(&profile, &ctx, &remote, &local, &transfer_options(&args))
                .await
        }
        other => Err(ToolError::invalid_params(format!("unknown ssh action '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_options_artifact_defaults() {
        let opts = exec_options(&json!({"artifact_path": "/tmp/out.log"}));
        assert!(opts.artifact_path.is_some());
        assert_ne!(opts.artifact_mode, ArtifactMode::Off);

        let no_artifact = exec_options(&json!({}));
        assert_eq!(no_artifact.artifact_mode, ArtifactMode::Off);
    }
}
