use base64::Engine;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use russh_keys::PublicKeyBase64;
use sentryfrogg_store::ProfileStore;
use sentryfrogg_types::{ProfileKind, ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::resolver::{ResolveCtx, SecretResolver};
use crate::{env_bytes, env_ms};

// ── SSH manager ──────────────────────────────────────────────────
//
// One reusable session per profile. A single-flight dial prevents
// concurrent dials for the same key; the session handle lives behind an
// async mutex that serializes channel use, so concurrent callers queue.

const DEFAULT_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_EXEC_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_CAPTURE_BYTES: usize = 256 * 1024;

// ── Host-key policy ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    #[default]
    Accept,
    Pin,
    Tofu,
}

/// `SHA256:<base64-no-padding>` of the raw public key bytes.
pub fn fingerprint_sha256(key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(key_bytes);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

/// Accept both `SHA256:…` and bare-base64 fingerprint inputs.
fn normalize_fingerprint(raw: &str) -> String {
    let body = raw.strip_prefix("SHA256:").unwrap_or(raw);
    format!("SHA256:{}", body.trim_end_matches('='))
}

// ── Connection config ────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SshConfig {
    host: String,
    port: u16,
    username: String,
    private_key: Option<String>,
    passphrase: Option<String>,
    password: Option<String>,
    policy: HostKeyPolicy,
    pinned_fingerprint: Option<String>,
    tofu_persist: bool,
    connect_timeout_ms: u64,
}

impl SshConfig {
    fn from_value(config: &Value) -> ToolResult<Self> {
        let get = |key: &str| config.get(key).and_then(|v| v.as_str()).map(String::from);

        let host = get("host")
            .ok_or_else(|| ToolError::invalid_params("ssh connection needs a host"))?;
        let username = get("username")
            .or_else(|| get("user"))
            .ok_or_else(|| ToolError::invalid_params("ssh connection needs a username"))?;

        let private_key = get("private_key");
        let password = get("password");
        if private_key.is_none() && password.is_none() {
            return Err(ToolError::denied("no private_key and no password configured")
                .with_code("missing_auth")
                .with_hint("store private_key (with optional passphrase) or password"));
        }

        let policy = match get("host_key_policy").as_deref() {
            None => HostKeyPolicy::default(),
            Some("accept") => HostKeyPolicy::Accept,
            Some("pin") => HostKeyPolicy::Pin,
            Some("tofu") => HostKeyPolicy::Tofu,
            Some(other) => {
                return Err(ToolError::invalid_params(format!(
                    "unknown host_key_policy '{other}'"
                )))
            }
        };

        let pinned_fingerprint = get("host_key_fingerprint_sha256").map(|f| normalize_fingerprint(&f));
        if policy == HostKeyPolicy::Pin && pinned_fingerprint.is_none() {
            return Err(ToolError::invalid_params(
                "host_key_policy=pin requires host_key_fingerprint_sha256",
            ));
        }

        Ok(Self {
            host,
            port: config.get("port").and_then(|p| p.as_u64()).unwrap_or(DEFAULT_PORT as u64) as u16,
            username,
            private_key,
            passphrase: get("passphrase"),
            password,
            policy,
            pinned_fingerprint,
            tofu_persist: config
                .get("tofu_persist")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            connect_timeout_ms: config
                .get("connect_timeout_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| env_ms("SSH_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)),
        })
    }
}

// ── Client handler ───────────────────────────────────────────────

pub(crate) struct ClientHandler {
    policy: HostKeyPolicy,
    pinned: Option<String>,
    observed: Arc<StdMutex<Option<String>>>,
}

#[async_trait::async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = fingerprint_sha256(&server_public_key.public_key_bytes());
        *self.observed.lock().expect("observed fingerprint poisoned") = Some(fingerprint.clone());

        match (&self.policy, &self.pinned) {
            (HostKeyPolicy::Accept, _) => Ok(true),
            (HostKeyPolicy::Pin, Some(pinned)) | (HostKeyPolicy::Tofu, Some(pinned)) => {
                Ok(&fingerprint == pinned)
            }
            (HostKeyPolicy::Pin, None) => Ok(false),
            (HostKeyPolicy::Tofu, None) => Ok(true),
        }
    }
}

// ── Session & manager ────────────────────────────────────────────

pub struct SshSession {
    /// The async mutex doubles as the per-session busy lock.
    pub(crate) handle: Arc<AsyncMutex<russh::client::Handle<ClientHandler>>>,
    pub fingerprint: Option<String>,
}

type DialFuture = Shared<BoxFuture<'static, Result<Arc<SshSession>, ToolError>>>;

enum Slot {
    Dialing(DialFuture),
    Ready(Arc<SshSession>),
}

#[derive(Clone)]
pub struct SshManager {
    slots: Arc<StdMutex<HashMap<String, Slot>>>,
    profiles: ProfileStore,
    resolver: SecretResolver,
}

// ── exec result ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
    pub stdin: Option<Vec<u8>>,
    /// Mirror captured output into this file (`capped` honors the capture
    /// limit, `full` writes everything).
    pub artifact_path: Option<std::path::PathBuf>,
    pub artifact_mode: ArtifactMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactMode {
    #[default]
    Off,
    Capped,
    Full,
}

impl ArtifactMode {
    pub fn from_env() -> Self {
        for var in [
            "SENTRYFROGG_PIPELINE_STREAM_TO_ARTIFACT",
            "SF_PIPELINE_STREAM_TO_ARTIFACT",
        ] {
            if let Ok(raw) = std::env::var(var) {
                return match raw.as_str() {
                    "capped" => Self::Capped,
                    "full" => Self::Full,
                    _ => Self::Off,
                };
            }
        }
        Self::Off
    }
}

/// Single-quote a string for POSIX shells.
pub fn shell_escape(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

impl SshManager {
    pub fn new(profiles: ProfileStore, resolver: SecretResolver) -> Self {
        let manager = Self {
            slots: Arc::new(StdMutex::new(HashMap::new())),
            profiles: profiles.clone(),
            resolver,
        };
        let slots = manager.slots.clone();
        profiles.on_change(Box::new(move |name| {
            slots.lock().expect("session map poisoned").remove(name);
        }));
        manager
    }

    /// Drop the cached session for a profile; the next call redials.
    pub fn invalidate(&self, profile_name: &str) {
        self.slots
            .lock()
            .expect("session map poisoned")
            .remove(profile_name);
    }

    /// Obtain the pooled session for `profile_name`, dialing at most once
    /// no matter how many callers arrive concurrently.
    pub async fn session(&self, profile_name: &str, ctx: &ResolveCtx) -> ToolResult<Arc<SshSession>> {
        enum Action {
            Use(Arc<SshSession>),
            Wait(DialFuture),
        }

        loop {
            let action = {
                let mut slots = self.slots.lock().expect("session map poisoned");
                match slots.get(profile_name) {
                    Some(Slot::Ready(session)) => Action::Use(session.clone()),
                    Some(Slot::Dialing(future)) => Action::Wait(future.clone()),
                    None => {
                        let future = Self::dial_future(
                            self.profiles.clone(),
                            self.resolver.clone(),
                            profile_name.to_string(),
                            ctx.clone(),
                        );
                        slots.insert(profile_name.to_string(), Slot::Dialing(future.clone()));
                        Action::Wait(future)
                    }
                }
            };

            match action {
                Action::Use(session) => {
                    if session.handle.lock().await.is_closed() {
                        self.invalidate(profile_name);
                        continue;
                    }
                    return Ok(session);
                }
                Action::Wait(future) => {
                    let result = future.await;
                    let mut slots = self.slots.lock().expect("session map poisoned");
                    match &result {
                        Ok(session) => {
                            slots.insert(profile_name.to_string(), Slot::Ready(session.clone()));
                        }
                        Err(_) => {
                            if matches!(slots.get(profile_name), Some(Slot::Dialing(_))) {
                                slots.remove(profile_name);
                            }
                        }
                    }
                    return result;
                }
            }
        }
    }

    fn dial_future(
        profiles: ProfileStore,
        resolver: SecretResolver,
        profile_name: String,
        ctx: ResolveCtx,
    ) -> DialFuture {
        async move {
            let profile = profiles
                .get(&profile_name, Some(ProfileKind::Ssh))
                .await
                .map_err(ToolError::from)?;
            let merged = Value::Object(profile.merged_config());
            let resolved = resolver.resolve_deep(&merged, &ctx).await?;
            let config = SshConfig::from_value(&resolved)?;

            let observed = Arc::new(StdMutex::new(None));
            let session = dial(&config, observed.clone()).await?;

            let fingerprint = observed.lock().expect("observed fingerprint poisoned").clone();
            // First contact under TOFU: persist the observed fingerprint so
            // later dials pin it.
            if config.policy == HostKeyPolicy::Tofu
                && config.tofu_persist
                && config.pinned_fingerprint.is_none()
            {
                if let Some(fp) = &fingerprint {
                    profiles
                        .set_data_field(&profile_name, "host_key_fingerprint_sha256", json!(fp))
                        .await
                        .map_err(ToolError::from)?;
                }
            }

            Ok(Arc::new(SshSession {
                handle: Arc::new(AsyncMutex::new(session)),
                fingerprint,
            }))
        }
        .boxed()
        .shared()
    }

    /// Run a command on the pooled session. Queues behind other callers
    /// using the same profile.
    pub async fn exec(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        command: &str,
        opts: &ExecOptions,
    ) -> ToolResult<ExecResult> {
        let session = self.session(profile_name, ctx).await?;
        let result = exec_on(&session, command, opts).await;
        if let Err(err) = &result {
            if err.code == "ssh_channel" {
                self.invalidate(profile_name);
            }
        }
        result
    }

    /// Run commands sequentially, optionally stopping at the first failure.
    pub async fn batch(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        commands: &[String],
        stop_on_error: bool,
        opts: &ExecOptions,
    ) -> ToolResult<Value> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = self.exec(profile_name, ctx, command, opts).await?;
            let failed = result.exit_code != 0 || result.timed_out;
            results.push(serde_json::to_value(&result).unwrap_or(Value::Null));
            if failed && stop_on_error {
                break;
            }
        }
        Ok(json!({"results": results}))
    }

    pub async fn system_info(&self, profile_name: &str, ctx: &ResolveCtx) -> ToolResult<Value> {
        let result = self
            .exec(
                profile_name,
                ctx,
                "uname -a; hostname; uptime",
                &ExecOptions::default(),
            )
            .await?;
        let mut lines = result.stdout.lines();
        Ok(json!({
            "uname": lines.next().unwrap_or_default(),
            "hostname": lines.next().unwrap_or_default(),
            "uptime": lines.next().unwrap_or_default().trim(),
            "exit_code": result.exit_code,
        }))
    }

    /// Dial (or reuse) and report the host key fingerprint.
    pub async fn check_host(&self, profile_name: &str, ctx: &ResolveCtx) -> ToolResult<Value> {
        let session = self.session(profile_name, ctx).await?;
        Ok(json!({
            "reachable": true,
            "host_key_fingerprint_sha256": session.fingerprint,
        }))
    }

    /// Append a public key line to the remote authorized_keys, idempotently.
    pub async fn authorized_keys_add(
        &self,
        profile_name: &str,
        ctx: &ResolveCtx,
        key_line: &str,
    ) -> ToolResult<Value> {
        let key_line = key_line.trim();
        let mut parts = key_line.split_whitespace();
        let key_type = parts
            .next()
            .ok_or_else(|| ToolError::invalid_params("empty public key line"))?;
        let blob_b64 = parts
            .next()
            .ok_or_else(|| ToolError::invalid_params("public key line has no key blob"))?;
        if !key_type.starts_with("ssh-") && !key_type.starts_with("ecdsa-") {
            return Err(ToolError::invalid_params(format!(
                "'{key_type}' is not a recognized public key type"
            )));
        }
        let blob = base64::engine::general_purpose::STANDARD
            .decode(blob_b64)
            .map_err(|_| ToolError::invalid_params("public key blob is not valid base64"))?;
        let fingerprint = fingerprint_sha256(&blob);

        // Portable POSIX script reading the key line from stdin: ensures
        // ~/.ssh (700) and authorized_keys (600), dedups on the exact
        // (type, blob) pair, prints present/added then the file path.
        let script = r#"sh -c 'set -u
umask 077
mkdir -p "$HOME/.ssh"
chmod 700 "$HOME/.ssh"
AK="$HOME/.ssh/authorized_keys"
touch "$AK"
chmod 600 "$AK"
IFS= read -r line || exit 64
t=$(printf "%s\n" "$line" | awk "{print \$1}")
b=$(printf "%s\n" "$line" | awk "{print \$2}")
if awk -v t="$t" -v b="$b" "\$1==t && \$2==b {found=1} END {exit !found}" "$AK"; then
  printf "present\n"
else
  printf "%s\n" "$line" >> "$AK"
  printf "added\n"
fi
printf "%s\n" "$AK"'"#;

        let opts = ExecOptions {
            stdin: Some(format!("{key_line}\n").into_bytes()),
            ..Default::default()
        };
        let result = self.exec(profile_name, ctx, script, &opts).await?;
        if result.exit_code != 0 {
            return Err(ToolError::internal(format!(
                "authorized_keys update failed: {}",
                result.stderr.trim()
            ))
            .with_code("ssh_exec"));
        }

        let mut lines = result.stdout.lines();
        let verdict = lines.next().unwrap_or_default();
        let path = lines.next().unwrap_or("~/.ssh/authorized_keys");
        Ok(json!({
            "changed": verdict == "added",
            "key_fingerprint_sha256": fingerprint,
            "authorized_keys_path": path,
        }))
    }
}

// ── Dial & exec internals ────────────────────────────────────────

async fn dial(
    config: &SshConfig,
    observed: Arc<StdMutex<Option<String>>>,
) -> ToolResult<russh::client::Handle<ClientHandler>> {
    let handler = ClientHandler {
        policy: config.policy,
        pinned: config.pinned_fingerprint.clone(),
        observed,
    };

    let russh_config = Arc::new(russh::client::Config::default());
    let connect = russh::client::connect(
        russh_config,
        (config.host.as_str(), config.port),
        handler,
    );
    let mut session = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        connect,
    )
    .await
    .map_err(|_| {
        ToolError::timeout(format!(
            "ssh connect to {}:{} timed out",
            config.host, config.port
        ))
        .with_code("ssh_connect_timeout")
    })?
    .map_err(|e| match e {
        russh::Error::UnknownKey => ToolError::denied(format!(
            "host key for {} did not match the pinned fingerprint",
            config.host
        ))
        .with_code("host_key_mismatch"),
        other => ToolError::retryable(format!("ssh connection failed: {other}"))
            .with_code("ssh_connect"),
    })?;

    // Auth priority: private key (with optional passphrase), then password.
    let authenticated = if let Some(key_str) = &config.private_key {
        let key_pair = russh_keys::decode_secret_key(key_str, config.passphrase.as_deref())
            .map_err(|e| {
                ToolError::invalid_params(format!("failed to decode private key: {e}"))
                    .with_code("ssh_key")
            })?;
        session
            .authenticate_publickey(&config.username, Arc::new(key_pair))
            .await
            .map_err(|e| ToolError::retryable(format!("ssh public key auth failed: {e}")).with_code("ssh_auth"))?
    } else if let Some(password) = &config.password {
        session
            .authenticate_password(&config.username, password)
            .await
            .map_err(|e| ToolError::retryable(format!("ssh password auth failed: {e}")).with_code("ssh_auth"))?
    } else {
        false
    };

    if !authenticated {
        return Err(ToolError::denied("ssh authentication rejected").with_code("ssh_auth"));
    }
    Ok(session)
}

async fn exec_on(session: &SshSession, command: &str, opts: &ExecOptions) -> ToolResult<ExecResult> {
    let full_command = match &opts.cwd {
        Some(cwd) => format!("cd {} && {}", shell_escape(cwd), command),
        None => command.to_string(),
    };

    let cap = env_bytes("SSH_MAX_CAPTURE_BYTES", DEFAULT_CAPTURE_BYTES);
    let timeout_ms = opts
        .timeout_ms
        .unwrap_or_else(|| env_ms("SSH_TIMEOUT_MS", DEFAULT_EXEC_TIMEOUT_MS));
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let started = std::time::Instant::now();

    // The busy lock: concurrent exec/SFTP for the same profile queue here.
    let guard = session.handle.lock().await;
    let mut channel = guard
        .channel_open_session()
        .await
        .map_err(|e| ToolError::retryable(format!("failed to open ssh channel: {e}")).with_code("ssh_channel"))?;

    channel
        .exec(true, full_command.as_str())
        .await
        .map_err(|e| ToolError::retryable(format!("failed to exec ssh command: {e}")).with_code("ssh_channel"))?;

    if let Some(stdin) = &opts.stdin {
        channel
            .data(&stdin[..])
            .await
            .map_err(|e| ToolError::retryable(format!("failed to write ssh stdin: {e}")).with_code("ssh_channel"))?;
        channel
            .eof()
            .await
            .map_err(|e| ToolError::retryable(format!("failed to close ssh stdin: {e}")).with_code("ssh_channel"))?;
    }

    let mut artifact = match (&opts.artifact_path, opts.artifact_mode) {
        (Some(path), ArtifactMode::Capped | ArtifactMode::Full) => Some(
            tokio::fs::File::create(path)
                .await
                .map_err(|e| ToolError::internal(format!("failed to create artifact file: {e}")))?,
        ),
        _ => None,
    };

    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut stderr_buf: Vec<u8> = Vec::new();
    let mut stdout_total: usize = 0;
    let mut stderr_total: usize = 0;
    let mut exit_code: i32 = -1;
    let mut signal: Option<String> = None;
    let mut timed_out = false;

    loop {
        match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(Some(msg)) => match msg {
                russh::ChannelMsg::Data { ref data } => {
                    stdout_total += data.len();
                    append_capped(&mut stdout_buf, data, cap);
                    if let Some(file) = artifact.as_mut() {
                        let slice = artifact_slice(data, stdout_total, cap, opts.artifact_mode);
                        file.write_all(slice).await.ok();
                    }
                }
                russh::ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr_total += data.len();
                    append_capped(&mut stderr_buf, data, cap);
                }
                russh::ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = exit_status as i32;
                }
                russh::ChannelMsg::ExitSignal { signal_name, .. } => {
                    signal = Some(format!("{signal_name:?}"));
                }
                _ => {}
            },
            Ok(None) => break,
            Err(_) => {
                timed_out = true;
                channel.close().await.ok();
                break;
            }
        }
    }
    drop(guard);

    if let Some(file) = artifact.as_mut() {
        file.flush().await.ok();
    }

    Ok(ExecResult {
        exit_code,
        signal,
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        duration_ms: started.elapsed().as_millis() as u64,
        timed_out,
        stdout_truncated: stdout_total > stdout_buf.len(),
        stderr_truncated: stderr_total > stderr_buf.len(),
    })
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    let take = room.min(data.len());
    buf.extend_from_slice(&data[..take]);
}

fn artifact_slice<'a>(data: &'a [u8], total_so_far: usize, cap: usize, mode: ArtifactMode) -> &'a [u8] {
    match mode {
        ArtifactMode::Full => data,
        ArtifactMode::Capped => {
            let before = total_so_far - data.len();
            if before >= cap {
                &[]
            } else {
                &data[..data.len().min(cap - before)]
            }
        }
        ArtifactMode::Off => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        // SHA256:<base64 without '=' padding> of the raw key bytes
        let fp = fingerprint_sha256(b"hostkey");
        let digest = Sha256::digest(b"hostkey");
        let expected = format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        );
        assert_eq!(fp, expected);
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_normalize_fingerprint_forms() {
        let bare = "abc123XYZ";
        assert_eq!(normalize_fingerprint(bare), "SHA256:abc123XYZ");
        assert_eq!(normalize_fingerprint("SHA256:abc123XYZ"), "SHA256:abc123XYZ");
        assert_eq!(normalize_fingerprint("SHA256:abc123XYZ=="), "SHA256:abc123XYZ");
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("/var/www"), "'/var/www'");
        assert_eq!(shell_escape("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_config_auth_priority() {
        let config = SshConfig::from_value(&json!({
            "host": "h", "username": "u",
            "private_key": "KEY", "password": "pw"
        }))
        .unwrap();
        assert!(config.private_key.is_some());
        assert!(config.password.is_some());
    }

    #[test]
    fn test_config_missing_auth() {
        let err = SshConfig::from_value(&json!({"host": "h", "username": "u"})).unwrap_err();
        assert_eq!(err.code, "missing_auth");
    }

    #[test]
    fn test_config_pin_requires_fingerprint() {
        let err = SshConfig::from_value(&json!({
            "host": "h", "username": "u", "password": "p",
            "host_key_policy": "pin"
        }))
        .unwrap_err();
        assert_eq!(err.category, sentryfrogg_types::ErrorCategory::InvalidParams);
    }

    #[test]
    fn test_append_capped() {
        let mut buf = Vec::new();
        append_capped(&mut buf, b"hello", 3);
        assert_eq!(buf, b"hel");
        append_capped(&mut buf, b"more", 3);
        assert_eq!(buf, b"hel");
    }

    #[test]
    fn test_artifact_slice_capped() {
        // 10-byte cap, second chunk crosses it
        let first = artifact_slice(b"12345678", 8, 10, ArtifactMode::Capped);
        assert_eq!(first, b"12345678");
        let second = artifact_slice(b"abcdef", 14, 10, ArtifactMode::Capped);
        assert_eq!(second, b"ab");
        let third = artifact_slice(b"xyz", 17, 10, ArtifactMode::Capped);
        assert_eq!(third, b"");
        assert_eq!(artifact_slice(b"xyz", 17, 10, ArtifactMode::Full), b"xyz");
    }
}
