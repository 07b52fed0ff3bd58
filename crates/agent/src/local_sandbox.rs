use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use builder_core::{new_ulid, now_ms};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};

use crate::sandbox::{CommandOutput, Sandbox, SandboxError, DEFAULT_SANDBOX_TIMEOUT};

/// Home directory the agent is told it works in; paths under it are re-rooted.
const SANDBOX_HOME: &str = "/home/user/";

/// Output still collected after the shell exits. Background jobs keep the
/// pipes open, so reading to EOF would wait for them.
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Settings for [`LocalSandbox`].
#[derive(Debug, Clone)]
pub struct LocalSandboxConfig {
    /// Sessions live under `<root>/sessions/<session_id>`, their metadata
    /// under `<root>/meta`.
    pub root: PathBuf,
    /// Optional directory holding one sub-directory per template. When set,
    /// a new session starts as a copy of its template.
    pub templates_dir: Option<PathBuf>,
    /// Domain used when rendering public hosts.
    pub domain: String,
    pub command_timeout: Duration,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
}

impl LocalSandboxConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            templates_dir: None,
            domain: "localhost".into(),
            command_timeout: Duration::from_secs(10 * 60),
            max_sessions: 16,
        }
    }
}

/// Persisted next to the session directory so any worker on the same root
/// can pick the session up again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct SessionMeta {
    template: String,
    expires_at_ms: i64,
}

impl SessionMeta {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms > now
    }
}

#[derive(Default)]
struct Sessions {
    live: HashMap<String, SessionMeta>,
    /// Sessions whose directory is still being prepared.
    provisioning: usize,
}

/// Sandbox provider backed by private working directories on the agent host.
///
/// Every session is a directory; commands run through `sh -c` inside it with
/// a scrubbed environment.
pub struct LocalSandbox {
    cfg: LocalSandboxConfig,
    sessions: Mutex<Sessions>,
}

impl LocalSandbox {
    pub fn new(cfg: LocalSandboxConfig) -> Self {
        Self {
            cfg,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.cfg.root.join("sessions").join(session_id)
    }

    fn meta_dir(&self) -> PathBuf {
        self.cfg.root.join("meta")
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.meta_dir().join(format!("{session_id}.json"))
    }

    async fn load_meta(&self, session_id: &str) -> Option<SessionMeta> {
        if !is_session_id(session_id) {
            return None;
        }
        let raw = tokio::fs::read(self.meta_path(session_id)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn store_meta(&self, session_id: &str, meta: &SessionMeta) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(self.meta_dir()).await?;
        let raw = serde_json::to_vec(meta).map_err(std::io::Error::other)?;
        tokio::fs::write(self.meta_path(session_id), raw).await?;
        Ok(())
    }

    /// Metadata of a live session. Sessions created by another process on
    /// the same root are adopted; expired ones are removed from disk.
    async fn live_meta(&self, session_id: &str) -> Result<SessionMeta, SandboxError> {
        let expired = || SandboxError::SessionExpired(session_id.to_string());

        let cached = self.sessions.lock().await.live.get(session_id).cloned();
        let meta = match cached {
            Some(meta) => Some(meta),
            None => match self.load_meta(session_id).await {
                Some(meta) if is_dir(&self.session_dir(session_id)).await => Some(meta),
                _ => None,
            },
        };

        match meta {
            Some(meta) if meta.is_live(now_ms()) => {
                self.sessions
                    .lock()
                    .await
                    .live
                    .entry(session_id.to_string())
                    .or_insert_with(|| meta.clone());
                Ok(meta)
            }
            Some(_) => {
                self.sessions.lock().await.live.remove(session_id);
                tracing::info!(session_id, "sandbox session expired");
                self.purge(session_id).await;
                Err(expired())
            }
            None => Err(expired()),
        }
    }

    async fn live_dir(&self, session_id: &str) -> Result<PathBuf, SandboxError> {
        self.live_meta(session_id).await?;
        Ok(self.session_dir(session_id))
    }

    /// Remove every expired session under the root, including ones left by
    /// earlier processes.
    async fn sweep_expired(&self) {
        let now = now_ms();
        let mut expired: Vec<String> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .live
                .iter()
                .filter(|(_, meta)| !meta.is_live(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                sessions.live.remove(id);
            }
            ids
        };

        if let Ok(mut entries) = tokio::fs::read_dir(self.meta_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                    continue;
                };
                if expired.iter().any(|e| e == id)
                    || self.sessions.lock().await.live.contains_key(id)
                {
                    continue;
                }
                if let Some(meta) = self.load_meta(id).await {
                    if !meta.is_live(now) {
                        expired.push(id.to_string());
                    }
                }
            }
        }

        for id in expired {
            self.purge(&id).await;
        }
    }

    /// Delete a session's directory and metadata.
    async fn purge(&self, session_id: &str) {
        if !is_session_id(session_id) {
            return;
        }
        let removed = [
            tokio::fs::remove_dir_all(self.session_dir(session_id)).await,
            tokio::fs::remove_file(self.meta_path(session_id)).await,
        ];
        for result in removed {
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(session_id, error = %e, "failed to remove sandbox session");
                }
            }
        }
        tracing::debug!(session_id, "sandbox session removed");
    }

    /// Create the session directory from its template and record metadata.
    async fn provision(&self, template: &str, session_id: &str) -> Result<SessionMeta, SandboxError> {
        let provision_err = |reason: String| SandboxError::Provision {
            template: template.to_string(),
            reason,
        };

        let dir = self.session_dir(session_id);
        let src = match &self.cfg.templates_dir {
            Some(templates) => {
                let src = templates.join(template);
                if !is_dir(&src).await {
                    return Err(provision_err("unknown template".into()));
                }
                Some(src)
            }
            None => None,
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| provision_err(format!("failed to create session dir: {e}")))?;
        if let Some(src) = src {
            let dst = dir.clone();
            tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
                .await
                .map_err(|e| provision_err(format!("template copy aborted: {e}")))?
                .map_err(|e| provision_err(format!("template copy failed: {e}")))?;
        }

        let meta = SessionMeta {
            template: template.to_string(),
            expires_at_ms: now_ms().saturating_add(duration_ms(DEFAULT_SANDBOX_TIMEOUT)),
        };
        self.store_meta(session_id, &meta)
            .await
            .map_err(|e| provision_err(format!("failed to record session: {e}")))?;
        Ok(meta)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn acquire(&self, template: &str) -> Result<String, SandboxError> {
        if template.is_empty() || template.contains(&['/', '\\'][..]) || template == ".." {
            return Err(SandboxError::Provision {
                template: template.to_string(),
                reason: "invalid template name".into(),
            });
        }

        self.sweep_expired().await;
        {
            let mut sessions = self.sessions.lock().await;
            let in_use = sessions.live.len() + sessions.provisioning;
            if in_use >= self.cfg.max_sessions {
                return Err(SandboxError::Provision {
                    template: template.to_string(),
                    reason: format!("session quota exhausted ({in_use} live)"),
                });
            }
            sessions.provisioning += 1;
        }

        let session_id = new_ulid().to_string().to_lowercase();
        let provisioned = self.provision(template, &session_id).await;

        let mut sessions = self.sessions.lock().await;
        sessions.provisioning -= 1;
        match provisioned {
            Ok(meta) => {
                sessions.live.insert(session_id.clone(), meta);
                drop(sessions);
                tracing::info!(session_id = %session_id, template, "sandbox session created");
                Ok(session_id)
            }
            Err(e) => {
                drop(sessions);
                self.purge(&session_id).await;
                Err(e)
            }
        }
    }

    async fn resume(&self, session_id: &str) -> Result<(), SandboxError> {
        self.live_meta(session_id).await.map(|_| ())
    }

    async fn set_timeout(&self, session_id: &str, timeout: Duration) -> Result<(), SandboxError> {
        let mut meta = self.live_meta(session_id).await?;
        meta.expires_at_ms = now_ms().saturating_add(duration_ms(timeout));
        self.store_meta(session_id, &meta).await?;
        self.sessions
            .lock()
            .await
            .live
            .insert(session_id.to_string(), meta);
        Ok(())
    }

    async fn run(&self, session_id: &str, command: &str) -> Result<CommandOutput, SandboxError> {
        let dir = self.live_dir(session_id).await?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&dir)
            .env_clear()
            .env(
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into()),
            )
            .env("HOME", &dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(ch) => ch,
            Err(e) => {
                return Ok(CommandOutput {
                    error: Some(format!("spawn failed: {e}")),
                    ..Default::default()
                })
            }
        };

        let pid = child.id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pumps = [
            tokio::spawn(pump(child.stdout.take(), Stream::Stdout, tx.clone())),
            tokio::spawn(pump(child.stderr.take(), Stream::Stderr, tx)),
        ];

        let waited = tokio::time::timeout(self.cfg.command_timeout, child.wait()).await;
        if waited.is_err() {
            kill_group(pid);
            let _ = child.kill().await;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let deadline = tokio::time::Instant::now() + OUTPUT_GRACE;
        while let Ok(Some((stream, chunk))) = tokio::time::timeout_at(deadline, rx.recv()).await {
            match stream {
                Stream::Stdout => stdout.extend_from_slice(&chunk),
                Stream::Stderr => stderr.extend_from_slice(&chunk),
            }
        }
        for pump in pumps {
            pump.abort();
        }

        let (exit_code, error) = match waited {
            Ok(Ok(status)) if status.success() => (status.code(), None),
            Ok(Ok(status)) => (
                status.code(),
                Some(match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                }),
            ),
            Ok(Err(e)) => (None, Some(format!("wait failed: {e}"))),
            Err(_) => (
                None,
                Some(format!(
                    "command timed out after {:?}",
                    self.cfg.command_timeout
                )),
            ),
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            error,
        })
    }

    async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let dir = self.live_dir(session_id).await?;
        let target = resolve(&dir, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn read_file(&self, session_id: &str, path: &str) -> Result<String, SandboxError> {
        let dir = self.live_dir(session_id).await?;
        let target = resolve(&dir, path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn host_for(&self, session_id: &str, port: u16) -> String {
        format!("{port}-{session_id}.{}", self.cfg.domain)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn pump<R: AsyncRead + Unpin>(
    pipe: Option<R>,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, Vec<u8>)>,
) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, chunk[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

/// Kill the command and everything it started.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Session ids are generated lowercase ULIDs; anything else never maps to disk.
fn is_session_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Map an agent-supplied path into the session directory.
fn resolve(root: &Path, path: &str) -> Result<PathBuf, SandboxError> {
    let invalid = |reason: &str| SandboxError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let relative = path
        .strip_prefix(SANDBOX_HOME)
        .unwrap_or(path)
        .trim_start_matches('/');

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path escapes the sandbox"))
            }
        }
    }

    if out == root {
        return Err(invalid("path is empty"));
    }
    Ok(out)
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
