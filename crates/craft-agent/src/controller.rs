use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use craft_process::{InstanceId, ResourceUsage, ServerState, ServerStatus};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{Mutex, oneshot, watch};

use crate::config::{AgentConfig, InstancePaths};
use crate::console::ConsoleBridge;
use crate::error::{Error, IoContext, Result, Transition};
use crate::launch::resolve_launch_spec;
use crate::resource::{self, ResourceScope};
use crate::server_config::{self, ServerConfig};

const STOP_COMMAND: &str = "stop\n";
const FORCE_KILL_WAIT: Duration = Duration::from_secs(10);
/// How long output may keep arriving after the process exits. Descendants
/// that inherited the pipes can hold them open indefinitely.
const DRAIN_SETTLE: Duration = Duration::from_secs(2);

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, take the server down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug)]
struct Handle {
    state: ServerState,
    /// Bumped on every launch so a late exit watcher cannot clear a newer run.
    run: u64,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<tokio::time::Instant>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: Option<watch::Receiver<bool>>,
    cgroup: Option<PathBuf>,
}

impl Handle {
    fn stopped() -> Self {
        Self {
            state: ServerState::Stopped,
            run: 0,
            pid: None,
            started_at: None,
            started_instant: None,
            stdin: None,
            kill_tx: None,
            exited_rx: None,
            cgroup: None,
        }
    }

    fn clear(&mut self) -> Option<PathBuf> {
        self.state = ServerState::Stopped;
        self.pid = None;
        self.started_at = None;
        self.started_instant = None;
        self.stdin = None;
        self.kill_tx = None;
        self.exited_rx = None;
        self.cgroup.take()
    }

    fn reject(&self, reason: Transition) -> Error {
        Error::InvalidTransition {
            reason,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    pid: u32,
    ticks: u64,
    at: tokio::time::Instant,
}

fn remove_cgroup(path: Option<PathBuf>) {
    if let Some(path) = path
        && let Err(e) = std::fs::remove_dir(&path)
    {
        tracing::debug!(path = %path.display(), error = %e, "cgroup cleanup failed");
    }
}

async fn wait_exited(rx: Option<watch::Receiver<bool>>, timeout: Duration) -> bool {
    let Some(mut rx) = rx else {
        return true;
    };
    match tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Owns the lifecycle of one instance's server process.
pub struct ProcessController {
    instance_id: InstanceId,
    paths: InstancePaths,
    agent: Arc<AgentConfig>,
    console: ConsoleBridge,
    scope_tx: Arc<watch::Sender<Option<ResourceScope>>>,
    // Serializes start/stop/restart/send_command for this instance.
    op_lock: Mutex<()>,
    inner: Arc<Mutex<Handle>>,
    cpu_prev: std::sync::Mutex<Option<CpuSample>>,
}

impl ProcessController {
    pub fn new(
        instance_id: InstanceId,
        paths: InstancePaths,
        agent: Arc<AgentConfig>,
        console: ConsoleBridge,
        scope_tx: watch::Sender<Option<ResourceScope>>,
    ) -> Self {
        Self {
            instance_id,
            paths,
            agent,
            console,
            scope_tx: Arc::new(scope_tx),
            op_lock: Mutex::new(()),
            inner: Arc::new(Mutex::new(Handle::stopped())),
            cpu_prev: std::sync::Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn console(&self) -> &ConsoleBridge {
        &self.console
    }

    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await.is_running()
    }

    pub async fn start(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await
    }

    /// Stop if running, let the port settle, then start again.
    pub async fn restart(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.is_running().await {
            self.stop_locked().await?;
        }
        tokio::time::sleep(self.agent.restart_settle).await;
        self.start_locked().await
    }

    pub async fn send_command(&self, text: &str) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let command = text.trim_end_matches(['\r', '\n']);
        if command.trim().is_empty() {
            return Err(Error::InvalidArgument("command must not be empty".into()));
        }

        let (mut stdin, run) = {
            let mut h = self.inner.lock().await;
            if h.state != ServerState::Running {
                return Err(h.reject(Transition::NotRunning));
            }
            let Some(stdin) = h.stdin.take() else {
                return Err(h.reject(Transition::NotRunning));
            };
            (stdin, h.run)
        };

        let written = async {
            stdin.write_all(command.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        {
            let mut h = self.inner.lock().await;
            if h.run == run && h.state == ServerState::Running {
                h.stdin = Some(stdin);
            }
        }

        written.io_context(|| "write command to server stdin".to_string())?;
        tracing::debug!(instance_id = %self.instance_id, command, "command sent");
        Ok(())
    }

    /// Lifecycle snapshot with best-effort resource usage.
    pub async fn status(&self) -> ServerStatus {
        let (state, pid, started_at, started_instant) = {
            let h = self.inner.lock().await;
            (h.state, h.pid, h.started_at, h.started_instant)
        };

        let cfg = server_config::load(&self.paths)
            .await
            .unwrap_or_else(|_| ServerConfig::default());
        let resources = match pid {
            Some(pid) => self.resource_usage(pid).await,
            None => {
                self.with_cpu_prev(|prev| *prev = None);
                None
            }
        };

        ServerStatus {
            instance_id: self.instance_id.clone(),
            state,
            is_running: state.is_running(),
            pid,
            started_at_unix_ms: started_at.map(|t| t.timestamp_millis().max(0) as u64),
            uptime_secs: started_instant.map(|t| t.elapsed().as_secs()),
            version: cfg.effective_version(&self.agent),
            max_players: cfg.max_players,
            resources,
        }
    }

    fn with_cpu_prev<R>(&self, f: impl FnOnce(&mut Option<CpuSample>) -> R) -> R {
        let mut guard = match self.cpu_prev.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    async fn resource_usage(&self, pid: u32) -> Option<ResourceUsage> {
        let ticks = resource::read_proc_cpu_ticks(pid).await?;
        let rss = resource::read_proc_rss_bytes(pid).await?;
        let total = resource::read_host_memory_total().await.unwrap_or(0);
        let now = tokio::time::Instant::now();

        let cpu_percent = self.with_cpu_prev(|prev| {
            let cpu = match *prev {
                Some(p) if p.pid == pid => resource::cpu_percent_between(p.ticks, p.at, ticks, now),
                _ => 0.0,
            };
            *prev = Some(CpuSample { pid, ticks, at: now });
            cpu
        });

        Some(ResourceUsage {
            cpu_percent,
            memory_bytes: rss,
            memory_total_bytes: total,
        })
    }

    async fn start_locked(&self) -> Result<()> {
        {
            let mut h = self.inner.lock().await;
            if h.state != ServerState::Stopped {
                return Err(h.reject(Transition::AlreadyRunning));
            }
            h.state = ServerState::Starting;
        }

        match self.launch().await {
            Ok(pid) => {
                tracing::info!(instance_id = %self.instance_id, pid, "server started");
                Ok(())
            }
            Err(e) => {
                let cgroup = self.inner.lock().await.clear();
                remove_cgroup(cgroup);
                self.scope_tx.send_replace(None);
                tracing::warn!(instance_id = %self.instance_id, error = %e, "server start failed");
                self.console.emit_note(format!("start failed: {e}")).await;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<u32> {
        self.console.emit_note("start requested").await;

        let server_dir = self.paths.server_dir();
        server_config::write_eula(&server_dir).await?;
        let cfg = server_config::load(&self.paths).await?;
        server_config::save(&self.paths, &cfg).await?;

        let memory = cfg.effective_memory(&self.agent);
        let spec = resolve_launch_spec(&server_dir, &self.agent.java_bin, &memory)?;
        self.console
            .emit_note(format!("launching: {} (cwd {})", spec.display(), server_dir.display()))
            .await;

        let mut cmd = tokio::process::Command::new(&spec.exec);
        cmd.args(&spec.args)
            .current_dir(&server_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            // Own process group so a forced stop reaches the whole tree.
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::DownstreamUnavailable(format!(
                "spawn {} (cwd {}): {e}",
                spec.exec,
                server_dir.display()
            ))
        })?;

        let (Some(pid), Some(stdin), Some(stdout), Some(stderr)) = (
            child.id(),
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) else {
            let _ = child.start_kill();
            return Err(Error::DownstreamUnavailable(
                "server process exited before its pipes were attached".into(),
            ));
        };

        let mut cgroup = None;
        if let Some(root) = &self.agent.cgroup_root {
            let limit = server_config::parse_memory(&memory)
                .ok()
                .and_then(|m| resource::memory_bytes(&m));
            match resource::attach_to_cgroup(root, self.instance_id.as_str(), pid, limit) {
                Ok(path) => cgroup = Some(path),
                Err(e) => tracing::warn!(
                    instance_id = %self.instance_id,
                    root = %root.display(),
                    error = %e,
                    "cgroup placement failed; sampling the process instead"
                ),
            }
        }
        let scope = match &cgroup {
            Some(path) => ResourceScope::Cgroup { path: path.clone() },
            None => ResourceScope::Process { pid },
        };

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let run = {
            let mut h = self.inner.lock().await;
            h.run = h.run.wrapping_add(1);
            h.state = ServerState::Running;
            h.pid = Some(pid);
            h.started_at = Some(Utc::now());
            h.started_instant = Some(tokio::time::Instant::now());
            h.stdin = Some(stdin);
            h.kill_tx = Some(kill_tx);
            h.exited_rx = Some(exited_rx);
            h.cgroup = cgroup;
            h.run
        };
        self.scope_tx.send_replace(Some(scope));
        let attachment = self.console.attach(stdout, stderr).await;
        self.console.emit_note(format!("server started (pid {pid})")).await;

        let inner = self.inner.clone();
        let scope_tx = self.scope_tx.clone();
        let console = self.console.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                res = child.wait() => res,
                Ok(()) = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let mut drain = attachment.drain;
            if tokio::time::timeout(DRAIN_SETTLE, &mut drain).await.is_err() {
                tracing::debug!(instance_id = %instance_id, pid, "console pipes still open after exit; detaching");
            }
            console.detach(attachment.generation).await;

            let (expected, cgroup) = {
                let mut h = inner.lock().await;
                if h.run != run {
                    return;
                }
                let expected = h.state != ServerState::Running;
                (expected, h.clear())
            };
            remove_cgroup(cgroup);
            scope_tx.send_replace(None);
            let _ = exited_tx.send(true);

            let detail = match &res {
                Ok(status) => match status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                },
                Err(e) => format!("wait failed: {e}"),
            };
            if expected {
                tracing::info!(instance_id = %instance_id, pid, %detail, "server exited");
                console.emit_note(format!("server exited ({detail})")).await;
            } else {
                tracing::warn!(instance_id = %instance_id, pid, %detail, "server exited unexpectedly");
                console
                    .emit_note(format!("server exited unexpectedly ({detail})"))
                    .await;
            }
        });

        Ok(pid)
    }

    async fn stop_locked(&self) -> Result<()> {
        let (stdin, exited_rx, kill_tx, pid) = {
            let mut h = self.inner.lock().await;
            if h.state != ServerState::Running {
                return Err(h.reject(Transition::NotRunning));
            }
            h.state = ServerState::Stopping;
            (h.stdin.take(), h.exited_rx.clone(), h.kill_tx.take(), h.pid)
        };

        let grace = self.agent.stop_grace;
        self.console
            .emit_note(format!("stop requested (grace {}s)", grace.as_secs()))
            .await;

        if let Some(mut stdin) = stdin {
            let sent = async {
                stdin.write_all(STOP_COMMAND.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = sent {
                tracing::debug!(instance_id = %self.instance_id, error = %e, "graceful stop command failed");
            }
            // Dropping stdin also hands the server EOF.
        }

        if !wait_exited(exited_rx.clone(), grace).await {
            tracing::warn!(instance_id = %self.instance_id, ?pid, "server ignored stop; killing");
            self.console
                .emit_note("server did not exit within the grace period; killing")
                .await;

            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    unsafe {
                        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
            if let Some(tx) = kill_tx {
                let _ = tx.send(());
            }

            if !wait_exited(exited_rx, FORCE_KILL_WAIT).await {
                tracing::warn!(instance_id = %self.instance_id, ?pid, "server exit not observed after kill");
            }
        }

        // The watcher normally got here first; make sure the handle ends cleared.
        let cgroup = {
            let mut h = self.inner.lock().await;
            if h.state == ServerState::Stopped {
                None
            } else {
                h.clear()
            }
        };
        remove_cgroup(cgroup);
        self.scope_tx.send_replace(None);
        Ok(())
    }
}
