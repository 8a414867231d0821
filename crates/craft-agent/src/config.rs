use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_VERSION: &str = "1.20.1";
const DEFAULT_MEMORY: &str = "2G";
const DEFAULT_BASE_PORT: u16 = 25565;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

/// Relative paths are anchored at the current directory; canonicalization is
/// best-effort because the directory may not exist yet.
pub fn absolutize(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub java_bin: String,
    pub default_version: String,
    pub default_memory: String,
    pub base_port: u16,
    pub stop_grace: Duration,
    pub restart_settle: Duration,
    pub metrics_interval: Duration,
    pub metrics_history: usize,
    pub metrics_error_backoff: Duration,
    pub console_replay_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
    pub cgroup_root: Option<PathBuf>,
}

impl AgentConfig {
    /// Built-in defaults rooted at `data_root`, ignoring the environment.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            java_bin: "java".to_string(),
            default_version: DEFAULT_VERSION.to_string(),
            default_memory: DEFAULT_MEMORY.to_string(),
            base_port: DEFAULT_BASE_PORT,
            stop_grace: Duration::from_secs(30),
            restart_settle: Duration::from_secs(2),
            metrics_interval: Duration::from_secs(1),
            metrics_history: 300,
            metrics_error_backoff: Duration::from_secs(5),
            console_replay_lines: 100,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            cgroup_root: None,
        }
    }

    pub fn from_env() -> Self {
        let data_root = absolutize(PathBuf::from(
            env_string("CRAFT_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        ));
        let mut cfg = Self::with_data_root(data_root);

        if let Some(v) = env_string("CRAFT_JAVA_BIN") {
            cfg.java_bin = v;
        }
        if let Some(v) = env_string("MINECRAFT_VERSION") {
            cfg.default_version = v;
        }
        if let Some(v) = env_string("SERVER_MEMORY") {
            cfg.default_memory = v;
        }
        if let Some(v) = env_string("CRAFT_BASE_PORT").and_then(|v| v.parse::<u16>().ok())
            && v >= 1024
        {
            cfg.base_port = v;
        }
        if let Some(v) = env_u64("CRAFT_STOP_GRACE_SEC") {
            cfg.stop_grace = Duration::from_secs(v.clamp(1, 600));
        }
        if let Some(v) = env_u64("CRAFT_RESTART_SETTLE_MS") {
            cfg.restart_settle = Duration::from_millis(v.clamp(0, 60_000));
        }
        if let Some(v) = env_u64("CRAFT_METRICS_INTERVAL_MS") {
            cfg.metrics_interval = Duration::from_millis(v.clamp(100, 60_000));
        }
        if let Some(v) = env_usize("CRAFT_METRICS_HISTORY") {
            cfg.metrics_history = v.clamp(10, 86_400);
        }
        if let Some(v) = env_u64("CRAFT_METRICS_BACKOFF_MS") {
            cfg.metrics_error_backoff = Duration::from_millis(v.clamp(100, 10 * 60 * 1000));
        }
        if let Some(v) = env_usize("CRAFT_CONSOLE_REPLAY_LINES") {
            cfg.console_replay_lines = v.clamp(0, 10_000);
        }
        if let Some(v) = env_u64("CRAFT_LOG_FILE_MAX_BYTES") {
            // 0 disables rotation.
            cfg.log_file_max_bytes = if v == 0 {
                0
            } else {
                v.clamp(256 * 1024, 1024 * 1024 * 1024)
            };
        }
        if let Some(v) = env_usize("CRAFT_LOG_FILE_MAX_FILES") {
            cfg.log_file_max_files = v.clamp(1, 20);
        }
        cfg.cgroup_root = env_string("CRAFT_CGROUP_ROOT").map(PathBuf::from);

        cfg
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root.join("servers.json")
    }

    pub fn instances_root(&self) -> PathBuf {
        self.data_root.join("servers")
    }
}

/// Per-instance file layout under the data root.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub root: PathBuf,
}

impl InstancePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Working directory of the game server process.
    pub fn server_dir(&self) -> PathBuf {
        self.root.join("minecraft")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn console_log(&self) -> PathBuf {
        self.logs_dir().join("server.log")
    }

    pub fn instance_config(&self) -> PathBuf {
        self.root.join("instance.json")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("scheduled_tasks.json")
    }

    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [self.server_dir(), self.backups_dir(), self.logs_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Write `data` next to `path` and rename it into place.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.flush().await?;
    f.sync_all().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AgentConfig::with_data_root("/tmp/craft");
        assert_eq!(cfg.base_port, 25565);
        assert_eq!(cfg.default_memory, "2G");
        assert_eq!(cfg.stop_grace, Duration::from_secs(30));
        assert_eq!(cfg.metrics_history, 300);
        assert_eq!(cfg.console_replay_lines, 100);
        assert_eq!(cfg.registry_path(), PathBuf::from("/tmp/craft/servers.json"));
    }

    #[test]
    fn instance_layout_paths() {
        let p = InstancePaths::new("/data/servers/abc");
        assert_eq!(p.server_dir(), PathBuf::from("/data/servers/abc/minecraft"));
        assert_eq!(
            p.console_log(),
            PathBuf::from("/data/servers/abc/logs/server.log")
        );
        assert_eq!(
            p.tasks_file(),
            PathBuf::from("/data/servers/abc/scheduled_tasks.json")
        );
    }

    #[tokio::test]
    async fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("nested").join("file.json.tmp").exists());
    }
}
