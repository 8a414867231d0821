//! Shared fixtures: an isolated data root and a shell script that behaves
//! enough like a Minecraft server for lifecycle tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use craft_agent::AgentConfig;
use craft_agent::console::ConsoleBridge;

/// Echoes input, reports TPS, exits on `stop` or at EOF. `crash` exits non-zero.
pub const WELL_BEHAVED: &str = r#"#!/bin/sh
echo "Starting minecraft server version test"
echo "Done (0.1s)! For help, type \"help\""
echo "TPS from last 1m, 5m, 15m: 19.5, 20.0, 20.0"
while IFS= read -r line; do
  echo "[Server thread/INFO]: got: $line"
  if [ "$line" = "stop" ]; then
    echo "Stopping the server"
    exit 0
  fi
  if [ "$line" = "crash" ]; then
    echo "Exception in server tick loop" >&2
    exit 3
  fi
done
exit 0
"#;

/// Ignores `stop` and keeps running after stdin closes.
pub const STUBBORN: &str = r#"#!/bin/sh
echo "Done (0.1s)! For help, type \"help\""
while IFS= read -r line; do
  echo "ignoring: $line"
done
while true; do
  sleep 1
done
"#;

/// Leaves a background child holding stdout after a clean exit.
pub const LEAVES_CHILD: &str = r#"#!/bin/sh
sleep 20 &
echo "Done (0.1s)! For help, type \"help\""
while IFS= read -r line; do
  if [ "$line" = "stop" ]; then
    exit 0
  fi
done
exit 0
"#;

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub java: PathBuf,
}

impl Fixture {
    pub fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let java = dir.path().join("fake-java");
        write_script(&java, script);
        Self { dir, java }
    }

    pub fn data_root(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn config(&self) -> AgentConfig {
        let mut cfg = AgentConfig::with_data_root(self.data_root());
        cfg.java_bin = self.java.display().to_string();
        cfg.stop_grace = Duration::from_secs(5);
        cfg.restart_settle = Duration::from_millis(50);
        cfg.metrics_interval = Duration::from_millis(100);
        cfg
    }
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(not(unix))]
fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

/// The launcher only needs the jar to exist.
pub fn install_server_jar(server_dir: &Path) {
    std::fs::create_dir_all(server_dir).unwrap();
    std::fs::write(server_dir.join("server.jar"), b"").unwrap();
}

pub async fn wait_for_console(console: &ConsoleBridge, needle: &str) -> Vec<String> {
    for _ in 0..500 {
        let lines = console.recent_lines(500).await.unwrap();
        if lines.iter().any(|l| l.contains(needle)) {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("console never showed {needle:?}");
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
