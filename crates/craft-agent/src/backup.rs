//! Directory-tree snapshots of an instance's server directory.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, Utc};

use crate::config::InstancePaths;
use crate::error::{Error, IoContext, Result};

const PREFIX: &str = "backup_";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub path: PathBuf,
}

/// A backup name must be a single plain path component.
pub fn validate_name(name: &str) -> Result<()> {
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) if !name.is_empty() => Ok(()),
        _ => Err(Error::InvalidArgument(format!("invalid backup name: {name:?}"))),
    }
}

fn skipped(path: &Path, is_dir: bool) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };
    if is_dir {
        name == "logs"
    } else {
        name.ends_with(".log")
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let ty = entry.file_type()?;
        if ty.is_symlink() {
            continue;
        }
        let dst = to.join(entry.file_name());
        if ty.is_dir() {
            if !skipped(&src, true) {
                copy_tree(&src, &dst)?;
            }
        } else if ty.is_file() && !skipped(&src, false) {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

fn tree_size(path: &Path) -> u64 {
    let Ok(rd) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in rd.flatten() {
        let Ok(ty) = entry.file_type() else {
            continue;
        };
        if ty.is_dir() {
            total = total.saturating_add(tree_size(&entry.path()));
        } else if ty.is_file() {
            total = total.saturating_add(entry.metadata().map(|m| m.len()).unwrap_or(0));
        }
    }
    total
}

fn info_for(path: PathBuf) -> Option<BackupInfo> {
    let name = path.file_name()?.to_str()?.to_string();
    let meta = std::fs::metadata(&path).ok()?;
    if !meta.is_dir() || !name.starts_with(PREFIX) {
        return None;
    }
    let created_at = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Some(BackupInfo {
        name,
        created_at,
        size_bytes: tree_size(&path),
        path,
    })
}

/// Clear everything in `server_dir` except `logs/`, then copy `snapshot` in.
fn restore_tree(snapshot: &Path, server_dir: &Path) -> std::io::Result<()> {
    if server_dir.is_dir() {
        for entry in std::fs::read_dir(server_dir)? {
            let entry = entry?;
            let path = entry.path();
            let ty = entry.file_type()?;
            if ty.is_dir() && !ty.is_symlink() {
                if entry.file_name() == "logs" {
                    continue;
                }
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }
    copy_tree(snapshot, server_dir)
}

async fn blocking<T, F>(what: String, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io {
            context: what.clone(),
            source: std::io::Error::other(e),
        })?
        .io_context(|| what)
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    server_dir: PathBuf,
    backups_dir: PathBuf,
}

impl BackupStore {
    pub fn new(paths: &InstancePaths) -> Self {
        Self {
            server_dir: paths.server_dir(),
            backups_dir: paths.backups_dir(),
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Snapshot the server directory, skipping log files.
    pub async fn create(&self) -> Result<BackupInfo> {
        let server_dir = self.server_dir.clone();
        let backups_dir = self.backups_dir.clone();
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

        let path = blocking(format!("create backup in {}", backups_dir.display()), move || {
            std::fs::create_dir_all(&backups_dir)?;
            let base = format!("{PREFIX}{stamp}");
            let mut target = backups_dir.join(&base);
            let mut n = 1u32;
            while target.exists() {
                target = backups_dir.join(format!("{base}_{n}"));
                n += 1;
            }
            if server_dir.is_dir() {
                copy_tree(&server_dir, &target)?;
            } else {
                std::fs::create_dir_all(&target)?;
            }
            Ok(target)
        })
        .await?;

        let info = tokio::task::spawn_blocking(move || info_for(path))
            .await
            .ok()
            .flatten()
            .ok_or_else(|| Error::Io {
                context: "inspect new backup".into(),
                source: std::io::Error::other("backup vanished after creation"),
            })?;
        tracing::info!(backup = %info.name, size_bytes = info.size_bytes, "backup created");
        Ok(info)
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<BackupInfo>> {
        let dir = self.backups_dir.clone();
        blocking(format!("list {}", dir.display()), move || {
            let rd = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut out: Vec<BackupInfo> = rd.flatten().filter_map(|e| info_for(e.path())).collect();
            out.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.name.cmp(&a.name))
            });
            Ok(out)
        })
        .await
    }

    pub(crate) fn existing(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let path = self.backups_dir.join(name);
        if !path.is_dir() {
            return Err(Error::not_found("backup", name));
        }
        Ok(path)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.existing(name)?;
        tokio::fs::remove_dir_all(&path)
            .await
            .io_context(|| format!("delete {}", path.display()))?;
        tracing::info!(backup = name, "backup deleted");
        Ok(())
    }

    /// Replace the server directory with a snapshot. Callers must make sure
    /// the server is stopped; a failure midway leaves a partial tree.
    pub async fn restore_into_server_dir(&self, name: &str) -> Result<()> {
        let snapshot = self.existing(name)?;
        let server_dir = self.server_dir.clone();
        blocking(format!("restore {}", snapshot.display()), move || {
            restore_tree(&snapshot, &server_dir)
        })
        .await?;
        tracing::info!(backup = name, "backup restored");
        Ok(())
    }
}
