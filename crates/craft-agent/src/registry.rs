use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use craft_process::InstanceId;
use tokio::sync::Mutex;

use crate::config::{AgentConfig, InstancePaths, write_atomic};
use crate::error::{Error, IoContext, Result};

const DEFAULT_INSTANCE_NAME: &str = "Default Server";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerInstance {
    pub id: InstanceId,
    pub name: String,
    pub port: u16,
    pub directory: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl ServerInstance {
    pub fn paths(&self) -> InstancePaths {
        InstancePaths::new(&self.directory)
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct RegistryFile {
    #[serde(default)]
    servers: Vec<ServerInstance>,
    #[serde(default)]
    current_server_id: Option<InstanceId>,
}

impl RegistryFile {
    fn find(&self, id: &InstanceId) -> Option<&ServerInstance> {
        self.servers.iter().find(|s| &s.id == id)
    }

    fn find_mut(&mut self, id: &InstanceId) -> Option<&mut ServerInstance> {
        self.servers.iter_mut().find(|s| &s.id == id)
    }

    fn port_owner(&self, port: u16) -> Option<&ServerInstance> {
        self.servers.iter().find(|s| s.port == port)
    }

    /// Lowest port at or above `base` that no instance holds.
    fn lowest_free_port(&self, base: u16) -> Result<u16> {
        let used: HashSet<u16> = self.servers.iter().map(|s| s.port).collect();
        let mut port = base;
        while used.contains(&port) {
            port = port
                .checked_add(1)
                .ok_or_else(|| Error::InvalidArgument(format!("no free port at or above {base}")))?;
        }
        Ok(port)
    }
}

/// Durable registry of server instances plus the current selection.
///
/// Every mutation is applied to a copy, written to disk, and only then made
/// visible, so a failed write leaves the registry unchanged.
#[derive(Debug)]
pub struct InstanceStore {
    path: PathBuf,
    instances_root: PathBuf,
    base_port: u16,
    state: Mutex<RegistryFile>,
}

impl InstanceStore {
    pub async fn load(config: &AgentConfig) -> Result<Self> {
        let path = config.registry_path();
        let file = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<RegistryFile>(&raw) {
                Ok(v) => v,
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "instance registry is unreadable; moving it aside and starting fresh"
                    );
                    tokio::fs::rename(&path, &aside)
                        .await
                        .io_context(|| format!("move aside {}", path.display()))?;
                    RegistryFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => {
                return Err(Error::Io {
                    context: format!("read {}", path.display()),
                    source: e,
                });
            }
        };

        let store = Self {
            path,
            instances_root: config.instances_root(),
            base_port: config.base_port,
            state: Mutex::new(file),
        };
        store.heal().await?;
        Ok(store)
    }

    /// Guarantees at least one instance exists and exactly one is current.
    async fn heal(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let mut changed = false;

        if next.servers.is_empty() {
            let default = self.new_instance(&next, DEFAULT_INSTANCE_NAME, None).await?;
            tracing::info!(instance_id = %default.id, port = default.port, "created default instance");
            next.current_server_id = Some(default.id.clone());
            next.servers.push(default);
            changed = true;
        }

        let current_valid = next
            .current_server_id
            .as_ref()
            .is_some_and(|id| next.find(id).is_some());
        if !current_valid {
            next.current_server_id = next.servers.first().map(|s| s.id.clone());
            changed = true;
        }

        if changed {
            self.persist(&next).await?;
            *guard = next;
        }
        Ok(())
    }

    async fn persist(&self, file: &RegistryFile) -> Result<()> {
        let data = serde_json::to_vec_pretty(file).io_context(|| "serialize registry".into())?;
        write_atomic(&self.path, &data)
            .await
            .io_context(|| format!("write {}", self.path.display()))
    }

    async fn new_instance(
        &self,
        file: &RegistryFile,
        name: &str,
        port: Option<u16>,
    ) -> Result<ServerInstance> {
        let port = match port {
            Some(0) => return Err(Error::InvalidArgument("port must be non-zero".into())),
            Some(p) => {
                if file.port_owner(p).is_some() {
                    return Err(Error::PortInUse(p));
                }
                p
            }
            None => file.lowest_free_port(self.base_port)?,
        };

        let id = InstanceId::new();
        let directory = self.instances_root.join(id.as_str());
        let paths = InstancePaths::new(&directory);
        tokio::task::spawn_blocking(move || paths.ensure_layout())
            .await
            .map_err(|e| Error::Io {
                context: "create instance layout".into(),
                source: std::io::Error::other(e),
            })?
            .io_context(|| format!("create {}", directory.display()))?;

        let now = Utc::now();
        Ok(ServerInstance {
            id,
            name: name.to_string(),
            port,
            directory,
            created_at: now,
            last_accessed: now,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<ServerInstance> {
        self.state.lock().await.servers.clone()
    }

    pub async fn get(&self, id: &InstanceId) -> Result<ServerInstance> {
        self.state
            .lock()
            .await
            .find(id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", id.as_str()))
    }

    pub async fn current_id(&self) -> Option<InstanceId> {
        self.state.lock().await.current_server_id.clone()
    }

    pub async fn create(&self, name: &str, port: Option<u16>) -> Result<ServerInstance> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument("name must be non-empty".into()));
        }

        let mut guard = self.state.lock().await;
        let instance = self.new_instance(&guard, name, port).await?;
        let mut next = guard.clone();
        next.servers.push(instance.clone());
        if next.current_server_id.is_none() {
            next.current_server_id = Some(instance.id.clone());
        }
        self.persist(&next).await?;
        *guard = next;

        tracing::info!(instance_id = %instance.id, port = instance.port, name, "instance created");
        Ok(instance)
    }

    pub async fn update(
        &self,
        id: &InstanceId,
        name: Option<&str>,
        port: Option<u16>,
    ) -> Result<ServerInstance> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();

        if let Some(p) = port {
            if p == 0 {
                return Err(Error::InvalidArgument("port must be non-zero".into()));
            }
            if next.port_owner(p).is_some_and(|s| &s.id != id) {
                return Err(Error::PortInUse(p));
            }
        }

        let inst = next
            .find_mut(id)
            .ok_or_else(|| Error::not_found("instance", id.as_str()))?;
        if let Some(n) = name.map(str::trim).filter(|n| !n.is_empty()) {
            inst.name = n.to_string();
        }
        if let Some(p) = port {
            inst.port = p;
        }
        let updated = inst.clone();

        self.persist(&next).await?;
        *guard = next;
        Ok(updated)
    }

    /// Removes the record (the directory is left on disk). If it was current,
    /// the first remaining instance becomes current, or a fresh default is
    /// created when none remain.
    pub async fn delete(&self, id: &InstanceId) -> Result<ServerInstance> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();

        let idx = next
            .servers
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| Error::not_found("instance", id.as_str()))?;
        let removed = next.servers.remove(idx);

        if next.current_server_id.as_ref() == Some(id) {
            next.current_server_id = next.servers.first().map(|s| s.id.clone());
        }
        if next.servers.is_empty() {
            let default = self.new_instance(&next, DEFAULT_INSTANCE_NAME, None).await?;
            tracing::info!(instance_id = %default.id, "registry emptied; created default instance");
            next.current_server_id = Some(default.id.clone());
            next.servers.push(default);
        }

        self.persist(&next).await?;
        *guard = next;

        tracing::info!(instance_id = %removed.id, "instance deleted");
        Ok(removed)
    }

    pub async fn select_current(&self, id: &InstanceId) -> Result<ServerInstance> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let inst = next
            .find_mut(id)
            .ok_or_else(|| Error::not_found("instance", id.as_str()))?;
        inst.last_accessed = Utc::now();
        let selected = inst.clone();
        next.current_server_id = Some(id.clone());

        self.persist(&next).await?;
        *guard = next;
        Ok(selected)
    }

    pub async fn touch(&self, id: &InstanceId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let inst = next
            .find_mut(id)
            .ok_or_else(|| Error::not_found("instance", id.as_str()))?;
        inst.last_accessed = Utc::now();

        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &Path) -> InstanceStore {
        InstanceStore::load(&AgentConfig::with_data_root(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn empty_registry_heals_with_default_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let all = store.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, DEFAULT_INSTANCE_NAME);
        assert_eq!(all[0].port, 25565);
        assert_eq!(store.current_id().await, Some(all[0].id.clone()));
        assert!(all[0].paths().server_dir().is_dir());
        assert!(store.path().is_file());
    }

    #[tokio::test]
    async fn create_allocates_lowest_unused_port() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;

        let a = store.create("A", Some(25567)).await.unwrap();
        let b = store.create("B", None).await.unwrap();
        let c = store.create("C", None).await.unwrap();
        assert_eq!(a.port, 25567);
        assert_eq!(b.port, 25566);
        assert_eq!(c.port, 25568);
    }

    #[tokio::test]
    async fn explicit_port_collision_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.create("A", Some(25566)).await.unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let err = store.create("B", Some(25566)).await.unwrap_err();
        assert!(matches!(err, Error::PortInUse(25566)));
        assert_eq!(store.list().await.len(), 2);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn update_rejects_port_held_by_other_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let a = store.create("A", Some(25566)).await.unwrap();
        let b = store.create("B", Some(25567)).await.unwrap();

        assert!(matches!(
            store.update(&b.id, None, Some(25566)).await,
            Err(Error::PortInUse(25566))
        ));
        // Re-asserting its own port is fine.
        let same = store.update(&a.id, Some("A2"), Some(25566)).await.unwrap();
        assert_eq!(same.name, "A2");
    }

    #[tokio::test]
    async fn deleting_current_moves_selection_or_recreates_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path()).await;
        let default_id = store.current_id().await.unwrap();
        let b = store.create("B", None).await.unwrap();

        store.delete(&default_id).await.unwrap();
        assert_eq!(store.current_id().await, Some(b.id.clone()));

        store.delete(&b.id).await.unwrap();
        let all = store.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, DEFAULT_INSTANCE_NAME);
        assert_eq!(store.current_id().await, Some(all[0].id.clone()));

        let missing = store.delete(&b.id).await.unwrap_err();
        assert_eq!(missing.code(), "not_found");
    }

    #[tokio::test]
    async fn registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let created = {
            let store = store_in(dir.path()).await;
            let x = store.create("X", Some(26000)).await.unwrap();
            store.select_current(&x.id).await.unwrap();
            x
        };

        let store = store_in(dir.path()).await;
        assert_eq!(store.current_id().await, Some(created.id.clone()));
        assert_eq!(store.get(&created.id).await.unwrap().port, 26000);
    }

    #[tokio::test]
    async fn corrupt_registry_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("servers.json"), b"{not json").unwrap();
        let store = store_in(dir.path()).await;
        assert_eq!(store.list().await.len(), 1);
        assert!(dir.path().join("servers.json.corrupt").exists());
    }
}
