use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use craft_process::InstanceId;
use tokio::sync::{Mutex, OnceCell, watch};
use tokio::task::JoinHandle;

use crate::backup::BackupStore;
use crate::config::{AgentConfig, InstancePaths};
use crate::console::ConsoleBridge;
use crate::controller::ProcessController;
use crate::error::{Error, IoContext, Result};
use crate::registry::{InstanceStore, ServerInstance};
use crate::scheduler::TaskScheduler;
use crate::server_config::{self, ServerConfig};
use crate::telemetry::TelemetryCollector;

/// Addresses an instance either directly or through the current selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceRef {
    Current,
    Id(InstanceId),
}

impl FromStr for InstanceRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if s.is_empty() || s.eq_ignore_ascii_case("current") {
            InstanceRef::Current
        } else {
            InstanceRef::Id(InstanceId(s.to_string()))
        })
    }
}

impl From<InstanceId> for InstanceRef {
    fn from(id: InstanceId) -> Self {
        InstanceRef::Id(id)
    }
}

/// Everything that runs on behalf of one instance.
pub struct InstanceStack {
    id: InstanceId,
    paths: InstancePaths,
    controller: Arc<ProcessController>,
    console: ConsoleBridge,
    telemetry: Arc<TelemetryCollector>,
    scheduler: Arc<TaskScheduler>,
    backups: BackupStore,
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl InstanceStack {
    async fn build(agent: Arc<AgentConfig>, instance: &ServerInstance) -> Result<Arc<Self>> {
        let id = instance.id.clone();
        let paths = instance.paths();
        paths
            .ensure_layout()
            .io_context(|| format!("prepare {}", paths.root().display()))?;

        let (scope_tx, scope_rx) = watch::channel(None);
        let telemetry = Arc::new(TelemetryCollector::new(
            id.as_str(),
            agent.metrics_history,
            agent.metrics_interval,
            agent.metrics_error_backoff,
        ));
        let console = ConsoleBridge::new(
            id.as_str(),
            paths.console_log(),
            agent.console_replay_lines,
            agent.log_file_max_bytes,
            agent.log_file_max_files,
        )
        .with_observer(telemetry.clone());
        let controller = Arc::new(ProcessController::new(
            id.clone(),
            paths.clone(),
            agent,
            console.clone(),
            scope_tx,
        ));
        let backups = BackupStore::new(&paths);
        let scheduler =
            TaskScheduler::load(id.as_str(), paths.tasks_file(), controller.clone(), backups.clone())
                .await?;

        let loops = vec![telemetry.spawn(scope_rx), scheduler.spawn()];
        tracing::info!(instance_id = %id, "instance stack ready");

        Ok(Arc::new(Self {
            id,
            paths,
            controller,
            console,
            telemetry,
            scheduler,
            backups,
            loops: std::sync::Mutex::new(loops),
        }))
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn paths(&self) -> &InstancePaths {
        &self.paths
    }

    pub fn controller(&self) -> &Arc<ProcessController> {
        &self.controller
    }

    pub fn console(&self) -> &ConsoleBridge {
        &self.console
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub async fn get_config(&self) -> Result<ServerConfig> {
        server_config::load(&self.paths).await
    }

    /// Save game settings. The port is owned by the registry and changes
    /// only through `InstanceOrchestrator::update_instance`.
    pub async fn update_config(&self, mut cfg: ServerConfig) -> Result<ServerConfig> {
        let current = server_config::load(&self.paths).await?;
        cfg.server_port = current.server_port;
        server_config::save(&self.paths, &cfg).await?;
        Ok(cfg)
    }

    /// Stop if needed, swap the server directory for the snapshot, and start
    /// again if it was running. Not transactional.
    pub async fn restore_backup(&self, name: &str) -> Result<()> {
        self.backups.existing(name)?;

        let was_running = self.controller.is_running().await;
        if was_running {
            self.controller.stop().await?;
        }
        self.console
            .emit_note(format!("restoring backup {name}"))
            .await;
        self.backups.restore_into_server_dir(name).await?;
        if was_running {
            self.controller.start().await?;
        }
        Ok(())
    }

    async fn teardown(&self) {
        match self.controller.stop().await {
            Ok(()) | Err(Error::InvalidTransition { .. }) => {}
            Err(e) => tracing::warn!(instance_id = %self.id, error = %e, "stop during teardown failed"),
        }
        let loops = match self.loops.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in loops {
            handle.abort();
        }
        tracing::info!(instance_id = %self.id, "instance stack torn down");
    }
}

type StackCell = Arc<OnceCell<Arc<InstanceStack>>>;

/// Owns the registry and one lazily built stack per instance.
pub struct InstanceOrchestrator {
    agent: Arc<AgentConfig>,
    store: InstanceStore,
    /// The map lock is only held to look up or insert a cell; builds run
    /// inside the cell so one instance never blocks another.
    stacks: Mutex<HashMap<InstanceId, StackCell>>,
}

impl InstanceOrchestrator {
    pub async fn new(agent: AgentConfig) -> Result<Self> {
        let store = InstanceStore::load(&agent).await?;
        Ok(Self {
            agent: Arc::new(agent),
            store,
            stacks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.agent
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub async fn list_instances(&self) -> Vec<ServerInstance> {
        self.store.list().await
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Result<ServerInstance> {
        self.store.get(id).await
    }

    pub async fn current_instance(&self) -> Result<ServerInstance> {
        let id = self
            .store
            .current_id()
            .await
            .ok_or_else(|| Error::not_found("instance", "current"))?;
        self.store.get(&id).await
    }

    /// Register a new instance and write its initial game settings.
    pub async fn create_instance(
        &self,
        name: &str,
        port: Option<u16>,
        version: Option<String>,
    ) -> Result<ServerInstance> {
        let instance = self.store.create(name, port).await?;

        let cfg = ServerConfig {
            server_name: instance.name.clone(),
            server_port: instance.port,
            minecraft_version: version.filter(|v| !v.trim().is_empty()),
            ..ServerConfig::default()
        };
        if let Err(e) = server_config::save(&instance.paths(), &cfg).await {
            if let Err(rollback) = self.store.delete(&instance.id).await {
                tracing::warn!(instance_id = %instance.id, error = %rollback, "rollback of failed create failed");
            }
            return Err(e);
        }
        Ok(instance)
    }

    /// Rename and/or re-port an instance, mirroring the change into its settings.
    pub async fn update_instance(
        &self,
        id: &InstanceId,
        name: Option<&str>,
        port: Option<u16>,
    ) -> Result<ServerInstance> {
        let instance = self.store.update(id, name, port).await?;

        let paths = instance.paths();
        let mut cfg = server_config::load(&paths).await?;
        cfg.server_name = instance.name.clone();
        cfg.server_port = instance.port;
        server_config::save(&paths, &cfg).await?;
        Ok(instance)
    }

    /// Tear down the live stack, then drop the record. Files stay on disk.
    pub async fn delete_instance(&self, id: &InstanceId) -> Result<ServerInstance> {
        self.store.get(id).await?;

        let cell = self.stacks.lock().await.remove(id);
        if let Some(stack) = cell.as_ref().and_then(|c| c.get()) {
            stack.teardown().await;
        }
        self.store.delete(id).await
    }

    pub async fn select_current(&self, id: &InstanceId) -> Result<ServerInstance> {
        self.store.select_current(id).await
    }

    /// The stack for `target`, built on first use and cached afterwards.
    pub async fn resolve(&self, target: &InstanceRef) -> Result<Arc<InstanceStack>> {
        let id = match target {
            InstanceRef::Current => self
                .store
                .current_id()
                .await
                .ok_or_else(|| Error::not_found("instance", "current"))?,
            InstanceRef::Id(id) => id.clone(),
        };
        let instance = self.store.get(&id).await?;

        let cell = self
            .stacks
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .clone();
        let stack = cell
            .get_or_try_init(|| InstanceStack::build(self.agent.clone(), &instance))
            .await?
            .clone();

        // Deleted while the stack was being built.
        let still_registered = self
            .stacks
            .lock()
            .await
            .get(&id)
            .is_some_and(|c| Arc::ptr_eq(c, &cell));
        if !still_registered {
            stack.teardown().await;
            return Err(Error::not_found("instance", id.as_str()));
        }

        if let Err(e) = self.store.touch(&id).await {
            tracing::debug!(instance_id = %id, error = %e, "failed to record last access");
        }
        Ok(stack)
    }

    pub async fn live_instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .stacks
            .lock()
            .await
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop every running server and abort all background loops.
    pub async fn shutdown(&self) {
        let stacks: Vec<Arc<InstanceStack>> = self
            .stacks
            .lock()
            .await
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();
        for stack in stacks {
            stack.teardown().await;
        }
    }
}
