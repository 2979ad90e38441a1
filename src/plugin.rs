//! The plugin: composition root and lifecycle.
//!
//! A [`Plugin`] ties the runtime together. The embedder creates one with
//! its metadata, configures it, registers handlers and devices (and
//! optionally pre/post-run actions), then calls [`Plugin::run`].
//!
//! Startup ordering: pre-run actions, registry freeze, background state
//! tasks, scheduler start (listeners first), then the network bind. Any
//! failure up to and including the bind is fatal and `run` returns the
//! error. Shutdown reverses it: the stop signal trips, the loops drain
//! (queued writes fail out as cancelled), post-run actions run (failures
//! logged, not fatal), and the listener is torn down.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::PluginConfig;
use crate::device::{Device, DeviceHandler};
use crate::errors::{PluginError, PluginResult};
use crate::health::HealthManager;
use crate::queries::{QueryContext, QueryLayer};
use crate::registry::DeviceRegistry;
use crate::scheduler::{Scheduler, SchedulerContext};
use crate::server::Server;
use crate::stop::StopSignal;
use crate::store::ReadingStore;
use crate::transaction::TransactionStore;
use crate::version::VersionInfo;

/// Capacity of the channel between the scheduler and the reading store.
const READ_CHANNEL_CAPACITY: usize = 128;

/// Identifying metadata for a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub maintainer: String,
    pub description: String,
    pub vcs: String,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, maintainer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            maintainer: maintainer.into(),
            description: String::new(),
            vcs: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_vcs(mut self, vcs: impl Into<String>) -> Self {
        self.vcs = vcs.into();
        self
    }

    /// The normalised plugin tag, `maintainer/name`, lowercased with
    /// whitespace and underscores dashed.
    pub fn tag(&self) -> String {
        let normalise = |s: &str| {
            s.to_lowercase()
                .replace(|c: char| c.is_whitespace() || c == '_', "-")
        };
        format!("{}/{}", normalise(&self.maintainer), normalise(&self.name))
    }
}

/// A named hook run before or after the plugin's main loops.
pub struct PluginAction {
    name: String,
    action: Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

impl PluginAction {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(move || Box::pin(action())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> anyhow::Result<()> {
        (self.action)().await
    }
}

/// A plugin instance.
///
/// All state is per-instance -- registry, stores, scheduler -- so multiple
/// plugins can coexist in one process (which the tests rely on).
pub struct Plugin {
    metadata: PluginMetadata,
    id: Uuid,
    version: VersionInfo,
    config: Option<PluginConfig>,
    registry: DeviceRegistry,
    health: Arc<HealthManager>,
    pre_run: Vec<PluginAction>,
    post_run: Vec<PluginAction>,
    stop: StopSignal,
    /// Test hook: relocate the unix socket directory.
    socket_dir: Option<std::path::PathBuf>,
}

impl Plugin {
    pub fn new(metadata: PluginMetadata) -> Self {
        // The plugin id is stable for a given metadata tag, which keeps
        // device ids stable across restarts.
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, metadata.tag().as_bytes());
        Self {
            metadata,
            id,
            version: VersionInfo::collect(),
            config: None,
            registry: DeviceRegistry::new(id),
            health: Arc::new(HealthManager::new()),
            pre_run: Vec::new(),
            post_run: Vec::new(),
            stop: StopSignal::new(),
            socket_dir: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Overlay plugin build information (version, git commit, build date).
    pub fn set_version(&mut self, info: VersionInfo) {
        self.version.merge(&info);
    }

    /// Set a pre-validated configuration.
    pub fn set_config(&mut self, config: PluginConfig) -> PluginResult<()> {
        config.validate()?;
        self.config = Some(config);
        Ok(())
    }

    /// Load configuration from the given TOML file (plus environment
    /// overrides) and use it.
    pub fn configure_from(&mut self, path: impl AsRef<std::path::Path>) -> PluginResult<()> {
        self.config = Some(PluginConfig::load(path)?);
        Ok(())
    }

    /// Load configuration from the default path, honoring the
    /// `PLUGIN_CONFIG` environment variable when set.
    pub fn configure(&mut self) -> PluginResult<()> {
        let path = std::env::var("PLUGIN_CONFIG")
            .unwrap_or_else(|_| crate::config::DEFAULT_CONFIG_PATH.to_string());
        self.configure_from(path)
    }

    pub fn register_device_handler(&mut self, handler: DeviceHandler) -> PluginResult<()> {
        self.registry.add_handler(handler)
    }

    /// Register a device instance. Returns the derived device id.
    pub fn register_device(&mut self, device: Device) -> PluginResult<String> {
        self.registry.add_device(device)
    }

    pub fn register_pre_run_action(&mut self, action: PluginAction) {
        self.pre_run.push(action);
    }

    pub fn register_post_run_action(&mut self, action: PluginAction) {
        self.post_run.push(action);
    }

    /// Handle for stopping the plugin from another task. Idempotent.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Test/embedder hook: resolve unix sockets under this directory
    /// instead of the process-wide default.
    pub fn with_socket_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// Run the plugin until interrupted (SIGINT) or stopped via
    /// [`Plugin::stop_signal`].
    pub async fn run(self) -> PluginResult<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Run the plugin until the given future resolves or the stop signal
    /// trips.
    pub async fn run_until<F>(mut self, shutdown: F) -> PluginResult<()>
    where
        F: Future<Output = ()>,
    {
        let config = self.config.take().ok_or(PluginError::ServerNeedsConfig)?;
        init_tracing(config.debug);

        let mut version = self.version.clone();
        version.merge(&VersionInfo {
            plugin_version: config.version.clone(),
            ..Default::default()
        });

        for action in &self.pre_run {
            info!(action = action.name(), "running pre-run action");
            action.run().await.map_err(|e| PluginError::Action {
                name: action.name().to_string(),
                message: e.to_string(),
            })?;
        }

        self.registry.freeze();
        let registry = Arc::new(std::mem::replace(
            &mut self.registry,
            DeviceRegistry::new(self.id),
        ));

        let readings = Arc::new(ReadingStore::new(config.settings.cache.clone()));
        let transactions = Arc::new(TransactionStore::new(config.settings.transaction.ttl()));
        let stop = self.stop.clone();

        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let updater = tokio::spawn(readings.clone().run_updater(read_rx, stop.clone()));
        let reaper = transactions.spawn_reaper(stop.clone());

        let scheduler = Scheduler::new(SchedulerContext {
            settings: config.settings.clone(),
            registry: registry.clone(),
            transactions: transactions.clone(),
            read_tx,
            stop: stop.clone(),
        });
        let health_task = scheduler.register_health_checks(&self.health)?;

        let query = Arc::new(QueryLayer::new(QueryContext {
            registry: registry.clone(),
            readings: readings.clone(),
            transactions: transactions.clone(),
            scheduler: scheduler.clone(),
            health: self.health.clone(),
            metadata: self.metadata.clone(),
            plugin_id: self.id,
            version,
            stop: stop.clone(),
        }));

        // Listeners first, then the loops.
        let mut tasks = scheduler.start();

        let mut server = Server::new(config.network.clone());
        if let Some(dir) = &self.socket_dir {
            server = server.with_socket_dir(dir);
        }
        let bound = match server.init() {
            Ok(()) => server.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = bound {
            // Bind failures are fatal; wind the background tasks down
            // before surfacing the error.
            stop.signal();
            tasks.join_loops().await;
            let _ = updater.await;
            let _ = reaper.await;
            let _ = health_task.await;
            tasks.abort_listeners();
            return Err(e);
        }

        self.log_info(&config, registry.as_ref());
        let serve = server.serve(query, stop.clone());

        tokio::select! {
            _ = shutdown => info!("shutdown signal received"),
            _ = stop.stopped() => info!("stop requested"),
        }

        // Wind down: loops drain, background tasks observe the signal.
        stop.signal();
        tasks.join_loops().await;
        let _ = updater.await;
        let _ = reaper.await;
        let _ = health_task.await;
        tasks.abort_listeners();

        for action in &self.post_run {
            info!(action = action.name(), "running post-run action");
            if let Err(e) = action.run().await {
                error!(action = action.name(), error = %e, "post-run action failed");
            }
        }

        serve.await?;
        info!("plugin stopped");
        Ok(())
    }

    fn log_info(&self, config: &PluginConfig, registry: &DeviceRegistry) {
        info!(
            name = %self.metadata.name,
            tag = %self.metadata.tag(),
            id = %self.id,
            sdk_version = %self.version.sdk_version,
            plugin_version = %config.version,
            os = %self.version.os,
            arch = %self.version.arch,
            devices = registry.device_count(),
            "plugin running"
        );
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    // Another subscriber may already be installed (tests, embedding apps).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkSettings, NetworkType};
    use crate::output::Reading;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> PluginConfig {
        let mut config = PluginConfig::default();
        config.settings.read.interval_ms = 10;
        config.network = NetworkSettings {
            kind: NetworkType::Unix,
            address: dir.join("plugin.sock").display().to_string(),
            tls: None,
        };
        config
    }

    #[test]
    fn test_metadata_tag_normalisation() {
        let meta = PluginMetadata::new("Test Plugin", "Vapor_IO");
        assert_eq!(meta.tag(), "vapor-io/test-plugin");
    }

    #[test]
    fn test_plugin_id_is_stable() {
        let a = Plugin::new(PluginMetadata::new("test", "vaporio"));
        let b = Plugin::new(PluginMetadata::new("test", "vaporio"));
        assert_eq!(a.id(), b.id());

        let c = Plugin::new(PluginMetadata::new("other", "vaporio"));
        assert_ne!(a.id(), c.id());
    }

    #[tokio::test]
    async fn test_run_requires_config() {
        let plugin = Plugin::new(PluginMetadata::new("test", "vaporio"));
        let result = plugin.run_until(async {}).await;
        assert!(matches!(result, Err(PluginError::ServerNeedsConfig)));
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("plugin.sock");

        let mut plugin = Plugin::new(PluginMetadata::new("test", "vaporio"));
        plugin.set_config(test_config(dir.path())).unwrap();
        plugin
            .register_device_handler(
                DeviceHandler::builder("temperature")
                    .read(|_| async { Ok(vec![Reading::new("temperature", 20)]) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        plugin
            .register_device(Device::new("temperature", "temperature"))
            .unwrap();

        let stop = plugin.stop_signal();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.signal();
        });

        tokio::time::timeout(Duration::from_secs(5), plugin.run_until(std::future::pending()))
            .await
            .expect("run should return after stop")
            .unwrap();
        stopper.await.unwrap();

        // The unix socket was cleaned up on teardown.
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_failing_pre_run_action_aborts_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = Plugin::new(PluginMetadata::new("test", "vaporio"));
        plugin.set_config(test_config(dir.path())).unwrap();
        plugin.register_pre_run_action(PluginAction::new("explode", || async {
            anyhow::bail!("boom")
        }));

        let result = plugin.run_until(async {}).await;
        assert!(matches!(result, Err(PluginError::Action { .. })));
    }

    #[tokio::test]
    async fn test_post_run_actions_run_on_shutdown() {
        static RAN: AtomicBool = AtomicBool::new(false);

        let dir = tempfile::tempdir().unwrap();
        let mut plugin = Plugin::new(PluginMetadata::new("test", "vaporio"));
        plugin.set_config(test_config(dir.path())).unwrap();
        plugin.register_post_run_action(PluginAction::new("flag", || async {
            RAN.store(true, Ordering::SeqCst);
            Ok(())
        }));

        plugin
            .run_until(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await
            .unwrap();
        assert!(RAN.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_set_config_validates() {
        let mut plugin = Plugin::new(PluginMetadata::new("test", "vaporio"));
        let mut config = PluginConfig::default();
        config.settings.write.queue_size = 0;
        assert!(plugin.set_config(config).is_err());
    }
}
