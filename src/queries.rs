//! The RPC-facing query layer.
//!
//! [`QueryLayer`] implements the plugin's v3 methods on top of the registry,
//! reading store, scheduler, and transaction store. Streaming methods write
//! into a caller-supplied [`StreamSink`]; the transport that frames and
//! ships those messages lives outside the core.
//!
//! Input validation failures are returned before any state changes: a write
//! against an unknown selector creates no transactions. Streaming methods
//! may emit partial results before an error terminates the stream.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use uuid::Uuid;

use crate::api::{
    Bounds, DeviceInfo, Metadata, PluginHealth, Reading, StreamSink, TestStatus,
    TransactionStatus, Version, WritePayload, WriteTransaction,
};
use crate::device::Device;
use crate::errors::{PluginError, PluginResult};
use crate::health::HealthManager;
use crate::plugin::PluginMetadata;
use crate::registry::{DeviceRegistry, DeviceSelector};
use crate::scheduler::Scheduler;
use crate::stop::StopSignal;
use crate::store::ReadingStore;
use crate::transaction::TransactionStore;
use crate::version::VersionInfo;

/// Construction record for the query layer.
pub struct QueryContext {
    pub registry: Arc<DeviceRegistry>,
    pub readings: Arc<ReadingStore>,
    pub transactions: Arc<TransactionStore>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthManager>,
    pub metadata: PluginMetadata,
    pub plugin_id: Uuid,
    pub version: VersionInfo,
    pub stop: StopSignal,
}

/// Serves the plugin's RPC methods.
pub struct QueryLayer {
    registry: Arc<DeviceRegistry>,
    readings: Arc<ReadingStore>,
    transactions: Arc<TransactionStore>,
    scheduler: Arc<Scheduler>,
    health: Arc<HealthManager>,
    metadata: PluginMetadata,
    plugin_id: Uuid,
    version: VersionInfo,
    stop: StopSignal,
}

fn sink_closed(e: anyhow::Error) -> PluginError {
    PluginError::StreamClosed(e.to_string())
}

impl QueryLayer {
    pub fn new(ctx: QueryContext) -> Self {
        Self {
            registry: ctx.registry,
            readings: ctx.readings,
            transactions: ctx.transactions,
            scheduler: ctx.scheduler,
            health: ctx.health,
            metadata: ctx.metadata,
            plugin_id: ctx.plugin_id,
            version: ctx.version,
            stop: ctx.stop,
        }
    }

    /// Reachability test.
    pub fn test(&self) -> TestStatus {
        TestStatus { ok: true }
    }

    pub fn version(&self) -> Version {
        Version::from(&self.version)
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            id: self.plugin_id.to_string(),
            tag: self.metadata.tag(),
            name: self.metadata.name.clone(),
            maintainer: self.metadata.maintainer.clone(),
            description: self.metadata.description.clone(),
            vcs: self.metadata.vcs.clone(),
        }
    }

    pub fn health(&self) -> PluginHealth {
        PluginHealth::from_checks(&self.health.statuses())
    }

    /// Resolve the selector and stream an info record per device.
    pub async fn devices<S>(&self, selector: &DeviceSelector, sink: &mut S) -> PluginResult<()>
    where
        S: StreamSink<DeviceInfo>,
    {
        for device in self.resolve_sorted(selector)? {
            let info = DeviceInfo::encode(&device, &self.plugin_id.to_string());
            sink.send(info).await.map_err(sink_closed)?;
        }
        Ok(())
    }

    /// Stream the current readings for the selected devices, in device
    /// order.
    pub async fn read<S>(&self, selector: &DeviceSelector, sink: &mut S) -> PluginResult<()>
    where
        S: StreamSink<Reading>,
    {
        for device in self.resolve_sorted(selector)? {
            let Some(readings) = self.readings.get(device.id()) else {
                continue;
            };
            for reading in &readings {
                sink.send(Reading::encode(device.id(), &device.kind, reading))
                    .await
                    .map_err(sink_closed)?;
            }
        }
        Ok(())
    }

    /// Stream archived readings within the bounds. Degrades to a
    /// current-value snapshot when the cache is disabled.
    pub async fn read_cache<S>(&self, bounds: Bounds, sink: &mut S) -> PluginResult<()>
    where
        S: StreamSink<Reading>,
    {
        if let Some(contexts) = self.readings.cached_window(bounds.start, bounds.end) {
            for ctx in contexts {
                let kind = self
                    .registry
                    .get(&ctx.device)
                    .map(|d| d.kind.clone())
                    .unwrap_or_default();
                for reading in &ctx.readings {
                    sink.send(Reading::encode(&ctx.device, &kind, reading))
                        .await
                        .map_err(sink_closed)?;
                }
            }
            return Ok(());
        }

        // Cache disabled: fall back to the current state of every device.
        let mut snapshot: Vec<_> = self.readings.snapshot().into_iter().collect();
        snapshot.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (device_id, readings) in snapshot {
            let kind = self
                .registry
                .get(&device_id)
                .map(|d| d.kind.clone())
                .unwrap_or_default();
            for reading in &readings {
                sink.send(Reading::encode(&device_id, &kind, reading))
                    .await
                    .map_err(sink_closed)?;
            }
        }
        Ok(())
    }

    /// Subscribe to live readings for the selected devices and stream them
    /// until the client goes away or the plugin stops.
    ///
    /// Per-device delivery is FIFO; no ordering holds across devices.
    pub async fn read_stream<S>(
        &self,
        selectors: &[DeviceSelector],
        sink: &mut S,
    ) -> PluginResult<()>
    where
        S: StreamSink<Reading>,
    {
        let mut ids: HashSet<String> = HashSet::new();
        let mut kinds = std::collections::HashMap::new();
        for selector in selectors {
            for device in self.registry.select(selector)? {
                ids.insert(device.id().to_string());
                kinds.insert(device.id().to_string(), device.kind.clone());
            }
        }
        if ids.is_empty() {
            return Err(PluginError::NoDeviceForSelector);
        }

        let mut rx = self.readings.subscribe();
        loop {
            tokio::select! {
                _ = self.stop.stopped() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(ctx) => {
                        if !ids.contains(&ctx.device) {
                            continue;
                        }
                        let kind = kinds.get(&ctx.device).cloned().unwrap_or_default();
                        for reading in &ctx.readings {
                            sink.send(Reading::encode(&ctx.device, &kind, reading))
                                .await
                                .map_err(sink_closed)?;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "read stream subscriber lagged");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Enqueue writes and return the created transactions without waiting.
    pub async fn write_async<S>(&self, payload: &WritePayload, sink: &mut S) -> PluginResult<()>
    where
        S: StreamSink<WriteTransaction>,
    {
        let device = self.resolve_write_device(&payload.selector)?;
        let transactions = self.scheduler.write(&device, &payload.data).await?;
        for txn in transactions {
            sink.send(WriteTransaction {
                id: txn.id().to_string(),
                device: device.id().to_string(),
            })
            .await
            .map_err(sink_closed)?;
        }
        Ok(())
    }

    /// Enqueue writes and await each transaction's terminal status, bounded
    /// by the transaction timeout.
    pub async fn write_sync<S>(&self, payload: &WritePayload, sink: &mut S) -> PluginResult<()>
    where
        S: StreamSink<TransactionStatus>,
    {
        let device = self.resolve_write_device(&payload.selector)?;
        let transactions = self.scheduler.write(&device, &payload.data).await?;
        for txn in transactions {
            if !txn.wait(txn.timeout()).await {
                warn!(id = txn.id(), "sync write wait timed out");
            }
            sink.send(TransactionStatus::from(txn.as_ref()))
                .await
                .map_err(sink_closed)?;
        }
        Ok(())
    }

    /// Status of a single transaction.
    pub fn transaction(&self, id: &str) -> PluginResult<TransactionStatus> {
        let txn = self.transactions.get(id)?;
        Ok(TransactionStatus::from(txn.as_ref()))
    }

    /// Stream the status of every live transaction, oldest first.
    pub async fn transactions<S>(&self, sink: &mut S) -> PluginResult<()>
    where
        S: StreamSink<TransactionStatus>,
    {
        for txn in self.transactions.list() {
            sink.send(TransactionStatus::from(txn.as_ref()))
                .await
                .map_err(sink_closed)?;
        }
        Ok(())
    }

    /// Writes address exactly one device and require an id (or alias)
    /// selector.
    fn resolve_write_device(&self, selector: &DeviceSelector) -> PluginResult<Arc<Device>> {
        let id = selector
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(PluginError::SelectorRequiresId)?;
        self.registry
            .find(id)
            .ok_or(PluginError::NoDeviceForSelector)
    }

    /// Resolve a selector and order the result deterministically by
    /// (sort index, id).
    fn resolve_sorted(&self, selector: &DeviceSelector) -> PluginResult<Vec<Arc<Device>>> {
        let mut devices = self.registry.select(selector)?;
        devices.sort_by(|a, b| {
            a.sort_index
                .cmp(&b.sort_index)
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(devices)
    }
}

impl From<&VersionInfo> for Version {
    fn from(v: &VersionInfo) -> Self {
        Self {
            plugin_version: v.plugin_version.clone(),
            sdk_version: v.sdk_version.clone(),
            build_date: v.build_date.clone(),
            git_commit: v.git_commit.clone(),
            git_tag: v.git_tag.clone(),
            language_version: v.language_version.clone(),
            os: v.os.clone(),
            arch: v.arch.clone(),
        }
    }
}
