//! The v3 API surface: request/response message shapes and the stream sink
//! abstraction.
//!
//! The runtime does not own a wire transport. Streaming RPC methods write
//! their results into a [`StreamSink`] supplied by the transport layer; the
//! message types here define the shapes that cross that boundary, mirroring
//! the upstream service's v3 protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::Device;
use crate::health::CheckStatus;
use crate::output::{rfc3339_now, Reading as DeviceReading, Unit, Value, WriteData};
use crate::registry::DeviceSelector;
use crate::transaction::{Transaction, WriteStatus};

// =============================================================================
// Stream sinks
// =============================================================================

/// Consumer half of a streaming RPC response.
///
/// A sink error terminates the stream; messages already sent may have been
/// delivered (partial results are allowed).
#[async_trait]
pub trait StreamSink<T>: Send {
    async fn send(&mut self, item: T) -> anyhow::Result<()>;
}

/// A sink that collects everything it receives. Useful for tests and for
/// transports that buffer whole responses.
#[derive(Debug, Default)]
pub struct VecSink<T> {
    pub items: Vec<T>,
}

impl<T> VecSink<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }
}

#[async_trait]
impl<T: Send> StreamSink<T> for VecSink<T> {
    async fn send(&mut self, item: T) -> anyhow::Result<()> {
        self.items.push(item);
        Ok(())
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Read request: resolve the selector and stream current readings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadRequest {
    #[serde(default)]
    pub selector: DeviceSelector,
}

/// Live-stream request: subscribe to readings for the selected devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    #[serde(default)]
    pub selectors: Vec<DeviceSelector>,
}

/// Time window for cached reads. Bounds are inclusive; a missing bound
/// leaves that side open.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// A write request: data to apply to the selected device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WritePayload {
    #[serde(default)]
    pub selector: DeviceSelector,
    pub data: Vec<WriteData>,
}

/// Selects a single transaction by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionSelector {
    pub id: String,
}

// =============================================================================
// Responses
// =============================================================================

/// Response to the reachability test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStatus {
    pub ok: bool,
}

/// Version and build information, as reported by the Version RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub plugin_version: String,
    pub sdk_version: String,
    pub build_date: String,
    pub git_commit: String,
    pub git_tag: String,
    pub language_version: String,
    pub os: String,
    pub arch: String,
}

/// Plugin identity, as reported by the Metadata RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Plugin UUID.
    pub id: String,
    /// Normalised "maintainer/name" tag.
    pub tag: String,
    pub name: String,
    pub maintainer: String,
    pub description: String,
    pub vcs: String,
}

/// Overall plugin health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    PartiallyDegraded,
    Failing,
}

/// One health check in the Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Health summary over all registered checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginHealth {
    pub timestamp: String,
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
}

impl PluginHealth {
    /// Summarise the current state of the health catalog.
    pub fn from_checks(statuses: &[CheckStatus]) -> Self {
        let failing = statuses.iter().filter(|s| !s.ok).count();
        let status = if failing == 0 {
            HealthStatus::Ok
        } else if failing == statuses.len() {
            HealthStatus::Failing
        } else {
            HealthStatus::PartiallyDegraded
        };
        Self {
            timestamp: rfc3339_now(),
            status,
            checks: statuses
                .iter()
                .map(|s| HealthCheck {
                    name: s.name.clone(),
                    status: if s.ok {
                        HealthStatus::Ok
                    } else {
                        HealthStatus::Failing
                    },
                    message: s.message.clone(),
                    timestamp: s.timestamp.clone(),
                    kind: s.kind.clone(),
                })
                .collect(),
        }
    }
}

/// Write capability detail on device info.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCapability {
    pub actions: Vec<String>,
}

/// Capability summary on device info. Mode is "r", "w", "rw", or "".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub mode: String,
    pub write: WriteCapability,
}

/// One device record in the Devices response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub timestamp: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// UUID of the owning plugin.
    pub plugin: String,
    pub info: String,
    pub alias: String,
    pub capabilities: DeviceCapabilities,
    /// String forms of the device's tags, including the id tag.
    pub tags: Vec<String>,
    pub sort_index: i32,
}

impl DeviceInfo {
    pub fn encode(device: &Device, plugin_id: &str) -> Self {
        let mode = match (device.is_readable(), device.is_writable()) {
            (true, true) => "rw",
            (true, false) => "r",
            (false, true) => "w",
            (false, false) => "",
        };
        // Actions are only advertised for writable devices.
        let actions = if device.is_writable() {
            device
                .handler()
                .map(|h| h.actions().to_vec())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Self {
            timestamp: rfc3339_now(),
            id: device.id().to_string(),
            kind: device.kind.clone(),
            plugin: plugin_id.to_string(),
            info: device.info.clone(),
            alias: device.alias.clone().unwrap_or_default(),
            capabilities: DeviceCapabilities {
                mode: mode.to_string(),
                write: WriteCapability { actions },
            },
            tags: device.tags.iter().map(|t| t.to_string()).collect(),
            sort_index: device.sort_index,
        }
    }
}

/// One reading in a Read/ReadCache/ReadStream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// ID of the device the reading came from.
    pub device: String,
    /// Type of that device.
    pub device_type: String,
    /// The reading type label.
    #[serde(rename = "type")]
    pub kind: String,
    pub unit: Option<Unit>,
    pub timestamp: String,
    pub value: Value,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl Reading {
    pub fn encode(device_id: &str, device_type: &str, reading: &DeviceReading) -> Self {
        Self {
            device: device_id.to_string(),
            device_type: device_type.to_string(),
            kind: reading.kind.clone(),
            unit: reading.unit.clone(),
            timestamp: reading.timestamp.clone(),
            value: reading.value.clone(),
            context: reading.context.clone(),
        }
    }
}

/// Acknowledgement of one enqueued write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTransaction {
    /// ID of the transaction tracking the write.
    pub id: String,
    /// ID of the device being written.
    pub device: String,
}

/// Point-in-time view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub id: String,
    pub created: String,
    pub updated: String,
    pub message: String,
    pub timeout: String,
    pub status: WriteStatus,
    /// Tag describing the write payload.
    pub context: String,
}

impl From<&Transaction> for TransactionStatus {
    fn from(txn: &Transaction) -> Self {
        Self {
            id: txn.id().to_string(),
            created: txn.created().to_string(),
            updated: txn.updated(),
            message: txn.message(),
            timeout: format!("{:?}", txn.timeout()),
            status: txn.status(),
            context: txn.payload().to_string(),
        }
    }
}
