//! Devices and device handlers.
//!
//! A [`DeviceHandler`] is a named capability set shared by a family of
//! devices: up to four optional operations (read, bulk read, write, listen)
//! plus the write actions it understands. A [`Device`] is one addressable
//! instance bound to a handler by name at registration time.
//!
//! Handlers are built through [`DeviceHandler::builder`], which makes the
//! read/bulk-read exclusivity rule a registration-time error instead of a
//! silently ignored field: a handler may define `read` or `bulk_read`, never
//! both.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::errors::{PluginError, PluginResult};
use crate::output::{ReadContext, Reading, WriteData};
use crate::tag::Tag;
use crate::transform::Transformer;

/// Handler operation: read a single device.
pub type ReadFn =
    Arc<dyn Fn(Arc<Device>) -> BoxFuture<'static, Result<Vec<Reading>>> + Send + Sync>;

/// Handler operation: read all of the handler's devices at once.
pub type BulkReadFn =
    Arc<dyn Fn(Vec<Arc<Device>>) -> BoxFuture<'static, Result<Vec<ReadContext>>> + Send + Sync>;

/// Handler operation: write data to a device.
pub type WriteFn =
    Arc<dyn Fn(Arc<Device>, WriteData) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler operation: push readings from the device into the given sink until
/// the device disconnects or fails.
pub type ListenFn = Arc<
    dyn Fn(Arc<Device>, mpsc::Sender<ReadContext>) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// A named set of device operations.
pub struct DeviceHandler {
    name: String,
    actions: Vec<String>,
    read: Option<ReadFn>,
    bulk_read: Option<BulkReadFn>,
    write: Option<WriteFn>,
    listen: Option<ListenFn>,
}

impl DeviceHandler {
    pub fn builder(name: impl Into<String>) -> DeviceHandlerBuilder {
        DeviceHandlerBuilder {
            name: name.into(),
            actions: Vec::new(),
            read: None,
            bulk_read: None,
            write: None,
            listen: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write actions this handler understands, surfaced on device info for
    /// writable devices.
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn read_fn(&self) -> Option<&ReadFn> {
        self.read.as_ref()
    }

    pub fn bulk_read_fn(&self) -> Option<&BulkReadFn> {
        self.bulk_read.as_ref()
    }

    pub fn write_fn(&self) -> Option<&WriteFn> {
        self.write.as_ref()
    }

    pub fn listen_fn(&self) -> Option<&ListenFn> {
        self.listen.as_ref()
    }

    /// A handler is readable if any of read, bulk read, or listen is defined.
    pub fn is_readable(&self) -> bool {
        self.read.is_some() || self.bulk_read.is_some() || self.listen.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    /// Whether the read loop should drive this handler through its bulk read.
    pub fn supports_bulk_read(&self) -> bool {
        self.bulk_read.is_some()
    }
}

impl fmt::Debug for DeviceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandler")
            .field("name", &self.name)
            .field("read", &self.read.is_some())
            .field("bulk_read", &self.bulk_read.is_some())
            .field("write", &self.write.is_some())
            .field("listen", &self.listen.is_some())
            .finish()
    }
}

/// Builder for [`DeviceHandler`].
pub struct DeviceHandlerBuilder {
    name: String,
    actions: Vec<String>,
    read: Option<ReadFn>,
    bulk_read: Option<BulkReadFn>,
    write: Option<WriteFn>,
    listen: Option<ListenFn>,
}

impl DeviceHandlerBuilder {
    pub fn actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn read<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Reading>>> + Send + 'static,
    {
        self.read = Some(Arc::new(move |device| Box::pin(f(device))));
        self
    }

    pub fn bulk_read<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Arc<Device>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ReadContext>>> + Send + 'static,
    {
        self.bulk_read = Some(Arc::new(move |devices| Box::pin(f(devices))));
        self
    }

    pub fn write<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, WriteData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.write = Some(Arc::new(move |device, data| Box::pin(f(device, data))));
        self
    }

    pub fn listen<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, mpsc::Sender<ReadContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.listen = Some(Arc::new(move |device, sink| Box::pin(f(device, sink))));
        self
    }

    /// Finalize the handler. Defining both read and bulk read is rejected.
    pub fn build(self) -> PluginResult<DeviceHandler> {
        if self.name.is_empty() {
            return Err(PluginError::Registration(
                "device handler must have a name".into(),
            ));
        }
        if self.read.is_some() && self.bulk_read.is_some() {
            return Err(PluginError::Registration(format!(
                "handler '{}' defines both read and bulk read",
                self.name
            )));
        }
        Ok(DeviceHandler {
            name: self.name,
            actions: self.actions,
            read: self.read,
            bulk_read: self.bulk_read,
            write: self.write,
            listen: self.listen,
        })
    }
}

/// A single addressable device instance.
///
/// Devices are declared by the plugin (typically from configuration), bound
/// to their handler when added to the registry, and immutable after the
/// registry freezes.
#[derive(Debug, Clone)]
pub struct Device {
    /// The device type, e.g. "temperature".
    pub kind: String,
    /// Human-readable description.
    pub info: String,
    /// Optional short name, unique across the plugin.
    pub alias: Option<String>,
    /// Ordered transforms applied to every reading from this device.
    pub transforms: Vec<Transformer>,
    /// Per-device write deadline. Falls back to the plugin default if unset.
    pub write_timeout: Option<Duration>,
    /// Context merged into every reading's context, winning on collision.
    pub context: HashMap<String, String>,
    /// Tags this device carries, beyond the auto-generated id tag.
    pub tags: Vec<Tag>,
    /// Sort weight for deterministic ordering in query output.
    pub sort_index: i32,

    handler_name: String,
    // Bound by the registry at registration time.
    id: String,
    handler: Option<Arc<DeviceHandler>>,
}

impl Device {
    /// Create a device of the given type, bound to the named handler.
    pub fn new(kind: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            info: String::new(),
            alias: None,
            transforms: Vec::new(),
            write_timeout: None,
            context: HashMap::new(),
            tags: Vec::new(),
            sort_index: 0,
            handler_name: handler.into(),
            id: String::new(),
            handler: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn with_transform(mut self, transform: Transformer) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: HashMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_sort_index(mut self, sort_index: i32) -> Self {
        self.sort_index = sort_index;
        self
    }

    /// The device id. Empty until the device is registered.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the handler this device is bound to.
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// The bound handler. None until the device is registered.
    pub fn handler(&self) -> Option<&Arc<DeviceHandler>> {
        self.handler.as_ref()
    }

    pub fn is_readable(&self) -> bool {
        self.handler.as_ref().is_some_and(|h| h.is_readable())
    }

    pub fn is_writable(&self) -> bool {
        self.handler.as_ref().is_some_and(|h| h.is_writable())
    }

    /// The effective write deadline for this device.
    pub fn write_timeout_or(&self, default: Duration) -> Duration {
        self.write_timeout.unwrap_or(default)
    }

    /// Stable fingerprint of the configured identity, hashed into the device
    /// id by the registry. Two devices with the same handler, type, alias,
    /// and context are the same device.
    pub(crate) fn fingerprint(&self) -> String {
        let mut parts = vec![self.handler_name.clone(), self.kind.clone()];
        if let Some(alias) = &self.alias {
            parts.push(alias.clone());
        }
        let mut context: Vec<_> = self
            .context
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        context.sort();
        parts.extend(context);
        parts.join(".")
    }

    pub(crate) fn bind(&mut self, id: String, handler: Arc<DeviceHandler>) {
        self.id = id;
        self.handler = Some(handler);
    }
}
