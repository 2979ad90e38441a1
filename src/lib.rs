//! # Device Plugin SDK
//!
//! This crate is the runtime for building device plugins: services that
//! expose heterogeneous physical or simulated devices (sensors, actuators)
//! to an upstream management service over its versioned v3 API.
//!
//! A plugin declares a set of [`DeviceHandler`]s -- named capability sets
//! that know how to read, bulk-read, write, or stream data for a family of
//! devices -- and registers [`Device`] instances bound to them. The runtime
//! then drives those handlers on a schedule, buffers their readings, tracks
//! asynchronous write transactions, and serves queries from the upstream
//! service.
//!
//! ## Module Structure
//!
//! - **`plugin`**: the [`Plugin`] composition root and lifecycle (startup
//!   ordering, shutdown draining).
//! - **`device`**: devices and device handlers.
//! - **`registry`**: the per-plugin device registry with id, alias, and tag
//!   indices; frozen read-only before the scheduler starts.
//! - **`scheduler`**: read/write loops, per-device listener tasks, and the
//!   reading finalization pipeline.
//! - **`store`**: current readings per device plus the optional historical
//!   cache ring.
//! - **`transaction`**: write transaction records and their TTL-bounded
//!   store.
//! - **`queries`**: the RPC-facing query layer, written against the
//!   [`api::StreamSink`] abstraction rather than a concrete transport.
//! - **`server`**: listener binding (TCP or unix socket) and teardown.
//! - **`api`**: v3 request/response message shapes.
//! - **`output`**, **`tag`**, **`transform`**: reading values and outputs,
//!   device tags, and value transforms.
//! - **`config`**, **`errors`**, **`health`**, **`limiter`**, **`version`**:
//!   configuration surface, the error taxonomy, health checks, rate
//!   limiting, and version reporting.
//!
//! ## Example
//!
//! ```no_run
//! use device_sdk::{Device, DeviceHandler, Plugin, PluginMetadata, Reading};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut plugin = Plugin::new(
//!         PluginMetadata::new("example", "acme").with_description("an example plugin"),
//!     );
//!     plugin.configure()?;
//!
//!     plugin.register_device_handler(
//!         DeviceHandler::builder("temperature")
//!             .read(|_device| async { Ok(vec![Reading::new("temperature", 21.3)]) })
//!             .build()?,
//!     )?;
//!     plugin.register_device(Device::new("temperature", "temperature"))?;
//!
//!     plugin.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod device;
pub mod errors;
pub mod health;
pub mod limiter;
pub mod output;
pub mod plugin;
pub mod queries;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod stop;
pub mod store;
pub mod tag;
pub mod transaction;
pub mod transform;
pub mod version;

pub use config::{PluginConfig, PluginSettings, RunMode};
pub use device::{Device, DeviceHandler};
pub use errors::{PluginError, PluginResult};
pub use output::{Output, ReadContext, Reading, Unit, Value, WriteData};
pub use plugin::{Plugin, PluginAction, PluginMetadata};
pub use registry::{DeviceRegistry, DeviceSelector};
pub use tag::Tag;
pub use transaction::{Transaction, WriteStatus};
pub use transform::Transformer;
pub use version::VersionInfo;
