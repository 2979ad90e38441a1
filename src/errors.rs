//! Error types for the plugin runtime.
//!
//! [`PluginError`] is the primary error type for the SDK. It consolidates the
//! failure modes of the query layer, scheduler, stores, and server lifecycle
//! into one enum so callers can match on the kind of failure rather than on
//! strings. Device handler callbacks themselves return `anyhow::Result` --
//! handler failures are opaque to the runtime and are only ever surfaced as
//! messages (logged for reads, recorded on the transaction for writes).

use thiserror::Error;

/// Convenience alias for results using the SDK error type.
pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Primary error type for the plugin runtime.
#[derive(Error, Debug)]
pub enum PluginError {
    /// A device reference was required but not provided.
    #[error("device is nil")]
    NilDevice,

    /// Write data was required but not provided.
    #[error("write data is nil")]
    NilData,

    /// The device's handler does not define a write function.
    #[error("device '{0}' is not writable")]
    DeviceNotWritable(String),

    /// The device's handler defines no read, bulk read, or listen function.
    #[error("device '{0}' is not readable")]
    DeviceNotReadable(String),

    /// Selector resolution produced no devices.
    #[error("no device found for the given selector")]
    NoDeviceForSelector,

    /// The request requires a selector with an id or alias set.
    #[error("selector must specify a device id")]
    SelectorRequiresId,

    /// The transaction does not exist or has been evicted.
    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),

    /// A reading transform failed; the reading is dropped for the cycle.
    #[error("transform failed for device '{device}': {message}")]
    TransformFailed { device: String, message: String },

    /// A write did not complete within the device's write timeout.
    #[error("write to device '{0}' timed out")]
    WriteTimeout(String),

    /// The device's write handler returned an error.
    #[error("write to device '{device}' failed: {message}")]
    WriteHandler { device: String, message: String },

    /// The device's listen handler returned an error.
    #[error("listener for device '{device}' failed: {message}")]
    ListenHandler { device: String, message: String },

    /// An illegal transaction status transition was attempted.
    #[error("illegal transaction transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The server was used before `init` was called.
    #[error("server has not been initialized")]
    ServerNotInitialized,

    /// The plugin was run without being configured.
    #[error("plugin must be configured before it is run")]
    ServerNeedsConfig,

    /// Mutation of the registry was attempted after freeze.
    #[error("registry is frozen: {0}")]
    RegistryFrozen(String),

    /// A handler or device was registered twice, or a device references an
    /// unknown handler.
    #[error("registration error: {0}")]
    Registration(String),

    /// A health check with the same name is already registered.
    #[error("health check '{0}' already exists")]
    HealthCheckExists(String),

    /// Configuration values failed semantic validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pre-run or post-run action failed.
    #[error("plugin action '{name}' failed: {message}")]
    Action { name: String, message: String },

    /// A streaming response sink rejected a message; the stream terminates.
    #[error("stream sink closed: {0}")]
    StreamClosed(String),

    /// The runtime is shutting down and the operation was cancelled.
    #[error("plugin is stopping")]
    Stopping,

    /// Underlying I/O failure (socket bind, socket dir creation, ...).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
