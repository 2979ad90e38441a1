//! Network binding for the plugin's RPC listener.
//!
//! The core does not frame or serve RPCs itself -- that is the transport
//! collaborator's job, driving the [`QueryLayer`] through its stream sinks.
//! This module owns the contract around it: resolving the listen address,
//! binding the TCP or unix socket listener (fatal on failure), holding it
//! for the plugin's lifetime, and tearing it down on stop.
//!
//! Unix socket paths resolve under a process-wide socket directory; a bare
//! file name is interpreted relative to that directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};

use crate::config::{NetworkSettings, NetworkType};
use crate::errors::{PluginError, PluginResult};
use crate::queries::QueryLayer;
use crate::stop::StopSignal;

/// Default directory under which unix socket addresses are resolved.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/synse";

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// The plugin's RPC listener lifecycle.
pub struct Server {
    network: NetworkSettings,
    socket_dir: PathBuf,
    initialized: bool,
    listener: Option<BoundListener>,
    query: Option<Arc<QueryLayer>>,
}

impl Server {
    pub fn new(network: NetworkSettings) -> Self {
        Self {
            network,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            initialized: false,
            listener: None,
            query: None,
        }
    }

    /// Override the socket directory (used by tests and embedders that
    /// cannot write to the default location).
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Resolve the address the server will listen on.
    ///
    /// TCP addresses pass through unchanged. Unix addresses resolve under
    /// the socket directory unless already absolute.
    pub fn address(&self) -> PathBuf {
        match self.network.kind {
            NetworkType::Tcp => PathBuf::from(&self.network.address),
            NetworkType::Unix => {
                let path = Path::new(&self.network.address);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.socket_dir.join(path)
                }
            }
        }
    }

    /// Prepare for binding: for unix listeners, make sure the socket
    /// directory exists.
    pub fn init(&mut self) -> PluginResult<()> {
        if self.network.address.is_empty() {
            return Err(PluginError::ServerNeedsConfig);
        }
        if self.network.kind == NetworkType::Unix {
            if let Some(parent) = self.address().parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Bind the listener. Bind failures are fatal to startup.
    pub async fn start(&mut self) -> PluginResult<()> {
        if !self.initialized {
            return Err(PluginError::ServerNotInitialized);
        }

        let address = self.address();
        let listener = match self.network.kind {
            NetworkType::Tcp => {
                let listener = TcpListener::bind(&self.network.address).await?;
                BoundListener::Tcp(listener)
            }
            NetworkType::Unix => {
                // A stale socket from a previous run blocks the bind.
                if address.exists() {
                    std::fs::remove_file(&address)?;
                }
                BoundListener::Unix(UnixListener::bind(&address)?)
            }
        };
        info!(address = %address.display(), "plugin server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// The actual bound address. For TCP this reflects the resolved port
    /// (useful when binding port 0).
    pub fn bound_address(&self) -> Option<String> {
        match &self.listener {
            Some(BoundListener::Tcp(l)) => l.local_addr().ok().map(|a| a.to_string()),
            Some(BoundListener::Unix(_)) => Some(self.address().display().to_string()),
            None => None,
        }
    }

    /// Hand the query layer to the transport and hold the listener open
    /// until the stop signal trips, then tear down.
    pub async fn serve(&mut self, query: Arc<QueryLayer>, stop: StopSignal) -> PluginResult<()> {
        if self.listener.is_none() {
            self.start().await?;
        }
        self.query = Some(query);
        stop.stopped().await;
        self.teardown()
    }

    /// Transport access to the query layer while serving.
    pub fn query(&self) -> Option<&Arc<QueryLayer>> {
        self.query.as_ref()
    }

    /// Release the listener; unix sockets are removed from disk.
    pub fn teardown(&mut self) -> PluginResult<()> {
        debug!("server teardown");
        self.listener = None;
        if self.network.kind == NetworkType::Unix {
            let address = self.address();
            if address.exists() {
                std::fs::remove_file(&address)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(address: &str) -> NetworkSettings {
        NetworkSettings {
            kind: NetworkType::Tcp,
            address: address.to_string(),
            tls: None,
        }
    }

    fn unix(address: &str) -> NetworkSettings {
        NetworkSettings {
            kind: NetworkType::Unix,
            address: address.to_string(),
            tls: None,
        }
    }

    #[test]
    fn test_init_requires_address() {
        let mut server = Server::new(tcp(""));
        assert!(matches!(
            server.init(),
            Err(PluginError::ServerNeedsConfig)
        ));
        assert!(!server.initialized);
    }

    #[test]
    fn test_init_tcp() {
        let mut server = Server::new(tcp("localhost:5000"));
        server.init().unwrap();
        assert!(server.initialized);
    }

    #[test]
    fn test_init_unix_creates_socket_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");

        let mut server = Server::new(unix("plugin.sock")).with_socket_dir(&nested);
        server.init().unwrap();
        assert!(server.initialized);
        assert!(nested.is_dir());
    }

    #[test]
    fn test_address_tcp() {
        let server = Server::new(tcp("localhost:5000"));
        assert_eq!(server.address(), PathBuf::from("localhost:5000"));
    }

    #[test]
    fn test_address_unix_absolute() {
        let server = Server::new(unix("/tmp/synse/plugin"));
        assert_eq!(server.address(), PathBuf::from("/tmp/synse/plugin"));
    }

    #[test]
    fn test_address_unix_bare_name_resolves_under_socket_dir() {
        let server = Server::new(unix("plugin.sock"));
        assert_eq!(server.address(), PathBuf::from("/tmp/synse/plugin.sock"));
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let mut server = Server::new(tcp("127.0.0.1:0"));
        assert!(matches!(
            server.start().await,
            Err(PluginError::ServerNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_start_tcp_and_teardown() {
        let mut server = Server::new(tcp("127.0.0.1:0"));
        server.init().unwrap();
        server.start().await.unwrap();

        let bound = server.bound_address().unwrap();
        assert!(bound.starts_with("127.0.0.1:"));
        assert!(!bound.ends_with(":0"));

        server.teardown().unwrap();
        assert!(server.bound_address().is_none());
    }

    #[tokio::test]
    async fn test_start_bind_failure_is_fatal() {
        // An unparseable host:port cannot bind.
        let mut server = Server::new(tcp("not-an-address"));
        server.init().unwrap();
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_unix_lifecycle_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::new(unix("plugin.sock")).with_socket_dir(dir.path());
        server.init().unwrap();
        server.start().await.unwrap();

        let socket = dir.path().join("plugin.sock");
        assert!(socket.exists());

        server.teardown().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_unix_start_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("plugin.sock");
        std::fs::write(&socket, b"").unwrap();

        let mut server = Server::new(unix("plugin.sock")).with_socket_dir(dir.path());
        server.init().unwrap();
        server.start().await.unwrap();
        assert!(socket.exists());

        server.teardown().unwrap();
    }
}
