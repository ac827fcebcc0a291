// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Listener lifecycle

use crate::{
    backend::Backend,
    config::Config,
    error::MultiError,
    remote::{Dialer, DEFAULT_IDLE_TIMEOUT},
    ws::WsDialer,
};
use eyre::{bail, eyre, Result, WrapErr};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long `close` waits for the listener task to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`Server`]
#[derive(Debug, Clone)]
pub struct ServerBuilder {
    listen: SocketAddr,
    config: Option<Config>,
    dialer: Option<Arc<dyn Dialer>>,
    idle_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            config: None,
            dialer: None, // WebSocket dialer
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ServerBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Address to listen on; port 0 picks a free port
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Switching configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// How targets are dialed
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Idle time before a target link without keep-alive is closed
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Validate the configuration and build the server
    pub fn build(self) -> Result<Server> {
        let config = self.config.ok_or_else(|| eyre!("no configuration given"))?;
        config.validate().wrap_err("invalid configuration")?;
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(WsDialer));
        let backend =
            Backend::new(Arc::new(config), dialer).with_idle_timeout(self.idle_timeout);
        Ok(Server { listen: self.listen, backend: Arc::new(backend), running: Mutex::new(None) })
    }
}

#[derive(Debug)]
struct Running {
    address: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

/// HTTP listener in front of a [`Backend`].
#[derive(Debug)]
pub struct Server {
    listen: SocketAddr,
    backend: Arc<Backend>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// The backend serving connections
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Bound address while running
    pub async fn address(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|running| running.address)
    }

    /// Bind the listener and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            bail!("server already running on {}", running.address);
        }
        if !self.backend.is_accepting() {
            bail!("server has been closed");
        }

        let listener = TcpListener::bind(self.listen)
            .await
            .wrap_err_with(|| format!("failed to bind {}", self.listen))?;
        let address = listener.local_addr()?;
        info!("Switcheroo listening on {}", address);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let app = self.backend.router();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    signal.cancelled().await;
                    info!("Shutdown signal received, stopping listener");
                })
                .await
        });

        *running = Some(Running { address, shutdown, handle });
        Ok(address)
    }

    /// Stop accepting, close every live session and stop the listener.
    pub async fn close(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        let Some(running) = self.running.lock().await.take() else {
            errors.push(eyre!("server is not running"));
            return Err(errors);
        };

        self.backend.stop_accepting();
        if let Err(e) = self.backend.close().await {
            errors.merge(e);
        }

        running.shutdown.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, running.handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => errors.push(eyre::Report::new(e).wrap_err("listener failed")),
            Ok(Err(e)) => errors.push(eyre::Report::new(e).wrap_err("listener task failed")),
            Err(_) => {
                warn!(address = %running.address, "listener still busy after shutdown timeout");
                errors.push(eyre!("listener did not stop within {SHUTDOWN_TIMEOUT:?}"));
            }
        }
        info!(address = %running.address, failures = errors.len(), "Switcheroo stopped");
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switcheroo_common::logging::ensure_test_logging;

    fn config() -> Config {
        Config::from_yaml_str(
            r#"
targets:
  node:
    endpoint: ws://127.0.0.1:1
sources:
  wallet: {}
"#,
        )
        .unwrap()
    }

    fn any_port() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_build_requires_config() {
        let err = ServerBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("no configuration"));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        ensure_test_logging(None);
        let server = ServerBuilder::new().listen_addr(any_port()).config(config()).build().unwrap();
        assert!(server.address().await.is_none());
        assert!(server.close().await.is_err());

        let address = server.start().await.unwrap();
        assert_ne!(address.port(), 0);
        assert_eq!(server.address().await, Some(address));
        assert!(server.start().await.unwrap_err().to_string().contains("already running"));

        server.close().await.unwrap();
        assert!(server.address().await.is_none());
        assert!(!server.backend().is_accepting());
        assert!(server.close().await.is_err());
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        ensure_test_logging(None);
        let taken = TcpListener::bind(any_port()).await.unwrap();
        let server = ServerBuilder::new()
            .listen_addr(taken.local_addr().unwrap())
            .config(config())
            .build()
            .unwrap();
        assert!(server.start().await.unwrap_err().to_string().contains("failed to bind"));
    }
}
