//! Network Handler Builder API
//!
//! Collects the transport, authenticator and configuration of one engine and
//! spawns its driver.

use std::sync::Arc;

use imwire_core::{EngineConfig, Endpoint, ImwireResult};
use tracing::info;

use crate::auth::{Authenticator, NoopAuthenticator};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::handler::NetworkHandler;
use crate::transport::{TcpTransport, Transport};

// ----------------------------------------------------------------------------
// Network Handler Builder
// ----------------------------------------------------------------------------

pub struct NetworkHandlerBuilder {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    event_capacity: usize,
}

impl NetworkHandlerBuilder {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            config: EngineConfig::default(),
            transport: Arc::new(transport),
            authenticator: Arc::new(NoopAuthenticator),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Plain TCP transport sized by the configuration's frame limit
    pub fn tcp(config: EngineConfig) -> Self {
        let transport = TcpTransport::new(config.codec.max_frame_size);
        Self::new(transport).with_config(config)
    }

    /// Set the engine configuration; replaces servers added so far
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_servers(mut self, servers: Vec<Endpoint>) -> Self {
        self.config.servers = servers;
        self
    }

    pub fn add_server(mut self, endpoint: Endpoint) -> Self {
        self.config.servers.push(endpoint);
        self
    }

    pub fn with_authenticator<A: Authenticator>(mut self, authenticator: A) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Buffered events per subscriber before lagging
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.config.trace = enabled;
        self
    }

    /// Spawn the driver in `INITIALIZED`; must run inside a tokio runtime
    pub fn build(self) -> ImwireResult<NetworkHandler> {
        info!(
            servers = self.config.servers.len(),
            "building network handler"
        );
        NetworkHandler::spawn(
            self.config,
            self.transport,
            self.authenticator,
            self.event_capacity,
        )
    }

    /// Build and immediately `start()`
    pub async fn build_and_start(self) -> ImwireResult<NetworkHandler> {
        let handler = self.build()?;
        handler.start()?;
        Ok(handler)
    }
}
