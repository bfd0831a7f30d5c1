//! imwire Runtime
//!
//! Tokio engine that keeps one logical IM connection alive: server selection
//! with failover, connect and login, heartbeat supervision, bounded
//! exponential-backoff reconnection, and request/response correlation over
//! the codec pipelines of `imwire-core`.
//!
//! ```no_run
//! use imwire_core::{EngineConfig, Endpoint};
//! use imwire_runtime::{NetworkHandlerBuilder, SendPolicy};
//! use std::time::Duration;
//!
//! # async fn demo() -> imwire_core::ImwireResult<()> {
//! let config = EngineConfig::new(vec![Endpoint::new("msf.example.net", 8080)]);
//! let handler = NetworkHandlerBuilder::tcp(config).build_and_start().await?;
//! handler.await_ready(Duration::from_secs(10)).await?;
//! handler.request("Status.Ping", Vec::new(), SendPolicy::FailFast).await?;
//! handler.shutdown().await;
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod auth;
pub mod builder;
pub mod events;
pub mod handler;
pub mod heartbeat;
pub mod mock;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use auth::{Authenticator, NoopAuthenticator, PacketChannel, TokenAuthenticator};
pub use builder::NetworkHandlerBuilder;
pub use events::{EngineEvent, EventBus, IncomingMessage, DEFAULT_EVENT_CAPACITY};
pub use handler::{NetworkHandler, SendPolicy, StateSnapshot};
pub use heartbeat::{HeartbeatSupervisor, HeartbeatTarget};
pub use mock::{MockServer, MockTransport};
pub use transport::{Connection, TcpTransport, Transport};
