//! Aries API - Unified Rust Gateway and Swarm Execution Fabric
//!
//! This crate provides the distributed multi-agent execution fabric of the
//! Aries platform as a single high-performance Rust service:
//!
//! - **AI Gateway**: OpenAI-compatible chat completions multiplexed to an
//!   upstream Anthropic-style API, with streaming SSE translation, response
//!   caching, concurrency gating, usage accounting and model fallback
//! - **Worker Coordinator**: WebSocket attachment for remote workers with
//!   heartbeat liveness and correlated task dispatch
//! - **Relay Client**: HTTP relay submission/polling with primary/secondary
//!   failover
//! - **Swarm Executor**: task decomposition, role allocation, concurrent
//!   execution across relay/remote/local pools, and commander synthesis
//!
//! # Architecture
//!
//! - [`config`]: typed configuration with environment loading
//! - [`llm`]: chat model types and the upstream Anthropic adapter
//! - [`gateway`]: the gateway service and its HTTP surface
//! - [`coordinator`]: the remote worker coordinator
//! - [`relay`]: the relay HTTP client
//! - [`swarm`]: roster, decomposition/aggregation and the executor
//! - [`tools`]: tool-call schema, parsing and access gating
//!
//! # Example
//!
//! ```rust,ignore
//! use aries_api::{config::AriesConfig, server::create_services};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AriesConfig::load()?;
//!     let services = create_services(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:9600").await?;
//!     axum::serve(
//!         listener,
//!         services
//!             .app
//!             .into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod logging;
pub mod relay;
pub mod server;
pub mod swarm;
pub mod tools;

use std::sync::Arc;

use config::AriesConfig;
use gateway::Gateway;
use swarm::executor::SwarmExecutor;

/// Application state shared across gateway handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AriesConfig>,
    /// The gateway service.
    pub gateway: Arc<Gateway>,
    /// The swarm executor.
    pub swarm: Arc<SwarmExecutor>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AriesConfig")
            .field("gateway", &"Gateway")
            .field("swarm", &"SwarmExecutor")
            .finish()
    }
}
