//! Service assembly and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::AriesConfig;
use crate::coordinator::{self, Coordinator};
use crate::gateway::{routes, Gateway};
use crate::llm::anthropic::AnthropicClient;
use crate::logging::OpTimer;
use crate::swarm::executor::SwarmExecutor;
use crate::swarm::roster::AgentRoster;
use crate::{log_banner, log_init_step, log_init_warning, log_success, AppState};

/// Aries API version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upstream-to-client header deadline for the gateway surface.
const HEADER_TIMEOUT_SECS: u64 = 90;

/// The assembled services.
pub struct Services {
    /// The gateway router (serve with connect info for loopback auth).
    pub app: Router,
    /// Shared state (exposed for tests and embedding).
    pub state: AppState,
    /// The coordinator, when remote workers are enabled.
    pub coordinator: Option<Arc<Coordinator>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("coordinator", &self.coordinator.is_some())
            .finish()
    }
}

/// Create the gateway application and its companion services.
pub async fn create_services(config: AriesConfig) -> anyhow::Result<Services> {
    let overall_timer = OpTimer::new("server", "create_services");

    log_banner!(
        format!("🚀 Aries API v{VERSION}"),
        format!(
            "Gateway :{} | Coordinator :{}",
            config.gateway.port,
            if config.remote_workers.enabled {
                config.remote_workers.port.to_string()
            } else {
                "off".to_string()
            }
        )
    );

    // [1/5] Upstream driver
    let step_timer = OpTimer::new("server", "upstream_driver");
    let driver = Arc::new(AnthropicClient::new(config.upstream.clone())?);
    let credential_state = if config.upstream.credential.is_some() {
        "✓"
    } else {
        "✗ No credential"
    };
    log_init_step!(
        1,
        5,
        "Upstream",
        format!("⚙️ {} {}", config.upstream.base_url, credential_state)
    );
    if config.upstream.credential.is_none() {
        log_init_warning!("No upstream credential configured. LLM requests will fail.");
    }
    step_timer.finish();

    // [2/5] Gateway
    let step_timer = OpTimer::new("server", "gateway");
    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        config.pricing.clone(),
        driver,
    ));
    log_init_step!(
        2,
        5,
        "Gateway",
        format!(
            "🧠 {} permits, cache {} entries / {}s TTL",
            config.gateway.max_concurrent,
            config.gateway.cache_capacity,
            config.gateway.cache_ttl_secs
        )
    );
    step_timer.finish();

    // [3/5] Coordinator
    let step_timer = OpTimer::new("server", "coordinator");
    let coordinator_service = if config.remote_workers.enabled {
        if config.remote_workers.secret.is_empty() {
            log_init_warning!("Remote workers enabled without a shared secret; attachments will be rejected.");
        }
        let service = Arc::new(Coordinator::new(config.remote_workers.clone()));
        service.spawn_heartbeat_scan();
        log_init_step!(3, 5, "Coordinator", "🛰️  WebSocket listener ready");
        Some(service)
    } else {
        log_init_step!(3, 5, "Coordinator", "🛰️  Disabled");
        None
    };
    step_timer.finish();

    // [4/5] Swarm executor
    let step_timer = OpTimer::new("server", "swarm");
    let roster = Arc::new(AgentRoster::new());
    let role_count = roster.roles().len();
    let mut executor = SwarmExecutor::new(
        config.swarm.clone(),
        config.models.clone(),
        Arc::clone(&gateway),
        roster,
    )
    .with_relays(config.relay.clone(), config.relay_secondary.clone());
    if let Some(service) = &coordinator_service {
        executor = executor.with_coordinator(Arc::clone(service));
    }
    let swarm = Arc::new(executor);
    log_init_step!(4, 5, "Swarm", format!("🐝 {role_count} roles"));
    step_timer.finish();

    // [5/5] Router with middleware
    let step_timer = OpTimer::new("server", "router");
    let state = AppState {
        config: Arc::new(config),
        gateway,
        swarm,
    };

    let app = routes::router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(HEADER_TIMEOUT_SECS),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            routes::auth_middleware,
        ))
        .with_state(state.clone());
    log_init_step!(5, 5, "Router", "🌐 Routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("Aries API services created");
    tracing::info!("");

    Ok(Services {
        app,
        state,
        coordinator: coordinator_service,
    })
}

/// Create the coordinator's listener router.
pub fn coordinator_app(service: Arc<Coordinator>) -> Router {
    coordinator::router(service)
}
