//! `CourierServer`: wiring, router and listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use courier_core::clock::{SharedClock, SystemClock};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::delivery::DeliveryService;
use crate::gateway::hub::ConnectionHub;
use crate::identity::IdentityVerifier;
use crate::presence::PresenceBroadcaster;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::store::MessageStore;
use crate::sweep::Sweeper;

/// Shared state accessible from handlers and socket tasks.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration.
    pub config: Arc<ServerConfig>,
    /// Active sessions.
    pub registry: Arc<SessionRegistry>,
    /// Open sockets.
    pub hub: Arc<ConnectionHub>,
    /// Presence and typing.
    pub presence: Arc<PresenceBroadcaster>,
    /// Message persistence and push.
    pub delivery: Arc<DeliveryService>,
    /// Identity token verification.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Per-account request budget.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Wall clock for timestamps.
    pub clock: SharedClock,
    /// Shutdown coordinator.
    pub shutdown: ShutdownCoordinator,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The courier server.
pub struct CourierServer {
    state: AppState,
}

impl CourierServer {
    /// Create a server on the system clock.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self::with_clock(config, store, verifier, Arc::new(SystemClock))
    }

    /// Create a server with an injected clock.
    pub fn with_clock(
        config: ServerConfig,
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn IdentityVerifier>,
        clock: SharedClock,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&clock),
            config.session_timeout,
        ));
        let hub = Arc::new(ConnectionHub::new());
        let shutdown = ShutdownCoordinator::new();
        let presence = Arc::new(PresenceBroadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            config.presence_grace,
            shutdown.clone(),
        ));
        let delivery = Arc::new(DeliveryService::new(
            store,
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::clone(&clock),
            config.delivery.clone(),
        ));
        let rate_limiter = config
            .rate_limit
            .clone()
            .map(|rl| Arc::new(RateLimiter::new(rl)));
        Self {
            state: AppState {
                config: Arc::new(config),
                registry,
                hub,
                presence,
                delivery,
                verifier,
                rate_limiter,
                clock,
                shutdown,
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Serve Prometheus text at `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes and layers.
    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and start serving in the background,
    /// together with the session sweeper.
    pub async fn listen(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();

        let sweeper = Sweeper::new(
            Arc::clone(&self.state.registry),
            Arc::clone(&self.state.hub),
            Arc::clone(&self.state.presence),
            self.state.rate_limiter.clone(),
        );
        let _ = self.state.shutdown.spawn(
            sweeper.run(self.state.config.sweep_interval, self.state.shutdown.token()),
        );

        let token = self.state.shutdown.token();
        let _ = self.state.shutdown.spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(%addr, "courier server listening");
        Ok(ServerHandle {
            addr,
            state: self.state,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
}

impl ServerHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared state of the running server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Close every socket, stop accepting, and wait for background tasks.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        info!("courier server shutting down");
        self.state.hub.close_all();
        let _ = self.state.shutdown.drain(timeout).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
