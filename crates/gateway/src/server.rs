use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{Query, State, WebSocketUpgrade},
        http::HeaderMap,
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    serde::Deserialize,
    tower_http::cors::{Any, CorsLayer},
    tracing::{info, warn},
};

use streamsync_broker::{MemoryBackend, PubSub, RedisBackend, SequenceStore};
use streamsync_config::{BrokerBackend, StreamsyncConfig};
use streamsync_protocol::MAX_MESSAGE_BYTES;

use crate::{
    auth::{ResolvedAuth, user_identity},
    connection::{Connection, run_connection},
    manager::Manager,
    ratelimit::SlidingWindowLimiter,
    routes,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub auth: ResolvedAuth,
    pub ratelimit: Arc<SlidingWindowLimiter>,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the ingress router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/events", post(routes::publish_event))
        .route("/events/batch", post(routes::batch_publish_event))
        .route("/events/broadcast", post(routes::broadcast_event))
        .route("/offline/messages", get(routes::offline_messages))
        .route("/offline/ack", post(routes::ack_message))
        .route("/offline/ack/batch", post(routes::batch_ack_messages))
        .route("/offline/count", get(routes::offline_count))
        .route("/offline/stats", get(routes::offline_stats))
        .route("/users/{user_id}/online", get(routes::user_online))
        .route("/stats", get(routes::stats))
        .route("/stats/pubsub", get(routes::pubsub_stats))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state(state)
}

// ── WebSocket upgrade ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: Option<String>,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // The upstream auth gateway resolves the session identity; the query
    // fallback keeps local development workable.
    let Some(user_id) = user_identity(&headers).or(query.user_id.filter(|u| !u.is_empty())) else {
        return routes::ApiError::Unauthorized("missing session identity").into_response();
    };
    // Reserve the session slot before upgrading so a full node rejects
    // cheaply with 503.
    let permit = match state.manager.limiter().acquire() {
        Ok(permit) => permit,
        Err(e) => {
            warn!(%user_id, error = %e, "connection limit reached");
            return routes::ApiError::Capacity("connection limit reached").into_response();
        },
    };

    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = Connection::new(user_id, Some(permit));
            state.manager.register(Arc::clone(&conn)).await;
            run_connection(socket, conn, Arc::clone(&state.manager), outbound).await;
        })
}

// ── Startup ──────────────────────────────────────────────────────────────────

/// Connect the broker backend named by the config.
async fn connect_backend(
    config: &StreamsyncConfig,
) -> anyhow::Result<(Arc<dyn PubSub>, Arc<dyn SequenceStore>)> {
    match config.broker.backend {
        BrokerBackend::Memory => {
            let backend = Arc::new(MemoryBackend::new());
            Ok((
                Arc::clone(&backend) as Arc<dyn PubSub>,
                backend as Arc<dyn SequenceStore>,
            ))
        },
        BrokerBackend::Redis => {
            let url = config
                .broker
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redis backend requires a redis_url"))?;
            let backend = Arc::new(RedisBackend::connect(url).await?);
            Ok((
                Arc::clone(&backend) as Arc<dyn PubSub>,
                backend as Arc<dyn SequenceStore>,
            ))
        },
    }
}

/// Start the ingress server and run until the process is signalled.
/// Returns an error (non-zero exit) on bind failure or an unreachable
/// broker at startup.
pub async fn start_server(config: StreamsyncConfig) -> anyhow::Result<()> {
    config.validate()?;

    let (pubsub, store) = connect_backend(&config).await?;
    let backend_name = pubsub.backend_name();
    let manager = Manager::new(
        config.instance_id.clone(),
        pubsub,
        store,
        config.limits.max_connections,
    );
    manager.start();

    let ratelimit = Arc::new(SlidingWindowLimiter::new(
        config.limits.rate_max_requests,
        Duration::from_secs(config.limits.rate_window_secs),
    ));
    let state = AppState {
        manager: Arc::clone(&manager),
        auth: ResolvedAuth {
            service_token: config.auth.service_token.clone(),
        },
        ratelimit: Arc::clone(&ratelimit),
    };
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("streamsync v{}", env!("CARGO_PKG_VERSION")),
        format!("instance {}, listening on {}", config.instance_id, addr),
        format!("broker: {backend_name}"),
        format!("session capacity: {}", config.limits.max_connections),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Maintenance timer: sweep expired offline entries and idle rate
    // windows. Pull already filters expired entries defensively, so this
    // only reclaims storage.
    let sweep_manager = Arc::clone(&manager);
    let sweep_ratelimit = Arc::clone(&ratelimit);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep_manager.offline().cleanup_expired().await {
                Ok(removed) if removed > 0 => info!(removed, "offline cleanup sweep"),
                Ok(_) => {},
                Err(e) => warn!(error = %e, "offline cleanup sweep failed"),
            }
            sweep_ratelimit.prune();
        }
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
