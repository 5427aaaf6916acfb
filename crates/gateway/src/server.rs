use std::{
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info, warn},
};

use {
    switchyard_config::SwitchyardConfig,
    switchyard_protocol::PROTOCOL_VERSION,
    switchyard_service_traits::Services,
    switchyard_storage::FsObjectStore,
};

use crate::{
    attachments::SqliteAttachmentStore, auth::ResolvedAuth, methods::MethodRegistry,
    state::GatewayState, ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app_state = AppState {
        gateway: state,
        methods,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Periodically expire stale calls, idle transfers and old attachments.
pub fn spawn_sweeper(state: Arc<GatewayState>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.limits.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = state.sweep(Instant::now()).await;
            if report.calls + report.transfers > 0 || report.attachments > 0 {
                info!(
                    calls = report.calls,
                    transfers = report.transfers,
                    attachments = report.attachments,
                    "sweeper expired entries"
                );
            } else {
                debug!("sweeper tick");
            }
        }
    })
}

/// Open the durable stores under `data_dir` and assemble the router state.
pub async fn prepare_gateway(
    config: &SwitchyardConfig,
    data_dir: &Path,
    services: Services,
) -> anyhow::Result<Arc<GatewayState>> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let objects_dir = config
        .storage
        .dir
        .clone()
        .unwrap_or_else(|| data_dir.join("objects"));
    let objects = FsObjectStore::new(&objects_dir)
        .await
        .with_context(|| format!("opening object store at {}", objects_dir.display()))?;

    let db_path = data_dir.join("switchyard.db");
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    SqliteAttachmentStore::init(&pool).await?;

    let auth = ResolvedAuth::from_config(&config.auth);
    if !auth.is_enabled() {
        warn!("no auth token configured; every handshake is accepted");
    }

    info!(
        objects = %objects_dir.display(),
        db = %db_path.display(),
        "stores ready"
    );

    Ok(GatewayState::with_options(
        auth,
        services,
        config.limits.clone(),
        Arc::new(objects),
        Arc::new(SqliteAttachmentStore::new(pool)),
        config.server.ws_request_logs,
    ))
}

/// Start the gateway HTTP + WebSocket server.
pub async fn start_gateway(
    config: SwitchyardConfig,
    data_dir: &Path,
    services: Services,
) -> anyhow::Result<()> {
    let state = prepare_gateway(&config, data_dir, services).await?;
    let methods = Arc::new(MethodRegistry::new());
    let app = build_gateway_app(Arc::clone(&state), methods);
    let sweeper = spawn_sweeper(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(
        addr = %addr,
        version = %state.version,
        protocol = PROTOCOL_VERSION,
        "gateway listening"
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    sweeper.abort();
    served?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.gateway.inner.read().await.connections.counts();
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
        "protocol": PROTOCOL_VERSION,
        "connections": counts,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max = state.gateway.limits.max_payload_bytes;
    ws.max_message_size(max.saturating_mul(2))
        .on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr))
}
