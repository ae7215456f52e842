use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::{
    config::server::{Config, ConfigError, DatabaseConfig, LogFormat},
    llms::{CompletionError, CompletionSource},
};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    services::ServeDir,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    db::bootstrap::{self, BootstrapError},
    routes,
    services::{
        completion_service::ChatCompletionsClient,
        history_store::{HistoryStore, MemoryHistoryStore},
        identity::{IdentityError, verifier_from_config},
        pg_history_store::PgHistoryStore,
    },
    session::machine::MachineSettings,
    tracer,
};

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error("identity verifier setup failed: {0}")]
    Identity(#[from] IdentityError),
    #[error("completion client setup failed: {0}")]
    Completion(#[from] CompletionError),
    #[error("failed to bind listener: {0}")]
    Io(#[from] std::io::Error),
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder on first use and returns its handle.
pub(crate) fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                warn!(error = %err, "metrics recorder already installed; /metrics will be empty");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
///
/// Returns the configured level. A subscriber installed earlier is left in place.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool for the configured URL.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(
    db: &DatabaseConfig,
    url: &str,
) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Picks the history backend: Postgres when `db.url` is set, memory otherwise.
///
/// The Postgres path runs the liveness probe, the bootstrap scripts and the
/// readiness probe before returning.
///
/// # Errors
/// Returns an error when the database is unreachable or bootstrap fails.
pub async fn create_history_store(db: &DatabaseConfig) -> Result<Arc<dyn HistoryStore>, ServerError> {
    let Some(url) = db.url.as_deref() else {
        info!("no database configured; conversation history is kept in memory");
        return Ok(Arc::new(MemoryHistoryStore::new()));
    };

    let pool = create_database_pool(db, url).await?;
    bootstrap::ensure_liveness(&pool).await?;
    let applied = bootstrap::run(&pool, db).await?;
    bootstrap::ensure_readiness(&pool).await?;
    info!(applied, "postgres history store ready");

    Ok(Arc::new(PgHistoryStore::new(pool)))
}

/// Wires the collaborators selected by configuration into shared state.
///
/// # Errors
/// Returns an error when the system prompt file cannot be read or a client
/// cannot be constructed.
pub fn create_app_state(
    config: &Config,
    history: Arc<dyn HistoryStore>,
) -> Result<Arc<AppState>, ServerError> {
    let system_prompt = config.relay.resolve_system_prompt()?;
    let verifier = verifier_from_config(
        &config.auth,
        Duration::from_secs(config.completion.connect_timeout_secs),
    )?;
    let completion: Arc<dyn CompletionSource> =
        Arc::new(ChatCompletionsClient::from_config(&config.completion)?);
    info!(
        model = completion.model_name(),
        auth_mode = ?config.auth.mode,
        allow_guests = config.auth.allow_guests,
        "relay collaborators configured"
    );

    Ok(Arc::new(AppState::new(
        history,
        verifier,
        completion,
        MachineSettings::from_config(config, system_prompt),
        config.relay.outbound_buffer,
    )))
}

/// Creates the CORS layer for the application.
///
/// An empty origin list allows any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use axum::http::Method;

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([Method::GET, Method::OPTIONS]))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Serves the files under `static_dir` for any unmatched path.
pub fn create_static_service<S>(static_dir: PathBuf) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(
    state: Arc<AppState>,
    config: &Config,
    metrics_handle: PrometheusHandle,
) -> Router {
    let mut router = Router::new()
        .nest("/api", routes::api::create_api_router(Arc::clone(&state)))
        .merge(routes::ws::create_ws_router())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint));

    if let Some(static_dir) = &config.web.static_dir {
        router = router.merge(create_static_service(static_dir.clone()));
    }

    router
        .layer(Extension(metrics_handle))
        .layer(tracer::create_trace_layer())
        .layer(create_cors_layer(config))
        .with_state(state)
}

/// Resolves when Ctrl-C is received.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl-C handler; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the relay server on the configured address.
///
/// # Errors
/// Returns an error if any collaborator cannot be set up or the listener
/// cannot be bound.
pub async fn run(config: Config) -> Result<(), ServerError> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, "Starting server...");

    let metrics_handle = metrics_handle();
    let history = create_history_store(&config.db).await?;
    let state = create_app_state(&config, history)?;
    let app = create_app_router(state, &config, metrics_handle);

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    Ok(())
}
