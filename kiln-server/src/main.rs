//! Kiln Server - HTTP host bridge for a kiln model session

use std::time::Instant;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use kiln_core::model::resolve_model_path;
use kiln_core::{
    CandleRuntime, FallbackResponder, HostBridge, ModelConfig, ModelSession, SessionStats,
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod error;
mod state;

use error::ApiError;
use state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: String,
    loaded: bool,
    session: Option<SessionStats>,
}

#[derive(Debug, Deserialize)]
struct LoadRequest {
    path: String,
    #[serde(default)]
    context_size: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default = "default_max_tokens")]
    max_tokens: i32,
}

fn default_max_tokens() -> i32 {
    80
}

#[derive(Debug, Deserialize)]
struct EmbedRequest {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoadedResponse {
    loaded: bool,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let bridge = &state.bridge;
    Json(HealthResponse {
        status: "ok",
        backend: bridge.backend_name().to_string(),
        loaded: bridge.is_loaded(),
        session: bridge.stats(),
    })
}

async fn status(State(state): State<AppState>) -> Json<LoadedResponse> {
    Json(LoadedResponse {
        loaded: state.bridge.is_loaded(),
    })
}

async fn load(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadedResponse>, ApiError> {
    if req.path.is_empty() {
        return Err(ApiError::bad_request("path must not be empty"));
    }
    info!("Load request: path='{}' context_size={:?}", req.path, req.context_size);

    let context_size = req.context_size.unwrap_or(0);
    let loaded = state
        .run(move |bridge| load_model(bridge, &req.path, context_size))
        .await?;
    Ok(Json(LoadedResponse { loaded }))
}

async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    if let Some(prompt) = &req.prompt {
        info!(
            "Generate request: prompt='{}' max_tokens={}",
            prompt.chars().take(50).collect::<String>(),
            req.max_tokens
        );
    }

    let start = Instant::now();
    let text = state
        .run(move |bridge| bridge.generate(req.prompt.as_deref(), req.max_tokens))
        .await?;
    info!("Generated {} bytes in {:.2?}", text.len(), start.elapsed());
    Ok(Json(GenerateResponse { text }))
}

async fn embed(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, ApiError> {
    let embedding = state
        .run(move |bridge| bridge.embed(req.prompt.as_deref()))
        .await?;
    Ok(Json(EmbedResponse { embedding }))
}

async fn free(State(state): State<AppState>) -> Result<Json<LoadedResponse>, ApiError> {
    let loaded = state
        .run(|bridge| {
            bridge.free();
            bridge.is_loaded()
        })
        .await?;
    Ok(Json(LoadedResponse { loaded }))
}

/// Resolve hub references, then load through the bridge.
fn load_model(bridge: &dyn HostBridge, spec: &str, context_size: i32) -> bool {
    match resolve_model_path(spec) {
        Ok(path) => bridge.load(&path.to_string_lossy(), context_size),
        Err(e) => {
            warn!("Cannot resolve model '{}': {:#}", spec, e);
            false
        }
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/status", get(status))
        .route("/v1/load", post(load))
        .route("/v1/generate", post(generate))
        .route("/v1/embed", post(embed))
        .route("/v1/free", post(free))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(feature = "cuda")]
fn build_runtime() -> anyhow::Result<CandleRuntime> {
    CandleRuntime::new_cuda(0)
}

#[cfg(all(feature = "metal", not(feature = "cuda")))]
fn build_runtime() -> anyhow::Result<CandleRuntime> {
    CandleRuntime::new_metal()
}

#[cfg(not(any(feature = "cuda", feature = "metal")))]
fn build_runtime() -> anyhow::Result<CandleRuntime> {
    Ok(CandleRuntime::new_cpu())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {}='{}', using the default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_server=info,kiln_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Server");

    let config = match std::env::var("KILN_CONFIG") {
        Ok(path) => {
            info!("Loading config from {}", path);
            ModelConfig::from_file(&path)?
        }
        Err(_) => ModelConfig::default(),
    };

    let state = if env_parse("KILN_FALLBACK", 0u8) == 1 {
        AppState::new(FallbackResponder::new())
    } else {
        let runtime = build_runtime()?;
        AppState::new(ModelSession::new(runtime, config))
    };
    info!("Backend: {}", state.bridge.backend_name());

    if let Ok(spec) = std::env::var("KILN_MODEL") {
        let context_size = env_parse("KILN_CTX_SIZE", 0i32);
        info!("Loading startup model: {}", spec);
        let loaded = state
            .run(move |bridge| load_model(bridge, &spec, context_size))
            .await?;
        if !loaded {
            warn!("Startup model failed to load, waiting for /v1/load");
        }
    }

    let app = create_router(state.clone());

    let host = std::env::var("KILN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = env_parse("KILN_PORT", 8080u16);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Releasing model");
    state.run(|bridge| bridge.free()).await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
