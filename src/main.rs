use voiceapps_rs::app::AppDeps;
use voiceapps_rs::cache::{CacheStore, MemoryCache};
use voiceapps_rs::config::Config;
use voiceapps_rs::error::AppError;
use voiceapps_rs::handlers;
use voiceapps_rs::openai::OpenAiClient;
use voiceapps_rs::pipeline::StreamPipeline;
use voiceapps_rs::registry::{builtin_definitions, load_definitions, AppDefinition, AppRegistry};
use voiceapps_rs::store::{CallStore, NullStore, PgStore};
use voiceapps_rs::tools::ToolRegistry;
use voiceapps_rs::tts::{GoogleTts, ProviderVoiceOnly, Renderer, SpeechSynthesizer};
use voiceapps_rs::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::DEBUG);
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("voiceapps_rs", level),
        ]));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
    }
}

#[tokio::main]
async fn main() {
    if dotenvy::dotenv().is_err() {
        eprintln!("no .env file; using the process environment");
    }
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);
    debug!(config = ?config, "starting");

    if let Err(e) = run(config).await {
        error!(error=%e, "server stopped");
        std::process::exit(1);
    }
}

async fn definitions(path: Option<&Path>) -> Result<Vec<AppDefinition>, AppError> {
    match path {
        Some(path) => load_definitions(path).await,
        None => {
            info!("APPS_FILE not set; serving the builtin assistant");
            Ok(builtin_definitions())
        }
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let http_client = reqwest::Client::new();
    let memory_cache = Arc::new(MemoryCache::new());
    let cache: Arc<dyn CacheStore> = memory_cache.clone();

    let store: Arc<dyn CallStore> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set; calls and survey results will not be persisted");
            Arc::new(NullStore)
        }
    };

    let llm = Arc::new(OpenAiClient::new(
        http_client.clone(),
        &config.openai_api_key,
        &config.openai_model,
        &config.openai_base_url,
    ));
    let synth: Arc<dyn SpeechSynthesizer> = match &config.google_tts_api_key {
        Some(key) => Arc::new(GoogleTts::new(http_client.clone(), key, &config.tts_language)),
        None => {
            warn!("GOOGLE_TTS_API_KEY not set; speaking with the provider's voice");
            Arc::new(ProviderVoiceOnly)
        }
    };
    let renderer = Arc::new(Renderer::new(
        synth,
        cache.clone(),
        config.ttl,
        &config.tts_voice,
    ));
    let pipeline = Arc::new(StreamPipeline::new(
        cache.clone(),
        renderer,
        config.poll,
        config.ttl,
    ));

    let deps = AppDeps {
        cache: cache.clone(),
        llm,
        tools: Arc::new(ToolRegistry::with_builtins()),
        store: store.clone(),
        ttl: config.ttl,
    };
    let defs = definitions(config.apps_file.as_deref()).await?;
    let registry = Arc::new(AppRegistry::load(&defs, &deps)?);

    spawn_reload_on_hangup(registry.clone(), deps, config.apps_file.clone());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = memory_cache.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = memory_cache.len(), "swept expired cache entries");
            }
        }
    });

    let addr = SocketAddr::from_str(&config.bind_addr)
        .map_err(|e| AppError::Config(format!("BIND_ADDR {}: {e}", config.bind_addr)))?;
    let app_state = Arc::new(AppState {
        config,
        registry,
        cache,
        pipeline,
        store,
    });

    let app = Router::new()
        .route("/voice/inbound", post(handlers::inbound_handler))
        .route("/voice/speech", post(handlers::speech_handler))
        .route("/voice/continue/:turn/:n", post(handlers::continue_handler))
        .route("/voice/status", post(handlers::status_handler))
        .route("/audio/:id", get(handlers::audio_handler))
        .route("/", get(handlers::health_handler))
        .with_state(app_state);

    info!(addr=%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await
        .map_err(|e| {
            error!(error=%e, "server error");
            AppError::Internal("http server failed")
        })
}

/// Re-read the apps file on SIGHUP and swap the registry table.  A bad file is logged and the
/// running table kept.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    registry: Arc<AppRegistry>,
    deps: AppDeps,
    apps_file: Option<std::path::PathBuf>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error=%e, "cannot listen for SIGHUP; hot reload disabled");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            info!("SIGHUP received; reloading apps");
            let reloaded = match definitions(apps_file.as_deref()).await {
                Ok(defs) => registry.reload(&defs, &deps),
                Err(e) => Err(e),
            };
            if let Err(e) = reloaded {
                error!(error=%e, "app reload failed; keeping the current apps");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _registry: Arc<AppRegistry>,
    _deps: AppDeps,
    _apps_file: Option<std::path::PathBuf>,
) {
    warn!("hot reload needs SIGHUP; not available on this platform");
}
