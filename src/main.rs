use castor::auth::{CredentialStore, Provider};
use castor::pool::AccountPool;
use castor::server::{CastorState, castor_router};
use castor::upstream::UpstreamClient;
use castor::{CastorError, Config};
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config_path = config_path_from_args();
    let cfg = Config::from_file(&config_path)?;

    let default_level = if cfg.debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        config = %config_path.display(),
        port = cfg.port,
        auth_dir = %cfg.resolved_auth_dir().display(),
        api_keys = cfg.api_keys.len(),
        static_keys = cfg.generative_language_api_key.len(),
        proxy = %cfg.proxy_url.as_deref().unwrap_or("<none>"),
        switch_project = cfg.quota_exceeded.switch_project,
        switch_preview_model = cfg.quota_exceeded.switch_preview_model,
        "starting castor"
    );

    let store = CredentialStore::bootstrap(
        &cfg.resolved_auth_dir(),
        &cfg.generative_language_api_key,
    )?;
    store.spawn_watcher();

    let http = build_http_client(&cfg)?;
    let pool = AccountPool::new(cfg.quota_exceeded.clone(), http.clone(), Arc::clone(&store));

    spawn_liveness_probes(http, Arc::clone(&store));

    let state = CastorState::new(pool, store, cfg.api_keys.clone());
    let app = castor_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CastorError::Bind(format!("{addr}: {e}")))?;
    info!("HTTP server listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("server has shut down gracefully");
    Ok(())
}

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("config.yaml")
}

fn build_http_client(cfg: &Config) -> Result<reqwest::Client, CastorError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none());

    // No overall timeout: streaming responses are bounded only by the
    // client connection.
    if let Some(proxy_url) = &cfg.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| CastorError::Config(format!("invalid proxy-url: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| CastorError::Config(format!("failed to build HTTP client: {e}")))
}

/// One-shot startup pass: probe unchecked OAuth accounts so an account
/// whose Cloud AI API is disabled logs its activation hint early.
fn spawn_liveness_probes(http: reqwest::Client, store: Arc<CredentialStore>) {
    tokio::spawn(async move {
        let snapshot = store.snapshot();
        for credential in snapshot.iter() {
            let record = credential.snapshot();
            if record.provider != Provider::GeminiOauth || record.checked {
                continue;
            }
            let client =
                UpstreamClient::new(http.clone(), Arc::clone(credential), Arc::clone(&store));
            match client.probe_api_enabled().await {
                Ok(true) => info!(identity = %credential.identity(), "liveness probe passed"),
                Ok(false) => {
                    warn!(identity = %credential.identity(), "liveness probe failed: API disabled")
                }
                Err(e) => {
                    warn!(identity = %credential.identity(), error = %e, "liveness probe errored")
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
