use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depot_core::config::{FileConfig, ServiceArgs, SubscriberSettings};
use depot_subscriber::{AppState, cache::SubCache, router};

/// Command line arguments for the subscriber
#[derive(Parser, Debug)]
#[command(name = "depot-subscriber")]
#[command(about = "b2depot subscriber: client-facing cache with lazy chunk materialization")]
struct Args {
    #[command(flatten)]
    service: ServiceArgs,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = match FileConfig::load(args.service.conf.as_deref())
        .and_then(|file| SubscriberSettings::resolve(&args.service, &file))
    {
        Ok(settings) => settings,
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = std::fs::create_dir_all(&settings.cache_dir) {
        error!(
            "cannot create cache directory {}: {err}",
            settings.cache_dir.display()
        );
        std::process::exit(1);
    }

    let listener = match tokio::net::TcpListener::bind(&settings.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind {}: {err}", settings.listen);
            std::process::exit(2);
        }
    };
    info!(
        broker = %settings.broker_endpoint,
        cache = %settings.cache_dir.display(),
        "subscriber listening on {}",
        settings.listen
    );

    let http = match reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!("cannot build HTTP client: {err}");
            std::process::exit(1);
        }
    };
    let state = AppState {
        cache: SubCache::new(settings, http),
    };
    let app = router(state).layer(TraceLayer::new_for_http());
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {err}");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("cannot listen for shutdown signal: {err}");
    }
    info!("shutting down");
}
