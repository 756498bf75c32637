use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depot_broker::{AppState, router};
use depot_core::config::{BrokerSettings, FileConfig, ServiceArgs};

/// Command line arguments for the broker
#[derive(Parser, Debug)]
#[command(name = "depot-broker")]
#[command(about = "b2depot broker: root registry and registration event bus")]
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
    let file = match FileConfig::load(args.service.conf.as_deref()) {
        Ok(file) => file,
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    let settings = BrokerSettings::resolve(&args.service, &file);

    let listener = match tokio::net::TcpListener::bind(&settings.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind {}: {err}", settings.listen);
            std::process::exit(2);
        }
    };
    info!("broker listening on {}", settings.listen);

    let app = router(AppState::new()).layer(TraceLayer::new_for_http());
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
