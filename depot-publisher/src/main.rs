use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depot_core::client::ApiClient;
use depot_core::config::{FileConfig, PublisherSettings, ServiceArgs};
use depot_core::pubroot::DirectoryRoot;
use depot_publisher::{AppState, registration, router};

/// Command line arguments for the publisher
#[derive(Parser, Debug)]
#[command(name = "depot-publisher")]
#[command(about = "b2depot publisher: serves one root of chunked datasets")]
struct Args {
    #[command(flatten)]
    service: ServiceArgs,

    /// Root name to register with the broker
    #[arg(long, env = "DEPOT_ROOT_NAME")]
    name: Option<String>,

    /// Directory to publish (same as --statedir)
    #[arg(long)]
    root: Option<std::path::PathBuf>,
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
    let settings = match FileConfig::load(args.service.conf.as_deref()).and_then(|file| {
        PublisherSettings::resolve(&args.service, args.name.clone(), args.root.clone(), &file)
    }) {
        Ok(settings) => settings,
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let root = match DirectoryRoot::open(&settings.root) {
        Ok(root) => root,
        Err(err) => {
            error!("cannot open root: {err}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&settings.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("cannot bind {}: {err}", settings.listen);
            std::process::exit(2);
        }
    };
    info!(
        root = %settings.name,
        dir = %settings.root.display(),
        "publisher listening on {}",
        settings.listen
    );

    let state = AppState::new(settings.name.clone(), root);
    let client = ApiClient::new(reqwest::Client::new());

    match registration::register(&client, &settings.broker, &settings.name, &settings.listen).await
    {
        Ok(Some(prior)) if prior != settings.listen => {
            warn!(displaced = %prior, "took over root from another publisher");
        }
        Ok(_) => info!(broker = %settings.broker, "registered with broker"),
        Err(err) => warn!("initial registration failed, will retry on heartbeat: {err}"),
    }

    let heartbeat = registration::spawn_heartbeat(
        state.clone(),
        client.clone(),
        settings.broker.clone(),
        settings.listen.clone(),
    );
    let bus = registration::spawn_bus_listener(
        state.clone(),
        client.clone(),
        settings.broker.clone(),
        settings.listen.clone(),
    );

    let app = router(state).layer(TraceLayer::new_for_http());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    heartbeat.abort();
    bus.abort();
    if let Err(err) = registration::unregister(&client, &settings.broker, &settings.name, &settings.listen).await {
        warn!("unregister failed: {err}");
    }
    if let Err(err) = served {
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
