//! In-process fleet harness: broker, publisher, and subscriber on ephemeral
//! ports, with a fixture root and a per-URI counter of publisher chunk
//! requests.
//!
//! Setting `USE_EXTERNAL_SERVICES=1` skips the in-process fleet; tests that
//! depend on local fixtures then no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::Request;
use axum::middleware::Next;
use tempfile::TempDir;

use depot_broker as broker;
use depot_core::client::ApiClient;
use depot_core::config::SubscriberSettings;
use depot_core::container;
use depot_core::models::Vlmeta;
use depot_core::pubroot::DirectoryRoot;
use depot_publisher as publisher;
use depot_subscriber::cache::SubCache;

pub const TEST_ROOT: &str = "foo";

/// True when the harness must not supervise services itself.
pub fn external() -> bool {
    std::env::var("USE_EXTERNAL_SERVICES").ok().as_deref() == Some("1")
}

pub struct Fleet {
    pub broker_addr: String,
    pub publisher_addr: String,
    pub subscriber_addr: String,
    pub root_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Count of publisher chunk requests per URI path.
    pub chunk_hits: Arc<Mutex<HashMap<String, usize>>>,
    _root_tmp: TempDir,
    _cache_tmp: TempDir,
}

impl Fleet {
    pub fn sub_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.subscriber_addr)
    }

    pub fn hits_for_chunk(&self, dataset: &str, nchunk: u64) -> usize {
        let path = format!("/api/chunk/{dataset}/{nchunk}");
        *self.chunk_hits.lock().unwrap().get(&path).unwrap_or(&0)
    }

    pub fn total_chunk_hits(&self, dataset: &str) -> usize {
        let prefix = format!("/api/chunk/{dataset}/");
        self.chunk_hits
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(_, count)| count)
            .sum()
    }

    /// A second subscriber over the same cache directory, as after a
    /// process restart.
    pub async fn restart_subscriber(&mut self, settings_mut: impl FnOnce(&mut SubscriberSettings)) {
        self.subscriber_addr =
            spawn_subscriber(&self.broker_addr, self.cache_dir.clone(), settings_mut).await;
    }
}

fn i32_bytes(values: impl Iterator<Item = i32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

/// The fixture root every scenario runs against.
pub fn build_example_root(dir: &Path) {
    container::write_nd(
        &dir.join("ds-1d.b2nd"),
        "i4",
        &[1000],
        &[100],
        &i32_bytes(0..1000),
        Vlmeta::new(),
    )
    .unwrap();

    container::write_nd(
        &dir.join("dir1/ds-2d.b2nd"),
        "i4",
        &[100, 200],
        &[50, 50],
        &i32_bytes(0..20_000),
        Vlmeta::new(),
    )
    .unwrap();

    container::write_frame(
        &dir.join("ds-hello.b2frame"),
        b"Hello world!Hello world!Hello world!",
        10,
        Vlmeta::new(),
    )
    .unwrap();

    std::fs::write(
        dir.join("README.md"),
        b"This is a simple example, with some text.",
    )
    .unwrap();
}

async fn spawn_app(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn spawn_subscriber(
    broker_addr: &str,
    cache_dir: PathBuf,
    settings_mut: impl FnOnce(&mut SubscriberSettings),
) -> String {
    let mut settings = SubscriberSettings {
        listen: String::new(),
        broker_endpoint: broker_addr.to_owned(),
        cache_dir,
        cache_quota_bytes: None,
        etag_revalidation_interval: 0,
        chunk_fetch_concurrency: 4,
        change_subscription: false,
        schunk_wire_threshold: 128 * 1024,
    };
    settings_mut(&mut settings);

    let state = depot_subscriber::AppState {
        cache: SubCache::new(settings, reqwest::Client::new()),
    };
    spawn_app(depot_subscriber::router(state)).await
}

/// Start a full fleet with default subscriber settings.
pub async fn start_fleet() -> Fleet {
    start_fleet_with(|_| {}).await
}

/// Start a full fleet, customizing the subscriber's settings.
pub async fn start_fleet_with(settings_mut: impl FnOnce(&mut SubscriberSettings)) -> Fleet {
    assert!(
        !external(),
        "in-process fleet requested with USE_EXTERNAL_SERVICES=1"
    );

    let root_tmp = tempfile::tempdir().unwrap();
    build_example_root(root_tmp.path());
    let cache_tmp = tempfile::tempdir().unwrap();

    let broker_addr = spawn_app(broker::router(broker::AppState::new())).await;

    // Publisher, with a middleware counting chunk requests.
    let chunk_hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let hits = chunk_hits.clone();
    let pub_state = publisher::AppState::new(
        TEST_ROOT.into(),
        DirectoryRoot::open(root_tmp.path()).unwrap(),
    );
    let pub_app = publisher::router(pub_state).layer(axum::middleware::from_fn(
        move |req: Request, next: Next| {
            let hits = hits.clone();
            async move {
                let path = req.uri().path().to_owned();
                if path.starts_with("/api/chunk/") {
                    *hits.lock().unwrap().entry(path).or_insert(0) += 1;
                }
                next.run(req).await
            }
        },
    ));
    let publisher_addr = spawn_app(pub_app).await;

    let client = ApiClient::new(reqwest::Client::new());
    publisher::registration::register(&client, &broker_addr, TEST_ROOT, &publisher_addr)
        .await
        .unwrap();

    let subscriber_addr =
        spawn_subscriber(&broker_addr, cache_tmp.path().to_path_buf(), settings_mut).await;

    Fleet {
        broker_addr,
        publisher_addr,
        subscriber_addr,
        root_dir: root_tmp.path().to_path_buf(),
        cache_dir: cache_tmp.path().to_path_buf(),
        chunk_hits,
        _root_tmp: root_tmp,
        _cache_tmp: cache_tmp,
    }
}
