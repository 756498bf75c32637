//! Broker-facing lifecycle: initial registration, the heartbeat loop that
//! keeps the binding fresh, and the bus listener that notices when the
//! broker hands the root to another publisher.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use depot_core::Result;
use depot_core::client::{ApiClient, with_retries};
use depot_core::models::{BusEvent, RegisterRequest, RegisterResponse};

use crate::AppState;

/// How often a live publisher refreshes its registration.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Delay before reconnecting a dropped bus stream.
const BUS_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Register this publisher's root with the broker. Returns the displaced
/// endpoint, if any.
pub async fn register(
    client: &ApiClient,
    broker: &str,
    root: &str,
    endpoint: &str,
) -> Result<Option<String>> {
    let request = RegisterRequest {
        root: root.to_owned(),
        endpoint: endpoint.to_owned(),
    };
    let url = format!("http://{broker}/api/register");
    let response: RegisterResponse = with_retries(|| client.post_json(&url, &request)).await?;
    Ok(response.previous)
}

/// Drop the broker binding on graceful shutdown.
pub async fn unregister(
    client: &ApiClient,
    broker: &str,
    root: &str,
    endpoint: &str,
) -> Result<Option<String>> {
    let request = RegisterRequest {
        root: root.to_owned(),
        endpoint: endpoint.to_owned(),
    };
    let response: RegisterResponse = client
        .post_json(&format!("http://{broker}/api/unregister"), &request)
        .await?;
    Ok(response.previous)
}

/// Keep the broker binding fresh until the root is revoked.
pub fn spawn_heartbeat(
    state: AppState,
    client: ApiClient,
    broker: String,
    endpoint: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if state.revoked.load(Ordering::Relaxed) {
                info!(root = %state.name, "root revoked, stopping heartbeat");
                return;
            }
            match register(&client, &broker, &state.name, &endpoint).await {
                Ok(Some(prior)) if prior != endpoint => {
                    warn!(root = %state.name, displaced = %prior, "heartbeat displaced another publisher");
                }
                Ok(_) => {}
                Err(err) => warn!(root = %state.name, "heartbeat failed: {err}"),
            }
        }
    })
}

/// Listen on the broker bus and revoke the root when another publisher
/// takes it over.
pub fn spawn_bus_listener(
    state: AppState,
    client: ApiClient,
    broker: String,
    endpoint: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if state.revoked.load(Ordering::Relaxed) {
                return;
            }
            match client
                .get_stream(&format!("http://{broker}/api/bus"))
                .await
            {
                Ok(response) => {
                    let mut events = std::pin::pin!(depot_core::client::sse_data(response));
                    while let Some(data) = events.next().await {
                        let data = match data {
                            Ok(data) => data,
                            Err(err) => {
                                warn!("bus stream error: {err}");
                                break;
                            }
                        };
                        match serde_json::from_str::<BusEvent>(&data) {
                            Ok(BusEvent::Evicted {
                                root,
                                endpoint: displaced,
                            }) if root == state.name && displaced == endpoint => {
                                error!(root = %state.name, "displaced by another publisher, ceasing to serve");
                                state.revoked.store(true, Ordering::Relaxed);
                                return;
                            }
                            Ok(_) => {}
                            Err(err) => warn!("unparseable bus event: {err}"),
                        }
                    }
                }
                Err(err) => warn!("cannot reach broker bus: {err}"),
            }
            tokio::time::sleep(BUS_RECONNECT_DELAY).await;
        }
    })
}
