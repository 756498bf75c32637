//! End-to-end behavior of the three-service fleet: subscription, slice
//! resolution, chunk single-flight, ETag coherence, downloads, and the
//! error surface.

mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use depot_core::container::{self, Container};
use depot_core::models::{SlicePayload, SubscribedRoot, Vlmeta};
use depot_core::slicing::{Selection, parse};
use support::{TEST_ROOT, start_fleet, start_fleet_with};

fn i32_bytes(values: impl Iterator<Item = i32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

async fn subscribe(fleet: &support::Fleet) -> String {
    reqwest::Client::new()
        .post(fleet.sub_url(&format!("/api/subscribe/{TEST_ROOT}")))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

async fn fetch_payload(fleet: &support::Fleet, dataset: &str, slice: &str) -> SlicePayload {
    let response = reqwest::Client::new()
        .get(fleet.sub_url(&format!("/api/fetch/{TEST_ROOT}/{dataset}")))
        .query(&[("slice_", slice)])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200, "fetch {dataset}[{slice}]");
    assert_eq!(
        response
            .headers()
            .get("x-transport-encoding")
            .unwrap()
            .to_str()
            .unwrap(),
        "msgpack"
    );
    rmp_serde::from_slice(&response.bytes().await.unwrap()).unwrap()
}

#[tokio::test]
async fn subscribe_is_idempotent_and_catalog_is_complete() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    let client = reqwest::Client::new();

    // Before subscribing, the broker's roots show up unsubscribed.
    let roots: BTreeMap<String, SubscribedRoot> = client
        .get(fleet.sub_url("/api/roots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(roots[TEST_ROOT].http, fleet.publisher_addr);
    assert!(!roots[TEST_ROOT].subscribed);

    assert_eq!(subscribe(&fleet).await, "Ok");
    assert_eq!(subscribe(&fleet).await, "Ok");

    let roots: BTreeMap<String, SubscribedRoot> = client
        .get(fleet.sub_url("/api/roots"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(roots[TEST_ROOT].subscribed);

    // The catalog equals the files on the publisher's disk.
    let catalog: Vec<String> = client
        .get(fleet.sub_url(&format!("/api/list/{TEST_ROOT}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mut expected: Vec<String> = walkdir::WalkDir::new(&fleet.root_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            entry
                .path()
                .strip_prefix(&fleet.root_dir)
                .unwrap()
                .to_str()
                .unwrap()
                .replace('\\', "/")
        })
        .collect();
    expected.sort();
    let mut got = catalog.clone();
    got.sort();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn subscribe_unknown_root_enumerates_available() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    let response = reqwest::Client::new()
        .post(fleet.sub_url("/api/subscribe/nonexistent"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains(TEST_ROOT)
    );
}

#[tokio::test]
async fn slice_1d_fetches_exactly_one_chunk() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.shape, vec![10]);
    assert_eq!(payload.dtype, "i4");
    assert_eq!(payload.data, i32_bytes(10..20));

    assert_eq!(fleet.hits_for_chunk("ds-1d.b2nd", 0), 1);
    assert_eq!(fleet.total_chunk_hits("ds-1d.b2nd"), 1);

    // A second overlapping request is served from the shadow.
    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "15:25").await;
    assert_eq!(payload.data, i32_bytes(15..25));
    assert_eq!(fleet.total_chunk_hits("ds-1d.b2nd"), 1);
}

#[tokio::test]
async fn concurrent_overlapping_slices_share_one_fetch() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    let (a, b) = tokio::join!(
        fetch_payload(&fleet, "ds-1d.b2nd", "0:50"),
        fetch_payload(&fleet, "ds-1d.b2nd", "30:80"),
    );
    assert_eq!(a.data, i32_bytes(0..50));
    assert_eq!(b.data, i32_bytes(30..80));

    // Both requests needed only chunk 0, and it was fetched exactly once.
    assert_eq!(fleet.hits_for_chunk("ds-1d.b2nd", 0), 1);
    assert_eq!(fleet.total_chunk_hits("ds-1d.b2nd"), 1);
}

#[tokio::test]
async fn frame_supports_byte_slices_and_single_index() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-hello.b2frame", "0:5").await;
    assert_eq!(payload.data, b"Hello");
    assert_eq!(payload.shape, vec![5]);

    // Indexing a byte stream yields a single byte, not a scalar.
    let payload = fetch_payload(&fleet, "ds-hello.b2frame", "1").await;
    assert_eq!(payload.data, b"e");
    assert_eq!(payload.shape, vec![1]);
}

#[tokio::test]
async fn indexing_nd_dataset_yields_zero_dim_result() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "7").await;
    assert_eq!(payload.shape, Vec::<u64>::new());
    assert_eq!(payload.data, 7_i32.to_le_bytes());
}

#[tokio::test]
async fn slice_2d_touches_exactly_the_intersecting_chunks() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "dir1/ds-2d.b2nd", "10:60,30:120").await;
    assert_eq!(payload.shape, vec![50, 90]);
    let mut expected = Vec::new();
    for row in 10..60_i32 {
        expected.extend(i32_bytes((row * 200 + 30)..(row * 200 + 120)));
    }
    assert_eq!(payload.data, expected);

    // Chunk grid is 2 x 4; rows {0,1} x cols {0,1,2} linearize to these.
    for nchunk in [0, 1, 2, 4, 5, 6] {
        assert_eq!(fleet.hits_for_chunk("dir1/ds-2d.b2nd", nchunk), 1);
    }
    assert_eq!(fleet.total_chunk_hits("dir1/ds-2d.b2nd"), 6);
}

#[tokio::test]
async fn etag_change_invalidates_and_refetches() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.data, i32_bytes(10..20));

    // Replace the dataset on the publisher: shorter, shifted values.
    tokio::time::sleep(Duration::from_millis(20)).await;
    container::write_nd(
        &fleet.root_dir.join("ds-1d.b2nd"),
        "i4",
        &[500],
        &[100],
        &i32_bytes(1000..1500),
        Vlmeta::new(),
    )
    .unwrap();

    // The next request observes only new content, with no error.
    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.data, i32_bytes(1010..1020));

    // The old chunk 0 was refetched under the new generation.
    assert_eq!(fleet.hits_for_chunk("ds-1d.b2nd", 0), 2);
}

#[tokio::test]
async fn step_and_negative_slices_are_rejected() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;
    let client = reqwest::Client::new();

    let response = client
        .get(fleet.sub_url(&format!("/api/fetch/{TEST_ROOT}/ds-1d.b2nd")))
        .query(&[("slice_", "::2")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "slice_unsupported");
    assert_eq!(body["error"]["message"], "Only step=1 is supported");

    let response = client
        .get(fleet.sub_url(&format!("/api/fetch/{TEST_ROOT}/ds-1d.b2nd")))
        .query(&[("slice_", "-5:")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn escaping_paths_return_400_and_touch_nothing() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;

    // Dot segments must be encoded or the HTTP client collapses them.
    let response = reqwest::Client::new()
        .get(fleet.sub_url(&format!("/api/info/{TEST_ROOT}/%2E%2E/secret")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "path_invalid");
}

#[tokio::test]
async fn cframe_fetch_round_trips_through_the_codec() {
    if support::external() {
        return;
    }
    // Threshold of zero forces the container-frame transport.
    let fleet = start_fleet_with(|settings| settings.schunk_wire_threshold = 0).await;
    subscribe(&fleet).await;

    let response = reqwest::Client::new()
        .get(fleet.sub_url(&format!("/api/fetch/{TEST_ROOT}/ds-1d.b2nd")))
        .query(&[("slice_", ""), ("prefer_schunk", "true")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-transport-encoding")
            .unwrap()
            .to_str()
            .unwrap(),
        "cframe"
    );

    let frame = response.bytes().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fetched.b2nd");
    container::write_cframe(&path, &frame).unwrap();
    let mut fetched = Container::open(&path).unwrap();
    let sel = Selection::resolve(&parse("").unwrap(), &[1000]).unwrap();
    assert_eq!(fetched.read_slice(&sel).unwrap(), i32_bytes(0..1000));
}

#[tokio::test]
async fn download_then_open_matches_source() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;
    let client = reqwest::Client::new();

    // Whole-container download.
    let response = client
        .get(fleet.sub_url(&format!("/files/{TEST_ROOT}/ds-1d.b2nd")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let frame = response.bytes().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ds-1d.b2nd");
    container::write_cframe(&path, &frame).unwrap();
    let mut downloaded = Container::open(&path).unwrap();
    let sel = Selection::resolve(&parse("").unwrap(), &[1000]).unwrap();
    assert_eq!(downloaded.read_slice(&sel).unwrap(), i32_bytes(0..1000));

    // Sliced download materializes a fresh restricted container.
    let response = client
        .get(fleet.sub_url(&format!("/files/{TEST_ROOT}/ds-1d%5B10:20%5D.b2nd")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let frame = response.bytes().await.unwrap();
    let path = dir.path().join("ds-1d-slice.b2nd");
    container::write_cframe(&path, &frame).unwrap();
    let mut sliced = Container::open(&path).unwrap();
    assert_eq!(sliced.header().shape, vec![10]);
    let sel = Selection::resolve(&parse("").unwrap(), &[10]).unwrap();
    assert_eq!(sliced.read_slice(&sel).unwrap(), i32_bytes(10..20));

    // The materialized copy lands under downloads/.
    assert!(
        fleet
            .cache_dir
            .join("downloads")
            .join(TEST_ROOT)
            .join("ds-1d[10:20].b2nd")
            .is_file()
    );
}

#[tokio::test]
async fn opaque_files_download_as_raw_bytes() {
    if support::external() {
        return;
    }
    let fleet = start_fleet().await;
    subscribe(&fleet).await;
    let client = reqwest::Client::new();
    let source = std::fs::read(fleet.root_dir.join("README.md")).unwrap();

    let response = client
        .get(fleet.sub_url(&format!("/files/{TEST_ROOT}/README.md")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), &source[..]);

    // Byte-range download via the slice suffix.
    let response = client
        .get(fleet.sub_url(&format!("/files/{TEST_ROOT}/README%5B1:10%5D.md")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), &source[1..10]);
}

#[tokio::test]
async fn restart_reuses_cached_chunks_under_same_etag() {
    if support::external() {
        return;
    }
    let mut fleet = start_fleet().await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.data, i32_bytes(10..20));
    assert_eq!(fleet.total_chunk_hits("ds-1d.b2nd"), 1);

    // New subscriber process over the same cache directory.
    fleet.restart_subscriber(|_| {}).await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.data, i32_bytes(10..20));
    // The restored shadow satisfied the request without refetching.
    assert_eq!(fleet.total_chunk_hits("ds-1d.b2nd"), 1);
}

#[tokio::test]
async fn quota_evicts_least_recently_used_dataset() {
    if support::external() {
        return;
    }
    // ds-1d holds 4000 bytes of i4 data; the quota fits roughly one
    // dataset's worth of compressed chunks plus headers.
    let fleet = start_fleet_with(|settings| settings.cache_quota_bytes = Some(6 * 1024)).await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "").await;
    assert_eq!(payload.data.len(), 4000);
    let shadow = fleet.cache_dir.join(TEST_ROOT).join("ds-1d.b2nd");
    assert!(shadow.is_file());

    // Materializing the much larger 2-D dataset blows the quota; the 1-D
    // shadow is the LRU victim.
    let payload = fetch_payload(&fleet, "dir1/ds-2d.b2nd", "0:100,0:200").await;
    assert_eq!(payload.data.len(), 80_000);
    assert!(!shadow.is_file(), "LRU dataset should have been evicted");

    // The evicted dataset is refetched transparently on next access.
    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.data, i32_bytes(10..20));
}

#[tokio::test]
async fn change_subscription_invalidates_on_push() {
    if support::external() {
        return;
    }
    // A long revalidation window: only the push channel can invalidate.
    let fleet = start_fleet_with(|settings| {
        settings.etag_revalidation_interval = 3600;
        settings.change_subscription = true;
    })
    .await;
    subscribe(&fleet).await;

    let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
    assert_eq!(payload.data, i32_bytes(10..20));

    tokio::time::sleep(Duration::from_millis(300)).await;
    container::write_nd(
        &fleet.root_dir.join("ds-1d.b2nd"),
        "i4",
        &[1000],
        &[100],
        &i32_bytes(5000..6000),
        Vlmeta::new(),
    )
    .unwrap();

    // Wait for the watcher debounce plus SSE propagation.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let payload = fetch_payload(&fleet, "ds-1d.b2nd", "10:20").await;
        if payload.data == i32_bytes(5010..5020) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "change notification never invalidated the cache"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
