//! End-to-end scenarios for the offline delivery worker.

use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use slipstream_cache::{CachedResponse, Generation};
use slipstream_common::{init_logging, LogConfig};
use slipstream_fetch::{FetchedResponse, MemoryNetwork, Request};
use slipstream_queue::MemoryStore;
use slipstream_worker::{
    ControlMessage, EventOutcome, WorkerConfig, WorkerContext, WorkerEvent, WorkerState,
};
use url::Url;

const ORIGIN: &str = "https://example.com";

fn page(url: &str, body: &str) -> FetchedResponse {
    FetchedResponse::new(url, 200).with_body(body.to_string())
}

fn seed_network(network: &MemoryNetwork) {
    for (path, body) in [
        ("/", "<shell v1>"),
        ("/index.html", "<shell v1>"),
        ("/offline.html", "<offline>"),
        ("/about", "<shell v1>"),
        ("/app.js", "js-code"),
    ] {
        let url = format!("{}{}", ORIGIN, path);
        network.route(&url, page(&url, body));
    }
}

fn setup() -> (WorkerContext, Arc<MemoryNetwork>) {
    init_logging(LogConfig::default().with_filter("slipstream=debug"));

    let network = Arc::new(MemoryNetwork::new());
    seed_network(&network);

    let mut config = WorkerConfig::new(Url::parse(ORIGIN).unwrap());
    config.static_files = vec!["/app.js".to_string()];
    config.routes = vec!["/".to_string(), "/about".to_string()];

    let ctx = WorkerContext::new(config, network.clone(), Arc::new(MemoryStore::new()));
    (ctx, network)
}

async fn fetch(ctx: &WorkerContext, path: &str) -> FetchedResponse {
    let url = Url::parse(&format!("{}{}", ORIGIN, path)).unwrap();
    match ctx
        .handle_event(WorkerEvent::Fetch(Request::get(url)))
        .await
        .unwrap()
    {
        EventOutcome::Response(response) => response,
        other => panic!("expected a response, got {:?}", other),
    }
}

#[tokio::test]
async fn cached_shell_is_served_while_offline() {
    let (ctx, network) = setup();
    ctx.install().await;

    network.set_offline(true);
    ctx.handle_event(WorkerEvent::Offline).await.unwrap();

    let response = fetch(&ctx, "/app.js").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"js-code");
    assert!(!response.redirected);
}

#[tokio::test]
async fn route_like_paths_fall_back_to_index_document() {
    let (ctx, network) = setup();
    ctx.install().await;
    network.set_offline(true);

    // Never captured, no file suffix: answered by the cached shell.
    let response = fetch(&ctx, "/reports/2024").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"<shell v1>");

    // A file-like miss goes to the network and lands on the fallback.
    let miss = fetch(&ctx, "/reports/2024.pdf").await;
    assert_eq!(miss.body.as_ref(), b"<offline>");
}

#[tokio::test]
async fn redirected_captures_are_cleaned_before_serving() {
    let (ctx, network) = setup();
    let url = format!("{}{}", ORIGIN, "/app.js");
    network.route(&url, page(&url, "js-code").with_redirected(true));

    ctx.install().await;
    let response = fetch(&ctx, "/app.js").await;
    assert_eq!(response.body.as_ref(), b"js-code");
    assert!(!response.redirected);
}

#[tokio::test]
async fn install_tolerates_missing_resources() {
    let (ctx, network) = setup();
    network.remove_route(&format!("{}{}", ORIGIN, "/app.js"));

    let report = ctx.install().await;
    assert!(report.is_partial());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "/app.js");
    assert_eq!(ctx.state().await, WorkerState::Installed);

    // The rest of the shell still answers offline.
    network.set_offline(true);
    let response = fetch(&ctx, "/").await;
    assert_eq!(response.body.as_ref(), b"<shell v1>");
}

#[tokio::test]
async fn offline_post_is_queued_then_replayed_once() {
    let (ctx, network) = setup();
    ctx.install().await;

    network.set_offline(true);
    ctx.handle_event(WorkerEvent::Offline).await.unwrap();

    let url = Url::parse(&format!("{}{}", ORIGIN, "/api/save")).unwrap();
    let request = Request::post(url, Bytes::from_static(b"{\"title\":\"draft\"}"));
    let outcome = ctx.handle_event(WorkerEvent::Fetch(request)).await.unwrap();

    // The caller sees the fallback, never a failure.
    match outcome {
        EventOutcome::Response(response) => assert_eq!(response.body.as_ref(), b"<offline>"),
        other => panic!("expected a response, got {:?}", other),
    }
    assert_eq!(ctx.queue_len().await.unwrap(), 1);

    // Connectivity returns; the endpoint accepts the replay.
    network.set_offline(false);
    let api = format!("{}{}", ORIGIN, "/api/save");
    network.insert(Method::POST, &api, FetchedResponse::new(&api, 200));

    let outcome = ctx.handle_event(WorkerEvent::Online).await.unwrap();
    match outcome {
        EventOutcome::Replayed(report) => {
            assert_eq!(report.attempted, 1);
            assert_eq!(report.replayed.len(), 1);
            assert!(report.failed.is_empty());
        }
        other => panic!("expected a replay, got {:?}", other),
    }
    assert_eq!(ctx.queue_len().await.unwrap(), 0);

    // The replayed request is the captured one, body and all.
    let replayed = network.requests().into_iter().last().unwrap();
    assert_eq!(replayed.method, "POST");
    assert_eq!(replayed.url, api);
    assert_eq!(replayed.body.as_ref(), b"{\"title\":\"draft\"}");

    // Draining again re-issues nothing.
    let before = network.requests().len();
    let outcome = ctx
        .handle_message(ControlMessage::RetryRequests)
        .await
        .unwrap();
    match outcome {
        EventOutcome::Replayed(report) => assert_eq!(report.attempted, 0),
        other => panic!("expected a replay, got {:?}", other),
    }
    assert_eq!(network.requests().len(), before);
}

#[tokio::test]
async fn failed_replays_stay_queued_for_next_time() {
    let (ctx, network) = setup();
    ctx.install().await;

    network.set_offline(true);
    ctx.handle_event(WorkerEvent::Offline).await.unwrap();

    for path in ["/api/a", "/api/b"] {
        let url = Url::parse(&format!("{}{}", ORIGIN, path)).unwrap();
        let request = Request::post(url, Bytes::from_static(b"{}"));
        ctx.handle_event(WorkerEvent::Fetch(request)).await.unwrap();
    }
    assert_eq!(ctx.queue_len().await.unwrap(), 2);

    // Only one endpoint is reachable after reconnecting.
    network.set_offline(false);
    let ok = format!("{}{}", ORIGIN, "/api/a");
    network.insert(Method::POST, &ok, FetchedResponse::new(&ok, 200));
    let broken = format!("{}{}", ORIGIN, "/api/b");
    network.insert(Method::POST, &broken, FetchedResponse::new(&broken, 500));

    match ctx.handle_event(WorkerEvent::Online).await.unwrap() {
        EventOutcome::Replayed(report) => {
            assert_eq!(report.attempted, 2);
            assert_eq!(report.replayed.len(), 1);
            assert_eq!(report.failed.len(), 1);
        }
        other => panic!("expected a replay, got {:?}", other),
    }
    assert_eq!(ctx.queue_len().await.unwrap(), 1);
}

#[tokio::test]
async fn update_window_migrates_old_generation_before_activation() {
    let network = Arc::new(MemoryNetwork::new());
    for (path, body) in [
        ("/", "<shell v2>"),
        ("/index.html", "<shell v2>"),
        ("/offline.html", "<offline>"),
        ("/app.js", "js-v2"),
    ] {
        let url = format!("{}{}", ORIGIN, path);
        network.route(&url, page(&url, body));
    }

    let mut config = WorkerConfig::new(Url::parse(ORIGIN).unwrap());
    config.version = 2;
    config.static_files = vec!["/app.js".to_string()];
    let ctx = WorkerContext::new(config, network, Arc::new(MemoryStore::new()));

    // v1 is still being served to an open client.
    let mut old = Generation::new("web-app-cache-v1");
    let root = format!("{}{}", ORIGIN, "/");
    old.put(
        &root,
        CachedResponse {
            url: root.clone(),
            status: 200,
            headers: Default::default(),
            body: b"<shell v1>".to_vec(),
            redirected: false,
            cached_at: 0,
        },
    );
    ctx.store().write().await.insert(old);

    ctx.install().await;
    let (_client, _rx) = ctx.connect_client().await;

    let outcome = ctx
        .handle_message(ControlMessage::PrepareCachesForUpdate)
        .await
        .unwrap();
    match outcome {
        EventOutcome::Migrated(report) => {
            assert_eq!(report.migrated, vec!["web-app-cache-v1".to_string()]);
            assert_eq!(report.root_copied, 1);
        }
        other => panic!("expected a migration, got {:?}", other),
    }

    // The old generation now answers with the new shell.
    {
        let store = ctx.store().read().await;
        let old = store.get("web-app-cache-v1").unwrap();
        let entry = old.lookup(&root, &Default::default()).unwrap();
        assert_eq!(entry.body, b"<shell v2>");
    }

    // Single client: skip-wait goes through and discards v1.
    match ctx.handle_message(ControlMessage::SkipWaiting).await.unwrap() {
        EventOutcome::Activated { removed } => {
            assert_eq!(removed, vec!["web-app-cache-v1".to_string()]);
        }
        other => panic!("expected activation, got {:?}", other),
    }
    assert_eq!(ctx.state().await, WorkerState::Activated);
}

#[tokio::test]
async fn fallback_is_synthesized_when_nothing_is_cached() {
    init_logging(LogConfig::default());

    let network = Arc::new(MemoryNetwork::new());
    network.set_offline(true);
    let config = WorkerConfig::new(Url::parse(ORIGIN).unwrap());
    let ctx = WorkerContext::new(config, network, Arc::new(MemoryStore::new()));

    let response = fetch(&ctx, "/data.json").await;
    assert_eq!(response.status, 503);
    assert_eq!(response.body.as_ref(), b"offline");
}

#[tokio::test]
async fn null_network_results_are_retried_once() {
    init_logging(LogConfig::default());

    let network = Arc::new(MemoryNetwork::new());
    let flaky = format!("{}{}", ORIGIN, "/data.bin");
    network.route(&flaky, FetchedResponse::network_error());

    let config = WorkerConfig::new(Url::parse(ORIGIN).unwrap());
    let ctx = WorkerContext::new(config, network.clone(), Arc::new(MemoryStore::new()));

    let response = fetch(&ctx, "/data.bin").await;
    assert_eq!(response.status, 503);

    // One initial attempt plus exactly one retry.
    let attempts = network
        .requests()
        .iter()
        .filter(|r| r.url == flaky)
        .count();
    assert_eq!(attempts, 2);
}
