mod common;

use common::{png, spawn_server};
use pawpaint_view::{
    client::HttpTransport,
    config::{BackendChoice, Config, StorageConfig},
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use view_api::{normalize, RoomsResponse, Snapshot, MAX_IMAGE_CHARS};

fn kv_config(dir: &tempfile::TempDir) -> Config {
    Config {
        storage: StorageConfig {
            backend: BackendChoice::Kv,
            kv_path: Some(dir.path().join("view.sqlite3")),
            ..StorageConfig::default()
        },
        ..Config::default()
    }
}

async fn publish_read_list(config: Config) {
    let (addr, server, _state) = spawn_server(config).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api/view");

    let resp = client
        .post(format!("{base}/abc123"))
        .json(&json!({ "image": png("AAAA") }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client.get(format!("{base}/ABC123")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["cache-control"], "no-cache, no-store");
    let snapshot: Snapshot = resp.json().await.unwrap();
    assert_eq!(snapshot.image, Some(png("AAAA")));
    let first = snapshot.updated_at.unwrap();

    let rooms: RoomsResponse = client.get(&base).send().await.unwrap().json().await.unwrap();
    assert_eq!(rooms.rooms.len(), 1);
    assert_eq!(rooms.rooms[0].code.as_str(), "ABC123");
    assert_eq!(rooms.rooms[0].updated_at, Some(first));

    let resp = client
        .post(format!("{base}/ABC123/touch"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let touched: Snapshot = client
        .get(format!("{base}/abc123"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(touched.image, Some(png("AAAA")));
    assert!(touched.updated_at.unwrap() >= first);

    server.abort();
}

#[tokio::test]
async fn publish_read_list_on_cache_backend() {
    publish_read_list(Config::default()).await;
}

#[tokio::test]
async fn publish_read_list_on_kv_backend() {
    let dir = tempfile::tempdir().unwrap();
    publish_read_list(kv_config(&dir)).await;
}

#[tokio::test]
async fn rejected_uploads_leave_room_untouched() {
    let (addr, server, _state) = spawn_server(Config::default()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/view/ABC123");

    client
        .post(&url)
        .json(&json!({ "image": png("KEEP") }))
        .send()
        .await
        .unwrap();

    let oversized = png(&"A".repeat(MAX_IMAGE_CHARS));
    let resp = client
        .post(&url)
        .json(&json!({ "image": oversized }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(resp.text().await.unwrap(), "Image too large");

    let resp = client
        .post(&url)
        .json(&json!({ "image": "data:text/html;base64,AA" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let resp = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "Image required");

    let resp = client
        .get(format!("http://{addr}/api/view/toolongcode"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let snapshot: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(snapshot["image"], png("KEEP"));

    server.abort();
}

#[tokio::test]
async fn kv_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, server, _state) = spawn_server(kv_config(&dir)).await;
    let transport = HttpTransport::new(&format!("http://{addr}")).unwrap();
    let code = normalize("PERSIST").unwrap();
    transport.publish(&code, png("BB")).await.unwrap();
    server.abort();
    let _ = server.await;

    let (addr, server, _state) = spawn_server(kv_config(&dir)).await;
    let transport = HttpTransport::new(&format!("http://{addr}")).unwrap();
    let rooms = transport.rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].code, code);
    server.abort();
}
