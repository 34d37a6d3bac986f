mod common;

use common::{png, spawn_server};
use futures::StreamExt;
use pawpaint_view::{
    client::HttpTransport,
    clock::SystemClock,
    config::Config,
    live::{ChannelState, SseDecoder, Viewer, ViewerSettings},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use view_api::{normalize, Snapshot};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn stream_opens_with_current_snapshot_then_pushes_updates() {
    let (addr, server, _state) = spawn_server(Config::default()).await;
    let transport = HttpTransport::new(&format!("http://{addr}")).unwrap();
    let code = normalize("ABC123").unwrap();
    transport.publish(&code, png("ONE")).await.unwrap();

    let resp = reqwest::get(format!("http://{addr}/api/view/abc123/stream?mode=live"))
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["content-type"],
        "text/event-stream; charset=utf-8"
    );
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut snapshots = Vec::new();

    timeout(WAIT, async {
        while snapshots.len() < 2 {
            let chunk = body.next().await.unwrap().unwrap();
            for frame in decoder.push(&chunk) {
                if frame.event.as_deref() != Some("snapshot") {
                    assert_eq!(frame.retry, Some(Duration::from_secs(2)));
                    continue;
                }
                let snapshot: Snapshot = serde_json::from_str(&frame.data).unwrap();
                assert_eq!(frame.id, snapshot.updated_at.map(|t| t.to_string()));
                if snapshots.is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    transport.publish(&code, png("TWO")).await.unwrap();
                }
                snapshots.push(snapshot);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(snapshots[0].image, Some(png("ONE")));
    assert_eq!(snapshots[1].image, Some(png("TWO")));
    drop(body);
    server.abort();
}

async fn follow(config: Config) -> ChannelState {
    let (addr, server, _state) = spawn_server(config).await;
    let transport = HttpTransport::new(&format!("http://{addr}")).unwrap();
    let code = normalize("WATCH").unwrap();
    transport.publish(&code, png("ONE")).await.unwrap();

    let settings = ViewerSettings {
        poll_interval: Duration::from_millis(100),
        ..ViewerSettings::default()
    };
    let viewer = Viewer::new(transport.clone(), Arc::new(SystemClock), settings);
    let states = viewer.subscribe_state();
    let (tx, mut rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(viewer.run(code.clone(), tx, cancel.clone()));

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.image, Some(png("ONE")));
    // let the updatedAt move past the first write
    tokio::time::sleep(Duration::from_millis(5)).await;
    transport.publish(&code, png("TWO")).await.unwrap();
    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.image, Some(png("TWO")));

    let state = *states.borrow();
    cancel.cancel();
    task.await.unwrap();
    server.abort();
    state
}

#[tokio::test]
async fn viewer_follows_room_over_stream() {
    assert_eq!(follow(Config::default()).await, ChannelState::Streaming);
}

#[tokio::test]
async fn viewer_polls_when_streaming_is_disabled() {
    let config = Config {
        streaming: false,
        ..Config::default()
    };
    assert_eq!(follow(config).await, ChannelState::Polling);
}
