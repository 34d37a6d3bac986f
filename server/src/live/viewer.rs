use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use view_api::{RoomCode, Snapshot};

use super::sse::{SseDecoder, SNAPSHOT_EVENT};
use super::{ChannelState, CloseReason};
use crate::clock::Clock;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// How a viewer reaches the server.
#[async_trait]
pub trait ViewTransport: Send + Sync {
    /// Open the room's event stream. Fails if the server answered with
    /// anything other than an event stream.
    async fn open_stream(&self, code: &RoomCode) -> Result<ByteStream>;

    async fn fetch(&self, code: &RoomCode) -> Result<Snapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerSettings {
    /// How long a fresh stream may stay silent before falling back to polling.
    pub grace: Duration,
    pub poll_interval: Duration,
    /// Reconnect delay after a clean end of stream, unless the server sent one.
    pub reconnect: Duration,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            reconnect: Duration::from_secs(2),
        }
    }
}

enum StreamOutcome {
    /// Stream ended cleanly after delivering; reconnect after the delay.
    Ended(Duration),
    Failed,
    Closed(CloseReason),
}

/// Client half of the live channel.
///
/// Prefers the server's event stream and degrades to fixed-interval polling
/// if the stream stays silent past the grace period or errors. Either way the
/// consumer receives the same [`Snapshot`]s, one per change of `updatedAt`.
pub struct Viewer<T> {
    transport: T,
    clock: Arc<dyn Clock>,
    settings: ViewerSettings,
    state: watch::Sender<ChannelState>,
    last_forwarded: Option<Option<i64>>,
}

impl<T: ViewTransport> Viewer<T> {
    pub fn new(transport: T, clock: Arc<dyn Clock>, settings: ViewerSettings) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            transport,
            clock,
            settings,
            state,
            last_forwarded: None,
        }
    }

    /// Observe state transitions while `run` is in progress.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn set_state(&self, code: &RoomCode, state: ChannelState) {
        debug!(room = %code, ?state, "viewer state");
        self.state.send_replace(state);
    }

    /// Follow a room until cancelled or the consumer drops `updates`.
    pub async fn run(
        mut self,
        code: RoomCode,
        updates: mpsc::Sender<Snapshot>,
        cancel: CancellationToken,
    ) -> CloseReason {
        let reason = loop {
            self.set_state(&code, ChannelState::Connecting);
            match self.stream(&code, &updates, &cancel).await {
                StreamOutcome::Ended(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break CloseReason::Cancelled,
                        _ = updates.closed() => break CloseReason::Cancelled,
                        _ = self.clock.sleep(delay) => {}
                    }
                }
                StreamOutcome::Failed => {
                    self.set_state(&code, ChannelState::Degraded);
                    break self.poll(&code, &updates, &cancel).await;
                }
                StreamOutcome::Closed(reason) => break reason,
            }
        };
        self.set_state(&code, ChannelState::Closed(reason));
        reason
    }

    async fn forward(
        &mut self,
        snapshot: Snapshot,
        updates: &mpsc::Sender<Snapshot>,
    ) -> Result<(), CloseReason> {
        if self.last_forwarded == Some(snapshot.updated_at) {
            return Ok(());
        }
        self.last_forwarded = Some(snapshot.updated_at);
        updates
            .send(snapshot)
            .await
            .map_err(|_| CloseReason::Cancelled)
    }

    async fn stream(
        &mut self,
        code: &RoomCode,
        updates: &mpsc::Sender<Snapshot>,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        // the grace period covers connecting as well as the first event
        let clock = self.clock.clone();
        let grace = clock.sleep(self.settings.grace);
        tokio::pin!(grace);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Closed(CloseReason::Cancelled),
            _ = &mut grace => {
                debug!(room = %code, "live stream not established within grace period");
                return StreamOutcome::Failed;
            }
            opened = self.transport.open_stream(code) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) => {
                warn!(room = %code, error = %e, "live stream unavailable; polling instead");
                return StreamOutcome::Failed;
            }
        };

        let mut decoder = SseDecoder::default();
        let mut delivered = false;
        let mut retry = self.settings.reconnect;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Closed(CloseReason::Cancelled),
                _ = &mut grace, if !delivered => {
                    debug!(room = %code, "no snapshot within grace period");
                    return StreamOutcome::Failed;
                }
                chunk = body.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    warn!(room = %code, error = %e, "live stream broke; polling instead");
                    return StreamOutcome::Failed;
                }
                None if delivered => return StreamOutcome::Ended(retry),
                None => return StreamOutcome::Failed,
            };
            for frame in decoder.push(&bytes) {
                if let Some(delay) = frame.retry {
                    retry = delay;
                }
                if frame.event.as_deref() != Some(SNAPSHOT_EVENT) {
                    continue;
                }
                let snapshot = match serde_json::from_str::<Snapshot>(&frame.data) {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(room = %code, error = %e, "ignoring malformed snapshot event");
                        continue;
                    }
                };
                if !delivered {
                    delivered = true;
                    self.set_state(code, ChannelState::Streaming);
                }
                if let Err(reason) = self.forward(snapshot, updates).await {
                    return StreamOutcome::Closed(reason);
                }
            }
        }
    }

    async fn poll(
        &mut self,
        code: &RoomCode,
        updates: &mpsc::Sender<Snapshot>,
        cancel: &CancellationToken,
    ) -> CloseReason {
        self.set_state(code, ChannelState::Polling);
        loop {
            if cancel.is_cancelled() {
                return CloseReason::Cancelled;
            }
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                fetched = self.transport.fetch(code) => fetched,
            };
            match fetched {
                Ok(snapshot) => {
                    if let Err(reason) = self.forward(snapshot, updates).await {
                        return reason;
                    }
                }
                Err(e) => warn!(room = %code, error = %e, "snapshot poll failed; retrying"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                _ = updates.closed() => return CloseReason::Cancelled,
                _ = self.clock.sleep(self.settings.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::live::{sse, LiveEvent};
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use view_api::normalize;

    enum StreamPlan {
        Refuse,
        /// Connection accepted but response headers never arrive.
        Hang,
        Silent,
        Frames(Vec<LiveEvent>, bool),
    }

    struct FakeTransport {
        plan: Mutex<VecDeque<StreamPlan>>,
        polls: Mutex<VecDeque<Snapshot>>,
        fetches: AtomicUsize,
        stall_fetches: AtomicBool,
    }

    impl FakeTransport {
        fn new(plans: Vec<StreamPlan>, polls: Vec<Snapshot>) -> Self {
            Self {
                plan: Mutex::new(plans.into()),
                polls: Mutex::new(polls.into()),
                fetches: AtomicUsize::new(0),
                stall_fetches: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ViewTransport for Arc<FakeTransport> {
        async fn open_stream(&self, _code: &RoomCode) -> Result<ByteStream> {
            let plan = self.plan.lock().pop_front().unwrap_or(StreamPlan::Silent);
            match plan {
                StreamPlan::Refuse => anyhow::bail!("not an event stream"),
                StreamPlan::Hang => std::future::pending().await,
                StreamPlan::Silent => Ok(stream::pending().boxed()),
                StreamPlan::Frames(events, then_error) => {
                    let mut chunks: Vec<Result<Bytes>> = events
                        .iter()
                        .map(|e| Ok(sse::encode(e).unwrap()))
                        .collect();
                    if then_error {
                        chunks.push(Err(anyhow::anyhow!("connection reset")));
                    }
                    Ok(stream::iter(chunks).boxed())
                }
            }
        }

        async fn fetch(&self, _code: &RoomCode) -> Result<Snapshot> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.stall_fetches.load(Ordering::SeqCst) {
                return std::future::pending().await;
            }
            let mut polls = self.polls.lock();
            match polls.len() {
                0 => anyhow::bail!("offline"),
                1 => Ok(polls[0].clone()),
                _ => Ok(polls.pop_front().unwrap_or_default()),
            }
        }
    }

    fn snap(at: i64) -> Snapshot {
        Snapshot {
            image: Some(format!("data:image/png;base64,{at}")),
            updated_at: Some(at),
        }
    }

    fn viewer(transport: Arc<FakeTransport>) -> Viewer<Arc<FakeTransport>> {
        Viewer::new(transport, Arc::new(SystemClock), ViewerSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_falls_back_to_polling() {
        let transport = Arc::new(FakeTransport::new(
            vec![StreamPlan::Silent],
            vec![snap(1), snap(1), snap(2)],
        ));
        let viewer = viewer(transport.clone());
        let states = viewer.subscribe_state();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(viewer.run(normalize("ABC").unwrap(), tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(snap(1)));
        assert_eq!(*states.borrow(), ChannelState::Polling);
        assert_eq!(rx.recv().await, Some(snap(2)));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);
        assert_eq!(
            *states.borrow(),
            ChannelState::Closed(CloseReason::Cancelled)
        );
        assert!(transport.fetches.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_then_degrades_on_error() {
        let transport = Arc::new(FakeTransport::new(
            vec![StreamPlan::Frames(
                vec![
                    LiveEvent::Retry(Duration::from_secs(2)),
                    LiveEvent::Snapshot(snap(1)),
                    LiveEvent::Heartbeat(5),
                    LiveEvent::Snapshot(snap(2)),
                ],
                true,
            )],
            vec![snap(2), snap(3)],
        ));
        let viewer = viewer(transport.clone());
        let states = viewer.subscribe_state();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(viewer.run(normalize("ABC").unwrap(), tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(snap(1)));
        assert_eq!(rx.recv().await, Some(snap(2)));
        // the first poll repeats snap(2) and is not forwarded again
        assert_eq!(rx.recv().await, Some(snap(3)));
        assert_eq!(*states.borrow(), ChannelState::Polling);
        drop(rx);
        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_end_reconnects_to_stream() {
        let transport = Arc::new(FakeTransport::new(
            vec![
                StreamPlan::Frames(vec![LiveEvent::Snapshot(snap(1))], false),
                StreamPlan::Frames(vec![LiveEvent::Snapshot(snap(4))], false),
                StreamPlan::Silent,
            ],
            vec![snap(4)],
        ));
        let viewer = viewer(transport.clone());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(viewer.run(normalize("ABC").unwrap(), tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(snap(1)));
        assert_eq!(rx.recv().await, Some(snap(4)));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_stream_polls_and_survives_fetch_errors() {
        let transport = Arc::new(FakeTransport::new(vec![StreamPlan::Refuse], vec![]));
        let viewer = viewer(transport.clone());
        let states = viewer.subscribe_state();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(viewer.run(normalize("ABC").unwrap(), tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(*states.borrow(), ChannelState::Polling);
        assert!(transport.fetches.load(Ordering::SeqCst) >= 3);
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connect_falls_back_within_grace() {
        let transport = Arc::new(FakeTransport::new(vec![StreamPlan::Hang], vec![snap(7)]));
        let viewer = viewer(transport.clone());
        let states = viewer.subscribe_state();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(viewer.run(normalize("ABC").unwrap(), tx, cancel.clone()));

        assert_eq!(rx.recv().await, Some(snap(7)));
        assert!(started.elapsed() <= Duration::from_secs(2) + Duration::from_millis(50));
        assert_eq!(*states.borrow(), ChannelState::Polling);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_in_flight_poll() {
        let transport = Arc::new(FakeTransport::new(vec![StreamPlan::Refuse], vec![]));
        transport.stall_fetches.store(true, Ordering::SeqCst);
        let viewer = viewer(transport.clone());
        let states = viewer.subscribe_state();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(viewer.run(normalize("ABC").unwrap(), tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*states.borrow(), ChannelState::Polling);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        cancel.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("viewer kept waiting on the poll")
            .unwrap();
        assert_eq!(reason, CloseReason::Cancelled);
    }
}
