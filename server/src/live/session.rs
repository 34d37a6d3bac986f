use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use view_api::RoomCode;

use super::{ChannelState, CloseReason, LiveEvent};
use crate::clock::Clock;
use crate::store::SnapshotStore;

/// Timing knobs for server-side sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Poll interval while a room is being drawn on.
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    /// A room written this recently counts as being drawn on.
    pub recent_activity: Duration,
    pub heartbeat: Duration,
    /// Hard cap on a session; clients reconnect afterwards.
    pub max_lifetime: Duration,
    pub retry: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_millis(250),
            slow_interval: Duration::from_secs(1),
            recent_activity: Duration::from_secs(5),
            heartbeat: Duration::from_secs(15),
            max_lifetime: Duration::from_secs(60 * 10),
            retry: Duration::from_secs(2),
        }
    }
}

/// Server half of the live channel for one open connection.
///
/// The loop sleeps, re-reads the room and forwards the snapshot whenever its
/// `updatedAt` moved. The cancellation token is checked after every sleep and
/// before every store read; a closed receiver counts as cancellation too.
pub struct LiveSession {
    id: Uuid,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    code: RoomCode,
    settings: StreamSettings,
    force_fast: bool,
    state: ChannelState,
}

impl LiveSession {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        code: RoomCode,
        settings: StreamSettings,
        force_fast: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            clock,
            code,
            settings,
            force_fast,
            state: ChannelState::Connecting,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn set_state(&mut self, state: ChannelState) {
        debug!(session = %self.id, room = %self.code, ?state, "live session state");
        self.state = state;
    }

    /// Interval before the next re-read given the last forwarded timestamp.
    pub fn poll_interval(&self, last_updated: Option<i64>, now: i64) -> Duration {
        let active = last_updated
            .map(|t| now.saturating_sub(t) < self.settings.recent_activity.as_millis() as i64)
            .unwrap_or(false);
        if self.force_fast || active {
            self.settings.fast_interval
        } else {
            self.settings.slow_interval
        }
    }

    /// Run until cancelled, the receiver goes away or the lifetime cap hits.
    pub async fn run(
        mut self,
        events: mpsc::Sender<LiveEvent>,
        cancel: CancellationToken,
    ) -> CloseReason {
        let reason = self.drive(&events, &cancel).await;
        self.set_state(ChannelState::Closed(reason));
        reason
    }

    async fn drive(
        &mut self,
        events: &mpsc::Sender<LiveEvent>,
        cancel: &CancellationToken,
    ) -> CloseReason {
        let started = self.clock.now_ms();
        let max_lifetime = self.settings.max_lifetime.as_millis() as i64;
        let heartbeat = self.settings.heartbeat.as_millis() as i64;

        if events.send(LiveEvent::Retry(self.settings.retry)).await.is_err() {
            return CloseReason::Cancelled;
        }
        if cancel.is_cancelled() {
            return CloseReason::Cancelled;
        }
        let initial = self.store.load(&self.code).await;
        let mut last_updated = initial.updated_at;
        if events.send(LiveEvent::Snapshot(initial)).await.is_err() {
            return CloseReason::Cancelled;
        }
        self.set_state(ChannelState::Streaming);

        let mut last_ping = started;
        loop {
            let now = self.clock.now_ms();
            if now - started >= max_lifetime {
                return CloseReason::IdleTimeout;
            }
            let interval = self.poll_interval(last_updated, now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                _ = events.closed() => return CloseReason::Cancelled,
                _ = self.clock.sleep(interval) => {}
            }
            if cancel.is_cancelled() || events.is_closed() {
                return CloseReason::Cancelled;
            }

            let snapshot = self.store.load(&self.code).await;
            if snapshot.updated_at != last_updated {
                last_updated = snapshot.updated_at;
                if events.send(LiveEvent::Snapshot(snapshot)).await.is_err() {
                    return CloseReason::Cancelled;
                }
            }

            let now = self.clock.now_ms();
            if now - last_ping >= heartbeat {
                last_ping = now;
                if events.send(LiveEvent::Heartbeat(now)).await.is_err() {
                    return CloseReason::Cancelled;
                }
            }
        }
    }
}
