//! Server-sent events framing.

use bytes::Bytes;
use std::time::Duration;

use super::LiveEvent;

pub const SNAPSHOT_EVENT: &str = "snapshot";

/// Render one event as an SSE frame.
///
/// Snapshots carry their `updatedAt` as the event id so a reconnecting
/// client can tell where it left off.
pub fn encode(event: &LiveEvent) -> Result<Bytes, serde_json::Error> {
    let text = match event {
        LiveEvent::Retry(delay) => format!("retry: {}\n\n", delay.as_millis()),
        LiveEvent::Snapshot(snapshot) => {
            let data = serde_json::to_string(snapshot)?;
            match snapshot.updated_at {
                Some(id) => format!("id: {id}\nevent: {SNAPSHOT_EVENT}\ndata: {data}\n\n"),
                None => format!("event: {SNAPSHOT_EVENT}\ndata: {data}\n\n"),
            }
        }
        LiveEvent::Heartbeat(at) => format!(": ping {at}\n\n"),
    };
    Ok(Bytes::from(text))
}

/// A dispatched SSE message. Comment-only blocks are never produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<Duration>,
}

/// Incremental SSE parser fed with arbitrary byte chunks.
///
/// Lines may end in `\n`, `\r\n` or a bare `\r`, mixed freely; a blank
/// line dispatches the pending frame.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    // last byte seen was a CR, so a following LF belongs to the same line break
    after_cr: bool,
    pending: SseFrame,
    data_lines: Vec<String>,
    seen_field: bool,
}

impl SseDecoder {
    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    if let Some(frame) = self.end_line() {
                        frames.push(frame);
                    }
                }
                _ => {
                    self.after_cr = false;
                    self.line.push(byte);
                }
            }
        }
        frames
    }

    fn end_line(&mut self) -> Option<SseFrame> {
        if self.line.is_empty() {
            return self.dispatch();
        }
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line.as_str(), ""),
        };
        self.seen_field = true;
        match field {
            "id" => self.pending.id = Some(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "retry" => {
                self.pending.retry = value.trim().parse().ok().map(Duration::from_millis)
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if !std::mem::take(&mut self.seen_field) {
            return None;
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.data = std::mem::take(&mut self.data_lines).join("\n");
        Some(frame)
    }
}
