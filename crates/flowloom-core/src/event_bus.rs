use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use flowloom_types::BusEvent;

/// Capacity of each subscriber channel. A subscriber that falls further
/// behind than this loses its oldest pending events (tail-drop); the
/// connection itself stays open.
const SUBSCRIBER_CAPACITY: usize = 256;

struct StreamState {
    cursor: u64,
    buffer: VecDeque<BusEvent>,
    tx: broadcast::Sender<BusEvent>,
}

impl StreamState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            cursor: 0,
            buffer: VecDeque::new(),
            tx,
        }
    }
}

/// Outcome of a replay request.
#[derive(Debug, Clone)]
pub enum Replay {
    Events(Vec<BusEvent>),
    /// The requested cursor predates the buffered window; the caller must
    /// resync from scratch.
    CannotReplay,
}

/// Per-key ordered event channel with a bounded replay buffer.
///
/// Each key owns a monotonically increasing cursor starting at 0. Published
/// events are appended to a ring buffer (bounded by length and TTL, evicted
/// on publish) and fanned out to subscribers over bounded channels.
#[derive(Clone)]
pub struct EventBus {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    buffer_maxlen: usize,
    buffer_ttl: Duration,
}

impl EventBus {
    pub fn new(buffer_maxlen: usize, buffer_ttl: Duration) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            buffer_maxlen,
            buffer_ttl,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(500, Duration::from_secs(300))
    }

    /// Appends an event to the key's buffer and fans it out. Returns the
    /// assigned cursor.
    pub async fn publish(&self, key: &str, event_type: &str, data: Value) -> u64 {
        let mut streams = self.streams.lock().await;
        let state = streams
            .entry(key.to_string())
            .or_insert_with(StreamState::new);
        state.cursor += 1;
        let event = BusEvent::new(state.cursor, event_type, data);

        state.buffer.push_back(event.clone());
        while state.buffer.len() > self.buffer_maxlen {
            state.buffer.pop_front();
        }
        let ttl_ms = self.buffer_ttl.as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        while state
            .buffer
            .front()
            .is_some_and(|e| now_ms - e.ts > ttl_ms)
        {
            state.buffer.pop_front();
        }

        let _ = state.tx.send(event);
        state.cursor
    }

    /// Opens a live channel for the key and returns it with the current
    /// cursor. Dropping the receiver unsubscribes.
    pub async fn subscribe(&self, key: &str) -> (broadcast::Receiver<BusEvent>, u64) {
        let mut streams = self.streams.lock().await;
        let state = streams
            .entry(key.to_string())
            .or_insert_with(StreamState::new);
        (state.tx.subscribe(), state.cursor)
    }

    /// Whether a client at `since` can be caught up from the buffer alone.
    pub async fn can_replay(&self, key: &str, since: i64) -> bool {
        let mut streams = self.streams.lock().await;
        let state = streams
            .entry(key.to_string())
            .or_insert_with(StreamState::new);
        since >= Self::earliest(state) - 1
    }

    /// Buffered events with `cursor > since`, in order.
    pub async fn replay(&self, key: &str, since: i64) -> Replay {
        let mut streams = self.streams.lock().await;
        let state = streams
            .entry(key.to_string())
            .or_insert_with(StreamState::new);
        if since < Self::earliest(state) - 1 {
            return Replay::CannotReplay;
        }
        let events = state
            .buffer
            .iter()
            .filter(|e| (e.cursor as i64) > since)
            .cloned()
            .collect();
        Replay::Events(events)
    }

    pub async fn current_cursor(&self, key: &str) -> u64 {
        let streams = self.streams.lock().await;
        streams.get(key).map(|s| s.cursor).unwrap_or(0)
    }

    // With an empty buffer nothing has been missed as long as the caller is
    // at or past the head.
    fn earliest(state: &StreamState) -> i64 {
        state
            .buffer
            .front()
            .map(|e| e.cursor as i64)
            .unwrap_or(state.cursor as i64 + 1)
    }
}
