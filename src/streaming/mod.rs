//! Per-task event streams.
//!
//! Each task has at most one stream: a bounded `broadcast` channel that any
//! number of subscribers (SSE connections) can read. Streams expire after a
//! period of inactivity and the oldest are evicted once the global ceiling
//! is exceeded. Dropping a stream's sender ends every subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::task::{TaskId, TaskLog, TaskStatus};

/// Messages buffered per stream before slow subscribers start lagging.
pub const STREAM_BUFFER: usize = 256;

/// How often the sweeper looks for expired streams.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Progress,
    Log,
    Error,
    Complete,
    StatusChange,
}

impl StreamKind {
    /// SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Progress => "progress",
            StreamKind::Log => "log",
            StreamKind::Error => "error",
            StreamKind::Complete => "complete",
            StreamKind::StatusChange => "status_change",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StreamMessage {
    fn new(kind: StreamKind, task_id: &TaskId, data: Value, message: Option<String>) -> Self {
        Self {
            kind,
            task_id: task_id.clone(),
            timestamp: Utc::now(),
            data,
            message,
        }
    }

    pub fn progress(task_id: &TaskId, data: Value) -> Self {
        Self::new(StreamKind::Progress, task_id, data, None)
    }

    /// A task log entry; `data` is the serialized [`TaskLog`].
    pub fn log(task_id: &TaskId, log: &TaskLog) -> Self {
        let data = serde_json::to_value(log).unwrap_or(Value::Null);
        Self::new(StreamKind::Log, task_id, data, Some(log.message.clone()))
    }

    pub fn error(task_id: &TaskId, message: impl Into<String>) -> Self {
        Self::new(StreamKind::Error, task_id, Value::Null, Some(message.into()))
    }

    pub fn complete(task_id: &TaskId, data: Value) -> Self {
        Self::new(StreamKind::Complete, task_id, data, None)
    }

    pub fn status_change(task_id: &TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        Self::new(
            StreamKind::StatusChange,
            task_id,
            json!({ "from": from, "to": to }),
            Some(format!("{} -> {}", from, to)),
        )
    }

    /// Log entry carried by a `log` message, if any.
    pub fn as_log(&self) -> Option<TaskLog> {
        if self.kind != StreamKind::Log {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Handle returned by [`EventStreamer::create_stream`].
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
    sender: broadcast::Sender<StreamMessage>,
}

impl StreamHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.sender.subscribe()
    }
}

struct StreamEntry {
    handle: StreamHandle,
    last_activity: Instant,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub total: usize,
    /// Streams with at least one subscriber
    pub active: usize,
    pub subscribers: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub struct EventStreamer {
    config: StreamConfig,
    streams: RwLock<HashMap<TaskId, StreamEntry>>,
}

impl EventStreamer {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the stream for `task_id`.
    ///
    /// Re-creating an existing stream only refreshes its activity time; the
    /// handle (and `created_at`) stay the same.
    pub async fn create_stream(&self, task_id: &TaskId) -> StreamHandle {
        let mut streams = self.streams.write().await;
        if let Some(entry) = streams.get_mut(task_id) {
            entry.last_activity = Instant::now();
            return entry.handle.clone();
        }

        while streams.len() >= self.config.max_streams.max(1) {
            let oldest = streams
                .iter()
                .min_by_key(|(_, entry)| entry.handle.created_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    tracing::debug!(task_id = %id, "Evicting oldest stream");
                    streams.remove(&id);
                }
                None => break,
            }
        }

        let (sender, _) = broadcast::channel(STREAM_BUFFER);
        let handle = StreamHandle {
            stream_id: Uuid::new_v4().to_string(),
            task_id: task_id.clone(),
            created_at: Utc::now(),
            sender,
        };
        streams.insert(
            task_id.clone(),
            StreamEntry {
                handle: handle.clone(),
                last_activity: Instant::now(),
            },
        );
        tracing::debug!(task_id = %task_id, "Stream created");
        handle
    }

    /// Subscribe to an existing stream.
    pub async fn subscribe(&self, task_id: &TaskId) -> Option<broadcast::Receiver<StreamMessage>> {
        self.streams
            .read()
            .await
            .get(task_id)
            .map(|entry| entry.handle.subscribe())
    }

    /// Publish to `task_id`'s stream. Returns how many subscribers received it.
    pub async fn publish(&self, task_id: &TaskId, message: StreamMessage) -> usize {
        let mut streams = self.streams.write().await;
        let Some(entry) = streams.get_mut(task_id) else {
            return 0;
        };
        entry.last_activity = Instant::now();
        entry.handle.sender.send(message).unwrap_or(0)
    }

    /// Close a stream; subscribers see the end of the channel.
    pub async fn close(&self, task_id: &TaskId) -> bool {
        let closed = self.streams.write().await.remove(task_id).is_some();
        if closed {
            tracing::debug!(task_id = %task_id, "Stream closed");
        }
        closed
    }

    pub async fn close_all(&self) -> usize {
        let mut streams = self.streams.write().await;
        let count = streams.len();
        streams.clear();
        count
    }

    /// Drop streams idle for longer than the configured timeout.
    pub async fn sweep_expired(&self) -> usize {
        let timeout = self.config.timeout;
        let mut streams = self.streams.write().await;
        let before = streams.len();
        streams.retain(|_, entry| entry.last_activity.elapsed() < timeout);
        let removed = before - streams.len();
        if removed > 0 {
            tracing::info!("Expired {} idle stream(s)", removed);
        }
        removed
    }

    /// Run [`Self::sweep_expired`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_expired().await;
                    }
                }
            }
        })
    }

    pub async fn stats(&self) -> StreamStats {
        let streams = self.streams.read().await;
        let mut stats = StreamStats {
            total: streams.len(),
            ..Default::default()
        };
        for entry in streams.values() {
            let receivers = entry.handle.sender.receiver_count();
            stats.subscribers += receivers;
            if receivers > 0 {
                stats.active += 1;
            }
            let created = entry.handle.created_at;
            stats.oldest = Some(stats.oldest.map_or(created, |o| o.min(created)));
            stats.newest = Some(stats.newest.map_or(created, |n| n.max(created)));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::LogLevel;

    fn streamer(timeout: Duration, max_streams: usize) -> EventStreamer {
        EventStreamer::new(StreamConfig {
            timeout,
            max_streams,
        })
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let streamer = streamer(Duration::from_secs(60), 10);
        let task = TaskId::new();
        let first = streamer.create_stream(&task).await;
        let second = streamer.create_stream(&task).await;
        assert_eq!(first.stream_id, second.stream_id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(streamer.stats().await.total, 1);
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let streamer = streamer(Duration::from_secs(60), 10);
        let task = TaskId::new();
        let mut rx = streamer.create_stream(&task).await.subscribe();

        for i in 0..3 {
            let log = TaskLog::new(LogLevel::Info, format!("step {}", i));
            assert_eq!(streamer.publish(&task, StreamMessage::log(&task, &log)).await, 1);
        }
        for i in 0..3 {
            let msg = rx.recv().await.expect("message");
            assert_eq!(msg.as_log().map(|l| l.message), Some(format!("step {}", i)));
        }
    }

    #[tokio::test]
    async fn publish_without_stream_is_dropped() {
        let streamer = streamer(Duration::from_secs(60), 10);
        let task = TaskId::new();
        assert_eq!(streamer.publish(&task, StreamMessage::error(&task, "x")).await, 0);
    }

    #[tokio::test]
    async fn close_ends_subscribers() {
        let streamer = streamer(Duration::from_secs(60), 10);
        let task = TaskId::new();
        let mut rx = streamer.create_stream(&task).await.subscribe();
        assert!(streamer.close(&task).await);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn oldest_stream_is_evicted_beyond_ceiling() {
        let streamer = streamer(Duration::from_secs(60), 2);
        let first = TaskId::new();
        streamer.create_stream(&first).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        streamer.create_stream(&TaskId::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        streamer.create_stream(&TaskId::new()).await;

        assert_eq!(streamer.stats().await.total, 2);
        assert!(streamer.subscribe(&first).await.is_none());
    }

    #[tokio::test]
    async fn idle_streams_expire() {
        let streamer = streamer(Duration::ZERO, 10);
        streamer.create_stream(&TaskId::new()).await;
        assert_eq!(streamer.sweep_expired().await, 1);
        assert_eq!(streamer.stats().await.total, 0);
    }
}
