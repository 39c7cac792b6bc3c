use crate::types::JsonValue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Event kinds emitted over the lifetime of one execution.
///
/// `started` precedes all node events; exactly one of `completed`, `failed`
/// or `cancelled` terminates the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Started,
    Completed,
    Failed,
    Cancelled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeStatusUpdate,
    ExecutionProgress,
    TriggerExpired,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Completed | EventKind::Failed | EventKind::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(execution_id: Uuid, kind: EventKind) -> Self {
        Self {
            execution_id,
            kind,
            workflow_id: None,
            node_id: None,
            status: None,
            progress: None,
            data: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_node(mut self, node_id: Uuid) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_progress(mut self, completed: usize, total: usize) -> Self {
        self.progress = Some(ProgressSnapshot { completed, total });
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: JsonValue) -> Self {
        self.error = Some(error);
        self
    }
}

/// Capability the engine uses to emit events.
///
/// The engine depends on this one-way: the fabric (or any other sink)
/// implements it and never reaches back into the engine.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: ExecutionEvent);
}

/// Fans one event out to several sinks in order.
pub struct EventFanout {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl EventFanout {
    pub fn new(sinks: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventPublisher for EventFanout {
    async fn publish(&self, event: ExecutionEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone()).await;
        }
    }
}

/// Sink that forwards events onto an mpsc channel. Useful for observers that
/// consume the stream from a task of their own, and for tests.
pub struct ChannelPublisher {
    tx: tokio::sync::mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: ExecutionEvent) {
        // Receiver dropped means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// No-op sink for contexts that do not care about events.
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn publish(&self, _event: ExecutionEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&EventKind::NodeStatusUpdate).unwrap();
        assert_eq!(json, "\"node-status-update\"");
        let json = serde_json::to_string(&EventKind::ExecutionProgress).unwrap();
        assert_eq!(json, "\"execution-progress\"");
    }

    #[test]
    fn terminal_kinds() {
        assert!(EventKind::Completed.is_terminal());
        assert!(EventKind::Failed.is_terminal());
        assert!(EventKind::Cancelled.is_terminal());
        assert!(!EventKind::NodeCompleted.is_terminal());
    }

    #[tokio::test]
    async fn fanout_delivers_to_all_sinks() {
        let (first, mut rx1) = ChannelPublisher::new();
        let (second, mut rx2) = ChannelPublisher::new();
        let fanout = EventFanout::new(vec![Arc::new(first), Arc::new(second)]);

        let event = ExecutionEvent::new(Uuid::new_v4(), EventKind::Started);
        fanout.publish(event.clone()).await;

        assert_eq!(rx1.recv().await.unwrap().execution_id, event.execution_id);
        assert_eq!(rx2.recv().await.unwrap().execution_id, event.execution_id);
    }
}
