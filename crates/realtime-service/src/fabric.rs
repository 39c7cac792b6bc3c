use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::config::FabricConfig;
use common::events::{EventPublisher, ExecutionEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

fn execution_room(execution_id: Uuid) -> String {
    format!("execution:{}", execution_id)
}

fn workflow_room(workflow_id: Uuid) -> String {
    format!("workflow:{}", workflow_id)
}

struct Subscriber {
    user_id: Uuid,
    sender: mpsc::Sender<ExecutionEvent>,
}

#[derive(Default)]
struct FabricState {
    connections: HashMap<Uuid, Subscriber>,
    rooms: HashMap<String, HashSet<Uuid>>,
    buffers: HashMap<Uuid, VecDeque<ExecutionEvent>>,
    /// Executions in buffer-creation order, oldest first, for FIFO eviction.
    buffer_order: VecDeque<Uuid>,
}

/// Buffered fan-out of execution events.
///
/// Subscribers join `execution:<id>` and `workflow:<id>` rooms; every
/// published event lands in a bounded per-execution ring buffer so late
/// subscribers to an execution room get a replay before live delivery.
pub struct EventFabric {
    state: Mutex<FabricState>,
    config: FabricConfig,
}

impl EventFabric {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            state: Mutex::new(FabricState::default()),
            config,
        }
    }

    /// Periodic retention sweep: drops expired events, then empty buffers.
    pub fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        });
    }

    /// Register an authenticated connection; events for its rooms arrive on
    /// the returned channel.
    pub async fn register_connection(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::Receiver<ExecutionEvent>) {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_channel_size);
        let connection_id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state
            .connections
            .insert(connection_id, Subscriber { user_id, sender });
        debug!(%connection_id, %user_id, "realtime connection registered");
        (connection_id, receiver)
    }

    pub async fn unregister_connection(&self, connection_id: Uuid) {
        let mut state = self.state.lock().await;
        state.connections.remove(&connection_id);
        for members in state.rooms.values_mut() {
            members.remove(&connection_id);
        }
        state.rooms.retain(|_, members| !members.is_empty());
        debug!(%connection_id, "realtime connection unregistered");
    }

    /// Join an execution room. The buffered history replays to this
    /// connection in arrival order before any live event.
    pub async fn join_execution(&self, connection_id: Uuid, execution_id: Uuid) {
        let mut state = self.state.lock().await;
        state
            .rooms
            .entry(execution_room(execution_id))
            .or_default()
            .insert(connection_id);

        let replay: Vec<ExecutionEvent> = state
            .buffers
            .get(&execution_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default();
        if let Some(subscriber) = state.connections.get(&connection_id) {
            for event in replay {
                if subscriber.sender.try_send(event).is_err() {
                    warn!(%connection_id, "subscriber channel full during replay");
                    break;
                }
            }
        }
    }

    pub async fn join_workflow(&self, connection_id: Uuid, workflow_id: Uuid) {
        let mut state = self.state.lock().await;
        state
            .rooms
            .entry(workflow_room(workflow_id))
            .or_default()
            .insert(connection_id);
    }

    pub async fn leave_execution(&self, connection_id: Uuid, execution_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(members) = state.rooms.get_mut(&execution_room(execution_id)) {
            members.remove(&connection_id);
        }
    }

    pub async fn leave_workflow(&self, connection_id: Uuid, workflow_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(members) = state.rooms.get_mut(&workflow_room(workflow_id)) {
            members.remove(&connection_id);
        }
    }

    /// Drop the execution's room membership and its buffer.
    pub async fn cleanup_room(&self, execution_id: Uuid) {
        let mut state = self.state.lock().await;
        state.rooms.remove(&execution_room(execution_id));
        state.buffers.remove(&execution_id);
        state.buffer_order.retain(|id| *id != execution_id);
    }

    /// Deliver to both rooms and append to the execution's ring buffer,
    /// evicting the oldest buffered execution past the global cap.
    pub async fn publish_event(&self, event: ExecutionEvent) {
        let execution_id = event.execution_id;
        let mut state = self.state.lock().await;

        if !state.buffers.contains_key(&execution_id) {
            if state.buffer_order.len() >= self.config.max_buffered_executions {
                if let Some(evicted) = state.buffer_order.pop_front() {
                    state.buffers.remove(&evicted);
                    debug!(execution_id = %evicted, "evicted oldest buffered execution");
                }
            }
            state.buffers.insert(execution_id, VecDeque::new());
            state.buffer_order.push_back(execution_id);
        }
        let cap = self.config.max_events_per_execution;
        if let Some(buffer) = state.buffers.get_mut(&execution_id) {
            buffer.push_back(event.clone());
            while buffer.len() > cap {
                buffer.pop_front();
            }
        }

        // Union of both room memberships; one delivery per connection.
        let mut recipients: HashSet<Uuid> = HashSet::new();
        if let Some(members) = state.rooms.get(&execution_room(execution_id)) {
            recipients.extend(members.iter().copied());
        }
        if let Some(workflow_id) = event.workflow_id {
            if let Some(members) = state.rooms.get(&workflow_room(workflow_id)) {
                recipients.extend(members.iter().copied());
            }
        }

        for connection_id in recipients {
            if let Some(subscriber) = state.connections.get(&connection_id) {
                if subscriber.sender.try_send(event.clone()).is_err() {
                    warn!(%connection_id, "subscriber channel full, dropping event");
                }
            }
        }
    }

    /// Drop events past retention, then buffers left empty.
    pub async fn sweep(&self) {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(self.config.retention_ms as i64);
        let mut state = self.state.lock().await;
        for buffer in state.buffers.values_mut() {
            while buffer
                .front()
                .map(|event| event.timestamp < cutoff)
                .unwrap_or(false)
            {
                buffer.pop_front();
            }
        }
        let empty: HashSet<Uuid> = state
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if !empty.is_empty() {
            state.buffers.retain(|id, _| !empty.contains(id));
            state.buffer_order.retain(|id| !empty.contains(id));
        }
    }

    pub async fn buffered_execution_count(&self) -> usize {
        self.state.lock().await.buffers.len()
    }

    pub async fn buffered_event_count(&self, execution_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .buffers
            .get(&execution_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn connection_user(&self, connection_id: Uuid) -> Option<Uuid> {
        self.state
            .lock()
            .await
            .connections
            .get(&connection_id)
            .map(|s| s.user_id)
    }
}

#[async_trait]
impl EventPublisher for EventFabric {
    async fn publish(&self, event: ExecutionEvent) {
        self.publish_event(event).await;
    }
}
