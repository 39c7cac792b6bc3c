use crate::fabric::EventFabric;
use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection parameters. Authentication happens upstream; the fabric is
/// handed the already-authenticated user id.
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub user_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: String,
    execution_id: Option<Uuid>,
    workflow_id: Option<Uuid>,
}

/// Drive one upgraded WebSocket connection against the fabric: initial room
/// joins from the query, a forward task for outbound events, and an inbound
/// loop for subscribe/unsubscribe messages.
pub async fn handle_socket(socket: WebSocket, fabric: Arc<EventFabric>, query: WsQuery) {
    let (connection_id, mut events) = fabric.register_connection(query.user_id).await;
    if let Some(execution_id) = query.execution_id {
        fabric.join_execution(connection_id, execution_id).await;
    }
    if let Some(workflow_id) = query.workflow_id {
        fabric.join_workflow(connection_id, workflow_id).await;
    }
    info!(%connection_id, user_id = %query.user_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let message = match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    error!("failed to serialize event: {}", e);
                    continue;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let recv_fabric = fabric.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            handle_client_message(&recv_fabric, connection_id, message).await;
                        }
                        Err(e) => {
                            warn!(%connection_id, error = %e, "unparseable client message");
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(%connection_id, "websocket closed by client");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(_)) => {
                    warn!(%connection_id, "ignoring binary websocket message");
                }
                Err(e) => {
                    error!(%connection_id, error = %e, "websocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    fabric.unregister_connection(connection_id).await;
    info!(%connection_id, "websocket disconnected");
}

async fn handle_client_message(
    fabric: &Arc<EventFabric>,
    connection_id: Uuid,
    message: ClientMessage,
) {
    match (message.action.as_str(), message.execution_id, message.workflow_id) {
        ("subscribe", Some(execution_id), _) => {
            fabric.join_execution(connection_id, execution_id).await;
        }
        ("subscribe", None, Some(workflow_id)) => {
            fabric.join_workflow(connection_id, workflow_id).await;
        }
        ("unsubscribe", Some(execution_id), _) => {
            fabric.leave_execution(connection_id, execution_id).await;
        }
        ("unsubscribe", None, Some(workflow_id)) => {
            fabric.leave_workflow(connection_id, workflow_id).await;
        }
        (action, _, _) => {
            warn!(%connection_id, action, "unknown websocket action");
        }
    }
}
