//! Socket side of the persistent channel: framing, keepalives and dispatch
//! of client events to the gateway.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use termhub_protocol::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::StreamingGateway;
use super::hub::ConnectionSender;
use crate::api::AppState;
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Join this session right after connecting.
    pub session_id: Option<String>,
    /// Checked by the auth middleware; browsers cannot set headers on upgrades.
    pub api_key: Option<String>,
}

/// `GET /ws`: upgrade and run the connection until the client goes away.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| run_connection(socket, gateway, query.session_id))
}

fn encode(event: &ServerEvent) -> Option<Message> {
    serde_json::to_string(event)
        .map(|json| Message::Text(json.into()))
        .inspect_err(|e| error!("Unserializable server event {event:?}: {e}"))
        .ok()
}

/// Forwards queued events to the socket and emits keepalives.
async fn pump_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<ServerEvent>,
    every: Duration,
) {
    let mut keepalive = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        let event = tokio::select! {
            next = events.recv() => match next {
                Some(event) => event,
                None => return,
            },
            _ = keepalive.tick() => ServerEvent::Ping,
        };
        let Some(message) = encode(&event) else {
            continue;
        };
        if sink.send(message).await.is_err() {
            return;
        }
    }
}

async fn run_connection(
    socket: WebSocket,
    gateway: Arc<StreamingGateway>,
    initial_session: Option<String>,
) {
    let conn_id = gateway.next_connection_id();
    let (mut sink, mut stream) = socket.split();

    let Some(hello) = encode(&ServerEvent::Connected) else {
        return;
    };
    if let Err(e) = sink.send(hello).await {
        debug!("Connection {conn_id} dropped before greeting: {e}");
        return;
    }
    info!("Connection {conn_id} opened");

    let (tx, rx) = mpsc::channel(gateway.config().connection_buffer.max(1));
    let writer = tokio::spawn(pump_outbound(sink, rx, gateway.ping_interval()));

    let mut conn = Connection {
        id: conn_id,
        gateway,
        tx,
        joined: HashSet::new(),
    };
    if let Some(session_id) = initial_session {
        conn.dispatch(ClientEvent::JoinSession {
            session_id,
            last_seq: None,
        })
        .await;
    }

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Connection {conn_id} read error: {e}");
                break;
            }
        };
        match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(event) => conn.dispatch(event).await,
            Err(e) => {
                debug!("Connection {conn_id} sent an unparsable frame: {e}");
                conn.send(ServerEvent::Error {
                    message: format!("Invalid message: {e}"),
                    retryable: false,
                })
                .await;
            }
        }
    }

    // Jobs outlive the transport; their events wait in the replay buffer.
    writer.abort();
    for session_id in &conn.joined {
        conn.gateway.hub().unsubscribe(session_id, conn_id).await;
    }
    info!("Connection {conn_id} closed");
}

/// Per-connection state: the sessions this connection is subscribed to.
struct Connection {
    id: u64,
    gateway: Arc<StreamingGateway>,
    tx: ConnectionSender,
    joined: HashSet<String>,
}

impl Connection {
    async fn send(&self, event: ServerEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Connection {} is gone, dropping event", self.id);
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) {
        let command_session = match &event {
            ClientEvent::ExecuteCommand { session_id, .. } => Some(session_id.clone()),
            _ => None,
        };

        if let Err(e) = self.handle(event).await {
            debug!("Event on connection {} failed: {}", self.id, e);
            let event = match command_session {
                Some(session_id) => ServerEvent::CommandError {
                    session_id,
                    seq: None,
                    message: e.to_string(),
                    retryable: e.retryable(),
                },
                None => ServerEvent::Error {
                    message: e.to_string(),
                    retryable: e.retryable(),
                },
            };
            self.send(event).await;
        }
    }

    async fn handle(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Pong => Ok(()),

            ClientEvent::CreateSession { user_id, device_id } => {
                let session = self
                    .gateway
                    .registry()
                    .create(user_id.as_deref(), device_id.as_deref())
                    .await?;
                self.subscribe(&session.id, None).await;
                self.send(ServerEvent::SessionCreated {
                    session_id: session.id.clone(),
                    user_id: session.user_id.clone(),
                    expires_in_ms: millis(self.gateway.registry().expires_in(&session)),
                    working_directory: self.gateway.executor().working_directory(&session),
                })
                .await;
                Ok(())
            }

            ClientEvent::JoinSession {
                session_id,
                last_seq,
            } => {
                let session = self.resolve(&session_id).await?;
                let replayed = self.subscribe(&session.id, last_seq).await;
                self.send(ServerEvent::SessionJoined {
                    session_id: session.id.clone(),
                    expires_in_ms: millis(self.gateway.registry().expires_in(&session)),
                    replayed,
                })
                .await;
                Ok(())
            }

            ClientEvent::ExecuteCommand {
                session_id,
                command,
            } => {
                let session = self.resolve(&session_id).await?;
                if !self.joined.contains(&session.id) {
                    self.subscribe(&session.id, None).await;
                }
                self.gateway.execute_detached(session, command)
            }

            ClientEvent::CancelCommand { session_id } => {
                if !self.gateway.cancel(&session_id) {
                    return Err(Error::validation(format!(
                        "No command is running in session {session_id}"
                    )));
                }
                Ok(())
            }

            ClientEvent::Ack { session_id, seq } => {
                self.gateway.hub().ack(&session_id, seq).await;
                Ok(())
            }

            ClientEvent::EndSession { session_id } => {
                let subscribed = self.joined.remove(&session_id);
                self.gateway.end_session(&session_id).await;
                if !subscribed {
                    self.send(ServerEvent::SessionEnded { session_id }).await;
                }
                Ok(())
            }
        }
    }

    /// Look the session up, following a renewal if it had expired.
    async fn resolve(&mut self, session_id: &str) -> Result<crate::session::Session> {
        let session = self.gateway.resolve_session(session_id).await?;
        if session.id != session_id {
            // Subscribed connections were moved and told by the hub.
            if self.joined.remove(session_id) {
                self.joined.insert(session.id.clone());
            } else {
                self.send(ServerEvent::SessionRenewed {
                    old_session_id: session_id.to_string(),
                    new_session_id: session.id.clone(),
                })
                .await;
            }
        }
        Ok(session)
    }

    async fn subscribe(&mut self, session_id: &str, last_seq: Option<u64>) -> usize {
        self.joined.insert(session_id.to_string());
        self.gateway
            .hub()
            .subscribe(session_id, self.id, self.tx.clone(), last_seq)
            .await
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
