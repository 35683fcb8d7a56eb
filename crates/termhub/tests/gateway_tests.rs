//! End-to-end tests of the persistent channel over a real socket.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use termhub_protocol::{ClientEvent, ServerEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

mod common;
use common::TestEnv;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

async fn serve(env: &TestEnv) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = env.app();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    assert_eq!(next_event(&mut ws).await, ServerEvent::Connected);
    ws
}

async fn send(ws: &mut WsStream, event: &ClientEvent) {
    let json = serde_json::to_string(event).unwrap();
    ws.send(Message::text(json)).await.unwrap();
}

/// Next server event, skipping keepalives.
async fn next_event(ws: &mut WsStream) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(EVENT_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            let event: ServerEvent = serde_json::from_str(text.as_str()).unwrap();
            if event != ServerEvent::Ping {
                return event;
            }
        }
    }
}

/// Events up to and including the command's terminal event.
async fn until_terminal(ws: &mut WsStream) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(ws).await;
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

fn output_of(events: &[ServerEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::CommandOutput { chunk, .. } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

async fn create_session(ws: &mut WsStream, user_id: &str) -> String {
    send(
        ws,
        &ClientEvent::CreateSession {
            user_id: Some(user_id.to_string()),
            device_id: None,
        },
    )
    .await;
    match next_event(ws).await {
        ServerEvent::SessionCreated {
            session_id,
            user_id: created_for,
            working_directory,
            ..
        } => {
            assert_eq!(created_for, user_id);
            assert_eq!(working_directory, "~");
            session_id
        }
        other => panic!("expected sessionCreated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_execute_streams_output_and_exit_code() {
    let env = TestEnv::new();
    let addr = serve(&env).await;
    let mut ws = connect(addr).await;
    let session_id = create_session(&mut ws, "alice").await;

    send(
        &mut ws,
        &ClientEvent::ExecuteCommand {
            session_id: session_id.clone(),
            command: "echo hi; exit 3".to_string(),
        },
    )
    .await;
    let events = until_terminal(&mut ws).await;

    assert_eq!(output_of(&events), "hi\n");
    match events.last().unwrap() {
        ServerEvent::CommandComplete {
            session_id: sid,
            exit_code,
            ..
        } => {
            assert_eq!(sid, &session_id);
            assert_eq!(*exit_code, 3);
        }
        other => panic!("expected commandComplete, got {other:?}"),
    }

    // Sequence numbers increase strictly.
    let seqs: Vec<u64> = events.iter().filter_map(ServerEvent::seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_reconnect_replays_missed_events_once() {
    let env = TestEnv::new();
    let addr = serve(&env).await;

    let mut ws = connect(addr).await;
    let session_id = create_session(&mut ws, "alice").await;
    send(
        &mut ws,
        &ClientEvent::ExecuteCommand {
            session_id: session_id.clone(),
            command: "echo one; sleep 1; echo two".to_string(),
        },
    )
    .await;

    let (first_chunk, first_seq) = match next_event(&mut ws).await {
        ServerEvent::CommandOutput { chunk, seq, .. } => (chunk, seq),
        other => panic!("expected commandOutput, got {other:?}"),
    };
    assert_eq!(first_chunk, "one\n");

    // Drop the transport; the command keeps running.
    ws.close(None).await.unwrap();
    drop(ws);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut ws = connect(addr).await;
    send(
        &mut ws,
        &ClientEvent::JoinSession {
            session_id: session_id.clone(),
            last_seq: Some(first_seq),
        },
    )
    .await;

    let replayed_events = until_terminal(&mut ws).await;
    assert_eq!(output_of(&replayed_events), "two\n");
    assert!(matches!(
        replayed_events.last(),
        Some(ServerEvent::CommandComplete { exit_code: 0, .. })
    ));
    assert!(replayed_events.iter().all(|e| e.seq() > Some(first_seq)));

    match next_event(&mut ws).await {
        ServerEvent::SessionJoined { replayed, .. } => {
            assert_eq!(replayed, replayed_events.len());
        }
        other => panic!("expected sessionJoined, got {other:?}"),
    }

    // The terminal event is delivered exactly once.
    let extra = tokio::time::timeout(Duration::from_millis(300), next_event(&mut ws)).await;
    assert!(extra.is_err(), "unexpected event {extra:?}");
}

#[tokio::test]
async fn test_second_command_while_busy_is_rejected() {
    let env = TestEnv::new();
    let addr = serve(&env).await;
    let mut ws = connect(addr).await;
    let session_id = create_session(&mut ws, "alice").await;

    send(
        &mut ws,
        &ClientEvent::ExecuteCommand {
            session_id: session_id.clone(),
            command: "echo started; sleep 1".to_string(),
        },
    )
    .await;
    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::CommandOutput { .. }
    ));

    send(
        &mut ws,
        &ClientEvent::ExecuteCommand {
            session_id: session_id.clone(),
            command: "echo too-soon".to_string(),
        },
    )
    .await;

    match next_event(&mut ws).await {
        ServerEvent::CommandError {
            seq,
            retryable,
            message,
            ..
        } => {
            assert_eq!(seq, None);
            assert!(!retryable);
            assert!(message.contains("already running"));
        }
        other => panic!("expected commandError, got {other:?}"),
    }

    // The first command still completes.
    let events = until_terminal(&mut ws).await;
    assert!(matches!(
        events.last(),
        Some(ServerEvent::CommandComplete { exit_code: 0, .. })
    ));
}

#[tokio::test]
async fn test_cancel_command() {
    let env = TestEnv::new();
    let addr = serve(&env).await;
    let mut ws = connect(addr).await;
    let session_id = create_session(&mut ws, "alice").await;

    send(
        &mut ws,
        &ClientEvent::ExecuteCommand {
            session_id: session_id.clone(),
            command: "echo started; sleep 30".to_string(),
        },
    )
    .await;
    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::CommandOutput { .. }
    ));

    send(
        &mut ws,
        &ClientEvent::CancelCommand {
            session_id: session_id.clone(),
        },
    )
    .await;
    let events = until_terminal(&mut ws).await;
    match events.last().unwrap() {
        ServerEvent::CommandError {
            message, retryable, ..
        } => {
            assert_eq!(message, "Command cancelled");
            assert!(!retryable);
        }
        other => panic!("expected commandError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_end_session() {
    let env = TestEnv::new();
    let addr = serve(&env).await;
    let mut ws = connect(addr).await;
    let session_id = create_session(&mut ws, "alice").await;

    send(
        &mut ws,
        &ClientEvent::EndSession {
            session_id: session_id.clone(),
        },
    )
    .await;
    assert_eq!(
        next_event(&mut ws).await,
        ServerEvent::SessionEnded {
            session_id: session_id.clone()
        }
    );
    assert!(env.registry().get(&session_id).await.is_err());

    send(
        &mut ws,
        &ClientEvent::ExecuteCommand {
            session_id,
            command: "ls".to_string(),
        },
    )
    .await;
    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::CommandError { seq: None, .. }
    ));
}

#[tokio::test]
async fn test_invalid_message_reports_error() {
    let env = TestEnv::new();
    let addr = serve(&env).await;
    let mut ws = connect(addr).await;

    ws.send(Message::text(r#"{"type":"launchRockets"}"#))
        .await
        .unwrap();
    match next_event(&mut ws).await {
        ServerEvent::Error { message, retryable } => {
            assert!(message.starts_with("Invalid message"));
            assert!(!retryable);
        }
        other => panic!("expected error, got {other:?}"),
    }

    // The connection stays usable.
    create_session(&mut ws, "alice").await;
}
