//! Persistent-channel events.
//!
//! Every message is a JSON object tagged by `type`. Field names are camelCase.
//! Job events (`commandOutput`, `commandComplete`, `commandError`) carry a
//! per-session sequence number so a client that reconnects can tell the server
//! what it has already seen.

use serde::{Deserialize, Serialize};

// ============================================================================
// Client -> Server
// ============================================================================

/// Events sent by a client over the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Create a session (or reuse the caller's stable mapping).
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },

    /// Subscribe this connection to an existing session.
    ///
    /// Buffered job events with a sequence number greater than `last_seq` are
    /// replayed before live events.
    JoinSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seq: Option<u64>,
    },

    /// Run a command in the session.
    ExecuteCommand { session_id: String, command: String },

    /// Cancel the session's in-flight command, if any.
    CancelCommand { session_id: String },

    /// Acknowledge job events up to and including `seq`.
    Ack { session_id: String, seq: u64 },

    /// Destroy the session.
    EndSession { session_id: String },

    /// Keepalive reply.
    Pong,
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Events sent by the server over the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Connection established.
    Connected,

    /// Keepalive.
    Ping,

    /// Failure not tied to a running command.
    Error { message: String, retryable: bool },

    SessionCreated {
        session_id: String,
        user_id: String,
        expires_in_ms: u64,
        working_directory: String,
    },

    SessionJoined {
        session_id: String,
        expires_in_ms: u64,
        /// Number of buffered events replayed to this connection.
        replayed: usize,
    },

    /// The session expired and was replaced. Subscriptions now follow the new id.
    SessionRenewed {
        old_session_id: String,
        new_session_id: String,
    },

    SessionExpired { session_id: String, message: String },

    SessionEnded { session_id: String },

    /// Incremental fragment of the running command's combined output.
    CommandOutput {
        session_id: String,
        seq: u64,
        chunk: String,
    },

    /// The command exited. Non-zero exit codes are reported here, not as errors.
    CommandComplete {
        session_id: String,
        seq: u64,
        exit_code: i32,
        working_directory: String,
    },

    /// The command could not run or was cancelled.
    CommandError {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        message: String,
        retryable: bool,
    },
}

impl ServerEvent {
    /// Session this event belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Connected | ServerEvent::Ping | ServerEvent::Error { .. } => None,
            ServerEvent::SessionCreated { session_id, .. }
            | ServerEvent::SessionJoined { session_id, .. }
            | ServerEvent::SessionExpired { session_id, .. }
            | ServerEvent::SessionEnded { session_id }
            | ServerEvent::CommandOutput { session_id, .. }
            | ServerEvent::CommandComplete { session_id, .. }
            | ServerEvent::CommandError { session_id, .. } => Some(session_id),
            ServerEvent::SessionRenewed { new_session_id, .. } => Some(new_session_id),
        }
    }

    /// Sequence number of a job event.
    pub fn seq(&self) -> Option<u64> {
        match self {
            ServerEvent::CommandOutput { seq, .. } | ServerEvent::CommandComplete { seq, .. } => {
                Some(*seq)
            }
            ServerEvent::CommandError { seq, .. } => *seq,
            _ => None,
        }
    }

    /// Whether this event ends a command.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::CommandComplete { .. } | ServerEvent::CommandError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_wire_names() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"executeCommand","sessionId":"s1","command":"ls"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::ExecuteCommand {
                session_id: "s1".to_string(),
                command: "ls".to_string(),
            }
        );

        let event: ClientEvent = serde_json::from_str(r#"{"type":"createSession"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::CreateSession {
                user_id: None,
                device_id: None,
            }
        );
    }

    #[test]
    fn test_server_event_serialization() {
        let event = ServerEvent::CommandComplete {
            session_id: "s1".to_string(),
            seq: 4,
            exit_code: 7,
            working_directory: "~".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "commandComplete");
        assert_eq!(json["exitCode"], 7);
        assert_eq!(json["workingDirectory"], "~");
        assert_eq!(event.seq(), Some(4));
        assert!(event.is_terminal());
    }

    #[test]
    fn test_command_error_without_seq() {
        let event = ServerEvent::CommandError {
            session_id: "s1".to_string(),
            seq: None,
            message: "busy".to_string(),
            retryable: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("seq"));
        assert_eq!(event.seq(), None);
    }

    #[test]
    fn test_renewed_routes_to_new_session() {
        let event = ServerEvent::SessionRenewed {
            old_session_id: "old".to_string(),
            new_session_id: "new".to_string(),
        };
        assert_eq!(event.session_id(), Some("new"));
        assert!(!event.is_terminal());
    }
}
