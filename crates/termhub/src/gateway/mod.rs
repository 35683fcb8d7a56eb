//! Streaming gateway.
//!
//! Connects the persistent channel to the registry and executor. Commands
//! started here run as detached tasks: their output goes through the
//! [`SessionHub`] so a client that drops and rejoins does not lose it, and a
//! dropped connection never cancels the command.

mod handler;
mod hub;

pub use handler::ws_handler;
pub use hub::{ConnectionSender, HubConfig, SessionHub};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use termhub_protocol::ServerEvent;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, JobOutcome, JobStatus};
use crate::session::{Session, SessionRegistry};

/// Queue length between a running command and its publisher.
const JOB_CHUNK_BUFFER: usize = 64;

/// Interval of the task dropping abandoned session channels.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

pub struct StreamingGateway {
    registry: Arc<SessionRegistry>,
    executor: Arc<CommandExecutor>,
    hub: SessionHub,
    config: GatewayConfig,
    next_conn: AtomicU64,
}

impl StreamingGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        executor: Arc<CommandExecutor>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            hub: SessionHub::new(HubConfig::from_config(&config)),
            config,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn hub(&self) -> &SessionHub {
        &self.hub
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.config.ping_interval_secs.max(1))
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Touch a session, renewing it once if it expired.
    ///
    /// After a renewal the old session's subscribers follow the new id and
    /// receive `sessionRenewed` plus a notice in the output stream.
    pub async fn resolve_session(&self, session_id: &str) -> Result<Session> {
        match self.registry.touch(session_id).await {
            Err(Error::SessionExpired(_)) => {}
            other => return other,
        }

        let renewed = self.registry.renew(session_id).await?;
        if renewed.id == session_id {
            return Ok(renewed);
        }

        info!("Session {} expired, continuing as {}", session_id, renewed.id);
        self.executor.forget(session_id);
        self.hub.retarget(session_id, &renewed.id).await;
        self.hub
            .notify(&renewed.id, ServerEvent::SessionRenewed {
                old_session_id: session_id.to_string(),
                new_session_id: renewed.id.clone(),
            })
            .await;

        let short: String = renewed.id.chars().take(8).collect();
        let notice = format!("Session expired. Created new session: {short}...\n");
        let new_id = renewed.id.clone();
        self.hub
            .publish(&renewed.id, |seq| ServerEvent::CommandOutput {
                session_id: new_id,
                seq,
                chunk: notice,
            })
            .await;

        Ok(renewed)
    }

    /// Start a command in the background.
    ///
    /// Fails with `Busy` right away when the session already runs a command.
    /// Everything else (policy, path checks, the exit code) is reported through
    /// the session's channel as `commandError` or `commandComplete`.
    pub fn execute_detached(self: &Arc<Self>, session: Session, command: String) -> Result<()> {
        if self.executor.is_busy(&session.id) {
            return Err(Error::Busy(session.id));
        }
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            gateway.run_job(session, command).await;
        });
        Ok(())
    }

    async fn run_job(self: Arc<Self>, session: Session, command: String) {
        let session_id = session.id.clone();
        let (tx, mut rx) = mpsc::channel::<String>(JOB_CHUNK_BUFFER);

        let publisher = {
            let gateway = Arc::clone(&self);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let id = session_id.clone();
                    gateway
                        .hub
                        .publish(&session_id, |seq| ServerEvent::CommandOutput {
                            session_id: id,
                            seq,
                            chunk,
                        })
                        .await;
                }
            })
        };

        let result = self
            .executor
            .execute(&session, &command, Some(tx), CancellationToken::new())
            .await;

        // Output is published before the terminal event.
        if let Err(e) = publisher.await {
            warn!("Output publisher of session {} failed: {}", session_id, e);
        }
        let _ = self.registry.touch(&session_id).await;

        let id = session_id.clone();
        self.hub
            .publish(&session_id, |seq| terminal_event(id, seq, result))
            .await;
    }

    /// Cancel the session's running command.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.executor.cancel(session_id)
    }

    /// Destroy a session, stopping its command and closing its channel.
    pub async fn end_session(&self, session_id: &str) -> bool {
        self.executor.forget(session_id);
        let existed = self.registry.destroy(session_id).await;
        self.hub
            .notify(session_id, ServerEvent::SessionEnded {
                session_id: session_id.to_string(),
            })
            .await;
        self.hub.close(session_id);
        existed
    }

    /// Tell subscribers about sessions the registry expired.
    pub fn start_expiry_listener(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut expirations = self.registry.subscribe_expirations();
        tokio::spawn(async move {
            loop {
                match expirations.recv().await {
                    Ok(expired) => {
                        self.executor.forget(&expired.session_id);
                        self.hub
                            .notify(&expired.session_id, ServerEvent::SessionExpired {
                                session_id: expired.session_id.clone(),
                                message: "Session expired due to inactivity".to_string(),
                            })
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Expiry listener lagged, {} notification(s) lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Periodically drop channels nobody rejoined.
    pub fn start_pruner(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                let pruned = self.hub.prune().await;
                if pruned > 0 {
                    debug!("Pruned {} abandoned session channel(s)", pruned);
                }
            }
        })
    }

    /// Stop running commands and destroy every session.
    pub async fn shutdown(&self) {
        self.executor.cancel_all();
        self.registry.shutdown().await;
    }
}

fn terminal_event(session_id: String, seq: u64, result: Result<JobOutcome>) -> ServerEvent {
    match result {
        Ok(outcome) => match outcome.status {
            JobStatus::Cancelled => ServerEvent::CommandError {
                session_id,
                seq: Some(seq),
                message: "Command cancelled".to_string(),
                retryable: false,
            },
            JobStatus::Completed { .. } | JobStatus::TimedOut => ServerEvent::CommandComplete {
                session_id,
                seq,
                exit_code: outcome.exit_code(),
                working_directory: outcome.working_directory,
            },
        },
        Err(e) => ServerEvent::CommandError {
            session_id,
            seq: Some(seq),
            retryable: e.retryable(),
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: JobStatus) -> JobOutcome {
        JobOutcome {
            status,
            output: String::new(),
            truncated: false,
            working_directory: "~/t".to_string(),
        }
    }

    #[test]
    fn test_terminal_event_for_non_zero_exit_is_complete() {
        let event = terminal_event(
            "s1".to_string(),
            4,
            Ok(outcome(JobStatus::Completed { exit_code: 7 })),
        );
        assert_eq!(
            event,
            ServerEvent::CommandComplete {
                session_id: "s1".to_string(),
                seq: 4,
                exit_code: 7,
                working_directory: "~/t".to_string(),
            }
        );
    }

    #[test]
    fn test_terminal_event_for_cancel_and_errors() {
        let cancelled = terminal_event("s1".to_string(), 1, Ok(outcome(JobStatus::Cancelled)));
        assert!(matches!(cancelled, ServerEvent::CommandError { retryable: false, .. }));

        let timed_out = terminal_event("s1".to_string(), 2, Ok(outcome(JobStatus::TimedOut)));
        assert!(matches!(
            timed_out,
            ServerEvent::CommandComplete { exit_code: 124, .. }
        ));

        let denied = terminal_event(
            "s1".to_string(),
            3,
            Err(Error::AccessDenied("../../etc/passwd".to_string())),
        );
        match denied {
            ServerEvent::CommandError {
                seq,
                message,
                retryable,
                ..
            } => {
                assert_eq!(seq, Some(3));
                assert!(message.starts_with("Access denied."));
                assert!(!retryable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
