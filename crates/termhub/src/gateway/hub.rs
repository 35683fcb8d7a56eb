//! Per-session fan-out with a bounded replay buffer.
//!
//! Every session with channel subscribers has a [`SessionChannel`]: the
//! connections currently subscribed, the next job-event sequence number and
//! the job events not yet acknowledged. A connection that drops and rejoins
//! within the grace period gets the events it missed replayed before live
//! ones. Once a channel has been without subscribers for longer than the
//! grace period, its buffered events are discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use termhub_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::config::GatewayConfig;

/// How long a publish waits for a slow connection before dropping it.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A sender for events to one connection.
pub type ConnectionSender = mpsc::Sender<ServerEvent>;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on buffered job events per session, in serialized bytes.
    pub replay_buffer_bytes: usize,
    /// How long buffered events wait for a subscriber.
    pub reconnect_grace: Duration,
}

impl HubConfig {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            replay_buffer_bytes: config.replay_buffer_bytes,
            reconnect_grace: Duration::from_secs(config.reconnect_grace_secs),
        }
    }
}

#[derive(Debug)]
struct Buffered {
    seq: u64,
    size: usize,
    event: ServerEvent,
}

#[derive(Debug)]
struct Subscriber {
    conn_id: u64,
    tx: ConnectionSender,
}

#[derive(Debug)]
struct SessionChannel {
    subscribers: Vec<Subscriber>,
    replay: VecDeque<Buffered>,
    replay_bytes: usize,
    next_seq: u64,
    acked: u64,
    /// When the last subscriber left.
    detached_at: Option<Instant>,
}

impl SessionChannel {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            replay: VecDeque::new(),
            replay_bytes: 0,
            next_seq: 1,
            acked: 0,
            detached_at: Some(Instant::now()),
        }
    }

    fn grace_expired(&self, grace: Duration) -> bool {
        self.subscribers.is_empty() && self.detached_at.is_some_and(|at| at.elapsed() > grace)
    }

    fn clear_replay(&mut self) {
        self.replay.clear();
        self.replay_bytes = 0;
    }

    fn buffer(&mut self, seq: u64, event: ServerEvent, cap: usize) {
        let size = serde_json::to_vec(&event).map(|v| v.len()).unwrap_or(0);
        self.replay.push_back(Buffered { seq, size, event });
        self.replay_bytes += size;

        // Drop the oldest output first; completions are kept while possible.
        while self.replay_bytes > cap && !self.replay.is_empty() {
            let victim = self
                .replay
                .iter()
                .position(|b| !b.event.is_terminal())
                .unwrap_or(0);
            if let Some(dropped) = self.replay.remove(victim) {
                self.replay_bytes -= dropped.size;
            }
        }
    }

    fn detach_if_empty(&mut self) {
        if self.subscribers.is_empty() && self.detached_at.is_none() {
            self.detached_at = Some(Instant::now());
        }
    }

    async fn deliver(&mut self, session_id: &str, event: &ServerEvent) {
        let mut dead = Vec::new();
        for sub in &self.subscribers {
            if let Err(e) = sub.tx.send_timeout(event.clone(), SEND_TIMEOUT).await {
                warn!(
                    "Dropping connection {} from session {}: {}",
                    sub.conn_id, session_id, e
                );
                dead.push(sub.conn_id);
            }
        }
        if !dead.is_empty() {
            self.subscribers.retain(|s| !dead.contains(&s.conn_id));
            self.detach_if_empty();
        }
    }
}

/// Fan-out hub for session events.
pub struct SessionHub {
    channels: DashMap<String, Arc<Mutex<SessionChannel>>>,
    config: HubConfig,
}

impl SessionHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
        }
    }

    fn channel(&self, session_id: &str) -> Arc<Mutex<SessionChannel>> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionChannel::new())))
            .clone()
    }

    fn existing(&self, session_id: &str) -> Option<Arc<Mutex<SessionChannel>>> {
        self.channels.get(session_id).map(|c| c.clone())
    }

    /// Publish a job event. `make` receives the event's sequence number.
    ///
    /// The event is buffered for replay unless the channel has been without
    /// subscribers for longer than the grace period.
    pub async fn publish(&self, session_id: &str, make: impl FnOnce(u64) -> ServerEvent) -> u64 {
        let channel = self.channel(session_id);
        let mut channel = channel.lock().await;

        let seq = channel.next_seq;
        channel.next_seq += 1;
        let event = make(seq);

        if channel.grace_expired(self.config.reconnect_grace) {
            if !channel.replay.is_empty() {
                debug!(
                    "Discarding {} buffered event(s) of session {} after grace period",
                    channel.replay.len(),
                    session_id
                );
                channel.clear_replay();
            }
        } else {
            channel.buffer(seq, event.clone(), self.config.replay_buffer_bytes);
        }

        channel.deliver(session_id, &event).await;
        seq
    }

    /// Send an event to current subscribers without buffering it.
    pub async fn notify(&self, session_id: &str, event: ServerEvent) {
        if let Some(channel) = self.existing(session_id) {
            channel.lock().await.deliver(session_id, &event).await;
        }
    }

    /// Subscribe a connection, replaying buffered job events with a sequence
    /// number above `last_seq` (or above the last acknowledgement).
    ///
    /// Returns the number of events replayed.
    pub async fn subscribe(
        &self,
        session_id: &str,
        conn_id: u64,
        tx: ConnectionSender,
        last_seq: Option<u64>,
    ) -> usize {
        let channel = self.channel(session_id);
        let mut channel = channel.lock().await;

        if channel.grace_expired(self.config.reconnect_grace) {
            channel.clear_replay();
        }

        let after = last_seq.unwrap_or(channel.acked);
        let mut replayed = 0;
        for buffered in channel.replay.iter().filter(|b| b.seq > after) {
            if tx.send(buffered.event.clone()).await.is_err() {
                return replayed;
            }
            replayed += 1;
        }

        channel.subscribers.retain(|s| s.conn_id != conn_id);
        channel.subscribers.push(Subscriber { conn_id, tx });
        channel.detached_at = None;

        if replayed > 0 {
            info!(
                "Replayed {} event(s) of session {} to connection {}",
                replayed, session_id, conn_id
            );
        }
        replayed
    }

    pub async fn unsubscribe(&self, session_id: &str, conn_id: u64) {
        if let Some(channel) = self.existing(session_id) {
            let mut channel = channel.lock().await;
            channel.subscribers.retain(|s| s.conn_id != conn_id);
            channel.detach_if_empty();
        }
    }

    /// Forget buffered events up to and including `seq`.
    pub async fn ack(&self, session_id: &str, seq: u64) {
        if let Some(channel) = self.existing(session_id) {
            let mut channel = channel.lock().await;
            channel.acked = channel.acked.max(seq);
            while channel.replay.front().is_some_and(|b| b.seq <= seq) {
                if let Some(dropped) = channel.replay.pop_front() {
                    channel.replay_bytes -= dropped.size;
                }
            }
        }
    }

    /// Move the subscribers of `old` to `new` after a session was renewed.
    pub async fn retarget(&self, old: &str, new: &str) -> usize {
        let Some((_, old_channel)) = self.channels.remove(old) else {
            return 0;
        };
        let subscribers = std::mem::take(&mut old_channel.lock().await.subscribers);
        let moved = subscribers.len();

        let channel = self.channel(new);
        let mut channel = channel.lock().await;
        for sub in subscribers {
            channel.subscribers.retain(|s| s.conn_id != sub.conn_id);
            channel.subscribers.push(sub);
        }
        if !channel.subscribers.is_empty() {
            channel.detached_at = None;
        }
        debug!("Moved {} subscriber(s) from {} to {}", moved, old, new);
        moved
    }

    /// Drop the session's channel.
    pub fn close(&self, session_id: &str) {
        self.channels.remove(session_id);
    }

    /// Drop channels left without subscribers past the grace period.
    pub async fn prune(&self) -> usize {
        let candidates: Vec<(String, Arc<Mutex<SessionChannel>>)> = self
            .channels
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut pruned = 0;
        for (session_id, channel) in candidates {
            if channel.lock().await.grace_expired(self.config.reconnect_grace) {
                self.channels
                    .remove_if(&session_id, |_, c| Arc::ptr_eq(c, &channel));
                pruned += 1;
            }
        }
        pruned
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        match self.existing(session_id) {
            Some(channel) => channel.lock().await.subscribers.len(),
            None => 0,
        }
    }

    pub async fn buffered_count(&self, session_id: &str) -> usize {
        match self.existing(session_id) {
            Some(channel) => channel.lock().await.replay.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(grace: Duration) -> SessionHub {
        SessionHub::new(HubConfig {
            replay_buffer_bytes: 64 * 1024,
            reconnect_grace: grace,
        })
    }

    fn output(seq: u64, chunk: &str) -> ServerEvent {
        ServerEvent::CommandOutput {
            session_id: "s1".to_string(),
            seq,
            chunk: chunk.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let hub = hub(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe("s1", 1, tx, None).await;

        assert_eq!(hub.publish("s1", |seq| output(seq, "a")).await, 1);
        assert_eq!(hub.publish("s1", |seq| output(seq, "b")).await, 2);

        assert_eq!(rx.recv().await.unwrap(), output(1, "a"));
        assert_eq!(rx.recv().await.unwrap(), output(2, "b"));
    }

    #[tokio::test]
    async fn test_rejoin_replays_missed_events() {
        let hub = hub(Duration::from_secs(60));
        let (tx, rx) = mpsc::channel(8);
        hub.subscribe("s1", 1, tx, None).await;
        hub.publish("s1", |seq| output(seq, "a")).await;
        drop(rx);
        // Delivery to the dropped connection fails and detaches it.
        hub.publish("s1", |seq| output(seq, "b")).await;
        assert_eq!(hub.subscriber_count("s1").await, 0);
        hub.publish("s1", |seq| output(seq, "c")).await;

        let (tx, mut rx) = mpsc::channel(8);
        let replayed = hub.subscribe("s1", 2, tx, Some(1)).await;
        assert_eq!(replayed, 2);
        assert_eq!(rx.recv().await.unwrap(), output(2, "b"));
        assert_eq!(rx.recv().await.unwrap(), output(3, "c"));
    }

    #[tokio::test]
    async fn test_ack_trims_replay() {
        let hub = hub(Duration::from_secs(60));
        for chunk in ["a", "b", "c"] {
            hub.publish("s1", |seq| output(seq, chunk)).await;
        }
        hub.ack("s1", 2).await;
        assert_eq!(hub.buffered_count("s1").await, 1);

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(hub.subscribe("s1", 1, tx, None).await, 1);
        assert_eq!(rx.recv().await.unwrap(), output(3, "c"));
    }

    #[tokio::test]
    async fn test_buffer_discarded_after_grace() {
        let hub = hub(Duration::from_millis(20));
        hub.publish("s1", |seq| output(seq, "a")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(hub.subscribe("s1", 1, tx, Some(0)).await, 0);
    }

    #[tokio::test]
    async fn test_replay_buffer_is_bounded() {
        let hub = SessionHub::new(HubConfig {
            replay_buffer_bytes: 300,
            reconnect_grace: Duration::from_secs(60),
        });
        for _ in 0..20 {
            hub.publish("s1", |seq| output(seq, "0123456789")).await;
        }
        hub.publish("s1", |seq| ServerEvent::CommandComplete {
            session_id: "s1".to_string(),
            seq,
            exit_code: 0,
            working_directory: "~".to_string(),
        })
        .await;

        let (tx, mut rx) = mpsc::channel(64);
        let replayed = hub.subscribe("s1", 1, tx, Some(0)).await;
        assert!(replayed < 21);
        let mut last = None;
        for _ in 0..replayed {
            last = rx.recv().await;
        }
        assert!(last.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_retarget_moves_subscribers() {
        let hub = hub(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe("old", 7, tx, None).await;

        assert_eq!(hub.retarget("old", "new").await, 1);
        assert_eq!(hub.subscriber_count("old").await, 0);

        hub.notify("new", ServerEvent::SessionEnded {
            session_id: "new".to_string(),
        })
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::SessionEnded { .. })
        ));
    }
}
