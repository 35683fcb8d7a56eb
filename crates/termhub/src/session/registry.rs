//! Session registry.
//!
//! Maps session ids to users and their isolation handles, expires idle
//! sessions, and lets an expired session be replaced by a new one bound to
//! the same user (and therefore the same files, on persistent backends).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{Notify, broadcast};

use super::models::{Expiration, Session, SessionState};
use crate::config::SessionsConfig;
use crate::error::{Error, Result};
use crate::isolation::accounts::{MAX_USER_ID_LEN, validate_user_id};
use crate::isolation::{IsolationBackend, IsolationHandle, KeyedLocks};

const EXPIRATION_CHANNEL_CAPACITY: usize = 256;

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Idle time after which a session expires.
    pub timeout: Duration,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Anonymous handles kept provisioned ahead of demand.
    pub prewarm: usize,
    /// How long an expired session id stays renewable.
    pub renew_window: Duration,
}

impl RegistryConfig {
    pub fn from_config(config: &SessionsConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_sessions: config.max_sessions,
            prewarm: config.prewarm,
            renew_window: Duration::from_secs(config.renew_window_secs),
        }
    }
}

/// Who a new session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    User(String),
    Anonymous,
}

fn resolve_identity(user_id: Option<&str>, device_hint: Option<&str>) -> Result<Identity> {
    if let Some(user_id) = user_id.filter(|u| !u.is_empty()) {
        validate_user_id(user_id)?;
        return Ok(Identity::User(user_id.to_string()));
    }
    if let Some(hint) = device_hint.filter(|h| !h.is_empty()) {
        let user_id = format!("device-{hint}");
        if user_id.len() > MAX_USER_ID_LEN {
            return Err(Error::validation("device id is too long"));
        }
        validate_user_id(&user_id)?;
        return Ok(Identity::User(user_id));
    }
    Ok(Identity::Anonymous)
}

/// What is left of an expired session.
#[derive(Debug)]
struct Tombstone {
    user_id: String,
    expired_at: DateTime<Utc>,
    /// Session minted by renewing this one.
    renewed_to: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    tombstones: HashMap<String, Tombstone>,
    /// Creations admitted under the ceiling whose handle is still being acquired.
    pending: usize,
}

pub struct SessionRegistry {
    backend: Arc<dyn IsolationBackend>,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    prewarmed: Mutex<VecDeque<IsolationHandle>>,
    refill: Notify,
    renew_locks: KeyedLocks,
    device_locks: KeyedLocks,
    expirations: broadcast::Sender<Expiration>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn IsolationBackend>, config: RegistryConfig) -> Self {
        let (expirations, _) = broadcast::channel(EXPIRATION_CHANNEL_CAPACITY);
        Self {
            backend,
            config,
            state: Mutex::new(RegistryState::default()),
            prewarmed: Mutex::new(VecDeque::new()),
            refill: Notify::new(),
            renew_locks: KeyedLocks::default(),
            device_locks: KeyedLocks::default(),
            expirations,
        }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prewarmed(&self) -> MutexGuard<'_, VecDeque<IsolationHandle>> {
        self.prewarmed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Notifications for sessions that expired (by touch or by the sweeper).
    pub fn subscribe_expirations(&self) -> broadcast::Receiver<Expiration> {
        self.expirations.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn prewarmed_count(&self) -> usize {
        self.prewarmed().len()
    }

    /// Time left before `session` expires if untouched.
    pub fn expires_in(&self, session: &Session) -> Duration {
        session.expires_in(self.config.timeout, Utc::now())
    }

    /// Admit one more session under the ceiling.
    fn reserve(&self) -> Result<()> {
        let mut state = self.lock();
        if state.sessions.len() + state.pending >= self.config.max_sessions {
            return Err(Error::capacity(format!(
                "session limit of {} reached; try again later",
                self.config.max_sessions
            )));
        }
        state.pending += 1;
        Ok(())
    }

    fn unreserve(&self) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    fn insert(&self, session: &Session) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        state.sessions.insert(session.id.clone(), session.clone());
    }

    /// Create a session.
    ///
    /// With a user id (or a device hint standing in for one) the backend's
    /// stable per-user handle is used. Without either, the session gets a fresh
    /// anonymous identity, drawn from the pre-warmed handles when available.
    pub async fn create(&self, user_id: Option<&str>, device_hint: Option<&str>) -> Result<Session> {
        let identity = resolve_identity(user_id, device_hint)?;
        self.reserve()?;

        let acquired = match identity {
            Identity::User(ref user_id) => self.backend.acquire(user_id).await,
            Identity::Anonymous => self.acquire_anonymous().await,
        };
        let handle = match acquired {
            Ok(handle) => handle,
            Err(e) => {
                self.unreserve();
                return Err(e);
            }
        };

        let session = Session::new(handle.user_id.clone(), handle);
        self.insert(&session);

        info!(
            target: "audit",
            "session created: session={} user={} backend={}",
            session.id, session.user_id, session.handle.backend
        );
        Ok(session)
    }

    /// The live session of a device, created on first use.
    ///
    /// Requests for the same device are serialized so a burst of them shares
    /// one session.
    pub async fn session_for_device(&self, device_hint: &str) -> Result<Session> {
        let Identity::User(user_id) = resolve_identity(None, Some(device_hint))? else {
            return Err(Error::validation("device id is required"));
        };
        let _guard = self.device_locks.lock(&user_id).await;

        let now = Utc::now();
        let existing = self
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.is_idle_past(self.config.timeout, now))
            .max_by_key(|s| s.last_active_at)
            .map(|s| s.id.clone());
        if let Some(session_id) = existing {
            match self.touch(&session_id).await {
                Ok(session) => return Ok(session),
                Err(Error::SessionExpired(_) | Error::SessionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.create(None, Some(device_hint)).await
    }

    async fn acquire_anonymous(&self) -> Result<IsolationHandle> {
        if self.config.prewarm > 0 {
            let warm = self.prewarmed().pop_front();
            self.refill.notify_one();
            if let Some(handle) = warm {
                debug!("Using pre-warmed handle for {}", handle.user_id);
                return Ok(handle);
            }
        }
        self.backend.acquire(&anonymous_user_id()).await
    }

    /// Provision anonymous handles until the pre-warm target is met.
    pub async fn fill_prewarm(&self) -> usize {
        let mut added = 0;
        while self.prewarmed_count() < self.config.prewarm {
            match self.backend.acquire(&anonymous_user_id()).await {
                Ok(handle) => {
                    self.prewarmed().push_back(handle);
                    added += 1;
                }
                Err(e) => {
                    warn!("Pre-warming a session handle failed: {}", e);
                    break;
                }
            }
        }
        added
    }

    /// Keep the pre-warm pool topped up in the background.
    pub fn start_prewarmer(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if self.config.prewarm == 0 {
                return;
            }
            info!("Keeping {} pre-warmed session handle(s)", self.config.prewarm);
            loop {
                self.fill_prewarm().await;
                self.refill.notified().await;
            }
        })
    }

    /// Mark a session used now.
    ///
    /// Fails with `SessionNotFound` for unknown ids and with `SessionExpired`
    /// (evicting the session) when it has been idle past the timeout.
    pub async fn touch(&self, session_id: &str) -> Result<Session> {
        self.lookup(session_id, true).await
    }

    /// Like [`touch`](Self::touch) without counting as activity.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.lookup(session_id, false).await
    }

    async fn lookup(&self, session_id: &str, touch: bool) -> Result<Session> {
        let now = Utc::now();
        let evicted = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.sessions.get_mut(session_id) {
                None => {
                    return Err(if state.tombstones.contains_key(session_id) {
                        Error::SessionExpired(session_id.to_string())
                    } else {
                        Error::SessionNotFound(session_id.to_string())
                    });
                }
                Some(session) if !session.is_idle_past(self.config.timeout, now) => {
                    if touch {
                        session.last_active_at = now;
                        session.state = SessionState::Active;
                    }
                    return Ok(session.clone());
                }
                Some(_) => evict_locked(state, session_id, now),
            }
        };

        if let Some(session) = evicted {
            self.finish_eviction(session).await;
        }
        Err(Error::SessionExpired(session_id.to_string()))
    }

    async fn finish_eviction(&self, session: Session) {
        info!(
            target: "audit",
            "session expired: session={} user={}",
            session.id, session.user_id
        );
        if let Err(e) = self.backend.release(&session.handle).await {
            warn!("Releasing handle of {} failed: {}", session.id, e);
        }
        let _ = self.expirations.send(Expiration {
            session_id: session.id,
            user_id: session.user_id,
        });
    }

    /// Replace an expired session with a new one for the same user.
    ///
    /// A live session is returned as is. Renewing the same expired id twice
    /// yields the same replacement while it is live. Only persistent backends
    /// renew; elsewhere the user's files are gone and this fails with
    /// `SessionExpired`.
    pub async fn renew(&self, session_id: &str) -> Result<Session> {
        match self.touch(session_id).await {
            Ok(session) => return Ok(session),
            Err(Error::SessionExpired(_)) => {}
            Err(e) => return Err(e),
        }

        if !self.backend.is_persistent() {
            return Err(Error::SessionExpired(format!(
                "{session_id} (files were not preserved; create a new session)"
            )));
        }

        let _guard = self.renew_locks.lock(session_id).await;

        let (user_id, renewed_to) = {
            let state = self.lock();
            match state.tombstones.get(session_id) {
                Some(tombstone) => (tombstone.user_id.clone(), tombstone.renewed_to.clone()),
                None => return Err(Error::SessionNotFound(session_id.to_string())),
            }
        };
        if let Some(existing) = renewed_to.and_then(|id| self.lock().sessions.get(&id).cloned()) {
            return Ok(existing);
        }

        self.reserve()?;
        let handle = match self.backend.acquire(&user_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.unreserve();
                return Err(e);
            }
        };

        let mut session = Session::new(user_id, handle);
        session.state = SessionState::Renewing;
        session.renewed_from = Some(session_id.to_string());
        {
            let mut state = self.lock();
            state.pending = state.pending.saturating_sub(1);
            state.sessions.insert(session.id.clone(), session.clone());
            if let Some(tombstone) = state.tombstones.get_mut(session_id) {
                tombstone.renewed_to = Some(session.id.clone());
            }
        }

        info!(
            target: "audit",
            "session renewed: old={} new={} user={}",
            session_id, session.id, session.user_id
        );
        Ok(session)
    }

    /// Remove a session and release its handle. Returns whether it existed.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let removed = self.lock().sessions.remove(session_id);
        let Some(session) = removed else {
            return false;
        };

        if let Err(e) = self.backend.release(&session.handle).await {
            warn!("Releasing handle of {} failed: {}", session.id, e);
        }
        info!(
            target: "audit",
            "session ended: session={} user={}",
            session.id, session.user_id
        );
        true
    }

    /// Evict every session idle past the timeout. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let evicted: Vec<Session> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let idle: Vec<String> = state
                .sessions
                .values()
                .filter(|s| s.is_idle_past(self.config.timeout, now))
                .map(|s| s.id.clone())
                .collect();
            let evicted = idle
                .iter()
                .filter_map(|id| evict_locked(state, id, now))
                .collect();

            let window = self.config.renew_window;
            state.tombstones.retain(|_, t| {
                (now - t.expired_at).to_std().unwrap_or_default() <= window
            });
            evicted
        };

        let count = evicted.len();
        for session in evicted {
            self.finish_eviction(session).await;
        }
        if count > 0 {
            info!("Swept {} idle session(s)", count);
        }
        count
    }

    /// Run [`sweep`](Self::sweep) at a fixed interval.
    pub fn start_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting idle session sweeper (check every {:?}, timeout {:?})",
            interval, self.config.timeout
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Destroy every session and release pre-warmed handles.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            if let Err(e) = self.backend.release(&session.handle).await {
                warn!("Releasing handle of {} failed: {}", session.id, e);
            }
        }
        let warm: Vec<IsolationHandle> = self.prewarmed().drain(..).collect();
        for handle in warm {
            let _ = self.backend.release(&handle).await;
        }
    }
}

/// Remove an expired session from the map and leave a tombstone for renewal.
fn evict_locked(state: &mut RegistryState, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
    let mut session = state.sessions.remove(session_id)?;
    session.state = SessionState::Expired;
    state.tombstones.insert(
        session.id.clone(),
        Tombstone {
            user_id: session.user_id.clone(),
            expired_at: now,
            renewed_to: None,
        },
    );
    Some(session)
}

fn anonymous_user_id() -> String {
    format!("anon-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::isolation::DirectorySandbox;
    use tempfile::TempDir;

    fn registry(preserve: bool, config: RegistryConfig) -> (TempDir, SessionRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let backend = DirectorySandbox::new(
            dir.path(),
            "/bin/sh",
            preserve,
            false,
            Arc::new(Bootstrap::default()),
        )
        .unwrap();
        (dir, SessionRegistry::new(Arc::new(backend), config))
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            timeout: Duration::from_secs(3600),
            max_sessions: 8,
            prewarm: 0,
            renew_window: Duration::from_secs(3600),
        }
    }

    fn short_timeout() -> RegistryConfig {
        RegistryConfig {
            timeout: Duration::from_millis(50),
            ..config()
        }
    }

    #[test]
    fn test_resolve_identity() {
        assert_eq!(
            resolve_identity(Some("alice"), Some("phone")).unwrap(),
            Identity::User("alice".to_string())
        );
        assert_eq!(
            resolve_identity(None, Some("phone")).unwrap(),
            Identity::User("device-phone".to_string())
        );
        assert_eq!(resolve_identity(Some(""), None).unwrap(), Identity::Anonymous);
        assert!(resolve_identity(Some("a\u{7}b"), None).is_err());
    }

    #[tokio::test]
    async fn test_same_user_reuses_root() {
        let (_dir, registry) = registry(true, config());
        let a = registry.create(Some("alice"), None).await.unwrap();
        let b = registry.create(Some("alice"), None).await.unwrap();
        let anon = registry.create(None, None).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.handle.root, b.handle.root);
        assert!(anon.user_id.starts_with("anon-"));
        assert_ne!(anon.handle.root, a.handle.root);
        assert_eq!(registry.active_count(), 3);
    }

    #[tokio::test]
    async fn test_session_ceiling() {
        let (_dir, registry) = registry(
            true,
            RegistryConfig {
                max_sessions: 1,
                ..config()
            },
        );
        registry.create(Some("alice"), None).await.unwrap();
        let err = registry.create(Some("bob"), None).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_touch_unknown_and_expired() {
        let (_dir, registry) = registry(true, short_timeout());
        assert!(matches!(
            registry.touch("nope").await,
            Err(Error::SessionNotFound(_))
        ));

        let mut expirations = registry.subscribe_expirations();
        let session = registry.create(Some("alice"), None).await.unwrap();
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(
            registry.touch(&session.id).await.unwrap().state,
            SessionState::Active
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            registry.touch(&session.id).await,
            Err(Error::SessionExpired(_))
        ));
        assert_eq!(registry.active_count(), 0);
        assert_eq!(expirations.recv().await.unwrap().session_id, session.id);

        // Still reported as expired, not unknown.
        assert!(matches!(
            registry.touch(&session.id).await,
            Err(Error::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_renew_keeps_user_files() {
        let (_dir, registry) = registry(true, short_timeout());
        let old = registry.create(Some("alice"), None).await.unwrap();
        std::fs::write(old.handle.root.join("notes.txt"), "keep me").unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let renewed = registry.renew(&old.id).await.unwrap();

        assert_ne!(renewed.id, old.id);
        assert_eq!(renewed.renewed_from.as_deref(), Some(old.id.as_str()));
        assert_eq!(renewed.state, SessionState::Renewing);
        assert!(renewed.handle.root.join("notes.txt").exists());

        let again = registry.renew(&old.id).await.unwrap();
        assert_eq!(again.id, renewed.id);
    }

    #[tokio::test]
    async fn test_renew_live_session_is_noop() {
        let (_dir, registry) = registry(true, config());
        let session = registry.create(Some("alice"), None).await.unwrap();
        assert_eq!(registry.renew(&session.id).await.unwrap().id, session.id);
    }

    #[tokio::test]
    async fn test_renew_requires_persistent_backend() {
        let (_dir, registry) = registry(false, short_timeout());
        let session = registry.create(Some("alice"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            registry.renew(&session.id).await,
            Err(Error::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (_dir, registry) = registry(true, config());
        let session = registry.create(Some("alice"), None).await.unwrap();
        assert!(registry.destroy(&session.id).await);
        assert!(!registry.destroy(&session.id).await);
        assert!(matches!(
            registry.touch(&session.id).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_sessions() {
        let (_dir, registry) = registry(true, short_timeout());
        let idle = registry.create(Some("alice"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh = registry.create(Some("bob"), None).await.unwrap();

        assert_eq!(registry.sweep().await, 1);
        assert!(registry.get(&fresh.id).await.is_ok());
        assert!(matches!(
            registry.get(&idle.id).await,
            Err(Error::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_anonymous_sessions_use_prewarmed_handles() {
        let (_dir, registry) = registry(
            true,
            RegistryConfig {
                prewarm: 2,
                ..config()
            },
        );
        assert_eq!(registry.fill_prewarm().await, 2);

        let warm_user = registry.prewarmed().front().map(|h| h.user_id.clone());
        let session = registry.create(None, None).await.unwrap();
        assert_eq!(Some(session.user_id), warm_user);
        assert_eq!(registry.prewarmed_count(), 1);

        // Named users never take pre-warmed handles.
        registry.create(Some("alice"), None).await.unwrap();
        assert_eq!(registry.prewarmed_count(), 1);
    }
}
