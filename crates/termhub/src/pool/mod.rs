//! Bounded pool of shared containers.
//!
//! Each container ("slot") hosts up to `users_per_container` users, each with
//! their own Linux account and home directory. Users are placed on the
//! least-loaded slot with room and stay there for as long as the slot exists, so
//! their files survive session churn. Accounts are only removed together with
//! their container.
//!
//! All bookkeeping lives behind one mutex held for short critical sections.
//! Container provisioning and account creation run outside the lock; a slot
//! being provisioned is inserted in the `Provisioning` state first, and
//! acquisitions for the same user are serialized, so nothing is provisioned
//! twice for one key. New users may reserve room in a slot that is still
//! provisioning and wait for it to settle instead of starting another one.

mod retry;

pub use retry::{backoff_delay, retry_with_backoff};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bootstrap::Bootstrap;
use crate::config::ContainerRuntimeConfig;
use crate::container::{ContainerConfig, ContainerError, ContainerRuntimeApi, ExecOptions};
use crate::error::{Error, Result};
use crate::isolation::accounts::account_name;
use crate::isolation::{BackendKind, IsolationHandle, KeyedLocks};

/// Seconds given to a container to stop before it is killed.
const STOP_TIMEOUT_SECS: u32 = 10;

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Provisioning,
    Ready,
    Draining,
    Failed,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Provisioning => write!(f, "provisioning"),
            SlotState::Ready => write!(f, "ready"),
            SlotState::Draining => write!(f, "draining"),
            SlotState::Failed => write!(f, "failed"),
        }
    }
}

/// A user's account inside one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserAccount {
    pub username: String,
    pub uid: u32,
    pub home_dir: PathBuf,
    pub container_id: String,
}

/// Point-in-time view of a slot.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSlot {
    pub container_id: String,
    /// Distinct accounts provisioned (or being provisioned) in this container.
    pub current_user_count: usize,
    pub capacity: usize,
    pub state: SlotState,
    /// Live handles into this container.
    pub load: usize,
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub image: String,
    pub name_prefix: String,
    pub max_containers: usize,
    pub users_per_container: usize,
    pub uid_start: u32,
    pub account_prefix: String,
    pub home_base: PathBuf,
    pub shell: String,
    pub memory_limit: Option<String>,
    pub cpu_quota: Option<f64>,
    pub network_mode: Option<String>,
    pub provision_attempts: u32,
    pub provision_backoff: Duration,
    pub drain_timeout: Duration,
}

impl PoolConfig {
    pub fn from_config(config: &ContainerRuntimeConfig, shell: &str) -> Self {
        Self {
            image: config.image.clone(),
            name_prefix: config.name_prefix.clone(),
            max_containers: config.max_containers,
            users_per_container: config.users_per_container,
            uid_start: config.uid_start,
            account_prefix: config.account_prefix.clone(),
            home_base: PathBuf::from(&config.home_base),
            shell: shell.to_string(),
            memory_limit: config.memory_limit.clone(),
            cpu_quota: config.cpu_quota,
            network_mode: config.network_mode.clone(),
            provision_attempts: config.provision_attempts,
            provision_backoff: config.provision_backoff(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

#[derive(Debug)]
struct SlotEntry {
    container_id: String,
    state: SlotState,
    capacity: usize,
    /// user id -> account. Survives release; counts against capacity.
    accounts: HashMap<String, UserAccount>,
    /// user id -> number of live handles.
    active: HashMap<String, usize>,
    /// New users whose account is being created. Count as load and capacity.
    reserved: usize,
    next_uid: u32,
}

impl SlotEntry {
    fn load(&self) -> usize {
        self.active.values().sum::<usize>() + self.reserved
    }

    fn user_count(&self) -> usize {
        self.accounts.len() + self.reserved
    }

    fn snapshot(&self) -> ContainerSlot {
        ContainerSlot {
            container_id: self.container_id.clone(),
            current_user_count: self.user_count(),
            capacity: self.capacity,
            state: self.state,
            load: self.load(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Slots in creation order.
    slots: Vec<SlotEntry>,
    created: u64,
}

impl PoolState {
    fn slot(&self, container_id: &str) -> Option<&SlotEntry> {
        self.slots
            .iter()
            .find(|slot| slot.container_id == container_id)
    }

    fn slot_mut(&mut self, container_id: &str) -> Option<&mut SlotEntry> {
        self.slots
            .iter_mut()
            .find(|slot| slot.container_id == container_id)
    }
}

/// Where a new acquisition goes.
enum Placement {
    Existing(UserAccount),
    /// Room reserved in a ready or provisioning slot.
    Join { container_id: String, uid: u32 },
    Provision { container_id: String, uid: u32 },
}

/// Manages the shared containers and the accounts inside them.
pub struct ContainerPool {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: PoolConfig,
    bootstrap: Arc<Bootstrap>,
    state: Mutex<PoolState>,
    user_locks: KeyedLocks,
    released: Notify,
    /// Signalled whenever a slot leaves `Provisioning`.
    settled: Notify,
}

impl ContainerPool {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: PoolConfig,
        bootstrap: Arc<Bootstrap>,
    ) -> Self {
        Self {
            runtime,
            config,
            bootstrap,
            state: Mutex::new(PoolState::default()),
            user_locks: KeyedLocks::default(),
            released: Notify::new(),
            settled: Notify::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Obtain the user's handle, placing and provisioning as needed.
    pub async fn acquire_handle(&self, user_id: &str) -> Result<IsolationHandle> {
        let _user_guard = self.user_locks.lock(user_id).await;

        let placement = self.place(user_id)?;
        let (container_id, uid) = match placement {
            Placement::Existing(account) => {
                debug!(
                    "User {} returns to container {} as {}",
                    user_id, account.container_id, account.username
                );
                return Ok(self.handle_for(user_id, &account));
            }
            Placement::Join { container_id, uid } => (container_id, uid),
            Placement::Provision { container_id, uid } => {
                if let Err(e) = self.provision(&container_id).await {
                    self.mark_failed(&container_id, true);
                    return Err(Error::capacity(format!(
                        "container provisioning failed ({e}); try again later"
                    )));
                }
                (container_id, uid)
            }
        };
        self.wait_until_ready(&container_id).await?;

        let account = match self.create_account(&container_id, user_id, uid).await {
            Ok(account) => account,
            Err(e) => {
                self.drop_reservation(&container_id);
                warn!(
                    "Failed to create account for user {} in {}: {}",
                    user_id, container_id, e
                );
                return Err(Error::capacity(format!(
                    "account provisioning failed ({e}); try again later"
                )));
            }
        };

        {
            let mut state = self.lock();
            if let Some(slot) = state.slot_mut(&container_id) {
                slot.reserved = slot.reserved.saturating_sub(1);
                slot.accounts.insert(user_id.to_string(), account.clone());
                *slot.active.entry(user_id.to_string()).or_insert(0) += 1;
            }
        }

        info!(
            "Assigned user {} to container {} as {} (uid {})",
            user_id, container_id, account.username, account.uid
        );
        Ok(self.handle_for(user_id, &account))
    }

    /// Decide where the user goes and reserve capacity there.
    fn place(&self, user_id: &str) -> Result<Placement> {
        let mut state = self.lock();

        // Sticky: the user's existing account wins.
        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|slot| slot.state == SlotState::Ready && slot.accounts.contains_key(user_id))
        {
            if let Some(account) = slot.accounts.get(user_id).cloned() {
                *slot.active.entry(user_id.to_string()).or_insert(0) += 1;
                return Ok(Placement::Existing(account));
            }
        }

        // Least loaded ready or provisioning slot with room for another
        // account; min_by_key keeps the first (oldest) slot on ties.
        if let Some(slot) = state
            .slots
            .iter_mut()
            .filter(|slot| {
                matches!(slot.state, SlotState::Ready | SlotState::Provisioning)
                    && slot.user_count() < slot.capacity
            })
            .min_by_key(|slot| slot.load())
        {
            slot.reserved += 1;
            let uid = slot.next_uid;
            slot.next_uid += 1;
            return Ok(Placement::Join {
                container_id: slot.container_id.clone(),
                uid,
            });
        }

        if state.slots.len() >= self.config.max_containers {
            return Err(Error::PoolExhausted {
                containers: self.config.max_containers,
                users_per_container: self.config.users_per_container,
            });
        }

        state.created += 1;
        let container_id = format!(
            "{}-{}-{}",
            self.config.name_prefix,
            Utc::now().timestamp(),
            state.created
        );
        let uid = self.config.uid_start;
        state.slots.push(SlotEntry {
            container_id: container_id.clone(),
            state: SlotState::Provisioning,
            capacity: self.config.users_per_container,
            accounts: HashMap::new(),
            active: HashMap::new(),
            reserved: 1,
            next_uid: uid + 1,
        });

        Ok(Placement::Provision { container_id, uid })
    }

    fn handle_for(&self, user_id: &str, account: &UserAccount) -> IsolationHandle {
        IsolationHandle {
            backend: BackendKind::SharedContainer,
            user_id: user_id.to_string(),
            container_id: Some(account.container_id.clone()),
            account: Some(account.username.clone()),
            root: account.home_dir.clone(),
        }
    }

    /// Start a container for a slot and mark it ready.
    async fn provision(&self, container_id: &str) -> Result<()> {
        let config = ContainerConfig::new(&self.config.image)
            .name(container_id)
            .hostname(container_id)
            .label("termhub.pool", &self.config.name_prefix)
            .network_mode(self.config.network_mode.clone())
            .limits(self.config.memory_limit.clone(), self.config.cpu_quota)
            .command(vec!["sleep".to_string(), "infinity".to_string()]);

        let config = &config;

        info!("Provisioning container {}", container_id);
        retry_with_backoff(
            &format!("provisioning {container_id}"),
            self.config.provision_attempts,
            self.config.provision_backoff,
            move |attempt| {
                async move {
                    if attempt > 1 {
                        // A failed run can leave a created-but-dead container behind.
                        let _ = self.runtime.remove_container(container_id, true).await;
                    }
                    self.runtime.create_container(config).await?;
                    match self.runtime.container_state_status(container_id).await? {
                        Some(status) if status == "running" => Ok(()),
                        other => Err(ContainerError::failed(
                            "run",
                            format!("container is not running (state: {other:?})"),
                        )),
                    }
                }
            },
        )
        .await?;

        // Only a slot still provisioning becomes ready; a drain that started
        // meanwhile keeps the slot draining.
        let outcome = {
            let mut state = self.lock();
            match state.slot_mut(container_id) {
                Some(slot) if slot.state == SlotState::Provisioning => {
                    slot.state = SlotState::Ready;
                    Some(SlotState::Ready)
                }
                Some(slot) => Some(slot.state),
                None => None,
            }
        };
        self.settled.notify_waiters();
        match outcome {
            Some(SlotState::Ready) => info!("Container {} is ready", container_id),
            Some(other) => info!(
                "Container {} finished provisioning but is {}",
                container_id, other
            ),
            None => {
                warn!(
                    "Container {} was removed while provisioning; tearing it down",
                    container_id
                );
                self.teardown(container_id).await;
            }
        }
        Ok(())
    }

    /// Block until a slot this caller reserved room in is ready. On any other
    /// outcome the reservation is given back.
    async fn wait_until_ready(&self, container_id: &str) -> Result<()> {
        loop {
            let settled = self.settled.notified();
            let state = self.lock().slot(container_id).map(|slot| slot.state);
            match state {
                Some(SlotState::Ready) => return Ok(()),
                Some(SlotState::Provisioning) => {
                    debug!("Waiting for container {} to finish provisioning", container_id);
                    settled.await;
                }
                other => {
                    self.drop_reservation(container_id);
                    let state = other.map_or_else(|| "gone".to_string(), |s| s.to_string());
                    return Err(Error::capacity(format!(
                        "container {container_id} is {state}; try again later"
                    )));
                }
            }
        }
    }

    fn drop_reservation(&self, container_id: &str) {
        {
            let mut state = self.lock();
            if let Some(slot) = state.slot_mut(container_id) {
                slot.reserved = slot.reserved.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
    }

    fn mark_failed(&self, container_id: &str, drop_reservation: bool) {
        {
            let mut state = self.lock();
            if let Some(slot) = state.slot_mut(container_id) {
                if slot.state != SlotState::Draining {
                    slot.state = SlotState::Failed;
                }
                if drop_reservation {
                    slot.reserved = slot.reserved.saturating_sub(1);
                }
            }
        }
        self.settled.notify_waiters();
        self.released.notify_waiters();
        warn!(
            "Container {} marked failed; excluded until recovered",
            container_id
        );
    }

    /// Create the user's account inside a container and run the bootstrap script.
    async fn create_account(
        &self,
        container_id: &str,
        user_id: &str,
        uid: u32,
    ) -> Result<UserAccount> {
        let username = account_name(&self.config.account_prefix, user_id);
        let home_dir = self.config.home_base.join(&username);
        let home = home_dir.display().to_string();

        let useradd = [
            "useradd".to_string(),
            "-m".to_string(),
            "-d".to_string(),
            home.clone(),
            "-u".to_string(),
            uid.to_string(),
            "-s".to_string(),
            self.config.shell.clone(),
            username.clone(),
        ];
        let root = ExecOptions::default();
        let (root_ref, useradd_ref) = (&root, &useradd);
        retry_with_backoff(
            &format!("creating account {username}"),
            self.config.provision_attempts,
            self.config.provision_backoff,
            move |_| async move {
                match self
                    .runtime
                    .exec_output(container_id, root_ref, useradd_ref)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(ContainerError::CommandFailed { message, .. })
                        if message.contains("already exists") =>
                    {
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        let chmod = ["chmod".to_string(), "700".to_string(), home.clone()];
        self.runtime.exec_output(container_id, &root, &chmod).await?;

        if let Some(command) = self.bootstrap.container_command(&home) {
            let as_user = ExecOptions {
                user: Some(username.clone()),
                workdir: Some(home.clone()),
                env: Vec::new(),
            };
            if let Err(e) = self
                .runtime
                .exec_output(container_id, &as_user, &command)
                .await
            {
                warn!("Bootstrap for {} in {} failed: {}", username, container_id, e);
            }
        }

        Ok(UserAccount {
            username,
            uid,
            home_dir,
            container_id: container_id.to_string(),
        })
    }

    /// Give back one handle. The account and its files stay.
    pub fn release_handle(&self, handle: &IsolationHandle) {
        let Some(container_id) = handle.container_id.as_deref() else {
            return;
        };

        {
            let mut state = self.lock();
            let Some(slot) = state.slot_mut(container_id) else {
                debug!("Release for removed container {}", container_id);
                return;
            };
            match slot.active.get_mut(&handle.user_id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    slot.active.remove(&handle.user_id);
                }
                None => warn!(
                    "Release of handle for {} without a live acquisition in {}",
                    handle.user_id, container_id
                ),
            }
        }

        self.released.notify_waiters();
    }

    /// Bring a stopped container back.
    pub async fn restart_slot(&self, container_id: &str) -> Result<()> {
        retry_with_backoff(
            &format!("restarting {container_id}"),
            self.config.provision_attempts,
            self.config.provision_backoff,
            move |_| self.runtime.start_container(container_id),
        )
        .await
        .map_err(|e| Error::handle_unavailable(format!("{container_id}: {e}")))
    }

    /// Stop assigning users to a slot, wait for its load to reach zero (or the
    /// drain timeout), then remove the container and its accounts.
    pub async fn drain_slot(&self, container_id: &str) -> Result<()> {
        {
            let mut state = self.lock();
            let Some(slot) = state.slot_mut(container_id) else {
                return Err(Error::validation(format!(
                    "unknown container: {container_id}"
                )));
            };
            slot.state = SlotState::Draining;
        }
        self.settled.notify_waiters();
        info!("Draining container {}", container_id);

        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let notified = self.released.notified();
            let load = self.load_of(container_id).unwrap_or(0);
            if load == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Drain of {} timed out with {} user(s) still attached; forcing removal",
                    container_id, load
                );
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        self.teardown(container_id).await;
        self.lock()
            .slots
            .retain(|slot| slot.container_id != container_id);
        info!("Removed container {}", container_id);
        Ok(())
    }

    /// Re-provision a failed slot.
    pub async fn recover_slot(&self, container_id: &str) -> Result<()> {
        {
            let mut state = self.lock();
            let Some(slot) = state.slot_mut(container_id) else {
                return Err(Error::validation(format!(
                    "unknown container: {container_id}"
                )));
            };
            if slot.state != SlotState::Failed {
                return Err(Error::validation(format!(
                    "container {container_id} is {}, not failed",
                    slot.state
                )));
            }
            slot.state = SlotState::Provisioning;
            slot.accounts.clear();
            slot.next_uid = self.config.uid_start;
        }

        let _ = self.runtime.remove_container(container_id, true).await;
        if let Err(e) = self.provision(container_id).await {
            self.mark_failed(container_id, false);
            return Err(Error::capacity(format!(
                "recovery of {container_id} failed: {e}"
            )));
        }
        Ok(())
    }

    async fn teardown(&self, container_id: &str) {
        if let Err(e) = self
            .runtime
            .stop_container(container_id, Some(STOP_TIMEOUT_SECS))
            .await
        {
            debug!("Stopping {} failed: {}", container_id, e);
        }
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("Removing {} failed: {}", container_id, e);
        }
    }

    /// Remove every container. Used at shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .lock()
            .slots
            .drain(..)
            .map(|slot| slot.container_id)
            .collect();
        for id in ids {
            self.teardown(&id).await;
        }
    }

    pub fn slots(&self) -> Vec<ContainerSlot> {
        self.lock().slots.iter().map(SlotEntry::snapshot).collect()
    }

    pub fn load_of(&self, container_id: &str) -> Option<usize> {
        self.lock()
            .slots
            .iter()
            .find(|slot| slot.container_id == container_id)
            .map(SlotEntry::load)
    }

    /// The user's account, if one exists in a live slot.
    pub fn account_for(&self, user_id: &str) -> Option<UserAccount> {
        self.lock()
            .slots
            .iter()
            .find_map(|slot| slot.accounts.get(user_id).cloned())
    }
}
