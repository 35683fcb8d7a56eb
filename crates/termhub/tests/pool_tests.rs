//! Container pool placement, capacity and lifecycle tests.

use std::sync::atomic::Ordering;
use std::time::Duration;

use termhub::Error;
use termhub::pool::SlotState;

mod common;
use common::{FakeRuntime, pooled_registry, test_pool};

#[tokio::test]
async fn test_acquire_is_sticky_per_user() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime.clone(), 2, 4);

    let first = pool.acquire_handle("alice").await.unwrap();
    let second = pool.acquire_handle("alice").await.unwrap();

    assert_eq!(first.container_id, second.container_id);
    assert_eq!(first.account, second.account);
    assert_eq!(first.root, second.root);
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);

    let slots = pool.slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].current_user_count, 1);
    assert_eq!(slots[0].load, 2);
}

#[tokio::test]
async fn test_new_users_fill_least_loaded_slot() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime.clone(), 3, 2);

    let a = pool.acquire_handle("a").await.unwrap();
    let b = pool.acquire_handle("b").await.unwrap();
    // The first container is full; a second one is provisioned.
    let c = pool.acquire_handle("c").await.unwrap();

    assert_eq!(a.container_id, b.container_id);
    assert_ne!(a.container_id, c.container_id);
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 2);

    let slots = pool.slots();
    assert!(slots.iter().all(|s| s.state == SlotState::Ready));
    assert!(slots.iter().all(|s| s.current_user_count <= s.capacity));
}

#[tokio::test]
async fn test_pool_exhausted_after_capacity() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime, 2, 2);

    for user in ["u1", "u2", "u3", "u4"] {
        pool.acquire_handle(user).await.unwrap();
    }

    let err = pool.acquire_handle("u5").await.unwrap_err();
    assert!(matches!(
        err,
        Error::PoolExhausted {
            containers: 2,
            users_per_container: 2
        }
    ));
    assert!(err.retryable());

    // Returning users still get in.
    assert!(pool.acquire_handle("u1").await.is_ok());
}

#[tokio::test]
async fn test_different_user_never_gets_released_account() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime.clone(), 1, 4);

    let alice = pool.acquire_handle("alice").await.unwrap();
    pool.release_handle(&alice);
    let bob = pool.acquire_handle("bob").await.unwrap();

    assert_eq!(alice.container_id, bob.container_id);
    assert_ne!(alice.account, bob.account);
    assert_ne!(alice.root, bob.root);
    assert!(!bob.root.starts_with(&alice.root));

    // Each account was created once, with its own uid and a private home.
    let container = alice.container_id.clone().unwrap();
    let execs = runtime.execs_in(&container);
    let useradds: Vec<&Vec<String>> = execs.iter().filter(|c| c[0] == "useradd").collect();
    assert_eq!(useradds.len(), 2);
    assert_ne!(useradds[0][5], useradds[1][5]);
    assert!(
        execs
            .iter()
            .any(|c| c[0] == "chmod" && c[1] == "700" && c[2] == bob.root.display().to_string())
    );
}

#[tokio::test]
async fn test_release_decrements_load_by_one() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime, 1, 4);

    let a1 = pool.acquire_handle("alice").await.unwrap();
    let _a2 = pool.acquire_handle("alice").await.unwrap();
    let _b = pool.acquire_handle("bob").await.unwrap();
    let container = a1.container_id.clone().unwrap();
    assert_eq!(pool.load_of(&container), Some(3));

    pool.release_handle(&a1);
    assert_eq!(pool.load_of(&container), Some(2));
    // Accounts survive release.
    assert!(pool.account_for("alice").is_some());
    assert_eq!(pool.slots()[0].current_user_count, 2);
}

#[tokio::test]
async fn test_failed_provisioning_marks_slot_failed() {
    let runtime = FakeRuntime::new();
    runtime.fail_creates.store(true, Ordering::SeqCst);
    let pool = test_pool(runtime.clone(), 2, 2);

    let err = pool.acquire_handle("alice").await.unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded(_)));
    assert!(err.to_string().contains("try again later"));
    // Bounded retries: provision_attempts is 2 in the test config.
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 2);

    let slots = pool.slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].state, SlotState::Failed);
    assert_eq!(slots[0].load, 0);

    // The failed slot is skipped; a healthy runtime gets a new container.
    runtime.fail_creates.store(false, Ordering::SeqCst);
    let handle = pool.acquire_handle("alice").await.unwrap();
    assert_ne!(handle.container_id.as_deref(), Some(slots[0].container_id.as_str()));
}

#[tokio::test]
async fn test_recover_failed_slot() {
    let runtime = FakeRuntime::new();
    runtime.fail_creates.store(true, Ordering::SeqCst);
    let pool = test_pool(runtime.clone(), 1, 2);
    assert!(pool.acquire_handle("alice").await.is_err());
    let failed = pool.slots()[0].container_id.clone();

    // Only failed slots can be recovered.
    runtime.fail_creates.store(false, Ordering::SeqCst);
    pool.recover_slot(&failed).await.unwrap();
    assert_eq!(pool.slots()[0].state, SlotState::Ready);
    assert!(pool.recover_slot(&failed).await.is_err());

    let handle = pool.acquire_handle("alice").await.unwrap();
    assert_eq!(handle.container_id.as_deref(), Some(failed.as_str()));
}

#[tokio::test]
async fn test_drain_waits_for_release() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime.clone(), 2, 4);
    let handle = pool.acquire_handle("alice").await.unwrap();
    let container = handle.container_id.clone().unwrap();

    let drain = {
        let pool = pool.clone();
        let container = container.clone();
        tokio::spawn(async move { pool.drain_slot(&container).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.slots()[0].state, SlotState::Draining);
    assert!(!drain.is_finished());

    // Draining slots take no new users.
    let bob = pool.acquire_handle("bob").await.unwrap();
    assert_ne!(bob.container_id.as_deref(), Some(container.as_str()));

    pool.release_handle(&handle);
    drain.await.unwrap().unwrap();

    assert!(pool.slots().iter().all(|s| s.container_id != container));
    assert!(!runtime.running().contains(&container));
}

#[tokio::test]
async fn test_burst_of_new_users_shares_one_provisioning_container() {
    let runtime = FakeRuntime::with_create_delay(Duration::from_millis(100));
    let pool = test_pool(runtime.clone(), 3, 4);

    let handles = futures::future::join_all(
        ["a", "b", "c"].map(|user| {
            let pool = pool.clone();
            async move { pool.acquire_handle(user).await }
        }),
    )
    .await;

    let handles: Vec<_> = handles.into_iter().map(|h| h.unwrap()).collect();
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| h.container_id == handles[0].container_id));
    let mut accounts: Vec<_> = handles.iter().map(|h| h.account.clone()).collect();
    accounts.dedup();
    assert_eq!(accounts.len(), 3);

    let slots = pool.slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].state, SlotState::Ready);
    assert_eq!(slots[0].current_user_count, 3);
    assert_eq!(slots[0].load, 3);
}

#[tokio::test]
async fn test_waiters_on_failed_provisioning_give_back_their_room() {
    let runtime = FakeRuntime::with_create_delay(Duration::from_millis(50));
    runtime.fail_creates.store(true, Ordering::SeqCst);
    let pool = test_pool(runtime.clone(), 1, 4);

    let results = futures::future::join_all(["a", "b"].map(|user| {
        let pool = pool.clone();
        async move { pool.acquire_handle(user).await }
    }))
    .await;

    for result in results {
        assert!(matches!(result, Err(Error::CapacityExceeded(_))));
    }
    let slots = pool.slots();
    assert_eq!(slots[0].state, SlotState::Failed);
    assert_eq!(slots[0].load, 0);
    assert_eq!(slots[0].current_user_count, 0);
}

#[tokio::test]
async fn test_concurrent_new_users_respect_container_limit() {
    let runtime = FakeRuntime::with_create_delay(Duration::from_millis(100));
    let pool = test_pool(runtime.clone(), 1, 1);

    let results = futures::future::join_all(["a", "b"].map(|user| {
        let pool = pool.clone();
        async move { pool.acquire_handle(user).await }
    }))
    .await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(Error::PoolExhausted { containers: 1, .. })))
        .count();
    assert_eq!((admitted, exhausted), (1, 1));
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(pool.slots().len(), 1);
}

#[tokio::test]
async fn test_drain_during_provisioning_keeps_slot_draining() {
    let runtime = FakeRuntime::with_create_delay(Duration::from_millis(200));
    let pool = test_pool(runtime.clone(), 2, 4);

    let acquire = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_handle("alice").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let slots = pool.slots();
    assert_eq!(slots[0].state, SlotState::Provisioning);
    let container = slots[0].container_id.clone();

    let drain = {
        let pool = pool.clone();
        let container = container.clone();
        tokio::spawn(async move { pool.drain_slot(&container).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.slots()[0].state, SlotState::Draining);

    // Provisioning finishes into a draining slot; the user is turned away.
    let err = acquire.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded(_)));
    assert!(err.retryable());

    drain.await.unwrap().unwrap();
    assert!(pool.slots().is_empty());
    assert!(!runtime.running().contains(&container));

    runtime.set_create_delay(Duration::ZERO);
    let handle = pool.acquire_handle("alice").await.unwrap();
    assert_ne!(handle.container_id.as_deref(), Some(container.as_str()));
    assert_eq!(runtime.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_restart_stopped_container() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime.clone(), 1, 2);
    let handle = pool.acquire_handle("alice").await.unwrap();
    let container = handle.container_id.clone().unwrap();

    runtime.kill(&container);
    pool.restart_slot(&container).await.unwrap();
    assert!(runtime.running().contains(&container));
}

#[tokio::test]
async fn test_sweeper_eviction_releases_exactly_one_handle() {
    let runtime = FakeRuntime::new();
    let pool = test_pool(runtime, 1, 4);
    let registry = pooled_registry(pool.clone(), Duration::from_millis(200));

    let idle = registry.create(Some("alice"), None).await.unwrap();
    let container = idle.handle.container_id.clone().unwrap();
    let busy = registry.create(Some("bob"), None).await.unwrap();
    assert_eq!(pool.load_of(&container), Some(2));

    let mut expirations = registry.subscribe_expirations();
    tokio::time::sleep(Duration::from_millis(150)).await;
    registry.touch(&busy.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sweeper = registry.clone().start_sweeper(Duration::from_millis(10));
    let expired = tokio::time::timeout(Duration::from_secs(2), expirations.recv())
        .await
        .unwrap()
        .unwrap();
    sweeper.abort();

    assert_eq!(expired.session_id, idle.id);
    assert_eq!(pool.load_of(&container), Some(1));
    assert!(registry.get(&busy.id).await.is_ok());
    assert!(matches!(
        registry.get(&idle.id).await,
        Err(Error::SessionExpired(_))
    ));
}
