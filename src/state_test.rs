use super::*;
use crate::model::ProfilePatch;
use crate::remote::memory::{self, MemoryAuth, MemoryStore};
use std::time::Duration;

fn start(auth: &Arc<MemoryAuth>, store: &Arc<MemoryStore>) -> AuthManager {
    AuthManager::start(auth.clone(), ProfileService::new(auth.clone(), store.clone()))
}

async fn wait_for(handle: &AuthHandle, pred: impl FnMut(&AuthState) -> bool) -> AuthState {
    let mut rx = handle.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .expect("timed out waiting for auth state")
        .expect("manager stopped")
        .clone();
    state
}

async fn wait_for_probe(auth: &MemoryAuth) {
    while auth.probe_calls() == 0 {
        tokio::task::yield_now().await;
    }
}

// =========================================================================
// initial probe
// =========================================================================

#[tokio::test]
async fn state_is_initializing_until_probe_completes() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let gate = auth.hold_next_probe();
    let manager = start(&auth, &store);
    let handle = manager.handle();

    assert_eq!(handle.state(), AuthState::Initializing);
    wait_for_probe(&auth).await;
    assert_eq!(handle.state(), AuthState::Initializing);

    gate.notify_one();
    assert_eq!(handle.wait_until_ready().await.unwrap(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn probe_without_session_is_unauthenticated() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let manager = start(&auth, &store);

    let state = manager.handle().wait_until_ready().await.unwrap();

    assert_eq!(state, AuthState::Unauthenticated);
    assert_eq!(auth.probe_calls(), 1);
}

#[tokio::test]
async fn restored_session_loads_profile_during_probe() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let me = memory::identity("ada@example.com");
    auth.restore(&me);
    let manager = start(&auth, &store);

    let state = manager.handle().wait_until_ready().await.unwrap();

    assert_eq!(state.identity(), Some(&me));
    assert_eq!(state.profile().and_then(|p| p.username.as_deref()), Some("ada"));
}

#[tokio::test]
async fn profile_fetch_failure_leaves_profile_empty() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let me = memory::identity("ada@example.com");
    auth.restore(&me);
    store.fail_selects(Some(RemoteError::Transport("offline".into())));
    let manager = start(&auth, &store);

    let state = manager.handle().wait_until_ready().await.unwrap();

    assert_eq!(state, AuthState::Authenticated { identity: me, profile: None });
}

// =========================================================================
// notifications
// =========================================================================

#[tokio::test]
async fn sign_in_notification_authenticates_with_provisioned_profile() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();

    let me = memory::identity("grace@example.com");
    auth.sign_in_as(&me);
    let state = wait_for(&handle, AuthState::is_authenticated).await;

    assert_eq!(state.identity(), Some(&me));
    assert_eq!(state.profile().map(|p| p.id), Some(me.id));
    assert_eq!(store.inserts(), 1);
}

#[tokio::test]
async fn notification_during_probe_is_applied_after_it() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let gate = auth.hold_next_probe();
    let manager = start(&auth, &store);
    let handle = manager.handle();
    wait_for_probe(&auth).await;

    // The held probe already snapshotted "no session"; this sign-in must win.
    let me = memory::identity("ada@example.com");
    auth.sign_in_as(&me);
    gate.notify_one();

    let state = wait_for(&handle, AuthState::is_authenticated).await;
    assert_eq!(state.identity(), Some(&me));
}

#[tokio::test]
async fn token_refresh_for_same_identity_keeps_cached_profile() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let me = memory::identity("ada@example.com");
    auth.restore(&me);
    let manager = start(&auth, &store);
    let handle = manager.handle();
    let before = handle.wait_until_ready().await.unwrap();
    store.fail_selects(Some(RemoteError::Transport("offline".into())));

    auth.sign_in_as(&me);
    // Round-trip a command so the notification has been processed.
    handle.refresh_profile().await.unwrap_err();

    assert_eq!(handle.state(), before);
}

#[tokio::test]
async fn token_refresh_retries_a_missing_profile() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let me = memory::identity("ada@example.com");
    auth.restore(&me);
    store.fail_selects(Some(RemoteError::Transport("offline".into())));
    let manager = start(&auth, &store);
    let handle = manager.handle();
    assert_eq!(handle.wait_until_ready().await.unwrap().profile(), None);
    store.fail_selects(None);

    auth.sign_in_as(&me);
    let state = wait_for(&handle, |s| s.profile().is_some()).await;

    assert_eq!(state.identity(), Some(&me));
    assert_eq!(state.profile().and_then(|p| p.username.as_deref()), Some("ada"));
}

#[tokio::test]
async fn external_expiry_clears_identity_and_profile_together() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    auth.restore(&memory::identity("ada@example.com"));
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();
    let mut rx = handle.subscribe();
    rx.borrow_and_update();

    auth.expire_session();
    rx.changed().await.unwrap();

    assert_eq!(*rx.borrow_and_update(), AuthState::Unauthenticated);
}

// =========================================================================
// commands
// =========================================================================

#[tokio::test]
async fn sign_out_clears_state() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    auth.restore(&memory::identity("ada@example.com"));
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();

    handle.sign_out().await.unwrap();

    assert_eq!(handle.state(), AuthState::Unauthenticated);
    assert_eq!(handle.state().profile(), None);
}

#[tokio::test]
async fn sign_out_failure_still_clears_local_state() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    auth.restore(&memory::identity("ada@example.com"));
    auth.fail_next_sign_out(RemoteError::Transport("offline".into()));
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();

    let err = handle.sign_out().await.unwrap_err();

    assert!(matches!(err, AuthError::Remote(RemoteError::Transport(_))));
    assert_eq!(handle.state(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn refresh_profile_is_noop_when_signed_out() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();

    handle.refresh_profile().await.unwrap();

    assert_eq!(handle.state(), AuthState::Unauthenticated);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn refresh_profile_replaces_cached_profile() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let me = memory::identity("ada@example.com");
    auth.restore(&me);
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();

    let patch = ProfilePatch { profile_message: Some(Some("hi".into())), ..ProfilePatch::default() };
    crate::remote::ProfileStore::update_profile(&*store, me.id, &patch).await.unwrap();
    handle.refresh_profile().await.unwrap();

    let state = handle.state();
    assert_eq!(state.profile().and_then(|p| p.profile_message.as_deref()), Some("hi"));
}

#[tokio::test]
async fn refresh_profile_failure_is_returned() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    auth.restore(&memory::identity("ada@example.com"));
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();
    store.fail_selects(Some(RemoteError::Transport("offline".into())));

    let err = handle.refresh_profile().await.unwrap_err();

    assert!(matches!(err, AuthError::Profile(ProfileError::Remote(_))));
    assert!(handle.state().profile().is_some());
}

// =========================================================================
// teardown
// =========================================================================

#[tokio::test]
async fn stop_unsubscribes_and_rejects_commands() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let manager = start(&auth, &store);
    let handle = manager.handle();
    handle.wait_until_ready().await.unwrap();
    assert_eq!(auth.subscriber_count(), 1);

    manager.stop().await;

    assert_eq!(auth.subscriber_count(), 0);
    assert!(matches!(handle.sign_out().await, Err(AuthError::ManagerStopped)));
}

#[tokio::test]
async fn stop_during_probe_exits_cleanly() {
    let (auth, store) = (MemoryAuth::new(), MemoryStore::new());
    let _gate = auth.hold_next_probe();
    let manager = start(&auth, &store);
    let handle = manager.handle();

    manager.stop().await;

    assert_eq!(auth.subscriber_count(), 0);
    assert!(matches!(handle.wait_until_ready().await, Err(AuthError::ManagerStopped)));
}

#[test]
fn error_codes_delegate_to_source() {
    let err = AuthError::from(RemoteError::InvalidCredentials);
    assert_eq!(err.error_code(), "E_INVALID_CREDENTIALS");
    assert_eq!(AuthError::OAuthCallback("callback_error".into()).error_code(), "E_OAUTH_CALLBACK");
}
