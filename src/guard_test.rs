use super::*;
use crate::remote::memory::{self, MemoryAuth, MemoryStore};
use crate::services::profile::ProfileService;
use crate::state::AuthManager;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.visits.lock().unwrap().push(path.to_owned());
    }
}

fn start(auth: &Arc<MemoryAuth>) -> AuthManager {
    let store = MemoryStore::new();
    AuthManager::start(auth.clone(), ProfileService::new(auth.clone(), store))
}

async fn next_view<N: Navigator>(guard: &mut RouteGuard<N>) -> GuardView {
    tokio::time::timeout(Duration::from_secs(2), guard.changed())
        .await
        .expect("timed out waiting for guard")
        .expect("auth manager stopped")
}

// =========================================================================
// guard_view
// =========================================================================

#[test]
fn views_map_from_state() {
    let identity = memory::identity("ada@example.com");
    assert_eq!(guard_view(&AuthState::Initializing), GuardView::Loading);
    assert_eq!(guard_view(&AuthState::Unauthenticated), GuardView::Hidden);
    assert_eq!(
        guard_view(&AuthState::Authenticated { identity, profile: None }),
        GuardView::Protected
    );
}

#[test]
fn redirect_only_after_loading() {
    assert!(!should_redirect_unauth(&AuthState::Initializing));
    assert!(should_redirect_unauth(&AuthState::Unauthenticated));
    let identity = memory::identity("ada@example.com");
    assert!(!should_redirect_unauth(&AuthState::Authenticated { identity, profile: None }));
}

// =========================================================================
// RouteGuard
// =========================================================================

#[tokio::test]
async fn unauthenticated_redirects_once_and_never_renders_content() {
    let auth = MemoryAuth::new();
    let gate = auth.hold_next_probe();
    let manager = start(&auth);
    let nav = Arc::new(RecordingNavigator::default());
    let mut guard = RouteGuard::new(&manager.handle(), nav.clone());

    assert_eq!(guard.view(), GuardView::Loading);
    assert_eq!(guard.render(|| "secret", Some("loading")), Some("loading"));
    assert_eq!(guard.render(|| "secret", None), None);
    assert!(nav.visits().is_empty());

    gate.notify_one();
    assert_eq!(next_view(&mut guard).await, GuardView::Hidden);
    assert_eq!(guard.render(|| "secret", Some("loading")), None);
    assert_eq!(nav.visits(), vec![SIGN_IN_PATH.to_owned()]);

    // A redundant sign-out does not publish a new state or redirect again.
    manager.handle().sign_out().await.unwrap();
    assert_eq!(nav.visits().len(), 1);
}

#[tokio::test]
async fn already_settled_state_redirects_on_construction() {
    let auth = MemoryAuth::new();
    let manager = start(&auth);
    manager.handle().wait_until_ready().await.unwrap();
    let nav = Arc::new(RecordingNavigator::default());

    let guard = RouteGuard::new(&manager.handle(), nav.clone());

    assert_eq!(guard.view(), GuardView::Hidden);
    assert_eq!(nav.visits(), vec![SIGN_IN_PATH.to_owned()]);
}

#[tokio::test]
async fn authenticated_renders_content_without_redirect() {
    let auth = MemoryAuth::new();
    auth.restore(&memory::identity("ada@example.com"));
    let manager = start(&auth);
    manager.handle().wait_until_ready().await.unwrap();
    let nav = Arc::new(RecordingNavigator::default());

    let guard = RouteGuard::new(&manager.handle(), nav.clone());

    assert_eq!(guard.render(|| "secret", Some("loading")), Some("secret"));
    assert!(nav.visits().is_empty());
}

#[tokio::test]
async fn session_expiry_redirects_reactively() {
    let auth = MemoryAuth::new();
    auth.restore(&memory::identity("ada@example.com"));
    let manager = start(&auth);
    manager.handle().wait_until_ready().await.unwrap();
    let nav = Arc::new(RecordingNavigator::default());
    let mut guard = RouteGuard::new(&manager.handle(), nav.clone());
    assert_eq!(guard.view(), GuardView::Protected);

    auth.expire_session();

    assert_eq!(next_view(&mut guard).await, GuardView::Hidden);
    assert_eq!(nav.visits(), vec![SIGN_IN_PATH.to_owned()]);
}

#[tokio::test]
async fn redirect_rearms_after_signing_back_in() {
    let auth = MemoryAuth::new();
    let manager = start(&auth);
    manager.handle().wait_until_ready().await.unwrap();
    let nav = Arc::new(RecordingNavigator::default());
    let mut guard = RouteGuard::new(&manager.handle(), nav.clone());

    auth.sign_in_as(&memory::identity("ada@example.com"));
    assert_eq!(next_view(&mut guard).await, GuardView::Protected);
    auth.expire_session();
    assert_eq!(next_view(&mut guard).await, GuardView::Hidden);

    assert_eq!(nav.visits().len(), 2);
}

#[tokio::test]
async fn run_returns_when_manager_stops() {
    let auth = MemoryAuth::new();
    let manager = start(&auth);
    manager.handle().wait_until_ready().await.unwrap();
    let mut guard = RouteGuard::new(&manager.handle(), Arc::new(RecordingNavigator::default()));

    manager.stop().await;

    tokio::time::timeout(Duration::from_secs(2), guard.run()).await.expect("guard kept running");
}
