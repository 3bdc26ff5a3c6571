//! Session lifecycle: establish, restore, expire and log out.
//!
//! The manager is the only owner of the current session and of the single
//! expiration timer. Every transition updates the timer and the store
//! before publishing the new value, all under one lock, so subscribers
//! never observe a half-finished transition.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, Stream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::storage::KeyValueStore;

use super::session::{PersistedSession, Session, SESSION_KEY};

// ============================================================================
// Collaborators
// ============================================================================

/// Sends the user back to the authentication entry point.
///
/// Called after every logout and expiry, outside the manager's lock.
pub trait Navigator: Send + Sync {
    fn navigate_to_auth(&self);
}

impl<F> Navigator for F
where
    F: Fn() + Send + Sync,
{
    fn navigate_to_auth(&self) {
        self()
    }
}

/// Navigator for front ends without an authentication screen.
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn navigate_to_auth(&self) {}
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
}

struct ExpiryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    timer: Option<ExpiryTimer>,
    /// Bumped on every arm; a timer only expires the session it was armed for.
    generation: u64,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    navigator: Arc<dyn Navigator>,
    state: Mutex<State>,
    tx: watch::Sender<Option<Session>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
    }
}

/// Owns the current session and its expiration timer.
///
/// Clone is cheap; all clones share the same session. Operations that arm a
/// timer must run inside a Tokio runtime.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>, navigator: Arc<dyn Navigator>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                store,
                navigator,
                state: Mutex::new(State::default()),
                tx,
            }),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Start a session that expires `ttl_secs` from now.
    ///
    /// Replaces any current session and its timer, persists the new session
    /// and publishes it. A lifetime past the last representable instant
    /// saturates there.
    pub fn establish(&self, email: &str, user_id: &str, token: &str, ttl_secs: u64) -> Session {
        let expires_at = expiry_after(Utc::now(), ttl_secs);
        let session = Session::new(email, user_id, token, expires_at);

        let mut state = self.inner.lock();
        self.arm(&mut state, Duration::from_secs(ttl_secs));
        self.persist(&session);
        self.publish(&mut state, Some(session.clone()));

        info!(user_id, expires_at = %session.token_expires_at, "Session established");
        session
    }

    /// Reinstate the persisted session, if any is still valid.
    ///
    /// Missing, unreadable, malformed or already-expired data leaves the
    /// manager logged out without publishing anything. Stale data is left
    /// in the store. Returns whether a session was restored.
    pub fn restore(&self) -> bool {
        let mut state = self.inner.lock();
        if state.session.is_some() {
            debug!("Session already active, skipping restore");
            return false;
        }

        let raw = match self.inner.store.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted session found");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return false;
            }
        };

        let persisted: PersistedSession = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Failed to parse persisted session");
                return false;
            }
        };
        let session = Session::from(persisted);

        let remaining = match (session.token_expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() && session.token().is_some() => remaining,
            _ => {
                debug!(
                    expires_at = %session.token_expires_at,
                    "Persisted session expired or empty"
                );
                return false;
            }
        };

        self.arm(&mut state, remaining);
        info!(
            user_id = %session.user_id,
            minutes_left = session.minutes_until_expiry(),
            "Session restored"
        );
        self.publish(&mut state, Some(session));
        true
    }

    /// End the current session. Logging out twice is the same as once.
    pub fn logout(&self) {
        let state = self.inner.lock();
        info!(had_session = state.session.is_some(), "Logging out");
        self.leave(state);
    }

    /// Fired by the timer armed under `generation`.
    fn expire(&self, generation: u64) {
        let mut state = self.inner.lock();
        let timer = state.timer.take();
        match timer {
            Some(timer) if timer.generation == generation => {
                // Running inside this timer's task; drop the handle without aborting.
                info!(generation, "Session token expired");
                self.leave(state);
            }
            other => {
                state.timer = other;
                debug!(generation, "Ignoring superseded expiry timer");
            }
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn current(&self) -> Option<Session> {
        self.inner.lock().session.clone()
    }

    pub fn state(&self) -> SessionState {
        if self.inner.lock().session.is_some() {
            SessionState::LoggedIn
        } else {
            SessionState::LoggedOut
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::LoggedIn
    }

    /// Whether an expiration timer is pending.
    pub fn timer_armed(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Receiver holding the current session; new receivers see the latest value.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.inner.tx.subscribe()
    }

    /// Stream of the current session followed by every change.
    ///
    /// Changes made faster than the consumer polls are coalesced to the
    /// latest value. Ends when every manager handle has been dropped.
    pub fn changes(&self) -> impl Stream<Item = Option<Session>> + Send + 'static {
        stream::unfold((self.subscribe(), true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let value = rx.borrow_and_update().clone();
            Some((value, (rx, false)))
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Cancel any pending timer, then arm a new one for `delay`.
    fn arm(&self, state: &mut State, delay: Duration) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
            debug!(generation = timer.generation, "Expiry timer cancelled");
        }

        state.generation += 1;
        let generation = state.generation;
        // `None` only for delays no clock can reach; such a timer never fires.
        let deadline = Instant::now().checked_add(delay);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let Some(deadline) = deadline else {
                return std::future::pending().await;
            };
            // Deadlines past the timer wheel's range wake early; wait out the rest.
            while Instant::now() < deadline {
                tokio::time::sleep_until(deadline).await;
            }
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.expire(generation);
            }
        });

        debug!(generation, delay_secs = delay.as_secs(), "Expiry timer armed");
        state.timer = Some(ExpiryTimer { generation, handle });
    }

    /// Shared exit path of `logout` and `expire`.
    fn leave(&self, mut state: MutexGuard<'_, State>) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
            debug!(generation = timer.generation, "Expiry timer cancelled");
        }
        if let Err(e) = self.inner.store.remove(SESSION_KEY) {
            warn!(error = %e, "Failed to remove persisted session");
        }
        self.publish(&mut state, None);
        drop(state);

        self.inner.navigator.navigate_to_auth();
    }

    fn persist(&self, session: &Session) {
        let persisted = PersistedSession::from(session);
        let result = serde_json::to_string(&persisted)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.inner.store.set(SESSION_KEY, &json));
        if let Err(e) = result {
            warn!(error = %e, "Failed to save session");
        }
    }

    fn publish(&self, state: &mut State, session: Option<Session>) {
        state.session = session.clone();
        self.inner.tx.send_replace(session);
    }
}

/// `now + ttl_secs`, saturating at the last instant `DateTime<Utc>` can hold.
fn expiry_after(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or_else(|| {
            warn!(ttl_secs, "Token lifetime out of range, saturating expiry");
            DateTime::<Utc>::MAX_UTC
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use futures::StreamExt;

    use crate::storage::MemoryStore;

    struct Harness {
        manager: SessionManager,
        store: Arc<MemoryStore>,
        redirects: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let redirects = Arc::new(AtomicUsize::new(0));
        let counter = redirects.clone();
        let manager = SessionManager::new(
            store.clone(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Harness {
            manager,
            store,
            redirects,
        }
    }

    /// Records the session subscribers could see at each store write.
    #[derive(Default)]
    struct ObservingStore {
        values: MemoryStore,
        rx: OnceLock<watch::Receiver<Option<Session>>>,
        seen_on_set: Mutex<Vec<Option<Session>>>,
        seen_on_remove: Mutex<Vec<Option<Session>>>,
    }

    impl ObservingStore {
        fn visible(&self) -> Option<Session> {
            self.rx.get().and_then(|rx| rx.borrow().clone())
        }
    }

    impl KeyValueStore for ObservingStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.values.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.seen_on_set.lock().unwrap().push(self.visible());
            self.values.set(key, value)
        }

        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.seen_on_remove.lock().unwrap().push(self.visible());
            self.values.remove(key)
        }
    }

    fn observed_manager() -> (SessionManager, Arc<ObservingStore>) {
        let store = Arc::new(ObservingStore::default());
        let manager = SessionManager::new(store.clone(), Arc::new(NoopNavigator));
        assert!(store.rx.set(manager.subscribe()).is_ok());
        (manager, store)
    }

    /// Let spawned timer tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn persisted_json(expires_at: chrono::DateTime<Utc>) -> String {
        serde_json::to_string(&PersistedSession {
            email: "cook@example.com".to_string(),
            id: "uid-1".to_string(),
            token: "tok".to_string(),
            token_expiration_date: expires_at,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_state_is_logged_out() {
        let h = harness();
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!h.manager.timer_armed());
        assert_eq!(*h.manager.subscribe().borrow(), None);
    }

    #[tokio::test]
    async fn test_establish_publishes_and_persists() {
        let h = harness();
        let before = Utc::now();
        let session = h.manager.establish("cook@example.com", "uid-1", "tok", 3600);
        let after = Utc::now();

        let latest = h.manager.subscribe().borrow().clone().unwrap();
        assert_eq!(latest, session);
        assert_eq!(latest.email, "cook@example.com");
        assert_eq!(latest.user_id, "uid-1");
        assert_eq!(latest.token(), Some("tok"));
        assert!(latest.token_expires_at >= before + ChronoDuration::seconds(3600));
        assert!(latest.token_expires_at <= after + ChronoDuration::seconds(3600));

        assert!(h.manager.is_authenticated());
        assert!(h.manager.timer_armed());

        let raw = h.store.get(SESSION_KEY).unwrap().unwrap();
        let persisted: PersistedSession = serde_json::from_str(&raw).unwrap();
        assert_eq!(Session::from(persisted), session);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let h = harness();
        h.manager.establish("cook@example.com", "uid-1", "tok", 3600);

        h.manager.logout();
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!h.manager.timer_armed());
        assert!(h.store.is_empty());
        assert_eq!(*h.manager.subscribe().borrow(), None);

        h.manager.logout();
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!h.manager.timer_armed());
        assert!(h.store.is_empty());
        assert_eq!(*h.manager.subscribe().borrow(), None);
        assert_eq!(h.redirects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_after_ttl() {
        let h = harness();
        let mut rx = h.manager.subscribe();
        h.manager.establish("cook@example.com", "uid-1", "tok", 60);
        assert!(rx.borrow_and_update().is_some());

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert!(h.manager.is_authenticated());
        assert!(!rx.has_changed().unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!h.manager.timer_armed());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), None);
        assert!(h.store.is_empty());
        assert_eq!(h.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_establish_replaces_timer() {
        let h = harness();
        h.manager.establish("cook@example.com", "uid-1", "first", 10);
        h.manager.establish("cook@example.com", "uid-1", "second", 100);
        assert!(h.manager.timer_armed());

        // The first timer would have fired here.
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(h.manager.is_authenticated());
        assert!(h.manager.timer_armed());
        assert_eq!(h.manager.current().unwrap().token(), Some("second"));
        assert_eq!(h.redirects.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(90)).await;
        settle().await;
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!h.manager.timer_armed());
        assert_eq!(h.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_timer() {
        let h = harness();
        h.manager.establish("cook@example.com", "uid-1", "tok", 10);
        h.manager.logout();

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        // Only the explicit logout redirected.
        assert_eq!(h.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restore_without_persisted_session() {
        let h = harness();
        let rx = h.manager.subscribe();
        assert!(!h.manager.restore());
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let h = harness();
        let original = h.manager.establish("cook@example.com", "uid-1", "tok", 3600);
        drop(h.manager);

        let restarted = SessionManager::new(h.store.clone(), Arc::new(NoopNavigator));
        let mut rx = restarted.subscribe();
        assert!(restarted.restore());

        assert!(rx.has_changed().unwrap());
        let restored = rx.borrow_and_update().clone().unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.token_expires_at, original.token_expires_at);
        assert!(restarted.timer_armed());
    }

    #[tokio::test]
    async fn test_restore_expired_session_stays_logged_out() {
        let h = harness();
        let stale = persisted_json(Utc::now() - ChronoDuration::minutes(5));
        h.store.set(SESSION_KEY, &stale).unwrap();

        let rx = h.manager.subscribe();
        assert!(!h.manager.restore());
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(!h.manager.timer_armed());
        assert!(!rx.has_changed().unwrap());
        // Stale data is left in place.
        assert_eq!(h.store.get(SESSION_KEY).unwrap(), Some(stale));
        assert_eq!(h.redirects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restore_malformed_data_is_silent() {
        let h = harness();
        h.store.set(SESSION_KEY, "{not json").unwrap();
        assert!(!h.manager.restore());
        assert_eq!(h.manager.state(), SessionState::LoggedOut);

        h.store
            .set(SESSION_KEY, r#"{"email":"a@b.c","id":"uid"}"#)
            .unwrap();
        assert!(!h.manager.restore());
        assert!(!h.manager.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_session_expires_at_persisted_time() {
        let h = harness();
        h.store
            .set(SESSION_KEY, &persisted_json(Utc::now() + ChronoDuration::seconds(30)))
            .unwrap();
        assert!(h.manager.restore());

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_changes_replays_latest_then_follows() {
        let h = harness();
        let session = h.manager.establish("cook@example.com", "uid-1", "tok", 3600);

        let mut changes = Box::pin(h.manager.changes());
        assert_eq!(changes.next().await, Some(Some(session)));

        h.manager.logout();
        assert_eq!(changes.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_store_written_before_publication() {
        let (manager, store) = observed_manager();
        let first = manager.establish("cook@example.com", "uid-1", "first", 3600);
        let second = manager.establish("cook@example.com", "uid-1", "second", 3600);
        manager.logout();

        assert_eq!(*store.seen_on_set.lock().unwrap(), vec![None, Some(first)]);
        assert_eq!(*store.seen_on_remove.lock().unwrap(), vec![Some(second)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_clears_store_before_publication() {
        let (manager, store) = observed_manager();
        let session = manager.establish("cook@example.com", "uid-1", "tok", 10);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_eq!(*store.seen_on_remove.lock().unwrap(), vec![Some(session)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_lifetime_is_kept_exactly() {
        let h = harness();
        let two_years: u64 = 2 * 365 * 24 * 60 * 60;
        let before = Utc::now();
        let session = h.manager.establish("cook@example.com", "uid-1", "tok", two_years);
        let after = Utc::now();

        let ttl = ChronoDuration::seconds(two_years as i64);
        assert!(session.token_expires_at >= before + ttl);
        assert!(session.token_expires_at <= after + ttl);

        tokio::time::advance(Duration::from_secs(366 * 24 * 60 * 60)).await;
        settle().await;
        assert!(h.manager.is_authenticated());
        assert!(h.manager.timer_armed());

        tokio::time::advance(Duration::from_secs(two_years - 366 * 24 * 60 * 60)).await;
        settle().await;
        assert_eq!(h.manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_far_future_restore_stays_logged_in() {
        let h = harness();
        let expires_at = Utc::now() + ChronoDuration::days(3 * 365);
        h.store.set(SESSION_KEY, &persisted_json(expires_at)).unwrap();
        assert!(h.manager.restore());
        assert_eq!(h.manager.current().unwrap().token_expires_at, expires_at);

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        settle().await;
        assert_eq!(h.manager.state(), SessionState::LoggedIn);
        assert!(h.manager.timer_armed());
    }

    #[test]
    fn test_expiry_after_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 10), now + ChronoDuration::seconds(10));
        assert_eq!(expiry_after(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
