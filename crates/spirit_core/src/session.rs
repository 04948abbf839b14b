//! crates/spirit_core/src/session.rs
//!
//! The session store: who the viewer is, answered synchronously from local state.
//!
//! The backend runs two refresh routines (a background token refresher and a
//! foreground session read) that contend for the same refresh token. When they
//! collide, the auth subsystem emits a "signed out" notification even though the
//! persisted token is still valid. The store therefore only clears identity on
//! sign-out when local storage no longer holds an id.

use crate::domain::{AuthEvent, AuthSession, Profile, Session};
use crate::ports::{RemoteStore, SessionPersistence};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an auth-change notification did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthTransition {
    /// A different user id was adopted.
    Adopted(Uuid),
    /// The same user signed in again or refreshed their token.
    Restored(Uuid),
    /// A sign-out was distrusted because local storage still holds an id.
    KeptFallback(Uuid),
    Cleared,
    /// Signed out while already anonymous.
    Unchanged,
}

/// Broadcast to components that must react to identity changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// The session came back after a background refresh; data may be stale.
    Restored,
    UserChanged(Option<Uuid>),
}

pub struct SessionStore {
    persistence: Arc<dyn SessionPersistence>,
    store: Arc<dyn RemoteStore>,
    state: RwLock<Session>,
    signals: broadcast::Sender<SessionSignal>,
}

impl SessionStore {
    /// Seeds the session from local storage. Never touches the network.
    pub fn new(persistence: Arc<dyn SessionPersistence>, store: Arc<dyn RemoteStore>) -> Self {
        let user_id = match persistence.load() {
            Ok(session) => session.map(|s| s.user_id),
            Err(e) => {
                warn!("Could not read persisted session: {}", e);
                None
            }
        };
        let (signals, _) = broadcast::channel(16);
        Self {
            persistence,
            store,
            state: RwLock::new(Session {
                user_id,
                profile: None,
            }),
            signals,
        }
    }

    pub fn current_user_id(&self) -> Option<Uuid> {
        self.read().user_id
    }

    pub fn profile(&self) -> Option<Profile> {
        self.read().profile.clone()
    }

    pub fn session(&self) -> Session {
        self.read().clone()
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Applies one auth-change notification.
    pub async fn on_auth_change(&self, event: AuthEvent) -> AuthTransition {
        match event {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => {
                self.adopt(session).await
            }
            AuthEvent::SignedOut => self.handle_signed_out(),
        }
    }

    async fn adopt(&self, session: AuthSession) -> AuthTransition {
        if let Err(e) = self.persistence.save(&session) {
            warn!("Could not persist session for {}: {}", session.user_id, e);
        }

        let user_id = session.user_id;
        let (previous, has_profile) = {
            let mut state = self.write();
            let previous = state.user_id.replace(user_id);
            (previous, state.profile.is_some())
        };

        if previous == Some(user_id) {
            debug!(%user_id, "Session restored");
            self.emit(SessionSignal::Restored);
            if !has_profile {
                self.refresh_profile().await;
            }
            return AuthTransition::Restored(user_id);
        }

        info!(%user_id, "Adopted new session");
        self.emit(SessionSignal::UserChanged(Some(user_id)));
        self.refresh_profile().await;
        AuthTransition::Adopted(user_id)
    }

    fn handle_signed_out(&self) -> AuthTransition {
        let fallback = match self.persistence.load() {
            Ok(session) => session.map(|s| s.user_id),
            Err(e) => {
                warn!("Could not read persisted session on sign-out: {}", e);
                None
            }
        };

        let mut state = self.write();
        let current = state.user_id;
        match (fallback, current) {
            (Some(_), Some(current)) => {
                info!(user_id = %current, "Ignoring sign-out: persisted token still present");
                AuthTransition::KeptFallback(current)
            }
            (Some(fallback), None) => {
                info!(user_id = %fallback, "Recovered session from persisted token");
                state.user_id = Some(fallback);
                drop(state);
                self.emit(SessionSignal::UserChanged(Some(fallback)));
                AuthTransition::KeptFallback(fallback)
            }
            (None, Some(_)) => {
                info!("Signed out");
                *state = Session::default();
                drop(state);
                self.emit(SessionSignal::UserChanged(None));
                AuthTransition::Cleared
            }
            (None, None) => AuthTransition::Unchanged,
        }
    }

    /// Explicit sign-out: forget the persisted token and the in-memory session.
    pub fn sign_out(&self) {
        if let Err(e) = self.persistence.clear() {
            warn!("Could not clear persisted session: {}", e);
        }
        let had_user = {
            let mut state = self.write();
            let had_user = state.user_id.is_some();
            *state = Session::default();
            had_user
        };
        if had_user {
            self.emit(SessionSignal::UserChanged(None));
        }
    }

    /// Refetches the profile for the current user. On failure the previous
    /// profile stays in place.
    pub async fn refresh_profile(&self) {
        let Some(user_id) = self.current_user_id() else {
            return;
        };
        match self.store.fetch_profile(user_id).await {
            Ok(profile) => {
                let mut state = self.write();
                // The user may have changed while the fetch was in flight.
                if state.user_id == Some(user_id) {
                    state.profile = Some(profile);
                }
            }
            Err(e) => warn!(%user_id, "Profile refetch failed, keeping previous: {}", e),
        }
    }

    fn emit(&self, signal: SessionSignal) {
        // No receivers is fine.
        let _ = self.signals.send(signal);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
