//! Session lifecycle and the auth flow state machine. One `Session` exists
//! per signed-in user; it owns the derived key and salt, and every
//! subscription checks back here before writing into shared state. The same
//! machine drives first login and silent re-auth after key loss.

use crate::crypto::{CryptoError, Key};
use crate::logger::log;
use crate::store::AuthUser;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    SignedOut,
    AwaitingCredentials,
    KeyEstablished,
    Unlocked,
    LockedPendingReauth,
}

/// Events the sync layers push up to whoever owns the UI loop. Components
/// below the auth controller never prompt the user directly.
#[derive(Debug)]
pub enum SyncEvent {
    StateUpdated,
    NotesUpdated,
    /// A decrypt failed somewhere; the session is locked until the user
    /// re-enters their passphrase.
    ReauthRequired(CryptoError),
    /// A best-effort remote write did not land. The local cache already has
    /// the data; surfaced so it is never silently lost.
    RemoteWriteFailed { path: String },
    /// A stored payload is structurally broken. Re-auth will not help;
    /// surfaced as a distinct "data corrupted" condition.
    PayloadInvalid { path: String },
}

struct SessionInner {
    phase: AuthPhase,
    user: Option<AuthUser>,
    key: Option<Key>,
    salt: Option<String>,
    /// Bumped on every sign-out. Subscription callbacks compare the epoch
    /// they were spawned under so a feed left over from a previous account
    /// can never write into the new account's state.
    epoch: u64,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                phase: AuthPhase::SignedOut,
                user: None,
                key: None,
                salt: None,
                epoch: 0,
            })),
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.inner.lock().unwrap().phase
    }

    pub fn user(&self) -> Option<AuthUser> {
        self.inner.lock().unwrap().user.clone()
    }

    pub fn uid(&self) -> Option<String> {
        self.inner.lock().unwrap().user.as_ref().map(|u| u.id.clone())
    }

    pub fn key(&self) -> Option<Key> {
        self.inner.lock().unwrap().key.clone()
    }

    pub fn salt(&self) -> Option<String> {
        self.inner.lock().unwrap().salt.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().unwrap().epoch
    }

    /// Identity guard for subscription callbacks: the event is only valid if
    /// the session still belongs to the uid/epoch it was subscribed under.
    pub fn is_current(&self, uid: &str, epoch: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.epoch == epoch && inner.user.as_ref().map(|u| u.id.as_str()) == Some(uid)
    }

    /// `signed-out → awaiting-credentials` (also re-entered from
    /// `locked-pending-reauth` when the user re-submits a passphrase).
    pub fn begin_credentials(&self, user: AuthUser) {
        let mut inner = self.inner.lock().unwrap();
        log(&format!(
            "session: {:?} -> AwaitingCredentials ({})",
            inner.phase, user.email
        ));
        inner.user = Some(user);
        inner.key = None;
        inner.phase = AuthPhase::AwaitingCredentials;
    }

    /// `awaiting-credentials → key-established`: a wrapped key was recovered
    /// or passphrase derivation succeeded.
    pub fn establish_key(&self, key: Key, salt: String) {
        let mut inner = self.inner.lock().unwrap();
        log(&format!("session: {:?} -> KeyEstablished", inner.phase));
        inner.key = Some(key);
        inner.salt = Some(salt);
        inner.phase = AuthPhase::KeyEstablished;
    }

    /// `key-established → unlocked`: the state payload (if any) decrypted.
    pub fn unlock(&self) {
        let mut inner = self.inner.lock().unwrap();
        log(&format!("session: {:?} -> Unlocked", inner.phase));
        inner.phase = AuthPhase::Unlocked;
    }

    /// Any decrypt failure anywhere in the system lands here. The key is
    /// cleared; only re-authentication can recover.
    pub fn lock_pending_reauth(&self, reason: &CryptoError) {
        let mut inner = self.inner.lock().unwrap();
        log(&format!(
            "session: {:?} -> LockedPendingReauth ({})",
            inner.phase, reason
        ));
        inner.key = None;
        inner.phase = AuthPhase::LockedPendingReauth;
    }

    /// Full teardown. The epoch bump invalidates every live subscription
    /// spawned for the previous user.
    pub fn sign_out(&self) {
        let mut inner = self.inner.lock().unwrap();
        log(&format!("session: {:?} -> SignedOut", inner.phase));
        inner.user = None;
        inner.key = None;
        inner.salt = None;
        inner.epoch += 1;
        inner.phase = AuthPhase::SignedOut;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn user() -> AuthUser {
        AuthUser {
            id: "u1".to_string(),
            email: "a@b.c".to_string(),
            email_verified: true,
        }
    }

    fn key() -> Key {
        Zeroizing::new([7u8; 32])
    }

    #[test]
    fn happy_path_transitions() {
        let s = Session::new();
        assert_eq!(s.phase(), AuthPhase::SignedOut);

        s.begin_credentials(user());
        assert_eq!(s.phase(), AuthPhase::AwaitingCredentials);

        s.establish_key(key(), "salt".to_string());
        assert_eq!(s.phase(), AuthPhase::KeyEstablished);
        assert!(s.key().is_some());

        s.unlock();
        assert_eq!(s.phase(), AuthPhase::Unlocked);
    }

    #[test]
    fn reauth_loop_is_reentrant() {
        let s = Session::new();
        s.begin_credentials(user());
        s.establish_key(key(), "salt".to_string());
        s.unlock();

        s.lock_pending_reauth(&CryptoError::DecryptFailed);
        assert_eq!(s.phase(), AuthPhase::LockedPendingReauth);
        assert!(s.key().is_none());
        // uid survives the lock so re-auth can reuse it
        assert_eq!(s.uid().as_deref(), Some("u1"));

        // Same flow as first login
        s.begin_credentials(user());
        s.establish_key(key(), "salt".to_string());
        s.unlock();
        assert_eq!(s.phase(), AuthPhase::Unlocked);
    }

    #[test]
    fn epoch_guard_rejects_stale_subscribers() {
        let s = Session::new();
        s.begin_credentials(user());
        let epoch = s.epoch();
        assert!(s.is_current("u1", epoch));

        s.sign_out();
        assert!(!s.is_current("u1", epoch));

        // New sign-in under a different account
        s.begin_credentials(AuthUser {
            id: "u2".to_string(),
            email: "x@y.z".to_string(),
            email_verified: false,
        });
        assert!(!s.is_current("u1", epoch));
        assert!(!s.is_current("u2", epoch));
        assert!(s.is_current("u2", s.epoch()));
    }

    #[test]
    fn sign_out_clears_secrets() {
        let s = Session::new();
        s.begin_credentials(user());
        s.establish_key(key(), "salt".to_string());
        s.sign_out();
        assert!(s.key().is_none());
        assert!(s.salt().is_none());
        assert!(s.user().is_none());
    }
}
