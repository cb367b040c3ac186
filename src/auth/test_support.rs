//! Scripted collaborators for exercising the session core.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::error::{ProviderError, StoreError};
use super::feed::{SessionFeed, SessionSubscription};
use super::traits::{IdentityProvider, ProfileStore, RestoredSession, SignedIn, SignedUp};
use super::types::{Profile, Role, Session, SessionEventKind};

pub fn profile(id: &str, email: &str, role: Role) -> Profile {
    Profile {
        id: id.into(),
        email: email.into(),
        role,
    }
}

/// Poll `check` until it holds, yielding to spawned tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Debug, Clone)]
pub enum RestoreBehavior {
    Absent,
    Present(Session),
    Fail,
    Hang,
}

struct Account {
    password: String,
    subject_id: String,
}

/// In-memory identity provider with scriptable behaviour.
pub struct ScriptedIdentity {
    pub feed: SessionFeed,
    accounts: Mutex<HashMap<String, Account>>,
    restore: Mutex<RestoreBehavior>,
    next_subject: AtomicUsize,
    pub restore_calls: AtomicUsize,
    pub sign_out_fails: AtomicBool,
    pub sign_in_hangs: AtomicBool,
}

impl ScriptedIdentity {
    pub fn new() -> Self {
        Self {
            feed: SessionFeed::default(),
            accounts: Mutex::new(HashMap::new()),
            restore: Mutex::new(RestoreBehavior::Absent),
            next_subject: AtomicUsize::new(1),
            restore_calls: AtomicUsize::new(0),
            sign_out_fails: AtomicBool::new(false),
            sign_in_hangs: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_account(self, email: &str, password: &str, subject_id: &str) -> Self {
        self.accounts.lock().insert(
            email.to_ascii_lowercase(),
            Account {
                password: password.into(),
                subject_id: subject_id.into(),
            },
        );
        self
    }

    #[must_use]
    pub fn with_restore(self, behavior: RestoreBehavior) -> Self {
        *self.restore.lock() = behavior;
        self
    }

    /// Simulate a change that originates outside this process.
    pub fn push_change(&self, kind: SessionEventKind, session: Option<Session>) -> u64 {
        self.feed.emit(kind, session)
    }

    pub fn session_for(&self, subject_id: &str) -> Session {
        Session::new(subject_id, format!("token-{subject_id}-{}", self.feed.current_seq()))
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentity {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn restore_session(&self) -> Result<RestoredSession, ProviderError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.restore.lock().clone();
        match behavior {
            RestoreBehavior::Absent => Ok(RestoredSession {
                seq: self.feed.current_seq(),
                session: None,
            }),
            RestoreBehavior::Present(session) => Ok(RestoredSession {
                seq: self.feed.current_seq(),
                session: Some(session),
            }),
            RestoreBehavior::Fail => Err(ProviderError::Unavailable("restore failed".into())),
            RestoreBehavior::Hang => std::future::pending().await,
        }
    }

    fn current_seq(&self) -> u64 {
        self.feed.current_seq()
    }

    fn subscribe(&self) -> SessionSubscription {
        self.feed.subscribe()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignedIn, ProviderError> {
        if self.sign_in_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let subject_id = {
            let accounts = self.accounts.lock();
            match accounts.get(&email.to_ascii_lowercase()) {
                Some(account) if account.password == password => account.subject_id.clone(),
                _ => return Err(ProviderError::Rejected("Invalid login credentials".into())),
            }
        };
        let session = self.session_for(&subject_id).with_email(email);
        let seq = self
            .feed
            .emit(SessionEventKind::SignedIn, Some(session.clone()));
        Ok(SignedIn { seq, session })
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignedUp, ProviderError> {
        let key = email.to_ascii_lowercase();
        let subject_id = {
            let mut accounts = self.accounts.lock();
            if accounts.contains_key(&key) {
                return Err(ProviderError::AlreadyRegistered(email.into()));
            }
            let subject_id = format!("new-{}", self.next_subject.fetch_add(1, Ordering::SeqCst));
            accounts.insert(
                key,
                Account {
                    password: password.into(),
                    subject_id: subject_id.clone(),
                },
            );
            subject_id
        };
        let session = self.session_for(&subject_id).with_email(email);
        let seq = self
            .feed
            .emit(SessionEventKind::SignedIn, Some(session.clone()));
        Ok(SignedUp {
            seq,
            subject_id,
            email: email.into(),
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<u64, ProviderError> {
        if self.sign_out_fails.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("connection reset".into()));
        }
        Ok(self.feed.emit(SessionEventKind::SignedOut, None))
    }
}

/// In-memory profile table with per-subject fetch gates.
#[derive(Default)]
pub struct ScriptedProfiles {
    rows: Mutex<HashMap<String, Profile>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    failing: Mutex<HashSet<String>>,
    fetches: Mutex<Vec<String>>,
    pub insert_fails: AtomicBool,
}

impl ScriptedProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_row(self, profile: Profile) -> Self {
        self.rows.lock().insert(profile.id.clone(), profile);
        self
    }

    /// Block fetches for `subject_id` until [`release`](Self::release).
    pub fn gate(&self, subject_id: &str) {
        self.gates
            .lock()
            .insert(subject_id.into(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, subject_id: &str) {
        if let Some(gate) = self.gates.lock().get(subject_id) {
            gate.add_permits(1);
        }
    }

    pub fn fail_fetches_for(&self, subject_id: &str) {
        self.failing.lock().insert(subject_id.into());
    }

    pub fn heal(&self, subject_id: &str) {
        self.failing.lock().remove(subject_id);
    }

    pub fn fetch_count(&self, subject_id: &str) -> usize {
        self.fetches
            .lock()
            .iter()
            .filter(|id| id.as_str() == subject_id)
            .count()
    }

    pub fn rows_with_email(&self, email: &str) -> usize {
        self.rows
            .lock()
            .values()
            .filter(|p| p.email.eq_ignore_ascii_case(email))
            .count()
    }
}

#[async_trait]
impl ProfileStore for ScriptedProfiles {
    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        self.fetches.lock().push(id.to_string());
        let gate = self.gates.lock().get(id).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.failing.lock().contains(id) {
            return Err(StoreError::Unavailable("profile store offline".into()));
        }
        Ok(self.rows.lock().get(id).cloned())
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        if self.insert_fails.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("constraint violation".into()));
        }
        let mut rows = self.rows.lock();
        if rows.contains_key(&profile.id) {
            return Err(StoreError::Duplicate(profile.id.clone()));
        }
        rows.insert(profile.id.clone(), profile.clone());
        Ok(())
    }
}
