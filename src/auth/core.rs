//! Session/authorization core.
//!
//! [`AuthCore`] reconciles the identity provider's session with the
//! application profile and publishes one [`AuthState`] snapshot through a
//! `tokio::sync::watch` channel. All writes go through the reconciliation
//! ledger below:
//!
//! - every accepted trigger bumps a **generation**; a profile fetch only
//!   commits if its generation is still current when it completes
//! - the highest accepted provider **seq** is remembered, so echoes of
//!   transitions the core already applied (and lagging notifications) are
//!   dropped
//! - a trigger for a subject whose fetch is already in flight joins that
//!   fetch instead of starting another
//! - while a sign-up is between "account created" and "profile inserted",
//!   notifications are deferred and replayed afterwards
//!
//! Readiness leaves `Initializing` exactly once, on the first commit.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use super::error::{AuthError, AuthErrorKind, StoreError};
use super::feed::{SessionSubscription, SubscriptionEvent};
use super::traits::{IdentityProvider, ProfileStore};
use super::types::{AuthState, Profile, Readiness, Role, Session, SessionChange};

/// Default bound on any single provider or profile-store call.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 15;

/// Minimum password length accepted by self-service sign-up.
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 6;

/// Tunables for [`AuthCore`].
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub call_timeout: Duration,
    pub min_password_len: usize,
    /// Operator override allowing `admin` through self-service sign-up.
    pub allow_admin_signup: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            allow_admin_signup: false,
        }
    }
}

/// Handle to the process-wide session core.
///
/// Construct exactly one per process at the composition root and hand out
/// clones; every clone shares the same published state.
#[derive(Clone)]
pub struct AuthCore {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileStore>,
    settings: CoreSettings,
    state: watch::Sender<AuthState>,
    ledger: Mutex<Ledger>,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Ledger {
    generation: u64,
    accepted_seq: Option<u64>,
    in_flight: Option<InFlight>,
    /// Sign-ups currently holding notifications back.
    holds: u32,
    /// Sign-outs waiting on the provider. Background triggers carrying a
    /// session are dropped meanwhile.
    signing_out: u32,
    deferred: Vec<SessionChange>,
}

impl Ledger {
    /// Treat every provider change up to `seq` as already applied.
    fn raise_barrier(&mut self, seq: u64) {
        self.accepted_seq = Some(self.accepted_seq.map_or(seq, |s| s.max(seq)));
    }
}

struct InFlight {
    generation: u64,
    /// Newest session seen for this subject; committed with the profile.
    session: Session,
    done: watch::Receiver<bool>,
}

/// What a trigger turned into once it passed through the ledger.
enum Claim {
    /// Caller owns a new profile fetch.
    Fetch(FetchTicket),
    /// A fetch for the same subject is already running.
    Join(watch::Receiver<bool>),
    /// Nothing left to wait for (cleared, stale or no-op).
    Settled,
}

struct FetchTicket {
    generation: u64,
    subject_id: String,
    done: watch::Sender<bool>,
}

struct FetchFailure {
    error: AuthError,
    /// Transport-level failures keep a previous profile for the same subject.
    transient: bool,
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Restore,
    Notification,
    SignIn,
    SignUp,
    SignOut,
}

impl AuthCore {
    /// Create the core, subscribe to session changes and issue the initial
    /// restore. Must be called from within a Tokio runtime.
    pub fn start(
        identity: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        settings: CoreSettings,
    ) -> Self {
        // Subscribe before restoring so no change between the two is lost.
        let subscription = identity.subscribe();
        let (state, _rx) = watch::channel(AuthState::default());

        let inner = Arc::new(Inner {
            identity,
            profiles,
            settings,
            state,
            ledger: Mutex::new(Ledger::default()),
            shutdown: CancellationToken::new(),
            listener: Mutex::new(None),
        });

        tracing::info!(
            provider = inner.identity.name(),
            timeout_secs = inner.settings.call_timeout.as_secs(),
            "Starting session core"
        );

        let listener = tokio::spawn(listen(
            Arc::downgrade(&inner),
            subscription,
            inner.shutdown.clone(),
        ));
        *inner.listener.lock() = Some(listener);

        let restorer = inner.clone();
        tokio::spawn(async move { restorer.restore().await });

        Self { inner }
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// Watch receiver that always yields the most recent snapshot.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    /// Snapshot stream, starting with the current value.
    pub fn changes(&self) -> WatchStream<AuthState> {
        WatchStream::new(self.inner.state.subscribe())
    }

    /// Resolve once the first restore attempt has completed.
    pub async fn ready(&self) -> AuthState {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let state = match rx.wait_for(AuthState::is_ready).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        };
        state
    }

    /// Sign in with email and password.
    ///
    /// Resolves after the resulting session has been reconciled. Failures
    /// are recorded in `last_error` and also returned.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthState, AuthError> {
        let inner = &self.inner;
        let op = inner.begin_operation("sign_in");

        let signed_in = match tokio::time::timeout(
            inner.settings.call_timeout,
            inner.identity.sign_in_with_password(email, password),
        )
        .await
        {
            Ok(Ok(signed_in)) => signed_in,
            Ok(Err(err)) => {
                tracing::warn!(email, error = %err, "Sign-in rejected");
                return Err(inner.record_error(err.into_auth_error()));
            }
            Err(_) => return Err(inner.record_error(AuthError::timed_out("sign in"))),
        };

        let subject_id = signed_in.session.subject_id.clone();
        let claim = inner.claim(signed_in.seq, Some(signed_in.session), Origin::SignIn);
        inner.settle(claim).await;
        drop(op);

        inner.outcome_for(&subject_id)
    }

    /// Create an account and its profile row.
    ///
    /// The profile is inserted before the new session is reconciled. A
    /// failed insert still reconciles the session, leaving the state in
    /// `AuthenticatedProfileMissing` with `ProfileWriteFailed` recorded.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<AuthState, AuthError> {
        let inner = &self.inner;
        let op = inner.begin_operation("sign_up");

        if password.chars().count() < inner.settings.min_password_len {
            return Err(inner.record_error(AuthError::new(
                AuthErrorKind::WeakCredential,
                format!(
                    "password must be at least {} characters",
                    inner.settings.min_password_len
                ),
            )));
        }
        if role == Role::Admin && !inner.settings.allow_admin_signup {
            tracing::warn!(email, "Rejected self-service admin sign-up");
            return Err(inner.record_error(AuthError::new(
                AuthErrorKind::RoleNotSelfAssignable,
                "admin accounts are provisioned by an operator",
            )));
        }

        let hold = SignUpHold::acquire(inner);

        let signed_up = match tokio::time::timeout(
            inner.settings.call_timeout,
            inner.identity.sign_up(email, password),
        )
        .await
        {
            Ok(Ok(signed_up)) => signed_up,
            Ok(Err(err)) => {
                tracing::warn!(email, error = %err, "Sign-up rejected");
                return Err(inner.record_error(err.into_auth_error()));
            }
            Err(_) => return Err(inner.record_error(AuthError::timed_out("sign up"))),
        };

        let profile = Profile {
            id: signed_up.subject_id.clone(),
            email: signed_up.email.clone(),
            role,
        };
        let write_error = match tokio::time::timeout(
            inner.settings.call_timeout,
            inner.profiles.insert_profile(&profile),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::info!(subject = %profile.id, role = %role, "Profile created");
                None
            }
            Ok(Err(err)) => {
                tracing::error!(subject = %profile.id, error = %err, "Profile insert failed");
                Some(AuthError::new(AuthErrorKind::ProfileWriteFailed, err.to_string()))
            }
            Err(_) => Some(AuthError::new(
                AuthErrorKind::ProfileWriteFailed,
                "profile insert timed out",
            )),
        };

        let claim = match signed_up.session {
            Some(session) => inner.claim(signed_up.seq, Some(session), Origin::SignUp),
            None => {
                tracing::info!(email, "Account created; provider issued no session yet");
                Claim::Settled
            }
        };
        hold.release();
        inner.settle(claim).await;

        if let Some(err) = write_error {
            drop(op);
            return Err(inner.record_error(err));
        }
        drop(op);

        inner.outcome_for(&signed_up.subject_id)
    }

    /// Sign out.
    ///
    /// Local state is cleared before the provider is contacted, so the
    /// caller is logged out even if the provider call fails. A provider
    /// failure is recorded as `SignOutFailed`. Session changes the provider
    /// emitted before or during the call cannot bring the session back.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let inner = &self.inner;
        let _op = inner.begin_operation("sign_out");

        {
            let mut ledger = inner.ledger.lock();
            ledger.generation += 1;
            ledger.in_flight = None;
            ledger.signing_out += 1;
            ledger.raise_barrier(inner.identity.current_seq());
            inner.state.send_modify(|state| {
                state.session = None;
                state.profile = None;
                state.readiness = Readiness::Ready;
            });
        }
        tracing::info!("Signed out locally");

        let result =
            tokio::time::timeout(inner.settings.call_timeout, inner.identity.sign_out()).await;

        {
            let mut ledger = inner.ledger.lock();
            ledger.signing_out = ledger.signing_out.saturating_sub(1);
            if !matches!(result, Ok(Ok(_))) {
                // The provider may still hold a session; nothing it emitted
                // up to now may restore it.
                ledger.raise_barrier(inner.identity.current_seq());
            }
        }

        match result {
            Ok(Ok(seq)) => {
                let claim = inner.claim(seq, None, Origin::SignOut);
                inner.settle(claim).await;
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Provider sign-out failed");
                Err(inner.record_error(AuthError::new(
                    AuthErrorKind::SignOutFailed,
                    err.to_string(),
                )))
            }
            Err(_) => Err(inner.record_error(AuthError::new(
                AuthErrorKind::SignOutFailed,
                "provider sign-out timed out",
            ))),
        }
    }

    /// Stop listening for session changes and release the subscription.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.listener.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    // ── Ledger ──────────────────────────────────────────────────

    /// Pass a trigger through the ledger. Synchronous, so triggers are
    /// ordered by the time they are claimed.
    fn claim(&self, seq: u64, session: Option<Session>, origin: Origin) -> Claim {
        let mut ledger = self.ledger.lock();

        let stale = ledger.accepted_seq.is_some_and(|accepted| seq <= accepted);
        if stale {
            tracing::debug!(seq, ?origin, "Ignoring already-applied session change");
            return match (&ledger.in_flight, &session) {
                (Some(flight), Some(session)) if flight.session.subject_id == session.subject_id => {
                    Claim::Join(flight.done.clone())
                }
                _ => Claim::Settled,
            };
        }
        if ledger.signing_out > 0
            && session.is_some()
            && matches!(origin, Origin::Notification | Origin::Restore)
        {
            tracing::debug!(seq, ?origin, "Ignoring session change during sign-out");
            return Claim::Settled;
        }
        ledger.accepted_seq = Some(seq);

        let Some(session) = session else {
            ledger.generation += 1;
            ledger.in_flight = None;
            self.state.send_modify(|state| {
                state.session = None;
                state.profile = None;
                state.readiness = Readiness::Ready;
            });
            tracing::info!(seq, ?origin, "Session cleared");
            return Claim::Settled;
        };

        if let Some(flight) = ledger.in_flight.as_mut() {
            if flight.session.subject_id == session.subject_id {
                tracing::debug!(subject = %session.subject_id, "Joining in-flight reconciliation");
                flight.session = session;
                return Claim::Join(flight.done.clone());
            }
        }

        ledger.generation += 1;
        let generation = ledger.generation;
        let subject_id = session.subject_id.clone();
        let (done, done_rx) = watch::channel(false);
        ledger.in_flight = Some(InFlight {
            generation,
            session,
            done: done_rx,
        });
        tracing::debug!(subject = %subject_id, generation, ?origin, "Reconciling session");

        Claim::Fetch(FetchTicket {
            generation,
            subject_id,
            done,
        })
    }

    /// Drive a claim to completion on the caller's task.
    async fn settle(&self, claim: Claim) {
        match claim {
            Claim::Fetch(ticket) => self.complete(ticket).await,
            Claim::Join(mut done) => {
                let _ = done.wait_for(|finished| *finished).await;
            }
            Claim::Settled => {}
        }
    }

    async fn complete(&self, ticket: FetchTicket) {
        let fetched = self.fetch_profile(&ticket.subject_id).await;
        self.commit(ticket.generation, fetched);
        let _ = ticket.done.send(true);
    }

    async fn fetch_profile(&self, subject_id: &str) -> Result<Profile, FetchFailure> {
        let result =
            tokio::time::timeout(self.settings.call_timeout, self.profiles.fetch_profile(subject_id))
                .await;

        match result {
            Ok(Ok(Some(profile))) if profile.id == subject_id => Ok(profile),
            Ok(Ok(Some(profile))) => Err(FetchFailure {
                error: AuthError::new(
                    AuthErrorKind::ProfileNotFound,
                    format!("store returned profile {} for subject {subject_id}", profile.id),
                ),
                transient: false,
            }),
            Ok(Ok(None)) => Err(FetchFailure {
                error: AuthError::new(
                    AuthErrorKind::ProfileNotFound,
                    format!("no profile for subject {subject_id}"),
                ),
                transient: false,
            }),
            Ok(Err(StoreError::Malformed(detail))) => Err(FetchFailure {
                error: AuthError::new(AuthErrorKind::ProfileNotFound, detail),
                transient: false,
            }),
            Ok(Err(err)) => Err(FetchFailure {
                error: AuthError::new(AuthErrorKind::ProviderUnavailable, err.to_string()),
                transient: true,
            }),
            Err(_) => Err(FetchFailure {
                error: AuthError::timed_out("profile fetch"),
                transient: true,
            }),
        }
    }

    /// Apply a fetch result if its generation is still current.
    fn commit(&self, generation: u64, fetched: Result<Profile, FetchFailure>) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(flight) = ledger.in_flight.take_if(|f| f.generation == generation) else {
            tracing::debug!(generation, "Discarding superseded profile fetch");
            return false;
        };
        let session = flight.session;
        let subject_id = session.subject_id.clone();

        self.state.send_modify(|state| {
            match fetched {
                Ok(profile) => {
                    tracing::info!(subject = %subject_id, role = %profile.role, "Session reconciled");
                    state.profile = Some(profile);
                    state.last_error = None;
                }
                Err(failure) => {
                    let keeps_profile = failure.transient
                        && state.profile.as_ref().is_some_and(|p| p.id == subject_id);
                    tracing::warn!(
                        subject = %subject_id,
                        error = %failure.error,
                        kept_previous = keeps_profile,
                        "Profile reconciliation failed"
                    );
                    if !keeps_profile {
                        state.profile = None;
                    }
                    state.last_error = Some(failure.error);
                }
            }
            state.session = Some(session);
            state.readiness = Readiness::Ready;
        });
        true
    }

    // ── Background triggers ─────────────────────────────────────

    async fn restore(self: Arc<Self>) {
        let result =
            tokio::time::timeout(self.settings.call_timeout, self.identity.restore_session()).await;

        match result {
            Ok(Ok(restored)) => {
                tracing::debug!(
                    seq = restored.seq,
                    has_session = restored.session.is_some(),
                    "Session restore completed"
                );
                let claim = self.claim(restored.seq, restored.session, Origin::Restore);
                self.settle(claim).await;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Session restore failed");
                self.fail_restore(err.into_auth_error());
            }
            Err(_) => {
                tracing::warn!("Session restore timed out");
                self.fail_restore(AuthError::timed_out("session restore"));
            }
        }
    }

    /// End `Initializing` after a failed restore, unless a reconciliation
    /// for an initial session is still running (it will end it instead).
    fn fail_restore(&self, error: AuthError) {
        let ledger = self.ledger.lock();
        let initial_fetch_pending = ledger.in_flight.is_some();
        self.state.send_modify(|state| {
            state.last_error = Some(error);
            if !initial_fetch_pending {
                state.readiness = Readiness::Ready;
            }
        });
    }

    fn on_notification(self: &Arc<Self>, change: SessionChange) {
        {
            let mut ledger = self.ledger.lock();
            if ledger.holds > 0 {
                tracing::debug!(seq = change.seq, kind = ?change.kind, "Deferring session change during sign-up");
                ledger.deferred.push(change);
                return;
            }
        }

        tracing::debug!(seq = change.seq, kind = ?change.kind, "Session change received");
        if let Claim::Fetch(ticket) = self.claim(change.seq, change.session, Origin::Notification) {
            let inner = self.clone();
            tokio::spawn(async move { inner.complete(ticket).await });
        }
    }

    fn replay(self: &Arc<Self>, deferred: Vec<SessionChange>) {
        for change in deferred {
            self.on_notification(change);
        }
    }

    // ── Operation bookkeeping ───────────────────────────────────

    fn begin_operation(&self, name: &'static str) -> OperationGuard<'_> {
        self.state.send_modify(|state| {
            state.operations_in_flight += 1;
            state.last_error = None;
        });
        tracing::debug!(operation = name, "Auth operation started");
        OperationGuard { state: &self.state }
    }

    fn record_error(&self, error: AuthError) -> AuthError {
        self.state.send_modify(|state| state.last_error = Some(error.clone()));
        error
    }

    /// Result of an imperative operation for `subject_id`, read from the
    /// published state after reconciliation.
    fn outcome_for(&self, subject_id: &str) -> Result<AuthState, AuthError> {
        let state = self.state.borrow().clone();
        let ours = state
            .session
            .as_ref()
            .is_some_and(|s| s.subject_id == subject_id);
        match &state.last_error {
            Some(err) if ours => Err(err.clone()),
            _ => Ok(state),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Counts an imperative operation as in flight until dropped.
struct OperationGuard<'a> {
    state: &'a watch::Sender<AuthState>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|state| {
            state.operations_in_flight = state.operations_in_flight.saturating_sub(1);
        });
    }
}

/// Defers session notifications while a sign-up is between account
/// creation and profile insert. Releasing replays what was deferred.
struct SignUpHold {
    inner: Arc<Inner>,
    released: bool,
}

impl SignUpHold {
    fn acquire(inner: &Arc<Inner>) -> Self {
        inner.ledger.lock().holds += 1;
        Self {
            inner: inner.clone(),
            released: false,
        }
    }

    fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let deferred = {
            let mut ledger = self.inner.ledger.lock();
            ledger.holds = ledger.holds.saturating_sub(1);
            if ledger.holds == 0 {
                std::mem::take(&mut ledger.deferred)
            } else {
                Vec::new()
            }
        };
        self.inner.replay(deferred);
    }
}

impl Drop for SignUpHold {
    fn drop(&mut self) {
        self.release_inner();
    }
}

async fn listen(
    inner: Weak<Inner>,
    mut subscription: SessionSubscription,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = subscription.next() => event,
        };
        let Some(event) = event else {
            tracing::debug!("Session feed closed");
            break;
        };
        let Some(inner) = inner.upgrade() else { break };

        match event {
            SubscriptionEvent::Change(change) => inner.on_notification(change),
            SubscriptionEvent::Lagged(skipped) => {
                tracing::warn!(skipped, "Session feed lagged; re-synchronising");
                tokio::spawn(inner.restore());
            }
        }
    }
    subscription.unsubscribe();
    tracing::debug!("Session listener stopped");
}
