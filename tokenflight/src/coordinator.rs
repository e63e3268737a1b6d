//! The single-flight refresh state machine

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::credentials::{Credential, CredentialStore};
use crate::queue::{CancellationHandle, PendingRequest, RequestQueue};
use crate::sources::RefreshCredentialSource;

/// Where the coordinator currently stands in its refresh lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    /// No refresh is in flight; the next authentication failure starts one
    Idle,
    /// A refresh is outstanding; new authentication failures join its queue
    Refreshing,
    /// The refresh credential was rejected; authentication failures fail
    /// fast until [`RefreshCoordinator::reset`] is called
    Terminal,
}

/// An error produced by a [`RefreshCredentialSource`]
///
/// The source classifies its own failures: the coordinator returns to idle
/// after a transient failure so a later authentication failure can try again,
/// and parks itself after a permanent one.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The refresh call failed in a way that a later attempt may not
    #[error("transient failure while refreshing credentials")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The refresh credential itself was rejected; no retry can succeed
    /// until a new session is established
    #[error("refresh credential rejected by the authority")]
    Permanent(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl RefreshError {
    /// Wraps an error as a transient refresh failure
    pub fn transient(
        error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Transient(error.into())
    }

    /// Wraps an error as a permanent refresh failure
    pub fn permanent(
        error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Permanent(error.into())
    }

    /// Whether this failure parks the coordinator
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// The fate of one suspended request
///
/// Broadcast at settlement: every still-waiting, non-cancelled request from
/// the same refresh cycle receives the same renewed credential or the same
/// error.
#[derive(Clone, Debug)]
pub enum RenewalOutcome {
    /// The refresh succeeded; replay with this credential
    Renewed(Credential),
    /// The refresh failed; no request from this cycle is replayed
    Failed(Arc<RefreshError>),
    /// The originator abandoned this request while it was suspended
    Cancelled,
}

/// Why a suspended request could not be replayed
#[derive(Clone, Debug, Error)]
pub enum RenewalError {
    /// The session could not be renewed
    #[error("session could not be renewed")]
    RefreshFailed(#[source] Arc<RefreshError>),

    /// The request was cancelled while awaiting renewal
    #[error("request was cancelled while awaiting credential renewal")]
    Cancelled,
}

/// The refresh drive was torn down before it could settle
///
/// Only observable when the runtime drops the drive task, e.g. at shutdown.
#[derive(Clone, Copy, Debug, Error)]
#[error("refresh coordinator quit before settling")]
pub struct CoordinatorQuit;

enum State {
    Idle,
    Refreshing,
    Terminal(Arc<RefreshError>),
}

/// The two values every transition must see together. Guarded by one mutex
/// so that checking the state and acting on the queue is a single step.
struct Lifecycle {
    state: State,
    queue: RequestQueue,
}

struct Inner<S> {
    lifecycle: Mutex<Lifecycle>,
    source: tokio::sync::Mutex<S>,
    store: Arc<dyn CredentialStore>,
    next_id: AtomicU64,
}

impl<S> Inner<S> {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // No code path panics while holding this lock, so a poisoned guard
        // still refers to coherent data.
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Coordinates credential refreshes so that at most one is ever in flight
///
/// Cheap to clone; clones share the same lifecycle, queue, and source.
pub struct RefreshCoordinator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for RefreshCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for RefreshCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl<S> RefreshCoordinator<S> {
    /// Constructs a coordinator in the idle state
    pub fn new(source: S, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(Lifecycle {
                    state: State::Idle,
                    queue: RequestQueue::new(),
                }),
                source: tokio::sync::Mutex::new(source),
                store,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The store this coordinator commits renewed credentials to
    pub fn credential_store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// The current lifecycle state, for diagnostics
    pub fn state(&self) -> RefreshState {
        match &self.inner.lock_lifecycle().state {
            State::Idle => RefreshState::Idle,
            State::Refreshing => RefreshState::Refreshing,
            State::Terminal(_) => RefreshState::Terminal,
        }
    }

    /// How many requests are currently suspended, for diagnostics
    pub fn queued(&self) -> usize {
        self.inner.lock_lifecycle().queue.len()
    }

    /// Re-enables refreshing after the owning application has established a
    /// fresh session out-of-band
    ///
    /// Clears a terminal condition back to idle. A no-op while idle (the
    /// queue is already empty then) and while a refresh is in flight (the
    /// cycle settles on its own).
    pub fn reset(&self) {
        let mut lifecycle = self.inner.lock_lifecycle();
        if let State::Terminal(_) = &lifecycle.state {
            lifecycle.state = State::Idle;
            tracing::info!("coordinator reset; credential refreshing re-enabled");
        }
    }
}

impl<S> RefreshCoordinator<S>
where
    S: RefreshCredentialSource + 'static,
{
    /// Reports an authentication failure and claims a spot in the current
    /// refresh cycle
    ///
    /// This is the atomic check-and-act step: the first caller to find the
    /// coordinator idle flips it to refreshing and starts the one refresh;
    /// everyone else joins that cycle's queue. The returned ticket resolves
    /// when the cycle settles. With the coordinator parked, the ticket is
    /// already resolved with the terminal error and nothing is enqueued.
    pub fn begin_renewal(&self) -> RenewalTicket {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (pending, rx, cancellation) = PendingRequest::new(id);

        let mut lifecycle = self.inner.lock_lifecycle();
        match &lifecycle.state {
            State::Terminal(error) => {
                let error = Arc::clone(error);
                drop(lifecycle);
                tracing::debug!(
                    request.id = id,
                    "failing fast; refresh credential was already rejected"
                );
                pending.settle(RenewalOutcome::Failed(error));
            }
            State::Refreshing => {
                lifecycle.queue.enqueue(pending);
                tracing::trace!(
                    request.id = id,
                    queued = lifecycle.queue.len(),
                    "joined in-flight refresh"
                );
            }
            State::Idle => {
                lifecycle.state = State::Refreshing;
                // Enqueued before the refresh starts so the trigger is
                // drained symmetrically with every later joiner.
                lifecycle.queue.enqueue(pending);
                drop(lifecycle);
                tracing::debug!(request.id = id, "authentication failure while idle; starting refresh");
                tokio::spawn(drive_refresh(Arc::clone(&self.inner)));
            }
        }

        RenewalTicket { rx, cancellation }
    }

    /// Suspends a failed request until the credential is renewed, then runs
    /// its retry with the new credential
    ///
    /// Resolves exactly once: with the retry's own output once the refresh
    /// succeeds and the retry completes, or with the refresh error (uniform
    /// across every request suspended in the same cycle), or with
    /// [`RenewalError::Cancelled`] if this request was abandoned while
    /// suspended — in which case the retry is never run.
    pub async fn handle_auth_failure<F, Fut, T>(&self, retry: F) -> Result<T, RenewalError>
    where
        F: FnOnce(Credential) -> Fut,
        Fut: Future<Output = T>,
    {
        match self.begin_renewal().outcome().await {
            RenewalOutcome::Renewed(credential) => Ok(retry(credential).await),
            RenewalOutcome::Failed(error) => Err(RenewalError::RefreshFailed(error)),
            RenewalOutcome::Cancelled => Err(RenewalError::Cancelled),
        }
    }
}

/// A claim on the outcome of the refresh cycle a suspended request joined
#[derive(Debug)]
pub struct RenewalTicket {
    rx: oneshot::Receiver<RenewalOutcome>,
    cancellation: CancellationHandle,
}

impl RenewalTicket {
    /// A handle the request's originator can use to abandon the wait
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Resolves once the owning refresh cycle settles
    pub async fn outcome(self) -> RenewalOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                RenewalOutcome::Failed(Arc::new(RefreshError::transient(CoordinatorQuit)))
            }
        }
    }
}

/// Drives the one in-flight refresh to settlement.
///
/// Spawned only from the idle-to-refreshing transition, so at most one drive
/// exists per cycle and the source is never called concurrently with itself.
async fn drive_refresh<S: RefreshCredentialSource>(inner: Arc<Inner<S>>) {
    let current = inner.store.get();
    let result = inner.source.lock().await.refresh(current).await;

    // Commit before draining so a replayed request can never observe the
    // stale credential.
    if let Ok(credential) = &result {
        inner.store.set(credential.clone());
    }

    // Transition and drain under one guard: the queue must be empty before
    // the state leaves `Refreshing`, and no joiner may slip in between.
    let mut lifecycle = inner.lock_lifecycle();
    let drained = lifecycle.queue.drain_all();
    let outcome = match result {
        Ok(credential) => {
            lifecycle.state = State::Idle;
            tracing::info!(
                waiters = drained.len(),
                "credentials renewed; resuming suspended requests"
            );
            RenewalOutcome::Renewed(credential)
        }
        Err(error) => {
            let error = Arc::new(error);
            if error.is_permanent() {
                lifecycle.state = State::Terminal(Arc::clone(&error));
                tracing::warn!(
                    error = (&*error as &dyn std::error::Error),
                    waiters = drained.len(),
                    "refresh credential rejected; halting refresh attempts until reset"
                );
            } else {
                lifecycle.state = State::Idle;
                tracing::warn!(
                    error = (&*error as &dyn std::error::Error),
                    waiters = drained.len(),
                    "refresh failed; a later authentication failure will retry"
                );
            }
            RenewalOutcome::Failed(error)
        }
    };
    drop(lifecycle);

    // Settlement happens outside the lock; delivery is only a channel send.
    for pending in drained {
        pending.settle(outcome.clone());
    }
}
