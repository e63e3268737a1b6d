//! Suspended requests awaiting the outcome of an in-flight refresh

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::coordinator::RenewalOutcome;

/// One suspended request, parked until the owning refresh settles
///
/// Owned exclusively by the [`RequestQueue`] while parked. The one piece of
/// state an outside party may touch is the cancellation flag, reached through
/// the [`CancellationHandle`] returned at construction; the flag is observed
/// at settlement time, never by removing the entry from the queue.
pub(crate) struct PendingRequest {
    id: u64,
    cancelled: Arc<AtomicBool>,
    tx: oneshot::Sender<RenewalOutcome>,
}

impl PendingRequest {
    pub(crate) fn new(
        id: u64,
    ) -> (
        Self,
        oneshot::Receiver<RenewalOutcome>,
        CancellationHandle,
    ) {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = CancellationHandle {
            cancelled: Arc::clone(&cancelled),
        };
        (Self { id, cancelled, tx }, rx, handle)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Delivers the refresh outcome, or [`RenewalOutcome::Cancelled`] if the
    /// originator abandoned the request while it was parked.
    ///
    /// The oneshot channel enforces exactly-once delivery; `settle` consumes
    /// the entry.
    pub(crate) fn settle(self, outcome: RenewalOutcome) {
        let outcome = if self.is_cancelled() {
            tracing::trace!(request.id = self.id, "skipping cancelled request");
            RenewalOutcome::Cancelled
        } else {
            outcome
        };

        if self.tx.send(outcome).is_err() {
            tracing::trace!(request.id = self.id, "waiter dropped before settlement");
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Cancels a suspended request from the outside
///
/// Cancellation is caller-driven and asynchronous relative to the refresh
/// lifecycle: the flag may be raised at any moment before settlement. A
/// cancelled request still occupies its queue slot, keeping its neighbors'
/// order intact; at settlement it resolves with
/// [`RenewalOutcome::Cancelled`] and its retry is never run.
#[derive(Clone, Debug)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Marks the suspended request as cancelled
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the suspended request has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The FIFO holding area for requests suspended during a refresh
///
/// A pure ordered container. All mutation happens under the coordinator's
/// lifecycle lock, which is what makes `enqueue` atomic relative to
/// `drain_all`: an entry is either drained with the cycle it joined or left
/// for the next one, never lost or delivered twice.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    entries: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub(crate) const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue(&mut self, pending: PendingRequest) {
        self.entries.push_back(pending);
    }

    /// Empties the queue, returning the prior contents in insertion order
    pub(crate) fn drain_all(&mut self) -> VecDeque<PendingRequest> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
