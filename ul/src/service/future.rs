//! Blocking handle to the responses of one invocation.
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::association::{lock, CloseReason};
use crate::dimse::DimseMessage;

use super::{ClosedSnafu, ResponseListener, Result};

#[derive(Debug, Default)]
struct Outcome {
    /// pending responses, in arrival order
    pending: Vec<DimseMessage>,
    /// the final response
    response: Option<DimseMessage>,
    /// set if the association closed before the final response
    closed: Option<CloseReason>,
}

#[derive(Debug, Default)]
struct Inner {
    outcome: Mutex<Outcome>,
    changed: Condvar,
}

/// The responses to an invoked operation,
/// as obtained from [`invoke_future`](super::ActiveAssociation::invoke_future).
///
/// [`get`](Self::get) blocks until the final response arrives
/// or the association is closed.
/// Pending responses received in the meantime
/// can be inspected with [`list_pending`](Self::list_pending).
///
/// The handle can be cloned and shared between threads.
#[derive(Debug, Clone)]
pub struct FutureResponse {
    inner: Arc<Inner>,
    /// how long to still wait for a final response
    /// once the association is known to be closed
    grace: Duration,
}

impl FutureResponse {
    pub(crate) fn new(grace: Duration) -> Self {
        FutureResponse {
            inner: Arc::new(Inner::default()),
            grace,
        }
    }

    /// Wait for the final response.
    ///
    /// Fails if the association closed before it was received.
    pub fn get(&self) -> Result<DimseMessage> {
        loop {
            if let Some(response) = self.wait(None)? {
                return Ok(response);
            }
        }
    }

    /// Wait for the final response for at most the given time.
    ///
    /// Returns `Ok(None)` if the time elapsed first.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<DimseMessage>> {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<Option<DimseMessage>> {
        let mut outcome = lock(&self.inner.outcome);
        let mut close_deadline = None;
        loop {
            if let Some(response) = &outcome.response {
                return Ok(Some(response.clone()));
            }
            if let Some(reason) = &outcome.closed {
                // the final response may still be on its way
                // from the thread which read it
                let close_deadline = *close_deadline.get_or_insert_with(|| Instant::now() + self.grace);
                if Instant::now() >= close_deadline {
                    return ClosedSnafu {
                        reason: Some(reason.clone()),
                    }
                    .fail();
                }
            }

            let until = match (deadline, close_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            outcome = match until {
                None => self
                    .inner
                    .changed
                    .wait(outcome)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(until) => {
                    let now = Instant::now();
                    if deadline.map_or(false, |d| now >= d) {
                        return Ok(None);
                    }
                    self.inner
                        .changed
                        .wait_timeout(outcome, until.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// The final response, if already received.
    pub fn peek(&self) -> Option<DimseMessage> {
        lock(&self.inner.outcome).response.clone()
    }

    /// Whether [`get`](Self::get) would return immediately,
    /// with either the final response or a closed association.
    pub fn is_ready(&self) -> bool {
        let outcome = lock(&self.inner.outcome);
        outcome.response.is_some() || outcome.closed.is_some()
    }

    /// The pending responses received so far.
    pub fn list_pending(&self) -> Vec<DimseMessage> {
        lock(&self.inner.outcome).pending.clone()
    }
}

impl ResponseListener for FutureResponse {
    fn on_response(&self, response: DimseMessage) {
        let mut outcome = lock(&self.inner.outcome);
        if response.command.is_pending() {
            outcome.pending.push(response);
        } else if outcome.response.is_none() {
            outcome.response = Some(response);
        } else {
            debug!("Ignoring response after the final one");
        }
        drop(outcome);
        self.inner.changed.notify_all();
    }

    fn on_closed(&self, reason: &CloseReason) {
        let mut outcome = lock(&self.inner.outcome);
        if outcome.closed.is_none() {
            outcome.closed = Some(reason.clone());
        }
        drop(outcome);
        self.inner.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{Command, Status};
    use crate::pdu::AbortRQSource;
    use crate::service::Error;
    use matches::matches;

    fn response(status: Status) -> DimseMessage {
        let rq = Command::echo_rq(7);
        DimseMessage {
            presentation_context_id: 1,
            command: Command::response_to(&rq, status).unwrap(),
            data: None,
        }
    }

    #[test]
    fn pending_responses_are_listed_before_the_final_one() {
        let future = FutureResponse::new(Duration::from_millis(10));
        assert!(!future.is_ready());

        future.on_response(response(Status::PENDING));
        future.on_response(response(Status::PENDING_WARNING));
        assert!(!future.is_ready());
        assert_eq!(future.peek(), None);
        assert_eq!(future.list_pending().len(), 2);

        future.on_response(response(Status::SUCCESS));
        assert!(future.is_ready());
        let rsp = future.get().unwrap();
        assert_eq!(rsp.command.status(), Some(0x0000));
        assert_eq!(rsp.command.message_id_being_responded_to(), Some(7));
    }

    #[test]
    fn get_unblocks_from_another_thread() {
        let future = FutureResponse::new(Duration::from_millis(10));
        let listener = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            listener.on_response(response(Status::SUCCESS));
        });
        let rsp = future.get().unwrap();
        assert_eq!(rsp.command.status(), Some(0x0000));
        handle.join().unwrap();
    }

    #[test]
    fn closed_association_fails_after_grace_period() {
        let future = FutureResponse::new(Duration::from_millis(10));
        future.on_closed(&CloseReason::Aborted {
            source: AbortRQSource::ServiceUser,
        });
        assert!(future.is_ready());
        let err = future.get().unwrap_err();
        assert!(matches!(
            err,
            Error::Closed {
                reason: Some(CloseReason::Aborted { .. }),
                ..
            }
        ));
    }

    #[test]
    fn final_response_within_grace_period_wins() {
        let future = FutureResponse::new(Duration::from_secs(5));
        future.on_closed(&CloseReason::Released);
        let listener = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            listener.on_response(response(Status::SUCCESS));
        });
        assert!(future.get().is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn get_timeout_expires_without_response() {
        let future = FutureResponse::new(Duration::from_millis(10));
        let outcome = future.get_timeout(Duration::from_millis(20)).unwrap();
        assert_eq!(outcome, None);
    }
}
