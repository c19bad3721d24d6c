//! The handle for an in-flight request.
//!
//! A request moves from `Pending` to exactly one terminal state. The status
//! is observable at any time through a `watch` channel; the outcome itself
//! (response or error) is delivered once through a `oneshot` channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::response::Response;
use crate::errors::ClientError;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Terminal result of a request.
#[derive(Debug)]
pub enum RequestOutcome {
    Completed(Response),
    Failed(ClientError),
    Cancelled,
}

impl RequestOutcome {
    pub fn status(&self) -> RequestStatus {
        match self {
            Self::Completed(_) => RequestStatus::Completed,
            Self::Failed(_) => RequestStatus::Failed,
            Self::Cancelled => RequestStatus::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<Response, ClientError> {
        match self {
            Self::Completed(response) => Ok(response),
            Self::Failed(err) => Err(err),
            Self::Cancelled => Err(ClientError::Cancelled),
        }
    }
}

/// Shared status cell. Only the first terminal transition sticks.
pub(crate) type StatusCell = Arc<watch::Sender<RequestStatus>>;

pub(crate) fn new_status_cell() -> StatusCell {
    let (tx, _rx) = watch::channel(RequestStatus::Pending);
    Arc::new(tx)
}

/// Move `cell` from `Pending` to `next`. Returns `false` if it had already
/// reached a terminal state.
pub(crate) fn transition(cell: &StatusCell, next: RequestStatus) -> bool {
    cell.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// A request that has been issued but whose outcome may not be known yet.
#[derive(Debug)]
pub struct PendingResponse {
    label: String,
    status: StatusCell,
    outcome_rx: Option<oneshot::Receiver<RequestOutcome>>,
    cancel: CancellationToken,
}

impl PendingResponse {
    pub(crate) fn new(
        label: String,
        status: StatusCell,
        outcome_rx: oneshot::Receiver<RequestOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label,
            status,
            outcome_rx: Some(outcome_rx),
            cancel,
        }
    }

    /// Human-readable request description, e.g. `GET http://127.0.0.1:8080/`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> RequestStatus {
        *self.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Cancel the request if it is still pending.
    ///
    /// Returns `true` if this call moved the request to `Cancelled`. The
    /// request task notices the cancellation and releases its connection.
    pub fn cancel(&self) -> bool {
        let cancelled = transition(&self.status, RequestStatus::Cancelled);
        self.cancel.cancel();
        cancelled
    }

    /// Wait for the request to reach a terminal state.
    pub async fn outcome(mut self) -> RequestOutcome {
        match self.outcome_rx.take() {
            Some(rx) => rx.await.unwrap_or(RequestOutcome::Cancelled),
            None => RequestOutcome::Failed(ClientError::OutcomeTaken),
        }
    }

    /// Wait for the response. Transport failures and cancellation surface
    /// as errors.
    pub async fn wait(self) -> Result<Response, ClientError> {
        self.outcome().await.into_result()
    }

    /// Wait at most `limit` for the response.
    ///
    /// If the request is still pending when `limit` elapses this returns
    /// [`ClientError::Hung`] and leaves the request running; the caller can
    /// wait again or [`cancel`](Self::cancel) it.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Result<Response, ClientError> {
        let rx = self.outcome_rx.as_mut().ok_or(ClientError::OutcomeTaken)?;
        match tokio::time::timeout(limit, rx).await {
            Err(_) => Err(ClientError::Hung { waited: limit }),
            Ok(received) => {
                self.outcome_rx = None;
                received
                    .unwrap_or(RequestOutcome::Cancelled)
                    .into_result()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> (PendingResponse, StatusCell, oneshot::Sender<RequestOutcome>) {
        let cell = new_status_cell();
        let (tx, rx) = oneshot::channel();
        let handle = PendingResponse::new(
            "GET http://test/".to_string(),
            Arc::clone(&cell),
            rx,
            CancellationToken::new(),
        );
        (handle, cell, tx)
    }

    fn ok_response() -> Response {
        Response {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn first_terminal_transition_wins() {
        let cell = new_status_cell();
        assert!(transition(&cell, RequestStatus::Completed));
        assert!(!transition(&cell, RequestStatus::Cancelled));
        assert_eq!(*cell.borrow(), RequestStatus::Completed);
    }

    #[tokio::test]
    async fn wait_returns_completed_response() {
        let (handle, cell, tx) = pending();
        assert_eq!(handle.status(), RequestStatus::Pending);
        assert_eq!(handle.label(), "GET http://test/");

        transition(&cell, RequestStatus::Completed);
        tx.send(RequestOutcome::Completed(ok_response())).unwrap();

        assert!(handle.is_finished());
        assert_eq!(handle.wait().await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn wait_timeout_reports_hung_then_recovers() {
        let (mut handle, cell, tx) = pending();

        let err = handle
            .wait_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Hung { .. }));
        assert_eq!(handle.status(), RequestStatus::Pending);

        transition(&cell, RequestStatus::Completed);
        tx.send(RequestOutcome::Completed(ok_response())).unwrap();
        let response = handle.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.status, 200);

        let err = handle
            .wait_timeout(Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::OutcomeTaken));
    }

    #[tokio::test]
    async fn cancel_marks_pending_request() {
        let (handle, _cell, tx) = pending();
        assert!(handle.cancel());
        assert_eq!(handle.status(), RequestStatus::Cancelled);
        assert!(!handle.cancel());
        drop(tx);
        assert!(matches!(handle.wait().await, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_after_completion_is_noop() {
        let (handle, cell, _tx) = pending();
        transition(&cell, RequestStatus::Failed);
        assert!(!handle.cancel());
        assert_eq!(handle.status(), RequestStatus::Failed);
    }

    #[tokio::test]
    async fn dropped_sender_resolves_as_cancelled() {
        let (handle, _cell, tx) = pending();
        drop(tx);
        assert!(matches!(handle.outcome().await, RequestOutcome::Cancelled));
    }

    #[test]
    fn outcome_status_mapping() {
        assert_eq!(
            RequestOutcome::Completed(ok_response()).status(),
            RequestStatus::Completed
        );
        assert_eq!(
            RequestOutcome::Failed(ClientError::Closed).status(),
            RequestStatus::Failed
        );
        assert_eq!(RequestOutcome::Cancelled.status(), RequestStatus::Cancelled);
    }
}
