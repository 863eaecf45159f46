//! Outstanding calls and the caller's view of one.

use crate::broker::{Broker, Command};
use crate::error::CallError;
use crate::value::Value;
use perspective_core::RequestId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

pub(crate) type ReplySender = oneshot::Sender<Result<Value, CallError>>;

pub(crate) struct PendingCall {
    method: String,
    reply: ReplySender,
}

impl PendingCall {
    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    /// Deliver the outcome. A caller that stopped waiting is not an error.
    pub(crate) fn resolve(self, outcome: Result<Value, CallError>) {
        let _ = self.reply.send(outcome);
    }
}

/// Calls sent on one connection that still await an answer.
#[derive(Default)]
pub(crate) struct CallTable {
    pending: HashMap<RequestId, PendingCall>,
}

impl CallTable {
    pub(crate) fn insert(&mut self, request_id: RequestId, method: String, reply: ReplySender) {
        self.pending.insert(request_id, PendingCall { method, reply });
    }

    pub(crate) fn take(&mut self, request_id: RequestId) -> Option<PendingCall> {
        self.pending.remove(&request_id)
    }

    /// Forget a call whose caller gave up. Returns whether it was pending.
    pub(crate) fn abandon(&mut self, request_id: RequestId) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Fail every outstanding call; returns how many there were.
    pub(crate) fn fail_all(&mut self, error: &CallError) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            call.resolve(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

enum State {
    Failed(CallError),
    Waiting {
        broker: Broker,
        request_id: RequestId,
        rx: oneshot::Receiver<Result<Value, CallError>>,
        deadline: Option<(Duration, Instant)>,
        sleep: Option<Pin<Box<Sleep>>>,
    },
    Done,
}

/// The pending result of a remote call.
///
/// The request is already on its way when a `Reply` is returned. Awaiting it
/// yields the answer; dropping it abandons the answer, though the remote
/// handler still runs.
#[must_use = "dropping a Reply discards the answer"]
pub struct Reply {
    state: State,
}

impl Reply {
    pub(crate) fn failed(error: CallError) -> Self {
        Self {
            state: State::Failed(error),
        }
    }

    pub(crate) fn waiting(
        broker: Broker,
        request_id: RequestId,
        rx: oneshot::Receiver<Result<Value, CallError>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: State::Waiting {
                broker,
                request_id,
                rx,
                deadline: timeout.map(|limit| (limit, Instant::now() + limit)),
                sleep: None,
            },
        }
    }

    /// Fail with [`CallError::Timeout`] if no answer arrives within `limit`
    /// of now. Replaces any configured default.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        if let State::Waiting {
            deadline, sleep, ..
        } = &mut self.state
        {
            *deadline = Some((limit, Instant::now() + limit));
            *sleep = None;
        }
        self
    }

    /// Request id on the wire, if the call was sent.
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.state {
            State::Waiting { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

impl Future for Reply {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match &mut self.state {
            State::Failed(_) => None,
            State::Waiting {
                broker,
                request_id,
                rx,
                deadline,
                sleep,
            } => {
                if let Poll::Ready(received) = Pin::new(rx).poll(cx) {
                    // Sender dropped without an answer: the connection task is gone.
                    Some(received.unwrap_or(Err(CallError::ConnectionLost)))
                } else if let Some((limit, at)) = *deadline {
                    let timer = sleep.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at)));
                    if timer.as_mut().poll(cx).is_ready() {
                        broker.post(Command::Abandon {
                            request_id: *request_id,
                        });
                        Some(Err(CallError::Timeout(limit)))
                    } else {
                        return Poll::Pending;
                    }
                } else {
                    return Poll::Pending;
                }
            }
            State::Done => return Poll::Pending,
        };

        match (std::mem::replace(&mut self.state, State::Done), outcome) {
            (_, Some(outcome)) => Poll::Ready(outcome),
            (State::Failed(error), None) => Poll::Ready(Err(error)),
            (_, None) => Poll::Pending,
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let State::Waiting {
            broker, request_id, ..
        } = &self.state
        {
            broker.post(Command::Abandon {
                request_id: *request_id,
            });
        }
    }
}
