//! Single-owner driver for an [`UpstreamGroup`].
//!
//! The group's handlers are not thread-safe and must run to completion one at
//! a time. [`GroupHandle::spawn`] moves the group onto a dedicated tokio task
//! that serializes every handler through a command channel and sleeps until
//! the group's next timer deadline, so the core keeps its run-to-completion
//! semantics without any locks.

use crate::config::GroupConfig;
use crate::error::UpstreamError;
use crate::group::{Action, GroupMetrics, Outcome, UpstreamGroup};
use crate::queue::RequestId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[cfg(feature = "metrics")]
use metrics::{describe_counter, describe_gauge};
#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static METRICS_INIT: Once = Once::new();

type Reply = oneshot::Sender<Result<SocketAddr, UpstreamError>>;

enum Command {
    Admit {
        request: RequestId,
        reply: Reply,
    },
    Free {
        request: RequestId,
        outcome: Outcome,
        reply: Option<Reply>,
    },
    Metrics {
        reply: oneshot::Sender<GroupMetrics>,
    },
}

/// Cloneable handle to a spawned upstream group task.
///
/// The task exits when every handle is dropped; in-flight calls then fail
/// with [`UpstreamError::GroupClosed`].
#[derive(Clone)]
pub struct GroupHandle {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl GroupHandle {
    /// Spawns the group task and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: GroupConfig) -> Self {
        #[cfg(feature = "metrics")]
        METRICS_INIT.call_once(|| {
            describe_counter!(
                "upstream_requests_queued_total",
                "Total number of requests admitted into the wait queue"
            );
            describe_counter!(
                "upstream_requests_rejected_total",
                "Total number of requests refused because the queue was full"
            );
            describe_counter!(
                "upstream_requests_dispatched_total",
                "Total number of requests handed to a backend"
            );
            describe_counter!(
                "upstream_requests_expired_total",
                "Total number of requests that timed out in the queue"
            );
            describe_counter!(
                "upstream_backend_failures_total",
                "Total number of failed backend exchanges"
            );
            describe_gauge!("upstream_queue_length", "Current wait queue depth");
            describe_gauge!(
                "upstream_in_flight",
                "Slots currently occupied on each backend"
            );
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(UpstreamGroup::new(config), rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Issues a fresh request handle, unique for the lifetime of this group.
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queues a request and resolves once a backend slot is assigned.
    ///
    /// Fails with `QueueFull` immediately, with `QueueExpired` when the queue
    /// timeout passes first, or with `AllBackendsDown` when the group cannot
    /// serve it. After an `Ok`, the caller owns a backend slot and must report
    /// an [`Outcome`] through [`release`](Self::release) or
    /// [`fail`](Self::fail).
    pub async fn admit(&self, request: RequestId) -> Result<SocketAddr, UpstreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Admit { request, reply })
            .map_err(|_| UpstreamError::GroupClosed)?;
        rx.await.map_err(|_| UpstreamError::GroupClosed)?
    }

    /// Reports the outcome of an admitted request. Fire-and-forget; used for
    /// `Success` and `ClientClosed`.
    pub fn release(&self, request: RequestId, outcome: Outcome) {
        let _ = self.tx.send(Command::Free {
            request,
            outcome,
            reply: None,
        });
    }

    /// Reports a backend failure and waits for a replacement assignment.
    ///
    /// Resolves with the next backend to try (the request keeps its queue
    /// seniority and may overshoot a backend's capacity), or fails with
    /// `AllBackendsDown` when no eligible backend remains.
    pub async fn fail(&self, request: RequestId) -> Result<SocketAddr, UpstreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Free {
                request,
                outcome: Outcome::BackendFailed,
                reply: Some(reply),
            })
            .map_err(|_| UpstreamError::GroupClosed)?;
        rx.await.map_err(|_| UpstreamError::GroupClosed)?
    }

    /// Snapshot of the group's queue depth and backend counters.
    pub async fn metrics(&self) -> Result<GroupMetrics, UpstreamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Metrics { reply })
            .map_err(|_| UpstreamError::GroupClosed)?;
        rx.await.map_err(|_| UpstreamError::GroupClosed)
    }
}

fn now_std() -> std::time::Instant {
    // Routed through the tokio clock so paused-time tests stay deterministic.
    tokio::time::Instant::now().into_std()
}

async fn wait_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn run(mut group: UpstreamGroup, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut pending: HashMap<RequestId, Reply> = HashMap::new();
    loop {
        let deadline = group.next_timeout();
        tokio::select! {
            command = rx.recv() => {
                let now = now_std();
                match command {
                    None => break,
                    Some(Command::Admit { request, reply }) => {
                        match group.peer_init(request, now) {
                            Ok(()) => {
                                pending.insert(request, reply);
                            }
                            Err(err) => {
                                let _ = reply.send(Err(err));
                            }
                        }
                    }
                    Some(Command::Free { request, outcome, reply }) => {
                        if let Some(reply) = reply {
                            pending.insert(request, reply);
                        } else if outcome == Outcome::ClientClosed {
                            pending.remove(&request);
                        }
                        group.peer_free(request, outcome, now);
                    }
                    Some(Command::Metrics { reply }) => {
                        let _ = reply.send(group.metrics());
                    }
                }
            }
            _ = wait_until(deadline), if deadline.is_some() => {
                group.on_timeout(now_std());
            }
        }

        // A delivery can re-enter the group (a dropped admit future gives its
        // slot back), so drain one action at a time.
        while let Some(action) = group.next_action() {
            match action {
                Action::Connect { request, backend } => {
                    let undelivered = match pending.remove(&request) {
                        Some(reply) => reply.send(Ok(backend)).is_err(),
                        None => true,
                    };
                    if undelivered {
                        group.peer_free(request, Outcome::ClientClosed, now_std());
                    }
                }
                Action::Finalize { request, reason } => {
                    if let Some(reply) = pending.remove(&request) {
                        let _ = reply.send(Err(reason.into()));
                    }
                }
            }
        }
    }
}
