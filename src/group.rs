//! The per-group admission state machine.
//!
//! One [`UpstreamGroup`] exists per configured upstream group. It owns the
//! backend registry, the wait queue, and the two timer deadlines (queue head
//! expiry, per-backend client-close cool-down). Every handler runs to
//! completion on the calling thread and never blocks; callers that share a
//! group across tasks must serialize access through a single owner (see
//! [`GroupHandle`](crate::handle::GroupHandle)).
//!
//! Instead of calling back into the proxy directly, handlers append
//! [`Action`]s to an outbox the driver drains: `Connect` asks the proxy to
//! open the upstream connection for a dispatched request, `Finalize` ends a
//! request that never reached a backend.

use crate::backend::Registry;
use crate::config::GroupConfig;
use crate::error::UpstreamError;
use crate::events::UpstreamEvent;
use crate::queue::{RequestId, WaitQueue, WaiterState};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Delay between a client close and the release of the backend slot it held.
///
/// A closed client connection can leave the backend with a half-closed
/// upstream socket; the slot is held back briefly so the next request does
/// not land on it. Closes during the window batch into the same release.
pub const CLIENT_CLOSE_COOLDOWN: Duration = Duration::from_millis(500);

/// How a request finished, reported through [`UpstreamGroup::peer_free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backend served the request.
    Success,
    /// The connect or exchange with the assigned backend failed.
    BackendFailed,
    /// The client went away while the request was queued or in flight.
    ClientClosed,
}

/// Why a request was finished without reaching a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// The request outlived the queue timeout.
    QueueExpired {
        /// How long it waited.
        waited: Duration,
    },
    /// No eligible backend remains to serve it.
    AllBackendsDown,
}

impl From<FinalizeReason> for UpstreamError {
    fn from(reason: FinalizeReason) -> Self {
        match reason {
            FinalizeReason::QueueExpired { waited } => UpstreamError::QueueExpired { waited },
            FinalizeReason::AllBackendsDown => UpstreamError::AllBackendsDown,
        }
    }
}

/// Work the core asks its driver to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the upstream connection for this request now.
    Connect {
        /// The dispatched request.
        request: RequestId,
        /// Address of the backend charged for it.
        backend: SocketAddr,
    },
    /// Finish the request without a backend.
    Finalize {
        /// The request being finished.
        request: RequestId,
        /// Why it never reached a backend.
        reason: FinalizeReason,
    },
}

/// Point-in-time view of one backend's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMetrics {
    /// Resolved address.
    pub addr: SocketAddr,
    /// Printable name used in logs and events.
    pub name: String,
    /// Slots currently occupied.
    pub in_flight: usize,
    /// Slots awaiting the client-close cool-down.
    pub pending_releases: usize,
    /// Consecutive failure count.
    pub fails: u32,
}

/// Point-in-time view of a group.
#[derive(Debug, Clone)]
pub struct GroupMetrics {
    /// Requests waiting in the queue.
    pub queue_length: usize,
    /// Requests currently holding a backend slot.
    pub active: usize,
    /// Per-backend counters.
    pub backends: Vec<BackendMetrics>,
}

/// Admission, queueing, and dispatch state for one upstream group.
///
/// The group tracks every request from [`peer_init`](Self::peer_init) until a
/// terminal state: dispatched and completed, expired in the queue, or torn
/// down after a client close. Slot accounting survives every intermediate
/// failure mode; the invariants are re-checked after each handler in debug
/// builds.
pub struct UpstreamGroup {
    config: GroupConfig,
    registry: Registry,
    queue: WaitQueue,
    actions: VecDeque<Action>,
}

impl UpstreamGroup {
    /// Builds a group from its configuration.
    pub fn new(config: GroupConfig) -> Self {
        let registry = Registry::new(&config);
        let queue = WaitQueue::new(config.max_queue_length, config.queue_timeout);
        Self {
            config,
            registry,
            queue,
            actions: VecDeque::new(),
        }
    }

    /// Name of the group, as configured.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Admits a request into the wait queue and drives dispatch.
    ///
    /// On success the request is tracked until a terminal state; the caller
    /// must eventually observe a `Connect` or `Finalize` action for it, or
    /// report a client close through [`peer_free`](Self::peer_free). A
    /// `QueueFull` refusal leaves the group untouched and the request
    /// untracked.
    pub fn peer_init(&mut self, request: RequestId, now: Instant) -> Result<(), UpstreamError> {
        if let Err(err) = self.queue.push_back(request, now) {
            #[cfg(feature = "tracing")]
            tracing::debug!(group = %self.config.name, %request, "queue full, refusing request");
            #[cfg(feature = "metrics")]
            counter!("upstream_requests_rejected_total", "group" => self.config.name.clone())
                .increment(1);
            self.config.event_listeners.emit(&UpstreamEvent::Rejected {
                group: self.config.name.clone(),
                max_queue_length: self.config.max_queue_length,
            });
            return Err(err);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            group = %self.config.name,
            %request,
            queue_length = self.queue.len(),
            "queueing request"
        );
        #[cfg(feature = "metrics")]
        {
            counter!("upstream_requests_queued_total", "group" => self.config.name.clone())
                .increment(1);
            gauge!("upstream_queue_length", "group" => self.config.name.clone())
                .set(self.queue.len() as f64);
        }
        self.config.event_listeners.emit(&UpstreamEvent::Queued {
            group: self.config.name.clone(),
            queue_length: self.queue.len(),
        });

        self.dispatch(now);
        self.check_invariants();
        Ok(())
    }

    /// Selects and charges a backend for the request dispatch just popped.
    ///
    /// The request must be out of the queue and unassigned; the chosen
    /// address is handed to the driver in the `Connect` action. Fails with
    /// `AllBackendsDown` when no backend is eligible, which on the non-forced
    /// path cannot happen (dispatch verified capacity in the same handler) and
    /// on the forced path means every backend died since the failure was
    /// recorded.
    fn peer_get(&mut self, request: RequestId, now: Instant) -> Result<SocketAddr, UpstreamError> {
        let force = match self.queue.get(request) {
            Some(waiter) => {
                debug_assert_eq!(waiter.state, WaiterState::Detached);
                waiter.force_assign
            }
            None => {
                debug_assert!(false, "peer_get for unknown request");
                return Err(UpstreamError::AllBackendsDown);
            }
        };

        let Some(id) = self.registry.select(force, now) else {
            return Err(UpstreamError::AllBackendsDown);
        };

        let backend = self.registry.get_mut(id);
        backend.in_flight += 1;
        let addr = backend.addr;
        let name = backend.name.clone();
        let in_flight = backend.in_flight;
        if let Some(waiter) = self.queue.get_mut(request) {
            waiter.state = WaiterState::Assigned { backend: id };
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            group = %self.config.name,
            %request,
            backend = %name,
            in_flight,
            "sending request to backend"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(
                "upstream_requests_dispatched_total",
                "group" => self.config.name.clone(),
                "backend" => name.clone()
            )
            .increment(1);
            gauge!(
                "upstream_in_flight",
                "group" => self.config.name.clone(),
                "backend" => name.clone()
            )
            .set(in_flight as f64);
        }
        self.config.event_listeners.emit(&UpstreamEvent::Dispatched {
            group: self.config.name.clone(),
            backend: name,
            in_flight,
        });

        Ok(addr)
    }

    /// Reports the outcome of a tracked request and re-drives dispatch.
    ///
    /// Must be called exactly once per admitted request that was not finished
    /// by a `Finalize` action. A call for an unknown request is a no-op, so a
    /// teardown racing an expiry is harmless.
    pub fn peer_free(&mut self, request: RequestId, outcome: Outcome, now: Instant) {
        let Some(waiter) = self.queue.get(request) else {
            return;
        };
        let state = waiter.state;

        match outcome {
            Outcome::Success => {
                if let WaiterState::Assigned { backend } = state {
                    let b = self.registry.get_mut(backend);
                    debug_assert!(b.in_flight > 0);
                    b.in_flight -= 1;
                    let name = b.name.clone();
                    #[cfg(feature = "metrics")]
                    gauge!(
                        "upstream_in_flight",
                        "group" => self.config.name.clone(),
                        "backend" => name.clone()
                    )
                    .set(self.registry.get(backend).in_flight as f64);
                    self.config.event_listeners.emit(&UpstreamEvent::Completed {
                        group: self.config.name.clone(),
                        backend: name,
                    });
                }
                self.queue.discard(request);
                self.dispatch(now);
            }
            Outcome::ClientClosed => {
                match state {
                    WaiterState::Queued { .. } | WaiterState::Detached => {
                        self.queue.discard(request);
                    }
                    WaiterState::Assigned { backend } => {
                        // The slot is not released yet: the backend may still
                        // be tearing down the half-closed upstream socket.
                        self.queue.discard(request);
                        let b = self.registry.get_mut(backend);
                        b.pending_releases += 1;
                        debug_assert!(b.pending_releases <= b.in_flight);
                        if b.cooldown_at.is_none() {
                            b.cooldown_at = Some(now + CLIENT_CLOSE_COOLDOWN);
                        }
                        #[cfg(feature = "tracing")]
                        tracing::debug!(
                            group = %self.config.name,
                            %request,
                            backend = %self.registry.get(backend).name,
                            "client closed, deferring slot release"
                        );
                    }
                }
                self.dispatch(now);
            }
            Outcome::BackendFailed => {
                match state {
                    WaiterState::Assigned { backend } => {
                        let b = self.registry.get_mut(backend);
                        b.record_failure(now);
                        debug_assert!(b.in_flight > 0);
                        b.in_flight -= 1;
                        let name = b.name.clone();
                        let fails = b.fails;
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            group = %self.config.name,
                            %request,
                            backend = %name,
                            fails,
                            "backend failed"
                        );
                        #[cfg(feature = "metrics")]
                        counter!(
                            "upstream_backend_failures_total",
                            "group" => self.config.name.clone(),
                            "backend" => name.clone()
                        )
                        .increment(1);
                        self.config
                            .event_listeners
                            .emit(&UpstreamEvent::BackendFailed {
                                group: self.config.name.clone(),
                                backend: name,
                                fails,
                            });

                        if self.registry.all_dead(now) {
                            self.finalize(request, FinalizeReason::AllBackendsDown);
                        } else {
                            // Retry on another backend, keeping the request's
                            // seniority. The force flag lets the retry land
                            // even when every live backend is at capacity.
                            if let Some(waiter) = self.queue.get_mut(request) {
                                waiter.force_assign = true;
                                waiter.state = WaiterState::Detached;
                            }
                            self.queue.push_front(request);
                        }
                        self.dispatch(now);
                    }
                    WaiterState::Queued { .. } | WaiterState::Detached => {
                        // Failure before any backend was charged; nothing to
                        // retry.
                        self.queue.discard(request);
                        self.dispatch(now);
                    }
                }
            }
        }
        self.check_invariants();
    }

    /// Fires every due timer: expires overdue waiters and reclaims
    /// cooled-down slots, then re-drives dispatch.
    pub fn on_timeout(&mut self, now: Instant) {
        for request in self.queue.expire_overdue(now) {
            let waited = self
                .queue
                .get(request)
                .map(|waiter| now.duration_since(waiter.enqueued_at))
                .unwrap_or_default();
            #[cfg(feature = "metrics")]
            counter!("upstream_requests_expired_total", "group" => self.config.name.clone())
                .increment(1);
            self.config.event_listeners.emit(&UpstreamEvent::Expired {
                group: self.config.name.clone(),
                waited,
            });
            self.finalize(request, FinalizeReason::QueueExpired { waited });
        }

        for (id, released) in self.registry.reclaim_cooled(now) {
            if released == 0 {
                continue;
            }
            let backend = self.registry.get(id);
            #[cfg(feature = "tracing")]
            tracing::debug!(
                group = %self.config.name,
                backend = %backend.name,
                released,
                "reclaimed slots after client-close cool-down"
            );
            #[cfg(feature = "metrics")]
            gauge!(
                "upstream_in_flight",
                "group" => self.config.name.clone(),
                "backend" => backend.name.clone()
            )
            .set(backend.in_flight as f64);
            self.config
                .event_listeners
                .emit(&UpstreamEvent::SlotsReclaimed {
                    group: self.config.name.clone(),
                    backend: backend.name.clone(),
                    released,
                });
        }

        self.dispatch(now);
        self.check_invariants();
    }

    /// Earliest instant at which [`on_timeout`](Self::on_timeout) has work to
    /// do: the queue head's deadline or a pending cool-down, whichever comes
    /// first.
    pub fn next_timeout(&self) -> Option<Instant> {
        [self.queue.deadline(), self.registry.next_cooldown()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Removes and returns the next pending action, oldest first.
    pub fn next_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Drains all pending actions.
    pub fn take_actions(&mut self) -> VecDeque<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Snapshot of queue depth and per-backend counters.
    pub fn metrics(&self) -> GroupMetrics {
        GroupMetrics {
            queue_length: self.queue.len(),
            active: self.queue.assigned_count(),
            backends: self
                .registry
                .backends()
                .iter()
                .map(|b| BackendMetrics {
                    addr: b.addr,
                    name: b.name.clone(),
                    in_flight: b.in_flight,
                    pending_releases: b.pending_releases,
                    fails: b.fails,
                })
                .collect(),
        }
    }

    /// Drains the queue while capacity exists.
    ///
    /// Iterative on purpose: a completion that frees many slots at once must
    /// not recurse per dispatched waiter. The head is popped when a slot is
    /// free, or unconditionally when it carries the force flag; a forced
    /// waiter that finds no backend at all is finished as `AllBackendsDown`.
    fn dispatch(&mut self, now: Instant) {
        loop {
            let Some((request, waiter)) = self.queue.peek_oldest() else {
                break;
            };
            let force = waiter.force_assign;
            if !force && self.registry.all_occupied(now) {
                break;
            }
            let Some(popped) = self.queue.pop_oldest() else {
                break;
            };
            debug_assert_eq!(popped, request);
            match self.peer_get(request, now) {
                Ok(backend) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(group = %self.config.name, %request, "dispatch");
                    self.actions.push_back(Action::Connect { request, backend });
                }
                Err(_) => self.finalize(request, FinalizeReason::AllBackendsDown),
            }
        }
        #[cfg(feature = "metrics")]
        gauge!("upstream_queue_length", "group" => self.config.name.clone())
            .set(self.queue.len() as f64);
    }

    /// Ends a request that never reached a backend and drops its waiter.
    fn finalize(&mut self, request: RequestId, reason: FinalizeReason) {
        #[cfg(feature = "tracing")]
        tracing::debug!(group = %self.config.name, %request, ?reason, "finalizing request");
        self.queue.discard(request);
        self.actions.push_back(Action::Finalize { request, reason });
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        self.queue.check_links();
        let assigned = self.queue.assigned_count();
        let mut in_flight = 0;
        let mut pending = 0;
        for backend in self.registry.backends() {
            assert!(
                backend.pending_releases <= backend.in_flight,
                "pending releases exceed in-flight on {}",
                backend.name
            );
            assert_eq!(
                backend.cooldown_at.is_some(),
                backend.pending_releases > 0,
                "cool-down armed state out of sync on {}",
                backend.name
            );
            in_flight += backend.in_flight;
            pending += backend.pending_releases;
        }
        assert_eq!(
            in_flight,
            assigned + pending,
            "slot accounting leak: in_flight != assigned + pending releases"
        );
        assert_eq!(
            self.queue.deadline().is_some(),
            !self.queue.is_empty(),
            "queue deadline armed state out of sync"
        );
        assert_eq!(
            self.queue.waiter_count(),
            self.queue.len() + assigned,
            "waiter neither queued nor assigned between handlers"
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}
