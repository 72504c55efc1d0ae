//! Randomized event sequences checked against the slot-accounting invariants.
//!
//! A model of the caller (which requests are queued, which hold slots) runs
//! alongside the group; after every event the group's snapshot must agree
//! with the model and with the accounting identities.

use proptest::prelude::*;
use std::time::{Duration, Instant};
use tower_upstream_limit::{
    Action, GroupConfig, Outcome, RequestId, ServerConfig, UpstreamError, UpstreamGroup,
};

const MAX_CONNECTIONS: usize = 2;
const MAX_QUEUE_LENGTH: usize = 5;
const QUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
enum Op {
    Arrive,
    FreeSuccess(prop::sample::Index),
    FreeFailed(prop::sample::Index),
    Close(prop::sample::Index),
    Advance(u64),
}

fn op_strategy(with_failures: bool) -> BoxedStrategy<Op> {
    let base = prop_oneof![
        4 => Just(Op::Arrive),
        3 => any::<prop::sample::Index>().prop_map(Op::FreeSuccess),
        2 => any::<prop::sample::Index>().prop_map(Op::Close),
        2 => (1u64..700).prop_map(Op::Advance),
    ];
    if with_failures {
        prop_oneof![
            9 => base,
            2 => any::<prop::sample::Index>().prop_map(Op::FreeFailed),
        ]
        .boxed()
    } else {
        base.boxed()
    }
}

struct Harness {
    group: UpstreamGroup,
    now: Instant,
    next_id: u64,
    queued: Vec<RequestId>,
    active: Vec<RequestId>,
}

impl Harness {
    fn new() -> Self {
        let group = UpstreamGroup::new(
            GroupConfig::builder()
                .name("prop")
                .max_connections(MAX_CONNECTIONS)
                .max_queue_length(MAX_QUEUE_LENGTH)
                .queue_timeout(QUEUE_TIMEOUT)
                .server(
                    ServerConfig::new("127.0.0.1:9001".parse().unwrap())
                        .max_fails(2)
                        .fail_timeout(Duration::from_secs(3)),
                )
                .server(
                    ServerConfig::new("127.0.0.1:9002".parse().unwrap())
                        .max_fails(2)
                        .fail_timeout(Duration::from_secs(3)),
                )
                .server(
                    ServerConfig::new("127.0.0.1:9003".parse().unwrap())
                        .max_fails(2)
                        .fail_timeout(Duration::from_secs(3)),
                )
                .build(),
        );
        Self {
            group,
            now: Instant::now(),
            next_id: 0,
            queued: Vec::new(),
            active: Vec::new(),
        }
    }

    fn apply(&mut self, op: &Op) {
        match op {
            Op::Arrive => {
                let id = RequestId(self.next_id);
                self.next_id += 1;
                match self.group.peer_init(id, self.now) {
                    Ok(()) => self.queued.push(id),
                    Err(err) => {
                        assert_eq!(
                            err,
                            UpstreamError::QueueFull {
                                max_queue_length: MAX_QUEUE_LENGTH
                            }
                        );
                        assert_eq!(self.group.metrics().queue_length, MAX_QUEUE_LENGTH);
                    }
                }
            }
            Op::FreeSuccess(index) => {
                if let Some(id) = pick(&self.active, index) {
                    self.active.retain(|r| *r != id);
                    self.group.peer_free(id, Outcome::Success, self.now);
                }
            }
            Op::FreeFailed(index) => {
                if let Some(id) = pick(&self.active, index) {
                    self.active.retain(|r| *r != id);
                    self.group.peer_free(id, Outcome::BackendFailed, self.now);
                }
            }
            Op::Close(index) => {
                let pool = self.queued.len() + self.active.len();
                if pool == 0 {
                    return;
                }
                let slot = index.index(pool);
                let id = if slot < self.queued.len() {
                    self.queued[slot]
                } else {
                    self.active[slot - self.queued.len()]
                };
                self.queued.retain(|r| *r != id);
                self.active.retain(|r| *r != id);
                self.group.peer_free(id, Outcome::ClientClosed, self.now);
            }
            Op::Advance(ms) => {
                self.now += Duration::from_millis(*ms);
                self.fire_due_timers();
            }
        }
        self.drain_actions();
        self.check();
    }

    fn fire_due_timers(&mut self) {
        while let Some(deadline) = self.group.next_timeout() {
            if deadline > self.now {
                break;
            }
            self.group.on_timeout(self.now);
            self.drain_actions();
        }
    }

    fn drain_actions(&mut self) {
        while let Some(action) = self.group.next_action() {
            match action {
                Action::Connect { request, .. } => {
                    self.queued.retain(|r| *r != request);
                    assert!(!self.active.contains(&request));
                    self.active.push(request);
                }
                Action::Finalize { request, .. } => {
                    self.queued.retain(|r| *r != request);
                    self.active.retain(|r| *r != request);
                }
            }
        }
    }

    fn check(&self) {
        let metrics = self.group.metrics();
        assert_eq!(metrics.queue_length, self.queued.len());
        assert_eq!(metrics.active, self.active.len());
        assert!(metrics.queue_length <= MAX_QUEUE_LENGTH);

        let mut in_flight = 0;
        let mut pending = 0;
        for backend in &metrics.backends {
            assert!(backend.pending_releases <= backend.in_flight);
            in_flight += backend.in_flight;
            pending += backend.pending_releases;
        }
        assert_eq!(in_flight, metrics.active + pending);
    }

    /// Drives the group until nothing is tracked, then checks every counter
    /// has returned to zero.
    fn wind_down(&mut self) {
        self.now += QUEUE_TIMEOUT + Duration::from_millis(1);
        self.fire_due_timers();
        self.drain_actions();
        for id in std::mem::take(&mut self.active) {
            self.group.peer_free(id, Outcome::Success, self.now);
            self.drain_actions();
        }
        // Anything dispatched by those completions, plus cool-downs and
        // freshly expired waiters.
        for _ in 0..4 {
            self.now += Duration::from_secs(2);
            self.fire_due_timers();
            self.drain_actions();
            for id in std::mem::take(&mut self.active) {
                self.group.peer_free(id, Outcome::Success, self.now);
                self.drain_actions();
            }
        }
        let metrics = self.group.metrics();
        assert_eq!(metrics.queue_length, 0);
        assert_eq!(metrics.active, 0);
        for backend in &metrics.backends {
            assert_eq!(backend.in_flight, 0);
            assert_eq!(backend.pending_releases, 0);
        }
    }
}

fn pick(pool: &[RequestId], index: &prop::sample::Index) -> Option<RequestId> {
    if pool.is_empty() {
        None
    } else {
        Some(pool[index.index(pool.len())])
    }
}

proptest! {
    #[test]
    fn slot_accounting_survives_any_interleaving(
        ops in prop::collection::vec(op_strategy(true), 1..150)
    ) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op);
        }
        harness.wind_down();
    }

    #[test]
    fn capacity_is_never_exceeded_without_failures(
        ops in prop::collection::vec(op_strategy(false), 1..150)
    ) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op);
            for backend in &harness.group.metrics().backends {
                prop_assert!(backend.in_flight <= MAX_CONNECTIONS);
            }
        }
    }
}
