//! Burst admission, queue bounds, and completion-driven dispatch against the
//! synchronous core.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tower_upstream_limit::{
    Action, GroupConfig, Outcome, RequestId, ServerConfig, UpstreamError, UpstreamGroup,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn two_backend_group() -> UpstreamGroup {
    UpstreamGroup::new(
        GroupConfig::builder()
            .name("test")
            .max_connections(2)
            .max_queue_length(3)
            .queue_timeout(Duration::from_millis(1000))
            .server(ServerConfig::new(addr(9001)))
            .server(ServerConfig::new(addr(9002)))
            .build(),
    )
}

/// Drains the outbox, asserting every action is a dispatch.
fn connects(group: &mut UpstreamGroup) -> Vec<(RequestId, SocketAddr)> {
    group
        .take_actions()
        .into_iter()
        .map(|action| match action {
            Action::Connect { request, backend } => (request, backend),
            other => panic!("unexpected action {other:?}"),
        })
        .collect()
}

#[test]
fn burst_fills_both_backends_and_queues_the_rest() {
    let mut group = two_backend_group();
    let now = Instant::now();

    for i in 0..6 {
        group.peer_init(RequestId(i), now).unwrap();
    }

    let dispatched = connects(&mut group);
    assert_eq!(dispatched.len(), 4);

    let mut per_backend: HashMap<SocketAddr, usize> = HashMap::new();
    for (_, backend) in &dispatched {
        *per_backend.entry(*backend).or_default() += 1;
    }
    assert_eq!(per_backend[&addr(9001)], 2);
    assert_eq!(per_backend[&addr(9002)], 2);

    let metrics = group.metrics();
    assert_eq!(metrics.queue_length, 2);
    assert_eq!(metrics.active, 4);
    for backend in &metrics.backends {
        assert_eq!(backend.in_flight, 2);
    }
}

#[test]
fn arrivals_beyond_queue_capacity_are_refused() {
    let mut group = two_backend_group();
    let now = Instant::now();

    for i in 0..6 {
        group.peer_init(RequestId(i), now).unwrap();
    }
    group.take_actions();

    // Third queued request fills the queue; the next one bounces.
    group.peer_init(RequestId(6), now).unwrap();
    assert_eq!(group.metrics().queue_length, 3);

    let err = group.peer_init(RequestId(7), now).unwrap_err();
    assert_eq!(err, UpstreamError::QueueFull { max_queue_length: 3 });

    let metrics = group.metrics();
    assert_eq!(metrics.queue_length, 3);
    assert_eq!(metrics.active, 4);
    for backend in &metrics.backends {
        assert_eq!(backend.in_flight, 2);
    }
    assert!(group.take_actions().is_empty());
}

#[test]
fn completion_dispatches_the_oldest_waiter_to_the_freed_backend() {
    let mut group = two_backend_group();
    let now = Instant::now();

    for i in 0..6 {
        group.peer_init(RequestId(i), now).unwrap();
    }
    let dispatched = connects(&mut group);
    let (finished, freed_backend) = dispatched[0];

    group.peer_free(finished, Outcome::Success, now + Duration::from_millis(10));

    // The freed backend is now the least loaded, so the queue head lands on it.
    let next = connects(&mut group);
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].0, RequestId(4));
    assert_eq!(next[0].1, freed_backend);

    let metrics = group.metrics();
    assert_eq!(metrics.queue_length, 1);
    assert_eq!(metrics.active, 4);
}

#[test]
fn queue_drains_in_arrival_order() {
    let mut group = two_backend_group();
    let start = Instant::now();

    for i in 0..6 {
        group
            .peer_init(RequestId(i), start + Duration::from_millis(i))
            .unwrap();
    }
    let dispatched = connects(&mut group);

    // Free everything; the two queued waiters must come out oldest first.
    for (request, _) in dispatched {
        group.peer_free(request, Outcome::Success, start + Duration::from_millis(50));
    }
    let drained = connects(&mut group);
    assert_eq!(
        drained.iter().map(|(request, _)| *request).collect::<Vec<_>>(),
        vec![RequestId(4), RequestId(5)]
    );
}
