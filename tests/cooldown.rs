//! Client-close cool-down: deferred slot release, batching, and the
//! interaction with dispatch.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tower_upstream_limit::{
    Action, GroupConfig, Outcome, RequestId, ServerConfig, UpstreamGroup, CLIENT_CLOSE_COOLDOWN,
};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn group(max_connections: usize) -> UpstreamGroup {
    UpstreamGroup::new(
        GroupConfig::builder()
            .name("test")
            .max_connections(max_connections)
            .queue_timeout(Duration::from_millis(1000))
            .server(ServerConfig::new(addr(9001)))
            .build(),
    )
}

#[test]
fn close_keeps_the_slot_until_the_cooldown_fires() {
    let mut g = group(2);
    let start = Instant::now();

    g.peer_init(RequestId(1), start).unwrap();
    g.take_actions();

    let closed_at = start + Duration::from_millis(10);
    g.peer_free(RequestId(1), Outcome::ClientClosed, closed_at);

    let metrics = g.metrics();
    assert_eq!(metrics.backends[0].in_flight, 1);
    assert_eq!(metrics.backends[0].pending_releases, 1);
    assert_eq!(g.next_timeout(), Some(closed_at + CLIENT_CLOSE_COOLDOWN));

    g.on_timeout(closed_at + CLIENT_CLOSE_COOLDOWN);
    let metrics = g.metrics();
    assert_eq!(metrics.backends[0].in_flight, 0);
    assert_eq!(metrics.backends[0].pending_releases, 0);
    assert_eq!(g.next_timeout(), None);
}

#[test]
fn closes_during_the_window_batch_into_one_release() {
    let mut g = group(2);
    let start = Instant::now();

    g.peer_init(RequestId(1), start).unwrap();
    g.peer_init(RequestId(2), start).unwrap();
    g.take_actions();

    let first_close = start + Duration::from_millis(10);
    g.peer_free(RequestId(1), Outcome::ClientClosed, first_close);
    g.peer_free(
        RequestId(2),
        Outcome::ClientClosed,
        start + Duration::from_millis(200),
    );

    // One timer for the backend, armed by the first close.
    let metrics = g.metrics();
    assert_eq!(metrics.backends[0].in_flight, 2);
    assert_eq!(metrics.backends[0].pending_releases, 2);
    assert_eq!(g.next_timeout(), Some(first_close + CLIENT_CLOSE_COOLDOWN));

    g.on_timeout(first_close + CLIENT_CLOSE_COOLDOWN);
    let metrics = g.metrics();
    assert_eq!(metrics.backends[0].in_flight, 0);
    assert_eq!(metrics.backends[0].pending_releases, 0);
}

#[test]
fn queued_work_waits_out_the_cooldown() {
    let mut g = group(1);
    let start = Instant::now();

    g.peer_init(RequestId(1), start).unwrap();
    g.take_actions();
    g.peer_init(RequestId(2), start + Duration::from_millis(5)).unwrap();

    let closed_at = start + Duration::from_millis(10);
    g.peer_free(RequestId(1), Outcome::ClientClosed, closed_at);

    // The slot is still charged, so the queued request cannot move yet.
    assert!(g.take_actions().is_empty());
    assert_eq!(g.metrics().queue_length, 1);

    g.on_timeout(closed_at + CLIENT_CLOSE_COOLDOWN);
    assert_eq!(
        g.next_action(),
        Some(Action::Connect {
            request: RequestId(2),
            backend: addr(9001),
        })
    );
    assert_eq!(g.metrics().queue_length, 0);
    assert_eq!(g.metrics().backends[0].in_flight, 1);
}
