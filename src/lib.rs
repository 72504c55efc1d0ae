//! Upstream admission control and least-loaded dispatch for Tower services.
//!
//! Backends that only handle a small, bounded number of concurrent requests
//! well (a single-threaded application server behind a mutex, a connection
//! pool of one) fall over when a proxy hands them everything at once. This
//! crate puts a per-group admission queue in front of such backends: no
//! backend ever carries more than `max_connections` in-flight requests,
//! excess requests wait in a bounded FIFO with a per-request deadline, and
//! queued requests are dispatched to the least-loaded live backend as
//! capacity frees up.
//!
//! Failures are part of the model. A failed backend exchange is charged
//! against the backend (`max_fails` within `fail_timeout` takes it out of
//! rotation) and the request retries on another backend without losing its
//! queue seniority; a client that disconnects mid-flight releases its slot
//! only after a short cool-down, so the next request does not land on a
//! half-closed upstream socket.
//!
//! # Tower usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tower::ServiceBuilder;
//! use tower_upstream_limit::{
//!     GroupConfig, GroupHandle, Routed, ServerConfig, UpstreamError, UpstreamLimitLayer,
//! };
//!
//! # async fn example() {
//! let config = GroupConfig::builder()
//!     .name("app")
//!     .max_connections(2)
//!     .queue_timeout(Duration::from_secs(10))
//!     .max_queue_length(1000)
//!     .server(ServerConfig::new("10.0.0.1:9000".parse().unwrap()))
//!     .server(ServerConfig::new("10.0.0.2:9000".parse().unwrap()).max_fails(3))
//!     .build();
//!
//! let handle = GroupHandle::spawn(config);
//! let service = ServiceBuilder::new()
//!     .layer(UpstreamLimitLayer::new(handle))
//!     .service_fn(|routed: Routed<Vec<u8>>| async move {
//!         // open the upstream connection to `routed.backend` and proxy bytes
//!         Ok::<_, UpstreamError>(routed.request)
//!     });
//! # }
//! ```
//!
//! # Driving the core directly
//!
//! The admission core itself is a plain synchronous state machine; a proxy
//! engine with its own event loop can drive it through the peer protocol and
//! an action outbox:
//!
//! ```
//! use std::time::Instant;
//! use tower_upstream_limit::{
//!     Action, GroupConfig, Outcome, RequestId, ServerConfig, UpstreamGroup,
//! };
//!
//! let config = GroupConfig::builder()
//!     .max_connections(1)
//!     .server(ServerConfig::new("127.0.0.1:9000".parse().unwrap()))
//!     .build();
//! let mut group = UpstreamGroup::new(config);
//!
//! let now = Instant::now();
//! group.peer_init(RequestId(1), now).unwrap();
//! match group.next_action() {
//!     Some(Action::Connect { request, backend }) => {
//!         // connect `request` to `backend`; once the exchange finishes:
//!         group.peer_free(request, Outcome::Success, now);
//!     }
//!     _ => unreachable!("a free backend dispatches immediately"),
//! }
//! ```
//!
//! The driver owns timers: sleep until [`UpstreamGroup::next_timeout`] and
//! call [`UpstreamGroup::on_timeout`], which expires overdue waiters and
//! reclaims slots parked by client closes.
//!
//! # Observability
//!
//! Register [`UpstreamEvent`] listeners on the config builder for admission
//! decisions, dispatches, expiries, and backend failures. The optional
//! `tracing` feature logs the same transitions; the optional `metrics`
//! feature exports queue depth, in-flight gauges, and outcome counters.

pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod handle;
pub mod layer;
pub mod queue;
pub mod service;

mod backend;

pub use config::{GroupConfig, GroupConfigBuilder, ServerConfig};
pub use error::{Result, UpstreamError};
pub use events::{EventListener, EventListeners, UpstreamEvent};
pub use group::{
    Action, BackendMetrics, FinalizeReason, GroupMetrics, Outcome, UpstreamGroup,
    CLIENT_CLOSE_COOLDOWN,
};
pub use handle::GroupHandle;
pub use layer::UpstreamLimitLayer;
pub use queue::RequestId;
pub use service::{Routed, UpstreamLimit};
