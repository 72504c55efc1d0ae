//! Tower layer for applying an upstream group to a service stack.

use crate::config::GroupConfig;
use crate::handle::GroupHandle;
use crate::service::UpstreamLimit;
use tower::Layer;

/// Layer that routes calls through an upstream group's admission queue.
///
/// Every service built from one layer shares the same group, so the
/// per-backend caps hold across all of them.
#[derive(Clone)]
pub struct UpstreamLimitLayer {
    handle: GroupHandle,
}

impl UpstreamLimitLayer {
    /// Wraps an already-spawned group.
    pub fn new(handle: GroupHandle) -> Self {
        Self { handle }
    }

    /// Spawns a group from `config` and wraps it.
    ///
    /// Must be called from within a tokio runtime. Use
    /// [`handle`](Self::handle) to observe the group.
    pub fn spawn(config: GroupConfig) -> Self {
        Self::new(GroupHandle::spawn(config))
    }

    /// The handle of the underlying group.
    pub fn handle(&self) -> &GroupHandle {
        &self.handle
    }
}

impl<S> Layer<S> for UpstreamLimitLayer {
    type Service = UpstreamLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UpstreamLimit::new(inner, self.handle.clone())
    }
}
