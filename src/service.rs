//! Tower service wrapper around a [`GroupHandle`].

use crate::error::UpstreamError;
use crate::group::Outcome;
use crate::handle::GroupHandle;
use crate::queue::RequestId;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tower::Service;

/// A request paired with the backend chosen for it.
///
/// The inner service is expected to open the upstream connection to
/// `backend` and exchange the request over it.
#[derive(Debug, Clone)]
pub struct Routed<R> {
    /// Address of the backend charged for this attempt.
    pub backend: SocketAddr,
    /// The original request.
    pub request: R,
}

/// Service that holds each call behind the group's admission queue.
///
/// A call waits for a backend slot, runs the inner service against the chosen
/// backend, and releases the slot when the inner call resolves. An inner
/// error is reported as a backend failure: the group charges it against the
/// backend and re-dispatches the call, which retries on the replacement
/// backend (requests must be `Clone` for this). When no backend remains the
/// call fails with [`UpstreamError::AllBackendsDown`].
///
/// Dropping the response future mid-flight releases the slot as a client
/// close, with the group's usual cool-down before the slot is reusable.
#[derive(Clone)]
pub struct UpstreamLimit<S> {
    inner: S,
    handle: GroupHandle,
}

impl<S> UpstreamLimit<S> {
    pub(crate) fn new(inner: S, handle: GroupHandle) -> Self {
        Self { inner, handle }
    }
}

/// Reports a client close if the call future is dropped before it resolved.
struct FreeGuard {
    handle: GroupHandle,
    request: RequestId,
    armed: bool,
}

impl FreeGuard {
    fn new(handle: GroupHandle, request: RequestId) -> Self {
        Self {
            handle,
            request,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FreeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.release(self.request, Outcome::ClientClosed);
        }
    }
}

impl<S, R> Service<R> for UpstreamLimit<S>
where
    S: Service<Routed<R>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: From<UpstreamError> + Send + 'static,
    R: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: R) -> Self::Future {
        let handle = self.handle.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let id = handle.next_request_id();
            let mut guard = FreeGuard::new(handle.clone(), id);

            let mut backend = match handle.admit(id).await {
                Ok(backend) => backend,
                Err(err) => {
                    guard.disarm();
                    return Err(err.into());
                }
            };

            loop {
                let attempt = Routed {
                    backend,
                    request: request.clone(),
                };
                match inner.call(attempt).await {
                    Ok(response) => {
                        guard.disarm();
                        handle.release(id, Outcome::Success);
                        return Ok(response);
                    }
                    Err(_) => match handle.fail(id).await {
                        Ok(next) => backend = next,
                        Err(err) => {
                            guard.disarm();
                            return Err(err.into());
                        }
                    },
                }
            }
        })
    }
}
