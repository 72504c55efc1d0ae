//! Backend registry and least-loaded selection.

use crate::config::GroupConfig;
use rand::Rng;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Index of a backend within its group's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BackendId(pub(crate) usize);

/// One resolved upstream endpoint and its live slot accounting.
#[derive(Debug, Clone)]
pub(crate) struct Backend {
    pub(crate) addr: SocketAddr,
    pub(crate) name: String,
    max_fails: u32,
    fail_timeout: Duration,
    down: bool,
    pub(crate) in_flight: usize,
    pub(crate) fails: u32,
    last_fail_at: Option<Instant>,
    pub(crate) pending_releases: usize,
    pub(crate) cooldown_at: Option<Instant>,
}

impl Backend {
    fn new(addr: SocketAddr, max_fails: u32, fail_timeout: Duration, down: bool) -> Self {
        Self {
            addr,
            name: addr.to_string(),
            max_fails,
            fail_timeout,
            down,
            in_flight: 0,
            fails: 0,
            last_fail_at: None,
            pending_releases: 0,
            cooldown_at: None,
        }
    }

    /// Clears the failure count once the fail timeout has elapsed.
    fn refresh(&mut self, now: Instant) {
        if let Some(at) = self.last_fail_at {
            if now.duration_since(at) > self.fail_timeout {
                self.fails = 0;
            }
        }
    }

    fn eligible(&self) -> bool {
        !self.down && self.fails < self.max_fails
    }

    pub(crate) fn record_failure(&mut self, now: Instant) {
        self.last_fail_at = Some(now);
        self.fails += 1;
    }
}

/// Fixed set of backends for one group, built once at configuration load.
pub(crate) struct Registry {
    backends: Vec<Backend>,
    max_connections: usize,
}

impl Registry {
    pub(crate) fn new(config: &GroupConfig) -> Self {
        let mut backends = Vec::new();
        for server in &config.servers {
            for addr in &server.addrs {
                backends.push(Backend::new(
                    *addr,
                    server.max_fails,
                    server.fail_timeout,
                    server.down,
                ));
            }
        }
        Self {
            backends,
            max_connections: config.max_connections,
        }
    }

    pub(crate) fn get(&self, id: BackendId) -> &Backend {
        &self.backends[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: BackendId) -> &mut Backend {
        &mut self.backends[id.0]
    }

    pub(crate) fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Least-loaded eligible backend, or `None` when nothing can take the
    /// request.
    ///
    /// The scan starts at a uniformly random index and wraps once, so ties on
    /// in-flight count rotate evenly across the group instead of pinning the
    /// first backend. Fail counts past their timeout are reset during the
    /// scan. Without `force`, a minimum already at `max_connections` means
    /// admission is denied; with `force`, the minimum is returned regardless
    /// of capacity.
    pub(crate) fn select(&mut self, force: bool, now: Instant) -> Option<BackendId> {
        let n = self.backends.len();
        if n == 0 {
            return None;
        }
        let start = rand::rng().random_range(0..n);
        let mut min: Option<(usize, usize)> = None;
        for k in 0..n {
            let index = (start + k) % n;
            let backend = &mut self.backends[index];
            backend.refresh(now);
            if !backend.eligible() {
                continue;
            }
            if min.map_or(true, |(_, load)| backend.in_flight < load) {
                min = Some((index, backend.in_flight));
            }
        }
        let (index, load) = min?;
        if !force && load >= self.max_connections {
            return None;
        }
        Some(BackendId(index))
    }

    /// True when no eligible backend has a free slot.
    pub(crate) fn all_occupied(&mut self, now: Instant) -> bool {
        self.select(false, now).is_none()
    }

    /// True when no backend is eligible at all.
    pub(crate) fn all_dead(&mut self, now: Instant) -> bool {
        self.select(true, now).is_none()
    }

    /// Returns slots whose client-close cool-down has elapsed, zeroing the
    /// pending counts. The caller re-drives dispatch.
    pub(crate) fn reclaim_cooled(&mut self, now: Instant) -> Vec<(BackendId, usize)> {
        let mut reclaimed = Vec::new();
        for (index, backend) in self.backends.iter_mut().enumerate() {
            if let Some(at) = backend.cooldown_at {
                if at <= now {
                    let released = backend.pending_releases;
                    debug_assert!(released <= backend.in_flight);
                    backend.in_flight -= released;
                    backend.pending_releases = 0;
                    backend.cooldown_at = None;
                    reclaimed.push((BackendId(index), released));
                }
            }
        }
        reclaimed
    }

    /// Earliest pending cool-down deadline, if any.
    pub(crate) fn next_cooldown(&self) -> Option<Instant> {
        self.backends.iter().filter_map(|b| b.cooldown_at).min()
    }
}
