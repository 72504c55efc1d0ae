//! Configuration for an upstream group.

use crate::events::{EventListeners, UpstreamEvent};
use std::net::SocketAddr;
use std::time::Duration;

/// One logical upstream server.
///
/// A hostname can resolve to several addresses; each address becomes its own
/// backend carrying this server's failure policy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) addrs: Vec<SocketAddr>,
    pub(crate) max_fails: u32,
    pub(crate) fail_timeout: Duration,
    pub(crate) down: bool,
}

impl ServerConfig {
    /// Creates a server with a single resolved address and default policy
    /// (`max_fails = 1`, `fail_timeout = 10s`, not down).
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addrs: vec![addr],
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            down: false,
        }
    }

    /// Creates a server from all addresses a hostname resolved to.
    pub fn with_addrs(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
            max_fails: 1,
            fail_timeout: Duration::from_secs(10),
            down: false,
        }
    }

    /// Number of consecutive failures after which the server is considered
    /// unavailable for the duration of the fail timeout.
    ///
    /// Default: 1
    pub fn max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    /// Window after the most recent failure during which the failure count is
    /// held against the server. Once it elapses the count resets to zero.
    ///
    /// Default: 10 seconds
    pub fn fail_timeout(mut self, fail_timeout: Duration) -> Self {
        self.fail_timeout = fail_timeout;
        self
    }

    /// Marks the server administratively down. It keeps its registry slot but
    /// is never selected.
    pub fn down(mut self) -> Self {
        self.down = true;
        self
    }
}

/// Immutable per-group parameters plus the server list.
#[derive(Clone)]
pub struct GroupConfig {
    pub(crate) name: String,
    pub(crate) max_connections: usize,
    pub(crate) queue_timeout: Duration,
    pub(crate) max_queue_length: usize,
    pub(crate) servers: Vec<ServerConfig>,
    pub(crate) event_listeners: EventListeners,
}

impl GroupConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> GroupConfigBuilder {
        GroupConfigBuilder::new()
    }
}

/// Builder for [`GroupConfig`].
pub struct GroupConfigBuilder {
    name: String,
    max_connections: usize,
    queue_timeout: Duration,
    max_queue_length: usize,
    servers: Vec<ServerConfig>,
    event_listeners: EventListeners,
}

impl GroupConfigBuilder {
    /// Creates a builder with default values.
    pub fn new() -> Self {
        Self {
            name: "upstream".to_string(),
            max_connections: 1,
            queue_timeout: Duration::from_secs(10),
            max_queue_length: 10_000,
            servers: Vec::new(),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the group name used in events, logs, and metric labels.
    ///
    /// Default: "upstream"
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the per-backend cap on concurrently assigned requests.
    ///
    /// Default: 1
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets how long a request may wait in the queue before it is failed.
    ///
    /// The deadline is absolute from arrival; a request re-queued after a
    /// backend failure keeps its original deadline.
    ///
    /// Default: 10 seconds
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Sets the hard cap on queue depth. Arrivals beyond it are refused
    /// immediately with [`UpstreamError::QueueFull`](crate::UpstreamError).
    ///
    /// Default: 10 000
    pub fn max_queue_length(mut self, max: usize) -> Self {
        self.max_queue_length = max;
        self
    }

    /// Appends one logical server to the group.
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    /// Registers a callback for every queue insert.
    ///
    /// # Callback Signature
    /// `Fn(usize)` - Called with the queue depth after the insert.
    pub fn on_queued<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &UpstreamEvent| {
            if let UpstreamEvent::Queued { queue_length, .. } = event {
                f(*queue_length);
            }
        });
        self
    }

    /// Registers a callback for arrivals refused because the queue is full.
    ///
    /// # Callback Signature
    /// `Fn(usize)` - Called with the configured queue depth limit.
    pub fn on_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &UpstreamEvent| {
            if let UpstreamEvent::Rejected {
                max_queue_length, ..
            } = event
            {
                f(*max_queue_length);
            }
        });
        self
    }

    /// Registers a callback for every dispatch to a backend.
    ///
    /// # Callback Signature
    /// `Fn(&str, usize)` - Called with the backend address and its in-flight
    /// count after the assignment.
    pub fn on_dispatched<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &UpstreamEvent| {
            if let UpstreamEvent::Dispatched {
                backend, in_flight, ..
            } = event
            {
                f(backend, *in_flight);
            }
        });
        self
    }

    /// Registers a callback for requests that timed out in the queue.
    ///
    /// # Callback Signature
    /// `Fn(Duration)` - Called with how long the request waited.
    pub fn on_expired<F>(mut self, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &UpstreamEvent| {
            if let UpstreamEvent::Expired { waited, .. } = event {
                f(*waited);
            }
        });
        self
    }

    /// Registers a callback for backend failures.
    ///
    /// # Callback Signature
    /// `Fn(&str, u32)` - Called with the backend address and its consecutive
    /// failure count.
    pub fn on_backend_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.event_listeners.add(move |event: &UpstreamEvent| {
            if let UpstreamEvent::BackendFailed { backend, fails, .. } = event {
                f(backend, *fails);
            }
        });
        self
    }

    /// Registers a listener receiving every [`UpstreamEvent`].
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&UpstreamEvent) + Send + Sync + 'static,
    {
        self.event_listeners.add(f);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> GroupConfig {
        GroupConfig {
            name: self.name,
            max_connections: self.max_connections,
            queue_timeout: self.queue_timeout,
            max_queue_length: self.max_queue_length,
            servers: self.servers,
            event_listeners: self.event_listeners,
        }
    }
}

impl Default for GroupConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = GroupConfig::builder().build();
        assert_eq!(config.name, "upstream");
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.queue_timeout, Duration::from_secs(10));
        assert_eq!(config.max_queue_length, 10_000);
        assert!(config.servers.is_empty());
        assert!(config.event_listeners.is_empty());
    }

    #[test]
    fn server_policy_defaults() {
        let server = ServerConfig::new("127.0.0.1:9000".parse().unwrap());
        assert_eq!(server.addrs.len(), 1);
        assert_eq!(server.max_fails, 1);
        assert_eq!(server.fail_timeout, Duration::from_secs(10));
        assert!(!server.down);
    }

    #[test]
    fn multi_address_server_expands() {
        let server = ServerConfig::with_addrs([
            "127.0.0.1:9000".parse().unwrap(),
            "127.0.0.2:9000".parse().unwrap(),
        ])
        .max_fails(3)
        .fail_timeout(Duration::from_secs(30));
        assert_eq!(server.addrs.len(), 2);
        assert_eq!(server.max_fails, 3);
    }
}
