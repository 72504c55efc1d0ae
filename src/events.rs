//! Event system for observing admission decisions.
//!
//! Listeners are registered on the [`GroupConfig`](crate::config::GroupConfig)
//! builder and invoked synchronously from the group's handlers. Keep them
//! cheap; they run on the group's single-writer task.

use std::sync::Arc;
use std::time::Duration;

/// Events emitted by an upstream group as requests move through the
/// queue/dispatch state machine.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    /// A request entered the wait queue.
    Queued {
        /// Group name.
        group: String,
        /// Queue depth after the insert.
        queue_length: usize,
    },
    /// A request was refused because the queue is at capacity.
    Rejected {
        /// Group name.
        group: String,
        /// Configured queue depth limit.
        max_queue_length: usize,
    },
    /// A request was paired with a backend and handed off to connect.
    Dispatched {
        /// Group name.
        group: String,
        /// Printable backend address.
        backend: String,
        /// Slots occupied on the backend after this assignment.
        in_flight: usize,
    },
    /// A queued request exceeded the queue timeout.
    Expired {
        /// Group name.
        group: String,
        /// How long the request waited.
        waited: Duration,
    },
    /// An assigned request finished and released its slot.
    Completed {
        /// Group name.
        group: String,
        /// Printable backend address.
        backend: String,
    },
    /// A connect or exchange with a backend failed.
    BackendFailed {
        /// Group name.
        group: String,
        /// Printable backend address.
        backend: String,
        /// Consecutive failure count after this failure.
        fails: u32,
    },
    /// Slots held back after client closes were returned to a backend.
    SlotsReclaimed {
        /// Group name.
        group: String,
        /// Printable backend address.
        backend: String,
        /// Number of slots released together.
        released: usize,
    },
}

impl UpstreamEvent {
    /// Short identifier for the event kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            UpstreamEvent::Queued { .. } => "queued",
            UpstreamEvent::Rejected { .. } => "rejected",
            UpstreamEvent::Dispatched { .. } => "dispatched",
            UpstreamEvent::Expired { .. } => "expired",
            UpstreamEvent::Completed { .. } => "completed",
            UpstreamEvent::BackendFailed { .. } => "backend_failed",
            UpstreamEvent::SlotsReclaimed { .. } => "slots_reclaimed",
        }
    }

    /// Name of the group that emitted this event.
    pub fn group(&self) -> &str {
        match self {
            UpstreamEvent::Queued { group, .. }
            | UpstreamEvent::Rejected { group, .. }
            | UpstreamEvent::Dispatched { group, .. }
            | UpstreamEvent::Expired { group, .. }
            | UpstreamEvent::Completed { group, .. }
            | UpstreamEvent::BackendFailed { group, .. }
            | UpstreamEvent::SlotsReclaimed { group, .. } => group,
        }
    }
}

/// Trait for observing upstream events.
pub trait EventListener: Send + Sync {
    /// Called for every event the group emits.
    fn on_event(&self, event: &UpstreamEvent);
}

impl<F> EventListener for F
where
    F: Fn(&UpstreamEvent) + Send + Sync,
{
    fn on_event(&self, event: &UpstreamEvent) {
        self(event)
    }
}

/// A collection of registered event listeners.
#[derive(Clone, Default)]
pub struct EventListeners {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventListeners {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to all registered listeners, in registration order.
    pub fn emit(&self, event: &UpstreamEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    /// Returns true if there are no listeners.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Returns the number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}
