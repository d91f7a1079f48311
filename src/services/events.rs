//! Event system for referral operations
//!
//! Events are emitted only after the transaction that produced them has
//! committed. Consumers (messaging, audit, cache invalidation) subscribe to
//! the bus; a slow or failing consumer never affects the write that emitted
//! the event, and nothing here retries delivery.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Referral events emitted by services
#[derive(Debug, Clone)]
pub enum ReferralEvent {
    /// A lead was attributed; messaging sends the welcome/notification
    LeadCreated {
        page_id: String,
        lead_id: String,
        applicant_name: String,
        applicant_email: String,
        applicant_phone: Option<String>,
        identity_created: bool,
        referrer_node_id: String,
        referrer_handle: String,
        /// Link the applicant followed
        referrer_link: String,
        /// Link the applicant can now share
        submitter_link: String,
    },
    LeadStatusChanged {
        lead_id: String,
        from: String,
        to: String,
        actor_id: String,
    },
    LinkClicked {
        page_id: String,
        node_id: String,
        handle: String,
    },
    NodeReassigned {
        node_id: String,
        old_parent_id: Option<String>,
        new_parent_id: String,
        actor_id: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &ReferralEvent);
}

/// Event bus for broadcasting referral events
pub struct EventBus {
    sender: broadcast::Sender<ReferralEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ReferralEvent) {
        trace!(event = ?event, "Emitting referral event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ReferralEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ReferralEvent) {
        match event {
            ReferralEvent::LeadCreated {
                page_id,
                lead_id,
                referrer_handle,
                ..
            } => {
                info!(page = %page_id, lead = %lead_id, referrer = %referrer_handle, "Lead created");
            }
            ReferralEvent::NodeReassigned {
                node_id,
                new_parent_id,
                actor_id,
                ..
            } => {
                info!(node = %node_id, parent = %new_parent_id, actor = %actor_id, "Node reassigned");
            }
            ReferralEvent::LeadStatusChanged { lead_id, from, to, .. } => {
                debug!(lead = %lead_id, from = %from, to = %to, "Lead status changed");
            }
            _ => {
                trace!(event = ?event, "Referral event");
            }
        }
    }
}

/// Spawn a background task that feeds every event to `listener`
pub fn spawn_listener<L>(event_bus: Arc<EventBus>, listener: L) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, LoggingEventListener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(ReferralEvent::LinkClicked {
            page_id: "page-1".into(),
            node_id: "n1".into(),
            handle: "alice".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            ReferralEvent::LinkClicked { handle, .. } => assert_eq!(handle, "alice"),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        // Should not panic even with no subscribers
        bus.emit(ReferralEvent::LinkClicked {
            page_id: "page-1".into(),
            node_id: "n1".into(),
            handle: "alice".into(),
        });
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl EventListener for Recorder {
        fn on_event(&self, event: &ReferralEvent) {
            if let ReferralEvent::LeadStatusChanged { to, .. } = event {
                self.0.lock().unwrap().push(to.clone());
            }
        }
    }

    #[tokio::test]
    async fn test_spawned_listener_stops_when_bus_dropped() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_listener(bus.clone(), Recorder(seen.clone()));

        bus.emit(ReferralEvent::LeadStatusChanged {
            lead_id: "l1".into(),
            from: "new".into(),
            to: "contacted".into(),
            actor_id: "admin".into(),
        });
        drop(bus);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["contacted".to_string()]);
    }
}
