//! Local lease consumers and their event delivery.
//!
//! Each application owns a fixed ring of pending events and at most one outstanding
//! registration. A registration is a single-assignment slot: protocol-driven completion and
//! caller cancellation race on the slot lock, and whichever sees it unresolved first wins.

use crate::{
    endpoint::ListenEndpoint,
    identifier::LeaseHandle,
    time::{Instance, INFINITE},
    timer::ScheduledTask,
    Error, Result,
};
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Input to the external arbitration authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbitrationRequest {
    pub remote_app: Option<String>,
    pub local_ttl: i32,
    pub remote_ttl: i32,
    pub remote_endpoint: ListenEndpoint,
    pub agent_instance: Instance,
    pub remote_agent_instance: Instance,
    pub remote_version: u16,
    pub monitor_lease_instance: Instance,
    pub subject_lease_instance: Instance,
    pub remote_arbitration_duration_upper_bound: i32,
    /// Early liveness hint raised ahead of expiry; carries zero TTLs.
    pub is_pre_arbitration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    LeaseEstablished {
        remote_app: String,
        lease: LeaseHandle,
    },
    LeasingApplicationExpired,
    RemoteLeasingApplicationExpired {
        remote_app: String,
    },
    Arbitrate(ArbitrationRequest),
    RemoteCertVerify {
        operation: Uuid,
        remote_endpoint: ListenEndpoint,
        certificate: Bytes,
        thumbprint: String,
    },
}

impl LeaseEvent {
    /// The application's own lease is gone; never evicted from a full queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseEvent::LeasingApplicationExpired)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    completed: bool,
    sender: Option<oneshot::Sender<Result<LeaseEvent>>>,
}

#[derive(Debug)]
pub struct CompletionSlot {
    state: Mutex<SlotState>,
}

impl CompletionSlot {
    fn new(sender: oneshot::Sender<Result<LeaseEvent>>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                completed: false,
                sender: Some(sender),
            }),
        }
    }

    /// Completes with `event`, handing it back when the slot was already resolved.
    fn complete(&self, event: LeaseEvent) -> std::result::Result<(), LeaseEvent> {
        let mut state = self.state.lock();
        if state.completed {
            return Err(event);
        }
        state.completed = true;
        match state.sender.take() {
            Some(sender) => match sender.send(Ok(event)) {
                Err(Ok(event)) => Err(event),
                Ok(()) | Err(Err(_)) => Ok(()),
            },
            None => Err(event),
        }
    }

    fn resolve_with_error(&self, error: Error) -> bool {
        let mut state = self.state.lock();
        if state.completed {
            return false;
        }
        state.completed = true;
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(Err(error));
        }
        true
    }

    pub fn cancel(&self) -> bool {
        self.resolve_with_error(Error::Canceled)
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }
}

/// Handle returned by `register_leasing_application`. Dropping it cancels the registration.
#[derive(Debug)]
pub struct EventRegistration {
    slot: Arc<CompletionSlot>,
    receiver: Option<oneshot::Receiver<Result<LeaseEvent>>>,
}

impl EventRegistration {
    pub async fn recv(mut self) -> Result<LeaseEvent> {
        match self.receiver.take() {
            Some(receiver) => receiver.await.unwrap_or(Err(Error::Canceled)),
            None => Err(Error::Canceled),
        }
    }

    /// Cancels the pending delivery. Returns false when an event already won the race.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }
}

impl Drop for EventRegistration {
    fn drop(&mut self) {
        self.slot.cancel();
    }
}

#[derive(Debug)]
pub struct LeasingApplication {
    pub identifier: String,
    pub instance: Instance,
    pub process_id: u32,
    pub is_arbitration_enabled: bool,
    pub expiry_timeout: i32,
    pub global_lease_expire_time: i64,
    /// `INFINITE` until the first positive TTL grant.
    pub last_grant_expire_time: i64,
    pub is_being_unregistered: bool,
    pub unregister_timer: ScheduledTask,
    /// Set when the owning process asserted; cleared once it actually exits.
    pub process_assert_time: Option<i64>,
    events: ArrayQueue<LeaseEvent>,
    registration: Option<Arc<CompletionSlot>>,
}

impl LeasingApplication {
    pub fn new(
        identifier: impl Into<String>,
        process_id: u32,
        is_arbitration_enabled: bool,
        expiry_timeout: i32,
        event_capacity: usize,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            instance: crate::time::next_instance(),
            process_id,
            is_arbitration_enabled,
            expiry_timeout,
            global_lease_expire_time: INFINITE,
            last_grant_expire_time: INFINITE,
            is_being_unregistered: false,
            unregister_timer: ScheduledTask::default(),
            process_assert_time: None,
            events: ArrayQueue::new(event_capacity.max(1)),
            registration: None,
        }
    }

    /// Hands `event` to the outstanding registration, or queues it.
    pub fn deliver(&mut self, event: LeaseEvent) {
        tracing::debug!(app = %self.identifier, ?event, "delivering lease event");
        let event = match self.registration.take() {
            Some(slot) => match slot.complete(event) {
                Ok(()) => return,
                Err(event) => event,
            },
            None => event,
        };
        if let Err(event) = self.events.push(event) {
            self.push_evicting(event);
        }
    }

    /// Makes room in a full queue by dropping the oldest non-terminal event, keeping order.
    /// When every queued event is terminal the incoming one is dropped instead.
    fn push_evicting(&mut self, event: LeaseEvent) {
        let mut evicted = None;
        for _ in 0..self.events.len() {
            let Some(queued) = self.events.pop() else {
                break;
            };
            if evicted.is_none() && !queued.is_terminal() {
                evicted = Some(queued);
            } else if let Err(queued) = self.events.push(queued) {
                evicted.get_or_insert(queued);
            }
        }
        let dropped = if evicted.is_some() {
            self.events.push(event).err()
        } else {
            Some(event)
        };
        if let Some(dropped) = evicted.or(dropped) {
            tracing::warn!(app = %self.identifier, ?dropped, "event queue full, dropping event");
        }
    }

    /// Returns a registration resolved by the next event.
    pub fn register(&mut self) -> Result<EventRegistration> {
        if let Some(slot) = &self.registration {
            if !slot.is_completed() {
                return Err(Error::Retry(format!(
                    "application {} already has a pending registration",
                    self.identifier
                )));
            }
        }
        let (sender, receiver) = oneshot::channel();
        let slot = Arc::new(CompletionSlot::new(sender));
        let registration = EventRegistration {
            slot: slot.clone(),
            receiver: Some(receiver),
        };
        match self.events.pop() {
            Some(event) => {
                let _ = slot.complete(event);
            }
            None => self.registration = Some(slot),
        }
        Ok(registration)
    }

    /// Resolves an outstanding registration with `Canceled` as the application goes away.
    pub fn cancel_registration(&mut self) {
        if let Some(slot) = self.registration.take() {
            slot.cancel();
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn app() -> LeasingApplication {
        LeasingApplication::new("fm", 1, true, 3_000, 2)
    }

    #[tokio::test]
    async fn test_queued_event_resolves_registration() {
        let mut app = app();
        app.deliver(LeaseEvent::LeasingApplicationExpired);
        assert_eq!(app.pending_events(), 1);
        let event = app.register().unwrap().recv().await.unwrap();
        assert_eq!(event, LeaseEvent::LeasingApplicationExpired);
        assert_eq!(app.pending_events(), 0);
    }

    #[test]
    fn test_pending_registration_completed_by_delivery() {
        let mut app = app();
        let mut recv = task::spawn(app.register().unwrap().recv());
        assert_pending!(recv.poll());
        app.deliver(LeaseEvent::RemoteLeasingApplicationExpired {
            remote_app: "remote".into(),
        });
        assert!(recv.is_woken());
        let event = assert_ready!(recv.poll()).unwrap();
        assert!(matches!(event, LeaseEvent::RemoteLeasingApplicationExpired { .. }));
    }

    #[test]
    fn test_cancel_races_with_delivery() {
        let mut app = app();
        let registration = app.register().unwrap();
        assert!(registration.cancel());
        assert!(!registration.cancel());

        // the canceled slot no longer consumes events
        app.deliver(LeaseEvent::LeasingApplicationExpired);
        assert_eq!(app.pending_events(), 1);

        let mut recv = task::spawn(registration.recv());
        assert!(matches!(assert_ready!(recv.poll()), Err(Error::Canceled)));
    }

    #[test]
    fn test_single_outstanding_registration() {
        let mut app = app();
        let _first = app.register().unwrap();
        assert!(matches!(app.register(), Err(Error::Retry(_))));
    }

    #[test]
    fn test_full_queue_keeps_expiry() {
        let mut app = app();
        app.deliver(LeaseEvent::LeasingApplicationExpired);
        for name in ["a", "b"] {
            app.deliver(LeaseEvent::RemoteLeasingApplicationExpired {
                remote_app: name.into(),
            });
        }
        assert_eq!(app.pending_events(), 2);
        let first = assert_ready!(task::spawn(app.register().unwrap().recv()).poll()).unwrap();
        assert_eq!(first, LeaseEvent::LeasingApplicationExpired);
        let second = assert_ready!(task::spawn(app.register().unwrap().recv()).poll()).unwrap();
        assert_eq!(
            second,
            LeaseEvent::RemoteLeasingApplicationExpired {
                remote_app: "b".into()
            }
        );

        // a queue of expiries drops further non-terminal events
        app.deliver(LeaseEvent::LeasingApplicationExpired);
        app.deliver(LeaseEvent::LeasingApplicationExpired);
        app.deliver(LeaseEvent::RemoteLeasingApplicationExpired {
            remote_app: "c".into(),
        });
        assert_eq!(app.pending_events(), 2);
        for _ in 0..2 {
            let event = assert_ready!(task::spawn(app.register().unwrap().recv()).poll()).unwrap();
            assert!(event.is_terminal());
        }
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut app = app();
        for name in ["a", "b", "c"] {
            app.deliver(LeaseEvent::RemoteLeasingApplicationExpired {
                remote_app: name.into(),
            });
        }
        assert_eq!(app.pending_events(), 2);
        let mut recv = task::spawn(app.register().unwrap().recv());
        let event = assert_ready!(recv.poll()).unwrap();
        assert_eq!(
            event,
            LeaseEvent::RemoteLeasingApplicationExpired {
                remote_app: "b".into()
            }
        );
    }
}
