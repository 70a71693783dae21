//! Fan-out of engine events to subscribers.
//!
//! Each subscriber owns a bounded buffer. Publishing never blocks: when a
//! subscriber's buffer is full the oldest event is dropped and the loss is
//! surfaced to that subscriber as a `Lagged` marker, after which it can
//! resync by re-reading the session. Other subscribers are unaffected.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::types::EngineEvent;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusRecvError {
    /// Events were dropped for this subscriber; the count is how many.
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusTryRecvError {
    #[error("no event ready")]
    Empty,

    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("event bus closed")]
    Closed,
}

struct SubscriberState {
    queue: VecDeque<EngineEvent>,
    missed: u64,
    closed: bool,
    detached: bool,
}

struct SubscriberShared {
    capacity: usize,
    state: Mutex<SubscriberState>,
    available: Condvar,
}

/// One subscriber's receiving half. Dropping it detaches from the bus.
pub struct EventReceiver {
    shared: Arc<SubscriberShared>,
}

pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        let shared = Arc::new(SubscriberShared {
            capacity: self.capacity,
            state: Mutex::new(SubscriberState {
                queue: VecDeque::with_capacity(self.capacity),
                missed: 0,
                closed: false,
                detached: false,
            }),
            available: Condvar::new(),
        });
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .push(Arc::clone(&shared));
        EventReceiver { shared }
    }

    /// Deliver an event to every live subscriber. Events published for the
    /// same session arrive at each subscriber in publish order.
    pub fn publish(&self, event: &EngineEvent) {
        let mut subscribers = self.subscribers.lock().expect("bus lock poisoned");
        subscribers.retain(|shared| {
            let mut state = shared.state.lock().expect("subscriber lock poisoned");
            if state.detached {
                return false;
            }
            if state.queue.len() == shared.capacity {
                state.queue.pop_front();
                state.missed += 1;
            }
            state.queue.push_back(event.clone());
            shared.available.notify_one();
            true
        });
    }

    fn close(&self) {
        let subscribers = self.subscribers.lock().expect("bus lock poisoned");
        for shared in subscribers.iter() {
            let mut state = shared.state.lock().expect("subscriber lock poisoned");
            state.closed = true;
            shared.available.notify_all();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.close();
    }
}

impl EventReceiver {
    /// Blocking receive. A `Lagged` error is delivered once per loss run,
    /// before the next available event.
    pub fn recv(&self) -> Result<EngineEvent, BusRecvError> {
        let mut state = self.shared.state.lock().expect("subscriber lock poisoned");
        loop {
            if state.missed > 0 {
                let missed = state.missed;
                state.missed = 0;
                return Err(BusRecvError::Lagged(missed));
            }
            if let Some(event) = state.queue.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(BusRecvError::Closed);
            }
            state = self
                .shared
                .available
                .wait(state)
                .expect("subscriber lock poisoned");
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<EngineEvent, BusTryRecvError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("subscriber lock poisoned");
        loop {
            if state.missed > 0 {
                let missed = state.missed;
                state.missed = 0;
                return Err(BusTryRecvError::Lagged(missed));
            }
            if let Some(event) = state.queue.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(BusTryRecvError::Closed);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(BusTryRecvError::Empty);
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .expect("subscriber lock poisoned");
            state = guard;
        }
    }

    pub fn try_recv(&self) -> Result<EngineEvent, BusTryRecvError> {
        let mut state = self.shared.state.lock().expect("subscriber lock poisoned");
        if state.missed > 0 {
            let missed = state.missed;
            state.missed = 0;
            return Err(BusTryRecvError::Lagged(missed));
        }
        if let Some(event) = state.queue.pop_front() {
            return Ok(event);
        }
        if state.closed {
            return Err(BusTryRecvError::Closed);
        }
        Err(BusTryRecvError::Empty)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().expect("subscriber lock poisoned");
        state.detached = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> EngineEvent {
        EngineEvent::FullTranscriptionProgress {
            session_id: "s".into(),
            segment: n,
            total: 100,
        }
    }

    fn segment_of(e: &EngineEvent) -> u64 {
        match e {
            EngineEvent::FullTranscriptionProgress { segment, .. } => *segment,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(&event(n));
        }
        for n in 0..5 {
            assert_eq!(segment_of(&rx.recv().unwrap()), n);
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(&event(0));
    }

    #[test]
    fn slow_subscriber_lags_and_resyncs() {
        let bus = EventBus::with_capacity(4);
        let rx = bus.subscribe();
        for n in 0..10 {
            bus.publish(&event(n));
        }
        // Six events were dropped; the marker comes first.
        assert_eq!(rx.recv(), Err(BusRecvError::Lagged(6)));
        // The survivors are the newest four, still in order.
        for n in 6..10 {
            assert_eq!(segment_of(&rx.recv().unwrap()), n);
        }
    }

    #[test]
    fn slow_subscriber_does_not_block_others() {
        let bus = EventBus::with_capacity(2);
        let slow = bus.subscribe();
        let fast = bus.subscribe();
        for n in 0..6 {
            bus.publish(&event(n));
            assert_eq!(segment_of(&fast.recv().unwrap()), n);
        }
        assert_eq!(slow.recv(), Err(BusRecvError::Lagged(4)));
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(&event(0));
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn closed_bus_unblocks_receivers() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(&event(1));
        drop(bus);
        // Buffered events drain first, then Closed.
        assert_eq!(segment_of(&rx.recv().unwrap()), 1);
        assert_eq!(rx.recv(), Err(BusRecvError::Closed));
    }

    #[test]
    fn try_recv_reports_empty() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(rx.try_recv(), Err(BusTryRecvError::Empty));
        bus.publish(&event(3));
        assert_eq!(segment_of(&rx.try_recv().unwrap()), 3);
    }

    #[test]
    fn recv_timeout_expires() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(BusTryRecvError::Empty)
        );
    }

    #[test]
    fn recv_across_threads() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let publisher = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                for n in 0..20 {
                    bus.publish(&event(n));
                }
            })
        };
        for n in 0..20 {
            assert_eq!(segment_of(&rx.recv().unwrap()), n);
        }
        publisher.join().unwrap();
    }
}
