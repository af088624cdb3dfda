use std::time::Duration;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use crate::event::Event;
use crate::reactor::pump::EventSource;

/// The append-only, ordered end of an event queue. This is the only interface stages use to
///  talk to each other.
#[cfg_attr(test, automock)]
pub trait EventSink: Send + Sync {
    fn post(&self, event: Event);
}

/// FIFO queue connecting pumps. A bounded queue blocks producers when it is full (backpressure),
///  an unbounded queue never blocks them.
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl EventQueue {
    pub fn new(capacity: Option<usize>) -> EventQueue {
        let (sender, receiver) = match capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        EventQueue {
            sender,
            receiver,
        }
    }

    pub fn sink(&self) -> QueueSink {
        QueueSink {
            sender: self.sender.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// blocks until an event is available
    pub fn take(&self) -> Option<Event> {
        self.receiver.recv().ok()
    }

    pub fn take_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_take(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// takes all events that are currently in the queue
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }
}

impl EventSource for EventQueue {
    fn next_event(&mut self, timeout: Duration) -> anyhow::Result<Option<Event>> {
        Ok(self.take_timeout(timeout))
    }
}

#[derive(Clone)]
pub struct QueueSink {
    sender: Sender<Event>,
}

impl EventSink for QueueSink {
    fn post(&self, event: Event) {
        trace!("posting {}", event);
        // the queue owns its receiver, so sending fails only if the queue was dropped
        if let Err(e) = self.sender.send(event) {
            warn!("event queue is gone, dropping {}", e.0);
        }
    }
}

impl EventSink for EventQueue {
    fn post(&self, event: Event) {
        if let Err(e) = self.sender.send(event) {
            warn!("event queue is gone, dropping {}", e.0);
        }
    }
}

/// for async applications that consume session events with `recv().await`
impl EventSink for mpsc::UnboundedSender<Event> {
    fn post(&self, event: Event) {
        if let Err(e) = self.send(event) {
            warn!("application event receiver was dropped, discarding {}", e.0);
        }
    }
}

/// Blocks the posting pump while the channel is full. NB: this must not be posted to from
///  inside the tokio runtime
impl EventSink for mpsc::Sender<Event> {
    fn post(&self, event: Event) {
        if let Err(e) = self.blocking_send(event) {
            warn!("application event receiver was dropped, discarding {}", e.0);
        }
    }
}
