use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::{Events, Poll, Registry, Token, Waker};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::event::Event;
use crate::event::queue::EventSink;
use crate::reactor::pump::EventSource;
use crate::transport::channel::Listener;
use crate::transport::channel_transport::ChannelTransport;

/// reserved for waking up the selector when events are posted to it
pub const WAKER_TOKEN: Token = Token(0);

#[derive(Clone)]
pub enum Registered {
    Listener(Arc<Listener>),
    Transport(Arc<ChannelTransport>),
}

/// The registration side of a selector. Channels are registered with the underlying mio
///  registry using their id as the token, and this keeps track of which object a token
///  belongs to.
pub struct SelectorRegistry {
    registry: Registry,
    registered: Mutex<FxHashMap<Token, Registered>>,
}

impl SelectorRegistry {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn register_listener(&self, listener: Arc<Listener>) -> io::Result<()> {
        let token = Token(listener.id() as usize);
        listener.register(&self.registry, token)?;
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(token, Registered::Listener(listener));
        Ok(())
    }

    pub fn deregister_listener(&self, listener: &Listener) -> io::Result<()> {
        self.remove(Token(listener.id() as usize));
        listener.deregister(&self.registry)
    }

    /// NB: registering the transport's channel with the mio registry is the caller's job
    pub fn insert_transport(&self, transport: Arc<ChannelTransport>) {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
            .insert(transport.token(), Registered::Transport(transport));
    }

    pub fn remove(&self, token: Token) {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
    }

    pub fn lookup(&self, token: Token) -> Option<Registered> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Posts events to a selector's queue and wakes it up if it is blocked in `select`
pub struct SelectorSink {
    sender: Sender<Event>,
    waker: Waker,
}

impl EventSink for SelectorSink {
    fn post(&self, event: Event) {
        trace!("posting {}", event);
        if self.sender.send(event).is_err() {
            debug!("selector is gone, dropping event");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("error waking up selector: {}", e);
        }
    }
}

/// Wraps OS readiness notification for registered channels, turning readiness into events.
///  Events posted through the [SelectorSink] (e.g. by I/O handlers re-scheduling work) are
///  delivered in FIFO order along with readiness events.
pub struct SelectableEventSource {
    poll: Poll,
    events: Events,
    registry: Arc<SelectorRegistry>,
    ready: VecDeque<Event>,
    posted: Receiver<Event>,
    sink: Arc<SelectorSink>,
}

impl SelectableEventSource {
    pub fn new(event_capacity: usize) -> io::Result<SelectableEventSource> {
        let poll = Poll::new()?;
        let registry = Arc::new(SelectorRegistry {
            registry: poll.registry().try_clone()?,
            registered: Default::default(),
        });
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (sender, posted) = unbounded();

        Ok(SelectableEventSource {
            poll,
            events: Events::with_capacity(event_capacity),
            registry,
            ready: Default::default(),
            posted,
            sink: Arc::new(SelectorSink {
                sender,
                waker,
            }),
        })
    }

    pub fn registry(&self) -> Arc<SelectorRegistry> {
        self.registry.clone()
    }

    pub fn sink(&self) -> Arc<SelectorSink> {
        self.sink.clone()
    }

    /// Blocks until at least one registered channel is ready, an event is posted, or the timeout
    ///  elapses. Returns the number of readiness events added to the ready queue.
    pub fn select(&mut self, timeout: Duration) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut result = 0;
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }

            match self.registry.lookup(event.token()) {
                None => {
                    trace!("readiness for unregistered token {:?} - ignoring", event.token());
                }
                Some(Registered::Listener(listener)) => {
                    self.ready.push_back(Event::AcceptPossible { listener });
                    result += 1;
                }
                Some(Registered::Transport(transport)) => {
                    if transport.is_connect_pending() {
                        if event.is_writable() || event.is_error() || event.is_write_closed() {
                            self.ready.push_back(Event::ConnectPossible { transport });
                            result += 1;
                        }
                        continue;
                    }

                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        self.ready.push_back(Event::ReadPossible { transport: transport.clone() });
                        result += 1;
                    }
                    if event.is_writable() {
                        self.ready.push_back(Event::WritePossible { transport });
                        result += 1;
                    }
                }
            }
        }
        Ok(result)
    }

    fn drain_posted(&mut self) {
        self.ready.extend(self.posted.try_iter());
    }
}

impl EventSource for SelectableEventSource {
    fn next_event(&mut self, timeout: Duration) -> anyhow::Result<Option<Event>> {
        if self.ready.is_empty() {
            self.drain_posted();
        }
        if self.ready.is_empty() {
            self.select(timeout)?;
            self.drain_posted();
        }
        Ok(self.ready.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::thread;
    use std::time::Instant;
    use super::*;
    use crate::buffers::buffer_pool::BufferPool;
    use crate::event::EventKind;
    use crate::session::session::SessionKey;

    fn next_of_kind(source: &mut SelectableEventSource, kind: EventKind) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(event) = source.next_event(Duration::from_millis(100)).unwrap() {
                if event.kind() == kind {
                    return event;
                }
            }
        }
        panic!("no {:?} event", kind);
    }

    #[test]
    fn test_accept_and_read_readiness() {
        let mut source = SelectableEventSource::new(64).unwrap();
        let registry = source.registry();

        let listener = Arc::new(Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap());
        registry.register_listener(listener.clone()).unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        match next_of_kind(&mut source, EventKind::AcceptPossible) {
            Event::AcceptPossible { listener: l } => assert!(Arc::ptr_eq(&l, &listener)),
            _ => unreachable!(),
        }

        let (stream, _) = listener.accept().unwrap();
        let pool = Arc::new(BufferPool::new(64, 4));
        let transport = Arc::new(ChannelTransport::new(Box::new(stream), pool));
        transport.register(&registry).unwrap();
        assert_eq!(registry.len(), 2);

        client.write_all(b"ping").unwrap();
        let event = next_of_kind(&mut source, EventKind::ReadPossible);
        assert!(Arc::ptr_eq(event.transport().unwrap(), &transport));

        assert!(transport.close());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_posted_event_wakes_selector() {
        let mut source = SelectableEventSource::new(64).unwrap();
        let sink = source.sink();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            sink.post(Event::DisconnectRequest { session: SessionKey::from_raw(1) });
        });

        let start = Instant::now();
        let mut received = None;
        while received.is_none() && start.elapsed() < Duration::from_secs(5) {
            received = source.next_event(Duration::from_secs(10)).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(received.unwrap().kind(), EventKind::DisconnectRequest);
        handle.join().unwrap();
    }

    #[test]
    fn test_posted_events_keep_order() {
        let mut source = SelectableEventSource::new(64).unwrap();
        let sink = source.sink();
        for i in 0..5 {
            sink.post(Event::DisconnectRequest { session: SessionKey::from_raw(i) });
        }
        for i in 0..5 {
            let event = source.next_event(Duration::from_millis(10)).unwrap().unwrap();
            assert_eq!(event.session(), Some(SessionKey::from_raw(i)));
        }
    }
}
