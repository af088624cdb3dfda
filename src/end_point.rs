use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tracing::{debug, info};
use crate::buffers::buffer_pool::BufferPool;
use crate::config::NetConfig;
use crate::engine::monitor::ProtocolMonitor;
use crate::engine::packet_io_handler::{EngineSinks, PacketIoEventHandler, SelectorConnector};
use crate::event::Event;
use crate::event::queue::{EventQueue, EventSink};
use crate::handlers::IoEventHandler;
use crate::reactor::pump::{EventPump, EventSource, ForwardingHandler};
use crate::reactor::selector::{SelectableEventSource, SelectorRegistry};
use crate::reactor::timer::TimerEventSource;
use crate::session::session::SessionKey;
use crate::session::session_manager::SessionKeySource;
use crate::transport::channel::Listener;

/// The application's handle for acting on sessions. All operations are asynchronous: they post
///  a request to the protocol engine and return immediately. Outcomes are reported as events
///  to the application sink.
#[derive(Clone)]
pub struct SessionControl {
    protocol_sink: Arc<dyn EventSink>,
    key_source: SessionKeySource,
}

impl SessionControl {
    /// Creates a client session and starts connecting it to `addr`. The session is usable right
    ///  away: data sent before it is established is queued.
    pub fn connect(&self, addr: SocketAddr) -> SessionKey {
        let session = self.key_source.next_key();
        debug!("requesting session {} to {}", session, addr);
        self.protocol_sink.post(Event::StartConnection { session, addr });
        session
    }

    pub fn send(&self, session: SessionKey, data: impl Into<Bytes>) {
        self.protocol_sink.post(Event::PacketWriteRequest { session, data: data.into() });
    }

    /// Disconnects gracefully once all data sent so far is acknowledged by the peer
    pub fn disconnect(&self, session: SessionKey) {
        self.protocol_sink.post(Event::DisconnectRequest { session });
    }
}

/// The protocol engine's event source: requests and I/O results from the inbound queue, plus
///  work the engine posted to itself. Self-posted events take precedence, and they go to an
///  unbounded queue so that the engine never blocks on its own (bounded) inbound queue.
struct ProtocolEventSource {
    inbound: EventQueue,
    loopback: Arc<EventQueue>,
}

impl EventSource for ProtocolEventSource {
    fn next_event(&mut self, timeout: Duration) -> anyhow::Result<Option<Event>> {
        if let Some(event) = self.loopback.try_take() {
            return Ok(Some(event));
        }
        self.inbound.next_event(timeout)
    }
}

/// A network end point: the three pumps (I/O, timer, protocol) and the queues connecting them.
///
/// ```ascii
///  selector --> I/O handlers ----------+
///      ^                               v
///      +------ close requests --- protocol engine --> application sink
///                                      ^
///  timers --> forwarding handler ------+
/// ```
pub struct EndPoint {
    local_addr: Option<SocketAddr>,
    registry: Arc<SelectorRegistry>,
    listener: Option<Arc<Listener>>,
    control: SessionControl,
    /// in shutdown order: producers before the protocol pump, so that nobody blocks on a full
    ///  protocol queue that is no longer drained
    pumps: Vec<EventPump>,
}

impl EndPoint {
    pub fn start(config: Arc<NetConfig>, app_sink: Arc<dyn EventSink>) -> anyhow::Result<EndPoint> {
        Self::start_with_monitor(config, app_sink, None)
    }

    pub fn start_with_monitor(config: Arc<NetConfig>, app_sink: Arc<dyn EventSink>, monitor: Option<Box<dyn ProtocolMonitor>>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let pool = Arc::new(BufferPool::new(config.buffer_size, config.buffer_pool_size));
        let selector = SelectableEventSource::new(config.selector_event_capacity)?;
        let registry = selector.registry();
        let io_sink: Arc<dyn EventSink> = selector.sink();

        let listener = match config.listen_addr {
            Some(addr) => {
                let listener = Arc::new(Listener::bind(addr)?);
                registry.register_listener(listener.clone())?;
                info!("listening on {}", listener.local_addr());
                Some(listener)
            }
            None => None,
        };

        let inbound = EventQueue::new(config.protocol_queue_capacity);
        let protocol_sink: Arc<dyn EventSink> = Arc::new(inbound.sink());
        let loopback = Arc::new(EventQueue::new(None));

        let timers = TimerEventSource::new();
        let key_source = SessionKeySource::default();

        let sinks = EngineSinks {
            io: io_sink.clone(),
            loopback: loopback.clone(),
            app: app_sink,
        };
        let mut engine = PacketIoEventHandler::new(
            config.clone(),
            key_source.clone(),
            pool.clone(),
            sinks,
            Arc::new(SelectorConnector::new(registry.clone(), pool.clone())),
            timers.scheduler(),
        );
        if let Some(monitor) = monitor {
            engine = engine.with_monitor(monitor);
        }

        let io_handler = IoEventHandler::new(registry.clone(), pool, io_sink, protocol_sink.clone());
        let protocol_source = ProtocolEventSource {
            inbound,
            loopback,
        };

        let pumps = vec![
            EventPump::spawn("timer", timers, ForwardingHandler::new(protocol_sink.clone()), config.pump_poll_interval)?,
            EventPump::spawn("io", selector, io_handler, config.pump_poll_interval)?,
            EventPump::spawn("protocol", protocol_source, engine, config.pump_poll_interval)?,
        ];

        Ok(EndPoint {
            local_addr: listener.as_ref().map(|l| l.local_addr()),
            registry,
            listener,
            control: SessionControl {
                protocol_sink,
                key_source,
            },
            pumps,
        })
    }

    /// the address the listener is bound to, if this end point accepts sessions
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.pumps.is_empty() && self.pumps.iter().all(|p| p.is_running())
    }

    /// Stops all pumps and waits for their threads to terminate. Sessions are dropped without
    ///  notifying peers; disconnect them first for a graceful shutdown.
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            debug!("no longer accepting connections on {}", listener.local_addr());
            if let Err(e) = self.registry.deregister_listener(&listener) {
                debug!("error deregistering {:?}: {}", listener, e);
            }
        }
        for mut pump in self.pumps.drain(..) {
            debug!("stopping pump {}", pump.name());
            pump.stop();
        }
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}
