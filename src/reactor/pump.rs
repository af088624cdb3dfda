use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, span, trace, Level};
use crate::event::Event;
use crate::event::queue::EventSink;

/// Blocking retrieval of the next event. Implementations wait at most `timeout` so that the
///  pump can check whether it was asked to stop.
pub trait EventSource: Send {
    fn next_event(&mut self, timeout: Duration) -> anyhow::Result<Option<Event>>;
}

/// Consumes one event at a time. Handlers run on a single pump thread and never block on I/O.
pub trait EventHandler: Send {
    fn handle(&mut self, event: Event);
}

/// A handler that passes events on to another stage's queue
pub struct ForwardingHandler {
    sink: Arc<dyn EventSink>,
}

impl ForwardingHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> ForwardingHandler {
        ForwardingHandler { sink }
    }
}

impl EventHandler for ForwardingHandler {
    fn handle(&mut self, event: Event) {
        self.sink.post(event);
    }
}

/// Pulls the next event from `source` and dispatches it to `handler`. Returns `false` if there was
///  no event within `timeout`.
pub fn pump_once(source: &mut dyn EventSource, handler: &mut dyn EventHandler, timeout: Duration) -> anyhow::Result<bool> {
    match source.next_event(timeout)? {
        Some(event) => {
            trace!("dispatching {}", event);
            handler.handle(event);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// The reactor loop, binding one event source to one handler on a dedicated thread. The loop
///  runs until [EventPump::stop] is called or the pump is dropped.
pub struct EventPump {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventPump {
    pub fn spawn<S, H>(name: &str, mut source: S, mut handler: H, poll_interval: Duration) -> anyhow::Result<EventPump>
    where S: EventSource + 'static,
          H: EventHandler + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("pump-{}", name))
            .spawn(move || {
                let span = span!(Level::DEBUG, "pump", name = thread_name.as_str());
                let _entered = span.enter();

                info!("starting event pump");
                while thread_running.load(Ordering::Acquire) {
                    if let Err(e) = pump_once(&mut source, &mut handler, poll_interval) {
                        error!("event source failed, terminating pump: {}", e);
                        break;
                    }
                }
                info!("event pump terminated");
            })?;

        Ok(EventPump {
            name: name.to_string(),
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Asks the pump to stop and waits for its thread to terminate. The pump finishes the event
    ///  it is currently handling, so this takes up to the poll interval.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            debug!("waiting for pump {} to terminate", self.name);
            if handle.join().is_err() {
                error!("pump {} panicked", self.name);
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;
    use anyhow::anyhow;
    use super::*;
    use crate::event::queue::{EventQueue, MockEventSink};
    use crate::session::session::SessionKey;

    struct Recorder(Arc<Mutex<Vec<u64>>>);
    impl EventHandler for Recorder {
        fn handle(&mut self, event: Event) {
            if let Some(session) = event.session() {
                self.0.lock().unwrap().push(session.to_raw());
            }
        }
    }

    fn request(n: u64) -> Event {
        Event::DisconnectRequest { session: SessionKey::from_raw(n) }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_pump_dispatches_in_order() {
        let queue = EventQueue::new(None);
        let sink = queue.sink();
        let recorded = Arc::new(Mutex::new(Vec::new()));

        let mut pump = EventPump::spawn("test", queue, Recorder(recorded.clone()), Duration::from_millis(10)).unwrap();
        assert!(pump.is_running());
        for i in 0..100 {
            sink.post(request(i));
        }

        wait_for(|| recorded.lock().unwrap().len() == 100);
        assert_eq!(*recorded.lock().unwrap(), (0..100).collect::<Vec<_>>());

        pump.stop();
        assert!(!pump.is_running());
    }

    struct FailingSource;
    impl EventSource for FailingSource {
        fn next_event(&mut self, _timeout: Duration) -> anyhow::Result<Option<Event>> {
            Err(anyhow!("broken"))
        }
    }

    #[test]
    fn test_source_failure_terminates_pump() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let pump = EventPump::spawn("failing", FailingSource, Recorder(recorded), Duration::from_millis(10)).unwrap();
        wait_for(|| !pump.is_running());
    }

    #[test]
    fn test_forwarding_handler() {
        let mut sink = MockEventSink::new();
        sink.expect_post()
            .withf(|e| e.session() == Some(SessionKey::from_raw(7)))
            .times(1)
            .return_const(());

        let mut handler = ForwardingHandler::new(Arc::new(sink));
        handler.handle(request(7));
    }
}
