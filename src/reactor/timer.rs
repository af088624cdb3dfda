use std::cmp::{min, Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};
use crate::event::{Event, TimerTag};
use crate::reactor::pump::EventSource;

/// Handle for a scheduled timer. Cancelling is racy by nature: a timer that is about to fire
///  may fire once more after `cancel()` returns.
#[derive(Clone, Debug)]
pub struct TimerKey {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerKey {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        trace!("cancelling timer #{}", self.id);
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Delays too long to represent as an [Instant] are clamped to roughly a century, which is as
///  good as never
fn due_after(start: Instant, delay: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);
    start.checked_add(delay)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

struct Scheduled {
    due: Instant,
    /// tie breaker for timers due at the same time: FIFO
    seq: u64,
    key: TimerKey,
    period: Option<Duration>,
    tag: TimerTag,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due.cmp(&other.due)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Schedules timers from any thread. Timers fire as [Event::Time] events from the
///  corresponding [TimerEventSource].
#[derive(Clone)]
pub struct TimerScheduler {
    commands: Sender<Scheduled>,
    next_id: Arc<AtomicU64>,
}

impl TimerScheduler {
    pub fn schedule_once(&self, delay: Duration, tag: TimerTag) -> TimerKey {
        self.schedule(delay, None, tag)
    }

    pub fn schedule_periodic(&self, initial_delay: Duration, period: Duration, tag: TimerTag) -> TimerKey {
        assert!(!period.is_zero());
        self.schedule(initial_delay, Some(period), tag)
    }

    fn schedule(&self, delay: Duration, period: Option<Duration>, tag: TimerTag) -> TimerKey {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = TimerKey {
            id,
            cancelled: Default::default(),
        };
        trace!("scheduling timer #{} for {:?} in {:?}", id, tag, delay);

        let scheduled = Scheduled {
            due: due_after(Instant::now(), delay),
            seq: id,
            key: key.clone(),
            period,
            tag,
        };
        if self.commands.send(scheduled).is_err() {
            debug!("timer source is gone - timer #{} will never fire", id);
        }
        key
    }
}

/// A priority queue of one-shot and periodic timers, emitting a TIME event for each due timer
pub struct TimerEventSource {
    commands: Receiver<Scheduled>,
    scheduler: TimerScheduler,
    timers: BinaryHeap<Reverse<Scheduled>>,
}

impl Default for TimerEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerEventSource {
    pub fn new() -> TimerEventSource {
        let (sender, commands) = unbounded();
        TimerEventSource {
            commands,
            scheduler: TimerScheduler {
                commands: sender,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            timers: Default::default(),
        }
    }

    pub fn scheduler(&self) -> TimerScheduler {
        self.scheduler.clone()
    }

    /// number of timers that are scheduled, including cancelled timers that were not purged yet
    pub fn num_scheduled(&mut self) -> usize {
        self.drain_commands();
        self.timers.len()
    }

    fn drain_commands(&mut self) {
        for scheduled in self.commands.try_iter() {
            self.timers.push(Reverse(scheduled));
        }
    }

    /// Pops the next due timer (rescheduling periodic timers) and returns its event. Cancelled
    ///  timers are discarded on the way.
    fn poll_due(&mut self, now: Instant) -> Option<Event> {
        while let Some(Reverse(next)) = self.timers.peek() {
            if next.key.is_cancelled() {
                self.timers.pop();
                continue;
            }
            if next.due > now {
                return None;
            }

            let Reverse(mut scheduled) = self.timers.pop()?;
            let event = Event::Time {
                key: scheduled.key.id,
                tag: scheduled.tag,
            };

            if let Some(period) = scheduled.period {
                // fixed rate, but without catching up on missed periods
                scheduled.due = due_after(scheduled.due, period).max(now);
                self.timers.push(Reverse(scheduled));
            }
            return Some(event);
        }
        None
    }
}

impl EventSource for TimerEventSource {
    fn next_event(&mut self, timeout: Duration) -> anyhow::Result<Option<Event>> {
        let deadline = due_after(Instant::now(), timeout);
        loop {
            self.drain_commands();

            let now = Instant::now();
            if let Some(event) = self.poll_due(now) {
                return Ok(Some(event));
            }
            if now >= deadline {
                return Ok(None);
            }

            let wake_up = match self.timers.peek() {
                Some(Reverse(next)) => min(next.due, deadline),
                None => deadline,
            };

            // sleep until the next timer is due, or until a new timer is scheduled
            match self.commands.recv_deadline(wake_up) {
                Ok(scheduled) => self.timers.push(Reverse(scheduled)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // the source holds a sender itself, so this can not happen
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session::SessionKey;

    fn next_tag(source: &mut TimerEventSource, timeout: Duration) -> Option<TimerTag> {
        match source.next_event(timeout).unwrap() {
            Some(Event::Time { tag, .. }) => Some(tag),
            Some(other) => panic!("unexpected event {}", other),
            None => None,
        }
    }

    #[test]
    fn test_fires_in_due_order() {
        let mut source = TimerEventSource::new();
        let scheduler = source.scheduler();

        scheduler.schedule_once(Duration::from_millis(40), TimerTag::Reconnect(SessionKey::from_raw(2)));
        scheduler.schedule_once(Duration::from_millis(10), TimerTag::Reconnect(SessionKey::from_raw(1)));

        let start = Instant::now();
        assert_eq!(next_tag(&mut source, Duration::from_secs(5)), Some(TimerTag::Reconnect(SessionKey::from_raw(1))));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(next_tag(&mut source, Duration::from_secs(5)), Some(TimerTag::Reconnect(SessionKey::from_raw(2))));
        assert!(start.elapsed() >= Duration::from_millis(40));

        assert_eq!(next_tag(&mut source, Duration::from_millis(20)), None);
    }

    #[test]
    fn test_same_due_time_is_fifo() {
        let mut source = TimerEventSource::new();
        let scheduler = source.scheduler();
        for i in 0..5 {
            scheduler.schedule_once(Duration::ZERO, TimerTag::Reconnect(SessionKey::from_raw(i)));
        }
        for i in 0..5 {
            assert_eq!(next_tag(&mut source, Duration::from_secs(1)), Some(TimerTag::Reconnect(SessionKey::from_raw(i))));
        }
    }

    #[test]
    fn test_periodic() {
        let mut source = TimerEventSource::new();
        let key = source.scheduler().schedule_periodic(Duration::ZERO, Duration::from_millis(10), TimerTag::Housekeeping);

        for _ in 0..3 {
            assert_eq!(next_tag(&mut source, Duration::from_secs(1)), Some(TimerTag::Housekeeping));
        }
        assert_eq!(source.num_scheduled(), 1);

        key.cancel();
        assert_eq!(next_tag(&mut source, Duration::from_millis(50)), None);
        assert_eq!(source.num_scheduled(), 0);
    }

    #[test]
    fn test_cancel_before_firing() {
        let mut source = TimerEventSource::new();
        let scheduler = source.scheduler();

        let cancelled = scheduler.schedule_once(Duration::from_millis(10), TimerTag::Reconnect(SessionKey::from_raw(1)));
        scheduler.schedule_once(Duration::from_millis(20), TimerTag::Reconnect(SessionKey::from_raw(2)));
        cancelled.cancel();
        assert!(cancelled.is_cancelled());

        assert_eq!(next_tag(&mut source, Duration::from_secs(1)), Some(TimerTag::Reconnect(SessionKey::from_raw(2))));
    }

    #[test]
    fn test_huge_delay_does_not_overflow() {
        let mut source = TimerEventSource::new();
        let scheduler = source.scheduler();
        scheduler.schedule_once(Duration::MAX, TimerTag::Reconnect(SessionKey::from_raw(1)));
        scheduler.schedule_periodic(Duration::ZERO, Duration::MAX, TimerTag::Housekeeping);

        assert_eq!(next_tag(&mut source, Duration::from_secs(1)), Some(TimerTag::Housekeeping));
        assert_eq!(next_tag(&mut source, Duration::from_millis(20)), None);
        assert_eq!(source.num_scheduled(), 2);
    }

    #[test]
    fn test_schedule_from_other_thread_wakes_source() {
        let mut source = TimerEventSource::new();
        let scheduler = source.scheduler();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            scheduler.schedule_once(Duration::ZERO, TimerTag::Housekeeping);
        });

        let start = Instant::now();
        assert_eq!(next_tag(&mut source, Duration::from_secs(5)), Some(TimerTag::Housekeeping));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
