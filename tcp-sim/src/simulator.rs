//! Concurrent discrete-event scheduler.
//!
//! One thread (the one calling [`Simulator::run`]) owns logical time and
//! the ledger of pending events.  Any other thread may schedule or cancel
//! events through a cloneable [`SimHandle`]; those requests land in three
//! lock-free inboxes that the simulation thread drains in [`Simulator::sync`]:
//!
//! ```text
//!   worker threads / events              simulation thread
//!  ┌───────────────────────┐   push   ┌────────┐  sync  ┌──────────────┐
//!  │ schedule / cancel /   │─────────▶│ inbox  │───────▶│ ledger       │──▶ pop, invoke
//!  │ schedule_destroy      │          │ ×3     │        │ (ts, uid)    │
//!  └───────────────────────┘          └────────┘        └──────────────┘
//! ```
//!
//! | Inbox     | Carries                          | Drained into            |
//! |-----------|----------------------------------|-------------------------|
//! | destroys  | teardown actions                 | destroy list            |
//! | events    | newly scheduled events           | ledger                  |
//! | removes   | keys of cancelled events         | ledger (removal)        |
//!
//! Events run in `(timestamp, uid)` order.  The uid comes from one atomic
//! counter, so ties are broken by allocation order no matter which thread
//! pushed first.
//!
//! Asynchronous jobs run on a tokio blocking pool ([`SimHandle::add_job`]);
//! logical time does not move while the simulation thread waits on one.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::config::SimulatorConfig;
use crate::error::SimError;

/// Context of events not tied to any node.
pub const NO_CONTEXT: u32 = u32::MAX;

/// Boxed event body.
pub type Action = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Read-only view of logical time, cheap to clone and share.
#[derive(Clone, Default)]
pub struct Clock(Arc<AtomicU64>);

impl Clock {
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Acquire))
    }

    fn set(&self, t: Duration) {
        self.0.store(duration_nanos(t), Ordering::Release);
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Clock({:?})", self.now())
    }
}

fn duration_nanos(t: Duration) -> u64 {
    u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Ledger ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub ts: Duration,
    pub uid: u64,
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

struct Event {
    key: EventKey,
    context: u32,
    state: Arc<AtomicU8>,
    action: Action,
}

/// Handle to a scheduled event.
#[derive(Clone)]
pub struct EventId {
    key: EventKey,
    context: u32,
    state: Arc<AtomicU8>,
    removes: Sender<EventKey>,
}

impl EventId {
    /// Prevent the event from running.  The ledger forgets it at the next
    /// sync.  A no-op once the event has run or started running.
    pub fn cancel(&self) {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if self.removes.send(self.key).is_err() {
                log::trace!("[sim] scheduler gone, removal of {} dropped", self.key.uid);
            }
        }
    }

    /// The event has run, is running, or was cancelled.
    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Still waiting to run.
    pub fn is_running(&self) -> bool {
        !self.is_expired()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn ts(&self) -> Duration {
        self.key.ts
    }

    pub fn uid(&self) -> u64 {
        self.key.uid
    }

    pub fn context(&self) -> u32 {
        self.context
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventId")
            .field("ts", &self.key.ts)
            .field("uid", &self.key.uid)
            .field("context", &self.context)
            .field("expired", &self.is_expired())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared state and handle
// ---------------------------------------------------------------------------

struct Shared {
    clock: Clock,
    context: AtomicU32,
    uid: AtomicU64,
    running: AtomicBool,
    stop: AtomicBool,
    events: Sender<Event>,
    removes: Sender<EventKey>,
    destroys: Sender<Event>,
}

/// Thread-safe entry point for scheduling.
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
    jobs: Option<tokio::runtime::Handle>,
}

impl SimHandle {
    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    pub fn clock(&self) -> Clock {
        self.shared.clock.clone()
    }

    /// Context of the event being executed.
    pub fn context(&self) -> u32 {
        self.shared.context.load(Ordering::Acquire)
    }

    /// Run `f` after `delay`, in the current context.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> EventId {
        self.schedule_with_context(self.context(), delay, f)
    }

    /// Run `f` after `delay` in `context`.
    pub fn schedule_with_context(
        &self,
        context: u32,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> EventId {
        let now = self.now();
        let ts = now
            .checked_add(delay)
            .unwrap_or_else(|| panic!("event at {now:?} + {delay:?} overflows logical time"));
        let uid = self.shared.uid.fetch_add(1, Ordering::AcqRel);
        let key = EventKey { ts, uid };
        let state = Arc::new(AtomicU8::new(PENDING));
        let event = Event {
            key,
            context,
            state: Arc::clone(&state),
            action: Box::new(f),
        };
        if self.shared.events.send(event).is_err() {
            log::warn!("[sim] scheduler gone, event {uid} dropped");
        }
        EventId {
            key,
            context,
            state,
            removes: self.shared.removes.clone(),
        }
    }

    /// Run `f` at the current time, after every event already due now.
    pub fn schedule_now(&self, f: impl FnOnce() + Send + 'static) -> EventId {
        self.schedule(Duration::ZERO, f)
    }

    /// Run `f` when the simulator is destroyed.
    pub fn schedule_destroy(&self, f: impl FnOnce() + Send + 'static) -> EventId {
        let uid = self.shared.uid.fetch_add(1, Ordering::AcqRel);
        let key = EventKey { ts: self.now(), uid };
        let state = Arc::new(AtomicU8::new(PENDING));
        let event = Event {
            key,
            context: NO_CONTEXT,
            state: Arc::clone(&state),
            action: Box::new(f),
        };
        if self.shared.destroys.send(event).is_err() {
            log::warn!("[sim] scheduler gone, destroy event {uid} dropped");
        }
        EventId {
            key,
            context: NO_CONTEXT,
            state,
            removes: self.shared.removes.clone(),
        }
    }

    /// Same as [`EventId::cancel`].
    pub fn remove(&self, id: &EventId) {
        id.cancel();
    }

    /// Make [`Simulator::run`] return after the current event.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Stop after `delay` of logical time.
    pub fn stop_at(&self, delay: Duration) -> EventId {
        let shared = Arc::clone(&self.shared);
        self.schedule_with_context(NO_CONTEXT, delay, move || {
            shared.stop.store(true, Ordering::Release);
        })
    }

    /// Start `f` on the job pool.  With no workers configured the job is
    /// deferred and runs inside [`JobHandle::wait`] instead.
    pub fn add_job<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(SimHandle) -> T + Send + 'static,
    {
        let handle = self.clone();
        let Some(jobs) = &self.jobs else {
            let job: DeferredJob<T> = Box::new(f);
            return JobHandle {
                inner: JobInner::Deferred(Some((job, handle))),
            };
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        jobs.spawn_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(handle)));
            if tx.send(result.map_err(panic_message)).is_err() {
                log::trace!("[sim] job result discarded");
            }
        });
        JobHandle {
            inner: JobInner::Spawned(rx),
        }
    }
}

impl fmt::Debug for SimHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimHandle")
            .field("now", &self.now())
            .field("context", &self.context())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

type DeferredJob<T> = Box<dyn FnOnce(SimHandle) -> T + Send>;

enum JobInner<T> {
    Spawned(Receiver<Result<T, String>>),
    Deferred(Option<(DeferredJob<T>, SimHandle)>),
}

/// Result of a job started with [`SimHandle::add_job`].
pub struct JobHandle<T> {
    inner: JobInner<T>,
}

impl<T> JobHandle<T> {
    /// Block until the job finishes.
    pub fn wait(mut self) -> Result<T, SimError> {
        match &mut self.inner {
            JobInner::Spawned(rx) => match rx.recv() {
                Ok(result) => result.map_err(SimError::JobPanicked),
                Err(_) => Err(SimError::JobPanicked("job was dropped".to_string())),
            },
            JobInner::Deferred(job) => {
                let Some((f, handle)) = job.take() else {
                    return Err(SimError::JobPanicked("job already taken".to_string()));
                };
                panic::catch_unwind(AssertUnwindSafe(|| f(handle)))
                    .map_err(|p| SimError::JobPanicked(panic_message(p)))
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// The scheduler.  Owned by the simulation thread.
pub struct Simulator {
    shared: Arc<Shared>,
    ledger: BTreeMap<EventKey, Event>,
    destroy_list: Vec<Event>,
    events_rx: Receiver<Event>,
    removes_rx: Receiver<EventKey>,
    destroys_rx: Receiver<Event>,
    runtime: Option<tokio::runtime::Runtime>,
    executed: u64,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Result<Self, SimError> {
        let runtime = if config.workers > 0 {
            Some(
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(config.workers)
                    .thread_name("sim-job")
                    .build()?,
            )
        } else {
            None
        };
        let (events, events_rx) = crossbeam_channel::unbounded();
        let (removes, removes_rx) = crossbeam_channel::unbounded();
        let (destroys, destroys_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            clock: Clock::default(),
            context: AtomicU32::new(NO_CONTEXT),
            uid: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            events,
            removes,
            destroys,
        });
        log::debug!("[sim] created with {} job workers", config.workers);
        Ok(Self {
            shared,
            ledger: BTreeMap::new(),
            destroy_list: Vec::new(),
            events_rx,
            removes_rx,
            destroys_rx,
            runtime,
            executed: 0,
        })
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            shared: Arc::clone(&self.shared),
            jobs: self.runtime.as_ref().map(|rt| rt.handle().clone()),
        }
    }

    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    /// Events invoked so far.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Drain the inboxes: destroy events first, then insertions, then
    /// removals, so a cancel never precedes its own insertion.
    pub fn sync(&mut self) {
        while let Ok(ev) = self.destroys_rx.try_recv() {
            self.destroy_list.push(ev);
        }
        let now = self.now();
        while let Ok(ev) = self.events_rx.try_recv() {
            assert!(
                ev.key.ts >= now,
                "event {} scheduled at {:?}, before now {now:?}",
                ev.key.uid,
                ev.key.ts
            );
            self.ledger.insert(ev.key, ev);
        }
        while let Ok(key) = self.removes_rx.try_recv() {
            if self.ledger.remove(&key).is_some() {
                log::trace!("[sim] removed event {} at {:?}", key.uid, key.ts);
            } else {
                self.destroy_list.retain(|ev| ev.key != key);
            }
        }
    }

    /// Pop and invoke the earliest event.  Returns `false` if the ledger was
    /// empty.
    pub fn process_one_event(&mut self) -> bool {
        let Some((key, ev)) = self.ledger.pop_first() else {
            return false;
        };
        if ev.state.load(Ordering::Acquire) == CANCELLED {
            self.sync();
            return true;
        }
        let now = self.now();
        assert!(
            key.ts >= now,
            "event {} at {:?} popped after logical time reached {now:?}",
            key.uid,
            key.ts
        );
        self.shared.clock.set(key.ts);
        self.shared.context.store(ev.context, Ordering::Release);
        if ev
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (ev.action)();
            ev.state.store(DONE, Ordering::Release);
            self.executed += 1;
        }
        self.sync();
        true
    }

    /// Invoke events until none remain or a stop is requested.
    pub fn run(&mut self) {
        self.shared.running.store(true, Ordering::Release);
        self.shared.stop.store(false, Ordering::Release);
        self.sync();
        log::debug!("[sim] run at {:?} with {} events", self.now(), self.ledger.len());
        while !self.ledger.is_empty() && !self.shared.stop.load(Ordering::Acquire) {
            self.process_one_event();
        }
        self.shared.running.store(false, Ordering::Release);
        log::debug!(
            "[sim] run returned at {:?}, {} events executed",
            self.now(),
            self.executed
        );
    }

    /// Make [`Simulator::run`] return after the current event.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Stop after `delay` of logical time.
    pub fn stop_at(&self, delay: Duration) -> EventId {
        self.handle().stop_at(delay)
    }

    /// Nothing is pending anywhere and [`Simulator::run`] is not executing.
    pub fn is_finished(&self) -> bool {
        self.ledger.is_empty()
            && self.events_rx.is_empty()
            && self.removes_rx.is_empty()
            && self.destroys_rx.is_empty()
            && !self.shared.running.load(Ordering::Acquire)
    }

    /// Pending events in the ledger (not counting undrained inboxes).
    pub fn pending(&self) -> usize {
        self.ledger.len()
    }

    /// Run the destroy events and drop everything else.
    ///
    /// # Panics
    ///
    /// If events remain, i.e. [`Simulator::is_finished`] is `false`.
    pub fn destroy(mut self) {
        self.sync();
        assert!(
            self.ledger.is_empty() && !self.shared.running.load(Ordering::Acquire),
            "destroying a simulator with {} pending events",
            self.ledger.len()
        );
        loop {
            self.sync();
            if self.destroy_list.is_empty() {
                break;
            }
            let ev = self.destroy_list.remove(0);
            if ev
                .state
                .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.shared.context.store(ev.context, Ordering::Release);
                (ev.action)();
                ev.state.store(DONE, Ordering::Release);
            }
        }
        log::debug!("[sim] destroyed at {:?}", self.now());
    }
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("now", &self.now())
            .field("pending", &self.ledger.len())
            .field("executed", &self.executed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sim() -> Simulator {
        Simulator::new(SimulatorConfig { workers: 2 }).unwrap()
    }

    #[test]
    fn events_run_in_timestamp_order() {
        let mut sim = sim();
        let h = sim.handle();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(30, 'c'), (10, 'a'), (20, 'b')] {
            let log = Arc::clone(&log);
            h.schedule(Duration::from_millis(delay), move || log.lock().unwrap().push(tag));
        }
        sim.run();
        assert_eq!(*log.lock().unwrap(), vec!['a', 'b', 'c']);
        assert_eq!(sim.now(), Duration::from_millis(30));
    }

    #[test]
    fn equal_timestamps_keep_allocation_order() {
        let mut sim = sim();
        let h = sim.handle();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            h.schedule(Duration::from_secs(1), move || log.lock().unwrap().push(i));
        }
        sim.run();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_event_never_runs() {
        let mut sim = sim();
        let h = sim.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let id = h.schedule(Duration::from_secs(1), move || flag.store(true, Ordering::SeqCst));
        assert!(id.is_running());
        id.cancel();
        assert!(id.is_expired());
        sim.run();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(sim.now(), Duration::ZERO);
    }

    #[test]
    fn nested_schedule_sees_advanced_clock() {
        let mut sim = sim();
        let h = sim.handle();
        let seen = Arc::new(Mutex::new(None));
        let inner_h = h.clone();
        let out = Arc::clone(&seen);
        h.schedule(Duration::from_secs(2), move || {
            let clock = inner_h.clock();
            inner_h.schedule(Duration::from_secs(3), move || {
                *out.lock().unwrap() = Some(clock.now());
            });
        });
        sim.run();
        assert_eq!(*seen.lock().unwrap(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn context_is_set_per_event() {
        let mut sim = sim();
        let h = sim.handle();
        let seen = Arc::new(AtomicU32::new(0));
        let inner = h.clone();
        let out = Arc::clone(&seen);
        h.schedule_with_context(7, Duration::from_millis(1), move || {
            out.store(inner.context(), Ordering::SeqCst);
        });
        sim.run();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn stop_at_halts_run() {
        let mut sim = sim();
        let h = sim.handle();
        let count = Arc::new(AtomicU64::new(0));
        for s in 1..=10 {
            let c = Arc::clone(&count);
            h.schedule(Duration::from_secs(s), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sim.stop_at(Duration::from_millis(4500));
        sim.run();
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(!sim.is_finished());
        sim.run();
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(sim.is_finished());
    }

    #[test]
    fn destroy_runs_teardown_events() {
        let sim = sim();
        let h = sim.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        h.schedule_destroy(move || flag.store(true, Ordering::SeqCst));
        assert!(!sim.is_finished());
        sim.destroy();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "pending events")]
    fn destroy_with_pending_events_panics() {
        let sim = sim();
        sim.handle().schedule(Duration::from_secs(1), || {});
        sim.destroy();
    }

    #[test]
    fn deferred_job_runs_on_wait() {
        let sim = Simulator::new(SimulatorConfig { workers: 0 }).unwrap();
        let job = sim.handle().add_job(|_| 6 * 7);
        assert_eq!(job.wait().unwrap(), 42);
    }

    #[test]
    fn job_panic_is_reported() {
        let sim = sim();
        let job = sim.handle().add_job(|_| -> u32 { panic!("boom") });
        match job.wait() {
            Err(SimError::JobPanicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
