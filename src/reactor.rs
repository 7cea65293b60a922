use crate::config::MAX_EVENTS;
use crate::error::{Error, Result};
use crate::timer::{TimerId, TimerQueue};
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Token reserved for the wake-up descriptor; connection tokens are derived
/// from their file descriptors and can never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Readiness bits delivered to an I/O callback.
///
/// Errors are always delivered regardless of the registered interest.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            // A half-closed peer surfaces as read-closed; the read path
            // observes it as EOF.
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

pub type IoCallback = Arc<dyn Fn(Readiness) + Send + Sync>;

type Task = Box<dyn FnOnce() + Send>;

/// Snapshot of reactor internals, taken lock-by-lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactorStats {
    pub active_fds: usize,
    pub pending_tasks: usize,
    pub active_timers: usize,
    pub iterations: u64,
}

/// Single-threaded event loop: readiness multiplexing, a timer min-heap,
/// and a cross-thread task queue behind a wake-up descriptor.
///
/// One thread calls [`run`] and becomes the owner; every socket
/// registration and every callback dispatch happens there. Other threads
/// hand work in through [`queue_in_loop`] or the `Registry`-backed
/// registration methods, which are safe to call from anywhere.
///
/// [`run`]: Reactor::run
/// [`queue_in_loop`]: Reactor::queue_in_loop
pub struct Reactor {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    callbacks: Mutex<HashMap<RawFd, IoCallback>>,
    timers: Mutex<TimerQueue>,
    tasks: Mutex<Vec<Task>>,
    running: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
    iterations: AtomicU64,
}

impl Reactor {
    /// Creates the poller and the wake-up descriptor. Failure here is a
    /// fatal startup fault.
    pub fn new() -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| Error::ReactorSetup(format!("failed to create poller: {e}")))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| Error::ReactorSetup(format!("failed to clone poll registry: {e}")))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|e| Error::ReactorSetup(format!("failed to create wake-up descriptor: {e}")))?;

        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            callbacks: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerQueue::new()),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            owner: Mutex::new(None),
            iterations: AtomicU64::new(0),
        })
    }

    /// Runs the event loop on the calling thread until [`stop`] is observed.
    /// Calling `run` while the loop is already running returns immediately.
    ///
    /// Each iteration: wait for readiness up to the earliest timer expiry,
    /// dispatch I/O callbacks, fire expired timers, then drain queued tasks.
    ///
    /// [`stop`]: Reactor::stop
    pub fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.owner.lock().unwrap() = Some(thread::current().id());

        let mut poll = self.poll.lock().unwrap();
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Acquire) {
            let timeout = self.timers.lock().unwrap().next_timeout(Instant::now());

            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("poll error: {e}");
                    continue;
                }
            }

            self.iterations.fetch_add(1, Ordering::Relaxed);

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    // Wake-up descriptor; queued work is drained below.
                    continue;
                }
                self.dispatch_io(event);
            }

            self.fire_expired_timers();
            self.drain_tasks();
        }

        *self.owner.lock().unwrap() = None;
        Ok(())
    }

    /// Requests the loop to exit at the next iteration boundary. Idempotent
    /// and safe from any thread. Tasks enqueued after this are not run.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake reactor for stop: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        *self.owner.lock().unwrap() == Some(thread::current().id())
    }

    /// Registers `source` for `interest` and installs its readiness
    /// callback. The poller delivers edge-triggered readiness, so the
    /// callback must drain the source until it would block.
    pub fn register<S>(
        &self,
        source: &mut S,
        fd: RawFd,
        interest: Interest,
        callback: IoCallback,
    ) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.register(source, Token(fd as usize), interest)?;
        self.callbacks.lock().unwrap().insert(fd, callback);
        Ok(())
    }

    /// Replaces the interest set of an already-registered source.
    pub fn reregister<S>(&self, source: &mut S, fd: RawFd, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.registry.reregister(source, Token(fd as usize), interest)?;
        Ok(())
    }

    /// Removes a source and its callback. Tolerant of descriptors the OS
    /// already closed: failures are logged, never returned.
    pub fn deregister<S>(&self, source: &mut S, fd: RawFd)
    where
        S: Source + ?Sized,
    {
        if let Err(e) = self.registry.deregister(source) {
            warn!("failed to deregister fd {fd}: {e}");
        }
        self.callbacks.lock().unwrap().remove(&fd);
    }

    /// Schedules `task` to run once after `delay`.
    pub fn run_after(&self, delay: Duration, task: impl Fn() + Send + Sync + 'static) -> TimerId {
        let id = self.timers.lock().unwrap().schedule(
            Instant::now() + delay,
            None,
            Arc::new(task),
        );
        self.wake();
        id
    }

    /// Schedules `task` to run every `period`, first firing one period from
    /// now. `period` must be non-zero.
    pub fn run_every(&self, period: Duration, task: impl Fn() + Send + Sync + 'static) -> TimerId {
        assert!(!period.is_zero(), "repeating timer requires a non-zero period");
        let id = self.timers.lock().unwrap().schedule(
            Instant::now() + period,
            Some(period),
            Arc::new(task),
        );
        self.wake();
        id
    }

    /// Cancels a timer. Takes effect even if the timer already expired in
    /// the current iteration but its callback has not yet run.
    pub fn cancel_timer(&self, id: TimerId) {
        self.timers.lock().unwrap().cancel(id);
    }

    /// Runs `task` inline when called from the loop thread, otherwise
    /// enqueues it like [`queue_in_loop`].
    ///
    /// [`queue_in_loop`]: Reactor::queue_in_loop
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` for the next loop iteration and wakes the reactor.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.tasks.lock().unwrap().push(Box::new(task));
        self.wake();
    }

    pub fn statistics(&self) -> ReactorStats {
        let active_fds = self.callbacks.lock().unwrap().len();
        let pending_tasks = self.tasks.lock().unwrap().len();
        let active_timers = self.timers.lock().unwrap().active_count();
        ReactorStats {
            active_fds,
            pending_tasks,
            active_timers,
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake reactor: {e}");
        }
    }

    fn dispatch_io(&self, event: &Event) {
        let fd = event.token().0 as RawFd;
        let callback = self.callbacks.lock().unwrap().get(&fd).cloned();
        let Some(callback) = callback else { return };

        let readiness = Readiness::from_event(event);
        if panic::catch_unwind(AssertUnwindSafe(|| callback(readiness))).is_err() {
            error!("I/O callback panicked for fd {fd}");
        }
    }

    fn fire_expired_timers(&self) {
        let now = Instant::now();
        let expired = self.timers.lock().unwrap().pop_expired(now);

        for entry in expired {
            // A task or earlier timer in this pass may have cancelled it.
            if !self.timers.lock().unwrap().is_live(entry.id) {
                continue;
            }

            let callback = entry.callback.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!("timer callback panicked (timer {})", entry.id);
            }

            let mut timers = self.timers.lock().unwrap();
            match entry.period {
                Some(period) if timers.is_live(entry.id) => {
                    timers.reschedule(entry, now + period);
                }
                Some(_) => {} // cancelled from inside its own callback
                None => timers.retire(entry.id),
            }
        }
    }

    fn drain_tasks(&self) {
        let pending = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in pending {
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("queued task panicked");
            }
        }
    }
}
