use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tarn::Reactor;

fn spawn_loop(reactor: &Arc<Reactor>) -> thread::JoinHandle<()> {
    let r = reactor.clone();
    let handle = thread::spawn(move || {
        r.run().unwrap();
    });
    while !reactor.is_running() {
        thread::sleep(Duration::from_millis(1));
    }
    handle
}

#[test]
fn run_returns_after_stop() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let handle = spawn_loop(&reactor);

    reactor.stop();
    handle.join().unwrap();
    assert!(!reactor.is_running());
}

#[test]
fn run_after_fires_no_earlier_than_its_delay() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let fired_at = Arc::new(Mutex::new(None));

    let start = Instant::now();
    let record = fired_at.clone();
    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(100), move || {
        *record.lock().unwrap() = Some(start.elapsed());
        r.stop();
    });

    reactor.run().unwrap();
    let elapsed = fired_at.lock().unwrap().expect("timer fired");
    assert!(elapsed >= Duration::from_millis(100), "fired at {elapsed:?}");
}

#[test]
fn run_in_loop_is_synchronous_on_the_loop_thread() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let observed_synchronous = Arc::new(AtomicBool::new(false));

    let observed = observed_synchronous.clone();
    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(10), move || {
        let flag = Arc::new(AtomicBool::new(false));
        let inner = flag.clone();
        r.run_in_loop(move || inner.store(true, Ordering::SeqCst));
        // The task must have run before run_in_loop returned.
        observed.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
        r.stop();
    });

    reactor.run().unwrap();
    assert!(observed_synchronous.load(Ordering::SeqCst));
}

#[test]
fn run_in_loop_from_another_thread_runs_on_the_loop() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let handle = spawn_loop(&reactor);

    let (tx, rx) = mpsc::channel();
    let r = reactor.clone();
    reactor.run_in_loop(move || {
        let _ = tx.send(r.is_in_loop_thread());
    });

    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn queued_tasks_run_in_enqueue_order() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let handle = spawn_loop(&reactor);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for i in 0..10 {
        let order = order.clone();
        let tx = tx.clone();
        reactor.queue_in_loop(move || {
            order.lock().unwrap().push(i);
            if i == 9 {
                let _ = tx.send(());
            }
        });
    }

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn periodic_timer_fires_five_times_before_one_shot_cancel() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let count = Arc::new(AtomicUsize::new(0));

    let counter = count.clone();
    let id = reactor.run_every(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(275), move || {
        r.cancel_timer(id);
        r.stop();
    });

    reactor.run().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn cancelled_timer_does_not_fire() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let fired = Arc::new(AtomicBool::new(false));

    let flag = fired.clone();
    let id = reactor.run_after(Duration::from_millis(50), move || {
        flag.store(true, Ordering::SeqCst);
    });
    reactor.cancel_timer(id);

    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(150), move || r.stop());

    reactor.run().unwrap();
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn timer_can_cancel_a_later_timer_in_the_same_pass() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let fired = Arc::new(AtomicBool::new(false));

    let flag = fired.clone();
    let victim = reactor.run_after(Duration::from_millis(20), move || {
        flag.store(true, Ordering::SeqCst);
    });

    // Same-expiry neighbourhood: this timer was scheduled first, so it
    // pops first and the victim must be suppressed before invocation.
    let r = reactor.clone();
    let earlier = reactor.run_after(Duration::from_millis(10), move || {
        r.cancel_timer(victim);
    });
    assert_ne!(earlier, victim);

    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(100), move || r.stop());

    reactor.run().unwrap();
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn panicking_callback_does_not_kill_the_loop() {
    let reactor = Arc::new(Reactor::new().unwrap());

    reactor.run_after(Duration::from_millis(10), || panic!("deliberate"));

    let survived = Arc::new(AtomicBool::new(false));
    let flag = survived.clone();
    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(60), move || {
        flag.store(true, Ordering::SeqCst);
        r.stop();
    });

    reactor.run().unwrap();
    assert!(survived.load(Ordering::SeqCst));
}

#[test]
fn statistics_track_timers_tasks_and_iterations() {
    let reactor = Arc::new(Reactor::new().unwrap());

    let id = reactor.run_after(Duration::from_secs(60), || {});
    assert_eq!(reactor.statistics().active_timers, 1);
    reactor.cancel_timer(id);
    assert_eq!(reactor.statistics().active_timers, 0);

    let r = reactor.clone();
    reactor.run_after(Duration::from_millis(20), move || r.stop());
    reactor.run().unwrap();

    let stats = reactor.statistics();
    assert!(stats.iterations > 0);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.active_fds, 0);
}

#[test]
fn tasks_enqueued_after_stop_do_not_run() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let handle = spawn_loop(&reactor);

    reactor.stop();
    handle.join().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    reactor.queue_in_loop(move || flag.store(true, Ordering::SeqCst));

    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(reactor.statistics().pending_tasks, 1);
}
