//! Threaded tests for the simulation port
//!
//! Each test builds its own port, runs the dispatcher on a helper thread
//! and talks to its tasks over channels.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hostsim::task::{preemption_point, this_task};
use hostsim::types::{IntLine, ThreadStatus};
use hostsim::{OsError, OsResult, Port, PortConfig, RoundRobin, TaskHandle, TaskSelector};

const TIMEOUT: Duration = Duration::from_secs(10);

fn test_port() -> Port {
    Port::new(
        PortConfig::new()
            .tick_period(Duration::from_millis(2))
            .min_block_time(Duration::from_millis(1))
            .processors(2),
    )
}

/// Policy that always keeps the same task, counting ticks and decisions
struct Fixed {
    task: TaskHandle,
    selections: AtomicU32,
    ticks: AtomicU32,
}

impl Fixed {
    fn new(task: TaskHandle) -> Arc<Self> {
        Arc::new(Self {
            task,
            selections: AtomicU32::new(0),
            ticks: AtomicU32::new(0),
        })
    }

    fn selections(&self) -> u32 {
        self.selections.load(Ordering::SeqCst)
    }

    fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl TaskSelector for Fixed {
    fn increment_tick(&self) -> bool {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn select_next(&self) -> Option<TaskHandle> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        Some(self.task.clone())
    }
}

fn run<S: TaskSelector>(port: &Port, selector: Arc<S>) -> JoinHandle<OsResult<()>> {
    let port = port.clone();
    thread::spawn(move || port.start(selector))
}

fn stop(port: &Port, dispatcher: JoinHandle<OsResult<()>>) {
    assert!(wait_until(|| port.is_running()));
    assert_eq!(port.end_scheduler(), Ok(()));
    assert_eq!(dispatcher.join().unwrap(), Ok(()));
    assert!(!port.is_running());
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Park a task until the scheduler is stopped
fn idle() -> ! {
    loop {
        preemption_point();
        thread::sleep(Duration::from_millis(1));
    }
}

fn counting_handler(count: &Arc<AtomicU32>, switch: bool) -> impl Fn() -> bool + Send + Sync {
    let count = Arc::clone(count);
    move || {
        count.fetch_add(1, Ordering::SeqCst);
        switch
    }
}

#[test]
fn test_raise_waits_for_handler_and_decision() {
    let port = test_port();
    let handled = Arc::new(AtomicBool::new(false));
    {
        let handled = Arc::clone(&handled);
        port.register_handler(4, move || {
            thread::sleep(Duration::from_millis(5));
            handled.store(true, Ordering::SeqCst);
            true
        })
        .unwrap();
    }

    let (tx, rx) = mpsc::channel();
    let (selector_tx, selector_rx) = mpsc::channel::<Arc<Fixed>>();
    let p = port.clone();
    let h = Arc::clone(&handled);
    let task = port
        .create_task_thread("raiser", move || {
            let selector = selector_rx.recv().unwrap();
            let before = selector.selections();
            p.raise(4);
            tx.send((h.load(Ordering::SeqCst), before, selector.selections()))
                .unwrap();
            idle()
        })
        .unwrap();

    let selector = Fixed::new(task.clone());
    selector_tx.send(Arc::clone(&selector)).unwrap();
    let dispatcher = run(&port, Arc::clone(&selector));

    let (handled_seen, before, after) = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(handled_seen);
    // Same task re-selected, but a decision was made before the task resumed
    assert!(after > before);
    assert_eq!(port.current_task(), Some(task));

    stop(&port, dispatcher);
}

#[test]
fn test_critical_exit_services_pending_first() {
    let port = test_port();
    let seq = Arc::new(AtomicU32::new(0));
    port.register_handler(5, counting_handler(&seq, false)).unwrap();

    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let s = Arc::clone(&seq);
    let task = port
        .create_task_thread("masker", move || {
            p.enter_critical();
            p.raise(5);
            let during = s.load(Ordering::SeqCst);
            let pending = p.pending().is_set(5);
            p.exit_critical();
            let after = s.load(Ordering::SeqCst);
            let cleared = !p.pending().is_set(5);
            tx.send((during, pending, after, cleared)).unwrap();
            idle()
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(task));

    let (during, pending, after, cleared) = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(pending);
    assert_eq!(after, during + 1);
    assert!(cleared);

    stop(&port, dispatcher);
}

#[test]
fn test_masked_raises_are_serviced_once() {
    let port = test_port();
    let count = Arc::new(AtomicU32::new(0));
    port.register_handler(6, counting_handler(&count, false)).unwrap();

    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let c = Arc::clone(&count);
    let task = port
        .create_task_thread("repeater", move || {
            p.enter_critical();
            p.enter_critical();
            for _ in 0..5 {
                p.raise(6);
            }
            let nesting = p.critical_nesting();
            p.exit_critical();
            let inner = c.load(Ordering::SeqCst);
            p.exit_critical();
            tx.send((nesting, inner, c.load(Ordering::SeqCst))).unwrap();
            idle()
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(task));

    let (nesting, inner, outer) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(nesting, 2);
    assert_eq!(inner, 0);
    assert_eq!(outer, 1);

    // Several more ticks go by without the line firing again
    thread::sleep(Duration::from_millis(20));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    stop(&port, dispatcher);
}

#[test]
fn test_lines_serviced_in_ascending_order() {
    let port = test_port();
    let order = Arc::new(Mutex::new(Vec::<IntLine>::new()));

    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let o = Arc::clone(&order);
    let task = port
        .create_task_thread("orderer", move || {
            p.enter_critical();
            for line in 0..4 {
                let o = Arc::clone(&o);
                p.register_handler(line, move || {
                    o.lock().unwrap().push(line);
                    false
                })
                .unwrap();
            }
            o.lock().unwrap().clear();
            for line in [3, 1, 2, 0] {
                p.raise(line);
            }
            p.exit_critical();
            tx.send(o.lock().unwrap().clone()).unwrap();
            idle()
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(task));

    let seen = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(seen.len() >= 4);
    assert_eq!(&seen[..4], &[0, 1, 2, 3]);

    stop(&port, dispatcher);
}

#[test]
fn test_critical_section_crate_masks_interrupts() {
    let port = test_port();
    let count = Arc::new(AtomicU32::new(0));
    port.register_handler(7, counting_handler(&count, false)).unwrap();

    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let c = Arc::clone(&count);
    let task = port
        .create_task_thread("cs-user", move || {
            let during = critical_section::with(|_| {
                p.raise(7);
                c.load(Ordering::SeqCst)
            });
            tx.send((during, c.load(Ordering::SeqCst))).unwrap();
            idle()
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(task));

    let (during, after) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(during, 0);
    assert_eq!(after, 1);

    stop(&port, dispatcher);
}

#[test]
fn test_handler_raise_inside_critical_runs_next_pass() {
    let port = test_port();
    let inner = Arc::new(AtomicU32::new(0));
    let outer = Arc::new(AtomicU32::new(0));
    port.register_handler(6, counting_handler(&inner, false)).unwrap();
    {
        let outer = Arc::clone(&outer);
        port.register_handler(5, move || {
            let port = Port::current().unwrap();
            port.enter_critical();
            port.raise(6);
            port.exit_critical();
            outer.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();
    }

    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let task = port
        .create_task_thread("nester", move || {
            p.raise(5);
            tx.send(()).unwrap();
            idle()
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(task));

    rx.recv_timeout(TIMEOUT).unwrap();
    assert!(wait_until(|| inner.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(outer.load(Ordering::SeqCst), 1);
    assert_eq!(inner.load(Ordering::SeqCst), 1);
    assert!(!port.pending().is_set(5) && !port.pending().is_set(6));

    stop(&port, dispatcher);
}

#[test]
fn test_tick_deferred_until_critical_exit() {
    let port = test_port();
    let (selector_tx, selector_rx) = mpsc::channel::<Arc<Fixed>>();
    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let task = port
        .create_task_thread("long-critical", move || {
            let selector = selector_rx.recv().unwrap();
            // Let the start-up tick settle first
            while selector.ticks() == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            p.enter_critical();
            let before = selector.ticks();
            thread::sleep(Duration::from_millis(30));
            let during = selector.ticks();
            p.exit_critical();
            tx.send((before, during)).unwrap();
            idle()
        })
        .unwrap();

    let selector = Fixed::new(task);
    selector_tx.send(Arc::clone(&selector)).unwrap();
    let dispatcher = run(&port, Arc::clone(&selector));

    let (before, during) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(during, before);
    assert!(wait_until(|| selector.ticks() > before));
    // One deferred tick, not one per period spent masked
    assert!(selector.ticks() - before < 5);

    stop(&port, dispatcher);
}

/// Busy loop that never enters the port
fn spin(counter: &AtomicU32) {
    loop {
        counter.fetch_add(1, Ordering::SeqCst);
        std::hint::spin_loop();
    }
}

fn frozen(counter: &AtomicU32) -> bool {
    let first = counter.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(30));
    counter.load(Ordering::SeqCst) == first
}

#[cfg(unix)]
#[test]
fn test_switched_out_task_stops_without_port_calls() {
    let port = test_port();
    let policy = Arc::new(RoundRobin::new(1_000_000));
    let busy = Arc::new(AtomicU32::new(0));
    let other = Arc::new(AtomicU32::new(0));

    let first = {
        let busy = Arc::clone(&busy);
        port.create_task_thread("busy", move || spin(&busy)).unwrap()
    };
    let second = {
        let other = Arc::clone(&other);
        port.create_task_thread("other", move || spin(&other)).unwrap()
    };
    policy.add(first.clone(), 5).unwrap();
    policy.add(second.clone(), 5).unwrap();
    let dispatcher = run(&port, Arc::clone(&policy));

    assert!(wait_until(|| busy.load(Ordering::SeqCst) > 0));
    assert_eq!(other.load(Ordering::SeqCst), 0);

    port.yield_now();
    assert!(wait_until(|| other.load(Ordering::SeqCst) > 0));
    assert_eq!(port.current_task(), Some(second));
    assert_eq!(first.status(), ThreadStatus::Suspended);
    assert!(frozen(&busy));

    stop(&port, dispatcher);
}

#[cfg(unix)]
#[test]
fn test_delete_other_stops_running_task() {
    let port = test_port();
    let count = Arc::new(AtomicU32::new(0));
    let victim = {
        let count = Arc::clone(&count);
        port.create_task_thread("runaway", move || spin(&count)).unwrap()
    };
    let dispatcher = run(&port, Fixed::new(victim.clone()));

    assert!(wait_until(|| count.load(Ordering::SeqCst) > 0));
    assert_eq!(port.delete_other(&victim), Ok(()));
    assert_eq!(victim.status(), ThreadStatus::Deleted);
    assert!(!victim.is_valid());
    assert!(frozen(&count));

    stop(&port, dispatcher);
}

#[allow(unreachable_code)]
fn delete_me(port: &Port, policy: &RoundRobin, reached: &AtomicBool) {
    let me = this_task().unwrap();
    port.delete_self(&me, policy.yield_pending());
    reached.store(true, Ordering::SeqCst);
}

#[test]
fn test_delete_self_never_returns() {
    let port = test_port();
    let policy = Arc::new(RoundRobin::new(1_000));
    let reached = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let quitter = {
        let p = port.clone();
        let policy = Arc::clone(&policy);
        let reached = Arc::clone(&reached);
        port.create_task_thread("quitter", move || {
            delete_me(&p, &policy, &reached);
            idle()
        })
        .unwrap()
    };
    let survivor = port
        .create_task_thread("survivor", move || {
            tx.send(()).unwrap();
            idle()
        })
        .unwrap();

    policy.add(quitter.clone(), 5).unwrap();
    policy.add(survivor.clone(), 5).unwrap();
    let dispatcher = run(&port, Arc::clone(&policy));

    // The pended yield hands the processor to the survivor on the next tick
    rx.recv_timeout(TIMEOUT).unwrap();
    assert!(wait_until(|| quitter.status() == ThreadStatus::Deleted));
    assert!(!reached.load(Ordering::SeqCst));
    assert!(!quitter.is_valid());
    assert_eq!(port.current_task(), Some(survivor));

    // Handle already invalidated: cross-task deletion is a no-op
    assert_eq!(port.delete_other(&quitter), Ok(()));

    stop(&port, dispatcher);
}

#[test]
fn test_delete_other_terminates_target() {
    let port = test_port();
    let victim_ran = Arc::new(AtomicBool::new(false));

    let victim = {
        let ran = Arc::clone(&victim_ran);
        port.create_task_thread("victim", move || {
            ran.store(true, Ordering::SeqCst);
            idle()
        })
        .unwrap()
    };

    let (tx, rx) = mpsc::channel();
    let p = port.clone();
    let target = victim.clone();
    let killer = port
        .create_task_thread("killer", move || {
            let first = p.delete_other(&target);
            let second = p.delete_other(&target);
            let own = p.delete_other(&this_task().unwrap());
            tx.send((first, second, own, target.is_valid())).unwrap();
            idle()
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(killer));

    let (first, second, own, valid) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(own, Err(OsError::TaskDelSelf));
    assert!(!valid);
    assert_eq!(victim.status(), ThreadStatus::Deleted);
    assert!(!victim_ran.load(Ordering::SeqCst));

    stop(&port, dispatcher);
}

#[test]
fn test_single_core_host_refused() {
    let port = Port::new(PortConfig::new().processors(1));
    let ran = Arc::new(AtomicBool::new(false));
    let task = {
        let ran = Arc::clone(&ran);
        port.create_task_thread("never", move || ran.store(true, Ordering::SeqCst))
            .unwrap()
    };

    let selector = Fixed::new(task.clone());
    assert_eq!(port.start(Arc::clone(&selector)), Err(OsError::SingleCoreHost));
    assert_eq!(selector.selections(), 0);
    assert!(!port.is_running());

    thread::sleep(Duration::from_millis(20));
    assert_eq!(task.status(), ThreadStatus::Suspended);
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_tick_switches_between_tasks() {
    let port = test_port();
    let policy = Arc::new(RoundRobin::new(1));
    let counters: Vec<Arc<AtomicU32>> = (0..2).map(|_| Arc::new(AtomicU32::new(0))).collect();

    for (i, counter) in counters.iter().enumerate() {
        let counter = Arc::clone(counter);
        let task = port
            .create_task_thread(&format!("spinner-{}", i), move || loop {
                counter.fetch_add(1, Ordering::SeqCst);
                preemption_point();
                thread::sleep(Duration::from_micros(100));
            })
            .unwrap();
        policy.add(task, 5).unwrap();
    }

    let dispatcher = run(&port, Arc::clone(&policy));

    assert!(wait_until(|| counters
        .iter()
        .all(|c| c.load(Ordering::SeqCst) > 0)));
    assert!(policy.tick_get() > 0);

    stop(&port, dispatcher);
}

#[test]
fn test_yield_alternates_equal_tasks() {
    let port = test_port();
    let policy = Arc::new(RoundRobin::new(1_000_000));
    let log = Arc::new(Mutex::new(Vec::<char>::new()));

    for tag in ['a', 'b'] {
        let p = port.clone();
        let log = Arc::clone(&log);
        let task = port
            .create_task_thread(&tag.to_string(), move || loop {
                log.lock().unwrap().push(tag);
                p.yield_now();
            })
            .unwrap();
        policy.add(task, 5).unwrap();
    }

    let dispatcher = run(&port, Arc::clone(&policy));

    assert!(wait_until(|| log.lock().unwrap().len() >= 6));
    let seen: Vec<char> = log.lock().unwrap()[..6].to_vec();
    assert_eq!(seen, vec!['a', 'b', 'a', 'b', 'a', 'b']);

    stop(&port, dispatcher);
}

#[test]
fn test_end_scheduler_from_task() {
    let port = test_port();
    let reached = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let p = port.clone();
    let r = Arc::clone(&reached);
    let task = port
        .create_task_thread("stopper", move || {
            tx.send(()).unwrap();
            let _ = p.end_scheduler();
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();

    let dispatcher = run(&port, Fixed::new(task.clone()));

    rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(dispatcher.join().unwrap(), Ok(()));
    assert!(wait_until(|| task.status() == ThreadStatus::Deleted));
    assert!(!reached.load(Ordering::SeqCst));
}

#[test]
fn test_start_twice_refused() {
    let port = test_port();
    let (tx, rx) = mpsc::channel();
    let task = port
        .create_task_thread("only", move || {
            tx.send(()).unwrap();
            idle()
        })
        .unwrap();

    let selector = Fixed::new(task);
    let dispatcher = run(&port, Arc::clone(&selector));
    rx.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(port.start(selector), Err(OsError::OsRunning));

    stop(&port, dispatcher);
}
