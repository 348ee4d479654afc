//! Round Robin Example - two equal-priority tasks sharing the host simulation
//!
//! Each task counts and prints; the tick switches between them once its time
//! quanta expires. A third task of the same priority stops the scheduler
//! after a while.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hostsim::task::preemption_point;
use hostsim::{Port, PortConfig, RoundRobin};

// ============ Logger ============

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let name = thread::current().name().unwrap_or("main").to_owned();
            // Masked, so no task is switched out holding stderr
            critical_section::with(|_| {
                eprintln!("[{:<5} {}] {}", record.level(), name, record.args());
            });
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

// ============ Tasks ============

fn counter_task(tag: &'static str, count: Arc<AtomicU32>) {
    hostsim::info!("{} task started", tag);
    loop {
        let n = count.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 50 == 0 {
            hostsim::info!("{} at {}", tag, n);
        }
        thread::sleep(Duration::from_millis(1));
        preemption_point();
    }
}

// ============ Main ============

fn main() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(log::LevelFilter::Info);

    let port = Port::new(
        PortConfig::new()
            .tick_period(Duration::from_millis(5))
            .min_block_time(Duration::from_millis(1)),
    );
    let policy = Arc::new(RoundRobin::new(4));

    let counts: Vec<Arc<AtomicU32>> = (0..2).map(|_| Arc::new(AtomicU32::new(0))).collect();
    for (tag, count) in ["ping", "pong"].into_iter().zip(counts.iter().cloned()) {
        let task = port
            .create_task_thread(tag, move || counter_task(tag, count))
            .expect("task creation failed");
        policy.add(task, 5).expect("invalid priority");
    }

    let stopper = {
        let p = port.clone();
        let rr = Arc::clone(&policy);
        port.create_task_thread("stopper", move || {
            while rr.tick_get() < 200 {
                thread::sleep(Duration::from_millis(5));
                preemption_point();
            }
            hostsim::info!("stopping after {} ticks", rr.tick_get());
            let _ = p.end_scheduler();
        })
        .expect("task creation failed")
    };
    policy.add(stopper, 5).expect("invalid priority");

    match port.start(policy) {
        Ok(()) => {
            let [ping, pong] = [&counts[0], &counts[1]].map(|c| c.load(Ordering::Relaxed));
            println!("ping ran {} times, pong ran {} times", ping, pong);
        }
        Err(err) => eprintln!("scheduler refused to start: {}", err),
    }
}
