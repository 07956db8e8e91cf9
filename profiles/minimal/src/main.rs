//! # unisched Minimal Profile
//!
//! Boots the scheduler on every host CPU and runs a small workload that
//! touches each subsystem: a semaphore-driven producer/consumer pair, a
//! per-CPU counter fed from pinned threads, and a per-CPU worker item.

use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use unisched_execution::{cpu, thread};
use unisched_execution::{
    Attr, PercpuCounter, SchedConfig, SchedResult, Semaphore, Thread, WorkerItem,
};
use unisched_hal::console;

const ITEMS: u32 = 16;
const INCREMENTS: u64 = 1000;

fn producer_consumer() -> SchedResult<()> {
    let slots = Arc::new(Semaphore::new(4));
    let filled = Arc::new(Semaphore::new(0));

    let (s, f) = (slots.clone(), filled.clone());
    let producer = Thread::new(
        move || {
            for i in 0..ITEMS {
                s.wait(1, None);
                log::debug!("produced {}", i);
                f.post(1);
            }
        },
        Attr::new().name("producer"),
    )?;

    let (s, f) = (slots.clone(), filled.clone());
    let consumer = Thread::new(
        move || {
            let mut consumed = 0;
            while consumed < ITEMS {
                if f.wait_timeout(1, Duration::from_millis(500)) {
                    consumed += 1;
                    s.post(1);
                } else {
                    log::warn!("consumer: timed out after {} items", consumed);
                }
            }
        },
        Attr::new().name("consumer").priority(0.5),
    )?;

    producer.start()?;
    consumer.start()?;
    producer.join();
    consumer.join();
    log::info!("producer/consumer: {} items, {} free slots", ITEMS, slots.value());
    for t in [&producer, &consumer] {
        log::debug!(
            "  '{}' at priority {}: {} ns on cpu, runtime {}",
            t.name(),
            t.priority(),
            t.stats().cpu_time.get(),
            t.runtime()
        );
    }
    Ok(())
}

fn percpu_counter() -> SchedResult<()> {
    let counter = Arc::new(PercpuCounter::try_new()?);
    let mut threads = Vec::new();
    for cpu in cpu::cpus() {
        let c = counter.clone();
        let t = Thread::new(
            move || {
                for _ in 0..INCREMENTS {
                    c.increment();
                }
            },
            Attr::new().pin(cpu.id()),
        )?;
        t.start()?;
        threads.push(t);
    }
    for t in &threads {
        t.join();
    }
    log::info!(
        "percpu counter: {} (expected {})",
        counter.read(),
        INCREMENTS * threads.len() as u64
    );
    Ok(())
}

fn worker_dispatch() {
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let item = WorkerItem::register(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });

    let cpus = cpu::cpus();
    for cpu in cpus {
        item.signal(cpu);
    }
    // Workers run asynchronously; give them a moment.
    Thread::sleep(Duration::from_millis(50));
    log::info!(
        "workers: {} of {} cpus ran the item",
        runs.load(Ordering::SeqCst),
        cpus.len()
    );
}

fn run() -> SchedResult<()> {
    let level = if cfg!(feature = "verbose") {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    };
    console::init(level)?;
    unisched_execution::init(SchedConfig::default())?;

    producer_consumer()?;
    percpu_counter()?;
    worker_dispatch();

    for cpu in cpu::cpus() {
        log::info!(
            "cpu{}: {} switches, {} preemptions",
            cpu.id(),
            cpu.stats().switches.get(),
            cpu.stats().preemptions.get()
        );
    }
    log::info!("{} live threads", thread::count());
    for t in thread::snapshot() {
        log::debug!("  thread {} '{}' on cpu{}: {}", t.id(), t.name(), t.cpu_id(), t.status());
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("unisched-minimal: {}", err);
        process::exit(1);
    }
}
