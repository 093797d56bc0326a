extern crate core_affinity;
extern crate env_logger;
extern crate hp_lockfree;
#[macro_use]
extern crate log;

use hp_lockfree::{LockFreeQueue, LockFreeStack};
use std::env;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;
use std::time::Instant;

/// The two structures behind one interface so the same driver measures both.
trait Container: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn put(&self, v: i64);
    fn take(&self) -> Option<i64>;
    fn pending_retired(&self) -> usize;
}

impl Container for LockFreeQueue<i64> {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn put(&self, v: i64) {
        self.enqueue(v)
    }

    fn take(&self) -> Option<i64> {
        self.dequeue()
    }

    fn pending_retired(&self) -> usize {
        self.stats().retired_pending
    }
}

impl Container for LockFreeStack<i64> {
    fn name(&self) -> &'static str {
        "stack"
    }

    fn put(&self, v: i64) {
        self.push(v)
    }

    fn take(&self) -> Option<i64> {
        self.pop()
    }

    fn pending_retired(&self) -> usize {
        self.stats().retired_pending
    }
}

struct GlobalControl<C> {
    container: C,
    loop_cnt: i64,
    producer_cnt: AtomicI64,
    produced: AtomicI64,
    consumed: AtomicI64,
    tol_val: AtomicI64,
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
            debug!("set_cpu_affinity {} {}", idx, idx % cpus.len());
        }
    }
}

fn consumer_thread<C: Container>(global_control: Arc<GlobalControl<C>>, idx: usize) {
    set_cpu_affinity(idx);
    let mut ret = false;
    let mut tol = 0;
    let mut tol_val = 0;
    loop {
        if let Some(val) = global_control.container.take() {
            tol_val += val;
            tol += 1;
            if tol % 1024 == 0 {
                global_control.consumed.fetch_add(tol, Ordering::Relaxed);
                global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
                tol = 0;
                tol_val = 0;
            }
            ret = false;
        } else if global_control.producer_cnt.load(Ordering::Acquire) == 0 {
            if ret {
                break;
            } else {
                ret = true;
            }
        }
    }
    global_control.consumed.fetch_add(tol, Ordering::Relaxed);
    global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
}

fn producer_thread<C: Container>(global_control: Arc<GlobalControl<C>>, idx: usize) {
    set_cpu_affinity(idx);
    let mut tol = 0;
    for i in 0..global_control.loop_cnt {
        global_control.container.put(i);
        tol += 1;
        if i % 1024 == 0 {
            global_control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    global_control.produced.fetch_add(tol, Ordering::Relaxed);
    global_control.producer_cnt.fetch_sub(1, Ordering::Release);
}

fn debug_thread<C: Container>(global_control: Arc<GlobalControl<C>>) {
    while global_control.producer_cnt.load(Ordering::Acquire) != 0 {
        info!(
            "{} produced {} consumed {} retired {}",
            global_control.container.name(),
            global_control.produced.load(Ordering::Relaxed),
            global_control.consumed.load(Ordering::Relaxed),
            global_control.container.pending_retired()
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
}

fn run<C: Container>(container: C, producer_count: usize, consumer_count: usize, loop_cnt: i64) {
    let global_control = Arc::new(GlobalControl {
        container,
        loop_cnt,
        producer_cnt: AtomicI64::new(producer_count as i64),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        tol_val: AtomicI64::new(0),
    });
    let name = global_control.container.name();
    let start = Instant::now();

    let watch_thread = {
        let global_control = global_control.clone();
        thread::spawn(move || debug_thread(global_control))
    };
    let mut producer_threads = vec![];
    for idx in 0..producer_count {
        let global_control = global_control.clone();
        producer_threads.push(thread::spawn(move || producer_thread(global_control, idx)));
    }
    let mut consumer_threads = vec![];
    for idx in 0..consumer_count {
        let global_control = global_control.clone();
        consumer_threads.push(thread::spawn(move || {
            consumer_thread(global_control, producer_count + idx)
        }));
    }

    for t in producer_threads {
        t.join().unwrap();
    }
    info!("{} producer_threads joined", name);
    for t in consumer_threads {
        t.join().unwrap();
    }
    info!("{} consumer_threads joined", name);
    watch_thread.join().unwrap();

    let cost = start.elapsed();
    let produced = global_control.produced.load(Ordering::Relaxed);
    let consumed = global_control.consumed.load(Ordering::Relaxed);
    assert_eq!(produced, consumed);
    assert_eq!(
        global_control.tol_val.load(Ordering::Relaxed),
        producer_count as i64 * (loop_cnt - 1) * loop_cnt / 2
    );
    let ms = cost.as_secs() * 1000 + u64::from(cost.subsec_millis());
    println!(
        "{}: {} producers, {} consumers, {} items, {} ms, {:.0} ops/s",
        name,
        producer_count,
        consumer_count,
        produced,
        ms,
        (produced * 2) as f64 / cost.as_secs_f64()
    );
}

fn main() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids()
        .map(|ids| ids.len())
        .unwrap_or(2)
        .max(2)
        .min(16);
    let producer_count = (cpu_count + 1) / 2;
    let consumer_count = cpu_count - producer_count;
    let loop_cnt = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1_000_000i64);

    info!(
        "producer_count {} consumer_count {} loop_cnt {}",
        producer_count, consumer_count, loop_cnt
    );

    run(LockFreeQueue::new(), producer_count, consumer_count, loop_cnt);
    run(LockFreeStack::new(), producer_count, consumer_count, loop_cnt);
}
