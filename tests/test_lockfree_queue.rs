extern crate core_affinity;
extern crate env_logger;
extern crate hp_lockfree;
#[macro_use]
extern crate log;

use hp_lockfree::config::Config;
use hp_lockfree::lockfree_queue::LockFreeQueue;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time;

const PRODUCER_COUNT: u64 = 4;
const CONSUMER_COUNT: u64 = 4;

#[derive(Debug)]
struct QueueValue {
    producer: u64,
    seq: u64,
    sum: u64,
}

struct GlobalConf {
    queue: LockFreeQueue<QueueValue>,
    loop_cnt: u64,
    producer_cnt: AtomicI64,
    produced: AtomicUsize,
    consumed: AtomicUsize,
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
            debug!("set_cpu_affinity {} {}", idx, idx % cpus.len());
        }
    }
}

fn producer_thread(global_conf: Arc<GlobalConf>, producer: u64) {
    set_cpu_affinity(producer as usize);
    let mut tol = 0;
    for seq in 0..global_conf.loop_cnt {
        global_conf.queue.enqueue(QueueValue {
            producer,
            seq,
            sum: producer + seq,
        });
        tol += 1;
        if tol % 512 == 0 {
            global_conf.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    global_conf.produced.fetch_add(tol, Ordering::Relaxed);
    global_conf.producer_cnt.fetch_sub(1, Ordering::Release);
}

fn consumer_thread(global_conf: Arc<GlobalConf>, idx: u64) -> Vec<(u64, u64)> {
    set_cpu_affinity((PRODUCER_COUNT + idx) as usize);
    let mut got = vec![];
    let mut last_seq = vec![None; PRODUCER_COUNT as usize];
    let mut ret = false;
    loop {
        if let Some(v) = global_conf.queue.dequeue() {
            assert_eq!(v.producer + v.seq, v.sum);
            // values of one producer come out in the order they went in
            let last = &mut last_seq[v.producer as usize];
            if let Some(prev) = *last {
                assert!(prev < v.seq, "{:?} after seq {}", v, prev);
            }
            *last = Some(v.seq);
            got.push((v.producer, v.seq));
            if got.len() % 512 == 0 {
                global_conf.consumed.fetch_add(512, Ordering::Relaxed);
            }
            ret = false;
        } else if global_conf.producer_cnt.load(Ordering::Acquire) == 0 {
            if ret {
                break;
            } else {
                ret = true;
            }
        }
    }
    global_conf
        .consumed
        .fetch_add(got.len() % 512, Ordering::Relaxed);
    got
}

fn debug_thread(global_conf: Arc<GlobalConf>) {
    while global_conf.producer_cnt.load(Ordering::Acquire) != 0 {
        info!(
            "debug_thread produced {} consumed {} stats {:?}",
            global_conf.produced.load(Ordering::Relaxed),
            global_conf.consumed.load(Ordering::Relaxed),
            global_conf.queue.stats()
        );
        thread::sleep(time::Duration::from_millis(200));
    }
}

#[test]
fn test_multi_threads() {
    let _ = env_logger::try_init();

    let loop_cnt = 150_000;
    let global_conf = Arc::new(GlobalConf {
        queue: LockFreeQueue::new(),
        loop_cnt,
        producer_cnt: AtomicI64::new(PRODUCER_COUNT as i64),
        produced: AtomicUsize::new(0),
        consumed: AtomicUsize::new(0),
    });

    let watch_thread = {
        let global_conf = global_conf.clone();
        thread::spawn(move || debug_thread(global_conf))
    };

    let mut producer_threads = vec![];
    for p in 0..PRODUCER_COUNT {
        let global_conf = global_conf.clone();
        producer_threads.push(thread::spawn(move || producer_thread(global_conf, p)));
    }
    let mut consumer_threads = vec![];
    for c in 0..CONSUMER_COUNT {
        let global_conf = global_conf.clone();
        consumer_threads.push(thread::spawn(move || consumer_thread(global_conf, c)));
    }

    for t in producer_threads {
        t.join().unwrap();
    }
    info!("producer_threads joined");

    let mut all = vec![];
    for t in consumer_threads {
        all.extend(t.join().unwrap());
    }
    info!("consumer_threads joined");
    watch_thread.join().unwrap();

    assert_eq!(
        global_conf.produced.load(Ordering::Relaxed),
        global_conf.consumed.load(Ordering::Relaxed)
    );
    all.sort_unstable();
    let expect: Vec<_> = (0..PRODUCER_COUNT)
        .flat_map(|p| (0..loop_cnt).map(move |s| (p, s)))
        .collect();
    assert_eq!(all.len(), expect.len());
    assert!(all == expect, "values lost or duplicated");
    assert!(global_conf.queue.is_empty());

    let stats = global_conf.queue.stats();
    info!("final stats {:?}, live nodes {}", stats, global_conf.queue.live_nodes());
    assert_eq!(stats.registered, 0);
    assert_eq!(
        global_conf.queue.live_nodes(),
        1 + stats.retired_pending,
        "every node is either the dummy or waiting in a retire list"
    );
}

#[test]
fn test_mixed_small_arena() {
    let _ = env_logger::try_init();

    let config = Config::default()
        .with_max_nodes(1024)
        .with_scan_threshold(2, 16);
    let queue = Arc::new(LockFreeQueue::with_config(config).unwrap());
    let dropped = Arc::new(AtomicUsize::new(0));

    struct Counted(u64, Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.1.fetch_add(1, Ordering::Relaxed);
        }
    }

    let mut threads = vec![];
    for t in 0..4u64 {
        let queue = queue.clone();
        let dropped = dropped.clone();
        threads.push(thread::spawn(move || {
            set_cpu_affinity(t as usize);
            let mut sum = 0;
            for i in 0..125_000u64 {
                queue.enqueue(Counted(t * 1_000_000 + i, dropped.clone()));
                if let Some(v) = queue.dequeue() {
                    sum += v.0;
                }
            }
            sum
        }));
    }
    let mut sum: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
    while let Some(v) = queue.dequeue() {
        sum += v.0;
    }
    let expect: u64 = (0..4u64)
        .map(|t| (0..125_000u64).map(|i| t * 1_000_000 + i).sum::<u64>())
        .sum();
    assert_eq!(sum, expect);
    assert_eq!(dropped.load(Ordering::Relaxed), 500_000);
    assert!(queue.live_nodes() <= 1024);
}

#[test]
fn test_enqueue_after_empty_dequeue() {
    let _ = env_logger::try_init();

    let rounds = 1_000u64;
    let queue = Arc::new(LockFreeQueue::new());
    let (empty_tx, empty_rx) = mpsc::channel::<u64>();
    let (pushed_tx, pushed_rx) = mpsc::channel::<u64>();

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            set_cpu_affinity(0);
            for round in 0..rounds {
                assert_eq!(queue.dequeue(), None);
                assert!(queue.is_empty());
                empty_tx.send(round).unwrap();
                let pushed = pushed_rx.recv().unwrap();
                assert!(!queue.is_empty());
                assert_eq!(queue.dequeue(), Some(pushed));
            }
        })
    };
    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            set_cpu_affinity(1);
            for round in empty_rx.iter() {
                queue.enqueue(round);
                pushed_tx.send(round).unwrap();
            }
        })
    };

    consumer.join().unwrap();
    producer.join().unwrap();
    assert_eq!(queue.dequeue(), None);
    // the dummy plus nodes waiting in retire lists
    assert_eq!(queue.live_nodes(), 1 + queue.stats().retired_pending);
}
