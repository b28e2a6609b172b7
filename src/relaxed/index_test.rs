use arbitrary::{unstructured::Unstructured, Arbitrary};
use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{collections::BTreeSet, sync::mpsc, thread};

use super::*;

fn to_values(index: &Index<u64>) -> Vec<u64> {
    let mut values = vec![];
    index.in_order_walk(|value| values.push(*value)).unwrap();
    values
}

#[test]
fn test_index_basic() {
    let index: Index<u64> = Index::new("test_index_basic").unwrap();
    assert_eq!(index.to_name(), "test_index_basic");

    for value in [5, 3, 8].iter() {
        assert!(index.insert(*value).unwrap());
    }
    assert_eq!(to_values(&index), vec![3, 5, 8]);
    assert!(!index.find(&4).unwrap());
    assert!(index.find(&3).unwrap());
    assert!(!index.insert(3).unwrap());
    assert_eq!(index.len(), 3);

    assert!(index.remove(&5).unwrap());
    assert!(!index.remove(&5).unwrap());
    assert!(!index.find(&5).unwrap());
    assert_eq!(to_values(&index), vec![3, 8]);
    assert_eq!(index.len(), 2);

    assert!(index.shutdown().unwrap());
    index.validate().unwrap();
    // tree is still usable, later calls to shutdown are no-op.
    assert!(index.find(&8).unwrap());
    assert!(index.shutdown().unwrap());
}

#[test]
fn test_index_empty() {
    let index: Index<u64> = Index::new("test_index_empty").unwrap();
    assert!(index.is_empty());
    assert_eq!(index.height().unwrap(), 0);
    assert!(!index.find(&10).unwrap());
    assert!(!index.remove(&10).unwrap());
    assert_eq!(to_values(&index), Vec::<u64>::new());
    index.validate().unwrap();

    assert!(index.insert(10).unwrap());
    assert_eq!(index.height().unwrap(), 1);
    assert!(index.remove(&10).unwrap());
    assert!(index.is_empty());
    assert_eq!(index.height().unwrap(), 0);

    assert!(index.insert(20).unwrap());
    assert!(index.insert(10).unwrap());
    assert_eq!(index.height().unwrap(), 2);
    assert!(index.wait_quiescent(Duration::from_secs(10)).unwrap());
    index.validate().unwrap();
}

#[test]
fn test_index_reuse() {
    let mut config = Config::new("test_index_reuse");
    // always defer the unlink to the balancer.
    config.set_remove_restarts(0);
    let inner: Inner<u64> = Inner::new(config).unwrap();
    let (tx, rx) = mpsc::channel();
    inner.set_tx(Tx::N(tx)).unwrap();

    for value in [1, 2, 3].iter() {
        assert!(inner.do_insert(*value).unwrap());
    }
    assert!(inner.do_remove(&2).unwrap());
    assert!(!inner.do_find(&2).unwrap());
    assert!(!inner.do_remove(&2).unwrap());
    assert_eq!(inner.counters.deferrals.load(SeqCst), 1);
    assert!(matches!(rx.try_recv(), Ok((Msg::Request(_), None))));

    // leaf pending removal is revived.
    assert!(inner.do_insert(2).unwrap());
    assert!(inner.do_find(&2).unwrap());
    assert_eq!(inner.counters.reuses.load(SeqCst), 1);
    assert_eq!(inner.n_count.load(SeqCst), 3);
    inner.validate().unwrap();
}

#[test]
fn test_index_config() {
    let mut config = Config::new("test_index_config");
    config.set_lock_timeout(Duration::from_secs(0));
    match Index::<u64>::from_config(config) {
        Err(Error::InvalidInput(_, _)) => (),
        Err(err) => panic!("unexpected {}", err),
        Ok(_) => panic!("expected InvalidInput"),
    }

    let mut config = Config::new("test_index_config");
    config.set_chan_size(Some(4)).set_slab_size(16);
    let index: Index<u64> = Index::from_config(config).unwrap();
    for value in 0..1000 {
        index.insert(value).unwrap();
    }
    assert!(index.shutdown().unwrap());
    index.validate().unwrap();
    assert_eq!(to_values(&index), (0..1000).collect::<Vec<u64>>());
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    Insert(u16),
    Remove(u16),
    Find(u16),
}

#[test]
fn test_index_ops() {
    let seed: u64 = random();
    println!("test_index_ops seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let index: Index<u64> = Index::new("test_index_ops").unwrap();
    let mut refs = BTreeSet::new();

    let n_ops = 20_000;
    for i in 0..n_ops {
        let bytes = rng.gen::<[u8; 32]>();
        let mut uns = Unstructured::new(&bytes);
        let op: Op = uns.arbitrary().unwrap();
        match op {
            Op::Insert(value) => {
                let value = u64::from(value % 2048);
                assert_eq!(index.insert(value).unwrap(), refs.insert(value), "{}", i);
            }
            Op::Remove(value) => {
                let value = u64::from(value % 2048);
                assert_eq!(index.remove(&value).unwrap(), refs.remove(&value), "{}", i);
            }
            Op::Find(value) => {
                let value = u64::from(value % 2048);
                assert_eq!(index.find(&value).unwrap(), refs.contains(&value), "{}", i);
            }
        }
        if i % 5000 == 0 {
            assert!(index.wait_quiescent(Duration::from_secs(10)).unwrap());
            index.validate().unwrap();
        }
    }

    assert!(index.wait_quiescent(Duration::from_secs(10)).unwrap());
    index.validate().unwrap();
    assert_eq!(index.len(), refs.len());
    assert_eq!(to_values(&index), refs.iter().copied().collect::<Vec<u64>>());

    let stats = index.to_stats().unwrap();
    println!("{}", stats);
    assert_eq!(stats.n_count, refs.len());
    assert!(stats.blacks.is_some());
    assert_eq!(stats.n_dropped, 0);
    let depths = stats.depths.unwrap();
    assert_eq!(depths.to_samples(), refs.len());
    assert!(depths.to_max() <= index.height().unwrap());

    assert!(index.shutdown().unwrap());
}

#[test]
fn test_index_concurrent() {
    let seed: u64 = random();
    println!("test_index_concurrent seed:{}", seed);

    let (n_threads, n_ops, n_keys) = (8_u64, 10_000, 1000_usize);
    let index: Arc<Index<u64>> = Arc::new(Index::new("test_index_concurrent").unwrap());

    let mut handles = vec![];
    for id in 0..n_threads {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(id));
            // successful inserts minus successful removes, per key.
            let mut deltas = vec![0_i64; n_keys];
            for _ in 0..n_ops {
                let key = rng.gen::<usize>() % n_keys;
                let value = key as u64;
                match rng.gen::<u8>() % 3 {
                    0 if index.insert(value).unwrap() => deltas[key] += 1,
                    1 if index.remove(&value).unwrap() => deltas[key] -= 1,
                    0 | 1 => (),
                    _ => {
                        index.find(&value).unwrap();
                    }
                }
            }
            deltas
        }));
    }

    let mut deltas = vec![0_i64; n_keys];
    for handle in handles.into_iter() {
        for (key, delta) in handle.join().unwrap().into_iter().enumerate() {
            deltas[key] += delta;
        }
    }

    assert!(index.shutdown().unwrap());
    index.validate().unwrap();

    // every key alternates between absent and present, starting absent.
    let values = to_values(&index);
    for (key, delta) in deltas.into_iter().enumerate() {
        let present = values.binary_search(&(key as u64)).is_ok();
        assert_eq!(delta, if present { 1 } else { 0 }, "key:{}", key);
        assert_eq!(index.find(&(key as u64)).unwrap(), present, "key:{}", key);
    }
    for w in values.windows(2) {
        assert!(w[0] < w[1], "{:?}", w);
    }
    assert_eq!(index.len(), values.len());

    let stats = index.to_stats().unwrap();
    println!("{}", stats);
    assert_eq!(stats.n_count, values.len());
    assert_eq!(stats.depths.unwrap().to_samples(), values.len());
}

#[test]
fn test_index_submit_concurrent() {
    let inner: Arc<Inner<u64>> = Arc::new(Inner::new(Config::new("test_submit")).unwrap());
    let (tx, rx) = mpsc::channel();
    inner.set_tx(Tx::N(tx)).unwrap();

    let (n_threads, n_submits) = (4, 1000);
    let mut handles = vec![];
    for id in 0..n_threads {
        let inner = Arc::clone(&inner);
        handles.push(thread::spawn(move || {
            for gen in 0..n_submits {
                inner.submit(Handle { idx: id, gen });
            }
        }));
    }
    handles.into_iter().for_each(|h| h.join().unwrap());

    let n = rx.try_iter().count();
    assert_eq!(n, n_threads * (n_submits as usize));
    assert_eq!(inner.counters.submitted.load(SeqCst), n);
    assert_eq!(inner.counters.dropped.load(SeqCst), 0);

    // submits after the channel is taken away are dropped.
    inner.close_tx();
    inner.submit(Handle { idx: ROOT, gen: 0 });
    assert_eq!(inner.counters.dropped.load(SeqCst), 1);
}

#[test]
fn test_index_shutdown() {
    let index: Index<u64> = Index::new("test_index_shutdown").unwrap();
    for value in 0..100 {
        index.insert(value).unwrap();
    }
    assert!(index.shutdown().unwrap());
    assert!(index.wait_quiescent(Duration::from_millis(10)).unwrap());

    // writes after shutdown are not rebalanced.
    for value in 100..1000 {
        index.insert(value).unwrap();
    }
    let stats = index.to_stats().unwrap();
    assert!(stats.n_dropped > 0);
    assert!(stats.blacks.is_none());
    assert_eq!(to_values(&index), (0..1000).collect::<Vec<u64>>());
}

#[test]
fn test_index_poison() {
    let index: Index<u64> = Index::new("test_index_poison").unwrap();
    index.insert(10).unwrap();

    let res: Result<()> = err_at!(Fatal, msg: "simulated");
    assert!(index.inner.poison(res).is_err());
    match index.insert(20) {
        Err(Error::Fatal(_, msg)) => assert_eq!(msg, "simulated"),
        res => panic!("unexpected {:?}", res),
    }
    assert!(index.find(&10).is_err());
    assert!(index.validate().is_err());
}
