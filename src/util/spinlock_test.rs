use rand::prelude::random;

use std::{
    sync::Arc,
    {thread, time},
};

use super::*;

#[test]
fn test_spinlock() {
    let c = Context { n_readers: 4, n_writers: 4, size: 1024 };
    let spin = Arc::new(Spinlock::new(Data::new(c.size)));

    let writer = |spin: Arc<Spinlock<Data>>, idx: usize, c: Context| {
        let mut ops = 0;
        let start = time::SystemTime::now();
        let value: Vec<u8> =
            ((idx * c.size)..((idx * c.size) + c.size)).map(|x| x as u8).collect();
        while start.elapsed().unwrap().as_millis() < 1000 {
            let mut data = spin.write();
            data.idx = idx;
            data.value.copy_from_slice(&value);
            ops += 1;
        }
        ops
    };

    let reader = |spin: Arc<Spinlock<Data>>, c: Context| {
        let values: Vec<Vec<u8>> = (0..c.n_writers)
            .map(|idx| {
                ((idx * c.size)..((idx * c.size) + c.size)).map(|x| x as u8).collect()
            })
            .collect();

        let mut ops = 0;
        let start = time::SystemTime::now();
        while start.elapsed().unwrap().as_millis() < 1000 {
            let data = spin.read();
            assert_eq!(values[data.idx], data.value);
            ops += 1;
            busy_loop(25);
        }
        ops
    };

    let mut writers = vec![];
    for idx in 0..c.n_writers {
        let (spin, c) = (Arc::clone(&spin), c.clone());
        writers.push(thread::spawn(move || writer(spin, idx, c)));
    }
    let mut readers = vec![];
    for _ in 0..c.n_readers {
        let (spin, c) = (Arc::clone(&spin), c.clone());
        readers.push(thread::spawn(move || reader(spin, c)));
    }

    for (i, w) in writers.into_iter().enumerate() {
        println!("writer {} ops {}", i, w.join().unwrap());
    }
    for (i, r) in readers.into_iter().enumerate() {
        println!("reader {} ops {}", i, r.join().unwrap());
    }
    println!("test_spinlock Spinlock {}", spin.to_stats().unwrap());
}

#[test]
fn test_spinlock_try_write_for() {
    let spin = Spinlock::new(10_u64);
    let timeout = time::Duration::from_millis(10);

    {
        let _r = spin.read();
        assert!(spin.try_write_for(timeout).is_none());
        // latch must be re-opened for readers after the writer gave up.
        let r2 = spin.read();
        assert_eq!(*r2, 10);
    }
    {
        let mut w = spin.try_write_for(timeout).unwrap();
        *w = 20;
    }
    assert_eq!(*spin.read(), 20);

    let stats = spin.to_stats().unwrap();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.latchlock, 0);
}

#[test]
fn test_spinlock_try_write_contended() {
    let spin = Arc::new(Spinlock::new(0_u64));
    let timeout = time::Duration::from_millis(10);

    {
        let _w = spin.write();
        assert!(spin.try_write_for(timeout).is_none());
        assert!(spin.try_write_for(timeout).is_none());
    }
    assert!(spin.try_write_for(timeout).is_some());

    let mut handles = vec![];
    for _ in 0..4 {
        let spin = Arc::clone(&spin);
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                *spin.write() += 1;
            }
        }));
    }
    handles.into_iter().for_each(|h| h.join().unwrap());
    assert_eq!(*spin.read(), 40_000);
    assert_eq!(spin.to_stats().unwrap().timeouts, 2);
}

struct Data {
    idx: usize,
    value: Vec<u8>,
}

impl Data {
    fn new(size: usize) -> Data {
        let value: Vec<u8> = (0..size).map(|x| x as u8).collect();
        Data { idx: 0, value }
    }
}

#[derive(Clone)]
struct Context {
    n_readers: usize,
    n_writers: usize,
    size: usize,
}

fn busy_loop(count: usize) -> u64 {
    let acc: u64 = (0..count).map(|_| random::<u32>() as u64).sum();
    acc
}
