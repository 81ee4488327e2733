use std::thread::scope;
use std::time::Instant;

use concurrent_rbtree::RbTree;

const PRODUCERS: usize = 64;
const CONSUMERS: usize = 64;
const N: usize = 1024 * 1024;
const PRODUCER_N: usize = N / PRODUCERS;
const CONSUMER_N: usize = N / CONSUMERS;

fn producer(tree: RbTree<usize, 256, 128>, min: usize, max: usize) {
    for key in min..max {
        tree.insert(key);
    }
}

fn consumer(tree: RbTree<usize, 256, 128>, min: usize, max: usize) {
    for key in min..max {
        // the producer covering this range may not have gotten here yet
        while !tree.remove(&key) {
            std::hint::spin_loop();
        }
    }
}

fn main() {
    let tree: RbTree<usize, 256, 128> = RbTree::default();

    let before = Instant::now();
    scope(|s| {
        let mut handles = vec![];

        for i in 0..PRODUCERS {
            let min = i * PRODUCER_N;
            let max = (i + 1) * PRODUCER_N;
            let tree = tree.clone();
            let handle = s.spawn(move || producer(tree, min, max));
            handles.push(handle);
        }

        for i in 0..CONSUMERS {
            let min = i * CONSUMER_N;
            let max = (i + 1) * CONSUMER_N;
            let tree = tree.clone();
            let handle = s.spawn(move || consumer(tree, min, max));
            handles.push(handle);
        }

        for handle in handles.into_iter() {
            handle.join().unwrap()
        }
    });

    let elapsed = before.elapsed();

    let per_second = N as u128 * 1000 / elapsed.as_millis();

    println!(
        "with {} producers and {} consumers, took {:?} to pass {} keys through the tree ({} per second)",
        PRODUCERS, CONSUMERS, elapsed, N, per_second
    );

    assert!(tree.is_empty());
    tree.assert_quiescent();
}
