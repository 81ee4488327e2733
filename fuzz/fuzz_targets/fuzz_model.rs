#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate concurrent_rbtree;

use arbitrary::Arbitrary;

const KEYSPACE: u64 = 128;

#[derive(Debug)]
enum Op {
    Insert { key: u64 },
    Remove { key: u64 },
    Contains { key: u64 },
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(if u.ratio(1, 2)? {
            Op::Insert {
                key: u.int_in_range(0..=KEYSPACE)?,
            }
        } else if u.ratio(1, 2)? {
            Op::Remove {
                key: u.int_in_range(0..=KEYSPACE)?,
            }
        } else {
            Op::Contains {
                key: u.int_in_range(0..=KEYSPACE)?,
            }
        })
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let tree = concurrent_rbtree::RbTree::<u64, 2, 8>::default();
    let mut model = std::collections::BTreeMap::<u64, usize>::new();

    for op in ops {
        match op {
            Op::Insert { key } => {
                tree.insert(key);
                *model.entry(key).or_insert(0) += 1;
            }
            Op::Remove { key } => {
                let expected = if let Some(count) = model.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        model.remove(&key);
                    }
                    true
                } else {
                    false
                };
                assert_eq!(tree.remove(&key), expected);
            }
            Op::Contains { key } => {
                assert_eq!(tree.contains(&key), model.contains_key(&key));
            }
        };

        let population: usize = model.values().sum();
        assert_eq!(tree.check_invariants(), population);
        tree.assert_quiescent();
    }

    let expected: Vec<u64> = model
        .iter()
        .flat_map(|(key, count)| std::iter::repeat(*key).take(*count))
        .collect();
    assert_eq!(tree.sorted_keys(), expected);
    tree.assert_quiescent();
});
