#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate concurrent_rbtree;

fuzz_target!(|data: Vec<u64>| {
    let mut expected = data.clone();
    expected.sort_unstable();

    {
        let tree = concurrent_rbtree::RbTree::<u64, 2, 4>::default();

        for item in &data {
            tree.insert(*item);
        }

        assert_eq!(tree.check_invariants(), expected.len());
        assert_eq!(tree.sorted_keys(), expected);

        for item in &data {
            assert!(tree.remove(item));
        }

        assert_eq!(tree.check_invariants(), 0);
        tree.assert_quiescent();
    }
    {
        let tree = concurrent_rbtree::RbTree::<u64, 2, 7>::default();

        for item in &data {
            tree.insert(*item);
        }

        assert_eq!(tree.check_invariants(), expected.len());
        assert_eq!(tree.sorted_keys(), expected);

        for item in data.iter().rev() {
            assert!(tree.remove(item));
        }

        assert_eq!(tree.check_invariants(), 0);
        tree.assert_quiescent();
    }
});
