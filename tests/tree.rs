use concurrent_rbtree::RbTree;

#[test]
fn insert_remove_interleaved() {
    let tree = RbTree::<u64>::default();

    for key in [3, 5, 15, 1, 2, 7, 50] {
        tree.insert(key);
        assert!(tree.contains(&key), "failed to find key {key} after insert");
    }
    assert_eq!(tree.len(), 7);
    assert_eq!(tree.check_invariants(), 7);

    for key in [2, 7, 3] {
        assert!(tree.remove(&key), "failed to remove key {key}");
        assert!(!tree.contains(&key), "key {key} still visible after removal");
    }

    assert_eq!(tree.sorted_keys(), vec![1, 5, 15, 50]);
    assert_eq!(tree.check_invariants(), 4);
    tree.assert_quiescent();
}

#[test]
fn removing_absent_keys_is_a_no_op() {
    let tree = RbTree::<u64>::default();

    assert!(!tree.remove(&10));

    tree.insert(1);
    tree.insert(3);
    let before = tree.sorted_keys();
    assert!(!tree.remove(&2));
    assert_eq!(tree.sorted_keys(), before);
    assert_eq!(tree.len(), 2);

    assert!(tree.remove(&1));
    assert!(tree.remove(&3));
    assert!(!tree.remove(&1));
    assert!(tree.is_empty());
    assert_eq!(tree.check_invariants(), 0);
    tree.assert_quiescent();
}

#[test]
fn duplicate_keys_unlink_one_at_a_time() {
    let tree = RbTree::<u64>::default();

    tree.insert(9);
    tree.insert(9);
    tree.insert(9);
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.sorted_keys(), vec![9, 9, 9]);
    assert_eq!(tree.check_invariants(), 3);

    assert!(tree.remove(&9));
    assert!(tree.remove(&9));
    assert!(tree.contains(&9));
    assert_eq!(tree.sorted_keys(), vec![9]);

    assert!(tree.remove(&9));
    assert!(!tree.remove(&9));
    assert!(tree.is_empty());
    tree.assert_quiescent();
}

#[test]
fn ascending_and_descending_fills() {
    let n: usize = 1024;

    let tree = RbTree::<usize>::default();

    for key in 0..n {
        tree.insert(key);
    }
    assert_eq!(tree.check_invariants(), n);
    assert_eq!(tree.sorted_keys(), (0..n).collect::<Vec<_>>());
    for key in 0..n {
        assert!(tree.remove(&key), "failed to remove key {key}");
    }
    assert_eq!(tree.check_invariants(), 0);
    tree.assert_quiescent();

    for key in (0..n).rev() {
        tree.insert(key);
    }
    assert_eq!(tree.check_invariants(), n);
    assert_eq!(tree.sorted_keys(), (0..n).collect::<Vec<_>>());
    for key in (0..n).rev() {
        assert!(tree.remove(&key), "failed to remove key {key}");
    }
    assert!(tree.is_empty());
    tree.assert_quiescent();
}

#[test]
fn random_against_model() {
    use rand::{thread_rng, Rng};

    let mut rng = thread_rng();
    let tree = RbTree::<u8>::default();
    let mut model = std::collections::BTreeMap::<u8, usize>::new();

    for _ in 0..64 {
        for _ in 0..1024 {
            let key = rng.gen::<u8>();
            if rng.gen_bool(0.5) {
                tree.insert(key);
                *model.entry(key).or_insert(0) += 1;
            } else {
                let expected = model.get(&key).copied().unwrap_or(0) > 0;
                assert_eq!(
                    tree.remove(&key),
                    expected,
                    "removal of key {key} disagreed with the model"
                );
                if expected {
                    let slot = model.get_mut(&key).unwrap();
                    *slot -= 1;
                    if *slot == 0 {
                        model.remove(&key);
                    }
                }
            }
            assert_eq!(tree.contains(&key), model.contains_key(&key));
        }

        let expected: Vec<u8> = model
            .iter()
            .flat_map(|(key, count)| std::iter::repeat(*key).take(*count))
            .collect();
        assert_eq!(tree.sorted_keys(), expected);
        assert_eq!(tree.check_invariants(), expected.len());
        assert_eq!(tree.len(), expected.len());
        tree.assert_quiescent();
    }
}
