//! Property-Based Tests for the Cache Segment
//!
//! Drives a segment with random operation sequences and checks it against a
//! plain recency-ordered model.

use proptest::prelude::*;
use std::collections::{HashMap, VecDeque};

use crate::cache::{segment_size, Segment};
use crate::record::{self, Record};

// == Strategies ==
/// Small key space so sequences revisit keys
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-f]{1,2}".prop_map(|s| s)
}

fn value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{0,32}".prop_map(|s| s)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Insert { key: String, value: String },
    Lookup { key: String },
    Remove { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (key_strategy(), value_strategy())
            .prop_map(|(key, value)| CacheOp::Insert { key, value }),
        2 => key_strategy().prop_map(|key| CacheOp::Lookup { key }),
        1 => key_strategy().prop_map(|key| CacheOp::Remove { key }),
    ]
}

// == Model ==
/// Front = most recent
#[derive(Default)]
struct Model {
    order: VecDeque<String>,
    values: HashMap<String, String>,
}

impl Model {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_front(key.to_string());
    }

    fn insert(&mut self, key: &str, value: &str, capacity: usize) -> Option<String> {
        let mut evicted = None;
        if !self.values.contains_key(key) && self.values.len() >= capacity {
            if let Some(oldest) = self.order.pop_back() {
                self.values.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.values.insert(key.to_string(), value.to_string());
        self.touch(key);
        evicted
    }
}

fn rec(key: &str, value: &str) -> Record {
    Record::new(key, value, record::now()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Every operation sequence leaves the segment in the same state as the
    // model: same values, same recency order, same evictions.
    #[test]
    fn prop_matches_recency_model(
        capacity in 1usize..6,
        ops in prop::collection::vec(cache_op_strategy(), 1..80)
    ) {
        let mut buf = vec![0u8; segment_size(capacity)];
        let mut segment = Segment::format(&mut buf, capacity).unwrap();
        let mut model = Model::default();

        for op in ops {
            match op {
                CacheOp::Insert { key, value } => {
                    let evicted = segment.touch_or_insert(&rec(&key, &value));
                    prop_assert_eq!(evicted, model.insert(&key, &value, capacity));
                }
                CacheOp::Lookup { key } => {
                    let found = segment.lookup(&key).map(|r| r.value);
                    let expected = model.values.get(&key).cloned();
                    if expected.is_some() {
                        model.touch(&key);
                    }
                    prop_assert_eq!(found, expected);
                }
                CacheOp::Remove { key } => {
                    let existed = segment.remove(&key);
                    let expected = model.values.remove(&key).is_some();
                    model.order.retain(|k| k != &key);
                    prop_assert_eq!(existed, expected);
                }
            }
            prop_assert!(segment.len() <= capacity);
            prop_assert_eq!(segment.len(), model.values.len());
        }

        let order: Vec<String> = model.order.iter().cloned().collect();
        prop_assert_eq!(segment.keys_by_recency(), order);
    }

    // Filling past capacity evicts exactly the least recently touched key.
    #[test]
    fn prop_evicts_least_recent(
        capacity in 2usize..10,
        touch in 0usize..10
    ) {
        let touch = touch % capacity;
        let mut buf = vec![0u8; segment_size(capacity)];
        let mut segment = Segment::format(&mut buf, capacity).unwrap();

        let keys: Vec<String> = (0..capacity).map(|i| format!("key{}", i)).collect();
        for key in &keys {
            segment.touch_or_insert(&rec(key, "v"));
        }
        segment.lookup(&keys[touch]);

        let expected = if touch == 0 { &keys[1] } else { &keys[0] };
        let evicted = segment.touch_or_insert(&rec("new", "v"));
        prop_assert_eq!(evicted.as_ref(), Some(expected));
        prop_assert!(segment.lookup(&keys[touch]).is_some());
        prop_assert!(segment.lookup(expected).is_none());
    }

    // A removed key is never returned again until it is reinserted.
    #[test]
    fn prop_remove_is_complete(
        keys in prop::collection::vec(key_strategy(), 1..20),
        victim in key_strategy()
    ) {
        let mut buf = vec![0u8; segment_size(8)];
        let mut segment = Segment::format(&mut buf, 8).unwrap();

        for key in &keys {
            segment.touch_or_insert(&rec(key, "v"));
        }
        segment.remove(&victim);

        prop_assert!(segment.lookup(&victim).is_none());
        prop_assert!(!segment.keys_by_recency().contains(&victim));
    }
}
