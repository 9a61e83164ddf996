#![cfg(test)]

// Property tests for SlotStore kept inside the crate so they can reach
// the internal structural layer directly.

use crate::slot_store::{SlotId, SlotStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::hash_map::RandomState;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{BuildHasher, Hasher};

#[derive(Clone, Debug)]
enum Op {
    // Take a slot for the key; revives it if idle.
    Acquire(usize),
    // Park a busy slot on the idle list and sweep.
    Release(usize),
    SetLimit(usize),
    Find(usize),
}

fn arb_scenario() -> impl Strategy<Value = (usize, usize, Vec<Op>)> {
    (1usize..=8, 0usize..=4).prop_flat_map(|(keys, limit)| {
        let op = prop_oneof![
            3 => (0..keys).prop_map(Op::Acquire),
            3 => (0..keys).prop_map(Op::Release),
            1 => (0usize..=4).prop_map(Op::SetLimit),
            1 => (0..keys).prop_map(Op::Find),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (keys, limit, ops))
    })
}

fn key(i: usize) -> String {
    format!("k{}", i)
}

// Model: busy keys, idle keys oldest first, and the value each live key
// was created with (a per-key generation so revival vs. recreation is
// observable).
fn run<S: BuildHasher>(
    mut sut: SlotStore<String, u32, S>,
    limit: usize,
    ops: Vec<Op>,
) -> Result<(), TestCaseError> {
    let mut limit = limit;
    let mut busy: BTreeSet<usize> = BTreeSet::new();
    let mut idle: VecDeque<usize> = VecDeque::new();
    let mut ids: HashMap<usize, SlotId> = HashMap::new();
    let mut generation: HashMap<usize, u32> = HashMap::new();
    let mut created: HashMap<usize, u32> = HashMap::new();
    let mut stale: Vec<SlotId> = Vec::new();

    fn sweep_model(
        idle: &mut VecDeque<usize>,
        limit: usize,
        ids: &mut HashMap<usize, SlotId>,
        created: &mut HashMap<usize, u32>,
        stale: &mut Vec<SlotId>,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        while idle.len() > limit {
            let Some(k) = idle.pop_front() else { break };
            if let Some(id) = ids.remove(&k) {
                stale.push(id);
            }
            created.remove(&k);
            out.push(k);
        }
        out
    }

    for op in ops {
        match op {
            Op::Acquire(i) => {
                let next_gen = generation.get(&i).copied().unwrap_or(0) + 1;
                let (id, slot, inserted) = sut.find_or_insert_with(key(i), |_| next_gen);
                let was_present = busy.contains(&i) || idle.contains(&i);
                prop_assert_eq!(inserted, !was_present);
                if inserted {
                    generation.insert(i, next_gen);
                    created.insert(i, next_gen);
                    ids.insert(i, id);
                } else {
                    prop_assert_eq!(Some(&id), ids.get(&i), "live key keeps its id");
                }
                // Revival keeps the original payload.
                let payload = *slot.value.lock();
                prop_assert_eq!(Some(&payload), created.get(&i));

                let was_idle = idle.contains(&i);
                prop_assert_eq!(sut.unlink_idle(id), was_idle);
                idle.retain(|&k| k != i);
                busy.insert(i);
            }
            Op::Release(i) => {
                if busy.remove(&i) {
                    let id = ids[&i];
                    sut.push_idle(id);
                    idle.push_back(i);
                    let evicted: Vec<String> = sut.sweep().iter().map(|s| s.key.clone()).collect();
                    let expected: Vec<String> =
                        sweep_model(&mut idle, limit, &mut ids, &mut created, &mut stale)
                            .into_iter()
                            .map(key)
                            .collect();
                    prop_assert_eq!(evicted, expected, "eviction follows release order");
                }
            }
            Op::SetLimit(n) => {
                limit = n;
                let evicted: Vec<String> =
                    sut.set_size_limit(n).iter().map(|s| s.key.clone()).collect();
                let expected: Vec<String> =
                    sweep_model(&mut idle, limit, &mut ids, &mut created, &mut stale)
                        .into_iter()
                        .map(key)
                        .collect();
                prop_assert_eq!(evicted, expected);
            }
            Op::Find(i) => {
                prop_assert_eq!(sut.find(key(i).as_str()), ids.get(&i).copied());
            }
        }

        sut.check_links();
        prop_assert_eq!(sut.len(), busy.len() + idle.len());
        prop_assert_eq!(sut.idle_len(), idle.len());
        prop_assert!(sut.idle_len() <= sut.size_limit());
        let idle_keys: Vec<String> = sut.idle_iter().map(|s| s.key.clone()).collect();
        let model_keys: Vec<String> = idle.iter().copied().map(key).collect();
        prop_assert_eq!(idle_keys, model_keys);
        for &k in &busy {
            prop_assert!(!sut.is_idle(ids[&k]), "busy slots are never idle");
        }
        for &id in &stale {
            prop_assert!(sut.get(id).is_none(), "evicted id must not resolve");
        }
    }
    Ok(())
}

// Property: state-machine equivalence against a FIFO model.
// - At most one slot per key; lookups return the same id while it lives.
// - Reacquiring an idle slot revives the original payload.
// - Sweeps evict exactly the oldest released keys beyond the limit.
// - Busy slots are never evicted; evicted ids never resolve again.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_idle_fifo_state_machine((_keys, limit, ops) in arb_scenario()) {
        run(SlotStore::with_hasher(limit, RandomState::new()), limit, ops)?;
    }
}

// Collision variant using a constant hasher to stress equality resolution
// in the key index.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_idle_fifo_with_collisions((_keys, limit, ops) in arb_scenario()) {
        run(SlotStore::with_hasher(limit, ConstBuildHasher), limit, ops)?;
    }
}
