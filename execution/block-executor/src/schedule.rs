// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::txn::{BufferedView, RwSet, StorageView, Value};
use hashbrown::HashMap;
use rayon::prelude::*;

/// Groups footprints (given in their serialization order) into waves. Members of one wave do not
/// conflict with each other, and every footprint lands in a strictly later wave than each earlier
/// footprint it conflicts with. Executing the waves one after the other, each wave in parallel, is
/// therefore equivalent to executing the footprints sequentially.
///
/// Returns positions into `footprints`, ascending within each wave.
pub fn conflict_free_waves(footprints: &[&RwSet]) -> Vec<Vec<usize>> {
    let mut last_read: HashMap<&str, usize> = HashMap::new();
    let mut last_write: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<usize>> = vec![];

    for (pos, rw) in footprints.iter().enumerate() {
        let after_writes = rw
            .read_keys()
            .chain(rw.write_keys())
            .filter_map(|key| last_write.get(key.as_str()).map(|wave| wave + 1));
        let after_reads = rw
            .write_keys()
            .filter_map(|key| last_read.get(key.as_str()).map(|wave| wave + 1));
        let wave = after_writes.chain(after_reads).max().unwrap_or(0);

        for key in rw.read_keys() {
            let entry = last_read.entry(key.as_str()).or_insert(wave);
            *entry = (*entry).max(wave);
        }
        for key in rw.write_keys() {
            let entry = last_write.entry(key.as_str()).or_insert(wave);
            *entry = (*entry).max(wave);
        }

        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(pos);
    }
    waves
}

/// Runs `waves` one after the other on the rayon pool. Members of a wave execute in parallel
/// against the state as it was when the wave started; once the whole wave finished their buffered
/// footprints are handed to `commit` in position order.
pub fn execute_in_waves<R, E, C>(waves: &[Vec<usize>], read: R, execute: E, mut commit: C)
where
    R: Fn(&str) -> Value + Sync,
    E: Fn(usize, &mut dyn StorageView) + Sync,
    C: FnMut(usize, RwSet),
{
    for wave in waves {
        let results: Vec<(usize, RwSet)> = wave
            .par_iter()
            .map(|&pos| {
                let mut rw = RwSet::default();
                execute(pos, &mut BufferedView::new(&mut rw, |key: &str| read(key)));
                (pos, rw)
            })
            .collect();
        for (pos, rw) in results {
            commit(pos, rw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::{collection::vec, prelude::*};
    use std::collections::BTreeMap;

    fn footprint(reads: &[&str], writes: &[&str]) -> RwSet {
        let mut rw = RwSet::default();
        for key in reads {
            rw.reads.insert(key.to_string(), String::new());
        }
        for key in writes {
            rw.writes.insert(key.to_string(), String::new());
        }
        rw
    }

    #[test]
    fn readers_share_a_wave_writers_are_ordered() {
        let a = footprint(&["x"], &[]);
        let b = footprint(&["x"], &[]);
        let c = footprint(&[], &["x"]);
        let d = footprint(&["x"], &["y"]);
        let e = footprint(&["z"], &[]);
        let waves = conflict_free_waves(&[&a, &b, &c, &d, &e]);
        assert_eq!(waves, vec![vec![0, 1, 4], vec![2], vec![3]]);
    }

    #[test]
    fn waves_observe_earlier_waves_only() {
        let state = Mutex::new(BTreeMap::from([("x".to_string(), "1".to_string())]));
        // Wave 0 doubles x into y, wave 1 copies y into z.
        let waves = vec![vec![0], vec![1]];
        execute_in_waves(
            &waves,
            |key| state.lock().get(key).cloned().unwrap_or_default(),
            |pos, view| {
                if pos == 0 {
                    let x = view.get("x");
                    view.put("y", format!("{}{}", x, x));
                } else {
                    let y = view.get("y");
                    view.put("z", y);
                }
            },
            |_, rw| state.lock().extend(rw.writes),
        );
        assert_eq!(state.lock().get("z").map(String::as_str), Some("11"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn conflicting_pairs_keep_their_order(
            sets in vec((vec(0u8..6, 0..3), vec(0u8..6, 0..3)), 1..30),
        ) {
            let footprints: Vec<RwSet> = sets
                .iter()
                .map(|(reads, writes)| {
                    let reads: Vec<String> = reads.iter().map(|k| k.to_string()).collect();
                    let writes: Vec<String> = writes.iter().map(|k| k.to_string()).collect();
                    let reads: Vec<&str> = reads.iter().map(String::as_str).collect();
                    let writes: Vec<&str> = writes.iter().map(String::as_str).collect();
                    footprint(&reads, &writes)
                })
                .collect();
            let refs: Vec<&RwSet> = footprints.iter().collect();
            let waves = conflict_free_waves(&refs);

            let mut wave_of = vec![usize::MAX; footprints.len()];
            for (w, wave) in waves.iter().enumerate() {
                for &pos in wave {
                    prop_assert_eq!(wave_of[pos], usize::MAX);
                    wave_of[pos] = w;
                }
            }
            for i in 0..footprints.len() {
                prop_assert!(wave_of[i] != usize::MAX);
                for j in i + 1..footprints.len() {
                    if footprints[i].conflicts_with(&footprints[j]) {
                        prop_assert!(wave_of[i] < wave_of[j]);
                    }
                }
            }
        }
    }
}
