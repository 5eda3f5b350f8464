// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use rand::{Rng, rngs::StdRng};

/// Run-time constant of the non-uniform distribution.
const NURAND_C: u64 = 42;

/// Uniform in `[low, high]`.
pub(crate) fn uniform(rng: &mut StdRng, low: u64, high: u64) -> u64 {
    rng.gen_range(low, high + 1)
}

/// TPC-C `NURand(A, x, y)`: skewed towards a subset of `[x, y]`.
pub(crate) fn non_uniform(rng: &mut StdRng, a: u64, x: u64, y: u64) -> u64 {
    ((uniform(rng, 0, a) | uniform(rng, x, y)) + NURAND_C) % (y - x + 1) + x
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn values_stay_in_range(seed in any::<u64>(), x in 0u64..100, span in 0u64..5000) {
            let mut rng = StdRng::seed_from_u64(seed);
            let y = x + span;
            for _ in 0..64 {
                let value = non_uniform(&mut rng, 1023, x, y);
                prop_assert!(x <= value && value <= y);
                let value = uniform(&mut rng, x, y);
                prop_assert!(x <= value && value <= y);
            }
        }
    }
}
