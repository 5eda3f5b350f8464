// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use core_affinity::CoreId;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

static CORE_IDS: Lazy<Vec<CoreId>> = Lazy::new(|| core_affinity::get_core_ids().unwrap_or_default());

/// Pins the calling thread to core `worker_index % num_cores`. Pinning is best effort: on failure
/// the thread keeps running unpinned and false is returned.
pub fn pin_round_robin(worker_index: usize) -> bool {
    if CORE_IDS.is_empty() {
        warn!(worker_index, "no core ids available, running unpinned");
        return false;
    }
    let core_id = CORE_IDS[worker_index % CORE_IDS.len()];
    if core_affinity::set_for_current(core_id) {
        debug!(worker_index, core = core_id.id, "pinned worker");
        true
    } else {
        warn!(worker_index, core = core_id.id, "failed to pin worker, running unpinned");
        false
    }
}

pub fn num_cores() -> usize {
    if CORE_IDS.is_empty() {
        num_cpus::get()
    } else {
        CORE_IDS.len()
    }
}
