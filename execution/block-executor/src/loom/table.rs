// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::txn::{Key, TxnIndex, Value};
use dcc_partitioned_table::Table;
use std::collections::BTreeMap;

/// Committed value plus the get/put reservations of the blocks in flight.
#[derive(Default)]
pub struct LoomEntry {
    pub value: Value,
    block_id_get: u64,
    reserved_get: Vec<TxnIndex>,
    block_id_put: u64,
    reserved_put_num: usize,
    // Puts reserved by the block following `block_id_put`.
    next_reserved_put: usize,
}

pub struct LoomTable {
    table: Table<Key, LoomEntry>,
}

impl LoomTable {
    pub fn new(partitions: usize) -> Self {
        Self {
            table: Table::new(partitions),
        }
    }

    /// Reserves a read of `key` for transaction `idx` of `batch_id` and returns the committed
    /// value, or `None` if an earlier block still has a put pending on the key.
    pub fn reserve_get(&self, key: &str, batch_id: u64, idx: TxnIndex) -> Option<Value> {
        self.table.put(key, |entry| {
            if entry.block_id_put != 0 && entry.block_id_put < batch_id {
                return None;
            }
            if entry.block_id_get < batch_id {
                entry.block_id_get = batch_id;
                entry.reserved_get.clear();
                entry.reserved_get.push(idx);
            } else if entry.block_id_get == batch_id && !entry.reserved_get.contains(&idx) {
                entry.reserved_get.push(idx);
            }
            Some(entry.value.clone())
        })
    }

    /// Reserves a put of `key` for `batch_id`. A block only pre-executes once the previous one
    /// finished pre-executing, so no later block can have read the key yet.
    pub fn reserve_put(&self, key: &str, batch_id: u64) {
        self.table.put(key, |entry| {
            debug_assert!(
                entry.block_id_get <= batch_id || entry.reserved_get.is_empty(),
                "block {} read {} before block {} reserved its put",
                entry.block_id_get,
                key,
                batch_id
            );
            if entry.block_id_put == 0 {
                entry.block_id_put = batch_id;
                entry.reserved_put_num = 1;
            } else if entry.block_id_put > batch_id {
                entry.block_id_put = batch_id;
                entry.next_reserved_put = entry.reserved_put_num;
                entry.reserved_put_num = 1;
            } else if entry.block_id_put == batch_id {
                entry.reserved_put_num += 1;
            } else {
                entry.next_reserved_put += 1;
            }
        })
    }

    pub fn release_get(&self, key: &str, batch_id: u64, idx: TxnIndex) {
        self.table.put(key, |entry| {
            if entry.block_id_get == batch_id {
                entry.reserved_get.retain(|reader| *reader != idx);
                if entry.reserved_get.is_empty() {
                    entry.block_id_get = 0;
                }
            }
        });
    }

    /// Drops one put reservation of `batch_id`. When the last one of the pending block goes, the
    /// following block's reservations (if any) become the pending ones.
    pub fn release_put(&self, key: &str, batch_id: u64) {
        self.table.put(key, |entry| {
            if entry.block_id_put == batch_id {
                entry.reserved_put_num = entry.reserved_put_num.saturating_sub(1);
                if entry.reserved_put_num == 0 {
                    if entry.next_reserved_put > 0 {
                        entry.block_id_put += 1;
                        entry.reserved_put_num = entry.next_reserved_put;
                        entry.next_reserved_put = 0;
                    } else {
                        entry.block_id_put = 0;
                    }
                }
            } else if entry.block_id_put != 0 && entry.block_id_put < batch_id {
                entry.next_reserved_put = entry.next_reserved_put.saturating_sub(1);
            }
        });
    }

    pub fn read(&self, key: &str) -> Value {
        self.table.get(key, |entry| entry.value.clone())
    }

    pub fn write(&self, key: &str, value: Value) {
        self.table.put(key, |entry| entry.value = value);
    }

    pub fn snapshot(&self) -> BTreeMap<Key, Value> {
        crate::protocol::collect_values(&self.table, |entry| &entry.value)
    }
}
