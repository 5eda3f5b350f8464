// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::random::{non_uniform, uniform};
use dcc_block_executor::{
    Block, FnTransaction, NestedTransaction, StorageView, SubTransaction, Transaction,
};
use rand::{SeedableRng, rngs::StdRng};
use std::sync::Arc;
use tracing::{debug, info};

pub const N_DISTRICTS: u64 = 10;
pub const N_CUSTOMERS: u64 = 3000;
pub const N_ITEMS: u64 = 100_000;
pub const N_CARRIERS: u64 = 10;

/// Stock of an item that was never ordered.
const INITIAL_STOCK: u64 = 100;
const MIN_ORDER_LINES: u64 = 5;
const MAX_ORDER_LINES: u64 = 15;
const STOCK_LEVEL_ITEMS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TpccConfig {
    pub warehouses: u64,
    pub block_size: usize,
    pub num_blocks: usize,
    /// Emit every transaction as a tree of sub-transactions.
    pub nested: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxnKind {
    NewOrder,
    Payment,
    OrderStatus,
    Delivery,
    StockLevel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderLine {
    pub item: u64,
    pub supply_warehouse: u64,
    pub quantity: u64,
}

/// Parameters of one generated transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TpccTxn {
    NewOrder {
        warehouse: u64,
        district: u64,
        customer: u64,
        lines: Vec<OrderLine>,
    },
    Payment {
        warehouse: u64,
        district: u64,
        customer: u64,
        amount: u64,
    },
    OrderStatus {
        warehouse: u64,
        district: u64,
        customer: u64,
    },
    Delivery {
        warehouse: u64,
        carrier: u64,
    },
    StockLevel {
        warehouse: u64,
        district: u64,
        items: Vec<u64>,
        threshold: u64,
    },
}

fn warehouse_key(warehouse: u64) -> String {
    format!("w{}", warehouse)
}

fn warehouse_ytd_key(warehouse: u64) -> String {
    format!("w{}-ytd", warehouse)
}

fn next_order_key(warehouse: u64, district: u64) -> String {
    format!("w{}-d{}-next", warehouse, district)
}

fn district_ytd_key(warehouse: u64, district: u64) -> String {
    format!("w{}-d{}-ytd", warehouse, district)
}

fn delivered_key(warehouse: u64, district: u64) -> String {
    format!("w{}-d{}-delivered", warehouse, district)
}

fn carrier_key(warehouse: u64, district: u64) -> String {
    format!("w{}-d{}-carrier", warehouse, district)
}

fn customer_key(warehouse: u64, district: u64, customer: u64) -> String {
    format!("w{}-d{}-c{}", warehouse, district, customer)
}

fn item_key(item: u64) -> String {
    format!("i{}", item)
}

fn stock_key(warehouse: u64, item: u64) -> String {
    format!("w{}-s{}", warehouse, item)
}

fn read_number(view: &mut dyn StorageView, key: &str) -> i64 {
    view.get(key).parse().unwrap_or(0)
}

fn add(view: &mut dyn StorageView, key: &str, delta: i64) {
    let value = read_number(view, key) + delta;
    view.put(key, value.to_string());
}

/// TPC-C stock update: an item running low is restocked by 91 units.
fn restock(quantity: u64, ordered: u64) -> u64 {
    if quantity >= ordered + 10 {
        quantity - ordered
    } else {
        quantity + 91 - ordered
    }
}

impl TpccTxn {
    pub fn kind(&self) -> TxnKind {
        match self {
            TpccTxn::NewOrder { .. } => TxnKind::NewOrder,
            TpccTxn::Payment { .. } => TxnKind::Payment,
            TpccTxn::OrderStatus { .. } => TxnKind::OrderStatus,
            TpccTxn::Delivery { .. } => TxnKind::Delivery,
            TpccTxn::StockLevel { .. } => TxnKind::StockLevel,
        }
    }

    pub fn warehouse(&self) -> u64 {
        match self {
            TpccTxn::NewOrder { warehouse, .. }
            | TpccTxn::Payment { warehouse, .. }
            | TpccTxn::OrderStatus { warehouse, .. }
            | TpccTxn::Delivery { warehouse, .. }
            | TpccTxn::StockLevel { warehouse, .. } => *warehouse,
        }
    }

    /// Number of keys the transaction touches.
    pub fn cost(&self) -> u64 {
        match self {
            TpccTxn::NewOrder { lines, .. } => 4 + 2 * lines.len() as u64,
            TpccTxn::Payment { .. } => 4,
            TpccTxn::OrderStatus { .. } => 2,
            TpccTxn::Delivery { .. } => 2 * N_DISTRICTS,
            TpccTxn::StockLevel { items, .. } => 1 + items.len() as u64,
        }
    }

    /// Runs the transaction logic. `tag` names the keys only this transaction writes, such as
    /// the order and history records.
    pub fn execute(&self, tag: &str, view: &mut dyn StorageView) {
        match self {
            TpccTxn::NewOrder {
                warehouse,
                district,
                customer,
                lines,
            } => {
                view.get(&warehouse_key(*warehouse));
                view.get(&customer_key(*warehouse, *district, *customer));
                let next = next_order_key(*warehouse, *district);
                let order_id = read_number(view, &next) + 1;
                view.put(&next, order_id.to_string());
                for line in lines {
                    view.get(&item_key(line.item));
                    let stock = stock_key(line.supply_warehouse, line.item);
                    let quantity = view.get(&stock).parse().unwrap_or(INITIAL_STOCK);
                    view.put(&stock, restock(quantity, line.quantity).to_string());
                }
                view.put(
                    &format!("o-{}", tag),
                    format!("{}:{}:{}", order_id, customer, lines.len()),
                );
            },
            TpccTxn::Payment {
                warehouse,
                district,
                customer,
                amount,
            } => {
                let amount = *amount as i64;
                add(view, &warehouse_ytd_key(*warehouse), amount);
                add(view, &district_ytd_key(*warehouse, *district), amount);
                add(view, &customer_key(*warehouse, *district, *customer), -amount);
                view.put(&format!("h-{}", tag), amount.to_string());
            },
            TpccTxn::OrderStatus {
                warehouse,
                district,
                customer,
            } => {
                view.get(&customer_key(*warehouse, *district, *customer));
                view.get(&next_order_key(*warehouse, *district));
            },
            TpccTxn::Delivery { warehouse, carrier } => {
                for district in 1..=N_DISTRICTS {
                    add(view, &delivered_key(*warehouse, district), 1);
                    view.put(&carrier_key(*warehouse, district), carrier.to_string());
                }
            },
            TpccTxn::StockLevel {
                warehouse,
                district,
                items,
                threshold,
            } => {
                view.get(&next_order_key(*warehouse, *district));
                let low = items
                    .iter()
                    .filter(|item| {
                        let quantity = view
                            .get(&stock_key(*warehouse, **item))
                            .parse()
                            .unwrap_or(INITIAL_STOCK);
                        quantity < *threshold
                    })
                    .count();
                debug!(warehouse = *warehouse, district = *district, low, "stock level");
            },
        }
    }

    /// The same access pattern as a tree of sub-transactions. Sub-transactions write constant
    /// values derived from `tag`.
    pub fn sub_transactions(&self, tag: &str) -> SubTransaction {
        let leaf = |reads: Vec<String>, writes: Vec<String>, suffix: &str| {
            let cost = (reads.len() + writes.len()) as u64;
            SubTransaction::leaf(reads, writes, format!("{}{}", tag, suffix)).with_cost(cost)
        };
        match self {
            TpccTxn::NewOrder {
                warehouse,
                district,
                customer,
                lines,
            } => {
                let next = next_order_key(*warehouse, *district);
                let children = lines
                    .iter()
                    .enumerate()
                    .map(|(n, line)| {
                        let stock = stock_key(line.supply_warehouse, line.item);
                        leaf(
                            vec![item_key(line.item), stock.clone()],
                            vec![stock],
                            format!("-l{}", n).as_str(),
                        )
                    })
                    .collect();
                leaf(
                    vec![
                        warehouse_key(*warehouse),
                        customer_key(*warehouse, *district, *customer),
                        next.clone(),
                    ],
                    vec![next, format!("o-{}", tag)],
                    "",
                )
                .with_children(children)
            },
            TpccTxn::Payment {
                warehouse,
                district,
                customer,
                ..
            } => {
                let children = [
                    warehouse_ytd_key(*warehouse),
                    district_ytd_key(*warehouse, *district),
                    customer_key(*warehouse, *district, *customer),
                ]
                .into_iter()
                .enumerate()
                .map(|(n, key)| leaf(vec![key.clone()], vec![key], format!("-p{}", n).as_str()))
                .collect();
                leaf(vec![], vec![format!("h-{}", tag)], "").with_children(children)
            },
            TpccTxn::OrderStatus {
                warehouse,
                district,
                customer,
            } => leaf(
                vec![
                    customer_key(*warehouse, *district, *customer),
                    next_order_key(*warehouse, *district),
                ],
                vec![],
                "",
            ),
            TpccTxn::Delivery { warehouse, .. } => {
                let children = (1..=N_DISTRICTS)
                    .map(|district| {
                        let delivered = delivered_key(*warehouse, district);
                        leaf(
                            vec![delivered.clone()],
                            vec![delivered, carrier_key(*warehouse, district)],
                            format!("-d{}", district).as_str(),
                        )
                    })
                    .collect();
                leaf(vec![], vec![], "").with_children(children)
            },
            TpccTxn::StockLevel {
                warehouse,
                district,
                items,
                ..
            } => {
                let children = items
                    .iter()
                    .enumerate()
                    .map(|(n, item)| {
                        leaf(vec![stock_key(*warehouse, *item)], vec![], format!("-s{}", n).as_str())
                    })
                    .collect();
                leaf(vec![next_order_key(*warehouse, *district)], vec![], "")
                    .with_children(children)
            },
        }
    }

    pub fn into_transaction(self, tag: String, nested: bool) -> Arc<dyn Transaction> {
        if nested {
            return Arc::new(NestedTransaction::new(self.sub_transactions(&tag)));
        }
        let cost = self.cost();
        Arc::new(FnTransaction::new(move |view| self.execute(&tag, view)).with_cost(cost))
    }
}

/// Seeded TPC-C transaction mix: 45% NewOrder, 43% Payment, 4% each of OrderStatus, Delivery
/// and StockLevel.
pub struct TpccWorkload {
    config: TpccConfig,
    rng: StdRng,
    next_block_id: u64,
}

impl TpccWorkload {
    pub fn new(config: TpccConfig, seed: u64) -> Self {
        let config = TpccConfig {
            warehouses: config.warehouses.max(1),
            ..config
        };
        info!(
            warehouses = config.warehouses,
            block_size = config.block_size,
            num_blocks = config.num_blocks,
            nested = config.nested,
            seed,
            "TPC-C workload"
        );
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            next_block_id: 0,
        }
    }

    pub fn config(&self) -> &TpccConfig {
        &self.config
    }

    fn warehouse(&mut self) -> u64 {
        uniform(&mut self.rng, 1, self.config.warehouses)
    }

    fn customer(&mut self) -> u64 {
        non_uniform(&mut self.rng, 1023, 1, N_CUSTOMERS)
    }

    fn item(&mut self) -> u64 {
        non_uniform(&mut self.rng, 8191, 1, N_ITEMS)
    }

    pub fn next_txn(&mut self) -> TpccTxn {
        let warehouse = self.warehouse();
        let district = uniform(&mut self.rng, 1, N_DISTRICTS);
        match uniform(&mut self.rng, 1, 100) {
            1..=45 => {
                let customer = self.customer();
                let num_lines = uniform(&mut self.rng, MIN_ORDER_LINES, MAX_ORDER_LINES);
                let mut lines: Vec<OrderLine> = Vec::with_capacity(num_lines as usize);
                while lines.len() < num_lines as usize {
                    let item = self.item();
                    if lines.iter().any(|line| line.item == item) {
                        continue;
                    }
                    // 1% of the lines are supplied by a remote warehouse.
                    let supply_warehouse =
                        if self.config.warehouses > 1 && uniform(&mut self.rng, 1, 100) == 1 {
                            let other = uniform(&mut self.rng, 1, self.config.warehouses - 1);
                            if other >= warehouse { other + 1 } else { other }
                        } else {
                            warehouse
                        };
                    lines.push(OrderLine {
                        item,
                        supply_warehouse,
                        quantity: uniform(&mut self.rng, 1, 10),
                    });
                }
                TpccTxn::NewOrder {
                    warehouse,
                    district,
                    customer,
                    lines,
                }
            },
            46..=88 => TpccTxn::Payment {
                warehouse,
                district,
                customer: self.customer(),
                amount: uniform(&mut self.rng, 1, 5000),
            },
            89..=92 => TpccTxn::OrderStatus {
                warehouse,
                district,
                customer: self.customer(),
            },
            93..=96 => TpccTxn::Delivery {
                warehouse,
                carrier: uniform(&mut self.rng, 1, N_CARRIERS),
            },
            _ => TpccTxn::StockLevel {
                warehouse,
                district,
                items: (0..STOCK_LEVEL_ITEMS).map(|_| self.item()).collect(),
                threshold: uniform(&mut self.rng, 10, 20),
            },
        }
    }

    pub fn next_block(&mut self) -> Block {
        let id = self.next_block_id;
        self.next_block_id += 1;
        let txns = (0..self.config.block_size)
            .map(|idx| {
                self.next_txn()
                    .into_transaction(format!("b{}-t{}", id, idx), self.config.nested)
            })
            .collect();
        debug!(block = id, txns = self.config.block_size, "generated block");
        Block::new(id, txns)
    }

    /// The configured number of blocks.
    pub fn blocks(&mut self) -> Vec<Block> {
        (0..self.config.num_blocks).map(|_| self.next_block()).collect()
    }
}
