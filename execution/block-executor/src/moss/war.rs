// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{sync::SpinLock, txn::TxnIndex};
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

/// Post-order extent of a sub-transaction: its own position `order` and the position `first` of
/// the first node of its subtree. Node `a` is an ancestor of (or equal to) node `b` iff
/// `a.first <= b.order <= a.order`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeSpan {
    pub first: usize,
    pub order: usize,
}

impl NodeSpan {
    pub fn covers(&self, other: &NodeSpan) -> bool {
        self.first <= other.order && other.order <= self.order
    }

    pub fn orders(&self) -> impl Iterator<Item = usize> {
        self.first..=self.order
    }
}

/// A sub-transaction of a specific transaction, ordered by (transaction, post-order position).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef {
    pub txn: TxnIndex,
    pub span: NodeSpan,
}

impl NodeRef {
    pub fn is_after(&self, txn: TxnIndex, order: usize) -> bool {
        (self.txn, self.span.order) > (txn, order)
    }
}

/// Printable sub-transaction id: the transaction index followed by the child-index path, e.g.
/// `3-0-1` for the second child of the first child of transaction 3.
pub struct SubTxnId<'a> {
    pub txn: TxnIndex,
    pub path: &'a [u16],
}

impl fmt::Display for SubTxnId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.txn)?;
        for step in self.path {
            write!(f, "-{}", step)?;
        }
        Ok(())
    }
}

/// Sub-transactions that must be re-executed, kept as a minimal covering set: a node already
/// covered by a marked ancestor is not added, and marking an ancestor drops its marked
/// descendants.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WarSet {
    spans: Vec<NodeSpan>,
    /// Largest earlier transaction that must finalize before the re-execution.
    blocked_on: Option<TxnIndex>,
}

impl WarSet {
    pub fn insert(&mut self, span: NodeSpan) {
        if self.spans.iter().any(|marked| marked.covers(&span)) {
            return;
        }
        self.spans.retain(|marked| !span.covers(marked));
        self.spans.push(span);
    }

    pub fn block_on(&mut self, txn: TxnIndex) {
        self.blocked_on = Some(self.blocked_on.map_or(txn, |b| b.max(txn)));
    }

    pub fn blocked_on(&self) -> Option<TxnIndex> {
        self.blocked_on
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn spans(&self) -> &[NodeSpan] {
        &self.spans
    }

    /// Positions of every node inside a marked subtree, ascending.
    pub fn orders(&self) -> Vec<usize> {
        let mut orders: Vec<usize> = self.spans.iter().flat_map(|span| span.orders()).collect();
        orders.sort_unstable();
        orders.dedup();
        orders
    }
}

/// Per-transaction mark state, written by any worker and drained by the owning transaction.
#[derive(Default)]
pub struct MossTxnState {
    war: SpinLock<WarSet>,
    marked: AtomicBool,
}

impl MossTxnState {
    pub fn set_war(&self, span: NodeSpan, blocked_on: Option<TxnIndex>) {
        let mut war = self.war.lock();
        war.insert(span);
        if let Some(txn) = blocked_on {
            war.block_on(txn);
        }
        self.marked.store(true, Ordering::Release);
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub fn take(&self) -> WarSet {
        let mut war = self.war.lock();
        self.marked.store(false, Ordering::Release);
        std::mem::take(&mut *war)
    }
}
