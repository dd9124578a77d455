//! Fixed-fanout adjacency storage with per-node row locks.
//!
//! Each node owns one out-neighbor row bounded by the graph's fanout.
//! Rows carry an explicit length (the valid prefix) instead of sentinel
//! padding; `-1` survives only at rectangular boundaries such as seed KNN
//! graphs and sentinel search output. The row's write guard doubles as
//! the per-node mutation lock required by the engines during concurrent
//! build.

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Node identifier in the graph domain. Graphs are limited to
/// `i32::MAX` nodes.
pub type NodeId = i32;

/// Sentinel meaning "no neighbor" in rectangular adjacency data.
pub const EMPTY_ID: NodeId = -1;

/// Per-node adjacency rows with a shared fanout bound.
pub struct Graph {
    rows: Vec<RwLock<Vec<NodeId>>>,
    fanout: usize,
}

impl Graph {
    /// Creates a graph of `n` nodes with empty rows.
    #[must_use]
    pub fn new(n: usize, fanout: usize) -> Self {
        Self {
            rows: (0..n).map(|_| RwLock::new(Vec::new())).collect(),
            fanout,
        }
    }

    /// Like [`Graph::new`] but failing cleanly when the row table cannot
    /// be reserved.
    pub fn try_new(n: usize, fanout: usize) -> Result<Self> {
        let mut rows = Vec::new();
        rows.try_reserve_exact(n).map_err(|_| Error::Allocation {
            what: "adjacency rows",
            requested: n * std::mem::size_of::<RwLock<Vec<NodeId>>>(),
        })?;
        rows.extend((0..n).map(|_| RwLock::new(Vec::new())));
        Ok(Self { rows, fanout })
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Per-row fanout bound.
    #[must_use]
    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Grows the row table so that `node_id` is addressable.
    pub fn ensure_capacity(&mut self, node_id: usize) {
        while self.rows.len() <= node_id {
            self.rows.push(RwLock::new(Vec::new()));
        }
    }

    /// Snapshot of node `i`'s out-neighbors.
    #[must_use]
    pub fn neighbors(&self, i: usize) -> Vec<NodeId> {
        self.rows[i].read().clone()
    }

    /// Current out-degree of node `i`.
    #[must_use]
    pub fn degree(&self, i: usize) -> usize {
        self.rows[i].read().len()
    }

    /// Overwrites node `i`'s row, truncating at the fanout bound.
    pub fn set_neighbors(&self, i: usize, mut neighbors: Vec<NodeId>) {
        neighbors.truncate(self.fanout);
        *self.rows[i].write() = neighbors;
    }

    /// Acquires node `i`'s row for mutation. The guard is the per-node
    /// lock: hold it across read-modify-write sequences on the row.
    pub fn lock_row(&self, i: usize) -> RwLockWriteGuard<'_, Vec<NodeId>> {
        self.rows[i].write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_neighbors_respects_fanout() {
        let graph = Graph::new(4, 2);
        graph.set_neighbors(0, vec![1, 2, 3]);
        assert_eq!(graph.neighbors(0), vec![1, 2]);
        assert_eq!(graph.degree(0), 2);
    }

    #[test]
    fn test_rows_start_empty() {
        let graph = Graph::new(3, 8);
        assert_eq!(graph.len(), 3);
        assert!(graph.neighbors(2).is_empty());
    }

    #[test]
    fn test_ensure_capacity_grows() {
        let mut graph = Graph::new(1, 4);
        graph.ensure_capacity(5);
        assert_eq!(graph.len(), 6);
        assert!(graph.neighbors(5).is_empty());
    }

    #[test]
    fn test_lock_row_mutation() {
        let graph = Graph::new(2, 4);
        {
            let mut row = graph.lock_row(1);
            row.push(0);
        }
        assert_eq!(graph.neighbors(1), vec![0]);
    }
}
