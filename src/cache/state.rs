//! Synced rows plus the optimistic layer on top of them.

use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::warn;

use crate::shape::stream::Operation;
use crate::shape::{merge_row, row_key, Row, Txid};

/// Upper bound on remembered txids while a server reply is outstanding.
const MAX_SEEN_TXIDS: usize = 10_000;

/// A local change that is visible before the server confirms it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingChange {
  Insert(Row),
  Update(Row),
  Delete,
}

#[derive(Debug)]
struct PendingMutation {
  id: u64,
  key: String,
  change: PendingChange,
  /// Set once the server accepted the write
  txids: Option<Vec<Txid>>,
}

#[derive(Debug, Default)]
pub(crate) struct CollectionState {
  synced: BTreeMap<String, Row>,
  pending: Vec<PendingMutation>,
  seen_txids: HashSet<Txid>,
  /// Insertion order of `seen_txids`, oldest first
  seen_order: VecDeque<Txid>,
  next_mutation_id: u64,
  up_to_date: bool,
}

impl CollectionState {
  /// Apply one change from the stream. Returns false if it was dropped.
  pub fn apply_change(&mut self, operation: Operation, value: Row) -> bool {
    let Some(key) = row_key(&value) else {
      warn!("Dropping {:?} change for a row without a key", operation);
      return false;
    };

    match operation {
      Operation::Insert => {
        self.synced.insert(key, value);
      }
      Operation::Update => match self.synced.get_mut(&key) {
        Some(existing) => merge_row(existing, value),
        None => {
          self.synced.insert(key, value);
        }
      },
      Operation::Delete => {
        self.synced.remove(&key);
      }
    }
    true
  }

  pub fn observe_txids(&mut self, txids: &[Txid]) {
    for &txid in txids {
      if self.seen_txids.insert(txid) {
        self.seen_order.push_back(txid);
      }
    }
    while self.seen_order.len() > MAX_SEEN_TXIDS {
      if let Some(oldest) = self.seen_order.pop_front() {
        self.seen_txids.remove(&oldest);
      }
    }
  }

  /// Whether a staged mutation is still waiting for confirmation.
  pub fn is_pending(&self, mutation_id: u64) -> bool {
    self.pending.iter().any(|p| p.id == mutation_id)
  }

  /// Stage an optimistic change and return its mutation id.
  pub fn stage(&mut self, key: String, change: PendingChange) -> u64 {
    let id = self.next_mutation_id;
    self.next_mutation_id += 1;
    self.pending.push(PendingMutation {
      id,
      key,
      change,
      txids: None,
    });
    id
  }

  /// Record the txids the server returned for a staged mutation.
  pub fn attach_txids(&mut self, mutation_id: u64, txids: Vec<Txid>) -> bool {
    if let Some(pending) = self.pending.iter_mut().find(|p| p.id == mutation_id) {
      pending.txids = Some(txids);
    }
    self.settle()
  }

  /// Drop a staged mutation the server rejected.
  pub fn rollback(&mut self, mutation_id: u64) -> bool {
    let before = self.pending.len();
    self.pending.retain(|p| p.id != mutation_id);
    self.pending.len() != before
  }

  /// Drop staged mutations whose txids have all shown up in the stream.
  /// The synced rows now carry their effect.
  pub fn settle(&mut self) -> bool {
    let seen = &self.seen_txids;
    let before = self.pending.len();
    self.pending.retain(|p| match &p.txids {
      Some(txids) => !txids.iter().all(|txid| seen.contains(txid)),
      None => true,
    });
    let changed = self.pending.len() != before;
    self.prune_seen();
    changed
  }

  /// Forget txids nothing can be waiting for any more.
  ///
  /// Only a mutation still waiting on its server reply can turn out to own
  /// an already seen txid. Without one, just the txids of confirmed but
  /// unsettled mutations are kept.
  fn prune_seen(&mut self) {
    if self.pending.iter().any(|p| p.txids.is_none()) {
      return;
    }
    let referenced: HashSet<Txid> = self
      .pending
      .iter()
      .filter_map(|p| p.txids.as_ref())
      .flatten()
      .copied()
      .collect();
    self.seen_txids.retain(|txid| referenced.contains(txid));
    self.seen_order.retain(|txid| referenced.contains(txid));
  }

  /// Visible rows: synced rows with pending changes applied in order.
  pub fn rows(&self) -> Vec<Row> {
    let mut visible = self.synced.clone();
    for pending in &self.pending {
      match &pending.change {
        PendingChange::Insert(row) => {
          visible.insert(pending.key.clone(), row.clone());
        }
        PendingChange::Update(changes) => {
          if let Some(existing) = visible.get_mut(&pending.key) {
            merge_row(existing, changes.clone());
          }
        }
        PendingChange::Delete => {
          visible.remove(&pending.key);
        }
      }
    }
    visible.into_values().collect()
  }

  /// Visible row by key.
  pub fn get(&self, key: &str) -> Option<Row> {
    let mut row = self.synced.get(key).cloned();
    for pending in self.pending.iter().filter(|p| p.key == key) {
      match &pending.change {
        PendingChange::Insert(inserted) => row = Some(inserted.clone()),
        PendingChange::Update(changes) => {
          if let Some(existing) = row.as_mut() {
            merge_row(existing, changes.clone());
          }
        }
        PendingChange::Delete => row = None,
      }
    }
    row
  }

  /// Server-confirmed row by key.
  pub fn synced_row(&self, key: &str) -> Option<Row> {
    self.synced.get(key).cloned()
  }

  pub fn pending_len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_up_to_date(&self) -> bool {
    self.up_to_date
  }

  pub fn mark_up_to_date(&mut self) -> bool {
    let changed = !self.up_to_date;
    self.up_to_date = true;
    changed
  }

  /// Forget synced rows before re-reading the shape from scratch.
  /// Pending mutations and seen txids survive.
  pub fn reset(&mut self) {
    self.synced.clear();
    self.up_to_date = false;
  }
}
