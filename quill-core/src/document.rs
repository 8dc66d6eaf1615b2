//! The replicated text document.
//!
//! Blocks are kept in document order, tombstones included. Remote inserts are
//! placed with the YATA rule: starting right after the left origin, scan
//! towards the right origin and skip over concurrent blocks that must sort
//! before the new one. Concurrent inserts with the same origins order by
//! replica id, lower first.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::delta::{AppliedDelta, TextEdit};
use crate::error::DocumentError;
use crate::id::{IdRange, OpId, ReplicaId, StateVector};
use crate::op::{Operation, Update};
use crate::snapshot::{self, SnapshotBody};

/// Tuning knobs for a document replica.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Merge calls an operation may wait for missing dependencies before it
    /// is dropped.
    pub max_pending_rounds: u32,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            max_pending_rounds: 64,
        }
    }
}

impl DocumentConfig {
    pub fn for_testing() -> Self {
        Self {
            max_pending_rounds: 4,
        }
    }
}

/// One character with its CRDT metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Block {
    pub id: OpId,
    pub origin: Option<OpId>,
    pub right_origin: Option<OpId>,
    pub content: char,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DeleteMark {
    pub id: OpId,
    pub targets: Vec<IdRange>,
}

/// An operation waiting for its causal dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PendingOp {
    pub op: Operation,
    pub rounds: u32,
}

enum Readiness {
    Duplicate,
    Ready,
    Blocked,
}

/// Blocks touched by one merge call, used to build the widget delta.
#[derive(Default)]
struct MergeTracker {
    inserted: HashSet<OpId>,
    deleted: HashSet<OpId>,
}

impl MergeTracker {
    fn into_delta(self, blocks: &[Block]) -> AppliedDelta {
        if self.inserted.is_empty() && self.deleted.is_empty() {
            return AppliedDelta::default();
        }

        let mut edits: Vec<TextEdit> = Vec::new();
        let mut old_offset = 0usize;
        for block in blocks {
            if self.inserted.contains(&block.id) {
                if !block.deleted {
                    push_edit(&mut edits, old_offset, 0, Some(block.content));
                }
            } else if self.deleted.contains(&block.id) {
                push_edit(&mut edits, old_offset, 1, None);
                old_offset += 1;
            } else if !block.deleted {
                old_offset += 1;
            }
        }
        AppliedDelta::new(edits)
    }
}

fn push_edit(edits: &mut Vec<TextEdit>, offset: usize, deleted: usize, ch: Option<char>) {
    match edits.last_mut() {
        Some(last) if last.offset + last.deleted == offset => {
            last.deleted += deleted;
            if let Some(ch) = ch {
                last.inserted.push(ch);
            }
        }
        _ => edits.push(TextEdit {
            offset,
            deleted,
            inserted: ch.map(String::from).unwrap_or_default(),
        }),
    }
}

/// A replica of one shared text document.
#[derive(Debug, Clone)]
pub struct Document {
    replica: ReplicaId,
    blocks: Vec<Block>,
    deletes: Vec<DeleteMark>,
    state: StateVector,
    pending: Vec<PendingOp>,
    visible_len: usize,
    config: DocumentConfig,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        Self::with_config(replica, DocumentConfig::default())
    }

    pub fn with_config(replica: ReplicaId, config: DocumentConfig) -> Self {
        Self {
            replica,
            blocks: Vec::new(),
            deletes: Vec::new(),
            state: StateVector::new(),
            pending: Vec::new(),
            visible_len: 0,
            config,
        }
    }

    /// A document holding `text` authored by the nil replica.
    ///
    /// Every replica seeding the same text produces identical blocks, so the
    /// seed never duplicates when replicas sync.
    pub fn seeded(replica: ReplicaId, text: &str) -> Self {
        Self::seeded_with_config(replica, text, DocumentConfig::default())
    }

    pub fn seeded_with_config(replica: ReplicaId, text: &str, config: DocumentConfig) -> Self {
        let mut doc = Self::with_config(replica, config);
        let seed = Uuid::nil();
        let mut origin = None;
        for (clock, ch) in text.chars().enumerate() {
            let id = OpId::new(seed, clock as u64);
            doc.blocks.push(Block {
                id,
                origin,
                right_origin: None,
                content: ch,
                deleted: false,
            });
            origin = Some(id);
        }
        doc.visible_len = doc.blocks.len();
        if doc.visible_len > 0 {
            doc.state.advance(seed, doc.visible_len as u64);
        }
        doc
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| !b.deleted)
            .map(|b| b.content)
            .collect()
    }

    /// Visible length in chars.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    /// Insert `text` before the visible char at `position`.
    pub fn apply_local_insert(&mut self, position: usize, text: &str) -> Result<Update, DocumentError> {
        if position > self.visible_len {
            return Err(DocumentError::OutOfRange {
                position,
                len: self.visible_len,
            });
        }
        if text.is_empty() {
            return Ok(Update::empty());
        }

        let index = self.insertion_index(position);
        let origin = index.checked_sub(1).map(|i| self.blocks[i].id);
        let right_origin = self.blocks.get(index).map(|b| b.id);
        let start = OpId::new(self.replica, self.state.get(&self.replica));

        let mut left = origin;
        let run: Vec<Block> = text
            .chars()
            .enumerate()
            .map(|(i, ch)| {
                let id = start.offset(i as u64);
                let block = Block {
                    id,
                    origin: left,
                    right_origin,
                    content: ch,
                    deleted: false,
                };
                left = Some(id);
                block
            })
            .collect();
        let n = run.len();
        self.blocks.splice(index..index, run);
        self.visible_len += n;
        self.state.advance(self.replica, start.clock + n as u64);

        trace!("Local insert of {} chars at {} as {}", n, position, start);
        Ok(Update::new(vec![Operation::Insert {
            id: start,
            origin,
            right_origin,
            content: text.to_string(),
        }]))
    }

    /// Tombstone `length` visible chars starting at `position`.
    pub fn apply_local_delete(&mut self, position: usize, length: usize) -> Result<Update, DocumentError> {
        let end = position.saturating_add(length);
        if end > self.visible_len {
            return Err(DocumentError::OutOfRange {
                position: end,
                len: self.visible_len,
            });
        }
        if length == 0 {
            return Ok(Update::empty());
        }

        let mut removed = Vec::with_capacity(length);
        let mut visible = 0usize;
        for block in self.blocks.iter_mut() {
            if visible >= end {
                break;
            }
            if block.deleted {
                continue;
            }
            if visible >= position {
                block.deleted = true;
                removed.push(block.id);
            }
            visible += 1;
        }
        self.visible_len -= removed.len();

        let id = OpId::new(self.replica, self.state.get(&self.replica));
        let targets = IdRange::compress(removed);
        self.deletes.push(DeleteMark {
            id,
            targets: targets.clone(),
        });
        self.state.advance(self.replica, id.clock + 1);

        trace!("Local delete of {} chars at {} as {}", length, position, id);
        Ok(Update::new(vec![Operation::Delete { id, targets }]))
    }

    /// Apply a replace span as a delete followed by an insert.
    pub fn apply_local_edit(&mut self, edit: &TextEdit) -> Result<Update, DocumentError> {
        if edit.offset + edit.deleted > self.visible_len {
            return Err(DocumentError::OutOfRange {
                position: edit.offset + edit.deleted,
                len: self.visible_len,
            });
        }
        let mut update = self.apply_local_delete(edit.offset, edit.deleted)?;
        update.extend(self.apply_local_insert(edit.offset, &edit.inserted)?);
        Ok(update)
    }

    /// Decode and merge an encoded [`Update`].
    pub fn merge_remote_bytes(&mut self, bytes: &[u8]) -> Result<AppliedDelta, DocumentError> {
        let update = Update::decode(bytes)?;
        Ok(self.merge_remote(&update))
    }

    /// Integrate a remote update and return its visible effect.
    ///
    /// Operations already integrated are skipped. Operations with missing
    /// dependencies wait in the pending queue and are retried whenever
    /// something else integrates.
    pub fn merge_remote(&mut self, update: &Update) -> AppliedDelta {
        let mut tracker = MergeTracker::default();
        let mut progressed = false;

        for op in &update.ops {
            match self.readiness(op) {
                Readiness::Duplicate => trace!("Skipping already integrated {}", op.id()),
                Readiness::Ready => {
                    self.integrate(op, &mut tracker);
                    progressed = true;
                }
                Readiness::Blocked => self.park(op.clone()),
            }
        }

        if progressed {
            self.drain_pending(&mut tracker);
        }
        self.age_pending();

        tracker.into_delta(&self.blocks)
    }

    /// Every integrated operation that `remote` has not seen.
    pub fn diff(&self, remote: &StateVector) -> Update {
        let mut missing: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| !remote.contains(&b.id))
            .collect();
        missing.sort_by_key(|b| b.id);

        let mut ops: Vec<Operation> = Vec::new();
        let mut prev: Option<OpId> = None;
        for block in missing {
            let extends_run = match (ops.last(), prev) {
                (Some(Operation::Insert { right_origin, .. }), Some(prev)) => {
                    prev.replica == block.id.replica
                        && prev.clock + 1 == block.id.clock
                        && block.origin == Some(prev)
                        && *right_origin == block.right_origin
                }
                _ => false,
            };
            match ops.last_mut() {
                Some(Operation::Insert { content, .. }) if extends_run => content.push(block.content),
                _ => ops.push(Operation::Insert {
                    id: block.id,
                    origin: block.origin,
                    right_origin: block.right_origin,
                    content: block.content.to_string(),
                }),
            }
            prev = Some(block.id);
        }

        ops.extend(
            self.deletes
                .iter()
                .filter(|d| !remote.contains(&d.id))
                .map(|d| Operation::Delete {
                    id: d.id,
                    targets: d.targets.clone(),
                }),
        );

        Update::new(ops)
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        snapshot::encode(&SnapshotBody {
            blocks: self.blocks.clone(),
            deletes: self.deletes.clone(),
            pending: self.pending.clone(),
            state: self.state.clone(),
        })
    }

    /// Restore a document from a snapshot under a fresh replica id.
    pub fn import_snapshot(replica: ReplicaId, bytes: &[u8]) -> Result<Self, DocumentError> {
        Self::import_snapshot_with_config(replica, bytes, DocumentConfig::default())
    }

    pub fn import_snapshot_with_config(
        replica: ReplicaId,
        bytes: &[u8],
        config: DocumentConfig,
    ) -> Result<Self, DocumentError> {
        let body = snapshot::decode(bytes)?;
        if body.state.get(&replica) > 0 {
            return Err(DocumentError::ReplicaReused(replica));
        }

        let visible_len = body.blocks.iter().filter(|b| !b.deleted).count();
        debug!(
            "Imported snapshot: {} blocks, {} visible, {} pending",
            body.blocks.len(),
            visible_len,
            body.pending.len()
        );
        Ok(Self {
            replica,
            blocks: body.blocks,
            deletes: body.deletes,
            state: body.state,
            pending: body.pending,
            visible_len,
            config,
        })
    }

    // ─── Integration ───

    /// Block index at which a local insert at visible `position` goes:
    /// right after the visible char at `position - 1`.
    fn insertion_index(&self, position: usize) -> usize {
        if position == 0 {
            return 0;
        }
        let mut visible = 0usize;
        for (i, block) in self.blocks.iter().enumerate() {
            if !block.deleted {
                visible += 1;
                if visible == position {
                    return i + 1;
                }
            }
        }
        self.blocks.len()
    }

    fn index_of(&self, id: &OpId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == *id)
    }

    fn readiness(&self, op: &Operation) -> Readiness {
        match op {
            Operation::Insert {
                id,
                origin,
                right_origin,
                content,
            } => {
                let next = self.state.get(&id.replica);
                let len = content.chars().count() as u64;
                if len == 0 || id.clock + len <= next {
                    Readiness::Duplicate
                } else if id.clock > next {
                    Readiness::Blocked
                } else if origin.map_or(true, |o| self.state.contains(&o))
                    && right_origin.map_or(true, |r| self.state.contains(&r))
                {
                    Readiness::Ready
                } else {
                    Readiness::Blocked
                }
            }
            Operation::Delete { id, targets } => {
                let next = self.state.get(&id.replica);
                if id.clock < next {
                    Readiness::Duplicate
                } else if id.clock > next {
                    Readiness::Blocked
                } else if targets
                    .iter()
                    .all(|r| self.state.get(&r.replica) >= r.end())
                {
                    Readiness::Ready
                } else {
                    Readiness::Blocked
                }
            }
        }
    }

    fn integrate(&mut self, op: &Operation, tracker: &mut MergeTracker) {
        match op {
            Operation::Insert {
                id,
                origin,
                right_origin,
                content,
            } => {
                // Skip the prefix of a run that was already integrated.
                let seen = self.state.get(&id.replica) - id.clock;
                let mut left = if seen == 0 {
                    *origin
                } else {
                    Some(id.offset(seen - 1))
                };
                let mut left_index = left.and_then(|l| self.index_of(&l));

                let mut count = 0u64;
                for (i, ch) in content.chars().enumerate().skip(seen as usize) {
                    let block = Block {
                        id: id.offset(i as u64),
                        origin: left,
                        right_origin: *right_origin,
                        content: ch,
                        deleted: false,
                    };
                    let at = self.find_insert_index(&block, left_index);
                    left = Some(block.id);
                    left_index = Some(at);
                    tracker.inserted.insert(block.id);
                    self.blocks.insert(at, block);
                    count += 1;
                }
                self.visible_len += count as usize;
                self.state.advance(id.replica, id.clock + seen + count);
                trace!("Integrated {} chars from {}", count, id);
            }
            Operation::Delete { id, targets } => {
                let positions: HashMap<OpId, usize> = self
                    .blocks
                    .iter()
                    .enumerate()
                    .map(|(i, b)| (b.id, i))
                    .collect();
                for range in targets {
                    for target in range.ids() {
                        let Some(&i) = positions.get(&target) else {
                            continue;
                        };
                        let block = &mut self.blocks[i];
                        if !block.deleted {
                            block.deleted = true;
                            self.visible_len -= 1;
                            if !tracker.inserted.contains(&target) {
                                tracker.deleted.insert(target);
                            }
                        }
                    }
                }
                self.deletes.push(DeleteMark {
                    id: *id,
                    targets: targets.clone(),
                });
                self.state.advance(id.replica, id.clock + 1);
                trace!("Integrated delete {}", id);
            }
        }
    }

    /// YATA placement of `block` between its origins.
    fn find_insert_index(&self, block: &Block, left_hint: Option<usize>) -> usize {
        let left = match block.origin {
            Some(origin) => left_hint
                .filter(|&i| self.blocks.get(i).is_some_and(|b| b.id == origin))
                .or_else(|| self.index_of(&origin)),
            None => None,
        };
        let right = block
            .right_origin
            .and_then(|r| self.index_of(&r))
            .unwrap_or(self.blocks.len());

        let mut dest = left.map_or(0, |l| l + 1);
        let mut before_origin: HashSet<OpId> = HashSet::new();
        let mut conflicting: HashSet<OpId> = HashSet::new();
        let mut i = dest;
        while i < right {
            let other = &self.blocks[i];
            before_origin.insert(other.id);
            conflicting.insert(other.id);

            if other.origin == block.origin {
                if other.id.replica < block.id.replica {
                    dest = i + 1;
                    conflicting.clear();
                } else if other.right_origin == block.right_origin {
                    break;
                }
            } else if let Some(other_origin) = other.origin.filter(|o| before_origin.contains(o)) {
                if !conflicting.contains(&other_origin) {
                    dest = i + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
            i += 1;
        }
        dest
    }

    // ─── Pending queue ───

    /// Queue a blocked operation. A run that starts at an already parked id
    /// replaces the parked one when it covers more clocks: handshake diffs
    /// coalesce consecutive inserts into longer runs.
    fn park(&mut self, op: Operation) {
        let id = op.id();
        if let Some(entry) = self.pending.iter_mut().find(|p| p.op.id() == id) {
            if op.clock_len() > entry.op.clock_len() {
                debug!(
                    "Extending parked {} from {} to {} clocks",
                    id,
                    entry.op.clock_len(),
                    op.clock_len()
                );
                *entry = PendingOp { op, rounds: 0 };
            }
            return;
        }
        debug!("Parking {} until its dependencies arrive", id);
        self.pending.push(PendingOp { op, rounds: 0 });
    }

    fn drain_pending(&mut self, tracker: &mut MergeTracker) {
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.pending.len() {
                match self.readiness(&self.pending[i].op) {
                    Readiness::Duplicate => {
                        self.pending.remove(i);
                    }
                    Readiness::Ready => {
                        let entry = self.pending.remove(i);
                        self.integrate(&entry.op, tracker);
                        progressed = true;
                    }
                    Readiness::Blocked => i += 1,
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn age_pending(&mut self) {
        let limit = self.config.max_pending_rounds;
        for entry in &mut self.pending {
            entry.rounds += 1;
        }
        self.pending.retain(|entry| {
            if entry.rounds >= limit {
                warn!(
                    "Dropping {} after {} merges with unresolved dependencies; \
                     it will be re-sent by the next sync handshake",
                    entry.op.id(),
                    entry.rounds
                );
                false
            } else {
                true
            }
        });
    }
}
