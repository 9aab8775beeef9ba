//! Chain processor
//!
//! The node's core state machine. Ingests headers and bodies in any order,
//! selects the best reachable tip by cumulative work, walks forks (rolling
//! the canonical chain back and applying the better branch forward), keeps
//! the UTXO and kernel trees bit-for-bit consistent with the tip, prunes
//! behind the configured horizons, and requests whatever is missing from
//! peers.
//!
//! Single-threaded cooperative: every entry point runs to completion on the
//! caller's thread; there are no suspension points.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consensus::{
    check_coinbase_sum, check_kernel_window, check_output_maturity, difficulty_valid, pow_ok,
    retarget, should_retarget, validate_body, work, ContextualError, Header, Input, StateId,
    TxBody,
};
use crate::constants::{INITIAL_DIFFICULTY, MAX_BLOCK_SIZE, RETARGET_INTERVAL};
use crate::crypto::Hash;
use crate::node::{ConfigError, Horizon, NodeEvents, PeerId, TxPool};
use crate::storage::{flags, utxo_key, KernelTree, StateRecord, StateStore, StoreError, UtxoTree};

/// Processor errors
///
/// `Corrupted` is fatal: the store no longer matches the in-memory trees or
/// its own invariants, and the process is expected to terminate.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Chain state corrupted: {0}")]
    Corrupted(String),
}

/// Everything needed to undo one applied block without consulting the body
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RollbackData {
    /// UTXO entries consumed by the block, restored verbatim on rollback
    spent: Vec<Input>,
    /// UTXO entries created by the block
    created: Vec<Input>,
    /// Kernel ids added by the block
    kernels: Vec<Hash>,
}

/// Apply a body's elements to a pair of trees at `height`
///
/// On any contextual failure the partial mutation is undone before the
/// error is returned; the trees are untouched on failure. Shared by the
/// canonical apply path and the block builder's overlay simulation.
pub(crate) fn apply_elements(
    utxo: &mut UtxoTree,
    kernels: &mut KernelTree,
    body: &TxBody,
    height: u64,
) -> Result<RollbackData, ContextualError> {
    let mut rollback = RollbackData::default();
    if let Err(e) = apply_elements_inner(utxo, kernels, body, height, &mut rollback) {
        undo_elements(utxo, kernels, &rollback);
        return Err(e);
    }
    Ok(rollback)
}

fn apply_elements_inner(
    utxo: &mut UtxoTree,
    kernels: &mut KernelTree,
    body: &TxBody,
    height: u64,
    rollback: &mut RollbackData,
) -> Result<(), ContextualError> {
    // Outputs land before inputs are consumed, so a block may spend an
    // output another of its transactions created.
    for output in &body.outputs {
        check_output_maturity(output, height)?;
        utxo.add(utxo_key(&output.commitment, output.maturity));
        rollback.created.push(Input {
            commitment: output.commitment,
            maturity: output.maturity,
        });
    }
    for input in &body.inputs {
        if input.maturity > height {
            return Err(ContextualError::ImmatureSpend);
        }
        let key = utxo_key(&input.commitment, input.maturity);
        utxo.remove(&key)
            .map_err(|_| ContextualError::MissingInput)?;
        rollback.spent.push(*input);
    }
    for kernel in &body.kernels {
        check_kernel_window(kernel, height)?;
        let kernel_id = kernel.id();
        kernels
            .add(kernel_id)
            .map_err(|_| ContextualError::DuplicateChainKernel)?;
        rollback.kernels.push(kernel_id);
    }
    Ok(())
}

/// Undo a freshly applied `RollbackData`, in exact reverse of apply order
/// (kernels out, spent entries back, created entries out)
///
/// Every entry was added or removed by the matching apply, so the undo
/// cannot miss.
pub(crate) fn undo_elements(utxo: &mut UtxoTree, kernels: &mut KernelTree, rollback: &RollbackData) {
    for kernel_id in rollback.kernels.iter().rev() {
        kernels
            .remove(kernel_id)
            .expect("undo removes a kernel the apply added");
    }
    for entry in rollback.spent.iter().rev() {
        utxo.add(utxo_key(&entry.commitment, entry.maturity));
    }
    for entry in rollback.created.iter().rev() {
        utxo.remove(&utxo_key(&entry.commitment, entry.maturity))
            .expect("undo removes an output the apply added");
    }
}

enum ApplyOutcome {
    Applied,
    Rejected,
}

/// The node chain processor
pub struct ChainProcessor<E: NodeEvents> {
    pub(crate) store: StateStore,
    pub(crate) utxo: UtxoTree,
    pub(crate) kernels: KernelTree,
    pub(crate) pool: TxPool,
    horizon: Horizon,
    events: E,
}

impl<E: NodeEvents> ChainProcessor<E> {
    /// Attach a processor to an opened store
    ///
    /// Restores the commitment trees from the persisted snapshots; the
    /// mempool starts empty (it is volatile across restarts).
    pub fn open(store: StateStore, horizon: Horizon, events: E) -> Result<Self, ProcessorError> {
        horizon.validate()?;
        if let Some(previous) = store.horizon()? {
            if previous != horizon {
                info!(?previous, ?horizon, "horizon configuration changed");
            }
        }
        store.set_horizon(&horizon)?;
        let (utxo, kernels) = store.load_trees()?;
        Ok(ChainProcessor {
            store,
            utxo,
            kernels,
            pool: TxPool::new(),
            horizon,
            events,
        })
    }

    /// The active tip id
    pub fn tip_id(&self) -> Result<Option<StateId>, ProcessorError> {
        Ok(self.store.tip()?)
    }

    /// The active tip header
    pub fn current_state(&self) -> Result<Option<Header>, ProcessorError> {
        match self.store.tip()? {
            Some(tip) => Ok(self.store.get_state(&tip)?.map(|r| r.header)),
            None => Ok(None),
        }
    }

    /// Read access to the mempool
    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    /// Read access to the store, for serving data to peers
    ///
    /// Readers must tolerate "not found": records may be pruned at any tip
    /// advance.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Root of the UTXO tree at the current tip
    pub fn utxo_root(&self) -> Hash {
        self.utxo.root()
    }

    /// Root of the kernel tree at the current tip
    pub fn kernel_root(&mut self) -> Hash {
        self.kernels.root()
    }

    /// Multiplicity of a UTXO at the current tip
    pub fn utxo_count(&self, commitment: &crate::crypto::Commitment, maturity: u64) -> u32 {
        self.utxo.count(&utxo_key(commitment, maturity))
    }

    /// Whether a header id is worth fetching
    ///
    /// Unknown states are needed unless they already fell behind the
    /// branching horizon, where no reorg can reach them.
    pub fn is_state_needed(&self, id: &StateId) -> Result<bool, ProcessorError> {
        if self.store.get_state(id)?.is_some() {
            return Ok(false);
        }
        if self.horizon.branching > 0 {
            if let Some(tip) = self.store.tip()? {
                if id.height + self.horizon.branching <= tip.height {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Ingest a header from a peer
    ///
    /// Returns whether the header was new and accepted. Structural or PoW
    /// failures mark the peer insane.
    pub fn on_state(&mut self, header: &Header, peer: PeerId) -> Result<bool, ProcessorError> {
        if !self.header_sane(header) {
            self.events.on_peer_insane(peer);
            return Ok(false);
        }

        let (id, new) = self
            .store
            .put_state(header, flags::FUNCTIONAL, Some(peer))?;
        if !new {
            return Ok(false);
        }
        debug!(%id, "new header");

        if header.is_genesis() {
            self.store.set_flags(&id, flags::REACHABLE, true)?;
            self.cascade_reachable(id, header.chain_work)?;
        } else if let Some(parent_id) = header.parent_id() {
            if let Some(parent) = self.store.get_state(&parent_id)? {
                if parent.has(flags::REACHABLE) && self.try_reach(&id, parent.header.chain_work)? {
                    self.cascade_reachable(id, header.chain_work)?;
                }
            }
        }

        self.try_go_up()?;
        Ok(true)
    }

    /// Ingest a block body from a peer
    ///
    /// The id must refer to a known header without a body. Bytes are
    /// validated context-free before they are stored; malformed bodies mark
    /// the peer insane.
    pub fn on_block(
        &mut self,
        id: &StateId,
        body_bytes: &[u8],
        peer: PeerId,
    ) -> Result<bool, ProcessorError> {
        let Some(record) = self.store.get_state(id)? else {
            return Ok(false);
        };
        if !record.has(flags::FUNCTIONAL) {
            // The state was already rejected; pushing its body again is
            // pushing a known-bad block.
            self.events.on_peer_insane(peer);
            return Ok(false);
        }
        if record.has(flags::HAS_BODY) || record.has(flags::FOSSIL) {
            return Ok(false);
        }

        if body_bytes.len() > MAX_BLOCK_SIZE {
            self.events.on_peer_insane(peer);
            return Ok(false);
        }
        let body = match TxBody::decode(body_bytes) {
            Ok(body) => body,
            Err(_) => {
                self.events.on_peer_insane(peer);
                return Ok(false);
            }
        };
        if let Err(e) = validate_body(&body) {
            debug!(%id, error = %e, "malformed block body");
            self.events.on_peer_insane(peer);
            return Ok(false);
        }

        self.store.set_body(id, body_bytes)?;
        self.store.set_peer(id, peer)?;
        debug!(%id, "new block body");

        self.try_go_up()?;
        Ok(true)
    }

    /// Walk every congested branch and request its first missing piece
    ///
    /// A branch is congested when a Functional head claims more cumulative
    /// work than the active tip but headers or bodies on its path are still
    /// missing.
    pub fn enum_congestions(&mut self) -> Result<(), ProcessorError> {
        let tip_work = match self.store.tip()? {
            Some(tip) => {
                self.store
                    .get_state(&tip)?
                    .ok_or_else(|| self.corrupted("active tip record missing"))?
                    .header
                    .chain_work
            }
            None => 0,
        };

        let mut candidates: Vec<(StateId, StateRecord)> = Vec::new();
        for item in self.store.states() {
            let (id, record) = item?;
            if record.has(flags::FUNCTIONAL)
                && !record.has(flags::ACTIVE)
                && record.header.chain_work > tip_work
            {
                candidates.push((id, record));
            }
        }

        for (head_id, head) in candidates {
            // Only branch heads: skip states with a functional child
            let mut has_functional_child = false;
            for child in self.store.children(&head_id)? {
                if let Some(child_record) = self.store.get_state(&child)? {
                    if child_record.has(flags::FUNCTIONAL) {
                        has_functional_child = true;
                        break;
                    }
                }
            }
            if has_functional_child {
                continue;
            }
            self.request_first_gap(head_id, head)?;
        }
        Ok(())
    }

    /// Accept a loose transaction into the mempool
    pub fn add_transaction(&mut self, tx: TxBody) -> Result<bool, ProcessorError> {
        let height = self.store.tip()?.map(|t| t.height).unwrap_or(0);
        match self.pool.add(tx, height) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(error = %e, "transaction refused");
                Ok(false)
            }
        }
    }

    fn corrupted(&self, msg: &str) -> ProcessorError {
        tracing::error!("chain state corrupted: {msg}");
        ProcessorError::Corrupted(msg.to_string())
    }

    /// Structural and PoW checks that need no context
    fn header_sane(&self, header: &Header) -> bool {
        if header.height == 0 {
            return false;
        }
        if (header.height == 1) != (header.prev_hash == Hash::zero()) {
            return false;
        }
        if !difficulty_valid(header.difficulty) {
            return false;
        }
        if header.is_genesis()
            && (header.difficulty != INITIAL_DIFFICULTY
                || header.chain_work != work(header.difficulty))
        {
            return false;
        }
        pow_ok(&header.hash(), header.difficulty)
    }

    /// Check the work linkage of a child whose parent is Reachable; marks
    /// the child Reachable on success, rejects it (and its supplier) on a
    /// bogus work claim.
    fn try_reach(&mut self, id: &StateId, parent_work: u128) -> Result<bool, ProcessorError> {
        let record = self
            .store
            .get_state(id)?
            .ok_or_else(|| self.corrupted("reach target missing"))?;
        let expected = parent_work.saturating_add(work(record.header.difficulty));
        if record.header.chain_work != expected {
            warn!(%id, "header claims inconsistent chain work");
            self.store.set_flags(id, flags::FUNCTIONAL, false)?;
            if let Some(peer) = record.peer {
                self.events.on_peer_insane(peer);
            }
            return Ok(false);
        }
        self.store.set_flags(id, flags::REACHABLE, true)?;
        Ok(true)
    }

    /// Spread Reachable to every descendant whose ancestors are all
    /// Functional
    fn cascade_reachable(&mut self, from: StateId, from_work: u128) -> Result<(), ProcessorError> {
        let mut queue = VecDeque::from([(from, from_work)]);
        while let Some((id, chain_work)) = queue.pop_front() {
            for child_id in self.store.children(&id)? {
                let Some(child) = self.store.get_state(&child_id)? else {
                    continue;
                };
                if !child.has(flags::FUNCTIONAL) || child.has(flags::REACHABLE) {
                    continue;
                }
                if self.try_reach(&child_id, chain_work)? {
                    queue.push_back((child_id, child.header.chain_work));
                }
            }
        }
        Ok(())
    }

    /// Clear Reachable from a rejected state's descendants
    fn cascade_unreachable(&mut self, from: StateId) -> Result<(), ProcessorError> {
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            for child_id in self.store.children(&id)? {
                let Some(child) = self.store.get_state(&child_id)? else {
                    continue;
                };
                if child.has(flags::REACHABLE) {
                    self.store.set_flags(&child_id, flags::REACHABLE, false)?;
                    queue.push_back(child_id);
                }
            }
        }
        Ok(())
    }

    /// Drop a contextually invalid state and everything that depended on it
    fn reject_state(&mut self, id: &StateId, insane: bool) -> Result<(), ProcessorError> {
        let record = self
            .store
            .get_state(id)?
            .ok_or_else(|| self.corrupted("rejected state missing"))?;
        self.store
            .set_flags(id, flags::FUNCTIONAL | flags::REACHABLE, false)?;
        self.cascade_unreachable(*id)?;
        if insane {
            if let Some(peer) = record.peer {
                self.events.on_peer_insane(peer);
            }
        }
        Ok(())
    }

    /// Tip selection: move the canonical chain to the best reachable state
    fn try_go_up(&mut self) -> Result<(), ProcessorError> {
        let starting_tip = self.store.tip()?;

        loop {
            let Some((best_id, _)) = self.best_reachable()? else {
                break;
            };
            let tip = self.store.tip()?;
            if Some(best_id) == tip {
                break;
            }

            let fork = self.find_fork(tip, best_id)?;
            if !self.rollback_to(fork)? {
                // Reorg would cross the erase horizon; refuse and stay put.
                break;
            }

            let path = self.path_between(fork, best_id)?;
            let mut rejected = false;
            for id in path {
                let Some(record) = self.store.get_state(&id)? else {
                    return Err(self.corrupted("path state missing"));
                };
                if !record.has(flags::HAS_BODY) {
                    // Congestion: the body will be requested later.
                    break;
                }
                match self.apply_block(&id, &record)? {
                    ApplyOutcome::Applied => {}
                    ApplyOutcome::Rejected => {
                        rejected = true;
                        break;
                    }
                }
            }
            if !rejected {
                break;
            }
            // The best candidate turned out invalid; pick the next one.
        }

        let final_tip = self.store.tip()?;
        if final_tip != starting_tip {
            if let Some(tip) = final_tip {
                info!(%tip, "tip moved");
                self.prune(tip.height)?;
                self.pool.delete_out_of_bound(tip.height + 1);
            }
            self.events.on_new_state();
        }
        Ok(())
    }

    /// The Reachable state with maximum cumulative work, ties broken by
    /// lower header hash
    fn best_reachable(&self) -> Result<Option<(StateId, u128)>, ProcessorError> {
        let mut best: Option<(StateId, u128)> = None;
        for item in self.store.states() {
            let (id, record) = item?;
            if !record.has(flags::REACHABLE) || !record.has(flags::FUNCTIONAL) {
                continue;
            }
            let chain_work = record.header.chain_work;
            best = match best {
                None => Some((id, chain_work)),
                Some((best_id, best_work)) => {
                    if chain_work > best_work
                        || (chain_work == best_work && id.hash < best_id.hash)
                    {
                        Some((id, chain_work))
                    } else {
                        Some((best_id, best_work))
                    }
                }
            };
        }
        Ok(best)
    }

    /// Lowest common ancestor of the active tip and a candidate
    fn find_fork(
        &self,
        tip: Option<StateId>,
        best: StateId,
    ) -> Result<Option<StateId>, ProcessorError> {
        let Some(tip) = tip else {
            return Ok(None);
        };
        let mut a = tip;
        let mut b = best;
        while a != b {
            if a.height > b.height {
                let Some(parent) = self.parent_of(&a)? else {
                    return Ok(None);
                };
                a = parent;
            } else if b.height > a.height {
                let Some(parent) = self.parent_of(&b)? else {
                    return Ok(None);
                };
                b = parent;
            } else {
                let (Some(pa), Some(pb)) = (self.parent_of(&a)?, self.parent_of(&b)?) else {
                    return Ok(None);
                };
                a = pa;
                b = pb;
            }
        }
        Ok(Some(a))
    }

    fn parent_of(&self, id: &StateId) -> Result<Option<StateId>, ProcessorError> {
        let record = self
            .store
            .get_state(id)?
            .ok_or_else(|| self.corrupted("walk hit a missing header"))?;
        Ok(record.header.parent_id())
    }

    /// Ids strictly above `fork` up to `best`, ascending (inclusive of best)
    fn path_between(
        &self,
        fork: Option<StateId>,
        best: StateId,
    ) -> Result<Vec<StateId>, ProcessorError> {
        let mut path = Vec::new();
        let mut cursor = Some(best);
        while let Some(id) = cursor {
            if Some(id) == fork {
                break;
            }
            path.push(id);
            cursor = self.parent_of(&id)?;
        }
        path.reverse();
        Ok(path)
    }

    /// Roll the active chain back down to the fork point
    ///
    /// Returns false when the rollback would need a fossilized body, in
    /// which case the reorg is refused.
    fn rollback_to(&mut self, fork: Option<StateId>) -> Result<bool, ProcessorError> {
        loop {
            let Some(tip) = self.store.tip()? else {
                return Ok(true);
            };
            if Some(tip) == fork {
                return Ok(true);
            }
            if let Some(fork) = fork {
                if tip.height <= fork.height {
                    return Err(self.corrupted("rollback walked past the fork point"));
                }
            }
            let record = self
                .store
                .get_state(&tip)?
                .ok_or_else(|| self.corrupted("active tip record missing"))?;
            if record.has(flags::FOSSIL) || !record.has(flags::HAS_BODY) {
                warn!(%tip, "refusing reorg across the erase horizon");
                return Ok(false);
            }
            self.unapply_block(&tip, &record)?;
        }
    }

    /// Undo one applied block using its persisted rollback data
    fn unapply_block(&mut self, id: &StateId, record: &StateRecord) -> Result<(), ProcessorError> {
        let rollback_bytes = self
            .store
            .get_rollback(id)?
            .ok_or_else(|| self.corrupted("rollback data missing for active block"))?;
        let rollback: RollbackData = bincode::deserialize(&rollback_bytes)?;

        for kernel_id in rollback.kernels.iter().rev() {
            self.kernels
                .remove(kernel_id)
                .map_err(|_| self.corrupted("kernel missing during rollback"))?;
        }
        for entry in rollback.spent.iter().rev() {
            self.utxo.add(utxo_key(&entry.commitment, entry.maturity));
        }
        for entry in rollback.created.iter().rev() {
            self.utxo
                .remove(&utxo_key(&entry.commitment, entry.maturity))
                .map_err(|_| self.corrupted("created output missing during rollback"))?;
        }

        let parent = record.header.parent_id();
        self.store.commit_rollback(
            id,
            parent,
            &self.utxo.serialize(),
            &self.kernels.serialize(),
        )?;
        debug!(%id, "rolled back");

        // Give the block's user transactions back to the pool while their
        // kernels are still within validity.
        if let Some(body_bytes) = self.store.get_body(id)? {
            if let Ok(body) = TxBody::decode(&body_bytes) {
                let mut stripped = body.strip_minted();
                if !stripped.kernels.is_empty() {
                    stripped.normalize();
                    let height = parent.map(|p| p.height).unwrap_or(0);
                    if let Err(e) = self.pool.add(stripped, height) {
                        debug!(%id, error = %e, "rolled-back transactions not re-pooled");
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one block on top of the current state
    ///
    /// On contextual failure the trees are left untouched, the state is
    /// rejected, and `Rejected` is returned.
    fn apply_block(
        &mut self,
        id: &StateId,
        record: &StateRecord,
    ) -> Result<ApplyOutcome, ProcessorError> {
        let body_bytes = self
            .store
            .get_body(id)?
            .ok_or_else(|| self.corrupted("body missing for apply"))?;
        let body =
            TxBody::decode(&body_bytes).map_err(|_| self.corrupted("stored body undecodable"))?;

        let height = id.height;
        let mut failure: Option<ContextualError> = self.check_header_context(&record.header).err();
        if failure.is_none() {
            failure = check_coinbase_sum(&body, height).err();
        }

        let mut rollback = None;
        if failure.is_none() {
            match apply_elements(&mut self.utxo, &mut self.kernels, &body, height) {
                Ok(data) => rollback = Some(data),
                Err(e) => failure = Some(e),
            }
        }

        if failure.is_none()
            && (self.utxo.root() != record.header.utxo_root
                || self.kernels.root() != record.header.kernel_root)
        {
            failure = Some(ContextualError::RootMismatch);
            if let Some(data) = &rollback {
                undo_elements(&mut self.utxo, &mut self.kernels, data);
            }
        }

        match failure {
            None => {
                let rollback_bytes =
                    bincode::serialize(&rollback.unwrap_or_default())?;
                self.store.commit_apply(
                    id,
                    &rollback_bytes,
                    &self.utxo.serialize(),
                    &self.kernels.serialize(),
                )?;
                self.pool.delete_by_kernels(&body.kernel_ids());
                debug!(%id, "applied");
                Ok(ApplyOutcome::Applied)
            }
            Some(error) => {
                warn!(%id, %error, "block failed contextual validation");
                let insane = matches!(error, ContextualError::RootMismatch);
                self.reject_state(id, insane)?;
                Ok(ApplyOutcome::Rejected)
            }
        }
    }

    /// Contextual header check: the declared difficulty must match what the
    /// retarget schedule demands
    fn check_header_context(&self, header: &Header) -> Result<(), ContextualError> {
        let parent_header = match header.parent_id() {
            Some(parent_id) => match self.store.get_state(&parent_id) {
                Ok(Some(record)) => Some(record.header),
                _ => None,
            },
            None => None,
        };
        let expected = self.next_difficulty(parent_header.as_ref());
        if header.difficulty != expected {
            return Err(ContextualError::WrongDifficulty);
        }
        Ok(())
    }

    /// The difficulty consensus demands for the child of `parent`
    pub(crate) fn next_difficulty(&self, parent: Option<&Header>) -> u32 {
        let Some(parent) = parent else {
            return INITIAL_DIFFICULTY;
        };
        if !should_retarget(parent.height) {
            return parent.difficulty;
        }
        // Walk back to the first header of the closing period
        let mut cursor = parent.clone();
        for _ in 1..RETARGET_INTERVAL {
            let Some(prev_id) = cursor.parent_id() else {
                break;
            };
            match self.store.get_state(&prev_id) {
                Ok(Some(prev)) => cursor = prev.header,
                _ => break,
            }
        }
        retarget(parent.difficulty, cursor.timestamp, parent.timestamp)
    }

    /// Request the first gap below one congested head
    fn request_first_gap(
        &mut self,
        head_id: StateId,
        head: StateRecord,
    ) -> Result<(), ProcessorError> {
        let mut preferred = head.peer;
        let mut cursor_id = head_id;
        let mut cursor = head;
        let mut lowest_missing_body: Option<StateId> = None;

        let request = loop {
            if cursor.has(flags::ACTIVE) {
                break lowest_missing_body.map(|id| (id, true));
            }
            if !cursor.has(flags::HAS_BODY) && !cursor.has(flags::FOSSIL) {
                lowest_missing_body = Some(cursor_id);
            }
            match cursor.header.parent_id() {
                None => break lowest_missing_body.map(|id| (id, true)),
                Some(parent_id) => match self.store.get_state(&parent_id)? {
                    None => break Some((parent_id, false)),
                    Some(parent) => {
                        if preferred.is_none() {
                            preferred = parent.peer;
                        }
                        cursor_id = parent_id;
                        cursor = parent;
                    }
                },
            }
        };

        if let Some((id, want_block)) = request {
            debug!(%id, want_block, "congestion");
            self.events.request_data(id, want_block, preferred);
        }
        Ok(())
    }

    /// Prune behind the horizons after a tip move to `tip_height`
    fn prune(&mut self, tip_height: u64) -> Result<(), ProcessorError> {
        // Branching horizon: delete whole stale branches, leaf-first, so a
        // record with a surviving descendant is never removed.
        if self.horizon.branching > 0 && tip_height > self.horizon.branching {
            let floor = tip_height - self.horizon.branching;
            loop {
                let mut doomed = Vec::new();
                for item in self.store.states() {
                    let (id, record) = item?;
                    if id.height > floor {
                        break;
                    }
                    if record.has(flags::ACTIVE) {
                        continue;
                    }
                    if self.store.children(&id)?.is_empty() {
                        doomed.push(id);
                    }
                }
                if doomed.is_empty() {
                    break;
                }
                for id in &doomed {
                    debug!(%id, "pruning stale branch record");
                    self.store.delete_state(id)?;
                }
            }
        }

        // Erase horizon: fossilize canonical bodies the chain can no longer
        // rewind to.
        if self.horizon.erase > 0 && tip_height > self.horizon.erase {
            let floor = tip_height - self.horizon.erase;
            for height in 1..=floor {
                let Some(id) = self.store.active_at(height)? else {
                    continue;
                };
                let Some(record) = self.store.get_state(&id)? else {
                    continue;
                };
                if record.has(flags::HAS_BODY) {
                    debug!(%id, "fossilizing block");
                    self.store.erase_body(&id)?;
                }
            }
        }
        Ok(())
    }
}
