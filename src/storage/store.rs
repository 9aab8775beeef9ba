//! Persistent chain state store
//!
//! sled-backed storage of headers, bodies, per-state flags, and the
//! serialized commitment trees. Canonical-chain transitions (`commit_apply`,
//! `commit_rollback`) run as single multi-tree transactions: a crash leaves
//! the chain strictly before or strictly after the block, never in between.

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use thiserror::Error;
use tracing::error;

use crate::consensus::{Header, StateId};
use crate::crypto::Hash;
use crate::node::{Horizon, PeerId};
use crate::storage::{KernelTree, UtxoTree};

/// Per-state flag bits
pub mod flags {
    /// Header is well-formed and PoW-verified
    pub const FUNCTIONAL: u8 = 0b0000_0001;
    /// Unbroken chain of Functional ancestors back to genesis
    pub const REACHABLE: u8 = 0b0000_0010;
    /// On the canonical chain
    pub const ACTIVE: u8 = 0b0000_0100;
    /// Raw body bytes are stored
    pub const HAS_BODY: u8 = 0b0000_1000;
    /// Body and rollback data erased behind the horizon; header remains
    pub const FOSSIL: u8 = 0b0001_0000;
}

const TIP_KEY: &str = "tip";
const GENESIS_KEY: &str = "genesis";
const HORIZON_KEY: &str = "horizon";
const UTXO_SNAPSHOT_KEY: &str = "utxo";
const KERNEL_SNAPSHOT_KEY: &str = "kernels";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("State not found")]
    StateNotFound,
    #[error("Body not found")]
    BodyNotFound,
    #[error("Body already present")]
    BodyExists,
    #[error("Store is corrupted: {0}")]
    Corrupted(String),
}

/// A stored state record: header plus lifecycle flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub header: Header,
    pub flags: u8,
    /// Last peer that supplied data for this state
    pub peer: Option<PeerId>,
}

impl StateRecord {
    /// Check that all bits of `mask` are set
    pub fn has(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }

    /// Identity of this state
    pub fn id(&self) -> StateId {
        self.header.id()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BodyRecord {
    body: Vec<u8>,
    rollback: Option<Vec<u8>>,
}

fn state_key(id: &StateId) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&id.height.to_be_bytes());
    key[8..].copy_from_slice(&id.hash.0);
    key
}

fn height_prefix(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn id_from_state_key(key: &[u8]) -> Result<StateId, StoreError> {
    if key.len() != 40 {
        return Err(StoreError::Corrupted("bad state key length".into()));
    }
    let mut height = [0u8; 8];
    height.copy_from_slice(&key[..8]);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&key[8..]);
    Ok(StateId {
        height: u64::from_be_bytes(height),
        hash: Hash(hash),
    })
}

/// Persistent store of headers, bodies, flags, and tree snapshots
pub struct StateStore {
    _db: Db,
    states: Tree,
    bodies: Tree,
    active: Tree,
    meta: Tree,
}

impl StateStore {
    /// Open or create the store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let states = db.open_tree("states")?;
        let bodies = db.open_tree("bodies")?;
        let active = db.open_tree("active")?;
        let meta = db.open_tree("meta")?;

        let store = StateStore {
            _db: db,
            states,
            bodies,
            active,
            meta,
        };
        store.check_integrity()?;
        Ok(store)
    }

    /// Structural integrity check on reopen
    fn check_integrity(&self) -> Result<(), StoreError> {
        if let Some(tip) = self.tip()? {
            let record = self
                .get_state(&tip)?
                .ok_or_else(|| self.corrupted("tip record missing"))?;
            if !record.has(flags::ACTIVE) {
                return Err(self.corrupted("tip record is not active"));
            }
        }
        Ok(())
    }

    fn corrupted(&self, msg: &str) -> StoreError {
        error!("state store corrupted: {msg}");
        StoreError::Corrupted(msg.to_string())
    }

    /// Insert a header; idempotent
    ///
    /// Returns the state id and whether the record is new. Flags and peer
    /// of an existing record are left untouched.
    pub fn put_state(
        &self,
        header: &Header,
        initial_flags: u8,
        peer: Option<PeerId>,
    ) -> Result<(StateId, bool), StoreError> {
        let id = header.id();
        let key = state_key(&id);
        if self.states.get(key)?.is_some() {
            return Ok((id, false));
        }
        let record = StateRecord {
            header: header.clone(),
            flags: initial_flags,
            peer,
        };
        self.states.insert(key, bincode::serialize(&record)?)?;
        if header.is_genesis() && self.meta.get(GENESIS_KEY)?.is_none() {
            self.meta.insert(GENESIS_KEY, bincode::serialize(&id)?)?;
        }
        Ok((id, true))
    }

    /// Fetch a state record
    pub fn get_state(&self, id: &StateId) -> Result<Option<StateRecord>, StoreError> {
        match self.states.get(state_key(id))? {
            Some(bytes) => Ok(Some(self.decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<StateRecord, StoreError> {
        bincode::deserialize(bytes).map_err(|_| self.corrupted("undecodable state record"))
    }

    /// Read the flag bits of a state
    pub fn get_flags(&self, id: &StateId) -> Result<u8, StoreError> {
        Ok(self
            .get_state(id)?
            .ok_or(StoreError::StateNotFound)?
            .flags)
    }

    /// Set or clear flag bits; returns the new flags
    pub fn set_flags(&self, id: &StateId, mask: u8, on: bool) -> Result<u8, StoreError> {
        let mut record = self.get_state(id)?.ok_or(StoreError::StateNotFound)?;
        if on {
            record.flags |= mask;
        } else {
            record.flags &= !mask;
        }
        self.states
            .insert(state_key(id), bincode::serialize(&record)?)?;
        Ok(record.flags)
    }

    /// Remember the peer that last supplied data for a state
    pub fn set_peer(&self, id: &StateId, peer: PeerId) -> Result<(), StoreError> {
        let mut record = self.get_state(id)?.ok_or(StoreError::StateNotFound)?;
        record.peer = Some(peer);
        self.states
            .insert(state_key(id), bincode::serialize(&record)?)?;
        Ok(())
    }

    /// Store body bytes for a known state
    ///
    /// Fails if the state is unknown or a body is already present.
    pub fn set_body(&self, id: &StateId, body: &[u8]) -> Result<(), StoreError> {
        let mut record = self.get_state(id)?.ok_or(StoreError::StateNotFound)?;
        if record.has(flags::HAS_BODY) || self.bodies.get(id.hash.0)?.is_some() {
            return Err(StoreError::BodyExists);
        }
        record.flags |= flags::HAS_BODY;
        let body_record = BodyRecord {
            body: body.to_vec(),
            rollback: None,
        };
        let record_bytes = bincode::serialize(&record)?;
        let body_bytes = bincode::serialize(&body_record)?;

        (&self.states, &self.bodies)
            .transaction(|(states, bodies)| {
                states.insert(&state_key(id)[..], record_bytes.as_slice())?;
                bodies.insert(&id.hash.0[..], body_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(unwrap_tx_error)?;
        Ok(())
    }

    /// Fetch raw body bytes
    pub fn get_body(&self, id: &StateId) -> Result<Option<Vec<u8>>, StoreError> {
        match self.bodies.get(id.hash.0)? {
            Some(bytes) => {
                let record: BodyRecord = bincode::deserialize(&bytes)
                    .map_err(|_| self.corrupted("undecodable body record"))?;
                Ok(Some(record.body))
            }
            None => Ok(None),
        }
    }

    /// Fetch the rollback blob stored when the body was applied
    pub fn get_rollback(&self, id: &StateId) -> Result<Option<Vec<u8>>, StoreError> {
        match self.bodies.get(id.hash.0)? {
            Some(bytes) => {
                let record: BodyRecord = bincode::deserialize(&bytes)
                    .map_err(|_| self.corrupted("undecodable body record"))?;
                Ok(record.rollback)
            }
            None => Ok(None),
        }
    }

    /// Ids of the known children of a state
    pub fn children(&self, id: &StateId) -> Result<Vec<StateId>, StoreError> {
        let mut out = Vec::new();
        for candidate in self.by_height(id.height + 1)? {
            if let Some(record) = self.get_state(&candidate)? {
                if record.header.prev_hash == id.hash {
                    out.push(candidate);
                }
            }
        }
        Ok(out)
    }

    /// Ids of all known states at a height
    pub fn by_height(&self, height: u64) -> Result<Vec<StateId>, StoreError> {
        let start = height_prefix(height);
        let mut out = Vec::new();
        for item in self.states.scan_prefix(start) {
            let (key, _) = item?;
            out.push(id_from_state_key(&key)?);
        }
        Ok(out)
    }

    /// All state records, height-ascending
    pub fn states(&self) -> impl Iterator<Item = Result<(StateId, StateRecord), StoreError>> + '_ {
        self.states.iter().map(move |item| {
            let (key, value) = item?;
            let id = id_from_state_key(&key)?;
            let record = self.decode_record(&value)?;
            Ok((id, record))
        })
    }

    /// O(1) lookup of the Active record at a height
    pub fn active_at(&self, height: u64) -> Result<Option<StateId>, StoreError> {
        match self.active.get(height_prefix(height))? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(self.corrupted("bad active entry"));
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(StateId {
                    height,
                    hash: Hash(hash),
                }))
            }
            None => Ok(None),
        }
    }

    /// The active tip
    pub fn tip(&self) -> Result<Option<StateId>, StoreError> {
        match self.meta.get(TIP_KEY)? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|_| self.corrupted("undecodable tip"))?,
            )),
            None => Ok(None),
        }
    }

    /// The genesis id, once known
    pub fn genesis(&self) -> Result<Option<StateId>, StoreError> {
        match self.meta.get(GENESIS_KEY)? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|_| self.corrupted("undecodable genesis id"))?,
            )),
            None => Ok(None),
        }
    }

    /// Persist the configured horizon
    pub fn set_horizon(&self, horizon: &Horizon) -> Result<(), StoreError> {
        self.meta.insert(HORIZON_KEY, bincode::serialize(horizon)?)?;
        Ok(())
    }

    /// The horizon recorded at last startup
    pub fn horizon(&self) -> Result<Option<Horizon>, StoreError> {
        match self.meta.get(HORIZON_KEY)? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|_| self.corrupted("undecodable horizon"))?,
            )),
            None => Ok(None),
        }
    }

    /// Restore the commitment trees from the persisted snapshots
    pub fn load_trees(&self) -> Result<(UtxoTree, KernelTree), StoreError> {
        let utxo = match self.meta.get(UTXO_SNAPSHOT_KEY)? {
            Some(bytes) => UtxoTree::restore(&bytes)
                .map_err(|_| self.corrupted("undecodable utxo snapshot"))?,
            None => UtxoTree::new(),
        };
        let kernels = match self.meta.get(KERNEL_SNAPSHOT_KEY)? {
            Some(bytes) => KernelTree::restore(&bytes)
                .map_err(|_| self.corrupted("undecodable kernel snapshot"))?,
            None => KernelTree::new(),
        };
        Ok((utxo, kernels))
    }

    /// Commit a forward block application
    ///
    /// Atomically: marks the state Active, indexes it by height, advances
    /// the tip, stores the rollback blob, and persists both tree snapshots.
    pub fn commit_apply(
        &self,
        id: &StateId,
        rollback: &[u8],
        utxo_snapshot: &[u8],
        kernel_snapshot: &[u8],
    ) -> Result<(), StoreError> {
        let mut record = self.get_state(id)?.ok_or(StoreError::StateNotFound)?;
        record.flags |= flags::ACTIVE;
        let record_bytes = bincode::serialize(&record)?;

        let body_bytes = match self.bodies.get(id.hash.0)? {
            Some(bytes) => {
                let mut body: BodyRecord = bincode::deserialize(&bytes)
                    .map_err(|_| self.corrupted("undecodable body record"))?;
                body.rollback = Some(rollback.to_vec());
                bincode::serialize(&body)?
            }
            None => return Err(StoreError::BodyNotFound),
        };
        let tip_bytes = bincode::serialize(id)?;

        (&self.states, &self.bodies, &self.active, &self.meta)
            .transaction(|(states, bodies, active, meta)| {
                states.insert(&state_key(id)[..], record_bytes.as_slice())?;
                bodies.insert(&id.hash.0[..], body_bytes.as_slice())?;
                active.insert(&height_prefix(id.height)[..], &id.hash.0[..])?;
                meta.insert(TIP_KEY, tip_bytes.as_slice())?;
                meta.insert(UTXO_SNAPSHOT_KEY, utxo_snapshot)?;
                meta.insert(KERNEL_SNAPSHOT_KEY, kernel_snapshot)?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(unwrap_tx_error)?;
        Ok(())
    }

    /// Commit a single-block rollback
    ///
    /// Atomically: clears the Active flag and height index of the tip,
    /// moves the tip to the parent, and persists both tree snapshots.
    pub fn commit_rollback(
        &self,
        id: &StateId,
        parent: Option<StateId>,
        utxo_snapshot: &[u8],
        kernel_snapshot: &[u8],
    ) -> Result<(), StoreError> {
        let mut record = self.get_state(id)?.ok_or(StoreError::StateNotFound)?;
        record.flags &= !flags::ACTIVE;
        let record_bytes = bincode::serialize(&record)?;
        let tip_bytes = match &parent {
            Some(parent) => Some(bincode::serialize(parent)?),
            None => None,
        };

        (&self.states, &self.active, &self.meta)
            .transaction(|(states, active, meta)| {
                states.insert(&state_key(id)[..], record_bytes.as_slice())?;
                active.remove(&height_prefix(id.height)[..])?;
                match &tip_bytes {
                    Some(bytes) => {
                        meta.insert(TIP_KEY, bytes.as_slice())?;
                    }
                    None => {
                        meta.remove(TIP_KEY)?;
                    }
                }
                meta.insert(UTXO_SNAPSHOT_KEY, utxo_snapshot)?;
                meta.insert(KERNEL_SNAPSHOT_KEY, kernel_snapshot)?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(unwrap_tx_error)?;
        Ok(())
    }

    /// Clear the Active flag on every record above a height
    ///
    /// Recovery primitive; `commit_rollback` is the per-block path and also
    /// maintains the tree snapshots.
    pub fn rollback_active_to(&self, height: u64) -> Result<(), StoreError> {
        let mut above: Vec<StateId> = Vec::new();
        for item in self.active.iter() {
            let (key, value) = item?;
            if key.len() != 8 || value.len() != 32 {
                return Err(self.corrupted("bad active entry"));
            }
            let mut h = [0u8; 8];
            h.copy_from_slice(&key);
            let h = u64::from_be_bytes(h);
            if h > height {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&value);
                above.push(StateId {
                    height: h,
                    hash: Hash(hash),
                });
            }
        }
        for id in &above {
            self.set_flags(id, flags::ACTIVE, false)?;
            self.active.remove(height_prefix(id.height))?;
        }
        let new_tip = self.active_at(height)?;
        match new_tip {
            Some(tip) => {
                self.meta.insert(TIP_KEY, bincode::serialize(&tip)?)?;
            }
            None => {
                self.meta.remove(TIP_KEY)?;
            }
        }
        Ok(())
    }

    /// Erase the body and rollback data of a fossilized state
    ///
    /// The header remains. Idempotent: erasing an already-fossil state is a
    /// no-op.
    pub fn erase_body(&self, id: &StateId) -> Result<(), StoreError> {
        let mut record = self.get_state(id)?.ok_or(StoreError::StateNotFound)?;
        if record.has(flags::FOSSIL) {
            return Ok(());
        }
        record.flags = (record.flags & !flags::HAS_BODY) | flags::FOSSIL;
        let record_bytes = bincode::serialize(&record)?;

        (&self.states, &self.bodies)
            .transaction(|(states, bodies)| {
                states.insert(&state_key(id)[..], record_bytes.as_slice())?;
                bodies.remove(&id.hash.0[..])?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(unwrap_tx_error)?;
        Ok(())
    }

    /// Delete a pruned state record and its body outright
    pub fn delete_state(&self, id: &StateId) -> Result<(), StoreError> {
        (&self.states, &self.bodies)
            .transaction(|(states, bodies)| {
                states.remove(&state_key(id)[..])?;
                bodies.remove(&id.hash.0[..])?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(unwrap_tx_error)?;
        Ok(())
    }
}

fn unwrap_tx_error(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Db(e),
    }
}
