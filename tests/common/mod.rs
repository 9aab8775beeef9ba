//! Shared chain-building harness for the integration suites
//!
//! Builds valid chains independently of the node's own block builder, so
//! the suites can feed the processor arbitrary permutations, forks, and
//! deliberately broken blocks.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use k256::{ProjectivePoint, Scalar};

use obol_core::consensus::{
    block_subsidy, work, Header, Input, Output, StateId, TxBody, TxKernel,
};
use obol_core::constants::{COINBASE_INCUBATION, GENESIS_TIMESTAMP, INITIAL_DIFFICULTY};
use obol_core::crypto::{
    hash_bytes, scalar_from_hash, Commitment, Kdf, KeyType, RangeProof, SchnorrSignature,
};
use obol_core::mining::solve_nonce;
use obol_core::node::{create_genesis, genesis_kdf, ChainProcessor, Horizon, NodeEvents, PeerId};
use obol_core::storage::{utxo_key, KernelTree, StateStore, UtxoTree};

/// Default peer for deliveries
pub const PEER: PeerId = PeerId(1);

/// Recorded processor event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request(StateId, bool, Option<PeerId>),
    Insane(PeerId),
    NewState,
}

/// Event sink that records everything
#[derive(Default, Clone)]
pub struct Recorder(pub Rc<RefCell<Vec<Event>>>);

impl NodeEvents for Recorder {
    fn request_data(&mut self, id: StateId, want_block: bool, preferred_peer: Option<PeerId>) {
        self.0
            .borrow_mut()
            .push(Event::Request(id, want_block, preferred_peer));
    }

    fn on_peer_insane(&mut self, peer: PeerId) {
        self.0.borrow_mut().push(Event::Insane(peer));
    }

    fn on_new_state(&mut self) {
        self.0.borrow_mut().push(Event::NewState);
    }
}

/// A processor over a throwaway store, with its recorded events
pub struct TestNode {
    _dir: tempfile::TempDir,
    pub proc: ChainProcessor<Recorder>,
    pub events: Rc<RefCell<Vec<Event>>>,
}

/// Open a fresh node
pub fn node(horizon: Horizon) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    let recorder = Recorder::default();
    let events = recorder.0.clone();
    let proc = ChainProcessor::open(store, horizon, recorder).unwrap();
    TestNode {
        _dir: dir,
        proc,
        events,
    }
}

impl TestNode {
    pub fn deliver_header(&mut self, header: &Header) -> bool {
        self.proc.on_state(header, PEER).unwrap()
    }

    pub fn deliver_header_from(&mut self, header: &Header, peer: PeerId) -> bool {
        self.proc.on_state(header, peer).unwrap()
    }

    pub fn deliver_body(&mut self, header: &Header, body: &TxBody) -> bool {
        self.proc
            .on_block(&header.id(), &body.encode().unwrap(), PEER)
            .unwrap()
    }

    pub fn deliver_body_from(&mut self, header: &Header, body: &TxBody, peer: PeerId) -> bool {
        self.proc
            .on_block(&header.id(), &body.encode().unwrap(), peer)
            .unwrap()
    }

    pub fn deliver_block(&mut self, block: &BuiltBlock) {
        self.deliver_header(&block.header);
        self.deliver_body(&block.header, &block.body);
    }

    pub fn deliver_chain(&mut self, chain: &Chain) {
        for block in &chain.blocks {
            self.deliver_block(block);
        }
    }

    pub fn tip(&self) -> Option<StateId> {
        self.proc.tip_id().unwrap()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }
}

/// Deterministic scalar from a tag
pub fn blind(tag: &str) -> Scalar {
    scalar_from_hash(&hash_bytes(tag.as_bytes()))
}

/// A spendable output the harness knows the opening of
#[derive(Debug, Clone)]
pub struct Utxo {
    pub value: u64,
    pub blind: Scalar,
    pub maturity: u64,
}

impl Utxo {
    pub fn commitment(&self) -> Commitment {
        Commitment::commit(self.value, &self.blind).unwrap()
    }
}

/// One block of a harness-built chain
#[derive(Debug, Clone)]
pub struct BuiltBlock {
    pub header: Header,
    pub body: TxBody,
    pub coinbase_value: u64,
    pub coinbase_blind: Scalar,
}

impl BuiltBlock {
    pub fn id(&self) -> StateId {
        self.header.id()
    }

    /// The coinbase output of this block as a spendable UTXO
    pub fn coinbase_utxo(&self) -> Utxo {
        Utxo {
            value: self.coinbase_value,
            blind: self.coinbase_blind,
            maturity: self.header.height + COINBASE_INCUBATION,
        }
    }
}

/// A valid chain built outside the node, with its commitment trees
pub struct Chain {
    pub blocks: Vec<BuiltBlock>,
    utxo: UtxoTree,
    kernels: KernelTree,
    salt: u32,
    kdf: Kdf,
}

impl Chain {
    /// A chain holding only genesis
    pub fn new() -> Chain {
        let (header, body) = create_genesis().unwrap();
        let kdf = genesis_kdf();
        let coinbase_blind = kdf.derive(KeyType::Coinbase, 1, 0);
        let mut chain = Chain {
            blocks: Vec::new(),
            utxo: UtxoTree::new(),
            kernels: KernelTree::new(),
            salt: 0,
            kdf,
        };
        chain.absorb(BuiltBlock {
            header,
            body,
            coinbase_value: block_subsidy(1),
            coinbase_blind,
        });
        chain
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn tip_header(&self) -> &Header {
        &self.blocks.last().unwrap().header
    }

    pub fn tip_id(&self) -> StateId {
        self.tip_header().id()
    }

    pub fn block_at(&self, height: u64) -> &BuiltBlock {
        &self.blocks[height as usize - 1]
    }

    pub fn utxo_root(&self) -> obol_core::crypto::Hash {
        self.utxo.root()
    }

    pub fn kernel_root(&mut self) -> obol_core::crypto::Hash {
        self.kernels.root()
    }

    fn absorb(&mut self, block: BuiltBlock) {
        for input in &block.body.inputs {
            self.utxo
                .remove(&utxo_key(&input.commitment, input.maturity))
                .unwrap();
        }
        for output in &block.body.outputs {
            self.utxo.add(utxo_key(&output.commitment, output.maturity));
        }
        for kernel in &block.body.kernels {
            self.kernels.add(kernel.id()).unwrap();
        }
        self.blocks.push(block);
    }

    /// Append a block carrying the given transactions
    pub fn extend(&mut self, txs: &[TxBody]) -> BuiltBlock {
        let height = self.height() + 1;
        let mut body = TxBody::new();
        let mut fees: u64 = 0;
        for tx in txs {
            fees += tx.fee_total().unwrap();
            body.merge(tx.clone());
        }

        let subsidy = block_subsidy(height);
        let maturity = height + COINBASE_INCUBATION;
        let coinbase_blind = self.kdf.derive(KeyType::Coinbase, height, self.salt);
        let coinbase_commit = Commitment::commit(subsidy, &coinbase_blind).unwrap();
        body.outputs.push(Output {
            commitment: coinbase_commit,
            maturity,
            coinbase: true,
            proof: RangeProof::public(subsidy, &coinbase_blind, &coinbase_commit).unwrap(),
        });

        let mut blind_sum = coinbase_blind;
        if fees > 0 {
            let commission_blind = self.kdf.derive(KeyType::Commission, height, self.salt);
            let commission_commit = Commitment::commit(fees, &commission_blind).unwrap();
            body.outputs.push(Output {
                commitment: commission_commit,
                maturity,
                coinbase: true,
                proof: RangeProof::public(fees, &commission_blind, &commission_commit).unwrap(),
            });
            blind_sum += commission_blind;
        }

        let excess_key = -blind_sum;
        let excess =
            Commitment::from_point(&(ProjectivePoint::GENERATOR * excess_key)).unwrap();
        let signature = SchnorrSignature::sign(
            &excess_key,
            &TxKernel::signing_hash_for(0, height, u64::MAX),
        )
        .unwrap();
        body.kernels.push(TxKernel {
            excess,
            fee: 0,
            min_height: height,
            max_height: u64::MAX,
            signature,
        });
        body.normalize();

        // Advance the trees, then seal the roots into the header
        for input in &body.inputs {
            self.utxo
                .remove(&utxo_key(&input.commitment, input.maturity))
                .unwrap();
        }
        for output in &body.outputs {
            self.utxo.add(utxo_key(&output.commitment, output.maturity));
        }
        for kernel in &body.kernels {
            self.kernels.add(kernel.id()).unwrap();
        }

        let prev_hash = self.tip_header().hash();
        let prev_work = self.tip_header().chain_work;
        let mut header = Header {
            height,
            prev_hash,
            timestamp: GENESIS_TIMESTAMP + height * 60 + self.salt as u64,
            difficulty: INITIAL_DIFFICULTY,
            chain_work: prev_work + work(INITIAL_DIFFICULTY),
            utxo_root: self.utxo.root(),
            kernel_root: self.kernels.root(),
            nonce: 0,
        };
        solve_nonce(&mut header);

        let block = BuiltBlock {
            header,
            body,
            coinbase_value: subsidy,
            coinbase_blind,
        };
        self.blocks.push(block.clone());
        block
    }

    /// Grow with empty blocks up to `height`
    pub fn advance_to(&mut self, height: u64) {
        while self.height() < height {
            self.extend(&[]);
        }
    }

    /// A new chain sharing this one's first `keep_height` blocks
    pub fn fork(&self, keep_height: u64, salt: u32) -> Chain {
        let mut chain = Chain {
            blocks: Vec::new(),
            utxo: UtxoTree::new(),
            kernels: KernelTree::new(),
            salt,
            kdf: self.kdf.clone(),
        };
        for block in self.blocks.iter().take(keep_height as usize) {
            chain.absorb(block.clone());
        }
        chain
    }
}

/// Build a balanced confidential transaction
///
/// Spends `inputs` into fresh outputs of `out_values` (which must sum to
/// the input total minus `fee`), valid for inclusion at exactly `height`
/// within the kernel window `[min_height, max_height]`.
pub fn spend(
    inputs: &[Utxo],
    out_values: &[u64],
    fee: u64,
    height: u64,
    min_height: u64,
    max_height: u64,
    tag: &str,
) -> TxBody {
    let total_in: u64 = inputs.iter().map(|u| u.value).sum();
    assert_eq!(
        total_in,
        out_values.iter().sum::<u64>() + fee,
        "unbalanced spend in test harness"
    );

    let mut body = TxBody::new();
    let mut blind_in = Scalar::ZERO;
    for utxo in inputs {
        body.inputs.push(Input {
            commitment: utxo.commitment(),
            maturity: utxo.maturity,
        });
        blind_in += utxo.blind;
    }

    let mut blind_out = Scalar::ZERO;
    for (i, value) in out_values.iter().enumerate() {
        let b = blind(&format!("{tag}.out.{i}"));
        let commitment = Commitment::commit(*value, &b).unwrap();
        body.outputs.push(Output {
            commitment,
            maturity: height,
            coinbase: false,
            proof: RangeProof::confidential(*value, &b, &commitment).unwrap(),
        });
        blind_out += b;
    }

    let excess_key = blind_in - blind_out;
    let excess = Commitment::from_point(&(ProjectivePoint::GENERATOR * excess_key)).unwrap();
    let signature = SchnorrSignature::sign(
        &excess_key,
        &TxKernel::signing_hash_for(fee, min_height, max_height),
    )
    .unwrap();
    body.kernels.push(TxKernel {
        excess,
        fee,
        min_height,
        max_height,
        signature,
    });
    body.normalize();
    body
}
