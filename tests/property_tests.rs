//! Property-based tests
//!
//! Invariants that must survive random inputs: delivery-order determinism
//! of the processor, insertion-order independence of the authenticated
//! trees, and the mempool's fee-rate ordering.

mod common;

use proptest::prelude::*;

use common::{blind, node, spend, Chain, Event, Utxo};
use obol_core::crypto::hash_bytes;
use obol_core::node::{Horizon, TxPool};
use obol_core::storage::{KernelTree, UtxoTree, UTXO_KEY_LEN};

fn key(tag: u8, maturity: u8) -> [u8; UTXO_KEY_LEN] {
    let mut k = [0u8; UTXO_KEY_LEN];
    let h = hash_bytes(&[tag]);
    k[0] = 0x02;
    k[1..33].copy_from_slice(&h.0);
    k[40] = maturity;
    k
}

proptest! {
    /// The UTXO tree root never depends on insertion order
    #[test]
    fn prop_utxo_root_order_independent(entries in prop::collection::vec((0u8..40, 0u8..4, 1u32..3), 1..30)) {
        let mut forward = UtxoTree::new();
        for (tag, maturity, count) in &entries {
            forward.add_with_count(key(*tag, *maturity), *count);
        }
        let mut backward = UtxoTree::new();
        for (tag, maturity, count) in entries.iter().rev() {
            backward.add_with_count(key(*tag, *maturity), *count);
        }
        prop_assert_eq!(forward.root(), backward.root());
        prop_assert_eq!(forward.len(), backward.len());
    }

    /// Adding and removing a batch of keys restores the previous root
    #[test]
    fn prop_utxo_add_remove_roundtrip(
        base in prop::collection::vec((0u8..20, 0u8..4), 1..15),
        extra in prop::collection::vec((20u8..40, 0u8..4), 1..15),
    ) {
        let mut tree = UtxoTree::new();
        for (tag, maturity) in &base {
            tree.add(key(*tag, *maturity));
        }
        let root = tree.root();

        for (tag, maturity) in &extra {
            tree.add(key(*tag, *maturity));
        }
        for (tag, maturity) in extra.iter().rev() {
            tree.remove(&key(*tag, *maturity)).unwrap();
        }
        prop_assert_eq!(tree.root(), root);
    }

    /// The kernel tree root never depends on insertion order
    #[test]
    fn prop_kernel_root_order_independent(tags in prop::collection::hash_set(0u16..500, 1..40)) {
        let ids: Vec<_> = tags.iter().map(|t| hash_bytes(&t.to_le_bytes())).collect();

        let mut forward = KernelTree::new();
        for id in &ids {
            forward.add(*id).unwrap();
        }
        let mut backward = KernelTree::new();
        for id in ids.iter().rev() {
            backward.add(*id).unwrap();
        }
        prop_assert_eq!(forward.root(), backward.root());
    }

    /// A snapshot round-trip reproduces the root bit-for-bit
    #[test]
    fn prop_utxo_snapshot_roundtrip(entries in prop::collection::vec((0u8..40, 0u8..4, 1u32..4), 1..25)) {
        let mut tree = UtxoTree::new();
        for (tag, maturity, count) in &entries {
            tree.add_with_count(key(*tag, *maturity), *count);
        }
        let restored = UtxoTree::restore(&tree.serialize()).unwrap();
        prop_assert_eq!(restored.root(), tree.root());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Draining the mempool yields non-increasing fee-per-byte
    #[test]
    fn prop_pool_drains_by_fee_rate(fees in prop::collection::vec((1u64..10_000, 1usize..4), 2..12)) {
        let mut pool = TxPool::new();
        for (i, (fee, out_count)) in fees.iter().enumerate() {
            let out_values: Vec<u64> = (0..*out_count as u64).map(|j| 1000 + j).collect();
            let total_out: u64 = out_values.iter().sum();
            let tx = spend(
                &[Utxo {
                    value: total_out + fee,
                    blind: blind(&format!("pool.{i}.in")),
                    maturity: 1,
                }],
                &out_values,
                *fee,
                1,
                0,
                u64::MAX,
                &format!("pool.{i}"),
            );
            pool.add(tx, 1).unwrap();
        }

        let drained: Vec<(u64, usize)> = pool.by_profit().map(|e| (e.fee, e.size)).collect();
        prop_assert_eq!(drained.len(), fees.len());
        for pair in drained.windows(2) {
            let (fee_a, size_a) = pair[0];
            let (fee_b, size_b) = pair[1];
            prop_assert!(
                fee_a as u128 * size_b as u128 >= fee_b as u128 * size_a as u128,
                "fee rate increased along the drain"
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Any delivery order of the same valid messages converges to the same
    /// tip and the same roots, once congestion requests are answered.
    #[test]
    fn prop_delivery_order_is_irrelevant(order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle()) {
        let mut chain = Chain::new();
        chain.advance_to(4);

        let mut n = node(Horizon::disabled());
        for &slot in &order {
            let block = &chain.blocks[slot / 2];
            if slot % 2 == 0 {
                n.deliver_header(&block.header);
            } else {
                n.deliver_body(&block.header, &block.body);
            }
        }

        // Emulate the transport: answer congestion requests until quiet
        loop {
            n.take_events();
            n.proc.enum_congestions().unwrap();
            let requests = n.take_events();
            let mut progressed = false;
            for event in requests {
                let Event::Request(id, want_block, _) = event else {
                    continue;
                };
                let Some(block) = chain.blocks.iter().find(|b| b.id() == id) else {
                    continue;
                };
                progressed |= if want_block {
                    n.deliver_body(&block.header, &block.body)
                } else {
                    n.deliver_header(&block.header)
                };
            }
            if !progressed {
                break;
            }
        }

        prop_assert_eq!(n.tip(), Some(chain.tip_id()));
        prop_assert_eq!(n.proc.utxo_root(), chain.utxo_root());
        prop_assert_eq!(n.proc.kernel_root(), chain.kernel_root());
    }
}
