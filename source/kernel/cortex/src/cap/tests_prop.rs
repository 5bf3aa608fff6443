// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for capabilities and range descriptors
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic. Ensures casts never escalate and placement stays in bounds.
//!
//! TEST_SCOPE:
//!   - Capability casts: granted iff the capability carries every requested permission
//!   - Crd::place: both ranges stay inside their descriptors, order is the smaller one
//!
//! TEST_SCENARIOS:
//!   - cast_grants_only_subsets(): cast succeeds exactly when needed ⊆ perms
//!   - place_stays_inside_both_windows(): placed source and destination ranges fit their windows

use super::{CapError, Capability, Crd, ObjRef, Perms};
use crate::arena::Arena;
use crate::obj::Sm;
use proptest::prelude::*;

fn arb_perms() -> impl Strategy<Value = Perms> {
    (0u8..32).prop_map(Perms::from_bits_truncate)
}

fn arb_crd() -> impl Strategy<Value = Crd> {
    (0u64..(1 << 40), 0u8..=20).prop_map(|(base, order)| Crd::obj(base, order, 0x1f))
}

fn within(crd: Crd, base: u64, order: u8) -> bool {
    let end = base + (1u64 << order);
    base >= crd.aligned_base() && end <= crd.aligned_base() + crd.size()
}

proptest! {
    #[test]
    fn cast_grants_only_subsets(held in arb_perms(), needed in arb_perms()) {
        let mut sms: Arena<Sm> = Arena::new();
        let sm = sms.insert(Sm::new(0));
        let cap = Capability::new(ObjRef::Sm(sm), held);
        let result = cap.cast::<Sm>(needed);
        if held.contains(needed) {
            prop_assert_eq!(result, Ok(sm));
        } else {
            prop_assert_eq!(result, Err(CapError::PermissionDenied));
        }
    }

    #[test]
    fn place_stays_inside_both_windows(
        snd in arb_crd(),
        rcv in arb_crd(),
        hotspot in any::<u64>(),
    ) {
        let (src, dst, order) = Crd::place(snd, rcv, hotspot);
        prop_assert_eq!(order, snd.order.min(rcv.order));
        prop_assert!(within(snd, src, order));
        prop_assert!(within(rcv, dst, order));
        prop_assert_eq!(src & ((1u64 << order) - 1), 0);
        prop_assert_eq!(dst & ((1u64 << order) - 1), 0);
    }
}
