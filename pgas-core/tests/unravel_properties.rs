//! Property tests for `descriptor::unravel`, the row-major unravel
//! shared by the strided transfer path and the collective per-element
//! path: for any extent vector, every linear index in `0..product`
//! must round-trip through a distinct multi-index, and that multi-index
//! must satisfy the row-major composition identity directly.

use proptest::prelude::*;

use pgas_core::descriptor::unravel;

fn extents_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..=5, 1..=4)
}

proptest! {
    #[test]
    fn every_linear_index_round_trips_to_a_distinct_multi_index(extents in extents_strategy()) {
        let total: usize = extents.iter().map(|e| *e as usize).product();
        let mut seen = std::collections::HashSet::with_capacity(total);
        for linear in 0..total {
            let idx = unravel(linear, &extents);
            prop_assert_eq!(idx.len(), extents.len());
            for (i, extent) in idx.iter().zip(extents.iter()) {
                prop_assert!(*i >= 0 && i < extent);
            }
            prop_assert!(seen.insert(idx));
        }
        prop_assert_eq!(seen.len(), total);
    }

    #[test]
    fn multi_index_matches_row_major_composition(extents in extents_strategy()) {
        let total: usize = extents.iter().map(|e| *e as usize).product();
        for linear in 0..total {
            let idx = unravel(linear, &extents);
            let mut reconstructed = 0i64;
            let mut multiplier = 1i64;
            for (i, extent) in idx.iter().zip(extents.iter()) {
                reconstructed += i * multiplier;
                multiplier *= extent;
            }
            prop_assert_eq!(reconstructed as usize, linear);
        }
    }
}
