use crate::{Shape, Tensor, Tree};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Arbitrary nested tree of i64 leaves, up to four levels deep.
pub fn arb_tree() -> impl Strategy<Value = Tree<i64>> {
    let leaf = any::<i64>().prop_map(Tree::Leaf);
    leaf.prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Tree::Tuple),
            prop::collection::btree_map("[a-d]{1,2}", inner, 0..4)
                .prop_map(|entries: BTreeMap<String, Tree<i64>>| Tree::Dict(entries)),
        ]
    })
}

/// Arbitrary small tensor with finite values.
pub fn arb_tensor() -> impl Strategy<Value = Tensor> {
    prop::collection::vec(1_usize..4, 0..3).prop_flat_map(|dims| {
        let count = dims.iter().product::<usize>();
        prop::collection::vec(-10.0_f64..10.0, count).prop_map(move |data| {
            Tensor::new(Shape::from_dims(&dims), data).expect("generated shape matches data")
        })
    })
}
