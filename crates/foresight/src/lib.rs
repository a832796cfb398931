//! Equality saturation over slotted e-graphs
//!
//! The store represents bound variables as first-class slots, so
//! alpha-equivalent terms hash-cons to one class and argument symmetries are
//! tracked per class.  On top of it sit a compiled pattern-matching machine
//! and a staged search/apply/batch saturation loop.

#![deny(
    clippy::disallowed_methods,
    clippy::suspicious,
    clippy::style,
    clippy::clone_on_ref_ptr,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![warn(clippy::pedantic, missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    reason = "TODO: document everything"
)]

pub mod analysis;
pub mod command;
pub mod dot;
pub mod egraph;
pub mod extract;
pub mod group;
pub mod machine;
pub mod node;
pub mod parallel;
pub mod pattern;
pub mod recorded;
pub mod rule;
pub mod slot;
pub mod slot_map;
pub mod strategy;
pub mod term;

#[cfg(any(test, feature = "proptest"))]
pub mod prop {
    //! Shared proptest strategies

    use proptest::prelude::*;

    use crate::term::Tree;

    /// Lowercase operator symbols
    pub fn symbol() -> impl Strategy<Value = char> + Clone { prop::char::range('a', 'z') }

    /// Ground trees over lowercase operators
    pub fn tree(depth: u32, size: u32, branch: u32) -> impl Strategy<Value = Tree<char>> {
        let sym = symbol();
        sym.clone()
            .prop_map(Tree::leaf)
            .prop_recursive(depth, size, branch, move |t| {
                (
                    sym.clone(),
                    prop::collection::vec(t, 0..=(branch.try_into().unwrap())),
                )
                    .prop_map(|(s, c)| Tree::new(s, vec![], vec![], c))
            })
    }

    /// A ground tree plus a schedule of node-index pairs to merge, indices in
    /// post-order
    pub fn tree_and_merges(
        depth: u32,
        size: u32,
        branch: u32,
        merges: impl Into<prop::sample::SizeRange>,
    ) -> impl Strategy<Value = (Tree<char>, Vec<(usize, usize)>)> {
        let merges = merges.into();
        tree(depth, size, branch).prop_flat_map(move |t| {
            let n = t.size();
            prop::collection::vec((0..n, 0..n), merges.clone()).prop_map(move |m| (t.clone(), m))
        })
    }
}
