//! Term trees, the surface syntax clients build before e-graph insertion

use crate::{node::EClassCall, slot::Slot};

/// A ground term: an operator with definition slots, use slots, and children
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tree<F> {
    pub op: F,
    pub defs: Vec<Slot>,
    pub uses: Vec<Slot>,
    pub children: Vec<Tree<F>>,
}

impl<F> Tree<F> {
    #[must_use]
    pub fn new(op: F, defs: Vec<Slot>, uses: Vec<Slot>, children: Vec<Tree<F>>) -> Self {
        Self {
            op,
            defs,
            uses,
            children,
        }
    }

    /// A childless, slotless term
    #[must_use]
    pub fn leaf(op: F) -> Self { Self::new(op, vec![], vec![], vec![]) }

    /// The number of nodes in the tree
    #[must_use]
    pub fn size(&self) -> usize {
        self.children
            .iter()
            .map(Tree::size)
            .fold(1, |l, r| l.checked_add(r).unwrap_or_else(|| unreachable!()))
    }

    fn fold_impl<T>(self, f: &mut impl FnMut(F, Vec<Slot>, Vec<Slot>, Vec<T>) -> T) -> T {
        let Self {
            op,
            defs,
            uses,
            children,
        } = self;
        let children = children.into_iter().map(|c| c.fold_impl(f)).collect();
        f(op, defs, uses, children)
    }

    /// Bottom-up fold over the tree
    #[inline]
    pub fn fold<T>(self, mut f: impl FnMut(F, Vec<Slot>, Vec<Slot>, Vec<T>) -> T) -> T {
        self.fold_impl(&mut f)
    }
}

/// A term with embedded e-class applications at its leaves
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MixedTree<F> {
    /// A reference into an existing e-graph
    Call(EClassCall),
    /// An operator over further mixed terms
    Node {
        op: F,
        defs: Vec<Slot>,
        uses: Vec<Slot>,
        children: Vec<MixedTree<F>>,
    },
}

impl<F> MixedTree<F> {
    #[must_use]
    pub fn node(op: F, defs: Vec<Slot>, uses: Vec<Slot>, children: Vec<MixedTree<F>>) -> Self {
        Self::Node {
            op,
            defs,
            uses,
            children,
        }
    }

    /// The number of operator nodes (calls count for zero)
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Call(_) => 0,
            Self::Node { children, .. } => children
                .iter()
                .map(MixedTree::size)
                .fold(1, |l, r| l.checked_add(r).unwrap_or_else(|| unreachable!())),
        }
    }
}

impl<F> From<Tree<F>> for MixedTree<F> {
    fn from(tree: Tree<F>) -> Self {
        let Tree {
            op,
            defs,
            uses,
            children,
        } = tree;
        Self::Node {
            op,
            defs,
            uses,
            children: children.into_iter().map(Self::from).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Tree;

    #[test]
    fn size_counts_nodes() {
        let t = Tree::new('f', vec![], vec![], vec![Tree::leaf('a'), Tree::leaf('b')]);
        assert_eq!(t.size(), 3);
        assert_eq!(super::MixedTree::from(t).size(), 3);
    }

    #[test]
    fn fold_visits_bottom_up() {
        let t = Tree::new('f', vec![], vec![], vec![Tree::leaf('a'), Tree::leaf('b')]);
        let out = t.fold(|op, _, _, kids: Vec<String>| {
            let mut s = String::new();
            for k in kids {
                s.push_str(&k);
            }
            s.push(op);
            s
        });
        assert_eq!(out, "abf");
    }
}
