//! E-nodes, e-class references, and renaming-normal shapes

use std::{
    collections::BTreeSet,
    fmt,
    hash::{Hash, Hasher},
};

use crate::{slot::Slot, slot_map::SlotMap};

/// The stable identity of an e-class
///
/// Ids are allocated monotonically and stay valid as canonicalization inputs
/// after the class they name has been merged away.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EClassId(usize);

impl EClassId {
    #[inline]
    pub(crate) const fn new(id: usize) -> Self { Self(id) }

    #[must_use]
    #[inline]
    pub fn id(self) -> usize { self.0 }
}

impl fmt::Debug for EClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        f.debug_tuple("EClass").field(id).finish()
    }
}

/// An e-class reference applied to arguments: a class identity plus the map
/// binding its parameter slots to slots of the caller's context
///
/// Argument maps are injective; a term that uses one variable twice is its
/// own class rather than a non-injective instantiation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EClassCall {
    id: EClassId,
    args: SlotMap,
}

impl fmt::Debug for EClassCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { id, args } = self;
        write!(f, "{id:?}{args:?}")
    }
}

impl EClassCall {
    #[must_use]
    pub fn new(id: EClassId, args: SlotMap) -> Self {
        debug_assert!(args.is_injective(), "call map {args:?} is not injective");
        Self { id, args }
    }

    /// The call binding every parameter slot to itself
    #[must_use]
    pub fn identity<I: IntoIterator<Item = Slot>>(id: EClassId, params: I) -> Self {
        Self {
            id,
            args: SlotMap::identity(params),
        }
    }

    #[must_use]
    #[inline]
    pub fn id(&self) -> EClassId { self.id }

    #[must_use]
    #[inline]
    pub fn args(&self) -> &SlotMap { &self.args }

    /// Rewrite the caller-context side of the argument map, leaving slots
    /// `map` does not mention unchanged
    #[must_use]
    pub fn rename(&self, map: &SlotMap) -> Self {
        Self {
            id: self.id,
            args: self.args.compose_retain(map),
        }
    }
}

/// An operator occurrence: definition slots it introduces, use slots it
/// consumes, and child e-class applications
pub struct ENode<F> {
    op: F,
    defs: Vec<Slot>,
    uses: Vec<Slot>,
    args: Vec<EClassCall>,
}

impl<F> ENode<F> {
    #[must_use]
    pub fn new(op: F, defs: Vec<Slot>, uses: Vec<Slot>, args: Vec<EClassCall>) -> Self {
        Self {
            op,
            defs,
            uses,
            args,
        }
    }

    #[must_use]
    #[inline]
    pub fn op(&self) -> &F { &self.op }

    #[must_use]
    #[inline]
    pub fn defs(&self) -> &[Slot] { &self.defs }

    #[must_use]
    #[inline]
    pub fn uses(&self) -> &[Slot] { &self.uses }

    #[must_use]
    #[inline]
    pub fn args(&self) -> &[EClassCall] { &self.args }

    /// Every slot occurrence in encounter order: definitions, then uses, then
    /// each argument map's images in key order
    pub fn slot_occurrences(&self) -> impl Iterator<Item = Slot> + '_ {
        self.defs
            .iter()
            .chain(self.uses.iter())
            .copied()
            .chain(self.args.iter().flat_map(|a| a.args().values()))
    }

    /// The slots visible to the node's surroundings: uses and argument
    /// images, minus the definitions bound here
    #[must_use]
    pub fn public_slots(&self) -> BTreeSet<Slot> {
        let mut out: BTreeSet<_> = self
            .uses
            .iter()
            .copied()
            .chain(self.args.iter().flat_map(|a| a.args().values()))
            .collect();
        for d in &self.defs {
            out.remove(d);
        }
        out
    }

    pub fn map_args<G: FnMut(&EClassCall) -> EClassCall>(&mut self, mut f: G) {
        for arg in &mut self.args {
            *arg = f(arg);
        }
    }
}

impl<F: Clone> ENode<F> {
    /// Rewrite every slot occurrence through `map`, leaving unmapped slots
    /// unchanged
    #[must_use]
    pub fn rename(&self, map: &SlotMap) -> Self {
        Self {
            op: self.op.clone(),
            defs: self.defs.iter().map(|&s| map.apply(s)).collect(),
            uses: self.uses.iter().map(|&s| map.apply(s)).collect(),
            args: self.args.iter().map(|a| a.rename(map)).collect(),
        }
    }

    /// The renaming-normal form of the node: slots replaced by `$0, $1, …` in
    /// encounter order, paired with the inverse renaming back to the
    /// original slots
    #[must_use]
    pub fn shape_call(&self) -> ShapeCall<F> {
        let mut renaming = SlotMap::new();
        let mut next = 0u32;

        for s in self.slot_occurrences() {
            if !renaming.contains_key(s) {
                renaming.insert(s, Slot::numeric(next));
                next += 1;
            }
        }

        ShapeCall {
            shape: Shape(self.rename(&renaming)),
            renaming: renaming.inverse(),
        }
    }
}

impl<F: fmt::Debug> fmt::Debug for ENode<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            op,
            defs,
            uses,
            args,
        } = self;
        f.debug_struct("ENode")
            .field("op", op)
            .field("defs", defs)
            .field("uses", uses)
            .field("args", args)
            .finish()
    }
}

impl<F: Clone> Clone for ENode<F> {
    fn clone(&self) -> Self {
        Self {
            op: self.op.clone(),
            defs: self.defs.clone(),
            uses: self.uses.clone(),
            args: self.args.clone(),
        }
    }
}

impl<F: PartialEq> PartialEq for ENode<F> {
    fn eq(&self, other: &Self) -> bool {
        let Self {
            op,
            defs,
            uses,
            args,
        } = self;
        *op == other.op && *defs == other.defs && *uses == other.uses && *args == other.args
    }
}

impl<F: Eq> Eq for ENode<F> {}

impl<F: Ord> Ord for ENode<F> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let Self {
            op,
            defs,
            uses,
            args,
        } = self;
        op.cmp(&other.op)
            .then_with(|| defs.cmp(&other.defs))
            .then_with(|| uses.cmp(&other.uses))
            .then_with(|| args.cmp(&other.args))
    }
}

impl<F: Ord> PartialOrd for ENode<F> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl<F: Hash> Hash for ENode<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let Self {
            op,
            defs,
            uses,
            args,
        } = self;
        op.hash(state);
        defs.hash(state);
        uses.hash(state);
        args.hash(state);
    }
}

/// An e-node in renaming-normal form, the hash-cons key of the store
///
/// Only [`ENode::shape_call`] constructs these, so holding a `Shape` is proof
/// the numbering is the canonical encounter order.
#[repr(transparent)]
pub struct Shape<F>(ENode<F>);

impl<F> Shape<F> {
    #[must_use]
    #[inline]
    pub fn node(&self) -> &ENode<F> { &self.0 }
}

impl<F: Clone> Shape<F> {
    /// Materialize the shape back into a slot context
    #[must_use]
    pub fn rename(&self, map: &SlotMap) -> ENode<F> { self.0.rename(map) }
}

impl<F: fmt::Debug> fmt::Debug for Shape<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(node) = self;
        f.debug_tuple("Shape").field(node).finish()
    }
}

impl<F: Clone> Clone for Shape<F> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<F: PartialEq> PartialEq for Shape<F> {
    fn eq(&self, other: &Self) -> bool { self.0 == other.0 }
}

impl<F: Eq> Eq for Shape<F> {}

impl<F: Ord> Ord for Shape<F> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.0.cmp(&other.0) }
}

impl<F: Ord> PartialOrd for Shape<F> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl<F: Hash> Hash for Shape<F> {
    fn hash<H: Hasher>(&self, state: &mut H) { self.0.hash(state); }
}

/// A shape plus the inverse renaming from its numeric slots back to the
/// context it was computed in
pub struct ShapeCall<F> {
    shape: Shape<F>,
    renaming: SlotMap,
}

impl<F> ShapeCall<F> {
    #[must_use]
    #[inline]
    pub fn shape(&self) -> &Shape<F> { &self.shape }

    #[must_use]
    #[inline]
    pub fn renaming(&self) -> &SlotMap { &self.renaming }

    #[must_use]
    pub fn into_parts(self) -> (Shape<F>, SlotMap) {
        let Self { shape, renaming } = self;
        (shape, renaming)
    }
}

impl<F: fmt::Debug> fmt::Debug for ShapeCall<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { shape, renaming } = self;
        f.debug_struct("ShapeCall")
            .field("shape", shape)
            .field("renaming", renaming)
            .finish()
    }
}

impl<F: Clone> Clone for ShapeCall<F> {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            renaming: self.renaming.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::ENode;
    use crate::slot::Slot;

    fn var_node(s: Slot) -> ENode<char> { ENode::new('v', vec![], vec![s], vec![]) }

    fn lam_node(bind: Slot, body: Slot) -> ENode<char> {
        ENode::new('λ', vec![bind], vec![body], vec![])
    }

    #[test]
    fn shape_numbers_in_encounter_order() {
        let x = Slot::fresh();
        let y = Slot::fresh();
        let node = ENode::new('f', vec![], vec![y, x, y], vec![]);

        let sc = node.shape_call();
        assert_eq!(sc.shape().node().uses(), &[
            Slot::numeric(0),
            Slot::numeric(1),
            Slot::numeric(0)
        ]);
        assert_eq!(sc.renaming().get(Slot::numeric(0)), Some(y));
        assert_eq!(sc.renaming().get(Slot::numeric(1)), Some(x));
    }

    #[test]
    fn alpha_equivalent_binders_share_a_shape() {
        let x = Slot::fresh();
        let y = Slot::fresh();
        assert_eq!(
            lam_node(x, x).shape_call().shape(),
            lam_node(y, y).shape_call().shape()
        );
        assert_ne!(
            lam_node(x, x).shape_call().shape(),
            lam_node(x, y).shape_call().shape()
        );
    }

    #[test]
    fn definitions_are_not_public() {
        let x = Slot::fresh();
        let y = Slot::fresh();
        let node = ENode::new('λ', vec![x], vec![x, y], vec![]);
        assert_eq!(node.public_slots(), [y].into_iter().collect());
    }

    proptest! {
        #[test]
        fn shape_renaming_round_trips(
            uses in prop::collection::vec(0u64..8, 0..6),
            defs in prop::collection::vec(0u64..8, 0..3),
        ) {
            let node = ENode::new(
                'f',
                defs.into_iter().map(Slot::Fresh).collect(),
                uses.into_iter().map(Slot::Fresh).collect(),
                vec![],
            );

            let sc = node.shape_call();
            prop_assert_eq!(sc.shape().rename(sc.renaming()), node);
        }

        #[test]
        fn shapes_ignore_original_names(base in 0u64..64, offset in 64u64..128) {
            let a = var_node(Slot::Fresh(base));
            let b = var_node(Slot::Fresh(base + offset));
            let a_sc = a.shape_call();
            let b_sc = b.shape_call();
            prop_assert_eq!(a_sc.shape(), b_sc.shape());
        }
    }
}
