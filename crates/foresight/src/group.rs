//! Slot-symmetry groups of e-classes

use std::collections::BTreeSet;

use crate::{slot::Slot, slot_map::SlotMap};

/// The group of slot permutations an e-class satisfies
///
/// Stored as the full closure under composition; classes carry few parameter
/// slots in practice, so exhaustive enumeration beats a generating-set
/// structure here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermGroup {
    slots: BTreeSet<Slot>,
    perms: BTreeSet<SlotMap>,
}

impl PermGroup {
    /// The trivial group over the given slot set
    #[must_use]
    pub fn identity(slots: BTreeSet<Slot>) -> Self {
        let perms = [SlotMap::identity(slots.iter().copied())].into_iter().collect();
        Self { slots, perms }
    }

    #[must_use]
    #[inline]
    pub fn slots(&self) -> &BTreeSet<Slot> { &self.slots }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize { self.perms.len() }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool { false }

    #[must_use]
    #[inline]
    pub fn is_trivial(&self) -> bool { self.perms.len() == 1 }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &SlotMap> + '_ { self.perms.iter() }

    #[must_use]
    pub fn contains(&self, perm: &SlotMap) -> bool { self.perms.contains(perm) }

    fn is_permutation(&self, perm: &SlotMap) -> bool {
        perm.key_set() == self.slots && perm.value_set() == self.slots
    }

    /// Absorb a new permutation, returning true if the group grew
    ///
    /// The argument must be a bijection of the group's slot set onto itself.
    pub fn add_generator(&mut self, perm: SlotMap) -> bool {
        assert!(
            self.is_permutation(&perm),
            "generator {perm:?} is not a permutation of {:?}",
            self.slots
        );

        if !self.perms.insert(perm) {
            return false;
        }

        // Re-close under composition
        let mut frontier: Vec<_> = self.perms.iter().cloned().collect();
        while let Some(p) = frontier.pop() {
            let products: Vec<_> = self
                .perms
                .iter()
                .flat_map(|q| [p.compose(q), q.compose(&p)])
                .collect();

            for r in products {
                if self.perms.insert(r.clone()) {
                    frontier.push(r);
                }
            }
        }

        true
    }

    /// The canonical coset representative of an argument map: the minimum of
    /// `g ∘ m` over the group under the sorted-map order
    #[must_use]
    pub fn project(&self, map: &SlotMap) -> SlotMap {
        self.perms
            .iter()
            .map(|p| p.compose_partial(map))
            .min()
            .unwrap_or_else(|| unreachable!())
    }

    /// Restrict the group to a surviving slot set
    ///
    /// Permutations that do not map the surviving set onto itself are
    /// dropped; the remainder is still closed under composition.
    pub fn restrict(&mut self, slots: &BTreeSet<Slot>) {
        debug_assert!(slots.is_subset(&self.slots));

        self.perms = self
            .perms
            .iter()
            .filter_map(|p| {
                let p = p.restrict(slots);
                (p.value_set() == *slots).then_some(p)
            })
            .collect();
        self.slots = slots.clone();

        debug_assert!(self.perms.contains(&SlotMap::identity(slots.iter().copied())));
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::PermGroup;
    use crate::{slot::Slot, slot_map::SlotMap};

    fn n(i: u32) -> Slot { Slot::numeric(i) }

    fn perm(pairs: &[(u32, u32)]) -> SlotMap {
        pairs.iter().map(|&(k, v)| (n(k), n(v))).collect()
    }

    fn slots(ns: &[u32]) -> BTreeSet<Slot> { ns.iter().map(|&i| n(i)).collect() }

    #[test]
    fn swap_generates_order_two() {
        let mut g = PermGroup::identity(slots(&[0, 1]));
        assert!(g.is_trivial());

        assert!(g.add_generator(perm(&[(0, 1), (1, 0)])));
        assert_eq!(g.len(), 2);
        assert!(!g.add_generator(perm(&[(0, 1), (1, 0)])));
    }

    #[test]
    fn rotation_closes_to_cyclic_group() {
        let mut g = PermGroup::identity(slots(&[0, 1, 2]));
        assert!(g.add_generator(perm(&[(0, 1), (1, 2), (2, 0)])));
        // The closure contains the rotation, its square, and the identity
        assert_eq!(g.len(), 3);
        assert!(g.contains(&perm(&[(0, 2), (1, 0), (2, 1)])));
    }

    #[test]
    fn project_is_group_invariant() {
        let mut g = PermGroup::identity(slots(&[0, 1]));
        g.add_generator(perm(&[(0, 1), (1, 0)]));

        let a: SlotMap = [(n(0), n(7)), (n(1), n(8))].into_iter().collect();
        let b: SlotMap = [(n(0), n(8)), (n(1), n(7))].into_iter().collect();
        assert_eq!(g.project(&a), g.project(&b));
    }

    #[test]
    fn restrict_keeps_closed_subgroup() {
        let mut g = PermGroup::identity(slots(&[0, 1, 2]));
        g.add_generator(perm(&[(0, 1), (1, 0), (2, 2)]));
        g.add_generator(perm(&[(0, 0), (1, 2), (2, 1)]));
        assert_eq!(g.len(), 6);

        g.restrict(&slots(&[0, 1]));
        // Only the identity and the 0<->1 swap preserve {0, 1}
        assert_eq!(g.len(), 2);
    }
}
