//! Finite slot-to-slot maps with the composition variants the e-graph needs

use std::{collections::BTreeMap, fmt};

use crate::slot::Slot;

/// A finite function from slot to slot
///
/// Iteration is key-sorted, and equality and ordering are structural, so maps
/// can key B-tree collections and act as deterministic hash-cons components.
#[derive(Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotMap(BTreeMap<Slot, Slot>);

impl fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Pair(Slot, Slot);

        impl fmt::Debug for Pair {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let Self(k, v) = self;
                write!(f, "{k} -> {v}")
            }
        }

        f.debug_set()
            .entries(self.0.iter().map(|(&k, &v)| Pair(k, v)))
            .finish()
    }
}

impl SlotMap {
    #[must_use]
    #[inline]
    pub const fn new() -> Self { Self(BTreeMap::new()) }

    /// The identity map over the given keys
    #[must_use]
    pub fn identity<I: IntoIterator<Item = Slot>>(keys: I) -> Self {
        Self(keys.into_iter().map(|s| (s, s)).collect())
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize { self.0.len() }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    #[inline]
    pub fn insert(&mut self, key: Slot, val: Slot) -> Option<Slot> { self.0.insert(key, val) }

    #[inline]
    pub fn remove(&mut self, key: Slot) -> Option<Slot> { self.0.remove(&key) }

    #[must_use]
    #[inline]
    pub fn get(&self, key: Slot) -> Option<Slot> { self.0.get(&key).copied() }

    #[must_use]
    #[inline]
    pub fn contains_key(&self, key: Slot) -> bool { self.0.contains_key(&key) }

    /// The image of `key`, or `key` itself when the map has no entry for it
    #[must_use]
    #[inline]
    pub fn apply(&self, key: Slot) -> Slot { self.get(key).unwrap_or(key) }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Slot, Slot)> + '_ {
        self.0.iter().map(|(&k, &v)| (k, v))
    }

    #[inline]
    pub fn keys(&self) -> impl Iterator<Item = Slot> + '_ { self.0.keys().copied() }

    #[inline]
    pub fn values(&self) -> impl Iterator<Item = Slot> + '_ { self.0.values().copied() }

    #[must_use]
    pub fn key_set(&self) -> std::collections::BTreeSet<Slot> { self.keys().collect() }

    #[must_use]
    pub fn value_set(&self) -> std::collections::BTreeSet<Slot> { self.values().collect() }

    /// Returns true if no two keys share an image
    #[must_use]
    pub fn is_injective(&self) -> bool {
        let mut seen = std::collections::BTreeSet::new();
        self.values().all(|v| seen.insert(v))
    }

    /// Swap keys and values
    ///
    /// Defined only when the map is injective (a bijection onto its image);
    /// feeding a non-injective map here is a programmer error.
    #[must_use]
    pub fn inverse(&self) -> Self {
        self.try_inverse()
            .unwrap_or_else(|| panic!("inverse of non-injective slot map {self:?}"))
    }

    #[must_use]
    pub fn try_inverse(&self) -> Option<Self> {
        let mut inv = BTreeMap::new();
        for (k, v) in self.iter() {
            if inv.insert(v, k).is_some() {
                return None;
            }
        }
        Some(Self(inv))
    }

    /// Map `a -> c` wherever `a -> b` here and `b -> c` in `other`
    ///
    /// Every image of this map must be a key of `other`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        Self(
            self.iter()
                .map(|(k, v)| {
                    let v = other
                        .get(v)
                        .unwrap_or_else(|| panic!("compose: image {v} has no entry"));
                    (k, v)
                })
                .collect(),
        )
    }

    /// Like [`compose`](Self::compose), dropping entries whose image is not a
    /// key of `other`
    #[must_use]
    pub fn compose_partial(&self, other: &Self) -> Self {
        Self(
            self.iter()
                .filter_map(|(k, v)| other.get(v).map(|v| (k, v)))
                .collect(),
        )
    }

    /// Like [`compose`](Self::compose), keeping the original image when
    /// `other` has no entry for it
    #[must_use]
    pub fn compose_retain(&self, other: &Self) -> Self {
        Self(self.iter().map(|(k, v)| (k, other.apply(v))).collect())
    }

    /// Like [`compose`](Self::compose), substituting a fresh slot when
    /// `other` has no entry for the image
    ///
    /// Distinct occurrences of the same missing image share one fresh slot,
    /// so the result is still a renaming.
    #[must_use]
    pub fn compose_fresh(&self, other: &Self) -> Self {
        let mut fresh = BTreeMap::new();
        Self(
            self.iter()
                .map(|(k, v)| {
                    let v = other
                        .get(v)
                        .unwrap_or_else(|| *fresh.entry(v).or_insert_with(Slot::fresh));
                    (k, v)
                })
                .collect(),
        )
    }

    /// Keep only the entries whose key is in `keys`
    #[must_use]
    pub fn restrict(&self, keys: &std::collections::BTreeSet<Slot>) -> Self {
        Self(self.iter().filter(|(k, _)| keys.contains(k)).collect())
    }

    /// Keep only the entries whose image is in `values`
    #[must_use]
    pub fn restrict_values(&self, values: &std::collections::BTreeSet<Slot>) -> Self {
        Self(self.iter().filter(|(_, v)| values.contains(v)).collect())
    }

    /// Extend the map with a fresh image for every slot of `occurrences` that
    /// has no entry yet
    #[must_use]
    pub fn freshened<I: IntoIterator<Item = Slot>>(&self, occurrences: I) -> Self {
        let mut out = self.clone();
        for s in occurrences {
            if !out.contains_key(s) {
                out.insert(s, Slot::fresh());
            }
        }
        out
    }
}

impl FromIterator<(Slot, Slot)> for SlotMap {
    fn from_iter<I: IntoIterator<Item = (Slot, Slot)>>(it: I) -> Self {
        Self(it.into_iter().collect())
    }
}

fn copy_entry<'a>((&k, &v): (&'a Slot, &'a Slot)) -> (Slot, Slot) { (k, v) }

impl<'a> IntoIterator for &'a SlotMap {
    type IntoIter = std::iter::Map<
        std::collections::btree_map::Iter<'a, Slot, Slot>,
        fn((&'a Slot, &'a Slot)) -> (Slot, Slot),
    >;
    type Item = (Slot, Slot);

    fn into_iter(self) -> Self::IntoIter { self.0.iter().map(copy_entry) }
}
