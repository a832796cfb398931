//! The slotted e-graph store: hash-consing, union, and congruence closure

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
};

use crate::{
    group::PermGroup,
    node::{EClassCall, EClassId, ENode, Shape, ShapeCall},
    parallel::{Canceled, ParallelMap},
    slot::Slot,
    slot_map::SlotMap,
    term::{MixedTree, Tree},
};

/// A lookup against a reference this graph does not own
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no e-class found with ID {0:?}")]
pub struct UnknownEClass(pub EClassId);

/// Failure of a batched graph operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    UnknownEClass(#[from] UnknownEClass),
    #[error(transparent)]
    Canceled(#[from] Canceled),
}

/// The outcome of inserting one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddNodeResult {
    /// The node seeded a new class
    Added(EClassCall),
    /// An equivalent shape was already present
    AlreadyThere(EClassCall),
}

impl AddNodeResult {
    #[must_use]
    #[inline]
    pub fn call(&self) -> &EClassCall {
        match self {
            Self::Added(c) | Self::AlreadyThere(c) => c,
        }
    }

    #[must_use]
    pub fn into_call(self) -> EClassCall {
        match self {
            Self::Added(c) | Self::AlreadyThere(c) => c,
        }
    }

    #[must_use]
    #[inline]
    pub fn is_added(&self) -> bool { matches!(self, Self::Added(_)) }
}

/// The merge groups produced by a batch of unions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnionReport {
    /// Every set of refs that now share a representative because of this
    /// batch
    pub groups: BTreeSet<BTreeSet<EClassId>>,
    /// Whether anything observable changed (merges, parameter elimination,
    /// or symmetry-group growth)
    pub changed: bool,
}

trait ExpectInvariant<T> {
    fn expect_invariant(self, msg: &str) -> T;
}

#[cfg(any(test, feature = "test"))]
impl<T> ExpectInvariant<T> for Option<T> {
    #[inline]
    fn expect_invariant(self, msg: &str) -> T { self.expect(msg) }
}

#[cfg(any(test, feature = "test"))]
impl<T, E> ExpectInvariant<T> for Result<T, E> {
    #[inline]
    fn expect_invariant(self, msg: &str) -> T { self.unwrap_or_else(|_| panic!("{msg}")) }
}

#[cfg(not(any(test, feature = "test")))]
impl<T> ExpectInvariant<T> for Option<T> {
    #[inline]
    fn expect_invariant(self, _: &str) -> T { self.unwrap_or_else(|| unreachable!()) }
}

#[cfg(not(any(test, feature = "test")))]
impl<T, E> ExpectInvariant<T> for Result<T, E> {
    #[inline]
    fn expect_invariant(self, _: &str) -> T { self.unwrap_or_else(|_| unreachable!()) }
}

macro_rules! invariant {
    ($($tt:tt)*) => {{
        #[cfg(any(test, feature = "test"))]
        { panic!($($tt)*) }

        #[cfg(not(any(test, feature = "test")))]
        { unreachable!() }
    }};
}

#[derive(Debug, Clone)]
enum Link {
    Root { rank: usize },
    Merged(EClassCall),
}

struct EClassData<F> {
    slots: BTreeSet<Slot>,
    shapes: BTreeMap<Shape<F>, SlotMap>,
    group: PermGroup,
    users: BTreeSet<Shape<F>>,
}

impl<F: fmt::Debug> fmt::Debug for EClassData<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            slots,
            shapes,
            group,
            users,
        } = self;
        f.debug_struct("EClassData")
            .field("slots", slots)
            .field("shapes", shapes)
            .field("group", group)
            .field("users", users)
            .finish()
    }
}

impl<F: Clone> Clone for EClassData<F> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            shapes: self.shapes.clone(),
            group: self.group.clone(),
            users: self.users.clone(),
        }
    }
}

/// A slotted e-graph
///
/// The store is a value: the batched mutating operations take `&self` and
/// return a fresh graph, and the in-place operations are only reachable
/// through exclusive borrows, so callers always observe immutability.
pub struct EGraph<F> {
    links: Vec<Link>,
    classes: BTreeMap<EClassId, EClassData<F>>,
    memo: BTreeMap<Shape<F>, EClassId>,
    poison: bool,
}

impl<F: fmt::Debug> fmt::Debug for EGraph<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            links,
            classes,
            memo,
            poison,
        } = self;
        f.debug_struct("EGraph")
            .field("links", links)
            .field("classes", classes)
            .field("memo", memo)
            .field("poison", poison)
            .finish()
    }
}

impl<F: Clone> Clone for EGraph<F> {
    fn clone(&self) -> Self {
        self.poison_check();
        Self {
            links: self.links.clone(),
            classes: self.classes.clone(),
            memo: self.memo.clone(),
            poison: false,
        }
    }
}

impl<F> Default for EGraph<F> {
    #[inline]
    fn default() -> Self { Self::new() }
}

impl<F> EGraph<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            classes: BTreeMap::new(),
            memo: BTreeMap::new(),
            poison: false,
        }
    }

    #[inline]
    fn poison_check(&self) {
        assert!(!self.poison, "e-graph was poisoned!");
    }

    /// The number of canonical classes
    #[must_use]
    #[inline]
    pub fn class_count(&self) -> usize { self.classes.len() }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool { self.classes.is_empty() }

    /// Iterate the canonical class ids in id order
    pub fn classes(&self) -> impl Iterator<Item = EClassId> + '_ { self.classes.keys().copied() }
}

impl<F: Ord + Clone> EGraph<F> {
    fn data(&self, id: EClassId) -> &EClassData<F> {
        self.classes
            .get(&id)
            .expect_invariant("Non-canonical ID used as class key")
    }

    /// The parameter slots of a class
    ///
    /// # Errors
    /// Fails when the ref is not owned by this graph.
    pub fn class_slots(&self, id: EClassId) -> Result<BTreeSet<Slot>, UnknownEClass> {
        let call = self.canonicalize(id)?;
        Ok(self.data(call.id()).slots.clone())
    }

    /// The canonical call for `id`, carrying the identity map over the
    /// representative's parameter slots
    ///
    /// # Errors
    /// Fails when the ref is not owned by this graph.
    pub fn canonicalize(&self, id: EClassId) -> Result<EClassCall, UnknownEClass> {
        match self.links.get(id.id()) {
            None => Err(UnknownEClass(id)),
            Some(Link::Root { .. }) => Ok(EClassCall::identity(
                id,
                self.data(id).slots.iter().copied(),
            )),
            Some(Link::Merged(up)) => {
                let canon = self
                    .canonicalize(up.id())
                    .expect_invariant("Dangling union-find link");
                Ok(EClassCall::new(
                    canon.id(),
                    canon.args().compose_partial(up.args()),
                ))
            },
        }
    }

    /// Canonicalize the ref of a call and restrict its argument map to the
    /// representative's parameter slots
    ///
    /// # Errors
    /// Fails when the ref is not owned by this graph.
    pub fn canonicalize_call(&self, call: &EClassCall) -> Result<EClassCall, UnknownEClass> {
        let canon = self.canonicalize(call.id())?;
        Ok(EClassCall::new(
            canon.id(),
            canon.args().compose_partial(call.args()),
        ))
    }

    /// Canonicalize a node's children and compute its shape
    ///
    /// Argument maps are projected onto their canonical group-coset
    /// representative, so group-equivalent applications produce identical
    /// shapes.
    ///
    /// # Errors
    /// Fails when any child ref is not owned by this graph.
    pub fn canonicalize_node(&self, node: &ENode<F>) -> Result<ShapeCall<F>, UnknownEClass> {
        let mut args = Vec::with_capacity(node.args().len());
        for arg in node.args() {
            let call = self.canonicalize_call(arg)?;
            let projected = self.data(call.id()).group.project(call.args());
            args.push(EClassCall::new(call.id(), projected));
        }

        let node = ENode::new(
            node.op().clone(),
            node.defs().to_vec(),
            node.uses().to_vec(),
            args,
        );
        Ok(node.shape_call())
    }

    /// The class's nodes materialized into the caller's slot context
    ///
    /// Private slots (definition-bound or eliminated) come out fresh.
    ///
    /// # Errors
    /// Fails when the ref is not owned by this graph.
    pub fn nodes(&self, call: &EClassCall) -> Result<BTreeSet<ENode<F>>, UnknownEClass> {
        let call = self.canonicalize_call(call)?;
        Ok(self
            .data(call.id())
            .shapes
            .iter()
            .map(|(shape, ren)| {
                let node = shape.rename(ren);
                let ctx = call.args().freshened(node.slot_occurrences().collect::<Vec<_>>());
                node.rename(&ctx)
            })
            .collect())
    }

    /// The nodes referencing this class, materialized into their own class's
    /// slot context
    ///
    /// # Errors
    /// Fails when the ref is not owned by this graph.
    pub fn users(&self, id: EClassId) -> Result<BTreeSet<ENode<F>>, UnknownEClass> {
        let call = self.canonicalize(id)?;
        Ok(self
            .data(call.id())
            .users
            .iter()
            .map(|shape| {
                let owner = self
                    .memo
                    .get(shape)
                    .expect_invariant("User shape missing from the hash-cons index");
                let ren = self
                    .data(*owner)
                    .shapes
                    .get(shape)
                    .expect_invariant("User shape missing from its owner");
                shape.rename(ren)
            })
            .collect())
    }

    fn lookup_shape(&self, sc: &ShapeCall<F>) -> Option<EClassCall> {
        let &id = self.memo.get(sc.shape())?;
        let data = self.data(id);
        let stored = data
            .shapes
            .get(sc.shape())
            .expect_invariant("Hash-cons entry missing from its class");

        let params = stored.restrict_values(&data.slots).inverse();
        Some(EClassCall::new(id, params.compose(sc.renaming())))
    }

    /// Look the node up by shape, mapping the result back into the node's
    /// slot context
    ///
    /// # Errors
    /// Fails when any child ref is not owned by this graph.
    pub fn find(&self, node: &ENode<F>) -> Result<Option<EClassCall>, UnknownEClass> {
        let sc = self.canonicalize_node(node)?;
        Ok(self.lookup_shape(&sc))
    }

    /// Look a whole term up without inserting anything
    ///
    /// # Errors
    /// Fails when any embedded ref is not owned by this graph.
    pub fn find_tree(&self, tree: &MixedTree<F>) -> Result<Option<EClassCall>, UnknownEClass> {
        match tree {
            MixedTree::Call(c) => self.canonicalize_call(c).map(Some),
            MixedTree::Node {
                op,
                defs,
                uses,
                children,
            } => {
                let mut args = Vec::with_capacity(children.len());
                for child in children {
                    let Some(call) = self.find_tree(child)? else {
                        return Ok(None);
                    };
                    args.push(call);
                }

                self.find(&ENode::new(op.clone(), defs.clone(), uses.clone(), args))
            },
        }
    }

    /// Returns true when the term is already represented
    ///
    /// # Errors
    /// Fails when any embedded ref is not owned by this graph.
    pub fn contains(&self, tree: &MixedTree<F>) -> Result<bool, UnknownEClass> {
        self.find_tree(tree).map(|c| c.is_some())
    }

    /// Whether two calls denote the same class, modulo the class's slot
    /// symmetry group
    ///
    /// # Errors
    /// Fails when either ref is not owned by this graph.
    pub fn are_same(&self, a: &EClassCall, b: &EClassCall) -> Result<bool, UnknownEClass> {
        let a = self.canonicalize_call(a)?;
        let b = self.canonicalize_call(b)?;

        if a.id() != b.id() {
            return Ok(false);
        }

        let group = &self.data(a.id()).group;
        Ok(group.project(a.args()) == group.project(b.args()))
    }

    fn add_shaped(&mut self, sc: ShapeCall<F>) -> AddNodeResult {
        if let Some(call) = self.lookup_shape(&sc) {
            return AddNodeResult::AlreadyThere(call);
        }

        let (shape, renaming) = sc.into_parts();
        let id = EClassId::new(self.links.len());
        self.links.push(Link::Root { rank: 1 });

        let params = shape.node().public_slots();
        let all_slots: BTreeSet<_> = shape.node().slot_occurrences().collect();

        for arg in shape.node().args() {
            self.classes
                .get_mut(&arg.id())
                .expect_invariant("Added node has a non-canonical child")
                .users
                .insert(shape.clone());
        }

        self.classes.insert(id, EClassData {
            slots: params.clone(),
            shapes: [(shape.clone(), SlotMap::identity(all_slots))]
                .into_iter()
                .collect(),
            group: PermGroup::identity(params.clone()),
            users: BTreeSet::new(),
        });
        self.memo.insert(shape, id);

        AddNodeResult::Added(EClassCall::new(id, renaming.restrict(&params)))
    }

    /// Insert one node, returning the call for its class
    ///
    /// # Errors
    /// Fails when any child ref is not owned by this graph.
    pub fn add(&mut self, node: &ENode<F>) -> Result<AddNodeResult, UnknownEClass> {
        let sc = self.canonicalize_node(node)?;
        Ok(self.add_shaped(sc))
    }

    /// Insert a ground term bottom-up, returning the root call
    ///
    /// # Errors
    /// Never fails on a ground term; the signature matches
    /// [`add_mixed_tree`](Self::add_mixed_tree) for composition.
    pub fn add_tree(&mut self, tree: &Tree<F>) -> Result<EClassCall, UnknownEClass> {
        let mut args = Vec::with_capacity(tree.children.len());
        for child in &tree.children {
            args.push(self.add_tree(child)?);
        }

        let node = ENode::new(tree.op.clone(), tree.defs.clone(), tree.uses.clone(), args);
        Ok(self.add(&node)?.into_call())
    }

    /// Insert a term with embedded calls bottom-up, returning the root call
    ///
    /// # Errors
    /// Fails when any embedded ref is not owned by this graph.
    pub fn add_mixed_tree(&mut self, tree: &MixedTree<F>) -> Result<EClassCall, UnknownEClass> {
        match tree {
            MixedTree::Call(c) => self.canonicalize_call(c),
            MixedTree::Node {
                op,
                defs,
                uses,
                children,
            } => {
                let mut args = Vec::with_capacity(children.len());
                for child in children {
                    args.push(self.add_mixed_tree(child)?);
                }

                let node = ENode::new(op.clone(), defs.clone(), uses.clone(), args);
                Ok(self.add(&node)?.into_call())
            },
        }
    }

    /// Begin a batch of unions; congruence repair runs as the batch proceeds
    /// and the guard validates invariants when dropped
    pub fn write(&mut self) -> EGraphMut<'_, F> {
        self.poison_check();
        self.poison = true;

        EGraphMut {
            eg: self,
            queue: VecDeque::new(),
            merged: Vec::new(),
            changed: false,
        }
    }

    /// Insert many nodes into a fresh snapshot
    ///
    /// Shape computation runs through `parallel`; insertion is serialized so
    /// hash-consing stays unique.
    ///
    /// # Errors
    /// Fails when a child ref is unknown or the operation is canceled.
    pub fn try_add_many(
        &self,
        nodes: &[ENode<F>],
        parallel: &ParallelMap,
    ) -> Result<(Vec<AddNodeResult>, Self), BatchError>
    where
        F: Send + Sync,
    {
        self.poison_check();

        let shaped = parallel.try_apply::<_, _, BatchError, _>(nodes.iter().collect(), |n| {
            self.canonicalize_node(n).map_err(Into::into)
        })?;

        let mut next = self.clone();
        let results = shaped.into_iter().map(|sc| next.add_shaped(sc)).collect();
        Ok((results, next))
    }

    /// Union many pairs of calls into a fresh snapshot, returning the merge
    /// groups discovered (including those found by upward merging)
    ///
    /// # Errors
    /// Fails when a ref is unknown or the operation is canceled.
    pub fn union_many(
        &self,
        pairs: &[(EClassCall, EClassCall)],
        parallel: &ParallelMap,
    ) -> Result<(UnionReport, Self), BatchError>
    where
        F: Send + Sync,
    {
        self.poison_check();

        let canon = parallel.try_apply::<_, _, BatchError, _>(pairs.to_vec(), |(a, b)| {
            Ok((self.canonicalize_call(&a)?, self.canonicalize_call(&b)?))
        })?;

        let mut next = self.clone();
        let mut wr = next.write();
        for (a, b) in canon {
            wr.union(&a, &b)
                .expect_invariant("Pre-canonicalized union pair was rejected");
        }

        let report = wr.finish();
        Ok((report, next))
    }
}

/// A write guard over an e-graph
///
/// Unions queue through here; each one runs congruence repair to a fixpoint
/// before returning.  Dropping the guard re-validates the store's
/// invariants.  If repair panics the graph stays poisoned.
pub struct EGraphMut<'a, F: Ord + Clone> {
    eg: &'a mut EGraph<F>,
    queue: VecDeque<Job<F>>,
    merged: Vec<(EClassId, EClassId)>,
    changed: bool,
}

enum Job<F> {
    Union(EClassCall, EClassCall),
    Reshape(Shape<F>),
}

impl<F: Ord + Clone + fmt::Debug> fmt::Debug for EGraphMut<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            eg,
            queue: _,
            merged,
            changed,
        } = self;
        f.debug_struct("EGraphMut")
            .field("eg", eg)
            .field("merged", merged)
            .field("changed", changed)
            .finish()
    }
}

impl<F: Ord + Clone> Drop for EGraphMut<'_, F> {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            // Repair was interrupted; leave the graph poisoned
            return;
        }

        self.eg.assert_invariants();
        self.eg.poison = false;
    }
}

impl<F: Ord + Clone> EGraphMut<'_, F> {
    /// Insert one node
    ///
    /// # Errors
    /// Fails when any child ref is not owned by this graph.
    #[inline]
    pub fn add(&mut self, node: &ENode<F>) -> Result<AddNodeResult, UnknownEClass> {
        self.eg.add(node)
    }

    /// Union two calls and run congruence repair to a fixpoint
    ///
    /// Returns true if anything observable changed.
    ///
    /// # Errors
    /// Fails when either ref is not owned by this graph.
    pub fn union(&mut self, a: &EClassCall, b: &EClassCall) -> Result<bool, UnknownEClass> {
        let a = self.eg.canonicalize_call(a)?;
        let b = self.eg.canonicalize_call(b)?;

        let before = self.changed;
        self.changed = false;
        self.queue.push_back(Job::Union(a, b));
        self.drain();

        let delta = self.changed;
        self.changed = before || delta;
        Ok(delta)
    }

    /// Whether this guard has changed anything observable so far
    #[must_use]
    #[inline]
    pub fn changed(&self) -> bool { self.changed }

    /// Finish the batch, reporting the merge groups it produced
    #[must_use]
    pub fn finish(mut self) -> UnionReport {
        let merged = std::mem::take(&mut self.merged);
        let changed = self.changed;

        let mut groups: Vec<BTreeSet<EClassId>> = Vec::new();
        for (w, l) in merged {
            let wi = groups.iter().position(|g| g.contains(&w));
            let li = groups.iter().position(|g| g.contains(&l));
            match (wi, li) {
                (Some(i), Some(j)) if i != j => {
                    let other = groups.swap_remove(i.max(j));
                    groups[i.min(j)].extend(other);
                },
                (Some(_), Some(_)) => (),
                (Some(i), None) => drop(groups[i].insert(l)),
                (None, Some(j)) => drop(groups[j].insert(w)),
                (None, None) => groups.push([w, l].into_iter().collect()),
            }
        }

        UnionReport {
            groups: groups.into_iter().collect(),
            changed,
        }
    }

    fn drain(&mut self) {
        while let Some(job) = self.queue.pop_front() {
            match job {
                Job::Union(a, b) => self.process_union(a, b),
                Job::Reshape(shape) => self.process_reshape(shape),
            }
        }
    }

    fn reshape_users_of(&mut self, id: EClassId) {
        let users: Vec<_> = self.eg.data(id).users.iter().cloned().collect();
        self.queue.extend(users.into_iter().map(Job::Reshape));
    }

    /// Restrict a class's parameter slots, queuing its users for reshaping
    fn shrink(&mut self, id: EClassId, slots: BTreeSet<Slot>) {
        let data = self
            .eg
            .classes
            .get_mut(&id)
            .expect_invariant("Shrink of a non-canonical class");

        if data.slots == slots {
            return;
        }
        debug_assert!(slots.is_subset(&data.slots));

        data.slots = slots.clone();
        data.group.restrict(&slots);
        self.changed = true;

        self.reshape_users_of(id);
    }

    /// The largest subset of `slots` on which `map` restricts to a bijection
    /// of the subset onto itself
    fn max_closed_domain(map: &SlotMap, slots: &BTreeSet<Slot>) -> BTreeSet<Slot> {
        let mut s = slots.clone();
        loop {
            let kept: BTreeSet<Slot> = s
                .iter()
                .copied()
                .filter(|&p| map.get(p).is_some_and(|q| s.contains(&q)))
                .collect();
            let image: BTreeSet<Slot> = kept
                .iter()
                .map(|&p| map.get(p).unwrap_or_else(|| unreachable!()))
                .collect();
            let next: BTreeSet<Slot> = kept.intersection(&image).copied().collect();

            if next == s {
                break s;
            }
            s = next;
        }
    }

    fn process_union(&mut self, a: EClassCall, b: EClassCall) {
        let a = self
            .eg
            .canonicalize_call(&a)
            .expect_invariant("Queued union pair had an invalid lhs");
        let b = self
            .eg
            .canonicalize_call(&b)
            .expect_invariant("Queued union pair had an invalid rhs");

        if a.id() == b.id() {
            self.absorb_symmetry(&a, &b);
        } else {
            self.merge_classes(&a, &b);
        }
    }

    /// The two calls hit the same class; absorb the symmetry their argument
    /// maps imply, eliminating parameters the correspondence misses
    fn absorb_symmetry(&mut self, a: &EClassCall, b: &EClassCall) {
        let id = a.id();
        let phi = a.args().compose_partial(&b.args().inverse());

        let params = self.eg.data(id).slots.clone();
        let closed = Self::max_closed_domain(&phi, &params);
        if closed != params {
            self.shrink(id, closed.clone());
        }

        let phi = phi.restrict(&closed);
        if phi == SlotMap::identity(closed.iter().copied()) {
            return;
        }

        let grew = self
            .eg
            .classes
            .get_mut(&id)
            .expect_invariant("Symmetry target vanished")
            .group
            .add_generator(phi);

        if grew {
            self.changed = true;
            // Group-equivalent applications now shape identically, so users
            // must be re-keyed to discover the collisions
            self.reshape_users_of(id);
        }
    }

    fn merge_classes(&mut self, a: &EClassCall, b: &EClassCall) {
        let (win, lose) = {
            let rank = |id: EClassId| match self.eg.links[id.id()] {
                Link::Root { rank } => rank,
                Link::Merged(_) => invariant!("Canonical call resolved to a merged class"),
            };

            match rank(a.id())
                .cmp(&rank(b.id()))
                .then_with(|| b.id().cmp(&a.id()))
            {
                std::cmp::Ordering::Less => (b, a),
                std::cmp::Ordering::Equal => unreachable!(),
                std::cmp::Ordering::Greater => (a, b),
            }
        };

        // params(lose) -> params(win), where the two contexts correspond
        let theta = lose.args().compose_partial(&win.args().inverse());

        let surviving = theta.value_set();
        let win_params = self.eg.data(win.id()).slots.clone();
        if !win_params.is_subset(&surviving) {
            let kept = win_params
                .intersection(&surviving)
                .copied()
                .collect::<BTreeSet<_>>();
            self.shrink(win.id(), kept);
        }
        let win_params = self.eg.data(win.id()).slots.clone();
        let theta = theta.restrict_values(&win_params);

        let lose_data = self
            .eg
            .classes
            .remove(&lose.id())
            .expect_invariant("Merged class had no data");

        let lose_rank = match self.eg.links[lose.id().id()] {
            Link::Root { rank } => rank,
            Link::Merged(_) => invariant!("Merging a non-root class"),
        };
        self.eg.links[lose.id().id()] =
            Link::Merged(EClassCall::new(win.id(), theta.inverse()));
        match &mut self.eg.links[win.id().id()] {
            Link::Root { rank } => *rank += lose_rank,
            Link::Merged(_) => invariant!("Union winner is not a root"),
        }

        self.merged.push((win.id(), lose.id()));
        self.changed = true;

        // Conjugate the loser's symmetries into the winner's parameter space
        let mut grew = false;
        let conjugated: Vec<_> = lose_data
            .group
            .iter()
            .map(|g| theta.inverse().compose_partial(g).compose_partial(&theta))
            .collect();
        for h in conjugated {
            if h.key_set() == win_params && h.value_set() == win_params {
                let data = self
                    .eg
                    .classes
                    .get_mut(&win.id())
                    .expect_invariant("Union winner had no data");
                grew |= data.group.add_generator(h);
            }
        }
        if grew {
            self.reshape_users_of(win.id());
        }

        // Move the loser's shapes across, queuing an automorphism union when
        // the winner already stores the same shape under another renaming
        for (shape, ren) in lose_data.shapes {
            let ren = ren.compose_fresh(&theta);
            self.eg.memo.insert(shape.clone(), win.id());

            let data = self
                .eg
                .classes
                .get_mut(&win.id())
                .expect_invariant("Union winner had no data");

            if let Some(existing) = data.shapes.get(&shape) {
                let lhs = existing.restrict_values(&win_params).inverse();
                let rhs = ren.restrict_values(&win_params).inverse();
                if lhs != rhs {
                    self.queue.push_back(Job::Union(
                        EClassCall::new(win.id(), lhs),
                        EClassCall::new(win.id(), rhs),
                    ));
                }
            } else {
                data.shapes.insert(shape, ren);
            }
        }

        // The loser's users now hold stale references; winner membership
        // first so reshaping can find them
        let data = self
            .eg
            .classes
            .get_mut(&win.id())
            .expect_invariant("Union winner had no data");
        data.users.extend(lose_data.users.iter().cloned());
        self.queue
            .extend(lose_data.users.into_iter().map(Job::Reshape));
    }

    /// Re-key one stored node after its children changed underneath it
    fn process_reshape(&mut self, shape: Shape<F>) {
        let Some(&owner) = self.eg.memo.get(&shape) else {
            // Already re-keyed by an earlier job
            return;
        };

        let ren = self
            .eg
            .data(owner)
            .shapes
            .get(&shape)
            .expect_invariant("Hash-cons entry missing from its class")
            .clone();

        let node = shape.rename(&ren);
        let sc = self
            .eg
            .canonicalize_node(&node)
            .expect_invariant("Stored node failed to canonicalize");

        if *sc.shape() == shape {
            return;
        }

        // Unlink the old key
        self.eg.memo.remove(&shape);
        self.eg
            .classes
            .get_mut(&owner)
            .expect_invariant("Reshape owner vanished")
            .shapes
            .remove(&shape);
        for arg in shape.node().args() {
            let holder = self
                .eg
                .canonicalize(arg.id())
                .expect_invariant("Reshaped node had an invalid child")
                .id();
            self.eg
                .classes
                .get_mut(&holder)
                .expect_invariant("Reshaped child had no data")
                .users
                .remove(&shape);
        }

        let (new_shape, renaming) = sc.into_parts();

        // If the node lost public slots, the owner's parameters must follow
        let new_pub: BTreeSet<Slot> = renaming
            .restrict(&new_shape.node().public_slots())
            .value_set();
        let owner_params = self.eg.data(owner).slots.clone();
        if !owner_params.is_subset(&new_pub) {
            let kept = owner_params
                .intersection(&new_pub)
                .copied()
                .collect::<BTreeSet<_>>();
            self.shrink(owner, kept);
        }
        let owner_params = self.eg.data(owner).slots.clone();

        if let Some(&other) = self.eg.memo.get(&new_shape) {
            // Congruence: the re-keyed node collides with another class
            let other_ren = self
                .eg
                .data(other)
                .shapes
                .get(&new_shape)
                .expect_invariant("Hash-cons entry missing from its class");

            let lhs = EClassCall::new(owner, renaming.restrict_values(&owner_params).inverse());
            let rhs = EClassCall::new(
                other,
                other_ren
                    .restrict_values(&self.eg.data(other).slots)
                    .inverse(),
            );
            self.changed = true;
            self.queue.push_back(Job::Union(lhs, rhs));
        } else {
            self.eg.memo.insert(new_shape.clone(), owner);
            for arg in new_shape.node().args() {
                self.eg
                    .classes
                    .get_mut(&arg.id())
                    .expect_invariant("Reshaped node has a non-canonical child")
                    .users
                    .insert(new_shape.clone());
            }
            self.eg
                .classes
                .get_mut(&owner)
                .expect_invariant("Reshape owner vanished")
                .shapes
                .insert(new_shape, renaming);
        }
    }
}

impl<F: Ord + Clone> EGraph<F> {
    #[cfg(not(any(test, feature = "test")))]
    #[inline]
    fn assert_invariants(&self) { let _ = self; }

    #[cfg(any(test, feature = "test"))]
    fn assert_invariants(&self) {
        assert_eq!(
            self.memo.len(),
            self.classes.values().map(|d| d.shapes.len()).sum::<usize>(),
            "Length mismatch between the hash-cons index and class shape sets"
        );

        for (shape, &id) in &self.memo {
            assert!(
                matches!(self.links[id.id()], Link::Root { .. }),
                "Hash-cons index points at a merged class"
            );
            assert!(
                self.classes[&id].shapes.contains_key(shape),
                "Hash-cons entry missing from its class"
            );
        }

        for (&id, data) in &self.classes {
            assert!(
                matches!(self.links[id.id()], Link::Root { .. }),
                "Class data stored under a merged ID"
            );
            assert!(!data.shapes.is_empty(), "Empty e-class");
            assert_eq!(data.group.slots(), &data.slots, "Group slots drifted");

            for (shape, ren) in &data.shapes {
                let slot_set: BTreeSet<_> = shape.node().slot_occurrences().collect();
                assert_eq!(ren.key_set(), slot_set, "Renaming domain drifted");
                assert!(ren.is_injective(), "Renaming is not injective");
                assert!(
                    data.slots.is_subset(&ren.value_set()),
                    "Parameter slots not covered by a member shape"
                );

                for arg in shape.node().args() {
                    let child = self
                        .classes
                        .get(&arg.id())
                        .expect("Stored shape has a non-canonical child");
                    assert_eq!(
                        arg.args().key_set(),
                        child.slots,
                        "Argument map does not bind exactly the child's parameters"
                    );
                    assert_eq!(
                        &child.group.project(arg.args()),
                        arg.args(),
                        "Argument map is not in canonical coset form"
                    );
                    assert!(
                        child.users.contains(shape),
                        "Child's user index is missing a referencing shape"
                    );
                }
            }

            for user in &data.users {
                let owner = self
                    .memo
                    .get(user)
                    .expect("User index entry missing from the hash-cons index");
                assert!(
                    self.classes[owner].shapes.contains_key(user),
                    "User index entry missing from its owner"
                );
                assert!(
                    user.node().args().iter().any(|a| a.id() == id),
                    "User index entry does not reference the class"
                );
            }
        }
    }
}
