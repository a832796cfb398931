//! Staged, replayable edit plans over an e-graph

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    egraph::{BatchError, EGraph, UnknownEClass},
    node::{EClassCall, ENode},
    parallel::{Canceled, ParallelMap},
    slot::Slot,
};

/// A class reference in a plan: either a concrete call or a placeholder for
/// the result of an earlier addition in the same schedule
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EClassSymbol {
    Real(EClassCall),
    Virtual(usize),
}

/// A planned e-node whose children may be unresolved symbols
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolNode<F> {
    pub op: F,
    pub defs: Vec<Slot>,
    pub uses: Vec<Slot>,
    pub args: Vec<EClassSymbol>,
}

impl<F> SymbolNode<F> {
    #[must_use]
    pub fn new(op: F, defs: Vec<Slot>, uses: Vec<Slot>, args: Vec<EClassSymbol>) -> Self {
        Self {
            op,
            defs,
            uses,
            args,
        }
    }
}

impl<F: Clone> SymbolNode<F> {
    fn remap(&self, alias: &[usize]) -> Self {
        Self {
            op: self.op.clone(),
            defs: self.defs.clone(),
            uses: self.uses.clone(),
            args: self
                .args
                .iter()
                .map(|s| match s {
                    EClassSymbol::Real(c) => EClassSymbol::Real(c.clone()),
                    EClassSymbol::Virtual(v) => EClassSymbol::Virtual(alias[*v]),
                })
                .collect(),
        }
    }

    fn offset(&self, by: usize) -> Self {
        Self {
            op: self.op.clone(),
            defs: self.defs.clone(),
            uses: self.uses.clone(),
            args: self
                .args
                .iter()
                .map(|s| match s {
                    EClassSymbol::Real(c) => EClassSymbol::Real(c.clone()),
                    EClassSymbol::Virtual(v) => EClassSymbol::Virtual(v + by),
                })
                .collect(),
        }
    }

    fn reify(&self, table: &[Option<EClassCall>]) -> Result<ENode<F>, CommandError> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            args.push(reify_symbol(arg, table)?);
        }
        Ok(ENode::new(
            self.op.clone(),
            self.defs.clone(),
            self.uses.clone(),
            args,
        ))
    }
}

fn reify_symbol(
    sym: &EClassSymbol,
    table: &[Option<EClassCall>],
) -> Result<EClassCall, CommandError> {
    match sym {
        EClassSymbol::Real(c) => Ok(c.clone()),
        EClassSymbol::Virtual(v) => table
            .get(*v)
            .and_then(Clone::clone)
            .ok_or(CommandError::UnresolvedVirtual(*v)),
    }
}

/// Failure while executing a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    UnknownEClass(#[from] UnknownEClass),
    #[error(transparent)]
    Canceled(#[from] Canceled),
    /// A node referenced a virtual symbol no earlier batch produced
    #[error("virtual symbol #{0} was never resolved")]
    UnresolvedVirtual(usize),
}

impl From<BatchError> for CommandError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::UnknownEClass(e) => Self::UnknownEClass(e),
            BatchError::Canceled(e) => Self::Canceled(e),
        }
    }
}

/// A staged description of additions and unions to apply to a graph
///
/// Addition batches run in order; a batch may reference virtual symbols
/// produced by any earlier batch.  Unions run after every addition.
pub struct CommandSchedule<F> {
    batches: Vec<Vec<(SymbolNode<F>, usize)>>,
    unions: Vec<(EClassSymbol, EClassSymbol)>,
    virtuals: usize,
}

impl<F: std::fmt::Debug> std::fmt::Debug for CommandSchedule<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            batches,
            unions,
            virtuals,
        } = self;
        f.debug_struct("CommandSchedule")
            .field("batches", batches)
            .field("unions", unions)
            .field("virtuals", virtuals)
            .finish()
    }
}

impl<F: Clone> Clone for CommandSchedule<F> {
    fn clone(&self) -> Self {
        Self {
            batches: self.batches.clone(),
            unions: self.unions.clone(),
            virtuals: self.virtuals,
        }
    }
}

impl<F> Default for CommandSchedule<F> {
    #[inline]
    fn default() -> Self { Self::new() }
}

impl<F> CommandSchedule<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            unions: Vec::new(),
            virtuals: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(Vec::is_empty) && self.unions.is_empty()
    }

    /// The number of addition batches
    #[must_use]
    #[inline]
    pub fn batch_count(&self) -> usize { self.batches.len() }

    #[must_use]
    #[inline]
    pub fn union_count(&self) -> usize { self.unions.len() }

    /// Plan a node addition in the given batch, returning the virtual symbol
    /// naming its class
    pub fn push_node(&mut self, batch: usize, node: SymbolNode<F>) -> EClassSymbol {
        while self.batches.len() <= batch {
            self.batches.push(Vec::new());
        }

        let out = self.virtuals;
        self.virtuals += 1;
        self.batches[batch].push((node, out));
        EClassSymbol::Virtual(out)
    }

    /// Plan a union of two symbols
    pub fn push_union(&mut self, a: EClassSymbol, b: EClassSymbol) { self.unions.push((a, b)); }
}

impl<F: Ord + Clone> CommandSchedule<F> {
    /// Concatenate two schedules; the other's batches are zipped in by index
    /// so independent data flows keep their depth
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        let by = self.virtuals;
        let Self {
            batches,
            unions,
            virtuals,
        } = other;

        for (i, batch) in batches.into_iter().enumerate() {
            while self.batches.len() <= i {
                self.batches.push(Vec::new());
            }
            self.batches[i]
                .extend(batch.into_iter().map(|(n, out)| (n.offset(by), out + by)));
        }

        self.unions.extend(unions.into_iter().map(|(a, b)| {
            let off = |s: EClassSymbol| match s {
                EClassSymbol::Real(c) => EClassSymbol::Real(c),
                EClassSymbol::Virtual(v) => EClassSymbol::Virtual(v + by),
            };
            (off(a), off(b))
        }));
        self.virtuals += virtuals;
        self
    }

    /// Re-plan the schedule: duplicate additions collapse to one symbol,
    /// every addition moves to the earliest batch its virtual data-flow
    /// allows, and union pairs are deduplicated
    #[must_use]
    pub fn optimized(&self) -> Self {
        let mut alias: Vec<usize> = (0..self.virtuals).collect();
        let mut depth_of: BTreeMap<usize, usize> = BTreeMap::new();
        let mut seen: BTreeMap<SymbolNode<F>, usize> = BTreeMap::new();
        let mut batches: Vec<Vec<(SymbolNode<F>, usize)>> = Vec::new();

        for batch in &self.batches {
            for (node, out) in batch {
                let node = node.remap(&alias);

                if let Some(&rep) = seen.get(&node) {
                    alias[*out] = rep;
                    continue;
                }

                let depth = node
                    .args
                    .iter()
                    .filter_map(|s| match s {
                        EClassSymbol::Real(_) => None,
                        EClassSymbol::Virtual(v) => Some(
                            depth_of
                                .get(v)
                                .unwrap_or_else(|| {
                                    panic!("virtual symbol #{v} used before production")
                                })
                                + 1,
                        ),
                    })
                    .max()
                    .unwrap_or(0);

                while batches.len() <= depth {
                    batches.push(Vec::new());
                }
                batches[depth].push((node.clone(), *out));
                depth_of.insert(*out, depth);
                seen.insert(node, *out);
            }
        }

        let remap = |s: &EClassSymbol| match s {
            EClassSymbol::Real(c) => EClassSymbol::Real(c.clone()),
            EClassSymbol::Virtual(v) => EClassSymbol::Virtual(alias[*v]),
        };
        let unions: BTreeSet<_> = self
            .unions
            .iter()
            .map(|(a, b)| {
                let (a, b) = (remap(a), remap(b));
                if b < a { (b, a) } else { (a, b) }
            })
            .filter(|(a, b)| a != b)
            .collect();

        Self {
            batches,
            unions: unions.into_iter().collect(),
            virtuals: self.virtuals,
        }
    }
}

impl<F: Ord + Clone + Send + Sync> CommandSchedule<F> {
    /// Apply the schedule to a graph, returning the new snapshot and whether
    /// anything changed
    ///
    /// # Errors
    /// Fails on unknown refs, on virtual symbols no batch produced, or on
    /// cancellation.
    pub fn execute(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<(EGraph<F>, bool), CommandError> {
        let mut graph = graph.clone();
        let mut table: Vec<Option<EClassCall>> = vec![None; self.virtuals];
        let mut changed = false;

        for batch in &self.batches {
            let nodes = batch
                .iter()
                .map(|(n, _)| n.reify(&table))
                .collect::<Result<Vec<_>, _>>()?;

            let (results, next) = graph.try_add_many(&nodes, parallel)?;
            graph = next;

            for ((_, out), result) in batch.iter().zip(results) {
                changed |= result.is_added();
                table[*out] = Some(result.into_call());
            }
        }

        let mut pairs = Vec::new();
        for (a, b) in &self.unions {
            let a = reify_symbol(a, &table)?;
            let b = reify_symbol(b, &table)?;
            if graph.are_same(&a, &b)? {
                continue;
            }
            pairs.push((a, b));
        }

        if !pairs.is_empty() {
            let (report, next) = graph.union_many(&pairs, parallel)?;
            changed |= report.changed;
            graph = next;
        }

        Ok((graph, changed))
    }
}

#[cfg(test)]
mod test {
    use super::{CommandSchedule, EClassSymbol, SymbolNode};
    use crate::{egraph::EGraph, parallel::ParallelMap, term::Tree};

    type Schedule = CommandSchedule<char>;

    fn leaf(op: char) -> SymbolNode<char> { SymbolNode::new(op, vec![], vec![], vec![]) }

    fn app(op: char, args: Vec<EClassSymbol>) -> SymbolNode<char> {
        SymbolNode::new(op, vec![], vec![], args)
    }

    #[test]
    fn virtual_data_flow_reifies() {
        let mut sched = Schedule::new();
        let a = sched.push_node(0, leaf('a'));
        let b = sched.push_node(0, leaf('b'));
        let _f = sched.push_node(1, app('f', vec![a, b]));

        let g = EGraph::new();
        let (g, changed) = sched.execute(&g, &ParallelMap::sequential()).unwrap();
        assert!(changed);
        assert_eq!(g.class_count(), 3);

        let t = Tree::new('f', vec![], vec![], vec![Tree::leaf('a'), Tree::leaf('b')]);
        assert!(g.contains(&t.into()).unwrap());
    }

    #[test]
    fn executing_twice_changes_nothing() {
        let mut sched = Schedule::new();
        let a = sched.push_node(0, leaf('a'));
        let b = sched.push_node(0, leaf('b'));
        sched.push_union(a, b);

        let g = EGraph::new();
        let (g, changed) = sched.execute(&g, &ParallelMap::sequential()).unwrap();
        assert!(changed);
        assert_eq!(g.class_count(), 1);

        let (g2, changed) = sched.execute(&g, &ParallelMap::sequential()).unwrap();
        assert!(!changed);
        assert_eq!(g2.class_count(), 1);
    }

    #[test]
    fn optimized_dedupes_additions_and_unions() {
        let left = {
            let mut s = Schedule::new();
            let a = s.push_node(0, leaf('a'));
            let f = s.push_node(1, app('f', vec![a.clone()]));
            s.push_union(a, f);
            s
        };
        let right = {
            let mut s = Schedule::new();
            let a = s.push_node(0, leaf('a'));
            let f = s.push_node(1, app('f', vec![a.clone()]));
            s.push_union(f, a);
            s
        };

        let merged = left.merge(right);
        assert_eq!(merged.union_count(), 2);

        let opt = merged.optimized();
        // Identical additions collapse, and the flipped union pair dedupes
        assert_eq!(opt.union_count(), 1);
        assert_eq!(
            opt.batches.iter().map(Vec::len).sum::<usize>(),
            2,
            "duplicate nodes were not coalesced"
        );
    }

    #[test]
    fn optimized_preserves_execution() {
        let mut sched = Schedule::new();
        let a = sched.push_node(0, leaf('a'));
        // Planned too late on purpose: depends only on batch 0
        let f = sched.push_node(3, app('f', vec![a.clone()]));
        sched.push_union(a, f);

        let opt = sched.optimized();
        assert_eq!(opt.batch_count(), 2);

        let g = EGraph::new();
        let (g1, _) = sched.execute(&g, &ParallelMap::sequential()).unwrap();
        let (g2, _) = opt.execute(&g, &ParallelMap::sequential()).unwrap();
        assert_eq!(g1.class_count(), g2.class_count());
    }
}
