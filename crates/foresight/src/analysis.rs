//! Semilattice analyses: per-class facts maintained across edits

use std::collections::BTreeMap;

use crate::{
    egraph::{EGraph, UnionReport, UnknownEClass},
    node::{EClassId, ENode},
    slot_map::SlotMap,
};

/// A semilattice fact computed over e-nodes
///
/// `join` must be commutative, associative, and idempotent, and `make` must
/// be monotone under union for the fixpoint to be well-defined.  `rename`
/// re-targets a value when the slots it mentions change.
pub trait Analysis<F>: Sync {
    type Value: Clone + PartialEq + Send;

    fn make(&self, node: &ENode<F>, children: &[Self::Value]) -> Self::Value;

    fn join(&self, a: &Self::Value, b: &Self::Value) -> Self::Value;

    fn rename(&self, value: &Self::Value, map: &SlotMap) -> Self::Value;
}

/// Per-class analysis values, refreshed as the saturation loop edits the
/// graph
pub struct AnalysisMap<F, A: Analysis<F>> {
    analysis: A,
    values: BTreeMap<EClassId, A::Value>,
}

impl<F, A: Analysis<F> + std::fmt::Debug> std::fmt::Debug for AnalysisMap<F, A>
where A::Value: std::fmt::Debug
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { analysis, values } = self;
        f.debug_struct("AnalysisMap")
            .field("analysis", analysis)
            .field("values", values)
            .finish()
    }
}

impl<F, A: Analysis<F>> AnalysisMap<F, A> {
    #[must_use]
    pub fn new(analysis: A) -> Self {
        Self {
            analysis,
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    #[inline]
    pub fn analysis(&self) -> &A { &self.analysis }

    #[must_use]
    pub fn get(&self, id: EClassId) -> Option<&A::Value> { self.values.get(&id) }
}

impl<F: Ord + Clone, A: Analysis<F>> AnalysisMap<F, A> {
    fn pass(&mut self, graph: &EGraph<F>) -> Result<bool, UnknownEClass> {
        let mut changed = false;

        for id in graph.classes() {
            let ident = graph.canonicalize(id)?;
            for node in graph.nodes(&ident)? {
                let mut children = Vec::with_capacity(node.args().len());
                let mut ready = true;
                for arg in node.args() {
                    match self.values.get(&graph.canonicalize(arg.id())?.id()) {
                        Some(v) => children.push(self.analysis.rename(v, arg.args())),
                        None => {
                            ready = false;
                            break;
                        },
                    }
                }
                if !ready {
                    continue;
                }

                let made = self.analysis.make(&node, &children);
                let next = match self.values.get(&id) {
                    Some(prev) => self.analysis.join(prev, &made),
                    None => made,
                };

                if self.values.get(&id) != Some(&next) {
                    self.values.insert(id, next);
                    changed = true;
                }
            }
        }

        Ok(changed)
    }

    /// Recompute every class's value from scratch to a fixpoint
    ///
    /// # Errors
    /// Fails when the graph rejects a lookup mid-pass.
    pub fn rebuild(&mut self, graph: &EGraph<F>) -> Result<(), UnknownEClass> {
        self.values.clear();
        while self.pass(graph)? {}
        Ok(())
    }

    /// Fold the values of freshly merged classes into their representatives
    /// and re-run `make` to a fixpoint
    ///
    /// The callback surface the saturation loop invokes after executing a
    /// schedule.
    ///
    /// # Errors
    /// Fails when the graph rejects a lookup mid-pass.
    pub fn refresh(&mut self, graph: &EGraph<F>, report: &UnionReport) -> Result<(), UnknownEClass> {
        for group in &report.groups {
            let mut joined: Option<A::Value> = None;
            let mut root = None;
            for &member in group {
                if let Some(v) = self.values.remove(&member) {
                    joined = Some(match joined {
                        Some(j) => self.analysis.join(&j, &v),
                        None => v,
                    });
                }
                root = Some(graph.canonicalize(member)?.id());
            }

            if let (Some(root), Some(v)) = (root, joined) {
                self.values.insert(root, v);
            }
        }

        while self.pass(graph)? {}
        Ok(())
    }
}
