//! An e-graph paired with a per-rule record of already-applied matches

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use crate::{
    egraph::{AddNodeResult, BatchError, EGraph, UnionReport},
    machine::Match,
    node::{EClassCall, ENode},
    parallel::ParallelMap,
};

/// The per-rule sets of matches a caching strategy has already applied
pub type MatchRecord = BTreeMap<Arc<str>, BTreeSet<Match>>;

/// Wraps a store with a record of applied matches, keeping the record valid
/// across unions
///
/// Additions leave the record untouched; unions re-port every recorded match
/// to the derived graph in parallel, collapsing any that become equal.
/// Matches are stored in their [normalized](Match::normalized) form so
/// re-materialized binders do not defeat the cache.
pub struct RecordedEGraph<F> {
    graph: EGraph<F>,
    record: MatchRecord,
}

impl<F: fmt::Debug> fmt::Debug for RecordedEGraph<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { graph, record } = self;
        f.debug_struct("RecordedEGraph")
            .field("graph", graph)
            .field("record", record)
            .finish()
    }
}

impl<F: Clone> Clone for RecordedEGraph<F> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            record: self.record.clone(),
        }
    }
}

impl<F> RecordedEGraph<F> {
    #[must_use]
    pub fn new(graph: EGraph<F>) -> Self {
        Self {
            graph,
            record: MatchRecord::new(),
        }
    }

    #[must_use]
    pub fn with_record(graph: EGraph<F>, record: MatchRecord) -> Self { Self { graph, record } }

    #[must_use]
    #[inline]
    pub fn graph(&self) -> &EGraph<F> { &self.graph }

    #[must_use]
    #[inline]
    pub fn record(&self) -> &MatchRecord { &self.record }

    #[must_use]
    pub fn into_parts(self) -> (EGraph<F>, MatchRecord) {
        let Self { graph, record } = self;
        (graph, record)
    }

    /// Drop the record, keeping the graph
    #[must_use]
    pub fn emptied(self) -> Self {
        Self {
            graph: self.graph,
            record: MatchRecord::new(),
        }
    }
}

impl<F: Ord + Clone> RecordedEGraph<F> {
    /// Whether this exact match has been applied under the named rule
    ///
    /// The query is canonicalized against the wrapped graph first, so calls
    /// recorded before a union still answer correctly.
    #[must_use]
    pub fn was_applied(&self, rule: &str, m: &Match) -> bool {
        let Ok(ported) = m.port(&self.graph) else {
            return false;
        };
        self.record
            .get(rule)
            .is_some_and(|set| set.contains(&ported.normalized()))
    }

    /// Record matches as applied under the named rule
    pub fn record_applied<I: IntoIterator<Item = Match>>(&mut self, rule: &str, matches: I) {
        let set = self.record.entry(rule.into()).or_default();
        for m in matches {
            if let Ok(ported) = m.port(&self.graph) {
                set.insert(ported.normalized());
            }
        }
    }
}

impl<F: Ord + Clone + Send + Sync> RecordedEGraph<F> {
    /// See [`EGraph::try_add_many`]; the record carries over unchanged
    ///
    /// # Errors
    /// Fails when a child ref is unknown or the operation is canceled.
    pub fn try_add_many(
        &self,
        nodes: &[ENode<F>],
        parallel: &ParallelMap,
    ) -> Result<(Vec<AddNodeResult>, Self), BatchError> {
        let (results, graph) = self.graph.try_add_many(nodes, parallel)?;
        Ok((results, Self {
            graph,
            record: self.record.clone(),
        }))
    }

    /// See [`EGraph::union_many`]; every recorded match is re-ported to the
    /// derived graph in parallel
    ///
    /// # Errors
    /// Fails when a ref is unknown or the operation is canceled.
    pub fn union_many(
        &self,
        pairs: &[(EClassCall, EClassCall)],
        parallel: &ParallelMap,
    ) -> Result<(UnionReport, Self), BatchError> {
        let (report, graph) = self.graph.union_many(pairs, parallel)?;
        let record = port_record(&self.record, &graph, parallel)?;
        Ok((report, Self { graph, record }))
    }
}

/// Re-target a match record at a derived graph, preserving set semantics
///
/// # Errors
/// Fails when a recorded ref is unknown to the target graph or the operation
/// is canceled.
pub fn port_record<F: Ord + Clone + Send + Sync>(
    record: &MatchRecord,
    graph: &EGraph<F>,
    parallel: &ParallelMap,
) -> Result<MatchRecord, BatchError> {
    let mut out = MatchRecord::new();
    for (rule, matches) in record {
        let ported = parallel
            .child("port")
            .try_apply::<_, _, BatchError, _>(matches.iter().collect(), |m| {
                Ok(m.port(graph)?.normalized())
            })?;
        out.insert(Arc::clone(rule), ported.into_iter().collect());
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::RecordedEGraph;
    use crate::{
        egraph::EGraph,
        machine::Match,
        parallel::ParallelMap,
        term::Tree,
    };

    fn leaf_match(g: &mut EGraph<char>, op: char) -> Match {
        let root = g.add_tree(&Tree::leaf(op)).unwrap();
        Match {
            root,
            vars: std::collections::BTreeMap::new(),
            slots: crate::slot_map::SlotMap::new(),
        }
    }

    #[test]
    fn additions_preserve_the_record() {
        let mut g = EGraph::new();
        let m = leaf_match(&mut g, 'a');

        let mut rec = RecordedEGraph::new(g);
        rec.record_applied("r", [m.clone()]);
        assert!(rec.was_applied("r", &m));

        let node = crate::node::ENode::new('b', vec![], vec![], vec![]);
        let (_, rec) = rec
            .try_add_many(&[node], &ParallelMap::sequential())
            .unwrap();
        assert!(rec.was_applied("r", &m));
        assert!(!rec.was_applied("other", &m));
    }

    #[test]
    fn unions_port_recorded_matches() {
        let mut g = EGraph::new();
        let ma = leaf_match(&mut g, 'a');
        let mb = leaf_match(&mut g, 'b');

        let mut rec = RecordedEGraph::new(g);
        rec.record_applied("r", [ma.clone(), mb.clone()]);
        assert_eq!(rec.record()["r"].len(), 2);

        let (report, rec) = rec
            .union_many(
                &[(ma.root.clone(), mb.root.clone())],
                &ParallelMap::sequential(),
            )
            .unwrap();
        assert!(report.changed);

        // Both matches now canonicalize to the surviving class and collapse
        assert_eq!(rec.record()["r"].len(), 1);
        assert!(rec.was_applied("r", &ma));
        assert!(rec.was_applied("r", &mb));
    }

    #[test]
    fn emptied_drops_the_record() {
        let mut g = EGraph::new();
        let m = leaf_match(&mut g, 'a');

        let mut rec = RecordedEGraph::new(g);
        rec.record_applied("r", [m.clone()]);
        let rec = rec.emptied();
        assert!(!rec.was_applied("r", &m));
    }
}
