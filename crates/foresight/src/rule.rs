//! Searchers, appliers, and the rules that bundle them

use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    command::{CommandSchedule, EClassSymbol, SymbolNode},
    egraph::{EGraph, UnknownEClass},
    machine::{self, Match},
    parallel::{Canceled, ParallelMap},
    pattern::{CompiledPattern, Pattern, PatternVar},
    slot::Slot,
    slot_map::SlotMap,
    strategy::SaturationError,
};

/// Failure while turning a match into a command schedule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    UnknownEClass(#[from] UnknownEClass),
    /// The template referenced a variable the searcher never bound
    #[error("pattern variable {0} is unbound in this match")]
    UnboundVar(PatternVar),
}

/// An applier failure wrapped with the rule it happened in
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("error applying rule {name}")]
pub struct RuleError {
    name: Arc<str>,
    source: ApplyError,
}

impl RuleError {
    #[must_use]
    pub fn new(name: Arc<str>, source: ApplyError) -> Self { Self { name, source } }

    #[must_use]
    #[inline]
    pub fn rule_name(&self) -> &str { &self.name }
}

/// Enumerates matches over an e-graph
///
/// `for_each` is the CPS form used by combinators; `search` collects, with
/// root classes scheduled through the parallel map where the implementation
/// supports it.
pub trait Searcher<F>: Sync {
    type Match: Send + Sync;

    /// Enumerate matches; return false from the callback to stop early
    fn for_each(&self, graph: &EGraph<F>, k: &mut dyn FnMut(Self::Match) -> bool) -> bool;

    /// Collect every match
    ///
    /// # Errors
    /// Returns [`Canceled`] if the parallel map's token trips.
    fn search(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<Vec<Self::Match>, Canceled> {
        let _ = parallel;
        let mut out = Vec::new();
        self.for_each(graph, &mut |m| {
            out.push(m);
            true
        });
        Ok(out)
    }

    /// Keep only the matches satisfying `pred`
    fn filter<P: Fn(&Self::Match) -> bool + Sync>(self, pred: P) -> FilterSearcher<Self, P>
    where Self: Sized {
        FilterSearcher { inner: self, pred }
    }

    /// Transform every match
    fn map<T: Send + Sync, M: Fn(Self::Match) -> T + Sync>(self, f: M) -> MapSearcher<Self, T, M>
    where Self: Sized {
        MapSearcher {
            inner: self,
            f,
            _out: PhantomData,
        }
    }

    /// Expand every match into any number of matches
    fn flat_map<T: Send + Sync, M: Fn(Self::Match) -> Vec<T> + Sync>(
        self,
        f: M,
    ) -> FlatMapSearcher<Self, T, M>
    where
        Self: Sized,
    {
        FlatMapSearcher {
            inner: self,
            f,
            _out: PhantomData,
        }
    }
}

/// Searches a compiled pattern at every canonical class
pub struct PatternSearcher<F> {
    pattern: CompiledPattern<F>,
}

impl<F: fmt::Debug> fmt::Debug for PatternSearcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { pattern } = self;
        f.debug_tuple("PatternSearcher").field(pattern).finish()
    }
}

impl<F: Clone> Clone for PatternSearcher<F> {
    fn clone(&self) -> Self {
        Self {
            pattern: self.pattern.clone(),
        }
    }
}

impl<F: Clone> PatternSearcher<F> {
    #[must_use]
    pub fn new(pattern: &Pattern<F>) -> Self {
        Self {
            pattern: pattern.compile(),
        }
    }

    #[must_use]
    #[inline]
    pub fn pattern(&self) -> &CompiledPattern<F> { &self.pattern }
}

impl<F: Ord + Clone + Send + Sync + 'static> Searcher<F> for PatternSearcher<F> {
    type Match = Match;

    fn for_each(&self, graph: &EGraph<F>, k: &mut dyn FnMut(Match) -> bool) -> bool {
        for id in graph.classes() {
            let root = graph.canonicalize(id).unwrap_or_else(|_| unreachable!());
            let keep = machine::run(graph, &self.pattern, &root, &mut |m| k(m.clone()))
                .unwrap_or_else(|_| unreachable!());
            if !keep {
                return false;
            }
        }
        true
    }

    fn search(&self, graph: &EGraph<F>, parallel: &ParallelMap) -> Result<Vec<Match>, Canceled> {
        let roots: Vec<_> = graph.classes().collect();
        let per_class = parallel.child("search").apply(roots, |id| {
            let root = graph.canonicalize(id).unwrap_or_else(|_| unreachable!());
            self.pattern
                .search(&root, graph)
                .unwrap_or_else(|_| unreachable!())
        })?;

        Ok(per_class.into_iter().flatten().collect())
    }
}

#[derive(Debug, Clone)]
pub struct FilterSearcher<S, P> {
    inner: S,
    pred: P,
}

impl<F, S: Searcher<F>, P: Fn(&S::Match) -> bool + Sync> Searcher<F> for FilterSearcher<S, P> {
    type Match = S::Match;

    fn for_each(&self, graph: &EGraph<F>, k: &mut dyn FnMut(S::Match) -> bool) -> bool {
        self.inner
            .for_each(graph, &mut |m| if (self.pred)(&m) { k(m) } else { true })
    }

    fn search(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<Vec<S::Match>, Canceled> {
        Ok(self
            .inner
            .search(graph, parallel)?
            .into_iter()
            .filter(|m| (self.pred)(m))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct MapSearcher<S, T, M> {
    inner: S,
    f: M,
    _out: PhantomData<fn() -> T>,
}

impl<F, S: Searcher<F>, T: Send + Sync, M: Fn(S::Match) -> T + Sync> Searcher<F>
    for MapSearcher<S, T, M>
{
    type Match = T;

    fn for_each(&self, graph: &EGraph<F>, k: &mut dyn FnMut(T) -> bool) -> bool {
        self.inner.for_each(graph, &mut |m| k((self.f)(m)))
    }

    fn search(&self, graph: &EGraph<F>, parallel: &ParallelMap) -> Result<Vec<T>, Canceled> {
        Ok(self
            .inner
            .search(graph, parallel)?
            .into_iter()
            .map(&self.f)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct FlatMapSearcher<S, T, M> {
    inner: S,
    f: M,
    _out: PhantomData<fn() -> T>,
}

impl<F, S: Searcher<F>, T: Send + Sync, M: Fn(S::Match) -> Vec<T> + Sync> Searcher<F>
    for FlatMapSearcher<S, T, M>
{
    type Match = T;

    fn for_each(&self, graph: &EGraph<F>, k: &mut dyn FnMut(T) -> bool) -> bool {
        self.inner.for_each(graph, &mut |m| {
            for t in (self.f)(m) {
                if !k(t) {
                    return false;
                }
            }
            true
        })
    }

    fn search(&self, graph: &EGraph<F>, parallel: &ParallelMap) -> Result<Vec<T>, Canceled> {
        Ok(self
            .inner
            .search(graph, parallel)?
            .into_iter()
            .flat_map(&self.f)
            .collect())
    }
}

/// Turns one match into a schedule fragment
///
/// Appliers run concurrently over distinct matches of one snapshot, hence
/// the `Sync` bound.
pub trait Applier<F>: Sync {
    type Match;

    /// Build the commands realizing this match
    ///
    /// # Errors
    /// Fails when the match does not carry the bindings the applier needs.
    fn schedule(
        &self,
        m: &Self::Match,
        graph: &EGraph<F>,
    ) -> Result<CommandSchedule<F>, ApplyError>;

    /// Produce an empty schedule for matches failing `pred`
    fn filter<P: Fn(&Self::Match) -> bool + Sync>(self, pred: P) -> FilterApplier<Self, P>
    where Self: Sized {
        FilterApplier { inner: self, pred }
    }

    /// Adapt the incoming match type
    fn map<T, M: Fn(&T) -> Self::Match + Sync>(self, f: M) -> MapApplier<Self, T, M>
    where Self: Sized {
        MapApplier {
            inner: self,
            f,
            _in: PhantomData,
        }
    }

    /// Expand one match into many before scheduling
    fn flat_map<T, M: Fn(&T) -> Vec<Self::Match> + Sync>(self, f: M) -> FlatMapApplier<Self, T, M>
    where Self: Sized {
        FlatMapApplier {
            inner: self,
            f,
            _in: PhantomData,
        }
    }
}

/// Instantiates a right-hand-side template for every match
///
/// Additions are planned in depth layers over virtual symbols, definition
/// binders get fresh slots, and the instantiated root is unioned with the
/// matched root.
pub struct TemplateApplier<F> {
    template: Pattern<F>,
}

impl<F: fmt::Debug> fmt::Debug for TemplateApplier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { template } = self;
        f.debug_tuple("TemplateApplier").field(template).finish()
    }
}

impl<F: Clone> Clone for TemplateApplier<F> {
    fn clone(&self) -> Self {
        Self {
            template: self.template.clone(),
        }
    }
}

impl<F> TemplateApplier<F> {
    #[must_use]
    pub fn new(template: Pattern<F>) -> Self { Self { template } }

    #[must_use]
    #[inline]
    pub fn template(&self) -> &Pattern<F> { &self.template }
}

fn resolve_slot(slot: Slot, m: &Match, bound: &mut SlotMap) -> Slot {
    if let Some(a) = bound.get(slot) {
        a
    } else if let Some(a) = m.slots.get(slot) {
        a
    } else {
        let fresh = Slot::fresh();
        bound.insert(slot, fresh);
        fresh
    }
}

fn instantiate<F: Clone>(
    pat: &Pattern<F>,
    m: &Match,
    sched: &mut CommandSchedule<F>,
    bound: &mut SlotMap,
) -> Result<(EClassSymbol, usize), ApplyError> {
    match pat {
        Pattern::Var(v) => m
            .vars
            .get(v)
            .map(|c| (EClassSymbol::Real(c.clone()), 0))
            .ok_or_else(|| ApplyError::UnboundVar(v.clone())),
        Pattern::Node {
            op,
            defs,
            uses,
            children,
        } => {
            let mut kids = Vec::with_capacity(children.len());
            let mut batch = 0;
            for child in children {
                let (sym, depth) = instantiate(child, m, sched, bound)?;
                if matches!(sym, EClassSymbol::Virtual(_)) {
                    batch = batch.max(depth + 1);
                }
                kids.push(sym);
            }

            let node = SymbolNode::new(
                op.clone(),
                defs.iter().map(|&s| resolve_slot(s, m, bound)).collect(),
                uses.iter().map(|&s| resolve_slot(s, m, bound)).collect(),
                kids,
            );
            Ok((sched.push_node(batch, node), batch))
        },
    }
}

impl<F: Ord + Clone + Send + Sync> Applier<F> for TemplateApplier<F> {
    type Match = Match;

    fn schedule(&self, m: &Match, _graph: &EGraph<F>) -> Result<CommandSchedule<F>, ApplyError> {
        let mut sched = CommandSchedule::new();
        let mut bound = SlotMap::new();

        let (root, _) = instantiate(&self.template, m, &mut sched, &mut bound)?;
        sched.push_union(root, EClassSymbol::Real(m.root.clone()));
        Ok(sched)
    }
}

#[derive(Debug, Clone)]
pub struct FilterApplier<A, P> {
    inner: A,
    pred: P,
}

impl<F, A: Applier<F>, P: Fn(&A::Match) -> bool + Sync> Applier<F> for FilterApplier<A, P> {
    type Match = A::Match;

    fn schedule(
        &self,
        m: &Self::Match,
        graph: &EGraph<F>,
    ) -> Result<CommandSchedule<F>, ApplyError> {
        if (self.pred)(m) {
            self.inner.schedule(m, graph)
        } else {
            Ok(CommandSchedule::new())
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapApplier<A, T, M> {
    inner: A,
    f: M,
    _in: PhantomData<fn(&T)>,
}

impl<F, A: Applier<F>, T, M: Fn(&T) -> A::Match + Sync> Applier<F> for MapApplier<A, T, M> {
    type Match = T;

    fn schedule(&self, m: &T, graph: &EGraph<F>) -> Result<CommandSchedule<F>, ApplyError> {
        self.inner.schedule(&(self.f)(m), graph)
    }
}

#[derive(Debug, Clone)]
pub struct FlatMapApplier<A, T, M> {
    inner: A,
    f: M,
    _in: PhantomData<fn(&T)>,
}

impl<F: Ord + Clone, A: Applier<F>, T, M: Fn(&T) -> Vec<A::Match> + Sync> Applier<F>
    for FlatMapApplier<A, T, M>
{
    type Match = T;

    fn schedule(&self, m: &T, graph: &EGraph<F>) -> Result<CommandSchedule<F>, ApplyError> {
        let mut out = CommandSchedule::new();
        for inner_match in (self.f)(m) {
            out = out.merge(self.inner.schedule(&inner_match, graph)?);
        }
        Ok(out)
    }
}

/// A named searcher/applier bundle
pub struct Rule<S, A> {
    name: Arc<str>,
    searcher: S,
    applier: A,
}

impl<S: fmt::Debug, A: fmt::Debug> fmt::Debug for Rule<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            name,
            searcher,
            applier,
        } = self;
        f.debug_struct("Rule")
            .field("name", name)
            .field("searcher", searcher)
            .field("applier", applier)
            .finish()
    }
}

impl<S: Clone, A: Clone> Clone for Rule<S, A> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            searcher: self.searcher.clone(),
            applier: self.applier.clone(),
        }
    }
}

impl<S, A> Rule<S, A> {
    #[must_use]
    pub fn new(name: &str, searcher: S, applier: A) -> Self {
        Self {
            name: name.into(),
            searcher,
            applier,
        }
    }

    #[must_use]
    #[inline]
    pub fn name(&self) -> &str { &self.name }

    #[must_use]
    #[inline]
    pub fn searcher(&self) -> &S { &self.searcher }

    #[must_use]
    #[inline]
    pub fn applier(&self) -> &A { &self.applier }
}

impl<S, A> Rule<S, A> {
    /// Build the schedules for the given matches and merge them into one
    /// optimized command
    ///
    /// # Errors
    /// Wraps applier failures with this rule's name; propagates cancellation.
    pub fn schedule_for<F>(
        &self,
        matches: &[S::Match],
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<CommandSchedule<F>, SaturationError>
    where
        F: Ord + Clone + Send + Sync + 'static,
        S: Searcher<F>,
        A: Applier<F, Match = S::Match>,
    {
        let schedules =
            parallel
                .child(&self.name)
                .try_apply::<_, _, SaturationError, _>(matches.iter().collect(), |m| {
                    self.applier
                        .schedule(m, graph)
                        .map_err(|source| RuleError::new(Arc::clone(&self.name), source).into())
                })?;

        Ok(schedules
            .into_iter()
            .fold(CommandSchedule::new(), CommandSchedule::merge)
            .optimized())
    }

    /// One optimized command representing "apply every current match"
    ///
    /// # Errors
    /// Wraps applier failures with this rule's name; propagates cancellation.
    pub fn delayed<F>(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<CommandSchedule<F>, SaturationError>
    where
        F: Ord + Clone + Send + Sync + 'static,
        S: Searcher<F>,
        A: Applier<F, Match = S::Match>,
    {
        let matches = self.searcher.search(graph, parallel)?;
        self.schedule_for(&matches, graph, parallel)
    }

    /// Search and apply in one step, returning the new graph when anything
    /// changed
    ///
    /// # Errors
    /// Wraps applier failures with this rule's name; propagates cancellation.
    pub fn apply<F>(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<Option<EGraph<F>>, SaturationError>
    where
        F: Ord + Clone + Send + Sync + 'static,
        S: Searcher<F>,
        A: Applier<F, Match = S::Match>,
    {
        let sched = self.delayed(graph, parallel)?;
        if sched.is_empty() {
            return Ok(None);
        }

        let (next, changed) = sched.execute(graph, parallel)?;
        Ok(changed.then_some(next))
    }
}

/// A left-to-right pattern rewrite
///
/// The workhorse rule form: a compiled pattern searcher over the left-hand
/// side and a template applier for the right-hand side.
pub struct Rewrite<F> {
    lhs: Pattern<F>,
    rhs: Pattern<F>,
    rule: Rule<PatternSearcher<F>, TemplateApplier<F>>,
}

impl<F: fmt::Debug> fmt::Debug for Rewrite<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { lhs, rhs, rule } = self;
        f.debug_struct("Rewrite")
            .field("name", &rule.name())
            .field("lhs", lhs)
            .field("rhs", rhs)
            .finish()
    }
}

impl<F: Clone> Clone for Rewrite<F> {
    fn clone(&self) -> Self {
        Self {
            lhs: self.lhs.clone(),
            rhs: self.rhs.clone(),
            rule: self.rule.clone(),
        }
    }
}

impl<F: Ord + Clone + Send + Sync + 'static> Rewrite<F> {
    #[must_use]
    pub fn new(name: &str, lhs: Pattern<F>, rhs: Pattern<F>) -> Self {
        let rule = Rule::new(name, PatternSearcher::new(&lhs), TemplateApplier::new(rhs.clone()));
        Self { lhs, rhs, rule }
    }

    #[must_use]
    #[inline]
    pub fn name(&self) -> &str { self.rule.name() }

    #[must_use]
    #[inline]
    pub fn lhs(&self) -> &Pattern<F> { &self.lhs }

    #[must_use]
    #[inline]
    pub fn rhs(&self) -> &Pattern<F> { &self.rhs }

    /// The right-to-left version of this rewrite, when the two sides bind
    /// the same variables and slots
    #[must_use]
    pub fn try_reverse(&self) -> Option<Self> {
        let vars_match = {
            let l: std::collections::BTreeSet<_> = self.lhs.vars().into_iter().collect();
            let r: std::collections::BTreeSet<_> = self.rhs.vars().into_iter().collect();
            l == r
        };

        (vars_match && self.lhs.slots() == self.rhs.slots()).then(|| {
            Self::new(
                &format!("{}-rev", self.name()),
                self.rhs.clone(),
                self.lhs.clone(),
            )
        })
    }

    /// Collect the current matches of the left-hand side
    ///
    /// # Errors
    /// Returns [`Canceled`] if the parallel map's token trips.
    pub fn matches(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<Vec<Match>, Canceled> {
        self.rule.searcher().search(graph, parallel)
    }

    /// See [`Rule::schedule_for`]
    ///
    /// # Errors
    /// Wraps applier failures with this rule's name; propagates cancellation.
    pub fn schedule_for(
        &self,
        matches: &[Match],
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<CommandSchedule<F>, SaturationError> {
        self.rule.schedule_for(matches, graph, parallel)
    }

    /// See [`Rule::delayed`]
    ///
    /// # Errors
    /// Wraps applier failures with this rule's name; propagates cancellation.
    pub fn delayed(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<CommandSchedule<F>, SaturationError> {
        self.rule.delayed(graph, parallel)
    }

    /// See [`Rule::apply`]
    ///
    /// # Errors
    /// Wraps applier failures with this rule's name; propagates cancellation.
    pub fn apply(
        &self,
        graph: &EGraph<F>,
        parallel: &ParallelMap,
    ) -> Result<Option<EGraph<F>>, SaturationError> {
        self.rule.apply(graph, parallel)
    }
}

#[cfg(test)]
mod test {
    use super::{Applier, Rewrite, Searcher};
    use crate::{egraph::EGraph, parallel::ParallelMap, pattern::Pattern, term::Tree};

    type Graph = EGraph<char>;

    fn add_tree(g: &mut Graph, t: &Tree<char>) -> crate::node::EClassCall {
        g.add_tree(t).unwrap()
    }

    fn f_of(op: char, children: Vec<Tree<char>>) -> Tree<char> {
        Tree::new(op, vec![], vec![], children)
    }

    #[test]
    fn commutativity_unions_both_orders() {
        let mut g = Graph::new();
        let ab = add_tree(&mut g, &f_of('+', vec![Tree::leaf('a'), Tree::leaf('b')]));
        let ba = add_tree(&mut g, &f_of('+', vec![Tree::leaf('b'), Tree::leaf('a')]));
        assert!(!g.are_same(&ab, &ba).unwrap());

        let comm = Rewrite::new(
            "comm-add",
            Pattern::node('+', vec![], vec![], vec![Pattern::var("x"), Pattern::var("y")]),
            Pattern::node('+', vec![], vec![], vec![Pattern::var("y"), Pattern::var("x")]),
        );

        let par = ParallelMap::sequential();
        let g = comm.apply(&g, &par).unwrap().expect("rule should fire");
        assert!(g.are_same(&ab, &ba).unwrap());
    }

    #[test]
    fn reverse_swaps_sides() {
        let rw = Rewrite::new(
            "assoc",
            Pattern::node('+', vec![], vec![], vec![
                Pattern::node('+', vec![], vec![], vec![Pattern::var("a"), Pattern::var("b")]),
                Pattern::var("c"),
            ]),
            Pattern::node('+', vec![], vec![], vec![
                Pattern::var("a"),
                Pattern::node('+', vec![], vec![], vec![Pattern::var("b"), Pattern::var("c")]),
            ]),
        );

        let rev = rw.try_reverse().expect("associativity is reversible");
        assert_eq!(rev.lhs(), rw.rhs());
        assert_eq!(rev.rhs(), rw.lhs());
    }

    #[test]
    fn irreversible_when_vars_differ() {
        // x * 0 -> 0 drops x
        let rw = Rewrite::new(
            "mul-zero",
            Pattern::node('*', vec![], vec![], vec![Pattern::var("x"), Pattern::leaf('0')]),
            Pattern::leaf('0'),
        );
        assert!(rw.try_reverse().is_none());
    }

    #[test]
    fn searcher_combinators_compose() {
        let mut g = Graph::new();
        add_tree(&mut g, &f_of('f', vec![Tree::leaf('a')]));
        add_tree(&mut g, &f_of('f', vec![Tree::leaf('b')]));

        let searcher =
            crate::rule::PatternSearcher::new(&Pattern::node('f', vec![], vec![], vec![
                Pattern::var("x"),
            ]));

        let all = searcher
            .clone()
            .search(&g, &ParallelMap::sequential())
            .unwrap();
        assert_eq!(all.len(), 2);

        let a = g.find_tree(&Tree::leaf('a').into()).unwrap().unwrap();
        let filtered = searcher
            .filter(move |m| m.vars.values().next() == Some(&a))
            .search(&g, &ParallelMap::sequential())
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn applier_filter_yields_empty_schedule() {
        let mut g = Graph::new();
        let root = add_tree(&mut g, &f_of('f', vec![Tree::leaf('a')]));

        let template = crate::rule::TemplateApplier::new(Pattern::leaf('z'));
        let applier = template.filter(|_| false);

        let m = crate::machine::Match {
            root,
            vars: std::collections::BTreeMap::new(),
            slots: crate::slot_map::SlotMap::new(),
        };
        let sched = applier.schedule(&m, &g).unwrap();
        assert!(sched.is_empty());
    }
}
