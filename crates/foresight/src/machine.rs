//! The register machine that executes compiled patterns over an e-graph

use std::{collections::BTreeMap, fmt};

use crate::{
    egraph::{EGraph, UnknownEClass},
    node::{EClassCall, ENode},
    pattern::{CompiledPattern, EffectSummary, Insn, PatternVar},
    slot::Slot,
    slot_map::SlotMap,
};

/// Why a branch of the machine was pruned
///
/// Pruning is silent during normal enumeration; these surface only through
/// [`first_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    /// No node of the class survived the bind filters and slot bindings
    #[error("no node matched the pattern at register {reg}")]
    NoMatchingNode { reg: usize },
    /// Two registers bound to the same variable disagreed
    #[error("registers {reg} and {with} bound inconsistent classes")]
    InconsistentVars { reg: usize, with: usize },
}

/// A successful pattern match: the root it was found at, plus the variable
/// and slot bindings
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Match {
    pub root: EClassCall,
    pub vars: BTreeMap<PatternVar, EClassCall>,
    pub slots: SlotMap,
}

struct Machine<F> {
    regs: Vec<EClassCall>,
    vars: BTreeMap<PatternVar, EClassCall>,
    slots: SlotMap,
    nodes: Vec<ENode<F>>,
    error: Option<MachineError>,
}

impl<F: fmt::Debug> fmt::Debug for Machine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            regs,
            vars,
            slots,
            nodes,
            error,
        } = self;
        f.debug_struct("Machine")
            .field("regs", regs)
            .field("vars", vars)
            .field("slots", slots)
            .field("nodes", nodes)
            .field("error", error)
            .finish()
    }
}

impl<F> Default for Machine<F> {
    fn default() -> Self {
        Self {
            regs: Vec::new(),
            vars: BTreeMap::new(),
            slots: SlotMap::new(),
            nodes: Vec::new(),
            error: None,
        }
    }
}

impl<F> Machine<F> {
    fn reserve(&mut self, effects: &EffectSummary) {
        self.regs.reserve(effects.registers);
        self.nodes.reserve(effects.nodes);
    }

    fn clear(&mut self) {
        self.regs.clear();
        self.vars.clear();
        self.slots = SlotMap::new();
        self.nodes.clear();
        self.error = None;
    }

    fn prune(&mut self, error: MachineError) -> bool {
        self.error.get_or_insert(error);
        true
    }
}

impl<F: Clone> Machine<F> {
    fn fork_into(&self, dst: &mut Self) {
        dst.regs.clone_from(&self.regs);
        dst.vars.clone_from(&self.vars);
        dst.slots.clone_from(&self.slots);
        dst.nodes.clone_from(&self.nodes);
        dst.error = self.error;
    }
}

/// Per-thread free lists of machine states, keyed by operator type
mod pool {
    use std::{
        any::{Any, TypeId},
        cell::RefCell,
    };

    use hashbrown::HashMap;

    use super::Machine;
    use crate::pattern::EffectSummary;

    thread_local! {
        static POOLS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
    }

    pub(super) fn borrow<F: 'static>(effects: &EffectSummary) -> Machine<F> {
        let mut state = POOLS
            .with(|p| {
                p.borrow_mut()
                    .entry(TypeId::of::<Machine<F>>())
                    .or_insert_with(|| Box::new(Vec::<Machine<F>>::new()))
                    .downcast_mut::<Vec<Machine<F>>>()
                    .unwrap_or_else(|| unreachable!())
                    .pop()
            })
            .unwrap_or_default();

        state.reserve(effects);
        state
    }

    pub(super) fn release<F: 'static>(mut state: Machine<F>) {
        state.clear();
        POOLS.with(|p| {
            p.borrow_mut()
                .entry(TypeId::of::<Machine<F>>())
                .or_insert_with(|| Box::new(Vec::<Machine<F>>::new()))
                .downcast_mut::<Vec<Machine<F>>>()
                .unwrap_or_else(|| unreachable!())
                .push(state);
        });
    }
}

/// Run a compiled pattern against one root call, invoking `k` for every
/// match
///
/// Enumeration is deterministic given a fixed graph.  If `k` returns false,
/// enumeration stops and the run returns false; otherwise it returns true
/// after exhausting every branch.
///
/// # Errors
/// Fails when the root call is not owned by this graph.  Pattern mismatches
/// are pruned, not errors.
pub fn run<F: Ord + Clone + 'static, K: FnMut(&Match) -> bool>(
    graph: &EGraph<F>,
    pattern: &CompiledPattern<F>,
    root: &EClassCall,
    k: &mut K,
) -> Result<bool, UnknownEClass> {
    let root = graph.canonicalize_call(root)?;

    let mut state = pool::borrow::<F>(pattern.effects());
    state.regs.push(root);

    let ret = step(graph, pattern, 0, &mut state, k);
    pool::release(state);
    Ok(ret)
}

/// Report why a pattern produced no match at the given root, or `None` if it
/// does match
///
/// # Errors
/// Fails when the root call is not owned by this graph.
pub fn first_failure<F: Ord + Clone + 'static>(
    graph: &EGraph<F>,
    pattern: &CompiledPattern<F>,
    root: &EClassCall,
) -> Result<Option<MachineError>, UnknownEClass> {
    let root = graph.canonicalize_call(root)?;

    let mut state = pool::borrow::<F>(pattern.effects());
    state.regs.push(root);

    let mut found = false;
    step(graph, pattern, 0, &mut state, &mut |_| {
        found = true;
        false
    });
    let error = state.error;
    pool::release(state);

    Ok(if found { None } else { error })
}

fn step<F: Ord + Clone + 'static, K: FnMut(&Match) -> bool>(
    graph: &EGraph<F>,
    pattern: &CompiledPattern<F>,
    mut pc: usize,
    state: &mut Machine<F>,
    k: &mut K,
) -> bool {
    while let Some(insn) = pattern.insns().get(pc) {
        match insn {
            Insn::BindVar { reg, var } => {
                let call = state.regs[*reg].clone();
                state.vars.insert(var.clone(), call);
            },
            Insn::Compare { reg, with } => {
                let same = graph
                    .are_same(&state.regs[*reg], &state.regs[*with])
                    .unwrap_or_else(|_| unreachable!());
                if !same {
                    return state.prune(MachineError::InconsistentVars {
                        reg: *reg,
                        with: *with,
                    });
                }
            },
            Insn::BindNode {
                out,
                op,
                defs,
                uses,
                arity,
            } => {
                let call = state.regs[*out].clone();
                let mut candidates: Vec<_> = graph
                    .nodes(&call)
                    .unwrap_or_else(|_| unreachable!())
                    .into_iter()
                    .filter(|n| {
                        n.op() == op
                            && n.args().len() == *arity
                            && n.defs().len() == defs.len()
                            && n.uses().len() == uses.len()
                    })
                    .collect();

                if candidates.is_empty() {
                    return state.prune(MachineError::NoMatchingNode { reg: *out });
                }

                // The first candidate continues on the current state; the
                // rest fork from a snapshot taken before any binding
                let forks: Vec<_> = (1..candidates.len())
                    .map(|_| {
                        let mut fork = pool::borrow::<F>(pattern.effects());
                        state.fork_into(&mut fork);
                        fork
                    })
                    .collect();
                let first = candidates.remove(0);

                if !bind_node(graph, pattern, pc, state, first, *out, defs, uses, k) {
                    forks.into_iter().for_each(pool::release);
                    return false;
                }

                for (candidate, mut fork) in candidates.into_iter().zip(forks) {
                    let keep =
                        bind_node(graph, pattern, pc, &mut fork, candidate, *out, defs, uses, k);
                    state.error = state.error.or(fork.error);
                    pool::release(fork);
                    if !keep {
                        return false;
                    }
                }

                return true;
            },
        }

        pc += 1;
    }

    let m = Match {
        root: state.regs[0].clone(),
        vars: state.vars.clone(),
        slots: state.slots.clone(),
    };
    k(&m)
}

#[allow(clippy::too_many_arguments, reason = "internal fan-out helper")]
fn bind_node<F: Ord + Clone + 'static, K: FnMut(&Match) -> bool>(
    graph: &EGraph<F>,
    pattern: &CompiledPattern<F>,
    pc: usize,
    state: &mut Machine<F>,
    node: ENode<F>,
    out: usize,
    defs: &[Slot],
    uses: &[Slot],
    k: &mut K,
) -> bool {
    for (&pat_slot, &actual) in defs
        .iter()
        .zip(node.defs())
        .chain(uses.iter().zip(node.uses()))
    {
        match state.slots.get(pat_slot) {
            Some(prev) if prev != actual => {
                return state.prune(MachineError::NoMatchingNode { reg: out });
            },
            _ => {
                state.slots.insert(pat_slot, actual);
            },
        }
    }

    for arg in node.args() {
        state.regs.push(arg.clone());
    }
    state.nodes.push(node);

    step(graph, pattern, pc + 1, state, k)
}

impl<F: Ord + Clone + Send + Sync + 'static> CompiledPattern<F> {
    /// Collect every match of this pattern at the given root
    ///
    /// # Errors
    /// Fails when the root call is not owned by this graph.
    pub fn search(&self, root: &EClassCall, graph: &EGraph<F>) -> Result<Vec<Match>, UnknownEClass> {
        let mut out = Vec::new();
        run(graph, self, root, &mut |m| {
            out.push(m.clone());
            true
        })?;
        Ok(out)
    }
}

impl Match {
    /// Re-target the match at a derived graph, canonicalizing every stored
    /// call
    ///
    /// # Errors
    /// Fails when a stored ref is not owned by the target graph.
    pub fn port<F: Ord + Clone>(&self, graph: &EGraph<F>) -> Result<Self, UnknownEClass> {
        let root = graph.canonicalize_call(&self.root)?;
        let vars = self
            .vars
            .iter()
            .map(|(v, c)| Ok((v.clone(), graph.canonicalize_call(c)?)))
            .collect::<Result<_, UnknownEClass>>()?;

        Ok(Self {
            root,
            vars,
            slots: self.slots.clone(),
        })
    }

    /// Rewrite the match's actual slots to numeric slots in a deterministic
    /// encounter order, so logically equal matches compare equal even when
    /// they bound per-materialization fresh slots
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut renaming = SlotMap::new();
        let mut next = 0u32;
        let mut visit = |s: Slot, renaming: &mut SlotMap| {
            if !renaming.contains_key(s) {
                renaming.insert(s, Slot::numeric(next));
                next += 1;
            }
        };

        for s in self.root.args().values() {
            visit(s, &mut renaming);
        }
        for call in self.vars.values() {
            for s in call.args().values() {
                visit(s, &mut renaming);
            }
        }
        for s in self.slots.values() {
            visit(s, &mut renaming);
        }

        Self {
            root: self.root.rename(&renaming),
            vars: self
                .vars
                .iter()
                .map(|(v, c)| (v.clone(), c.rename(&renaming)))
                .collect(),
            slots: self.slots.compose_retain(&renaming),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        egraph::EGraph,
        node::{EClassCall, ENode},
        pattern::Pattern,
        slot::Slot,
    };

    type Graph = EGraph<char>;
    type Node = ENode<char>;

    fn leaf(op: char) -> Node { Node::new(op, vec![], vec![], vec![]) }

    fn app(op: char, args: Vec<EClassCall>) -> Node { Node::new(op, vec![], vec![], args) }

    #[test]
    fn literal_pattern_matches_itself() {
        let mut g = Graph::new();
        let a = g.add(&leaf('a')).unwrap().into_call();
        let fa = g.add(&app('f', vec![a.clone()])).unwrap().into_call();

        let pat = Pattern::node('f', vec![], vec![], vec![Pattern::leaf('a')]).compile();
        let matches = pat.search(&fa, &g).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].root, fa);

        let wrong = Pattern::node('g', vec![], vec![], vec![Pattern::leaf('a')]).compile();
        assert_eq!(wrong.search(&fa, &g).unwrap().len(), 0);
    }

    #[test]
    fn variables_bind_child_calls() {
        let mut g = Graph::new();
        let a = g.add(&leaf('a')).unwrap().into_call();
        let b = g.add(&leaf('b')).unwrap().into_call();
        let fab = g.add(&app('f', vec![a.clone(), b.clone()])).unwrap().into_call();

        let pat = Pattern::node('f', vec![], vec![], vec![
            Pattern::var("x"),
            Pattern::var("y"),
        ])
        .compile();

        let matches = pat.search(&fab, &g).unwrap();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.vars[&crate::pattern::PatternVar::new("x")], a);
        assert_eq!(m.vars[&crate::pattern::PatternVar::new("y")], b);
    }

    #[test]
    fn repeated_variables_require_equal_classes() {
        let mut g = Graph::new();
        let a = g.add(&leaf('a')).unwrap().into_call();
        let b = g.add(&leaf('b')).unwrap().into_call();
        let faa = g.add(&app('f', vec![a.clone(), a.clone()])).unwrap().into_call();
        let fab = g.add(&app('f', vec![a.clone(), b.clone()])).unwrap().into_call();

        let pat = Pattern::node('f', vec![], vec![], vec![
            Pattern::var("x"),
            Pattern::var("x"),
        ])
        .compile();

        assert_eq!(pat.search(&faa, &g).unwrap().len(), 1);
        assert_eq!(pat.search(&fab, &g).unwrap().len(), 0);
    }

    #[test]
    fn multiple_nodes_in_a_class_fork_the_machine() {
        let mut g = Graph::new();
        let a = g.add(&leaf('a')).unwrap().into_call();
        let b = g.add(&leaf('b')).unwrap().into_call();
        let fa = g.add(&app('f', vec![a.clone()])).unwrap().into_call();
        let fb = g.add(&app('f', vec![b.clone()])).unwrap().into_call();

        {
            let mut wr = g.write();
            wr.union(&fa, &fb).unwrap();
        }

        // The merged class holds f(a) and f(b); ?x binds both ways
        let pat = Pattern::node('f', vec![], vec![], vec![Pattern::var("x")]).compile();
        let matches = pat.search(&fa, &g).unwrap();
        assert_eq!(matches.len(), 2);

        let x = crate::pattern::PatternVar::new("x");
        let bound: Vec<_> = matches.iter().map(|m| m.vars[&x].clone()).collect();
        assert!(bound.contains(&g.canonicalize_call(&a).unwrap()));
        assert!(bound.contains(&g.canonicalize_call(&b).unwrap()));
    }

    #[test]
    fn continuation_false_stops_enumeration() {
        let mut g = Graph::new();
        let a = g.add(&leaf('a')).unwrap().into_call();
        let b = g.add(&leaf('b')).unwrap().into_call();
        let fa = g.add(&app('f', vec![a])).unwrap().into_call();
        let fb = g.add(&app('f', vec![b])).unwrap().into_call();

        {
            let mut wr = g.write();
            wr.union(&fa, &fb).unwrap();
        }

        let pat = Pattern::node('f', vec![], vec![], vec![Pattern::var("x")]).compile();
        let mut count = 0;
        let done = super::run(&g, &pat, &fa, &mut |_| {
            count += 1;
            false
        })
        .unwrap();
        assert!(!done);
        assert_eq!(count, 1);
    }

    #[test]
    fn slot_patterns_bind_binders() {
        let mut g = Graph::new();
        let x = Slot::fresh();
        let vx = g.add(&Node::new('v', vec![], vec![x], vec![])).unwrap().into_call();
        let lam = g
            .add(&Node::new('λ', vec![x], vec![], vec![vx]))
            .unwrap()
            .into_call();

        let p = Slot::numeric(100);
        let pat = Pattern::node('λ', vec![p], vec![], vec![Pattern::var("body")]).compile();
        let matches = pat.search(&lam, &g).unwrap();
        assert_eq!(matches.len(), 1);
        // The binder slot bound to the freshly materialized definition
        assert!(matches[0].slots.get(p).unwrap().is_fresh());
    }

    #[test]
    fn first_failure_reports_missing_node() {
        let mut g = Graph::new();
        let a = g.add(&leaf('a')).unwrap().into_call();

        let pat = Pattern::node('f', vec![], vec![], vec![]).compile();
        let err = super::first_failure(&g, &pat, &a).unwrap();
        assert_eq!(err, Some(super::MachineError::NoMatchingNode { reg: 0 }));
    }

    #[test]
    fn first_failure_reports_the_conflicting_register() {
        let mut g = Graph::new();
        let x = Slot::fresh();
        let y = Slot::fresh();
        let fxy = g
            .add(&Node::new('f', vec![], vec![x, y], vec![]))
            .unwrap()
            .into_call();
        let root = g.add(&app('g', vec![fxy])).unwrap().into_call();

        // g(f(p, p)) demands one slot in both use positions, but the stored
        // node binds two; the conflict is at the child's register, not the
        // root's
        let p = Slot::numeric(100);
        let pat = Pattern::node('g', vec![], vec![], vec![Pattern::node(
            'f',
            vec![],
            vec![p, p],
            vec![],
        )])
        .compile();

        assert_eq!(pat.search(&root, &g).unwrap().len(), 0);
        let err = super::first_failure(&g, &pat, &root).unwrap();
        assert_eq!(err, Some(super::MachineError::NoMatchingNode { reg: 1 }));
    }

    #[test]
    fn normalized_matches_compare_equal_across_materializations() {
        let mut g = Graph::new();
        let x = Slot::fresh();
        let vx = g.add(&Node::new('v', vec![], vec![x], vec![])).unwrap().into_call();
        let lam = g
            .add(&Node::new('λ', vec![x], vec![], vec![vx]))
            .unwrap()
            .into_call();

        let p = Slot::numeric(100);
        let pat = Pattern::node('λ', vec![p], vec![], vec![Pattern::var("body")]).compile();

        let a = pat.search(&lam, &g).unwrap().remove(0);
        let b = pat.search(&lam, &g).unwrap().remove(0);
        // Each search freshens the binder differently...
        assert_ne!(a, b);
        // ...but the normal forms agree
        assert_eq!(a.normalized(), b.normalized());
    }
}
