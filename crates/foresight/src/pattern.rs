//! Patterns with variables and their compilation to a register tape

use std::{collections::BTreeSet, fmt, sync::Arc};

use indexmap::IndexMap;

use crate::slot::Slot;

/// A named hole in a pattern, matching any e-class application
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatternVar(Arc<str>);

impl PatternVar {
    #[must_use]
    pub fn new(name: &str) -> Self { Self(name.into()) }

    #[must_use]
    #[inline]
    pub fn name(&self) -> &str { &self.0 }
}

impl From<&str> for PatternVar {
    #[inline]
    fn from(name: &str) -> Self { Self::new(name) }
}

impl fmt::Debug for PatternVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(name) = self;
        write!(f, "?{name}")
    }
}

impl fmt::Display for PatternVar {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// A term with pattern-variable holes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pattern<F> {
    Var(PatternVar),
    Node {
        op: F,
        defs: Vec<Slot>,
        uses: Vec<Slot>,
        children: Vec<Pattern<F>>,
    },
}

impl<F> Pattern<F> {
    #[must_use]
    pub fn var(name: &str) -> Self { Self::Var(PatternVar::new(name)) }

    #[must_use]
    pub fn node(op: F, defs: Vec<Slot>, uses: Vec<Slot>, children: Vec<Pattern<F>>) -> Self {
        Self::Node {
            op,
            defs,
            uses,
            children,
        }
    }

    /// A childless, slotless operator pattern
    #[must_use]
    pub fn leaf(op: F) -> Self { Self::node(op, vec![], vec![], vec![]) }

    /// Every pattern variable, in occurrence order
    #[must_use]
    pub fn vars(&self) -> Vec<PatternVar> {
        fn go<F>(pat: &Pattern<F>, out: &mut Vec<PatternVar>) {
            match pat {
                Pattern::Var(v) => {
                    if !out.contains(v) {
                        out.push(v.clone());
                    }
                },
                Pattern::Node { children, .. } => {
                    for c in children {
                        go(c, out);
                    }
                },
            }
        }

        let mut out = Vec::new();
        go(self, &mut out);
        out
    }

    /// Every pattern slot mentioned in a definition or use position
    #[must_use]
    pub fn slots(&self) -> BTreeSet<Slot> {
        fn go<F>(pat: &Pattern<F>, out: &mut BTreeSet<Slot>) {
            if let Pattern::Node {
                defs,
                uses,
                children,
                ..
            } = pat
            {
                out.extend(defs.iter().copied());
                out.extend(uses.iter().copied());
                for c in children {
                    go(c, out);
                }
            }
        }

        let mut out = BTreeSet::new();
        go(self, &mut out);
        out
    }
}

/// One instruction of a compiled pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn<F> {
    /// Enumerate the nodes of the class in `out`, binding pattern slots and
    /// appending one register per child argument
    BindNode {
        out: usize,
        op: F,
        defs: Vec<Slot>,
        uses: Vec<Slot>,
        arity: usize,
    },
    /// Bind a pattern variable to the call in `reg`
    BindVar { reg: usize, var: PatternVar },
    /// Require the calls in two registers to denote the same class
    Compare { reg: usize, with: usize },
}

/// Static resource bounds of a compiled pattern, used to size pooled machine
/// states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectSummary {
    pub registers: usize,
    pub vars: usize,
    pub slots: usize,
    pub nodes: usize,
}

/// A pattern lowered to a register tape
pub struct CompiledPattern<F> {
    insns: Vec<Insn<F>>,
    effects: EffectSummary,
}

impl<F: fmt::Debug> fmt::Debug for CompiledPattern<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { insns, effects } = self;
        f.debug_struct("CompiledPattern")
            .field("insns", insns)
            .field("effects", effects)
            .finish()
    }
}

impl<F: Clone> Clone for CompiledPattern<F> {
    fn clone(&self) -> Self {
        Self {
            insns: self.insns.clone(),
            effects: self.effects,
        }
    }
}

impl<F> CompiledPattern<F> {
    #[must_use]
    #[inline]
    pub fn insns(&self) -> &[Insn<F>] { &self.insns }

    #[must_use]
    #[inline]
    pub fn effects(&self) -> &EffectSummary { &self.effects }
}

struct Compiler<F> {
    insns: Vec<Insn<F>>,
    next_reg: usize,
    vars: IndexMap<PatternVar, usize>,
    slots: BTreeSet<Slot>,
    nodes: usize,
}

impl<F: Clone> Compiler<F> {
    fn compile(&mut self, pat: &Pattern<F>, out: usize) {
        match pat {
            Pattern::Var(var) => {
                if let Some(&first) = self.vars.get(var) {
                    self.insns.push(Insn::Compare { reg: out, with: first });
                } else {
                    self.vars.insert(var.clone(), out);
                    self.insns.push(Insn::BindVar {
                        reg: out,
                        var: var.clone(),
                    });
                }
            },
            Pattern::Node {
                op,
                defs,
                uses,
                children,
            } => {
                self.slots.extend(defs.iter().copied());
                self.slots.extend(uses.iter().copied());
                self.nodes += 1;

                let base = self.next_reg;
                self.next_reg += children.len();
                self.insns.push(Insn::BindNode {
                    out,
                    op: op.clone(),
                    defs: defs.clone(),
                    uses: uses.clone(),
                    arity: children.len(),
                });

                for (i, child) in children.iter().enumerate() {
                    self.compile(child, base + i);
                }
            },
        }
    }
}

impl<F: Clone> Pattern<F> {
    /// Lower the pattern to an instruction tape over a register file whose
    /// register 0 is the root call
    #[must_use]
    pub fn compile(&self) -> CompiledPattern<F> {
        let mut c = Compiler {
            insns: Vec::new(),
            next_reg: 1,
            vars: IndexMap::new(),
            slots: BTreeSet::new(),
            nodes: 0,
        };
        c.compile(self, 0);

        let effects = EffectSummary {
            registers: c.next_reg,
            vars: c.vars.len(),
            slots: c.slots.len(),
            nodes: c.nodes,
        };
        CompiledPattern {
            insns: c.insns,
            effects,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Insn, Pattern};

    #[test]
    fn nested_patterns_allocate_consecutive_registers() {
        // f(g(?x), ?y)
        let pat = Pattern::node('f', vec![], vec![], vec![
            Pattern::node('g', vec![], vec![], vec![Pattern::var("x")]),
            Pattern::var("y"),
        ]);

        let compiled = pat.compile();
        assert_eq!(compiled.effects().registers, 4);
        assert_eq!(compiled.insns(), &[
            Insn::BindNode {
                out: 0,
                op: 'f',
                defs: vec![],
                uses: vec![],
                arity: 2
            },
            Insn::BindNode {
                out: 1,
                op: 'g',
                defs: vec![],
                uses: vec![],
                arity: 1
            },
            Insn::BindVar {
                reg: 3,
                var: "x".into()
            },
            Insn::BindVar {
                reg: 2,
                var: "y".into()
            },
        ]);
    }

    #[test]
    fn repeated_variables_compile_to_compare() {
        // f(?x, ?x)
        let pat = Pattern::node('f', vec![], vec![], vec![
            Pattern::var("x"),
            Pattern::var("x"),
        ]);

        let compiled = pat.compile();
        assert_eq!(compiled.effects().vars, 1);
        assert_eq!(compiled.insns()[1], Insn::BindVar {
            reg: 1,
            var: "x".into()
        });
        assert_eq!(compiled.insns()[2], Insn::Compare { reg: 2, with: 1 });
    }

    #[test]
    fn vars_reports_occurrence_order() {
        let pat = Pattern::node('f', vec![], vec![], vec![
            Pattern::var("b"),
            Pattern::var("a"),
            Pattern::var("b"),
        ]);
        let vars: Vec<_> = pat.vars().iter().map(|v| v.name().to_owned()).collect();
        assert_eq!(vars, ["b", "a"]);
    }
}
