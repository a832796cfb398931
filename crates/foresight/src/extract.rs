//! Extraction of representative trees from the e-graph

use hashbrown::HashMap;

use crate::{
    egraph::{EGraph, UnknownEClass},
    node::{EClassCall, EClassId, ENode},
    term::Tree,
};

/// Failure to produce a ground tree for a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    UnknownEClass(#[from] UnknownEClass),
    /// Every node of the class reaches back into it, so no finite tree
    /// exists
    #[error("no finite tree represents {0:?}")]
    Unextractable(EClassId),
}

/// Produces the least-cost ground tree for a call
///
/// Implementations must be deterministic and total over the classes
/// reachable from the given call.
pub trait Extractor<F>: Sync {
    /// # Errors
    /// Fails when the ref is unknown or the class has no finite
    /// representative.
    fn extract(&self, call: &EClassCall, graph: &EGraph<F>) -> Result<Tree<F>, ExtractError>;
}

/// The reference cost model: every node costs one
#[derive(Debug, Clone, Copy, Default)]
pub struct AstSize;

impl AstSize {
    fn node_cost<F>(node: &ENode<F>, costs: &HashMap<EClassId, usize>) -> Option<usize> {
        let mut total = 1usize;
        for arg in node.args() {
            total = total.checked_add(*costs.get(&arg.id())?)?;
        }
        Some(total)
    }

    fn build<F: Ord + Clone>(
        graph: &EGraph<F>,
        call: &EClassCall,
        costs: &HashMap<EClassId, usize>,
    ) -> Result<Tree<F>, ExtractError> {
        let call = graph.canonicalize_call(call)?;

        let mut best: Option<(usize, ENode<F>)> = None;
        for node in graph.nodes(&call)? {
            let Some(cost) = Self::node_cost(&node, costs) else {
                continue;
            };
            if best.as_ref().is_none_or(|&(c, _)| cost < c) {
                best = Some((cost, node));
            }
        }

        let (_, node) = best.ok_or(ExtractError::Unextractable(call.id()))?;
        let children = node
            .args()
            .iter()
            .map(|arg| Self::build(graph, arg, costs))
            .collect::<Result<_, _>>()?;

        Ok(Tree::new(
            node.op().clone(),
            node.defs().to_vec(),
            node.uses().to_vec(),
            children,
        ))
    }
}

impl<F: Ord + Clone> Extractor<F> for AstSize {
    fn extract(&self, call: &EClassCall, graph: &EGraph<F>) -> Result<Tree<F>, ExtractError> {
        let call = graph.canonicalize_call(call)?;

        let mut costs: HashMap<EClassId, usize> = HashMap::new();
        loop {
            let mut changed = false;
            for id in graph.classes() {
                let ident = graph.canonicalize(id)?;
                for node in graph.nodes(&ident)? {
                    let Some(cost) = Self::node_cost(&node, &costs) else {
                        continue;
                    };
                    if costs.get(&id).is_none_or(|&c| cost < c) {
                        costs.insert(id, cost);
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        Self::build(graph, &call, &costs)
    }
}

#[cfg(test)]
mod test {
    use super::{AstSize, Extractor};
    use crate::{egraph::EGraph, term::Tree};

    type Graph = EGraph<char>;

    fn f_of(op: char, children: Vec<Tree<char>>) -> Tree<char> {
        Tree::new(op, vec![], vec![], children)
    }

    #[test]
    fn extracts_the_smaller_equivalent() {
        let mut g = Graph::new();
        let big = g
            .add_tree(&f_of('f', vec![f_of('g', vec![Tree::leaf('a')])]))
            .unwrap();
        let small = g.add_tree(&Tree::leaf('b')).unwrap();

        {
            let mut wr = g.write();
            wr.union(&big, &small).unwrap();
        }

        let tree = AstSize.extract(&big, &g).unwrap();
        assert_eq!(tree, Tree::leaf('b'));
    }

    #[test]
    fn extraction_is_deterministic() {
        let mut g = Graph::new();
        let a = g.add_tree(&Tree::leaf('a')).unwrap();
        let b = g.add_tree(&Tree::leaf('b')).unwrap();

        {
            let mut wr = g.write();
            wr.union(&a, &b).unwrap();
        }

        // Equal costs break ties toward the structurally least node
        let t1 = AstSize.extract(&a, &g).unwrap();
        let t2 = AstSize.extract(&b, &g).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t1, Tree::leaf('a'));
    }

    #[test]
    fn cyclic_classes_fall_back_to_ground_nodes() {
        let mut g = Graph::new();
        let a = g.add_tree(&Tree::leaf('a')).unwrap();
        let fa = {
            let node = crate::node::ENode::new('f', vec![], vec![], vec![a.clone()]);
            g.add(&node).unwrap().into_call()
        };

        // a = f(a) makes the class self-referential; the leaf still wins
        {
            let mut wr = g.write();
            wr.union(&fa, &a).unwrap();
        }
        assert_eq!(AstSize.extract(&fa, &g).unwrap(), Tree::leaf('a'));
    }

    #[test]
    fn shared_subterms_extract_consistently() {
        let mut g = Graph::new();
        let shared = f_of('g', vec![Tree::leaf('a')]);
        let root = g
            .add_tree(&f_of('f', vec![shared.clone(), shared.clone()]))
            .unwrap();

        let tree = AstSize.extract(&root, &g).unwrap();
        assert_eq!(tree, f_of('f', vec![shared.clone(), shared]));
    }
}
