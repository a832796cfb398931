//! Graphviz rendering of an e-graph, for debugging

use std::{borrow::Cow, collections::BTreeMap, fmt};

use indexmap::IndexMap;

use crate::egraph::EGraph;

macro_rules! attr {
    ($id:ident, $name:literal) => {
        pub fn $id<S: Into<Cow<'a, str>>>(&mut self, $id: S) {
            self.attrs.insert($name, $id.into());
        }
    };
}

/// One node of a dot graph
#[derive(Debug, Default)]
pub struct Node<'a> {
    attrs: BTreeMap<&'static str, Cow<'a, str>>,
}

impl<'a> Node<'a> {
    attr!(label, "label");

    attr!(shape, "shape");
}

/// One edge of a dot graph
#[derive(Debug, Default)]
pub struct Edge<'a> {
    attrs: BTreeMap<&'static str, Cow<'a, str>>,
}

impl<'a> Edge<'a> {
    attr!(label, "label");

    attr!(cluster_head, "lhead");
}

/// A directed graph in Graphviz dot syntax
///
/// Identifiers and attribute values are emitted in their string `Debug`
/// form, so embedded quotes and backslashes stay escaped no matter what the
/// labels contain.  Nodes, subgraphs, and edges render in insertion order.
#[derive(Debug, Default)]
pub struct Graph<'a> {
    attrs: BTreeMap<&'static str, Cow<'a, str>>,
    nodes: IndexMap<Cow<'a, str>, Node<'a>>,
    subgraphs: IndexMap<Cow<'a, str>, Graph<'a>>,
    edges: IndexMap<(Cow<'a, str>, Cow<'a, str>), Vec<Edge<'a>>>,
}

impl<'a> Graph<'a> {
    attr!(label, "label");

    attr!(compound, "compound");

    #[must_use]
    #[inline]
    pub fn new() -> Self { Self::default() }

    pub fn node<S: Into<Cow<'a, str>>>(&mut self, id: S) -> &mut Node<'a> {
        self.nodes.entry(id.into()).or_default()
    }

    pub fn subgraph<S: Into<Cow<'a, str>>>(&mut self, id: S) -> &mut Graph<'a> {
        self.subgraphs.entry(id.into()).or_default()
    }

    pub fn edge<L: Into<Cow<'a, str>>, R: Into<Cow<'a, str>>>(
        &mut self,
        l: L,
        r: R,
    ) -> &mut Edge<'a> {
        let edges = self.edges.entry((l.into(), r.into())).or_default();
        edges.push(Edge::default());
        edges.last_mut().unwrap_or_else(|| unreachable!())
    }

    fn fmt_impl(&self, f: &mut fmt::Formatter<'_>, sub_id: Option<&str>) -> fmt::Result {
        let Self {
            attrs,
            nodes,
            subgraphs,
            edges,
        } = self;

        match sub_id {
            None => f.write_str("digraph {")?,
            Some(id) => write!(f, "subgraph {id:?} {{")?,
        }

        for (key, val) in attrs {
            write!(f, "{key}={val:?};")?;
        }

        for (id, graph) in subgraphs {
            graph.fmt_impl(f, Some(id.as_ref()))?;
        }

        for (id, Node { attrs }) in nodes {
            write!(f, "{id:?}")?;

            let mut state = AttrState::default();
            for (key, val) in attrs {
                state.write_one(f, key, val)?;
            }
            state.finish(f)?;
            f.write_str(";")?;
        }

        for ((l, r), edges) in edges {
            for Edge { attrs } in edges {
                write!(f, "{l:?}->{r:?}")?;

                let mut state = AttrState::default();
                for (key, val) in attrs {
                    state.write_one(f, key, val)?;
                }
                state.finish(f)?;
                f.write_str(";")?;
            }
        }

        f.write_str("}")
    }
}

impl fmt::Display for Graph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.fmt_impl(f, None) }
}

#[derive(Default)]
struct AttrState {
    any: bool,
}

impl AttrState {
    fn write_one(
        &mut self,
        f: &mut fmt::Formatter<'_>,
        key: &'static str,
        val: &Cow<'_, str>,
    ) -> fmt::Result {
        f.write_str(if self.any {
            ","
        } else {
            self.any = true;
            "["
        })?;
        write!(f, "{key}={val:?}")
    }

    fn finish(self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any { f.write_str("]") } else { Ok(()) }
    }
}

impl<F: Ord + Clone + fmt::Debug> EGraph<F> {
    /// Render the graph in Graphviz dot syntax: one cluster per class, one
    /// node per member, argument edges labeled with their slot maps
    ///
    /// Output order is deterministic.
    #[must_use]
    pub fn dot(&self) -> Graph<'static> {
        let mut graph = Graph::new();
        graph.compound("true");

        let mut pending_edges = Vec::new();
        for id in self.classes() {
            let call = self.canonicalize(id).unwrap_or_else(|_| unreachable!());

            let cluster = graph.subgraph(format!("cluster_{}", id.id()));
            let mut label = format!("c{}", id.id());
            for (i, slot) in call.args().keys().enumerate() {
                label.push_str(if i == 0 { " " } else { ", " });
                label.push_str(&slot.to_string());
            }
            cluster.label(label);

            for (i, node) in self
                .nodes(&call)
                .unwrap_or_else(|_| unreachable!())
                .into_iter()
                .enumerate()
            {
                let mut text = format!("{:?}", node.op());
                for d in node.defs() {
                    text.push_str(&format!(" [{d}]"));
                }
                for u in node.uses() {
                    text.push_str(&format!(" {u}"));
                }
                cluster.node(format!("n{}_{i}", id.id())).label(text);

                for arg in node.args() {
                    pending_edges.push((
                        format!("n{}_{i}", id.id()),
                        format!("n{}_0", arg.id().id()),
                        format!("cluster_{}", arg.id().id()),
                        format!("{:?}", arg.args()),
                    ));
                }
            }
        }

        for (from, to, head, label) in pending_edges {
            let edge = graph.edge(from, to);
            edge.cluster_head(head);
            edge.label(label);
        }

        graph
    }
}

#[cfg(test)]
mod test {
    use crate::{egraph::EGraph, term::Tree};

    #[test]
    fn renders_classes_and_edges() {
        let mut g = EGraph::new();
        g.add_tree(&Tree::new('f', vec![], vec![], vec![Tree::leaf('a')]))
            .unwrap();

        let out = g.dot().to_string();
        assert!(out.starts_with("digraph {"));
        assert!(out.contains(r#"subgraph "cluster_0""#));
        assert!(out.contains(r#"subgraph "cluster_1""#));
        assert!(out.contains("->"));
        assert!(out.ends_with('}'));
    }

    #[test]
    fn rendering_is_deterministic() {
        let build = || {
            let mut g = EGraph::new();
            g.add_tree(&Tree::new('f', vec![], vec![], vec![
                Tree::leaf('a'),
                Tree::leaf('b'),
            ]))
            .unwrap();
            g.dot().to_string()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn labels_escape_quotes() {
        let mut g = EGraph::new();
        g.add_tree(&Tree::leaf("say \"hi\"")).unwrap();

        let out = g.dot().to_string();
        assert!(out.contains(r#"\""#));
        // The raw quoted text never appears unescaped inside a label
        assert!(!out.contains(r#"say "hi""#));
    }
}
