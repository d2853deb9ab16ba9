//! Induced class hierarchy for neural-backed decision tree (NBDT) heads.
//!
//! The hierarchy is a node-link JSON graph: `nodes` carry an `id` (a WordNet-style
//! id, "wnid") and an optional `label`, `links` point from parent to child. Leaves
//! are the dataset classes; a wnids file lists the leaf ids in class-index order.
//!
//! A node head replaces the class logits by one logit per child of the node, the
//! mean of the class logits under that child.

use anyhow::{bail, ensure, Context, Result};
use log::debug;
use ndarray::{Array3, Axis};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct NodeLinkGraph {
    nodes: Vec<GraphNode>,
    links: Vec<GraphLink>,
}

#[derive(Debug, Deserialize)]
struct GraphNode {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphLink {
    source: String,
    target: String,
}

/// One child of a hierarchy node and the class indices beneath it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildGroup {
    pub wnid: String,
    pub classes: Vec<usize>,
}

/// An inner node of the hierarchy, as used for a node head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyNode {
    pub wnid: String,
    pub children: Vec<ChildGroup>,
}

impl HierarchyNode {
    /// Child logits `(children, h, w)` from class logits `(classes, h, w)`
    pub fn child_logits(&self, class_logits: &Array3<f32>) -> Result<Array3<f32>> {
        let (num_classes, height, width) = class_logits.dim();
        let mut out = Array3::zeros((self.children.len(), height, width));
        for (c, child) in self.children.iter().enumerate() {
            ensure!(!child.classes.is_empty(), "Child {} has no classes", child.wnid);
            let mut slot = out.index_axis_mut(Axis(0), c);
            for &cls in &child.classes {
                ensure!(
                    cls < num_classes,
                    "Class {cls} under node {} exceeds the {num_classes} model outputs",
                    self.wnid
                );
                slot += &class_logits.index_axis(Axis(0), cls);
            }
            slot /= child.classes.len() as f32;
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct Hierarchy {
    root: String,
    order: Vec<String>,
    ids: HashSet<String>,
    children: HashMap<String, Vec<String>>,
    parent: HashMap<String, String>,
    leaves: Vec<String>,
}

impl Hierarchy {
    /// Load the graph and, when given, the wnids file fixing the class order
    pub fn from_files(graph_path: &Path, wnids_path: Option<&Path>) -> Result<Self> {
        let json = std::fs::read_to_string(graph_path)
            .with_context(|| format!("Failed to read hierarchy {}", graph_path.display()))?;
        let wnids = match wnids_path {
            Some(path) => Some(read_wnids(path)?),
            None => None,
        };
        Self::from_json(&json, wnids)
            .with_context(|| format!("Invalid hierarchy {}", graph_path.display()))
    }

    /// Build from node-link JSON.
    ///
    /// Without `wnids`, the leaves are taken in the order they appear in `nodes`.
    pub fn from_json(json: &str, wnids: Option<Vec<String>>) -> Result<Self> {
        let graph: NodeLinkGraph = serde_json::from_str(json)?;

        let mut order = Vec::with_capacity(graph.nodes.len());
        let mut ids = HashSet::new();
        for node in graph.nodes {
            ensure!(ids.insert(node.id.clone()), "Duplicate node {}", node.id);
            order.push(node.id);
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut parent: HashMap<String, String> = HashMap::new();
        for link in graph.links {
            ensure!(
                ids.contains(&link.source) && ids.contains(&link.target),
                "Link {} -> {} references an unknown node",
                link.source,
                link.target
            );
            if let Some(existing) = parent.get(&link.target) {
                bail!(
                    "Node {} has two parents ({} and {})",
                    link.target,
                    existing,
                    link.source
                );
            }
            parent.insert(link.target.clone(), link.source.clone());
            children.entry(link.source).or_default().push(link.target);
        }

        let roots: Vec<&String> = order.iter().filter(|id| !parent.contains_key(*id)).collect();
        let root = match roots.as_slice() {
            [root] => (*root).clone(),
            [] => bail!("Hierarchy has no root"),
            _ => bail!("Hierarchy has {} roots, expected one", roots.len()),
        };

        let leaves = match wnids {
            Some(wnids) => {
                for wnid in &wnids {
                    ensure!(ids.contains(wnid), "Leaf {wnid} is not in the hierarchy");
                    ensure!(
                        !children.contains_key(wnid),
                        "Class {wnid} is an inner node of the hierarchy"
                    );
                }
                wnids
            }
            None => order
                .iter()
                .filter(|id| !children.contains_key(*id))
                .cloned()
                .collect(),
        };

        let hierarchy = Self {
            root,
            order,
            ids,
            children,
            parent,
            leaves,
        };
        // Every node must reach the root
        for id in &hierarchy.order {
            hierarchy.ancestors(id)?;
        }
        debug!(
            "Loaded hierarchy rooted at {} with {} nodes and {} leaves",
            hierarchy.root,
            hierarchy.order.len(),
            hierarchy.leaves.len()
        );
        Ok(hierarchy)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn num_classes(&self) -> usize {
        self.leaves.len()
    }

    /// Leaf wnid of a class index
    pub fn leaf(&self, class: usize) -> Result<&str> {
        self.leaves
            .get(class)
            .map(String::as_str)
            .with_context(|| format!("Class {class} has no leaf in the hierarchy"))
    }

    /// Ancestors of `wnid`, nearest first
    fn ancestors(&self, wnid: &str) -> Result<Vec<String>> {
        let mut path = Vec::new();
        let mut current = wnid;
        while let Some(parent) = self.parent.get(current) {
            ensure!(path.len() <= self.order.len(), "Hierarchy contains a cycle through {wnid}");
            path.push(parent.clone());
            current = parent;
        }
        Ok(path)
    }

    fn leaf_classes(&self, wnid: &str) -> Vec<usize> {
        let mut classes = BTreeSet::new();
        let mut stack = vec![wnid];
        while let Some(id) = stack.pop() {
            match self.children.get(id) {
                Some(kids) => stack.extend(kids.iter().map(String::as_str)),
                None => {
                    if let Some(index) = self.leaves.iter().position(|leaf| leaf == id) {
                        classes.insert(index);
                    }
                }
            }
        }
        classes.into_iter().collect()
    }

    /// The inner node `wnid` with the classes beneath each of its children
    pub fn node(&self, wnid: &str) -> Result<HierarchyNode> {
        ensure!(self.ids.contains(wnid), "Unknown hierarchy node {wnid}");
        let kids = self
            .children
            .get(wnid)
            .with_context(|| format!("Hierarchy node {wnid} is a leaf"))?;

        let children = kids
            .iter()
            .map(|kid| ChildGroup {
                wnid: kid.clone(),
                classes: self.leaf_classes(kid),
            })
            .collect();
        Ok(HierarchyNode {
            wnid: wnid.to_string(),
            children,
        })
    }

    /// Inner nodes on the way from the root down to the leaf of `class`
    pub fn path_to_class(&self, class: usize) -> Result<Vec<String>> {
        let leaf = self.leaf(class)?;
        let mut path = self.ancestors(leaf)?;
        path.reverse();
        Ok(path)
    }
}

/// One wnid per non-empty line
pub fn read_wnids(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read wnids {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    // root -> {a, b}; a -> {c0, c1}; b -> {c2, x}; x -> {c3}
    const GRAPH: &str = r#"{
        "directed": true,
        "multigraph": false,
        "graph": {},
        "nodes": [
            {"id": "root", "label": "root"},
            {"id": "a"}, {"id": "b"}, {"id": "x"},
            {"id": "c0"}, {"id": "c1"}, {"id": "c2"}, {"id": "c3"}
        ],
        "links": [
            {"source": "root", "target": "a"},
            {"source": "root", "target": "b"},
            {"source": "a", "target": "c0"},
            {"source": "a", "target": "c1"},
            {"source": "b", "target": "c2"},
            {"source": "b", "target": "x"},
            {"source": "x", "target": "c3"}
        ]
    }"#;

    fn hierarchy() -> Hierarchy {
        Hierarchy::from_json(GRAPH, None).unwrap()
    }

    #[test]
    fn test_root_and_leaves() {
        let h = hierarchy();
        assert_eq!(h.root(), "root");
        assert_eq!(h.num_classes(), 4);
        assert_eq!(h.leaf(2).unwrap(), "c2");
    }

    #[test]
    fn test_node_children_classes() {
        let node = hierarchy().node("b").unwrap();
        assert_eq!(
            node.children,
            vec![
                ChildGroup { wnid: "c2".into(), classes: vec![2] },
                ChildGroup { wnid: "x".into(), classes: vec![3] },
            ]
        );
        let root = hierarchy().node("root").unwrap();
        assert_eq!(root.children[0].classes, vec![0, 1]);
        assert_eq!(root.children[1].classes, vec![2, 3]);
    }

    #[test]
    fn test_leaf_is_not_a_node() {
        assert!(hierarchy().node("c0").is_err());
        assert!(hierarchy().node("missing").is_err());
    }

    #[test]
    fn test_path_to_class() {
        let h = hierarchy();
        assert_eq!(h.path_to_class(3).unwrap(), vec!["root", "b", "x"]);
        assert_eq!(h.path_to_class(0).unwrap(), vec!["root", "a"]);
        assert!(h.path_to_class(9).is_err());
    }

    #[test]
    fn test_wnids_fix_class_order() {
        let wnids = vec!["c3".into(), "c2".into(), "c1".into(), "c0".into()];
        let h = Hierarchy::from_json(GRAPH, Some(wnids)).unwrap();
        assert_eq!(h.path_to_class(0).unwrap(), vec!["root", "b", "x"]);
        assert_eq!(h.node("a").unwrap().children[0].classes, vec![3]);

        assert!(Hierarchy::from_json(GRAPH, Some(vec!["a".into()])).is_err());
    }

    #[test]
    fn test_two_parents_rejected() {
        let graph = r#"{"nodes": [{"id": "r"}, {"id": "p"}, {"id": "l"}],
            "links": [{"source": "r", "target": "p"}, {"source": "r", "target": "l"},
                      {"source": "p", "target": "l"}]}"#;
        assert!(Hierarchy::from_json(graph, None).is_err());
    }

    #[test]
    fn test_two_roots_rejected() {
        let graph = r#"{"nodes": [{"id": "r1"}, {"id": "r2"}], "links": []}"#;
        assert!(Hierarchy::from_json(graph, None).is_err());
    }

    #[test]
    fn test_child_logits_mean() {
        let node = hierarchy().node("root").unwrap();
        let logits = Array3::from_shape_fn((4, 1, 2), |(c, _, j)| (c * 10 + j) as f32);
        let child = node.child_logits(&logits).unwrap();
        assert_eq!(child.dim(), (2, 1, 2));
        assert_eq!(child[[0, 0, 0]], 5.0);
        assert_eq!(child[[1, 0, 1]], 26.0);
    }
}
