//! Rooted, arena-backed phylogenetic tree.
//!
//! Nodes live in a flat `Vec` and refer to each other by [`NodeId`], which
//! keeps the tree cheaply serializable for checkpoints and avoids ownership
//! cycles. Each node carries a fixed-shape annotation record whose fields
//! start out empty and are written exactly once by the pipeline stage that
//! owns them (distance scoring, clade matching, antigenic fitting).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Per-node annotations, filled in stage order.
///
/// `None` means "not yet computed"; a stage never overwrites a `Some`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnotations {
    /// Cumulative root-to-node antigenic effect.
    pub ctiter: Option<f64>,
    /// This branch's antigenic effect.
    pub dtiter: Option<f64>,
    /// Epitope-site distance from the root peptide.
    pub ep: Option<u32>,
    /// Non-epitope-site distance from the root peptide.
    pub ne: Option<u32>,
    /// Receptor-binding-site distance from the root peptide.
    pub rb: Option<u32>,
    /// Assigned clade label.
    pub clade: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// Strain name for leaves and named internal nodes.
    pub name: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Branch length to the parent (0 for the root).
    pub branch_length: f64,
    /// Translated peptide per gene, in the lineage's gene order.
    pub translations: IndexMap<String, String>,
    pub annot: NodeAnnotations,
}

impl TreeNode {
    fn new(name: Option<String>, branch_length: f64) -> Self {
        TreeNode {
            name,
            parent: None,
            children: Vec::new(),
            branch_length,
            translations: IndexMap::new(),
            annot: NodeAnnotations::default(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Rooted tree with stable node indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: NodeId,
}

impl Tree {
    /// Create a tree holding only a root node.
    pub fn with_root(name: Option<String>) -> Self {
        Tree {
            nodes: vec![TreeNode::new(name, 0.0)],
            root: NodeId(0),
        }
    }

    /// Append a child under `parent` and return its id.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        branch_length: f64,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let mut node = TreeNode::new(name, branch_length);
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0]
    }

    /// All node ids in preorder (parent before children).
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            // Reverse so the first child is visited first.
            for &child in self.nodes[id.0].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|&id| self.node(id).is_leaf())
            .collect()
    }

    /// First node (preorder) carrying `name`.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.preorder()
            .into_iter()
            .find(|&id| self.node(id).name.as_deref() == Some(name))
    }

    /// Node ids from `id` up to and including the root.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            path.push(parent);
            current = parent;
        }
        path
    }

    /// Branches on the unique path between `a` and `b`.
    ///
    /// A branch is identified by its child node; the lowest common ancestor
    /// itself is not part of the path. `path_between(x, x)` is empty.
    pub fn path_between(&self, a: NodeId, b: NodeId) -> Vec<NodeId> {
        let ancestors_a = self.path_to_root(a);
        let on_a_path: std::collections::HashSet<NodeId> = ancestors_a.iter().copied().collect();

        // Walk b upward until the paths merge.
        let mut from_b = Vec::new();
        let mut current = b;
        while !on_a_path.contains(&current) {
            from_b.push(current);
            current = self
                .node(current)
                .parent
                .expect("walk reaches the root, which is on every root path");
        }
        let lca = current;

        let mut branches: Vec<NodeId> =
            ancestors_a.into_iter().take_while(|&n| n != lca).collect();
        branches.extend(from_b);
        branches
    }

    /// Concatenated peptide for `id` over `gene_order`, the fixed scheme
    /// the distance scorer and mask files assume.
    pub fn total_peptide(&self, id: NodeId, gene_order: &[String]) -> String {
        let node = self.node(id);
        gene_order
            .iter()
            .map(|gene| node.translations.get(gene).map(String::as_str).unwrap_or(""))
            .collect()
    }
}
