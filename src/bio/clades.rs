//! Clade assignment from curated marker-mutation tables.
//!
//! A clade signature is an ordered list of (gene, position, residue)
//! markers; a node satisfies a signature iff every marker matches its
//! translation exactly. Tables are ordered maps and are evaluated in table
//! order, so when signatures overlap the earlier entry wins. The built-in
//! tables in [`crate::config`] list more-derived clades before their
//! ancestors for exactly this reason.

use indexmap::IndexMap;
use log::info;
use serde::{Deserialize, Serialize};

use crate::tree::Tree;

/// Label reported when no signature matches.
pub const UNASSIGNED: &str = "unassigned";

/// One marker mutation: `gene` position `position` (1-based, within that
/// gene's translation) must carry `residue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub gene: String,
    pub position: usize,
    pub residue: char,
}

impl Marker {
    pub fn new(gene: &str, position: usize, residue: char) -> Self {
        Marker {
            gene: gene.to_string(),
            position,
            residue,
        }
    }

    /// Whether `translations` carries this marker. Positions beyond the
    /// translation's length never match.
    pub fn matches(&self, translations: &IndexMap<String, String>) -> bool {
        let Some(peptide) = translations.get(&self.gene) else {
            return false;
        };
        if self.position == 0 {
            return false;
        }
        peptide
            .as_bytes()
            .get(self.position - 1)
            .is_some_and(|&aa| aa == self.residue as u8)
    }
}

/// Ordered clade table; iteration order encodes matching priority.
pub type CladeTable = IndexMap<String, Vec<Marker>>;

/// Name of the first clade whose markers all match, or [`UNASSIGNED`].
pub fn assign_clade(translations: &IndexMap<String, String>, table: &CladeTable) -> String {
    for (clade, markers) in table {
        if markers.iter().all(|m| m.matches(translations)) {
            return clade.clone();
        }
    }
    UNASSIGNED.to_string()
}

/// Write the clade annotation on every node.
pub fn annotate_clades(tree: &mut Tree, table: &CladeTable) {
    let order = tree.preorder();
    let mut assigned = 0usize;
    for id in &order {
        let clade = assign_clade(&tree.node(*id).translations, table);
        if clade != UNASSIGNED {
            assigned += 1;
        }
        tree.node_mut(*id).annot.clade = Some(clade);
    }
    info!("assigned clades to {assigned} of {} nodes", order.len());
}
