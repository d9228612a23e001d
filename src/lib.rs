//! Antigenic drift inference from phylogenies and serological titers.
//!
//! The crate combines a dated phylogenetic tree with a sparse matrix of
//! pairwise titer measurements to infer which branches (and which recurring
//! amino-acid substitutions) carry antigenic effect. The pipeline runs as a
//! strictly ordered batch job:
//! 1. Load and subsample the sequence corpus (titer-informed priority).
//! 2. Load the externally built, annotated tree.
//! 3. Score epitope / non-epitope / receptor-binding distances per node.
//! 4. Assign clade labels from curated marker tables.
//! 5. Fit the tree and substitution antigenic models against the titers.
//! 6. Export JSON artifacts for downstream visualization.
//!
//! Alignment, tree building, and geographic inference are external
//! collaborators; this crate consumes their outputs via checkpoints.

pub mod bio;
pub mod cli;
pub mod config;
pub mod io;
pub mod pipeline;
pub mod seq;
pub mod titer;
pub mod tree;

pub use config::LineageConfig;
pub use seq::{SequenceCorpus, SequenceRecord};
pub use titer::{SubstitutionAntigenicModel, TiterTable, TreeAntigenicModel};
pub use tree::{NodeId, Tree};
