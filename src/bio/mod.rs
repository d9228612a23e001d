//! Peptide-level sequence utilities.
//!
//! Groups the genetic-distance scorer (epitope / non-epitope /
//! receptor-binding divergence from the tree root) and the clade-signature
//! matcher (marker-mutation lookup tables).

pub mod clades;
pub mod distance;

pub use clades::{CladeTable, Marker, UNASSIGNED};
pub use distance::{DistanceScorer, SiteDistances, SiteMask};
