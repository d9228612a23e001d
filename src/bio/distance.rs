//! Genetic distance scoring against the tree root.
//!
//! Distances are positional mismatch counts over the concatenated peptide
//! (gene translations joined in the lineage's fixed gene order), split three
//! ways: positions flagged by a site mask (epitope), positions not flagged
//! (non-epitope), and a small fixed set of receptor-binding positions in
//! canonical reference numbering with a signal-peptide offset applied.
//! Ambiguous and gap symbols are compared like any other residue.

use log::info;
use thiserror::Error;

use crate::tree::Tree;

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("mask bitstring contains '{0}', expected only '0' and '1'")]
    InvalidSymbol(char),

    #[error("mask bitstring is empty")]
    Empty,
}

/// Boolean site mask parsed from a `0`/`1` bitstring, one flag per peptide
/// position. `true` marks a site of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteMask {
    flags: Vec<bool>,
}

impl SiteMask {
    pub fn from_bitstring(bits: &str) -> Result<Self, MaskError> {
        if bits.is_empty() {
            return Err(MaskError::Empty);
        }
        let flags = bits
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(MaskError::InvalidSymbol(other)),
            })
            .collect::<Result<Vec<bool>, MaskError>>()?;
        Ok(SiteMask { flags })
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn flags(&self) -> &[bool] {
        &self.flags
    }
}

/// Epitope, non-epitope and receptor-binding distances for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteDistances {
    pub epitope: u32,
    pub non_epitope: u32,
    pub receptor_binding: u32,
}

/// Scores query peptides against a fixed root peptide.
pub struct DistanceScorer {
    root_peptide: Vec<u8>,
    mask: SiteMask,
    /// Receptor-binding sites in canonical (1-based) reference numbering.
    receptor_binding_sites: Vec<usize>,
    /// Signal-peptide length prepended to the canonical numbering.
    signal_peptide_offset: usize,
}

impl DistanceScorer {
    pub fn new(
        root_peptide: &str,
        mask: SiteMask,
        receptor_binding_sites: &[usize],
        signal_peptide_offset: usize,
    ) -> Self {
        DistanceScorer {
            root_peptide: root_peptide.as_bytes().to_vec(),
            mask,
            receptor_binding_sites: receptor_binding_sites.to_vec(),
            signal_peptide_offset,
        }
    }

    /// All three distances for `peptide`. Distances to the root peptide
    /// itself are zero.
    pub fn score(&self, peptide: &str) -> SiteDistances {
        let query = peptide.as_bytes();
        // Masked/unmasked comparison truncates to the shortest of the two
        // peptides and the mask.
        let compared = self
            .root_peptide
            .len()
            .min(query.len())
            .min(self.mask.len());

        let mut epitope = 0;
        let mut non_epitope = 0;
        for i in 0..compared {
            if self.root_peptide[i] != query[i] {
                if self.mask.flags()[i] {
                    epitope += 1;
                } else {
                    non_epitope += 1;
                }
            }
        }

        let mut receptor_binding = 0;
        for &site in &self.receptor_binding_sites {
            // Canonical numbering is 1-based and excludes the signal peptide.
            let idx = site + self.signal_peptide_offset - 1;
            if idx < self.root_peptide.len() && idx < query.len() && self.root_peptide[idx] != query[idx]
            {
                receptor_binding += 1;
            }
        }

        SiteDistances {
            epitope,
            non_epitope,
            receptor_binding,
        }
    }
}

/// Write `ep`, `ne` and `rb` annotations on every node, measured from the
/// root's concatenated peptide.
pub fn annotate_distances(
    tree: &mut Tree,
    gene_order: &[String],
    mask: SiteMask,
    receptor_binding_sites: &[usize],
    signal_peptide_offset: usize,
) {
    let root_peptide = tree.total_peptide(tree.root(), gene_order);
    let scorer = DistanceScorer::new(
        &root_peptide,
        mask,
        receptor_binding_sites,
        signal_peptide_offset,
    );
    let order = tree.preorder();
    for id in &order {
        let peptide = tree.total_peptide(*id, gene_order);
        let distances = scorer.score(&peptide);
        let annot = &mut tree.node_mut(*id).annot;
        annot.ep = Some(distances.epitope);
        annot.ne = Some(distances.non_epitope);
        annot.rb = Some(distances.receptor_binding);
    }
    info!("annotated site distances on {} nodes", order.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(root: &str, bits: &str) -> DistanceScorer {
        DistanceScorer::new(root, SiteMask::from_bitstring(bits).unwrap(), &[], 0)
    }

    #[test]
    fn masked_and_unmasked_mismatches_split() {
        // Position 1 (masked) and position 3 (unmasked) differ.
        let s = scorer("ABCD", "1100");
        let d = s.score("AXCY");
        assert_eq!(d.epitope, 1);
        assert_eq!(d.non_epitope, 1);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let s = DistanceScorer::new(
            "MKTIIALSYI",
            SiteMask::from_bitstring("1010101010").unwrap(),
            &[2, 5],
            1,
        );
        let d = s.score("MKTIIALSYI");
        assert_eq!(
            d,
            SiteDistances {
                epitope: 0,
                non_epitope: 0,
                receptor_binding: 0
            }
        );
    }

    #[test]
    fn split_sums_to_hamming_distance() {
        let root = "ABCDEFG";
        let query = "AXCYEZG";
        let hamming = root
            .bytes()
            .zip(query.bytes())
            .filter(|(a, b)| a != b)
            .count() as u32;
        for bits in ["1111111", "0000000", "1010101", "0110010"] {
            let d = scorer(root, bits).score(query);
            assert_eq!(d.epitope + d.non_epitope, hamming, "mask {bits}");
        }
    }

    #[test]
    fn mask_longer_than_peptide_truncates() {
        let s = scorer("AB", "1111");
        let d = s.score("AXXX");
        // Only two positions are compared.
        assert_eq!(d.epitope, 1);
        assert_eq!(d.non_epitope, 0);
    }

    #[test]
    fn ambiguous_symbols_count_as_mismatch() {
        let s = scorer("ABCD", "1111");
        let d = s.score("AB-X");
        assert_eq!(d.epitope, 2);
    }

    #[test]
    fn receptor_binding_uses_offset_numbering() {
        // Canonical site 2 with offset 3 lands on index 4.
        let root = "AAAABAA";
        let query = "AAAACAA";
        let s = DistanceScorer::new(root, SiteMask::from_bitstring("0000000").unwrap(), &[2], 3);
        assert_eq!(s.score(query).receptor_binding, 1);
        // A site past the end of either peptide is skipped.
        let s = DistanceScorer::new(root, SiteMask::from_bitstring("0000000").unwrap(), &[99], 3);
        assert_eq!(s.score(query).receptor_binding, 0);
    }

    #[test]
    fn bitstring_rejects_foreign_symbols() {
        assert!(SiteMask::from_bitstring("0102").is_err());
        assert!(SiteMask::from_bitstring("").is_err());
    }
}
