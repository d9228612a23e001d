//! Injected pipeline configuration.
//!
//! Lineage-specific tables (gene order, clade signatures, receptor-binding
//! sites, region groupings) are plain data handed to component
//! constructors, never global state, so tests and per-lineage builds can
//! swap them freely. The built-in tables cover the four seasonal influenza
//! lineages; clade tables can be overridden from a JSON file.

use std::fs::File;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::bio::clades::{CladeTable, Marker};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown lineage '{0}'")]
    UnknownLineage(String),

    #[error("unknown epitope mask '{0}'")]
    UnknownMask(String),

    #[error("missing required file {path}: {source}")]
    MissingFile {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed clade table {path}: {reason}")]
    MalformedCladeTable { path: String, reason: String },
}

/// Peptide scoring parameters; only lineages with curated epitope masks and
/// receptor-binding sites carry one.
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    /// Name of the site mask to use from the mask file.
    pub mask_version: String,
    /// Receptor-binding sites in canonical HA1 numbering (Koel et al. 2014).
    pub receptor_binding_sites: Vec<usize>,
    /// Signal-peptide length prepended to the canonical numbering.
    pub signal_peptide_offset: usize,
}

/// Everything lineage-specific the pipeline needs.
#[derive(Debug, Clone)]
pub struct LineageConfig {
    pub name: String,
    /// Gene order defining the concatenated-peptide scheme.
    pub gene_order: Vec<String>,
    pub clades: CladeTable,
    /// Distance-scoring stage configuration; `None` skips the stage.
    pub scores: Option<ScoreConfig>,
}

impl LineageConfig {
    /// Built-in configuration for one of the seasonal flu lineages.
    pub fn builtin(lineage: &str) -> Result<Self, ConfigError> {
        let gene_order = vec![
            "SigPep".to_string(),
            "HA1".to_string(),
            "HA2".to_string(),
        ];
        match lineage {
            "h3n2" => Ok(LineageConfig {
                name: lineage.to_string(),
                gene_order,
                clades: h3n2_clades(),
                scores: Some(ScoreConfig {
                    mask_version: "wolf".to_string(),
                    receptor_binding_sites: vec![145, 155, 156, 158, 159, 189, 193],
                    signal_peptide_offset: 16,
                }),
            }),
            "h1n1pdm" => Ok(LineageConfig {
                name: lineage.to_string(),
                gene_order,
                clades: h1n1pdm_clades(),
                scores: None,
            }),
            "vic" => Ok(LineageConfig {
                name: lineage.to_string(),
                gene_order,
                clades: vic_clades(),
                scores: None,
            }),
            "yam" => Ok(LineageConfig {
                name: lineage.to_string(),
                gene_order,
                clades: yam_clades(),
                scores: None,
            }),
            other => Err(ConfigError::UnknownLineage(other.to_string())),
        }
    }
}

fn table(entries: &[(&str, &[(&str, usize, char)])]) -> CladeTable {
    entries
        .iter()
        .map(|(clade, markers)| {
            (
                clade.to_string(),
                markers
                    .iter()
                    .map(|&(gene, position, residue)| Marker::new(gene, position, residue))
                    .collect(),
            )
        })
        .collect()
}

/// H3N2 clade signatures. More-derived clades come first so overlapping
/// marker sets resolve to the most specific label.
fn h3n2_clades() -> CladeTable {
    table(&[
        ("3c3.a", &[("HA1", 128, 'A'), ("HA1", 142, 'G'), ("HA1", 159, 'S')]),
        ("3c3", &[("HA1", 128, 'A'), ("HA1", 142, 'G'), ("HA1", 159, 'F')]),
        (
            "171K",
            &[
                ("HA1", 144, 'S'),
                ("HA1", 159, 'Y'),
                ("HA1", 171, 'K'),
                ("HA1", 225, 'D'),
                ("HA1", 311, 'H'),
                ("HA2", 77, 'V'),
                ("HA2", 155, 'E'),
                ("HA2", 160, 'N'),
            ],
        ),
        (
            "3c2.a",
            &[
                ("HA1", 144, 'S'),
                ("HA1", 159, 'Y'),
                ("HA1", 225, 'D'),
                ("HA1", 311, 'H'),
                ("HA2", 160, 'N'),
            ],
        ),
        (
            "3c2",
            &[
                ("HA1", 144, 'N'),
                ("HA1", 159, 'F'),
                ("HA1", 225, 'N'),
                ("HA2", 160, 'N'),
                ("HA1", 142, 'R'),
            ],
        ),
        (
            "3c3.b",
            &[
                ("HA1", 83, 'R'),
                ("HA1", 261, 'Q'),
                ("HA1", 62, 'K'),
                ("HA1", 122, 'D'),
            ],
        ),
    ])
}

fn h1n1pdm_clades() -> CladeTable {
    table(&[
        (
            "6b.1",
            &[
                ("HA1", 163, 'Q'),
                ("HA1", 256, 'T'),
                ("HA1", 197, 'A'),
                ("HA1", 283, 'E'),
                ("SigPep", 13, 'T'),
                ("HA1", 84, 'N'),
                ("HA1", 162, 'N'),
            ],
        ),
        (
            "6b.2",
            &[
                ("HA1", 163, 'Q'),
                ("HA1", 256, 'T'),
                ("HA1", 197, 'A'),
                ("HA1", 283, 'E'),
                ("HA2", 164, 'G'),
                ("HA1", 152, 'T'),
                ("HA2", 174, 'E'),
            ],
        ),
        (
            "6b",
            &[("HA1", 163, 'Q'), ("HA1", 256, 'T'), ("HA1", 197, 'A'), ("HA1", 283, 'E')],
        ),
        (
            "6c",
            &[("HA1", 234, 'I'), ("HA1", 97, 'N'), ("HA1", 197, 'A'), ("HA1", 283, 'E')],
        ),
        ("6", &[("HA1", 185, 'T'), ("HA1", 97, 'N'), ("HA1", 197, 'A')]),
        ("7", &[("HA1", 143, 'G'), ("HA1", 97, 'D'), ("HA1", 197, 'T')]),
        ("8", &[("HA1", 186, 'T'), ("HA1", 272, 'A')]),
        (
            "2",
            &[
                ("HA1", 125, 'N'),
                ("HA1", 134, 'A'),
                ("HA1", 183, 'S'),
                ("HA1", 31, 'D'),
                ("HA1", 172, 'N'),
                ("HA1", 186, 'T'),
            ],
        ),
        ("3", &[("HA1", 134, 'T'), ("HA1", 183, 'P')]),
        ("4", &[("HA1", 125, 'D'), ("HA1", 134, 'A'), ("HA1", 183, 'S')]),
        (
            "5",
            &[("HA1", 87, 'N'), ("HA1", 205, 'K'), ("HA1", 216, 'V'), ("HA1", 149, 'L')],
        ),
    ])
}

fn vic_clades() -> CladeTable {
    table(&[
        (
            "117V",
            &[
                ("HA1", 75, 'K'),
                ("HA1", 58, 'L'),
                ("HA1", 165, 'K'),
                ("HA1", 129, 'D'),
                ("HA1", 117, 'V'),
            ],
        ),
        ("1A", &[("HA1", 75, 'K'), ("HA1", 58, 'L'), ("HA1", 165, 'K')]),
        ("1B", &[("HA1", 75, 'K'), ("HA1", 58, 'P'), ("HA1", 165, 'K')]),
    ])
}

fn yam_clades() -> CladeTable {
    table(&[
        (
            "172Q",
            &[
                ("HA1", 48, 'R'),
                ("HA1", 108, 'P'),
                ("HA1", 150, 'I'),
                ("HA1", 116, 'K'),
                ("HA1", 172, 'Q'),
            ],
        ),
        (
            "3a",
            &[
                ("HA1", 37, 'A'),
                ("HA1", 298, 'E'),
                ("HA1", 48, 'R'),
                ("HA1", 105, 'P'),
                ("HA1", 150, 'I'),
            ],
        ),
        ("2", &[("HA1", 48, 'K'), ("HA1", 108, 'A'), ("HA1", 150, 'S')]),
        ("3", &[("HA1", 48, 'R'), ("HA1", 108, 'P'), ("HA1", 150, 'I')]),
    ])
}

/// Region groupings used when compiling export metadata.
pub fn region_groups() -> IndexMap<&'static str, Vec<&'static str>> {
    IndexMap::from([
        ("NA", vec!["north_america"]),
        ("AS", vec!["china", "japan_korea", "south_asia", "southeast_asia"]),
        ("OC", vec!["oceania"]),
        ("EU", vec!["europe"]),
    ])
}

/// Attribute nesting hint for the exported metadata artifact.
pub fn attribute_nesting() -> IndexMap<&'static str, Vec<&'static str>> {
    IndexMap::from([("geographic location", vec!["region", "country", "city"])])
}

#[derive(Deserialize)]
struct RawMarker(String, usize, char);

/// Load a clade-table override: JSON mapping clade name to an ordered list
/// of `[gene, position, residue]` markers.
pub fn load_clade_table(path: &Path) -> Result<CladeTable, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::MissingFile {
        path: path.display().to_string(),
        source,
    })?;
    let raw: IndexMap<String, Vec<RawMarker>> =
        serde_json::from_reader(file).map_err(|e| ConfigError::MalformedCladeTable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(raw
        .into_iter()
        .map(|(clade, markers)| {
            (
                clade,
                markers
                    .into_iter()
                    .map(|RawMarker(gene, position, residue)| Marker {
                        gene,
                        position,
                        residue,
                    })
                    .collect(),
            )
        })
        .collect())
}
