//! File input/output.
//!
//! Tab-separated loaders for the assay-coverage, titer and site-mask files,
//! the FASTA corpus loader (pipe-delimited header fields, gzip accepted),
//! the externally built tree checkpoint, and JSON artifact export.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use flate2::read::MultiGzDecoder;
use indexmap::IndexMap;
use log::info;
use serde::Serialize;

use crate::bio::distance::SiteMask;
use crate::config::ConfigError;
use crate::seq::{SequenceCorpus, SequenceRecord};
use crate::tree::Tree;

/// Open a file, transparently decompressing `.gz`.
fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>> {
    let file =
        File::open(path).with_context(|| format!("failed to open '{}'", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Load the assay-coverage file: `strain<TAB>count`, one row per strain.
pub fn load_coverage(path: &Path) -> Result<HashMap<String, usize>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open coverage file '{}'", path.display()))?;

    let mut counts = HashMap::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("bad coverage row at line {}", line + 1))?;
        let strain = row
            .get(0)
            .ok_or_else(|| anyhow!("coverage row {} is empty", line + 1))?
            .trim()
            .to_string();
        let count: usize = row
            .get(1)
            .ok_or_else(|| anyhow!("coverage row {} has no count", line + 1))?
            .trim()
            .parse()
            .with_context(|| format!("bad coverage count for strain '{strain}'"))?;
        counts.insert(strain, count);
    }
    info!(
        "loaded titer coverage for {} strains from {}",
        counts.len(),
        path.display()
    );
    Ok(counts)
}

/// Load the site-mask file: `mask-name<TAB>bitstring` per row.
pub fn load_masks(path: &Path) -> Result<IndexMap<String, SiteMask>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open mask file '{}'", path.display()))?;

    let mut masks = IndexMap::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("bad mask row at line {}", line + 1))?;
        let name = row
            .get(0)
            .ok_or_else(|| anyhow!("mask row {} is empty", line + 1))?
            .trim()
            .to_string();
        let bits = row
            .get(1)
            .ok_or_else(|| anyhow!("mask '{name}' has no bitstring"))?
            .trim();
        let mask = SiteMask::from_bitstring(bits)
            .with_context(|| format!("bad bitstring for mask '{name}'"))?;
        masks.insert(name, mask);
    }
    Ok(masks)
}

/// Pick one mask by name; unknown names are a configuration error that
/// aborts the run before any fitting begins.
pub fn select_mask(
    masks: &IndexMap<String, SiteMask>,
    name: &str,
) -> Result<SiteMask, ConfigError> {
    masks
        .get(name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownMask(name.to_string()))
}

/// Load the sequence corpus from FASTA. Header fields are `|`-delimited:
/// `strain|date|region|country|city`; missing trailing fields default to
/// empty. An optional sidecar JSON maps strain to per-gene translations.
pub fn load_corpus(fasta: &Path, translations: Option<&Path>) -> Result<SequenceCorpus> {
    let mut per_strain_translations: HashMap<String, IndexMap<String, String>> =
        match translations {
            Some(path) => {
                let file = File::open(path).with_context(|| {
                    format!("failed to open translations file '{}'", path.display())
                })?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("malformed translations file '{}'", path.display()))?
            }
            None => HashMap::new(),
        };

    let reader = bio::io::fasta::Reader::new(open_maybe_gz(fasta)?);
    let mut records = Vec::new();
    for result in reader.records() {
        let record =
            result.with_context(|| format!("bad FASTA record in '{}'", fasta.display()))?;
        let fields: Vec<&str> = record.id().split('|').collect();
        let strain = fields
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("FASTA record with empty strain name"))?
            .to_string();
        let date_str = fields
            .get(1)
            .ok_or_else(|| anyhow!("strain '{strain}' has no date field"))?;
        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
            .with_context(|| format!("bad date '{date_str}' for strain '{strain}'"))?;
        let field = |i: usize| fields.get(i).unwrap_or(&"").to_string();

        records.push(SequenceRecord {
            translations: per_strain_translations.remove(&strain).unwrap_or_default(),
            region: field(2),
            country: field(3),
            city: field(4),
            sequence: String::from_utf8_lossy(record.seq()).into_owned(),
            strain,
            date,
        });
    }
    if records.is_empty() {
        return Err(anyhow!("no sequences found in '{}'", fasta.display()));
    }
    info!("loaded {} sequences from {}", records.len(), fasta.display());
    Ok(SequenceCorpus::new(records))
}

/// Load the externally built tree checkpoint (a serialized [`Tree`]).
pub fn load_tree(path: &Path) -> Result<Tree> {
    let file =
        File::open(path).with_context(|| format!("failed to open tree '{}'", path.display()))?;
    let tree: Tree = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("malformed tree checkpoint '{}'", path.display()))?;
    if tree.is_empty() {
        return Err(anyhow!("tree checkpoint '{}' has no nodes", path.display()));
    }
    Ok(tree)
}

/// Write one JSON artifact, pretty-printed.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create '{}'", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("failed to create '{}'", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    info!("wrote {}", path.display());
    Ok(())
}
