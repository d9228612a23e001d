//! Command-line surface.
//!
//! Arguments are parsed here and resolved into a [`PipelineConfig`]; the
//! binary itself stays a thin wrapper around [`run_cli`].

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::Parser;
use log::info;

use crate::pipeline::{DriftPipeline, PipelineConfig};

/// Infer antigenic drift from titer measurements on a phylogeny.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Influenza lineage to process (h3n2, h1n1pdm, vic, yam).
    #[arg(long, default_value = "h3n2")]
    pub lineage: String,

    /// Build resolution label, used in artifact file names (e.g. "3y").
    #[arg(long, default_value = "3y")]
    pub resolution: String,

    /// Input FASTA of nucleotide sequences; `.gz` is handled transparently.
    #[arg(long)]
    pub sequences: PathBuf,

    /// JSON sidecar with per-strain peptide translations.
    #[arg(long)]
    pub translations: Option<PathBuf>,

    /// Tab-separated strain-to-titer-count table used for subsampling priority.
    #[arg(long)]
    pub coverage: PathBuf,

    /// Tab-separated titer measurements (virus, serum, value...).
    #[arg(long)]
    pub titers: PathBuf,

    /// Tab-separated table of named site masks (name, bitstring).
    #[arg(long)]
    pub masks: Option<PathBuf>,

    /// Tree checkpoint produced by the alignment/tree-building steps.
    #[arg(long)]
    pub tree: PathBuf,

    /// JSON clade table overriding the built-in definitions.
    #[arg(long)]
    pub clade_table: Option<PathBuf>,

    /// Directory for stage checkpoints.
    #[arg(long, default_value = "store")]
    pub store_dir: PathBuf,

    /// Directory for exported artifacts.
    #[arg(long, default_value = "build")]
    pub build_dir: PathBuf,

    /// Subsampling cap per (region, year, month) bucket.
    #[arg(long, default_value_t = 50)]
    pub viruses_per_month: usize,

    /// L1 penalty applied to branch and substitution effects.
    #[arg(long, default_value_t = 1.0)]
    pub sparsity_weight: f64,

    /// Site-mask name overriding the lineage default.
    #[arg(long)]
    pub mask_version: Option<String>,

    /// Keep only sequences sampled on or after this date (YYYY-MM-DD).
    #[arg(long)]
    pub min_date: Option<String>,

    /// Keep only sequences sampled before this date (YYYY-MM-DD).
    #[arg(long)]
    pub max_date: Option<String>,

    /// Strain names to exclude before subsampling.
    #[arg(long, value_delimiter = ',')]
    pub dropped_strains: Vec<String>,

    /// Resume from the stage checkpoint instead of the raw inputs.
    #[arg(long)]
    pub resume: bool,
}

impl Cli {
    /// Resolve parsed arguments into the pipeline configuration.
    pub fn into_config(self) -> Result<PipelineConfig> {
        let time_interval = match (&self.min_date, &self.max_date) {
            (Some(min), Some(max)) => {
                let start = parse_date(min)?;
                let end = parse_date(max)?;
                if start >= end {
                    bail!("--min-date {start} must precede --max-date {end}");
                }
                Some((start, end))
            }
            (None, None) => None,
            _ => bail!("--min-date and --max-date must be given together"),
        };
        Ok(PipelineConfig {
            lineage: self.lineage,
            resolution: self.resolution,
            sequences: self.sequences,
            translations: self.translations,
            coverage: self.coverage,
            titers: self.titers,
            masks: self.masks,
            tree: self.tree,
            clade_table: self.clade_table,
            store_dir: self.store_dir,
            build_dir: self.build_dir,
            viruses_per_month: self.viruses_per_month,
            sparsity_weight: self.sparsity_weight,
            mask_version: self.mask_version,
            time_interval,
            dropped_strains: self.dropped_strains,
            resume: self.resume,
        })
    }
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("bad date {text:?}: {e}"))
}

/// Main entry point for CLI.
pub fn run_cli(cli: Cli) -> Result<()> {
    info!("lineage {} resolution {}", cli.lineage, cli.resolution);
    let config = cli.into_config()?;
    let mut pipeline = DriftPipeline::new(config)?;
    pipeline.run()
}
