//! The drift-inference pipeline.
//!
//! Stage order: load corpus -> filter -> subsample -> load tree checkpoint
//! -> annotate site distances -> assign clades -> fit tree model -> fit
//! substitution model -> export. Alignment and tree building happen outside
//! this crate; the tree arrives as a checkpoint produced by those steps.
//!
//! A solver convergence failure is fatal to that model's training stage
//! only: the other model and all earlier annotations are unaffected and
//! already checkpointed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::bio::clades::annotate_clades;
use crate::bio::distance::annotate_distances;
use crate::config::{self, LineageConfig};
use crate::io;
use crate::seq::subsample::{default_category, subsample, titer_priority};
use crate::seq::SequenceCorpus;
use crate::titer::solver::SolverOptions;
use crate::titer::{SubstitutionAntigenicModel, TiterTable, TreeAntigenicModel};
use crate::tree::Tree;

/// Everything the orchestrator needs, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub lineage: String,
    /// Build label, e.g. `3y`; part of every artifact file name.
    pub resolution: String,
    pub sequences: PathBuf,
    pub translations: Option<PathBuf>,
    pub coverage: PathBuf,
    pub titers: PathBuf,
    pub masks: Option<PathBuf>,
    pub tree: PathBuf,
    /// Clade-table override; built-in tables are used when absent.
    pub clade_table: Option<PathBuf>,
    pub store_dir: PathBuf,
    pub build_dir: PathBuf,
    pub viruses_per_month: usize,
    pub sparsity_weight: f64,
    /// Overrides the lineage's default mask name when set.
    pub mask_version: Option<String>,
    pub time_interval: Option<(NaiveDate, NaiveDate)>,
    pub dropped_strains: Vec<String>,
    /// Resume from the stage checkpoint instead of the raw inputs.
    pub resume: bool,
}

/// Checkpoint written between the annotation and fitting stages.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    corpus: SequenceCorpus,
    tree: Tree,
}

pub struct DriftPipeline {
    config: PipelineConfig,
    lineage: LineageConfig,
    corpus: Option<SequenceCorpus>,
    tree: Option<Tree>,
}

impl DriftPipeline {
    /// Resolve the lineage configuration; unknown lineages abort before any
    /// data is touched.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let mut lineage = LineageConfig::builtin(&config.lineage)?;
        if let Some(path) = &config.clade_table {
            lineage.clades = config::load_clade_table(path)?;
            info!("clade table overridden from {}", path.display());
        }
        if let (Some(version), Some(scores)) = (&config.mask_version, lineage.scores.as_mut()) {
            scores.mask_version = version.clone();
        }
        Ok(DriftPipeline {
            config,
            lineage,
            corpus: None,
            tree: None,
        })
    }

    /// Run every stage in order.
    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();
        if self.config.resume {
            self.load_checkpoint()?;
        } else {
            self.load_and_subsample()?;
            self.load_and_annotate_tree()?;
            self.dump_checkpoint()?;
        }
        self.fit_and_export()?;
        info!("pipeline finished in {:.1}s", started.elapsed().as_secs_f64());
        Ok(())
    }

    fn load_and_subsample(&mut self) -> Result<()> {
        let mut corpus =
            io::load_corpus(&self.config.sequences, self.config.translations.as_deref())?;
        if let Some((start, end)) = self.config.time_interval {
            corpus.filter_dates(start, end);
            info!("{} sequences inside [{start}, {end})", corpus.len());
        }
        if !self.config.dropped_strains.is_empty() {
            corpus.drop_strains(&self.config.dropped_strains);
        }

        let coverage = io::load_coverage(&self.config.coverage)?;
        let priority = titer_priority(&coverage);
        let selected: HashSet<String> = subsample(
            corpus.records(),
            default_category,
            self.config.viruses_per_month,
            priority,
        )
        .into_iter()
        .map(|r| r.strain.clone())
        .collect();
        corpus.retain_strains(&selected);
        info!(
            "subsampled corpus to {} sequences (cap {}/region/month)",
            corpus.len(),
            self.config.viruses_per_month
        );

        self.corpus = Some(corpus);
        Ok(())
    }

    fn load_and_annotate_tree(&mut self) -> Result<()> {
        let mut tree = io::load_tree(&self.config.tree)?;
        info!("loaded tree with {} nodes", tree.len());

        match (&self.lineage.scores, &self.config.masks) {
            (Some(scores), Some(mask_path)) => {
                let masks = io::load_masks(mask_path)?;
                let mask = io::select_mask(&masks, &scores.mask_version)?;
                annotate_distances(
                    &mut tree,
                    &self.lineage.gene_order,
                    mask,
                    &scores.receptor_binding_sites,
                    scores.signal_peptide_offset,
                );
            }
            (Some(_), None) => {
                warn!("lineage has score configuration but no mask file was given; skipping site distances");
            }
            (None, _) => {
                info!(
                    "no score configuration for lineage '{}'; skipping site distances",
                    self.lineage.name
                );
            }
        }

        annotate_clades(&mut tree, &self.lineage.clades);
        self.tree = Some(tree);
        Ok(())
    }

    fn fit_and_export(&mut self) -> Result<()> {
        let titers = TiterTable::from_path(&self.config.titers)?;
        let options = SolverOptions {
            sparsity_weight: self.config.sparsity_weight,
            ..SolverOptions::default()
        };
        let tree = self.tree.as_mut().context("tree stage has not run")?;

        // Tree model; its annotations feed the checkpoint and export.
        let mut tree_model = TreeAntigenicModel::new(&titers);
        tree_model.prepare(tree)?;
        if tree_model.skipped() > 0 {
            warn!(
                "tree model skipped {} unmappable measurements",
                tree_model.skipped()
            );
        }
        match tree_model.train(tree, &options) {
            Ok(()) => {
                let raw = tree_model.compile_titers()?;
                io::write_json(&raw, &self.artifact_path("titers.json"))?;
                let tree = self.tree.as_ref().expect("tree stage has run");
                let artifact = tree_model.compile(tree)?;
                io::write_json(&artifact, &self.artifact_path("titer_tree_model.json"))?;
            }
            Err(err) => error!("tree model training failed: {err}"),
        }

        // Substitution model; independent of the tree model's outcome.
        let tree = self.tree.as_ref().expect("tree stage has run");
        let mut subs_model = SubstitutionAntigenicModel::new(&titers);
        subs_model.prepare(tree)?;
        match subs_model.train(&options) {
            Ok(()) => {
                let artifact = subs_model.compile()?;
                io::write_json(&artifact, &self.artifact_path("titer_subs_model.json"))?;
            }
            Err(err) => error!("substitution model training failed: {err}"),
        }

        // Per-node annotation export plus the grouping metadata the
        // visualization layer nests attributes by.
        let annotations = self.compile_node_annotations();
        io::write_json(&annotations, &self.artifact_path("tree_annotations.json"))?;
        let meta = serde_json::json!({
            "lineage": self.config.lineage,
            "resolution": self.config.resolution,
            "region_groups": config::region_groups(),
            "attribute_nesting": config::attribute_nesting(),
        });
        io::write_json(&meta, &self.artifact_path("meta.json"))?;
        Ok(())
    }

    fn compile_node_annotations(&self) -> Vec<serde_json::Value> {
        let tree = self.tree.as_ref().expect("tree stage has run");
        tree.preorder()
            .into_iter()
            .map(|id| {
                let node = tree.node(id);
                serde_json::json!({
                    "name": node.name,
                    "cTiter": node.annot.ctiter,
                    "dTiter": node.annot.dtiter,
                    "ep": node.annot.ep,
                    "ne": node.annot.ne,
                    "rb": node.annot.rb,
                    "clade": node.annot.clade,
                })
            })
            .collect()
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.config.store_dir.join(format!(
            "{}_{}_checkpoint.json",
            self.config.lineage, self.config.resolution
        ))
    }

    fn artifact_path(&self, suffix: &str) -> PathBuf {
        self.config.build_dir.join(format!(
            "{}_{}_{suffix}",
            self.config.lineage, self.config.resolution
        ))
    }

    fn dump_checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint {
            corpus: self.corpus.clone().context("corpus stage has not run")?,
            tree: self.tree.clone().context("tree stage has not run")?,
        };
        io::write_json(&checkpoint, &self.checkpoint_path())
    }

    fn load_checkpoint(&mut self) -> Result<()> {
        let path = self.checkpoint_path();
        let file = std::fs::File::open(&path)
            .with_context(|| format!("no checkpoint at '{}'", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("malformed checkpoint '{}'", path.display()))?;
        info!(
            "resumed from checkpoint: {} sequences, {} tree nodes",
            checkpoint.corpus.len(),
            checkpoint.tree.len()
        );
        self.corpus = Some(checkpoint.corpus);
        self.tree = Some(checkpoint.tree);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lineage: &str) -> PipelineConfig {
        PipelineConfig {
            lineage: lineage.to_string(),
            resolution: "3y".to_string(),
            sequences: PathBuf::new(),
            translations: None,
            coverage: PathBuf::new(),
            titers: PathBuf::new(),
            masks: None,
            tree: PathBuf::new(),
            clade_table: None,
            store_dir: PathBuf::new(),
            build_dir: PathBuf::new(),
            viruses_per_month: 50,
            sparsity_weight: 1.0,
            mask_version: None,
            time_interval: None,
            dropped_strains: Vec::new(),
            resume: false,
        }
    }

    #[test]
    fn unknown_lineage_aborts_construction() {
        assert!(DriftPipeline::new(config("h9n9")).is_err());
    }

    #[test]
    fn mask_version_override_lands_in_score_config() {
        let mut cfg = config("h3n2");
        cfg.mask_version = Some("shih".to_string());
        let pipeline = DriftPipeline::new(cfg).unwrap();
        assert_eq!(pipeline.lineage.scores.as_ref().unwrap().mask_version, "shih");
    }
}
