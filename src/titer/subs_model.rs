//! Substitution-effect antigenic model.
//!
//! Same regression objective as the tree model, but the effect columns are
//! indexed by distinct (gene, position, from, to) amino-acid substitutions
//! rather than by branch identity. Substitutions are derived by diffing each
//! node's per-gene translation against its parent's; branches carrying the
//! same substitution share one column, so a recurring substitution is
//! forced to the same fitted effect everywhere it appears.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use log::{info, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::tree::{NodeId, Tree};

use super::solver::{self, ColumnLayout, SolverOptions};
use super::{
    advance, check_state, ModelError, ModelState, ObservedPredicted, TiterMeasurement,
    TiterTable, EFFECT_THRESHOLD,
};

/// One amino-acid substitution event, e.g. `HA1:K145N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Substitution {
    pub gene: String,
    /// 1-based position within the gene's translation.
    pub position: usize,
    pub from: char,
    pub to: char,
}

impl fmt::Display for Substitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}{}", self.gene, self.from, self.position, self.to)
    }
}

/// Substitutions on the branch above `id` (differences against the parent's
/// translations, per gene, truncated to the shorter translation).
pub fn branch_substitutions(tree: &Tree, id: NodeId) -> Vec<Substitution> {
    let node = tree.node(id);
    let Some(parent_id) = node.parent else {
        return Vec::new();
    };
    let parent = tree.node(parent_id);

    let mut subs = Vec::new();
    for (gene, child_peptide) in &node.translations {
        let Some(parent_peptide) = parent.translations.get(gene) else {
            continue;
        };
        for (i, (p, c)) in parent_peptide
            .bytes()
            .zip(child_peptide.bytes())
            .enumerate()
        {
            if p != c {
                subs.push(Substitution {
                    gene: gene.clone(),
                    position: i + 1,
                    from: p as char,
                    to: c as char,
                });
            }
        }
    }
    subs
}

/// Compiled substitution-model artifact, written as `titer_subs_model.json`.
#[derive(Debug, Clone, Serialize)]
pub struct SubsModelArtifact {
    pub potency: IndexMap<String, f64>,
    pub avidity: IndexMap<String, f64>,
    /// Substitution effects above [`EFFECT_THRESHOLD`].
    pub substitution: IndexMap<String, f64>,
}

struct MappedMeasurement {
    measurement: TiterMeasurement,
    /// Per-column substitution counts along the measurement's tree path.
    column_counts: Vec<(usize, f64)>,
}

pub struct SubstitutionAntigenicModel {
    state: ModelState,
    measurements: Vec<TiterMeasurement>,
    mapped: Vec<MappedMeasurement>,
    skipped: usize,
    substitutions: Vec<Substitution>,
    sera: Vec<String>,
    viruses: Vec<String>,
    design: Option<Array2<f64>>,
    targets: Option<Array1<f64>>,
    coefficients: Option<Array1<f64>>,
}

impl SubstitutionAntigenicModel {
    pub fn new(titers: &TiterTable) -> Self {
        SubstitutionAntigenicModel {
            state: ModelState::Unprepared,
            measurements: titers.measurements().to_vec(),
            mapped: Vec::new(),
            skipped: 0,
            substitutions: Vec::new(),
            sera: Vec::new(),
            viruses: Vec::new(),
            design: None,
            targets: None,
            coefficients: None,
        }
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Diff every branch, map measurements onto substitution columns, build
    /// the design matrix.
    pub fn prepare(&mut self, tree: &Tree) -> Result<(), ModelError> {
        check_state(self.state, ModelState::Unprepared)?;

        let name_index: HashMap<&str, NodeId> = tree
            .preorder()
            .into_iter()
            .filter_map(|id| tree.node(id).name.as_deref().map(|n| (n, id)))
            .collect();

        // Shared columns: identical substitutions on different branches map
        // to the same index.
        let mut per_branch: HashMap<NodeId, Vec<Substitution>> = HashMap::new();
        for id in tree.preorder() {
            per_branch.insert(id, branch_substitutions(tree, id));
        }
        let mut sub_index: IndexMap<Substitution, usize> = IndexMap::new();

        let mut serum_index: IndexMap<String, usize> = IndexMap::new();
        let mut virus_index: IndexMap<String, usize> = IndexMap::new();
        for m in &self.measurements {
            let Some(&virus_node) = name_index.get(m.virus.as_str()) else {
                warn!("skipping titer ({}, {}): test virus not in tree", m.virus, m.serum);
                self.skipped += 1;
                continue;
            };
            let Some(&serum_node) = name_index.get(m.serum.as_str()) else {
                warn!(
                    "skipping titer ({}, {}): serum reference virus not in tree",
                    m.virus, m.serum
                );
                self.skipped += 1;
                continue;
            };

            let mut counts: HashMap<usize, f64> = HashMap::new();
            for branch in tree.path_between(virus_node, serum_node) {
                for sub in &per_branch[&branch] {
                    let next = sub_index.len();
                    let col = *sub_index.entry(sub.clone()).or_insert(next);
                    *counts.entry(col).or_insert(0.0) += 1.0;
                }
            }
            let next = serum_index.len();
            serum_index.entry(m.serum.clone()).or_insert(next);
            let next = virus_index.len();
            virus_index.entry(m.virus.clone()).or_insert(next);

            let mut column_counts: Vec<(usize, f64)> = counts.into_iter().collect();
            column_counts.sort_unstable_by_key(|&(col, _)| col);
            self.mapped.push(MappedMeasurement {
                measurement: m.clone(),
                column_counts,
            });
        }
        if self.mapped.is_empty() {
            return Err(ModelError::NoUsableMeasurements);
        }

        let layout = ColumnLayout {
            n_effects: sub_index.len(),
            n_potency: serum_index.len(),
            n_avidity: virus_index.len(),
        };
        let mut design = Array2::<f64>::zeros((self.mapped.len(), layout.total()));
        let mut targets = Array1::<f64>::zeros(self.mapped.len());
        for (row, mm) in self.mapped.iter().enumerate() {
            for &(col, count) in &mm.column_counts {
                design[[row, col]] = count;
            }
            design[[row, layout.n_effects + serum_index[&mm.measurement.serum]]] = 1.0;
            design[[
                row,
                layout.n_effects + layout.n_potency + virus_index[&mm.measurement.virus],
            ]] = 1.0;
            targets[row] = mm.measurement.value;
        }

        self.substitutions = sub_index.keys().cloned().collect();
        self.sera = serum_index.keys().cloned().collect();
        self.viruses = virus_index.keys().cloned().collect();
        self.design = Some(design);
        self.targets = Some(targets);
        info!(
            "substitution model prepared: {} measurements ({} skipped), {} substitution columns",
            self.mapped.len(),
            self.skipped,
            self.substitutions.len()
        );
        advance(&mut self.state, ModelState::Unprepared, ModelState::Prepared)
    }

    fn layout(&self) -> ColumnLayout {
        ColumnLayout {
            n_effects: self.substitutions.len(),
            n_potency: self.sera.len(),
            n_avidity: self.viruses.len(),
        }
    }

    /// Run the solver. Unlike the tree model this writes nothing onto the
    /// tree; `dtiter`/`ctiter` stay owned by the branch model.
    pub fn train(&mut self, options: &SolverOptions) -> Result<(), ModelError> {
        check_state(self.state, ModelState::Prepared)?;
        let design = self.design.as_ref().expect("design built in prepare");
        let targets = self.targets.as_ref().expect("targets built in prepare");
        self.coefficients = Some(solver::fit(design, targets, &self.layout(), options)?);
        advance(&mut self.state, ModelState::Prepared, ModelState::Trained)
    }

    /// Fitted effect per substitution, shared across every branch carrying
    /// it.
    pub fn substitution_effects(&self) -> Result<IndexMap<String, f64>, ModelError> {
        self.require_trained()?;
        let coefficients = self.coefficients.as_ref().expect("trained");
        Ok(self
            .substitutions
            .iter()
            .enumerate()
            .map(|(col, sub)| (sub.to_string(), coefficients[col]))
            .collect())
    }

    pub fn compile_titers(&self) -> Result<Vec<ObservedPredicted>, ModelError> {
        self.require_trained()?;
        let design = self.design.as_ref().expect("design built in prepare");
        let coefficients = self.coefficients.as_ref().expect("trained");
        let predicted = design.dot(coefficients);
        Ok(self
            .mapped
            .iter()
            .zip(predicted.iter())
            .map(|(mm, &p)| ObservedPredicted {
                virus: mm.measurement.virus.clone(),
                serum: mm.measurement.serum.clone(),
                observed: mm.measurement.value,
                predicted: p,
            })
            .collect())
    }

    pub fn compile_potencies(&self) -> Result<IndexMap<String, f64>, ModelError> {
        self.require_trained()?;
        let coefficients = self.coefficients.as_ref().expect("trained");
        let layout = self.layout();
        Ok(self
            .sera
            .iter()
            .zip(layout.potency_range())
            .map(|(serum, col)| (serum.clone(), coefficients[col]))
            .collect())
    }

    pub fn compile_virus_effects(&self) -> Result<IndexMap<String, f64>, ModelError> {
        self.require_trained()?;
        let coefficients = self.coefficients.as_ref().expect("trained");
        let layout = self.layout();
        Ok(self
            .viruses
            .iter()
            .zip(layout.avidity_range())
            .map(|(virus, col)| (virus.clone(), coefficients[col]))
            .collect())
    }

    /// Full compiled artifact; transitions the model to its final state.
    pub fn compile(&mut self) -> Result<SubsModelArtifact, ModelError> {
        check_state(self.state, ModelState::Trained)?;
        let potency = self.compile_potencies()?;
        let avidity = self.compile_virus_effects()?;
        let substitution = self
            .substitution_effects()?
            .into_iter()
            .filter(|&(_, effect)| effect > EFFECT_THRESHOLD)
            .collect();
        advance(&mut self.state, ModelState::Trained, ModelState::Compiled)?;
        Ok(SubsModelArtifact {
            potency,
            avidity,
            substitution,
        })
    }

    fn require_trained(&self) -> Result<(), ModelError> {
        match self.state {
            ModelState::Trained | ModelState::Compiled => Ok(()),
            found => Err(ModelError::State {
                expected: ModelState::Trained,
                found,
            }),
        }
    }
}
