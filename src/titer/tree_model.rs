//! Branch-effect antigenic model.
//!
//! Each titer measurement is explained by the sum of effects of every
//! branch on the tree path between the test virus and the reference serum's
//! virus, plus a per-serum potency and a per-virus avidity. Branch effects
//! are non-negative and L1-penalized, so most branches end up with zero
//! effect and antigenic change concentrates on a few branches.
//!
//! After training, every node's `dtiter` is set from its branch coefficient
//! and `ctiter` is filled as the root-to-node prefix sum in one preorder
//! pass, maintaining `ctiter(node) == ctiter(parent) + dtiter(node)` with
//! `ctiter(root) == 0`.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::{info, warn};
use ndarray::{Array1, Array2};
use serde::Serialize;

use crate::tree::{NodeId, Tree};

use super::solver::{self, ColumnLayout, SolverOptions};
use super::{
    advance, check_state, ModelError, ModelState, ObservedPredicted, TiterMeasurement,
    TiterTable, EFFECT_THRESHOLD,
};

/// Compiled tree-model artifact, written as `titer_tree_model.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TreeModelArtifact {
    pub potency: IndexMap<String, f64>,
    pub avidity: IndexMap<String, f64>,
    /// Branch effects above [`EFFECT_THRESHOLD`], keyed by branch (child
    /// node) label.
    pub dtiter: IndexMap<String, f64>,
}

/// One measurement mapped onto the tree.
struct MappedMeasurement {
    measurement: TiterMeasurement,
    branches: Vec<NodeId>,
}

pub struct TreeAntigenicModel {
    state: ModelState,
    measurements: Vec<TiterMeasurement>,
    mapped: Vec<MappedMeasurement>,
    /// Measurements whose virus or serum has no node in the tree.
    skipped: usize,
    branch_columns: Vec<NodeId>,
    sera: Vec<String>,
    viruses: Vec<String>,
    design: Option<Array2<f64>>,
    targets: Option<Array1<f64>>,
    coefficients: Option<Array1<f64>>,
}

impl TreeAntigenicModel {
    pub fn new(titers: &TiterTable) -> Self {
        TreeAntigenicModel {
            state: ModelState::Unprepared,
            measurements: titers.measurements().to_vec(),
            mapped: Vec::new(),
            skipped: 0,
            branch_columns: Vec::new(),
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

    /// Number of measurements dropped because they could not be mapped onto
    /// the tree.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Map measurements onto tree paths and build the design matrix.
    pub fn prepare(&mut self, tree: &Tree) -> Result<(), ModelError> {
        check_state(self.state, ModelState::Unprepared)?;

        let name_index: HashMap<&str, NodeId> = tree
            .preorder()
            .into_iter()
            .filter_map(|id| tree.node(id).name.as_deref().map(|n| (n, id)))
            .collect();

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
            self.mapped.push(MappedMeasurement {
                measurement: m.clone(),
                branches: tree.path_between(virus_node, serum_node),
            });
        }
        if self.mapped.is_empty() {
            return Err(ModelError::NoUsableMeasurements);
        }

        // Columns: branches present in at least one path, then sera, then
        // test viruses, in first-seen order.
        let mut branch_index: IndexMap<NodeId, usize> = IndexMap::new();
        let mut serum_index: IndexMap<String, usize> = IndexMap::new();
        let mut virus_index: IndexMap<String, usize> = IndexMap::new();
        for mm in &self.mapped {
            for &branch in &mm.branches {
                let next = branch_index.len();
                branch_index.entry(branch).or_insert(next);
            }
            let next = serum_index.len();
            serum_index.entry(mm.measurement.serum.clone()).or_insert(next);
            let next = virus_index.len();
            virus_index.entry(mm.measurement.virus.clone()).or_insert(next);
        }

        let layout = ColumnLayout {
            n_effects: branch_index.len(),
            n_potency: serum_index.len(),
            n_avidity: virus_index.len(),
        };
        let mut design = Array2::<f64>::zeros((self.mapped.len(), layout.total()));
        let mut targets = Array1::<f64>::zeros(self.mapped.len());
        for (row, mm) in self.mapped.iter().enumerate() {
            for &branch in &mm.branches {
                design[[row, branch_index[&branch]]] = 1.0;
            }
            design[[row, layout.n_effects + serum_index[&mm.measurement.serum]]] = 1.0;
            design[[
                row,
                layout.n_effects + layout.n_potency + virus_index[&mm.measurement.virus],
            ]] = 1.0;
            targets[row] = mm.measurement.value;
        }

        self.branch_columns = branch_index.keys().copied().collect();
        self.sera = serum_index.keys().cloned().collect();
        self.viruses = virus_index.keys().cloned().collect();
        self.design = Some(design);
        self.targets = Some(targets);
        info!(
            "tree model prepared: {} measurements ({} skipped), {} branch columns, {} sera, {} viruses",
            self.mapped.len(),
            self.skipped,
            self.branch_columns.len(),
            self.sera.len(),
            self.viruses.len()
        );
        advance(&mut self.state, ModelState::Unprepared, ModelState::Prepared)
    }

    fn layout(&self) -> ColumnLayout {
        ColumnLayout {
            n_effects: self.branch_columns.len(),
            n_potency: self.sera.len(),
            n_avidity: self.viruses.len(),
        }
    }

    /// Run the solver and write `dtiter`/`ctiter` annotations back onto the
    /// tree. A model instance trains at most once.
    pub fn train(&mut self, tree: &mut Tree, options: &SolverOptions) -> Result<(), ModelError> {
        check_state(self.state, ModelState::Prepared)?;
        let design = self.design.as_ref().expect("design built in prepare");
        let targets = self.targets.as_ref().expect("targets built in prepare");
        let coefficients = solver::fit(design, targets, &self.layout(), options)?;

        // Branch effects onto the annotations, zero for branches absent
        // from every path, then the prefix sum top-down.
        let effect_of: HashMap<NodeId, f64> = self
            .branch_columns
            .iter()
            .enumerate()
            .map(|(col, &node)| (node, coefficients[col]))
            .collect();
        let root = tree.root();
        for id in tree.preorder() {
            let dtiter = if id == root {
                0.0
            } else {
                effect_of.get(&id).copied().unwrap_or(0.0)
            };
            let parent_ctiter = tree
                .node(id)
                .parent
                .map(|p| tree.node(p).annot.ctiter.expect("parent visited first"))
                .unwrap_or(0.0);
            let annot = &mut tree.node_mut(id).annot;
            annot.dtiter = Some(dtiter);
            annot.ctiter = Some(parent_ctiter + dtiter);
        }

        self.coefficients = Some(coefficients);
        advance(&mut self.state, ModelState::Prepared, ModelState::Trained)
    }

    /// Observed vs. predicted titer for every fitted measurement.
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
    pub fn compile(&mut self, tree: &Tree) -> Result<TreeModelArtifact, ModelError> {
        check_state(self.state, ModelState::Trained)?;
        let potency = self.compile_potencies()?;
        let avidity = self.compile_virus_effects()?;
        let coefficients = self.coefficients.as_ref().expect("trained");

        let mut dtiter = IndexMap::new();
        for (col, &node) in self.branch_columns.iter().enumerate() {
            let effect = coefficients[col];
            if effect > EFFECT_THRESHOLD {
                dtiter.insert(branch_label(tree, node), effect);
            }
        }

        advance(&mut self.state, ModelState::Trained, ModelState::Compiled)?;
        Ok(TreeModelArtifact {
            potency,
            avidity,
            dtiter,
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

/// Stable label for a branch: the child node's name, or its arena index for
/// unnamed internal nodes.
pub(crate) fn branch_label(tree: &Tree, id: NodeId) -> String {
    tree.node(id)
        .name
        .clone()
        .unwrap_or_else(|| format!("NODE_{:07}", id.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// root -> (A, B, X -> (C, D)); the X branch carries the antigenic
    /// jump.
    fn four_leaf_tree() -> (Tree, NodeId) {
        let mut tree = Tree::with_root(Some("root".to_string()));
        let root = tree.root();
        tree.add_child(root, Some("A".to_string()), 1.0);
        tree.add_child(root, Some("B".to_string()), 1.0);
        let x = tree.add_child(root, Some("X".to_string()), 1.0);
        tree.add_child(x, Some("C".to_string()), 1.0);
        tree.add_child(x, Some("D".to_string()), 1.0);
        (tree, x)
    }

    /// Noiseless titers: potency(serum) + avidity(virus), plus 2.0 when the
    /// pair's path crosses the X branch. Sera reference viruses A and C.
    fn noiseless_titers() -> TiterTable {
        let potency = [("A", 0.5), ("C", -0.3)];
        let avidity = [("A", 0.2), ("B", -0.2), ("C", 0.1), ("D", -0.1)];
        let crosses_x = |virus: &str, serum: &str| match serum {
            "A" => virus == "C" || virus == "D",
            "C" => virus == "A" || virus == "B",
            _ => unreachable!(),
        };
        let mut measurements = Vec::new();
        for (serum, p) in potency {
            for (virus, a) in avidity {
                let jump = if crosses_x(virus, serum) { 2.0 } else { 0.0 };
                measurements.push(TiterMeasurement {
                    virus: virus.to_string(),
                    serum: serum.to_string(),
                    value: p + a + jump,
                });
            }
        }
        TiterTable::new(measurements)
    }

    fn fit_options() -> SolverOptions {
        SolverOptions {
            sparsity_weight: 1e-4,
            ..SolverOptions::default()
        }
    }

    #[test]
    fn recovers_designated_branch_effect() {
        let (mut tree, x) = four_leaf_tree();
        let mut model = TreeAntigenicModel::new(&noiseless_titers());
        model.prepare(&tree).unwrap();
        model.train(&mut tree, &fit_options()).unwrap();

        assert_abs_diff_eq!(tree.node(x).annot.dtiter.unwrap(), 2.0, epsilon = 1e-3);
        for id in tree.preorder() {
            if id == x || id == tree.root() {
                continue;
            }
            assert_abs_diff_eq!(tree.node(id).annot.dtiter.unwrap(), 0.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn ctiter_is_prefix_sum_of_dtiter() {
        let (mut tree, _x) = four_leaf_tree();
        let mut model = TreeAntigenicModel::new(&noiseless_titers());
        model.prepare(&tree).unwrap();
        model.train(&mut tree, &fit_options()).unwrap();

        assert_abs_diff_eq!(tree.node(tree.root()).annot.ctiter.unwrap(), 0.0);
        for id in tree.preorder() {
            let node = tree.node(id);
            if let Some(parent) = node.parent {
                let expected = tree.node(parent).annot.ctiter.unwrap() + node.annot.dtiter.unwrap();
                assert_abs_diff_eq!(node.annot.ctiter.unwrap(), expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn branch_effects_are_non_negative() {
        let (mut tree, _x) = four_leaf_tree();
        let mut model = TreeAntigenicModel::new(&noiseless_titers());
        model.prepare(&tree).unwrap();
        model.train(&mut tree, &fit_options()).unwrap();
        for id in tree.preorder() {
            assert!(tree.node(id).annot.dtiter.unwrap() >= 0.0);
        }
    }

    #[test]
    fn compiled_artifact_filters_noise_effects() {
        let (mut tree, x) = four_leaf_tree();
        let mut model = TreeAntigenicModel::new(&noiseless_titers());
        model.prepare(&tree).unwrap();
        model.train(&mut tree, &fit_options()).unwrap();
        let artifact = model.compile(&tree).unwrap();

        assert!(artifact.dtiter.contains_key(&branch_label(&tree, x)));
        // Only the designated branch carries signal.
        assert_eq!(artifact.dtiter.len(), 1);
        assert_eq!(artifact.potency.len(), 2);
        assert_eq!(artifact.avidity.len(), 4);
        // Gauge: avidities average to zero.
        let mean: f64 = artifact.avidity.values().sum::<f64>() / artifact.avidity.len() as f64;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn predictions_match_observations_on_noiseless_data() {
        let (mut tree, _x) = four_leaf_tree();
        let mut model = TreeAntigenicModel::new(&noiseless_titers());
        model.prepare(&tree).unwrap();
        model.train(&mut tree, &fit_options()).unwrap();
        for op in model.compile_titers().unwrap() {
            assert_abs_diff_eq!(op.observed, op.predicted, epsilon = 1e-3);
        }
    }

    #[test]
    fn unknown_strains_are_skipped_not_fatal() {
        let (tree, _x) = four_leaf_tree();
        let mut titers = noiseless_titers().measurements().to_vec();
        titers.push(TiterMeasurement {
            virus: "not-in-tree".to_string(),
            serum: "A".to_string(),
            value: 1.0,
        });
        let mut model = TreeAntigenicModel::new(&TiterTable::new(titers));
        model.prepare(&tree).unwrap();
        assert_eq!(model.skipped(), 1);
    }

    #[test]
    fn lifecycle_violations_are_state_errors() {
        let (mut tree, _x) = four_leaf_tree();
        let mut model = TreeAntigenicModel::new(&noiseless_titers());

        // Train before prepare.
        assert!(matches!(
            model.train(&mut tree, &fit_options()),
            Err(ModelError::State { .. })
        ));

        model.prepare(&tree).unwrap();
        // Compile before train.
        assert!(matches!(model.compile(&tree), Err(ModelError::State { .. })));

        model.train(&mut tree, &fit_options()).unwrap();
        // Double train.
        assert!(matches!(
            model.train(&mut tree, &fit_options()),
            Err(ModelError::State { .. })
        ));

        model.compile(&tree).unwrap();
        // Double compile.
        assert!(matches!(model.compile(&tree), Err(ModelError::State { .. })));
    }

    #[test]
    fn no_mappable_measurements_is_an_error() {
        let (tree, _x) = four_leaf_tree();
        let titers = TiterTable::new(vec![TiterMeasurement {
            virus: "ghost".to_string(),
            serum: "phantom".to_string(),
            value: 1.0,
        }]);
        let mut model = TreeAntigenicModel::new(&titers);
        assert!(matches!(
            model.prepare(&tree),
            Err(ModelError::NoUsableMeasurements)
        ));
    }
}
