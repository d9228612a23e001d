//! Titer data and the two antigenic regression models.
//!
//! A titer measurement is the averaged log2 titer drop of one test virus
//! against one reference serum. The set is sparse and noisy; the two models
//! here explain it either by cumulative effects of tree branches
//! ([`tree_model::TreeAntigenicModel`]) or by recurring amino-acid
//! substitutions ([`subs_model::SubstitutionAntigenicModel`]), both fit with
//! the shared non-negative sparse solver in [`solver`].

pub mod solver;
pub mod subs_model;
pub mod tree_model;

use std::path::Path;

use indexmap::IndexMap;
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use subs_model::SubstitutionAntigenicModel;
pub use tree_model::TreeAntigenicModel;

#[derive(Error, Debug)]
pub enum TiterError {
    #[error("failed to read titer table {path}: {source}")]
    Read {
        path: String,
        source: csv::Error,
    },

    #[error("malformed titer value '{value}' for pair ({virus}, {serum})")]
    BadValue {
        virus: String,
        serum: String,
        value: String,
    },

    #[error("titer row with fewer than 3 fields: {0:?}")]
    ShortRow(Vec<String>),

    #[error("titer table {0} contains no measurements")]
    EmptyTable(String),
}

/// Errors raised by the antigenic models and their solver.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Lifecycle violation (compile before train, double train, ...).
    /// Always a programming error in the caller.
    #[error("model is {found:?} but the operation requires {expected:?}")]
    State {
        expected: ModelState,
        found: ModelState,
    },

    #[error("solver did not converge after {iterations} iterations (objective {objective:.6e})")]
    Convergence { iterations: usize, objective: f64 },

    #[error("design matrix has {rows} rows but {targets} target values")]
    Dimension { rows: usize, targets: usize },

    #[error("no titer measurement could be mapped onto the tree")]
    NoUsableMeasurements,
}

/// Model lifecycle. Each stage may run exactly once, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    Unprepared,
    Prepared,
    Trained,
    Compiled,
}

pub(crate) fn check_state(found: ModelState, expected: ModelState) -> Result<(), ModelError> {
    if found == expected {
        Ok(())
    } else {
        Err(ModelError::State { expected, found })
    }
}

/// Check the current state and advance it; both models share this lifecycle.
pub(crate) fn advance(
    state: &mut ModelState,
    from: ModelState,
    to: ModelState,
) -> Result<(), ModelError> {
    check_state(*state, from)?;
    *state = to;
    Ok(())
}

/// Averaged log2 titer drop for one (test virus, reference serum) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiterMeasurement {
    pub virus: String,
    pub serum: String,
    pub value: f64,
}

/// The loaded, replicate-averaged titer table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiterTable {
    measurements: Vec<TiterMeasurement>,
}

impl TiterTable {
    pub fn new(measurements: Vec<TiterMeasurement>) -> Self {
        TiterTable { measurements }
    }

    /// Load a headerless tab-separated table: `virus<TAB>serum<TAB>value...`.
    ///
    /// Every numeric field after the two keys is a replicate, and repeated
    /// (virus, serum) rows contribute further replicates; all replicates for
    /// a pair are averaged arithmetically. Values are expected to be log2
    /// titer drops already.
    pub fn from_path(path: &Path) -> Result<Self, TiterError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|source| TiterError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let mut replicates: IndexMap<(String, String), Vec<f64>> = IndexMap::new();
        for row in reader.records() {
            let row = row.map_err(|source| TiterError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let fields: Vec<String> = row.iter().map(|f| f.trim().to_string()).collect();
            if fields.len() < 3 {
                return Err(TiterError::ShortRow(fields));
            }
            let virus = fields[0].clone();
            let serum = fields[1].clone();
            let values = replicates.entry((virus.clone(), serum.clone())).or_default();
            for raw in &fields[2..] {
                if raw.is_empty() {
                    continue;
                }
                let value: f64 = raw.parse().map_err(|_| TiterError::BadValue {
                    virus: virus.clone(),
                    serum: serum.clone(),
                    value: raw.clone(),
                })?;
                values.push(value);
            }
        }

        let measurements: Vec<TiterMeasurement> = replicates
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|((virus, serum), values)| TiterMeasurement {
                virus,
                serum,
                value: values.iter().sum::<f64>() / values.len() as f64,
            })
            .collect();

        if measurements.is_empty() {
            return Err(TiterError::EmptyTable(path.display().to_string()));
        }
        info!(
            "loaded {} averaged titer measurements from {}",
            measurements.len(),
            path.display()
        );
        Ok(TiterTable::new(measurements))
    }

    pub fn measurements(&self) -> &[TiterMeasurement] {
        &self.measurements
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Number of measurements per test-virus strain, the count feeding the
    /// subsampling priority.
    pub fn coverage_counts(&self) -> std::collections::HashMap<String, usize> {
        self.measurements.iter().map(|m| m.virus.clone()).counts()
    }
}

/// One observed/predicted pair in a compiled model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPredicted {
    pub virus: String,
    pub serum: String,
    pub observed: f64,
    pub predicted: f64,
}

/// Effects below this magnitude are solver noise, not signal, and are left
/// out of compiled artifacts.
pub const EFFECT_THRESHOLD: f64 = 1e-6;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::tempdir;

    fn write_titers(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("titers.tsv");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn replicate_columns_and_rows_are_averaged() {
        let (_dir, path) = write_titers("v1\ts1\t2.0\t4.0\nv1\ts1\t6.0\nv2\ts1\t1.0\n");
        let table = TiterTable::from_path(&path).unwrap();
        assert_eq!(table.len(), 2);
        let m = &table.measurements()[0];
        assert_eq!(m.virus, "v1");
        assert_relative_eq!(m.value, 4.0);
    }

    #[test]
    fn short_rows_are_rejected() {
        let (_dir, path) = write_titers("v1\ts1\n");
        assert!(matches!(
            TiterTable::from_path(&path),
            Err(TiterError::ShortRow(_))
        ));
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let (_dir, path) = write_titers("v1\ts1\tlow\n");
        assert!(matches!(
            TiterTable::from_path(&path),
            Err(TiterError::BadValue { .. })
        ));
    }

    #[test]
    fn coverage_counts_by_virus() {
        let (_dir, path) = write_titers("v1\ts1\t1.0\nv1\ts2\t2.0\nv2\ts1\t3.0\n");
        let table = TiterTable::from_path(&path).unwrap();
        let counts = table.coverage_counts();
        assert_eq!(counts.get("v1"), Some(&2));
        assert_eq!(counts.get("v2"), Some(&1));
    }

    #[test]
    fn state_check_reports_violation() {
        let err = check_state(ModelState::Unprepared, ModelState::Prepared).unwrap_err();
        assert!(matches!(err, ModelError::State { .. }));
    }
}
