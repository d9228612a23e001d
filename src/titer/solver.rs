//! Constrained sparse regression.
//!
//! Minimizes `||Ax - b||^2 + lambda * sum(x_effect)` where the effect block
//! of `x` is constrained non-negative (so the penalty is an L1 term) and the
//! potency/avidity bias blocks are unconstrained and unpenalized. Solved by
//! proximal projected gradient descent with a fixed step from the Lipschitz
//! bound of the quadratic part; the problem is convex, so the iteration
//! converges to the global minimum or fails loudly.
//!
//! Potency and avidity are only identified up to an additive shift (raising
//! every potency and lowering every avidity by the same constant leaves all
//! predictions unchanged), so the solution is gauge-fixed afterwards: mean
//! avidity is forced to zero and the shift is moved into the potencies.

use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;

use super::ModelError;

/// Column layout of the design matrix: effect columns first, then one
/// potency column per serum, then one avidity column per virus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub n_effects: usize,
    pub n_potency: usize,
    pub n_avidity: usize,
}

impl ColumnLayout {
    pub fn total(&self) -> usize {
        self.n_effects + self.n_potency + self.n_avidity
    }

    pub fn potency_range(&self) -> std::ops::Range<usize> {
        self.n_effects..self.n_effects + self.n_potency
    }

    pub fn avidity_range(&self) -> std::ops::Range<usize> {
        self.n_effects + self.n_potency..self.total()
    }
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Weight of the L1 penalty on the effect block.
    pub sparsity_weight: f64,
    pub max_iterations: usize,
    /// Relative objective-decrease threshold declaring convergence.
    pub tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            sparsity_weight: 1.0,
            max_iterations: 100_000,
            tolerance: 1e-12,
        }
    }
}

/// Fit coefficients for `design * x ~ targets` under the layout's
/// constraints. Returns the gauge-fixed coefficient vector.
pub fn fit(
    design: &Array2<f64>,
    targets: &Array1<f64>,
    layout: &ColumnLayout,
    options: &SolverOptions,
) -> Result<Array1<f64>, ModelError> {
    let (rows, cols) = design.dim();
    if rows != targets.len() {
        return Err(ModelError::Dimension {
            rows,
            targets: targets.len(),
        });
    }
    debug_assert_eq!(cols, layout.total());
    if rows == 0 {
        return Err(ModelError::NoUsableMeasurements);
    }

    // Precompute the normal-equation pieces; every gradient step is then
    // O(cols^2) regardless of the number of measurements.
    let ata = gram_matrix(design);
    let atb = design.t().dot(targets);
    let btb = targets.dot(targets);

    let lipschitz = 2.0 * largest_eigenvalue(&ata);
    let mut x = Array1::<f64>::zeros(cols);
    if lipschitz <= f64::EPSILON {
        // Degenerate all-zero design; the zero vector is already optimal.
        return Ok(x);
    }
    let step = 1.0 / lipschitz;
    let lambda = options.sparsity_weight;

    let objective = |x: &Array1<f64>| -> f64 {
        let quad = x.dot(&ata.dot(x)) - 2.0 * atb.dot(x) + btb;
        let penalty: f64 = x.slice(ndarray::s![..layout.n_effects]).sum();
        quad + lambda * penalty
    };

    let mut prev_objective = objective(&x);
    let mut converged = false;
    let mut iterations = 0;
    for iter in 0..options.max_iterations {
        iterations = iter + 1;
        let gradient = 2.0 * (ata.dot(&x) - &atb);
        x -= &(step * &gradient);
        // Proximal step for the penalized, sign-constrained effect block.
        for xi in x.slice_mut(ndarray::s![..layout.n_effects]).iter_mut() {
            *xi = (*xi - step * lambda).max(0.0);
        }

        let current = objective(&x);
        if !current.is_finite() {
            return Err(ModelError::Convergence {
                iterations,
                objective: current,
            });
        }
        if (prev_objective - current).abs() <= options.tolerance * prev_objective.abs().max(1.0) {
            converged = true;
            prev_objective = current;
            break;
        }
        prev_objective = current;
    }

    if !converged {
        return Err(ModelError::Convergence {
            iterations,
            objective: prev_objective,
        });
    }
    debug!(
        "solver converged after {} iterations, objective {:.6e}",
        iterations, prev_objective
    );

    fix_gauge(&mut x, layout);
    Ok(x)
}

/// `A^T A`, rows computed in parallel; this is the only super-linear piece
/// of the solve.
fn gram_matrix(design: &Array2<f64>) -> Array2<f64> {
    let transposed = design.t();
    let cols = design.ncols();
    let rows: Vec<Array1<f64>> = (0..cols)
        .into_par_iter()
        .map(|i| transposed.row(i).dot(design))
        .collect();
    let views: Vec<ArrayView1<f64>> = rows.iter().map(Array1::view).collect();
    ndarray::stack(Axis(0), &views).expect("rows share the gram matrix width")
}

/// Largest eigenvalue of a symmetric PSD matrix by power iteration.
fn largest_eigenvalue(matrix: &Array2<f64>) -> f64 {
    let n = matrix.nrows();
    let mut v = Array1::<f64>::ones(n);
    let mut eigenvalue = 0.0;
    for _ in 0..100 {
        let next = matrix.dot(&v);
        let norm = next.dot(&next).sqrt();
        if norm <= f64::EPSILON {
            return 0.0;
        }
        eigenvalue = norm / v.dot(&v).sqrt().max(f64::EPSILON);
        v = next / norm;
    }
    // v is now unit-norm; the Rayleigh quotient is the tight estimate.
    eigenvalue.max(v.dot(&matrix.dot(&v)))
}

/// Shift the potency/avidity gauge so the mean avidity is zero.
fn fix_gauge(x: &mut Array1<f64>, layout: &ColumnLayout) {
    if layout.n_avidity == 0 || layout.n_potency == 0 {
        return;
    }
    let avidity_mean =
        x.slice(ndarray::s![layout.avidity_range()]).sum() / layout.n_avidity as f64;
    for i in layout.avidity_range() {
        x[i] -= avidity_mean;
    }
    for i in layout.potency_range() {
        x[i] += avidity_mean;
    }
}
