// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Multinomial logistic regression fitted with L-BFGS.
//!
//! The objective is `mean(cross_entropy) + ||W||² / (2·C·n)`, which has the
//! same minimiser as `C·Σ cross_entropy + ||W||² / 2`. The intercept is not
//! penalised. With `warm_start` set, consecutive fits on the same classes
//! start from the previous solution, which is what makes regularisation
//! sweeps cheap.

use crate::{ContinualError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::VecDeque;
use tracing::debug;

const HISTORY: usize = 10;
const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

#[derive(Clone, Debug, PartialEq)]
pub struct LogisticRegression {
    /// Inverse regularisation strength.
    pub c: f64,
    pub max_iter: usize,
    /// Stop once the largest gradient entry falls below this.
    pub tol: f64,
    pub warm_start: bool,
    classes: Vec<usize>,
    coef: Option<Array2<f64>>,
    intercept: Option<Array1<f64>>,
    n_iter: usize,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl LogisticRegression {
    pub fn new(c: f64) -> Self {
        Self {
            c,
            max_iter: 100,
            tol: 1e-4,
            warm_start: false,
            classes: Vec::new(),
            coef: None,
            intercept: None,
            n_iter: 0,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_warm_start(mut self, warm_start: bool) -> Self {
        self.warm_start = warm_start;
        self
    }

    /// Sorted distinct labels seen by the last fit.
    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    /// `(classes, features)` weight matrix.
    pub fn coef(&self) -> Option<&Array2<f64>> {
        self.coef.as_ref()
    }

    pub fn intercept(&self) -> Option<&Array1<f64>> {
        self.intercept.as_ref()
    }

    /// Solver iterations used by the last fit.
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    pub fn is_fitted(&self) -> bool {
        self.coef.is_some()
    }

    pub fn fit(&mut self, x: ArrayView2<'_, f64>, y: &[usize]) -> Result<&mut Self> {
        if x.nrows() != y.len() {
            return Err(ContinualError::Shape(format!(
                "{} feature rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if y.is_empty() {
            return Err(ContinualError::empty_split("logistic train"));
        }
        if self.c.is_nan() || self.c <= 0.0 {
            return Err(ContinualError::InvalidArgument(format!(
                "C must be > 0 (got {})",
                self.c
            )));
        }

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let (k, d) = (classes.len(), x.ncols());

        if k == 1 {
            self.classes = classes;
            self.coef = Some(Array2::zeros((1, d)));
            self.intercept = Some(Array1::zeros(1));
            self.n_iter = 0;
            return Ok(self);
        }

        let targets: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or(0))
            .collect();

        let mut theta = vec![0.0; k * (d + 1)];
        let reuse = self.warm_start
            && self.classes == classes
            && self.coef.as_ref().map(|w| w.dim()) == Some((k, d));
        if reuse {
            if let (Some(w), Some(b)) = (&self.coef, &self.intercept) {
                for (slot, value) in theta.iter_mut().zip(w.iter().chain(b.iter())) {
                    *slot = *value;
                }
            }
        }

        let objective = Objective {
            x: x.view(),
            targets: &targets,
            k,
            d,
            alpha: 1.0 / (self.c * y.len() as f64),
        };
        let outcome = lbfgs(&objective, theta, self.max_iter, self.tol);
        debug!(
            c = self.c,
            iterations = outcome.iterations,
            converged = outcome.converged,
            loss = outcome.value,
            warm = reuse,
            "logistic fit"
        );

        let (w, b) = outcome.theta.split_at(k * d);
        self.coef = Some(
            Array2::from_shape_vec((k, d), w.to_vec())
                .map_err(|err| ContinualError::Shape(err.to_string()))?,
        );
        self.intercept = Some(Array1::from(b.to_vec()));
        self.classes = classes;
        self.n_iter = outcome.iterations;
        Ok(self)
    }

    /// Raw class scores `x·Wᵀ + b`, one column per entry of [`classes`](Self::classes).
    pub fn decision_function(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let (w, b) = match (&self.coef, &self.intercept) {
            (Some(w), Some(b)) => (w, b),
            _ => {
                return Err(ContinualError::InvalidArgument(
                    "logistic regression is not fitted".into(),
                ))
            }
        };
        if x.ncols() != w.ncols() {
            return Err(ContinualError::Shape(format!(
                "model was fitted on {} features, got {}",
                w.ncols(),
                x.ncols()
            )));
        }
        Ok(x.dot(&w.t()) + b)
    }

    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<usize>> {
        let scores = self.decision_function(x)?;
        Ok(scores
            .rows()
            .into_iter()
            .map(|row| self.classes[first_max(row)])
            .collect())
    }
}

fn first_max(row: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    for (idx, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = idx;
        }
    }
    best
}

struct Objective<'a> {
    x: ArrayView2<'a, f64>,
    targets: &'a [usize],
    k: usize,
    d: usize,
    alpha: f64,
}

impl Objective<'_> {
    /// Objective value and gradient at `theta = [W (row-major) | b]`.
    fn evaluate(&self, theta: &[f64]) -> (f64, Vec<f64>) {
        let (k, d) = (self.k, self.d);
        let n = self.targets.len() as f64;
        let w = Array2::from_shape_fn((k, d), |(row, col)| theta[row * d + col]);
        let b = ArrayView1::from(&theta[k * d..]);

        let mut residual = self.x.dot(&w.t()) + &b;
        let mut loss = 0.0;
        for (mut row, &target) in residual.axis_iter_mut(Axis(0)).zip(self.targets) {
            let peak = row.fold(f64::NEG_INFINITY, |acc, &z| acc.max(z));
            let lse = peak + row.iter().map(|&z| (z - peak).exp()).sum::<f64>().ln();
            loss += lse - row[target];
            row.mapv_inplace(|z| (z - lse).exp());
            row[target] -= 1.0;
        }

        let grad_w = residual.t().dot(&self.x) / n + &(&w * self.alpha);
        let grad_b = residual.sum_axis(Axis(0)) / n;
        let penalty = 0.5 * self.alpha * w.iter().map(|v| v * v).sum::<f64>();

        let mut grad = Vec::with_capacity(theta.len());
        grad.extend(grad_w.iter().copied());
        grad.extend(grad_b.iter().copied());
        (loss / n + penalty, grad)
    }
}

struct Minimum {
    theta: Vec<f64>,
    value: f64,
    iterations: usize,
    converged: bool,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn inf_norm(a: &[f64]) -> f64 {
    a.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

/// Two-loop recursion: returns `-H·g` for the implicit inverse Hessian.
fn search_direction(grad: &[f64], history: &VecDeque<(Vec<f64>, Vec<f64>, f64)>) -> Vec<f64> {
    let mut q = grad.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for (s, y, rho) in history.iter().rev() {
        let a = rho * dot(s, &q);
        for (qi, yi) in q.iter_mut().zip(y) {
            *qi -= a * yi;
        }
        alphas.push(a);
    }
    let gamma = history
        .back()
        .map(|(s, y, _)| dot(s, y) / dot(y, y).max(f64::MIN_POSITIVE))
        .unwrap_or(1.0);
    for qi in q.iter_mut() {
        *qi *= gamma;
    }
    for ((s, y, rho), a) in history.iter().zip(alphas.iter().rev()) {
        let beta = rho * dot(y, &q);
        for (qi, si) in q.iter_mut().zip(s) {
            *qi += si * (a - beta);
        }
    }
    q.iter_mut().for_each(|v| *v = -*v);
    q
}

fn lbfgs(objective: &Objective<'_>, mut theta: Vec<f64>, max_iter: usize, tol: f64) -> Minimum {
    let (mut value, mut grad) = objective.evaluate(&theta);
    let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::with_capacity(HISTORY);
    let mut iterations = 0;
    let mut converged = inf_norm(&grad) <= tol;

    while !converged && iterations < max_iter {
        let mut direction = search_direction(&grad, &history);
        let mut slope = dot(&grad, &direction);
        if slope >= 0.0 {
            history.clear();
            direction = grad.iter().map(|g| -g).collect();
            slope = -dot(&grad, &grad);
        }

        let mut step = if history.is_empty() {
            1.0 / dot(&grad, &grad).sqrt().max(1.0)
        } else {
            1.0
        };
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let candidate: Vec<f64> = theta
                .iter()
                .zip(&direction)
                .map(|(t, p)| t + step * p)
                .collect();
            let (next_value, next_grad) = objective.evaluate(&candidate);
            if next_value <= value + ARMIJO * step * slope {
                accepted = Some((candidate, next_value, next_grad));
                break;
            }
            step *= 0.5;
        }
        let Some((next_theta, next_value, next_grad)) = accepted else {
            break;
        };

        let s: Vec<f64> = next_theta.iter().zip(&theta).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = next_grad.iter().zip(&grad).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-12 {
            if history.len() == HISTORY {
                history.pop_front();
            }
            history.push_back((s, y, 1.0 / sy));
        }

        let previous = value;
        theta = next_theta;
        value = next_value;
        grad = next_grad;
        iterations += 1;
        converged = inf_norm(&grad) <= tol
            || (previous - value).abs() <= f64::EPSILON * previous.abs().max(value.abs()).max(1.0);
    }

    Minimum {
        theta,
        value,
        iterations,
        converged,
    }
}
