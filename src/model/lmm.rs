//! Linear mixed model fitting for one biomarker design.
//!
//! Model per subject `i`:
//! `y_i = X_i β + Z_i b_i + ε_i` with `b_i ~ N(0, G)` and `ε_i ~ N(0, σ² I)`,
//! so `V_i = Z_i G Z_iᵀ + σ² I`.
//!
//! Variance components are estimated by Fisher scoring on the unique entries of
//! G and σ², with β solved in closed form by GLS at every trial point. Steps
//! are halved until the (restricted) likelihood does not decrease, and each
//! trial is projected back onto positive semi-definite G. Components sitting
//! on the boundary with a score pointing outward are held fixed, so a
//! vanishing subject effect (τ² → 0) converges in a few iterations. When no
//! scoring step improves the likelihood, one EM step (Laird–Ware for ML,
//! Laird–Lange–Stram for REML) is taken instead.
//!
//! Covariance blocks are factorised per subject, so the cost grows with the
//! number of subjects rather than the square of the number of observations.
//!
//! # Example
//! ```ignore
//! use cplmm::model::lmm::{fit_lmm, LmmConfig};
//!
//! let design = assembler.assemble("NfL")?;
//! let fit = fit_lmm("NfL", &design, &LmmConfig::default())?;
//! let slope_change = fit.coefficient("post_onset");
//! ```

use crate::data::BiomarkerDesign;
use crate::error::{CplmmError, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Likelihood used for variance-component estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Maximum likelihood.
    Ml,
    /// Restricted maximum likelihood.
    #[default]
    Reml,
}

/// Configuration for LMM fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmmConfig {
    /// Maximum variance-component iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the absolute log-likelihood change.
    pub tol: f64,
    /// Ridge added to covariance blocks for numerical stability.
    pub ridge: f64,
    /// Floor for the residual variance.
    pub var_lower_bound: f64,
    /// ML or REML.
    pub method: EstimationMethod,
}

impl Default for LmmConfig {
    fn default() -> Self {
        Self {
            max_iter: 500,
            tol: 1e-8,
            ridge: 1e-8,
            var_lower_bound: 1e-10,
            method: EstimationMethod::Reml,
        }
    }
}

impl LmmConfig {
    /// Reject settings the fitter cannot use.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(CplmmError::InvalidParameter("max_iter must be positive".to_string()));
        }
        if !(self.tol > 0.0) {
            return Err(CplmmError::InvalidParameter("tol must be positive".to_string()));
        }
        if !(self.ridge >= 0.0) || !(self.var_lower_bound > 0.0) {
            return Err(CplmmError::InvalidParameter(
                "ridge must be non-negative and var_lower_bound positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of fitting the mixed model to one biomarker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Biomarker identifier.
    pub biomarker_id: String,
    /// Fixed-effect names, in design column order.
    pub coefficient_names: Vec<String>,
    /// Estimated fixed effects.
    pub coefficients: Vec<f64>,
    /// Standard errors of the fixed effects.
    pub std_errors: Vec<f64>,
    /// Covariance of the fixed effects, `(Xᵀ V⁻¹ X)⁻¹`.
    pub covariance: DMatrix<f64>,
    /// Random-effect covariance G (1×1 or 2×2).
    pub random_effect_covariance: DMatrix<f64>,
    /// Residual variance σ².
    pub residual_variance: f64,
    /// (Restricted) log-likelihood at the final estimates.
    pub log_likelihood: f64,
    pub method: EstimationMethod,
    pub iterations: usize,
    pub converged: bool,
    pub n_observations: usize,
    pub n_subjects: usize,
    pub aic: f64,
    pub bic: f64,
    /// Mean squared error of the fixed-effect predictions.
    pub mse: f64,
    /// Intraclass correlation: G₀₀ / (G₀₀ + σ²).
    pub icc: f64,
}

impl FitResult {
    /// Get coefficient index by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Get a coefficient by name.
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficient_index(name).map(|i| self.coefficients[i])
    }

    /// Get a standard error by name.
    pub fn std_error(&self, name: &str) -> Option<f64> {
        self.coefficient_index(name).map(|i| self.std_errors[i])
    }

    /// Covariance between two coefficients.
    pub fn covariance_between(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.coefficient_index(a)?;
        let j = self.coefficient_index(b)?;
        Some(self.covariance[(i, j)])
    }

    /// Random-intercept variance (τ²).
    pub fn tau_squared(&self) -> f64 {
        self.random_effect_covariance[(0, 0)]
    }
}

/// Fits one biomarker design under a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct MixedModelFitter {
    config: LmmConfig,
}

impl MixedModelFitter {
    pub fn new(config: LmmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LmmConfig {
        &self.config
    }

    /// Fit the model; see [`fit_lmm`].
    pub fn fit(&self, biomarker_id: &str, design: &BiomarkerDesign) -> Result<FitResult> {
        fit_lmm(biomarker_id, design, &self.config)
    }
}

/// Per-subject slices of the design.
struct GroupBlock {
    x: DMatrix<f64>,
    y: DVector<f64>,
    z: DMatrix<f64>,
}

/// Quantities at the current variance components.
struct GlsState {
    beta: DVector<f64>,
    a_inv: DMatrix<f64>,
    log_likelihood: f64,
    chols: Vec<Cholesky<f64, Dyn>>,
    residuals: Vec<DVector<f64>>,
}

/// Fit the mixed model to one biomarker design.
///
/// Returns `SingularDesign` when the fixed-effect matrix is rank-deficient.
/// A fit that does not converge within `max_iter` is returned with
/// `converged = false`.
pub fn fit_lmm(biomarker_id: &str, design: &BiomarkerDesign, config: &LmmConfig) -> Result<FitResult> {
    let x = design.matrix();
    let y = design.response();
    let n = x.nrows();
    let p = x.ncols();

    if y.len() != n {
        return Err(CplmmError::DimensionMismatch {
            expected: n,
            actual: y.len(),
        });
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(CplmmError::Numerical(format!(
            "non-finite response values for '{}'",
            biomarker_id
        )));
    }
    if n <= p {
        return Err(CplmmError::EmptyDesign {
            biomarker: biomarker_id.to_string(),
            reason: format!("{} observations for {} fixed effects", n, p),
        });
    }

    let rank = numerical_rank(x);
    if rank < p {
        return Err(CplmmError::SingularDesign {
            biomarker: biomarker_id.to_string(),
            rank,
            n_columns: p,
        });
    }

    let q = design.random_effects().n_terms();
    let blocks: Vec<GroupBlock> = design
        .group_rows()
        .iter()
        .map(|rows| {
            let n_i = rows.len();
            GroupBlock {
                x: DMatrix::from_fn(n_i, p, |r, c| x[(rows[r], c)]),
                y: DVector::from_fn(n_i, |r, _| y[rows[r]]),
                z: DMatrix::from_fn(n_i, q, |r, c| if c == 0 { 1.0 } else { design.slope()[rows[r]] }),
            }
        })
        .collect();

    let (mut g, mut sigma2) = initialize_variance_components(x, y, &blocks, q, config)?;

    let mut state = gls_step(&blocks, &g, sigma2, n, p, config)?;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 1..=config.max_iter {
        iterations = iter;
        let (g_new, sigma2_new, next) = match scoring_update(&blocks, &state, &g, sigma2, n, p, config) {
            Some(step) => step,
            None => {
                let (g_em, sigma2_em) = em_update(&blocks, &state, &g, sigma2, n, config);
                let next = gls_step(&blocks, &g_em, sigma2_em, n, p, config)?;
                (g_em, sigma2_em, next)
            }
        };

        let change = (next.log_likelihood - state.log_likelihood).abs();
        g = g_new;
        sigma2 = sigma2_new;
        state = next;

        if change < config.tol {
            converged = true;
            break;
        }
    }

    if converged {
        log::debug!(
            "{}: converged after {} iterations (loglik {:.6}, tau2 {:.4e}, sigma2 {:.4e})",
            biomarker_id,
            iterations,
            state.log_likelihood,
            g[(0, 0)],
            sigma2
        );
    } else {
        log::warn!(
            "{}: no convergence within {} iterations (loglik {:.6})",
            biomarker_id,
            config.max_iter,
            state.log_likelihood
        );
    }

    let coefficients: Vec<f64> = state.beta.iter().copied().collect();
    let std_errors: Vec<f64> = (0..p).map(|j| state.a_inv[(j, j)].max(0.0).sqrt()).collect();

    let rss: f64 = state.residuals.iter().map(|r| r.norm_squared()).sum();
    let mse = rss / n as f64;

    let n_params = (p + q * (q + 1) / 2 + 1) as f64;
    let aic = -2.0 * state.log_likelihood + 2.0 * n_params;
    let bic = -2.0 * state.log_likelihood + n_params * (n as f64).ln();
    let icc = g[(0, 0)] / (g[(0, 0)] + sigma2);

    Ok(FitResult {
        biomarker_id: biomarker_id.to_string(),
        coefficient_names: design.coefficient_names().to_vec(),
        coefficients,
        std_errors,
        covariance: state.a_inv,
        random_effect_covariance: g,
        residual_variance: sigma2,
        log_likelihood: state.log_likelihood,
        method: config.method,
        iterations,
        converged,
        n_observations: n,
        n_subjects: blocks.len(),
        aic,
        bic,
        mse,
        icc,
    })
}

/// Rank of X from its singular values, with the usual `max(n, p)·ε·σ_max` cutoff.
fn numerical_rank(x: &DMatrix<f64>) -> usize {
    let singular_values = x.singular_values();
    let max_sv = singular_values.max();
    if !(max_sv > 0.0) {
        return 0;
    }
    let cutoff = max_sv * x.nrows().max(x.ncols()) as f64 * f64::EPSILON;
    singular_values.iter().filter(|&&s| s > cutoff).count()
}

/// Starting values from OLS residuals: half the residual variance to the
/// random intercept, half to the residual.
fn initialize_variance_components(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    blocks: &[GroupBlock],
    q: usize,
    config: &LmmConfig,
) -> Result<(DMatrix<f64>, f64)> {
    let n = x.nrows();
    let p = x.ncols();

    let xtx = x.transpose() * x;
    let xtx_chol = xtx
        .cholesky()
        .ok_or_else(|| CplmmError::Numerical("XᵀX is not positive definite".to_string()))?;
    let beta_ols = xtx_chol.solve(&(x.transpose() * y));
    let residuals = y - x * beta_ols;
    let rss = residuals.norm_squared();
    let s2 = (rss / (n - p) as f64).max(config.var_lower_bound);

    let mut g = DMatrix::zeros(q, q);
    g[(0, 0)] = 0.5 * s2;
    if q == 2 {
        let slopes: Vec<f64> = blocks.iter().flat_map(|b| b.z.column(1).iter().copied().collect::<Vec<_>>()).collect();
        let mean = slopes.iter().sum::<f64>() / slopes.len() as f64;
        let var = slopes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / slopes.len() as f64;
        g[(1, 1)] = 0.1 * s2 / var.max(1.0);
    }

    Ok((g, 0.5 * s2))
}

/// Factorise `V_i`, retrying once with a larger ridge.
fn factorise_block(z: &DMatrix<f64>, g: &DMatrix<f64>, sigma2: f64, ridge: f64) -> Result<Cholesky<f64, Dyn>> {
    let n_i = z.nrows();
    let mut v = z * g * z.transpose();
    for i in 0..n_i {
        v[(i, i)] += sigma2 + ridge;
    }
    if let Some(chol) = v.clone().cholesky() {
        return Ok(chol);
    }
    let v_ridge = v + DMatrix::identity(n_i, n_i) * 1e-6;
    v_ridge
        .cholesky()
        .ok_or_else(|| CplmmError::Numerical("subject covariance block is not positive definite".to_string()))
}

/// GLS solve for β and the (restricted) log-likelihood at (G, σ²).
fn gls_step(
    blocks: &[GroupBlock],
    g: &DMatrix<f64>,
    sigma2: f64,
    n: usize,
    p: usize,
    config: &LmmConfig,
) -> Result<GlsState> {
    let mut xtvinvx = DMatrix::zeros(p, p);
    let mut xtvinvy = DVector::zeros(p);
    let mut log_det_v = 0.0;
    let mut chols = Vec::with_capacity(blocks.len());

    for block in blocks {
        let chol = factorise_block(&block.z, g, sigma2, config.ridge)?;
        xtvinvx += block.x.transpose() * chol.solve(&block.x);
        xtvinvy += block.x.transpose() * chol.solve(&block.y);
        log_det_v += 2.0 * chol.l().diagonal().map(|d| d.ln()).sum();
        chols.push(chol);
    }

    let a_chol = xtvinvx
        .clone()
        .cholesky()
        .ok_or_else(|| CplmmError::Numerical("XᵀV⁻¹X is not positive definite".to_string()))?;
    let beta = a_chol.solve(&xtvinvy);
    let a_inv = a_chol.inverse();
    let log_det_a = 2.0 * a_chol.l().diagonal().map(|d| d.ln()).sum();

    let mut quad_form = 0.0;
    let mut residuals = Vec::with_capacity(blocks.len());
    for (block, chol) in blocks.iter().zip(&chols) {
        let r = &block.y - &block.x * &beta;
        quad_form += r.dot(&chol.solve(&r));
        residuals.push(r);
    }

    let log_likelihood = match config.method {
        EstimationMethod::Ml => -0.5 * (n as f64 * (2.0 * PI).ln() + log_det_v + quad_form),
        EstimationMethod::Reml => {
            -0.5 * ((n - p) as f64 * (2.0 * PI).ln() + log_det_v + log_det_a + quad_form)
        }
    };

    if !log_likelihood.is_finite() {
        return Err(CplmmError::Numerical("log-likelihood is not finite".to_string()));
    }

    Ok(GlsState {
        beta,
        a_inv,
        log_likelihood,
        chols,
        residuals,
    })
}

/// One EM update of (G, σ²).
///
/// With `P_i = V_i⁻¹` (ML) or `P_i = V_i⁻¹ − V_i⁻¹ X_i A⁻¹ X_iᵀ V_i⁻¹` (REML):
/// - `b_i = G Z_iᵀ V_i⁻¹ r_i`, `e_i = r_i − Z_i b_i`
/// - `σ² ← (1/N) Σ [e_iᵀ e_i + σ² (n_i − σ² tr P_i)]`
/// - `G  ← (1/m) Σ [b_i b_iᵀ + G − G Z_iᵀ P_i Z_i G]`
fn em_update(
    blocks: &[GroupBlock],
    state: &GlsState,
    g: &DMatrix<f64>,
    sigma2: f64,
    n: usize,
    config: &LmmConfig,
) -> (DMatrix<f64>, f64) {
    let q = g.nrows();
    let mut sigma_acc = 0.0;
    let mut g_acc = DMatrix::zeros(q, q);

    for ((block, chol), r) in blocks.iter().zip(&state.chols).zip(&state.residuals) {
        let n_i = block.y.len() as f64;
        let v_inv = chol.inverse();
        let p_i = match config.method {
            EstimationMethod::Ml => v_inv,
            EstimationMethod::Reml => {
                let w = &v_inv * &block.x;
                &v_inv - &w * &state.a_inv * w.transpose()
            }
        };

        let b = g * block.z.transpose() * chol.solve(r);
        let e = r - &block.z * &b;

        sigma_acc += e.norm_squared() + sigma2 * (n_i - sigma2 * p_i.trace());
        g_acc += &b * b.transpose() + g - g * block.z.transpose() * &p_i * &block.z * g;
    }

    let g_acc = g_acc / blocks.len() as f64;
    let mut g_new = (&g_acc + g_acc.transpose()) * 0.5;
    let sigma2_new = project_variance_components(&mut g_new, sigma_acc / n as f64, config);

    (g_new, sigma2_new)
}

/// Trial step lengths tried along one scoring direction.
const MAX_STEP_HALVINGS: usize = 12;

/// One Fisher scoring step on θ = (G₀₀, G₀₁, G₁₁, σ²).
///
/// With `dV_a = ∂V/∂θ_a` and `P` as in [`em_update`]:
/// - score `s_a = −½ tr(P dV_a) + ½ rᵀV⁻¹ dV_a V⁻¹r`
/// - expected information `I_ab = ½ tr(P dV_a P dV_b)`
///
/// `tr(P·)` is expanded per subject so only `n_i × n_i` blocks are formed.
/// Returns `None` when no step along `I⁻¹s` keeps the likelihood from falling.
fn scoring_update(
    blocks: &[GroupBlock],
    state: &GlsState,
    g: &DMatrix<f64>,
    sigma2: f64,
    n: usize,
    p: usize,
    config: &LmmConfig,
) -> Option<(DMatrix<f64>, f64, GlsState)> {
    let q = g.nrows();
    let pairs: Vec<(usize, usize)> = (0..q).flat_map(|k| (k..q).map(move |l| (k, l))).collect();
    let n_theta = pairs.len() + 1;
    let reml = config.method == EstimationMethod::Reml;

    let mut trace_m = vec![0.0; n_theta];
    let mut quad = vec![0.0; n_theta];
    let mut trace_mm = DMatrix::<f64>::zeros(n_theta, n_theta);
    let mut b_mats = vec![DMatrix::<f64>::zeros(p, p); n_theta];
    let mut c_mats = vec![DMatrix::<f64>::zeros(p, p); n_theta * n_theta];

    for ((block, chol), r) in blocks.iter().zip(&state.chols).zip(&state.residuals) {
        let n_i = block.y.len();
        let v_inv = chol.inverse();
        let u = &v_inv * r;

        let mut dv: Vec<DMatrix<f64>> = pairs
            .iter()
            .map(|&(k, l)| {
                let zk = block.z.column(k).into_owned();
                let zl = block.z.column(l).into_owned();
                let d = &zk * zl.transpose();
                if k == l {
                    d
                } else {
                    &d + d.transpose()
                }
            })
            .collect();
        dv.push(DMatrix::identity(n_i, n_i));
        let m: Vec<DMatrix<f64>> = dv.iter().map(|d| &v_inv * d).collect();
        let w = if reml { Some(&v_inv * &block.x) } else { None };

        for a in 0..n_theta {
            trace_m[a] += m[a].trace();
            quad[a] += u.dot(&(&dv[a] * &u));
            for b in a..n_theta {
                trace_mm[(a, b)] += (&m[a] * &m[b]).trace();
            }
            if let Some(w) = &w {
                let wt_dv = w.transpose() * &dv[a];
                b_mats[a] += &wt_dv * w;
                for b in a..n_theta {
                    c_mats[a * n_theta + b] += &wt_dv * &m[b] * w;
                }
            }
        }
    }

    let mut score = DVector::<f64>::zeros(n_theta);
    let mut info = DMatrix::<f64>::zeros(n_theta, n_theta);
    for a in 0..n_theta {
        let mut trace_p = trace_m[a];
        if reml {
            trace_p -= (&state.a_inv * &b_mats[a]).trace();
        }
        score[a] = -0.5 * trace_p + 0.5 * quad[a];
        for b in a..n_theta {
            let mut value = trace_mm[(a, b)];
            if reml {
                value -= 2.0 * (&state.a_inv * &c_mats[a * n_theta + b]).trace();
                value += (&state.a_inv * &b_mats[a] * &state.a_inv * &b_mats[b]).trace();
            }
            info[(a, b)] = 0.5 * value;
            info[(b, a)] = 0.5 * value;
        }
    }

    // Hold components on the boundary whose score points outward.
    let diagonal_fixed = |k: usize| {
        let a = pairs.iter().position(|&pair| pair == (k, k)).unwrap_or(k);
        g[(k, k)] <= 0.0 && score[a] <= 0.0
    };
    let free: Vec<usize> = (0..n_theta)
        .filter(|&a| match pairs.get(a) {
            Some(&(k, l)) => !diagonal_fixed(k) && !diagonal_fixed(l),
            None => !(sigma2 <= config.var_lower_bound && score[a] <= 0.0),
        })
        .collect();
    if free.is_empty() {
        return None;
    }

    let info_free = DMatrix::from_fn(free.len(), free.len(), |i, j| info[(free[i], free[j])]);
    let score_free = DVector::from_fn(free.len(), |i, _| score[free[i]]);
    let step_free = info_free.cholesky()?.solve(&score_free);
    let mut direction = DVector::<f64>::zeros(n_theta);
    for (i, &a) in free.iter().enumerate() {
        direction[a] = step_free[i];
    }

    let mut theta = DVector::<f64>::zeros(n_theta);
    for (a, &(k, l)) in pairs.iter().enumerate() {
        theta[a] = g[(k, l)];
    }
    theta[n_theta - 1] = sigma2;

    let mut step = 1.0;
    for _ in 0..MAX_STEP_HALVINGS {
        let trial = &theta + &direction * step;
        let mut g_trial = DMatrix::<f64>::zeros(q, q);
        for (a, &(k, l)) in pairs.iter().enumerate() {
            g_trial[(k, l)] = trial[a];
            g_trial[(l, k)] = trial[a];
        }
        let sigma2_trial = project_variance_components(&mut g_trial, trial[n_theta - 1], config);

        if let Ok(next) = gls_step(blocks, &g_trial, sigma2_trial, n, p, config) {
            if next.log_likelihood >= state.log_likelihood {
                return Some((g_trial, sigma2_trial, next));
            }
        }
        step *= 0.5;
    }
    None
}

/// Floor σ² and make G positive semi-definite.
///
/// A non-positive diagonal zeroes its row and column; a 2×2 off-diagonal is
/// clamped inside the Cauchy–Schwarz bound.
fn project_variance_components(g: &mut DMatrix<f64>, sigma2: f64, config: &LmmConfig) -> f64 {
    let q = g.nrows();
    for k in 0..q {
        if !(g[(k, k)] > 0.0) {
            g[(k, k)] = 0.0;
            for l in 0..q {
                if l != k {
                    g[(k, l)] = 0.0;
                    g[(l, k)] = 0.0;
                }
            }
        }
    }
    if q == 2 {
        let bound = (g[(0, 0)] * g[(1, 1)]).sqrt() * (1.0 - 1e-8);
        let off = if g[(0, 1)].is_finite() { g[(0, 1)].clamp(-bound, bound) } else { 0.0 };
        g[(0, 1)] = off;
        g[(1, 0)] = off;
    }
    sigma2.max(config.var_lower_bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RandomEffects, INTERCEPT};
    use approx::assert_relative_eq;

    /// Deterministic noise in [-0.5, 0.5).
    fn lcg_noise(seed: &mut u64) -> f64 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((*seed >> 33) as f64 / (1u64 << 31) as f64) - 0.5
    }

    /// Piecewise trajectories: slope `pre` before onset, `pre + change` after,
    /// subject offsets of size `subject_sd`.
    fn create_piecewise_design(
        n_subjects: usize,
        times: &[f64],
        pre: f64,
        change: f64,
        subject_sd: f64,
        noise: f64,
        random_effects: RandomEffects,
    ) -> BiomarkerDesign {
        let mut seed = 7u64;
        let mut rows: Vec<[f64; 3]> = Vec::new();
        let mut response = Vec::new();
        let mut groups = Vec::new();
        let mut slope = Vec::new();
        for s in 0..n_subjects {
            let offset = subject_sd * lcg_noise(&mut seed) * 2.0;
            for &t in times {
                let post = t.max(0.0);
                rows.push([t, post, 1.0]);
                response.push(10.0 + offset + pre * t + change * post + noise * lcg_noise(&mut seed));
                groups.push(format!("S{}", s));
                slope.push(t);
            }
        }
        let x = DMatrix::from_fn(rows.len(), 3, |r, c| rows[r][c]);
        BiomarkerDesign::from_parts(
            "marker",
            x,
            response,
            vec!["years_since_onset".into(), "post_onset".into(), INTERCEPT.into()],
            groups,
            slope,
            random_effects,
        )
        .unwrap()
    }

    #[test]
    fn test_lmm_config_default() {
        let config = LmmConfig::default();
        assert_eq!(config.max_iter, 500);
        assert_eq!(config.tol, 1e-8);
        assert_eq!(config.method, EstimationMethod::Reml);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_recovers_slope_change() {
        let design = create_piecewise_design(
            12,
            &[-3.0, -1.5, 0.5, 2.0],
            0.2,
            1.5,
            1.0,
            0.05,
            RandomEffects::Intercept,
        );
        let fit = fit_lmm("marker", &design, &LmmConfig::default()).unwrap();

        assert!(fit.converged);
        assert_relative_eq!(fit.coefficient("post_onset").unwrap(), 1.5, epsilon = 0.05);
        assert_relative_eq!(fit.coefficient("years_since_onset").unwrap(), 0.2, epsilon = 0.05);
        assert!(fit.std_error("post_onset").unwrap() > 0.0);
        // Subject offsets dominate the noise.
        assert!(fit.icc > 0.5, "icc = {}", fit.icc);
        assert_eq!(fit.n_subjects, 12);
        assert_eq!(fit.n_observations, 48);
    }

    #[test]
    fn test_matches_ols_without_subject_effect() {
        // Without subject effects τ² shrinks toward zero and β approaches OLS.
        let design = create_piecewise_design(
            10,
            &[-2.0, -1.0, 1.0, 2.0],
            0.5,
            -1.0,
            0.0,
            0.2,
            RandomEffects::Intercept,
        );
        let fit = fit_lmm("marker", &design, &LmmConfig { method: EstimationMethod::Ml, ..LmmConfig::default() }).unwrap();

        let x = design.matrix();
        let y = design.response();
        let beta_ols = (x.transpose() * x).cholesky().unwrap().solve(&(x.transpose() * y));

        assert!(fit.converged);
        assert!(fit.tau_squared() >= 0.0);
        assert!(fit.tau_squared() < 0.1 * fit.residual_variance);
        for j in 0..3 {
            assert_relative_eq!(fit.coefficients[j], beta_ols[j], epsilon = 0.02);
        }
    }

    #[test]
    fn test_vanishing_subject_effect_converges() {
        // Noise dominates and no subject offset: τ² sits on the boundary.
        let design = create_piecewise_design(
            20,
            &[-2.0, -1.0, 0.5, 1.5, 3.0],
            0.1,
            0.5,
            0.0,
            1.0,
            RandomEffects::Intercept,
        );
        for method in [EstimationMethod::Reml, EstimationMethod::Ml] {
            let config = LmmConfig {
                method,
                ..LmmConfig::default()
            };
            let fit = fit_lmm("marker", &design, &config).unwrap();
            assert!(fit.converged, "{:?} stopped after {} iterations", method, fit.iterations);
            assert!(fit.iterations < 100, "{:?} took {} iterations", method, fit.iterations);
            assert!(fit.tau_squared() >= 0.0);
            assert!(fit.tau_squared() < 0.5 * fit.residual_variance);
            assert_relative_eq!(fit.coefficient("post_onset").unwrap(), 0.5, epsilon = 0.3);
        }
    }

    #[test]
    fn test_projection_keeps_g_positive_semidefinite() {
        let config = LmmConfig::default();
        let mut g = DMatrix::from_row_slice(2, 2, &[1.0, 5.0, 5.0, 4.0]);
        let sigma2 = project_variance_components(&mut g, -1.0, &config);
        assert_eq!(sigma2, config.var_lower_bound);
        assert!(g[(0, 1)] <= 2.0 && g[(0, 1)] > 1.99);
        assert_eq!(g[(0, 1)], g[(1, 0)]);

        let mut g = DMatrix::from_row_slice(2, 2, &[-0.3, 0.2, 0.2, 4.0]);
        project_variance_components(&mut g, 1.0, &config);
        assert_eq!(g[(0, 0)], 0.0);
        assert_eq!(g[(0, 1)], 0.0);
        assert_eq!(g[(1, 1)], 4.0);
    }

    #[test]
    fn test_variance_components_non_negative() {
        let design = create_piecewise_design(
            6,
            &[-1.0, 0.0, 1.0],
            0.0,
            0.0,
            0.0,
            1.0,
            RandomEffects::Intercept,
        );
        let fit = fit_lmm("marker", &design, &LmmConfig::default()).unwrap();
        assert!(fit.tau_squared() >= 0.0);
        assert!(fit.residual_variance > 0.0);
        assert!(fit.std_errors.iter().all(|s| s.is_finite() && *s > 0.0));
    }

    #[test]
    fn test_random_slope() {
        let design = create_piecewise_design(
            10,
            &[-3.0, -2.0, -1.0, 1.0, 2.0],
            0.3,
            1.0,
            1.0,
            0.1,
            RandomEffects::InterceptAndSlope,
        );
        let fit = fit_lmm("marker", &design, &LmmConfig::default()).unwrap();

        assert_eq!(fit.random_effect_covariance.shape(), (2, 2));
        assert!(fit.random_effect_covariance[(0, 0)] >= 0.0);
        assert!(fit.random_effect_covariance[(1, 1)] >= 0.0);
        assert_relative_eq!(
            fit.random_effect_covariance[(0, 1)],
            fit.random_effect_covariance[(1, 0)],
            epsilon = 1e-12
        );
        assert_relative_eq!(fit.coefficient("post_onset").unwrap(), 1.0, epsilon = 0.1);
    }

    #[test]
    fn test_singular_design() {
        let mut design = create_piecewise_design(
            4,
            &[-1.0, 1.0, 2.0],
            0.1,
            0.5,
            0.5,
            0.1,
            RandomEffects::Intercept,
        );
        // Replace the design with one whose extra column duplicates the intercept.
        let x = design.matrix().clone().insert_column(3, 1.0);
        design = BiomarkerDesign::from_parts(
            "marker",
            x,
            design.response().iter().copied().collect(),
            vec![
                "years_since_onset".into(),
                "post_onset".into(),
                INTERCEPT.into(),
                "constant_covariate".into(),
            ],
            (0..12).map(|r| format!("S{}", r / 3)).collect(),
            vec![0.0; 12],
            RandomEffects::Intercept,
        )
        .unwrap();

        let result = fit_lmm("marker", &design, &LmmConfig::default());
        assert!(matches!(
            result,
            Err(CplmmError::SingularDesign { rank: 3, n_columns: 4, .. })
        ));
    }

    #[test]
    fn test_refit_is_bit_identical() {
        let design = create_piecewise_design(
            8,
            &[-2.0, -0.5, 1.0, 2.5],
            0.1,
            0.8,
            0.7,
            0.3,
            RandomEffects::Intercept,
        );
        let config = LmmConfig::default();
        let a = fit_lmm("marker", &design, &config).unwrap();
        let b = fit_lmm("marker", &design, &config).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.coefficients.iter().map(|c| c.to_bits()).collect::<Vec<_>>(),
            b.coefficients.iter().map(|c| c.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_iteration_cap_flags_non_convergence() {
        let design = create_piecewise_design(
            8,
            &[-2.0, -0.5, 1.0, 2.5],
            0.1,
            0.8,
            0.7,
            0.3,
            RandomEffects::Intercept,
        );
        let config = LmmConfig {
            max_iter: 1,
            tol: 1e-300,
            ..LmmConfig::default()
        };
        let fit = fit_lmm("marker", &design, &config).unwrap();
        assert!(!fit.converged);
        assert_eq!(fit.iterations, 1);
        assert!(fit.coefficients.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_reml_vs_ml_variance() {
        let design = create_piecewise_design(
            6,
            &[-2.0, -1.0, 1.0, 2.0],
            0.2,
            0.4,
            0.5,
            0.5,
            RandomEffects::Intercept,
        );
        let reml = fit_lmm("marker", &design, &LmmConfig::default()).unwrap();
        let ml = fit_lmm(
            "marker",
            &design,
            &LmmConfig {
                method: EstimationMethod::Ml,
                ..LmmConfig::default()
            },
        )
        .unwrap();
        // ML shrinks the residual variance relative to REML.
        assert!(ml.residual_variance <= reml.residual_variance * 1.0001);
        assert_eq!(reml.method, EstimationMethod::Reml);
        assert!(reml.aic.is_finite() && reml.bic.is_finite());
    }

    #[test]
    fn test_saturated_design_rejected() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 1.0]);
        let design = BiomarkerDesign::from_parts(
            "marker",
            x,
            vec![1.0, 2.0],
            vec![INTERCEPT.into(), "post_onset".into()],
            vec!["a".into(), "b".into()],
            vec![0.0, 0.0],
            RandomEffects::Intercept,
        )
        .unwrap();
        assert!(matches!(
            fit_lmm("marker", &design, &LmmConfig::default()),
            Err(CplmmError::EmptyDesign { .. })
        ));
    }
}
