use na::{DMatrix, RealField};
use nalgebra as na;

use crate::factorize::FactoredSystem;
use crate::filter::FilterOutput;
use crate::initial::Initial;
use crate::model::StateSpace;
use crate::smoother::SmootherOutput;
use crate::zero_tol;

/// Smoothed second moments and observation-level residuals, derived from
/// filter and smoother output.
///
/// All quantities refer to the original, untransformed model: `epsilon` and
/// `D` use the caller's `y`, `Z`, `d` and `H`, not the factored ones. The
/// state-level quantities (`V`, `J`) are invariant under the measurement
/// factorization and come straight from the retained recursions.
#[derive(Debug, Clone)]
pub struct SmoothedMoments<R: RealField + Copy> {
    /// Smoothed observation residuals `y - Z alpha - d`, `p x n`; NaN where
    /// the observation is missing.
    pub epsilon: DMatrix<R>,
    /// Smoothed state variances `Var(alpha_t | y)`, `n` slices of `m x m`.
    pub V: Vec<DMatrix<R>>,
    /// Scaled residual variances `H^+ (H - Z V Z') H^+` on the observed
    /// block, `n` slices of `p x p`, zero on missing rows and columns.
    pub D: Vec<DMatrix<R>>,
    /// Cross covariances `Cov(alpha_{t+1}, alpha_t | y)`, `n` slices; the
    /// last slice pairs the final state with the out-of-sample forecast.
    pub J: Vec<DMatrix<R>>,
    /// `Var(alpha_init | y)` for the initial state.
    pub V_init: DMatrix<R>,
    /// `Cov(alpha_0, alpha_init | y)`.
    pub J_init: DMatrix<R>,
}

/// Derive the smoothed moments for the original model `ss` over data `y`.
pub(crate) fn compute<R: RealField + Copy>(
    ss: &StateSpace<R>,
    y: &DMatrix<R>,
    sys: &FactoredSystem<R>,
    filt: &FilterOutput<R>,
    smo: &SmootherOutput<R>,
    init: &Initial<R>,
) -> SmoothedMoments<R> {
    let n = sys.n;
    let p = ss.p();
    let m = ss.m();
    let tol = zero_tol::<R>();
    let nan = R::zero() / R::zero();

    let mut epsilon = DMatrix::from_element(p, n, nan);
    let mut V = Vec::with_capacity(n);
    let mut D = Vec::with_capacity(n);
    let mut J = Vec::with_capacity(n);

    for t in 0..n {
        let alpha_t = smo.alpha.column(t);
        for &j in &sys.observed[t] {
            epsilon[(j, t)] =
                y[(j, t)] - (ss.Z(t).row(j) * alpha_t)[(0, 0)] - ss.d(t)[j];
        }

        // The five-term form holds in both phases; Pd, N1 and N2 are exactly
        // zero once the diffuse block has collapsed.
        let Pt = &filt.P[t];
        let Pdt = &filt.Pd[t];
        let Vt = Pt - Pt * &smo.N[t] * Pt
            - Pt * smo.N1[t].transpose() * Pdt
            - Pdt * &smo.N1[t] * Pt
            - Pdt * &smo.N2[t] * Pdt;
        V.push(Vt);
    }

    for t in 0..n {
        let obs = &sys.observed[t];
        let mut Dt = DMatrix::zeros(p, p);
        if !obs.is_empty() {
            let h_obs = ss.H(t).select_rows(obs).select_columns(obs);
            let z_obs = ss.Z(t).select_rows(obs);
            let h_inv = pinv_sym(&h_obs, tol);
            let inner = &h_obs - &z_obs * &V[t] * z_obs.transpose();
            let d_obs = &h_inv * inner * &h_inv;
            for (a, &i) in obs.iter().enumerate() {
                for (b, &j) in obs.iter().enumerate() {
                    Dt[(i, j)] = d_obs[(a, b)];
                }
            }
        }
        D.push(Dt);

        let Tn = ss.T(t + 1);
        let Rn = ss.R(t + 1);
        let RQRt = Rn * ss.Q(t + 1) * Rn.transpose();
        let Jt = if t + 1 < n {
            Tn * &V[t] - &RQRt * &smo.N[t + 1] * Tn * &smo.Lbar[t] * &filt.P[t]
        } else {
            Tn * &V[t]
        };
        J.push(Jt);
    }

    let Pstar0 = init.Pstar0();
    let Pinf0 = init.Pinf0();
    let V_init = &Pstar0 - &Pstar0 * &smo.N0_init * &Pstar0
        - &Pstar0 * smo.N1_init.transpose() * &Pinf0
        - &Pinf0 * &smo.N1_init * &Pstar0
        - &Pinf0 * &smo.N2_init * &Pinf0;
    let T0 = ss.T(0);
    let R0 = ss.R(0);
    let RQR0 = R0 * ss.Q(0) * R0.transpose();
    let J_init = if n > 0 {
        T0 * &V_init - &RQR0 * &smo.N[0] * T0 * &Pstar0
    } else {
        DMatrix::zeros(m, m)
    };

    SmoothedMoments {
        epsilon,
        V,
        D,
        J,
        V_init,
        J_init,
    }
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix through its
/// eigendecomposition, zeroing eigenvalues below `tol` in magnitude.
pub(crate) fn pinv_sym<R: RealField + Copy>(mat: &DMatrix<R>, tol: R) -> DMatrix<R> {
    let k = mat.nrows();
    if k == 0 {
        return DMatrix::zeros(0, 0);
    }
    let eig = mat.clone().symmetric_eigen();
    let scale = eig
        .eigenvalues
        .iter()
        .fold(R::one(), |acc, &x| if x.abs() > acc { x.abs() } else { acc });
    let cut = scale * tol;
    let mut inv = DMatrix::zeros(k, k);
    for (i, &lambda) in eig.eigenvalues.iter().enumerate() {
        if lambda.abs() > cut {
            let q = eig.eigenvectors.column(i);
            inv += q * q.transpose() / lambda;
        }
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StateSpace;
    use approx::assert_relative_eq;
    use na::DVector;

    fn local_level(h: f64, q: f64) -> StateSpace<f64> {
        StateSpace::new_invariant(
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, h),
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, q),
        )
        .unwrap()
    }

    #[test]
    fn pinv_inverts_the_regular_part() {
        let mat = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.0]);
        let inv = pinv_sym(&mat, 1e-12);
        assert_relative_eq!(inv[(0, 0)], 0.5, max_relative = 1e-12);
        assert_eq!(inv[(1, 1)], 0.0);
    }

    #[test]
    fn one_diffuse_observation_leaves_noise_variance() {
        // With a diffuse level and a single observation, the posterior
        // variance of the state equals the observation noise variance.
        let ss = local_level(2.0, 0.5);
        let y = DMatrix::from_row_slice(1, 1, &[3.0]);
        let (m, smo, _) = ss.smoothed_moments(&y).unwrap();
        assert_relative_eq!(m.V[0][(0, 0)], 2.0, max_relative = 1e-10);
        assert_relative_eq!(smo.alpha[(0, 0)], 3.0, max_relative = 1e-12);
    }

    #[test]
    fn missing_entries_produce_nan_residuals() {
        let ss = local_level(1.0, 1.0);
        let y = DMatrix::from_row_slice(1, 3, &[1.0, f64::NAN, 2.0]);
        let (m, _, _) = ss.smoothed_moments(&y).unwrap();
        assert!(m.epsilon[(0, 1)].is_nan());
        assert!(m.epsilon[(0, 0)].is_finite());
    }

    #[test]
    fn noiseless_observation_zeroes_the_smoothed_variance() {
        let ss = StateSpace::new_invariant(
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::zeros(1, 1),
            DMatrix::from_element(1, 1, 0.5),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
        )
        .unwrap()
        .with_initial(
            Some(DVector::zeros(1)),
            Some(DMatrix::from_element(1, 1, 4.0 / 3.0)),
        );
        let y = DMatrix::from_row_slice(1, 3, &[1.0, -1.0, 1.0]);
        let (m, _, _) = ss.smoothed_moments(&y).unwrap();
        for t in 0..3 {
            assert_relative_eq!(m.V[t][(0, 0)], 0.0, epsilon = 1e-10);
        }
    }
}
