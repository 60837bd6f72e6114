use log::trace;
use na::{ComplexField, DMatrix, DVector, RealField};
use nalgebra as na;

use crate::error::{Error, ErrorKind};
use crate::model::StateSpace;
use crate::{is_finite, is_nan};

/// Stationary block size above which the Lyapunov equation switches from the
/// dense Kronecker solve to the squaring iteration.
const DENSE_LYAPUNOV_LIMIT: usize = 50;

/// Resolved initial conditions: the stationary/diffuse partition, the
/// initial mean and the covariance of the stationary block.
///
/// `stationary` and `diffuse` list state indices and partition `0..m`; the
/// implied initial covariances are `P* = R0 Q0 R0'` and `Pinf = A0 A0'`
/// where `R0`/`A0` select the stationary/diffuse states.
#[derive(Debug, Clone)]
pub struct Initial<R: RealField + Copy> {
    m: usize,
    /// Initial state mean.
    pub a0: DVector<R>,
    /// Indices of stationary states, ascending.
    pub stationary: Vec<usize>,
    /// Indices of diffuse states, ascending.
    pub diffuse: Vec<usize>,
    /// Initial covariance of the stationary block, `stationary.len()`
    /// square.
    pub Q0: DMatrix<R>,
}

impl<R: RealField + Copy> Initial<R> {
    /// Compute the initial conditions for a model, honoring explicit
    /// overrides and deriving stationary defaults otherwise.
    pub fn resolve(ss: &StateSpace<R>) -> Result<Self, Error> {
        let m = ss.m();
        let T0 = ss.T(0);
        let c0 = ss.c(0);

        let diffuse_flags = match &ss.P0 {
            Some(P0) => (0..m)
                .map(|i| !is_nan(P0[(i, i)]) && !is_finite(P0[(i, i)]))
                .collect::<Vec<_>>(),
            None => nonstationary_states(T0),
        };
        let diffuse: Vec<usize> = (0..m).filter(|&i| diffuse_flags[i]).collect();
        let stationary: Vec<usize> = (0..m).filter(|&i| !diffuse_flags[i]).collect();
        let s = stationary.len();
        trace!(
            "initial partition: {} stationary, {} diffuse states",
            s,
            diffuse.len()
        );

        let T_ss = T0.select_rows(&stationary).select_columns(&stationary);
        let need_a0 = ss.a0.is_none();
        let need_q0 = ss.P0.is_none();
        if (need_a0 || need_q0) && s > 0 {
            let radius = spectral_radius(&T_ss);
            if radius >= R::one() - na::convert(1e-10) {
                return Err(ErrorKind::NonStationarySection.into());
            }
        }

        let a0 = match &ss.a0 {
            Some(a0) => a0.clone(),
            None => {
                let mut a0 = DVector::zeros(m);
                if s > 0 {
                    let lhs = DMatrix::identity(s, s) - &T_ss;
                    let c_s = DVector::from_iterator(s, stationary.iter().map(|&i| c0[i]));
                    let sol = lhs
                        .lu()
                        .solve(&c_s)
                        .ok_or(ErrorKind::NonStationarySection)?;
                    for (k, &i) in stationary.iter().enumerate() {
                        a0[i] = sol[k];
                    }
                }
                a0
            }
        };

        let Q0 = match &ss.P0 {
            Some(P0) => P0.select_rows(&stationary).select_columns(&stationary),
            None => {
                let RQRt = ss.R(0) * ss.Q(0) * ss.R(0).transpose();
                let sigma = RQRt.select_rows(&stationary).select_columns(&stationary);
                solve_lyapunov(&T_ss, &sigma)?
            }
        };

        Ok(Self {
            m,
            a0,
            stationary,
            diffuse,
            Q0,
        })
    }

    /// Number of diffuse states.
    pub fn diffuse_count(&self) -> usize {
        self.diffuse.len()
    }

    /// The finite part of the initial covariance, scattered to `m` square.
    pub fn Pstar0(&self) -> DMatrix<R> {
        let mut P = DMatrix::zeros(self.m, self.m);
        for (a, &i) in self.stationary.iter().enumerate() {
            for (b, &j) in self.stationary.iter().enumerate() {
                P[(i, j)] = self.Q0[(a, b)];
            }
        }
        P
    }

    /// The diffuse part of the initial covariance: identity on the diffuse
    /// states, zero elsewhere.
    pub fn Pinf0(&self) -> DMatrix<R> {
        let mut P = DMatrix::zeros(self.m, self.m);
        for &i in &self.diffuse {
            P[(i, i)] = R::one();
        }
        P
    }
}

/// Largest eigenvalue modulus.
fn spectral_radius<R: RealField + Copy>(mat: &DMatrix<R>) -> R {
    mat.clone()
        .complex_eigenvalues()
        .iter()
        .map(|z| z.modulus())
        .fold(R::zero(), |acc, x| if x > acc { x } else { acc })
}

/// Mark every state carrying a nonzero loading in the invariant subspace of
/// an eigenvalue on or outside the unit circle.
///
/// Invariant subspaces are taken as real null spaces of `(T - lambda I)^k`
/// for real eigenvalues and of the real quadratic factor
/// `(T^2 - 2 Re(lambda) T + |lambda|^2 I)^k` for complex pairs, with `k` the
/// cluster multiplicity so that Jordan chains (e.g. a local linear trend)
/// are caught in full.
fn nonstationary_states<R: RealField + Copy>(T: &DMatrix<R>) -> Vec<bool> {
    let m = T.nrows();
    let mut flags = vec![false; m];
    if m == 0 {
        return flags;
    }
    let unit_tol: R = na::convert(1e-10);
    let cluster_tol: R = na::convert(1e-8);
    let eigs = T.clone().complex_eigenvalues();

    let mut handled: Vec<na::Complex<R>> = Vec::new();
    for lambda in eigs.iter() {
        if lambda.modulus() < R::one() - unit_tol {
            continue;
        }
        // One factor per conjugate pair and per cluster of equal roots.
        if lambda.im < -cluster_tol {
            continue;
        }
        if handled
            .iter()
            .any(|&h| (h - *lambda).modulus() <= cluster_tol)
        {
            continue;
        }
        handled.push(*lambda);
        let multiplicity = eigs
            .iter()
            .filter(|&&e| {
                (e - *lambda).modulus() <= cluster_tol
                    || (e.conjugate() - *lambda).modulus() <= cluster_tol
            })
            .count();

        let factor = if lambda.im.abs() <= cluster_tol {
            T - DMatrix::identity(m, m) * lambda.re
        } else {
            T * T - T * (lambda.re * na::convert::<_, R>(2.0))
                + DMatrix::identity(m, m) * lambda.modulus_squared()
        };
        let mut powered = factor.clone();
        for _ in 1..multiplicity {
            powered = &powered * &factor;
        }

        mark_null_space_loadings(&powered, &mut flags);
    }
    flags
}

/// Set `flags[i]` for every coordinate with a non-negligible loading in the
/// null space of `mat`.
fn mark_null_space_loadings<R: RealField + Copy>(mat: &DMatrix<R>, flags: &mut [bool]) {
    let m = mat.nrows();
    let svd = na::linalg::SVD::new(mat.clone(), false, true);
    let v_t = match &svd.v_t {
        Some(v_t) => v_t,
        None => return,
    };
    let sigma_max = svd
        .singular_values
        .iter()
        .fold(R::zero(), |acc, &x| if x > acc { x } else { acc });
    let rank_tol = (if sigma_max > R::one() { sigma_max } else { R::one() })
        * na::convert::<_, R>(1e-10)
        * na::convert::<_, R>(m as f64);
    let load_tol: R = na::convert(1e-8);
    for (k, &sigma) in svd.singular_values.iter().enumerate() {
        if sigma > rank_tol {
            continue;
        }
        for i in 0..m {
            if v_t[(k, i)].abs() > load_tol {
                flags[i] = true;
            }
        }
    }
}

/// Solve `Q0 - A Q0 A' = Sigma` for a stable `A`.
///
/// Small systems go through the vectorized Kronecker form; larger ones use
/// Smith's squaring iteration, which converges geometrically for spectral
/// radius < 1.
fn solve_lyapunov<R: RealField + Copy>(
    A: &DMatrix<R>,
    sigma: &DMatrix<R>,
) -> Result<DMatrix<R>, Error> {
    let s = A.nrows();
    if s == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    let q0 = if s <= DENSE_LYAPUNOV_LIMIT {
        let kron = A.kronecker(A);
        let lhs = DMatrix::identity(s * s, s * s) - kron;
        let rhs = DVector::from_iterator(s * s, sigma.iter().copied());
        let vec_q = lhs.lu().solve(&rhs).ok_or(ErrorKind::LyapunovFailure)?;
        DMatrix::from_iterator(s, s, vec_q.iter().copied())
    } else {
        smith_iteration(A, sigma)?
    };
    // The solve can leave asymmetry at rounding level.
    let q0 = (&q0 + q0.transpose()) * na::convert::<_, R>(0.5);
    Ok(q0)
}

fn smith_iteration<R: RealField + Copy>(
    A: &DMatrix<R>,
    sigma: &DMatrix<R>,
) -> Result<DMatrix<R>, Error> {
    let tol: R = na::convert(1e-14);
    let max_iter = 200;
    let mut q = sigma.clone();
    let mut a = A.clone();
    for _ in 0..max_iter {
        q = &q + &a * &q * a.transpose();
        a = &a * &a;
        let step = a.iter().fold(R::zero(), |acc, &x| {
            if x.abs() > acc {
                x.abs()
            } else {
                acc
            }
        });
        if step < tol {
            return Ok(q);
        }
    }
    Err(ErrorKind::LyapunovFailure.into())
}
