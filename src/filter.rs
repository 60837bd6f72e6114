use log::trace;
use na::{DMatrix, DVector, RealField};
use nalgebra as na;
use num_traits::Zero;

use crate::error::{Error, ErrorKind};
use crate::factorize::FactoredSystem;
use crate::initial::Initial;
use crate::zero_tol;

/// Everything the forward pass retains.
///
/// `a`, `P` and `Pd` hold one-step-ahead predictions: column/slice `t` is
/// the moment of the state at period `t` given data through `t - 1`, and
/// index `n` is the out-of-sample forecast. Per-series innovation
/// quantities live in `p x n` matrices and `m x p` per-period gain slices;
/// entries belonging to missing or skipped series stay zero, which is also
/// the marker the smoother uses to pass over them.
#[derive(Debug, Clone)]
pub struct FilterOutput<R: RealField + Copy> {
    /// Predicted state means, `m x (n + 1)`.
    pub a: DMatrix<R>,
    /// Predicted finite covariances, `n + 1` slices.
    pub P: Vec<DMatrix<R>>,
    /// Predicted diffuse covariances, `n + 1` slices; exactly zero once the
    /// diffuse block has collapsed.
    pub Pd: Vec<DMatrix<R>>,
    /// Univariate innovations, `p x n`.
    pub v: DMatrix<R>,
    /// Innovation variances (including observation noise), `p x n`.
    pub F: DMatrix<R>,
    /// Diffuse innovation variances, `p x n`.
    pub Fd: DMatrix<R>,
    /// Gains `P Z'` per period, `m x p`.
    pub K: Vec<DMatrix<R>>,
    /// Diffuse gains `Pd Z'` per period, `m x p`.
    pub Kd: Vec<DMatrix<R>>,
    /// Number of initial periods processed in the diffuse phase; the first
    /// standard period index.
    pub dt: usize,
    /// Exact log-likelihood of the sample.
    pub log_likelihood: R,
}

/// Run the exact-initial univariate forward recursion on a factored system.
pub(crate) fn run<R: RealField + Copy>(
    sys: &FactoredSystem<R>,
    init: &Initial<R>,
) -> Result<FilterOutput<R>, Error> {
    let n = sys.n;
    let m = sys.ss.m();
    let p = sys.ss.p();
    let tol = zero_tol::<R>();

    let mut a = DMatrix::<R>::zeros(m, n + 1);
    let mut P: Vec<DMatrix<R>> = Vec::with_capacity(n + 1);
    let mut Pd: Vec<DMatrix<R>> = Vec::with_capacity(n + 1);
    let mut v = DMatrix::<R>::zeros(p, n);
    let mut F = DMatrix::<R>::zeros(p, n);
    let mut Fd = DMatrix::<R>::zeros(p, n);
    let mut K: Vec<DMatrix<R>> = vec![DMatrix::zeros(m, p); n];
    let mut Kd: Vec<DMatrix<R>> = vec![DMatrix::zeros(m, p); n];

    // Initial transition from the resolved initial conditions.
    {
        let T0 = sys.ss.T(0);
        let R0 = sys.ss.R(0);
        a.set_column(0, &(T0 * &init.a0 + sys.ss.c(0)));
        P.push(T0 * init.Pstar0() * T0.transpose() + R0 * sys.ss.Q(0) * R0.transpose());
        Pd.push(snap_to_zero(T0 * init.Pinf0() * T0.transpose(), tol));
        trace!("initial P {}", pretty_print!(P[0]));
        trace!("initial Pd {}", pretty_print!(Pd[0]));
    }

    let mut dt = 0usize;
    let mut contributions = R::zero();
    let mut n_obs = 0usize;

    for t in 0..n {
        let diffuse_period = !Pd[t].iter().all(|x| x.is_zero());
        if diffuse_period {
            dt = t + 1;
        }

        let mut at = a.column(t).clone_owned();
        let mut Pt = P[t].clone();
        let mut Pdt = Pd[t].clone();
        let Zt = sys.ss.Z(t);
        let dt_vec = sys.ss.d(t);
        let Ht = sys.ss.H(t);

        for &j in &sys.observed[t] {
            n_obs += 1;
            let Zj = Zt.row(j);
            let vjt = sys.y[(j, t)] - (&Zj * &at)[(0, 0)] - dt_vec[j];
            let Kj = &Pt * Zj.transpose();
            let Fj = (&Zj * &Kj)[(0, 0)] + Ht[(j, j)];

            let Fdj = if diffuse_period {
                let Kdj = &Pdt * Zj.transpose();
                let Fdj = (&Zj * &Kdj)[(0, 0)];
                if Fdj > tol {
                    // Diffuse-nonsingular: the scalar observation removes one
                    // diffuse direction.
                    at += &Kdj * (vjt / Fdj);
                    Pt += (&Kdj * Kdj.transpose()) * (Fj / (Fdj * Fdj))
                        - (&Kj * Kdj.transpose() + &Kdj * Kj.transpose()) / Fdj;
                    Pdt -= (&Kdj * Kdj.transpose()) / Fdj;
                    contributions += Fdj.ln();
                    Kd[t].set_column(j, &Kdj);
                    record(&mut v, &mut F, &mut Fd, &mut K[t], j, t, vjt, Fj, Fdj, &Kj);
                    continue;
                }
                Fdj
            } else {
                R::zero()
            };

            if Fj > tol {
                at += &Kj * (vjt / Fj);
                Pt -= (&Kj * Kj.transpose()) / Fj;
                contributions += Fj.ln() + vjt * vjt / Fj;
                record(&mut v, &mut F, &mut Fd, &mut K[t], j, t, vjt, Fj, Fdj, &Kj);
            } else {
                // No information in this direction: nothing to update and
                // nothing for the likelihood.
                v[(j, t)] = R::zero();
            }
        }

        Pdt = snap_to_zero(Pdt, tol);
        debug_assert_symmetric!(Pt);
        debug_assert_symmetric!(Pdt);
        if diffuse_period && Pdt.iter().all(|x| x.is_zero()) {
            trace!("diffuse covariance collapsed within period {}", t);
        }

        let Tn = sys.ss.T(t + 1);
        let Rn = sys.ss.R(t + 1);
        a.set_column(t + 1, &(Tn * &at + sys.ss.c(t + 1)));
        P.push(Tn * &Pt * Tn.transpose() + Rn * sys.ss.Q(t + 1) * Rn.transpose());
        Pd.push(snap_to_zero(Tn * &Pdt * Tn.transpose(), tol));
    }

    if !Pd[n].iter().all(|x| x.is_zero()) {
        return Err(ErrorKind::DegenerateDiffuseInit.into());
    }

    let two_pi = R::two_pi();
    let half: R = na::convert(0.5);
    let log_likelihood =
        -half * na::convert::<_, R>(n_obs as f64) * two_pi.ln() - half * contributions;
    trace!("filtered {} periods, {} diffuse, logL {:?} ", n, dt, log_likelihood);

    Ok(FilterOutput {
        a,
        P,
        Pd,
        v,
        F,
        Fd,
        K,
        Kd,
        dt,
        log_likelihood,
    })
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn record<R: RealField + Copy>(
    v: &mut DMatrix<R>,
    F: &mut DMatrix<R>,
    Fd: &mut DMatrix<R>,
    K_t: &mut DMatrix<R>,
    j: usize,
    t: usize,
    vjt: R,
    Fj: R,
    Fdj: R,
    Kj: &DVector<R>,
) {
    v[(j, t)] = vjt;
    F[(j, t)] = Fj;
    Fd[(j, t)] = Fdj;
    K_t.set_column(j, Kj);
}

/// Replace a matrix whose entries are all below `tol` in magnitude by the
/// exact zero matrix, so phase decisions stay crisp downstream.
fn snap_to_zero<R: RealField + Copy>(mat: DMatrix<R>, tol: R) -> DMatrix<R> {
    if mat.iter().all(|x| x.abs() < tol) {
        DMatrix::zeros(mat.nrows(), mat.ncols())
    } else {
        mat
    }
}
