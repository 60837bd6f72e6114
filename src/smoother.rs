use log::trace;
use na::{DMatrix, DVector, RealField};
use nalgebra as na;

use crate::error::Error;
use crate::factorize::FactoredSystem;
use crate::filter::FilterOutput;
use crate::initial::Initial;
use crate::zero_tol;

/// Everything the backward pass produces.
///
/// `r` and `N` hold the smoothing residual and its variance as they stand
/// after all series of a period have been absorbed, i.e. the quantities that
/// pair with the *predicted* filter moments of the same period:
/// `alpha[:,t] = a[:,t] + P[t] r[:,t] (+ Pd[t] r1[:,t])`. During the diffuse
/// phase a second residual `r1` and two further variance terms `N1`, `N2`
/// keep the smoothed moments exact; they are zero from the collapse onward.
/// The `_init` fields are the same quantities propagated through the initial
/// transition, pairing with the initial conditions themselves.
#[derive(Debug, Clone)]
pub struct SmootherOutput<R: RealField + Copy> {
    /// Smoothed state means, `m x n`.
    pub alpha: DMatrix<R>,
    /// Smoothed state shocks arriving at each period, `g x n`.
    pub eta: DMatrix<R>,
    /// Smoothing residuals, `m x n`.
    pub r: DMatrix<R>,
    /// Smoothing residual variances, `n` slices of `m x m`.
    pub N: Vec<DMatrix<R>>,
    /// Diffuse smoothing residuals, `m x n`; zero outside the diffuse phase.
    pub r1: DMatrix<R>,
    /// Diffuse cross variance terms, `n` slices; zero outside the diffuse
    /// phase. The smoothed variance in the diffuse phase is
    /// `P - P N P - P N1' Pd - Pd N1 P - Pd N2 Pd`.
    pub N1: Vec<DMatrix<R>>,
    /// Diffuse quadratic variance terms, `n` slices; see `N1`.
    pub N2: Vec<DMatrix<R>>,
    /// Per-period composed measurement-update operator, `n` slices of
    /// `m x m`: the product of the scalar-update mean maps in series order.
    pub Lbar: Vec<DMatrix<R>>,
    /// Residual quantities propagated back through the initial transition.
    pub r0_init: DVector<R>,
    /// Diffuse counterpart of `r0_init`.
    pub r1_init: DVector<R>,
    /// Variance counterpart of `r0_init`.
    pub N0_init: DMatrix<R>,
    /// Diffuse cross variance at the initial state.
    pub N1_init: DMatrix<R>,
    /// Diffuse quadratic variance at the initial state.
    pub N2_init: DMatrix<R>,
    /// Smoothed initial state.
    pub a0tilde: DVector<R>,
    /// First standard period index, copied from the filter.
    pub dt: usize,
    /// Log-likelihood, copied from the filter.
    pub log_likelihood: R,
}

/// Run the backward smoother over retained filter output.
pub(crate) fn run<R: RealField + Copy>(
    sys: &FactoredSystem<R>,
    filt: &FilterOutput<R>,
    init: &Initial<R>,
) -> Result<SmootherOutput<R>, Error> {
    let n = sys.n;
    let m = sys.ss.m();
    let g = sys.ss.g();
    let tol = zero_tol::<R>();
    let dt = filt.dt;
    let eye = DMatrix::<R>::identity(m, m);

    let mut alpha = DMatrix::<R>::zeros(m, n);
    let mut eta = DMatrix::<R>::zeros(g, n);
    let mut r_out = DMatrix::<R>::zeros(m, n);
    let mut r1_out = DMatrix::<R>::zeros(m, n);
    let mut N_out = vec![DMatrix::<R>::zeros(m, m); n];
    let mut N1_out = vec![DMatrix::<R>::zeros(m, m); n];
    let mut N2_out = vec![DMatrix::<R>::zeros(m, m); n];
    let mut Lbar_out = vec![DMatrix::<R>::zeros(m, m); n];

    let mut r0 = DVector::<R>::zeros(m);
    let mut N0 = DMatrix::<R>::zeros(m, m);

    // Standard phase: periods past the diffuse collapse, latest first.
    for t in (dt..n).rev() {
        let Zt = sys.ss.Z(t);
        let mut Lbar = eye.clone();
        for &j in sys.observed[t].iter().rev() {
            let Fj = filt.F[(j, t)];
            if Fj <= tol {
                continue;
            }
            let Zj = Zt.row(j);
            let Kj = filt.K[t].column(j);
            let L = &eye - Kj * Zj / Fj;
            r0 = Zj.transpose() * (filt.v[(j, t)] / Fj) + L.transpose() * &r0;
            N0 = Zj.transpose() * Zj / Fj + L.transpose() * &N0 * &L;
            Lbar = &Lbar * &L;
        }
        r_out.set_column(t, &r0);
        N_out[t] = N0.clone();
        Lbar_out[t] = Lbar;

        alpha.set_column(t, &(filt.a.column(t) + &filt.P[t] * &r0));
        eta.set_column(t, &(sys.ss.Q(t) * sys.ss.R(t).transpose() * &r0));

        let Tt = sys.ss.T(t);
        r0 = Tt.transpose() * &r0;
        N0 = Tt.transpose() * &N0 * Tt;
    }

    // Exact-initial phase: the diffuse residual pair and its three variance
    // terms. The per-series maps are the stage-by-stage matching of the
    // smoothed-variance invariant against the diffuse covariance update.
    let mut r1 = DVector::<R>::zeros(m);
    let mut N1 = DMatrix::<R>::zeros(m, m);
    let mut N2 = DMatrix::<R>::zeros(m, m);
    for t in (0..dt).rev() {
        let Zt = sys.ss.Z(t);
        let mut Lbar = eye.clone();
        for &j in sys.observed[t].iter().rev() {
            let Fj = filt.F[(j, t)];
            let Fdj = filt.Fd[(j, t)];
            let Zj = Zt.row(j);
            if Fdj > tol {
                let Kj = filt.K[t].column(j);
                let Kdj = filt.Kd[t].column(j);
                let Ld = &eye - Kdj * Zj / Fdj;
                let M = (Kdj * (Fj / Fdj) - Kj) * Zj / Fdj;

                r1 = Zj.transpose() * (filt.v[(j, t)] / Fdj)
                    + M.transpose() * &r0
                    + Ld.transpose() * &r1;
                r0 = Ld.transpose() * &r0;

                let ZtZ = Zj.transpose() * Zj;
                let N2_new = -(&ZtZ) * (Fj / (Fdj * Fdj))
                    + M.transpose() * &N0 * &M
                    + M.transpose() * N1.transpose() * &Ld
                    + Ld.transpose() * &N1 * &M
                    + Ld.transpose() * &N2 * &Ld;
                let N1_new =
                    &ZtZ / Fdj + M.transpose() * &N0 * &Ld + Ld.transpose() * &N1 * &Ld;
                let N0_new = Ld.transpose() * &N0 * &Ld;
                N2 = N2_new;
                N1 = N1_new;
                N0 = N0_new;
                Lbar = &Lbar * &Ld;
            } else if Fj > tol {
                let Kj = filt.K[t].column(j);
                let L = &eye - Kj * Zj / Fj;
                r0 = Zj.transpose() * (filt.v[(j, t)] / Fj) + L.transpose() * &r0;
                N0 = Zj.transpose() * Zj / Fj + L.transpose() * &N0 * &L;
                N1 = &N1 * &L;
                Lbar = &Lbar * &L;
            }
        }
        r_out.set_column(t, &r0);
        r1_out.set_column(t, &r1);
        N_out[t] = N0.clone();
        N1_out[t] = N1.clone();
        N2_out[t] = N2.clone();
        Lbar_out[t] = Lbar;

        alpha.set_column(
            t,
            &(filt.a.column(t) + &filt.P[t] * &r0 + &filt.Pd[t] * &r1),
        );
        eta.set_column(t, &(sys.ss.Q(t) * sys.ss.R(t).transpose() * &r0));

        let Tt = sys.ss.T(t);
        r0 = Tt.transpose() * &r0;
        r1 = Tt.transpose() * &r1;
        N0 = Tt.transpose() * &N0 * Tt;
        N1 = Tt.transpose() * &N1 * Tt;
        N2 = Tt.transpose() * &N2 * Tt;
    }

    let Pstar0 = init.Pstar0();
    let a0tilde = if dt > 0 {
        &init.a0 + &Pstar0 * &r0 + init.Pinf0() * &r1
    } else {
        &init.a0 + &Pstar0 * &r0
    };
    trace!("smoothed {} periods, {} diffuse", n, dt);

    Ok(SmootherOutput {
        alpha,
        eta,
        r: r_out,
        N: N_out,
        r1: r1_out,
        N1: N1_out,
        N2: N2_out,
        Lbar: Lbar_out,
        r0_init: r0,
        r1_init: r1,
        N0_init: N0,
        N1_init: N1,
        N2_init: N2,
        a0tilde,
        dt,
        log_likelihood: filt.log_likelihood,
    })
}
