use na::{DMatrix, DVector, RealField};
use nalgebra as na;

use crate::error::{Error, ErrorKind};
use crate::factorize::FactoredSystem;
use crate::initial::Initial;
use crate::model::StateSpace;
use crate::moments::{self, pinv_sym};
use crate::zero_tol;
use crate::{filter, smoother};

/// Jacobians of each system matrix with respect to the free parameter
/// vector, supplied by the caller.
///
/// Each block has one row per free parameter and one column per entry of
/// the corresponding system matrix in column-major order. The gradient of
/// the log-likelihood is the sum over blocks of `G_block * vec(score_block)`;
/// this module never inspects the free parameters themselves.
#[derive(Debug, Clone)]
pub struct GradientMaps<R: RealField + Copy> {
    /// `ntheta x (p * m)`.
    pub Z: DMatrix<R>,
    /// `ntheta x p`.
    pub d: DMatrix<R>,
    /// `ntheta x (p * p)`.
    pub H: DMatrix<R>,
    /// `ntheta x (m * m)`.
    pub T: DMatrix<R>,
    /// `ntheta x m`.
    pub c: DMatrix<R>,
    /// `ntheta x (m * g)`.
    pub R: DMatrix<R>,
    /// `ntheta x (g * g)`.
    pub Q: DMatrix<R>,
    /// `ntheta x m`.
    pub a0: DMatrix<R>,
    /// `ntheta x (m * m)`.
    pub P0: DMatrix<R>,
}

impl<R: RealField + Copy> GradientMaps<R> {
    /// All-zero maps for `ntheta` free parameters; set the blocks that the
    /// parameterization actually touches.
    pub fn zeros(ntheta: usize, p: usize, m: usize, g: usize) -> Self {
        Self {
            Z: DMatrix::zeros(ntheta, p * m),
            d: DMatrix::zeros(ntheta, p),
            H: DMatrix::zeros(ntheta, p * p),
            T: DMatrix::zeros(ntheta, m * m),
            c: DMatrix::zeros(ntheta, m),
            R: DMatrix::zeros(ntheta, m * g),
            Q: DMatrix::zeros(ntheta, g * g),
            a0: DMatrix::zeros(ntheta, m),
            P0: DMatrix::zeros(ntheta, m * m),
        }
    }

    fn validate(&self, p: usize, m: usize, g: usize) -> Result<usize, Error> {
        let nt = self.Z.nrows();
        let rows_ok = [
            self.d.nrows(),
            self.H.nrows(),
            self.T.nrows(),
            self.c.nrows(),
            self.R.nrows(),
            self.Q.nrows(),
            self.a0.nrows(),
            self.P0.nrows(),
        ]
        .iter()
        .all(|&r| r == nt);
        let cols_ok = self.Z.ncols() == p * m
            && self.d.ncols() == p
            && self.H.ncols() == p * p
            && self.T.ncols() == m * m
            && self.c.ncols() == m
            && self.R.ncols() == m * g
            && self.Q.ncols() == g * g
            && self.a0.ncols() == m
            && self.P0.ncols() == m * m;
        if rows_ok && cols_ok {
            Ok(nt)
        } else {
            Err(ErrorKind::ShapeMismatch.into())
        }
    }
}

/// Log-likelihood and its gradient with respect to the free parameters.
///
/// The per-block scores are complete-data (EM) scores of the Gaussian
/// factors, which by Fisher's identity equal the observed-data scores, plus
/// the closed-form `(r r' - N) / 2` identity for the shock covariance and
/// the initial conditions. The identity holds through the exact-initial
/// phase; the transition-matrix score over diffuse periods relies on the
/// collapsed-phase cross covariance `J` and is exact once the diffuse block
/// has collapsed.
pub(crate) fn run<R: RealField + Copy>(
    ss: &StateSpace<R>,
    y: &DMatrix<R>,
    maps: &GradientMaps<R>,
) -> Result<(R, DVector<R>), Error> {
    let n = ss.validate(y)?;
    ss.check_finite()?;
    let (p, m, g) = (ss.p(), ss.m(), ss.g());
    let ntheta = maps.validate(p, m, g)?;
    let tol = zero_tol::<R>();
    let half: R = na::convert(0.5);

    let init = Initial::resolve(ss)?;
    let sys = FactoredSystem::build(ss, y, n)?;
    let filt = filter::run(&sys, &init)?;
    let smo = smoother::run(&sys, &filt, &init)?;
    let mom = moments::compute(ss, y, &sys, &filt, &smo, &init);

    let mut gZ = DMatrix::<R>::zeros(p, m);
    let mut gd = DVector::<R>::zeros(p);
    let mut gH = DMatrix::<R>::zeros(p, p);
    let mut gT = DMatrix::<R>::zeros(m, m);
    let mut gc = DVector::<R>::zeros(m);
    let mut gR = DMatrix::<R>::zeros(m, g);
    let mut gQ = DMatrix::<R>::zeros(g, g);

    // Measurement factors, observed rows only, original coordinates.
    for t in 0..n {
        let obs = &sys.observed[t];
        if obs.is_empty() {
            continue;
        }
        let alpha_t = smo.alpha.column(t).clone_owned();
        let z_obs = ss.Z(t).select_rows(obs);
        let h_obs = ss.H(t).select_rows(obs).select_columns(obs);
        let y_obs = DVector::from_iterator(obs.len(), obs.iter().map(|&j| y[(j, t)]));
        let d_obs = DVector::from_iterator(obs.len(), obs.iter().map(|&j| ss.d(t)[j]));
        let eps_obs =
            DVector::from_iterator(obs.len(), obs.iter().map(|&j| mom.epsilon[(j, t)]));
        let h_inv = pinv_sym(&h_obs, tol);
        let u = &h_inv * &eps_obs;

        let aa = &alpha_t * alpha_t.transpose() + &mom.V[t];
        let dZ = &h_inv * ((&y_obs - &d_obs) * alpha_t.transpose() - &z_obs * &aa);
        let d_blk = mom.D[t].select_rows(obs).select_columns(obs);
        let dH = (&u * u.transpose() - d_blk) * half;
        for (a, &i) in obs.iter().enumerate() {
            gd[i] += u[a];
            for k in 0..m {
                gZ[(i, k)] += dZ[(a, k)];
            }
            for (b, &j) in obs.iter().enumerate() {
                gH[(i, j)] += dH[(a, b)];
            }
        }
    }

    // Transition factors, one per arrival period.
    for s in 0..n {
        let Ts = ss.T(s);
        let cs = ss.c(s);
        let Rs = ss.R(s);
        let Qs = ss.Q(s);
        let sigma = Rs * Qs * Rs.transpose();
        let sigma_pinv = pinv_sym(&sigma, tol);

        let (alpha_prev, V_prev, J_prev) = if s == 0 {
            (smo.a0tilde.clone(), &mom.V_init, &mom.J_init)
        } else {
            (
                smo.alpha.column(s - 1).clone_owned(),
                &mom.V[s - 1],
                &mom.J[s - 1],
            )
        };
        let alpha_s = smo.alpha.column(s).clone_owned();

        let cross = &alpha_s * alpha_prev.transpose() + J_prev;
        let aa_prev = &alpha_prev * alpha_prev.transpose() + V_prev;
        gT += &sigma_pinv * (&cross - Ts * &aa_prev - cs * alpha_prev.transpose());
        gc += &sigma_pinv * (&alpha_s - Ts * &alpha_prev - cs);

        let r_s = smo.r.column(s);
        let S = (r_s * r_s.transpose() - &smo.N[s]) * half;
        gQ += Rs.transpose() * &S * Rs;
        gR += (&S + S.transpose()) * Rs * Qs;
    }

    let ga0 = smo.r0_init.clone();
    let gP0 =
        (&smo.r0_init * smo.r0_init.transpose() - &smo.N0_init) * half;

    let mut grad = DVector::<R>::zeros(ntheta);
    grad += &maps.Z * vec_of(&gZ);
    grad += &maps.d * &gd;
    grad += &maps.H * vec_of(&gH);
    grad += &maps.T * vec_of(&gT);
    grad += &maps.c * &gc;
    grad += &maps.R * vec_of(&gR);
    grad += &maps.Q * vec_of(&gQ);
    grad += &maps.a0 * &ga0;
    grad += &maps.P0 * vec_of(&gP0);

    Ok((filt.log_likelihood, grad))
}

/// Column-major vectorization.
fn vec_of<R: RealField + Copy>(mat: &DMatrix<R>) -> DVector<R> {
    DVector::from_iterator(mat.nrows() * mat.ncols(), mat.iter().copied())
}
