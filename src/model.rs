use na::{DMatrix, DVector, RealField};
use nalgebra as na;

use crate::error::{Error, ErrorKind};
use crate::factorize::FactoredSystem;
use crate::gradient::{self, GradientMaps};
use crate::initial::Initial;
use crate::{decompose, filter, is_finite, is_nan, moments, smoother};
use crate::{Decomposition, FilterOutput, SmoothedMoments, SmootherOutput};

/// A system matrix that is either constant over the sample or selected per
/// period from a set of slices.
///
/// The `tau` mapping assigns a slice index to every period, so access stays
/// O(1) regardless of how many distinct slices exist.
#[derive(Debug, Clone)]
pub enum Param<X> {
    /// One slice used at every period.
    Constant(X),
    /// A set of slices and a per-period selection.
    Varying {
        /// The distinct values this parameter takes.
        slices: Vec<X>,
        /// `tau[t]` is the slice index governing period `t`. Measurement
        /// parameters carry `n` entries; transition parameters carry `n + 1`
        /// (entry `t` governs the transition *into* period `t`, entry `n`
        /// the final forecast propagation).
        tau: Vec<usize>,
    },
}

impl<X> Param<X> {
    /// The slice governing period `t`.
    #[inline]
    pub fn at(&self, t: usize) -> &X {
        match self {
            Param::Constant(x) => x,
            Param::Varying { slices, tau } => &slices[tau[t]],
        }
    }

    /// All distinct slices.
    pub fn slices(&self) -> &[X] {
        match self {
            Param::Constant(x) => std::slice::from_ref(x),
            Param::Varying { slices, .. } => slices,
        }
    }

    /// The tau mapping, if this parameter varies.
    pub fn tau(&self) -> Option<&[usize]> {
        match self {
            Param::Constant(_) => None,
            Param::Varying { tau, .. } => Some(tau),
        }
    }
}

/// A linear Gaussian state-space model
///
/// ```text
/// y_t     = Z_t alpha_t + d_t + eps_t,   eps_t ~ N(0, H_t)
/// alpha_t = T_t alpha_{t-1} + c_t + R_t eta_t,   eta_t ~ N(0, Q_t)
/// ```
///
/// with `p` observed series, `m` states and `g` state shocks. Every system
/// matrix may be constant or period-varying. The model owns its parameters;
/// a filter or smoother call never mutates them.
#[derive(Debug, Clone)]
pub struct StateSpace<R: RealField + Copy> {
    pub(crate) p: usize,
    pub(crate) m: usize,
    pub(crate) g: usize,
    pub(crate) Z: Param<DMatrix<R>>,
    pub(crate) d: Param<DVector<R>>,
    pub(crate) H: Param<DMatrix<R>>,
    pub(crate) T: Param<DMatrix<R>>,
    pub(crate) c: Param<DVector<R>>,
    pub(crate) R: Param<DMatrix<R>>,
    pub(crate) Q: Param<DMatrix<R>>,
    /// Explicit initial state mean, overriding the stationary default.
    pub(crate) a0: Option<DVector<R>>,
    /// Explicit initial state covariance; `+inf` diagonal entries mark
    /// diffuse states.
    pub(crate) P0: Option<DMatrix<R>>,
}

impl<R: RealField + Copy> StateSpace<R> {
    /// Build a model from period-varying parameters.
    ///
    /// Dimensions are taken from the first slice of each parameter and every
    /// other slice is checked against them.
    pub fn new(
        Z: Param<DMatrix<R>>,
        d: Param<DVector<R>>,
        H: Param<DMatrix<R>>,
        T: Param<DMatrix<R>>,
        c: Param<DVector<R>>,
        R: Param<DMatrix<R>>,
        Q: Param<DMatrix<R>>,
    ) -> Result<Self, Error> {
        let z0 = Z.slices().first().ok_or(ErrorKind::ShapeMismatch)?;
        let r0 = R.slices().first().ok_or(ErrorKind::ShapeMismatch)?;
        let (p, m) = z0.shape();
        let g = r0.ncols();
        let ss = Self {
            p,
            m,
            g,
            Z,
            d,
            H,
            T,
            c,
            R,
            Q,
            a0: None,
            P0: None,
        };
        ss.check_shapes()?;
        Ok(ss)
    }

    /// Build a time-invariant model.
    pub fn new_invariant(
        Z: DMatrix<R>,
        d: DVector<R>,
        H: DMatrix<R>,
        T: DMatrix<R>,
        c: DVector<R>,
        R: DMatrix<R>,
        Q: DMatrix<R>,
    ) -> Result<Self, Error> {
        Self::new(
            Param::Constant(Z),
            Param::Constant(d),
            Param::Constant(H),
            Param::Constant(T),
            Param::Constant(c),
            Param::Constant(R),
            Param::Constant(Q),
        )
    }

    /// Override the default initial conditions.
    ///
    /// A `P0` containing `+inf` diagonal entries declares those states
    /// diffuse regardless of the eigenstructure of the transition.
    pub fn with_initial(mut self, a0: Option<DVector<R>>, P0: Option<DMatrix<R>>) -> Self {
        self.a0 = a0;
        self.P0 = P0;
        self
    }

    /// Number of observed series.
    pub fn p(&self) -> usize {
        self.p
    }

    /// State dimension.
    pub fn m(&self) -> usize {
        self.m
    }

    /// State-shock dimension.
    pub fn g(&self) -> usize {
        self.g
    }

    /// Measurement loading at period `t`.
    #[inline]
    pub fn Z(&self, t: usize) -> &DMatrix<R> {
        self.Z.at(t)
    }

    /// Measurement intercept at period `t`.
    #[inline]
    pub fn d(&self, t: usize) -> &DVector<R> {
        self.d.at(t)
    }

    /// Observation noise covariance at period `t`.
    #[inline]
    pub fn H(&self, t: usize) -> &DMatrix<R> {
        self.H.at(t)
    }

    /// Transition matrix governing the step into period `t`.
    #[inline]
    pub fn T(&self, t: usize) -> &DMatrix<R> {
        self.T.at(t)
    }

    /// Transition intercept governing the step into period `t`.
    #[inline]
    pub fn c(&self, t: usize) -> &DVector<R> {
        self.c.at(t)
    }

    /// State-shock selector governing the step into period `t`.
    #[inline]
    pub fn R(&self, t: usize) -> &DMatrix<R> {
        self.R.at(t)
    }

    /// State-shock covariance governing the step into period `t`.
    #[inline]
    pub fn Q(&self, t: usize) -> &DMatrix<R> {
        self.Q.at(t)
    }

    /// The number of periods pinned down by the tau mappings, if any
    /// parameter varies.
    pub fn n_periods(&self) -> Option<usize> {
        let mut n: Option<usize> = None;
        let meas = [self.Z.tau(), self.d.tau(), self.H.tau()];
        let trans = [self.T.tau(), self.c.tau(), self.R.tau(), self.Q.tau()];
        for tau in meas.into_iter().flatten() {
            n = n.or(Some(tau.len()));
        }
        for tau in trans.into_iter().flatten() {
            n = n.or_else(|| Some(tau.len().saturating_sub(1)));
        }
        n
    }

    /// Check the data matrix against the model and resolve the sample
    /// length.
    pub fn validate(&self, y: &DMatrix<R>) -> Result<usize, Error> {
        if y.nrows() != self.p {
            return Err(ErrorKind::ShapeMismatch.into());
        }
        let n = y.ncols();
        if n == 0 {
            return Err(ErrorKind::ShapeMismatch.into());
        }
        if let Some(fixed) = self.n_periods() {
            if fixed != n {
                return Err(ErrorKind::ShapeMismatch.into());
            }
        }
        self.check_taus(n)?;
        Ok(n)
    }

    fn check_shapes(&self) -> Result<(), Error> {
        let (p, m, g) = (self.p, self.m, self.g);
        let ok = self.Z.slices().iter().all(|z| z.shape() == (p, m))
            && self.d.slices().iter().all(|d| d.len() == p)
            && self.H.slices().iter().all(|h| h.shape() == (p, p))
            && self.T.slices().iter().all(|t| t.shape() == (m, m))
            && self.c.slices().iter().all(|c| c.len() == m)
            && self.R.slices().iter().all(|r| r.shape() == (m, g))
            && self.Q.slices().iter().all(|q| q.shape() == (g, g));
        if !ok {
            return Err(ErrorKind::ShapeMismatch.into());
        }
        if let Some(a0) = &self.a0 {
            if a0.len() != m {
                return Err(ErrorKind::ShapeMismatch.into());
            }
        }
        if let Some(P0) = &self.P0 {
            if P0.shape() != (m, m) {
                return Err(ErrorKind::ShapeMismatch.into());
            }
        }
        Ok(())
    }

    fn check_taus(&self, n: usize) -> Result<(), Error> {
        let meas: [(Option<&[usize]>, usize); 3] = [
            (self.Z.tau(), self.Z.slices().len()),
            (self.d.tau(), self.d.slices().len()),
            (self.H.tau(), self.H.slices().len()),
        ];
        let trans: [(Option<&[usize]>, usize); 4] = [
            (self.T.tau(), self.T.slices().len()),
            (self.c.tau(), self.c.slices().len()),
            (self.R.tau(), self.R.slices().len()),
            (self.Q.tau(), self.Q.slices().len()),
        ];
        for (tau, len) in meas {
            if let Some(tau) = tau {
                if tau.len() != n || tau.iter().any(|&i| i >= len) {
                    return Err(ErrorKind::ShapeMismatch.into());
                }
            }
        }
        for (tau, len) in trans {
            if let Some(tau) = tau {
                if tau.len() != n + 1 || tau.iter().any(|&i| i >= len) {
                    return Err(ErrorKind::ShapeMismatch.into());
                }
            }
        }
        Ok(())
    }

    /// Screen every parameter entry for NaN or infinities. Runs at filter
    /// entry; the explicit `P0` override is exempt on the diagonal, where
    /// `+inf` marks a diffuse state.
    pub(crate) fn check_finite(&self) -> Result<(), Error> {
        fn mats_ok<R: RealField + Copy>(p: &Param<DMatrix<R>>) -> bool {
            p.slices()
                .iter()
                .all(|x| x.iter().all(|&e| is_finite(e)))
        }
        fn vecs_ok<R: RealField + Copy>(p: &Param<DVector<R>>) -> bool {
            p.slices()
                .iter()
                .all(|x| x.iter().all(|&e| is_finite(e)))
        }
        let ok = mats_ok(&self.Z)
            && vecs_ok(&self.d)
            && mats_ok(&self.H)
            && mats_ok(&self.T)
            && vecs_ok(&self.c)
            && mats_ok(&self.R)
            && mats_ok(&self.Q);
        if !ok {
            return Err(ErrorKind::UnknownParameter.into());
        }
        if let Some(a0) = &self.a0 {
            if a0.iter().any(|&e| !is_finite(e)) {
                return Err(ErrorKind::UnknownParameter.into());
            }
        }
        if let Some(P0) = &self.P0 {
            for i in 0..P0.nrows() {
                for j in 0..P0.ncols() {
                    let e = P0[(i, j)];
                    let diffuse_mark = i == j && !is_nan(e) && e > R::zero() && !is_finite(e);
                    if !is_finite(e) && !diffuse_mark {
                        return Err(ErrorKind::UnknownParameter.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the exact-initial univariate filter.
    pub fn filter(&self, y: &DMatrix<R>) -> Result<FilterOutput<R>, Error> {
        let n = self.validate(y)?;
        self.check_finite()?;
        let init = Initial::resolve(self)?;
        let sys = FactoredSystem::build(self, y, n)?;
        filter::run(&sys, &init)
    }

    /// Run the filter and the backward smoother.
    pub fn smooth(&self, y: &DMatrix<R>) -> Result<(SmootherOutput<R>, FilterOutput<R>), Error> {
        let n = self.validate(y)?;
        self.check_finite()?;
        let init = Initial::resolve(self)?;
        let sys = FactoredSystem::build(self, y, n)?;
        let filt = filter::run(&sys, &init)?;
        let smo = smoother::run(&sys, &filt, &init)?;
        Ok((smo, filt))
    }

    /// Run the full pipeline and recover the smoothed second moments and
    /// observation residuals alongside the smoother and filter output.
    pub fn smoothed_moments(
        &self,
        y: &DMatrix<R>,
    ) -> Result<(SmoothedMoments<R>, SmootherOutput<R>, FilterOutput<R>), Error> {
        let n = self.validate(y)?;
        self.check_finite()?;
        let init = Initial::resolve(self)?;
        let sys = FactoredSystem::build(self, y, n)?;
        let filt = filter::run(&sys, &init)?;
        let smo = smoother::run(&sys, &filt, &init)?;
        let mom = moments::compute(self, y, &sys, &filt, &smo, &init);
        Ok((mom, smo, filt))
    }

    /// Log-likelihood and its analytic gradient with respect to the free
    /// parameter vector described by `maps`.
    pub fn gradient(
        &self,
        y: &DMatrix<R>,
        maps: &GradientMaps<R>,
    ) -> Result<(R, DVector<R>), Error> {
        gradient::run(self, y, maps)
    }

    /// Decompose the smoothed state at the requested periods into per-datum
    /// weights plus a constant contribution.
    pub fn decompose_smoothed(
        &self,
        y: &DMatrix<R>,
        periods: &[usize],
    ) -> Result<Decomposition<R>, Error> {
        decompose::run(self, y, periods)
    }
}
