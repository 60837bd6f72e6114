use std::collections::HashMap;

use log::trace;
use na::{DMatrix, DVector, RealField};
use nalgebra as na;

use crate::error::{Error, ErrorKind};
use crate::is_nan;
use crate::model::{Param, StateSpace};

/// A model reduced to diagonal observation noise, together with the
/// correspondingly transformed data.
///
/// The univariate filter is exact only when the measurement noise is
/// diagonal. For every unique combination of observation-noise slice and
/// missingness pattern, the observed block of `H` is factored as `L D L'`
/// with `L` unit-lower-triangular, and the observed rows of `y`, `Z` and
/// `d` are premultiplied by `L^-1`. Transition parameters are untouched and
/// the state itself is not rotated, so filter and smoother state output is
/// directly comparable with the original model.
#[derive(Debug, Clone)]
pub struct FactoredSystem<R: RealField + Copy> {
    /// The transformed model; every `H` slice is diagonal.
    pub ss: StateSpace<R>,
    /// The transformed data. Missing entries stay NaN.
    pub y: DMatrix<R>,
    /// Sample length.
    pub n: usize,
    /// Observed series indices per period, ascending.
    pub observed: Vec<Vec<usize>>,
}

impl<R: RealField + Copy> FactoredSystem<R> {
    /// Reduce `ss` to the diagonal-noise regime over data `y`.
    ///
    /// A model whose `H` slices are all diagonal passes through unchanged
    /// apart from the missingness bookkeeping.
    pub fn build(ss: &StateSpace<R>, y: &DMatrix<R>, n: usize) -> Result<Self, Error> {
        let observed: Vec<Vec<usize>> = (0..n)
            .map(|t| (0..ss.p()).filter(|&j| !is_nan(y[(j, t)])).collect())
            .collect();

        if ss.H.slices().iter().all(|h| is_diagonal(h)) {
            return Ok(Self {
                ss: ss.clone(),
                y: y.clone(),
                n,
                observed,
            });
        }

        let p = ss.p();
        let mut y_out = y.clone();

        // One factorization per distinct (H slice, pattern); one transformed
        // Z / d slice per distinct (Z or d slice, H slice, pattern).
        let mut h_keys: HashMap<(usize, Vec<usize>), (usize, DMatrix<R>)> = HashMap::new();
        let mut z_keys: HashMap<(usize, usize), usize> = HashMap::new();
        let mut d_keys: HashMap<(usize, usize), usize> = HashMap::new();
        let mut h_slices: Vec<DMatrix<R>> = Vec::new();
        let mut z_slices: Vec<DMatrix<R>> = Vec::new();
        let mut d_slices: Vec<DVector<R>> = Vec::new();
        let mut tau_h = Vec::with_capacity(n);
        let mut tau_z = Vec::with_capacity(n);
        let mut tau_d = Vec::with_capacity(n);

        let slice_index = |param: &Param<DMatrix<R>>, t: usize| -> usize {
            param.tau().map_or(0, |tau| tau[t])
        };
        let vec_slice_index =
            |param: &Param<DVector<R>>, t: usize| -> usize { param.tau().map_or(0, |tau| tau[t]) };

        for t in 0..n {
            let obs = &observed[t];
            let hi = slice_index(&ss.H, t);
            let zi = slice_index(&ss.Z, t);
            let di = vec_slice_index(&ss.d, t);

            let h_key = (hi, obs.clone());
            let (h_new, chol) = match h_keys.get(&h_key) {
                Some((idx, chol)) => (*idx, chol.clone()),
                None => {
                    let h_obs = ss.H(t).select_rows(obs).select_columns(obs);
                    let (low, diag) = ldl_unit_lower(&h_obs)?;
                    trace!("factored H slice {} over {} observed series", hi, obs.len());
                    let mut h_diag = DMatrix::zeros(p, p);
                    for (k, &j) in obs.iter().enumerate() {
                        h_diag[(j, j)] = diag[k];
                    }
                    let idx = h_slices.len();
                    h_slices.push(h_diag);
                    h_keys.insert(h_key, (idx, low.clone()));
                    (idx, low)
                }
            };
            tau_h.push(h_new);

            let z_new = match z_keys.get(&(zi, h_new)) {
                Some(idx) => *idx,
                None => {
                    let mut z = ss.Z(t).clone();
                    let z_obs = z.select_rows(obs);
                    let solved = solve_unit_lower(&chol, &z_obs);
                    for (k, &j) in obs.iter().enumerate() {
                        z.row_mut(j).copy_from(&solved.row(k));
                    }
                    let idx = z_slices.len();
                    z_slices.push(z);
                    z_keys.insert((zi, h_new), idx);
                    idx
                }
            };
            tau_z.push(z_new);

            let d_new = match d_keys.get(&(di, h_new)) {
                Some(idx) => *idx,
                None => {
                    let mut dv = ss.d(t).clone();
                    let d_obs = DVector::from_iterator(obs.len(), obs.iter().map(|&j| dv[j]));
                    let solved = solve_unit_lower(&chol, &d_obs);
                    for (k, &j) in obs.iter().enumerate() {
                        dv[j] = solved[(k, 0)];
                    }
                    let idx = d_slices.len();
                    d_slices.push(dv);
                    d_keys.insert((di, h_new), idx);
                    idx
                }
            };
            tau_d.push(d_new);

            // The data transform is per period, not per slice.
            let y_obs = DVector::from_iterator(obs.len(), obs.iter().map(|&j| y[(j, t)]));
            let solved = solve_unit_lower(&chol, &y_obs);
            for (k, &j) in obs.iter().enumerate() {
                y_out[(j, t)] = solved[(k, 0)];
            }
        }

        let mut ss_out = ss.clone();
        ss_out.H = Param::Varying {
            slices: h_slices,
            tau: tau_h,
        };
        ss_out.Z = Param::Varying {
            slices: z_slices,
            tau: tau_z,
        };
        ss_out.d = Param::Varying {
            slices: d_slices,
            tau: tau_d,
        };

        Ok(Self {
            ss: ss_out,
            y: y_out,
            n,
            observed,
        })
    }
}

fn is_diagonal<R: RealField + Copy>(mat: &DMatrix<R>) -> bool {
    for i in 0..mat.nrows() {
        for j in 0..mat.ncols() {
            if i != j && mat[(i, j)] != R::zero() {
                return false;
            }
        }
    }
    true
}

/// `A = L D L'` with `L` unit-lower-triangular and `D` diagonal, by the
/// outer-product recurrence.
///
/// A zero pivot is tolerated when its remaining column is zero too (the
/// positive semi-definite singular case); a negative pivot, or a zero pivot
/// with a nonzero column, is an indefinite observation covariance.
fn ldl_unit_lower<R: RealField + Copy>(
    mat: &DMatrix<R>,
) -> Result<(DMatrix<R>, DVector<R>), Error> {
    let k = mat.nrows();
    let scale = mat
        .iter()
        .fold(R::one(), |acc, &x| if x.abs() > acc { x.abs() } else { acc });
    let tol = scale * na::convert::<_, R>(1e-12);
    let mut low = DMatrix::identity(k, k);
    let mut diag = DVector::zeros(k);
    for j in 0..k {
        let mut dj = mat[(j, j)];
        for s in 0..j {
            dj -= low[(j, s)] * low[(j, s)] * diag[s];
        }
        if dj < -tol {
            return Err(ErrorKind::NonPsdObservationCov.into());
        }
        if dj.abs() <= tol {
            for i in (j + 1)..k {
                let mut lij = mat[(i, j)];
                for s in 0..j {
                    lij -= low[(i, s)] * low[(j, s)] * diag[s];
                }
                if lij.abs() > tol {
                    return Err(ErrorKind::NonPsdObservationCov.into());
                }
            }
            diag[j] = R::zero();
        } else {
            diag[j] = dj;
            for i in (j + 1)..k {
                let mut lij = mat[(i, j)];
                for s in 0..j {
                    lij -= low[(i, s)] * low[(j, s)] * diag[s];
                }
                low[(i, j)] = lij / dj;
            }
        }
    }
    Ok((low, diag))
}

/// Forward substitution with a unit-lower-triangular matrix.
fn solve_unit_lower<R, C>(
    low: &DMatrix<R>,
    b: &na::OMatrix<R, na::Dynamic, C>,
) -> na::OMatrix<R, na::Dynamic, C>
where
    R: RealField + Copy,
    C: na::Dim,
    na::DefaultAllocator: na::allocator::Allocator<R, na::Dynamic, C>,
{
    let mut x = b.clone_owned();
    let k = low.nrows();
    for col in 0..x.ncols() {
        for i in 0..k {
            let mut acc = x[(i, col)];
            for s in 0..i {
                acc -= low[(i, s)] * x[(s, col)];
            }
            x[(i, col)] = acc;
        }
    }
    x
}
