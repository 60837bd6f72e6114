use na::{DMatrix, RealField};
use nalgebra as na;

use crate::error::{Error, ErrorKind};
use crate::is_nan;
use crate::model::StateSpace;

/// Linear decomposition of the smoothed state at selected periods:
///
/// ```text
/// alpha[:,t] = sum_s weights[k][s] * y[:,s] + constant[:,k],   t = periods[k]
/// ```
///
/// Weight columns belonging to missing observations are zero, and the
/// constant column collects the intercept and initial-condition
/// contributions.
#[derive(Debug, Clone)]
pub struct Decomposition<R: RealField + Copy> {
    /// `weights[k][s]` is the `m x p` weight of data column `s` on the
    /// smoothed state at `periods[k]`.
    pub weights: Vec<Vec<DMatrix<R>>>,
    /// Constant contribution per requested period, `m x periods.len()`.
    pub constant: DMatrix<R>,
    /// The requested effect periods, as passed in.
    pub periods: Vec<usize>,
}

/// Compute the decomposition by probing the pipeline's affinity in the data.
///
/// For a fixed missingness pattern the whole factorize/filter/smooth chain
/// is affine in `y`: the gains, variances and factorizations depend on the
/// parameters and the pattern only. One pass on zeroed data yields the
/// constant term; one pass per observed entry, with that entry set to one,
/// yields the corresponding weight column exactly.
pub(crate) fn run<R: RealField + Copy>(
    ss: &StateSpace<R>,
    y: &DMatrix<R>,
    periods: &[usize],
) -> Result<Decomposition<R>, Error> {
    let n = ss.validate(y)?;
    ss.check_finite()?;
    if periods.iter().any(|&t| t >= n) {
        return Err(ErrorKind::ShapeMismatch.into());
    }
    let p = ss.p();
    let m = ss.m();

    // Zero data, same pattern.
    let base = y.map(|x| if is_nan(x) { x } else { R::zero() });
    let (smo, _) = ss.smooth(&base)?;
    let alpha_base = smo.alpha;

    let mut weights =
        vec![vec![DMatrix::<R>::zeros(m, p); n]; periods.len()];
    for s in 0..n {
        for j in 0..p {
            if is_nan(y[(j, s)]) {
                continue;
            }
            let mut probe = base.clone();
            probe[(j, s)] = R::one();
            let (smo, _) = ss.smooth(&probe)?;
            for (k, &tp) in periods.iter().enumerate() {
                let col = smo.alpha.column(tp) - alpha_base.column(tp);
                weights[k][s].set_column(j, &col);
            }
        }
    }

    let mut constant = DMatrix::zeros(m, periods.len());
    for (k, &tp) in periods.iter().enumerate() {
        constant.set_column(k, &alpha_base.column(tp));
    }

    Ok(Decomposition {
        weights,
        constant,
        periods: periods.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use na::DVector;

    #[test]
    fn decomposition_rebuilds_the_smoothed_state() {
        let ss = StateSpace::new_invariant(
            DMatrix::from_row_slice(2, 1, &[1.0, 0.7]),
            DVector::from_row_slice(&[0.2, -0.1]),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.3, 0.8]),
            DMatrix::from_element(1, 1, 1.0),
            DVector::from_element(1, 0.05),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 0.6),
        )
        .unwrap();
        let y = DMatrix::from_row_slice(
            2,
            4,
            &[1.0, 1.4, f64::NAN, 1.1, 0.9, 0.6, 1.2, 0.8],
        );
        let periods = [0usize, 2, 3];
        let dec = ss.decompose_smoothed(&y, &periods).unwrap();
        let (smo, _) = ss.smooth(&y).unwrap();

        let y_filled = y.map(|x| if x.is_nan() { 0.0 } else { x });
        for (k, &tp) in periods.iter().enumerate() {
            let mut rebuilt = dec.constant.column(k).clone_owned();
            for s in 0..4 {
                rebuilt += &dec.weights[k][s] * y_filled.column(s);
            }
            assert_relative_eq!(
                rebuilt,
                smo.alpha.column(tp).clone_owned(),
                max_relative = 1e-8,
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn missing_entries_carry_zero_weight() {
        let ss = StateSpace::new_invariant(
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
        )
        .unwrap();
        let y = DMatrix::from_row_slice(1, 3, &[1.0, f64::NAN, 2.0]);
        let dec = ss.decompose_smoothed(&y, &[1]).unwrap();
        assert_eq!(dec.weights[0][1][(0, 0)], 0.0);
        assert!(dec.weights[0][0][(0, 0)] != 0.0);
    }

    #[test]
    fn out_of_range_period_is_rejected() {
        let ss = StateSpace::new_invariant(
            DMatrix::from_element(1, 1, 1.0),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 0.5),
            DVector::zeros(1),
            DMatrix::from_element(1, 1, 1.0),
            DMatrix::from_element(1, 1, 1.0),
        )
        .unwrap();
        let y = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let err = ss.decompose_smoothed(&y, &[5]).unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::ShapeMismatch);
    }
}
