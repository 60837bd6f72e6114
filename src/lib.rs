//! Exact-initial univariate Kalman filtering and smoothing for linear
//! Gaussian state-space models.
//!
//! Characteristics:
//! - Uses the [nalgebra](https://nalgebra.org) crate for math.
//! - Handles time-varying system matrices through per-period parameter
//!   slices with O(1) access.
//! - Missing observations are marked with NaN and skipped per series, not
//!   treated as zeros.
//! - Diffuse (infinite-variance) initial states are handled analytically by
//!   tracking a separate diffuse covariance until the data collapses it,
//!   rather than by a large-variance approximation.
//! - Correlated observation noise is reduced to the univariate regime by an
//!   LDL' transformation of the measurement block.
//! - Produces the exact log-likelihood and its analytic gradient with
//!   respect to every system matrix.
//!
//! Throughout the library `p` is the number of observed series, `m` the
//! state dimension, `g` the state-shock dimension and `n` the number of
//! periods. The per-period recursions process one scalar observation at a
//! time, which is what makes the exact diffuse initialization tractable.
//!
//! The pipeline is linear: validate, initialize, factorize, filter forward,
//! smooth backward, then derive scores and smoothed moments. Each call is a
//! pure function of `(parameters, data)`; scratch tensors live for one call
//! and there is no process-wide state.

#![allow(non_snake_case)]

#[cfg(debug_assertions)]
use approx::assert_relative_eq;
use na::RealField;
use nalgebra as na;

/// perform a runtime check that matrix is symmetric
///
/// only compiled in debug mode
macro_rules! debug_assert_symmetric {
    ($mat:expr) => {
        #[cfg(debug_assertions)]
        {
            crate::assert_symmetric(&$mat);
        }
    };
}

/// convert an nalgebra array to a String
macro_rules! pretty_print {
    ($arr:expr) => {{
        let indent = 4;
        let prefix = String::from_utf8(vec![b' '; indent]).unwrap();
        let mut result_els = vec!["".to_string()];
        for i in 0..$arr.nrows() {
            let mut row_els = vec![];
            for j in 0..$arr.ncols() {
                row_els.push(format!("{:12.3}", $arr[(i, j)]));
            }
            let row_str = row_els.into_iter().collect::<Vec<_>>().join(" ");
            let row_str = format!("{}{}", prefix, row_str);
            result_els.push(row_str);
        }
        result_els.into_iter().collect::<Vec<_>>().join("\n")
    }};
}

mod error;
pub use error::{Error, ErrorKind};

mod model;
pub use model::{Param, StateSpace};

mod initial;
pub use initial::Initial;

mod factorize;
pub use factorize::FactoredSystem;

mod filter;
pub use filter::FilterOutput;

mod smoother;
pub use smoother::SmootherOutput;

mod moments;
pub use moments::SmoothedMoments;

mod gradient;
pub use gradient::GradientMaps;

mod decompose;
pub use decompose::Decomposition;

#[cfg(debug_assertions)]
fn assert_symmetric<R: RealField + Copy>(mat: &na::DMatrix<R>) {
    assert_relative_eq!(
        mat,
        &mat.transpose(),
        max_relative = na::convert(1e-5),
        epsilon = na::convert(1e-8)
    );
}

/// Tolerance below which an innovation variance counts as singular and a
/// diffuse covariance entry counts as collapsed.
fn zero_tol<R: RealField + Copy>() -> R {
    na::convert(1e-12)
}

#[inline]
fn is_nan<R: RealField>(x: R) -> bool {
    x.partial_cmp(&R::zero()).is_none()
}

/// NaN and both infinities fail this check; `x - x` is zero only for
/// finite values.
#[inline]
fn is_finite<R: RealField + Copy>(x: R) -> bool {
    !is_nan(x - x)
}

#[test]
fn test_is_nan() {
    assert_eq!(is_nan::<f64>(-1.0), false);
    assert_eq!(is_nan::<f64>(0.0), false);
    assert_eq!(is_nan::<f64>(1.0), false);
    assert_eq!(is_nan::<f64>(1.0 / 0.0), false);
    assert_eq!(is_nan::<f64>(-1.0 / 0.0), false);
    assert_eq!(is_nan::<f64>(f64::NAN), true);
}

#[test]
fn test_is_finite() {
    assert_eq!(is_finite::<f64>(0.0), true);
    assert_eq!(is_finite::<f64>(-3.5), true);
    assert_eq!(is_finite::<f64>(1.0 / 0.0), false);
    assert_eq!(is_finite::<f64>(-1.0 / 0.0), false);
    assert_eq!(is_finite::<f64>(f64::NAN), false);
}
