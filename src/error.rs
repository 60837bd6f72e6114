use std::error;
use std::fmt;

/// The error type returned by every fallible operation in this crate.
///
/// All errors are fatal to the call that produced them: no partial filter
/// output or likelihood is ever returned alongside an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
}

/// Stores the different kinds of errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A parameter slice, tau mapping or the data matrix has an
    /// inconsistent dimension.
    ShapeMismatch,
    /// A parameter entry is NaN or infinite at filter entry.
    UnknownParameter,
    /// The stationary block keeps an eigenvalue on or outside the unit
    /// circle after partitioning.
    NonStationarySection,
    /// The initial-covariance Lyapunov solve is singular, or the iterative
    /// fallback failed to converge.
    LyapunovFailure,
    /// The LDL factorization of an observation covariance hit a negative
    /// pivot, or a zero pivot with a nonzero remaining column.
    NonPsdObservationCov,
    /// The diffuse part of the state covariance never collapsed within the
    /// sample.
    DegenerateDiffuseInit,
}

impl Error {
    /// The kind of failure that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::ShapeMismatch => {
                write!(f, "parameter or data dimensions are inconsistent")
            }
            ErrorKind::UnknownParameter => {
                write!(f, "a parameter entry is NaN or infinite")
            }
            ErrorKind::NonStationarySection => write!(
                f,
                "the stationary block has an eigenvalue on or outside the unit circle"
            ),
            ErrorKind::LyapunovFailure => {
                write!(f, "the initial-covariance Lyapunov equation could not be solved")
            }
            ErrorKind::NonPsdObservationCov => write!(
                f,
                "an observation covariance slice is not positive semi-definite"
            ),
            ErrorKind::DegenerateDiffuseInit => write!(
                f,
                "the diffuse initial covariance never collapsed within the sample"
            ),
        }
    }
}

impl error::Error for Error {}
