//! Error taxonomy shared by graph construction, evaluation and the solver layer.

use thiserror::Error;

use crate::shape::Shape;

/// Errors raised while building expression graphs, flattening functions, evaluating
/// them, or driving the lifted solve loop.
///
/// Every variant halts the current call and is returned to the immediate caller; nothing
/// in this crate retries.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Operand dimensions do not agree.
    #[error("shape mismatch in {op}: {lhs} vs {rhs}")]
    Shape {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    /// Slice or element access outside the declared bounds.
    #[error("index out of range in {op}: {index} not within {bound}")]
    Index {
        op: &'static str,
        index: String,
        bound: String,
    },
    /// An output depends on a symbol that is not among the declared inputs.
    #[error("output depends on unbound symbol '{0}'")]
    UnboundSymbol(String),
    /// NaN/Inf or a violated symmetry / definiteness precondition.
    #[error("numeric error: {0}")]
    Numeric(String),
    /// An external solve (QP, linear system) reported failure.
    #[error("solver failure: {0}")]
    SolverFailure(String),
    /// Malformed call: wrong number of ports, non-symbolic input, bad settings.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A sequential substitution referenced a variable before its definition.
    #[error("substitution error: {0}")]
    Substitution(String),
}

impl Error {
    pub(crate) fn shape(op: &'static str, lhs: Shape, rhs: Shape) -> Self {
        Error::Shape { op, lhs, rhs }
    }

    pub(crate) fn index(op: &'static str, index: impl ToString, bound: impl ToString) -> Self {
        Error::Index {
            op,
            index: index.to_string(),
            bound: bound.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
