//! The `symgraph_core` crate is a symbolic computational-graph engine for numerical
//! optimization.
//!
//! Key components:
//! - **Expressions**: immutable, shared DAG nodes (`Expr`) over dense matrices, and
//!   matrices of scalar expressions (`SxMatrix`).
//! - **Functions**: graphs flattened into an `Algorithm` over a preallocated work vector,
//!   with primal, forward and adjoint evaluation.
//! - **Lifter**: splits a lifted source function into residual, linearization and step
//!   expansion functions.
//! - **Solve loop**: full-step Gauss-Newton / SQP iterations over a black-box QP.
pub mod algorithm;
pub mod autodiff;
pub mod derivatives;
pub mod error;
mod evaluator;
mod expr;
pub mod function;
pub mod integrator;
mod kernels;
pub mod lifter;
pub mod node;
pub mod qp;
pub mod shape;
pub mod sqp;
pub mod sx;
pub mod traits;
pub mod transform;

pub use error::{Error, Result};
pub use function::{Function, FunctionOptions, Port};
pub use lifter::{LiftedProblem, Lifter, LifterSettings};
pub use node::Expr;
pub use qp::{DenseQpSolver, QpSolver};
pub use shape::Shape;
pub use sqp::{solve, Bounds, SolveReport, SolveSettings, SolveStatus};
pub use sx::SxMatrix;
