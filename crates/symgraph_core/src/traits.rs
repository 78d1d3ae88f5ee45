use crate::node::Expr;
use std::fmt::Debug;

/// A value that can flow through an evaluation tape.
///
/// The same kernels run over plain `f64` (numeric evaluation), [`Dual`](crate::autodiff::Dual)
/// (forward sensitivities) and [`Expr`] (symbolic expansion), so every primitive the tape
/// needs is expressed here rather than through operator traits.
pub trait Element: Clone + Debug + 'static {
    fn from_f64(value: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    /// Known to be exactly zero. Only a hint: returning `false` is always safe.
    fn is_zero(&self) -> bool;

    /// Zero by construction, so kernels may drop products with it. Numeric types keep
    /// IEEE semantics (`0 * inf` is NaN) and never report one.
    fn is_structural_zero(&self) -> bool {
        false
    }

    /// Entries of a free symbol (column-major), if this element type can represent one.
    fn symbolic(_expr: &Expr) -> Option<Vec<Self>> {
        None
    }

    fn add(&self, rhs: &Self) -> Self;
    fn sub(&self, rhs: &Self) -> Self;
    fn mul(&self, rhs: &Self) -> Self;
    fn div(&self, rhs: &Self) -> Self;
    fn neg(&self) -> Self;
    fn exp(&self) -> Self;
    fn log(&self) -> Self;
    fn sqrt(&self) -> Self;
    fn sin(&self) -> Self;
    fn cos(&self) -> Self;
    fn tan(&self) -> Self;
    fn pow(&self, rhs: &Self) -> Self;
    fn fmin(&self, rhs: &Self) -> Self;
    fn fmax(&self, rhs: &Self) -> Self;
    /// Indicator `1` if `self <= rhs`, otherwise `0`.
    fn le(&self, rhs: &Self) -> Self;

    fn square(&self) -> Self {
        self.mul(self)
    }
}

impl Element for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    fn add(&self, rhs: &Self) -> Self {
        *self + *rhs
    }

    fn sub(&self, rhs: &Self) -> Self {
        *self - *rhs
    }

    fn mul(&self, rhs: &Self) -> Self {
        *self * *rhs
    }

    fn div(&self, rhs: &Self) -> Self {
        *self / *rhs
    }

    fn neg(&self) -> Self {
        -*self
    }

    fn exp(&self) -> Self {
        f64::exp(*self)
    }

    fn log(&self) -> Self {
        f64::ln(*self)
    }

    fn sqrt(&self) -> Self {
        f64::sqrt(*self)
    }

    fn sin(&self) -> Self {
        f64::sin(*self)
    }

    fn cos(&self) -> Self {
        f64::cos(*self)
    }

    fn tan(&self) -> Self {
        f64::tan(*self)
    }

    fn pow(&self, rhs: &Self) -> Self {
        f64::powf(*self, *rhs)
    }

    fn fmin(&self, rhs: &Self) -> Self {
        f64::min(*self, *rhs)
    }

    fn fmax(&self, rhs: &Self) -> Self {
        f64::max(*self, *rhs)
    }

    fn le(&self, rhs: &Self) -> Self {
        if *self <= *rhs {
            1.0
        } else {
            0.0
        }
    }

    fn square(&self) -> Self {
        *self * *self
    }
}
