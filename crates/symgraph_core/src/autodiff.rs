use crate::traits::Element;

/// Dual number for forward-mode propagation.
/// val: primal part
/// eps: directional derivative (tangent) part
///
/// Generic over the carried element so that the same rules give numeric sensitivities
/// (`Dual<f64>`) and symbolic ones (`Dual<Expr>`).
#[derive(Debug, Clone, PartialEq)]
pub struct Dual<T> {
    pub val: T,
    pub eps: T,
}

impl<T: Element> Dual<T> {
    pub fn new(val: T, eps: T) -> Self {
        Self { val, eps }
    }

    /// A value that does not move along the seeded direction.
    pub fn constant(val: T) -> Self {
        Self { val, eps: T::zero() }
    }
}

impl<T: Element> Element for Dual<T> {
    fn from_f64(value: f64) -> Self {
        Self::constant(T::from_f64(value))
    }

    fn is_zero(&self) -> bool {
        self.val.is_zero() && self.eps.is_zero()
    }

    fn is_structural_zero(&self) -> bool {
        self.val.is_structural_zero() && self.eps.is_structural_zero()
    }

    fn symbolic(expr: &crate::node::Expr) -> Option<Vec<Self>> {
        T::symbolic(expr).map(|entries| entries.into_iter().map(Self::constant).collect())
    }

    fn add(&self, rhs: &Self) -> Self {
        Self::new(self.val.add(&rhs.val), self.eps.add(&rhs.eps))
    }

    fn sub(&self, rhs: &Self) -> Self {
        Self::new(self.val.sub(&rhs.val), self.eps.sub(&rhs.eps))
    }

    fn mul(&self, rhs: &Self) -> Self {
        Self::new(
            self.val.mul(&rhs.val),
            self.val.mul(&rhs.eps).add(&self.eps.mul(&rhs.val)),
        )
    }

    fn div(&self, rhs: &Self) -> Self {
        let quotient = self.val.div(&rhs.val);
        let eps = self.eps.sub(&quotient.mul(&rhs.eps)).div(&rhs.val);
        Self::new(quotient, eps)
    }

    fn neg(&self) -> Self {
        Self::new(self.val.neg(), self.eps.neg())
    }

    fn exp(&self) -> Self {
        let e = self.val.exp();
        let eps = e.mul(&self.eps);
        Self::new(e, eps)
    }

    fn log(&self) -> Self {
        Self::new(self.val.log(), self.eps.div(&self.val))
    }

    fn sqrt(&self) -> Self {
        let s = self.val.sqrt();
        let eps = self.eps.div(&s.add(&s));
        Self::new(s, eps)
    }

    fn sin(&self) -> Self {
        Self::new(self.val.sin(), self.eps.mul(&self.val.cos()))
    }

    fn cos(&self) -> Self {
        Self::new(self.val.cos(), self.eps.mul(&self.val.sin()).neg())
    }

    fn tan(&self) -> Self {
        let t = self.val.tan();
        let eps = self.eps.mul(&T::one().add(&t.mul(&t)));
        Self::new(t, eps)
    }

    fn pow(&self, rhs: &Self) -> Self {
        let p = self.val.pow(&rhs.val);
        let eps = if rhs.eps.is_zero() {
            // Constant exponent: avoids log() of a non-positive base.
            let reduced = rhs.val.sub(&T::one());
            self.eps.mul(&rhs.val).mul(&self.val.pow(&reduced))
        } else {
            let from_base = rhs.val.mul(&self.eps).div(&self.val);
            let from_exponent = rhs.eps.mul(&self.val.log());
            p.mul(&from_exponent.add(&from_base))
        };
        Self::new(p, eps)
    }

    fn fmin(&self, rhs: &Self) -> Self {
        let c = self.val.le(&rhs.val);
        let not_c = T::one().sub(&c);
        let eps = c.mul(&self.eps).add(&not_c.mul(&rhs.eps));
        Self::new(self.val.fmin(&rhs.val), eps)
    }

    fn fmax(&self, rhs: &Self) -> Self {
        let c = self.val.le(&rhs.val);
        let not_c = T::one().sub(&c);
        let eps = c.mul(&rhs.eps).add(&not_c.mul(&self.eps));
        Self::new(self.val.fmax(&rhs.val), eps)
    }

    fn le(&self, rhs: &Self) -> Self {
        Self::constant(self.val.le(&rhs.val))
    }

    fn square(&self) -> Self {
        let two_v = self.val.add(&self.val);
        Self::new(self.val.square(), two_v.mul(&self.eps))
    }
}
