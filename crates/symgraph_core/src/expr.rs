//! Construction of matrix-valued expressions, with the fixed simplification rule set.

use std::ops::Range;
use std::sync::Arc;

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::kernels;
use crate::node::{BinaryOp, Expr, Op, UnaryOp};
use crate::shape::Shape;
use crate::traits::Element;

impl Expr {
    pub fn symbol(name: impl Into<String>, rows: usize, cols: usize) -> Expr {
        Expr::from_parts(Op::Symbol(name.into()), Vec::new(), Shape::new(rows, cols))
    }

    pub fn scalar_symbol(name: impl Into<String>) -> Expr {
        Expr::symbol(name, 1, 1)
    }

    pub fn constant(value: f64) -> Expr {
        Expr::filled(1, 1, value)
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Expr {
        let values: Arc<[f64]> = vec![value; rows * cols].into();
        Expr::from_parts(Op::Constant(values), Vec::new(), Shape::new(rows, cols))
    }

    pub fn zeros(rows: usize, cols: usize) -> Expr {
        Expr::filled(rows, cols, 0.0)
    }

    pub fn ones(rows: usize, cols: usize) -> Expr {
        Expr::filled(rows, cols, 1.0)
    }

    /// The `0x1` placeholder used for absent ports.
    pub fn empty() -> Expr {
        Expr::zeros(0, 1)
    }

    /// Constant matrix from column-major values.
    pub fn matrix(rows: usize, cols: usize, values: Vec<f64>) -> Result<Expr> {
        if values.len() != rows * cols {
            return Err(Error::shape(
                "matrix",
                Shape::new(rows, cols),
                Shape::column(values.len()),
            ));
        }
        Ok(Expr::constant_with_shape(values, Shape::new(rows, cols)))
    }

    pub fn from_dmatrix(m: &DMatrix<f64>) -> Expr {
        Expr::constant_with_shape(m.as_slice().to_vec(), Shape::new(m.nrows(), m.ncols()))
    }

    fn constant_with_shape(values: Vec<f64>, shape: Shape) -> Expr {
        Expr::from_parts(Op::Constant(values.into()), Vec::new(), shape)
    }

    pub(crate) fn unary(&self, op: UnaryOp) -> Expr {
        if let Some(values) = self.constant_values() {
            let mut out = vec![0.0; values.len()];
            kernels::unary(op, values, &mut out);
            return Expr::constant_with_shape(out, self.shape());
        }
        if op == UnaryOp::Neg {
            if let Op::Unary(UnaryOp::Neg) = self.op() {
                return self.deps()[0].clone();
            }
        }
        Expr::from_parts(Op::Unary(op), vec![self.clone()], self.shape())
    }

    pub fn neg(&self) -> Expr {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Expr {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Expr {
        self.unary(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Expr {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn sin(&self) -> Expr {
        self.unary(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Expr {
        self.unary(UnaryOp::Cos)
    }

    pub fn tan(&self) -> Expr {
        self.unary(UnaryOp::Tan)
    }

    pub fn square(&self) -> Expr {
        self.unary(UnaryOp::Square)
    }

    pub(crate) fn binary(&self, op: BinaryOp, rhs: &Expr) -> Result<Expr> {
        if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            if rhs.shape().is_empty() && !self.shape().is_empty() {
                return Ok(self.clone());
            }
            // An empty left operand behaves like zero.
            if self.shape().is_empty() && !rhs.shape().is_empty() {
                return Ok(match op {
                    BinaryOp::Sub => rhs.neg(),
                    _ => rhs.clone(),
                });
            }
        }
        let shape = self
            .shape()
            .broadcast(&rhs.shape())
            .ok_or_else(|| Error::shape(op.name(), self.shape(), rhs.shape()))?;
        Ok(Expr::binary_node(op, self, rhs, shape))
    }

    /// Element-wise node for operands already known to broadcast. Used on scalar paths.
    pub(crate) fn binary_unchecked(op: BinaryOp, a: &Expr, b: &Expr) -> Expr {
        let shape = a.shape().broadcast(&b.shape()).unwrap_or(a.shape());
        Expr::binary_node(op, a, b, shape)
    }

    fn binary_node(op: BinaryOp, a: &Expr, b: &Expr, shape: Shape) -> Expr {
        if let (Some(x), Some(y)) = (a.constant_values(), b.constant_values()) {
            let mut out = vec![0.0; shape.numel()];
            kernels::binary(op, x, y, &mut out);
            return Expr::constant_with_shape(out, shape);
        }
        let keeps = |e: &Expr| e.shape() == shape;
        match op {
            BinaryOp::Add => {
                if a.is_zero() && keeps(b) {
                    return b.clone();
                }
                if b.is_zero() && keeps(a) {
                    return a.clone();
                }
                // (x - y) + y, y + (x - y) and -y + y
                if let Some(x) = cancels_sub(a, b).or_else(|| cancels_sub(b, a)) {
                    if keeps(&x) {
                        return x;
                    }
                }
            }
            BinaryOp::Sub => {
                if b.is_zero() && keeps(a) {
                    return a.clone();
                }
                if a.is_zero() && keeps(b) {
                    return b.neg();
                }
                // (x + y) - y and (y + x) - y
                if let Op::Binary(BinaryOp::Add) = a.op() {
                    let (x, y) = (&a.deps()[0], &a.deps()[1]);
                    if y.ptr_eq(b) && keeps(x) {
                        return x.clone();
                    }
                    if x.ptr_eq(b) && keeps(y) {
                        return y.clone();
                    }
                }
            }
            BinaryOp::Mul => {
                if a.is_zero() || b.is_zero() {
                    return Expr::zeros(shape.rows, shape.cols);
                }
                if a.is_one() && keeps(b) {
                    return b.clone();
                }
                if b.is_one() && keeps(a) {
                    return a.clone();
                }
            }
            BinaryOp::Div => {
                if a.is_zero() {
                    return Expr::zeros(shape.rows, shape.cols);
                }
                if b.is_one() && keeps(a) {
                    return a.clone();
                }
            }
            BinaryOp::Pow => {
                if b.is_one() && keeps(a) {
                    return a.clone();
                }
            }
            _ => {}
        }
        Expr::from_parts(Op::Binary(op), vec![a.clone(), b.clone()], shape)
    }

    pub fn add(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Sub, rhs)
    }

    /// Element-wise product.
    pub fn mul(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn pow(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Pow, rhs)
    }

    pub fn fmin(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Fmin, rhs)
    }

    pub fn fmax(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Fmax, rhs)
    }

    pub fn le(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::LessEq, rhs)
    }

    /// Multiplies every entry by a constant.
    pub fn scale(&self, factor: f64) -> Expr {
        Expr::binary_unchecked(BinaryOp::Mul, &Expr::constant(factor), self)
    }

    /// Matrix product.
    pub fn mtimes(&self, rhs: &Expr) -> Result<Expr> {
        if self.cols() != rhs.rows() {
            return Err(Error::shape("mtimes", self.shape(), rhs.shape()));
        }
        let shape = Shape::new(self.rows(), rhs.cols());
        if self.is_zero() || rhs.is_zero() {
            return Ok(Expr::zeros(shape.rows, shape.cols));
        }
        if let (Some(a), Some(b)) = (self.constant_values(), rhs.constant_values()) {
            let mut out = vec![0.0; shape.numel()];
            kernels::matmul(a, self.shape(), b, rhs.shape(), &mut out);
            return Ok(Expr::constant_with_shape(out, shape));
        }
        Ok(Expr::from_parts(
            Op::MatMul,
            vec![self.clone(), rhs.clone()],
            shape,
        ))
    }

    pub fn transpose(&self) -> Expr {
        if self.shape().is_scalar() {
            return self.clone();
        }
        if let Op::Transpose = self.op() {
            return self.deps()[0].clone();
        }
        if let Some(values) = self.constant_values() {
            let mut out = vec![0.0; values.len()];
            kernels::transpose(values, self.shape(), &mut out);
            return Expr::constant_with_shape(out, self.shape().transposed());
        }
        Expr::from_parts(Op::Transpose, vec![self.clone()], self.shape().transposed())
    }

    pub fn reshape(&self, rows: usize, cols: usize) -> Result<Expr> {
        let shape = Shape::new(rows, cols);
        if shape.numel() != self.numel() {
            return Err(Error::shape("reshape", self.shape(), shape));
        }
        if shape == self.shape() {
            return Ok(self.clone());
        }
        if let Op::Reshape = self.op() {
            return self.deps()[0].reshape(rows, cols);
        }
        if let Some(values) = self.constant_values() {
            return Ok(Expr::constant_with_shape(values.to_vec(), shape));
        }
        Ok(Expr::from_parts(Op::Reshape, vec![self.clone()], shape))
    }

    /// Column-stacked `numel x 1` view.
    pub fn vec(&self) -> Expr {
        if self.cols() == 1 {
            return self.clone();
        }
        let numel = self.numel();
        if let Op::Reshape = self.op() {
            let inner = &self.deps()[0];
            if inner.cols() == 1 {
                return inner.clone();
            }
        }
        if let Some(values) = self.constant_values() {
            return Expr::constant_with_shape(values.to_vec(), Shape::column(numel));
        }
        Expr::from_parts(Op::Reshape, vec![self.clone()], Shape::column(numel))
    }

    /// Contiguous block `rows x cols` (half-open ranges).
    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Expr> {
        let shape = self.shape();
        if rows.start > rows.end || rows.end > shape.rows {
            return Err(Error::index(
                "slice",
                format!("rows {}..{}", rows.start, rows.end),
                shape,
            ));
        }
        if cols.start > cols.end || cols.end > shape.cols {
            return Err(Error::index(
                "slice",
                format!("cols {}..{}", cols.start, cols.end),
                shape,
            ));
        }
        let out = Shape::new(rows.len(), cols.len());
        if out == shape {
            return Ok(self.clone());
        }
        if let Some(values) = self.constant_values() {
            let mut data = vec![0.0; out.numel()];
            kernels::slice(values, shape, rows.start, cols.start, out, &mut data);
            return Ok(Expr::constant_with_shape(data, out));
        }
        Ok(Expr::from_parts(
            Op::Slice {
                row: rows.start,
                col: cols.start,
            },
            vec![self.clone()],
            out,
        ))
    }

    /// Row range of a matrix, all columns.
    pub fn slice_rows(&self, rows: Range<usize>) -> Result<Expr> {
        self.slice(rows, 0..self.cols())
    }

    pub fn get(&self, row: usize, col: usize) -> Result<Expr> {
        if row >= self.rows() || col >= self.cols() {
            return Err(Error::index("get", format!("({row}, {col})"), self.shape()));
        }
        self.slice(row..row + 1, col..col + 1)
    }

    pub fn vertcat(parts: &[Expr]) -> Result<Expr> {
        Expr::concat(parts, true)
    }

    pub fn horzcat(parts: &[Expr]) -> Result<Expr> {
        Expr::concat(parts, false)
    }

    fn concat(parts: &[Expr], vertical: bool) -> Result<Expr> {
        let op_name = if vertical { "vertcat" } else { "horzcat" };
        let kept: Vec<Expr> = parts
            .iter()
            .filter(|p| !p.shape().is_empty())
            .cloned()
            .collect();
        let Some(first) = kept.first() else {
            return Ok(parts.first().cloned().unwrap_or_else(Expr::empty));
        };
        let mut shape = first.shape();
        for part in &kept[1..] {
            let s = part.shape();
            if vertical {
                if s.cols != shape.cols {
                    return Err(Error::shape(op_name, shape, s));
                }
                shape.rows += s.rows;
            } else {
                if s.rows != shape.rows {
                    return Err(Error::shape(op_name, shape, s));
                }
                shape.cols += s.cols;
            }
        }
        if kept.len() == 1 {
            return Ok(first.clone());
        }
        if kept.iter().all(Expr::is_constant) {
            let mut data = vec![0.0; shape.numel()];
            let mut offset = 0;
            for part in &kept {
                if let Some(values) = part.constant_values() {
                    kernels::concat_part(vertical, values, part.shape(), shape, offset, &mut data);
                }
                offset += if vertical { part.rows() } else { part.cols() };
            }
            return Ok(Expr::constant_with_shape(data, shape));
        }
        let op = if vertical { Op::Vertcat } else { Op::Horzcat };
        Ok(Expr::from_parts(op, kept, shape))
    }

    /// `sum(self .* rhs)` as a `1x1` expression.
    pub fn inner_prod(&self, rhs: &Expr) -> Result<Expr> {
        if self.shape() != rhs.shape() {
            return Err(Error::shape("inner_prod", self.shape(), rhs.shape()));
        }
        self.vec().transpose().mtimes(&rhs.vec())
    }

    pub fn sum(&self) -> Expr {
        let ones = Expr::ones(1, self.numel());
        // Shapes agree by construction.
        Expr::from_parts(Op::MatMul, vec![ones, self.vec()], Shape::scalar())
    }

    /// Marks this sub-expression as a candidate lifted variable. Evaluates as identity.
    pub fn lift(&self) -> Expr {
        Expr::from_parts(Op::Lift, vec![self.clone()], self.shape())
    }

    /// Rebuilds this node over new operands, reapplying the simplification rules.
    /// Returns `self` when every operand is unchanged.
    pub(crate) fn with_deps(&self, deps: Vec<Expr>) -> Result<Expr> {
        if deps.len() == self.deps().len()
            && deps.iter().zip(self.deps()).all(|(a, b)| a.ptr_eq(b))
        {
            return Ok(self.clone());
        }
        let shape = self.shape();
        match self.op() {
            Op::Symbol(_) | Op::Constant(_) => Ok(self.clone()),
            Op::Unary(op) => Ok(deps[0].unary(*op)),
            Op::Binary(op) => deps[0].binary(*op, &deps[1]),
            Op::MatMul => deps[0].mtimes(&deps[1]),
            Op::Transpose => Ok(deps[0].transpose()),
            Op::Reshape => deps[0].reshape(shape.rows, shape.cols),
            Op::Slice { row, col } => {
                deps[0].slice(*row..*row + shape.rows, *col..*col + shape.cols)
            }
            Op::Vertcat => Expr::vertcat(&deps),
            Op::Horzcat => Expr::horzcat(&deps),
            Op::Lift => Ok(deps[0].lift()),
            Op::Call(_) | Op::Output { .. } => {
                for (new, old) in deps.iter().zip(self.deps()) {
                    if new.shape() != old.shape() {
                        return Err(Error::shape(self.op().name(), old.shape(), new.shape()));
                    }
                }
                Ok(Expr::from_parts(self.op().clone(), deps, shape))
            }
        }
    }
}

/// `x` if `sum` is `x - y` with `y` identical to `other`.
fn cancels_sub(sum: &Expr, other: &Expr) -> Option<Expr> {
    match sum.op() {
        Op::Binary(BinaryOp::Sub) if sum.deps()[1].ptr_eq(other) => Some(sum.deps()[0].clone()),
        Op::Unary(UnaryOp::Neg) if sum.deps()[0].ptr_eq(other) => {
            Some(Expr::zeros(other.rows(), other.cols()))
        }
        _ => None,
    }
}

impl Element for Expr {
    fn from_f64(value: f64) -> Self {
        Expr::constant(value)
    }

    fn is_zero(&self) -> bool {
        Expr::is_zero(self)
    }

    fn is_structural_zero(&self) -> bool {
        Expr::is_zero(self)
    }

    fn symbolic(expr: &Expr) -> Option<Vec<Self>> {
        if expr.shape().is_scalar() {
            return Some(vec![expr.clone()]);
        }
        let rows = expr.rows();
        (0..expr.numel())
            .map(|k| expr.get(k % rows, k / rows).ok())
            .collect()
    }

    fn add(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Add, self, rhs)
    }

    fn sub(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Sub, self, rhs)
    }

    fn mul(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Mul, self, rhs)
    }

    fn div(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Div, self, rhs)
    }

    fn neg(&self) -> Self {
        self.unary(UnaryOp::Neg)
    }

    fn exp(&self) -> Self {
        self.unary(UnaryOp::Exp)
    }

    fn log(&self) -> Self {
        self.unary(UnaryOp::Log)
    }

    fn sqrt(&self) -> Self {
        self.unary(UnaryOp::Sqrt)
    }

    fn sin(&self) -> Self {
        self.unary(UnaryOp::Sin)
    }

    fn cos(&self) -> Self {
        self.unary(UnaryOp::Cos)
    }

    fn tan(&self) -> Self {
        self.unary(UnaryOp::Tan)
    }

    fn pow(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Pow, self, rhs)
    }

    fn fmin(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Fmin, self, rhs)
    }

    fn fmax(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::Fmax, self, rhs)
    }

    fn le(&self, rhs: &Self) -> Self {
        Expr::binary_unchecked(BinaryOp::LessEq, self, rhs)
    }

    fn square(&self) -> Self {
        self.unary(UnaryOp::Square)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        let text = err.to_string();
        assert!(text.contains(needle), "'{text}' does not contain '{needle}'");
    }

    #[test]
    fn identity_rules_keep_operands() {
        let x = Expr::symbol("x", 2, 2);
        let zero = Expr::constant(0.0);
        let one = Expr::constant(1.0);
        assert_eq!(x.add(&Expr::zeros(2, 2)).unwrap(), x);
        assert_eq!(x.mul(&Expr::ones(2, 2)).unwrap(), x);
        assert_eq!(x.div(&Expr::ones(2, 2)).unwrap(), x);
        assert_eq!(x.neg().neg(), x);
        assert_eq!(x.transpose().transpose(), x);
        assert_eq!(x.slice(0..2, 0..2).unwrap(), x);
        assert_eq!(x.add(&Expr::empty()).unwrap(), x);
        assert_eq!(x.sub(&Expr::empty()).unwrap(), x);
        assert_eq!(Expr::empty().add(&x).unwrap(), x);
        let negated = Expr::empty().sub(&x).unwrap();
        assert!(matches!(negated.op(), Op::Unary(UnaryOp::Neg)));
        assert!(negated.deps()[0].ptr_eq(&x));
        assert_eq!(negated.shape(), x.shape());

        // A broadcast scalar identity must not shrink or keep the wrong shape.
        let s = Expr::scalar_symbol("s");
        let grown = s.add(&Expr::zeros(2, 2)).unwrap();
        assert_eq!(grown.shape(), Shape::new(2, 2));
        assert!(x.mul(&zero).unwrap().is_zero());
        assert_eq!(x.mul(&one).unwrap(), x);
        assert!(zero.div(&x).unwrap().is_zero());
    }

    #[test]
    fn cancelling_sums_collapse() {
        let x = Expr::scalar_symbol("x");
        let y = Expr::scalar_symbol("y");
        let d = x.sub(&y).unwrap();
        assert_eq!(d.add(&y).unwrap(), x);
        assert_eq!(y.add(&d).unwrap(), x);
        let s = x.add(&y).unwrap();
        assert_eq!(s.sub(&y).unwrap(), x);
        assert_eq!(s.sub(&x).unwrap(), y);
    }

    #[test]
    fn constants_fold() {
        let a = Expr::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Expr::matrix(2, 1, vec![1.0, 1.0]).unwrap();
        let c = a.mtimes(&b).unwrap();
        assert_eq!(c.constant_values(), Some(&[4.0, 6.0][..]));
        let t = a.transpose();
        assert_eq!(t.constant_values(), Some(&[1.0, 3.0, 2.0, 4.0][..]));
        let v = Expr::vertcat(&[b.clone(), Expr::constant(5.0)]).unwrap();
        assert_eq!(v.constant_values(), Some(&[1.0, 1.0, 5.0][..]));
    }

    #[test]
    fn shape_and_index_errors() {
        let a = Expr::symbol("a", 2, 3);
        let b = Expr::symbol("b", 3, 2);
        assert_err_contains(a.add(&b), "2x3 vs 3x2");
        assert_err_contains(a.mtimes(&a), "mtimes");
        assert_err_contains(a.reshape(4, 2), "reshape");
        assert_err_contains(a.slice(0..3, 0..1), "index out of range");
        assert_err_contains(a.get(2, 0), "(2, 0)");
        assert_err_contains(Expr::vertcat(&[a.clone(), b.clone()]), "vertcat");
        assert_err_contains(a.inner_prod(&b), "inner_prod");
    }

    #[test]
    fn concatenation_skips_empty_parts() {
        let x = Expr::symbol("x", 2, 1);
        let v = Expr::vertcat(&[Expr::empty(), x.clone(), Expr::empty()]).unwrap();
        assert_eq!(v, x);
        let h = Expr::horzcat(&[x.clone(), x.clone()]).unwrap();
        assert_eq!(h.shape(), Shape::new(2, 2));
    }

    #[test]
    fn reshape_of_reshape_collapses() {
        let x = Expr::symbol("x", 2, 3);
        let r = x.reshape(3, 2).unwrap().reshape(6, 1).unwrap();
        assert_eq!(r.deps()[0], x);
        assert_eq!(r.reshape(2, 3).unwrap(), x);
    }
}
