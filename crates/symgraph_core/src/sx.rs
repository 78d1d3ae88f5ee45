//! Dense matrices of scalar expressions.

use std::fmt;
use std::ops::Range;

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::node::{BinaryOp, Expr, UnaryOp};
use crate::shape::Shape;
use crate::traits::Element;

/// A column-major matrix whose entries are `1x1` expressions.
///
/// This is the scalar-graph counterpart of a matrix-valued [`Expr`]: every entry is its own
/// node, so derivatives and substitutions can act entry by entry.
#[derive(Clone)]
pub struct SxMatrix {
    shape: Shape,
    elems: Vec<Expr>,
}

impl SxMatrix {
    pub(crate) fn from_parts(shape: Shape, elems: Vec<Expr>) -> Self {
        debug_assert_eq!(shape.numel(), elems.len());
        Self { shape, elems }
    }

    /// Fresh scalar symbols `name_0, name_1, ...` in column-major order; a `1x1` symbol
    /// is named `name`.
    pub fn symbol(name: &str, rows: usize, cols: usize) -> Self {
        let shape = Shape::new(rows, cols);
        let elems = if shape.is_scalar() {
            vec![Expr::scalar_symbol(name)]
        } else {
            (0..shape.numel())
                .map(|k| Expr::scalar_symbol(format!("{name}_{k}")))
                .collect()
        };
        Self { shape, elems }
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        let elems = (0..rows * cols).map(|_| Expr::constant(value)).collect();
        Self {
            shape: Shape::new(rows, cols),
            elems,
        }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn empty() -> Self {
        Self::zeros(0, 1)
    }

    pub fn scalar(expr: Expr) -> Result<Self> {
        Self::from_exprs(1, 1, vec![expr])
    }

    /// Matrix from column-major scalar expressions.
    pub fn from_exprs(rows: usize, cols: usize, elems: Vec<Expr>) -> Result<Self> {
        let shape = Shape::new(rows, cols);
        if elems.len() != shape.numel() {
            return Err(Error::shape("sx", shape, Shape::column(elems.len())));
        }
        if let Some(bad) = elems.iter().find(|e| !e.shape().is_scalar()) {
            return Err(Error::shape("sx", Shape::scalar(), bad.shape()));
        }
        Ok(Self { shape, elems })
    }

    pub fn column(elems: Vec<Expr>) -> Result<Self> {
        let n = elems.len();
        Self::from_exprs(n, 1, elems)
    }

    pub fn from_dmatrix(m: &DMatrix<f64>) -> Self {
        Self {
            shape: Shape::new(m.nrows(), m.ncols()),
            elems: m.iter().map(|&v| Expr::constant(v)).collect(),
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    pub fn numel(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn elems(&self) -> &[Expr] {
        &self.elems
    }

    pub fn elems_mut(&mut self) -> &mut [Expr] {
        &mut self.elems
    }

    pub fn into_elems(self) -> Vec<Expr> {
        self.elems
    }

    /// Entry `k` in column-major order.
    pub fn at(&self, k: usize) -> Result<&Expr> {
        self.elems
            .get(k)
            .ok_or_else(|| Error::index("at", k, self.shape))
    }

    pub fn get(&self, row: usize, col: usize) -> Result<&Expr> {
        if row >= self.rows() || col >= self.cols() {
            return Err(Error::index("get", format!("({row}, {col})"), self.shape));
        }
        Ok(&self.elems[self.shape.index(row, col)])
    }

    /// Every entry is a distinct symbol.
    pub fn is_symbolic(&self) -> bool {
        self.elems.iter().all(Expr::is_symbol)
    }

    fn map(&self, f: impl Fn(&Expr) -> Expr) -> Self {
        Self {
            shape: self.shape,
            elems: self.elems.iter().map(f).collect(),
        }
    }

    pub(crate) fn unary(&self, op: UnaryOp) -> Self {
        self.map(|e| e.unary(op))
    }

    pub(crate) fn binary(&self, op: BinaryOp, rhs: &SxMatrix) -> Result<Self> {
        let shape = self
            .shape
            .broadcast(&rhs.shape)
            .ok_or_else(|| Error::shape(op.name(), self.shape, rhs.shape))?;
        let sa = usize::from(!self.shape.is_scalar() || shape.is_scalar());
        let sb = usize::from(!rhs.shape.is_scalar() || shape.is_scalar());
        let elems = (0..shape.numel())
            .map(|k| Expr::binary_unchecked(op, &self.elems[k * sa], &rhs.elems[k * sb]))
            .collect();
        Ok(Self { shape, elems })
    }

    pub fn neg(&self) -> Self {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Self {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Self {
        self.unary(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Self {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn sin(&self) -> Self {
        self.unary(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Self {
        self.unary(UnaryOp::Cos)
    }

    pub fn square(&self) -> Self {
        self.unary(UnaryOp::Square)
    }

    pub fn add(&self, rhs: &SxMatrix) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &SxMatrix) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &SxMatrix) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &SxMatrix) -> Result<Self> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn scale(&self, factor: f64) -> Self {
        let c = Expr::constant(factor);
        self.map(|e| Element::mul(&c, e))
    }

    pub fn mtimes(&self, rhs: &SxMatrix) -> Result<Self> {
        if self.cols() != rhs.rows() {
            return Err(Error::shape("mtimes", self.shape, rhs.shape));
        }
        let shape = Shape::new(self.rows(), rhs.cols());
        let mut elems = vec![Expr::constant(0.0); shape.numel()];
        crate::kernels::matmul(&self.elems, self.shape, &rhs.elems, rhs.shape, &mut elems);
        Ok(Self { shape, elems })
    }

    pub fn transpose(&self) -> Self {
        let shape = self.shape.transposed();
        let mut elems = self.elems.clone();
        crate::kernels::transpose(&self.elems, self.shape, &mut elems);
        Self { shape, elems }
    }

    pub fn reshape(&self, rows: usize, cols: usize) -> Result<Self> {
        let shape = Shape::new(rows, cols);
        if shape.numel() != self.numel() {
            return Err(Error::shape("reshape", self.shape, shape));
        }
        Ok(Self {
            shape,
            elems: self.elems.clone(),
        })
    }

    pub fn vec(&self) -> Self {
        Self {
            shape: Shape::column(self.numel()),
            elems: self.elems.clone(),
        }
    }

    pub fn slice(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Self> {
        if rows.start > rows.end || rows.end > self.rows() {
            return Err(Error::index(
                "slice",
                format!("rows {}..{}", rows.start, rows.end),
                self.shape,
            ));
        }
        if cols.start > cols.end || cols.end > self.cols() {
            return Err(Error::index(
                "slice",
                format!("cols {}..{}", cols.start, cols.end),
                self.shape,
            ));
        }
        let shape = Shape::new(rows.len(), cols.len());
        let mut elems = Vec::with_capacity(shape.numel());
        for c in cols {
            for r in rows.clone() {
                elems.push(self.elems[self.shape.index(r, c)].clone());
            }
        }
        Ok(Self { shape, elems })
    }

    pub fn slice_rows(&self, rows: Range<usize>) -> Result<Self> {
        self.slice(rows, 0..self.cols())
    }

    pub fn vertcat(parts: &[SxMatrix]) -> Result<Self> {
        let kept: Vec<&SxMatrix> = parts.iter().filter(|p| !p.is_empty()).collect();
        let Some(first) = kept.first() else {
            return Ok(Self::empty());
        };
        let cols = first.cols();
        let mut rows = 0;
        for part in &kept {
            if part.cols() != cols {
                return Err(Error::shape("vertcat", first.shape, part.shape));
            }
            rows += part.rows();
        }
        let shape = Shape::new(rows, cols);
        let mut elems = vec![Expr::constant(0.0); shape.numel()];
        let mut offset = 0;
        for part in kept {
            crate::kernels::concat_part(true, &part.elems, part.shape, shape, offset, &mut elems);
            offset += part.rows();
        }
        Ok(Self { shape, elems })
    }

    pub fn horzcat(parts: &[SxMatrix]) -> Result<Self> {
        let kept: Vec<&SxMatrix> = parts.iter().filter(|p| !p.is_empty()).collect();
        let Some(first) = kept.first() else {
            return Ok(Self::empty());
        };
        let rows = first.rows();
        let mut cols = 0;
        let mut elems = Vec::new();
        for part in &kept {
            if part.rows() != rows {
                return Err(Error::shape("horzcat", first.shape, part.shape));
            }
            cols += part.cols();
            elems.extend(part.elems.iter().cloned());
        }
        Ok(Self {
            shape: Shape::new(rows, cols),
            elems,
        })
    }

    pub fn inner_prod(&self, rhs: &SxMatrix) -> Result<Self> {
        if self.shape != rhs.shape {
            return Err(Error::shape("inner_prod", self.shape, rhs.shape));
        }
        let mut acc = Expr::constant(0.0);
        for (a, b) in self.elems.iter().zip(&rhs.elems) {
            acc = Element::add(&acc, &Element::mul(a, b));
        }
        Ok(Self {
            shape: Shape::scalar(),
            elems: vec![acc],
        })
    }

    /// Entries in reverse column-major order, same shape.
    pub fn reversed(&self) -> Self {
        Self {
            shape: self.shape,
            elems: self.elems.iter().rev().cloned().collect(),
        }
    }

    /// Matrix-valued expression with the same entries.
    pub fn to_expr(&self) -> Result<Expr> {
        if self.is_empty() {
            return Ok(Expr::zeros(self.rows(), self.cols()));
        }
        if self.shape.is_scalar() {
            return Ok(self.elems[0].clone());
        }
        Expr::vertcat(&self.elems)?.reshape(self.rows(), self.cols())
    }
}

impl fmt::Debug for SxMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SxMatrix<{}>[", self.shape)?;
        for (k, e) in self.elems.iter().enumerate() {
            if k > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}
