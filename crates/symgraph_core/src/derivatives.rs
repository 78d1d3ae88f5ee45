//! Symbolic derivatives of scalar-expression matrices.
//!
//! Expressions may reference symbols other than the differentiation argument; those are
//! treated as constants.

use crate::error::{Error, Result};
use crate::function::{FunctionDef, FunctionOptions};
use crate::node::Expr;
use crate::shape::Shape;
use crate::sx::SxMatrix;

fn open_def(name: &str, ex: &SxMatrix, arg: &SxMatrix) -> Result<FunctionDef> {
    FunctionDef::build(
        vec![arg.clone().into()],
        vec![ex.vec().into()],
        FunctionOptions::named(name),
        true,
    )
}

fn unit(n: usize, k: usize) -> SxMatrix {
    let mut e = SxMatrix::zeros(n, 1);
    e.elems_mut()[k] = Expr::constant(1.0);
    e
}

/// `∂ vec(ex) / ∂ vec(arg)`, a `numel(ex) x numel(arg)` matrix.
///
/// Forward directions when `arg` is no larger than `ex`, adjoint directions otherwise.
pub fn jacobian(ex: &SxMatrix, arg: &SxMatrix) -> Result<SxMatrix> {
    let def = open_def("jacobian", ex, arg)?;
    let (m, n) = (ex.numel(), arg.numel());
    let mut elems = vec![Expr::constant(0.0); m * n];
    let args = [arg.clone()];
    if n <= m {
        let seeds: Vec<Vec<SxMatrix>> = (0..n).map(|j| vec![unit(n, j)]).collect();
        let (_, sens) = def.forward_sx(&args, &seeds)?;
        for (j, column) in sens.iter().enumerate() {
            for (i, e) in column[0].elems().iter().enumerate() {
                elems[i + j * m] = e.clone();
            }
        }
    } else {
        let seeds: Vec<Vec<SxMatrix>> = (0..m).map(|i| vec![unit(m, i)]).collect();
        let (_, sens) = def.adjoint_sx(&args, &seeds)?;
        for (i, row) in sens.iter().enumerate() {
            for (j, e) in row[0].elems().iter().enumerate() {
                elems[i + j * m] = e.clone();
            }
        }
    }
    SxMatrix::from_exprs(m, n, elems)
}

/// Gradient of a `1x1` expression, shaped like `arg`.
pub fn gradient(ex: &SxMatrix, arg: &SxMatrix) -> Result<SxMatrix> {
    if !ex.shape().is_scalar() {
        return Err(Error::shape("gradient", Shape::scalar(), ex.shape()));
    }
    let def = open_def("gradient", ex, arg)?;
    let (_, mut sens) = def.adjoint_sx(&[arg.clone()], &[vec![SxMatrix::filled(1, 1, 1.0)]])?;
    let grad = sens
        .pop()
        .and_then(|mut s| s.pop())
        .unwrap_or_else(|| SxMatrix::zeros(arg.rows(), arg.cols()));
    Ok(grad)
}

/// Directional derivatives of `ex` along each seed (each shaped like `arg`).
pub fn forward(ex: &SxMatrix, arg: &SxMatrix, seeds: &[SxMatrix]) -> Result<Vec<SxMatrix>> {
    let def = open_def("forward", ex, arg)?;
    let directions: Vec<Vec<SxMatrix>> = seeds.iter().map(|s| vec![s.clone()]).collect();
    let (_, sens) = def.forward_sx(&[arg.clone()], &directions)?;
    sens.into_iter()
        .map(|mut s| match s.pop() {
            Some(d) => d.reshape(ex.rows(), ex.cols()),
            None => Ok(SxMatrix::zeros(ex.rows(), ex.cols())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;

    fn scalar(sx: &SxMatrix) -> Expr {
        sx.elems()[0].clone()
    }

    #[test]
    fn jacobian_of_a_small_map() {
        let x = SxMatrix::symbol("x", 2, 1);
        let (x0, x1) = (scalar(&x.slice_rows(0..1).unwrap()), scalar(&x.slice_rows(1..2).unwrap()));
        let f = SxMatrix::column(vec![
            x0.mul(&x1).unwrap(),
            x0.sin(),
            x1.square(),
        ])
        .unwrap();
        let jac = jacobian(&f, &x).unwrap();
        assert_eq!(jac.shape(), Shape::new(3, 2));
        // d(x0 sin)/dx1 is structurally zero.
        assert!(jac.get(1, 1).unwrap().is_zero());

        let mut jf = Function::new(vec![x.into()], vec![jac.into()]).unwrap();
        let out = jf.eval(&[&[0.5, 2.0]]).unwrap();
        let expected = [2.0, 0.5f64.cos(), 0.0, 0.5, 0.0, 4.0];
        for (a, b) in out[0].iter().zip(expected) {
            assert!((a - b).abs() < 1e-14, "{a} vs {b}");
        }
    }

    #[test]
    fn wide_jacobian_uses_adjoint_and_agrees() {
        let x = SxMatrix::symbol("x", 3, 1);
        let s = x.inner_prod(&x).unwrap();
        let jac = jacobian(&s, &x).unwrap();
        let grad = gradient(&s, &x).unwrap();
        assert_eq!(jac.shape(), Shape::new(1, 3));
        let mut f = Function::new(vec![x.into()], vec![jac.into(), grad.into()]).unwrap();
        let out = f.eval(&[&[1.0, -2.0, 0.5]]).unwrap();
        assert_eq!(out[0], vec![2.0, -4.0, 1.0]);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn other_symbols_are_held_constant() {
        let u = SxMatrix::symbol("u", 1, 1);
        let p = SxMatrix::symbol("p", 1, 1);
        let f = u.mul(&p).unwrap().exp();
        let dfdu = forward(&f, &u, &[SxMatrix::filled(1, 1, 1.0)]).unwrap();
        let mut g = Function::new(vec![u.into(), p.into()], vec![dfdu[0].clone().into()]).unwrap();
        let out = g.eval(&[&[0.5], &[2.0]]).unwrap();
        assert!((out[0][0] - 2.0 * 1.0f64.exp()).abs() < 1e-14);
    }

    #[test]
    fn gradient_requires_a_scalar() {
        let x = SxMatrix::symbol("x", 2, 1);
        assert!(gradient(&x, &x).is_err());
    }
}
