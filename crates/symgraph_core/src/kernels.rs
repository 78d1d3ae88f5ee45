//! Per-operation kernels over dense column-major buffers, generic over the tape element.
//!
//! Primal kernels write into a caller-provided output slice. Adjoint kernels return the
//! contribution to each operand's adjoint and leave accumulation to the sweep.

use crate::node::{BinaryOp, UnaryOp};
use crate::shape::Shape;
use crate::traits::Element;

pub(crate) fn apply_unary<T: Element>(op: UnaryOp, a: &T) -> T {
    match op {
        UnaryOp::Neg => a.neg(),
        UnaryOp::Exp => a.exp(),
        UnaryOp::Log => a.log(),
        UnaryOp::Sqrt => a.sqrt(),
        UnaryOp::Sin => a.sin(),
        UnaryOp::Cos => a.cos(),
        UnaryOp::Tan => a.tan(),
        UnaryOp::Square => a.square(),
    }
}

pub(crate) fn apply_binary<T: Element>(op: BinaryOp, a: &T, b: &T) -> T {
    match op {
        BinaryOp::Add => a.add(b),
        BinaryOp::Sub => a.sub(b),
        BinaryOp::Mul => a.mul(b),
        BinaryOp::Div => a.div(b),
        BinaryOp::Pow => a.pow(b),
        BinaryOp::Fmin => a.fmin(b),
        BinaryOp::Fmax => a.fmax(b),
        BinaryOp::LessEq => a.le(b),
    }
}

pub(crate) fn unary<T: Element>(op: UnaryOp, a: &[T], out: &mut [T]) {
    for (o, x) in out.iter_mut().zip(a) {
        *o = apply_unary(op, x);
    }
}

/// Element-wise with broadcasting of a length-1 operand.
pub(crate) fn binary<T: Element>(op: BinaryOp, a: &[T], b: &[T], out: &mut [T]) {
    let sa = if a.len() == 1 { 0 } else { 1 };
    let sb = if b.len() == 1 { 0 } else { 1 };
    for (k, o) in out.iter_mut().enumerate() {
        *o = apply_binary(op, &a[k * sa], &b[k * sb]);
    }
}

pub(crate) fn matmul<T: Element>(a: &[T], sa: Shape, b: &[T], sb: Shape, out: &mut [T]) {
    let (m, inner, n) = (sa.rows, sa.cols, sb.cols);
    for j in 0..n {
        for i in 0..m {
            let mut acc = T::zero();
            for k in 0..inner {
                let x = &a[i + k * m];
                let y = &b[k + j * inner];
                if x.is_structural_zero() || y.is_structural_zero() {
                    continue;
                }
                acc = acc.add(&x.mul(y));
            }
            out[i + j * m] = acc;
        }
    }
}

/// `out` has shape `sa.transposed()`.
pub(crate) fn transpose<T: Element>(a: &[T], sa: Shape, out: &mut [T]) {
    for c in 0..sa.cols {
        for r in 0..sa.rows {
            out[c + r * sa.cols] = a[r + c * sa.rows].clone();
        }
    }
}

pub(crate) fn slice<T: Element>(
    a: &[T],
    sa: Shape,
    row: usize,
    col: usize,
    so: Shape,
    out: &mut [T],
) {
    for j in 0..so.cols {
        for i in 0..so.rows {
            out[i + j * so.rows] = a[(row + i) + (col + j) * sa.rows].clone();
        }
    }
}

/// Writes one concatenation operand into `out` at the given row (vertical) or column
/// (horizontal) offset.
pub(crate) fn concat_part<T: Element>(
    vertical: bool,
    part: &[T],
    sp: Shape,
    so: Shape,
    offset: usize,
    out: &mut [T],
) {
    if vertical {
        for j in 0..sp.cols {
            for i in 0..sp.rows {
                out[(offset + i) + j * so.rows] = part[i + j * sp.rows].clone();
            }
        }
    } else {
        let start = offset * so.rows;
        out[start..start + part.len()].clone_from_slice(part);
    }
}

/// Inverse of [`concat_part`]: extracts one operand's block from a concatenated value.
pub(crate) fn concat_extract<T: Element>(
    vertical: bool,
    whole: &[T],
    so: Shape,
    sp: Shape,
    offset: usize,
) -> Vec<T> {
    if vertical {
        let mut out = Vec::with_capacity(sp.numel());
        for j in 0..sp.cols {
            for i in 0..sp.rows {
                out.push(whole[(offset + i) + j * so.rows].clone());
            }
        }
        out
    } else {
        let start = offset * so.rows;
        whole[start..start + sp.numel()].to_vec()
    }
}

/// Adjoint of a unary map: `g * f'(a)`.
pub(crate) fn unary_adjoint<T: Element>(op: UnaryOp, a: &[T], out: &[T], g: &[T]) -> Vec<T> {
    a.iter()
        .zip(out)
        .zip(g)
        .map(|((x, y), gk)| {
            if gk.is_structural_zero() {
                return T::zero();
            }
            let d = match op {
                UnaryOp::Neg => return gk.neg(),
                UnaryOp::Exp => y.clone(),
                UnaryOp::Log => return gk.div(x),
                UnaryOp::Sqrt => return gk.div(&y.add(y)),
                UnaryOp::Sin => x.cos(),
                UnaryOp::Cos => x.sin().neg(),
                UnaryOp::Tan => T::one().add(&y.mul(y)),
                UnaryOp::Square => x.add(x),
            };
            gk.mul(&d)
        })
        .collect()
}

/// Adjoint of an element-wise binary operation. Broadcast operands receive the sum of
/// their contributions. Returns `None` for operands the caller does not need.
pub(crate) fn binary_adjoint<T: Element>(
    op: BinaryOp,
    a: &[T],
    b: &[T],
    out: &[T],
    g: &[T],
    need: (bool, bool),
) -> (Option<Vec<T>>, Option<Vec<T>>) {
    let sa = if a.len() == 1 { 0 } else { 1 };
    let sb = if b.len() == 1 { 0 } else { 1 };
    let mut da = need.0.then(|| vec![T::zero(); a.len()]);
    let mut db = need.1.then(|| vec![T::zero(); b.len()]);
    for (k, gk) in g.iter().enumerate() {
        if gk.is_structural_zero() {
            continue;
        }
        let (x, y, z) = (&a[k * sa], &b[k * sb], &out[k]);
        let (pa, pb) = match op {
            BinaryOp::Add => (gk.clone(), gk.clone()),
            BinaryOp::Sub => (gk.clone(), gk.neg()),
            BinaryOp::Mul => (gk.mul(y), gk.mul(x)),
            BinaryOp::Div => (gk.div(y), gk.mul(z).div(y).neg()),
            BinaryOp::Pow => {
                let pa = if need.0 {
                    gk.mul(y).mul(&x.pow(&y.sub(&T::one())))
                } else {
                    T::zero()
                };
                let pb = if need.1 {
                    gk.mul(z).mul(&x.log())
                } else {
                    T::zero()
                };
                (pa, pb)
            }
            BinaryOp::Fmin | BinaryOp::Fmax => {
                let c = x.le(y);
                let not_c = T::one().sub(&c);
                if op == BinaryOp::Fmin {
                    (gk.mul(&c), gk.mul(&not_c))
                } else {
                    (gk.mul(&not_c), gk.mul(&c))
                }
            }
            BinaryOp::LessEq => (T::zero(), T::zero()),
        };
        if let Some(da) = da.as_mut() {
            let slot = &mut da[k * sa];
            *slot = slot.add(&pa);
        }
        if let Some(db) = db.as_mut() {
            let slot = &mut db[k * sb];
            *slot = slot.add(&pb);
        }
    }
    (da, db)
}

/// `dA = G Bᵀ`, `dB = Aᵀ G`.
pub(crate) fn matmul_adjoint<T: Element>(
    a: &[T],
    sa: Shape,
    b: &[T],
    sb: Shape,
    g: &[T],
    need: (bool, bool),
) -> (Option<Vec<T>>, Option<Vec<T>>) {
    let (m, inner, n) = (sa.rows, sa.cols, sb.cols);
    let da = need.0.then(|| {
        let mut da = vec![T::zero(); a.len()];
        for k in 0..inner {
            for i in 0..m {
                let mut acc = T::zero();
                for j in 0..n {
                    let gij = &g[i + j * m];
                    let bkj = &b[k + j * inner];
                    if gij.is_structural_zero() || bkj.is_structural_zero() {
                        continue;
                    }
                    acc = acc.add(&gij.mul(bkj));
                }
                da[i + k * m] = acc;
            }
        }
        da
    });
    let db = need.1.then(|| {
        let mut db = vec![T::zero(); b.len()];
        for j in 0..n {
            for k in 0..inner {
                let mut acc = T::zero();
                for i in 0..m {
                    let aik = &a[i + k * m];
                    let gij = &g[i + j * m];
                    if aik.is_structural_zero() || gij.is_structural_zero() {
                        continue;
                    }
                    acc = acc.add(&aik.mul(gij));
                }
                db[k + j * inner] = acc;
            }
        }
        db
    });
    (da, db)
}

/// Scatters a slice adjoint back into the full operand shape.
pub(crate) fn slice_adjoint<T: Element>(
    sa: Shape,
    row: usize,
    col: usize,
    so: Shape,
    g: &[T],
) -> Vec<T> {
    let mut da = vec![T::zero(); sa.numel()];
    for j in 0..so.cols {
        for i in 0..so.rows {
            da[(row + i) + (col + j) * sa.rows] = g[i + j * so.rows].clone();
        }
    }
    da
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_column_major() {
        // [1 3; 2 4] * [5; 6] = [23; 34]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0];
        let mut out = [0.0; 2];
        matmul(&a, Shape::new(2, 2), &b, Shape::new(2, 1), &mut out);
        assert_eq!(out, [23.0, 34.0]);
    }

    #[test]
    fn slice_and_concat_are_inverse() {
        let whole = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let so = Shape::new(3, 2);
        let sp = Shape::new(2, 2);
        let part = concat_extract(true, &whole, so, sp, 1);
        assert_eq!(part, vec![2.0, 3.0, 5.0, 6.0]);
        let mut rebuilt = [0.0; 6];
        concat_part(true, &part, sp, so, 1, &mut rebuilt);
        assert_eq!(rebuilt, [0.0, 2.0, 3.0, 0.0, 5.0, 6.0]);

        let mut block = [0.0; 2];
        slice(&whole, so, 1, 1, Shape::new(2, 1), &mut block);
        assert_eq!(block, [5.0, 6.0]);
    }

    #[test]
    fn broadcast_adjoint_sums_contributions() {
        let a = [2.0];
        let b = [1.0, 3.0];
        let out = [2.0, 6.0];
        let g = [1.0, 1.0];
        let (da, db) = binary_adjoint(BinaryOp::Mul, &a, &b, &out, &g, (true, true));
        assert_eq!(da, Some(vec![4.0]));
        assert_eq!(db, Some(vec![2.0, 2.0]));
    }

    #[test]
    fn matmul_adjoint_matches_transposes() {
        // A = [1 2], B = [3; 4], G = [1]
        let (da, db) = matmul_adjoint(
            &[1.0, 2.0],
            Shape::new(1, 2),
            &[3.0, 4.0],
            Shape::new(2, 1),
            &[1.0],
            (true, true),
        );
        assert_eq!(da, Some(vec![3.0, 4.0]));
        assert_eq!(db, Some(vec![1.0, 2.0]));
    }

    #[test]
    fn numeric_products_keep_ieee_zero_times_infinity() {
        // [0 1] * [inf; 1] = 0 * inf + 1 = NaN
        let mut out = [0.0];
        let (a, b) = ([0.0, 1.0], [f64::INFINITY, 1.0]);
        matmul(&a, Shape::new(1, 2), &b, Shape::new(2, 1), &mut out);
        assert!(out[0].is_nan());

        let (da, _) = matmul_adjoint(
            &a,
            Shape::new(1, 2),
            &b,
            Shape::new(2, 1),
            &[0.0],
            (true, false),
        );
        assert!(da.unwrap()[0].is_nan());

        let inf = [f64::INFINITY];
        let (da, _) = binary_adjoint(BinaryOp::Mul, &[1.0], &inf, &inf, &[0.0], (true, false));
        assert!(da.unwrap()[0].is_nan());
    }
}
