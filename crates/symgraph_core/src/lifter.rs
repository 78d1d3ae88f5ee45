//! Lifted Newton-type splitting of a function into residual, linearization and step
//! expansion functions.
//!
//! The source is `fg(u, v) -> (f1, g)` where the first `nv` entries of `g` are the defects
//! `h(u, v) - v` of the lifted variables `v`, each `h_i` depending on `v_j` for `j < i` only.
//! Condensing removes `v` from the linear algebra: the QP is posed in `u` alone and `v` is
//! recovered by the expansion function.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::derivatives::{gradient, jacobian};
use crate::error::{Error, Result};
use crate::function::{Function, FunctionOptions, Port};
use crate::node::Expr;
use crate::sx::SxMatrix;
use crate::transform::{extract_lifted, substitute, substitute_in_place};

/// Port indices of the residual function `rfcn(u, v, lam_x, lam_g) -> (d, g, f)`.
pub mod residual {
    pub const U: usize = 0;
    pub const V: usize = 1;
    pub const LAM_X: usize = 2;
    pub const LAM_G: usize = 3;

    pub const D: usize = 0;
    pub const G: usize = 1;
    pub const F: usize = 2;
}

/// Port indices of `lfcn(u, v, lam_x, lam_g, d) -> (b1, B1, b2, B2)`.
pub mod linearization {
    pub use super::residual::{LAM_G, LAM_X, U, V};
    pub const D: usize = 4;

    pub const B1: usize = 0;
    pub const J1: usize = 1;
    pub const B2: usize = 2;
    pub const J2: usize = 3;
}

/// Port indices of `efcn(u, v, lam_x, lam_g, d, du, dlam_f2) -> e`.
pub mod expansion {
    pub use super::linearization::{D, LAM_G, LAM_X, U, V};
    pub const DU: usize = 5;
    pub const DLAM_F2: usize = 6;

    pub const E: usize = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifterSettings {
    /// Gauss-Newton Hessian `B1ᵀB1` of `½‖f1‖²`; otherwise `f1` is a scalar objective and
    /// the exact Lagrangian Hessian is used.
    pub gauss_newton: bool,
    pub live_variables: bool,
}

impl Default for LifterSettings {
    fn default() -> Self {
        Self {
            gauss_newton: true,
            live_variables: true,
        }
    }
}

/// The three functions produced by lifting, with the problem dimensions.
#[derive(Debug, Clone)]
pub struct LiftedProblem {
    pub rfcn: Function,
    pub lfcn: Function,
    pub efcn: Function,
    nu: usize,
    nv: usize,
    nv_aug: usize,
    nf1: usize,
    nf2: usize,
    gauss_newton: bool,
}

impl LiftedProblem {
    pub fn nu(&self) -> usize {
        self.nu
    }

    /// Number of lifted variables of the source.
    pub fn nv(&self) -> usize {
        self.nv
    }

    /// Lifted variables including the defect multipliers carried in exact-Hessian mode.
    pub fn nv_aug(&self) -> usize {
        self.nv_aug
    }

    pub fn nf1(&self) -> usize {
        self.nf1
    }

    pub fn nf2(&self) -> usize {
        self.nf2
    }

    pub fn gauss_newton(&self) -> bool {
        self.gauss_newton
    }

    /// Length of the `lam_x` input.
    pub fn n_lam_x(&self) -> usize {
        if self.gauss_newton {
            0
        } else {
            self.nu + self.nv
        }
    }

    /// Length of the `lam_g` input (multipliers of the non-defect constraints).
    pub fn n_lam_g(&self) -> usize {
        if self.gauss_newton {
            0
        } else {
            self.nf2
        }
    }
}

/// Output of [`Lifter::from_marked`].
#[derive(Debug, Clone)]
pub struct MarkedLifting {
    pub problem: LiftedProblem,
    /// `initial(u) -> v`: lifted variables consistent with their definitions.
    pub initial: Function,
}

#[derive(Debug, Clone, Default)]
pub struct Lifter {
    settings: LifterSettings,
}

impl Lifter {
    pub fn new(settings: LifterSettings) -> Self {
        Self { settings }
    }

    fn options(&self, name: &str) -> FunctionOptions {
        FunctionOptions {
            live_variables: self.settings.live_variables,
            ..FunctionOptions::named(name)
        }
    }

    /// Lifts `fg(u, v) -> (f1, g)`. Matrix-valued sources are expanded first.
    pub fn lift(&self, source: &Function) -> Result<LiftedProblem> {
        if source.n_in() != 2 || source.n_out() != 2 {
            return Err(Error::InvalidArgument(format!(
                "lifting needs fg(u, v) -> (f1, g), '{}' has {} inputs and {} outputs",
                source.name(),
                source.n_in(),
                source.n_out()
            )));
        }
        let fg = if source.is_expanded() {
            source.clone()
        } else {
            source.expand()?
        };
        let u = fg.input_sx(0)?.vec();
        let v = fg.input_sx(1)?.vec();
        let f1 = fg.output_sx(0)?.vec();
        let g = fg.output_sx(1)?.vec();

        let (nu, nv) = (u.numel(), v.numel());
        if g.numel() < nv {
            return Err(Error::InvalidArgument(format!(
                "g has {} entries but there are {nv} lifted variables",
                g.numel()
            )));
        }
        let nf1 = f1.numel();
        let nf2 = g.numel() - nv;
        let v_eq = g.slice_rows(0..nv)?;
        let f2 = g.slice_rows(nv..nv + nf2)?;
        let gauss_newton = self.settings.gauss_newton;

        let (f, f1, v, v_eq, lam_x, lam_f2) = if gauss_newton {
            let f = f1.inner_prod(&f1)?.scale(0.5);
            (f, f1, v, v_eq, SxMatrix::empty(), SxMatrix::empty())
        } else {
            if nf1 != 1 {
                return Err(Error::InvalidArgument(format!(
                    "exact Hessian mode needs a scalar objective, f1 has {nf1} entries"
                )));
            }
            let x = SxMatrix::vertcat(&[u.clone(), v.clone()])?;
            let lam_x = SxMatrix::symbol("lam_x", nu + nv, 1);
            let lam_v_eq = SxMatrix::symbol("lam_v_eq", nv, 1);
            let lam_f2 = SxMatrix::symbol("lam_f2", nf2, 1);

            let mut lag = f1.add(&lam_x.inner_prod(&x)?)?;
            if nf2 > 0 {
                lag = lag.add(&lam_f2.inner_prod(&f2)?)?;
            }
            if nv > 0 {
                let v_def = v_eq.add(&v)?;
                lag = lag.add(&lam_v_eq.inner_prod(&v_def)?)?;
            }
            let mut lgrad = gradient(&lag, &x)?;
            if nv > 0 {
                // Puts the multiplier block in the form h_extended - v_extended.
                let shift = SxMatrix::vertcat(&[SxMatrix::zeros(nu, 1), lam_v_eq.clone()])?;
                lgrad = lgrad.sub(&shift)?;
            }
            let grad_u = lgrad.slice_rows(0..nu)?;
            let v_eq_grad = lgrad.slice_rows(nu..nu + nv)?;
            // Reversed so that the augmented definitions stay triangular.
            let v_aug = SxMatrix::vertcat(&[v, lam_v_eq.reversed()])?;
            let v_eq_aug = SxMatrix::vertcat(&[v_eq, v_eq_grad.reversed()])?;
            (f1, grad_u, v_aug, v_eq_aug, lam_x, lam_f2)
        };
        let nf1 = f1.numel();
        let nv_aug = v.numel();

        // Residual of the lifted variables and its definition in terms of (u, d).
        let d = SxMatrix::symbol("d", nv_aug, 1);
        let mut d_def = v_eq.add(&v)?.sub(&d)?;
        let mut exprs: Vec<Expr> = f1.elems().iter().chain(f2.elems()).cloned().collect();
        substitute_in_place(v.elems(), d_def.elems_mut(), &mut exprs)?;
        let f12_z = SxMatrix::column(exprs)?;
        let f1_z = f12_z.slice_rows(0..nf1)?;
        let f2_z = f12_z.slice_rows(nf1..nf1 + nf2)?;

        let zfcn = Function::with_options(
            ports([&u, &d, &lam_x, &lam_f2]),
            ports([&d_def, &f12_z]),
            self.options("zfcn"),
        )?;

        let jac = jacobian(&f12_z, &u)?;
        let mut j1 = jac.slice(0..nf1, 0..nu)?;
        let j2 = jac.slice(nf1..nf1 + nf2, 0..nu)?;

        let du = SxMatrix::symbol("du", nu, 1);
        let dlam_f2 = SxMatrix::symbol("dlam_f2", lam_f2.numel(), 1);
        let mut b1 = f1_z;
        let mut b2 = f2_z;
        let mut e = SxMatrix::empty();
        if nv_aug > 0 {
            let args = [u.clone(), d.clone(), lam_x.clone(), lam_f2.clone()];
            let toward_zero = d.neg();
            let held = vec![
                SxMatrix::zeros(nu, 1),
                toward_zero.clone(),
                SxMatrix::zeros(lam_x.numel(), 1),
                SxMatrix::zeros(lam_f2.numel(), 1),
            ];
            let stepped = vec![
                du.clone(),
                toward_zero,
                SxMatrix::zeros(lam_x.numel(), 1),
                dlam_f2.clone(),
            ];
            let (_, sens) = zfcn.forward_sx(&args, &[held, stepped])?;
            let f12_sens = &sens[0][1];
            b1 = b1.add(&f12_sens.slice_rows(0..nf1)?)?;
            b2 = b2.add(&f12_sens.slice_rows(nf1..nf1 + nf2)?)?;
            e = sens[1][0].clone();
        }
        if gauss_newton {
            let j1t = j1.transpose();
            b1 = j1t.mtimes(&b1)?;
            j1 = j1t.mtimes(&j1)?;
        }

        let rfcn = Function::with_options(
            ports([&u, &v, &lam_x, &lam_f2]),
            ports([&v_eq, &g, &f]),
            self.options("rfcn"),
        )?;
        let lfcn = Function::with_options(
            ports([&u, &v, &lam_x, &lam_f2, &d]),
            ports([&b1, &j1, &b2, &j2]),
            self.options("lfcn"),
        )?;
        let efcn = Function::with_options(
            ports([&u, &v, &lam_x, &lam_f2, &d, &du, &dlam_f2]),
            ports([&e]),
            self.options("efcn"),
        )?;
        info!(
            nu,
            nv,
            nf1,
            nf2,
            gauss_newton,
            rfcn_nodes = rfcn.count_nodes(),
            lfcn_nodes = lfcn.count_nodes(),
            efcn_nodes = efcn.count_nodes(),
            "lifted problem prepared"
        );

        Ok(LiftedProblem {
            rfcn,
            lfcn,
            efcn,
            nu,
            nv,
            nv_aug,
            nf1,
            nf2,
            gauss_newton,
        })
    }

    /// Lifts a single-shooting formulation `(f1(u), g(u))` whose intermediate expressions
    /// carry `lift` markers. Every marker becomes a block of the lifted variable vector.
    pub fn from_marked(&self, u: &Expr, f1: &Expr, g: &Expr) -> Result<MarkedLifting> {
        let lifted = extract_lifted(&[f1.clone(), g.clone()], "lift_")?;
        let n_total: usize = lifted.variables.iter().map(Expr::numel).sum();
        debug!(markers = lifted.variables.len(), n_total, "extracted lifted variables");
        let v = Expr::symbol("v", n_total, 1);

        let mut blocks = Vec::with_capacity(lifted.variables.len());
        let mut offset = 0;
        for var in &lifted.variables {
            let n = var.numel();
            blocks.push(v.slice_rows(offset..offset + n)?.reshape(var.rows(), var.cols())?);
            offset += n;
        }

        let n_defs = lifted.definitions.len();
        let mut roots = lifted.definitions.clone();
        roots.extend(lifted.outputs.iter().cloned());
        let rewritten = substitute(&roots, &lifted.variables, &blocks)?;
        let (defs, outs) = rewritten.split_at(n_defs);

        let mut g_parts = Vec::with_capacity(n_defs + 1);
        for (def, block) in defs.iter().zip(&blocks) {
            g_parts.push(def.sub(block)?.vec());
        }
        g_parts.push(outs[1].vec());
        let g_lifted = Expr::vertcat(&g_parts)?;
        let source = Function::with_options(
            vec![u.clone().into(), v.clone().into()],
            vec![outs[0].vec().into(), g_lifted.into()],
            FunctionOptions::named("lifted_source"),
        )?;
        let problem = self.lift(&source)?;

        let mut explicit = lifted.definitions.clone();
        substitute_in_place(&lifted.variables, &mut explicit, &mut [])?;
        let stacked: Vec<Expr> = explicit.iter().map(Expr::vec).collect();
        let initial = Function::with_options(
            vec![u.clone().into()],
            vec![Expr::vertcat(&stacked)?.into()],
            FunctionOptions::named("lift_initial"),
        )?;
        Ok(MarkedLifting { problem, initial })
    }
}

fn ports<const N: usize>(parts: [&SxMatrix; N]) -> Vec<Port> {
    parts.into_iter().map(|p| Port::from(p.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    /// u scalar, v = [v0, v1] with v0 = sin(u) + u, v1 = v0² · u;
    /// f1 = [v1 - 0.3, u - 0.2, v0], g = [defects; v1 + u].
    fn source() -> (Function, Function) {
        let u = Expr::scalar_symbol("u");
        let v = Expr::symbol("v", 2, 1);
        let v0 = v.get(0, 0).unwrap();
        let v1 = v.get(1, 0).unwrap();
        let h0 = u.sin().add(&u).unwrap();
        let h1 = v0.square().mul(&u).unwrap();
        let f1 = Expr::vertcat(&[
            v1.sub(&Expr::constant(0.3)).unwrap(),
            u.sub(&Expr::constant(0.2)).unwrap(),
            v0.clone(),
        ])
        .unwrap();
        let g = Expr::vertcat(&[
            h0.sub(&v0).unwrap(),
            h1.sub(&v1).unwrap(),
            v1.add(&u).unwrap(),
        ])
        .unwrap();
        let fg = Function::new(vec![u.clone().into(), v.into()], vec![f1.into(), g.into()]).unwrap();

        // The same model without lifted variables.
        let s0 = u.sin().add(&u).unwrap();
        let s1 = s0.square().mul(&u).unwrap();
        let flat = Expr::vertcat(&[
            s1.sub(&Expr::constant(0.3)).unwrap(),
            u.sub(&Expr::constant(0.2)).unwrap(),
            s0.clone(),
        ])
        .unwrap();
        let single = Function::new(vec![u.into()], vec![flat.into()]).unwrap();
        (fg, single)
    }

    fn consistent_v(u: f64) -> [f64; 2] {
        let v0 = u.sin() + u;
        [v0, v0 * v0 * u]
    }

    fn bind(f: &mut Function, values: &[&[f64]]) {
        for (i, x) in values.iter().enumerate() {
            f.set_input(i, x).unwrap();
        }
    }

    #[test]
    fn residual_vanishes_at_consistent_point() {
        let (fg, _) = source();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        assert_eq!((problem.nu(), problem.nv(), problem.nf1(), problem.nf2()), (1, 2, 3, 1));
        let u = 0.7;
        let v = consistent_v(u);
        bind(&mut problem.rfcn, &[&[u], &v, &[], &[]]);
        problem.rfcn.evaluate().unwrap();
        for d in problem.rfcn.output(residual::D).unwrap() {
            assert!(d.abs() < 1e-14);
        }
        let f = problem.rfcn.output_scalar(residual::F).unwrap();
        let r = [v[1] - 0.3, u - 0.2, v[0]];
        let expected = 0.5 * r.iter().map(|x| x * x).sum::<f64>();
        assert!((f - expected).abs() < 1e-14);
    }

    #[test]
    fn condensed_linearization_matches_single_shooting() {
        let (fg, mut single) = source();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        let u = 0.4;
        single.eval(&[&[u]]).unwrap();
        let jac = single.jacobian(0, 0).unwrap();
        let r = DMatrix::from_column_slice(3, 1, single.output(0).unwrap());

        let v = consistent_v(u);
        bind(&mut problem.lfcn, &[&[u], &v, &[], &[], &[0.0, 0.0]]);
        problem.lfcn.evaluate().unwrap();
        let hess = problem.lfcn.output_matrix(linearization::J1).unwrap();
        let grad = problem.lfcn.output_matrix(linearization::B1).unwrap();
        let expected_h = jac.transpose() * &jac;
        let expected_g = jac.transpose() * &r;
        assert!((hess[(0, 0)] - expected_h[(0, 0)]).abs() < 1e-12);
        assert!((grad[(0, 0)] - expected_g[(0, 0)]).abs() < 1e-12);

        // Constraint row: d(v1 + u)/du along the lifted chain.
        let j2 = problem.lfcn.output_matrix(linearization::J2).unwrap();
        let v0 = u.sin() + u;
        let dv0 = u.cos() + 1.0;
        let dv1 = 2.0 * v0 * dv0 * u + v0 * v0;
        assert!((j2[(0, 0)] - (dv1 + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn expansion_recovers_the_lifted_step() {
        let (fg, _) = source();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        let u = 0.4;
        let du = 1e-3;
        // Start off the manifold: the expanded step must land back on it to first order.
        let v = consistent_v(u);
        let v_off = [v[0] + 0.01, v[1] - 0.02];
        bind(&mut problem.rfcn, &[&[u], &v_off, &[], &[]]);
        problem.rfcn.evaluate().unwrap();
        let d = problem.rfcn.output(residual::D).unwrap().to_vec();

        bind(
            &mut problem.efcn,
            &[&[u], &v_off, &[], &[], &d, &[du], &[]],
        );
        problem.efcn.evaluate().unwrap();
        let e = problem.efcn.output(expansion::E).unwrap();
        let target = consistent_v(u + du);
        for k in 0..2 {
            let stepped = v_off[k] + e[k];
            assert!((stepped - target[k]).abs() < 1e-4, "{k}: {stepped} vs {}", target[k]);
        }
    }

    #[test]
    fn marked_graph_lifts_like_explicit_source() {
        let u = Expr::scalar_symbol("u");
        let s0 = u.sin().add(&u).unwrap().lift();
        let s1 = s0.square().mul(&u).unwrap().lift();
        let f1 = Expr::vertcat(&[
            s1.sub(&Expr::constant(0.3)).unwrap(),
            u.sub(&Expr::constant(0.2)).unwrap(),
            s0.clone(),
        ])
        .unwrap();
        let g = s1.add(&u).unwrap();
        let mut marked = Lifter::default().from_marked(&u, &f1, &g).unwrap();
        assert_eq!(marked.problem.nv(), 2);
        let v = marked.initial.eval(&[&[0.7]]).unwrap();
        let expected = consistent_v(0.7);
        assert!((v[0][0] - expected[0]).abs() < 1e-12);
        assert!((v[0][1] - expected[1]).abs() < 1e-12);

        let rfcn = &mut marked.problem.rfcn;
        bind(rfcn, &[&[0.7], &v[0], &[], &[]]);
        rfcn.evaluate().unwrap();
        assert!(rfcn.output(residual::D).unwrap().iter().all(|d| d.abs() < 1e-14));
    }

    #[test]
    fn exact_hessian_mode_builds_augmented_problem() {
        let u = Expr::symbol("u", 2, 1);
        let v = Expr::scalar_symbol("v");
        let (u0, u1) = (u.get(0, 0).unwrap(), u.get(1, 0).unwrap());
        let h = u0.mul(&u1).unwrap();
        let obj = v.square().add(&u0.square()).unwrap();
        let g = Expr::vertcat(&[h.sub(&v).unwrap(), u1.sub(&Expr::constant(1.0)).unwrap()]).unwrap();
        let fg = Function::new(vec![u.into(), v.into()], vec![obj.into(), g.into()]).unwrap();
        let lifter = Lifter::new(LifterSettings {
            gauss_newton: false,
            ..LifterSettings::default()
        });
        let mut problem = lifter.lift(&fg).unwrap();
        assert_eq!(problem.nv_aug(), 2);
        assert_eq!(problem.n_lam_x(), 3);
        assert_eq!(problem.n_lam_g(), 1);

        // With zero multipliers and a consistent point the Hessian block in u of
        // L = (u0 u1)² + u0² is [2u1² + 2, 4u0u1; 4u0u1, 2u0²].
        let (a, b) = (0.5, 2.0);
        let vv = a * b;
        bind(&mut problem.lfcn, &[&[a, b], &[vv, 0.0], &[0.0; 3], &[0.0], &[0.0, 0.0]]);
        problem.lfcn.evaluate().unwrap();
        let hess = problem.lfcn.output_matrix(linearization::J1).unwrap();
        assert!((hess[(0, 0)] - (2.0 * b * b + 2.0)).abs() < 1e-12);
        assert!((hess[(0, 1)] - 4.0 * a * b).abs() < 1e-12);
        assert!((hess[(1, 0)] - 4.0 * a * b).abs() < 1e-12);
        assert!((hess[(1, 1)] - 2.0 * a * a).abs() < 1e-12);
    }

    #[test]
    fn rejects_malformed_sources() {
        let u = Expr::scalar_symbol("u");
        let only = Function::new(vec![u.clone().into()], vec![u.clone().into()]).unwrap();
        assert!(Lifter::default().lift(&only).is_err());
    }
}
