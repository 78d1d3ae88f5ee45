//! Fixed-step time stepping built from symbolic calls.
//!
//! A step function takes `n_fixed` parameter inputs followed by the state inputs and
//! returns the next state, one output per state input.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::function::{Function, FunctionOptions};
use crate::node::Expr;
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepScheme {
    #[default]
    ExplicitEuler,
    /// Classic Runge-Kutta 4th order.
    Rk4,
}

fn check_step(step: &Function, n_fixed: usize) -> Result<()> {
    if n_fixed > step.n_in() {
        return Err(Error::InvalidArgument(format!(
            "'{}' has {} inputs, cannot hold {n_fixed} fixed",
            step.name(),
            step.n_in()
        )));
    }
    let n_state = step.n_in() - n_fixed;
    if step.n_out() != n_state {
        return Err(Error::InvalidArgument(format!(
            "'{}' returns {} outputs for {n_state} state inputs",
            step.name(),
            step.n_out()
        )));
    }
    for k in 0..n_state {
        let (input, output) = (step.input_shape(n_fixed + k)?, step.output_shape(k)?);
        if input != output {
            return Err(Error::shape("step", input, output));
        }
    }
    Ok(())
}

fn fresh_inputs(f: &Function, prefix: &str) -> Result<Vec<Expr>> {
    (0..f.n_in())
        .map(|i| {
            let Shape { rows, cols } = f.input_shape(i)?;
            Ok(Expr::symbol(format!("{prefix}{i}"), rows, cols))
        })
        .collect()
}

/// One explicit step of `rhs(x, p) -> dx/dt`, as a function `step(p, x) -> x_next`.
pub fn explicit_step(rhs: &Function, scheme: StepScheme, dt: f64) -> Result<Function> {
    if rhs.n_in() != 2 || rhs.n_out() != 1 {
        return Err(Error::InvalidArgument(format!(
            "right-hand side '{}' must map (x, p) to dx/dt",
            rhs.name()
        )));
    }
    let xs = rhs.input_shape(0)?;
    if rhs.output_shape(0)? != xs {
        return Err(Error::shape("explicit_step", xs, rhs.output_shape(0)?));
    }
    let ps = rhs.input_shape(1)?;
    let x = Expr::symbol("x", xs.rows, xs.cols);
    let p = Expr::symbol("p", ps.rows, ps.cols);
    let f = |state: &Expr| -> Result<Expr> {
        let mut out = rhs.call(&[state.clone(), p.clone()])?;
        Ok(out.remove(0))
    };

    let next = match scheme {
        StepScheme::ExplicitEuler => x.add(&f(&x)?.scale(dt))?,
        StepScheme::Rk4 => {
            let half = 0.5 * dt;
            // k1 = f(x)
            let k1 = f(&x)?;
            // k2 = f(x + dt/2 k1)
            let k2 = f(&x.add(&k1.scale(half))?)?;
            // k3 = f(x + dt/2 k2)
            let k3 = f(&x.add(&k2.scale(half))?)?;
            // k4 = f(x + dt k3)
            let k4 = f(&x.add(&k3.scale(dt))?)?;
            // x + dt/6 (k1 + 2 k2 + 2 k3 + k4)
            let sum = k1
                .add(&k2.scale(2.0))?
                .add(&k3.scale(2.0))?
                .add(&k4)?;
            x.add(&sum.scale(dt / 6.0))?
        }
    };
    Function::with_options(
        vec![p.into(), x.into()],
        vec![next.into()],
        FunctionOptions::named(format!("{}_step", rhs.name())),
    )
}

/// Chains `n_steps` calls of `step`, feeding the outputs back as the state inputs.
///
/// The result has the same inputs as `step` and returns the state after the last step.
pub fn compose_steps(step: &Function, n_steps: usize, n_fixed: usize) -> Result<Function> {
    check_step(step, n_fixed)?;
    let inputs = fresh_inputs(step, "i")?;
    let (fixed, initial) = inputs.split_at(n_fixed);
    let mut state = initial.to_vec();
    for _ in 0..n_steps {
        let mut args = fixed.to_vec();
        args.extend(state.iter().cloned());
        state = step.call(&args)?;
    }
    debug!(name = %step.name(), n_steps, "composed step function");
    Function::with_options(
        inputs.into_iter().map(Into::into).collect(),
        state.into_iter().map(Into::into).collect(),
        FunctionOptions::named(format!("{}_x{n_steps}", step.name())),
    )
}

/// Numeric counterpart of [`compose_steps`]: runs `step` `n_steps` times from `inputs`
/// and returns the state after every step, starting with the initial one.
pub fn simulate(
    step: &mut Function,
    n_steps: usize,
    inputs: &[Vec<f64>],
    n_fixed: usize,
) -> Result<Vec<Vec<Vec<f64>>>> {
    check_step(step, n_fixed)?;
    if inputs.len() != step.n_in() {
        return Err(Error::InvalidArgument(format!(
            "'{}' takes {} inputs, got {}",
            step.name(),
            step.n_in(),
            inputs.len()
        )));
    }
    for (i, values) in inputs.iter().enumerate() {
        step.set_input(i, values)?;
    }
    let mut trajectory = Vec::with_capacity(n_steps + 1);
    trajectory.push(inputs[n_fixed..].to_vec());
    for _ in 0..n_steps {
        step.evaluate()?;
        let next: Vec<Vec<f64>> = (0..step.n_out())
            .map(|o| step.output(o).map(<[f64]>::to_vec))
            .collect::<Result<_>>()?;
        for (k, values) in next.iter().enumerate() {
            step.set_input(n_fixed + k, values)?;
        }
        trajectory.push(next);
    }
    Ok(trajectory)
}
