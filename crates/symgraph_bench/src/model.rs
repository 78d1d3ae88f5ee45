//! Linearized shallow-water equations on a square pool, discretized on a staggered grid
//! and stepped with symplectic Euler.

use anyhow::{bail, Context, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use symgraph_core::integrator::{compose_steps, simulate};
use symgraph_core::{Expr, Function, FunctionOptions, SxMatrix};
use tracing::info;

/// Physical constants and discretization of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShallowWaterConfig {
    pub n_boxes: usize,
    /// Euler steps per measurement interval.
    pub n_euler: usize,
    pub n_meas: usize,
    pub gravity: f64,
    pub pool_width: f64,
    /// Radius of the initial disturbance; the bump itself covers a third of it.
    pub spike_radius: f64,
    pub spike_height: f64,
    pub spike_center: [f64; 2],
    pub end_time: f64,
}

impl Default for ShallowWaterConfig {
    fn default() -> Self {
        Self {
            n_boxes: 15,
            n_euler: 10,
            n_meas: 10,
            gravity: 9.81,
            pool_width: 0.2,
            spike_radius: 0.03,
            spike_height: 0.01,
            spike_center: [0.04, 0.04],
            end_time: 1.0,
        }
    }
}

impl ShallowWaterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_boxes < 2 {
            bail!("n_boxes must be at least 2, got {}", self.n_boxes);
        }
        if self.n_euler == 0 || self.n_meas == 0 {
            bail!("n_euler and n_meas must be positive");
        }
        if self.pool_width <= 0.0 || self.end_time <= 0.0 {
            bail!("pool_width and end_time must be positive");
        }
        Ok(())
    }

    pub fn dt(&self) -> f64 {
        self.end_time / (self.n_euler * self.n_meas) as f64
    }

    pub fn dx(&self) -> f64 {
        self.pool_width / self.n_boxes as f64
    }

    /// Water heights at rest plus the cosine bump around `spike_center`.
    pub fn initial_height(&self) -> DMatrix<f64> {
        let n = self.n_boxes;
        let dx = self.dx();
        let radius = self.spike_radius / 3.0;
        let [cx, cy] = self.spike_center;
        DMatrix::from_fn(n, n, |i, j| {
            let x = (i as f64 + 0.5) * dx;
            let y = (j as f64 + 0.5) * dx;
            let dist = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
            if dist < radius {
                self.spike_height * (std::f64::consts::PI * dist / (2.0 * radius)).cos()
            } else {
                0.0
            }
        })
    }
}

/// Discrete dynamics over one measurement interval and the initial state.
#[derive(Debug, Clone)]
pub struct ShallowWaterModel {
    pub config: ShallowWaterConfig,
    /// `interval(p, u, v, h) -> (u, v, h)` with `p = [drag, depth]`.
    pub interval: Function,
    pub u0: DMatrix<f64>,
    pub v0: DMatrix<f64>,
    pub h0: DMatrix<f64>,
}

fn entry(m: &SxMatrix, i: usize, j: usize) -> Result<Expr> {
    Ok(m.get(i, j)?.clone())
}

fn set(m: &mut SxMatrix, i: usize, j: usize, value: Expr) {
    let rows = m.rows();
    m.elems_mut()[i + j * rows] = value;
}

impl ShallowWaterModel {
    pub fn new(config: ShallowWaterConfig) -> Result<Self> {
        config.validate()?;
        let step = Self::step_function(&config).context("building the Euler step")?;
        info!(nodes = step.count_nodes(), "generated single step dynamics");
        let interval = compose_steps(&step, config.n_euler, 1)?;
        info!(nodes = interval.count_nodes(), "generated discrete dynamics");
        let n = config.n_boxes;
        Ok(Self {
            u0: DMatrix::zeros(n + 1, n),
            v0: DMatrix::zeros(n, n + 1),
            h0: config.initial_height(),
            interval,
            config,
        })
    }

    /// One symplectic Euler step: velocities first, then heights from the new velocities.
    fn step_function(config: &ShallowWaterConfig) -> Result<Function> {
        let n = config.n_boxes;
        let (dt, dx) = (config.dt(), config.dx());
        let p = SxMatrix::symbol("p", 2, 1);
        let drag = p.at(0)?.clone();
        let depth = p.at(1)?.clone();
        let uk = SxMatrix::symbol("uk", n + 1, n);
        let vk = SxMatrix::symbol("vk", n, n + 1);
        let hk = SxMatrix::symbol("hk", n, n);
        let (mut u, mut v, mut h) = (uk.clone(), vk.clone(), hk.clone());

        let c1 = Expr::constant(-dt * config.gravity / dx);
        let c2 = drag.scale(dt);
        for i in 0..n - 1 {
            for j in 0..n {
                let slope = entry(&h, i + 1, j)?.sub(&entry(&h, i, j)?)?;
                let old = entry(&u, i + 1, j)?;
                let new = old.add(&c1.mul(&slope)?.sub(&c2.mul(&old)?)?)?;
                set(&mut u, i + 1, j, new);
            }
        }
        for i in 0..n {
            for j in 0..n - 1 {
                let slope = entry(&h, i, j + 1)?.sub(&entry(&h, i, j)?)?;
                let old = entry(&v, i, j + 1)?;
                let new = old.add(&c1.mul(&slope)?.sub(&c2.mul(&old)?)?)?;
                set(&mut v, i, j + 1, new);
            }
        }

        let c3 = depth.scale(-dt / dx);
        for i in 0..n {
            for j in 0..n {
                let du = entry(&u, i + 1, j)?.sub(&entry(&u, i, j)?)?;
                let dv = entry(&v, i, j + 1)?.sub(&entry(&v, i, j)?)?;
                let old = entry(&h, i, j)?;
                let new = old.add(&c3.mul(&du)?.add(&c3.mul(&dv)?)?)?;
                set(&mut h, i, j, new);
            }
        }

        Ok(Function::with_options(
            vec![p.into(), uk.into(), vk.into(), hk.into()],
            vec![u.into(), v.into(), h.into()],
            FunctionOptions::named("euler_step"),
        )?)
    }

    /// Heights after every measurement interval, each flattened column-major.
    pub fn simulate(&self, drag: f64, depth: f64) -> Result<Vec<Vec<f64>>> {
        let mut interval = self.interval.clone();
        let inputs = vec![
            vec![drag, depth],
            self.u0.as_slice().to_vec(),
            self.v0.as_slice().to_vec(),
            self.h0.as_slice().to_vec(),
        ];
        let trajectory = simulate(&mut interval, self.config.n_meas, &inputs, 1)?;
        Ok(trajectory
            .into_iter()
            .skip(1)
            .map(|mut state| state.swap_remove(2))
            .collect())
    }
}
