//! Compiled functions: flattened expression graphs with their own numeric workspace.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::{Algorithm, Binding};
use crate::autodiff::Dual;
use crate::error::{Error, Result};
use crate::evaluator::{self, Workspace};
use crate::node::{Expr, Op};
use crate::shape::Shape;
use crate::sx::SxMatrix;

/// An input or output of a function: a matrix-valued expression or a matrix of scalar
/// expressions.
#[derive(Debug, Clone)]
pub enum Port {
    Matrix(Expr),
    Scalars(SxMatrix),
}

impl Port {
    pub fn shape(&self) -> Shape {
        match self {
            Port::Matrix(e) => e.shape(),
            Port::Scalars(sx) => sx.shape(),
        }
    }

    pub fn as_expr(&self) -> Option<&Expr> {
        match self {
            Port::Matrix(e) => Some(e),
            Port::Scalars(_) => None,
        }
    }

    pub fn as_sx(&self) -> Option<&SxMatrix> {
        match self {
            Port::Matrix(_) => None,
            Port::Scalars(sx) => Some(sx),
        }
    }

    fn roots(&self) -> Vec<Expr> {
        match self {
            Port::Matrix(e) => vec![e.clone()],
            Port::Scalars(sx) => sx.elems().to_vec(),
        }
    }
}

impl From<Expr> for Port {
    fn from(e: Expr) -> Self {
        Port::Matrix(e)
    }
}

impl From<SxMatrix> for Port {
    fn from(sx: SxMatrix) -> Self {
        Port::Scalars(sx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionOptions {
    pub name: String,
    /// Reuse work slots of dead values.
    pub live_variables: bool,
    /// Report NaN/Inf outputs from `evaluate` as [`Error::Numeric`].
    pub check_finite: bool,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        Self {
            name: "function".to_string(),
            live_variables: false,
            check_finite: false,
        }
    }
}

impl FunctionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Location of an output entry block: element `element` fills `len` entries at `offset`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Part {
    pub element: usize,
    pub offset: usize,
    pub len: usize,
}

/// The immutable part of a function, shared by every instance and by call nodes.
pub struct FunctionDef {
    options: FunctionOptions,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    output_parts: Vec<Vec<Part>>,
    algorithm: Algorithm,
}

impl FunctionDef {
    pub(crate) fn build(
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        options: FunctionOptions,
        allow_free: bool,
    ) -> Result<Self> {
        let mut bindings: HashMap<_, Binding> = HashMap::new();
        for (i, port) in inputs.iter().enumerate() {
            if port.shape().numel() == 0 {
                continue;
            }
            for (offset, symbol) in port.roots().iter().enumerate() {
                let Some(name) = symbol.name() else {
                    return Err(Error::InvalidArgument(format!(
                        "input {i} of '{}' is not a symbolic primitive",
                        options.name
                    )));
                };
                if bindings
                    .insert(symbol.id(), Binding { input: i, offset })
                    .is_some()
                {
                    return Err(Error::InvalidArgument(format!(
                        "symbol '{name}' appears more than once among the inputs of '{}'",
                        options.name
                    )));
                }
            }
        }

        let roots: Vec<Expr> = outputs.iter().flat_map(Port::roots).collect();
        let (algorithm, index) =
            Algorithm::build(&roots, &bindings, allow_free, options.live_variables)?;

        let output_parts = outputs
            .iter()
            .map(|port| match port {
                Port::Matrix(e) => vec![Part {
                    element: index[&e.id()],
                    offset: 0,
                    len: e.numel(),
                }],
                Port::Scalars(sx) => sx
                    .elems()
                    .iter()
                    .enumerate()
                    .map(|(k, e)| Part {
                        element: index[&e.id()],
                        offset: k,
                        len: 1,
                    })
                    .collect(),
            })
            .collect();

        debug!(
            name = %options.name,
            elements = algorithm.len(),
            slots = algorithm.work_size(),
            work_len = algorithm.work_len(),
            "flattened function"
        );

        Ok(Self {
            options,
            inputs,
            outputs,
            output_parts,
            algorithm,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &FunctionOptions {
        &self.options
    }

    pub fn n_in(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_out(&self) -> usize {
        self.outputs.len()
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    pub(crate) fn port_shape_in(&self, i: usize) -> Shape {
        self.inputs[i].shape()
    }

    pub(crate) fn port_shape_out(&self, o: usize) -> Shape {
        self.outputs[o].shape()
    }

    pub(crate) fn output_parts(&self, o: usize) -> &[Part] {
        &self.output_parts[o]
    }

    fn check_input(&self, i: usize) -> Result<()> {
        if i >= self.n_in() {
            return Err(Error::index("input", i, self.n_in()));
        }
        Ok(())
    }

    fn check_output(&self, o: usize) -> Result<()> {
        if o >= self.n_out() {
            return Err(Error::index("output", o, self.n_out()));
        }
        Ok(())
    }

    fn check_sx_args(&self, op: &'static str, args: &[SxMatrix]) -> Result<()> {
        if args.len() != self.n_in() {
            return Err(Error::InvalidArgument(format!(
                "'{}' takes {} inputs, got {}",
                self.name(),
                self.n_in(),
                args.len()
            )));
        }
        for (i, arg) in args.iter().enumerate() {
            let expected = self.port_shape_in(i);
            if arg.numel() != expected.numel() {
                return Err(Error::shape(op, expected, arg.shape()));
            }
        }
        Ok(())
    }

    fn sx_outputs(&self, values: Vec<Vec<Expr>>) -> Vec<SxMatrix> {
        values
            .into_iter()
            .enumerate()
            .map(|(o, elems)| SxMatrix::from_parts(self.port_shape_out(o), elems))
            .collect()
    }

    pub(crate) fn eval_sx(&self, args: &[SxMatrix]) -> Result<Vec<SxMatrix>> {
        self.check_sx_args("eval_sx", args)?;
        let inputs: Vec<Vec<Expr>> = args.iter().map(|a| a.elems().to_vec()).collect();
        let tape = evaluator::eval_tape(self, &inputs)?;
        Ok(self.sx_outputs(evaluator::tape_outputs(self, &tape)))
    }

    pub(crate) fn forward_sx(
        &self,
        args: &[SxMatrix],
        seeds: &[Vec<SxMatrix>],
    ) -> Result<(Vec<SxMatrix>, Vec<Vec<SxMatrix>>)> {
        self.check_sx_args("forward_sx", args)?;
        for direction in seeds {
            self.check_sx_args("forward_sx", direction)?;
        }
        if seeds.is_empty() {
            return Ok((self.eval_sx(args)?, Vec::new()));
        }
        let mut primal = Vec::new();
        let mut sens = Vec::with_capacity(seeds.len());
        for direction in seeds {
            let inputs: Vec<Vec<Dual<Expr>>> = args
                .iter()
                .zip(direction)
                .map(|(a, s)| {
                    a.elems()
                        .iter()
                        .zip(s.elems())
                        .map(|(v, e)| Dual::new(v.clone(), e.clone()))
                        .collect()
                })
                .collect();
            let tape = evaluator::eval_tape(self, &inputs)?;
            let outputs = evaluator::tape_outputs(self, &tape);
            if primal.is_empty() {
                primal = outputs
                    .iter()
                    .map(|o| o.iter().map(|d| d.val.clone()).collect())
                    .collect();
            }
            let eps = outputs
                .into_iter()
                .map(|o| o.into_iter().map(|d| d.eps).collect())
                .collect();
            sens.push(self.sx_outputs(eps));
        }
        Ok((self.sx_outputs(primal), sens))
    }

    pub(crate) fn adjoint_sx(
        &self,
        args: &[SxMatrix],
        seeds: &[Vec<SxMatrix>],
    ) -> Result<(Vec<SxMatrix>, Vec<Vec<SxMatrix>>)> {
        self.check_sx_args("adjoint_sx", args)?;
        let inputs: Vec<Vec<Expr>> = args.iter().map(|a| a.elems().to_vec()).collect();
        let tape = evaluator::eval_tape(self, &inputs)?;
        let outputs = self.sx_outputs(evaluator::tape_outputs(self, &tape));
        let mut sens = Vec::with_capacity(seeds.len());
        for direction in seeds {
            if direction.len() != self.n_out() {
                return Err(Error::InvalidArgument(format!(
                    "'{}' has {} outputs, got {} adjoint seeds",
                    self.name(),
                    self.n_out(),
                    direction.len()
                )));
            }
            for (o, seed) in direction.iter().enumerate() {
                let expected = self.port_shape_out(o);
                if seed.numel() != expected.numel() {
                    return Err(Error::shape("adjoint_sx", expected, seed.shape()));
                }
            }
            let seed_values: Vec<Vec<Expr>> =
                direction.iter().map(|s| s.elems().to_vec()).collect();
            let input_sens = evaluator::adjoint_tape(self, &tape, &seed_values)?;
            let mats = input_sens
                .into_iter()
                .enumerate()
                .map(|(i, elems)| SxMatrix::from_parts(self.port_shape_in(i), elems))
                .collect();
            sens.push(mats);
        }
        Ok((outputs, sens))
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.options.name)
            .field("n_in", &self.n_in())
            .field("n_out", &self.n_out())
            .field("elements", &self.algorithm.len())
            .finish()
    }
}

/// Symbolic call of a compiled function: one call node plus one selector per output.
pub(crate) fn call_def(def: &Arc<FunctionDef>, args: &[Expr]) -> Result<Vec<Expr>> {
    if args.len() != def.n_in() {
        return Err(Error::InvalidArgument(format!(
            "'{}' takes {} inputs, got {}",
            def.name(),
            def.n_in(),
            args.len()
        )));
    }
    for (i, arg) in args.iter().enumerate() {
        let expected = def.port_shape_in(i);
        let both_empty = expected.numel() == 0 && arg.numel() == 0;
        if arg.shape() != expected && !both_empty {
            return Err(Error::shape("call", expected, arg.shape()));
        }
    }
    let total: usize = (0..def.n_out()).map(|o| def.port_shape_out(o).numel()).sum();
    let call = Expr::from_parts(Op::Call(def.clone()), args.to_vec(), Shape::column(total));
    let mut offset = 0;
    let mut outputs = Vec::with_capacity(def.n_out());
    for index in 0..def.n_out() {
        let shape = def.port_shape_out(index);
        outputs.push(Expr::from_parts(
            Op::Output { index, offset },
            vec![call.clone()],
            shape,
        ));
        offset += shape.numel();
    }
    Ok(outputs)
}

/// A compiled function instance: shared definition plus private numeric buffers.
#[derive(Debug, Clone)]
pub struct Function {
    def: Arc<FunctionDef>,
    ws: Workspace,
    outputs: Vec<Vec<f64>>,
}

impl Function {
    pub fn new(inputs: Vec<Port>, outputs: Vec<Port>) -> Result<Self> {
        Self::with_options(inputs, outputs, FunctionOptions::default())
    }

    pub fn with_options(
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        options: FunctionOptions,
    ) -> Result<Self> {
        let def = FunctionDef::build(inputs, outputs, options, false)?;
        Ok(Self::from_def(Arc::new(def)))
    }

    pub fn from_def(def: Arc<FunctionDef>) -> Self {
        let ws = Workspace::new(&def);
        let outputs = (0..def.n_out())
            .map(|o| vec![0.0; def.port_shape_out(o).numel()])
            .collect();
        Self { def, ws, outputs }
    }

    pub fn def(&self) -> &Arc<FunctionDef> {
        &self.def
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn n_in(&self) -> usize {
        self.def.n_in()
    }

    pub fn n_out(&self) -> usize {
        self.def.n_out()
    }

    pub fn input_shape(&self, i: usize) -> Result<Shape> {
        self.def.check_input(i)?;
        Ok(self.def.port_shape_in(i))
    }

    pub fn output_shape(&self, o: usize) -> Result<Shape> {
        self.def.check_output(o)?;
        Ok(self.def.port_shape_out(o))
    }

    pub fn input_expr(&self, i: usize) -> Result<&Port> {
        self.def.check_input(i)?;
        Ok(&self.def.inputs[i])
    }

    pub fn output_expr(&self, o: usize) -> Result<&Port> {
        self.def.check_output(o)?;
        Ok(&self.def.outputs[o])
    }

    /// Input `i` as a scalar matrix; fails for matrix-valued ports.
    pub fn input_sx(&self, i: usize) -> Result<SxMatrix> {
        self.input_expr(i)?.as_sx().cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("input {i} of '{}' is not expanded", self.name()))
        })
    }

    pub fn output_sx(&self, o: usize) -> Result<SxMatrix> {
        self.output_expr(o)?.as_sx().cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("output {o} of '{}' is not expanded", self.name()))
        })
    }

    /// Every port is a scalar matrix.
    pub fn is_expanded(&self) -> bool {
        self.def
            .inputs
            .iter()
            .chain(&self.def.outputs)
            .all(|p| matches!(p, Port::Scalars(_)))
    }

    pub fn algorithm(&self) -> &Algorithm {
        self.def.algorithm()
    }

    pub fn work_size(&self) -> usize {
        self.def.algorithm().work_size()
    }

    pub fn count_nodes(&self) -> usize {
        self.def.algorithm().len()
    }

    pub fn set_input(&mut self, i: usize, values: &[f64]) -> Result<()> {
        self.def.check_input(i)?;
        let buffer = &mut self.ws.inputs[i];
        if values.len() != buffer.len() {
            return Err(Error::shape(
                "set_input",
                self.def.port_shape_in(i),
                Shape::column(values.len()),
            ));
        }
        buffer.copy_from_slice(values);
        Ok(())
    }

    pub fn set_input_matrix(&mut self, i: usize, values: &DMatrix<f64>) -> Result<()> {
        let expected = self.input_shape(i)?;
        let given = Shape::new(values.nrows(), values.ncols());
        if given != expected {
            return Err(Error::shape("set_input", expected, given));
        }
        self.set_input(i, values.as_slice())
    }

    pub fn input(&self, i: usize) -> Result<&[f64]> {
        self.def.check_input(i)?;
        Ok(&self.ws.inputs[i])
    }

    /// Output `o` from the last [`evaluate`](Self::evaluate), column-major.
    pub fn output(&self, o: usize) -> Result<&[f64]> {
        self.def.check_output(o)?;
        Ok(&self.outputs[o])
    }

    pub fn output_matrix(&self, o: usize) -> Result<DMatrix<f64>> {
        let shape = self.output_shape(o)?;
        Ok(DMatrix::from_column_slice(
            shape.rows,
            shape.cols,
            &self.outputs[o],
        ))
    }

    pub fn output_scalar(&self, o: usize) -> Result<f64> {
        let values = self.output(o)?;
        match values {
            [v] => Ok(*v),
            _ => Err(Error::shape(
                "output_scalar",
                Shape::scalar(),
                self.def.port_shape_out(o),
            )),
        }
    }

    /// Evaluates every output at the bound inputs.
    pub fn evaluate(&mut self) -> Result<()> {
        evaluator::run(&self.def, &mut self.ws);
        for (o, out) in self.outputs.iter_mut().enumerate() {
            evaluator::gather_output(&self.def, &self.ws, o, out);
        }
        if self.def.options.check_finite {
            for (o, out) in self.outputs.iter().enumerate() {
                if let Some(k) = out.iter().position(|v| !v.is_finite()) {
                    return Err(Error::Numeric(format!(
                        "entry {k} of output {o} of '{}' is {}",
                        self.name(),
                        out[k]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Binds every input, evaluates, and returns copies of the outputs.
    pub fn eval(&mut self, inputs: &[&[f64]]) -> Result<Vec<Vec<f64>>> {
        if inputs.len() != self.n_in() {
            return Err(Error::InvalidArgument(format!(
                "'{}' takes {} inputs, got {}",
                self.name(),
                self.n_in(),
                inputs.len()
            )));
        }
        for (i, values) in inputs.iter().enumerate() {
            self.set_input(i, values)?;
        }
        self.evaluate()?;
        Ok(self.outputs.clone())
    }

    /// Symbolic composition: one call node over `args`, one expression per output.
    pub fn call(&self, args: &[Expr]) -> Result<Vec<Expr>> {
        call_def(&self.def, args)
    }

    fn check_seeds(&self, seeds: &[Vec<f64>], ports: usize, shape: impl Fn(usize) -> Shape) -> Result<()> {
        if seeds.len() != ports {
            return Err(Error::InvalidArgument(format!(
                "'{}' expects {ports} seeds, got {}",
                self.name(),
                seeds.len()
            )));
        }
        for (k, seed) in seeds.iter().enumerate() {
            if seed.len() != shape(k).numel() {
                return Err(Error::shape("seed", shape(k), Shape::column(seed.len())));
            }
        }
        Ok(())
    }

    /// Forward sensitivities of every output along one input direction, at the bound inputs.
    pub fn forward(&self, seeds: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.check_seeds(seeds, self.n_in(), |i| self.def.port_shape_in(i))?;
        let inputs: Vec<Vec<Dual<f64>>> = self
            .ws
            .inputs
            .iter()
            .zip(seeds)
            .map(|(x, s)| x.iter().zip(s).map(|(&v, &e)| Dual::new(v, e)).collect())
            .collect();
        let tape = evaluator::eval_tape(&self.def, &inputs)?;
        Ok(evaluator::tape_outputs(&self.def, &tape)
            .into_iter()
            .map(|o| o.into_iter().map(|d| d.eps).collect())
            .collect())
    }

    /// Adjoint sensitivities of every input for one set of output seeds, at the bound inputs.
    pub fn adjoint(&self, seeds: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.check_seeds(seeds, self.n_out(), |o| self.def.port_shape_out(o))?;
        let tape = evaluator::eval_tape(&self.def, &self.ws.inputs)?;
        evaluator::adjoint_tape(&self.def, &tape, seeds)
    }

    /// Dense Jacobian of output `oind` with respect to input `iind` at the bound inputs.
    ///
    /// Uses forward sweeps when the input is no larger than the output, adjoint sweeps
    /// otherwise.
    pub fn jacobian(&self, iind: usize, oind: usize) -> Result<DMatrix<f64>> {
        let n = self.input_shape(iind)?.numel();
        let m = self.output_shape(oind)?.numel();
        let mut jac = DMatrix::zeros(m, n);
        if n <= m {
            let mut seeds: Vec<Vec<f64>> = self.ws.inputs.iter().map(|x| vec![0.0; x.len()]).collect();
            for j in 0..n {
                seeds[iind][j] = 1.0;
                let sens = self.forward(&seeds)?;
                seeds[iind][j] = 0.0;
                jac.column_mut(j).copy_from_slice(&sens[oind]);
            }
        } else {
            let tape = evaluator::eval_tape(&self.def, &self.ws.inputs)?;
            let mut seeds: Vec<Vec<f64>> = self.outputs.iter().map(|y| vec![0.0; y.len()]).collect();
            for i in 0..m {
                seeds[oind][i] = 1.0;
                let sens = evaluator::adjoint_tape(&self.def, &tape, &seeds)?;
                seeds[oind][i] = 0.0;
                for (j, v) in sens[iind].iter().enumerate() {
                    jac[(i, j)] = *v;
                }
            }
        }
        Ok(jac)
    }

    /// [`jacobian`](Self::jacobian) exported in compressed sparse column form, dropping
    /// exact zeros.
    pub fn jacobian_csc(&self, iind: usize, oind: usize) -> Result<CscMatrix<f64>> {
        let dense = self.jacobian(iind, oind)?;
        let mut coo = CooMatrix::new(dense.nrows(), dense.ncols());
        for j in 0..dense.ncols() {
            for i in 0..dense.nrows() {
                let v = dense[(i, j)];
                if v != 0.0 {
                    coo.push(i, j, v);
                }
            }
        }
        Ok(CscMatrix::from(&coo))
    }

    /// Rewrites the function over scalar expressions: every matrix operation and every
    /// nested call is inlined entry by entry.
    pub fn expand(&self) -> Result<Function> {
        let args: Vec<SxMatrix> = self
            .def
            .inputs
            .iter()
            .enumerate()
            .map(|(i, port)| match port {
                Port::Scalars(sx) => sx.clone(),
                Port::Matrix(e) => {
                    let name = e.name().map(str::to_string).unwrap_or_else(|| format!("i{i}"));
                    SxMatrix::symbol(&name, e.rows(), e.cols())
                }
            })
            .collect();
        let outputs = self.def.eval_sx(&args)?;
        debug!(name = %self.name(), "expanding function");
        Function::with_options(
            args.into_iter().map(Port::from).collect(),
            outputs.into_iter().map(Port::from).collect(),
            self.def.options.clone(),
        )
    }

    pub fn eval_sx(&self, args: &[SxMatrix]) -> Result<Vec<SxMatrix>> {
        self.def.eval_sx(args)
    }

    /// Symbolic forward sensitivities. Returns the outputs and, per direction, the
    /// sensitivities of every output.
    pub fn forward_sx(
        &self,
        args: &[SxMatrix],
        seeds: &[Vec<SxMatrix>],
    ) -> Result<(Vec<SxMatrix>, Vec<Vec<SxMatrix>>)> {
        self.def.forward_sx(args, seeds)
    }

    /// Symbolic adjoint sensitivities. Returns the outputs and, per direction, the
    /// sensitivities of every input.
    pub fn adjoint_sx(
        &self,
        args: &[SxMatrix],
        seeds: &[Vec<SxMatrix>],
    ) -> Result<(Vec<SxMatrix>, Vec<Vec<SxMatrix>>)> {
        self.def.adjoint_sx(args, seeds)
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

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
    }

    /// f(x, y) = [sin(x0) * y; x0 * x1 + exp(y); x1 / y]
    fn sample() -> (Expr, Expr, Function) {
        let x = Expr::symbol("x", 2, 1);
        let y = Expr::scalar_symbol("y");
        let x0 = x.get(0, 0).unwrap();
        let x1 = x.get(1, 0).unwrap();
        let out = Expr::vertcat(&[
            x0.sin().mul(&y).unwrap(),
            x0.mul(&x1).unwrap().add(&y.exp()).unwrap(),
            x1.div(&y).unwrap(),
        ])
        .unwrap();
        let f = Function::new(vec![x.clone().into(), y.clone().into()], vec![out.into()])
            .expect("function");
        (x, y, f)
    }

    #[test]
    fn evaluation_matches_direct_arithmetic() {
        let (_, _, mut f) = sample();
        let out = f.eval(&[&[0.3, -1.2], &[0.8]]).expect("eval");
        let expected = [0.3f64.sin() * 0.8, 0.3 * -1.2 + 0.8f64.exp(), -1.2 / 0.8];
        for (a, b) in out[0].iter().zip(expected) {
            assert!(close(*a, b, 1e-15), "{a} vs {b}");
        }
    }

    #[test]
    fn repeated_evaluation_is_bit_identical() {
        let (_, _, mut f) = sample();
        let first = f.eval(&[&[0.1, 0.2], &[0.3]]).expect("eval");
        let second = f.eval(&[&[0.1, 0.2], &[0.3]]).expect("eval");
        for (a, b) in first[0].iter().zip(&second[0]) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn matrix_operations_match_nalgebra() {
        let a = Expr::symbol("a", 3, 2);
        let b = Expr::symbol("b", 2, 2);
        let prod = a.mtimes(&b).unwrap();
        let block = a.slice(1..3, 0..2).unwrap();
        let reshaped = a.reshape(2, 3).unwrap().transpose();
        let stacked = Expr::horzcat(&[prod.clone(), reshaped.clone()]).unwrap();
        let mut f = Function::new(
            vec![a.into(), b.into()],
            vec![prod.into(), block.into(), stacked.into()],
        )
        .unwrap();

        let av = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bv = DMatrix::from_row_slice(2, 2, &[0.5, -1.0, 2.0, 0.25]);
        f.set_input_matrix(0, &av).unwrap();
        f.set_input_matrix(1, &bv).unwrap();
        f.evaluate().unwrap();

        assert_eq!(f.output_matrix(0).unwrap(), &av * &bv);
        assert_eq!(f.output_matrix(1).unwrap(), av.rows(1, 2).into_owned());
        let reshaped_v = DMatrix::from_column_slice(2, 3, av.as_slice()).transpose();
        let stacked_v = f.output_matrix(2).unwrap();
        assert_eq!(stacked_v.columns(0, 2).into_owned(), &av * &bv);
        assert_eq!(stacked_v.columns(2, 2).into_owned(), reshaped_v);
    }

    #[test]
    fn composed_call_matches_inline_graph() {
        let (_, _, f) = sample();
        let z = Expr::symbol("z", 2, 1);
        let w = Expr::scalar_symbol("w");
        let inner = f.call(&[z.clone(), w.clone()]).unwrap();
        let twice = f
            .call(&[inner[0].slice_rows(0..2).unwrap(), w.clone()])
            .unwrap();
        let mut g = Function::new(vec![z.into(), w.into()], vec![twice[0].clone().into()])
            .unwrap();
        let out = g.eval(&[&[0.4, 0.9], &[1.1]]).unwrap();

        let (_, _, mut f2) = sample();
        let once = f2.eval(&[&[0.4, 0.9], &[1.1]]).unwrap();
        let again = f2.eval(&[&once[0][0..2], &[1.1]]).unwrap();
        assert_eq!(out[0], again[0]);
    }

    #[test]
    fn live_variables_do_not_change_results() {
        let x = Expr::symbol("x", 3, 1);
        let mut y = x.clone();
        for k in 0..6 {
            let shifted = y.add(&Expr::constant(k as f64)).unwrap();
            y = shifted.sin().mul(&y.exp()).unwrap();
        }
        let total = y.sum();
        let ports = || (vec![Port::from(x.clone())], vec![Port::from(y.clone()), Port::from(total.clone())]);
        let (i1, o1) = ports();
        let mut unique = Function::new(i1, o1).unwrap();
        let (i2, o2) = ports();
        let mut live = Function::with_options(
            i2,
            o2,
            FunctionOptions {
                live_variables: true,
                ..FunctionOptions::default()
            },
        )
        .unwrap();
        assert!(live.work_size() < unique.work_size());
        let a = unique.eval(&[&[0.1, 0.5, -0.3]]).unwrap();
        let b = live.eval(&[&[0.1, 0.5, -0.3]]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn forward_adjoint_and_finite_differences_agree() {
        let (_, _, mut f) = sample();
        let x = [0.7, -0.4];
        let y = [1.3];
        f.eval(&[&x, &y]).unwrap();
        let fwd = f.jacobian(0, 0).unwrap();

        let mut adj = DMatrix::zeros(3, 2);
        for i in 0..3 {
            let mut seed = vec![0.0; 3];
            seed[i] = 1.0;
            let sens = f.adjoint(&[seed]).unwrap();
            for j in 0..2 {
                adj[(i, j)] = sens[0][j];
            }
        }

        let h = 1e-7;
        for j in 0..2 {
            let mut xp = x;
            xp[j] += h;
            let plus = f.eval(&[&xp, &y]).unwrap();
            let mut xm = x;
            xm[j] -= h;
            let minus = f.eval(&[&xm, &y]).unwrap();
            for i in 0..3 {
                let fd = (plus[0][i] - minus[0][i]) / (2.0 * h);
                assert!(close(fwd[(i, j)], adj[(i, j)], 1e-12));
                assert!(close(fwd[(i, j)], fd, 1e-6), "({i},{j}): {} vs {fd}", fwd[(i, j)]);
            }
        }
    }

    #[test]
    fn adjoint_through_calls_matches_forward() {
        let (_, _, f) = sample();
        let z = Expr::symbol("z", 2, 1);
        let w = Expr::scalar_symbol("w");
        let inner = f.call(&[z.clone(), w.clone()]).unwrap();
        let obj = inner[0].inner_prod(&inner[0]).unwrap();
        let mut g = Function::new(vec![z.into(), w.into()], vec![obj.into()]).unwrap();
        g.eval(&[&[0.2, 0.6], &[0.9]]).unwrap();
        let grad = g.adjoint(&[vec![1.0]]).unwrap();
        for j in 0..2 {
            let mut seed = vec![0.0; 2];
            seed[j] = 1.0;
            let d = g.forward(&[seed, vec![0.0]]).unwrap();
            assert!(close(d[0][0], grad[0][j], 1e-12));
        }
        let dw = g.forward(&[vec![0.0, 0.0], vec![1.0]]).unwrap();
        assert!(close(dw[0][0], grad[1][0], 1e-12));
    }

    #[test]
    fn expansion_is_equivalent() {
        let (_, _, mut f) = sample();
        let mut sx = f.expand().unwrap();
        assert!(sx.is_expanded());
        let a = f.eval(&[&[0.25, 0.5], &[2.0]]).unwrap();
        let b = sx.eval(&[&[0.25, 0.5], &[2.0]]).unwrap();
        for (p, q) in a[0].iter().zip(&b[0]) {
            assert!(close(*p, *q, 1e-15));
        }
    }

    #[test]
    fn sparse_jacobian_drops_structural_zeros() {
        let (_, _, mut f) = sample();
        f.eval(&[&[0.5, 0.5], &[1.0]]).unwrap();
        let csc = f.jacobian_csc(0, 0).unwrap();
        // d(sin(x0) y)/dx1 = 0 and d(x1/y)/dx0 = 0
        assert_eq!(csc.nnz(), 4);
        assert_eq!((csc.nrows(), csc.ncols()), (3, 2));
    }

    #[test]
    fn construction_errors() {
        let x = Expr::scalar_symbol("x");
        let p = Expr::scalar_symbol("p");
        let y = x.mul(&p).unwrap();
        assert_err_contains(
            Function::new(vec![x.clone().into()], vec![y.clone().into()]),
            "unbound symbol 'p'",
        );
        assert_err_contains(
            Function::new(vec![x.clone().into(), x.clone().into()], vec![y.clone().into()]),
            "more than once",
        );
        assert_err_contains(
            Function::new(vec![y.clone().into()], vec![y.clone().into()]),
            "not a symbolic primitive",
        );

        let mut f = Function::new(vec![x.clone().into()], vec![x.sqrt().into()]).unwrap();
        assert_err_contains(f.set_input(0, &[1.0, 2.0]), "set_input");
        assert_err_contains(f.set_input(1, &[1.0]), "index out of range");
        assert_err_contains(f.call(&[Expr::symbol("m", 2, 1)]), "call");
    }

    #[test]
    fn check_finite_reports_nan() {
        let x = Expr::scalar_symbol("x");
        let mut f = Function::with_options(
            vec![x.clone().into()],
            vec![x.sqrt().into()],
            FunctionOptions {
                check_finite: true,
                ..FunctionOptions::named("root")
            },
        )
        .unwrap();
        assert!(f.eval(&[&[4.0]]).is_ok());
        assert_err_contains(f.eval(&[&[-1.0]]), "numeric error");
    }

    #[test]
    fn matrix_product_agrees_with_elementwise_product_on_infinity() {
        let a = Expr::scalar_symbol("a");
        let b = Expr::scalar_symbol("b");
        let am = Expr::symbol("am", 1, 2);
        let bm = Expr::symbol("bm", 2, 1);
        let outputs = vec![a.mul(&b).unwrap().into(), am.mtimes(&bm).unwrap().into()];
        let inputs = vec![a.into(), b.into(), am.into(), bm.into()];
        let mut f = Function::new(inputs.clone(), outputs.clone()).unwrap();
        let inf = f64::INFINITY;
        let out = f.eval(&[&[0.0], &[inf], &[0.0, 1.0], &[inf, 1.0]]).unwrap();
        assert!(out[0][0].is_nan());
        assert!(out[1][0].is_nan());

        let direct = nalgebra::DMatrix::from_row_slice(1, 2, &[0.0, 1.0])
            * nalgebra::DMatrix::from_column_slice(2, 1, &[inf, 1.0]);
        assert!(direct[(0, 0)].is_nan());

        let mut checked = Function::with_options(
            inputs,
            outputs,
            FunctionOptions {
                check_finite: true,
                ..FunctionOptions::named("products")
            },
        )
        .unwrap();
        assert_err_contains(
            checked.eval(&[&[1.0], &[2.0], &[0.0, 1.0], &[inf, 1.0]]),
            "numeric error",
        );
    }
}
