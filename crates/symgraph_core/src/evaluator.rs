//! Numeric and generic tape evaluation of a flattened function.
//!
//! `run` is the allocation-free primal pass over the slot-assigned work buffer. The
//! `*_tape` functions keep one value per element and work for any [`Element`], which
//! gives forward sensitivities (`Dual`), adjoint sweeps, and symbolic expansion (`Expr`)
//! from the same rules.

use crate::algorithm::AlgEl;
use crate::error::{Error, Result};
use crate::function::FunctionDef;
use crate::kernels;
use crate::node::Op;
use crate::traits::Element;

/// Numeric buffers owned by one function instance, nested for every call element.
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    work: Vec<f64>,
    scratch: Vec<f64>,
    pub(crate) inputs: Vec<Vec<f64>>,
    children: Vec<Workspace>,
}

impl Workspace {
    pub(crate) fn new(def: &FunctionDef) -> Self {
        let alg = def.algorithm();
        let children = alg
            .elements()
            .iter()
            .filter_map(|el| match el.op() {
                Op::Call(callee) => Some(Workspace::new(callee)),
                _ => None,
            })
            .collect();
        Self {
            work: vec![0.0; alg.work_len()],
            scratch: vec![0.0; alg.max_numel()],
            inputs: (0..def.n_in())
                .map(|i| vec![0.0; def.port_shape_in(i).numel()])
                .collect(),
            children,
        }
    }
}

/// One primal pass over the bound inputs.
pub(crate) fn run(def: &FunctionDef, ws: &mut Workspace) {
    let alg = def.algorithm();
    let elements = alg.elements();
    let mut child = 0;
    for el in elements {
        let out = alg.slot_range(el.output);
        let n = out.len();
        match el.op() {
            Op::Symbol(_) => {
                if let Some(b) = el.binding {
                    ws.work[out].copy_from_slice(&ws.inputs[b.input][b.offset..b.offset + n]);
                }
            }
            Op::Constant(values) => ws.work[out].copy_from_slice(values),
            Op::Unary(op) => {
                let a = &ws.work[alg.slot_range(el.inputs[0])];
                kernels::unary(*op, a, &mut ws.scratch[..n]);
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
            Op::Binary(op) => {
                let a = &ws.work[alg.slot_range(el.inputs[0])];
                let b = &ws.work[alg.slot_range(el.inputs[1])];
                kernels::binary(*op, a, b, &mut ws.scratch[..n]);
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
            Op::MatMul => {
                let a = &ws.work[alg.slot_range(el.inputs[0])];
                let b = &ws.work[alg.slot_range(el.inputs[1])];
                let (sa, sb) = (elements[el.deps[0]].shape(), elements[el.deps[1]].shape());
                kernels::matmul(a, sa, b, sb, &mut ws.scratch[..n]);
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
            Op::Transpose => {
                let a = &ws.work[alg.slot_range(el.inputs[0])];
                kernels::transpose(a, elements[el.deps[0]].shape(), &mut ws.scratch[..n]);
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
            Op::Reshape | Op::Lift => {
                let src = alg.slot_range(el.inputs[0]);
                ws.work.copy_within(src, out.start);
            }
            Op::Output { offset, .. } => {
                let start = alg.slot_range(el.inputs[0]).start + offset;
                ws.work.copy_within(start..start + n, out.start);
            }
            Op::Slice { row, col } => {
                let a = &ws.work[alg.slot_range(el.inputs[0])];
                let sa = elements[el.deps[0]].shape();
                kernels::slice(a, sa, *row, *col, el.shape(), &mut ws.scratch[..n]);
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
            Op::Vertcat | Op::Horzcat => {
                let vertical = matches!(el.op(), Op::Vertcat);
                let so = el.shape();
                let mut offset = 0;
                for (&d, &slot) in el.deps.iter().zip(&el.inputs) {
                    let sp = elements[d].shape();
                    let part = &ws.work[alg.slot_range(slot)];
                    kernels::concat_part(vertical, part, sp, so, offset, &mut ws.scratch[..n]);
                    offset += if vertical { sp.rows } else { sp.cols };
                }
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
            Op::Call(callee) => {
                let sub = &mut ws.children[child];
                child += 1;
                for (i, &slot) in el.inputs.iter().enumerate() {
                    sub.inputs[i].copy_from_slice(&ws.work[alg.slot_range(slot)]);
                }
                run(callee, sub);
                let mut pos = 0;
                for o in 0..callee.n_out() {
                    let len = callee.port_shape_out(o).numel();
                    gather_output(callee, sub, o, &mut ws.scratch[pos..pos + len]);
                    pos += len;
                }
                ws.work[out].copy_from_slice(&ws.scratch[..n]);
            }
        }
    }
}

/// Copies output `o` out of the work buffer after [`run`].
pub(crate) fn gather_output(def: &FunctionDef, ws: &Workspace, o: usize, out: &mut [f64]) {
    let alg = def.algorithm();
    for part in def.output_parts(o) {
        let slot = alg.elements()[part.element].output;
        out[part.offset..part.offset + part.len].copy_from_slice(&ws.work[alg.slot_range(slot)]);
    }
}

/// Values of every element, computed over an arbitrary element type.
pub(crate) fn eval_tape<T: Element>(def: &FunctionDef, inputs: &[Vec<T>]) -> Result<Vec<Vec<T>>> {
    let elements = def.algorithm().elements();
    let mut tape: Vec<Vec<T>> = Vec::with_capacity(elements.len());
    for el in elements {
        let shape = el.shape();
        let n = shape.numel();
        let value = match el.op() {
            Op::Symbol(name) => match el.binding {
                Some(b) => inputs[b.input][b.offset..b.offset + n].to_vec(),
                None => T::symbolic(&el.node).ok_or_else(|| Error::UnboundSymbol(name.clone()))?,
            },
            Op::Constant(values) => values.iter().map(|&v| T::from_f64(v)).collect(),
            Op::Unary(op) => {
                let mut out = vec![T::zero(); n];
                kernels::unary(*op, &tape[el.deps[0]], &mut out);
                out
            }
            Op::Binary(op) => {
                let mut out = vec![T::zero(); n];
                kernels::binary(*op, &tape[el.deps[0]], &tape[el.deps[1]], &mut out);
                out
            }
            Op::MatMul => {
                let (a, b) = (el.deps[0], el.deps[1]);
                let mut out = vec![T::zero(); n];
                kernels::matmul(
                    &tape[a],
                    elements[a].shape(),
                    &tape[b],
                    elements[b].shape(),
                    &mut out,
                );
                out
            }
            Op::Transpose => {
                let a = el.deps[0];
                let mut out = vec![T::zero(); n];
                kernels::transpose(&tape[a], elements[a].shape(), &mut out);
                out
            }
            Op::Reshape | Op::Lift => tape[el.deps[0]].clone(),
            Op::Output { offset, .. } => tape[el.deps[0]][*offset..*offset + n].to_vec(),
            Op::Slice { row, col } => {
                let a = el.deps[0];
                let mut out = vec![T::zero(); n];
                kernels::slice(&tape[a], elements[a].shape(), *row, *col, shape, &mut out);
                out
            }
            Op::Vertcat | Op::Horzcat => {
                let vertical = matches!(el.op(), Op::Vertcat);
                let mut out = vec![T::zero(); n];
                let mut offset = 0;
                for &d in &el.deps {
                    let sp = elements[d].shape();
                    kernels::concat_part(vertical, &tape[d], sp, shape, offset, &mut out);
                    offset += if vertical { sp.rows } else { sp.cols };
                }
                out
            }
            Op::Call(callee) => {
                let args: Vec<Vec<T>> = el.deps.iter().map(|&d| tape[d].clone()).collect();
                let sub = eval_tape(callee, &args)?;
                tape_outputs(callee, &sub).concat()
            }
        };
        tape.push(value);
    }
    Ok(tape)
}

/// Per-output values assembled from a tape.
pub(crate) fn tape_outputs<T: Element>(def: &FunctionDef, tape: &[Vec<T>]) -> Vec<Vec<T>> {
    (0..def.n_out())
        .map(|o| {
            let mut out = vec![T::zero(); def.port_shape_out(o).numel()];
            for part in def.output_parts(o) {
                out[part.offset..part.offset + part.len].clone_from_slice(&tape[part.element]);
            }
            out
        })
        .collect()
}

fn accumulate<T: Element>(slot: &mut Option<Vec<T>>, len: usize, offset: usize, contrib: &[T]) {
    let acc = slot.get_or_insert_with(|| vec![T::zero(); len]);
    for (a, c) in acc[offset..].iter_mut().zip(contrib) {
        if !c.is_structural_zero() {
            *a = a.add(c);
        }
    }
}

/// Reverse sweep: sensitivities of `Σ seedᵀ·output` with respect to every input.
pub(crate) fn adjoint_tape<T: Element>(
    def: &FunctionDef,
    tape: &[Vec<T>],
    seeds: &[Vec<T>],
) -> Result<Vec<Vec<T>>> {
    let elements = def.algorithm().elements();
    let numel = |k: usize| elements[k].shape().numel();
    let mut adj: Vec<Option<Vec<T>>> = vec![None; elements.len()];
    for (o, seed) in seeds.iter().enumerate() {
        for part in def.output_parts(o) {
            let contrib = &seed[part.offset..part.offset + part.len];
            accumulate(&mut adj[part.element], part.len, 0, contrib);
        }
    }

    let mut sens: Vec<Vec<T>> = (0..def.n_in())
        .map(|i| vec![T::zero(); def.port_shape_in(i).numel()])
        .collect();

    for k in (0..elements.len()).rev() {
        let el: &AlgEl = &elements[k];
        let Some(g) = adj[k].take() else {
            continue;
        };
        if !el.variable || g.iter().all(Element::is_structural_zero) {
            continue;
        }
        let needs = |d: usize| elements[d].variable;
        match el.op() {
            Op::Symbol(_) => {
                if let Some(b) = el.binding {
                    let target = &mut sens[b.input][b.offset..b.offset + g.len()];
                    for (s, gk) in target.iter_mut().zip(&g) {
                        *s = s.add(gk);
                    }
                }
            }
            Op::Constant(_) => {}
            Op::Unary(op) => {
                let d = el.deps[0];
                let c = kernels::unary_adjoint(*op, &tape[d], &tape[k], &g);
                accumulate(&mut adj[d], numel(d), 0, &c);
            }
            Op::Binary(op) => {
                let (a, b) = (el.deps[0], el.deps[1]);
                let (da, db) = kernels::binary_adjoint(
                    *op,
                    &tape[a],
                    &tape[b],
                    &tape[k],
                    &g,
                    (needs(a), needs(b)),
                );
                if let Some(da) = da {
                    accumulate(&mut adj[a], numel(a), 0, &da);
                }
                if let Some(db) = db {
                    accumulate(&mut adj[b], numel(b), 0, &db);
                }
            }
            Op::MatMul => {
                let (a, b) = (el.deps[0], el.deps[1]);
                let (da, db) = kernels::matmul_adjoint(
                    &tape[a],
                    elements[a].shape(),
                    &tape[b],
                    elements[b].shape(),
                    &g,
                    (needs(a), needs(b)),
                );
                if let Some(da) = da {
                    accumulate(&mut adj[a], numel(a), 0, &da);
                }
                if let Some(db) = db {
                    accumulate(&mut adj[b], numel(b), 0, &db);
                }
            }
            Op::Transpose => {
                let d = el.deps[0];
                let mut c = vec![T::zero(); g.len()];
                kernels::transpose(&g, el.shape(), &mut c);
                accumulate(&mut adj[d], numel(d), 0, &c);
            }
            Op::Reshape | Op::Lift => {
                let d = el.deps[0];
                accumulate(&mut adj[d], numel(d), 0, &g);
            }
            Op::Output { offset, .. } => {
                let d = el.deps[0];
                accumulate(&mut adj[d], numel(d), *offset, &g);
            }
            Op::Slice { row, col } => {
                let d = el.deps[0];
                let c = kernels::slice_adjoint(elements[d].shape(), *row, *col, el.shape(), &g);
                accumulate(&mut adj[d], numel(d), 0, &c);
            }
            Op::Vertcat | Op::Horzcat => {
                let vertical = matches!(el.op(), Op::Vertcat);
                let mut offset = 0;
                for &d in &el.deps {
                    let sp = elements[d].shape();
                    if needs(d) {
                        let c = kernels::concat_extract(vertical, &g, el.shape(), sp, offset);
                        accumulate(&mut adj[d], numel(d), 0, &c);
                    }
                    offset += if vertical { sp.rows } else { sp.cols };
                }
            }
            Op::Call(callee) => {
                let args: Vec<Vec<T>> = el.deps.iter().map(|&d| tape[d].clone()).collect();
                let sub = eval_tape(callee, &args)?;
                let mut seeds = Vec::with_capacity(callee.n_out());
                let mut pos = 0;
                for o in 0..callee.n_out() {
                    let len = callee.port_shape_out(o).numel();
                    seeds.push(g[pos..pos + len].to_vec());
                    pos += len;
                }
                let sub_sens = adjoint_tape(callee, &sub, &seeds)?;
                for (i, &d) in el.deps.iter().enumerate() {
                    if needs(d) {
                        accumulate(&mut adj[d], numel(d), 0, &sub_sens[i]);
                    }
                }
            }
        }
    }
    Ok(sens)
}
