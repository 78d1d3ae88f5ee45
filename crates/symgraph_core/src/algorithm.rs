//! Flattening of an expression DAG into an ordered tape of primitive elements with
//! assigned work slots.

use std::collections::HashMap;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::node::{topological_order, Expr, NodeId, Op};
use crate::shape::Shape;

/// Where a symbol element reads its value from: input port `input`, starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub input: usize,
    pub offset: usize,
}

/// One primitive operation of the tape.
#[derive(Debug, Clone)]
pub struct AlgEl {
    pub(crate) node: Expr,
    pub(crate) deps: Vec<usize>,
    pub(crate) inputs: Vec<usize>,
    pub(crate) output: usize,
    pub(crate) binding: Option<Binding>,
    /// Depends on at least one bound input.
    pub(crate) variable: bool,
}

impl AlgEl {
    pub fn op(&self) -> &Op {
        self.node.op()
    }

    pub fn node(&self) -> &Expr {
        &self.node
    }

    pub fn shape(&self) -> Shape {
        self.node.shape()
    }

    /// Operand element indices.
    pub fn deps(&self) -> &[usize] {
        &self.deps
    }

    /// Operand work slots.
    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    /// Output work slot.
    pub fn output(&self) -> usize {
        self.output
    }

    pub fn binding(&self) -> Option<Binding> {
        self.binding
    }
}

#[derive(Debug, Clone)]
pub struct Algorithm {
    elements: Vec<AlgEl>,
    slot_offsets: Vec<usize>,
    live_variables: bool,
    max_numel: usize,
}

impl Algorithm {
    /// Flattens everything reachable from `roots`.
    ///
    /// Symbols must appear in `bindings` unless `allow_free` is set, in which case unbound
    /// symbols stay as free leaves (only symbolic evaluation can handle those). Returns the
    /// algorithm and the element index of every visited node.
    pub(crate) fn build(
        roots: &[Expr],
        bindings: &HashMap<NodeId, Binding>,
        allow_free: bool,
        live_variables: bool,
    ) -> Result<(Algorithm, HashMap<NodeId, usize>)> {
        let order = topological_order(roots);
        let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(order.len());
        let mut elements: Vec<AlgEl> = Vec::with_capacity(order.len());

        for node in order {
            let deps: Vec<usize> = node.deps().iter().map(|d| index[&d.id()]).collect();
            let binding = match node.op() {
                Op::Symbol(name) => match bindings.get(&node.id()) {
                    Some(binding) => Some(*binding),
                    None if allow_free => None,
                    None => return Err(Error::UnboundSymbol(name.clone())),
                },
                _ => None,
            };
            let variable = binding.is_some() || deps.iter().any(|&d| elements[d].variable);
            index.insert(node.id(), elements.len());
            elements.push(AlgEl {
                node,
                deps,
                inputs: Vec::new(),
                output: 0,
                binding,
                variable,
            });
        }

        let mut pinned = vec![false; elements.len()];
        for root in roots {
            pinned[index[&root.id()]] = true;
        }
        for (k, el) in elements.iter().enumerate() {
            if el.node.is_symbol() {
                pinned[k] = true;
            }
        }

        let slot_sizes = if live_variables {
            assign_live_slots(&mut elements, &pinned)
        } else {
            elements
                .iter_mut()
                .enumerate()
                .map(|(k, el)| {
                    el.output = k;
                    el.shape().numel()
                })
                .collect()
        };

        for k in 0..elements.len() {
            let inputs: Vec<usize> = elements[k]
                .deps
                .iter()
                .map(|&d| elements[d].output)
                .collect();
            elements[k].inputs = inputs;
        }

        let mut slot_offsets = Vec::with_capacity(slot_sizes.len() + 1);
        let mut offset = 0;
        slot_offsets.push(0);
        for size in &slot_sizes {
            offset += size;
            slot_offsets.push(offset);
        }
        let max_numel = elements
            .iter()
            .map(|el| el.shape().numel())
            .max()
            .unwrap_or(0);

        Ok((
            Algorithm {
                elements,
                slot_offsets,
                live_variables,
                max_numel,
            },
            index,
        ))
    }

    pub fn elements(&self) -> &[AlgEl] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of work slots.
    pub fn work_size(&self) -> usize {
        self.slot_offsets.len() - 1
    }

    /// Total length of the numeric work buffer.
    pub fn work_len(&self) -> usize {
        self.slot_offsets.last().copied().unwrap_or(0)
    }

    pub fn slot_range(&self, slot: usize) -> Range<usize> {
        self.slot_offsets[slot]..self.slot_offsets[slot + 1]
    }

    pub fn live_variables(&self) -> bool {
        self.live_variables
    }

    /// Largest value computed by any single element.
    pub fn max_numel(&self) -> usize {
        self.max_numel
    }
}

/// Reuses the slot of a value once its last consumer has been scheduled. Slots are only
/// shared between values of equal size; pinned elements keep their slot for the whole pass.
fn assign_live_slots(elements: &mut [AlgEl], pinned: &[bool]) -> Vec<usize> {
    let mut last_use: Vec<Option<usize>> = vec![None; elements.len()];
    for (k, el) in elements.iter().enumerate() {
        for &d in &el.deps {
            last_use[d] = Some(k);
        }
    }

    let mut slot_sizes: Vec<usize> = Vec::new();
    let mut free: HashMap<usize, Vec<usize>> = HashMap::new();
    for k in 0..elements.len() {
        let numel = elements[k].shape().numel();
        let slot = match free.get_mut(&numel).and_then(Vec::pop) {
            Some(slot) => slot,
            None => {
                slot_sizes.push(numel);
                slot_sizes.len() - 1
            }
        };
        elements[k].output = slot;

        for j in 0..elements[k].deps.len() {
            let d = elements[k].deps[j];
            if elements[k].deps[..j].contains(&d) {
                continue;
            }
            if !pinned[d] && last_use[d] == Some(k) {
                free.entry(elements[d].shape().numel())
                    .or_default()
                    .push(elements[d].output);
            }
        }
    }
    slot_sizes
}
