//! Immutable expression nodes and the shared handle that owns them.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::function::FunctionDef;
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Square,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Square => "sq",
        }
    }
}

/// Element-wise binary operations. A `1x1` operand broadcasts against the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Fmin,
    Fmax,
    LessEq,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Fmin => "fmin",
            BinaryOp::Fmax => "fmax",
            BinaryOp::LessEq => "le",
        }
    }

    fn infix(self) -> Option<&'static str> {
        match self {
            BinaryOp::Add => Some("+"),
            BinaryOp::Sub => Some("-"),
            BinaryOp::Mul => Some("*"),
            BinaryOp::Div => Some("/"),
            BinaryOp::LessEq => Some("<="),
            _ => None,
        }
    }
}

/// Operation tag of a node. Operands live in the node's dependency list.
#[derive(Debug, Clone)]
pub enum Op {
    Symbol(String),
    /// Column-major values with the node's shape.
    Constant(Arc<[f64]>),
    Unary(UnaryOp),
    Binary(BinaryOp),
    MatMul,
    Transpose,
    /// Same column-major data, new shape.
    Reshape,
    /// Contiguous block starting at `(row, col)`; extent is the node's shape.
    Slice { row: usize, col: usize },
    Vertcat,
    Horzcat,
    /// Value is the column-packed concatenation of every callee output.
    Call(Arc<FunctionDef>),
    /// Output `index` of the call node it depends on, starting at `offset` in the packed value.
    Output { index: usize, offset: usize },
    /// Identity marker flagging a sub-expression as a candidate lifted variable.
    Lift,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Symbol(_) => "symbol",
            Op::Constant(_) => "constant",
            Op::Unary(op) => op.name(),
            Op::Binary(op) => op.name(),
            Op::MatMul => "mtimes",
            Op::Transpose => "transpose",
            Op::Reshape => "reshape",
            Op::Slice { .. } => "slice",
            Op::Vertcat => "vertcat",
            Op::Horzcat => "horzcat",
            Op::Call(_) => "call",
            Op::Output { .. } => "output",
            Op::Lift => "lift",
        }
    }
}

pub struct Node {
    pub(crate) op: Op,
    pub(crate) deps: Vec<Expr>,
    pub(crate) shape: Shape,
}

impl Drop for Node {
    fn drop(&mut self) {
        // Unlink uniquely owned operands onto an explicit stack so long chains do not
        // overflow the call stack.
        let mut stack = std::mem::take(&mut self.deps);
        while let Some(expr) = stack.pop() {
            if let Some(mut node) = Arc::into_inner(expr.node) {
                stack.append(&mut node.deps);
            }
        }
    }
}

/// Stable identity of a node while some handle keeps it alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Shared handle to an immutable node. Cloning is cheap; equality is identity.
#[derive(Clone)]
pub struct Expr {
    pub(crate) node: Arc<Node>,
}

impl Expr {
    pub(crate) fn from_parts(op: Op, deps: Vec<Expr>, shape: Shape) -> Self {
        Self {
            node: Arc::new(Node { op, deps, shape }),
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId(Arc::as_ptr(&self.node) as usize)
    }

    pub fn op(&self) -> &Op {
        &self.node.op
    }

    pub fn deps(&self) -> &[Expr] {
        &self.node.deps
    }

    pub fn shape(&self) -> Shape {
        self.node.shape
    }

    pub fn rows(&self) -> usize {
        self.node.shape.rows
    }

    pub fn cols(&self) -> usize {
        self.node.shape.cols
    }

    pub fn numel(&self) -> usize {
        self.node.shape.numel()
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self.node.op, Op::Symbol(_))
    }

    pub fn name(&self) -> Option<&str> {
        match &self.node.op {
            Op::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.node.op, Op::Constant(_))
    }

    pub fn constant_values(&self) -> Option<&[f64]> {
        match &self.node.op {
            Op::Constant(values) => Some(values),
            _ => None,
        }
    }

    /// Structurally zero: a constant whose entries are all `0`.
    pub fn is_zero(&self) -> bool {
        self.constant_values()
            .is_some_and(|values| values.iter().all(|&v| v == 0.0))
    }

    pub fn is_one(&self) -> bool {
        self.constant_values()
            .is_some_and(|values| values.iter().all(|&v| v == 1.0))
    }

    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Number of distinct nodes reachable from `self`, including `self`.
    pub fn count_nodes(&self) -> usize {
        topological_order(std::slice::from_ref(self)).len()
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Distinct nodes reachable from `roots`, operands before consumers.
///
/// Iterative post-order DFS; every node appears exactly once.
pub(crate) fn topological_order(roots: &[Expr]) -> Vec<Expr> {
    pending_order(roots, |_| false)
}

/// [`topological_order`] restricted to nodes for which `done` is false; the walk does
/// not descend below a done node.
pub(crate) fn pending_order(roots: &[Expr], done: impl Fn(NodeId) -> bool) -> Vec<Expr> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Expr, bool)> = Vec::new();
    let skip = |visited: &HashSet<NodeId>, id: NodeId| visited.contains(&id) || done(id);
    for root in roots {
        if skip(&visited, root.id()) {
            continue;
        }
        stack.push((root.clone(), false));
        while let Some((expr, expanded)) = stack.pop() {
            if expanded {
                if visited.insert(expr.id()) {
                    order.push(expr);
                }
                continue;
            }
            if skip(&visited, expr.id()) {
                continue;
            }
            stack.push((expr.clone(), true));
            for dep in expr.deps().iter().rev() {
                if !skip(&visited, dep.id()) {
                    stack.push((dep.clone(), false));
                }
            }
        }
    }
    order
}

const DISPLAY_DEPTH: usize = 8;

fn write_expr(f: &mut fmt::Formatter<'_>, expr: &Expr, depth: usize) -> fmt::Result {
    if depth == 0 {
        return write!(f, "...");
    }
    let deps = expr.deps();
    let next = depth - 1;
    match expr.op() {
        Op::Symbol(name) => write!(f, "{name}"),
        Op::Constant(values) => {
            if values.len() == 1 {
                write!(f, "{}", values[0])
            } else if expr.is_zero() {
                write!(f, "zeros({})", expr.shape())
            } else {
                write!(f, "const({})", expr.shape())
            }
        }
        Op::Unary(UnaryOp::Neg) => {
            write!(f, "(-")?;
            write_expr(f, &deps[0], next)?;
            write!(f, ")")
        }
        Op::Unary(op) => {
            write!(f, "{}(", op.name())?;
            write_expr(f, &deps[0], next)?;
            write!(f, ")")
        }
        Op::Binary(op) => match op.infix() {
            Some(symbol) => {
                write!(f, "(")?;
                write_expr(f, &deps[0], next)?;
                write!(f, "{symbol}")?;
                write_expr(f, &deps[1], next)?;
                write!(f, ")")
            }
            None => {
                write!(f, "{}(", op.name())?;
                write_expr(f, &deps[0], next)?;
                write!(f, ",")?;
                write_expr(f, &deps[1], next)?;
                write!(f, ")")
            }
        },
        Op::Transpose => {
            write_expr(f, &deps[0], next)?;
            write!(f, "'")
        }
        Op::Slice { row, col } => {
            let shape = expr.shape();
            write_expr(f, &deps[0], next)?;
            write!(
                f,
                "[{}:{},{}:{}]",
                row,
                row + shape.rows,
                col,
                col + shape.cols
            )
        }
        Op::Call(def) => {
            write!(f, "{}(", def.name())?;
            for (k, dep) in deps.iter().enumerate() {
                if k > 0 {
                    write!(f, ",")?;
                }
                write_expr(f, dep, next)?;
            }
            write!(f, ")")
        }
        Op::Output { index, .. } => {
            write_expr(f, &deps[0], next)?;
            write!(f, "{{{index}}}")
        }
        op => {
            write!(f, "{}(", op.name())?;
            for (k, dep) in deps.iter().enumerate() {
                if k > 0 {
                    write!(f, ",")?;
                }
                write_expr(f, dep, next)?;
            }
            write!(f, ")")
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self, DISPLAY_DEPTH)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr<{}>(", self.shape())?;
        write_expr(f, self, DISPLAY_DEPTH)?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_equality_and_sharing() {
        let x = Expr::symbol("x", 1, 1);
        let y = Expr::symbol("x", 1, 1);
        assert_ne!(x, y);
        let z = x.clone();
        assert_eq!(x, z);

        let s = x.exp().mul(&x.exp()).expect("scalar mul");
        // x, two distinct exp nodes, and the product.
        assert_eq!(s.count_nodes(), 4);

        let e = x.exp();
        let shared = e.mul(&e).expect("scalar mul");
        assert_eq!(shared.count_nodes(), 3);
    }

    #[test]
    fn topological_order_lists_operands_first() {
        let x = Expr::symbol("x", 1, 1);
        let y = Expr::symbol("y", 1, 1);
        let s = x.add(&y).expect("add");
        let t = s.mul(&x).expect("mul");
        let order = topological_order(&[t.clone()]);
        let position = |e: &Expr| order.iter().position(|o| o == e).expect("present");
        assert!(position(&x) < position(&s));
        assert!(position(&y) < position(&s));
        assert!(position(&s) < position(&t));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn dropping_a_long_chain_does_not_recurse() {
        let x = Expr::symbol("x", 1, 1);
        let mut e = x.clone();
        for _ in 0..200_000 {
            e = e.sin();
        }
        assert_eq!(e.shape(), Shape::scalar());
        drop(e);
    }

    #[test]
    fn display_is_readable() {
        let x = Expr::symbol("x", 1, 1);
        let e = x.mul(&Expr::constant(2.0)).expect("mul").exp();
        assert_eq!(format!("{e}"), "exp((x*2))");
    }
}
