use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimensions of a node value. Values are stored dense and column-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub const fn scalar() -> Self {
        Self { rows: 1, cols: 1 }
    }

    pub const fn column(rows: usize) -> Self {
        Self { rows, cols: 1 }
    }

    pub const fn numel(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_scalar(&self) -> bool {
        self.rows == 1 && self.cols == 1
    }

    /// No entries at all (e.g. `0x1` or `0x0`).
    pub const fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub const fn transposed(&self) -> Self {
        Self {
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Column-major linear index.
    pub const fn index(&self, row: usize, col: usize) -> usize {
        row + col * self.rows
    }

    /// Result shape of an element-wise operation; a scalar operand broadcasts.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        if self == other {
            Some(*self)
        } else if self.is_scalar() {
            Some(*other)
        } else if other.is_scalar() {
            Some(*self)
        } else {
            None
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}
