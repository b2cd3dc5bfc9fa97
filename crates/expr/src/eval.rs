use std::collections::{BTreeMap, HashMap};

use crate::expr::{mask, BinaryOp, CompareOp, Expr, ExprKind};
use crate::var::VariableId;

/// Mapping of variable identifiers to concrete values. Values are truncated to the width of the
/// variable when evaluated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VariableAssignments {
    assignments: BTreeMap<VariableId, u64>,
}

impl VariableAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, variable: VariableId) -> Option<u64> {
        self.assignments.get(&variable).copied()
    }

    pub fn insert(&mut self, variable: VariableId, value: u64) -> Option<u64> {
        self.assignments.insert(variable, value)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VariableId, u64)> + '_ {
        self.assignments.iter().map(|(&id, &value)| (id, value))
    }

    pub fn as_map(&self) -> &BTreeMap<VariableId, u64> {
        &self.assignments
    }
}

impl FromIterator<(VariableId, u64)> for VariableAssignments {
    fn from_iter<T: IntoIterator<Item = (VariableId, u64)>>(iter: T) -> Self {
        Self {
            assignments: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<VariableId, u64>> for VariableAssignments {
    fn from(assignments: BTreeMap<VariableId, u64>) -> Self {
        Self { assignments }
    }
}

/// Evaluates expressions under fixed [VariableAssignments]. Results of shared subexpressions are
/// cached since the assignments cannot change for the lifetime of the evaluator.
#[derive(Clone, Debug, Default)]
pub struct Evaluator {
    assignments: VariableAssignments,

    // Holding the expression keeps the node alive so its address cannot be reused
    cache: HashMap<usize, (Expr, Option<u64>)>,
}

impl Evaluator {
    pub fn new(assignments: impl Into<VariableAssignments>) -> Self {
        Self {
            assignments: assignments.into(),
            cache: Default::default(),
        }
    }

    pub fn assignments(&self) -> &VariableAssignments {
        &self.assignments
    }

    /// Evaluate the expression. Returns `None` if the expression depends on a variable without
    /// an assignment.
    pub fn evaluate(&mut self, expr: &Expr) -> Option<u64> {
        let key = expr.node_key();
        if let Some((_, value)) = self.cache.get(&key) {
            return *value;
        }

        let value = self.evaluate_uncached(expr);
        self.cache.insert(key, (expr.clone(), value));
        value
    }

    /// Evaluate a boolean expression.
    pub fn evaluate_bool(&mut self, expr: &Expr) -> Option<bool> {
        self.evaluate(expr).map(|value| value != 0)
    }

    fn evaluate_uncached(&mut self, expr: &Expr) -> Option<u64> {
        let width = expr.width();
        let value = match expr.kind() {
            ExprKind::Constant { value, .. } => *value,
            ExprKind::Variable { id, .. } => self.assignments.get(*id)?,
            ExprKind::Not(inner) => !self.evaluate(inner)?,
            ExprKind::Binary { op, lhs, rhs } => {
                let x = self.evaluate(lhs)?;
                let y = self.evaluate(rhs)?;
                match op {
                    BinaryOp::And => x & y,
                    BinaryOp::Or => x | y,
                    BinaryOp::Xor => x ^ y,
                    BinaryOp::Add => x.wrapping_add(y),
                    BinaryOp::Sub => x.wrapping_sub(y),
                    BinaryOp::Mul => x.wrapping_mul(y),
                    BinaryOp::Shl | BinaryOp::LShr if y >= u64::from(width) => 0,
                    BinaryOp::Shl => x << y,
                    BinaryOp::LShr => x >> y,
                }
            }
            ExprKind::Compare { op, lhs, rhs } => {
                let x = self.evaluate(lhs)?;
                let y = self.evaluate(rhs)?;
                let result = match op {
                    CompareOp::Eq => x == y,
                    CompareOp::Ult => x < y,
                    CompareOp::Ule => x <= y,
                    CompareOp::Slt => {
                        let operand_width = lhs.width();
                        let shift = u64::BITS - operand_width;
                        ((x << shift) as i64 >> shift) < ((y << shift) as i64 >> shift)
                    }
                };
                result.into()
            }
            ExprKind::Ite {
                condition,
                then,
                otherwise,
            } => {
                // Only the selected arm needs an assignment
                if self.evaluate(condition)? != 0 {
                    self.evaluate(then)?
                } else {
                    self.evaluate(otherwise)?
                }
            }
            ExprKind::Extract { expr, offset, .. } => self.evaluate(expr)? >> offset,
            ExprKind::Concat { high, low } => {
                let low_width = low.width();
                (self.evaluate(high)? << low_width) | self.evaluate(low)?
            }
            ExprKind::ZeroExtend { expr, .. } => self.evaluate(expr)?,
        };

        Some(value & mask(width))
    }
}

impl From<VariableAssignments> for Evaluator {
    fn from(value: VariableAssignments) -> Self {
        Self::new(value)
    }
}
