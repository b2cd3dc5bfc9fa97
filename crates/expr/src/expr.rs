use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::var::VariableId;

/// Width of an expression in bits. Valid widths are `1..=64`.
pub type Width = u32;

/// Maximum supported expression width.
pub const MAX_WIDTH: Width = u64::BITS;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcretizationError {
    #[error("expression is not a constant: {0}")]
    NonConstant(Expr),

    #[error("constant {value:#x} does not fit in {max_bits} bits")]
    Overflow { value: u64, max_bits: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Xor,
    Add,
    Sub,
    Mul,
    Shl,
    LShr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ult,
    Ule,
    Slt,
}

/// The node of an expression tree. Nodes should be constructed through the [Expr] constructors,
/// which have the opportunity to fold constants where a direct construction does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExprKind {
    Constant {
        value: u64,
        width: Width,
    },
    Variable {
        id: VariableId,
        width: Width,
    },
    Not(Expr),
    Binary {
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
    },
    Compare {
        op: CompareOp,
        lhs: Expr,
        rhs: Expr,
    },
    Ite {
        condition: Expr,
        then: Expr,
        otherwise: Expr,
    },
    Extract {
        expr: Expr,
        offset: Width,
        width: Width,
    },
    Concat {
        high: Expr,
        low: Expr,
    },
    ZeroExtend {
        expr: Expr,
        width: Width,
    },
}

/// A shared, immutable expression. Cloning is cheap. Boolean expressions are expressions of
/// width 1.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expr(Arc<ExprKind>);

pub(crate) const fn mask(width: Width) -> u64 {
    if width >= MAX_WIDTH {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn sign_extend(value: u64, width: Width) -> i64 {
    if width >= MAX_WIDTH {
        return value as i64;
    }

    let shift = MAX_WIDTH - width;
    ((value << shift) as i64) >> shift
}

impl Expr {
    fn new(kind: ExprKind) -> Self {
        Self(Arc::new(kind))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0
    }

    pub fn constant(value: u64, width: Width) -> Self {
        assert!(
            width > 0 && width <= MAX_WIDTH,
            "invalid expression width {width}"
        );
        Self::new(ExprKind::Constant {
            value: value & mask(width),
            width,
        })
    }

    pub fn bool(value: bool) -> Self {
        Self::constant(value.into(), 1)
    }

    pub fn variable(id: VariableId, width: Width) -> Self {
        assert!(
            width > 0 && width <= MAX_WIDTH,
            "invalid expression width {width}"
        );
        Self::new(ExprKind::Variable { id, width })
    }

    pub fn width(&self) -> Width {
        match self.kind() {
            ExprKind::Constant { width, .. }
            | ExprKind::Variable { width, .. }
            | ExprKind::Extract { width, .. }
            | ExprKind::ZeroExtend { width, .. } => *width,
            ExprKind::Not(expr) => expr.width(),
            ExprKind::Binary { lhs, .. } => lhs.width(),
            ExprKind::Compare { .. } => 1,
            ExprKind::Ite { then, .. } => then.width(),
            ExprKind::Concat { high, low } => high.width() + low.width(),
        }
    }

    pub fn as_constant(&self) -> Option<u64> {
        match self.kind() {
            ExprKind::Constant { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.as_constant().is_some()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind() {
            ExprKind::Constant { value, width: 1 } => Some(*value != 0),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_bool() == Some(true)
    }

    pub fn is_false(&self) -> bool {
        self.as_bool() == Some(false)
    }

    pub fn as_variable(&self) -> Option<(VariableId, Width)> {
        match self.kind() {
            ExprKind::Variable { id, width } => Some((*id, *width)),
            _ => None,
        }
    }

    fn is_all_ones(&self) -> bool {
        self.as_constant() == Some(mask(self.width()))
    }

    fn is_zero(&self) -> bool {
        self.as_constant() == Some(0)
    }

    pub fn not(self) -> Self {
        let simplified = match self.kind() {
            ExprKind::Constant { value, width } => Some(Self::constant(!value, *width)),
            ExprKind::Not(inner) => Some(inner.clone()),
            _ => None,
        };

        simplified.unwrap_or_else(|| Self::new(ExprKind::Not(self)))
    }

    pub fn binary(op: BinaryOp, lhs: Self, rhs: Self) -> Self {
        debug_assert_eq!(
            lhs.width(),
            rhs.width(),
            "mismatched operand widths for {op:?}"
        );
        let width = lhs.width();

        if let (Some(x), Some(y)) = (lhs.as_constant(), rhs.as_constant()) {
            let value = match op {
                BinaryOp::And => x & y,
                BinaryOp::Or => x | y,
                BinaryOp::Xor => x ^ y,
                BinaryOp::Add => x.wrapping_add(y),
                BinaryOp::Sub => x.wrapping_sub(y),
                BinaryOp::Mul => x.wrapping_mul(y),
                BinaryOp::Shl if y >= u64::from(width) => 0,
                BinaryOp::Shl => x << y,
                BinaryOp::LShr if y >= u64::from(width) => 0,
                BinaryOp::LShr => x >> y,
            };
            return Self::constant(value, width);
        }

        match op {
            BinaryOp::And => {
                if lhs.is_zero() || rhs.is_all_ones() || lhs == rhs {
                    return lhs;
                }
                if rhs.is_zero() || lhs.is_all_ones() {
                    return rhs;
                }
                if lhs == rhs.clone().not() {
                    return Self::constant(0, width);
                }
            }
            BinaryOp::Or => {
                if lhs.is_all_ones() || rhs.is_zero() || lhs == rhs {
                    return lhs;
                }
                if rhs.is_all_ones() || lhs.is_zero() {
                    return rhs;
                }
                if lhs == rhs.clone().not() {
                    return Self::constant(mask(width), width);
                }
            }
            BinaryOp::Xor => {
                if rhs.is_zero() {
                    return lhs;
                }
                if lhs.is_zero() {
                    return rhs;
                }
                if lhs == rhs {
                    return Self::constant(0, width);
                }
            }
            BinaryOp::Add => {
                if rhs.is_zero() {
                    return lhs;
                }
                if lhs.is_zero() {
                    return rhs;
                }
            }
            BinaryOp::Sub => {
                if rhs.is_zero() {
                    return lhs;
                }
                if lhs == rhs {
                    return Self::constant(0, width);
                }
            }
            BinaryOp::Mul => {
                if lhs.is_zero() || rhs.as_constant() == Some(1) {
                    return lhs;
                }
                if rhs.is_zero() || lhs.as_constant() == Some(1) {
                    return rhs;
                }
            }
            BinaryOp::Shl | BinaryOp::LShr => {
                if rhs.is_zero() {
                    return lhs;
                }
            }
        }

        Self::new(ExprKind::Binary { op, lhs, rhs })
    }

    pub fn and(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::And, self, rhs)
    }

    pub fn or(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Or, self, rhs)
    }

    pub fn xor(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Xor, self, rhs)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Add, self, rhs)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Sub, self, rhs)
    }

    pub fn mul(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Mul, self, rhs)
    }

    pub fn shl(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Shl, self, rhs)
    }

    pub fn lshr(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::LShr, self, rhs)
    }

    pub fn compare(op: CompareOp, lhs: Self, rhs: Self) -> Self {
        debug_assert_eq!(
            lhs.width(),
            rhs.width(),
            "mismatched operand widths for {op:?}"
        );
        let width = lhs.width();

        if let (Some(x), Some(y)) = (lhs.as_constant(), rhs.as_constant()) {
            let result = match op {
                CompareOp::Eq => x == y,
                CompareOp::Ult => x < y,
                CompareOp::Ule => x <= y,
                CompareOp::Slt => sign_extend(x, width) < sign_extend(y, width),
            };
            return Self::bool(result);
        }

        match op {
            CompareOp::Eq | CompareOp::Ule if lhs == rhs => return Self::bool(true),
            CompareOp::Ult | CompareOp::Slt if lhs == rhs => return Self::bool(false),
            CompareOp::Eq if width == 1 => {
                // Boolean equality against a literal collapses to the other operand
                match (lhs.as_bool(), rhs.as_bool()) {
                    (Some(true), _) => return rhs,
                    (Some(false), _) => return rhs.not(),
                    (_, Some(true)) => return lhs,
                    (_, Some(false)) => return lhs.not(),
                    _ => (),
                }
            }
            _ => (),
        }

        Self::new(ExprKind::Compare { op, lhs, rhs })
    }

    pub fn equals(self, rhs: Self) -> Self {
        Self::compare(CompareOp::Eq, self, rhs)
    }

    pub fn not_equals(self, rhs: Self) -> Self {
        Self::compare(CompareOp::Eq, self, rhs).not()
    }

    pub fn unsigned_less_than(self, rhs: Self) -> Self {
        Self::compare(CompareOp::Ult, self, rhs)
    }

    pub fn unsigned_less_than_or_equal(self, rhs: Self) -> Self {
        Self::compare(CompareOp::Ule, self, rhs)
    }

    pub fn signed_less_than(self, rhs: Self) -> Self {
        Self::compare(CompareOp::Slt, self, rhs)
    }

    /// If-then-else. The condition must be a boolean expression and both arms must have the same
    /// width.
    pub fn ite(condition: Self, then: Self, otherwise: Self) -> Self {
        debug_assert_eq!(condition.width(), 1, "ite condition must be boolean");
        debug_assert_eq!(then.width(), otherwise.width(), "mismatched ite arms");

        match condition.as_bool() {
            Some(true) => return then,
            Some(false) => return otherwise,
            None => (),
        }

        if then == otherwise {
            return then;
        }

        if then.width() == 1 {
            match (then.as_bool(), otherwise.as_bool()) {
                (Some(true), Some(false)) => return condition,
                (Some(false), Some(true)) => return condition.not(),
                _ => (),
            }
        }

        Self::new(ExprKind::Ite {
            condition,
            then,
            otherwise,
        })
    }

    /// Extract `width` bits starting at bit `offset` (least significant bit is 0).
    pub fn extract(self, offset: Width, width: Width) -> Self {
        let source_width = self.width();
        assert!(
            width > 0 && offset + width <= source_width,
            "extract [{offset}, {end}) out of range for width {source_width}",
            end = offset + width
        );

        if offset == 0 && width == source_width {
            return self;
        }

        let simplified = match self.kind() {
            ExprKind::Constant { value, .. } => Some(Self::constant(value >> offset, width)),
            ExprKind::Extract {
                expr,
                offset: inner_offset,
                ..
            } => Some(expr.clone().extract(inner_offset + offset, width)),
            ExprKind::Concat { high, low } => {
                let low_width = low.width();
                if offset + width <= low_width {
                    Some(low.clone().extract(offset, width))
                } else if offset >= low_width {
                    Some(high.clone().extract(offset - low_width, width))
                } else {
                    None
                }
            }
            ExprKind::ZeroExtend { expr, .. } => {
                let inner_width = expr.width();
                if offset + width <= inner_width {
                    Some(expr.clone().extract(offset, width))
                } else if offset >= inner_width {
                    Some(Self::constant(0, width))
                } else {
                    None
                }
            }
            _ => None,
        };

        simplified.unwrap_or_else(|| {
            Self::new(ExprKind::Extract {
                expr: self,
                offset,
                width,
            })
        })
    }

    /// Concatenate `high` above `low`.
    pub fn concat(high: Self, low: Self) -> Self {
        let low_width = low.width();
        let width = high.width() + low_width;
        assert!(width <= MAX_WIDTH, "concatenation exceeds {MAX_WIDTH} bits");

        if let (Some(h), Some(l)) = (high.as_constant(), low.as_constant()) {
            return Self::constant((h << low_width) | l, width);
        }

        // Adjacent slices of the same expression merge back into a single slice
        if let (
            ExprKind::Extract {
                expr: high_expr,
                offset: high_offset,
                width: high_width,
            },
            ExprKind::Extract {
                expr: low_expr,
                offset: low_offset,
                ..
            },
        ) = (high.kind(), low.kind())
        {
            if high_expr == low_expr && *high_offset == low_offset + low_width {
                return high_expr.clone().extract(*low_offset, high_width + low_width);
            }
        }

        if let ExprKind::Extract {
            expr: high_expr,
            offset: high_offset,
            width: high_width,
        } = high.kind()
        {
            if *high_expr == low && *high_offset == low_width {
                return high_expr.clone().extract(0, high_width + low_width);
            }
        }

        if high.is_zero() {
            return low.zero_extend(width);
        }

        Self::new(ExprKind::Concat { high, low })
    }

    pub fn zero_extend(self, width: Width) -> Self {
        let source_width = self.width();
        assert!(
            width >= source_width && width <= MAX_WIDTH,
            "cannot zero extend width {source_width} to {width}"
        );

        if width == source_width {
            return self;
        }

        if let Some(value) = self.as_constant() {
            return Self::constant(value, width);
        }

        Self::new(ExprKind::ZeroExtend { expr: self, width })
    }

    /// Truncate or zero extend to the requested width.
    pub fn resize(self, width: Width) -> Self {
        match self.width().cmp(&width) {
            std::cmp::Ordering::Less => self.zero_extend(width),
            std::cmp::Ordering::Equal => self,
            std::cmp::Ordering::Greater => self.extract(0, width),
        }
    }

    /// Conjunction of boolean expressions. The empty conjunction is `true`.
    pub fn all(exprs: impl IntoIterator<Item = Self>) -> Self {
        exprs
            .into_iter()
            .fold(Self::bool(true), |acc, expr| acc.and(expr))
    }

    /// Disjunction of boolean expressions. The empty disjunction is `false`.
    pub fn any(exprs: impl IntoIterator<Item = Self>) -> Self {
        exprs
            .into_iter()
            .fold(Self::bool(false), |acc, expr| acc.or(expr))
    }

    fn children(&self) -> Vec<&Expr> {
        match self.kind() {
            ExprKind::Constant { .. } | ExprKind::Variable { .. } => Vec::new(),
            ExprKind::Not(expr)
            | ExprKind::Extract { expr, .. }
            | ExprKind::ZeroExtend { expr, .. } => vec![expr],
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Compare { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            ExprKind::Ite {
                condition,
                then,
                otherwise,
            } => vec![condition, then, otherwise],
            ExprKind::Concat { high, low } => vec![high, low],
        }
    }

    pub(crate) fn node_key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Number of distinct nodes reachable from this expression. Shared subexpressions are
    /// counted once.
    pub fn node_count(&self) -> usize {
        let mut visited = HashSet::new();
        let mut pending = vec![self];
        while let Some(expr) = pending.pop() {
            if visited.insert(expr.node_key()) {
                pending.extend(expr.children());
            }
        }

        visited.len()
    }

    /// All variables referenced by this expression along with their widths.
    pub fn variables(&self) -> BTreeMap<VariableId, Width> {
        let mut variables = BTreeMap::new();
        self.collect_variables(&mut variables);
        variables
    }

    pub(crate) fn collect_variables(&self, variables: &mut BTreeMap<VariableId, Width>) {
        let mut visited = HashSet::new();
        let mut pending = vec![self];
        while let Some(expr) = pending.pop() {
            if !visited.insert(expr.node_key()) {
                continue;
            }

            if let ExprKind::Variable { id, width } = expr.kind() {
                variables.insert(*id, *width);
            }
            pending.extend(expr.children());
        }
    }

    pub fn is_symbolic(&self) -> bool {
        !self.is_constant()
    }

    /// Replace each variable found in `values` with the associated constant and re-fold.
    pub fn substitute(&self, values: &BTreeMap<VariableId, u64>) -> Self {
        let mut memo = HashMap::new();
        self.substitute_memo(values, &mut memo)
    }

    fn substitute_memo(
        &self,
        values: &BTreeMap<VariableId, u64>,
        memo: &mut HashMap<usize, Expr>,
    ) -> Self {
        if let Some(result) = memo.get(&self.node_key()) {
            return result.clone();
        }

        let mut recurse = |expr: &Expr| expr.substitute_memo(values, memo);
        let result = match self.kind() {
            ExprKind::Constant { .. } => self.clone(),
            ExprKind::Variable { id, width } => match values.get(id) {
                Some(&value) => Self::constant(value, *width),
                None => self.clone(),
            },
            ExprKind::Not(expr) => recurse(expr).not(),
            ExprKind::Binary { op, lhs, rhs } => Self::binary(*op, recurse(lhs), recurse(rhs)),
            ExprKind::Compare { op, lhs, rhs } => Self::compare(*op, recurse(lhs), recurse(rhs)),
            ExprKind::Ite {
                condition,
                then,
                otherwise,
            } => Self::ite(recurse(condition), recurse(then), recurse(otherwise)),
            ExprKind::Extract {
                expr,
                offset,
                width,
            } => recurse(expr).extract(*offset, *width),
            ExprKind::Concat { high, low } => Self::concat(recurse(high), recurse(low)),
            ExprKind::ZeroExtend { expr, width } => recurse(expr).zero_extend(*width),
        };

        memo.insert(self.node_key(), result.clone());
        result
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Self::bool(value)
    }
}

impl From<u8> for Expr {
    fn from(value: u8) -> Self {
        Self::constant(value.into(), u8::BITS)
    }
}

impl From<u64> for Expr {
    fn from(value: u64) -> Self {
        Self::constant(value, u64::BITS)
    }
}

impl TryFrom<&Expr> for u64 {
    type Error = ConcretizationError;

    fn try_from(expr: &Expr) -> Result<Self, Self::Error> {
        expr.as_constant()
            .ok_or_else(|| ConcretizationError::NonConstant(expr.clone()))
    }
}

impl TryFrom<&Expr> for u8 {
    type Error = ConcretizationError;

    fn try_from(expr: &Expr) -> Result<Self, Self::Error> {
        let value = u64::try_from(expr)?;
        u8::try_from(value).map_err(|_| ConcretizationError::Overflow {
            value,
            max_bits: u8::BITS,
        })
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Constant { value, width: 1 } => write!(f, "{}", *value != 0),
            ExprKind::Constant { value, width } => write!(f, "{value:#x}:{width}"),
            ExprKind::Variable { id, width } => write!(f, "{id}:{width}"),
            ExprKind::Not(expr) => write!(f, "(not {expr})"),
            ExprKind::Binary { op, lhs, rhs } => {
                let name = match op {
                    BinaryOp::And => "and",
                    BinaryOp::Or => "or",
                    BinaryOp::Xor => "xor",
                    BinaryOp::Add => "add",
                    BinaryOp::Sub => "sub",
                    BinaryOp::Mul => "mul",
                    BinaryOp::Shl => "shl",
                    BinaryOp::LShr => "lshr",
                };
                write!(f, "({name} {lhs} {rhs})")
            }
            ExprKind::Compare { op, lhs, rhs } => {
                let name = match op {
                    CompareOp::Eq => "eq",
                    CompareOp::Ult => "ult",
                    CompareOp::Ule => "ule",
                    CompareOp::Slt => "slt",
                };
                write!(f, "({name} {lhs} {rhs})")
            }
            ExprKind::Ite {
                condition,
                then,
                otherwise,
            } => write!(f, "(ite {condition} {then} {otherwise})"),
            ExprKind::Extract {
                expr,
                offset,
                width,
            } => write!(f, "(extract {offset} {width} {expr})"),
            ExprKind::Concat { high, low } => write!(f, "(concat {high} {low})"),
            ExprKind::ZeroExtend { expr, width } => write!(f, "(zext {width} {expr})"),
        }
    }
}
