//! Conservative integer interval analysis.
//!
//! The recognizer's predicates (`upper_bounded`, `lower_bounded`, headroom
//! proofs) all reduce to querying a [`ConstantInterval`] for an expression.
//! Queries are memoised by structural expression identity and driven off the
//! ambient `Let` scope.
use fnv::FnvHashMap as HashMap;

use crate::expr::{BinOp, CallOp, Expr};
use crate::ty::Type;

/// An inclusive integer interval with optionally unbounded ends.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConstantInterval {
    pub min: Option<i128>,
    pub max: Option<i128>,
}

impl ConstantInterval {
    pub fn unbounded() -> Self {
        ConstantInterval {
            min: None,
            max: None,
        }
    }
    pub fn new(min: i128, max: i128) -> Self {
        debug_assert!(min <= max);
        ConstantInterval {
            min: Some(min),
            max: Some(max),
        }
    }
    pub fn single(value: i128) -> Self {
        Self::new(value, value)
    }
    /// The representable range of a bounded integer type.
    pub fn from_type(ty: Type) -> Self {
        match (ty.min_value(), ty.max_value()) {
            (Some(min), Some(max)) => Self::new(min, max),
            _ => Self::unbounded(),
        }
    }

    pub fn as_single(&self) -> Option<i128> {
        match (self.min, self.max) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }
    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    /// Whether every value of the interval is representable in `ty`.
    pub fn fits_in(&self, ty: Type) -> bool {
        match (self.min, self.max, ty.min_value(), ty.max_value()) {
            (Some(lo), Some(hi), Some(ty_lo), Some(ty_hi)) => lo >= ty_lo && hi <= ty_hi,
            _ => false,
        }
    }

    pub fn union(self, other: Self) -> Self {
        ConstantInterval {
            min: opt2(self.min, other.min, i128::min),
            max: opt2(self.max, other.max, i128::max),
        }
    }

    pub fn add(self, other: Self) -> Self {
        ConstantInterval {
            min: checked2(self.min, other.min, i128::checked_add),
            max: checked2(self.max, other.max, i128::checked_add),
        }
    }
    pub fn sub(self, other: Self) -> Self {
        ConstantInterval {
            min: checked2(self.min, other.max, i128::checked_sub),
            max: checked2(self.max, other.min, i128::checked_sub),
        }
    }
    pub fn neg(self) -> Self {
        ConstantInterval {
            min: self.max.and_then(|x| x.checked_neg()),
            max: self.min.and_then(|x| x.checked_neg()),
        }
    }
    pub fn mul(self, other: Self) -> Self {
        let corners = match (self.min, self.max, other.min, other.max) {
            (Some(a), Some(b), Some(c), Some(d)) => [
                a.checked_mul(c),
                a.checked_mul(d),
                b.checked_mul(c),
                b.checked_mul(d),
            ],
            _ => return Self::unbounded(),
        };
        let mut min = None;
        let mut max = None;
        for corner in &corners {
            match corner {
                Some(x) => {
                    min = Some(min.map_or(*x, |m: i128| m.min(*x)));
                    max = Some(max.map_or(*x, |m: i128| m.max(*x)));
                }
                None => return Self::unbounded(),
            }
        }
        ConstantInterval { min, max }
    }

    pub fn min_of(self, other: Self) -> Self {
        ConstantInterval {
            // Either bound alone caps the minimum of the two values.
            min: opt2(self.min, other.min, i128::min),
            max: one_sided_min(self.max, other.max),
        }
    }
    pub fn max_of(self, other: Self) -> Self {
        ConstantInterval {
            min: one_sided_max(self.min, other.min),
            max: opt2(self.max, other.max, i128::max),
        }
    }

    /// Arithmetic right shift by a known non-negative amount.
    pub fn shr(self, shift: u32) -> Self {
        ConstantInterval {
            min: self.min.map(|x| x >> shift),
            max: self.max.map(|x| x >> shift),
        }
    }
    pub fn shl(self, shift: u32) -> Self {
        ConstantInterval {
            min: self.min.and_then(|x| x.checked_shl(shift).filter(|y| y >> shift == x)),
            max: self.max.and_then(|x| x.checked_shl(shift).filter(|y| y >> shift == x)),
        }
    }
}

fn opt2(a: Option<i128>, b: Option<i128>, f: fn(i128, i128) -> i128) -> Option<i128> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        _ => None,
    }
}
fn checked2(
    a: Option<i128>,
    b: Option<i128>,
    f: fn(i128, i128) -> Option<i128>,
) -> Option<i128> {
    match (a, b) {
        (Some(a), Some(b)) => f(a, b),
        _ => None,
    }
}
// min(x, y) is bounded above by whichever bound is known.
fn one_sided_min(a: Option<i128>, b: Option<i128>) -> Option<i128> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
fn one_sided_max(a: Option<i128>, b: Option<i128>) -> Option<i128> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Memoising bounds oracle.
///
/// Results are cached per structural expression; the cache is flushed when
/// the let-scope changes because variable bounds feed the analysis.
#[derive(Default)]
pub struct BoundsCache {
    cache: HashMap<Expr, ConstantInterval>,
    scope: Vec<(String, ConstantInterval)>,
}

impl BoundsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scope(&mut self, name: impl Into<String>, bounds: ConstantInterval) {
        self.scope.push((name.into(), bounds));
        self.cache.clear();
    }
    pub fn pop_scope(&mut self) {
        self.scope.pop();
        self.cache.clear();
    }

    fn lookup(&self, name: &str) -> Option<ConstantInterval> {
        self.scope
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, b)| *b)
    }

    /// Bounds of an integer-typed expression, exact where no overflow can
    /// occur and falling back to the type's range otherwise.
    pub fn bounds(&mut self, expr: &Expr) -> ConstantInterval {
        self.bounds_depth(expr, u32::MAX)
    }

    /// Depth-bounded variant used by the headroom probe: past `depth` nodes
    /// the expression is only known by its type.
    pub fn bounds_depth(&mut self, expr: &Expr, depth: u32) -> ConstantInterval {
        if !expr.ty().is_int_or_uint() && !expr.ty().is_bool() {
            return ConstantInterval::unbounded();
        }
        if let Some(hit) = self.cache.get(expr) {
            log::trace!("bounds cache hit for {}", expr);
            return *hit;
        }
        let result = self.bounds_uncached(expr, depth);
        // Exactness rule: an interval that escapes the static type means the
        // node can wrap at runtime, so only the type range is trustworthy.
        let result = if result.fits_in(expr.ty()) || imm_or_widening(expr) {
            result
        } else {
            ConstantInterval::from_type(expr.ty())
        };
        if depth == u32::MAX {
            self.cache.insert(expr.clone(), result);
        }
        result
    }

    fn bounds_uncached(&mut self, expr: &Expr, depth: u32) -> ConstantInterval {
        if depth == 0 {
            return ConstantInterval::from_type(expr.ty());
        }
        let depth = depth.saturating_sub(1);
        match expr {
            Expr::IntImm { value, .. } => ConstantInterval::single(*value as i128),
            Expr::UIntImm { value, .. } => ConstantInterval::single(*value as i128),
            Expr::Var { ty, name } => self
                .lookup(name)
                .unwrap_or_else(|| ConstantInterval::from_type(*ty)),
            Expr::Cast { ty, value } => {
                let inner = self.bounds_depth(value, depth);
                if inner.fits_in(*ty) {
                    inner
                } else {
                    ConstantInterval::from_type(*ty)
                }
            }
            Expr::Reinterpret { ty, .. } => ConstantInterval::from_type(*ty),
            Expr::Broadcast { value, .. } => self.bounds_depth(value, depth),
            Expr::Ramp {
                base,
                stride,
                lanes,
                ..
            } => {
                let base = self.bounds_depth(base, depth);
                let stride = self.bounds_depth(stride, depth);
                let steps = ConstantInterval::new(0, *lanes as i128 - 1);
                base.add(stride.mul(steps))
            }
            Expr::Binary { op, a, b, .. } => {
                let ba = self.bounds_depth(a, depth);
                let bb = self.bounds_depth(b, depth);
                match op {
                    BinOp::Add => ba.add(bb),
                    BinOp::Sub => ba.sub(bb),
                    BinOp::Mul => ba.mul(bb),
                    BinOp::Min => ba.min_of(bb),
                    BinOp::Max => ba.max_of(bb),
                    BinOp::Div => match bb.as_single() {
                        Some(d) if d > 0 => ConstantInterval {
                            min: ba.min.map(|x| x.div_euclid(d)),
                            max: ba.max.map(|x| x.div_euclid(d)),
                        },
                        _ => ConstantInterval::from_type(expr.ty()),
                    },
                    BinOp::Mod => match bb.as_single() {
                        Some(d) if d > 0 => ConstantInterval::new(0, d - 1),
                        _ => ConstantInterval::from_type(expr.ty()),
                    },
                    BinOp::And | BinOp::Or => ConstantInterval::new(0, 1),
                }
            }
            Expr::Cmp { .. } => ConstantInterval::new(0, 1),
            Expr::Not { .. } => ConstantInterval::new(0, 1),
            Expr::Select {
                true_value,
                false_value,
                ..
            } => {
                let bt = self.bounds_depth(true_value, depth);
                let bf = self.bounds_depth(false_value, depth);
                bt.union(bf)
            }
            Expr::Let {
                name, value, body, ..
            } => {
                let value_bounds = self.bounds_depth(value, depth);
                self.push_scope(name.clone(), value_bounds);
                let result = self.bounds_depth(body, depth);
                self.pop_scope();
                result
            }
            Expr::Call { op, args, .. } => self.call_bounds(expr, op, args, depth),
            _ => ConstantInterval::from_type(expr.ty()),
        }
    }

    fn call_bounds(
        &mut self,
        expr: &Expr,
        op: &CallOp,
        args: &[Expr],
        depth: u32,
    ) -> ConstantInterval {
        let ty = expr.ty();
        match op {
            CallOp::WideningAdd => self
                .bounds_depth(&args[0], depth)
                .add(self.bounds_depth(&args[1], depth)),
            CallOp::WideningSub => self
                .bounds_depth(&args[0], depth)
                .sub(self.bounds_depth(&args[1], depth)),
            CallOp::WideningMul => self
                .bounds_depth(&args[0], depth)
                .mul(self.bounds_depth(&args[1], depth)),
            CallOp::WidenRightAdd => self
                .bounds_depth(&args[0], depth)
                .add(self.bounds_depth(&args[1], depth)),
            CallOp::WidenRightSub => self
                .bounds_depth(&args[0], depth)
                .sub(self.bounds_depth(&args[1], depth)),
            CallOp::HalvingAdd => self
                .bounds_depth(&args[0], depth)
                .add(self.bounds_depth(&args[1], depth))
                .shr(1),
            CallOp::HalvingSub => self
                .bounds_depth(&args[0], depth)
                .sub(self.bounds_depth(&args[1], depth))
                .shr(1),
            CallOp::RoundingHalvingAdd => self
                .bounds_depth(&args[0], depth)
                .add(self.bounds_depth(&args[1], depth))
                .add(ConstantInterval::single(1))
                .shr(1),
            CallOp::ShiftRight | CallOp::WideningShiftRight => {
                match args[1].const_int() {
                    Some(c) if c >= 0 && c < 128 => {
                        self.bounds_depth(&args[0], depth).shr(c as u32)
                    }
                    _ => ConstantInterval::from_type(ty),
                }
            }
            CallOp::ShiftLeft | CallOp::WideningShiftLeft => match args[1].const_int() {
                Some(c) if c >= 0 && c < 128 => {
                    self.bounds_depth(&args[0], depth).shl(c as u32)
                }
                _ => ConstantInterval::from_type(ty),
            },
            CallOp::RoundingShiftRight => match args[1].const_int() {
                Some(c) if c > 0 && c < 128 => self
                    .bounds_depth(&args[0], depth)
                    .add(ConstantInterval::single(1i128 << (c - 1)))
                    .shr(c as u32),
                Some(0) => self.bounds_depth(&args[0], depth),
                _ => ConstantInterval::from_type(ty),
            },
            CallOp::SaturatingAdd => clamp_to(
                self.bounds_depth(&args[0], depth)
                    .add(self.bounds_depth(&args[1], depth)),
                ty,
            ),
            CallOp::SaturatingSub => clamp_to(
                self.bounds_depth(&args[0], depth)
                    .sub(self.bounds_depth(&args[1], depth)),
                ty,
            ),
            CallOp::SaturatingCast => clamp_to(self.bounds_depth(&args[0], depth), ty),
            CallOp::Abs => {
                let inner = self.bounds_depth(&args[0], depth);
                abs_interval(inner)
            }
            CallOp::AbsD => {
                let diff = self
                    .bounds_depth(&args[0], depth)
                    .sub(self.bounds_depth(&args[1], depth));
                abs_interval(diff)
            }
            CallOp::SortedAvg => self
                .bounds_depth(&args[0], depth)
                .add(self.bounds_depth(&args[1], depth))
                .shr(1),
            _ => ConstantInterval::from_type(ty),
        }
    }

    /// `expr <= limit` for every possible value.
    pub fn upper_bounded(&mut self, expr: &Expr, limit: i128) -> bool {
        matches!(self.bounds(expr).max, Some(hi) if hi <= limit)
    }
    /// `expr >= limit` for every possible value.
    pub fn lower_bounded(&mut self, expr: &Expr, limit: i128) -> bool {
        matches!(self.bounds(expr).min, Some(lo) if lo >= limit)
    }
    /// Prove the expression's value set fits a type narrower than its own.
    /// Meaningless against the expression's static type, whose range always
    /// contains the fallback answer.
    pub fn can_prove_narrows_to(&mut self, expr: &Expr, ty: Type) -> bool {
        debug_assert!(ty.bits() < expr.ty().bits());
        self.bounds(expr).fits_in(ty)
    }
}

fn clamp_to(interval: ConstantInterval, ty: Type) -> ConstantInterval {
    let range = ConstantInterval::from_type(ty);
    match (range.min, range.max) {
        (Some(lo), Some(hi)) => ConstantInterval {
            min: Some(interval.min.map_or(lo, |x| x.clamp(lo, hi))),
            max: Some(interval.max.map_or(hi, |x| x.clamp(lo, hi))),
        },
        _ => interval,
    }
}

fn abs_interval(interval: ConstantInterval) -> ConstantInterval {
    match (interval.min, interval.max) {
        (Some(lo), Some(hi)) => {
            if lo >= 0 {
                ConstantInterval::new(lo, hi)
            } else if hi <= 0 {
                ConstantInterval::new(-hi, -lo)
            } else {
                ConstantInterval::new(0, (-lo).max(hi))
            }
        }
        _ => ConstantInterval {
            min: Some(0),
            max: None,
        },
    }
}

/// Nodes whose value never wraps: immediates and the widening intrinsics,
/// which have headroom by construction.
fn imm_or_widening(expr: &Expr) -> bool {
    match expr {
        Expr::IntImm { .. } | Expr::UIntImm { .. } => true,
        Expr::Call { op, .. } => matches!(
            op,
            CallOp::WideningAdd | CallOp::WideningSub | CallOp::WideningMul
        ),
        Expr::Broadcast { value, .. } => imm_or_widening(value),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::*;
    use crate::ty::Type;

    #[test]
    fn imm_bounds_are_exact() {
        let mut cache = BoundsCache::new();
        assert_eq!(
            cache.bounds(&int_imm(Type::i32(1), 42)),
            ConstantInterval::single(42)
        );
    }

    #[test]
    fn var_bounds_come_from_type_or_scope() {
        let mut cache = BoundsCache::new();
        let v = var(Type::u8(1), "x");
        assert_eq!(cache.bounds(&v), ConstantInterval::new(0, 255));
        cache.push_scope("x", ConstantInterval::new(3, 7));
        assert_eq!(cache.bounds(&v), ConstantInterval::new(3, 7));
        cache.pop_scope();
        assert_eq!(cache.bounds(&v), ConstantInterval::new(0, 255));
    }

    #[test]
    fn widening_ops_track_exact_ranges() {
        let mut cache = BoundsCache::new();
        let a = var(Type::u8(4), "a");
        let b = var(Type::u8(4), "b");
        let w = widening_add(a, b);
        assert_eq!(cache.bounds(&w), ConstantInterval::new(0, 510));
        assert!(cache.upper_bounded(&w, 510));
        assert!(!cache.upper_bounded(&w, 509));
    }

    #[test]
    fn wrapping_arithmetic_degrades_to_type_bounds() {
        let mut cache = BoundsCache::new();
        let a = var(Type::u8(1), "a");
        let b = var(Type::u8(1), "b");
        // u8 + u8 can wrap, so only the type range is known.
        let sum = a + b;
        assert_eq!(cache.bounds(&sum), ConstantInterval::new(0, 255));
    }

    #[test]
    fn casts_preserve_proven_ranges() {
        let mut cache = BoundsCache::new();
        let a = var(Type::u8(4), "a");
        let widened = cast(Type::i32(4), a);
        assert_eq!(cache.bounds(&widened), ConstantInterval::new(0, 255));
    }

    #[test]
    fn depth_probe_cuts_off() {
        let mut cache = BoundsCache::new();
        let a = var(Type::u8(4), "a");
        let b = var(Type::u8(4), "b");
        let w = widening_add(a, b);
        // Depth 1 sees the call but not its operands' exact ranges; the
        // operands degrade to their type range, which here is the same.
        assert_eq!(cache.bounds_depth(&w, 2), ConstantInterval::new(0, 510));
    }
}
