//! Intrinsic recognition: lift ordinary arithmetic into named intrinsics.
//!
//! A bottom-up rewriter over vector integer expressions. Each node kind has
//! an ordered rule list; the first matching rule wins and the rewriter
//! recurses on its result. No rewrite changes an expression's static type
//! except by introducing an explicit cast, and a rewrite whose result type
//! disagrees with its input is refused.
//!
//! `HL_DISABLE_INTRINISICS=1` turns the whole pass into the identity;
//! `HL_ENABLE_RAKE_RULES=1` enables the opt-in bank of synthesised rules.
use crate::expr::{self, BinOp, CallOp, CmpOp, Expr, Stmt};
use crate::interval::{BoundsCache, ConstantInterval};
use crate::simplify::{negate_const, simplify};
use crate::ty::{Type, TypeCode};

/// Depth the headroom probe is willing to inspect before giving up and
/// trusting only static types. `bits/2 - 1` is a heuristic, tunable, not
/// proven minimal.
fn headroom_probe_depth(bits: u8) -> u32 {
    ((bits / 2).saturating_sub(1)).max(1) as u32
}

fn rake_rules_enabled() -> bool {
    std::env::var("HL_ENABLE_RAKE_RULES").map_or(false, |v| v == "1")
}

fn recognizer_disabled() -> bool {
    std::env::var("HL_DISABLE_INTRINISICS").map_or(false, |v| v == "1")
}

/// Run intrinsic recognition over every expression in a statement.
pub fn find_intrinsics(stmt: &Stmt) -> Stmt {
    if recognizer_disabled() {
        return stmt.clone();
    }
    FindIntrinsics::new().mutate_stmt(stmt)
}

/// Run intrinsic recognition over one expression.
pub fn find_intrinsics_expr(expr: &Expr) -> Expr {
    if recognizer_disabled() {
        return expr.clone();
    }
    FindIntrinsics::new().mutate(&substitute_wide_lets(expr))
}

/// Inline let-bindings whose value is provably wider than every input it
/// references, so patterns reach across binders. Impure values stay bound.
fn substitute_wide_lets(expr: &Expr) -> Expr {
    match expr {
        Expr::Let {
            ty,
            name,
            value,
            body,
        } => {
            let value = substitute_wide_lets(value);
            let body = substitute_wide_lets(body);
            if value.is_pure() && wider_than_free_vars(&value) {
                body.substitute(name, &value)
            } else {
                Expr::Let {
                    ty: *ty,
                    name: name.clone(),
                    value: Box::new(value),
                    body: Box::new(body),
                }
            }
        }
        _ => expr.map_children(&mut |child| substitute_wide_lets(child)),
    }
}

fn wider_than_free_vars(value: &Expr) -> bool {
    let bits = value.ty().bits();
    let mut widest_input = 0u8;
    collect_var_bits(value, &mut widest_input);
    widest_input < bits
}

fn collect_var_bits(expr: &Expr, widest: &mut u8) {
    if let Expr::Var { ty, .. } = expr {
        *widest = (*widest).max(ty.bits());
    }
    expr.for_each_child(&mut |child| collect_var_bits(child, widest));
}

struct FindIntrinsics {
    bounds: BoundsCache,
    rake: bool,
}

impl FindIntrinsics {
    fn new() -> Self {
        FindIntrinsics {
            bounds: BoundsCache::new(),
            rake: rake_rules_enabled(),
        }
    }

    fn mutate_stmt(&mut self, stmt: &Stmt) -> Stmt {
        match stmt {
            Stmt::LetStmt { name, value, body } => {
                let value = self.run_expr(value);
                let value_bounds = self.bounds.bounds(&value);
                self.bounds.push_scope(name.clone(), value_bounds);
                let body = self.mutate_stmt(body);
                self.bounds.pop_scope();
                Stmt::LetStmt {
                    name: name.clone(),
                    value,
                    body: Box::new(body),
                }
            }
            Stmt::For {
                name,
                kind,
                min,
                extent,
                body,
            } => {
                let min = self.run_expr(min);
                let extent = self.run_expr(extent);
                let loop_bounds = match (min.const_int(), extent.const_int()) {
                    (Some(lo), Some(n)) if n > 0 => ConstantInterval::new(lo, lo + n - 1),
                    _ => ConstantInterval::from_type(min.ty()),
                };
                self.bounds.push_scope(name.clone(), loop_bounds);
                let body = self.mutate_stmt(body);
                self.bounds.pop_scope();
                Stmt::For {
                    name: name.clone(),
                    kind: *kind,
                    min,
                    extent,
                    body: Box::new(body),
                }
            }
            _ => {
                // `stmt.map` takes two `FnMut` closures; both would need to capture
                // `self` mutably at once, which the borrow checker rejects even
                // though they are only ever invoked one at a time, never re-entrantly.
                let self_ptr = self as *mut Self;
                stmt.map(
                    &mut |e| unsafe { (*self_ptr).run_expr(e) },
                    &mut |s| unsafe { (*self_ptr).mutate_stmt(s) },
                )
            }
        }
    }

    fn run_expr(&mut self, expr: &Expr) -> Expr {
        self.mutate(&substitute_wide_lets(expr))
    }

    fn mutate(&mut self, expr: &Expr) -> Expr {
        let rebuilt = match expr {
            Expr::Let {
                ty,
                name,
                value,
                body,
            } => {
                let value = self.mutate(value);
                let value_bounds = self.bounds.bounds(&value);
                self.bounds.push_scope(name.clone(), value_bounds);
                let body = self.mutate(body);
                self.bounds.pop_scope();
                Expr::Let {
                    ty: *ty,
                    name: name.clone(),
                    value: Box::new(value),
                    body: Box::new(body),
                }
            }
            _ => expr.map_children(&mut |child| self.mutate(child)),
        };
        if !eligible(rebuilt.ty()) {
            return rebuilt;
        }
        match self.rewrite(&rebuilt) {
            Some(next) if next != rebuilt => {
                if next.ty() != rebuilt.ty() {
                    // A rewrite must never change the static type; refuse it.
                    log::error!(
                        "refusing type-changing rewrite: {} : {} -> {} : {}",
                        rebuilt,
                        rebuilt.ty(),
                        next,
                        next.ty()
                    );
                    debug_assert!(false, "type-changing rewrite");
                    return rebuilt;
                }
                self.mutate(&next)
            }
            _ => rebuilt,
        }
    }

    fn rewrite(&mut self, expr: &Expr) -> Option<Expr> {
        let out = match expr {
            Expr::Binary { ty, op, a, b } => match op {
                BinOp::Add => self.rewrite_add(*ty, a, b),
                BinOp::Sub => self.rewrite_sub(*ty, a, b),
                BinOp::Mul => self.rewrite_mul(*ty, a, b),
                _ => None,
            },
            Expr::Cast { ty, value } => self.rewrite_cast(*ty, value),
            Expr::Reinterpret { ty, value } => rewrite_reinterpret(*ty, value),
            Expr::Call { ty, op, args } => match op {
                CallOp::ShiftRight => self.rewrite_shift_right(*ty, args),
                CallOp::ShiftLeft => self.rewrite_shift_left(*ty, args),
                CallOp::RoundingShiftRight => rewrite_rounding_shift_right(*ty, args),
                CallOp::SaturatingCast => rewrite_saturating_cast(*ty, args),
                CallOp::Abs => rewrite_abs(*ty, args),
                CallOp::WidenRightAdd | CallOp::WidenRightSub | CallOp::WidenRightMul => {
                    rewrite_widen_right_fold(op, args)
                }
                _ => None,
            },
            _ => None,
        };
        if out.is_some() {
            return out;
        }
        if self.rake {
            self.rewrite_rake(expr)
        } else {
            None
        }
    }

    // add patterns: widening pairs, one-sided widen_right.
    fn rewrite_add(&mut self, ty: Type, a: &Expr, b: &Expr) -> Option<Expr> {
        if let Some(out) = self.try_widening_pair(ty, BinOp::Add, a, b) {
            return Some(out);
        }
        if ty.bits() >= 16 {
            let narrow = ty.narrow();
            if let Some(nb) = self.lossless_narrow(b, narrow) {
                log::debug!("widen_right_add: {} + {}", a, b);
                return Some(expr::widen_right_add(a.clone(), nb));
            }
            if let Some(na) = self.lossless_narrow(a, narrow) {
                log::debug!("widen_right_add (commuted): {} + {}", a, b);
                return Some(expr::widen_right_add(b.clone(), na));
            }
        }
        None
    }

    fn rewrite_sub(&mut self, ty: Type, a: &Expr, b: &Expr) -> Option<Expr> {
        // Prefer a + (-c): negative-constant folding must never introduce a
        // widening_sub where a widening_add suffices.
        if let Some(negated) = negate_const(b) {
            if b.const_int() != Some(0) {
                log::debug!("sub-of-constant becomes add: {} - {}", a, b);
                return Some(a.clone() + negated);
            }
        }
        if let Some(out) = self.try_widening_pair(ty, BinOp::Sub, a, b) {
            return Some(out);
        }
        if ty.bits() >= 16 {
            if let Some(nb) = self.lossless_narrow(b, ty.narrow()) {
                log::debug!("widen_right_sub: {} - {}", a, b);
                return Some(expr::widen_right_sub(a.clone(), nb));
            }
        }
        None
    }

    fn rewrite_mul(&mut self, ty: Type, a: &Expr, b: &Expr) -> Option<Expr> {
        // Distribute constant multiplication across +- first, so widening is
        // attempted over the distributed children.
        for (value, constant) in &[(a, b), (b, a)] {
            if constant.const_int().is_some() {
                if let Some((x, y)) = value.as_binary(BinOp::Add) {
                    log::debug!("distributing {} over +", constant);
                    return Some(simplify(
                        &(x.clone() * (*constant).clone() + y.clone() * (*constant).clone()),
                    ));
                }
                if let Some((x, y)) = value.as_binary(BinOp::Sub) {
                    log::debug!("distributing {} over -", constant);
                    return Some(simplify(&expr::sub(
                        x.clone() * (*constant).clone(),
                        y.clone() * (*constant).clone(),
                    )));
                }
            }
        }
        if let Some(out) = self.try_widening_pair(ty, BinOp::Mul, a, b) {
            return Some(out);
        }
        if ty.bits() >= 16 {
            let narrow = ty.narrow();
            if let Some(nb) = self.lossless_narrow(b, narrow) {
                log::debug!("widen_right_mul: {} * {}", a, b);
                return Some(expr::widen_right_mul(a.clone(), nb));
            }
            if let Some(na) = self.lossless_narrow(a, narrow) {
                log::debug!("widen_right_mul (commuted): {} * {}", a, b);
                return Some(expr::widen_right_mul(b.clone(), na));
            }
        }
        None
    }

    /// Both operands narrow losslessly to the same half-width type: emit the
    /// widening intrinsic. Sign codes are tried in the order {result code,
    /// uint, int}; the first lossless narrowing wins.
    fn try_widening_pair(&mut self, ty: Type, op: BinOp, a: &Expr, b: &Expr) -> Option<Expr> {
        if ty.bits() < 16 {
            return None;
        }
        for code in candidate_codes(ty.code()) {
            let narrow = ty.narrow().with_code(code);
            let na = self.lossless_narrow(a, narrow);
            let nb = na.as_ref().and_then(|_| self.lossless_narrow(b, narrow));
            if let (Some(na), Some(nb)) = (na, nb) {
                let widened = match op {
                    BinOp::Add => expr::widening_add(na, nb),
                    BinOp::Sub => expr::widening_sub(na, nb),
                    BinOp::Mul => expr::widening_mul(na, nb),
                    _ => unreachable!(),
                };
                log::debug!("widening {:?} over {} as {}", op, ty, narrow);
                return Some(expr::cast(ty, widened));
            }
        }
        None
    }

    /// Rebuild `e` at the narrower type `target` when no value can be lost.
    fn lossless_narrow(&mut self, e: &Expr, target: Type) -> Option<Expr> {
        debug_assert!(target.bits() < e.ty().bits());
        match e {
            Expr::Cast { value, .. } => {
                if value.ty() == target {
                    return Some((**value).clone());
                }
                if target.can_represent(value.ty()) {
                    return Some(expr::cast(target, (**value).clone()));
                }
                if self.bounds.bounds(e).fits_in(target) {
                    return Some(expr::cast(target, (**value).clone()));
                }
                None
            }
            Expr::Broadcast { value, lanes, .. } => {
                let narrowed = self.lossless_narrow(value, target.element_of())?;
                Some(expr::broadcast(narrowed, *lanes))
            }
            Expr::Ramp {
                base,
                stride,
                lanes,
                ..
            } => {
                let elem = target.element_of();
                let base = self.lossless_narrow(base, elem)?;
                let stride = self.lossless_narrow(stride, elem)?;
                Some(expr::ramp(base, stride, *lanes))
            }
            Expr::IntImm { value, .. } => {
                let v = *value as i128;
                fits(target, v).then(|| expr::const_of(target, v))
            }
            Expr::UIntImm { value, .. } => {
                let v = *value as i128;
                fits(target, v).then(|| expr::const_of(target, v))
            }
            _ => {
                if self.bounds.bounds(e).fits_in(target) {
                    Some(expr::cast(target, e.clone()))
                } else {
                    None
                }
            }
        }
    }

    fn rewrite_cast(&mut self, ty: Type, value: &Expr) -> Option<Expr> {
        if let Some(out) = self.rewrite_saturating_pattern(ty, value) {
            return Some(out);
        }
        // Rounding shifts carried in the widened type narrow back down when
        // the operand does; the value set is identical either way.
        if let Some(args) = value.as_call(&CallOp::RoundingShiftRight) {
            if let Some(c) = args[1].const_int().filter(|c| *c >= 0) {
                if ty.bits() < args[0].ty().bits() {
                    if let Some(narrowed) = self.lossless_narrow(&args[0], ty) {
                        log::debug!("narrowing rounding_shift_right to {}", ty);
                        return Some(expr::rounding_shift_right(
                            narrowed,
                            expr::const_of(ty, c),
                        ));
                    }
                }
            }
        }
        // A cast of a shifted widening multiply that provably fits needs no
        // saturation to become mul_shift_right.
        if let Some((x, y, q)) = as_shifted_widening_mul(value, CallOp::ShiftRight) {
            if x.ty() == ty && q >= ty.bits() as i128 {
                log::debug!("mul_shift_right from cast of wide shift");
                return Some(expr::mul_shift_right(
                    x.clone(),
                    y.clone(),
                    expr::const_of(shift_ty_of(value), q),
                ));
            }
        }
        // Redundant cast collapse.
        if let Expr::Cast {
            ty: mid_ty,
            value: inner,
        } = value
        {
            let int_chain =
                ty.is_int_or_uint() && mid_ty.is_int_or_uint() && inner.ty().is_int_or_uint();
            if mid_ty.can_represent(inner.ty()) || (int_chain && ty.bits() <= mid_ty.bits()) {
                log::debug!("collapsing cast chain through {}", mid_ty);
                return Some(expr::cast(ty, (**inner).clone()));
            }
        }
        // Same-width int-to-int casts are bit pattern reuse.
        if ty.is_int_or_uint() && value.ty().is_int_or_uint() && ty.bits() == value.ty().bits() {
            return Some(expr::reinterpret(ty, value.clone()));
        }
        None
    }

    /// Clamp-then-cast shapes: saturating add/sub/cast and the saturating
    /// multiply-shifts.
    fn rewrite_saturating_pattern(&mut self, ty: Type, value: &Expr) -> Option<Expr> {
        let ty_lo = ty.min_value()?;
        let ty_hi = ty.max_value()?;
        let (core, lo, hi) = split_clamp(value);
        // At least one explicit bound, and both sides pinned to the result
        // type's range, either by the clamp or by proof.
        if lo.is_none() && hi.is_none() {
            return None;
        }
        let upper_ok = hi == Some(ty_hi)
            || (hi.is_none() && self.bounds.upper_bounded(core, ty_hi));
        let lower_ok = lo == Some(ty_lo)
            || (lo.is_none() && self.bounds.lower_bounded(core, ty_lo));
        if !upper_ok || !lower_ok {
            return None;
        }
        let core = strip_width_preserving(core);
        if let Some(args) = core.as_call(&CallOp::WideningAdd) {
            if args[0].ty() == ty {
                log::debug!("saturating_add over {}", ty);
                return Some(expr::saturating_add(args[0].clone(), args[1].clone()));
            }
        }
        if let Some(args) = core.as_call(&CallOp::WideningSub) {
            if args[0].ty() == ty {
                log::debug!("saturating_sub over {}", ty);
                return Some(expr::saturating_sub(args[0].clone(), args[1].clone()));
            }
        }
        if let Some((x, y, q)) = as_shifted_widening_mul(core, CallOp::ShiftRight) {
            if x.ty() == ty {
                log::debug!("mul_shift_right over {}", ty);
                return Some(expr::mul_shift_right(
                    x.clone(),
                    y.clone(),
                    expr::const_of(shift_ty_of(core), q),
                ));
            }
        }
        if let Some((x, y, q)) = as_shifted_widening_mul(core, CallOp::RoundingShiftRight) {
            if x.ty() == ty {
                log::debug!("rounding_mul_shift_right over {}", ty);
                return Some(expr::rounding_mul_shift_right(
                    x.clone(),
                    y.clone(),
                    expr::const_of(shift_ty_of(core), q),
                ));
            }
        }
        // General clamp to the full type range.
        if lo == Some(ty_lo) || hi == Some(ty_hi) {
            log::debug!("saturating_cast to {}", ty);
            return Some(expr::saturating_cast(ty, core.clone()));
        }
        None
    }

    fn rewrite_shift_right(&mut self, ty: Type, args: &[Expr]) -> Option<Expr> {
        let a = &args[0];
        let b = &args[1];
        if let Some(c) = b.const_int() {
            if c > 0 {
                // Remove an explicit round-term addition when the headroom
                // probe proves it cannot have wrapped.
                if let Some((x, k)) = split_round_add(a) {
                    if k == 1i128 << (c - 1) {
                        let depth = headroom_probe_depth(ty.bits());
                        let limit = ty.max_value()? - k;
                        let hi = self.bounds.bounds_depth(&x, depth).max;
                        if matches!(hi, Some(h) if h <= limit) {
                            log::debug!("rounding_shift_right by {}", c);
                            return Some(expr::rounding_shift_right(x, b.clone()));
                        }
                    }
                }
            }
            if c == 1 {
                if let Some(w) = a.as_call(&CallOp::WideningAdd) {
                    log::debug!("halving_add over {}", ty);
                    return Some(expr::cast(ty, expr::halving_add(w[0].clone(), w[1].clone())));
                }
                if let Some(w) = a.as_call(&CallOp::WideningSub) {
                    log::debug!("halving_sub over {}", ty);
                    return Some(expr::cast(ty, expr::halving_sub(w[0].clone(), w[1].clone())));
                }
                // Plain additions only average safely when overflow would be
                // undefined anyway: signed of at least 32 bits.
                if ty.is_int() && ty.bits() >= 32 {
                    if let Some((x, y)) = a.as_binary(BinOp::Add) {
                        log::debug!("halving_add from undefined-overflow add");
                        return Some(expr::halving_add(x.clone(), y.clone()));
                    }
                }
            }
        }
        self.narrow_shift(ty, a, b, CallOp::WideningShiftRight)
    }

    fn rewrite_shift_left(&mut self, ty: Type, args: &[Expr]) -> Option<Expr> {
        self.narrow_shift(ty, &args[0], &args[1], CallOp::WideningShiftLeft)
    }

    /// A shift whose operand losslessly narrows is a widening shift.
    fn narrow_shift(&mut self, ty: Type, a: &Expr, b: &Expr, op: CallOp) -> Option<Expr> {
        if ty.bits() < 16 {
            return None;
        }
        let narrow = ty.narrow();
        let na = self.lossless_narrow(a, narrow)?;
        log::debug!("{} over {}", op, ty);
        Some(expr::call(ty, op, vec![na, b.clone()]))
    }

    fn rewrite_rake(&mut self, expr: &Expr) -> Option<Expr> {
        let ty = expr.ty();
        if !ty.is_uint() {
            return None;
        }
        // select(x < y, y - x, x - y) and friends collapse to absd.
        if let Expr::Select {
            condition,
            true_value,
            false_value,
            ..
        } = expr
        {
            if let Expr::Cmp { op, a, b, .. } = &**condition {
                let (x, y) = match op {
                    CmpOp::Lt | CmpOp::Le => (a, b),
                    CmpOp::Gt | CmpOp::Ge => (b, a),
                    _ => return None,
                };
                let forward = true_value.as_binary(BinOp::Sub);
                let backward = false_value.as_binary(BinOp::Sub);
                if let (Some((t0, t1)), Some((f0, f1))) = (forward, backward) {
                    if t0 == &**y && t1 == &**x && f0 == &**x && f1 == &**y {
                        log::debug!("rake: absd from select of differences");
                        return Some(expr::absd((**x).clone(), (**y).clone()));
                    }
                }
            }
        }
        // max(x, y) - min(x, y) is also absd.
        if let Some((hi, lo)) = expr.as_binary(BinOp::Sub) {
            if let (Some((a0, a1)), Some((b0, b1))) =
                (hi.as_binary(BinOp::Max), lo.as_binary(BinOp::Min))
            {
                if (a0 == b0 && a1 == b1) || (a0 == b1 && a1 == b0) {
                    log::debug!("rake: absd from max - min");
                    return Some(expr::absd(a0.clone(), a1.clone()));
                }
            }
        }
        None
    }
}

/// Only vector integer expressions of at least byte-wide elements are
/// rewritten; scalar and boolean expressions pass through unchanged.
fn eligible(ty: Type) -> bool {
    ty.is_vector() && ty.is_int_or_uint() && ty.bits() >= 8
}

fn candidate_codes(result: TypeCode) -> Vec<TypeCode> {
    let mut codes = vec![result, TypeCode::UInt, TypeCode::Int];
    codes.dedup();
    if codes.len() == 3 && codes[0] == codes[2] {
        codes.pop();
    }
    codes
}

fn fits(ty: Type, value: i128) -> bool {
    match (ty.min_value(), ty.max_value()) {
        (Some(lo), Some(hi)) => value >= lo && value <= hi,
        _ => false,
    }
}

/// An addition of a constant, whichever spelling the earlier bottom-up
/// rewrites left it in. For a widening add the remainder is the widened
/// operand.
fn split_round_add(e: &Expr) -> Option<(Expr, i128)> {
    if let Some((x, k)) = e.as_binary(BinOp::Add) {
        return Some((x.clone(), k.const_int()?));
    }
    if let Some(args) = e.as_call(&CallOp::WidenRightAdd) {
        return Some((args[0].clone(), args[1].const_int()?));
    }
    if let Some(args) = e.as_call(&CallOp::WideningAdd) {
        return Some((expr::cast(e.ty(), args[0].clone()), args[1].const_int()?));
    }
    None
}

/// Split `max(min(e, hi), lo)` and its variants into the clamped core and
/// the constant bounds present.
fn split_clamp(e: &Expr) -> (&Expr, Option<i128>, Option<i128>) {
    if let Some((inner, lo)) = e.as_binary(BinOp::Max) {
        let lo_c = lo.const_int();
        if lo_c.is_some() {
            if let Some((core, hi)) = inner.as_binary(BinOp::Min) {
                if let Some(hi_c) = hi.const_int() {
                    return (core, lo_c, Some(hi_c));
                }
            }
            return (inner, lo_c, None);
        }
    }
    if let Some((inner, hi)) = e.as_binary(BinOp::Min) {
        let hi_c = hi.const_int();
        if hi_c.is_some() {
            if let Some((core, lo)) = inner.as_binary(BinOp::Max) {
                if let Some(lo_c) = lo.const_int() {
                    return (core, Some(lo_c), hi_c);
                }
            }
            return (inner, None, hi_c);
        }
    }
    (e, None, None)
}

/// See through casts and reinterprets that only relabel the same bits.
fn strip_width_preserving(e: &Expr) -> &Expr {
    let mut cur = e;
    loop {
        match cur {
            Expr::Cast { ty, value } | Expr::Reinterpret { ty, value }
                if ty.is_int_or_uint()
                    && value.ty().is_int_or_uint()
                    && ty.bits() == value.ty().bits() =>
            {
                cur = value;
            }
            _ => return cur,
        }
    }
}

/// `shift(widening_mul(x, y), q)` with a constant non-negative amount.
fn as_shifted_widening_mul(e: &Expr, shift_op: CallOp) -> Option<(&Expr, &Expr, i128)> {
    let args = e.as_call(&shift_op)?;
    let q = args[1].const_int().filter(|q| *q >= 0)?;
    let mul_args = args[0].as_call(&CallOp::WideningMul)?;
    if mul_args[0].ty() != mul_args[1].ty() {
        return None;
    }
    Some((&mul_args[0], &mul_args[1], q))
}

fn shift_ty_of(e: &Expr) -> Type {
    match e {
        Expr::Call { args, .. } => args[1].ty(),
        _ => unreachable!(),
    }
}

fn rewrite_reinterpret(ty: Type, value: &Expr) -> Option<Expr> {
    if let Expr::Reinterpret { value: inner, .. } = value {
        return Some(expr::reinterpret(ty, (**inner).clone()));
    }
    None
}

fn rewrite_rounding_shift_right(ty: Type, args: &[Expr]) -> Option<Expr> {
    if args[1].const_int() == Some(1) {
        if let Some(w) = args[0].as_call(&CallOp::WideningAdd) {
            log::debug!("rounding_halving_add over {}", ty);
            return Some(expr::cast(
                ty,
                expr::rounding_halving_add(w[0].clone(), w[1].clone()),
            ));
        }
    }
    None
}

fn rewrite_saturating_cast(ty: Type, args: &[Expr]) -> Option<Expr> {
    let inner = &args[0];
    if let Some(w) = inner.as_call(&CallOp::WideningAdd) {
        if w[0].ty() == ty {
            return Some(expr::saturating_add(w[0].clone(), w[1].clone()));
        }
    }
    if let Some(w) = inner.as_call(&CallOp::WideningSub) {
        if w[0].ty() == ty {
            return Some(expr::saturating_sub(w[0].clone(), w[1].clone()));
        }
    }
    if let Some((x, y, q)) = as_shifted_widening_mul(inner, CallOp::ShiftRight) {
        if x.ty() == ty {
            return Some(expr::mul_shift_right(
                x.clone(),
                y.clone(),
                expr::const_of(shift_ty_of(inner), q),
            ));
        }
    }
    if let Some((x, y, q)) = as_shifted_widening_mul(inner, CallOp::RoundingShiftRight) {
        if x.ty() == ty {
            return Some(expr::rounding_mul_shift_right(
                x.clone(),
                y.clone(),
                expr::const_of(shift_ty_of(inner), q),
            ));
        }
    }
    None
}

fn rewrite_abs(ty: Type, args: &[Expr]) -> Option<Expr> {
    if let Some(w) = args[0].as_call(&CallOp::WideningSub) {
        if w[0].ty().is_int() || w[0].ty().is_uint() {
            if args[0].ty().is_int() {
                log::debug!("absd over {}", w[0].ty());
                return Some(expr::cast(ty, expr::absd(w[0].clone(), w[1].clone())));
            }
        }
    }
    None
}

fn rewrite_widen_right_fold(op: &CallOp, args: &[Expr]) -> Option<Expr> {
    let inner_args = args[0].as_call(op)?;
    let x = inner_args[0].clone();
    let y = inner_args[1].clone();
    let z = args[1].clone();
    if y.ty() != z.ty() {
        return None;
    }
    log::debug!("folding nested {}", op);
    let widened = match op {
        // (x + y) + z == x + (y + z); (x - y) - z == x - (y + z).
        CallOp::WidenRightAdd => return Some(x + expr::widening_add(y, z)),
        CallOp::WidenRightSub => return Some(expr::sub(x, expr::widening_add(y, z))),
        CallOp::WidenRightMul => expr::widening_mul(y, z),
        _ => return None,
    };
    Some(x * widened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::*;
    use pretty_assertions::assert_eq;

    fn recognize(e: &Expr) -> Expr {
        FindIntrinsics::new().mutate(&substitute_wide_lets(e))
    }

    #[test]
    fn widening_add_from_cast_pair() {
        let a = var(Type::i16(4), "a");
        let b = var(Type::i16(4), "b");
        let input = cast(Type::i32(4), a.clone()) + cast(Type::i32(4), b.clone());
        assert_eq!(recognize(&input), widening_add(a, b));
    }

    #[test]
    fn widening_mul_prefers_result_code() {
        let a = var(Type::u8(8), "a");
        let b = var(Type::u8(8), "b");
        let input = cast(Type::u16(8), a.clone()) * cast(Type::u16(8), b.clone());
        assert_eq!(recognize(&input), widening_mul(a, b));
    }

    #[test]
    fn one_sided_narrowing_is_widen_right() {
        let wide = var(Type::i32(4), "w");
        let narrow = var(Type::i16(4), "n");
        let input = wide.clone() + cast(Type::i32(4), narrow.clone());
        assert_eq!(recognize(&input), widen_right_add(wide, narrow));
    }

    #[test]
    fn rounding_halving_add_from_shifted_sum() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        let wide = Type::u16(8);
        let input = cast(
            Type::u8(8),
            shift_right(
                widening_add(x.clone(), y.clone()) + const_of(wide, 1),
                const_of(wide, 1),
            ),
        );
        assert_eq!(recognize(&input), rounding_halving_add(x, y));
    }

    #[test]
    fn halving_add_from_shifted_widening_add() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        let wide = Type::u16(8);
        let input = cast(
            Type::u8(8),
            shift_right(widening_add(x.clone(), y.clone()), const_of(wide, 1)),
        );
        assert_eq!(recognize(&input), halving_add(x, y));
    }

    #[test]
    fn saturating_add_from_clamped_widening_add() {
        let x = var(Type::i8(8), "x");
        let y = var(Type::i8(8), "y");
        let wide = Type::i16(8);
        let clamped = max(
            min(widening_add(x.clone(), y.clone()), const_of(wide, 127)),
            const_of(wide, -128),
        );
        let input = cast(Type::i8(8), clamped);
        assert_eq!(recognize(&input), saturating_add(x, y));
    }

    #[test]
    fn uint_saturating_add_needs_only_the_upper_clamp() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        let wide = Type::u16(8);
        let input = cast(
            Type::u8(8),
            min(widening_add(x.clone(), y.clone()), const_of(wide, 255)),
        );
        assert_eq!(recognize(&input), saturating_add(x, y));
    }

    #[test]
    fn uint_saturating_sub_needs_only_the_lower_clamp() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        // Unsigned subtraction widens through the signed type.
        let wide = Type::i16(8);
        let diff = expr::sub(cast(wide, x.clone()), cast(wide, y.clone()));
        let input = cast(
            Type::u8(8),
            max(min(diff, const_of(wide, 255)), const_of(wide, 0)),
        );
        assert_eq!(recognize(&input), saturating_sub(x, y));
    }

    #[test]
    fn mul_shift_right_from_saturated_wide_product() {
        let x = var(Type::i16(4), "x");
        let y = var(Type::i16(4), "y");
        let wide = Type::i32(4);
        let shifted = shift_right(widening_mul(x.clone(), y.clone()), const_of(wide, 14));
        let clamped = max(
            min(shifted, const_of(wide, 32767)),
            const_of(wide, -32768),
        );
        let input = cast(Type::i16(4), clamped);
        assert_eq!(
            recognize(&input),
            mul_shift_right(x, y, const_of(wide, 14))
        );
    }

    #[test]
    fn absd_from_abs_of_widening_sub() {
        let x = var(Type::i8(8), "x");
        let y = var(Type::i8(8), "y");
        let input = cast(
            Type::u8(8),
            abs(widening_sub(x.clone(), y.clone())),
        );
        assert_eq!(recognize(&input), absd(x, y));
    }

    #[test]
    fn sub_of_constant_becomes_widening_add() {
        let a = var(Type::i16(4), "a");
        let wide = Type::i32(4);
        // a - 100 at i32 over an i16 payload: the negated constant still
        // narrows, so this must become a widening add, not a widening sub.
        let input = expr::sub(cast(wide, a.clone()), const_of(wide, 100));
        assert_eq!(
            recognize(&input),
            widening_add(a, const_of(Type::i16(4), -100))
        );
    }

    #[test]
    fn constant_multiplication_distributes_before_widening() {
        let a = var(Type::i16(4), "a");
        let b = var(Type::i16(4), "b");
        let wide = Type::i32(4);
        let sum = cast(wide, a.clone()) + cast(wide, b.clone());
        let input = sum * const_of(wide, 3);
        // Distribution happens first, so each product widens independently.
        let three = const_of(Type::i16(4), 3);
        let expected = widening_mul(a, three.clone()) + widening_mul(b, three);
        assert_eq!(recognize(&input), expected);
    }

    #[test]
    fn widen_right_chains_refold() {
        let x = var(Type::i32(4), "x");
        let y = var(Type::i16(4), "y");
        let z = var(Type::i16(4), "z");
        let input = widen_right_add(widen_right_add(x.clone(), y.clone()), z.clone());
        assert_eq!(recognize(&input), x + widening_add(y, z));
    }

    #[test]
    fn shift_of_narrowable_operand_widens() {
        let a = var(Type::u8(8), "a");
        let wide = Type::u16(8);
        let input = shift_left(cast(wide, a.clone()), const_of(wide, 3));
        assert_eq!(
            recognize(&input),
            widening_shift_left(a, const_of(wide, 3))
        );
    }

    #[test]
    fn rewrites_preserve_static_types() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        let wide = Type::u16(8);
        let inputs = vec![
            cast(wide, x.clone()) + cast(wide, y.clone()),
            cast(
                Type::u8(8),
                shift_right(widening_add(x.clone(), y.clone()), const_of(wide, 1)),
            ),
            cast(
                Type::u8(8),
                min(widening_add(x.clone(), y.clone()), const_of(wide, 255)),
            ),
            shift_right(cast(wide, x.clone()) * cast(wide, y.clone()), const_of(wide, 8)),
        ];
        for input in inputs {
            assert_eq!(recognize(&input).ty(), input.ty());
        }
    }

    #[test]
    fn scalar_expressions_pass_through() {
        let a = var(Type::i16(1), "a");
        let b = var(Type::i16(1), "b");
        let input = cast(Type::i32(1), a) + cast(Type::i32(1), b);
        assert_eq!(recognize(&input), input);
    }

    #[test]
    fn wide_lets_are_substituted() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        let wide = Type::u16(8);
        let bound = cast(wide, x.clone()) + cast(wide, y.clone());
        let input = let_in(
            "t",
            bound,
            shift_right(var(wide, "t"), const_of(wide, 1)),
        );
        // The binder is inlined, so the halving pattern is visible.
        assert_eq!(recognize(&input), cast(wide, halving_add(x, y)));
    }

    #[test]
    fn rake_rules_are_opt_in() {
        let x = var(Type::u8(8), "x");
        let y = var(Type::u8(8), "y");
        let input = expr::sub(
            max(x.clone(), y.clone()),
            min(x.clone(), y.clone()),
        );
        let mut plain = FindIntrinsics::new();
        plain.rake = false;
        assert_eq!(plain.mutate(&input), input);
        let mut raking = FindIntrinsics::new();
        raking.rake = true;
        assert_eq!(raking.mutate(&input), absd(x, y));
    }
}
