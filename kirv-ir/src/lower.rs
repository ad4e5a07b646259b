//! Intrinsic lowering: expand named intrinsics into reference arithmetic.
//!
//! Two flavours per op. [`lower_intrinsic`] is the efficient path and may
//! exploit proven headroom; [`lower_intrinsic_semantically`] is the
//! reference path that goes through the widened type even when wasteful,
//! and is what the shader emitter uses for ops the target cannot express
//! directly. Both are bit-exact against the evaluator's definition of every
//! intrinsic, and the semantic forms are recognised back into the same
//! intrinsics by the recognizer.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::expr::{self, CallOp, Expr};
use crate::interval::BoundsCache;
use crate::ty::{Type, TypeCode};

fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}{}", prefix, COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn type_min(ty: Type) -> Expr {
    expr::const_of(ty, ty.min_value().expect("bounded type"))
}
fn type_max(ty: Type) -> Expr {
    expr::const_of(ty, ty.max_value().expect("bounded type"))
}

/// Whether `op` is one of the arithmetic intrinsics this module can expand.
pub fn is_arithmetic_intrinsic(op: &CallOp) -> bool {
    matches!(
        op,
        CallOp::WideningAdd
            | CallOp::WideningSub
            | CallOp::WideningMul
            | CallOp::WidenRightAdd
            | CallOp::WidenRightSub
            | CallOp::WidenRightMul
            | CallOp::WideningShiftLeft
            | CallOp::WideningShiftRight
            | CallOp::RoundingShiftLeft
            | CallOp::RoundingShiftRight
            | CallOp::SaturatingAdd
            | CallOp::SaturatingSub
            | CallOp::SaturatingCast
            | CallOp::HalvingAdd
            | CallOp::HalvingSub
            | CallOp::RoundingHalvingAdd
            | CallOp::MulShiftRight
            | CallOp::RoundingMulShiftRight
            | CallOp::Abs
            | CallOp::AbsD
            | CallOp::SortedAvg
    )
}

/// Efficient reference expansion. `None` when `op` is not an arithmetic
/// intrinsic, or when no expansion exists for the operand width.
pub fn lower_intrinsic(op: &CallOp, args: &[Expr], ty: Type) -> Option<Expr> {
    match op {
        CallOp::RoundingShiftRight => lower_rounding_shift(&args[0], &args[1], true),
        CallOp::RoundingShiftLeft => lower_rounding_shift(&args[0], &args[1], false),
        CallOp::SaturatingAdd if ty.bits() == 64 => Some(lower_saturating_add_64(&args[0], &args[1])),
        CallOp::SaturatingSub if ty.bits() == 64 => Some(lower_saturating_sub_64(&args[0], &args[1])),
        CallOp::HalvingAdd if ty.bits() == 64 => Some(lower_halving_64(&args[0], &args[1], Round::Down, false)),
        CallOp::RoundingHalvingAdd if ty.bits() == 64 => {
            Some(lower_halving_64(&args[0], &args[1], Round::HalfUp, false))
        }
        CallOp::HalvingSub if ty.bits() == 64 => Some(lower_halving_64(&args[0], &args[1], Round::Down, true)),
        CallOp::RoundingMulShiftRight
            if ty.bits() == 32 && ty.is_int() && args[2].is_const(31) =>
        {
            Some(lower_rounding_mul_shift_right_32(&args[0], &args[1]))
        }
        _ => lower_intrinsic_semantically(op, args, ty),
    }
}

/// Reference expansion through the widened type. `None` when `op` is not an
/// arithmetic intrinsic or cannot be widened (64-bit multiply-shifts).
pub fn lower_intrinsic_semantically(op: &CallOp, args: &[Expr], ty: Type) -> Option<Expr> {
    let lowered = match op {
        CallOp::WideningAdd => {
            expr::cast(ty, args[0].clone()) + expr::cast(ty, args[1].clone())
        }
        CallOp::WideningSub => {
            expr::sub(expr::cast(ty, args[0].clone()), expr::cast(ty, args[1].clone()))
        }
        CallOp::WideningMul => {
            expr::cast(ty, args[0].clone()) * expr::cast(ty, args[1].clone())
        }
        CallOp::WidenRightAdd => args[0].clone() + expr::cast(ty, args[1].clone()),
        CallOp::WidenRightSub => expr::sub(args[0].clone(), expr::cast(ty, args[1].clone())),
        CallOp::WidenRightMul => args[0].clone() * expr::cast(ty, args[1].clone()),
        CallOp::WideningShiftLeft => {
            expr::shift_left(expr::cast(ty, args[0].clone()), args[1].clone())
        }
        CallOp::WideningShiftRight => {
            expr::shift_right(expr::cast(ty, args[0].clone()), args[1].clone())
        }
        CallOp::RoundingShiftRight => lower_rounding_shift_wide(&args[0], &args[1], true)?,
        CallOp::RoundingShiftLeft => lower_rounding_shift_wide(&args[0], &args[1], false)?,
        CallOp::SaturatingAdd => {
            if ty.bits() == 64 {
                lower_saturating_add_64(&args[0], &args[1])
            } else {
                let wide = ty.widen();
                let sum = expr::cast(wide, args[0].clone()) + expr::cast(wide, args[1].clone());
                saturating_narrow(ty, sum)
            }
        }
        CallOp::SaturatingSub => {
            if ty.bits() == 64 {
                lower_saturating_sub_64(&args[0], &args[1])
            } else {
                let wide = widen_signed_for_sub(ty);
                let diff = expr::sub(
                    expr::cast(wide, args[0].clone()),
                    expr::cast(wide, args[1].clone()),
                );
                saturating_narrow(ty, diff)
            }
        }
        CallOp::SaturatingCast => lower_saturating_cast(ty, &args[0]),
        CallOp::HalvingAdd => {
            if ty.bits() == 64 {
                lower_halving_64(&args[0], &args[1], Round::Down, false)
            } else {
                let wide = ty.widen();
                let sum = expr::widening_add(args[0].clone(), args[1].clone());
                expr::cast(ty, expr::shift_right(sum, expr::const_of(wide, 1)))
            }
        }
        CallOp::RoundingHalvingAdd => {
            if ty.bits() == 64 {
                lower_halving_64(&args[0], &args[1], Round::HalfUp, false)
            } else {
                let wide = ty.widen();
                let sum = expr::widening_add(args[0].clone(), args[1].clone())
                    + expr::const_of(wide, 1);
                expr::cast(ty, expr::shift_right(sum, expr::const_of(wide, 1)))
            }
        }
        CallOp::HalvingSub => {
            if ty.bits() == 64 {
                lower_halving_64(&args[0], &args[1], Round::Down, true)
            } else {
                let wide = ty.widen();
                let diff = expr::widening_sub(args[0].clone(), args[1].clone());
                expr::cast(ty, expr::shift_right(diff, expr::const_of(wide, 1)))
            }
        }
        CallOp::MulShiftRight => {
            if ty.bits() == 64 {
                return None;
            }
            let product = expr::widening_mul(args[0].clone(), args[1].clone());
            expr::saturating_cast(ty, expr::shift_right(product, args[2].clone()))
        }
        CallOp::RoundingMulShiftRight => {
            if ty.bits() == 64 {
                return None;
            }
            let product = expr::widening_mul(args[0].clone(), args[1].clone());
            let shifted = expr::rounding_shift_right(product, args[2].clone());
            expr::saturating_cast(ty, shifted)
        }
        CallOp::Abs => lower_abs(&args[0]),
        CallOp::AbsD => {
            // The signed case goes through the canonical widened form; the
            // difference always fits the widened signed type.
            if args[0].ty().is_int() && args[0].ty().bits() < 64 {
                expr::cast(ty, expr::abs(expr::widening_sub(args[0].clone(), args[1].clone())))
            } else {
                lower_absd(&args[0], &args[1])
            }
        }
        CallOp::SortedAvg => {
            let (a, b) = (args[0].clone(), args[1].clone());
            let one = expr::const_of(ty, 1);
            a.clone() + expr::shift_right(expr::sub(b, a), one)
        }
        _ => return None,
    };
    Some(lowered)
}

/// Repeatedly expand arithmetic intrinsics until only primitive ops remain.
pub fn lower_intrinsics_fully(e: &Expr) -> Expr {
    let e = e.map_children(&mut |child| lower_intrinsics_fully(child));
    if let Expr::Call { ty, op, args } = &e {
        if is_arithmetic_intrinsic(op) {
            if let Some(lowered) = lower_intrinsic_semantically(op, args, *ty) {
                return lower_intrinsics_fully(&lowered);
            }
        }
    }
    e
}

enum Round {
    Down,
    HalfUp,
}

/// Integer division with round-toward-negative-infinity semantics, built
/// from the target's truncating division.
pub fn lower_int_div(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    if ty.is_uint() {
        return expr::div_round_to_zero(a.clone(), b.clone());
    }
    let zero = expr::const_of(ty, 0);
    let one = expr::const_of(ty, 1);
    let q_name = unique_name("div_q");
    let r_name = unique_name("div_r");
    let q = expr::var(ty, q_name.clone());
    let r = expr::var(ty, r_name.clone());
    // Truncation and floor differ exactly when the remainder is non-zero
    // and the signs of remainder and divisor disagree.
    let needs_fixup = expr::and(
        expr::ne(r.clone(), zero.clone()),
        expr::ne(
            expr::lt(r.clone(), zero.clone()),
            expr::lt(b.clone(), zero.clone()),
        ),
    );
    let fixed = expr::sub(q.clone(), expr::select(needs_fixup, one, zero));
    expr::let_in(
        q_name,
        expr::div_round_to_zero(a.clone(), b.clone()),
        expr::let_in(
            r_name,
            expr::mod_round_to_zero(a.clone(), b.clone()),
            fixed,
        ),
    )
}

/// Modulo matching [`lower_int_div`]; the result takes the divisor's sign.
pub fn lower_int_mod(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    if ty.is_uint() {
        return expr::mod_round_to_zero(a.clone(), b.clone());
    }
    let zero = expr::const_of(ty, 0);
    let r_name = unique_name("mod_r");
    let r = expr::var(ty, r_name.clone());
    let needs_fixup = expr::and(
        expr::ne(r.clone(), zero.clone()),
        expr::ne(
            expr::lt(r.clone(), zero.clone()),
            expr::lt(b.clone(), zero.clone()),
        ),
    );
    let fixed = r.clone() + expr::select(needs_fixup, b.clone(), zero);
    expr::let_in(r_name, expr::mod_round_to_zero(a.clone(), b.clone()), fixed)
}

/// Clamp a wide value into `ty`'s range, then cast. The uint path only needs
/// the bound that can actually be exceeded.
fn saturating_narrow(ty: Type, wide_value: Expr) -> Expr {
    let wide = wide_value.ty();
    let hi = expr::const_of(wide, ty.max_value().expect("bounded type"));
    let clamped = if ty.is_uint() && wide.is_uint() {
        expr::min(wide_value, hi)
    } else if ty.is_uint() {
        let lo = expr::const_of(wide, 0);
        expr::max(expr::min(wide_value, hi), lo)
    } else {
        let lo = expr::const_of(wide, ty.min_value().expect("bounded type"));
        expr::max(expr::min(wide_value, hi), lo)
    };
    expr::cast(ty, clamped)
}

// Subtracting unsigned values needs a signed intermediate to see below zero.
fn widen_signed_for_sub(ty: Type) -> Type {
    if ty.is_uint() {
        ty.widen().with_code(TypeCode::Int)
    } else {
        ty.widen()
    }
}

fn lower_saturating_cast(ty: Type, value: &Expr) -> Expr {
    let from = value.ty();
    if from == ty {
        return value.clone();
    }
    if from.is_float() && ty.is_float() {
        // Clamp infinities (and out-of-range finites) to the target's +-max.
        let cap = match ty.bits() {
            32 => f32::MAX as f64,
            _ => f64::MAX,
        };
        let hi = float_const(from, cap);
        let lo = float_const(from, -cap);
        return expr::cast(ty, expr::max(expr::min(value.clone(), hi), lo));
    }
    if from.is_float() {
        // The minimum is exactly representable, so clamp it with max; the
        // maximum may not be, so saturate the top with a select.
        let lo = float_const(from, ty.min_value().expect("bounded type") as f64);
        let hi = float_const(from, ty.max_value().expect("bounded type") as f64);
        let name = unique_name("sat_f");
        let clamped_lo = expr::var(from, name.clone());
        let result = expr::select(
            expr::ge(clamped_lo.clone(), hi),
            type_max(ty),
            expr::cast(ty, clamped_lo.clone()),
        );
        return expr::let_in(name, expr::max(value.clone(), lo), result);
    }
    if ty.is_float() {
        return expr::cast(ty, value.clone());
    }
    if ty.can_represent(from) {
        return expr::cast(ty, value.clone());
    }
    // Integer to integer: clamp only the sides the source can overrun.
    let mut clamped = value.clone();
    let from_lo = from.min_value().expect("bounded type");
    let from_hi = from.max_value().expect("bounded type");
    let to_lo = ty.min_value().expect("bounded type");
    let to_hi = ty.max_value().expect("bounded type");
    if to_hi < from_hi {
        clamped = expr::min(clamped, expr::const_of(from, to_hi));
    }
    if to_lo > from_lo {
        clamped = expr::max(clamped, expr::const_of(from, to_lo));
    }
    expr::cast(ty, clamped)
}

fn float_const(ty: Type, value: f64) -> Expr {
    let scalar = expr::float_imm(ty.element_of(), value);
    expr::broadcast(scalar, ty.lanes())
}

/// Rounding shifts, efficient path. `right` selects the canonical
/// direction; the other op is the same with a negated amount.
fn lower_rounding_shift(a: &Expr, b: &Expr, right: bool) -> Option<Expr> {
    let ty = a.ty();
    if let Some(c) = b.const_int() {
        let c = if right { c } else { -c };
        // Shifting out of the canonical direction never discards bits.
        if c <= 0 {
            return Some(expr::shift_left(a.clone(), shift_amount(b.ty(), -c)));
        }
        let round = 1i128 << (c - 1);
        if round <= ty.max_value()? {
            // Headroom: the round term must not push the value out of range.
            let mut bounds = BoundsCache::new();
            if bounds.upper_bounded(a, ty.max_value()? - round) {
                let sum = a.clone() + expr::const_of(ty, round);
                return Some(expr::shift_right(sum, shift_amount(b.ty(), c)));
            }
        }
        if c == 1 {
            // floor((a + 1) / 2) == a/2 + a%2, overflow-free.
            let two = expr::const_of(ty, 2);
            let one = expr::const_of(ty, 1);
            return Some(
                expr::shift_right(a.clone(), one) + expr::modulo(a.clone(), two),
            );
        }
        // Branchless correction: shift almost all the way, round the last
        // bit separately. Exact for c >= 2 and cannot overflow.
        let one = expr::const_of(ty, 1);
        let pre = expr::shift_right(a.clone(), shift_amount(b.ty(), c - 1));
        return Some(expr::shift_right(pre + one, shift_amount(b.ty(), 1)));
    }
    lower_rounding_shift_wide(a, b, right)
}

/// Rounding shifts through the widened type; the fallback for unknown
/// amounts and the semantic reference form.
fn lower_rounding_shift_wide(a: &Expr, b: &Expr, right: bool) -> Option<Expr> {
    let ty = a.ty();
    let amount_ty = b.ty();
    let toward_right = if right {
        b.clone()
    } else {
        crate::simplify::simplify(&expr::sub(expr::const_of(amount_ty, 0), b.clone()))
    };
    if ty.bits() == 64 {
        return Some(lower_rounding_shift_select(a, &toward_right));
    }
    if let Some(c) = toward_right.const_int() {
        if c > 0 {
            let round = 1i128 << (c - 1);
            if round <= ty.max_value()? {
                // The canonical recognisable form: the widening add gives
                // the round term headroom by construction.
                let sum = expr::widening_add(a.clone(), expr::const_of(ty, round));
                return Some(expr::cast(
                    ty,
                    expr::shift_right(sum, shift_amount(amount_ty, c)),
                ));
            }
        }
    }
    // Unknown amount: carry everything in the wide type, where
    // (1 << max(b, 0)) >> 1 is 2^(b-1) for b > 0 and zero otherwise.
    let wide = ty.widen();
    let one = expr::const_of(wide, 1);
    let zero = expr::const_of(amount_ty, 0);
    let round = expr::shift_right(
        expr::shift_left(one, expr::max(toward_right.clone(), zero)),
        expr::const_of(amount_ty, 1),
    );
    let sum = expr::cast(wide, a.clone()) + round;
    Some(expr::cast(ty, expr::shift_right(sum, toward_right)))
}

/// 64-bit rounding right shift: no headroom anywhere, so pick the exact
/// correction per amount with selects.
fn lower_rounding_shift_select(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    let amount_ty = b.ty();
    let zero = expr::const_of(amount_ty, 0);
    let one_b = expr::const_of(amount_ty, 1);
    let one = expr::const_of(ty, 1);
    let two = expr::const_of(ty, 2);
    let shift_left_arm = expr::shift_left(a.clone(), expr::sub(zero.clone(), b.clone()));
    let by_one = expr::shift_right(a.clone(), one_b.clone()) + expr::modulo(a.clone(), two);
    let general = expr::shift_right(
        expr::shift_right(a.clone(), expr::sub(b.clone(), one_b.clone())) + one,
        one_b.clone(),
    );
    expr::select(
        expr::le(b.clone(), zero.clone()),
        shift_left_arm,
        expr::select(expr::eq(b.clone(), one_b), by_one, general),
    )
}

fn lower_saturating_add_64(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    if ty.is_uint() {
        let name = unique_name("sat_sum");
        let sum = expr::var(ty, name.clone());
        let body = expr::select(
            expr::lt(sum.clone(), a.clone()),
            type_max(ty),
            sum.clone(),
        );
        return expr::let_in(name, a.clone() + b.clone(), body);
    }
    let zero = expr::const_of(ty, 0);
    let pos_over = expr::and(
        expr::gt(b.clone(), zero.clone()),
        expr::gt(a.clone(), expr::sub(type_max(ty), b.clone())),
    );
    let neg_over = expr::and(
        expr::lt(b.clone(), zero.clone()),
        expr::lt(a.clone(), expr::sub(type_min(ty), b.clone())),
    );
    expr::select(
        pos_over,
        type_max(ty),
        expr::select(neg_over, type_min(ty), a.clone() + b.clone()),
    )
}

fn lower_saturating_sub_64(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    if ty.is_uint() {
        let zero = expr::const_of(ty, 0);
        return expr::select(
            expr::lt(a.clone(), b.clone()),
            zero,
            expr::sub(a.clone(), b.clone()),
        );
    }
    let zero = expr::const_of(ty, 0);
    let pos_over = expr::and(
        expr::lt(b.clone(), zero.clone()),
        expr::gt(a.clone(), type_max(ty) + b.clone()),
    );
    let neg_over = expr::and(
        expr::gt(b.clone(), zero.clone()),
        expr::lt(a.clone(), type_min(ty) + b.clone()),
    );
    expr::select(
        pos_over,
        type_max(ty),
        expr::select(neg_over, type_min(ty), expr::sub(a.clone(), b.clone())),
    )
}

/// Width-independent halving built from parity bits; the only choice at 64
/// bits where no wider type exists.
fn lower_halving_64(a: &Expr, b: &Expr, round: Round, subtract: bool) -> Expr {
    let ty = a.ty();
    let one = expr::const_of(ty, 1);
    let two = expr::const_of(ty, 2);
    let ha = expr::shift_right(a.clone(), one.clone());
    let hb = expr::shift_right(b.clone(), one.clone());
    let pa = expr::modulo(a.clone(), two.clone());
    let pb = expr::modulo(b.clone(), two.clone());
    if subtract {
        // floor((a - b) / 2) loses one exactly when only b is odd.
        let borrow = expr::max(expr::sub(pb, pa), expr::const_of(ty, 0));
        return expr::sub(expr::sub(ha, hb), borrow);
    }
    let carry = match round {
        Round::Down => pa * pb,
        Round::HalfUp => expr::min(pa + pb, one),
    };
    ha + hb + carry
}

fn lower_abs(a: &Expr) -> Expr {
    let ty = a.ty();
    if ty.is_float() {
        let zero = float_const(ty, 0.0);
        return expr::select(
            expr::lt(a.clone(), zero.clone()),
            expr::sub(zero, a.clone()),
            a.clone(),
        );
    }
    if ty.is_uint() {
        return a.clone();
    }
    // Negate in the unsigned type so |min| is representable.
    let uty = ty.with_code(TypeCode::UInt);
    let ua = expr::reinterpret(uty, a.clone());
    let zero = expr::const_of(ty, 0);
    expr::select(
        expr::lt(a.clone(), zero),
        expr::sub(expr::const_of(uty, 0), ua.clone()),
        ua,
    )
}

/// `|a - b|` without overflow: modular difference in the unsigned type,
/// direction picked by a signed comparison.
fn lower_absd(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    let uty = if ty.is_int() {
        ty.with_code(TypeCode::UInt)
    } else {
        ty
    };
    let ua = expr::reinterpret(uty, a.clone());
    let ub = expr::reinterpret(uty, b.clone());
    expr::select(
        expr::lt(a.clone(), b.clone()),
        expr::sub(ub.clone(), ua.clone()),
        expr::sub(ua, ub),
    )
}

fn shift_amount(ty: Type, amount: i128) -> Expr {
    if amount >= ty.min_value().unwrap_or(i128::MIN)
        && amount <= ty.max_value().unwrap_or(i128::MAX)
    {
        expr::const_of(ty, amount)
    } else {
        expr::const_of(ty.with_code(TypeCode::UInt), amount)
    }
}

/// `rounding_mul_shift_right(a, b, 31)` on i32 without 64-bit arithmetic:
/// split at 16 bits, three partial products, `halving_add` absorbs the
/// rounding term, `saturating_add` finishes.
fn lower_rounding_mul_shift_right_32(a: &Expr, b: &Expr) -> Expr {
    let ty = a.ty();
    let uty = ty.with_code(TypeCode::UInt);
    let c16 = expr::const_of(ty, 16);
    let c65536 = expr::const_of(ty, 65536);

    let names: Vec<String> = ["mul_ah", "mul_al", "mul_bh", "mul_bl"]
        .iter()
        .map(|p| unique_name(p))
        .collect();
    let ah = expr::var(ty, names[0].clone());
    let al = expr::var(ty, names[1].clone());
    let bh = expr::var(ty, names[2].clone());
    let bl = expr::var(ty, names[3].clone());

    // Low x low computed unsigned; only its top half survives the shift.
    let low_product = expr::cast(uty, al.clone()) * expr::cast(uty, bl.clone());
    let low_carry = expr::cast(
        ty,
        expr::shift_right(low_product, expr::const_of(uty, 16)),
    );
    let hh = ah.clone() * bh.clone();
    let cross_a = ah.clone() * bl.clone();
    let cross_b = al.clone() * bh.clone() + low_carry + expr::const_of(ty, 16384);
    let mid = expr::shift_right(
        expr::halving_add(cross_a, cross_b),
        expr::const_of(ty, 14),
    );
    let hh_name = unique_name("mul_hh");
    let hh_var = expr::var(ty, hh_name.clone());
    let combined = expr::let_in(
        hh_name,
        hh,
        expr::saturating_add(
            expr::saturating_add(hh_var.clone(), hh_var),
            mid,
        ),
    );

    let body = expr::let_in(
        names[3].clone(),
        expr::modulo(b.clone(), c65536.clone()),
        combined,
    );
    let body = expr::let_in(names[2].clone(), expr::shift_right(b.clone(), c16.clone()), body);
    let body = expr::let_in(names[1].clone(), expr::modulo(a.clone(), c65536), body);
    expr::let_in(names[0].clone(), expr::shift_right(a.clone(), c16), body)
}
