//! Recognizer / lowerer round trips.
//!
//! For each intrinsic, lowering through the semantic reference path and
//! running recognition over the result must reproduce the original call,
//! and both lowering flavours must evaluate bit-exactly equal to the
//! intrinsic across sampled extremes of the operand types.
use kirv_ir::eval::Evaluator;
use kirv_ir::expr::{self, CallOp, Expr};
use kirv_ir::lower::{
    is_arithmetic_intrinsic, lower_intrinsic, lower_intrinsic_semantically,
    lower_intrinsics_fully,
};
use kirv_ir::recognize::find_intrinsics_expr;
use kirv_ir::simplify::simplify;
use kirv_ir::{Type, TypeCode};
use pretty_assertions::assert_eq;

fn round_trips(call: Expr) {
    let (op, args, ty) = match &call {
        Expr::Call { op, args, ty } => (op.clone(), args.clone(), *ty),
        _ => panic!("not a call"),
    };
    let lowered = lower_intrinsic_semantically(&op, &args, ty)
        .unwrap_or_else(|| panic!("{} has no semantic lowering", op));
    assert_eq!(lowered.ty(), ty, "{} lowering changed the type", op);
    let recognized = find_intrinsics_expr(&lowered);
    assert_eq!(recognized, call, "{} did not round trip", op);
}

fn edge_samples(ty: Type) -> Vec<i128> {
    let lo = ty.min_value().unwrap();
    let hi = ty.max_value().unwrap();
    let mut samples = vec![lo, lo + 1, -3, -1, 0, 1, 2, 3, hi / 2, hi - 1, hi];
    samples.retain(|v| *v >= lo && *v <= hi);
    samples.dedup();
    samples
}

/// Both lowering flavours evaluate bit-exactly like the intrinsic itself.
fn evaluates_bit_exactly(op: CallOp, operand_ty: Type, result_ty: Type) {
    for &x in &edge_samples(operand_ty) {
        for &y in &edge_samples(operand_ty) {
            let args = vec![
                expr::const_of(operand_ty, x),
                expr::const_of(operand_ty, y),
            ];
            let call = expr::call(result_ty, op.clone(), args.clone());
            let reference = eval_first_lane(&call);
            for lowered in &[
                lower_intrinsic(&op, &args, result_ty).unwrap(),
                lower_intrinsic_semantically(&op, &args, result_ty).unwrap(),
            ] {
                assert_eq!(
                    eval_first_lane(lowered),
                    reference,
                    "{} of {} and {} over {}",
                    op,
                    x,
                    y,
                    operand_ty
                );
            }
        }
    }
}

fn eval_first_lane(e: &Expr) -> i128 {
    let value = Evaluator::new().evaluate(&simplify(e)).unwrap();
    match &value.lanes[0] {
        kirv_ir::eval::Scalar::Int(v) => *v as i128,
        kirv_ir::eval::Scalar::UInt(v) => *v as i128,
        other => panic!("unexpected lane {:?}", other),
    }
}

#[test]
fn widening_ops_round_trip() {
    let x = expr::var(Type::i8(8), "x");
    let y = expr::var(Type::i8(8), "y");
    round_trips(expr::widening_add(x.clone(), y.clone()));
    round_trips(expr::widening_sub(x.clone(), y.clone()));
    round_trips(expr::widening_mul(x, y));

    let x = expr::var(Type::u16(4), "x");
    let y = expr::var(Type::u16(4), "y");
    round_trips(expr::widening_add(x.clone(), y.clone()));
    round_trips(expr::widening_mul(x, y));
}

#[test]
fn widen_right_ops_round_trip() {
    let x = expr::var(Type::i32(4), "x");
    let y = expr::var(Type::i16(4), "y");
    round_trips(expr::widen_right_add(x.clone(), y.clone()));
    round_trips(expr::widen_right_sub(x.clone(), y.clone()));
    round_trips(expr::widen_right_mul(x, y));
}

#[test]
fn saturating_ops_round_trip() {
    for ty in &[Type::u8(8), Type::i8(8), Type::i16(4)] {
        let x = expr::var(*ty, "x");
        let y = expr::var(*ty, "y");
        round_trips(expr::saturating_add(x.clone(), y.clone()));
        round_trips(expr::saturating_sub(x, y));
    }
}

#[test]
fn halving_ops_round_trip() {
    for ty in &[Type::u8(8), Type::i8(8)] {
        let x = expr::var(*ty, "x");
        let y = expr::var(*ty, "y");
        round_trips(expr::halving_add(x.clone(), y.clone()));
        round_trips(expr::halving_sub(x.clone(), y.clone()));
        round_trips(expr::rounding_halving_add(x, y));
    }
}

#[test]
fn multiply_shift_ops_round_trip() {
    let ty = Type::i16(4);
    let x = expr::var(ty, "x");
    let y = expr::var(ty, "y");
    let q = expr::const_of(ty, 14);
    round_trips(expr::mul_shift_right(x.clone(), y.clone(), q.clone()));
    round_trips(expr::rounding_mul_shift_right(x, y, q));
}

#[test]
fn rounding_shifts_round_trip() {
    let ty = Type::u8(8);
    let x = expr::var(ty, "x");
    round_trips(expr::rounding_shift_right(x, expr::const_of(ty, 3)));
    let ty = Type::i16(4);
    let x = expr::var(ty, "x");
    round_trips(expr::rounding_shift_right(x, expr::const_of(ty, 7)));
}

#[test]
fn widening_shifts_round_trip() {
    let ty = Type::u8(8);
    let x = expr::var(ty, "x");
    round_trips(expr::widening_shift_left(x.clone(), expr::const_of(ty, 3)));
    round_trips(expr::widening_shift_right(x, expr::const_of(ty, 2)));
}

#[test]
fn saturating_cast_round_trips() {
    let x = expr::var(Type::i16(4), "x");
    round_trips(expr::saturating_cast(Type::u8(4), x.clone()));
    round_trips(expr::saturating_cast(Type::i8(4), x));
    let x = expr::var(Type::u16(8), "x");
    round_trips(expr::saturating_cast(Type::u8(8), x));
}

#[test]
fn signed_absd_round_trips() {
    let x = expr::var(Type::i8(8), "x");
    let y = expr::var(Type::i8(8), "y");
    round_trips(expr::absd(x, y));
}

#[test]
fn lowering_flavours_evaluate_bit_exactly() {
    let pairs: Vec<(CallOp, Type)> = vec![
        (CallOp::SaturatingAdd, Type::i8(1)),
        (CallOp::SaturatingAdd, Type::u8(1)),
        (CallOp::SaturatingSub, Type::i8(1)),
        (CallOp::SaturatingSub, Type::u8(1)),
        (CallOp::HalvingAdd, Type::i8(1)),
        (CallOp::HalvingAdd, Type::u16(1)),
        (CallOp::HalvingSub, Type::i16(1)),
        (CallOp::RoundingHalvingAdd, Type::u8(1)),
        (CallOp::RoundingHalvingAdd, Type::i8(1)),
        (CallOp::SortedAvg, Type::i32(1)),
        (CallOp::AbsD, Type::i8(1)),
        (CallOp::AbsD, Type::u8(1)),
    ];
    for (op, ty) in pairs {
        let result_ty = match op {
            CallOp::AbsD if ty.is_int() => ty.with_code(TypeCode::UInt),
            _ => ty,
        };
        if op == CallOp::SortedAvg {
            // The precondition a <= b is part of the contract.
            for &x in &edge_samples(ty) {
                for &y in &edge_samples(ty) {
                    if x > y || (y - x) > ty.max_value().unwrap() {
                        continue;
                    }
                    let args = vec![expr::const_of(ty, x), expr::const_of(ty, y)];
                    let call = expr::call(ty, op.clone(), args.clone());
                    let reference = eval_first_lane(&call);
                    let lowered = lower_intrinsic(&op, &args, ty).unwrap();
                    assert_eq!(eval_first_lane(&lowered), reference, "sorted_avg({}, {})", x, y);
                }
            }
            continue;
        }
        evaluates_bit_exactly(op, ty, result_ty);
    }
}

#[test]
fn full_lowering_reaches_primitive_ops_only() {
    let ty = Type::i16(1);
    let call = expr::rounding_mul_shift_right(
        expr::const_of(ty, 30000),
        expr::const_of(ty, -12345),
        expr::const_of(ty, 15),
    );
    let lowered = lower_intrinsics_fully(&call);
    let mut remaining = false;
    fn scan(e: &Expr, remaining: &mut bool) {
        if let Expr::Call { op, .. } = e {
            if is_arithmetic_intrinsic(op) {
                *remaining = true;
            }
        }
        e.for_each_child(&mut |child| scan(child, remaining));
    }
    scan(&lowered, &mut remaining);
    assert!(!remaining, "arithmetic intrinsics survived full lowering");
    assert_eq!(eval_first_lane(&lowered), eval_first_lane(&call));
}

#[test]
fn widening_evaluation_never_wraps() {
    for ty in &[Type::i8(1), Type::u8(1), Type::i16(1), Type::u16(1)] {
        evaluates_bit_exactly(CallOp::WideningAdd, *ty, ty.widen());
        evaluates_bit_exactly(CallOp::WideningSub, *ty, ty.widen());
        evaluates_bit_exactly(CallOp::WideningMul, *ty, ty.widen());
    }
}
