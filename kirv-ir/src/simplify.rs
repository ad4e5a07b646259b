//! Local algebraic cleanup.
//!
//! Just enough folding for the recognizer and lowerer to see through the
//! constants they introduce; this is not a general optimiser.
use crate::expr::{self, BinOp, CallOp, CmpOp, Expr};
use crate::ty::{wrap_to_type, Type, TypeCode};

/// Bottom-up constant folding and identity removal.
pub fn simplify(expr: &Expr) -> Expr {
    let expr = expr.map_children(&mut |child| simplify(child));
    fold(&expr).unwrap_or(expr)
}

fn fold(e: &Expr) -> Option<Expr> {
    match e {
        Expr::Binary { ty, op, a, b } => fold_binary(*ty, *op, a, b),
        Expr::Cmp { op, a, b, .. } => {
            let (ca, cb) = (a.const_int()?, b.const_int()?);
            let result = match op {
                CmpOp::Eq => ca == cb,
                CmpOp::Ne => ca != cb,
                CmpOp::Lt => ca < cb,
                CmpOp::Le => ca <= cb,
                CmpOp::Gt => ca > cb,
                CmpOp::Ge => ca >= cb,
            };
            Some(expr::const_of(e.ty(), result as i128))
        }
        Expr::Not { value, .. } => {
            let v = value.const_int()?;
            Some(expr::const_of(e.ty(), (v == 0) as i128))
        }
        Expr::Select {
            condition,
            true_value,
            false_value,
            ..
        } => match condition.const_int() {
            Some(0) => Some((**false_value).clone()),
            Some(_) => Some((**true_value).clone()),
            None => None,
        },
        Expr::Cast { ty, value } => fold_cast(*ty, value),
        Expr::Call { ty, op, args } => fold_call(*ty, op, args),
        _ => None,
    }
}

fn fold_binary(ty: Type, op: BinOp, a: &Expr, b: &Expr) -> Option<Expr> {
    if ty.is_int_or_uint() || ty.is_bool() {
        if let (Some(ca), Some(cb)) = (a.const_int(), b.const_int()) {
            let exact = match op {
                BinOp::Add => ca + cb,
                BinOp::Sub => ca - cb,
                BinOp::Mul => ca * cb,
                BinOp::Div => {
                    if cb == 0 {
                        return None;
                    }
                    div_floor(ca, cb)
                }
                BinOp::Mod => {
                    if cb == 0 {
                        return None;
                    }
                    mod_floor(ca, cb)
                }
                BinOp::Min => ca.min(cb),
                BinOp::Max => ca.max(cb),
                BinOp::And => ((ca != 0) && (cb != 0)) as i128,
                BinOp::Or => ((ca != 0) || (cb != 0)) as i128,
            };
            return Some(expr::const_of(ty, wrap_to_type(exact, ty)));
        }
    }
    // Identities; only ones that cannot change evaluation order or type.
    match op {
        BinOp::Add => {
            if b.is_const(0) {
                return Some(a.clone());
            }
            if a.is_const(0) {
                return Some(b.clone());
            }
        }
        BinOp::Sub => {
            if b.is_const(0) {
                return Some(a.clone());
            }
        }
        BinOp::Mul => {
            if b.is_const(1) {
                return Some(a.clone());
            }
            if a.is_const(1) {
                return Some(b.clone());
            }
            if (a.is_const(0) || b.is_const(0)) && a.is_pure() && b.is_pure() {
                return Some(expr::const_of(ty, 0));
            }
        }
        BinOp::Min => {
            if let (Some(c), Some(lo)) = (b.const_int(), ty.min_value()) {
                if c == lo && a.is_pure() {
                    return Some(b.clone());
                }
            }
            if let (Some(c), Some(hi)) = (b.const_int(), ty.max_value()) {
                if c == hi {
                    return Some(a.clone());
                }
            }
        }
        BinOp::Max => {
            if let (Some(c), Some(hi)) = (b.const_int(), ty.max_value()) {
                if c == hi && a.is_pure() {
                    return Some(b.clone());
                }
            }
            if let (Some(c), Some(lo)) = (b.const_int(), ty.min_value()) {
                if c == lo {
                    return Some(a.clone());
                }
            }
        }
        _ => {}
    }
    None
}

fn fold_cast(ty: Type, value: &Expr) -> Option<Expr> {
    match value {
        Expr::IntImm { value: v, .. } => Some(cast_const(ty, *v as i128)),
        Expr::UIntImm { value: v, .. } => Some(cast_const(ty, *v as i128)),
        Expr::FloatImm { value: v, .. } if ty.is_int_or_uint() => {
            Some(expr::const_of(ty, wrap_to_type(v.0 as i128, ty)))
        }
        Expr::FloatImm { value: v, .. } if ty.is_float() => {
            Some(expr::float_imm(ty.element_of(), v.0))
        }
        Expr::Broadcast { value, lanes, .. } => Some(expr::broadcast(
            simplify(&expr::cast(ty.element_of(), (**value).clone())),
            *lanes,
        )),
        _ => None,
    }
}

fn cast_const(ty: Type, v: i128) -> Expr {
    match ty.code() {
        TypeCode::Float => {
            let mut scalar = expr::float_imm(ty.element_of(), v as f64);
            if ty.is_vector() {
                scalar = expr::broadcast(scalar, ty.lanes());
            }
            scalar
        }
        _ => expr::const_of(ty, wrap_to_type(v, ty)),
    }
}

fn fold_call(ty: Type, op: &CallOp, args: &[Expr]) -> Option<Expr> {
    match op {
        CallOp::ShiftLeft | CallOp::ShiftRight => {
            let a = args[0].const_int()?;
            let mut s = args[1].const_int()?;
            if *op == CallOp::ShiftRight {
                s = -s;
            }
            if s.abs() >= 128 {
                return None;
            }
            let exact = if s >= 0 { a << s } else { a >> -s };
            Some(expr::const_of(ty, wrap_to_type(exact, ty)))
        }
        CallOp::Abs => {
            let a = args[0].const_int()?;
            Some(expr::const_of(ty, wrap_to_type(a.abs(), ty)))
        }
        _ => None,
    }
}

/// `-c` for a constant of the expression's type, when the negation is itself
/// representable. `None` for everything else.
pub fn negate_const(e: &Expr) -> Option<Expr> {
    let ty = e.ty();
    let c = e.const_int()?;
    let negated = -c;
    let lo = ty.min_value()?;
    let hi = ty.max_value()?;
    if negated < lo || negated > hi {
        return None;
    }
    Some(expr::const_of(ty, negated))
}

/// Division rounding toward negative infinity.
pub fn div_floor(a: i128, b: i128) -> i128 {
    let q = a / b;
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}
/// Remainder matching [`div_floor`]; its sign follows the divisor.
pub fn mod_floor(a: i128, b: i128) -> i128 {
    a - div_floor(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn folds_wrapping_arithmetic() {
        let ty = Type::u8(1);
        let e = uint_imm(ty, 200) + uint_imm(ty, 100);
        assert_eq!(simplify(&e), uint_imm(ty, 44));
    }

    #[test]
    fn folds_through_broadcast() {
        let ty = Type::i16(4);
        let e = const_of(ty, 10) * const_of(ty, 3);
        assert_eq!(simplify(&e), const_of(ty, 30));
    }

    #[test]
    fn removes_identities() {
        let ty = Type::i32(1);
        let x = var(ty, "x");
        assert_eq!(simplify(&(x.clone() + int_imm(ty, 0))), x);
        assert_eq!(simplify(&(x.clone() * int_imm(ty, 1))), x);
        assert_eq!(simplify(&sub(x.clone(), int_imm(ty, 0))), x);
    }

    #[test]
    fn folds_shifts() {
        let ty = Type::u16(1);
        let e = shift_right(uint_imm(ty, 0x100), uint_imm(ty, 4));
        assert_eq!(simplify(&e), uint_imm(ty, 0x10));
        let e = shift_left(uint_imm(ty, 3), uint_imm(ty, 2));
        assert_eq!(simplify(&e), uint_imm(ty, 12));
    }

    #[test]
    fn floor_division_matches_euclid_for_positive_divisors() {
        assert_eq!(div_floor(-7, 2), -4);
        assert_eq!(mod_floor(-7, 2), 1);
        assert_eq!(div_floor(7, 2), 3);
        assert_eq!(mod_floor(7, 2), 1);
    }

    #[test]
    fn negates_constants_with_range_check() {
        let ty = Type::i8(4);
        assert_eq!(
            negate_const(&const_of(ty, 3)),
            Some(const_of(ty, -3))
        );
        assert_eq!(negate_const(&const_of(ty, -128)), None);
    }
}
