//! Reference interpreter.
//!
//! Evaluates pure expressions lane by lane, with integer arithmetic carried
//! in `i128` so every intrinsic can be computed by its mathematical
//! definition. The property tests compare intrinsics against their
//! lowerings through this interpreter, bit-exactly.
use fnv::FnvHashMap as HashMap;

use crate::error::{anyhow, bail, Error, Result};
use crate::expr::{BinOp, CallOp, CmpOp, Expr};
use crate::simplify::{div_floor, mod_floor};
use crate::ty::{wrap_to_type, Type, TypeCode};

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

/// A fully evaluated, possibly vector, value.
#[derive(Clone, PartialEq, Debug)]
pub struct Value {
    pub ty: Type,
    pub lanes: Vec<Scalar>,
}

impl Value {
    pub fn scalar(ty: Type, lane: Scalar) -> Value {
        debug_assert!(ty.is_scalar());
        Value {
            ty,
            lanes: vec![lane],
        }
    }

    pub fn from_int(ty: Type, value: i128) -> Value {
        let lanes = vec![int_scalar(ty, value); ty.lanes() as usize];
        Value { ty, lanes }
    }

    /// The single lane of a scalar value as a wide integer.
    pub fn as_int(&self) -> Result<i128> {
        if self.lanes.len() != 1 {
            bail!("expected a scalar value, got {} lanes", self.lanes.len());
        }
        scalar_int(&self.lanes[0])
    }
}

fn int_scalar(ty: Type, value: i128) -> Scalar {
    let wrapped = wrap_to_type(value, ty);
    match ty.code() {
        TypeCode::Int => Scalar::Int(wrapped as i64),
        TypeCode::UInt => Scalar::UInt(wrapped as u64),
        TypeCode::Bool => Scalar::Bool(wrapped != 0),
        _ => panic!("int_scalar on {}", ty),
    }
}

fn scalar_int(scalar: &Scalar) -> Result<i128> {
    match scalar {
        Scalar::Int(x) => Ok(*x as i128),
        Scalar::UInt(x) => Ok(*x as i128),
        Scalar::Bool(x) => Ok(*x as i128),
        Scalar::Float(_) => Err(anyhow!("expected an integer lane")),
    }
}

fn scalar_float(scalar: &Scalar) -> Result<f64> {
    match scalar {
        Scalar::Float(x) => Ok(*x),
        _ => Err(anyhow!("expected a float lane")),
    }
}

/// Round an `f64` intermediate to the precision of the result type.
fn round_float(ty: Type, value: f64) -> f64 {
    if ty.bits() == 32 {
        value as f32 as f64
    } else {
        value
    }
}

fn unevaluable(what: &Expr) -> Error {
    anyhow!("expression is not evaluable: {}", what)
}

/// Expression interpreter with a variable environment.
#[derive(Default)]
pub struct Evaluator {
    env: HashMap<String, Value>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.env.insert(name.into(), value);
        self
    }

    pub fn evaluate(&mut self, expr: &Expr) -> Result<Value> {
        let ty = expr.ty();
        match expr {
            Expr::IntImm { value, .. } => Ok(Value::scalar(ty, Scalar::Int(*value))),
            Expr::UIntImm { value, .. } => {
                if ty.is_bool() {
                    Ok(Value::scalar(ty, Scalar::Bool(*value != 0)))
                } else {
                    Ok(Value::scalar(ty, Scalar::UInt(*value)))
                }
            }
            Expr::FloatImm { value, .. } => Ok(Value::scalar(ty, Scalar::Float(value.0))),
            Expr::StringImm { .. } => Err(unevaluable(expr)),
            Expr::Var { name, .. } => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("unbound variable {}", name)),
            Expr::Cast { ty, value } => {
                let inner = self.evaluate(value)?;
                cast_value(*ty, &inner)
            }
            Expr::Reinterpret { ty, value } => {
                let inner = self.evaluate(value)?;
                reinterpret_value(*ty, &inner)
            }
            Expr::Binary { ty, op, a, b } => {
                let va = self.evaluate(a)?;
                let vb = self.evaluate(b)?;
                lanewise2(*ty, &va, &vb, |x, y| binary_scalar(*ty, *op, x, y))
            }
            Expr::Cmp { op, a, b, .. } => {
                let va = self.evaluate(a)?;
                let vb = self.evaluate(b)?;
                lanewise2(ty, &va, &vb, |x, y| compare_scalar(*op, x, y))
            }
            Expr::Not { value, .. } => {
                let inner = self.evaluate(value)?;
                let lanes = inner
                    .lanes
                    .iter()
                    .map(|lane| match lane {
                        Scalar::Bool(b) => Ok(Scalar::Bool(!b)),
                        _ => Err(anyhow!("not on a non-bool lane")),
                    })
                    .collect::<Result<_>>()?;
                Ok(Value { ty, lanes })
            }
            Expr::Select {
                condition,
                true_value,
                false_value,
                ..
            } => {
                let vc = self.evaluate(condition)?;
                let vt = self.evaluate(true_value)?;
                let vf = self.evaluate(false_value)?;
                let lanes = vc
                    .lanes
                    .iter()
                    .zip(vt.lanes.iter().zip(vf.lanes.iter()))
                    .map(|(c, (t, f))| match c {
                        Scalar::Bool(true) => Ok(*t),
                        Scalar::Bool(false) => Ok(*f),
                        _ => Err(anyhow!("select condition is not boolean")),
                    })
                    .collect::<Result<_>>()?;
                Ok(Value { ty, lanes })
            }
            Expr::Ramp {
                base,
                stride,
                lanes,
                ..
            } => {
                let vb = self.evaluate(base)?.as_int()?;
                let vs = self.evaluate(stride)?.as_int()?;
                let elem = ty.element_of();
                let lanes = (0..*lanes as i128)
                    .map(|i| int_scalar(elem, vb + vs * i))
                    .collect();
                Ok(Value { ty, lanes })
            }
            Expr::Broadcast { value, lanes, .. } => {
                let inner = self.evaluate(value)?;
                Ok(Value {
                    ty,
                    lanes: vec![inner.lanes[0]; *lanes as usize],
                })
            }
            Expr::Shuffle {
                vectors, indices, ..
            } => {
                let mut pool = Vec::new();
                for vector in vectors {
                    pool.extend(self.evaluate(vector)?.lanes);
                }
                let lanes = indices
                    .iter()
                    .map(|i| {
                        pool.get(*i as usize)
                            .copied()
                            .ok_or_else(|| anyhow!("shuffle index {} out of range", i))
                    })
                    .collect::<Result<_>>()?;
                Ok(Value { ty, lanes })
            }
            Expr::Let {
                name, value, body, ..
            } => {
                let bound = self.evaluate(value)?;
                let shadowed = self.env.insert(name.clone(), bound);
                let result = self.evaluate(body);
                match shadowed {
                    Some(old) => {
                        self.env.insert(name.clone(), old);
                    }
                    None => {
                        self.env.remove(name);
                    }
                }
                result
            }
            Expr::Call { ty, op, args } => self.call(*ty, op, args),
            Expr::Load { .. } => Err(unevaluable(expr)),
        }
    }

    fn call(&mut self, ty: Type, op: &CallOp, args: &[Expr]) -> Result<Value> {
        // The value-selecting ops evaluate lazily.
        if let CallOp::IfThenElse = op {
            let condition = self.evaluate(&args[0])?;
            return match condition.lanes[0] {
                Scalar::Bool(true) => self.evaluate(&args[1]),
                Scalar::Bool(false) => self.evaluate(&args[2]),
                _ => Err(anyhow!("if_then_else condition is not boolean")),
            };
        }

        let values = args
            .iter()
            .map(|arg| self.evaluate(arg))
            .collect::<Result<Vec<_>>>()?;

        match op {
            CallOp::IsNan | CallOp::IsInf => {
                let lanes = values[0]
                    .lanes
                    .iter()
                    .map(|lane| {
                        let x = scalar_float(lane)?;
                        Ok(Scalar::Bool(match op {
                            CallOp::IsNan => x.is_nan(),
                            _ => x.is_infinite(),
                        }))
                    })
                    .collect::<Result<_>>()?;
                return Ok(Value { ty, lanes });
            }
            CallOp::SaturatingCast if values[0].ty.is_float() => {
                return saturating_cast_float(ty, &values[0]);
            }
            CallOp::Extern(name) => bail!("extern call {} is not evaluable", name),
            CallOp::GpuThreadBarrier => bail!("gpu_thread_barrier is not evaluable"),
            _ => {}
        }

        let n = ty.lanes() as usize;
        let mut lanes = Vec::with_capacity(n);
        for lane in 0..n {
            let mut arg_of = |i: usize| -> Result<i128> {
                let value: &Value = &values[i];
                let index = if value.lanes.len() == 1 { 0 } else { lane };
                scalar_int(&value.lanes[index])
            };
            let result = intrinsic_lane(ty, op, &mut arg_of)?;
            lanes.push(result);
        }
        Ok(Value { ty, lanes })
    }
}

/// One lane of an arithmetic intrinsic, by its mathematical definition.
fn intrinsic_lane(
    ty: Type,
    op: &CallOp,
    arg: &mut dyn FnMut(usize) -> Result<i128>,
) -> Result<Scalar> {
    let elem = ty.element_of();
    let wrapped = |x: i128| Ok(int_scalar(elem, x));
    let saturated = |x: i128| {
        let lo = ty.min_value().ok_or_else(|| anyhow!("saturating on {}", ty))?;
        let hi = ty.max_value().ok_or_else(|| anyhow!("saturating on {}", ty))?;
        Ok(int_scalar(elem, x.clamp(lo, hi)))
    };
    match op {
        CallOp::ShiftLeft => wrapped(shift(arg(0)?, arg(1)?)),
        CallOp::ShiftRight => wrapped(shift(arg(0)?, -arg(1)?)),
        CallOp::WideningAdd | CallOp::WidenRightAdd => wrapped(arg(0)? + arg(1)?),
        CallOp::WideningSub | CallOp::WidenRightSub => wrapped(arg(0)? - arg(1)?),
        CallOp::WideningMul | CallOp::WidenRightMul => wrapped(arg(0)? * arg(1)?),
        CallOp::WideningShiftLeft => wrapped(shift(arg(0)?, arg(1)?)),
        CallOp::WideningShiftRight => wrapped(shift(arg(0)?, -arg(1)?)),
        CallOp::RoundingShiftLeft => wrapped(rounding_shift(arg(0)?, arg(1)?)),
        CallOp::RoundingShiftRight => wrapped(rounding_shift(arg(0)?, -arg(1)?)),
        CallOp::SaturatingAdd => saturated(arg(0)? + arg(1)?),
        CallOp::SaturatingSub => saturated(arg(0)? - arg(1)?),
        CallOp::SaturatingCast => saturated(arg(0)?),
        CallOp::HalvingAdd => wrapped((arg(0)? + arg(1)?) >> 1),
        CallOp::HalvingSub => wrapped((arg(0)? - arg(1)?) >> 1),
        CallOp::RoundingHalvingAdd => wrapped((arg(0)? + arg(1)? + 1) >> 1),
        CallOp::MulShiftRight => {
            let q = arg(2)?;
            if !(0..128).contains(&q) {
                bail!("mul_shift_right by {}", q);
            }
            saturated((arg(0)? * arg(1)?) >> q)
        }
        CallOp::RoundingMulShiftRight => {
            let q = arg(2)?;
            if !(0..128).contains(&q) {
                bail!("rounding_mul_shift_right by {}", q);
            }
            let round = if q > 0 { 1i128 << (q - 1) } else { 0 };
            saturated((arg(0)? * arg(1)? + round) >> q)
        }
        CallOp::Abs => wrapped(arg(0)?.abs()),
        CallOp::AbsD => wrapped((arg(0)? - arg(1)?).abs()),
        CallOp::SortedAvg => {
            let (a, b) = (arg(0)?, arg(1)?);
            wrapped(a + ((b - a) >> 1))
        }
        CallOp::DivRoundToZero => {
            let d = arg(1)?;
            if d == 0 {
                bail!("division by zero");
            }
            wrapped(arg(0)? / d)
        }
        CallOp::ModRoundToZero => {
            let d = arg(1)?;
            if d == 0 {
                bail!("division by zero");
            }
            wrapped(arg(0)? % d)
        }
        _ => Err(anyhow!("cannot evaluate {} as {}", op, ty)),
    }
}

fn shift(x: i128, amount: i128) -> i128 {
    if amount >= 0 {
        if amount >= 128 {
            0
        } else {
            x.wrapping_shl(amount as u32)
        }
    } else if amount <= -128 {
        if x < 0 {
            -1
        } else {
            0
        }
    } else {
        x >> (-amount) as u32
    }
}

/// Shift with round-half-away-from-zero at the discarded bit; negative
/// amounts reverse direction.
fn rounding_shift(x: i128, amount: i128) -> i128 {
    if amount >= 0 {
        shift(x, amount)
    } else {
        let s = -amount;
        shift(x + (1i128 << (s - 1)), -s)
    }
}

fn binary_scalar(ty: Type, op: BinOp, a: &Scalar, b: &Scalar) -> Result<Scalar> {
    if ty.is_float() {
        let (x, y) = (scalar_float(a)?, scalar_float(b)?);
        let exact = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Mod => x - (x / y).floor() * y,
            BinOp::Min => x.min(y),
            BinOp::Max => x.max(y),
            _ => bail!("{:?} on floats", op),
        };
        return Ok(Scalar::Float(round_float(ty, exact)));
    }
    if let (Scalar::Bool(x), Scalar::Bool(y)) = (a, b) {
        return match op {
            BinOp::And => Ok(Scalar::Bool(*x && *y)),
            BinOp::Or => Ok(Scalar::Bool(*x || *y)),
            BinOp::Min => Ok(Scalar::Bool(*x && *y)),
            BinOp::Max => Ok(Scalar::Bool(*x || *y)),
            _ => Err(anyhow!("{:?} on booleans", op)),
        };
    }
    let (x, y) = (scalar_int(a)?, scalar_int(b)?);
    let exact = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0 {
                bail!("division by zero");
            }
            div_floor(x, y)
        }
        BinOp::Mod => {
            if y == 0 {
                bail!("division by zero");
            }
            mod_floor(x, y)
        }
        BinOp::Min => x.min(y),
        BinOp::Max => x.max(y),
        BinOp::And | BinOp::Or => bail!("{:?} on integers", op),
    };
    Ok(int_scalar(ty.element_of(), exact))
}

fn compare_scalar(op: CmpOp, a: &Scalar, b: &Scalar) -> Result<Scalar> {
    let ordering = match (a, b) {
        (Scalar::Float(x), Scalar::Float(y)) => x
            .partial_cmp(y)
            .ok_or_else(|| anyhow!("comparison with NaN"))?,
        _ => scalar_int(a)?.cmp(&scalar_int(b)?),
    };
    let result = match op {
        CmpOp::Eq => ordering == std::cmp::Ordering::Equal,
        CmpOp::Ne => ordering != std::cmp::Ordering::Equal,
        CmpOp::Lt => ordering == std::cmp::Ordering::Less,
        CmpOp::Le => ordering != std::cmp::Ordering::Greater,
        CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
        CmpOp::Ge => ordering != std::cmp::Ordering::Less,
    };
    Ok(Scalar::Bool(result))
}

fn lanewise2(
    ty: Type,
    a: &Value,
    b: &Value,
    mut f: impl FnMut(&Scalar, &Scalar) -> Result<Scalar>,
) -> Result<Value> {
    if a.lanes.len() != b.lanes.len() {
        bail!("lane count mismatch: {} vs {}", a.lanes.len(), b.lanes.len());
    }
    let lanes = a
        .lanes
        .iter()
        .zip(b.lanes.iter())
        .map(|(x, y)| f(x, y))
        .collect::<Result<_>>()?;
    Ok(Value { ty, lanes })
}

fn cast_value(ty: Type, value: &Value) -> Result<Value> {
    let elem = ty.element_of();
    let lanes = value
        .lanes
        .iter()
        .map(|lane| cast_scalar(elem, value.ty.element_of(), lane))
        .collect::<Result<_>>()?;
    Ok(Value { ty, lanes })
}

fn cast_scalar(to: Type, from: Type, lane: &Scalar) -> Result<Scalar> {
    match (to.code(), from.code()) {
        (TypeCode::Float, TypeCode::Float) => {
            Ok(Scalar::Float(round_float(to, scalar_float(lane)?)))
        }
        (TypeCode::Float, _) => Ok(Scalar::Float(round_float(to, scalar_int(lane)? as f64))),
        (_, TypeCode::Float) => {
            let x = scalar_float(lane)?;
            if !x.is_finite() {
                bail!("float-to-int cast of a non-finite value");
            }
            Ok(int_scalar(to, x.trunc() as i128))
        }
        _ => Ok(int_scalar(to, scalar_int(lane)?)),
    }
}

fn reinterpret_value(ty: Type, value: &Value) -> Result<Value> {
    let elem = ty.element_of();
    let bits = ty.bits();
    let lanes = value
        .lanes
        .iter()
        .map(|lane| {
            let raw: u64 = match lane {
                Scalar::Int(x) => *x as u64,
                Scalar::UInt(x) => *x,
                Scalar::Bool(x) => *x as u64,
                Scalar::Float(x) if bits == 32 => (*x as f32).to_bits() as u64,
                Scalar::Float(x) => x.to_bits(),
            };
            Ok(match elem.code() {
                TypeCode::Float if bits == 32 => Scalar::Float(f32::from_bits(raw as u32) as f64),
                TypeCode::Float => Scalar::Float(f64::from_bits(raw)),
                _ => int_scalar(elem, raw as i128),
            })
        })
        .collect::<Result<_>>()?;
    Ok(Value { ty, lanes })
}

fn saturating_cast_float(ty: Type, value: &Value) -> Result<Value> {
    let elem = ty.element_of();
    let lanes = value
        .lanes
        .iter()
        .map(|lane| {
            let x = scalar_float(lane)?;
            if elem.is_float() {
                let cap = match elem.bits() {
                    32 => f32::MAX as f64,
                    _ => f64::MAX,
                };
                return Ok(Scalar::Float(round_float(elem, x.clamp(-cap, cap))));
            }
            let lo = elem.min_value().unwrap() as f64;
            let hi = elem.max_value().unwrap() as f64;
            let clamped = x.clamp(lo, hi).trunc() as i128;
            let lo_i = elem.min_value().unwrap();
            let hi_i = elem.max_value().unwrap();
            Ok(int_scalar(elem, clamped.clamp(lo_i, hi_i)))
        })
        .collect::<Result<_>>()?;
    Ok(Value { ty, lanes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::*;

    fn eval(e: &Expr) -> Value {
        Evaluator::new().evaluate(e).unwrap()
    }

    #[test]
    fn saturating_add_clamps() {
        let u8 = Type::u8(1);
        let e = saturating_add(uint_imm(u8, 200), uint_imm(u8, 100));
        assert_eq!(eval(&e).as_int().unwrap(), 255);
        let i8 = Type::i8(1);
        let e = saturating_add(int_imm(i8, 120), int_imm(i8, 20));
        assert_eq!(eval(&e).as_int().unwrap(), 127);
    }

    #[test]
    fn rounding_mul_shift_right_matches_reference() {
        let i16 = Type::i16(1);
        let e = rounding_mul_shift_right(
            int_imm(i16, 30000),
            int_imm(i16, 30000),
            uint_imm(Type::u16(1), 15),
        );
        assert_eq!(eval(&e).as_int().unwrap(), 27466);
    }

    #[test]
    fn halving_ops_round_toward_negative_infinity() {
        let i8 = Type::i8(1);
        let e = halving_add(int_imm(i8, -3), int_imm(i8, 0));
        assert_eq!(eval(&e).as_int().unwrap(), -2);
        let e = rounding_halving_add(int_imm(i8, -3), int_imm(i8, 0));
        assert_eq!(eval(&e).as_int().unwrap(), -1);
    }

    #[test]
    fn widening_ops_do_not_wrap() {
        let u8 = Type::u8(1);
        let e = widening_add(uint_imm(u8, 255), uint_imm(u8, 255));
        let v = eval(&e);
        assert_eq!(v.ty, Type::u16(1));
        assert_eq!(v.as_int().unwrap(), 510);
    }

    #[test]
    fn absd_is_unsigned() {
        let i8 = Type::i8(1);
        let e = absd(int_imm(i8, -100), int_imm(i8, 100));
        let v = eval(&e);
        assert_eq!(v.ty, Type::u8(1));
        assert_eq!(v.as_int().unwrap(), 200);
    }

    #[test]
    fn vector_ramp_and_broadcast() {
        let i32 = Type::i32(1);
        let e = ramp(int_imm(i32, 10), int_imm(i32, 3), 4) + const_of(Type::i32(4), 1);
        let v = eval(&e);
        assert_eq!(
            v.lanes,
            vec![
                Scalar::Int(11),
                Scalar::Int(14),
                Scalar::Int(17),
                Scalar::Int(20)
            ]
        );
    }

    #[test]
    fn let_bindings_shadow_and_restore() {
        let ty = Type::i32(1);
        let e = let_in(
            "x",
            int_imm(ty, 5),
            let_in("x", int_imm(ty, 7), var(ty, "x")) + var(ty, "x"),
        );
        assert_eq!(eval(&e).as_int().unwrap(), 12);
    }

    #[test]
    fn division_rounds_toward_negative_infinity() {
        let ty = Type::i32(1);
        let e = div(int_imm(ty, -7), int_imm(ty, 2));
        assert_eq!(eval(&e).as_int().unwrap(), -4);
        let e = modulo(int_imm(ty, -7), int_imm(ty, 2));
        assert_eq!(eval(&e).as_int().unwrap(), 1);
        let e = div_round_to_zero(int_imm(ty, -7), int_imm(ty, 2));
        assert_eq!(eval(&e).as_int().unwrap(), -3);
    }
}
