//! Expression and statement nodes.
//!
//! Nodes own their children; sharing is expressed with explicit `Let`
//! binders. Every node carries its static [`Type`]. Construction goes
//! through the typed helpers at the bottom of this module, which compute
//! result types and check operand agreement.
use std::fmt;

use ordered_float::OrderedFloat;

use crate::ty::{Type, TypeCode};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    /// Boolean conjunction.
    And,
    /// Boolean disjunction.
    Or,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Symbolic op-codes carried by [`Expr::Call`]. This is the only way
/// intrinsics appear in the IR.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum CallOp {
    /// `|x|` in the unsigned type of the same width.
    Abs,
    /// `|x - y|` in the unsigned type of the same width.
    AbsD,
    /// Shift left; negative amounts shift right.
    ShiftLeft,
    /// Shift right; negative amounts shift left.
    ShiftRight,
    WideningAdd,
    WideningSub,
    WideningMul,
    WidenRightAdd,
    WidenRightSub,
    WidenRightMul,
    WideningShiftLeft,
    WideningShiftRight,
    RoundingShiftLeft,
    RoundingShiftRight,
    SaturatingAdd,
    SaturatingSub,
    SaturatingCast,
    HalvingAdd,
    HalvingSub,
    RoundingHalvingAdd,
    MulShiftRight,
    RoundingMulShiftRight,
    SortedAvg,
    /// Truncating division, what the target hardware provides natively.
    DivRoundToZero,
    /// Remainder of [`CallOp::DivRoundToZero`].
    ModRoundToZero,
    /// Value-level conditional; both arms stay unevaluated until codegen.
    IfThenElse,
    IsNan,
    IsInf,
    /// Control/memory barrier; the mask argument selects the fences.
    GpuThreadBarrier,
    /// Target math function resolved by the shader emitter.
    Extern(String),
}

impl CallOp {
    pub fn name(&self) -> &str {
        match self {
            CallOp::Abs => "abs",
            CallOp::AbsD => "absd",
            CallOp::ShiftLeft => "shift_left",
            CallOp::ShiftRight => "shift_right",
            CallOp::WideningAdd => "widening_add",
            CallOp::WideningSub => "widening_sub",
            CallOp::WideningMul => "widening_mul",
            CallOp::WidenRightAdd => "widen_right_add",
            CallOp::WidenRightSub => "widen_right_sub",
            CallOp::WidenRightMul => "widen_right_mul",
            CallOp::WideningShiftLeft => "widening_shift_left",
            CallOp::WideningShiftRight => "widening_shift_right",
            CallOp::RoundingShiftLeft => "rounding_shift_left",
            CallOp::RoundingShiftRight => "rounding_shift_right",
            CallOp::SaturatingAdd => "saturating_add",
            CallOp::SaturatingSub => "saturating_sub",
            CallOp::SaturatingCast => "saturating_cast",
            CallOp::HalvingAdd => "halving_add",
            CallOp::HalvingSub => "halving_sub",
            CallOp::RoundingHalvingAdd => "rounding_halving_add",
            CallOp::MulShiftRight => "mul_shift_right",
            CallOp::RoundingMulShiftRight => "rounding_mul_shift_right",
            CallOp::SortedAvg => "sorted_avg",
            CallOp::DivRoundToZero => "div_round_to_zero",
            CallOp::ModRoundToZero => "mod_round_to_zero",
            CallOp::IfThenElse => "if_then_else",
            CallOp::IsNan => "is_nan",
            CallOp::IsInf => "is_inf",
            CallOp::GpuThreadBarrier => "gpu_thread_barrier",
            CallOp::Extern(name) => name,
        }
    }

    /// Fixed argument count, or `None` for externs.
    pub fn arity(&self) -> Option<usize> {
        let n = match self {
            CallOp::Abs | CallOp::SaturatingCast | CallOp::IsNan | CallOp::IsInf => 1,
            CallOp::GpuThreadBarrier => 1,
            CallOp::MulShiftRight | CallOp::RoundingMulShiftRight | CallOp::IfThenElse => 3,
            CallOp::Extern(_) => return None,
            _ => 2,
        };
        Some(n)
    }
}

impl fmt::Display for CallOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Expr {
    IntImm {
        ty: Type,
        value: i64,
    },
    UIntImm {
        ty: Type,
        value: u64,
    },
    FloatImm {
        ty: Type,
        value: OrderedFloat<f64>,
    },
    StringImm {
        value: String,
    },
    Var {
        ty: Type,
        name: String,
    },
    /// Value conversion. Integer narrowing wraps; widening sign- or
    /// zero-extends by the source code.
    Cast {
        ty: Type,
        value: Box<Expr>,
    },
    /// Bit-pattern reuse between types of identical width.
    Reinterpret {
        ty: Type,
        value: Box<Expr>,
    },
    Binary {
        ty: Type,
        op: BinOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Cmp {
        ty: Type,
        op: CmpOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Not {
        ty: Type,
        value: Box<Expr>,
    },
    Select {
        ty: Type,
        condition: Box<Expr>,
        true_value: Box<Expr>,
        false_value: Box<Expr>,
    },
    Load {
        ty: Type,
        buffer: String,
        index: Box<Expr>,
        predicate: Option<Box<Expr>>,
    },
    /// `base + stride * lane` for each lane.
    Ramp {
        ty: Type,
        base: Box<Expr>,
        stride: Box<Expr>,
        lanes: u16,
    },
    Broadcast {
        ty: Type,
        value: Box<Expr>,
        lanes: u16,
    },
    /// Lane permutation over the concatenation of `vectors`.
    Shuffle {
        ty: Type,
        vectors: Vec<Expr>,
        indices: Vec<u32>,
    },
    Call {
        ty: Type,
        op: CallOp,
        args: Vec<Expr>,
    },
    Let {
        ty: Type,
        name: String,
        value: Box<Expr>,
        body: Box<Expr>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ForKind {
    Serial,
    GpuBlock,
    GpuThread,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Stmt {
    LetStmt {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    AssertStmt {
        condition: Expr,
        message: Expr,
    },
    For {
        name: String,
        kind: ForKind,
        min: Expr,
        extent: Expr,
        body: Box<Stmt>,
    },
    IfThenElse {
        condition: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Store {
        buffer: String,
        index: Expr,
        value: Expr,
        predicate: Option<Expr>,
    },
    Allocate {
        name: String,
        elem_ty: Type,
        extent: Expr,
        body: Box<Stmt>,
    },
    Free {
        name: String,
    },
    Evaluate {
        value: Expr,
    },
    Block {
        stmts: Vec<Stmt>,
    },
}

impl Expr {
    pub fn ty(&self) -> Type {
        match self {
            Expr::IntImm { ty, .. }
            | Expr::UIntImm { ty, .. }
            | Expr::FloatImm { ty, .. }
            | Expr::Var { ty, .. }
            | Expr::Cast { ty, .. }
            | Expr::Reinterpret { ty, .. }
            | Expr::Binary { ty, .. }
            | Expr::Cmp { ty, .. }
            | Expr::Not { ty, .. }
            | Expr::Select { ty, .. }
            | Expr::Load { ty, .. }
            | Expr::Ramp { ty, .. }
            | Expr::Broadcast { ty, .. }
            | Expr::Shuffle { ty, .. }
            | Expr::Call { ty, .. }
            | Expr::Let { ty, .. } => *ty,
            Expr::StringImm { .. } => Type::handle(),
        }
    }

    pub fn lanes(&self) -> u16 {
        self.ty().lanes()
    }

    /// The operands of a [`Expr::Binary`] node with the given op.
    pub fn as_binary(&self, op: BinOp) -> Option<(&Expr, &Expr)> {
        match self {
            Expr::Binary { op: o, a, b, .. } if *o == op => Some((a, b)),
            _ => None,
        }
    }

    /// The arguments of a [`Expr::Call`] node with the given op.
    pub fn as_call(&self, op: &CallOp) -> Option<&[Expr]> {
        match self {
            Expr::Call { op: o, args, .. } if o == op => Some(args),
            _ => None,
        }
    }

    pub fn as_cast(&self) -> Option<(Type, &Expr)> {
        match self {
            Expr::Cast { ty, value } => Some((*ty, value)),
            _ => None,
        }
    }

    pub fn as_broadcast(&self) -> Option<(&Expr, u16)> {
        match self {
            Expr::Broadcast { value, lanes, .. } => Some((value, *lanes)),
            _ => None,
        }
    }

    /// Integer payload of a scalar immediate, or of a broadcast of one.
    pub fn const_int(&self) -> Option<i128> {
        match self {
            Expr::IntImm { value, .. } => Some(*value as i128),
            Expr::UIntImm { value, .. } => Some(*value as i128),
            Expr::Broadcast { value, .. } => value.const_int(),
            _ => None,
        }
    }

    pub fn is_const(&self, expected: i128) -> bool {
        self.const_int() == Some(expected)
    }

    /// Whether re-evaluating the expression is observationally free.
    pub fn is_pure(&self) -> bool {
        let mut pure = true;
        self.for_each_child(&mut |child| pure &= child.is_pure());
        pure
            && !matches!(self, Expr::Load { .. })
            && !matches!(
                self,
                Expr::Call {
                    op: CallOp::Extern(_),
                    ..
                } | Expr::Call {
                    op: CallOp::GpuThreadBarrier,
                    ..
                }
            )
    }

    /// Apply `f` to each direct child.
    pub fn for_each_child(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Expr::IntImm { .. }
            | Expr::UIntImm { .. }
            | Expr::FloatImm { .. }
            | Expr::StringImm { .. }
            | Expr::Var { .. } => {}
            Expr::Cast { value, .. }
            | Expr::Reinterpret { value, .. }
            | Expr::Not { value, .. }
            | Expr::Broadcast { value, .. } => f(value),
            Expr::Binary { a, b, .. } | Expr::Cmp { a, b, .. } => {
                f(a);
                f(b);
            }
            Expr::Select {
                condition,
                true_value,
                false_value,
                ..
            } => {
                f(condition);
                f(true_value);
                f(false_value);
            }
            Expr::Load {
                index, predicate, ..
            } => {
                f(index);
                if let Some(predicate) = predicate {
                    f(predicate);
                }
            }
            Expr::Ramp { base, stride, .. } => {
                f(base);
                f(stride);
            }
            Expr::Shuffle { vectors, .. } => vectors.iter().for_each(|v| f(v)),
            Expr::Call { args, .. } => args.iter().for_each(|a| f(a)),
            Expr::Let { value, body, .. } => {
                f(value);
                f(body);
            }
        }
    }

    /// Rebuild the node with each direct child passed through `f`.
    pub fn map_children(&self, f: &mut dyn FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::IntImm { .. }
            | Expr::UIntImm { .. }
            | Expr::FloatImm { .. }
            | Expr::StringImm { .. }
            | Expr::Var { .. } => self.clone(),
            Expr::Cast { ty, value } => Expr::Cast {
                ty: *ty,
                value: Box::new(f(value)),
            },
            Expr::Reinterpret { ty, value } => Expr::Reinterpret {
                ty: *ty,
                value: Box::new(f(value)),
            },
            Expr::Not { ty, value } => Expr::Not {
                ty: *ty,
                value: Box::new(f(value)),
            },
            Expr::Broadcast { ty, value, lanes } => Expr::Broadcast {
                ty: *ty,
                value: Box::new(f(value)),
                lanes: *lanes,
            },
            Expr::Binary { ty, op, a, b } => Expr::Binary {
                ty: *ty,
                op: *op,
                a: Box::new(f(a)),
                b: Box::new(f(b)),
            },
            Expr::Cmp { ty, op, a, b } => Expr::Cmp {
                ty: *ty,
                op: *op,
                a: Box::new(f(a)),
                b: Box::new(f(b)),
            },
            Expr::Select {
                ty,
                condition,
                true_value,
                false_value,
            } => Expr::Select {
                ty: *ty,
                condition: Box::new(f(condition)),
                true_value: Box::new(f(true_value)),
                false_value: Box::new(f(false_value)),
            },
            Expr::Load {
                ty,
                buffer,
                index,
                predicate,
            } => Expr::Load {
                ty: *ty,
                buffer: buffer.clone(),
                index: Box::new(f(index)),
                predicate: predicate.as_ref().map(|p| Box::new(f(p))),
            },
            Expr::Ramp {
                ty,
                base,
                stride,
                lanes,
            } => Expr::Ramp {
                ty: *ty,
                base: Box::new(f(base)),
                stride: Box::new(f(stride)),
                lanes: *lanes,
            },
            Expr::Shuffle {
                ty,
                vectors,
                indices,
            } => Expr::Shuffle {
                ty: *ty,
                vectors: vectors.iter().map(|v| f(v)).collect(),
                indices: indices.clone(),
            },
            Expr::Call { ty, op, args } => Expr::Call {
                ty: *ty,
                op: op.clone(),
                args: args.iter().map(|a| f(a)).collect(),
            },
            Expr::Let {
                ty,
                name,
                value,
                body,
            } => Expr::Let {
                ty: *ty,
                name: name.clone(),
                value: Box::new(f(value)),
                body: Box::new(f(body)),
            },
        }
    }

    /// Whether the free variable `name` occurs in the expression.
    pub fn uses_var(&self, name: &str) -> bool {
        match self {
            Expr::Var { name: n, .. } => n == name,
            Expr::Let {
                name: n,
                value,
                body,
                ..
            } => value.uses_var(name) || (n != name && body.uses_var(name)),
            _ => {
                let mut used = false;
                self.for_each_child(&mut |child| used |= child.uses_var(name));
                used
            }
        }
    }

    /// Substitute free occurrences of the variable `name`.
    pub fn substitute(&self, name: &str, replacement: &Expr) -> Expr {
        match self {
            Expr::Var { name: n, .. } if n == name => replacement.clone(),
            Expr::Let {
                ty,
                name: n,
                value,
                body,
            } => {
                let value = value.substitute(name, replacement);
                let body = if n == name {
                    (**body).clone()
                } else {
                    body.substitute(name, replacement)
                };
                Expr::Let {
                    ty: *ty,
                    name: n.clone(),
                    value: Box::new(value),
                    body: Box::new(body),
                }
            }
            _ => self.map_children(&mut |child| child.substitute(name, replacement)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::IntImm { value, .. } => write!(f, "{}", value),
            Expr::UIntImm { value, .. } => write!(f, "{}", value),
            Expr::FloatImm { value, .. } => write!(f, "{}f", value.0),
            Expr::StringImm { value } => write!(f, "{:?}", value),
            Expr::Var { name, .. } => f.write_str(name),
            Expr::Cast { ty, value } => write!(f, "{}({})", ty, value),
            Expr::Reinterpret { ty, value } => write!(f, "reinterpret<{}>({})", ty, value),
            Expr::Binary { op, a, b, .. } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Mod => "%",
                    BinOp::And => "&&",
                    BinOp::Or => "||",
                    BinOp::Min => return write!(f, "min({}, {})", a, b),
                    BinOp::Max => return write!(f, "max({}, {})", a, b),
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Expr::Cmp { op, a, b, .. } => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({} {} {})", a, sym, b)
            }
            Expr::Not { value, .. } => write!(f, "!{}", value),
            Expr::Select {
                condition,
                true_value,
                false_value,
                ..
            } => write!(f, "select({}, {}, {})", condition, true_value, false_value),
            Expr::Load { buffer, index, .. } => write!(f, "{}[{}]", buffer, index),
            Expr::Ramp {
                base,
                stride,
                lanes,
                ..
            } => write!(f, "ramp({}, {}, {})", base, stride, lanes),
            Expr::Broadcast { value, lanes, .. } => write!(f, "x{}({})", lanes, value),
            Expr::Shuffle { indices, .. } => write!(f, "shuffle({:?})", indices),
            Expr::Call { op, args, .. } => {
                write!(f, "{}(", op)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Let {
                name, value, body, ..
            } => write!(f, "(let {} = {} in {})", name, value, body),
        }
    }
}

impl Stmt {
    /// Rebuild the statement with every directly contained expression passed
    /// through `fe` and every child statement through `fs`.
    pub fn map(
        &self,
        fe: &mut dyn FnMut(&Expr) -> Expr,
        fs: &mut dyn FnMut(&Stmt) -> Stmt,
    ) -> Stmt {
        match self {
            Stmt::LetStmt { name, value, body } => Stmt::LetStmt {
                name: name.clone(),
                value: fe(value),
                body: Box::new(fs(body)),
            },
            Stmt::AssertStmt { condition, message } => Stmt::AssertStmt {
                condition: fe(condition),
                message: fe(message),
            },
            Stmt::For {
                name,
                kind,
                min,
                extent,
                body,
            } => Stmt::For {
                name: name.clone(),
                kind: *kind,
                min: fe(min),
                extent: fe(extent),
                body: Box::new(fs(body)),
            },
            Stmt::IfThenElse {
                condition,
                then_case,
                else_case,
            } => Stmt::IfThenElse {
                condition: fe(condition),
                then_case: Box::new(fs(then_case)),
                else_case: else_case.as_ref().map(|s| Box::new(fs(s))),
            },
            Stmt::Store {
                buffer,
                index,
                value,
                predicate,
            } => Stmt::Store {
                buffer: buffer.clone(),
                index: fe(index),
                value: fe(value),
                predicate: predicate.as_ref().map(|p| fe(p)),
            },
            Stmt::Allocate {
                name,
                elem_ty,
                extent,
                body,
            } => Stmt::Allocate {
                name: name.clone(),
                elem_ty: *elem_ty,
                extent: fe(extent),
                body: Box::new(fs(body)),
            },
            Stmt::Free { name } => Stmt::Free { name: name.clone() },
            Stmt::Evaluate { value } => Stmt::Evaluate { value: fe(value) },
            Stmt::Block { stmts } => Stmt::Block {
                stmts: stmts.iter().map(|s| fs(s)).collect(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Typed constructors.
// ---------------------------------------------------------------------------

pub fn int_imm(ty: Type, value: i64) -> Expr {
    debug_assert!(ty.is_int() && ty.is_scalar());
    Expr::IntImm { ty, value }
}
pub fn uint_imm(ty: Type, value: u64) -> Expr {
    debug_assert!(ty.is_uint() && ty.is_scalar());
    Expr::UIntImm { ty, value }
}
pub fn float_imm(ty: Type, value: f64) -> Expr {
    debug_assert!(ty.is_float() && ty.is_scalar());
    Expr::FloatImm {
        ty,
        value: OrderedFloat(value),
    }
}
pub fn bool_imm(value: bool) -> Expr {
    Expr::UIntImm {
        ty: Type::bool(1),
        value: value as u64,
    }
}

/// A constant of any integer type, broadcast when the type is a vector.
pub fn const_of(ty: Type, value: i128) -> Expr {
    let elem = ty.element_of();
    let scalar = match ty.code() {
        TypeCode::Int => int_imm(elem, value as i64),
        TypeCode::UInt | TypeCode::Bool => Expr::UIntImm {
            ty: elem,
            value: value as u64,
        },
        TypeCode::Float => float_imm(elem, value as f64),
        TypeCode::Handle => panic!("no handle constants"),
    };
    if ty.is_vector() {
        broadcast(scalar, ty.lanes())
    } else {
        scalar
    }
}

pub fn var(ty: Type, name: impl Into<String>) -> Expr {
    Expr::Var {
        ty,
        name: name.into(),
    }
}

/// Value conversion; a same-type cast is the identity.
pub fn cast(ty: Type, value: Expr) -> Expr {
    if value.ty() == ty {
        return value;
    }
    debug_assert_eq!(ty.lanes(), value.lanes(), "cast cannot change lane count");
    Expr::Cast {
        ty,
        value: Box::new(value),
    }
}

pub fn reinterpret(ty: Type, value: Expr) -> Expr {
    if value.ty() == ty {
        return value;
    }
    debug_assert_eq!(ty.bytes(), value.ty().bytes(), "reinterpret must preserve size");
    Expr::Reinterpret {
        ty,
        value: Box::new(value),
    }
}

fn binary(op: BinOp, a: Expr, b: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty(), "binary {:?} operand types differ", op);
    Expr::Binary {
        ty: a.ty(),
        op,
        a: Box::new(a),
        b: Box::new(b),
    }
}

pub fn add(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Add, a, b)
}
pub fn sub(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Sub, a, b)
}
pub fn mul(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Mul, a, b)
}
pub fn div(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Div, a, b)
}
pub fn modulo(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Mod, a, b)
}
pub fn min(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Min, a, b)
}
pub fn max(a: Expr, b: Expr) -> Expr {
    binary(BinOp::Max, a, b)
}
pub fn and(a: Expr, b: Expr) -> Expr {
    debug_assert!(a.ty().is_bool());
    binary(BinOp::And, a, b)
}
pub fn or(a: Expr, b: Expr) -> Expr {
    debug_assert!(a.ty().is_bool());
    binary(BinOp::Or, a, b)
}

fn compare(op: CmpOp, a: Expr, b: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty(), "comparison operand types differ");
    Expr::Cmp {
        ty: Type::bool(a.lanes()),
        op,
        a: Box::new(a),
        b: Box::new(b),
    }
}

pub fn eq(a: Expr, b: Expr) -> Expr {
    compare(CmpOp::Eq, a, b)
}
pub fn ne(a: Expr, b: Expr) -> Expr {
    compare(CmpOp::Ne, a, b)
}
pub fn lt(a: Expr, b: Expr) -> Expr {
    compare(CmpOp::Lt, a, b)
}
pub fn le(a: Expr, b: Expr) -> Expr {
    compare(CmpOp::Le, a, b)
}
pub fn gt(a: Expr, b: Expr) -> Expr {
    compare(CmpOp::Gt, a, b)
}
pub fn ge(a: Expr, b: Expr) -> Expr {
    compare(CmpOp::Ge, a, b)
}

pub fn not(value: Expr) -> Expr {
    debug_assert!(value.ty().is_bool());
    Expr::Not {
        ty: value.ty(),
        value: Box::new(value),
    }
}

pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
    debug_assert!(condition.ty().is_bool());
    debug_assert_eq!(true_value.ty(), false_value.ty(), "select arm types differ");
    debug_assert_eq!(condition.lanes(), true_value.lanes());
    Expr::Select {
        ty: true_value.ty(),
        condition: Box::new(condition),
        true_value: Box::new(true_value),
        false_value: Box::new(false_value),
    }
}

pub fn load(ty: Type, buffer: impl Into<String>, index: Expr) -> Expr {
    debug_assert_eq!(ty.lanes(), index.lanes());
    Expr::Load {
        ty,
        buffer: buffer.into(),
        index: Box::new(index),
        predicate: None,
    }
}

pub fn load_predicated(ty: Type, buffer: impl Into<String>, index: Expr, predicate: Expr) -> Expr {
    debug_assert_eq!(ty.lanes(), index.lanes());
    debug_assert!(predicate.ty().is_bool());
    Expr::Load {
        ty,
        buffer: buffer.into(),
        index: Box::new(index),
        predicate: Some(Box::new(predicate)),
    }
}

pub fn ramp(base: Expr, stride: Expr, lanes: u16) -> Expr {
    debug_assert!(base.ty().is_scalar());
    debug_assert_eq!(base.ty(), stride.ty());
    Expr::Ramp {
        ty: base.ty().with_lanes(lanes),
        base: Box::new(base),
        stride: Box::new(stride),
        lanes,
    }
}

pub fn broadcast(value: Expr, lanes: u16) -> Expr {
    debug_assert!(value.ty().is_scalar());
    if lanes == 1 {
        return value;
    }
    Expr::Broadcast {
        ty: value.ty().with_lanes(lanes),
        value: Box::new(value),
        lanes,
    }
}

pub fn let_in(name: impl Into<String>, value: Expr, body: Expr) -> Expr {
    Expr::Let {
        ty: body.ty(),
        name: name.into(),
        value: Box::new(value),
        body: Box::new(body),
    }
}

pub fn call(ty: Type, op: CallOp, args: Vec<Expr>) -> Expr {
    if let Some(arity) = op.arity() {
        debug_assert_eq!(args.len(), arity, "{} expects {} arguments", op, arity);
    }
    Expr::Call { ty, op, args }
}

// Intrinsic constructors. Each fixes the declared result type of its op.

fn widening(op: CallOp, a: Expr, b: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty(), "{} operand types differ", op);
    call(a.ty().widen(), op, vec![a, b])
}

/// Result type is `a.ty().widen()`; no overflow by construction.
pub fn widening_add(a: Expr, b: Expr) -> Expr {
    widening(CallOp::WideningAdd, a, b)
}
pub fn widening_sub(a: Expr, b: Expr) -> Expr {
    widening(CallOp::WideningSub, a, b)
}
pub fn widening_mul(a: Expr, b: Expr) -> Expr {
    widening(CallOp::WideningMul, a, b)
}

fn widen_right(op: CallOp, a: Expr, b: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty().widen(), "{} expects a wide lhs", op);
    call(a.ty(), op, vec![a, b])
}

/// `a` is wide, `b` narrow; result takes the type of `a`.
pub fn widen_right_add(a: Expr, b: Expr) -> Expr {
    widen_right(CallOp::WidenRightAdd, a, b)
}
pub fn widen_right_sub(a: Expr, b: Expr) -> Expr {
    widen_right(CallOp::WidenRightSub, a, b)
}
pub fn widen_right_mul(a: Expr, b: Expr) -> Expr {
    widen_right(CallOp::WidenRightMul, a, b)
}

fn shift(op: CallOp, a: Expr, b: Expr) -> Expr {
    debug_assert!(b.ty().is_int_or_uint());
    debug_assert_eq!(a.lanes(), b.lanes());
    call(a.ty(), op, vec![a, b])
}

pub fn shift_left(a: Expr, b: Expr) -> Expr {
    shift(CallOp::ShiftLeft, a, b)
}
pub fn shift_right(a: Expr, b: Expr) -> Expr {
    shift(CallOp::ShiftRight, a, b)
}
pub fn rounding_shift_left(a: Expr, b: Expr) -> Expr {
    shift(CallOp::RoundingShiftLeft, a, b)
}
pub fn rounding_shift_right(a: Expr, b: Expr) -> Expr {
    shift(CallOp::RoundingShiftRight, a, b)
}

/// Widen `a`, then shift.
pub fn widening_shift_left(a: Expr, b: Expr) -> Expr {
    debug_assert!(b.ty().is_int_or_uint());
    debug_assert_eq!(a.lanes(), b.lanes());
    call(a.ty().widen(), CallOp::WideningShiftLeft, vec![a, b])
}
pub fn widening_shift_right(a: Expr, b: Expr) -> Expr {
    debug_assert!(b.ty().is_int_or_uint());
    debug_assert_eq!(a.lanes(), b.lanes());
    call(a.ty().widen(), CallOp::WideningShiftRight, vec![a, b])
}

fn same_type(op: CallOp, a: Expr, b: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty(), "{} operand types differ", op);
    call(a.ty(), op, vec![a, b])
}

pub fn saturating_add(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::SaturatingAdd, a, b)
}
pub fn saturating_sub(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::SaturatingSub, a, b)
}
/// Clamp `value` to the representable range of `ty`, then convert.
pub fn saturating_cast(ty: Type, value: Expr) -> Expr {
    debug_assert_eq!(ty.lanes(), value.lanes());
    call(ty, CallOp::SaturatingCast, vec![value])
}

/// `(a + b) / 2` rounded toward negative infinity, no intermediate overflow.
pub fn halving_add(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::HalvingAdd, a, b)
}
/// `(a - b) / 2` rounded toward negative infinity, no intermediate overflow.
pub fn halving_sub(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::HalvingSub, a, b)
}
/// `(a + b + 1) / 2` rounded toward negative infinity.
pub fn rounding_halving_add(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::RoundingHalvingAdd, a, b)
}

/// `(a * b) >> q` in wide arithmetic, saturated into the operand type.
pub fn mul_shift_right(a: Expr, b: Expr, q: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty());
    debug_assert!(q.ty().is_int_or_uint());
    call(a.ty(), CallOp::MulShiftRight, vec![a, b, q])
}
pub fn rounding_mul_shift_right(a: Expr, b: Expr, q: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty());
    debug_assert!(q.ty().is_int_or_uint());
    call(a.ty(), CallOp::RoundingMulShiftRight, vec![a, b, q])
}

/// `|a|` in the unsigned type of the same width.
pub fn abs(a: Expr) -> Expr {
    let ty = if a.ty().is_int() {
        a.ty().with_code(TypeCode::UInt)
    } else {
        a.ty()
    };
    call(ty, CallOp::Abs, vec![a])
}

/// `|a - b|` in the unsigned type of the same width.
pub fn absd(a: Expr, b: Expr) -> Expr {
    debug_assert_eq!(a.ty(), b.ty());
    let ty = if a.ty().is_int() {
        a.ty().with_code(TypeCode::UInt)
    } else {
        a.ty()
    };
    call(ty, CallOp::AbsD, vec![a, b])
}

/// `a + (b - a) / 2` assuming `a <= b`; cannot overflow.
pub fn sorted_avg(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::SortedAvg, a, b)
}

pub fn div_round_to_zero(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::DivRoundToZero, a, b)
}
pub fn mod_round_to_zero(a: Expr, b: Expr) -> Expr {
    same_type(CallOp::ModRoundToZero, a, b)
}

/// The expression form of a conditional; lowered to a phi join by the
/// emitter.
pub fn if_then_else(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
    debug_assert!(condition.ty().is_bool() && condition.ty().is_scalar());
    debug_assert_eq!(true_value.ty(), false_value.ty());
    let ty = true_value.ty();
    call(ty, CallOp::IfThenElse, vec![condition, true_value, false_value])
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        add(self, rhs)
    }
}
impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        sub(self, rhs)
    }
}
impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        mul(self, rhs)
    }
}
impl std::ops::Shl for Expr {
    type Output = Expr;
    fn shl(self, rhs: Expr) -> Expr {
        shift_left(self, rhs)
    }
}
impl std::ops::Shr for Expr {
    type Output = Expr;
    fn shr(self, rhs: Expr) -> Expr {
        shift_right(self, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_fix_result_types() {
        let a = var(Type::i16(4), "a");
        let b = var(Type::i16(4), "b");
        assert_eq!(widening_add(a.clone(), b.clone()).ty(), Type::i32(4));
        assert_eq!(halving_add(a.clone(), b.clone()).ty(), Type::i16(4));
        assert_eq!(absd(a.clone(), b.clone()).ty(), Type::u16(4));
        assert_eq!(lt(a.clone(), b.clone()).ty(), Type::bool(4));
        let w = var(Type::i32(4), "w");
        assert_eq!(widen_right_add(w, a.clone()).ty(), Type::i32(4));
    }

    #[test]
    fn same_type_cast_is_identity() {
        let a = var(Type::u8(8), "a");
        assert_eq!(cast(Type::u8(8), a.clone()), a);
    }

    #[test]
    fn substitution_respects_shadowing() {
        let ty = Type::i32(1);
        let body = let_in("x", int_imm(ty, 2), var(ty, "x") + var(ty, "y"));
        let out = body.substitute("x", &int_imm(ty, 9));
        // The bound occurrence is untouched.
        match out {
            Expr::Let { body, .. } => {
                assert!(body.uses_var("x"));
                assert!(body.uses_var("y"));
            }
            _ => panic!("expected let"),
        }
    }

    #[test]
    fn const_int_sees_through_broadcast() {
        let c = const_of(Type::u8(8), 37);
        assert_eq!(c.const_int(), Some(37));
        assert_eq!(c.ty(), Type::u8(8));
    }

    #[test]
    fn purity() {
        let ty = Type::i32(1);
        assert!((var(ty, "a") + int_imm(ty, 1)).is_pure());
        assert!(!load(ty, "buf", var(ty, "i")).is_pure());
    }
}
