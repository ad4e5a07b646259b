//! Scalar and fixed-width vector types.
use std::fmt;

/// Kind of data a [`Type`] describes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TypeCode {
    /// Two's complement signed integer.
    Int,
    /// Unsigned integer.
    UInt,
    /// IEEE 754 floating-point number.
    Float,
    /// Single-bit boolean.
    Bool,
    /// Opaque pointer-sized handle; also the type of statements.
    Handle,
}

/// A scalar or fixed-width vector type: `(code, bits, lanes)`.
///
/// `lanes > 1` is a vector whose elements are the scalar `(code, bits)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    code: TypeCode,
    bits: u8,
    lanes: u16,
}

impl Type {
    pub fn new(code: TypeCode, bits: u8, lanes: u16) -> Type {
        debug_assert!(lanes >= 1, "a type must have at least one lane");
        debug_assert!(
            match code {
                TypeCode::Bool => bits == 1,
                TypeCode::Handle => bits == 64,
                TypeCode::Float => bits == 16 || bits == 32 || bits == 64,
                _ => bits == 8 || bits == 16 || bits == 32 || bits == 64,
            },
            "invalid bit width {} for {:?}",
            bits,
            code
        );
        Type { code, bits, lanes }
    }

    pub fn int(bits: u8, lanes: u16) -> Type {
        Type::new(TypeCode::Int, bits, lanes)
    }
    pub fn uint(bits: u8, lanes: u16) -> Type {
        Type::new(TypeCode::UInt, bits, lanes)
    }
    pub fn float(bits: u8, lanes: u16) -> Type {
        Type::new(TypeCode::Float, bits, lanes)
    }
    pub fn bool(lanes: u16) -> Type {
        Type::new(TypeCode::Bool, 1, lanes)
    }
    /// Opaque/void type.
    pub fn handle() -> Type {
        Type::new(TypeCode::Handle, 64, 1)
    }

    pub fn i8(lanes: u16) -> Type {
        Type::int(8, lanes)
    }
    pub fn i16(lanes: u16) -> Type {
        Type::int(16, lanes)
    }
    pub fn i32(lanes: u16) -> Type {
        Type::int(32, lanes)
    }
    pub fn i64(lanes: u16) -> Type {
        Type::int(64, lanes)
    }
    pub fn u8(lanes: u16) -> Type {
        Type::uint(8, lanes)
    }
    pub fn u16(lanes: u16) -> Type {
        Type::uint(16, lanes)
    }
    pub fn u32(lanes: u16) -> Type {
        Type::uint(32, lanes)
    }
    pub fn u64(lanes: u16) -> Type {
        Type::uint(64, lanes)
    }
    pub fn f32(lanes: u16) -> Type {
        Type::float(32, lanes)
    }
    pub fn f64(lanes: u16) -> Type {
        Type::float(64, lanes)
    }

    pub fn code(&self) -> TypeCode {
        self.code
    }
    pub fn bits(&self) -> u8 {
        self.bits
    }
    pub fn lanes(&self) -> u16 {
        self.lanes
    }

    pub fn is_int(&self) -> bool {
        self.code == TypeCode::Int
    }
    pub fn is_uint(&self) -> bool {
        self.code == TypeCode::UInt
    }
    pub fn is_int_or_uint(&self) -> bool {
        self.is_int() || self.is_uint()
    }
    pub fn is_float(&self) -> bool {
        self.code == TypeCode::Float
    }
    pub fn is_bool(&self) -> bool {
        self.code == TypeCode::Bool
    }
    pub fn is_handle(&self) -> bool {
        self.code == TypeCode::Handle
    }
    pub fn is_vector(&self) -> bool {
        self.lanes > 1
    }
    pub fn is_scalar(&self) -> bool {
        self.lanes == 1
    }

    /// The same type with half the bits.
    pub fn narrow(&self) -> Type {
        debug_assert!(self.bits >= 16, "cannot narrow {} bits", self.bits);
        Type::new(self.code, self.bits / 2, self.lanes)
    }
    /// The same type with double the bits.
    pub fn widen(&self) -> Type {
        debug_assert!(self.bits <= 32, "cannot widen {} bits", self.bits);
        Type::new(self.code, self.bits * 2, self.lanes)
    }
    pub fn with_code(&self, code: TypeCode) -> Type {
        Type::new(code, self.bits, self.lanes)
    }
    pub fn with_lanes(&self, lanes: u16) -> Type {
        Type::new(self.code, self.bits, lanes)
    }
    /// The scalar element type of a vector; identity on scalars.
    pub fn element_of(&self) -> Type {
        self.with_lanes(1)
    }

    /// In-memory footprint in bytes, `ceil(bits * lanes / 8)`.
    pub fn bytes(&self) -> u32 {
        (self.bits as u32 * self.lanes as u32 + 7) / 8
    }

    /// Smallest representable value, if the type is a bounded integer.
    pub fn min_value(&self) -> Option<i128> {
        match self.code {
            TypeCode::Int => Some(-(1i128 << (self.bits - 1))),
            TypeCode::UInt => Some(0),
            TypeCode::Bool => Some(0),
            _ => None,
        }
    }
    /// Largest representable value, if the type is a bounded integer.
    pub fn max_value(&self) -> Option<i128> {
        match self.code {
            TypeCode::Int => Some((1i128 << (self.bits - 1)) - 1),
            TypeCode::UInt => Some((1i128 << self.bits) - 1),
            TypeCode::Bool => Some(1),
            _ => None,
        }
    }

    /// Whether every value of `other` is exactly representable in `self`.
    /// Lane counts must agree.
    pub fn can_represent(&self, other: Type) -> bool {
        if self.lanes != other.lanes {
            return false;
        }
        match (self.code, other.code) {
            (TypeCode::Int, TypeCode::Int) => self.bits >= other.bits,
            (TypeCode::Int, TypeCode::UInt) => self.bits > other.bits,
            (TypeCode::UInt, TypeCode::UInt) => self.bits >= other.bits,
            (TypeCode::Float, TypeCode::Float) => self.bits >= other.bits,
            (TypeCode::Float, TypeCode::Int) => self.mantissa_bits() + 1 >= other.bits as u32,
            (TypeCode::Float, TypeCode::UInt) => self.mantissa_bits() >= other.bits as u32,
            (TypeCode::Bool, TypeCode::Bool) => true,
            _ => false,
        }
    }

    fn mantissa_bits(&self) -> u32 {
        match self.bits {
            16 => 10,
            32 => 23,
            64 => 52,
            _ => 0,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            TypeCode::Int => write!(f, "i{}", self.bits)?,
            TypeCode::UInt => write!(f, "u{}", self.bits)?,
            TypeCode::Float => write!(f, "f{}", self.bits)?,
            TypeCode::Bool => f.write_str("bool")?,
            TypeCode::Handle => f.write_str("handle")?,
        }
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}
impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Wrap `value` into the representable range of `ty` with two's complement
/// semantics.
pub fn wrap_to_type(value: i128, ty: Type) -> i128 {
    let bits = ty.bits() as u32;
    match ty.code() {
        TypeCode::UInt => value & ((1i128 << bits) - 1),
        TypeCode::Int => {
            let masked = value & ((1i128 << bits) - 1);
            if masked >= (1i128 << (bits - 1)) {
                masked - (1i128 << bits)
            } else {
                masked
            }
        }
        TypeCode::Bool => value & 1,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_and_widen_are_inverses() {
        let ty = Type::i32(4);
        assert_eq!(ty.narrow(), Type::i16(4));
        assert_eq!(ty.narrow().widen(), ty);
        assert_eq!(ty.with_code(TypeCode::UInt), Type::u32(4));
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(Type::u8(1).bytes(), 1);
        assert_eq!(Type::i16(4).bytes(), 8);
        assert_eq!(Type::bool(3).bytes(), 1);
        assert_eq!(Type::f32(2).bytes(), 8);
    }

    #[test]
    fn integer_ranges() {
        assert_eq!(Type::i8(1).min_value(), Some(-128));
        assert_eq!(Type::i8(1).max_value(), Some(127));
        assert_eq!(Type::u16(1).max_value(), Some(65535));
        assert_eq!(Type::u64(1).max_value(), Some(u64::MAX as i128));
        assert_eq!(Type::f32(1).max_value(), None);
    }

    #[test]
    fn representability() {
        assert!(Type::i32(1).can_represent(Type::i16(1)));
        assert!(Type::i32(1).can_represent(Type::u16(1)));
        assert!(!Type::i32(1).can_represent(Type::u32(1)));
        assert!(!Type::u16(1).can_represent(Type::i8(1)));
        assert!(Type::f32(1).can_represent(Type::i16(1)));
        assert!(!Type::f32(1).can_represent(Type::i32(1)));
        assert!(Type::f64(1).can_represent(Type::i32(1)));
        assert!(!Type::i32(2).can_represent(Type::i16(1)));
    }

    #[test]
    fn wrapping() {
        assert_eq!(wrap_to_type(300, Type::u8(1)), 44);
        assert_eq!(wrap_to_type(200, Type::i8(1)), -56);
        assert_eq!(wrap_to_type(-129, Type::i8(1)), 127);
        assert_eq!(wrap_to_type(-1, Type::u16(1)), 65535);
    }
}
