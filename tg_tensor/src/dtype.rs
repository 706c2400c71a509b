//! Data types, the promotion table, and dtype-tagged scalars.

use half::{bf16, f16};

/// Number of supported data types. Used to size per-dtype dispatch tables.
pub const DATA_TYPE_COUNT: usize = 9;

/// Element type of a tensor buffer.
///
/// The discriminant doubles as the index into the per-dtype kernel tables,
/// so the ordering here is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DataType {
    F64 = 0,
    F32 = 1,
    F16 = 2,
    BF16 = 3,
    I64 = 4,
    I32 = 5,
    I16 = 6,
    I8 = 7,
    U8 = 8,
}

use DataType::*;

/// Result dtype for a mixed-dtype binary operation.
///
/// A float always beats an integer, a wider type beats a narrower one, and
/// the two 16-bit float formats meet at F32 since neither can represent the
/// other. I8 and U8 meet at I16, the narrowest signed type that holds both.
static PROMOTION_TABLE: [[DataType; DATA_TYPE_COUNT]; DATA_TYPE_COUNT] = [
    //  F64  F32  F16   BF16  I64  I32  I16  I8   U8
    [F64, F64, F64, F64, F64, F64, F64, F64, F64],  // F64
    [F64, F32, F32, F32, F32, F32, F32, F32, F32],  // F32
    [F64, F32, F16, F32, F16, F16, F16, F16, F16],  // F16
    [F64, F32, F32, BF16, BF16, BF16, BF16, BF16, BF16], // BF16
    [F64, F32, F16, BF16, I64, I64, I64, I64, I64], // I64
    [F64, F32, F16, BF16, I64, I32, I32, I32, I32], // I32
    [F64, F32, F16, BF16, I64, I32, I16, I16, I16], // I16
    [F64, F32, F16, BF16, I64, I32, I16, I8, I16],  // I8
    [F64, F32, F16, BF16, I64, I32, I16, I16, U8],  // U8
];

impl DataType {
    /// All dtypes in table order.
    pub const ALL: [DataType; DATA_TYPE_COUNT] = [F64, F32, F16, BF16, I64, I32, I16, I8, U8];

    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        static SIZE_TABLE: [usize; DATA_TYPE_COUNT] = [8, 4, 2, 2, 8, 4, 2, 1, 1];
        SIZE_TABLE[self as usize]
    }

    /// Index into per-dtype dispatch tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_float(self) -> bool {
        matches!(self, F64 | F32 | F16 | BF16)
    }

    /// Display name used in the shape tag of the pretty-printer.
    pub fn name(self) -> &'static str {
        match self {
            F64 => "Double",
            F32 => "Float",
            F16 => "Half",
            BF16 => "BFloat16",
            I64 => "Long",
            I32 => "Int",
            I16 => "Short",
            I8 => "Char",
            U8 => "Byte",
        }
    }

    /// Join of two dtypes under the promotion rules.
    pub fn promote(self, other: DataType) -> DataType {
        PROMOTION_TABLE[self as usize][other as usize]
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for f32 {}
    impl Sealed for half::f16 {}
    impl Sealed for half::bf16 {}
    impl Sealed for i64 {}
    impl Sealed for i32 {}
    impl Sealed for i16 {}
    impl Sealed for i8 {}
    impl Sealed for u8 {}
}

/// A Rust scalar type that can live inside a tensor buffer.
///
/// `from_f64`/`to_f64` are the universal conversion path; the arithmetic
/// bounds let the generic CPU kernels operate natively per type.
pub trait Element:
    sealed::Sealed
    + Copy
    + PartialOrd
    + PartialEq
    + std::fmt::Display
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + Send
    + Sync
    + 'static
{
    const DTYPE: DataType;
    const ZERO: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn to_scalar(self) -> Scalar;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $variant:ident, $zero:expr, |$v:ident| $from:expr, |$s:ident| $to:expr) => {
        impl Element for $ty {
            const DTYPE: DataType = $dtype;
            const ZERO: Self = $zero;

            #[inline]
            fn from_f64($v: f64) -> Self {
                $from
            }

            #[inline]
            fn to_f64(self) -> f64 {
                let $s = self;
                $to
            }

            #[inline]
            fn to_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }
        }
    };
}

impl_element!(f64, F64, F64, 0.0, |v| v, |s| s);
impl_element!(f32, F32, F32, 0.0, |v| v as f32, |s| s as f64);
impl_element!(f16, F16, F16, f16::ZERO, |v| f16::from_f64(v), |s| s.to_f64());
impl_element!(bf16, BF16, BF16, bf16::ZERO, |v| bf16::from_f64(v), |s| s.to_f64());
impl_element!(i64, I64, I64, 0, |v| v as i64, |s| s as f64);
impl_element!(i32, I32, I32, 0, |v| v as i32, |s| s as f64);
impl_element!(i16, I16, I16, 0, |v| v as i16, |s| s as f64);
impl_element!(i8, I8, I8, 0, |v| v as i8, |s| s as f64);
impl_element!(u8, U8, U8, 0, |v| v as u8, |s| s as f64);

/// A scalar value tagged with its dtype.
///
/// Scalars participating in tensor arithmetic and `fill` keep their own
/// dtype and are converted to the kernel dtype explicitly, never reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F64(f64),
    F32(f32),
    F16(f16),
    BF16(bf16),
    I64(i64),
    I32(i32),
    I16(i16),
    I8(i8),
    U8(u8),
}

impl Scalar {
    pub fn dtype(self) -> DataType {
        match self {
            Scalar::F64(_) => F64,
            Scalar::F32(_) => F32,
            Scalar::F16(_) => F16,
            Scalar::BF16(_) => BF16,
            Scalar::I64(_) => I64,
            Scalar::I32(_) => I32,
            Scalar::I16(_) => I16,
            Scalar::I8(_) => I8,
            Scalar::U8(_) => U8,
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Scalar::F64(v) => v,
            Scalar::F32(v) => v as f64,
            Scalar::F16(v) => v.to_f64(),
            Scalar::BF16(v) => v.to_f64(),
            Scalar::I64(v) => v as f64,
            Scalar::I32(v) => v as f64,
            Scalar::I16(v) => v as f64,
            Scalar::I8(v) => v as f64,
            Scalar::U8(v) => v as f64,
        }
    }

    /// Convert to another dtype, host-side.
    pub fn cast(self, dtype: DataType) -> Scalar {
        if self.dtype() == dtype {
            return self;
        }
        let v = self.to_f64();
        match dtype {
            F64 => Scalar::F64(v),
            F32 => Scalar::F32(v as f32),
            F16 => Scalar::F16(f16::from_f64(v)),
            BF16 => Scalar::BF16(bf16::from_f64(v)),
            I64 => Scalar::I64(v as i64),
            I32 => Scalar::I32(v as i32),
            I16 => Scalar::I16(v as i16),
            I8 => Scalar::I8(v as i8),
            U8 => Scalar::U8(v as u8),
        }
    }

    /// Read the scalar as a concrete element type, converting if needed.
    #[inline]
    pub fn get<T: Element>(self) -> T {
        T::from_f64(self.to_f64())
    }

    /// Little-endian byte image of the scalar, for binding as kernel bytes.
    /// Returns the backing array and the number of valid bytes.
    pub fn le_bytes(self) -> ([u8; 8], usize) {
        let mut out = [0u8; 8];
        let n = self.dtype().size_in_bytes();
        match self {
            Scalar::F64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::F32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::F16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::BF16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::I16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::I8(v) => out[..1].copy_from_slice(&v.to_le_bytes()),
            Scalar::U8(v) => out[0] = v,
        }
        (out, n)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::F32(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::I64(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::I32(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(F64.size_in_bytes(), 8);
        assert_eq!(F32.size_in_bytes(), 4);
        assert_eq!(F16.size_in_bytes(), 2);
        assert_eq!(BF16.size_in_bytes(), 2);
        assert_eq!(I64.size_in_bytes(), 8);
        assert_eq!(U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_promotion_is_commutative() {
        for &a in &DataType::ALL {
            for &b in &DataType::ALL {
                assert_eq!(a.promote(b), b.promote(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_promotion_is_idempotent() {
        for &a in &DataType::ALL {
            assert_eq!(a.promote(a), a);
        }
    }

    #[test]
    fn test_promotion_is_associative() {
        for &a in &DataType::ALL {
            for &b in &DataType::ALL {
                for &c in &DataType::ALL {
                    assert_eq!(
                        a.promote(b).promote(c),
                        a.promote(b.promote(c)),
                        "({a:?}, {b:?}, {c:?})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_promotion_rules() {
        assert_eq!(F32.promote(F64), F64);
        assert_eq!(F16.promote(BF16), F32);
        assert_eq!(F16.promote(I64), F16);
        assert_eq!(I32.promote(I8), I32);
        assert_eq!(I8.promote(U8), I16);
        assert_eq!(U8.promote(F32), F32);
    }

    #[test]
    fn test_scalar_cast_and_bytes() {
        let s = Scalar::F64(1.5);
        assert_eq!(s.cast(F32), Scalar::F32(1.5));
        assert_eq!(s.cast(I32), Scalar::I32(1));
        assert_eq!(s.get::<f32>(), 1.5f32);

        let (bytes, n) = Scalar::F32(1.0).le_bytes();
        assert_eq!(n, 4);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_element_roundtrip() {
        assert_eq!(f16::from_f64(0.5).to_f64(), 0.5);
        assert_eq!(<i16 as Element>::from_f64(-3.0), -3i16);
        assert_eq!(3u8.to_scalar(), Scalar::U8(3));
    }
}
