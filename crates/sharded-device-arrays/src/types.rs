//! Element types and abstract values (i.e., shape and element type metadata) of sharded device arrays.

use std::fmt::Display;

use half::{bf16, f16};

use crate::errors::Error;

/// Represents the primitive element types that can be stored in device buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// [`ElementType`] that represents `true`/`false` values, stored using one byte per value.
    Boolean,

    /// [`ElementType`] that represents signed 8-bit integer values.
    I8,

    /// [`ElementType`] that represents signed 16-bit integer values.
    I16,

    /// [`ElementType`] that represents signed 32-bit integer values.
    I32,

    /// [`ElementType`] that represents signed 64-bit integer values.
    I64,

    /// [`ElementType`] that represents unsigned 8-bit integer values.
    U8,

    /// [`ElementType`] that represents unsigned 16-bit integer values.
    U16,

    /// [`ElementType`] that represents unsigned 32-bit integer values.
    U32,

    /// [`ElementType`] that represents unsigned 64-bit integer values.
    U64,

    /// [`ElementType`] that represents IEEE 754 half-precision floating-point values.
    F16,

    /// [`ElementType`] that represents [brain floating-point](https://en.wikipedia.org/wiki/Bfloat16_floating-point_format)
    /// values (i.e., 16-bit values with 8 exponent bits and 7 mantissa bits).
    BF16,

    /// [`ElementType`] that represents IEEE 754 single-precision floating-point values.
    F32,

    /// [`ElementType`] that represents IEEE 754 double-precision floating-point values.
    F64,

    /// [`ElementType`] that represents complex values made out of two [`ElementType::F32`] values.
    C64,

    /// [`ElementType`] that represents complex values made out of two [`ElementType::F64`] values.
    C128,
}

impl ElementType {
    /// Returns the number of bytes that a single value of this [`ElementType`] occupies in a dense buffer.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Boolean | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
        }
    }
}

impl Display for ElementType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Boolean => "bool",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::C64 => "complex64",
            Self::C128 => "complex128",
        };
        write!(formatter, "{name}")
    }
}

/// Rust scalar types that can be stored in host buffers and snapshots.
pub trait Element: Copy {
    /// [`ElementType`] that corresponds to this Rust type.
    const ELEMENT_TYPE: ElementType;

    /// Appends the native-endian byte representation of this value to `bytes`.
    fn extend_ne_bytes(self, bytes: &mut Vec<u8>);

    /// Reads a value from its native-endian byte representation. `bytes` must contain exactly
    /// [`ElementType::size_in_bytes`] bytes.
    fn from_ne_bytes(bytes: &[u8]) -> Self;
}

macro_rules! impl_element_for_scalar {
    ($ty:ty, $element_type:expr) => {
        impl Element for $ty {
            const ELEMENT_TYPE: ElementType = $element_type;

            fn extend_ne_bytes(self, bytes: &mut Vec<u8>) {
                bytes.extend_from_slice(&self.to_ne_bytes());
            }

            fn from_ne_bytes(bytes: &[u8]) -> Self {
                <$ty>::from_ne_bytes(bytes.try_into().expect("byte count should match the element type size"))
            }
        }
    };
}

impl_element_for_scalar!(i8, ElementType::I8);
impl_element_for_scalar!(i16, ElementType::I16);
impl_element_for_scalar!(i32, ElementType::I32);
impl_element_for_scalar!(i64, ElementType::I64);
impl_element_for_scalar!(u8, ElementType::U8);
impl_element_for_scalar!(u16, ElementType::U16);
impl_element_for_scalar!(u32, ElementType::U32);
impl_element_for_scalar!(u64, ElementType::U64);
impl_element_for_scalar!(f16, ElementType::F16);
impl_element_for_scalar!(bf16, ElementType::BF16);
impl_element_for_scalar!(f32, ElementType::F32);
impl_element_for_scalar!(f64, ElementType::F64);

impl Element for bool {
    const ELEMENT_TYPE: ElementType = ElementType::Boolean;

    fn extend_ne_bytes(self, bytes: &mut Vec<u8>) {
        bytes.push(u8::from(self));
    }

    fn from_ne_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Encodes `values` as a dense native-endian byte buffer.
pub(crate) fn values_to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * T::ELEMENT_TYPE.size_in_bytes());
    values.iter().for_each(|value| value.extend_ne_bytes(&mut bytes));
    bytes
}

/// Decodes a dense native-endian byte buffer that holds values of type `T`.
pub(crate) fn values_from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::ELEMENT_TYPE.size_in_bytes()).map(T::from_ne_bytes).collect()
}

/// Abstract value of an array: its logical (i.e., global) shape and its element type. This carries no reference to
/// any device storage and so it remains valid for the whole lifetime of the array that it describes, including after
/// that array has been deleted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Aval {
    shape: Vec<usize>,
    element_type: ElementType,
}

impl Aval {
    /// Creates a new [`Aval`].
    pub fn new(shape: Vec<usize>, element_type: ElementType) -> Self {
        Self { shape, element_type }
    }

    /// Logical shape of the array.
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    /// Element type of the array.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Number of elements in the array (i.e., the product of all dimension sizes, which is `1` for scalars), or
    /// [`None`] if that product does not fit in a [`usize`].
    pub fn size(&self) -> Option<usize> {
        if self.shape.contains(&0) {
            return Some(0);
        }
        self.shape.iter().try_fold(1usize, |size, dimension| size.checked_mul(*dimension))
    }

    /// Number of dimensions of the array.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of bytes that a dense host copy of the array occupies, or [`None`] if it does not fit in a [`usize`].
    pub fn size_in_bytes(&self) -> Option<usize> {
        self.size()?.checked_mul(self.element_type.size_in_bytes())
    }
}

impl Display for Aval {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dimensions = self.shape.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(formatter, "{}[{}]", self.element_type, dimensions.join(","))
    }
}

/// Dense host copy of an array.
///
/// Sharded device arrays expose a slot for such a copy so that hosts that materialize array contents (e.g., for
/// printing or conversion to host arrays) can cache them. The array itself never populates that slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostSnapshot {
    aval: Aval,
    bytes: Vec<u8>,
}

impl HostSnapshot {
    /// Creates a new [`HostSnapshot`] from native-endian `bytes`, checking that their length matches `aval`. Fails
    /// with [`Error::SizeOverflow`] if the size of `aval` in bytes does not fit in a [`usize`].
    pub fn new(aval: Aval, bytes: Vec<u8>) -> Result<Self, Error> {
        let expected = aval.size_in_bytes().ok_or_else(|| Error::size_overflow(&aval))?;
        if bytes.len() != expected {
            return Err(Error::byte_length_mismatch(expected, bytes.len()));
        }
        Ok(Self { aval, bytes })
    }

    /// Creates a new [`HostSnapshot`] with the provided `shape` that holds `values`.
    pub fn from_values<T: Element>(shape: Vec<usize>, values: &[T]) -> Result<Self, Error> {
        Self::new(Aval::new(shape, T::ELEMENT_TYPE), values_to_bytes(values))
    }

    /// Abstract value of this snapshot.
    pub fn aval(&self) -> &Aval {
        &self.aval
    }

    /// Native-endian contents of this snapshot.
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Returns the contents of this snapshot as values of type `T`, in row-major order.
    pub fn to_values<T: Element>(&self) -> Result<Vec<T>, Error> {
        if T::ELEMENT_TYPE != self.aval.element_type() {
            return Err(Error::element_type_mismatch(self.aval.element_type(), T::ELEMENT_TYPE));
        }
        Ok(values_from_bytes(self.bytes.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_element_type_sizes() {
        assert_eq!(ElementType::Boolean.size_in_bytes(), 1);
        assert_eq!(ElementType::BF16.size_in_bytes(), 2);
        assert_eq!(ElementType::F32.size_in_bytes(), 4);
        assert_eq!(ElementType::C64.size_in_bytes(), 8);
        assert_eq!(ElementType::C128.size_in_bytes(), 16);
    }

    #[test]
    fn test_aval() {
        let aval = Aval::new(vec![8, 8], ElementType::F32);
        assert_eq!(aval.size(), Some(64));
        assert_eq!(aval.ndim(), 2);
        assert_eq!(aval.size_in_bytes(), Some(256));
        assert_eq!(aval.to_string(), "float32[8,8]");

        let scalar = Aval::new(Vec::new(), ElementType::I64);
        assert_eq!(scalar.size(), Some(1));
        assert_eq!(scalar.ndim(), 0);
        assert_eq!(scalar.to_string(), "int64[]");

        let empty = Aval::new(vec![4, 0, 2], ElementType::Boolean);
        assert_eq!(empty.size(), Some(0));
        assert_eq!(empty.ndim(), 3);

        let huge = Aval::new(vec![usize::MAX / 2, 4], ElementType::F32);
        assert_eq!(huge.size(), None);
        assert_eq!(huge.size_in_bytes(), None);
        let wide = Aval::new(vec![usize::MAX / 2], ElementType::I32);
        assert_eq!(wide.size(), Some(usize::MAX / 2));
        assert_eq!(wide.size_in_bytes(), None);
        assert_eq!(Aval::new(vec![usize::MAX / 2, 4, 0], ElementType::F32).size(), Some(0));
    }

    #[test]
    fn test_host_snapshot() {
        let snapshot = HostSnapshot::from_values(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(snapshot.aval(), &Aval::new(vec![2, 2], ElementType::F32));
        assert_eq!(snapshot.bytes().len(), 16);
        assert_eq!(snapshot.to_values::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(matches!(
            snapshot.to_values::<i32>(),
            Err(Error::ElementTypeMismatch { expected: ElementType::F32, actual: ElementType::I32, .. }),
        ));

        let snapshot = HostSnapshot::from_values(vec![3], &[bf16::from_f32(0.5), bf16::ONE, bf16::ZERO]).unwrap();
        assert_eq!(snapshot.to_values::<bf16>().unwrap(), vec![bf16::from_f32(0.5), bf16::ONE, bf16::ZERO]);

        let snapshot = HostSnapshot::from_values(vec![2], &[true, false]).unwrap();
        assert_eq!(snapshot.to_values::<bool>().unwrap(), vec![true, false]);

        assert!(matches!(
            HostSnapshot::from_values(vec![3], &[1u16, 2u16]),
            Err(Error::ByteLengthMismatch { expected: 6, actual: 4, .. }),
        ));
        assert!(matches!(
            HostSnapshot::new(Aval::new(vec![usize::MAX / 2, 4], ElementType::F32), Vec::new()),
            Err(Error::SizeOverflow { aval, .. }) if aval.starts_with("float32["),
        ));
    }
}
