//! The MAT-5 variable model.
//!
//! See the MAT-File Format documentation for the container layout. This
//! module holds the in-memory representation of the variables the recorder
//! emits; [`write`] serializes them and [`read`] parses them back.
//!
//! You probably want the higher-level [`BufferManager`](crate::BufferManager),
//! which assembles these variables from buffered telemetry.

pub mod read;
pub mod write;

pub use read::Reader;
pub use write::{WriteOptions, Writer};

use crate::{TelematError, TelematResult};

/// MAT-5 data element type ids.
///
/// Every piece of a MAT-5 file after the 128-byte header is a tagged data
/// element: a type id, a byte count, and a payload padded to an 8-byte
/// boundary.
pub mod el {
    pub const INT8: u32 = 1;
    pub const UINT8: u32 = 2;
    pub const INT16: u32 = 3;
    pub const UINT16: u32 = 4;
    pub const INT32: u32 = 5;
    pub const UINT32: u32 = 6;
    pub const SINGLE: u32 = 7;
    pub const DOUBLE: u32 = 9;
    pub const INT64: u32 = 12;
    pub const UINT64: u32 = 13;
    pub const MATRIX: u32 = 14;
    pub const COMPRESSED: u32 = 15;
    pub const UTF8: u32 = 16;
    pub const UTF16: u32 = 17;
}

/// MAT-5 array class ids, stored in the array-flags subelement of a matrix.
pub mod class {
    pub const CELL: u32 = 1;
    pub const STRUCT: u32 = 2;
    pub const CHAR: u32 = 4;
    pub const DOUBLE: u32 = 6;
    pub const SINGLE: u32 = 7;
    pub const INT8: u32 = 8;
    pub const UINT8: u32 = 9;
    pub const INT16: u32 = 10;
    pub const UINT16: u32 = 11;
    pub const INT32: u32 = 12;
    pub const UINT32: u32 = 13;
    pub const INT64: u32 = 14;
    pub const UINT64: u32 = 15;
}

macro_rules! numeric_kinds {
    ($( ($variant:ident, $ty:ty, $element:expr, $mat_class:expr, $name:literal) ),* $(,)?) => {
        /// The element type of a numeric MAT array, one per MATLAB numeric
        /// primitive class.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum NumericClass {
            $( $variant, )*
        }

        impl NumericClass {
            /// The array class id ([`class`]) of this element type.
            pub fn mat_class(self) -> u32 {
                match self {
                    $( Self::$variant => $mat_class, )*
                }
            }

            /// The data element type id ([`el`]) that stores this class.
            pub fn element_type(self) -> u32 {
                match self {
                    $( Self::$variant => $element, )*
                }
            }

            /// Bytes per element.
            pub fn element_size(self) -> usize {
                match self {
                    $( Self::$variant => std::mem::size_of::<$ty>(), )*
                }
            }

            /// The MATLAB class name (`"double"`, `"int32"`, ...).
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )*
                }
            }

            pub fn from_mat_class(id: u32) -> Option<Self> {
                $(
                    if id == $mat_class {
                        return Some(Self::$variant);
                    }
                )*
                None
            }
        }

        /// Flat element storage for a numeric MAT array, in column-major
        /// order.
        #[derive(Debug, Clone, PartialEq)]
        pub enum NumericData {
            $( $variant(Vec<$ty>), )*
        }

        impl NumericData {
            pub fn class(&self) -> NumericClass {
                match self {
                    $( Self::$variant(_) => NumericClass::$variant, )*
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $( Self::$variant(v) => v.len(), )*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// An empty buffer of the given class, ready to be extended.
            pub fn with_class(class: NumericClass) -> Self {
                match class {
                    $( NumericClass::$variant => Self::$variant(Vec::new()), )*
                }
            }

            /// Appends the elements of `other` if it has the same class;
            /// returns whether it did.
            pub fn extend_from(&mut self, other: &NumericData) -> bool {
                match (self, other) {
                    $( (Self::$variant(dst), Self::$variant(src)) => {
                        dst.extend_from_slice(src);
                        true
                    } )*
                    _ => false,
                }
            }

            /// The little-endian byte image of the elements.
            pub(crate) fn payload(&self) -> Vec<u8> {
                match self {
                    $( Self::$variant(v) => {
                        let mut bytes = Vec::with_capacity(v.len() * std::mem::size_of::<$ty>());
                        for x in v {
                            bytes.extend_from_slice(&x.to_le_bytes());
                        }
                        bytes
                    } )*
                }
            }

            /// Parses a little-endian byte image back into elements of the
            /// given class. The payload length must be a whole number of
            /// elements.
            pub(crate) fn from_payload(class: NumericClass, payload: &[u8]) -> TelematResult<Self> {
                if payload.len() % class.element_size() != 0 {
                    return Err(TelematError::UnsupportedMatFile(
                        "numeric payload is not a whole number of elements",
                    ));
                }
                Ok(match class {
                    $( NumericClass::$variant => Self::$variant(
                        payload
                            .chunks_exact(std::mem::size_of::<$ty>())
                            .map(|chunk| <$ty>::from_le_bytes(chunk.try_into().unwrap()))
                            .collect(),
                    ), )*
                })
            }

            paste::paste! {
                $(
                    #[doc = concat!("The elements as `", stringify!($ty), "`, if that is their type.")]
                    pub fn [<as_ $ty>](&self) -> Option<&[$ty]> {
                        match self {
                            Self::$variant(v) => Some(v),
                            _ => None,
                        }
                    }
                )*
            }
        }

        $(
            impl From<Vec<$ty>> for NumericData {
                fn from(v: Vec<$ty>) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

numeric_kinds! {
    (Double, f64, el::DOUBLE, class::DOUBLE, "double"),
    (Single, f32, el::SINGLE, class::SINGLE, "single"),
    (Int8, i8, el::INT8, class::INT8, "int8"),
    (UInt8, u8, el::UINT8, class::UINT8, "uint8"),
    (Int16, i16, el::INT16, class::INT16, "int16"),
    (UInt16, u16, el::UINT16, class::UINT16, "uint16"),
    (Int32, i32, el::INT32, class::INT32, "int32"),
    (UInt32, u32, el::UINT32, class::UINT32, "uint32"),
    (Int64, i64, el::INT64, class::INT64, "int64"),
    (UInt64, u64, el::UINT64, class::UINT64, "uint64"),
}

/// A MAT variable: the subset of MAT-5 array classes the recorder uses.
///
/// Dimensions follow the MATLAB convention: data is column-major and arrays
/// have at least two dimensions on disk (a bare vector is written as a
/// `1 x n` row).
#[derive(Debug, Clone, PartialEq)]
pub enum MatVar {
    /// An n-dimensional array of one numeric primitive class.
    Numeric {
        dims: Vec<usize>,
        data: NumericData,
    },
    /// A character array, written as a `1 x n` row of UTF-16 code units.
    Char { text: String },
    /// A cell array; every cell is itself a full variable.
    Cell {
        dims: Vec<usize>,
        cells: Vec<MatVar>,
    },
    /// A struct array with a shared field table. `elements[i][j]` is field
    /// `fields[j]` of the `i`-th element (elements in column-major order).
    Struct {
        dims: Vec<usize>,
        fields: Vec<String>,
        elements: Vec<Vec<MatVar>>,
    },
}

impl MatVar {
    /// A `1 x n` numeric row vector.
    pub fn row(data: impl Into<NumericData>) -> Self {
        let data = data.into();
        Self::Numeric {
            dims: vec![1, data.len()],
            data,
        }
    }

    /// A character array.
    pub fn string(text: impl Into<String>) -> Self {
        Self::Char { text: text.into() }
    }

    /// A `1 x n` cell row.
    pub fn cell_row(cells: Vec<MatVar>) -> Self {
        Self::Cell {
            dims: vec![1, cells.len()],
            cells,
        }
    }

    /// An `n x 1` cell column.
    pub fn cell_column(cells: Vec<MatVar>) -> Self {
        Self::Cell {
            dims: vec![cells.len(), 1],
            cells,
        }
    }

    /// A `1 x 1` struct from `(field, value)` pairs, keeping their order.
    pub fn scalar_struct(fields: Vec<(String, MatVar)>) -> Self {
        let (names, values): (Vec<_>, Vec<_>) = fields.into_iter().unzip();
        Self::Struct {
            dims: vec![1, 1],
            fields: names,
            elements: vec![values],
        }
    }

    /// The dimensions as written to disk.
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Numeric { dims, .. } | Self::Cell { dims, .. } | Self::Struct { dims, .. } => {
                dims.clone()
            }
            Self::Char { text } => vec![1, text.encode_utf16().count()],
        }
    }

    /// Looks a field up by name in a `1 x 1` struct.
    pub fn field(&self, name: &str) -> Option<&MatVar> {
        match self {
            Self::Struct {
                fields, elements, ..
            } => {
                let index = fields.iter().position(|f| f == name)?;
                elements.first()?.get(index)
            }
            _ => None,
        }
    }

    /// The field names of a struct, in order.
    pub fn field_names(&self) -> Option<&[String]> {
        match self {
            Self::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub(crate) fn check(&self) -> TelematResult<()> {
        match self {
            Self::Numeric { dims, data } => {
                if dims.iter().product::<usize>() != data.len() {
                    return Err(TelematError::MalformedVariable(
                        "numeric data length does not match its dimensions",
                    ));
                }
            }
            Self::Char { .. } => {}
            Self::Cell { dims, cells } => {
                if dims.iter().product::<usize>() != cells.len() {
                    return Err(TelematError::MalformedVariable(
                        "cell count does not match the cell array dimensions",
                    ));
                }
                for cell in cells {
                    cell.check()?;
                }
            }
            Self::Struct {
                dims,
                fields,
                elements,
            } => {
                if dims.iter().product::<usize>() != elements.len() {
                    return Err(TelematError::MalformedVariable(
                        "element count does not match the struct array dimensions",
                    ));
                }
                for element in elements {
                    if element.len() != fields.len() {
                        return Err(TelematError::MalformedVariable(
                            "struct element does not cover the field table",
                        ));
                    }
                    for value in element {
                        value.check()?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_classes_round_trip_their_ids() {
        for class in [
            NumericClass::Double,
            NumericClass::Single,
            NumericClass::Int8,
            NumericClass::UInt64,
        ] {
            assert_eq!(NumericClass::from_mat_class(class.mat_class()), Some(class));
        }
        assert_eq!(NumericClass::from_mat_class(class::CELL), None);
    }

    #[test]
    fn payload_round_trips() {
        let data = NumericData::Int32(vec![-1, 0, 7]);
        let payload = data.payload();
        assert_eq!(payload.len(), 12);
        let back = NumericData::from_payload(NumericClass::Int32, &payload).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn extend_from_rejects_other_classes() {
        let mut data = NumericData::Double(vec![1.0]);
        assert!(data.extend_from(&NumericData::Double(vec![2.0])));
        assert!(!data.extend_from(&NumericData::Int32(vec![3])));
        assert_eq!(data.as_f64(), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn scalar_struct_field_lookup() {
        let var = MatVar::scalar_struct(vec![
            ("a".to_string(), MatVar::row(vec![1.0f64])),
            ("b".to_string(), MatVar::string("hello")),
        ]);
        assert_eq!(var.field("b"), Some(&MatVar::string("hello")));
        assert_eq!(var.field("c"), None);
    }

    #[test]
    fn check_catches_shape_lies() {
        let bad = MatVar::Numeric {
            dims: vec![2, 2],
            data: NumericData::Double(vec![1.0]),
        };
        assert!(bad.check().is_err());
        assert!(MatVar::row(vec![1.0f64, 2.0]).check().is_ok());
    }
}
