//! The sample values a channel can carry.

use crate::mat::{MatVar, NumericData};

/// One sample, as accepted by [`push`](crate::BufferManager::push).
///
/// A channel stores values of exactly one kind, fixed by its first push:
/// numeric samples of one primitive class (concatenated into a single
/// multi-dimensional array on flush), named records (concatenated into a
/// struct array), or opaque MAT variables (collected into a cell array).
///
/// Numeric values are flat element buffers; the channel's declared
/// dimensions give them their shape. `From` impls cover scalars, vectors,
/// slices, and fixed-size arrays of the ten numeric primitives, so call
/// sites can push plain Rust values:
///
/// ```
/// use telemat::Value;
///
/// let scalar = Value::from(3.5f64);
/// let vector = Value::from(vec![1.0f32, 2.0]);
/// let matrix = Value::from([1i32, 2, 3, 4, 5, 6]);
/// assert_eq!(matrix.type_name(), "int32");
/// ```
#[derive(Debug, Clone)]
pub enum Value {
    /// Flat numeric elements of one primitive class.
    Numeric(NumericData),
    /// A record with named fields, in declaration order.
    Record(Vec<(String, Value)>),
    /// An arbitrary prebuilt MAT variable, stored opaquely.
    Any(MatVar),
}

impl Value {
    /// A record value from `(field, value)` pairs.
    pub fn record(fields: Vec<(String, Value)>) -> Self {
        Self::Record(fields)
    }

    /// The element type tag bound to a channel on its first push:
    /// the MATLAB class name for numeric values, `"struct"` for records,
    /// `"any"` for opaque variables.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Numeric(data) => data.class().name(),
            Self::Record(_) => "struct",
            Self::Any(_) => "any",
        }
    }

    /// The flat element count of a numeric value; records and opaque
    /// variables have no flat count and skip the shape check.
    pub(crate) fn element_count(&self) -> Option<usize> {
        match self {
            Self::Numeric(data) => Some(data.len()),
            _ => None,
        }
    }

    /// Renders one instant as a standalone MAT variable. Used for record
    /// fields and opaque cells, where the channel dimensions do not apply.
    pub(crate) fn to_mat(&self) -> MatVar {
        match self {
            Self::Numeric(data) => MatVar::row(data.clone()),
            Self::Record(fields) => MatVar::scalar_struct(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_mat()))
                    .collect(),
            ),
            Self::Any(var) => var.clone(),
        }
    }
}

impl From<MatVar> for Value {
    fn from(var: MatVar) -> Self {
        Self::Any(var)
    }
}

macro_rules! numeric_values {
    ($( $ty:ty ),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(x: $ty) -> Self {
                    Self::Numeric(NumericData::from(vec![x]))
                }
            }

            impl From<Vec<$ty>> for Value {
                fn from(v: Vec<$ty>) -> Self {
                    Self::Numeric(NumericData::from(v))
                }
            }

            impl From<&[$ty]> for Value {
                fn from(v: &[$ty]) -> Self {
                    Self::Numeric(NumericData::from(v.to_vec()))
                }
            }

            impl<const N: usize> From<[$ty; N]> for Value {
                fn from(v: [$ty; N]) -> Self {
                    Self::Numeric(NumericData::from(v.to_vec()))
                }
            }
        )*
    };
}

numeric_values!(f64, f32, i8, u8, i16, u16, i32, u32, i64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_pick_the_right_class() {
        assert_eq!(Value::from(1.0f64).type_name(), "double");
        assert_eq!(Value::from(vec![1u8, 2]).type_name(), "uint8");
        assert_eq!(Value::from(&[1i64, 2][..]).type_name(), "int64");
        assert_eq!(Value::from([0u16; 4]).type_name(), "uint16");
    }

    #[test]
    fn element_counts() {
        assert_eq!(Value::from(2.5f32).element_count(), Some(1));
        assert_eq!(Value::from([1i32, 2, 3]).element_count(), Some(3));
        assert_eq!(Value::record(vec![]).element_count(), None);
        assert_eq!(Value::from(MatVar::string("x")).element_count(), None);
    }

    #[test]
    fn record_renders_as_scalar_struct() {
        let value = Value::record(vec![
            ("position".to_string(), Value::from([1.0f64, 2.0, 3.0])),
            ("valid".to_string(), Value::from(1u8)),
        ]);
        assert_eq!(value.type_name(), "struct");
        let var = value.to_mat();
        assert_eq!(
            var.field_names().map(<[String]>::to_vec),
            Some(vec!["position".to_string(), "valid".to_string()])
        );
        assert_eq!(
            var.field("position"),
            Some(&MatVar::row(vec![1.0f64, 2.0, 3.0]))
        );
    }
}
