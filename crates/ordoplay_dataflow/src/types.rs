// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data types that flow through connections, type policies for polymorphic
//! connections, and the [`DataflowValue`] trait that binds Rust types to them.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;

/// Data type carried by a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean value
    Bool,
    /// 64-bit float
    F64,
    /// 32-bit float
    F32,
    /// Signed 64-bit integer
    I64,
    /// Unsigned 64-bit integer
    U64,
    /// Signed 32-bit integer
    I32,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 16-bit integer
    U16,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 8-bit integer
    U8,
    /// Owned string
    String,
    /// Interned-style identifier
    Name,
    /// Polymorphic connection; the policy lists which concrete types it accepts
    Any(TypePolicy),
    /// Domain type registered by name
    Custom(String),
}

impl DataType {
    /// Numeric "any" type used by generic math nodes
    pub fn any_numeric() -> Self {
        Self::Any(TypePolicy::Numeric)
    }

    /// Fully unconstrained "any" type
    pub fn any() -> Self {
        Self::Any(TypePolicy::AllTypes)
    }

    /// Whether this is a polymorphic type
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any(_))
    }

    /// Whether this is one of the built-in numeric types
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::F64
                | Self::F32
                | Self::I64
                | Self::U64
                | Self::I32
                | Self::U32
                | Self::I16
                | Self::U16
                | Self::I8
                | Self::U8
        )
    }

    /// Whether this is a string-like type
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String | Self::Name)
    }

    /// Stable name, used as the key of the cache serializer registry
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Self::Bool => Cow::Borrowed("bool"),
            Self::F64 => Cow::Borrowed("f64"),
            Self::F32 => Cow::Borrowed("f32"),
            Self::I64 => Cow::Borrowed("i64"),
            Self::U64 => Cow::Borrowed("u64"),
            Self::I32 => Cow::Borrowed("i32"),
            Self::U32 => Cow::Borrowed("u32"),
            Self::I16 => Cow::Borrowed("i16"),
            Self::U16 => Cow::Borrowed("u16"),
            Self::I8 => Cow::Borrowed("i8"),
            Self::U8 => Cow::Borrowed("u8"),
            Self::String => Cow::Borrowed("String"),
            Self::Name => Cow::Borrowed("Name"),
            Self::Any(policy) => Cow::Owned(format!("Any<{policy}>")),
            Self::Custom(name) => Cow::Borrowed(name.as_str()),
        }
    }

    /// Whether a value of `other` may be bound to a connection of this type
    pub fn supports(&self, other: &DataType) -> bool {
        match self {
            Self::Any(policy) => policy.supports(other),
            _ => self == other,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Set of concrete types accepted by an "any" connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypePolicy {
    /// Accepts every concrete type
    AllTypes,
    /// Built-in numeric types
    Numeric,
    /// `String` and `Name`
    String,
    /// Strings plus anything that prints to a string (numbers and booleans)
    StringConvertible,
    /// Exactly one type
    Single(Box<DataType>),
    /// An explicit list of types
    Multi(Vec<DataType>),
}

impl TypePolicy {
    /// Whether the policy accepts `data_type`. "Any" types are never accepted.
    pub fn supports(&self, data_type: &DataType) -> bool {
        if data_type.is_any() {
            return false;
        }
        match self {
            Self::AllTypes => true,
            Self::Numeric => data_type.is_numeric(),
            Self::String => data_type.is_string(),
            Self::StringConvertible => {
                data_type.is_string() || data_type.is_numeric() || *data_type == DataType::Bool
            }
            Self::Single(single) => single.as_ref() == data_type,
            Self::Multi(types) => types.contains(data_type),
        }
    }
}

impl fmt::Display for TypePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllTypes => f.write_str("AllTypes"),
            Self::Numeric => f.write_str("Numeric"),
            Self::String => f.write_str("String"),
            Self::StringConvertible => f.write_str("StringConvertible"),
            Self::Single(single) => write!(f, "{single}"),
            Self::Multi(types) => {
                let names: Vec<_> = types.iter().map(DataType::name).collect();
                f.write_str(&names.join("|"))
            }
        }
    }
}

/// Identifier value, the `Name` data type
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name(pub String);

impl Name {
    /// Create a new name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// A Rust type that can be stored in the evaluation cache
pub trait DataflowValue: Any + Clone + Send + Sync {
    /// Connection type this Rust type maps to
    fn data_type() -> DataType;

    /// Read a cached value, converting from a compatible representation when possible
    fn from_cached(value: &dyn Any) -> Option<Self> {
        value.downcast_ref::<Self>().cloned()
    }
}

macro_rules! numeric_values {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl DataflowValue for $ty {
                fn data_type() -> DataType {
                    DataType::$variant
                }

                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::unnecessary_cast)]
                fn from_cached(value: &dyn Any) -> Option<Self> {
                    if let Some(exact) = value.downcast_ref::<Self>() {
                        return Some(*exact);
                    }
                    numeric_as_f64(value).map(|converted| converted as $ty)
                }
            }
        )*

        /// Widen any built-in numeric value to `f64`
        #[allow(clippy::cast_precision_loss, clippy::cast_lossless, clippy::unnecessary_cast)]
        pub fn numeric_as_f64(value: &dyn Any) -> Option<f64> {
            $(
                if let Some(number) = value.downcast_ref::<$ty>() {
                    return Some(*number as f64);
                }
            )*
            None
        }
    };
}

numeric_values! {
    f64 => F64,
    f32 => F32,
    i64 => I64,
    u64 => U64,
    i32 => I32,
    u32 => U32,
    i16 => I16,
    u16 => U16,
    i8 => I8,
    u8 => U8,
}

impl DataflowValue for bool {
    fn data_type() -> DataType {
        DataType::Bool
    }
}

impl DataflowValue for String {
    fn data_type() -> DataType {
        DataType::String
    }

    fn from_cached(value: &dyn Any) -> Option<Self> {
        if let Some(text) = value.downcast_ref::<String>() {
            return Some(text.clone());
        }
        if let Some(name) = value.downcast_ref::<Name>() {
            return Some(name.0.clone());
        }
        if let Some(flag) = value.downcast_ref::<bool>() {
            return Some(flag.to_string());
        }
        numeric_as_f64(value).map(|number| number.to_string())
    }
}

impl DataflowValue for Name {
    fn data_type() -> DataType {
        DataType::Name
    }

    fn from_cached(value: &dyn Any) -> Option<Self> {
        if let Some(name) = value.downcast_ref::<Name>() {
            return Some(name.clone());
        }
        value.downcast_ref::<String>().map(|text| Name(text.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_policy() {
        let policy = TypePolicy::Numeric;
        assert!(policy.supports(&DataType::F64));
        assert!(policy.supports(&DataType::U8));
        assert!(!policy.supports(&DataType::String));
        assert!(!policy.supports(&DataType::any_numeric()));
    }

    #[test]
    fn test_string_convertible_policy() {
        let policy = TypePolicy::StringConvertible;
        assert!(policy.supports(&DataType::Name));
        assert!(policy.supports(&DataType::Bool));
        assert!(policy.supports(&DataType::I32));
        assert!(!policy.supports(&DataType::Custom("Mesh".into())));
    }

    #[test]
    fn test_single_and_multi_policies() {
        let single = TypePolicy::Single(Box::new(DataType::F32));
        assert!(single.supports(&DataType::F32));
        assert!(!single.supports(&DataType::F64));

        let multi = TypePolicy::Multi(vec![DataType::Bool, DataType::Name]);
        assert!(multi.supports(&DataType::Name));
        assert!(!multi.supports(&DataType::String));
    }

    #[test]
    fn test_numeric_conversion_on_read() {
        let cached: Box<dyn Any> = Box::new(7_i32);
        assert_eq!(f64::from_cached(cached.as_ref()), Some(7.0));
        assert_eq!(u8::from_cached(cached.as_ref()), Some(7));
        assert_eq!(String::from_cached(cached.as_ref()).as_deref(), Some("7"));
        assert_eq!(bool::from_cached(cached.as_ref()), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(DataType::F64.name(), "f64");
        assert_eq!(DataType::any_numeric().to_string(), "Any<Numeric>");
        assert_eq!(DataType::Custom("ClothCollection".into()).name(), "ClothCollection");
    }
}
