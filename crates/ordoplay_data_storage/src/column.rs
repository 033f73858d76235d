// SPDX-License-Identifier: MIT OR Apache-2.0
//! Column types.
//!
//! A table's composition is a set of [`ColumnKey`]s. Data columns store one
//! value per row, tags only mark rows, and dynamic tags are `(tag, value)`
//! pairs whose value string is interned by the storage and shared by every
//! row that carries it.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Whether a column stores per-row data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// One value per row
    Data,
    /// Marker without data
    Tag,
}

/// A type that can be stored as a column.
///
/// Tags override [`Column::KIND`]:
///
/// ```ignore
/// #[derive(Default, Clone)]
/// struct Selected;
/// impl Column for Selected {
///     const KIND: ColumnKind = ColumnKind::Tag;
/// }
/// ```
pub trait Column: Any + Default + Clone + Send + Sync {
    /// Data or tag
    const KIND: ColumnKind = ColumnKind::Data;
}

/// Runtime description of a [`Column`] type
#[derive(Clone, Copy)]
pub struct ColumnType {
    id: TypeId,
    name: &'static str,
    kind: ColumnKind,
    new_storage: fn() -> Box<dyn ColumnStorage>,
}

impl ColumnType {
    /// Describe `T`
    pub fn of<T: Column>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name(std::any::type_name::<T>()),
            kind: T::KIND,
            new_storage: new_typed_storage::<T>,
        }
    }

    /// Rust type id
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Short type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Data or tag
    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    /// Whether this column carries no data
    pub fn is_tag(&self) -> bool {
        self.kind == ColumnKind::Tag
    }

    pub(crate) fn new_storage(&self) -> Box<dyn ColumnStorage> {
        (self.new_storage)()
    }
}

impl PartialEq for ColumnType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ColumnType {}

impl Hash for ColumnType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for ColumnType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Debug for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn new_typed_storage<T: Column>() -> Box<dyn ColumnStorage> {
    Box::new(TypedColumn::<T>::default())
}

fn short_type_name(full: &'static str) -> &'static str {
    let path = full.split('<').next().unwrap_or(full);
    let start = path.rfind("::").map_or(0, |position| position + 2);
    &full[start..]
}

/// Name of a value-parameterized tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicTag(pub Cow<'static, str>);

impl DynamicTag {
    /// Tag with a static name
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Tag name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<String> for DynamicTag {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for DynamicTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Member of a table composition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnKey {
    /// A [`Column`] type, data or tag
    Type(ColumnType),
    /// A dynamic tag with its interned value
    DynamicTag {
        /// Tag name
        tag: DynamicTag,
        /// Shared value
        value: Arc<str>,
    },
}

impl ColumnKey {
    /// Key for column type `T`
    pub fn of<T: Column>() -> Self {
        Self::Type(ColumnType::of::<T>())
    }

    /// Column type, when this is not a dynamic tag
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Type(column) => Some(*column),
            Self::DynamicTag { .. } => None,
        }
    }

    /// Dynamic tag name, when this is one
    pub fn dynamic_tag(&self) -> Option<&DynamicTag> {
        match self {
            Self::Type(_) => None,
            Self::DynamicTag { tag, .. } => Some(tag),
        }
    }

    /// Whether rows store a value for this key
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Type(column) if column.kind() == ColumnKind::Data)
    }
}

impl From<ColumnType> for ColumnKey {
    fn from(column: ColumnType) -> Self {
        Self::Type(column)
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(column) => write!(f, "{column}"),
            Self::DynamicTag { tag, value } => write!(f, "{tag}={value}"),
        }
    }
}

/// A boxed column value, used wherever a value outlives a borrow of its table
pub trait ColumnValue: Any + Send + Sync {
    /// Column the value belongs to
    fn column_type(&self) -> ColumnType;
    /// Deep copy
    fn clone_value(&self) -> Box<dyn ColumnValue>;
    /// Downcast helper
    fn as_any(&self) -> &dyn Any;
    /// Downcast helper
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Downcast helper
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Column> ColumnValue for T {
    fn column_type(&self) -> ColumnType {
        ColumnType::of::<T>()
    }

    fn clone_value(&self) -> Box<dyn ColumnValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl fmt::Debug for dyn ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColumnValue({})", self.column_type())
    }
}

/// Type-erased storage for one data column of one table
pub(crate) trait ColumnStorage: Send + Sync {
    fn len(&self) -> usize;
    fn push_default(&mut self);
    fn set_value(&mut self, index: usize, value: Box<dyn ColumnValue>) -> bool;
    fn value(&self, index: usize) -> Option<Box<dyn ColumnValue>>;
    fn swap_remove(&mut self, index: usize);
    /// Swap-remove the value at `index` and append it to `target`
    fn transfer(&mut self, index: usize, target: &mut dyn ColumnStorage);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct TypedColumn<T> {
    pub(crate) values: Vec<T>,
}

impl<T> Default for TypedColumn<T> {
    fn default() -> Self {
        Self { values: Vec::new() }
    }
}

impl<T: Column> ColumnStorage for TypedColumn<T> {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn push_default(&mut self) {
        self.values.push(T::default());
    }

    fn set_value(&mut self, index: usize, value: Box<dyn ColumnValue>) -> bool {
        let Some(slot) = self.values.get_mut(index) else {
            return false;
        };
        match value.into_any().downcast::<T>() {
            Ok(value) => {
                *slot = *value;
                true
            }
            Err(_) => false,
        }
    }

    fn value(&self, index: usize) -> Option<Box<dyn ColumnValue>> {
        self.values.get(index).map(|value| Box::new(value.clone()) as Box<dyn ColumnValue>)
    }

    fn swap_remove(&mut self, index: usize) {
        if index < self.values.len() {
            self.values.swap_remove(index);
        }
    }

    fn transfer(&mut self, index: usize, target: &mut dyn ColumnStorage) {
        if index >= self.values.len() {
            target.push_default();
            return;
        }
        let value = self.values.swap_remove(index);
        match target.as_any_mut().downcast_mut::<TypedColumn<T>>() {
            Some(target) => target.values.push(value),
            None => target.push_default(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position(f32);
    impl Column for Position {}

    #[derive(Default, Clone)]
    struct Selected;
    impl Column for Selected {
        const KIND: ColumnKind = ColumnKind::Tag;
    }

    #[test]
    fn test_column_type_identity() {
        let position = ColumnType::of::<Position>();
        assert_eq!(position, ColumnType::of::<Position>());
        assert_ne!(position, ColumnType::of::<Selected>());
        assert_eq!(position.name(), "Position");
        assert!(ColumnType::of::<Selected>().is_tag());
        assert!(ColumnKey::of::<Position>().is_data());
        assert!(!ColumnKey::of::<Selected>().is_data());
    }

    #[test]
    fn test_short_type_name_keeps_generics() {
        assert_eq!(short_type_name("a::b::Thing"), "Thing");
        assert_eq!(short_type_name("a::Wrapper<b::Inner>"), "Wrapper<b::Inner>");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_transfer_moves_value() {
        let mut source = TypedColumn::<Position> {
            values: vec![Position(1.0), Position(2.0), Position(3.0)],
        };
        let mut target = TypedColumn::<Position>::default();
        source.transfer(0, &mut target);
        assert_eq!(target.values, vec![Position(1.0)]);
        assert_eq!(source.values, vec![Position(3.0), Position(2.0)]);
    }

    #[test]
    fn test_boxed_value_roundtrip() {
        let boxed: Box<dyn ColumnValue> = Box::new(Position(4.0));
        assert_eq!(boxed.column_type(), ColumnType::of::<Position>());
        let copy = boxed.clone_value();
        assert_eq!(copy.as_any().downcast_ref::<Position>(), Some(&Position(4.0)));
    }
}
