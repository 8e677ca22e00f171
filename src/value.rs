use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Dynamic value held by form nodes.
///
/// Group nodes fold their children into `Map` (object groups) or `List`
/// (array groups); fields hold whatever their widget produces. Maps keep
/// insertion order so aggregated objects list children in mount order.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FormValue {
    #[default]
    Null,
    Bool(bool),
    Number(Decimal),
    Text(String),
    List(Vec<FormValue>),
    Map(IndexMap<String, FormValue>),
    Opaque(OpaqueValue),
}

/// Application value compared by identity instead of structure.
#[derive(Clone)]
pub struct OpaqueValue(Arc<dyn Any + Send + Sync>);

impl OpaqueValue {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for OpaqueValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Opaque(..)")
    }
}

impl FormValue {
    pub fn empty_map() -> Self {
        FormValue::Map(IndexMap::new())
    }

    pub fn empty_list() -> Self {
        FormValue::List(Vec::new())
    }

    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, FormValue)>,
        K: Into<String>,
    {
        FormValue::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FormValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FormValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FormValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FormValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FormValue]> {
        match self {
            FormValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, FormValue>> {
        match self {
            FormValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&OpaqueValue> {
        match self {
            FormValue::Opaque(value) => Some(value),
            _ => None,
        }
    }

    /// Looks up one path segment: a map key, or a list index.
    pub fn get(&self, segment: &str) -> Option<&FormValue> {
        match self {
            FormValue::Map(entries) => entries.get(segment),
            FormValue::List(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        }
    }

    /// Follows a sequence of segments from this value.
    pub fn lookup<'a, I>(&self, segments: I) -> Option<&FormValue>
    where
        I: IntoIterator<Item = &'a str>,
    {
        segments
            .into_iter()
            .try_fold(self, |current, segment| current.get(segment))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FormValue::Null | FormValue::Opaque(_) => serde_json::Value::Null,
            FormValue::Bool(value) => serde_json::Value::Bool(*value),
            FormValue::Number(value) => decimal_to_json(*value),
            FormValue::Text(value) => serde_json::Value::String(value.clone()),
            FormValue::List(items) => {
                serde_json::Value::Array(items.iter().map(FormValue::to_json).collect())
            }
            FormValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

fn decimal_to_json(value: Decimal) -> serde_json::Value {
    if value.fract().is_zero() {
        if let Some(integer) = value.to_i64() {
            return serde_json::Value::from(integer);
        }
    }
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map_or(serde_json::Value::Null, serde_json::Value::Number)
}

pub(crate) fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_str(&format!("{value:.18}"))
        .ok()
        .map(|decimal| decimal.normalize())
}

impl From<serde_json::Value> for FormValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FormValue::Null,
            serde_json::Value::Bool(value) => FormValue::Bool(value),
            serde_json::Value::Number(number) => number
                .as_i64()
                .map(Decimal::from)
                .or_else(|| number.as_u64().map(Decimal::from))
                .or_else(|| number.as_f64().and_then(decimal_from_f64))
                .map_or(FormValue::Null, FormValue::Number),
            serde_json::Value::String(value) => FormValue::Text(value),
            serde_json::Value::Array(items) => {
                FormValue::List(items.into_iter().map(FormValue::from).collect())
            }
            serde_json::Value::Object(entries) => FormValue::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, FormValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for FormValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FormValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(FormValue::from)
    }
}

impl From<bool> for FormValue {
    fn from(value: bool) -> Self {
        FormValue::Bool(value)
    }
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        FormValue::Text(value.to_string())
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        FormValue::Text(value)
    }
}

impl From<Decimal> for FormValue {
    fn from(value: Decimal) -> Self {
        FormValue::Number(value)
    }
}

impl From<i32> for FormValue {
    fn from(value: i32) -> Self {
        FormValue::Number(Decimal::from(value))
    }
}

impl From<i64> for FormValue {
    fn from(value: i64) -> Self {
        FormValue::Number(Decimal::from(value))
    }
}

impl From<u32> for FormValue {
    fn from(value: u32) -> Self {
        FormValue::Number(Decimal::from(value))
    }
}

impl From<f64> for FormValue {
    fn from(value: f64) -> Self {
        decimal_from_f64(value).map_or(FormValue::Null, FormValue::Number)
    }
}

impl From<OpaqueValue> for FormValue {
    fn from(value: OpaqueValue) -> Self {
        FormValue::Opaque(value)
    }
}

impl<T> From<Vec<T>> for FormValue
where
    T: Into<FormValue>,
{
    fn from(items: Vec<T>) -> Self {
        FormValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T> From<Option<T>> for FormValue
where
    T: Into<FormValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(FormValue::Null, Into::into)
    }
}

/// Conversion between a typed model field and its `FormValue` form.
pub trait FieldValue: Sized {
    fn to_form_value(&self) -> FormValue;
    fn from_form_value(value: &FormValue) -> Option<Self>;
}

/// Typed view over an object-shaped form value.
///
/// Usually derived with `#[derive(FormModel)]`, which also generates the
/// `Fields` accessor type naming every field as it appears in form paths.
pub trait FormModel: Sized {
    type Fields;

    fn fields() -> Self::Fields;
    fn field_names() -> &'static [&'static str];
    fn to_form_value(&self) -> FormValue;
    fn from_form_value(value: &FormValue) -> Option<Self>;
}

impl FieldValue for FormValue {
    fn to_form_value(&self) -> FormValue {
        self.clone()
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FieldValue for String {
    fn to_form_value(&self) -> FormValue {
        FormValue::Text(self.clone())
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FieldValue for bool {
    fn to_form_value(&self) -> FormValue {
        FormValue::Bool(*self)
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FieldValue for Decimal {
    fn to_form_value(&self) -> FormValue {
        FormValue::Number(*self)
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        value.as_decimal()
    }
}

impl FieldValue for i64 {
    fn to_form_value(&self) -> FormValue {
        FormValue::Number(Decimal::from(*self))
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        let number = value.as_decimal()?;
        if !number.fract().is_zero() {
            return None;
        }
        number.to_i64()
    }
}

impl<T> FieldValue for Option<T>
where
    T: FieldValue,
{
    fn to_form_value(&self) -> FormValue {
        self.as_ref().map_or(FormValue::Null, T::to_form_value)
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        if value.is_null() {
            return Some(None);
        }
        T::from_form_value(value).map(Some)
    }
}

impl<T> FieldValue for Vec<T>
where
    T: FieldValue,
{
    fn to_form_value(&self) -> FormValue {
        FormValue::List(self.iter().map(T::to_form_value).collect())
    }

    fn from_form_value(value: &FormValue) -> Option<Self> {
        value.as_list()?.iter().map(T::from_form_value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_keeps_key_order_and_numbers() {
        let value = FormValue::from(json!({"lastName": "Ivanov", "firstName": "Ivan", "age": 42}));
        let keys = value
            .as_map()
            .expect("object converts to map")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["lastName", "firstName", "age"]);
        assert_eq!(value.get("age"), Some(&FormValue::from(42)));
        assert_eq!(value.to_json(), json!({"lastName": "Ivanov", "firstName": "Ivan", "age": 42}));
    }

    #[test]
    fn lookup_walks_maps_and_lists() {
        let value = FormValue::from(json!({"users": [{"name": "a"}, {"name": "b"}]}));
        assert_eq!(
            value.lookup(["users", "1", "name"]),
            Some(&FormValue::from("b"))
        );
        assert_eq!(value.lookup(["users", "7", "name"]), None);
        assert_eq!(value.lookup(["users", "x"]), None);
    }

    #[test]
    fn opaque_values_compare_by_identity() {
        let first = OpaqueValue::new(String::from("same"));
        let second = OpaqueValue::new(String::from("same"));
        assert_eq!(first, first.clone());
        assert_ne!(first, second);
        assert_eq!(
            first.downcast_ref::<String>().map(String::as_str),
            Some("same")
        );
    }

    #[test]
    fn fractional_numbers_survive_json_round_trip() {
        let value = FormValue::from(12.5);
        assert_eq!(value.to_json(), json!(12.5));
        assert_eq!(i64::from_form_value(&value), None);
        assert_eq!(i64::from_form_value(&FormValue::from(12)), Some(12));
    }

    #[test]
    fn optional_fields_accept_null() {
        assert_eq!(
            Option::<String>::from_form_value(&FormValue::Null),
            Some(None)
        );
        assert_eq!(
            Option::<String>::from_form_value(&FormValue::from("x")),
            Some(Some("x".to_string()))
        );
        assert_eq!(Option::<String>::from_form_value(&FormValue::from(1)), None);
    }
}
