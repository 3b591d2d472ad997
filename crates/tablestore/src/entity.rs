// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Table entities and their JSON representation.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use jiff::Timestamp;
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::{Error, Result};

const PARTITION_KEY: &str = "PartitionKey";
const ROW_KEY: &str = "RowKey";
const TIMESTAMP: &str = "Timestamp";
const ODATA_ETAG: &str = "odata.etag";
const ODATA_TYPE_SUFFIX: &str = "@odata.type";

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// `Edm.String`.
    String(String),
    /// `Edm.Boolean`.
    Boolean(bool),
    /// `Edm.Int32`.
    Int32(i32),
    /// `Edm.Int64`, sent as a string.
    Int64(i64),
    /// `Edm.Double`.
    Double(f64),
    /// `Edm.Guid`.
    Guid(Uuid),
    /// `Edm.DateTime`.
    DateTime(Timestamp),
}

impl PropertyValue {
    /// Returns the string, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the EDM type name, if the JSON encoding needs an annotation.
    fn edm_annotation(&self) -> Option<&'static str> {
        match self {
            Self::Int64(_) => Some("Edm.Int64"),
            Self::Guid(_) => Some("Edm.Guid"),
            Self::DateTime(_) => Some("Edm.DateTime"),
            Self::Double(value) if !value.is_finite() => Some("Edm.Double"),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::String(value) => Value::String(value.clone()),
            Self::Boolean(value) => Value::Bool(*value),
            Self::Int32(value) => Value::from(*value),
            Self::Int64(value) => Value::String(value.to_string()),
            Self::Double(value) => Number::from_f64(*value).map_or_else(|| Value::String(non_finite_literal(*value).to_owned()), Value::Number),
            Self::Guid(value) => Value::String(value.to_string()),
            Self::DateTime(value) => Value::String(value.to_string()),
        }
    }

    fn from_json(name: &str, value: &Value, annotation: Option<&str>) -> Result<Self> {
        let invalid = || Error::protocol(format!("property '{name}' does not hold a valid {}", annotation.unwrap_or("value")));

        match (annotation, value) {
            (Some("Edm.Int64"), Value::String(text)) => text.parse().ok().map(Self::Int64).ok_or_else(invalid),
            (Some("Edm.Guid"), Value::String(text)) => text.parse().ok().map(Self::Guid).ok_or_else(invalid),
            (Some("Edm.DateTime"), Value::String(text)) => text.parse().ok().map(Self::DateTime).ok_or_else(invalid),
            (Some("Edm.Double"), Value::String(text)) => parse_non_finite(text).map(Self::Double).ok_or_else(invalid),
            (Some("Edm.Double"), Value::Number(number)) => number.as_f64().map(Self::Double).ok_or_else(invalid),
            (Some("Edm.Int32"), Value::Number(number)) => number
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Self::Int32)
                .ok_or_else(invalid),
            (Some("Edm.String"), Value::String(text)) | (None, Value::String(text)) => Ok(Self::String(text.clone())),
            (Some("Edm.Boolean") | None, Value::Bool(value)) => Ok(Self::Boolean(*value)),
            (None, Value::Number(number)) => Ok(match number.as_i64() {
                Some(n) => i32::try_from(n).map_or(Self::Int64(n), Self::Int32),
                None => Self::Double(number.as_f64().ok_or_else(invalid)?),
            }),
            _ => Err(invalid()),
        }
    }
}

fn non_finite_literal(value: f64) -> &'static str {
    if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn parse_non_finite(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(value) => f.write_str(value),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Int32(value) => write!(f, "{value}"),
            Self::Int64(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::Guid(value) => write!(f, "{value}"),
            Self::DateTime(value) => write!(f, "{value}"),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PropertyValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from!(
    String => String,
    bool => Boolean,
    i32 => Int32,
    i64 => Int64,
    f64 => Double,
    Uuid => Guid,
    Timestamp => DateTime,
);

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// A row of a table.
///
/// An entity is identified within its table by its partition key and row key, both chosen by the
/// caller. The timestamp and `ETag` are assigned by the service and ignored when the entity is
/// written.
///
/// # Examples
///
/// ```
/// use tablestore::{Entity, PropertyValue};
///
/// let entity = Entity::new("partition1", "1")
///     .with("address", "street1")
///     .with("floors", 3);
///
/// assert_eq!(entity.property("address"), Some(&PropertyValue::String("street1".into())));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    partition_key: String,
    row_key: String,
    timestamp: Option<Timestamp>,
    etag: Option<String>,
    properties: BTreeMap<String, PropertyValue>,
}

impl Entity {
    /// Creates an entity without properties.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            etag: None,
            properties: BTreeMap::new(),
        }
    }

    /// Adds a property, replacing any previous value with the same name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a property, returning the previous value.
    ///
    /// Properties named like the keys, the timestamp or OData metadata are kept on the entity
    /// but never written to the service.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Option<PropertyValue> {
        self.properties.insert(name.into(), value.into())
    }

    /// Removes a property, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Attaches the `ETag` used as the `If-Match` condition of conditional writes, batched or not.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Returns the partition key.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Returns the row key.
    #[must_use]
    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// Returns the time the service last modified the entity.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Returns the entity's `ETag`.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Returns a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Returns all properties, excluding keys and service metadata.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Encodes the entity as the JSON body of a write.
    #[must_use]
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(PARTITION_KEY.to_owned(), Value::String(self.partition_key.clone()));
        map.insert(ROW_KEY.to_owned(), Value::String(self.row_key.clone()));

        for (name, value) in self.properties.iter().filter(|(name, _)| !is_reserved(name)) {
            if let Some(edm) = value.edm_annotation() {
                map.insert(format!("{name}{ODATA_TYPE_SUFFIX}"), Value::String(edm.to_owned()));
            }
            map.insert(name.clone(), value.to_json());
        }

        map
    }

    pub(crate) fn to_body(&self) -> Vec<u8> {
        Value::Object(self.to_json()).to_string().into_bytes()
    }

    /// Decodes an entity from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a key is missing or a property does not match its type
    /// annotation.
    pub fn from_json(map: &Map<String, Value>) -> Result<Self> {
        let key = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| Error::protocol(format!("entity has no {name}")))
        };

        let mut entity = Self::new(key(PARTITION_KEY)?, key(ROW_KEY)?);
        entity.etag = map.get(ODATA_ETAG).and_then(Value::as_str).map(str::to_owned);
        entity.timestamp = match map.get(TIMESTAMP) {
            Some(Value::String(text)) => Some(text.parse().map_err(Error::protocol)?),
            _ => None,
        };

        for (name, value) in map {
            if is_reserved(name) {
                continue;
            }

            let annotation = map.get(&format!("{name}{ODATA_TYPE_SUFFIX}")).and_then(Value::as_str);
            entity.properties.insert(name.clone(), PropertyValue::from_json(name, value, annotation)?);
        }

        Ok(entity)
    }

    pub(crate) fn from_body(body: &[u8]) -> Result<Self> {
        match serde_json::from_slice(body).map_err(Error::protocol)? {
            Value::Object(map) => Self::from_json(&map),
            _ => Err(Error::protocol("entity body is not a JSON object")),
        }
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(name, PARTITION_KEY | ROW_KEY | TIMESTAMP) || name.starts_with("odata.") || name.ends_with(ODATA_TYPE_SUFFIX)
}
