//! Value objects: immutable domain values stored as a single primitive.
//!
//! A value object converts to and from one [`Value`] and is tagged in
//! metadata as [`FieldType::ValueObject`](crate::FieldType::ValueObject).
//! The [`value_object!`](crate::value_object!) macro makes it usable as an
//! entity property.

use crate::error::{Error, Result, TypeError};
use crate::validate::matches_pattern;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A domain value with a primitive storage form.
pub trait ValueObject: Sized {
    /// Type name used as the metadata tag.
    const TYPE_NAME: &'static str;

    fn to_primitive(&self) -> Value;

    fn from_primitive(value: Value) -> Result<Self>;
}

/// Implement [`Property`](crate::Property) for a [`ValueObject`].
#[macro_export]
macro_rules! value_object {
    ($ty:ty) => {
        impl $crate::Property for $ty {
            const KIND: $crate::PropertyKind = $crate::PropertyKind::Field(
                $crate::FieldType::ValueObject(<$ty as $crate::ValueObject>::TYPE_NAME),
            );

            fn to_field(&self) -> $crate::FieldValue {
                $crate::FieldValue::Value($crate::ValueObject::to_primitive(self))
            }

            fn from_field(value: $crate::FieldValue) -> $crate::Result<Self> {
                <$ty as $crate::ValueObject>::from_primitive(value.into_value()?)
            }
        }
    };
}

fn invalid(type_name: &'static str, expected: &'static str, actual: impl Into<String>) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.into(),
        column: None,
        rust_type: Some(type_name),
    })
}

/// Amount of money in a currency, stored as `{"amount": .., "currency": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    amount: f64,
    currency: String,
}

impl Money {
    /// `currency` must be a three-letter upper-case ISO code.
    pub fn new(amount: f64, currency: impl Into<String>) -> Result<Self> {
        let currency = currency.into();
        if !matches_pattern(&currency, r"^[A-Z]{3}$") {
            return Err(invalid("Money", "ISO 4217 currency code", currency));
        }
        Ok(Self { amount, currency })
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.amount, self.currency)
    }
}

impl ValueObject for Money {
    const TYPE_NAME: &'static str = "Money";

    fn to_primitive(&self) -> Value {
        Value::Json(serde_json::json!({
            "amount": self.amount,
            "currency": self.currency,
        }))
    }

    fn from_primitive(value: Value) -> Result<Self> {
        let parsed: Money = match value {
            Value::Json(json) => serde_json::from_value(json)?,
            Value::Text(text) => serde_json::from_str(&text)?,
            other => return Err(invalid("Money", "json", other.type_name())),
        };
        Money::new(parsed.amount, parsed.currency)
    }
}

/// A syntactically valid e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

impl Email {
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        if !matches_pattern(&address, EMAIL_PATTERN) {
            return Err(invalid("Email", "e-mail address", address));
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after `@`.
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(_, domain)| domain)
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ValueObject for Email {
    const TYPE_NAME: &'static str = "Email";

    fn to_primitive(&self) -> Value {
        Value::Text(self.0.clone())
    }

    fn from_primitive(value: Value) -> Result<Self> {
        match value {
            Value::Text(text) => Email::new(text),
            other => Err(invalid("Email", "string", other.type_name())),
        }
    }
}

/// Positive integer user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(i64);

impl UserId {
    pub fn new(id: i64) -> Result<Self> {
        if id <= 0 {
            return Err(invalid("UserId", "positive integer", id.to_string()));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ValueObject for UserId {
    const TYPE_NAME: &'static str = "UserId";

    fn to_primitive(&self) -> Value {
        Value::Int(self.0)
    }

    fn from_primitive(value: Value) -> Result<Self> {
        match value.as_i64() {
            Some(id) => UserId::new(id),
            None => Err(invalid("UserId", "int", value.type_name())),
        }
    }
}

crate::value_object!(Money);
crate::value_object!(Email);
crate::value_object!(UserId);
