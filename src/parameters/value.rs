use std::fmt;

use serde::Serialize;
use tables::parameters::DataType;

/// A parameter value typed by its declared [`DataType`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

/// Accepts yes/no, true/false and 1/0, case-insensitive. Anything else is
/// not a boolean.
pub fn parse_bool(raw: &str) -> Option<bool> {
    let lowered = raw.to_lowercase();
    match lowered.as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

impl Value {
    pub fn parse(data_type: DataType, raw: &str) -> Option<Value> {
        match data_type {
            DataType::String => Some(Value::String(raw.to_string())),
            DataType::Integer => raw.trim().parse().ok().map(Value::Integer),
            DataType::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float),
            DataType::Boolean => parse_bool(raw).map(Value::Boolean),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Boolean(b) => write!(f, "{}", b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_accept_every_spelling() {
        for raw in ["yes", "YES", "True", "1"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["no", "No", "FALSE", "0"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn integers_reject_garbage() {
        assert_eq!(Value::parse(DataType::Integer, "7"), Some(Value::Integer(7)));
        assert_eq!(Value::parse(DataType::Integer, "seven"), None);
        assert_eq!(Value::parse(DataType::Integer, "7.5"), None);
    }

    #[test]
    fn floats_accept_integers() {
        assert_eq!(Value::parse(DataType::Float, "2"), Some(Value::Float(2.0)));
        assert_eq!(Value::parse(DataType::Float, "NaN"), None);
        assert_eq!(Value::Integer(3).as_f64(), Some(3.0));
    }
}
