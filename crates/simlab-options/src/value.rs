use crate::Error;
use serde::Serialize;
use std::fmt;

/// Value of a dict-style option.
///
/// Every variant has a fixed, locale-independent textual form, so a value that
/// exists is always renderable. Inputs that have no such form (null,
/// sequences, maps, non-finite floats) are rejected when the value is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl OptionValue {
    pub fn float(flag: &str, value: f64) -> Result<Self, Error> {
        if value.is_finite() {
            Ok(Self::Float(value))
        } else {
            Err(Error::UnrenderableValue {
                flag: flag.to_string(),
                kind: format!("non-finite float {value}"),
            })
        }
    }

    pub fn from_yaml(flag: &str, value: &serde_yaml::Value) -> Result<Self, Error> {
        use serde_yaml::Value;
        let unrenderable = |kind: &str| Error::UnrenderableValue {
            flag: flag.to_string(),
            kind: kind.to_string(),
        };
        match value {
            Value::Bool(v) => Ok(Self::Bool(*v)),
            Value::String(v) => Ok(Self::Str(v.clone())),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Ok(Self::Int(v))
                } else if let Some(v) = n.as_u64() {
                    Ok(Self::Str(v.to_string()))
                } else {
                    let v = n.as_f64().ok_or_else(|| unrenderable("number"))?;
                    Self::float(flag, v)
                }
            }
            Value::Null => Err(unrenderable("null")),
            Value::Sequence(_) => Err(unrenderable("sequence")),
            Value::Mapping(_) => Err(unrenderable("mapping")),
            Value::Tagged(_) => Err(unrenderable("tagged value")),
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for OptionValue {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
