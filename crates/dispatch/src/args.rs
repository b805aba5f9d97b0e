use std::collections::HashMap;

use {
    flowline_devices::{Message, MessageBundle},
    serde::de::DeserializeOwned,
    serde_json::Value,
};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ArgValue {
    Json(Value),
    DeviceName(String),
    Message(Message),
    Bundle(MessageBundle),
}

/// Arguments bound for one callback invocation, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    values: HashMap<String, ArgValue>,
}

impl CallArgs {
    pub(crate) fn insert(&mut self, name: String, value: ArgValue) {
        self.values.insert(name, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Raw JSON bound from the payload.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.values.get(name)? {
            ArgValue::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Deserialize a payload argument into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.value(name).ok_or_else(|| Error::MissingArgument {
            name: name.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| Error::validation(format!("$.{name}"), e))
    }

    pub fn device_name(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ArgValue::DeviceName(d) => Some(d),
            _ => None,
        }
    }

    pub fn message(&self, name: &str) -> Option<&Message> {
        match self.values.get(name)? {
            ArgValue::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn bundle(&self, name: &str) -> Option<&MessageBundle> {
        match self.values.get(name)? {
            ArgValue::Bundle(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_reports_the_parameter_path() {
        let mut args = CallArgs::default();
        args.insert("count".into(), ArgValue::Json(Value::from("three")));

        let err = args.get::<u32>("count").unwrap_err();
        assert!(matches!(&err, Error::Validation { path, .. } if path == "$.count"));
        assert!(matches!(
            args.get::<u32>("missing").unwrap_err(),
            Error::MissingArgument { .. }
        ));
    }

    #[test]
    fn accessors_do_not_cross_kinds() {
        let mut args = CallArgs::default();
        args.insert("dev".into(), ArgValue::DeviceName("orders".into()));
        assert_eq!(args.device_name("dev"), Some("orders"));
        assert!(args.value("dev").is_none());
        assert!(args.message("dev").is_none());
    }
}
