//! Schema descriptors: what a callback expects and where each argument
//! comes from.

use std::{collections::HashSet, fmt};

use {flowline_devices::MessageBundle, serde_json::Value};

use crate::{
    args::{ArgValue, CallArgs},
    error::{Error, Result},
};

/// Expected JSON shape of a payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Any,
    Bool,
    /// A JSON number written without a fraction or exponent. `3.0` is
    /// rejected: it would not deserialize into an integer argument.
    Integer,
    Number,
    String,
    Array(Box<FieldType>),
    Object,
    Nullable(Box<FieldType>),
}

impl FieldType {
    #[must_use]
    pub fn array(items: FieldType) -> Self {
        Self::Array(Box::new(items))
    }

    #[must_use]
    pub fn nullable(inner: FieldType) -> Self {
        Self::Nullable(Box::new(inner))
    }

    /// Check `value` against this type. `path` is used in the error, e.g.
    /// `$.items[2]`.
    pub fn validate(&self, value: &Value, path: &str) -> Result<()> {
        let ok = match (self, value) {
            (Self::Any, _) => true,
            (Self::Nullable(_), Value::Null) => true,
            (Self::Nullable(inner), v) => return inner.validate(v, path),
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Number, Value::Number(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            (Self::Array(items), Value::Array(values)) => {
                for (i, v) in values.iter().enumerate() {
                    items.validate(v, &format!("{path}[{i}]"))?;
                }
                true
            },
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::validation(
                path,
                format!("expected {self}, found {}", json_kind(value)),
            ))
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Bool => write!(f, "bool"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::String => write!(f, "string"),
            Self::Array(items) => write!(f, "array of {items}"),
            Self::Object => write!(f, "object"),
            Self::Nullable(inner) => write!(f, "{inner} or null"),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where a callback parameter gets its value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    /// A named field of the payload object.
    Field {
        ty: FieldType,
        default: Option<Value>,
    },
    /// The whole payload, validated as one value.
    Root(FieldType),
    /// Name of the device the message was read from.
    DeviceName,
    /// The input message, unmodified.
    Message,
    /// The full bundle, device headers included.
    Bundle,
}

impl ParamSource {
    fn reads_payload(&self) -> bool {
        matches!(self, Self::Field { .. } | Self::Root(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub source: ParamSource,
}

/// Resolved once at registration; binding a message only walks this list.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    params: Vec<Param>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn root(&self) -> Option<&Param> {
        self.params
            .iter()
            .find(|p| matches!(p.source, ParamSource::Root(_)))
    }

    fn reads_payload(&self) -> bool {
        self.params.iter().any(|p| p.source.reads_payload())
    }

    fn has_fields(&self) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p.source, ParamSource::Field { .. }))
    }

    /// Bind the arguments for one message read from `device`.
    ///
    /// The payload is only parsed when at least one parameter reads it, so
    /// callbacks taking only special parameters accept non-JSON payloads.
    pub fn bind(&self, device: &str, bundle: &MessageBundle) -> Result<CallArgs> {
        let payload = if self.reads_payload() {
            Some(
                serde_json::from_slice::<Value>(bundle.message.bytes())
                    .map_err(|e| Error::validation("$", format!("payload is not JSON: {e}")))?,
            )
        } else {
            None
        };

        let empty = serde_json::Map::new();
        let fields = match &payload {
            Some(Value::Object(fields)) => fields,
            Some(other) if self.has_fields() => {
                return Err(Error::validation(
                    "$",
                    format!("expected object, found {}", json_kind(other)),
                ));
            },
            _ => &empty,
        };

        let mut args = CallArgs::default();
        for param in &self.params {
            let value = match &param.source {
                ParamSource::DeviceName => ArgValue::DeviceName(device.to_string()),
                ParamSource::Message => ArgValue::Message(bundle.message.clone()),
                ParamSource::Bundle => ArgValue::Bundle(bundle.clone()),
                ParamSource::Root(ty) => {
                    let value = payload.clone().unwrap_or(Value::Null);
                    ty.validate(&value, "$")?;
                    ArgValue::Json(value)
                },
                ParamSource::Field { ty, default } => {
                    let path = format!("$.{}", param.name);
                    match (fields.get(&param.name), default) {
                        (Some(v), _) => {
                            ty.validate(v, &path)?;
                            ArgValue::Json(v.clone())
                        },
                        (None, Some(d)) => ArgValue::Json(d.clone()),
                        (None, None) if matches!(ty, FieldType::Nullable(_)) => {
                            ArgValue::Json(Value::Null)
                        },
                        (None, None) => {
                            return Err(Error::validation(path, "missing required field"));
                        },
                    }
                },
            };
            args.insert(param.name.clone(), value);
        }
        Ok(args)
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    params: Vec<Param>,
}

impl SchemaBuilder {
    fn push(mut self, name: impl Into<String>, source: ParamSource) -> Self {
        self.params.push(Param {
            name: name.into(),
            source,
        });
        self
    }

    /// Required payload field.
    #[must_use]
    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.push(name, ParamSource::Field { ty, default: None })
    }

    /// Payload field bound to `default` when absent.
    #[must_use]
    pub fn optional(self, name: impl Into<String>, ty: FieldType, default: impl Into<Value>) -> Self {
        self.push(name, ParamSource::Field {
            ty,
            default: Some(default.into()),
        })
    }

    /// The entire payload as one parameter. Excludes every `field`.
    #[must_use]
    pub fn root(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.push(name, ParamSource::Root(ty))
    }

    #[must_use]
    pub fn device_name(self, name: impl Into<String>) -> Self {
        self.push(name, ParamSource::DeviceName)
    }

    #[must_use]
    pub fn message(self, name: impl Into<String>) -> Self {
        self.push(name, ParamSource::Message)
    }

    #[must_use]
    pub fn bundle(self, name: impl Into<String>) -> Self {
        self.push(name, ParamSource::Bundle)
    }

    pub fn build(self) -> Result<Schema> {
        let mut seen = HashSet::new();
        let mut roots = 0;
        let mut fields = 0;
        for param in &self.params {
            if param.name.is_empty() {
                return Err(Error::invalid_schema("parameter names must not be empty"));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(Error::invalid_schema(format!(
                    "parameter '{}' declared twice",
                    param.name
                )));
            }
            match &param.source {
                ParamSource::Root(_) => roots += 1,
                ParamSource::Field { ty, default } => {
                    fields += 1;
                    if let Some(default) = default {
                        ty.validate(default, &format!("$.{}", param.name)).map_err(|e| {
                            Error::invalid_schema(format!(
                                "default for '{}' does not match its type: {e}",
                                param.name
                            ))
                        })?;
                    }
                },
                _ => {},
            }
        }
        if roots > 1 {
            return Err(Error::invalid_schema("at most one root parameter is allowed"));
        }
        if roots == 1 && fields > 0 {
            return Err(Error::invalid_schema(
                "a root parameter cannot be combined with payload fields",
            ));
        }
        Ok(Schema {
            params: self.params,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        flowline_devices::Message,
        rstest::rstest,
        serde_json::json,
    };

    fn bundle(body: &str) -> MessageBundle {
        MessageBundle::new(Message::new(body.to_string()))
    }

    #[rstest]
    #[case(FieldType::Integer, json!(3), true)]
    #[case(FieldType::Integer, json!(3.5), false)]
    #[case(FieldType::Integer, json!(3.0), false)]
    #[case(FieldType::Integer, json!(u64::MAX), true)]
    #[case(FieldType::Number, json!(3), true)]
    #[case(FieldType::String, json!(null), false)]
    #[case(FieldType::nullable(FieldType::String), json!(null), true)]
    #[case(FieldType::array(FieldType::Bool), json!([true, false]), true)]
    #[case(FieldType::Object, json!([]), false)]
    #[case(FieldType::Any, json!({"x": 1}), true)]
    fn field_type_validation(#[case] ty: FieldType, #[case] value: Value, #[case] valid: bool) {
        assert_eq!(ty.validate(&value, "$").is_ok(), valid);
    }

    #[test]
    fn nested_failures_report_their_path() {
        let ty = FieldType::array(FieldType::Integer);
        let err = ty.validate(&json!([1, 2, "x"]), "$.ids").unwrap_err();
        match err {
            Error::Validation { path, message } => {
                assert_eq!(path, "$.ids[2]");
                assert_eq!(message, "expected integer, found string");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fields_bind_from_payload_with_defaults() {
        let schema = Schema::builder()
            .field("name", FieldType::String)
            .optional("count", FieldType::Integer, 1)
            .field("note", FieldType::nullable(FieldType::String))
            .build()
            .unwrap();

        let args = schema
            .bind("in", &bundle(r#"{"name": "a", "extra": true}"#))
            .unwrap();
        assert_eq!(args.get::<String>("name").unwrap(), "a");
        assert_eq!(args.get::<i64>("count").unwrap(), 1);
        assert_eq!(args.value("note"), Some(&Value::Null));
        assert!(!args.contains("extra"));
    }

    #[rstest]
    #[case(r#"{"count": 1}"#, "$.name")]
    #[case(r#"{"name": 7}"#, "$.name")]
    #[case("[1, 2]", "$")]
    #[case("not json", "$")]
    fn bad_payloads_are_validation_errors(#[case] body: &str, #[case] expected_path: &str) {
        let schema = Schema::builder()
            .field("name", FieldType::String)
            .build()
            .unwrap();
        match schema.bind("in", &bundle(body)).unwrap_err() {
            Error::Validation { path, .. } => assert_eq!(path, expected_path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn root_validates_the_whole_payload() {
        let schema = Schema::builder()
            .root("items", FieldType::array(FieldType::Integer))
            .build()
            .unwrap();
        let args = schema.bind("in", &bundle("[1, 2, 3]")).unwrap();
        assert_eq!(args.get::<Vec<u8>>("items").unwrap(), vec![1, 2, 3]);
        assert!(schema.bind("in", &bundle(r#"{"items": [1]}"#)).is_err());
    }

    #[test]
    fn special_parameters_skip_payload_parsing() {
        let schema = Schema::builder()
            .device_name("device")
            .message("raw")
            .bundle("full")
            .build()
            .unwrap();
        let input = bundle("\u{1}binary").device_header("tag", 4);
        let args = schema.bind("orders", &input).unwrap();
        assert_eq!(args.device_name("device"), Some("orders"));
        assert_eq!(args.message("raw"), Some(&input.message));
        assert_eq!(args.bundle("full"), Some(&input));
    }

    #[rstest]
    #[case(Schema::builder().field("a", FieldType::Any).field("a", FieldType::Any))]
    #[case(Schema::builder().root("a", FieldType::Any).root("b", FieldType::Any))]
    #[case(Schema::builder().root("a", FieldType::Any).field("b", FieldType::Any))]
    #[case(Schema::builder().optional("a", FieldType::Integer, "one"))]
    #[case(Schema::builder().message(""))]
    fn invalid_schemas_are_rejected(#[case] builder: SchemaBuilder) {
        assert!(matches!(builder.build(), Err(Error::InvalidSchema { .. })));
    }
}
