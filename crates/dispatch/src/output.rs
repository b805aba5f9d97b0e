//! What a callback returns and how it becomes outgoing bundles.

use {
    flowline_devices::{Message, MessageBundle},
    serde::Serialize,
    serde_json::Value,
};

use crate::error::Result;

/// One returned value. JSON values are serialized into the message body;
/// messages and bundles are forwarded as they are.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    Json(Value),
    Message(Message),
    Bundle(MessageBundle),
}

impl ReturnValue {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn into_bundle(self) -> Result<MessageBundle> {
        Ok(match self {
            Self::Json(value) => MessageBundle::new(Message::new(serde_json::to_vec(&value)?)),
            Self::Message(message) => MessageBundle::new(message),
            Self::Bundle(bundle) => bundle,
        })
    }
}

impl From<Value> for ReturnValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Message> for ReturnValue {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<MessageBundle> for ReturnValue {
    fn from(bundle: MessageBundle) -> Self {
        Self::Bundle(bundle)
    }
}

/// Callback result. `Multiple` fans out to one outgoing bundle per element,
/// in order; each element is serialized on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CallbackOutput {
    #[default]
    Nothing,
    One(ReturnValue),
    Multiple(Vec<ReturnValue>),
}

impl CallbackOutput {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::One(ReturnValue::json(value)?))
    }

    pub fn multiple<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ReturnValue>,
    {
        Self::Multiple(values.into_iter().map(Into::into).collect())
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    pub fn into_bundles(self) -> Result<Vec<MessageBundle>> {
        match self {
            Self::Nothing => Ok(Vec::new()),
            Self::One(value) => Ok(vec![value.into_bundle()?]),
            Self::Multiple(values) => values.into_iter().map(ReturnValue::into_bundle).collect(),
        }
    }
}

impl<T: Into<ReturnValue>> From<Option<T>> for CallbackOutput {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nothing, |v| Self::One(v.into()))
    }
}

impl From<ReturnValue> for CallbackOutput {
    fn from(value: ReturnValue) -> Self {
        Self::One(value)
    }
}
