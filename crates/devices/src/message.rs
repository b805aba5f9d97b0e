//! The data model carried through devices and handlers.

use std::collections::HashMap;

use {bytes::Bytes, serde_json::Value};

/// String-keyed header map. Values are JSON so any transport can round-trip them.
pub type Headers = HashMap<String, Value>;

/// An immutable payload: raw bytes plus headers.
///
/// Cloning is cheap (`Bytes` is reference counted). To change headers build a
/// new message with [`Message::with_headers`]; the original is untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    data: Bytes,
    headers: Headers,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers_map(data: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            data: data.into(),
            headers,
        }
    }

    /// Builder-style header insertion, for use while constructing a message.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn get_header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    /// A copy of this message carrying `headers` instead of the current ones.
    #[must_use]
    pub fn with_headers(&self, headers: Headers) -> Self {
        Self {
            data: self.data.clone(),
            headers,
        }
    }

    /// A copy of this message carrying `data` and the same headers.
    #[must_use]
    pub fn with_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            headers: self.headers.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Bytes, Headers) {
        (self.data, self.headers)
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Self::new(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

/// A message plus the metadata a device attached to it.
///
/// On reads, `device_headers` carry transport details (delivery tag,
/// redelivery count, originating device). On sends they are the transport
/// options for the output device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBundle {
    pub message: Message,
    pub device_headers: Headers,
}

impl MessageBundle {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            device_headers: Headers::new(),
        }
    }

    pub fn with_device_headers(message: Message, device_headers: Headers) -> Self {
        Self {
            message,
            device_headers,
        }
    }

    #[must_use]
    pub fn device_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.device_headers.insert(key.into(), value.into());
        self
    }

    /// A copy carrying the same message and no device headers, the form in
    /// which a read message is forwarded to another device.
    #[must_use]
    pub fn forwarded(&self) -> Self {
        Self::new(self.message.clone())
    }
}

impl From<Message> for MessageBundle {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn with_headers_leaves_original_untouched() {
        let original = Message::new("body").header("a", 1);
        let mut replaced = Headers::new();
        replaced.insert("b".into(), json!("x"));
        let copy = original.with_headers(replaced);

        assert_eq!(original.get_header("a"), Some(&json!(1)));
        assert!(original.get_header("b").is_none());
        assert_eq!(copy.get_header("b"), Some(&json!("x")));
        assert_eq!(copy.bytes(), b"body");
    }

    #[test]
    fn forwarded_drops_device_headers_only() {
        let bundle = MessageBundle::new(Message::new("x").header("h", true))
            .device_header("delivery_tag", 42);
        let fwd = bundle.forwarded();
        assert!(fwd.device_headers.is_empty());
        assert_eq!(fwd.message, bundle.message);
    }

    #[test]
    fn equality_covers_bytes_and_headers() {
        assert_eq!(Message::new("a"), Message::from("a"));
        assert_ne!(Message::new("a"), Message::new("a").header("k", "v"));
    }
}
