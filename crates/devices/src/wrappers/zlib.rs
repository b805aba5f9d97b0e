//! zlib compression as a transformer pair.

use std::io::{Read, Write};

use {
    async_trait::async_trait,
    flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder},
};

use crate::{
    error::{Error, Result},
    message::MessageBundle,
    wrappers::transformer::{InputTransformer, OutputTransformer},
};

/// Prefix written before compressed payloads so readers can tell them apart
/// from plain ones.
pub const ZLIB_MAGIC: &[u8] = b"__ZLIBTRANSFORMER__";

/// Compresses outgoing payloads and decompresses incoming ones.
///
/// Incoming payloads without [`ZLIB_MAGIC`] pass through unchanged, so a
/// queue can carry a mix of compressed and plain messages.
#[derive(Debug, Clone, Copy)]
pub struct ZlibTransformer {
    level: Compression,
}

impl Default for ZlibTransformer {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl ZlibTransformer {
    /// `level` follows zlib: `-1` for the library default, `0..=9` otherwise.
    pub fn new(level: i32) -> Result<Self> {
        let level = match level {
            -1 => Compression::default(),
            0..=9 => Compression::new(level.unsigned_abs()),
            other => {
                return Err(Error::construction(
                    "zlib",
                    format!("level must be between -1 and 9, got {other}"),
                ));
            },
        };
        Ok(Self { level })
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = ZLIB_MAGIC.to_vec();
        let mut encoder = ZlibEncoder::new(&mut out, self.level);
        encoder.write_all(data)?;
        encoder.finish()?;
        Ok(out)
    }

    /// Returns `None` when `data` is not a compressed payload.
    pub fn decompress(&self, data: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
        let Some(body) = data.strip_prefix(ZLIB_MAGIC) else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(body.len() * 2);
        ZlibDecoder::new(body).read_to_end(&mut out)?;
        Ok(Some(out))
    }
}

#[async_trait]
impl InputTransformer for ZlibTransformer {
    fn transform_input(&self, device: &str, bundle: MessageBundle) -> Result<MessageBundle> {
        match self.decompress(bundle.message.bytes()) {
            Ok(None) => Ok(bundle),
            Ok(Some(plain)) => Ok(MessageBundle::with_device_headers(
                bundle.message.with_data(plain),
                bundle.device_headers,
            )),
            Err(e) => Err(Error::invalid_payload(device, format!("zlib: {e}"))),
        }
    }
}

#[async_trait]
impl OutputTransformer for ZlibTransformer {
    fn transform_output(&self, _device: &str, bundle: &MessageBundle) -> Result<MessageBundle> {
        let compressed = self.compress(bundle.message.bytes())?;
        Ok(MessageBundle::with_device_headers(
            bundle.message.with_data(compressed),
            bundle.device_headers.clone(),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::message::Message, rstest::rstest};

    #[rstest]
    #[case(-1)]
    #[case(0)]
    #[case(9)]
    fn accepts_zlib_levels(#[case] level: i32) {
        assert!(ZlibTransformer::new(level).is_ok());
    }

    #[rstest]
    #[case(-2)]
    #[case(10)]
    fn rejects_out_of_range_levels(#[case] level: i32) {
        assert!(matches!(
            ZlibTransformer::new(level),
            Err(Error::Construction { .. })
        ));
    }

    #[test]
    fn outgoing_payload_is_prefixed_and_restored_on_read() {
        let z = ZlibTransformer::new(6).unwrap();
        let body = "payload ".repeat(64);
        let bundle = MessageBundle::new(Message::new(body.clone()).header("k", "v"));

        let out = z.transform_output("q", &bundle).unwrap();
        assert!(out.message.bytes().starts_with(ZLIB_MAGIC));
        assert!(out.message.len() < body.len());

        let back = z.transform_input("q", out).unwrap();
        assert_eq!(back.message.bytes(), body.as_bytes());
        assert_eq!(back.message.headers(), bundle.message.headers());
    }

    #[test]
    fn plain_payload_passes_through() {
        let z = ZlibTransformer::default();
        let bundle = MessageBundle::new(Message::new("not compressed"));
        let back = z.transform_input("q", bundle.clone()).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn corrupt_payload_is_an_invalid_payload_error() {
        let z = ZlibTransformer::default();
        let mut data = ZLIB_MAGIC.to_vec();
        data.extend_from_slice(b"\x00garbage");
        let err = z
            .transform_input("q", MessageBundle::new(Message::new(data)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }
}
