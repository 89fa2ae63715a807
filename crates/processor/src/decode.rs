//! Payload decoding
//!
//! Upstream producers write gzip-compressed JSON. Plain JSON is accepted as
//! well; the two are told apart by the gzip magic bytes.

use crate::error::{DecodeError, DecodeResult};
use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::marker::PhantomData;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Turns a raw message payload into a typed event
pub trait EventDecoder<T>: Send + Sync {
    fn decode(&self, payload: &[u8]) -> DecodeResult<T>;
}

/// Decoder for gzip-compressed (or plain) JSON payloads
#[derive(Debug, Clone)]
pub struct GzipJsonDecoder<T> {
    max_payload_bytes: usize,
    _event: PhantomData<fn() -> T>,
}

impl<T> GzipJsonDecoder<T> {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self {
            max_payload_bytes,
            _event: PhantomData,
        }
    }

    fn inflate(&self, payload: &[u8]) -> DecodeResult<Vec<u8>> {
        let limit = self.max_payload_bytes;
        let mut decoder = GzDecoder::new(payload).take(limit as u64 + 1);
        let mut inflated = Vec::with_capacity(payload.len().saturating_mul(4).min(limit));
        decoder
            .read_to_end(&mut inflated)
            .map_err(DecodeError::Decompress)?;

        if inflated.len() > limit {
            return Err(DecodeError::PayloadTooLarge { limit });
        }
        Ok(inflated)
    }
}

impl<T> Default for GzipJsonDecoder<T> {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

impl<T: DeserializeOwned> EventDecoder<T> for GzipJsonDecoder<T> {
    fn decode(&self, payload: &[u8]) -> DecodeResult<T> {
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }

        if payload.starts_with(&GZIP_MAGIC) {
            let inflated = self.inflate(payload)?;
            return Ok(serde_json::from_slice(&inflated)?);
        }

        if payload.len() > self.max_payload_bytes {
            return Err(DecodeError::PayloadTooLarge {
                limit: self.max_payload_bytes,
            });
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Gzip-compress a JSON document; used by producers of test data
pub fn gzip_json<S: serde::Serialize>(value: &S) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}
