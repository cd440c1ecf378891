//! Event codecs (typed event <-> wire payload).
//!
//! # `order-received` wire format
//!
//! Avro binary encoding of a record with a single `string` field:
//!
//! ```text
//! order_uri: string
//!   - length: long (zig-zag varint)
//!   - bytes:  [u8] (UTF-8)
//! ```
//!
//! So `/order/ORDER-12345` (18 bytes) is written as `$/order/ORDER-12345`,
//! `$` being the zig-zag encoding of 18.

use std::marker::PhantomData;

use bytes::{Buf, BufMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use orderflow_core::OrderReceived;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The event has a shape the wire format cannot carry.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Payload does not match the schema (truncated, corrupt, wrong type).
    #[error("decoding failed: {0}")]
    Decoding(String),
}

/// Serializes a typed event to a binary payload and back.
///
/// Law: `decode(encode(e)) == e` for every event `encode` accepts.
pub trait EventCodec: Send + Sync {
    type Event;

    fn encode(&self, event: &Self::Event) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Event, CodecError>;
}

/// Avro-compatible codec for [`OrderReceived`].
#[derive(Debug, Default, Copy, Clone)]
pub struct OrderReceivedCodec;

impl EventCodec for OrderReceivedCodec {
    type Event = OrderReceived;

    fn encode(&self, event: &OrderReceived) -> Result<Vec<u8>, CodecError> {
        let uri = event.reference_uri();
        if uri.trim().is_empty() {
            return Err(CodecError::Encoding("order URI is blank".to_string()));
        }

        let bytes = uri.as_bytes();
        let mut buf = Vec::with_capacity(bytes.len() + 2);
        put_long(&mut buf, bytes.len() as i64);
        buf.put_slice(bytes);
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<OrderReceived, CodecError> {
        let mut buf = bytes;

        let len = get_long(&mut buf)?;
        if len < 0 {
            return Err(CodecError::Decoding(format!("negative string length {len}")));
        }
        let len = len as usize;
        if buf.remaining() < len {
            return Err(CodecError::Decoding(format!(
                "string length {} exceeds remaining data {}",
                len,
                buf.remaining()
            )));
        }

        let mut str_bytes = vec![0u8; len];
        buf.copy_to_slice(&mut str_bytes);

        if buf.has_remaining() {
            return Err(CodecError::Decoding(format!(
                "{} trailing bytes after order URI",
                buf.remaining()
            )));
        }

        let uri = String::from_utf8(str_bytes)
            .map_err(|e| CodecError::Decoding(format!("invalid UTF-8 in order URI: {e}")))?;

        Ok(OrderReceived::new(uri))
    }
}

fn put_long(buf: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    while n >= 0x80 {
        buf.put_u8((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

fn get_long(buf: &mut &[u8]) -> Result<i64, CodecError> {
    let mut n: u64 = 0;
    let mut shift = 0u32;
    loop {
        if shift >= 64 {
            return Err(CodecError::Decoding("varint longer than 10 bytes".to_string()));
        }
        if !buf.has_remaining() {
            return Err(CodecError::Decoding("unexpected end of data reading length".to_string()));
        }
        let byte = buf.get_u8();
        n |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(((n >> 1) as i64) ^ -((n & 1) as i64))
}

/// JSON codec for any serde-capable event type.
pub struct JsonCodec<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonCodec<E> {
    pub fn new() -> Self {
        Self { _event: PhantomData }
    }
}

impl<E> Default for JsonCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonCodec<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> core::fmt::Debug for JsonCodec<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<E> EventCodec for JsonCodec<E>
where
    E: Serialize + DeserializeOwned,
{
    type Event = E;

    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError::Encoding(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_as_avro_string() {
        let bytes = OrderReceivedCodec
            .encode(&OrderReceived::new("/order/ORDER-12345"))
            .unwrap();
        assert_eq!(bytes, b"$/order/ORDER-12345".to_vec());
    }

    #[test]
    fn long_uris_use_multi_byte_length() {
        let uri = format!("/orders/{}", "X".repeat(200));
        let bytes = OrderReceivedCodec.encode(&OrderReceived::new(uri.clone())).unwrap();
        // 208 zig-zags to 416 = 0xA0 0x03
        assert_eq!(&bytes[..2], &[0xA0, 0x03]);
        assert_eq!(OrderReceivedCodec.decode(&bytes).unwrap().reference_uri(), uri);
    }

    #[test]
    fn blank_uri_is_not_encodable() {
        let err = OrderReceivedCodec.encode(&OrderReceived::new("  ")).unwrap_err();
        assert!(matches!(err, CodecError::Encoding(_)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = OrderReceivedCodec
            .encode(&OrderReceived::new("/orders/ORD-1"))
            .unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            OrderReceivedCodec.decode(&bytes),
            Err(CodecError::Decoding(_))
        ));
        assert!(OrderReceivedCodec.decode(&[]).is_err());
    }

    #[test]
    fn trailing_bytes_and_bad_lengths_are_rejected() {
        let mut bytes = OrderReceivedCodec
            .encode(&OrderReceived::new("/orders/ORD-1"))
            .unwrap();
        bytes.push(0);
        assert!(OrderReceivedCodec.decode(&bytes).is_err());

        // zig-zag 1 == -1
        assert!(OrderReceivedCodec.decode(&[0x01, b'a']).is_err());
        // continuation bits forever
        assert!(OrderReceivedCodec.decode(&[0xFF; 12]).is_err());
        // invalid UTF-8
        assert!(OrderReceivedCodec.decode(&[0x02, 0xC3]).is_err());
    }

    #[test]
    fn json_codec_reports_schema_mismatch() {
        let codec = JsonCodec::<OrderReceived>::new();
        let bytes = codec.encode(&OrderReceived::new("/orders/ORD-9")).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap().reference_uri(), "/orders/ORD-9");
        assert!(matches!(
            codec.decode(br#"{"unexpected":1}"#),
            Err(CodecError::Decoding(_))
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: decode(encode(e)) == e for every encodable event.
            #[test]
            fn avro_round_trip(uri in "\\PC{1,300}") {
                prop_assume!(!uri.trim().is_empty());
                let event = OrderReceived::new(uri);
                let bytes = OrderReceivedCodec.encode(&event).unwrap();
                prop_assert_eq!(OrderReceivedCodec.decode(&bytes).unwrap(), event);
            }
        }
    }
}
