//! Trezor wire messages
//!
//! Hand-rolled protobuf for the handful of messages the key request uses.
//! Unknown fields in replies are skipped.

use strum::{Display, FromRepr};
use zeroize::Zeroize;

use crate::error::{AdapterError, Result};

/// Message type numbers from the Trezor protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u16)]
pub enum MessageType {
    Initialize = 0,
    Success = 2,
    Failure = 3,
    Features = 17,
    PinMatrixRequest = 18,
    PinMatrixAck = 19,
    Cancel = 20,
    CipherKeyValue = 23,
    ButtonRequest = 26,
    ButtonAck = 27,
    PassphraseRequest = 41,
    PassphraseAck = 42,
    CipheredKeyValue = 48,
}

/// `Failure.code` values the adapter reports specially
pub const FAILURE_ACTION_CANCELLED: u64 = 4;
pub const FAILURE_PIN_CANCELLED: u64 = 6;
pub const FAILURE_PIN_INVALID: u64 = 7;

/// A framed message: type plus protobuf payload
#[derive(Clone, PartialEq, Eq)]
pub struct TrezorMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for TrezorMessage {
    // Payloads carry PINs and key material
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrezorMessage({}, {} bytes)", self.msg_type, self.payload.len())
    }
}

impl Drop for TrezorMessage {
    fn drop(&mut self) {
        self.payload.zeroize();
    }
}

impl TrezorMessage {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, Vec::new())
    }

    /// Type (2 bytes BE) + length (4 bytes BE) + payload
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.payload.len());
        buf.extend_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse the 6-byte header, returning the type and payload length
    pub fn parse_header(data: &[u8]) -> Result<(MessageType, usize)> {
        if data.len() < 6 {
            return Err(AdapterError::transport("message header too short"));
        }
        let raw_type = u16::from_be_bytes([data[0], data[1]]);
        let msg_type = MessageType::from_repr(raw_type)
            .ok_or_else(|| AdapterError::transport(format!("unknown message type {}", raw_type)))?;
        let len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
        Ok((msg_type, len))
    }
}

/// Protobuf varint encoding
pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Protobuf varint decoding, returning the value and bytes consumed
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(AdapterError::transport("varint overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(AdapterError::transport("truncated varint"))
}

fn encode_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    encode_varint(buf, ((field as u64) << 3) | wire_type as u64);
}

pub fn encode_uint32_field(buf: &mut Vec<u8>, field: u32, value: u32) {
    encode_tag(buf, field, 0);
    encode_varint(buf, value as u64);
}

pub fn encode_bool_field(buf: &mut Vec<u8>, field: u32, value: bool) {
    encode_uint32_field(buf, field, value as u32);
}

pub fn encode_bytes_field(buf: &mut Vec<u8>, field: u32, value: &[u8]) {
    encode_tag(buf, field, 2);
    encode_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

pub fn encode_string_field(buf: &mut Vec<u8>, field: u32, value: &str) {
    encode_bytes_field(buf, field, value.as_bytes());
}

/// A decoded protobuf field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

/// Decode all top-level fields of a message payload
pub fn decode_fields(mut data: &[u8]) -> Result<Vec<(u32, FieldValue<'_>)>> {
    let mut fields = Vec::new();
    while !data.is_empty() {
        let (tag, used) = decode_varint(data)?;
        data = &data[used..];
        let field = (tag >> 3) as u32;
        match tag & 0x7 {
            0 => {
                let (value, used) = decode_varint(data)?;
                data = &data[used..];
                fields.push((field, FieldValue::Varint(value)));
            }
            2 => {
                let (len, used) = decode_varint(data)?;
                data = &data[used..];
                let len = len as usize;
                if data.len() < len {
                    return Err(AdapterError::transport("truncated length-delimited field"));
                }
                fields.push((field, FieldValue::Bytes(&data[..len])));
                data = &data[len..];
            }
            // fixed64 / fixed32: skipped
            1 | 5 => {
                let width = if tag & 0x7 == 1 { 8 } else { 4 };
                if data.len() < width {
                    return Err(AdapterError::transport("truncated fixed-width field"));
                }
                data = &data[width..];
            }
            other => {
                return Err(AdapterError::transport(format!(
                    "unsupported wire type {}",
                    other
                )));
            }
        }
    }
    Ok(fields)
}

/// `CipherKeyValue` asking the device to decrypt `value` under `key`.
///
/// Both confirmation flags are set: they are part of the derivation, so
/// they must match what produced existing volumes.
pub fn cipher_key_value(path: &[u32], key: &str, value: &[u8], iv: &[u8]) -> TrezorMessage {
    let mut payload = Vec::new();
    for &index in path {
        encode_uint32_field(&mut payload, 1, index);
    }
    encode_string_field(&mut payload, 2, key);
    encode_bytes_field(&mut payload, 3, value);
    encode_bool_field(&mut payload, 4, false);
    encode_bool_field(&mut payload, 5, true);
    encode_bool_field(&mut payload, 6, true);
    encode_bytes_field(&mut payload, 7, iv);
    TrezorMessage::new(MessageType::CipherKeyValue, payload)
}

pub fn pin_matrix_ack(pin: &str) -> TrezorMessage {
    let mut payload = Vec::new();
    encode_string_field(&mut payload, 1, pin);
    TrezorMessage::new(MessageType::PinMatrixAck, payload)
}

pub fn passphrase_ack(passphrase: &str) -> TrezorMessage {
    let mut payload = Vec::new();
    encode_string_field(&mut payload, 1, passphrase);
    TrezorMessage::new(MessageType::PassphraseAck, payload)
}

/// Value of `CipheredKeyValue.value`
pub fn parse_ciphered_value(payload: &[u8]) -> Result<Vec<u8>> {
    decode_fields(payload)?
        .into_iter()
        .find_map(|(field, value)| match (field, value) {
            (1, FieldValue::Bytes(bytes)) => Some(bytes.to_vec()),
            _ => None,
        })
        .ok_or_else(|| AdapterError::derivation("device reply carried no value"))
}

/// `Failure.code` and `Failure.message`
pub fn parse_failure(payload: &[u8]) -> (Option<u64>, String) {
    let mut code = None;
    let mut message = String::from("unknown failure");
    if let Ok(fields) = decode_fields(payload) {
        for (field, value) in fields {
            match (field, value) {
                (1, FieldValue::Varint(c)) => code = Some(c),
                (2, FieldValue::Bytes(text)) => message = String::from_utf8_lossy(text).into_owned(),
                _ => {}
            }
        }
    }
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = TrezorMessage::new(MessageType::Initialize, vec![0x01, 0x02, 0x03]);
        let serialized = msg.serialize();

        assert_eq!(&serialized[0..2], &[0x00, 0x00]);
        assert_eq!(&serialized[2..6], &[0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&serialized[6..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_parse_header() {
        let (msg_type, len) = TrezorMessage::parse_header(&[0x00, 0x30, 0, 0, 0, 34]).unwrap();
        assert_eq!(msg_type, MessageType::CipheredKeyValue);
        assert_eq!(len, 34);

        assert!(TrezorMessage::parse_header(&[0x00]).is_err());
        assert!(TrezorMessage::parse_header(&[0xFF, 0xFF, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_varint_encoding() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 127);
        assert_eq!(buf, vec![0x7F]);

        buf.clear();
        encode_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);

        buf.clear();
        encode_varint(&mut buf, 0x8000_2723);
        assert_eq!(decode_varint(&buf).unwrap(), (0x8000_2723, 5));
    }

    #[test]
    fn test_varint_errors() {
        assert!(decode_varint(&[0x80]).is_err());
        assert!(decode_varint(&[0x80; 11]).is_err());
    }

    #[test]
    fn test_cipher_key_value_layout() {
        let msg = cipher_key_value(&[0x8000_2723, 0x8000_0001], "luks", &[0xAA; 32], &[0xBB; 16]);
        assert_eq!(msg.msg_type, MessageType::CipherKeyValue);

        let fields = decode_fields(&msg.payload).unwrap();
        assert_eq!(fields[0], (1, FieldValue::Varint(0x8000_2723)));
        assert_eq!(fields[1], (1, FieldValue::Varint(0x8000_0001)));
        assert_eq!(fields[2], (2, FieldValue::Bytes(b"luks")));
        assert_eq!(fields[3], (3, FieldValue::Bytes(&[0xAA; 32])));
        assert_eq!(fields[4], (4, FieldValue::Varint(0)));
        assert_eq!(fields[5], (5, FieldValue::Varint(1)));
        assert_eq!(fields[6], (6, FieldValue::Varint(1)));
        assert_eq!(fields[7], (7, FieldValue::Bytes(&[0xBB; 16])));
    }

    #[test]
    fn test_parse_ciphered_value() {
        let mut payload = Vec::new();
        encode_bytes_field(&mut payload, 1, &[9, 8, 7]);
        assert_eq!(parse_ciphered_value(&payload).unwrap(), vec![9, 8, 7]);

        assert!(parse_ciphered_value(&[]).is_err());
    }

    #[test]
    fn test_parse_failure() {
        let mut payload = Vec::new();
        encode_uint32_field(&mut payload, 1, 7);
        encode_string_field(&mut payload, 2, "PIN invalid");
        assert_eq!(parse_failure(&payload), (Some(7), "PIN invalid".to_string()));

        assert_eq!(parse_failure(&[]), (None, "unknown failure".to_string()));
    }

    #[test]
    fn test_unknown_fields_skipped() {
        let mut payload = Vec::new();
        encode_uint32_field(&mut payload, 9, 1);
        payload.extend_from_slice(&[(10 << 3) | 5, 1, 2, 3, 4]);
        encode_bytes_field(&mut payload, 1, b"key");
        assert_eq!(parse_ciphered_value(&payload).unwrap(), b"key".to_vec());
    }
}
