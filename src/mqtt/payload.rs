//! MQTT ⇄ Modbus payload conversion (spec.md §4.2, "Payload conversion").

use crate::error::PayloadError;
use crate::model::{PayloadType, RegisterType, MAX_DATA_LEN};

/// Decode an inbound command/RPC payload into a register-sized `u16`
/// sequence, honoring the command's configured shape.
pub fn decode(
    payload: &[u8],
    payload_type: PayloadType,
    register_type: RegisterType,
    range: bool,
    size: Option<u16>,
) -> Result<Vec<u16>, PayloadError> {
    let values = match payload_type {
        PayloadType::Binary => decode_binary(payload, range, size)?,
        PayloadType::String | PayloadType::Unspecified => decode_string(payload)?,
    };

    if register_type.is_bit() {
        for v in &values {
            if *v > 1 {
                return Err(PayloadError::InvalidBitValue(*v));
            }
        }
    }
    Ok(values)
}

fn decode_string(payload: &[u8]) -> Result<Vec<u16>, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::InvalidInteger(hex_preview(payload)))?;
    let text = text.trim();
    let n: i64 = text.parse().map_err(|_| PayloadError::InvalidInteger(text.to_string()))?;
    if !(0..=65535).contains(&n) {
        return Err(PayloadError::InvalidInteger(text.to_string()));
    }
    Ok(vec![n as u16])
}

fn decode_binary(payload: &[u8], range: bool, size: Option<u16>) -> Result<Vec<u16>, PayloadError> {
    if payload.len() < 2 || payload.len() % 2 != 0 {
        return Err(PayloadError::InvalidBinaryLength(payload.len()));
    }
    if payload.len() > MAX_DATA_LEN {
        return Err(PayloadError::TooLarge { max: MAX_DATA_LEN, actual: payload.len() });
    }
    if range {
        if let Some(size) = size {
            let expected = size as usize * 2;
            if payload.len() != expected {
                return Err(PayloadError::RangeSizeMismatch { expected, actual: payload.len() });
            }
        }
    }
    Ok(bytes_to_words(payload))
}

fn hex_preview(payload: &[u8]) -> String {
    payload.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Little-endian `u16` words packed contiguously, no framing header
/// (spec.md §6, "Binary payload encoding").
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
}

pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_decimal_string() {
        let v = decode(b"32", PayloadType::String, RegisterType::Holding, false, None).unwrap();
        assert_eq!(v, vec![32]);
    }

    #[test]
    fn rejects_unparseable_string() {
        assert!(decode(b"hello, world!", PayloadType::String, RegisterType::Holding, false, None).is_err());
    }

    #[test]
    fn rejects_string_out_of_range() {
        assert!(decode(b"70000", PayloadType::String, RegisterType::Holding, false, None).is_err());
    }

    #[test]
    fn coil_rejects_non_bit_value() {
        assert!(decode(b"2", PayloadType::String, RegisterType::Coil, false, None).is_err());
        assert!(decode(b"1", PayloadType::String, RegisterType::Coil, false, None).is_ok());
    }

    #[test]
    fn decodes_binary_little_endian_words() {
        let v = decode(&[43, 0, 44, 1], PayloadType::Binary, RegisterType::Holding, true, Some(2)).unwrap();
        assert_eq!(v, vec![43, 300]);
    }

    #[test]
    fn range_size_mismatch_is_rejected() {
        let six_bytes = [1u8, 0, 2, 0, 3, 0];
        assert!(decode(&six_bytes, PayloadType::Binary, RegisterType::Holding, true, Some(2)).is_err());
    }

    #[test]
    fn non_range_command_accepts_any_even_length_up_to_cap() {
        let v = decode(&[43, 0, 44, 0], PayloadType::Binary, RegisterType::Holding, false, None).unwrap();
        assert_eq!(v, vec![43, 44]);
    }

    #[test]
    fn binary_payload_must_be_even_and_nonzero() {
        assert!(decode(&[1, 2, 3], PayloadType::Binary, RegisterType::Holding, false, None).is_err());
        assert!(decode(&[], PayloadType::Binary, RegisterType::Holding, false, None).is_err());
    }

    #[test]
    fn round_trips_words_and_bytes() {
        let words = vec![42u16, 300];
        let bytes = words_to_bytes(&words);
        assert_eq!(bytes, vec![42, 0, 44, 1]);
        assert_eq!(bytes_to_words(&bytes), words);
    }
}
