//! Flat float32 wire codec
//!
//! Tensors cross the RPC boundary as raw little-endian f32 arrays with no
//! length prefix; receivers derive the element count from the byte length.

use crate::{Error, Result};

/// Encode a float vector as raw little-endian bytes
pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode raw little-endian bytes into a float vector.
///
/// A byte length not divisible by 4 is a protocol violation.
pub fn decode_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Protocol {
            message: format!(
                "float payload length {} is not a multiple of 4",
                bytes.len()
            ),
        });
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let values = vec![1.0f32, -2.5, 0.0, 3.25e7];
        let bytes = encode_f32s(&values);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_f32s(&bytes).unwrap(), values);
    }

    #[test]
    fn test_empty() {
        assert!(decode_f32s(&[]).unwrap().is_empty());
        assert!(encode_f32s(&[]).is_empty());
    }

    #[test]
    fn test_misaligned_payload() {
        let result = decode_f32s(&[0u8, 1, 2]);
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }
}
