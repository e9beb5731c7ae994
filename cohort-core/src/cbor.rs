// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical CBOR encoding.
//!
//! CBOR is the single byte encoding used for link bodies, wire messages and
//! persisted blobs. Struct fields serialize in declaration order with no
//! indefinite-length items, so for the fixed shapes in this workspace the
//! encoding is canonical: equal values always produce equal bytes, which is
//! what content addressing relies on.
use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(Into::<EncodeError>::into)?;
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let value = ciborium::from_reader::<T, _>(bytes).map_err(Into::<DecodeError>::into)?;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    /// An error occurred while writing bytes.
    #[error("an error occurred while writing bytes: {0}")]
    Io(std::io::Error),

    /// A value cannot be serialized.
    #[error("an error occurred while serializing value: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// An error occurred while reading bytes.
    #[error("an error occurred while reading bytes: {0}")]
    Io(std::io::Error),

    /// A syntax error in the byte stream at the given offset.
    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    /// A parsed value could not be processed.
    #[error("an error occurred while processing a parsed value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    /// The input caused serde to recurse too much.
    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{decode, encode};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        value: u64,
    }

    #[test]
    fn encode_decode() {
        let payload = Payload {
            name: "devices".to_string(),
            value: 3,
        };
        let bytes = encode(&payload).unwrap();
        let payload_again: Payload = decode(&bytes).unwrap();
        assert_eq!(payload, payload_again);
    }

    #[test]
    fn equal_values_equal_bytes() {
        let a = Payload {
            name: "team".to_string(),
            value: 0,
        };
        let b = Payload {
            name: "team".to_string(),
            value: 0,
        };
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn garbage_rejected() {
        let result: Result<Payload, _> = decode(&[0xff, 0x13, 0x37]);
        assert!(result.is_err());
    }
}
