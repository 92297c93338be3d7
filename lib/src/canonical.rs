// Copyright 2025 The CVC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The canonical codec: every byte sequence that gets hashed goes through
//! here.
//!
//! Canonical form is compact JSON with lexicographically ordered keys,
//! NFC-normalized strings, and no nulls: absent optional fields are omitted
//! entirely rather than serialized as `null`. Two values are semantically
//! equal iff their canonical bytes are byte-equal, so content ids can be
//! computed as the SHA-256 of the canonical form.

use serde::Serialize;
use serde_json::Value;
use sha2::Digest as _;
use sha2::Sha256;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization as _;
use unicode_normalization::is_nfc;

/// Error returned when a value has no canonical byte form.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The value serialized to JSON `null` somewhere. Canonical form has no
    /// nulls: absent fields must be omitted, and non-finite floats serialize
    /// to `null` under serde_json.
    #[error("Value is not canonicalizable: {reason}")]
    NonCanonical {
        /// What made the value unrepresentable.
        reason: String,
    },
    /// The value could not be serialized at all.
    #[error("Could not serialize value")]
    Serialize(#[from] serde_json::Error),
}

/// Serializes `value` into its canonical byte form.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let value = serde_json::to_value(value)?;
    let value = normalize(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// SHA-256 digest of `bytes` as raw 32 bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 digest of `bytes` as a lowercase 64-hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

// serde_json's Map is BTreeMap-backed (the "preserve_order" feature is off),
// so object keys come out lexicographically sorted and re-inserting a
// normalized key keeps the ordering invariant.
fn normalize(value: Value) -> Result<Value, EncodingError> {
    match value {
        Value::Null => Err(EncodingError::NonCanonical {
            reason: "null has no canonical form (omit the field instead)".to_string(),
        }),
        Value::Bool(_) | Value::Number(_) => Ok(value),
        Value::String(s) => Ok(Value::String(nfc_string(s))),
        Value::Array(values) => {
            let values = values.into_iter().map(normalize).collect::<Result<_, _>>()?;
            Ok(Value::Array(values))
        }
        Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (key, value) in map {
                let key = nfc_string(key);
                let value = normalize(value)?;
                if normalized.insert(key.clone(), value).is_some() {
                    return Err(EncodingError::NonCanonical {
                        reason: format!("keys collide after NFC normalization: {key:?}"),
                    });
                }
            }
            Ok(Value::Object(normalized))
        }
    }
}

fn nfc_string(s: String) -> String {
    if is_nfc(&s) {
        s
    } else {
        s.nfc().collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Record {
        zebra: u32,
        apple: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        maybe: Option<String>,
    }

    #[test]
    fn test_keys_sorted_and_compact() {
        let bytes = to_canonical_bytes(&Record {
            zebra: 1,
            apple: 2,
            maybe: None,
        })
        .unwrap();
        assert_eq!(bytes, br#"{"apple":2,"zebra":1}"#);
    }

    #[test]
    fn test_semantic_equality_is_byte_equality() {
        let a = to_canonical_bytes(&Record {
            zebra: 1,
            apple: 2,
            maybe: Some("caf\u{e9}".to_string()),
        })
        .unwrap();
        // U+0065 U+0301 (e + combining acute) normalizes to U+00E9.
        let b = to_canonical_bytes(&Record {
            zebra: 1,
            apple: 2,
            maybe: Some("cafe\u{301}".to_string()),
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(sha256_hex(&a), sha256_hex(&b));
    }

    #[test]
    fn test_null_rejected() {
        assert_matches!(
            to_canonical_bytes(&serde_json::json!({"x": null})),
            Err(EncodingError::NonCanonical { .. })
        );
        // serde_json turns non-finite floats into null.
        assert_matches!(
            to_canonical_bytes(&f64::NAN),
            Err(EncodingError::NonCanonical { .. })
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(to_canonical_bytes(&42u64).unwrap(), b"42");
        assert_eq!(to_canonical_bytes(&1.5f64).unwrap(), b"1.5");
    }

    #[test]
    fn test_sha256_hex() {
        // Well-known digest of the empty input.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
