//! Canonical request serialization for signing
//!
//! A mutating request is signed over the RFC 8785 (JCS) canonical form of
//! its JSON body with the `signature` member removed. Canonicalization is a
//! pure function of the body, so verifier and signer agree byte-for-byte
//! without sharing any serializer state.

use serde::Serialize;
use serde_json::Value;

use crate::{EconomyError, EconomyResult};

/// Canonical bytes of `body` with any top-level `signature` member removed.
///
/// Rejects non-object bodies: a signature over a bare scalar or array has
/// no field to exclude and no defined actor.
pub fn signing_bytes(body: &Value) -> EconomyResult<Vec<u8>> {
    let mut unsigned = body.clone();
    match unsigned.as_object_mut() {
        Some(obj) => {
            obj.remove("signature");
        }
        None => {
            return Err(EconomyError::validation(
                "signed request body must be a JSON object",
            ))
        }
    }
    let canonical = serde_jcs::to_string(&unsigned)?;
    Ok(canonical.into_bytes())
}

/// Canonical bytes for a request type being signed on the client side.
///
/// Serializes `request` to JSON first so signer and verifier share the
/// same canonical form.
pub fn signing_bytes_for<T: Serialize>(request: &T) -> EconomyResult<Vec<u8>> {
    let value = serde_json::to_value(request)?;
    signing_bytes(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_member_is_excluded() {
        let signed = json!({"b": 1, "a": "x", "signature": "zzz"});
        let unsigned = json!({"a": "x", "b": 1});
        assert_eq!(
            signing_bytes(&signed).unwrap(),
            signing_bytes(&unsigned).unwrap()
        );
    }

    #[test]
    fn key_order_does_not_matter() {
        let one = json!({"title": "fix", "reward": 10, "poster_id": "a-1"});
        let two = json!({"poster_id": "a-1", "reward": 10, "title": "fix"});
        assert_eq!(signing_bytes(&one).unwrap(), signing_bytes(&two).unwrap());
    }

    #[test]
    fn non_object_rejected() {
        assert!(signing_bytes(&json!([1, 2, 3])).is_err());
        assert!(signing_bytes(&json!("scalar")).is_err());
    }

    #[test]
    fn nested_objects_canonicalize() {
        let v = json!({"outer": {"z": 1, "a": 2}, "signature": "s"});
        let bytes = signing_bytes(&v).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"outer":{"a":2,"z":1}}"#
        );
    }
}
