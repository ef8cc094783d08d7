//! Signed-request decoding
//!
//! A mutating body names its actor (`poster_id`, `bidder_id`, ...) and
//! carries a `signature` over the canonical form of every other field. The
//! helper verifies through the identity oracle before the body is
//! deserialized, so handlers only ever see authenticated requests.

use serde::de::DeserializeOwned;
use serde_json::Value;

use agora_core::{canonical, EconomyError, EconomyResult};
use agora_engine::identity::IdentityService;

/// Verify and decode a signed body; `actor_field` names the signing agent.
pub async fn decode_signed<T: DeserializeOwned>(
    identity: &IdentityService,
    mut body: Value,
    actor_field: &str,
) -> EconomyResult<T> {
    let actor = body
        .get(actor_field)
        .and_then(Value::as_str)
        .ok_or_else(|| EconomyError::validation(format!("missing {}", actor_field)))?
        .to_string();
    let signature = body
        .get("signature")
        .and_then(Value::as_str)
        .ok_or_else(|| EconomyError::validation("missing signature"))?
        .to_string();

    let message = canonical::signing_bytes(&body)?;
    if !identity.verify(&actor, &message, &signature).await? {
        return Err(EconomyError::unauthorized("signature verification failed"));
    }

    if let Some(object) = body.as_object_mut() {
        object.remove("signature");
    }
    Ok(serde_json::from_value(body)?)
}
