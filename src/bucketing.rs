//! Deterministic bucketing for percentage rollouts.
//!
//! The bucket value must be bit-identical across every implementation of
//! the protocol; any deviation here silently reshuffles rollouts.

use crate::user::User;
use hex::ToHex;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::ops::Div;

const BUCKET_DIVIDER: f64 = 0xFFFFFFFFFFFFFFFu64 as f64;

/// Compute the rollout bucket for a user, in `[0.0, 1.0)`.
///
/// `context_key` is the flag or segment key, `bucket_by` selects the user
/// attribute to hash (default: the key). A user whose selected attribute
/// is missing or not a string/integer always lands at 0.0.
pub fn bucket_user(user: &User, context_key: &str, salt: &str, bucket_by: Option<&str>) -> f64 {
    let id_hash = match bucketable_value(user, bucket_by.unwrap_or("key")) {
        Some(id) => id,
        None => return 0.0,
    };

    // hash of `contextKey.salt.idHash` with the secondary key appended
    // when the user has one
    let mut hasher = Sha1::new()
        .chain(context_key)
        .chain(".")
        .chain(salt)
        .chain(".")
        .chain(&id_hash);
    if let Some(secondary) = &user.secondary {
        hasher = hasher.chain(".").chain(secondary);
    }
    let hash = &hasher.finalize()[..];

    // hex string of the hash is cut to first 15 characters
    let mut hexed: String = hash.encode_hex();
    hexed.truncate(15);
    // 15 hex characters always fit a u64
    let val = u64::from_str_radix(&hexed, 16).unwrap_or_default() as f64;

    // divide by const, results in value between 0 and 1
    val.div(BUCKET_DIVIDER)
}

/// Coerce the selected attribute to the string the hash expects.
///
/// Integers render as plain decimal digits; anything else non-string is
/// not bucketable.
fn bucketable_value(user: &User, attribute: &str) -> Option<String> {
    match user.attribute(attribute)? {
        Value::String(s) => Some(s),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}
