use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::RpcError;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Prefix used for correlation ids and worker secrets.
pub const CLIENT_PREFIX: &str = "client";
pub const SECRET_LENGTH: usize = 16;
pub const SUBSCRIPTION_KEY_LENGTH: usize = 6;
/// Draws made by `generate_unique_key` before it gives up.
pub const MAX_KEY_ATTEMPTS: usize = 1024;

/// Correlates a request with its response (`requestSecret` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

/// Names one stream subscription (`subscriptionKey` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        CorrelationId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SubscriptionKey {
    pub fn new(value: impl Into<String>) -> Self {
        SubscriptionKey(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        CorrelationId(value)
    }
}

impl From<String> for SubscriptionKey {
    fn from(value: String) -> Self {
        SubscriptionKey(value)
    }
}

/// `PREFIX_` followed by `length` random hex digits.
pub fn generate_key(prefix: &str, length: usize) -> String {
    let mut rng = rand::rng();
    let mut key = String::with_capacity(prefix.len() + 1 + length);
    key.push_str(&prefix.to_uppercase());
    key.push('_');
    for _ in 0..length {
        key.push(HEX[rng.random_range(0..HEX.len())] as char);
    }
    key
}

/// Regenerates until the key is absent from `existing`.
///
/// Only guarantees there is no collision right now; callers holding the set
/// must insert the returned key themselves before releasing it. Fails once
/// `MAX_KEY_ATTEMPTS` draws have all collided, which happens when `length`
/// is too short for the number of live keys.
pub fn generate_unique_key<F>(prefix: &str, length: usize, mut exists: F) -> Result<String, RpcError>
where
    F: FnMut(&str) -> bool,
{
    for _ in 0..MAX_KEY_ATTEMPTS {
        let key = generate_key(prefix, length);
        if !exists(&key) {
            return Ok(key);
        }
        tracing::trace!(key = %key, "generated key collided, retrying");
    }
    Err(key_space_exhausted(prefix, length))
}

pub fn key_space_exhausted(prefix: &str, length: usize) -> RpcError {
    tracing::warn!(prefix = %prefix, length, "no free key left");
    RpcError::internal(format!(
        "no unused {}_ key of {} hex digits after {} attempts",
        prefix.to_uppercase(),
        length,
        MAX_KEY_ATTEMPTS
    ))
}

/// Secrets issued by one connection.
///
/// A secret stays in the ring until its request settles, so a response can
/// only settle a request this session actually sent.
#[derive(Debug)]
pub struct SecretRing {
    issued: HashSet<String>,
    length: usize,
}

impl SecretRing {
    pub fn new() -> Self {
        Self::with_length(SECRET_LENGTH)
    }

    pub fn with_length(length: usize) -> Self {
        SecretRing {
            issued: HashSet::new(),
            length,
        }
    }

    pub fn issue(&mut self, prefix: Option<&str>) -> Result<String, RpcError> {
        let prefix = prefix.unwrap_or(CLIENT_PREFIX);
        let issued = &self.issued;
        let secret = generate_unique_key(prefix, self.length, |k| issued.contains(k))?;
        self.issued.insert(secret.clone());
        Ok(secret)
    }

    pub fn revoke(&mut self, secret: &str) -> bool {
        self.issued.remove(secret)
    }

    pub fn was_issued(&self, secret: &str) -> bool {
        self.issued.contains(secret)
    }

    pub fn clear(&mut self) {
        self.issued.clear();
    }

    pub fn len(&self) -> usize {
        self.issued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

impl Default for SecretRing {
    fn default() -> Self {
        Self::new()
    }
}
