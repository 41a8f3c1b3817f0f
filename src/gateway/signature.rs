use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;

use super::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer keyed with the merchant integrity secret.
///
/// Field signatures use the processor's canonical form: field names sorted
/// lexicographically, each followed directly by its value, no separators.
#[derive(Clone)]
pub struct IntegritySigner {
    mac: HmacSha256,
}

impl fmt::Debug for IntegritySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegritySigner").finish_non_exhaustive()
    }
}

impl IntegritySigner {
    pub fn new(secret: &str) -> Result<Self, GatewayError> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Configuration(format!("invalid integrity secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Hex digest over the canonical concatenation of `fields`.
    pub fn sign_fields<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> String
    where
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.sign_bytes(canonicalize(&sorted).as_bytes())
    }

    pub fn sign_bytes(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Recomputes the digest over `payload` and compares it with `signature`
    /// in constant time. Hex case is ignored.
    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let expected = self.sign_bytes(payload);
        let provided = signature.trim().to_ascii_lowercase();
        constant_time_eq(expected.as_bytes(), provided.as_bytes())
    }
}

/// `name1value1name2value2...` in key order.
pub fn canonicalize(fields: &BTreeMap<String, String>) -> String {
    fields.iter().fold(String::new(), |mut acc, (name, value)| {
        acc.push_str(name);
        acc.push_str(value);
        acc
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
