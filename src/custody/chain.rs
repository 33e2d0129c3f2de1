//! Hash-chained, HMAC-signed custody entries.
//!
//! ```text
//! payloadHash = sha256(canonical_json(payload))
//! signature   = hmac_sha256(key, prevHash ":" payloadHash)
//! entryHash   = sha256(prevHash ":" payloadHash ":" signature)
//! ```
//!
//! `entryHash` covers everything upstream, so editing any field of an entry,
//! or reordering entries, breaks verification from that entry onward.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::LedgerError;
use crate::ports::SecretStore;

/// `prevHash` of the first entry in a chain.
pub const GENESIS: &str = "GENESIS";

/// Secret-store name of the ledger signing key.
pub const SIGNING_KEY_SECRET: &str = "custody.hmacKey";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodySignedEntry {
    pub prev_hash: String,
    pub payload_hash: String,
    pub signature: String,
    pub entry_hash: String,
}

impl CustodySignedEntry {
    pub const FIELDS: [&'static str; 4] = ["prevHash", "payloadHash", "signature", "entryHash"];
}

/// HMAC key, kept as the hex text it is stored as.
#[derive(Clone)]
pub struct SigningKey(String);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

impl SigningKey {
    pub fn from_hex(hex_key: impl Into<String>) -> Result<Self, LedgerError> {
        let key = hex_key.into().trim().to_string();
        if key.is_empty() {
            return Err(LedgerError::Key("empty signing key".into()));
        }
        Ok(Self(key))
    }

    /// 32 random bytes, hex-encoded.
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Reuse the stored key or create and persist a new one. Keys are never
    /// rotated: a new key makes every earlier entry unverifiable.
    pub async fn load_or_create(store: &dyn SecretStore) -> Result<Self, LedgerError> {
        let existing = store
            .get(SIGNING_KEY_SECRET)
            .await
            .map_err(|e| LedgerError::Key(e.to_string()))?;
        if let Some(key) = existing.filter(|k| !k.trim().is_empty()) {
            return Self::from_hex(key);
        }
        let key = Self::generate();
        store
            .set(SIGNING_KEY_SECRET, &key.0)
            .await
            .map_err(|e| LedgerError::Key(e.to_string()))?;
        tracing::info!("generated new custody signing key");
        Ok(key)
    }

    fn mac(&self) -> Result<HmacSha256, LedgerError> {
        HmacSha256::new_from_slice(self.0.as_bytes()).map_err(|e| LedgerError::Key(e.to_string()))
    }
}

/// Compact JSON with object keys sorted at every depth. Arrays keep order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Sign `payload` as the successor of `prev_hash`. Empty `prev_hash` means
/// [`GENESIS`].
pub fn build_signed_entry(
    payload: &Value,
    prev_hash: &str,
    key: &SigningKey,
) -> Result<CustodySignedEntry, LedgerError> {
    let prev = if prev_hash.trim().is_empty() {
        GENESIS.to_string()
    } else {
        prev_hash.to_string()
    };
    let payload_hash = sha256_hex(canonical_json(payload).as_bytes());

    let mut mac = key.mac()?;
    mac.update(format!("{prev}:{payload_hash}").as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let entry_hash = sha256_hex(format!("{prev}:{payload_hash}:{signature}").as_bytes());
    Ok(CustodySignedEntry {
        prev_hash: prev,
        payload_hash,
        signature,
        entry_hash,
    })
}

fn eq_ct(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Rebuild the entry from `payload` and `expected_prev` and require all four
/// fields to match.
pub fn verify_signed_entry(
    payload: &Value,
    entry: &CustodySignedEntry,
    expected_prev: &str,
    key: &SigningKey,
) -> bool {
    let Ok(rebuilt) = build_signed_entry(payload, expected_prev, key) else {
        return false;
    };
    // all four comparisons always run
    let checks = [
        eq_ct(&rebuilt.prev_hash, &entry.prev_hash),
        eq_ct(&rebuilt.payload_hash, &entry.payload_hash),
        eq_ct(&rebuilt.signature, &entry.signature),
        eq_ct(&rebuilt.entry_hash, &entry.entry_hash),
    ];
    checks.iter().all(|ok| *ok)
}
