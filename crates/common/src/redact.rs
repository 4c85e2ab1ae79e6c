//! Field-level redaction for log and audit payloads
//!
//! Every structured context that reaches a log line or an audit sink passes
//! through [`RedactionConfig::redact`] first. Three treatments exist:
//!
//! - **redact**: value replaced with `[redacted]`
//! - **mask**: first and last two characters kept (`ab***yz`)
//! - **hash**: SHA-256 hex digest of the value
//!
//! Matching is on the lowercased object key. Keys containing `token` or
//! `secret`, plus a fixed set of credential-bearing header names, are always
//! redacted regardless of configuration.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const REDACTED: &str = "[redacted]";
const MAX_DEPTH: usize = 6;

const DEFAULT_REDACT_FIELDS: &[&str] = &[
    "authorization",
    "token",
    "access_token",
    "refresh_token",
    "client_secret",
    "email",
    "phone",
    "mobile",
    "first_name",
    "last_name",
    "firstname",
    "lastname",
    "name",
];

const DEFAULT_MASK_FIELDS: &[&str] = &["ip", "ip_address", "address"];

const ALWAYS_REDACT: &[&str] = &[
    "secret",
    "password",
    "cookie",
    "set-cookie",
    "api_key",
    "apikey",
    "x-zoho-signature",
    "x-zoho-webhook-signature",
];

/// Which keys get redacted, masked, or hashed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub redact_fields: Vec<String>,
    pub mask_fields: Vec<String>,
    pub hash_fields: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_fields: DEFAULT_REDACT_FIELDS.iter().map(|s| s.to_string()).collect(),
            mask_fields: DEFAULT_MASK_FIELDS.iter().map(|s| s.to_string()).collect(),
            hash_fields: Vec::new(),
        }
    }
}

impl RedactionConfig {
    /// Return a redacted copy of `value`. The input is never modified.
    pub fn redact(&self, value: &Value) -> Value {
        let sets = KeySets {
            redact: lowercase_set(&self.redact_fields),
            mask: lowercase_set(&self.mask_fields),
            hash: lowercase_set(&self.hash_fields),
        };
        sets.walk(value, 0)
    }
}

struct KeySets {
    redact: HashSet<String>,
    mask: HashSet<String>,
    hash: HashSet<String>,
}

impl KeySets {
    fn walk(&self, value: &Value, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return Value::String(REDACTED.into());
        }
        match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.walk(v, depth + 1)).collect())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, entry) in map {
                    let lower = key.to_ascii_lowercase();
                    let replaced = if self.is_redacted(&lower) {
                        Value::String(REDACTED.into())
                    } else if self.hash.contains(&lower) {
                        Value::String(hash_value(entry))
                    } else if self.mask.contains(&lower) {
                        Value::String(mask_value(entry))
                    } else {
                        self.walk(entry, depth + 1)
                    };
                    out.insert(key.clone(), replaced);
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn is_redacted(&self, lower: &str) -> bool {
        ALWAYS_REDACT.contains(&lower)
            || self.redact.contains(lower)
            || lower.contains("token")
            || lower.contains("secret")
    }
}

fn lowercase_set(fields: &[String]) -> HashSet<String> {
    fields.iter().map(|f| f.to_ascii_lowercase()).collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Keep the first and last two characters; short values become all `*`.
pub fn mask_value(value: &Value) -> String {
    let chars: Vec<char> = value_text(value).chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}

/// SHA-256 hex digest of the value's text form.
pub fn hash_value(value: &Value) -> String {
    format!("{:x}", Sha256::digest(value_text(value).as_bytes()))
}
