//! Runtime leak detection for storage and outbound paths.
//!
//! [`LeakGuard`] inspects data on its way to persistence or the network and
//! rejects anything secret-shaped: 64-hex-character runs (raw private keys),
//! and fields whose names belong to the secret vocabulary (`private_key`,
//! `mnemonic`, `seed_phrase`, `passphrase`, ...). Field names are matched
//! case-insensitively against the whole name, so `privateKey` trips and
//! `secretary` does not.
//!
//! [`LeakGuard::sanitize`] is the best-effort companion: it strips
//! secret-named fields from a structure but cannot catch novel field names,
//! so every true boundary must still call [`LeakGuard::assert_no_secret`].
//! A storage-write wrapper that skips both checks is a defect, not a variant.
//!
//! The field automaton and the hex pattern are compiled once at
//! construction, router-style, and reused for every scan.

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;
use serde_json::Value;

use crate::error::{CustodyError, Result};

/// Field names that always denote secret material.
///
/// Both snake_case and collapsed spellings are listed so camelCase inputs
/// (`privateKey`) match case-insensitively without extra normalization.
const SECRET_FIELD_NAMES: &[&str] = &[
    "private_key",
    "privatekey",
    "secret",
    "secret_key",
    "secretkey",
    "mnemonic",
    "seed",
    "seed_phrase",
    "seedphrase",
    "passphrase",
    "password",
    "keypair",
    "signing_key",
    "signingkey",
];

/// Replacement marker used by [`LeakGuard::redact`].
const REDACTED: &str = "[REDACTED]";

/// Scanner for secret-shaped data.
pub struct LeakGuard {
    /// Whole-name matcher for the secret field vocabulary.
    field_matcher: AhoCorasick,
    /// 64 consecutive hex characters — the shape of a raw 256-bit key.
    hex_pattern: Regex,
}

impl LeakGuard {
    /// Compile the field automaton and hex pattern.
    pub fn new() -> Result<Self> {
        let field_matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(SECRET_FIELD_NAMES)
            .map_err(|e| CustodyError::Internal(format!("field automaton build failed: {e}")))?;

        let hex_pattern = Regex::new(r"[0-9A-Fa-f]{64}")
            .map_err(|e| CustodyError::Internal(format!("hex pattern build failed: {e}")))?;

        Ok(Self {
            field_matcher,
            hex_pattern,
        })
    }

    /// Reject `data` if anything in it looks like a secret.
    ///
    /// Walks the whole value tree. Any secret-named field or any string
    /// containing a 64-hex run fails the check with
    /// [`CustodyError::SecurityViolation`] carrying `context` and the
    /// offending path (never the offending value).
    pub fn assert_no_secret(&self, data: &Value, context: &str) -> Result<()> {
        if let Some(finding) = self.find_violation(data, "$") {
            tracing::warn!(context, finding = %finding, "leak guard blocked secret-shaped data");
            return Err(CustodyError::SecurityViolation {
                context: format!("{context}: {finding}"),
            });
        }
        Ok(())
    }

    /// Strip known secret-named fields from `data`, recursively.
    ///
    /// Idempotent: sanitizing a sanitized value is a no-op. This filter is
    /// name-based only; pair it with [`LeakGuard::assert_no_secret`] at the
    /// real boundary.
    pub fn sanitize(&self, data: &Value) -> Value {
        match data {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(key, _)| !self.is_secret_field(key))
                    .map(|(key, value)| (key.clone(), self.sanitize(value)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            other => other.clone(),
        }
    }

    /// Like [`LeakGuard::sanitize`], but keeps the shape of the structure:
    /// secret-named fields and embedded 64-hex runs are replaced with
    /// `"[REDACTED]"` instead of dropped. Used by the audit log.
    pub fn redact(&self, data: &Value) -> Value {
        match data {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| {
                        if self.is_secret_field(key) {
                            (key.clone(), Value::String(REDACTED.into()))
                        } else {
                            (key.clone(), self.redact(value))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::String(s) => {
                if self.hex_pattern.is_match(s) {
                    Value::String(self.hex_pattern.replace_all(s, REDACTED).into_owned())
                } else {
                    data.clone()
                }
            }
            other => other.clone(),
        }
    }

    /// Whether `name` is in the secret field vocabulary (whole-name,
    /// case-insensitive).
    pub fn is_secret_field(&self, name: &str) -> bool {
        self.field_matcher
            .find(name)
            .is_some_and(|m| m.start() == 0 && m.end() == name.len())
    }

    // -- Private helpers ----------------------------------------------------

    /// Depth-first scan; returns a description of the first violation found.
    fn find_violation(&self, data: &Value, path: &str) -> Option<String> {
        match data {
            Value::Object(map) => {
                for (key, value) in map {
                    if self.is_secret_field(key) {
                        return Some(format!("secret-named field at {path}.{key}"));
                    }
                    if let Some(finding) = self.find_violation(value, &format!("{path}.{key}")) {
                        return Some(finding);
                    }
                }
                None
            }
            Value::Array(items) => {
                for (i, value) in items.iter().enumerate() {
                    if let Some(finding) = self.find_violation(value, &format!("{path}[{i}]")) {
                        return Some(finding);
                    }
                }
                None
            }
            Value::String(s) => {
                if self.hex_pattern.is_match(s) {
                    Some(format!("64-hex sequence at {path}"))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> LeakGuard {
        LeakGuard::new().unwrap()
    }

    #[test]
    fn hex_key_value_is_blocked() {
        let guard = guard();
        let data = json!({ "address": "0xabc123", "payload": "a".repeat(64) });
        let result = guard.assert_no_secret(&data, "test");
        assert!(matches!(
            result,
            Err(CustodyError::SecurityViolation { .. })
        ));
    }

    #[test]
    fn prefixed_hex_key_is_blocked() {
        let guard = guard();
        let data = json!({ "value": format!("0x{}", "d".repeat(64)) });
        assert!(guard.assert_no_secret(&data, "test").is_err());
    }

    #[test]
    fn address_shaped_value_is_allowed() {
        let guard = guard();
        // 40 hex chars — an address, not a key.
        let data = json!({ "address": format!("0x{}", "a".repeat(40)) });
        guard.assert_no_secret(&data, "test").unwrap();
    }

    #[test]
    fn secret_field_names_are_blocked() {
        let guard = guard();
        for field in ["private_key", "privateKey", "mnemonic", "seed_phrase", "passphrase"] {
            let data = json!({ field: "anything" });
            assert!(
                guard.assert_no_secret(&data, "test").is_err(),
                "field {field} should be blocked"
            );
        }
    }

    #[test]
    fn nested_secret_field_is_found() {
        let guard = guard();
        let data = json!({ "wallet": { "meta": [ { "secret": "x" } ] } });
        let err = guard.assert_no_secret(&data, "outbound").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("outbound"));
        assert!(msg.contains("$.wallet.meta[0].secret"));
    }

    #[test]
    fn lookalike_field_names_pass() {
        let guard = guard();
        let data = json!({ "secretary": "alice", "seeds_planted": 4, "password_hint_count": 0 });
        guard.assert_no_secret(&data, "test").unwrap();
    }

    #[test]
    fn clean_payload_passes() {
        let guard = guard();
        let data = json!({
            "address": "0xabc123",
            "balance": 1.5,
            "wallets": ["w1", "w2"],
        });
        guard.assert_no_secret(&data, "test").unwrap();
    }

    #[test]
    fn sanitize_strips_secret_fields() {
        let guard = guard();
        let data = json!({
            "address": "0xabc",
            "privateKey": "deadbeef",
            "nested": { "seed": "words words", "kept": true },
        });

        let clean = guard.sanitize(&data);
        assert_eq!(clean["address"], "0xabc");
        assert!(clean.get("privateKey").is_none());
        assert!(clean["nested"].get("seed").is_none());
        assert_eq!(clean["nested"]["kept"], true);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let guard = guard();
        let data = json!({
            "a": { "passphrase": "p", "b": [ { "secret": 1 }, { "ok": 2 } ] },
            "c": "plain",
        });

        let once = guard.sanitize(&data);
        let twice = guard.sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn redact_keeps_shape() {
        let guard = guard();
        let data = json!({
            "mnemonic": "twelve words",
            "note": format!("leaked {}", "e".repeat(64)),
            "count": 3,
        });

        let redacted = guard.redact(&data);
        assert_eq!(redacted["mnemonic"], "[REDACTED]");
        assert_eq!(redacted["note"], "leaked [REDACTED]");
        assert_eq!(redacted["count"], 3);
    }

    #[test]
    fn redact_is_idempotent() {
        let guard = guard();
        let data = json!({ "secret": "a".repeat(64), "list": [ { "password": 1 } ] });
        let once = guard.redact(&data);
        let twice = guard.redact(&once);
        assert_eq!(once, twice);
    }
}
