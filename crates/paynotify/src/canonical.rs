//! Canonical signing string for gateway field maps.
//!
//! The gateway signs `key=value` pairs joined with `&`, keys sorted in byte
//! order, values trimmed and form-encoded, with the merchant passphrase (if
//! any) appended as the final pair. Outbound checkout forms and inbound
//! notifications go through the same function so that both sides agree
//! byte-for-byte.

use std::borrow::Cow;

use crate::constants::PASSPHRASE_KEY;

/// Form-encode a single value.
///
/// ASCII alphanumerics and `-_.` pass through, a space becomes `+`, every
/// other byte becomes `%XX` with uppercase hex.
pub fn encode_value(value: &str) -> String {
    // urlencoding already emits uppercase hex and leaves `~` alone; the gateway
    // wants `+` for spaces and `~` escaped.
    let encoded: Cow<'_, str> = urlencoding::encode(value);
    let mut out = String::with_capacity(encoded.len());
    let mut rest = encoded.as_ref();
    while let Some(idx) = rest.find(['%', '~']) {
        out.push_str(&rest[..idx]);
        if rest[idx..].starts_with('~') {
            out.push_str("%7E");
            rest = &rest[idx + 1..];
            continue;
        }
        let escape = rest.get(idx..idx + 3).unwrap_or(&rest[idx..]);
        if escape == "%20" {
            out.push('+');
        } else {
            out.push_str(&escape.to_ascii_uppercase());
        }
        rest = &rest[idx + escape.len()..];
    }
    out.push_str(rest);
    out
}

/// Build the canonical string for a set of fields.
///
/// Entries whose value is empty after trimming are dropped. The result does
/// not depend on the iteration order of `fields`.
pub fn canonical_string<I, K, V>(fields: I, passphrase: Option<&str>) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> = fields
        .into_iter()
        .filter_map(|(k, v)| {
            let value = v.as_ref().trim();
            if value.is_empty() {
                None
            } else {
                Some((k.as_ref().to_string(), encode_value(value)))
            }
        })
        .collect();
    // Sorting on the full pair keeps repeated keys deterministic too.
    pairs.sort_unstable();

    let mut out = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    if let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(PASSPHRASE_KEY);
        out.push('=');
        out.push_str(&encode_value(passphrase));
    }
    out
}
