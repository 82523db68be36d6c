use md5::{Digest, Md5};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::canonical::canonical_string;

/// Compute the gateway signature over a field set: MD5 of the canonical
/// string, lowercase hex.
///
/// MD5 is fixed by the gateway protocol. It only authenticates together with
/// the shared passphrase and must not be reused for anything else.
pub fn sign<I, K, V>(fields: I, passphrase: Option<&str>) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    digest_hex(canonical_string(fields, passphrase).as_bytes())
}

/// MD5 of `bytes`, lowercase hex.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Compare an expected signature with one received from the wire.
///
/// Both sides are hashed to fixed-length SHA-256 digests first, so neither the
/// position of the first mismatch nor the length of the received value shows
/// up in timing. The comparison is exact: `ABC` and `abc` differ.
pub fn signatures_match(expected: &str, received: &str) -> bool {
    let he = Sha256::digest(expected.as_bytes());
    let hr = Sha256::digest(received.as_bytes());
    he.ct_eq(&hr).into()
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}
