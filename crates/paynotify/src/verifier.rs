use std::fmt;

use crate::constants::field;
use crate::error::Rejection;
use crate::payload::CallbackPayload;
use crate::signature::{sign, signatures_match};
use crate::trusted::TrustedSources;

/// Settings the verifier checks every callback against.
#[derive(Clone, Default)]
pub struct VerifierConfig {
    pub merchant_id: String,
    /// Shared passphrase. `None` or empty means the merchant account has none.
    pub passphrase: Option<String>,
    pub trusted_sources: TrustedSources,
}

impl fmt::Debug for VerifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifierConfig")
            .field("merchant_id", &self.merchant_id)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("trusted_sources", &self.trusted_sources)
            .finish()
    }
}

/// A callback whose source, signature and merchant have been checked.
///
/// Only [`Verifier::verify`] creates one, so anything that takes a
/// `VerifiedNotification` can read payload fields as trusted.
#[derive(Debug, Clone)]
pub struct VerifiedNotification {
    payload: CallbackPayload,
    signature: String,
}

impl VerifiedNotification {
    pub fn payload(&self) -> &CallbackPayload {
        &self.payload
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Our order reference (`m_payment_id`).
    pub fn reference(&self) -> Option<&str> {
        self.payload.non_blank(field::REFERENCE)
    }

    /// Gross amount as sent, `amount_gross` falling back to `amount`.
    pub fn gross_amount(&self) -> Option<&str> {
        self.payload
            .non_blank(field::AMOUNT_GROSS)
            .or_else(|| self.payload.non_blank(field::AMOUNT))
    }

    pub fn gateway_payment_id(&self) -> Option<&str> {
        self.payload.non_blank(field::GATEWAY_PAYMENT_ID)
    }

    pub fn payment_status(&self) -> &str {
        self.payload.non_blank(field::PAYMENT_STATUS).unwrap_or("")
    }
}

/// Decides whether a callback may be trusted. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        if config.trusted_sources.is_open() {
            tracing::warn!("no trusted sources configured; notifications accepted from any address");
        }
        Self { config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Check a callback received from `source`.
    ///
    /// Checks run in a fixed order and the first failure wins: source address,
    /// signature presence, signature value, merchant id.
    pub fn verify(
        &self,
        payload: &CallbackPayload,
        source: &str,
    ) -> Result<VerifiedNotification, Rejection> {
        if !self.config.trusted_sources.allows(source) {
            tracing::warn!(source = %source, "notification from untrusted source");
            return Err(Rejection::UntrustedSource);
        }

        let Some(received) = payload.signature() else {
            tracing::warn!(source = %source, "notification without signature");
            return Err(Rejection::MissingSignature);
        };

        let expected = sign(payload.signed_fields(), self.config.passphrase.as_deref());
        if !signatures_match(&expected, received) {
            tracing::warn!(source = %source, "notification signature mismatch");
            return Err(Rejection::BadSignature);
        }

        if payload.get(field::MERCHANT_ID) != Some(self.config.merchant_id.as_str()) {
            tracing::warn!(
                source = %source,
                merchant_id = payload.get(field::MERCHANT_ID).unwrap_or(""),
                "notification for a different merchant"
            );
            return Err(Rejection::BadMerchant);
        }

        tracing::debug!(
            source = %source,
            reference = payload.get(field::REFERENCE).unwrap_or(""),
            "notification verified"
        );

        Ok(VerifiedNotification {
            payload: payload.clone(),
            signature: received.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier(trusted: &str) -> Verifier {
        Verifier::new(VerifierConfig {
            merchant_id: "10000100".to_string(),
            passphrase: Some("jt7NOE43FZPn".to_string()),
            trusted_sources: TrustedSources::parse_list(trusted).unwrap(),
        })
    }

    fn signed_payload(fields: &[(&str, &str)], passphrase: &str) -> CallbackPayload {
        let mut payload: CallbackPayload = fields.iter().copied().collect();
        payload.insert("signature", sign(fields.iter().copied(), Some(passphrase)));
        payload
    }

    fn fields() -> Vec<(&'static str, &'static str)> {
        vec![
            ("merchant_id", "10000100"),
            ("m_payment_id", "order-1"),
            ("pf_payment_id", "1089250"),
            ("payment_status", "COMPLETE"),
            ("item_name", "Village tour"),
            ("amount_gross", "35.00"),
            ("custom_str1", ""),
        ]
    }

    #[test]
    fn accepts_round_trip_signature() {
        let payload = signed_payload(&fields(), "jt7NOE43FZPn");
        let verified = verifier("").verify(&payload, "41.74.179.194").unwrap();
        assert_eq!(verified.reference(), Some("order-1"));
        assert_eq!(verified.gross_amount(), Some("35.00"));
        assert_eq!(verified.payment_status(), "COMPLETE");
    }

    #[test]
    fn rejects_untrusted_source_first() {
        let payload = CallbackPayload::new();
        let err = verifier("10.0.0.0/24").verify(&payload, "10.0.1.5").unwrap_err();
        assert_eq!(err, Rejection::UntrustedSource);
    }

    #[test]
    fn rejects_missing_signature() {
        let payload: CallbackPayload = fields().into_iter().collect();
        let err = verifier("").verify(&payload, "10.0.0.1").unwrap_err();
        assert_eq!(err, Rejection::MissingSignature);
    }

    #[test]
    fn rejects_wrong_passphrase() {
        let payload = signed_payload(&fields(), "other");
        let err = verifier("").verify(&payload, "10.0.0.1").unwrap_err();
        assert_eq!(err, Rejection::BadSignature);
    }

    #[test]
    fn rejects_tampered_field() {
        let mut payload = signed_payload(&fields(), "jt7NOE43FZPn");
        payload.insert("amount_gross", "0.01");
        let err = verifier("").verify(&payload, "10.0.0.1").unwrap_err();
        assert_eq!(err, Rejection::BadSignature);
    }

    #[test]
    fn rejects_other_merchant_even_with_valid_signature() {
        let mut f = fields();
        f[0] = ("merchant_id", "99999999");
        let payload = signed_payload(&f, "jt7NOE43FZPn");
        let err = verifier("").verify(&payload, "10.0.0.1").unwrap_err();
        assert_eq!(err, Rejection::BadMerchant);
    }

    #[test]
    fn signature_is_checked_before_merchant() {
        let mut f = fields();
        f[0] = ("merchant_id", "99999999");
        let mut payload = signed_payload(&f, "jt7NOE43FZPn");
        payload.insert("signature", "00000000000000000000000000000000");
        let err = verifier("").verify(&payload, "10.0.0.1").unwrap_err();
        assert_eq!(err, Rejection::BadSignature);
    }

    #[test]
    fn debug_redacts_passphrase() {
        let rendered = format!("{:?}", verifier("").config());
        assert!(!rendered.contains("jt7NOE43FZPn"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
