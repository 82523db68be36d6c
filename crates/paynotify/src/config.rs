use std::env;
use std::str::FromStr;

use rust_decimal::Decimal;
use url::Url;

use crate::constants::{DEFAULT_ORDER_DB_PATH, PROCESS_PATH, SANDBOX_HOST};
use crate::error::ConfigError;
use crate::trusted::TrustedSources;
use crate::verifier::VerifierConfig;

#[derive(Clone)]
pub struct NotifyConfig {
    /// Merchant id every callback must carry
    pub merchant_id: String,
    /// Merchant key, only sent on checkout forms (None = checkout disabled)
    pub merchant_key: Option<String>,
    /// Shared signing passphrase (None = account has none)
    pub passphrase: Option<String>,
    /// Addresses and CIDR blocks callbacks may come from (empty = any)
    pub trusted_sources: TrustedSources,
    /// Gateway base URL, e.g. the sandbox or live host
    pub gateway_host: Url,
    pub notify_url: Option<Url>,
    pub return_url: Option<Url>,
    pub cancel_url: Option<Url>,
    /// SQLite database path
    pub order_db_path: String,
    /// Largest accepted difference between order and callback amounts
    pub amount_tolerance: Decimal,
}

impl std::fmt::Debug for NotifyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyConfig")
            .field("merchant_id", &self.merchant_id)
            .field(
                "merchant_key",
                &self.merchant_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("trusted_sources", &self.trusted_sources)
            .field("gateway_host", &self.gateway_host.as_str())
            .field("notify_url", &self.notify_url.as_ref().map(Url::as_str))
            .field("return_url", &self.return_url.as_ref().map(Url::as_str))
            .field("cancel_url", &self.cancel_url.as_ref().map(Url::as_str))
            .field("order_db_path", &self.order_db_path)
            .field("amount_tolerance", &self.amount_tolerance)
            .finish()
    }
}

impl NotifyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // Required: merchant id
        let merchant_id = var("MERCHANT_ID").ok_or(ConfigError::MissingRequired("MERCHANT_ID"))?;

        let merchant_key = var("MERCHANT_KEY");
        let passphrase = var("PASSPHRASE");

        let trusted_sources = match var("TRUSTED_SOURCES") {
            Some(list) => TrustedSources::parse_list(&list)?,
            None => TrustedSources::default(),
        };

        let gateway_host = parse_url(&var("GATEWAY_HOST").unwrap_or_else(|| SANDBOX_HOST.to_string()))?;
        let notify_url = var("NOTIFY_URL").as_deref().map(parse_url).transpose()?;
        let return_url = var("RETURN_URL").as_deref().map(parse_url).transpose()?;
        let cancel_url = var("CANCEL_URL").as_deref().map(parse_url).transpose()?;

        let order_db_path = var("ORDER_DB_PATH").unwrap_or_else(|| DEFAULT_ORDER_DB_PATH.to_string());

        let amount_tolerance = match var("AMOUNT_TOLERANCE") {
            Some(raw) => {
                let tolerance =
                    Decimal::from_str(&raw).map_err(|_| ConfigError::InvalidAmount(raw.clone()))?;
                if tolerance.is_sign_negative() {
                    return Err(ConfigError::InvalidAmount(raw));
                }
                tolerance
            }
            None => Decimal::ZERO,
        };

        Ok(Self {
            merchant_id,
            merchant_key,
            passphrase,
            trusted_sources,
            gateway_host,
            notify_url,
            return_url,
            cancel_url,
            order_db_path,
            amount_tolerance,
        })
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            merchant_id: self.merchant_id.clone(),
            passphrase: self.passphrase.clone(),
            trusted_sources: self.trusted_sources.clone(),
        }
    }

    /// Where checkout forms are posted.
    pub fn process_url(&self) -> String {
        format!(
            "{}{}",
            self.gateway_host.as_str().trim_end_matches('/'),
            PROCESS_PATH
        )
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_string()))
}
