/// Sandbox host used when no gateway host is configured.
pub const SANDBOX_HOST: &str = "https://sandbox.payfast.co.za";

/// Path on the gateway host that accepts checkout form posts.
pub const PROCESS_PATH: &str = "/eng/process";

/// Default SQLite order database path.
pub const DEFAULT_ORDER_DB_PATH: &str = "./orders.db";

/// Name of the pair appended after all canonical fields when a passphrase is set.
pub const PASSPHRASE_KEY: &str = "passphrase";

/// Callback field names.
pub mod field {
    pub const SIGNATURE: &str = "signature";
    pub const MERCHANT_ID: &str = "merchant_id";
    pub const MERCHANT_KEY: &str = "merchant_key";
    /// Our own order reference, echoed back by the gateway.
    pub const REFERENCE: &str = "m_payment_id";
    /// The gateway's identifier for the payment.
    pub const GATEWAY_PAYMENT_ID: &str = "pf_payment_id";
    pub const AMOUNT_GROSS: &str = "amount_gross";
    pub const AMOUNT: &str = "amount";
    pub const PAYMENT_STATUS: &str = "payment_status";
    pub const RETURN_URL: &str = "return_url";
    pub const CANCEL_URL: &str = "cancel_url";
    pub const NOTIFY_URL: &str = "notify_url";
    pub const NAME_FIRST: &str = "name_first";
    pub const NAME_LAST: &str = "name_last";
    pub const EMAIL_ADDRESS: &str = "email_address";
    pub const ITEM_NAME: &str = "item_name";
    pub const ITEM_DESCRIPTION: &str = "item_description";
}

/// Maximum number of per-order locks held at once.
pub const MAX_ORDER_LOCKS: usize = 100_000;

/// How often the background task reclaims idle order locks.
pub const LOCK_CLEANUP_INTERVAL_SECS: u64 = 60;
