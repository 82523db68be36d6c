use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::order::{OrderId, OrderStatus, TicketId, TicketStatus};

/// Why a callback was refused before any of its content was trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[error("untrusted source address")]
    UntrustedSource,

    #[error("missing signature")]
    MissingSignature,

    #[error("bad signature")]
    BadSignature,

    #[error("bad merchant id")]
    BadMerchant,
}

impl Rejection {
    /// Stable label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::UntrustedSource => "untrusted_source",
            Rejection::MissingSignature => "missing_signature",
            Rejection::BadSignature => "bad_signature",
            Rejection::BadMerchant => "bad_merchant",
        }
    }
}

/// Errors returned by order storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "full")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The order was modified by another writer since it was loaded.
    #[error("concurrent modification of order {0}")]
    Conflict(OrderId),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors returned while reconciling a verified callback or applying a
/// side-channel transition.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("invalid amount: {0:?}")]
    InvalidAmount(Option<String>),

    #[error("amount mismatch: order {order_id} expects {expected}, callback carried {received}")]
    AmountMismatch {
        order_id: OrderId,
        expected: Decimal,
        received: Decimal,
    },

    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),

    #[error("ticket {ticket_id} cannot be redeemed while {status}")]
    TicketNotRedeemable {
        ticket_id: TicketId,
        status: TicketStatus,
    },

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("too many orders in flight, try again later")]
    Busy,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned while starting a checkout.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("checkout has no tickets")]
    EmptyOrder,

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("merchant key is not configured")]
    MissingMerchantKey,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid trusted source entry: {0}")]
    InvalidTrustedSource(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}
