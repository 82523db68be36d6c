//! Orders, their dependent tickets, and the status machines both follow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Order reference. Sent to the gateway as `m_payment_id` and echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TicketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TicketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// No automated transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Failed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Whether moving from `self` to `next` is a forward step.
    ///
    /// Pending → Paid | Failed | Cancelled, Paid → Refunded. Staying put is
    /// not a transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (
                OrderStatus::Pending,
                OrderStatus::Paid | OrderStatus::Failed | OrderStatus::Cancelled
            ) | (OrderStatus::Paid, OrderStatus::Refunded)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(StoreError::Corrupt(format!("unknown order status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Active,
    Used,
    Expired,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Active => "active",
            TicketStatus::Used => "used",
            TicketStatus::Expired => "expired",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// Used and Expired tickets are never changed by a payment outcome.
    pub fn is_settled(&self) -> bool {
        matches!(self, TicketStatus::Used | TicketStatus::Expired)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TicketStatus::Active),
            "used" => Ok(TicketStatus::Used),
            "expired" => Ok(TicketStatus::Expired),
            "cancelled" => Ok(TicketStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown ticket status {other:?}"))),
        }
    }
}

/// Payment outcome reported by the gateway's `payment_status` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Complete,
    Failed,
    Cancelled,
    /// `PENDING`, blank, or anything we do not recognise.
    Other(String),
}

impl PaymentStatus {
    /// Case-insensitive parse. Never fails.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "complete" => PaymentStatus::Complete,
            "failed" => PaymentStatus::Failed,
            "cancelled" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Other(raw.trim().to_string()),
        }
    }

    pub fn target(&self) -> OrderStatus {
        match self {
            PaymentStatus::Complete => OrderStatus::Paid,
            PaymentStatus::Failed => OrderStatus::Failed,
            PaymentStatus::Cancelled => OrderStatus::Cancelled,
            PaymentStatus::Other(_) => OrderStatus::Pending,
        }
    }

    /// Whether the raw value was one the gateway documents.
    pub fn is_recognized(&self) -> bool {
        match self {
            PaymentStatus::Other(raw) => raw.eq_ignore_ascii_case("pending"),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub customer_email: String,
    /// Two fraction digits. Fixed at creation.
    pub amount: Decimal,
    pub status: OrderStatus,
    pub gateway_payment_id: Option<String>,
    /// Signature of the last verified notification applied to this order.
    pub last_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refund_reason: Option<String>,
    /// Bumped on every save; stores reject writes from a stale copy.
    pub version: u64,
}

impl Order {
    /// A new Pending order. The amount is rounded to two fraction digits.
    pub fn new(customer_email: impl Into<String>, amount: Decimal) -> Self {
        let now = Utc::now();
        let mut amount = amount.round_dp(2);
        amount.rescale(2);
        Self {
            id: OrderId::generate(),
            customer_email: customer_email.into(),
            amount,
            status: OrderStatus::Pending,
            gateway_payment_id: None,
            last_signature: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            refund_reason: None,
            version: 0,
        }
    }

    pub fn with_id(mut self, id: OrderId) -> Self {
        self.id = id;
        self
    }

    /// The amount as the gateway expects it, e.g. `35.00`.
    pub fn amount_string(&self) -> String {
        format!("{:.2}", self.amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub order_id: OrderId,
    pub ticket_type: String,
    pub price: Decimal,
    pub status: TicketStatus,
    pub valid_until: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn new(order_id: OrderId, ticket_type: impl Into<String>, price: Decimal) -> Self {
        Self {
            id: TicketId::generate(),
            order_id,
            ticket_type: ticket_type.into(),
            price,
            status: TicketStatus::Active,
            valid_until: None,
            used_at: None,
        }
    }

    pub fn with_valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }

    /// Admission check: active, order paid, not past `valid_until`.
    pub fn is_valid(&self, order_status: OrderStatus, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Active
            && order_status == OrderStatus::Paid
            && self.valid_until.map_or(true, |until| now < until)
    }
}
