//! Outbound side of the flow: create a Pending order and the signed form
//! that sends the customer to the gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::NotifyConfig;
use crate::constants::field;
use crate::error::CheckoutError;
use crate::order::{Order, Ticket};
use crate::order_store::OrderStore;
use crate::signature::sign;

#[derive(Debug, Clone)]
pub struct TicketLine {
    pub ticket_type: String,
    pub price: Decimal,
    pub valid_until: Option<DateTime<Utc>>,
}

impl TicketLine {
    pub fn new(ticket_type: impl Into<String>, price: Decimal) -> Self {
        Self {
            ticket_type: ticket_type.into(),
            price,
            valid_until: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub name_first: String,
    pub name_last: String,
    pub email_address: String,
    pub item_name: String,
    /// Defaults to `Order <id>`.
    pub item_description: Option<String>,
    pub tickets: Vec<TicketLine>,
}

/// Fields to post to `action_url`, in the order the gateway documents them,
/// with `signature` last.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutForm {
    pub action_url: String,
    pub fields: Vec<(String, String)>,
}

impl CheckoutForm {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub struct Checkout;

impl Checkout {
    /// Record a Pending order for the requested tickets and build its form.
    ///
    /// The order amount is the sum of the ticket prices.
    pub fn initiate(
        store: &dyn OrderStore,
        config: &NotifyConfig,
        request: CheckoutRequest,
    ) -> Result<CheckoutForm, CheckoutError> {
        let merchant_key = config
            .merchant_key
            .as_deref()
            .ok_or(CheckoutError::MissingMerchantKey)?;
        if request.tickets.is_empty() {
            return Err(CheckoutError::EmptyOrder);
        }
        for line in &request.tickets {
            if line.price.is_sign_negative() || line.price.normalize().scale() > 2 {
                return Err(CheckoutError::InvalidPrice(line.price.to_string()));
            }
        }

        let total = request
            .tickets
            .iter()
            .try_fold(Decimal::ZERO, |sum, line| sum.checked_add(line.price))
            .ok_or_else(|| CheckoutError::InvalidPrice("ticket total overflows".to_string()))?;
        let order = Order::new(request.email_address.clone(), total);
        let tickets: Vec<Ticket> = request
            .tickets
            .iter()
            .map(|line| {
                let mut ticket =
                    Ticket::new(order.id.clone(), line.ticket_type.clone(), line.price);
                ticket.valid_until = line.valid_until;
                ticket
            })
            .collect();
        store.insert_order_with_tickets(&order, &tickets)?;

        let description = request
            .item_description
            .unwrap_or_else(|| format!("Order {}", order.id));
        let url = |u: &Option<url::Url>| u.as_ref().map(|u| u.to_string()).unwrap_or_default();

        let mut fields: Vec<(String, String)> = [
            (field::MERCHANT_ID, config.merchant_id.clone()),
            (field::MERCHANT_KEY, merchant_key.to_string()),
            (field::RETURN_URL, url(&config.return_url)),
            (field::CANCEL_URL, url(&config.cancel_url)),
            (field::NOTIFY_URL, url(&config.notify_url)),
            (field::NAME_FIRST, request.name_first),
            (field::NAME_LAST, request.name_last),
            (field::EMAIL_ADDRESS, request.email_address),
            (field::REFERENCE, order.id.to_string()),
            (field::AMOUNT, order.amount_string()),
            (field::ITEM_NAME, request.item_name),
            (field::ITEM_DESCRIPTION, description),
        ]
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let signature = sign(fields.iter().map(|(k, v)| (k, v)), config.passphrase.as_deref());
        fields.push((field::SIGNATURE.to_string(), signature));

        tracing::info!(
            order_id = %order.id,
            amount = %order.amount,
            tickets = request.tickets.len(),
            "checkout initiated"
        );

        Ok(CheckoutForm {
            action_url: config.process_url(),
            fields,
        })
    }
}
