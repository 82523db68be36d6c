//! Payment-gateway notification (ITN) verification and order reconciliation.
//!
//! A hosted payment gateway reports each payment outcome by posting a signed
//! field map back to the merchant. This crate decides whether such a callback
//! can be trusted and applies it to the referenced order exactly once.
//!
//! # Pipeline
//!
//! - **Canonicalizer** ([`canonical_string`]): field map + passphrase to one
//!   deterministic string
//! - **Verifier** ([`Verifier`]): source allow-list, MD5 signature, merchant id
//! - **Reconciler** ([`Reconciler`]): amount check, monotonic status machine,
//!   ticket propagation, per-order mutual exclusion
//!
//! [`NotificationProcessor`] chains the verifier and reconciler and reports a
//! serialisable [`Outcome`]. [`Checkout`] builds the outbound signed form.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use paynotify::{
//!     sign, CallbackPayload, InMemoryOrderStore, NotificationProcessor, Order, OrderStore,
//!     Outcome, Reconciler, Verifier, VerifierConfig,
//! };
//! use rust_decimal::Decimal;
//!
//! let store = Arc::new(InMemoryOrderStore::new());
//! let order = Order::new("guest@example.com", Decimal::new(3500, 2));
//! store.insert_order(&order).unwrap();
//!
//! let processor = NotificationProcessor::new(
//!     Verifier::new(VerifierConfig {
//!         merchant_id: "10000100".to_string(),
//!         passphrase: Some("jt7NOE43FZPn".to_string()),
//!         ..Default::default()
//!     }),
//!     Reconciler::new(store),
//! );
//!
//! let fields = [
//!     ("merchant_id", "10000100"),
//!     ("m_payment_id", order.id.as_str()),
//!     ("payment_status", "COMPLETE"),
//!     ("amount_gross", "35.00"),
//! ];
//! let mut payload: CallbackPayload = fields.iter().copied().collect();
//! payload.insert("signature", sign(fields.iter().copied(), Some("jt7NOE43FZPn")));
//!
//! let outcome = processor.process(&payload, "197.97.145.145");
//! assert!(matches!(outcome, Outcome::Applied { .. }));
//! ```

// Signing core
pub mod canonical;
pub mod constants;
pub mod error;
pub mod signature;
pub mod trusted;

// Callbacks
pub mod notification;
pub mod payload;
pub mod verifier;

// Orders
pub mod checkout;
pub mod order;
pub mod order_store;
pub mod reconcile;
#[cfg(feature = "full")]
pub mod sqlite_store;

pub mod config;
pub mod metrics;

// Re-exports
pub use canonical::canonical_string;
pub use checkout::{Checkout, CheckoutForm, CheckoutRequest, TicketLine};
pub use config::NotifyConfig;
pub use error::{CheckoutError, ConfigError, ReconcileError, Rejection, StoreError};
pub use notification::{NotificationProcessor, Outcome};
pub use order::{Order, OrderId, OrderStatus, PaymentStatus, Ticket, TicketId, TicketStatus};
pub use order_store::{InMemoryOrderStore, OrderStore};
pub use payload::CallbackPayload;
pub use reconcile::{Reconciler, Reconciliation, Transition};
pub use signature::{sign, signatures_match};
#[cfg(feature = "full")]
pub use sqlite_store::SqliteOrderStore;
pub use trusted::{IpNetwork, TrustedSource, TrustedSources};
pub use verifier::{VerifiedNotification, Verifier, VerifierConfig};
