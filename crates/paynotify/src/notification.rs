//! The inbound pipeline: verify, then reconcile, then report one [`Outcome`].
//!
//! The caller owns the transport. It hands over the decoded form fields and
//! the peer address, and maps the outcome onto its own response.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::NotifyConfig;
use crate::error::{ReconcileError, Rejection};
use crate::metrics;
use crate::order::{OrderId, OrderStatus};
use crate::order_store::OrderStore;
use crate::payload::CallbackPayload;
use crate::reconcile::{Reconciler, Transition};
use crate::verifier::Verifier;

/// Result of processing one callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The order moved to a new status.
    Applied {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    /// Accepted, but the order's status did not change.
    Unchanged {
        order_id: OrderId,
        status: OrderStatus,
    },
    /// Refused before any field was trusted.
    Rejected { reason: Rejection },
    NotFound { reference: String },
    InvalidAmount { received: Option<String> },
    AmountMismatch { order_id: OrderId },
    /// Storage or capacity failure. The gateway should retry.
    Failed { error: String },
}

impl Outcome {
    /// Stable label used for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied { .. } => "applied",
            Outcome::Unchanged { .. } => "unchanged",
            Outcome::Rejected { .. } => "rejected",
            Outcome::NotFound { .. } => "not_found",
            Outcome::InvalidAmount { .. } => "invalid_amount",
            Outcome::AmountMismatch { .. } => "amount_mismatch",
            Outcome::Failed { .. } => "failed",
        }
    }

    /// Whether the gateway should consider the callback delivered.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Applied { .. } | Outcome::Unchanged { .. })
    }
}

pub struct NotificationProcessor {
    verifier: Verifier,
    reconciler: Reconciler,
}

impl NotificationProcessor {
    pub fn new(verifier: Verifier, reconciler: Reconciler) -> Self {
        Self {
            verifier,
            reconciler,
        }
    }

    /// Wire a verifier and reconciler from loaded configuration.
    pub fn from_config(config: &NotifyConfig, store: Arc<dyn OrderStore>) -> Self {
        Self::new(
            Verifier::new(config.verifier_config()),
            Reconciler::new(store).with_amount_tolerance(config.amount_tolerance),
        )
    }

    /// Open the SQLite order database at `ORDER_DB_PATH` and wire a processor on it.
    #[cfg(feature = "full")]
    pub fn open(config: &NotifyConfig) -> Result<Self, crate::error::StoreError> {
        let store = crate::sqlite_store::SqliteOrderStore::open(&config.order_db_path)?;
        Ok(Self::from_config(config, Arc::new(store)))
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Process a callback received from `source`.
    pub fn process(&self, payload: &CallbackPayload, source: &str) -> Outcome {
        let verified = match self.verifier.verify(payload, source) {
            Ok(v) => v,
            Err(reason) => {
                metrics::REJECTIONS.with_label_values(&[reason.as_str()]).inc();
                return Outcome::Rejected { reason };
            }
        };

        let start = Instant::now();
        let outcome = match self.reconciler.reconcile(&verified) {
            Ok(done) => match done.transition {
                Transition::Applied { from, to } => Outcome::Applied {
                    order_id: done.order.id,
                    from,
                    to,
                },
                Transition::Unchanged { status } => Outcome::Unchanged {
                    order_id: done.order.id,
                    status,
                },
            },
            Err(ReconcileError::OrderNotFound(reference)) => {
                tracing::warn!(reference = %reference, "callback for unknown order");
                Outcome::NotFound { reference }
            }
            Err(ReconcileError::InvalidAmount(received)) => {
                tracing::warn!(received = ?received, "callback with invalid amount");
                Outcome::InvalidAmount { received }
            }
            Err(ReconcileError::AmountMismatch { order_id, .. }) => {
                Outcome::AmountMismatch { order_id }
            }
            Err(e) => {
                tracing::error!(error = %e, "reconciliation failed");
                Outcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let result = outcome.as_str();
        metrics::RECONCILE_RESULTS.with_label_values(&[result]).inc();
        metrics::RECONCILE_LATENCY
            .with_label_values(&[result])
            .observe(start.elapsed().as_secs_f64());
        outcome
    }
}
