//! Applies verified payment outcomes to orders and their tickets.
//!
//! Every operation that reads an order and writes it back runs under a
//! per-order mutex, and the store rejects saves from a stale copy, so two
//! callbacks for the same order can never both apply a transition.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::constants::MAX_ORDER_LOCKS;
use crate::error::{ReconcileError, StoreError};
use crate::order::{
    Order, OrderId, OrderStatus, PaymentStatus, Ticket, TicketId, TicketStatus,
};
use crate::order_store::OrderStore;
use crate::verifier::VerifiedNotification;

/// Attempts at load-decide-save before a version conflict is reported.
const MAX_SAVE_ATTEMPTS: usize = 3;

/// What a reconciliation did to the order's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Applied { from: OrderStatus, to: OrderStatus },
    Unchanged { status: OrderStatus },
}

/// The order and tickets as stored after a reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub order: Order,
    pub tickets: Vec<Ticket>,
    pub transition: Transition,
}

pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    /// Per-order mutex for atomic load+decide+save.
    order_locks: Arc<DashMap<OrderId, Arc<Mutex<()>>>>,
    /// Largest accepted difference between stored and received amounts.
    amount_tolerance: Decimal,
}

impl Reconciler {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self {
            store,
            order_locks: Arc::new(DashMap::new()),
            amount_tolerance: Decimal::ZERO,
        }
    }

    /// Accept callbacks whose amount differs from the order by at most
    /// `tolerance`. Negative values are treated as zero.
    pub fn with_amount_tolerance(mut self, tolerance: Decimal) -> Self {
        self.amount_tolerance = tolerance.max(Decimal::ZERO);
        self
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Apply a verified callback to the order it references.
    ///
    /// Replaying a callback converges on the same state and reports
    /// [`Transition::Unchanged`].
    pub fn reconcile(
        &self,
        notification: &VerifiedNotification,
    ) -> Result<Reconciliation, ReconcileError> {
        let reference = notification
            .reference()
            .ok_or_else(|| ReconcileError::OrderNotFound(String::new()))?;
        let order_id = OrderId::from(reference);

        let lock = self.order_lock(&order_id)?;
        let _guard = acquire(&lock);

        let payment = PaymentStatus::parse(notification.payment_status());
        if !payment.is_recognized() {
            tracing::warn!(
                order_id = %order_id,
                payment_status = notification.payment_status(),
                "unrecognized payment status, treating as pending"
            );
        }
        let target = payment.target();

        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let order = self
                .store
                .order(&order_id)?
                .ok_or_else(|| ReconcileError::OrderNotFound(reference.to_string()))?;

            let received = parse_amount(notification.gross_amount())?;
            // Decimal subtraction panics on overflow; an unrepresentable
            // difference is a mismatch.
            let within_tolerance = received
                .checked_sub(order.amount)
                .is_some_and(|diff| diff.abs() <= self.amount_tolerance);
            if !within_tolerance {
                tracing::warn!(
                    order_id = %order_id,
                    expected = %order.amount,
                    received = %received,
                    "callback amount does not match order"
                );
                return Err(ReconcileError::AmountMismatch {
                    order_id,
                    expected: order.amount,
                    received,
                });
            }

            let tickets = self.store.tickets_for(&order_id)?;
            match self.apply(order, tickets, target, notification) {
                Err(ReconcileError::Store(StoreError::Conflict(_))) if attempt < MAX_SAVE_ATTEMPTS => {
                    tracing::debug!(order_id = %order_id, attempt, "order changed underneath us, retrying");
                }
                other => return other,
            }
        }
        Err(StoreError::Conflict(order_id).into())
    }

    fn apply(
        &self,
        mut order: Order,
        mut tickets: Vec<Ticket>,
        target: OrderStatus,
        notification: &VerifiedNotification,
    ) -> Result<Reconciliation, ReconcileError> {
        let from = order.status;
        let consumed = tickets.iter().any(|t| t.status == TicketStatus::Used);
        let applies = from.can_transition_to(target)
            && target != OrderStatus::Refunded
            && !(consumed && matches!(target, OrderStatus::Failed | OrderStatus::Cancelled));

        let now = Utc::now();
        let payment_id = notification
            .gateway_payment_id()
            .map(str::to_string)
            .or_else(|| order.gateway_payment_id.clone());
        let signature = Some(notification.signature().to_string());

        if applies {
            order.status = target;
            order.gateway_payment_id = payment_id;
            order.last_signature = signature;
            order.updated_at = now;
            if target == OrderStatus::Paid {
                order.paid_at = Some(now);
            }
            let changed = propagate(&mut tickets, target);
            order.version = self.store.save(&order, &changed)?;

            tracing::info!(
                order_id = %order.id,
                from = %from,
                to = %target,
                tickets = changed.len(),
                "order transition applied"
            );
            return Ok(Reconciliation {
                order,
                tickets,
                transition: Transition::Applied { from, to: target },
            });
        }

        // Pending stays pending but keeps the gateway's latest reference.
        if from == OrderStatus::Pending
            && target == OrderStatus::Pending
            && (order.gateway_payment_id != payment_id || order.last_signature != signature)
        {
            order.gateway_payment_id = payment_id;
            order.last_signature = signature;
            order.updated_at = now;
            order.version = self.store.save(&order, &[])?;
        } else if from != target {
            tracing::info!(
                order_id = %order.id,
                status = %from,
                requested = %target,
                consumed,
                "callback ignored, order already settled"
            );
        }

        Ok(Reconciliation {
            transition: Transition::Unchanged { status: order.status },
            order,
            tickets,
        })
    }

    /// Admit a ticket: Active on a Paid order and not past `valid_until`
    /// becomes Used.
    pub fn redeem_ticket(&self, ticket_id: &TicketId) -> Result<Ticket, ReconcileError> {
        let order_id = self
            .store
            .ticket(ticket_id)?
            .ok_or_else(|| ReconcileError::TicketNotFound(ticket_id.clone()))?
            .order_id;

        let lock = self.order_lock(&order_id)?;
        let _guard = acquire(&lock);

        let mut order = self
            .store
            .order(&order_id)?
            .ok_or_else(|| ReconcileError::OrderNotFound(order_id.to_string()))?;
        let mut ticket = self
            .store
            .ticket(ticket_id)?
            .ok_or_else(|| ReconcileError::TicketNotFound(ticket_id.clone()))?;

        let now = Utc::now();
        if !ticket.is_valid(order.status, now) {
            return Err(ReconcileError::TicketNotRedeemable {
                ticket_id: ticket_id.clone(),
                status: ticket.status,
            });
        }

        ticket.status = TicketStatus::Used;
        ticket.used_at = Some(now);
        order.updated_at = now;
        // Saving the order too bumps its version, so a concurrent cancel that
        // loaded the tickets before this redemption fails its save.
        self.store.save(&order, std::slice::from_ref(&ticket))?;

        tracing::info!(order_id = %order_id, ticket_id = %ticket_id, "ticket redeemed");
        Ok(ticket)
    }

    /// Refund a Paid order and cancel its Active tickets. Refunding an
    /// already refunded order changes nothing.
    pub fn refund(
        &self,
        order_id: &OrderId,
        reason: &str,
    ) -> Result<Reconciliation, ReconcileError> {
        let lock = self.order_lock(order_id)?;
        let _guard = acquire(&lock);

        let mut order = self
            .store
            .order(order_id)?
            .ok_or_else(|| ReconcileError::OrderNotFound(order_id.to_string()))?;
        let mut tickets = self.store.tickets_for(order_id)?;

        let from = order.status;
        if from == OrderStatus::Refunded {
            return Ok(Reconciliation {
                transition: Transition::Unchanged { status: from },
                order,
                tickets,
            });
        }
        if !from.can_transition_to(OrderStatus::Refunded) {
            return Err(ReconcileError::InvalidTransition {
                order_id: order_id.clone(),
                from,
                to: OrderStatus::Refunded,
            });
        }

        order.status = OrderStatus::Refunded;
        order.refund_reason = Some(reason.to_string());
        order.updated_at = Utc::now();
        let changed = propagate(&mut tickets, OrderStatus::Refunded);
        order.version = self.store.save(&order, &changed)?;

        tracing::info!(order_id = %order_id, tickets = changed.len(), "order refunded");
        Ok(Reconciliation {
            order,
            tickets,
            transition: Transition::Applied {
                from,
                to: OrderStatus::Refunded,
            },
        })
    }

    /// Get or create a per-order mutex.
    /// Note: the len() + contains_key() check is not atomic with entry(), so the
    /// cap can be overshot by up to the number of concurrent callers.
    fn order_lock(&self, order_id: &OrderId) -> Result<Arc<Mutex<()>>, ReconcileError> {
        if self.order_locks.len() >= MAX_ORDER_LOCKS && !self.order_locks.contains_key(order_id) {
            tracing::warn!(order_id = %order_id, "order lock map full");
            return Err(ReconcileError::Busy);
        }
        Ok(self
            .order_locks
            .entry(order_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Number of per-order locks currently tracked.
    pub fn lock_count(&self) -> usize {
        self.order_locks.len()
    }

    /// Drop locks nobody holds or is waiting on. Returns how many were removed.
    pub fn purge_idle_locks(&self) -> usize {
        purge_idle(&self.order_locks)
    }

    /// Start a background task that purges idle order locks every 60 seconds.
    #[cfg(feature = "full")]
    pub fn start_lock_cleanup(&self) -> tokio::task::JoinHandle<()> {
        let order_locks = Arc::clone(&self.order_locks);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                crate::constants::LOCK_CLEANUP_INTERVAL_SECS,
            ));
            loop {
                interval.tick().await;
                let removed = purge_idle(&order_locks);
                if removed > 0 {
                    tracing::info!(removed, "cleaned up idle order locks");
                }
            }
        })
    }
}

/// Both checks matter: a lock with no outside clones may still be mid-acquire
/// by a caller that cloned it between our count and the removal.
fn purge_idle(locks: &DashMap<OrderId, Arc<Mutex<()>>>) -> usize {
    let before = locks.len();
    locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    before.saturating_sub(locks.len())
}

fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("order lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn parse_amount(raw: Option<&str>) -> Result<Decimal, ReconcileError> {
    let raw = raw.ok_or(ReconcileError::InvalidAmount(None))?;
    Decimal::from_str(raw.trim()).map_err(|_| ReconcileError::InvalidAmount(Some(raw.to_string())))
}

/// Move tickets along with their order. Returns the tickets that changed.
fn propagate(tickets: &mut [Ticket], target: OrderStatus) -> Vec<Ticket> {
    let mut changed = Vec::new();
    for ticket in tickets.iter_mut() {
        let next = match target {
            OrderStatus::Paid if !ticket.status.is_settled() => TicketStatus::Active,
            OrderStatus::Failed | OrderStatus::Cancelled | OrderStatus::Refunded
                if ticket.status == TicketStatus::Active =>
            {
                TicketStatus::Cancelled
            }
            _ => continue,
        };
        if ticket.status != next {
            ticket.status = next;
            changed.push(ticket.clone());
        }
    }
    changed
}
