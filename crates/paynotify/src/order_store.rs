use std::collections::HashSet;

use dashmap::DashMap;

use crate::error::StoreError;
use crate::order::{Order, OrderId, Ticket, TicketId};

/// Trait for order storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`). Orders are never
/// deleted; tickets are linked to exactly one order by id.
pub trait OrderStore: Send + Sync {
    /// Record a new order. Fails with [`StoreError::Duplicate`] if the id exists.
    fn insert_order(&self, order: &Order) -> Result<(), StoreError>;

    /// Record a new ticket and link it to `ticket.order_id`, which must exist.
    fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Record a new order together with its tickets. Either everything is
    /// written or nothing is.
    fn insert_order_with_tickets(&self, order: &Order, tickets: &[Ticket])
        -> Result<(), StoreError>;

    fn order(&self, id: &OrderId) -> Result<Option<Order>, StoreError>;

    fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>, StoreError>;

    /// Tickets linked to an order, in insertion order.
    fn tickets_for(&self, id: &OrderId) -> Result<Vec<Ticket>, StoreError>;

    /// Atomically write an order together with (a subset of) its tickets.
    ///
    /// `order.version` must equal the stored version, otherwise nothing is
    /// written and [`StoreError::Conflict`] is returned. On success the stored
    /// version is incremented and returned. The amount is never rewritten.
    fn save(&self, order: &Order, tickets: &[Ticket]) -> Result<u64, StoreError>;
}

pub(crate) fn check_ownership(order: &Order, tickets: &[Ticket]) -> Result<(), StoreError> {
    match tickets.iter().find(|t| t.order_id != order.id) {
        Some(stray) => Err(StoreError::Corrupt(format!(
            "ticket {} belongs to order {}, not {}",
            stray.id, stray.order_id, order.id
        ))),
        None => Ok(()),
    }
}

/// In-memory order store backed by DashMap. Fast but lost on restart.
pub struct InMemoryOrderStore {
    orders: DashMap<OrderId, Order>,
    tickets: DashMap<TicketId, Ticket>,
    order_tickets: DashMap<OrderId, Vec<TicketId>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            tickets: DashMap::new(),
            order_tickets: DashMap::new(),
        }
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.orders.entry(order.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("order {}", order.id))),
            Entry::Vacant(v) => {
                v.insert(order.clone());
                Ok(())
            }
        }
    }

    fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        if !self.orders.contains_key(&ticket.order_id) {
            return Err(StoreError::Corrupt(format!(
                "ticket {} references unknown order {}",
                ticket.id, ticket.order_id
            )));
        }
        match self.tickets.entry(ticket.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("ticket {}", ticket.id))),
            Entry::Vacant(v) => {
                v.insert(ticket.clone());
                self.order_tickets
                    .entry(ticket.order_id.clone())
                    .or_default()
                    .push(ticket.id.clone());
                Ok(())
            }
        }
    }

    fn insert_order_with_tickets(
        &self,
        order: &Order,
        tickets: &[Ticket],
    ) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        check_ownership(order, tickets)?;
        let mut seen = HashSet::new();
        for ticket in tickets {
            if !seen.insert(&ticket.id) || self.tickets.contains_key(&ticket.id) {
                return Err(StoreError::Duplicate(format!("ticket {}", ticket.id)));
            }
        }

        // The vacant entry keeps the order invisible until its tickets are in.
        match self.orders.entry(order.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("order {}", order.id))),
            Entry::Vacant(v) => {
                for ticket in tickets {
                    self.tickets.insert(ticket.id.clone(), ticket.clone());
                }
                self.order_tickets
                    .insert(order.id.clone(), tickets.iter().map(|t| t.id.clone()).collect());
                v.insert(order.clone());
                Ok(())
            }
        }
    }

    fn order(&self, id: &OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(id).map(|o| o.clone()))
    }

    fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tickets.get(id).map(|t| t.clone()))
    }

    fn tickets_for(&self, id: &OrderId) -> Result<Vec<Ticket>, StoreError> {
        let ids = self
            .order_tickets
            .get(id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter()
            .map(|tid| {
                self.tickets
                    .get(tid)
                    .map(|t| t.clone())
                    .ok_or_else(|| StoreError::Corrupt(format!("dangling ticket link {tid}")))
            })
            .collect()
    }

    fn save(&self, order: &Order, tickets: &[Ticket]) -> Result<u64, StoreError> {
        check_ownership(order, tickets)?;

        // Holding the order's shard lock serialises saves for the same order.
        let mut stored = self
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| StoreError::Corrupt(format!("save of unknown order {}", order.id)))?;
        if stored.version != order.version {
            return Err(StoreError::Conflict(order.id.clone()));
        }

        for ticket in tickets {
            if !self.tickets.contains_key(&ticket.id) {
                return Err(StoreError::Corrupt(format!("save of unknown ticket {}", ticket.id)));
            }
        }
        for ticket in tickets {
            self.tickets.insert(ticket.id.clone(), ticket.clone());
        }

        let amount = stored.amount;
        let next = order.version + 1;
        *stored = Order {
            amount,
            version: next,
            ..order.clone()
        };
        Ok(next)
    }
}
