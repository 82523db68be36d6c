use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::order::{Order, OrderId, OrderStatus, Ticket, TicketId, TicketStatus};
use crate::order_store::{check_ownership, OrderStore};

/// Persistent order store backed by SQLite. Survives restarts, and its
/// version check holds across processes sharing the same file.
pub struct SqliteOrderStore {
    conn: Mutex<Connection>,
}

impl SqliteOrderStore {
    /// Open (or create) an order database at the given path.
    ///
    /// On Unix the file is restricted to 0600: it holds customer emails and
    /// gateway payment references.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                customer_email TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                gateway_payment_id TEXT,
                last_signature TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                paid_at TEXT,
                refund_reason TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                ticket_type TEXT NOT NULL,
                price TEXT NOT NULL,
                status TEXT NOT NULL,
                valid_until TEXT,
                used_at TEXT
            );
            CREATE TABLE IF NOT EXISTS order_tickets (
                order_id TEXT NOT NULL REFERENCES orders(id),
                ticket_id TEXT NOT NULL UNIQUE REFERENCES tickets(id)
            );
            CREATE INDEX IF NOT EXISTS idx_order_tickets_order ON order_tickets(order_id);
            CREATE INDEX IF NOT EXISTS idx_orders_gateway_payment ON orders(gateway_payment_id);",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set order database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("order store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_decimal(raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::Corrupt(format!("decimal {raw:?}: {e}")))
}

/// Unique or primary-key violations become [`StoreError::Duplicate`].
fn insert_error(e: rusqlite::Error, what: String) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Duplicate(what);
        }
    }
    StoreError::Sqlite(e)
}

struct OrderRow {
    id: String,
    customer_email: String,
    amount: String,
    status: String,
    gateway_payment_id: Option<String>,
    last_signature: Option<String>,
    created_at: String,
    updated_at: String,
    paid_at: Option<String>,
    refund_reason: Option<String>,
    version: i64,
}

impl OrderRow {
    const COLUMNS: &'static str = "id, customer_email, amount, status, gateway_payment_id, \
        last_signature, created_at, updated_at, paid_at, refund_reason, version";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            customer_email: row.get(1)?,
            amount: row.get(2)?,
            status: row.get(3)?,
            gateway_payment_id: row.get(4)?,
            last_signature: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            paid_at: row.get(8)?,
            refund_reason: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn into_order(self) -> Result<Order, StoreError> {
        Ok(Order {
            id: OrderId::from(self.id),
            customer_email: self.customer_email,
            amount: parse_decimal(&self.amount)?,
            status: self.status.parse::<OrderStatus>()?,
            gateway_payment_id: self.gateway_payment_id,
            last_signature: self.last_signature,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            paid_at: parse_opt_ts(self.paid_at)?,
            refund_reason: self.refund_reason,
            version: u64::try_from(self.version)
                .map_err(|_| StoreError::Corrupt(format!("negative version {}", self.version)))?,
        })
    }
}

struct TicketRow {
    id: String,
    order_id: String,
    ticket_type: String,
    price: String,
    status: String,
    valid_until: Option<String>,
    used_at: Option<String>,
}

impl TicketRow {
    const SELECT: &'static str = "SELECT t.id, ot.order_id, t.ticket_type, t.price, t.status, \
        t.valid_until, t.used_at FROM tickets t JOIN order_tickets ot ON ot.ticket_id = t.id";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            order_id: row.get(1)?,
            ticket_type: row.get(2)?,
            price: row.get(3)?,
            status: row.get(4)?,
            valid_until: row.get(5)?,
            used_at: row.get(6)?,
        })
    }

    fn into_ticket(self) -> Result<Ticket, StoreError> {
        Ok(Ticket {
            id: TicketId::from(self.id),
            order_id: OrderId::from(self.order_id),
            ticket_type: self.ticket_type,
            price: parse_decimal(&self.price)?,
            status: self.status.parse::<TicketStatus>()?,
            valid_until: parse_opt_ts(self.valid_until)?,
            used_at: parse_opt_ts(self.used_at)?,
        })
    }
}

fn insert_order_row(conn: &Connection, order: &Order) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO orders (id, customer_email, amount, status, gateway_payment_id,
            last_signature, created_at, updated_at, paid_at, refund_reason, version)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            order.id.as_str(),
            order.customer_email,
            order.amount.to_string(),
            order.status.as_str(),
            order.gateway_payment_id,
            order.last_signature,
            ts(&order.created_at),
            ts(&order.updated_at),
            order.paid_at.as_ref().map(ts),
            order.refund_reason,
            i64::try_from(order.version).unwrap_or(i64::MAX),
        ],
    )
    .map_err(|e| insert_error(e, format!("order {}", order.id)))?;
    Ok(())
}

/// Insert a ticket and its order link. The order row must already exist.
fn insert_ticket_row(conn: &Connection, ticket: &Ticket) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tickets (id, ticket_type, price, status, valid_until, used_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            ticket.id.as_str(),
            ticket.ticket_type,
            ticket.price.to_string(),
            ticket.status.as_str(),
            ticket.valid_until.as_ref().map(ts),
            ticket.used_at.as_ref().map(ts),
        ],
    )
    .map_err(|e| insert_error(e, format!("ticket {}", ticket.id)))?;
    conn.execute(
        "INSERT INTO order_tickets (order_id, ticket_id) VALUES (?1, ?2)",
        params![ticket.order_id.as_str(), ticket.id.as_str()],
    )?;
    Ok(())
}

impl OrderStore for SqliteOrderStore {
    fn insert_order(&self, order: &Order) -> Result<(), StoreError> {
        insert_order_row(&self.conn(), order)
    }

    fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let order_exists: bool = tx
            .query_row(
                "SELECT 1 FROM orders WHERE id = ?1",
                params![ticket.order_id.as_str()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !order_exists {
            return Err(StoreError::Corrupt(format!(
                "ticket {} references unknown order {}",
                ticket.id, ticket.order_id
            )));
        }

        insert_ticket_row(&tx, ticket)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_order_with_tickets(
        &self,
        order: &Order,
        tickets: &[Ticket],
    ) -> Result<(), StoreError> {
        check_ownership(order, tickets)?;

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_order_row(&tx, order)?;
        for ticket in tickets {
            // An error drops the transaction, which rolls the order back too.
            insert_ticket_row(&tx, ticket)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn order(&self, id: &OrderId) -> Result<Option<Order>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM orders WHERE id = ?1", OrderRow::COLUMNS),
                params![id.as_str()],
                OrderRow::from_row,
            )
            .optional()?;
        row.map(OrderRow::into_order).transpose()
    }

    fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("{} WHERE t.id = ?1", TicketRow::SELECT),
                params![id.as_str()],
                TicketRow::from_row,
            )
            .optional()?;
        row.map(TicketRow::into_ticket).transpose()
    }

    fn tickets_for(&self, id: &OrderId) -> Result<Vec<Ticket>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE ot.order_id = ?1 ORDER BY ot.rowid",
            TicketRow::SELECT
        ))?;
        let rows = stmt
            .query_map(params![id.as_str()], TicketRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TicketRow::into_ticket).collect()
    }

    fn save(&self, order: &Order, tickets: &[Ticket]) -> Result<u64, StoreError> {
        check_ownership(order, tickets)?;

        let version = i64::try_from(order.version)
            .map_err(|_| StoreError::Corrupt(format!("version overflow on {}", order.id)))?;

        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front, so the version check and
        // the writes below cannot interleave with another process.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE orders SET status = ?1, gateway_payment_id = ?2, last_signature = ?3,
                updated_at = ?4, paid_at = ?5, refund_reason = ?6, version = version + 1
            WHERE id = ?7 AND version = ?8",
            params![
                order.status.as_str(),
                order.gateway_payment_id,
                order.last_signature,
                ts(&order.updated_at),
                order.paid_at.as_ref().map(ts),
                order.refund_reason,
                order.id.as_str(),
                version,
            ],
        )?;
        if updated == 0 {
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM orders WHERE id = ?1",
                    params![order.id.as_str()],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            return Err(if exists {
                StoreError::Conflict(order.id.clone())
            } else {
                StoreError::Corrupt(format!("save of unknown order {}", order.id))
            });
        }

        for ticket in tickets {
            let n = tx.execute(
                "UPDATE tickets SET status = ?1, valid_until = ?2, used_at = ?3
                WHERE id = ?4
                  AND id IN (SELECT ticket_id FROM order_tickets WHERE order_id = ?5)",
                params![
                    ticket.status.as_str(),
                    ticket.valid_until.as_ref().map(ts),
                    ticket.used_at.as_ref().map(ts),
                    ticket.id.as_str(),
                    order.id.as_str(),
                ],
            )?;
            if n == 0 {
                // Dropping the transaction rolls the order update back.
                return Err(StoreError::Corrupt(format!(
                    "save of unknown ticket {}",
                    ticket.id
                )));
            }
        }

        tx.commit()?;
        Ok(order.version + 1)
    }
}
