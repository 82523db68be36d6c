use std::sync::Arc;

use paynotify::{
    sign, CallbackPayload, Checkout, CheckoutForm, CheckoutRequest, NotificationProcessor,
    NotifyConfig, OrderId, OrderStatus, OrderStore, Outcome, Rejection, SqliteOrderStore,
    TicketLine, TicketStatus,
};
use rust_decimal::Decimal;

const GATEWAY_IP: &str = "197.97.145.150";

fn config(db_path: &str) -> NotifyConfig {
    let db_path = db_path.to_string();
    NotifyConfig::from_lookup(move |key| {
        let v = match key {
            "MERCHANT_ID" => "10000100",
            "MERCHANT_KEY" => "46f0cd694581a",
            "PASSPHRASE" => "jt7NOE43FZPn",
            "TRUSTED_SOURCES" => "197.97.145.144/28,41.74.179.194",
            "NOTIFY_URL" => "https://shop.example.com/payfast/notify",
            "ORDER_DB_PATH" => db_path.as_str(),
            _ => return None,
        };
        Some(v.to_string())
    })
    .unwrap()
}

fn checkout(store: &dyn OrderStore, cfg: &NotifyConfig) -> CheckoutForm {
    Checkout::initiate(
        store,
        cfg,
        CheckoutRequest {
            name_first: "Thandi".to_string(),
            name_last: "Mokoena".to_string(),
            email_address: "thandi@example.com".to_string(),
            item_name: "Village tour & lunch".to_string(),
            item_description: None,
            tickets: vec![
                TicketLine::new("adult", Decimal::new(2000, 2)),
                TicketLine::new("child", Decimal::new(1500, 2)),
            ],
        },
    )
    .unwrap()
}

/// What the gateway posts back for a checkout form.
fn callback(form: &CheckoutForm, status: &str, amount: &str) -> CallbackPayload {
    let fields = vec![
        ("m_payment_id", form.get("m_payment_id").unwrap().to_string()),
        ("pf_payment_id", "1089250".to_string()),
        ("payment_status", status.to_string()),
        ("item_name", form.get("item_name").unwrap().to_string()),
        ("item_description", String::new()),
        ("amount_gross", amount.to_string()),
        ("amount_fee", "-0.81".to_string()),
        ("amount_net", "34.19".to_string()),
        ("name_first", "Thandi".to_string()),
        ("email_address", "thandi@example.com".to_string()),
        ("merchant_id", "10000100".to_string()),
    ];
    let signature = sign(fields.iter().map(|(k, v)| (*k, v.as_str())), Some("jt7NOE43FZPn"));
    let mut payload: CallbackPayload = fields.into_iter().collect();
    payload.insert("signature", signature);
    payload
}

fn processor(store: Arc<dyn OrderStore>, cfg: &NotifyConfig) -> NotificationProcessor {
    NotificationProcessor::from_config(cfg, store)
}

#[test]
fn checkout_then_complete_then_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    let cfg = config(path.to_str().unwrap());
    let store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::open(&cfg.order_db_path).unwrap());

    let form = checkout(store.as_ref(), &cfg);
    let order_id = OrderId::from(form.get("m_payment_id").unwrap());
    let p = processor(store.clone(), &cfg);

    let paid = callback(&form, "COMPLETE", "35.00");
    assert_eq!(
        p.process(&paid, GATEWAY_IP),
        Outcome::Applied {
            order_id: order_id.clone(),
            from: OrderStatus::Pending,
            to: OrderStatus::Paid,
        }
    );
    let after_first = store.order(&order_id).unwrap().unwrap();
    assert_eq!(after_first.gateway_payment_id.as_deref(), Some("1089250"));
    assert_eq!(after_first.last_signature.as_deref(), paid.signature());

    // Gateways retry until acknowledged.
    assert_eq!(
        p.process(&paid, GATEWAY_IP),
        Outcome::Unchanged {
            order_id: order_id.clone(),
            status: OrderStatus::Paid,
        }
    );
    assert_eq!(store.order(&order_id).unwrap().unwrap(), after_first);

    let tickets = store.tickets_for(&order_id).unwrap();
    assert_eq!(tickets.len(), 2);
    assert!(tickets.iter().all(|t| t.status == TicketStatus::Active));
}

#[test]
fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    let cfg = config(path.to_str().unwrap());

    let form = {
        let store: Arc<dyn OrderStore> =
            Arc::new(SqliteOrderStore::open(&cfg.order_db_path).unwrap());
        let form = checkout(store.as_ref(), &cfg);
        let p = processor(store, &cfg);
        assert!(p.process(&callback(&form, "COMPLETE", "35.00"), GATEWAY_IP).is_accepted());
        form
    };

    let p = NotificationProcessor::open(&cfg).unwrap();
    let outcome = p.process(&callback(&form, "CANCELLED", "35.00"), GATEWAY_IP);
    assert_eq!(outcome.as_str(), "unchanged");

    let store = SqliteOrderStore::open(&cfg.order_db_path).unwrap();
    let order_id = OrderId::from(form.get("m_payment_id").unwrap());
    assert_eq!(store.order(&order_id).unwrap().unwrap().status, OrderStatus::Paid);
}

#[test]
fn redeemed_ticket_survives_cancel_callback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    let cfg = config(path.to_str().unwrap());
    let store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::open(&cfg.order_db_path).unwrap());

    let form = checkout(store.as_ref(), &cfg);
    let order_id = OrderId::from(form.get("m_payment_id").unwrap());
    let p = processor(store.clone(), &cfg);
    p.process(&callback(&form, "COMPLETE", "35.00"), GATEWAY_IP);

    let first = store.tickets_for(&order_id).unwrap()[0].id.clone();
    p.reconciler().redeem_ticket(&first).unwrap();

    p.process(&callback(&form, "CANCELLED", "35.00"), GATEWAY_IP);
    let tickets = store.tickets_for(&order_id).unwrap();
    assert_eq!(tickets[0].status, TicketStatus::Used);
    assert_eq!(store.order(&order_id).unwrap().unwrap().status, OrderStatus::Paid);
}

#[test]
fn tampered_and_foreign_callbacks_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    let cfg = config(path.to_str().unwrap());
    let store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::open(&cfg.order_db_path).unwrap());
    let form = checkout(store.as_ref(), &cfg);
    let p = processor(store.clone(), &cfg);

    let mut tampered = callback(&form, "COMPLETE", "35.00");
    tampered.insert("amount_gross", "0.01");
    assert_eq!(
        p.process(&tampered, GATEWAY_IP),
        Outcome::Rejected {
            reason: Rejection::BadSignature
        }
    );

    assert_eq!(
        p.process(&callback(&form, "COMPLETE", "35.00"), "203.0.113.7"),
        Outcome::Rejected {
            reason: Rejection::UntrustedSource
        }
    );

    let mut unsigned = callback(&form, "COMPLETE", "35.00");
    unsigned.insert("signature", "");
    assert_eq!(
        p.process(&unsigned, "41.74.179.194"),
        Outcome::Rejected {
            reason: Rejection::MissingSignature
        }
    );

    let order_id = OrderId::from(form.get("m_payment_id").unwrap());
    assert_eq!(store.order(&order_id).unwrap().unwrap().status, OrderStatus::Pending);
}

#[test]
fn underpayment_is_refused_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    let cfg = config(path.to_str().unwrap());
    let store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::open(&cfg.order_db_path).unwrap());
    let form = checkout(store.as_ref(), &cfg);
    let order_id = OrderId::from(form.get("m_payment_id").unwrap());
    let before = store.order(&order_id).unwrap().unwrap();

    let p = processor(store.clone(), &cfg);
    assert_eq!(
        p.process(&callback(&form, "COMPLETE", "34.99"), GATEWAY_IP),
        Outcome::AmountMismatch {
            order_id: order_id.clone()
        }
    );
    assert_eq!(store.order(&order_id).unwrap().unwrap(), before);
}
