use paynotify::{
    sign, CallbackPayload, InMemoryOrderStore, NotificationProcessor, Order, OrderStatus,
    OrderStore, Outcome, Reconciler, SqliteOrderStore, Ticket, TicketStatus, Verifier,
    VerifierConfig,
};
use rust_decimal::Decimal;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 16;

fn payload(order: &Order, status: &str) -> CallbackPayload {
    let fields = [
        ("merchant_id", "10000100"),
        ("m_payment_id", order.id.as_str()),
        ("pf_payment_id", "1089250"),
        ("payment_status", status),
        ("amount_gross", "35.00"),
    ];
    let mut payload: CallbackPayload = fields.iter().copied().collect();
    payload.insert("signature", sign(fields.iter().copied(), None));
    payload
}

fn processor(store: Arc<dyn OrderStore>) -> NotificationProcessor {
    NotificationProcessor::new(
        Verifier::new(VerifierConfig {
            merchant_id: "10000100".to_string(),
            ..Default::default()
        }),
        Reconciler::new(store),
    )
}

fn seed(store: &dyn OrderStore) -> Order {
    let order = Order::new("guest@example.com", Decimal::new(3500, 2));
    store.insert_order(&order).unwrap();
    store
        .insert_ticket(&Ticket::new(order.id.clone(), "adult", Decimal::new(3500, 2)))
        .unwrap();
    order
}

/// Fire the same callback from many threads at once and count the results.
fn race(p: Arc<NotificationProcessor>, payloads: Vec<CallbackPayload>) -> Vec<Outcome> {
    let barrier = Arc::new(Barrier::new(payloads.len()));
    let handles: Vec<_> = payloads
        .into_iter()
        .map(|payload| {
            let p = Arc::clone(&p);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                p.process(&payload, "127.0.0.1")
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn duplicate_completes_apply_once() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let order = seed(store.as_ref());
    let p = Arc::new(processor(store.clone()));

    let outcomes = race(p, vec![payload(&order, "COMPLETE"); THREADS]);
    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1);
    assert!(outcomes.iter().all(Outcome::is_accepted));

    let stored = store.order(&order.id).unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Paid);
    assert_eq!(stored.version, 1);
}

#[test]
fn complete_racing_cancel_settles_on_one() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let order = seed(store.as_ref());
    let p = Arc::new(processor(store.clone()));

    let payloads = (0..THREADS)
        .map(|i| payload(&order, if i % 2 == 0 { "COMPLETE" } else { "CANCELLED" }))
        .collect();
    let outcomes = race(p, payloads);
    let applied: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            Outcome::Applied { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(applied.len(), 1);

    let stored = store.order(&order.id).unwrap().unwrap();
    assert_eq!(stored.status, applied[0]);
    let expected_ticket = match stored.status {
        OrderStatus::Paid => TicketStatus::Active,
        _ => TicketStatus::Cancelled,
    };
    let tickets = store.tickets_for(&order.id).unwrap();
    assert_eq!(tickets[0].status, expected_ticket);
}

#[test]
fn separate_processes_sharing_a_database_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("orders.db");
    let path = path.to_str().unwrap();

    let seed_store = SqliteOrderStore::open(path).unwrap();
    let order = seed(&seed_store);

    // Each processor has its own lock map, as separate worker processes would.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store: Arc<dyn OrderStore> = Arc::new(SqliteOrderStore::open(path).unwrap());
            let p = processor(store);
            let payload = payload(&order, "COMPLETE");
            thread::spawn(move || p.process(&payload, "127.0.0.1"))
        })
        .collect();
    let outcomes: Vec<Outcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.iter().all(Outcome::is_accepted));
    assert_eq!(seed_store.order(&order.id).unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn cleanup_task_reclaims_idle_locks() {
    let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
    let order = seed(store.as_ref());
    let p = processor(store);

    assert!(p.process(&payload(&order, "COMPLETE"), "127.0.0.1").is_accepted());
    assert_eq!(p.reconciler().lock_count(), 1);

    // The first interval tick fires immediately.
    let handle = p.reconciler().start_lock_cleanup();
    for _ in 0..50 {
        if p.reconciler().lock_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.abort();
    assert_eq!(p.reconciler().lock_count(), 0);
}
