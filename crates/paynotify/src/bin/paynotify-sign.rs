//! Compute the gateway signature for a field set.
//!
//! ```text
//! PASSPHRASE=... paynotify-sign merchant_id=10000100 amount=35.00 item_name="Village tour"
//! ```
//!
//! A `signature=...` argument is left out of the signed set and compared
//! against the computed value instead.

use paynotify::{canonical_string, sign, signatures_match, CallbackPayload};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut payload = CallbackPayload::new();
    for arg in std::env::args().skip(1) {
        let Some((key, value)) = arg.split_once('=') else {
            eprintln!("usage: paynotify-sign key=value [key=value ...]");
            eprintln!("argument without '=': {arg}");
            std::process::exit(1);
        };
        payload.insert(key, value);
    }
    if payload.is_empty() {
        eprintln!("usage: paynotify-sign key=value [key=value ...]");
        std::process::exit(1);
    }

    let passphrase = std::env::var("PASSPHRASE").ok().filter(|p| !p.is_empty());
    if passphrase.is_none() {
        tracing::info!("PASSPHRASE not set, signing without one");
    }

    // The passphrase pair is appended after these fields; it is not printed.
    println!("canonical: {}", canonical_string(payload.signed_fields(), None));
    let computed = sign(payload.signed_fields(), passphrase.as_deref());
    println!("signature: {computed}");

    if let Some(received) = payload.signature() {
        if signatures_match(&computed, received) {
            println!("received signature matches");
        } else {
            println!("received signature DOES NOT match: {received}");
            std::process::exit(2);
        }
    }
}
