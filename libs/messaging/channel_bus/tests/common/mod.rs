//! Shared helpers for channel bus integration tests

#![allow(dead_code)]

use std::time::Duration;
use tracing::Level;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

#[derive(Debug, thiserror::Error)]
#[error("gateway timed out")]
pub struct GatewayTimeout;

#[derive(Debug, thiserror::Error)]
#[error("payment declined")]
pub struct PaymentDeclined {
    #[source]
    pub source: GatewayTimeout,
}

pub fn payment_declined() -> channel_bus::ChannelError {
    channel_bus::ChannelError::processing(PaymentDeclined {
        source: GatewayTimeout,
    })
}
