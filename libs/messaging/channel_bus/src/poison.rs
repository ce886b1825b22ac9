//! Failure handling for received messages
//!
//! A delivery that cannot be processed is either retried or moved to the
//! group's poison address once it has used up its attempts. Expired messages
//! skip both and go to the dead-letter address untouched.
//!
//! Before a message is poisoned, its full cause chain is written into headers,
//! outermost cause first:
//!
//! ```text
//! x-exception0-type        PaymentDeclined
//! x-exception0-message     payment declined
//! x-exception0-stacktrace  <captured backtrace, or empty>
//! x-exception1-type        GatewayTimeout
//! ...
//! ```

use crate::channel::{Channel, DeliveryContext};
use crate::config::RetryPolicy;
use crate::message::ChannelMessage;
use crate::ChannelError;
use chrono::Utc;
use std::backtrace::BacktraceStatus;
use std::error::Error as StdError;

pub const EXCEPTION_HEADER_PREFIX: &str = "x-exception";

/// Header key for one field of the cause at `depth` (0 = outermost)
pub fn exception_header(depth: usize, field: &str) -> String {
    format!("{}{}-{}", EXCEPTION_HEADER_PREFIX, depth, field)
}

/// One entry of an error's cause chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureFrame {
    pub type_name: String,
    pub message: String,
    pub stack_trace: String,
}

/// Flatten an error into its cause chain, outermost first
///
/// A processing error is unwrapped so the chain starts at the handler's own
/// error rather than at the `ChannelError` wrapper.
pub fn failure_chain(error: &ChannelError) -> Vec<FailureFrame> {
    match error {
        ChannelError::Processing(inner) => {
            let stack_trace = match inner.backtrace().status() {
                BacktraceStatus::Captured => inner.backtrace().to_string(),
                _ => String::new(),
            };
            inner
                .chain()
                .enumerate()
                .map(|(depth, cause)| FailureFrame {
                    type_name: type_name_of(cause),
                    message: cause.to_string(),
                    stack_trace: if depth == 0 {
                        stack_trace.clone()
                    } else {
                        String::new()
                    },
                })
                .collect()
        }
        other => {
            let root: &(dyn StdError + 'static) = other;
            std::iter::successors(Some(root), |e| (*e).source())
                .enumerate()
                .map(|(depth, cause)| FailureFrame {
                    type_name: if depth == 0 {
                        "ChannelError".to_string()
                    } else {
                        type_name_of(cause)
                    },
                    message: cause.to_string(),
                    stack_trace: String::new(),
                })
                .collect()
        }
    }
}

/// Best-effort type name taken from the leading identifier of `Debug` output
fn type_name_of(error: &(dyn StdError + 'static)) -> String {
    let debug = format!("{:?}", error);
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        "Error".to_string()
    } else {
        name
    }
}

/// Write `error`'s cause chain into the message headers
pub fn append_failure_headers(message: &mut ChannelMessage, error: &ChannelError) {
    for (depth, frame) in failure_chain(error).into_iter().enumerate() {
        message.set_header(exception_header(depth, "type"), frame.type_name);
        message.set_header(exception_header(depth, "message"), frame.message);
        message.set_header(exception_header(depth, "stacktrace"), frame.stack_trace);
    }
}

/// What happened to a failed or expired delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Expired before processing, moved to the dead-letter address
    DeadLettered,
    /// A copy was forwarded to the retry address
    Retried { attempt: u32 },
    /// The transaction was rolled back so the transport redelivers
    Redelivered { attempt: u32 },
    /// Attempts exhausted, moved to the poison address
    Poisoned { attempt: u32 },
}

/// Routes failed deliveries according to the group configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct PoisonMessageHandler;

impl PoisonMessageHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn is_expired(&self, delivery: &DeliveryContext) -> bool {
        delivery.message().is_expired(Utc::now())
    }

    /// Forward an expired message, unmodified, to the dead-letter address
    pub async fn handle_expired(
        &self,
        channel: &dyn Channel,
        delivery: &mut DeliveryContext,
    ) -> Result<FailureDisposition, ChannelError> {
        let configuration = delivery.configuration().clone();
        let address = configuration.dead_letter_address.as_deref().ok_or_else(|| {
            ChannelError::invalid_config(format!(
                "group '{}' has no dead-letter address",
                configuration.name
            ))
        })?;

        delivery.transaction().clear();
        forward(channel, delivery.received_message().clone(), address).await?;
        delivery.transaction().commit()?;

        tracing::warn!(
            message_id = %delivery.message().message_id(),
            address,
            "Expired message dead-lettered"
        );
        Ok(FailureDisposition::DeadLettered)
    }

    /// Retry or poison a message whose handler failed with `error`
    ///
    /// Whatever the handler registered with the unit of work is discarded
    /// first, so a failed attempt produces no side effects.
    pub async fn handle_failure(
        &self,
        channel: &dyn Channel,
        delivery: &mut DeliveryContext,
        error: &ChannelError,
    ) -> Result<FailureDisposition, ChannelError> {
        let configuration = delivery.configuration().clone();
        delivery.transaction().clear();
        let attempt = delivery.message_mut().increment_retry_count();

        if attempt < configuration.max_attempts {
            match configuration.retry_policy {
                RetryPolicy::ForwardCopy => {
                    let address = configuration.retry_address.as_deref().ok_or_else(|| {
                        ChannelError::invalid_config(format!(
                            "group '{}' has no retry address",
                            configuration.name
                        ))
                    })?;
                    forward(channel, delivery.message().clone(), address).await?;
                    delivery.transaction().commit()?;

                    tracing::info!(
                        message_id = %delivery.message().message_id(),
                        attempt,
                        max_attempts = configuration.max_attempts,
                        "Message forwarded for retry: {}",
                        error
                    );
                    Ok(FailureDisposition::Retried { attempt })
                }
                RetryPolicy::RedeliverInPlace => {
                    delivery.transaction().rollback()?;

                    tracing::info!(
                        message_id = %delivery.message().message_id(),
                        attempt,
                        max_attempts = configuration.max_attempts,
                        "Message rolled back for redelivery: {}",
                        error
                    );
                    Ok(FailureDisposition::Redelivered { attempt })
                }
            }
        } else {
            let address = configuration.poison_address.as_deref().ok_or_else(|| {
                ChannelError::invalid_config(format!(
                    "group '{}' has no poison address",
                    configuration.name
                ))
            })?;
            append_failure_headers(delivery.message_mut(), error);
            forward(channel, delivery.message().clone(), address).await?;
            delivery.transaction().commit()?;

            tracing::error!(
                message_id = %delivery.message().message_id(),
                attempt,
                address,
                "Message poisoned: {}",
                error
            );
            Ok(FailureDisposition::Poisoned { attempt })
        }
    }
}

async fn forward(
    channel: &dyn Channel,
    message: ChannelMessage,
    address: &str,
) -> Result<(), ChannelError> {
    channel
        .prepare_dispatch(Some(message), None)
        .with_destination(address)
        .send()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelGroupConfiguration;
    use crate::test_utils::CountingChannel;
    use crate::unit_of_work::{UnitOfWork, UnitOfWorkState};
    use chrono::Duration;
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("gateway timed out")]
    struct GatewayTimeout;

    #[derive(Debug, thiserror::Error)]
    #[error("payment declined")]
    struct PaymentDeclined {
        #[source]
        source: GatewayTimeout,
    }

    fn declined() -> ChannelError {
        ChannelError::processing(PaymentDeclined {
            source: GatewayTimeout,
        })
    }

    fn delivery(configuration: ChannelGroupConfiguration) -> DeliveryContext {
        DeliveryContext::new(
            ChannelMessage::new("OrderPlaced", b"{}".to_vec()),
            Arc::new(UnitOfWork::new()),
            Arc::new(configuration),
        )
    }

    fn orders() -> ChannelGroupConfiguration {
        ChannelGroupConfiguration::receiving("orders", "orders").with_max_attempts(2)
    }

    #[test]
    fn test_failure_chain_outermost_first() {
        let chain = failure_chain(&declined());

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].type_name, "PaymentDeclined");
        assert_eq!(chain[0].message, "payment declined");
        assert_eq!(chain[1].type_name, "GatewayTimeout");
        assert_eq!(chain[1].message, "gateway timed out");
        assert!(chain[1].stack_trace.is_empty());
    }

    #[test]
    fn test_failure_chain_of_transport_error() {
        let chain = failure_chain(&ChannelError::invalid_operation("nope"));

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].type_name, "ChannelError");
        assert_eq!(chain[0].message, "Invalid operation: nope");
    }

    #[test]
    fn test_failure_chain_follows_transport_source() {
        let error = ChannelError::connection_with_source("broker unreachable", GatewayTimeout);
        let chain = failure_chain(&error);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].type_name, "ChannelError");
        assert_eq!(chain[1].type_name, "GatewayTimeout");
        assert_eq!(chain[1].message, "gateway timed out");
    }

    #[test]
    fn test_type_name_falls_back_for_plain_messages() {
        let chain = failure_chain(&ChannelError::processing(anyhow::anyhow!("plain")));
        assert_eq!(chain[0].type_name, "Error");
        assert_eq!(chain[0].message, "plain");
    }

    #[tokio::test]
    async fn test_first_failure_forwards_copy_to_retry_address() {
        let channel = CountingChannel::new(orders());
        let probe = channel.probe();
        let mut delivery = delivery(orders());
        delivery.transaction().register(|| Ok(())).unwrap();

        let disposition = PoisonMessageHandler::new()
            .handle_failure(&channel, &mut delivery, &declined())
            .await
            .unwrap();

        assert_eq!(disposition, FailureDisposition::Retried { attempt: 1 });
        assert_eq!(delivery.transaction().state(), UnitOfWorkState::Committed);
        let sent = probe.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipients(), ["orders.retry".to_string()]);
        assert_eq!(sent[0].message().retry_count(), 1);
        assert!(sent[0].message().header(&exception_header(0, "type")).is_none());
    }

    #[tokio::test]
    async fn test_last_attempt_poisons_with_headers() {
        let channel = CountingChannel::new(orders());
        let probe = channel.probe();
        let mut delivery = delivery(orders());
        delivery.message_mut().increment_retry_count();

        let disposition = PoisonMessageHandler::new()
            .handle_failure(&channel, &mut delivery, &declined())
            .await
            .unwrap();

        assert_eq!(disposition, FailureDisposition::Poisoned { attempt: 2 });
        let poisoned = probe.sent()[0].clone();
        assert_eq!(poisoned.recipients(), ["orders.poison".to_string()]);
        let message = poisoned.message();
        assert_eq!(message.retry_count(), 2);
        assert_eq!(message.header("x-exception0-type"), Some("PaymentDeclined"));
        assert_eq!(message.header("x-exception0-message"), Some("payment declined"));
        assert_eq!(message.header("x-exception1-type"), Some("GatewayTimeout"));
        assert_eq!(message.header("x-exception1-message"), Some("gateway timed out"));
        assert!(message.header("x-exception1-stacktrace").is_some());
        assert!(message.header("x-exception2-type").is_none());
    }

    #[tokio::test]
    async fn test_redeliver_in_place_rolls_back() {
        let config = orders().with_retry_policy(RetryPolicy::RedeliverInPlace);
        let channel = CountingChannel::new(config.clone());
        let probe = channel.probe();
        let mut delivery = delivery(config);

        let disposition = PoisonMessageHandler::new()
            .handle_failure(&channel, &mut delivery, &declined())
            .await
            .unwrap();

        assert_eq!(disposition, FailureDisposition::Redelivered { attempt: 1 });
        assert_eq!(delivery.transaction().state(), UnitOfWorkState::RolledBack);
        assert_eq!(delivery.message().retry_count(), 1);
        assert_eq!(probe.sends(), 0);
    }

    #[tokio::test]
    async fn test_expired_message_dead_lettered_verbatim() {
        let channel = CountingChannel::new(orders());
        let probe = channel.probe();
        let mut delivery = DeliveryContext::new(
            ChannelMessage::new("OrderPlaced", Vec::new())
                .with_expiration(Utc::now() - Duration::seconds(5)),
            Arc::new(UnitOfWork::new()),
            Arc::new(orders()),
        );
        // stamped on the way in by an audit layer
        delivery.message_mut().mark_dispatched(Utc::now());
        let handler = PoisonMessageHandler::new();
        assert!(handler.is_expired(&delivery));

        let disposition = handler.handle_expired(&channel, &mut delivery).await.unwrap();

        assert_eq!(disposition, FailureDisposition::DeadLettered);
        let sent = probe.sent();
        assert_eq!(sent[0].recipients(), ["orders.dead-letter".to_string()]);
        assert_eq!(sent[0].message(), delivery.received_message());
        assert!(sent[0].message().dispatched().is_none());
        assert_eq!(sent[0].message().retry_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_poison_address_is_config_error() {
        let mut config = orders().with_max_attempts(1);
        config.poison_address = None;
        let channel = CountingChannel::new(config.clone());
        let mut delivery = delivery(config);

        let err = PoisonMessageHandler::new()
            .handle_failure(&channel, &mut delivery, &declined())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfig(_)));
    }
}
