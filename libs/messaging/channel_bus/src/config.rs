//! Channel group configuration
//!
//! Groups are declared in TOML and resolved once, when a connector is built.
//! After that they are shared read-only (`Arc<ChannelGroupConfiguration>`) by
//! every channel of the group.
//!
//! ```toml
//! [groups.orders]
//! input_queue = "orders"
//! retry_address = "orders.retry"
//! poison_address = "orders.poison"
//! dead_letter_address = "orders.dead-letter"
//! max_attempts = 5
//!
//! [groups.notifications]
//! dispatch_only = true
//! synchronous = true
//! ```

use crate::ChannelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How a failed delivery comes back for another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Publish a copy with the bumped counter to the retry address
    #[default]
    ForwardCopy,
    /// Roll back and let the transport requeue the same message
    RedeliverInPlace,
}

/// Static configuration of one channel group
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelGroupConfiguration {
    /// Filled from the table key when loaded through `BusConfig`
    #[serde(default)]
    pub name: String,

    /// Group only sends; it never receives
    #[serde(default)]
    pub dispatch_only: bool,

    /// Sends complete before returning to the caller
    #[serde(default = "default_true")]
    pub synchronous: bool,

    /// Sends and acknowledgements are deferred to the unit of work commit
    #[serde(default = "default_true")]
    pub transactional: bool,

    /// Queue the group receives from
    pub input_queue: Option<String>,

    pub retry_address: Option<String>,

    pub poison_address: Option<String>,

    pub dead_letter_address: Option<String>,

    /// Attempts allowed before a message is poison
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl ChannelGroupConfiguration {
    /// Receiving group with the conventional `.retry`, `.poison` and `.dead-letter` addresses
    pub fn receiving(name: impl Into<String>, input_queue: impl Into<String>) -> Self {
        let name = name.into();
        let input_queue = input_queue.into();
        Self {
            retry_address: Some(format!("{}.retry", input_queue)),
            poison_address: Some(format!("{}.poison", input_queue)),
            dead_letter_address: Some(format!("{}.dead-letter", input_queue)),
            input_queue: Some(input_queue),
            name,
            dispatch_only: false,
            synchronous: true,
            transactional: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Send-only group
    pub fn dispatch_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatch_only: true,
            synchronous: true,
            transactional: false,
            input_queue: None,
            retry_address: None,
            poison_address: None,
            dead_letter_address: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Channels of this group are eligible for pooled dispatch
    pub fn is_poolable(&self) -> bool {
        self.dispatch_only && self.synchronous
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.name.trim().is_empty() {
            return Err(ChannelError::invalid_config("group name cannot be empty"));
        }
        if self.max_attempts == 0 {
            return Err(ChannelError::invalid_config(format!(
                "group '{}': max_attempts must be at least 1",
                self.name
            )));
        }
        if self.dispatch_only {
            return Ok(());
        }

        let required = [
            ("input_queue", &self.input_queue),
            ("poison_address", &self.poison_address),
            ("dead_letter_address", &self.dead_letter_address),
        ];
        for (field, value) in required {
            if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                return Err(ChannelError::invalid_config(format!(
                    "receiving group '{}' requires {}",
                    self.name, field
                )));
            }
        }
        if self.retry_policy == RetryPolicy::ForwardCopy && self.retry_address.is_none() {
            return Err(ChannelError::invalid_config(format!(
                "group '{}' forwards retries but has no retry_address",
                self.name
            )));
        }

        Ok(())
    }
}

/// Top-level bus configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default)]
    pub groups: BTreeMap<String, ChannelGroupConfiguration>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl BusConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, ChannelError> {
        let mut config: BusConfig = toml::from_str(toml_str)
            .map_err(|e| ChannelError::invalid_config(format!("failed to parse TOML: {}", e)))?;
        for (name, group) in config.groups.iter_mut() {
            if group.name.is_empty() {
                group.name = name.clone();
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ChannelError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String, ChannelError> {
        toml::to_string_pretty(self)
            .map_err(|e| ChannelError::invalid_config(format!("failed to serialize TOML: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        for (key, group) in &self.groups {
            if &group.name != key {
                return Err(ChannelError::invalid_config(format!(
                    "group '{}' is declared under key '{}'",
                    group.name, key
                )));
            }
            group.validate()?;
        }
        self.reconnect.validate()
    }

    /// Validated, shareable group configurations
    pub fn channel_groups(&self) -> Result<Vec<Arc<ChannelGroupConfiguration>>, ChannelError> {
        self.validate()?;
        Ok(self.groups.values().cloned().map(Arc::new).collect())
    }
}

/// Backoff used by the receive loop while a transport is unreachable
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up; 0 retries forever
    pub max_retries: u32,

    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,

    pub backoff_multiplier: f64,

    #[serde(with = "duration_ms")]
    pub max_retry_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Short delays for tests and low-latency deployments
    pub fn fast_recovery() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(10),
            backoff_multiplier: 1.5,
            max_retry_delay: Duration::from_millis(500),
        }
    }

    pub fn conservative() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_millis(500),
            backoff_multiplier: 2.5,
            max_retry_delay: Duration::from_secs(60),
        }
    }

    /// Delay before the given (1-based) retry
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.retry_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_retry_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ChannelError::invalid_config(
                "backoff_multiplier must be at least 1.0",
            ));
        }
        if self.retry_delay > self.max_retry_delay {
            return Err(ChannelError::invalid_config(
                "retry_delay cannot exceed max_retry_delay",
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [groups.orders]
        input_queue = "orders"
        retry_address = "orders.retry"
        poison_address = "orders.poison"
        dead_letter_address = "orders.dead-letter"
        max_attempts = 5

        [groups.notifications]
        dispatch_only = true

        [reconnect]
        retry_delay = 50
        max_retry_delay = 1000
    "#;

    #[test]
    fn test_parse_groups() {
        let config = BusConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();

        let orders = &config.groups["orders"];
        assert_eq!(orders.name, "orders");
        assert_eq!(orders.max_attempts, 5);
        assert!(orders.transactional);
        assert_eq!(orders.retry_policy, RetryPolicy::ForwardCopy);
        assert!(!orders.is_poolable());

        let notifications = &config.groups["notifications"];
        assert!(notifications.is_poolable());
        assert_eq!(notifications.max_attempts, DEFAULT_MAX_ATTEMPTS);

        assert_eq!(config.reconnect.retry_delay, Duration::from_millis(50));
        assert_eq!(config.reconnect.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_receiving_group_requires_poison_address() {
        let toml = r#"
            [groups.orders]
            input_queue = "orders"
            dead_letter_address = "orders.dead-letter"
            retry_address = "orders.retry"
        "#;

        let err = BusConfig::from_toml(toml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("poison_address"));
    }

    #[test]
    fn test_redeliver_in_place_needs_no_retry_address() {
        let mut group = ChannelGroupConfiguration::receiving("orders", "orders")
            .with_retry_policy(RetryPolicy::RedeliverInPlace);
        group.retry_address = None;
        assert!(group.validate().is_ok());

        group.retry_policy = RetryPolicy::ForwardCopy;
        assert!(group.validate().is_err());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let group = ChannelGroupConfiguration::dispatch_only("audit").with_max_attempts(0);
        assert!(matches!(group.validate(), Err(ChannelError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let reconnect = ReconnectConfig {
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_millis(350),
        };

        assert_eq!(reconnect.delay_for(1), Duration::from_millis(100));
        assert_eq!(reconnect.delay_for(2), Duration::from_millis(200));
        assert_eq!(reconnect.delay_for(3), Duration::from_millis(350));
        assert_eq!(reconnect.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_round_trip_through_file() {
        let config = BusConfig::from_toml(SAMPLE).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), config.to_toml().unwrap()).unwrap();

        let reloaded = BusConfig::from_file(file.path()).unwrap();
        assert_eq!(reloaded.groups, config.groups);
        assert_eq!(reloaded.channel_groups().unwrap().len(), 2);
    }
}
