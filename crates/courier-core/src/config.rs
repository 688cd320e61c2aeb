// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Courier Core configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of partitions hosted by a broker
    pub partition_count: u32,
    /// Age after which a pending cross-partition command is resent
    pub subscription_timeout: Duration,
    /// Period of both pending checkers
    pub subscription_check_interval: Duration,
    /// Period of the message TTL sweep
    pub message_ttl_check_interval: Duration,
    /// Maximum number of expired messages deleted per sweep
    pub message_ttl_batch_size: usize,
    /// Bound of each partition's command inbox
    pub command_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition_count: 3,
            subscription_timeout: Duration::from_secs(10),
            subscription_check_interval: Duration::from_secs(30),
            message_ttl_check_interval: Duration::from_secs(60),
            message_ttl_batch_size: 100,
            command_queue_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `COURIER_PARTITION_COUNT`: Number of partitions (default: 3)
    /// - `COURIER_SUBSCRIPTION_TIMEOUT_MS`: Pending command timeout (default: 10000)
    /// - `COURIER_SUBSCRIPTION_CHECK_INTERVAL_MS`: Pending checker period (default: 30000)
    /// - `COURIER_MESSAGE_TTL_CHECK_INTERVAL_MS`: TTL sweep period (default: 60000)
    /// - `COURIER_MESSAGE_TTL_BATCH_SIZE`: Expired messages deleted per sweep (default: 100)
    /// - `COURIER_COMMAND_QUEUE_CAPACITY`: Partition inbox bound (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let partition_count: u32 = parse_positive_into(
            "COURIER_PARTITION_COUNT",
            u64::from(defaults.partition_count),
        )?;

        let subscription_timeout = Duration::from_millis(parse_positive(
            "COURIER_SUBSCRIPTION_TIMEOUT_MS",
            defaults.subscription_timeout.as_millis() as u64,
        )?);

        let subscription_check_interval = Duration::from_millis(parse_positive(
            "COURIER_SUBSCRIPTION_CHECK_INTERVAL_MS",
            defaults.subscription_check_interval.as_millis() as u64,
        )?);

        let message_ttl_check_interval = Duration::from_millis(parse_positive(
            "COURIER_MESSAGE_TTL_CHECK_INTERVAL_MS",
            defaults.message_ttl_check_interval.as_millis() as u64,
        )?);

        let message_ttl_batch_size: usize = parse_positive_into(
            "COURIER_MESSAGE_TTL_BATCH_SIZE",
            defaults.message_ttl_batch_size as u64,
        )?;

        let command_queue_capacity: usize = parse_positive_into(
            "COURIER_COMMAND_QUEUE_CAPACITY",
            defaults.command_queue_capacity as u64,
        )?;

        let config = Self {
            partition_count,
            subscription_timeout,
            subscription_check_interval,
            message_ttl_check_interval,
            message_ttl_batch_size,
            command_queue_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that [`Config::from_env`] cannot rule out by parsing, for
    /// configs built in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_count == 0 {
            return Err(ConfigError::Invalid(
                "COURIER_PARTITION_COUNT",
                "must be greater than zero",
            ));
        }
        if self.partition_count > u32::from(crate::key::MAX_PARTITION_ID) {
            return Err(ConfigError::Invalid(
                "COURIER_PARTITION_COUNT",
                "must not exceed 4095",
            ));
        }

        let durations = [
            ("COURIER_SUBSCRIPTION_TIMEOUT_MS", self.subscription_timeout),
            ("COURIER_SUBSCRIPTION_CHECK_INTERVAL_MS", self.subscription_check_interval),
            ("COURIER_MESSAGE_TTL_CHECK_INTERVAL_MS", self.message_ttl_check_interval),
        ];
        for (var, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(var, "must be greater than zero"));
            }
        }

        if self.message_ttl_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "COURIER_MESSAGE_TTL_BATCH_SIZE",
                "must be greater than zero",
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "COURIER_COMMAND_QUEUE_CAPACITY",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_positive(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value: u64 = match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a positive integer"))?,
        Err(_) => default,
    };

    if value == 0 {
        return Err(ConfigError::Invalid(var, "must be greater than zero"));
    }

    Ok(value)
}

/// [`parse_positive`] narrowed to `T`, rejecting values that do not fit.
fn parse_positive_into<T: TryFrom<u64>>(var: &'static str, default: u64) -> Result<T, ConfigError> {
    T::try_from(parse_positive(var, default)?)
        .map_err(|_| ConfigError::Invalid(var, "value out of range"))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
